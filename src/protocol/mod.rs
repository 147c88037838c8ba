pub mod frame;
pub mod signal;
