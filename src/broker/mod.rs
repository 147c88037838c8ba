pub mod auth;
pub mod relay;
pub mod signal;
