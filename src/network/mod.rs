pub mod relay;
pub mod signaling;
pub mod transport;
pub mod webrtc;
