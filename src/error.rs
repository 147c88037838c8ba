use thiserror::Error;

use crate::protocol::frame::FrameError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Tunnel stopped")]
    Stopped,
}

pub type AppResult<T> = Result<T, AppError>;
