use thiserror::Error;

pub type Result<T> = std::result::Result<T, McuError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum McuError {
    /// No matching response arrived in time. The channel is flagged as hung.
    #[error("timed out waiting for mcu response")]
    Timeout,

    #[error("invalid mcu payload: {0}")]
    InvalidPayload(&'static str),

    #[error("mcu transport failed: {0}")]
    Transport(String),
}
