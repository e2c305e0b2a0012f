use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToneRelayError {
    #[error("Unsupported character {0:?}")]
    UnsupportedCharacter(char),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Microphone unavailable: {0}")]
    MicrophoneUnavailable(String),

    #[error("Monitor mode is restricted to the privileged device")]
    MonitorNotPermitted,

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("FFT error: {0}")]
    FftError(String),

    #[error("Invalid input size")]
    InvalidInputSize,

    #[error("Tone channel closed")]
    ChannelClosed,

    #[error("Tone sink error: {0}")]
    SinkError(String),
}

pub type Result<T> = std::result::Result<T, ToneRelayError>;
