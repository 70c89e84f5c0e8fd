use murmur_media::MediaError;
use murmur_shared::CallId;
use murmur_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallError {
    /// Capture permission was denied or no suitable device exists.
    #[error("Media unavailable: {0}")]
    MediaUnavailable(MediaError),

    #[error("User is busy")]
    Busy,

    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    #[error("No answer before the ring timeout")]
    SignalingTimeout,

    /// Logged and recovered from; never ends a call on its own.
    #[error("ICE candidate could not be applied: {0}")]
    IceApplyFailure(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No alternate camera available")]
    NoAlternateCamera,

    #[error("Invalid call state: {0}")]
    InvalidState(String),

    #[error("Signaling store error: {0}")]
    Store(#[from] StoreError),

    /// The session task is gone.
    #[error("Call manager has shut down")]
    ManagerClosed,
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            e if e.is_capture_failure() => CallError::MediaUnavailable(e),
            MediaError::NoAlternateCamera => CallError::NoAlternateCamera,
            MediaError::InvalidState(msg) => CallError::InvalidState(msg),
            MediaError::Candidate(msg) => CallError::IceApplyFailure(msg),
            other => CallError::ConnectionFailed(other.to_string()),
        }
    }
}
