use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Capture permission denied")]
    PermissionDenied,

    #[error("No alternate camera available")]
    NoAlternateCamera,

    #[error("Invalid pipeline state: {0}")]
    InvalidState(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Session description error: {0}")]
    Sdp(String),

    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    #[error("Peer connection closed")]
    Closed,
}

impl MediaError {
    /// Capture failures the caller should surface as "media unavailable".
    pub fn is_capture_failure(&self) -> bool {
        matches!(
            self,
            MediaError::DeviceUnavailable(_) | MediaError::PermissionDenied
        )
    }
}
