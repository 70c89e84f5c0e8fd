//! Remote candidates that arrive before the remote description.

use std::collections::VecDeque;

use murmur_media::PeerConnection;
use murmur_shared::protocol::IceCandidate;
use tracing::{debug, warn};

/// Holds remote candidates until the remote description is applied, then
/// hands them back in arrival order. After that every candidate passes
/// straight through.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    remote_ready: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate when it can be applied now, or keeps it.
    pub fn offer(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_ready {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// The remote description is in place: drain everything held so far.
    pub fn mark_remote_ready(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Apply candidates in order. A failure is logged and skipped so it never
/// blocks the rest. Returns how many were applied.
pub async fn apply_candidates(
    pc: &dyn PeerConnection,
    candidates: impl IntoIterator<Item = IceCandidate>,
) -> usize {
    let mut applied = 0;
    for candidate in candidates {
        match pc.add_ice_candidate(candidate.clone()).await {
            Ok(()) => {
                applied += 1;
                debug!(candidate = %candidate.candidate, "remote candidate applied");
            }
            Err(e) => {
                warn!(candidate = %candidate.candidate, error = %e, "skipping remote candidate");
            }
        }
    }
    applied
}
