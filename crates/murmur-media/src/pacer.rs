//! Sender-side enforcement of [`EncodingParameters`].
//!
//! Frames arrive already encoded, so the pacer can only drop them. It runs
//! on the media clock (the sum of frame durations), not on wall time, which
//! keeps its decisions independent of scheduling jitter in the pump.

use std::time::Duration;

use crate::profile::EncodingParameters;
use crate::track::MediaFrame;

#[derive(Debug)]
pub struct FramePacer {
    params: Option<EncodingParameters>,
    clock: Duration,
    next_frame_at: Duration,
    /// Token bucket in bits, capped at one second of the bitrate ceiling.
    budget_bits: f64,
}

impl FramePacer {
    pub fn new(params: Option<EncodingParameters>) -> Self {
        let mut pacer = Self {
            params: None,
            clock: Duration::ZERO,
            next_frame_at: Duration::ZERO,
            budget_bits: 0.0,
        };
        pacer.retune(params);
        pacer
    }

    pub fn params(&self) -> Option<EncodingParameters> {
        self.params
    }

    /// Switch to new ceilings. The bucket starts full again.
    pub fn retune(&mut self, params: Option<EncodingParameters>) {
        self.params = params;
        self.next_frame_at = self.clock;
        self.budget_bits = params.map_or(0.0, |p| bits_per_second(&p));
    }

    /// Whether `frame` fits under the current ceilings. Every frame advances
    /// the media clock, sent or not.
    pub fn admit(&mut self, frame: &MediaFrame) -> bool {
        let start = self.clock;
        self.clock += frame.duration;

        let Some(params) = self.params else {
            return true;
        };

        let rate = bits_per_second(&params);
        self.budget_bits = (self.budget_bits + rate * frame.duration.as_secs_f64()).min(rate);

        if let Some(fps) = params.max_framerate.filter(|fps| *fps > 0) {
            let interval = Duration::from_secs(1) / fps;
            if start < self.next_frame_at {
                return false;
            }
            // keep the cadence unless the source stalled for a whole interval
            self.next_frame_at = if start - self.next_frame_at < interval {
                self.next_frame_at + interval
            } else {
                start + interval
            };
        }

        let bits = frame.data.len() as f64 * 8.0;
        if bits > self.budget_bits {
            return false;
        }
        self.budget_bits -= bits;
        true
    }
}

fn bits_per_second(params: &EncodingParameters) -> f64 {
    f64::from(params.max_bitrate_kbps) * 1000.0
}
