//! Connection statistics.
//!
//! The peer connection hands out cumulative counters ([`RawStats`]); the
//! sampler turns two consecutive readings into rates.

use std::time::Instant;

use murmur_shared::ConnectionMode;
use serde::Serialize;

/// Cumulative counters read from the transport.
#[derive(Debug, Clone)]
pub struct RawStats {
    pub taken_at: Instant,
    /// Seconds, from the selected candidate pair or remote inbound report.
    pub round_trip_time: Option<f64>,
    /// Received and lost as reported by the remote for our outbound streams,
    /// so loss is measured in one direction.
    pub packets_received: u64,
    pub packets_lost: i64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Decoded inbound video frames, when the transport reports them.
    pub frames_received: Option<u64>,
    pub path: ConnectionMode,
}

impl RawStats {
    pub fn empty(path: ConnectionMode) -> Self {
        Self {
            taken_at: Instant::now(),
            round_trip_time: None,
            packets_received: 0,
            packets_lost: 0,
            bytes_received: 0,
            bytes_sent: 0,
            frames_received: None,
            path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallStats {
    pub rtt_ms: Option<f64>,
    pub packet_loss_pct: f64,
    pub framerate: Option<f64>,
    pub inbound_kbps: f64,
    pub outbound_kbps: f64,
    pub path: ConnectionMode,
}

#[derive(Debug, Default)]
pub struct StatsSampler {
    previous: Option<RawStats>,
}

impl StatsSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive rates against the previous reading. The first reading has no
    /// baseline, so its rates are zero and its loss is cumulative.
    pub fn sample(&mut self, raw: RawStats) -> CallStats {
        let rtt_ms = raw.round_trip_time.map(|secs| secs * 1000.0);

        let stats = match &self.previous {
            Some(prev) => {
                let elapsed = raw.taken_at.saturating_duration_since(prev.taken_at).as_secs_f64();
                let received = raw.packets_received.saturating_sub(prev.packets_received);
                let lost = (raw.packets_lost - prev.packets_lost).max(0) as u64;

                let rate = |now: u64, before: u64| {
                    if elapsed > 0.0 {
                        now.saturating_sub(before) as f64 * 8.0 / 1000.0 / elapsed
                    } else {
                        0.0
                    }
                };
                let framerate = match (raw.frames_received, prev.frames_received) {
                    (Some(now), Some(before)) if elapsed > 0.0 => {
                        Some(now.saturating_sub(before) as f64 / elapsed)
                    }
                    _ => None,
                };

                CallStats {
                    rtt_ms,
                    packet_loss_pct: loss_pct(received, lost),
                    framerate,
                    inbound_kbps: rate(raw.bytes_received, prev.bytes_received),
                    outbound_kbps: rate(raw.bytes_sent, prev.bytes_sent),
                    path: raw.path,
                }
            }
            None => CallStats {
                rtt_ms,
                packet_loss_pct: loss_pct(raw.packets_received, raw.packets_lost.max(0) as u64),
                framerate: None,
                inbound_kbps: 0.0,
                outbound_kbps: 0.0,
                path: raw.path,
            },
        };

        self.previous = Some(raw);
        stats
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

fn loss_pct(received: u64, lost: u64) -> f64 {
    let total = received + lost;
    if total == 0 {
        0.0
    } else {
        lost as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn raw(at: Instant, received: u64, lost: i64, bytes_in: u64, bytes_out: u64, frames: Option<u64>) -> RawStats {
        RawStats {
            taken_at: at,
            round_trip_time: Some(0.042),
            packets_received: received,
            packets_lost: lost,
            bytes_received: bytes_in,
            bytes_sent: bytes_out,
            frames_received: frames,
            path: ConnectionMode::Direct,
        }
    }

    #[test]
    fn test_first_sample_has_no_rates() {
        let mut sampler = StatsSampler::new();
        let stats = sampler.sample(raw(Instant::now(), 90, 10, 5000, 5000, Some(30)));

        assert_eq!(stats.inbound_kbps, 0.0);
        assert_eq!(stats.framerate, None);
        assert!((stats.packet_loss_pct - 10.0).abs() < 1e-9);
        assert!((stats.rtt_ms.unwrap() - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_rates_from_deltas() {
        let mut sampler = StatsSampler::new();
        let t0 = Instant::now();
        sampler.sample(raw(t0, 100, 0, 0, 0, Some(0)));
        let stats = sampler.sample(raw(
            t0 + Duration::from_secs(1),
            198,
            2,
            125_000,
            250_000,
            Some(30),
        ));

        assert!((stats.inbound_kbps - 1000.0).abs() < 1e-6);
        assert!((stats.outbound_kbps - 2000.0).abs() < 1e-6);
        assert!((stats.packet_loss_pct - 2.0).abs() < 1e-9);
        assert_eq!(stats.framerate, Some(30.0));
    }

    #[test]
    fn test_counter_reset_does_not_go_negative() {
        let mut sampler = StatsSampler::new();
        let t0 = Instant::now();
        sampler.sample(raw(t0, 500, 50, 9000, 9000, None));
        let stats = sampler.sample(raw(t0 + Duration::from_secs(1), 10, 0, 100, 100, None));

        assert_eq!(stats.packet_loss_pct, 0.0);
        assert_eq!(stats.inbound_kbps, 0.0);
        assert_eq!(stats.framerate, None);
    }
}
