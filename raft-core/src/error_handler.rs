//! Classification and retry policy for transport-level failures, plus a heuristic for
//! surfacing suspected network partitions to the metrics system.
//!
//! This generalizes the ad hoc "log a warning and let the next heartbeat tick retry" pattern
//! used throughout [`crate::replication`] into a small, independently testable set of components:
//! classify the failure, decide whether and how long to back off before retrying, and track
//! whether enough peers are failing in a way that looks like a partition.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::quorum;
use crate::NodeId;

/// A classification of why an RPC send to a peer failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The request was sent but no response arrived within the configured timeout.
    NetworkTimeout,
    /// The peer refused the connection outright.
    ConnectionRefused,
    /// The peer (or some router along the way) was unreachable.
    NetworkUnreachable,
    /// The request or response payload could not be encoded/decoded.
    SerializationError,
    /// The peer responded, but its response violated the wire protocol's contract.
    ProtocolError,
    /// A failure which is expected to clear up on its own shortly, but doesn't fit one of the
    /// more specific network-failure kinds above.
    TemporaryFailure,
    /// A failure which does not match any recognized pattern.
    Unknown,
}

impl TransportErrorKind {
    /// Whether a failure of this kind is worth retrying.
    ///
    /// `SerializationError` and `ProtocolError` indicate the request or the peer's understanding
    /// of the protocol is broken in a way that retrying will not fix; everything else is assumed
    /// to be transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportErrorKind::SerializationError | TransportErrorKind::ProtocolError)
    }

    /// Classify an error surfaced by a [`crate::RaftNetwork`] implementation, by inspecting its
    /// message. Transports are free to wrap any underlying error type in the `anyhow::Error`
    /// returned from their trait methods, so textual sniffing of well-known substrings is the
    /// only classification mechanism available at this boundary.
    pub fn classify(err: &anyhow::Error) -> Self {
        let msg = err.to_string().to_lowercase();
        if msg.contains("timed out") || msg.contains("timeout") {
            TransportErrorKind::NetworkTimeout
        } else if msg.contains("connection refused") || msg.contains("refused") {
            TransportErrorKind::ConnectionRefused
        } else if msg.contains("unreachable") || msg.contains("no route to host") {
            TransportErrorKind::NetworkUnreachable
        } else if msg.contains("serializ") || msg.contains("deserializ") || msg.contains("decode")
            || msg.contains("encode")
        {
            TransportErrorKind::SerializationError
        } else if msg.contains("protocol") || msg.contains("unexpected response") {
            TransportErrorKind::ProtocolError
        } else if msg.contains("temporarily") || msg.contains("try again") || msg.contains("isolated") {
            TransportErrorKind::TemporaryFailure
        } else {
            TransportErrorKind::Unknown
        }
    }
}

/// Exponential backoff with jitter, bounded to a maximum number of attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self { base_delay, max_delay, max_attempts }
    }

    /// The maximum number of attempts this policy allows, including the first (non-retry) one.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether `attempt` (1-indexed: `1` is the first try, not yet a retry) is still permitted.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// The delay to wait before making `attempt` (the attempt about to be made, 1-indexed).
    /// Returns `None` once `attempt` exceeds `max_attempts`, signaling the caller should give up.
    ///
    /// The delay doubles with each prior attempt and is capped at `max_delay`, with up to 50%
    /// jitter added to avoid synchronized retry storms across nodes.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.allows(attempt) || attempt <= 1 {
            return if self.allows(attempt) { Some(Duration::from_secs(0)) } else { None };
        }

        let exponent = attempt.saturating_sub(2).min(20);
        let scaled = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = scaled.min(self.max_delay);

        let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..0.5);
        let jitter = capped.mul_f64(jitter_fraction);
        Some(capped + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(5), 5)
    }
}

/// Tracks, per peer, whether the most recent RPC sends have been hitting retryable
/// network-class failures, and surfaces a heuristic `partition_suspected` signal once a majority
/// of the cluster looks that way.
#[derive(Debug)]
pub struct PartitionDetector {
    /// Consecutive retryable network-class failures observed for each peer.
    streaks: HashMap<NodeId, u32>,
    /// How many consecutive failures constitute "this peer looks partitioned from us".
    window: u32,
    /// Total number of voting members, used to compute the majority threshold.
    cluster_size: usize,
}

impl PartitionDetector {
    pub fn new(cluster_size: usize, window: u32) -> Self {
        Self { streaks: HashMap::new(), window, cluster_size }
    }

    /// Record the outcome of an RPC send to `peer`.
    pub fn record(&mut self, peer: NodeId, kind: Option<TransportErrorKind>) {
        match kind {
            Some(k) if k.is_retryable() && k != TransportErrorKind::Unknown => {
                *self.streaks.entry(peer).or_insert(0) += 1;
            }
            _ => {
                self.streaks.remove(&peer);
            }
        }
    }

    /// Whether a majority of the cluster currently looks unreachable, per the configured window.
    pub fn partition_suspected(&self) -> bool {
        let failing = self.streaks.values().filter(|&&streak| streak >= self.window).count();
        failing >= quorum::majority_of(self.cluster_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_well_known_messages() {
        assert_eq!(
            TransportErrorKind::classify(&anyhow::anyhow!("request timed out after 500ms")),
            TransportErrorKind::NetworkTimeout
        );
        assert_eq!(
            TransportErrorKind::classify(&anyhow::anyhow!("connection refused by peer")),
            TransportErrorKind::ConnectionRefused
        );
        assert_eq!(
            TransportErrorKind::classify(&anyhow::anyhow!("failed to deserialize response")),
            TransportErrorKind::SerializationError
        );
        assert_eq!(
            TransportErrorKind::classify(&anyhow::anyhow!("something bizarre happened")),
            TransportErrorKind::Unknown
        );
    }

    #[test]
    fn serialization_and_protocol_errors_are_not_retryable() {
        assert!(!TransportErrorKind::SerializationError.is_retryable());
        assert!(!TransportErrorKind::ProtocolError.is_retryable());
        assert!(TransportErrorKind::NetworkTimeout.is_retryable());
        assert!(TransportErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn retry_policy_caps_attempts_and_backs_off() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100), 3);
        assert!(policy.delay_for(1).unwrap() == Duration::from_secs(0));
        assert!(policy.delay_for(2).unwrap() >= Duration::from_millis(10));
        assert!(policy.delay_for(3).unwrap() >= Duration::from_millis(20));
        assert!(policy.delay_for(4).is_none(), "max_attempts is 3, a 4th attempt must not be allowed");
    }

    #[test]
    fn retry_policy_delay_never_exceeds_max_delay_plus_jitter() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50), 10);
        for attempt in 1..=10 {
            if let Some(delay) = policy.delay_for(attempt) {
                assert!(delay <= Duration::from_millis(75), "delay {:?} exceeded max_delay + 50% jitter", delay);
            }
        }
    }

    #[test]
    fn partition_suspected_once_majority_of_peers_fail_past_window() {
        let mut detector = PartitionDetector::new(5, 3);
        for peer in [2, 3, 4] {
            for _ in 0..3 {
                detector.record(peer, Some(TransportErrorKind::NetworkTimeout));
            }
        }
        assert!(detector.partition_suspected());
    }

    #[test]
    fn partition_not_suspected_below_window_or_below_majority() {
        let mut detector = PartitionDetector::new(5, 3);
        detector.record(2, Some(TransportErrorKind::NetworkTimeout));
        detector.record(2, Some(TransportErrorKind::NetworkTimeout));
        assert!(!detector.partition_suspected(), "peer 2 has not reached the failure window yet");

        for _ in 0..3 {
            detector.record(2, Some(TransportErrorKind::NetworkTimeout));
        }
        assert!(!detector.partition_suspected(), "only one of five peers is failing, not a majority");
    }

    #[test]
    fn a_success_resets_the_streak() {
        let mut detector = PartitionDetector::new(5, 3);
        for _ in 0..2 {
            detector.record(2, Some(TransportErrorKind::NetworkTimeout));
        }
        detector.record(2, None);
        for _ in 0..2 {
            detector.record(2, Some(TransportErrorKind::NetworkTimeout));
        }
        assert!(!detector.partition_suspected(), "a success in between should have reset the streak");
    }
}
