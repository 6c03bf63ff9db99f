//! Configuration for remote comms.
//!
//! [`RemoteCommsOptions`] is validated once, when comms are initialized.
//! Durations are written as milliseconds when loaded from JSON or TOML:
//!
//! ```
//! use ocap_remote::{OverflowPolicy, RemoteCommsOptions};
//! use std::time::Duration;
//!
//! let options: RemoteCommsOptions = serde_json::from_str(
//!     r#"{ "max_queue": 50, "overflow_policy": "reject_new", "dial_timeout": 2000 }"#,
//! )
//! .expect("parse");
//! assert_eq!(options.max_queue, 50);
//! assert_eq!(options.overflow_policy, OverflowPolicy::RejectNew);
//! assert_eq!(options.dial_timeout, Duration::from_secs(2));
//! assert_eq!(options.max_retry_attempts, 0);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use ocap_core::{PeerAddress, TransportKind};

use crate::RemoteError;

/// Default per-peer queue capacity.
pub const DEFAULT_MAX_QUEUE: usize = 200;

/// What to do when a peer's outbound queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued message to admit the new one.
    #[default]
    DropOldest,
    /// Refuse the new message with `QueueAtCapacity`.
    RejectNew,
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,

    /// Multiplicative jitter, as a fraction in `[0, 1)`.
    ///
    /// A delay `d` becomes uniform in `[d * (1 - jitter), d * (1 + jitter)]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.5,
        }
    }
}

/// Options accepted by `initialize_remote_comms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCommsOptions {
    /// Relay addresses, each ending in `/p2p/<relay-id>`.
    pub relays: Vec<String>,

    /// Addresses to bind listeners on.
    pub direct_listen_addresses: Vec<String>,

    /// Consecutive dial failures before giving up on a peer. 0 retries forever.
    pub max_retry_attempts: u32,

    /// Per-peer outbound queue capacity.
    pub max_queue: usize,

    /// Behavior when the queue is full.
    pub overflow_policy: OverflowPolicy,

    /// Reconnection backoff.
    pub backoff: BackoffConfig,

    /// Timeout for one dial plus handshake.
    #[serde(with = "millis")]
    pub dial_timeout: Duration,

    /// How long one frame may take to write before the connection is treated
    /// as lost.
    #[serde(with = "millis")]
    pub write_timeout: Duration,

    /// How long received messages may wait for a piggybacked ack before an
    /// ack-only frame is sent.
    #[serde(with = "millis")]
    pub ack_delay: Duration,
}

impl Default for RemoteCommsOptions {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            direct_listen_addresses: Vec::new(),
            max_retry_attempts: 0,
            max_queue: DEFAULT_MAX_QUEUE,
            overflow_policy: OverflowPolicy::DropOldest,
            backoff: BackoffConfig::default(),
            dial_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            ack_delay: Duration::from_millis(50),
        }
    }
}

impl RemoteCommsOptions {
    /// Add a relay address.
    pub fn with_relay(mut self, relay: impl Into<String>) -> Self {
        self.relays.push(relay.into());
        self
    }

    /// Add a direct-listen address.
    pub fn with_listen_address(mut self, addr: impl Into<String>) -> Self {
        self.direct_listen_addresses.push(addr.into());
        self
    }

    /// Set the retry limit (0 = infinite).
    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Set the per-peer queue capacity.
    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    /// Set the overflow policy.
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Set the backoff parameters.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the ack delay.
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }

    /// Check the options for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidOptions`] describing the first problem found.
    pub fn validate(&self) -> Result<(), RemoteError> {
        let invalid = |msg: String| Err(RemoteError::InvalidOptions(msg));

        if self.max_queue == 0 {
            return invalid("max_queue must be at least 1".into());
        }
        if self.backoff.base_delay.is_zero() {
            return invalid("backoff.base_delay must be non-zero".into());
        }
        if self.backoff.max_delay < self.backoff.base_delay {
            return invalid("backoff.max_delay must not be below backoff.base_delay".into());
        }
        if !(0.0..1.0).contains(&self.backoff.jitter) {
            return invalid(format!(
                "backoff.jitter must be in [0, 1), got {}",
                self.backoff.jitter
            ));
        }
        if self.dial_timeout.is_zero() {
            return invalid("dial_timeout must be non-zero".into());
        }
        if self.write_timeout.is_zero() {
            return invalid("write_timeout must be non-zero".into());
        }
        for relay in &self.relays {
            if PeerAddress::parse(relay).is_none_or(|addr| addr.peer_suffix().is_none()) {
                return invalid(format!("unrecognized relay address: {}", relay));
            }
        }
        for addr in &self.direct_listen_addresses {
            if TransportKind::classify(addr).is_none() {
                return invalid(format!("unrecognized listen address: {}", addr));
            }
        }
        Ok(())
    }
}

/// Serialize a `Duration` as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RemoteCommsOptions::default();
        assert_eq!(options.max_queue, 200);
        assert_eq!(options.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(options.max_retry_attempts, 0);
        assert_eq!(options.backoff.base_delay, Duration::from_millis(500));
        assert_eq!(options.backoff.max_delay, Duration::from_secs(10));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_empty_json_yields_defaults() {
        let options: RemoteCommsOptions = serde_json::from_str("{}").expect("parse");
        assert_eq!(options, RemoteCommsOptions::default());
    }

    #[test]
    fn test_backoff_section_partial() {
        let options: RemoteCommsOptions =
            serde_json::from_str(r#"{ "backoff": { "base_delay": 100 } }"#).expect("parse");
        assert_eq!(options.backoff.base_delay, Duration::from_millis(100));
        assert_eq!(options.backoff.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = [
            RemoteCommsOptions::default().with_max_queue(0),
            RemoteCommsOptions::default().with_dial_timeout(Duration::ZERO),
            RemoteCommsOptions::default().with_write_timeout(Duration::ZERO),
            RemoteCommsOptions::default().with_backoff(BackoffConfig {
                jitter: 1.5,
                ..BackoffConfig::default()
            }),
            RemoteCommsOptions::default().with_backoff(BackoffConfig {
                base_delay: Duration::from_secs(20),
                ..BackoffConfig::default()
            }),
            RemoteCommsOptions::default().with_relay("relay.example.com"),
            RemoteCommsOptions::default().with_listen_address("localhost:4001"),
        ];
        for options in cases {
            assert!(
                matches!(options.validate(), Err(RemoteError::InvalidOptions(_))),
                "expected rejection: {:?}",
                options
            );
        }
    }

    #[test]
    fn test_relay_needs_peer_suffix() {
        let ok = RemoteCommsOptions::default().with_relay("/dns4/relay.example/tcp/443/wss/p2p/r1");
        assert!(ok.validate().is_ok());
        let bare = RemoteCommsOptions::default().with_relay("/dns4/relay.example/tcp/443/wss");
        assert!(matches!(bare.validate(), Err(RemoteError::InvalidOptions(_))));
    }
}
