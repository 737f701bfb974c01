//! Configuration for the commit core: the crash bound, the phase and
//! election timers, and the caps protecting the shared queues.

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use validator::Validate;

/// Deserializes float seconds to a duration object.
pub fn deserialize_float_seconds_to_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs: f64 = Deserialize::deserialize(de)?;
    Ok(Duration::from_secs_f64(secs))
}

/// Serializes a duration as float seconds, the inverse of
/// [`deserialize_float_seconds_to_duration`].
pub fn serialize_duration_to_float_seconds<S>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Configuration for the commit core.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Validate)]
pub struct InbacConfig {
    /// The assumed maximum number of simultaneous crashes. The effective
    /// bound F for a transaction is `min(max_crashed, N - 1)`.
    #[validate(range(min = 1))]
    pub max_crashed: u32,
    /// Timer configuration for the protocol.
    #[validate(nested)]
    pub timers: TimersConfig,
    /// Rounds after which an election gives up and forces an abort decision.
    #[validate(range(min = 1))]
    pub max_election_rounds: u32,
    /// How many messages may be queued per transaction before its instance
    /// is constructed.
    #[validate(range(min = 1))]
    pub early_queue_limit: usize,
    /// How many recently completed transaction ids are remembered so late
    /// traffic for them is dropped instead of queued.
    pub completed_cache_size: NonZeroUsize,
}

impl Default for InbacConfig {
    fn default() -> Self {
        Self {
            max_crashed: 1,
            timers: TimersConfig::default(),
            max_election_rounds: 1000,
            early_queue_limit: 128,
            completed_cache_size: NonZeroUsize::new(1024).expect("non-zero literal"),
        }
    }
}

/// Configuration for the protocol timers.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Validate)]
pub struct TimersConfig {
    /// The base phase timer (seconds): one expected message delay. Followers
    /// arm their single timer at twice this value.
    #[serde(
        deserialize_with = "deserialize_float_seconds_to_duration",
        serialize_with = "serialize_duration_to_float_seconds"
    )]
    pub msg_delay: Duration,
    /// Upper bound (seconds) for the uniformly sampled election round timer.
    #[serde(
        deserialize_with = "deserialize_float_seconds_to_duration",
        serialize_with = "serialize_duration_to_float_seconds"
    )]
    pub consensus_delay: Duration,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            msg_delay: Duration::from_secs_f64(0.05),
            consensus_delay: Duration::from_secs_f64(0.1),
        }
    }
}
