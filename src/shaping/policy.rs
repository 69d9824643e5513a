//! Shaping policy derived from configuration.
//!
//! The policy is computed once when the middleware is built and is shared by
//! every per-source bucket.

use std::time::Duration;
use tracing::{debug, warn};

use super::bucket::TokenBucket;
use super::source::SourceRanges;
use crate::config::{DurationSetting, ShapingConfig};
use crate::error::{Result, ShaperError};

/// Tolerated delay for rates below one request per second.
const LOW_RATE_MAX_DELAY: Duration = Duration::from_millis(500);

/// Process-wide shaping parameters.
#[derive(Debug, Clone)]
pub struct ShapingPolicy {
    /// Tokens per second; zero disables shaping
    rate: f64,
    /// Bucket capacity, at least 1
    burst: u32,
    /// Longest delay a request may be held before it is rejected
    max_delay: Duration,
    /// Wait imposed before rejecting an over-delay request
    exceed_wait: Duration,
    /// Idle time after which a bucket may be dropped
    ttl: Duration,
    /// Sources that bypass shaping
    excluded: SourceRanges,
}

impl ShapingPolicy {
    /// Derive the policy from configuration.
    pub fn from_config(config: &ShapingConfig) -> Result<Self> {
        let burst = u32::try_from(config.burst.max(1)).unwrap_or(u32::MAX);

        let period = config.period.parse()?;
        if period.is_negative() {
            return Err(ShaperError::InvalidPeriod(period.to_string()));
        }
        let period = match period.to_std() {
            Some(period) if !period.is_zero() => period,
            _ => Duration::from_secs(1),
        };

        let rate = if config.average > 0 {
            config.average as f64 / period.as_secs_f64()
        } else {
            0.0
        };

        let max_delay = if config.average > 0 {
            resolve_max_delay(config.max_delay.as_ref(), rate)?
        } else {
            Duration::ZERO
        };

        let exceed_wait = config.exceed_wait.parse()?.to_std().ok_or_else(|| {
            ShaperError::Config(format!(
                "negative value not valid for exceedWait: {}",
                config.exceed_wait
            ))
        })?;

        let ttl = config.ttl.parse()?;
        if ttl.is_negative() {
            return Err(ShaperError::InvalidTtl(ttl.to_string()));
        }
        let ttl = match ttl.to_std() {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => Duration::from_secs(1),
        };

        let excluded = match &config.exclusion {
            Some(exclusion) => SourceRanges::parse(&exclusion.source_range)?,
            None => SourceRanges::default(),
        };

        debug!(
            rate = rate,
            burst = burst,
            max_delay = ?max_delay,
            exceed_wait = ?exceed_wait,
            ttl = ?ttl,
            "Derived shaping policy"
        );

        Ok(Self {
            rate,
            burst,
            max_delay,
            exceed_wait,
            ttl,
            excluded,
        })
    }

    /// Tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Whether shaping is disabled and every request passes through.
    pub fn is_unlimited(&self) -> bool {
        self.rate == 0.0
    }

    /// Bucket capacity.
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Longest tolerated reservation delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Punitive wait before an over-delay rejection.
    pub fn exceed_wait(&self) -> Duration {
        self.exceed_wait
    }

    /// Idle time-to-live of a bucket.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sources that bypass shaping.
    pub fn excluded(&self) -> &SourceRanges {
        &self.excluded
    }

    /// A full bucket with this policy's rate and burst.
    pub fn new_bucket(&self) -> TokenBucket {
        TokenBucket::new(self.rate, self.burst)
    }
}

/// Use the configured max delay, or derive one from the rate when it is unset
/// or unparseable.
fn resolve_max_delay(configured: Option<&DurationSetting>, rate: f64) -> Result<Duration> {
    if let Some(setting) = configured {
        match setting.parse() {
            Ok(max_delay) => {
                return max_delay.to_std().ok_or_else(|| {
                    ShaperError::Config(format!(
                        "negative value not valid for maxDelay: {}",
                        setting
                    ))
                });
            }
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable maxDelay, using default");
            }
        }
    }

    Ok(default_max_delay(rate))
}

/// Natural delays grow without bound below 1 Hz, so the tolerated delay is
/// capped there; above it, half the interval between two tokens.
fn default_max_delay(rate: f64) -> Duration {
    if rate < 1.0 {
        LOW_RATE_MAX_DELAY
    } else {
        Duration::from_nanos((1e9 / (2.0 * rate)).round() as u64)
    }
}
