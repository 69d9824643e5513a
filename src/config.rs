//! Configuration management for the request shaper.
//!
//! Durations are written the way operators write them in proxy configuration:
//! `"1s"`, `"250ms"`, `"1m30s"`, `"-1s"`. A bare integer is a count of seconds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ShaperError};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "SHAPER";

/// Main configuration for the request shaper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShaperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Traffic shaping configuration
    #[serde(default)]
    pub shaping: ShapingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Name of the shaping middleware instance, used in logs
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            name: default_name(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_name() -> String {
    "request-shaper".to_string()
}

/// Traffic shaping configuration, applied identically to every source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapingConfig {
    /// Requests allowed per `period`. Zero disables shaping.
    #[serde(default)]
    pub average: u64,

    /// Period over which `average` requests are allowed
    #[serde(default = "default_period")]
    pub period: DurationSetting,

    /// Bucket capacity; values below 1 are treated as 1
    #[serde(default = "default_burst")]
    pub burst: i64,

    /// Longest delay a request may be held before it is rejected instead
    #[serde(default, alias = "max_delay", alias = "maxdelay")]
    pub max_delay: Option<DurationSetting>,

    /// Punitive wait before answering an over-delay request with 429
    #[serde(
        default = "default_exceed_wait",
        alias = "exceed_wait",
        alias = "exceedwait"
    )]
    pub exceed_wait: DurationSetting,

    /// Idle time after which a source's bucket may be dropped
    #[serde(default = "default_ttl")]
    pub ttl: DurationSetting,

    /// Sources that are never shaped
    #[serde(default)]
    pub exclusion: Option<Exclusion>,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            average: 0,
            period: default_period(),
            burst: default_burst(),
            max_delay: None,
            exceed_wait: default_exceed_wait(),
            ttl: default_ttl(),
            exclusion: None,
        }
    }
}

fn default_period() -> DurationSetting {
    DurationSetting::from("1s")
}

fn default_burst() -> i64 {
    1
}

fn default_exceed_wait() -> DurationSetting {
    DurationSetting::from("0s")
}

fn default_ttl() -> DurationSetting {
    DurationSetting::from("60s")
}

/// Source ranges excluded from shaping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exclusion {
    /// IP addresses or CIDR blocks
    #[serde(default, alias = "source_range", alias = "sourcerange")]
    pub source_range: Vec<String>,
}

/// A duration as written in configuration, parsed when the middleware is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSetting {
    /// Whole seconds
    Seconds(i64),
    /// Duration string such as `"1m30s"`
    Text(String),
}

impl DurationSetting {
    /// Parse the setting into a signed duration.
    pub fn parse(&self) -> Result<SignedDuration> {
        match self {
            DurationSetting::Seconds(secs) => {
                SignedDuration::bounded(*secs < 0, Duration::from_secs(secs.unsigned_abs()))
                    .ok_or_else(|| ShaperError::InvalidDuration {
                        value: secs.to_string(),
                        reason: "value out of range".to_string(),
                    })
            }
            DurationSetting::Text(text) => parse_duration(text),
        }
    }
}

impl From<&str> for DurationSetting {
    fn from(text: &str) -> Self {
        DurationSetting::Text(text.to_string())
    }
}

impl fmt::Display for DurationSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationSetting::Seconds(secs) => write!(f, "{}s", secs),
            DurationSetting::Text(text) => f.write_str(text),
        }
    }
}

/// A duration that may be negative.
///
/// `std::time::Duration` cannot represent negative values, which the
/// configuration must be able to express so that they can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignedDuration {
    negative: bool,
    magnitude: Duration,
}

impl SignedDuration {
    /// A duration with the given sign, or `None` if it is out of range.
    fn bounded(negative: bool, magnitude: Duration) -> Option<Self> {
        (magnitude.as_nanos() <= MAX_DURATION_NANOS).then_some(Self {
            negative,
            magnitude,
        })
    }

    /// Whether the duration is strictly below zero.
    pub fn is_negative(&self) -> bool {
        self.negative && !self.magnitude.is_zero()
    }

    /// Whether the duration is zero.
    pub fn is_zero(&self) -> bool {
        self.magnitude.is_zero()
    }

    /// The non-negative duration, or `None` if the value is negative.
    pub fn to_std(&self) -> Option<Duration> {
        (!self.is_negative()).then_some(self.magnitude)
    }
}

impl From<Duration> for SignedDuration {
    fn from(magnitude: Duration) -> Self {
        Self {
            negative: false,
            magnitude,
        }
    }
}

impl fmt::Display for SignedDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_negative() {
            write!(f, "-{:?}", self.magnitude)
        } else {
            write!(f, "{:?}", self.magnitude)
        }
    }
}

/// Longest representable duration, matching Go's `time.Duration` range.
const MAX_DURATION_NANOS: u128 = i64::MAX as u128;

/// Parse a duration string such as `"300ms"`, `"-1h"` or `"2h45m"`.
///
/// A leading `-` or `+` sets the sign; the rest is read by `humantime`, so
/// units such as `ns`, `us`, `ms`, `s`, `m` and `h` are accepted. A string made
/// only of digits is read as seconds. Values beyond roughly 292 years are
/// rejected.
pub fn parse_duration(input: &str) -> Result<SignedDuration> {
    let invalid = |reason: String| ShaperError::InvalidDuration {
        value: input.to_string(),
        reason,
    };

    let text = input.trim();
    let (negative, magnitude) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    if magnitude.is_empty() {
        return Err(invalid("empty duration".to_string()));
    }

    let magnitude = if magnitude.bytes().all(|b| b.is_ascii_digit()) {
        let secs: u64 = magnitude
            .parse()
            .map_err(|_| invalid("value out of range".to_string()))?;
        Duration::from_secs(secs)
    } else {
        humantime::parse_duration(magnitude).map_err(|e| invalid(e.to_string()))?
    };

    SignedDuration::bounded(negative, magnitude)
        .ok_or_else(|| invalid("value out of range".to_string()))
}

impl ShaperConfig {
    /// Load configuration from an optional YAML file, then apply environment
    /// overrides such as `SHAPER__SHAPING__AVERAGE=10`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading shaper configuration");
            builder = builder.add_source(::config::File::from(path));
        }

        builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| ShaperError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ShaperError::Config(format!("Failed to parse shaper config: {}", e)))
    }
}
