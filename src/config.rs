use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::types::ParseMode;

/// Local-hour window during which no delivery attempt is made.
///
/// The window may wrap past midnight ("23-8" means 23:00 through 07:59).
/// Eligible queue rows stay `queued` and are reconsidered once the window
/// closes; quiet hours never transition a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start: u32,
    pub end: u32,
}

impl QuietHours {
    /// Parses `"23-8"` style specs. Returns `None` for anything malformed.
    pub fn parse(spec: &str) -> Option<Self> {
        let (start, end) = spec.split_once('-')?;
        let start: u32 = start.trim().parse().ok()?;
        let end: u32 = end.trim().parse().ok()?;
        if start > 23 || end > 23 {
            return None;
        }
        Some(QuietHours { start, end })
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.start == self.end {
            return false;
        }
        if self.start < self.end {
            self.start <= hour && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

/// Settings consumed by the delivery worker.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Minimum wall-clock gap between two successful sends.
    pub interval: Duration,
    pub max_per_hour: i64,
    pub max_per_day: i64,
    pub quiet_hours: Option<QuietHours>,
    /// Offset applied to UTC before the quiet-hours check.
    pub utc_offset_hours: i32,
    /// Retry budget for transient send failures.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub mode: ParseMode,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            interval: Duration::from_secs(300),
            max_per_hour: 8,
            max_per_day: 40,
            quiet_hours: None,
            utc_offset_hours: 0,
            max_attempts: 3,
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(3600),
            mode: ParseMode::Html,
        }
    }
}

impl DeliveryConfig {
    pub fn from_env() -> Self {
        let defaults = DeliveryConfig::default();

        let quiet_hours = match env::var("PUBLISH_QUIET_HOURS") {
            Ok(raw) if !raw.trim().is_empty() => {
                let parsed = QuietHours::parse(&raw);
                if parsed.is_none() {
                    warn!("Invalid PUBLISH_QUIET_HOURS={}, ignoring", raw);
                }
                parsed
            }
            _ => None,
        };

        let mode = env::var("PUBLISH_MODE")
            .ok()
            .and_then(|raw| ParseMode::parse(&raw))
            .unwrap_or(defaults.mode);

        DeliveryConfig {
            interval: Duration::from_secs(env_parse(
                "PUBLISH_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )),
            max_per_hour: env_parse("PUBLISH_MAX_PER_HOUR", defaults.max_per_hour),
            max_per_day: env_parse("PUBLISH_MAX_PER_DAY", defaults.max_per_day),
            quiet_hours,
            utc_offset_hours: env_parse("TZ_OFFSET_HOURS", defaults.utc_offset_hours),
            max_attempts: env_parse("PUBLISH_MAX_ATTEMPTS", defaults.max_attempts),
            backoff_base: Duration::from_secs(env_parse(
                "PUBLISH_BACKOFF_BASE_SECS",
                defaults.backoff_base.as_secs(),
            )),
            backoff_cap: Duration::from_secs(env_parse(
                "PUBLISH_BACKOFF_CAP_SECS",
                defaults.backoff_cap.as_secs(),
            )),
            mode,
        }
    }
}

fn env_parse<T: FromStr + Copy>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
