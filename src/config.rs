//! Cache Configuration
//!
//! [`CacheSettings`] is read from a YAML file and carries the tunables of the
//! manager, the maintenance loop and per-group policy overrides:
//!
//! ```yaml
//! memory_budget_bytes: 52428800
//! tier_timeout: 100ms
//! durable_dir: /var/cache/tiercache
//! warm_interval: 1h
//! sweep_interval: 24h
//! groups:
//!   ai_responses:
//!     ttl: 6h
//!     compress: true
//!   settings:
//!     tiers: [local, durable]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::group::GroupOverride;
use crate::error::{Error, Result};

/// Default local memory budget (50 MB)
pub const DEFAULT_MEMORY_BUDGET: u64 = 50 * 1024 * 1024;

/// Default timeout for durable and shared tier calls
pub const DEFAULT_TIER_TIMEOUT: Duration = Duration::from_millis(100);

/// Default warming cadence
pub const DEFAULT_WARM_INTERVAL: Duration = Duration::from_secs(3600);

/// Default local sweep cadence
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(86400);

/// Settings file contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    /// Local memory tier byte budget
    pub memory_budget_bytes: Option<u64>,
    /// Durable/shared call timeout (`"100ms"`)
    pub tier_timeout: Option<String>,
    /// Directory of the file-backed durable tier
    pub durable_dir: Option<PathBuf>,
    /// Enable the in-process shared tier
    pub shared_tier: Option<bool>,
    /// Warming cadence (`"1h"`)
    pub warm_interval: Option<String>,
    /// Local sweep cadence (`"24h"`)
    pub sweep_interval: Option<String>,
    /// Per-group policy overrides
    pub groups: BTreeMap<String, GroupOverride>,
}

impl CacheSettings {
    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Memory budget, defaulted
    pub fn memory_budget(&self) -> u64 {
        self.memory_budget_bytes.unwrap_or(DEFAULT_MEMORY_BUDGET)
    }

    /// Tier timeout, defaulted
    pub fn tier_timeout(&self) -> Result<Duration> {
        parse_or(self.tier_timeout.as_deref(), DEFAULT_TIER_TIMEOUT)
    }

    /// Warming cadence, defaulted
    pub fn warm_interval(&self) -> Result<Duration> {
        parse_or(self.warm_interval.as_deref(), DEFAULT_WARM_INTERVAL)
    }

    /// Sweep cadence, defaulted
    pub fn sweep_interval(&self) -> Result<Duration> {
        parse_or(self.sweep_interval.as_deref(), DEFAULT_SWEEP_INTERVAL)
    }
}

fn parse_or(value: Option<&str>, default: Duration) -> Result<Duration> {
    value.map(parse_duration).unwrap_or(Ok(default))
}

/// Parse a duration string such as `"90s"`, `"30m"`, `"1h30m"`, `"250ms"` or `"7d"`.
///
/// A trailing bare number is taken as seconds. Zero is rejected.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let unit = match c.to_ascii_lowercase() {
            'm' if chars.peek().map(|n| n.eq_ignore_ascii_case(&'s')) == Some(true) => {
                chars.next();
                Some(Duration::from_millis(num))
            }
            'd' => num.checked_mul(86400).map(Duration::from_secs),
            'h' => num.checked_mul(3600).map(Duration::from_secs),
            'm' => num.checked_mul(60).map(Duration::from_secs),
            's' => Some(Duration::from_secs(num)),
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total = unit
            .and_then(|unit| total.checked_add(unit))
            .ok_or_else(|| overflow(s))?;
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total = total
            .checked_add(Duration::from_secs(num))
            .ok_or_else(|| overflow(s))?;
    }

    if total.is_zero() {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(total)
}

fn overflow(s: &str) -> Error {
    Error::DurationParse(format!("duration out of range: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // =========================================================================
    // parse_duration Tests
    // =========================================================================

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86400));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("1H").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1m500ms").unwrap(), Duration::from_millis(60_500));
        assert_eq!(parse_duration("1800").unwrap(), Duration::from_secs(1800));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("0s"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("5x"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("h"), Err(Error::DurationParse(_)));
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert_matches!(parse_duration("999999999999999d"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("9999999999999999h"), Err(Error::DurationParse(_)));
        assert_matches!(
            parse_duration("18446744073709551615s1s"),
            Err(Error::DurationParse(_))
        );
        assert_matches!(
            parse_duration("18446744073709551615"),
            Ok(d) if d.as_secs() == u64::MAX
        );
    }

    // =========================================================================
    // CacheSettings Tests
    // =========================================================================

    #[test]
    fn test_settings_defaults() {
        let settings = CacheSettings::from_yaml("").unwrap();
        assert_eq!(settings.memory_budget(), DEFAULT_MEMORY_BUDGET);
        assert_eq!(settings.tier_timeout().unwrap(), DEFAULT_TIER_TIMEOUT);
        assert_eq!(settings.warm_interval().unwrap(), DEFAULT_WARM_INTERVAL);
        assert_eq!(settings.sweep_interval().unwrap(), DEFAULT_SWEEP_INTERVAL);
        assert!(settings.groups.is_empty());
    }

    #[test]
    fn test_settings_from_yaml() {
        let settings = CacheSettings::from_yaml(
            r#"
memory_budget_bytes: 1048576
tier_timeout: 50ms
durable_dir: /tmp/tiercache
shared_tier: true
groups:
  ai_responses:
    ttl: 2h
"#,
        )
        .unwrap();

        assert_eq!(settings.memory_budget(), 1024 * 1024);
        assert_eq!(settings.tier_timeout().unwrap(), Duration::from_millis(50));
        assert_eq!(settings.durable_dir, Some(PathBuf::from("/tmp/tiercache")));
        assert_eq!(settings.shared_tier, Some(true));
        assert_eq!(settings.groups["ai_responses"].ttl.as_deref(), Some("2h"));
    }

    #[test]
    fn test_settings_reject_unknown_keys() {
        assert_matches!(
            CacheSettings::from_yaml("memory_budget: 10"),
            Err(Error::Yaml(_))
        );
    }

    #[test]
    fn test_settings_load_missing_file() {
        assert_matches!(
            CacheSettings::load("/nonexistent/tiercache.yaml"),
            Err(Error::Config(_))
        );
    }
}
