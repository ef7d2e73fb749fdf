//! Interval parsing and retry backoff computation.
//!
//! This module provides:
//! - `parse_interval` / `format_interval` for human-readable durations
//! - `Backoff` policy (fixed, linear, exponential) with cap and jitter

use crate::error::QueueError;
use serde::{Deserialize, Serialize};

/// Default cap for exponential backoff: one hour.
pub const DEFAULT_MAX_DELAY_MS: u64 = 3_600_000;

/// Parse a human-readable interval into milliseconds.
///
/// Accepts a bare integer (milliseconds) or a string matching
/// `^\d+(ms|s|m|h|d)$`. Anything else is rejected.
///
/// # Example
///
/// ```rust,ignore
/// assert_eq!(parse_interval("30s")?, 30_000);
/// assert_eq!(parse_interval("5m")?, 300_000);
/// assert_eq!(parse_interval("1500")?, 1500);
/// ```
pub fn parse_interval(input: &str) -> Result<u64, QueueError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(QueueError::InvalidInterval(input.to_string()));
    }

    // Bare integer means milliseconds
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s
            .parse::<u64>()
            .map_err(|_| QueueError::InvalidInterval(input.to_string()));
    }

    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| QueueError::InvalidInterval(input.to_string()))?;
    if digits_end == 0 {
        return Err(QueueError::InvalidInterval(input.to_string()));
    }

    let (value, unit) = s.split_at(digits_end);
    let value: u64 = value
        .parse()
        .map_err(|_| QueueError::InvalidInterval(input.to_string()))?;

    let multiplier = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err(QueueError::InvalidInterval(input.to_string())),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| QueueError::InvalidInterval(input.to_string()))
}

/// Format milliseconds into the canonical interval string.
///
/// Uses the largest unit that divides evenly, so `parse_interval` is the
/// right inverse of this function for values under one day.
pub fn format_interval(ms: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
    ];

    for (factor, unit) in UNITS {
        if ms >= factor && ms % factor == 0 {
            return format!("{}{}", ms / factor, unit);
        }
    }
    format!("{}ms", ms)
}

/// How retry delays grow with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay for every attempt.
    Fixed,
    /// `delay * attempt`.
    Linear,
    /// `delay * 2^(attempt - 1)`, capped at `max_delay`.
    Exponential,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Linear => "linear",
            Self::Exponential => "exponential",
        }
    }
}

impl std::str::FromStr for BackoffKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(QueueError::InvalidBackoff(format!(
                "unknown backoff type '{}'",
                other
            ))),
        }
    }
}

/// Retry backoff policy attached to a job's options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    /// Growth curve.
    #[serde(rename = "type")]
    pub kind: BackoffKind,

    /// Base delay in milliseconds.
    pub delay: u64,

    /// Upper bound on the computed delay (exponential only; defaults to 1h).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<u64>,

    /// Jitter factor in `[0, 1]`. Adds uniform noise in `[0, delay * jitter)`.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub jitter: f64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl Backoff {
    pub fn fixed(delay: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
            max_delay: None,
            jitter: 0.0,
        }
    }

    pub fn linear(delay: u64) -> Self {
        Self {
            kind: BackoffKind::Linear,
            delay,
            max_delay: None,
            jitter: 0.0,
        }
    }

    pub fn exponential(delay: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
            max_delay: None,
            jitter: 0.0,
        }
    }

    /// Set the exponential cap.
    pub fn with_max_delay(mut self, max_delay: u64) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Set the jitter factor (clamped to `[0, 1]`).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Validate the policy before accepting a job.
    pub fn validate(&self) -> Result<(), QueueError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(QueueError::InvalidBackoff(format!(
                "jitter {} outside [0, 1]",
                self.jitter
            )));
        }
        if let Some(max) = self.max_delay
            && max < self.delay
        {
            return Err(QueueError::InvalidBackoff(format!(
                "maxDelay {} smaller than delay {}",
                max, self.delay
            )));
        }
        Ok(())
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(1_000)
    }
}

/// Compute the retry delay in milliseconds for a given attempt.
///
/// The first retry uses `attempt = 1`; an `attempt` of 0 never occurs and is
/// treated as 1. Jitter only applies to exponential backoff; fixed and
/// linear delays are exact.
pub fn compute_backoff(attempt: u32, backoff: &Backoff) -> u64 {
    let attempt = attempt.max(1);

    match backoff.kind {
        BackoffKind::Fixed => backoff.delay,
        BackoffKind::Linear => backoff.delay.saturating_mul(attempt as u64),
        BackoffKind::Exponential => {
            let exp = backoff
                .delay
                .saturating_mul(2u64.saturating_pow(attempt - 1));
            let capped = exp.min(backoff.max_delay.unwrap_or(DEFAULT_MAX_DELAY_MS));

            if backoff.jitter > 0.0 {
                let range = (backoff.delay as f64 * backoff.jitter) as u64;
                capped.saturating_add(pseudo_random_below(range))
            } else {
                capped
            }
        }
    }
}

/// Uniform pseudo-random value in `[0, range)` without a rand dependency.
///
/// Hashes the current time; good enough to spread retries, not for anything
/// security sensitive.
fn pseudo_random_below(range: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::SystemTime;

    if range == 0 {
        return 0;
    }

    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        .hash(&mut hasher);
    hasher.finish() % range
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interval_units() {
        assert_eq!(parse_interval("250ms").unwrap(), 250);
        assert_eq!(parse_interval("30s").unwrap(), 30_000);
        assert_eq!(parse_interval("5m").unwrap(), 300_000);
        assert_eq!(parse_interval("2h").unwrap(), 7_200_000);
        assert_eq!(parse_interval("1d").unwrap(), 86_400_000);
    }

    #[test]
    fn test_parse_interval_bare_integer_is_ms() {
        assert_eq!(parse_interval("1500").unwrap(), 1500);
        assert_eq!(parse_interval("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_interval_rejects_garbage() {
        for bad in ["", "abc", "10x", "ms", "-5s", "1.5s", "5 m", "s30"] {
            assert!(parse_interval(bad).is_err(), "expected error for {:?}", bad);
        }
    }

    #[test]
    fn test_format_interval_canonical() {
        assert_eq!(format_interval(250), "250ms");
        assert_eq!(format_interval(30_000), "30s");
        assert_eq!(format_interval(300_000), "5m");
        assert_eq!(format_interval(7_200_000), "2h");
    }

    #[test]
    fn test_parse_is_right_inverse_of_format_below_one_day() {
        for ms in [1, 999, 1_000, 45_000, 60_000, 90_000, 3_600_000, 43_200_000] {
            assert_eq!(parse_interval(&format_interval(ms)).unwrap(), ms);
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let b = Backoff::fixed(500);
        assert_eq!(compute_backoff(1, &b), 500);
        assert_eq!(compute_backoff(5, &b), 500);
    }

    #[test]
    fn test_linear_backoff() {
        let b = Backoff::linear(100);
        assert_eq!(compute_backoff(1, &b), 100);
        assert_eq!(compute_backoff(2, &b), 200);
        assert_eq!(compute_backoff(7, &b), 700);
    }

    #[test]
    fn test_exponential_backoff() {
        let b = Backoff::exponential(100);
        assert_eq!(compute_backoff(1, &b), 100);
        assert_eq!(compute_backoff(2, &b), 200);
        assert_eq!(compute_backoff(3, &b), 400);
        assert_eq!(compute_backoff(4, &b), 800);
    }

    #[test]
    fn test_exponential_backoff_caps_at_max_delay() {
        let b = Backoff::exponential(1_000).with_max_delay(5_000);
        assert_eq!(compute_backoff(10, &b), 5_000);

        // Default cap kicks in eventually
        let b = Backoff::exponential(1_000);
        assert_eq!(compute_backoff(30, &b), DEFAULT_MAX_DELAY_MS);
    }

    #[test]
    fn test_attempt_zero_treated_as_one() {
        let b = Backoff::exponential(100);
        assert_eq!(compute_backoff(0, &b), compute_backoff(1, &b));
    }

    #[test]
    fn test_exponential_jitter_stays_in_range() {
        let b = Backoff::exponential(1_000).with_jitter(0.5);
        for _ in 0..50 {
            let d = compute_backoff(1, &b);
            assert!((1_000..1_500).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn test_fixed_and_linear_ignore_jitter() {
        let b = Backoff::fixed(1_000).with_jitter(0.5);
        assert_eq!(compute_backoff(1, &b), 1_000);

        let b = Backoff::linear(100).with_jitter(0.5);
        assert_eq!(compute_backoff(3, &b), 300);
    }

    #[test]
    fn test_backoff_validate() {
        assert!(Backoff::fixed(100).validate().is_ok());
        assert!(
            Backoff::exponential(1_000)
                .with_max_delay(500)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_backoff_wire_format() {
        let b = Backoff::exponential(100).with_max_delay(60_000).with_jitter(0.2);
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["type"], "exponential");
        assert_eq!(json["delay"], 100);
        assert_eq!(json["maxDelay"], 60_000);

        let back: Backoff = serde_json::from_value(json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn test_backoff_kind_from_str() {
        assert_eq!("fixed".parse::<BackoffKind>().unwrap(), BackoffKind::Fixed);
        assert_eq!(
            "EXPONENTIAL".parse::<BackoffKind>().unwrap(),
            BackoffKind::Exponential
        );
        assert!("cubic".parse::<BackoffKind>().is_err());
    }
}
