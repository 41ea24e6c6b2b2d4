//! Score adapter
//!
//! Quiz results arrive as loosely formatted strings ("3/5", "60%", "0.6").
//! Everything is normalised to a single [`ScoreRatio`] here so no other
//! module parses score text.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tolerance used when comparing a ratio against a threshold
const RATIO_EPSILON: f64 = 1e-9;

/// A score expressed as a ratio in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScoreRatio(f64);

impl ScoreRatio {
    pub const ZERO: ScoreRatio = ScoreRatio(0.0);
    pub const FULL: ScoreRatio = ScoreRatio(1.0);

    /// Build from a raw ratio, clamping into range. NaN becomes zero.
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return Self::ZERO;
        }
        Self(value.clamp(0.0, 1.0))
    }

    /// Build from a correct/total count. A zero total is a zero ratio.
    pub fn from_fraction(correct: u32, total: u32) -> Self {
        if total == 0 {
            return Self::ZERO;
        }
        Self::new(correct as f64 / total as f64)
    }

    /// Parse a score string.
    ///
    /// Accepts `"n/m"` fractions, `"NN%"` percentages and bare numbers
    /// (values up to 1 are ratios, values up to 100 are percentages).
    /// Returns `None` for anything else.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some((num, den)) = trimmed.split_once('/') {
            let num = parse_finite(num)?;
            let den = parse_finite(den)?;
            if num < 0.0 || den <= 0.0 {
                return None;
            }
            return Some(Self::new(num / den));
        }

        if let Some(percent) = trimmed.strip_suffix('%') {
            let percent = parse_finite(percent)?;
            if percent < 0.0 {
                return None;
            }
            return Some(Self::new(percent / 100.0));
        }

        Self::from_number(parse_finite(trimmed)?)
    }

    /// Interpret a bare number: up to 1 is a ratio, up to 100 a percentage
    pub fn from_number(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        if (0.0..=1.0).contains(&value) {
            Some(Self(value))
        } else if value > 1.0 && value <= 100.0 {
            Some(Self(value / 100.0))
        } else {
            None
        }
    }

    /// Parse, treating anything unparsable as a failing zero score
    pub fn parse_or_zero(raw: &str) -> Self {
        Self::parse(raw).unwrap_or(Self::ZERO)
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn as_percent(self) -> f64 {
        self.0 * 100.0
    }

    /// Whether the ratio reaches `threshold`
    pub fn meets(self, threshold: f64) -> bool {
        self.0 + RATIO_EPSILON >= threshold
    }

    /// Whether this is a perfect score
    pub fn is_full(self) -> bool {
        self.0 >= 1.0
    }
}

impl fmt::Display for ScoreRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0}%", self.as_percent())
    }
}

/// Aggregate score exactly as the attempt history source reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawScore {
    Number(f64),
    Text(String),
}

impl RawScore {
    /// Normalise to a ratio; `None` when the value cannot be interpreted
    pub fn ratio(&self) -> Option<ScoreRatio> {
        match self {
            RawScore::Number(value) => ScoreRatio::from_number(*value),
            RawScore::Text(text) => ScoreRatio::parse(text),
        }
    }
}

fn parse_finite(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
