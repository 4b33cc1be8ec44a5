//! Per-check rule overrides.
//!
//! An outer layer (for example a route table or per-endpoint annotations)
//! can resolve a set of overrides for a single request and pass it along
//! with the target. For each rule variant that has an override, the
//! override's parameters replace the configured ones for that check only.
//! The rule's id, alignment and lock settings are kept.

use serde::{Deserialize, Serialize};

use super::notation::parse_period;
use super::rules::{FixedWindowRule, LeakyBucketRule, Rule, SlidingWindowRule, TokenBucketRule};
use crate::error::{Result, SluiceError};

/// One optional override per rule variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_bucket: Option<TokenBucketOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaky_bucket: Option<LeakyBucketOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_window: Option<FixedWindowOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sliding_window: Option<SlidingWindowOverride>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketOverride {
    pub capacity: i64,
    pub inflow_quantity_per_unit: i64,
    /// Inflow unit in period notation, e.g. `"1s"`
    pub period: String,
    #[serde(default)]
    pub raise_on_limit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakyBucketOverride {
    pub capacity: i64,
    pub outflow_quantity_per_unit: i64,
    /// Outflow unit in period notation
    pub period: String,
    #[serde(default)]
    pub raise_on_limit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWindowOverride {
    pub limit_number: i64,
    /// Window length in period notation
    pub period: String,
    #[serde(default)]
    pub raise_on_limit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowOverride {
    pub limit_number: i64,
    pub stat_window_period: String,
    pub stat_small_period: String,
    #[serde(default)]
    pub raise_on_limit: bool,
}

impl RuleOverrides {
    /// Parse overrides from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SluiceError::Config(format!("Failed to parse rule overrides: {}", e)))
    }

    pub fn is_empty(&self) -> bool {
        self.token_bucket.is_none()
            && self.leaky_bucket.is_none()
            && self.fixed_window.is_none()
            && self.sliding_window.is_none()
    }

    /// The rule to apply for one check: `rule` with this set's override for
    /// its variant, or `rule` unchanged when there is none.
    pub fn apply(&self, rule: &Rule) -> Result<Rule> {
        let (mut patched, raise_on_limit): (Rule, bool) = match (rule, self) {
            (
                Rule::TokenBucket(_),
                RuleOverrides {
                    token_bucket: Some(o), ..
                },
            ) => (
                TokenBucketRule::new(o.capacity, o.inflow_quantity_per_unit, parse_period(&o.period)?)?.into(),
                o.raise_on_limit,
            ),
            (
                Rule::LeakyBucket(_),
                RuleOverrides {
                    leaky_bucket: Some(o), ..
                },
            ) => (
                LeakyBucketRule::new(o.capacity, o.outflow_quantity_per_unit, parse_period(&o.period)?)?.into(),
                o.raise_on_limit,
            ),
            (
                Rule::FixedWindow(_),
                RuleOverrides {
                    fixed_window: Some(o), ..
                },
            ) => (
                FixedWindowRule::new(o.limit_number, parse_period(&o.period)?)?.into(),
                o.raise_on_limit,
            ),
            (
                Rule::SlidingWindow(_),
                RuleOverrides {
                    sliding_window: Some(o), ..
                },
            ) => (
                SlidingWindowRule::new(
                    o.limit_number,
                    parse_period(&o.stat_window_period)?,
                    parse_period(&o.stat_small_period)?,
                )?
                .into(),
                o.raise_on_limit,
            ),
            _ => return Ok(rule.clone()),
        };

        patched.set_options(rule.options().clone());
        patched.set_raise_on_limit(raise_on_limit);
        Ok(patched)
    }
}
