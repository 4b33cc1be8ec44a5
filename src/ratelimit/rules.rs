//! Rate limit rule definitions, validation and loading.
//!
//! A [`Rule`] is a validated algorithm instance. Rules are deserialized
//! through [`RuleConfig`], which accepts compact period notation for every
//! duration, so a YAML rule file reads like:
//!
//! ```yaml
//! rules:
//!   - id: api
//!     type: token_bucket
//!     capacity: 100
//!     inflow_quantity_per_unit: 10
//!     inflow_unit: 1s
//!     lock_seconds: 30
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::alignment::StartAlignment;
use super::notation::{format_period, parse_period};
use crate::error::{Result, SluiceError};

/// Largest capacity, quantity or threshold a rule accepts. Counts up to
/// this bound stay exact as Lua numbers in the Redis scripts.
pub const MAX_QUANTITY: i64 = 1 << 53;

/// Longest penalty lock a rule accepts, one year.
pub const MAX_LOCK_SECONDS: u64 = 366 * 24 * 60 * 60;

/// Settings shared by every rule variant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleOptions {
    /// Identifier used to namespace this rule's counters
    pub id: Option<String>,
    /// Window start policy
    pub alignment: StartAlignment,
    /// Seconds a target stays locked after tripping this rule; 0 disables
    pub lock_seconds: u64,
    /// Whether a denial aborts the check with [`SluiceError::Throttled`]
    pub raise_on_limit: bool,
}

/// Token bucket: tokens flow in at a fixed rate, each request takes one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucketRule {
    capacity: i64,
    inflow_quantity_per_unit: i64,
    inflow_unit: Duration,
    options: RuleOptions,
}

impl TokenBucketRule {
    /// Create a new token bucket rule.
    pub fn new(capacity: i64, inflow_quantity_per_unit: i64, inflow_unit: Duration) -> Result<Self> {
        at_least_one(capacity, "capacity")?;
        at_least_one(inflow_quantity_per_unit, "inflow quantity per unit")?;
        whole_millis(inflow_unit, "inflow unit")?;
        Ok(Self {
            capacity,
            inflow_quantity_per_unit,
            inflow_unit,
            options: RuleOptions::default(),
        })
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn inflow_quantity_per_unit(&self) -> i64 {
        self.inflow_quantity_per_unit
    }

    pub fn inflow_unit(&self) -> Duration {
        self.inflow_unit
    }

    pub(crate) fn inflow_unit_ms(&self) -> i64 {
        self.inflow_unit.as_millis() as i64
    }
}

/// Leaky bucket: requests queue up and drain at a fixed rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakyBucketRule {
    capacity: i64,
    outflow_quantity_per_unit: i64,
    outflow_unit: Duration,
    options: RuleOptions,
}

impl LeakyBucketRule {
    /// Create a new leaky bucket rule.
    pub fn new(capacity: i64, outflow_quantity_per_unit: i64, outflow_unit: Duration) -> Result<Self> {
        at_least_one(capacity, "capacity")?;
        at_least_one(outflow_quantity_per_unit, "outflow quantity per unit")?;
        whole_millis(outflow_unit, "outflow unit")?;
        Ok(Self {
            capacity,
            outflow_quantity_per_unit,
            outflow_unit,
            options: RuleOptions::default(),
        })
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn outflow_quantity_per_unit(&self) -> i64 {
        self.outflow_quantity_per_unit
    }

    pub fn outflow_unit(&self) -> Duration {
        self.outflow_unit
    }

    pub(crate) fn outflow_unit_ms(&self) -> i64 {
        self.outflow_unit.as_millis() as i64
    }
}

/// Fixed window: one counter that resets at the window boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindowRule {
    threshold: i64,
    window: Duration,
    options: RuleOptions,
}

impl FixedWindowRule {
    /// Create a new fixed window rule admitting `threshold` requests per `window`.
    pub fn new(threshold: i64, window: Duration) -> Result<Self> {
        non_negative(threshold, "threshold")?;
        whole_millis(window, "stat window")?;
        Ok(Self {
            threshold,
            window,
            options: RuleOptions::default(),
        })
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub(crate) fn window_ms(&self) -> i64 {
        self.window.as_millis() as i64
    }
}

/// Sliding window: the window is split into equal sub-periods whose counts
/// are summed on every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindowRule {
    threshold: i64,
    window: Duration,
    sub_period: Duration,
    sub_period_count: i64,
    options: RuleOptions,
}

impl SlidingWindowRule {
    /// Create a new sliding window rule.
    ///
    /// `window` must be an exact multiple of `sub_period`.
    pub fn new(threshold: i64, window: Duration, sub_period: Duration) -> Result<Self> {
        non_negative(threshold, "threshold")?;
        let window_ms = whole_millis(window, "stat window")?;
        let sub_period_ms = whole_millis(sub_period, "stat period")?;
        if window_ms % sub_period_ms != 0 {
            return Err(SluiceError::Config(format!(
                "the stat window ({}ms) must be an integral multiple of the stat period ({}ms)",
                window_ms, sub_period_ms
            )));
        }
        Ok(Self {
            threshold,
            window,
            sub_period,
            sub_period_count: window_ms / sub_period_ms,
            options: RuleOptions::default(),
        })
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn sub_period(&self) -> Duration {
        self.sub_period
    }

    /// Number of sub-periods in the window, fixed at construction.
    pub fn sub_period_count(&self) -> i64 {
        self.sub_period_count
    }

    pub(crate) fn window_ms(&self) -> i64 {
        self.window.as_millis() as i64
    }

    pub(crate) fn sub_period_ms(&self) -> i64 {
        self.sub_period.as_millis() as i64
    }
}

/// A validated rate limit rule, tagged by algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RuleConfig", into = "RuleConfig")]
pub enum Rule {
    TokenBucket(TokenBucketRule),
    LeakyBucket(LeakyBucketRule),
    FixedWindow(FixedWindowRule),
    SlidingWindow(SlidingWindowRule),
}

/// Algorithm tag of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    TokenBucket,
    LeakyBucket,
    FixedWindow,
    SlidingWindow,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::TokenBucket => "token_bucket",
            RuleKind::LeakyBucket => "leaky_bucket",
            RuleKind::FixedWindow => "fixed_window",
            RuleKind::SlidingWindow => "sliding_window",
        }
    }
}

impl Rule {
    pub fn kind(&self) -> RuleKind {
        match self {
            Rule::TokenBucket(_) => RuleKind::TokenBucket,
            Rule::LeakyBucket(_) => RuleKind::LeakyBucket,
            Rule::FixedWindow(_) => RuleKind::FixedWindow,
            Rule::SlidingWindow(_) => RuleKind::SlidingWindow,
        }
    }

    pub fn options(&self) -> &RuleOptions {
        match self {
            Rule::TokenBucket(r) => &r.options,
            Rule::LeakyBucket(r) => &r.options,
            Rule::FixedWindow(r) => &r.options,
            Rule::SlidingWindow(r) => &r.options,
        }
    }

    fn options_mut(&mut self) -> &mut RuleOptions {
        match self {
            Rule::TokenBucket(r) => &mut r.options,
            Rule::LeakyBucket(r) => &mut r.options,
            Rule::FixedWindow(r) => &mut r.options,
            Rule::SlidingWindow(r) => &mut r.options,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.options().id.as_deref()
    }

    /// The rule id, or the algorithm name when no id is configured.
    pub fn name(&self) -> &str {
        self.id().unwrap_or_else(|| self.kind().as_str())
    }

    pub fn alignment(&self) -> StartAlignment {
        self.options().alignment
    }

    pub fn lock_seconds(&self) -> u64 {
        self.options().lock_seconds
    }

    pub fn raise_on_limit(&self) -> bool {
        self.options().raise_on_limit
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.options_mut().id = Some(id.into());
        self
    }

    pub fn with_alignment(mut self, alignment: StartAlignment) -> Self {
        self.options_mut().alignment = alignment;
        self
    }

    /// Lock a target for `lock_seconds` after it trips this rule, capped
    /// at [`MAX_LOCK_SECONDS`].
    pub fn with_lock_seconds(mut self, lock_seconds: u64) -> Self {
        self.options_mut().lock_seconds = lock_seconds.min(MAX_LOCK_SECONDS);
        self
    }

    pub fn with_raise_on_limit(mut self, raise_on_limit: bool) -> Self {
        self.options_mut().raise_on_limit = raise_on_limit;
        self
    }

    pub(crate) fn set_raise_on_limit(&mut self, raise_on_limit: bool) {
        self.options_mut().raise_on_limit = raise_on_limit;
    }

    pub(crate) fn set_options(&mut self, options: RuleOptions) {
        *self.options_mut() = options;
    }
}

impl From<TokenBucketRule> for Rule {
    fn from(rule: TokenBucketRule) -> Self {
        Rule::TokenBucket(rule)
    }
}

impl From<LeakyBucketRule> for Rule {
    fn from(rule: LeakyBucketRule) -> Self {
        Rule::LeakyBucket(rule)
    }
}

impl From<FixedWindowRule> for Rule {
    fn from(rule: FixedWindowRule) -> Self {
        Rule::FixedWindow(rule)
    }
}

impl From<SlidingWindowRule> for Rule {
    fn from(rule: SlidingWindowRule) -> Self {
        Rule::SlidingWindow(rule)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::TokenBucket(r) => write!(
                f,
                "{} (token bucket: capacity {}, {} per {})",
                self.name(),
                r.capacity,
                r.inflow_quantity_per_unit,
                format_period(r.inflow_unit)
            ),
            Rule::LeakyBucket(r) => write!(
                f,
                "{} (leaky bucket: capacity {}, {} per {})",
                self.name(),
                r.capacity,
                r.outflow_quantity_per_unit,
                format_period(r.outflow_unit)
            ),
            Rule::FixedWindow(r) => write!(
                f,
                "{} (fixed window: {} per {})",
                self.name(),
                r.threshold,
                format_period(r.window)
            ),
            Rule::SlidingWindow(r) => write!(
                f,
                "{} (sliding window: {} per {} in {} periods)",
                self.name(),
                r.threshold,
                format_period(r.window),
                r.sub_period_count
            ),
        }
    }
}

/// A duration written either as period notation (`"10s"`) or as plain
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeriodValue {
    Millis(u64),
    Notation(String),
}

impl PeriodValue {
    pub fn to_duration(&self) -> Result<Duration> {
        match self {
            PeriodValue::Millis(ms) => Ok(Duration::from_millis(*ms)),
            PeriodValue::Notation(notation) => parse_period(notation),
        }
    }
}

impl From<Duration> for PeriodValue {
    fn from(period: Duration) -> Self {
        if period.as_millis() % 1_000 == 0 {
            PeriodValue::Notation(format_period(period))
        } else {
            PeriodValue::Millis(period.as_millis() as u64)
        }
    }
}

/// Serialized form of a [`Rule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub alignment: StartAlignment,
    #[serde(default)]
    pub lock_seconds: u64,
    #[serde(default)]
    pub raise_on_limit: bool,
    #[serde(flatten)]
    pub algorithm: AlgorithmConfig,
}

/// Algorithm-specific parameters of a [`RuleConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    TokenBucket {
        capacity: i64,
        inflow_quantity_per_unit: i64,
        inflow_unit: PeriodValue,
    },
    LeakyBucket {
        capacity: i64,
        outflow_quantity_per_unit: i64,
        outflow_unit: PeriodValue,
    },
    FixedWindow {
        threshold: i64,
        window: PeriodValue,
    },
    SlidingWindow {
        threshold: i64,
        window: PeriodValue,
        sub_period: PeriodValue,
    },
}

impl TryFrom<RuleConfig> for Rule {
    type Error = SluiceError;

    fn try_from(config: RuleConfig) -> Result<Self> {
        let mut rule: Rule = match config.algorithm {
            AlgorithmConfig::TokenBucket {
                capacity,
                inflow_quantity_per_unit,
                inflow_unit,
            } => TokenBucketRule::new(capacity, inflow_quantity_per_unit, inflow_unit.to_duration()?)?
                .into(),
            AlgorithmConfig::LeakyBucket {
                capacity,
                outflow_quantity_per_unit,
                outflow_unit,
            } => LeakyBucketRule::new(capacity, outflow_quantity_per_unit, outflow_unit.to_duration()?)?
                .into(),
            AlgorithmConfig::FixedWindow { threshold, window } => {
                FixedWindowRule::new(threshold, window.to_duration()?)?.into()
            }
            AlgorithmConfig::SlidingWindow {
                threshold,
                window,
                sub_period,
            } => SlidingWindowRule::new(threshold, window.to_duration()?, sub_period.to_duration()?)?
                .into(),
        };
        if config.lock_seconds > MAX_LOCK_SECONDS {
            return Err(SluiceError::Config(format!(
                "the lock seconds can not be more than {}",
                MAX_LOCK_SECONDS
            )));
        }
        rule.set_options(RuleOptions {
            id: config.id,
            alignment: config.alignment,
            lock_seconds: config.lock_seconds,
            raise_on_limit: config.raise_on_limit,
        });
        Ok(rule)
    }
}

impl From<Rule> for RuleConfig {
    fn from(rule: Rule) -> Self {
        let options = rule.options().clone();
        let algorithm = match rule {
            Rule::TokenBucket(r) => AlgorithmConfig::TokenBucket {
                capacity: r.capacity,
                inflow_quantity_per_unit: r.inflow_quantity_per_unit,
                inflow_unit: r.inflow_unit.into(),
            },
            Rule::LeakyBucket(r) => AlgorithmConfig::LeakyBucket {
                capacity: r.capacity,
                outflow_quantity_per_unit: r.outflow_quantity_per_unit,
                outflow_unit: r.outflow_unit.into(),
            },
            Rule::FixedWindow(r) => AlgorithmConfig::FixedWindow {
                threshold: r.threshold,
                window: r.window.into(),
            },
            Rule::SlidingWindow(r) => AlgorithmConfig::SlidingWindow {
                threshold: r.threshold,
                window: r.window.into(),
                sub_period: r.sub_period.into(),
            },
        };
        RuleConfig {
            id: options.id,
            alignment: options.alignment,
            lock_seconds: options.lock_seconds,
            raise_on_limit: options.raise_on_limit,
            algorithm,
        }
    }
}

/// An ordered list of rules loaded from a rule file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a `rules:` mapping or a bare list of rules.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(rules) = serde_yaml::from_str::<Vec<Rule>>(yaml) {
            return Ok(Self { rules });
        }

        serde_yaml::from_str(yaml)
            .map_err(|e| SluiceError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    pub fn into_rules(self) -> Vec<Rule> {
        self.rules
    }
}

fn at_least_one(value: i64, what: &str) -> Result<()> {
    if value < 1 {
        return Err(SluiceError::Config(format!("the {} can not be less than 1", what)));
    }
    at_most_max(value, what)
}

fn non_negative(value: i64, what: &str) -> Result<()> {
    if value < 0 {
        return Err(SluiceError::Config(format!("the {} can not be negative", what)));
    }
    at_most_max(value, what)
}

fn at_most_max(value: i64, what: &str) -> Result<()> {
    if value > MAX_QUANTITY {
        return Err(SluiceError::Config(format!(
            "the {} can not be more than {}",
            what, MAX_QUANTITY
        )));
    }
    Ok(())
}

fn whole_millis(period: Duration, what: &str) -> Result<i64> {
    let millis = period.as_millis();
    if millis < 1 {
        return Err(SluiceError::Config(format!("the {} can not be less than 1ms", what)));
    }
    if period.subsec_nanos() % 1_000_000 != 0 {
        return Err(SluiceError::Config(format!(
            "the {} must be a whole number of milliseconds",
            what
        )));
    }
    match i64::try_from(millis) {
        Ok(millis) if millis <= MAX_QUANTITY => Ok(millis),
        _ => Err(SluiceError::Config(format!("the {} is too long", what))),
    }
}
