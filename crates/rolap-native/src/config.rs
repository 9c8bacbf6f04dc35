use crate::error::{NativeError, NativeResult};
use serde::Deserialize;

/// What to do when a construct cannot be evaluated natively.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Fall back to in-memory evaluation silently.
    #[default]
    Off,
    /// Fall back, logging a warning and notifying the observer once per expression.
    Warn,
    /// Fail the evaluation with [`NativeError::NativeEvaluationUnsupported`].
    Error,
}

impl AlertLevel {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "false" => Some(AlertLevel::Off),
            "warn" | "warning" => Some(AlertLevel::Warn),
            "error" => Some(AlertLevel::Error),
            _ => None,
        }
    }
}

/// Feature flags and limits for native evaluation and cell loading.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    pub enable_native_crossjoin: bool,
    pub enable_native_filter: bool,
    pub enable_native_topcount: bool,
    /// Single-argument member sets (`Level.Members`, `Children`, `Descendants`, ranges).
    pub enable_native_members: bool,
    /// Materialize small non-native arguments in memory and use them as member lists.
    pub expand_non_native: bool,
    /// Largest member list that may be inlined into a SQL constraint.
    pub max_constraints: usize,
    /// Maximum rows a native set or a cell batch may return; `0` disables the limit.
    pub result_limit: u64,
    pub alert_native_unsupported: AlertLevel,
    pub use_aggregates: bool,
    /// Measure `approxRowCount` with `SELECT COUNT(*)` when an aggregate table doesn't declare it.
    pub read_aggregate_row_counts: bool,
    /// Load independent batches concurrently (requires the `parallel` feature).
    pub parallel_batches: bool,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            enable_native_crossjoin: true,
            enable_native_filter: true,
            enable_native_topcount: true,
            enable_native_members: true,
            expand_non_native: false,
            max_constraints: 1000,
            result_limit: 0,
            alert_native_unsupported: AlertLevel::Off,
            use_aggregates: false,
            read_aggregate_row_counts: true,
            parallel_batches: true,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> NativeResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(NativeError::Config(format!("{key}: expected a boolean, got {value:?}"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> NativeResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| NativeError::Config(format!("{key}: expected a number, got {value:?}")))
}

impl NativeConfig {
    /// Build a config from dotted key/value properties, starting from the defaults.
    ///
    /// Unknown keys are ignored; malformed values are rejected.
    pub fn from_properties<'a>(
        properties: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> NativeResult<Self> {
        let mut config = Self::default();
        for (key, value) in properties {
            match key {
                "rolap.native.crossjoin.enable" => {
                    config.enable_native_crossjoin = parse_bool(key, value)?
                }
                "rolap.native.filter.enable" => config.enable_native_filter = parse_bool(key, value)?,
                "rolap.native.topcount.enable" => {
                    config.enable_native_topcount = parse_bool(key, value)?
                }
                "rolap.native.members.enable" => {
                    config.enable_native_members = parse_bool(key, value)?
                }
                "rolap.native.expandNonNative" => config.expand_non_native = parse_bool(key, value)?,
                "rolap.rolap.maxConstraints" => config.max_constraints = parse_number(key, value)?,
                "rolap.resultLimit" => config.result_limit = parse_number(key, value)?,
                "rolap.native.unsupported.alert" => {
                    config.alert_native_unsupported = AlertLevel::parse(value).ok_or_else(|| {
                        NativeError::Config(format!("{key}: expected OFF, WARN or ERROR, got {value:?}"))
                    })?
                }
                "rolap.aggregates.use" => config.use_aggregates = parse_bool(key, value)?,
                "rolap.aggregates.readRowCounts" => {
                    config.read_aggregate_row_counts = parse_bool(key, value)?
                }
                "rolap.batches.parallel" => config.parallel_batches = parse_bool(key, value)?,
                _ => log::debug!("ignoring unknown property {key}"),
            }
        }
        Ok(config)
    }

    pub(crate) fn limit(&self) -> Option<u64> {
        (self.result_limit > 0).then_some(self.result_limit)
    }
}
