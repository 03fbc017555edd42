//! Configuration for the proxy
//!
//! Two layers of configuration exist:
//!
//! 1. The **config document** (`Config`): a JSON file describing routes,
//!    upstreams, and mutation rules. Loaded at worker startup and re-validated
//!    by the supervisor on every reload.
//! 2. **Runtime settings** (`Settings`): listener port, worker count, log
//!    level, body size limit. Resolved with precedence:
//!    environment variable > config field > built-in default.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;

mod loader;
mod rewrite;
mod settings;
mod validation;

#[cfg(test)]
mod tests;

pub use loader::{load_config, parse_config, resolve_config_path};
pub use rewrite::PathRewrite;
pub use settings::{Role, Settings};
pub use validation::{validate, ConfigError};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Config document
// ─────────────────────────────────────────────────────────────────────────────

/// Root of the config document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Maximum accepted request body size, as a size string ("1mb", "50mb").
    pub body_parser_limit: Option<String>,

    /// Ordered route table. First prefix match wins.
    pub routes: Vec<RouteConfig>,
}

/// A single route: a URL path prefix plus its rules and upstream pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    /// URL path prefix this route matches.
    pub path: String,

    /// Regex rewrites applied to the request path, first match wins.
    #[serde(default)]
    pub path_rewrite: Option<PathRewrite>,

    /// Transformer applied to requests on this route. Upstream-level
    /// transformers override this.
    #[serde(default)]
    pub transformer: Option<TransformerRef>,

    /// Route-layer header rules.
    #[serde(default)]
    pub headers: Option<ModificationRules>,

    /// Route-layer body rules.
    #[serde(default)]
    pub body: Option<ModificationRules>,

    /// Upstream pool, in declaration order.
    pub upstreams: Vec<UpstreamConfig>,

    /// Failover behavior for this route.
    #[serde(default)]
    pub failover: FailoverConfig,

    /// Recovery probe behavior for unhealthy upstreams.
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

/// A single upstream target with selection metadata and per-upstream rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Absolute base URL (http or https), optionally with a base path.
    pub target: String,

    /// Relative selection weight within a priority group.
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Priority group; lower is tried first.
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Transformer override for this upstream.
    #[serde(default)]
    pub transformer: Option<TransformerRef>,

    /// Upstream-layer header rules.
    #[serde(default)]
    pub headers: Option<ModificationRules>,

    /// Upstream-layer body rules.
    #[serde(default)]
    pub body: Option<ModificationRules>,
}

fn default_weight() -> f64 {
    100.0
}

fn default_priority() -> u32 {
    1
}

/// Failover settings for a route.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailoverConfig {
    /// When true, upstream health is tracked across requests and failed
    /// upstreams are skipped until a recovery probe succeeds.
    pub enabled: bool,

    /// Response status codes treated the same as a transport failure.
    pub retryable_status_codes: Vec<u16>,
}

/// Recovery probe settings for a route.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    pub enabled: bool,

    /// Minimum seconds between probe dispatches for one target.
    pub interval_seconds: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Modification rules
// ─────────────────────────────────────────────────────────────────────────────

/// The four mutation verbs applied to a header map or JSON body.
///
/// Values may contain `{{ … }}` expressions, evaluated against the request
/// context at application time. `default` only makes sense for bodies
/// (headers have no notion of a present-but-undefined key) and is ignored for
/// header targets.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModificationRules {
    /// Set these keys unconditionally.
    pub add: Map<String, Value>,

    /// Set these keys only where the key already exists (or was just added).
    pub replace: Map<String, Value>,

    /// Set these keys only where the key is currently absent.
    pub default: Map<String, Value>,

    /// Delete these keys, unless the same key was just added or replaced.
    pub remove: Vec<String>,
}

impl ModificationRules {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty()
            && self.replace.is_empty()
            && self.default.is_empty()
            && self.remove.is_empty()
    }
}

/// One layer of the onion: header rules plus body rules.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LayerRules {
    pub headers: Option<ModificationRules>,
    pub body: Option<ModificationRules>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Transformers
// ─────────────────────────────────────────────────────────────────────────────

/// Reference to transformer rules: a registry name, one inline config, or an
/// ordered list of configs.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TransformerRef {
    Named(String),
    Inline(Box<TransformerConfig>),
    List(Vec<TransformerConfig>),
}

/// One transformer entry: a path rewrite plus request and response rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerConfig {
    pub path: PathTransform,

    /// Request-side rules (headers and body).
    #[serde(default)]
    pub request: Option<LayerRules>,

    /// Response rules, matched in order against the upstream status.
    #[serde(default)]
    pub response: Vec<ResponseRule>,
}

/// Path rewrite carried by a transformer. The `replace` string may contain
/// `{{ … }}` expressions.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathTransform {
    #[serde(default = "default_path_action")]
    pub action: String,

    #[serde(rename = "match")]
    pub pattern: String,

    pub replace: String,
}

fn default_path_action() -> String {
    "replace".to_string()
}

/// A response rule: a matcher plus the rules to apply when it matches.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRule {
    #[serde(rename = "match")]
    pub matcher: ResponseMatch,

    pub rules: ResponseRuleSet,
}

/// Matches an upstream response by status regex and optional header values.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMatch {
    /// Regex matched against the decimal status code ("^2..$", "200|201").
    pub status: String,

    /// Exact-value header requirements (names compared case-insensitively).
    #[serde(default)]
    pub headers: Option<Map<String, Value>>,
}

/// Rules applied to a matched response, split by delivery mode.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResponseRuleSet {
    /// Body rules for buffered (non-streaming) responses.
    pub default: Option<ModificationRules>,

    /// Rules for SSE responses.
    pub stream: Option<StreamRules>,
}

/// SSE rules come in two shapes: a phase map (`start`/`chunk`/`end`) driving
/// the stream state machine, or a bare rules object applied to every event.
///
/// Mode detection is by key presence: any of the three phase keys selects
/// the state machine; everything else (including an empty object) is a
/// legacy chunk-only rule set.
#[derive(Debug, Clone)]
pub enum StreamRules {
    Phased(StreamTransformRules),
    Legacy(ModificationRules),
}

impl<'de> serde::Deserialize<'de> for StreamRules {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let value = Value::deserialize(deserializer)?;
        let phased = value
            .as_object()
            .map(|map| ["start", "chunk", "end"].iter().any(|k| map.contains_key(*k)))
            .unwrap_or(false);

        if phased {
            serde_json::from_value(value)
                .map(StreamRules::Phased)
                .map_err(D::Error::custom)
        } else {
            serde_json::from_value(value)
                .map(StreamRules::Legacy)
                .map_err(D::Error::custom)
        }
    }
}

/// Per-phase rules for the stream state machine.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamTransformRules {
    pub start: Option<ModificationRules>,
    pub chunk: Option<ModificationRules>,
    pub end: Option<ModificationRules>,
}

impl fmt::Display for TransformerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformerRef::Named(name) => write!(f, "{}", name),
            TransformerRef::Inline(_) => write!(f, "<inline>"),
            TransformerRef::List(list) => write!(f, "<inline x{}>", list.len()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Size strings
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a size string ("1mb", "512kb", "50MB", "1048576") into bytes.
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let lower = s.to_ascii_lowercase();
    let (digits, multiplier) = if let Some(n) = lower.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = lower.strip_suffix('b') {
        (n, 1)
    } else {
        (lower.as_str(), 1)
    };

    let value: f64 = digits.trim().parse().ok()?;
    if value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as usize)
}
