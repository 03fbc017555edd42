//! Transformer registry
//!
//! Built-in API-format transformers ship as data: each is an ordered list of
//! transformer entries (path rewrite + request rules + response rules)
//! embedded as JSON and parsed once on first use. Route and upstream configs
//! reference them by name; inline configs bypass the registry entirely.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::config::{TransformerConfig, TransformerRef};
use crate::util::cached_regex;


const ANTHROPIC_TO_OPENAI: &str = include_str!("assets/anthropic_to_openai.json");
const ANTHROPIC_TO_GEMINI: &str = include_str!("assets/anthropic_to_gemini.json");

fn builtins() -> &'static HashMap<&'static str, Vec<TransformerConfig>> {
    static REGISTRY: OnceLock<HashMap<&'static str, Vec<TransformerConfig>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = HashMap::new();
        registry.insert(
            "anthropic-to-openai",
            parse_asset("anthropic-to-openai", ANTHROPIC_TO_OPENAI),
        );
        registry.insert(
            "anthropic-to-gemini",
            parse_asset("anthropic-to-gemini", ANTHROPIC_TO_GEMINI),
        );
        registry
    })
}

fn parse_asset(name: &str, raw: &str) -> Vec<TransformerConfig> {
    // Assets are compiled into the binary; a parse failure is a build defect,
    // not a runtime condition.
    serde_json::from_str(raw)
        .unwrap_or_else(|e| panic!("bundled transformer '{}' is invalid: {}", name, e))
}

/// Whether a name refers to a bundled transformer.
pub fn is_builtin(name: &str) -> bool {
    builtins().contains_key(name)
}

/// Resolve a transformer reference to its ordered entry list.
///
/// Returns `None` for unknown names; config validation rejects those before
/// a worker ever serves traffic, so a miss here is only reachable when a
/// route slipped past validation.
pub fn resolve(reference: &TransformerRef) -> Option<Vec<&TransformerConfig>> {
    match reference {
        TransformerRef::Named(name) => {
            Some(builtins().get(name.as_str())?.iter().collect())
        }
        TransformerRef::Inline(config) => Some(vec![config.as_ref()]),
        TransformerRef::List(configs) => Some(configs.iter().collect()),
    }
}

/// Select the first entry whose path pattern matches the current pathname.
pub fn select<'a>(
    entries: &[&'a TransformerConfig],
    pathname: &str,
) -> Option<&'a TransformerConfig> {
    entries.iter().copied().find(|entry| {
        match cached_regex(&entry.path.pattern) {
            Ok(re) => re.is_match(pathname),
            Err(e) => {
                tracing::error!(
                    pattern = %entry.path.pattern,
                    error = %e,
                    "transformer path pattern does not compile"
                );
                false
            }
        }
    })
}
