//! Rule application engine
//!
//! Applies the four mutation verbs to a target — a header map or a JSON
//! body — in a fixed order:
//!
//! 1. `add`: assign, overriding existing entries.
//! 2. `replace`: assign only where the key already exists (or was just
//!    added).
//! 3. `default` (bodies only): assign only where the key is absent.
//! 4. `remove`: delete, unless the same key was just added or replaced.
//!
//! Rule values run through the expression evaluator; a failing expression
//! skips that one key and the rest of the rules still apply.

use serde_json::{Map, Value};

use crate::config::{LayerRules, ModificationRules};
use crate::expr::{render_template, RequestContext};

#[cfg(test)]
mod tests;

/// Key of the fan-out wrapper recognized after body rule application.
pub const MULTI_EVENTS_KEY: &str = "__multi_events";

// ─────────────────────────────────────────────────────────────────────────────
// Verb application
// ─────────────────────────────────────────────────────────────────────────────

/// Apply body rules, returning the new body after the post-clean scrub.
///
/// If applying the verbs produced an object wrapping a `__multi_events`
/// array, the array itself is returned (one input event fanned out into
/// several; an empty array means emit nothing).
pub fn apply_body_rules(body: &Value, rules: &ModificationRules, ctx: &RequestContext) -> Value {
    let mut out = body.clone();

    {
        let target = match out.as_object_mut() {
            Some(map) => map,
            None => return out,
        };

        let mut touched: Vec<&str> = Vec::new();

        for (key, template) in &rules.add {
            match render_template(template, ctx) {
                Ok(value) => {
                    target.insert(key.clone(), value);
                    touched.push(key.as_str());
                }
                Err(e) => tracing::error!(key = %key, error = %e, "body add rule failed"),
            }
        }

        for (key, template) in &rules.replace {
            if !target.contains_key(key) && !touched.contains(&key.as_str()) {
                continue;
            }
            match render_template(template, ctx) {
                Ok(value) => {
                    target.insert(key.clone(), value);
                    touched.push(key.as_str());
                }
                Err(e) => tracing::error!(key = %key, error = %e, "body replace rule failed"),
            }
        }

        for (key, template) in &rules.default {
            if target.contains_key(key) {
                continue;
            }
            match render_template(template, ctx) {
                Ok(value) => {
                    target.insert(key.clone(), value);
                }
                Err(e) => tracing::error!(key = %key, error = %e, "body default rule failed"),
            }
        }

        for key in &rules.remove {
            if touched.contains(&key.as_str()) {
                continue;
            }
            target.remove(key);
        }
    }

    // Unwrap before the scrub: an empty fan-out array must survive as "emit
    // nothing", not fall back to emitting the wrapper object.
    let mut out = unwrap_multi_events(out);
    post_clean(&mut out);
    out
}

/// Apply header rules to a lowercase-keyed header map in place.
///
/// Header names are case-insensitive: rule keys are lowercased before
/// matching. The `default` verb is meaningless for headers and ignored.
pub fn apply_header_rules(
    headers: &mut Map<String, Value>,
    rules: &ModificationRules,
    ctx: &RequestContext,
) {
    let mut touched: Vec<String> = Vec::new();

    for (key, template) in &rules.add {
        let key = key.to_lowercase();
        match render_template(template, ctx) {
            Ok(value) => {
                headers.insert(key.clone(), stringify_header(value));
                touched.push(key);
            }
            Err(e) => tracing::error!(header = %key, error = %e, "header add rule failed"),
        }
    }

    for (key, template) in &rules.replace {
        let key = key.to_lowercase();
        if !headers.contains_key(&key) && !touched.contains(&key) {
            continue;
        }
        match render_template(template, ctx) {
            Ok(value) => {
                headers.insert(key.clone(), stringify_header(value));
                touched.push(key);
            }
            Err(e) => tracing::error!(header = %key, error = %e, "header replace rule failed"),
        }
    }

    for key in &rules.remove {
        let key = key.to_lowercase();
        if touched.contains(&key) {
            continue;
        }
        headers.remove(&key);
    }
}

fn stringify_header(value: Value) -> Value {
    match value {
        Value::String(_) => value,
        Value::Null => Value::String(String::new()),
        other => Value::String(other.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Deep merge
// ─────────────────────────────────────────────────────────────────────────────

/// Merge two rule sets, inner winning on key conflicts; `remove` lists are
/// concatenated and de-duplicated.
pub fn deep_merge(outer: &ModificationRules, inner: &ModificationRules) -> ModificationRules {
    let mut merged = ModificationRules {
        add: outer.add.clone(),
        replace: outer.replace.clone(),
        default: outer.default.clone(),
        remove: outer.remove.clone(),
    };

    for (key, value) in &inner.add {
        merged.add.insert(key.clone(), value.clone());
    }
    for (key, value) in &inner.replace {
        merged.replace.insert(key.clone(), value.clone());
    }
    for (key, value) in &inner.default {
        merged.default.insert(key.clone(), value.clone());
    }
    for key in &inner.remove {
        if !merged.remove.contains(key) {
            merged.remove.push(key.clone());
        }
    }

    merged
}

/// Merge two onion layers componentwise (headers with headers, body with
/// body), inner winning.
pub fn merge_layers(outer: &LayerRules, inner: &LayerRules) -> LayerRules {
    LayerRules {
        headers: merge_optional(&outer.headers, &inner.headers),
        body: merge_optional(&outer.body, &inner.body),
    }
}

fn merge_optional(
    outer: &Option<ModificationRules>,
    inner: &Option<ModificationRules>,
) -> Option<ModificationRules> {
    match (outer, inner) {
        (Some(o), Some(i)) => Some(deep_merge(o, i)),
        (Some(o), None) => Some(o.clone()),
        (None, Some(i)) => Some(i.clone()),
        (None, None) => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Post-clean
// ─────────────────────────────────────────────────────────────────────────────

/// Recursively scrub `null` and empty-string leaves, then drop objects and
/// arrays that became empty. The top-level container itself is kept even if
/// empty, so a fully-scrubbed body collapses to `{}`.
pub fn post_clean(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                post_clean(child);
            }
            map.retain(|_, v| !is_scrubbed(v));
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                post_clean(item);
            }
            items.retain(|v| !is_scrubbed(v));
        }
        _ => {}
    }
}

fn is_scrubbed(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Collapse the `__multi_events` wrapper: an object whose only meaning is to
/// carry an event array becomes the array itself.
fn unwrap_multi_events(value: Value) -> Value {
    match value {
        Value::Object(ref map) => match map.get(MULTI_EVENTS_KEY) {
            Some(Value::Array(events)) => Value::Array(events.clone()),
            _ => value,
        },
        other => other,
    }
}
