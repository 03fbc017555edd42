//! Rule engine tests

use serde_json::{json, Map, Value};

use super::*;
use crate::config::ModificationRules;
use crate::expr::RequestContext;

fn ctx_with_body(body: Value) -> RequestContext {
    RequestContext::new(
        &Map::new(),
        body,
        "/api/x",
        "",
        "localhost:8088",
        "http",
        "POST",
    )
}

fn rules(json: Value) -> ModificationRules {
    serde_json::from_value(json).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Verbs on bodies
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn add_overrides_existing() {
    let body = json!({ "model": "old" });
    let out = apply_body_rules(
        &body,
        &rules(json!({ "add": { "model": "new", "extra": 1 } })),
        &ctx_with_body(body.clone()),
    );
    assert_eq!(out, json!({ "model": "new", "extra": 1 }));
}

#[test]
fn replace_only_touches_present_keys() {
    let body = json!({ "present": 1 });
    let out = apply_body_rules(
        &body,
        &rules(json!({ "replace": { "present": 2, "absent": 3 } })),
        &ctx_with_body(body.clone()),
    );
    assert_eq!(out, json!({ "present": 2 }));
}

#[test]
fn replace_applies_to_just_added_keys() {
    let body = json!({});
    let out = apply_body_rules(
        &body,
        &rules(json!({ "add": { "k": 1 }, "replace": { "k": 2 } })),
        &ctx_with_body(body.clone()),
    );
    assert_eq!(out, json!({ "k": 2 }));
}

#[test]
fn default_only_fills_absent_keys() {
    let body = json!({ "set": "keep" });
    let out = apply_body_rules(
        &body,
        &rules(json!({ "default": { "set": "clobber", "unset": "fill" } })),
        &ctx_with_body(body.clone()),
    );
    assert_eq!(out, json!({ "set": "keep", "unset": "fill" }));
}

#[test]
fn remove_unless_added_or_replaced() {
    let body = json!({ "a": 1, "b": 2, "c": 3 });
    let out = apply_body_rules(
        &body,
        &rules(json!({
            "add": { "a": 10 },
            "replace": { "b": 20 },
            "remove": ["a", "b", "c"]
        })),
        &ctx_with_body(body.clone()),
    );
    assert_eq!(out, json!({ "a": 10, "b": 20 }));
}

#[test]
fn expressions_see_the_context_body() {
    let body = json!({ "max_tokens_to_sample": 1024 });
    let out = apply_body_rules(
        &body,
        &rules(json!({
            "add": { "max_tokens": "{{ body.max_tokens_to_sample }}" },
            "remove": ["max_tokens_to_sample"]
        })),
        &ctx_with_body(body.clone()),
    );
    assert_eq!(out, json!({ "max_tokens": 1024 }));
}

#[test]
fn failing_expression_skips_only_that_key() {
    let body = json!({});
    let out = apply_body_rules(
        &body,
        &rules(json!({
            "add": {
                "broken": "{{ unknownIdentifier }}",
                "fine": "{{ 1 + 1 }}"
            }
        })),
        &ctx_with_body(body.clone()),
    );
    assert_eq!(out, json!({ "fine": 2 }));
}

#[test]
fn non_object_bodies_pass_through() {
    let body = json!([1, 2, 3]);
    let out = apply_body_rules(
        &body,
        &rules(json!({ "add": { "k": 1 } })),
        &ctx_with_body(json!({})),
    );
    assert_eq!(out, json!([1, 2, 3]));
}

// ─────────────────────────────────────────────────────────────────────────────
// Verbs on headers
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn header_keys_are_case_insensitive() {
    let mut headers: Map<String, Value> = Map::new();
    headers.insert("x-existing".to_string(), json!("old"));

    let ctx = ctx_with_body(json!({}));
    apply_header_rules(
        &mut headers,
        &rules(json!({
            "add": { "X-New": "v" },
            "replace": { "X-EXISTING": "new" },
            "remove": ["X-New"]
        })),
        &ctx,
    );

    // X-New survives remove because it was just added; names are lowercased.
    assert_eq!(headers.get("x-new"), Some(&json!("v")));
    assert_eq!(headers.get("x-existing"), Some(&json!("new")));
}

#[test]
fn header_values_are_stringified() {
    let mut headers = Map::new();
    let ctx = ctx_with_body(json!({}));
    apply_header_rules(
        &mut headers,
        &rules(json!({ "add": { "x-count": "{{ 40 + 2 }}" } })),
        &ctx,
    );
    assert_eq!(headers.get("x-count"), Some(&json!("42")));
}

// ─────────────────────────────────────────────────────────────────────────────
// Deep merge
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn merge_inner_wins_and_remove_dedupes() {
    let outer = rules(json!({
        "add": { "shared": "outer", "outer-only": 1 },
        "remove": ["a", "b"]
    }));
    let inner = rules(json!({
        "add": { "shared": "inner", "inner-only": 2 },
        "remove": ["b", "c"]
    }));

    let merged = deep_merge(&outer, &inner);
    assert_eq!(merged.add.get("shared"), Some(&json!("inner")));
    assert_eq!(merged.add.get("outer-only"), Some(&json!(1)));
    assert_eq!(merged.add.get("inner-only"), Some(&json!(2)));
    assert_eq!(merged.remove, vec!["a", "b", "c"]);
}

#[test]
fn merge_is_associative() {
    let a = rules(json!({ "add": { "k": "a", "x": 1 }, "remove": ["r1"] }));
    let b = rules(json!({ "add": { "k": "b", "y": 2 }, "remove": ["r2", "r1"] }));
    let c = rules(json!({ "add": { "k": "c", "z": 3 }, "remove": ["r3"] }));

    let left = deep_merge(&deep_merge(&a, &b), &c);
    let right = deep_merge(&a, &deep_merge(&b, &c));

    assert_eq!(left.add, right.add);
    let mut l = left.remove.clone();
    let mut r = right.remove.clone();
    l.sort();
    r.sort();
    assert_eq!(l, r);
}

// ─────────────────────────────────────────────────────────────────────────────
// Post-clean and fan-out
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn post_clean_scrubs_recursively() {
    let mut value = json!({
        "keep": 0,
        "flag": false,
        "null": null,
        "empty": "",
        "nested": { "inner": null },
        "list": [null, "", "x", {}],
        "emptied": { "a": { "b": null } }
    });
    post_clean(&mut value);
    assert_eq!(
        value,
        json!({ "keep": 0, "flag": false, "list": ["x"] })
    );
}

#[test]
fn post_clean_is_idempotent() {
    let mut once = json!({ "a": { "b": null }, "c": [""], "d": 1 });
    post_clean(&mut once);
    let mut twice = once.clone();
    post_clean(&mut twice);
    assert_eq!(once, twice);
}

#[test]
fn fully_scrubbed_body_collapses_to_empty_object() {
    let body = json!({ "a": null });
    let out = apply_body_rules(&body, &rules(json!({})), &ctx_with_body(body.clone()));
    assert_eq!(out, json!({}));
}

#[test]
fn multi_events_wrapper_becomes_array() {
    let body = json!({});
    let out = apply_body_rules(
        &body,
        &rules(json!({
            "add": {
                "__multi_events": "{{ [ { type: 'message_delta' }, { type: 'message_stop' } ] }}"
            }
        })),
        &ctx_with_body(body.clone()),
    );
    assert_eq!(
        out,
        json!([{ "type": "message_delta" }, { "type": "message_stop" }])
    );
}

#[test]
fn empty_multi_events_yields_empty_array() {
    let body = json!({ "payload": 1 });
    let out = apply_body_rules(
        &body,
        &rules(json!({ "add": { "__multi_events": "{{ [] }}" } })),
        &ctx_with_body(body.clone()),
    );
    // The wrapper wins over the rest of the object: emit nothing.
    assert_eq!(out, json!([]));
}
