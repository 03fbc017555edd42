//! Pipeline unit tests
//!
//! The full forward path needs live sockets; these cover the deterministic
//! pieces: route matching, response rule matching, path splitting, and the
//! layered header onion.

use serde_json::{json, Map, Value};

use super::*;
use crate::config::{Config, ModificationRules};
use crate::expr::RequestContext;

fn routes() -> Config {
    serde_json::from_str(
        r#"{
            "routes": [
                { "path": "/api/v2", "upstreams": [ { "target": "http://v2.example.com" } ] },
                { "path": "/api", "upstreams": [ { "target": "http://v1.example.com" } ] },
                { "path": "/", "upstreams": [ { "target": "http://fallback.example.com" } ] }
            ]
        }"#,
    )
    .unwrap()
}

#[test]
fn route_match_is_first_prefix_wins() {
    let config = routes();
    assert_eq!(
        match_route(&config.routes, "/api/v2/things").unwrap().path,
        "/api/v2"
    );
    assert_eq!(match_route(&config.routes, "/api/other").unwrap().path, "/api");
    assert_eq!(match_route(&config.routes, "/anything").unwrap().path, "/");
}

#[test]
fn route_match_respects_declaration_order() {
    // With the catch-all first, nothing else is reachable.
    let config: Config = serde_json::from_str(
        r#"{
            "routes": [
                { "path": "/", "upstreams": [ { "target": "http://all.example.com" } ] },
                { "path": "/api", "upstreams": [ { "target": "http://api.example.com" } ] }
            ]
        }"#,
    )
    .unwrap();
    assert_eq!(match_route(&config.routes, "/api/x").unwrap().path, "/");
}

#[test]
fn no_route_matches_unknown_prefix() {
    let config: Config = serde_json::from_str(
        r#"{ "routes": [ { "path": "/api", "upstreams": [ { "target": "http://a.example.com" } ] } ] }"#,
    )
    .unwrap();
    assert!(match_route(&config.routes, "/other").is_none());
}

#[test]
fn response_rule_matches_status_regex_in_order() {
    let rules: Vec<crate::config::ResponseRule> = serde_json::from_value(json!([
        { "match": { "status": "^5.." }, "rules": { "default": { "add": { "which": "errors" } } } },
        { "match": { "status": "^2..$" }, "rules": { "default": { "add": { "which": "success" } } } },
        { "match": { "status": "." }, "rules": { "default": { "add": { "which": "any" } } } }
    ]))
    .unwrap();

    let headers = reqwest::header::HeaderMap::new();
    let pick = |status: u16| {
        find_response_rule(&rules, status, &headers)
            .unwrap()
            .rules
            .default
            .as_ref()
            .unwrap()
            .add["which"]
            .clone()
    };

    assert_eq!(pick(503), json!("errors"));
    assert_eq!(pick(200), json!("success"));
    assert_eq!(pick(301), json!("any"));
}

#[test]
fn response_rule_header_requirements_must_all_match() {
    let rules: Vec<crate::config::ResponseRule> = serde_json::from_value(json!([
        {
            "match": { "status": "^2..$", "headers": { "X-Kind": "special" } },
            "rules": { "default": { "add": { "which": "special" } } }
        }
    ]))
    .unwrap();

    let mut headers = reqwest::header::HeaderMap::new();
    assert!(find_response_rule(&rules, 200, &headers).is_none());

    headers.insert("x-kind", "special".parse().unwrap());
    assert!(find_response_rule(&rules, 200, &headers).is_some());
}

#[test]
fn path_and_search_split() {
    assert_eq!(
        split_path_and_search("/v1/chat/completions"),
        ("/v1/chat/completions".to_string(), None)
    );
    assert_eq!(
        split_path_and_search("/v1beta/models/gemini:streamGenerateContent?alt=sse"),
        (
            "/v1beta/models/gemini:streamGenerateContent".to_string(),
            Some("?alt=sse".to_string())
        )
    );
}

fn parts_with_body(raw: &[u8], is_json: bool) -> RequestParts {
    RequestParts {
        method: "POST".to_string(),
        pathname: "/api/x".to_string(),
        search: String::new(),
        client_host: "localhost".to_string(),
        header_map: Map::new(),
        raw_body: Bytes::copy_from_slice(raw),
        parsed_body: json!({}),
        is_json,
        wants_stream: false,
    }
}

#[test]
fn non_json_bodies_forward_unmutated_without_content_length() {
    let parts = parts_with_body(b"col1,col2\n1,2\n", false);
    let mut headers: Map<String, Value> = Map::new();
    headers.insert("content-length".to_string(), json!("14"));
    headers.insert("content-type".to_string(), json!("text/csv"));

    let out = finalize_body(&parts, &json!({}), &mut headers);

    assert_eq!(&out[..], b"col1,col2\n1,2\n");
    assert!(headers.get("content-length").is_none());
    assert_eq!(headers.get("content-type"), Some(&json!("text/csv")));
}

#[test]
fn empty_bodies_drop_content_length() {
    let parts = parts_with_body(b"", true);
    let mut headers: Map<String, Value> = Map::new();
    headers.insert("content-length".to_string(), json!("0"));

    let out = finalize_body(&parts, &json!({}), &mut headers);

    assert!(out.is_empty());
    assert!(headers.get("content-length").is_none());
}

#[test]
fn json_bodies_get_recomputed_content_length() {
    let parts = parts_with_body(b"{\"a\":1}", true);
    let mut headers: Map<String, Value> = Map::new();
    headers.insert("content-length".to_string(), json!("7"));

    let shaped = json!({ "a": 1, "b": "grew" });
    let out = finalize_body(&parts, &shaped, &mut headers);

    let expected = serde_json::to_vec(&shaped).unwrap();
    assert_eq!(&out[..], expected.as_slice());
    assert_eq!(
        headers.get("content-length"),
        Some(&json!(expected.len().to_string()))
    );
}

#[test]
fn header_onion_upstream_overrides_route() {
    let route_rules: ModificationRules = serde_json::from_value(json!({
        "add": { "X-Shared": "route", "X-Route": "route" }
    }))
    .unwrap();
    let upstream_rules: ModificationRules = serde_json::from_value(json!({
        "add": { "X-Shared": "up", "X-Up": "up" }
    }))
    .unwrap();

    let outer = merge_layers(
        &LayerRules {
            headers: Some(route_rules),
            body: None,
        },
        &LayerRules {
            headers: Some(upstream_rules),
            body: None,
        },
    );

    let ctx = RequestContext::new(
        &Map::new(),
        json!({}),
        "/api/x",
        "",
        "localhost",
        "http",
        "GET",
    );
    let mut headers: Map<String, Value> = Map::new();
    apply_header_rules(&mut headers, outer.headers.as_ref().unwrap(), &ctx);

    assert_eq!(headers.get("x-shared"), Some(&json!("up")));
    assert_eq!(headers.get("x-route"), Some(&json!("route")));
    assert_eq!(headers.get("x-up"), Some(&json!("up")));
}

#[test]
fn remove_unless_added_across_merged_layers() {
    let outer_rules: ModificationRules = serde_json::from_value(json!({
        "remove": ["x-keep", "x-drop"]
    }))
    .unwrap();
    let inner_rules: ModificationRules = serde_json::from_value(json!({
        "add": { "x-keep": "added" }
    }))
    .unwrap();
    let merged = deep_merge(&outer_rules, &inner_rules);

    let ctx = RequestContext::new(
        &Map::new(),
        json!({}),
        "/api/x",
        "",
        "localhost",
        "http",
        "GET",
    );
    let mut headers: Map<String, Value> = Map::new();
    headers.insert("x-drop".to_string(), json!("v"));
    headers.insert("x-keep".to_string(), json!("v"));
    apply_header_rules(&mut headers, &merged, &ctx);

    assert_eq!(headers.get("x-keep"), Some(&json!("added")));
    assert!(headers.get("x-drop").is_none());
}
