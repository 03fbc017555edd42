//! Configuration tests

use super::*;

fn sample_document() -> &'static str {
    r#"{
        "bodyParserLimit": "50mb",
        "routes": [
            {
                "path": "/v1/anthropic-proxy",
                "pathRewrite": { "^/v1/anthropic-proxy": "/v1" },
                "transformer": "anthropic-to-openai",
                "headers": {
                    "add": { "X-Proxied-By": "bungee" },
                    "remove": ["X-Internal"]
                },
                "upstreams": [
                    {
                        "target": "https://api.openai.com/v1",
                        "weight": 80,
                        "headers": { "add": { "Authorization": "Bearer {{ env.OPENAI_KEY }}" } }
                    },
                    {
                        "target": "https://backup.example.com",
                        "weight": 20,
                        "priority": 2
                    }
                ],
                "failover": { "enabled": true, "retryableStatusCodes": [500, 502, 503] },
                "healthCheck": { "enabled": true, "intervalSeconds": 15 }
            }
        ]
    }"#
}

#[test]
fn parses_full_document() {
    let config: Config = serde_json::from_str(sample_document()).unwrap();
    assert_eq!(config.body_parser_limit.as_deref(), Some("50mb"));
    assert_eq!(config.routes.len(), 1);

    let route = &config.routes[0];
    assert_eq!(route.path, "/v1/anthropic-proxy");
    assert!(matches!(
        route.transformer,
        Some(TransformerRef::Named(ref n)) if n == "anthropic-to-openai"
    ));
    assert_eq!(route.upstreams.len(), 2);
    assert_eq!(route.upstreams[0].weight, 80.0);
    assert_eq!(route.upstreams[0].priority, 1);
    assert_eq!(route.upstreams[1].priority, 2);
    assert!(route.failover.enabled);
    assert_eq!(route.failover.retryable_status_codes, vec![500, 502, 503]);
    assert_eq!(route.health_check.interval_seconds, 15);

    validate(&config).unwrap();
}

#[test]
fn upstream_defaults_apply() {
    let json = r#"{ "target": "http://localhost:9000" }"#;
    let upstream: UpstreamConfig = serde_json::from_str(json).unwrap();
    assert_eq!(upstream.weight, 100.0);
    assert_eq!(upstream.priority, 1);
    assert!(upstream.transformer.is_none());
}

#[test]
fn inline_transformer_parses() {
    let json = r#"{
        "path": { "action": "replace", "match": "^/v1/messages", "replace": "/v1/chat/completions" },
        "request": {
            "body": {
                "add": { "max_tokens": "{{ body.max_tokens_to_sample }}" },
                "remove": ["max_tokens_to_sample"]
            }
        },
        "response": [
            {
                "match": { "status": "^2..$" },
                "rules": {
                    "stream": {
                        "chunk": { "add": { "type": "content_block_delta" } },
                        "end": { "add": { "type": "message_stop" } }
                    }
                }
            }
        ]
    }"#;
    let config: TransformerConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.path.pattern, "^/v1/messages");
    let rules = &config.response[0].rules;
    match rules.stream.as_ref().unwrap() {
        StreamRules::Phased(phased) => {
            assert!(phased.start.is_none());
            assert!(phased.chunk.is_some());
            assert!(phased.end.is_some());
        }
        StreamRules::Legacy(_) => panic!("expected phased stream rules"),
    }
}

#[test]
fn bare_stream_rules_parse_as_legacy() {
    let json = r#"{ "stream": { "add": { "injected": true } } }"#;
    let rules: ResponseRuleSet = serde_json::from_str(json).unwrap();
    match rules.stream.as_ref().unwrap() {
        StreamRules::Legacy(legacy) => assert!(legacy.add.contains_key("injected")),
        StreamRules::Phased(_) => panic!("expected legacy stream rules"),
    }
}

#[test]
fn empty_stream_rules_are_legacy() {
    let json = r#"{ "stream": {} }"#;
    let rules: ResponseRuleSet = serde_json::from_str(json).unwrap();
    assert!(matches!(
        rules.stream.as_ref().unwrap(),
        StreamRules::Legacy(_)
    ));
}

#[test]
fn single_phase_key_selects_state_machine() {
    let json = r#"{ "stream": { "end": { "add": { "type": "message_stop" } } } }"#;
    let rules: ResponseRuleSet = serde_json::from_str(json).unwrap();
    assert!(matches!(
        rules.stream.as_ref().unwrap(),
        StreamRules::Phased(_)
    ));
}

#[test]
fn rejects_empty_routes() {
    let config: Config = serde_json::from_str(r#"{ "routes": [] }"#).unwrap();
    assert!(validate(&config).is_err());
}

#[test]
fn rejects_route_without_upstreams() {
    let json = r#"{ "routes": [ { "path": "/api", "upstreams": [] } ] }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    assert!(validate(&config).is_err());
}

#[test]
fn rejects_bad_target_scheme() {
    let json = r#"{ "routes": [ { "path": "/api", "upstreams": [ { "target": "ftp://files.example.com" } ] } ] }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    assert!(validate(&config).is_err());
}

#[test]
fn rejects_zero_weight() {
    let json = r#"{ "routes": [ { "path": "/api", "upstreams": [ { "target": "http://a.example.com", "weight": 0 } ] } ] }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    assert!(validate(&config).is_err());
}

#[test]
fn rejects_unknown_named_transformer() {
    let json = r#"{ "routes": [ {
        "path": "/api",
        "transformer": "does-not-exist",
        "upstreams": [ { "target": "http://a.example.com" } ]
    } ] }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    assert!(validate(&config).is_err());
}

#[test]
fn rejects_bad_rewrite_regex() {
    let json = r#"{ "routes": [ {
        "path": "/api",
        "pathRewrite": { "([unclosed": "/x" },
        "upstreams": [ { "target": "http://a.example.com" } ]
    } ] }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    assert!(validate(&config).is_err());
}

#[test]
fn size_strings() {
    assert_eq!(parse_size("1mb"), Some(1024 * 1024));
    assert_eq!(parse_size("50MB"), Some(50 * 1024 * 1024));
    assert_eq!(parse_size("512kb"), Some(512 * 1024));
    assert_eq!(parse_size("2gb"), Some(2 * 1024 * 1024 * 1024));
    assert_eq!(parse_size("1048576"), Some(1048576));
    assert_eq!(parse_size("100b"), Some(100));
    assert_eq!(parse_size("1.5mb"), Some((1.5 * 1024.0 * 1024.0) as usize));
    assert_eq!(parse_size("nope"), None);
    assert_eq!(parse_size(""), None);
}

#[test]
fn parse_config_validates_raw_text() {
    use std::path::Path;

    let config = parse_config(sample_document(), Path::new("inline.json")).unwrap();
    assert_eq!(config.routes.len(), 1);

    assert!(parse_config(r#"{ "routes": [] }"#, Path::new("inline.json")).is_err());
    assert!(matches!(
        parse_config("{ not json", Path::new("inline.json")),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn loader_reads_and_validates_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, sample_document()).unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.routes.len(), 1);

    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        load_config(&path),
        Err(ConfigError::Parse { .. })
    ));
}
