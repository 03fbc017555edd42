//! Expression evaluation tests

use serde_json::{json, Map, Value};

use super::*;

fn ctx() -> RequestContext {
    let mut headers = Map::new();
    headers.insert("x-api-key".to_string(), json!("secret-123"));
    headers.insert("content-type".to_string(), json!("application/json"));

    RequestContext::new(
        &headers,
        json!({
            "model": "claude-3-opus",
            "max_tokens_to_sample": 1024,
            "stream": true,
            "messages": [
                { "role": "user", "content": "hello" }
            ],
            "nested": { "a": { "b": 7 } }
        }),
        "/v1/messages",
        "?beta=true",
        "proxy.internal:8088",
        "http",
        "POST",
    )
}

fn eval(src: &str) -> Value {
    evaluate(src, &ctx()).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Context access
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn reads_context_roots() {
    assert_eq!(eval("method"), json!("POST"));
    assert_eq!(eval("url.pathname"), json!("/v1/messages"));
    assert_eq!(eval("headers['x-api-key']"), json!("secret-123"));
    assert_eq!(eval("body.model"), json!("claude-3-opus"));
    assert_eq!(eval("body.messages[0].role"), json!("user"));
    assert_eq!(eval("body.nested.a.b"), json!(7));
}

#[test]
fn missing_keys_are_null_but_null_access_errors() {
    assert_eq!(eval("body.missing"), Value::Null);
    assert_eq!(eval("body.missing?.deeper"), Value::Null);
    assert_eq!(eval("body.missing?.[0]"), Value::Null);
    assert!(evaluate("body.missing.deeper", &ctx()).is_err());
}

#[test]
fn unknown_identifier_errors() {
    assert!(matches!(
        evaluate("nonexistent", &ctx()),
        Err(ExprError::Eval(_))
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Operators
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn arithmetic_and_concat() {
    assert_eq!(eval("1 + 2 * 3"), json!(7));
    assert_eq!(eval("10 % 3"), json!(1));
    assert_eq!(eval("7 / 2"), json!(3.5));
    assert_eq!(eval("-body.max_tokens_to_sample"), json!(-1024));
    assert_eq!(eval("'v' + 1"), json!("v1"));
    assert_eq!(eval("body.model + '-latest'"), json!("claude-3-opus-latest"));
}

#[test]
fn comparisons_and_equality() {
    assert_eq!(eval("1 < 2"), json!(true));
    assert_eq!(eval("'abc' == 'abc'"), json!(true));
    assert_eq!(eval("1 == '1'"), json!(true));
    assert_eq!(eval("1 != '1'"), json!(false));
    assert_eq!(eval("body.max_tokens_to_sample >= 1024"), json!(true));
    assert_eq!(eval("body.stream === true"), json!(true));
    assert_eq!(eval("null == null"), json!(true));
}

#[test]
fn strict_equality_never_coerces() {
    assert_eq!(eval("1 === 1"), json!(true));
    assert_eq!(eval("1 === 1.0"), json!(true));
    assert_eq!(eval("1 === '1'"), json!(false));
    assert_eq!(eval("1 !== '1'"), json!(true));
    assert_eq!(eval("'a' !== 'a'"), json!(false));
    assert_eq!(eval("null === null"), json!(true));
    assert_eq!(eval("body.stream === 'true'"), json!(false));
}

#[test]
fn logical_and_nullish() {
    assert_eq!(eval("body.missing ?? 'fallback'"), json!("fallback"));
    assert_eq!(eval("body.model ?? 'fallback'"), json!("claude-3-opus"));
    assert_eq!(eval("false || 'right'"), json!("right"));
    assert_eq!(eval("'' || 'right'"), json!("right"));
    assert_eq!(eval("body.stream && body.model"), json!("claude-3-opus"));
    assert_eq!(eval("!body.stream"), json!(false));
}

#[test]
fn ternary() {
    assert_eq!(eval("body.stream ? 'sse' : 'json'"), json!("sse"));
    assert_eq!(
        eval("body.missing ? 'yes' : body.model"),
        json!("claude-3-opus")
    );
}

#[test]
fn literals() {
    assert_eq!(
        eval("{ role: 'system', budget: 1 + 1 }"),
        json!({ "role": "system", "budget": 2 })
    );
    assert_eq!(eval("[1, 'two', body.stream]"), json!([1, "two", true]));
    assert_eq!(eval("[]"), json!([]));
    assert_eq!(eval("{}"), json!({}));
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn text_helpers() {
    assert_eq!(eval("toUpperCase('abc')"), json!("ABC"));
    assert_eq!(eval("trim('  x  ')"), json!("x"));
    assert_eq!(eval("split('a,b,c', ',')"), json!(["a", "b", "c"]));
    assert_eq!(eval("replace('a-b', '-', '_')"), json!("a_b"));
    assert_eq!(eval("base64encode('hi')"), json!("aGk="));
    assert_eq!(eval("base64decode('aGk=')"), json!("hi"));
    assert_eq!(eval("encrypt('hi', 'base64')"), json!("aGk="));
}

#[test]
fn hash_helpers() {
    assert_eq!(
        eval("md5('abc')"),
        json!("900150983cd24fb0d6963f7d28e17f72")
    );
    assert_eq!(
        eval("sha256('abc')"),
        json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
    );
}

#[test]
fn uuid_shape_and_random_bounds() {
    let id = eval("uuid()");
    let id = id.as_str().unwrap();
    assert_eq!(id.len(), 36);
    assert_eq!(id.matches('-').count(), 4);

    for _ in 0..50 {
        let n = eval("randomInt(5, 10)").as_i64().unwrap();
        assert!((5..10).contains(&n));
    }
}

#[test]
fn json_helpers() {
    assert_eq!(eval("jsonParse('{\"a\": 1}')"), json!({"a": 1}));
    assert_eq!(eval("jsonStringify([1, 2])"), json!("[1,2]"));
}

#[test]
fn jwt_payload_decodes() {
    // header {"alg":"none"} . payload {"sub":"u1","admin":true} . empty sig
    let token = "eyJhbGciOiJub25lIn0.eyJzdWIiOiJ1MSIsImFkbWluIjp0cnVlfQ.";
    let src = format!("parseJWT('{}').sub", token);
    assert_eq!(evaluate(&src, &ctx()).unwrap(), json!("u1"));
}

#[test]
fn collection_helpers() {
    assert_eq!(eval("first(body.messages).role"), json!("user"));
    assert_eq!(eval("last([1, 2, 3])"), json!(3));
    assert_eq!(eval("length(body.messages)"), json!(1));
    assert_eq!(eval("length('abcd')"), json!(4));
    assert_eq!(eval("keys({a: 1, b: 2})"), json!(["a", "b"]));
    assert_eq!(eval("values({a: 1, b: 2})"), json!([1, 2]));
}

#[test]
fn numeric_helpers() {
    assert_eq!(eval("parseInt('42px')"), json!(42));
    assert_eq!(eval("parseInt('42')"), json!(42));
    assert_eq!(eval("parseInt('px')"), Value::Null);
    assert_eq!(eval("parseFloat('1.25')"), json!(1.25));
    assert!(eval("now()").as_i64().unwrap() > 1_600_000_000_000);
}

#[test]
fn type_checks() {
    assert_eq!(eval("isString(body.model)"), json!(true));
    assert_eq!(eval("isNumber(body.max_tokens_to_sample)"), json!(true));
    assert_eq!(eval("isArray(body.messages)"), json!(true));
    assert_eq!(eval("isObject(body.nested)"), json!(true));
    assert_eq!(eval("isObject(body.messages)"), json!(false));
}

#[test]
fn deep_clean_removes_keys_recursively() {
    assert_eq!(
        eval("deepClean({a: 1, drop: 2, inner: {drop: 3, keep: 4}}, ['drop'])"),
        json!({"a": 1, "inner": {"keep": 4}})
    );
}

#[test]
fn ambient_objects() {
    assert_eq!(eval("Math.floor(1.9)"), json!(1));
    assert_eq!(eval("Math.max(1, 5, 3)"), json!(5));
    let t = eval("Date.now()").as_i64().unwrap();
    assert!(t > 1_600_000_000_000);
}

#[test]
fn string_and_array_methods() {
    assert_eq!(eval("body.model.includes('opus')"), json!(true));
    assert_eq!(eval("body.model.startsWith('claude')"), json!(true));
    assert_eq!(eval("'a,b'.endsWith('b')"), json!(true));
    assert_eq!(eval("[1, 2].concat([3])"), json!([1, 2, 3]));
    assert_eq!(eval("body.messages.length"), json!(1));
    assert_eq!(eval("['a', 'b'].join('-')"), json!("a-b"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Sandbox
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn budget_rejects_huge_expressions() {
    // A wide array literal costs one op per element; 120k elements blow the
    // op budget deterministically without deep recursion.
    let src = format!("[{}0]", "0,".repeat(120_000));
    assert_eq!(evaluate(&src, &ctx()), Err(ExprError::BudgetExceeded));
}

#[test]
fn parse_errors_are_typed() {
    assert!(matches!(
        evaluate("body..model", &ctx()),
        Err(ExprError::Parse { .. })
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Templates
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn whole_value_marker_returns_raw_value() {
    let out = render_template(&json!("{{ body.max_tokens_to_sample }}"), &ctx()).unwrap();
    assert_eq!(out, json!(1024));

    let out = render_template(&json!("{{ body.messages }}"), &ctx()).unwrap();
    assert!(out.is_array());
}

#[test]
fn interpolation_stringifies() {
    let out = render_template(&json!("model={{ body.model }}; n={{ 1 + 1 }}"), &ctx()).unwrap();
    assert_eq!(out, json!("model=claude-3-opus; n=2"));
}

#[test]
fn no_markers_pass_through() {
    assert_eq!(
        render_template(&json!("plain text"), &ctx()).unwrap(),
        json!("plain text")
    );
    assert_eq!(render_template(&json!(42), &ctx()).unwrap(), json!(42));
    assert_eq!(
        render_template(&json!({"k": "v"}), &ctx()).unwrap(),
        json!({"k": "v"})
    );
}

#[test]
fn object_literal_inside_marker() {
    let out = render_template(
        &json!("{{ { outer: { inner: body.nested.a.b } } }}"),
        &ctx(),
    )
    .unwrap();
    assert_eq!(out, json!({ "outer": { "inner": 7 } }));
}

#[test]
fn evaluation_does_not_mutate_context() {
    let context = ctx();
    let before = context.body().clone();
    let _ = evaluate("deepClean(body, ['model'])", &context).unwrap();
    assert_eq!(context.body(), &before);
}
