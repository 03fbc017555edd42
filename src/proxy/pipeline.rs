//! The request pipeline
//!
//! Per-request flow: route match → candidate filtering → weighted pick →
//! target URL and path rewrite → layered rule application (route ⊕ upstream
//! as the outer layer, transformer as the inner) → forward → response
//! shaping or SSE transformation. A retryable status or transport error
//! marks the upstream unhealthy and moves on to the next candidate; an
//! exhausted candidate list answers 503.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::State,
    http::{Request, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::balance;
use crate::config::{LayerRules, ResponseRule, RouteConfig, TransformerConfig};
use crate::expr::{render_template, RequestContext};
use crate::health::probe::{ProbeRequest, ProbeRequestData};
use crate::health::RuntimeUpstream;
use crate::rules::{apply_body_rules, apply_header_rules, deep_merge, merge_layers};
use crate::transformers;
use crate::util::{cached_regex, truncate_utf8_safe};

use super::error::ProxyError;
use super::sse::SseTransformer;
use super::ProxyState;

#[cfg(test)]
mod tests;

/// Main proxy handler: the full onion for one inbound request.
pub(crate) async fn proxy_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let pathname = uri.path().to_string();
    let search = uri.query().map(|q| format!("?{}", q)).unwrap_or_default();

    // Route match: first prefix wins.
    let route = match_route(&state.config.routes, &pathname).ok_or(ProxyError::RouteNotFound)?;

    tracing::debug!(method = %method, path = %pathname, route = %route.path, "proxying request");

    // Candidate upstreams: tracked routes filter to healthy, the rest get a
    // transient healthy-labeled copy whose failures are forgotten afterward.
    let candidates: Vec<RuntimeUpstream> = if state.registry.tracks(&route.path) {
        let snapshot = state.registry.snapshot(&route.path).unwrap_or_default();
        observe_unhealthy(&state, route, &snapshot, &req, &pathname, &search);
        let healthy: Vec<RuntimeUpstream> =
            snapshot.into_iter().filter(|u| u.is_healthy()).collect();
        if healthy.is_empty() {
            return Err(ProxyError::NoHealthyUpstream);
        }
        healthy
    } else {
        route
            .upstreams
            .iter()
            .cloned()
            .map(RuntimeUpstream::healthy)
            .collect()
    };

    let Some(first_pick) = balance::select(&candidates) else {
        return Err(ProxyError::NoHealthyUpstream);
    };
    let mut attempts: Vec<&RuntimeUpstream> = vec![first_pick];
    attempts.extend(balance::retry_queue(&candidates, first_pick));

    // Incoming headers as a lowercase map; Host never reaches an upstream.
    let mut header_map: Map<String, Value> = Map::new();
    for (name, value) in req.headers() {
        if let Ok(text) = value.to_str() {
            header_map.insert(name.as_str().to_lowercase(), Value::String(text.to_string()));
        }
    }
    let client_host = header_map
        .get("host")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let is_json = header_map
        .get("content-type")
        .and_then(|v| v.as_str())
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);

    // Request body, bounded by the configured limit.
    let raw_body = axum::body::to_bytes(req.into_body(), state.body_limit)
        .await
        .map_err(|e| ProxyError::BodyRead(e.to_string()))?;

    let parsed_body: Value = if raw_body.is_empty() || !is_json {
        json!({})
    } else {
        serde_json::from_slice(&raw_body).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "request body is not valid JSON, continuing with empty body");
            json!({})
        })
    };

    // Streaming is a property of the client's request, judged before any
    // transformer gets a chance to strip the flag.
    let wants_stream = parsed_body
        .get("stream")
        .map(|v| v.as_bool().unwrap_or(!v.is_null()))
        .unwrap_or(false);

    let parts = RequestParts {
        method: method.to_string(),
        pathname,
        search,
        client_host,
        header_map,
        raw_body,
        parsed_body,
        is_json,
        wants_stream,
    };

    for upstream in attempts {
        match attempt_upstream(&state, route, upstream, &parts).await {
            Ok(response) => return Ok(response),
            Err(AttemptFailure { reason, probe }) => {
                tracing::warn!(
                    route = %route.path,
                    target = %upstream.config.target,
                    reason = %reason,
                    "upstream attempt failed, trying next candidate"
                );
                if state.registry.tracks(&route.path) {
                    state
                        .registry
                        .mark_unhealthy(&route.path, &upstream.config.target);
                    dispatch_probe(&state, route, &upstream.config.target, probe);
                }
            }
        }
    }

    Err(ProxyError::NoHealthyUpstream)
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-attempt flow
// ─────────────────────────────────────────────────────────────────────────────

/// Request fields shared by every attempt.
struct RequestParts {
    method: String,
    pathname: String,
    search: String,
    client_host: String,
    header_map: Map<String, Value>,
    raw_body: Bytes,
    parsed_body: Value,
    is_json: bool,
    wants_stream: bool,
}

/// Why an attempt failed, plus the sanitized request for the recovery probe.
struct AttemptFailure {
    reason: String,
    probe: ProbeRequestData,
}

/// Serialize the outgoing body and normalize Content-Length.
///
/// JSON bodies are re-serialized after mutation and carry the new byte
/// length. Empty and non-JSON bodies were never mutated: the incoming
/// Content-Length is deleted and the transport supplies its own.
fn finalize_body(parts: &RequestParts, body: &Value, headers: &mut Map<String, Value>) -> Bytes {
    if parts.raw_body.is_empty() {
        headers.remove("content-length");
        Bytes::new()
    } else if parts.is_json {
        let serialized = serde_json::to_vec(body).unwrap_or_default();
        headers.insert(
            "content-length".to_string(),
            Value::String(serialized.len().to_string()),
        );
        Bytes::from(serialized)
    } else {
        headers.remove("content-length");
        parts.raw_body.clone()
    }
}

async fn attempt_upstream(
    state: &ProxyState,
    route: &RouteConfig,
    upstream: &RuntimeUpstream,
    parts: &RequestParts,
) -> Result<Response<Body>, AttemptFailure> {
    let target_url = reqwest::Url::parse(&upstream.config.target).map_err(|e| AttemptFailure {
        reason: format!("invalid target URL: {}", e),
        probe: empty_probe_data(&upstream.config.target, parts),
    })?;
    let base_path = target_url.path().trim_end_matches('/').to_string();
    let origin = origin_of(&target_url);

    // Route-level path rewrite, first matching pattern wins.
    let mut pathname = parts.pathname.clone();
    let mut search = parts.search.clone();
    if let Some(rewrite) = &route.path_rewrite {
        for (pattern, replacement) in rewrite.iter() {
            if let Ok(re) = cached_regex(pattern) {
                if re.is_match(&pathname) {
                    pathname = re.replace(&pathname, replacement.as_str()).into_owned();
                    break;
                }
            }
        }
    }

    let mut ctx = RequestContext::new(
        &parts.header_map,
        parts.parsed_body.clone(),
        &pathname,
        &search,
        &parts.client_host,
        "http",
        &parts.method,
    );

    // Transformer resolution: upstream override, then route.
    let reference = upstream
        .config
        .transformer
        .as_ref()
        .or(route.transformer.as_ref());
    let entry: Option<&TransformerConfig> = reference
        .and_then(transformers::resolve)
        .and_then(|entries| transformers::select(&entries, &pathname));

    // Outer layer: route ⊕ upstream, upstream winning.
    let route_layer = LayerRules {
        headers: route.headers.clone(),
        body: route.body.clone(),
    };
    let upstream_layer = LayerRules {
        headers: upstream.config.headers.clone(),
        body: upstream.config.body.clone(),
    };
    let outer = merge_layers(&route_layer, &upstream_layer);

    // Outer body rules produce the intermediate body the transformer sees.
    let mut body = parts.parsed_body.clone();
    if let Some(body_rules) = outer.body.as_ref().filter(|r| !r.is_empty()) {
        body = apply_body_rules(&body, body_rules, &ctx);
        ctx = ctx.with_body(body.clone());
    }

    // Transformer path rewrite: evaluate the replacement, then run the regex.
    if let Some(entry) = entry {
        match render_template(&Value::String(entry.path.replace.clone()), &ctx) {
            Ok(rendered) => {
                let replacement = match &rendered {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if let Ok(re) = cached_regex(&entry.path.pattern) {
                    let rewritten = re.replace(&pathname, replacement.as_str()).into_owned();
                    let (new_path, new_search) = split_path_and_search(&rewritten);
                    tracing::debug!(from = %pathname, to = %new_path, "transformer path rewrite");
                    pathname = new_path;
                    if let Some(new_search) = new_search {
                        search = new_search;
                    }
                    ctx = ctx.with_pathname(&pathname);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "transformer path replacement failed, keeping path");
            }
        }

        if let Some(request_rules) = &entry.request {
            if let Some(body_rules) = &request_rules.body {
                body = apply_body_rules(&body, body_rules, &ctx);
                ctx = ctx.with_body(body.clone());
            }
        }
    }

    // Final headers: merged verbs over the incoming set, Host dropped first.
    let transformer_request = entry.and_then(|e| e.request.clone()).unwrap_or_default();
    let final_rules = merge_layers(&outer, &transformer_request);

    let mut headers = parts.header_map.clone();
    headers.remove("host");
    if let Some(header_rules) = final_rules.headers.as_ref().filter(|r| !r.is_empty()) {
        apply_header_rules(&mut headers, header_rules, &ctx);
    }

    // Body serialization and Content-Length normalization.
    let body_bytes = finalize_body(parts, &body, &mut headers);

    let full_path = if base_path.is_empty() {
        pathname.clone()
    } else {
        format!("{}{}", base_path, pathname)
    };
    let url = format!("{}{}{}", origin, full_path, search);

    let probe_data = ProbeRequestData {
        url: url.clone(),
        method: parts.method.clone(),
        headers: headers
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        body: if body_bytes.is_empty() {
            None
        } else {
            String::from_utf8(body_bytes.to_vec()).ok()
        },
    };

    tracing::debug!(
        url = %url,
        body = %truncate_utf8_safe(&String::from_utf8_lossy(&body_bytes), 512),
        "forwarding request"
    );

    // Forward.
    let method: reqwest::Method = parts
        .method
        .parse()
        .map_err(|_| AttemptFailure {
            reason: "unsupported method".to_string(),
            probe: probe_data.clone(),
        })?;
    let mut forward = state.client.request(method, &url);
    for (name, value) in &headers {
        if let Some(text) = value.as_str() {
            forward = forward.header(name.as_str(), text);
        }
    }
    if !body_bytes.is_empty() {
        forward = forward.body(body_bytes.to_vec());
    }

    let response = forward.send().await.map_err(|e| AttemptFailure {
        reason: format!("transport error: {}", e),
        probe: probe_data.clone(),
    })?;

    let status = response.status();
    if route
        .failover
        .retryable_status_codes
        .contains(&status.as_u16())
    {
        return Err(AttemptFailure {
            reason: format!("retryable status {}", status),
            probe: probe_data,
        });
    }

    // Response side of the onion.
    let response_rule =
        entry.and_then(|e| find_response_rule(&e.response, status.as_u16(), response.headers()));
    shape_response(upstream, parts, ctx, response, response_rule).await
}

// ─────────────────────────────────────────────────────────────────────────────
// Response shaping
// ─────────────────────────────────────────────────────────────────────────────

async fn shape_response(
    upstream: &RuntimeUpstream,
    parts: &RequestParts,
    ctx: RequestContext,
    response: reqwest::Response,
    rule: Option<&ResponseRule>,
) -> Result<Response<Body>, AttemptFailure> {
    let status = response.status();
    let response_headers = response.headers().clone();

    let stream_rules = rule.and_then(|r| r.rules.stream.as_ref());
    if parts.wants_stream {
        if let Some(stream_rules) = stream_rules {
            return Ok(streaming_response(
                response,
                status,
                &response_headers,
                SseTransformer::new(stream_rules, ctx),
            ));
        }
        // No stream rules: pipe the upstream body through untouched.
        return Ok(passthrough_streaming(response, status, &response_headers));
    }

    // Buffered path.
    let body = response.bytes().await.map_err(|e| AttemptFailure {
        reason: format!("failed reading upstream body: {}", e),
        probe: empty_probe_data(&upstream.config.target, parts),
    })?;

    let default_rules = rule.and_then(|r| r.rules.default.as_ref());
    let shaped: Bytes = match default_rules {
        Some(default_rules) => {
            // Upstream layer is the outer layer on the response side.
            let merged = match &upstream.config.body {
                Some(upstream_rules) => deep_merge(upstream_rules, default_rules),
                None => default_rules.clone(),
            };

            let is_json = response_headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.contains("application/json"))
                .unwrap_or(false);

            match (is_json, serde_json::from_slice::<Value>(&body)) {
                (true, Ok(parsed)) => {
                    let response_ctx = ctx.with_body(parsed.clone());
                    let shaped = apply_body_rules(&parsed, &merged, &response_ctx);
                    Bytes::from(serde_json::to_vec(&shaped).unwrap_or_default())
                }
                _ => body, // Non-JSON upstream bodies pass through unmodified.
            }
        }
        None => body,
    };

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in response_headers.iter() {
        if is_stripped_response_header(name.as_str()) || name == "content-length" {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder = builder.header("content-length", shaped.len());

    builder
        .body(Body::from(shaped))
        .map_err(|e| AttemptFailure {
            reason: format!("failed building response: {}", e),
            probe: empty_probe_data(&upstream.config.target, parts),
        })
}

/// Pipe the upstream SSE body through the transformer to the client.
fn streaming_response(
    response: reqwest::Response,
    status: reqwest::StatusCode,
    response_headers: &reqwest::header::HeaderMap,
    mut transformer: SseTransformer,
) -> Response<Body> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);

    tokio::spawn(async move {
        let mut upstream = response.bytes_stream();

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    let transformed = transformer.push(&chunk);
                    if !transformed.is_empty()
                        && tx.send(Ok(Bytes::from(transformed))).await.is_err()
                    {
                        tracing::debug!("client disconnected during streaming");
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "upstream stream error");
                    break;
                }
            }
        }

        let tail = transformer.finish();
        if !tail.is_empty() {
            let _ = tx.send(Ok(Bytes::from(tail))).await;
        }
    });

    stream_response_builder(status, response_headers)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Forward an SSE body unchanged (no stream rules configured).
fn passthrough_streaming(
    response: reqwest::Response,
    status: reqwest::StatusCode,
    response_headers: &reqwest::header::HeaderMap,
) -> Response<Body> {
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| std::io::Error::other(e)));

    stream_response_builder(status, response_headers)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn stream_response_builder(
    status: reqwest::StatusCode,
    response_headers: &reqwest::header::HeaderMap,
) -> axum::http::response::Builder {
    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in response_headers.iter() {
        if is_stripped_response_header(name.as_str()) || name == "content-length" {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder
}

fn is_stripped_response_header(name: &str) -> bool {
    matches!(name, "transfer-encoding" | "content-encoding" | "connection")
}

// ─────────────────────────────────────────────────────────────────────────────
// Matching helpers
// ─────────────────────────────────────────────────────────────────────────────

/// First route whose path is a prefix of the request pathname.
pub(crate) fn match_route<'a>(routes: &'a [RouteConfig], pathname: &str) -> Option<&'a RouteConfig> {
    routes.iter().find(|route| pathname.starts_with(&route.path))
}

/// First response rule whose status regex (and header requirements, if any)
/// match the upstream response.
pub(crate) fn find_response_rule<'a>(
    rules: &'a [ResponseRule],
    status: u16,
    headers: &reqwest::header::HeaderMap,
) -> Option<&'a ResponseRule> {
    let status_text = status.to_string();
    rules.iter().find(|rule| {
        let status_ok = cached_regex(&rule.matcher.status)
            .map(|re| re.is_match(&status_text))
            .unwrap_or(false);
        if !status_ok {
            return false;
        }
        match &rule.matcher.headers {
            None => true,
            Some(required) => required.iter().all(|(name, expected)| {
                headers
                    .get(name.to_lowercase())
                    .and_then(|v| v.to_str().ok())
                    .map(|actual| Some(actual) == expected.as_str())
                    .unwrap_or(false)
            }),
        }
    })
}

/// Split a rewritten path into pathname and (optional) search.
pub(crate) fn split_path_and_search(path: &str) -> (String, Option<String>) {
    match path.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(format!("?{}", q))),
        None => (path.to_string(), None),
    }
}

fn origin_of(url: &reqwest::Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""));
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{}", port));
    }
    origin
}

// ─────────────────────────────────────────────────────────────────────────────
// Probe dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// Dispatch probes for unhealthy upstreams observed while serving a request.
fn observe_unhealthy(
    state: &ProxyState,
    route: &RouteConfig,
    snapshot: &[RuntimeUpstream],
    req: &Request<Body>,
    pathname: &str,
    search: &str,
) {
    if !route.health_check.enabled {
        return;
    }

    for upstream in snapshot.iter().filter(|u| !u.is_healthy()) {
        let target = &upstream.config.target;
        if !state
            .registry
            .claim_probe(&route.path, target, route.health_check.interval_seconds)
        {
            continue;
        }

        let url = format!(
            "{}{}{}",
            target.trim_end_matches('/'),
            pathname,
            search
        );
        let headers = req
            .headers()
            .iter()
            .filter(|(name, _)| name.as_str() != "host")
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();

        state.probe.dispatch(ProbeRequest {
            target: target.clone(),
            retryable_status_codes: route.failover.retryable_status_codes.clone(),
            request_data: ProbeRequestData {
                url,
                method: req.method().to_string(),
                headers,
                body: None,
            },
        });
    }
}

fn dispatch_probe(
    state: &ProxyState,
    route: &RouteConfig,
    target: &str,
    probe: ProbeRequestData,
) {
    if !route.health_check.enabled {
        return;
    }
    if !state
        .registry
        .claim_probe(&route.path, target, route.health_check.interval_seconds)
    {
        return;
    }
    state.probe.dispatch(ProbeRequest {
        target: target.to_string(),
        retryable_status_codes: route.failover.retryable_status_codes.clone(),
        request_data: probe,
    });
}

fn empty_probe_data(target: &str, parts: &RequestParts) -> ProbeRequestData {
    ProbeRequestData {
        url: format!(
            "{}{}{}",
            target.trim_end_matches('/'),
            parts.pathname,
            parts.search
        ),
        method: parts.method.clone(),
        headers: Vec::new(),
        body: None,
    }
}
