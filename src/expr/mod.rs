//! Dynamic expression evaluation for rule values
//!
//! Rule values may embed `{{ … }}` markers holding JavaScript-shaped
//! expressions: member access, indexing, calls, ternary, logical and nullish
//! operators, optional chaining, arithmetic, and object/array literals.
//! Expressions are evaluated against a per-request [`RequestContext`] plus a
//! fixed helper library; they cannot reach the filesystem, network, process,
//! or any dynamic code construction.
//!
//! Three template shapes:
//! - The whole value is exactly one marker: the raw evaluated value (any JSON
//!   type) replaces the string.
//! - Mixed text and markers: each marker is evaluated and stringified in
//!   place.
//! - No markers: the value is returned unchanged.
//!
//! Every evaluation runs under a hard wall-clock deadline and an operation
//! budget, so a pathological expression degrades into an [`ExprError`]
//! instead of stalling the request.

mod ast;
mod eval;
mod helpers;
mod lexer;
mod parser;
mod template;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;

pub use template::render_template;

use ast::Expr;

/// Hard wall-clock limit for a single evaluation.
pub const EVAL_TIMEOUT: Duration = Duration::from_millis(50);

/// Operation budget for a single evaluation; generous for rule-sized
/// expressions, far too small for unbounded loops via recursive data.
pub const EVAL_MAX_OPS: u64 = 100_000;

/// Errors from parsing or evaluating an expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error("expression exceeded its time or operation budget")]
    BudgetExceeded,
}

// ─────────────────────────────────────────────────────────────────────────────
// Request context
// ─────────────────────────────────────────────────────────────────────────────

/// The stream phase during SSE transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Start,
    Chunk,
    End,
}

impl StreamPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamPhase::Start => "start",
            StreamPhase::Chunk => "chunk",
            StreamPhase::End => "end",
        }
    }
}

/// Per-request evaluation context.
///
/// Holds the root identifiers visible to expressions: `headers`, `body`,
/// `url`, `method`, `env`, and (during SSE transformation) `stream`.
/// Evaluation never mutates the context; rebuilding after a body mutation is
/// the caller's job.
#[derive(Debug, Clone)]
pub struct RequestContext {
    root: Value,
}

impl RequestContext {
    /// Build a context from request parts. Header names are lowercased.
    pub fn new(
        headers: &Map<String, Value>,
        body: Value,
        pathname: &str,
        search: &str,
        host: &str,
        protocol: &str,
        method: &str,
    ) -> Self {
        let env: Map<String, Value> = std::env::vars()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();

        let root = json!({
            "headers": headers,
            "body": body,
            "url": {
                "pathname": pathname,
                "search": search,
                "host": host,
                "protocol": protocol,
            },
            "method": method,
            "env": env,
            "stream": Value::Null,
        });

        Self { root }
    }

    /// Replace the context body (after a rule layer has been applied).
    pub fn with_body(&self, body: Value) -> Self {
        let mut root = self.root.clone();
        root["body"] = body;
        Self { root }
    }

    /// Replace the context pathname (after a path rewrite).
    pub fn with_pathname(&self, pathname: &str) -> Self {
        let mut root = self.root.clone();
        root["url"]["pathname"] = Value::String(pathname.to_string());
        Self { root }
    }

    /// Attach the stream phase fields used by SSE rules.
    pub fn with_stream(&self, phase: StreamPhase, chunk_index: u64) -> Self {
        let mut root = self.root.clone();
        root["stream"] = json!({ "phase": phase.as_str(), "chunkIndex": chunk_index });
        Self { root }
    }

    pub fn body(&self) -> &Value {
        &self.root["body"]
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<&Value> {
        self.root.get(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry points
// ─────────────────────────────────────────────────────────────────────────────

/// Evaluate a single expression source string against a context.
pub fn evaluate(source: &str, ctx: &RequestContext) -> Result<Value, ExprError> {
    let ast = parse_cached(source)?;
    eval::evaluate(&ast, ctx)
}

/// Parse an expression, consulting the process-wide parse cache.
///
/// Only parse results are cached; evaluation results depend on the request
/// context and are never reused.
fn parse_cached(source: &str) -> Result<Arc<Expr>, ExprError> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<Expr>>>> = OnceLock::new();

    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(guard) = cache.lock() {
        if let Some(ast) = guard.get(source) {
            return Ok(ast.clone());
        }
    }

    let ast = Arc::new(parser::parse(source)?);
    if let Ok(mut guard) = cache.lock() {
        // Unbounded growth is not a concern: sources come from the config
        // document and the bundled transformer assets.
        guard.insert(source.to_string(), ast.clone());
    }
    Ok(ast)
}

#[cfg(test)]
mod tests;
