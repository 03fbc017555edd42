//! SSE stream transformation
//!
//! Rewrites a `text/event-stream` body frame by frame as it is piped from
//! the upstream to the client. Two modes, picked from the configured rules:
//!
//! - **State-machine mode** (rules with any of `start`/`chunk`/`end`): the
//!   transformer walks start → chunk* → end, synthesizing the end event on
//!   `data: [DONE]` or stream close, and emitting only what the rules
//!   produce.
//! - **Legacy mode** (a bare rules object): every `data:` event is rewritten
//!   with the same rules; `[DONE]` and unknown lines pass through verbatim.
//!
//! Frames are split on blank lines, accepting both `\n\n` and `\r\n\r\n`
//! terminators. Rule output is emitted as `data: <compact JSON>\n\n`; a
//! `__multi_events` fan-out writes its events contiguously.

use serde_json::{json, Value};

use crate::config::{ModificationRules, StreamRules, StreamTransformRules};
use crate::expr::{RequestContext, StreamPhase};
use crate::rules::apply_body_rules;


/// Stateful SSE rewriter for one response body.
pub struct SseTransformer {
    mode: Mode,
    ctx: RequestContext,
    has_started: bool,
    is_finished: bool,
    chunk_index: u64,
    buffer: Vec<u8>,
}

enum Mode {
    Phased(StreamTransformRules),
    Legacy(ModificationRules),
}

impl SseTransformer {
    pub fn new(rules: &StreamRules, ctx: RequestContext) -> Self {
        let mode = match rules {
            StreamRules::Phased(phased) => Mode::Phased(phased.clone()),
            StreamRules::Legacy(legacy) => Mode::Legacy(legacy.clone()),
        };
        Self {
            mode,
            ctx,
            has_started: false,
            is_finished: false,
            chunk_index: 0,
            buffer: Vec::new(),
        }
    }

    /// Feed upstream bytes in; get client bytes out.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.buffer.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some((frame, rest_at)) = next_frame(&self.buffer) {
            self.process_frame(&frame, &mut out);
            self.buffer.drain(..rest_at);
        }
        out
    }

    /// Flush at upstream close: process any unterminated trailing frame, and
    /// synthesize the end event if no terminal was observed.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::new();

        if !self.buffer.is_empty() {
            let trailing = std::mem::take(&mut self.buffer);
            let frame = String::from_utf8_lossy(&trailing).into_owned();
            if !frame.trim().is_empty() {
                self.process_frame(&frame, &mut out);
            }
        }

        if !self.is_finished {
            let end_rules = match &self.mode {
                Mode::Phased(rules) => rules.end.clone(),
                Mode::Legacy(_) => None,
            };
            if let Some(end_rules) = end_rules {
                self.emit_phase(&end_rules, &json!({}), StreamPhase::End, &mut out);
            }
            self.is_finished = true;
        }

        out
    }

    fn process_frame(&mut self, frame: &str, out: &mut Vec<u8>) {
        match &self.mode {
            Mode::Phased(_) => self.process_phased(frame, out),
            Mode::Legacy(_) => self.process_legacy(frame, out),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State-machine mode
    // ─────────────────────────────────────────────────────────────────────────

    fn process_phased(&mut self, frame: &str, out: &mut Vec<u8>) {
        if self.is_finished {
            return;
        }

        let Mode::Phased(rules) = &self.mode else {
            return;
        };
        let rules = rules.clone();

        for line in frame.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                // Only rule output reaches the client in this mode.
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                if let Some(end_rules) = &rules.end {
                    self.emit_phase(end_rules, &json!({}), StreamPhase::End, out);
                }
                self.is_finished = true;
                return;
            }

            let payload: Value = match serde_json::from_str(data) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unparseable SSE data line");
                    continue;
                }
            };

            if !self.has_started {
                if let Some(start_rules) = &rules.start {
                    self.emit_phase(start_rules, &payload, StreamPhase::Start, out);
                }
                self.has_started = true;
            }

            if is_terminal_chunk(&payload) && rules.end.is_some() {
                if let Some(end_rules) = &rules.end {
                    self.emit_phase(end_rules, &payload, StreamPhase::End, out);
                }
                self.is_finished = true;
                return;
            }

            if let Some(chunk_rules) = &rules.chunk {
                self.emit_phase(chunk_rules, &payload, StreamPhase::Chunk, out);
            } else {
                emit_value(&payload, out);
            }
            self.chunk_index += 1;
        }
    }

    fn emit_phase(
        &mut self,
        rules: &ModificationRules,
        payload: &Value,
        phase: StreamPhase,
        out: &mut Vec<u8>,
    ) {
        let ctx = self
            .ctx
            .with_body(payload.clone())
            .with_stream(phase, self.chunk_index);
        let result = apply_body_rules(payload, rules, &ctx);
        emit_value(&result, out);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Legacy mode
    // ─────────────────────────────────────────────────────────────────────────

    fn process_legacy(&mut self, frame: &str, out: &mut Vec<u8>) {
        let Mode::Legacy(rules) = &self.mode else {
            return;
        };
        let rules = rules.clone();

        let mut forwarded_raw = false;
        for line in frame.lines() {
            match line.strip_prefix("data:") {
                Some(data) if data.trim() == "[DONE]" => {
                    out.extend_from_slice(b"data: [DONE]\n\n");
                }
                Some(data) => match serde_json::from_str::<Value>(data.trim()) {
                    Ok(payload) => {
                        let ctx = self
                            .ctx
                            .with_body(payload.clone())
                            .with_stream(StreamPhase::Chunk, self.chunk_index);
                        let result = apply_body_rules(&payload, &rules, &ctx);
                        emit_value(&result, out);
                        self.chunk_index += 1;
                    }
                    Err(_) => {
                        out.extend_from_slice(line.as_bytes());
                        out.push(b'\n');
                        forwarded_raw = true;
                    }
                },
                None if !line.trim().is_empty() => {
                    out.extend_from_slice(line.as_bytes());
                    out.push(b'\n');
                    forwarded_raw = true;
                }
                None => {}
            }
        }

        if forwarded_raw {
            out.push(b'\n');
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame and emission helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Find the next complete frame in the buffer.
///
/// Returns the frame text and the byte offset just past its terminator.
fn next_frame(buffer: &[u8]) -> Option<(String, usize)> {
    let lf = find(buffer, b"\n\n");
    let crlf = find(buffer, b"\r\n\r\n");

    let (end, skip) = match (lf, crlf) {
        (Some(l), Some(c)) if c < l => (c, 4),
        (Some(l), _) => (l, 2),
        (None, Some(c)) => (c, 4),
        (None, None) => return None,
    };

    let frame = String::from_utf8_lossy(&buffer[..end]).into_owned();
    Some((frame, end + skip))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Write a rule result to the output: objects become one event each, arrays
/// fan out contiguously, anything else is skipped.
fn emit_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Array(events) => {
            for event in events {
                emit_value(event, out);
            }
        }
        Value::Object(map) if !map.is_empty() => {
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(value.to_string().as_bytes());
            out.extend_from_slice(b"\n\n");
        }
        _ => {}
    }
}

/// A chunk is terminal when it carries a finish reason in any of the wire
/// shapes the transformers see.
fn is_terminal_chunk(payload: &Value) -> bool {
    let gemini = payload
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finishReason"));
    let openai = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finish_reason"));
    let flat = payload.get("finishReason");

    [gemini, openai, flat]
        .into_iter()
        .flatten()
        .any(|v| !v.is_null())
}
