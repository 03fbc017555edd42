//! `{{ … }}` marker handling in rule values

use serde_json::Value;

use super::eval::stringify;
use super::{evaluate, ExprError, RequestContext};

/// Apply template semantics to a rule value.
///
/// Strings are scanned for `{{ … }}` markers; non-strings pass through
/// untouched. A string that is exactly one marker is replaced by the raw
/// evaluated value (any JSON type); a string mixing markers and text gets
/// each marker evaluated and stringified in place.
pub fn render_template(value: &Value, ctx: &RequestContext) -> Result<Value, ExprError> {
    let Value::String(text) = value else {
        return Ok(value.clone());
    };

    let markers = find_markers(text)?;
    if markers.is_empty() {
        return Ok(value.clone());
    }

    // Whole-value shape: the trimmed string is a single marker.
    if markers.len() == 1 {
        let (start, end) = markers[0];
        if text[..start].trim().is_empty() && text[end..].trim().is_empty() {
            let source = &text[start + 2..end - 2];
            return evaluate(source, ctx);
        }
    }

    // Interpolation shape: stringify each marker in place.
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end) in markers {
        out.push_str(&text[cursor..start]);
        let result = evaluate(&text[start + 2..end - 2], ctx)?;
        out.push_str(&stringify(&result));
        cursor = end;
    }
    out.push_str(&text[cursor..]);

    Ok(Value::String(out))
}

/// Locate `{{ … }}` markers as byte ranges (inclusive of the braces).
///
/// The scanner is brace-depth and string-literal aware so object literals
/// inside a marker (`{{ {a: {b: 1}} }}`) do not end it early.
fn find_markers(text: &str) -> Result<Vec<(usize, usize)>, ExprError> {
    let bytes = text.as_bytes();
    let mut markers = Vec::new();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            let start = i;
            let end = scan_marker_end(text, start + 2)?;
            markers.push((start, end));
            i = end;
        } else {
            i += 1;
        }
    }

    Ok(markers)
}

fn scan_marker_end(text: &str, from: usize) -> Result<usize, ExprError> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = from;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                i = skip_string(bytes, i)?;
            }
            b'{' => {
                depth += 1;
                i += 1;
            }
            b'}' => {
                if depth == 0 {
                    if bytes.get(i + 1) == Some(&b'}') {
                        return Ok(i + 2);
                    }
                    return Err(ExprError::Parse {
                        offset: i,
                        message: "single '}' inside template marker".to_string(),
                    });
                }
                depth -= 1;
                i += 1;
            }
            _ => i += 1,
        }
    }

    Err(ExprError::Parse {
        offset: from,
        message: "unterminated template marker".to_string(),
    })
}

fn skip_string(bytes: &[u8], start: usize) -> Result<usize, ExprError> {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            c if c == quote => return Ok(i + 1),
            _ => i += 1,
        }
    }
    Err(ExprError::Parse {
        offset: start,
        message: "unterminated string inside template marker".to_string(),
    })
}
