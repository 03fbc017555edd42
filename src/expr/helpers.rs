//! Helper library exposed to expressions
//!
//! Helpers are resolved by name at call time from a fixed table; nothing is
//! resolved through an ambient import mechanism, and nothing here can reach
//! the filesystem, network, or process beyond the environment snapshot the
//! context already carries.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use md5::Md5;
use rand::Rng;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::eval::{as_number, number, stringify};
use super::ExprError;

/// Dispatch a bare helper call by name.
pub fn call(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match name {
        // Identifiers / crypto
        "uuid" => Ok(Value::String(uuid::Uuid::new_v4().to_string())),
        "randomInt" => {
            let min = arg_number(name, args, 0)?;
            let max = arg_number(name, args, 1)?;
            if max <= min {
                return Ok(number(min));
            }
            let n = rand::thread_rng().gen_range(min as i64..max as i64);
            Ok(number(n as f64))
        }
        "md5" => {
            let mut hasher = Md5::new();
            hasher.update(arg_string(name, args, 0)?.as_bytes());
            Ok(Value::String(format!("{:x}", hasher.finalize())))
        }
        "sha256" => {
            let mut hasher = Sha256::new();
            hasher.update(arg_string(name, args, 0)?.as_bytes());
            Ok(Value::String(format!("{:x}", hasher.finalize())))
        }
        "encrypt" => {
            let input = arg_string(name, args, 0)?;
            let mode = arg_string(name, args, 1)?;
            match mode.as_str() {
                "base64" => Ok(Value::String(STANDARD.encode(input.as_bytes()))),
                other => Err(ExprError::Eval(format!(
                    "encrypt: unsupported mode '{}'",
                    other
                ))),
            }
        }

        // Text
        "base64encode" => Ok(Value::String(
            STANDARD.encode(arg_string(name, args, 0)?.as_bytes()),
        )),
        "base64decode" => {
            let decoded = STANDARD
                .decode(arg_string(name, args, 0)?.as_bytes())
                .map_err(|e| ExprError::Eval(format!("base64decode: {}", e)))?;
            String::from_utf8(decoded)
                .map(Value::String)
                .map_err(|_| ExprError::Eval("base64decode: not valid UTF-8".to_string()))
        }
        "toLowerCase" => Ok(Value::String(arg_string(name, args, 0)?.to_lowercase())),
        "toUpperCase" => Ok(Value::String(arg_string(name, args, 0)?.to_uppercase())),
        "trim" => Ok(Value::String(arg_string(name, args, 0)?.trim().to_string())),
        "split" => {
            let input = arg_string(name, args, 0)?;
            let sep = arg_string(name, args, 1)?;
            let parts: Vec<Value> = if sep.is_empty() {
                input.chars().map(|c| Value::String(c.to_string())).collect()
            } else {
                input
                    .split(sep.as_str())
                    .map(|s| Value::String(s.to_string()))
                    .collect()
            };
            Ok(Value::Array(parts))
        }
        "replace" => {
            let input = arg_string(name, args, 0)?;
            let find = arg_string(name, args, 1)?;
            let with = arg_string(name, args, 2)?;
            Ok(Value::String(input.replace(find.as_str(), with.as_str())))
        }

        // JSON
        "jsonParse" => serde_json::from_str(&arg_string(name, args, 0)?)
            .map_err(|e| ExprError::Eval(format!("jsonParse: {}", e))),
        "jsonStringify" => {
            let value = arg(name, args, 0)?;
            serde_json::to_string(value)
                .map(Value::String)
                .map_err(|e| ExprError::Eval(format!("jsonStringify: {}", e)))
        }
        "parseJWT" => parse_jwt(&arg_string(name, args, 0)?),

        // Collections
        "first" => Ok(match arg(name, args, 0)? {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }),
        "last" => Ok(match arg(name, args, 0)? {
            Value::Array(items) => items.last().cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }),
        "length" => Ok(match arg(name, args, 0)? {
            Value::Array(items) => number(items.len() as f64),
            Value::String(s) => number(s.chars().count() as f64),
            Value::Object(map) => number(map.len() as f64),
            _ => Value::Null,
        }),
        "keys" => Ok(match arg(name, args, 0)? {
            Value::Object(map) => {
                Value::Array(map.keys().map(|k| Value::String(k.clone())).collect())
            }
            _ => Value::Array(Vec::new()),
        }),
        "values" => Ok(match arg(name, args, 0)? {
            Value::Object(map) => Value::Array(map.values().cloned().collect()),
            _ => Value::Array(Vec::new()),
        }),

        // Numeric
        "parseInt" => {
            // Leading integer prefix, like the JS namesake: "42px" → 42.
            let input = arg_string(name, args, 0)?;
            let trimmed = input.trim();
            let end = trimmed
                .char_indices()
                .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
                .map(|(i, c)| i + c.len_utf8())
                .last()
                .unwrap_or(0);
            Ok(trimmed[..end]
                .parse::<f64>()
                .map(|f| number(f.trunc()))
                .unwrap_or(Value::Null))
        }
        "parseFloat" => Ok(arg_string(name, args, 0)?
            .trim()
            .parse::<f64>()
            .map(number)
            .unwrap_or(Value::Null)),
        "now" => Ok(number(chrono::Utc::now().timestamp_millis() as f64)),

        // Type checks
        "isString" => Ok(Value::Bool(arg(name, args, 0)?.is_string())),
        "isNumber" => Ok(Value::Bool(arg(name, args, 0)?.is_number())),
        "isArray" => Ok(Value::Bool(arg(name, args, 0)?.is_array())),
        "isObject" => Ok(Value::Bool(arg(name, args, 0)?.is_object())),

        // Structural cleanup
        "deepClean" => {
            let mut value = arg(name, args, 0)?.clone();
            let drop: Vec<String> = match arg(name, args, 1)? {
                Value::Array(items) => items.iter().map(stringify).collect(),
                Value::String(s) => vec![s.clone()],
                _ => Vec::new(),
            };
            deep_clean(&mut value, &drop);
            Ok(value)
        }

        other => Err(ExprError::Eval(format!("unknown helper '{}'", other))),
    }
}

/// `Math.*` function calls.
pub fn math_call(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    let unary = |args: &[Value], f: fn(f64) -> f64| -> Result<Value, ExprError> {
        Ok(number(f(arg_number(name, args, 0)?)))
    };

    match name {
        "floor" => unary(args, f64::floor),
        "ceil" => unary(args, f64::ceil),
        "round" => unary(args, f64::round),
        "abs" => unary(args, f64::abs),
        "random" => Ok(number(rand::thread_rng().gen::<f64>())),
        "min" => fold_numbers(name, args, f64::min),
        "max" => fold_numbers(name, args, f64::max),
        other => Err(ExprError::Eval(format!("unknown Math function '{}'", other))),
    }
}

/// `Math.*` constants.
pub fn math_constant(name: &str) -> Result<Value, ExprError> {
    match name {
        "PI" => Ok(number(std::f64::consts::PI)),
        "E" => Ok(number(std::f64::consts::E)),
        other => Err(ExprError::Eval(format!("unknown Math member '{}'", other))),
    }
}

/// `Date.*` function calls.
pub fn date_call(name: &str, _args: &[Value]) -> Result<Value, ExprError> {
    match name {
        "now" => Ok(number(chrono::Utc::now().timestamp_millis() as f64)),
        other => Err(ExprError::Eval(format!("unknown Date function '{}'", other))),
    }
}

/// Method calls on values: string and array conveniences.
pub fn method_call(receiver: &Value, name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match (receiver, name) {
        (Value::String(s), "includes") => {
            Ok(Value::Bool(s.contains(&arg_string(name, args, 0)?)))
        }
        (Value::String(s), "startsWith") => {
            Ok(Value::Bool(s.starts_with(&arg_string(name, args, 0)?)))
        }
        (Value::String(s), "endsWith") => {
            Ok(Value::Bool(s.ends_with(&arg_string(name, args, 0)?)))
        }
        (Value::String(s), "toLowerCase") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "toUpperCase") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "trim") => Ok(Value::String(s.trim().to_string())),

        (Value::Array(items), "includes") => {
            let needle = arg(name, args, 0)?;
            Ok(Value::Bool(items.contains(needle)))
        }
        (Value::Array(items), "concat") => {
            let mut out = items.clone();
            for extra in args {
                match extra {
                    Value::Array(more) => out.extend(more.iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Ok(Value::Array(out))
        }
        (Value::Array(items), "join") => {
            let sep = args
                .first()
                .map(stringify)
                .unwrap_or_else(|| ",".to_string());
            Ok(Value::String(
                items.iter().map(|v| stringify(v)).collect::<Vec<_>>().join(&sep),
            ))
        }

        (_, other) => Err(ExprError::Eval(format!(
            "no method '{}' on this value",
            other
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internals
// ─────────────────────────────────────────────────────────────────────────────

/// Decode the claims object from a JWT's payload segment.
fn parse_jwt(token: &str) -> Result<Value, ExprError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ExprError::Eval("parseJWT: token has no payload segment".to_string()))?;

    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ExprError::Eval(format!("parseJWT: {}", e)))?;

    serde_json::from_slice(&decoded)
        .map_err(|e| ExprError::Eval(format!("parseJWT: payload is not JSON: {}", e)))
}

/// Recursively remove the listed keys from objects at any depth.
pub fn deep_clean(value: &mut Value, drop: &[String]) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !drop.iter().any(|d| d == key));
            for child in map.values_mut() {
                deep_clean(child, drop);
            }
        }
        Value::Array(items) => {
            for item in items {
                deep_clean(item, drop);
            }
        }
        _ => {}
    }
}

fn fold_numbers(name: &str, args: &[Value], f: fn(f64, f64) -> f64) -> Result<Value, ExprError> {
    let mut acc = arg_number(name, args, 0)?;
    for (i, _) in args.iter().enumerate().skip(1) {
        acc = f(acc, arg_number(name, args, i)?);
    }
    Ok(number(acc))
}

fn arg<'a>(name: &str, args: &'a [Value], index: usize) -> Result<&'a Value, ExprError> {
    args.get(index)
        .ok_or_else(|| ExprError::Eval(format!("{}: missing argument {}", name, index + 1)))
}

fn arg_string(name: &str, args: &[Value], index: usize) -> Result<String, ExprError> {
    Ok(stringify(arg(name, args, index)?))
}

fn arg_number(name: &str, args: &[Value], index: usize) -> Result<f64, ExprError> {
    as_number(arg(name, args, index)?)
        .ok_or_else(|| ExprError::Eval(format!("{}: argument {} is not a number", name, index + 1)))
}