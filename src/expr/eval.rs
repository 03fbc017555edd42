//! Tree-walking evaluator
//!
//! Semantics follow the JavaScript expression subset the rules are written
//! in: falsy values are `null`, `false`, `0`, `NaN`, and `""`; member access
//! on a missing object key yields `null`; member access on `null` is an
//! error unless reached through `?.`. Numbers are f64 throughout and
//! re-encoded as integers when they round-trip exactly.

use std::time::Instant;

use serde_json::{Map, Number, Value};

use super::ast::{BinOp, Expr, LogicOp, UnOp};
use super::helpers;
use super::{ExprError, RequestContext, EVAL_MAX_OPS, EVAL_TIMEOUT};

pub fn evaluate(ast: &Expr, ctx: &RequestContext) -> Result<Value, ExprError> {
    let mut budget = Budget {
        deadline: Instant::now() + EVAL_TIMEOUT,
        ops: EVAL_MAX_OPS,
    };
    eval(ast, ctx, &mut budget)
}

struct Budget {
    deadline: Instant,
    ops: u64,
}

impl Budget {
    fn spend(&mut self) -> Result<(), ExprError> {
        if self.ops == 0 {
            return Err(ExprError::BudgetExceeded);
        }
        self.ops -= 1;
        // Checking the clock every op would dominate the cost of small
        // expressions; every 256 ops is plenty to enforce a 50ms deadline.
        if self.ops % 256 == 0 && Instant::now() >= self.deadline {
            return Err(ExprError::BudgetExceeded);
        }
        Ok(())
    }
}

fn eval(expr: &Expr, ctx: &RequestContext, budget: &mut Budget) -> Result<Value, ExprError> {
    budget.spend()?;

    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(number(*n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),

        Expr::Ident(name) => match ctx.lookup(name) {
            Some(value) => Ok(value.clone()),
            None => Err(ExprError::Eval(format!("unknown identifier '{}'", name))),
        },

        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, ctx, budget)?);
            }
            Ok(Value::Array(out))
        }

        Expr::Object(entries) => {
            let mut out = Map::new();
            for (key, value) in entries {
                out.insert(key.clone(), eval(value, ctx, budget)?);
            }
            Ok(Value::Object(out))
        }

        Expr::Member {
            object,
            name,
            optional,
        } => {
            // Namespaced builtins are resolved before the object is treated
            // as a context value.
            if let Expr::Ident(ns) = object.as_ref() {
                if ns == "Math" && ctx.lookup(ns).is_none() {
                    return helpers::math_constant(name);
                }
            }

            let base = eval(object, ctx, budget)?;
            member(&base, name, *optional)
        }

        Expr::Index {
            object,
            index,
            optional,
        } => {
            let base = eval(object, ctx, budget)?;
            if base.is_null() {
                return if *optional {
                    Ok(Value::Null)
                } else {
                    Err(ExprError::Eval("cannot index null".to_string()))
                };
            }
            let idx = eval(index, ctx, budget)?;
            Ok(index_value(&base, &idx))
        }

        Expr::Call { callee, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, ctx, budget)?);
            }

            match callee.as_ref() {
                // Bare helper call: uuid(), md5(x), …
                Expr::Ident(name) => helpers::call(name, &values),

                // Namespaced builtin or method call.
                Expr::Member {
                    object,
                    name,
                    optional,
                } => {
                    if let Expr::Ident(ns) = object.as_ref() {
                        if ctx.lookup(ns).is_none() {
                            match ns.as_str() {
                                "Math" => return helpers::math_call(name, &values),
                                "Date" => return helpers::date_call(name, &values),
                                _ => {}
                            }
                        }
                    }

                    let receiver = eval(object, ctx, budget)?;
                    if receiver.is_null() {
                        return if *optional {
                            Ok(Value::Null)
                        } else {
                            Err(ExprError::Eval(format!(
                                "cannot call '{}' on null",
                                name
                            )))
                        };
                    }
                    helpers::method_call(&receiver, name, &values)
                }

                other => Err(ExprError::Eval(format!(
                    "expression is not callable: {:?}",
                    other
                ))),
            }
        }

        Expr::Unary { op, operand } => {
            let value = eval(operand, ctx, budget)?;
            match op {
                UnOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnOp::Neg => {
                    let n = as_number(&value)
                        .ok_or_else(|| ExprError::Eval("cannot negate non-number".to_string()))?;
                    Ok(number(-n))
                }
            }
        }

        Expr::Logical { op, left, right } => {
            let lhs = eval(left, ctx, budget)?;
            match op {
                LogicOp::And => {
                    if truthy(&lhs) {
                        eval(right, ctx, budget)
                    } else {
                        Ok(lhs)
                    }
                }
                LogicOp::Or => {
                    if truthy(&lhs) {
                        Ok(lhs)
                    } else {
                        eval(right, ctx, budget)
                    }
                }
                LogicOp::Nullish => {
                    if lhs.is_null() {
                        eval(right, ctx, budget)
                    } else {
                        Ok(lhs)
                    }
                }
            }
        }

        Expr::Binary { op, left, right } => {
            let lhs = eval(left, ctx, budget)?;
            let rhs = eval(right, ctx, budget)?;
            binary(*op, &lhs, &rhs)
        }

        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            if truthy(&eval(cond, ctx, budget)?) {
                eval(then, ctx, budget)
            } else {
                eval(otherwise, ctx, budget)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value semantics
// ─────────────────────────────────────────────────────────────────────────────

pub(super) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Encode an f64, preferring the integer representation when exact.
pub(super) fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

pub(super) fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(true) => Some(1.0),
        Value::Bool(false) | Value::Null => Some(0.0),
        _ => None,
    }
}

pub(super) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn member(base: &Value, name: &str, optional: bool) -> Result<Value, ExprError> {
    match base {
        Value::Null => {
            if optional {
                Ok(Value::Null)
            } else {
                Err(ExprError::Eval(format!(
                    "cannot read property '{}' of null",
                    name
                )))
            }
        }
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        Value::Array(items) if name == "length" => Ok(number(items.len() as f64)),
        Value::String(s) if name == "length" => Ok(number(s.chars().count() as f64)),
        _ => Ok(Value::Null),
    }
}

fn index_value(base: &Value, index: &Value) -> Value {
    match (base, index) {
        (Value::Array(items), idx) => as_number(idx)
            .filter(|n| *n >= 0.0)
            .and_then(|n| items.get(n as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, ExprError> {
    match op {
        BinOp::Add => {
            // String concatenation wins when either side is a string.
            if lhs.is_string() || rhs.is_string() {
                return Ok(Value::String(format!("{}{}", stringify(lhs), stringify(rhs))));
            }
            arith(lhs, rhs, |a, b| a + b)
        }
        BinOp::Sub => arith(lhs, rhs, |a, b| a - b),
        BinOp::Mul => arith(lhs, rhs, |a, b| a * b),
        BinOp::Div => arith(lhs, rhs, |a, b| a / b),
        BinOp::Mod => arith(lhs, rhs, |a, b| a % b),
        BinOp::Eq => Ok(Value::Bool(loose_eq(lhs, rhs))),
        BinOp::Ne => Ok(Value::Bool(!loose_eq(lhs, rhs))),
        BinOp::StrictEq => Ok(Value::Bool(strict_eq(lhs, rhs))),
        BinOp::StrictNe => Ok(Value::Bool(!strict_eq(lhs, rhs))),
        BinOp::Lt => compare(lhs, rhs, |o| o == std::cmp::Ordering::Less),
        BinOp::Le => compare(lhs, rhs, |o| o != std::cmp::Ordering::Greater),
        BinOp::Gt => compare(lhs, rhs, |o| o == std::cmp::Ordering::Greater),
        BinOp::Ge => compare(lhs, rhs, |o| o != std::cmp::Ordering::Less),
    }
}

fn arith(lhs: &Value, rhs: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, ExprError> {
    let (a, b) = match (as_number(lhs), as_number(rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(ExprError::Eval(
                "arithmetic on non-numeric values".to_string(),
            ))
        }
    };
    Ok(number(f(a, b)))
}

/// `==`/`!=`: number↔string coercion, otherwise value equality.
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (as_number(lhs), as_number(rhs)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        _ => strict_eq(lhs, rhs),
    }
}

/// `===`/`!==`: no coercion. Differently-typed operands are never equal;
/// numbers compare numerically so an integer and its float spelling match.
fn strict_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => lhs == rhs,
    }
}

fn compare(
    lhs: &Value,
    rhs: &Value,
    pred: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<Value, ExprError> {
    if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
        return Ok(Value::Bool(pred(a.cmp(b))));
    }
    match (as_number(lhs), as_number(rhs)) {
        (Some(a), Some(b)) => Ok(Value::Bool(a.partial_cmp(&b).map(&pred).unwrap_or(false))),
        _ => Ok(Value::Bool(false)),
    }
}
