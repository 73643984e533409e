use super::ast::{BinaryOp, UnaryOp};
use serde::{Deserialize, Serialize};

/// Compile-time constant.
///
/// These are the only values that can be embedded in the instruction stream
/// (`Op::Push`) or produced by enum and constant folding. Booleans are reals,
/// as in GML: `true` is `1`, `false` is `0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    #[default]
    Undefined,

    /// Double-precision real.
    Real(f64),

    /// UTF-8 string.
    String(String),
}

impl Value {
    pub fn real(r: f64) -> Self {
        Value::Real(r)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// Truthiness of a constant, if it has one.
    ///
    /// Reals above `0.5` are true. Strings and `undefined` have no truth
    /// value; the executor raises an error on them instead.
    pub fn truthy(&self) -> Option<bool> {
        match self {
            Value::Real(r) => Some(*r > 0.5),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Real(_) => "real",
            Value::String(_) => "string",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Real(if b { 1.0 } else { 0.0 })
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Real(r) => {
                if r.fract() == 0.0 && r.abs() < 1e15 {
                    write!(f, "{}", *r as i64)
                } else {
                    write!(f, "{}", r)
                }
            }
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

fn int(r: f64) -> i64 {
    r as i64
}

/// Evaluate a binary operator on two constants.
///
/// Returns `None` when the result is not defined at compile time (type
/// mismatch, division by zero, out-of-range shift). Such expressions are left
/// for the runtime to evaluate and report.
pub fn apply_binary(op: BinaryOp, a: &Value, b: &Value) -> Option<Value> {
    use BinaryOp::*;
    use Value::{Real, String as Str};

    Some(match (op, a, b) {
        (Add, Real(x), Real(y)) => Real(x + y),
        (Add, Str(x), Str(y)) => Str(format!("{}{}", x, y)),
        (Sub, Real(x), Real(y)) => Real(x - y),
        (Mul, Real(x), Real(y)) => Real(x * y),
        (Div, Real(x), Real(y)) if *y != 0.0 => Real(x / y),
        (IntDiv, Real(x), Real(y)) if *y != 0.0 => Real((x / y).trunc()),
        (Mod, Real(x), Real(y)) if *y != 0.0 => Real(x % y),

        (BitAnd, Real(x), Real(y)) => Real((int(*x) & int(*y)) as f64),
        (BitOr, Real(x), Real(y)) => Real((int(*x) | int(*y)) as f64),
        (BitXor, Real(x), Real(y)) => Real((int(*x) ^ int(*y)) as f64),
        (Shl, Real(x), Real(y)) if (0.0..64.0).contains(y) => {
            Real(int(*x).wrapping_shl(*y as u32) as f64)
        }
        (Shr, Real(x), Real(y)) if (0.0..64.0).contains(y) => {
            Real(int(*x).wrapping_shr(*y as u32) as f64)
        }

        (Eq, _, _) => Value::from(a == b),
        (Ne, _, _) => Value::from(a != b),

        (Lt, Real(x), Real(y)) => Value::from(x < y),
        (Gt, Real(x), Real(y)) => Value::from(x > y),
        (Le, Real(x), Real(y)) => Value::from(x <= y),
        (Ge, Real(x), Real(y)) => Value::from(x >= y),
        (Lt, Str(x), Str(y)) => Value::from(x < y),
        (Gt, Str(x), Str(y)) => Value::from(x > y),
        (Le, Str(x), Str(y)) => Value::from(x <= y),
        (Ge, Str(x), Str(y)) => Value::from(x >= y),

        (Xor, _, _) => Value::from(a.truthy()? != b.truthy()?),

        _ => return None,
    })
}

/// Evaluate a unary operator on a constant.
pub fn apply_unary(op: UnaryOp, a: &Value) -> Option<Value> {
    Some(match (op, a) {
        (UnaryOp::Plus, Value::Real(x)) => Value::Real(*x),
        (UnaryOp::Neg, Value::Real(x)) => Value::Real(-x),
        (UnaryOp::Not, v) => Value::from(!v.truthy()?),
        (UnaryOp::BitNot, Value::Real(x)) => Value::Real(!int(*x) as f64),
        _ => return None,
    })
}
