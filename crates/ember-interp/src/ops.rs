//! Conversions and operators on [`Zval`]s.
//!
//! Operators never print; non-fatal diagnostics are appended to the
//! `warnings` buffer and the caller attaches a source location.

use crate::ast::BinaryOp;
use crate::error::NativeFault;
use crate::value::{ArrayKey, ZArray, Zval};
use std::cmp::Ordering;
use std::rc::Rc;

/// A number produced by numeric coercion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn to_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    pub fn into_zval(self) -> Zval {
        match self {
            Self::Int(i) => Zval::Int(i),
            Self::Float(f) => Zval::Float(f),
        }
    }
}

const WHITESPACE: &[char] = &[' ', '\t', '\n', '\r', '\x0b', '\x0c'];

/// Parse the numeric prefix of `s`.
///
/// Returns the number and whether the whole string (allowing surrounding
/// whitespace) was numeric. `None` when there is no numeric prefix.
pub fn parse_numeric(s: &str) -> Option<(Num, bool)> {
    let trimmed = s.trim_start_matches(WHITESPACE);
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let int_start = end;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    let mut int_digits = end - int_start;
    let mut is_float = false;
    if bytes.get(end) == Some(&b'.') {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while bytes.get(frac_end).is_some_and(u8::is_ascii_digit) {
            frac_end += 1;
        }
        if int_digits > 0 || frac_end > frac_start {
            is_float = true;
            int_digits += frac_end - frac_start;
            end = frac_end;
        }
    }
    if int_digits == 0 {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let digits_start = exp_end;
        while bytes.get(exp_end).is_some_and(u8::is_ascii_digit) {
            exp_end += 1;
        }
        if exp_end > digits_start {
            is_float = true;
            end = exp_end;
        }
    }

    let literal = &trimmed[..end];
    let whole = trimmed[end..].trim_matches(WHITESPACE).is_empty();
    let num = if is_float {
        Num::Float(literal.parse().ok()?)
    } else {
        match literal.parse::<i64>() {
            Ok(i) => Num::Int(i),
            Err(_) => Num::Float(literal.parse().ok()?),
        }
    };
    Some((num, whole))
}

/// True when `s` is a numeric string.
pub fn is_numeric_str(s: &str) -> bool {
    matches!(parse_numeric(s), Some((_, true)))
}

/// Render a float the way the engine prints it with `precision`
/// significant digits. A precision below 1 selects the shortest
/// representation that round-trips.
pub fn format_float(f: f64, precision: i32) -> String {
    if f.is_nan() {
        return "NAN".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "INF".into() } else { "-INF".into() };
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0".into() } else { "0".into() };
    }

    let precision = precision.min(40);
    let sci = if precision < 1 {
        format!("{f:e}")
    } else {
        format!("{:.*e}", (precision - 1) as usize, f)
    };
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    let limit = if precision < 1 { 15 } else { precision };

    if exp < -4 || exp >= limit {
        let mut mantissa = trim_fraction(mantissa);
        if !mantissa.contains('.') {
            mantissa.push_str(".0");
        }
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{mantissa}E{sign}{}", exp.abs());
    }

    if precision < 1 {
        return trim_fraction(&f.to_string());
    }
    let decimals = (precision - 1 - exp).max(0) as usize;
    trim_fraction(&format!("{f:.decimals$}"))
}

fn trim_fraction(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

/// `(int)` cast semantics. Never fails.
pub fn to_int(v: &Zval) -> i64 {
    match v {
        Zval::Null => 0,
        Zval::Bool(b) => *b as i64,
        Zval::Int(i) => *i,
        Zval::Float(f) => float_to_int(*f),
        Zval::Str(s) => match parse_numeric(s) {
            Some((Num::Int(i), _)) => i,
            Some((Num::Float(f), _)) => float_to_int(f),
            None => 0,
        },
        Zval::Array(arr) => !arr.borrow().is_empty() as i64,
        Zval::Object(_) | Zval::Callable(_) => 1,
        Zval::Resource(res) => res.id as i64,
    }
}

/// Truncating float to int conversion; out-of-range and non-finite give 0.
pub fn float_to_int(f: f64) -> i64 {
    if !f.is_finite() || f >= 9.223_372_036_854_776e18 || f < -9.223_372_036_854_776e18 {
        0
    } else {
        f as i64
    }
}

/// `(float)` cast semantics. Never fails.
pub fn to_float(v: &Zval) -> f64 {
    match v {
        Zval::Float(f) => *f,
        Zval::Str(s) => parse_numeric(s).map(|(n, _)| n.to_f64()).unwrap_or(0.0),
        other => to_int(other) as f64,
    }
}

/// String conversion for echo, concatenation and `(string)` casts.
/// Objects with `__toString` are handled by the interpreter before this.
pub fn to_str(v: &Zval, precision: i32, warnings: &mut Vec<String>) -> Result<Rc<str>, NativeFault> {
    Ok(match v {
        Zval::Null | Zval::Bool(false) => Rc::from(""),
        Zval::Bool(true) => Rc::from("1"),
        Zval::Int(i) => Rc::from(i.to_string()),
        Zval::Float(f) => Rc::from(format_float(*f, precision)),
        Zval::Str(s) => s.clone(),
        Zval::Array(_) => {
            warnings.push("Array to string conversion".into());
            Rc::from("Array")
        }
        Zval::Resource(res) => Rc::from(format!("Resource id #{}", res.id)),
        Zval::Object(_) | Zval::Callable(_) => {
            return Err(NativeFault::throw(
                "Error",
                format!(
                    "Object of class {} could not be converted to string",
                    v.type_name()
                ),
            ));
        }
    })
}

/// Normalize a value used as an array offset.
pub fn to_array_key(v: &Zval, warnings: &mut Vec<String>) -> Result<ArrayKey, NativeFault> {
    Ok(match v {
        Zval::Int(i) => ArrayKey::Int(*i),
        Zval::Str(s) => ArrayKey::from_str_key(s),
        Zval::Bool(b) => ArrayKey::Int(*b as i64),
        Zval::Null => ArrayKey::Str(Rc::from("")),
        Zval::Float(f) => {
            let i = float_to_int(*f);
            if f.fract() != 0.0 || !f.is_finite() {
                warnings.push(format!(
                    "Deprecated: Implicit conversion from float {} to int loses precision",
                    format_float(*f, -1)
                ));
            }
            ArrayKey::Int(i)
        }
        Zval::Resource(res) => {
            warnings.push(format!(
                "Resource ID#{} used as offset, casting to integer ({})",
                res.id, res.id
            ));
            ArrayKey::Int(res.id as i64)
        }
        other => {
            return Err(NativeFault::type_error(format!(
                "Illegal offset type: {}",
                other.type_name()
            )));
        }
    })
}

/// Numeric coercion for arithmetic operands.
fn arith_operand(
    v: &Zval,
    op: BinaryOp,
    other: &Zval,
    lhs_side: bool,
    warnings: &mut Vec<String>,
) -> Result<Num, NativeFault> {
    match v {
        Zval::Null => Ok(Num::Int(0)),
        Zval::Bool(b) => Ok(Num::Int(*b as i64)),
        Zval::Int(i) => Ok(Num::Int(*i)),
        Zval::Float(f) => Ok(Num::Float(*f)),
        Zval::Str(s) => match parse_numeric(s) {
            Some((n, true)) => Ok(n),
            Some((n, false)) => {
                warnings.push("A non-numeric value encountered".into());
                Ok(n)
            }
            None => Err(unsupported(op, v, other, lhs_side)),
        },
        _ => Err(unsupported(op, v, other, lhs_side)),
    }
}

fn unsupported(op: BinaryOp, v: &Zval, other: &Zval, lhs_side: bool) -> NativeFault {
    let (l, r) = if lhs_side { (v, other) } else { (other, v) };
    NativeFault::type_error(format!(
        "Unsupported operand types: {} {} {}",
        l.type_name(),
        op.symbol(),
        r.type_name()
    ))
}

/// Arithmetic operators: `+ - * / % **`.
pub fn arith(op: BinaryOp, a: &Zval, b: &Zval, warnings: &mut Vec<String>) -> Result<Zval, NativeFault> {
    if op == BinaryOp::Add {
        if let (Zval::Array(l), Zval::Array(r)) = (a, b) {
            let mut union: ZArray = l.borrow().clone();
            for (key, value) in r.borrow().iter() {
                if !union.contains_key(key) {
                    union.insert(key.clone(), value.clone());
                }
            }
            return Ok(Zval::array(union));
        }
    }

    let x = arith_operand(a, op, b, true, warnings)?;
    let y = arith_operand(b, op, a, false, warnings)?;

    Ok(match op {
        BinaryOp::Add => int_or_float(x, y, i64::checked_add, |p, q| p + q),
        BinaryOp::Sub => int_or_float(x, y, i64::checked_sub, |p, q| p - q),
        BinaryOp::Mul => int_or_float(x, y, i64::checked_mul, |p, q| p * q),
        BinaryOp::Div => {
            if y.to_f64() == 0.0 {
                return Err(NativeFault::throw("DivisionByZeroError", "Division by zero"));
            }
            match (x, y) {
                (Num::Int(p), Num::Int(q)) if q != 0 && p % q == 0 => match p.checked_div(q) {
                    Some(r) => Zval::Int(r),
                    None => Zval::Float(p as f64 / q as f64),
                },
                _ => Zval::Float(x.to_f64() / y.to_f64()),
            }
        }
        BinaryOp::Mod => {
            let p = num_to_int(x);
            let q = num_to_int(y);
            if q == 0 {
                return Err(NativeFault::throw("DivisionByZeroError", "Modulo by zero"));
            }
            Zval::Int(p.checked_rem(q).unwrap_or(0))
        }
        BinaryOp::Pow => pow(x, y),
        _ => return Err(NativeFault::Fatal(format!("'{}' is not arithmetic", op.symbol()))),
    })
}

fn num_to_int(n: Num) -> i64 {
    match n {
        Num::Int(i) => i,
        Num::Float(f) => float_to_int(f),
    }
}

fn int_or_float(
    x: Num,
    y: Num,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Zval {
    match (x, y) {
        (Num::Int(p), Num::Int(q)) => match int_op(p, q) {
            Some(r) => Zval::Int(r),
            None => Zval::Float(float_op(p as f64, q as f64)),
        },
        _ => Zval::Float(float_op(x.to_f64(), y.to_f64())),
    }
}

fn pow(x: Num, y: Num) -> Zval {
    if let (Num::Int(base), Num::Int(exp)) = (x, y) {
        if exp >= 0 {
            if let Ok(exp) = u32::try_from(exp) {
                if let Some(r) = base.checked_pow(exp) {
                    return Zval::Int(r);
                }
            }
        }
    }
    Zval::Float(x.to_f64().powf(y.to_f64()))
}

/// Numeric negation, `-$x`.
pub fn negate(v: &Zval, warnings: &mut Vec<String>) -> Result<Zval, NativeFault> {
    arith(BinaryOp::Mul, v, &Zval::Int(-1), warnings)
}

/// `++` / `--` semantics. Null increments to 1 and stays null on decrement.
pub fn inc_dec(v: &Zval, increment: bool, warnings: &mut Vec<String>) -> Result<Zval, NativeFault> {
    match v {
        Zval::Null if increment => Ok(Zval::Int(1)),
        Zval::Null => Ok(Zval::Null),
        Zval::Str(s) if parse_numeric(s).is_none_or(|(_, whole)| !whole) => {
            if increment {
                Ok(Zval::string(string_increment(s)))
            } else {
                Ok(v.clone())
            }
        }
        Zval::Bool(_) => Ok(v.clone()),
        _ => {
            let delta = Zval::Int(if increment { 1 } else { -1 });
            arith(BinaryOp::Add, v, &delta, warnings)
        }
    }
}

/// Alphanumeric increment: "a" -> "b", "Az" -> "Ba", "zz" -> "aaa".
fn string_increment(s: &str) -> String {
    if s.is_empty() {
        return "1".into();
    }
    let mut bytes = s.as_bytes().to_vec();
    let mut i = bytes.len();
    while i > 0 {
        i -= 1;
        match bytes[i] {
            b'z' => bytes[i] = b'a',
            b'Z' => bytes[i] = b'A',
            b'9' => bytes[i] = b'0',
            b if b.is_ascii_alphanumeric() => {
                bytes[i] = b + 1;
                return String::from_utf8_lossy(&bytes).into_owned();
            }
            _ => return String::from_utf8_lossy(&bytes).into_owned(),
        }
    }
    let first = match s.as_bytes()[0] {
        b'z' | b'a'..=b'y' => b'a',
        b'Z' | b'A'..=b'Y' => b'A',
        _ => b'1',
    };
    bytes.insert(0, first);
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Strict identity, `===`.
pub fn identical(a: &Zval, b: &Zval) -> bool {
    match (a, b) {
        (Zval::Null, Zval::Null) => true,
        (Zval::Bool(x), Zval::Bool(y)) => x == y,
        (Zval::Int(x), Zval::Int(y)) => x == y,
        (Zval::Float(x), Zval::Float(y)) => x == y,
        (Zval::Str(x), Zval::Str(y)) => x == y,
        (Zval::Array(x), Zval::Array(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|((kx, vx), (ky, vy))| kx == ky && identical(vx, vy))
        }
        (Zval::Object(x), Zval::Object(y)) => Rc::ptr_eq(x, y),
        (Zval::Resource(x), Zval::Resource(y)) => Rc::ptr_eq(x, y),
        (Zval::Callable(x), Zval::Callable(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// Loose equality, `==`.
pub fn loose_equals(a: &Zval, b: &Zval) -> bool {
    match (a, b) {
        (Zval::Array(x), Zval::Array(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| loose_equals(v, w)))
        }
        (Zval::Object(x), Zval::Object(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.class == y.class
                && x.props.len() == y.props.len()
                && x.props
                    .iter()
                    .all(|(k, v)| y.props.get(k).is_some_and(|w| loose_equals(v, w)))
        }
        _ => compare(a, b) == Some(Ordering::Equal),
    }
}

/// Loose ordering used by `< > <= >= <=>`. `None` when uncomparable.
pub fn compare(a: &Zval, b: &Zval) -> Option<Ordering> {
    use Zval::*;
    match (a, b) {
        (Null, Null) => Some(Ordering::Equal),
        (Bool(_), _) | (_, Bool(_)) | (Null, Object(_)) | (Object(_), Null) => {
            Some(a.to_bool().cmp(&b.to_bool()))
        }
        (Null, Str(s)) => Some(str_cmp("", s)),
        (Str(s), Null) => Some(str_cmp(s, "")),
        (Null, _) | (_, Null) => Some(a.to_bool().cmp(&b.to_bool())),
        (Int(_) | Float(_), Int(_) | Float(_)) => num_cmp(num_of(a), num_of(b)),
        (Int(_) | Float(_), Str(s)) => match parse_numeric(s) {
            Some((n, true)) => num_cmp(num_of(a), n),
            _ => Some(str_cmp(&number_string(a), s)),
        },
        (Str(s), Int(_) | Float(_)) => match parse_numeric(s) {
            Some((n, true)) => num_cmp(n, num_of(b)),
            _ => Some(str_cmp(s, &number_string(b))),
        },
        (Str(x), Str(y)) => match (parse_numeric(x), parse_numeric(y)) {
            (Some((p, true)), Some((q, true))) => num_cmp(p, q),
            _ => Some(str_cmp(x, y)),
        },
        (Array(x), Array(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            match x.len().cmp(&y.len()) {
                Ordering::Equal => {}
                other => return Some(other),
            }
            for (k, v) in x.iter() {
                let w = y.get(k)?;
                match compare(v, w)? {
                    Ordering::Equal => {}
                    other => return Some(other),
                }
            }
            Some(Ordering::Equal)
        }
        (Array(_), _) => Some(Ordering::Greater),
        (_, Array(_)) => Some(Ordering::Less),
        (Object(x), Object(y)) => {
            if Rc::ptr_eq(x, y) {
                return Some(Ordering::Equal);
            }
            let (x, y) = (x.borrow(), y.borrow());
            if x.class != y.class {
                return None;
            }
            for (k, v) in x.props.iter() {
                let w = y.props.get(k)?;
                match compare(v, w)? {
                    Ordering::Equal => {}
                    other => return Some(other),
                }
            }
            Some(Ordering::Equal)
        }
        (Resource(x), Resource(y)) => Some(x.id.cmp(&y.id)),
        (Resource(r), _) => num_cmp(Num::Int(r.id as i64), num_of(b)),
        (_, Resource(r)) => num_cmp(num_of(a), Num::Int(r.id as i64)),
        (Callable(x), Callable(y)) if Rc::ptr_eq(x, y) => Some(Ordering::Equal),
        _ => None,
    }
}

fn num_of(v: &Zval) -> Num {
    match v {
        Zval::Int(i) => Num::Int(*i),
        Zval::Float(f) => Num::Float(*f),
        other => Num::Float(to_float(other)),
    }
}

fn number_string(v: &Zval) -> String {
    match v {
        Zval::Int(i) => i.to_string(),
        Zval::Float(f) => format_float(*f, -1),
        _ => String::new(),
    }
}

fn num_cmp(x: Num, y: Num) -> Option<Ordering> {
    match (x, y) {
        (Num::Int(p), Num::Int(q)) => Some(p.cmp(&q)),
        _ => x.to_f64().partial_cmp(&y.to_f64()),
    }
}

fn str_cmp(x: &str, y: &str) -> Ordering {
    x.as_bytes().cmp(y.as_bytes())
}

/// Evaluate a comparison operator.
pub fn comparison(op: BinaryOp, a: &Zval, b: &Zval) -> Zval {
    let ord = compare(a, b);
    match op {
        BinaryOp::Eq => Zval::Bool(loose_equals(a, b)),
        BinaryOp::NotEq => Zval::Bool(!loose_equals(a, b)),
        BinaryOp::Identical => Zval::Bool(identical(a, b)),
        BinaryOp::NotIdentical => Zval::Bool(!identical(a, b)),
        BinaryOp::Lt => Zval::Bool(ord == Some(Ordering::Less)),
        BinaryOp::Gt => Zval::Bool(ord == Some(Ordering::Greater)),
        BinaryOp::Le => Zval::Bool(matches!(ord, Some(Ordering::Less | Ordering::Equal))),
        BinaryOp::Ge => Zval::Bool(matches!(ord, Some(Ordering::Greater | Ordering::Equal))),
        BinaryOp::Spaceship => Zval::Int(match ord {
            Some(Ordering::Less) => -1,
            Some(Ordering::Equal) => 0,
            _ => 1,
        }),
        _ => Zval::Null,
    }
}

/// Name reported by `gettype()`.
pub fn gettype(v: &Zval) -> &'static str {
    match v {
        Zval::Null => "NULL",
        Zval::Bool(_) => "boolean",
        Zval::Int(_) => "integer",
        Zval::Float(_) => "double",
        Zval::Str(_) => "string",
        Zval::Array(_) => "array",
        Zval::Object(_) | Zval::Callable(_) => "object",
        Zval::Resource(res) if res.is_open() => "resource",
        Zval::Resource(_) => "resource (closed)",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_warn() -> Vec<String> {
        Vec::new()
    }

    #[test]
    fn test_parse_numeric() {
        assert_eq!(parse_numeric("42"), Some((Num::Int(42), true)));
        assert_eq!(parse_numeric("  -1.5e3 "), Some((Num::Float(-1500.0), true)));
        assert_eq!(parse_numeric(".5"), Some((Num::Float(0.5), true)));
        assert_eq!(parse_numeric("12abc"), Some((Num::Int(12), false)));
        assert_eq!(parse_numeric("abc"), None);
        assert_eq!(parse_numeric("."), None);
        assert!(is_numeric_str("1e5"));
        assert!(!is_numeric_str("1e"));
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(0.1 + 0.2, 14), "0.3");
        assert_eq!(format_float(2.0, 14), "2");
        assert_eq!(format_float(-0.0, 14), "-0");
        assert_eq!(format_float(1.5, 14), "1.5");
        assert_eq!(format_float(1e25, 14), "1.0E+25");
        assert_eq!(format_float(0.00001, 14), "1.0E-5");
        assert_eq!(format_float(1234.5678, 6), "1234.57");
        assert_eq!(format_float(f64::INFINITY, 14), "INF");
        assert_eq!(format_float(0.1 + 0.2, -1), "0.30000000000000004");
    }

    #[test]
    fn test_integer_overflow_becomes_float() {
        let mut w = no_warn();
        let r = arith(BinaryOp::Add, &Zval::Int(i64::MAX), &Zval::Int(1), &mut w).unwrap();
        assert!(matches!(r, Zval::Float(f) if f == 9.223372036854775808e18));
        let r = arith(BinaryOp::Mul, &Zval::Int(6), &Zval::Int(7), &mut w).unwrap();
        assert!(matches!(r, Zval::Int(42)));
    }

    #[test]
    fn test_division() {
        let mut w = no_warn();
        assert!(matches!(
            arith(BinaryOp::Div, &Zval::Int(6), &Zval::Int(3), &mut w).unwrap(),
            Zval::Int(2)
        ));
        assert!(matches!(
            arith(BinaryOp::Div, &Zval::Int(7), &Zval::Int(2), &mut w).unwrap(),
            Zval::Float(f) if f == 3.5
        ));
        let err = arith(BinaryOp::Div, &Zval::Int(1), &Zval::Int(0), &mut w).unwrap_err();
        assert!(matches!(err, NativeFault::Throw { class, .. } if class == "DivisionByZeroError"));
        let err = arith(BinaryOp::Mod, &Zval::Int(1), &Zval::Int(0), &mut w).unwrap_err();
        assert!(matches!(err, NativeFault::Throw { message, .. } if message == "Modulo by zero"));
    }

    #[test]
    fn test_numeric_strings_in_arithmetic() {
        let mut w = no_warn();
        let r = arith(BinaryOp::Add, &Zval::string("5 apples"), &Zval::Int(1), &mut w).unwrap();
        assert!(matches!(r, Zval::Int(6)));
        assert_eq!(w, vec!["A non-numeric value encountered".to_string()]);

        let err = arith(BinaryOp::Add, &Zval::string("abc"), &Zval::Int(1), &mut w).unwrap_err();
        assert!(
            matches!(err, NativeFault::Throw { message, .. } if message == "Unsupported operand types: string + int")
        );
    }

    #[test]
    fn test_array_union() {
        let mut w = no_warn();
        let a = Zval::array(ZArray::from_iter([Zval::Int(1)]));
        let b = Zval::array(ZArray::from_iter([Zval::Int(9), Zval::Int(2)]));
        let r = arith(BinaryOp::Add, &a, &b, &mut w).unwrap();
        let arr = r.as_array().unwrap().borrow();
        assert_eq!(arr.len(), 2);
        assert!(matches!(arr.get(&ArrayKey::Int(0)), Some(Zval::Int(1))));
    }

    #[test]
    fn test_loose_comparisons() {
        assert!(loose_equals(&Zval::Int(0), &Zval::string("0")));
        assert!(!loose_equals(&Zval::Int(0), &Zval::string("a")));
        assert!(loose_equals(&Zval::Null, &Zval::Bool(false)));
        assert!(loose_equals(&Zval::string("1e1"), &Zval::string("10")));
        assert!(loose_equals(&Zval::Null, &Zval::empty_array()));
        assert!(!identical(&Zval::Int(1), &Zval::Float(1.0)));
        assert_eq!(compare(&Zval::Int(2), &Zval::Float(1.5)), Some(Ordering::Greater));
        assert_eq!(compare(&Zval::string("abc"), &Zval::string("abd")), Some(Ordering::Less));
    }

    #[test]
    fn test_array_keys() {
        let mut w = no_warn();
        assert_eq!(to_array_key(&Zval::string("08"), &mut w).unwrap(), ArrayKey::from("08"));
        assert_eq!(to_array_key(&Zval::Bool(true), &mut w).unwrap(), ArrayKey::Int(1));
        assert_eq!(to_array_key(&Zval::Float(2.0), &mut w).unwrap(), ArrayKey::Int(2));
        assert!(w.is_empty());
        to_array_key(&Zval::Float(2.5), &mut w).unwrap();
        assert_eq!(w.len(), 1);
        assert!(to_array_key(&Zval::empty_array(), &mut w).is_err());
    }

    #[test]
    fn test_increment() {
        let mut w = no_warn();
        assert!(matches!(inc_dec(&Zval::Null, true, &mut w).unwrap(), Zval::Int(1)));
        assert!(matches!(inc_dec(&Zval::Null, false, &mut w).unwrap(), Zval::Null));
        assert_eq!(inc_dec(&Zval::string("Az"), true, &mut w).unwrap().as_str(), Some("Ba"));
        assert_eq!(inc_dec(&Zval::string("zz"), true, &mut w).unwrap().as_str(), Some("aaa"));
        assert!(matches!(inc_dec(&Zval::string("9"), true, &mut w).unwrap(), Zval::Int(10)));
    }

    #[test]
    fn test_to_string() {
        let mut w = no_warn();
        assert_eq!(&*to_str(&Zval::Bool(true), 14, &mut w).unwrap(), "1");
        assert_eq!(&*to_str(&Zval::Float(1.0), 14, &mut w).unwrap(), "1");
        assert_eq!(&*to_str(&Zval::empty_array(), 14, &mut w).unwrap(), "Array");
        assert_eq!(w, vec!["Array to string conversion".to_string()]);
    }
}
