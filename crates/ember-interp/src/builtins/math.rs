//! Math functions.

use super::{Args, Builtin, BuiltinResult};
use crate::ast::BinaryOp;
use crate::error::NativeFault;
use crate::ops::{self, Num};
use crate::request::Request;
use crate::value::Zval;

pub(super) const FUNCTIONS: &[Builtin] = &[
    Builtin::new("abs", 1, Some(1), abs),
    Builtin::new("floor", 1, Some(1), floor),
    Builtin::new("ceil", 1, Some(1), ceil),
    Builtin::new("round", 1, Some(2), round),
    Builtin::new("intdiv", 2, Some(2), intdiv),
    Builtin::new("fmod", 2, Some(2), fmod),
    Builtin::new("sqrt", 1, Some(1), sqrt),
    Builtin::new("pow", 2, Some(2), pow),
    Builtin::new("pi", 0, Some(0), pi),
    Builtin::new("dechex", 1, Some(1), dechex),
    Builtin::new("hexdec", 1, Some(1), hexdec),
    Builtin::new("decbin", 1, Some(1), decbin),
    Builtin::new("bindec", 1, Some(1), bindec),
    Builtin::new("is_nan", 1, Some(1), is_nan),
    Builtin::new("is_finite", 1, Some(1), is_finite),
    Builtin::new("is_infinite", 1, Some(1), is_infinite),
];

/// Round half away from zero to `places` decimal places, pre-rounding to
/// 15 significant digits so that `1.005` rounds up.
pub(super) fn round_to(value: f64, places: i64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let places = places.clamp(-308, 308) as i32;
    let factor = 10f64.powi(places.abs());
    let scaled = if places >= 0 { value * factor } else { value / factor };
    if !scaled.is_finite() {
        return value;
    }
    let pre: f64 = format!("{scaled:.14e}").parse().unwrap_or(scaled);
    let rounded = pre.round();
    let result = if places >= 0 { rounded / factor } else { rounded * factor };
    if result.is_finite() { result } else { value }
}

fn abs(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(match args.number(0, "num")? {
        Num::Int(i64::MIN) => Zval::Float(-(i64::MIN as f64)),
        Num::Int(i) => Zval::Int(i.abs()),
        Num::Float(f) => Zval::Float(f.abs()),
    })
}

fn floor(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Float(args.number(0, "num")?.to_f64().floor()))
}

fn ceil(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Float(args.number(0, "num")?.to_f64().ceil()))
}

fn round(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let num = args.number(0, "num")?;
    let precision = args.opt_int(1, "precision", 0)?;
    Ok(Zval::Float(round_to(num.to_f64(), precision)))
}

fn intdiv(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let num1 = args.int(0, "num1")?;
    let num2 = args.int(1, "num2")?;
    if num2 == 0 {
        return Err(NativeFault::throw("DivisionByZeroError", "Division by zero"));
    }
    match num1.checked_div(num2) {
        Some(q) => Ok(Zval::Int(q)),
        None => Err(NativeFault::throw(
            "ArithmeticError",
            "Division of PHP_INT_MIN by -1 is not an integer",
        )),
    }
}

fn fmod(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let num1 = args.float(0, "num1")?;
    let num2 = args.float(1, "num2")?;
    Ok(Zval::Float(num1 % num2))
}

fn sqrt(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Float(args.float(0, "num")?.sqrt()))
}

fn pow(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let (base, exp) = (args.value(0), args.value(1));
    req.op(|w| ops::arith(BinaryOp::Pow, &base, &exp, w))
        .map_err(NativeFault::from)
}

fn pi(_req: &mut Request, _args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Float(std::f64::consts::PI))
}

fn dechex(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::from(format!("{:x}", args.int(0, "num")?)))
}

fn decbin(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::from(format!("{:b}", args.int(0, "num")?)))
}

/// Parse digits in `radix`, skipping invalid characters; overflow yields a
/// float.
fn parse_radix(digits: &str, radix: u32) -> Zval {
    let mut int: i64 = 0;
    let mut float: Option<f64> = None;
    for digit in digits.chars().filter_map(|c| c.to_digit(radix)) {
        match float.as_mut() {
            Some(f) => *f = *f * f64::from(radix) + f64::from(digit),
            None => match int
                .checked_mul(i64::from(radix))
                .and_then(|n| n.checked_add(i64::from(digit)))
            {
                Some(n) => int = n,
                None => float = Some(int as f64 * f64::from(radix) + f64::from(digit)),
            },
        }
    }
    float.map_or(Zval::Int(int), Zval::Float)
}

fn hexdec(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let s = args.string(req, 0, "hex_string")?;
    Ok(parse_radix(&s, 16))
}

fn bindec(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let s = args.string(req, 0, "binary_string")?;
    Ok(parse_radix(&s, 2))
}

fn is_nan(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Bool(args.float(0, "num")?.is_nan()))
}

fn is_finite(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Bool(args.float(0, "num")?.is_finite()))
}

fn is_infinite(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Bool(args.float(0, "num")?.is_infinite()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(round_to(2.5, 0), 3.0);
        assert_eq!(round_to(-2.5, 0), -3.0);
        assert_eq!(round_to(1.005, 2), 1.01);
        assert_eq!(round_to(1234.5678, -2), 1200.0);
        assert!(round_to(f64::NAN, 2).is_nan());
    }

    #[test]
    fn test_parse_radix() {
        assert!(matches!(parse_radix("ff", 16), Zval::Int(255)));
        assert!(matches!(parse_radix("1x01", 2), Zval::Int(5)));
        assert!(matches!(parse_radix("ffffffffffffffffff", 16), Zval::Float(_)));
    }
}
