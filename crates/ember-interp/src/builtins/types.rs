//! Type inspection, conversion and class introspection.

use super::{Args, Builtin, BuiltinResult};
use crate::classes::ClassEntry;
use crate::error::NativeFault;
use crate::ops;
use crate::request::Request;
use crate::value::{ArrayKey, ZArray, Zval};
use std::rc::Rc;

pub(super) const FUNCTIONS: &[Builtin] = &[
    Builtin::new("gettype", 1, Some(1), gettype),
    Builtin::new("get_debug_type", 1, Some(1), get_debug_type),
    Builtin::new("is_int", 1, Some(1), is_int),
    Builtin::new("is_integer", 1, Some(1), is_int),
    Builtin::new("is_long", 1, Some(1), is_int),
    Builtin::new("is_float", 1, Some(1), is_float),
    Builtin::new("is_double", 1, Some(1), is_float),
    Builtin::new("is_string", 1, Some(1), is_string),
    Builtin::new("is_bool", 1, Some(1), is_bool),
    Builtin::new("is_array", 1, Some(1), is_array),
    Builtin::new("is_null", 1, Some(1), is_null),
    Builtin::new("is_numeric", 1, Some(1), is_numeric),
    Builtin::new("is_scalar", 1, Some(1), is_scalar),
    Builtin::new("is_object", 1, Some(1), is_object),
    Builtin::new("is_iterable", 1, Some(1), is_array),
    Builtin::new("is_countable", 1, Some(1), is_array),
    Builtin::new("is_resource", 1, Some(1), is_resource),
    Builtin::new("is_callable", 1, Some(1), is_callable),
    Builtin::new("intval", 1, Some(2), intval),
    Builtin::new("floatval", 1, Some(1), floatval),
    Builtin::new("doubleval", 1, Some(1), floatval),
    Builtin::new("strval", 1, Some(1), strval),
    Builtin::new("boolval", 1, Some(1), boolval),
    Builtin::new("get_class", 0, Some(1), get_class),
    Builtin::new("get_parent_class", 0, Some(1), get_parent_class),
    Builtin::new("method_exists", 2, Some(2), method_exists),
    Builtin::new("property_exists", 2, Some(2), property_exists),
    Builtin::new("class_exists", 1, Some(2), class_exists),
    Builtin::new("function_exists", 1, Some(1), function_exists),
    Builtin::new("spl_object_id", 1, Some(1), spl_object_id),
    Builtin::new("spl_object_hash", 1, Some(1), spl_object_hash),
    Builtin::new("get_object_vars", 1, Some(1), get_object_vars),
    Builtin::new("is_a", 2, Some(3), is_a),
    Builtin::new("is_subclass_of", 2, Some(3), is_subclass_of),
    Builtin::new("get_resource_type", 1, Some(1), get_resource_type),
    Builtin::new("get_resource_id", 1, Some(1), get_resource_id),
];

fn gettype(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::string(ops::gettype(&args.value(0))))
}

fn get_debug_type(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let name = match args.value(0) {
        Zval::Resource(res) if res.is_open() => format!("resource ({})", res.kind),
        Zval::Resource(_) => "resource (closed)".to_string(),
        other => other.type_name(),
    };
    Ok(Zval::from(name))
}

macro_rules! predicate {
    ($name:ident, $pattern:pat) => {
        fn $name(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
            Ok(Zval::Bool(matches!(args.value(0), $pattern)))
        }
    };
}

predicate!(is_int, Zval::Int(_));
predicate!(is_float, Zval::Float(_));
predicate!(is_string, Zval::Str(_));
predicate!(is_bool, Zval::Bool(_));
predicate!(is_array, Zval::Array(_));
predicate!(is_null, Zval::Null);
predicate!(is_scalar, Zval::Int(_) | Zval::Float(_) | Zval::Str(_) | Zval::Bool(_));
predicate!(is_object, Zval::Object(_) | Zval::Callable(_));

fn is_numeric(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Bool(match args.value(0) {
        Zval::Int(_) | Zval::Float(_) => true,
        Zval::Str(s) => ops::is_numeric_str(&s),
        _ => false,
    }))
}

fn is_resource(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Bool(matches!(args.value(0), Zval::Resource(res) if res.is_open())))
}

fn is_callable(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Bool(req.is_callable(&args.value(0))))
}

/// Integer prefix of `s` in `base`; 0 detects the base from its prefix.
/// Out-of-range values saturate.
fn parse_int_base(s: &str, base: u32) -> i64 {
    let s = s.trim_start();
    let (negative, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let lower = s.to_ascii_lowercase();
    let (base, digits) = match base {
        16 => (16, lower.strip_prefix("0x").unwrap_or(&lower)),
        8 => (8, lower.strip_prefix("0o").unwrap_or(&lower)),
        2 => (2, lower.strip_prefix("0b").unwrap_or(&lower)),
        0 if lower.starts_with("0x") => (16, &lower[2..]),
        0 if lower.starts_with("0b") => (2, &lower[2..]),
        0 if lower.starts_with("0o") => (8, &lower[2..]),
        0 if lower.starts_with('0') => (8, &lower[1..]),
        0 => (10, lower.as_str()),
        other => (other, lower.as_str()),
    };
    let valid: String = digits.chars().take_while(|c| c.is_digit(base)).collect();
    if valid.is_empty() {
        return 0;
    }
    match i64::from_str_radix(&valid, base) {
        Ok(n) if negative => -n,
        Ok(n) => n,
        Err(_) if negative => i64::MIN,
        Err(_) => i64::MAX,
    }
}

fn intval(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let base = args.opt_int(1, "base", 10)?;
    if base != 0 && !(2..=36).contains(&base) {
        return Err(args.value_error(1, "base", "must be between 2 and 36 (inclusive)"));
    }
    Ok(Zval::Int(match args.value(0) {
        Zval::Str(s) if base != 10 => parse_int_base(&s, base as u32),
        other => ops::to_int(&other),
    }))
}

fn floatval(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Float(ops::to_float(&args.value(0))))
}

fn strval(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Str(super::to_text(req, &args.value(0))?))
}

fn boolval(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Bool(args.value(0).to_bool()))
}

/// Class of an object, or the class named by a string.
fn class_entry(req: &Request, value: &Zval) -> Option<Rc<ClassEntry>> {
    match value {
        Zval::Object(obj) => {
            let class = obj.borrow().class.clone();
            req.find_class(&class)
        }
        Zval::Str(name) => req.find_class(name),
        _ => None,
    }
}

fn get_class(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    match args.get(0) {
        None => match &req.current_frame().class {
            Some(class) => Ok(Zval::Str(class.name.clone())),
            None => Err(NativeFault::throw(
                "Error",
                "get_class() without arguments must be called from within a class",
            )),
        },
        Some(Zval::Object(obj)) => Ok(Zval::Str(obj.borrow().class.clone())),
        Some(Zval::Callable(_)) => Ok(Zval::string("Closure")),
        Some(_) => Err(args.type_error(0, "object", "object")),
    }
}

fn get_parent_class(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let entry = match args.get(0) {
        None => req.current_frame().class.clone(),
        Some(value) => class_entry(req, value),
    };
    Ok(entry
        .and_then(|entry| entry.parent.clone())
        .map_or(Zval::Bool(false), |parent| Zval::Str(parent.name.clone())))
}

fn class_argument(req: &Request, args: &Args<'_>) -> Result<Option<Rc<ClassEntry>>, NativeFault> {
    match args.value(0) {
        value @ (Zval::Object(_) | Zval::Str(_)) => Ok(class_entry(req, &value)),
        _ => Err(args.type_error(0, "object_or_class", "object|string")),
    }
}

fn method_exists(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let entry = class_argument(req, args)?;
    let method = args.string(req, 1, "method")?;
    Ok(Zval::Bool(entry.is_some_and(|entry| entry.find_method(&method).is_some())))
}

fn property_exists(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let entry = class_argument(req, args)?;
    let property = args.string(req, 1, "property")?;
    if let Zval::Object(obj) = args.value(0) {
        if obj.borrow().props.contains_key(&*property) {
            return Ok(Zval::Bool(true));
        }
    }
    let declared = entry.is_some_and(|entry| {
        entry
            .lineage()
            .any(|class| class.props.iter().any(|(name, _)| **name == *property))
    });
    Ok(Zval::Bool(declared))
}

fn class_exists(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let name = args.string(req, 0, "class")?;
    Ok(Zval::Bool(req.class_exists(&name)))
}

fn function_exists(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let name = args.string(req, 0, "function")?;
    Ok(Zval::Bool(req.has_function(&name)))
}

fn object_id(args: &Args<'_>) -> Result<u32, NativeFault> {
    match args.value(0) {
        Zval::Object(obj) => Ok(obj.borrow().id),
        Zval::Callable(callable) => Ok(callable.id),
        _ => Err(args.type_error(0, "object", "object")),
    }
}

fn spl_object_id(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Int(i64::from(object_id(args)?)))
}

fn spl_object_hash(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::from(format!("{:032x}", object_id(args)?)))
}

fn get_object_vars(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let Zval::Object(obj) = args.value(0) else {
        return Err(args.type_error(0, "object", "object"));
    };
    let vars: ZArray = obj
        .borrow()
        .props
        .iter()
        .map(|(name, value)| (ArrayKey::from(&**name), value.clone()))
        .collect();
    Ok(Zval::array(vars))
}

fn is_a(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let class = args.string(req, 1, "class")?;
    let allow_string = args.opt_bool(2, "allow_string", false)?;
    Ok(Zval::Bool(match args.value(0) {
        value @ (Zval::Object(_) | Zval::Callable(_)) => req.instance_of(&value, &class),
        Zval::Str(name) if allow_string => req
            .find_class(&name)
            .is_some_and(|entry| entry.is_subclass_of(&class)),
        _ => false,
    }))
}

fn is_subclass_of(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let class = args.string(req, 1, "class")?;
    let allow_string = args.opt_bool(2, "allow_string", true)?;
    let value = args.value(0);
    if matches!(value, Zval::Str(_)) && !allow_string {
        return Ok(Zval::Bool(false));
    }
    Ok(Zval::Bool(class_entry(req, &value).is_some_and(|entry| {
        !entry.name.eq_ignore_ascii_case(&class) && entry.is_subclass_of(&class)
    })))
}

fn get_resource_type(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    match args.value(0) {
        Zval::Resource(res) if res.is_open() => Ok(Zval::Str(res.kind.clone())),
        Zval::Resource(_) => Ok(Zval::string("Unknown")),
        _ => Err(args.type_error(0, "resource", "resource")),
    }
}

fn get_resource_id(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    match args.value(0) {
        Zval::Resource(res) => Ok(Zval::Int(i64::from(res.id))),
        _ => Err(args.type_error(0, "resource", "resource")),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_int_base;
    use crate::request::Request;
    use crate::runtime::{IniSettings, Runtime};

    #[test]
    fn test_parse_int_base() {
        assert_eq!(parse_int_base("ff", 16), 255);
        assert_eq!(parse_int_base("0x1A", 16), 26);
        assert_eq!(parse_int_base("0x1A", 0), 26);
        assert_eq!(parse_int_base("012", 0), 10);
        assert_eq!(parse_int_base("-101", 2), -5);
        assert_eq!(parse_int_base("zz", 10), 0);
    }

    #[test]
    fn test_introspection() {
        let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        request
            .eval(
                r#"<?php
                class A { public $x = 1; public function m() {} }
                class B extends A {}
                $b = new B;
                echo get_class($b), get_parent_class($b), "|";
                echo var_export(method_exists($b, 'm'), true), var_export(property_exists('B', 'x'), true), "|";
                echo var_export(is_subclass_of($b, 'A'), true), var_export(is_a($b, 'B'), true), "|";
                echo gettype(1.5), get_debug_type(null), get_debug_type($b), "|";
                echo intval("42abc"), intval("ff", 16), var_export(is_numeric("1e3"), true);
                "#,
                "t.php",
            )
            .unwrap();
        assert_eq!(
            request.take_output(),
            "BA|truetrue|truetrue|doublenullB|42255true"
        );
    }
}
