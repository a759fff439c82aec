//! Error reporting, ini access, callbacks and constants.

use super::{list, Args, Builtin, BuiltinResult};
use crate::error::NativeFault;
use crate::request::{Request, WarningLevel};
use crate::value::Zval;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

pub(super) const E_USER_ERROR: i64 = 256;
pub(super) const E_USER_WARNING: i64 = 512;
pub(super) const E_USER_NOTICE: i64 = 1024;
pub(super) const E_USER_DEPRECATED: i64 = 16384;

pub(super) const FUNCTIONS: &[Builtin] = &[
    Builtin::new("trigger_error", 1, Some(2), trigger_error),
    Builtin::new("user_error", 1, Some(2), trigger_error),
    Builtin::new("ini_get", 1, Some(1), ini_get),
    Builtin::new("ini_set", 2, Some(2), ini_set),
    Builtin::new("call_user_func", 1, None, call_user_func),
    Builtin::new("call_user_func_array", 2, Some(2), call_user_func_array),
    Builtin::new("func_get_args", 0, Some(0), func_get_args),
    Builtin::new("func_num_args", 0, Some(0), func_num_args),
    Builtin::new("define", 2, Some(2), define),
    Builtin::new("defined", 1, Some(1), defined),
    Builtin::new("constant", 1, Some(1), constant),
    Builtin::new("time", 0, Some(0), time),
    Builtin::new("microtime", 0, Some(1), microtime),
];

fn trigger_error(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let message = args.string(req, 0, "message")?;
    let level = match args.opt_int(1, "error_level", E_USER_NOTICE)? {
        E_USER_ERROR => {
            return Err(NativeFault::throw("Error", message.to_string()));
        }
        E_USER_WARNING => WarningLevel::UserWarning,
        E_USER_NOTICE => WarningLevel::UserNotice,
        E_USER_DEPRECATED => WarningLevel::UserDeprecated,
        _ => {
            return Err(args.value_error(
                1,
                "error_level",
                "must be one of E_USER_ERROR, E_USER_WARNING, E_USER_NOTICE, or E_USER_DEPRECATED",
            ));
        }
    };
    req.push_warning(level, message.to_string());
    Ok(Zval::Bool(true))
}

fn ini_get(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let name = args.string(req, 0, "option")?;
    Ok(req.ini.get(&name).map_or(Zval::Bool(false), Zval::from))
}

fn ini_set(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let name = args.string(req, 0, "option")?;
    let value = args.string(req, 1, "value")?;
    let old = req.ini.get(&name);
    match req.ini.set(&name, &value) {
        Ok(()) => Ok(old.map_or(Zval::Bool(false), Zval::from)),
        Err(_) => Ok(Zval::Bool(false)),
    }
}

fn call_user_func(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let callback = args.callable(req, 0, "callback")?;
    let call_args = args.rest(1).to_vec();
    req.invoke(&callback, call_args)
}

fn call_user_func_array(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let callback = args.callable(req, 0, "callback")?;
    let call_args: Vec<Zval> = args.array(1, "args")?.borrow().values().cloned().collect();
    req.invoke(&callback, call_args)
}

fn caller_args(req: &Request, function: &str) -> Result<Vec<Zval>, NativeFault> {
    if req.frames.len() <= 1 {
        return Err(NativeFault::throw(
            "Error",
            format!("{function}() cannot be called from the global scope"),
        ));
    }
    Ok(req.current_frame().args.clone())
}

fn func_get_args(req: &mut Request, _args: &mut Args<'_>) -> BuiltinResult {
    Ok(list(caller_args(req, "func_get_args")?))
}

fn func_num_args(req: &mut Request, _args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Int(caller_args(req, "func_num_args")?.len() as i64))
}

fn define(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let name = args.string(req, 0, "constant_name")?;
    let value = args.value(1);
    if matches!(value, Zval::Object(_) | Zval::Callable(_) | Zval::Resource(_)) {
        return Err(args.type_error(1, "value", "array|string|int|float|bool|null"));
    }
    if req.constants.contains_key(&*name) || super::constant(&name).is_some() {
        req.warn(format!("Constant {name} already defined"));
        return Ok(Zval::Bool(false));
    }
    req.constants.insert(Rc::clone(&name), value);
    Ok(Zval::Bool(true))
}

fn defined(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let name = args.string(req, 0, "constant_name")?;
    Ok(Zval::Bool(
        req.constants.contains_key(&*name) || super::constant(&name).is_some(),
    ))
}

fn constant(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let name = args.string(req, 0, "name")?;
    if let Some(value) = req.constants.get(&*name) {
        return Ok(value.clone());
    }
    super::constant(&name).ok_or_else(|| {
        NativeFault::throw("Error", format!("Undefined constant \"{name}\""))
    })
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

fn time(_req: &mut Request, _args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Int(now() as i64))
}

fn microtime(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let now = now();
    if args.opt_bool(0, "as_float", false)? {
        return Ok(Zval::Float(now));
    }
    Ok(Zval::from(format!("{:.8} {}", now.fract(), now.trunc() as i64)))
}
