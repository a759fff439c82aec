//! Built-in function library and predefined constants.

mod array;
mod math;
mod misc;
mod output;
mod string;
mod types;

use crate::error::NativeFault;
use crate::request::Request;
use crate::value::{ArrayKey, ArrayRef, ZArray, Zval};
use crate::ops::{self, Num};
use rustc_hash::FxHashMap;
use std::rc::Rc;

pub(crate) type BuiltinResult = Result<Zval, NativeFault>;
pub(crate) type BuiltinFn = fn(&mut Request, &mut Args<'_>) -> BuiltinResult;

/// Entry of the built-in function table.
#[derive(Clone, Copy)]
pub(crate) struct Builtin {
    pub name: &'static str,
    pub min: usize,
    pub max: Option<usize>,
    /// Argument the function updates in place; written back to the
    /// caller's variable.
    pub by_ref: Option<usize>,
    pub func: BuiltinFn,
}

impl Builtin {
    pub(crate) const fn new(
        name: &'static str,
        min: usize,
        max: Option<usize>,
        func: BuiltinFn,
    ) -> Self {
        Self {
            name,
            min,
            max,
            by_ref: None,
            func,
        }
    }

    pub(crate) const fn by_ref(mut self, index: usize) -> Self {
        self.by_ref = Some(index);
        self
    }
}

pub(crate) type BuiltinTable = FxHashMap<&'static str, Builtin>;

pub(crate) fn table() -> BuiltinTable {
    [
        string::FUNCTIONS,
        array::FUNCTIONS,
        math::FUNCTIONS,
        types::FUNCTIONS,
        output::FUNCTIONS,
        misc::FUNCTIONS,
    ]
    .into_iter()
    .flatten()
    .map(|builtin| (builtin.name, *builtin))
    .collect()
}

/// Predefined constant lookup.
pub(crate) fn constant(name: &str) -> Option<Zval> {
    let value = match name {
        "PHP_INT_MAX" => Zval::Int(i64::MAX),
        "PHP_INT_MIN" => Zval::Int(i64::MIN),
        "PHP_INT_SIZE" => Zval::Int(8),
        "PHP_FLOAT_EPSILON" => Zval::Float(f64::EPSILON),
        "PHP_FLOAT_MAX" => Zval::Float(f64::MAX),
        "PHP_FLOAT_MIN" => Zval::Float(f64::MIN_POSITIVE),
        "PHP_FLOAT_DIG" => Zval::Int(15),
        "PHP_EOL" => Zval::string("\n"),
        "PHP_VERSION" => Zval::string("8.3.0"),
        "PHP_MAJOR_VERSION" => Zval::Int(8),
        "PHP_MINOR_VERSION" => Zval::Int(3),
        "M_PI" => Zval::Float(std::f64::consts::PI),
        "M_E" => Zval::Float(std::f64::consts::E),
        "M_SQRT2" => Zval::Float(std::f64::consts::SQRT_2),
        "NAN" => Zval::Float(f64::NAN),
        "INF" => Zval::Float(f64::INFINITY),
        "E_ERROR" => Zval::Int(1),
        "E_WARNING" => Zval::Int(2),
        "E_PARSE" => Zval::Int(4),
        "E_NOTICE" => Zval::Int(8),
        "E_USER_ERROR" => Zval::Int(misc::E_USER_ERROR),
        "E_USER_WARNING" => Zval::Int(misc::E_USER_WARNING),
        "E_USER_NOTICE" => Zval::Int(misc::E_USER_NOTICE),
        "E_DEPRECATED" => Zval::Int(8192),
        "E_USER_DEPRECATED" => Zval::Int(misc::E_USER_DEPRECATED),
        "E_ALL" => Zval::Int(32767),
        "SORT_REGULAR" => Zval::Int(array::SORT_REGULAR),
        "SORT_NUMERIC" => Zval::Int(array::SORT_NUMERIC),
        "SORT_STRING" => Zval::Int(array::SORT_STRING),
        "COUNT_NORMAL" => Zval::Int(0),
        "COUNT_RECURSIVE" => Zval::Int(1),
        "ARRAY_FILTER_USE_BOTH" => Zval::Int(array::FILTER_USE_BOTH),
        "ARRAY_FILTER_USE_KEY" => Zval::Int(array::FILTER_USE_KEY),
        "STR_PAD_LEFT" => Zval::Int(string::PAD_LEFT),
        "STR_PAD_RIGHT" => Zval::Int(string::PAD_RIGHT),
        "STR_PAD_BOTH" => Zval::Int(string::PAD_BOTH),
        "PHP_ROUND_HALF_UP" => Zval::Int(1),
        _ => return None,
    };
    Some(value)
}

/// Arguments of one built-in call.
pub(crate) struct Args<'a> {
    function: &'static str,
    values: &'a mut [Zval],
}

impl<'a> Args<'a> {
    pub(crate) fn new(function: &'static str, values: &'a mut [Zval]) -> Self {
        Self { function, values }
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Zval> {
        self.values.get(index)
    }

    /// Argument `index`, or null when it was not passed.
    pub(crate) fn value(&self, index: usize) -> Zval {
        self.values.get(index).cloned().unwrap_or_default()
    }

    pub(crate) fn rest(&self, from: usize) -> &[Zval] {
        self.values.get(from..).unwrap_or(&[])
    }

    /// Replace a by-reference argument.
    pub(crate) fn set(&mut self, index: usize, value: Zval) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }

    pub(crate) fn type_error(&self, index: usize, param: &str, expected: &str) -> NativeFault {
        NativeFault::type_error(format!(
            "{}(): Argument #{} (${param}) must be of type {expected}, {} given",
            self.function,
            index + 1,
            self.value(index).type_name()
        ))
    }

    pub(crate) fn value_error(&self, index: usize, param: &str, problem: &str) -> NativeFault {
        NativeFault::throw(
            "ValueError",
            format!("{}(): Argument #{} (${param}) {problem}", self.function, index + 1),
        )
    }

    pub(crate) fn string(
        &self,
        req: &mut Request,
        index: usize,
        param: &str,
    ) -> Result<Rc<str>, NativeFault> {
        match self.value(index) {
            Zval::Str(s) => Ok(s),
            Zval::Array(_) | Zval::Resource(_) | Zval::Callable(_) => {
                Err(self.type_error(index, param, "string"))
            }
            Zval::Object(obj) => {
                let class = obj.borrow().class.clone();
                let printable = req
                    .find_class(&class)
                    .is_some_and(|entry| entry.find_method("__toString").is_some());
                if !printable {
                    return Err(self.type_error(index, param, "string"));
                }
                req.stringify(&Zval::Object(obj)).map_err(NativeFault::from)
            }
            scalar => {
                let mut warnings = Vec::new();
                ops::to_str(&scalar, req.ini.precision, &mut warnings)
            }
        }
    }

    pub(crate) fn opt_string(
        &self,
        req: &mut Request,
        index: usize,
        param: &str,
        default: &str,
    ) -> Result<Rc<str>, NativeFault> {
        if index < self.len() {
            self.string(req, index, param)
        } else {
            Ok(Rc::from(default))
        }
    }

    pub(crate) fn int(&self, index: usize, param: &str) -> Result<i64, NativeFault> {
        match self.value(index) {
            Zval::Int(i) => Ok(i),
            Zval::Null => Ok(0),
            Zval::Bool(b) => Ok(i64::from(b)),
            Zval::Float(f) if f.is_finite() => Ok(ops::float_to_int(f)),
            Zval::Str(s) => match ops::parse_numeric(&s) {
                Some((Num::Int(i), true)) => Ok(i),
                Some((Num::Float(f), true)) if f.is_finite() => Ok(ops::float_to_int(f)),
                _ => Err(self.type_error(index, param, "int")),
            },
            _ => Err(self.type_error(index, param, "int")),
        }
    }

    pub(crate) fn opt_int(&self, index: usize, param: &str, default: i64) -> Result<i64, NativeFault> {
        if index < self.len() {
            self.int(index, param)
        } else {
            Ok(default)
        }
    }

    /// Optional nullable int; null and absent both yield `None`.
    pub(crate) fn nullable_int(&self, index: usize, param: &str) -> Result<Option<i64>, NativeFault> {
        match self.get(index) {
            None | Some(Zval::Null) => Ok(None),
            Some(_) => self.int(index, param).map(Some),
        }
    }

    pub(crate) fn float(&self, index: usize, param: &str) -> Result<f64, NativeFault> {
        match self.value(index) {
            Zval::Float(f) => Ok(f),
            Zval::Int(i) => Ok(i as f64),
            Zval::Null => Ok(0.0),
            Zval::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
            Zval::Str(s) => match ops::parse_numeric(&s) {
                Some((n, true)) => Ok(n.to_f64()),
                _ => Err(self.type_error(index, param, "float")),
            },
            _ => Err(self.type_error(index, param, "float")),
        }
    }

    /// `int|float` argument.
    pub(crate) fn number(&self, index: usize, param: &str) -> Result<Num, NativeFault> {
        match self.value(index) {
            Zval::Int(i) => Ok(Num::Int(i)),
            Zval::Float(f) => Ok(Num::Float(f)),
            Zval::Null => Ok(Num::Int(0)),
            Zval::Bool(b) => Ok(Num::Int(i64::from(b))),
            Zval::Str(s) => match ops::parse_numeric(&s) {
                Some((n, true)) => Ok(n),
                _ => Err(self.type_error(index, param, "int|float")),
            },
            _ => Err(self.type_error(index, param, "int|float")),
        }
    }

    pub(crate) fn bool(&self, index: usize, param: &str) -> Result<bool, NativeFault> {
        match self.value(index) {
            Zval::Array(_) | Zval::Object(_) | Zval::Resource(_) | Zval::Callable(_) => {
                Err(self.type_error(index, param, "bool"))
            }
            scalar => Ok(scalar.to_bool()),
        }
    }

    pub(crate) fn opt_bool(&self, index: usize, param: &str, default: bool) -> Result<bool, NativeFault> {
        if index < self.len() {
            self.bool(index, param)
        } else {
            Ok(default)
        }
    }

    pub(crate) fn array(&self, index: usize, param: &str) -> Result<ArrayRef, NativeFault> {
        match self.get(index) {
            Some(Zval::Array(array)) => Ok(array.clone()),
            _ => Err(self.type_error(index, param, "array")),
        }
    }

    pub(crate) fn callable(
        &self,
        req: &Request,
        index: usize,
        param: &str,
    ) -> Result<Zval, NativeFault> {
        let value = self.value(index);
        if req.is_callable(&value) {
            Ok(value)
        } else {
            Err(NativeFault::type_error(format!(
                "{}(): Argument #{} (${param}) must be a valid callback, {}",
                self.function,
                index + 1,
                match &value {
                    Zval::Str(name) => format!("function \"{name}\" not found or invalid function name"),
                    _ => "no array or string given".to_string(),
                }
            )))
        }
    }
}

/// String conversion for built-ins, honouring `__toString`.
pub(crate) fn to_text(req: &mut Request, value: &Zval) -> Result<Rc<str>, NativeFault> {
    match value {
        Zval::Str(s) => Ok(s.clone()),
        other => req.stringify(other).map_err(NativeFault::from),
    }
}

/// Copy of the entries of `array`, safe to hold across script callbacks.
pub(crate) fn entries(array: &ArrayRef) -> Vec<(ArrayKey, Zval)> {
    array
        .borrow()
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Build a list from values, renumbering from zero.
pub(crate) fn list(values: impl IntoIterator<Item = Zval>) -> Zval {
    Zval::array(values.into_iter().collect::<ZArray>())
}

/// String result from raw bytes.
pub(crate) fn bytes_to_zval(bytes: &[u8]) -> Zval {
    match std::str::from_utf8(bytes) {
        Ok(s) => Zval::string(s),
        Err(_) => Zval::from(String::from_utf8_lossy(bytes).into_owned()),
    }
}
