//! Typed extraction from and construction of [`HostValue`].
//!
//! Numeric conversions are lossless where possible: integers widen, and
//! unsigned values beyond `i64::MAX` become floats. `NumericOverflow` is
//! reserved for values the target type cannot hold at all.

use crate::error::{CoreError, CoreResult};
use crate::host::{HostKey, HostMap, HostObject, HostValue};
use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;

/// Extract a Rust value from a host value.
pub trait FromHost: Sized {
    fn from_host(value: &HostValue) -> CoreResult<Self>;
}

/// Turn a Rust value into a host value.
pub trait IntoHost {
    fn into_host(self) -> HostValue;
}

impl FromHost for HostValue {
    fn from_host(value: &HostValue) -> CoreResult<Self> {
        Ok(value.clone())
    }
}

impl IntoHost for HostValue {
    fn into_host(self) -> HostValue {
        self
    }
}

impl FromHost for () {
    fn from_host(_value: &HostValue) -> CoreResult<Self> {
        Ok(())
    }
}

impl IntoHost for () {
    fn into_host(self) -> HostValue {
        HostValue::Null
    }
}

impl FromHost for bool {
    fn from_host(value: &HostValue) -> CoreResult<Self> {
        value
            .as_bool()
            .ok_or_else(|| CoreError::type_mismatch("bool", value.type_name()))
    }
}

impl IntoHost for bool {
    fn into_host(self) -> HostValue {
        HostValue::Bool(self)
    }
}

/// Integer value of `value`, accepting floats that hold an exact integer.
fn integer(value: &HostValue, target: &'static str) -> CoreResult<i128> {
    match value {
        HostValue::Int(i) => Ok(i128::from(*i)),
        HostValue::Float(f) => {
            // 2^64 bounds every supported integer target.
            if !f.is_finite() || f.fract() != 0.0 || f.abs() >= 18_446_744_073_709_551_616.0 {
                return Err(CoreError::overflow(f, target));
            }
            Ok(*f as i128)
        }
        other => Err(CoreError::type_mismatch(target, other.type_name())),
    }
}

macro_rules! int_conversions {
    ($($ty:ty),*) => {$(
        impl FromHost for $ty {
            fn from_host(value: &HostValue) -> CoreResult<Self> {
                let wide = integer(value, stringify!($ty))?;
                <$ty>::try_from(wide).map_err(|_| CoreError::overflow(wide, stringify!($ty)))
            }
        }
    )*};
}

int_conversions!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! widening_into_host {
    ($($ty:ty),*) => {$(
        impl IntoHost for $ty {
            fn into_host(self) -> HostValue {
                HostValue::Int(i64::from(self))
            }
        }
    )*};
}

widening_into_host!(i8, i16, i32, i64, u8, u16, u32);

impl IntoHost for isize {
    fn into_host(self) -> HostValue {
        HostValue::Int(self as i64)
    }
}

impl IntoHost for u64 {
    fn into_host(self) -> HostValue {
        match i64::try_from(self) {
            Ok(i) => HostValue::Int(i),
            Err(_) => HostValue::Float(self as f64),
        }
    }
}

impl IntoHost for usize {
    fn into_host(self) -> HostValue {
        (self as u64).into_host()
    }
}

impl FromHost for f64 {
    fn from_host(value: &HostValue) -> CoreResult<Self> {
        value
            .as_f64()
            .ok_or_else(|| CoreError::type_mismatch("float", value.type_name()))
    }
}

impl IntoHost for f64 {
    fn into_host(self) -> HostValue {
        HostValue::Float(self)
    }
}

impl FromHost for f32 {
    fn from_host(value: &HostValue) -> CoreResult<Self> {
        let wide = f64::from_host(value)?;
        if wide.is_finite() && wide.abs() > f64::from(f32::MAX) {
            return Err(CoreError::overflow(wide, "f32"));
        }
        Ok(wide as f32)
    }
}

impl IntoHost for f32 {
    fn into_host(self) -> HostValue {
        HostValue::Float(f64::from(self))
    }
}

impl FromHost for String {
    fn from_host(value: &HostValue) -> CoreResult<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CoreError::type_mismatch("string", value.type_name()))
    }
}

impl IntoHost for String {
    fn into_host(self) -> HostValue {
        HostValue::String(self)
    }
}

impl IntoHost for &str {
    fn into_host(self) -> HostValue {
        HostValue::String(self.to_string())
    }
}

impl<T: FromHost> FromHost for Option<T> {
    fn from_host(value: &HostValue) -> CoreResult<Self> {
        match value {
            HostValue::Null => Ok(None),
            other => T::from_host(other).map(Some),
        }
    }
}

impl<T: IntoHost> IntoHost for Option<T> {
    fn into_host(self) -> HostValue {
        self.map_or(HostValue::Null, IntoHost::into_host)
    }
}

/// Elements of a list, or values of a map in order.
fn elements(value: &HostValue) -> CoreResult<Vec<&HostValue>> {
    match value {
        HostValue::List(items) => Ok(items.iter().collect()),
        HostValue::Map(map) => Ok(map.values().collect()),
        other => Err(CoreError::type_mismatch("list", other.type_name())),
    }
}

impl<T: FromHost> FromHost for Vec<T> {
    fn from_host(value: &HostValue) -> CoreResult<Self> {
        elements(value)?.into_iter().map(T::from_host).collect()
    }
}

impl<T: IntoHost> IntoHost for Vec<T> {
    fn into_host(self) -> HostValue {
        HostValue::List(self.into_iter().map(IntoHost::into_host).collect())
    }
}

/// Key/value pairs of a map, indices of a list, or properties of an object.
fn pairs(value: &HostValue) -> CoreResult<Vec<(String, &HostValue)>> {
    match value {
        HostValue::Map(map) => Ok(map.iter().map(|(k, v)| (k.to_string(), v)).collect()),
        HostValue::List(items) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect()),
        HostValue::Object(obj) => Ok(obj.properties.iter().map(|(k, v)| (k.clone(), v)).collect()),
        other => Err(CoreError::type_mismatch("map", other.type_name())),
    }
}

impl<T: FromHost> FromHost for IndexMap<String, T> {
    fn from_host(value: &HostValue) -> CoreResult<Self> {
        pairs(value)?
            .into_iter()
            .map(|(k, v)| T::from_host(v).map(|t| (k, t)))
            .collect()
    }
}

impl<T: IntoHost> IntoHost for IndexMap<String, T> {
    fn into_host(self) -> HostValue {
        HostValue::Map(
            self.into_iter()
                .map(|(k, v)| (HostKey::from(k), v.into_host()))
                .collect(),
        )
    }
}

impl<T: FromHost, S: BuildHasher + Default> FromHost for HashMap<String, T, S> {
    fn from_host(value: &HostValue) -> CoreResult<Self> {
        pairs(value)?
            .into_iter()
            .map(|(k, v)| T::from_host(v).map(|t| (k, t)))
            .collect()
    }
}

impl<T: FromHost> FromHost for BTreeMap<String, T> {
    fn from_host(value: &HostValue) -> CoreResult<Self> {
        pairs(value)?
            .into_iter()
            .map(|(k, v)| T::from_host(v).map(|t| (k, t)))
            .collect()
    }
}

impl<T: IntoHost> IntoHost for BTreeMap<String, T> {
    fn into_host(self) -> HostValue {
        HostValue::Map(
            self.into_iter()
                .map(|(k, v)| (HostKey::from(k), v.into_host()))
                .collect::<HostMap>(),
        )
    }
}

impl FromHost for serde_json::Value {
    fn from_host(value: &HostValue) -> CoreResult<Self> {
        value.to_json()
    }
}

impl IntoHost for serde_json::Value {
    fn into_host(self) -> HostValue {
        HostValue::from(self)
    }
}

/// A Rust type mirrored by an engine class.
///
/// Fields map to properties through serde. Registering the type with an
/// engine declares the class with the properties of `Default::default()`.
pub trait EngineClass: Serialize + DeserializeOwned + Default {
    /// Class name as seen by scripts.
    const CLASS: &'static str;
}

/// Deserialize any serde type from a host value via its JSON form.
pub fn deserialize<T: DeserializeOwned>(value: &HostValue) -> CoreResult<T> {
    Ok(serde_json::from_value(value.to_json()?)?)
}

/// Serialize any serde type into a host value.
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> CoreResult<HostValue> {
    Ok(HostValue::from(serde_json::to_value(value)?))
}

/// Extract an engine class instance; the object's class must match.
pub fn extract_class<T: EngineClass>(value: &HostValue) -> CoreResult<T> {
    match value {
        HostValue::Object(obj) if obj.class.eq_ignore_ascii_case(T::CLASS) => deserialize(value),
        HostValue::Object(obj) => Err(CoreError::type_mismatch(T::CLASS, obj.class.clone())),
        other => Err(CoreError::type_mismatch(T::CLASS, other.type_name())),
    }
}

/// Build the host object for an engine class instance.
pub fn class_object<T: EngineClass>(value: &T) -> CoreResult<HostObject> {
    let mut object = HostObject::new(T::CLASS);
    match serialize(value)? {
        HostValue::Map(map) => {
            for (key, member) in map {
                object.properties.insert(key.to_string(), member);
            }
        }
        other => {
            return Err(CoreError::type_mismatch("struct with named fields", other.type_name()));
        }
    }
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i64,
        y: i64,
        label: Option<String>,
    }

    impl EngineClass for Point {
        const CLASS: &'static str = "Point";
    }

    #[test]
    fn test_integer_narrowing() {
        assert_eq!(i32::from_host(&HostValue::Int(7)).unwrap(), 7);
        assert_eq!(u8::from_host(&HostValue::Float(200.0)).unwrap(), 200);
        assert!(matches!(
            i8::from_host(&HostValue::Int(300)),
            Err(CoreError::NumericOverflow { target: "i8", .. })
        ));
        assert!(matches!(
            u32::from_host(&HostValue::Int(-1)),
            Err(CoreError::NumericOverflow { .. })
        ));
        assert!(matches!(
            i64::from_host(&HostValue::Float(f64::INFINITY)),
            Err(CoreError::NumericOverflow { .. })
        ));
        assert!(matches!(
            i64::from_host(&HostValue::Float(1.5)),
            Err(CoreError::NumericOverflow { .. })
        ));
        assert!(matches!(
            i64::from_host(&HostValue::from("1")),
            Err(CoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_unsigned_rescaled_to_float() {
        assert_eq!(42u64.into_host(), HostValue::Int(42));
        assert_eq!(u64::MAX.into_host(), HostValue::Float(u64::MAX as f64));
    }

    #[test]
    fn test_float_narrowing() {
        assert_eq!(f32::from_host(&HostValue::Float(1.5)).unwrap(), 1.5);
        assert_eq!(f64::from_host(&HostValue::Int(2)).unwrap(), 2.0);
        assert!(f32::from_host(&HostValue::Float(f64::NAN)).unwrap().is_nan());
        assert!(matches!(
            f32::from_host(&HostValue::Float(1e300)),
            Err(CoreError::NumericOverflow { target: "f32", .. })
        ));
    }

    #[test]
    fn test_collections() {
        let value = HostValue::map([("a", 1i64), ("b", 2i64)]);
        let map = IndexMap::<String, i64>::from_host(&value).unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(Vec::<i64>::from_host(&value).unwrap(), vec![1, 2]);
        assert_eq!(Option::<i64>::from_host(&HostValue::Null).unwrap(), None);
        assert_eq!(vec![Some(1i64), None].into_host(), HostValue::list([HostValue::Int(1), HostValue::Null]));
    }

    #[test]
    fn test_engine_class_round_trip() {
        let point = Point {
            x: 1,
            y: 2,
            label: Some("origin".into()),
        };
        let object = class_object(&point).unwrap();
        assert_eq!(object.class, "Point");
        assert_eq!(
            object.properties.keys().collect::<Vec<_>>(),
            vec!["x", "y", "label"]
        );
        let value = HostValue::Object(object);
        assert_eq!(extract_class::<Point>(&value).unwrap(), point);

        let wrong = HostValue::Object(HostObject::new("Vector").with("x", 1i64));
        assert!(matches!(
            extract_class::<Point>(&wrong),
            Err(CoreError::TypeMismatch { .. })
        ));
    }
}
