//! Array functions.

use super::string::slice_range;
use super::{entries, list, to_text, Args, Builtin, BuiltinResult};
use crate::error::NativeFault;
use crate::ops::{self, Num};
use crate::request::Request;
use crate::value::{ArrayKey, ArrayRef, ZArray, Zval};
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::rc::Rc;

pub(super) const SORT_REGULAR: i64 = 0;
pub(super) const SORT_NUMERIC: i64 = 1;
pub(super) const SORT_STRING: i64 = 2;
pub(super) const FILTER_USE_BOTH: i64 = 1;
pub(super) const FILTER_USE_KEY: i64 = 2;

const MAX_RANGE: usize = 1 << 24;
const MAX_NESTING: usize = 64;

pub(super) const FUNCTIONS: &[Builtin] = &[
    Builtin::new("count", 1, Some(2), count),
    Builtin::new("sizeof", 1, Some(2), count),
    Builtin::new("in_array", 2, Some(3), in_array),
    Builtin::new("array_search", 2, Some(3), array_search),
    Builtin::new("array_keys", 1, Some(3), array_keys),
    Builtin::new("array_values", 1, Some(1), array_values),
    Builtin::new("array_merge", 0, None, array_merge),
    Builtin::new("array_combine", 2, Some(2), array_combine),
    Builtin::new("array_flip", 1, Some(1), array_flip),
    Builtin::new("array_slice", 2, Some(4), array_slice),
    Builtin::new("array_map", 2, None, array_map),
    Builtin::new("array_filter", 1, Some(3), array_filter),
    Builtin::new("array_reduce", 2, Some(3), array_reduce),
    Builtin::new("array_walk", 2, Some(3), array_walk),
    Builtin::new("array_sum", 1, Some(1), array_sum),
    Builtin::new("array_product", 1, Some(1), array_product),
    Builtin::new("array_key_exists", 2, Some(2), array_key_exists),
    Builtin::new("key_exists", 2, Some(2), array_key_exists),
    Builtin::new("array_unique", 1, Some(2), array_unique),
    Builtin::new("array_reverse", 1, Some(2), array_reverse),
    Builtin::new("array_fill", 3, Some(3), array_fill),
    Builtin::new("array_fill_keys", 2, Some(2), array_fill_keys),
    Builtin::new("array_key_first", 1, Some(1), array_key_first),
    Builtin::new("array_key_last", 1, Some(1), array_key_last),
    Builtin::new("array_column", 2, Some(3), array_column),
    Builtin::new("array_chunk", 2, Some(3), array_chunk),
    Builtin::new("array_is_list", 1, Some(1), array_is_list),
    Builtin::new("array_count_values", 1, Some(1), array_count_values),
    Builtin::new("array_diff", 1, None, array_diff),
    Builtin::new("array_intersect", 1, None, array_intersect),
    Builtin::new("array_diff_key", 1, None, array_diff_key),
    Builtin::new("array_intersect_key", 1, None, array_intersect_key),
    Builtin::new("range", 2, Some(3), range),
    Builtin::new("compact", 0, None, compact),
    Builtin::new("extract", 1, Some(1), extract),
    Builtin::new("min", 1, None, min),
    Builtin::new("max", 1, None, max),
    Builtin::new("array_push", 1, None, array_push).by_ref(0),
    Builtin::new("array_pop", 1, Some(1), array_pop).by_ref(0),
    Builtin::new("array_shift", 1, Some(1), array_shift).by_ref(0),
    Builtin::new("array_unshift", 1, None, array_unshift).by_ref(0),
    Builtin::new("sort", 1, Some(2), sort).by_ref(0),
    Builtin::new("rsort", 1, Some(2), rsort).by_ref(0),
    Builtin::new("usort", 2, Some(2), usort).by_ref(0),
    Builtin::new("asort", 1, Some(2), asort).by_ref(0),
    Builtin::new("arsort", 1, Some(2), arsort).by_ref(0),
    Builtin::new("uasort", 2, Some(2), uasort).by_ref(0),
    Builtin::new("ksort", 1, Some(2), ksort).by_ref(0),
    Builtin::new("krsort", 1, Some(2), krsort).by_ref(0),
    Builtin::new("uksort", 2, Some(2), uksort).by_ref(0),
];

fn occupied() -> NativeFault {
    NativeFault::throw(
        "Error",
        "Cannot add element to the array as the next element is already occupied",
    )
}

fn push(array: &mut ZArray, value: Zval) -> Result<(), NativeFault> {
    array.push(value).map(|_| ()).map_err(|_| occupied())
}

/// Array key for `value`, or `None` for types that cannot be keys.
fn key_of(value: &Zval) -> Option<ArrayKey> {
    match value {
        Zval::Array(_) | Zval::Object(_) | Zval::Callable(_) => None,
        other => ops::to_array_key(other, &mut Vec::new()).ok(),
    }
}

fn quiet_str(value: &Zval) -> Rc<str> {
    ops::to_str(value, -1, &mut Vec::new()).unwrap_or_else(|_| Rc::from(""))
}

fn compare_values(a: &Zval, b: &Zval, flags: i64) -> Ordering {
    match flags {
        SORT_NUMERIC => ops::to_float(a)
            .partial_cmp(&ops::to_float(b))
            .unwrap_or(Ordering::Equal),
        SORT_STRING => quiet_str(a).as_bytes().cmp(quiet_str(b).as_bytes()),
        _ => ops::compare(a, b).unwrap_or(Ordering::Equal),
    }
}

/// Stable merge sort with a comparator that may fail.
fn merge_sort<T, E, F>(mut items: Vec<T>, cmp: &mut F) -> Result<Vec<T>, E>
where
    F: FnMut(&T, &T) -> Result<Ordering, E>,
{
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, cmp)?;
    let right = merge_sort(right, cmp)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some(a), Some(b)) => cmp(b, a)? == Ordering::Less,
            _ => break,
        };
        merged.extend(if take_right { right.next() } else { left.next() });
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SortBy {
    Value,
    Key,
}

struct SortMode {
    by: SortBy,
    reverse: bool,
    keep_keys: bool,
    user: bool,
}

fn sort_array(req: &mut Request, args: &mut Args<'_>, mode: SortMode) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let items = entries(&array);
    let pick = |entry: &(ArrayKey, Zval)| match mode.by {
        SortBy::Value => entry.1.clone(),
        SortBy::Key => entry.0.to_zval(),
    };

    let sorted = if mode.user {
        let callback = args.callable(req, 1, "callback")?;
        merge_sort(items, &mut |a, b| {
            let result = req.invoke(&callback, vec![pick(a), pick(b)])?;
            Ok::<_, NativeFault>(ops::to_int(&result).cmp(&0))
        })?
    } else {
        let flags = args.opt_int(1, "flags", SORT_REGULAR)?;
        merge_sort(items, &mut |a, b| {
            let order = compare_values(&pick(a), &pick(b), flags);
            Ok::<_, NativeFault>(if mode.reverse { order.reverse() } else { order })
        })?
    };

    let result: ZArray = if mode.keep_keys {
        sorted.into_iter().collect()
    } else {
        sorted.into_iter().map(|(_, value)| value).collect()
    };
    args.set(0, Zval::array(result));
    Ok(Zval::Bool(true))
}

macro_rules! sorter {
    ($name:ident, $by:ident, reverse: $reverse:expr, keep_keys: $keep:expr, user: $user:expr) => {
        fn $name(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
            let mode = SortMode {
                by: SortBy::$by,
                reverse: $reverse,
                keep_keys: $keep,
                user: $user,
            };
            sort_array(req, args, mode)
        }
    };
}

sorter!(sort, Value, reverse: false, keep_keys: false, user: false);
sorter!(rsort, Value, reverse: true, keep_keys: false, user: false);
sorter!(usort, Value, reverse: false, keep_keys: false, user: true);
sorter!(asort, Value, reverse: false, keep_keys: true, user: false);
sorter!(arsort, Value, reverse: true, keep_keys: true, user: false);
sorter!(uasort, Value, reverse: false, keep_keys: true, user: true);
sorter!(ksort, Key, reverse: false, keep_keys: true, user: false);
sorter!(krsort, Key, reverse: true, keep_keys: true, user: false);
sorter!(uksort, Key, reverse: false, keep_keys: true, user: true);

fn count_recursive(array: &ArrayRef, depth: usize) -> i64 {
    let array = array.borrow();
    let mut total = array.len() as i64;
    if depth < MAX_NESTING {
        for value in array.values() {
            if let Zval::Array(inner) = value {
                total += count_recursive(inner, depth + 1);
            }
        }
    }
    total
}

fn count(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    match args.value(0) {
        Zval::Array(array) => {
            let total = if args.opt_int(1, "mode", 0)? == 1 {
                count_recursive(&array, 0)
            } else {
                array.borrow().len() as i64
            };
            Ok(Zval::Int(total))
        }
        _ => Err(args.type_error(0, "value", "Countable|array")),
    }
}

fn find(args: &Args<'_>) -> Result<Option<ArrayKey>, NativeFault> {
    let needle = args.value(0);
    let haystack = args.array(1, "haystack")?;
    let strict = args.opt_bool(2, "strict", false)?;
    let haystack = haystack.borrow();
    Ok(haystack
        .iter()
        .find(|(_, value)| {
            if strict {
                ops::identical(value, &needle)
            } else {
                ops::loose_equals(value, &needle)
            }
        })
        .map(|(key, _)| key.clone()))
}

fn in_array(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Bool(find(args)?.is_some()))
}

fn array_search(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(find(args)?.map_or(Zval::Bool(false), |key| key.to_zval()))
}

fn array_keys(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let filter = args.get(1).cloned();
    let strict = args.opt_bool(2, "strict", false)?;
    let array = array.borrow();
    let keys = array
        .iter()
        .filter(|(_, value)| match &filter {
            None => true,
            Some(wanted) if strict => ops::identical(value, wanted),
            Some(wanted) => ops::loose_equals(value, wanted),
        })
        .map(|(key, _)| key.to_zval());
    Ok(list(keys))
}

fn array_values(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let values: Vec<Zval> = array.borrow().values().cloned().collect();
    Ok(list(values))
}

fn array_merge(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let mut out = ZArray::new();
    for index in 0..args.len() {
        let array = args.array(index, "arrays")?;
        for (key, value) in array.borrow().iter() {
            match key {
                ArrayKey::Int(_) => push(&mut out, value.clone())?,
                ArrayKey::Str(_) => out.insert(key.clone(), value.clone()),
            }
        }
    }
    Ok(Zval::array(out))
}

fn array_combine(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let keys = args.array(0, "keys")?;
    let values = args.array(1, "values")?;
    let (keys, values) = (keys.borrow(), values.borrow());
    if keys.len() != values.len() {
        return Err(NativeFault::throw(
            "ValueError",
            "array_combine(): Argument #1 ($keys) and argument #2 ($values) must have the same number of elements",
        ));
    }
    let mut out = ZArray::with_capacity(keys.len());
    for (key, value) in keys.values().zip(values.values()) {
        let key = key_of(key).unwrap_or_else(|| ArrayKey::from(&*quiet_str(key)));
        out.insert(key, value.clone());
    }
    Ok(Zval::array(out))
}

fn array_flip(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let mut out = ZArray::new();
    for (key, value) in entries(&array) {
        match value {
            Zval::Int(_) | Zval::Str(_) => match key_of(&value) {
                Some(flipped) => out.insert(flipped, key.to_zval()),
                None => continue,
            },
            _ => req.warn("array_flip(): Can only flip string and integer values, entry skipped"),
        }
    }
    Ok(Zval::array(out))
}

fn array_slice(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let offset = args.int(1, "offset")?;
    let length = args.nullable_int(2, "length")?;
    let preserve = args.opt_bool(3, "preserve_keys", false)?;
    let items = entries(&array);
    let (start, end) = slice_range(items.len(), offset, length);
    let mut out = ZArray::new();
    for (key, value) in items.into_iter().skip(start).take(end - start) {
        match key {
            ArrayKey::Int(_) if !preserve => push(&mut out, value)?,
            key => out.insert(key, value),
        }
    }
    Ok(Zval::array(out))
}

fn array_map(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let callback = match args.value(0) {
        Zval::Null => None,
        _ => Some(args.callable(req, 0, "callback")?),
    };
    let arrays = (1..args.len())
        .map(|i| args.array(i, if i == 1 { "array" } else { "arrays" }))
        .collect::<Result<Vec<_>, _>>()?;

    if let [array] = arrays.as_slice() {
        let Some(callback) = callback else {
            return Ok(Zval::Array(array.clone()));
        };
        let mut out = ZArray::new();
        for (key, value) in entries(array) {
            let mapped = req.invoke(&callback, vec![value])?;
            out.insert(key, mapped);
        }
        return Ok(Zval::array(out));
    }

    let columns: Vec<Vec<Zval>> = arrays
        .iter()
        .map(|array| array.borrow().values().cloned().collect())
        .collect();
    let rows = columns.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = ZArray::with_capacity(rows);
    for row in 0..rows {
        let values: Vec<Zval> = columns
            .iter()
            .map(|column| column.get(row).cloned().unwrap_or_default())
            .collect();
        let mapped = match &callback {
            Some(callback) => req.invoke(callback, values)?,
            None => list(values),
        };
        push(&mut out, mapped)?;
    }
    Ok(Zval::array(out))
}

fn array_filter(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let callback = match args.get(1) {
        None | Some(Zval::Null) => None,
        Some(_) => Some(args.callable(req, 1, "callback")?),
    };
    let mode = args.opt_int(2, "mode", 0)?;
    let mut out = ZArray::new();
    for (key, value) in entries(&array) {
        let keep = match &callback {
            None => value.to_bool(),
            Some(callback) => {
                let call_args = match mode {
                    FILTER_USE_KEY => vec![key.to_zval()],
                    FILTER_USE_BOTH => vec![value.clone(), key.to_zval()],
                    _ => vec![value.clone()],
                };
                req.invoke(callback, call_args)?.to_bool()
            }
        };
        if keep {
            out.insert(key, value);
        }
    }
    Ok(Zval::array(out))
}

fn array_reduce(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let callback = args.callable(req, 1, "callback")?;
    let mut carry = args.value(2);
    for (_, value) in entries(&array) {
        carry = req.invoke(&callback, vec![carry, value])?;
    }
    Ok(carry)
}

fn array_walk(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let callback = args.callable(req, 1, "callback")?;
    let extra = args.get(2).cloned();
    for (key, value) in entries(&array) {
        let mut call_args = vec![value, key.to_zval()];
        call_args.extend(extra.clone());
        req.invoke(&callback, call_args)?;
    }
    Ok(Zval::Bool(true))
}

fn fold_numbers(req: &mut Request, args: &Args<'_>, initial: Num, mul: bool) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let op = if mul { crate::ast::BinaryOp::Mul } else { crate::ast::BinaryOp::Add };
    let mut acc = initial.into_zval();
    for value in array.borrow().values() {
        if matches!(value, Zval::Array(_) | Zval::Object(_) | Zval::Callable(_)) {
            continue;
        }
        acc = req
            .op(|w| ops::arith(op, &acc, value, w))
            .map_err(NativeFault::from)?;
    }
    Ok(acc)
}

fn array_sum(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    fold_numbers(req, args, Num::Int(0), false)
}

fn array_product(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    fold_numbers(req, args, Num::Int(1), true)
}

fn array_key_exists(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(1, "array")?;
    let key = args.value(0);
    let Some(key) = key_of(&key) else {
        return Err(NativeFault::type_error(
            "Illegal offset type for array_key_exists()",
        ));
    };
    Ok(Zval::Bool(array.borrow().contains_key(&key)))
}

fn array_unique(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let flags = args.opt_int(1, "flags", SORT_STRING)?;
    let mut seen: Vec<Zval> = Vec::new();
    let mut out = ZArray::new();
    for (key, value) in entries(&array) {
        if seen
            .iter()
            .any(|kept| compare_values(kept, &value, flags) == Ordering::Equal)
        {
            continue;
        }
        seen.push(value.clone());
        out.insert(key, value);
    }
    Ok(Zval::array(out))
}

fn array_reverse(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let preserve = args.opt_bool(1, "preserve_keys", false)?;
    let mut out = ZArray::new();
    for (key, value) in entries(&array).into_iter().rev() {
        match key {
            ArrayKey::Int(_) if !preserve => push(&mut out, value)?,
            key => out.insert(key, value),
        }
    }
    Ok(Zval::array(out))
}

fn array_fill(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let start = args.int(0, "start_index")?;
    let count = args.int(1, "count")?;
    let value = args.value(2);
    if count < 0 {
        return Err(args.value_error(1, "count", "must be greater than or equal to 0"));
    }
    let mut out = ZArray::with_capacity(count as usize);
    let mut key = start;
    for _ in 0..count {
        out.insert(ArrayKey::Int(key), value.clone());
        key = key.checked_add(1).ok_or_else(occupied)?;
    }
    Ok(Zval::array(out))
}

fn array_fill_keys(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let keys = args.array(0, "keys")?;
    let value = args.value(1);
    let mut out = ZArray::new();
    for key in keys.borrow().values() {
        let key = key_of(key).unwrap_or_else(|| ArrayKey::from(&*quiet_str(key)));
        out.insert(key, value.clone());
    }
    Ok(Zval::array(out))
}

fn array_key_first(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let array = array.borrow();
    Ok(array.keys().next().map_or(Zval::Null, ArrayKey::to_zval))
}

fn array_key_last(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let array = array.borrow();
    Ok(array.keys().last().map_or(Zval::Null, ArrayKey::to_zval))
}

fn fetch_field(row: &Zval, field: &Zval) -> Option<Zval> {
    match row {
        Zval::Array(array) => array.borrow().get(&key_of(field)?).cloned(),
        Zval::Object(obj) => obj.borrow().get(&quiet_str(field)).cloned(),
        _ => None,
    }
}

fn array_column(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let rows = args.array(0, "array")?;
    let column = args.value(1);
    let index = args.value(2);
    let mut out = ZArray::new();
    for (_, row) in entries(&rows) {
        let value = if column.is_null() {
            Some(row.clone())
        } else {
            fetch_field(&row, &column)
        };
        let Some(value) = value else { continue };
        let key = if index.is_null() {
            None
        } else {
            fetch_field(&row, &index).and_then(|k| key_of(&k))
        };
        match key {
            Some(key) => out.insert(key, value),
            None => push(&mut out, value)?,
        }
    }
    Ok(Zval::array(out))
}

fn array_chunk(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let length = args.int(1, "length")?;
    let preserve = args.opt_bool(2, "preserve_keys", false)?;
    if length < 1 {
        return Err(args.value_error(1, "length", "must be greater than 0"));
    }
    let items = entries(&array);
    let chunks = items.chunks(length as usize).map(|chunk| {
        let chunk: ZArray = if preserve {
            chunk.iter().cloned().collect()
        } else {
            chunk.iter().map(|(_, value)| value.clone()).collect()
        };
        Zval::array(chunk)
    });
    Ok(list(chunks))
}

fn array_is_list(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::Bool(args.array(0, "array")?.borrow().is_list()))
}

fn array_count_values(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let mut out = ZArray::new();
    for (_, value) in entries(&array) {
        let key = match &value {
            Zval::Int(_) | Zval::Str(_) => key_of(&value),
            _ => None,
        };
        match key {
            Some(key) => {
                let slot = out.entry_or_null(key);
                *slot = Zval::Int(slot.as_int().unwrap_or(0) + 1);
            }
            None => req.warn("array_count_values(): Can only count string and integer values, entry skipped"),
        }
    }
    Ok(Zval::array(out))
}

fn other_arrays(args: &Args<'_>) -> Result<Vec<ArrayRef>, NativeFault> {
    (1..args.len()).map(|i| args.array(i, "arrays")).collect()
}

fn filter_by_values(req: &mut Request, args: &Args<'_>, keep_common: bool) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let mut others: FxHashSet<Rc<str>> = FxHashSet::default();
    for other in other_arrays(args)? {
        for (_, value) in entries(&other) {
            others.insert(to_text(req, &value)?);
        }
    }
    let mut out = ZArray::new();
    for (key, value) in entries(&array) {
        if others.contains(&to_text(req, &value)?) == keep_common {
            out.insert(key, value);
        }
    }
    Ok(Zval::array(out))
}

fn filter_by_keys(args: &Args<'_>, keep_common: bool) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let others = other_arrays(args)?;
    let mut out = ZArray::new();
    for (key, value) in entries(&array) {
        let present = others.iter().any(|other| other.borrow().contains_key(&key));
        if present == keep_common {
            out.insert(key, value);
        }
    }
    Ok(Zval::array(out))
}

fn array_diff(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    filter_by_values(req, args, false)
}

fn array_intersect(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    filter_by_values(req, args, true)
}

fn array_diff_key(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    filter_by_keys(args, false)
}

fn array_intersect_key(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    filter_by_keys(args, true)
}

fn range(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let step = match args.get(2) {
        Some(_) => args.number(2, "step")?,
        None => Num::Int(1),
    };
    if step.to_f64() == 0.0 {
        return Err(args.value_error(2, "step", "cannot be 0"));
    }

    if let (Zval::Str(a), Zval::Str(b)) = (args.value(0), args.value(1)) {
        let letters = a.len() == 1
            && b.len() == 1
            && !(a.as_bytes()[0].is_ascii_digit() && b.as_bytes()[0].is_ascii_digit());
        if letters {
            let (a, b) = (a.as_bytes()[0], b.as_bytes()[0]);
            let step = (step.to_f64().abs() as usize).max(1);
            let chars: Vec<u8> = if a <= b {
                (a..=b).step_by(step).collect()
            } else {
                (b..=a).rev().step_by(step).collect()
            };
            return Ok(list(chars.iter().map(|c| super::bytes_to_zval(&[*c]))));
        }
    }

    let start = args.number(0, "start")?;
    let end = args.number(1, "end")?;
    let too_large = || NativeFault::throw("ValueError", "The supplied range exceeds the maximum array size");

    if let (Num::Int(a), Num::Int(b), Num::Int(s)) = (start, end, step) {
        let s = s.unsigned_abs();
        if a != b && s > a.abs_diff(b) {
            return Err(args.value_error(2, "step", "must not exceed the specified range"));
        }
        if a.abs_diff(b) / s >= MAX_RANGE as u64 {
            return Err(too_large());
        }
        let s = s as i64;
        let mut values = Vec::new();
        let mut x = a;
        loop {
            values.push(Zval::Int(x));
            let next = if a <= b { x.checked_add(s) } else { x.checked_sub(s) };
            match next {
                Some(n) if (a <= b && n <= b) || (a > b && n >= b) => x = n,
                _ => break,
            }
        }
        return Ok(list(values));
    }

    let (a, b, s) = (start.to_f64(), end.to_f64(), step.to_f64().abs());
    if a != b && s > (b - a).abs() {
        return Err(args.value_error(2, "step", "must not exceed the specified range"));
    }
    let steps = ((b - a).abs() / s + 1e-9).floor();
    if !steps.is_finite() || steps >= MAX_RANGE as f64 {
        return Err(too_large());
    }
    let direction = if a <= b { 1.0 } else { -1.0 };
    Ok(list((0..=steps as usize).map(|i| Zval::Float(a + direction * s * i as f64))))
}

fn compact_into(
    req: &mut Request,
    names: &[Zval],
    out: &mut ZArray,
    depth: usize,
) -> Result<(), NativeFault> {
    for name in names {
        match name {
            Zval::Array(inner) if depth < MAX_NESTING => {
                let inner: Vec<Zval> = inner.borrow().values().cloned().collect();
                compact_into(req, &inner, out, depth + 1)?;
            }
            other => {
                let name = to_text(req, other)?;
                match req.current_frame().locals.get(&*name).cloned() {
                    Some(value) => out.insert(ArrayKey::from(&*name), value),
                    None => req.warn(format!("compact(): Undefined variable ${name}")),
                }
            }
        }
    }
    Ok(())
}

fn compact(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let mut out = ZArray::new();
    let names = args.rest(0).to_vec();
    compact_into(req, &names, &mut out, 0)?;
    Ok(Zval::array(out))
}

fn extract(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let mut extracted = 0;
    for (key, value) in entries(&array) {
        let ArrayKey::Str(name) = key else { continue };
        let valid = name
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()));
        if valid && !name.is_empty() && &*name != "this" {
            req.assign_local(&name, value);
            extracted += 1;
        }
    }
    Ok(Zval::Int(extracted))
}

fn extreme(args: &Args<'_>, wanted: Ordering) -> BuiltinResult {
    let values: Vec<Zval> = if args.len() == 1 {
        match args.value(0) {
            Zval::Array(array) => array.borrow().values().cloned().collect(),
            _ => return Err(args.type_error(0, "value", "array")),
        }
    } else {
        args.rest(0).to_vec()
    };
    let mut values = values.into_iter();
    let Some(mut best) = values.next() else {
        return Err(args.value_error(0, "value", "must contain at least one element"));
    };
    for value in values {
        if ops::compare(&value, &best) == Some(wanted) {
            best = value;
        }
    }
    Ok(best)
}

fn min(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    extreme(args, Ordering::Less)
}

fn max(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    extreme(args, Ordering::Greater)
}

fn array_push(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let mut updated = array.borrow().clone();
    for value in args.rest(1) {
        push(&mut updated, value.clone())?;
    }
    let count = updated.len() as i64;
    args.set(0, Zval::array(updated));
    Ok(Zval::Int(count))
}

/// Rebuild a list-like array: integer keys renumbered, string keys kept.
fn renumber(items: impl IntoIterator<Item = (ArrayKey, Zval)>) -> Result<ZArray, NativeFault> {
    let mut out = ZArray::new();
    for (key, value) in items {
        match key {
            ArrayKey::Int(_) => push(&mut out, value)?,
            key => out.insert(key, value),
        }
    }
    Ok(out)
}

fn array_pop(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let mut items = entries(&array);
    let Some((_, popped)) = items.pop() else {
        return Ok(Zval::Null);
    };
    let rest: ZArray = items.into_iter().collect();
    args.set(0, Zval::array(rest));
    Ok(popped)
}

fn array_shift(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let mut items = entries(&array).into_iter();
    let Some((_, shifted)) = items.next() else {
        return Ok(Zval::Null);
    };
    args.set(0, Zval::array(renumber(items)?));
    Ok(shifted)
}

fn array_unshift(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let array = args.array(0, "array")?;
    let prepended = args
        .rest(1)
        .iter()
        .map(|value| (ArrayKey::Int(0), value.clone()))
        .chain(entries(&array));
    let updated = renumber(prepended)?;
    let count = updated.len() as i64;
    args.set(0, Zval::array(updated));
    Ok(Zval::Int(count))
}

#[cfg(test)]
mod tests {
    use super::merge_sort;
    use crate::request::Request;
    use crate::runtime::{IniSettings, Runtime};
    use std::cmp::Ordering;

    fn eval(src: &str) -> String {
        let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        request.eval(src, "t.php").unwrap();
        request.take_output()
    }

    #[test]
    fn test_merge_sort_is_stable() {
        let items = vec![(2, 'a'), (1, 'b'), (2, 'c'), (1, 'd')];
        let sorted = merge_sort(items, &mut |a: &(i32, char), b: &(i32, char)| {
            Ok::<_, ()>(a.0.cmp(&b.0))
        })
        .unwrap();
        assert_eq!(sorted, vec![(1, 'b'), (1, 'd'), (2, 'a'), (2, 'c')]);
    }

    #[test]
    fn test_merge_sort_stops_on_error() {
        let mut calls = 0;
        let result = merge_sort(vec![3, 2, 1], &mut |_: &i32, _: &i32| {
            calls += 1;
            Err::<Ordering, _>("boom")
        });
        assert_eq!(result, Err("boom"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_sorting_writes_back() {
        let out = eval(
            r#"<?php
            $a = [3, 1, 2];
            sort($a);
            echo implode(",", $a), "|";
            $b = ["x" => 2, "y" => 1];
            asort($b);
            echo implode(",", array_keys($b)), "|";
            $c = [5, 3, 9];
            usort($c, fn($l, $r) => $r <=> $l);
            echo implode(",", $c), "|";
            ksort($b);
            echo implode(",", array_keys($b));
            "#,
        );
        assert_eq!(out, "1,2,3|y,x|9,5,3|x,y");
    }

    #[test]
    fn test_stack_functions() {
        let out = eval(
            r#"<?php
            $s = [1, 2];
            echo array_push($s, 3, 4), "|";
            echo array_pop($s), "|", array_shift($s), "|";
            echo array_unshift($s, 0), "|", implode(",", $s);
            "#,
        );
        assert_eq!(out, "4|4|1|3|0,2,3");
    }

    #[test]
    fn test_functional_helpers() {
        let out = eval(
            r#"<?php
            $nums = [1, 2, 3, 4];
            echo implode(",", array_map(fn($n) => $n * 10, $nums)), "|";
            echo implode(",", array_filter($nums, fn($n) => $n % 2 == 0)), "|";
            echo array_reduce($nums, fn($c, $n) => $c + $n, 0), "|";
            echo array_sum($nums), "|", max($nums), "|", min(4, 2, 8), "|";
            echo implode(",", range(0, 10, 5)), "|", implode("", range('a', 'e')), "|";
            echo json(array_slice(['a' => 1, 5 => 2, 9 => 3], 1));
            function json($a) { $out = []; foreach ($a as $k => $v) { $out[] = "$k:$v"; } return implode(",", $out); }
            "#,
        );
        assert_eq!(out, "10,20,30,40|2,4|10|10|4|2|0,5,10|abcde|0:2,1:3");
    }

    #[test]
    fn test_merge_and_unique() {
        let out = eval(
            r#"<?php
            $m = array_merge([5 => 'a', 'k' => 'b'], [5 => 'c', 'k' => 'd']);
            foreach ($m as $k => $v) { echo "$k=$v "; }
            echo "|", implode(",", array_unique([1, '1', 2, 2.0, 'a', 'a']));
            echo "|", count([1, [2, 3]], COUNT_RECURSIVE);
            "#,
        );
        assert_eq!(out, "0=a k=d 1=c |1,2,a|4");
    }
}
