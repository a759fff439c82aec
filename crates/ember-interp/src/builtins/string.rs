//! String functions. Strings are treated as byte sequences; results that
//! split a multi-byte character are repaired lossily.

use super::math::round_to;
use super::{bytes_to_zval, entries, list, to_text, Args, Builtin, BuiltinResult};
use crate::error::NativeFault;
use crate::ops;
use crate::request::Request;
use crate::value::{ZArray, Zval};
use std::cmp::Ordering;
use std::rc::Rc;

pub(super) const PAD_LEFT: i64 = 0;
pub(super) const PAD_RIGHT: i64 = 1;
pub(super) const PAD_BOTH: i64 = 2;

const TRIM_DEFAULT: &str = " \n\r\t\x0B\0";

pub(super) const FUNCTIONS: &[Builtin] = &[
    Builtin::new("strlen", 1, Some(1), strlen),
    Builtin::new("strtolower", 1, Some(1), strtolower),
    Builtin::new("strtoupper", 1, Some(1), strtoupper),
    Builtin::new("ucfirst", 1, Some(1), ucfirst),
    Builtin::new("lcfirst", 1, Some(1), lcfirst),
    Builtin::new("ucwords", 1, Some(2), ucwords),
    Builtin::new("trim", 1, Some(2), trim),
    Builtin::new("ltrim", 1, Some(2), ltrim),
    Builtin::new("rtrim", 1, Some(2), rtrim),
    Builtin::new("chop", 1, Some(2), rtrim),
    Builtin::new("str_repeat", 2, Some(2), str_repeat),
    Builtin::new("str_replace", 3, Some(3), str_replace),
    Builtin::new("strtr", 2, Some(3), strtr),
    Builtin::new("str_contains", 2, Some(2), str_contains),
    Builtin::new("str_starts_with", 2, Some(2), str_starts_with),
    Builtin::new("str_ends_with", 2, Some(2), str_ends_with),
    Builtin::new("strpos", 2, Some(3), strpos),
    Builtin::new("stripos", 2, Some(3), stripos),
    Builtin::new("strrpos", 2, Some(3), strrpos),
    Builtin::new("strstr", 2, Some(3), strstr),
    Builtin::new("substr", 2, Some(3), substr),
    Builtin::new("substr_count", 2, Some(2), substr_count),
    Builtin::new("strrev", 1, Some(1), strrev),
    Builtin::new("str_pad", 2, Some(4), str_pad),
    Builtin::new("str_split", 1, Some(2), str_split),
    Builtin::new("explode", 2, Some(3), explode),
    Builtin::new("implode", 1, Some(2), implode),
    Builtin::new("join", 1, Some(2), implode),
    Builtin::new("sprintf", 1, None, sprintf),
    Builtin::new("vsprintf", 2, Some(2), vsprintf),
    Builtin::new("printf", 1, None, printf),
    Builtin::new("number_format", 1, Some(4), number_format),
    Builtin::new("strcmp", 2, Some(2), strcmp),
    Builtin::new("strcasecmp", 2, Some(2), strcasecmp),
    Builtin::new("strncmp", 3, Some(3), strncmp),
    Builtin::new("ord", 1, Some(1), ord),
    Builtin::new("chr", 1, Some(1), chr),
    Builtin::new("htmlspecialchars", 1, Some(1), htmlspecialchars),
];

fn strlen(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let s = args.string(req, 0, "string")?;
    Ok(Zval::Int(s.len() as i64))
}

fn strtolower(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::from(args.string(req, 0, "string")?.to_ascii_lowercase()))
}

fn strtoupper(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    Ok(Zval::from(args.string(req, 0, "string")?.to_ascii_uppercase()))
}

fn map_first(req: &mut Request, args: &Args<'_>, upper: bool) -> BuiltinResult {
    let s = args.string(req, 0, "string")?;
    let mut bytes = s.as_bytes().to_vec();
    if let Some(first) = bytes.first_mut() {
        if upper {
            first.make_ascii_uppercase();
        } else {
            first.make_ascii_lowercase();
        }
    }
    Ok(bytes_to_zval(&bytes))
}

fn ucfirst(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    map_first(req, args, true)
}

fn lcfirst(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    map_first(req, args, false)
}

fn ucwords(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let s = args.string(req, 0, "string")?;
    let separators = args.opt_string(req, 1, "separators", " \t\r\n\x0C\x0B")?;
    let mask = char_mask(separators.as_bytes());
    let mut bytes = s.as_bytes().to_vec();
    let mut at_word_start = true;
    for byte in bytes.iter_mut() {
        if at_word_start {
            byte.make_ascii_uppercase();
        }
        at_word_start = mask[*byte as usize];
    }
    Ok(bytes_to_zval(&bytes))
}

/// Character list with `a..z` ranges.
fn char_mask(chars: &[u8]) -> [bool; 256] {
    let mut mask = [false; 256];
    let mut i = 0;
    while i < chars.len() {
        if i + 3 < chars.len() && &chars[i + 1..i + 3] == b".." && chars[i + 3] >= chars[i] {
            for c in chars[i]..=chars[i + 3] {
                mask[c as usize] = true;
            }
            i += 4;
        } else {
            mask[chars[i] as usize] = true;
            i += 1;
        }
    }
    mask
}

fn trim_with(req: &mut Request, args: &Args<'_>, left: bool, right: bool) -> BuiltinResult {
    let s = args.string(req, 0, "string")?;
    let chars = args.opt_string(req, 1, "characters", TRIM_DEFAULT)?;
    let mask = char_mask(chars.as_bytes());
    let bytes = s.as_bytes();
    let (mut start, mut end) = (0, bytes.len());
    if left {
        while start < end && mask[bytes[start] as usize] {
            start += 1;
        }
    }
    if right {
        while end > start && mask[bytes[end - 1] as usize] {
            end -= 1;
        }
    }
    Ok(bytes_to_zval(&bytes[start..end]))
}

fn trim(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    trim_with(req, args, true, true)
}

fn ltrim(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    trim_with(req, args, true, false)
}

fn rtrim(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    trim_with(req, args, false, true)
}

fn str_repeat(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let s = args.string(req, 0, "string")?;
    let times = args.int(1, "times")?;
    if times < 0 {
        return Err(args.value_error(1, "times", "must be greater than or equal to 0"));
    }
    Ok(Zval::from(s.repeat(times as usize)))
}

fn str_replace(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let pairs: Vec<(Rc<str>, Rc<str>)> = match args.value(0) {
        Zval::Array(search) => {
            let needles: Vec<Zval> = search.borrow().values().cloned().collect();
            let replacements: Option<Vec<Zval>> = match args.value(1) {
                Zval::Array(list) => Some(list.borrow().values().cloned().collect()),
                _ => None,
            };
            let single = match replacements {
                Some(_) => None,
                None => Some(args.string(req, 1, "replace")?),
            };
            let mut pairs = Vec::with_capacity(needles.len());
            for (i, needle) in needles.iter().enumerate() {
                let needle = to_text(req, needle)?;
                let replacement = match (&replacements, &single) {
                    (Some(list), _) => match list.get(i) {
                        Some(value) => to_text(req, value)?,
                        None => Rc::from(""),
                    },
                    (None, Some(single)) => single.clone(),
                    (None, None) => Rc::from(""),
                };
                pairs.push((needle, replacement));
            }
            pairs
        }
        _ => {
            if matches!(args.value(1), Zval::Array(_)) {
                return Err(NativeFault::type_error(
                    "str_replace(): Argument #2 ($replace) must be of type string when argument #1 ($search) is a string",
                ));
            }
            vec![(args.string(req, 0, "search")?, args.string(req, 1, "replace")?)]
        }
    };
    let apply = |subject: &str| {
        pairs.iter().fold(subject.to_string(), |acc, (needle, replacement)| {
            if needle.is_empty() {
                acc
            } else {
                acc.replace(&**needle, replacement)
            }
        })
    };

    match args.value(2) {
        Zval::Array(subjects) => {
            let mut result = ZArray::with_capacity(subjects.borrow().len());
            for (key, value) in entries(&subjects) {
                let replaced = match value {
                    Zval::Array(_) => value,
                    other => Zval::from(apply(&to_text(req, &other)?)),
                };
                result.insert(key, replaced);
            }
            Ok(Zval::array(result))
        }
        _ => {
            let subject = args.string(req, 2, "subject")?;
            Ok(Zval::from(apply(&subject)))
        }
    }
}

fn strtr(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let s = args.string(req, 0, "string")?;
    if args.len() == 3 {
        let from = args.string(req, 1, "from")?;
        let to = args.string(req, 2, "to")?;
        let mut table: [u8; 256] = std::array::from_fn(|i| i as u8);
        for (f, t) in from.bytes().zip(to.bytes()) {
            table[f as usize] = t;
        }
        let bytes: Vec<u8> = s.bytes().map(|b| table[b as usize]).collect();
        return Ok(bytes_to_zval(&bytes));
    }

    let Zval::Array(map) = args.value(1) else {
        return Err(NativeFault::type_error(
            "strtr(): Argument #2 ($from) must be of type array, string given",
        ));
    };
    let mut pairs = Vec::new();
    for (key, value) in entries(&map) {
        let key = key.to_string();
        if !key.is_empty() {
            pairs.push((key.into_bytes(), to_text(req, &value)?));
        }
    }
    pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match pairs.iter().find(|(from, _)| bytes[i..].starts_with(from)) {
            Some((from, to)) => {
                out.extend_from_slice(to.as_bytes());
                i += from.len();
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    Ok(bytes_to_zval(&out))
}

fn str_contains(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let haystack = args.string(req, 0, "haystack")?;
    let needle = args.string(req, 1, "needle")?;
    Ok(Zval::Bool(haystack.contains(&*needle)))
}

fn str_starts_with(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let haystack = args.string(req, 0, "haystack")?;
    let needle = args.string(req, 1, "needle")?;
    Ok(Zval::Bool(haystack.starts_with(&*needle)))
}

fn str_ends_with(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let haystack = args.string(req, 0, "haystack")?;
    let needle = args.string(req, 1, "needle")?;
    Ok(Zval::Bool(haystack.ends_with(&*needle)))
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(haystack.len());
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Start offset for the `strpos` family.
fn search_offset(args: &Args<'_>, len: usize) -> Result<usize, NativeFault> {
    let offset = args.opt_int(2, "offset", 0)?;
    let len = len as i64;
    if offset > len || offset < -len {
        return Err(args.value_error(2, "offset", "must be contained in argument #1 ($haystack)"));
    }
    Ok(if offset < 0 { len + offset } else { offset } as usize)
}

fn position(found: Option<usize>) -> Zval {
    found.map_or(Zval::Bool(false), |pos| Zval::Int(pos as i64))
}

fn strpos(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let haystack = args.string(req, 0, "haystack")?;
    let needle = args.string(req, 1, "needle")?;
    let start = search_offset(args, haystack.len())?;
    let found = find_bytes(&haystack.as_bytes()[start..], needle.as_bytes()).map(|p| p + start);
    Ok(position(found))
}

fn stripos(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let haystack = args.string(req, 0, "haystack")?.to_ascii_lowercase();
    let needle = args.string(req, 1, "needle")?.to_ascii_lowercase();
    let start = search_offset(args, haystack.len())?;
    let found = find_bytes(&haystack.as_bytes()[start..], needle.as_bytes()).map(|p| p + start);
    Ok(position(found))
}

fn strrpos(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let haystack = args.string(req, 0, "haystack")?;
    let needle = args.string(req, 1, "needle")?;
    let offset = args.opt_int(2, "offset", 0)?;
    let len = haystack.len() as i64;
    if offset > len || offset < -len {
        return Err(args.value_error(2, "offset", "must be contained in argument #1 ($haystack)"));
    }
    let (start, end) = if offset >= 0 {
        (offset as usize, haystack.len())
    } else {
        (0, ((len + offset) as usize + needle.len()).min(haystack.len()))
    };
    let found = rfind_bytes(&haystack.as_bytes()[start..end], needle.as_bytes()).map(|p| p + start);
    Ok(position(found))
}

fn strstr(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let haystack = args.string(req, 0, "haystack")?;
    let needle = args.string(req, 1, "needle")?;
    let before = args.opt_bool(2, "before_needle", false)?;
    let bytes = haystack.as_bytes();
    Ok(match find_bytes(bytes, needle.as_bytes()) {
        Some(pos) if before => bytes_to_zval(&bytes[..pos]),
        Some(pos) => bytes_to_zval(&bytes[pos..]),
        None => Zval::Bool(false),
    })
}

/// Byte range selected by an offset and optional length, clamped to `len`.
pub(super) fn slice_range(len: usize, offset: i64, length: Option<i64>) -> (usize, usize) {
    let len = len as i64;
    let start = if offset < 0 { (len + offset).max(0) } else { offset.min(len) };
    let end = match length {
        None => len,
        Some(l) if l < 0 => (len + l).max(start),
        Some(l) => start.saturating_add(l).min(len),
    };
    (start as usize, end.max(start) as usize)
}

fn substr(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let s = args.string(req, 0, "string")?;
    let offset = args.int(1, "offset")?;
    let length = args.nullable_int(2, "length")?;
    let (start, end) = slice_range(s.len(), offset, length);
    Ok(bytes_to_zval(&s.as_bytes()[start..end]))
}

fn substr_count(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let haystack = args.string(req, 0, "haystack")?;
    let needle = args.string(req, 1, "needle")?;
    if needle.is_empty() {
        return Err(args.value_error(1, "needle", "cannot be empty"));
    }
    Ok(Zval::Int(haystack.matches(&*needle).count() as i64))
}

fn strrev(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let s = args.string(req, 0, "string")?;
    let bytes: Vec<u8> = s.bytes().rev().collect();
    Ok(bytes_to_zval(&bytes))
}

fn str_pad(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let s = args.string(req, 0, "string")?;
    let length = args.int(1, "length")?;
    let pad = args.opt_string(req, 2, "pad_string", " ")?;
    let pad_type = args.opt_int(3, "pad_type", PAD_RIGHT)?;
    if pad.is_empty() {
        return Err(args.value_error(2, "pad_string", "must be a non-empty string"));
    }
    if !matches!(pad_type, PAD_LEFT | PAD_RIGHT | PAD_BOTH) {
        return Err(args.value_error(3, "pad_type", "must be STR_PAD_LEFT, STR_PAD_RIGHT, or STR_PAD_BOTH"));
    }
    let missing = usize::try_from(length).unwrap_or(0).saturating_sub(s.len());
    if missing == 0 {
        return Ok(Zval::Str(s));
    }
    let (left, right) = match pad_type {
        PAD_LEFT => (missing, 0),
        PAD_BOTH => (missing / 2, missing - missing / 2),
        _ => (0, missing),
    };
    let fill = |n: usize| pad.bytes().cycle().take(n).collect::<Vec<u8>>();
    let mut out = fill(left);
    out.extend_from_slice(s.as_bytes());
    out.extend(fill(right));
    Ok(bytes_to_zval(&out))
}

fn str_split(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let s = args.string(req, 0, "string")?;
    let length = args.opt_int(1, "length", 1)?;
    if length < 1 {
        return Err(args.value_error(1, "length", "must be greater than 0"));
    }
    Ok(list(s.as_bytes().chunks(length as usize).map(bytes_to_zval)))
}

fn explode(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let separator = args.string(req, 0, "separator")?;
    let s = args.string(req, 1, "string")?;
    let limit = args.opt_int(2, "limit", i64::MAX)?;
    if separator.is_empty() {
        return Err(args.value_error(0, "separator", "cannot be empty"));
    }
    let parts: Vec<&str> = match limit {
        l if l > 0 => s.splitn(l as usize, &*separator).collect(),
        0 => vec![&*s],
        l => {
            let mut parts: Vec<&str> = s.split(&*separator).collect();
            let keep = parts.len().saturating_sub(l.unsigned_abs() as usize);
            parts.truncate(keep);
            parts
        }
    };
    Ok(list(parts.into_iter().map(Zval::string)))
}

fn implode(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let (separator, pieces) = match (args.value(0), args.get(1)) {
        (Zval::Array(pieces), None) => (Rc::from(""), pieces),
        (_, Some(Zval::Array(pieces))) => (args.string(req, 0, "separator")?, pieces.clone()),
        (_, Some(_)) => return Err(args.type_error(1, "array", "?array")),
        (_, None) => return Err(args.type_error(0, "pieces", "array")),
    };
    let mut out = String::new();
    for (i, (_, value)) in entries(&pieces).into_iter().enumerate() {
        if i > 0 {
            out.push_str(&separator);
        }
        out.push_str(&to_text(req, &value)?);
    }
    Ok(Zval::from(out))
}

/// `printf`-style formatting.
pub(super) fn format(
    req: &mut Request,
    format: &str,
    values: &[Zval],
) -> Result<String, NativeFault> {
    let bytes = format.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut next_arg = 0;
    let mut i = 0;

    let digits_at = |i: usize| bytes[i..].iter().take_while(|b| b.is_ascii_digit()).count();
    let number_at = |i: usize, n: usize| -> usize {
        std::str::from_utf8(&bytes[i..i + n])
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        i += 1;
        if bytes.get(i) == Some(&b'%') {
            out.push(b'%');
            i += 1;
            continue;
        }

        let mut argnum = None;
        let n = digits_at(i);
        if n > 0 && bytes.get(i + n) == Some(&b'$') {
            let position = number_at(i, n);
            if position == 0 {
                return Err(NativeFault::throw(
                    "ValueError",
                    "Argument number specifier must be greater than zero and less than 2147483647",
                ));
            }
            argnum = Some(position - 1);
            i += n + 1;
        }

        let (mut left, mut plus, mut pad) = (false, false, b' ');
        loop {
            match bytes.get(i) {
                Some(b'-') => left = true,
                Some(b'+') => plus = true,
                Some(b'0') => pad = b'0',
                Some(b' ') => pad = b' ',
                Some(b'\'') => {
                    i += 1;
                    match bytes.get(i) {
                        Some(c) => pad = *c,
                        None => break,
                    }
                }
                _ => break,
            }
            i += 1;
        }

        let n = digits_at(i);
        let width = number_at(i, n);
        i += n;
        let precision = if bytes.get(i) == Some(&b'.') {
            i += 1;
            let n = digits_at(i);
            let p = number_at(i, n);
            i += n;
            Some(p)
        } else {
            None
        };

        let Some(&spec) = bytes.get(i) else {
            return Err(NativeFault::throw("ValueError", "Missing format specifier at end of string"));
        };
        i += 1;

        let index = argnum.unwrap_or_else(|| {
            next_arg += 1;
            next_arg - 1
        });
        let Some(value) = values.get(index) else {
            return Err(NativeFault::throw(
                "ArgumentCountError",
                format!("{} arguments are required, {} given", index + 2, values.len() + 1),
            ));
        };

        let mut numeric = true;
        let body: Vec<u8> = match spec {
            b'd' | b'i' => {
                let n = ops::to_int(value);
                let mut s = n.to_string();
                if plus && n >= 0 {
                    s.insert(0, '+');
                }
                s.into_bytes()
            }
            b'u' => (ops::to_int(value) as u64).to_string().into_bytes(),
            b'f' | b'F' => {
                let f = ops::to_float(value);
                let mut s = format!("{:.*}", precision.unwrap_or(6), f);
                if plus && f >= 0.0 {
                    s.insert(0, '+');
                }
                s.into_bytes()
            }
            b'e' | b'E' => {
                let f = ops::to_float(value);
                let raw = format!("{:.*e}", precision.unwrap_or(6), f);
                let s = match raw.split_once('e') {
                    Some((mantissa, exp)) => match exp.strip_prefix('-') {
                        Some(exp) => format!("{mantissa}e-{exp}"),
                        None => format!("{mantissa}e+{exp}"),
                    },
                    None => raw,
                };
                let s = if spec == b'E' { s.to_ascii_uppercase() } else { s };
                s.into_bytes()
            }
            b'g' | b'G' => {
                let p = precision.map_or(6, |p| p.max(1) as i32);
                let s = ops::format_float(ops::to_float(value), p);
                let s = if spec == b'G' { s } else { s.replace('E', "e") };
                s.into_bytes()
            }
            b's' => {
                numeric = false;
                let s = to_text(req, value)?;
                let bytes = s.as_bytes();
                match precision {
                    Some(p) if p < bytes.len() => bytes[..p].to_vec(),
                    _ => bytes.to_vec(),
                }
            }
            b'x' => format!("{:x}", ops::to_int(value)).into_bytes(),
            b'X' => format!("{:X}", ops::to_int(value)).into_bytes(),
            b'o' => format!("{:o}", ops::to_int(value)).into_bytes(),
            b'b' => format!("{:b}", ops::to_int(value)).into_bytes(),
            b'c' => {
                out.push(ops::to_int(value) as u8);
                continue;
            }
            other => {
                return Err(NativeFault::throw(
                    "ValueError",
                    format!("Unknown format specifier \"{}\"", other as char),
                ));
            }
        };

        let missing = width.saturating_sub(body.len());
        if missing == 0 {
            out.extend(body);
        } else if left {
            out.extend(body);
            out.extend(std::iter::repeat_n(pad, missing));
        } else if pad == b'0' && numeric && matches!(body.first(), Some(b'-' | b'+')) {
            out.push(body[0]);
            out.extend(std::iter::repeat_n(b'0', missing));
            out.extend_from_slice(&body[1..]);
        } else {
            out.extend(std::iter::repeat_n(pad, missing));
            out.extend(body);
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn sprintf(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let fmt = args.string(req, 0, "format")?;
    let values = args.rest(1).to_vec();
    Ok(Zval::from(format(req, &fmt, &values)?))
}

fn vsprintf(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let fmt = args.string(req, 0, "format")?;
    let values: Vec<Zval> = args.array(1, "values")?.borrow().values().cloned().collect();
    Ok(Zval::from(format(req, &fmt, &values)?))
}

fn printf(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let fmt = args.string(req, 0, "format")?;
    let values = args.rest(1).to_vec();
    let text = format(req, &fmt, &values)?;
    req.output.push_str(&text);
    Ok(Zval::Int(text.len() as i64))
}

fn number_format(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let num = args.float(0, "num")?;
    let decimals = args.opt_int(1, "decimals", 0)?.max(0) as usize;
    let point = args.opt_string(req, 2, "decimal_separator", ".")?;
    let separator = args.opt_string(req, 3, "thousands_separator", ",")?;

    let rounded = round_to(num, decimals as i64);
    let text = format!("{:.*}", decimals, rounded.abs());
    let (whole, fraction) = match text.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (text.as_str(), None),
    };

    let mut out = String::new();
    if rounded < 0.0 && text.bytes().any(|b| matches!(b, b'1'..=b'9')) {
        out.push('-');
    }
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            out.push_str(&separator);
        }
        out.push(digit);
    }
    if let Some(fraction) = fraction {
        out.push_str(&point);
        out.push_str(fraction);
    }
    Ok(Zval::from(out))
}

fn ordering(order: Ordering) -> Zval {
    Zval::Int(match order {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}

fn strcmp(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let a = args.string(req, 0, "string1")?;
    let b = args.string(req, 1, "string2")?;
    Ok(ordering(a.as_bytes().cmp(b.as_bytes())))
}

fn strcasecmp(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let a = args.string(req, 0, "string1")?.to_ascii_lowercase();
    let b = args.string(req, 1, "string2")?.to_ascii_lowercase();
    Ok(ordering(a.as_bytes().cmp(b.as_bytes())))
}

fn strncmp(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let a = args.string(req, 0, "string1")?;
    let b = args.string(req, 1, "string2")?;
    let length = args.int(2, "length")?;
    if length < 0 {
        return Err(args.value_error(2, "length", "must be greater than or equal to 0"));
    }
    let n = length as usize;
    let a = &a.as_bytes()[..n.min(a.len())];
    let b = &b.as_bytes()[..n.min(b.len())];
    Ok(ordering(a.cmp(b)))
}

fn ord(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let s = args.string(req, 0, "character")?;
    Ok(Zval::Int(s.bytes().next().map_or(0, i64::from)))
}

fn chr(_req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let code = args.int(0, "codepoint")?.rem_euclid(256) as u8;
    Ok(bytes_to_zval(&[code]))
}

fn htmlspecialchars(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let s = args.string(req, 0, "string")?;
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            c => out.push(c),
        }
    }
    Ok(Zval::from(out))
}

#[cfg(test)]
mod tests {
    use super::slice_range;
    use crate::runtime::{IniSettings, Runtime};
    use crate::request::Request;

    fn eval(src: &str) -> String {
        let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        request.eval(src, "t.php").unwrap();
        request.take_output()
    }

    #[test]
    fn test_slice_range() {
        assert_eq!(slice_range(5, 1, None), (1, 5));
        assert_eq!(slice_range(5, -2, None), (3, 5));
        assert_eq!(slice_range(5, 1, Some(-1)), (1, 4));
        assert_eq!(slice_range(5, 7, Some(2)), (5, 5));
        assert_eq!(slice_range(5, -9, Some(2)), (0, 2));
    }

    #[test]
    fn test_basic_string_functions() {
        let out = eval(
            r#"<?php
            echo strlen("hello"), "|", strtoupper("abc"), "|", ucfirst("word"), "|";
            echo trim("  x  "), "|", rtrim("xxa", "a"), "|", str_repeat("ab", 3), "|";
            echo substr("abcdef", 1, 3), "|", substr("abcdef", -2), "|";
            echo strpos("hello", "l"), "|", var_export(strpos("hello", "z"), true), "|";
            echo implode(",", explode(" ", "a b c")), "|", str_pad("7", 3, "0", STR_PAD_LEFT);
            "#,
        );
        assert_eq!(out, "5|ABC|Word|x|xx|ababab|bcd|ef|2|false|a,b,c|007");
    }

    #[test]
    fn test_sprintf_formats() {
        let out = eval(
            r#"<?php
            echo sprintf("%05.2f|%-4s|%'*6d|%x|%b|%+d|", 3.14159, "ab", 42, 255, 5, 3);
            echo sprintf('%2$s %1$s', 3.14159, "ab"), "\n";
            printf("%s is %d years", "Tom", 30);
            "#,
        );
        assert_eq!(out, "03.14|ab  |****42|ff|101|+3|ab 3.14159\nTom is 30 years");
    }

    #[test]
    fn test_number_format_and_replace() {
        let out = eval(
            r#"<?php
            echo number_format(1234567.891, 2), "|", number_format(0.5), "|", number_format(-1234.5, 1, ',', '.'), "|";
            echo str_replace(["a", "b"], ["1", "2"], "aabbc"), "|", strtr("Hi all", ["Hi" => "Hello", "all" => "world"]);
            "#,
        );
        assert_eq!(out, "1,234,567.89|1|-1.234,5|1122c|Hello world");
    }

    #[test]
    fn test_argument_type_errors() {
        let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        let value = request
            .eval(
                "<?php try { strlen([]); } catch (TypeError $e) { return $e->getMessage(); }",
                "t.php",
            )
            .unwrap();
        assert_eq!(
            value.as_str(),
            Some("strlen(): Argument #1 ($string) must be of type string, array given")
        );
        let value = request
            .eval(
                "<?php try { explode('', 'x'); } catch (ValueError $e) { return $e->getMessage(); }",
                "t.php",
            )
            .unwrap();
        assert_eq!(value.as_str(), Some("explode(): Argument #1 ($separator) cannot be empty"));
    }
}
