//! Value dumpers: `print_r`, `var_dump` and `var_export`.

use super::{entries, to_text, Args, Builtin, BuiltinResult};
use crate::error::NativeFault;
use crate::ops;
use crate::request::Request;
use crate::value::{ArrayKey, Zval};
use std::fmt::Write as _;
use std::rc::Rc;

pub(super) const FUNCTIONS: &[Builtin] = &[
    Builtin::new("print_r", 1, Some(2), print_r),
    Builtin::new("var_dump", 1, None, var_dump),
    Builtin::new("var_export", 1, Some(2), var_export),
];

/// Containers currently being printed, by address.
#[derive(Default)]
struct Seen(Vec<usize>);

impl Seen {
    fn enter(&mut self, address: usize) -> bool {
        if self.0.contains(&address) {
            return false;
        }
        self.0.push(address);
        true
    }

    fn leave(&mut self) {
        self.0.pop();
    }
}

fn address<T: ?Sized>(rc: &Rc<T>) -> usize {
    Rc::as_ptr(rc) as *const () as usize
}

/// Entries of an array or the properties of an object.
fn members(value: &Zval) -> Vec<(ArrayKey, Zval)> {
    match value {
        Zval::Array(array) => entries(array),
        Zval::Object(obj) => obj
            .borrow()
            .props
            .iter()
            .map(|(name, value)| (ArrayKey::Str(name.clone()), value.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

fn print_r_into(
    req: &mut Request,
    value: &Zval,
    indent: usize,
    out: &mut String,
    seen: &mut Seen,
) -> Result<(), NativeFault> {
    let address = match value {
        Zval::Array(array) => {
            out.push_str("Array\n");
            address(array)
        }
        Zval::Object(obj) => {
            let _ = writeln!(out, "{} Object", obj.borrow().class);
            address(obj)
        }
        Zval::Callable(callable) => {
            out.push_str("Closure Object\n");
            address(callable)
        }
        other => {
            out.push_str(&to_text(req, other)?);
            return Ok(());
        }
    };
    if !seen.enter(address) {
        out.push_str(" *RECURSION*");
        return Ok(());
    }

    let _ = writeln!(out, "{:indent$}(", "");
    for (key, member) in members(value) {
        let _ = write!(out, "{:width$}[{key}] => ", "", width = indent + 4);
        print_r_into(req, &member, indent + 8, out, seen)?;
        out.push('\n');
    }
    let _ = writeln!(out, "{:indent$})", "");
    seen.leave();
    Ok(())
}

fn print_r(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let mut out = String::new();
    print_r_into(req, &args.value(0), 0, &mut out, &mut Seen::default())?;
    if args.opt_bool(1, "return", false)? {
        return Ok(Zval::from(out));
    }
    req.output.push_str(&out);
    Ok(Zval::Bool(true))
}

fn dump_key(key: &ArrayKey) -> String {
    match key {
        ArrayKey::Int(i) => format!("[{i}]"),
        ArrayKey::Str(s) => format!("[\"{s}\"]"),
    }
}

fn var_dump_into(value: &Zval, indent: usize, out: &mut String, seen: &mut Seen) {
    let pad = " ".repeat(indent);
    let (header, address) = match value {
        Zval::Null => {
            let _ = writeln!(out, "{pad}NULL");
            return;
        }
        Zval::Bool(b) => {
            let _ = writeln!(out, "{pad}bool({b})");
            return;
        }
        Zval::Int(i) => {
            let _ = writeln!(out, "{pad}int({i})");
            return;
        }
        Zval::Float(f) => {
            let _ = writeln!(out, "{pad}float({})", ops::format_float(*f, -1));
            return;
        }
        Zval::Str(s) => {
            let _ = writeln!(out, "{pad}string({}) \"{s}\"", s.len());
            return;
        }
        Zval::Resource(res) => {
            let kind = if res.is_open() { &*res.kind } else { "Unknown" };
            let _ = writeln!(out, "{pad}resource({}) of type ({kind})", res.id);
            return;
        }
        Zval::Callable(callable) => {
            let _ = writeln!(out, "{pad}object(Closure)#{} (0) {{\n{pad}}}", callable.id);
            return;
        }
        Zval::Array(array) => (format!("array({})", array.borrow().len()), address(array)),
        Zval::Object(obj) => {
            let obj_ref = obj.borrow();
            (
                format!("object({})#{} ({})", obj_ref.class, obj_ref.id, obj_ref.props.len()),
                address(obj),
            )
        }
    };

    if !seen.enter(address) {
        let _ = writeln!(out, "{pad}*RECURSION*");
        return;
    }
    let _ = writeln!(out, "{pad}{header} {{");
    for (key, member) in members(value) {
        let _ = writeln!(out, "{pad}  {}=>", dump_key(&key));
        var_dump_into(&member, indent + 2, out, seen);
    }
    let _ = writeln!(out, "{pad}}}");
    seen.leave();
}

fn var_dump(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let mut out = String::new();
    for value in args.rest(0) {
        var_dump_into(value, 0, &mut out, &mut Seen::default());
    }
    req.output.push_str(&out);
    Ok(Zval::Null)
}

fn export_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn export_float(f: f64) -> String {
    let text = ops::format_float(f, -1);
    if text.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
        format!("{text}.0")
    } else {
        text
    }
}

fn var_export_into(
    req: &mut Request,
    value: &Zval,
    level: usize,
    out: &mut String,
    seen: &mut Seen,
) {
    match value {
        Zval::Null => out.push_str("NULL"),
        Zval::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Zval::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Zval::Float(f) => out.push_str(&export_float(*f)),
        Zval::Str(s) => out.push_str(&export_string(s)),
        Zval::Resource(_) => out.push_str("NULL"),
        Zval::Callable(_) => out.push_str("\\Closure::__set_state(array(\n))"),
        Zval::Array(array) => {
            if !seen.enter(address(array)) {
                req.warn("var_export does not handle circular references");
                out.push_str("NULL");
                return;
            }
            if level > 1 {
                let _ = write!(out, "\n{:width$}", "", width = level - 1);
            }
            out.push_str("array (\n");
            for (key, member) in entries(array) {
                let _ = write!(out, "{:width$}", "", width = level + 1);
                match &key {
                    ArrayKey::Int(i) => {
                        let _ = write!(out, "{i}");
                    }
                    ArrayKey::Str(s) => out.push_str(&export_string(s)),
                }
                out.push_str(" => ");
                var_export_into(req, &member, level + 2, out, seen);
                out.push_str(",\n");
            }
            if level > 1 {
                let _ = write!(out, "{:width$}", "", width = level - 1);
            }
            out.push(')');
            seen.leave();
        }
        Zval::Object(obj) => {
            if !seen.enter(address(obj)) {
                req.warn("var_export does not handle circular references");
                out.push_str("NULL");
                return;
            }
            let class = obj.borrow().class.clone();
            let plain = class.eq_ignore_ascii_case("stdClass");
            if level > 1 {
                let _ = write!(out, "\n{:width$}", "", width = level - 1);
            }
            if plain {
                out.push_str("(object) array(\n");
            } else {
                let _ = write!(out, "\\{class}::__set_state(array(\n");
            }
            for (key, member) in members(value) {
                let _ = write!(out, "{:width$}", "", width = level + 2);
                match &key {
                    ArrayKey::Int(i) => {
                        let _ = write!(out, "{i}");
                    }
                    ArrayKey::Str(s) => out.push_str(&export_string(s)),
                }
                out.push_str(" => ");
                var_export_into(req, &member, level + 2, out, seen);
                out.push_str(",\n");
            }
            if level > 1 {
                let _ = write!(out, "{:width$}", "", width = level - 1);
            }
            out.push_str(if plain { ")" } else { "))" });
            seen.leave();
        }
    }
}

fn var_export(req: &mut Request, args: &mut Args<'_>) -> BuiltinResult {
    let mut out = String::new();
    var_export_into(req, &args.value(0), 1, &mut out, &mut Seen::default());
    if args.opt_bool(1, "return", false)? {
        return Ok(Zval::from(out));
    }
    req.output.push_str(&out);
    Ok(Zval::Null)
}

#[cfg(test)]
mod tests {
    use super::{export_float, export_string};
    use crate::request::Request;
    use crate::runtime::{IniSettings, Runtime};

    fn eval(src: &str) -> String {
        let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        request.eval(src, "t.php").unwrap();
        request.take_output()
    }

    #[test]
    fn test_export_scalars() {
        assert_eq!(export_float(1.0), "1.0");
        assert_eq!(export_float(0.5), "0.5");
        assert_eq!(export_string("it's a \\ test"), "'it\\'s a \\\\ test'");
    }

    #[test]
    fn test_print_r_nested() {
        let out = eval("<?php print_r(['a' => 1, 'b' => [2]]);");
        assert_eq!(
            out,
            "Array\n(\n    [a] => 1\n    [b] => Array\n        (\n            [0] => 2\n        )\n\n)\n"
        );
    }

    #[test]
    fn test_var_dump_values() {
        let out = eval("<?php var_dump([1, 'x' => 'hi', 'f' => 1.5, 'n' => null, 'b' => false]);");
        assert_eq!(
            out,
            "array(5) {\n  [0]=>\n  int(1)\n  [\"x\"]=>\n  string(2) \"hi\"\n  [\"f\"]=>\n  float(1.5)\n  [\"n\"]=>\n  NULL\n  [\"b\"]=>\n  bool(false)\n}\n"
        );
    }

    #[test]
    fn test_var_export_nested() {
        let out = eval("<?php var_export(['a' => [1], 'b' => true]);");
        assert_eq!(out, "array (\n  'a' => \n  array (\n    0 => 1,\n  ),\n  'b' => true,\n)");
    }

    #[test]
    fn test_self_referencing_object_reports_recursion() {
        let out = eval("<?php $o = new stdClass; $o->self = $o; print_r($o);");
        assert_eq!(out, "stdClass Object\n(\n    [self] => stdClass Object\n *RECURSION*\n)\n");
    }
}
