//! Text forms of values.
//!
//! `inspect` mirrors Node's `util.inspect` (the `text/plain` fallback of
//! every rendered result); `to_display_string` mirrors `String(value)`.

use crate::value::{Object, Value};

/// Nesting depth past which containers are summarized as `[Array]`/`[Object]`.
const MAX_DEPTH: usize = 2;

/// Bytes shown before a buffer is abbreviated.
const MAX_BUFFER_BYTES: usize = 50;

/// Format a number the way JavaScript prints it.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let sign = if n > 0.0 { "" } else { "-" };
        format!("{}Infinity", sign)
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{:.0}", n)
    } else {
        format!("{}", n)
    }
}

/// `String(value)`.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Undefined => "undefined".to_string(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::String(s) => s.clone(),
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Undefined | Value::Null => String::new(),
                other => to_display_string(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
        Value::Function(name) => format!("function {}() {{ [native code] }}", name),
        Value::Error(err) => err.header(),
        Value::Deferred(_) => "[object Promise]".to_string(),
        Value::Custom(custom) => custom
            .inspect()
            .unwrap_or_else(|| format!("[object {}]", custom.type_name())),
    }
}

/// `util.inspect(value)`.
pub fn inspect(value: &Value) -> String {
    inspect_at(value, 0)
}

fn inspect_at(value: &Value, depth: usize) -> String {
    match value {
        Value::String(s) => quote(s),
        Value::Bytes(bytes) => {
            let shown: Vec<String> = bytes
                .iter()
                .take(MAX_BUFFER_BYTES)
                .map(|b| format!("{:02x}", b))
                .collect();
            let mut out = format!("<Buffer {}", shown.join(" "));
            if bytes.len() > MAX_BUFFER_BYTES {
                out.push_str(&format!(" ... {} more bytes", bytes.len() - MAX_BUFFER_BYTES));
            }
            out.push('>');
            out
        }
        Value::Array(items) => {
            if items.is_empty() {
                return "[]".to_string();
            }
            if depth > MAX_DEPTH {
                return "[Array]".to_string();
            }
            let parts: Vec<String> = items.iter().map(|v| inspect_at(v, depth + 1)).collect();
            format!("[ {} ]", parts.join(", "))
        }
        Value::Object(obj) => inspect_object(obj, depth),
        Value::Function(name) if name.is_empty() => "[Function (anonymous)]".to_string(),
        Value::Function(name) => format!("[Function: {}]", name),
        Value::Error(err) => err.stack.clone().unwrap_or_else(|| err.header()),
        Value::Deferred(deferred) => match deferred.peek() {
            None => "Promise { <pending> }".to_string(),
            Some(Ok(v)) => format!("Promise {{ {} }}", inspect_at(v, depth + 1)),
            Some(Err(e)) => format!("Promise {{ <rejected> {} }}", inspect_at(e, depth + 1)),
        },
        Value::Custom(custom) => custom
            .inspect()
            .unwrap_or_else(|| format!("{} {{}}", custom.type_name())),
        other => to_display_string(other),
    }
}

fn inspect_object(obj: &Object, depth: usize) -> String {
    let prefix = match obj.class.as_deref() {
        Some(class) if class != "Object" => format!("{} ", class),
        _ => String::new(),
    };
    if obj.entries.is_empty() {
        return format!("{}{{}}", prefix);
    }
    if depth > MAX_DEPTH {
        return format!("[{}]", obj.class.as_deref().unwrap_or("Object"));
    }
    let parts: Vec<String> = obj
        .entries
        .iter()
        .map(|(key, value)| format!("{}: {}", format_key(key), inspect_at(value, depth + 1)))
        .collect();
    format!("{}{{ {} }}", prefix, parts.join(", "))
}

fn format_key(key: &str) -> String {
    let mut chars = key.chars();
    let is_identifier = match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {
            chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
        }
        _ => false,
    };
    if is_identifier {
        key.to_string()
    } else {
        quote(key)
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}
