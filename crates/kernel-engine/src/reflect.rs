//! Reflection over evaluated values for `inspect` and `getAllPropertyNames`.
//!
//! Each value category maps to a fixed prototype chain. Primitives use their
//! wrapper prototype (`String.prototype` for strings, and so on) and every
//! chain ends at `Object.prototype`.

use std::collections::HashSet;

use kernel_wire::Inspection;

use crate::inspect::to_display_string;
use crate::value::Value;

/// A prototype in a chain: its constructor name and own property names.
#[derive(Debug, Clone, Copy)]
pub struct Prototype {
    pub constructor: &'static str,
    pub names: &'static [&'static str],
}

const OBJECT: Prototype = Prototype {
    constructor: "Object",
    names: &[
        "constructor",
        "__defineGetter__",
        "__defineSetter__",
        "hasOwnProperty",
        "__lookupGetter__",
        "__lookupSetter__",
        "isPrototypeOf",
        "propertyIsEnumerable",
        "toString",
        "valueOf",
        "__proto__",
        "toLocaleString",
    ],
};

const STRING: Prototype = Prototype {
    constructor: "String",
    names: &[
        "length",
        "constructor",
        "anchor",
        "at",
        "big",
        "blink",
        "bold",
        "charAt",
        "charCodeAt",
        "codePointAt",
        "concat",
        "endsWith",
        "fontcolor",
        "fontsize",
        "fixed",
        "includes",
        "indexOf",
        "italics",
        "lastIndexOf",
        "link",
        "localeCompare",
        "match",
        "matchAll",
        "normalize",
        "padEnd",
        "padStart",
        "repeat",
        "replace",
        "replaceAll",
        "search",
        "slice",
        "small",
        "split",
        "strike",
        "sub",
        "substr",
        "substring",
        "sup",
        "startsWith",
        "toString",
        "trim",
        "trimStart",
        "trimLeft",
        "trimEnd",
        "trimRight",
        "toLocaleLowerCase",
        "toLocaleUpperCase",
        "toLowerCase",
        "toUpperCase",
        "valueOf",
    ],
};

const NUMBER: Prototype = Prototype {
    constructor: "Number",
    names: &[
        "constructor",
        "toExponential",
        "toFixed",
        "toPrecision",
        "toString",
        "valueOf",
        "toLocaleString",
    ],
};

const BOOLEAN: Prototype = Prototype {
    constructor: "Boolean",
    names: &["constructor", "toString", "valueOf"],
};

const ARRAY: Prototype = Prototype {
    constructor: "Array",
    names: &[
        "length",
        "constructor",
        "at",
        "concat",
        "copyWithin",
        "fill",
        "find",
        "findIndex",
        "findLast",
        "findLastIndex",
        "lastIndexOf",
        "pop",
        "push",
        "reverse",
        "shift",
        "unshift",
        "slice",
        "sort",
        "splice",
        "includes",
        "indexOf",
        "join",
        "keys",
        "entries",
        "values",
        "forEach",
        "filter",
        "flat",
        "flatMap",
        "map",
        "every",
        "some",
        "reduce",
        "reduceRight",
        "toLocaleString",
        "toString",
    ],
};

const FUNCTION: Prototype = Prototype {
    constructor: "Function",
    names: &[
        "length",
        "name",
        "arguments",
        "caller",
        "constructor",
        "apply",
        "bind",
        "call",
        "toString",
    ],
};

const ERROR: Prototype = Prototype {
    constructor: "Error",
    names: &["constructor", "name", "message", "toString"],
};

const PROMISE: Prototype = Prototype {
    constructor: "Promise",
    names: &["constructor", "then", "catch", "finally"],
};

const UINT8ARRAY: Prototype = Prototype {
    constructor: "Uint8Array",
    names: &["constructor", "BYTES_PER_ELEMENT"],
};

const BUFFER: Prototype = Prototype {
    constructor: "Buffer",
    names: &[
        "constructor",
        "equals",
        "compare",
        "copy",
        "toJSON",
        "toString",
        "write",
        "readUInt8",
        "writeUInt8",
    ],
};

/// Value category used to pick a prototype chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Bytes,
    Array,
    Object,
    Function,
    Error,
    Promise,
    Custom,
}

pub fn category(value: &Value) -> Category {
    match value {
        Value::Undefined => Category::Undefined,
        Value::Null => Category::Null,
        Value::Bool(_) => Category::Boolean,
        Value::Number(_) => Category::Number,
        Value::String(_) => Category::String,
        Value::Bytes(_) => Category::Bytes,
        Value::Array(_) => Category::Array,
        Value::Object(_) => Category::Object,
        Value::Function(_) => Category::Function,
        Value::Error(_) => Category::Error,
        Value::Deferred(_) => Category::Promise,
        Value::Custom(_) => Category::Custom,
    }
}

/// `typeof value`.
pub fn type_of(value: &Value) -> &'static str {
    match category(value) {
        Category::Undefined => "undefined",
        Category::Boolean => "boolean",
        Category::Number => "number",
        Category::String => "string",
        Category::Function => "function",
        _ => "object",
    }
}

/// Built-in prototypes above the value, nearest first.
pub fn prototype_chain(value: &Value) -> Vec<Prototype> {
    match category(value) {
        Category::Undefined | Category::Null => Vec::new(),
        Category::Boolean => vec![BOOLEAN, OBJECT],
        Category::Number => vec![NUMBER, OBJECT],
        Category::String => vec![STRING, OBJECT],
        Category::Bytes => vec![BUFFER, UINT8ARRAY, OBJECT],
        Category::Array => vec![ARRAY, OBJECT],
        Category::Function => vec![FUNCTION, OBJECT],
        Category::Error => vec![ERROR, OBJECT],
        Category::Promise => vec![PROMISE, OBJECT],
        Category::Object | Category::Custom => vec![OBJECT],
    }
}

/// Constructor names from the value's own class up to `Object`.
pub fn constructor_list(value: &Value) -> Vec<String> {
    let own_class = match value {
        Value::Object(obj) => obj.class.clone().filter(|c| c != "Object"),
        Value::Custom(custom) => Some(custom.type_name().to_string()),
        Value::Error(err) if err.name != "Error" => Some(err.name.clone()),
        _ => None,
    };
    own_class
        .into_iter()
        .chain(
            prototype_chain(value)
                .into_iter()
                .map(|p| p.constructor.to_string()),
        )
        .collect()
}

/// Properties that live on the value itself rather than its prototypes.
///
/// Primitives have none: their names come from the wrapper prototype.
fn own_property_names(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => (0..items.len())
            .map(|i| i.to_string())
            .chain(std::iter::once("length".to_string()))
            .collect(),
        Value::Bytes(bytes) => (0..bytes.len()).map(|i| i.to_string()).collect(),
        Value::Object(obj) => obj.keys().map(str::to_string).collect(),
        Value::Function(_) => vec!["length".into(), "name".into(), "prototype".into()],
        Value::Error(_) => vec!["stack".into(), "message".into()],
        Value::Custom(custom) => custom.property_names(),
        _ => Vec::new(),
    }
}

/// All property names reachable from the value, own names first, then each
/// prototype in chain order. Each name appears once.
pub fn property_names(value: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    let chained = prototype_chain(value)
        .into_iter()
        .flat_map(|p| p.names.iter().map(|n| n.to_string()));
    for name in own_property_names(value).into_iter().chain(chained) {
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }
    names
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.encode_utf16().count()),
        Value::Array(items) => Some(items.len()),
        Value::Bytes(bytes) => Some(bytes.len()),
        _ => None,
    }
}

/// Structural description answered to `inspect`.
pub fn describe(value: &Value) -> Inspection {
    Inspection {
        string: to_display_string(value),
        type_name: type_of(value).to_string(),
        constructor_list: constructor_list(value),
        length: length_of(value),
    }
}
