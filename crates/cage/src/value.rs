//! Host-side representation of guest values.
//!
//! A [`HostValue`] is the structural clone produced by dumping a guest value
//! across the boundary: primitives map directly, arrays stay ordered,
//! objects keep string keys in insertion order, errors keep `name` and
//! `message`, and functions collapse to an opaque marker (callers that need
//! to invoke a guest function must keep the original handle).

use bytes::Bytes;

#[derive(Clone, Debug, Default, PartialEq)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<HostValue>),
    Object(Vec<(String, HostValue)>),
    Error {
        name: String,
        message: String,
    },
    /// A guest value with no structural host representation (functions).
    Opaque,
}

impl HostValue {
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            name: name.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn object(entries: impl IntoIterator<Item = (impl Into<String>, HostValue)>) -> Self {
        Self::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[HostValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a key on an object value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        match self {
            Self::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Console-style rendering: strings bare at top level, containers
    /// rendered one level at a time with strings quoted inside them.
    #[must_use]
    pub fn to_display_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            other => other.render(),
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => render_number(*n),
            Self::String(s) => format!("\"{s}\""),
            Self::Bytes(b) => format!("ArrayBuffer({})", b.len()),
            Self::Array(items) => {
                let inner: Vec<String> = items.iter().map(Self::render).collect();
                format!("[{}]", inner.join(", "))
            }
            Self::Object(entries) => {
                let inner: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{k}: {}", v.render()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Self::Error { name, message } => format!("{name}: {message}"),
            Self::Opaque => "[Function]".to_string(),
        }
    }
}

fn render_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Bytes> for HostValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(value: Vec<HostValue>) -> Self {
        Self::Array(value)
    }
}

#[cfg(test)]
mod tests {
    use super::HostValue;

    #[test]
    fn display_formats_primitives() {
        assert_eq!(HostValue::Undefined.to_display_string(), "undefined");
        assert_eq!(HostValue::Null.to_display_string(), "null");
        assert_eq!(HostValue::Number(3.0).to_display_string(), "3");
        assert_eq!(HostValue::Number(3.5).to_display_string(), "3.5");
        assert_eq!(HostValue::from("hi").to_display_string(), "hi");
    }

    #[test]
    fn display_quotes_strings_inside_containers() {
        let value = HostValue::Array(vec![HostValue::from("a"), HostValue::Number(1.0)]);
        assert_eq!(value.to_display_string(), "[\"a\", 1]");

        let value = HostValue::object([("k", HostValue::from("v"))]);
        assert_eq!(value.to_display_string(), "{k: \"v\"}");
    }

    #[test]
    fn object_lookup_finds_first_match() {
        let value = HostValue::object([
            ("a", HostValue::Number(1.0)),
            ("b", HostValue::Number(2.0)),
        ]);
        assert_eq!(value.get("b"), Some(&HostValue::Number(2.0)));
        assert_eq!(value.get("c"), None);
    }
}
