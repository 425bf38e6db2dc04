//! Structural dumping of guest values into [`HostValue`].

use bytes::Bytes;
use rquickjs::object::Filter;
use rquickjs::Value;

use crate::value::HostValue;

/// Depth cap shared with the marshaller; deeper graphs are assumed cyclic.
pub(crate) const MAX_DEPTH: usize = 128;

/// Structural clone of a guest value. Functions and over-deep graphs come
/// back as [`HostValue::Opaque`].
#[must_use]
pub fn dump(value: &Value<'_>) -> HostValue {
    dump_at(value, MAX_DEPTH)
}

fn dump_at(value: &Value<'_>, depth: usize) -> HostValue {
    if depth == 0 {
        return HostValue::Opaque;
    }

    if value.is_null() {
        return HostValue::Null;
    }
    if value.is_undefined() {
        return HostValue::Undefined;
    }
    if let Some(b) = value.as_bool() {
        return HostValue::Bool(b);
    }
    if let Some(i) = value.as_int() {
        return HostValue::Number(f64::from(i));
    }
    if value.is_number() {
        return value
            .as_number()
            .map_or(HostValue::Opaque, HostValue::Number);
    }
    if let Some(s) = value.as_string() {
        return s
            .to_string()
            .map_or(HostValue::Opaque, HostValue::String);
    }
    if value.is_function() {
        return HostValue::Opaque;
    }
    if let Some(exc) = value.as_exception() {
        let name: String = exc
            .get::<_, Option<String>>("name")
            .ok()
            .flatten()
            .unwrap_or_else(|| "Error".to_string());
        let message: String = exc
            .get::<_, Option<String>>("message")
            .ok()
            .flatten()
            .or_else(|| exc.message())
            .unwrap_or_default();
        return HostValue::Error { name, message };
    }
    if let Some(arr) = value.as_array() {
        let mut items = Vec::with_capacity(arr.len());
        for i in 0..arr.len() {
            match arr.get::<Value<'_>>(i) {
                Ok(item) => items.push(dump_at(&item, depth - 1)),
                Err(_) => items.push(HostValue::Undefined),
            }
        }
        return HostValue::Array(items);
    }
    if let Some(obj) = value.as_object() {
        if let Some(buf) = obj.as_array_buffer() {
            if let Some(bytes) = buf.as_bytes() {
                return HostValue::Bytes(Bytes::copy_from_slice(bytes));
            }
        }
        if let Some(ta) = obj.as_typed_array::<u8>() {
            if let Some(bytes) = ta.as_bytes() {
                return HostValue::Bytes(Bytes::copy_from_slice(bytes));
            }
        }
        let entries: Vec<(String, HostValue)> = obj
            .own_props::<String, Value<'_>>(Filter::new().string().enum_only())
            .flatten()
            .map(|(key, val)| (key, dump_at(&val, depth - 1)))
            .collect();
        return HostValue::Object(entries);
    }

    HostValue::Opaque
}
