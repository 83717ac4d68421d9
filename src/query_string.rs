//! Encoders for structured bodies: query strings for GET and multipart
//! fields for POST.

use std::fmt;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{Map, Value};

use crate::body::FormData;

/// Name of the form field listing which other fields carry JSON.
pub const JSON_FIELDS_MARKER: &str = "__json";

/// Everything except `A-Z a-z 0-9 - _ . ! ~ * ' ( )`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// `application/x-www-form-urlencoded` keeps only `* - . _` unescaped.
const FORM_URLENCODED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'*')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_');

fn encode(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

fn encode_form(value: &str) -> String {
    utf8_percent_encode(value, FORM_URLENCODED)
        .to_string()
        .replace("%20", "+")
}

/// Ordered `application/x-www-form-urlencoded` pairs.
///
/// Used as a body it is sent as its string form with a urlencoded
/// content type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchParams {
    pairs: Vec<(String, String)>,
}

impl SearchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

impl<K, V> FromIterator<(K, V)> for SearchParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, value) in iter {
            params.append(name, value);
        }
        params
    }
}

impl fmt::Display for SearchParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (name, value)) in self.pairs.iter().enumerate() {
            if index > 0 {
                f.write_str("&")?;
            }
            write!(f, "{}={}", encode_form(name), encode_form(value))?;
        }
        Ok(())
    }
}

/// String form of a non-array value.
fn scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn encode_field(key: &str, value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let key = format!("{key}[]");
            items
                .iter()
                .map(|item| encode_field(&key, item))
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("&")
        }
        Value::Number(n) if n.as_f64() == Some(0.0) => key.to_string(),
        _ => {
            let value = scalar(value);
            if value.is_empty() {
                key.to_string()
            } else {
                format!("{key}={}", encode(&value))
            }
        }
    }
}

/// Serialize an object as `key=value` pairs joined with `&`.
///
/// Keys are percent-encoded once; arrays repeat the key with a `[]` suffix.
/// Null becomes an empty value, booleans become `1`/`0`, and an empty value
/// or a numeric zero leaves the bare key.
pub fn to_query_string(fields: &Map<String, Value>) -> String {
    fields
        .iter()
        .map(|(key, value)| encode_field(&encode(key), value))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("&")
}

/// Turn an object into multipart fields.
///
/// Object and array values are JSON-stringified and their names listed, as
/// a JSON array, under [`JSON_FIELDS_MARKER`] so the server knows which
/// fields to decode.
pub fn to_form_data(fields: &Map<String, Value>) -> FormData {
    let mut form = FormData::new();
    let mut json_fields = Vec::new();
    for (key, value) in fields {
        match value {
            Value::Array(_) | Value::Object(_) => {
                form.append_text(key, value.to_string());
                json_fields.push(Value::String(key.clone()));
            }
            _ => form.append_text(key, scalar(value)),
        }
    }
    if !json_fields.is_empty() {
        form.append_text(JSON_FIELDS_MARKER, Value::Array(json_fields).to_string());
    }
    form
}

/// Append a query string to `url`, using `&` if it already has one.
pub(crate) fn append_to_url(url: &mut String, query: &str) {
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(query);
}
