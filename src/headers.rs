use http::header::{HeaderName, HeaderValue};
use tracing::warn;

use crate::error::{Error, Result};

/// Case-insensitive header store with one joined value per name.
///
/// Names are validated against the HTTP token alphabet and stored lowercase.
/// `append` on an existing name joins the values with `,`; `set` replaces.
/// Iteration follows first-insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

/// Anything that can be coerced into a header value.
pub trait IntoHeaderValue {
    fn into_header_value(self) -> String;
}

impl IntoHeaderValue for String {
    fn into_header_value(self) -> String {
        self
    }
}

impl IntoHeaderValue for &str {
    fn into_header_value(self) -> String {
        self.to_string()
    }
}

impl IntoHeaderValue for &String {
    fn into_header_value(self) -> String {
        self.clone()
    }
}

impl IntoHeaderValue for bool {
    fn into_header_value(self) -> String {
        self.to_string()
    }
}

macro_rules! display_header_value {
    ($($ty:ty),*) => {
        $(
            impl IntoHeaderValue for $ty {
                fn into_header_value(self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

display_header_value!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64, char);

/// A header value computed when it is written into a [`HeaderMap`].
pub struct Lazy<F>(F);

/// Defer computing a header value until it is appended or set.
pub fn lazy<F, V>(f: F) -> Lazy<F>
where
    F: FnOnce() -> V,
    V: IntoHeaderValue,
{
    Lazy(f)
}

impl<F, V> IntoHeaderValue for Lazy<F>
where
    F: FnOnce() -> V,
    V: IntoHeaderValue,
{
    fn into_header_value(self) -> String {
        (self.0)().into_header_value()
    }
}

fn normalize_name(name: &str) -> Result<String> {
    HeaderName::from_bytes(name.as_bytes())
        .map(|name| name.as_str().to_string())
        .map_err(|_| Error::InvalidHeaderName(name.to_string()))
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map by appending every pair in order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: IntoHeaderValue,
    {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.append(name.as_ref(), value)?;
        }
        Ok(headers)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    pub fn append(&mut self, name: &str, value: impl IntoHeaderValue) -> Result<()> {
        let name = normalize_name(name)?;
        let value = value.into_header_value();
        match self.position(&name) {
            Some(index) => {
                let existing = &mut self.entries[index].1;
                existing.push(',');
                existing.push_str(&value);
            }
            None => self.entries.push((name, value)),
        }
        Ok(())
    }

    pub fn set(&mut self, name: &str, value: impl IntoHeaderValue) -> Result<()> {
        let name = normalize_name(name)?;
        let value = value.into_header_value();
        match self.position(&name) {
            Some(index) => self.entries[index].1 = value,
            None => self.entries.push((name, value)),
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .map(|index| self.entries[index].1.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        if let Some(index) = self.position(name) {
            self.entries.remove(index);
        }
    }

    /// Visit every `(value, name)` pair in insertion order.
    pub fn for_each<F>(&self, mut callback: F)
    where
        F: FnMut(&str, &str),
    {
        for (name, value) in &self.entries {
            callback(value, name);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Names as of this call. Later writes are not observed.
    pub fn keys(&self) -> std::vec::IntoIter<String> {
        self.entries
            .iter()
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Values as of this call. Later writes are not observed.
    pub fn values(&self) -> std::vec::IntoIter<String> {
        self.entries
            .iter()
            .map(|(_, value)| value.clone())
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// `(name, value)` pairs as of this call. Later writes are not observed.
    pub fn entries(&self) -> std::vec::IntoIter<(String, String)> {
        self.entries.clone().into_iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a raw `name: value` header block as reported by a transport.
    ///
    /// Lines are split on `\r?\n` and at the first `:`. Lines without a name
    /// are ignored and lines with an invalid name are skipped.
    pub fn parse(raw: &str) -> Self {
        let mut headers = Self::new();
        for line in raw.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let (name, value) = line.split_once(':').unwrap_or((line, ""));
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if let Err(err) = headers.append(name, value.trim()) {
                warn!("Skipping response header line {:?}: {}", line, err);
            }
        }
        headers
    }
}

impl<'a> IntoIterator for &'a HeaderMap {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries()
    }
}

impl TryFrom<&HeaderMap> for http::HeaderMap {
    type Error = http::Error;

    fn try_from(headers: &HeaderMap) -> Result<Self, Self::Error> {
        let mut map = http::HeaderMap::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            map.append(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }
        Ok(map)
    }
}

impl From<&http::HeaderMap> for HeaderMap {
    fn from(map: &http::HeaderMap) -> Self {
        let mut headers = Self::new();
        for (name, value) in map.iter() {
            match value.to_str() {
                Ok(value) => {
                    // Names coming out of `http` are already valid tokens.
                    let _ = headers.append(name.as_str(), value);
                }
                Err(_) => warn!("Skipping non-ASCII value for header {}", name),
            }
        }
        headers
    }
}
