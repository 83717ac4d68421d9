use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::{self, BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::{
    blob::Blob,
    error::{Error, Result},
    headers::HeaderMap,
    query_string::SearchParams,
};

/// Raw input accepted as a request or response body.
#[derive(Debug, Clone)]
pub enum BodyInit {
    Text(String),

    /// An opaque blob, read through its [`BlobSource`](crate::BlobSource).
    Blob(Blob),

    /// Query-string-like pairs, sent in their urlencoded string form.
    SearchParams(SearchParams),

    /// A byte buffer. Borrowed input is copied on conversion.
    Bytes(Vec<u8>),

    /// Multipart form fields.
    Form(FormData),

    /// A structured object. Requests turn it into a query string (GET) or
    /// multipart fields (POST); anywhere else it is rejected.
    Structured(Map<String, Value>),
}

impl BodyInit {
    /// Serialize `value` into a structured body. Only values that serialize
    /// to a JSON object are accepted.
    pub fn structured<S: Serialize>(value: &S) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self::Structured(map)),
            _ => Err(Error::UnsupportedBody("structured value is not an object")),
        }
    }

    /// Empty text counts as no body at all.
    pub(crate) fn is_blank(&self) -> bool {
        matches!(self, BodyInit::Text(text) if text.is_empty())
    }
}

impl From<String> for BodyInit {
    fn from(body: String) -> Self {
        Self::Text(body)
    }
}

impl From<&'_ str> for BodyInit {
    fn from(body: &str) -> Self {
        Self::Text(body.to_string())
    }
}

impl From<Vec<u8>> for BodyInit {
    fn from(body: Vec<u8>) -> Self {
        Self::Bytes(body)
    }
}

impl From<&'_ [u8]> for BodyInit {
    fn from(body: &[u8]) -> Self {
        body.to_vec().into()
    }
}

impl From<Blob> for BodyInit {
    fn from(body: Blob) -> Self {
        Self::Blob(body)
    }
}

impl From<SearchParams> for BodyInit {
    fn from(body: SearchParams) -> Self {
        Self::SearchParams(body)
    }
}

impl From<FormData> for BodyInit {
    fn from(body: FormData) -> Self {
        Self::Form(body)
    }
}

impl From<Map<String, Value>> for BodyInit {
    fn from(body: Map<String, Value>) -> Self {
        Self::Structured(body)
    }
}

impl TryFrom<Value> for BodyInit {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::String(text) => Ok(Self::Text(text)),
            Value::Object(map) => Ok(Self::Structured(map)),
            _ => Err(Error::UnsupportedBody("JSON value is not an object or string")),
        }
    }
}

/// One multipart field value.
#[derive(Debug, Clone)]
pub enum FormValue {
    Text(String),
    Blob(Blob),
}

/// Ordered multipart form fields.
#[derive(Debug, Clone, Default)]
pub struct FormData {
    entries: Vec<(String, FormValue)>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries
            .push((name.into(), FormValue::Text(value.into())));
    }

    pub fn append_blob(&mut self, name: impl Into<String>, blob: Blob) {
        self.entries.push((name.into(), FormValue::Blob(blob)));
    }

    pub fn get(&self, name: &str) -> Option<&FormValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn entries(&self) -> &[(String, FormValue)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
enum Inner {
    /// No body.
    Empty,

    Text(String),

    Bytes(Vec<u8>),

    Form(FormData),

    Blob(Blob),
}

/// A classified body with one-shot materialization.
///
/// Exactly one of [`text`](Self::text), [`bytes`](Self::bytes),
/// [`blob`](Self::blob) or [`json`](Self::json) may succeed; any later read
/// fails with [`Error::AlreadyRead`]. The consumed flag flips at call time,
/// before the returned future is polled.
#[derive(Debug)]
pub struct BodyPayload {
    inner: Inner,
    used: AtomicBool,
}

impl Default for BodyPayload {
    fn default() -> Self {
        Self::empty()
    }
}

/// Each byte becomes the character with the same code point.
fn bytes_to_text(bytes: &[u8]) -> String {
    bytes.iter().map(|&byte| char::from(byte)).collect()
}

impl BodyPayload {
    pub fn empty() -> Self {
        Self::from_inner(Inner::Empty)
    }

    fn from_inner(inner: Inner) -> Self {
        Self {
            inner,
            used: AtomicBool::new(false),
        }
    }

    /// Classify `init` and fill in a default `content-type` when `headers`
    /// does not carry one yet.
    pub fn new(init: Option<BodyInit>, headers: &mut HeaderMap) -> Result<Self> {
        let mut content_type = None;
        let inner = match init {
            None => Inner::Empty,
            Some(BodyInit::Text(text)) => {
                content_type = Some("text/plain;charset=UTF-8".to_string());
                Inner::Text(text)
            }
            Some(BodyInit::Blob(blob)) => {
                content_type = blob.media_type().map(str::to_string);
                Inner::Blob(blob)
            }
            Some(BodyInit::SearchParams(params)) => {
                content_type =
                    Some("application/x-www-form-urlencoded;charset=UTF-8".to_string());
                Inner::Text(params.to_string())
            }
            Some(BodyInit::Bytes(bytes)) => Inner::Bytes(bytes),
            Some(BodyInit::Form(form)) => Inner::Form(form),
            Some(BodyInit::Structured(_)) => {
                return Err(Error::UnsupportedBody("structured object"))
            }
        };

        let unset = headers
            .get("content-type")
            .map_or(true, |value| value.is_empty());
        if let (true, Some(content_type)) = (unset, content_type) {
            headers.set("content-type", content_type)?;
        }

        Ok(Self::from_inner(inner))
    }

    /// Whether a read has already been attempted.
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_used(&self) {
        self.used.store(true, Ordering::SeqCst);
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.inner, Inner::Empty)
    }

    fn consume(&self) -> Result<()> {
        if self.used.swap(true, Ordering::SeqCst) {
            Err(Error::AlreadyRead)
        } else {
            Ok(())
        }
    }

    /// An unread payload over the same underlying data.
    pub(crate) fn duplicate(&self) -> Self {
        Self::from_inner(self.inner.clone())
    }

    /// The data as it should be handed to a transport.
    pub(crate) fn to_init(&self) -> Option<BodyInit> {
        match &self.inner {
            Inner::Empty => None,
            Inner::Text(text) => Some(BodyInit::Text(text.clone())),
            Inner::Bytes(bytes) => Some(BodyInit::Bytes(bytes.clone())),
            Inner::Form(form) => Some(BodyInit::Form(form.clone())),
            Inner::Blob(blob) => Some(BodyInit::Blob(blob.clone())),
        }
    }

    /// Read the body as text.
    ///
    /// Byte buffers are decoded one byte per character rather than as UTF-8.
    pub fn text(&self) -> BoxFuture<'static, Result<String>> {
        if let Err(err) = self.consume() {
            return future::ready(Err(err)).boxed();
        }
        let text = match &self.inner {
            Inner::Empty => String::new(),
            Inner::Text(text) => text.clone(),
            Inner::Bytes(bytes) => bytes_to_text(bytes),
            Inner::Form(_) => return future::ready(Err(Error::FormDataRead("text"))).boxed(),
            Inner::Blob(blob) => {
                let read = blob.read_text();
                return async move { Ok::<_, Error>(read.await?) }.boxed();
            }
        };
        future::ready(Ok(text)).boxed()
    }

    pub fn bytes(&self) -> BoxFuture<'static, Result<Vec<u8>>> {
        if let Err(err) = self.consume() {
            return future::ready(Err(err)).boxed();
        }
        let bytes = match &self.inner {
            Inner::Empty => Vec::new(),
            Inner::Text(text) => text.clone().into_bytes(),
            Inner::Bytes(bytes) => bytes.clone(),
            Inner::Form(_) => return future::ready(Err(Error::FormDataRead("bytes"))).boxed(),
            Inner::Blob(blob) => {
                let read = blob.read_bytes();
                return async move { Ok::<_, Error>(read.await?) }.boxed();
            }
        };
        future::ready(Ok(bytes)).boxed()
    }

    pub fn blob(&self) -> BoxFuture<'static, Result<Blob>> {
        if let Err(err) = self.consume() {
            return future::ready(Err(err)).boxed();
        }
        let blob = match &self.inner {
            Inner::Empty => Blob::new(Vec::new(), None),
            Inner::Text(text) => Blob::new(text.clone(), None),
            Inner::Bytes(bytes) => Blob::new(bytes.clone(), None),
            Inner::Form(_) => return future::ready(Err(Error::FormDataRead("blob"))).boxed(),
            Inner::Blob(blob) => blob.clone(),
        };
        future::ready(Ok(blob)).boxed()
    }

    /// Read the body as text and parse it. A parse failure is reported as
    /// [`Error::Parse`].
    pub fn json<D>(&self) -> BoxFuture<'static, Result<D>>
    where
        D: DeserializeOwned + Send + 'static,
    {
        let text = self.text();
        async move {
            let text = text.await?;
            Ok::<D, Error>(serde_json::from_str(&text)?)
        }
        .boxed()
    }
}
