use std::{fmt, time::Duration};

use serde::Serialize;
use tracing::debug;

use crate::{
    body::{BodyInit, BodyPayload},
    body_ext::Body,
    error::{Error, Result},
    headers::HeaderMap,
    query_string::{append_to_url, to_form_data, to_query_string},
};

/// Verbs whose spelling is normalized to upper case.
const KNOWN_METHODS: [&str; 6] = ["DELETE", "GET", "HEAD", "OPTIONS", "POST", "PUT"];

fn normalize_method(method: &str) -> String {
    let upper = method.to_ascii_uppercase();
    if KNOWN_METHODS.contains(&upper.as_str()) {
        upper
    } else {
        method.to_string()
    }
}

/// Whether cookies and auth travel with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Credentials {
    #[default]
    Omit,
    SameOrigin,
    Include,
}

impl Credentials {
    pub fn as_str(&self) -> &'static str {
        match self {
            Credentials::Omit => "omit",
            Credentials::SameOrigin => "same-origin",
            Credentials::Include => "include",
        }
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for building a [`Request`]. Unset fields fall back to the source
/// request when cloning, then to the defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestInit {
    pub method: Option<String>,
    pub headers: Option<HeaderMap>,
    pub body: Option<BodyInit>,
    pub credentials: Option<Credentials>,
    pub mode: Option<String>,
    pub timeout: Option<Duration>,
}

impl RequestInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn body(mut self, body: impl Into<BodyInit>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Use a serializable object as a structured body.
    pub fn json<S: Serialize>(mut self, payload: &S) -> Result<Self> {
        self.body = Some(BodyInit::structured(payload)?);
        Ok(self)
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fields set on `other` win.
    pub(crate) fn merge(self, other: RequestInit) -> Self {
        Self {
            method: other.method.or(self.method),
            headers: other.headers.or(self.headers),
            body: other.body.or(self.body),
            credentials: other.credentials.or(self.credentials),
            mode: other.mode.or(self.mode),
            timeout: other.timeout.or(self.timeout),
        }
    }
}

/// An outgoing request: normalized method, final URL, headers and body.
///
/// GET and HEAD requests never carry a body once constructed. A structured
/// body on GET is moved into the query string; on POST it becomes multipart
/// fields.
#[derive(Debug)]
pub struct Request {
    url: String,
    method: String,
    headers: HeaderMap,
    credentials: Credentials,
    mode: Option<String>,
    timeout: Option<Duration>,
    body: BodyPayload,
}

struct Parts {
    url: String,
    method: String,
    headers: HeaderMap,
    credentials: Credentials,
    mode: Option<String>,
    timeout: Option<Duration>,
    body: Option<BodyInit>,
}

impl Request {
    pub fn new(url: impl Into<String>, init: RequestInit) -> Result<Self> {
        Self::build(Parts {
            url: url.into(),
            method: init.method.unwrap_or_else(|| "GET".to_string()),
            headers: init.headers.unwrap_or_default(),
            credentials: init.credentials.unwrap_or_default(),
            mode: init.mode,
            timeout: init.timeout,
            body: init.body,
        })
    }

    pub fn get(url: impl Into<String>) -> Result<Self> {
        Self::new(url, RequestInit::default())
    }

    /// Build a request from `source`, overridden by `init`.
    ///
    /// When `init` has no body, the source's body is taken over and the
    /// source is marked consumed. Fails with [`Error::AlreadyRead`] if the
    /// source body was already read.
    pub fn from_request(source: &Request, init: RequestInit) -> Result<Self> {
        if source.body.is_used() {
            return Err(Error::AlreadyRead);
        }

        let mut body = init.body.filter(|body| !body.is_blank());
        if body.is_none() && !source.body.is_empty() {
            body = source.body.to_init();
            source.body.mark_used();
        }

        Self::build(Parts {
            url: source.url.clone(),
            method: init.method.unwrap_or_else(|| source.method.clone()),
            headers: init.headers.unwrap_or_else(|| source.headers.clone()),
            credentials: init.credentials.unwrap_or(source.credentials),
            mode: init.mode.or_else(|| source.mode.clone()),
            timeout: init.timeout.or(source.timeout),
            body,
        })
    }

    /// A new request with the same body. Fails once the body was read.
    pub fn try_clone(&self) -> Result<Self> {
        let init = RequestInit {
            body: self.body.to_init(),
            ..RequestInit::default()
        };
        Self::from_request(self, init)
    }

    fn build(parts: Parts) -> Result<Self> {
        let Parts {
            mut url,
            method,
            mut headers,
            credentials,
            mode,
            timeout,
            body,
        } = parts;

        let method = normalize_method(&method);
        let timeout = timeout.filter(|timeout| !timeout.is_zero());
        let bodiless = method == "GET" || method == "HEAD";

        let body = match body.filter(|body| !body.is_blank()) {
            None => None,
            Some(BodyInit::Structured(fields)) if method == "GET" => {
                let query = to_query_string(&fields);
                if !query.is_empty() {
                    append_to_url(&mut url, &query);
                }
                debug!("Moved structured GET body into query string: {}", url);
                None
            }
            Some(_) if bodiless => return Err(Error::BodyNotAllowed),
            Some(BodyInit::Structured(fields)) if method == "POST" => {
                Some(BodyInit::Form(to_form_data(&fields)))
            }
            body => body,
        };

        let body = BodyPayload::new(body, &mut headers)?;

        Ok(Self {
            url,
            method,
            headers,
            credentials,
            mode,
            timeout,
            body,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    pub fn mode(&self) -> Option<&str> {
        self.mode.as_deref()
    }

    /// Only ever set to a positive duration.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Requests never carry a referrer.
    pub fn referrer(&self) -> Option<&str> {
        None
    }

    /// Take the body for sending. Fails if it was already read or sent.
    pub(crate) fn take_body(&self) -> Result<Option<BodyInit>> {
        if self.body.is_used() {
            return Err(Error::AlreadyRead);
        }
        self.body.mark_used();
        Ok(self.body.to_init())
    }
}

impl Body for Request {
    fn payload(&self) -> &BodyPayload {
        &self.body
    }
}
