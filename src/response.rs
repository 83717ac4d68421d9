use crate::{
    body::{BodyInit, BodyPayload},
    body_ext::Body,
    error::{Error, Result},
    headers::HeaderMap,
    transport::RawResponse,
};

const REDIRECT_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    #[default]
    Default,
    /// The network-error sentinel built by [`Response::error`].
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseInit {
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub headers: Option<HeaderMap>,
    pub url: Option<String>,
}

impl ResponseInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = Some(status_text.into());
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// A received (or synthesized) response.
///
/// Status, status text, headers and URL are fixed at construction; `ok` is
/// computed once from the status.
#[derive(Debug)]
pub struct Response {
    response_type: ResponseType,
    status: u16,
    status_text: String,
    ok: bool,
    headers: HeaderMap,
    url: String,
    body: BodyPayload,
}

impl Response {
    /// Defaults to `200 OK` with no headers and an empty URL.
    pub fn new(body: Option<BodyInit>, init: ResponseInit) -> Result<Self> {
        let status = init.status.unwrap_or(200);
        let mut headers = init.headers.unwrap_or_default();
        let body = BodyPayload::new(body, &mut headers)?;
        Ok(Self {
            response_type: ResponseType::Default,
            status,
            status_text: init.status_text.unwrap_or_else(|| "OK".to_string()),
            ok: (200..300).contains(&status),
            headers,
            url: init.url.unwrap_or_default(),
            body,
        })
    }

    pub fn error() -> Self {
        Self {
            response_type: ResponseType::Error,
            status: 0,
            status_text: String::new(),
            ok: false,
            headers: HeaderMap::new(),
            url: String::new(),
            body: BodyPayload::empty(),
        }
    }

    /// A bodiless redirect to `url`. Only 301, 302, 303, 307 and 308 are
    /// accepted.
    pub fn redirect(url: &str, status: u16) -> Result<Self> {
        if !REDIRECT_STATUSES.contains(&status) {
            return Err(Error::InvalidRedirectStatus(status));
        }
        let headers = HeaderMap::from_pairs([("location", url)])?;
        Self::new(None, ResponseInit::new().status(status).headers(headers))
    }

    /// Build a response from what a transport reported on completion.
    ///
    /// The URL is the transport's final URL, falling back to the
    /// `X-Request-URL` response header.
    pub fn from_raw(raw: RawResponse) -> Result<Self> {
        let headers = HeaderMap::parse(&raw.headers);
        let url = raw
            .url
            .filter(|url| !url.is_empty())
            .or_else(|| headers.get("x-request-url").map(str::to_string));
        let init = ResponseInit {
            status: Some(raw.status),
            status_text: Some(raw.status_text),
            headers: Some(headers),
            url,
        };
        Self::new(raw.body, init)
    }

    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// The clone reads the same underlying data but has its own consumed flag.
impl Clone for Response {
    fn clone(&self) -> Self {
        Self {
            response_type: self.response_type,
            status: self.status,
            status_text: self.status_text.clone(),
            ok: self.ok,
            headers: self.headers.clone(),
            url: self.url.clone(),
            body: self.body.duplicate(),
        }
    }
}

impl Body for Response {
    fn payload(&self) -> &BodyPayload {
        &self.body
    }
}
