//! The seam between a [`Session`](crate::Session) and whatever performs the
//! network exchange.
//!
//! A transport opens one handle per request. The handle is configured by a
//! [`Dispatch`], sends it, and reports back through [`TransportEvents`]:
//! any number of progress updates followed by exactly one terminal event.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use crate::{
    body::BodyInit,
    error::{Error, Result},
    headers::HeaderMap,
    request::{Credentials, Request},
};

/// Opens network exchanges.
pub trait Transport: Send + Sync {
    /// Prepare an exchange for `method` and `url`. Nothing is sent yet.
    fn open(&self, method: &str, url: &str) -> Arc<dyn TransportHandle>;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn open(&self, method: &str, url: &str) -> Arc<dyn TransportHandle> {
        self.as_ref().open(method, url)
    }
}

/// One open exchange.
pub trait TransportHandle: Send + Sync {
    /// Start the exchange. Events must be delivered after this returns,
    /// never from inside it.
    fn send(&self, dispatch: Dispatch, events: TransportEvents);

    /// Stop the exchange. No further events are expected.
    fn abort(&self);
}

/// How the transport should hand back the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseHint {
    #[default]
    Blob,
    Text,
}

/// Everything a transport needs to send one request.
#[derive(Debug, Clone, Default)]
pub struct Dispatch {
    pub headers: HeaderMap,
    /// Only set when the request asked for a positive timeout.
    pub timeout: Option<Duration>,
    /// `None` leaves the transport's own default in place.
    pub with_credentials: Option<bool>,
    pub response_hint: ResponseHint,
    pub body: Option<BodyInit>,
}

impl Dispatch {
    /// Take the request's body for sending.
    pub fn from_request(request: &Request) -> Result<Self> {
        let body = request.take_body()?;
        let with_credentials = match request.credentials() {
            Credentials::Include => Some(true),
            Credentials::Omit => Some(false),
            Credentials::SameOrigin => None,
        };
        Ok(Self {
            headers: request.headers().clone(),
            timeout: request.timeout(),
            with_credentials,
            response_hint: ResponseHint::Blob,
            body,
        })
    }
}

/// What a transport observed on successful completion.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub status_text: String,
    /// Raw `name: value` lines separated by CRLF.
    pub headers: String,
    pub body: Option<BodyInit>,
    /// Final URL after redirects, when the transport knows it.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub loaded: u64,
    /// Zero when the total size is unknown.
    pub total: u64,
}

impl ProgressEvent {
    pub fn new(loaded: u64, total: u64) -> Self {
        Self { loaded, total }
    }

    /// Completion in `[0, 1]`. An unknown total reports `0`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else if self.loaded < self.total {
            self.loaded as f64 / self.total as f64
        } else {
            1.0
        }
    }
}

/// Callback receiving each progress event and its fraction.
pub type ProgressFn = Arc<dyn Fn(&ProgressEvent, f64) + Send + Sync>;

/// Terminal outcomes a transport can report.
pub(crate) enum Outcome {
    Load(RawResponse),
    Failed(Error),
}

pub(crate) trait EventSink: Send + Sync {
    fn progress(&self, id: u64, event: ProgressEvent, on_progress: Option<&ProgressFn>);

    fn settle(&self, id: u64, outcome: Outcome);
}

/// Callbacks for one exchange.
///
/// Terminal methods consume the value so each can fire at most once. Events
/// for a request the session has already moved on from are ignored.
pub struct TransportEvents {
    sink: Weak<dyn EventSink>,
    id: u64,
    on_progress: Option<ProgressFn>,
}

impl TransportEvents {
    pub(crate) fn new(sink: Weak<dyn EventSink>, id: u64, on_progress: Option<ProgressFn>) -> Self {
        Self {
            sink,
            id,
            on_progress,
        }
    }

    pub fn progress(&self, loaded: u64, total: u64) {
        if let Some(sink) = self.sink.upgrade() {
            sink.progress(
                self.id,
                ProgressEvent::new(loaded, total),
                self.on_progress.as_ref(),
            );
        }
    }

    pub fn load(self, response: RawResponse) {
        self.settle(Outcome::Load(response));
    }

    /// The exchange failed at the network level.
    pub fn error(self) {
        self.settle(Outcome::Failed(Error::Network));
    }

    pub fn timeout(self) {
        self.settle(Outcome::Failed(Error::Timeout));
    }

    /// The transport gave up on its own, outside of [`TransportHandle::abort`].
    pub fn abort(self) {
        self.settle(Outcome::Failed(Error::Abort));
    }

    fn settle(self, outcome: Outcome) {
        if let Some(sink) = self.sink.upgrade() {
            sink.settle(self.id, outcome);
        }
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("id", &self.id)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}
