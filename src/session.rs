//! Request orchestration with a single in-flight slot.
//!
//! A [`Session`] owns at most one live transport handle. [`Session::query`]
//! cancels whatever is in flight and replaces it; [`Session::query_wait`]
//! queues behind it instead. Waiters are released one per terminal
//! transition, in submission order, and always from a later poll rather
//! than from inside the transition itself.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use futures::{
    channel::oneshot,
    future::{BoxFuture, FutureExt},
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    body::BodyInit,
    body_ext::Body,
    error::{Error, Result},
    headers::HeaderMap,
    request::{Credentials, Request, RequestInit},
    response::Response,
    transport::{
        Dispatch, EventSink, Outcome, ProgressEvent, ProgressFn, RawResponse, Transport,
        TransportEvents, TransportHandle,
    },
};

/// Result of a query: the parsed JSON body, after the completion hook.
pub type PendingQuery = BoxFuture<'static, Result<Value>>;

type UrlHook = Arc<dyn Fn(&str) -> String + Send + Sync>;
type JsonHook = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    InFlight,
    Success,
    Failure,
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Opening => "open",
            SessionState::InFlight => "progress",
            SessionState::Success => "success",
            SessionState::Failure => "failure",
            SessionState::Aborted => "abort",
        }
    }

    /// Only an in-flight request blocks admission.
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionState::InFlight)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options for [`Session::query`].
#[derive(Clone, Default)]
pub struct QueryInit {
    url: Option<String>,
    request: RequestInit,
    raw: Option<bool>,
    progress: Option<ProgressFn>,
}

impl QueryInit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only used when the query input is itself a `QueryInit`.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.request = self.request.method(method);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.request = self.request.headers(headers);
        self
    }

    pub fn body(mut self, body: impl Into<BodyInit>) -> Self {
        self.request = self.request.body(body);
        self
    }

    pub fn json<S: Serialize>(mut self, payload: &S) -> Result<Self> {
        self.request = self.request.json(payload)?;
        Ok(self)
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.request = self.request.credentials(credentials);
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.request = self.request.mode(mode);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request = self.request.timeout(timeout);
        self
    }

    /// Skip the url-rewrite and completion hooks.
    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(&ProgressEvent, f64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Fields set on `other` win.
    fn merge(self, other: QueryInit) -> Self {
        Self {
            url: other.url.or(self.url),
            request: self.request.merge(other.request),
            raw: other.raw.or(self.raw),
            progress: other.progress.or(self.progress),
        }
    }

    fn is_raw(&self) -> bool {
        self.raw == Some(true)
    }
}

impl fmt::Debug for QueryInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryInit")
            .field("url", &self.url)
            .field("request", &self.request)
            .field("raw", &self.raw)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// What to query.
#[derive(Debug)]
pub enum Input {
    /// A URL, passed through the url-rewrite hook unless the call is raw.
    Url(String),

    /// Options merged over the call's `init`; the URL comes from its `url`.
    Descriptor(QueryInit),

    /// An existing request, re-dispatched as a copy.
    Request(Request),
}

impl From<&str> for Input {
    fn from(url: &str) -> Self {
        Input::Url(url.to_string())
    }
}

impl From<String> for Input {
    fn from(url: String) -> Self {
        Input::Url(url)
    }
}

impl From<QueryInit> for Input {
    fn from(init: QueryInit) -> Self {
        Input::Descriptor(init)
    }
}

impl From<Request> for Input {
    fn from(request: Request) -> Self {
        Input::Request(request)
    }
}

#[derive(Clone)]
struct Hooks {
    on_url: UrlHook,
    on_json: JsonHook,
    on_progress: ProgressFn,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            on_url: Arc::new(|url: &str| url.to_string()),
            on_json: Arc::new(|value: Value| -> anyhow::Result<Value> { Ok(value) }),
            on_progress: Arc::new(|_: &ProgressEvent, _: f64| {}),
        }
    }
}

struct Active {
    id: u64,
    handle: Arc<dyn TransportHandle>,
    /// Taken once the transport reports its terminal event.
    settle: Option<oneshot::Sender<Result<RawResponse>>>,
}

impl Active {
    fn reject(&mut self, err: Error) {
        if let Some(settle) = self.settle.take() {
            let _ = settle.send(Err(err));
        }
    }
}

struct Inner {
    state: SessionState,
    active: Option<Active>,
    waiting: VecDeque<oneshot::Sender<()>>,
    progress: f64,
    next_id: u64,
    hooks: Hooks,
}

impl Inner {
    fn is_active(&self, id: u64) -> bool {
        self.state == SessionState::InFlight
            && self.active.as_ref().is_some_and(|active| active.id == id)
    }

    /// Leave the in-flight phase, releasing the active request.
    fn finish(&mut self, state: SessionState) -> Option<Active> {
        self.state = state;
        self.progress = 1.0;
        self.active.take()
    }

    /// Release the oldest waiter still listening.
    fn drain(&mut self) {
        while let Some(waiter) = self.waiting.pop_front() {
            if waiter.send(()).is_ok() {
                debug!("Released a waiting query, {} still queued", self.waiting.len());
                break;
            }
        }
    }
}

struct Shared {
    transport: Box<dyn Transport>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a waiter if busy. `front` puts it ahead of everyone else.
    fn wait_turn(self: &Arc<Self>, front: bool) -> Option<Turn> {
        let mut inner = self.lock();
        if !inner.state.is_busy() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        if front {
            inner.waiting.push_front(tx);
        } else {
            inner.waiting.push_back(tx);
        }
        debug!("Query queued, {} waiting", inner.waiting.len());
        Some(Turn {
            shared: Arc::clone(self),
            signal: rx,
        })
    }

    /// Pass the turn on unless a request is already in flight.
    fn release_next(&self) {
        let mut inner = self.lock();
        if !inner.state.is_busy() {
            inner.drain();
        }
    }

    /// Settle a request whose body has been read.
    fn complete(&self, id: u64, parsed: Result<Value>, raw: bool) -> Result<Value> {
        let on_json = {
            let mut inner = self.lock();
            if !inner.is_active(id) {
                debug!("Request {} finished after being replaced", id);
                return Err(Error::Abort);
            }
            let state = if parsed.is_ok() {
                SessionState::Success
            } else {
                SessionState::Failure
            };
            inner.finish(state);
            inner.drain();
            inner.hooks.on_json.clone()
        };

        let value = parsed.map_err(|err| {
            warn!("Request {} returned an unusable body: {}", id, err);
            Error::Json
        })?;
        if raw {
            return Ok(value);
        }
        on_json(value).map_err(Error::Hook)
    }

    /// Abandon a request whose pending result was dropped.
    fn forfeit(&self, id: u64) {
        let active = {
            let mut inner = self.lock();
            if !inner.is_active(id) {
                return;
            }
            let active = inner.finish(SessionState::Aborted);
            inner.drain();
            active
        };
        if let Some(active) = active {
            debug!("Pending result for request {} dropped, aborting", id);
            active.handle.abort();
        }
    }
}

impl EventSink for Shared {
    fn progress(&self, id: u64, event: ProgressEvent, on_progress: Option<&ProgressFn>) {
        let fraction = event.fraction();
        let hook = {
            let mut inner = self.lock();
            if !inner.is_active(id) {
                return;
            }
            inner.progress = fraction;
            inner.hooks.on_progress.clone()
        };
        hook(&event, fraction);
        if let Some(on_progress) = on_progress {
            on_progress(&event, fraction);
        }
    }

    fn settle(&self, id: u64, outcome: Outcome) {
        let mut inner = self.lock();
        if !inner.is_active(id) {
            debug!("Ignoring transport event for stale request {}", id);
            return;
        }
        match outcome {
            Outcome::Load(response) => {
                info!("Request {} completed with status {}", id, response.status);
                if let Some(settle) = inner.active.as_mut().and_then(|a| a.settle.take()) {
                    let _ = settle.send(Ok(response));
                }
            }
            Outcome::Failed(err) => {
                let state = match err {
                    Error::Abort => SessionState::Aborted,
                    _ => SessionState::Failure,
                };
                let active = inner.finish(state);
                inner.drain();
                drop(inner);
                warn!("Request {} failed: {}", id, err);
                if let Some(mut active) = active {
                    active.reject(err);
                }
            }
        }
    }
}

/// Aborts the request if the pending result is dropped before it settles.
struct Forfeit {
    shared: Arc<Shared>,
    id: u64,
    armed: bool,
}

impl Drop for Forfeit {
    fn drop(&mut self) {
        if self.armed {
            self.shared.forfeit(self.id);
        }
    }
}

/// A queued query's place in line.
///
/// A waiter dropped after being released but before it ran hands the turn
/// to the next one in line.
struct Turn {
    shared: Arc<Shared>,
    signal: oneshot::Receiver<()>,
}

impl Drop for Turn {
    fn drop(&mut self) {
        if let Ok(Some(())) = self.signal.try_recv() {
            debug!("Released query dropped before running");
            self.shared.release_next();
        }
    }
}

async fn settle_query(
    mut guard: Forfeit,
    outcome: oneshot::Receiver<Result<RawResponse>>,
    raw: bool,
) -> Result<Value> {
    let response = match outcome.await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            guard.armed = false;
            return Err(err);
        }
        Err(oneshot::Canceled) => {
            guard.armed = false;
            return Err(Error::Abort);
        }
    };

    let parsed = match Response::from_raw(response) {
        Ok(response) => response.json::<Value>().await,
        Err(err) => Err(err),
    };
    guard.armed = false;
    guard.shared.complete(guard.id, parsed, raw)
}

async fn wait_then_query(
    session: Session,
    mut turn: Turn,
    input: Input,
    init: QueryInit,
) -> Result<Value> {
    loop {
        (&mut turn.signal).await.map_err(|_| Error::Abort)?;
        // Someone may have started a request between release and this poll.
        match session.shared.wait_turn(true) {
            Some(next) => turn = next,
            None => break,
        }
    }
    session.query(input, init)?.await
}

/// Configures the hooks a [`Session`] starts with.
pub struct SessionBuilder {
    transport: Box<dyn Transport>,
    hooks: Hooks,
}

impl SessionBuilder {
    /// Rewrite plain URLs before a request is built.
    pub fn on_url<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.hooks.on_url = Arc::new(hook);
        self
    }

    /// Post-process every parsed body. An error rejects the query.
    pub fn on_json<F>(mut self, hook: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.hooks.on_json = Arc::new(hook);
        self
    }

    /// Observe progress of every request.
    pub fn on_progress<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ProgressEvent, f64) + Send + Sync + 'static,
    {
        self.hooks.on_progress = Arc::new(hook);
        self
    }

    pub fn build(self) -> Session {
        debug!("Creating session");
        Session {
            shared: Arc::new(Shared {
                transport: self.transport,
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    active: None,
                    waiting: VecDeque::new(),
                    progress: 1.0,
                    next_id: 0,
                    hooks: self.hooks,
                }),
            }),
        }
    }
}

/// Orchestrates JSON queries over a [`Transport`], one at a time.
///
/// Create one per application and share it; clones refer to the same
/// session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::builder(transport).build()
    }

    pub fn builder(transport: impl Transport + 'static) -> SessionBuilder {
        SessionBuilder {
            transport: Box::new(transport),
            hooks: Hooks::default(),
        }
    }

    pub fn set_on_url<F>(&self, hook: F)
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.shared.lock().hooks.on_url = Arc::new(hook);
    }

    pub fn set_on_json<F>(&self, hook: F)
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.shared.lock().hooks.on_json = Arc::new(hook);
    }

    pub fn set_on_progress<F>(&self, hook: F)
    where
        F: Fn(&ProgressEvent, f64) + Send + Sync + 'static,
    {
        self.shared.lock().hooks.on_progress = Arc::new(hook);
    }

    pub fn status(&self) -> SessionState {
        self.shared.lock().state
    }

    /// True unless a request is in flight.
    pub fn completed(&self) -> bool {
        !self.status().is_busy()
    }

    /// Last reported fraction: `0` when a request starts, `1` once it ends.
    pub fn progress(&self) -> f64 {
        self.shared.lock().progress
    }

    /// Abort the in-flight request, if any. Its pending result rejects with
    /// [`Error::Abort`]; queued waiters are kept.
    pub fn abort(&self) -> &Self {
        let active = {
            let mut inner = self.shared.lock();
            if !inner.state.is_busy() {
                return self;
            }
            let active = inner.finish(SessionState::Aborted);
            inner.drain();
            active
        };
        if let Some(mut active) = active {
            info!("Aborting request {}", active.id);
            active.reject(Error::Abort);
            active.handle.abort();
        }
        self
    }

    /// Start a query, cancelling any request already in flight.
    ///
    /// The cancelled request's result is rejected with [`Error::Abort`]
    /// before the new one is opened. Construction errors are returned here
    /// and let the next waiting query run; everything after dispatch
    /// arrives through the pending result.
    pub fn query(&self, input: impl Into<Input>, init: QueryInit) -> Result<PendingQuery> {
        self.cancel_in_flight();
        let started = self
            .prepare(input.into(), init)
            .and_then(|(request, init)| self.dispatch(request, init));
        if let Err(err) = &started {
            warn!("Query rejected before dispatch: {}", err);
            self.shared.release_next();
        }
        started
    }

    /// Like [`query`](Self::query), but waits for the in-flight request to
    /// finish instead of cancelling it. Waiting queries run one at a time in
    /// the order they were made.
    pub fn query_wait(&self, input: impl Into<Input>, init: QueryInit) -> Result<PendingQuery> {
        match self.shared.wait_turn(false) {
            None => self.query(input, init),
            Some(turn) => Ok(wait_then_query(self.clone(), turn, input.into(), init).boxed()),
        }
    }

    fn cancel_in_flight(&self) {
        let active = {
            let mut inner = self.shared.lock();
            if !inner.state.is_busy() {
                return;
            }
            inner.finish(SessionState::Aborted)
        };
        if let Some(mut active) = active {
            info!("Replacing in-flight request {}", active.id);
            active.reject(Error::Abort);
            active.handle.abort();
        }
    }

    fn prepare(&self, input: Input, init: QueryInit) -> Result<(Request, QueryInit)> {
        let (url, init) = match input {
            Input::Request(source) => {
                let request = Request::from_request(&source, init.request.clone())?;
                return Ok((request, init));
            }
            Input::Url(url) => (url, init),
            Input::Descriptor(descriptor) => {
                let init = init.merge(descriptor);
                (init.url.clone().unwrap_or_default(), init)
            }
        };

        let url = if init.is_raw() {
            url
        } else {
            let on_url = self.shared.lock().hooks.on_url.clone();
            on_url(&url)
        };
        let request = Request::new(url, init.request.clone())?;
        Ok((request, init))
    }

    fn dispatch(&self, request: Request, init: QueryInit) -> Result<PendingQuery> {
        let dispatch = Dispatch::from_request(&request)?;

        self.shared.lock().state = SessionState::Opening;
        let handle = self
            .shared
            .transport
            .open(request.method(), request.url());

        let (settle_tx, settle_rx) = oneshot::channel();
        let id = {
            let mut inner = self.shared.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.progress = 0.0;
            inner.state = SessionState::InFlight;
            inner.active = Some(Active {
                id,
                handle: Arc::clone(&handle),
                settle: Some(settle_tx),
            });
            id
        };

        info!("Sending {} {} (request {})", request.method(), request.url(), id);
        let sink: Weak<dyn EventSink> = Arc::downgrade(&self.shared) as Weak<dyn EventSink>;
        handle.send(dispatch, TransportEvents::new(sink, id, init.progress.clone()));

        let guard = Forfeit {
            shared: Arc::clone(&self.shared),
            id,
            armed: true,
        };
        Ok(settle_query(guard, settle_rx, init.is_raw()).boxed())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Session")
            .field("state", &inner.state)
            .field("progress", &inner.progress)
            .field("waiting", &inner.waiting.len())
            .finish()
    }
}
