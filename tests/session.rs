//! Drives a `Session` through a scripted transport.
//!
//! The transport records every opened handle and holds on to its events so
//! each test decides when and how a request finishes. Futures are polled by
//! hand with a no-op waker, which keeps the ordering fully deterministic.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use fetch_session::{
    Blob, BodyInit, Dispatch, Error, ErrorKind, FormValue, PendingQuery, QueryInit, RawResponse,
    Request, RequestInit, Session, SessionState, Transport, TransportEvents, TransportHandle,
    Value,
};
use futures::{task::noop_waker_ref, FutureExt};
use serde_json::json;

#[derive(Default)]
struct ScriptedTransport {
    opened: Mutex<Vec<Arc<ScriptedHandle>>>,
}

impl ScriptedTransport {
    fn handle(&self, index: usize) -> Arc<ScriptedHandle> {
        Arc::clone(&self.opened.lock().unwrap()[index])
    }

    fn count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    fn urls(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .map(|handle| handle.url.clone())
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, method: &str, url: &str) -> Arc<dyn TransportHandle> {
        let handle = Arc::new(ScriptedHandle {
            method: method.to_string(),
            url: url.to_string(),
            dispatch: Mutex::new(None),
            events: Mutex::new(None),
            aborted: AtomicBool::new(false),
        });
        self.opened.lock().unwrap().push(Arc::clone(&handle));
        handle
    }
}

struct ScriptedHandle {
    method: String,
    url: String,
    dispatch: Mutex<Option<Dispatch>>,
    events: Mutex<Option<TransportEvents>>,
    aborted: AtomicBool,
}

impl TransportHandle for ScriptedHandle {
    fn send(&self, dispatch: Dispatch, events: TransportEvents) {
        *self.dispatch.lock().unwrap() = Some(dispatch);
        *self.events.lock().unwrap() = Some(events);
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

impl ScriptedHandle {
    fn dispatch(&self) -> Dispatch {
        self.dispatch.lock().unwrap().clone().unwrap()
    }

    fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> TransportEvents {
        self.events.lock().unwrap().take().unwrap()
    }

    fn progress(&self, loaded: u64, total: u64) {
        self.events
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .progress(loaded, total);
    }

    fn respond(&self, body: &str) {
        self.take_events().load(RawResponse {
            status: 200,
            status_text: "OK".to_string(),
            headers: "Content-Type: application/json\r\n".to_string(),
            body: Some(Blob::new(body, Some("application/json")).into()),
            url: Some(self.url.clone()),
        });
    }
}

fn setup() -> (Session, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::default());
    (Session::new(Arc::clone(&transport)), transport)
}

fn poll(pending: &mut PendingQuery) -> Poll<Result<Value, Error>> {
    pending.poll_unpin(&mut Context::from_waker(noop_waker_ref()))
}

fn rejected(started: Result<PendingQuery, Error>) -> Error {
    match started {
        Ok(_) => panic!("query was dispatched"),
        Err(err) => err,
    }
}

fn ready(pending: &mut PendingQuery) -> Result<Value, Error> {
    match poll(pending) {
        Poll::Ready(result) => result,
        Poll::Pending => panic!("query still pending"),
    }
}

#[test]
fn successful_query_resolves_json() {
    let (session, transport) = setup();
    assert_eq!(session.status(), SessionState::Idle);
    assert_eq!(session.progress(), 1.0);

    let mut pending = session.query("http://x/a", QueryInit::new()).unwrap();
    assert_eq!(session.status(), SessionState::InFlight);
    assert!(!session.completed());
    assert_eq!(session.progress(), 0.0);
    assert!(poll(&mut pending).is_pending());

    let handle = transport.handle(0);
    assert_eq!(handle.method, "GET");
    assert_eq!(handle.url, "http://x/a");
    assert_eq!(handle.dispatch().with_credentials, Some(false));

    handle.respond(r#"{"a":1}"#);
    assert_eq!(ready(&mut pending).unwrap(), json!({"a": 1}));
    assert_eq!(session.status(), SessionState::Success);
    assert!(session.completed());
    assert_eq!(session.progress(), 1.0);
}

#[test]
fn invalid_json_rejects_with_json_error() {
    let (session, transport) = setup();
    let mut pending = session.query("/bad", QueryInit::new()).unwrap();
    transport.handle(0).respond("not json");

    let err = ready(&mut pending).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Json);
    assert_eq!(err.code(), 100);
    assert_eq!(session.status(), SessionState::Failure);
}

#[test]
fn transport_failures_are_tagged() {
    let (session, transport) = setup();

    let mut pending = session.query("/net", QueryInit::new()).unwrap();
    transport.handle(0).take_events().error();
    assert_eq!(ready(&mut pending).unwrap_err().kind(), ErrorKind::Network);
    assert_eq!(session.status(), SessionState::Failure);

    let mut pending = session.query("/slow", QueryInit::new()).unwrap();
    transport.handle(1).take_events().timeout();
    assert_eq!(ready(&mut pending).unwrap_err().kind(), ErrorKind::Timeout);

    let mut pending = session.query("/gone", QueryInit::new()).unwrap();
    transport.handle(2).take_events().abort();
    assert_eq!(ready(&mut pending).unwrap_err().kind(), ErrorKind::Abort);
    assert_eq!(session.status(), SessionState::Aborted);
}

#[test]
fn query_cancels_and_replaces_in_flight_request() {
    let (session, transport) = setup();
    let mut first = session.query("/first", QueryInit::new()).unwrap();
    let first_handle = transport.handle(0);
    let stale = first_handle.take_events();

    let mut second = session.query("/second", QueryInit::new()).unwrap();
    assert!(first_handle.was_aborted());
    assert!(matches!(ready(&mut first), Err(Error::Abort)));
    assert_eq!(session.status(), SessionState::InFlight);

    // A late event for the replaced request changes nothing.
    stale.load(RawResponse {
        status: 200,
        body: Some("{}".into()),
        ..RawResponse::default()
    });
    assert_eq!(session.status(), SessionState::InFlight);
    assert!(poll(&mut second).is_pending());

    transport.handle(1).respond("[1,2]");
    assert_eq!(ready(&mut second).unwrap(), json!([1, 2]));
}

#[test]
fn replacing_during_body_read_still_rejects_prior() {
    let (session, transport) = setup();
    let mut first = session.query("/first", QueryInit::new()).unwrap();
    transport.handle(0).respond("{}");

    // The load event is in, but the prior result has not been polled yet.
    let mut second = session.query("/second", QueryInit::new()).unwrap();
    assert!(matches!(ready(&mut first), Err(Error::Abort)));
    assert_eq!(session.status(), SessionState::InFlight);

    transport.handle(1).respond("true");
    assert_eq!(ready(&mut second).unwrap(), json!(true));
}

#[test]
fn waiting_queries_run_in_order_without_cancelling() {
    let (session, transport) = setup();
    let mut active = session.query("/a", QueryInit::new()).unwrap();
    let mut first = session.query_wait("/b", QueryInit::new()).unwrap();
    let mut second = session.query_wait("/c", QueryInit::new()).unwrap();

    assert!(poll(&mut first).is_pending());
    assert!(poll(&mut second).is_pending());
    assert_eq!(transport.count(), 1);
    assert!(!transport.handle(0).was_aborted());

    transport.handle(0).respond(r#""a""#);
    assert_eq!(ready(&mut active).unwrap(), json!("a"));

    // Only the first waiter is released.
    assert!(poll(&mut second).is_pending());
    assert!(poll(&mut first).is_pending());
    assert_eq!(transport.urls(), vec!["/a", "/b"]);
    assert!(poll(&mut second).is_pending());
    assert_eq!(transport.count(), 2);

    transport.handle(1).respond(r#""b""#);
    assert_eq!(ready(&mut first).unwrap(), json!("b"));

    assert!(poll(&mut second).is_pending());
    assert_eq!(transport.urls(), vec!["/a", "/b", "/c"]);
    transport.handle(2).respond(r#""c""#);
    assert_eq!(ready(&mut second).unwrap(), json!("c"));

    assert!(transport.opened.lock().unwrap().iter().all(|h| !h.was_aborted()));
}

#[test]
fn failed_replacement_releases_the_next_waiter() {
    let (session, transport) = setup();
    let mut active = session.query("/a", QueryInit::new()).unwrap();
    let mut waiting = session.query_wait("/b", QueryInit::new()).unwrap();
    assert!(poll(&mut waiting).is_pending());

    let err = rejected(session.query("/h", QueryInit::new().method("HEAD").body("x")));
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert!(transport.handle(0).was_aborted());
    assert!(matches!(ready(&mut active), Err(Error::Abort)));
    assert_eq!(session.status(), SessionState::Aborted);

    assert!(poll(&mut waiting).is_pending());
    assert_eq!(transport.urls(), vec!["/a", "/b"]);
    transport.handle(1).respond(r#""b""#);
    assert_eq!(ready(&mut waiting).unwrap(), json!("b"));
}

#[test]
fn dropped_waiter_passes_its_turn_on() {
    let (session, transport) = setup();
    let mut active = session.query("/a", QueryInit::new()).unwrap();
    let mut first = session.query_wait("/b", QueryInit::new()).unwrap();
    let mut second = session.query_wait("/c", QueryInit::new()).unwrap();
    assert!(poll(&mut first).is_pending());
    assert!(poll(&mut second).is_pending());

    transport.handle(0).respond("1");
    assert_eq!(ready(&mut active).unwrap(), json!(1));

    // Released, but dropped before it ever ran.
    drop(first);
    assert!(poll(&mut second).is_pending());
    assert_eq!(transport.urls(), vec!["/a", "/c"]);
    transport.handle(1).respond("2");
    assert_eq!(ready(&mut second).unwrap(), json!(2));
}

#[test]
fn dropped_queued_waiter_is_skipped() {
    let (session, transport) = setup();
    let mut active = session.query("/a", QueryInit::new()).unwrap();
    let first = session.query_wait("/b", QueryInit::new()).unwrap();
    let mut second = session.query_wait("/c", QueryInit::new()).unwrap();
    drop(first);

    transport.handle(0).respond("1");
    ready(&mut active).unwrap();
    assert!(poll(&mut second).is_pending());
    assert_eq!(transport.urls(), vec!["/a", "/c"]);
}

#[test]
fn query_wait_after_load_waits_for_the_body() {
    let (session, transport) = setup();
    let mut active = session.query("/a", QueryInit::new()).unwrap();
    transport.handle(0).respond(r#"{"a":1}"#);

    // The response is in but not yet parsed: still busy.
    assert_eq!(session.status(), SessionState::InFlight);
    let mut waiting = session.query_wait("/b", QueryInit::new()).unwrap();
    assert!(poll(&mut waiting).is_pending());
    assert_eq!(transport.count(), 1);

    assert_eq!(ready(&mut active).unwrap(), json!({"a": 1}));
    assert!(poll(&mut waiting).is_pending());
    assert_eq!(transport.urls(), vec!["/a", "/b"]);
    transport.handle(1).respond("null");
    assert_eq!(ready(&mut waiting).unwrap(), Value::Null);
}

#[test]
fn failing_waiter_releases_the_one_behind_it() {
    let (session, transport) = setup();
    let mut active = session.query("/a", QueryInit::new()).unwrap();
    let mut bad = session
        .query_wait("/h", QueryInit::new().method("HEAD").body("x"))
        .unwrap();
    let mut good = session.query_wait("/c", QueryInit::new()).unwrap();
    assert!(poll(&mut bad).is_pending());
    assert!(poll(&mut good).is_pending());

    transport.handle(0).respond("1");
    ready(&mut active).unwrap();

    assert_eq!(ready(&mut bad).unwrap_err().kind(), ErrorKind::Argument);
    assert!(poll(&mut good).is_pending());
    assert_eq!(transport.urls(), vec!["/a", "/c"]);
}

#[test]
fn query_wait_when_idle_runs_immediately() {
    let (session, transport) = setup();
    let mut pending = session.query_wait("/now", QueryInit::new()).unwrap();
    assert_eq!(transport.count(), 1);
    transport.handle(0).respond("1");
    assert_eq!(ready(&mut pending).unwrap(), json!(1));
}

#[test]
fn abort_rejects_active_and_keeps_waiters() {
    let (session, transport) = setup();
    let mut active = session.query("/a", QueryInit::new()).unwrap();
    let mut waiting = session.query_wait("/b", QueryInit::new()).unwrap();
    assert!(poll(&mut waiting).is_pending());

    session.abort();
    assert!(transport.handle(0).was_aborted());
    assert_eq!(session.status(), SessionState::Aborted);
    assert_eq!(session.progress(), 1.0);
    assert!(matches!(ready(&mut active), Err(Error::Abort)));

    assert!(poll(&mut waiting).is_pending());
    assert_eq!(transport.urls(), vec!["/a", "/b"]);
    transport.handle(1).respond("null");
    assert_eq!(ready(&mut waiting).unwrap(), Value::Null);

    // Nothing in flight: a no-op.
    session.abort();
    assert_eq!(session.status(), SessionState::Success);
}

#[test]
fn dropping_the_result_aborts_the_request() {
    let (session, transport) = setup();
    let pending = session.query("/a", QueryInit::new()).unwrap();
    drop(pending);
    assert!(transport.handle(0).was_aborted());
    assert_eq!(session.status(), SessionState::Aborted);
}

#[test]
fn progress_reaches_hooks_in_range() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let per_call = Arc::new(Mutex::new(Vec::new()));

    let transport = Arc::new(ScriptedTransport::default());
    let hook_seen = Arc::clone(&seen);
    let session = Session::builder(Arc::clone(&transport))
        .on_progress(move |_, fraction| hook_seen.lock().unwrap().push(fraction))
        .build();

    let call_seen = Arc::clone(&per_call);
    let mut pending = session
        .query(
            "/big",
            QueryInit::new().progress(move |event, fraction| {
                call_seen.lock().unwrap().push((event.loaded, fraction))
            }),
        )
        .unwrap();
    let handle = transport.handle(0);

    handle.progress(10, 0);
    assert_eq!(session.progress(), 0.0);
    handle.progress(5, 20);
    assert_eq!(session.progress(), 0.25);
    handle.progress(20, 20);
    handle.respond("{}");
    ready(&mut pending).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![0.0, 0.25, 1.0]);
    assert_eq!(*per_call.lock().unwrap(), vec![(10, 0.0), (5, 0.25), (20, 1.0)]);
    assert_eq!(session.progress(), 1.0);
}

#[test]
fn hooks_rewrite_urls_and_results() {
    let transport = Arc::new(ScriptedTransport::default());
    let session = Session::builder(Arc::clone(&transport))
        .on_url(|url| format!("http://api{url}"))
        .on_json(|value| Ok(value["data"].clone()))
        .build();

    let mut pending = session.query("/users", QueryInit::new()).unwrap();
    assert_eq!(transport.handle(0).url, "http://api/users");
    transport.handle(0).respond(r#"{"data":[1]}"#);
    assert_eq!(ready(&mut pending).unwrap(), json!([1]));

    // Raw calls skip both hooks.
    let mut pending = session
        .query("http://other/x", QueryInit::new().raw(true))
        .unwrap();
    assert_eq!(transport.handle(1).url, "http://other/x");
    transport.handle(1).respond(r#"{"data":2}"#);
    assert_eq!(ready(&mut pending).unwrap(), json!({"data": 2}));

    session.set_on_json(|_| Err(anyhow::anyhow!("rejected by hook")));
    let mut pending = session.query("/x", QueryInit::new()).unwrap();
    transport.handle(2).respond("{}");
    let err = ready(&mut pending).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Hook);
    assert_eq!(session.status(), SessionState::Success);
}

#[test]
fn construction_errors_are_synchronous() {
    let (session, transport) = setup();
    let err = rejected(session.query("/h", QueryInit::new().method("HEAD").body("x")));
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert_eq!(transport.count(), 0);
    assert_eq!(session.status(), SessionState::Idle);
}

#[test]
fn structured_bodies_follow_the_verb() {
    let (session, transport) = setup();

    let init = QueryInit::new().json(&json!({"a": 1, "b": [2, 3]})).unwrap();
    let _get = session.query("http://x/y", init).unwrap();
    let handle = transport.handle(0);
    assert_eq!(handle.url, "http://x/y?a=1&b[]=2&b[]=3");
    assert!(handle.dispatch().body.is_none());

    let init = QueryInit::new()
        .method("POST")
        .json(&json!({"name": "kit", "tags": ["x"]}))
        .unwrap();
    let _post = session.query("http://x/y", init).unwrap();
    let Some(BodyInit::Form(form)) = transport.handle(1).dispatch().body else {
        panic!("expected multipart body");
    };
    assert!(matches!(form.get("__json"), Some(FormValue::Text(v)) if v == r#"["tags"]"#));
}

#[test]
fn descriptor_input_merges_over_init() {
    let (session, transport) = setup();
    let descriptor = QueryInit::new().url("/d").method("put").body("payload");
    let _pending = session
        .query(descriptor, QueryInit::new().timeout(Duration::from_secs(5)))
        .unwrap();

    let handle = transport.handle(0);
    assert_eq!(handle.method, "PUT");
    assert_eq!(handle.url, "/d");
    let dispatch = handle.dispatch();
    assert_eq!(dispatch.timeout, Some(Duration::from_secs(5)));
    assert!(matches!(dispatch.body, Some(BodyInit::Text(ref t)) if t == "payload"));
}

#[test]
fn request_input_is_dispatched_once() {
    let (session, transport) = setup();
    let request = Request::new("/r", RequestInit::new().method("POST").body("once")).unwrap();
    let copy = request.try_clone().unwrap();

    let _pending = session.query(request, QueryInit::new()).unwrap();
    assert_eq!(transport.handle(0).method, "POST");

    futures::executor::block_on(fetch_session::Body::text(&copy)).unwrap();
    let err = rejected(session.query(copy, QueryInit::new()));
    assert_eq!(err.kind(), ErrorKind::AlreadyRead);
}
