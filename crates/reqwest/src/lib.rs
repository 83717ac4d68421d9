mod metered;

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use fetch_session::{
    http, Blob, BodyInit, Dispatch, FormData, FormValue, RawResponse, ResponseHint, Transport,
    TransportEvents, TransportHandle,
};
use futures::{Stream, TryStreamExt};
use reqwest::{header::CONTENT_TYPE, multipart, Client, Method, RequestBuilder};
use tokio::{runtime::Handle, task::AbortHandle};
use tracing::{debug, error, info, warn};

use crate::metered::Metered;

/// A [`Transport`] backed by a [`reqwest::Client`].
///
/// Each exchange runs as a tokio task. Without an explicit runtime the task
/// is spawned on the runtime current when the request is sent.
pub struct ReqwestTransport {
    client: Client,
    runtime: Option<Handle>,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        debug!("Creating default ReqwestTransport");
        Self {
            client: Client::new(),
            runtime: None,
        }
    }
}

impl From<Client> for ReqwestTransport {
    fn from(client: Client) -> Self {
        debug!("Creating ReqwestTransport from Client");
        Self {
            client,
            runtime: None,
        }
    }
}

impl ReqwestTransport {
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

impl Transport for ReqwestTransport {
    fn open(&self, method: &str, url: &str) -> Arc<dyn TransportHandle> {
        debug!("Opening {} {}", method, url);
        Arc::new(ReqwestHandle {
            client: self.client.clone(),
            runtime: self.runtime.clone(),
            method: method.to_string(),
            url: url.to_string(),
            task: Mutex::new(None),
        })
    }
}

struct ReqwestHandle {
    client: Client,
    runtime: Option<Handle>,
    method: String,
    url: String,
    task: Mutex<Option<AbortHandle>>,
}

impl TransportHandle for ReqwestHandle {
    fn send(&self, dispatch: Dispatch, events: TransportEvents) {
        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            error!("No tokio runtime to send {} {} on", self.method, self.url);
            std::thread::spawn(move || events.error());
            return;
        };

        let task = runtime.spawn(exchange(
            self.client.clone(),
            self.method.clone(),
            self.url.clone(),
            dispatch,
            events,
        ));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());
    }

    fn abort(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            debug!("Aborting {} {}", self.method, self.url);
            task.abort();
        }
    }
}

async fn exchange(
    client: Client,
    method: String,
    url: String,
    dispatch: Dispatch,
    events: TransportEvents,
) {
    let hint = dispatch.response_hint;
    let request = match build(&client, &method, &url, dispatch).await {
        Ok(request) => request,
        Err(e) => {
            error!("Failed to build request for {} {}: {:#}", method, url, e);
            events.error();
            return;
        }
    };

    match execute(request, hint, &events).await {
        Ok(response) => events.load(response),
        Err(e) if e.is_timeout() => {
            warn!("Request to {} timed out", url);
            events.timeout();
        }
        Err(e) => {
            error!("Request to {} failed: {}", url, e);
            events.error();
        }
    }
}

async fn build(
    client: &Client,
    method: &str,
    url: &str,
    dispatch: Dispatch,
) -> Result<RequestBuilder> {
    let method = Method::from_bytes(method.as_bytes())
        .with_context(|| format!("invalid method {method:?}"))?;
    let headers = http::HeaderMap::try_from(&dispatch.headers).context("invalid request headers")?;

    let mut builder = client.request(method, url).headers(headers);
    if let Some(timeout) = dispatch.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(with_credentials) = dispatch.with_credentials {
        debug!(
            "Ignoring credentials flag ({}) for {}; cookies follow the client configuration",
            with_credentials, url
        );
    }

    let builder = match dispatch.body {
        None => builder,
        Some(BodyInit::Text(text)) => builder.body(text),
        Some(BodyInit::Bytes(bytes)) => builder.body(bytes),
        Some(BodyInit::SearchParams(params)) => builder.body(params.to_string()),
        Some(BodyInit::Blob(blob)) => builder.body(reqwest::Body::wrap_stream(blob_stream(blob))),
        Some(BodyInit::Form(form)) => builder.multipart(to_multipart(form).await?),
        Some(BodyInit::Structured(_)) => {
            return Err(anyhow!("structured bodies must be encoded before sending"))
        }
    };
    Ok(builder)
}

fn blob_stream(blob: Blob) -> impl Stream<Item = std::io::Result<Vec<u8>>> + Send + 'static {
    async_stream::stream! {
        debug!("Streaming blob body ({:?} bytes)", blob.size());
        yield blob.read_bytes().await;
    }
}

async fn to_multipart(form: FormData) -> Result<multipart::Form> {
    let mut multipart = multipart::Form::new();
    for (name, value) in form.entries() {
        multipart = match value {
            FormValue::Text(text) => multipart.text(name.clone(), text.clone()),
            FormValue::Blob(blob) => {
                let mut part = multipart::Part::bytes(blob.read_bytes().await?).file_name("blob");
                if let Some(media_type) = blob.media_type() {
                    part = part.mime_str(media_type)?;
                }
                multipart.part(name.clone(), part)
            }
        };
    }
    Ok(multipart)
}

async fn execute(
    request: RequestBuilder,
    hint: ResponseHint,
    events: &TransportEvents,
) -> reqwest::Result<RawResponse> {
    let response = request.send().await?;
    let status = response.status();
    info!("Request to {} returned status: {}", response.url(), status);

    let headers = header_block(response.headers());
    let url = response.url().to_string();
    let media_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let total = response.content_length().unwrap_or(0);

    let bytes = Metered::new(response.bytes_stream(), events, total)
        .try_fold(Vec::new(), |mut body, chunk| async move {
            body.extend_from_slice(&chunk);
            Ok(body)
        })
        .await?;
    debug!("Read {} byte response body", bytes.len());

    let body = match hint {
        ResponseHint::Blob => BodyInit::Blob(Blob::new(bytes, media_type.as_deref())),
        ResponseHint::Text => BodyInit::Text(String::from_utf8_lossy(&bytes).into_owned()),
    };
    Ok(RawResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        body: Some(body),
        url: Some(url),
    })
}

/// CRLF-separated `name: value` lines.
fn header_block(headers: &http::HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| {
            format!("{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()))
        })
        .collect()
}
