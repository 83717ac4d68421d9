mod blob;
mod body;
mod body_ext;
mod error;
mod headers;
mod query_string;
mod request;
mod response;
mod session;
mod transport;

pub use http;
pub use serde_json::Value;

pub use crate::{
    blob::{Blob, BlobSource},
    body::{BodyInit, BodyPayload, FormData, FormValue},
    body_ext::Body,
    error::{Error, ErrorKind, Result},
    headers::{lazy, HeaderMap, IntoHeaderValue, Lazy},
    query_string::{to_form_data, to_query_string, SearchParams, JSON_FIELDS_MARKER},
    request::{Credentials, Request, RequestInit},
    response::{Response, ResponseInit, ResponseType},
    session::{Input, PendingQuery, QueryInit, Session, SessionBuilder, SessionState},
    transport::{
        Dispatch, ProgressEvent, ProgressFn, RawResponse, ResponseHint, Transport,
        TransportEvents, TransportHandle,
    },
};
