use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::{blob::Blob, body::BodyPayload, error::Result};

/// Body reading shared by [`Request`](crate::Request) and
/// [`Response`](crate::Response).
///
/// Implementors only expose their [`BodyPayload`]; every reader delegates to
/// it, so the one-shot rule holds no matter which method is used.
pub trait Body {
    fn payload(&self) -> &BodyPayload;

    fn body_used(&self) -> bool {
        self.payload().is_used()
    }

    fn text(&self) -> BoxFuture<'static, Result<String>> {
        self.payload().text()
    }

    fn bytes(&self) -> BoxFuture<'static, Result<Vec<u8>>> {
        self.payload().bytes()
    }

    fn blob(&self) -> BoxFuture<'static, Result<Blob>> {
        self.payload().blob()
    }

    fn json<D>(&self) -> BoxFuture<'static, Result<D>>
    where
        D: DeserializeOwned + Send + 'static,
    {
        self.payload().json()
    }
}
