use std::{
    pin::Pin,
    task::{Context, Poll},
};

use fetch_session::TransportEvents;
use futures::Stream;
use pin_project_lite::pin_project;
use reqwest::Result;

pin_project! {
    /// Reports download progress for each chunk pulled through it.
    pub(crate) struct Metered<'a, S> {
        #[pin]
        inner: S,
        events: &'a TransportEvents,
        loaded: u64,
        total: u64,
    }
}

impl<'a, S> Metered<'a, S> {
    /// `total` is zero when the length is unknown.
    pub(crate) fn new(inner: S, events: &'a TransportEvents, total: u64) -> Self {
        Self {
            inner,
            events,
            loaded: 0,
            total,
        }
    }
}

impl<S, B> Stream for Metered<'_, S>
where
    S: Stream<Item = Result<B>>,
    B: AsRef<[u8]>,
{
    type Item = Result<B>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &polled {
            *this.loaded += chunk.as_ref().len() as u64;
            this.events.progress(*this.loaded, *this.total);
        }
        polled
    }
}
