use std::{fmt, io, sync::Arc};

use futures::future::{self, BoxFuture, FutureExt};

/// Source of an opaque binary payload whose contents are only available
/// asynchronously.
///
/// Transports that hand back file handles, spooled downloads or
/// platform-specific buffers implement this to let a body read them lazily.
pub trait BlobSource: Send + Sync {
    /// Media type reported for the blob, if any.
    fn media_type(&self) -> Option<&str>;

    fn size(&self) -> Option<u64> {
        None
    }

    fn read_bytes(&self) -> BoxFuture<'static, io::Result<Vec<u8>>>;

    /// Read the blob as text. The default decodes the bytes as UTF-8,
    /// replacing invalid sequences.
    fn read_text(&self) -> BoxFuture<'static, io::Result<String>> {
        self.read_bytes()
            .map(|bytes| bytes.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
            .boxed()
    }
}

/// Cheaply clonable handle to a [`BlobSource`].
#[derive(Clone)]
pub struct Blob(Arc<dyn BlobSource>);

impl Blob {
    /// An in-memory blob.
    pub fn new(bytes: impl Into<Vec<u8>>, media_type: Option<&str>) -> Self {
        Self(Arc::new(MemoryBlob {
            bytes: Arc::from(bytes.into()),
            media_type: media_type.filter(|ty| !ty.is_empty()).map(str::to_string),
        }))
    }

    pub fn from_source(source: impl BlobSource + 'static) -> Self {
        Self(Arc::new(source))
    }

    pub fn media_type(&self) -> Option<&str> {
        self.0.media_type()
    }

    pub fn size(&self) -> Option<u64> {
        self.0.size()
    }

    pub fn read_bytes(&self) -> BoxFuture<'static, io::Result<Vec<u8>>> {
        self.0.read_bytes()
    }

    pub fn read_text(&self) -> BoxFuture<'static, io::Result<String>> {
        self.0.read_text()
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("media_type", &self.media_type())
            .field("size", &self.size())
            .finish()
    }
}

struct MemoryBlob {
    bytes: Arc<[u8]>,
    media_type: Option<String>,
}

impl BlobSource for MemoryBlob {
    fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    fn size(&self) -> Option<u64> {
        Some(self.bytes.len() as u64)
    }

    fn read_bytes(&self) -> BoxFuture<'static, io::Result<Vec<u8>>> {
        future::ready(Ok(self.bytes.to_vec())).boxed()
    }
}
