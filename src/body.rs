use std::convert::Infallible;
use std::error::Error as StdError;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt, stream};
use http::Request;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::multipart::{MultipartForm, multipart_req_body};
use crate::util::lock_unpoisoned;

pub type BoxBodyError = Box<dyn StdError + Send + Sync>;
/// Boxed body type exchanged with a [`Transport`](crate::Transport) in both directions.
pub type WireBody = UnsyncBoxBody<Bytes, BoxBodyError>;

/// A reader that can be rewound to its start between attempts.
pub trait SeekableReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T> SeekableReader for T where T: AsyncRead + AsyncSeek + Send + Unpin {}

const SEEKABLE_CHUNK_BYTES: usize = 64 * 1024;

/// Reader shared by every clone of a seekable body.
///
/// The lock is held for one read or one seek, never for a whole exchange.
/// A wire body records the generation it was created in and fails once a
/// rewind has moved the source past it.
struct SeekableSource {
    reader: tokio::sync::Mutex<Box<dyn SeekableReader>>,
    generation: AtomicU64,
}

type SharedSeekable = Arc<SeekableSource>;
type OneShotReader = Box<dyn AsyncRead + Send + Unpin>;

/// Request payload carried by `http::Request<RequestBody>`.
///
/// Cloning is cheap: readers and forms are shared handles, so a clone taken
/// for a retry replays the same underlying source.
#[derive(Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Seekable(SeekableBody),
    Stream(OneShotBody),
    Multipart(Arc<MultipartForm>),
}

#[derive(Clone)]
pub struct SeekableBody {
    source: SharedSeekable,
}

#[derive(Clone)]
pub struct OneShotBody {
    reader: Arc<Mutex<Option<OneShotReader>>>,
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Empty"),
            Self::Bytes(bytes) => formatter.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Seekable(_) => formatter.write_str("Seekable"),
            Self::Stream(_) => formatter.write_str("Stream"),
            Self::Multipart(form) => formatter.debug_tuple("Multipart").field(form).finish(),
        }
    }
}

impl RequestBody {
    pub fn seekable<R>(reader: R) -> Self
    where
        R: AsyncRead + AsyncSeek + Send + Unpin + 'static,
    {
        Self::Seekable(SeekableBody {
            source: Arc::new(SeekableSource {
                reader: tokio::sync::Mutex::new(Box::new(reader)),
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn stream<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::Stream(OneShotBody {
            reader: Arc::new(Mutex::new(Some(Box::new(reader)))),
        })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Whether the body can be sent again after an attempt consumed it.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::Stream(_))
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Rewinds a seekable body to offset zero; fails for one-shot streams.
    ///
    /// Wire bodies produced before the rewind stop yielding data.
    pub(crate) async fn rewind(&self) -> std::io::Result<()> {
        match self {
            Self::Seekable(body) => {
                let mut reader = body.source.reader.lock().await;
                body.source.generation.fetch_add(1, Ordering::AcqRel);
                reader.seek(SeekFrom::Start(0)).await.map(|_| ())
            }
            Self::Stream(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "request body is a one-shot stream",
            )),
            Self::Empty | Self::Bytes(_) | Self::Multipart(_) => Ok(()),
        }
    }

    /// Produces the wire body for one exchange.
    pub(crate) fn into_req_body(self) -> WireBody {
        match self {
            Self::Empty => empty_req_body(),
            Self::Bytes(bytes) => buffered_req_body(bytes),
            Self::Seekable(body) => seekable_req_body(body.source),
            Self::Stream(body) => {
                let reader = lock_unpoisoned(&body.reader).take();
                match reader {
                    Some(reader) => reader_req_body(reader),
                    None => failed_req_body(std::io::Error::other(
                        "one-shot request body stream was already consumed",
                    )),
                }
            }
            Self::Multipart(form) => multipart_req_body(form),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(value: Bytes) -> Self {
        if value.is_empty() {
            Self::Empty
        } else {
            Self::Bytes(value)
        }
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        Self::from(Bytes::from(value))
    }
}

impl From<&'static str> for RequestBody {
    fn from(value: &'static str) -> Self {
        Self::from(Bytes::from_static(value.as_bytes()))
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(value: Vec<u8>) -> Self {
        Self::from(Bytes::from(value))
    }
}

fn map_infallible_to_box_error(never: Infallible) -> BoxBodyError {
    match never {}
}

pub(crate) fn empty_req_body() -> WireBody {
    Full::new(Bytes::new())
        .map_err(map_infallible_to_box_error)
        .boxed_unsync()
}

pub(crate) fn buffered_req_body(body: Bytes) -> WireBody {
    Full::new(body)
        .map_err(map_infallible_to_box_error)
        .boxed_unsync()
}

fn reader_req_body<R>(reader: R) -> WireBody
where
    R: AsyncRead + Send + 'static,
{
    BodyExt::boxed_unsync(StreamBody::new(ReaderStream::new(reader).map(|item| {
        item.map(Frame::data)
            .map_err(|error| Box::new(error) as BoxBodyError)
    })))
}

fn failed_req_body(error: std::io::Error) -> WireBody {
    let failed = stream::once(async move { Err::<Frame<Bytes>, BoxBodyError>(Box::new(error)) });
    BodyExt::boxed_unsync(StreamBody::new(failed))
}

fn seekable_req_body(source: SharedSeekable) -> WireBody {
    let generation = source.generation.load(Ordering::Acquire);
    let chunks = stream::try_unfold(source, move |source| async move {
        let mut reader = source.reader.lock().await;
        if source.generation.load(Ordering::Acquire) != generation {
            return Err(std::io::Error::other(
                "seekable request body was rewound for a later attempt",
            ));
        }
        let mut chunk = BytesMut::with_capacity(SEEKABLE_CHUNK_BYTES);
        let read = reader.read_buf(&mut chunk).await?;
        drop(reader);
        if read == 0 {
            return Ok(None);
        }
        Ok(Some((Frame::data(chunk.freeze()), source)))
    })
    .map_err(|error| Box::new(error) as BoxBodyError);
    BodyExt::boxed_unsync(StreamBody::new(chunks))
}

pub(crate) fn clone_request(request: &Request<RequestBody>) -> Request<RequestBody> {
    let mut cloned = Request::new(request.body().clone());
    *cloned.method_mut() = request.method().clone();
    *cloned.uri_mut() = request.uri().clone();
    *cloned.version_mut() = request.version();
    *cloned.headers_mut() = request.headers().clone();
    *cloned.extensions_mut() = request.extensions().clone();
    cloned
}

pub(crate) async fn read_all_body(mut body: WireBody) -> Result<Bytes, BoxBodyError> {
    let mut collected = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame?;
        if let Some(data) = frame.data_ref() {
            collected.extend_from_slice(data);
        }
    }
    Ok(Bytes::from(collected))
}

pub(crate) fn incoming_wire_body(body: Incoming) -> WireBody {
    body.map_err(|error| Box::new(error) as BoxBodyError)
        .boxed_unsync()
}
