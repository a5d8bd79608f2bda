use std::sync::Arc;

use http::Method;
use thiserror::Error;

use crate::timing::Timings;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    /// The peer closed or reset a connection, typically an idle pooled one.
    ConnectionClosed,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::ConnectionClosed => "connection_closed",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeFormat {
    Json,
    Xml,
    Utf8,
}

impl std::fmt::Display for DecodeFormat {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Utf8 => "utf-8",
        };
        formatter.write_str(text)
    }
}

/// Coarse taxonomy used by retry decisions and by callers that only care
/// about the failure family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Build,
    Timeout,
    Cancelled,
    Transport,
    UnseekableBody,
    Decode,
    Status,
    Io,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUrl,
    EmptyMethod,
    InvalidMethod,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    SerializeXml,
    SerializeForm,
    Multipart,
    RequestHook,
    RequestBuild,
    TransportInit,
    TlsConfig,
    Transport,
    Timeout,
    Cancelled,
    UnseekableBody,
    Rewind,
    ReadBody,
    DecodeContentEncoding,
    Decode,
    HttpStatus,
    Io,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::EmptyMethod => "empty_method",
            Self::InvalidMethod => "invalid_method",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::SerializeXml => "serialize_xml",
            Self::SerializeForm => "serialize_form",
            Self::Multipart => "multipart",
            Self::RequestHook => "request_hook",
            Self::RequestBuild => "request_build",
            Self::TransportInit => "transport_init",
            Self::TlsConfig => "tls_config",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::UnseekableBody => "unseekable_body",
            Self::Rewind => "rewind",
            Self::ReadBody => "read_body",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::Decode => "decode",
            Self::HttpStatus => "http_status",
            Self::Io => "io",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request method is empty")]
    EmptyMethod,
    #[error("invalid request method: {method}")]
    InvalidMethod { method: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("failed to serialize request xml: {source}")]
    SerializeXml {
        #[source]
        source: Arc<quick_xml::se::SeError>,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: Arc<serde_urlencoded::ser::Error>,
    },
    #[error("failed to stream multipart file {path} for field {field}: {source}")]
    Multipart {
        field: String,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request hook rejected {method} {url}: {source}")]
    RequestHook {
        method: Method,
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("failed to initialize http transport: {message}")]
    TransportInit { message: String },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
    #[error(
        "http transport error ({kind}) for {method} {url} on attempt {attempt}, stats={timings}: {source}"
    )]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        url: String,
        attempt: usize,
        timings: Timings,
        #[source]
        source: BoxError,
    },
    #[error(
        "http request timed out after {timeout_ms}ms for {method} {url} on attempt {attempt}, stats={timings}"
    )]
    Timeout {
        timeout_ms: u128,
        method: Method,
        url: String,
        attempt: usize,
        timings: Timings,
    },
    #[error("http request cancelled for {method} {url} on attempt {attempt}, stats={timings}")]
    Cancelled {
        method: Method,
        url: String,
        attempt: usize,
        timings: Timings,
    },
    #[error("request body is not seekable, refusing to retry {method} {url}: {source}")]
    UnseekableBody {
        method: Method,
        url: String,
        #[source]
        source: Box<Error>,
    },
    #[error("failed to rewind request body for retry: {source}")]
    Rewind {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read response body for {method} {url}: {source}")]
    ReadBody {
        method: Method,
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to decode response content-encoding {encoding}: {message}")]
    DecodeContentEncoding { encoding: String, message: String },
    #[error("failed to decode response {format}: {source}, content: {body}")]
    Decode {
        format: DecodeFormat,
        body: String,
        #[source]
        source: BoxError,
    },
    #[error("HTTP {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUrl { .. } => ErrorCode::InvalidUrl,
            Self::EmptyMethod => ErrorCode::EmptyMethod,
            Self::InvalidMethod { .. } => ErrorCode::InvalidMethod,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeXml { .. } => ErrorCode::SerializeXml,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::Multipart { .. } => ErrorCode::Multipart,
            Self::RequestHook { .. } => ErrorCode::RequestHook,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::TransportInit { .. } => ErrorCode::TransportInit,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::UnseekableBody { .. } => ErrorCode::UnseekableBody,
            Self::Rewind { .. } => ErrorCode::Rewind,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::Decode { .. } => ErrorCode::Decode,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Io { .. } => ErrorCode::Io,
        }
    }

    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidUrl { .. }
            | Self::EmptyMethod
            | Self::InvalidMethod { .. }
            | Self::InvalidHeaderName { .. }
            | Self::InvalidHeaderValue { .. }
            | Self::SerializeJson { .. }
            | Self::SerializeXml { .. }
            | Self::SerializeForm { .. }
            | Self::Multipart { .. }
            | Self::RequestHook { .. }
            | Self::RequestBuild { .. }
            | Self::TransportInit { .. }
            | Self::TlsConfig { .. } => ErrorClass::Build,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Cancelled { .. } => ErrorClass::Cancelled,
            Self::Transport { .. } | Self::ReadBody { .. } => ErrorClass::Transport,
            Self::UnseekableBody { .. } | Self::Rewind { .. } => ErrorClass::UnseekableBody,
            Self::DecodeContentEncoding { .. } | Self::Decode { .. } => ErrorClass::Decode,
            Self::HttpStatus { .. } => ErrorClass::Status,
            Self::Io { .. } => ErrorClass::Io,
        }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Timing breakdown of the failed attempt, when the failure happened on the wire.
    pub fn timings(&self) -> Option<&Timings> {
        match self {
            Self::Transport { timings, .. }
            | Self::Timeout { timings, .. }
            | Self::Cancelled { timings, .. } => Some(timings),
            Self::UnseekableBody { source, .. } => source.timings(),
            _ => None,
        }
    }

    pub fn attempt(&self) -> Option<usize> {
        match self {
            Self::Transport { attempt, .. }
            | Self::Timeout { attempt, .. }
            | Self::Cancelled { attempt, .. } => Some(*attempt),
            Self::UnseekableBody { source, .. } => source.attempt(),
            _ => None,
        }
    }

    pub(crate) const fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub(crate) const fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Timeout | ErrorClass::Transport
        )
    }
}
