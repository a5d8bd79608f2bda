use std::path::Path;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;

use crate::error::{DecodeFormat, Error};
use crate::timing::Timings;
use crate::util::truncate_body;
use crate::ReqflowResult;

/// A completed exchange with its body fully buffered.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    version: Version,
    url: String,
    body: Bytes,
    attempts: usize,
    timings: Timings,
    dump: Option<String>,
}

impl Response {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        version: Version,
        url: impl Into<String>,
        body: Bytes,
    ) -> Self {
        Self {
            status,
            headers,
            version,
            url: url.into(),
            body,
            attempts: 1,
            timings: Timings::default(),
            dump: None,
        }
    }

    pub(crate) fn set_attempts(&mut self, attempts: usize) {
        self.attempts = attempts;
    }

    pub(crate) fn set_timings(&mut self, timings: Timings) {
        self.timings = timings;
    }

    pub(crate) fn set_dump(&mut self, dump: Option<String>) {
        self.dump = dump;
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Final url, after redirects.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Attempts the engine made for this call, counting the one that produced
    /// this response.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Text dump of the outgoing request, recorded in debug mode.
    pub fn dump(&self) -> Option<&str> {
        self.dump.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    pub fn text(&self) -> ReqflowResult<String> {
        std::str::from_utf8(&self.body)
            .map(ToOwned::to_owned)
            .map_err(|source| self.decode_error(DecodeFormat::Utf8, Box::new(source)))
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> ReqflowResult<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
            .map_err(|source| self.decode_error(DecodeFormat::Json, Box::new(source)))
    }

    pub fn xml<T>(&self) -> ReqflowResult<T>
    where
        T: DeserializeOwned,
    {
        let text = std::str::from_utf8(&self.body)
            .map_err(|source| self.decode_error(DecodeFormat::Xml, Box::new(source)))?;
        quick_xml::de::from_str(text)
            .map_err(|source| self.decode_error(DecodeFormat::Xml, Box::new(source)))
    }

    pub async fn write_to_file(&self, path: impl AsRef<Path>) -> ReqflowResult<()> {
        let path = path.as_ref();
        tokio::fs::write(path, &self.body)
            .await
            .map_err(|source| Error::Io {
                path: path.display().to_string(),
                source,
            })
    }

    /// `Err(Error::HttpStatus)` for 4xx and 5xx responses.
    pub fn error_for_status(self) -> ReqflowResult<Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            return Err(Error::HttpStatus {
                status: self.status.as_u16(),
                url: self.url,
                body: truncate_body(&self.body),
            });
        }
        Ok(self)
    }

    fn decode_error(&self, format: DecodeFormat, source: crate::error::BoxError) -> Error {
        Error::Decode {
            format,
            body: String::from_utf8_lossy(&self.body).into_owned(),
            source,
        }
    }
}
