use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, HOST, HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, Request, StatusCode, Uri, Version};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncSeek};
use tracing::warn;

use crate::body::RequestBody;
use crate::client::execute::execute;
use crate::client::settings::ClientSettings;
use crate::context::CallContext;
use crate::error::Error;
use crate::middleware::MiddlewareChain;
use crate::multipart::{MultipartForm, random_boundary};
use crate::proxy::basic_authorization;
use crate::response::Response;
use crate::retry::Retries;
use crate::util::{
    append_query_string, encode_query_pairs, is_write_method, parse_header_name,
    parse_header_value,
};
use crate::ReqflowResult;

/// Pre-send hook run on every attempt after the request is built.
pub type RequestHook = Arc<
    dyn Fn(&mut Request<RequestBody>) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

const JSON_CONTENT_TYPE: &str = "application/json";
const XML_CONTENT_TYPE: &str = "application/xml";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeaderMode {
    Append,
    Set,
    IfAbsent,
}

#[derive(Clone, Debug)]
enum HeaderEntry {
    Typed(HeaderName, HeaderValue),
    Raw(String, String),
}

/// Setter-time failures that can only be observed when serializing.
#[derive(Clone, Debug)]
enum PendingError {
    Json(Arc<serde_json::Error>),
    Xml(Arc<quick_xml::se::SeError>),
    Form(Arc<serde_urlencoded::ser::Error>),
}

impl From<PendingError> for Error {
    fn from(pending: PendingError) -> Self {
        match pending {
            PendingError::Json(source) => Error::SerializeJson { source },
            PendingError::Xml(source) => Error::SerializeXml { source },
            PendingError::Form(source) => Error::SerializeForm { source },
        }
    }
}

/// One-shot description of a request.
///
/// Setters never fail: invalid input is remembered and reported by
/// [`RequestBuilder::to_request`] or by the `send*` family, which consume the
/// builder.
pub struct RequestBuilder {
    settings: ClientSettings,
    chain: MiddlewareChain,
    method: String,
    url: String,
    header_ops: Vec<(HeaderMode, HeaderEntry)>,
    default_headers: HeaderMap,
    inferred_content_type: Option<&'static str>,
    query: Vec<(String, String)>,
    body: RequestBody,
    has_body: bool,
    files: Vec<(String, PathBuf)>,
    fields: Vec<(String, String)>,
    boundary: Option<String>,
    basic_auth: Option<(String, String)>,
    host: Option<String>,
    version: Version,
    timeout: Duration,
    retries: Option<Retries>,
    auto_decompress: Option<bool>,
    cookies: Vec<(String, String)>,
    hook: Option<RequestHook>,
    pending_error: Option<PendingError>,
}

impl std::fmt::Debug for RequestBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestBuilder")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("query", &self.query)
            .field("body", &self.body)
            .field("files", &self.files)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

impl RequestBuilder {
    pub(crate) fn new(
        settings: ClientSettings,
        chain: MiddlewareChain,
        method: &str,
        url: String,
    ) -> Self {
        Self {
            settings,
            chain,
            method: method.trim().to_ascii_uppercase(),
            url,
            header_ops: Vec::new(),
            default_headers: HeaderMap::new(),
            inferred_content_type: None,
            query: Vec::new(),
            body: RequestBody::Empty,
            has_body: false,
            files: Vec::new(),
            fields: Vec::new(),
            boundary: None,
            basic_auth: None,
            host: None,
            version: Version::HTTP_11,
            timeout: Duration::ZERO,
            retries: None,
            auto_decompress: None,
            cookies: Vec::new(),
            hook: None,
            pending_error: None,
        }
    }

    pub(crate) fn with_default_headers(mut self, headers: &HeaderMap) -> Self {
        self.default_headers = headers.clone();
        self
    }

    fn header_op(mut self, mode: HeaderMode, entry: HeaderEntry) -> Self {
        self.header_ops.push((mode, entry));
        self
    }

    /// Appends a header value.
    pub fn header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_op(HeaderMode::Append, HeaderEntry::Raw(name.into(), value.into()))
    }

    pub fn header_value(self, name: HeaderName, value: HeaderValue) -> Self {
        self.header_op(HeaderMode::Append, HeaderEntry::Typed(name, value))
    }

    /// Replaces every value of the header.
    pub fn set_header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_op(HeaderMode::Set, HeaderEntry::Raw(name.into(), value.into()))
    }

    pub fn header_if_absent(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_op(HeaderMode::IfAbsent, HeaderEntry::Raw(name.into(), value.into()))
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Replaces every pair named `name`.
    pub fn set_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.query.retain(|(existing, _)| *existing != name);
        self.query.push((name, value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    /// Adds the pairs of a serde value, e.g. a struct or a map.
    pub fn query_serialize<T>(mut self, params: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        if self.pending_error.is_some() {
            return self;
        }
        match serde_urlencoded::to_string(params) {
            Ok(encoded) => {
                self.query.extend(
                    url::form_urlencoded::parse(encoded.as_bytes())
                        .map(|(name, value)| (name.into_owned(), value.into_owned())),
                );
            }
            Err(source) => self.pending_error = Some(PendingError::Form(Arc::new(source))),
        }
        self
    }

    fn replace_body(
        mut self,
        body: RequestBody,
        inferred_content_type: Option<&'static str>,
    ) -> Self {
        self.body = body;
        self.has_body = true;
        self.inferred_content_type = inferred_content_type;
        self.files.clear();
        self.fields.clear();
        self
    }

    /// Raw bytes sent verbatim.
    pub fn body(self, body: impl Into<Bytes>) -> Self {
        self.replace_body(RequestBody::from(body.into()), None)
    }

    /// A reader rewound to offset zero before every retry.
    pub fn body_seekable<R>(self, reader: R) -> Self
    where
        R: AsyncRead + AsyncSeek + Send + Unpin + 'static,
    {
        self.replace_body(RequestBody::seekable(reader), None)
    }

    /// A reader consumed once. Requests with such a body are never retried.
    pub fn body_stream<R>(self, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.replace_body(RequestBody::stream(reader), None)
    }

    pub fn form<T>(mut self, form: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        if self.pending_error.is_some() {
            return self;
        }
        match serde_urlencoded::to_string(form) {
            Ok(encoded) => self.replace_body(RequestBody::from(encoded), Some(FORM_CONTENT_TYPE)),
            Err(source) => {
                self.pending_error = Some(PendingError::Form(Arc::new(source)));
                self
            }
        }
    }

    pub fn json<T>(mut self, payload: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        if self.pending_error.is_some() {
            return self;
        }
        match serde_json::to_vec(payload) {
            Ok(encoded) => self.replace_body(RequestBody::from(encoded), Some(JSON_CONTENT_TYPE)),
            Err(source) => {
                self.pending_error = Some(PendingError::Json(Arc::new(source)));
                self
            }
        }
    }

    pub fn xml<T>(mut self, payload: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        if self.pending_error.is_some() {
            return self;
        }
        match quick_xml::se::to_string(payload) {
            Ok(encoded) => self.replace_body(RequestBody::from(encoded), Some(XML_CONTENT_TYPE)),
            Err(source) => {
                self.pending_error = Some(PendingError::Xml(Arc::new(source)));
                self
            }
        }
    }

    fn ensure_multipart(&mut self) {
        if self.has_body {
            self.body = RequestBody::Empty;
            self.has_body = false;
            self.inferred_content_type = None;
        }
        if self.boundary.is_none() {
            self.boundary = Some(random_boundary());
        }
    }

    /// Attaches a file as a multipart part. A GET request becomes a POST.
    pub fn file(mut self, field: impl Into<String>, path: impl AsRef<Path>) -> Self {
        self.ensure_multipart();
        self.files.push((field.into(), path.as_ref().to_path_buf()));
        self
    }

    /// Adds a plain multipart field, written after the files.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.ensure_multipart();
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }

    pub fn bearer_auth(self, token: impl AsRef<str>) -> Self {
        let value = format!("Bearer {}", token.as_ref());
        self.header_op(
            HeaderMode::Set,
            HeaderEntry::Raw(AUTHORIZATION.as_str().to_owned(), value),
        )
    }

    /// Overrides the `Host` header; the connection still targets the url.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// `"HTTP/1.0"` or `"HTTP/1.1"`; anything else is ignored.
    pub fn protocol_version(mut self, version: &str) -> Self {
        match version.trim().to_ascii_uppercase().as_str() {
            "HTTP/1.0" => self.version = Version::HTTP_10,
            "HTTP/1.1" => self.version = Version::HTTP_11,
            other => warn!(version = other, "unsupported protocol version ignored"),
        }
        self
    }

    /// Per-attempt timeout; zero falls back to the client timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(Retries::Limited(retries));
        self
    }

    pub fn retry_forever(mut self) -> Self {
        self.retries = Some(Retries::Forever);
        self
    }

    /// Overrides the client's gzip/deflate decoding toggle for this request.
    pub fn auto_decompress(mut self, enabled: bool) -> Self {
        self.auto_decompress = Some(enabled);
        self
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn on_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Request<RequestBody>) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Retry budget the engine will use. A one-shot stream body forces zero.
    pub fn effective_retries(&self) -> Retries {
        if self.body.is_replayable() {
            self.configured_retries()
        } else {
            Retries::NONE
        }
    }

    pub(crate) fn configured_retries(&self) -> Retries {
        self.retries
            .unwrap_or_else(|| self.settings.default_retries())
    }

    pub(crate) fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub(crate) fn chain(&self) -> &MiddlewareChain {
        &self.chain
    }

    pub(crate) fn hook(&self) -> Option<&RequestHook> {
        self.hook.as_ref()
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn auto_decompress_override(&self) -> Option<bool> {
        self.auto_decompress
    }

    pub(crate) fn request_body(&self) -> &RequestBody {
        &self.body
    }

    pub(crate) fn method_text(&self) -> &str {
        &self.method
    }

    pub(crate) fn url_text(&self) -> &str {
        &self.url
    }

    fn parse_method(&self) -> ReqflowResult<Method> {
        if self.method.is_empty() {
            return Err(Error::EmptyMethod);
        }
        Method::from_bytes(self.method.as_bytes()).map_err(|_| Error::InvalidMethod {
            method: self.method.clone(),
        })
    }

    fn apply_header_ops(&self, headers: &mut HeaderMap) -> ReqflowResult<()> {
        for (mode, entry) in &self.header_ops {
            let (name, mut value) = match entry {
                HeaderEntry::Typed(name, value) => (name.clone(), value.clone()),
                HeaderEntry::Raw(name, value) => {
                    let name = parse_header_name(name)?;
                    let value = parse_header_value(name.as_str(), value)?;
                    (name, value)
                }
            };
            if name == AUTHORIZATION {
                value.set_sensitive(true);
            }
            match mode {
                HeaderMode::Append => {
                    headers.append(name, value);
                }
                HeaderMode::Set => {
                    headers.insert(name, value);
                }
                HeaderMode::IfAbsent => {
                    if !headers.contains_key(&name) {
                        headers.insert(name, value);
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve_uri(&self, url: &str) -> ReqflowResult<Uri> {
        let invalid = |reason: &str| Error::InvalidUrl {
            url: url.to_owned(),
            reason: reason.to_owned(),
        };
        let uri: Uri = url.parse().map_err(|error: http::uri::InvalidUri| invalid(&error.to_string()))?;
        match uri.scheme_str() {
            Some(scheme)
                if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") => {}
            Some(_) => return Err(invalid("scheme must be http or https")),
            None => return Err(invalid("url must be absolute")),
        }
        if uri.host().is_none_or(str::is_empty) {
            return Err(invalid("url has no host"));
        }
        Ok(uri)
    }

    /// Compiles the builder into a wire request without consuming it.
    ///
    /// Every call derives a fresh request; calling it twice yields the same
    /// method, url, headers and body.
    pub fn to_request(&self) -> ReqflowResult<Request<RequestBody>> {
        if let Some(pending) = &self.pending_error {
            return Err(pending.clone().into());
        }
        let mut method = self.parse_method()?;
        let multipart = !self.files.is_empty() || !self.fields.is_empty();
        if !self.files.is_empty() && method == Method::GET {
            method = Method::POST;
        }

        let mut body = self.body.clone();
        let mut inferred_content_type = self.inferred_content_type.map(str::to_owned);
        let mut url = self.url.clone();
        if multipart {
            let mut fields = self.fields.clone();
            fields.extend(self.query.iter().cloned());
            let form = MultipartForm::new(
                self.boundary.clone().unwrap_or_else(random_boundary),
                self.files.clone(),
                fields,
            );
            inferred_content_type = Some(form.content_type());
            body = RequestBody::Multipart(Arc::new(form));
        } else if is_write_method(method.as_str()) && !self.has_body {
            if !self.query.is_empty() {
                body = RequestBody::from(encode_query_pairs(&self.query));
                inferred_content_type = Some(FORM_CONTENT_TYPE.to_owned());
            }
        } else {
            url = append_query_string(&url, &encode_query_pairs(&self.query));
        }
        let uri = self.resolve_uri(&url)?;

        let mut headers = HeaderMap::new();
        self.apply_header_ops(&mut headers)?;
        for name in self.default_headers.keys() {
            if !headers.contains_key(name) {
                for value in self.default_headers.get_all(name) {
                    headers.append(name.clone(), value.clone());
                }
            }
        }
        if !self.cookies.is_empty() {
            let pairs = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            headers.append(COOKIE, parse_header_value(COOKIE.as_str(), &pairs)?);
        }
        if let Some(content_type) = inferred_content_type
            && !headers.contains_key(CONTENT_TYPE)
        {
            headers.insert(
                CONTENT_TYPE,
                parse_header_value(CONTENT_TYPE.as_str(), &content_type)?,
            );
        }
        if !headers.contains_key(USER_AGENT) {
            headers.insert(
                USER_AGENT,
                parse_header_value(USER_AGENT.as_str(), &self.settings.user_agent())?,
            );
        }
        if let Some((username, password)) = &self.basic_auth {
            headers.insert(AUTHORIZATION, basic_authorization(username, password)?);
        }
        if let Some(host) = &self.host {
            headers.insert(HOST, parse_header_value(HOST.as_str(), host)?);
        }

        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .version(self.version)
            .body(body)
            .map_err(|source| Error::RequestBuild { source })?;
        *request.headers_mut() = headers;
        Ok(request)
    }

    /// HTTP/1 text rendering of [`RequestBuilder::to_request`]; in-memory
    /// bodies are included when the client dumps bodies.
    pub fn dump_request(&self) -> ReqflowResult<String> {
        let request = self.to_request()?;
        Ok(dump_http_request(&request, self.settings.snapshot().dump_body))
    }

    pub async fn send(self, ctx: &CallContext) -> ReqflowResult<Response> {
        execute(self, ctx).await
    }

    pub async fn send_bytes(self, ctx: &CallContext) -> ReqflowResult<Bytes> {
        Ok(self.send(ctx).await?.into_bytes())
    }

    pub async fn send_text(self, ctx: &CallContext) -> ReqflowResult<String> {
        self.send(ctx).await?.text()
    }

    pub async fn send_json<T>(self, ctx: &CallContext) -> ReqflowResult<T>
    where
        T: DeserializeOwned,
    {
        self.send(ctx).await?.json()
    }

    /// Decodes the body whatever the status and returns both.
    pub async fn send_json_with_status<T>(self, ctx: &CallContext) -> ReqflowResult<(StatusCode, T)>
    where
        T: DeserializeOwned,
    {
        let response = self.send(ctx).await?;
        let decoded = response.json()?;
        Ok((response.status(), decoded))
    }

    /// Decodes the body only for `200 OK`; other statuses yield `None`.
    pub async fn send_json_when_ok<T>(
        self,
        ctx: &CallContext,
    ) -> ReqflowResult<(StatusCode, Option<T>)>
    where
        T: DeserializeOwned,
    {
        let response = self.send(ctx).await?;
        if response.status() != StatusCode::OK {
            return Ok((response.status(), None));
        }
        let decoded = response.json()?;
        Ok((response.status(), Some(decoded)))
    }

    pub async fn send_xml<T>(self, ctx: &CallContext) -> ReqflowResult<T>
    where
        T: DeserializeOwned,
    {
        self.send(ctx).await?.xml()
    }

    pub async fn send_to_file(self, ctx: &CallContext, path: impl AsRef<Path>) -> ReqflowResult<()> {
        self.send(ctx).await?.write_to_file(path).await
    }

    /// Sends and discards the response body, keeping only the status.
    pub async fn send_ignore(self, ctx: &CallContext) -> ReqflowResult<StatusCode> {
        Ok(self.send(ctx).await?.status())
    }
}

pub(crate) fn dump_http_request(request: &Request<RequestBody>, include_body: bool) -> String {
    let target = request
        .uri()
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or("/");
    let mut dump = format!("{} {} {:?}\r\n", request.method(), target, request.version());
    if !request.headers().contains_key(HOST)
        && let Some(authority) = request.uri().authority()
    {
        dump.push_str(&format!("Host: {authority}\r\n"));
    }
    for (name, value) in request.headers() {
        let value = if value.is_sensitive() {
            "<redacted>".to_owned()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        dump.push_str(&format!("{name}: {value}\r\n"));
    }
    dump.push_str("\r\n");
    if include_body && let Some(bytes) = request.body().as_bytes() {
        dump.push_str(&String::from_utf8_lossy(bytes));
    }
    dump
}
