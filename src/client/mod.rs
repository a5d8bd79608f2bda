//! `HttpClient`: settings plus a middleware chain, with one-call helpers for
//! the common verbs and JSON/form payloads.

pub(crate) mod execute;
pub(crate) mod settings;
pub(crate) mod transport;

use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::CallContext;
use crate::middleware::{
    AuthInterceptor, DeadlineInterceptor, HeaderInterceptor, Interceptor, LoggingInterceptor,
    MiddlewareChain, RetryInterceptor,
};
use crate::request::RequestBuilder;
use crate::response::Response;
use crate::util::{parse_header_name, parse_header_value};
use crate::ReqflowResult;

pub use execute::AttemptInfo;
pub use settings::ClientSettings;
pub use transport::{CustomTransport, Transport, TransportOptions};

#[derive(Clone, Debug, Default)]
pub struct HttpClient {
    settings: ClientSettings,
    chain: MiddlewareChain,
    default_headers: HeaderMap,
}

impl HttpClient {
    /// Client over `settings`; clones of the settings keep sharing state
    /// with this client.
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            chain: MiddlewareChain::new(),
            default_headers: HeaderMap::new(),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn chain(&self) -> &MiddlewareChain {
        &self.chain
    }

    pub fn with_interceptor<I>(mut self, interceptor: I) -> Self
    where
        I: Interceptor + 'static,
    {
        self.chain.push(interceptor);
        self
    }

    pub fn use_interceptor<I>(&mut self, interceptor: I) -> &mut Self
    where
        I: Interceptor + 'static,
    {
        self.chain.push(interceptor);
        self
    }

    pub fn with_logging(self) -> Self {
        self.with_interceptor(LoggingInterceptor)
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_interceptor(DeadlineInterceptor(timeout))
    }

    pub fn with_retry(self, max_retries: usize, backoff: Duration) -> Self {
        self.with_interceptor(RetryInterceptor::new(max_retries, backoff))
    }

    pub fn with_headers(self, headers: HeaderMap) -> Self {
        self.with_interceptor(HeaderInterceptor(headers))
    }

    pub fn with_auth(self, auth: AuthInterceptor) -> Self {
        self.with_interceptor(auth)
    }

    /// Header added to every request that does not set it itself.
    pub fn set_default_header(&mut self, name: &str, value: &str) -> ReqflowResult<&mut Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    pub fn request(&self, method: &str, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.settings.clone(), self.chain.clone(), method, url.into())
            .with_default_headers(&self.default_headers)
    }

    pub async fn get(&self, ctx: &CallContext, url: impl Into<String>) -> ReqflowResult<Response> {
        self.request("GET", url).send(ctx).await
    }

    pub async fn post(
        &self,
        ctx: &CallContext,
        url: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> ReqflowResult<Response> {
        self.request("POST", url).body(body).send(ctx).await
    }

    pub async fn put(
        &self,
        ctx: &CallContext,
        url: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> ReqflowResult<Response> {
        self.request("PUT", url).body(body).send(ctx).await
    }

    pub async fn delete(&self, ctx: &CallContext, url: impl Into<String>) -> ReqflowResult<Response> {
        self.request("DELETE", url).send(ctx).await
    }

    pub async fn get_json<T>(&self, ctx: &CallContext, url: impl Into<String>) -> ReqflowResult<T>
    where
        T: DeserializeOwned,
    {
        self.request("GET", url).send_json(ctx).await
    }

    /// Posts `payload` as JSON and decodes the JSON reply. Use
    /// [`serde::de::IgnoredAny`] when the reply does not matter.
    pub async fn post_json<B, T>(
        &self,
        ctx: &CallContext,
        url: impl Into<String>,
        payload: &B,
    ) -> ReqflowResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request("POST", url).json(payload).send_json(ctx).await
    }

    pub async fn post_form<F, T>(
        &self,
        ctx: &CallContext,
        url: impl Into<String>,
        form: &F,
    ) -> ReqflowResult<T>
    where
        F: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request("POST", url).form(form).send_json(ctx).await
    }

    pub async fn put_json<B, T>(
        &self,
        ctx: &CallContext,
        url: impl Into<String>,
        payload: &B,
    ) -> ReqflowResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request("PUT", url).json(payload).send_json(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::header::{AUTHORIZATION, USER_AGENT};

    use super::{ClientSettings, HttpClient};
    use crate::middleware::AuthInterceptor;

    #[test]
    fn default_headers_fill_gaps_only() {
        let mut client = HttpClient::new(ClientSettings::new());
        client
            .set_default_header("x-tenant", "acme")
            .expect("valid header")
            .set_default_header("user-agent", "custom/1")
            .expect("valid header");
        let request = client
            .request("GET", "http://example.test/")
            .header("x-tenant", "other")
            .to_request()
            .expect("request should build");
        assert_eq!(request.headers()["x-tenant"], "other");
        assert_eq!(request.headers().get_all("x-tenant").iter().count(), 1);
        assert_eq!(request.headers()[USER_AGENT], "custom/1");
        assert!(!request.headers().contains_key(AUTHORIZATION));
    }

    #[test]
    fn chain_setup_appends_in_order() {
        let client = HttpClient::new(ClientSettings::new())
            .with_logging()
            .with_timeout(Duration::from_secs(1))
            .with_retry(2, Duration::from_millis(10))
            .with_auth(AuthInterceptor::bearer("t").expect("valid token"));
        assert_eq!(client.chain().len(), 4);

        let mut client = client;
        assert!(client.set_default_header("bad header", "v").is_err());
        assert!(client.default_headers().is_empty());
    }
}
