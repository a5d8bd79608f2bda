//! Interceptor chain wrapped around the terminal HTTP exchange.
//!
//! A [`MiddlewareChain`] is an ordered list of [`Interceptor`]s. Running it
//! hands each interceptor a [`Next`] cursor over the remaining links; the
//! chain itself is only borrowed, so one chain serves any number of calls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use http::header::{AUTHORIZATION, HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Request};
use tracing::{error, info, warn};

use crate::body::{RequestBody, clone_request};
use crate::client::AttemptInfo;
use crate::context::CallContext;
use crate::error::{Error, ErrorClass};
use crate::proxy::basic_authorization;
use crate::response::Response;
use crate::timing::{TimelineCell, Timings, is_ip_literal};
use crate::util::{parse_header_name, parse_header_value, redact_uri_for_logs};
use crate::ReqflowResult;

/// Terminal step of a chain: performs the exchange itself.
pub trait Exchange: Send + Sync {
    fn exchange<'a>(
        &'a self,
        ctx: CallContext,
        request: Request<RequestBody>,
    ) -> BoxFuture<'a, ReqflowResult<Response>>;
}

/// A link in the chain. Call `next.run(..)` at most once to continue;
/// returning without calling it short-circuits the rest of the chain.
pub trait Interceptor: Send + Sync {
    fn intercept<'a>(
        &'a self,
        ctx: CallContext,
        request: Request<RequestBody>,
        next: Next<'a>,
    ) -> BoxFuture<'a, ReqflowResult<Response>>;
}

/// Continuation over the links that follow the current interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    terminal: &'a dyn Exchange,
}

impl<'a> Next<'a> {
    pub fn run(
        self,
        ctx: CallContext,
        request: Request<RequestBody>,
    ) -> BoxFuture<'a, ReqflowResult<Response>> {
        match self.interceptors.split_first() {
            Some((current, rest)) => current.intercept(
                ctx,
                request,
                Next {
                    interceptors: rest,
                    terminal: self.terminal,
                },
            ),
            None => self.terminal.exchange(ctx, request),
        }
    }
}

#[derive(Clone, Default)]
pub struct MiddlewareChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MiddlewareChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<I>(&mut self, interceptor: I) -> &mut Self
    where
        I: Interceptor + 'static,
    {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn push_shared(&mut self, interceptor: Arc<dyn Interceptor>) -> &mut Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with<I>(mut self, interceptor: I) -> Self
    where
        I: Interceptor + 'static,
    {
        self.push(interceptor);
        self
    }

    pub fn clear(&mut self) {
        self.interceptors.clear();
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub async fn run(
        &self,
        ctx: CallContext,
        request: Request<RequestBody>,
        terminal: &dyn Exchange,
    ) -> ReqflowResult<Response> {
        Next {
            interceptors: &self.interceptors,
            terminal,
        }
        .run(ctx, request)
        .await
    }
}

/// Logs method, url and user agent before the call and status or error
/// with the elapsed time after it.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn intercept<'a>(
        &'a self,
        ctx: CallContext,
        request: Request<RequestBody>,
        next: Next<'a>,
    ) -> BoxFuture<'a, ReqflowResult<Response>> {
        Box::pin(async move {
            let method = request.method().clone();
            let url = redact_uri_for_logs(&request.uri().to_string());
            let user_agent = request
                .headers()
                .get(USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            info!(method = %method, url = %url, user_agent = %user_agent, "http request started");
            let started = Instant::now();
            let result = next.run(ctx, request).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(response) => info!(
                    method = %method,
                    url = %url,
                    status = response.status().as_u16(),
                    duration_ms,
                    "http request completed"
                ),
                Err(failure) => error!(
                    method = %method,
                    url = %url,
                    duration_ms,
                    error = %failure,
                    "http request failed"
                ),
            }
            result
        })
    }
}

/// Bounded retry around the rest of the chain with linear backoff
/// (`backoff * attempt`). Retries transport failures, timeouts and 5xx
/// responses; stops early when the context is done or the body cannot be
/// replayed.
#[derive(Clone, Copy, Debug)]
pub struct RetryInterceptor {
    pub max_retries: usize,
    pub backoff: Duration,
}

impl RetryInterceptor {
    pub fn new(max_retries: usize, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }
}

/// `backoff * (retry_index + 1)`, saturating.
fn linear_backoff(backoff: Duration, retry_index: usize) -> Duration {
    let multiplier = u32::try_from(retry_index.saturating_add(1)).unwrap_or(u32::MAX);
    backoff.saturating_mul(multiplier)
}

fn should_retry(result: &ReqflowResult<Response>) -> bool {
    match result {
        Ok(response) => response.is_server_error(),
        Err(error) => !matches!(
            error.class(),
            ErrorClass::Build | ErrorClass::Cancelled | ErrorClass::UnseekableBody
        ),
    }
}

impl Interceptor for RetryInterceptor {
    fn intercept<'a>(
        &'a self,
        ctx: CallContext,
        request: Request<RequestBody>,
        next: Next<'a>,
    ) -> BoxFuture<'a, ReqflowResult<Response>> {
        Box::pin(async move {
            let mut retry_index = 0usize;
            loop {
                let result = next.run(ctx.clone(), clone_request(&request)).await;
                if !should_retry(&result)
                    || retry_index >= self.max_retries
                    || ctx.is_done()
                    || !request.body().is_replayable()
                {
                    return result;
                }
                tokio::select! {
                    rewound = request.body().rewind() => {
                        rewound.map_err(|source| Error::Rewind { source })?;
                    }
                    _ = ctx.done() => return result,
                }
                let delay = linear_backoff(self.backoff, retry_index);
                let reason = match &result {
                    Ok(response) => format!("status {}", response.status().as_u16()),
                    Err(error) => error.to_string(),
                };
                warn!(
                    method = %request.method(),
                    url = %redact_uri_for_logs(&request.uri().to_string()),
                    retry = retry_index + 1,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "retrying request from interceptor"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.done() => return result,
                }
                retry_index += 1;
            }
        })
    }
}

/// Runs the rest of the chain under a derived deadline.
#[derive(Clone, Copy, Debug)]
pub struct DeadlineInterceptor(pub Duration);

impl Interceptor for DeadlineInterceptor {
    fn intercept<'a>(
        &'a self,
        ctx: CallContext,
        request: Request<RequestBody>,
        next: Next<'a>,
    ) -> BoxFuture<'a, ReqflowResult<Response>> {
        Box::pin(async move {
            let child = ctx.with_timeout(self.0);
            let method = request.method().clone();
            let url = request.uri().to_string();
            let host_is_ip = is_ip_literal(request.uri());
            let attempt = request
                .extensions()
                .get::<AttemptInfo>()
                .map_or(1, |info| info.attempt);
            let timeline = request.extensions().get::<TimelineCell>().cloned();
            let running = next.run(child.clone(), request);
            tokio::select! {
                result = running => result,
                _ = child.done() => {
                    let timings = timeline
                        .map(|cell| cell.current().snapshot(host_is_ip))
                        .unwrap_or_else(Timings::default);
                    if ctx.is_done() {
                        Err(Error::Cancelled { method, url, attempt, timings })
                    } else {
                        Err(Error::Timeout {
                            timeout_ms: self.0.as_millis(),
                            method,
                            url,
                            attempt,
                            timings,
                        })
                    }
                }
            }
        })
    }
}

/// Sets a fixed group of headers on every request, replacing existing values.
#[derive(Clone, Debug)]
pub struct HeaderInterceptor(pub HeaderMap);

impl HeaderInterceptor {
    pub fn from_pairs<I, K, V>(pairs: I) -> ReqflowResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            let name = parse_header_name(name.as_ref())?;
            let value = parse_header_value(name.as_str(), value.as_ref())?;
            headers.insert(name, value);
        }
        Ok(Self(headers))
    }
}

impl Interceptor for HeaderInterceptor {
    fn intercept<'a>(
        &'a self,
        ctx: CallContext,
        mut request: Request<RequestBody>,
        next: Next<'a>,
    ) -> BoxFuture<'a, ReqflowResult<Response>> {
        for name in self.0.keys() {
            request.headers_mut().remove(name);
        }
        for (name, value) in &self.0 {
            request.headers_mut().append(name.clone(), value.clone());
        }
        next.run(ctx, request)
    }
}

/// Injects a credential header on every request.
#[derive(Clone, Debug)]
pub struct AuthInterceptor {
    name: HeaderName,
    value: HeaderValue,
}

const API_KEY_HEADER: &str = "x-api-key";

fn sensitive_value(name: &str, value: &str) -> ReqflowResult<HeaderValue> {
    let mut value = parse_header_value(name, value)?;
    value.set_sensitive(true);
    Ok(value)
}

impl AuthInterceptor {
    pub fn bearer(token: &str) -> ReqflowResult<Self> {
        Ok(Self {
            name: AUTHORIZATION,
            value: sensitive_value("authorization", &format!("Bearer {token}"))?,
        })
    }

    /// `credentials` is the already base64-encoded `user:password`.
    pub fn basic(credentials: &str) -> ReqflowResult<Self> {
        Ok(Self {
            name: AUTHORIZATION,
            value: sensitive_value("authorization", &format!("Basic {credentials}"))?,
        })
    }

    pub fn basic_credentials(username: &str, password: &str) -> ReqflowResult<Self> {
        Ok(Self {
            name: AUTHORIZATION,
            value: basic_authorization(username, password)?,
        })
    }

    pub fn api_key(key: &str) -> ReqflowResult<Self> {
        Ok(Self {
            name: HeaderName::from_static(API_KEY_HEADER),
            value: sensitive_value(API_KEY_HEADER, key)?,
        })
    }
}

impl Interceptor for AuthInterceptor {
    fn intercept<'a>(
        &'a self,
        ctx: CallContext,
        mut request: Request<RequestBody>,
        next: Next<'a>,
    ) -> BoxFuture<'a, ReqflowResult<Response>> {
        request
            .headers_mut()
            .insert(self.name.clone(), self.value.clone());
        next.run(ctx, request)
    }
}
