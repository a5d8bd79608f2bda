use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use http::header::{ACCEPT_ENCODING, COOKIE, HOST, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request};
use http_body_util::BodyExt;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::body::{RequestBody, read_all_body};
use crate::client::settings::{ClientHandle, SettingsSnapshot};
use crate::content_encoding::{
    MAX_DECODED_BODY_BYTES, decode_content_encoded_body, has_decodable_encoding,
    remove_content_encoding_headers, should_decode_content_encoded_body,
};
use crate::context::CallContext;
use crate::error::{BoxError, Error, TransportErrorKind};
use crate::middleware::Exchange;
use crate::multipart::MultipartSourceError;
use crate::request::{RequestBuilder, dump_http_request};
use crate::response::Response;
use crate::retry::Retries;
use crate::timing::{Phase, TimedBody, TimelineCell, Timings, instrument, is_ip_literal};
use crate::util::{
    classify_transport_error, is_redirect_status, parse_header_value, redact_uri_for_logs,
    redirect_location, redirect_method, resolve_redirect_uri, same_origin,
    sanitize_headers_for_redirect,
};
use crate::ReqflowResult;

const X_TRACE_ID: &str = "x-trace-id";
const ACCEPT_COMPRESSED: &str = "gzip, deflate";

/// Position of the current attempt, carried in request extensions so
/// interceptors can report it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptInfo {
    /// 1-based.
    pub attempt: usize,
    /// `None` when retrying forever.
    pub max_attempts: Option<usize>,
}

/// Last link of every chain: one HTTP exchange including redirects, cookie
/// handling, body buffering and content decoding.
struct WireExchange {
    handle: Arc<ClientHandle>,
    decompress: bool,
}

impl Exchange for WireExchange {
    fn exchange<'a>(
        &'a self,
        ctx: CallContext,
        request: Request<RequestBody>,
    ) -> BoxFuture<'a, ReqflowResult<Response>> {
        Box::pin(self.perform(ctx, request))
    }
}

impl WireExchange {
    async fn perform(
        &self,
        ctx: CallContext,
        request: Request<RequestBody>,
    ) -> ReqflowResult<Response> {
        let attempt = request
            .extensions()
            .get::<AttemptInfo>()
            .map_or(1, |info| info.attempt);
        let cell = request
            .extensions()
            .get::<TimelineCell>()
            .cloned()
            .unwrap_or_else(TimelineCell::new);
        let redirect_policy = self.handle.redirect_policy;
        let (mut parts, mut body) = request.into_parts();
        let mut redirects = 0_usize;

        loop {
            let timeline = cell.restart();
            let host_is_ip = is_ip_literal(&parts.uri);
            let url = parts.uri.to_string();

            let mut headers = parts.headers.clone();
            if self.decompress && !headers.contains_key(ACCEPT_ENCODING) {
                headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(ACCEPT_COMPRESSED));
            }
            if let Some(jar) = &self.handle.cookie_jar
                && let Some(stored) = jar.header_for(&parts.uri)
            {
                merge_cookie_header(&mut headers, stored)?;
            }

            let wire_body =
                TimedBody::new(body.clone().into_req_body(), Arc::clone(&timeline)).boxed_unsync();
            let mut wire = Request::new(wire_body);
            *wire.method_mut() = parts.method.clone();
            *wire.uri_mut() = parts.uri.clone();
            *wire.version_mut() = parts.version;
            *wire.headers_mut() = headers;
            *wire.extensions_mut() = parts.extensions.clone();

            let sent = instrument(Arc::clone(&timeline), self.handle.transport.send(wire)).await;
            let response = match sent {
                Ok(response) => {
                    timeline.mark(Phase::FirstByte);
                    response
                }
                Err(source) => {
                    return Err(exchange_error(
                        &parts.method,
                        &url,
                        attempt,
                        timeline.snapshot(host_is_ip),
                        source,
                    ));
                }
            };

            if let Some(jar) = &self.handle.cookie_jar {
                jar.store(&parts.uri, response.headers());
            }

            let status = response.status();
            if redirect_policy.enabled()
                && is_redirect_status(status)
                && redirects < redirect_policy.max_redirects()
                && let Some(location) = redirect_location(response.headers())
                && let Some(next_uri) = resolve_redirect_uri(&parts.uri, &location)
            {
                let next_method = redirect_method(&parts.method, status);
                let changed_to_get = next_method == Method::GET && parts.method != Method::GET;
                if changed_to_get || body.is_replayable() {
                    let (_, unread) = response.into_parts();
                    let _ = read_all_body(unread).await;
                    if changed_to_get {
                        body = RequestBody::Empty;
                    } else {
                        tokio::select! {
                            rewound = body.rewind() => {
                                rewound.map_err(|source| Error::Rewind { source })?;
                            }
                            _ = ctx.done() => {
                                return Err(Error::Cancelled {
                                    method: parts.method.clone(),
                                    url: redact_uri_for_logs(&url),
                                    attempt,
                                    timings: timeline.snapshot(host_is_ip),
                                });
                            }
                        }
                    }
                    let same_origin_redirect = same_origin(&parts.uri, &next_uri);
                    sanitize_headers_for_redirect(
                        &mut parts.headers,
                        changed_to_get,
                        same_origin_redirect,
                    );
                    if !same_origin_redirect {
                        parts.headers.remove(HOST);
                    }
                    debug!(
                        status = status.as_u16(),
                        location = %redact_uri_for_logs(&next_uri.to_string()),
                        redirects = redirects + 1,
                        "following redirect"
                    );
                    parts.method = next_method;
                    parts.uri = next_uri;
                    redirects += 1;
                    continue;
                }
                debug!(
                    status = status.as_u16(),
                    "request body cannot be replayed, returning redirect response"
                );
            }

            let (head, unread) = response.into_parts();
            let raw = read_all_body(unread)
                .await
                .map_err(|source| Error::ReadBody {
                    method: parts.method.clone(),
                    url: redact_uri_for_logs(&url),
                    source,
                })?;
            let mut response_headers = head.headers;
            let decoded = if self.decompress
                && should_decode_content_encoded_body(&parts.method, head.status, raw.len())
                && has_decodable_encoding(&response_headers)
            {
                let decoded =
                    decode_content_encoded_body(raw, &response_headers, MAX_DECODED_BODY_BYTES)?;
                remove_content_encoding_headers(&mut response_headers);
                decoded
            } else {
                raw
            };

            let mut response =
                Response::new(head.status, response_headers, head.version, url, decoded);
            response.set_timings(timeline.snapshot(host_is_ip));
            return Ok(response);
        }
    }
}

fn merge_cookie_header(headers: &mut HeaderMap, stored: HeaderValue) -> ReqflowResult<()> {
    let Some(existing) = headers.get(COOKIE).and_then(|value| value.to_str().ok()) else {
        headers.insert(COOKIE, stored);
        return Ok(());
    };
    let stored = String::from_utf8_lossy(stored.as_bytes());
    let merged = format!("{existing}; {stored}");
    headers.insert(COOKIE, parse_header_value(COOKIE.as_str(), &merged)?);
    Ok(())
}

fn find_multipart_source<'a>(
    error: &'a (dyn StdError + 'static),
) -> Option<&'a MultipartSourceError> {
    let mut current = Some(error);
    while let Some(item) = current {
        if let Some(found) = item.downcast_ref::<MultipartSourceError>() {
            return Some(found);
        }
        current = item.source();
    }
    None
}

fn exchange_error(
    method: &Method,
    url: &str,
    attempt: usize,
    timings: Timings,
    source: BoxError,
) -> Error {
    let chain: &(dyn StdError + 'static) = source.as_ref();
    if let Some(multipart) = find_multipart_source(chain) {
        return Error::Multipart {
            field: multipart.field.clone(),
            path: multipart.path.clone(),
            source: std::io::Error::new(multipart.source.kind(), multipart.source.to_string()),
        };
    }
    Error::Transport {
        kind: classify_transport_error(chain),
        method: method.clone(),
        url: redact_uri_for_logs(url),
        attempt,
        timings,
        source,
    }
}

/// Method and url used to label failures raised outside an attempt.
fn call_identity(builder: &RequestBuilder) -> (Method, String) {
    let method = Method::from_bytes(builder.method_text().as_bytes()).unwrap_or(Method::GET);
    (method, redact_uri_for_logs(builder.url_text()))
}

fn cancelled(builder: &RequestBuilder, attempt: usize) -> Error {
    let (method, url) = call_identity(builder);
    Error::Cancelled {
        method,
        url,
        attempt,
        timings: Timings::default(),
    }
}

fn effective_timeout(builder: &RequestBuilder, snapshot: &SettingsSnapshot) -> Duration {
    let timeout = builder.request_timeout();
    if timeout.is_zero() {
        snapshot.timeout
    } else {
        timeout
    }
}

struct AttemptPlan<'a> {
    info: AttemptInfo,
    timeout: Duration,
    record_dump: bool,
    dump_body: bool,
    terminal: &'a WireExchange,
}

/// One pass through the chain under the per-attempt deadline.
async fn run_attempt(
    builder: &RequestBuilder,
    ctx: &CallContext,
    plan: AttemptPlan<'_>,
    dump: &mut Option<String>,
) -> ReqflowResult<Response> {
    let mut request = builder.to_request()?;
    if let Some(trace_id) = ctx.trace_id()
        && !request.headers().contains_key(X_TRACE_ID)
    {
        let value = parse_header_value(X_TRACE_ID, trace_id)?;
        request
            .headers_mut()
            .insert(HeaderName::from_static(X_TRACE_ID), value);
    }
    let cell = TimelineCell::new();
    request.extensions_mut().insert(plan.info);
    request.extensions_mut().insert(cell.clone());
    if let Some(hook) = builder.hook() {
        hook(&mut request).map_err(|source| Error::RequestHook {
            method: request.method().clone(),
            url: redact_uri_for_logs(&request.uri().to_string()),
            source,
        })?;
    }
    if plan.record_dump {
        *dump = Some(dump_http_request(&request, plan.dump_body));
    }

    let method = request.method().clone();
    let url = redact_uri_for_logs(&request.uri().to_string());
    let host_is_ip = is_ip_literal(request.uri());
    let child = if plan.timeout.is_zero() {
        ctx.with_cancel()
    } else {
        ctx.with_timeout(plan.timeout)
    };

    debug!("sending request");
    let running = builder.chain().run(child.clone(), request, plan.terminal);
    tokio::select! {
        biased;
        _ = child.done() => {
            let timings = cell.current().snapshot(host_is_ip);
            let attempt = plan.info.attempt;
            if ctx.is_done() {
                Err(Error::Cancelled { method, url, attempt, timings })
            } else {
                Err(Error::Timeout {
                    timeout_ms: plan.timeout.as_millis(),
                    method,
                    url,
                    attempt,
                    timings,
                })
            }
        }
        result = running => result,
    }
}

/// Rewinds the body and sleeps before the next attempt. Both steps end early
/// with `Cancelled` when the caller's context is done.
async fn pause_before_retry(
    builder: &RequestBuilder,
    ctx: &CallContext,
    delay: Duration,
    next_attempt: usize,
) -> ReqflowResult<()> {
    tokio::select! {
        rewound = builder.request_body().rewind() => {
            rewound.map_err(|source| Error::Rewind { source })?;
        }
        _ = ctx.done() => return Err(cancelled(builder, next_attempt)),
    }
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = ctx.done() => Err(cancelled(builder, next_attempt)),
    }
}

pub(crate) async fn execute(builder: RequestBuilder, ctx: &CallContext) -> ReqflowResult<Response> {
    let snapshot = builder.settings().snapshot();
    let handle = builder.settings().handle()?;
    let terminal = WireExchange {
        handle,
        decompress: builder.auto_decompress_override().unwrap_or(snapshot.gzip),
    };

    let configured = builder.configured_retries();
    let effective = builder.effective_retries();
    let replayable = builder.request_body().is_replayable();
    if !replayable && !configured.is_none() {
        warn!(
            method = %builder.method_text(),
            url = %redact_uri_for_logs(builder.url_text()),
            "request body is a one-shot stream, retries are disabled"
        );
    }
    let max_attempts = match effective {
        Retries::Limited(retries) => Some(retries as usize + 1),
        Retries::Forever => None,
    };
    let max_attempts_label = effective.max_attempts_label();
    let timeout = effective_timeout(&builder, &snapshot);
    let retry_policy = &snapshot.retry_policy;

    let mut attempt = 1_usize;
    let mut retries_used = 0_usize;
    let mut bonus_used = false;
    let mut dump = None;

    loop {
        if ctx.is_done() {
            return Err(cancelled(&builder, attempt));
        }
        let span = info_span!(
            "reqflow.request",
            method = %builder.method_text(),
            url = %redact_uri_for_logs(builder.url_text()),
            attempt = attempt,
            max_attempts = %max_attempts_label
        );
        let plan = AttemptPlan {
            info: AttemptInfo {
                attempt,
                max_attempts,
            },
            timeout,
            record_dump: snapshot.debug && attempt == 1,
            dump_body: snapshot.dump_body,
            terminal: &terminal,
        };
        let outcome = run_attempt(&builder, ctx, plan, &mut dump)
            .instrument(span)
            .await;

        match outcome {
            Ok(mut response) => {
                let status = response.status();
                if retry_policy.is_retryable_status(status)
                    && configured.allows(retries_used)
                    && replayable
                {
                    let delay = retry_policy.delay_for_status(retries_used + 1, response.headers());
                    warn!(
                        status = status.as_u16(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying request after retryable status"
                    );
                    drop(response);
                    pause_before_retry(&builder, ctx, delay, attempt + 1).await?;
                    retries_used += 1;
                    attempt += 1;
                    continue;
                }

                response.set_attempts(attempt);
                response.set_dump(dump);
                debug!(
                    status = status.as_u16(),
                    attempts = attempt,
                    "request completed"
                );
                if snapshot.debug {
                    info!(
                        method = %builder.method_text(),
                        url = %redact_uri_for_logs(response.url()),
                        status = status.as_u16(),
                        timings = %response.timings(),
                        "request timings"
                    );
                }
                return Ok(response);
            }
            Err(error) => {
                if !error.is_retryable() {
                    return Err(error);
                }
                let within_budget = configured.allows(retries_used);
                let bonus = !within_budget
                    && !bonus_used
                    && error.transport_kind() == Some(TransportErrorKind::ConnectionClosed);
                if !within_budget && !bonus {
                    return Err(error);
                }
                if !replayable {
                    let (method, url) = call_identity(&builder);
                    return Err(Error::UnseekableBody {
                        method,
                        url,
                        source: Box::new(error),
                    });
                }

                let delay = if bonus {
                    bonus_used = true;
                    Duration::ZERO
                } else {
                    retries_used += 1;
                    retry_policy.backoff_for_retry(retries_used)
                };
                warn!(
                    attempt,
                    bonus,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying request after error"
                );
                drop(error);
                pause_before_retry(&builder, ctx, delay, attempt + 1).await?;
                attempt += 1;
            }
        }
    }
}
