//! Per-attempt timing instrumentation.
//!
//! Each attempt owns a [`Timeline`]. The engine scopes it as a task-local
//! around the transport call so the resolver and connector layers can stamp
//! DNS and connect phases, while the request body stamps the write phase.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Uri;
use http_body::{Body, Frame, SizeHint};
use hyper_util::client::legacy::connect::dns::{GaiAddrs, GaiFuture, GaiResolver, Name};
use tower_service::Service;

use crate::body::{BoxBodyError, WireBody};
use crate::util::lock_unpoisoned;

tokio::task_local! {
    static ATTEMPT_TIMELINE: Arc<Timeline>;
}

/// Timing breakdown of one exchange attempt.
///
/// `None` means the phase was never observed, e.g. `write` for a request
/// that failed while connecting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timings {
    pub total: Duration,
    pub dns: Option<Duration>,
    pub connect: Option<Duration>,
    pub reused: bool,
    pub write: Option<Duration>,
    pub wait: Option<Duration>,
}

impl std::fmt::Display for Timings {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "total={}/dns={}/conn={}/reused={}/write={}/wait={}",
            format_duration(Some(self.total)),
            format_duration(self.dns),
            format_duration(self.connect),
            self.reused,
            format_duration(self.write),
            format_duration(self.wait),
        )
    }
}

pub(crate) fn format_duration(duration: Option<Duration>) -> String {
    let Some(duration) = duration else {
        return "?".to_owned();
    };
    if duration.is_zero() {
        return "0".to_owned();
    }
    let millis = duration.as_millis();
    if millis > 0 {
        return format!("{millis}ms");
    }
    format!("{}µs", duration.as_micros().max(1))
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Phase {
    DnsStart,
    DnsDone,
    ConnectStart,
    ConnectDone,
    WriteDone,
    FirstByte,
}

#[derive(Debug, Default)]
struct Marks {
    dns_start: Option<Instant>,
    dns_done: Option<Instant>,
    connect_start: Option<Instant>,
    connect_done: Option<Instant>,
    write_done: Option<Instant>,
    first_byte: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct Timeline {
    started: Instant,
    marks: Mutex<Marks>,
}

impl Timeline {
    pub(crate) fn start() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            marks: Mutex::new(Marks::default()),
        })
    }

    /// Records the first occurrence of `phase`; later marks are ignored.
    pub(crate) fn mark(&self, phase: Phase) {
        let now = Instant::now();
        let mut marks = lock_unpoisoned(&self.marks);
        let slot = match phase {
            Phase::DnsStart => &mut marks.dns_start,
            Phase::DnsDone => &mut marks.dns_done,
            Phase::ConnectStart => &mut marks.connect_start,
            Phase::ConnectDone => &mut marks.connect_done,
            Phase::WriteDone => &mut marks.write_done,
            Phase::FirstByte => &mut marks.first_byte,
        };
        if slot.is_none() {
            *slot = Some(now);
        }
    }

    /// Builds the breakdown so far. A phase that started but never finished
    /// is charged with the time elapsed until now.
    pub(crate) fn snapshot(&self, host_is_ip: bool) -> Timings {
        let now = Instant::now();
        let marks = lock_unpoisoned(&self.marks);
        let reused = marks.connect_start.is_none() && marks.first_byte.is_some();

        let span = |from: Option<Instant>, to: Option<Instant>| -> Option<Duration> {
            let from = from?;
            Some(to.unwrap_or(now).saturating_duration_since(from))
        };

        let dns = match marks.dns_start {
            Some(_) => span(marks.dns_start, marks.dns_done),
            None if host_is_ip || reused => Some(Duration::ZERO),
            None => None,
        };
        let connect = if reused {
            Some(Duration::ZERO)
        } else {
            span(marks.dns_done.or(marks.connect_start), marks.connect_done)
        };
        let write_anchor = marks
            .connect_done
            .or(reused.then_some(self.started));
        let write = marks.write_done.and_then(|done| span(write_anchor, Some(done)));
        let wait = marks.first_byte.map(|first_byte| {
            let anchor = marks
                .write_done
                .or(marks.connect_done)
                .unwrap_or(self.started);
            first_byte.saturating_duration_since(anchor)
        });

        Timings {
            total: now.saturating_duration_since(self.started),
            dns,
            connect,
            reused,
            write,
            wait,
        }
    }
}

/// Slot carried in request extensions holding the timeline of the exchange
/// currently in flight, so a deadline firing outside the exchange can still
/// report how far it got.
#[derive(Clone, Debug)]
pub(crate) struct TimelineCell(Arc<Mutex<Arc<Timeline>>>);

impl TimelineCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(Timeline::start())))
    }

    /// Starts a fresh timeline for a new exchange and returns it.
    pub(crate) fn restart(&self) -> Arc<Timeline> {
        let timeline = Timeline::start();
        *lock_unpoisoned(&self.0) = Arc::clone(&timeline);
        timeline
    }

    pub(crate) fn current(&self) -> Arc<Timeline> {
        Arc::clone(&lock_unpoisoned(&self.0))
    }
}

pub(crate) fn current_timeline() -> Option<Arc<Timeline>> {
    ATTEMPT_TIMELINE.try_with(Arc::clone).ok()
}

/// Runs `future` with `timeline` visible to the connector stack.
pub(crate) async fn instrument<F>(timeline: Arc<Timeline>, future: F) -> F::Output
where
    F: Future,
{
    ATTEMPT_TIMELINE.scope(timeline, future).await
}

pub(crate) fn is_ip_literal(uri: &Uri) -> bool {
    uri.host()
        .map(|host| {
            host.trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<std::net::IpAddr>()
                .is_ok()
        })
        .unwrap_or(false)
}

/// Getaddrinfo resolver that stamps DNS start/done on the current attempt.
#[derive(Clone)]
pub(crate) struct TimedResolver {
    inner: GaiResolver,
}

impl TimedResolver {
    pub(crate) fn new() -> Self {
        Self {
            inner: GaiResolver::new(),
        }
    }
}

impl Service<Name> for TimedResolver {
    type Response = GaiAddrs;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<GaiAddrs, std::io::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let timeline = current_timeline();
        if let Some(timeline) = &timeline {
            timeline.mark(Phase::DnsStart);
        }
        let resolving: GaiFuture = self.inner.call(name);
        Box::pin(async move {
            let resolved = resolving.await;
            if let Some(timeline) = timeline {
                timeline.mark(Phase::DnsDone);
            }
            resolved
        })
    }
}

/// Outermost connector layer: stamps connect start/done (TLS included) and
/// keeps the attempt's timeline in scope while the inner layers run.
#[derive(Clone)]
pub(crate) struct TimedConnector<C> {
    inner: C,
}

impl<C> TimedConnector<C> {
    pub(crate) fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C> Service<Uri> for TimedConnector<C>
where
    C: Service<Uri>,
    C::Future: Send + 'static,
    C::Response: Send + 'static,
    C::Error: Send + 'static,
{
    type Response = C::Response;
    type Error = C::Error;
    type Future = Pin<Box<dyn Future<Output = Result<C::Response, C::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let Some(timeline) = current_timeline() else {
            return Box::pin(self.inner.call(dst));
        };
        timeline.mark(Phase::ConnectStart);
        let connecting = ATTEMPT_TIMELINE.scope(Arc::clone(&timeline), self.inner.call(dst));
        Box::pin(async move {
            let connected = connecting.await;
            if connected.is_ok() {
                timeline.mark(Phase::ConnectDone);
            }
            connected
        })
    }
}

/// Request body wrapper that stamps the moment the last frame is handed to
/// the connection.
pub(crate) struct TimedBody {
    inner: WireBody,
    timeline: Arc<Timeline>,
}

impl TimedBody {
    pub(crate) fn new(inner: WireBody, timeline: Arc<Timeline>) -> Self {
        Self { inner, timeline }
    }
}

impl Body for TimedBody {
    type Data = Bytes;
    type Error = BoxBodyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.timeline.mark(Phase::WriteDone),
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => {
                this.timeline.mark(Phase::WriteDone);
            }
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        let end = self.inner.is_end_stream();
        if end {
            self.timeline.mark(Phase::WriteDone);
        }
        end
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
