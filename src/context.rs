use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{Extensions, HeaderMap};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Caller-supplied context for one logical call.
///
/// Cancellation and deadlines are inherited: a context derived with
/// [`CallContext::with_timeout`] is done when its own deadline passes or when
/// any ancestor is cancelled or expires. Request metadata lives in typed
/// fields, with [`Extensions`] as the escape hatch for ad hoc values.
#[derive(Clone, Debug)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    parent: Option<Arc<CallContext>>,
    trace_id: Option<Arc<str>>,
    forwarded_headers: HeaderMap,
    extensions: Arc<Extensions>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl CallContext {
    /// Root context: never cancelled unless [`CallContext::cancel`] is called
    /// and without deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            parent: None,
            trace_id: None,
            forwarded_headers: HeaderMap::new(),
            extensions: Arc::new(Extensions::new()),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        let trace_id = trace_id.into();
        self.trace_id = if trace_id.is_empty() {
            None
        } else {
            Some(Arc::from(trace_id))
        };
        self
    }

    /// Header copied onto requests created through
    /// `ClientSettings::context_request`.
    pub fn with_forwarded_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.forwarded_headers.append(name, value);
        self
    }

    pub fn with_extension<T>(mut self, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut extensions = (*self.extensions).clone();
        extensions.insert(value);
        self.extensions = Arc::new(extensions);
        self
    }

    /// Child context with its own cancellation handle.
    pub fn with_cancel(&self) -> Self {
        self.derive(self.deadline)
    }

    /// Child context that expires after `timeout`, or earlier if this one does.
    /// A timeout too large to represent as an instant adds no deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.with_cancel(),
        }
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        Self {
            token: self.token.child_token(),
            deadline,
            parent: Some(Arc::new(self.clone())),
            trace_id: self.trace_id.clone(),
            forwarded_headers: self.forwarded_headers.clone(),
            extensions: Arc::clone(&self.extensions),
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Whether the context this one was derived from is already done.
    pub fn parent_done(&self) -> bool {
        self.parent.as_ref().is_some_and(|parent| parent.is_done())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn forwarded_headers(&self) -> &HeaderMap {
        &self.forwarded_headers
    }

    pub fn extension<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.extensions.get::<T>()
    }
}
