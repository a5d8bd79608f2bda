use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::client::transport::{CustomTransport, Transport, TransportOptions, build_hyper_transport};
use crate::config::{
    DEFAULT_MAX_IDLE_PER_HOST, DEFAULT_TCP_KEEPALIVE, DEFAULT_TIMEOUT, SettingsConfig,
};
use crate::context::CallContext;
use crate::cookie::CookieJar;
use crate::middleware::MiddlewareChain;
use crate::proxy::ProxyConfig;
use crate::redirect::RedirectPolicy;
use crate::request::RequestBuilder;
use crate::retry::{Retries, RetryPolicy};
use crate::util::{read_unpoisoned, write_unpoisoned};
use crate::ReqflowResult;

pub(crate) const DEFAULT_USER_AGENT: &str = concat!("reqflow/", env!("CARGO_PKG_VERSION"));

struct SettingsState {
    timeout: Duration,
    retries: Retries,
    user_agent: Option<String>,
    debug: bool,
    dump_body: bool,
    gzip: bool,
    retry_policy: RetryPolicy,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    proxy: Option<ProxyConfig>,
    transport: Option<CustomTransport>,
    redirect_policy: RedirectPolicy,
    cookie_jar: Option<Arc<CookieJar>>,
    tcp_keepalive: Option<Duration>,
    pool_idle_timeout: Option<Duration>,
    pool_max_idle_per_host: usize,
    handle: Option<Arc<ClientHandle>>,
}

impl SettingsState {
    fn default_transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: Some(self.timeout),
            tcp_keepalive: self.tcp_keepalive,
            pool_idle_timeout: Some(self.pool_idle_timeout.unwrap_or(self.timeout)),
            pool_max_idle_per_host: Some(self.pool_max_idle_per_host),
            tls_config: self.tls_config.clone(),
            proxy: self.proxy.clone(),
        }
    }

    fn build_handle(&self) -> ReqflowResult<ClientHandle> {
        let transport: Arc<dyn Transport> = match &self.transport {
            Some(CustomTransport::Custom(transport)) => Arc::clone(transport),
            Some(CustomTransport::Hyper(options)) => {
                let mut options = options.clone();
                if options.tls_config.is_none() {
                    options.tls_config = self.tls_config.clone();
                }
                if options.proxy.is_none() {
                    options.proxy = self.proxy.clone();
                }
                Arc::new(build_hyper_transport(&options)?)
            }
            None => Arc::new(build_hyper_transport(&self.default_transport_options())?),
        };
        debug!(
            timeout_ms = self.timeout.as_millis() as u64,
            proxy = self.proxy.as_ref().map(|proxy| proxy.uri().to_string()),
            custom_transport = self.transport.is_some(),
            cookies = self.cookie_jar.is_some(),
            "built http transport"
        );
        Ok(ClientHandle {
            transport,
            redirect_policy: self.redirect_policy,
            cookie_jar: self.cookie_jar.clone(),
        })
    }
}

/// Built transport plus the per-client policies that travel with it.
pub(crate) struct ClientHandle {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) redirect_policy: RedirectPolicy,
    pub(crate) cookie_jar: Option<Arc<CookieJar>>,
}

/// Values read once per logical call.
#[derive(Clone, Debug)]
pub(crate) struct SettingsSnapshot {
    pub(crate) timeout: Duration,
    pub(crate) retries: Retries,
    pub(crate) user_agent: String,
    pub(crate) debug: bool,
    pub(crate) dump_body: bool,
    pub(crate) gzip: bool,
    pub(crate) retry_policy: RetryPolicy,
}

/// Reusable client configuration and factory for [`RequestBuilder`]s.
///
/// Cloning is cheap and clones share state: a mutator called through one
/// clone is visible to every other. The underlying transport is built on
/// first use and cached until a mutator changes a property it depends on
/// (timeout, TLS, proxy, transport, redirect policy or cookies).
#[derive(Clone)]
pub struct ClientSettings {
    state: Arc<RwLock<SettingsState>>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientSettings {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = read_unpoisoned(&self.state);
        formatter
            .debug_struct("ClientSettings")
            .field("timeout", &state.timeout)
            .field("retries", &state.retries)
            .field("user_agent", &state.user_agent)
            .field("debug", &state.debug)
            .field("gzip", &state.gzip)
            .field("proxy", &state.proxy)
            .field("redirect_policy", &state.redirect_policy)
            .field("cookies", &state.cookie_jar.is_some())
            .finish()
    }
}

impl ClientSettings {
    pub fn new() -> Self {
        Self::from_state(SettingsState {
            timeout: DEFAULT_TIMEOUT,
            retries: Retries::NONE,
            user_agent: None,
            debug: false,
            dump_body: true,
            gzip: true,
            retry_policy: RetryPolicy::standard(),
            tls_config: None,
            proxy: ProxyConfig::from_env(),
            transport: None,
            redirect_policy: RedirectPolicy::follow(),
            cookie_jar: None,
            tcp_keepalive: Some(DEFAULT_TCP_KEEPALIVE),
            pool_idle_timeout: None,
            pool_max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            handle: None,
        })
    }

    /// Settings from a deserialized document. An explicit `proxy` replaces the
    /// environment proxy.
    pub fn from_config(config: &SettingsConfig) -> ReqflowResult<Self> {
        let config = config.resolved();
        let proxy = match &config.proxy {
            Some(proxy_url) => Some(ProxyConfig::new(proxy_url)?.no_proxy(&config.no_proxy)?),
            None => ProxyConfig::from_env(),
        };
        Ok(Self::from_state(SettingsState {
            timeout: config.timeout(),
            retries: config.default_retries(),
            user_agent: config.user_agent.clone(),
            debug: config.debug,
            dump_body: config.dump_body,
            gzip: config.gzip,
            retry_policy: config.retry_policy(),
            tls_config: None,
            proxy,
            transport: None,
            redirect_policy: config.redirect_policy(),
            cookie_jar: config.enable_cookie.then(|| Arc::new(CookieJar::default())),
            tcp_keepalive: config.tcp_keepalive(),
            pool_idle_timeout: config.pool_idle_timeout(),
            pool_max_idle_per_host: config.pool_max_idle_per_host,
            handle: None,
        }))
    }

    fn from_state(state: SettingsState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    fn update(&self, invalidates_transport: bool, apply: impl FnOnce(&mut SettingsState)) -> &Self {
        let mut state = write_unpoisoned(&self.state);
        apply(&mut state);
        if invalidates_transport {
            state.handle = None;
        }
        self
    }

    /// Default per-attempt timeout; zero disables it. Also bounds connect
    /// and idle pooled connections.
    pub fn set_timeout(&self, timeout: Duration) -> &Self {
        self.update(true, |state| state.timeout = timeout)
    }

    pub fn set_default_retries(&self, retries: impl Into<Retries>) -> &Self {
        let retries = retries.into();
        self.update(false, |state| state.retries = retries)
    }

    pub fn set_user_agent(&self, user_agent: impl Into<String>) -> &Self {
        let user_agent = user_agent.into();
        self.update(false, |state| state.user_agent = Some(user_agent))
    }

    /// Records a request dump on the response and logs per-attempt timings.
    pub fn set_debug(&self, debug: bool) -> &Self {
        self.update(false, |state| state.debug = debug)
    }

    pub fn set_dump_body(&self, dump_body: bool) -> &Self {
        self.update(false, |state| state.dump_body = dump_body)
    }

    pub fn set_gzip(&self, gzip: bool) -> &Self {
        self.update(false, |state| state.gzip = gzip)
    }

    pub fn set_retry_policy(&self, retry_policy: RetryPolicy) -> &Self {
        self.update(false, |state| state.retry_policy = retry_policy)
    }

    pub fn set_tls_config(&self, tls_config: Arc<rustls::ClientConfig>) -> &Self {
        self.update(true, |state| state.tls_config = Some(tls_config))
    }

    pub fn set_proxy(&self, proxy: ProxyConfig) -> &Self {
        self.update(true, |state| state.proxy = Some(proxy))
    }

    pub fn clear_proxy(&self) -> &Self {
        self.update(true, |state| state.proxy = None)
    }

    pub fn set_transport(&self, transport: CustomTransport) -> &Self {
        self.update(true, |state| state.transport = Some(transport))
    }

    pub fn set_redirect_policy(&self, redirect_policy: RedirectPolicy) -> &Self {
        self.update(true, |state| state.redirect_policy = redirect_policy)
    }

    pub fn set_follow_redirects(&self, follow: bool) -> &Self {
        let policy = if follow {
            RedirectPolicy::follow()
        } else {
            RedirectPolicy::none()
        };
        self.set_redirect_policy(policy)
    }

    pub fn set_enable_cookie(&self, enable: bool) -> &Self {
        self.update(true, |state| {
            if !enable {
                state.cookie_jar = None;
            } else if state.cookie_jar.is_none() {
                state.cookie_jar = Some(Arc::new(CookieJar::default()));
            }
        })
    }

    pub fn timeout(&self) -> Duration {
        read_unpoisoned(&self.state).timeout
    }

    pub fn default_retries(&self) -> Retries {
        read_unpoisoned(&self.state).retries
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        read_unpoisoned(&self.state).redirect_policy
    }

    pub fn proxy(&self) -> Option<ProxyConfig> {
        read_unpoisoned(&self.state).proxy.clone()
    }

    pub(crate) fn snapshot(&self) -> SettingsSnapshot {
        let state = read_unpoisoned(&self.state);
        SettingsSnapshot {
            timeout: state.timeout,
            retries: state.retries,
            user_agent: state
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_owned()),
            debug: state.debug,
            dump_body: state.dump_body,
            gzip: state.gzip,
            retry_policy: state.retry_policy.clone(),
        }
    }

    pub(crate) fn user_agent(&self) -> String {
        read_unpoisoned(&self.state)
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_owned())
    }

    /// Cached handle, built under the write lock when missing. The check is
    /// repeated after taking the write lock so racing callers build once.
    pub(crate) fn handle(&self) -> ReqflowResult<Arc<ClientHandle>> {
        if let Some(handle) = &read_unpoisoned(&self.state).handle {
            return Ok(Arc::clone(handle));
        }
        let mut state = write_unpoisoned(&self.state);
        if let Some(handle) = &state.handle {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(state.build_handle()?);
        state.handle = Some(Arc::clone(&handle));
        Ok(handle)
    }

    pub fn request(&self, method: &str, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), MiddlewareChain::new(), method, url.into())
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder {
        self.request("GET", url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder {
        self.request("POST", url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder {
        self.request("PUT", url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder {
        self.request("PATCH", url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder {
        self.request("DELETE", url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder {
        self.request("HEAD", url)
    }

    /// Builder pre-populated with the context's forwarded headers.
    pub fn context_request(
        &self,
        ctx: &CallContext,
        method: &str,
        url: impl Into<String>,
    ) -> RequestBuilder {
        let mut builder = self.request(method, url);
        for (name, value) in ctx.forwarded_headers() {
            builder = builder.header_value(name.clone(), value.clone());
        }
        builder
    }
}
