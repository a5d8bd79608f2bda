use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use http::{Request, Response};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};

use crate::body::{WireBody, incoming_wire_body};
use crate::config::{DEFAULT_MAX_IDLE_PER_HOST, DEFAULT_TCP_KEEPALIVE};
use crate::error::{BoxError, Error};
use crate::proxy::{ProxyConfig, ProxyConnector};
use crate::timing::{TimedConnector, TimedResolver};

/// One HTTP exchange: send the request head and body, resolve with the
/// response head. The response body is read by the caller.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request<WireBody>) -> BoxFuture<'static, Result<Response<WireBody>, BoxError>>;
}

/// Knobs for the built-in hyper transport. TLS and proxy fall back to the
/// owning settings when left unset.
#[derive(Clone, Debug, Default)]
pub struct TransportOptions {
    pub connect_timeout: Option<Duration>,
    pub tcp_keepalive: Option<Duration>,
    pub pool_idle_timeout: Option<Duration>,
    pub pool_max_idle_per_host: Option<usize>,
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    pub proxy: Option<ProxyConfig>,
}

impl TransportOptions {
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout);
        self
    }

    pub fn tcp_keepalive(mut self, tcp_keepalive: Duration) -> Self {
        self.tcp_keepalive = Some(tcp_keepalive);
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = Some(pool_idle_timeout);
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = Some(pool_max_idle_per_host);
        self
    }

    pub fn tls_config(mut self, tls_config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }
}

#[derive(Clone)]
pub enum CustomTransport {
    Hyper(TransportOptions),
    /// Used as is; settings never modify it.
    Custom(Arc<dyn Transport>),
}

impl std::fmt::Debug for CustomTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hyper(options) => formatter.debug_tuple("Hyper").field(options).finish(),
            Self::Custom(_) => formatter.write_str("Custom(..)"),
        }
    }
}

type HttpsConnector = hyper_rustls::HttpsConnector<ProxyConnector>;
type HyperClient = Client<TimedConnector<HttpsConnector>, WireBody>;

pub(crate) struct HyperTransport {
    client: HyperClient,
}

impl Transport for HyperTransport {
    fn send(&self, request: Request<WireBody>) -> BoxFuture<'static, Result<Response<WireBody>, BoxError>> {
        let sending = self.client.request(request);
        Box::pin(async move {
            let response = sending.await.map_err(|error| Box::new(error) as BoxError)?;
            Ok(response.map(incoming_wire_body))
        })
    }
}

pub(crate) fn default_tls_config() -> crate::ReqflowResult<Arc<rustls::ClientConfig>> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|source| Error::TlsConfig {
        message: source.to_string(),
    })?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Connector chain, outermost first: timing, TLS, proxy routing, TCP dial.
pub(crate) fn build_hyper_transport(
    options: &TransportOptions,
) -> crate::ReqflowResult<HyperTransport> {
    let tls_config = match &options.tls_config {
        Some(tls_config) => Arc::clone(tls_config),
        None => default_tls_config()?,
    };

    let mut direct = HttpConnector::new_with_resolver(TimedResolver::new());
    direct.enforce_http(false);
    direct.set_nodelay(true);
    direct.set_connect_timeout(options.connect_timeout.filter(|timeout| !timeout.is_zero()));
    direct.set_keepalive(Some(
        options.tcp_keepalive.unwrap_or(DEFAULT_TCP_KEEPALIVE),
    ));

    let proxied = ProxyConnector::new(direct, options.proxy.clone());
    let https = HttpsConnectorBuilder::new()
        .with_tls_config((*tls_config).clone())
        .https_or_http()
        .enable_http1()
        .wrap_connector(proxied);
    let client = Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(options.pool_idle_timeout.filter(|timeout| !timeout.is_zero()))
        .pool_max_idle_per_host(
            options
                .pool_max_idle_per_host
                .unwrap_or(DEFAULT_MAX_IDLE_PER_HOST),
        )
        .build(TimedConnector::new(https));
    Ok(HyperTransport { client })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{TransportOptions, build_hyper_transport, default_tls_config};

    #[test]
    fn default_tls_config_uses_webpki_roots() {
        let config = default_tls_config().expect("default tls config should build");
        assert!(config.alpn_protocols.is_empty());
    }

    #[tokio::test]
    async fn hyper_transport_builds_with_explicit_options() {
        let options = TransportOptions::default()
            .connect_timeout(Duration::from_secs(1))
            .tcp_keepalive(Duration::from_secs(3))
            .pool_max_idle_per_host(2);
        assert!(build_hyper_transport(&options).is_ok());
    }
}
