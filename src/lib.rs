//! `reqflow` is an outbound HTTP/1.x request engine: a fluent request builder,
//! retry with body-aware replay, per-attempt timing and an interceptor chain.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::prelude::{CallContext, ClientSettings};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = ClientSettings::new();
//!     settings
//!         .set_timeout(Duration::from_secs(3))
//!         .set_default_retries(2);
//!
//!     let ctx = CallContext::background().with_trace_id("trace-001");
//!     let item: Item = settings
//!         .post("https://api.example.com/v1/items")
//!         .json(&serde_json::json!({ "name": "demo" }))
//!         .send_json(&ctx)
//!         .await?;
//!
//!     println!("created id={}", item.id);
//!     Ok(())
//! }
//! ```
//!
//! # Retries and bodies
//!
//! - In-memory, seekable and multipart bodies are replayed on retry.
//! - A one-shot stream body disables retries; a failure that would have been
//!   retried is reported as [`Error::UnseekableBody`].
//! - Statuses in the [`RetryPolicy`] set (429, 500, 502, 503, 504 by default)
//!   are retried; once retries run out the last response is returned as is.

mod body;
mod client;
mod context;
mod cookie;
mod core;
mod middleware;
mod multipart;
mod request;
mod response;
mod timing;

pub(crate) use crate::core::{config, content_encoding, error, proxy, redirect, retry, util};

pub use crate::body::{BoxBodyError, RequestBody, SeekableReader, WireBody};
pub use crate::client::{
    AttemptInfo, ClientSettings, CustomTransport, HttpClient, Transport, TransportOptions,
};
pub use crate::config::{ClientProfile, SettingsConfig};
pub use crate::context::CallContext;
pub use crate::error::{DecodeFormat, Error, ErrorClass, ErrorCode, TransportErrorKind};
pub use crate::middleware::{
    AuthInterceptor, DeadlineInterceptor, Exchange, HeaderInterceptor, Interceptor,
    LoggingInterceptor, MiddlewareChain, Next, RetryInterceptor,
};
pub use crate::multipart::MultipartForm;
pub use crate::proxy::ProxyConfig;
pub use crate::redirect::RedirectPolicy;
pub use crate::request::{RequestBuilder, RequestHook};
pub use crate::response::Response;
pub use crate::retry::{Retries, RetryPolicy};
pub use crate::timing::Timings;

pub type ReqflowResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        AuthInterceptor, CallContext, ClientProfile, ClientSettings, Error, ErrorClass, ErrorCode,
        HttpClient, Interceptor, MiddlewareChain, RedirectPolicy, ReqflowResult, RequestBuilder,
        Response, Retries, RetryPolicy, SettingsConfig, Timings,
    };
}

#[cfg(test)]
mod tests;
