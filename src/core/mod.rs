pub(crate) mod config;
pub(crate) mod content_encoding;
pub(crate) mod error;
pub(crate) mod proxy;
pub(crate) mod redirect;
pub(crate) mod retry;
pub(crate) mod util;
