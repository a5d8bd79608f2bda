use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use cookie::Cookie;
use http::header::{HeaderValue, SET_COOKIE};
use http::{HeaderMap, Uri};
use tracing::debug;

use crate::util::lock_unpoisoned;

#[derive(Clone, Debug)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    host_only: bool,
    path: String,
    secure: bool,
    expires: Option<SystemTime>,
}

impl StoredCookie {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    fn matches(&self, host: &str, path: &str, https: bool) -> bool {
        let domain_matches = if self.host_only {
            host == self.domain
        } else {
            host == self.domain || host.ends_with(&format!(".{}", self.domain))
        };
        let path_matches = path == self.path
            || (path.starts_with(&self.path)
                && (self.path.ends_with('/') || path[self.path.len()..].starts_with('/')));
        domain_matches && path_matches && (https || !self.secure)
    }
}

/// In-memory cookie store shared by every request of one `ClientSettings`.
#[derive(Debug, Default)]
pub(crate) struct CookieJar {
    cookies: Mutex<Vec<StoredCookie>>,
}

impl CookieJar {
    pub(crate) fn store(&self, uri: &Uri, headers: &HeaderMap) {
        let Some(host) = uri.host().map(str::to_ascii_lowercase) else {
            return;
        };
        let now = SystemTime::now();
        let mut cookies = lock_unpoisoned(&self.cookies);
        for raw in headers.get_all(SET_COOKIE) {
            let Ok(raw) = raw.to_str() else {
                continue;
            };
            let Some(cookie) = parse_set_cookie(raw, &host, uri.path(), now) else {
                continue;
            };
            cookies.retain(|existing| {
                !(existing.name == cookie.name
                    && existing.domain == cookie.domain
                    && existing.path == cookie.path)
            });
            if !cookie.is_expired(now) {
                cookies.push(cookie);
            }
        }
    }

    /// `Cookie` header value for `uri`, or `None` when nothing matches.
    pub(crate) fn header_for(&self, uri: &Uri) -> Option<HeaderValue> {
        let host = uri.host()?.to_ascii_lowercase();
        let https = uri
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"));
        let now = SystemTime::now();
        let mut cookies = lock_unpoisoned(&self.cookies);
        cookies.retain(|cookie| !cookie.is_expired(now));
        let mut matching = cookies
            .iter()
            .filter(|cookie| cookie.matches(&host, uri.path(), https))
            .collect::<Vec<_>>();
        if matching.is_empty() {
            return None;
        }
        matching.sort_by(|left, right| right.path.len().cmp(&left.path.len()));
        let header = matching
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&header).ok()
    }
}

fn default_cookie_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(index) => request_path[..index].to_owned(),
    }
}

/// Validates a `Domain` attribute against the request host. Returns the
/// stored domain and whether the cookie stays host-only, or `None` to reject.
///
/// Single-label domains and IP literals only ever apply to the exact host.
fn cookie_domain(attribute: &str, host: &str) -> Option<(String, bool)> {
    let domain = attribute.trim_start_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return Some((host.to_owned(), true));
    }
    if domain == host {
        let host_only = !domain.contains('.') || domain.parse::<IpAddr>().is_ok();
        return Some((domain, host_only));
    }
    if !domain.contains('.') || host.parse::<IpAddr>().is_ok() {
        return None;
    }
    host.ends_with(&format!(".{domain}"))
        .then_some((domain, false))
}

fn expiry_after(now: SystemTime, seconds: i64) -> Option<SystemTime> {
    if seconds <= 0 {
        return Some(SystemTime::UNIX_EPOCH);
    }
    // An instant past what `SystemTime` can hold never expires.
    now.checked_add(Duration::from_secs(seconds.unsigned_abs()))
}

fn parse_set_cookie(
    raw: &str,
    host: &str,
    request_path: &str,
    now: SystemTime,
) -> Option<StoredCookie> {
    let parsed = match Cookie::parse(raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            debug!(error = %error, "ignoring malformed set-cookie header");
            return None;
        }
    };
    if parsed.name().is_empty() {
        return None;
    }
    let Some((domain, host_only)) = cookie_domain(parsed.domain().unwrap_or_default(), host)
    else {
        debug!(
            cookie = parsed.name(),
            domain = parsed.domain().unwrap_or_default(),
            "rejecting set-cookie for a foreign or public domain"
        );
        return None;
    };
    let path = match parsed.path() {
        Some(path) if path.starts_with('/') => path.to_owned(),
        _ => default_cookie_path(request_path),
    };
    let expires = match (parsed.max_age(), parsed.expires_datetime()) {
        (Some(max_age), _) => expiry_after(now, max_age.whole_seconds()),
        (None, Some(at)) => {
            let seconds = at.unix_timestamp();
            if seconds <= 0 {
                Some(SystemTime::UNIX_EPOCH)
            } else {
                SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(seconds.unsigned_abs()))
            }
        }
        (None, None) => None,
    };
    Some(StoredCookie {
        name: parsed.name().to_owned(),
        value: parsed.value().trim_matches('"').to_owned(),
        domain,
        host_only,
        path,
        secure: parsed.secure().unwrap_or(false),
        expires,
    })
}

#[cfg(test)]
mod tests {
    use http::header::{HeaderValue, SET_COOKIE};
    use http::{HeaderMap, Uri};

    use super::CookieJar;

    fn set_cookies(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(SET_COOKIE, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn stored_cookies_are_sent_back_to_matching_hosts() {
        let jar = CookieJar::default();
        let origin: Uri = "http://api.example.com/login".parse().expect("uri");
        jar.store(
            &origin,
            &set_cookies(&["session=abc; Path=/; HttpOnly", "theme=dark; Domain=example.com"]),
        );

        let same: Uri = "http://api.example.com/items".parse().expect("uri");
        let header = jar.header_for(&same).expect("cookies should match");
        let text = header.to_str().expect("ascii");
        assert!(text.contains("session=abc"));
        assert!(text.contains("theme=dark"));

        let sibling: Uri = "http://www.example.com/".parse().expect("uri");
        let header = jar.header_for(&sibling).expect("domain cookie should match");
        assert_eq!(header.to_str().expect("ascii"), "theme=dark");

        let other: Uri = "http://other.test/".parse().expect("uri");
        assert!(jar.header_for(&other).is_none());
    }

    #[test]
    fn max_age_zero_removes_cookie_and_secure_requires_https() {
        let jar = CookieJar::default();
        let origin: Uri = "https://example.com/".parse().expect("uri");
        jar.store(&origin, &set_cookies(&["token=1; Secure; Path=/"]));
        let plain: Uri = "http://example.com/".parse().expect("uri");
        assert!(jar.header_for(&plain).is_none());
        assert!(jar.header_for(&origin).is_some());

        jar.store(&origin, &set_cookies(&["token=; Max-Age=0; Path=/"]));
        assert!(jar.header_for(&origin).is_none());
    }

    #[test]
    fn foreign_domain_attribute_is_rejected() {
        let jar = CookieJar::default();
        let origin: Uri = "http://example.com/".parse().expect("uri");
        jar.store(&origin, &set_cookies(&["evil=1; Domain=attacker.test"]));
        assert!(jar.header_for(&origin).is_none());
    }

    #[test]
    fn top_level_domain_attribute_is_rejected() {
        let jar = CookieJar::default();
        let origin: Uri = "http://example.com/".parse().expect("uri");
        jar.store(&origin, &set_cookies(&["wide=1; Domain=com", "dotted=1; Domain=.com"]));
        assert!(jar.header_for(&origin).is_none());
        let neighbour: Uri = "http://other.com/".parse().expect("uri");
        assert!(jar.header_for(&neighbour).is_none());
    }

    #[test]
    fn single_label_host_keeps_its_own_cookies() {
        let jar = CookieJar::default();
        let origin: Uri = "http://localhost/".parse().expect("uri");
        jar.store(&origin, &set_cookies(&["local=1; Domain=localhost"]));
        let header = jar.header_for(&origin).expect("host cookie should match");
        assert_eq!(header.to_str().expect("ascii"), "local=1");
    }

    #[test]
    fn huge_max_age_never_expires() {
        let jar = CookieJar::default();
        let origin: Uri = "http://example.com/".parse().expect("uri");
        jar.store(
            &origin,
            &set_cookies(&["a=b; Max-Age=9223372036854775807; Path=/"]),
        );
        let header = jar.header_for(&origin).expect("cookie should be kept");
        assert_eq!(header.to_str().expect("ascii"), "a=b");
    }
}
