//! Shared plumbing for the HTTP-backed adapters

use super::Provider;
use crate::error::DataError;
use std::io::ErrorKind;

/// Wrap a transport or status error, flagging the retryable ones
///
/// Failures to reach the host at all become [`DataError::Connection`].
pub(crate) fn http_error(provider: Provider, context: impl Into<String>, err: ureq::Error) -> DataError {
    let unreachable = match &err {
        ureq::Error::ConnectionFailed | ureq::Error::HostNotFound => true,
        ureq::Error::Io(io) => matches!(
            io.kind(),
            ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable | ErrorKind::NotConnected
        ),
        _ => false,
    };
    if unreachable {
        return DataError::Connection {
            target: provider.to_string(),
            reason: format!("{}: {}", context.into(), err),
        };
    }
    let transient = match &err {
        ureq::Error::StatusCode(code) => matches!(code, 408 | 429 | 502 | 503 | 504),
        ureq::Error::Io(_) | ureq::Error::Timeout(_) => true,
        _ => false,
    };
    if transient {
        DataError::transient(provider, context, err)
    } else {
        DataError::adapter(provider, context, err)
    }
}

/// Strip a trailing slash so paths can be appended with `format!`
pub(crate) fn base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Translate a SQL `LIKE` pattern into an anchored regular expression
pub(crate) fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_to_regex() {
        assert_eq!(like_to_regex("acme%"), "^acme.*$");
        assert_eq!(like_to_regex("a_c"), "^a.c$");
        assert_eq!(like_to_regex("1.5%"), "^1\\.5.*$");
    }

    #[test]
    fn test_status_classification() {
        assert!(http_error(Provider::Supabase, "select", ureq::Error::StatusCode(503)).is_retryable());
        assert!(!http_error(Provider::Supabase, "select", ureq::Error::StatusCode(400)).is_retryable());
    }

    #[test]
    fn test_unreachable_host_is_a_connection_error() {
        let err = http_error(Provider::MongoDb, "find on projects", ureq::Error::ConnectionFailed);
        assert!(matches!(err, DataError::Connection { .. }));
        assert_eq!(err.kind(), "connection");
        assert_eq!(
            http_error(Provider::Supabase, "select", ureq::Error::HostNotFound).kind(),
            "connection"
        );
        let refused = std::io::Error::new(ErrorKind::ConnectionRefused, "refused");
        assert_eq!(http_error(Provider::Supabase, "select", ureq::Error::Io(refused)).kind(), "connection");
        let reset = std::io::Error::new(ErrorKind::ConnectionReset, "reset");
        assert!(http_error(Provider::Supabase, "select", ureq::Error::Io(reset)).is_retryable());
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("https://x.supabase.co/"), "https://x.supabase.co");
    }
}
