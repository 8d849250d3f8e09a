//! Header stripping and retry-timing parsing helpers shared by the
//! admission engine.

use std::time::{Duration, SystemTime};

/// Headers pertaining to a single transport hop; never forwarded in either
/// direction (RFC 7230 §6.1 plus the payload-framing set this proxy always
/// recomputes itself).
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "content-encoding",
    "host",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str())
}

/// Remove every hop-by-hop header from a `reqwest`/`axum` header map in
/// place.
pub fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Result of parsing a `Prefer: wait=` header — distinguishes "header
/// absent entirely" (no waiting budget at all) from "present but
/// unparseable" (falls back to the configured default).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PreferWait {
    /// No `Prefer: wait=` token in the request at all.
    Absent,
    /// A non-negative numeric value was found.
    Valid(f64),
    /// A `wait=` token was present but negative or non-numeric.
    Invalid,
}

/// Parse `Prefer: wait=<seconds>`, case-insensitively, trimming whitespace
/// around the `wait=` token.
pub fn parse_prefer_wait(header_value: Option<&str>) -> PreferWait {
    let Some(value) = header_value else {
        return PreferWait::Absent;
    };
    for part in value.split(',') {
        let part = part.trim();
        let lower = part.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("wait=") {
            let rest = rest.trim();
            if let Ok(secs) = rest.parse::<f64>() {
                if secs >= 0.0 && secs.is_finite() {
                    return PreferWait::Valid(secs);
                }
            }
            return PreferWait::Invalid;
        }
    }
    PreferWait::Absent
}

/// Parse a retry-timing header value as either a plain number of seconds or
/// an HTTP-date. Returns `None` if the value is neither.
pub fn parse_retry_seconds(value: &str, now_wall: SystemTime) -> Option<f64> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<f64>() {
        if secs.is_finite() {
            return Some(secs.max(0.0));
        }
    }
    if let Ok(when) = httpdate::parse_http_date(trimmed) {
        let secs = when
            .duration_since(now_wall)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        return Some(secs.max(0.0));
    }
    None
}

/// Scan the standard retry-timing headers in priority order, returning the
/// first one that parses.
pub fn retry_after_from_headers(headers: &http::HeaderMap, now_wall: SystemTime) -> Option<f64> {
    const NAMES: &[&str] = &[
        "retry-after",
        "ratelimit-reset",
        "x-ratelimit-reset",
        "x-rate-limit-reset",
    ];
    for name in NAMES {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            if let Some(secs) = parse_retry_seconds(value, now_wall) {
                return Some(secs);
            }
        }
    }
    None
}

/// Upstream response classification: which retry branch a status code
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    RateLimited,
    TransientError,
    Terminal,
}

pub fn classify(status: u16) -> Classification {
    match status {
        429 | 503 => Classification::RateLimited,
        500 | 502 | 504 => Classification::TransientError,
        _ => Classification::Terminal,
    }
}

/// Fallback `Retry-After` when no upstream header is present, matching the
/// original `compute_fallback_retry_after`: 429 grows linearly, 503
/// exponentially, both jittered and clamped to `[0, 300]`.
///
/// `jitter_sample` must be a value uniformly distributed in `[0.0, 1.0)` —
/// callers supply it (typically via `fastrand::f64()`) so the formula itself
/// stays deterministic and testable.
pub fn fallback_retry_after(
    status: u16,
    attempt: u32,
    base_429: f64,
    base_503: f64,
    jitter_pct: f64,
    jitter_sample: f64,
) -> f64 {
    let raw = match status {
        429 => base_429 * (1.0 + 0.5 * (attempt.min(10) as f64)),
        503 => base_503 * 2f64.powi(attempt.min(6) as i32),
        _ => base_429,
    };
    // jitter_sample in [0,1) maps to U(-jitter_pct, +jitter_pct).
    let jitter = -jitter_pct + 2.0 * jitter_pct * jitter_sample;
    (raw * (1.0 + jitter)).clamp(0.0, 300.0)
}

/// `TransientError` branch backoff: `min(backoff + U(0.1, 0.5), 8.0)`.
pub fn transient_backoff_wait(backoff: f64, jitter_sample: f64) -> f64 {
    let jitter = 0.1 + 0.4 * jitter_sample;
    (backoff + jitter).min(8.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_list_covers_rfc_7230_headers() {
        for name in [
            "Connection",
            "Keep-Alive",
            "Proxy-Authenticate",
            "Proxy-Authorization",
            "TE",
            "Trailer",
            "Transfer-Encoding",
            "Upgrade",
            "Content-Length",
            "Content-Encoding",
            "Host",
        ] {
            assert!(is_hop_by_hop(name), "{name} should be hop-by-hop");
        }
        assert!(!is_hop_by_hop("X-Request-Id"));
    }

    #[test]
    fn strip_hop_by_hop_removes_all_of_them() {
        let mut headers = http::HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("content-length", "42".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("content-length").is_none());
        assert!(headers.get("x-request-id").is_some());
    }

    #[test]
    fn parse_prefer_wait_accepts_case_insensitive_and_whitespace() {
        assert_eq!(parse_prefer_wait(Some("wait=5")), PreferWait::Valid(5.0));
        assert_eq!(parse_prefer_wait(Some(" WAIT = 5.5 ")), PreferWait::Valid(5.5));
        assert_eq!(parse_prefer_wait(Some("respond-async, wait=3")), PreferWait::Valid(3.0));
    }

    #[test]
    fn parse_prefer_wait_distinguishes_absent_from_invalid() {
        assert_eq!(parse_prefer_wait(Some("wait=-1")), PreferWait::Invalid);
        assert_eq!(parse_prefer_wait(Some("wait=soon")), PreferWait::Invalid);
        assert_eq!(parse_prefer_wait(None), PreferWait::Absent);
        assert_eq!(parse_prefer_wait(Some("respond-async")), PreferWait::Absent);
    }

    #[test]
    fn parse_retry_seconds_accepts_numeric() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        assert_eq!(parse_retry_seconds("5", now), Some(5.0));
        assert_eq!(parse_retry_seconds(" 2.5 ", now), Some(2.5));
    }

    #[test]
    fn parse_retry_seconds_accepts_http_date_in_future() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let future = now + Duration::from_secs(120);
        let formatted = httpdate::fmt_http_date(future);
        let parsed = parse_retry_seconds(&formatted, now).unwrap();
        assert!((parsed - 120.0).abs() < 1.0);
    }

    #[test]
    fn parse_retry_seconds_clamps_past_dates_to_zero() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let past = now - Duration::from_secs(120);
        let formatted = httpdate::fmt_http_date(past);
        assert_eq!(parse_retry_seconds(&formatted, now), Some(0.0));
    }

    #[test]
    fn parse_retry_seconds_rejects_garbage() {
        let now = SystemTime::now();
        assert_eq!(parse_retry_seconds("not-a-value", now), None);
    }

    #[test]
    fn retry_after_from_headers_checks_in_priority_order() {
        let now = SystemTime::now();
        let mut headers = http::HeaderMap::new();
        headers.insert("x-ratelimit-reset", "99".parse().unwrap());
        headers.insert("retry-after", "3".parse().unwrap());
        assert_eq!(retry_after_from_headers(&headers, now), Some(3.0));
    }

    #[test]
    fn retry_after_from_headers_falls_through_to_later_header() {
        let now = SystemTime::now();
        let mut headers = http::HeaderMap::new();
        headers.insert("x-rate-limit-reset", "7".parse().unwrap());
        assert_eq!(retry_after_from_headers(&headers, now), Some(7.0));
    }

    #[test]
    fn classify_buckets_status_codes_correctly() {
        assert_eq!(classify(429), Classification::RateLimited);
        assert_eq!(classify(503), Classification::RateLimited);
        assert_eq!(classify(500), Classification::TransientError);
        assert_eq!(classify(502), Classification::TransientError);
        assert_eq!(classify(504), Classification::TransientError);
        assert_eq!(classify(200), Classification::Terminal);
        assert_eq!(classify(404), Classification::Terminal);
    }

    #[test]
    fn fallback_retry_after_429_grows_linearly_and_clamps() {
        // jitter_sample = 0.5 => zero jitter (midpoint of [-pct, +pct])
        let v0 = fallback_retry_after(429, 0, 1.0, 5.0, 0.2, 0.5);
        assert!((v0 - 1.0).abs() < 1e-9);
        let v10 = fallback_retry_after(429, 10, 1.0, 5.0, 0.2, 0.5);
        assert!((v10 - 6.0).abs() < 1e-9); // 1*(1+0.5*10) = 6
        let v_over_cap = fallback_retry_after(429, 100, 1.0, 5.0, 0.2, 0.5);
        assert!((v_over_cap - 6.0).abs() < 1e-9); // min(attempt,10) caps it
    }

    #[test]
    fn fallback_retry_after_503_grows_exponentially_and_clamps_to_300() {
        let v0 = fallback_retry_after(503, 0, 1.0, 5.0, 0.2, 0.5);
        assert!((v0 - 5.0).abs() < 1e-9);
        let v_big = fallback_retry_after(503, 100, 1.0, 5.0, 0.2, 0.5);
        assert!(v_big <= 300.0);
    }

    #[test]
    fn fallback_retry_after_jitter_stays_within_pct_band() {
        let base = fallback_retry_after(429, 2, 1.0, 5.0, 0.2, 0.5);
        let low = fallback_retry_after(429, 2, 1.0, 5.0, 0.2, 0.0);
        let high = fallback_retry_after(429, 2, 1.0, 5.0, 0.2, 0.999999);
        assert!(low < base && base < high);
        assert!((high - low) / base <= 0.41); // ~ +-0.2 band
    }

    #[test]
    fn transient_backoff_wait_caps_at_eight_seconds() {
        assert!(transient_backoff_wait(0.0, 0.0) >= 0.1);
        assert!(transient_backoff_wait(100.0, 1.0) <= 8.0);
    }
}
