//! Admission & Retry Engine — the orchestrator.
//!
//! Given one incoming request, `handle` derives the connection identity,
//! waits for local admission (global + per-connection buckets, subject to
//! the process-wide backpressure pause), forwards upstream, classifies the
//! response, and retries according to the documented asymmetry: a
//! rate-limited retry re-enters local admission (a fresh token is required);
//! a transient-5xx retry re-forwards directly.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::backpressure::Backpressure;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::CoreError;
use crate::fairness::{derive_connection_id, Registry};
use crate::headers::{self, classify, Classification, PreferWait};
use crate::upstream::{UpstreamClient, UpstreamResponse};

/// The three process-wide singletons plus the upstream client and resolved
/// config, threaded through every request handler instead of living as
/// ambient globals.
pub struct CoreContext {
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<Registry>,
    pub backpressure: Arc<Backpressure>,
    pub upstream: Arc<UpstreamClient>,
    pub config: Arc<Config>,
}

impl CoreContext {
    pub fn new(
        clock: Arc<dyn Clock>,
        registry: Arc<Registry>,
        backpressure: Arc<Backpressure>,
        upstream: Arc<UpstreamClient>,
        config: Arc<Config>,
    ) -> Self {
        Self { clock, registry, backpressure, upstream, config }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Derives connection identity, waits for local admission, forwards
/// upstream, classifies the response, and retries. Never returns an `Err` —
/// every path produces a response; errors never bubble past this boundary.
pub async fn handle(
    ctx: &CoreContext,
    method: Method,
    path_and_query: String,
    mut headers: HeaderMap,
    body: Bytes,
    peer_ip: IpAddr,
) -> Response {
    // Step A — identify & register.
    let user_agent = header_str(&headers, "user-agent").unwrap_or("").to_string();
    let connection_id = derive_connection_id(
        header_str(&headers, "x-connection-id"),
        &peer_ip.to_string(),
        &user_agent,
    );

    let now = ctx.clock.now();
    let connection = ctx.registry.touch(&connection_id, now);
    let (actives, rate_each) = ctx.registry.rebalance(now);

    // Step B — determine deadline.
    let prefer_header = header_str(&headers, "prefer");
    let deadline = match headers::parse_prefer_wait(prefer_header) {
        PreferWait::Valid(wait) => Some(now.add_secs(wait)),
        PreferWait::Absent => None,
        PreferWait::Invalid => Some(now.add_secs(ctx.config.prefer_wait_default)),
    };

    let request_id = header_str(&headers, "x-request-id")
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    headers.insert(
        "x-request-id",
        HeaderValue::from_str(&request_id).expect("uuid is valid header value"),
    );

    let mut upstream_retries: u32 = 0;
    let mut attempts: u32 = 0;
    let mut transient_backoff = 1.0_f64;

    'outer: loop {
        // Step C — local admission loop.
        loop {
            attempts += 1;
            let now = ctx.clock.now();

            let (ok_g, wait_g) = {
                let mut global = ctx.registry.global_bucket().lock().expect("global bucket poisoned");
                global.take(1.0, now)
            };
            let (ok_c, wait_c) = {
                let mut bucket = connection.bucket().lock().expect("connection bucket poisoned");
                bucket.take(1.0, now)
            };

            if ok_g && ok_c {
                break;
            }

            let wait = wait_g.max(wait_c).max(ctx.backpressure.remaining(now));

            if let Some(deadline) = deadline {
                if now.add_secs(wait).0 <= deadline.0 {
                    ctx.clock.sleep(wait).await;
                    continue;
                }
            }

            let err = CoreError::LocalAdmissionTimeout {
                wait_required_s: wait,
                attempts,
                active_connections: actives,
                rate_per_connection: rate_each,
            };
            let mut response = err.into_response();
            inject_request_id(&mut response, &request_id);
            return response;
        }

        // Step D — upstream call & classification.
        loop {
            let outbound_headers = headers.clone();
            let result = ctx
                .upstream
                .forward(method.clone(), &path_and_query, outbound_headers, body.clone())
                .await;

            let upstream_response = match result {
                Ok(response) => response,
                Err(e) => {
                    let mut response = CoreError::UpstreamTransportFailure(e.to_string()).into_response();
                    inject_request_id(&mut response, &request_id);
                    return response;
                }
            };

            match classify(upstream_response.status) {
                Classification::Terminal => {
                    return terminal_response(
                        upstream_response,
                        &request_id,
                        upstream_retries,
                        actives,
                        rate_each,
                        ctx,
                    );
                }
                Classification::RateLimited => {
                    let now = ctx.clock.now();
                    let retry_after = headers::retry_after_from_headers(
                        &upstream_response.headers,
                        SystemTime::now(),
                    )
                    .unwrap_or_else(|| {
                        headers::fallback_retry_after(
                            upstream_response.status,
                            upstream_retries,
                            ctx.config.fallback_429_secs,
                            ctx.config.fallback_503_secs,
                            ctx.config.retry_jitter_pct,
                            fastrand::f64(),
                        )
                    });
                    ctx.backpressure.pause(retry_after, now);

                    if let Some(deadline) = deadline {
                        if now.add_secs(retry_after).0 <= deadline.0 {
                            ctx.clock.sleep(retry_after).await;
                            upstream_retries += 1;
                            continue 'outer; // rate-limited retry re-enters local admission
                        }
                    }

                    return rate_limited_exhausted_response(
                        upstream_response,
                        retry_after,
                        &request_id,
                        upstream_retries,
                        actives,
                        rate_each,
                        ctx,
                    );
                }
                Classification::TransientError => {
                    let now = ctx.clock.now();
                    let wait = headers::transient_backoff_wait(transient_backoff, fastrand::f64());

                    if let Some(deadline) = deadline {
                        if now.add_secs(wait).0 <= deadline.0 {
                            ctx.clock.sleep(wait).await;
                            upstream_retries += 1;
                            transient_backoff = (transient_backoff * 2.0).min(8.0);
                            continue; // transient retry re-forwards directly, no fresh token
                        }
                    }

                    return transient_exhausted_response(upstream_response, &request_id, upstream_retries);
                }
            }
        }
    }
}

fn inject_request_id(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
}

fn numeric_header(value: f64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).expect("numeric string is valid header value")
}

fn count_header(value: usize) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).expect("numeric string is valid header value")
}

fn upstream_to_response(upstream: UpstreamResponse) -> Response {
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(response_headers) = builder.headers_mut() {
        *response_headers = upstream.headers;
    }
    builder.body(Body::from(upstream.body)).expect("building response from upstream bytes")
}

fn terminal_response(
    upstream: UpstreamResponse,
    request_id: &str,
    retries: u32,
    actives: usize,
    rate_each: f64,
    ctx: &CoreContext,
) -> Response {
    let global_snapshot = {
        let bucket = ctx.registry.global_bucket().lock().expect("global bucket poisoned");
        (bucket.tokens(), bucket.rate())
    };
    let mut response = upstream_to_response(upstream);
    let headers = response.headers_mut();
    headers.insert("x-retry-attempts", count_header(retries as usize));
    headers.insert("x-active-connections", count_header(actives));
    headers.insert("x-rate-per-connection", numeric_header(rate_each));
    headers.insert("x-ratelimit-remaining-global", numeric_header(global_snapshot.0));
    headers.insert("x-ratelimit-rate-global", numeric_header(global_snapshot.1));
    inject_request_id(&mut response, request_id);
    response
}

fn rate_limited_exhausted_response(
    upstream: UpstreamResponse,
    retry_after: f64,
    request_id: &str,
    retries: u32,
    actives: usize,
    rate_each: f64,
    ctx: &CoreContext,
) -> Response {
    let global_snapshot = {
        let bucket = ctx.registry.global_bucket().lock().expect("global bucket poisoned");
        (bucket.tokens(), bucket.rate())
    };
    let mut response = upstream_to_response(upstream);
    let headers = response.headers_mut();
    headers.insert("x-upstream-retry-after", numeric_header(retry_after));
    headers.insert("x-retry-attempts", count_header(retries as usize));
    headers.insert("x-active-connections", count_header(actives));
    headers.insert("x-rate-per-connection", numeric_header(rate_each));
    headers.insert("x-ratelimit-remaining-global", numeric_header(global_snapshot.0));
    headers.insert("x-ratelimit-rate-global", numeric_header(global_snapshot.1));
    inject_request_id(&mut response, request_id);
    response
}

fn transient_exhausted_response(upstream: UpstreamResponse, request_id: &str, retries: u32) -> Response {
    let mut response = upstream_to_response(upstream);
    response
        .headers_mut()
        .insert("x-retry-attempts", count_header(retries as usize));
    inject_request_id(&mut response, request_id);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::Backpressure;
    use crate::clock::FakeClock;
    use crate::fairness::Registry;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            upstream_base_url: String::new(),
            limit_per_minute: 600.0,
            global_cap: 600.0,
            active_window_secs: 5.0,
            burst_window_secs: 10.0,
            idle_evict_threshold_secs: 300.0,
            prefer_wait_default: 0.0,
            outbound_max_connections: 10,
            outbound_max_keepalive: 10,
            fallback_429_secs: 1.0,
            fallback_503_secs: 5.0,
            retry_jitter_pct: 0.2,
            bind_addr: "0.0.0.0:0".to_string(),
        })
    }

    async fn test_ctx(base_url: String, config: Arc<Config>) -> (CoreContext, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new());
        let registry = Arc::new(Registry::new(
            config.limit_per_minute,
            config.global_cap,
            config.burst_window_secs,
            config.active_window_secs,
            config.idle_evict_threshold_secs,
            clock.now(),
        ));
        let backpressure = Arc::new(Backpressure::new());
        let upstream = Arc::new(
            UpstreamClient::new(base_url, config.outbound_max_connections, config.outbound_max_keepalive)
                .unwrap(),
        );
        let ctx = CoreContext::new(clock.clone() as Arc<dyn Clock>, registry, backpressure, upstream, config);
        (ctx, clock)
    }

    fn peer() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[tokio::test]
    async fn local_rate_limit_with_no_budget_returns_synthesized_429() {
        let mock_server = wiremock::MockServer::start().await;
        let mut config = (*test_config()).clone();
        config.limit_per_minute = 60.0; // 1/sec
        config.global_cap = 1.0; // capacity 1 token
        config.burst_window_secs = 1.0;
        let (ctx, _clock) = test_ctx(mock_server.uri(), Arc::new(config)).await;

        // Drain the global bucket.
        {
            let mut bucket = ctx.registry.global_bucket().lock().unwrap();
            bucket.take(1.0, ctx.clock.now());
        }

        let response = handle(
            &ctx,
            Method::GET,
            "/anything".to_string(),
            HeaderMap::new(),
            Bytes::new(),
            peer(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get("retry-after").is_some());
    }

    #[tokio::test]
    async fn upstream_429_once_then_200_succeeds_within_deadline() {
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/x"))
            .respond_with(
                wiremock::ResponseTemplate::new(429).insert_header("retry-after", "2"),
            )
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/x"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let (ctx, _clock) = test_ctx(mock_server.uri(), test_config()).await;
        let mut headers = HeaderMap::new();
        headers.insert("prefer", "wait=5".parse().unwrap());

        let response = handle(&ctx, Method::GET, "/x".to_string(), headers, Bytes::new(), peer()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-retry-attempts").unwrap(), "1");
    }

    #[tokio::test]
    async fn upstream_429_past_deadline_returns_upstream_429() {
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/x"))
            .respond_with(wiremock::ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&mock_server)
            .await;

        let (ctx, _clock) = test_ctx(mock_server.uri(), test_config()).await;
        let mut headers = HeaderMap::new();
        headers.insert("prefer", "wait=1".parse().unwrap()); // shorter than the 2s retry-after

        let response = handle(&ctx, Method::GET, "/x".to_string(), headers, Bytes::new(), peer()).await;

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("x-upstream-retry-after").unwrap(), "2");
    }

    #[tokio::test]
    async fn transient_5xx_recovers_without_fresh_admission_token() {
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/y"))
            .respond_with(wiremock::ResponseTemplate::new(502))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/y"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let (ctx, _clock) = test_ctx(mock_server.uri(), test_config()).await;
        let mut headers = HeaderMap::new();
        headers.insert("prefer", "wait=10".parse().unwrap());

        let response = handle(&ctx, Method::GET, "/y".to_string(), headers, Bytes::new(), peer()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-retry-attempts").unwrap(), "2");
    }

    #[tokio::test]
    async fn no_prefer_header_means_no_retry_budget() {
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/z"))
            .respond_with(wiremock::ResponseTemplate::new(502))
            .mount(&mock_server)
            .await;

        let (ctx, _clock) = test_ctx(mock_server.uri(), test_config()).await;

        let response = handle(&ctx, Method::GET, "/z".to_string(), HeaderMap::new(), Bytes::new(), peer()).await;

        // No Prefer header => deadline is None => no waiting budget => immediate exhaustion.
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("x-retry-attempts").unwrap(), "0");
    }

    #[tokio::test]
    async fn terminal_response_carries_diagnostic_headers() {
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/ok"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let (ctx, _clock) = test_ctx(mock_server.uri(), test_config()).await;
        let response = handle(&ctx, Method::GET, "/ok".to_string(), HeaderMap::new(), Bytes::new(), peer()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-active-connections").is_some());
        assert!(response.headers().get("x-rate-per-connection").is_some());
        assert!(response.headers().get("x-ratelimit-remaining-global").is_some());
        assert!(response.headers().get("x-request-id").is_some());
    }
}
