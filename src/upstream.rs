//! Upstream forwarding client.
//!
//! A single `reqwest::Client` built once at startup. This proxy is
//! non-streaming (bodies are read to completion and forwarded verbatim), so
//! only one client is needed.
//!
//! `reqwest` has no "max total connections" knob, only a per-host idle-pool
//! size; the semaphore below is the idiomatic workaround.

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use reqwest::{Client, Method};
use tokio::sync::Semaphore;

use crate::headers::{is_hop_by_hop, HOP_BY_HOP};

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

pub struct UpstreamClient {
    client: Client,
    base_url: String,
    connection_limit: std::sync::Arc<Semaphore>,
}

impl UpstreamClient {
    pub fn new(
        base_url: String,
        max_connections: usize,
        max_keepalive: usize,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(max_keepalive)
            .build()
            .context("failed to build upstream reqwest client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            connection_limit: std::sync::Arc::new(Semaphore::new(max_connections)),
        })
    }

    /// Forward one request to the upstream, stripping hop-by-hop headers
    /// inbound. The semaphore permit is held for the duration of the call,
    /// bounding total concurrent outbound connections.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        mut headers: http::HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, reqwest::Error> {
        for name in HOP_BY_HOP {
            headers.remove(*name);
        }

        let _permit = self
            .connection_limit
            .acquire()
            .await
            .expect("upstream connection semaphore closed");

        let url = format!("{}{}", self.base_url, path_and_query);
        let response = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let mut response_headers = response.headers().clone();
        response_headers.retain(|name, _| !is_hop_by_hop(name.as_str()));
        let body = response.bytes().await?;

        Ok(UpstreamResponse { status, headers: response_headers, body })
    }
}
