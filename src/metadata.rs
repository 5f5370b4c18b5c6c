//! Host identity from the instance-metadata interface.
//!
//! The public address is queried fresh on every run and never cached: a
//! restored state directory may have been written by a different host.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

const TOKEN_PATH: &str = "/latest/api/token";
const PUBLIC_IPV4_PATH: &str = "/latest/meta-data/public-ipv4";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";

#[async_trait]
pub trait HostMetadata: Send + Sync {
    async fn public_address(&self) -> Result<IpAddr>;
}

/// Client for the link-local metadata endpoint.
///
/// Uses a session token when the endpoint issues one and falls back to a
/// token-less request otherwise.
pub struct InstanceMetadata {
    base_url: String,
    client: reqwest::Client,
}

impl InstanceMetadata {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build metadata HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn session_token(&self) -> Option<String> {
        let resp = self
            .client
            .put(format!("{}{}", self.base_url, TOKEN_PATH))
            .header(TOKEN_TTL_HEADER, "300")
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.text().await.ok().map(|t| t.trim().to_string())
    }
}

#[async_trait]
impl HostMetadata for InstanceMetadata {
    async fn public_address(&self) -> Result<IpAddr> {
        let token = self.session_token().await;
        if token.is_none() {
            tracing::debug!("metadata token unavailable, using token-less request");
        }

        let mut request = self
            .client
            .get(format!("{}{}", self.base_url, PUBLIC_IPV4_PATH));
        if let Some(token) = &token {
            request = request.header(TOKEN_HEADER, token);
        }

        let resp = request
            .send()
            .await
            .context("Failed to reach instance metadata service")?;
        if !resp.status().is_success() {
            bail!("Instance metadata returned {} for public address", resp.status());
        }
        let body = resp
            .text()
            .await
            .context("Failed to read instance metadata response")?;

        body.trim()
            .parse::<IpAddr>()
            .with_context(|| format!("Instance metadata returned a non-address: {:?}", body.trim()))
    }
}

/// The externally reachable endpoint for the workload's service port.
pub fn endpoint_for(addr: IpAddr, port: u16) -> String {
    match addr {
        IpAddr::V4(v4) => format!("http://{}:{}/", v4, port),
        IpAddr::V6(v6) => format!("http://[{}]:{}/", v6, port),
    }
}
