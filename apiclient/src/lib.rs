// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transport clients for the agent communication protocol.
//!
//! [`ApiClient`] binds a [`reqwest::Client`] to one CA or AP host and
//! exposes a function per JSON endpoint. The WebSocket message channel
//! and the UDP heartbeat live in their own modules and build their own
//! addresses; the HTTP client only ever speaks `http(s)`. All three
//! share the deployment knobs carried by [`ApiClientConfig`]: plaintext
//! for local test servers, static DNS overrides for split-horizon
//! setups, and a certificate-verification bypass for self-signed test
//! CAs.

use std::{net::SocketAddr, time::Duration};

use reqwest::{Client, ClientBuilder};
use thiserror::Error;

pub mod ap_api;
pub mod heartbeat;
pub mod oss_api;
pub mod ws;

#[derive(Error, Debug)]
pub enum ApiClientInitError {
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client bound to one server. Endpoint methods live in
/// [`ap_api`] and [`oss_api`].
pub struct ApiClient {
    client: Client,
    base_url: String,
    use_tls: bool,
}

impl ApiClient {
    /// Creates a client for `base_url` (`host[:port]`, no scheme) with
    /// TLS on. Use [`ApiClient::builder`] for the test-server knobs.
    pub fn initialize(base_url: impl Into<String>) -> Result<Self, ApiClientInitError> {
        Self::builder(base_url).build()
    }

    pub fn builder(base_url: impl Into<String>) -> ApiClientConfig {
        ApiClientConfig {
            base_url: base_url.into(),
            use_tls: true,
            dns_overrides: Vec::new(),
            accept_invalid_certs: false,
        }
    }

    /// Absolute URL of an endpoint on this server.
    fn endpoint_url(&self, endpoint: &str) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}{endpoint}", self.base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }
}

/// Deployment knobs shared by every request the client will make.
pub struct ApiClientConfig {
    base_url: String,
    use_tls: bool,
    dns_overrides: Vec<(String, SocketAddr)>,
    accept_invalid_certs: bool,
}

impl ApiClientConfig {
    /// Plaintext `http` instead of `https`; local test servers only.
    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Pins hostnames to fixed addresses, bypassing system DNS.
    pub fn with_dns_overrides(mut self, overrides: Vec<(String, SocketAddr)>) -> Self {
        self.dns_overrides = overrides;
        self
    }

    /// Accepts self-signed certificates; test servers only.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn build(self) -> Result<ApiClient, ApiClientInitError> {
        let mut builder = ClientBuilder::new()
            .user_agent(acpcommon::CLIENT_INFO)
            .timeout(DEFAULT_REQUEST_TIMEOUT);
        for (domain, addr) in &self.dns_overrides {
            builder = builder.resolve(domain, *addr);
        }
        if self.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;
        Ok(ApiClient {
            client,
            base_url: self.base_url,
            use_tls: self.use_tls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls_follow_the_tls_switch() {
        let client = ApiClient::initialize("ap.ex.com").unwrap();
        assert_eq!(
            client.endpoint_url("/api/accesspoint/sign_in"),
            "https://ap.ex.com/api/accesspoint/sign_in"
        );

        let client = ApiClient::builder("127.0.0.1:9420")
            .use_tls(false)
            .build()
            .unwrap();
        assert_eq!(
            client.endpoint_url("/api/oss/upload_file"),
            "http://127.0.0.1:9420/api/oss/upload_file"
        );
    }
}
