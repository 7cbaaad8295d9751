// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! JSON endpoints of the certificate authority and the access point:
//! certificate signing, the two-round sign-in, entry-point discovery and
//! sign-out. The guest certificate endpoint is also served here.

use acpcommon::{AcpError, ErrorCode, RequestId, identifiers::Aid};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ApiClient;

pub const ENDPOINT_SIGN_CERT: &str = "/api/accesspoint/sign_cert";
pub const ENDPOINT_SIGN_IN: &str = "/api/accesspoint/sign_in";
pub const ENDPOINT_SIGN_OUT: &str = "/api/accesspoint/sign_out";
pub const ENDPOINT_AP_CONFIG: &str = "/api/accesspoint/get_accesspoint_config";
pub const ENDPOINT_GUEST_CERT: &str = "/sign_guest_cert";

#[derive(Error, Debug)]
pub enum ApRequestError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("Received a malformed response: {0}")]
    MalformedResponse(String),
    #[error("Unsuccessful response: status = {status}, error = {message}")]
    RequestFailed { status: StatusCode, message: String },
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    #[error("The server rejected the nonce signature")]
    InvalidSignature,
    #[error("The sign-in token has expired")]
    TokenExpired,
}

impl From<ApRequestError> for AcpError {
    fn from(error: ApRequestError) -> Self {
        let code = match &error {
            ApRequestError::Reqwest(e) if e.is_timeout() => ErrorCode::NetworkTimeout,
            ApRequestError::Reqwest(e) if e.is_connect() => ErrorCode::NetworkError,
            ApRequestError::Reqwest(_) => ErrorCode::NetworkError,
            ApRequestError::MalformedResponse(_) => ErrorCode::NetworkError,
            ApRequestError::RequestFailed { status, .. }
                if *status == StatusCode::UNAUTHORIZED =>
            {
                ErrorCode::AuthFailed
            }
            ApRequestError::RequestFailed { .. } => ErrorCode::NetworkError,
            ApRequestError::AuthFailed(_) => ErrorCode::AuthFailed,
            ApRequestError::InvalidSignature => ErrorCode::InvalidSignature,
            ApRequestError::TokenExpired => ErrorCode::TokenExpired,
        };
        AcpError::new(code, error.to_string())
    }
}

#[derive(Debug, Serialize)]
struct SignCertRequest<'a> {
    id: &'a str,
    csr: &'a str,
}

#[derive(Debug, Deserialize)]
struct SignCertResponse {
    certificate: String,
}

#[derive(Debug, Serialize)]
struct SignInInitRequest<'a> {
    agent_id: &'a str,
    request_id: &'a str,
    client_info: &'a str,
}

#[derive(Debug, Deserialize)]
struct SignInInitResponse {
    nonce: String,
}

#[derive(Debug, Serialize)]
struct SignInCompleteRequest<'a> {
    agent_id: &'a str,
    request_id: &'a str,
    nonce: &'a str,
    public_key: &'a str,
    cert: &'a str,
    signature: &'a str,
}

#[derive(Debug, Deserialize)]
struct SignInCompleteResponse {
    signature: String,
}

#[derive(Debug, Serialize)]
struct AgentIdRequest<'a> {
    agent_id: &'a str,
}

#[derive(Debug, Serialize)]
struct SignOutRequest<'a> {
    agent_id: &'a str,
    signature: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApConfigResponse {
    config: String,
}

/// Entry points returned by the access point. The servers are
/// `host[:port]` strings without scheme.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct EntrypointConfig {
    pub heartbeat_server: String,
    pub message_server: String,
}

/// Ephemeral guest identity issued without a CSR.
#[derive(Debug, Clone, Deserialize)]
pub struct GuestCert {
    pub guest_aid: String,
    pub key: String,
    pub cert: String,
}

/// Error body the CA/AP attaches to non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

impl ApiClient {
    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp, ApRequestError> {
        let url = self.endpoint_url(endpoint);
        let response = self.client().post(url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| ApRequestError::MalformedResponse(e.to_string()))
    }

    /// Submits a CSR to the certificate authority and returns the signed
    /// certificate PEM.
    pub async fn sign_cert(&self, aid: &Aid, csr_pem: &str) -> Result<String, ApRequestError> {
        let request = SignCertRequest {
            id: &aid.to_string(),
            csr: csr_pem,
        };
        let response: SignCertResponse = self.post_json(ENDPOINT_SIGN_CERT, &request).await?;
        Ok(response.certificate)
    }

    /// First sign-in round: announces the agent and receives the nonce to
    /// sign.
    pub async fn sign_in_init(
        &self,
        aid: &Aid,
        request_id: &RequestId,
    ) -> Result<String, ApRequestError> {
        let request = SignInInitRequest {
            agent_id: &aid.to_string(),
            request_id: request_id.as_str(),
            client_info: acpcommon::CLIENT_INFO,
        };
        let response: SignInInitResponse = self.post_json(ENDPOINT_SIGN_IN, &request).await?;
        Ok(response.nonce)
    }

    /// Second sign-in round: presents the signed nonce together with the
    /// certificate and receives the session signature token.
    #[allow(clippy::too_many_arguments)]
    pub async fn sign_in_complete(
        &self,
        aid: &Aid,
        request_id: &RequestId,
        nonce: &str,
        public_key_pem: &str,
        cert_pem: &str,
        nonce_signature_hex: &str,
    ) -> Result<String, ApRequestError> {
        let request = SignInCompleteRequest {
            agent_id: &aid.to_string(),
            request_id: request_id.as_str(),
            nonce,
            public_key: public_key_pem,
            cert: cert_pem,
            signature: nonce_signature_hex,
        };
        let response: SignInCompleteResponse = self.post_json(ENDPOINT_SIGN_IN, &request).await?;
        Ok(response.signature)
    }

    /// Fetches the heartbeat and message server entry points for the
    /// agent. The access point wraps the inner config in a JSON string.
    pub async fn get_accesspoint_config(
        &self,
        aid: &Aid,
    ) -> Result<EntrypointConfig, ApRequestError> {
        let request = AgentIdRequest {
            agent_id: &aid.to_string(),
        };
        let response: ApConfigResponse = self.post_json(ENDPOINT_AP_CONFIG, &request).await?;
        serde_json::from_str(&response.config)
            .map_err(|e| ApRequestError::MalformedResponse(e.to_string()))
    }

    /// Invalidates the current signature token.
    pub async fn sign_out(&self, aid: &Aid, signature: &str) -> Result<(), ApRequestError> {
        let request = SignOutRequest {
            agent_id: &aid.to_string(),
            signature,
        };
        let _: serde_json::Value = self.post_json(ENDPOINT_SIGN_OUT, &request).await?;
        Ok(())
    }

    /// Issues an ephemeral guest identity. The key comes back unencrypted;
    /// the caller decides whether to persist it.
    pub async fn sign_guest_cert(&self) -> Result<GuestCert, ApRequestError> {
        let url = self.endpoint_url(ENDPOINT_GUEST_CERT);
        let response = self.client().get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| ApRequestError::MalformedResponse(e.to_string()))
    }
}

/// Maps a non-2xx response to the auth-specific errors where the body
/// carries a protocol error code.
fn classify_failure(status: StatusCode, body: &str) -> ApRequestError {
    if let Ok(error_body) = serde_json::from_str::<ErrorBody>(body) {
        match ErrorCode::try_from(error_body.code) {
            Ok(ErrorCode::AuthFailed) => {
                return ApRequestError::AuthFailed(error_body.message);
            }
            Ok(ErrorCode::InvalidSignature) => return ApRequestError::InvalidSignature,
            Ok(ErrorCode::TokenExpired) => return ApRequestError::TokenExpired,
            _ => {}
        }
        if !error_body.message.is_empty() {
            return ApRequestError::RequestFailed {
                status,
                message: error_body.message,
            };
        }
    }
    ApRequestError::RequestFailed {
        status,
        message: body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, method, path},
    };

    use super::*;

    async fn client_for(server: &MockServer) -> ApiClient {
        let base = server.uri().trim_start_matches("http://").to_string();
        ApiClient::builder(base).use_tls(false).build().unwrap()
    }

    #[tokio::test]
    async fn sign_cert_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT_SIGN_CERT))
            .and(body_partial_json(serde_json::json!({
                "id": "alice.ex.com",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "certificate": "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n",
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let cert = client.sign_cert(&aid, "-----BEGIN CERTIFICATE REQUEST-----").await.unwrap();
        assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn sign_in_two_rounds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT_SIGN_IN))
            .and(body_partial_json(serde_json::json!({
                "client_info": acpcommon::CLIENT_INFO,
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "nonce": "abc123" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT_SIGN_IN))
            .and(body_partial_json(serde_json::json!({ "nonce": "abc123" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "signature": "token-1" })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let request_id = RequestId::random();

        let nonce = client.sign_in_init(&aid, &request_id).await.unwrap();
        assert_eq!(nonce, "abc123");
        let token = client
            .sign_in_complete(&aid, &request_id, &nonce, "pk", "cert", "deadbeef")
            .await
            .unwrap();
        assert_eq!(token, "token-1");
    }

    #[tokio::test]
    async fn auth_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT_SIGN_IN))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "code": 1002, "message": "token expired",
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let err = client
            .sign_in_init(&aid, &RequestId::random())
            .await
            .unwrap_err();
        assert!(matches!(err, ApRequestError::TokenExpired));
        let acp: AcpError = err.into();
        assert_eq!(acp.code(), ErrorCode::TokenExpired);
    }

    #[tokio::test]
    async fn entrypoint_config_unwraps_inner_json() {
        let server = MockServer::start().await;
        let inner = serde_json::json!({
            "heartbeat_server": "hb.ex.com:9522",
            "message_server": "msg.ex.com",
        })
        .to_string();
        Mock::given(method("POST"))
            .and(path(ENDPOINT_AP_CONFIG))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "config": inner })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let config = client.get_accesspoint_config(&aid).await.unwrap();
        assert_eq!(config.heartbeat_server, "hb.ex.com:9522");
        assert_eq!(config.message_server, "msg.ex.com");
    }
}
