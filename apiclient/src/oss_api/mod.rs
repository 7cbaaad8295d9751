// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Object storage endpoints. Uploads are multipart form posts; downloads
//! stream to disk without buffering the whole body.

use std::path::Path;

use acpcommon::{AcpError, ErrorCode, identifiers::Aid};
use futures_util::StreamExt;
use reqwest::{StatusCode, multipart};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::ApiClient;

pub const ENDPOINT_UPLOAD_FILE: &str = "/api/oss/upload_file";
pub const ENDPOINT_DOWNLOAD_FILE: &str = "/api/oss/download_file";

#[derive(Error, Debug)]
pub enum OssRequestError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Unsuccessful response: status = {status}, error = {message}")]
    RequestFailed { status: StatusCode, message: String },
}

impl From<OssRequestError> for AcpError {
    fn from(error: OssRequestError) -> Self {
        let code = match &error {
            OssRequestError::Reqwest(e) if e.is_timeout() => ErrorCode::NetworkTimeout,
            OssRequestError::Reqwest(_) | OssRequestError::RequestFailed { .. } => {
                ErrorCode::NetworkError
            }
            OssRequestError::Io(_) => ErrorCode::FileError,
        };
        AcpError::new(code, error.to_string())
    }
}

impl ApiClient {
    /// Uploads a named blob on behalf of the signed-in agent.
    pub async fn oss_upload_file(
        &self,
        aid: &Aid,
        signature: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<(), OssRequestError> {
        let url = self.endpoint_url(ENDPOINT_UPLOAD_FILE);
        let part = multipart::Part::bytes(content).file_name(file_name.to_string());
        let form = multipart::Form::new()
            .text("agent_id", aid.to_string())
            .text("signature", signature.to_string())
            .text("file_name", file_name.to_string())
            .part("file", part);
        let response = self.client().post(url).multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OssRequestError::RequestFailed { status, message });
        }
        Ok(())
    }

    /// Streams a blob into `dest`, chunk by chunk.
    pub async fn oss_download_file(
        &self,
        aid: &Aid,
        signature: &str,
        file_name: &str,
        dest: &Path,
    ) -> Result<u64, OssRequestError> {
        let url = self.endpoint_url(ENDPOINT_DOWNLOAD_FILE);
        let response = self
            .client()
            .get(url)
            .query(&[
                ("file_name", file_name),
                ("agent_id", &aid.to_string()),
                ("signature", signature),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OssRequestError::RequestFailed { status, message });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}
