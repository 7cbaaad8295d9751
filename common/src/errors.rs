// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Protocol error taxonomy. Every public SDK operation surfaces an
//! [`AcpError`] carrying a numeric [`ErrorCode`] from the fixed ranges of
//! the protocol contract, a human-readable message and optional context.

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric error code. The thousands digit selects the subsystem.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    /// ok
    Ok = 0,

    // 1..=999: generic
    /// invalid argument
    InvalidArgument = 1,
    /// not initialized
    NotInitialized = 2,
    /// not implemented
    NotImplemented = 3,
    /// internal error
    Internal = 4,

    // 1000..=1999: authentication
    /// authentication failed
    AuthFailed = 1000,
    /// invalid signature
    InvalidSignature = 1001,
    /// token expired
    TokenExpired = 1002,
    /// certificate error
    CertError = 1003,

    // 2000..=2999: heartbeat
    /// heartbeat authentication failed
    HbAuthFailed = 2000,
    /// heartbeat timed out
    HbTimeout = 2001,
    /// heartbeat requires re-authentication
    HbReauthRequired = 2002,

    // 3000..=3999: websocket
    /// websocket connect failed
    WsConnectFailed = 3000,
    /// websocket disconnected
    WsDisconnected = 3001,
    /// websocket send failed
    WsSendFailed = 3002,
    /// websocket request timed out
    WsTimeout = 3003,

    // 4000..=4999: identity & session
    /// agent id already exists
    AidAlreadyExists = 4000,
    /// agent id not found
    AidNotFound = 4001,
    /// session closed
    SessionClosed = 4002,
    /// session not found
    SessionNotFound = 4003,
    /// group not found
    GroupNotFound = 4004,

    // 5000..=5999: stream
    /// stream closed
    StreamClosed = 5000,

    // 6000..=6999: file
    /// file error
    FileError = 6000,

    // 7000..=7999: database
    /// database error
    DatabaseError = 7000,

    // 8000..=8999: network
    /// network error
    NetworkError = 8000,
    /// network timeout
    NetworkTimeout = 8001,
    /// dns resolution failed
    DnsFailed = 8002,
    /// tls error
    TlsError = 8003,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn is_auth(self) -> bool {
        (1000..2000).contains(&self.as_u16())
    }

    pub fn is_network(self) -> bool {
        (8000..9000).contains(&self.as_u16())
    }

    /// Errors the supervisor retries under the reconnection policy rather
    /// than surfacing as call failures.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::WsDisconnected
                | ErrorCode::WsConnectFailed
                | ErrorCode::HbTimeout
                | ErrorCode::NetworkError
                | ErrorCode::NetworkTimeout
        )
    }
}

impl From<ErrorCode> for u16 {
    fn from(value: ErrorCode) -> Self {
        value.as_u16()
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown error code: {0}")]
pub struct UnknownErrorCode(pub u16);

impl TryFrom<u16> for ErrorCode {
    type Error = UnknownErrorCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        use ErrorCode::*;
        let code = match value {
            0 => Ok,
            1 => InvalidArgument,
            2 => NotInitialized,
            3 => NotImplemented,
            4 => Internal,
            1000 => AuthFailed,
            1001 => InvalidSignature,
            1002 => TokenExpired,
            1003 => CertError,
            2000 => HbAuthFailed,
            2001 => HbTimeout,
            2002 => HbReauthRequired,
            3000 => WsConnectFailed,
            3001 => WsDisconnected,
            3002 => WsSendFailed,
            3003 => WsTimeout,
            4000 => AidAlreadyExists,
            4001 => AidNotFound,
            4002 => SessionClosed,
            4003 => SessionNotFound,
            4004 => GroupNotFound,
            5000 => StreamClosed,
            6000 => FileError,
            7000 => DatabaseError,
            8000 => NetworkError,
            8001 => NetworkTimeout,
            8002 => DnsFailed,
            8003 => TlsError,
            other => return Err(UnknownErrorCode(other)),
        };
        std::result::Result::Ok(code)
    }
}

/// Structured error returned by every public SDK operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcpError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl AcpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl std::fmt::Display for AcpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_u16(), self.message)?;
        if let Some(context) = &self.context {
            write!(f, " ({context})")?;
        }
        std::result::Result::Ok(())
    }
}

impl std::error::Error for AcpError {}

impl From<ErrorCode> for AcpError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code, code.to_string())
    }
}

impl From<std::io::Error> for AcpError {
    fn from(error: std::io::Error) -> Self {
        Self::new(ErrorCode::FileError, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_ranges() {
        assert!(ErrorCode::TokenExpired.is_auth());
        assert!(ErrorCode::DnsFailed.is_network());
        assert!(!ErrorCode::WsTimeout.is_auth());
        assert!(ErrorCode::WsDisconnected.is_transient());
        assert!(!ErrorCode::CertError.is_transient());
    }

    #[test]
    fn code_round_trip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::AuthFailed,
            ErrorCode::HbReauthRequired,
            ErrorCode::WsTimeout,
            ErrorCode::SessionClosed,
            ErrorCode::FileError,
            ErrorCode::TlsError,
        ] {
            assert_eq!(ErrorCode::try_from(code.as_u16()).unwrap(), code);
        }
        assert!(ErrorCode::try_from(999).is_err());
    }

    #[test]
    fn display_includes_code_and_context() {
        let err = AcpError::new(ErrorCode::AidNotFound, "no such agent")
            .with_context("alice.ex.com");
        assert_eq!(err.to_string(), "[4001] no such agent (alice.ex.com)");
    }
}
