// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Capability handle to the message channel. Sub-APIs (sessions, groups)
//! hold a [`ChannelSlot`] instead of a reference to their owner; the
//! supervisor installs and removes the live channel as the agent goes
//! online and offline.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use acpcommon::{
    AcpError, ErrorCode, RequestId,
    identifiers::{Aid, SessionId},
};
use acpapiclient::ws::{ChannelStatus, Frame, MessageChannel};

#[derive(Clone, Default)]
pub struct ChannelSlot {
    inner: Arc<RwLock<Option<Arc<MessageChannel>>>>,
}

impl ChannelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `channel` the live channel behind this slot. The supervisor
    /// does this on every successful bring-up; embedders wiring their
    /// own channel can call it directly.
    pub fn install(&self, channel: Arc<MessageChannel>) {
        *self.inner.write().expect("poisoned") = Some(channel);
    }

    pub(crate) fn clear(&self) -> Option<Arc<MessageChannel>> {
        self.inner.write().expect("poisoned").take()
    }

    pub fn get(&self) -> Option<Arc<MessageChannel>> {
        self.inner.read().expect("poisoned").clone()
    }

    pub fn is_connected(&self) -> bool {
        self.get()
            .map(|channel| *channel.status().borrow() == ChannelStatus::Connected)
            .unwrap_or(false)
    }

    fn connected(&self) -> Result<Arc<MessageChannel>, AcpError> {
        self.get()
            .ok_or_else(|| AcpError::new(ErrorCode::WsDisconnected, "message channel is down"))
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<(), AcpError> {
        self.connected()?
            .send_frame(frame)
            .await
            .map_err(AcpError::from)
    }

    pub async fn send_raw(
        &self,
        payload: &serde_json::Value,
        receiver: &Aid,
        session_id: &SessionId,
    ) -> Result<(), AcpError> {
        self.connected()?
            .send_raw(payload, receiver, session_id)
            .await
            .map_err(AcpError::from)
    }

    pub async fn send_and_wait_ack(
        &self,
        frame: &Frame,
        expected_cmd: &str,
        request_id: &RequestId,
        wait: Duration,
    ) -> Result<Frame, AcpError> {
        self.connected()?
            .send_and_wait_ack(frame, expected_cmd, request_id, wait)
            .await
            .map_err(AcpError::from)
    }
}
