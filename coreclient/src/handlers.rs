// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User-facing event handlers. Handlers are values held by the runtime,
//! dispatched from a single consumer loop; a failing handler is logged
//! and never tears down the loop.

use std::sync::{Arc, RwLock};

use acpapiclient::heartbeat::InviteReq;
use serde_json::Value;
use tracing::warn;

use crate::{
    groups::{GroupEvent, GroupMessageBatch},
    sessions::IncomingMessage,
    supervisor::AgentState,
};
use acpcommon::identifiers::GroupId;

/// Decision returned by an invite handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteDecision {
    /// Join the session on the message channel.
    Accept,
    /// Leave the invitation unanswered.
    Ignore,
}

pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: &IncomingMessage) -> anyhow::Result<()>;
}

pub trait InviteHandler: Send + Sync {
    fn on_invite(&self, invite: &InviteReq) -> anyhow::Result<InviteDecision>;
}

pub trait StateChangeHandler: Send + Sync {
    fn on_state_change(&self, state: AgentState) -> anyhow::Result<()>;
}

/// Group protocol notifications. Every method has a default no-op so
/// implementors subscribe to what they need.
#[allow(unused_variables)]
pub trait GroupEventHandler: Send + Sync {
    fn on_new_message(
        &self,
        group_id: &GroupId,
        latest_msg_id: u64,
        sender: &str,
        preview: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_new_event(
        &self,
        group_id: &GroupId,
        latest_event_id: u64,
        event_type: &str,
        summary: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_group_message_batch(
        &self,
        group_id: &GroupId,
        batch: &GroupMessageBatch,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_group_event(&self, group_id: &GroupId, event: &GroupEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_group_invite(
        &self,
        group_id: &GroupId,
        inviter: &str,
        payload: &Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_join_approved(&self, group_id: &GroupId) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_join_rejected(&self, group_id: &GroupId, reason: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_join_request_received(
        &self,
        group_id: &GroupId,
        requester: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct HandlersInner {
    message: Option<Arc<dyn MessageHandler>>,
    invite: Option<Arc<dyn InviteHandler>>,
    state: Option<Arc<dyn StateChangeHandler>>,
    group: Option<Arc<dyn GroupEventHandler>>,
}

/// Registry of the four handler slots. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<RwLock<HandlersInner>>,
}

impl HandlerRegistry {
    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.write().expect("poisoned").message = Some(handler);
    }

    pub fn set_invite_handler(&self, handler: Arc<dyn InviteHandler>) {
        self.inner.write().expect("poisoned").invite = Some(handler);
    }

    pub fn set_state_change_handler(&self, handler: Arc<dyn StateChangeHandler>) {
        self.inner.write().expect("poisoned").state = Some(handler);
    }

    pub fn set_group_event_handler(&self, handler: Arc<dyn GroupEventHandler>) {
        self.inner.write().expect("poisoned").group = Some(handler);
    }

    pub(crate) fn dispatch_message(&self, message: &IncomingMessage) {
        let handler = self.inner.read().expect("poisoned").message.clone();
        if let Some(handler) = handler {
            if let Err(error) = handler.on_message(message) {
                warn!(%error, "message handler failed");
            }
        }
    }

    /// Invite reception is best-effort: a failing handler is logged and
    /// treated as [`InviteDecision::Ignore`]. With no handler installed
    /// invitations are accepted.
    pub(crate) fn dispatch_invite(&self, invite: &InviteReq) -> InviteDecision {
        let handler = self.inner.read().expect("poisoned").invite.clone();
        match handler {
            Some(handler) => handler.on_invite(invite).unwrap_or_else(|error| {
                warn!(%error, "invite handler failed");
                InviteDecision::Ignore
            }),
            None => InviteDecision::Accept,
        }
    }

    pub(crate) fn dispatch_state_change(&self, state: AgentState) {
        let handler = self.inner.read().expect("poisoned").state.clone();
        if let Some(handler) = handler {
            if let Err(error) = handler.on_state_change(state) {
                warn!(%error, "state change handler failed");
            }
        }
    }

    pub(crate) fn with_group_handler(
        &self,
        dispatch: impl FnOnce(&dyn GroupEventHandler) -> anyhow::Result<()>,
    ) {
        let handler = self.inner.read().expect("poisoned").group.clone();
        if let Some(handler) = handler {
            if let Err(error) = dispatch(handler.as_ref()) {
                warn!(%error, "group event handler failed");
            }
        }
    }
}
