// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The per-agent runtime: one value owning the session manager, the
//! group client, the handler registry and the supervisor that drives the
//! connection lifecycle.

use std::sync::Arc;

use acpcommon::{AcpError, ErrorCode, identifiers::Aid};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    channel::ChannelSlot,
    descriptor::{AgentDescriptor, DescriptorCache},
    groups::{GroupClient, GroupStore},
    handlers::HandlerRegistry,
    identity::{AgentIdentity, IdentityManagerConfig},
    sessions::SessionManager,
    store::CertKeyStore,
    supervisor::{AgentState, Supervisor},
};

/// One live agent. Obtained from
/// [`IdentityManager::load_aid`](crate::identity::IdentityManager::load_aid);
/// the manager owns the runtime, everything else holds this handle.
pub struct AgentRuntime {
    identity: Arc<AgentIdentity>,
    sessions: SessionManager,
    groups: GroupClient,
    handlers: HandlerRegistry,
    supervisor: Supervisor,
    descriptors: DescriptorCache,
    invalidated: CancellationToken,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("identity", &self.identity.aid())
            .finish_non_exhaustive()
    }
}

impl AgentRuntime {
    pub(crate) fn new(
        identity: AgentIdentity,
        config: IdentityManagerConfig,
        store: CertKeyStore,
    ) -> Arc<Self> {
        let aid = identity.aid().clone();
        let identity = Arc::new(identity);
        let handlers = HandlerRegistry::default();
        let channel = ChannelSlot::new();
        let invalidated = CancellationToken::new();

        let sessions = SessionManager::new(aid.clone(), channel.clone(), store.clone());
        let group_store = GroupStore::new(aid.clone(), store);
        let groups = GroupClient::new(aid, channel.clone(), group_store, handlers.clone());
        let descriptors = DescriptorCache::new(config.use_tls);

        let supervisor = Supervisor::spawn(
            identity.clone(),
            config,
            channel,
            sessions.clone(),
            groups.clone(),
            handlers.clone(),
            invalidated.clone(),
        );

        Arc::new(Self {
            identity,
            sessions,
            groups,
            handlers,
            supervisor,
            descriptors,
            invalidated,
        })
    }

    pub fn aid(&self) -> &Aid {
        self.identity.aid()
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn groups(&self) -> &GroupClient {
        &self.groups
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Signs in and brings both channels up. Idempotent while online.
    pub async fn online(&self) -> Result<(), AcpError> {
        self.ensure_valid()?;
        self.supervisor.online().await
    }

    /// Stops both channels. The stop flag is observed before the next
    /// heartbeat tick.
    pub async fn offline(&self) {
        self.supervisor.offline().await;
    }

    pub fn state(&self) -> AgentState {
        self.supervisor.state()
    }

    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<AgentState> {
        self.supervisor.subscribe()
    }

    /// Establishes the dedicated session with the group authority and
    /// binds the group engine to it. Cross-AP groups pass an explicit
    /// `target`; otherwise the authority is `group.<issuer>`.
    pub async fn init_group_client(&self, target: Option<Aid>) -> Result<(), AcpError> {
        self.ensure_valid()?;
        let authority = target
            .clone()
            .unwrap_or_else(|| self.aid().group_authority());
        let session_id = self.sessions.create_session(&[authority]).await?;
        self.groups.init(target, session_id);
        info!(aid = %self.aid(), "group client initialized");
        Ok(())
    }

    /// Fetches and caches the agent descriptor published at
    /// `https://<aid>/agent.md`.
    pub async fn fetch_agent_descriptor(&self, aid: &Aid) -> Result<AgentDescriptor, AcpError> {
        self.descriptors.fetch(aid).await
    }

    /// Tears the runtime down for good; called by the identity manager
    /// when the AID is deleted. Outstanding handles keep failing with
    /// `NOT_INITIALIZED`.
    pub(crate) async fn invalidate(&self) {
        self.supervisor.offline().await;
        self.invalidated.cancel();
    }

    fn ensure_valid(&self) -> Result<(), AcpError> {
        if self.invalidated.is_cancelled() {
            return Err(AcpError::new(
                ErrorCode::NotInitialized,
                "agent identity was deleted",
            ));
        }
        Ok(())
    }
}
