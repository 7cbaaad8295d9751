// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-group persistence: JSONL message and event logs with caps, the
//! cursor file and the group index. One writer per group, enforced by a
//! per-group async mutex.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use acpcommon::{AcpError, identifiers::{Aid, GroupId}};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::store::CertKeyStore;

const DEFAULT_MESSAGE_CAP: usize = 5_000;
const DEFAULT_EVENT_CAP: usize = 2_000;

use super::{GroupEvent, GroupMessage};

/// One side (messages or events) of a group's cursor. All positions are
/// non-decreasing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorPosition {
    pub start_msg_id: u64,
    pub current_msg_id: u64,
    pub latest_msg_id: u64,
    pub unread_count: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupCursor {
    pub msg_cursor: CursorPosition,
    pub event_cursor: CursorPosition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupIndexEntry {
    pub group_id: String,
    pub group_name: String,
    pub last_msg_id: u64,
}

/// Result of an append: how many records survived deduplication and the
/// highest id now in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub appended: usize,
    pub last_id: u64,
}

/// Result of reconciling the local group list against the server's.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupSyncOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Default)]
struct GroupMeta {
    last_msg_id: u64,
    msg_count: usize,
    last_event_id: u64,
    event_count: usize,
    seeded: bool,
}

/// The group message store of one agent.
#[derive(Clone)]
pub struct GroupStore {
    aid: Aid,
    files: CertKeyStore,
    // Per-group serialisation of writers plus cached log metadata.
    meta: Arc<Mutex<HashMap<String, Arc<Mutex<GroupMeta>>>>>,
    cursors: Arc<Mutex<()>>,
    message_cap: usize,
    event_cap: usize,
}

impl GroupStore {
    pub fn new(aid: Aid, files: CertKeyStore) -> Self {
        Self {
            aid,
            files,
            meta: Default::default(),
            cursors: Default::default(),
            message_cap: DEFAULT_MESSAGE_CAP,
            event_cap: DEFAULT_EVENT_CAP,
        }
    }

    #[cfg(test)]
    fn with_caps(mut self, message_cap: usize, event_cap: usize) -> Self {
        self.message_cap = message_cap;
        self.event_cap = event_cap;
        self
    }

    async fn group_meta(&self, group_id: &str) -> Arc<Mutex<GroupMeta>> {
        self.meta
            .lock()
            .await
            .entry(group_id.to_string())
            .or_default()
            .clone()
    }

    async fn seed_meta(&self, group_id: &str, meta: &mut GroupMeta) -> Result<(), AcpError> {
        if meta.seeded {
            return Ok(());
        }
        let messages: Vec<GroupMessage> = self
            .files
            .read_jsonl(&self.files.group_messages_path(&self.aid, group_id))
            .await?;
        meta.msg_count = messages.len();
        meta.last_msg_id = messages.iter().map(|m| m.msg_id).max().unwrap_or(0);
        let events: Vec<GroupEvent> = self
            .files
            .read_jsonl(&self.files.group_events_path(&self.aid, group_id))
            .await?;
        meta.event_count = events.len();
        meta.last_event_id = events.iter().map(|e| e.event_id).max().unwrap_or(0);
        meta.seeded = true;
        Ok(())
    }

    /// Appends messages, dropping duplicates and anything at or below the
    /// highest locally known id. Batches are sorted ascending before
    /// storage, so the log stays linear in `msg_id`.
    pub async fn append_messages(
        &self,
        group_id: &GroupId,
        mut messages: Vec<GroupMessage>,
    ) -> Result<AppendOutcome, AcpError> {
        let meta_handle = self.group_meta(group_id.as_str()).await;
        let mut meta = meta_handle.lock().await;
        self.seed_meta(group_id.as_str(), &mut meta).await?;

        messages.sort_by_key(|m| m.msg_id);
        messages.dedup_by_key(|m| m.msg_id);
        let survivors: Vec<GroupMessage> = messages
            .into_iter()
            .filter(|m| m.msg_id > meta.last_msg_id)
            .collect();
        if survivors.is_empty() {
            return Ok(AppendOutcome {
                appended: 0,
                last_id: meta.last_msg_id,
            });
        }

        let path = self.files.group_messages_path(&self.aid, group_id.as_str());
        self.files.append_jsonl(&path, &survivors).await?;
        meta.msg_count += survivors.len();
        meta.last_msg_id = survivors.last().map(|m| m.msg_id).unwrap_or(meta.last_msg_id);

        if meta.msg_count > self.message_cap {
            // Shift the oldest lines out, keeping the newest cap.
            let all: Vec<GroupMessage> = self.files.read_jsonl(&path).await?;
            let keep: Vec<GroupMessage> = all
                .into_iter()
                .rev()
                .take(self.message_cap)
                .rev()
                .collect();
            self.files.rewrite_jsonl(&path, &keep).await?;
            meta.msg_count = keep.len();
            debug!(group_id = group_id.as_str(), kept = keep.len(), "message log trimmed");
        }

        let outcome = AppendOutcome {
            appended: survivors.len(),
            last_id: meta.last_msg_id,
        };
        drop(meta);

        self.advance_latest(group_id, outcome.last_id).await?;
        self.update_index_last_msg_id(group_id, outcome.last_id).await?;
        Ok(outcome)
    }

    /// Event-log counterpart of [`Self::append_messages`].
    pub async fn append_events(
        &self,
        group_id: &GroupId,
        mut events: Vec<GroupEvent>,
    ) -> Result<AppendOutcome, AcpError> {
        let meta_handle = self.group_meta(group_id.as_str()).await;
        let mut meta = meta_handle.lock().await;
        self.seed_meta(group_id.as_str(), &mut meta).await?;

        events.sort_by_key(|e| e.event_id);
        events.dedup_by_key(|e| e.event_id);
        let survivors: Vec<GroupEvent> = events
            .into_iter()
            .filter(|e| e.event_id > meta.last_event_id)
            .collect();
        if survivors.is_empty() {
            return Ok(AppendOutcome {
                appended: 0,
                last_id: meta.last_event_id,
            });
        }

        let path = self.files.group_events_path(&self.aid, group_id.as_str());
        self.files.append_jsonl(&path, &survivors).await?;
        meta.event_count += survivors.len();
        meta.last_event_id = survivors
            .last()
            .map(|e| e.event_id)
            .unwrap_or(meta.last_event_id);

        if meta.event_count > self.event_cap {
            let all: Vec<GroupEvent> = self.files.read_jsonl(&path).await?;
            let keep: Vec<GroupEvent> =
                all.into_iter().rev().take(self.event_cap).rev().collect();
            self.files.rewrite_jsonl(&path, &keep).await?;
            meta.event_count = keep.len();
        }

        Ok(AppendOutcome {
            appended: survivors.len(),
            last_id: meta.last_event_id,
        })
    }

    pub async fn read_messages(
        &self,
        group_id: &GroupId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<GroupMessage>, AcpError> {
        let path = self.files.group_messages_path(&self.aid, group_id.as_str());
        let messages: Vec<GroupMessage> = self.files.read_jsonl(&path).await?;
        Ok(messages
            .into_iter()
            .filter(|m| m.msg_id > after)
            .take(limit)
            .collect())
    }

    pub async fn read_events(
        &self,
        group_id: &GroupId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<GroupEvent>, AcpError> {
        let path = self.files.group_events_path(&self.aid, group_id.as_str());
        let events: Vec<GroupEvent> = self.files.read_jsonl(&path).await?;
        Ok(events
            .into_iter()
            .filter(|e| e.event_id > after)
            .take(limit)
            .collect())
    }

    /// Highest message id in the local log.
    pub async fn last_msg_id(&self, group_id: &GroupId) -> Result<u64, AcpError> {
        let meta_handle = self.group_meta(group_id.as_str()).await;
        let mut meta = meta_handle.lock().await;
        self.seed_meta(group_id.as_str(), &mut meta).await?;
        Ok(meta.last_msg_id)
    }

    pub async fn cursor(&self, group_id: &GroupId) -> Result<GroupCursor, AcpError> {
        let cursors = self.read_cursors().await?;
        Ok(cursors.get(group_id.as_str()).copied().unwrap_or_default())
    }

    /// Advances the acknowledged position. Cursors never move backwards.
    pub async fn advance_current(
        &self,
        group_id: &GroupId,
        msg_id: u64,
    ) -> Result<(), AcpError> {
        self.update_cursor(group_id, |cursor| {
            cursor.msg_cursor.current_msg_id = cursor.msg_cursor.current_msg_id.max(msg_id);
            cursor.msg_cursor.unread_count = cursor
                .msg_cursor
                .latest_msg_id
                .saturating_sub(cursor.msg_cursor.current_msg_id);
        })
        .await
    }

    /// Advances the server-side head as observed from pushes and pulls.
    pub async fn advance_latest(
        &self,
        group_id: &GroupId,
        latest_msg_id: u64,
    ) -> Result<(), AcpError> {
        self.update_cursor(group_id, |cursor| {
            cursor.msg_cursor.latest_msg_id = cursor.msg_cursor.latest_msg_id.max(latest_msg_id);
            cursor.msg_cursor.unread_count = cursor
                .msg_cursor
                .latest_msg_id
                .saturating_sub(cursor.msg_cursor.current_msg_id);
        })
        .await
    }

    pub async fn advance_event_current(
        &self,
        group_id: &GroupId,
        event_id: u64,
    ) -> Result<(), AcpError> {
        self.update_cursor(group_id, |cursor| {
            cursor.event_cursor.current_msg_id = cursor.event_cursor.current_msg_id.max(event_id);
            cursor.event_cursor.unread_count = cursor
                .event_cursor
                .latest_msg_id
                .saturating_sub(cursor.event_cursor.current_msg_id);
        })
        .await
    }

    pub async fn advance_event_latest(
        &self,
        group_id: &GroupId,
        latest_event_id: u64,
    ) -> Result<(), AcpError> {
        self.update_cursor(group_id, |cursor| {
            cursor.event_cursor.latest_msg_id =
                cursor.event_cursor.latest_msg_id.max(latest_event_id);
            cursor.event_cursor.unread_count = cursor
                .event_cursor
                .latest_msg_id
                .saturating_sub(cursor.event_cursor.current_msg_id);
        })
        .await
    }

    async fn update_cursor(
        &self,
        group_id: &GroupId,
        mutate: impl FnOnce(&mut GroupCursor),
    ) -> Result<(), AcpError> {
        // The cursor file is shared by all groups of the agent; serialize
        // rewrites.
        let _guard = self.cursors.lock().await;
        let mut cursors = self.read_cursors().await?;
        let cursor = cursors.entry(group_id.to_string()).or_default();
        mutate(cursor);
        self.files
            .write_json_atomic(&self.files.cursors_path(&self.aid), &cursors)
            .await
    }

    async fn read_cursors(&self) -> Result<BTreeMap<String, GroupCursor>, AcpError> {
        self.files
            .read_json_or_default(&self.files.cursors_path(&self.aid))
            .await
    }

    /// Registers a group in the local index (idempotent).
    pub async fn register_group(
        &self,
        group_id: &GroupId,
        group_name: &str,
    ) -> Result<(), AcpError> {
        let mut index = self.read_index().await?;
        if let Some(entry) = index.iter_mut().find(|e| e.group_id == group_id.as_str()) {
            entry.group_name = group_name.to_string();
        } else {
            index.push(GroupIndexEntry {
                group_id: group_id.to_string(),
                group_name: group_name.to_string(),
                last_msg_id: 0,
            });
            info!(group_id = %group_id, group_name, "group registered");
        }
        self.write_index(&index).await
    }

    pub async fn remove_group(&self, group_id: &GroupId) -> Result<(), AcpError> {
        let mut index = self.read_index().await?;
        index.retain(|e| e.group_id != group_id.as_str());
        self.write_index(&index).await?;

        let dir = self
            .files
            .groups_dir(&self.aid)
            .join(group_id.as_str());
        let _ = tokio::fs::remove_dir_all(&dir).await;
        self.meta.lock().await.remove(group_id.as_str());

        let _guard = self.cursors.lock().await;
        let mut cursors = self.read_cursors().await?;
        if cursors.remove(group_id.as_str()).is_some() {
            self.files
                .write_json_atomic(&self.files.cursors_path(&self.aid), &cursors)
                .await?;
        }
        Ok(())
    }

    pub async fn list_groups(&self) -> Result<Vec<GroupIndexEntry>, AcpError> {
        self.read_index().await
    }

    /// Reconciles the local index against the server's group list.
    /// Entries missing server-side are removed together with their files.
    pub async fn sync_group_list(
        &self,
        server_groups: &[(GroupId, String)],
    ) -> Result<GroupSyncOutcome, AcpError> {
        let index = self.read_index().await?;
        let mut outcome = GroupSyncOutcome::default();

        for (group_id, name) in server_groups {
            if !index.iter().any(|e| e.group_id == group_id.as_str()) {
                self.register_group(group_id, name).await?;
                outcome.added.push(group_id.to_string());
            }
        }
        for entry in &index {
            let still_there = server_groups
                .iter()
                .any(|(group_id, _)| group_id.as_str() == entry.group_id);
            if !still_there {
                self.remove_group(&GroupId::new(entry.group_id.clone())).await?;
                outcome.removed.push(entry.group_id.clone());
            }
        }
        Ok(outcome)
    }

    async fn update_index_last_msg_id(
        &self,
        group_id: &GroupId,
        last_msg_id: u64,
    ) -> Result<(), AcpError> {
        let mut index = self.read_index().await?;
        match index.iter_mut().find(|e| e.group_id == group_id.as_str()) {
            Some(entry) => entry.last_msg_id = entry.last_msg_id.max(last_msg_id),
            None => index.push(GroupIndexEntry {
                group_id: group_id.to_string(),
                group_name: String::new(),
                last_msg_id,
            }),
        }
        self.write_index(&index).await
    }

    async fn read_index(&self) -> Result<Vec<GroupIndexEntry>, AcpError> {
        self.files
            .read_json_or_default(&self.files.group_index_path(&self.aid))
            .await
    }

    async fn write_index(&self, index: &[GroupIndexEntry]) -> Result<(), AcpError> {
        self.files
            .write_json_atomic(&self.files.group_index_path(&self.aid), &index)
            .await
    }
}

#[cfg(test)]
mod tests {
    use acpcommon::TimeStamp;

    use super::*;

    fn message(msg_id: u64) -> GroupMessage {
        GroupMessage {
            msg_id,
            sender: "bob.ex.com".to_string(),
            content: format!("message {msg_id}"),
            content_type: "text".to_string(),
            timestamp: TimeStamp::from_millis(msg_id as i64),
            metadata: serde_json::Value::Null,
        }
    }

    fn store() -> (tempfile::TempDir, GroupStore) {
        let dir = tempfile::tempdir().unwrap();
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let files = CertKeyStore::new(dir.path());
        (dir, GroupStore::new(aid, files))
    }

    #[tokio::test]
    async fn appended_ids_are_strictly_increasing() {
        let (_dir, store) = store();
        let group = GroupId::new("g1");

        // Out-of-order batch is sorted; duplicates and stale ids dropped.
        let outcome = store
            .append_messages(&group, vec![message(3), message(1), message(2)])
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome { appended: 3, last_id: 3 });

        let outcome = store
            .append_messages(&group, vec![message(2), message(3), message(4)])
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome { appended: 1, last_id: 4 });

        let stored = store.read_messages(&group, 0, 100).await.unwrap();
        let ids: Vec<u64> = stored.iter().map(|m| m.msg_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn paged_pull_accumulates_like_the_sync_engine() {
        let (_dir, store) = store();
        let group = GroupId::new("g1");

        // Three pages of 50, 50, 20 as in a 120-message catch-up.
        for page in [1..=50u64, 51..=100, 101..=120] {
            let batch: Vec<GroupMessage> = page.map(message).collect();
            let outcome = store.append_messages(&group, batch).await.unwrap();
            store.advance_current(&group, outcome.last_id).await.unwrap();
        }

        assert_eq!(store.last_msg_id(&group).await.unwrap(), 120);
        let stored = store.read_messages(&group, 0, 1000).await.unwrap();
        assert_eq!(stored.len(), 120);
        let cursor = store.cursor(&group).await.unwrap();
        assert_eq!(cursor.msg_cursor.current_msg_id, 120);
        assert_eq!(cursor.msg_cursor.unread_count, 0);
    }

    #[tokio::test]
    async fn ack_advances_current_monotonically() {
        let (_dir, store) = store();
        let group = GroupId::new("g1");
        store
            .append_messages(&group, (1..=10).map(message).collect())
            .await
            .unwrap();

        store.advance_current(&group, 7).await.unwrap();
        let cursor = store.cursor(&group).await.unwrap();
        assert_eq!(cursor.msg_cursor.current_msg_id, 7);
        assert_eq!(cursor.msg_cursor.latest_msg_id, 10);
        assert_eq!(cursor.msg_cursor.unread_count, 3);

        // A stale ack cannot move the cursor backwards.
        store.advance_current(&group, 5).await.unwrap();
        let cursor = store.cursor(&group).await.unwrap();
        assert!(cursor.msg_cursor.current_msg_id >= 7);
    }

    #[tokio::test]
    async fn message_cap_shifts_the_oldest_out() {
        let dir = tempfile::tempdir().unwrap();
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let files = CertKeyStore::new(dir.path());
        let store = GroupStore::new(aid, files).with_caps(10, 5);
        let group = GroupId::new("g1");

        store
            .append_messages(&group, (1..=15).map(message).collect())
            .await
            .unwrap();
        let stored = store.read_messages(&group, 0, 100).await.unwrap();
        assert_eq!(stored.len(), 10);
        assert_eq!(stored.first().unwrap().msg_id, 6);
        assert_eq!(stored.last().unwrap().msg_id, 15);
    }

    #[tokio::test]
    async fn sync_group_list_removes_stale_groups() {
        let (_dir, store) = store();
        let g1 = GroupId::new("g1");
        let g2 = GroupId::new("g2");
        store.register_group(&g1, "one").await.unwrap();
        store.register_group(&g2, "two").await.unwrap();
        store
            .append_messages(&g2, vec![message(1)])
            .await
            .unwrap();

        let outcome = store
            .sync_group_list(&[(g1.clone(), "one".to_string())])
            .await
            .unwrap();
        assert_eq!(outcome.removed, vec!["g2".to_string()]);

        let groups = store.list_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_id, "g1");
        // g2's files are gone too.
        assert!(store.read_messages(&g2, 0, 10).await.unwrap().is_empty());
    }
}
