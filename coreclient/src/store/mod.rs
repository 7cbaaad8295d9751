// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk layout of agent identities and their cached protocol state.
//!
//! ```text
//! AIDs/<aid>/private/<aid>.key        # PKCS#8, password-encrypted
//! AIDs/<aid>/private/<aid>.csr
//! AIDs/<aid>/public/<aid>.crt
//! AIDs/<aid>/sessions/_index.json
//! AIDs/<aid>/sessions/<session_id>.jsonl
//! AIDs/<aid>/groups/_index.json
//! AIDs/<aid>/groups/.cursors.json
//! AIDs/<aid>/groups/<group_id>/messages.jsonl
//! AIDs/<aid>/groups/<group_id>/events.jsonl
//! ```
//!
//! Reads of missing files return empty values; writes create parent
//! directories and only fail on hard I/O errors. Index and cursor files
//! are rewritten atomically (write to a sibling temp file, then rename).

use std::path::{Path, PathBuf};

use acpcommon::{AcpError, ErrorCode, identifiers::Aid};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tracing::warn;

const AIDS_DIR: &str = "AIDs";

/// Filesystem root of all agent state. Cheap to clone; the store itself
/// holds no open handles.
#[derive(Debug, Clone)]
pub struct CertKeyStore {
    base: PathBuf,
}

impl CertKeyStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn aid_dir(&self, aid: &Aid) -> PathBuf {
        self.base.join(AIDS_DIR).join(aid.to_string())
    }

    pub fn key_path(&self, aid: &Aid) -> PathBuf {
        self.aid_dir(aid).join("private").join(format!("{aid}.key"))
    }

    pub fn csr_path(&self, aid: &Aid) -> PathBuf {
        self.aid_dir(aid).join("private").join(format!("{aid}.csr"))
    }

    pub fn cert_path(&self, aid: &Aid) -> PathBuf {
        self.aid_dir(aid).join("public").join(format!("{aid}.crt"))
    }

    pub fn sessions_dir(&self, aid: &Aid) -> PathBuf {
        self.aid_dir(aid).join("sessions")
    }

    pub fn session_log_path(&self, aid: &Aid, session_id: &str) -> PathBuf {
        self.sessions_dir(aid).join(format!("{session_id}.jsonl"))
    }

    pub fn session_index_path(&self, aid: &Aid) -> PathBuf {
        self.sessions_dir(aid).join("_index.json")
    }

    pub fn groups_dir(&self, aid: &Aid) -> PathBuf {
        self.aid_dir(aid).join("groups")
    }

    pub fn group_index_path(&self, aid: &Aid) -> PathBuf {
        self.groups_dir(aid).join("_index.json")
    }

    pub fn cursors_path(&self, aid: &Aid) -> PathBuf {
        self.groups_dir(aid).join(".cursors.json")
    }

    pub fn group_messages_path(&self, aid: &Aid, group_id: &str) -> PathBuf {
        self.groups_dir(aid).join(group_id).join("messages.jsonl")
    }

    pub fn group_events_path(&self, aid: &Aid, group_id: &str) -> PathBuf {
        self.groups_dir(aid).join(group_id).join("events.jsonl")
    }

    /// Agent ids for which both the encrypted key and the certificate
    /// exist on disk.
    pub async fn list_aids(&self) -> Vec<Aid> {
        let aids_dir = self.base.join(AIDS_DIR);
        let mut entries = match tokio::fs::read_dir(&aids_dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut aids = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(aid) = entry.file_name().to_string_lossy().parse::<Aid>() else {
                continue;
            };
            let has_key = tokio::fs::try_exists(self.key_path(&aid))
                .await
                .unwrap_or(false);
            let has_cert = tokio::fs::try_exists(self.cert_path(&aid))
                .await
                .unwrap_or(false);
            if has_key && has_cert {
                aids.push(aid);
            }
        }
        aids.sort();
        aids
    }

    /// Removes everything stored for the agent.
    pub async fn delete_aid(&self, aid: &Aid) -> Result<(), AcpError> {
        let dir = self.aid_dir(aid);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(file_error(&dir, error)),
        }
    }

    pub async fn read_to_string_opt(&self, path: &Path) -> Result<Option<String>, AcpError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(file_error(path, error)),
        }
    }

    pub async fn write_string(&self, path: &Path, content: &str) -> Result<(), AcpError> {
        ensure_parent(path).await?;
        tokio::fs::write(path, content)
            .await
            .map_err(|error| file_error(path, error))
    }

    /// Rewrites `path` atomically: the new content lands in a sibling
    /// temp file which is renamed over the target.
    pub async fn write_atomic(&self, path: &Path, content: &str) -> Result<(), AcpError> {
        ensure_parent(path).await?;
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|error| file_error(&tmp, error))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|error| file_error(&tmp, error))?;
        file.flush().await.map_err(|error| file_error(&tmp, error))?;
        drop(file);
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|error| file_error(path, error))
    }

    /// Reads a JSON file; a missing file yields the type's default.
    pub async fn read_json_or_default<T: DeserializeOwned + Default>(
        &self,
        path: &Path,
    ) -> Result<T, AcpError> {
        match self.read_to_string_opt(path).await? {
            Some(content) => serde_json::from_str(&content).map_err(|error| {
                AcpError::new(ErrorCode::FileError, format!("corrupt json: {error}"))
                    .with_context(path.display().to_string())
            }),
            None => Ok(T::default()),
        }
    }

    pub async fn write_json_atomic<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), AcpError> {
        let content = serde_json::to_string_pretty(value)
            .map_err(|error| AcpError::new(ErrorCode::Internal, error.to_string()))?;
        self.write_atomic(path, &content).await
    }

    /// Appends one record per line. Creates the file and its parents on
    /// first use.
    pub async fn append_jsonl<T: Serialize>(
        &self,
        path: &Path,
        records: &[T],
    ) -> Result<(), AcpError> {
        if records.is_empty() {
            return Ok(());
        }
        ensure_parent(path).await?;
        let mut lines = String::new();
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|error| AcpError::new(ErrorCode::Internal, error.to_string()))?;
            lines.push_str(&line);
            lines.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|error| file_error(path, error))?;
        file.write_all(lines.as_bytes())
            .await
            .map_err(|error| file_error(path, error))?;
        file.flush().await.map_err(|error| file_error(path, error))
    }

    /// Reads every line of a JSONL file; missing file yields an empty
    /// vec, undecodable lines are skipped with a warning.
    pub async fn read_jsonl<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>, AcpError> {
        let Some(content) = self.read_to_string_opt(path).await? else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(error) => {
                    warn!(%error, path = %path.display(), "skipping corrupt jsonl line");
                }
            }
        }
        Ok(records)
    }

    /// Rewrites a JSONL file keeping only the given records. Used when a
    /// log exceeds its cap.
    pub async fn rewrite_jsonl<T: Serialize>(
        &self,
        path: &Path,
        records: &[T],
    ) -> Result<(), AcpError> {
        let mut lines = String::new();
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|error| AcpError::new(ErrorCode::Internal, error.to_string()))?;
            lines.push_str(&line);
            lines.push('\n');
        }
        self.write_atomic(path, &lines).await
    }
}

async fn ensure_parent(path: &Path) -> Result<(), AcpError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|error| file_error(parent, error))?;
    }
    Ok(())
}

fn file_error(path: &Path, error: std::io::Error) -> AcpError {
    AcpError::new(ErrorCode::FileError, error.to_string())
        .with_context(path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CertKeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CertKeyStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn layout_paths() {
        let (_dir, store) = store();
        let aid: Aid = "alice.ex.com".parse().unwrap();
        assert!(store
            .key_path(&aid)
            .ends_with("AIDs/alice.ex.com/private/alice.ex.com.key"));
        assert!(store
            .cert_path(&aid)
            .ends_with("AIDs/alice.ex.com/public/alice.ex.com.crt"));
        assert!(store
            .group_messages_path(&aid, "g1")
            .ends_with("AIDs/alice.ex.com/groups/g1/messages.jsonl"));
    }

    #[tokio::test]
    async fn list_aids_requires_key_and_cert() {
        let (_dir, store) = store();
        let alice: Aid = "alice.ex.com".parse().unwrap();
        let bob: Aid = "bob.ex.com".parse().unwrap();

        store
            .write_string(&store.key_path(&alice), "key")
            .await
            .unwrap();
        store
            .write_string(&store.cert_path(&alice), "cert")
            .await
            .unwrap();
        // Bob only has a key.
        store
            .write_string(&store.key_path(&bob), "key")
            .await
            .unwrap();

        assert_eq!(store.list_aids().await, vec![alice]);
    }

    #[tokio::test]
    async fn delete_restores_pre_create_state() {
        let (dir, store) = store();
        let aid: Aid = "alice.ex.com".parse().unwrap();
        store
            .write_string(&store.key_path(&aid), "key")
            .await
            .unwrap();
        store
            .write_string(&store.cert_path(&aid), "cert")
            .await
            .unwrap();

        store.delete_aid(&aid).await.unwrap();
        assert!(store.list_aids().await.is_empty());
        assert!(!dir.path().join("AIDs").join("alice.ex.com").exists());
        // Deleting again is a no-op.
        store.delete_aid(&aid).await.unwrap();
    }

    #[tokio::test]
    async fn missing_reads_are_empty() {
        let (_dir, store) = store();
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let index: Vec<String> = store
            .read_json_or_default(&store.session_index_path(&aid))
            .await
            .unwrap();
        assert!(index.is_empty());
        let lines: Vec<serde_json::Value> = store
            .read_jsonl(&store.session_log_path(&aid, "s1"))
            .await
            .unwrap();
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn jsonl_append_and_rewrite() {
        let (_dir, store) = store();
        let aid: Aid = "alice.ex.com".parse().unwrap();
        let path = store.group_messages_path(&aid, "g1");

        store.append_jsonl(&path, &[1u64, 2, 3]).await.unwrap();
        store.append_jsonl(&path, &[4u64]).await.unwrap();
        let read: Vec<u64> = store.read_jsonl(&path).await.unwrap();
        assert_eq!(read, vec![1, 2, 3, 4]);

        store.rewrite_jsonl(&path, &[3u64, 4]).await.unwrap();
        let read: Vec<u64> = store.read_jsonl(&path).await.unwrap();
        assert_eq!(read, vec![3, 4]);
    }
}
