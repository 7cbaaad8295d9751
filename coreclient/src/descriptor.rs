// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent descriptors. Each agent may publish `https://<aid>/agent.md`, a
//! markdown document with a YAML frontmatter; the SDK fetches it on
//! demand and caches it for a day.

use std::collections::HashMap;

use acpcommon::{AcpError, ErrorCode, TimeStamp, identifiers::Aid};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

const CACHE_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    #[serde(rename = "type", default)]
    pub descriptor_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Markdown body following the frontmatter.
    #[serde(skip)]
    pub body: String,
}

struct CacheEntry {
    fetched_at: TimeStamp,
    descriptor: AgentDescriptor,
}

pub struct DescriptorCache {
    client: reqwest::Client,
    use_tls: bool,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl DescriptorCache {
    pub fn new(use_tls: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            use_tls,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn fetch(&self, aid: &Aid) -> Result<AgentDescriptor, AcpError> {
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&aid.to_string()) {
                if entry.fetched_at.elapsed() < Duration::hours(CACHE_TTL_HOURS) {
                    debug!(%aid, "agent descriptor served from cache");
                    return Ok(entry.descriptor.clone());
                }
            }
        }

        let scheme = if self.use_tls { "https" } else { "http" };
        let url = format!("{scheme}://{aid}/agent.md");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| AcpError::new(ErrorCode::NetworkError, error.to_string()))?;
        if !response.status().is_success() {
            return Err(AcpError::new(
                ErrorCode::NetworkError,
                format!("descriptor fetch failed with status {}", response.status()),
            ));
        }
        let text = response
            .text()
            .await
            .map_err(|error| AcpError::new(ErrorCode::NetworkError, error.to_string()))?;
        let descriptor = parse_descriptor(&text)?;

        self.entries.lock().await.insert(
            aid.to_string(),
            CacheEntry {
                fetched_at: TimeStamp::now(),
                descriptor: descriptor.clone(),
            },
        );
        Ok(descriptor)
    }
}

/// Splits the YAML frontmatter from the markdown body. A document
/// without frontmatter is all body.
fn parse_descriptor(text: &str) -> Result<AgentDescriptor, AcpError> {
    let trimmed = text.trim_start_matches('\u{feff}');
    if let Some(rest) = trimmed.strip_prefix("---\n") {
        if let Some((frontmatter, body)) = rest.split_once("\n---") {
            let mut descriptor: AgentDescriptor = serde_yaml::from_str(frontmatter)
                .map_err(|error| {
                    AcpError::new(
                        ErrorCode::InvalidArgument,
                        format!("bad descriptor frontmatter: {error}"),
                    )
                })?;
            descriptor.body = body.trim_start_matches('\n').to_string();
            return Ok(descriptor);
        }
    }
    Ok(AgentDescriptor {
        descriptor_type: None,
        name: None,
        description: None,
        tags: Vec::new(),
        body: trimmed.to_string(),
    })
}
