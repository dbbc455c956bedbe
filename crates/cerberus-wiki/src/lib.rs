//! Wiki collaborator contract plus the HTTP and in-memory implementations.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use cerberus_core::{normalize_tag, Page, PageQuery};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod http;
mod memory;

pub use http::{HttpWiki, HttpWikiConfig, SimpleTokenBucket, TokenBucketConfig};
pub use memory::{MemoryWiki, Post};

pub const CRATE_NAME: &str = "cerberus-wiki";

/// Forum thread identifier (page discussion or a fixed report thread).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub String);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum WikiError {
    #[error("page id {target} is already taken (renaming {page_id})")]
    NamingConflict { page_id: String, target: String },
    #[error("page {page_id} not found")]
    NotFound { page_id: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl WikiError {
    pub fn is_naming_conflict(&self) -> bool {
        matches!(self, Self::NamingConflict { .. })
    }
}

/// Result of applying additions and removals to a tag set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagUpdate {
    pub tags: BTreeSet<String>,
    pub removed: Vec<String>,
}

/// Removals are applied before additions; only tags actually present are
/// reported as removed.
pub fn plan_tag_update(current: &BTreeSet<String>, add: &[String], remove: &[String]) -> TagUpdate {
    let mut tags = current.clone();
    let mut removed = Vec::new();
    for tag in remove {
        let tag = normalize_tag(tag);
        if tags.remove(&tag) {
            removed.push(tag);
        }
    }
    tags.extend(add.iter().map(|t| normalize_tag(t)));
    TagUpdate { tags, removed }
}

/// Operations the moderation jobs need from the wiki.
///
/// Implementations must tolerate concurrent outstanding calls: jobs share one
/// client and are never serialized against each other.
#[async_trait]
pub trait WikiClient: Send + Sync {
    /// Ids of the pages matching the category and tag filter.
    async fn list_pages(&self, query: &PageQuery) -> Result<Vec<String>, WikiError>;

    /// Fetches tags, change-log and vote metrics.
    async fn fetch_page(&self, page_id: &str) -> Result<Page, WikiError>;

    async fn set_tags(&self, page_id: &str, tags: &BTreeSet<String>) -> Result<(), WikiError>;

    /// Renames a page and returns its new id. Fails with
    /// [`WikiError::NamingConflict`] when the target id already exists.
    async fn rename_page(&self, page_id: &str, new_id: &str) -> Result<String, WikiError>;

    async fn delete_page(&self, page_id: &str) -> Result<(), WikiError>;

    async fn page_thread(&self, page_id: &str) -> Result<ThreadId, WikiError>;

    async fn new_post(&self, thread: &ThreadId, title: &str, source: &str) -> Result<(), WikiError>;

    async fn add_tags(&self, page: &Page, tags: &[String]) -> Result<BTreeSet<String>, WikiError> {
        let update = plan_tag_update(&page.tags, tags, &[]);
        self.set_tags(&page.id, &update.tags).await?;
        Ok(update.tags)
    }

    /// Returns the tags that were actually removed.
    async fn remove_tags(&self, page: &Page, tags: &[String]) -> Result<Vec<String>, WikiError> {
        self.update_tags(page, &[], tags).await
    }

    async fn update_tags(
        &self,
        page: &Page,
        add: &[String],
        remove: &[String],
    ) -> Result<Vec<String>, WikiError> {
        let update = plan_tag_update(&page.tags, add, remove);
        self.set_tags(&page.id, &update.tags).await?;
        Ok(update.removed)
    }

    async fn clear_tags(&self, page_id: &str) -> Result<(), WikiError> {
        self.set_tags(page_id, &BTreeSet::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    fn owned(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn tag_update_reports_only_present_removals() {
        let update = plan_tag_update(
            &set(&["whitemark", "sandbox"]),
            &owned(&["approved", "_default:tagging"]),
            &owned(&["whitemark", "deletion"]),
        );
        assert_eq!(update.tags, set(&["approved", "sandbox", "tagging"]));
        assert_eq!(update.removed, owned(&["whitemark"]));
    }

    #[test]
    fn naming_conflict_is_classified() {
        let err = WikiError::NamingConflict {
            page_id: "a".into(),
            target: "deleted:a".into(),
        };
        assert!(err.is_naming_conflict());
        assert!(!WikiError::NotFound { page_id: "a".into() }.is_naming_conflict());
    }
}
