//! In-memory wiki used by job tests and dry runs.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use cerberus_core::{ChangeKind, ChangeLogEntry, Page, PageQuery, User};
use chrono::Utc;

use crate::{ThreadId, WikiClient, WikiError};

/// A forum post recorded by [`MemoryWiki`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub thread: ThreadId,
    pub title: String,
    pub source: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    pages: BTreeMap<String, Page>,
    threads: BTreeMap<String, ThreadId>,
    next_thread: u64,
    posts: Vec<Post>,
    rename_attempts: Vec<String>,
    rejected_renames: usize,
    deleted: Vec<String>,
    failing: HashSet<String>,
    list_calls: usize,
}

impl MemoryState {
    fn page_mut(&mut self, page_id: &str) -> Result<&mut Page, WikiError> {
        self.pages.get_mut(page_id).ok_or_else(|| WikiError::NotFound {
            page_id: page_id.to_string(),
        })
    }

    fn check_failing(&self, page_id: &str) -> Result<(), WikiError> {
        if self.failing.contains(page_id) {
            return Err(WikiError::HttpStatus {
                status: 503,
                url: format!("memory://articles/{page_id}"),
            });
        }
        Ok(())
    }
}

/// Wiki double keeping pages, threads and posts in process memory.
///
/// Mutations append change-log entries stamped with the current time, so
/// history lookups behave as they would against the real wiki.
#[derive(Debug, Default)]
pub struct MemoryWiki {
    state: Mutex<MemoryState>,
}

impl MemoryWiki {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, page: Page) {
        self.state().pages.insert(page.id.clone(), page);
    }

    pub fn page(&self, page_id: &str) -> Option<Page> {
        self.state().pages.get(page_id).cloned()
    }

    pub fn page_ids(&self) -> Vec<String> {
        self.state().pages.keys().cloned().collect()
    }

    pub fn posts(&self) -> Vec<Post> {
        self.state().posts.clone()
    }

    /// Target ids of every rename call, including rejected ones.
    pub fn rename_attempts(&self) -> Vec<String> {
        self.state().rename_attempts.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    /// Rejects the next `count` renames with a naming conflict.
    pub fn reject_renames(&self, count: usize) {
        self.state().rejected_renames = count;
    }

    /// Makes every call touching `page_id` fail with a 503.
    pub fn fail_page(&self, page_id: &str) {
        self.state().failing.insert(page_id.to_string());
    }
}

fn bot_entry(rev_number: u32, kind: ChangeKind) -> ChangeLogEntry {
    ChangeLogEntry {
        rev_number,
        created_at: Utc::now(),
        actor: User::system(),
        comment: String::new(),
        kind,
    }
}

fn next_rev(page: &Page) -> u32 {
    page.history.first().map(|e| e.rev_number + 1).unwrap_or(1)
}

#[async_trait]
impl WikiClient for MemoryWiki {
    async fn list_pages(&self, query: &PageQuery) -> Result<Vec<String>, WikiError> {
        let mut state = self.state();
        state.list_calls += 1;
        Ok(state
            .pages
            .values()
            .filter(|page| query.matches(page))
            .map(|page| page.id.clone())
            .collect())
    }

    async fn fetch_page(&self, page_id: &str) -> Result<Page, WikiError> {
        let mut state = self.state();
        state.check_failing(page_id)?;
        state.page_mut(page_id).map(|page| page.clone())
    }

    async fn set_tags(&self, page_id: &str, tags: &BTreeSet<String>) -> Result<(), WikiError> {
        let mut state = self.state();
        state.check_failing(page_id)?;
        let page = state.page_mut(page_id)?;
        let added: Vec<String> = tags.difference(&page.tags).cloned().collect();
        let removed: Vec<String> = page.tags.difference(tags).cloned().collect();
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let entry = bot_entry(next_rev(page), ChangeKind::Tags { added, removed });
        page.history.insert(0, entry);
        page.tags = tags.clone();
        Ok(())
    }

    async fn rename_page(&self, page_id: &str, new_id: &str) -> Result<String, WikiError> {
        let mut state = self.state();
        state.check_failing(page_id)?;
        state.rename_attempts.push(new_id.to_string());

        let conflict = WikiError::NamingConflict {
            page_id: page_id.to_string(),
            target: new_id.to_string(),
        };
        if state.rejected_renames > 0 {
            state.rejected_renames -= 1;
            return Err(conflict);
        }
        if state.pages.contains_key(new_id) {
            return Err(conflict);
        }

        let mut page = state.pages.remove(page_id).ok_or_else(|| WikiError::NotFound {
            page_id: page_id.to_string(),
        })?;
        let entry = bot_entry(
            next_rev(&page),
            ChangeKind::Name {
                name: new_id.to_string(),
                prev_name: page_id.to_string(),
            },
        );
        page.history.insert(0, entry);
        page.id = new_id.to_string();
        state.pages.insert(new_id.to_string(), page);
        if let Some(thread) = state.threads.remove(page_id) {
            state.threads.insert(new_id.to_string(), thread);
        }
        Ok(new_id.to_string())
    }

    async fn delete_page(&self, page_id: &str) -> Result<(), WikiError> {
        let mut state = self.state();
        state.check_failing(page_id)?;
        state.page_mut(page_id)?;
        state.pages.remove(page_id);
        state.deleted.push(page_id.to_string());
        Ok(())
    }

    async fn page_thread(&self, page_id: &str) -> Result<ThreadId, WikiError> {
        let mut state = self.state();
        state.check_failing(page_id)?;
        state.page_mut(page_id)?;
        if let Some(thread) = state.threads.get(page_id) {
            return Ok(thread.clone());
        }
        state.next_thread += 1;
        let thread = ThreadId(format!("thread-{}", state.next_thread));
        state.threads.insert(page_id.to_string(), thread.clone());
        Ok(thread)
    }

    async fn new_post(&self, thread: &ThreadId, title: &str, source: &str) -> Result<(), WikiError> {
        self.state().posts.push(Post {
            thread: thread.clone(),
            title: title.to_string(),
            source: source.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cerberus_core::TagFilter;

    #[tokio::test]
    async fn rename_moves_page_and_thread() {
        let wiki = MemoryWiki::new();
        wiki.insert(Page::new("sandbox:a").with_tags(["x"]));
        let thread = wiki.page_thread("sandbox:a").await.expect("thread");

        let new_id = wiki.rename_page("sandbox:a", "deleted:sandbox:a").await.expect("rename");

        assert_eq!(new_id, "deleted:sandbox:a");
        assert!(wiki.page("sandbox:a").is_none());
        let moved = wiki.page("deleted:sandbox:a").expect("moved");
        assert!(matches!(moved.history[0].kind, ChangeKind::Name { .. }));
        assert_eq!(wiki.page_thread("deleted:sandbox:a").await.expect("thread"), thread);
    }

    #[tokio::test]
    async fn rename_onto_existing_page_conflicts() {
        let wiki = MemoryWiki::new();
        wiki.insert(Page::new("sandbox:a"));
        wiki.insert(Page::new("deleted:sandbox:a"));
        let err = wiki
            .rename_page("sandbox:a", "deleted:sandbox:a")
            .await
            .expect_err("conflict");
        assert!(err.is_naming_conflict());
    }

    #[tokio::test]
    async fn set_tags_records_history_and_lists_by_filter() {
        let wiki = MemoryWiki::new();
        wiki.insert(Page::new("sandbox:a"));
        wiki.insert(Page::new("sandbox:b").with_tags(["keep"]));

        let tags: BTreeSet<String> = ["deletion".to_string()].into_iter().collect();
        wiki.set_tags("sandbox:a", &tags).await.expect("tags");

        let page = wiki.fetch_page("sandbox:a").await.expect("page");
        assert!(page.date_tag_added("deletion").is_some());

        let query = PageQuery::new(["sandbox"], TagFilter::new().require(["deletion"]));
        assert_eq!(wiki.list_pages(&query).await.expect("list"), vec!["sandbox:a"]);
    }

    #[tokio::test]
    async fn failing_pages_surface_transient_errors() {
        let wiki = MemoryWiki::new();
        wiki.insert(Page::new("sandbox:a"));
        wiki.fail_page("sandbox:a");
        let err = wiki.fetch_page("sandbox:a").await.expect_err("fails");
        assert!(matches!(err, WikiError::HttpStatus { status: 503, .. }));
    }
}
