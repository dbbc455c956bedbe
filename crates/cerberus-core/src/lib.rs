//! Core page model, change-log lookups and list-pages filter expressions for Cerberus.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cerberus-core";

/// Category of pages whose id carries no `category:` prefix.
pub const DEFAULT_CATEGORY: &str = "_default";

const DEFAULT_TAG_PREFIX: &str = "_default:";

/// Category part of a page id (`category:name`), or [`DEFAULT_CATEGORY`].
pub fn page_category(page_id: &str) -> &str {
    match page_id.split_once(':') {
        Some((category, _)) => category,
        None => DEFAULT_CATEGORY,
    }
}

/// Strips a `_default:` category prefix (case-insensitive) from a tag name.
pub fn normalize_tag(tag: &str) -> String {
    match tag.get(..DEFAULT_TAG_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(DEFAULT_TAG_PREFIX) => {
            tag[DEFAULT_TAG_PREFIX.len()..].to_string()
        }
        _ => tag.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub staff: bool,
}

impl User {
    /// Placeholder identity for pages whose author is not known yet.
    pub fn system() -> Self {
        Self {
            id: -1,
            username: "System".to_string(),
            name: "System".to_string(),
            staff: true,
        }
    }
}

/// Kind of a change-log entry together with its kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Tags {
        added: Vec<String>,
        removed: Vec<String>,
    },
    Name {
        name: String,
        prev_name: String,
    },
    Source,
    Revert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub rev_number: u32,
    pub created_at: DateTime<Utc>,
    pub actor: User,
    #[serde(default)]
    pub comment: String,
    pub kind: ChangeKind,
}

impl ChangeLogEntry {
    pub fn is_source_edit(&self) -> bool {
        matches!(self.kind, ChangeKind::Source | ChangeKind::New)
    }
}

/// Point-in-time snapshot of a wiki page.
///
/// Metrics are `None` until fetched. Threshold checks must treat `None` as
/// "never satisfies", so a partially fetched page is never acted upon.
/// `history` is ordered newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub title: Option<String>,
    pub tags: BTreeSet<String>,
    pub rating: Option<f64>,
    pub votes_count: Option<u32>,
    pub popularity: Option<u32>,
    pub author: Option<User>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub history: Vec<ChangeLogEntry>,
}

impl Page {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            tags: BTreeSet::new(),
            rating: None,
            votes_count: None,
            popularity: None,
            author: None,
            created_at: None,
            updated_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = tags.into_iter().map(|t| normalize_tag(t.as_ref())).collect();
        self
    }

    pub fn with_metrics(mut self, rating: f64, votes_count: u32, popularity: u32) -> Self {
        self.rating = Some(rating);
        self.votes_count = Some(votes_count);
        self.popularity = Some(popularity);
        self
    }

    /// Attaches a change-log, newest entry first.
    pub fn with_history(mut self, history: Vec<ChangeLogEntry>) -> Self {
        self.history = history;
        self
    }

    pub fn category(&self) -> &str {
        page_category(&self.id)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(&normalize_tag(tag))
    }

    /// True once rating, votes and popularity are all known.
    pub fn has_metrics(&self) -> bool {
        self.rating.is_some() && self.votes_count.is_some() && self.popularity.is_some()
    }

    pub fn author_or_system(&self) -> User {
        self.author.clone().unwrap_or_else(User::system)
    }

    pub fn created_at_or_never(&self) -> DateTime<Utc> {
        self.created_at.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn updated_at_or_never(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn title_or_id(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }

    /// When `tag` was most recently attached.
    ///
    /// Returns `None` when the tag is not currently on the page, even if the
    /// history shows an earlier add-then-remove, and when no history entry
    /// records the addition.
    pub fn date_tag_added(&self, tag: &str) -> Option<DateTime<Utc>> {
        let tag = normalize_tag(tag);
        if !self.tags.contains(&tag) {
            return None;
        }

        self.history.iter().find_map(|entry| match &entry.kind {
            ChangeKind::Tags { added, .. } if added.iter().any(|t| normalize_tag(t) == tag) => {
                Some(entry.created_at)
            }
            _ => None,
        })
    }

    /// The rename that moved the page into its current category, falling back
    /// to the oldest (creation) entry.
    pub fn last_category_move(&self) -> Option<&ChangeLogEntry> {
        let current = self.category();
        self.history
            .iter()
            .find(|entry| match &entry.kind {
                ChangeKind::Name { name, prev_name } => {
                    let new_category = page_category(name);
                    new_category == current && new_category != page_category(prev_name)
                }
                _ => false,
            })
            .or_else(|| self.history.last())
    }

    /// Newest `source` or `new` entry.
    pub fn last_source_edit(&self) -> Option<&ChangeLogEntry> {
        self.history.iter().find(|entry| entry.is_source_edit())
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if let Some(title) = &self.title {
            write!(f, " ({title})")?;
        }
        match self.rating {
            Some(rating) => write!(f, " {rating}")?,
            None => write!(f, " ?")?,
        }
        match self.votes_count {
            Some(votes) => write!(f, " ({votes})")?,
            None => write!(f, " (?)")?,
        }
        match self.popularity {
            Some(popularity) => write!(f, " / {popularity}%")?,
            None => write!(f, " / ?%")?,
        }
        if let Some(author) = &self.author {
            write!(f, " {}", author.username)?;
        }
        if !self.tags.is_empty() {
            let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
            write!(f, " [{}]", tags.join(", "))?;
        }
        Ok(())
    }
}

fn bare_tag(tag: &str) -> String {
    normalize_tag(tag.trim_start_matches(['+', '-']))
}

/// Space-separated list-pages tag expression.
///
/// `+tag` is required, `-tag` excluded, a bare `tag` is an any-of match and a
/// lone `-` selects pages without tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    tokens: Vec<String>,
}

impl TagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn untagged() -> Self {
        Self {
            tokens: vec!["-".to_string()],
        }
    }

    pub fn parse(expression: &str) -> Self {
        Self {
            tokens: expression.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Appends tokens verbatim; used for configured branch filters that may
    /// carry their own `+`/`-` prefixes.
    pub fn raw<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tokens.extend(
            tokens
                .into_iter()
                .map(|t| t.as_ref().trim().to_string())
                .filter(|t| !t.is_empty()),
        );
        self
    }

    pub fn require<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tokens
            .extend(tags.into_iter().map(|t| format!("+{}", bare_tag(t.as_ref()))));
        self
    }

    pub fn exclude<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tokens
            .extend(tags.into_iter().map(|t| format!("-{}", bare_tag(t.as_ref()))));
        self
    }

    pub fn expression(&self) -> String {
        self.tokens.join(" ")
    }

    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        let mut any_of = Vec::new();
        for token in &self.tokens {
            if token == "-" {
                if !tags.is_empty() {
                    return false;
                }
            } else if let Some(tag) = token.strip_prefix('+') {
                if !tags.contains(&normalize_tag(tag)) {
                    return false;
                }
            } else if let Some(tag) = token.strip_prefix('-') {
                if tags.contains(&normalize_tag(tag)) {
                    return false;
                }
            } else {
                any_of.push(normalize_tag(token));
            }
        }
        any_of.is_empty() || any_of.iter().any(|tag| tags.contains(tag))
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}

/// Category + tag filter passed to the wiki's list-pages call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageQuery {
    pub categories: Vec<String>,
    pub tags: TagFilter,
}

impl PageQuery {
    pub fn new<I, S>(categories: I, tags: TagFilter) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
            tags,
        }
    }

    pub fn category_expression(&self) -> String {
        self.categories.join(" ")
    }

    /// Client-side evaluation of the query; `*` matches every category.
    pub fn matches(&self, page: &Page) -> bool {
        let category = page.category();
        self.categories
            .iter()
            .any(|c| c == "*" || c == category)
            && self.tags.matches(&page.tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).single().expect("ts")
    }

    fn entry(rev: u32, day: u32, kind: ChangeKind) -> ChangeLogEntry {
        ChangeLogEntry {
            rev_number: rev,
            created_at: ts(day),
            actor: User::system(),
            comment: String::new(),
            kind,
        }
    }

    fn tags_entry(rev: u32, day: u32, added: &[&str], removed: &[&str]) -> ChangeLogEntry {
        entry(
            rev,
            day,
            ChangeKind::Tags {
                added: added.iter().map(|t| t.to_string()).collect(),
                removed: removed.iter().map(|t| t.to_string()).collect(),
            },
        )
    }

    fn rename_entry(rev: u32, day: u32, prev: &str, name: &str) -> ChangeLogEntry {
        entry(
            rev,
            day,
            ChangeKind::Name {
                name: name.to_string(),
                prev_name: prev.to_string(),
            },
        )
    }

    #[test]
    fn category_is_prefix_before_first_colon() {
        assert_eq!(page_category("sandbox:scp-1234"), "sandbox");
        assert_eq!(page_category("deleted:sandbox:scp-1234"), "deleted");
        assert_eq!(page_category("scp-1234"), DEFAULT_CATEGORY);
    }

    #[test]
    fn default_tag_prefix_is_stripped_case_insensitively() {
        assert_eq!(normalize_tag("_default:к_удалению"), "к_удалению");
        assert_eq!(normalize_tag("_DEFAULT:tag"), "tag");
        assert_eq!(normalize_tag("branch:tag"), "branch:tag");
        assert_eq!(normalize_tag("ёж"), "ёж");
    }

    #[test]
    fn date_tag_added_uses_latest_addition() {
        let page = Page::new("sandbox:a")
            .with_tags(["deletion"])
            .with_history(vec![
                tags_entry(4, 9, &["deletion"], &[]),
                tags_entry(3, 5, &[], &["deletion"]),
                tags_entry(2, 3, &["deletion"], &[]),
                entry(1, 1, ChangeKind::New),
            ]);
        assert_eq!(page.date_tag_added("deletion"), Some(ts(9)));
        assert_eq!(page.date_tag_added("_default:deletion"), Some(ts(9)));
    }

    #[test]
    fn date_tag_added_is_none_when_tag_absent_now() {
        let page = Page::new("sandbox:a").with_history(vec![
            tags_entry(3, 5, &[], &["deletion"]),
            tags_entry(2, 3, &["deletion"], &[]),
        ]);
        assert_eq!(page.date_tag_added("deletion"), None);
    }

    #[test]
    fn date_tag_added_is_none_without_matching_history() {
        let page = Page::new("sandbox:a")
            .with_tags(["deletion"])
            .with_history(vec![entry(1, 1, ChangeKind::New)]);
        assert_eq!(page.date_tag_added("deletion"), None);
    }

    #[test]
    fn last_category_move_finds_move_into_current_category() {
        let page = Page::new("sandbox:b").with_history(vec![
            rename_entry(4, 8, "sandbox:a", "sandbox:b"),
            rename_entry(3, 6, "drafts:a", "sandbox:a"),
            rename_entry(2, 4, "sandbox:x", "drafts:a"),
            entry(1, 1, ChangeKind::New),
        ]);
        let found = page.last_category_move().expect("move");
        assert_eq!(found.rev_number, 3);
    }

    #[test]
    fn last_category_move_falls_back_to_creation() {
        let page = Page::new("sandbox:a").with_history(vec![
            entry(3, 6, ChangeKind::Source),
            entry(1, 1, ChangeKind::New),
        ]);
        assert_eq!(page.last_category_move().map(|e| e.rev_number), Some(1));
        assert!(Page::new("sandbox:a").last_category_move().is_none());
    }

    #[test]
    fn last_source_edit_prefers_newest_source_then_creation() {
        let page = Page::new("sandbox:a").with_history(vec![
            tags_entry(4, 9, &["x"], &[]),
            entry(3, 7, ChangeKind::Source),
            entry(1, 1, ChangeKind::New),
        ]);
        assert_eq!(page.last_source_edit().map(|e| e.rev_number), Some(3));

        let fresh = Page::new("sandbox:a").with_history(vec![
            tags_entry(2, 4, &["x"], &[]),
            entry(1, 1, ChangeKind::New),
        ]);
        assert_eq!(fresh.last_source_edit().map(|e| e.created_at), Some(ts(1)));
    }

    #[test]
    fn unknown_metrics_render_as_placeholders() {
        let page = Page::new("sandbox:a");
        assert_eq!(page.to_string(), "sandbox:a ? (?) / ?%");
        assert!(!page.has_metrics());
        assert_eq!(page.author_or_system(), User::system());
        assert_eq!(page.created_at_or_never(), DateTime::<Utc>::MIN_UTC);

        let known = Page::new("sandbox:a").with_metrics(3.0, 4, 60).with_tags(["b", "a"]);
        assert_eq!(known.to_string(), "sandbox:a 3 (4) / 60% [a, b]");
    }

    #[test]
    fn tag_filter_renders_prefixed_tokens() {
        let filter = TagFilter::new()
            .raw(["полигон"])
            .require(["+deletion"])
            .exclude(["whitemark", "-approved"]);
        assert_eq!(filter.expression(), "полигон +deletion -whitemark -approved");
        assert_eq!(TagFilter::untagged().expression(), "-");
    }

    #[test]
    fn tag_filter_matching_follows_token_semantics() {
        let tags: BTreeSet<String> = ["a", "b"].iter().map(|t| t.to_string()).collect();
        assert!(TagFilter::parse("+a -c").matches(&tags));
        assert!(!TagFilter::parse("+a -b").matches(&tags));
        assert!(TagFilter::parse("x b").matches(&tags));
        assert!(!TagFilter::parse("x y").matches(&tags));
        assert!(!TagFilter::untagged().matches(&tags));
        assert!(TagFilter::untagged().matches(&BTreeSet::new()));
    }

    #[test]
    fn page_query_requires_listed_category() {
        let query = PageQuery::new(["sandbox"], TagFilter::new().exclude(["deletion"]));
        assert_eq!(query.category_expression(), "sandbox");
        assert!(query.matches(&Page::new("sandbox:a")));
        assert!(!query.matches(&Page::new("deleted:sandbox:a")));
        assert!(!query.matches(&Page::new("sandbox:a").with_tags(["deletion"])));
        assert!(PageQuery::new(["*"], TagFilter::new()).matches(&Page::new("x")));
    }

    #[test]
    fn change_kind_serializes_with_type_tag() {
        let kind = ChangeKind::Name {
            name: "b".into(),
            prev_name: "a".into(),
        };
        let json = serde_json::to_value(&kind).expect("json");
        assert_eq!(json["type"], "name");
        assert_eq!(json["prev_name"], "a");
    }
}
