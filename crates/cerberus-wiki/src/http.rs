//! reqwest transport for the wiki's JSON API.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cerberus_core::{normalize_tag, ChangeKind, ChangeLogEntry, Page, PageQuery, User};
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::{ThreadId, WikiClient, WikiError};

#[derive(Debug, Clone)]
pub struct HttpWikiConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl HttpWikiConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Client-side request limiter shared by every call of one [`HttpWiki`].
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a request slot is free and takes it.
    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            if !self.refill_every.is_zero() {
                let refills = state.last_refill.elapsed().as_nanos() / self.refill_every.as_nanos();
                if refills > 0 {
                    let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                    state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                    // A full bucket banks no idle time.
                    if state.tokens == self.capacity {
                        state.last_refill = Instant::now();
                    } else {
                        state.last_refill += self.refill_every * refills;
                    }
                }
            }

            if state.tokens > 0 || self.refill_every.is_zero() {
                state.tokens = state.tokens.saturating_sub(1);
                return;
            }

            let next_refill = state.last_refill + self.refill_every;
            drop(state);
            tokio::time::sleep_until(next_refill).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpWiki {
    client: reqwest::Client,
    api_base: String,
    token: String,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

#[derive(Debug, Deserialize)]
struct ArticleData {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ArticleLog {
    #[serde(default)]
    entries: Vec<RawLogEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLogEntry {
    #[serde(default)]
    rev_number: u32,
    user: User,
    #[serde(default)]
    comment: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    meta: JsonValue,
}

#[derive(Debug, Deserialize)]
struct VotesInfo {
    rating: Option<f64>,
    popularity: Option<f64>,
    #[serde(default)]
    votes: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ListPagesResponse {
    #[serde(default)]
    pages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    #[serde(rename = "threadId")]
    thread_id: JsonValue,
}

#[derive(Debug, Deserialize)]
struct RenameResponse {
    #[serde(rename = "pageId")]
    page_id: Option<String>,
}

fn meta_tag_names(meta: &JsonValue, key: &str) -> Vec<String> {
    meta.get(key)
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("name").and_then(JsonValue::as_str))
                .map(normalize_tag)
                .collect()
        })
        .unwrap_or_default()
}

fn meta_str(meta: &JsonValue, key: &str) -> String {
    meta.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn convert_log_entry(raw: RawLogEntry) -> Option<ChangeLogEntry> {
    let kind = match raw.kind.as_str() {
        "new" => ChangeKind::New,
        "source" => ChangeKind::Source,
        "revert" => ChangeKind::Revert,
        "tags" => ChangeKind::Tags {
            added: meta_tag_names(&raw.meta, "added_tags"),
            removed: meta_tag_names(&raw.meta, "removed_tags"),
        },
        "name" => ChangeKind::Name {
            name: meta_str(&raw.meta, "name"),
            prev_name: meta_str(&raw.meta, "prev_name"),
        },
        other => {
            debug!(kind = other, rev = raw.rev_number, "skipping unknown change-log entry");
            return None;
        }
    };
    Some(ChangeLogEntry {
        rev_number: raw.rev_number,
        created_at: raw.created_at,
        actor: raw.user,
        comment: raw.comment.unwrap_or_default(),
        kind,
    })
}

fn thread_id_from(value: &JsonValue) -> Result<ThreadId, WikiError> {
    match value {
        JsonValue::String(s) => Ok(ThreadId(s.clone())),
        JsonValue::Number(n) => Ok(ThreadId(n.to_string())),
        other => Err(WikiError::Decode(format!("threadId is not a string or number: {other}"))),
    }
}

impl HttpWiki {
    pub fn new(config: HttpWikiConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            api_base: format!("{}/api", config.base_url.trim_end_matches('/')),
            token: config.token,
            token_bucket,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.api_base, endpoint)
    }

    fn article_endpoint(page_id: &str) -> String {
        format!("articles/{page_id}")
    }

    async fn call(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, WikiError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let url = self.url(endpoint);
        debug!(%method, url = %url, "wiki api call");

        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WikiError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_str(&text).map_err(|e| WikiError::Decode(format!("{url}: {e}")))
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: Option<&JsonValue>,
    ) -> Result<T, WikiError> {
        let value = self.call(method, endpoint, query, body).await?;
        serde_json::from_value(value).map_err(|e| WikiError::Decode(format!("{endpoint}: {e}")))
    }

    async fn module<T: DeserializeOwned>(
        &self,
        module: &str,
        method: &str,
        params: JsonValue,
    ) -> Result<T, WikiError> {
        let mut body = json!({ "module": module, "method": method });
        if let (Some(target), JsonValue::Object(params)) = (body.as_object_mut(), params) {
            target.extend(params);
        }
        self.call_as(Method::POST, "modules", &[], Some(&body)).await
    }

    fn not_found_for(page_id: &str, err: WikiError) -> WikiError {
        match err {
            WikiError::HttpStatus { status, .. } if status == StatusCode::NOT_FOUND.as_u16() => {
                WikiError::NotFound {
                    page_id: page_id.to_string(),
                }
            }
            other => other,
        }
    }
}

#[async_trait]
impl WikiClient for HttpWiki {
    async fn list_pages(&self, query: &PageQuery) -> Result<Vec<String>, WikiError> {
        let response: ListPagesResponse = self
            .module(
                "listpages",
                "get",
                json!({
                    "params": {
                        "category": query.category_expression(),
                        "tags": query.tags.expression(),
                    }
                }),
            )
            .await?;
        Ok(response.pages)
    }

    async fn fetch_page(&self, page_id: &str) -> Result<Page, WikiError> {
        let endpoint = Self::article_endpoint(page_id);
        let article: ArticleData = self
            .call_as(Method::GET, &endpoint, &[], None)
            .await
            .map_err(|e| Self::not_found_for(page_id, e))?;
        let log: ArticleLog = self
            .call_as(Method::GET, &format!("{endpoint}/log"), &[("all", "true")], None)
            .await
            .map_err(|e| Self::not_found_for(page_id, e))?;
        let votes: VotesInfo = self
            .module("rate", "get_votes", json!({ "pageId": page_id }))
            .await?;

        let history: Vec<ChangeLogEntry> =
            log.entries.into_iter().filter_map(convert_log_entry).collect();

        let mut page = Page::new(page_id).with_tags(article.tags);
        page.title = article.title;
        page.rating = votes.rating;
        page.popularity = votes.popularity.map(|p| p.round().max(0.0) as u32);
        page.votes_count = Some(votes.votes.len() as u32);
        page.created_at = history.last().map(|e| e.created_at);
        page.updated_at = history.first().map(|e| e.created_at);
        page.author = history.last().map(|e| e.actor.clone());
        page.history = history;
        Ok(page)
    }

    async fn set_tags(&self, page_id: &str, tags: &BTreeSet<String>) -> Result<(), WikiError> {
        let body = json!({ "pageId": page_id, "tags": tags });
        self.call(Method::PUT, &Self::article_endpoint(page_id), &[], Some(&body))
            .await
            .map_err(|e| Self::not_found_for(page_id, e))?;
        Ok(())
    }

    async fn rename_page(&self, page_id: &str, new_id: &str) -> Result<String, WikiError> {
        let body = json!({ "pageId": new_id });
        let result = self
            .call(Method::PUT, &Self::article_endpoint(page_id), &[], Some(&body))
            .await;
        match result {
            Ok(value) => {
                let response: Option<RenameResponse> = serde_json::from_value(value).ok();
                Ok(response
                    .and_then(|r| r.page_id)
                    .unwrap_or_else(|| new_id.to_string()))
            }
            Err(WikiError::HttpStatus { status, .. })
                if status == StatusCode::CONFLICT.as_u16() =>
            {
                Err(WikiError::NamingConflict {
                    page_id: page_id.to_string(),
                    target: new_id.to_string(),
                })
            }
            Err(err) => Err(Self::not_found_for(page_id, err)),
        }
    }

    async fn delete_page(&self, page_id: &str) -> Result<(), WikiError> {
        self.call(Method::DELETE, &Self::article_endpoint(page_id), &[], None)
            .await
            .map_err(|e| Self::not_found_for(page_id, e))?;
        Ok(())
    }

    async fn page_thread(&self, page_id: &str) -> Result<ThreadId, WikiError> {
        let response: ThreadResponse = self
            .module("forumthread", "for_article", json!({ "pageId": page_id }))
            .await?;
        thread_id_from(&response.thread_id)
    }

    async fn new_post(&self, thread: &ThreadId, title: &str, source: &str) -> Result<(), WikiError> {
        let _: JsonValue = self
            .module(
                "forumnewpost",
                "submit",
                json!({
                    "params": {
                        "threadid": thread.0,
                        "name": title,
                        "source": source,
                    }
                }),
            )
            .await?;
        Ok(())
    }
}
