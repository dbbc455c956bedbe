//! The five moderation jobs, the archival action and their scheduler wiring.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cerberus_core::{Page, PageQuery, TagFilter};
use cerberus_sched::{Hook, Job, Scheduler};
use cerberus_wiki::{ThreadId, WikiClient, WikiError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::BotConfig;
use crate::messages;
use crate::rules::Rules;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    MarkFor,
    DeleteMarked,
    ApproveMarked,
    HandleInProgressArticles,
    UntagCategories,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::MarkFor,
        JobKind::DeleteMarked,
        JobKind::ApproveMarked,
        JobKind::HandleInProgressArticles,
        JobKind::UntagCategories,
    ];

    pub fn name(self) -> &'static str {
        match self {
            JobKind::MarkFor => "mark_for",
            JobKind::DeleteMarked => "delete_marked",
            JobKind::ApproveMarked => "approve_marked",
            JobKind::HandleInProgressArticles => "handle_in_progress_articles",
            JobKind::UntagCategories => "untag_categories",
        }
    }

    /// Deletion runs on its own period; every other job uses the work period.
    pub fn period_ticks(self, config: &BotConfig) -> u64 {
        match self {
            JobKind::DeleteMarked => config.deletion_period_ticks(),
            _ => config.work_period_ticks(),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match JobKind::ALL.into_iter().find(|job| job.name() == s) {
            Some(job) => Ok(job),
            None => {
                let known: Vec<&str> = JobKind::ALL.iter().map(|job| job.name()).collect();
                bail!("unknown job {s:?}; expected one of {}", known.join(", "))
            }
        }
    }
}

/// What a job did to one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PageAction {
    Archived { new_id: String },
    /// Every archive name was taken; the page was left as it was.
    ArchiveAbandoned,
    Whitemarked,
    MarkedForDeletion,
    Unmarked,
    Deleted,
    Approved,
    LostWhitemark,
    StrippedTags { removed: Vec<String> },
    TagsCleared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageOutcome {
    pub page: String,
    #[serde(flatten)]
    pub action: PageAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageFailure {
    pub page: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRunSummary {
    pub run_id: Uuid,
    pub job: JobKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed: usize,
    pub outcomes: Vec<PageOutcome>,
    pub failures: Vec<PageFailure>,
}

impl JobRunSummary {
    fn new(job: JobKind, listed: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            job,
            started_at: now,
            finished_at: now,
            listed,
            outcomes: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn settle(&mut self, page_id: String, result: Result<Option<PageAction>>) {
        match result {
            Ok(Some(action)) => self.outcomes.push(PageOutcome {
                page: page_id,
                action,
            }),
            Ok(None) => debug!(job = self.job.name(), page = %page_id, "no action"),
            Err(err) => {
                let error = format!("{err:#}");
                warn!(job = self.job.name(), page = %page_id, error = %error, "page failed");
                self.failures.push(PageFailure { page: page_id, error });
            }
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn action_for(&self, page_id: &str) -> Option<&PageAction> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.page == page_id)
            .map(|outcome| &outcome.action)
    }
}

/// The moderation bot: one wiki collaborator and one validated config shared
/// by every job.
#[derive(Clone)]
pub struct Cerberus {
    wiki: Arc<dyn WikiClient>,
    config: Arc<BotConfig>,
}

impl Cerberus {
    pub fn new(wiki: Arc<dyn WikiClient>, config: Arc<BotConfig>) -> Self {
        Self { wiki, config }
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    fn rules(&self) -> Rules<'_> {
        Rules::new(&self.config, Utc::now())
    }

    fn one(tag: &str) -> [String; 1] {
        [tag.to_string()]
    }

    async fn list(&self, job: JobKind, query: &PageQuery) -> Result<Vec<String>> {
        let pages = self.wiki.list_pages(query).await.with_context(|| {
            format!(
                "listing pages for {job} (categories {:?}, tags {:?})",
                query.category_expression(),
                query.tags.expression()
            )
        })?;
        debug!(job = job.name(), listed = pages.len(), "listed pages");
        Ok(pages)
    }

    pub async fn run_job(&self, job: JobKind) -> Result<JobRunSummary> {
        let span = info_span!("job", job = job.name());
        async move {
            let summary = match job {
                JobKind::MarkFor => self.mark_for().await,
                JobKind::DeleteMarked => self.delete_marked().await,
                JobKind::ApproveMarked => self.approve_marked().await,
                JobKind::HandleInProgressArticles => self.handle_in_progress_articles().await,
                JobKind::UntagCategories => self.untag_categories().await,
            }?;
            info!(
                listed = summary.listed,
                acted = summary.outcomes.len(),
                failed = summary.failures.len(),
                "job finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Archives grayzone pages, whitemarks pages reaching approval and marks
    /// critically rated pages for deletion, in that priority order.
    pub async fn mark_for(&self) -> Result<JobRunSummary> {
        let c = &self.config;
        let query = PageQuery::new(
            &c.deletion.categories,
            TagFilter::new()
                .raw(&c.deletion.branch_tags)
                .exclude([&c.tags.deletion, &c.tags.whitemark, &c.tags.approved])
                .exclude(&c.tags.exclude_with),
        );
        let ids = self.list(JobKind::MarkFor, &query).await?;
        let mut summary = JobRunSummary::new(JobKind::MarkFor, ids.len());
        for id in ids {
            let result = self.mark_page(&id).await;
            summary.settle(id, result);
        }
        Ok(summary.finish())
    }

    async fn mark_page(&self, page_id: &str) -> Result<Option<PageAction>> {
        let c = &self.config;
        let page = self.wiki.fetch_page(page_id).await?;
        let rules = self.rules();

        if rules.is_in_grayzone(&page) {
            let notice = messages::grayzone_notice(&c.posting.phrases.grayzone, &page)?;
            return self.archive(&page, &notice).await.map(Some);
        }

        if rules.is_approval_rating_reached(&page) {
            let tags_after = self.wiki.add_tags(&page, &Self::one(&c.tags.whitemark)).await?;
            info!(page = %page, action = "whitemark", tags_before = ?page.tags, tags_after = ?tags_after, "page whitemarked");
            return Ok(Some(PageAction::Whitemarked));
        }

        if rules.is_critical_rating_reached(&page) {
            let notice = messages::deletion_notice(
                &c.posting.phrases.deletion,
                rules.now(),
                &mut rand::thread_rng(),
            )?;
            let tags_after = self.wiki.add_tags(&page, &Self::one(&c.tags.deletion)).await?;
            let thread = self.wiki.page_thread(&page.id).await?;
            self.wiki.new_post(&thread, &c.posting.title, &notice).await?;
            info!(page = %page, action = "mark_deletion", tags_before = ?page.tags, tags_after = ?tags_after, "page marked for deletion");
            return Ok(Some(PageAction::MarkedForDeletion));
        }

        Ok(None)
    }

    /// Deletes marked pages whose grace period ran out, unmarks pages that
    /// recovered and posts one report for everything deleted in this run.
    pub async fn delete_marked(&self) -> Result<JobRunSummary> {
        let c = &self.config;
        let query = PageQuery::new(
            &c.deletion.categories,
            TagFilter::new()
                .raw(&c.deletion.branch_tags)
                .require([&c.tags.deletion])
                .exclude(&c.tags.exclude_with),
        );
        let ids = self.list(JobKind::DeleteMarked, &query).await?;
        let mut summary = JobRunSummary::new(JobKind::DeleteMarked, ids.len());
        let mut deleted = Vec::new();
        for id in ids {
            let result = self.settle_marked_page(&id, &mut deleted).await;
            summary.settle(id, result);
        }

        if !deleted.is_empty() {
            let body = messages::deletion_report(&c.report.prepend, &c.report.line, &deleted)
                .context("rendering deletion report")?;
            let thread = ThreadId(c.report.thread.clone());
            self.wiki
                .new_post(&thread, &c.report.title, &body)
                .await
                .with_context(|| format!("posting deletion report for {} pages to thread {thread}", deleted.len()))?;
            info!(thread = %thread, deleted = deleted.len(), "deletion report posted");
        }

        Ok(summary.finish())
    }

    async fn settle_marked_page(&self, page_id: &str, deleted: &mut Vec<Page>) -> Result<Option<PageAction>> {
        let page = self.wiki.fetch_page(page_id).await?;
        if !page.has_metrics() {
            warn!(page = %page, "metrics unknown; leaving deletion mark in place");
            return Ok(None);
        }

        let rules = self.rules();
        if !rules.is_critical_rating_reached(&page) {
            let removed = self
                .wiki
                .remove_tags(&page, &Self::one(&self.config.tags.deletion))
                .await?;
            info!(page = %page, action = "unmark", tags_before = ?page.tags, removed = ?removed, "page left the critical zone");
            return Ok(Some(PageAction::Unmarked));
        }

        if rules.is_last_chance_expired(&page) {
            self.wiki.delete_page(&page.id).await?;
            info!(page = %page, action = "delete", tags_before = ?page.tags, "page deleted");
            deleted.push(page);
            return Ok(Some(PageAction::Deleted));
        }

        Ok(None)
    }

    /// Promotes whitemarked pages after the approval delay and drops the
    /// whitemark from pages that fell below the bar.
    pub async fn approve_marked(&self) -> Result<JobRunSummary> {
        let c = &self.config;
        let query = PageQuery::new(
            &c.deletion.categories,
            TagFilter::new()
                .raw(&c.deletion.branch_tags)
                .require([&c.tags.whitemark])
                .exclude([&c.tags.approved])
                .exclude(&c.tags.exclude_with),
        );
        let ids = self.list(JobKind::ApproveMarked, &query).await?;
        let mut summary = JobRunSummary::new(JobKind::ApproveMarked, ids.len());
        for id in ids {
            let result = self.approve_page(&id).await;
            summary.settle(id, result);
        }
        Ok(summary.finish())
    }

    async fn approve_page(&self, page_id: &str) -> Result<Option<PageAction>> {
        let c = &self.config;
        let page = self.wiki.fetch_page(page_id).await?;
        if !page.has_metrics() {
            warn!(page = %page, "metrics unknown; leaving whitemark in place");
            return Ok(None);
        }

        let rules = self.rules();
        if rules.is_ready_for_approval(&page) {
            let add = [c.tags.approved.clone(), c.tags.tagging.clone()];
            self.wiki
                .update_tags(&page, &add, &Self::one(&c.tags.whitemark))
                .await?;
            info!(page = %page, action = "approve", tags_before = ?page.tags, added = ?add, "page approved");
            return Ok(Some(PageAction::Approved));
        }

        if !rules.is_approval_rating_reached(&page) {
            let removed = self
                .wiki
                .remove_tags(&page, &Self::one(&c.tags.whitemark))
                .await?;
            info!(page = %page, action = "unwhitemark", tags_before = ?page.tags, removed = ?removed, "page lost its whitemark");
            return Ok(Some(PageAction::LostWhitemark));
        }

        Ok(None)
    }

    /// Archives stale in-progress articles and strips sandbox tags from the
    /// rest.
    pub async fn handle_in_progress_articles(&self) -> Result<JobRunSummary> {
        let c = &self.config;
        let query = PageQuery::new(
            &c.in_progress.categories,
            TagFilter::new()
                .raw(&c.deletion.branch_tags)
                .exclude(&c.tags.exclude_with),
        );
        let ids = self.list(JobKind::HandleInProgressArticles, &query).await?;
        let mut summary = JobRunSummary::new(JobKind::HandleInProgressArticles, ids.len());
        for id in ids {
            let result = self.tend_in_progress_page(&id).await;
            summary.settle(id, result);
        }
        Ok(summary.finish())
    }

    async fn tend_in_progress_page(&self, page_id: &str) -> Result<Option<PageAction>> {
        let page = self.wiki.fetch_page(page_id).await?;

        if self.rules().is_in_progress_expired(&page) {
            let notice = self.config.posting.phrases.too_long_in_progress.clone();
            return self.archive(&page, &notice).await.map(Some);
        }

        let unwanted = self.config.sandbox_tags();
        if unwanted.iter().any(|tag| page.has_tag(tag)) {
            let removed = self.wiki.remove_tags(&page, &unwanted).await?;
            info!(page = %page, action = "strip_tags", tags_before = ?page.tags, removed = ?removed, "sandbox tags stripped");
            return Ok(Some(PageAction::StrippedTags { removed }));
        }

        Ok(None)
    }

    /// Clears every tag from pages in tag-free categories and tells the author
    /// why.
    pub async fn untag_categories(&self) -> Result<JobRunSummary> {
        let c = &self.config;
        let untagging = &c.tags.untagging;
        let all = PageQuery::new(
            &untagging.categories,
            TagFilter::new()
                .exclude(&c.tags.exclude_with)
                .exclude(&untagging.exclude_with),
        );
        let bare = PageQuery::new(&untagging.categories, TagFilter::untagged());

        let candidates = self.list(JobKind::UntagCategories, &all).await?;
        let untagged: HashSet<String> = self
            .list(JobKind::UntagCategories, &bare)
            .await?
            .into_iter()
            .collect();
        let ids: Vec<String> = candidates
            .into_iter()
            .filter(|id| !untagged.contains(id))
            .collect();

        let mut summary = JobRunSummary::new(JobKind::UntagCategories, ids.len());
        for id in ids {
            let result = self.untag_page(&id).await;
            summary.settle(id, result);
        }
        Ok(summary.finish())
    }

    async fn untag_page(&self, page_id: &str) -> Result<Option<PageAction>> {
        let c = &self.config;
        let page = self.wiki.fetch_page(page_id).await?;
        if page.tags.is_empty() {
            return Ok(None);
        }

        self.wiki.clear_tags(&page.id).await?;
        let thread = self.wiki.page_thread(&page.id).await?;
        self.wiki
            .new_post(&thread, &c.posting.title, &c.posting.phrases.tags_prohibited)
            .await?;
        info!(page = %page, action = "clear_tags", tags_before = ?page.tags, "tags cleared");
        Ok(Some(PageAction::TagsCleared))
    }

    /// Moves a page into the archive namespace, clears its tags and posts
    /// `notice` in its discussion thread.
    ///
    /// Name collisions are retried with random suffixes. When every candidate
    /// is taken the page is left untouched and
    /// [`PageAction::ArchiveAbandoned`] is returned.
    pub async fn archive(&self, page: &Page, notice: &str) -> Result<PageAction> {
        let c = &self.config;
        let thread = self
            .wiki
            .page_thread(&page.id)
            .await
            .with_context(|| format!("finding discussion thread of {}", page.id))?;

        let Some(new_id) = self.rename_into_archive(&page.id).await? else {
            return Ok(PageAction::ArchiveAbandoned);
        };

        self.wiki
            .clear_tags(&new_id)
            .await
            .with_context(|| format!("clearing tags of archived page {new_id}"))?;
        self.wiki.new_post(&thread, &c.posting.title, notice).await?;
        info!(page = %page, new_id = %new_id, action = "archive", tags_before = ?page.tags, "page archived");
        Ok(PageAction::Archived { new_id })
    }

    async fn rename_into_archive(&self, page_id: &str) -> Result<Option<String>, WikiError> {
        let archive = &self.config.archive;
        let base = format!("{}{}", archive.prefix, page_id);
        let attempts = archive.rename_retries + 1;
        let mut candidate = base.clone();

        for attempt in 1..=attempts {
            match self.wiki.rename_page(page_id, &candidate).await {
                Ok(new_id) => return Ok(Some(new_id)),
                Err(err) if err.is_naming_conflict() => {
                    warn!(page = page_id, candidate = %candidate, attempt, "archive name taken");
                    candidate = format!("{base}_{}", archive_suffix());
                }
                Err(err) => return Err(err),
            }
        }

        error!(page = page_id, attempts, "archiving failed: every candidate name was taken");
        Ok(None)
    }
}

fn archive_suffix() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(6);
    suffix
}

/// Registers the five jobs plus the startup and shutdown hooks.
pub fn install(scheduler: &Scheduler, bot: Arc<Cerberus>) -> Result<()> {
    for job in JobKind::ALL {
        let period = job.period_ticks(bot.config());
        let runner = bot.clone();
        scheduler.register(Job::new(job.name(), period, move || {
            let runner = runner.clone();
            async move { runner.run_job(job).await.map(|_| ()) }
        })?);
        debug!(job = job.name(), period, "job registered");
    }

    let config = bot.config.clone();
    scheduler.on_startup(Hook::new("announce", move || {
        let config = config.clone();
        async move {
            info!(
                name = %config.name,
                version = %config.version,
                wiki = %config.wiki.base_url,
                "bot started"
            );
            Ok(())
        }
    }));

    let config = bot.config.clone();
    scheduler.on_shutdown(Hook::new("farewell", move || {
        let config = config.clone();
        async move {
            warn!(name = %config.name, "bot is stopping");
            Ok(())
        }
    }));

    Ok(())
}
