//! Typed bot configuration loaded from YAML and validated once at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable holding the wiki API token.
pub const TOKEN_ENV: &str = "CERBERUS_API_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("missing wiki API token (set {TOKEN_ENV} or pass --token)")]
    MissingToken,
    #[error("invalid config value {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// A duration written as a sum of minutes, hours, days and weeks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeriodSpec {
    #[serde(default)]
    pub minutes: i64,
    #[serde(default)]
    pub hours: i64,
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub weeks: i64,
}

impl PeriodSpec {
    pub fn minutes(minutes: i64) -> Self {
        Self {
            minutes,
            ..Self::default()
        }
    }

    pub fn hours(hours: i64) -> Self {
        Self {
            hours,
            ..Self::default()
        }
    }

    pub fn days(days: i64) -> Self {
        Self {
            days,
            ..Self::default()
        }
    }

    /// The summed duration, or `None` when it does not fit a `TimeDelta`.
    pub fn as_delta(&self) -> Option<TimeDelta> {
        TimeDelta::try_minutes(self.minutes)?
            .checked_add(&TimeDelta::try_hours(self.hours)?)?
            .checked_add(&TimeDelta::try_days(self.days)?)?
            .checked_add(&TimeDelta::try_weeks(self.weeks)?)
    }

    /// Whole scheduler ticks covering this period, rounded up, at least one.
    pub fn as_ticks(&self, tick: Duration) -> u64 {
        let secs = self
            .as_delta()
            .map_or(u64::MAX, |delta| delta.num_seconds().max(0) as u64);
        let tick_secs = tick.as_secs().max(1);
        secs.div_ceil(tick_secs).max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WikiSettings {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub requests_per_second: Option<u32>,
}

fn default_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_work_period")]
    pub work_period: PeriodSpec,
    #[serde(default = "default_deletion_period")]
    pub deletion_period: PeriodSpec,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            work_period: default_work_period(),
            deletion_period: default_deletion_period(),
        }
    }
}

fn default_tick_seconds() -> u64 {
    60
}

fn default_work_period() -> PeriodSpec {
    PeriodSpec::minutes(10)
}

fn default_deletion_period() -> PeriodSpec {
    PeriodSpec::hours(1)
}

#[derive(Debug, Clone, Deserialize)]
pub struct UntaggingSettings {
    pub categories: Vec<String>,
    #[serde(default)]
    pub exclude_with: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagSettings {
    pub deletion: String,
    pub whitemark: String,
    pub approved: String,
    pub tagging: String,
    #[serde(default)]
    pub exclude_with: Vec<String>,
    pub untagging: UntaggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeletionSettings {
    pub categories: Vec<String>,
    #[serde(default)]
    pub branch_tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InProgressSettings {
    pub categories: Vec<String>,
    pub delay: PeriodSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CriticalSettings {
    pub rating: f64,
    pub votes: u32,
    pub popularity: u32,
    pub delay: PeriodSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrayzoneSettings {
    pub delay: PeriodSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalSettings {
    pub rating: f64,
    pub votes: u32,
    pub popularity: u32,
    pub delay: PeriodSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveSettings {
    #[serde(default = "default_archive_prefix")]
    pub prefix: String,
    #[serde(default = "default_rename_retries")]
    pub rename_retries: u32,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            prefix: default_archive_prefix(),
            rename_retries: default_rename_retries(),
        }
    }
}

fn default_archive_prefix() -> String {
    "deleted:".to_string()
}

fn default_rename_retries() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WeightedPhrase {
    pub weight: f64,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeletionPhrases {
    pub common: Vec<String>,
    #[serde(default)]
    pub easter: Vec<WeightedPhrase>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhraseSettings {
    pub grayzone: String,
    pub too_long_in_progress: String,
    pub tags_prohibited: String,
    pub deletion: DeletionPhrases,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostingSettings {
    pub title: String,
    pub phrases: PhraseSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportSettings {
    pub thread: String,
    pub title: String,
    #[serde(default)]
    pub prepend: String,
    pub line: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub wiki: WikiSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    pub tags: TagSettings,
    pub deletion: DeletionSettings,
    pub in_progress: InProgressSettings,
    pub critical: CriticalSettings,
    pub grayzone: GrayzoneSettings,
    pub approval: ApprovalSettings,
    #[serde(default)]
    pub archive: ArchiveSettings,
    pub posting: PostingSettings,
    pub report: ReportSettings,
    #[serde(skip)]
    pub api_token: String,
}

fn default_name() -> String {
    "Cerberus".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn require_list(field: &'static str, values: &[String]) -> Result<(), ConfigError> {
    if values.is_empty() || values.iter().any(|v| v.trim().is_empty()) {
        return Err(invalid(field, "must list at least one non-empty entry"));
    }
    Ok(())
}

fn require_text(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(())
}

fn require_period(field: &'static str, period: &PeriodSpec) -> Result<(), ConfigError> {
    match period.as_delta() {
        None => Err(invalid(field, "out of range")),
        Some(delta) if delta <= TimeDelta::zero() => {
            Err(invalid(field, "must be a positive duration"))
        }
        Some(_) => Ok(()),
    }
}

impl BotConfig {
    /// Parses YAML without validation or token lookup.
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Reads, parses and validates the config file. The token comes from
    /// `token` when given, else from [`TOKEN_ENV`].
    pub fn load(path: impl AsRef<Path>, token: Option<String>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.api_token = token
            .or_else(|| std::env::var(TOKEN_ENV).ok())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_text("wiki.base_url", &self.wiki.base_url)?;
        if self.runtime.tick_seconds == 0 {
            return Err(invalid("runtime.tick_seconds", "must be at least one second"));
        }
        require_period("runtime.work_period", &self.runtime.work_period)?;
        require_period("runtime.deletion_period", &self.runtime.deletion_period)?;

        require_text("tags.deletion", &self.tags.deletion)?;
        require_text("tags.whitemark", &self.tags.whitemark)?;
        require_text("tags.approved", &self.tags.approved)?;
        require_text("tags.tagging", &self.tags.tagging)?;
        require_list("tags.untagging.categories", &self.tags.untagging.categories)?;
        require_list("deletion.categories", &self.deletion.categories)?;
        require_list("in_progress.categories", &self.in_progress.categories)?;

        require_period("in_progress.delay", &self.in_progress.delay)?;
        require_period("critical.delay", &self.critical.delay)?;
        require_period("grayzone.delay", &self.grayzone.delay)?;
        require_period("approval.delay", &self.approval.delay)?;

        require_text("archive.prefix", &self.archive.prefix)?;
        require_text("posting.title", &self.posting.title)?;
        require_list("posting.phrases.deletion.common", &self.posting.phrases.deletion.common)?;
        if let Some(phrase) = self
            .posting
            .phrases
            .deletion
            .easter
            .iter()
            .find(|p| !(0.0..=1.0).contains(&p.weight))
        {
            return Err(invalid(
                "posting.phrases.deletion.easter",
                format!("weight {} of {:?} is outside [0, 1]", phrase.weight, phrase.text),
            ));
        }

        require_text("report.thread", &self.report.thread)?;
        require_text("report.line", &self.report.line)?;
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.runtime.tick_seconds)
    }

    pub fn work_period_ticks(&self) -> u64 {
        self.runtime.work_period.as_ticks(self.tick_interval())
    }

    pub fn deletion_period_ticks(&self) -> u64 {
        self.runtime.deletion_period.as_ticks(self.tick_interval())
    }

    /// Tags that never belong on in-progress articles.
    pub fn sandbox_tags(&self) -> Vec<String> {
        vec![
            self.tags.approved.clone(),
            self.tags.tagging.clone(),
            self.tags.whitemark.clone(),
            self.tags.deletion.clone(),
        ]
    }
}
