//! Sandbox moderation: typed configuration, lifecycle rules, forum messages
//! and the scheduled jobs that act on wiki pages.

pub mod config;
pub mod jobs;
pub mod messages;
pub mod rules;

pub use config::{BotConfig, ConfigError, PeriodSpec, TOKEN_ENV};
pub use jobs::{install, Cerberus, JobKind, JobRunSummary, PageAction, PageFailure, PageOutcome};
pub use rules::Rules;

pub const CRATE_NAME: &str = "cerberus-bot";
