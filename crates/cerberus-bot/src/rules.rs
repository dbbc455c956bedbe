//! Lifecycle predicates over a page snapshot.
//!
//! Every predicate answers `false` when a metric or timestamp it depends on
//! is unknown, so a partially fetched page never triggers an action.

use cerberus_core::Page;
use chrono::{DateTime, Utc};

use crate::config::{BotConfig, PeriodSpec};

/// Predicate set evaluated against one fixed `now`.
#[derive(Debug, Clone, Copy)]
pub struct Rules<'a> {
    config: &'a BotConfig,
    now: DateTime<Utc>,
}

impl<'a> Rules<'a> {
    pub fn new(config: &'a BotConfig, now: DateTime<Utc>) -> Self {
        Self { config, now }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// A delay too large to represent never elapses.
    fn elapsed_at_least(&self, since: DateTime<Utc>, delay: &PeriodSpec) -> bool {
        delay.as_delta().is_some_and(|delay| self.now - since >= delay)
    }

    pub fn is_in_grayzone(&self, page: &Page) -> bool {
        let critical = &self.config.critical;
        let (Some(rating), Some(popularity)) = (page.rating, page.popularity) else {
            return false;
        };
        if !(rating > critical.rating && popularity < critical.popularity) {
            return false;
        }
        page.last_category_move().is_some_and(|entry| {
            self.elapsed_at_least(entry.created_at, &self.config.grayzone.delay)
        })
    }

    pub fn is_critical_rating_reached(&self, page: &Page) -> bool {
        let critical = &self.config.critical;
        match (page.rating, page.votes_count) {
            (Some(rating), Some(votes)) => rating < critical.rating && votes >= critical.votes,
            _ => false,
        }
    }

    /// Votes, popularity and rating must all reach the approval bar.
    pub fn is_approval_rating_reached(&self, page: &Page) -> bool {
        let approval = &self.config.approval;
        match (page.rating, page.votes_count, page.popularity) {
            (Some(rating), Some(votes), Some(popularity)) => {
                votes >= approval.votes
                    && popularity >= approval.popularity
                    && rating >= approval.rating
            }
            _ => false,
        }
    }

    pub fn is_ready_for_approval(&self, page: &Page) -> bool {
        if !self.is_approval_rating_reached(page) {
            return false;
        }
        page.date_tag_added(&self.config.tags.whitemark)
            .is_some_and(|added| self.elapsed_at_least(added, &self.config.approval.delay))
    }

    pub fn is_last_chance_expired(&self, page: &Page) -> bool {
        page.date_tag_added(&self.config.tags.deletion)
            .is_some_and(|added| self.elapsed_at_least(added, &self.config.critical.delay))
    }

    pub fn is_in_progress_expired(&self, page: &Page) -> bool {
        page.last_source_edit().is_some_and(|entry| {
            self.elapsed_at_least(entry.created_at, &self.config.in_progress.delay)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use cerberus_core::{ChangeKind, ChangeLogEntry, User};
    use chrono::{TimeDelta, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 20, 12, 0, 0).single().expect("now")
    }

    fn entry(days_ago: i64, kind: ChangeKind) -> ChangeLogEntry {
        ChangeLogEntry {
            rev_number: 1,
            created_at: now() - TimeDelta::days(days_ago),
            actor: User::system(),
            comment: String::new(),
            kind,
        }
    }

    fn tagged(days_ago: i64, tag: &str) -> ChangeLogEntry {
        entry(
            days_ago,
            ChangeKind::Tags {
                added: vec![tag.to_string()],
                removed: Vec::new(),
            },
        )
    }

    #[test]
    fn critical_rating_needs_low_rating_and_enough_votes() {
        let config = sample();
        let rules = Rules::new(&config, now());

        let low = Page::new("sandbox:a").with_metrics(1.5, 10, 90);
        assert!(rules.is_critical_rating_reached(&low));

        let fine = Page::new("sandbox:a").with_metrics(2.5, 10, 90);
        assert!(!rules.is_critical_rating_reached(&fine));

        let few_votes = Page::new("sandbox:a").with_metrics(1.5, 7, 90);
        assert!(!rules.is_critical_rating_reached(&few_votes));
    }

    #[test]
    fn unknown_metrics_never_satisfy_thresholds() {
        let config = sample();
        let rules = Rules::new(&config, now());

        let unknown = Page::new("sandbox:a")
            .with_tags(["к_удалению", "рекомендован"])
            .with_history(vec![
                tagged(30, "к_удалению"),
                tagged(30, "рекомендован"),
                entry(60, ChangeKind::New),
            ]);
        assert!(!rules.is_in_grayzone(&unknown));
        assert!(!rules.is_critical_rating_reached(&unknown));
        assert!(!rules.is_approval_rating_reached(&unknown));
        assert!(!rules.is_ready_for_approval(&unknown));

        let mut partial = unknown.clone();
        partial.rating = Some(-10.0);
        assert!(!rules.is_critical_rating_reached(&partial));
        partial.rating = Some(9.0);
        partial.votes_count = Some(100);
        assert!(!rules.is_approval_rating_reached(&partial));
    }

    #[test]
    fn grayzone_waits_for_delay_after_category_move() {
        let config = sample();
        let rules = Rules::new(&config, now());
        let moved = |days_ago| {
            Page::new("sandbox:a")
                .with_metrics(3.0, 4, 20)
                .with_history(vec![
                    entry(
                        days_ago,
                        ChangeKind::Name {
                            name: "sandbox:a".into(),
                            prev_name: "drafts:a".into(),
                        },
                    ),
                    entry(90, ChangeKind::New),
                ])
        };

        assert!(rules.is_in_grayzone(&moved(7)));
        assert!(!rules.is_in_grayzone(&moved(6)));

        let popular = moved(30).with_metrics(3.0, 4, 80);
        assert!(!rules.is_in_grayzone(&popular));
        let critical = moved(30).with_metrics(1.0, 4, 20);
        assert!(!rules.is_in_grayzone(&critical));
        assert!(!rules.is_in_grayzone(&Page::new("sandbox:a").with_metrics(3.0, 4, 20)));
    }

    #[test]
    fn approval_includes_rating_clause() {
        let config = sample();
        let rules = Rules::new(&config, now());
        assert!(rules.is_approval_rating_reached(&Page::new("a").with_metrics(5.0, 10, 70)));
        assert!(!rules.is_approval_rating_reached(&Page::new("a").with_metrics(4.9, 10, 70)));
        assert!(!rules.is_approval_rating_reached(&Page::new("a").with_metrics(5.0, 9, 70)));
        assert!(!rules.is_approval_rating_reached(&Page::new("a").with_metrics(5.0, 10, 69)));
    }

    #[test]
    fn ready_for_approval_counts_from_whitemark() {
        let config = sample();
        let rules = Rules::new(&config, now());
        let page = |days_ago| {
            Page::new("sandbox:a")
                .with_metrics(6.0, 12, 90)
                .with_tags(["рекомендован"])
                .with_history(vec![tagged(days_ago, "рекомендован"), entry(40, ChangeKind::New)])
        };

        assert!(rules.is_ready_for_approval(&page(2)));
        assert!(!rules.is_ready_for_approval(&page(0)));
        let untagged = Page::new("sandbox:a")
            .with_metrics(6.0, 12, 90)
            .with_history(vec![tagged(5, "рекомендован")]);
        assert!(!rules.is_ready_for_approval(&untagged));
    }

    #[test]
    fn last_chance_expires_after_critical_delay() {
        let config = sample();
        let rules = Rules::new(&config, now());
        let page = |days_ago| {
            Page::new("sandbox:a")
                .with_tags(["к_удалению"])
                .with_history(vec![tagged(days_ago, "_default:к_удалению")])
        };
        assert!(rules.is_last_chance_expired(&page(2)));
        assert!(rules.is_last_chance_expired(&page(1)));
        assert!(!rules.is_last_chance_expired(&page(0)));
        assert!(!rules.is_last_chance_expired(&Page::new("sandbox:a").with_tags(["к_удалению"])));
    }

    #[test]
    fn in_progress_expiry_uses_last_source_edit() {
        let config = sample();
        let rules = Rules::new(&config, now());
        let stale = Page::new("drafts:a").with_history(vec![
            tagged(1, "x"),
            entry(15, ChangeKind::Source),
            entry(40, ChangeKind::New),
        ]);
        assert!(rules.is_in_progress_expired(&stale));

        let fresh = Page::new("drafts:a").with_history(vec![
            entry(3, ChangeKind::Source),
            entry(40, ChangeKind::New),
        ]);
        assert!(!rules.is_in_progress_expired(&fresh));
        assert!(!rules.is_in_progress_expired(&Page::new("drafts:a")));
    }

    #[test]
    fn unrepresentable_delay_never_elapses() {
        let mut config = sample();
        config.critical.delay = PeriodSpec {
            weeks: 1_000_000_000_000,
            ..PeriodSpec::default()
        };
        let rules = Rules::new(&config, now());
        let page = Page::new("sandbox:a")
            .with_tags(["к_удалению"])
            .with_history(vec![tagged(3650, "к_удалению")]);
        assert!(!rules.is_last_chance_expired(&page));
    }
}
