//! Forum message templates and the deletion phrase picker.

use std::collections::{BTreeMap, BTreeSet};

use cerberus_core::Page;
use chrono::{DateTime, TimeDelta, Utc};
use minijinja::Environment;
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::DeletionPhrases;

/// Rewrites a `{key}` message template into minijinja source. Only the given
/// keys become expressions; other text, unknown placeholders and stray
/// braces included, is emitted as a string literal so it renders verbatim.
fn jinja_source(template: &str, keys: &[&str]) -> String {
    let mut source = String::with_capacity(template.len() + 16);
    let mut literal = String::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let key = after.find('}').map(|close| &after[..close]);
        match key.filter(|key| keys.contains(key)) {
            Some(key) => {
                literal.push_str(&rest[..open]);
                push_literal(&mut source, &literal);
                literal.clear();
                source.push_str("{{ ");
                source.push_str(key);
                source.push_str(" }}");
                rest = &after[key.len() + 1..];
            }
            None => {
                literal.push_str(&rest[..=open]);
                rest = after;
            }
        }
    }
    literal.push_str(rest);
    push_literal(&mut source, &literal);
    source
}

fn push_literal(source: &mut String, text: &str) {
    if !text.contains('{') {
        source.push_str(text);
        return;
    }
    // JSON string escapes are a subset of minijinja's.
    match serde_json::to_string(text) {
        Ok(quoted) => {
            source.push_str("{{ ");
            source.push_str(&quoted);
            source.push_str(" }}");
        }
        Err(_) => source.push_str(text),
    }
}

/// Substitutes `{key}` placeholders through minijinja. Unknown keys and
/// unmatched braces are kept as written, and substituted values are never
/// expanded again.
pub fn render_template(
    template: &str,
    values: &[(&str, String)],
) -> Result<String, minijinja::Error> {
    let keys: Vec<&str> = values.iter().map(|(key, _)| *key).collect();
    let source = jinja_source(template, &keys);
    let context: BTreeMap<&str, &str> = values
        .iter()
        .map(|(key, value)| (*key, value.as_str()))
        .collect();

    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.render_str(&source, context)
}

fn metric<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "?".to_string())
}

/// Ratings always carry one decimal, so 1.0 shows as "1.0" and not "1".
fn rating(value: Option<f64>) -> String {
    value
        .map(|rating| format!("{rating:.1}"))
        .unwrap_or_else(|| "?".to_string())
}

pub fn grayzone_notice(template: &str, page: &Page) -> Result<String, minijinja::Error> {
    render_template(
        template,
        &[
            ("popularity", metric(page.popularity)),
            ("votes", metric(page.votes_count)),
            ("rating", rating(page.rating)),
        ],
    )
}

/// Picks the phrase for a new deletion mark.
///
/// One uniform draw in `[0, 1)` decides: easter phrases whose weight is at
/// least the draw become candidates and one of them is chosen by weight;
/// with no candidate the phrase comes uniformly from the common pool.
pub fn pick_deletion_phrase<'p, R: Rng>(
    phrases: &'p DeletionPhrases,
    rng: &mut R,
) -> &'p str {
    let draw: f64 = rng.gen();
    let candidates: Vec<_> = phrases
        .easter
        .iter()
        .filter(|phrase| phrase.weight >= draw)
        .collect();

    if !candidates.is_empty() {
        return match WeightedIndex::new(candidates.iter().map(|p| p.weight)) {
            Ok(index) => &candidates[index.sample(rng)].text,
            Err(_) => &candidates[0].text,
        };
    }

    phrases
        .common
        .choose(rng)
        .map(String::as_str)
        .unwrap_or_default()
}

pub fn deletion_notice<R: Rng>(
    phrases: &DeletionPhrases,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Result<String, minijinja::Error> {
    let next_day = (now + TimeDelta::days(1)).format("%d.%m.%Y").to_string();
    render_template(pick_deletion_phrase(phrases, rng), &[("next_day", next_day)])
}

/// Tags as shown in reports; category-qualified tags get a bold category.
pub fn format_report_tags(tags: &BTreeSet<String>) -> String {
    tags.iter()
        .map(|tag| match tag.split_once(':') {
            Some((category, name)) => format!("**{category}:**{name}"),
            None => tag.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn report_line(template: &str, page: &Page) -> Result<String, minijinja::Error> {
    render_template(
        template,
        &[
            ("title", page.title_or_id().to_string()),
            ("rating", rating(page.rating)),
            ("votes", metric(page.votes_count)),
            ("popularity", metric(page.popularity)),
            ("author", page.author_or_system().username),
            ("tags", format_report_tags(&page.tags)),
        ],
    )
}

/// Consolidated deletion report body: the prelude line followed by one line
/// per deleted page.
pub fn deletion_report(
    prepend: &str,
    line: &str,
    pages: &[Page],
) -> Result<String, minijinja::Error> {
    let mut lines = Vec::with_capacity(pages.len() + 1);
    if !prepend.is_empty() {
        lines.push(prepend.to_string());
    }
    for page in pages {
        lines.push(report_line(line, page)?);
    }
    Ok(lines.join("\n"))
}
