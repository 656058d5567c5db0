//! Lexicon-driven auto-linking.
//!
//! Documents mention known entities by name without markup. The weaver
//! recovers those mentions as confidence-scored edges, using a snapshot of
//! the lexicon taken once per ingestion run.
//!
//! | Signal | Edge type | Confidence | Provenance |
//! |--------|-----------|-----------:|------------|
//! | `[TYPE: Target]` | `TYPE` (upper snake case) | 1.0 | `explicit_tag` |
//! | `[[Target]]` | `CITES` | 1.0 | `wiki_link` |
//! | title appears as a whole word | `MENTIONS` | 0.9 | `title_match` |
//! | alias appears as a whole word | `MENTIONS` | 0.75 | `alias_match` |
//! | `tag-some-slug` | `EXEMPLIFIES` | 1.0 | `manual_tag` |
//! | every significant word of a multi-word title appears | `MENTIONS` | 0.5 | `keyword_match` |
//!
//! Only the strongest edge per target survives. Explicit tags, slug tags,
//! and wiki links resolve their target directly and are cut out of the text
//! before the name scan, so `[DEPENDS_ON: Store]` never also yields a
//! `MENTIONS` edge to `Store`.
//!
//! # Super-node gate
//!
//! [`LexiconWeaver::weave_into`] refuses new edges into a target that
//! already has more than `super_node_threshold` incident edges. A handful of
//! ubiquitous entities would otherwise absorb most of the graph and collapse
//! community detection into one cluster.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{ContextSource, LexiconEntry};
use crate::store::{deterministic_id, Batch};
use crate::tokenizer::{find_term, MIN_TERM_CHARS};

pub const EXPLICIT_CONFIDENCE: f64 = 1.0;
pub const TITLE_CONFIDENCE: f64 = 0.9;
pub const ALIAS_CONFIDENCE: f64 = 0.75;
pub const KEYWORD_CONFIDENCE: f64 = 0.5;

pub const MENTIONS: &str = "MENTIONS";
pub const CITES: &str = "CITES";
pub const EXEMPLIFIES: &str = "EXEMPLIFIES";

pub const DEFAULT_SUPER_NODE_THRESHOLD: usize = 50;

static WIKI_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[([^\[\]|\n]+)(?:\|[^\[\]\n]*)?\]\]").expect("valid regex")
});

static EXPLICIT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([A-Za-z][A-Za-z_ -]*):\s*([^\[\]\n]+)\]").expect("valid regex")
});

static SLUG_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\btag-([a-z0-9]+(?:-[a-z0-9]+)*)").expect("valid regex")
});

const STOPWORDS: &[&str] = &[
    "and", "are", "but", "for", "from", "how", "into", "its", "not", "onto", "our", "that",
    "the", "this", "was", "what", "when", "who", "why", "with", "your",
];

/// An edge proposed by [`LexiconWeaver::weave`], sourced at the woven node.
#[derive(Debug, Clone, PartialEq)]
pub struct WovenEdge {
    pub target: String,
    pub edge_type: String,
    pub confidence: f64,
    pub context_source: ContextSource,
}

#[derive(Debug)]
struct Entity {
    id: String,
    title: String,
    aliases: Vec<String>,
    keywords: Vec<String>,
}

/// Super-node gate counters for edges offered to [`LexiconWeaver::weave_into`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub checked: usize,
    pub rejected: usize,
}

impl GateStats {
    pub fn add(&mut self, other: GateStats) {
        self.checked += other.checked;
        self.rejected += other.rejected;
    }
}

/// Result of [`LexiconWeaver::weave_into`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeaveOutcome {
    pub written: usize,
    pub gate: GateStats,
}

/// Links text to the entities of a lexicon snapshot.
#[derive(Debug)]
pub struct LexiconWeaver {
    entities: Vec<Entity>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    by_slug: HashMap<String, usize>,
    super_node_threshold: Option<usize>,
}

impl Default for LexiconWeaver {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl LexiconWeaver {
    pub fn new(mut lexicon: Vec<LexiconEntry>) -> Self {
        lexicon.sort_by(|a, b| a.id.cmp(&b.id));

        let entities: Vec<Entity> = lexicon
            .into_iter()
            .map(|entry| {
                let title = entry.title.trim().to_lowercase();
                Entity {
                    keywords: significant_words(&title),
                    aliases: entry
                        .aliases
                        .iter()
                        .map(|a| a.trim().to_lowercase())
                        .filter(|a| a.chars().count() >= MIN_TERM_CHARS)
                        .collect(),
                    title,
                    id: entry.id,
                }
            })
            .collect();

        let mut by_id = HashMap::with_capacity(entities.len());
        let mut by_name = HashMap::new();
        let mut by_slug = HashMap::new();
        for (idx, entity) in entities.iter().enumerate() {
            by_id.insert(entity.id.clone(), idx);
            by_name.entry(entity.title.clone()).or_insert(idx);
            by_slug.entry(deterministic_id(&entity.title)).or_insert(idx);
        }
        // Titles win over aliases when a name is ambiguous.
        for (idx, entity) in entities.iter().enumerate() {
            for alias in &entity.aliases {
                by_name.entry(alias.clone()).or_insert(idx);
                by_slug.entry(deterministic_id(alias)).or_insert(idx);
            }
        }
        by_slug.remove("");

        Self {
            entities,
            by_id,
            by_name,
            by_slug,
            super_node_threshold: Some(DEFAULT_SUPER_NODE_THRESHOLD),
        }
    }

    /// Incident-edge count above which a target takes no new edges. `0` disables the gate.
    pub fn with_super_node_threshold(mut self, threshold: usize) -> Self {
        self.super_node_threshold = (threshold > 0).then_some(threshold);
        self
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Resolve a reference by id, title, alias, or the id its text would derive.
    pub fn resolve(&self, reference: &str) -> Option<&str> {
        let reference = reference.trim();
        let idx = self
            .by_id
            .get(reference)
            .or_else(|| self.by_name.get(&reference.to_lowercase()))
            .or_else(|| self.by_id.get(&deterministic_id(reference)))?;
        Some(self.entities[*idx].id.as_str())
    }

    /// Resolve the slug of a `tag-<slug>` marker by title slug, alias slug, or id.
    pub fn resolve_slug(&self, slug: &str) -> Option<&str> {
        let slug = slug.to_lowercase();
        let idx = self.by_slug.get(&slug).or_else(|| self.by_id.get(&slug))?;
        Some(self.entities[*idx].id.as_str())
    }

    /// Edges from `node_id` to every entity `text` references, sorted by target.
    pub fn weave(&self, node_id: &str, text: &str) -> Vec<WovenEdge> {
        let mut best: HashMap<String, WovenEdge> = HashMap::new();
        let mut cut: Vec<Range<usize>> = Vec::new();

        for caps in WIKI_LINK.captures_iter(text) {
            let (Some(whole), Some(target)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            cut.push(whole.range());
            match self.resolve(target.as_str()) {
                Some(id) if id != node_id => offer(
                    &mut best,
                    id,
                    CITES.to_string(),
                    EXPLICIT_CONFIDENCE,
                    ContextSource::WikiLink,
                ),
                Some(_) => {}
                None => debug!(node = node_id, target = target.as_str(), "Unresolved wiki link"),
            }
        }

        for caps in EXPLICIT_TAG.captures_iter(text) {
            let (Some(whole), Some(kind), Some(target)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            if overlaps(&cut, &whole.range()) || text[whole.end()..].starts_with('(') {
                // Inside a wiki link, or the label of a markdown link.
                continue;
            }
            cut.push(whole.range());

            let edge_type = upper_snake(kind.as_str());
            match self.resolve(target.as_str()) {
                Some(id) if id != node_id => offer(
                    &mut best,
                    id,
                    edge_type,
                    EXPLICIT_CONFIDENCE,
                    ContextSource::ExplicitTag,
                ),
                Some(_) => {}
                None => warn!(
                    node = node_id,
                    tag = edge_type.as_str(),
                    target = target.as_str().trim(),
                    "Explicit tag target not in lexicon, skipping"
                ),
            }
        }

        for caps in SLUG_TAG.captures_iter(text) {
            let (Some(whole), Some(slug)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if overlaps(&cut, &whole.range()) {
                continue;
            }
            cut.push(whole.range());
            match self.resolve_slug(slug.as_str()) {
                Some(id) if id != node_id => offer(
                    &mut best,
                    id,
                    EXEMPLIFIES.to_string(),
                    EXPLICIT_CONFIDENCE,
                    ContextSource::ManualTag,
                ),
                Some(_) => {}
                None => debug!(node = node_id, slug = slug.as_str(), "Unresolved slug tag"),
            }
        }

        let scanned = blank_out(text, &cut).to_lowercase();

        for entity in &self.entities {
            if entity.id == node_id {
                continue;
            }
            if best
                .get(&entity.id)
                .is_some_and(|e| e.confidence >= TITLE_CONFIDENCE)
            {
                continue;
            }

            let signal = if entity.title.chars().count() >= MIN_TERM_CHARS
                && find_term(&scanned, &entity.title).is_some()
            {
                Some((TITLE_CONFIDENCE, ContextSource::TitleMatch))
            } else if entity
                .aliases
                .iter()
                .any(|a| find_term(&scanned, a).is_some())
            {
                Some((ALIAS_CONFIDENCE, ContextSource::AliasMatch))
            } else if entity.keywords.len() >= 2
                && entity
                    .keywords
                    .iter()
                    .all(|k| find_term(&scanned, k).is_some())
            {
                Some((KEYWORD_CONFIDENCE, ContextSource::KeywordMatch))
            } else {
                None
            };

            if let Some((confidence, source)) = signal {
                offer(&mut best, &entity.id, MENTIONS.to_string(), confidence, source);
            }
        }

        let mut edges: Vec<WovenEdge> = best.into_values().collect();
        edges.sort_by(|a, b| a.target.cmp(&b.target));
        edges
    }

    /// Weave `text` and write the edges through `batch`, subject to the
    /// super-node gate. Edges that already exist are always rewritten.
    pub async fn weave_into(&self, batch: &mut Batch, node_id: &str, text: &str) -> Result<WeaveOutcome> {
        let edges = self.weave(node_id, text);
        let mut outcome = WeaveOutcome::default();
        for edge in &edges {
            if let Some(threshold) = self.super_node_threshold {
                outcome.gate.checked += 1;
                let degree = batch.degree(&edge.target).await?;
                if degree > threshold
                    && !batch.edge_exists(node_id, &edge.target, &edge.edge_type).await?
                {
                    outcome.gate.rejected += 1;
                    debug!(
                        source = node_id,
                        target = %edge.target,
                        degree,
                        threshold,
                        "Super-node gate rejected edge"
                    );
                    continue;
                }
            }
            batch
                .upsert_edge(
                    node_id,
                    &edge.target,
                    &edge.edge_type,
                    edge.confidence,
                    1.0,
                    edge.context_source,
                )
                .await?;
            outcome.written += 1;
        }
        Ok(outcome)
    }
}

/// Keep the candidate only if it beats what is already known for `target`.
fn offer(
    best: &mut HashMap<String, WovenEdge>,
    target: &str,
    edge_type: String,
    confidence: f64,
    context_source: ContextSource,
) {
    if best
        .get(target)
        .is_some_and(|existing| existing.confidence >= confidence)
    {
        return;
    }
    best.insert(
        target.to_string(),
        WovenEdge {
            target: target.to_string(),
            edge_type,
            confidence,
            context_source,
        },
    );
}

fn overlaps(ranges: &[Range<usize>], r: &Range<usize>) -> bool {
    ranges.iter().any(|c| c.start < r.end && r.start < c.end)
}

/// Replace each range with spaces so neighbouring words stay separated.
fn blank_out(text: &str, ranges: &[Range<usize>]) -> String {
    if ranges.is_empty() {
        return text.to_string();
    }
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|r| r.start);

    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    for r in sorted {
        if r.start < pos {
            continue;
        }
        out.push_str(&text[pos..r.start]);
        out.push(' ');
        pos = r.end;
    }
    out.push_str(&text[pos..]);
    out
}

fn upper_snake(kind: &str) -> String {
    kind.split(|c: char| c == ' ' || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .map(str::to_uppercase)
        .collect::<Vec<_>>()
        .join("_")
}

fn significant_words(title: &str) -> Vec<String> {
    let mut words: Vec<String> = title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_TERM_CHARS && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect();
    words.dedup();
    words
}
