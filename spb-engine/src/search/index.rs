//! Inverted index and scoring
//!
//! Score for an item is
//! `Σ_terms Σ_fields weight(field) × strength(term, field) / (terms × Σ weights)`
//! where strength is 1.0 for an exact token, 0.5 for a token containing the
//! term (terms of 3+ characters only) and 0 otherwise. The strongest match
//! per term and field counts once.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use spb_common::models::{AgendaItem, Meeting};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::tokenizer::tokenize;

const EXACT_MATCH: f64 = 1.0;
const PARTIAL_MATCH: f64 = 0.5;
/// Shorter terms only match exactly ("a" would otherwise hit everything)
const MIN_PARTIAL_TERM_LEN: usize = 3;

/// Indexed text fields, in descending weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Title,
    Topics,
    Description,
    Analysis,
}

impl Field {
    pub const ALL: [Field; 4] = [Field::Title, Field::Topics, Field::Description, Field::Analysis];

    pub fn weight(self) -> f64 {
        match self {
            Field::Title => 4.0,
            Field::Topics => 3.0,
            Field::Description => 2.0,
            Field::Analysis => 1.0,
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

fn max_weight_per_term() -> f64 {
    Field::ALL.iter().map(|f| f.weight()).sum()
}

/// Post-ranking filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    /// Keep items carrying at least one of these topics (empty = no filter)
    pub topics: Vec<String>,
}

/// One ranked result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub item_id: String,
    pub meeting_id: String,
    pub meeting_date: NaiveDate,
    pub title: String,
    pub topics: BTreeSet<String>,
    /// Normalized to `(0, 1]`
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchStats {
    pub indexed_items: usize,
    pub vocabulary_size: usize,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct IndexedItem {
    item_id: String,
    meeting_id: String,
    meeting_date: NaiveDate,
    title: String,
    topics: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy)]
struct Posting {
    doc: usize,
    /// Bitset of [`Field`]s containing the token
    fields: u8,
}

/// Immutable index snapshot
#[derive(Debug, Clone)]
pub struct SearchIndex {
    docs: Vec<IndexedItem>,
    postings: BTreeMap<String, Vec<Posting>>,
    built_at: DateTime<Utc>,
}

impl SearchIndex {
    pub fn empty() -> Self {
        Self::build(&[], &[])
    }

    /// Build from full scans of meetings and items
    pub fn build(meetings: &[Meeting], items: &[AgendaItem]) -> Self {
        let dates: HashMap<&str, NaiveDate> = meetings
            .iter()
            .map(|m| (m.meeting_id.as_str(), m.meeting_date))
            .collect();

        let mut docs = Vec::with_capacity(items.len());
        let mut by_token: BTreeMap<String, BTreeMap<usize, u8>> = BTreeMap::new();

        for item in items {
            let doc = docs.len();
            let topics_text = item.topics.iter().cloned().collect::<Vec<_>>().join(" ");
            let fields = [
                (Field::Title, item.title.as_str()),
                (Field::Topics, topics_text.as_str()),
                (Field::Description, item.description.as_deref().unwrap_or("")),
                (Field::Analysis, item.ai_analysis.as_deref().unwrap_or("")),
            ];

            for (field, text) in fields {
                for token in tokenize(text) {
                    *by_token.entry(token).or_default().entry(doc).or_insert(0) |= field.bit();
                }
            }

            docs.push(IndexedItem {
                item_id: item.item_id.clone(),
                meeting_id: item.meeting_id.clone(),
                // Items always reference a stored meeting; MIN only sorts orphans last
                meeting_date: dates
                    .get(item.meeting_id.as_str())
                    .copied()
                    .unwrap_or(NaiveDate::MIN),
                title: item.title.clone(),
                topics: item.topics.clone(),
            });
        }

        let postings = by_token
            .into_iter()
            .map(|(token, docs)| {
                let list = docs.into_iter().map(|(doc, fields)| Posting { doc, fields }).collect();
                (token, list)
            })
            .collect();

        Self {
            docs,
            postings,
            built_at: Utc::now(),
        }
    }

    pub fn stats(&self) -> SearchStats {
        SearchStats {
            indexed_items: self.docs.len(),
            vocabulary_size: self.postings.len(),
            built_at: self.built_at,
        }
    }

    fn match_strength(token: &str, term: &str) -> f64 {
        if token == term {
            EXACT_MATCH
        } else if term.chars().count() >= MIN_PARTIAL_TERM_LEN && token.contains(term) {
            PARTIAL_MATCH
        } else {
            0.0
        }
    }

    /// Raw per-document score sums for the query terms
    fn score_terms(&self, terms: &[String]) -> HashMap<usize, f64> {
        let mut scores: HashMap<usize, f64> = HashMap::new();

        for term in terms {
            let mut best: BTreeMap<(usize, Field), f64> = BTreeMap::new();

            let mut visit = |token: &str, postings: &[Posting]| {
                let strength = Self::match_strength(token, term);
                if strength == 0.0 {
                    return;
                }
                for posting in postings {
                    for field in Field::ALL {
                        if posting.fields & field.bit() != 0 {
                            let entry = best.entry((posting.doc, field)).or_insert(0.0);
                            if strength > *entry {
                                *entry = strength;
                            }
                        }
                    }
                }
            };

            if term.chars().count() >= MIN_PARTIAL_TERM_LEN {
                // Vocabulary scan covers exact and substring matches
                for (token, postings) in &self.postings {
                    visit(token, postings);
                }
            } else if let Some(postings) = self.postings.get(term.as_str()) {
                visit(term, postings);
            }

            for ((doc, field), strength) in best {
                *scores.entry(doc).or_insert(0.0) += field.weight() * strength;
            }
        }

        scores
    }

    /// Ranked search; deterministic for identical inputs
    pub fn search(&self, query: &str, filters: &SearchFilters, limit: usize) -> Vec<SearchHit> {
        let terms = tokenize(query);
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }

        let max_score = terms.len() as f64 * max_weight_per_term();
        let mut ranked: Vec<(usize, f64)> = self
            .score_terms(&terms)
            .into_iter()
            .filter(|(_, raw)| *raw > 0.0)
            .map(|(doc, raw)| (doc, (raw / max_score).min(1.0)))
            .collect();

        ranked.sort_by(|(a_doc, a_score), (b_doc, b_score)| {
            let (a, b) = (&self.docs[*a_doc], &self.docs[*b_doc]);
            b_score
                .total_cmp(a_score)
                .then_with(|| b.meeting_date.cmp(&a.meeting_date))
                .then_with(|| a.item_id.cmp(&b.item_id))
        });

        let wanted: BTreeSet<String> = filters
            .topics
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        ranked
            .into_iter()
            .filter(|(doc, _)| wanted.is_empty() || !self.docs[*doc].topics.is_disjoint(&wanted))
            .take(limit)
            .map(|(doc, score)| {
                let d = &self.docs[doc];
                SearchHit {
                    item_id: d.item_id.clone(),
                    meeting_id: d.meeting_id.clone(),
                    meeting_date: d.meeting_date,
                    title: d.title.clone(),
                    topics: d.topics.clone(),
                    score,
                }
            })
            .collect()
    }

    /// Score of one item for a query (0 when it does not match)
    pub fn score_of(&self, query: &str, item_id: &str) -> f64 {
        let terms = tokenize(query);
        if terms.is_empty() {
            return 0.0;
        }
        let Some(doc) = self.docs.iter().position(|d| d.item_id == item_id) else {
            return 0.0;
        };
        let raw = self.score_terms(&terms).get(&doc).copied().unwrap_or(0.0);
        (raw / (terms.len() as f64 * max_weight_per_term())).min(1.0)
    }
}
