//! Related-item ranking over the item set a requester is browsing.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::item::Item;

/// Fewest recorded interactions worth training a model on.
pub const MIN_INTERACTIONS: usize = 5;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "for", "in", "of", "on", "the", "to", "with",
];

/// An item suggested by a ranking strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedItem {
    #[serde(flatten)]
    pub item: Item,
    pub strategy: String,
    pub score: f64,
}

pub trait Ranker: Send + Sync {
    /// Strategy tag attached to every result.
    fn strategy(&self) -> &str;

    fn rank(&self, clicked_name: &str, items: &[Item]) -> Vec<RankedItem>;
}

/// TF-IDF cosine similarity over product-name tokens.
pub struct ContentSimilarityRanker {
    max_results: usize,
}

impl ContentSimilarityRanker {
    pub fn new(max_results: usize) -> Self {
        Self { max_results }
    }
}

impl Default for ContentSimilarityRanker {
    fn default() -> Self {
        Self::new(5)
    }
}

fn tokenize(name: &str) -> Vec<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1 && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// L2-normalized TF-IDF vector per document.
fn tfidf_vectors(documents: &[Vec<String>]) -> Vec<HashMap<&str, f64>> {
    let n = documents.len() as f64;
    let mut document_frequency: HashMap<&str, f64> = HashMap::new();
    for doc in documents {
        let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
        for term in unique {
            *document_frequency.entry(term).or_default() += 1.0;
        }
    }

    documents
        .iter()
        .map(|doc| {
            let mut vector: HashMap<&str, f64> = HashMap::new();
            for term in doc {
                *vector.entry(term.as_str()).or_default() += 1.0;
            }
            for (term, weight) in vector.iter_mut() {
                let df = document_frequency[term];
                *weight *= ((1.0 + n) / (1.0 + df)).ln() + 1.0;
            }
            let norm = vector.values().map(|w| w * w).sum::<f64>().sqrt();
            if norm > 0.0 {
                for weight in vector.values_mut() {
                    *weight /= norm;
                }
            }
            vector
        })
        .collect()
}

/// Dot product of two L2-normalized sparse vectors.
fn cosine<K: Eq + std::hash::Hash>(a: &HashMap<K, f64>, b: &HashMap<K, f64>) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(term, w)| large.get(term).map(|v| w * v))
        .sum()
}

impl Ranker for ContentSimilarityRanker {
    fn strategy(&self) -> &str {
        "similar"
    }

    fn rank(&self, clicked_name: &str, items: &[Item]) -> Vec<RankedItem> {
        if items.len() < 2 {
            return Vec::new();
        }
        let Some(target) = items.iter().position(|i| i.name == clicked_name) else {
            return Vec::new();
        };

        let documents: Vec<Vec<String>> = items.iter().map(|i| tokenize(&i.name)).collect();
        let vectors = tfidf_vectors(&documents);

        let mut scored: Vec<(usize, f64)> = vectors
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != target)
            .map(|(i, v)| (i, cosine(&vectors[target], v)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
            .into_iter()
            .take(self.max_results)
            .map(|(i, score)| RankedItem {
                item: items[i].clone(),
                strategy: self.strategy().to_string(),
                score,
            })
            .collect()
    }
}

/// Item-to-item model learned from requester interaction sessions.
///
/// Consecutive interactions within a session link two products. Each row
/// holds a product's link counts plus its own degree on the diagonal and is
/// L2-normalized, so products reached through the same neighbours score
/// close to each other.
pub struct InteractionModel {
    rows: HashMap<String, HashMap<String, f64>>,
    max_results: usize,
}

impl InteractionModel {
    /// `None` when there is too little data or no session links two products.
    pub fn train(sessions: &[Vec<String>], max_results: usize) -> Option<Self> {
        let interactions: usize = sessions.iter().map(Vec::len).sum();
        if interactions < MIN_INTERACTIONS {
            return None;
        }

        let mut rows: HashMap<String, HashMap<String, f64>> = HashMap::new();
        for session in sessions {
            for pair in session.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                if a == b {
                    continue;
                }
                *rows.entry(a.clone()).or_default().entry(b.clone()).or_default() += 1.0;
                *rows.entry(b.clone()).or_default().entry(a.clone()).or_default() += 1.0;
            }
        }
        if rows.is_empty() {
            return None;
        }

        for (name, row) in rows.iter_mut() {
            let degree: f64 = row.values().sum();
            row.insert(name.clone(), degree);
            let norm = row.values().map(|w| w * w).sum::<f64>().sqrt();
            for weight in row.values_mut() {
                *weight /= norm;
            }
        }

        Some(Self { rows, max_results })
    }

    pub fn products(&self) -> usize {
        self.rows.len()
    }
}

impl Ranker for InteractionModel {
    fn strategy(&self) -> &str {
        "ai_powered"
    }

    fn rank(&self, clicked_name: &str, items: &[Item]) -> Vec<RankedItem> {
        let Some(target) = self.rows.get(clicked_name) else {
            return Vec::new();
        };

        let mut scored: Vec<(&Item, f64)> = items
            .iter()
            .filter(|i| i.name != clicked_name)
            .filter_map(|i| Some((i, cosine(target, self.rows.get(&i.name)?))))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
            .into_iter()
            .take(self.max_results)
            .map(|(item, score)| RankedItem {
                item: item.clone(),
                strategy: self.strategy().to_string(),
                score,
            })
            .collect()
    }
}

/// Interaction models cached per search query, plus each requester's
/// latest query so a recommendation finds the model for what they browse.
pub struct RecommendationModels {
    max_results: usize,
    by_query: RwLock<HashMap<String, Arc<InteractionModel>>>,
    last_query: RwLock<HashMap<String, String>>,
}

impl RecommendationModels {
    pub fn new(max_results: usize) -> Self {
        Self {
            max_results,
            by_query: RwLock::new(HashMap::new()),
            last_query: RwLock::new(HashMap::new()),
        }
    }

    pub fn note_query(&self, requester: &str, query: &str) {
        self.last_query
            .write()
            .insert(requester.to_string(), query.to_string());
    }

    pub fn query_for(&self, requester: &str) -> Option<String> {
        self.last_query.read().get(requester).cloned()
    }

    /// Retrain the model for `query`. Returns whether a model is now cached.
    pub fn train(&self, query: &str, sessions: &[Vec<String>]) -> bool {
        match InteractionModel::train(sessions, self.max_results) {
            Some(model) => {
                info!(
                    "Trained interaction model for '{}' over {} products",
                    query,
                    model.products()
                );
                self.by_query.write().insert(query.to_string(), Arc::new(model));
                true
            }
            None => {
                debug!("Not enough interactions to train a model for '{}'", query);
                self.by_query.write().remove(query);
                false
            }
        }
    }

    pub fn model_for_requester(&self, requester: &str) -> Option<Arc<InteractionModel>> {
        let query = self.query_for(requester)?;
        self.by_query.read().get(&query).cloned()
    }
}
