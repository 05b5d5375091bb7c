use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::model::Clip;
use crate::plugin::{HookContext, Plugin, PluginError, PluginOptions, PriorityTier};

pub const NAME: &str = "KnowledgeGraph";

const MAX_KEYWORDS: usize = 8;
const STOPWORDS: &[&str] = &[
    "about", "after", "also", "and", "are", "but", "can", "for", "from", "has", "have", "into",
    "just", "not", "that", "the", "then", "there", "this", "was", "were", "will", "with", "you",
    "your",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entity {
    pub text: String,
    pub label: &'static str,
}

/// Size of the remembered window, logged on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct GraphStats {
    clips: usize,
    entities: usize,
    edges: usize,
}

struct Node {
    fingerprint: String,
    words: HashSet<String>,
    entities: usize,
    edges: usize,
}

struct Extractors {
    url: Regex,
    email: Regex,
    name: Regex,
    date: Regex,
}

impl Extractors {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            url: Regex::new(r"https?://\S+")?,
            email: Regex::new(r"\b[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}\b")?,
            name: Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)+\b")?,
            date: Regex::new(r"\b\d{1,2}[-/]\d{1,2}[-/]\d{2,4}\b")?,
        })
    }

    fn extract(&self, content: &str) -> Vec<Entity> {
        let mut entities = Vec::new();
        for (pattern, label, limit) in [
            (&self.url, "URL", 5),
            (&self.email, "EMAIL", 5),
            (&self.name, "PERSON", 5),
            (&self.date, "DATE", 3),
        ] {
            entities.extend(pattern.find_iter(content).take(limit).map(|found| Entity {
                text: found.as_str().to_string(),
                label,
            }));
        }
        entities
    }
}

/// Links clips that share vocabulary and boosts search hits on the query's terms.
pub struct KnowledgeGraph {
    min_similarity: f64,
    max_relationships: usize,
    window: usize,
    extractors: Option<Extractors>,
    nodes: Mutex<VecDeque<Node>>,
}

impl Default for KnowledgeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self {
            min_similarity: 0.5,
            max_relationships: 10,
            window: 200,
            extractors: None,
            nodes: Mutex::new(VecDeque::new()),
        }
    }

    fn stats(&self) -> GraphStats {
        let Ok(nodes) = self.nodes.lock() else {
            return GraphStats::default();
        };
        GraphStats {
            clips: nodes.len(),
            entities: nodes.iter().map(|node| node.entities).sum(),
            edges: nodes.iter().map(|node| node.edges).sum(),
        }
    }

    fn lock_nodes(&self) -> Result<MutexGuard<'_, VecDeque<Node>>, PluginError> {
        self.nodes
            .lock()
            .map_err(|_| PluginError::Runtime("knowledge graph state poisoned".to_string()))
    }

    /// Most similar remembered clips, best first.
    fn related(&self, nodes: &VecDeque<Node>, fingerprint: &str, words: &HashSet<String>) -> Vec<(String, f64)> {
        let mut related: Vec<(String, f64)> = nodes
            .iter()
            .filter(|node| node.fingerprint != fingerprint)
            .map(|node| (node.fingerprint.clone(), jaccard(words, &node.words)))
            .filter(|(_, similarity)| *similarity >= self.min_similarity && *similarity > 0.0)
            .collect();
        related.sort_by(|a, b| b.1.total_cmp(&a.1));
        related.truncate(self.max_relationships);
        related
    }

    fn remember(&self, nodes: &mut VecDeque<Node>, node: Node) {
        nodes.retain(|existing| existing.fingerprint != node.fingerprint);
        nodes.push_back(node);
        while nodes.len() > self.window {
            nodes.pop_front();
        }
    }
}

fn words(content: &str) -> HashSet<String> {
    content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(left: &HashSet<String>, right: &HashSet<String>) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(right).count();
    let union = left.union(right).count();
    shared as f64 / union as f64
}

/// Frequent non-trivial words, most frequent first, ties alphabetical.
fn keywords(content: &str) -> Vec<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for word in content
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|word| word.chars().count() >= 3 && !STOPWORDS.contains(&word.as_str()))
    {
        *counts.entry(word).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(MAX_KEYWORDS).map(|(word, _)| word).collect()
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[async_trait]
impl Plugin for KnowledgeGraph {
    fn name(&self) -> &str {
        NAME
    }

    fn tier(&self) -> PriorityTier {
        PriorityTier::Medium
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn initialize(&mut self, options: &PluginOptions) -> Result<(), PluginError> {
        let min_similarity = options.f64_or("min_similarity", 0.5)?;
        if !(0.0..=1.0).contains(&min_similarity) {
            return Err(PluginError::Config(
                "option `min_similarity` must be between 0 and 1".to_string(),
            ));
        }
        self.min_similarity = min_similarity;
        self.max_relationships = options.u64_or("max_relationships", 10)? as usize;
        self.window = options.u64_or("window", 200)?.max(1) as usize;
        self.extractors =
            Some(Extractors::compile().map_err(|err| PluginError::Init(err.to_string()))?);
        info!(
            min_similarity = self.min_similarity,
            window = self.window,
            "knowledge graph ready"
        );
        Ok(())
    }

    async fn process_clip(&self, mut clip: Clip, _ctx: HookContext) -> Result<Clip, PluginError> {
        let extractors = self
            .extractors
            .as_ref()
            .ok_or_else(|| PluginError::Runtime("knowledge graph used before initialize".to_string()))?;
        let entities = extractors.extract(clip.content());
        let clip_words = words(clip.content());

        let related = {
            let mut nodes = self.lock_nodes()?;
            let related = self.related(&nodes, clip.fingerprint(), &clip_words);
            self.remember(
                &mut nodes,
                Node {
                    fingerprint: clip.fingerprint().to_string(),
                    words: clip_words,
                    entities: entities.len(),
                    edges: related.len(),
                },
            );
            related
        };

        for (fingerprint, _) in &related {
            clip.metadata.add_relationship(fingerprint.as_str());
        }
        let related_json: Vec<_> = related
            .iter()
            .map(|(fingerprint, similarity)| {
                json!({ "fingerprint": fingerprint, "similarity": round3(*similarity) })
            })
            .collect();
        clip.metadata.set_enrichment(
            NAME,
            json!({
                "entities": entities,
                "keywords": keywords(clip.content()),
                "related": related_json,
            }),
        );
        debug!(entities = entities.len(), related = related.len(), "graph updated");
        Ok(clip)
    }

    async fn on_search(
        &self,
        query: String,
        mut results: Vec<Clip>,
        _ctx: HookContext,
    ) -> Result<Vec<Clip>, PluginError> {
        let terms = words(&query);
        if terms.is_empty() {
            return Ok(results);
        }
        // Stable: clips with equal scores keep their incoming order.
        results.sort_by_cached_key(|clip| {
            let clip_words = words(clip.content());
            std::cmp::Reverse(terms.iter().filter(|term| clip_words.contains(*term)).count())
        });
        Ok(results)
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        let stats = self.stats();
        info!(
            clips = stats.clips,
            entities = stats.entities,
            edges = stats.edges,
            "knowledge graph stopped"
        );
        Ok(())
    }
}
