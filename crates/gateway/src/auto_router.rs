//! Keyword-overlap suggestions for auto tool-choice mode.

use async_trait::async_trait;
use std::collections::HashSet;

use capgraph_core::{
    traits::{AutoRouter, ToolSuggestion},
    types::CapabilityDescriptor,
};

/// Words too common to signal intent.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "this", "that", "from", "into", "please", "can", "you", "what", "how", "are",
    "was", "will", "would", "could", "about", "given", "some", "any", "all", "your", "mine", "have",
];

/// Scores candidates by word overlap with the utterance.
///
/// Words from the capability name weigh 1.0, words from its description 0.5.
/// The best candidate is suggested when it reaches `min_score`.
pub struct KeywordAutoRouter {
    min_score: f32,
}

impl KeywordAutoRouter {
    pub fn new() -> Self {
        Self { min_score: 1.0 }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    fn score(&self, words: &HashSet<String>, descriptor: &CapabilityDescriptor) -> f32 {
        let name_words = tokenize(&descriptor.name.replace('_', " "));
        let description_words: HashSet<String> = tokenize(&descriptor.description)
            .difference(&name_words)
            .cloned()
            .collect();

        let name_hits = name_words.intersection(words).count() as f32;
        let description_hits = description_words.intersection(words).count() as f32;
        name_hits + description_hits * 0.5
    }
}

impl Default for KeywordAutoRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

#[async_trait]
impl AutoRouter for KeywordAutoRouter {
    async fn suggest(&self, utterance: &str, candidates: &[CapabilityDescriptor]) -> Option<ToolSuggestion> {
        let words = tokenize(utterance);
        if words.is_empty() {
            return None;
        }

        let mut best: Option<ToolSuggestion> = None;
        for descriptor in candidates {
            let score = self.score(&words, descriptor);
            tracing::trace!(capability = %descriptor.name, score, "Auto-router score");
            if score < self.min_score {
                continue;
            }
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(ToolSuggestion {
                    name: descriptor.name.clone(),
                    score,
                });
            }
        }
        best
    }
}
