use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jobradar_core::NormalizedPosting;

const TITLE_WEIGHT: f64 = 2.0;
const DESCRIPTION_WEIGHT: f64 = 1.0;

/// Semantic similarity oracle. Returns a score `>= 0`.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(&self, text: &str) -> Result<f64>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeywordMatch {
    pub score: f64,
    pub matched: Vec<String>,
}

/// Title hits weigh more than description hits; each keyword counts once.
pub fn keyword_score(title: &str, description: &str, keywords: &[String]) -> KeywordMatch {
    let title = title.to_lowercase();
    let description = description.to_lowercase();
    let mut result = KeywordMatch::default();
    for keyword in keywords {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            continue;
        }
        let weight = if title.contains(&needle) {
            TITLE_WEIGHT
        } else if description.contains(&needle) {
            DESCRIPTION_WEIGHT
        } else {
            continue;
        };
        result.score += weight;
        result.matched.push(keyword.trim().to_string());
    }
    result
}

#[derive(Clone, Default)]
pub struct Scoring {
    keywords: Vec<String>,
    scorer: Option<Arc<dyn RelevanceScorer>>,
    nlp_weight: f64,
}

impl Scoring {
    pub fn new(keywords: Vec<String>, nlp_weight: f64) -> Self {
        Self {
            keywords,
            scorer: None,
            nlp_weight,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    /// Apply keyword scoring, then the semantic contribution if a scorer is set.
    /// A scorer failure leaves the keyword score in place.
    pub async fn apply(&self, posting: &mut NormalizedPosting) -> Result<()> {
        let keywords = keyword_score(&posting.title, &posting.description, &self.keywords);
        posting.relevance_score = keywords.score;
        posting.keywords_matched = if keywords.matched.is_empty() {
            None
        } else {
            Some(keywords.matched.join(","))
        };

        if let Some(scorer) = &self.scorer {
            let text = format!("{} {}", posting.title, posting.description);
            let semantic = scorer.score(&text).await.context("semantic scorer")?;
            posting.relevance_score += semantic.max(0.0) * self.nlp_weight;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Scoring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scoring")
            .field("keywords", &self.keywords)
            .field("semantic", &self.scorer.is_some())
            .field("nlp_weight", &self.nlp_weight)
            .finish()
    }
}
