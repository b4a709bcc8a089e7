//! Knowledge-base retrieval.
//!
//! Retrieval is an external collaborator: the engine only depends on the
//! [`KnowledgeStore`] trait (`query(text, n) → hits`). The built-in
//! [`KeywordIndex`] is a dependency-free fallback that scores sections by
//! keyword overlap — good enough for deterministic tests and small setting
//! bibles; embedders plug in real vector stores behind the same trait.

use serde_json::Value;
use std::collections::HashMap;

/// One retrieval result.
#[derive(Debug, Clone)]
pub struct KnowledgeHit {
    pub content: String,
    pub metadata: Value,
}

/// Opaque retrieval interface.
pub trait KnowledgeStore: Send + Sync {
    fn query(&self, query_text: &str, n_results: usize) -> Vec<KnowledgeHit>;
}

/// A store that never returns anything. Useful default when no lore is
/// configured.
#[derive(Default)]
pub struct EmptyKnowledge;

impl KnowledgeStore for EmptyKnowledge {
    fn query(&self, _query_text: &str, _n_results: usize) -> Vec<KnowledgeHit> {
        Vec::new()
    }
}

/// Keyword-overlap index over named sections.
pub struct KeywordIndex {
    sections: Vec<(String, String)>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self { sections: Vec::new() }
    }

    /// Index a document: split on markdown `##` headings into sections named
    /// `source#heading`.
    pub fn index_document(&mut self, source: &str, content: &str) {
        let mut heading = "intro".to_string();
        let mut buffer = String::new();
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("## ") {
                if !buffer.trim().is_empty() {
                    self.sections
                        .push((format!("{}#{}", source, heading), buffer.trim().to_string()));
                }
                heading = rest.trim().to_string();
                buffer.clear();
            } else {
                buffer.push_str(line);
                buffer.push('\n');
            }
        }
        if !buffer.trim().is_empty() {
            self.sections
                .push((format!("{}#{}", source, heading), buffer.trim().to_string()));
        }
    }

    fn score(query_words: &[String], text: &str) -> usize {
        let text_lower = text.to_lowercase();
        query_words.iter().filter(|w| text_lower.contains(*w)).count()
    }
}

impl Default for KeywordIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeStore for KeywordIndex {
    fn query(&self, query_text: &str, n_results: usize) -> Vec<KnowledgeHit> {
        let query_words: Vec<String> = query_text
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .map(String::from)
            .collect();
        if query_words.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, &(String, String))> = self
            .sections
            .iter()
            .map(|section| (Self::score(&query_words, &section.1), section))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1 .0.cmp(&b.1 .0)));

        scored
            .into_iter()
            .take(n_results)
            .map(|(score, (name, content))| KnowledgeHit {
                content: content.clone(),
                metadata: serde_json::json!({"source": name, "score": score}),
            })
            .collect()
    }
}

/// Format hits into a bounded prompt block.
pub fn format_for_prompt(hits: &[KnowledgeHit], max_length: usize) -> String {
    let mut out = String::new();
    for hit in hits {
        if out.len() >= max_length {
            break;
        }
        let remaining = max_length - out.len();
        let slice_end = hit
            .content
            .char_indices()
            .take_while(|(i, _)| *i < remaining)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        out.push_str(&hit.content[..slice_end]);
        out.push_str("\n\n");
    }
    out.trim_end().to_string()
}

/// Convenience map-backed store for tests: query substring → canned hits.
pub struct CannedKnowledge {
    answers: HashMap<String, Vec<String>>,
}

impl CannedKnowledge {
    pub fn new(answers: HashMap<String, Vec<String>>) -> Self {
        Self { answers }
    }
}

impl KnowledgeStore for CannedKnowledge {
    fn query(&self, query_text: &str, n_results: usize) -> Vec<KnowledgeHit> {
        let query_lower = query_text.to_lowercase();
        for (needle, contents) in &self.answers {
            if query_lower.contains(&needle.to_lowercase()) {
                return contents
                    .iter()
                    .take(n_results)
                    .map(|c| KnowledgeHit {
                        content: c.clone(),
                        metadata: serde_json::json!({"source": "canned"}),
                    })
                    .collect();
            }
        }
        Vec::new()
    }
}
