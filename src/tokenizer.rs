//! Semantic token extraction.
//!
//! The pipeline records which known terms a document mentions under
//! `meta.semantic_tokens`. The default [`VocabularyTokenizer`] recognizes
//! the titles, aliases, and ids of the lexicon snapshot.

use std::collections::HashSet;

use crate::models::LexiconEntry;

/// Extracts the terms a text mentions.
pub trait Tokenizer: Send + Sync {
    fn extract(&self, text: &str) -> Vec<String>;
}

/// Whole-word, case-insensitive matching against a fixed vocabulary.
#[derive(Debug, Clone, Default)]
pub struct VocabularyTokenizer {
    /// Lowercased terms, longest first.
    terms: Vec<String>,
}

impl VocabularyTokenizer {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut terms: Vec<String> = terms
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| t.chars().count() >= MIN_TERM_CHARS)
            .filter(|t| seen.insert(t.clone()))
            .collect();
        terms.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self { terms }
    }

    /// Vocabulary of every title, alias, and id, plus `-` → space id variants.
    pub fn from_lexicon(entries: &[LexiconEntry]) -> Self {
        let mut terms = Vec::new();
        for entry in entries {
            terms.push(entry.title.clone());
            terms.extend(entry.aliases.iter().cloned());
            terms.push(entry.id.clone());
            if entry.id.contains('-') {
                terms.push(entry.id.replace('-', " "));
            }
        }
        Self::new(terms)
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl Tokenizer for VocabularyTokenizer {
    /// Matched terms in the casing they appear in `text`, longest first, deduplicated.
    fn extract(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        let same_len = lower.len() == text.len();

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for term in &self.terms {
            let Some(pos) = find_term(&lower, term) else {
                continue;
            };
            // Offsets only line up when lowercasing kept byte lengths.
            let surface = if same_len && text.is_char_boundary(pos) && text.is_char_boundary(pos + term.len()) {
                text[pos..pos + term.len()].to_string()
            } else {
                term.clone()
            };
            if seen.insert(surface.to_lowercase()) {
                out.push(surface);
            }
        }
        out
    }
}

/// Terms shorter than this are ignored by the tokenizer and the weaver.
pub(crate) const MIN_TERM_CHARS: usize = 3;

/// Byte offset of the first whole-word occurrence of `term` in `haystack`.
///
/// Both arguments must already be lowercased. A word boundary is any
/// character that is not alphanumeric or `_`, or either end of the text.
pub(crate) fn find_term(haystack: &str, term: &str) -> Option<usize> {
    if term.is_empty() {
        return None;
    }
    haystack.match_indices(term).map(|(pos, _)| pos).find(|&pos| {
        let before = haystack[..pos].chars().next_back();
        let after = haystack[pos + term.len()..].chars().next();
        !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
    })
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_term_respects_word_boundaries() {
        assert_eq!(find_term("the fafcas protocol", "fafcas"), Some(4));
        assert_eq!(find_term("fafcasian notes", "fafcas"), None);
        assert_eq!(find_term("pre-fafcas.", "fafcas"), Some(4));
        assert_eq!(find_term("snake_fafcas", "fafcas"), None);
        assert_eq!(find_term("xfafcas fafcas", "fafcas"), Some(8));
    }

    #[test]
    fn test_extract_keeps_source_casing() {
        let tok = VocabularyTokenizer::new(["fafcas", "graph engine", "ab"]);
        let found = tok.extract("The Graph Engine uses FAFCAS vectors.");
        assert_eq!(found, vec!["Graph Engine".to_string(), "FAFCAS".to_string()]);
    }

    #[test]
    fn test_from_lexicon_adds_id_variants() {
        let tok = VocabularyTokenizer::from_lexicon(&[LexiconEntry {
            id: "vector-engine".into(),
            title: "Vectors".into(),
            aliases: vec!["VE".into(), "vec store".into()],
        }]);
        // "VE" is below the minimum length.
        assert_eq!(tok.len(), 4);
        assert_eq!(tok.extract("see the vector engine"), vec!["vector engine".to_string()]);
    }
}
