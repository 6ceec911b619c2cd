//! Word table shared by every model backend.
//!
//! Ids are dense and 0-based, assigned in the order words are added (for file
//! readers that is the order of the unigram section or word blob).
use ahash::AHashMap;

/// Word id as used in every table of the crate.
pub type WordId = u32;

pub const UNKNOWN_WORD: &str = "<UNK>";
pub const SENTENCE_START: &str = "<s>";
pub const SENTENCE_END: &str = "</s>";

#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    words: Vec<String>,
    ids: AHashMap<String, WordId>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            words: Vec::with_capacity(n),
            ids: AHashMap::with_capacity(n),
        }
    }

    /// Append `word` and return its new id. A word already present keeps its
    /// old id and `Err` carries it back.
    pub fn push(&mut self, word: &str) -> Result<WordId, WordId> {
        if let Some(&id) = self.ids.get(word) {
            return Err(id);
        }
        let id = self.words.len() as WordId;
        self.words.push(word.to_string());
        self.ids.insert(word.to_string(), id);
        Ok(id)
    }

    /// Append a word whose id slot must exist even when the spelling repeats
    /// (duplicate unigram lines). The string stays reachable by id only.
    pub fn push_shadowed(&mut self, word: &str) -> WordId {
        let id = self.words.len() as WordId;
        self.words.push(word.to_string());
        self.ids.entry(word.to_string()).or_insert(id);
        id
    }

    #[inline]
    pub fn id(&self, word: &str) -> Option<WordId> {
        self.ids.get(word).copied()
    }

    #[inline]
    pub fn word(&self, id: WordId) -> Option<&str> {
        self.words.get(id as usize).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Words in id order.
    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Id assigned to unknown words, when the model declares `<UNK>`.
    pub fn unknown_id(&self) -> Option<WordId> {
        self.id(UNKNOWN_WORD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_insertion_order() {
        let mut v = Vocabulary::new();
        assert_eq!(v.push("</s>"), Ok(0));
        assert_eq!(v.push("<s>"), Ok(1));
        assert_eq!(v.push("david"), Ok(2));
        assert_eq!(v.push("<s>"), Err(1));
        assert_eq!(v.len(), 3);
        assert_eq!(v.word(2), Some("david"));
        assert_eq!(v.id("huggins"), None);
        assert_eq!(v.unknown_id(), None);
    }

    #[test]
    fn shadowed_duplicates_keep_first_mapping() {
        let mut v = Vocabulary::new();
        v.push("a").unwrap();
        let dup = v.push_shadowed("a");
        assert_eq!(dup, 1);
        assert_eq!(v.id("a"), Some(0));
        assert_eq!(v.word(1), Some("a"));
    }
}
