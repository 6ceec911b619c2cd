//! Storage-independent n-gram lists.
//!
//! A [`RawNgramSet`] is the interchange form between readers and backends:
//! the ARPA reader produces one, the classic and trie backends can both be
//! built from one and can both be flattened back into one for writing.
//! Weights are base-10 logs, the unit of every on-disk text format.
use crate::vocab::WordId;
use std::cmp::Ordering;

/// One n-gram: word ids oldest first, then its weights.
///
/// `weights[0]` is the probability; `weights[1]`, when present, is the
/// backoff weight (top-order entries carry none).
#[derive(Debug, Clone, PartialEq)]
pub struct RawNgram {
    pub words: Vec<WordId>,
    pub weights: Vec<f32>,
}

impl RawNgram {
    pub fn new(words: Vec<WordId>, prob: f32, backoff: Option<f32>) -> Self {
        let mut weights = vec![prob];
        if let Some(bo) = backoff {
            weights.push(bo);
        }
        Self { words, weights }
    }

    #[inline]
    pub fn prob(&self) -> f32 {
        self.weights[0]
    }

    #[inline]
    pub fn backoff(&self) -> f32 {
        self.weights.get(1).copied().unwrap_or(0.0)
    }

    /// Every word but the last.
    #[inline]
    pub fn prefix(&self) -> &[WordId] {
        &self.words[..self.words.len() - 1]
    }
}

/// Lexicographic order over id tuples, most significant (oldest) word first.
pub fn ngram_cmp(a: &RawNgram, b: &RawNgram) -> Ordering {
    a.words.cmp(&b.words)
}

/// Sort a list in place into the canonical order.
pub fn sort_ngrams(list: &mut [RawNgram]) {
    list.sort_by(ngram_cmp);
}

/// True when the list is strictly increasing in the canonical order.
pub fn is_sorted(list: &[RawNgram]) -> bool {
    list.windows(2).all(|w| ngram_cmp(&w[0], &w[1]) == Ordering::Less)
}

/// Full contents of a model in raw form.
#[derive(Debug, Clone, Default)]
pub struct RawNgramSet {
    /// Highest order present.
    pub order: usize,
    /// Vocabulary in id order.
    pub words: Vec<String>,
    /// `grams[k]` holds the entries of order `k + 1`; unigrams are indexed
    /// by word id.
    pub grams: Vec<Vec<RawNgram>>,
}

impl RawNgramSet {
    pub fn counts(&self) -> Vec<u32> {
        self.grams.iter().map(|g| g.len() as u32).collect()
    }

    /// Sort every order above unigrams and drop exact duplicate tuples,
    /// keeping the first occurrence. Returns how many were dropped.
    pub fn sort_and_dedup(&mut self) -> usize {
        let mut dropped = 0;
        for list in self.grams.iter_mut().skip(1) {
            // stable, so the first occurrence survives dedup
            list.sort_by(ngram_cmp);
            let before = list.len();
            list.dedup_by(|b, a| a.words == b.words);
            dropped += before - list.len();
        }
        dropped
    }

    /// Look up the weights of an exact tuple (oldest word first).
    pub fn find(&self, words: &[WordId]) -> Option<&RawNgram> {
        let list = self.grams.get(words.len().checked_sub(1)?)?;
        if words.len() == 1 {
            return list.get(words[0] as usize);
        }
        list.binary_search_by(|g| g.words.as_slice().cmp(words))
            .ok()
            .map(|i| &list[i])
    }
}
