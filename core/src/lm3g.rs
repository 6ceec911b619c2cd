//! Classic sorted-table backoff model (orders 1 to 3).
//!
//! Layout:
//! - `unigrams[w]` carries the word's probability, backoff weight and the
//!   index of its first bigram; a sentinel entry closes the last range.
//! - `bigrams` are sorted by `(w1, w2)` and hold 16-bit indices into the
//!   `prob2`/`bo_wt2` pools plus a 16-bit trigram offset.
//! - `trigrams` are sorted by `(w1, w2, w3)` and index the `prob3` pool.
//!
//! Trigram offsets are relative to a per-segment base: bigram `b` belongs to
//! segment `b >> LOG_BG_SEG_SZ` and its first trigram is
//! `tseg_base[b >> LOG_BG_SEG_SZ] + bigrams[b].trigrams`.
//!
//! Every stored value is a weighted log value; [`Weights`] records how to
//! undo that for raw scores.
use crate::error::{LmError, Result};
use crate::logmath::LogMath;
use crate::model::{NgramScore, Weights};
use crate::ngram_raw::{is_sorted, RawNgram, RawNgramSet};
use crate::sorted_list::SortedList;
use crate::storage::{Record, RecordTable};
use crate::tginfo::{CacheStats, TginfoCache};
use crate::vocab::WordId;
use byteorder::{ByteOrder, NativeEndian};
use std::cell::RefCell;
use tracing::info;

pub const LOG_BG_SEG_SZ: u32 = 9;
pub const BG_SEG_SZ: usize = 1 << LOG_BG_SEG_SZ;

/// Probability given to the sentinel unigram, and the floor ARPA files use.
pub const MIN_PROB_F: f32 = -99.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unigram {
    pub prob1: i32,
    pub bo_wt1: i32,
    /// Index of the first bigram starting with this word.
    pub bigrams: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bigram {
    pub wid: WordId,
    pub prob2: u16,
    pub bo_wt2: u16,
    /// Offset of the first trigram relative to this bigram's segment base.
    pub trigrams: u16,
}

impl Record for Bigram {
    const SIZE: usize = 8;
    fn decode(b: &[u8]) -> Self {
        Bigram {
            wid: NativeEndian::read_u16(&b[0..2]) as WordId,
            prob2: NativeEndian::read_u16(&b[2..4]),
            bo_wt2: NativeEndian::read_u16(&b[4..6]),
            trigrams: NativeEndian::read_u16(&b[6..8]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trigram {
    pub wid: WordId,
    pub prob3: u16,
}

impl Record for Trigram {
    const SIZE: usize = 4;
    fn decode(b: &[u8]) -> Self {
        Trigram {
            wid: NativeEndian::read_u16(&b[0..2]) as WordId,
            prob3: NativeEndian::read_u16(&b[2..4]),
        }
    }
}

/// Weights are deduplicated at 4 decimal places, the precision ARPA files
/// are written with.
#[inline]
pub(crate) fn round4(x: f32) -> f32 {
    ((x as f64 * 10000.0).round() / 10000.0) as f32
}

#[derive(Debug)]
pub struct Lm3g {
    pub(crate) order: usize,
    pub(crate) unigrams: Vec<Unigram>,
    pub(crate) bigrams: RecordTable<Bigram>,
    pub(crate) trigrams: RecordTable<Trigram>,
    pub(crate) prob2: Vec<i32>,
    pub(crate) bo_wt2: Vec<i32>,
    pub(crate) prob3: Vec<i32>,
    pub(crate) tseg_base: Vec<u32>,
    cache: RefCell<TginfoCache>,
}

impl Lm3g {
    /// Assemble a model from tables decoded elsewhere (the DMP reader).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        order: usize,
        unigrams: Vec<Unigram>,
        bigrams: RecordTable<Bigram>,
        trigrams: RecordTable<Trigram>,
        prob2: Vec<i32>,
        bo_wt2: Vec<i32>,
        prob3: Vec<i32>,
        tseg_base: Vec<u32>,
    ) -> Self {
        let n_words = unigrams.len().saturating_sub(1);
        Self {
            order,
            unigrams,
            bigrams,
            trigrams,
            prob2,
            bo_wt2,
            prob3,
            tseg_base,
            cache: RefCell::new(TginfoCache::new(n_words)),
        }
    }

    /// Build the tables from sorted raw n-gram lists.
    ///
    /// Bigrams and trigrams must be strictly increasing by id tuple and every
    /// trigram needs its bigram prefix; otherwise the load fails.
    pub fn from_raw(raw: &RawNgramSet, lmath: &LogMath) -> Result<Self> {
        let order = raw.order;
        if !(1..=3).contains(&order) {
            return Err(LmError::Unsupported(format!(
                "sorted-table models hold orders 1 to 3, not {}",
                order
            )));
        }
        let n_words = raw.grams[0].len();
        let empty: Vec<RawNgram> = Vec::new();
        let raw_bg = if order >= 2 { &raw.grams[1] } else { &empty };
        let raw_tg = if order >= 3 { &raw.grams[2] } else { &empty };

        let mut unigrams: Vec<Unigram> = raw.grams[0]
            .iter()
            .map(|g| Unigram {
                prob1: lmath.log10_to_log(g.prob() as f64),
                bo_wt1: lmath.log10_to_log(g.backoff() as f64),
                bigrams: 0,
            })
            .collect();
        unigrams.push(Unigram {
            prob1: lmath.log10_to_log(MIN_PROB_F as f64),
            bo_wt1: 0,
            bigrams: 0,
        });

        // --- bigrams ---
        if !is_sorted(raw_bg) {
            return Err(LmError::format("bigrams not in unigram order"));
        }
        let n_bg = raw_bg.len();
        let mut prob2_pool = SortedList::new();
        let mut bo_wt2_pool = SortedList::new();
        let mut bigrams: Vec<Bigram> = Vec::with_capacity(n_bg + 1);
        let mut next_u = 0usize;
        for (b, g) in raw_bg.iter().enumerate() {
            let (w1, w2) = (g.words[0] as usize, g.words[1]);
            if w1 >= n_words || w2 as usize >= n_words {
                return Err(LmError::format(format!(
                    "bigram {} refers to a word outside the vocabulary",
                    b
                )));
            }
            while next_u <= w1 {
                unigrams[next_u].bigrams = b as u32;
                next_u += 1;
            }
            let bo_wt2 = if order > 2 {
                bo_wt2_pool.insert(round4(g.backoff()))
            } else {
                0
            };
            bigrams.push(Bigram {
                wid: w2,
                prob2: prob2_pool.insert(round4(g.prob())),
                bo_wt2,
                trigrams: 0,
            });
        }
        while next_u <= n_words {
            unigrams[next_u].bigrams = n_bg as u32;
            next_u += 1;
        }
        bigrams.push(Bigram {
            wid: 0,
            prob2: 0,
            bo_wt2: 0,
            trigrams: 0,
        });

        // --- trigrams ---
        if !is_sorted(raw_tg) {
            return Err(LmError::format("trigrams not in bigram order"));
        }
        let mut per_bigram = vec![0u32; n_bg + 1];
        let mut prob3_pool = SortedList::new();
        let mut trigrams: Vec<Trigram> = Vec::with_capacity(raw_tg.len());
        for (t, g) in raw_tg.iter().enumerate() {
            let (w1, w2, w3) = (g.words[0], g.words[1], g.words[2]);
            if w3 as usize >= n_words {
                return Err(LmError::format(format!(
                    "trigram {} refers to a word outside the vocabulary",
                    t
                )));
            }
            let b = find_in_range(
                &bigrams,
                unigrams.get(w1 as usize).map(|u| u.bigrams),
                unigrams.get(w1 as usize + 1).map(|u| u.bigrams),
                w2,
            )
            .ok_or_else(|| LmError::format(format!("missing bigram for trigram {}", t)))?;
            per_bigram[b] += 1;
            trigrams.push(Trigram {
                wid: w3,
                prob3: prob3_pool.insert(round4(g.prob())),
            });
        }

        // absolute first-trigram index per bigram, sentinel included
        let mut first_tg = Vec::with_capacity(n_bg + 1);
        let mut acc = 0u32;
        for count in per_bigram.iter().take(n_bg) {
            first_tg.push(acc);
            acc += count;
        }
        first_tg.push(acc);

        let n_seg = (n_bg + 1) / BG_SEG_SZ + 1;
        let mut tseg_base = vec![acc; n_seg];
        for (b, &abs) in first_tg.iter().enumerate() {
            let seg = b >> LOG_BG_SEG_SZ;
            if b & (BG_SEG_SZ - 1) == 0 {
                tseg_base[seg] = abs;
            }
            let rel = abs - tseg_base[seg];
            if rel > u16::MAX as u32 {
                return Err(LmError::format(format!(
                    "trigram offset {} for bigram {} overflows its segment",
                    rel, b
                )));
            }
            bigrams[b].trigrams = rel as u16;
        }

        let to_pool = |pool: &SortedList| -> Vec<i32> {
            pool.values()
                .into_iter()
                .map(|v| lmath.log10_to_log(v as f64))
                .collect()
        };
        let lm = Self::from_parts(
            order,
            unigrams,
            RecordTable::Owned(bigrams),
            RecordTable::Owned(trigrams),
            to_pool(&prob2_pool),
            to_pool(&bo_wt2_pool),
            to_pool(&prob3_pool),
            tseg_base,
        );
        info!(
            "{} unigrams, {} bigrams ({} prob2, {} bo_wt2), {} trigrams ({} prob3)",
            n_words,
            n_bg,
            lm.prob2.len(),
            lm.bo_wt2.len(),
            lm.trigrams.len(),
            lm.prob3.len()
        );
        Ok(lm)
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn n_words(&self) -> usize {
        self.unigrams.len() - 1
    }

    pub fn counts(&self) -> Vec<u32> {
        let mut c = vec![self.n_words() as u32];
        if self.order >= 2 {
            c.push(self.bigrams.len().saturating_sub(1) as u32);
        }
        if self.order >= 3 {
            c.push(self.trigrams.len() as u32);
        }
        c
    }

    /// True when the bigram or trigram records alias a memory map.
    pub fn is_mapped(&self) -> bool {
        self.bigrams.is_mapped() || self.trigrams.is_mapped()
    }

    // --- Table navigation ---

    #[inline]
    fn first_bg(&self, w: WordId) -> usize {
        self.unigrams[w as usize].bigrams as usize
    }

    #[inline]
    fn first_tg(&self, b: usize) -> u32 {
        self.tseg_base[b >> LOG_BG_SEG_SZ] + self.bigrams.get(b).trigrams as u32
    }

    fn find_bg(&self, w1: WordId, w2: WordId) -> Option<usize> {
        let (mut lo, mut hi) = (self.first_bg(w1), self.first_bg(w1 + 1));
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let wid = self.bigrams.get(mid).wid;
            if wid == w2 {
                return Some(mid);
            } else if wid < w2 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        None
    }

    fn find_tg(&self, first: u32, n: u32, w3: WordId) -> Option<Trigram> {
        let (mut lo, mut hi) = (first as usize, (first + n) as usize);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let tg = self.trigrams.get(mid);
            if tg.wid == w3 {
                return Some(tg);
            } else if tg.wid < w3 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        None
    }

    /// Trigram slice and backoff weight for the context `(w1, w2)`.
    fn load_tginfo(&self, w1: WordId, w2: WordId) -> (u32, u32, i32) {
        match self.find_bg(w1, w2) {
            Some(b) => {
                let first = self.first_tg(b);
                let n = self.first_tg(b + 1) - first;
                let bowt = self.bo_wt2[self.bigrams.get(b).bo_wt2 as usize];
                (first, n, bowt)
            }
            None => (0, 0, 0),
        }
    }

    // --- Scoring ---

    #[inline]
    pub fn ug_score(&self, w: WordId) -> NgramScore {
        NgramScore {
            score: self.unigrams[w as usize].prob1,
            n_used: 1,
        }
    }

    /// Score of `w2` following `w1`.
    pub fn bg_score(&self, w1: WordId, w2: WordId) -> NgramScore {
        if self.order < 2 {
            return self.ug_score(w2);
        }
        match self.find_bg(w1, w2) {
            Some(b) => NgramScore {
                score: self.prob2[self.bigrams.get(b).prob2 as usize],
                n_used: 2,
            },
            None => NgramScore {
                score: self.unigrams[w1 as usize].bo_wt1 + self.unigrams[w2 as usize].prob1,
                n_used: 1,
            },
        }
    }

    /// Score of `w3` following `w1 w2`, through the trigram-info cache.
    pub fn tg_score(&self, w1: WordId, w2: WordId, w3: WordId) -> NgramScore {
        if self.order < 3 {
            return self.bg_score(w2, w3);
        }
        let info = self
            .cache
            .borrow_mut()
            .lookup(w1, w2, || self.load_tginfo(w1, w2));
        if let Some(tg) = self.find_tg(info.first_tg, info.n_tg, w3) {
            return NgramScore {
                score: self.prob3[tg.prob3 as usize],
                n_used: 3,
            };
        }
        let bg = self.bg_score(w2, w3);
        NgramScore {
            score: info.bowt + bg.score,
            n_used: bg.n_used,
        }
    }

    /// Weighted score; `history` is most recent first and already validated.
    pub fn score(&self, wid: WordId, history: &[WordId]) -> NgramScore {
        match history {
            [] => self.ug_score(wid),
            [h0] => self.bg_score(*h0, wid),
            [h0, h1, ..] => self.tg_score(*h1, *h0, wid),
        }
    }

    /// Unigram probability with weights and uniform interpolation removed.
    /// Lossy: the interpolated sum is rounded before the uniform part is
    /// subtracted again.
    pub fn raw_unigram(&self, w: WordId, weights: &Weights, lmath: &LogMath, is_start: bool) -> i32 {
        let mut score = weights.unapply(self.unigrams[w as usize].prob1);
        if !is_start {
            let uniform = weights.log_uniform + weights.log_uniform_weight;
            if uniform > lmath.zero() {
                score = lmath.log(lmath.exp(score) - lmath.exp(uniform));
            }
            score -= weights.log_uw;
        }
        score
    }

    /// Pre-weight score. Only the unigram case undoes the uniform
    /// interpolation; backed-off scores keep it.
    pub fn raw_score(
        &self,
        wid: WordId,
        history: &[WordId],
        weights: &Weights,
        lmath: &LogMath,
        is_start: bool,
    ) -> NgramScore {
        if history.is_empty() {
            return NgramScore {
                score: self.raw_unigram(wid, weights, lmath, is_start),
                n_used: 1,
            };
        }
        let s = self.score(wid, history);
        NgramScore {
            score: weights.unapply(s.score),
            n_used: s.n_used,
        }
    }

    // --- Mutation ---

    /// Replace the weights `old` by `new` in every stored value.
    ///
    /// `start` is the id of `<s>`, which is never interpolated with the
    /// uniform distribution.
    pub fn apply_weights(
        &mut self,
        old: &Weights,
        new: &Weights,
        lmath: &LogMath,
        start: Option<WordId>,
    ) {
        for w in 0..self.n_words() {
            let is_start = start == Some(w as WordId);
            let mut prob = self.raw_unigram(w as WordId, old, lmath, is_start);
            if !is_start {
                prob += new.log_uw;
                prob = lmath.add(prob, new.log_uniform + new.log_uniform_weight);
            }
            let u = &mut self.unigrams[w];
            u.bo_wt1 = new.scale_backoff(old.unscale_backoff(u.bo_wt1));
            u.prob1 = new.apply(prob);
        }
        for p in self.prob2.iter_mut() {
            *p = new.apply(old.unapply(*p));
        }
        if self.order > 2 {
            for b in self.bo_wt2.iter_mut() {
                *b = new.scale_backoff(old.unscale_backoff(*b));
            }
            for p in self.prob3.iter_mut() {
                *p = new.apply(old.unapply(*p));
            }
        }
        self.cache.borrow_mut().reset();
    }

    /// Append a unigram with no followers. `prob1` is already weighted.
    pub fn add_unigram(&mut self, prob1: i32) {
        let at = self.unigrams.len() - 1;
        let end = self.unigrams[at].bigrams;
        self.unigrams.insert(
            at,
            Unigram {
                prob1,
                bo_wt1: 0,
                bigrams: end,
            },
        );
        let n_words = self.n_words();
        self.cache.borrow_mut().resize(n_words);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.borrow().stats()
    }

    pub fn reset_cache(&self) {
        self.cache.borrow_mut().reset();
    }

    pub fn flush_unused_cache(&self) -> usize {
        self.cache.borrow_mut().evict_unused()
    }

    // --- Extraction ---

    /// Flatten into raw lists of unweighted base-10 values.
    pub fn to_raw(
        &self,
        words: &[String],
        weights: &Weights,
        lmath: &LogMath,
        start: Option<WordId>,
    ) -> RawNgramSet {
        let log10 = |v: i32| lmath.log_to_log10(v) as f32;
        let n_words = self.n_words();
        let mut grams: Vec<Vec<RawNgram>> = Vec::with_capacity(self.order);

        let unigrams = (0..n_words)
            .map(|w| {
                let raw = self.raw_unigram(w as WordId, weights, lmath, start == Some(w as WordId));
                let bo = (self.order > 1)
                    .then(|| log10(weights.unscale_backoff(self.unigrams[w].bo_wt1)));
                RawNgram::new(vec![w as WordId], log10(raw), bo)
            })
            .collect();
        grams.push(unigrams);

        if self.order >= 2 {
            let mut bgs = Vec::with_capacity(self.bigrams.len());
            let mut tgs = Vec::with_capacity(self.trigrams.len());
            for w1 in 0..n_words as WordId {
                for b in self.first_bg(w1)..self.first_bg(w1 + 1) {
                    let bg = self.bigrams.get(b);
                    let prob = log10(weights.unapply(self.prob2[bg.prob2 as usize]));
                    let bo = (self.order > 2).then(|| {
                        log10(weights.unscale_backoff(self.bo_wt2[bg.bo_wt2 as usize]))
                    });
                    bgs.push(RawNgram::new(vec![w1, bg.wid], prob, bo));
                    if self.order > 2 {
                        for t in self.first_tg(b)..self.first_tg(b + 1) {
                            let tg = self.trigrams.get(t as usize);
                            let prob = log10(weights.unapply(self.prob3[tg.prob3 as usize]));
                            tgs.push(RawNgram::new(vec![w1, bg.wid, tg.wid], prob, None));
                        }
                    }
                }
            }
            grams.push(bgs);
            if self.order > 2 {
                grams.push(tgs);
            }
        }

        RawNgramSet {
            order: self.order,
            words: words.to_vec(),
            grams,
        }
    }
}

/// Binary search for `w2` among `bigrams[first..end]`.
fn find_in_range(
    bigrams: &[Bigram],
    first: Option<u32>,
    end: Option<u32>,
    w2: WordId,
) -> Option<usize> {
    let (first, end) = (first? as usize, end? as usize);
    bigrams[first..end]
        .binary_search_by(|b| b.wid.cmp(&w2))
        .ok()
        .map(|i| first + i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lmath() -> LogMath {
        LogMath::new(1.0001, 4, 0).unwrap()
    }

    fn ng(words: &[u32], p: f32, bo: Option<f32>) -> RawNgram {
        RawNgram::new(words.to_vec(), p, bo)
    }

    /// Words 0..4, a handful of bigrams and trigrams.
    fn small_set() -> RawNgramSet {
        RawNgramSet {
            order: 3,
            words: ["</s>", "<s>", "a", "b"].iter().map(|s| s.to_string()).collect(),
            grams: vec![
                vec![
                    ng(&[0], -1.0, Some(0.0)),
                    ng(&[1], -99.0, Some(-0.5)),
                    ng(&[2], -1.2, Some(-0.3)),
                    ng(&[3], -1.4, Some(-0.2)),
                ],
                vec![
                    ng(&[1, 2], -0.4, Some(-0.1)),
                    ng(&[2, 0], -0.9, Some(0.0)),
                    ng(&[2, 3], -0.3, Some(-0.25)),
                    ng(&[3, 0], -0.2, Some(0.0)),
                ],
                vec![ng(&[1, 2, 3], -0.15, None), ng(&[2, 3, 0], -0.05, None)],
            ],
        }
    }

    #[test]
    fn backoff_paths() {
        let lm_math = lmath();
        let l = |x: f64| lm_math.log10_to_log(x as f32 as f64);
        let lm = Lm3g::from_raw(&small_set(), &lm_math).unwrap();
        assert_eq!(lm.counts(), vec![4, 4, 2]);

        // bigram hit
        assert_eq!(lm.bg_score(2, 3), NgramScore { score: l(-0.3), n_used: 2 });
        // bigram miss: bo(b) + p(a)
        assert_eq!(lm.bg_score(3, 2), NgramScore { score: l(-0.2) + l(-1.2), n_used: 1 });
        // trigram hit
        assert_eq!(lm.tg_score(1, 2, 3), NgramScore { score: l(-0.15), n_used: 3 });
        // trigram miss, bigram context present: bo(<s> a) + p(</s> | a)
        assert_eq!(lm.tg_score(1, 2, 0), NgramScore { score: l(-0.1) + l(-0.9), n_used: 2 });
        // trigram miss, context absent, bigram miss
        assert_eq!(lm.tg_score(0, 3, 2), NgramScore { score: l(-0.2) + l(-1.2), n_used: 1 });
    }

    #[test]
    fn repeated_context_hits_cache() {
        let lm = Lm3g::from_raw(&small_set(), &lmath()).unwrap();
        let first = lm.tg_score(2, 3, 0);
        let second = lm.tg_score(2, 3, 0);
        assert_eq!(first, second);
        let stats = lm.cache_stats();
        assert_eq!((stats.misses, stats.hits), (1, 1));
    }

    #[test]
    fn unsorted_bigrams_are_rejected() {
        let mut set = small_set();
        set.grams[1].swap(0, 1);
        let err = Lm3g::from_raw(&set, &lmath()).unwrap_err();
        assert!(err.to_string().contains("bigrams not in unigram order"));
    }

    #[test]
    fn trigram_without_bigram_is_rejected() {
        let mut set = small_set();
        set.grams[2].push(ng(&[3, 2, 0], -0.5, None));
        let err = Lm3g::from_raw(&set, &lmath()).unwrap_err();
        assert!(err.to_string().contains("missing bigram for trigram"));
    }

    #[test]
    fn trigram_ranges_cross_segments() {
        // 40 words, every pair a bigram (1600 > one segment), trigrams on a few
        let n = 40u32;
        let lm_math = lmath();
        let mut set = RawNgramSet {
            order: 3,
            words: (0..n).map(|i| format!("w{}", i)).collect(),
            grams: vec![Vec::new(), Vec::new(), Vec::new()],
        };
        for w in 0..n {
            set.grams[0].push(ng(&[w], -2.0, Some(-0.5)));
        }
        for w1 in 0..n {
            for w2 in 0..n {
                set.grams[1].push(ng(&[w1, w2], -1.0, Some(-0.25)));
                if w2 % 7 == 0 {
                    for w3 in [1, 5, 9] {
                        let p = -0.01 * (w1 + w2 + w3) as f32;
                        set.grams[2].push(ng(&[w1, w2, w3], p, None));
                    }
                }
            }
        }
        let lm = Lm3g::from_raw(&set, &lm_math).unwrap();
        assert!(lm.tseg_base.len() > 3);
        for (w1, w2, w3) in [(0, 0, 1), (13, 14, 9), (39, 35, 5)] {
            let expect = lm_math.log10_to_log(round4(-0.01 * (w1 + w2 + w3) as f32) as f64);
            assert_eq!(lm.tg_score(w1, w2, w3), NgramScore { score: expect, n_used: 3 });
        }
        // context present, word absent
        let s = lm.tg_score(20, 21, 3);
        assert_eq!(s.n_used, 2);
    }

    #[test]
    fn segment_offset_overflow_is_a_format_error() {
        let n = 300u32;
        let mut set = RawNgramSet {
            order: 3,
            words: (0..n).map(|i| format!("w{}", i)).collect(),
            grams: vec![Vec::new(), Vec::new(), Vec::new()],
        };
        for w in 0..n {
            set.grams[0].push(ng(&[w], -2.0, Some(0.0)));
            set.grams[1].push(ng(&[0, w], -1.0, Some(0.0)));
        }
        for w2 in 0..n {
            for w3 in 0..n {
                set.grams[2].push(ng(&[0, w2, w3], -0.5, None));
            }
        }
        let err = Lm3g::from_raw(&set, &lmath()).unwrap_err();
        assert!(err.to_string().contains("overflows its segment"));
    }

    #[test]
    fn added_unigram_has_empty_follower_range() {
        let lm_math = lmath();
        let mut lm = Lm3g::from_raw(&small_set(), &lm_math).unwrap();
        lm.add_unigram(-30000);
        assert_eq!(lm.n_words(), 5);
        assert_eq!(lm.ug_score(4).score, -30000);
        // no bigram (b, new) so it backs off, and the new word has no followers
        assert_eq!(lm.bg_score(4, 2).n_used, 1);
        assert_eq!(lm.bg_score(3, 4).score, lm_math.log10_to_log(-0.2f32 as f64) - 30000);
        assert_eq!(lm.bg_score(3, 0).n_used, 2);
    }
}
