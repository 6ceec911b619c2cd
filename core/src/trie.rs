//! Compact trie model for any order.
//!
//! Unigrams are a plain array of `{prob, bo, next}`. Every higher order is a
//! [`BitTable`] sorted by `(context, word)`: an entry stores its last word,
//! quantized weights and, below the top order, the index of its first child
//! in the next table. Child ranges end where the following entry's range
//! begins, so each table below the top carries one sentinel entry.
//!
//! Weights are log-math values kept as `f32` and are unweighted; the owning
//! model applies language weight and insertion penalty at score time.
use crate::bitarr::{packed_len, read_bits, required_bits, write_bits};
use crate::error::{LmError, Result};
use crate::lm3g::{round4, MIN_PROB_F};
use crate::logmath::LogMath;
use crate::model::{vocab_from_words, NgramScore};
use crate::ngram_raw::{RawNgram, RawNgramSet};
use crate::pio::{self, Output};
use crate::quant::{QuantType, Quantizer};
use crate::storage::Storage;
use crate::vocab::{Vocabulary, WordId};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const TRIE_MAGIC: &[u8] = b"Trie Language Model";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrieUnigram {
    pub prob: f32,
    pub bo: f32,
    /// First bigram whose context is this word.
    pub next: u32,
}

/// Fixed-width bit-packed records `word | prob | bo | next`.
#[derive(Debug, Clone)]
pub struct BitTable {
    word_bits: u8,
    prob_bits: u8,
    bo_bits: u8,
    next_bits: u8,
    entries: u32,
    data: Storage,
}

impl BitTable {
    fn pack<I>(word_bits: u8, prob_bits: u8, bo_bits: u8, next_bits: u8, entries: usize, rows: I) -> Self
    where
        I: Iterator<Item = (u64, u64, u64, u64)>,
    {
        let entry_bits = (word_bits + prob_bits + bo_bits + next_bits) as usize;
        let mut data = vec![0u8; packed_len(entries, entry_bits)];
        let mut off = 0u64;
        for (word, prob, bo, next) in rows {
            write_bits(&mut data, off, word_bits, word);
            off += word_bits as u64;
            write_bits(&mut data, off, prob_bits, prob);
            off += prob_bits as u64;
            if bo_bits > 0 {
                write_bits(&mut data, off, bo_bits, bo);
                off += bo_bits as u64;
            }
            if next_bits > 0 {
                write_bits(&mut data, off, next_bits, next);
                off += next_bits as u64;
            }
        }
        Self {
            word_bits,
            prob_bits,
            bo_bits,
            next_bits,
            entries: entries as u32,
            data: Storage::Owned(data),
        }
    }

    #[inline]
    fn entry_bits(&self) -> u64 {
        (self.word_bits + self.prob_bits + self.bo_bits + self.next_bits) as u64
    }

    pub fn len(&self) -> usize {
        self.entries as usize
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn is_mapped(&self) -> bool {
        self.data.is_mapped()
    }

    #[inline]
    fn word(&self, i: usize) -> WordId {
        read_bits(self.data.as_bytes(), i as u64 * self.entry_bits(), self.word_bits) as WordId
    }

    #[inline]
    fn prob_code(&self, i: usize) -> u64 {
        let off = i as u64 * self.entry_bits() + self.word_bits as u64;
        read_bits(self.data.as_bytes(), off, self.prob_bits)
    }

    #[inline]
    fn bo_code(&self, i: usize) -> u64 {
        let off = i as u64 * self.entry_bits() + (self.word_bits + self.prob_bits) as u64;
        read_bits(self.data.as_bytes(), off, self.bo_bits)
    }

    #[inline]
    fn next(&self, i: usize) -> usize {
        let off = i as u64 * self.entry_bits() + (self.word_bits + self.prob_bits + self.bo_bits) as u64;
        read_bits(self.data.as_bytes(), off, self.next_bits) as usize
    }

    /// Binary search for `w` among the entries in `range`.
    fn find(&self, range: Range<usize>, w: WordId) -> Option<usize> {
        let (mut lo, mut hi) = (range.start, range.end);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let here = self.word(mid);
            if here == w {
                return Some(mid);
            } else if here < w {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        None
    }
}

#[derive(Debug)]
pub struct TrieLm {
    order: usize,
    unigrams: Vec<TrieUnigram>,
    /// Orders 2 to N-1.
    middles: Vec<BitTable>,
    /// Order N, absent for unigram models.
    longest: Option<BitTable>,
    quant: Quantizer,
}

/// First child index of every parent plus a closing entry.
fn child_starts(parents: &[RawNgram], children: &[RawNgram]) -> Vec<u32> {
    let mut starts = Vec::with_capacity(parents.len() + 1);
    let mut j = 0usize;
    for p in parents {
        while j < children.len() && children[j].prefix() < p.words.as_slice() {
            j += 1;
        }
        starts.push(j as u32);
    }
    starts.push(children.len() as u32);
    starts
}

impl TrieLm {
    /// Build from raw lists. Higher orders are sorted here; duplicates and
    /// n-grams whose prefix is missing are dropped with a warning.
    pub fn build(mut raw: RawNgramSet, lmath: &LogMath, quant: QuantType) -> Result<Self> {
        let order = raw.order;
        if order == 0 || raw.grams.len() != order {
            return Err(LmError::format(format!(
                "order {} with {} n-gram lists",
                order,
                raw.grams.len()
            )));
        }
        let n_words = raw.grams[0].len();
        if !raw.grams[0]
            .iter()
            .enumerate()
            .all(|(i, g)| g.words.len() == 1 && g.words[0] as usize == i)
        {
            return Err(LmError::format("unigrams must be listed in word id order"));
        }

        let dups = raw.sort_and_dedup();
        if dups > 0 {
            warn!("dropped {} duplicate n-grams", dups);
        }
        for k in 1..order {
            let (lower, upper) = raw.grams.split_at_mut(k);
            let parents = &lower[k - 1];
            let list = &mut upper[0];
            let before = list.len();
            list.retain(|g| {
                g.words.len() == k + 1
                    && g.words.iter().all(|&w| (w as usize) < n_words)
                    && (k == 1
                        || parents
                            .binary_search_by(|p| p.words.as_slice().cmp(g.prefix()))
                            .is_ok())
            });
            if list.len() < before {
                warn!(
                    "dropped {} {}-grams without a {}-gram prefix",
                    before - list.len(),
                    k + 1,
                    k
                );
            }
        }

        let to_log = |x: f32| lmath.log10_to_log(x as f64) as f32;
        let to_log4 = |x: f32| lmath.log10_to_log(round4(x) as f64) as f32;
        let grams = &raw.grams;

        let middle_values: Vec<(Vec<f32>, Vec<f32>)> = (1..order.saturating_sub(1))
            .map(|k| {
                (
                    grams[k].iter().map(|g| to_log4(g.prob())).collect(),
                    grams[k].iter().map(|g| to_log4(g.backoff())).collect(),
                )
            })
            .collect();
        let longest_values: Vec<f32> = if order > 1 {
            grams[order - 1].iter().map(|g| to_log4(g.prob())).collect()
        } else {
            Vec::new()
        };
        let quant = Quantizer::train(quant, middle_values, longest_values);

        let unigram_next = if order > 1 {
            child_starts(&grams[0], &grams[1])
        } else {
            vec![0; n_words + 1]
        };
        let mut unigrams: Vec<TrieUnigram> = grams[0]
            .iter()
            .zip(&unigram_next)
            .map(|(g, &next)| TrieUnigram {
                prob: to_log(g.prob()),
                bo: to_log(g.backoff()),
                next,
            })
            .collect();
        unigrams.push(TrieUnigram {
            prob: to_log(MIN_PROB_F),
            bo: 0.0,
            next: unigram_next[n_words],
        });

        let word_bits = required_bits(n_words.saturating_sub(1) as u64);
        let code_bits = quant.code_bits();
        let mut middles = Vec::with_capacity(order.saturating_sub(2));
        for k in 1..order.saturating_sub(1) {
            let next = child_starts(&grams[k], &grams[k + 1]);
            let next_bits = required_bits(grams[k + 1].len() as u64);
            let rows = grams[k]
                .iter()
                .enumerate()
                .map(|(i, g)| {
                    let (p, b) = quant.encode_middle(k - 1, to_log4(g.prob()), to_log4(g.backoff()));
                    (g.words[k] as u64, p, b, next[i] as u64)
                })
                .chain(std::iter::once((0, 0, 0, next[grams[k].len()] as u64)));
            middles.push(BitTable::pack(
                word_bits,
                code_bits,
                code_bits,
                next_bits,
                grams[k].len() + 1,
                rows,
            ));
        }
        let longest = (order > 1).then(|| {
            let list = &grams[order - 1];
            let rows = list
                .iter()
                .map(|g| (g.words[order - 1] as u64, quant.encode_longest(to_log4(g.prob())), 0, 0));
            BitTable::pack(word_bits, code_bits, 0, 0, list.len(), rows)
        });

        let lm = TrieLm {
            order,
            unigrams,
            middles,
            longest,
            quant,
        };
        info!("trie of order {} with counts {:?}", order, lm.counts());
        Ok(lm)
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn n_words(&self) -> usize {
        self.unigrams.len() - 1
    }

    pub fn quant_type(&self) -> QuantType {
        self.quant.kind()
    }

    pub fn counts(&self) -> Vec<u32> {
        let mut c = vec![self.n_words() as u32];
        c.extend(self.middles.iter().map(|t| t.entries - 1));
        c.extend(self.longest.iter().map(|t| t.entries));
        c
    }

    pub fn is_mapped(&self) -> bool {
        self.middles.iter().chain(self.longest.iter()).any(|t| t.is_mapped())
    }

    // --- Navigation ---

    /// Child index range of node `idx` at `level` (0 = unigrams).
    fn children(&self, level: usize, idx: usize) -> Range<usize> {
        if level == 0 {
            self.unigrams[idx].next as usize..self.unigrams[idx + 1].next as usize
        } else {
            let t = &self.middles[level - 1];
            t.next(idx)..t.next(idx + 1)
        }
    }

    /// Node for a context given most recent word first.
    fn find_context(&self, ctx: &[WordId]) -> Option<(usize, usize)> {
        let (&oldest, rest) = ctx.split_last()?;
        if oldest as usize >= self.n_words() {
            return None;
        }
        let mut level = 0;
        let mut idx = oldest as usize;
        for &w in rest.iter().rev() {
            let range = self.children(level, idx);
            idx = self.middles.get(level)?.find(range, w)?;
            level += 1;
        }
        Some((level, idx))
    }

    fn child_prob(&self, level: usize, idx: usize, w: WordId) -> Option<f32> {
        let range = self.children(level, idx);
        match self.middles.get(level) {
            Some(t) => {
                let j = t.find(range, w)?;
                Some(self.quant.decode_middle(level, t.prob_code(j), t.bo_code(j)).0)
            }
            None => {
                let t = self.longest.as_ref()?;
                let j = t.find(range, w)?;
                Some(self.quant.decode_longest(t.prob_code(j)))
            }
        }
    }

    fn backoff_of(&self, level: usize, idx: usize) -> f32 {
        if level == 0 {
            self.unigrams[idx].bo
        } else {
            let t = &self.middles[level - 1];
            self.quant.decode_middle(level - 1, t.prob_code(idx), t.bo_code(idx)).1
        }
    }

    /// Unweighted score; `history` is most recent first and already
    /// validated against the vocabulary.
    pub fn score(&self, wid: WordId, history: &[WordId]) -> NgramScore {
        let mut backoff = 0f64;
        let max_ctx = history.len().min(self.order - 1);
        for k in (1..=max_ctx).rev() {
            if let Some((level, idx)) = self.find_context(&history[..k]) {
                if let Some(p) = self.child_prob(level, idx, wid) {
                    return NgramScore {
                        score: (backoff + p as f64).round() as i32,
                        n_used: k + 1,
                    };
                }
                backoff += self.backoff_of(level, idx) as f64;
            }
        }
        NgramScore {
            score: (backoff + self.unigrams[wid as usize].prob as f64).round() as i32,
            n_used: 1,
        }
    }

    /// Append a unigram with no followers.
    pub fn add_unigram(&mut self, prob: i32) {
        let at = self.unigrams.len() - 1;
        let next = self.unigrams[at].next;
        self.unigrams.insert(
            at,
            TrieUnigram {
                prob: prob as f32,
                bo: 0.0,
                next,
            },
        );
    }

    // --- Extraction ---

    /// Depth-first walk yielding every n-gram in sorted order, as base-10
    /// values.
    pub fn to_raw(&self, words: &[String], lmath: &LogMath) -> RawNgramSet {
        let log10 = |v: f32| round4(lmath.log_float_to_log10(v) as f32);
        let mut grams: Vec<Vec<RawNgram>> = vec![Vec::new(); self.order];
        let mut path = Vec::with_capacity(self.order);
        for w in 0..self.n_words() {
            let u = &self.unigrams[w];
            let bo = (self.order > 1).then(|| log10(u.bo));
            grams[0].push(RawNgram::new(vec![w as WordId], log10(u.prob), bo));
            if self.order > 1 {
                path.push(w as WordId);
                self.walk(0, w, &mut path, &mut grams, &log10);
                path.pop();
            }
        }
        RawNgramSet {
            order: self.order,
            words: words.to_vec(),
            grams,
        }
    }

    fn walk(
        &self,
        level: usize,
        idx: usize,
        path: &mut Vec<WordId>,
        grams: &mut [Vec<RawNgram>],
        log10: &dyn Fn(f32) -> f32,
    ) {
        let range = self.children(level, idx);
        if let Some(t) = self.middles.get(level) {
            for j in range {
                let (p, b) = self.quant.decode_middle(level, t.prob_code(j), t.bo_code(j));
                path.push(t.word(j));
                grams[level + 1].push(RawNgram::new(path.clone(), log10(p), Some(log10(b))));
                self.walk(level + 1, j, path, grams, log10);
                path.pop();
            }
        } else if let Some(t) = &self.longest {
            for j in range {
                let p = self.quant.decode_longest(t.prob_code(j));
                path.push(t.word(j));
                grams[level + 1].push(RawNgram::new(path.clone(), log10(p), None));
                path.pop();
            }
        }
    }

    // --- Binary format ---

    pub fn write(&self, vocab: &Vocabulary, lmath: &LogMath, path: &Path) -> Result<()> {
        let mut out = Output::create(path)?;
        let mut w = Counting { inner: &mut out, pos: 0 };
        self.write_to(vocab, lmath, &mut w)
            .and_then(|_| out.finish())
            .map_err(|e| LmError::from(e).with_path(path))
    }

    fn write_to<W: Write>(&self, vocab: &Vocabulary, lmath: &LogMath, w: &mut Counting<W>) -> io::Result<()> {
        w.write_all(TRIE_MAGIC)?;
        w.write_u8(self.order as u8)?;
        for c in self.counts() {
            w.write_u32::<LittleEndian>(c)?;
        }
        w.write_f64::<LittleEndian>(lmath.base())?;
        w.write_u32::<LittleEndian>(lmath.shift())?;
        self.quant.write(w)?;
        for u in &self.unigrams {
            w.write_f32::<LittleEndian>(u.prob)?;
            w.write_f32::<LittleEndian>(u.bo)?;
            w.write_u32::<LittleEndian>(u.next)?;
        }
        for t in self.middles.iter().chain(self.longest.iter()) {
            let bytes = t.data.as_bytes();
            w.write_u8(t.word_bits)?;
            w.write_u8(t.next_bits)?;
            w.write_u32::<LittleEndian>(t.entries)?;
            w.write_u64::<LittleEndian>(bytes.len() as u64)?;
            let pad = (8 - (w.pos % 8) as usize) % 8;
            w.write_all(&[0u8; 8][..pad])?;
            w.write_all(bytes)?;
        }
        let mut blob = Vec::new();
        for word in vocab.words() {
            blob.extend_from_slice(word.as_bytes());
            blob.push(0);
        }
        w.write_u32::<LittleEndian>(blob.len() as u32)?;
        w.write_all(&blob)
    }

    /// Read a trie binary. With `use_mmap`, uncompressed files are mapped
    /// and the bit tables point into the map.
    pub fn read(path: &Path, lmath: &LogMath, use_mmap: bool) -> Result<(Vocabulary, TrieLm)> {
        let parsed = if use_mmap && !pio::is_gzip(path) {
            let file = File::open(path).map_err(|e| LmError::from(e).with_path(path))?;
            // SAFETY: read-only map of a file that is not modified while loaded.
            let map = Arc::new(unsafe { Mmap::map(&file) }.map_err(|e| LmError::from(e).with_path(path))?);
            parse(&map[..], Some(&map), lmath)
        } else {
            let (mut input, _) = pio::open_input(path)?;
            let mut bytes = Vec::new();
            input
                .read_to_end(&mut bytes)
                .map_err(|e| LmError::from(e).with_path(path))?;
            parse(&bytes, None, lmath)
        };
        let (vocab, lm) = parsed.map_err(|e| e.with_path(path))?;
        info!(
            "{}: trie of order {}, counts {:?}{}",
            path.display(),
            lm.order,
            lm.counts(),
            if lm.is_mapped() { ", mapped" } else { "" }
        );
        Ok((vocab, lm))
    }
}

/// Writer that tracks how many bytes went through it.
struct Counting<'a, W> {
    inner: &'a mut W,
    pos: u64,
}

impl<W: Write> Write for Counting<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn truncated(e: io::Error) -> LmError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        LmError::format("file is truncated")
    } else {
        LmError::from(e)
    }
}

fn parse(bytes: &[u8], map: Option<&Arc<Mmap>>, lmath: &LogMath) -> Result<(Vocabulary, TrieLm)> {
    let mut cur = bytes;
    if !cur.starts_with(TRIE_MAGIC) {
        return Err(LmError::format("not a trie model (bad magic)"));
    }
    cur = &cur[TRIE_MAGIC.len()..];

    let order = cur.read_u8().map_err(truncated)? as usize;
    if order == 0 {
        return Err(LmError::format("trie order is 0"));
    }
    let mut counts = Vec::with_capacity(order);
    for _ in 0..order {
        counts.push(cur.read_u32::<LittleEndian>().map_err(truncated)? as usize);
    }
    let base = cur.read_f64::<LittleEndian>().map_err(truncated)?;
    let shift = cur.read_u32::<LittleEndian>().map_err(truncated)?;
    if base != lmath.base() || shift != lmath.shift() {
        return Err(LmError::Unsupported(format!(
            "trie was written with log base {} shift {}, context uses base {} shift {}",
            base,
            shift,
            lmath.base(),
            lmath.shift()
        )));
    }
    let quant = Quantizer::read(&mut cur)?;
    if quant.kind() != QuantType::None && quant.middle_levels() != order.saturating_sub(2) {
        return Err(LmError::format("codebook count does not match the order"));
    }

    let n_words = counts[0];
    let mut unigrams = Vec::with_capacity(n_words + 1);
    for _ in 0..=n_words {
        unigrams.push(TrieUnigram {
            prob: cur.read_f32::<LittleEndian>().map_err(truncated)?,
            bo: cur.read_f32::<LittleEndian>().map_err(truncated)?,
            next: cur.read_u32::<LittleEndian>().map_err(truncated)?,
        });
    }

    let code_bits = quant.code_bits();
    let mut tables = Vec::with_capacity(order - 1);
    for k in 1..order {
        let is_longest = k == order - 1;
        let word_bits = cur.read_u8().map_err(truncated)?;
        let next_bits = cur.read_u8().map_err(truncated)?;
        let entries = cur.read_u32::<LittleEndian>().map_err(truncated)?;
        let byte_len = cur.read_u64::<LittleEndian>().map_err(truncated)? as usize;
        let bo_bits = if is_longest { 0 } else { code_bits };
        let next_ok = if is_longest { next_bits == 0 } else { (1..=32).contains(&next_bits) };
        if !(1..=32).contains(&word_bits) || !next_ok {
            return Err(LmError::format(format!(
                "{}-gram table has field widths {} and {}",
                k + 1,
                word_bits,
                next_bits
            )));
        }
        let expect_entries = if is_longest { counts[k] } else { counts[k] + 1 };
        let entry_bits = word_bits as usize + code_bits as usize + bo_bits as usize + next_bits as usize;
        if entries as usize != expect_entries || byte_len != packed_len(entries as usize, entry_bits) {
            return Err(LmError::format(format!(
                "{}-gram table header does not match its counts",
                k + 1
            )));
        }
        let start = bytes.len() - cur.len();
        let start = start + (8 - start % 8) % 8;
        let range = start..start + byte_len;
        if range.end > bytes.len() {
            return Err(LmError::format("file is truncated"));
        }
        let data = match map {
            Some(m) => Storage::mapped(m, range.clone()),
            None => Storage::Owned(bytes[range.clone()].to_vec()),
        };
        cur = &bytes[range.end..];
        tables.push(BitTable {
            word_bits,
            prob_bits: code_bits,
            bo_bits,
            next_bits,
            entries,
            data,
        });
    }

    let blob_len = cur.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    if cur.len() < blob_len {
        return Err(LmError::format("file is truncated"));
    }
    let words: Vec<String> = cur[..blob_len]
        .split(|&b| b == 0)
        .take(n_words)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    if words.len() != n_words || cur[..blob_len].iter().filter(|&&b| b == 0).count() != n_words {
        return Err(LmError::format(format!(
            "vocabulary holds {} words, expected {}",
            words.len(),
            n_words
        )));
    }

    let longest = if order > 1 { tables.pop() } else { None };
    let lm = TrieLm {
        order,
        unigrams,
        middles: tables,
        longest,
        quant,
    };
    lm.validate()?;
    Ok((vocab_from_words(&words), lm))
}

impl TrieLm {
    /// Child ranges must be monotonic and stay inside the next table.
    fn validate(&self) -> Result<()> {
        let next_len = |level: usize| -> usize {
            match self.middles.get(level) {
                Some(t) => t.len() - 1,
                None => self.longest.as_ref().map(|t| t.len()).unwrap_or(0),
            }
        };
        let n_next = next_len(0);
        let mut prev = 0usize;
        for u in &self.unigrams {
            let n = u.next as usize;
            if n < prev || n > n_next {
                return Err(LmError::format("unigram child range out of bounds"));
            }
            prev = n;
        }
        let n_words = self.n_words();
        // middle tables end in a sentinel whose word field is unused
        let real = self
            .middles
            .iter()
            .map(|t| (t, t.len().saturating_sub(1)))
            .chain(self.longest.iter().map(|t| (t, t.len())));
        for (l, (t, n)) in real.enumerate() {
            if (0..n).any(|i| t.word(i) as usize >= n_words) {
                return Err(LmError::format(format!("{}-gram word id out of range", l + 2)));
            }
        }
        for (l, t) in self.middles.iter().enumerate() {
            let n_next = next_len(l + 1);
            let mut prev = 0usize;
            for i in 0..t.len() {
                let n = t.next(i);
                if n < prev || n > n_next {
                    return Err(LmError::format(format!(
                        "{}-gram child range out of bounds",
                        l + 2
                    )));
                }
                prev = n;
            }
        }
        Ok(())
    }
}
