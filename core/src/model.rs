//! Common model interface.
//!
//! [`NgramModel`] owns a vocabulary, a shared [`LogMath`], the current
//! [`Weights`] and one storage [`Backend`]. Readers pick the backend from the
//! file type; every query goes through the [`LanguageModel`] trait, which
//! [`crate::set::ModelSet`] implements as well.
use crate::arpa;
use crate::dmp;
use crate::error::{LmError, Result};
use crate::lm3g::Lm3g;
use crate::logmath::LogMath;
use crate::ngram_raw::RawNgramSet;
use crate::quant::QuantType;
use crate::tginfo::CacheStats;
use crate::trie::TrieLm;
use crate::vocab::{Vocabulary, WordId, SENTENCE_START};
use crate::LmConfig;
use byteorder::{ByteOrder, NativeEndian};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a lookup: the log value and the order that actually matched.
///
/// `n_used == 0` means the word was not scorable at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NgramScore {
    pub score: i32,
    pub n_used: usize,
}

/// Language weight, insertion penalty and unigram interpolation, all in
/// log-math units except `lw`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub lw: f32,
    pub log_wip: i32,
    pub log_uw: i32,
    /// `log(1 / (n - 1))` for the vocabulary size at load time.
    pub log_uniform: i32,
    /// `log(1 - uw)`; [`LogMath::zero`] disables interpolation.
    pub log_uniform_weight: i32,
}

fn log_uniform(lmath: &LogMath, n_words: usize) -> i32 {
    if n_words > 1 {
        lmath.log(1.0 / (n_words - 1) as f64)
    } else {
        0
    }
}

impl Weights {
    /// Weights that leave stored values untouched.
    pub fn identity(lmath: &LogMath, n_words: usize) -> Self {
        Self {
            lw: 1.0,
            log_wip: 0,
            log_uw: 0,
            log_uniform: log_uniform(lmath, n_words),
            log_uniform_weight: lmath.zero(),
        }
    }

    pub fn new(lmath: &LogMath, n_words: usize, lw: f32, wip: f32, uw: f32) -> Self {
        Self::identity(lmath, n_words).reweighted(lmath, lw, wip, uw)
    }

    /// Same uniform distribution, new scalars.
    pub fn reweighted(&self, lmath: &LogMath, lw: f32, wip: f32, uw: f32) -> Self {
        Self {
            lw,
            log_wip: lmath.log(wip as f64),
            log_uw: lmath.log(uw as f64),
            log_uniform: self.log_uniform,
            log_uniform_weight: lmath.log(1.0 - uw as f64),
        }
    }

    /// Scale by `lw` (truncating toward zero, as the classic tables do) and
    /// add the word insertion penalty.
    #[inline]
    pub fn apply(&self, raw: i32) -> i32 {
        ((raw as f64 * self.lw as f64) as i32).saturating_add(self.log_wip)
    }

    #[inline]
    pub fn unapply(&self, weighted: i32) -> i32 {
        (weighted.saturating_sub(self.log_wip) as f64 / self.lw as f64).round() as i32
    }

    #[inline]
    pub fn scale_backoff(&self, raw: i32) -> i32 {
        (raw as f64 * self.lw as f64) as i32
    }

    #[inline]
    pub fn unscale_backoff(&self, scaled: i32) -> i32 {
        (scaled as f64 / self.lw as f64).round() as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Auto,
    Arpa,
    Dmp,
    /// Compact trie binary.
    Bin,
}

impl FileType {
    /// Guess from the extension, ignoring a trailing `.gz`. Unknown
    /// extensions are taken for ARPA text.
    pub fn from_path(path: &Path) -> FileType {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let name = name.strip_suffix(".gz").unwrap_or(&name);
        match name.rsplit_once('.').map(|(_, ext)| ext) {
            Some("dmp") => FileType::Dmp,
            Some("bin") | Some("trie") => FileType::Bin,
            _ => FileType::Arpa,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileType::Auto => "auto",
            FileType::Arpa => "arpa",
            FileType::Dmp => "dmp",
            FileType::Bin => "bin",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FileType {
    type Err = LmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(FileType::Auto),
            "arpa" | "lm" => Ok(FileType::Arpa),
            "dmp" => Ok(FileType::Dmp),
            "bin" | "trie" => Ok(FileType::Bin),
            other => Err(LmError::Config(format!("unknown model file type '{}'", other))),
        }
    }
}

/// Storage backing a model.
#[derive(Debug)]
pub enum Backend {
    /// Classic tables built from ARPA text.
    Arpa(Lm3g),
    /// Classic tables read from a DMP dump.
    Dmp(Lm3g),
    Trie(TrieLm),
}

/// Query surface shared by single models and model sets.
pub trait LanguageModel {
    fn order(&self) -> usize;
    fn log_math(&self) -> &LogMath;
    fn vocab_size(&self) -> usize;
    fn wid(&self, word: &str) -> Option<WordId>;
    fn word(&self, wid: WordId) -> Option<&str>;
    fn unknown_wid(&self) -> Option<WordId>;

    /// Weighted score of `wid` after `history` (most recent first). Extra
    /// history beyond the model order is ignored; an id outside the
    /// vocabulary cuts the history short at that point.
    fn ng_score(&self, wid: WordId, history: &[WordId]) -> NgramScore;

    /// Like [`LanguageModel::ng_score`] with the weights taken back out.
    fn ng_prob(&self, wid: WordId, history: &[WordId]) -> NgramScore;

    /// Convert a weighted score into a raw log probability.
    fn score_to_prob(&self, score: i32) -> i32;

    /// Set language weight, word insertion penalty and unigram weight.
    /// Calling again replaces the previous weights.
    fn apply_weights(&mut self, lw: f32, wip: f32, uw: f32);

    /// Add `word` with unigram probability `weight` relative to a uniform
    /// word. Returns the id, the old one if the word was already known.
    fn add_word(&mut self, word: &str, weight: f32) -> WordId;

    /// `word`'s id, or the unknown-word id.
    fn lookup(&self, word: &str) -> Option<WordId> {
        self.wid(word).or_else(|| self.unknown_wid())
    }

    /// History ids, stopping at the first word that cannot be resolved.
    fn history_ids(&self, history: &[&str]) -> Vec<WordId> {
        history.iter().map_while(|w| self.lookup(w)).collect()
    }

    fn score(&self, word: &str, history: &[&str]) -> NgramScore {
        match self.lookup(word) {
            Some(wid) => self.ng_score(wid, &self.history_ids(history)),
            None => NgramScore {
                score: self.log_math().zero(),
                n_used: 0,
            },
        }
    }

    fn prob(&self, word: &str, history: &[&str]) -> NgramScore {
        match self.lookup(word) {
            Some(wid) => self.ng_prob(wid, &self.history_ids(history)),
            None => NgramScore {
                score: self.log_math().zero(),
                n_used: 0,
            },
        }
    }
}

#[derive(Debug)]
pub struct NgramModel {
    vocab: Vocabulary,
    lmath: Arc<LogMath>,
    weights: Weights,
    backend: Backend,
}

pub(crate) fn vocab_from_words(words: &[String]) -> Vocabulary {
    let mut vocab = Vocabulary::with_capacity(words.len());
    for w in words {
        if vocab.push(w).is_err() {
            vocab.push_shadowed(w);
        }
    }
    vocab
}

impl NgramModel {
    pub fn new(vocab: Vocabulary, lmath: Arc<LogMath>, backend: Backend) -> Self {
        let weights = Weights::identity(&lmath, vocab.len());
        Self {
            vocab,
            lmath,
            weights,
            backend,
        }
    }

    /// Load a model. With [`FileType::Auto`] the type guessed from the file
    /// name is tried first, then the others; the first error is reported if
    /// none succeeds. Weights from `config` are applied after loading.
    pub fn read(path: &Path, ftype: FileType, lmath: Arc<LogMath>, config: &LmConfig) -> Result<Self> {
        let mut model = match ftype {
            FileType::Auto => {
                let guess = FileType::from_path(path);
                let mut candidates = vec![guess];
                candidates.extend(
                    [FileType::Arpa, FileType::Dmp, FileType::Bin]
                        .into_iter()
                        .filter(|&t| t != guess),
                );
                let mut first_err = None;
                let mut found = None;
                for t in candidates {
                    match Self::read_as(path, t, lmath.clone(), config) {
                        Ok(m) => {
                            found = Some(m);
                            break;
                        }
                        Err(e) => {
                            if let LmError::Io { source, .. } = &e {
                                if source.kind() == std::io::ErrorKind::NotFound {
                                    return Err(e);
                                }
                            }
                            info!("{} is not a {} model: {}", path.display(), t, e);
                            first_err.get_or_insert(e);
                        }
                    }
                }
                match (found, first_err) {
                    (Some(m), _) => m,
                    (None, Some(e)) => return Err(e),
                    (None, None) => return Err(LmError::format("no reader accepted the file")),
                }
            }
            t => Self::read_as(path, t, lmath, config)?,
        };
        if config.lw != 1.0 || config.wip != 1.0 || config.uw != 1.0 {
            model.apply_weights(config.lw, config.wip, config.uw);
        }
        Ok(model)
    }

    fn read_as(path: &Path, ftype: FileType, lmath: Arc<LogMath>, config: &LmConfig) -> Result<Self> {
        match ftype {
            FileType::Arpa => {
                let raw = arpa::read(path)?;
                Self::from_raw(raw, lmath, config.quant_type()?)
            }
            FileType::Dmp => {
                let (vocab, lm) = dmp::read(path, &lmath, config.mmap)?;
                Ok(Self::new(vocab, lmath, Backend::Dmp(lm)))
            }
            FileType::Bin => {
                let (vocab, trie) = TrieLm::read(path, &lmath, config.mmap)?;
                Ok(Self::new(vocab, lmath, Backend::Trie(trie)))
            }
            FileType::Auto => Self::read_as(path, FileType::from_path(path), lmath, config),
        }
    }

    /// Build from raw lists. Orders up to 3 get the classic tables, higher
    /// orders the trie (quantized with `quant`).
    pub fn from_raw(raw: RawNgramSet, lmath: Arc<LogMath>, quant: QuantType) -> Result<Self> {
        let vocab = vocab_from_words(&raw.words);
        let backend = if raw.order <= 3 {
            Backend::Arpa(Lm3g::from_raw(&raw, &lmath)?)
        } else {
            Backend::Trie(TrieLm::build(raw, &lmath, quant)?)
        };
        Ok(Self::new(vocab, lmath, backend))
    }

    /// Write in format `ftype` (guessed from the name for `Auto`). Values are
    /// written unweighted.
    pub fn write(&self, path: &Path, ftype: FileType) -> Result<()> {
        let ftype = match ftype {
            FileType::Auto => FileType::from_path(path),
            t => t,
        };
        info!("writing {} as {}", path.display(), ftype);
        match ftype {
            FileType::Arpa | FileType::Auto => arpa::write(&self.to_raw(), path),
            FileType::Dmp => self.write_dmp_as::<NativeEndian>(path),
            FileType::Bin => match &self.backend {
                Backend::Trie(t) => t.write(&self.vocab, &self.lmath, path),
                _ => {
                    let trie = TrieLm::build(self.to_raw(), &self.lmath, QuantType::None)?;
                    trie.write(&self.vocab, &self.lmath, path)
                }
            },
        }
    }

    /// DMP output in an explicit byte order.
    pub fn write_dmp_as<E: ByteOrder>(&self, path: &Path) -> Result<()> {
        let start = self.vocab.id(SENTENCE_START);
        match &self.backend {
            Backend::Arpa(lm) | Backend::Dmp(lm) => {
                dmp::write::<E>(lm, &self.vocab, &self.lmath, &self.weights, start, path)
            }
            Backend::Trie(t) if t.order() <= 3 => {
                let lm = Lm3g::from_raw(&self.to_raw(), &self.lmath)?;
                let identity = Weights::identity(&self.lmath, self.vocab.len());
                dmp::write::<E>(&lm, &self.vocab, &self.lmath, &identity, start, path)
            }
            Backend::Trie(t) => Err(LmError::Unsupported(format!(
                "DMP files hold at most trigrams, model has order {}",
                t.order()
            ))),
        }
    }

    /// Every stored n-gram as unweighted base-10 values.
    pub fn to_raw(&self) -> RawNgramSet {
        match &self.backend {
            Backend::Arpa(lm) | Backend::Dmp(lm) => lm.to_raw(
                self.vocab.words(),
                &self.weights,
                &self.lmath,
                self.vocab.id(SENTENCE_START),
            ),
            Backend::Trie(t) => t.to_raw(self.vocab.words(), &self.lmath),
        }
    }

    /// Repack into a trie. Language weight and insertion penalty carry over.
    pub fn to_trie(&self, quant: QuantType) -> Result<NgramModel> {
        let trie = TrieLm::build(self.to_raw(), &self.lmath, quant)?;
        Ok(Self {
            vocab: self.vocab.clone(),
            lmath: self.lmath.clone(),
            weights: self.weights,
            backend: Backend::Trie(trie),
        })
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    pub fn shared_log_math(&self) -> &Arc<LogMath> {
        &self.lmath
    }

    pub fn file_type(&self) -> FileType {
        match self.backend {
            Backend::Arpa(_) => FileType::Arpa,
            Backend::Dmp(_) => FileType::Dmp,
            Backend::Trie(_) => FileType::Bin,
        }
    }

    /// N-gram counts per order, unigrams first.
    pub fn counts(&self) -> Vec<u32> {
        match &self.backend {
            Backend::Arpa(lm) | Backend::Dmp(lm) => lm.counts(),
            Backend::Trie(t) => t.counts(),
        }
    }

    /// True when part of the model aliases a memory-mapped file.
    pub fn is_mapped(&self) -> bool {
        match &self.backend {
            Backend::Arpa(lm) | Backend::Dmp(lm) => lm.is_mapped(),
            Backend::Trie(t) => t.is_mapped(),
        }
    }

    pub fn bg_score(&self, w1: WordId, w2: WordId) -> NgramScore {
        self.ng_score(w2, &[w1])
    }

    pub fn tg_score(&self, w1: WordId, w2: WordId, w3: WordId) -> NgramScore {
        self.ng_score(w3, &[w2, w1])
    }

    /// Trigram-cache counters; `None` for trie models, which have no cache.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        match &self.backend {
            Backend::Arpa(lm) | Backend::Dmp(lm) => Some(lm.cache_stats()),
            Backend::Trie(_) => None,
        }
    }

    /// Evict cache entries untouched since the previous flush.
    pub fn flush_unused_cache(&self) -> usize {
        match &self.backend {
            Backend::Arpa(lm) | Backend::Dmp(lm) => lm.flush_unused_cache(),
            Backend::Trie(_) => 0,
        }
    }

    pub fn reset_cache(&self) {
        if let Backend::Arpa(lm) | Backend::Dmp(lm) = &self.backend {
            lm.reset_cache();
        }
    }

    /// Valid history prefix, capped at `order - 1` words.
    fn clip_history<'h>(&self, history: &'h [WordId]) -> &'h [WordId] {
        let n = self.vocab.len();
        let valid = history.iter().take_while(|&&h| (h as usize) < n).count();
        &history[..valid.min(self.order().saturating_sub(1))]
    }

    fn unscorable(&self) -> NgramScore {
        NgramScore {
            score: self.lmath.zero(),
            n_used: 0,
        }
    }
}

impl LanguageModel for NgramModel {
    fn order(&self) -> usize {
        match &self.backend {
            Backend::Arpa(lm) | Backend::Dmp(lm) => lm.order(),
            Backend::Trie(t) => t.order(),
        }
    }

    fn log_math(&self) -> &LogMath {
        &self.lmath
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn wid(&self, word: &str) -> Option<WordId> {
        self.vocab.id(word)
    }

    fn word(&self, wid: WordId) -> Option<&str> {
        self.vocab.word(wid)
    }

    fn unknown_wid(&self) -> Option<WordId> {
        self.vocab.unknown_id()
    }

    fn ng_score(&self, wid: WordId, history: &[WordId]) -> NgramScore {
        if wid as usize >= self.vocab.len() {
            return self.unscorable();
        }
        let history = self.clip_history(history);
        match &self.backend {
            Backend::Arpa(lm) | Backend::Dmp(lm) => lm.score(wid, history),
            Backend::Trie(t) => {
                let s = t.score(wid, history);
                NgramScore {
                    score: self.weights.apply(s.score),
                    n_used: s.n_used,
                }
            }
        }
    }

    fn ng_prob(&self, wid: WordId, history: &[WordId]) -> NgramScore {
        if wid as usize >= self.vocab.len() {
            return self.unscorable();
        }
        let history = self.clip_history(history);
        match &self.backend {
            Backend::Arpa(lm) | Backend::Dmp(lm) => {
                let is_start = self.vocab.id(SENTENCE_START) == Some(wid);
                lm.raw_score(wid, history, &self.weights, &self.lmath, is_start)
            }
            Backend::Trie(t) => t.score(wid, history),
        }
    }

    fn score_to_prob(&self, score: i32) -> i32 {
        self.weights.unapply(score)
    }

    fn apply_weights(&mut self, lw: f32, wip: f32, uw: f32) {
        let new = self.weights.reweighted(&self.lmath, lw, wip, uw);
        match &mut self.backend {
            Backend::Arpa(lm) | Backend::Dmp(lm) => {
                let start = self.vocab.id(SENTENCE_START);
                lm.apply_weights(&self.weights, &new, &self.lmath, start);
            }
            Backend::Trie(_) => {
                if uw != 1.0 {
                    warn!("unigram weight has no effect on trie models");
                }
            }
        }
        self.weights = new;
    }

    fn add_word(&mut self, word: &str, weight: f32) -> WordId {
        let wid = match self.vocab.push(word) {
            Ok(wid) => wid,
            Err(existing) => {
                warn!("'{}' is already in the model (id {})", word, existing);
                return existing;
            }
        };
        let w = &self.weights;
        let raw = self.lmath.log(weight as f64).saturating_add(w.log_uniform);
        match &mut self.backend {
            Backend::Arpa(lm) | Backend::Dmp(lm) => {
                let prob = self
                    .lmath
                    .add(raw + w.log_uw, w.log_uniform + w.log_uniform_weight);
                lm.add_unigram(w.apply(prob));
            }
            Backend::Trie(t) => t.add_unigram(raw),
        }
        wid
    }
}
