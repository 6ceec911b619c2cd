//! A named collection of models scored either by linear interpolation or by
//! delegating to one selected member.
//!
//! The set keeps its own vocabulary (the union of the members', sorted, with
//! `<UNK>` first) and a map from every set word id to each member's id.
use crate::error::{LmError, Result};
use crate::logmath::LogMath;
use crate::model::{FileType, LanguageModel, NgramModel, NgramScore, Weights};
use crate::vocab::{Vocabulary, WordId, UNKNOWN_WORD};
use crate::LmConfig;
use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct ModelSet {
    names: Vec<String>,
    models: Vec<NgramModel>,
    /// Log interpolation weight per member.
    lweights: Vec<i32>,
    /// Selected member; `None` interpolates.
    current: Option<usize>,
    vocab: Vocabulary,
    /// `widmap[w][i]`: id of set word `w` in member `i`.
    widmap: Vec<Vec<Option<WordId>>>,
    lmath: Arc<LogMath>,
    weights: Weights,
    applied: Option<(f32, f32, f32)>,
}

fn word_order(a: &String, b: &String) -> Ordering {
    match (a == UNKNOWN_WORD, b == UNKNOWN_WORD) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.cmp(b),
    }
}

impl ModelSet {
    /// Combine `models`. Without `weights` every member gets `1/n`.
    /// All members must share the log base and shift.
    pub fn new(models: Vec<(String, NgramModel)>, weights: Option<Vec<f32>>) -> Result<Self> {
        let lmath = match models.first() {
            Some((_, m)) => m.shared_log_math().clone(),
            None => return Err(LmError::Config("a model set needs at least one model".into())),
        };
        let n = models.len();
        let weights = weights.unwrap_or_else(|| vec![1.0 / n as f32; n]);
        if weights.len() != n {
            return Err(LmError::Config(format!(
                "{} weights given for {} models",
                weights.len(),
                n
            )));
        }

        let mut names = Vec::with_capacity(n);
        let mut members = Vec::with_capacity(n);
        for (name, model) in models {
            if !model.log_math().same_scale(&lmath) {
                return Err(LmError::Config(format!(
                    "model '{}' uses a different log base or shift",
                    name
                )));
            }
            if names.contains(&name) {
                return Err(LmError::Config(format!("duplicate model name '{}'", name)));
            }
            names.push(name);
            members.push(model);
        }

        let lweights = weights.iter().map(|&w| lmath.log(w as f64)).collect();
        let mut set = Self {
            names,
            models: members,
            lweights,
            current: None,
            vocab: Vocabulary::new(),
            widmap: Vec::new(),
            weights: Weights::identity(&lmath, 0),
            lmath,
            applied: None,
        };
        set.rebuild_vocab();
        info!(
            "model set of {} models, {} words",
            set.models.len(),
            set.vocab.len()
        );
        Ok(set)
    }

    /// Read a control file of `path name` lines. Relative paths are taken
    /// from the control file's directory; blank lines and `#` comments are
    /// skipped. Members are interpolated with uniform weights.
    pub fn read_control_file(path: &Path, config: &LmConfig) -> Result<Self> {
        let lmath = config.log_math()?;
        let text = fs::read_to_string(path).map_err(|e| LmError::from(e).with_path(path))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let mut models = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (file, name) = match (fields.next(), fields.next()) {
                (Some(f), Some(n)) => (f, n),
                _ => {
                    return Err(LmError::format_at(i + 1, "expected '<path> <name>'").with_path(path))
                }
            };
            let model = NgramModel::read(&base.join(file), FileType::Auto, lmath.clone(), config)?;
            models.push((name.to_string(), model));
        }
        Self::new(models, None)
    }

    fn rebuild_vocab(&mut self) {
        let mut words: Vec<String> = self
            .models
            .iter()
            .flat_map(|m| m.vocab().words().iter().cloned())
            .collect();
        words.push(UNKNOWN_WORD.to_string());
        words.sort_by(word_order);
        words.dedup();

        let mut vocab = Vocabulary::with_capacity(words.len());
        let mut widmap = Vec::with_capacity(words.len());
        for w in &words {
            // sorted and deduplicated, so every push is new
            let _ = vocab.push(w);
            widmap.push(self.models.iter().map(|m| m.wid(w)).collect());
        }
        self.weights = Weights {
            log_uniform: Weights::identity(&self.lmath, vocab.len()).log_uniform,
            ..self.weights
        };
        self.vocab = vocab;
        self.widmap = widmap;
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| LmError::UnknownModel(name.to_string()))
    }

    /// Delegate every score to `name`.
    pub fn select(&mut self, name: &str) -> Result<&NgramModel> {
        let i = self.index_of(name)?;
        self.current = Some(i);
        Ok(&self.models[i])
    }

    /// Return to interpolation, optionally setting new weights by name.
    pub fn interp(&mut self, weights: Option<&[(&str, f32)]>) -> Result<()> {
        if let Some(weights) = weights {
            for &(name, w) in weights {
                let i = self.index_of(name)?;
                self.lweights[i] = self.lmath.log(w as f64);
            }
        }
        self.current = None;
        Ok(())
    }

    /// Add a member with interpolation weight `weight`; the existing weights
    /// are scaled by `1 - weight`.
    pub fn add(&mut self, name: &str, mut model: NgramModel, weight: f32) -> Result<()> {
        if !model.log_math().same_scale(&self.lmath) {
            return Err(LmError::Config(format!(
                "model '{}' uses a different log base or shift",
                name
            )));
        }
        if self.names.iter().any(|n| n == name) {
            return Err(LmError::Config(format!("duplicate model name '{}'", name)));
        }
        if let Some((lw, wip, uw)) = self.applied {
            model.apply_weights(lw, wip, uw);
        }
        let scale = self.lmath.log(1.0 - weight as f64);
        for lw in self.lweights.iter_mut() {
            *lw = lw.saturating_add(scale);
        }
        self.lweights.push(self.lmath.log(weight as f64));
        self.names.push(name.to_string());
        self.models.push(model);
        self.rebuild_vocab();
        Ok(())
    }

    /// Take a member out; the remaining weights are scaled back up by
    /// `1 / (1 - w_removed)`.
    pub fn remove(&mut self, name: &str) -> Result<NgramModel> {
        let i = self.index_of(name)?;
        if self.models.len() == 1 {
            return Err(LmError::Config("cannot remove the last model of a set".into()));
        }
        let removed = self.lmath.exp(self.lweights[i]);
        self.names.remove(i);
        self.lweights.remove(i);
        let model = self.models.remove(i);
        if removed < 1.0 {
            let scale = self.lmath.log(1.0 - removed);
            for lw in self.lweights.iter_mut() {
                *lw = lw.saturating_sub(scale);
            }
        } else {
            warn!("removed model carried all the weight, using uniform weights");
            let uniform = self.lmath.log(1.0 / self.models.len() as f64);
            self.lweights.iter_mut().for_each(|lw| *lw = uniform);
        }
        self.current = match self.current {
            Some(c) if c == i => None,
            Some(c) if c > i => Some(c - 1),
            c => c,
        };
        self.rebuild_vocab();
        Ok(model)
    }

    pub fn member(&self, name: &str) -> Option<&NgramModel> {
        self.index_of(name).ok().map(|i| &self.models[i])
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Name of the selected member, `None` while interpolating.
    pub fn current(&self) -> Option<&str> {
        self.current.map(|i| self.names[i].as_str())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Linear interpolation weight of `name`.
    pub fn weight(&self, name: &str) -> Option<f64> {
        self.index_of(name).ok().map(|i| self.lmath.exp(self.lweights[i]))
    }

    /// Score of member `i` with ids mapped into its vocabulary. A history
    /// word the member cannot resolve ends the history there.
    fn member_score(&self, i: usize, wid: WordId, history: &[WordId], raw: bool) -> Option<NgramScore> {
        let model = &self.models[i];
        let map = |w: WordId| self.widmap[w as usize][i].or_else(|| model.unknown_wid());
        let mwid = map(wid)?;
        let hist: Vec<WordId> = history.iter().map_while(|&h| map(h)).collect();
        Some(if raw {
            model.ng_prob(mwid, &hist)
        } else {
            model.ng_score(mwid, &hist)
        })
    }

    fn combined(&self, wid: WordId, history: &[WordId], raw: bool) -> NgramScore {
        let zero = NgramScore {
            score: self.lmath.zero(),
            n_used: 0,
        };
        if wid as usize >= self.vocab.len() {
            return zero;
        }
        let n = self.vocab.len();
        let valid = history.iter().take_while(|&&h| (h as usize) < n).count();
        let history = &history[..valid];
        match self.current {
            Some(i) => self.member_score(i, wid, history, raw).unwrap_or(zero),
            None => (0..self.models.len())
                .filter_map(|i| self.member_score(i, wid, history, raw).map(|s| (i, s)))
                .fold(zero, |acc, (i, s)| NgramScore {
                    score: self.lmath.add(acc.score, self.lweights[i].saturating_add(s.score)),
                    n_used: acc.n_used.max(s.n_used),
                }),
        }
    }
}

impl LanguageModel for ModelSet {
    fn order(&self) -> usize {
        self.models.iter().map(|m| m.order()).max().unwrap_or(0)
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
        self.combined(wid, history, false)
    }

    fn ng_prob(&self, wid: WordId, history: &[WordId]) -> NgramScore {
        self.combined(wid, history, true)
    }

    fn score_to_prob(&self, score: i32) -> i32 {
        self.weights.unapply(score)
    }

    fn apply_weights(&mut self, lw: f32, wip: f32, uw: f32) {
        for m in self.models.iter_mut() {
            m.apply_weights(lw, wip, uw);
        }
        self.weights = self.weights.reweighted(&self.lmath, lw, wip, uw);
        self.applied = Some((lw, wip, uw));
    }

    fn add_word(&mut self, word: &str, weight: f32) -> WordId {
        let wid = match self.vocab.push(word) {
            Ok(wid) => wid,
            Err(existing) => {
                warn!("'{}' is already in the model set (id {})", word, existing);
                return existing;
            }
        };
        let row = self
            .models
            .iter_mut()
            .map(|m| Some(m.wid(word).unwrap_or_else(|| m.add_word(word, weight))))
            .collect();
        self.widmap.push(row);
        wid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ngram_raw::{RawNgram, RawNgramSet};
    use crate::quant::QuantType;

    fn lmath() -> Arc<LogMath> {
        Arc::new(LogMath::new(1.0001, 4, 0).unwrap())
    }

    fn model(lmath: &Arc<LogMath>, words: &[&str], bigram_prob: f32) -> NgramModel {
        let n = words.len() as u32;
        let raw = RawNgramSet {
            order: 2,
            words: words.iter().map(|s| s.to_string()).collect(),
            grams: vec![
                (0..n)
                    .map(|w| RawNgram::new(vec![w], -1.0 - 0.1 * w as f32, Some(-0.2)))
                    .collect(),
                vec![RawNgram::new(vec![0, 1], bigram_prob, None)],
            ],
        };
        NgramModel::from_raw(raw, lmath.clone(), QuantType::None).unwrap()
    }

    fn pair() -> ModelSet {
        let lm = lmath();
        ModelSet::new(
            vec![
                ("one".to_string(), model(&lm, &["<s>", "a", "b"], -0.3)),
                ("two".to_string(), model(&lm, &["<s>", "a", "c"], -0.6)),
            ],
            None,
        )
        .unwrap()
    }

    #[test]
    fn vocabulary_is_sorted_union_with_unk_first() {
        let set = pair();
        let words: Vec<_> = (0..set.vocab_size() as u32).filter_map(|w| set.word(w)).collect();
        assert_eq!(words, vec!["<UNK>", "<s>", "a", "b", "c"]);
        assert_eq!(set.unknown_wid(), Some(0));
    }

    #[test]
    fn equal_weights_interpolate() {
        let set = pair();
        let lm = set.log_math();
        let one = set.member("one").unwrap().score("a", &["<s>"]).score;
        let two = set.member("two").unwrap().score("a", &["<s>"]).score;
        let half = lm.log(0.5);
        let got = set.score("a", &["<s>"]);
        assert_eq!(got.score, lm.add(lm.add(lm.zero(), half + one), half + two));
        assert_eq!(got.n_used, 2);

        // "b" only exists in the first model
        let b = set.score("b", &[]).score;
        let b1 = set.member("one").unwrap().score("b", &[]).score;
        assert_eq!(b, lm.add(lm.zero(), half + b1));
    }

    #[test]
    fn selection_delegates() {
        let mut set = pair();
        set.select("two").unwrap();
        assert_eq!(set.current(), Some("two"));
        let direct = set.member("two").unwrap().score("a", &["<s>"]);
        assert_eq!(set.score("a", &["<s>"]), direct);
        assert_eq!(set.score("b", &[]).n_used, 0);
        assert!(matches!(set.select("three"), Err(LmError::UnknownModel(_))));
        set.interp(None).unwrap();
        assert_eq!(set.current(), None);
    }

    #[test]
    fn add_and_remove_renormalize() {
        let lm = lmath();
        let mut set = pair();
        set.add("three", model(&lm, &["<s>", "d"], -0.1), 0.5).unwrap();
        for name in ["one", "two"] {
            assert!((set.weight(name).unwrap() - 0.25).abs() < 1e-3);
        }
        assert!(set.wid("d").is_some());

        let removed = set.remove("three").unwrap();
        assert_eq!(removed.vocab_size(), 2);
        for name in ["one", "two"] {
            assert!((set.weight(name).unwrap() - 0.5).abs() < 1e-3);
        }
        assert_eq!(set.wid("d"), None);
        assert!(set.remove("one").is_ok());
        assert!(set.remove("two").is_err());
    }

    #[test]
    fn added_word_reaches_every_member() {
        let mut set = pair();
        let wid = set.add_word("zebra", 1.0);
        assert_eq!(set.word(wid), Some("zebra"));
        for name in ["one", "two"] {
            assert!(set.member(name).unwrap().wid("zebra").is_some());
        }
        assert_eq!(set.score("zebra", &[]).n_used, 1);
    }

    #[test]
    fn mismatched_log_scale_is_rejected() {
        let a = lmath();
        let b = Arc::new(LogMath::new(1.0003, 4, 0).unwrap());
        let err = ModelSet::new(
            vec![
                ("a".to_string(), model(&a, &["<s>", "x"], -0.1)),
                ("b".to_string(), model(&b, &["<s>", "x"], -0.1)),
            ],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, LmError::Config(_)));
    }
}
