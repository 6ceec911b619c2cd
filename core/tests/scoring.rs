// Backoff scoring on the small trigram fixture: present n-grams, backed-off
// n-grams, the trigram cache and weight handling.

use ngramlm_core::{FileType, LanguageModel, LmConfig, NgramModel};
use std::path::PathBuf;

fn data(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/data").join(name)
}

fn tiny() -> NgramModel {
    let config = LmConfig::default();
    NgramModel::read(&data("tiny.arpa"), FileType::Auto, config.log_math().unwrap(), &config).unwrap()
}

/// Sum of log10 values in model units, one conversion per term as the
/// stored tables do it.
fn expect(m: &NgramModel, terms: &[f64]) -> i32 {
    terms.iter().map(|&t| m.log_math().log10_to_log(t)).sum()
}

fn assert_near(got: i32, want: i32, tol: i32) {
    assert!((got - want).abs() <= tol, "got {}, want {}", got, want);
}

#[test]
fn loads_counts_and_vocabulary() {
    let m = tiny();
    assert_eq!(m.file_type(), FileType::Arpa);
    assert_eq!(m.order(), 3);
    assert_eq!(m.counts(), vec![9, 9, 6]);
    assert_eq!(m.wid("</s>"), Some(0));
    assert_eq!(m.wid("sphinx"), Some(8));
    assert_eq!(m.unknown_wid(), Some(2));
}

#[test]
fn bigram_found_or_backed_off_to_unigram() {
    let m = tiny();
    let s = m.score("david", &["huggins"]);
    assert_eq!(s.n_used, 2);
    assert_near(s.score, expect(&m, &[-0.7]), 1);

    // no ("huggins", "daines") bigram
    let s = m.score("daines", &["huggins"]);
    assert_eq!(s.n_used, 1);
    assert_near(s.score, expect(&m, &[-0.3, -1.5]), 1);
}

#[test]
fn trigram_found_or_backed_off() {
    let m = tiny();
    let s = m.score("is", &["huggins", "david"]);
    assert_eq!(s.n_used, 3);
    assert_near(s.score, expect(&m, &[-0.2]), 1);

    // "daines huggins david" is absent, "huggins david" is not
    let s = m.score("david", &["huggins", "daines"]);
    assert_eq!(s.n_used, 2);
    assert_near(s.score, expect(&m, &[-0.3, -0.7]), 1);

    // both the trigram and the bigram are missing
    let s = m.score("sphinx", &["huggins", "david"]);
    assert_eq!(s.n_used, 1);
    assert_near(s.score, expect(&m, &[-0.25, -0.3, -1.6]), 1);

    // the context bigram itself is missing, so no trigram backoff applies
    let s = m.score("a", &["david", "daines"]);
    assert_eq!(s.n_used, 1);
    assert_near(s.score, expect(&m, &[-0.25, -0.9]), 1);
}

#[test]
fn repeated_trigram_context_hits_the_cache() {
    let m = tiny();
    m.reset_cache();
    let (w1, w2, w3) = (m.wid("david").unwrap(), m.wid("huggins").unwrap(), m.wid("is").unwrap());
    let first = m.tg_score(w1, w2, w3);
    let stats = m.cache_stats().unwrap();
    assert_eq!((stats.hits, stats.misses), (0, 1));

    let second = m.tg_score(w1, w2, w3);
    assert_eq!(first, second);
    let stats = m.cache_stats().unwrap();
    assert_eq!((stats.hits, stats.misses), (1, 1));
    assert_eq!(stats.entries, 1);

    // the entry was used since the last sweep, so the first flush keeps it
    assert_eq!(m.flush_unused_cache(), 0);
    assert_eq!(m.flush_unused_cache(), 1);
    assert_eq!(m.cache_stats().unwrap().entries, 0);
}

#[test]
fn unknown_words_map_to_unk() {
    let m = tiny();
    assert_eq!(m.score("zebra", &[]), m.score("<UNK>", &[]));
    assert_eq!(m.lookup("zebra"), m.unknown_wid());
    // the history still resolves through <UNK>
    assert_eq!(m.history_ids(&["zebra", "david"]), vec![2, 4]);
}

#[test]
fn weighted_scores_invert_to_raw_probabilities() {
    let plain = tiny();
    let mut m = tiny();
    m.apply_weights(9.5, 0.7, 0.5);

    let found: &[(&str, &[&str])] = &[
        ("david", &["<s>"]),
        ("huggins", &["david"]),
        ("is", &["huggins", "david"]),
        ("sphinx", &["a", "is"]),
    ];
    for &(word, history) in found {
        let before = plain.score(word, history);
        let after = m.prob(word, history);
        assert_eq!(before.n_used, after.n_used);
        assert_near(after.score, before.score, 1);
        assert_near(m.score_to_prob(m.score(word, history).score), after.score, 1);
    }

    // unigrams undo the interpolation up to rounding
    for word in ["david", "is", "a"] {
        assert_near(m.prob(word, &[]).score, plain.score(word, &[]).score, 10);
    }
    // <s> is never interpolated
    assert_near(m.prob("<s>", &[]).score, plain.score("<s>", &[]).score, 1);
}

#[test]
fn added_word_becomes_scorable() {
    let mut m = tiny();
    let wid = m.add_word("huggins-daines", 2.0);
    assert_eq!(wid, 9);
    assert_eq!(m.vocab_size(), 10);
    let s = m.score("huggins-daines", &[]);
    assert_eq!(s.n_used, 1);
    // twice the uniform probability over the eight non-<s> words
    assert_near(s.score, m.log_math().log(2.0 / 8.0), 1);
    // backs off through the history word's weight
    let s = m.score("huggins-daines", &["david"]);
    assert_eq!(s.n_used, 1);
    assert_near(s.score, m.log_math().log(2.0 / 8.0) + expect(&m, &[-0.25]), 2);
}
