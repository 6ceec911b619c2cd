// Model sets read from a control file: interpolation, selection and
// membership changes.

use ngramlm_core::{FileType, LanguageModel, LmConfig, LmError, ModelSet, NgramModel};
use std::path::PathBuf;

fn data(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/data").join(name)
}

fn load(name: &str) -> NgramModel {
    let config = LmConfig::default();
    NgramModel::read(&data(name), FileType::Arpa, config.log_math().unwrap(), &config).unwrap()
}

fn control_set() -> ModelSet {
    ModelSet::read_control_file(&data("models.ctl"), &LmConfig::default()).unwrap()
}

#[test]
fn control_file_lists_members_in_order() {
    let set = control_set();
    assert_eq!(set.names(), &["tiny".to_string(), "other".to_string()]);
    assert_eq!(set.current(), None);
    assert_eq!(set.order(), 3);
    let words: Vec<_> = (0..set.vocab_size() as u32).filter_map(|w| set.word(w)).collect();
    assert_eq!(
        words,
        vec!["<UNK>", "</s>", "<s>", "a", "daines", "david", "huggins", "is", "sphinx"]
    );
}

#[test]
fn equal_weights_add_half_of_each() {
    let set = control_set();
    let (tiny, other) = (load("tiny.arpa"), load("other.arpa"));
    let lm = set.log_math();
    let half = lm.log(0.5);

    let t = tiny.score("huggins", &["david"]);
    let o = other.score("huggins", &["david"]);
    let got = set.score("huggins", &["david"]);
    assert_eq!(got.score, lm.add(lm.add(lm.zero(), half + t.score), half + o.score));
    assert_eq!(got.n_used, 2);

    // "is" exists only in the first model and the second has no <UNK>
    let got = set.score("is", &[]);
    let t = tiny.score("is", &[]);
    assert_eq!(got.score, lm.add(lm.zero(), half + t.score));

    // out-of-vocabulary words reach the first model through its <UNK>
    let got = set.score("zebra", &[]);
    let t = tiny.score("<UNK>", &[]);
    assert_eq!(got.score, lm.add(lm.zero(), half + t.score));
}

#[test]
fn selected_member_answers_alone() {
    let mut set = control_set();
    set.select("other").unwrap();
    let other = load("other.arpa");
    for (word, history) in [("sphinx", vec!["huggins"]), ("david", vec!["<s>"]), ("huggins", vec![])] {
        assert_eq!(set.score(word, &history), other.score(word, &history));
    }
    assert_eq!(set.score("is", &[]).n_used, 0);

    match set.select("nonesuch") {
        Err(LmError::UnknownModel(name)) => assert_eq!(name, "nonesuch"),
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
    // a failed selection leaves the previous one in place
    assert_eq!(set.current(), Some("other"));

    set.interp(Some(&[("tiny", 0.9), ("other", 0.1)])).unwrap();
    assert_eq!(set.current(), None);
    assert!((set.weight("tiny").unwrap() - 0.9).abs() < 1e-3);
}

#[test]
fn membership_changes_keep_weights_normalized() {
    let mut set = control_set();
    set.add("four", load("four.arpa"), 0.2).unwrap();
    assert_eq!(set.order(), 4);
    assert!((set.weight("tiny").unwrap() - 0.4).abs() < 1e-3);
    assert!((set.weight("four").unwrap() - 0.2).abs() < 1e-3);
    assert!(set.wid("c").is_some());
    assert!(set.add("four", load("four.arpa"), 0.2).is_err());

    set.select("four").unwrap();
    set.remove("four").unwrap();
    assert_eq!(set.current(), None);
    assert!((set.weight("other").unwrap() - 0.5).abs() < 1e-3);
    assert_eq!(set.wid("c"), None);
}

#[test]
fn weights_and_words_reach_every_member() {
    let mut set = control_set();
    let before = set.score("david", &["<s>"]);
    set.apply_weights(2.0, 1.0, 1.0);
    let after = set.score("david", &["<s>"]);
    assert!(after.score < before.score);
    for name in ["tiny", "other"] {
        assert_eq!(set.member(name).unwrap().weights().lw, 2.0);
    }

    let wid = set.add_word("huggins-daines", 1.0);
    assert_eq!(set.wid("huggins-daines"), Some(wid));
    for name in ["tiny", "other"] {
        assert!(set.member(name).unwrap().wid("huggins-daines").is_some());
    }
    assert_eq!(set.score("huggins-daines", &[]).n_used, 1);
}
