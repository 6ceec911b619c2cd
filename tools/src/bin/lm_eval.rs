use anyhow::{bail, Context, Result};
use clap::Parser;
use ngramlm_core::vocab::{SENTENCE_END, SENTENCE_START};
use ngramlm_core::{FileType, LanguageModel, LmConfig, ModelSet, NgramModel};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

/// Score whitespace-tokenized sentences and report perplexity.
#[derive(Parser)]
struct Args {
    /// Model file (ARPA, DMP or trie).
    #[arg(long, conflicts_with = "lmctl")]
    lm: Option<PathBuf>,

    /// Control file of `path name` lines; the models are interpolated.
    #[arg(long)]
    lmctl: Option<PathBuf>,

    #[arg(long)]
    config: Option<PathBuf>,

    /// Sentences, one per line; standard input when absent.
    #[arg(long)]
    text: Option<PathBuf>,
}

#[derive(Default)]
struct Totals {
    log10: f64,
    words: usize,
    oov: usize,
}

impl Totals {
    fn perplexity(&self) -> f64 {
        if self.words == 0 {
            return f64::NAN;
        }
        10f64.powf(-self.log10 / self.words as f64)
    }
}

/// Score one sentence wrapped in `<s>` ... `</s>`. Words the model cannot
/// score at all are counted as OOV and left out of the total.
fn score_sentence(lm: &dyn LanguageModel, words: &[&str]) -> Totals {
    let context = lm.order().saturating_sub(1);
    let mut seen = vec![SENTENCE_START];
    let mut totals = Totals::default();
    for &w in words.iter().chain(std::iter::once(&SENTENCE_END)) {
        let history: Vec<&str> = seen.iter().rev().take(context).copied().collect();
        let s = lm.score(w, &history);
        if lm.wid(w).is_none() {
            totals.oov += 1;
        }
        if s.n_used > 0 {
            totals.log10 += lm.log_math().log_to_log10(s.score);
            totals.words += 1;
        }
        seen.push(w);
    }
    totals
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => LmConfig::load_toml(path)?,
        None => LmConfig::default(),
    };
    let lm: Box<dyn LanguageModel> = match (&args.lm, &args.lmctl) {
        (Some(path), None) => Box::new(
            NgramModel::read(path, FileType::Auto, config.log_math()?, &config)
                .with_context(|| format!("reading {}", path.display()))?,
        ),
        (None, Some(path)) => Box::new(
            ModelSet::read_control_file(path, &config)
                .with_context(|| format!("reading {}", path.display()))?,
        ),
        _ => bail!("give exactly one of --lm and --lmctl"),
    };

    let input: Box<dyn BufRead> = match &args.text {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    let mut all = Totals::default();
    let mut sentences = 0usize;
    for line in input.lines() {
        let line = line?;
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let t = score_sentence(lm.as_ref(), &words);
        println!("{:.4}\t{:.2}\t{}", t.log10, t.perplexity(), words.join(" "));
        all.log10 += t.log10;
        all.words += t.words;
        all.oov += t.oov;
        sentences += 1;
    }

    println!(
        "{} sentences, {} words scored, {} OOV, log10 prob {:.4}, perplexity {:.2}",
        sentences,
        all.words,
        all.oov,
        all.log10,
        all.perplexity()
    );
    Ok(())
}
