use anyhow::{Context, Result};
use clap::Parser;
use ngramlm_core::{FileType, LanguageModel, LmConfig, NgramModel, QuantType};
use std::path::PathBuf;

/// Convert a language model between ARPA, DMP and trie formats.
#[derive(Parser)]
struct Args {
    #[arg(short, long)]
    input: PathBuf,

    #[arg(short, long)]
    output: PathBuf,

    /// Input format: auto, arpa, dmp or bin.
    #[arg(long, default_value = "auto")]
    ifmt: FileType,

    /// Output format; auto picks it from the output extension.
    #[arg(long, default_value = "auto")]
    ofmt: FileType,

    /// TOML file with log base, weights and quantization settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Quantize trie output to this many bits (0 keeps floats).
    #[arg(long)]
    quant_bits: Option<u8>,

    /// Memory-map binary input.
    #[arg(long)]
    mmap: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => LmConfig::load_toml(path)?,
        None => LmConfig {
            mmap: false,
            ..LmConfig::default()
        },
    };
    if args.mmap {
        config.mmap = true;
    }
    if args.quant_bits.is_some() {
        config.quant_bits = args.quant_bits;
    }

    let lmath = config.log_math()?;
    let model = NgramModel::read(&args.input, args.ifmt, lmath, &config)
        .with_context(|| format!("reading {}", args.input.display()))?;
    println!(
        "Read {} model of order {} from {} (counts {:?})",
        model.file_type(),
        model.order(),
        args.input.display(),
        model.counts()
    );

    let ofmt = match args.ofmt {
        FileType::Auto => FileType::from_path(&args.output),
        t => t,
    };
    let quant = config.quant_type()?;
    let written = if ofmt == FileType::Bin && quant != QuantType::None {
        model.to_trie(quant)?.write(&args.output, ofmt)
    } else {
        model.write(&args.output, ofmt)
    };
    written.with_context(|| format!("writing {}", args.output.display()))?;

    println!("Wrote {} model to {}", ofmt, args.output.display());
    Ok(())
}
