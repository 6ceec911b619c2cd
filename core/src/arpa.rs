//! ARPA text format.
//!
//! ```text
//! \data\
//! ngram 1=<count>
//! ngram 2=<count>
//!
//! \1-grams:
//! <log10 prob> <w1> [<log10 backoff>]
//!
//! \2-grams:
//! <log10 prob> <w1> <w2> [<log10 backoff>]
//!
//! \end\
//! ```
//!
//! Anything before `\data\` is commentary. Word ids follow the order of the
//! unigram section.
use crate::error::{LmError, Result};
use crate::ngram_raw::{RawNgram, RawNgramSet};
use crate::pio::{self, Output};
use crate::vocab::{Vocabulary, WordId};
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing::{info, warn};

/// Read an ARPA file (gzip-compressed if the name ends in `.gz`).
pub fn read(path: &Path) -> Result<RawNgramSet> {
    let (input, _) = pio::open_input(path)?;
    let raw = read_raw(input).map_err(|e| e.with_path(path))?;
    info!("{}: order {}, counts {:?}", path.display(), raw.order, raw.counts());
    Ok(raw)
}

/// Line source with one line of push-back.
struct Lines<R> {
    inner: R,
    buf: String,
    line_no: usize,
    pushed_back: bool,
}

impl<R: BufRead> Lines<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buf: String::new(),
            line_no: 0,
            pushed_back: false,
        }
    }

    /// Move to the next line; false at end of input.
    fn advance(&mut self) -> Result<bool> {
        if self.pushed_back {
            self.pushed_back = false;
            return Ok(true);
        }
        self.buf.clear();
        if self.inner.read_line(&mut self.buf)? == 0 {
            return Ok(false);
        }
        self.line_no += 1;
        Ok(true)
    }

    /// Next line that is not blank.
    fn advance_nonblank(&mut self) -> Result<bool> {
        while self.advance()? {
            if !self.current().is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn current(&self) -> &str {
        self.buf.trim()
    }

    fn push_back(&mut self) {
        self.pushed_back = true;
    }

    fn error(&self, msg: impl Into<String>) -> LmError {
        LmError::format_at(self.line_no, msg)
    }
}

fn parse_counts<R: BufRead>(lines: &mut Lines<R>) -> Result<Vec<usize>> {
    loop {
        if !lines.advance()? {
            return Err(LmError::format("no \\data\\ mark in input"));
        }
        if lines.current() == "\\data\\" {
            break;
        }
    }

    let mut counts = Vec::new();
    while lines.advance()? {
        let line = lines.current();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('\\') {
            lines.push_back();
            break;
        }
        let spec = line
            .strip_prefix("ngram")
            .ok_or_else(|| lines.error(format!("unexpected line in \\data\\: {}", line)))?;
        let (order, count) = spec
            .trim()
            .split_once('=')
            .and_then(|(o, c)| Some((o.trim().parse::<usize>().ok()?, c.trim().parse::<usize>().ok()?)))
            .ok_or_else(|| lines.error(format!("bad n-gram count line: {}", line)))?;
        if order != counts.len() + 1 {
            return Err(lines.error(format!(
                "n-gram orders must start at 1 and be consecutive, found {} after {}",
                order,
                counts.len()
            )));
        }
        counts.push(count);
    }
    if counts.is_empty() {
        return Err(lines.error("no n-gram counts after \\data\\"));
    }
    Ok(counts)
}

/// Parse ARPA text into raw lists. Higher-order sections are kept in file
/// order.
pub fn read_raw<R: BufRead>(input: R) -> Result<RawNgramSet> {
    let mut lines = Lines::new(input);
    let declared = parse_counts(&mut lines)?;
    let order = declared.len();

    let mut vocab = Vocabulary::with_capacity(declared[0]);
    let mut grams: Vec<Vec<RawNgram>> = Vec::with_capacity(order);
    let mut ids: Vec<WordId> = Vec::with_capacity(order);

    for (k, &expected) in declared.iter().enumerate() {
        let n = k + 1;
        let header = format!("\\{}-grams:", n);
        if !lines.advance_nonblank()? || lines.current() != header {
            return Err(lines.error(format!("expected {}", header)));
        }

        let has_backoff = n < order;
        let mut list = Vec::with_capacity(expected);
        let mut seen = 0usize;
        while lines.advance()? {
            let line = lines.current();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('\\') {
                lines.push_back();
                break;
            }
            if seen == expected {
                return Err(lines.error(format!(
                    "more {}-grams than the {} declared",
                    n, expected
                )));
            }
            seen += 1;

            let mut fields = line.split_whitespace();
            let prob = fields
                .next()
                .and_then(|f| f.parse::<f32>().ok())
                .ok_or_else(|| lines.error(format!("bad probability in {}-gram line", n)))?;
            let words: Vec<&str> = fields.by_ref().take(n).collect();
            if words.len() != n {
                return Err(lines.error(format!("{}-gram line has too few words", n)));
            }
            let backoff = match fields.next() {
                Some(f) => Some(
                    f.parse::<f32>()
                        .map_err(|_| lines.error(format!("bad backoff weight '{}'", f)))?,
                ),
                None => None,
            };
            let backoff = has_backoff.then(|| backoff.unwrap_or(0.0));

            if n == 1 {
                match vocab.push(words[0]) {
                    Ok(id) => list.push(RawNgram::new(vec![id], prob, backoff)),
                    Err(_) => warn!(
                        "line {}: duplicate unigram '{}', keeping the first",
                        lines.line_no, words[0]
                    ),
                }
                continue;
            }

            ids.clear();
            for w in &words {
                match vocab.id(w) {
                    Some(id) => ids.push(id),
                    None => break,
                }
            }
            if ids.len() != n {
                warn!(
                    "line {}: unknown word in {}-gram '{}', skipped",
                    lines.line_no,
                    n,
                    words.join(" ")
                );
                continue;
            }
            list.push(RawNgram::new(ids.clone(), prob, backoff));
        }

        if seen < expected {
            warn!(
                "{} {}-grams declared but only {} present, count adjusted",
                expected, n, seen
            );
        }
        grams.push(list);
    }

    if !lines.advance_nonblank()? || lines.current() != "\\end\\" {
        return Err(lines.error("missing \\end\\ mark"));
    }

    Ok(RawNgramSet {
        order,
        words: vocab.words().to_vec(),
        grams,
    })
}

/// Write raw lists as ARPA text (gzip-compressed for `.gz` paths).
pub fn write(raw: &RawNgramSet, path: &Path) -> Result<()> {
    let mut out = Output::create(path)?;
    write_to(raw, &mut out)
        .and_then(|_| out.finish())
        .map_err(|e| LmError::from(e).with_path(path))
}

pub fn write_to<W: Write>(raw: &RawNgramSet, w: &mut W) -> io::Result<()> {
    writeln!(w, "This is an ARPA-format language model file, written by ngramlm.")?;
    writeln!(w)?;
    writeln!(w, "\\data\\")?;
    for (k, list) in raw.grams.iter().enumerate() {
        writeln!(w, "ngram {}={}", k + 1, list.len())?;
    }
    for (k, list) in raw.grams.iter().enumerate() {
        writeln!(w)?;
        writeln!(w, "\\{}-grams:", k + 1)?;
        let has_backoff = k + 1 < raw.order;
        for g in list {
            write!(w, "{:.4}", g.prob())?;
            for &id in &g.words {
                write!(w, " {}", raw.words[id as usize])?;
            }
            if has_backoff {
                write!(w, " {:.4}", g.backoff())?;
            }
            writeln!(w)?;
        }
    }
    writeln!(w)?;
    writeln!(w, "\\end\\")
}
