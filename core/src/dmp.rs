//! Legacy "Darpa Trigram LM" dump format (DMP).
//!
//! The file is a straight dump of the classic model's tables:
//!
//! ```text
//! i32 17, "Darpa Trigram LM\0"
//! i32 len, file name
//! i32 version               (<= 0: i32 timestamp, then {i32 len, bytes}* until len == 0,
//!                            then i32 unigram count; > 0: the unigram count itself)
//! i32 bigram count, i32 trigram count
//! (n1 + 1) x {i32 mapid, f32 prob, f32 backoff, i32 first bigram}
//! (n2 + 1) x {u16 wid, u16 prob2, u16 bo_wt2, u16 trigram offset}   sentinel even if n2 == 0
//! n3 x {u16 wid, u16 prob3}                                         if n3 > 0
//! i32 len, f32 prob2[len]
//! i32 len, f32 bo_wt2[len]; i32 len, f32 prob3[len]; i32 len, i32 tseg_base[len]   if n3 > 0
//! i32 len, NUL-terminated words
//! ```
//!
//! All fields are in the writer's byte order; readers detect a foreign order
//! from the first length field. Floats are base-10 logs.
use crate::error::{LmError, Result};
use crate::lm3g::{Bigram, Lm3g, Trigram, Unigram, BG_SEG_SZ, LOG_BG_SEG_SZ};
use crate::logmath::LogMath;
use crate::model::Weights;
use crate::pio::{self, BinReader, Output, Skip};
use crate::storage::{Record, RecordTable, Storage};
use crate::vocab::{Vocabulary, WordId};
use byteorder::{ByteOrder, WriteBytesExt};
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub const DARPA_HDR: &str = "Darpa Trigram LM";

/// Largest vocabulary whose ids fit the 16-bit word fields.
pub const MAX_DMP_WORDS: usize = 65535;

/// Read a DMP file into a vocabulary and a classic model.
///
/// With `use_mmap` set, the bigram and trigram arrays alias a memory map of
/// the file when it is uncompressed, in native byte order and 4-byte aligned.
pub fn read(path: &Path, lmath: &LogMath, use_mmap: bool) -> Result<(Vocabulary, Lm3g)> {
    if !use_mmap || pio::is_gzip(path) {
        let (input, _) = pio::open_input(path)?;
        let mut r = BinReader::new(input);
        return read_from(&mut r, lmath, |_| None).map_err(|e| e.with_path(path));
    }
    // plain file: mapped tables are skipped by seeking
    let file = File::open(path).map_err(|e| LmError::from(e).with_path(path))?;
    let mut r = BinReader::new(BufReader::new(file));
    let map_file = |offset: u64| -> Option<(File, u64)> {
        if offset % 4 != 0 {
            return None;
        }
        File::open(path).ok().map(|f| (f, offset))
    };
    read_from(&mut r, lmath, map_file).map_err(|e| e.with_path(path))
}

fn bad(msg: impl Into<String>) -> LmError {
    LmError::format(msg)
}

fn read_count<R: Read>(r: &mut BinReader<R>, what: &str) -> Result<usize> {
    let n = r.read_i32()?;
    if n < 0 {
        return Err(bad(format!("negative {} count {}", what, n)));
    }
    Ok(n as usize)
}

fn read_from<R, M>(
    r: &mut BinReader<R>,
    lmath: &LogMath,
    mut map_file: M,
) -> Result<(Vocabulary, Lm3g)>
where
    R: Skip,
    M: FnMut(u64) -> Option<(File, u64)>,
{
    // --- header ---
    let hdr_len = DARPA_HDR.len() as i32 + 1;
    let k = r.read_i32()?;
    if k != hdr_len {
        if k.swap_bytes() == hdr_len {
            r.set_swap(true);
        } else {
            return Err(bad("wrong magic header size, not a DMP file"));
        }
    }
    let magic = r.read_bytes(hdr_len as usize)?;
    if &magic[..DARPA_HDR.len()] != DARPA_HDR.as_bytes() || magic[DARPA_HDR.len()] != 0 {
        return Err(bad("wrong magic header, not a DMP file"));
    }

    let name_len = read_count(r, "file name")?;
    r.skip(name_len as u64)?;

    let version = r.read_i32()?;
    let n_unigram = if version <= 0 {
        let _timestamp = r.read_i32()?;
        loop {
            let k = read_count(r, "format description")?;
            if k == 0 {
                break;
            }
            r.skip(k as u64)?;
        }
        read_count(r, "unigram")?
    } else {
        version as usize
    };
    let n_bigram = read_count(r, "bigram")?;
    let n_trigram = read_count(r, "trigram")?;
    if n_unigram == 0 {
        return Err(bad("model has no unigrams"));
    }
    if n_unigram > MAX_DMP_WORDS {
        return Err(bad(format!("{} unigrams exceed 16-bit word ids", n_unigram)));
    }
    let order = if n_trigram > 0 {
        3
    } else if n_bigram > 0 {
        2
    } else {
        1
    };

    // --- unigrams ---
    let mut unigrams = Vec::with_capacity(n_unigram + 1);
    let mut repaired = 0usize;
    for i in 0..=n_unigram {
        let mapid = r.read_i32()?;
        let prob1 = r.read_f32()?;
        let bo_wt1 = r.read_f32()?;
        let bigrams = r.read_i32()?;
        if i < n_unigram && mapid != i as i32 {
            repaired += 1;
        }
        if bigrams < 0 || bigrams as usize > n_bigram {
            return Err(bad(format!("unigram {} has bigram index {} out of range", i, bigrams)));
        }
        unigrams.push(Unigram {
            prob1: lmath.log10_to_log(prob1 as f64),
            bo_wt1: lmath.log10_to_log(bo_wt1 as f64),
            bigrams: bigrams as u32,
        });
    }
    if repaired > 0 {
        warn!("corrected {} corrupted unigram map ids", repaired);
    }
    if unigrams.windows(2).any(|w| w[0].bigrams > w[1].bigrams) {
        return Err(bad("unigram bigram pointers are not monotonic"));
    }

    // --- bigram and trigram records ---
    let swapped = r.swapped();
    let mut shared_map: Option<Arc<Mmap>> = None;
    let mut read_records = |r: &mut BinReader<R>, count: usize, size: usize| -> Result<Option<Storage>> {
        let offset = r.position();
        if !swapped {
            if let Some((file, offset)) = map_file(offset) {
                if shared_map.is_none() {
                    // SAFETY: the map is read-only and model files are not
                    // expected to change while loaded.
                    let map = unsafe { Mmap::map(&file) }?;
                    shared_map = Some(Arc::new(map));
                }
                if let Some(map) = &shared_map {
                    let start = offset as usize;
                    let end = start + count * size;
                    if end > map.len() {
                        return Err(bad("file truncated inside record tables"));
                    }
                    r.skip((count * size) as u64)?;
                    return Ok(Some(Storage::mapped(map, start..end)));
                }
            }
        }
        Ok(None)
    };

    let bigrams: RecordTable<Bigram> = match read_records(r, n_bigram + 1, Bigram::SIZE)? {
        Some(s) => RecordTable::mapped(s),
        None => {
            let mut v = Vec::with_capacity(n_bigram + 1);
            for _ in 0..=n_bigram {
                v.push(Bigram {
                    wid: r.read_u16()? as WordId,
                    prob2: r.read_u16()?,
                    bo_wt2: r.read_u16()?,
                    trigrams: r.read_u16()?,
                });
            }
            RecordTable::Owned(v)
        }
    };

    let trigrams: RecordTable<Trigram> = if n_trigram > 0 {
        match read_records(r, n_trigram, Trigram::SIZE)? {
            Some(s) => RecordTable::mapped(s),
            None => {
                let mut v = Vec::with_capacity(n_trigram);
                for _ in 0..n_trigram {
                    v.push(Trigram {
                        wid: r.read_u16()? as WordId,
                        prob3: r.read_u16()?,
                    });
                }
                RecordTable::Owned(v)
            }
        }
    } else {
        RecordTable::default()
    };

    // --- pools ---
    let to_log = |v: Vec<f32>| -> Vec<i32> {
        v.into_iter().map(|x| lmath.log10_to_log(x as f64)).collect()
    };
    let prob2 = to_log(r.read_f32_table()?);
    let (bo_wt2, prob3, tseg_base) = if n_trigram > 0 {
        let bo_wt2 = to_log(r.read_f32_table()?);
        let prob3 = to_log(r.read_f32_table()?);
        let n_seg = read_count(r, "trigram segment")?;
        let mut tseg_base = Vec::with_capacity(n_seg);
        for _ in 0..n_seg {
            let v = r.read_i32()?;
            if v < 0 || v as usize > n_trigram {
                return Err(bad(format!("trigram segment base {} out of range", v)));
            }
            tseg_base.push(v as u32);
        }
        (bo_wt2, prob3, tseg_base)
    } else {
        (Vec::new(), Vec::new(), Vec::new())
    };

    // --- words ---
    let blob_len = read_count(r, "word string")?;
    let blob = r.read_bytes(blob_len)?;
    let mut vocab = Vocabulary::with_capacity(n_unigram);
    let mut n_found = 0;
    for piece in blob.split(|&b| b == 0) {
        if n_found >= n_unigram {
            break;
        }
        let word = String::from_utf8_lossy(piece);
        if vocab.push(&word).is_err() {
            warn!("duplicate word in dump file: {}", word);
            vocab.push_shadowed(&word);
        }
        n_found += 1;
    }
    let terminated = blob.iter().filter(|&&b| b == 0).count();
    if terminated != n_unigram {
        return Err(bad(format!(
            "word string table has {} words, header says {}",
            terminated, n_unigram
        )));
    }

    let lm = Lm3g::from_parts(order, unigrams, bigrams, trigrams, prob2, bo_wt2, prob3, tseg_base);
    validate(&lm, n_unigram)?;
    info!(
        "read DMP model: {} unigrams, {} bigrams, {} trigrams{}",
        n_unigram,
        n_bigram,
        n_trigram,
        if lm.is_mapped() { " (memory-mapped)" } else { "" }
    );
    Ok((vocab, lm))
}

/// Reject tables whose indices would point outside their pools.
fn validate(lm: &Lm3g, n_words: usize) -> Result<()> {
    let n_bg = lm.bigrams.len().saturating_sub(1);
    let n_tg = lm.trigrams.len();
    if lm.order >= 3 && (n_bg >> LOG_BG_SEG_SZ) >= lm.tseg_base.len() {
        return Err(bad(format!(
            "{} trigram segments cannot cover {} bigrams",
            lm.tseg_base.len(),
            n_bg
        )));
    }
    for b in 0..n_bg {
        let bg = lm.bigrams.get(b);
        if bg.wid as usize >= n_words || bg.prob2 as usize >= lm.prob2.len() {
            return Err(bad(format!("bigram {} is out of range", b)));
        }
        if lm.order >= 3 && bg.bo_wt2 as usize >= lm.bo_wt2.len() {
            return Err(bad(format!("bigram {} backoff index is out of range", b)));
        }
    }
    if lm.order >= 3 {
        let mut prev = 0u32;
        for b in 0..=n_bg {
            let first = lm.tseg_base[b >> LOG_BG_SEG_SZ] + lm.bigrams.get(b).trigrams as u32;
            if first < prev || first as usize > n_tg {
                return Err(bad(format!("trigram range of bigram {} is out of range", b)));
            }
            prev = first;
        }
        for t in 0..n_tg {
            let tg = lm.trigrams.get(t);
            if tg.wid as usize >= n_words || tg.prob3 as usize >= lm.prob3.len() {
                return Err(bad(format!("trigram {} is out of range", t)));
            }
        }
    }
    Ok(())
}

// --- Writing ---

/// Write `lm` to `path` in byte order `E`. Values are written unweighted.
pub fn write<E: ByteOrder>(
    lm: &Lm3g,
    vocab: &Vocabulary,
    lmath: &LogMath,
    weights: &Weights,
    start: Option<WordId>,
    path: &Path,
) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut out = Output::create(path)?;
    write_to::<E, _>(lm, vocab, lmath, weights, start, &name, &mut out)
        .and_then(|_| out.finish().map_err(LmError::from))
        .map_err(|e| e.with_path(path))
}

fn write_str<E: ByteOrder, W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_i32::<E>(s.len() as i32 + 1)?;
    w.write_all(s.as_bytes())?;
    w.write_u8(0)
}

/// File-name echo, NUL-padded so that the record arrays after the header
/// start 4-byte aligned and can be memory-mapped.
fn write_name<E: ByteOrder, W: Write>(w: &mut W, name: &str) -> io::Result<()> {
    let header_bytes = DARPA_HDR.len() + 1;
    let mut len = name.len() + 1;
    while (header_bytes + len) % 4 != 0 {
        len += 1;
    }
    w.write_i32::<E>(len as i32)?;
    w.write_all(name.as_bytes())?;
    w.write_all(&vec![0u8; len - name.len()])
}

fn write_f32_table<E: ByteOrder, W: Write>(
    w: &mut W,
    lmath: &LogMath,
    values: impl ExactSizeIterator<Item = i32>,
) -> io::Result<()> {
    w.write_i32::<E>(values.len() as i32)?;
    for v in values {
        w.write_f32::<E>(lmath.log_to_log10(v) as f32)?;
    }
    Ok(())
}

fn write_to<E: ByteOrder, W: Write>(
    lm: &Lm3g,
    vocab: &Vocabulary,
    lmath: &LogMath,
    weights: &Weights,
    start: Option<WordId>,
    name: &str,
    w: &mut W,
) -> Result<()> {
    let n_words = lm.n_words();
    if n_words > MAX_DMP_WORDS {
        return Err(LmError::Unsupported(format!(
            "DMP files hold at most {} words, model has {}",
            MAX_DMP_WORDS, n_words
        )));
    }
    let n_bg = lm.bigrams.len().saturating_sub(1);
    let n_tg = lm.trigrams.len();

    write_str::<E, _>(w, DARPA_HDR)?;
    write_name::<E, _>(w, name)?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i32)
        .unwrap_or(0);
    w.write_i32::<E>(-1)?;
    w.write_i32::<E>(timestamp)?;
    w.write_i32::<E>(0)?;
    w.write_i32::<E>(n_words as i32)?;
    w.write_i32::<E>(n_bg as i32)?;
    w.write_i32::<E>(n_tg as i32)?;

    for (i, u) in lm.unigrams.iter().enumerate() {
        let (prob, bo) = if i < n_words {
            let is_start = start == Some(i as WordId);
            (
                lm.raw_unigram(i as WordId, weights, lmath, is_start),
                weights.unscale_backoff(u.bo_wt1),
            )
        } else {
            (u.prob1, u.bo_wt1)
        };
        w.write_i32::<E>(i as i32)?;
        w.write_f32::<E>(lmath.log_to_log10(prob) as f32)?;
        w.write_f32::<E>(lmath.log_to_log10(bo) as f32)?;
        w.write_i32::<E>(u.bigrams as i32)?;
    }

    if lm.bigrams.is_empty() {
        w.write_all(&[0u8; Bigram::SIZE])?;
    }
    for bg in lm.bigrams.iter() {
        w.write_u16::<E>(bg.wid as u16)?;
        w.write_u16::<E>(bg.prob2)?;
        w.write_u16::<E>(bg.bo_wt2)?;
        w.write_u16::<E>(bg.trigrams)?;
    }
    for tg in lm.trigrams.iter() {
        w.write_u16::<E>(tg.wid as u16)?;
        w.write_u16::<E>(tg.prob3)?;
    }

    write_f32_table::<E, _>(w, lmath, lm.prob2.iter().map(|&p| weights.unapply(p)))?;
    if n_tg > 0 {
        write_f32_table::<E, _>(
            w,
            lmath,
            lm.bo_wt2.iter().map(|&b| weights.unscale_backoff(b)),
        )?;
        write_f32_table::<E, _>(w, lmath, lm.prob3.iter().map(|&p| weights.unapply(p)))?;
        let n_seg = (n_bg + 1) / BG_SEG_SZ + 1;
        w.write_i32::<E>(n_seg as i32)?;
        for s in 0..n_seg {
            let base = lm.tseg_base.get(s).copied().unwrap_or(n_tg as u32);
            w.write_i32::<E>(base as i32)?;
        }
    }

    let blob_len: usize = vocab.words().iter().map(|s| s.len() + 1).sum();
    w.write_i32::<E>(blob_len as i32)?;
    for word in vocab.words() {
        w.write_all(word.as_bytes())?;
        w.write_u8(0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ngram_raw::{RawNgram, RawNgramSet};
    use byteorder::{BigEndian, LittleEndian, NativeEndian};

    fn small() -> (Vocabulary, Lm3g, LogMath) {
        let lmath = LogMath::new(1.0001, 4, 0).unwrap();
        let ng = |w: &[u32], p: f32, bo: Option<f32>| RawNgram::new(w.to_vec(), p, bo);
        let set = RawNgramSet {
            order: 3,
            words: ["</s>", "<s>", "one", "two"].iter().map(|s| s.to_string()).collect(),
            grams: vec![
                vec![
                    ng(&[0], -1.1, Some(0.0)),
                    ng(&[1], -99.0, Some(-0.4)),
                    ng(&[2], -1.3, Some(-0.2)),
                    ng(&[3], -1.5, Some(-0.3)),
                ],
                vec![
                    ng(&[1, 2], -0.5, Some(-0.1)),
                    ng(&[2, 3], -0.25, Some(-0.15)),
                    ng(&[3, 0], -0.3, Some(0.0)),
                ],
                vec![ng(&[1, 2, 3], -0.2, None), ng(&[2, 3, 0], -0.1, None)],
            ],
        };
        let mut vocab = Vocabulary::new();
        for w in &set.words {
            vocab.push(w).unwrap();
        }
        let lm = Lm3g::from_raw(&set, &lmath).unwrap();
        (vocab, lm, lmath)
    }

    fn encode<E: ByteOrder>(vocab: &Vocabulary, lm: &Lm3g, lmath: &LogMath) -> Vec<u8> {
        let mut buf = Vec::new();
        write_to::<E, _>(lm, vocab, lmath, &Weights::identity(lmath, vocab.len()), Some(1), "t.dmp", &mut buf)
            .unwrap();
        buf
    }

    fn decode(buf: &[u8], lmath: &LogMath) -> Result<(Vocabulary, Lm3g)> {
        let mut r = BinReader::new(buf);
        read_from(&mut r, lmath, |_| None)
    }

    fn all_scores(lm: &Lm3g) -> Vec<i32> {
        let mut out = Vec::new();
        for a in 0..4 {
            for b in 0..4 {
                out.push(lm.bg_score(a, b).score);
                for c in 0..4 {
                    out.push(lm.tg_score(a, b, c).score);
                }
            }
        }
        out
    }

    #[test]
    fn both_byte_orders_give_identical_scores() {
        let (vocab, lm, lmath) = small();
        let little = decode(&encode::<LittleEndian>(&vocab, &lm, &lmath), &lmath).unwrap();
        let big = decode(&encode::<BigEndian>(&vocab, &lm, &lmath), &lmath).unwrap();
        assert_eq!(little.0.words(), vocab.words());
        assert_eq!(big.0.words(), vocab.words());
        assert_eq!(all_scores(&little.1), all_scores(&lm));
        assert_eq!(all_scores(&big.1), all_scores(&lm));
        assert_eq!(big.1.counts(), vec![4, 3, 2]);
    }

    #[test]
    fn positive_version_is_the_unigram_count() {
        let (vocab, lm, lmath) = small();
        let legacy = encode::<NativeEndian>(&vocab, &lm, &lmath);
        // drop version, timestamp and description terminator so that the
        // unigram count lands in the version slot
        let name_len = NativeEndian::read_i32(&legacy[21..25]) as usize;
        let name_end = 25 + name_len;
        let mut buf = legacy[..name_end].to_vec();
        buf.extend_from_slice(&legacy[name_end + 12..]);
        let (v, back) = decode(&buf, &lmath).unwrap();
        assert_eq!(v.len(), 4);
        assert_eq!(all_scores(&back), all_scores(&lm));
    }

    /// A unigram-only dump still carries the sentinel bigram record.
    fn unigram_only_dump(words: &[&str], probs: &[f32]) -> Vec<u8> {
        let mut b = Vec::new();
        write_str::<NativeEndian, _>(&mut b, DARPA_HDR).unwrap();
        b.write_i32::<NativeEndian>(7).unwrap();
        b.extend_from_slice(b"t.dmp\0\0");
        for v in [-1, 0, 0, words.len() as i32, 0, 0] {
            b.write_i32::<NativeEndian>(v).unwrap();
        }
        for (i, &p) in probs.iter().chain(std::iter::once(&-99.0)).enumerate() {
            b.write_i32::<NativeEndian>(i as i32).unwrap();
            b.write_f32::<NativeEndian>(p).unwrap();
            b.write_f32::<NativeEndian>(0.0).unwrap();
            b.write_i32::<NativeEndian>(0).unwrap();
        }
        b.extend_from_slice(&[0u8; 8]);
        b.write_i32::<NativeEndian>(0).unwrap();
        let blob: Vec<u8> = words.iter().flat_map(|w| w.bytes().chain(std::iter::once(0))).collect();
        b.write_i32::<NativeEndian>(blob.len() as i32).unwrap();
        b.extend_from_slice(&blob);
        b
    }

    #[test]
    fn unigram_only_dump_keeps_the_bigram_sentinel() {
        let lmath = LogMath::new(1.0001, 4, 0).unwrap();
        let words = ["</s>", "<s>", "one"];
        let dump = unigram_only_dump(&words, &[-0.5, -99.0, -0.25]);
        let (vocab, lm) = decode(&dump, &lmath).unwrap();
        assert_eq!(vocab.words(), &words.map(String::from)[..]);
        assert_eq!(lm.counts(), vec![3]);
        assert_eq!(lm.bg_score(0, 2).score, lmath.log10_to_log(-0.25));
        assert_eq!(lm.bg_score(2, 0).score, lmath.log10_to_log(-0.5));

        // the writer emits the same layout
        let again = encode::<NativeEndian>(&vocab, &lm, &lmath);
        assert_eq!(again.len(), dump.len());
        let sentinel = dump.len() - 4 - 4 - 13 - 8;
        assert_eq!(&again[sentinel..sentinel + 12], &[0u8; 12]);
        let (back, lm2) = decode(&again, &lmath).unwrap();
        assert_eq!(back.words(), vocab.words());
        assert_eq!(lm2.bg_score(0, 2), lm.bg_score(0, 2));
    }

    #[test]
    fn bad_magic_and_truncation_fail() {
        let (vocab, lm, lmath) = small();
        let mut buf = encode::<NativeEndian>(&vocab, &lm, &lmath);
        let err = decode(&buf[..buf.len() - 3], &lmath).unwrap_err();
        assert!(matches!(err, LmError::Io { .. }));
        buf[6] = b'X';
        assert!(decode(&buf, &lmath).unwrap_err().is_format());
        assert!(decode(b"junkjunkjunk", &lmath).unwrap_err().is_format());
    }

    #[test]
    fn mapped_tables_match_copied_tables() {
        let (vocab, lm, lmath) = small();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.dmp");
        write::<NativeEndian>(&lm, &vocab, &lmath, &Weights::identity(&lmath, 4), Some(1), &path)
            .unwrap();

        let (_, copied) = read(&path, &lmath, false).unwrap();
        assert!(!copied.is_mapped());
        let (_, mapped) = read(&path, &lmath, true).unwrap();
        assert!(mapped.is_mapped());
        assert_eq!(all_scores(&mapped), all_scores(&copied));
    }
}
