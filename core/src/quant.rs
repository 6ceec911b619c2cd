/*!
Weight quantization for the compact trie.

Each middle order gets two codebooks (probabilities and backoff weights) and
the longest order gets one. A codebook is trained by sorting the raw values
and cutting them into `2^bits` equal-count bins; the bin mean becomes the
center. Encoding is a nearest-center binary search, decoding a table lookup.

`QuantType::None` skips all of that and stores the raw `f32` bit patterns.
*/
use crate::error::{LmError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    /// Unquantized 32-bit floats.
    None,
    /// `2^bits` codes per codebook, 1 <= bits <= 16.
    Bits(u8),
}

impl Default for QuantType {
    fn default() -> Self {
        QuantType::Bits(16)
    }
}

impl QuantType {
    pub fn from_bits(bits: Option<u8>) -> Result<Self> {
        match bits {
            None | Some(0) => Ok(QuantType::None),
            Some(b) if b <= 16 => Ok(QuantType::Bits(b)),
            Some(b) => Err(LmError::Config(format!(
                "quantization uses at most 16 bits, got {}",
                b
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quantizer {
    kind: QuantType,
    /// (prob centers, backoff centers) per middle order.
    middle: Vec<(Vec<f32>, Vec<f32>)>,
    longest: Vec<f32>,
}

/// Equal-count binning; each center is the mean of its bin.
fn make_bins(mut values: Vec<f32>, n_bins: usize) -> Vec<f32> {
    values.sort_by(|a, b| a.total_cmp(b));
    let mut centers = Vec::with_capacity(n_bins);
    let mut start = 0usize;
    for i in 0..n_bins {
        let finish = values.len() * (i + 1) / n_bins;
        let center = if finish == start {
            // empty bin, repeat the previous center
            centers
                .last()
                .copied()
                .unwrap_or_else(|| values.first().copied().unwrap_or(0.0))
        } else {
            let sum: f64 = values[start..finish].iter().map(|&v| v as f64).sum();
            (sum / (finish - start) as f64) as f32
        };
        centers.push(center);
        start = finish;
    }
    centers
}

#[inline]
fn nearest(centers: &[f32], v: f32) -> u64 {
    let i = centers.partition_point(|&c| c < v);
    if i == 0 {
        return 0;
    }
    if i == centers.len() {
        return (centers.len() - 1) as u64;
    }
    if (v - centers[i - 1]) <= (centers[i] - v) {
        (i - 1) as u64
    } else {
        i as u64
    }
}

impl Quantizer {
    /// Train codebooks. `middle` holds `(probs, backoffs)` for each middle
    /// order in increasing order; `longest` the top order's probabilities.
    pub fn train(kind: QuantType, middle: Vec<(Vec<f32>, Vec<f32>)>, longest: Vec<f32>) -> Self {
        match kind {
            QuantType::None => Quantizer {
                kind,
                middle: Vec::new(),
                longest: Vec::new(),
            },
            QuantType::Bits(bits) => {
                let n = 1usize << bits;
                Quantizer {
                    kind,
                    middle: middle
                        .into_iter()
                        .map(|(p, b)| (make_bins(p, n), make_bins(b, n)))
                        .collect(),
                    longest: make_bins(longest, n),
                }
            }
        }
    }

    pub fn kind(&self) -> QuantType {
        self.kind
    }

    /// Number of middle orders with codebooks.
    pub fn middle_levels(&self) -> usize {
        self.middle.len()
    }

    /// Width of one probability or backoff code.
    pub fn code_bits(&self) -> u8 {
        match self.kind {
            QuantType::None => 32,
            QuantType::Bits(b) => b,
        }
    }

    /// Bits per middle entry for the weights (probability then backoff).
    pub fn middle_bits(&self) -> u8 {
        2 * self.code_bits()
    }

    pub fn longest_bits(&self) -> u8 {
        self.code_bits()
    }

    pub fn encode_middle(&self, level: usize, prob: f32, bo: f32) -> (u64, u64) {
        match self.kind {
            QuantType::None => (prob.to_bits() as u64, bo.to_bits() as u64),
            QuantType::Bits(_) => {
                let (p, b) = &self.middle[level];
                (nearest(p, prob), nearest(b, bo))
            }
        }
    }

    #[inline]
    pub fn decode_middle(&self, level: usize, prob: u64, bo: u64) -> (f32, f32) {
        match self.kind {
            QuantType::None => (f32::from_bits(prob as u32), f32::from_bits(bo as u32)),
            QuantType::Bits(_) => {
                let (p, b) = &self.middle[level];
                (p[prob as usize], b[bo as usize])
            }
        }
    }

    pub fn encode_longest(&self, prob: f32) -> u64 {
        match self.kind {
            QuantType::None => prob.to_bits() as u64,
            QuantType::Bits(_) => nearest(&self.longest, prob),
        }
    }

    #[inline]
    pub fn decode_longest(&self, code: u64) -> f32 {
        match self.kind {
            QuantType::None => f32::from_bits(code as u32),
            QuantType::Bits(_) => self.longest[code as usize],
        }
    }

    // --- Serialization helpers ---

    pub fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let (tag, bits) = match self.kind {
            QuantType::None => (0u8, 0u8),
            QuantType::Bits(b) => (1u8, b),
        };
        w.write_u8(tag)?;
        w.write_u8(bits)?;
        w.write_u32::<LittleEndian>(self.middle.len() as u32)?;
        let table = |w: &mut W, t: &[f32]| -> std::io::Result<()> {
            w.write_u32::<LittleEndian>(t.len() as u32)?;
            for &v in t {
                w.write_f32::<LittleEndian>(v)?;
            }
            Ok(())
        };
        for (p, b) in &self.middle {
            table(w, p)?;
            table(w, b)?;
        }
        table(w, &self.longest)
    }

    /// Read codebooks from the front of `buf`, advancing it.
    pub fn read(buf: &mut &[u8]) -> Result<Self> {
        let tag = buf.read_u8()?;
        let bits = buf.read_u8()?;
        let kind = match (tag, bits) {
            (0, _) => QuantType::None,
            (1, b @ 1..=16) => QuantType::Bits(b),
            _ => {
                return Err(LmError::format(format!(
                    "unknown quantizer type {} with {} bits",
                    tag, bits
                )))
            }
        };
        let n_middle = buf.read_u32::<LittleEndian>()? as usize;
        let expect = match kind {
            QuantType::None => 0,
            QuantType::Bits(b) => 1usize << b,
        };
        let mut table = |buf: &mut &[u8]| -> Result<Vec<f32>> {
            let n = buf.read_u32::<LittleEndian>()? as usize;
            if n != expect {
                return Err(LmError::format(format!(
                    "codebook has {} entries, expected {}",
                    n, expect
                )));
            }
            let mut t = Vec::with_capacity(n);
            for _ in 0..n {
                t.push(buf.read_f32::<LittleEndian>()?);
            }
            Ok(t)
        };
        let mut middle = Vec::with_capacity(n_middle);
        for _ in 0..n_middle {
            let p = table(buf)?;
            let b = table(buf)?;
            middle.push((p, b));
        }
        let longest = table(buf)?;
        Ok(Quantizer {
            kind,
            middle,
            longest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spread(n: usize) -> Vec<f32> {
        (0..n).map(|i| -(i as f32) * 13.7 - 100.0).collect()
    }

    #[test]
    fn four_bits_give_sixteen_sorted_centers() {
        let q = Quantizer::train(QuantType::Bits(4), vec![(spread(1000), spread(500))], spread(800));
        let (p, b) = &q.middle[0];
        assert_eq!(p.len(), 16);
        assert_eq!(b.len(), 16);
        assert_eq!(q.longest.len(), 16);
        assert!(p.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(q.middle_bits(), 8);
    }

    #[test]
    fn encoding_picks_nearest_center() {
        let values = spread(4096);
        let q = Quantizer::train(QuantType::Bits(8), Vec::new(), values.clone());
        // bins hold 16 values 13.7 apart, so error stays within half a bin
        let max_err = 16.0 * 13.7 / 2.0 + 1.0;
        for &v in values.iter().step_by(37) {
            let back = q.decode_longest(q.encode_longest(v));
            assert!((back - v).abs() <= max_err, "v={} back={}", v, back);
        }
        // values outside the trained range clamp to the end codes
        assert_eq!(q.encode_longest(1.0e9), 255);
        assert_eq!(q.encode_longest(-1.0e9), 0);
    }

    #[test]
    fn passthrough_is_exact() {
        let q = Quantizer::train(QuantType::None, vec![(spread(3), spread(3))], spread(3));
        let (p, b) = q.encode_middle(0, -1234.5, -0.25);
        assert_eq!(q.decode_middle(0, p, b), (-1234.5, -0.25));
        assert_eq!(q.decode_longest(q.encode_longest(-7.0)), -7.0);
        assert_eq!(q.middle_bits(), 64);
    }

    #[test]
    fn codebooks_persist() {
        let q = Quantizer::train(QuantType::Bits(3), vec![(spread(40), spread(20)); 2], spread(30));
        let mut buf = Vec::new();
        q.write(&mut buf).unwrap();
        let mut cur = &buf[..];
        let back = Quantizer::read(&mut cur).unwrap();
        assert!(cur.is_empty());
        assert_eq!(back, q);
    }

    #[test]
    fn empty_input_trains_zero_centers() {
        let q = Quantizer::train(QuantType::Bits(2), vec![(Vec::new(), Vec::new())], Vec::new());
        assert_eq!(q.decode_longest(q.encode_longest(-5.0)), 0.0);
        assert_eq!(QuantType::from_bits(Some(17)).is_err(), true);
        assert_eq!(QuantType::from_bits(None).unwrap(), QuantType::None);
    }
}
