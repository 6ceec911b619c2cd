//! Fixed-point log-domain arithmetic.
//!
//! Every probability in the crate is carried as an `i32` "log value":
//! `round(log_B(x) / 2^shift)` for a configurable base `B`. Adding two
//! probabilities in this domain needs `log_B(1 + B^-d)`, which is precomputed
//! into a table whose entries are 1, 2 or 4 bytes wide.
//!
//! The table can be written to disk and loaded back so that several models
//! share exactly the same rounding.
use crate::error::{LmError, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// Marker written after the text header; reading it back reveals byte order.
const BYTE_ORDER_MAGIC: u32 = 0x1122_3344;

/// Sentinel for log(0). Far enough above `i32::MIN` that sums of a few
/// sentinels do not wrap.
const LOG_ZERO: i32 = 0xe000_0000_u32 as i32;

/// Precomputed `log_B(1 + B^-d)` entries at the configured width.
#[derive(Clone, PartialEq)]
enum AddTable {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl AddTable {
    fn from_entries(width: u8, entries: Vec<u32>) -> Self {
        match width {
            1 => AddTable::U8(entries.into_iter().map(|e| e as u8).collect()),
            2 => AddTable::U16(entries.into_iter().map(|e| e as u16).collect()),
            _ => AddTable::U32(entries),
        }
    }

    fn len(&self) -> usize {
        match self {
            AddTable::U8(v) => v.len(),
            AddTable::U16(v) => v.len(),
            AddTable::U32(v) => v.len(),
        }
    }

    #[inline]
    fn get(&self, d: usize) -> i32 {
        match self {
            AddTable::U8(v) => v[d] as i32,
            AddTable::U16(v) => v[d] as i32,
            AddTable::U32(v) => v[d] as i32,
        }
    }
}

/// Log-math context: base, width, shift and the add table.
#[derive(Clone)]
pub struct LogMath {
    base: f64,
    log_of_base: f64,
    log10_of_base: f64,
    inv_log_of_base: f64,
    inv_log10_of_base: f64,
    width: u8,
    shift: u32,
    table: AddTable,
}

impl fmt::Debug for LogMath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogMath")
            .field("base", &self.base)
            .field("width", &self.width)
            .field("shift", &self.shift)
            .field("table_size", &self.table.len())
            .finish()
    }
}

impl LogMath {
    /// Build a context and its add table.
    ///
    /// Fails for `base <= 1.0`, for widths other than 1, 2 or 4, and when the
    /// largest table entry (`log_B(2)` after shifting) does not fit the width.
    pub fn new(base: f64, width: u8, shift: u32) -> Result<Self> {
        let mut lmath = Self::bare(base, width, shift)?;

        let scale = lmath.scale();
        let mut entries: Vec<u32> = Vec::new();
        let mut d: u64 = 0;
        loop {
            let byx = base.powf(-(d as f64) * scale);
            let k = ((1.0 + byx).ln() * lmath.inv_log_of_base / scale + 0.5) as u32;
            entries.push(k);
            if k == 0 {
                break;
            }
            d += 1;
        }
        lmath.table = AddTable::from_entries(width, entries);
        Ok(lmath)
    }

    /// Validated parameters with an empty table.
    fn bare(base: f64, width: u8, shift: u32) -> Result<Self> {
        // Negated test so NaN is rejected too.
        if !(base > 1.0) || !base.is_finite() {
            return Err(LmError::InvalidLogBase(base));
        }
        if !matches!(width, 1 | 2 | 4) {
            return Err(LmError::InvalidLogWidth(width));
        }
        if shift >= 31 {
            return Err(LmError::LogTableOverflow { base, width, shift });
        }
        let log_of_base = base.ln();
        let log10_of_base = base.log10();
        let maxyx = (2f64.ln() / log_of_base + 0.5) as u64;
        let limit = (u32::MAX >> ((4 - width as u32) * 8)) as u64;
        if (maxyx >> shift) > limit {
            return Err(LmError::LogTableOverflow { base, width, shift });
        }
        Ok(Self {
            base,
            log_of_base,
            log10_of_base,
            inv_log_of_base: 1.0 / log_of_base,
            inv_log10_of_base: 1.0 / log10_of_base,
            width,
            shift,
            table: AddTable::U32(Vec::new()),
        })
    }

    #[inline]
    fn scale(&self) -> f64 {
        (1u64 << self.shift) as f64
    }

    /// Round a real-valued log (already in shifted units) into the integer domain.
    #[inline]
    fn to_fixed(&self, v: f64) -> i32 {
        if v.is_nan() || v <= LOG_ZERO as f64 {
            LOG_ZERO
        } else if v >= i32::MAX as f64 {
            i32::MAX
        } else {
            v.round() as i32
        }
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn table_size(&self) -> usize {
        self.table.len()
    }

    /// Log value standing in for log(0).
    pub fn zero(&self) -> i32 {
        LOG_ZERO
    }

    /// True when both contexts produce identical log values for the same input.
    pub fn same_scale(&self, other: &LogMath) -> bool {
        self.base == other.base && self.shift == other.shift
    }

    /// `log_B(p)`; zero or negative probabilities map to [`LogMath::zero`].
    pub fn log(&self, p: f64) -> i32 {
        if !(p > 0.0) {
            return LOG_ZERO;
        }
        self.to_fixed(p.ln() * self.inv_log_of_base / self.scale())
    }

    /// `B^v` as a linear probability.
    pub fn exp(&self, v: i32) -> f64 {
        self.base.powf(v as f64 * self.scale())
    }

    pub fn ln_to_log(&self, x: f64) -> i32 {
        self.to_fixed(x * self.inv_log_of_base / self.scale())
    }

    pub fn log_to_ln(&self, v: i32) -> f64 {
        v as f64 * self.scale() * self.log_of_base
    }

    pub fn log10_to_log(&self, x: f64) -> i32 {
        self.to_fixed(x * self.inv_log10_of_base / self.scale())
    }

    /// Unrounded variant of [`LogMath::log10_to_log`] for float-valued tables.
    pub fn log10_to_log_float(&self, x: f64) -> f32 {
        (x * self.inv_log10_of_base / self.scale()) as f32
    }

    pub fn log_to_log10(&self, v: i32) -> f64 {
        v as f64 * self.scale() * self.log10_of_base
    }

    /// Float log value (as stored by the trie) back to base 10.
    pub fn log_float_to_log10(&self, v: f32) -> f64 {
        v as f64 * self.scale() * self.log10_of_base
    }

    /// `log_B(B^x + B^y)` through the add table.
    #[inline]
    pub fn add(&self, x: i32, y: i32) -> i32 {
        let (r, d) = if x > y {
            (x, x as i64 - y as i64)
        } else {
            (y, y as i64 - x as i64)
        };
        if d >= self.table.len() as i64 {
            return r;
        }
        r.saturating_add(self.table.get(d as usize))
    }

    /// `log_B(B^x + B^y)` computed in floating point, without the table.
    pub fn add_exact(&self, x: i32, y: i32) -> i32 {
        let (r, d) = if x > y {
            (x, x as i64 - y as i64)
        } else {
            (y, y as i64 - x as i64)
        };
        let scale = self.scale();
        let k = (1.0 + self.base.powf(-(d as f64) * scale)).ln() * self.inv_log_of_base / scale;
        r.saturating_add(k.round() as i32)
    }

    // --- Persistence ---

    /// Write the context and its table to `path` (little-endian).
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| LmError::from(e).with_path(path))?;
        let mut w = BufWriter::new(file);
        self.write_to::<LittleEndian, _>(&mut w)
            .and_then(|_| w.flush().map_err(LmError::from))
            .map_err(|e| e.with_path(path))
    }

    fn write_to<E: ByteOrder, W: Write>(&self, w: &mut W) -> Result<()> {
        let header = format!(
            "s3\nversion 1.0\nwidth {}\nshift {}\nlogbase {}\nendhdr\n",
            self.width, self.shift, self.base
        );
        w.write_all(header.as_bytes())?;
        let pad = (4 - header.len() % 4) % 4;
        w.write_all(&[0u8; 3][..pad])?;
        w.write_u32::<E>(BYTE_ORDER_MAGIC)?;
        w.write_u32::<E>(self.table.len() as u32)?;
        match &self.table {
            AddTable::U8(v) => w.write_all(v)?,
            AddTable::U16(v) => {
                for x in v {
                    w.write_u16::<E>(*x)?;
                }
            }
            AddTable::U32(v) => {
                for x in v {
                    w.write_u32::<E>(*x)?;
                }
            }
        }
        Ok(())
    }

    /// Load a context written by [`LogMath::write`]. The table is taken as
    /// stored rather than recomputed.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut buf = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut buf))
            .map_err(|e| LmError::from(e).with_path(path))?;
        Self::from_bytes(&buf).map_err(|e| e.with_path(path))
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        const END: &[u8] = b"endhdr\n";
        let hdr_end = buf
            .windows(END.len())
            .position(|w| w == END)
            .map(|p| p + END.len())
            .ok_or_else(|| LmError::format("log table header has no endhdr"))?;
        let header = std::str::from_utf8(&buf[..hdr_end])
            .map_err(|_| LmError::format("log table header is not valid text"))?;

        let mut lines = header.lines();
        if lines.next() != Some("s3") {
            return Err(LmError::format("log table does not start with s3 header"));
        }
        let (mut width, mut shift, mut base) = (None, None, None);
        for line in lines {
            let mut parts = line.split_whitespace();
            let (Some(key), value) = (parts.next(), parts.next()) else {
                continue;
            };
            match (key, value) {
                ("width", Some(v)) => width = v.parse::<u8>().ok(),
                ("shift", Some(v)) => shift = v.parse::<u32>().ok(),
                ("logbase", Some(v)) => base = v.parse::<f64>().ok(),
                _ => {}
            }
        }
        let (Some(width), Some(shift), Some(base)) = (width, shift, base) else {
            return Err(LmError::format(
                "log table header lacks width, shift or logbase",
            ));
        };
        let mut lmath = Self::bare(base, width, shift)?;

        let body = buf
            .get((hdr_end + 3) / 4 * 4..)
            .filter(|b| b.len() >= 8)
            .ok_or_else(|| LmError::format("log table truncated after header"))?;
        lmath.table = if LittleEndian::read_u32(body) == BYTE_ORDER_MAGIC {
            parse_table::<LittleEndian>(&body[4..], width)?
        } else if BigEndian::read_u32(body) == BYTE_ORDER_MAGIC {
            parse_table::<BigEndian>(&body[4..], width)?
        } else {
            return Err(LmError::format("log table byte-order marker not recognized"));
        };
        Ok(lmath)
    }
}

fn parse_table<E: ByteOrder>(body: &[u8], width: u8) -> Result<AddTable> {
    let len = E::read_u32(body) as usize;
    let data = &body[4..];
    if data.len() < len * width as usize {
        return Err(LmError::format(format!(
            "log table declares {} entries but only {} bytes follow",
            len,
            data.len()
        )));
    }
    let entries: Vec<u32> = match width {
        1 => data[..len].iter().map(|&b| b as u32).collect(),
        2 => data[..len * 2]
            .chunks_exact(2)
            .map(|c| E::read_u16(c) as u32)
            .collect(),
        _ => data[..len * 4].chunks_exact(4).map(E::read_u32).collect(),
    };
    Ok(AddTable::from_entries(width, entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lmath() -> LogMath {
        LogMath::new(1.0001, 4, 0).unwrap()
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(matches!(
            LogMath::new(1.0, 4, 0),
            Err(LmError::InvalidLogBase(_))
        ));
        assert!(matches!(
            LogMath::new(0.5, 4, 0),
            Err(LmError::InvalidLogBase(_))
        ));
        assert!(matches!(
            LogMath::new(1.0001, 3, 0),
            Err(LmError::InvalidLogWidth(3))
        ));
        // log_B(2) is ~6931 units at base 1.0001, which does not fit a byte
        assert!(matches!(
            LogMath::new(1.0001, 1, 0),
            Err(LmError::LogTableOverflow { .. })
        ));
        // ...but does once shifted down far enough
        assert!(LogMath::new(1.0001, 1, 5).is_ok());
    }

    #[test]
    fn log_and_exp_agree() {
        let lm = lmath();
        for p in [1e-3, 0.25, 0.5, 42.0] {
            let back = lm.exp(lm.log(p));
            assert!((back - p).abs() / p < 1e-3, "p={} back={}", p, back);
        }
        let v = lm.log(1e-48);
        assert!((v + 1_105_296).abs() <= 1, "log(1e-48) = {}", v);
        assert_eq!(lm.log(0.0), lm.zero());
        assert_eq!(lm.log(-1.0), lm.zero());
        assert!(lm.exp(lm.zero()) < 1e-300);
    }

    #[test]
    fn add_follows_linear_sum() {
        let lm = lmath();
        let tiny = lm.log(1e-48);
        let big = lm.log(42.0);
        assert_eq!(lm.add(tiny, big), big);
        assert_eq!(lm.add(big, tiny), big);

        let sum = lm.add(tiny, lm.log(5e-48));
        assert!((sum - lm.log(6e-48)).abs() <= 2, "sum={}", sum);

        for (a, b) in [(-100, -100), (-5000, -12000), (-70000, -70500)] {
            assert!((lm.add(a, b) - lm.add_exact(a, b)).abs() <= 1);
        }
    }

    #[test]
    fn add_with_shift_and_narrow_table() {
        let lm = LogMath::new(1.0001, 2, 3).unwrap();
        let a = lm.log(0.3);
        let b = lm.log(0.2);
        let s = lm.add(a, b);
        assert!((s - lm.log(0.5)).abs() <= 1);
    }

    #[test]
    fn base_ten_conversions() {
        let lm = lmath();
        assert_eq!(lm.log10_to_log(-2.0), -46053);
        for x in [-0.3, -1.25, -4.0] {
            assert!((lm.log_to_log10(lm.log10_to_log(x)) - x).abs() < 1e-4);
        }
        assert!((lm.log_to_ln(lm.ln_to_log(-3.5)) + 3.5).abs() < 1e-4);
        let f = lm.log10_to_log_float(-2.0);
        assert!((f + 46053.49).abs() < 0.1);
    }

    #[test]
    fn persisted_table_reloads_identically() {
        let lm = LogMath::new(1.0003, 2, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logadd.tab");
        lm.write(&path).unwrap();
        let back = LogMath::read(&path).unwrap();
        assert_eq!(back.table_size(), lm.table_size());
        assert!(back.table == lm.table);
        assert!(back.same_scale(&lm));
        assert_eq!(back.add(-1000, -1200), lm.add(-1000, -1200));
    }

    #[test]
    fn swapped_table_is_detected() {
        let lm = LogMath::new(1.001, 4, 0).unwrap();
        let mut buf = Vec::new();
        lm.write_to::<BigEndian, _>(&mut buf).unwrap();
        let back = LogMath::from_bytes(&buf).unwrap();
        assert!(back.table == lm.table);
    }
}
