//! File helpers shared by the format readers and writers: transparent gzip
//! on `.gz` paths and a byte-order aware binary reader.
use crate::error::{LmError, Result};
use byteorder::{NativeEndian, ReadBytesExt};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// True when `path` names a gzip-compressed file.
pub fn is_gzip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

/// Open `path` for buffered reading, decompressing `.gz` files on the fly.
/// The flag reports whether decompression is in effect.
pub fn open_input(path: &Path) -> Result<(Box<dyn BufRead>, bool)> {
    let file = File::open(path).map_err(|e| LmError::from(e).with_path(path))?;
    if is_gzip(path) {
        let dec = MultiGzDecoder::new(BufReader::new(file));
        Ok((Box::new(BufReader::new(dec)), true))
    } else {
        Ok((Box::new(BufReader::new(file)), false))
    }
}

/// Buffered output file, gzip-compressed when the path ends in `.gz`.
pub enum Output {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Output {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| LmError::from(e).with_path(path))?;
        let w = BufWriter::new(file);
        Ok(if is_gzip(path) {
            Output::Gzip(GzEncoder::new(w, Compression::default()))
        } else {
            Output::Plain(w)
        })
    }

    /// Flush everything, writing the gzip trailer if needed.
    pub fn finish(self) -> io::Result<()> {
        match self {
            Output::Plain(mut w) => w.flush(),
            Output::Gzip(enc) => enc.finish()?.flush(),
        }
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Output::Plain(w) => w.write(buf),
            Output::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::Plain(w) => w.flush(),
            Output::Gzip(w) => w.flush(),
        }
    }
}

/// Reads native-order binary fields, optionally byte-swapping every value,
/// and tracks the absolute offset consumed so far.
pub struct BinReader<R> {
    inner: R,
    swap: bool,
    pos: u64,
}

impl<R: Read> BinReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            swap: false,
            pos: 0,
        }
    }

    pub fn set_swap(&mut self, swap: bool) {
        self.swap = swap;
    }

    pub fn swapped(&self) -> bool {
        self.swap
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn read_i32(&mut self) -> io::Result<i32> {
        let v = self.inner.read_i32::<NativeEndian>()?;
        self.pos += 4;
        Ok(if self.swap { v.swap_bytes() } else { v })
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        let v = self.inner.read_u16::<NativeEndian>()?;
        self.pos += 2;
        Ok(if self.swap { v.swap_bytes() } else { v })
    }

    pub fn read_f32(&mut self) -> io::Result<f32> {
        let bits = self.inner.read_u32::<NativeEndian>()?;
        self.pos += 4;
        Ok(f32::from_bits(if self.swap { bits.swap_bytes() } else { bits }))
    }

    pub fn read_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.inner.read_exact(&mut buf)?;
        self.pos += n as u64;
        Ok(buf)
    }

    /// Read a length-prefixed `f32` table.
    pub fn read_f32_table(&mut self) -> io::Result<Vec<f32>> {
        let n = self.read_i32()?;
        if n < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("negative table length {}", n),
            ));
        }
        (0..n).map(|_| self.read_f32()).collect()
    }
}

impl<R: Skip> BinReader<R> {
    /// Discard `n` bytes.
    pub fn skip(&mut self, n: u64) -> io::Result<()> {
        let skipped = self.inner.skip_bytes(n)?;
        self.pos += skipped;
        if skipped < n {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file ended inside a skipped block",
            ));
        }
        Ok(())
    }
}

/// Readers that can move past bytes without handing them over. Streams
/// drain the bytes; plain files seek.
pub trait Skip: Read {
    fn skip_bytes(&mut self, n: u64) -> io::Result<u64> {
        io::copy(&mut (&mut *self).take(n), &mut io::sink())
    }
}

impl Skip for Box<dyn BufRead> {}

impl Skip for &[u8] {}

impl Skip for BufReader<File> {
    /// Seeks without checking the file length; a short file shows up on the
    /// next read.
    fn skip_bytes(&mut self, n: u64) -> io::Result<u64> {
        let by = i64::try_from(n).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "skip too large"))?;
        self.seek_relative(by)?;
        Ok(n)
    }
}
