//! Owned-or-mapped backing storage for model tables.
//!
//! Readers either copy table data onto the heap or, when the file layout
//! allows it, point straight into a read-only memory map. The map is held by
//! an `Arc`, so it stays alive until the last table referencing it is dropped.
use memmap2::Mmap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::Arc;

/// A byte region that is either heap-owned or a window into a mapped file.
#[derive(Clone)]
pub enum Storage {
    Owned(Vec<u8>),
    Mapped { map: Arc<Mmap>, range: Range<usize> },
}

impl Storage {
    pub fn mapped(map: &Arc<Mmap>, range: Range<usize>) -> Self {
        Storage::Mapped {
            map: Arc::clone(map),
            range,
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Storage::Owned(v) => v,
            Storage::Mapped { map, range } => &map[range.clone()],
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Storage::Mapped { .. })
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Owned(v) => write!(f, "Storage::Owned({} bytes)", v.len()),
            Storage::Mapped { range, .. } => {
                write!(f, "Storage::Mapped({}..{})", range.start, range.end)
            }
        }
    }
}

/// Fixed-size record with a native-endian on-disk encoding.
pub trait Record: Copy {
    const SIZE: usize;
    fn decode(bytes: &[u8]) -> Self;
}

/// Table of records, either decoded into a `Vec` or read on demand from
/// mapped bytes.
#[derive(Clone)]
pub enum RecordTable<R: Record> {
    Owned(Vec<R>),
    Mapped(Storage, PhantomData<R>),
}

impl<R: Record> RecordTable<R> {
    pub fn mapped(storage: Storage) -> Self {
        RecordTable::Mapped(storage, PhantomData)
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            RecordTable::Owned(v) => v.len(),
            RecordTable::Mapped(s, _) => s.len() / R::SIZE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get(&self, i: usize) -> R {
        match self {
            RecordTable::Owned(v) => v[i],
            RecordTable::Mapped(s, _) => {
                let off = i * R::SIZE;
                R::decode(&s.as_bytes()[off..off + R::SIZE])
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = R> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, RecordTable::Mapped(..))
    }
}

impl<R: Record> Default for RecordTable<R> {
    fn default() -> Self {
        RecordTable::Owned(Vec::new())
    }
}

impl<R: Record> fmt::Debug for RecordTable<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordTable::Owned(v) => write!(f, "RecordTable::Owned({} records)", v.len()),
            RecordTable::Mapped(s, _) => write!(f, "RecordTable::Mapped({:?})", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, NativeEndian};
    use std::io::Write;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Pair {
        a: u16,
        b: u16,
    }

    impl Record for Pair {
        const SIZE: usize = 4;
        fn decode(bytes: &[u8]) -> Self {
            Pair {
                a: NativeEndian::read_u16(&bytes[0..2]),
                b: NativeEndian::read_u16(&bytes[2..4]),
            }
        }
    }

    #[test]
    fn mapped_and_owned_tables_agree() {
        let pairs = vec![Pair { a: 1, b: 2 }, Pair { a: 300, b: 7 }];
        let mut bytes = vec![0xffu8; 2];
        for p in &pairs {
            let mut rec = [0u8; 4];
            NativeEndian::write_u16(&mut rec[0..2], p.a);
            NativeEndian::write_u16(&mut rec[2..4], p.b);
            bytes.extend_from_slice(&rec);
        }
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&bytes).unwrap();
        let map = Arc::new(unsafe { Mmap::map(&file).unwrap() });

        let mapped: RecordTable<Pair> = RecordTable::mapped(Storage::mapped(&map, 2..bytes.len()));
        let owned = RecordTable::Owned(pairs.clone());
        drop(map);

        assert!(mapped.is_mapped());
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped.iter().collect::<Vec<_>>(), owned.iter().collect::<Vec<_>>());
    }
}
