//! Trigram-follower cache for the classic model.
//!
//! For a bigram context `(w1, w2)` the trigram slice and the bigram's backoff
//! weight are found once and memoized. Entries hang off one move-to-front list
//! per `w2`, so the context that was just used is found first next time.
//! Entries live in an index arena; freed slots are recycled through a free
//! list.
use crate::vocab::WordId;

/// Memoized trigram context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TgInfo {
    pub w1: WordId,
    /// Absolute index of the first trigram following `(w1, w2)`.
    pub first_tg: u32,
    /// Number of trigrams following `(w1, w2)`; zero if the bigram is absent.
    pub n_tg: u32,
    /// Backoff weight of the bigram `(w1, w2)`, zero if absent.
    pub bowt: i32,
    used: bool,
    next: Option<u32>,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Live entries.
    pub entries: usize,
    /// Live entries touched since the last sweep.
    pub used: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TginfoCache {
    heads: Vec<Option<u32>>,
    slots: Vec<TgInfo>,
    free: Vec<u32>,
    hits: u64,
    misses: u64,
}

impl TginfoCache {
    pub fn new(n_words: usize) -> Self {
        Self {
            heads: vec![None; n_words],
            ..Self::default()
        }
    }

    /// Find the entry for `(w1, w2)`, calling `load` to build it on a miss.
    ///
    /// `load` returns `(first_tg, n_tg, bowt)`.
    pub fn lookup<F>(&mut self, w1: WordId, w2: WordId, load: F) -> TgInfo
    where
        F: FnOnce() -> (u32, u32, i32),
    {
        let w2 = w2 as usize;
        if w2 >= self.heads.len() {
            self.heads.resize(w2 + 1, None);
        }

        let mut prev: Option<u32> = None;
        let mut cur = self.heads[w2];
        while let Some(i) = cur {
            let entry = self.slots[i as usize];
            if entry.w1 == w1 {
                if let Some(p) = prev {
                    // unlink and move to front
                    self.slots[p as usize].next = entry.next;
                    self.slots[i as usize].next = self.heads[w2];
                    self.heads[w2] = Some(i);
                }
                self.slots[i as usize].used = true;
                self.hits += 1;
                return self.slots[i as usize];
            }
            prev = cur;
            cur = entry.next;
        }

        self.misses += 1;
        let (first_tg, n_tg, bowt) = load();
        let entry = TgInfo {
            w1,
            first_tg,
            n_tg,
            bowt,
            used: true,
            next: self.heads[w2],
        };
        let slot = match self.free.pop() {
            Some(s) => {
                self.slots[s as usize] = entry;
                s
            }
            None => {
                self.slots.push(entry);
                (self.slots.len() - 1) as u32
            }
        };
        self.heads[w2] = Some(slot);
        entry
    }

    /// Drop every entry and release the arena.
    pub fn reset(&mut self) {
        self.heads.iter_mut().for_each(|h| *h = None);
        self.slots = Vec::new();
        self.free.clear();
    }

    /// Resize for a grown vocabulary. Clears the cache.
    pub fn resize(&mut self, n_words: usize) {
        self.heads.resize(n_words, None);
        self.reset();
    }

    /// Free entries not used since the previous sweep and clear the `used`
    /// flag on the survivors. Returns the number of entries freed.
    pub fn evict_unused(&mut self) -> usize {
        let mut freed = 0;
        for w2 in 0..self.heads.len() {
            let mut prev: Option<u32> = None;
            let mut cur = self.heads[w2];
            while let Some(i) = cur {
                let entry = self.slots[i as usize];
                cur = entry.next;
                if entry.used {
                    self.slots[i as usize].used = false;
                    prev = Some(i);
                } else {
                    match prev {
                        Some(p) => self.slots[p as usize].next = entry.next,
                        None => self.heads[w2] = entry.next,
                    }
                    self.free.push(i);
                    freed += 1;
                }
            }
        }
        freed
    }

    pub fn stats(&self) -> CacheStats {
        let mut entries = 0;
        let mut used = 0;
        for head in &self.heads {
            let mut cur = *head;
            while let Some(i) = cur {
                let e = &self.slots[i as usize];
                entries += 1;
                if e.used {
                    used += 1;
                }
                cur = e.next;
            }
        }
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries,
            used,
        }
    }

    /// `w1` values on the list of `w2`, front first.
    #[cfg(test)]
    fn chain(&self, w2: usize) -> Vec<WordId> {
        let mut out = Vec::new();
        let mut cur = self.heads[w2];
        while let Some(i) = cur {
            out.push(self.slots[i as usize].w1);
            cur = self.slots[i as usize].next;
        }
        out
    }
}
