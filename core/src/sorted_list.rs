//! Deduplicating value pool used for the classic model's bigram and trigram
//! weight tables.
//!
//! Values live in insertion order (their index is what records store) and are
//! threaded into an unbalanced binary search tree for lookup. Child links use
//! 0 as "none", which works because slot 0 is the root and never a child.
use tracing::warn;

/// Pool indices are stored in 16 bits; keep two codes spare.
pub const MAX_SORTED_ENTRIES: usize = 65534;

#[derive(Debug, Clone, Copy)]
struct Node {
    val: f32,
    lower: u16,
    higher: u16,
}

#[derive(Debug, Clone)]
pub struct SortedList {
    nodes: Vec<Node>,
    capacity: usize,
    overflowed: bool,
}

impl Default for SortedList {
    fn default() -> Self {
        Self::new()
    }
}

impl SortedList {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SORTED_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            capacity: capacity.min(MAX_SORTED_ENTRIES),
            overflowed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether some insert had to fall back to an existing slot.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Index of `val`, inserting it if new. When the pool is full the index
    /// of the nearest stored value is returned instead.
    pub fn insert(&mut self, val: f32) -> u16 {
        if self.nodes.is_empty() {
            self.nodes.push(Node {
                val,
                lower: 0,
                higher: 0,
            });
            return 0;
        }

        let mut i = 0usize;
        let mut nearest = 0usize;
        loop {
            let node = self.nodes[i];
            if node.val == val {
                return i as u16;
            }
            if (node.val - val).abs() < (self.nodes[nearest].val - val).abs() {
                nearest = i;
            }
            let next = if val < node.val { node.lower } else { node.higher };
            if next != 0 {
                i = next as usize;
                continue;
            }

            if self.nodes.len() >= self.capacity {
                if !self.overflowed {
                    warn!(
                        "value pool full ({} entries), reusing nearest values",
                        self.capacity
                    );
                    self.overflowed = true;
                }
                return nearest as u16;
            }
            let new = self.nodes.len() as u16;
            self.nodes.push(Node {
                val,
                lower: 0,
                higher: 0,
            });
            if val < node.val {
                self.nodes[i].lower = new;
            } else {
                self.nodes[i].higher = new;
            }
            return new;
        }
    }

    /// Values in index order.
    pub fn values(&self) -> Vec<f32> {
        self.nodes.iter().map(|n| n.val).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_values_share_a_slot() {
        let mut l = SortedList::new();
        let a = l.insert(-0.5);
        let b = l.insert(-1.25);
        let c = l.insert(-0.5);
        let d = l.insert(-0.1);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(l.len(), 3);
        assert_eq!(l.values(), vec![-0.5, -1.25, -0.1]);
        assert_eq!(l.values()[d as usize], -0.1);
    }

    #[test]
    fn full_pool_reuses_nearest_value() {
        let mut l = SortedList::with_capacity(3);
        l.insert(-1.0);
        l.insert(-3.0);
        l.insert(-2.0);
        assert!(!l.overflowed());
        let idx = l.insert(-2.9);
        assert!(l.overflowed());
        assert_eq!(l.len(), 3);
        assert_eq!(l.values()[idx as usize], -3.0);
        let idx = l.insert(-0.2);
        assert_eq!(l.values()[idx as usize], -1.0);
    }
}
