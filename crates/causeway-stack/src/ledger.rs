//! Depth-indexed duplicate counters for the cause stack.
//!
//! When the object on top of the stack is pushed again, the stack does not
//! grow; instead the counter at the current depth is incremented. A later pop
//! at that depth consumes one duplicate before it removes the entry itself.
//!
//! A counter at depth `d` is only meaningful while the stack holds exactly `d`
//! entries. The manager clears counters for every depth it pops through and
//! restores the frame's recorded value at the frame's floor on close.

// ---------------------------------------------------------------------------
// DuplicateLedger
// ---------------------------------------------------------------------------

/// Growable counters indexed by stack depth.
///
/// Reads past the end yield zero; writes grow the backing storage as needed,
/// so there is no fixed capacity to outgrow.
#[derive(Debug, Clone, Default)]
pub struct DuplicateLedger {
    counts: Vec<u32>,
}

impl DuplicateLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self { counts: Vec::new() }
    }

    /// The duplicate count recorded at `depth`.
    pub fn get(&self, depth: usize) -> u32 {
        self.counts.get(depth).copied().unwrap_or(0)
    }

    /// Record one more duplicate at `depth`.
    pub fn increment(&mut self, depth: usize) {
        self.grow_to(depth);
        self.counts[depth] += 1;
    }

    /// Consume one duplicate at `depth`. Returns `false` if there was none.
    pub fn decrement(&mut self, depth: usize) -> bool {
        match self.counts.get_mut(depth) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Overwrite the count at `depth`.
    pub fn set(&mut self, depth: usize, value: u32) {
        if value == 0 {
            self.reset(depth);
            return;
        }
        self.grow_to(depth);
        self.counts[depth] = value;
    }

    /// Zero the count at `depth`.
    pub fn reset(&mut self, depth: usize) {
        if let Some(count) = self.counts.get_mut(depth) {
            *count = 0;
        }
    }

    /// Total duplicates recorded across all depths.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| u64::from(c)).sum()
    }

    fn grow_to(&mut self, depth: usize) {
        if self.counts.len() <= depth {
            // Grow by half again so deep stacks don't resize on every push.
            let target = (depth + 1).max(self.counts.len() + self.counts.len() / 2);
            self.counts.resize(target, 0);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
