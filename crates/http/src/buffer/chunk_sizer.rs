/// Adaptive chunk allocation policy.
///
/// The next chunk doubles when the previous one was filled completely and halves
/// when less than half of it was used, always staying within `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizer {
    min: usize,
    max: usize,
    next: usize,
}

impl ChunkSizer {
    pub fn new(min: usize, max: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self { min, max, next: min }
    }

    /// Capacity of the next chunk to allocate.
    #[inline]
    pub fn next(&self) -> usize {
        self.next
    }

    /// Records how much of a retired chunk was used.
    pub fn retire(&mut self, used: usize, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if used >= capacity {
            self.next = self.next.saturating_mul(2).min(self.max);
        } else if used < capacity / 2 {
            self.next = (self.next / 2).max(self.min);
        }
    }
}
