use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id source. Plan compilers take it by reference so that tests can seed a
/// fresh generator and get repeatable ids.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::with_start(1)
    }

    pub fn with_start(start: u64) -> Self {
        IdGenerator {
            next: AtomicU64::new(start),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn reset(&self, start: u64) {
        self.next.store(start, Ordering::SeqCst);
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::utils::id_generator::IdGenerator;

    #[test]
    pub fn id_generator_test() {
        let g = IdGenerator::new();
        assert_eq!(g.next_id(), 1);
        assert_eq!(g.next_id(), 2);
        g.reset(100);
        assert_eq!(g.next_id(), 100);
    }
}
