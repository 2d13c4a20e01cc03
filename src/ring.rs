use std::collections::VecDeque;

/// Bounded FIFO of recent log lines; the oldest entry is evicted on overflow.
///
/// Carries no synchronization of its own. The owning instance or download job
/// guards it with its lock.
#[derive(Debug)]
pub struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Live entries oldest-first, as a fresh allocation the caller may keep
    /// after releasing the owner's lock.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }
}
