use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// 待运行任务队列 — pending jobs ordered by due time, FIFO within the same
/// second (the sequence number breaks ties in arrival order, which is what
/// gives per-host FIFO admission).
#[derive(Default)]
pub struct PendingQueue {
    heap: BinaryHeap<Reverse<(i64, u64, usize)>>,
    seq: u64,
}

impl PendingQueue {
    pub fn push(&mut self, jsa_index: usize, due: i64) {
        self.seq += 1;
        self.heap.push(Reverse((due, self.seq, jsa_index)));
    }

    /// Pop the oldest job whose due time has passed.
    pub fn pop_due(&mut self, now: i64) -> Option<usize> {
        match self.heap.peek() {
            Some(Reverse((due, _, _))) if *due <= now => {
                let Reverse((_, _, idx)) = self.heap.pop().expect("peeked entry");
                Some(idx)
            }
            _ => None,
        }
    }

    /// Seconds until the next job is due; None when empty.
    pub fn next_due_in(&self, now: i64) -> Option<i64> {
        self.heap.peek().map(|Reverse((due, _, _))| (*due - now).max(0))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
