use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Wall clock time in whole seconds since the unix epoch.
pub type UnixTime = i64;

/// A RunQueue is a deadline-ordered queue of opaque keys.
/// There is at most one pending entry per key; scheduling a key that
/// is already pending moves it to the new deadline. Entries that share
/// a deadline fire in the order they were scheduled.
pub struct RunQueue<T: Clone + Eq + Hash> {
    queue: BTreeMap<(UnixTime, u64), T>,
    index: HashMap<T, (UnixTime, u64)>,
    seq: u64,
}

impl<T: Clone + Eq + Hash> Default for RunQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Eq + Hash> RunQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            index: HashMap::new(),
            seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Schedule `key` to fire at `deadline`, replacing any pending
    /// entry for the same key.
    pub fn schedule(&mut self, deadline: UnixTime, key: T) {
        if let Some(prior) = self.index.remove(&key) {
            self.queue.remove(&prior);
        }
        let entry = (deadline, self.seq);
        self.seq += 1;
        self.index.insert(key.clone(), entry);
        self.queue.insert(entry, key);
    }

    /// Remove a pending entry. Returns whether one was pending.
    pub fn cancel(&mut self, key: &T) -> bool {
        match self.index.remove(key) {
            Some(entry) => {
                self.queue.remove(&entry);
                true
            }
            None => false,
        }
    }

    /// Deadline of the pending entry for `key`, if any.
    pub fn pending(&self, key: &T) -> Option<UnixTime> {
        self.index.get(key).map(|(deadline, _)| *deadline)
    }

    /// Earliest deadline over all pending entries.
    pub fn next_deadline(&self) -> Option<UnixTime> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every entry whose deadline has been reached,
    /// in deadline order.
    pub fn pop_due(&mut self, now: UnixTime) -> Vec<T> {
        let mut due = vec![];
        while let Some((&entry, _)) = self.queue.iter().next() {
            if entry.0 > now {
                break;
            }
            let key = self.queue.remove(&entry).expect("entry present");
            self.index.remove(&key);
            due.push(key);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_order() {
        let mut q = RunQueue::new();
        q.schedule(30, "c");
        q.schedule(10, "a");
        q.schedule(20, "b");

        assert_eq!(q.next_deadline(), Some(10));
        assert_eq!(q.pop_due(9), Vec::<&str>::new());
        assert_eq!(q.pop_due(20), vec!["a", "b"]);
        assert_eq!(q.pop_due(100), vec!["c"]);
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_for_equal_deadlines() {
        let mut q = RunQueue::new();
        q.schedule(10, "first");
        q.schedule(10, "second");
        q.schedule(10, "third");
        assert_eq!(q.pop_due(10), vec!["first", "second", "third"]);
    }

    #[test]
    fn reschedule_replaces() {
        let mut q = RunQueue::new();
        q.schedule(10, "a");
        q.schedule(50, "a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.pending(&"a"), Some(50));
        assert_eq!(q.pop_due(10), Vec::<&str>::new());
        assert_eq!(q.pop_due(50), vec!["a"]);
    }

    #[test]
    fn cancel() {
        let mut q = RunQueue::new();
        q.schedule(10, "a");
        q.schedule(20, "b");
        assert!(q.cancel(&"a"));
        assert!(!q.cancel(&"a"));
        assert_eq!(q.pending(&"a"), None);
        assert_eq!(q.pop_due(100), vec!["b"]);
    }
}
