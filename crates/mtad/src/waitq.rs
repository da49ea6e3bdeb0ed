use std::collections::HashMap;
use std::hash::Hash;

/// Registry of entities awaiting a shared asynchronous reply. The first
/// waiter for a key is told to issue the request; later waiters piggyback
/// on the outstanding one. Running a key drains every waiter at once.
pub struct WaitQ<K: Eq + Hash, V> {
    waiting: HashMap<K, Vec<V>>,
}

impl<K: Eq + Hash, V> Default for WaitQ<K, V> {
    fn default() -> Self {
        Self {
            waiting: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V> WaitQ<K, V> {
    /// Attach `arg` to `key`. Returns true if this is the first waiter,
    /// in which case the caller must issue the underlying request.
    pub fn wait(&mut self, key: K, arg: V) -> bool {
        match self.waiting.entry(key) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(vec![arg]);
                true
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                slot.get_mut().push(arg);
                false
            }
        }
    }

    /// Remove and return every waiter for `key`.
    pub fn run(&mut self, key: &K) -> Vec<V> {
        self.waiting.remove(key).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_waiter_issues_the_request() {
        let mut wq: WaitQ<u64, &str> = WaitQ::default();
        assert!(wq.wait(7, "a"));
        assert!(!wq.wait(7, "b"));
        assert!(wq.wait(9, "c"));

        assert_eq!(wq.run(&7), vec!["a", "b"]);
        // Key is gone once run; a new wait issues again.
        assert!(wq.wait(7, "d"));
        assert_eq!(wq.run(&9), vec!["c"]);
        assert_eq!(wq.run(&9), Vec::<&str>::new());
    }
}
