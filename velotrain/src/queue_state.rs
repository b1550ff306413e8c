//! Per-refid passing queue state (part of C4's data model).
//!
//! Each refid gets its own ordered multiset of pending `(tod, mpid)`
//! entries plus a small history record used by the sector/isolated match
//! rules. Entries are always processed from the earliest `tod` forward.

use std::collections::HashMap;

use velotrain_proto::Tod;

#[derive(Debug, Clone, Default)]
pub struct QueueState {
    /// tod of the most recently accepted passing for this refid.
    pub lt: Option<Tod>,
    /// mp of the most recently accepted passing.
    pub lc: Option<String>,
    /// set when the queue head could not be matched; cleared on a match.
    pub choke: Option<String>,
    /// tod this refid's current run started at.
    pub rs: Option<Tod>,
    /// per-mp tod of the last accepted passing there (used by named splits).
    pub per_mp: HashMap<String, Tod>,
    queue: Vec<(Tod, String)>,
}

impl QueueState {
    pub fn insert(&mut self, tod: Tod, mpid: String) {
        let pos = self.queue.partition_point(|(t, _)| *t <= tod);
        self.queue.insert(pos, (tod, mpid));
    }

    pub fn peek(&self) -> Option<&(Tod, String)> {
        self.queue.first()
    }

    pub fn remove_once(&mut self, mpid: &str) {
        if let Some(pos) = self.queue.iter().position(|(_, m)| m == mpid) {
            self.queue.remove(pos);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn last_at(&self, mpid: &str) -> Option<Tod> {
        self.per_mp.get(mpid).copied()
    }

    pub fn record_accept(&mut self, tod: Tod, mpid: &str) {
        self.lt = Some(tod);
        self.lc = Some(mpid.to_string());
        self.per_mp.insert(mpid.to_string(), tod);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_ascending_order() {
        let mut q = QueueState::default();
        q.insert(Tod::from_secs_f64(5.0), "C1".into());
        q.insert(Tod::from_secs_f64(1.0), "C2".into());
        q.insert(Tod::from_secs_f64(3.0), "C3".into());
        assert_eq!(q.peek().unwrap().1, "C2");
    }

    #[test]
    fn remove_once_drops_a_single_matching_entry() {
        let mut q = QueueState::default();
        q.insert(Tod::from_secs_f64(1.0), "C1".into());
        q.insert(Tod::from_secs_f64(2.0), "C1".into());
        q.remove_once("C1");
        assert_eq!(q.peek().unwrap().0, Tod::from_secs_f64(2.0));
    }
}
