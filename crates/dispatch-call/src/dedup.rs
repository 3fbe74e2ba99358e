//! Memory of recently terminated sessions.
//!
//! Once a session ends its id is retired: any later event carrying it, including
//! a re-delivered `call:incoming`, is stale and must not start or touch a call.

use dispatch_common::SessionId;
use std::collections::{HashSet, VecDeque};

/// Bounded set of retired session ids, oldest evicted first.
#[derive(Debug)]
pub struct RetiredSessions {
    capacity: usize,
    order: VecDeque<SessionId>,
    members: HashSet<SessionId>,
}

impl RetiredSessions {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    pub fn retire(&mut self, session_id: SessionId) {
        if self.capacity == 0 || !self.members.insert(session_id.clone()) {
            return;
        }
        self.order.push_back(session_id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.members.contains(session_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut retired = RetiredSessions::new(2);
        retired.retire("a".into());
        retired.retire("b".into());
        retired.retire("c".into());

        assert!(!retired.contains(&"a".into()));
        assert!(retired.contains(&"b".into()));
        assert!(retired.contains(&"c".into()));
        assert_eq!(retired.len(), 2);
    }

    #[test]
    fn retiring_twice_keeps_one_entry() {
        let mut retired = RetiredSessions::new(4);
        retired.retire("a".into());
        retired.retire("a".into());
        assert_eq!(retired.len(), 1);
    }

    #[test]
    fn zero_capacity_remembers_nothing() {
        let mut retired = RetiredSessions::new(0);
        retired.retire("a".into());
        assert!(retired.is_empty());
    }
}
