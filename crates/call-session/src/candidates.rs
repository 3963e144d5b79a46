//! Remote candidate bookkeeping.
//!
//! Candidates and the remote description arrive on independent feeds, so a
//! candidate may show up before there is a remote description to apply it
//! to. [`CandidateLedger`] queues those and hands them back once the remote
//! description is set, and drops anything already seen by
//! [`CandidateKey`].

use crate::model::{CandidateKey, IceCandidate};
use std::collections::HashSet;

/// What to do with an incoming remote candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Already applied or queued.
    Duplicate,
    /// Held until the remote description is set.
    Queued,
    /// Apply now.
    Apply(IceCandidate),
}

#[derive(Debug, Default)]
pub struct CandidateLedger {
    seen: HashSet<CandidateKey>,
    pending: Vec<IceCandidate>,
    remote_ready: bool,
}

impl CandidateLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, candidate: IceCandidate) -> Admission {
        if !self.seen.insert(candidate.key()) {
            return Admission::Duplicate;
        }
        if self.remote_ready {
            Admission::Apply(candidate)
        } else {
            self.pending.push(candidate);
            Admission::Queued
        }
    }

    /// Mark the remote description as set and drain the queue in arrival
    /// order. Later calls return nothing.
    pub fn mark_remote_ready(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        std::mem::take(&mut self.pending)
    }

    #[must_use]
    pub fn is_remote_ready(&self) -> bool {
        self.remote_ready
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn candidate(descriptor: &str, mline: u16) -> IceCandidate {
        IceCandidate {
            candidate: descriptor.to_string(),
            sdp_mid: Some(mline.to_string()),
            sdp_mline_index: Some(mline),
            username_fragment: None,
        }
    }

    #[test]
    fn test_candidates_before_remote_description_are_queued() {
        let mut ledger = CandidateLedger::new();

        assert_eq!(ledger.accept(candidate("a", 0)), Admission::Queued);
        assert_eq!(ledger.accept(candidate("b", 1)), Admission::Queued);
        assert_eq!(ledger.pending(), 2);

        let flushed = ledger.mark_remote_ready();
        assert_eq!(flushed, vec![candidate("a", 0), candidate("b", 1)]);
        assert!(ledger.mark_remote_ready().is_empty());

        let c = candidate("c", 0);
        assert_eq!(ledger.accept(c.clone()), Admission::Apply(c));
    }

    #[test]
    fn test_duplicates_are_dropped_whether_queued_or_applied() {
        let mut ledger = CandidateLedger::new();

        ledger.accept(candidate("a", 0));
        assert_eq!(ledger.accept(candidate("a", 0)), Admission::Duplicate);

        ledger.mark_remote_ready();
        assert_eq!(ledger.accept(candidate("a", 0)), Admission::Duplicate);

        // Same descriptor on another media line is a different candidate
        assert!(matches!(ledger.accept(candidate("a", 1)), Admission::Apply(_)));
    }
}
