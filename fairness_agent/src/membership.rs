//! Stands in for a real service-group membership oracle.
//! `StaticMembershipOracle` is seeded from configuration
//! (`fairness.peers` plus the local host) and is deliberately the
//! thinnest possible backend: a real deployment would plug in whatever
//! service-discovery system the cloud already runs.

use std::collections::HashSet;
use std::sync::RwLock;

/// Returns the set of hosts currently considered live members of the
/// fairness service group. Treated as unavailable is modeled by
/// returning an empty set, which the caller (see `supply.rs`,
/// `agent.rs`) already treats as "readiness becomes false".
pub trait MembershipOracle: Send + Sync {
    fn live_members(&self) -> HashSet<String>;
}

pub struct StaticMembershipOracle {
    members: RwLock<HashSet<String>>,
}

impl StaticMembershipOracle {
    pub fn new(members: Vec<String>) -> Self {
        Self {
            members: RwLock::new(members.into_iter().collect()),
        }
    }

    /// Test/operational hook: update the live set, e.g. in response to
    /// a config reload.
    pub fn set_members(&self, members: Vec<String>) {
        let mut guard = self.members.write().expect("membership lock poisoned");
        *guard = members.into_iter().collect();
    }
}

impl MembershipOracle for StaticMembershipOracle {
    fn live_members(&self) -> HashSet<String> {
        self.members
            .read()
            .expect("membership lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_configured_members() {
        let oracle = StaticMembershipOracle::new(vec!["a".into(), "b".into()]);
        let members = oracle.live_members();
        assert!(members.contains("a"));
        assert!(members.contains("b"));
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn set_members_replaces_the_live_set() {
        let oracle = StaticMembershipOracle::new(vec!["a".into()]);
        oracle.set_members(vec!["b".into(), "c".into()]);
        let members = oracle.live_members();
        assert!(!members.contains("a"));
        assert!(members.contains("b") && members.contains("c"));
    }
}
