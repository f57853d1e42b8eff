//! Per-peer bounded FIFO queues of received heaviness maps. Absorbs
//! bursts while a reallocation round is in progress, the same role
//! `self._fairness_heavinesses` (a dict of `Queue.Queue`) plays in
//! `manager.py`.

use crate::metrics::VmMetricEntry;
use std::collections::{HashMap, HashSet, VecDeque};

pub type HeavinessMap = HashMap<String, VmMetricEntry>;

pub struct HeavinessExchange {
    queues: HashMap<String, VecDeque<HeavinessMap>>,
    max_queue_depth: usize,
}

impl HeavinessExchange {
    pub fn new(max_queue_depth: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_queue_depth: max_queue_depth.max(1),
        }
    }

    /// Enqueues one peer's heaviness map. Never blocks; if the queue
    /// is already at capacity the oldest entry is dropped to absorb
    /// the burst rather than apply backpressure.
    pub fn enqueue(&mut self, compute_host: String, map: HeavinessMap) {
        for (instance_name, entry) in &map {
            log::debug!("instance {instance_name} got heaviness {}", entry.heaviness);
        }
        let queue = self.queues.entry(compute_host).or_default();
        if queue.len() >= self.max_queue_depth {
            queue.pop_front();
        }
        queue.push_back(map);
    }

    fn purge_departed(&mut self, live_members: &HashSet<String>) {
        self.queues.retain(|host, _| live_members.contains(host));
    }

    /// `true` iff every live member's queue holds at least one entry.
    /// Purges queues for members that have since departed.
    pub fn all_collected(&mut self, live_members: &HashSet<String>) -> bool {
        self.purge_departed(live_members);
        if live_members.is_empty() {
            return false;
        }
        live_members
            .iter()
            .all(|host| self.queues.get(host).is_some_and(|q| !q.is_empty()))
    }

    /// Pops one map per peer for this reallocation round.
    pub fn pop_round(&mut self) -> HashMap<String, HeavinessMap> {
        self.queues
            .iter_mut()
            .filter_map(|(host, queue)| queue.pop_front().map(|map| (host.clone(), map)))
            .collect()
    }

    /// `user_id`s carried by every currently queued entry, across every
    /// peer's last-reported heaviness maps. Non-destructive: used to
    /// fold peers' last-known tenancy into `userCount()` without
    /// consuming the round a pending `reallocate()` still needs.
    pub fn known_user_ids(&self) -> HashSet<String> {
        self.queues
            .values()
            .flat_map(|queue| queue.iter())
            .flat_map(|map| map.values())
            .filter_map(|entry| entry.user_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(heaviness: f64) -> VmMetricEntry {
        VmMetricEntry {
            compute_host: Some("host-a".to_string()),
            user_id: Some("user-1".to_string()),
            normalized_endowment: 1.0,
            heaviness,
        }
    }

    #[test]
    fn all_collected_false_until_every_live_member_reports() {
        let live: HashSet<String> = ["a".into(), "b".into(), "c".into()].into_iter().collect();
        let mut exchange = HeavinessExchange::new(16);

        exchange.enqueue("a".into(), HashMap::from([("vm1".into(), entry(1.0))]));
        exchange.enqueue("b".into(), HashMap::from([("vm2".into(), entry(2.0))]));
        assert!(!exchange.all_collected(&live));

        exchange.enqueue("c".into(), HashMap::from([("vm3".into(), entry(3.0))]));
        assert!(exchange.all_collected(&live));
    }

    #[test]
    fn departed_peer_is_purged_and_no_longer_required() {
        let mut exchange = HeavinessExchange::new(16);
        exchange.enqueue("a".into(), HashMap::from([("vm1".into(), entry(1.0))]));
        exchange.enqueue("b".into(), HashMap::from([("vm2".into(), entry(2.0))]));

        let live_without_b: HashSet<String> = ["a".into()].into_iter().collect();
        assert!(exchange.all_collected(&live_without_b));
        assert!(!exchange.queues.contains_key("b"));
    }

    #[test]
    fn queue_depth_is_bounded() {
        let mut exchange = HeavinessExchange::new(2);
        for i in 0..5 {
            exchange.enqueue("a".into(), HashMap::from([(format!("vm{i}"), entry(i as f64))]));
        }
        assert_eq!(exchange.queues["a"].len(), 2);
    }

    #[test]
    fn known_user_ids_unions_across_peers_without_consuming_the_queue() {
        let mut exchange = HeavinessExchange::new(16);
        exchange.enqueue(
            "a".into(),
            HashMap::from([(
                "vm1".into(),
                VmMetricEntry {
                    compute_host: Some("a".to_string()),
                    user_id: Some("tenant-1".to_string()),
                    normalized_endowment: 1.0,
                    heaviness: 1.0,
                },
            )]),
        );
        exchange.enqueue(
            "b".into(),
            HashMap::from([(
                "vm2".into(),
                VmMetricEntry {
                    compute_host: Some("b".to_string()),
                    user_id: Some("tenant-2".to_string()),
                    normalized_endowment: 1.0,
                    heaviness: 2.0,
                },
            )]),
        );

        let known = exchange.known_user_ids();
        assert_eq!(
            known,
            HashSet::from(["tenant-1".to_string(), "tenant-2".to_string()])
        );
        // Reading known_user_ids must not pop anything a pending
        // reallocation still needs.
        let round = exchange.pop_round();
        assert_eq!(round.len(), 2);
    }

    #[test]
    fn pop_round_returns_one_map_per_peer() {
        let mut exchange = HeavinessExchange::new(16);
        exchange.enqueue("a".into(), HashMap::from([("vm1".into(), entry(1.0))]));
        exchange.enqueue("b".into(), HashMap::from([("vm2".into(), entry(2.0))]));

        let round = exchange.pop_round();
        assert_eq!(round.len(), 2);
        assert!(round.contains_key("a") && round.contains_key("b"));
    }
}
