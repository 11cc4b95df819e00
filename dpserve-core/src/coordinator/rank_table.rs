//! Rank assignment table
//!
//! Maps global data-parallel ranks to the node and local slot that serve
//! them. Mutable while registrations are open, then sealed once into an
//! immutable [`SealedRankTable`] that is shared read-only.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ClusterError, Result};
use crate::router::health::{ShardEndpoint, ShardHealth};

/// Cluster-wide data-parallel rank
pub type GlobalRank = u32;

/// Identity of one physical node taking part in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Address peers use to reach this node
    pub address: String,
    /// Control port for discovery and shard traffic
    pub rpc_port: u16,
    /// Number of data-parallel shards served by this node
    pub local_shard_count: u32,
}

impl NodeDescriptor {
    pub fn new(address: impl Into<String>, rpc_port: u16, local_shard_count: u32) -> Self {
        Self {
            address: address.into(),
            rpc_port,
            local_shard_count,
        }
    }

    /// Base URL of the node's control listener
    pub fn control_url(&self) -> String {
        format!("http://{}:{}", self.address, self.rpc_port)
    }

    fn same_endpoint(&self, other: &NodeDescriptor) -> bool {
        self.address == other.address && self.rpc_port == other.rpc_port
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.rpc_port)
    }
}

/// Half-open range of global ranks `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RankRange {
    pub start: GlobalRank,
    pub end: GlobalRank,
}

impl RankRange {
    pub fn new(start: GlobalRank, len: u32) -> Self {
        Self { start, end: start.saturating_add(len) }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, rank: GlobalRank) -> bool {
        rank >= self.start && rank < self.end
    }

    pub fn overlaps(&self, other: &RankRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn iter(&self) -> Range<GlobalRank> {
        self.start..self.end
    }
}

impl fmt::Display for RankRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Device slots that jointly hold one model replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorParallelGroup {
    /// Group id, equal to the global rank it serves
    pub id: GlobalRank,
    /// Number of device slots in the group
    pub size: u32,
    /// First node-local device slot
    pub first_device: u32,
}

impl TensorParallelGroup {
    pub fn for_local_rank(id: GlobalRank, local_rank: u32, size: u32) -> Self {
        Self {
            id,
            size,
            first_device: local_rank * size,
        }
    }

    /// Node-local device slots owned by this group
    pub fn devices(&self) -> Range<u32> {
        self.first_device..self.first_device + self.size
    }
}

/// Where one global rank lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankAssignment {
    pub rank: GlobalRank,
    pub node: NodeDescriptor,
    pub local_rank: u32,
    pub tp_group: TensorParallelGroup,
}

/// Mutable table owned by the head coordinator during bring-up
#[derive(Debug)]
pub struct RankAssignmentTable {
    base_rank: GlobalRank,
    total: u32,
    tp_size: u32,
    registrations: Vec<(NodeDescriptor, RankRange)>,
    sealed: Option<Arc<SealedRankTable>>,
}

impl RankAssignmentTable {
    /// Create an empty table for `total` ranks starting at `base_rank`
    pub fn new(base_rank: GlobalRank, total: u32, tp_size: u32) -> Self {
        Self {
            base_rank,
            total,
            tp_size,
            registrations: Vec::new(),
            sealed: None,
        }
    }

    /// Rank range the cluster declares
    pub fn cluster_range(&self) -> RankRange {
        RankRange::new(self.base_rank, self.total)
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn tp_size(&self) -> u32 {
        self.tp_size
    }

    /// Register `local_rank_count` ranks for `node`.
    ///
    /// A descriptor that already registered gets its original range back,
    /// even after sealing. Without a hint the lowest free block is used.
    pub fn register(
        &mut self,
        node: NodeDescriptor,
        local_rank_count: u32,
        start_rank_hint: Option<GlobalRank>,
    ) -> Result<RankRange> {
        if let Some(range) = self.range_for(&node) {
            debug!(node = %node, range = %range, "Repeated registration, returning existing range");
            return Ok(range);
        }

        if self.sealed.is_some() {
            return Err(ClusterError::TableSealed { node: node.to_string() });
        }

        if local_rank_count == 0 {
            return Err(ClusterError::InvalidConfiguration {
                reason: format!("node {} registered with zero local ranks", node),
            });
        }

        if let Some((owner, range)) = self.registrations.iter().find(|(n, _)| n.same_endpoint(&node)) {
            return Err(ClusterError::DuplicateRank {
                start: range.start,
                end: range.end,
                owner: owner.to_string(),
            });
        }

        let start = match start_rank_hint {
            Some(hint) => hint,
            None => self.first_free_block(local_rank_count),
        };
        let cluster = self.cluster_range();
        // The hint comes off the wire
        let Some(end) = start.checked_add(local_rank_count) else {
            return Err(ClusterError::RankOutOfRange {
                start,
                end: GlobalRank::MAX,
                base: cluster.start,
                limit: cluster.end,
            });
        };
        let range = RankRange { start, end };

        if range.start < cluster.start || range.end > cluster.end {
            return Err(ClusterError::RankOutOfRange {
                start: range.start,
                end: range.end,
                base: cluster.start,
                limit: cluster.end,
            });
        }

        if let Some((owner, _)) = self.registrations.iter().find(|(_, r)| r.overlaps(&range)) {
            return Err(ClusterError::DuplicateRank {
                start: range.start,
                end: range.end,
                owner: owner.to_string(),
            });
        }

        info!(node = %node, range = %range, "Registered ranks");
        self.registrations.push((node, range));
        Ok(range)
    }

    /// Lowest start rank with `len` free ranks after it
    fn first_free_block(&self, len: u32) -> GlobalRank {
        let mut taken: Vec<RankRange> = self.registrations.iter().map(|(_, r)| *r).collect();
        taken.sort_by_key(|r| r.start);

        let mut candidate = self.base_rank;
        for range in taken {
            if range.start >= candidate.saturating_add(len) {
                break;
            }
            candidate = candidate.max(range.end);
        }
        candidate
    }

    /// Number of ranks registered so far
    pub fn registered_count(&self) -> u32 {
        self.registrations.iter().map(|(_, r)| r.len()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.registered_count() == self.total
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// Range previously assigned to `node`
    pub fn range_for(&self, node: &NodeDescriptor) -> Option<RankRange> {
        self.registrations
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, r)| *r)
    }

    /// Nodes in registration order
    pub fn nodes(&self) -> Vec<NodeDescriptor> {
        self.registrations.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Lookup a rank before sealing
    pub fn lookup(&self, rank: GlobalRank) -> Result<&NodeDescriptor> {
        self.registrations
            .iter()
            .find(|(_, r)| r.contains(rank))
            .map(|(n, _)| n)
            .ok_or(ClusterError::UnknownRank { rank })
    }

    /// Close registration and produce the immutable view.
    ///
    /// Sealing happens once; later calls hand back the same view.
    pub fn seal(&mut self) -> Result<Arc<SealedRankTable>> {
        if let Some(sealed) = &self.sealed {
            return Ok(sealed.clone());
        }

        let registered = self.registered_count();
        if registered < self.total {
            return Err(ClusterError::IncompleteCluster {
                registered,
                expected: self.total,
            });
        }

        let mut assignments = Vec::with_capacity(self.total as usize);
        for (node, range) in &self.registrations {
            for (local_rank, rank) in range.iter().enumerate() {
                let local_rank = local_rank as u32;
                assignments.push(RankAssignment {
                    rank,
                    node: node.clone(),
                    local_rank,
                    tp_group: TensorParallelGroup::for_local_rank(rank, local_rank, self.tp_size),
                });
            }
        }
        assignments.sort_by_key(|a| a.rank);

        let sealed = Arc::new(SealedRankTable {
            base_rank: self.base_rank,
            tp_size: self.tp_size,
            assignments,
        });
        sealed.validate()?;

        info!(
            ranks = %self.cluster_range(),
            nodes = self.registrations.len(),
            "Rank table sealed"
        );
        self.sealed = Some(sealed.clone());
        Ok(sealed)
    }
}

/// Immutable rank table shared after sealing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedRankTable {
    base_rank: GlobalRank,
    tp_size: u32,
    assignments: Vec<RankAssignment>,
}

impl SealedRankTable {
    /// Check contiguity and group invariants, used on tables received off the wire
    pub fn validate(&self) -> Result<()> {
        if self.assignments.is_empty() {
            return Err(ClusterError::InvalidMessage {
                reason: "sealed table has no ranks".into(),
            });
        }
        for (idx, assignment) in self.assignments.iter().enumerate() {
            let expected = self.base_rank + idx as u32;
            if assignment.rank != expected {
                return Err(ClusterError::InvalidMessage {
                    reason: format!("sealed table expected rank {} at slot {}, found {}", expected, idx, assignment.rank),
                });
            }
            if assignment.tp_group.id != assignment.rank || assignment.tp_group.size != self.tp_size {
                return Err(ClusterError::InvalidMessage {
                    reason: format!("rank {} carries an inconsistent tensor-parallel group", assignment.rank),
                });
            }
        }
        Ok(())
    }

    pub fn base_rank(&self) -> GlobalRank {
        self.base_rank
    }

    pub fn tp_size(&self) -> u32 {
        self.tp_size
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// All ranks in ascending order
    pub fn ranks(&self) -> impl Iterator<Item = GlobalRank> + '_ {
        self.assignments.iter().map(|a| a.rank)
    }

    pub fn assignments(&self) -> &[RankAssignment] {
        &self.assignments
    }

    pub fn contains(&self, rank: GlobalRank) -> bool {
        self.index_of(rank).is_some()
    }

    /// Position of `rank` in the sealed order
    pub fn index_of(&self, rank: GlobalRank) -> Option<usize> {
        rank.checked_sub(self.base_rank)
            .map(|i| i as usize)
            .filter(|&i| i < self.assignments.len())
    }

    /// Rank at position `index` in the sealed order
    pub fn rank_at(&self, index: usize) -> GlobalRank {
        self.assignments[index].rank
    }

    pub fn lookup(&self, rank: GlobalRank) -> Result<&RankAssignment> {
        self.index_of(rank)
            .map(|i| &self.assignments[i])
            .ok_or(ClusterError::UnknownRank { rank })
    }

    /// Distinct nodes in rank order
    pub fn nodes(&self) -> Vec<NodeDescriptor> {
        let mut nodes: Vec<NodeDescriptor> = Vec::new();
        for assignment in &self.assignments {
            if !nodes.contains(&assignment.node) {
                nodes.push(assignment.node.clone());
            }
        }
        nodes
    }

    /// Ranks served by `node`
    pub fn ranks_for(&self, node: &NodeDescriptor) -> Vec<GlobalRank> {
        self.assignments
            .iter()
            .filter(|a| a.node == *node)
            .map(|a| a.rank)
            .collect()
    }

    /// Initial endpoints for every rank, all `Starting`
    pub fn shard_endpoints(&self) -> Vec<ShardEndpoint> {
        self.assignments
            .iter()
            .map(|a| ShardEndpoint {
                rank: a.rank,
                address: a.node.control_url(),
                health: ShardHealth::Starting,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(addr: &str, shards: u32) -> NodeDescriptor {
        NodeDescriptor::new(addr, 13345, shards)
    }

    #[test]
    fn test_scenario_head_at_offset() {
        let mut table = RankAssignmentTable::new(4, 12, 2);
        let head = node("10.0.0.1", 4);

        assert_eq!(table.register(head.clone(), 4, Some(4)).unwrap(), RankRange::new(4, 4));
        table.register(node("10.0.0.2", 4), 4, Some(8)).unwrap();
        table.register(node("10.0.0.3", 4), 4, Some(12)).unwrap();

        let sealed = table.seal().unwrap();
        assert_eq!(sealed.ranks().collect::<Vec<_>>(), (4..16).collect::<Vec<_>>());
        assert_eq!(sealed.ranks_for(&head), vec![4, 5, 6, 7]);

        let rank6 = sealed.lookup(6).unwrap();
        assert_eq!(rank6.local_rank, 2);
        assert_eq!(rank6.tp_group.devices(), 4..6);
    }

    #[test]
    fn test_idempotent_registration() {
        let mut table = RankAssignmentTable::new(0, 8, 1);
        let child = node("10.0.0.2", 4);

        let first = table.register(child.clone(), 4, None).unwrap();
        let second = table.register(child.clone(), 4, Some(4)).unwrap();
        assert_eq!(first, second);
        assert_eq!(table.range_for(&child), Some(first));
        assert_eq!(table.registered_count(), 4);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut table = RankAssignmentTable::new(0, 8, 1);
        table.register(node("a", 4), 4, Some(0)).unwrap();

        let err = table.register(node("b", 4), 4, Some(2)).unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateRank { start: 2, end: 6, .. }));
    }

    #[test]
    fn test_same_endpoint_different_descriptor_rejected() {
        let mut table = RankAssignmentTable::new(0, 8, 1);
        table.register(node("a", 4), 4, Some(0)).unwrap();

        let err = table.register(node("a", 2), 2, Some(4)).unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateRank { .. }));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut table = RankAssignmentTable::new(0, 4, 1);
        let err = table.register(node("a", 4), 4, Some(2)).unwrap_err();
        assert!(matches!(err, ClusterError::RankOutOfRange { .. }));
    }

    #[test]
    fn test_overflowing_hint_rejected() {
        let mut table = RankAssignmentTable::new(0, 4, 1);
        let err = table.register(node("a", 4), 4, Some(u32::MAX - 1)).unwrap_err();
        assert_eq!(
            err,
            ClusterError::RankOutOfRange { start: u32::MAX - 1, end: u32::MAX, base: 0, limit: 4 }
        );
        assert_eq!(table.registered_count(), 0);
        assert_eq!(table.range_for(&node("a", 4)), None);
    }

    #[test]
    fn test_first_fit_without_hint() {
        let mut table = RankAssignmentTable::new(0, 6, 1);
        table.register(node("a", 2), 2, Some(2)).unwrap();

        assert_eq!(table.register(node("b", 2), 2, None).unwrap(), RankRange::new(0, 2));
        assert_eq!(table.register(node("c", 2), 2, None).unwrap(), RankRange::new(4, 2));
        assert!(table.is_complete());
    }

    #[test]
    fn test_seal_incomplete() {
        let mut table = RankAssignmentTable::new(0, 4, 1);
        table.register(node("a", 2), 2, None).unwrap();

        let err = table.seal().unwrap_err();
        assert_eq!(err, ClusterError::IncompleteCluster { registered: 2, expected: 4 });
    }

    #[test]
    fn test_registration_closed_after_seal() {
        let mut table = RankAssignmentTable::new(0, 2, 1);
        let a = node("a", 2);
        table.register(a.clone(), 2, None).unwrap();
        let first = table.seal().unwrap();

        assert!(matches!(table.register(node("b", 1), 1, None), Err(ClusterError::TableSealed { .. })));
        assert_eq!(table.register(a, 2, None).unwrap(), RankRange::new(0, 2));
        assert!(Arc::ptr_eq(&first, &table.seal().unwrap()));
    }

    #[test]
    fn test_sealed_table_lookup_bounds() {
        let mut table = RankAssignmentTable::new(2, 2, 1);
        table.register(node("a", 2), 2, None).unwrap();
        let sealed = table.seal().unwrap();

        assert!(sealed.contains(3));
        assert!(!sealed.contains(1));
        assert!(matches!(sealed.lookup(4), Err(ClusterError::UnknownRank { rank: 4 })));

        let endpoints = sealed.shard_endpoints();
        assert_eq!(endpoints.iter().map(|e| e.rank).collect::<Vec<_>>(), vec![2, 3]);
        assert!(endpoints.iter().all(|e| e.health == ShardHealth::Starting && e.address == "http://a:13345"));
    }
}
