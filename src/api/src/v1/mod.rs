// Copyright 2026 The Tessera Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire-level types of the partition exchange protocol.
//!
//! The message structs carry `prost` derives directly instead of being
//! generated from .proto files, but keep the field-tag discipline so the
//! encoding is a stable protobuf encoding.

mod cluster;

use std::cmp::Ordering;
use std::collections::HashMap;

pub use self::cluster::{
    AffinityChangeMessage, CacheChangeBatch, CustomMessage, DiscoveryEvent, NodeDesc,
    TopologySnapshot,
};

/// Topology version: `major` increments per discovery event, `minor` per
/// intra-version custom message.
#[derive(Copy, Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct TopologyVersion {
    #[prost(uint64, tag = "1")]
    pub major: u64,
    #[prost(uint64, tag = "2")]
    pub minor: u64,
}

impl TopologyVersion {
    pub const ZERO: TopologyVersion = TopologyVersion { major: 0, minor: 0 };

    pub fn new(major: u64, minor: u64) -> Self {
        TopologyVersion { major, minor }
    }

    pub fn next_major(self) -> Self {
        TopologyVersion::new(self.major + 1, 0)
    }

    pub fn next_minor(self) -> Self {
        TopologyVersion::new(self.major, self.minor + 1)
    }
}

impl PartialOrd for TopologyVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TopologyVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

impl std::fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.major, self.minor)
    }
}

/// The kind of discovery event that initiated an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventKind {
    Joined = 0,
    Left = 1,
    Failed = 2,
    Custom = 3,
}

impl EventKind {
    /// True for events that remove a node from the cluster.
    pub fn is_departure(self) -> bool {
        matches!(self, EventKind::Left | EventKind::Failed)
    }
}

/// Totally-ordered exchange identifier. Ordering derives lexicographically
/// from the topology version; equality is by the whole triple.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct ExchangeId {
    #[prost(message, optional, tag = "1")]
    pub topology_version: Option<TopologyVersion>,
    #[prost(uint64, tag = "2")]
    pub initiator: u64,
    #[prost(enumeration = "EventKind", tag = "3")]
    pub event_kind: i32,
}

impl ExchangeId {
    pub fn new(version: TopologyVersion, initiator: u64, kind: EventKind) -> Self {
        ExchangeId {
            topology_version: Some(version),
            initiator,
            event_kind: kind as i32,
        }
    }

    pub fn version(&self) -> TopologyVersion {
        self.topology_version.unwrap_or(TopologyVersion::ZERO)
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_i32(self.event_kind).unwrap_or(EventKind::Custom)
    }

    pub fn is_joined(&self) -> bool {
        self.kind() == EventKind::Joined
    }

    pub fn is_left(&self) -> bool {
        self.kind().is_departure()
    }
}

impl PartialOrd for ExchangeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExchangeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version()
            .cmp(&other.version())
            .then_with(|| self.initiator.cmp(&other.initiator))
            .then_with(|| self.event_kind.cmp(&other.event_kind))
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.version(), self.initiator)
    }
}

/// Per-partition replica state as reported over the wire. `Unknown` stands
/// for "partition not present on the node".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PartitionState {
    Unknown = 0,
    Owning = 1,
    Moving = 2,
    Renting = 3,
    Lost = 4,
    Evicted = 5,
}

/// One node's view of one group's partitions.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionMap {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
    #[prost(uint64, tag = "2")]
    pub update_seq: u64,
    #[prost(message, optional, tag = "3")]
    pub top_ver: Option<TopologyVersion>,
    #[prost(map = "uint32, enumeration(PartitionState)", tag = "4")]
    pub parts: HashMap<u32, i32>,
}

impl PartitionMap {
    pub fn state(&self, part: u32) -> PartitionState {
        self.parts
            .get(&part)
            .and_then(|s| PartitionState::from_i32(*s))
            .unwrap_or(PartitionState::Unknown)
    }

    pub fn set(&mut self, part: u32, state: PartitionState) {
        self.parts.insert(part, state as i32);
    }
}

/// The cluster-wide view of one group's partitions, keyed by node id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FullPartitionMap {
    #[prost(map = "uint64, message", tag = "1")]
    pub maps: HashMap<u64, PartitionMap>,
    #[prost(uint64, tag = "2")]
    pub update_seq: u64,
}

/// Update counter pair: `init` is the counter at the moment rebalance
/// started (stable while MOVING), `applied` the highest applied counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct CounterPair {
    #[prost(uint64, tag = "1")]
    pub init: u64,
    #[prost(uint64, tag = "2")]
    pub applied: u64,
}

impl CounterPair {
    pub fn new(init: u64, applied: u64) -> Self {
        CounterPair { init, applied }
    }
}

/// Per-group update counters, keyed by partition id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionCounters {
    #[prost(map = "uint32, message", tag = "1")]
    pub counters: HashMap<u32, CounterPair>,
}

/// Per-group reserved history counters, keyed by partition id. A node that
/// reports `counter` here can serve WAL-based rebalance from it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HistoryCounters {
    #[prost(map = "uint32, uint64", tag = "1")]
    pub counters: HashMap<u32, u64>,
}

/// Assignment of a history range to a supplier node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HistorySupplier {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
    #[prost(uint64, tag = "2")]
    pub group_id: u64,
    #[prost(uint32, tag = "3")]
    pub partition: u32,
    #[prost(uint64, tag = "4")]
    pub counter: u64,
}

/// Set of partitions, used in nested map payloads.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionSet {
    #[prost(uint32, repeated, tag = "1")]
    pub parts: Vec<u32>,
}

/// Partitions needing full reload on one node, keyed by group id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GroupPartitions {
    #[prost(map = "uint64, message", tag = "1")]
    pub groups: HashMap<u64, PartitionSet>,
}

/// Affinity assignment of one group: for every partition the ordered list
/// of candidate owner nodes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GroupAffinity {
    #[prost(message, repeated, tag = "1")]
    pub assignments: Vec<PartitionAssignment>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionAssignment {
    #[prost(uint32, tag = "1")]
    pub partition: u32,
    #[prost(uint64, repeated, tag = "2")]
    pub nodes: Vec<u64>,
}

/// Single-message: a node's local partition maps and counters, sent to the
/// coordinator during the collect phase.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SingleMessage {
    #[prost(message, optional, tag = "1")]
    pub exchange_id: Option<ExchangeId>,
    #[prost(bool, tag = "2")]
    pub client: bool,
    #[prost(map = "uint64, message", tag = "3")]
    pub partitions: HashMap<u64, PartitionMap>,
    #[prost(map = "uint64, message", tag = "4")]
    pub update_counters: HashMap<u64, PartitionCounters>,
    #[prost(map = "uint64, message", tag = "5")]
    pub history_counters: HashMap<u64, HistoryCounters>,
    #[prost(uint64, tag = "6")]
    pub last_version: u64,
    #[prost(string, optional, tag = "7")]
    pub error: Option<String>,
    #[prost(uint64, repeated, tag = "8")]
    pub groups_affinity_request: Vec<u64>,
    #[prost(bool, tag = "9")]
    pub restore_state: bool,
    #[prost(message, optional, tag = "10")]
    pub restore_exchange_id: Option<ExchangeId>,
    #[prost(message, optional, boxed, tag = "11")]
    pub finish_message: Option<Box<FullMessage>>,
}

impl SingleMessage {
    /// The trivial message a client node sends: no partitions to report.
    pub fn client(exchange_id: ExchangeId) -> Self {
        SingleMessage {
            exchange_id: Some(exchange_id),
            client: true,
            ..Default::default()
        }
    }

    pub fn exchange_id(&self) -> &ExchangeId {
        self.exchange_id.as_ref().expect("exchange id is required")
    }

    pub fn history_counter(&self, group_id: u64, part: u32) -> Option<u64> {
        self.history_counters
            .get(&group_id)
            .and_then(|h| h.counters.get(&part))
            .copied()
    }
}

/// Full-message: the coordinator's decided partition map, counters, history
/// suppliers and reload sets, distributed to every participant.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FullMessage {
    #[prost(message, optional, tag = "1")]
    pub exchange_id: Option<ExchangeId>,
    #[prost(map = "uint64, message", tag = "2")]
    pub partitions: HashMap<u64, FullPartitionMap>,
    #[prost(map = "uint64, message", tag = "3")]
    pub update_counters: HashMap<u64, PartitionCounters>,
    #[prost(message, repeated, tag = "4")]
    pub history_suppliers: Vec<HistorySupplier>,
    #[prost(map = "uint64, message", tag = "5")]
    pub parts_to_reload: HashMap<u64, GroupPartitions>,
    #[prost(uint64, tag = "6")]
    pub last_version: u64,
    #[prost(message, optional, tag = "7")]
    pub result_topology_version: Option<TopologyVersion>,
    #[prost(map = "uint64, message", tag = "8")]
    pub ideal_affinity_diff: HashMap<u64, GroupAffinity>,
    #[prost(map = "uint64, string", tag = "9")]
    pub errors: HashMap<u64, String>,
    #[prost(map = "uint64, message", tag = "10")]
    pub joined_node_affinity: HashMap<u64, GroupAffinity>,
}

impl FullMessage {
    pub fn exchange_id(&self) -> &ExchangeId {
        self.exchange_id.as_ref().expect("exchange id is required")
    }

    /// Result version carried by the message, or `fallback` for the
    /// pre-merge protocol which leaves the field unset.
    pub fn result_version_or(&self, fallback: TopologyVersion) -> TopologyVersion {
        self.result_topology_version.unwrap_or(fallback)
    }

    pub fn supplier(&self, group_id: u64, part: u32) -> Option<(u64, u64)> {
        self.history_suppliers
            .iter()
            .find(|s| s.group_id == group_id && s.partition == part)
            .map(|s| (s.node_id, s.counter))
    }

    pub fn parts_to_reload(&self, node_id: u64, group_id: u64) -> Vec<u32> {
        self.parts_to_reload
            .get(&node_id)
            .and_then(|g| g.groups.get(&group_id))
            .map(|s| s.parts.clone())
            .unwrap_or_default()
    }

    pub fn add_part_to_reload(&mut self, node_id: u64, group_id: u64, part: u32) {
        self.parts_to_reload
            .entry(node_id)
            .or_default()
            .groups
            .entry(group_id)
            .or_default()
            .parts
            .push(part);
    }
}

/// Single-request: probe from a (possibly new) coordinator asking a server
/// for its single-message, optionally restoring in-progress exchange state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SingleRequest {
    #[prost(message, optional, tag = "1")]
    pub exchange_id: Option<ExchangeId>,
    #[prost(bool, tag = "2")]
    pub restore_state: bool,
    #[prost(message, optional, tag = "3")]
    pub restore_exchange_id: Option<ExchangeId>,
}

impl SingleRequest {
    pub fn new(exchange_id: ExchangeId) -> Self {
        SingleRequest {
            exchange_id: Some(exchange_id),
            ..Default::default()
        }
    }

    pub fn restore(exchange_id: ExchangeId, restore_id: ExchangeId) -> Self {
        SingleRequest {
            exchange_id: Some(exchange_id),
            restore_state: true,
            restore_exchange_id: Some(restore_id),
        }
    }

    pub fn exchange_id(&self) -> &ExchangeId {
        self.exchange_id.as_ref().expect("exchange id is required")
    }
}

/// Transport envelope for the exchange messages.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(oneof = "envelope::Payload", tags = "1, 2, 3")]
    pub payload: Option<envelope::Payload>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Single(super::SingleMessage),
        #[prost(message, tag = "2")]
        Full(super::FullMessage),
        #[prost(message, tag = "3")]
        SingleRequest(super::SingleRequest),
    }
}

impl Envelope {
    pub fn single(msg: SingleMessage) -> Self {
        Envelope {
            payload: Some(envelope::Payload::Single(msg)),
        }
    }

    pub fn full(msg: FullMessage) -> Self {
        Envelope {
            payload: Some(envelope::Payload::Full(msg)),
        }
    }

    pub fn single_request(msg: SingleRequest) -> Self {
        Envelope {
            payload: Some(envelope::Payload::SingleRequest(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_version_order() {
        let v10 = TopologyVersion::new(1, 0);
        let v11 = TopologyVersion::new(1, 1);
        let v20 = TopologyVersion::new(2, 0);
        assert!(v10 < v11);
        assert!(v11 < v20);
        assert_eq!(v10.next_major(), v20);
        assert_eq!(v10.next_minor(), v11);
    }

    #[test]
    fn exchange_id_orders_by_version() {
        let a = ExchangeId::new(TopologyVersion::new(2, 0), 7, EventKind::Joined);
        let b = ExchangeId::new(TopologyVersion::new(3, 0), 1, EventKind::Left);
        assert!(a < b);
        assert_ne!(a, b);

        let c = ExchangeId::new(TopologyVersion::new(2, 0), 7, EventKind::Joined);
        assert_eq!(a, c);
    }

    #[test]
    fn envelope_round_trip() {
        use prost::Message;

        let id = ExchangeId::new(TopologyVersion::new(4, 0), 3, EventKind::Joined);
        let mut msg = SingleMessage::client(id.clone());
        msg.last_version = 17;

        let bytes = Envelope::single(msg.clone()).encode_to_vec();
        let decoded = Envelope::decode(bytes.as_slice()).unwrap();
        match decoded.payload {
            Some(envelope::Payload::Single(got)) => {
                assert_eq!(got, msg);
                assert_eq!(got.exchange_id(), &id);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
