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

//! Cluster-membership types delivered by the discovery layer. These never
//! cross the exchange transport, so they stay plain Rust types.

use std::collections::HashMap;

use super::{EventKind, ExchangeId, FullMessage, GroupAffinity, TopologyVersion};

/// A cluster member as the discovery layer sees it. `order` is the position
/// in the discovery total order; the lowest-ordered live server is the
/// exchange coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeDesc {
    pub id: u64,
    pub order: u64,
    pub client: bool,
}

impl NodeDesc {
    pub fn server(id: u64, order: u64) -> Self {
        NodeDesc {
            id,
            order,
            client: false,
        }
    }

    pub fn client(id: u64, order: u64) -> Self {
        NodeDesc {
            id,
            order,
            client: true,
        }
    }
}

/// Immutable snapshot of cluster membership at one topology version.
/// `nodes` is sorted by discovery order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub version: TopologyVersion,
    pub nodes: Vec<NodeDesc>,
}

impl TopologySnapshot {
    pub fn new(version: TopologyVersion, mut nodes: Vec<NodeDesc>) -> Self {
        nodes.sort_by_key(|n| n.order);
        TopologySnapshot { version, nodes }
    }

    /// Server nodes in discovery order.
    pub fn server_nodes(&self) -> Vec<NodeDesc> {
        self.nodes.iter().filter(|n| !n.client).copied().collect()
    }

    pub fn node(&self, id: u64) -> Option<NodeDesc> {
        self.nodes.iter().find(|n| n.id == id).copied()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.node(id).is_some()
    }
}

/// Batched cache lifecycle change delivered as a custom discovery message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheChangeBatch {
    pub start_groups: Vec<u64>,
    pub stop_groups: Vec<u64>,
    /// Groups whose LOST partitions the operator asked to reset.
    pub reset_lost_groups: Vec<u64>,
}

impl CacheChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.start_groups.is_empty()
            && self.stop_groups.is_empty()
            && self.reset_lost_groups.is_empty()
    }
}

/// Affinity change message. Doubles as the operator-initiated affinity
/// change request (no `exchange_id`) and as the coordinator's centralized
/// full-map distribution over the discovery ring (`exchange_id` set).
#[derive(Clone, Debug, PartialEq)]
pub struct AffinityChangeMessage {
    pub exchange_id: Option<ExchangeId>,
    pub partitions: Option<FullMessage>,
    pub assignments: HashMap<u64, GroupAffinity>,
}

/// Custom payloads carried by discovery events.
#[derive(Clone, Debug, PartialEq)]
pub enum CustomMessage {
    /// Cluster activation / deactivation request.
    ChangeGlobalState { request_id: u64, activate: bool },
    /// Activation / deactivation outcome, published by the coordinator.
    ChangeGlobalStateFinish { request_id: u64, active: bool },
    /// Dynamic cache start/stop batch.
    CacheChange(CacheChangeBatch),
    /// Affinity change request or centralized full-map distribution.
    AffinityChange(AffinityChangeMessage),
    /// Cluster-wide snapshot trigger.
    Snapshot { snapshot_id: u64 },
}

/// An ordered event from the discovery layer. `snapshot` is the cluster
/// membership after the event was applied.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveryEvent {
    pub kind: EventKind,
    pub node: NodeDesc,
    pub custom: Option<CustomMessage>,
    pub snapshot: TopologySnapshot,
}

impl DiscoveryEvent {
    pub fn version(&self) -> TopologyVersion {
        self.snapshot.version
    }

    pub fn exchange_id(&self) -> ExchangeId {
        ExchangeId::new(self.snapshot.version, self.node.id, self.kind)
    }

    pub fn is_custom(&self) -> bool {
        self.kind == EventKind::Custom
    }

    /// True when the event adds or removes a server node.
    pub fn is_server_membership(&self) -> bool {
        !self.is_custom() && !self.node.client
    }
}
