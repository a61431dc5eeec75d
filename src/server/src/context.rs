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

//! The shared context: every collaborator the exchange core calls, passed
//! by reference. There are no ambient singletons.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tessera_api::v1::{
    AffinityChangeMessage, CacheChangeBatch, CustomMessage, ExchangeId, FullMessage, NodeDesc,
    TopologySnapshot, TopologyVersion,
};

use crate::{topology::GroupTopology, Config, Result};

/// Discovery layer: ordered membership events, liveness, and the ring-based
/// custom event channel.
pub trait Discovery: Send + Sync {
    fn alive(&self, node_id: u64) -> bool;

    fn node(&self, node_id: u64) -> Option<NodeDesc>;

    /// Publish a custom event over the discovery ring. The ring's total
    /// order guarantees all survivors observe it at the same position.
    fn send_custom_event(&self, msg: CustomMessage) -> Result<()>;

    fn reconnect_supported(&self) -> bool {
        false
    }
}

/// Point-to-point message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends an encoded envelope. Fails with [`crate::Error::PeerGone`]
    /// when the peer already left, which callers treat as benign.
    async fn send(&self, to: u64, payload: Bytes) -> Result<()>;
}

/// The affinity function and its bookkeeping, consulted on every exchange.
#[async_trait]
pub trait AffinityManager: Send + Sync {
    fn on_server_join(&self, exch_id: &ExchangeId, snapshot: &TopologySnapshot, crd: bool);

    /// Returns true when the full map must be distributed over the
    /// discovery ring (the leaver held unique affinity).
    fn on_server_left(&self, exch_id: &ExchangeId, snapshot: &TopologySnapshot, crd: bool) -> bool;

    fn on_client_event(&self, exch_id: &ExchangeId, snapshot: &TopologySnapshot, crd: bool);

    fn on_cache_change_request(
        &self,
        exch_id: &ExchangeId,
        snapshot: &TopologySnapshot,
        crd: bool,
        batch: &CacheChangeBatch,
    ) -> Result<()>;

    fn on_change_affinity_message(
        &self,
        exch_id: &ExchangeId,
        crd: bool,
        msg: &AffinityChangeMessage,
    ) -> Result<()>;

    /// A locally-joining node applies the affinity carried by the
    /// coordinator's full message.
    fn on_local_join(&self, exch_id: &ExchangeId, msg: &FullMessage, res_ver: TopologyVersion);

    /// Recompute assignments after a server left while centralized
    /// distribution is in effect.
    async fn init_affinity_on_node_left(
        &self,
        exch_id: &ExchangeId,
        snapshot: &TopologySnapshot,
    ) -> Result<HashMap<u64, Vec<Vec<u64>>>>;

    /// Mark the affinity of `ver` ready for use by request mapping.
    fn ready_affinity(&self, ver: TopologyVersion);

    /// Ideal assignment of one group: partition index to the ordered list
    /// of candidate owners.
    fn ideal_assignment(&self, group_id: u64) -> Vec<Vec<u64>>;
}

/// Persistence checkpointing and WAL history reservation.
pub trait Persistence: Send + Sync {
    fn persistence_enabled(&self) -> bool {
        false
    }

    fn checkpoint_read_lock(&self);

    fn checkpoint_read_unlock(&self);

    fn read_checkpoint_and_restore_memory(&self, groups: &[u64]) -> Result<()>;

    fn before_exchange(&self, ver: TopologyVersion) -> Result<()>;

    /// Reserve WAL history so counters stay addressable for the whole
    /// exchange: group id -> partition -> lowest reserved counter.
    fn reserve_history_for_exchange(&self) -> HashMap<u64, HashMap<u32, u64>>;

    fn release_history_for_exchange(&self);

    fn release_history_for_preloading(&self);

    fn reserve_history_for_preloading(&self, group_id: u64, part: u32, counter: u64) -> bool;

    /// Flush a group's write-behind store so durable state matches the
    /// visible state after quiesce.
    fn flush_write_behind(&self, group_id: u64);
}

/// Cache lifecycle operations invoked on join and activation paths.
pub trait CacheLifecycle: Send + Sync {
    /// Start caches received from a joining node; returns started groups.
    fn start_received_caches(&self, initiator: u64, ver: TopologyVersion) -> Vec<u64>;

    fn caches_to_start_on_local_join(&self) -> Vec<u64>;

    fn start_caches_on_local_join(&self, groups: &[u64], ver: TopologyVersion) -> Result<()>;

    fn activate(&self) -> Result<()>;

    fn deactivate(&self) -> Result<()>;

    /// Peer errors aggregated by the coordinator during a state change;
    /// the local state manager rolls the change back.
    fn on_state_change_error(&self, errors: &HashMap<u64, String>, activate: bool);

    /// Outcome notification published by the coordinator over the ring.
    fn on_state_change_finish(&self, request_id: u64, active: bool);
}

/// Tracks transactions, atomic updates and explicit locks per topology
/// version; the quiesce phase waits on its futures.
pub trait TxTracker: Send + Sync {
    /// Completes when every operation begun at a strictly lower topology
    /// version has finished or been aborted.
    fn partition_release_future(&self, ver: TopologyVersion) -> BoxFuture<'static, ()>;

    /// Completes when lock candidates started before the exchange are
    /// resolved.
    fn finish_locks(&self, ver: TopologyVersion) -> BoxFuture<'static, ()>;

    fn remove_explicit_node_locks(&self, node_id: u64, ver: TopologyVersion);

    /// Human-readable descriptions of pending operations, for dumps.
    fn dump_pending_objects(&self) -> Vec<String>;

    fn locked_keys(&self) -> Vec<String>;
}

/// Monotone issuance of data-version orders.
#[derive(Default)]
pub struct VersionSource {
    last: AtomicU64,
}

impl VersionSource {
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Advance issuance monotonically past every order observed during an
    /// exchange.
    pub fn on_exchange(&self, order: u64) {
        self.last.fetch_max(order, Ordering::AcqRel);
    }
}

/// One cache group hosted (or tracked) by this node.
pub struct GroupContext {
    group_id: u64,
    /// Local-only groups never take part in an exchange.
    local_only: bool,
    topology: GroupTopology,
}

impl GroupContext {
    pub fn new(group_id: u64, partitions: u32) -> Self {
        GroupContext {
            group_id,
            local_only: false,
            topology: GroupTopology::new(group_id, partitions),
        }
    }

    pub fn local_only(group_id: u64, partitions: u32) -> Self {
        GroupContext {
            group_id,
            local_only: true,
            topology: GroupTopology::new(group_id, partitions),
        }
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn is_local_only(&self) -> bool {
        self.local_only
    }

    pub fn topology(&self) -> &GroupTopology {
        &self.topology
    }
}

/// The per-node shared context handed to every exchange.
pub struct SharedContext {
    local: NodeDesc,
    config: Config,
    discovery: Arc<dyn Discovery>,
    transport: Arc<dyn Transport>,
    affinity: Arc<dyn AffinityManager>,
    persistence: Arc<dyn Persistence>,
    lifecycle: Arc<dyn CacheLifecycle>,
    tx_tracker: Arc<dyn TxTracker>,
    versions: VersionSource,
    groups: RwLock<BTreeMap<u64, Arc<GroupContext>>>,
}

impl SharedContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: NodeDesc,
        config: Config,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn Transport>,
        affinity: Arc<dyn AffinityManager>,
        persistence: Arc<dyn Persistence>,
        lifecycle: Arc<dyn CacheLifecycle>,
        tx_tracker: Arc<dyn TxTracker>,
    ) -> Self {
        SharedContext {
            local,
            config,
            discovery,
            transport,
            affinity,
            persistence,
            lifecycle,
            tx_tracker,
            versions: VersionSource::default(),
            groups: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn local(&self) -> NodeDesc {
        self.local
    }

    pub fn local_id(&self) -> u64 {
        self.local.id
    }

    pub fn is_client(&self) -> bool {
        self.local.client
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn discovery(&self) -> &dyn Discovery {
        self.discovery.as_ref()
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn affinity(&self) -> &dyn AffinityManager {
        self.affinity.as_ref()
    }

    pub fn persistence(&self) -> &dyn Persistence {
        self.persistence.as_ref()
    }

    pub fn lifecycle(&self) -> &dyn CacheLifecycle {
        self.lifecycle.as_ref()
    }

    pub fn tx_tracker(&self) -> &dyn TxTracker {
        self.tx_tracker.as_ref()
    }

    pub fn versions(&self) -> &VersionSource {
        &self.versions
    }

    pub fn register_group(&self, group: GroupContext) -> Arc<GroupContext> {
        let group = Arc::new(group);
        self.groups
            .write()
            .unwrap()
            .insert(group.group_id(), group.clone());
        group
    }

    pub fn unregister_group(&self, group_id: u64) {
        self.groups.write().unwrap().remove(&group_id);
    }

    pub fn group(&self, group_id: u64) -> Option<Arc<GroupContext>> {
        self.groups.read().unwrap().get(&group_id).cloned()
    }

    /// Groups taking part in exchanges, in group id order.
    pub fn exchange_groups(&self) -> Vec<Arc<GroupContext>> {
        self.groups
            .read()
            .unwrap()
            .values()
            .filter(|g| !g.is_local_only())
            .cloned()
            .collect()
    }
}
