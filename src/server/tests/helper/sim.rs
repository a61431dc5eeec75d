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

//! Simulated collaborators wired into every test node: loopback discovery
//! and transport over the shared cluster state, plus no-op affinity,
//! persistence, lifecycle and transaction tracking with just enough knobs
//! for the scenarios.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tessera_api::v1::{
    envelope::Payload, AffinityChangeMessage, CacheChangeBatch, CustomMessage, Envelope,
    ExchangeId, FullMessage, NodeDesc, TopologySnapshot, TopologyVersion,
};
use tessera_server::{
    context::{AffinityManager, CacheLifecycle, Discovery, Persistence, Transport, TxTracker},
    codec, Error, ExchangeWorker, Result,
};
use tokio::sync::mpsc;

pub struct SentRecord {
    pub from: u64,
    pub to: u64,
    pub envelope: Envelope,
}

#[derive(Default)]
pub struct ClusterState {
    pub version: Mutex<TopologyVersion>,
    pub known: Mutex<HashMap<u64, NodeDesc>>,
    pub alive: Mutex<HashMap<u64, NodeDesc>>,
    pub workers: Mutex<HashMap<u64, Arc<ExchangeWorker>>>,
    pub drops: Mutex<HashSet<(u64, u64)>>,
    pub holds: Mutex<HashSet<(u64, u64)>>,
    pub held: Mutex<Vec<(u64, u64, Bytes)>>,
    pub sent: Mutex<Vec<SentRecord>>,
    pub groups: Mutex<Vec<(u64, u32)>>,
    pub replicas: u64,
    pub ring_tx: Mutex<Option<mpsc::UnboundedSender<CustomMessage>>>,
}

impl ClusterState {
    pub fn snapshot(&self) -> TopologySnapshot {
        let version = *self.version.lock().unwrap();
        let nodes = self.alive.lock().unwrap().values().copied().collect();
        TopologySnapshot::new(version, nodes)
    }

    pub fn alive_servers(&self) -> Vec<NodeDesc> {
        let mut servers: Vec<NodeDesc> = self
            .alive
            .lock()
            .unwrap()
            .values()
            .filter(|n| !n.client)
            .copied()
            .collect();
        servers.sort_by_key(|n| n.order);
        servers
    }

    /// Messages of one kind sent from `from` to `to`, in send order.
    pub fn sent_full_messages(&self, from: u64, to: u64) -> Vec<FullMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.from == from && r.to == to)
            .filter_map(|r| match &r.envelope.payload {
                Some(Payload::Full(msg)) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }
}

pub struct SimDiscovery {
    pub state: Arc<ClusterState>,
}

impl Discovery for SimDiscovery {
    fn alive(&self, node_id: u64) -> bool {
        self.state.alive.lock().unwrap().contains_key(&node_id)
    }

    fn node(&self, node_id: u64) -> Option<NodeDesc> {
        self.state.known.lock().unwrap().get(&node_id).copied()
    }

    fn send_custom_event(&self, msg: CustomMessage) -> Result<()> {
        let ring = self.state.ring_tx.lock().unwrap();
        match ring.as_ref() {
            Some(tx) => tx
                .send(msg)
                .map_err(|_| Error::Transport("ring closed".to_string())),
            None => Err(Error::Transport("ring not running".to_string())),
        }
    }
}

pub struct SimTransport {
    pub state: Arc<ClusterState>,
    pub from: u64,
}

#[async_trait]
impl Transport for SimTransport {
    async fn send(&self, to: u64, payload: Bytes) -> Result<()> {
        {
            let envelope = codec::decode(&payload)?;
            self.state.sent.lock().unwrap().push(SentRecord {
                from: self.from,
                to,
                envelope,
            });
        }
        if self.state.drops.lock().unwrap().contains(&(self.from, to)) {
            // Lost in flight; the sender cannot tell.
            return Ok(());
        }
        if self.state.holds.lock().unwrap().contains(&(self.from, to)) {
            self.state
                .held
                .lock()
                .unwrap()
                .push((self.from, to, payload));
            return Ok(());
        }
        let worker = {
            let alive = self.state.alive.lock().unwrap();
            if !alive.contains_key(&to) {
                return Err(Error::PeerGone(to));
            }
            self.state.workers.lock().unwrap().get(&to).cloned()
        };
        match worker {
            Some(worker) => worker.on_message(self.from, payload).await,
            None => Err(Error::PeerGone(to)),
        }
    }
}

pub struct SimAffinity {
    pub state: Arc<ClusterState>,
    pub centralized_on_left: AtomicBool,
}

impl SimAffinity {
    fn assignment(&self, group_id: u64) -> Vec<Vec<u64>> {
        let parts = self
            .state
            .groups
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| *id == group_id)
            .map(|(_, parts)| *parts)
            .unwrap_or(0);
        let servers = self.state.alive_servers();
        if servers.is_empty() {
            return vec![Vec::new(); parts as usize];
        }
        let replicas = (self.state.replicas.max(1) as usize).min(servers.len());
        (0..parts as usize)
            .map(|part| {
                (0..replicas)
                    .map(|r| servers[(part + r) % servers.len()].id)
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
impl AffinityManager for SimAffinity {
    fn on_server_join(&self, _exch_id: &ExchangeId, _snapshot: &TopologySnapshot, _crd: bool) {}

    fn on_server_left(&self, _exch_id: &ExchangeId, _snapshot: &TopologySnapshot, _crd: bool) -> bool {
        self.centralized_on_left.load(Ordering::Acquire)
    }

    fn on_client_event(&self, _exch_id: &ExchangeId, _snapshot: &TopologySnapshot, _crd: bool) {}

    fn on_cache_change_request(
        &self,
        _exch_id: &ExchangeId,
        _snapshot: &TopologySnapshot,
        _crd: bool,
        _batch: &CacheChangeBatch,
    ) -> Result<()> {
        Ok(())
    }

    fn on_change_affinity_message(
        &self,
        _exch_id: &ExchangeId,
        _crd: bool,
        _msg: &AffinityChangeMessage,
    ) -> Result<()> {
        Ok(())
    }

    fn on_local_join(&self, _exch_id: &ExchangeId, _msg: &FullMessage, _res_ver: TopologyVersion) {}

    async fn init_affinity_on_node_left(
        &self,
        _exch_id: &ExchangeId,
        _snapshot: &TopologySnapshot,
    ) -> Result<HashMap<u64, Vec<Vec<u64>>>> {
        let groups: Vec<u64> = self
            .state
            .groups
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| *id)
            .collect();
        Ok(groups
            .into_iter()
            .map(|group_id| (group_id, self.assignment(group_id)))
            .collect())
    }

    fn ready_affinity(&self, _ver: TopologyVersion) {}

    fn ideal_assignment(&self, group_id: u64) -> Vec<Vec<u64>> {
        self.assignment(group_id)
    }
}

#[derive(Default)]
pub struct SimPersistence {
    pub enabled: bool,
    pub reserved: Mutex<HashMap<u64, HashMap<u32, u64>>>,
    pub refuse_preload_reservation: AtomicBool,
}

impl Persistence for SimPersistence {
    fn persistence_enabled(&self) -> bool {
        self.enabled
    }

    fn checkpoint_read_lock(&self) {}

    fn checkpoint_read_unlock(&self) {}

    fn read_checkpoint_and_restore_memory(&self, _groups: &[u64]) -> Result<()> {
        Ok(())
    }

    fn before_exchange(&self, _ver: TopologyVersion) -> Result<()> {
        Ok(())
    }

    fn reserve_history_for_exchange(&self) -> HashMap<u64, HashMap<u32, u64>> {
        self.reserved.lock().unwrap().clone()
    }

    fn release_history_for_exchange(&self) {}

    fn release_history_for_preloading(&self) {}

    fn reserve_history_for_preloading(&self, _group_id: u64, _part: u32, _counter: u64) -> bool {
        !self.refuse_preload_reservation.load(Ordering::Acquire)
    }

    fn flush_write_behind(&self, _group_id: u64) {}
}

#[derive(Default)]
pub struct SimLifecycle {
    pub activate_error: Mutex<Option<String>>,
    pub finishes: Mutex<Vec<(u64, bool)>>,
    pub rollbacks: Mutex<Vec<HashMap<u64, String>>>,
}

impl CacheLifecycle for SimLifecycle {
    fn start_received_caches(&self, _initiator: u64, _ver: TopologyVersion) -> Vec<u64> {
        Vec::new()
    }

    fn caches_to_start_on_local_join(&self) -> Vec<u64> {
        Vec::new()
    }

    fn start_caches_on_local_join(&self, _groups: &[u64], _ver: TopologyVersion) -> Result<()> {
        Ok(())
    }

    fn activate(&self) -> Result<()> {
        match self.activate_error.lock().unwrap().clone() {
            Some(err) => Err(Error::InvalidArgument(err)),
            None => Ok(()),
        }
    }

    fn deactivate(&self) -> Result<()> {
        Ok(())
    }

    fn on_state_change_error(&self, errors: &HashMap<u64, String>, _activate: bool) {
        self.rollbacks.lock().unwrap().push(errors.clone());
    }

    fn on_state_change_finish(&self, request_id: u64, active: bool) {
        self.finishes.lock().unwrap().push((request_id, active));
    }
}

#[derive(Default)]
pub struct SimTxTracker {
    pub release_delay: Mutex<Duration>,
}

impl TxTracker for SimTxTracker {
    fn partition_release_future(&self, _ver: TopologyVersion) -> BoxFuture<'static, ()> {
        let delay = *self.release_delay.lock().unwrap();
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        })
    }

    fn finish_locks(&self, _ver: TopologyVersion) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }

    fn remove_explicit_node_locks(&self, _node_id: u64, _ver: TopologyVersion) {}

    fn dump_pending_objects(&self) -> Vec<String> {
        Vec::new()
    }

    fn locked_keys(&self) -> Vec<String> {
        Vec::new()
    }
}
