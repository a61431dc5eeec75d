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

//! In-memory cluster: every node gets a real worker and shared context;
//! discovery events are fanned out in total order and the transport
//! routes envelopes straight into the peer workers.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tessera_api::v1::{
    CustomMessage, DiscoveryEvent, EventKind, ExchangeId, NodeDesc, PartitionState,
};
use tessera_server::{
    context::{GroupContext, SharedContext},
    exchange::ExchangeResult,
    Config, ExchangeConfig, ExchangeWorker,
};
use tokio::sync::mpsc;

use super::sim::{
    ClusterState, SimAffinity, SimDiscovery, SimLifecycle, SimPersistence, SimTransport,
    SimTxTracker,
};

pub struct TestNode {
    pub desc: NodeDesc,
    pub ctx: Arc<SharedContext>,
    pub worker: Arc<ExchangeWorker>,
    pub affinity: Arc<SimAffinity>,
    pub persistence: Arc<SimPersistence>,
    pub lifecycle: Arc<SimLifecycle>,
    pub tx_tracker: Arc<SimTxTracker>,
}

impl TestNode {
    pub fn id(&self) -> u64 {
        self.desc.id
    }

    pub fn topology(&self, group_id: u64) -> Arc<GroupContext> {
        self.ctx.group(group_id).expect("group registered")
    }

    pub fn seed_partition(
        &self,
        group_id: u64,
        part: u32,
        state: PartitionState,
        init_counter: u64,
        applied_counter: u64,
    ) {
        self.topology(group_id).topology().set_local_partition(
            self.desc.id,
            part,
            state,
            init_counter,
            applied_counter,
        );
    }

    /// Wait for the exchange with `id` to complete on this node.
    pub async fn wait(&self, id: &ExchangeId) -> ExchangeResult {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(fut) = self.worker.exchange_future(id) {
                    return fut.wait_done().await;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("exchange {} did not complete on node {}", id, self.desc.id))
    }
}

pub struct TestCluster {
    pub state: Arc<ClusterState>,
    groups: Vec<(u64, u32)>,
    nodes: Mutex<HashMap<u64, Arc<TestNode>>>,
    next_id: AtomicU64,
    centralized_on_left: AtomicBool,
}

impl TestCluster {
    pub fn new(groups: Vec<(u64, u32)>) -> Arc<Self> {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("info")
            .try_init();

        let state = Arc::new(ClusterState {
            replicas: 2,
            ..Default::default()
        });
        *state.groups.lock().unwrap() = groups.clone();

        let (ring_tx, mut ring_rx) = mpsc::unbounded_channel::<CustomMessage>();
        *state.ring_tx.lock().unwrap() = Some(ring_tx);

        // The discovery ring: custom events reach every live node in the
        // same total order.
        let ring_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ring_rx.recv().await {
                let servers = ring_state.alive_servers();
                let sender = match servers.first() {
                    Some(sender) => *sender,
                    None => continue,
                };
                let event = DiscoveryEvent {
                    kind: EventKind::Custom,
                    node: sender,
                    custom: Some(msg),
                    snapshot: ring_state.snapshot(),
                };
                for worker in ordered_workers(&ring_state) {
                    worker.on_discovery_event(event.clone()).await;
                }
            }
        });

        Arc::new(TestCluster {
            state,
            groups,
            nodes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            centralized_on_left: AtomicBool::new(false),
        })
    }

    /// Make every subsequent server-left exchange distribute its full map
    /// over the discovery ring.
    pub fn set_centralized_on_left(&self, value: bool) {
        self.centralized_on_left.store(value, Ordering::Release);
        for node in self.nodes.lock().unwrap().values() {
            node.affinity
                .centralized_on_left
                .store(value, Ordering::Release);
        }
    }

    pub fn node(&self, id: u64) -> Arc<TestNode> {
        self.nodes.lock().unwrap().get(&id).cloned().expect("node")
    }

    pub async fn join_server(&self) -> (Arc<TestNode>, ExchangeId) {
        self.join(false, |_| {}).await
    }

    pub async fn join_server_seeded(
        &self,
        seed: impl Fn(&TestNode),
    ) -> (Arc<TestNode>, ExchangeId) {
        self.join(false, seed).await
    }

    pub async fn join_client(&self) -> (Arc<TestNode>, ExchangeId) {
        self.join(true, |_| {}).await
    }

    async fn join(&self, client: bool, seed: impl Fn(&TestNode)) -> (Arc<TestNode>, ExchangeId) {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let desc = if client {
            NodeDesc::client(id, id)
        } else {
            NodeDesc::server(id, id)
        };

        let discovery = Arc::new(SimDiscovery {
            state: self.state.clone(),
        });
        let transport = Arc::new(SimTransport {
            state: self.state.clone(),
            from: id,
        });
        let affinity = Arc::new(SimAffinity {
            state: self.state.clone(),
            centralized_on_left: AtomicBool::new(self.centralized_on_left.load(Ordering::Acquire)),
        });
        let persistence = Arc::new(SimPersistence::default());
        let lifecycle = Arc::new(SimLifecycle::default());
        let tx_tracker = Arc::new(SimTxTracker::default());

        let config = Config {
            exchange: ExchangeConfig {
                network_timeout_ms: 100,
                ..Default::default()
            },
        };
        let ctx = Arc::new(SharedContext::new(
            desc,
            config,
            discovery,
            transport,
            affinity.clone(),
            persistence.clone(),
            lifecycle.clone(),
            tx_tracker.clone(),
        ));
        for (group_id, parts) in &self.groups {
            ctx.register_group(GroupContext::new(*group_id, *parts));
        }

        let worker = Arc::new(ExchangeWorker::new(ctx.clone()));
        let node = Arc::new(TestNode {
            desc,
            ctx,
            worker: worker.clone(),
            affinity,
            persistence,
            lifecycle,
            tx_tracker,
        });
        seed(&node);

        self.state.known.lock().unwrap().insert(id, desc);
        self.state.alive.lock().unwrap().insert(id, desc);
        self.state.workers.lock().unwrap().insert(id, worker);
        self.nodes.lock().unwrap().insert(id, node.clone());

        let event = {
            let mut version = self.state.version.lock().unwrap();
            *version = version.next_major();
            DiscoveryEvent {
                kind: EventKind::Joined,
                node: desc,
                custom: None,
                snapshot: self.state.snapshot(),
            }
        };
        self.deliver(&event).await;
        (node, event.exchange_id())
    }

    pub async fn leave(&self, id: u64, failed: bool) -> ExchangeId {
        let desc = self
            .state
            .known
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .expect("known node");
        self.state.alive.lock().unwrap().remove(&id);
        self.state.workers.lock().unwrap().remove(&id);

        let event = {
            let mut version = self.state.version.lock().unwrap();
            *version = version.next_major();
            DiscoveryEvent {
                kind: if failed {
                    EventKind::Failed
                } else {
                    EventKind::Left
                },
                node: desc,
                custom: None,
                snapshot: self.state.snapshot(),
            }
        };
        self.deliver(&event).await;
        event.exchange_id()
    }

    /// Deliver a custom discovery message initiated by `initiator`.
    pub async fn custom(&self, initiator: u64, msg: CustomMessage) -> ExchangeId {
        let desc = self
            .state
            .known
            .lock()
            .unwrap()
            .get(&initiator)
            .copied()
            .expect("known node");
        let event = {
            let mut version = self.state.version.lock().unwrap();
            *version = version.next_minor();
            DiscoveryEvent {
                kind: EventKind::Custom,
                node: desc,
                custom: Some(msg),
                snapshot: self.state.snapshot(),
            }
        };
        self.deliver(&event).await;
        event.exchange_id()
    }

    /// Silently lose every message sent from `from` to `to`.
    pub fn drop_link(&self, from: u64, to: u64) {
        self.state.drops.lock().unwrap().insert((from, to));
    }

    /// Park messages from `from` to `to` until released.
    pub fn hold_link(&self, from: u64, to: u64) {
        self.state.holds.lock().unwrap().insert((from, to));
    }

    /// Stop holding the link and deliver everything parked on it.
    pub async fn release_link(&self, from: u64, to: u64) {
        self.state.holds.lock().unwrap().remove(&(from, to));
        let held: Vec<(u64, u64, bytes::Bytes)> = {
            let mut held = self.state.held.lock().unwrap();
            let parked = std::mem::take(&mut *held);
            let (matched, rest): (Vec<_>, Vec<_>) = parked
                .into_iter()
                .partition(|(f, t, _)| *f == from && *t == to);
            *held = rest;
            matched
        };
        for (from, to, payload) in held {
            let worker = self.state.workers.lock().unwrap().get(&to).cloned();
            if let Some(worker) = worker {
                let _ = worker.on_message(from, payload).await;
            }
        }
    }

    async fn deliver(&self, event: &DiscoveryEvent) {
        for worker in ordered_workers(&self.state) {
            worker.on_discovery_event(event.clone()).await;
        }
    }
}

fn ordered_workers(state: &ClusterState) -> Vec<Arc<ExchangeWorker>> {
    let alive: Vec<NodeDesc> = {
        let mut nodes: Vec<NodeDesc> = state.alive.lock().unwrap().values().copied().collect();
        nodes.sort_by_key(|n| n.order);
        nodes
    };
    let workers = state.workers.lock().unwrap();
    alive
        .iter()
        .filter_map(|n| workers.get(&n.id).cloned())
        .collect()
}
