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

//! The per-exchange coordination state machine. One [`ExchangeFuture`] is
//! created per discovery event on every server node, runs to completion on
//! that topology version, and produces the version's partition map.

pub mod quiesce;
mod reconcile;
mod restore;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    task::{Poll, Waker},
    time::Instant,
};

use futures::future::BoxFuture;
use tessera_api::v1::{
    AffinityChangeMessage, CacheChangeBatch, CustomMessage, DiscoveryEvent, Envelope, EventKind,
    ExchangeId, FullMessage, GroupAffinity, HistorySupplier, NodeDesc, PartitionMap,
    PartitionState, SingleMessage, SingleRequest, TopologySnapshot, TopologyVersion,
};
use tracing::{debug, error, info, warn};

use self::restore::InitNewCoordinator;
use crate::{
    codec::{self, PartsToReload},
    context::SharedContext,
    metrics::{
        take_exchange_metrics, EXCHANGE_COORDINATOR_FAILOVER_TOTAL, EXCHANGE_LOST_PARTITIONS_TOTAL,
        EXCHANGE_MERGE_TOTAL,
    },
    runtime::WaitGroup,
    worker::WorkerShared,
    Error, Result,
};

/// Completion value of an exchange, cloned to every waiter.
pub type ExchangeResult = std::result::Result<TopologyVersion, Arc<Error>>;

/// Node-role state of an exchange. Transitions only move forward; `Done`
/// is terminal, and `Merged` is terminal for the instance (it delegates to
/// the exchange it merged into).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    Crd,
    Srv,
    Client,
    BecomeCrd,
    Merged,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExchangeType {
    All,
    Client,
    None,
}

#[derive(Clone)]
pub(crate) struct FinishState {
    pub crd_id: Option<u64>,
    pub res_ver: TopologyVersion,
    pub msg: Option<FullMessage>,
}

/// One-shot init-complete gate: callbacks delivered before init finishes
/// are queued and run right after it; later ones run inline.
#[derive(Default)]
struct InitGate {
    inner: Mutex<GateInner>,
}

#[derive(Default)]
struct GateInner {
    done: bool,
    ok: bool,
    queued: Vec<BoxFuture<'static, ()>>,
}

impl InitGate {
    /// Returns the future back for inline execution, or queues/drops it.
    fn pass(&self, fut: BoxFuture<'static, ()>) -> Option<BoxFuture<'static, ()>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.done {
            if inner.ok {
                Some(fut)
            } else {
                None
            }
        } else {
            inner.queued.push(fut);
            None
        }
    }

    fn complete(&self, ok: bool) -> Vec<BoxFuture<'static, ()>> {
        let mut inner = self.inner.lock().unwrap();
        inner.done = true;
        inner.ok = ok;
        std::mem::take(&mut inner.queued)
    }
}

#[derive(Default)]
struct DoneLatch {
    inner: Mutex<DoneInner>,
}

#[derive(Default)]
struct DoneInner {
    result: Option<ExchangeResult>,
    wakers: Vec<Waker>,
}

impl DoneLatch {
    fn try_set(&self, result: ExchangeResult) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.result.is_some() {
            return false;
        }
        inner.result = Some(result);
        for waker in std::mem::take(&mut inner.wakers) {
            waker.wake();
        }
        true
    }

    fn get(&self) -> Option<ExchangeResult> {
        self.inner.lock().unwrap().result.clone()
    }

    async fn wait(&self) -> ExchangeResult {
        use futures::future::poll_fn;

        poll_fn(|cx| {
            let mut inner = self.inner.lock().unwrap();
            match &inner.result {
                Some(result) => Poll::Ready(result.clone()),
                None => {
                    inner.wakers.push(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }
}

struct Guarded {
    state: Option<ExchangeState>,
    crd: Option<NodeDesc>,
    srv_nodes: Vec<NodeDesc>,
    remaining: HashSet<u64>,
    msgs: HashMap<u64, SingleMessage>,
    pending_single_msgs: HashMap<u64, SingleMessage>,
    full_msgs: HashMap<u64, (NodeDesc, FullMessage)>,
    /// Slot present with `None` means "single message still awaited".
    merged_join_exch_msgs: HashMap<u64, Option<SingleMessage>>,
    await_merged_msgs: usize,
    merged_with: Option<Arc<ExchangeFuture>>,
    pending_join_msg: Option<SingleMessage>,
    finish_state: Option<FinishState>,
    new_crd: Option<Arc<InitNewCoordinator>>,
    change_state_errors: HashMap<u64, String>,
    change_state_local_error: Option<String>,
    merged_events: Vec<DiscoveryEvent>,
    centralized_aff: bool,
    part_hist_suppliers: Vec<HistorySupplier>,
    parts_to_reload: PartsToReload,
    part_hist_reserved: Option<HashMap<u64, HashMap<u32, u64>>>,
}

pub struct ExchangeFuture {
    ctx: Arc<SharedContext>,
    mgr: Weak<WorkerShared>,
    exch_id: ExchangeId,
    event: DiscoveryEvent,
    disco_snapshot: TopologySnapshot,
    exch_actions: Option<CacheChangeBatch>,
    state_change: Option<(u64, bool)>,
    aff_change_msg: Option<AffinityChangeMessage>,
    guarded: Mutex<Guarded>,
    init_gate: InitGate,
    done: DoneLatch,
    last_version: AtomicU64,
    pending_updates: WaitGroup,
    init_ts: Mutex<Option<Instant>>,
}

impl ExchangeFuture {
    pub(crate) fn new(
        ctx: Arc<SharedContext>,
        mgr: Weak<WorkerShared>,
        event: DiscoveryEvent,
    ) -> Self {
        let exch_id = event.exchange_id();
        let mut exch_actions = None;
        let mut state_change = None;
        let mut aff_change_msg = None;
        match &event.custom {
            Some(CustomMessage::CacheChange(batch)) => exch_actions = Some(batch.clone()),
            Some(CustomMessage::ChangeGlobalState {
                request_id,
                activate,
            }) => state_change = Some((*request_id, *activate)),
            Some(CustomMessage::AffinityChange(msg)) => aff_change_msg = Some(msg.clone()),
            _ => {}
        }
        ExchangeFuture {
            disco_snapshot: event.snapshot.clone(),
            exch_id,
            exch_actions,
            state_change,
            aff_change_msg,
            event,
            ctx,
            mgr,
            guarded: Mutex::new(Guarded {
                state: None,
                crd: None,
                srv_nodes: Vec::new(),
                remaining: HashSet::new(),
                msgs: HashMap::new(),
                pending_single_msgs: HashMap::new(),
                full_msgs: HashMap::new(),
                merged_join_exch_msgs: HashMap::new(),
                await_merged_msgs: 0,
                merged_with: None,
                pending_join_msg: None,
                finish_state: None,
                new_crd: None,
                change_state_errors: HashMap::new(),
                change_state_local_error: None,
                merged_events: Vec::new(),
                centralized_aff: false,
                part_hist_suppliers: Vec::new(),
                parts_to_reload: PartsToReload::default(),
                part_hist_reserved: None,
            }),
            init_gate: InitGate::default(),
            done: DoneLatch::default(),
            last_version: AtomicU64::new(0),
            pending_updates: WaitGroup::new(),
            init_ts: Mutex::new(None),
        }
    }

    pub fn exchange_id(&self) -> &ExchangeId {
        &self.exch_id
    }

    pub fn initial_version(&self) -> TopologyVersion {
        self.exch_id.version()
    }

    pub fn event(&self) -> &DiscoveryEvent {
        &self.event
    }

    pub fn state(&self) -> Option<ExchangeState> {
        self.guarded.lock().unwrap().state
    }

    pub fn is_done(&self) -> bool {
        self.done.get().is_some()
    }

    pub fn is_merged(&self) -> bool {
        self.guarded.lock().unwrap().state == Some(ExchangeState::Merged)
    }

    pub(crate) fn merged_with(&self) -> Option<Arc<ExchangeFuture>> {
        self.guarded.lock().unwrap().merged_with.clone()
    }

    pub(crate) fn coordinator(&self) -> Option<NodeDesc> {
        self.guarded.lock().unwrap().crd
    }

    pub(crate) fn server_nodes(&self) -> Vec<NodeDesc> {
        self.guarded.lock().unwrap().srv_nodes.clone()
    }

    /// Completes with the resulting topology version, or the error that
    /// forced the node to reconnect.
    pub async fn wait_done(&self) -> ExchangeResult {
        self.done.wait().await
    }

    pub fn result(&self) -> Option<ExchangeResult> {
        self.done.get()
    }

    /// Result version: the highest event version folded into this round.
    pub fn result_version(&self) -> TopologyVersion {
        let guarded = self.guarded.lock().unwrap();
        guarded
            .merged_events
            .iter()
            .map(|e| e.version())
            .max()
            .map(|v| v.max(self.initial_version()))
            .unwrap_or_else(|| self.initial_version())
    }

    fn local_join_exchange(&self) -> bool {
        self.event.kind == EventKind::Joined && self.event.node.id == self.ctx.local_id()
    }

    fn state_change_exchange(&self) -> bool {
        self.state_change.is_some()
    }

    fn activate_cluster(&self) -> bool {
        matches!(self.state_change, Some((_, true)))
    }

    fn deactivate_cluster(&self) -> bool {
        matches!(self.state_change, Some((_, false)))
    }

    fn has_server_join(&self) -> bool {
        let initial = self.event.is_server_membership() && self.event.kind == EventKind::Joined;
        initial
            || self
                .guarded
                .lock()
                .unwrap()
                .merged_events
                .iter()
                .any(|e| e.is_server_membership() && e.kind == EventKind::Joined)
    }

    fn has_server_left(&self) -> bool {
        let initial = self.event.is_server_membership() && self.event.kind.is_departure();
        initial
            || self
                .guarded
                .lock()
                .unwrap()
                .merged_events
                .iter()
                .any(|e| e.is_server_membership() && e.kind.is_departure())
    }

    fn update_last_version(&self, ver: u64) {
        self.last_version.fetch_max(ver, Ordering::AcqRel);
    }

    fn wrap_reconnect(&self, err: Error) -> Error {
        if err.is_reconnect_cause() && self.ctx.discovery().reconnect_supported() {
            Error::NeedReconnect(err.to_string())
        } else {
            err
        }
    }

    /// Run `fut` once init completed: inline when init already finished,
    /// queued on the init gate otherwise.
    async fn run_after_init<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(fut) = self.init_gate.pass(Box::pin(fut)) {
            fut.await;
        }
    }

    async fn init_done(&self) {
        for fut in self.init_gate.complete(true) {
            fut.await;
        }
    }
}

// Init phase.
impl ExchangeFuture {
    /// Drive the linear init phase: snapshot servers, classify the event,
    /// update topologies, quiesce and enter the messaging phase.
    pub async fn init(self: &Arc<Self>, new_crd: bool) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }
        *self.init_ts.lock().unwrap() = Some(Instant::now());

        match self.do_init(new_crd).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = self.wrap_reconnect(err);
                error!(
                    exchange = %self.exch_id,
                    "failed to reinitialize local partitions: {}", err
                );
                self.complete(self.initial_version(), Some(err));
                // Unblock queued callbacks; they observe the done state.
                for fut in self.init_gate.complete(false) {
                    drop(fut);
                }
                Ok(())
            }
        }
    }

    async fn do_init(self: &Arc<Self>, new_crd: bool) -> Result<()> {
        let top_ver = self.initial_version();
        let crd_local = {
            let mut guarded = self.guarded.lock().unwrap();
            guarded.srv_nodes = self.disco_snapshot.server_nodes();
            guarded.remaining = guarded
                .srv_nodes
                .iter()
                .filter(|n| n.id != self.ctx.local_id())
                .map(|n| n.id)
                .collect();
            guarded.crd = guarded.srv_nodes.first().copied();
            let crd_local = guarded
                .crd
                .map(|c| c.id == self.ctx.local_id())
                .unwrap_or(false);
            debug_assert!(guarded.state.is_none() || new_crd);
            if guarded.state.is_none() {
                guarded.state = Some(if crd_local {
                    ExchangeState::Crd
                } else if self.ctx.is_client() {
                    ExchangeState::Client
                } else {
                    ExchangeState::Srv
                });
            }
            crd_local
        };

        info!(
            exchange = %self.exch_id,
            crd = crd_local,
            evt = ?self.event.kind,
            evt_node = self.event.node.id,
            "started exchange init"
        );

        let exchange = self.classify(crd_local)?;
        self.update_topologies(crd_local);

        match exchange {
            ExchangeType::All => self.distributed_exchange().await?,
            ExchangeType::Client => self.client_only_exchange().await?,
            ExchangeType::None => {
                self.complete(top_ver, None);
                self.init_done().await;
            }
        }

        info!(exchange = %self.exch_id, crd = crd_local, "finished exchange init");
        Ok(())
    }

    /// Decide the exchange type from the initial event.
    fn classify(&self, crd: bool) -> Result<ExchangeType> {
        let exch_id = &self.exch_id;
        let snapshot = &self.disco_snapshot;
        if let Some(custom) = &self.event.custom {
            return match custom {
                CustomMessage::ChangeGlobalState { activate, .. } => {
                    Ok(self.on_cluster_state_change(crd, *activate))
                }
                CustomMessage::CacheChange(batch) => {
                    self.ctx
                        .affinity()
                        .on_cache_change_request(exch_id, snapshot, crd, batch)?;
                    Ok(self.server_or_client())
                }
                CustomMessage::AffinityChange(msg) => {
                    self.ctx
                        .affinity()
                        .on_change_affinity_message(exch_id, crd, msg)?;
                    Ok(self.server_or_client())
                }
                CustomMessage::Snapshot { .. } => {
                    if self.event.node.client {
                        self.on_client_node_event(crd)
                    } else {
                        self.on_server_node_event(crd)
                    }
                }
                CustomMessage::ChangeGlobalStateFinish { .. } => Ok(ExchangeType::None),
            };
        }

        if self.event.kind == EventKind::Joined {
            if self.event.node.id != self.ctx.local_id() {
                let started = self
                    .ctx
                    .lifecycle()
                    .start_received_caches(self.event.node.id, self.initial_version());
                if !started.is_empty() {
                    debug!(
                        exchange = %exch_id,
                        groups = started.len(),
                        "started caches received from joining node"
                    );
                }
            } else {
                self.init_caches_on_local_join()?;
            }
        }

        if self.event.node.client {
            self.on_client_node_event(crd)
        } else {
            self.on_server_node_event(crd)
        }
    }

    fn server_or_client(&self) -> ExchangeType {
        if self.ctx.is_client() {
            ExchangeType::Client
        } else {
            ExchangeType::All
        }
    }

    fn on_client_node_event(&self, crd: bool) -> Result<ExchangeType> {
        debug_assert!(self.event.node.client);
        self.ctx
            .affinity()
            .on_client_event(&self.exch_id, &self.disco_snapshot, crd);
        Ok(if self.event.node.id == self.ctx.local_id() {
            ExchangeType::Client
        } else {
            ExchangeType::None
        })
    }

    fn on_server_node_event(&self, crd: bool) -> Result<ExchangeType> {
        debug_assert!(!self.event.node.client);
        if self.event.kind.is_departure() {
            let centralized =
                self.ctx
                    .affinity()
                    .on_server_left(&self.exch_id, &self.disco_snapshot, crd);
            self.guarded.lock().unwrap().centralized_aff = centralized;
        } else {
            self.ctx
                .affinity()
                .on_server_join(&self.exch_id, &self.disco_snapshot, crd);
        }
        Ok(self.server_or_client())
    }

    fn on_cluster_state_change(&self, crd: bool, activate: bool) -> ExchangeType {
        let result = if activate {
            info!(exchange = %self.exch_id, "start activation process");
            self.ctx.lifecycle().activate().and_then(|()| {
                if self.ctx.persistence().persistence_enabled() && !self.ctx.is_client() {
                    let groups: Vec<u64> = self
                        .ctx
                        .exchange_groups()
                        .iter()
                        .map(|g| g.group_id())
                        .collect();
                    self.ctx
                        .persistence()
                        .read_checkpoint_and_restore_memory(&groups)?;
                }
                Ok(())
            })
        } else {
            info!(exchange = %self.exch_id, "start deactivation process");
            self.ctx.lifecycle().deactivate()
        };

        match result {
            Ok(()) => {
                info!(
                    exchange = %self.exch_id,
                    activate,
                    "successfully changed cluster state"
                );
            }
            Err(err) => {
                warn!(
                    exchange = %self.exch_id,
                    activate,
                    "failed to change cluster state: {}", err
                );
                let mut guarded = self.guarded.lock().unwrap();
                guarded.change_state_local_error = Some(err.to_string());
                if crd {
                    guarded
                        .change_state_errors
                        .insert(self.ctx.local_id(), err.to_string());
                }
            }
        }

        self.server_or_client()
    }

    fn init_caches_on_local_join(&self) -> Result<()> {
        let caches = self.ctx.lifecycle().caches_to_start_on_local_join();
        if self.ctx.persistence().persistence_enabled() && !self.ctx.is_client() {
            self.ctx
                .persistence()
                .read_checkpoint_and_restore_memory(&caches)?;
        }
        self.ctx
            .lifecycle()
            .start_caches_on_local_join(&caches, self.initial_version())
    }

    /// Pre-exchange topology update: adopt pending client views on the
    /// coordinator, drop the reported map of a departed server, and bump
    /// every group onto this exchange's version, without crossing a
    /// checkpoint boundary.
    fn update_topologies(&self, crd: bool) {
        let ver = self.initial_version();
        let departed = self
            .event
            .is_server_membership()
            .then_some(self.event.node.id)
            .filter(|_| self.event.kind.is_departure());
        self.ctx.persistence().checkpoint_read_lock();
        for group in self.ctx.exchange_groups() {
            if let Some(node_id) = departed {
                group.topology().remove_node(node_id);
            }
            group.topology().before_exchange(ver, crd);
        }
        self.ctx.persistence().checkpoint_read_unlock();
    }

    async fn distributed_exchange(self: &Arc<Self>) -> Result<()> {
        debug_assert!(!self.ctx.is_client());

        self.ctx.persistence().release_history_for_preloading();
        let reserved = self.ctx.persistence().reserve_history_for_exchange();
        {
            let mut guarded = self.guarded.lock().unwrap();
            guarded.part_hist_reserved = if reserved.is_empty() {
                None
            } else {
                Some(reserved)
            };
        }

        let left_node = self
            .event
            .kind
            .is_departure()
            .then_some(self.event.node.id);
        quiesce::wait_partition_release(
            &self.ctx,
            &self.exch_id,
            self.initial_version(),
            left_node,
        )
        .await;

        // The release future is done, so write-behind stores can flush.
        let top_changed = !self.event.is_custom() || self.aff_change_msg.is_some();
        if top_changed {
            for group in self.ctx.exchange_groups() {
                self.ctx.persistence().flush_write_behind(group.group_id());
            }
        }

        self.ctx.persistence().before_exchange(self.initial_version())?;

        let (crd_local, remaining_empty, crd) = {
            let guarded = self.guarded.lock().unwrap();
            (
                guarded
                    .crd
                    .map(|c| c.id == self.ctx.local_id())
                    .unwrap_or(false),
                guarded.remaining.is_empty(),
                guarded.crd,
            )
        };
        if crd_local {
            if remaining_empty {
                self.pending_updates.wait().await;
                self.on_all_received().await?;
            }
        } else if let Some(crd) = crd {
            self.send_partitions(crd).await;
        }

        self.init_done().await;
        Ok(())
    }

    async fn client_only_exchange(self: &Arc<Self>) -> Result<()> {
        let (crd, centralized) = {
            let guarded = self.guarded.lock().unwrap();
            (guarded.crd, guarded.centralized_aff)
        };
        if let Some(crd) = crd {
            debug_assert!(crd.id != self.ctx.local_id());
            if !centralized {
                self.send_partitions(crd).await;
            }
            self.init_done().await;
            return Ok(());
        }

        // The last server node failed; finish right away.
        info!(exchange = %self.exch_id, "client-only exchange with no servers left");
        self.complete(self.initial_version(), None);
        self.init_done().await;
        Ok(())
    }

    /// Build and send the local single message to `to`.
    async fn send_partitions(&self, to: NodeDesc) {
        if let Some(batch) = &self.exch_actions {
            if !batch.reset_lost_groups.is_empty() {
                self.reset_lost_partitions(&batch.reset_lost_groups);
            }
        }

        let mut msg = if self.ctx.is_client() {
            SingleMessage::client(self.exch_id.clone())
        } else {
            let reserved = self.guarded.lock().unwrap().part_hist_reserved.clone();
            codec::create_single_message(&self.ctx, self.exch_id.clone(), reserved.as_ref())
        };

        let local_error = self.guarded.lock().unwrap().change_state_local_error.clone();
        if self.state_change_exchange() && local_error.is_some() {
            msg.error = local_error;
        } else if self.local_join_exchange() {
            msg.groups_affinity_request = self
                .ctx
                .exchange_groups()
                .iter()
                .map(|g| g.group_id())
                .collect();
        }

        debug!(
            exchange = %self.exch_id,
            node = to.id,
            "sending local partitions"
        );
        let _ = codec::send_envelope(&self.ctx, to.id, Envelope::single(msg), &self.exch_id).await;
    }
}

// Message handling.
impl ExchangeFuture {
    pub async fn on_receive_single_message(self: &Arc<Self>, node: NodeDesc, msg: SingleMessage) {
        if msg.restore_state {
            let new_crd = self.guarded.lock().unwrap().new_crd.clone();
            match new_crd {
                Some(ncf) => ncf.on_message(node, msg),
                None => warn!(
                    exchange = %self.exch_id,
                    node = node.id,
                    "dropping restore state reply, no new coordinator round"
                ),
            }
            return;
        }

        if !msg.client {
            self.update_last_version(msg.last_version);
        }

        let merged_with = {
            let mut guarded = self.guarded.lock().unwrap();
            if guarded.state == Some(ExchangeState::Merged) {
                guarded.merged_with.clone()
            } else {
                debug_assert!(guarded.state != Some(ExchangeState::Client));
                if self.exch_id.is_joined() && node.id == self.exch_id.initiator {
                    guarded.pending_join_msg = Some(msg.clone());
                }
                None
            }
        };
        if let Some(target) = merged_with {
            target.process_merged_message(node, msg).await;
            return;
        }

        let this = self.clone();
        self.run_after_init(async move {
            this.process_single_message(node, msg).await;
        })
        .await;
    }

    async fn process_single_message(self: &Arc<Self>, node: NodeDesc, msg: SingleMessage) {
        if msg.client {
            self.wait_and_reply_to_client(node, msg);
            return;
        }

        let mut all_received = false;
        let mut update_map = false;
        let mut finish_state = None;
        let mut work_guard = None;
        {
            let mut guarded = self.guarded.lock().unwrap();
            debug_assert!(guarded.crd.is_some());
            match guarded.state.expect("state set at init") {
                ExchangeState::Done => {
                    info!(
                        exchange = %self.exch_id,
                        node = node.id,
                        "received single message, already done"
                    );
                    finish_state = guarded.finish_state.clone();
                }
                ExchangeState::Crd => {
                    if guarded.remaining.remove(&node.id) {
                        update_map = true;
                        work_guard = Some(self.pending_updates.work());
                        if self.state_change_exchange() {
                            if let Some(err) = &msg.error {
                                guarded.change_state_errors.insert(node.id, err.clone());
                            }
                        }
                        all_received = guarded.remaining.is_empty();
                        info!(
                            exchange = %self.exch_id,
                            node = node.id,
                            all_received,
                            "coordinator received single message"
                        );
                    }
                }
                ExchangeState::Srv | ExchangeState::BecomeCrd => {
                    info!(
                        exchange = %self.exch_id,
                        node = node.id,
                        state = ?guarded.state,
                        "non-coordinator received single message"
                    );
                    guarded.pending_single_msgs.insert(node.id, msg.clone());
                }
                state => debug_assert!(false, "unexpected state {:?}", state),
            }
        }

        if let Some(finish_state) = finish_state {
            self.send_full_to_node(&finish_state, &msg, node.id).await;
            return;
        }

        if update_map {
            // The heavy partition map merge runs outside the monitor; the
            // in-flight count gives the decide step a quiesced view.
            if !self.deactivate_cluster() {
                self.update_partition_single_map(node.id, &msg);
            }
            drop(work_guard);
        }

        if all_received {
            self.pending_updates.wait().await;
            let _ = self.on_all_received().await;
        }
    }

    /// Reply to a client single message: from the finish state, or from a
    /// fresh snapshot so clients never block behind peer quiesce.
    fn wait_and_reply_to_client(self: &Arc<Self>, node: NodeDesc, msg: SingleMessage) {
        debug_assert!(msg.client);
        let this = self.clone();
        tokio::spawn(async move {
            if this.done.wait().await.is_err() {
                return;
            }
            let finish_state = this.guarded.lock().unwrap().finish_state.clone();
            let finish_state = match finish_state.filter(|f| f.msg.is_some()) {
                Some(fs) => fs,
                None => FinishState {
                    crd_id: Some(this.ctx.local_id()),
                    res_ver: this.initial_version(),
                    msg: Some(codec::create_full_message(
                        &this.ctx,
                        this.exch_id.clone(),
                        this.last_version.load(Ordering::Acquire),
                        &[],
                        &PartsToReload::default(),
                        false,
                    )),
                },
            };
            this.send_full_to_node(&finish_state, &msg, node.id).await;
        });
    }

    /// Late senders receive a copy of the decided full message re-stamped
    /// with their own exchange id.
    async fn send_full_to_node(&self, finish_state: &FinishState, msg: &SingleMessage, to: u64) {
        let mut full = match finish_state.msg.clone() {
            Some(full) => full,
            None => {
                warn!(
                    exchange = %self.exch_id,
                    node = to,
                    "no finish message to reply with"
                );
                return;
            }
        };
        full.exchange_id = msg.exchange_id.clone();
        if !msg.groups_affinity_request.is_empty() {
            full.joined_node_affinity = self.affinity_messages(&msg.groups_affinity_request);
        }
        let _ = codec::send_envelope(&self.ctx, to, Envelope::full(full), &self.exch_id).await;
    }

    fn affinity_messages(&self, groups: &[u64]) -> HashMap<u64, GroupAffinity> {
        groups
            .iter()
            .map(|group_id| {
                (
                    *group_id,
                    codec::group_affinity(&self.ctx.affinity().ideal_assignment(*group_id)),
                )
            })
            .collect()
    }

    fn update_partition_single_map(&self, node_id: u64, msg: &SingleMessage) {
        self.guarded
            .lock()
            .unwrap()
            .msgs
            .insert(node_id, msg.clone());
        for (group_id, map) in &msg.partitions {
            if let Some(group) = self.ctx.group(*group_id) {
                group.topology().update_single(map.clone());
            }
        }
    }

    async fn on_all_received(self: &Arc<Self>) -> Result<()> {
        let crd = self.guarded.lock().unwrap().crd;
        debug_assert!(crd.map(|c| c.id == self.ctx.local_id()).unwrap_or(false));

        // A fail-over coordinator was not the first server of the snapshot;
        // re-run the pre-exchange bump so group versions match its view.
        let first = self.disco_snapshot.server_nodes().first().copied();
        if crd != first {
            for group in self.ctx.exchange_groups() {
                group.topology().before_exchange(self.initial_version(), false);
            }
        }

        if self.ctx.config().exchange.merge_exchanges {
            if let Some(mgr) = self.mgr.upgrade() {
                info!(
                    exchange = %self.exch_id,
                    "coordinator received all messages, try merge"
                );
                if !mgr.merge_exchanges_on_coordinator(self).await {
                    return Ok(());
                }
            }
        }

        self.finish_exchange_on_coordinator().await
    }

    async fn finish_exchange_on_coordinator(self: &Arc<Self>) -> Result<()> {
        if let Err(err) = self.do_finish_on_coordinator().await {
            let err = self.wrap_reconnect(err);
            self.complete(self.result_version(), Some(err));
        }
        Ok(())
    }

    async fn do_finish_on_coordinator(self: &Arc<Self>) -> Result<()> {
        let res_ver = self.result_version();
        info!(
            exchange = %self.exch_id,
            res_ver = %res_ver,
            "finish exchange on coordinator"
        );

        let merged = !self.guarded.lock().unwrap().merged_events.is_empty();
        let merged_left = merged && self.has_server_left();

        let mut ideal_aff_diff: HashMap<u64, GroupAffinity> = HashMap::new();
        if merged {
            if merged_left {
                for group in self.ctx.exchange_groups() {
                    ideal_aff_diff.insert(
                        group.group_id(),
                        codec::group_affinity(
                            &self.ctx.affinity().ideal_assignment(group.group_id()),
                        ),
                    );
                }
            }
            for group in self.ctx.exchange_groups() {
                group.topology().before_exchange(res_ver, false);
            }
            let merged_msgs: Vec<(u64, SingleMessage)> = {
                let guarded = self.guarded.lock().unwrap();
                guarded
                    .merged_join_exch_msgs
                    .iter()
                    .filter_map(|(id, m)| m.clone().map(|m| (*id, m)))
                    .collect()
            };
            for (node_id, msg) in merged_msgs {
                self.update_partition_single_map(node_id, &msg);
            }
        }

        // Apply update counters once all single messages are in, and build
        // the affinity payloads requested by joining nodes.
        let msgs = self.guarded.lock().unwrap().msgs.clone();
        let mut joined_node_aff: HashMap<u64, GroupAffinity> = HashMap::new();
        for (node_id, msg) in &msgs {
            for (group_id, counters) in &msg.update_counters {
                if let Some(group) = self.ctx.group(*group_id) {
                    group.topology().apply_update_counters(&counters.counters);
                }
            }
            for group_id in &msg.groups_affinity_request {
                joined_node_aff.entry(*group_id).or_insert_with(|| {
                    codec::group_affinity(&self.ctx.affinity().ideal_assignment(*group_id))
                });
                // A joiner with no partitions yet starts MOVING on every
                // partition the ideal assignment gives it.
                let empty = msg
                    .partitions
                    .get(group_id)
                    .map(|m| m.parts.is_empty())
                    .unwrap_or(true);
                if empty {
                    if let Some(group) = self.ctx.group(*group_id) {
                        let ideal = self.ctx.affinity().ideal_assignment(*group_id);
                        let mut map = PartitionMap {
                            node_id: *node_id,
                            update_seq: 1,
                            top_ver: Some(res_ver),
                            parts: HashMap::new(),
                        };
                        for (part, nodes) in ideal.iter().enumerate() {
                            if nodes.contains(node_id) {
                                map.set(part as u32, PartitionState::Moving);
                            }
                        }
                        group.topology().update_single(map);
                    }
                }
            }
        }

        if self.event.is_custom() {
            if self.activate_cluster() {
                self.assign_partitions_states()?;
            }
            if let Some(batch) = &self.exch_actions {
                if !batch.reset_lost_groups.is_empty() {
                    self.reset_lost_partitions(&batch.reset_lost_groups);
                }
            }
        } else {
            if self.has_server_join() {
                self.assign_partitions_states()?;
            }
            if self.has_server_left() {
                self.detect_lost_partitions(res_ver);
            }
        }

        self.update_last_version(self.ctx.versions().last());
        self.ctx
            .versions()
            .on_exchange(self.last_version.load(Ordering::Acquire));

        let (suppliers, reload, centralized) = {
            let guarded = self.guarded.lock().unwrap();
            (
                guarded.part_hist_suppliers.clone(),
                guarded.parts_to_reload.clone(),
                guarded.centralized_aff,
            )
        };
        let mut msg = codec::create_full_message(
            &self.ctx,
            self.exch_id.clone(),
            self.last_version.load(Ordering::Acquire),
            &suppliers,
            &reload,
            true,
        );
        if merged {
            debug_assert!(!centralized);
            msg.result_topology_version = Some(res_ver);
            if merged_left {
                msg.ideal_affinity_diff = ideal_aff_diff;
            }
        }

        let state_errors = self.guarded.lock().unwrap().change_state_errors.clone();
        let state_change_err = self.state_change_exchange() && !state_errors.is_empty();
        if state_change_err {
            msg.errors = state_errors.clone();
        }

        {
            let mut guarded = self.guarded.lock().unwrap();
            guarded.finish_state = Some(FinishState {
                crd_id: Some(self.ctx.local_id()),
                res_ver,
                msg: Some(msg.clone()),
            });
            guarded.state = Some(ExchangeState::Done);
        }

        if centralized {
            debug_assert!(!merged);
            let assignments = self
                .ctx
                .affinity()
                .init_affinity_on_node_left(&self.exch_id, &self.disco_snapshot)
                .await?;
            let full = codec::create_full_message(
                &self.ctx,
                self.exch_id.clone(),
                self.last_version.load(Ordering::Acquire),
                &suppliers,
                &reload,
                false,
            );
            let aff_msg = AffinityChangeMessage {
                exchange_id: Some(self.exch_id.clone()),
                partitions: Some(full),
                assignments: assignments
                    .iter()
                    .map(|(group_id, a)| (*group_id, codec::group_affinity(a)))
                    .collect(),
            };
            debug!(
                exchange = %self.exch_id,
                "centralized affinity exchange, send affinity change message"
            );
            self.ctx
                .discovery()
                .send_custom_event(CustomMessage::AffinityChange(aff_msg))?;
            // Completion happens when the ring delivers the message back.
            return Ok(());
        }

        let (nodes, merged_map) = {
            let guarded = self.guarded.lock().unwrap();
            let mut nodes: Vec<NodeDesc> = guarded
                .srv_nodes
                .iter()
                .filter(|n| n.id != self.ctx.local_id())
                .copied()
                .collect();
            for (node_id, slot) in &guarded.merged_join_exch_msgs {
                if slot.is_some() && !nodes.iter().any(|n| n.id == *node_id) {
                    if let Some(node) = self.ctx.discovery().node(*node_id) {
                        nodes.push(node);
                    }
                }
            }
            (nodes, guarded.merged_join_exch_msgs.clone())
        };

        let mut err = None;
        if let Some((request_id, activate)) = self.state_change {
            if state_change_err {
                err = Some(Error::StateChangeFailed);
                self.ctx
                    .lifecycle()
                    .on_state_change_error(&state_errors, activate);
            }
            let active = !state_change_err && activate;
            if let Err(send_err) = self
                .ctx
                .discovery()
                .send_custom_event(CustomMessage::ChangeGlobalStateFinish { request_id, active })
            {
                warn!(
                    exchange = %self.exch_id,
                    "failed to send state change finish message: {}", send_err
                );
            }
        }

        if !nodes.is_empty() {
            self.send_all_partitions(&msg, &nodes, &merged_map, &joined_node_aff)
                .await;
        }

        self.complete(res_ver, err);

        let pending: Vec<(u64, SingleMessage)> = {
            let guarded = self.guarded.lock().unwrap();
            guarded
                .pending_single_msgs
                .iter()
                .map(|(id, m)| (*id, m.clone()))
                .collect()
        };
        for (node_id, msg) in pending {
            let node = self
                .ctx
                .discovery()
                .node(node_id)
                .unwrap_or(NodeDesc::server(node_id, u64::MAX));
            Box::pin(self.process_single_message(node, msg)).await;
        }
        Ok(())
    }

    /// Distribute the full message. Affinity requesters get a customized
    /// copy; merged join exchanges get the message stamped with their own
    /// exchange id.
    async fn send_all_partitions(
        &self,
        msg: &FullMessage,
        nodes: &[NodeDesc],
        merged: &HashMap<u64, Option<SingleMessage>>,
        joined_node_aff: &HashMap<u64, GroupAffinity>,
    ) {
        debug_assert!(!nodes.iter().any(|n| n.id == self.ctx.local_id()));
        debug!(
            exchange = %self.exch_id,
            nodes = nodes.len(),
            "sending full partition map"
        );
        let msgs = self.guarded.lock().unwrap().msgs.clone();
        for node in nodes {
            let mut out = msg.clone();
            let requested = msgs
                .get(&node.id)
                .map(|m| !m.groups_affinity_request.is_empty())
                .unwrap_or(false);
            if requested && !joined_node_aff.is_empty() {
                out.joined_node_affinity = joined_node_aff.clone();
            }
            if let Some(Some(merged_msg)) = merged.get(&node.id) {
                out.exchange_id = merged_msg.exchange_id.clone();
            }
            let _ =
                codec::send_envelope(&self.ctx, node.id, Envelope::full(out), &self.exch_id).await;
        }
    }

    /// Counter reconciliation over every group. A failed local history
    /// reservation fails the exchange; the node must reconnect.
    fn assign_partitions_states(&self) -> Result<()> {
        let (msgs, reserved) = {
            let guarded = self.guarded.lock().unwrap();
            (guarded.msgs.clone(), guarded.part_hist_reserved.clone())
        };
        let mut suppliers = Vec::new();
        let mut parts_to_reload = PartsToReload::default();
        for group in self.ctx.exchange_groups() {
            let group_id = group.group_id();
            let local_reserved = reserved.as_ref().and_then(|r| r.get(&group_id));
            let persistence = self.ctx.persistence();
            reconcile::assign_partition_states(
                self.ctx.local_id(),
                group_id,
                group.topology(),
                &msgs,
                local_reserved,
                &|part, counter| persistence.reserve_history_for_preloading(group_id, part, counter),
                &mut suppliers,
                &mut parts_to_reload,
            )?;
        }
        let mut guarded = self.guarded.lock().unwrap();
        guarded.part_hist_suppliers = suppliers;
        guarded.parts_to_reload = parts_to_reload;
        Ok(())
    }

    fn detect_lost_partitions(&self, res_ver: TopologyVersion) {
        let mut detected = false;
        for group in self.ctx.exchange_groups() {
            if group.topology().detect_lost_partitions(res_ver) {
                detected = true;
            }
        }
        if detected {
            EXCHANGE_LOST_PARTITIONS_TOTAL.inc();
            if let Some(mgr) = self.mgr.upgrade() {
                mgr.schedule_resend_partitions();
            }
        }
    }

    fn reset_lost_partitions(&self, groups: &[u64]) {
        for group_id in groups {
            if let Some(group) = self.ctx.group(*group_id) {
                group.topology().reset_lost_partitions(self.initial_version());
            }
        }
    }
}

// Full message path (non-coordinator).
impl ExchangeFuture {
    pub async fn on_receive_full_message(self: &Arc<Self>, node: NodeDesc, msg: FullMessage) {
        let this = self.clone();
        self.run_after_init(async move {
            this.process_full_message(true, Some(node), msg).await;
        })
        .await;
    }

    async fn process_full_message(
        self: &Arc<Self>,
        check_crd: bool,
        node: Option<NodeDesc>,
        msg: FullMessage,
    ) {
        debug_assert!(msg.exchange_id.as_ref() == Some(&self.exch_id));

        if check_crd {
            let node = node.expect("sender required when checking the coordinator");
            let mut guarded = self.guarded.lock().unwrap();
            let crd = match guarded.crd {
                Some(crd) => crd,
                None => {
                    info!(exchange = %self.exch_id, "ignore full message, all server nodes left");
                    return;
                }
            };
            match guarded.state.expect("state set at init") {
                ExchangeState::Crd | ExchangeState::BecomeCrd => {
                    info!(exchange = %self.exch_id, "ignore full message, node is coordinator");
                    return;
                }
                ExchangeState::Done => {
                    info!(exchange = %self.exch_id, "ignore full message, future is done");
                    return;
                }
                ExchangeState::Merged => return,
                ExchangeState::Srv | ExchangeState::Client => {
                    if crd.id != node.id {
                        info!(
                            exchange = %self.exch_id,
                            node = node.id,
                            node_order = node.order,
                            crd = crd.id,
                            crd_order = crd.order,
                            "received full message from non-coordinator"
                        );
                        // May become valid if this sender takes over.
                        if node.order > crd.order {
                            guarded.full_msgs.insert(node.id, (node, msg));
                        }
                        return;
                    }
                    let res_ver = msg.result_version_or(self.initial_version());
                    info!(
                        exchange = %self.exch_id,
                        node = node.id,
                        res_ver = %res_ver,
                        "received full message, will finish exchange"
                    );
                    guarded.finish_state = Some(FinishState {
                        crd_id: Some(crd.id),
                        res_ver,
                        msg: Some(msg.clone()),
                    });
                    guarded.state = Some(ExchangeState::Done);
                }
            }
        } else {
            debug_assert!(node.is_none());
        }

        let mut res_ver = self.initial_version();
        if self.ctx.config().exchange.merge_exchanges {
            if let Some(msg_res_ver) = msg.result_topology_version {
                if msg_res_ver != self.initial_version() {
                    info!(
                        exchange = %self.exch_id,
                        res_ver = %msg_res_ver,
                        "received full message, need merge"
                    );
                    res_ver = msg_res_ver;
                    if let Some(mgr) = self.mgr.upgrade() {
                        mgr.merge_exchanges(self, msg_res_ver).await;
                    }
                }
            }
            if self.local_join_exchange() {
                self.ctx
                    .affinity()
                    .on_local_join(&self.exch_id, &msg, res_ver);
            } else if res_ver != self.initial_version() {
                for group in self.ctx.exchange_groups() {
                    group.topology().before_exchange(res_ver, false);
                }
            }
        }

        self.update_partition_full_map(res_ver, &msg);

        let mut err = None;
        if self.state_change_exchange() && !msg.errors.is_empty() {
            err = Some(Error::StateChangeFailed);
            self.ctx
                .lifecycle()
                .on_state_change_error(&msg.errors, self.activate_cluster());
        }
        self.complete(res_ver, err);
    }

    /// Apply the decided partition maps, counters, suppliers and reload
    /// sets to every group.
    fn update_partition_full_map(&self, res_ver: TopologyVersion, msg: &FullMessage) {
        self.ctx.versions().on_exchange(msg.last_version);
        self.update_last_version(msg.last_version);
        {
            let mut guarded = self.guarded.lock().unwrap();
            guarded.part_hist_suppliers = msg.history_suppliers.clone();
        }
        for (group_id, full) in &msg.partitions {
            let group = match self.ctx.group(*group_id) {
                Some(group) => group,
                None => continue,
            };
            let counters = msg
                .update_counters
                .get(group_id)
                .map(|c| c.counters.clone())
                .unwrap_or_default();
            let reload = msg.parts_to_reload(self.ctx.local_id(), *group_id);
            group
                .topology()
                .update_full(self.ctx.local_id(), res_ver, full, &counters, &reload);
        }
    }
}

// Single request path: plain probes and restore-state probes.
impl ExchangeFuture {
    pub async fn on_receive_single_request(self: &Arc<Self>, node: NodeDesc, msg: SingleRequest) {
        debug_assert!(!node.client);
        let this = self.clone();
        self.run_after_init(async move {
            this.process_single_partition_request(node, msg).await;
        })
        .await;
    }

    async fn process_single_partition_request(
        self: &Arc<Self>,
        node: NodeDesc,
        req: SingleRequest,
    ) {
        let mut finish_state = None;
        {
            let mut guarded = self.guarded.lock().unwrap();
            let crd = match guarded.crd {
                Some(crd) => crd,
                None => {
                    info!(
                        exchange = %self.exch_id,
                        node = node.id,
                        "ignore partitions request, no coordinator"
                    );
                    return;
                }
            };
            match guarded.state.expect("state set at init") {
                ExchangeState::Done => {
                    let fs = guarded.finish_state.clone();
                    if fs.as_ref().and_then(|f| f.crd_id) == Some(node.id) {
                        info!(
                            exchange = %self.exch_id,
                            node = node.id,
                            "ignore partitions request, finished exchange with this coordinator"
                        );
                        return;
                    }
                    finish_state = fs;
                }
                ExchangeState::Crd | ExchangeState::BecomeCrd => {
                    info!(
                        exchange = %self.exch_id,
                        node = node.id,
                        "ignore partitions request, node is coordinator"
                    );
                    return;
                }
                ExchangeState::Merged => return,
                ExchangeState::Srv | ExchangeState::Client => {
                    if !self.ctx.discovery().alive(node.id) {
                        info!(
                            exchange = %self.exch_id,
                            node = node.id,
                            "ignore restore state request, node is not alive"
                        );
                        return;
                    }
                    if req.restore_state && node.id != crd.id {
                        // Consensus-free takeover: the discovery order
                        // decides who may preempt the current coordinator.
                        if node.order > crd.order {
                            info!(
                                exchange = %self.exch_id,
                                old_crd = crd.id,
                                new_crd = node.id,
                                "received restore state request, change coordinator"
                            );
                            // No full message from the old coordinator is
                            // accepted from now on.
                            guarded.crd = Some(node);
                        } else {
                            info!(
                                exchange = %self.exch_id,
                                old_crd = crd.id,
                                new_crd = node.id,
                                "ignore restore state request, coordinator changed"
                            );
                            return;
                        }
                    }
                }
            }
        }

        if req.restore_state {
            let restore_id = req
                .restore_exchange_id
                .clone()
                .unwrap_or_else(|| self.exch_id.clone());
            let reserved = self.guarded.lock().unwrap().part_hist_reserved.clone();
            let mut res = if self.ctx.is_client() {
                SingleMessage::client(restore_id)
            } else {
                codec::create_single_message(&self.ctx, restore_id, reserved.as_ref())
            };
            if self.local_join_exchange() && finish_state.is_none() {
                res.groups_affinity_request = self
                    .ctx
                    .exchange_groups()
                    .iter()
                    .map(|g| g.group_id())
                    .collect();
            }
            res.restore_state = true;
            res.finish_message = finish_state.and_then(|f| f.msg).map(Box::new);
            let _ =
                codec::send_envelope(&self.ctx, node.id, Envelope::single(res), &self.exch_id)
                    .await;
            return;
        }

        self.send_partitions(node).await;
    }
}

// Centralized affinity distribution over the discovery ring.
impl ExchangeFuture {
    pub async fn on_affinity_change_message(
        self: &Arc<Self>,
        from: NodeDesc,
        msg: AffinityChangeMessage,
    ) {
        debug_assert!(msg.exchange_id.as_ref() == Some(&self.exch_id));
        let this = self.clone();
        self.run_after_init(async move {
            if this.is_done() {
                return;
            }
            let (crd, centralized) = {
                let guarded = this.guarded.lock().unwrap();
                (guarded.crd, guarded.centralized_aff)
            };
            let crd = match crd {
                Some(crd) => crd,
                None => return,
            };
            debug_assert!(centralized);
            if crd.id != from.id {
                debug!(
                    exchange = %this.exch_id,
                    node = from.id,
                    crd = crd.id,
                    "ignore affinity change message, coordinator changed"
                );
                return;
            }

            let res_ver = this.initial_version();
            let crd_local = crd.id == this.ctx.local_id();
            if let Err(err) =
                this.ctx
                    .affinity()
                    .on_change_affinity_message(&this.exch_id, crd_local, &msg)
            {
                this.complete(res_ver, Some(err));
                return;
            }
            if !crd_local {
                if let Some(parts) = &msg.partitions {
                    this.update_partition_full_map(res_ver, parts);
                }
            }
            this.complete(res_ver, None);
        })
        .await;
    }
}

// Node departures and coordinator failover.
impl ExchangeFuture {
    pub async fn on_node_left(self: &Arc<Self>, node: NodeDesc) {
        if self.is_done() {
            return;
        }
        self.ctx
            .tx_tracker()
            .remove_explicit_node_locks(node.id, self.initial_version());
        let this = self.clone();
        self.run_after_init(async move {
            this.process_node_left(node).await;
        })
        .await;
    }

    async fn process_node_left(self: &Arc<Self>, node: NodeDesc) {
        if self.is_done() {
            return;
        }

        let new_crd = self.guarded.lock().unwrap().new_crd.clone();
        if let Some(ncf) = new_crd {
            ncf.on_node_left(node.id);
        }

        let mut crd_changed = false;
        let mut all_received = false;
        let mut become_crd = None;
        let crd0;
        {
            let mut guarded = self.guarded.lock().unwrap();
            let before = guarded.srv_nodes.len();
            guarded.srv_nodes.retain(|n| n.id != node.id);
            if guarded.srv_nodes.len() == before {
                return;
            }

            let mut rmvd = guarded.remaining.remove(&node.id);
            if !rmvd {
                // An awaited merged joiner that left cancels its slot.
                if let Some(None) = guarded.merged_join_exch_msgs.get(&node.id) {
                    guarded.merged_join_exch_msgs.remove(&node.id);
                    guarded.await_merged_msgs = guarded.await_merged_msgs.saturating_sub(1);
                    rmvd = true;
                }
            }

            if guarded.crd.map(|c| c.id) == Some(node.id) {
                crd_changed = true;
                guarded.crd = guarded.srv_nodes.first().copied();
            }

            match guarded.state.expect("state set at init") {
                ExchangeState::Done => return,
                ExchangeState::Crd => {
                    all_received = rmvd
                        && guarded.remaining.is_empty()
                        && guarded.merged_join_exch_msgs.is_empty();
                }
                ExchangeState::Srv => {
                    debug_assert!(guarded.crd.is_some());
                    if crd_changed
                        && guarded
                            .crd
                            .map(|c| c.id == self.ctx.local_id())
                            .unwrap_or(false)
                    {
                        guarded.state = Some(ExchangeState::BecomeCrd);
                        let peers: Vec<NodeDesc> = guarded
                            .srv_nodes
                            .iter()
                            .filter(|n| n.id != self.ctx.local_id())
                            .copied()
                            .collect();
                        let ncf = Arc::new(InitNewCoordinator::new(self.exch_id.clone(), peers));
                        guarded.new_crd = Some(ncf.clone());
                        become_crd = Some(ncf);
                    }
                }
                _ => {}
            }

            crd0 = guarded.crd;
            if crd0.is_none() {
                guarded.finish_state = Some(FinishState {
                    crd_id: None,
                    res_ver: self.initial_version(),
                    msg: None,
                });
            }
        }

        let crd0 = match crd0 {
            Some(crd0) => crd0,
            None => {
                debug_assert!(self.ctx.is_client());
                info!(
                    exchange = %self.exch_id,
                    "all server nodes left, finishing with empty affinity"
                );
                self.complete(self.initial_version(), None);
                return;
            }
        };

        if crd0.id == self.ctx.local_id() {
            {
                let mut guarded = self.guarded.lock().unwrap();
                if self.state_change_exchange() {
                    if let Some(err) = guarded.change_state_local_error.clone() {
                        guarded.change_state_errors.insert(crd0.id, err);
                    }
                }
            }
            if let Some(ncf) = become_crd {
                info!(
                    exchange = %self.exch_id,
                    prev = node.id,
                    "coordinator failed, node is new coordinator"
                );
                EXCHANGE_COORDINATOR_FAILOVER_TOTAL.inc();
                let this = self.clone();
                tokio::spawn(async move {
                    ncf.init(&this.ctx).await;
                    ncf.wait().await;
                    this.on_become_coordinator(ncf).await;
                });
                return;
            }
            if all_received {
                self.pending_updates.wait().await;
                let _ = self.on_all_received().await;
            }
        } else if crd_changed {
            let buffered = {
                let mut guarded = self.guarded.lock().unwrap();
                guarded.full_msgs.remove(&crd0.id)
            };
            if let Some((sender, full)) = buffered {
                info!(
                    exchange = %self.exch_id,
                    crd = crd0.id,
                    "coordinator changed, process pending full message"
                );
                self.process_full_message(true, Some(sender), full).await;
                if self.is_done() {
                    return;
                }
            }
            info!(
                exchange = %self.exch_id,
                crd = crd0.id,
                "coordinator changed, send partitions to new coordinator"
            );
            self.send_partitions(crd0).await;
        }
    }

    /// The restore round is over: adopt a finished outcome if any peer had
    /// one, otherwise run a normal decide step over the restored messages.
    async fn on_become_coordinator(self: &Arc<Self>, ncf: Arc<InitNewCoordinator>) {
        let full_msg = ncf.full_message();
        let process = full_msg.is_none();
        let restore_msgs = ncf.messages();

        for (node_id, msg) in &restore_msgs {
            if msg.client {
                continue;
            }
            if process {
                self.update_partition_single_map(*node_id, msg);
            } else {
                self.guarded.lock().unwrap().msgs.insert(*node_id, msg.clone());
            }
        }

        if let Some(mut full) = full_msg {
            let res_ver = full.result_version_or(self.initial_version());
            info!(
                exchange = %self.exch_id,
                res_ver = %res_ver,
                "new coordinator restored state"
            );
            {
                let mut guarded = self.guarded.lock().unwrap();
                guarded.finish_state = Some(FinishState {
                    crd_id: Some(self.ctx.local_id()),
                    res_ver,
                    msg: Some(full.clone()),
                });
                guarded.state = Some(ExchangeState::Done);
            }
            full.exchange_id = Some(self.exch_id.clone());
            self.process_full_message(false, None, full.clone()).await;

            // Redistribute the outcome to survivors still missing it.
            let nodes = ncf.reply_nodes();
            let aff_groups: Vec<u64> = restore_msgs
                .values()
                .flat_map(|m| m.groups_affinity_request.iter().copied())
                .collect::<HashSet<u64>>()
                .into_iter()
                .collect();
            let joined_node_aff = self.affinity_messages(&aff_groups);
            if !nodes.is_empty() {
                self.send_all_partitions(&full, &nodes, &HashMap::new(), &joined_node_aff)
                    .await;
            }
            return;
        }

        info!(exchange = %self.exch_id, "new coordinator restore state finished");
        {
            let mut guarded = self.guarded.lock().unwrap();
            guarded.remaining.clear();
            debug_assert!(guarded.crd.map(|c| c.id) == Some(self.ctx.local_id()));
            guarded.state = Some(ExchangeState::Crd);
            debug_assert!(guarded.merged_join_exch_msgs.is_empty());
        }
        self.pending_updates.wait().await;
        let _ = self.on_all_received().await;
    }
}

// Merge: folding a later exchange into this one.
impl ExchangeFuture {
    /// Fold this not-yet-initialized join exchange into `target`. Returns
    /// true when the target must wait for the joiner's single message.
    pub(crate) fn merge_join_exchange(self: &Arc<Self>, target: &Arc<ExchangeFuture>) -> bool {
        let pending = {
            let mut guarded = self.guarded.lock().unwrap();
            debug_assert!(!self.is_done());
            debug_assert!(guarded.merged_with.is_none() && guarded.state.is_none());
            guarded.state = Some(ExchangeState::Merged);
            guarded.merged_with = Some(target.clone());
            guarded.pending_join_msg.clone()
        };
        EXCHANGE_MERGE_TOTAL.inc();
        target.add_merged_join_exchange(self.event.node, pending)
    }

    /// Fold this not-yet-initialized exchange into `target` with nothing
    /// to await (departures, or a target that already decided). Returns a
    /// single message the folded exchange held from its initiator.
    pub(crate) fn merge_exchange_on_done(
        &self,
        target: &Arc<ExchangeFuture>,
    ) -> Option<SingleMessage> {
        let mut guarded = self.guarded.lock().unwrap();
        debug_assert!(!self.is_done());
        debug_assert!(guarded.merged_with.is_none());
        debug_assert!(guarded.state.is_none());
        guarded.state = Some(ExchangeState::Merged);
        guarded.merged_with = Some(target.clone());
        EXCHANGE_MERGE_TOTAL.inc();
        guarded.pending_join_msg.clone()
    }

    pub(crate) fn add_merged_event(&self, event: DiscoveryEvent) {
        self.guarded.lock().unwrap().merged_events.push(event);
    }

    fn add_merged_join_exchange(
        self: &Arc<Self>,
        node: NodeDesc,
        msg: Option<SingleMessage>,
    ) -> bool {
        enum Slot {
            Client(SingleMessage),
            Received,
            Awaited,
            Gone,
        }
        let slot = {
            let mut guarded = self.guarded.lock().unwrap();
            debug_assert!(guarded.state == Some(ExchangeState::Crd));
            if node.client {
                match msg {
                    Some(m) => Slot::Client(m),
                    None => Slot::Gone,
                }
            } else if let Some(m) = msg {
                info!(
                    exchange = %self.exch_id,
                    node = node.id,
                    "merge server join exchange, message received"
                );
                guarded.merged_join_exch_msgs.insert(node.id, Some(m));
                Slot::Received
            } else if self.ctx.discovery().alive(node.id) {
                info!(
                    exchange = %self.exch_id,
                    node = node.id,
                    "merge server join exchange, wait for message"
                );
                guarded.merged_join_exch_msgs.insert(node.id, None);
                guarded.await_merged_msgs += 1;
                Slot::Awaited
            } else {
                info!(
                    exchange = %self.exch_id,
                    node = node.id,
                    "merge server join exchange, awaited node left"
                );
                Slot::Gone
            }
        };
        match slot {
            Slot::Client(m) => {
                self.wait_and_reply_to_client(node, m);
                false
            }
            Slot::Awaited => true,
            Slot::Received | Slot::Gone => false,
        }
    }

    /// A single message for an exchange that was merged into this one.
    pub(crate) async fn process_merged_message(
        self: &Arc<Self>,
        node: NodeDesc,
        msg: SingleMessage,
    ) {
        if msg.client {
            self.wait_and_reply_to_client(node, msg);
            return;
        }

        let mut finish_now = false;
        let mut finish_state = None;
        {
            let mut guarded = self.guarded.lock().unwrap();
            if guarded.state == Some(ExchangeState::Done) {
                finish_state = guarded.finish_state.clone();
            } else {
                let process = matches!(guarded.merged_join_exch_msgs.get(&node.id), Some(None));
                info!(
                    exchange = %self.exch_id,
                    node = node.id,
                    process,
                    awaited = guarded.await_merged_msgs,
                    "merge server join exchange, received message"
                );
                if process {
                    guarded.merged_join_exch_msgs.insert(node.id, Some(msg.clone()));
                    debug_assert!(guarded.await_merged_msgs > 0);
                    guarded.await_merged_msgs -= 1;
                    finish_now = guarded.await_merged_msgs == 0;
                }
            }
        }

        if let Some(fs) = finish_state {
            self.send_full_to_node(&fs, &msg, node.id).await;
            return;
        }
        if finish_now {
            let _ = self.finish_exchange_on_coordinator().await;
        }
    }
}

// Completion.
impl ExchangeFuture {
    pub(crate) fn complete(&self, res_ver: TopologyVersion, err: Option<Error>) -> bool {
        let result: ExchangeResult = match err {
            None => Ok(res_ver),
            Some(err) => Err(Arc::new(err)),
        };
        self.complete_result(res_ver, result)
    }

    pub(crate) fn complete_result(&self, res_ver: TopologyVersion, result: ExchangeResult) -> bool {
        if !self.done.try_set(result.clone()) {
            return false;
        }

        match &result {
            Ok(ver) => info!(
                exchange = %self.exch_id,
                res_ver = %ver,
                "finish exchange future"
            ),
            Err(err) => warn!(
                exchange = %self.exch_id,
                "finish exchange future with error: {}", err
            ),
        }

        if result.is_ok() {
            if !self.ctx.is_client()
                && (self.event.is_server_membership() || self.aff_change_msg.is_some())
            {
                self.detect_lost_partitions(res_ver);
            }
            self.ctx.affinity().ready_affinity(res_ver);
            self.ctx.persistence().release_history_for_exchange();
        }

        if let Some(start) = *self.init_ts.lock().unwrap() {
            take_exchange_metrics().observe(start.elapsed().as_secs_f64());
        }
        true
    }

    /// Release collected message memory. The finish message stays so late
    /// requesters can be answered until the next exchange supersedes this
    /// one.
    pub(crate) fn cleanup(&self) {
        let mut guarded = self.guarded.lock().unwrap();
        guarded.msgs.clear();
        guarded.pending_single_msgs.clear();
        guarded.full_msgs.clear();
        guarded.change_state_errors.clear();
    }
}
