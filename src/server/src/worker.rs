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

//! The exchange worker: consumes ordered discovery events, creates one
//! exchange per event, drives them to completion in that order, routes
//! inbound messages to the right exchange, and folds concurrent
//! server-membership exchanges into one round when merging is allowed.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use tessera_api::v1::{
    envelope::Payload, CustomMessage, DiscoveryEvent, Envelope, EventKind, ExchangeId,
    FullMessage, NodeDesc, SingleMessage, SingleRequest, TopologyVersion,
};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::{
    codec::{self, PartsToReload},
    context::SharedContext,
    exchange::{ExchangeFuture, ExchangeResult},
    Result,
};

pub struct ExchangeWorker {
    shared: Arc<WorkerShared>,
}

pub(crate) struct WorkerShared {
    ctx: Arc<SharedContext>,
    /// Busy lock: read side wraps every externally-delivered callback,
    /// write side is taken once at shutdown.
    busy: RwLock<bool>,
    guarded: Mutex<WorkerGuarded>,
    changed: Notify,
    shutdown: Notify,
    /// A partition map refresh is scheduled but has not run yet.
    resend_pending: AtomicBool,
}

/// Completed exchanges kept addressable for late traffic.
const FINISHED_HISTORY: usize = 128;

#[derive(Default)]
struct WorkerGuarded {
    /// Exchanges in event order; the front one is being driven.
    exchanges: Vec<Arc<ExchangeFuture>>,
    /// Recently completed exchanges, newest last.
    history: std::collections::VecDeque<Arc<ExchangeFuture>>,
    /// Kept to answer late single messages and requests, then cleared
    /// when the next exchange supersedes it.
    last_finished: Option<Arc<ExchangeFuture>>,
    /// Messages that arrived before their exchange event did.
    pending_singles: Vec<(NodeDesc, SingleMessage)>,
    pending_fulls: Vec<(NodeDesc, FullMessage)>,
}

impl ExchangeWorker {
    pub fn new(ctx: Arc<SharedContext>) -> Self {
        let shared = Arc::new(WorkerShared {
            ctx,
            busy: RwLock::new(false),
            guarded: Mutex::new(WorkerGuarded::default()),
            changed: Notify::new(),
            shutdown: Notify::new(),
            resend_pending: AtomicBool::new(false),
        });
        let driver = shared.clone();
        tokio::spawn(async move {
            driver.run().await;
        });
        ExchangeWorker { shared }
    }

    /// An ordered event from the discovery layer.
    pub async fn on_discovery_event(&self, event: DiscoveryEvent) {
        let _busy = self.shared.busy.read().await;
        if *_busy {
            return;
        }
        self.shared.process_discovery_event(event).await;
    }

    /// An encoded envelope from the transport.
    pub async fn on_message(&self, from: u64, payload: Bytes) -> Result<()> {
        let _busy = self.shared.busy.read().await;
        if *_busy {
            return Ok(());
        }
        let envelope = codec::decode(&payload)?;
        let node = self
            .shared
            .ctx
            .discovery()
            .node(from)
            .unwrap_or(NodeDesc::server(from, 0));
        match envelope.payload {
            Some(Payload::Single(msg)) if msg.exchange_id.is_some() => {
                self.shared.dispatch_single(node, msg).await
            }
            Some(Payload::Full(msg)) if msg.exchange_id.is_some() => {
                self.shared.dispatch_full(node, msg).await
            }
            Some(Payload::SingleRequest(msg)) if msg.exchange_id.is_some() => {
                self.shared.dispatch_request(node, msg).await
            }
            // Refresh traffic outside any exchange carries no exchange id
            // and applies straight to the group topologies.
            Some(Payload::Full(msg)) => self.shared.apply_partition_update(node, msg),
            Some(Payload::Single(msg)) => self.shared.apply_partition_single_update(node, msg),
            Some(Payload::SingleRequest(_)) => {
                warn!(node = from, "partitions request without exchange id")
            }
            None => warn!(node = from, "empty exchange envelope"),
        }
        Ok(())
    }

    pub fn exchange_future(&self, exchange_id: &ExchangeId) -> Option<Arc<ExchangeFuture>> {
        self.shared.exchange_future(exchange_id)
    }

    /// Tear down: no callback is in flight once the write lock is taken.
    pub async fn stop(&self) {
        let mut stopped = self.shared.busy.write().await;
        *stopped = true;
        self.shared.shutdown.notify_waiters();
    }
}

impl WorkerShared {
    async fn process_discovery_event(self: &Arc<Self>, event: DiscoveryEvent) {
        match &event.custom {
            Some(CustomMessage::ChangeGlobalStateFinish { request_id, active }) => {
                // Consumed by the node's state manager, never an exchange.
                self.ctx.lifecycle().on_state_change_finish(*request_id, *active);
                return;
            }
            Some(CustomMessage::AffinityChange(msg)) if msg.exchange_id.is_some() => {
                // Centralized full-map distribution for a running exchange.
                let exchange_id = msg.exchange_id.clone().unwrap();
                match self.exchange_future(&exchange_id) {
                    Some(fut) => fut.on_affinity_change_message(event.node, msg.clone()).await,
                    None => debug!(
                        exchange = %exchange_id,
                        "affinity change message for unknown exchange"
                    ),
                }
                return;
            }
            _ => {}
        }

        if event.kind.is_departure() {
            let futures: Vec<Arc<ExchangeFuture>> = {
                let guarded = self.guarded.lock().unwrap();
                guarded.exchanges.clone()
            };
            for fut in futures {
                fut.on_node_left(event.node).await;
            }
        }

        let fut = Arc::new(ExchangeFuture::new(
            self.ctx.clone(),
            Arc::downgrade(self),
            event,
        ));
        info!(exchange = %fut.exchange_id(), "created exchange future");
        let (singles, fulls) = {
            let mut guarded = self.guarded.lock().unwrap();
            guarded.exchanges.push(fut.clone());
            let parked = std::mem::take(&mut guarded.pending_singles);
            let (singles, rest): (Vec<_>, Vec<_>) = parked
                .into_iter()
                .partition(|(_, m)| m.exchange_id() == fut.exchange_id());
            guarded.pending_singles = rest;
            let parked = std::mem::take(&mut guarded.pending_fulls);
            let (fulls, rest): (Vec<_>, Vec<_>) = parked
                .into_iter()
                .partition(|(_, m)| m.exchange_id() == fut.exchange_id());
            guarded.pending_fulls = rest;
            (singles, fulls)
        };
        for (node, msg) in singles {
            fut.on_receive_single_message(node, msg).await;
        }
        for (node, msg) in fulls {
            fut.on_receive_full_message(node, msg).await;
        }
        self.changed.notify_waiters();
    }

    /// Drive exchanges to completion in event order.
    async fn run(self: &Arc<Self>) {
        loop {
            // Register for change notifications before reading the queue,
            // so a notify between the read and the await is not lost.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let front = {
                let guarded = self.guarded.lock().unwrap();
                guarded.exchanges.first().cloned()
            };
            let front = match front {
                Some(front) => front,
                None => {
                    tokio::select! {
                        _ = &mut notified => continue,
                        _ = self.shutdown.notified() => return,
                    }
                }
            };

            if front.is_merged() {
                // A merged exchange completes with its target's result.
                match front.merged_with().and_then(|t| t.result()) {
                    Some(result) => {
                        let res_ver = match &result {
                            Ok(ver) => *ver,
                            Err(_) => front.initial_version(),
                        };
                        front.complete_result(res_ver, result);
                        let mut guarded = self.guarded.lock().unwrap();
                        guarded.exchanges.retain(|f| !Arc::ptr_eq(f, &front));
                        push_history(&mut guarded, front.clone());
                    }
                    None => {
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = self.shutdown.notified() => return,
                        }
                    }
                }
                continue;
            }

            if !front.is_done() {
                let _ = front.init(false).await;
            }
            let result = tokio::select! {
                result = front.wait_done() => result,
                _ = self.shutdown.notified() => return,
            };
            self.on_exchange_done(&front, result);
        }
    }

    fn on_exchange_done(self: &Arc<Self>, front: &Arc<ExchangeFuture>, result: ExchangeResult) {
        let res_ver = match &result {
            Ok(ver) => *ver,
            Err(_) => front.initial_version(),
        };

        // Exchanges folded into this one complete with the same result.
        let merged: Vec<Arc<ExchangeFuture>> = {
            let guarded = self.guarded.lock().unwrap();
            guarded
                .exchanges
                .iter()
                .filter(|f| {
                    f.merged_with()
                        .map(|t| Arc::ptr_eq(&t, front))
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        for fut in &merged {
            fut.complete_result(res_ver, result.clone());
        }

        {
            let mut guarded = self.guarded.lock().unwrap();
            guarded
                .exchanges
                .retain(|f| !Arc::ptr_eq(f, front) && !merged.iter().any(|m| Arc::ptr_eq(f, m)));
            for fut in &merged {
                push_history(&mut guarded, fut.clone());
            }
            push_history(&mut guarded, front.clone());
            if let Some(prev) = guarded.last_finished.replace(front.clone()) {
                prev.cleanup();
            }
        }
        self.changed.notify_waiters();
    }

    fn exchange_future(&self, exchange_id: &ExchangeId) -> Option<Arc<ExchangeFuture>> {
        let guarded = self.guarded.lock().unwrap();
        guarded
            .exchanges
            .iter()
            .find(|f| f.exchange_id() == exchange_id)
            .cloned()
            .or_else(|| {
                guarded
                    .history
                    .iter()
                    .rev()
                    .find(|f| f.exchange_id() == exchange_id)
                    .cloned()
            })
    }

    async fn dispatch_single(self: &Arc<Self>, node: NodeDesc, msg: SingleMessage) {
        if let Some(fut) = self.exchange_future(msg.exchange_id()) {
            fut.on_receive_single_message(node, msg).await;
            return;
        }
        let newer = {
            let guarded = self.guarded.lock().unwrap();
            guarded
                .exchanges
                .iter()
                .all(|f| msg.exchange_id() > f.exchange_id())
                && guarded
                    .last_finished
                    .as_ref()
                    .map(|f| msg.exchange_id() > f.exchange_id())
                    .unwrap_or(true)
        };
        if newer {
            // The event has not reached this node yet; park the message.
            debug!(
                exchange = %msg.exchange_id(),
                node = node.id,
                "parking single message for future exchange"
            );
            self.guarded
                .lock()
                .unwrap()
                .pending_singles
                .push((node, msg));
            return;
        }
        // A stale sender: answer from the last finished exchange so the
        // reply is re-stamped with the sender's exchange id.
        let last = {
            let guarded = self.guarded.lock().unwrap();
            guarded.last_finished.clone()
        };
        match last {
            Some(last) => last.on_receive_single_message(node, msg).await,
            None => debug!(
                exchange = %msg.exchange_id(),
                node = node.id,
                "dropping single message for unknown exchange"
            ),
        }
    }

    async fn dispatch_full(self: &Arc<Self>, node: NodeDesc, msg: FullMessage) {
        if let Some(fut) = self.exchange_future(msg.exchange_id()) {
            fut.on_receive_full_message(node, msg).await;
            return;
        }
        debug!(
            exchange = %msg.exchange_id(),
            node = node.id,
            "parking full message for future exchange"
        );
        self.guarded.lock().unwrap().pending_fulls.push((node, msg));
    }

    async fn dispatch_request(self: &Arc<Self>, node: NodeDesc, msg: SingleRequest) {
        let fut = self.exchange_future(msg.exchange_id()).or_else(|| {
            // Restore probes may race the local event; the front exchange
            // is the one being restored.
            let guarded = self.guarded.lock().unwrap();
            guarded.exchanges.first().cloned()
        });
        match fut {
            Some(fut) => fut.on_receive_single_request(node, msg).await,
            None => debug!(
                exchange = %msg.exchange_id(),
                node = node.id,
                "dropping partitions request, no exchange"
            ),
        }
    }

    /// Fold queued server-membership exchanges into `cur` on the
    /// coordinator. Returns false when the decide step must wait for
    /// merged single messages.
    pub(crate) async fn merge_exchanges_on_coordinator(
        self: &Arc<Self>,
        cur: &Arc<ExchangeFuture>,
    ) -> bool {
        let candidates: Vec<Arc<ExchangeFuture>> = {
            let guarded = self.guarded.lock().unwrap();
            guarded
                .exchanges
                .iter()
                .filter(|f| !Arc::ptr_eq(f, cur))
                .cloned()
                .collect()
        };
        let mut wait = false;
        for fut in candidates {
            if fut.exchange_id() <= cur.exchange_id() || fut.is_merged() || fut.is_done() {
                continue;
            }
            let event = fut.event().clone();
            if !event.is_server_membership() {
                // Custom and client events keep their own round.
                break;
            }
            info!(
                cur = %cur.exchange_id(),
                merged = %fut.exchange_id(),
                kind = ?event.kind,
                "merge exchange on coordinator"
            );
            if event.kind == EventKind::Joined {
                if fut.merge_join_exchange(cur) {
                    wait = true;
                }
            } else {
                let _ = fut.merge_exchange_on_done(cur);
            }
            cur.add_merged_event(event);
        }
        !wait
    }

    /// Receiver-side merge: the coordinator decided a higher result
    /// version; fold every queued exchange up to it into `cur`.
    pub(crate) async fn merge_exchanges(
        self: &Arc<Self>,
        cur: &Arc<ExchangeFuture>,
        res_ver: TopologyVersion,
    ) {
        let candidates: Vec<Arc<ExchangeFuture>> = {
            let guarded = self.guarded.lock().unwrap();
            guarded
                .exchanges
                .iter()
                .filter(|f| !Arc::ptr_eq(f, cur))
                .cloned()
                .collect()
        };
        for fut in candidates {
            if fut.exchange_id() <= cur.exchange_id() || fut.is_merged() || fut.is_done() {
                continue;
            }
            if fut.initial_version() > res_ver {
                break;
            }
            info!(
                cur = %cur.exchange_id(),
                merged = %fut.exchange_id(),
                "merge exchange on receiver"
            );
            let _ = fut.merge_exchange_on_done(cur);
            cur.add_merged_event(fut.event().clone());
        }
    }

    /// A lost-partition detection wants partition maps re-broadcast after
    /// the exchange completes. One refresh is in flight at a time.
    pub(crate) fn schedule_resend_partitions(self: &Arc<Self>) {
        if self.resend_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("scheduled partition map resend");
        let shared = self.clone();
        tokio::spawn(async move {
            shared.resend_partitions().await;
        });
    }

    /// Re-broadcast the current partition maps outside any exchange: the
    /// coordinator sends its full map to every live server, everyone else
    /// reports its local map to the coordinator. Refresh messages carry no
    /// exchange id and are applied straight to the topologies.
    async fn resend_partitions(self: &Arc<Self>) {
        let delay = self.ctx.config().exchange.network_timeout();
        loop {
            tokio::time::sleep(delay).await;
            {
                let stopped = self.busy.read().await;
                if *stopped {
                    return;
                }
            }
            let in_flight = {
                let guarded = self.guarded.lock().unwrap();
                guarded
                    .exchanges
                    .iter()
                    .any(|f| !f.is_done() && !f.is_merged())
            };
            if !in_flight {
                break;
            }
            // A running exchange redistributes the maps itself; refresh
            // once it settles.
        }
        self.resend_pending.store(false, Ordering::Release);

        let last = {
            let guarded = self.guarded.lock().unwrap();
            guarded.last_finished.clone()
        };
        let last = match last {
            Some(last) => last,
            None => return,
        };
        let crd = match last.coordinator() {
            Some(crd) => crd,
            None => return,
        };

        if crd.id == self.ctx.local_id() {
            let mut msg = codec::create_full_message(
                &self.ctx,
                last.exchange_id().clone(),
                self.ctx.versions().last(),
                &[],
                &PartsToReload::default(),
                true,
            );
            msg.exchange_id = None;
            let peers: Vec<NodeDesc> = last
                .server_nodes()
                .into_iter()
                .filter(|n| n.id != self.ctx.local_id() && self.ctx.discovery().alive(n.id))
                .collect();
            info!(peers = peers.len(), "resending full partition map");
            for peer in peers {
                let _ = codec::send_envelope(
                    &self.ctx,
                    peer.id,
                    Envelope::full(msg.clone()),
                    last.exchange_id(),
                )
                .await;
            }
        } else {
            let mut msg =
                codec::create_single_message(&self.ctx, last.exchange_id().clone(), None);
            msg.exchange_id = None;
            info!(crd = crd.id, "resending local partition map");
            let _ = codec::send_envelope(
                &self.ctx,
                crd.id,
                Envelope::single(msg),
                last.exchange_id(),
            )
            .await;
        }
    }

    /// Apply a refresh full map received outside any exchange.
    fn apply_partition_update(&self, node: NodeDesc, msg: FullMessage) {
        info!(node = node.id, "applying partition map refresh");
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
            let top = group.topology();
            top.update_full(self.ctx.local_id(), top.ready_version(), full, &counters, &[]);
        }
    }

    /// Apply a refresh single map received outside any exchange.
    fn apply_partition_single_update(&self, node: NodeDesc, msg: SingleMessage) {
        info!(node = node.id, "applying single partition map refresh");
        for (group_id, map) in &msg.partitions {
            let group = match self.ctx.group(*group_id) {
                Some(group) => group,
                None => continue,
            };
            group.topology().update_single(map.clone());
            if let Some(counters) = msg.update_counters.get(group_id) {
                group.topology().apply_update_counters(&counters.counters);
            }
        }
    }
}

fn push_history(guarded: &mut WorkerGuarded, fut: Arc<ExchangeFuture>) {
    if guarded
        .history
        .iter()
        .any(|f| Arc::ptr_eq(f, &fut))
    {
        return;
    }
    guarded.history.push_back(fut);
    while guarded.history.len() > FINISHED_HISTORY {
        guarded.history.pop_front();
    }
}
