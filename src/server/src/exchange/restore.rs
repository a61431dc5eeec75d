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

//! Restore-state subroutine of a newly-elevated coordinator: probe every
//! surviving server, collect their single messages, and adopt a finished
//! full message if any peer already completed with the old coordinator.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    task::{Poll, Waker},
};

use tessera_api::v1::{Envelope, ExchangeId, FullMessage, NodeDesc, SingleMessage, SingleRequest};
use tracing::info;

use crate::{codec, context::SharedContext};

pub(crate) struct InitNewCoordinator {
    exchange_id: ExchangeId,
    guarded: Mutex<Guarded>,
}

#[derive(Default)]
struct Guarded {
    awaited: HashSet<u64>,
    nodes: HashMap<u64, NodeDesc>,
    msgs: HashMap<u64, SingleMessage>,
    full_msg: Option<FullMessage>,
    done: bool,
    wakers: Vec<Waker>,
}

impl InitNewCoordinator {
    pub fn new(exchange_id: ExchangeId, peers: Vec<NodeDesc>) -> Self {
        let mut guarded = Guarded::default();
        for peer in peers {
            guarded.awaited.insert(peer.id);
            guarded.nodes.insert(peer.id, peer);
        }
        InitNewCoordinator {
            exchange_id,
            guarded: Mutex::new(guarded),
        }
    }

    /// Send the restore-state probe to every awaited peer. Peers that are
    /// already gone are dropped from the awaited set; their departure
    /// event reaches the exchange separately.
    pub async fn init(&self, ctx: &SharedContext) {
        let peers: Vec<u64> = {
            let guarded = self.guarded.lock().unwrap();
            guarded.awaited.iter().copied().collect()
        };
        info!(
            exchange = %self.exchange_id,
            peers = peers.len(),
            "new coordinator sends restore state requests"
        );
        let req = SingleRequest::restore(self.exchange_id.clone(), self.exchange_id.clone());
        for peer in peers {
            if !ctx.discovery().alive(peer) {
                self.on_node_left(peer);
                continue;
            }
            let env = Envelope::single_request(req.clone());
            if codec::send_envelope(ctx, peer, env, &self.exchange_id)
                .await
                .is_err()
            {
                self.on_node_left(peer);
            }
        }
        self.maybe_complete();
    }

    /// A restore reply: the peer's single message, plus the full message
    /// it applied if it had already finished with the old coordinator.
    pub fn on_message(&self, node: NodeDesc, msg: SingleMessage) {
        let mut guarded = self.guarded.lock().unwrap();
        if !guarded.awaited.remove(&node.id) {
            return;
        }
        info!(
            exchange = %self.exchange_id,
            node = node.id,
            finished = msg.finish_message.is_some(),
            "new coordinator received restore state reply"
        );
        if guarded.full_msg.is_none() {
            if let Some(full) = &msg.finish_message {
                guarded.full_msg = Some(full.as_ref().clone());
            }
        }
        let mut msg = msg;
        msg.restore_state = false;
        msg.finish_message = None;
        guarded.nodes.insert(node.id, node);
        guarded.msgs.insert(node.id, msg);
        Self::complete_if_drained(&mut guarded);
    }

    pub fn on_node_left(&self, node_id: u64) {
        let mut guarded = self.guarded.lock().unwrap();
        if guarded.awaited.remove(&node_id) {
            Self::complete_if_drained(&mut guarded);
        }
    }

    fn maybe_complete(&self) {
        let mut guarded = self.guarded.lock().unwrap();
        Self::complete_if_drained(&mut guarded);
    }

    fn complete_if_drained(guarded: &mut Guarded) {
        if guarded.awaited.is_empty() && !guarded.done {
            guarded.done = true;
            for waker in std::mem::take(&mut guarded.wakers) {
                waker.wake();
            }
        }
    }

    /// Completes once every awaited peer replied or left.
    pub async fn wait(&self) {
        use futures::future::poll_fn;

        poll_fn(|cx| {
            let mut guarded = self.guarded.lock().unwrap();
            if guarded.done {
                Poll::Ready(())
            } else {
                guarded.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await;
    }

    pub fn full_message(&self) -> Option<FullMessage> {
        self.guarded.lock().unwrap().full_msg.clone()
    }

    pub fn messages(&self) -> HashMap<u64, SingleMessage> {
        self.guarded.lock().unwrap().msgs.clone()
    }

    pub fn reply_nodes(&self) -> Vec<NodeDesc> {
        let guarded = self.guarded.lock().unwrap();
        guarded
            .msgs
            .keys()
            .filter_map(|id| guarded.nodes.get(id).copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use tessera_api::v1::{EventKind, TopologyVersion};

    use super::*;

    fn exch_id() -> ExchangeId {
        ExchangeId::new(TopologyVersion::new(4, 0), 4, EventKind::Joined)
    }

    #[tokio::test]
    async fn completes_when_all_replied() {
        let ncf = InitNewCoordinator::new(
            exch_id(),
            vec![NodeDesc::server(3, 3), NodeDesc::server(4, 4)],
        );

        let mut reply = SingleMessage {
            exchange_id: Some(exch_id()),
            restore_state: true,
            ..Default::default()
        };
        ncf.on_message(NodeDesc::server(3, 3), reply.clone());

        let wait = async {
            ncf.wait().await;
            true
        };
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
            _ = wait => panic!("must not complete before all peers replied"),
        }

        reply.finish_message = Some(Box::new(FullMessage {
            exchange_id: Some(exch_id()),
            ..Default::default()
        }));
        ncf.on_message(NodeDesc::server(4, 4), reply);
        ncf.wait().await;

        assert!(ncf.full_message().is_some());
        assert_eq!(ncf.messages().len(), 2);
        // Replies are stored with the restore wrapping stripped.
        assert!(ncf.messages().values().all(|m| !m.restore_state));
    }

    #[tokio::test]
    async fn departed_peer_is_not_awaited() {
        let ncf = InitNewCoordinator::new(
            exch_id(),
            vec![NodeDesc::server(3, 3), NodeDesc::server(4, 4)],
        );
        ncf.on_node_left(3);
        ncf.on_message(
            NodeDesc::server(4, 4),
            SingleMessage {
                exchange_id: Some(exch_id()),
                ..Default::default()
            },
        );
        ncf.wait().await;
        assert!(ncf.full_message().is_none());
        assert_eq!(ncf.reply_nodes(), vec![NodeDesc::server(4, 4)]);
    }
}
