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

//! Building and shipping exchange messages: single/full message assembly
//! from the group topologies, the transport envelope, and the peer-gone
//! tolerant send path.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use prost::Message;
use tessera_api::v1::{
    Envelope, ExchangeId, FullMessage, GroupAffinity, GroupPartitions, HistoryCounters,
    HistorySupplier, PartitionAssignment, PartitionCounters, PartitionSet, PartitionState,
    SingleMessage,
};
use tracing::{debug, warn};

use crate::{context::SharedContext, Error, Result};

/// Accumulator for partitions needing a full reload, keyed by node and
/// group.
#[derive(Clone, Debug, Default)]
pub struct PartsToReload {
    map: HashMap<u64, HashMap<u64, BTreeSet<u32>>>,
}

impl PartsToReload {
    pub fn put(&mut self, node_id: u64, group_id: u64, part: u32) {
        self.map
            .entry(node_id)
            .or_default()
            .entry(group_id)
            .or_default()
            .insert(part);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn parts(&self, node_id: u64, group_id: u64) -> Vec<u32> {
        self.map
            .get(&node_id)
            .and_then(|g| g.get(&group_id))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn to_message(&self) -> HashMap<u64, GroupPartitions> {
        self.map
            .iter()
            .map(|(node_id, groups)| {
                let groups = groups
                    .iter()
                    .map(|(group_id, parts)| {
                        (
                            *group_id,
                            PartitionSet {
                                parts: parts.iter().copied().collect(),
                            },
                        )
                    })
                    .collect();
                (*node_id, GroupPartitions { groups })
            })
            .collect()
    }
}

/// Build the local single message: every exchange group's partition map and
/// counters, plus reserved history counters when available.
pub fn create_single_message(
    ctx: &SharedContext,
    exchange_id: ExchangeId,
    history_reserved: Option<&HashMap<u64, HashMap<u32, u64>>>,
) -> SingleMessage {
    let mut msg = SingleMessage {
        exchange_id: Some(exchange_id),
        client: ctx.is_client(),
        last_version: ctx.versions().last(),
        ..Default::default()
    };
    if msg.client {
        return msg;
    }
    for group in ctx.exchange_groups() {
        let group_id = group.group_id();
        let top = group.topology();
        msg.partitions
            .insert(group_id, top.local_partition_map(ctx.local_id()));
        msg.update_counters.insert(
            group_id,
            PartitionCounters {
                counters: top.local_update_counters(),
            },
        );
        if let Some(reserved) = history_reserved.and_then(|r| r.get(&group_id)) {
            msg.history_counters.insert(
                group_id,
                HistoryCounters {
                    counters: reserved.clone(),
                },
            );
        }
    }
    msg
}

/// Build a full message from the decided group topologies. `compress`
/// prunes evicted entries, which dominate the map after long uptimes.
pub fn create_full_message(
    ctx: &SharedContext,
    exchange_id: ExchangeId,
    last_version: u64,
    suppliers: &[HistorySupplier],
    parts_to_reload: &PartsToReload,
    compress: bool,
) -> FullMessage {
    let mut msg = FullMessage {
        exchange_id: Some(exchange_id),
        last_version,
        history_suppliers: suppliers.to_vec(),
        parts_to_reload: parts_to_reload.to_message(),
        ..Default::default()
    };
    for group in ctx.exchange_groups() {
        let group_id = group.group_id();
        let top = group.topology();
        let mut full = top.full_partition_map();
        if compress {
            for map in full.maps.values_mut() {
                map.parts
                    .retain(|_, state| *state != PartitionState::Evicted as i32);
            }
        }
        msg.partitions.insert(group_id, full);
        msg.update_counters.insert(
            group_id,
            PartitionCounters {
                counters: top.update_counters(),
            },
        );
    }
    msg
}

/// Convert an affinity assignment (partition index to ordered owner list)
/// into its wire form.
pub fn group_affinity(assignment: &[Vec<u64>]) -> GroupAffinity {
    GroupAffinity {
        assignments: assignment
            .iter()
            .enumerate()
            .map(|(part, nodes)| PartitionAssignment {
                partition: part as u32,
                nodes: nodes.clone(),
            })
            .collect(),
    }
}

pub fn encode(envelope: &Envelope) -> Bytes {
    Bytes::from(envelope.encode_to_vec())
}

pub fn decode(payload: &[u8]) -> Result<Envelope> {
    Envelope::decode(payload).map_err(Error::from)
}

/// Send an envelope, treating a gone peer as benign: the coordinator will
/// observe the node-leave event independently.
pub async fn send_envelope(
    ctx: &SharedContext,
    to: u64,
    envelope: Envelope,
    exchange_id: &ExchangeId,
) -> Result<()> {
    match ctx.transport().send(to, encode(&envelope)).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_peer_gone() => {
            debug!(
                exchange = %exchange_id,
                node = to,
                "node left during partition exchange"
            );
            Ok(())
        }
        Err(err) => {
            warn!(
                exchange = %exchange_id,
                node = to,
                "failed to send exchange message: {}", err
            );
            Err(err)
        }
    }
}
