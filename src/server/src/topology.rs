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

//! Per-group partition topology: which node holds which partition in which
//! state, and the update counters behind them. One instance per cache
//! group; the exchange mutates it during collect/decide and replaces it
//! wholesale when applying a full message.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::RwLock,
};

use tessera_api::v1::{
    CounterPair, FullPartitionMap, PartitionMap, PartitionState, TopologyVersion,
};

/// A partition hosted by the local node, with its update counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalPartition {
    pub id: u32,
    pub state: PartitionState,
    pub init_counter: u64,
    pub applied_counter: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct LocalCounters {
    init: u64,
    applied: u64,
}

pub struct GroupTopology {
    group_id: u64,
    partitions: u32,
    core: RwLock<Core>,
}

#[derive(Default)]
struct Core {
    ready_ver: TopologyVersion,
    update_seq: u64,
    /// Every node's reported partition map, local node included.
    node_maps: HashMap<u64, PartitionMap>,
    /// Authoritative per-partition counters, merged from single messages.
    counters: HashMap<u32, CounterPair>,
    /// Counters of locally hosted partitions; state lives in `node_maps`.
    locals: BTreeMap<u32, LocalCounters>,
    /// Partitions ever reported with data-bearing state; survivors of a
    /// node removal, so lost detection remembers what existed.
    seen: BTreeSet<u32>,
    lost: BTreeSet<u32>,
    /// Client-side view stashed while no server-side topology existed yet.
    pending_client_view: Option<FullPartitionMap>,
}

impl GroupTopology {
    pub fn new(group_id: u64, partitions: u32) -> Self {
        GroupTopology {
            group_id,
            partitions,
            core: RwLock::new(Core::default()),
        }
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn ready_version(&self) -> TopologyVersion {
        self.core.read().unwrap().ready_ver
    }

    pub fn update_seq(&self) -> u64 {
        self.core.read().unwrap().update_seq
    }

    /// Pre-exchange hook: adopt a stashed client view if asked, then bump
    /// the group onto the exchange's version.
    pub fn before_exchange(&self, ver: TopologyVersion, adopt_client_view: bool) {
        let mut core = self.core.write().unwrap();
        if adopt_client_view {
            if let Some(view) = core.pending_client_view.take() {
                for (node_id, map) in view.maps {
                    core.node_maps.insert(node_id, map);
                }
            }
        }
        core.ready_ver = ver;
        core.update_seq += 1;
    }

    pub fn stash_client_view(&self, view: FullPartitionMap) {
        self.core.write().unwrap().pending_client_view = Some(view);
    }

    /// Create or overwrite a locally hosted partition. Keeps the local
    /// node's entry in the reported maps in sync.
    pub fn set_local_partition(
        &self,
        local_id: u64,
        part: u32,
        state: PartitionState,
        init_counter: u64,
        applied_counter: u64,
    ) {
        let mut core = self.core.write().unwrap();
        core.locals.insert(
            part,
            LocalCounters {
                init: init_counter,
                applied: applied_counter,
            },
        );
        core.seen.insert(part);
        let seq = core.update_seq;
        let ver = core.ready_ver;
        let map = core.node_maps.entry(local_id).or_insert_with(|| PartitionMap {
            node_id: local_id,
            update_seq: seq,
            top_ver: Some(ver),
            parts: HashMap::new(),
        });
        map.set(part, state);
    }

    pub fn current_local_partitions(&self, local_id: u64) -> Vec<LocalPartition> {
        let core = self.core.read().unwrap();
        core.locals
            .iter()
            .map(|(part, cnt)| LocalPartition {
                id: *part,
                state: core
                    .node_maps
                    .get(&local_id)
                    .map(|m| m.state(*part))
                    .unwrap_or(PartitionState::Unknown),
                init_counter: cnt.init,
                applied_counter: cnt.applied,
            })
            .collect()
    }

    pub fn partition_state(&self, node_id: u64, part: u32) -> PartitionState {
        let core = self.core.read().unwrap();
        core.node_maps
            .get(&node_id)
            .map(|m| m.state(part))
            .unwrap_or(PartitionState::Unknown)
    }

    /// The local node's partition map as reported in a single message.
    pub fn local_partition_map(&self, local_id: u64) -> PartitionMap {
        let core = self.core.read().unwrap();
        core.node_maps
            .get(&local_id)
            .cloned()
            .unwrap_or_else(|| PartitionMap {
                node_id: local_id,
                update_seq: core.update_seq,
                top_ver: Some(core.ready_ver),
                parts: HashMap::new(),
            })
    }

    /// Local update counters as reported in a single message.
    pub fn local_update_counters(&self) -> HashMap<u32, CounterPair> {
        let core = self.core.read().unwrap();
        core.locals
            .iter()
            .map(|(part, cnt)| (*part, CounterPair::new(cnt.init, cnt.applied)))
            .collect()
    }

    /// Merge one node's reported map, ignoring stale updates.
    pub fn update_single(&self, map: PartitionMap) {
        let mut core = self.core.write().unwrap();
        let stale = core
            .node_maps
            .get(&map.node_id)
            .map(|cur| cur.update_seq > map.update_seq)
            .unwrap_or(false);
        if !stale {
            for (part, state) in &map.parts {
                if *state != PartitionState::Evicted as i32 {
                    core.seen.insert(*part);
                }
            }
            core.node_maps.insert(map.node_id, map);
            core.update_seq += 1;
        }
    }

    /// Drop a departed node's reported map; its partitions stay known to
    /// lost detection.
    pub fn remove_node(&self, node_id: u64) {
        let mut core = self.core.write().unwrap();
        if core.node_maps.remove(&node_id).is_some() {
            core.update_seq += 1;
        }
    }

    /// Merge counters reported by peers; the highest applied counter wins.
    pub fn apply_update_counters(&self, counters: &HashMap<u32, CounterPair>) {
        let mut core = self.core.write().unwrap();
        for (part, pair) in counters {
            let cur = core.counters.entry(*part).or_default();
            if pair.applied > cur.applied {
                *cur = *pair;
            }
        }
    }

    /// Replace the whole topology with the coordinator's decided view.
    /// `reload` lists local partitions demoted to a full reload.
    pub fn update_full(
        &self,
        local_id: u64,
        res_ver: TopologyVersion,
        full: &FullPartitionMap,
        counters: &HashMap<u32, CounterPair>,
        reload: &[u32],
    ) {
        let mut core = self.core.write().unwrap();
        core.node_maps = full.maps.clone();
        let mut reported: Vec<u32> = Vec::new();
        for map in core.node_maps.values() {
            for (part, state) in &map.parts {
                if *state != PartitionState::Evicted as i32 {
                    reported.push(*part);
                }
            }
        }
        core.seen.extend(reported);
        core.update_seq = core.update_seq.max(full.update_seq) + 1;
        core.ready_ver = res_ver;
        for (part, pair) in counters {
            let cur = core.counters.entry(*part).or_default();
            if pair.applied > cur.applied {
                *cur = *pair;
            }
        }
        for part in reload {
            if let Some(cnt) = core.locals.get_mut(part) {
                *cnt = LocalCounters::default();
            }
            if let Some(map) = core.node_maps.get_mut(&local_id) {
                if map.state(*part) != PartitionState::Unknown {
                    map.set(*part, PartitionState::Moving);
                }
            }
        }
    }

    /// The cluster-wide map for a full message.
    pub fn full_partition_map(&self) -> FullPartitionMap {
        let core = self.core.read().unwrap();
        FullPartitionMap {
            maps: core.node_maps.clone(),
            update_seq: core.update_seq,
        }
    }

    /// Counters for a full message: merged peer counters plus local ones.
    pub fn update_counters(&self) -> HashMap<u32, CounterPair> {
        let core = self.core.read().unwrap();
        let mut out = core.counters.clone();
        for (part, cnt) in &core.locals {
            let cur = out.entry(*part).or_default();
            if cnt.applied > cur.applied {
                *cur = CounterPair::new(cnt.init, cnt.applied);
            }
        }
        out
    }

    /// Declare the owners of one partition. Every node still reporting
    /// OWNING but not among the owners is demoted to MOVING; without a
    /// history supplier every non-owner holding the partition needs a full
    /// reload and is returned. `last_entry` marks the final call of a
    /// decide pass.
    pub fn set_owners(
        &self,
        part: u32,
        owners: &HashSet<u64>,
        have_history: bool,
        last_entry: bool,
    ) -> HashSet<u64> {
        let mut core = self.core.write().unwrap();
        let mut to_reload = HashSet::new();
        for (node_id, map) in core.node_maps.iter_mut() {
            match map.state(part) {
                PartitionState::Owning if !owners.contains(node_id) => {
                    map.set(part, PartitionState::Moving);
                    if !have_history {
                        to_reload.insert(*node_id);
                    }
                }
                PartitionState::Moving if !owners.contains(node_id) && !have_history => {
                    to_reload.insert(*node_id);
                }
                _ => {}
            }
        }
        if last_entry {
            core.update_seq += 1;
        }
        to_reload
    }

    /// Mark partitions with no surviving owner as LOST. Returns true when
    /// at least one partition newly became lost.
    pub fn detect_lost_partitions(&self, _res_ver: TopologyVersion) -> bool {
        let mut core = self.core.write().unwrap();
        let mut detected = false;
        for part in 0..self.partitions {
            if !core.seen.contains(&part) {
                continue;
            }
            let owned = core
                .node_maps
                .values()
                .any(|m| m.state(part) == PartitionState::Owning);
            if owned {
                continue;
            }
            if core.lost.insert(part) {
                detected = true;
            }
            for map in core.node_maps.values_mut() {
                if !matches!(map.state(part), PartitionState::Unknown | PartitionState::Evicted) {
                    map.set(part, PartitionState::Lost);
                }
            }
        }
        if detected {
            core.update_seq += 1;
        }
        detected
    }

    /// Clear LOST state: every node holding a lost partition owns it again.
    pub fn reset_lost_partitions(&self, _ver: TopologyVersion) {
        let mut core = self.core.write().unwrap();
        let lost = std::mem::take(&mut core.lost);
        for part in lost {
            for map in core.node_maps.values_mut() {
                if map.state(part) == PartitionState::Lost {
                    map.set(part, PartitionState::Owning);
                }
            }
        }
        core.update_seq += 1;
    }

    pub fn lost_partitions(&self) -> Vec<u32> {
        self.core.read().unwrap().lost.iter().copied().collect()
    }
}
