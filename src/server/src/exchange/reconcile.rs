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

//! Counter reconciliation: from the collected single messages plus the
//! local partition store, decide partition owners, pick WAL history
//! suppliers, and mark partitions needing a full reload. The outcome
//! depends only on the set of messages, never on their arrival order.

use std::collections::{HashMap, HashSet};

use tessera_api::v1::{HistorySupplier, PartitionState, SingleMessage};

use crate::{codec::PartsToReload, topology::GroupTopology, Error, Result};

/// A counter value and the nodes that reported it.
#[derive(Debug)]
struct CounterWithNodes {
    cnt: u64,
    nodes: HashSet<u64>,
}

impl CounterWithNodes {
    fn new(cnt: u64, first_node: u64) -> Self {
        CounterWithNodes {
            cnt,
            nodes: [first_node].into_iter().collect(),
        }
    }
}

/// Reconcile one group. `local_reserved` holds the locally reserved
/// history counters; `reserve_local` pins local history for preloading
/// once the local node is chosen as supplier. A refused reservation fails
/// the whole pass: ownership already depends on the reserved history, so
/// the exchange must complete with an error.
#[allow(clippy::too_many_arguments)]
pub(crate) fn assign_partition_states(
    local_id: u64,
    group_id: u64,
    top: &GroupTopology,
    msgs: &HashMap<u64, SingleMessage>,
    local_reserved: Option<&HashMap<u32, u64>>,
    reserve_local: &dyn Fn(u32, u64) -> bool,
    suppliers: &mut Vec<HistorySupplier>,
    parts_to_reload: &mut PartsToReload,
) -> Result<()> {
    let mut max_cntrs: HashMap<u32, CounterWithNodes> = HashMap::new();
    let mut min_cntrs: HashMap<u32, u64> = HashMap::new();

    for (node_id, msg) in msgs {
        let counters = match msg.update_counters.get(&group_id) {
            Some(c) => &c.counters,
            None => continue,
        };
        for (part, pair) in counters {
            let state = top.partition_state(*node_id, *part);
            if state != PartitionState::Owning && state != PartitionState::Moving {
                continue;
            }

            let cntr = if state == PartitionState::Moving {
                pair.init
            } else {
                pair.applied
            };

            let min = min_cntrs.entry(*part).or_insert(cntr);
            if *min > cntr {
                *min = cntr;
            }

            if state != PartitionState::Owning {
                continue;
            }

            match max_cntrs.get_mut(part) {
                None => {
                    max_cntrs.insert(*part, CounterWithNodes::new(cntr, *node_id));
                }
                Some(max) if cntr > max.cnt => {
                    max_cntrs.insert(*part, CounterWithNodes::new(cntr, *node_id));
                }
                Some(max) if cntr == max.cnt => {
                    max.nodes.insert(*node_id);
                }
                Some(_) => {}
            }
        }
    }

    // Counters from the local node join the reconciliation the same way.
    for part in top.current_local_partitions(local_id) {
        let state = part.state;
        if state != PartitionState::Owning && state != PartitionState::Moving {
            continue;
        }

        let cntr = if state == PartitionState::Moving {
            part.init_counter
        } else {
            part.applied_counter
        };

        let min = min_cntrs.entry(part.id).or_insert(cntr);
        if *min > cntr {
            *min = cntr;
        }

        if state != PartitionState::Owning {
            continue;
        }

        match max_cntrs.get_mut(&part.id) {
            None if cntr == 0 => {
                // Fresh cluster: every node reporting the partition as
                // owning ties at zero.
                let mut max = CounterWithNodes::new(0, local_id);
                for node_id in msgs.keys() {
                    if top.partition_state(*node_id, part.id) == PartitionState::Owning {
                        max.nodes.insert(*node_id);
                    }
                }
                max_cntrs.insert(part.id, max);
            }
            None => {
                max_cntrs.insert(part.id, CounterWithNodes::new(cntr, local_id));
            }
            Some(max) if cntr > max.cnt => {
                max_cntrs.insert(part.id, CounterWithNodes::new(cntr, local_id));
            }
            Some(max) if cntr == max.cnt => {
                max.nodes.insert(local_id);
            }
            Some(_) => {}
        }
    }

    // Pick history suppliers: a node qualifies when it ties the maximum
    // counter and reserved history at or below the minimum. The local node
    // is preferred when it qualifies.
    let mut have_history: HashSet<u32> = HashSet::new();
    for (part, min_cntr) in &min_cntrs {
        let max = match max_cntrs.get(part) {
            Some(max) => max,
            None => continue,
        };
        if *min_cntr == 0 || *min_cntr == max.cnt {
            continue;
        }

        let local_qualifies = local_reserved
            .and_then(|r| r.get(part))
            .map(|local_cntr| *local_cntr <= *min_cntr && max.nodes.contains(&local_id))
            .unwrap_or(false);
        if local_qualifies {
            if !reserve_local(*part, *min_cntr) {
                return Err(Error::HistoryReservation(group_id));
            }
            suppliers.push(HistorySupplier {
                node_id: local_id,
                group_id,
                partition: *part,
                counter: *min_cntr,
            });
            have_history.insert(*part);
            continue;
        }

        for (node_id, msg) in msgs {
            let hist_cntr = match msg.history_counter(group_id, *part) {
                Some(c) => c,
                None => continue,
            };
            if hist_cntr <= *min_cntr && max.nodes.contains(node_id) {
                suppliers.push(HistorySupplier {
                    node_id: *node_id,
                    group_id,
                    partition: *part,
                    counter: *min_cntr,
                });
                have_history.insert(*part);
                break;
            }
        }
    }

    let mut entry_left = max_cntrs.len();
    for (part, max) in &max_cntrs {
        entry_left -= 1;

        // Fresh partitions need no ownership change; the final entry still
        // runs so the topology bumps its update sequence once per pass.
        if entry_left != 0 && max.cnt == 0 {
            continue;
        }

        let to_reload = top.set_owners(*part, &max.nodes, have_history.contains(part), entry_left == 0);
        for node_id in to_reload {
            parts_to_reload.put(node_id, group_id, *part);
        }
    }

    Ok(())
}
