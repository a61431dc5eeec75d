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

use lazy_static::lazy_static;
use prometheus::*;

lazy_static! {
    pub static ref EXCHANGE_TOTAL: IntCounter = register_int_counter!(
        "exchange_total",
        "The total of started partition exchanges"
    )
    .unwrap();
    pub static ref EXCHANGE_DURATION_SECONDS: Histogram = register_histogram!(
        "exchange_duration_seconds",
        "The intervals of partition exchanges from init to done",
        exponential_buckets(0.005, 1.8, 22).unwrap(),
    )
    .unwrap();
    pub static ref EXCHANGE_MERGE_TOTAL: IntCounter = register_int_counter!(
        "exchange_merge_total",
        "The total of exchanges folded into an earlier one"
    )
    .unwrap();
    pub static ref EXCHANGE_COORDINATOR_FAILOVER_TOTAL: IntCounter = register_int_counter!(
        "exchange_coordinator_failover_total",
        "The total of coordinator failovers during an exchange"
    )
    .unwrap();
    pub static ref EXCHANGE_LOST_PARTITIONS_TOTAL: IntCounter = register_int_counter!(
        "exchange_lost_partitions_total",
        "The total of partitions marked LOST"
    )
    .unwrap();
    pub static ref EXCHANGE_QUIESCE_DUMP_TOTAL: IntCounter = register_int_counter!(
        "exchange_quiesce_dump_total",
        "The total of diagnostic dumps while waiting for partition release"
    )
    .unwrap();
}

pub fn take_exchange_metrics() -> &'static Histogram {
    EXCHANGE_TOTAL.inc();
    &EXCHANGE_DURATION_SECONDS
}
