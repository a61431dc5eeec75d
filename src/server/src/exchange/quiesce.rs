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

//! Quiesce: wait until every transaction, atomic update and explicit lock
//! begun on the previous topology version has drained. The wait is
//! unbounded; timeouts only trigger diagnostic dumps, because giving up
//! risks diverging ownership.

use std::time::{Duration, Instant};

use tessera_api::v1::{ExchangeId, TopologyVersion};
use tracing::{info, warn};

use crate::{context::SharedContext, metrics::EXCHANGE_QUIESCE_DUMP_TOTAL};

/// Interval before the next diagnostic dump: doubles with every step,
/// capped by the configured limit.
pub fn next_dump_timeout(step: u32, timeout: Duration, limit: Duration) -> Duration {
    let limit = if limit.is_zero() {
        Duration::from_secs(30 * 60)
    } else {
        limit
    };
    let next = match 2u32
        .checked_pow(step)
        .and_then(|factor| timeout.checked_mul(factor))
    {
        Some(next) if !next.is_zero() => next,
        _ => return limit,
    };
    next.min(limit)
}

/// Wait for the partition release future, then for lock resolution.
/// `left_node` is the departed node whose explicit locks are force-removed
/// before waiting.
pub(crate) async fn wait_partition_release(
    ctx: &SharedContext,
    exchange_id: &ExchangeId,
    initial_version: TopologyVersion,
    left_node: Option<u64>,
) {
    let cfg = &ctx.config().exchange;
    let poll_timeout = cfg.release_wait_timeout();
    let dump_limit = cfg.long_op_dump_timeout_limit();

    if let Some(node_id) = left_node {
        ctx.tx_tracker()
            .remove_explicit_node_locks(node_id, initial_version);
    }

    let wait_start = Instant::now();
    let mut release_fut = ctx.tx_tracker().partition_release_future(initial_version);
    let mut dump_step = 0u32;
    let mut next_dump = Instant::now();
    loop {
        match tokio::time::timeout(poll_timeout, &mut release_fut).await {
            Ok(()) => break,
            Err(_) => {
                if Instant::now() >= next_dump {
                    dump_pending_objects(ctx, exchange_id);
                    next_dump =
                        Instant::now() + next_dump_timeout(dump_step, poll_timeout, dump_limit);
                    dump_step += 1;
                }
            }
        }
    }

    let wait_time = wait_start.elapsed();
    let dump_contents = cfg
        .release_future_dump_threshold()
        .map(|threshold| wait_time > threshold)
        .unwrap_or(false);
    info!(
        exchange = %exchange_id,
        wait_ms = wait_time.as_millis() as u64,
        "finished waiting for partition release future"
    );
    if dump_contents {
        for line in ctx.tx_tracker().dump_pending_objects() {
            warn!(exchange = %exchange_id, "release future waited on: {}", line);
        }
    }

    let mut locks_fut = ctx.tx_tracker().finish_locks(initial_version);
    dump_step = 0;
    next_dump = Instant::now();
    loop {
        match tokio::time::timeout(poll_timeout, &mut locks_fut).await {
            Ok(()) => break,
            Err(_) => {
                if Instant::now() >= next_dump {
                    dump_locked_keys(ctx, exchange_id);
                    next_dump =
                        Instant::now() + next_dump_timeout(dump_step, poll_timeout, dump_limit);
                    dump_step += 1;
                }
            }
        }
    }
}

fn dump_pending_objects(ctx: &SharedContext, exchange_id: &ExchangeId) {
    EXCHANGE_QUIESCE_DUMP_TOTAL.inc();
    let pending = ctx.tx_tracker().dump_pending_objects();
    warn!(
        exchange = %exchange_id,
        pending = pending.len(),
        "failed to wait for partition release future, dumping pending objects"
    );
    if ctx.config().exchange.thread_dump_on_exchange_timeout {
        for line in pending {
            warn!(exchange = %exchange_id, "pending: {}", line);
        }
    }
}

fn dump_locked_keys(ctx: &SharedContext, exchange_id: &ExchangeId) {
    EXCHANGE_QUIESCE_DUMP_TOTAL.inc();
    warn!(
        exchange = %exchange_id,
        "failed to wait for locks release future, dumping locked keys"
    );
    for key in ctx.tx_tracker().locked_keys() {
        warn!(exchange = %exchange_id, "locked key: {}", key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_timeout_doubles_up_to_limit() {
        let base = Duration::from_secs(10);
        let limit = Duration::from_secs(60);
        assert_eq!(next_dump_timeout(0, base, limit), Duration::from_secs(10));
        assert_eq!(next_dump_timeout(1, base, limit), Duration::from_secs(20));
        assert_eq!(next_dump_timeout(2, base, limit), Duration::from_secs(40));
        assert_eq!(next_dump_timeout(3, base, limit), Duration::from_secs(60));
        assert_eq!(next_dump_timeout(30, base, limit), Duration::from_secs(60));
    }

    #[test]
    fn zero_limit_falls_back_to_default() {
        let base = Duration::from_secs(10);
        assert_eq!(
            next_dump_timeout(0, base, Duration::ZERO),
            Duration::from_secs(10)
        );
        assert_eq!(
            next_dump_timeout(63, base, Duration::ZERO),
            Duration::from_secs(30 * 60)
        );
    }
}
