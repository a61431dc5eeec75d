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

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Default, Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Base network timeout. The quiesce waiter polls release futures with
    /// a timeout of twice this value.
    pub network_timeout_ms: u64,

    /// Cap on the exponentially growing interval between diagnostic dumps
    /// while waiting for a long-running operation.
    pub long_op_dump_timeout_limit_ms: u64,

    /// Release-future wait time above which the pending objects are dumped
    /// after the wait finishes. Zero disables the dump.
    pub release_future_dump_threshold_ms: u64,

    /// Dump the full pending-objects list (not just counts) on every
    /// quiesce timeout.
    pub thread_dump_on_exchange_timeout: bool,

    /// Allow folding concurrent server-membership exchanges into one round.
    pub merge_exchanges: bool,
}

impl ExchangeConfig {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Poll timeout for quiesce futures.
    pub fn release_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms * 2)
    }

    pub fn long_op_dump_timeout_limit(&self) -> Duration {
        Duration::from_millis(self.long_op_dump_timeout_limit_ms)
    }

    pub fn release_future_dump_threshold(&self) -> Option<Duration> {
        if self.release_future_dump_threshold_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.release_future_dump_threshold_ms))
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            network_timeout_ms: 5_000,
            long_op_dump_timeout_limit_ms: 30 * 60_000,
            release_future_dump_threshold_ms: 0,
            thread_dump_on_exchange_timeout: false,
            merge_exchanges: true,
        }
    }
}
