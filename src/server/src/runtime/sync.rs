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

use std::{
    sync::{Arc, Mutex},
    task::{Poll, Waker},
};

/// Counts in-flight units of work and lets any task wait for the count to
/// drain to zero. Unlike a one-shot barrier, the group can be reused: new
/// work may start after a wait completes.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    count: usize,
    wakers: Vec<Waker>,
}

impl WaitGroup {
    pub fn new() -> Self {
        WaitGroup::default()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    /// Registers one unit of in-flight work, finished when the guard drops.
    pub fn work(&self) -> WorkGuard {
        let mut inner = self.inner.lock().unwrap();
        inner.count += 1;
        WorkGuard {
            inner: self.inner.clone(),
        }
    }

    /// Completes once the in-flight count reaches zero.
    pub async fn wait(&self) {
        use futures::future::poll_fn;

        let inner = self.inner.clone();
        poll_fn(|ctx| {
            let mut inner = inner.lock().unwrap();
            if inner.count == 0 {
                Poll::Ready(())
            } else {
                inner.wakers.push(ctx.waker().clone());
                Poll::Pending
            }
        })
        .await;
    }
}

pub struct WorkGuard {
    inner: Arc<Mutex<Inner>>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.count -= 1;

        if inner.count == 0 {
            for w in std::mem::take(&mut inner.wakers) {
                w.wake();
            }
        }
    }
}
