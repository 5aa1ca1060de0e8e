// Copyright 2022 Singularity Data
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

//! Backpressure for bulk writes.
//!
//! [`FlowController`] bounds in-flight mutation work by outstanding entry
//! count and outstanding serialized bytes. `admit` carves an input batch
//! into sub-batches, suspending between them while capacity is exhausted;
//! `release` returns capacity and wakes waiters. At any point in time
//! outstanding capacity equals admitted minus released.

use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::mutation::MutationEntry;

#[derive(Default)]
struct FlowState {
    entries: usize,
    bytes: usize,
}

pub struct FlowController {
    max_entries: usize,
    max_bytes: usize,
    state: Mutex<FlowState>,
    released: Notify,
}

impl FlowController {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            max_bytes: max_bytes.max(1),
            state: Mutex::new(FlowState::default()),
            released: Notify::new(),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Outstanding (entries, bytes).
    pub fn in_flight(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.entries, state.bytes)
    }

    /// Reserves capacity for one entry of `size` bytes if it fits. An entry
    /// larger than the byte cap is admitted when nothing else is in flight;
    /// the cap is a soft ceiling in that degenerate case.
    fn try_reserve(&self, size: usize) -> bool {
        let mut state = self.state.lock();
        let fits_entries = state.entries < self.max_entries;
        let fits_bytes = state.bytes + size <= self.max_bytes
            || (state.entries == 0 && size > self.max_bytes);
        if fits_entries && fits_bytes {
            state.entries += 1;
            state.bytes += size;
            true
        } else {
            false
        }
    }

    /// Returns the capacity held by `entries` and wakes admission waiters.
    pub fn release(&self, entries: &[MutationEntry]) {
        let bytes: usize = entries.iter().map(MutationEntry::byte_size).sum();
        {
            let mut state = self.state.lock();
            state.entries = state.entries.saturating_sub(entries.len());
            state.bytes = state.bytes.saturating_sub(bytes);
        }
        self.released.notify_waiters();
    }

    /// Lazily partitions `entries` into sub-batches that together cover the
    /// input. Capacity is reserved entry by entry; when the next entry does
    /// not fit, the batch built so far is yielded and admission suspends
    /// until a `release` frees room.
    pub fn admit(
        self: &Arc<Self>,
        entries: Vec<MutationEntry>,
    ) -> impl Stream<Item = Vec<MutationEntry>> {
        let controller = self.clone();
        async_stream::stream! {
            let mut batch = Vec::new();
            for entry in entries {
                let size = entry.byte_size();
                loop {
                    if controller.try_reserve(size) {
                        break;
                    }
                    if !batch.is_empty() {
                        yield std::mem::take(&mut batch);
                    }
                    // Register as a waiter before re-checking, so a release
                    // between the check and the await cannot be missed.
                    let released = controller.released.notified();
                    tokio::pin!(released);
                    released.as_mut().enable();
                    if controller.try_reserve(size) {
                        break;
                    }
                    released.await;
                }
                batch.push(entry);
            }
            if !batch.is_empty() {
                yield batch;
            }
        }
    }
}
