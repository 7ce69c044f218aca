// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! 4-ary min-heap of timer nodes keyed by deadline.

use std::sync::Arc;

use super::node::TimerNode;
use crate::error::TimerError;

const FORKS: usize = 4;

pub(crate) struct NodeHeap {
    nodes: Vec<Arc<TimerNode>>,
}

impl NodeHeap {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut nodes = Vec::new();
        if nodes.try_reserve_exact(capacity).is_err() {
            tracing::warn!(capacity, "timer heap pre-allocation failed, growing on demand");
        }
        Self { nodes }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&Arc<TimerNode>> {
        self.nodes.get(idx)
    }

    pub(crate) fn top(&self) -> Option<&Arc<TimerNode>> {
        self.nodes.first()
    }

    /// Deadline of the earliest node, 0 when empty.
    pub(crate) fn top_deadline(&self) -> u64 {
        self.top().map_or(0, |n| n.deadline())
    }

    /// Insert, doubling the backing array when full.
    pub(crate) fn push(&mut self, node: Arc<TimerNode>) -> Result<(), TimerError> {
        if self.nodes.len() == self.nodes.capacity() {
            let extra = self.nodes.len().max(1);
            self.nodes
                .try_reserve_exact(extra)
                .map_err(|_| TimerError::Alloc)?;
        }
        self.reinsert(node);
        Ok(())
    }

    /// Insert into a slot freed by an earlier `remove`.
    pub(crate) fn reinsert(&mut self, node: Arc<TimerNode>) {
        self.nodes.push(node);
        self.sift_up(self.nodes.len() - 1);
    }

    pub(crate) fn remove(&mut self, idx: usize) -> Arc<TimerNode> {
        let node = self.nodes.swap_remove(idx);
        if idx < self.nodes.len() && !self.sift_up(idx) {
            self.sift_down(idx);
        }
        node
    }

    /// Keep only nodes for which `keep` returns true, then restore order.
    pub(crate) fn retain(&mut self, keep: impl FnMut(&Arc<TimerNode>) -> bool) {
        self.nodes.retain(keep);
        if self.nodes.len() > 1 {
            for idx in (0..=(self.nodes.len() - 2) / FORKS).rev() {
                self.sift_down(idx);
            }
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<TimerNode>> {
        std::mem::take(&mut self.nodes)
    }

    /// Returns true if the node moved.
    fn sift_up(&mut self, mut idx: usize) -> bool {
        let start = idx;
        let deadline = self.nodes[idx].deadline();
        while idx > 0 {
            let parent = (idx - 1) / FORKS;
            if self.nodes[parent].deadline() <= deadline {
                break;
            }
            self.nodes.swap(idx, parent);
            idx = parent;
        }
        idx != start
    }

    pub(crate) fn sift_down(&mut self, mut idx: usize) {
        let len = self.nodes.len();
        loop {
            let first = idx * FORKS + 1;
            if first >= len {
                break;
            }
            let last = (first + FORKS).min(len);
            let mut min = first;
            for child in first + 1..last {
                if self.nodes[child].deadline() < self.nodes[min].deadline() {
                    min = child;
                }
            }
            if self.nodes[min].deadline() >= self.nodes[idx].deadline() {
                break;
            }
            self.nodes.swap(idx, min);
            idx = min;
        }
    }
}
