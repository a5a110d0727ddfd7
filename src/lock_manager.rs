//! Record lock table and wait-for graph.
//!
//! This is a passive structure: the transaction manager owns it behind its
//! single mutex and handles all blocking. Lock nodes live in a generational
//! slot arena and are addressed by [`LockId`]; each `(table, page)` pair has
//! a doubly-linked queue of nodes in acquisition order, threaded through the
//! arena by index. A request conflicts with every node queued ahead of it on
//! the same key by a different transaction unless both are shared.

use std::collections::{HashMap, HashSet};

use crate::file_manager::TableId;
use crate::page::PageNum;
use crate::transaction::TrxId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Stable handle to a lock node. The generation guards against a slot being
/// recycled under a stale id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct LockNode {
    table_id: TableId,
    pagenum: PageNum,
    key: i64,
    trx_id: TrxId,
    mode: LockMode,
    prev: Option<u32>,
    next: Option<u32>,
}

struct LockSlot {
    generation: u32,
    node: Option<LockNode>,
}

#[derive(Default)]
struct QueueHead {
    head: Option<u32>,
    tail: Option<u32>,
}

pub struct LockTable {
    slots: Vec<LockSlot>,
    free: Vec<u32>,
    queues: HashMap<(TableId, PageNum), QueueHead>,
    waits_for: HashMap<TrxId, HashSet<TrxId>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            queues: HashMap::new(),
            waits_for: HashMap::new(),
        }
    }

    fn node(&self, id: LockId) -> Option<&LockNode> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    /// Append a lock request at the tail of its page queue.
    pub fn insert(
        &mut self,
        table_id: TableId,
        pagenum: PageNum,
        key: i64,
        trx_id: TrxId,
        mode: LockMode,
    ) -> LockId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(LockSlot {
                    generation: 0,
                    node: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let queue = self.queues.entry((table_id, pagenum)).or_default();
        let node = LockNode {
            table_id,
            pagenum,
            key,
            trx_id,
            mode,
            prev: queue.tail,
            next: None,
        };
        if let Some(tail) = queue.tail {
            self.slots[tail as usize].node.as_mut().unwrap().next = Some(index);
        } else {
            queue.head = Some(index);
        }
        queue.tail = Some(index);
        self.slots[index as usize].node = Some(node);
        LockId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Unlink and recycle a lock node. A stale or double release is a no-op.
    pub fn remove(&mut self, id: LockId) {
        if self.node(id).is_none() {
            return;
        }
        let node = self.slots[id.index as usize].node.take().unwrap();
        self.slots[id.index as usize].generation += 1;
        self.free.push(id.index);

        let queue_key = (node.table_id, node.pagenum);
        match node.prev {
            Some(prev) => self.slots[prev as usize].node.as_mut().unwrap().next = node.next,
            None => self.queues.get_mut(&queue_key).unwrap().head = node.next,
        }
        match node.next {
            Some(next) => self.slots[next as usize].node.as_mut().unwrap().prev = node.prev,
            None => self.queues.get_mut(&queue_key).unwrap().tail = node.prev,
        }
        if self.queues[&queue_key].head.is_none() {
            self.queues.remove(&queue_key);
        }
    }

    /// Transactions queued ahead of `id` on the same key that block it.
    pub fn conflicts(&self, id: LockId) -> Vec<TrxId> {
        let Some(node) = self.node(id) else {
            return Vec::new();
        };
        let mut holders = Vec::new();
        let mut cursor = node.prev;
        while let Some(index) = cursor {
            let earlier = self.slots[index as usize].node.as_ref().unwrap();
            if earlier.key == node.key
                && earlier.trx_id != node.trx_id
                && !(earlier.mode == LockMode::Shared && node.mode == LockMode::Shared)
                && !holders.contains(&earlier.trx_id)
            {
                holders.push(earlier.trx_id);
            }
            cursor = earlier.prev;
        }
        holders
    }

    /// Does `trx_id` already hold a lock on this record that satisfies a
    /// `mode` request? An exclusive hold satisfies either mode.
    pub fn covered(
        &self,
        table_id: TableId,
        pagenum: PageNum,
        key: i64,
        trx_id: TrxId,
        mode: LockMode,
    ) -> bool {
        self.scan_record(table_id, pagenum, key, |node| {
            node.trx_id == trx_id && (node.mode == LockMode::Exclusive || mode == LockMode::Shared)
        })
    }

    /// Is there any explicit lock on this record, from anyone?
    pub fn any_lock_on_record(&self, table_id: TableId, pagenum: PageNum, key: i64) -> bool {
        self.scan_record(table_id, pagenum, key, |_| true)
    }

    fn scan_record(
        &self,
        table_id: TableId,
        pagenum: PageNum,
        key: i64,
        pred: impl Fn(&LockNode) -> bool,
    ) -> bool {
        let Some(queue) = self.queues.get(&(table_id, pagenum)) else {
            return false;
        };
        let mut cursor = queue.head;
        while let Some(index) = cursor {
            let node = self.slots[index as usize].node.as_ref().unwrap();
            if node.key == key && pred(node) {
                return true;
            }
            cursor = node.next;
        }
        false
    }

    /// Replace the waiter's outgoing wait-for edges.
    pub fn set_edges(&mut self, waiter: TrxId, holders: &[TrxId]) {
        self.waits_for
            .insert(waiter, holders.iter().copied().collect());
    }

    pub fn clear_edges(&mut self, waiter: TrxId) {
        self.waits_for.remove(&waiter);
    }

    /// Depth-first reachability: is `start` on a wait cycle through its own
    /// outgoing edges?
    pub fn wait_cycle(&self, start: TrxId) -> bool {
        let Some(first) = self.waits_for.get(&start) else {
            return false;
        };
        let mut stack: Vec<TrxId> = first.iter().copied().collect();
        let mut visited = HashSet::new();
        while let Some(trx) = stack.pop() {
            if trx == start {
                return true;
            }
            if visited.insert(trx) {
                if let Some(next) = self.waits_for.get(&trx) {
                    stack.extend(next.iter().copied());
                }
            }
        }
        false
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod lock_table_tests {
    use super::*;

    #[test]
    fn test_shared_locks_do_not_conflict() {
        let mut table = LockTable::new();
        let a = table.insert(1, 2, 10, 1, LockMode::Shared);
        let b = table.insert(1, 2, 10, 2, LockMode::Shared);
        assert!(table.conflicts(a).is_empty());
        assert!(table.conflicts(b).is_empty());
    }

    #[test]
    fn test_exclusive_conflicts_with_earlier_holders() {
        let mut table = LockTable::new();
        table.insert(1, 2, 10, 1, LockMode::Shared);
        table.insert(1, 2, 10, 2, LockMode::Shared);
        let x = table.insert(1, 2, 10, 3, LockMode::Exclusive);
        let mut holders = table.conflicts(x);
        holders.sort_unstable();
        assert_eq!(holders, vec![1, 2]);
    }

    #[test]
    fn test_different_keys_independent() {
        let mut table = LockTable::new();
        table.insert(1, 2, 10, 1, LockMode::Exclusive);
        let b = table.insert(1, 2, 11, 2, LockMode::Exclusive);
        assert!(table.conflicts(b).is_empty());
        // Same key on another page is a different record entirely.
        let c = table.insert(1, 3, 10, 2, LockMode::Exclusive);
        assert!(table.conflicts(c).is_empty());
    }

    #[test]
    fn test_same_trx_never_conflicts_with_itself() {
        let mut table = LockTable::new();
        table.insert(1, 2, 10, 1, LockMode::Shared);
        let again = table.insert(1, 2, 10, 1, LockMode::Exclusive);
        assert!(table.conflicts(again).is_empty());
    }

    #[test]
    fn test_release_unblocks_fifo() {
        let mut table = LockTable::new();
        let a = table.insert(1, 2, 10, 1, LockMode::Exclusive);
        let b = table.insert(1, 2, 10, 2, LockMode::Exclusive);
        let c = table.insert(1, 2, 10, 3, LockMode::Exclusive);
        assert_eq!(table.conflicts(b), vec![1]);
        table.remove(a);
        assert!(table.conflicts(b).is_empty());
        // The third waiter still queues behind the second.
        assert_eq!(table.conflicts(c), vec![2]);
    }

    #[test]
    fn test_stale_id_ignored_after_recycle() {
        let mut table = LockTable::new();
        let a = table.insert(1, 2, 10, 1, LockMode::Shared);
        table.remove(a);
        // The slot gets recycled with a bumped generation.
        let b = table.insert(1, 2, 11, 2, LockMode::Shared);
        assert_ne!(a, b);
        table.remove(a); // stale, must not touch the new node
        assert!(table.any_lock_on_record(1, 2, 11));
    }

    #[test]
    fn test_covered_modes() {
        let mut table = LockTable::new();
        table.insert(1, 2, 10, 1, LockMode::Shared);
        assert!(table.covered(1, 2, 10, 1, LockMode::Shared));
        assert!(!table.covered(1, 2, 10, 1, LockMode::Exclusive));
        table.insert(1, 2, 10, 1, LockMode::Exclusive);
        assert!(table.covered(1, 2, 10, 1, LockMode::Exclusive));
        assert!(!table.covered(1, 2, 10, 2, LockMode::Shared));
    }

    #[test]
    fn test_wait_cycle_detection() {
        let mut table = LockTable::new();
        table.set_edges(1, &[2]);
        table.set_edges(2, &[3]);
        assert!(!table.wait_cycle(1));
        table.set_edges(3, &[1]);
        assert!(table.wait_cycle(1));
        table.clear_edges(2);
        assert!(!table.wait_cycle(1));
    }

    #[test]
    fn test_empty_queue_dropped() {
        let mut table = LockTable::new();
        let a = table.insert(1, 2, 10, 1, LockMode::Shared);
        let b = table.insert(1, 2, 10, 2, LockMode::Shared);
        table.remove(b);
        table.remove(a);
        assert!(table.queues.is_empty());
        assert!(!table.any_lock_on_record(1, 2, 10));
    }
}
