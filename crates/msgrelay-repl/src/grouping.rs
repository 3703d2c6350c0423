//! Assembly of source windows into ordered processing units.
//!
//! Ordering rules:
//!
//! 1. items sharing a group key always end up in the same album unit;
//! 2. a reply follows the unit holding its parent, and sibling replies are
//!    ordered by timestamp (ties broken by id);
//! 3. otherwise units keep source id order.
//!
//! The units of the newest window are held back until the next window has
//! been seen, which gives replies one window of lookahead to meet their
//! parent. An album touching the last item of a window is held as well, in
//! case it continues. Held items plus replies waiting for a not-yet-seen
//! parent are capped by `max_pending_carryover`; past the cap the oldest
//! complete units are flushed early. A reply whose parent is outside the
//! processed range is emitted as a standalone unit in id order.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use crate::item::{Item, ItemId, ProcessingUnit};

/// Merger configuration.
#[derive(Debug, Clone)]
pub struct GroupingConfig {
    /// Maximum items kept between windows (held units + pending replies).
    pub max_pending_carryover: usize,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            max_pending_carryover: 100,
        }
    }
}

/// Merger statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupingStats {
    /// Units handed out.
    pub units_emitted: u64,
    /// Album units handed out.
    pub albums_emitted: u64,
    /// Reply units placed under their parent.
    pub replies_spliced: u64,
    /// Reply units emitted without their parent.
    pub orphan_replies: u64,
    /// Units emitted early because the carry-over cap was reached.
    pub forced_flushes: u64,
    /// Largest number of items resident at once.
    pub peak_resident: usize,
}

#[derive(Debug, Clone)]
struct HeldItem {
    item: Item,
    window: u64,
}

struct Node {
    unit: Option<ProcessingUnit>,
    window: u64,
    open: bool,
    len: usize,
    children: Vec<usize>,
}

/// Turns collector windows into dispatch-ordered processing units.
#[derive(Debug)]
pub struct GroupingMerger {
    max_carryover: usize,
    held: Vec<HeldItem>,
    /// Replies whose parent id is beyond anything seen so far, keyed by parent.
    pending: BTreeMap<ItemId, Vec<Item>>,
    pending_count: usize,
    max_seen: Option<ItemId>,
    window_seq: u64,
    stats: GroupingStats,
}

impl GroupingMerger {
    /// Create an empty merger.
    pub fn new(config: GroupingConfig) -> Self {
        Self {
            max_carryover: config.max_pending_carryover,
            held: Vec::new(),
            pending: BTreeMap::new(),
            pending_count: 0,
            max_seen: None,
            window_seq: 0,
            stats: GroupingStats::default(),
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> &GroupingStats {
        &self.stats
    }

    /// Items currently carried between windows.
    pub fn resident_items(&self) -> usize {
        self.held.len() + self.pending_count
    }

    /// Lowest item id not yet handed out, if any is carried.
    pub fn lowest_outstanding_id(&self) -> Option<ItemId> {
        let held = self.held.iter().map(|h| h.item.id).min();
        let pending = self.pending.values().flatten().map(|i| i.id).min();
        match (held, pending) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Feed one window (ascending ids) and take the units that are ready.
    ///
    /// An empty window means the source is exhausted and flushes everything.
    pub fn push_window(&mut self, window: Vec<Item>) -> Vec<ProcessingUnit> {
        if window.is_empty() {
            return self.finish();
        }
        self.window_seq += 1;
        let seq = self.window_seq;
        let tail_id = window.last().map(|i| i.id);
        if let Some(last) = tail_id {
            self.max_seen = Some(self.max_seen.map_or(last, |m| m.max(last)));
        }
        let max_seen = self.max_seen.unwrap_or(0);

        let mut pool = std::mem::take(&mut self.held);
        for item in window {
            match item.parent_id {
                Some(parent) if parent > max_seen => {
                    trace!(item_id = item.id, parent, "reply ahead of its parent, carrying");
                    self.pending.entry(parent).or_default().push(item);
                    self.pending_count += 1;
                }
                _ => pool.push(HeldItem { item, window: seq }),
            }
        }
        // Parents at or below the high-water mark have either arrived in this
        // window or will never arrive; either way the replies rejoin the pool.
        let due: Vec<ItemId> = self.pending.range(..=max_seen).map(|(k, _)| *k).collect();
        for parent in due {
            if let Some(replies) = self.pending.remove(&parent) {
                self.pending_count -= replies.len();
                pool.extend(replies.into_iter().map(|item| HeldItem { item, window: seq }));
            }
        }

        self.note_resident(pool.len());
        let units = self.emit(pool, tail_id, false);
        self.release_pending_over_cap();
        units
    }

    /// Flush everything: the source is exhausted.
    pub fn finish(&mut self) -> Vec<ProcessingUnit> {
        let mut pool = std::mem::take(&mut self.held);
        let pending = std::mem::take(&mut self.pending);
        self.pending_count = 0;
        let seq = self.window_seq;
        pool.extend(
            pending
                .into_values()
                .flatten()
                .map(|item| HeldItem { item, window: seq }),
        );
        self.note_resident(pool.len());
        self.emit(pool, None, true)
    }

    fn note_resident(&mut self, pool_len: usize) {
        let resident = pool_len + self.pending_count;
        if resident > self.stats.peak_resident {
            self.stats.peak_resident = resident;
        }
    }

    fn release_pending_over_cap(&mut self) {
        while self.held.len() + self.pending_count > self.max_carryover {
            let Some((&parent, replies)) = self.pending.iter_mut().next() else {
                break;
            };
            let item = replies.remove(0);
            if replies.is_empty() {
                self.pending.remove(&parent);
            }
            self.pending_count -= 1;
            debug!(item_id = item.id, parent, "carry-over full, releasing reply without parent");
            self.held.push(HeldItem {
                item,
                window: self.window_seq,
            });
        }
    }

    fn emit(
        &mut self,
        mut pool: Vec<HeldItem>,
        tail_id: Option<ItemId>,
        exhausted: bool,
    ) -> Vec<ProcessingUnit> {
        pool.sort_by_key(|h| h.item.id);
        pool.dedup_by_key(|h| h.item.id);
        let mut nodes = assemble(pool, tail_id, exhausted);
        let roots = link(&mut nodes);

        let current = self.window_seq;
        let mut cut = roots.len();
        for (pos, &root) in roots.iter().enumerate() {
            let ready = exhausted || (nodes[root].window < current && !subtree_open(&nodes, root));
            if !ready {
                cut = pos;
                break;
            }
        }

        let mut resident: usize = roots[cut..]
            .iter()
            .map(|&r| subtree_len(&nodes, r))
            .sum::<usize>()
            + self.pending_count;
        while cut < roots.len()
            && resident > self.max_carryover
            && !subtree_open(&nodes, roots[cut])
        {
            resident -= subtree_len(&nodes, roots[cut]);
            cut += 1;
            self.stats.forced_flushes += 1;
        }

        let mut out = Vec::new();
        for &root in &roots[..cut] {
            if nodes[root]
                .unit
                .as_ref()
                .is_some_and(|u| u.parent_id().is_some())
            {
                self.stats.orphan_replies += 1;
            }
            self.flatten(&mut nodes, root, &mut out);
        }

        for &root in &roots[cut..] {
            self.hold_subtree(&mut nodes, root);
        }
        self.held.sort_by_key(|h| h.item.id);

        if !out.is_empty() {
            debug!(
                emitted = out.len(),
                held = self.held.len(),
                pending = self.pending_count,
                "units ready"
            );
        }
        out
    }

    fn flatten(&mut self, nodes: &mut [Node], idx: usize, out: &mut Vec<ProcessingUnit>) {
        if let Some(unit) = nodes[idx].unit.take() {
            self.stats.units_emitted += 1;
            if unit.is_album() {
                self.stats.albums_emitted += 1;
            }
            out.push(unit);
        }
        let children = std::mem::take(&mut nodes[idx].children);
        for child in children {
            self.stats.replies_spliced += 1;
            self.flatten(nodes, child, out);
        }
    }

    fn hold_subtree(&mut self, nodes: &mut [Node], idx: usize) {
        let window = nodes[idx].window;
        if let Some(unit) = nodes[idx].unit.take() {
            let items = match unit {
                ProcessingUnit::Single(item) => vec![item],
                ProcessingUnit::Album { items, .. } => items,
            };
            self.held
                .extend(items.into_iter().map(|item| HeldItem { item, window }));
        }
        let children = std::mem::take(&mut nodes[idx].children);
        for child in children {
            self.hold_subtree(nodes, child);
        }
    }
}

/// Build one node per single item or album, ordered by first id.
fn assemble(pool: Vec<HeldItem>, tail_id: Option<ItemId>, exhausted: bool) -> Vec<Node> {
    let mut albums: BTreeMap<u64, (Vec<Item>, u64)> = BTreeMap::new();
    let mut nodes = Vec::new();
    for held in pool {
        match held.item.group_key {
            Some(key) => {
                let entry = albums.entry(key).or_insert_with(|| (Vec::new(), 0));
                entry.1 = entry.1.max(held.window);
                entry.0.push(held.item);
            }
            None => nodes.push(Node {
                unit: Some(ProcessingUnit::Single(held.item)),
                window: held.window,
                open: false,
                len: 1,
                children: Vec::new(),
            }),
        }
    }
    for (key, (items, window)) in albums {
        let open = !exhausted && tail_id.is_some_and(|tail| items.iter().any(|i| i.id == tail));
        let len = items.len();
        if let Some(unit) = ProcessingUnit::album(key, items) {
            nodes.push(Node {
                unit: Some(unit),
                window,
                open,
                len,
                children: Vec::new(),
            });
        }
    }
    nodes.sort_by_key(|n| n.unit.as_ref().map_or(0, |u| u.first_id()));
    nodes
}

/// Attach reply units to the unit holding their parent; return the roots.
fn link(nodes: &mut [Node]) -> Vec<usize> {
    let mut owner: HashMap<ItemId, usize> = HashMap::new();
    for (idx, node) in nodes.iter().enumerate() {
        if let Some(unit) = &node.unit {
            for item in unit.items() {
                owner.insert(item.id, idx);
            }
        }
    }

    let mut parent_of: Vec<Option<usize>> = vec![None; nodes.len()];
    for idx in 0..nodes.len() {
        let Some(parent_item) = nodes[idx].unit.as_ref().and_then(|u| u.parent_id()) else {
            continue;
        };
        let Some(&parent) = owner.get(&parent_item) else {
            continue;
        };
        if parent != idx && !is_ancestor(&parent_of, idx, parent) {
            parent_of[idx] = Some(parent);
        }
    }

    let mut roots = Vec::new();
    for idx in 0..nodes.len() {
        match parent_of[idx] {
            Some(parent) => nodes[parent].children.push(idx),
            None => roots.push(idx),
        }
    }
    let keys: Vec<(u64, ItemId)> = nodes
        .iter()
        .map(|n| {
            n.unit
                .as_ref()
                .map_or((0, 0), |u| (u.timestamp(), u.first_id()))
        })
        .collect();
    for node in nodes.iter_mut() {
        node.children.sort_by_key(|&c| keys[c]);
    }
    roots
}

/// Whether `candidate` sits on the parent chain starting at `from`.
fn is_ancestor(parent_of: &[Option<usize>], candidate: usize, from: usize) -> bool {
    let mut cursor = Some(from);
    while let Some(idx) = cursor {
        if idx == candidate {
            return true;
        }
        cursor = parent_of[idx];
    }
    false
}

fn subtree_open(nodes: &[Node], idx: usize) -> bool {
    nodes[idx].open || nodes[idx].children.iter().any(|&c| subtree_open(nodes, c))
}

fn subtree_len(nodes: &[Node], idx: usize) -> usize {
    nodes[idx].len
        + nodes[idx]
            .children
            .iter()
            .map(|&c| subtree_len(nodes, c))
            .sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: ItemId) -> Item {
        Item::text(id, id * 10, format!("#{id}"))
    }

    fn merger(cap: usize) -> GroupingMerger {
        GroupingMerger::new(GroupingConfig {
            max_pending_carryover: cap,
        })
    }

    fn ids(units: &[ProcessingUnit]) -> Vec<Vec<ItemId>> {
        units
            .iter()
            .map(|u| u.items().iter().map(|i| i.id).collect())
            .collect()
    }

    fn run(m: &mut GroupingMerger, windows: Vec<Vec<Item>>) -> Vec<Vec<ItemId>> {
        let mut out = Vec::new();
        for w in windows {
            out.extend(m.push_window(w));
        }
        out.extend(m.finish());
        ids(&out)
    }

    mod ordering {
        use super::*;

        #[test]
        fn test_reply_in_next_window_spliced_after_parent() {
            let mut m = merger(100);
            let out = run(
                &mut m,
                vec![
                    vec![item(1), item(2).in_group(9), item(3).in_group(9)],
                    vec![item(4).reply_to(1)],
                ],
            );
            assert_eq!(out, vec![vec![1], vec![4], vec![2, 3]]);
            assert_eq!(m.stats().replies_spliced, 1);
        }

        #[test]
        fn test_plain_items_keep_id_order() {
            let mut m = merger(100);
            let out = run(&mut m, vec![vec![item(1), item(2)], vec![item(3)]]);
            assert_eq!(out, vec![vec![1], vec![2], vec![3]]);
        }

        #[test]
        fn test_album_spanning_windows_not_split() {
            let mut m = merger(100);
            let out = run(
                &mut m,
                vec![
                    vec![item(1), item(2).in_group(5)],
                    vec![item(3).in_group(5), item(4)],
                    vec![item(5)],
                ],
            );
            assert_eq!(out, vec![vec![1], vec![2, 3], vec![4], vec![5]]);
        }

        #[test]
        fn test_sibling_replies_by_timestamp() {
            let mut m = merger(100);
            let mut late = item(3).reply_to(1);
            late.timestamp = 500;
            let mut early = item(4).reply_to(1);
            early.timestamp = 100;
            let out = run(&mut m, vec![vec![item(1), item(2), late, early]]);
            assert_eq!(out, vec![vec![1], vec![4], vec![3], vec![2]]);
        }

        #[test]
        fn test_reply_to_album_member() {
            let mut m = merger(100);
            let out = run(
                &mut m,
                vec![vec![
                    item(1).in_group(7),
                    item(2).in_group(7),
                    item(3),
                    item(4).reply_to(2),
                ]],
            );
            assert_eq!(out, vec![vec![1, 2], vec![4], vec![3]]);
        }

        #[test]
        fn test_reply_album_grouped_under_parent() {
            let mut m = merger(100);
            let out = run(
                &mut m,
                vec![vec![
                    item(1),
                    item(2),
                    item(3).reply_to(1).in_group(4),
                    item(4).reply_to(1).in_group(4),
                ]],
            );
            assert_eq!(out, vec![vec![1], vec![3, 4], vec![2]]);
        }

        #[test]
        fn test_nested_replies_depth_first() {
            let mut m = merger(100);
            let out = run(
                &mut m,
                vec![vec![
                    item(1),
                    item(2),
                    item(3).reply_to(1),
                    item(4).reply_to(3),
                    item(5).reply_to(1),
                ]],
            );
            assert_eq!(out, vec![vec![1], vec![3], vec![4], vec![5], vec![2]]);
        }

        #[test]
        fn test_orphan_reply_is_single_in_id_order() {
            let mut m = merger(100);
            let out = run(&mut m, vec![vec![item(10), item(11).reply_to(3), item(12)]]);
            assert_eq!(out, vec![vec![10], vec![11], vec![12]]);
            assert_eq!(m.stats().orphan_replies, 1);
        }

        #[test]
        fn test_reply_two_windows_late_becomes_orphan() {
            let mut m = merger(100);
            let out = run(
                &mut m,
                vec![vec![item(1)], vec![item(2)], vec![item(3)], vec![item(4).reply_to(1)]],
            );
            assert_eq!(out, vec![vec![1], vec![2], vec![3], vec![4]]);
            assert_eq!(m.stats().orphan_replies, 1);
        }

        #[test]
        fn test_reply_waiting_for_later_parent() {
            let mut m = merger(100);
            let out = run(&mut m, vec![vec![item(1), item(2).reply_to(5)], vec![item(5), item(6)]]);
            assert_eq!(out, vec![vec![1], vec![5], vec![2], vec![6]]);
        }

        #[test]
        fn test_cyclic_replies_do_not_hang() {
            let mut m = merger(100);
            let out = run(&mut m, vec![vec![item(1).reply_to(2), item(2).reply_to(1)]]);
            assert_eq!(out.len(), 2);
        }
    }

    mod holding {
        use super::*;

        #[test]
        fn test_newest_window_is_held() {
            let mut m = merger(100);
            assert!(m.push_window(vec![item(1), item(2)]).is_empty());
            assert_eq!(m.resident_items(), 2);
            assert_eq!(m.lowest_outstanding_id(), Some(1));
            let out = m.push_window(vec![item(3)]);
            assert_eq!(ids(&out), vec![vec![1], vec![2]]);
            assert_eq!(m.lowest_outstanding_id(), Some(3));
        }

        #[test]
        fn test_empty_window_flushes() {
            let mut m = merger(100);
            m.push_window(vec![item(1)]);
            let out = m.push_window(Vec::new());
            assert_eq!(ids(&out), vec![vec![1]]);
            assert_eq!(m.resident_items(), 0);
            assert_eq!(m.lowest_outstanding_id(), None);
        }

        #[test]
        fn test_cap_forces_flush() {
            let mut m = merger(3);
            m.push_window(vec![item(1), item(2), item(3), item(4), item(5)]);
            assert!(m.resident_items() <= 3);
            assert!(m.stats().forced_flushes >= 2);
        }

        #[test]
        fn test_open_album_never_forced() {
            let mut m = merger(1);
            let out = m.push_window(vec![item(1), item(2).in_group(3), item(3).in_group(3)]);
            assert_eq!(ids(&out), vec![vec![1]]);
            let out = m.push_window(vec![item(4).in_group(3), item(5)]);
            assert_eq!(ids(&out), vec![vec![2, 3, 4]]);
        }

        #[test]
        fn test_pending_reply_released_over_cap() {
            let mut m = merger(1);
            m.push_window(vec![item(1).reply_to(50), item(2).reply_to(60)]);
            assert!(m.resident_items() <= 2);
            let rest = m.finish();
            assert_eq!(rest.len(), 2);
        }
    }

    #[test]
    fn test_peak_resident_bounded() {
        let window = 100;
        let cap = 100;
        let mut m = merger(cap);
        let mut next = 1u64;
        let mut emitted = 0usize;
        while next <= 100_000 {
            let mut w = Vec::with_capacity(window);
            for _ in 0..window {
                let mut it = item(next);
                if next % 7 == 0 || next % 7 == 1 {
                    it.group_key = Some(next / 7);
                }
                if next % 13 == 0 && it.group_key.is_none() {
                    it.parent_id = Some(next - 5);
                }
                w.push(it);
                next += 1;
            }
            emitted += m.push_window(w).iter().map(|u| u.len()).sum::<usize>();
        }
        emitted += m.finish().iter().map(|u| u.len()).sum::<usize>();
        assert_eq!(emitted, 100_000);
        assert!(m.stats().peak_resident <= window + cap);
    }
}
