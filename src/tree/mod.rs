//! Order-statistic B+ tree.
//!
//! An in-memory B+ tree multimap augmented with subtree sizes: every inner
//! node stores the number of leaf entries below it, which makes rank
//! queries (`find_rank`, `rank_of_*`) O(log n) in addition to the usual
//! ordered-map operations. On top of that the tree supports O(log n) split
//! by key, split by rank, join, and bulk deletion of the k smallest
//! entries (see `surgery`), plus bottom-up bulk loading from sorted input.
//!
//! Separator convention: an inner node's separator at slot `s` equals the
//! **maximum key of child `s`'s subtree** (last-key separators), not the
//! more common first-key-of-right-child. Deletion fix-ups, `find_lower` /
//! `find_upper` and the join machinery all depend on this choice.
//!
//! Duplicates are allowed. Contract violations panic; there are no
//! recoverable errors.

mod cursor;
mod node;
mod surgery;

pub use cursor::{Cursor, Iter};

use node::{NodeId, Store, INNER_MIN, INNER_SLOTS, LEAF_MIN, LEAF_SLOTS};

/// B+ tree multimap with subtree-size augmentation.
pub struct RankTree<K, V> {
    store: Store<K, V>,
    root: Option<NodeId>,
    head_leaf: Option<u32>,
    tail_leaf: Option<u32>,
}

impl<K, V> Default for RankTree<K, V> {
    fn default() -> Self {
        Self {
            store: Store::new(),
            root: None,
            head_leaf: None,
            tail_leaf: None,
        }
    }
}

impl NodeId {
    fn leaf_id(self) -> u32 {
        match self {
            NodeId::Leaf(id) => id,
            NodeId::Inner(_) => panic!("expected leaf node"),
        }
    }

    fn inner_id(self) -> u32 {
        match self {
            NodeId::Inner(id) => id,
            NodeId::Leaf(_) => panic!("expected inner node"),
        }
    }
}

enum RankQuery {
    Exact,
    LowerBound,
    UpperBound,
}

/// What the erase descent is looking for.
enum EraseTarget<K> {
    /// First entry with this key.
    Key(K),
    /// The exact slot a cursor points at.
    At { leaf: u32, slot: usize, key: K },
}

impl<K> EraseTarget<K> {
    fn key(&self) -> &K {
        match self {
            EraseTarget::Key(k) => k,
            EraseTarget::At { key, .. } => key,
        }
    }
}

/// Information the erase descent passes back up.
struct EraseResult<K, V> {
    found: bool,
    /// The entry that was removed.
    removed: Option<(K, V)>,
    /// New maximum of the subtree; an ancestor owning a separator for it
    /// must rewrite that separator.
    last_key: Option<K>,
    /// Two children were merged; the parent must drop the emptied one.
    fix_merge: bool,
}

impl<K, V> EraseResult<K, V> {
    fn ok() -> Self {
        Self {
            found: true,
            removed: None,
            last_key: None,
            fix_merge: false,
        }
    }

    fn not_found() -> Self {
        Self {
            found: false,
            removed: None,
            last_key: None,
            fix_merge: false,
        }
    }

    fn fix_merge() -> Self {
        Self {
            found: true,
            removed: None,
            last_key: None,
            fix_merge: true,
        }
    }

    /// Merge a rebalancing result into this one. `removed` stays ours.
    fn absorb(&mut self, other: EraseResult<K, V>) {
        self.found |= other.found;
        self.fix_merge |= other.fix_merge;
        if other.last_key.is_some() {
            self.last_key = other.last_key;
        }
    }
}

impl<K: Ord + Clone, V> RankTree<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        match self.root {
            None => 0,
            Some(n) => self.store.entries(n),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries and nodes.
    pub fn clear(&mut self) {
        self.store.reset();
        self.root = None;
        self.head_leaf = None;
        self.tail_leaf = None;
    }

    /// Smallest entry.
    pub fn first(&self) -> Option<(&K, &V)> {
        let leaf = self.store.leaf(self.head_leaf?);
        leaf.slots.first().map(|(k, v)| (k, v))
    }

    /// Largest entry.
    pub fn last(&self) -> Option<(&K, &V)> {
        let leaf = self.store.leaf(self.tail_leaf?);
        leaf.slots.last().map(|(k, v)| (k, v))
    }

    // *** Search

    /// First slot in a leaf whose key is `>= key`.
    fn leaf_lower(leaf: &node::LeafNode<K, V>, key: &K) -> usize {
        leaf.slots.partition_point(|(k, _)| k < key)
    }

    /// First slot in a leaf whose key is `> key`.
    fn leaf_upper(leaf: &node::LeafNode<K, V>, key: &K) -> usize {
        leaf.slots.partition_point(|(k, _)| k <= key)
    }

    /// First separator `>= key`; the child at that slot may hold `key`.
    fn inner_lower(inner: &node::InnerNode<K>, key: &K) -> usize {
        inner.keys.partition_point(|k| k < key)
    }

    /// First separator `> key`.
    fn inner_upper(inner: &node::InnerNode<K>, key: &K) -> usize {
        inner.keys.partition_point(|k| k <= key)
    }

    /// Cursor at the first entry equal to `key`, or `end()`.
    pub fn find(&self, key: &K) -> Cursor {
        let mut n = match self.root {
            Some(n) => n,
            None => return self.end(),
        };
        loop {
            match n {
                NodeId::Inner(id) => {
                    let inner = self.store.inner(id);
                    let slot = Self::inner_lower(inner, key);
                    n = inner.children[slot];
                }
                NodeId::Leaf(id) => {
                    let leaf = self.store.leaf(id);
                    let slot = Self::leaf_lower(leaf, key);
                    if slot < leaf.slots.len() && leaf.slots[slot].0 == *key {
                        return Cursor::new(id, slot);
                    }
                    return self.end();
                }
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entry(self.find(key)).is_some()
    }

    /// Cursor at the first entry with key `>= key`.
    pub fn lower_bound(&self, key: &K) -> Cursor {
        self.rank_of_lower_bound(key).1
    }

    /// Cursor at the first entry with key `> key`.
    pub fn upper_bound(&self, key: &K) -> Cursor {
        self.rank_of_upper_bound(key).1
    }

    // *** Insertion

    /// Insert an entry; duplicate keys are kept (multimap semantics).
    pub fn insert(&mut self, key: K, value: V) {
        if self.root.is_none() {
            let leaf = self.store.alloc_leaf();
            self.root = Some(NodeId::Leaf(leaf));
            self.head_leaf = Some(leaf);
            self.tail_leaf = Some(leaf);
        }
        let root = self.root.unwrap();
        if let Some((split_key, split_node)) = self.insert_descend(root, key, value) {
            self.raise_root(split_key, split_node);
        }
    }

    /// Grow the tree by one level after a root split.
    fn raise_root(&mut self, split_key: K, new_sibling: NodeId) {
        let old_root = self.root.unwrap();
        debug_assert_eq!(self.store.level(old_root), self.store.level(new_sibling));
        let level = self.store.level(old_root) + 1;
        let size = self.store.entries(old_root) + self.store.entries(new_sibling);
        let id = self.store.alloc_inner(level);
        let inner = self.store.inner_mut(id);
        inner.keys.push(split_key);
        inner.children.push(old_root);
        inner.children.push(new_sibling);
        inner.subtree_size = size;
        self.root = Some(NodeId::Inner(id));
    }

    /// Descend to a leaf and insert, splitting overflowing nodes on the way
    /// back up. Returns the separator/sibling pair when `n` itself split.
    fn insert_descend(&mut self, n: NodeId, key: K, value: V) -> Option<(K, NodeId)> {
        match n {
            NodeId::Leaf(leaf_id) => {
                let mut slot = Self::leaf_lower(self.store.leaf(leaf_id), &key);
                let mut split: Option<(K, u32)> = None;
                let mut target = leaf_id;
                if self.store.leaf(leaf_id).is_full() {
                    let (split_key, new_leaf) = self.split_leaf_grow(leaf_id);
                    let left_len = self.store.leaf(leaf_id).slots.len();
                    if slot >= left_len {
                        slot -= left_len;
                        target = new_leaf;
                    }
                    split = Some((split_key, new_leaf));
                }

                let inserted_key = key.clone();
                self.store.leaf_mut(target).slots.insert(slot, (key, value));

                // The node split and the insert landed on the old node's last
                // slot: the inserted key is the new maximum of the left half
                // and must become the separator.
                if let Some((split_key, _)) = split.as_mut() {
                    if target == leaf_id && slot == self.store.leaf(leaf_id).slots.len() - 1 {
                        *split_key = inserted_key;
                    }
                }

                split.map(|(k, id)| (k, NodeId::Leaf(id)))
            }
            NodeId::Inner(inner_id) => {
                let slot = Self::inner_lower(self.store.inner(inner_id), &key);
                let child = self.store.inner(inner_id).children[slot];

                let child_split = self.insert_descend(child, key, value);

                let mut my_split: Option<(K, u32)> = None;
                let mut ins_inner = inner_id;

                if let Some((new_key, new_child)) = child_split {
                    let mut ins_slot = slot;
                    if self.store.inner(inner_id).is_full() {
                        let new_entries = self.store.entries(new_child);
                        let (up_key, split_id) = self.split_inner_grow(inner_id, slot);
                        let left_use = self.store.inner(inner_id).keys.len();
                        let right_use = self.store.inner(split_id).keys.len();

                        if ins_slot == left_use + 1 && left_use < right_use {
                            // The link belongs exactly between the two
                            // halves: move the right half's first child into
                            // the left half and make the new child the right
                            // half's first child. The propagated key is the
                            // child's split key, not the node's.
                            let moved = self.store.inner(split_id).children[0];
                            let moved_entries = self.store.entries(moved);
                            {
                                let inner = self.store.inner_mut(inner_id);
                                inner.keys.push(up_key);
                                inner.children.push(moved);
                                inner.subtree_size += moved_entries;
                            }
                            {
                                let split = self.store.inner_mut(split_id);
                                split.subtree_size =
                                    split.subtree_size - moved_entries + new_entries;
                                split.children[0] = new_child;
                            }
                            // split sizes were recomputed with the new entry
                            // already counted, so no +1 below
                            return Some((new_key, NodeId::Inner(split_id)));
                        } else if ins_slot >= left_use + 1 {
                            ins_slot -= left_use + 1;
                            ins_inner = split_id;
                        }
                        my_split = Some((up_key, split_id));
                        self.store.inner_mut(ins_inner).subtree_size += new_entries - 1;
                    }
                    let inner = self.store.inner_mut(ins_inner);
                    inner.keys.insert(ins_slot, new_key);
                    inner.children.insert(ins_slot + 1, new_child);
                }

                self.store.inner_mut(ins_inner).subtree_size += 1;
                my_split.map(|(k, id)| (k, NodeId::Inner(id)))
            }
        }
    }

    /// Split a full leaf in half; returns (separator, new right leaf).
    fn split_leaf_grow(&mut self, leaf_id: u32) -> (K, u32) {
        debug_assert!(self.store.leaf(leaf_id).is_full());
        let new_id = self.store.alloc_leaf();

        let mid = self.store.leaf(leaf_id).slots.len() / 2;
        let moved: Vec<(K, V)> = self.store.leaf_mut(leaf_id).slots.drain(mid..).collect();
        let old_next = self.store.leaf(leaf_id).next;

        {
            let new_leaf = self.store.leaf_mut(new_id);
            new_leaf.slots.extend(moved);
            new_leaf.next = old_next;
            new_leaf.prev = Some(leaf_id);
        }
        match old_next {
            Some(next) => self.store.leaf_mut(next).prev = Some(new_id),
            None => {
                debug_assert_eq!(self.tail_leaf, Some(leaf_id));
                self.tail_leaf = Some(new_id);
            }
        }
        self.store.leaf_mut(leaf_id).next = Some(new_id);

        let split_key = self.store.leaf(leaf_id).last_key().clone();
        (split_key, new_id)
    }

    /// Split a full inner node; `add_slot` is where the pending link will be
    /// inserted, so the halves end up balanced after that insert. Returns
    /// (separator, new right node). Both subtree sizes are recomputed from
    /// the children.
    fn split_inner_grow(&mut self, inner_id: u32, add_slot: usize) -> (K, u32) {
        debug_assert!(self.store.inner(inner_id).is_full());
        let level = self.store.inner(inner_id).level;
        let len = self.store.inner(inner_id).keys.len();

        let mut mid = len / 2;
        if add_slot <= mid && mid > len - (mid + 1) {
            mid -= 1;
        }

        let new_id = self.store.alloc_inner(level);
        let (right_keys, right_children, up_key) = {
            let inner = self.store.inner_mut(inner_id);
            let right_keys: Vec<K> = inner.keys.drain(mid + 1..).collect();
            let right_children: Vec<NodeId> = inner.children.drain(mid + 1..).collect();
            let up_key = inner.keys.pop().unwrap();
            (right_keys, right_children, up_key)
        };

        let left_children: Vec<NodeId> = self.store.inner(inner_id).children.to_vec();
        let left_sum = self.store.sum_entries(&left_children);
        let right_sum = self.store.sum_entries(&right_children);

        self.store.inner_mut(inner_id).subtree_size = left_sum;
        {
            let new_inner = self.store.inner_mut(new_id);
            new_inner.keys.extend(right_keys);
            new_inner.children.extend(right_children);
            new_inner.subtree_size = right_sum;
        }
        (up_key, new_id)
    }

    // *** Deletion

    /// Remove the first entry equal to `key`. Returns whether one existed.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(root) = self.root else { return false };
        let result = self.erase_descend(
            &EraseTarget::Key(key.clone()),
            root,
            None,
            None,
            None,
            None,
            None,
            0,
        );
        result.found
    }

    /// Remove and return the largest entry.
    pub fn pop_last(&mut self) -> Option<(K, V)> {
        if self.is_empty() {
            return None;
        }
        let last = self.prev_cursor(self.end());
        Some(self.remove_at(last))
    }

    /// Remove every entry equal to `key`; returns how many were removed.
    pub fn remove_all(&mut self, key: &K) -> usize {
        let mut n = 0;
        while self.remove(key) {
            n += 1;
        }
        n
    }

    /// Remove and return the entry a cursor points at. The cursor must be
    /// valid and dereferenceable (not `end()`).
    pub fn remove_at(&mut self, cursor: Cursor) -> (K, V) {
        let Some(root) = self.root else {
            panic!("remove_at on empty tree")
        };
        let leaf = cursor.leaf.expect("remove_at with null cursor");
        let key = self.store.leaf(leaf).slots[cursor.slot].0.clone();
        let target = EraseTarget::At {
            leaf,
            slot: cursor.slot,
            key,
        };
        let mut result = self.erase_descend(&target, root, None, None, None, None, None, 0);
        assert!(result.found, "remove_at cursor did not resolve to an entry");
        result.removed.take().unwrap()
    }

    /// Recursive erase. The parent, both siblings and the siblings' parents
    /// travel down the descent so underflows can be fixed by shifting from
    /// or merging with a neighbor that shares the current parent.
    #[allow(clippy::too_many_arguments)]
    fn erase_descend(
        &mut self,
        target: &EraseTarget<K>,
        curr: NodeId,
        left: Option<NodeId>,
        right: Option<NodeId>,
        left_parent: Option<u32>,
        right_parent: Option<u32>,
        parent: Option<u32>,
        parent_slot: usize,
    ) -> EraseResult<K, V> {
        match curr {
            NodeId::Leaf(leaf_id) => self.erase_in_leaf(
                target,
                leaf_id,
                left.map(NodeId::leaf_id),
                right.map(NodeId::leaf_id),
                left_parent,
                right_parent,
                parent,
                parent_slot,
            ),
            NodeId::Inner(inner_id) => self.erase_in_inner(
                target,
                inner_id,
                left.map(NodeId::inner_id),
                right.map(NodeId::inner_id),
                left_parent,
                right_parent,
                parent,
                parent_slot,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn erase_in_leaf(
        &mut self,
        target: &EraseTarget<K>,
        leaf_id: u32,
        left: Option<u32>,
        right: Option<u32>,
        left_parent: Option<u32>,
        right_parent: Option<u32>,
        parent: Option<u32>,
        parent_slot: usize,
    ) -> EraseResult<K, V> {
        let slot = match target {
            EraseTarget::Key(key) => {
                let leaf = self.store.leaf(leaf_id);
                let slot = Self::leaf_lower(leaf, key);
                if slot >= leaf.slots.len() || leaf.slots[slot].0 != *key {
                    return EraseResult::not_found();
                }
                slot
            }
            EraseTarget::At { leaf, slot, .. } => {
                if *leaf != leaf_id || *slot >= self.store.leaf(leaf_id).slots.len() {
                    return EraseResult::not_found();
                }
                *slot
            }
        };

        let removed = self.store.leaf_mut(leaf_id).slots.remove(slot);

        let mut myres = EraseResult::ok();
        myres.removed = Some(removed);

        // removed the leaf maximum: the separator covering this leaf (which
        // may live several levels up) must be rewritten
        if slot == self.store.leaf(leaf_id).slots.len() {
            if let Some(p) = parent.filter(|&p| parent_slot < self.store.inner(p).keys.len()) {
                debug_assert_eq!(
                    self.store.inner(p).children[parent_slot],
                    NodeId::Leaf(leaf_id)
                );
                let new_max = self.store.leaf(leaf_id).last_key().clone();
                self.store.inner_mut(p).keys[parent_slot] = new_max;
            } else if !self.store.leaf(leaf_id).slots.is_empty() {
                myres.last_key = Some(self.store.leaf(leaf_id).last_key().clone());
            } else {
                debug_assert_eq!(self.root, Some(NodeId::Leaf(leaf_id)));
            }
        }

        let len = self.store.leaf(leaf_id).slots.len();
        let is_root = self.root == Some(NodeId::Leaf(leaf_id));
        if len < LEAF_MIN && !(is_root && len >= 1) {
            if left.is_none() && right.is_none() {
                // the now-empty leaf is the root
                debug_assert!(is_root && len == 0);
                self.store.free_leaf(leaf_id);
                self.root = None;
                self.head_leaf = None;
                self.tail_leaf = None;
                return myres;
            }
            let left_few = left.map(|l| self.store.leaf(l).is_few());
            let right_few = right.map(|r| self.store.leaf(r).is_few());
            if left_few.unwrap_or(true) && right_few.unwrap_or(true) {
                // both neighbors are minimal: merge with the one sharing our
                // parent
                if left_parent == parent {
                    myres.absorb(self.merge_leaves(left.unwrap(), leaf_id));
                } else {
                    myres.absorb(self.merge_leaves(leaf_id, right.unwrap()));
                }
            } else if left_few == Some(true) && right_few == Some(false) {
                if right_parent == parent {
                    myres.absorb(self.shift_left_leaf(leaf_id, right.unwrap(), parent.unwrap(), parent_slot));
                } else {
                    myres.absorb(self.merge_leaves(left.unwrap(), leaf_id));
                }
            } else if left_few == Some(false) && right_few == Some(true) {
                if left_parent == parent {
                    self.shift_right_leaf(left.unwrap(), leaf_id, parent.unwrap(), parent_slot - 1);
                } else {
                    myres.absorb(self.merge_leaves(leaf_id, right.unwrap()));
                }
            } else if left_parent == right_parent {
                // both neighbors have spare entries under the same parent:
                // borrow from the fuller one
                let ll = self.store.leaf(left.unwrap()).slots.len();
                let rl = self.store.leaf(right.unwrap()).slots.len();
                if ll <= rl {
                    myres.absorb(self.shift_left_leaf(leaf_id, right.unwrap(), parent.unwrap(), parent_slot));
                } else {
                    self.shift_right_leaf(left.unwrap(), leaf_id, parent.unwrap(), parent_slot - 1);
                }
            } else if left_parent == parent {
                self.shift_right_leaf(left.unwrap(), leaf_id, parent.unwrap(), parent_slot - 1);
            } else {
                myres.absorb(self.shift_left_leaf(leaf_id, right.unwrap(), parent.unwrap(), parent_slot));
            }
        }

        myres
    }

    #[allow(clippy::too_many_arguments)]
    fn erase_in_inner(
        &mut self,
        target: &EraseTarget<K>,
        inner_id: u32,
        left: Option<u32>,
        right: Option<u32>,
        left_parent: Option<u32>,
        right_parent: Option<u32>,
        parent: Option<u32>,
        parent_slot: usize,
    ) -> EraseResult<K, V> {
        let mut slot = Self::inner_lower(self.store.inner(inner_id), target.key());
        let mut result;

        // With duplicate keys the target leaf can sit under any child whose
        // separator still matches, so probe forward until found.
        loop {
            if slot > self.store.inner(inner_id).keys.len() {
                return EraseResult::not_found();
            }
            let inner = self.store.inner(inner_id);
            let (myleft, myleft_parent) = if slot == 0 {
                (
                    left.map(|l| *self.store.inner(l).children.last().unwrap()),
                    left_parent,
                )
            } else {
                (Some(inner.children[slot - 1]), Some(inner_id))
            };
            let (myright, myright_parent) = if slot == inner.keys.len() {
                (right.map(|r| self.store.inner(r).children[0]), right_parent)
            } else {
                (Some(inner.children[slot + 1]), Some(inner_id))
            };
            let child = inner.children[slot];

            result = self.erase_descend(
                target,
                child,
                myleft,
                myright,
                myleft_parent,
                myright_parent,
                Some(inner_id),
                slot,
            );
            if result.found {
                break;
            }
            if slot < self.store.inner(inner_id).keys.len()
                && self.store.inner(inner_id).keys[slot] < *target.key()
            {
                return EraseResult::not_found();
            }
            slot += 1;
        }

        self.store.inner_mut(inner_id).subtree_size -= 1;

        let mut myres = EraseResult::ok();
        myres.removed = result.removed.take();

        if let Some(last_key) = result.last_key.take() {
            if let Some(p) = parent.filter(|&p| parent_slot < self.store.inner(p).keys.len()) {
                debug_assert_eq!(
                    self.store.inner(p).children[parent_slot],
                    NodeId::Inner(inner_id)
                );
                self.store.inner_mut(p).keys[parent_slot] = last_key;
            } else {
                myres.last_key = Some(last_key);
            }
        }

        if result.fix_merge {
            // one of the two merged children is empty now; drop it
            if self.store.slot_use(self.store.inner(inner_id).children[slot]) != 0 {
                slot += 1;
            }
            let empty_child = self.store.inner(inner_id).children[slot];
            debug_assert_eq!(self.store.slot_use(empty_child), 0);
            self.store.free_node(empty_child);
            {
                let inner = self.store.inner_mut(inner_id);
                inner.keys.remove(slot - 1);
                inner.children.remove(slot);
            }
            if self.store.inner(inner_id).level == 1 {
                // the surviving leaf has a new maximum
                slot -= 1;
                if slot < self.store.inner(inner_id).keys.len() {
                    let child = self.store.inner(inner_id).children[slot].leaf_id();
                    let new_max = self.store.leaf(child).last_key().clone();
                    self.store.inner_mut(inner_id).keys[slot] = new_max;
                }
            }
        }

        let keys_len = self.store.inner(inner_id).keys.len();
        let is_root = self.root == Some(NodeId::Inner(inner_id));
        if keys_len < INNER_MIN && !(is_root && keys_len >= 1) {
            if left.is_none() && right.is_none() {
                // the root lost its last separator: its single child takes
                // over as root
                debug_assert!(is_root && keys_len == 0);
                self.root = Some(self.store.inner(inner_id).children[0]);
                self.store.free_inner(inner_id);
                return myres;
            }
            let left_few = left.map(|l| self.store.inner(l).is_few());
            let right_few = right.map(|r| self.store.inner(r).is_few());
            if left_few.unwrap_or(true) && right_few.unwrap_or(true) {
                if left_parent == parent {
                    myres.absorb(self.merge_inner(
                        left.unwrap(),
                        inner_id,
                        parent.unwrap(),
                        parent_slot - 1,
                    ));
                } else {
                    myres.absorb(self.merge_inner(
                        inner_id,
                        right.unwrap(),
                        parent.unwrap(),
                        parent_slot,
                    ));
                }
            } else if left_few == Some(true) && right_few == Some(false) {
                if right_parent == parent {
                    self.shift_left_inner(inner_id, right.unwrap(), parent.unwrap(), parent_slot);
                } else {
                    myres.absorb(self.merge_inner(
                        left.unwrap(),
                        inner_id,
                        parent.unwrap(),
                        parent_slot - 1,
                    ));
                }
            } else if left_few == Some(false) && right_few == Some(true) {
                if left_parent == parent {
                    self.shift_right_inner(left.unwrap(), inner_id, parent.unwrap(), parent_slot - 1);
                } else {
                    myres.absorb(self.merge_inner(
                        inner_id,
                        right.unwrap(),
                        parent.unwrap(),
                        parent_slot,
                    ));
                }
            } else if left_parent == right_parent {
                let lu = self.store.inner(left.unwrap()).keys.len();
                let ru = self.store.inner(right.unwrap()).keys.len();
                if lu <= ru {
                    self.shift_left_inner(inner_id, right.unwrap(), parent.unwrap(), parent_slot);
                } else {
                    self.shift_right_inner(left.unwrap(), inner_id, parent.unwrap(), parent_slot - 1);
                }
            } else if left_parent == parent {
                self.shift_right_inner(left.unwrap(), inner_id, parent.unwrap(), parent_slot - 1);
            } else {
                self.shift_left_inner(inner_id, right.unwrap(), parent.unwrap(), parent_slot);
            }
        }

        myres
    }

    /// Move everything from `right` into `left`; the emptied `right` is
    /// unlinked from the leaf list and removed from the parent by the
    /// fix-merge pass above.
    fn merge_leaves(&mut self, left: u32, right: u32) -> EraseResult<K, V> {
        let (l, r) = self.store.two_leaves_mut(left, right);
        debug_assert!(l.slots.len() + r.slots.len() < LEAF_SLOTS);
        l.slots.extend(r.slots.drain(..));
        let new_next = r.next;
        l.next = new_next;
        match new_next {
            Some(n) => self.store.leaf_mut(n).prev = Some(left),
            None => self.tail_leaf = Some(left),
        }
        EraseResult::fix_merge()
    }

    /// Move everything from `right` into `left`, pulling the separator
    /// between them down from the parent.
    fn merge_inner(
        &mut self,
        left: u32,
        right: u32,
        parent: u32,
        parent_slot: usize,
    ) -> EraseResult<K, V> {
        debug_assert_eq!(
            self.store.inner(parent).children[parent_slot],
            NodeId::Inner(left)
        );
        let sep = self.store.inner(parent).keys[parent_slot].clone();
        let (l, r) = self.store.two_inners_mut(left, right);
        debug_assert_eq!(l.level, r.level);
        debug_assert!(l.keys.len() + r.keys.len() < INNER_SLOTS);
        l.keys.push(sep);
        l.keys.extend(r.keys.drain(..));
        l.children.extend(r.children.drain(..));
        l.subtree_size += r.subtree_size;
        r.subtree_size = 0;
        EraseResult::fix_merge()
    }

    /// Borrow entries from a fuller right leaf sibling.
    fn shift_left_leaf(
        &mut self,
        left: u32,
        right: u32,
        parent: u32,
        parent_slot: usize,
    ) -> EraseResult<K, V> {
        let (l, r) = self.store.two_leaves_mut(left, right);
        debug_assert_eq!(l.next, Some(right));
        debug_assert!(l.slots.len() < r.slots.len());
        let shift = (r.slots.len() - l.slots.len()) / 2;
        l.slots.extend(r.slots.drain(..shift));
        let new_sep = l.last_key().clone();

        debug_assert_eq!(
            self.store.inner(parent).children[parent_slot],
            NodeId::Leaf(left)
        );
        if parent_slot < self.store.inner(parent).keys.len() {
            self.store.inner_mut(parent).keys[parent_slot] = new_sep;
            EraseResult::ok()
        } else {
            // the separator lives further up
            let mut res = EraseResult::ok();
            res.last_key = Some(new_sep);
            res
        }
    }

    /// Borrow entries from a fuller left leaf sibling.
    fn shift_right_leaf(&mut self, left: u32, right: u32, parent: u32, parent_slot: usize) {
        let (l, r) = self.store.two_leaves_mut(left, right);
        debug_assert_eq!(l.next, Some(right));
        debug_assert!(l.slots.len() > r.slots.len());
        let shift = (l.slots.len() - r.slots.len()) / 2;
        let at = l.slots.len() - shift;
        let moved: Vec<(K, V)> = l.slots.drain(at..).collect();
        for (i, kv) in moved.into_iter().enumerate() {
            r.slots.insert(i, kv);
        }
        let new_sep = l.last_key().clone();
        debug_assert_eq!(
            self.store.inner(parent).children[parent_slot],
            NodeId::Leaf(left)
        );
        self.store.inner_mut(parent).keys[parent_slot] = new_sep;
    }

    /// Borrow children from a fuller right inner sibling; the parent
    /// separator rotates through.
    fn shift_left_inner(&mut self, left: u32, right: u32, parent: u32, parent_slot: usize) {
        debug_assert_eq!(
            self.store.inner(parent).children[parent_slot],
            NodeId::Inner(left)
        );
        let sep = self.store.inner(parent).keys[parent_slot].clone();
        let shift = {
            let (l, r) = (self.store.inner(left), self.store.inner(right));
            debug_assert!(l.keys.len() < r.keys.len());
            (r.keys.len() - l.keys.len()) / 2
        };

        let moved_children: Vec<NodeId> =
            self.store.inner(right).children[..shift].to_vec();
        let moved_entries = self.store.sum_entries(&moved_children);

        let new_sep;
        {
            let (l, r) = self.store.two_inners_mut(left, right);
            debug_assert_eq!(l.level, r.level);
            l.keys.push(sep);
            l.keys.extend(r.keys.drain(..shift - 1));
            l.children.extend(r.children.drain(..shift));
            new_sep = r.keys[0].clone();
            r.keys.remove(0);
            l.subtree_size += moved_entries;
            r.subtree_size -= moved_entries;
        }
        self.store.inner_mut(parent).keys[parent_slot] = new_sep;
    }

    /// Borrow children from a fuller left inner sibling.
    fn shift_right_inner(&mut self, left: u32, right: u32, parent: u32, parent_slot: usize) {
        debug_assert_eq!(
            self.store.inner(parent).children[parent_slot],
            NodeId::Inner(left)
        );
        let sep = self.store.inner(parent).keys[parent_slot].clone();
        let shift = {
            let (l, r) = (self.store.inner(left), self.store.inner(right));
            debug_assert!(l.keys.len() > r.keys.len());
            (l.keys.len() - r.keys.len()) / 2
        };

        let cut = self.store.inner(left).children.len() - shift;
        let moved_children: Vec<NodeId> = self.store.inner(left).children[cut..].to_vec();
        let moved_entries = self.store.sum_entries(&moved_children);

        let new_sep;
        {
            let (l, r) = self.store.two_inners_mut(left, right);
            debug_assert_eq!(l.level, r.level);
            let keys_cut = l.keys.len() - (shift - 1);
            let mut front_keys: Vec<K> = l.keys.drain(keys_cut..).collect();
            front_keys.push(sep);
            new_sep = l.keys.pop().unwrap();
            let front_children: Vec<NodeId> = l.children.drain(cut..).collect();

            for (i, k) in front_keys.into_iter().enumerate() {
                r.keys.insert(i, k);
            }
            for (i, c) in front_children.into_iter().enumerate() {
                r.children.insert(i, c);
            }
            l.subtree_size -= moved_entries;
            r.subtree_size += moved_entries;
        }
        self.store.inner_mut(parent).keys[parent_slot] = new_sep;
    }

    // *** Rank queries

    fn rank_impl(&self, key: &K, query: RankQuery) -> (usize, Cursor) {
        let Some(mut n) = self.root else {
            return (0, self.end());
        };
        let mut rank = 0usize;
        loop {
            match n {
                NodeId::Inner(id) => {
                    let inner = self.store.inner(id);
                    let slot = match query {
                        RankQuery::UpperBound => Self::inner_upper(inner, key),
                        _ => Self::inner_lower(inner, key),
                    };
                    rank += self.store.sum_entries(&inner.children[..slot]);
                    n = inner.children[slot];
                }
                NodeId::Leaf(id) => {
                    let leaf = self.store.leaf(id);
                    let slot = match query {
                        RankQuery::UpperBound => Self::leaf_upper(leaf, key),
                        _ => Self::leaf_lower(leaf, key),
                    };
                    if slot < leaf.slots.len() {
                        let exact_miss = matches!(query, RankQuery::Exact)
                            && leaf.slots[slot].0 != *key;
                        if !exact_miss {
                            return (rank + slot, Cursor::new(id, slot));
                        }
                    }
                    return (self.len(), self.end());
                }
            }
        }
    }

    /// Rank and cursor of the first entry equal to `key`; `(len, end)` if
    /// absent.
    pub fn rank_of(&self, key: &K) -> (usize, Cursor) {
        self.rank_impl(key, RankQuery::Exact)
    }

    /// Count of entries with key `< key`, with the cursor at that position.
    pub fn rank_of_lower_bound(&self, key: &K) -> (usize, Cursor) {
        self.rank_impl(key, RankQuery::LowerBound)
    }

    /// Count of entries with key `<= key`, with the cursor at that position.
    pub fn rank_of_upper_bound(&self, key: &K) -> (usize, Cursor) {
        self.rank_impl(key, RankQuery::UpperBound)
    }

    /// Cursor at the entry with 0-based rank `rank`, or `end()` when out of
    /// range. O(log n) thanks to the subtree-size augmentation.
    pub fn find_rank(&self, rank: usize) -> Cursor {
        if rank >= self.len() {
            return self.end();
        }
        let mut rank = rank;
        let mut n = self.root.unwrap();
        loop {
            match n {
                NodeId::Inner(id) => {
                    let inner = self.store.inner(id);
                    for &child in inner.children.iter() {
                        let below = self.store.entries(child);
                        if below > rank {
                            n = child;
                            break;
                        }
                        rank -= below;
                    }
                }
                NodeId::Leaf(id) => {
                    debug_assert!(rank < self.store.leaf(id).slots.len());
                    return Cursor::new(id, rank);
                }
            }
        }
    }

    /// Key of the entry at `rank`.
    pub fn key_at_rank(&self, rank: usize) -> Option<&K> {
        self.entry(self.find_rank(rank)).map(|(k, _)| k)
    }

    /// Rank of the entry a cursor points at (`len` for `end()`). Worst case
    /// linear in the number of duplicates of that key.
    pub fn rank_of_cursor(&self, cursor: Cursor) -> usize {
        if cursor == self.end() || cursor.leaf.is_none() {
            return self.len();
        }
        let key = &self.store.leaf(cursor.leaf.unwrap()).slots[cursor.slot].0;
        let (rank, mut c) = self.rank_of(key);
        let mut offset = 0;
        while c != cursor {
            c = self.next_cursor(c);
            offset += 1;
        }
        rank + offset
    }

    // *** Bulk loading

    /// Build a well-packed tree bottom-up from entries sorted by key. The
    /// tree must be empty; input order is checked in debug builds.
    pub fn bulk_load<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = (K, V)>,
        I::IntoIter: ExactSizeIterator,
    {
        assert!(self.is_empty(), "bulk_load requires an empty tree");
        let mut it = items.into_iter();
        let mut num_items = it.len();
        if num_items == 0 {
            return;
        }

        let num_leaves = num_items.div_ceil(LEAF_SLOTS);
        let mut leaves = Vec::with_capacity(num_leaves);
        for i in 0..num_leaves {
            let take = num_items / (num_leaves - i);
            let id = self.store.alloc_leaf();
            {
                let leaf = self.store.leaf_mut(id);
                for _ in 0..take {
                    let (k, v) = it.next().expect("bulk_load iterator shorter than its length");
                    debug_assert!(
                        leaf.slots.last().map_or(true, |(prev, _)| *prev <= k),
                        "bulk_load input not sorted"
                    );
                    leaf.slots.push((k, v));
                }
            }
            if let Some(&prev) = leaves.last() {
                debug_assert!(*self.store.leaf(prev).last_key() <= self.store.leaf(id).slots[0].0);
                self.store.leaf_mut(prev).next = Some(id);
                self.store.leaf_mut(id).prev = Some(prev);
            }
            leaves.push(id);
            num_items -= take;
        }
        debug_assert!(it.next().is_none() && num_items == 0);

        self.head_leaf = Some(leaves[0]);
        self.tail_leaf = Some(*leaves.last().unwrap());

        if leaves.len() == 1 {
            self.root = Some(NodeId::Leaf(leaves[0]));
            return;
        }

        // build inner levels over the leaves until a single root remains
        let mut level: Vec<(NodeId, K)> = leaves
            .into_iter()
            .map(|id| (NodeId::Leaf(id), self.store.leaf(id).last_key().clone()))
            .collect();
        let mut height = 1u16;
        while level.len() > 1 {
            let mut num_children = level.len();
            let num_parents = num_children.div_ceil(INNER_SLOTS + 1);
            let mut parents = Vec::with_capacity(num_parents);
            let mut child_iter = level.into_iter();
            for i in 0..num_parents {
                let take = num_children / (num_parents - i);
                let id = self.store.alloc_inner(height);
                let mut size = 0usize;
                let mut max_key = None;
                {
                    let inner = self.store.inner_mut(id);
                    for j in 0..take {
                        let (child, key) = child_iter.next().unwrap();
                        if j + 1 < take {
                            inner.keys.push(key);
                        } else {
                            max_key = Some(key);
                        }
                        inner.children.push(child);
                    }
                }
                for &child in self.store.inner(id).children.clone().iter() {
                    size += self.store.entries(child);
                }
                self.store.inner_mut(id).subtree_size = size;
                parents.push((NodeId::Inner(id), max_key.unwrap()));
                num_children -= take;
            }
            debug_assert_eq!(num_children, 0);
            level = parents;
            height += 1;
        }

        self.root = Some(level[0].0);
    }

    // *** Verification

    /// Check every structural invariant; panics on the first violation.
    /// Used by tests after mutating operations.
    pub fn verify(&self) {
        match self.root {
            Some(root) => {
                let (_, _, entries) = self.verify_node(root);
                assert_eq!(entries, self.len(), "root entry count mismatch");
                self.verify_leaf_links();
            }
            None => {
                assert!(self.head_leaf.is_none() && self.tail_leaf.is_none());
                assert_eq!(self.len(), 0);
            }
        }
    }

    fn verify_node(&self, n: NodeId) -> (K, K, usize) {
        match n {
            NodeId::Leaf(id) => {
                let leaf = self.store.leaf(id);
                assert!(
                    self.root == Some(n) || !leaf.is_underflow(),
                    "leaf {id} underflow"
                );
                assert!(!leaf.slots.is_empty(), "empty leaf {id}");
                for w in leaf.slots.windows(2) {
                    assert!(w[0].0 <= w[1].0, "leaf keys out of order");
                }
                (
                    leaf.slots[0].0.clone(),
                    leaf.last_key().clone(),
                    leaf.slots.len(),
                )
            }
            NodeId::Inner(id) => {
                let inner = self.store.inner(id);
                assert!(
                    self.root == Some(n) || !inner.is_underflow(),
                    "inner {id} underflow"
                );
                assert!(!inner.keys.is_empty(), "inner {id} without separators");
                assert_eq!(inner.children.len(), inner.keys.len() + 1);
                for w in inner.keys.windows(2) {
                    assert!(w[0] <= w[1], "separators out of order");
                }

                let mut total = 0usize;
                let mut min_key = None;
                let mut max_key = None;
                for (slot, &child) in inner.children.iter().enumerate() {
                    assert_eq!(
                        self.store.level(child) + 1,
                        inner.level,
                        "child level mismatch"
                    );
                    let (sub_min, sub_max, sub_entries) = self.verify_node(child);
                    total += sub_entries;

                    if slot == 0 {
                        min_key = Some(sub_min);
                    } else {
                        assert!(
                            sub_min >= inner.keys[slot - 1],
                            "subtree min below separator"
                        );
                    }
                    if slot == inner.keys.len() {
                        max_key = Some(sub_max);
                    } else {
                        // last-key separators: the separator IS the subtree max
                        assert!(inner.keys[slot] == sub_max, "separator is not subtree max");
                    }

                    // adjacent children must be linked in the leaf list
                    if slot < inner.keys.len() {
                        let (leaf_a, leaf_b) = match (inner.children[slot], inner.children[slot + 1])
                        {
                            (NodeId::Leaf(a), NodeId::Leaf(b)) => (a, b),
                            (NodeId::Inner(a), NodeId::Inner(b)) => {
                                if inner.level != 2 {
                                    continue;
                                }
                                (
                                    self.store.inner(a).children.last().unwrap().leaf_id(),
                                    self.store.inner(b).children[0].leaf_id(),
                                )
                            }
                            _ => unreachable!(),
                        };
                        assert_eq!(self.store.leaf(leaf_a).next, Some(leaf_b), "leaf link broken");
                        assert_eq!(self.store.leaf(leaf_b).prev, Some(leaf_a), "leaf backlink broken");
                    }
                }
                assert_eq!(
                    inner.subtree_size, total,
                    "subtree size augmentation out of sync"
                );
                (min_key.unwrap(), max_key.unwrap(), total)
            }
        }
    }

    fn verify_leaf_links(&self) {
        let mut n = self.head_leaf;
        assert!(n.is_some());
        assert!(self.store.leaf(n.unwrap()).prev.is_none());
        let mut count = 0usize;
        let mut last: Option<u32> = None;
        while let Some(id) = n {
            let leaf = self.store.leaf(id);
            assert!(!leaf.slots.is_empty());
            for w in leaf.slots.windows(2) {
                assert!(w[0].0 <= w[1].0);
            }
            count += leaf.slots.len();
            if let Some(next) = leaf.next {
                assert!(*leaf.last_key() <= self.store.leaf(next).slots[0].0);
                assert_eq!(self.store.leaf(next).prev, Some(id));
            }
            last = Some(id);
            n = leaf.next;
        }
        assert_eq!(last, self.tail_leaf);
        assert_eq!(count, self.len());
    }
}

impl<K: Ord + Clone, V: PartialEq> PartialEq for RankTree<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl<K: Ord + Clone + std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for RankTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
