//! Split, join and bulk deletion.
//!
//! Split by key descends once: at every inner node the children strictly
//! left and strictly right of the search slot become partial trees, the
//! child on the slot is split recursively, and the bottom pieces are joined
//! onto the partial trees (`join_greater` on the left side, `join_less` on
//! the right). The larger half of a partitioned node is reused in place,
//! the smaller half gets a fresh node. Joins descend along the spine of the
//! taller tree until the heights match, then either merge the two meeting
//! nodes or rebalance between them and propagate a new link upward, exactly
//! like an insert split. Subtree sizes of partitioned nodes are recomputed
//! from their children rather than patched.
//!
//! All of that is pointer surgery within one node store, O(log n). Handing
//! a half out as an independently owned tree additionally moves the smaller
//! half's nodes into a fresh store; joining two owned trees grafts the
//! smaller operand's nodes over first.

use super::node::{NodeId, Store};
use super::RankTree;

/// A partial tree inside a shared store. For an empty piece produced by a
/// split, `head`/`tail` carry the leaf *neighboring* the cut; the join
/// machinery uses that to stitch the surrounding pieces' leaf links.
#[derive(Clone, Copy, Debug)]
struct SubTree {
    root: Option<NodeId>,
    head: Option<u32>,
    tail: Option<u32>,
}

impl SubTree {
    fn empty_at(neighbor: Option<u32>) -> Self {
        Self {
            root: None,
            head: neighbor,
            tail: neighbor,
        }
    }
}

/// How two meeting nodes were combined by a join.
enum JoinOutcome {
    /// Everything fits in the left node; the right node is now empty.
    Merged,
    /// Slots were redistributed; the right node continues as a new link.
    Rebalanced,
    /// Both nodes were full enough already; the right node becomes a link.
    Untouched,
}

impl<K: Ord + Clone, V> RankTree<K, V> {
    // *** Public surface

    /// Partition into `(keys <= key, keys > key)`. Consumes the tree; the
    /// in-store surgery is O(log n), plus moving the smaller half into its
    /// own store.
    pub fn split(mut self, key: &K) -> (Self, Self) {
        if self.is_empty() {
            return (Self::new(), Self::new());
        }
        let root = self.root.unwrap();
        let original_size = self.len();
        let (mut left, mut right) = self.split_recursive(root, key);

        if left.root.is_none() {
            debug_assert!(left.tail.is_none());
            left.head = None;
        } else {
            left.head = self.head_leaf;
            let tail = left.tail.expect("split left piece without tail");
            debug_assert_eq!(self.store.leaf(tail).next, right.head);
            self.store.leaf_mut(tail).next = None;
        }
        if right.root.is_none() {
            debug_assert!(right.head.is_none());
            right.tail = None;
        } else {
            right.tail = self.tail_leaf;
            let head = right.head.expect("split right piece without head");
            self.store.leaf_mut(head).prev = None;
        }

        let left_size = left.root.map_or(0, |r| self.store.entries(r));
        let right_size = right.root.map_or(0, |r| self.store.entries(r));
        debug_assert_eq!(left_size + right_size, original_size);

        self.root = None;
        self.head_leaf = None;
        self.tail_leaf = None;

        // the larger half keeps the store
        if left_size >= right_size {
            let extracted = self.extract(right);
            (self.into_tree(left), extracted)
        } else {
            let extracted = self.extract(left);
            (extracted, self.into_tree(right))
        }
    }

    /// Partition by rank: the left result holds exactly `min(k, len)`
    /// smallest entries. With duplicate keys at the boundary, the key split
    /// overshoots and surplus entries are moved back one at a time; that
    /// loop is linear in the number of boundary duplicates.
    pub fn split_at(self, k: usize) -> (Self, Self) {
        if k == 0 {
            return (Self::new(), self);
        }
        if k >= self.len() {
            return (self, Self::new());
        }
        let pivot = self.key_at_rank(k - 1).unwrap().clone();
        let (mut left, mut right) = self.split(&pivot);
        debug_assert!(left.len() >= k);
        while left.len() > k {
            let (key, value) = left.pop_last().unwrap();
            debug_assert!(right.first().map_or(true, |(rk, _)| *rk >= key));
            right.insert(key, value);
        }
        (left, right)
    }

    /// Remove and return the `k` smallest entries as their own tree.
    pub fn bulk_delete(&mut self, k: usize) -> Self {
        let tree = std::mem::take(self);
        let (smallest, rest) = tree.split_at(k);
        *self = rest;
        smallest
    }

    /// Append `other`, whose keys must all be `>=` this tree's maximum.
    pub fn join(&mut self, other: Self) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other;
            return;
        }
        assert!(
            self.last().unwrap().0 <= other.first().unwrap().0,
            "join precondition violated: left maximum exceeds right minimum"
        );
        if self.len() >= other.len() {
            let high = self.graft(other);
            self.join_back(high);
        } else {
            let mut keeper = other;
            let low = keeper.graft(std::mem::take(self));
            keeper.join_front(low);
            *self = keeper;
        }
    }

    // *** Store transfer

    fn into_tree(self, sub: SubTree) -> Self {
        Self {
            store: self.store,
            root: sub.root,
            head_leaf: sub.head,
            tail_leaf: sub.tail,
        }
    }

    /// Move a piece of this tree into its own store.
    fn extract(&mut self, sub: SubTree) -> Self {
        let mut out = Self::new();
        if let Some(root) = sub.root {
            let mut last_leaf = None;
            let mut head = None;
            let new_root = move_subtree(&mut self.store, root, &mut out.store, &mut last_leaf, &mut head);
            out.root = Some(new_root);
            out.head_leaf = head;
            out.tail_leaf = last_leaf;
        }
        out
    }

    /// Move another tree's nodes into this store; the grafted piece keeps
    /// its own leaf chain and is not yet linked to ours.
    fn graft(&mut self, mut other: Self) -> SubTree {
        let root = other.root.take().expect("graft of empty tree");
        let mut last_leaf = None;
        let mut head = None;
        let new_root = move_subtree(&mut other.store, root, &mut self.store, &mut last_leaf, &mut head);
        SubTree {
            root: Some(new_root),
            head,
            tail: last_leaf,
        }
    }

    /// Attach a higher-keyed piece (already in this store) on the right.
    fn join_back(&mut self, high: SubTree) {
        let tail = self.tail_leaf.unwrap();
        let head = high.head.unwrap();
        self.store.leaf_mut(tail).next = Some(head);
        self.store.leaf_mut(head).prev = Some(tail);

        let key = self.last().unwrap().0.clone();
        let mut a = SubTree {
            root: self.root,
            head: self.head_leaf,
            tail: self.tail_leaf,
        };
        if self.store.level(a.root.unwrap()) >= self.store.level(high.root.unwrap()) {
            self.join_greater(&mut a, Some(key), high);
        } else {
            let mut b = high;
            self.join_less(&mut b, Some(key), a);
            a = b;
        }
        self.root = a.root;
        self.head_leaf = a.head;
        self.tail_leaf = a.tail;
    }

    /// Attach a lower-keyed piece (already in this store) on the left.
    fn join_front(&mut self, low: SubTree) {
        let tail = low.tail.unwrap();
        let head = self.head_leaf.unwrap();
        self.store.leaf_mut(tail).next = Some(head);
        self.store.leaf_mut(head).prev = Some(tail);

        let key = self.store.leaf(tail).last_key().clone();
        let mut a = SubTree {
            root: self.root,
            head: self.head_leaf,
            tail: self.tail_leaf,
        };
        if self.store.level(a.root.unwrap()) >= self.store.level(low.root.unwrap()) {
            self.join_less(&mut a, Some(key), low);
        } else {
            let mut b = low;
            self.join_greater(&mut b, Some(key), a);
            a = b;
        }
        self.root = a.root;
        self.head_leaf = a.head;
        self.tail_leaf = a.tail;
    }

    // *** Split descent

    fn split_recursive(&mut self, n: NodeId, key: &K) -> (SubTree, SubTree) {
        match n {
            NodeId::Leaf(leaf_id) => {
                let slot = Self::leaf_upper(self.store.leaf(leaf_id), key);
                self.split_leaf_piece(leaf_id, slot)
            }
            NodeId::Inner(inner_id) => {
                let slot = Self::inner_upper(self.store.inner(inner_id), key);
                let child = self.store.inner(inner_id).children[slot];
                let (mut left, left_key, mut right, right_key) =
                    self.split_inner_piece(inner_id, slot);
                let (bottom_left, bottom_right) = self.split_recursive(child, key);
                self.join_greater(&mut left, left_key, bottom_left);
                self.join_less(&mut right, right_key, bottom_right);
                (left, right)
            }
        }
    }

    /// Partition an inner node into the pieces strictly left and strictly
    /// right of `slot`; the child at `slot` is handed to the recursion.
    /// Returns each piece with the separator that was its subtree maximum.
    fn split_inner_piece(
        &mut self,
        inner_id: u32,
        slot: usize,
    ) -> (SubTree, Option<K>, SubTree, Option<K>) {
        let level = self.store.inner(inner_id).level;
        let len = self.store.inner(inner_id).keys.len();

        let left_key = (slot > 0).then(|| self.store.inner(inner_id).keys[slot - 1].clone());
        let right_key = (slot < len).then(|| self.store.inner(inner_id).keys[slot].clone());

        // 2*slot >= len: the left piece is at least as large, reuse the node
        let reuse_left = 2 * slot >= len;

        let mut left = SubTree::empty_at(None);
        let mut right = SubTree::empty_at(None);

        let right_keys: Vec<K> = if slot < len {
            self.store.inner(inner_id).keys[slot + 1..].to_vec()
        } else {
            Vec::new()
        };
        let right_children: Vec<NodeId> = if slot < len {
            self.store.inner(inner_id).children[slot + 1..].to_vec()
        } else {
            Vec::new()
        };

        if slot > 0 {
            let left_root = if reuse_left {
                let inner = self.store.inner_mut(inner_id);
                inner.keys.truncate(slot - 1);
                inner.children.truncate(slot);
                inner_id
            } else {
                let id = self.store.alloc_inner(level);
                let keys: Vec<K> = self.store.inner(inner_id).keys[..slot - 1].to_vec();
                let children: Vec<NodeId> = self.store.inner(inner_id).children[..slot].to_vec();
                let node = self.store.inner_mut(id);
                node.keys.extend(keys);
                node.children.extend(children);
                id
            };
            let children: Vec<NodeId> = self.store.inner(left_root).children.to_vec();
            self.store.inner_mut(left_root).subtree_size = self.store.sum_entries(&children);
            left.root = Some(NodeId::Inner(left_root));
        }

        if slot < len {
            let right_root = if reuse_left {
                let id = self.store.alloc_inner(level);
                let node = self.store.inner_mut(id);
                node.keys.extend(right_keys);
                node.children.extend(right_children);
                id
            } else {
                let inner = self.store.inner_mut(inner_id);
                inner.keys.clear();
                inner.children.clear();
                inner.keys.extend(right_keys);
                inner.children.extend(right_children);
                inner_id
            };
            let children: Vec<NodeId> = self.store.inner(right_root).children.to_vec();
            self.store.inner_mut(right_root).subtree_size = self.store.sum_entries(&children);
            right.root = Some(NodeId::Inner(right_root));
        }

        // a piece left with zero separators collapses to its only child
        if let Some(NodeId::Inner(id)) = left.root {
            if self.store.inner(id).keys.is_empty() {
                left.root = Some(self.store.inner(id).children[0]);
                self.store.free_inner(id);
            }
        }
        if let Some(NodeId::Inner(id)) = right.root {
            if self.store.inner(id).keys.is_empty() {
                right.root = Some(self.store.inner(id).children[0]);
                self.store.free_inner(id);
            }
        }

        // the node must have gone to one of the pieces or been freed
        debug_assert!(slot > 0 || !reuse_left);

        (left, left_key, right, right_key)
    }

    /// Split a leaf at `slot`, fixing the leaf chain and the tree's
    /// head/tail. Empty pieces carry the neighboring leaf for later
    /// stitching.
    fn split_leaf_piece(&mut self, leaf_id: u32, slot: usize) -> (SubTree, SubTree) {
        let len = self.store.leaf(leaf_id).slots.len();
        let whole = SubTree {
            root: Some(NodeId::Leaf(leaf_id)),
            head: Some(leaf_id),
            tail: Some(leaf_id),
        };
        if slot == 0 {
            let prev = self.store.leaf(leaf_id).prev;
            return (SubTree::empty_at(prev), whole);
        }
        if slot == len {
            let next = self.store.leaf(leaf_id).next;
            return (whole, SubTree::empty_at(next));
        }

        let reuse_left = 2 * slot >= len;
        let (left_id, right_id) = if reuse_left {
            let id = self.store.alloc_leaf();
            let moved: Vec<(K, V)> = self.store.leaf_mut(leaf_id).slots.drain(slot..).collect();
            self.store.leaf_mut(id).slots.extend(moved);
            (leaf_id, id)
        } else {
            let id = self.store.alloc_leaf();
            let moved: Vec<(K, V)> = self.store.leaf_mut(leaf_id).slots.drain(..slot).collect();
            self.store.leaf_mut(id).slots.extend(moved);
            (id, leaf_id)
        };

        let old_prev = self.store.leaf(if reuse_left { left_id } else { right_id }).prev;
        let old_next = self.store.leaf(if reuse_left { left_id } else { right_id }).next;

        match old_next {
            Some(n) => self.store.leaf_mut(n).prev = Some(right_id),
            None => {
                debug_assert_eq!(self.tail_leaf, Some(if reuse_left { left_id } else { right_id }));
                self.tail_leaf = Some(right_id);
            }
        }
        match old_prev {
            Some(p) => self.store.leaf_mut(p).next = Some(left_id),
            None => {
                debug_assert_eq!(self.head_leaf, Some(if reuse_left { left_id } else { right_id }));
                self.head_leaf = Some(left_id);
            }
        }
        {
            let l = self.store.leaf_mut(left_id);
            l.prev = old_prev;
            l.next = Some(right_id);
        }
        {
            let r = self.store.leaf_mut(right_id);
            r.prev = Some(left_id);
            r.next = old_next;
        }

        (
            SubTree {
                root: Some(NodeId::Leaf(left_id)),
                head: Some(left_id),
                tail: Some(left_id),
            },
            SubTree {
                root: Some(NodeId::Leaf(right_id)),
                head: Some(right_id),
                tail: Some(right_id),
            },
        )
    }

    // *** Joins within one store

    /// Join `b` (all keys `>=` `key`, height not exceeding `a`'s) onto the
    /// right of `a`. `key` is `a`'s maximum; unused when either is empty.
    fn join_greater(&mut self, a: &mut SubTree, key: Option<K>, mut b: SubTree) {
        if a.root.is_none() {
            *a = b;
            return;
        }
        a.tail = b.tail;
        if b.root.is_none() {
            return;
        }
        let key = key.expect("join_greater without split key");
        debug_assert!(self.store.level(a.root.unwrap()) >= self.store.level(b.root.unwrap()));
        self.join_greater_start(a, key, &mut b);
    }

    /// Join `b` (all keys `<=` `key`, height not exceeding `a`'s) onto the
    /// left of `a`.
    fn join_less(&mut self, a: &mut SubTree, key: Option<K>, mut b: SubTree) {
        if a.root.is_none() {
            *a = b;
            return;
        }
        a.head = b.head;
        if b.root.is_none() {
            return;
        }
        let key = key.expect("join_less without split key");
        debug_assert!(self.store.level(a.root.unwrap()) >= self.store.level(b.root.unwrap()));
        self.join_less_start(a, key, &mut b);
    }

    fn join_greater_start(&mut self, a: &mut SubTree, key: K, b: &mut SubTree) {
        let a_root = a.root.unwrap();
        let b_root = b.root.unwrap();
        let mut prop = None;

        if self.store.level(a_root) > self.store.level(b_root) {
            prop = self.join_greater_descend(a_root, key, b);
        } else {
            match (a_root, b_root) {
                (NodeId::Leaf(l), NodeId::Leaf(r)) => {
                    debug_assert_eq!(self.store.leaf(l).next, Some(r));
                    let (outcome, new_key, new_child) = self.join_leaves(l, r, key);
                    match outcome {
                        JoinOutcome::Merged => {
                            b.tail = Some(l);
                            self.store.free_leaf(r);
                        }
                        _ => prop = Some((new_key, new_child.unwrap())),
                    }
                }
                (NodeId::Inner(l), NodeId::Inner(r)) => {
                    let (outcome, new_key, new_child) = self.join_inner(l, r, key);
                    match outcome {
                        JoinOutcome::Merged => self.store.free_inner(r),
                        _ => prop = Some((new_key, new_child.unwrap())),
                    }
                }
                _ => unreachable!("join of mismatched node kinds at equal level"),
            }
        }

        a.tail = b.tail;
        if let Some((new_key, new_child)) = prop {
            a.root = Some(self.new_root_over(a.root.unwrap(), new_key, new_child));
        }
    }

    fn join_less_start(&mut self, a: &mut SubTree, key: K, b: &mut SubTree) {
        let a_root = a.root.unwrap();
        let b_root = b.root.unwrap();
        let mut prop = None;

        if self.store.level(a_root) > self.store.level(b_root) {
            let (replacement, p) = self.join_less_descend(a_root, key, b);
            debug_assert!(replacement.is_none());
            prop = p;
        } else {
            match (a_root, b_root) {
                (NodeId::Leaf(r), NodeId::Leaf(l)) => {
                    debug_assert_eq!(self.store.leaf(l).next, Some(r));
                    let (outcome, new_key, new_child) = self.join_leaves(l, r, key);
                    a.root = Some(NodeId::Leaf(l));
                    match outcome {
                        JoinOutcome::Merged => {
                            a.tail = Some(l);
                            self.store.free_leaf(r);
                        }
                        _ => prop = Some((new_key, new_child.unwrap())),
                    }
                }
                (NodeId::Inner(r), NodeId::Inner(l)) => {
                    let (outcome, new_key, new_child) = self.join_inner(l, r, key);
                    a.root = Some(NodeId::Inner(l));
                    match outcome {
                        JoinOutcome::Merged => self.store.free_inner(r),
                        _ => prop = Some((new_key, new_child.unwrap())),
                    }
                }
                _ => unreachable!("join of mismatched node kinds at equal level"),
            }
        }

        a.head = b.head;
        if let Some((new_key, new_child)) = prop {
            a.root = Some(self.new_root_over(a.root.unwrap(), new_key, new_child));
        }
    }

    /// Descend `a`'s right spine until the heights match, join there, and
    /// insert any propagated link at the back of each spine node.
    fn join_greater_descend(&mut self, n: NodeId, key: K, b: &mut SubTree) -> Option<(K, NodeId)> {
        let b_root = b.root.unwrap();
        match n {
            NodeId::Inner(inner_id) => {
                if self.store.inner(inner_id).level > self.store.level(b_root) {
                    let b_entries = self.store.entries(b_root);
                    self.store.inner_mut(inner_id).subtree_size += b_entries;
                    let last_child = *self.store.inner(inner_id).children.last().unwrap();
                    let prop = self.join_greater_descend(last_child, key, b);

                    let mut my_prop = None;
                    if let Some((new_key, new_child)) = prop {
                        let mut target = inner_id;
                        if self.store.inner(inner_id).is_full() {
                            let add_slot = self.store.inner(inner_id).keys.len();
                            let (up_key, split_id) = self.split_inner_grow(inner_id, add_slot);
                            target = split_id;
                            let added = self.store.entries(new_child);
                            self.store.inner_mut(target).subtree_size += added;
                            my_prop = Some((up_key, NodeId::Inner(split_id)));
                        }
                        let t = self.store.inner_mut(target);
                        t.keys.push(new_key);
                        t.children.push(new_child);
                    }
                    my_prop
                } else {
                    let (outcome, new_key, new_child) =
                        self.join_inner(inner_id, b_root.inner_id(), key);
                    match outcome {
                        JoinOutcome::Merged => {
                            self.store.free_inner(b_root.inner_id());
                            None
                        }
                        _ => Some((new_key, new_child.unwrap())),
                    }
                }
            }
            NodeId::Leaf(leaf_id) => {
                let b_leaf = b_root.leaf_id();
                debug_assert_eq!(self.store.leaf(leaf_id).next, Some(b_leaf));
                let (outcome, new_key, new_child) = self.join_leaves(leaf_id, b_leaf, key);
                match outcome {
                    JoinOutcome::Merged => {
                        b.tail = Some(leaf_id);
                        self.store.free_leaf(b_leaf);
                        None
                    }
                    _ => Some((new_key, new_child.unwrap())),
                }
            }
        }
    }

    /// Descend `a`'s left spine; the joined-in piece may replace the
    /// descended child, and propagated links are inserted at the front.
    fn join_less_descend(
        &mut self,
        n: NodeId,
        key: K,
        b: &mut SubTree,
    ) -> (Option<NodeId>, Option<(K, NodeId)>) {
        let b_root = b.root.unwrap();
        match n {
            NodeId::Inner(inner_id) => {
                if self.store.inner(inner_id).level > self.store.level(b_root) {
                    let b_entries = self.store.entries(b_root);
                    self.store.inner_mut(inner_id).subtree_size += b_entries;
                    let first_child = self.store.inner(inner_id).children[0];
                    let (replacement, prop) = self.join_less_descend(first_child, key, b);
                    if let Some(r) = replacement {
                        self.store.inner_mut(inner_id).children[0] = r;
                    }

                    let mut my_prop = None;
                    if let Some((new_key, new_child)) = prop {
                        if self.store.inner(inner_id).is_full() {
                            let (up_key, split_id) = self.split_inner_grow(inner_id, 0);
                            let added = self.store.entries(new_child);
                            // the front slot stays in the left half
                            self.store.inner_mut(inner_id).subtree_size += added;
                            my_prop = Some((up_key, NodeId::Inner(split_id)));
                        }
                        let t = self.store.inner_mut(inner_id);
                        t.keys.insert(0, new_key);
                        t.children.insert(1, new_child);
                    }
                    (None, my_prop)
                } else {
                    let (outcome, new_key, new_child) =
                        self.join_inner(b_root.inner_id(), inner_id, key);
                    match outcome {
                        JoinOutcome::Merged => {
                            self.store.free_inner(inner_id);
                            (Some(b_root), None)
                        }
                        _ => {
                            debug_assert_eq!(new_child, Some(NodeId::Inner(inner_id)));
                            (Some(b_root), Some((new_key, NodeId::Inner(inner_id))))
                        }
                    }
                }
            }
            NodeId::Leaf(leaf_id) => {
                let b_leaf = b_root.leaf_id();
                debug_assert_eq!(self.store.leaf(b_leaf).next, Some(leaf_id));
                let (outcome, new_key, new_child) = self.join_leaves(b_leaf, leaf_id, key);
                match outcome {
                    JoinOutcome::Merged => {
                        self.store.free_leaf(leaf_id);
                        (Some(NodeId::Leaf(b_leaf)), None)
                    }
                    _ => (Some(NodeId::Leaf(b_leaf)), Some((new_key, new_child.unwrap()))),
                }
            }
        }
    }

    /// Merge or rebalance two adjacent leaves whose contents are ordered
    /// `left <= right`; either may be underflowing. Returns the new
    /// separator for the left node and the surviving right link.
    fn join_leaves(&mut self, left: u32, right: u32, key: K) -> (JoinOutcome, K, Option<NodeId>) {
        use super::node::{LEAF_MIN, LEAF_SLOTS};

        let (l_len, r_len) = (
            self.store.leaf(left).slots.len(),
            self.store.leaf(right).slots.len(),
        );
        debug_assert_eq!(self.store.leaf(left).next, Some(right));
        debug_assert_eq!(self.store.leaf(right).prev, Some(left));

        if l_len + r_len <= LEAF_SLOTS {
            // everything fits into the left leaf; unlink the right one
            let (l, r) = self.store.two_leaves_mut(left, right);
            l.slots.extend(r.slots.drain(..));
            let new_next = r.next;
            l.next = new_next;
            match new_next {
                Some(n) => self.store.leaf_mut(n).prev = Some(left),
                None => self.tail_leaf = Some(left),
            }
            (JoinOutcome::Merged, key, None)
        } else if l_len < LEAF_MIN {
            let take = LEAF_MIN - l_len;
            let (l, r) = self.store.two_leaves_mut(left, right);
            l.slots.extend(r.slots.drain(..take));
            let new_key = l.last_key().clone();
            (JoinOutcome::Rebalanced, new_key, Some(NodeId::Leaf(right)))
        } else if r_len < LEAF_MIN {
            let give = LEAF_MIN - r_len;
            let (l, r) = self.store.two_leaves_mut(left, right);
            let cut = l.slots.len() - give;
            let moved: Vec<(K, V)> = l.slots.drain(cut..).collect();
            for (i, kv) in moved.into_iter().enumerate() {
                r.slots.insert(i, kv);
            }
            let new_key = l.last_key().clone();
            (JoinOutcome::Rebalanced, new_key, Some(NodeId::Leaf(right)))
        } else {
            (JoinOutcome::Untouched, key, Some(NodeId::Leaf(right)))
        }
    }

    /// Merge or rebalance two same-level inner nodes ordered
    /// `left <= right`, with `key` as the separator between them.
    fn join_inner(&mut self, left: u32, right: u32, key: K) -> (JoinOutcome, K, Option<NodeId>) {
        use super::node::{INNER_MIN, INNER_SLOTS};

        debug_assert_eq!(self.store.inner(left).level, self.store.inner(right).level);
        let (l_len, r_len) = (
            self.store.inner(left).keys.len(),
            self.store.inner(right).keys.len(),
        );

        if l_len + r_len + 1 <= INNER_SLOTS {
            let (l, r) = self.store.two_inners_mut(left, right);
            l.keys.push(key);
            l.keys.extend(r.keys.drain(..));
            l.children.extend(r.children.drain(..));
            l.subtree_size += r.subtree_size;
            r.subtree_size = 0;
            (JoinOutcome::Merged, l.keys[l_len].clone(), None)
        } else if l_len < INNER_MIN {
            // pull children from the right node through the separator
            let take = INNER_MIN - l_len;
            let moved_children: Vec<NodeId> = self.store.inner(right).children[..take].to_vec();
            let moved_entries = self.store.sum_entries(&moved_children);
            let new_key;
            {
                let (l, r) = self.store.two_inners_mut(left, right);
                l.keys.push(key);
                l.keys.extend(r.keys.drain(..take - 1));
                new_key = r.keys.remove(0);
                l.children.extend(r.children.drain(..take));
                l.subtree_size += moved_entries;
                r.subtree_size -= moved_entries;
            }
            (JoinOutcome::Rebalanced, new_key, Some(NodeId::Inner(right)))
        } else if r_len < INNER_MIN {
            let give = INNER_MIN - r_len;
            let cut = self.store.inner(left).children.len() - give;
            let moved_children: Vec<NodeId> = self.store.inner(left).children[cut..].to_vec();
            let moved_entries = self.store.sum_entries(&moved_children);
            let new_key;
            {
                let (l, r) = self.store.two_inners_mut(left, right);
                let keys_cut = l.keys.len() - (give - 1);
                let mut front_keys: Vec<K> = l.keys.drain(keys_cut..).collect();
                front_keys.push(key);
                new_key = l.keys.pop().unwrap();
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
            (JoinOutcome::Rebalanced, new_key, Some(NodeId::Inner(right)))
        } else {
            (JoinOutcome::Untouched, key, Some(NodeId::Inner(right)))
        }
    }

    /// Put a fresh root over two same-level siblings.
    fn new_root_over(&mut self, left: NodeId, key: K, right: NodeId) -> NodeId {
        debug_assert_eq!(self.store.level(left), self.store.level(right));
        let level = self.store.level(left) + 1;
        let size = self.store.entries(left) + self.store.entries(right);
        let id = self.store.alloc_inner(level);
        let inner = self.store.inner_mut(id);
        inner.keys.push(key);
        inner.children.push(left);
        inner.children.push(right);
        inner.subtree_size = size;
        NodeId::Inner(id)
    }
}

/// Move the subtree under `n` from `src` into `dst`, rebuilding the leaf
/// chain in order. Returns the new root id; `last_leaf`/`head` accumulate
/// the chain across calls.
fn move_subtree<K, V>(
    src: &mut Store<K, V>,
    n: NodeId,
    dst: &mut Store<K, V>,
    last_leaf: &mut Option<u32>,
    head: &mut Option<u32>,
) -> NodeId {
    match n {
        NodeId::Leaf(id) => {
            let mut node = src.take_leaf(id);
            node.prev = *last_leaf;
            node.next = None;
            let new_id = dst.adopt_leaf(node);
            if let Some(prev) = *last_leaf {
                dst.leaf_mut(prev).next = Some(new_id);
            }
            if head.is_none() {
                *head = Some(new_id);
            }
            *last_leaf = Some(new_id);
            NodeId::Leaf(new_id)
        }
        NodeId::Inner(id) => {
            let mut node = src.take_inner(id);
            for child in node.children.iter_mut() {
                *child = move_subtree(src, *child, dst, last_leaf, head);
            }
            NodeId::Inner(dst.adopt_inner(node))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::RankTree;

    fn tree_of(keys: &[u64]) -> RankTree<u64, u64> {
        let mut t = RankTree::new();
        for &k in keys {
            t.insert(k, k);
        }
        t
    }

    #[test]
    fn split_and_rejoin_round_trip() {
        let keys: Vec<u64> = (0..300).map(|i| (i * 37) % 1000).collect();
        for pivot in [0u64, 1, 250, 500, 999, 1500] {
            let tree = tree_of(&keys);
            let (left, right) = tree.split(&pivot);
            left.verify();
            right.verify();
            assert!(left.keys().all(|&k| k <= pivot));
            assert!(right.keys().all(|&k| k > pivot));
            assert_eq!(left.len() + right.len(), keys.len());

            let mut rejoined = left;
            rejoined.join(right);
            rejoined.verify();
            assert_eq!(rejoined.len(), keys.len());
            let mut sorted = keys.clone();
            sorted.sort();
            assert!(rejoined.keys().copied().eq(sorted));
        }
    }

    #[test]
    fn split_at_exact_sizes() {
        for n in [1usize, 5, 16, 17, 100, 513] {
            let keys: Vec<u64> = (0..n as u64).rev().collect();
            for k in [0usize, 1, n / 2, n.saturating_sub(1), n, n + 10] {
                let tree = tree_of(&keys);
                let (left, right) = tree.split_at(k);
                left.verify();
                right.verify();
                assert_eq!(left.len(), k.min(n));
                assert_eq!(right.len(), n - k.min(n));
                if let (Some((lmax, _)), Some((rmin, _))) = (left.last(), right.first()) {
                    assert!(lmax <= rmin);
                }
            }
        }
    }

    #[test]
    fn split_at_with_duplicate_pile() {
        let mut keys = vec![1u64];
        keys.extend(std::iter::repeat(2u64).take(40));
        keys.extend([3, 4]);
        for k in 0..keys.len() {
            let tree = tree_of(&keys);
            let (left, right) = tree.split_at(k);
            assert_eq!(left.len(), k);
            assert_eq!(right.len(), keys.len() - k);
            left.verify();
            right.verify();
        }
    }

    #[test]
    fn bulk_delete_keeps_the_rest() {
        let keys: Vec<u64> = (0..200).collect();
        let mut tree = tree_of(&keys);
        let smallest = tree.bulk_delete(50);
        smallest.verify();
        tree.verify();
        assert_eq!(smallest.len(), 50);
        assert_eq!(tree.len(), 150);
        assert!(smallest.keys().copied().eq(0..50));
        assert!(tree.keys().copied().eq(50..200));
    }

    #[test]
    fn join_empty_cases() {
        let mut a: RankTree<u64, u64> = RankTree::new();
        a.join(RankTree::new());
        assert!(a.is_empty());

        let mut a = tree_of(&[1, 2, 3]);
        a.join(RankTree::new());
        assert_eq!(a.len(), 3);

        let mut a: RankTree<u64, u64> = RankTree::new();
        a.join(tree_of(&[1, 2, 3]));
        assert_eq!(a.len(), 3);
        a.verify();
    }

    #[test]
    fn join_unbalanced_heights() {
        let mut big = tree_of(&(0..2000).collect::<Vec<u64>>());
        let small = tree_of(&[2000, 2001]);
        big.join(small);
        big.verify();
        assert_eq!(big.len(), 2002);

        let small = tree_of(&[0, 1]);
        let mut big = tree_of(&(2..2000).collect::<Vec<u64>>());
        let mut joined = small;
        joined.join(big.bulk_delete(big.len()));
        joined.verify();
        assert_eq!(joined.len(), 2000);
        assert!(joined.keys().copied().eq(0..2000));
    }

    #[test]
    #[should_panic(expected = "join precondition")]
    fn join_rejects_overlap() {
        let mut a = tree_of(&[1, 5, 9]);
        let b = tree_of(&[4, 6]);
        a.join(b);
    }
}
