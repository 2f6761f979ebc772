/*
 * Intrusive red-black tree.
 *
 * Nodes carry an explicit parent pointer and a separate color field (no
 * pointer tagging), are embedded in their owners, and are compared through
 * the comparator stored in the root. Comparators are expected to be total
 * over distinct nodes (the thread-tree breaks key ties by node address), so
 * Ordering::Equal only ever identifies the probe's exact match.
 *
 * The round-up / round-down finders take their own comparator: lookups for
 * "first node with key k" probe with a stack dummy that must compare below
 * every real node of equal key, which is a different tie-break than the
 * insertion order.
 */

use core::cmp::Ordering;
use core::ptr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Black,
}

#[repr(C)]
#[derive(Debug)]
pub struct RbNode {
    parent: *mut RbNode,
    left: *mut RbNode,
    right: *mut RbNode,
    color: Color,
}

impl RbNode {
    pub const fn new() -> Self {
        RbNode {
            parent: ptr::null_mut(),
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            color: Color::Red,
        }
    }
}

/// Total order over tree nodes. `cmp(a, b)` compares the entries owning
/// `a` and `b`.
pub type CmpFn = unsafe fn(*const RbNode, *const RbNode) -> Ordering;

pub struct RbRoot {
    pub node: *mut RbNode,
    cmp: CmpFn,
}

impl RbRoot {
    pub const fn new(cmp: CmpFn) -> Self {
        RbRoot {
            node: ptr::null_mut(),
            cmp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node.is_null()
    }
}

/// Reset a node to the unlinked state.
///
/// # Safety
/// `node` must point to a pinned, writable RbNode not currently linked.
pub unsafe fn node_init(node: *mut RbNode) {
    (*node).parent = ptr::null_mut();
    (*node).left = ptr::null_mut();
    (*node).right = ptr::null_mut();
    (*node).color = Color::Red;
}

#[inline]
unsafe fn is_black(node: *const RbNode) -> bool {
    node.is_null() || (*node).color == Color::Black
}

#[inline]
unsafe fn is_red(node: *const RbNode) -> bool {
    !node.is_null() && (*node).color == Color::Red
}

unsafe fn rotate_left(root: &mut RbRoot, x: *mut RbNode) {
    let y = (*x).right;
    (*x).right = (*y).left;
    if !(*y).left.is_null() {
        (*(*y).left).parent = x;
    }
    (*y).parent = (*x).parent;
    if (*x).parent.is_null() {
        root.node = y;
    } else if x == (*(*x).parent).left {
        (*(*x).parent).left = y;
    } else {
        (*(*x).parent).right = y;
    }
    (*y).left = x;
    (*x).parent = y;
}

unsafe fn rotate_right(root: &mut RbRoot, x: *mut RbNode) {
    let y = (*x).left;
    (*x).left = (*y).right;
    if !(*y).right.is_null() {
        (*(*y).right).parent = x;
    }
    (*y).parent = (*x).parent;
    if (*x).parent.is_null() {
        root.node = y;
    } else if x == (*(*x).parent).right {
        (*(*x).parent).right = y;
    } else {
        (*(*x).parent).left = y;
    }
    (*y).right = x;
    (*x).parent = y;
}

/// Insert `node` and rebalance. Equal comparisons descend right, so a
/// comparator without a tie-break yields FIFO order among equals.
///
/// # Safety
/// `node` must be initialized, pinned, and not linked into any tree.
pub unsafe fn insert(root: &mut RbRoot, node: *mut RbNode) {
    node_init(node);

    // Plain BST descent.
    let mut parent: *mut RbNode = ptr::null_mut();
    let mut link: *mut *mut RbNode = &mut root.node;
    while !(*link).is_null() {
        parent = *link;
        link = match (root.cmp)(node, parent) {
            Ordering::Less => &mut (*parent).left,
            _ => &mut (*parent).right,
        };
    }
    (*node).parent = parent;
    *link = node;

    // Fixup: re-establish "no red parent with red child".
    let mut z = node;
    while is_red((*z).parent) {
        let p = (*z).parent;
        let g = (*p).parent;
        if p == (*g).left {
            let uncle = (*g).right;
            if is_red(uncle) {
                (*p).color = Color::Black;
                (*uncle).color = Color::Black;
                (*g).color = Color::Red;
                z = g;
            } else {
                if z == (*p).right {
                    z = p;
                    rotate_left(root, z);
                }
                let p = (*z).parent;
                let g = (*p).parent;
                (*p).color = Color::Black;
                (*g).color = Color::Red;
                rotate_right(root, g);
            }
        } else {
            let uncle = (*g).left;
            if is_red(uncle) {
                (*p).color = Color::Black;
                (*uncle).color = Color::Black;
                (*g).color = Color::Red;
                z = g;
            } else {
                if z == (*p).left {
                    z = p;
                    rotate_right(root, z);
                }
                let p = (*z).parent;
                let g = (*p).parent;
                (*p).color = Color::Black;
                (*g).color = Color::Red;
                rotate_left(root, g);
            }
        }
    }
    (*root.node).color = Color::Black;
}

/// Replace subtree rooted at `u` with the one rooted at `v` (v may be null).
unsafe fn transplant(root: &mut RbRoot, u: *mut RbNode, v: *mut RbNode) {
    if (*u).parent.is_null() {
        root.node = v;
    } else if u == (*(*u).parent).left {
        (*(*u).parent).left = v;
    } else {
        (*(*u).parent).right = v;
    }
    if !v.is_null() {
        (*v).parent = (*u).parent;
    }
}

unsafe fn subtree_min(mut node: *mut RbNode) -> *mut RbNode {
    while !(*node).left.is_null() {
        node = (*node).left;
    }
    node
}

unsafe fn subtree_max(mut node: *mut RbNode) -> *mut RbNode {
    while !(*node).right.is_null() {
        node = (*node).right;
    }
    node
}

/// Remove `z` from the tree and rebalance.
///
/// # Safety
/// `z` must currently be linked into `root`.
pub unsafe fn delete(root: &mut RbRoot, z: *mut RbNode) {
    let mut removed_color = (*z).color;
    let x: *mut RbNode;
    let mut x_parent: *mut RbNode;

    if (*z).left.is_null() {
        x = (*z).right;
        x_parent = (*z).parent;
        transplant(root, z, (*z).right);
    } else if (*z).right.is_null() {
        x = (*z).left;
        x_parent = (*z).parent;
        transplant(root, z, (*z).left);
    } else {
        let y = subtree_min((*z).right);
        removed_color = (*y).color;
        x = (*y).right;
        if (*y).parent == z {
            x_parent = y;
        } else {
            x_parent = (*y).parent;
            transplant(root, y, (*y).right);
            (*y).right = (*z).right;
            (*(*y).right).parent = y;
        }
        transplant(root, z, y);
        (*y).left = (*z).left;
        (*(*y).left).parent = y;
        (*y).color = (*z).color;
    }

    if removed_color == Color::Black {
        delete_fixup(root, x, x_parent);
    }
    node_init(z);
}

unsafe fn delete_fixup(root: &mut RbRoot, mut x: *mut RbNode, mut x_parent: *mut RbNode) {
    while x != root.node && is_black(x) {
        if x_parent.is_null() {
            break;
        }
        if x == (*x_parent).left {
            let mut w = (*x_parent).right;
            if is_red(w) {
                (*w).color = Color::Black;
                (*x_parent).color = Color::Red;
                rotate_left(root, x_parent);
                w = (*x_parent).right;
            }
            if is_black((*w).left) && is_black((*w).right) {
                (*w).color = Color::Red;
                x = x_parent;
                x_parent = (*x).parent;
            } else {
                if is_black((*w).right) {
                    if !(*w).left.is_null() {
                        (*(*w).left).color = Color::Black;
                    }
                    (*w).color = Color::Red;
                    rotate_right(root, w);
                    w = (*x_parent).right;
                }
                (*w).color = (*x_parent).color;
                (*x_parent).color = Color::Black;
                if !(*w).right.is_null() {
                    (*(*w).right).color = Color::Black;
                }
                rotate_left(root, x_parent);
                x = root.node;
                x_parent = ptr::null_mut();
            }
        } else {
            let mut w = (*x_parent).left;
            if is_red(w) {
                (*w).color = Color::Black;
                (*x_parent).color = Color::Red;
                rotate_right(root, x_parent);
                w = (*x_parent).left;
            }
            if is_black((*w).left) && is_black((*w).right) {
                (*w).color = Color::Red;
                x = x_parent;
                x_parent = (*x).parent;
            } else {
                if is_black((*w).left) {
                    if !(*w).right.is_null() {
                        (*(*w).right).color = Color::Black;
                    }
                    (*w).color = Color::Red;
                    rotate_left(root, w);
                    w = (*x_parent).left;
                }
                (*w).color = (*x_parent).color;
                (*x_parent).color = Color::Black;
                if !(*w).left.is_null() {
                    (*(*w).left).color = Color::Black;
                }
                rotate_right(root, x_parent);
                x = root.node;
                x_parent = ptr::null_mut();
            }
        }
    }
    if !x.is_null() {
        (*x).color = Color::Black;
    }
}

/// Smallest node in order, or null when empty.
///
/// # Safety
/// `root` must be a consistent tree.
pub unsafe fn first(root: &RbRoot) -> *mut RbNode {
    if root.node.is_null() {
        ptr::null_mut()
    } else {
        subtree_min(root.node)
    }
}

/// Largest node in order, or null when empty.
///
/// # Safety
/// `root` must be a consistent tree.
pub unsafe fn last(root: &RbRoot) -> *mut RbNode {
    if root.node.is_null() {
        ptr::null_mut()
    } else {
        subtree_max(root.node)
    }
}

/// In-order successor, or null.
///
/// # Safety
/// `node` must be linked into a consistent tree.
pub unsafe fn next(node: *mut RbNode) -> *mut RbNode {
    if !(*node).right.is_null() {
        return subtree_min((*node).right);
    }
    let mut cur = node;
    let mut parent = (*cur).parent;
    while !parent.is_null() && cur == (*parent).right {
        cur = parent;
        parent = (*cur).parent;
    }
    parent
}

/// In-order predecessor, or null.
///
/// # Safety
/// `node` must be linked into a consistent tree.
pub unsafe fn prev(node: *mut RbNode) -> *mut RbNode {
    if !(*node).left.is_null() {
        return subtree_max((*node).left);
    }
    let mut cur = node;
    let mut parent = (*cur).parent;
    while !parent.is_null() && cur == (*parent).left {
        cur = parent;
        parent = (*cur).parent;
    }
    parent
}

/// Exact-match lookup with the root's comparator.
///
/// # Safety
/// `probe` must be comparable against linked nodes.
pub unsafe fn find(root: &RbRoot, probe: *const RbNode) -> *mut RbNode {
    let mut cur = root.node;
    while !cur.is_null() {
        cur = match (root.cmp)(probe as *mut RbNode, cur) {
            Ordering::Less => (*cur).left,
            Ordering::Greater => (*cur).right,
            Ordering::Equal => return cur,
        };
    }
    ptr::null_mut()
}

/// Smallest node that compares >= `probe` under `cmp`, or null.
///
/// # Safety
/// `probe` must be comparable against linked nodes under `cmp`.
pub unsafe fn find_round_up(root: &RbRoot, probe: *const RbNode, cmp: CmpFn) -> *mut RbNode {
    let mut best = ptr::null_mut();
    let mut cur = root.node;
    while !cur.is_null() {
        match cmp(probe, cur) {
            Ordering::Less => {
                best = cur;
                cur = (*cur).left;
            }
            Ordering::Equal => return cur,
            Ordering::Greater => cur = (*cur).right,
        }
    }
    best
}

/// Largest node that compares <= `probe` under `cmp`, or null.
///
/// # Safety
/// `probe` must be comparable against linked nodes under `cmp`.
pub unsafe fn find_round_down(root: &RbRoot, probe: *const RbNode, cmp: CmpFn) -> *mut RbNode {
    let mut best = ptr::null_mut();
    let mut cur = root.node;
    while !cur.is_null() {
        match cmp(probe, cur) {
            Ordering::Greater => {
                best = cur;
                cur = (*cur).right;
            }
            Ordering::Equal => return cur,
            Ordering::Less => cur = (*cur).left,
        }
    }
    best
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::boxed::Box;
    use std::vec::Vec;

    struct Item {
        node: RbNode,
        key: u64,
    }

    unsafe fn item_cmp(a: *const RbNode, b: *const RbNode) -> Ordering {
        let ka = (*container_of!(a as *mut RbNode, Item, node)).key;
        let kb = (*container_of!(b as *mut RbNode, Item, node)).key;
        match ka.cmp(&kb) {
            Ordering::Equal => (a as usize).cmp(&(b as usize)),
            other => other,
        }
    }

    /// Round-up comparator treating the probe as below any equal-key node.
    unsafe fn probe_cmp(a: *const RbNode, b: *const RbNode) -> Ordering {
        let ka = (*container_of!(a as *mut RbNode, Item, node)).key;
        let kb = (*container_of!(b as *mut RbNode, Item, node)).key;
        match ka.cmp(&kb) {
            Ordering::Equal => Ordering::Less,
            other => other,
        }
    }

    /// Recursively verify BST order, red-red absence, and a uniform black
    /// height. Returns the black height of the subtree.
    unsafe fn check(node: *const RbNode) -> usize {
        if node.is_null() {
            return 1;
        }
        if is_red(node) {
            assert!(is_black((*node).left), "red-red violation");
            assert!(is_black((*node).right), "red-red violation");
        }
        if !(*node).left.is_null() {
            assert_eq!((*(*node).left).parent, node as *mut RbNode);
            assert_eq!(item_cmp((*node).left, node), Ordering::Less);
        }
        if !(*node).right.is_null() {
            assert_eq!((*(*node).right).parent, node as *mut RbNode);
            assert_eq!(item_cmp(node, (*node).right), Ordering::Less);
        }
        let lh = check((*node).left);
        let rh = check((*node).right);
        assert_eq!(lh, rh, "black height mismatch");
        lh + if is_black(node) { 1 } else { 0 }
    }

    unsafe fn validate(root: &RbRoot) {
        if !root.node.is_null() {
            assert!(is_black(root.node), "root must be black");
            assert!((*root.node).parent.is_null());
        }
        check(root.node);
    }

    fn keys_in_order(root: &RbRoot) -> Vec<u64> {
        let mut out = Vec::new();
        unsafe {
            let mut cur = first(root);
            while !cur.is_null() {
                out.push((*container_of!(cur, Item, node)).key);
                cur = next(cur);
            }
        }
        out
    }

    #[test]
    fn insert_delete_pseudorandom() {
        let mut root = RbRoot::new(item_cmp);
        let mut items: Vec<Box<Item>> = Vec::new();

        // Deterministic pseudo-random key sequence (LCG).
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..200 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let key = seed >> 33;
            let mut it = Box::new(Item {
                node: RbNode::new(),
                key,
            });
            unsafe {
                insert(&mut root, &mut it.node);
                validate(&root);
            }
            items.push(it);
        }

        let ordered = keys_in_order(&root);
        let mut sorted = ordered.clone();
        sorted.sort_unstable();
        assert_eq!(ordered, sorted);

        // Delete in insertion order, revalidating each time.
        for it in items.iter_mut() {
            unsafe {
                delete(&mut root, &mut it.node);
                validate(&root);
            }
        }
        assert!(root.is_empty());
    }

    #[test]
    fn duplicate_keys_tiebreak_by_address() {
        let mut root = RbRoot::new(item_cmp);
        let mut items: Vec<Box<Item>> = (0..16)
            .map(|i| {
                Box::new(Item {
                    node: RbNode::new(),
                    key: (i % 4) as u64,
                })
            })
            .collect();
        for it in items.iter_mut() {
            unsafe {
                insert(&mut root, &mut it.node);
                validate(&root);
            }
        }
        assert_eq!(keys_in_order(&root), {
            let mut v = keys_in_order(&root);
            v.sort_unstable();
            v
        });

        // Round-up with the probe comparator lands on the lowest-address
        // node of the requested key.
        let probe = Item {
            node: RbNode::new(),
            key: 2,
        };
        unsafe {
            let hit = find_round_up(&root, &probe.node, probe_cmp);
            assert!(!hit.is_null());
            assert_eq!((*container_of!(hit, Item, node)).key, 2);
            let pred = prev(hit);
            // Everything before the hit is strictly below key 2.
            assert!( (*container_of!(pred, Item, node)).key < 2 );
        }
    }

    #[test]
    fn round_up_and_down() {
        let mut root = RbRoot::new(item_cmp);
        let mut items: Vec<Box<Item>> = [10u64, 20, 30, 40]
            .iter()
            .map(|&key| {
                Box::new(Item {
                    node: RbNode::new(),
                    key,
                })
            })
            .collect();
        for it in items.iter_mut() {
            unsafe { insert(&mut root, &mut it.node) };
        }

        let probe = |key: u64| Item {
            node: RbNode::new(),
            key,
        };
        unsafe {
            let p = probe(25);
            let up = find_round_up(&root, &p.node, probe_cmp);
            assert_eq!((*container_of!(up, Item, node)).key, 30);
            let down = find_round_down(&root, &p.node, probe_cmp);
            assert_eq!((*container_of!(down, Item, node)).key, 20);

            let p = probe(45);
            assert!(find_round_up(&root, &p.node, probe_cmp).is_null());
            let p = probe(5);
            assert!(find_round_down(&root, &p.node, probe_cmp).is_null());
        }
    }
}
