//! Hole tree: the free-range allocator of a virtual address space
//!
//! Free ranges ("holes") are kept in an AVL tree ordered by address. Every
//! node caches the largest hole length of its subtree, so both bottom-up and
//! top-down first-fit searches skip subtrees that cannot satisfy a request
//! and finish in O(log n).
//!
//! Nodes live in an arena and refer to each other by index.

use alloc::vec::Vec;
use core::cmp::max;

use nos_vm_api::{Error, Result, VirtualAddr};

/// A free virtual range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hole {
    /// First free address
    pub address: VirtualAddr,
    /// Length in bytes
    pub length: usize,
}

impl Hole {
    /// Creates a hole
    pub const fn new(address: VirtualAddr, length: usize) -> Self {
        Self { address, length }
    }

    /// End of the hole (exclusive)
    pub const fn end(&self) -> VirtualAddr {
        self.address + self.length
    }
}

type Link = Option<usize>;

#[derive(Debug, Clone)]
struct Node {
    hole: Hole,
    largest: usize,
    height: u32,
    left: Link,
    right: Link,
}

/// Augmented AVL tree of holes
#[derive(Debug, Clone, Default)]
pub struct HoleTree {
    nodes: Vec<Node>,
    free: Vec<usize>,
    root: Link,
    count: usize,
}

impl HoleTree {
    /// Creates an empty tree
    pub const fn new() -> Self {
        Self { nodes: Vec::new(), free: Vec::new(), root: None, count: 0 }
    }

    /// Creates a tree holding a single hole
    pub fn with_hole(address: VirtualAddr, length: usize) -> Self {
        let mut tree = Self::new();
        tree.insert(Hole::new(address, length));
        tree
    }

    /// Number of holes
    pub fn len(&self) -> usize {
        self.count
    }

    /// Checks whether there are no holes at all
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Length of the largest hole
    pub fn largest(&self) -> usize {
        self.largest_of(self.root)
    }

    /// Holes in address order
    pub fn holes(&self) -> Vec<Hole> {
        let mut out = Vec::with_capacity(self.count);
        self.collect(self.root, &mut out);
        out
    }

    /// Total number of free bytes
    pub fn free_bytes(&self) -> usize {
        self.holes().iter().map(|h| h.length).sum()
    }

    /// Inserts a hole; the caller guarantees that it overlaps no other hole
    pub fn insert(&mut self, hole: Hole) {
        debug_assert!(hole.length > 0);
        let root = self.insert_at(self.root, hole);
        self.root = Some(root);
        self.count += 1;
    }

    /// Removes the hole starting at `address`
    pub fn remove(&mut self, address: VirtualAddr) -> Option<Hole> {
        let (root, removed) = self.remove_at(self.root, address);
        self.root = root;
        if removed.is_some() {
            self.count -= 1;
        }
        removed
    }

    /// Finds the hole that contains `address`
    pub fn find_containing(&self, address: VirtualAddr) -> Option<Hole> {
        let mut link = self.root;
        while let Some(i) = link {
            let hole = self.nodes[i].hole;
            if address < hole.address {
                link = self.nodes[i].left;
            } else if address < hole.end() {
                return Some(hole);
            } else {
                link = self.nodes[i].right;
            }
        }
        None
    }

    /// Hole with the highest address below `address`
    pub fn predecessor(&self, address: VirtualAddr) -> Option<Hole> {
        let mut link = self.root;
        let mut found = None;
        while let Some(i) = link {
            let hole = self.nodes[i].hole;
            if hole.address < address {
                found = Some(hole);
                link = self.nodes[i].right;
            } else {
                link = self.nodes[i].left;
            }
        }
        found
    }

    /// Hole with the lowest address above `address`
    pub fn successor(&self, address: VirtualAddr) -> Option<Hole> {
        let mut link = self.root;
        let mut found = None;
        while let Some(i) = link {
            let hole = self.nodes[i].hole;
            if hole.address > address {
                found = Some(hole);
                link = self.nodes[i].left;
            } else {
                link = self.nodes[i].right;
            }
        }
        found
    }

    /// Lowest-addressed hole of at least `length` bytes
    pub fn lowest_fit(&self, length: usize) -> Option<Hole> {
        self.lowest_fit_at(self.root, length)
    }

    /// Highest-addressed hole of at least `length` bytes
    pub fn highest_fit(&self, length: usize) -> Option<Hole> {
        self.highest_fit_at(self.root, length)
    }

    /// Carves `length` bytes from the bottom of the lowest fitting hole
    pub fn allocate_bottom(&mut self, length: usize) -> Result<VirtualAddr> {
        let hole = self.lowest_fit(length).ok_or(Error::NoMemory)?;
        self.remove(hole.address);
        if hole.length > length {
            self.insert(Hole::new(hole.address + length, hole.length - length));
        }
        Ok(hole.address)
    }

    /// Carves `length` bytes from the top of the highest fitting hole
    pub fn allocate_top(&mut self, length: usize) -> Result<VirtualAddr> {
        let hole = self.highest_fit(length).ok_or(Error::NoMemory)?;
        self.remove(hole.address);
        if hole.length > length {
            self.insert(Hole::new(hole.address, hole.length - length));
        }
        Ok(hole.end() - length)
    }

    /// Carves exactly `[address, address + length)`, splitting the enclosing hole
    pub fn allocate_fixed(&mut self, address: VirtualAddr, length: usize) -> Result<()> {
        let end = address.checked_add(length).ok_or(Error::IllegalArgs)?;
        let hole = self.find_containing(address).ok_or(Error::AddressInUse)?;
        if end > hole.end() {
            return Err(Error::AddressInUse);
        }
        self.remove(hole.address);
        if address > hole.address {
            self.insert(Hole::new(hole.address, address - hole.address));
        }
        if end < hole.end() {
            self.insert(Hole::new(end, hole.end() - end));
        }
        Ok(())
    }

    /// Returns a range to the tree, coalescing it with adjacent holes
    pub fn release(&mut self, address: VirtualAddr, length: usize) {
        let mut merged = Hole::new(address, length);
        if let Some(prev) = self.predecessor(address) {
            debug_assert!(prev.end() <= address);
            if prev.end() == address {
                self.remove(prev.address);
                merged = Hole::new(prev.address, prev.length + merged.length);
            }
        }
        if let Some(next) = self.successor(address) {
            debug_assert!(next.address >= address + length);
            if next.address == address + length {
                self.remove(next.address);
                merged.length += next.length;
            }
        }
        self.insert(merged);
    }

    /// Verifies ordering, disjointness, balance and the cached maxima
    pub fn check_invariants(&self) -> bool {
        let holes = self.holes();
        if holes.len() != self.count {
            return false;
        }
        if holes.windows(2).any(|w| w[0].end() > w[1].address) {
            return false;
        }
        self.check_node(self.root).is_some()
    }

    // ---------------------------------------------------------------------
    // Arena and AVL internals
    // ---------------------------------------------------------------------

    fn alloc_node(&mut self, hole: Hole) -> usize {
        let node = Node { hole, largest: hole.length, height: 1, left: None, right: None };
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn height(&self, link: Link) -> u32 {
        link.map_or(0, |i| self.nodes[i].height)
    }

    fn largest_of(&self, link: Link) -> usize {
        link.map_or(0, |i| self.nodes[i].largest)
    }

    fn update(&mut self, i: usize) {
        let (left, right) = (self.nodes[i].left, self.nodes[i].right);
        let height = 1 + max(self.height(left), self.height(right));
        let largest = max(self.nodes[i].hole.length, max(self.largest_of(left), self.largest_of(right)));
        let node = &mut self.nodes[i];
        node.height = height;
        node.largest = largest;
    }

    fn rotate_right(&mut self, i: usize) -> usize {
        let Some(l) = self.nodes[i].left else {
            return i;
        };
        self.nodes[i].left = self.nodes[l].right;
        self.nodes[l].right = Some(i);
        self.update(i);
        self.update(l);
        l
    }

    fn rotate_left(&mut self, i: usize) -> usize {
        let Some(r) = self.nodes[i].right else {
            return i;
        };
        self.nodes[i].right = self.nodes[r].left;
        self.nodes[r].left = Some(i);
        self.update(i);
        self.update(r);
        r
    }

    fn rebalance(&mut self, i: usize) -> usize {
        self.update(i);
        let (left, right) = (self.nodes[i].left, self.nodes[i].right);
        let (hl, hr) = (self.height(left), self.height(right));
        if hl > hr + 1 {
            if let Some(l) = left {
                if self.height(self.nodes[l].left) < self.height(self.nodes[l].right) {
                    self.nodes[i].left = Some(self.rotate_left(l));
                }
            }
            return self.rotate_right(i);
        }
        if hr > hl + 1 {
            if let Some(r) = right {
                if self.height(self.nodes[r].right) < self.height(self.nodes[r].left) {
                    self.nodes[i].right = Some(self.rotate_right(r));
                }
            }
            return self.rotate_left(i);
        }
        i
    }

    fn insert_at(&mut self, link: Link, hole: Hole) -> usize {
        let Some(i) = link else {
            return self.alloc_node(hole);
        };
        if hole.address < self.nodes[i].hole.address {
            let child = self.insert_at(self.nodes[i].left, hole);
            self.nodes[i].left = Some(child);
        } else {
            let child = self.insert_at(self.nodes[i].right, hole);
            self.nodes[i].right = Some(child);
        }
        self.rebalance(i)
    }

    fn remove_min(&mut self, i: usize) -> (Link, usize) {
        match self.nodes[i].left {
            None => (self.nodes[i].right, i),
            Some(l) => {
                let (rest, min) = self.remove_min(l);
                self.nodes[i].left = rest;
                (Some(self.rebalance(i)), min)
            }
        }
    }

    fn remove_at(&mut self, link: Link, address: VirtualAddr) -> (Link, Option<Hole>) {
        let Some(i) = link else {
            return (None, None);
        };
        let node_address = self.nodes[i].hole.address;
        if address < node_address {
            let (child, removed) = self.remove_at(self.nodes[i].left, address);
            self.nodes[i].left = child;
            return (Some(self.rebalance(i)), removed);
        }
        if address > node_address {
            let (child, removed) = self.remove_at(self.nodes[i].right, address);
            self.nodes[i].right = child;
            return (Some(self.rebalance(i)), removed);
        }

        let hole = self.nodes[i].hole;
        let (left, right) = (self.nodes[i].left, self.nodes[i].right);
        self.free.push(i);
        let replacement = match (left, right) {
            (None, other) | (other, None) => other,
            (Some(l), Some(r)) => {
                let (rest, min) = self.remove_min(r);
                self.nodes[min].left = Some(l);
                self.nodes[min].right = rest;
                Some(self.rebalance(min))
            }
        };
        (replacement, Some(hole))
    }

    fn lowest_fit_at(&self, link: Link, length: usize) -> Option<Hole> {
        let node = &self.nodes[link?];
        if node.largest < length {
            return None;
        }
        if self.largest_of(node.left) >= length {
            return self.lowest_fit_at(node.left, length);
        }
        if node.hole.length >= length {
            return Some(node.hole);
        }
        self.lowest_fit_at(node.right, length)
    }

    fn highest_fit_at(&self, link: Link, length: usize) -> Option<Hole> {
        let node = &self.nodes[link?];
        if node.largest < length {
            return None;
        }
        if self.largest_of(node.right) >= length {
            return self.highest_fit_at(node.right, length);
        }
        if node.hole.length >= length {
            return Some(node.hole);
        }
        self.highest_fit_at(node.left, length)
    }

    fn collect(&self, link: Link, out: &mut Vec<Hole>) {
        if let Some(i) = link {
            self.collect(self.nodes[i].left, out);
            out.push(self.nodes[i].hole);
            self.collect(self.nodes[i].right, out);
        }
    }

    /// Returns `(height, largest)` of a valid subtree
    fn check_node(&self, link: Link) -> Option<(u32, usize)> {
        let Some(i) = link else {
            return Some((0, 0));
        };
        let node = &self.nodes[i];
        let (hl, ll) = self.check_node(node.left)?;
        let (hr, lr) = self.check_node(node.right)?;
        let largest = max(node.hole.length, max(ll, lr));
        let height = 1 + max(hl, hr);
        let balanced = hl.abs_diff(hr) <= 1;
        (balanced && node.largest == largest && node.height == height).then_some((height, largest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nos_vm_api::PAGE_SIZE;
    use proptest::prelude::*;

    const BASE: VirtualAddr = 0x10_0000;

    #[test]
    fn test_bottom_and_top_allocation() {
        let mut tree = HoleTree::with_hole(BASE, 16 * PAGE_SIZE);

        let low = tree.allocate_bottom(2 * PAGE_SIZE).unwrap();
        assert_eq!(low, BASE);
        let high = tree.allocate_top(PAGE_SIZE).unwrap();
        assert_eq!(high, BASE + 15 * PAGE_SIZE);

        assert_eq!(tree.holes(), [Hole::new(BASE + 2 * PAGE_SIZE, 13 * PAGE_SIZE)]);
        assert!(tree.check_invariants());
    }

    #[test]
    fn test_fixed_allocation_splits() {
        let mut tree = HoleTree::with_hole(BASE, 8 * PAGE_SIZE);
        tree.allocate_fixed(BASE + 2 * PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
        assert_eq!(
            tree.holes(),
            [Hole::new(BASE, 2 * PAGE_SIZE), Hole::new(BASE + 4 * PAGE_SIZE, 4 * PAGE_SIZE)]
        );

        // Overlapping the carved range fails.
        assert_eq!(tree.allocate_fixed(BASE + PAGE_SIZE, 2 * PAGE_SIZE), Err(Error::AddressInUse));
        assert_eq!(tree.allocate_fixed(BASE + 3 * PAGE_SIZE, PAGE_SIZE), Err(Error::AddressInUse));
    }

    #[test]
    fn test_release_coalesces() {
        let mut tree = HoleTree::with_hole(BASE, 8 * PAGE_SIZE);
        let a = tree.allocate_bottom(PAGE_SIZE).unwrap();
        let b = tree.allocate_bottom(PAGE_SIZE).unwrap();
        let c = tree.allocate_bottom(PAGE_SIZE).unwrap();

        tree.release(b, PAGE_SIZE);
        assert_eq!(tree.len(), 2);
        tree.release(a, PAGE_SIZE);
        assert_eq!(tree.holes()[0], Hole::new(BASE, 2 * PAGE_SIZE));
        tree.release(c, PAGE_SIZE);
        assert_eq!(tree.holes(), [Hole::new(BASE, 8 * PAGE_SIZE)]);
    }

    #[test]
    fn test_no_fit() {
        let mut tree = HoleTree::with_hole(BASE, 4 * PAGE_SIZE);
        tree.allocate_fixed(BASE + PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(tree.largest(), 2 * PAGE_SIZE);
        assert_eq!(tree.allocate_bottom(3 * PAGE_SIZE), Err(Error::NoMemory));
        assert_eq!(tree.allocate_bottom(2 * PAGE_SIZE), Ok(BASE + 2 * PAGE_SIZE));
    }

    #[test]
    fn test_first_fit_prefers_low_addresses() {
        let mut tree = HoleTree::new();
        for i in 0..32 {
            tree.insert(Hole::new(BASE + i * 16 * PAGE_SIZE, (1 + i % 4) * PAGE_SIZE));
        }
        assert!(tree.check_invariants());
        assert_eq!(tree.lowest_fit(4 * PAGE_SIZE).unwrap().address, BASE + 3 * 16 * PAGE_SIZE);
        assert_eq!(tree.highest_fit(4 * PAGE_SIZE).unwrap().address, BASE + 31 * 16 * PAGE_SIZE);
        assert_eq!(tree.find_containing(BASE + 16 * PAGE_SIZE + 5).unwrap().address, BASE + 16 * PAGE_SIZE);
        assert!(tree.find_containing(BASE + 16 * PAGE_SIZE + 2 * PAGE_SIZE).is_none());
    }

    proptest! {
        #[test]
        fn prop_allocation_keeps_invariants(
            ops in proptest::collection::vec((1usize..16, any::<bool>(), any::<bool>()), 1..96)
        ) {
            let total = 512 * PAGE_SIZE;
            let mut tree = HoleTree::with_hole(BASE, total);
            let mut live: Vec<(VirtualAddr, usize)> = Vec::new();

            for (pages, top, release) in ops {
                if release && !live.is_empty() {
                    let (address, length) = live.swap_remove(pages % live.len());
                    tree.release(address, length);
                } else {
                    let length = pages * PAGE_SIZE;
                    let result = if top { tree.allocate_top(length) } else { tree.allocate_bottom(length) };
                    if let Ok(address) = result {
                        prop_assert!(address >= BASE && address + length <= BASE + total);
                        prop_assert!(live.iter().all(|&(a, l)| address + length <= a || a + l <= address));
                        live.push((address, length));
                    }
                }
                prop_assert!(tree.check_invariants());
                let used: usize = live.iter().map(|&(_, l)| l).sum();
                prop_assert_eq!(tree.free_bytes() + used, total);
            }

            for (address, length) in live.drain(..) {
                tree.release(address, length);
            }
            prop_assert_eq!(tree.holes(), alloc::vec![Hole::new(BASE, total)]);
        }
    }
}
