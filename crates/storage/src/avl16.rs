//! Self-versioning copy-on-write AVL tree in a fixed page
//!
//! A single byte block holds an AVL tree addressed by 16-bit node slots:
//!
//! ```text
//!   head (20 bytes)          allocation + uber bookkeeping
//!   node slots (upward)      {child[2]: u16, balance: i8,
//!                             birth: u48, death: u48, key[stride-17]}
//!   uber slots (downward)    {seqid: u48, root: u16}, one per version
//! ```
//!
//! Every committed transaction installs a new uber; nodes carry the seqid
//! at which they were born and the seqid at which they were logically
//! removed. Opening a transaction at a historical seqid reads that
//! version's root and never observes newer mutations. Free node slots form
//! an intrusive list through `child[0]`.
//!
//! Mutations path-copy: any node on the root-to-target path whose birth
//! does not match the transaction's working seqid is copied before it is
//! touched, so committed versions stay immutable. `clean` reclaims the
//! slots of versions nobody will open again.

use byteorder::{ByteOrder, LittleEndian};
use raleighsl_core::{Errno, RslResult, SeqId};
use std::cmp::Ordering;

const HEAD_SIZE: usize = 20;
const UBER_SIZE: usize = 8;
const NODE_BASE: usize = 17;
const MAX_HEIGHT: usize = 24;

// head field offsets
const H_STRIDE: usize = 0;
const H_NEXT: usize = 2;
const H_FREE_LIST: usize = 4;
const H_AVAIL: usize = 6;
const H_SIZE: usize = 10;
const H_ROOT_CURRENT: usize = 14;
const H_ROOT_VERSIONS: usize = 16;
const H_ROOT_FREE: usize = 18;

/// Page-local transaction handle
///
/// Captured from an uber by [`Avl16Page::txn_open`]. The first mutation
/// bumps the working seqid; `commit` installs it as a new uber, `revert`
/// walks the working subtree back out of the page.
#[derive(Debug, Clone)]
pub struct AvlTxn {
    seqid: u64,
    root: u16,
    dirty: bool,
    failed: bool,
}

impl AvlTxn {
    /// Seqid this transaction reads from (or writes as, once dirty)
    pub fn seqid(&self) -> u64 {
        self.seqid
    }

    /// True once a mutation failed; commit will revert
    pub fn failed(&self) -> bool {
        self.failed
    }
}

enum Anchor {
    Root,
    Node(u16),
}

/// Fixed-size page holding a versioned AVL tree
pub struct Avl16Page {
    data: Box<[u8]>,
}

impl Avl16Page {
    /// Format a fresh page of `size` bytes with `key_stride` payload bytes
    /// per node; returns the page and its node capacity
    pub fn init(size: usize, key_stride: u16) -> (Self, u32) {
        assert!(size >= HEAD_SIZE + UBER_SIZE + NODE_BASE + key_stride as usize);
        assert!(size <= u32::MAX as usize);
        let mut page = Avl16Page {
            data: vec![0u8; size].into_boxed_slice(),
        };
        let stride = (NODE_BASE + key_stride as usize) as u16;
        page.put16(H_STRIDE, stride);
        page.put16(H_NEXT, 1);
        page.put16(H_FREE_LIST, 0);
        page.put32(H_AVAIL, (size - HEAD_SIZE - UBER_SIZE) as u32);
        page.put32(H_SIZE, size as u32);
        page.put16(H_ROOT_CURRENT, 1);
        page.put16(H_ROOT_VERSIONS, 1);
        page.put16(H_ROOT_FREE, 0);
        page.set_uber(1, 1, 0);
        let capacity = page.avail() / stride as u32 - 1;
        (page, capacity)
    }

    /// Adopt an existing formatted page
    pub fn from_bytes(data: Box<[u8]>) -> Self {
        Avl16Page { data }
    }

    /// Raw page bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    // ------------------------------------------------------------------
    // field accessors
    // ------------------------------------------------------------------

    fn get16(&self, off: usize) -> u16 {
        LittleEndian::read_u16(&self.data[off..off + 2])
    }

    fn put16(&mut self, off: usize, val: u16) {
        LittleEndian::write_u16(&mut self.data[off..off + 2], val);
    }

    fn get32(&self, off: usize) -> u32 {
        LittleEndian::read_u32(&self.data[off..off + 4])
    }

    fn put32(&mut self, off: usize, val: u32) {
        LittleEndian::write_u32(&mut self.data[off..off + 4], val);
    }

    fn get48(&self, off: usize) -> u64 {
        LittleEndian::read_uint(&self.data[off..off + 6], 6)
    }

    fn put48(&mut self, off: usize, val: u64) {
        LittleEndian::write_uint(&mut self.data[off..off + 6], val, 6);
    }

    fn stride(&self) -> usize {
        self.get16(H_STRIDE) as usize
    }

    /// Bytes remaining for node and uber growth
    pub fn avail(&self) -> u32 {
        self.get32(H_AVAIL)
    }

    /// Next never-used node slot (diagnostics and revert tests)
    pub fn next_slot(&self) -> u16 {
        self.get16(H_NEXT)
    }

    fn size(&self) -> usize {
        self.get32(H_SIZE) as usize
    }

    fn node_off(&self, pos: u16) -> usize {
        debug_assert!(pos != 0);
        HEAD_SIZE + (pos as usize - 1) * self.stride()
    }

    fn child(&self, pos: u16, dir: usize) -> u16 {
        self.get16(self.node_off(pos) + 2 * dir)
    }

    fn set_child(&mut self, pos: u16, dir: usize, val: u16) {
        let off = self.node_off(pos) + 2 * dir;
        self.put16(off, val);
    }

    fn balance(&self, pos: u16) -> i8 {
        self.data[self.node_off(pos) + 4] as i8
    }

    fn set_balance(&mut self, pos: u16, val: i8) {
        let off = self.node_off(pos) + 4;
        self.data[off] = val as u8;
    }

    fn birth(&self, pos: u16) -> u64 {
        self.get48(self.node_off(pos) + 5)
    }

    fn set_birth(&mut self, pos: u16, val: u64) {
        let off = self.node_off(pos) + 5;
        self.put48(off, val);
    }

    fn death(&self, pos: u16) -> u64 {
        self.get48(self.node_off(pos) + 11)
    }

    fn set_death(&mut self, pos: u16, val: u64) {
        let off = self.node_off(pos) + 11;
        self.put48(off, val);
    }

    /// Key/payload region of a node
    pub fn key_bytes(&self, pos: u16) -> &[u8] {
        let off = self.node_off(pos) + NODE_BASE;
        let len = self.stride() - NODE_BASE;
        &self.data[off..off + len]
    }

    /// Mutable key/payload region of a node
    ///
    /// Only valid for nodes born in the caller's open transaction.
    pub fn key_bytes_mut(&mut self, pos: u16) -> &mut [u8] {
        let off = self.node_off(pos) + NODE_BASE;
        let len = self.stride() - NODE_BASE;
        &mut self.data[off..off + len]
    }

    fn uber_off(&self, index: u16) -> usize {
        debug_assert!(index != 0);
        self.size() - index as usize * UBER_SIZE
    }

    fn uber_seqid(&self, index: u16) -> u64 {
        self.get48(self.uber_off(index))
    }

    fn uber_root(&self, index: u16) -> u16 {
        self.get16(self.uber_off(index) + 6)
    }

    fn set_uber(&mut self, index: u16, seqid: u64, root: u16) {
        let off = self.uber_off(index);
        self.put48(off, seqid);
        self.put16(off + 6, root);
    }

    /// Seqid of the current (most recently committed) version
    pub fn current_seqid(&self) -> u64 {
        self.uber_seqid(self.get16(H_ROOT_CURRENT))
    }

    // ------------------------------------------------------------------
    // uber management
    // ------------------------------------------------------------------

    fn add_root(&mut self, seqid: u64, root: u16) {
        let root_free = self.get16(H_ROOT_FREE);
        let index = if root_free != 0 {
            self.put16(H_ROOT_CURRENT, root_free);
            let reused = root_free;
            let next_free = self.uber_root(reused);
            self.put16(H_ROOT_FREE, next_free);
            reused
        } else {
            let versions = self.get16(H_ROOT_VERSIONS) + 1;
            self.put16(H_ROOT_VERSIONS, versions);
            self.put16(H_ROOT_CURRENT, versions);
            let avail = self.avail() - UBER_SIZE as u32;
            self.put32(H_AVAIL, avail);
            versions
        };
        self.set_uber(index, seqid, root);
    }

    fn remove_root(&mut self, index: u16) {
        // reclaimed slots thread onto the free list through their root
        // field; the slot array itself never shrinks
        let root_free = self.get16(H_ROOT_FREE);
        self.set_uber(index, 0, root_free);
        self.put16(H_ROOT_FREE, index);
    }

    fn find_root(&self, seqid: u64) -> Option<u16> {
        let versions = self.get16(H_ROOT_VERSIONS);
        (1..=versions).find(|&index| self.uber_seqid(index) == seqid)
    }

    // ------------------------------------------------------------------
    // node allocation
    // ------------------------------------------------------------------

    fn alloc_node(&mut self) -> u16 {
        let free_list = self.get16(H_FREE_LIST);
        let pos = if free_list == 0 {
            let next = self.get16(H_NEXT);
            self.put16(H_NEXT, next + 1);
            next
        } else {
            let next_free = self.child(free_list, 0);
            self.put16(H_FREE_LIST, next_free);
            free_list
        };
        let avail = self.avail();
        debug_assert!(avail >= self.stride() as u32);
        self.put32(H_AVAIL, avail - self.stride() as u32);
        pos
    }

    fn free_node(&mut self, pos: u16) {
        let free_list = self.get16(H_FREE_LIST);
        self.set_child(pos, 0, free_list);
        self.set_child(pos, 1, 0);
        self.set_balance(pos, 0);
        self.set_birth(pos, 0);
        self.set_death(pos, SeqId::MAX_DEATH);
        self.put16(H_FREE_LIST, pos);
        let avail = self.avail() + self.stride() as u32;
        self.put32(H_AVAIL, avail);
    }

    fn fresh_node(&mut self, seqid: u64) -> u16 {
        let pos = self.alloc_node();
        self.set_child(pos, 0, 0);
        self.set_child(pos, 1, 0);
        self.set_balance(pos, 0);
        self.set_birth(pos, seqid);
        self.set_death(pos, SeqId::MAX_DEATH);
        pos
    }

    fn copy_node(&mut self, dst: u16, src: u16, seqid: u64) {
        let stride = self.stride();
        let src_off = self.node_off(src);
        let dst_off = self.node_off(dst);
        self.data.copy_within(src_off..src_off + stride, dst_off);
        self.set_birth(dst, seqid);
        self.set_death(dst, SeqId::MAX_DEATH);
        self.set_death(src, seqid);
    }

    /// Copy-on-write a node referenced through `slot`, updating the slot
    fn cow(&mut self, seqid: u64, slot: &mut u16) -> u16 {
        let pos = *slot;
        debug_assert!(pos != 0);
        if self.birth(pos) != seqid {
            let copy = self.alloc_node();
            self.copy_node(copy, pos, seqid);
            *slot = copy;
            copy
        } else {
            pos
        }
    }

    /// Path-copy every stale node along a descent path
    ///
    /// `dstack` carries the descent direction bits, lowest bit first.
    fn cow_path(
        &mut self,
        seqid: u64,
        root: &mut u16,
        stack: &mut [u16],
        istack: usize,
        mut dstack: u32,
    ) {
        if self.birth(stack[0]) != seqid {
            let copy = self.alloc_node();
            self.copy_node(copy, stack[0], seqid);
            *root = copy;
            stack[0] = copy;
        }
        let mut parent = stack[0];

        for i in 1..istack {
            if self.birth(stack[i]) != seqid {
                let copy = self.alloc_node();
                self.set_child(parent, (dstack & 1) as usize, copy);
                self.copy_node(copy, stack[i], seqid);
                stack[i] = copy;
                parent = copy;
            } else {
                parent = stack[i];
            }
            dstack >>= 1;
        }
    }

    fn write_anchor(&mut self, anchor: &Anchor, root: &mut u16, parent_pos: u16, wpos: u16) {
        match anchor {
            Anchor::Root => {
                debug_assert_eq!(*root, parent_pos);
                *root = wpos;
            }
            Anchor::Node(above) => {
                if self.child(*above, 0) == parent_pos {
                    self.set_child(*above, 0, wpos);
                } else {
                    self.set_child(*above, 1, wpos);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // insert rebalance
    // ------------------------------------------------------------------

    /// Rebalance after insertion
    ///
    /// `parent_pos` is the deepest node with a non-zero balance before the
    /// insert, `node_pos` the freshly inserted node, `dstack` the descent
    /// directions from `parent_pos` down. Every touched node was born in
    /// this transaction's seqid by the preceding path copy.
    #[allow(clippy::too_many_arguments)]
    fn ibalance(
        &mut self,
        seqid: u64,
        parent_pos: u16,
        node_pos: u16,
        anchor: Anchor,
        root: &mut u16,
        mut dstack: u32,
    ) {
        let mut p = parent_pos;
        while p != node_pos {
            let dir = (dstack & 1) as usize;
            let bal = self.balance(p) + if dir == 1 { 1 } else { -1 };
            self.set_balance(p, bal);
            p = self.child(p, dir);
            dstack >>= 1;
        }

        let wpos;
        if self.balance(parent_pos) == -2 {
            let xpos = self.child(parent_pos, 0);
            debug_assert_eq!(self.birth(xpos), seqid);

            if self.balance(xpos) == -1 {
                wpos = xpos;
                let t = self.child(xpos, 1);
                self.set_child(parent_pos, 0, t);
                self.set_balance(parent_pos, 0);
                self.set_child(xpos, 1, parent_pos);
                self.set_balance(xpos, 0);
            } else {
                let w = self.child(xpos, 1);
                debug_assert_eq!(self.birth(w), seqid);
                wpos = w;

                let t = self.child(w, 0);
                self.set_child(xpos, 1, t);
                self.set_child(w, 0, xpos);
                let t = self.child(w, 1);
                self.set_child(parent_pos, 0, t);
                self.set_child(w, 1, parent_pos);
                match self.balance(w) {
                    -1 => {
                        self.set_balance(xpos, 0);
                        self.set_balance(parent_pos, 1);
                    }
                    0 => {
                        self.set_balance(xpos, 0);
                        self.set_balance(parent_pos, 0);
                    }
                    _ => {
                        self.set_balance(xpos, -1);
                        self.set_balance(parent_pos, 0);
                    }
                }
                self.set_balance(w, 0);
            }
        } else if self.balance(parent_pos) == 2 {
            let xpos = self.child(parent_pos, 1);
            debug_assert_eq!(self.birth(xpos), seqid);

            if self.balance(xpos) == 1 {
                wpos = xpos;
                let t = self.child(xpos, 0);
                self.set_child(parent_pos, 1, t);
                self.set_child(xpos, 0, parent_pos);
                self.set_balance(xpos, 0);
                self.set_balance(parent_pos, 0);
            } else {
                let w = self.child(xpos, 0);
                debug_assert_eq!(self.birth(w), seqid);
                wpos = w;

                let t = self.child(w, 1);
                self.set_child(xpos, 0, t);
                self.set_child(w, 1, xpos);
                let t = self.child(w, 0);
                self.set_child(parent_pos, 1, t);
                self.set_child(w, 0, parent_pos);
                match self.balance(w) {
                    1 => {
                        self.set_balance(xpos, 0);
                        self.set_balance(parent_pos, -1);
                    }
                    0 => {
                        self.set_balance(xpos, 0);
                        self.set_balance(parent_pos, 0);
                    }
                    _ => {
                        self.set_balance(xpos, 1);
                        self.set_balance(parent_pos, 0);
                    }
                }
                self.set_balance(w, 0);
            }
        } else {
            return;
        }

        self.write_anchor(&anchor, root, parent_pos, wpos);
    }

    // ------------------------------------------------------------------
    // insert / append
    // ------------------------------------------------------------------

    fn insert_at(
        &mut self,
        seqid: u64,
        root: &mut u16,
        cmp: &dyn Fn(&[u8], &[u8]) -> Ordering,
        key: &[u8],
    ) -> RslResult<u16> {
        let node_pos = self.fresh_node(seqid);
        let key_region_len = self.stride() - NODE_BASE;
        debug_assert!(key.len() <= key_region_len);
        self.key_bytes_mut(node_pos)[..key.len()].copy_from_slice(key);

        if *root == 0 {
            *root = node_pos;
            return Ok(node_pos);
        }

        let mut stack = [0u16; MAX_HEIGHT];
        let mut dstack: u32 = 0;
        let mut dfstack: u32 = 0;
        let mut istack = 0usize;
        let mut parent = 0usize;
        let mut top = 0usize;
        let mut q = 0usize;
        let mut k = 0u32;
        let mut dir = 0usize;
        let mut at_root = true;

        let mut pp = *root;
        while pp != 0 {
            let ord = cmp(self.key_bytes(pp), key);
            if ord == Ordering::Equal {
                self.free_node(node_pos);
                return Ok(pp);
            }

            if self.balance(pp) != 0 {
                k = 0;
                top = q;
                at_root = istack == 0;
                parent = istack;
                dstack = 0;
            }

            q = istack;
            dir = (ord == Ordering::Less) as usize;
            dstack |= (dir as u32) << k;
            k += 1;
            dfstack |= (dir as u32) << istack;
            stack[istack] = pp;
            istack += 1;
            pp = self.child(pp, dir);
        }

        if (self.avail() as usize) < (istack + 2) * self.stride() {
            self.free_node(node_pos);
            return Err(Errno::PageFull);
        }
        self.cow_path(seqid, root, &mut stack, istack, dfstack);

        self.set_child(stack[q], dir, node_pos);

        let anchor = if at_root {
            Anchor::Root
        } else {
            Anchor::Node(stack[top])
        };
        self.ibalance(seqid, stack[parent], node_pos, anchor, root, dstack);
        Ok(node_pos)
    }

    fn append_at(&mut self, seqid: u64, root: &mut u16) -> RslResult<u16> {
        let node_pos = self.fresh_node(seqid);

        if *root == 0 {
            *root = node_pos;
            return Ok(node_pos);
        }

        let mut stack = [0u16; MAX_HEIGHT];
        let mut dstack: u32 = 0;
        let mut dfstack: u32 = 0;
        let mut istack = 0usize;
        let mut parent = 0usize;
        let mut top = 0usize;
        let mut q = 0usize;
        let mut k = 0u32;
        let mut at_root = true;

        let mut pp = *root;
        while pp != 0 {
            if self.balance(pp) != 0 {
                k = 0;
                top = q;
                at_root = istack == 0;
                parent = istack;
                dstack = 0;
            }
            q = istack;
            dfstack |= 1 << istack;
            stack[istack] = pp;
            istack += 1;
            pp = self.child(pp, 1);
            dstack |= 1 << k;
            k += 1;
        }

        if (self.avail() as usize) < (istack + 2) * self.stride() {
            self.free_node(node_pos);
            return Err(Errno::PageFull);
        }
        self.cow_path(seqid, root, &mut stack, istack, dfstack);

        self.set_child(stack[q], 1, node_pos);

        let anchor = if at_root {
            Anchor::Root
        } else {
            Anchor::Node(stack[top])
        };
        self.ibalance(seqid, stack[parent], node_pos, anchor, root, dstack);
        Ok(node_pos)
    }

    // ------------------------------------------------------------------
    // remove
    // ------------------------------------------------------------------

    /// Relink through a stack entry; entry 0 is the root slot itself
    fn link(&mut self, root: &mut u16, pos: u16, dir: usize, val: u16) {
        if pos == 0 {
            *root = val;
        } else {
            self.set_child(pos, dir, val);
        }
    }

    fn remove_at(
        &mut self,
        seqid: u64,
        root: &mut u16,
        cmp: &dyn Fn(&[u8], &[u8]) -> Ordering,
        key: &[u8],
    ) -> RslResult<u16> {
        if *root == 0 {
            return Err(Errno::DataKeyNotFound);
        }

        let mut stack = [0u16; MAX_HEIGHT];
        let mut dstack = [0usize; MAX_HEIGHT];
        let mut dfstack: u32 = 0;
        let mut istack = 0usize;

        // stack entry 0 is the root slot; descent starts with dir 0
        let mut ord = Ordering::Greater;
        let mut node_pos = 0u16;
        loop {
            let dir = (ord == Ordering::Less) as usize;
            dfstack |= (dir as u32) << istack;
            stack[istack] = node_pos;
            dstack[istack] = dir;
            istack += 1;

            let next = if node_pos == 0 {
                *root
            } else {
                self.child(node_pos, dir)
            };
            if next == 0 {
                return Err(Errno::DataKeyNotFound);
            }
            node_pos = next;
            ord = cmp(self.key_bytes(node_pos), key);
            if ord == Ordering::Equal {
                break;
            }
        }

        if (self.avail() as usize) < (2 + istack) * self.stride() {
            return Err(Errno::PageFull);
        }

        if istack > 1 {
            self.cow_path(seqid, root, &mut stack[1..istack], istack - 1, dfstack >> 1);
        }

        self.dbalance(seqid, node_pos, root, &mut stack, &mut dstack, istack);
        self.set_death(node_pos, seqid);
        Ok(node_pos)
    }

    /// Rebalance after deletion
    ///
    /// `dnode` is the dying node (left in place, death stamped by the
    /// caller); the successor splice and every retracing step copy stale
    /// nodes before touching them.
    fn dbalance(
        &mut self,
        seqid: u64,
        dnode: u16,
        root: &mut u16,
        stack: &mut [u16; MAX_HEIGHT],
        dstack: &mut [usize; MAX_HEIGHT],
        mut k: usize,
    ) {
        if self.child(dnode, 1) == 0 {
            let val = self.child(dnode, 0);
            self.link(root, stack[k - 1], dstack[k - 1], val);
        } else {
            let n_c0 = self.child(dnode, 0);
            let n_c1 = self.child(dnode, 1);
            let n_bal = self.balance(dnode);

            let mut c1 = n_c1;
            self.cow(seqid, &mut c1);
            let rpos = c1;

            if self.child(rpos, 0) == 0 {
                self.set_child(rpos, 0, n_c0);
                self.set_balance(rpos, n_bal);
                self.link(root, stack[k - 1], dstack[k - 1], rpos);
                dstack[k] = 1;
                stack[k] = rpos;
                k += 1;
            } else {
                let j = k;
                k += 1;

                let mut r = rpos;
                let spos;
                loop {
                    dstack[k] = 0;
                    stack[k] = r;
                    k += 1;
                    let mut c0 = self.child(r, 0);
                    self.cow(seqid, &mut c0);
                    self.set_child(r, 0, c0);
                    if self.child(c0, 0) == 0 {
                        spos = c0;
                        break;
                    }
                    r = c0;
                }

                self.set_child(spos, 0, n_c0);
                let s_right = self.child(spos, 1);
                self.set_child(r, 0, s_right);
                self.set_child(spos, 1, n_c1);
                self.set_balance(spos, n_bal);

                self.link(root, stack[j - 1], dstack[j - 1], spos);
                dstack[j] = 1;
                stack[j] = spos;
            }
        }

        while k > 1 {
            k -= 1;
            let ypos = stack[k];
            debug_assert_eq!(self.birth(ypos), seqid);

            if dstack[k] == 0 {
                let bal = self.balance(ypos) + 1;
                self.set_balance(ypos, bal);
                if bal == 1 {
                    break;
                }
                if bal == 2 {
                    let mut cx = self.child(ypos, 1);
                    self.cow(seqid, &mut cx);
                    self.set_child(ypos, 1, cx);
                    let xpos = cx;

                    if self.balance(xpos) == -1 {
                        let mut cw = self.child(xpos, 0);
                        self.cow(seqid, &mut cw);
                        self.set_child(xpos, 0, cw);
                        let wpos = cw;

                        let t = self.child(wpos, 1);
                        self.set_child(xpos, 0, t);
                        self.set_child(wpos, 1, xpos);
                        let t = self.child(wpos, 0);
                        self.set_child(ypos, 1, t);
                        self.set_child(wpos, 0, ypos);
                        match self.balance(wpos) {
                            1 => {
                                self.set_balance(xpos, 0);
                                self.set_balance(ypos, -1);
                            }
                            0 => {
                                self.set_balance(xpos, 0);
                                self.set_balance(ypos, 0);
                            }
                            _ => {
                                self.set_balance(xpos, 1);
                                self.set_balance(ypos, 0);
                            }
                        }
                        self.set_balance(wpos, 0);
                        self.link(root, stack[k - 1], dstack[k - 1], wpos);
                    } else {
                        let t = self.child(xpos, 0);
                        self.set_child(ypos, 1, t);
                        self.set_child(xpos, 0, ypos);
                        self.link(root, stack[k - 1], dstack[k - 1], xpos);
                        if self.balance(xpos) == 0 {
                            self.set_balance(xpos, -1);
                            self.set_balance(ypos, 1);
                            break;
                        } else {
                            self.set_balance(xpos, 0);
                            self.set_balance(ypos, 0);
                        }
                    }
                }
            } else {
                let bal = self.balance(ypos) - 1;
                self.set_balance(ypos, bal);
                if bal == -1 {
                    break;
                }
                if bal == -2 {
                    let mut cx = self.child(ypos, 0);
                    self.cow(seqid, &mut cx);
                    self.set_child(ypos, 0, cx);
                    let xpos = cx;

                    if self.balance(xpos) == 1 {
                        let mut cw = self.child(xpos, 1);
                        self.cow(seqid, &mut cw);
                        self.set_child(xpos, 1, cw);
                        let wpos = cw;

                        let t = self.child(wpos, 0);
                        self.set_child(xpos, 1, t);
                        self.set_child(wpos, 0, xpos);
                        let t = self.child(wpos, 1);
                        self.set_child(ypos, 0, t);
                        self.set_child(wpos, 1, ypos);
                        match self.balance(wpos) {
                            -1 => {
                                self.set_balance(xpos, 0);
                                self.set_balance(ypos, 1);
                            }
                            0 => {
                                self.set_balance(xpos, 0);
                                self.set_balance(ypos, 0);
                            }
                            _ => {
                                self.set_balance(xpos, -1);
                                self.set_balance(ypos, 0);
                            }
                        }
                        self.set_balance(wpos, 0);
                        self.link(root, stack[k - 1], dstack[k - 1], wpos);
                    } else {
                        let t = self.child(xpos, 1);
                        self.set_child(ypos, 0, t);
                        self.set_child(xpos, 1, ypos);
                        self.link(root, stack[k - 1], dstack[k - 1], xpos);
                        if self.balance(xpos) == 0 {
                            self.set_balance(xpos, 1);
                            self.set_balance(ypos, -1);
                            break;
                        } else {
                            self.set_balance(xpos, 0);
                            self.set_balance(ypos, 0);
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // transactions
    // ------------------------------------------------------------------

    /// Open a transaction at `seqid`, or at the current version for 0
    ///
    /// Fails when the requested historical uber has been reclaimed.
    pub fn txn_open(&self, seqid: u64) -> RslResult<AvlTxn> {
        let index = if seqid == 0 {
            self.get16(H_ROOT_CURRENT)
        } else {
            self.find_root(seqid).ok_or(Errno::ObjectNotFound)?
        };
        Ok(AvlTxn {
            seqid: self.uber_seqid(index),
            root: self.uber_root(index),
            dirty: false,
            failed: false,
        })
    }

    fn arm(&self, txn: &mut AvlTxn) {
        if !txn.dirty {
            txn.dirty = true;
            txn.seqid += 1;
        }
    }

    /// Insert `key`; returns the node slot to fill with payload bytes
    ///
    /// If the key is already present its existing slot is returned. A full
    /// page fails the transaction.
    pub fn txn_insert(
        &mut self,
        txn: &mut AvlTxn,
        cmp: impl Fn(&[u8], &[u8]) -> Ordering,
        key: &[u8],
    ) -> RslResult<u16> {
        self.arm(txn);
        let mut root = txn.root;
        let result = self.insert_at(txn.seqid, &mut root, &cmp, key);
        txn.root = root;
        txn.failed |= result.is_err();
        result
    }

    /// Insert at the right spine without key comparison (logs and queues)
    pub fn txn_append(&mut self, txn: &mut AvlTxn) -> RslResult<u16> {
        self.arm(txn);
        let mut root = txn.root;
        let result = self.append_at(txn.seqid, &mut root);
        txn.root = root;
        txn.failed |= result.is_err();
        result
    }

    /// Remove `key`; the dead node keeps its slot until `clean`
    ///
    /// A miss or a full page fails the transaction.
    pub fn txn_remove(
        &mut self,
        txn: &mut AvlTxn,
        cmp: impl Fn(&[u8], &[u8]) -> Ordering,
        key: &[u8],
    ) -> RslResult<u16> {
        self.arm(txn);
        let mut root = txn.root;
        let result = self.remove_at(txn.seqid, &mut root, &cmp, key);
        txn.root = root;
        txn.failed |= result.is_err();
        result
    }

    /// Strict lookup against the transaction's root snapshot
    ///
    /// Never observes mutations committed after the transaction opened,
    /// nor any other transaction's uncommitted work.
    pub fn txn_lookup(
        &self,
        txn: &AvlTxn,
        cmp: impl Fn(&[u8], &[u8]) -> Ordering,
        key: &[u8],
    ) -> Option<u16> {
        let mut pos = txn.root;
        while pos != 0 {
            match cmp(self.key_bytes(pos), key) {
                Ordering::Greater => pos = self.child(pos, 0),
                Ordering::Less => pos = self.child(pos, 1),
                Ordering::Equal => return Some(pos),
            }
        }
        None
    }

    /// Install the transaction's root as the new current version
    ///
    /// A failed transaction reverts instead. Fails with `PageFull` when no
    /// room remains for another uber slot.
    pub fn txn_commit(&mut self, txn: &mut AvlTxn) -> RslResult<()> {
        if txn.failed {
            self.txn_revert(txn);
            return Err(Errno::PageFull);
        }
        if txn.dirty {
            if self.avail() < UBER_SIZE as u32 {
                self.txn_revert(txn);
                return Err(Errno::PageFull);
            }
            self.add_root(txn.seqid, txn.root);
            txn.dirty = false;
        }
        Ok(())
    }

    fn revert_walk(&mut self, seqid: u64, pos: u16) {
        if self.death(pos) == seqid {
            self.set_death(pos, SeqId::MAX_DEATH);
        }
        if self.birth(pos) != seqid {
            return;
        }
        let c0 = self.child(pos, 0);
        if c0 != 0 {
            self.revert_walk(seqid, c0);
        }
        let c1 = self.child(pos, 1);
        if c1 != 0 {
            self.revert_walk(seqid, c1);
        }
        self.free_node(pos);
    }

    fn revert_death_walk(&mut self, seqid: u64, pos: u16) {
        let death = self.death(pos);
        if seqid > death {
            return;
        }
        if seqid == death {
            self.set_death(pos, SeqId::MAX_DEATH);
        }
        let c0 = self.child(pos, 0);
        if c0 != 0 {
            self.revert_death_walk(seqid, c0);
        }
        let c1 = self.child(pos, 1);
        if c1 != 0 {
            self.revert_death_walk(seqid, c1);
        }
    }

    /// Free the working subtree and clear this transaction's death marks
    pub fn txn_revert(&mut self, txn: &mut AvlTxn) {
        if !txn.dirty {
            return;
        }
        if txn.root != 0 {
            self.revert_walk(txn.seqid, txn.root);
        }
        let current = self.get16(H_ROOT_CURRENT);
        let current_root = self.uber_root(current);
        if current_root != 0 {
            self.revert_death_walk(txn.seqid, current_root);
        }
        txn.seqid = self.uber_seqid(current);
        txn.root = current_root;
        txn.dirty = false;
        txn.failed = false;
    }

    // ------------------------------------------------------------------
    // version reclamation
    // ------------------------------------------------------------------

    fn clean_walk(&mut self, seqid: u64, pos: u16) {
        if seqid + 1 < self.death(pos) {
            return;
        }
        let c0 = self.child(pos, 0);
        if c0 != 0 {
            self.clean_walk(seqid, c0);
        }
        let c1 = self.child(pos, 1);
        if c1 != 0 {
            self.clean_walk(seqid, c1);
        }
        self.free_node(pos);
    }

    /// Reclaim every version with seqid at or below `keep_seqid`
    ///
    /// Versions above `keep_seqid` are untouched. The caller keeps
    /// `keep_seqid` below the current seqid; `clean_all` does this.
    pub fn clean(&mut self, keep_seqid: u64) {
        let versions = self.get16(H_ROOT_VERSIONS);
        let mut reclaimed = 0u16;
        for index in (1..=versions).rev() {
            let seqid = self.uber_seqid(index);
            if seqid > 0 && seqid <= keep_seqid {
                let root = self.uber_root(index);
                if root != 0 {
                    self.clean_walk(keep_seqid, root);
                }
                self.remove_root(index);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            tracing::trace!(keep_seqid, reclaimed, "reclaimed historical versions");
        }
    }

    /// Reclaim every version older than the current one
    pub fn clean_all(&mut self) {
        let current = self.current_seqid();
        self.clean(current.saturating_sub(1));
    }
}
