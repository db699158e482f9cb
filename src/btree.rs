//! Tree driver: orchestrates recursive insert/delete by threading node
//! reads/writes through the pager, and installs a new root when the old one
//! splits or collapses. Everything below this layer is either a pure
//! byte-buffer transform (`node`) or pager bookkeeping (`pager`); this is
//! where the two meet.

use log::trace;

use crate::node::{self, MergeDir};
use crate::page;
use crate::pager::Pager;

/// A B+tree rooted at a single page number, 0 meaning "empty, not yet
/// created". The tree itself is stateless besides that root pointer: every
/// other byte lives in pages owned by the `Pager` it's called with.
#[derive(Clone, Copy, Debug, Default)]
pub struct BTree {
    pub root: u64,
}

impl BTree {
    pub fn new(root: u64) -> BTree {
        BTree { root }
    }

    pub fn get(&self, pager: &Pager, key: &[u8]) -> Option<Vec<u8>> {
        if self.root == 0 {
            return None;
        }
        let mut current = pager.get(self.root);
        loop {
            let idx = node::lookup_le(&current, key);
            match page::btype(&current) {
                page::BNODE_LEAF => {
                    if idx < page::nkeys(&current) && page::get_key(&current, idx) == key {
                        return Some(page::get_val(&current, idx).to_vec());
                    }
                    return None;
                }
                page::BNODE_INTERNAL => {
                    let child = page::get_ptr(&current, idx);
                    current = pager.get(child);
                }
                other => panic!("btree get: unexpected node kind {}", other),
            }
        }
    }

    /// Inserts or updates `key` -> `val`. Callers are responsible for the
    /// length validation in the spec's error table; by the time this is
    /// called, `key` and `val` are known to be within bounds.
    pub fn insert(&mut self, pager: &mut Pager, key: &[u8], val: &[u8]) {
        if self.root == 0 {
            let mut root = node::new_page();
            page::set_header(&mut root, page::BNODE_LEAF, 2);
            // Sentinel empty key, smaller than every real key, so
            // `lookup_le` never has to return -1.
            page::append_kv(&mut root, 0, 0, &[], &[]);
            page::append_kv(&mut root, 1, 0, key, val);
            self.root = pager.page_new(root);
            return;
        }

        let old_root = self.root;
        let root_node = pager.get(old_root);
        let updated = self.tree_insert(pager, &root_node, key, val);
        pager.page_del(old_root);

        let parts = node::node_split3(&updated);
        self.root = self.install_split(pager, &parts);
    }

    fn install_split(&self, pager: &mut Pager, parts: &[Vec<u8>]) -> u64 {
        if parts.len() == 1 {
            return pager.page_new(parts[0].clone());
        }
        let mut kid_ptrs = Vec::with_capacity(parts.len());
        for part in parts {
            kid_ptrs.push(pager.page_new(part.clone()));
        }
        let mut new_root = node::new_oversized_page();
        page::set_header(&mut new_root, page::BNODE_INTERNAL, parts.len());
        for (i, (ptr, part)) in kid_ptrs.iter().zip(parts.iter()).enumerate() {
            let sep = page::get_key(part, 0).to_vec();
            page::append_kv(&mut new_root, i, *ptr, &sep, &[]);
        }
        trace!("btree: new root splits into {} children", parts.len());
        pager.page_new(new_root)
    }

    fn tree_insert(&self, pager: &mut Pager, node_buf: &[u8], key: &[u8], val: &[u8]) -> Vec<u8> {
        let idx = node::lookup_le(node_buf, key);
        match page::btype(node_buf) {
            page::BNODE_LEAF => {
                let mut new = node::new_oversized_page();
                if idx < page::nkeys(node_buf) && page::get_key(node_buf, idx) == key {
                    node::leaf_update(&mut new, node_buf, idx, key, val);
                } else {
                    node::leaf_insert(&mut new, node_buf, idx + 1, key, val);
                }
                new
            }
            page::BNODE_INTERNAL => {
                let kid_ptr = page::get_ptr(node_buf, idx);
                let kid_node = pager.get(kid_ptr);
                let updated_kid = self.tree_insert(pager, &kid_node, key, val);
                pager.page_del(kid_ptr);

                let parts = node::node_split3(&updated_kid);
                let mut kids = Vec::with_capacity(parts.len());
                for part in parts {
                    let ptr = pager.page_new(part.clone());
                    kids.push((ptr, part));
                }
                let mut new = node::new_oversized_page();
                node::node_replace_kid_n(&mut new, node_buf, idx, &kids);
                new
            }
            other => panic!("tree_insert: unexpected node kind {}", other),
        }
    }

    /// Deletes `key`. Returns `true` iff the key was present.
    pub fn delete(&mut self, pager: &mut Pager, key: &[u8]) -> bool {
        if self.root == 0 {
            return false;
        }
        let root_node = pager.get(self.root);
        match self.tree_delete(pager, &root_node, key) {
            None => false,
            Some(updated) => {
                pager.page_del(self.root);
                if page::btype(&updated) == page::BNODE_INTERNAL && page::nkeys(&updated) == 1 {
                    // Root collapse: promote the sole child.
                    self.root = page::get_ptr(&updated, 0);
                } else {
                    self.root = pager.page_new(updated);
                }
                true
            }
        }
    }

    /// Returns `None` if `key` was not found anywhere in this subtree
    /// (nothing to do, propagated all the way to the top). Returns
    /// `Some(new_node_image)` otherwise, which may have zero keys if an
    /// internal node's single child collapsed away entirely.
    fn tree_delete(&self, pager: &mut Pager, node_buf: &[u8], key: &[u8]) -> Option<Vec<u8>> {
        let idx = node::lookup_le(node_buf, key);
        match page::btype(node_buf) {
            page::BNODE_LEAF => {
                if idx < page::nkeys(node_buf) && page::get_key(node_buf, idx) == key {
                    let mut new = node::new_page();
                    node::leaf_delete(&mut new, node_buf, idx);
                    Some(new)
                } else {
                    None
                }
            }
            page::BNODE_INTERNAL => {
                let kid_ptr = page::get_ptr(node_buf, idx);
                let kid_node = pager.get(kid_ptr);
                let updated_kid = self.tree_delete(pager, &kid_node, key)?;
                pager.page_del(kid_ptr);

                let sibling_bytes = |ptr: u64| -> usize { page::nbytes(&pager.get(ptr)) };
                let dir = node::should_merge(node_buf, idx, &updated_kid, sibling_bytes);

                let new = match dir {
                    MergeDir::Left => {
                        let left_ptr = page::get_ptr(node_buf, idx - 1);
                        let left_node = pager.get(left_ptr);
                        let mut merged = node::new_page();
                        node::node_merge(&mut merged, &left_node, &updated_kid);
                        pager.page_del(left_ptr);
                        let merged_key = page::get_key(&merged, 0).to_vec();
                        let merged_ptr = pager.page_new(merged);
                        let mut new = node::new_oversized_page();
                        node::node_replace_2kid(&mut new, node_buf, idx - 1, merged_ptr, &merged_key);
                        new
                    }
                    MergeDir::Right => {
                        let right_ptr = page::get_ptr(node_buf, idx + 1);
                        let right_node = pager.get(right_ptr);
                        let mut merged = node::new_page();
                        node::node_merge(&mut merged, &updated_kid, &right_node);
                        pager.page_del(right_ptr);
                        let merged_key = page::get_key(&merged, 0).to_vec();
                        let merged_ptr = pager.page_new(merged);
                        let mut new = node::new_oversized_page();
                        node::node_replace_2kid(&mut new, node_buf, idx, merged_ptr, &merged_key);
                        new
                    }
                    MergeDir::None if page::nkeys(&updated_kid) == 0 => {
                        assert!(
                            page::nkeys(node_buf) == 1 && idx == 0,
                            "tree_delete: empty child with no sibling to absorb it into"
                        );
                        let mut new = node::new_page();
                        page::set_header(&mut new, page::BNODE_INTERNAL, 0);
                        new
                    }
                    MergeDir::None => {
                        let updated_ptr = pager.page_new(updated_kid.clone());
                        let mut new = node::new_oversized_page();
                        node::node_replace_kid_n(&mut new, node_buf, idx, &[(updated_ptr, updated_kid)]);
                        new
                    }
                };
                Some(new)
            }
            other => panic!("tree_delete: unexpected node kind {}", other),
        }
    }
}
