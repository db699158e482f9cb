//! Pure B+tree node algorithms: lookup, leaf mutation, split, merge, and
//! child-link replacement. Everything here works over owned page-sized
//! buffers; none of it knows about page numbers, the pager, or the file.

use crate::page::{
    append_kv, append_range, btype, get_key, nbytes, nkeys, set_header, BNODE_INTERNAL,
    BNODE_LEAF, PAGE_SIZE,
};

/// A freshly allocated, zeroed page-sized buffer to build a node into.
pub fn new_page() -> Vec<u8> {
    vec![0u8; PAGE_SIZE]
}

/// A buffer sized for two pages, used as scratch space for the left half of
/// a split in case it still doesn't fit and needs splitting again, and for
/// any intermediate node the tree driver builds before it has been split
/// down to page size.
pub fn new_oversized_page() -> Vec<u8> {
    vec![0u8; 2 * PAGE_SIZE]
}

/// Returns the greatest index `i` such that `key(i) <= target`. Never
/// returns an out-of-range index: it saturates at `nkeys - 1` for a target
/// beyond every key, and returns `0` for a target at or below the sentinel.
pub fn lookup_le(node: &[u8], key: &[u8]) -> usize {
    let n = nkeys(node);
    assert!(n > 0, "lookup_le: empty node");
    // Linear scan is explicitly permitted by the spec; `n` is bounded by
    // what fits in one page, so this never dominates.
    let mut found = 0usize;
    for i in 0..n {
        if get_key(node, i) <= key {
            found = i;
        } else {
            break;
        }
    }
    found
}

pub fn leaf_insert(new: &mut [u8], old: &[u8], idx: usize, key: &[u8], val: &[u8]) {
    let n = nkeys(old);
    set_header(new, BNODE_LEAF, n + 1);
    append_range(new, old, 0, 0, idx);
    append_kv(new, idx, 0, key, val);
    append_range(new, old, idx + 1, idx, n - idx);
}

pub fn leaf_update(new: &mut [u8], old: &[u8], idx: usize, key: &[u8], val: &[u8]) {
    let n = nkeys(old);
    set_header(new, BNODE_LEAF, n);
    append_range(new, old, 0, 0, idx);
    append_kv(new, idx, 0, key, val);
    append_range(new, old, idx + 1, idx + 1, n - idx - 1);
}

pub fn leaf_delete(new: &mut [u8], old: &[u8], idx: usize) {
    let n = nkeys(old);
    set_header(new, BNODE_LEAF, n - 1);
    append_range(new, old, 0, 0, idx);
    append_range(new, old, idx, idx + 1, n - (idx + 1));
}

/// Merges two sibling nodes of the same kind into `new`.
pub fn node_merge(new: &mut [u8], left: &[u8], right: &[u8]) {
    let nl = nkeys(left);
    let nr = nkeys(right);
    set_header(new, btype(left), nl + nr);
    append_range(new, left, 0, 0, nl);
    append_range(new, right, nl, 0, nr);
}

fn built_bytes(kind: u16, old: &[u8], src_start: usize, n: usize) -> usize {
    let mut buf = new_oversized_page();
    set_header(&mut buf, kind, n);
    append_range(&mut buf, old, 0, src_start, n);
    nbytes(&buf)
}

/// Splits an oversized node into exactly two page-sized nodes. `left` is
/// allocated oversized by the caller in case a further split is needed.
pub fn node_split2(left: &mut Vec<u8>, right: &mut Vec<u8>, old: &[u8]) {
    let n = nkeys(old);
    assert!(n >= 2, "node_split2: node too small to split");
    let kind = btype(old);

    let mut nleft = n / 2;
    while nleft > 1 && built_bytes(kind, old, 0, nleft) > PAGE_SIZE {
        nleft -= 1;
    }
    while nleft < n - 1 && built_bytes(kind, old, nleft, n - nleft) > PAGE_SIZE {
        nleft += 1;
    }
    assert!(nleft >= 1 && nleft < n, "node_split2: degenerate split");

    *left = new_oversized_page();
    set_header(left, kind, nleft);
    append_range(left, old, 0, 0, nleft);

    *right = new_page();
    set_header(right, kind, n - nleft);
    append_range(right, old, 0, nleft, n - nleft);
}

/// Splits `old` into 1, 2, or 3 page-sized nodes, as few as fit.
pub fn node_split3(old: &[u8]) -> Vec<Vec<u8>> {
    if nbytes(old) <= PAGE_SIZE {
        let mut single = old.to_vec();
        single.resize(PAGE_SIZE, 0);
        return vec![single];
    }

    let mut left = new_oversized_page();
    let mut right = new_page();
    node_split2(&mut left, &mut right, old);

    if nbytes(&left) <= PAGE_SIZE {
        left.truncate(PAGE_SIZE);
        return vec![left, right];
    }

    // The left half is still too big (a pathologically uneven key layout);
    // split it once more and keep the right half as-is.
    let mut left_left = new_oversized_page();
    let mut middle = new_page();
    node_split2(&mut left_left, &mut middle, &left);
    assert!(
        nbytes(&left_left) <= PAGE_SIZE,
        "node_split3: left still oversized after resplit"
    );
    left_left.truncate(PAGE_SIZE);
    vec![left_left, middle, right]
}

/// Replaces slot `idx` of an internal node with the 1-3 children in `kids`,
/// each given as `(child_page_no, child_page_image)`. The separator key
/// installed for each new slot is the first key of the corresponding child.
pub fn node_replace_kid_n(new: &mut [u8], old: &[u8], idx: usize, kids: &[(u64, Vec<u8>)]) {
    let n = nkeys(old);
    set_header(new, BNODE_INTERNAL, n + kids.len() - 1);
    append_range(new, old, 0, 0, idx);
    for (i, (ptr, kid)) in kids.iter().enumerate() {
        let key = get_key(kid, 0).to_vec();
        append_kv(new, idx + i, *ptr, &key, &[]);
    }
    append_range(new, old, idx + kids.len(), idx + 1, n - (idx + 1));
}

/// Replaces two adjacent internal slots (`idx`, `idx+1`) with one merged
/// child.
pub fn node_replace_2kid(new: &mut [u8], old: &[u8], idx: usize, merged_ptr: u64, key: &[u8]) {
    let n = nkeys(old);
    set_header(new, BNODE_INTERNAL, n - 1);
    append_range(new, old, 0, 0, idx);
    append_kv(new, idx, merged_ptr, key, &[]);
    append_range(new, old, idx + 2, idx + 1, n - (idx + 2));
}

/// Direction a merge should take, as returned by `should_merge`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MergeDir {
    Left,
    None,
    Right,
}

/// Decides whether `updated` (the new image of the child at `idx`) should
/// be merged with a sibling, given `node`, the (old) parent it lives under.
/// `sibling_bytes` fetches the byte size of a sibling page by pointer; the
/// caller supplies it so this stays a pure function of sizes, not a pager
/// client.
pub fn should_merge(
    node: &[u8],
    idx: usize,
    updated: &[u8],
    sibling_bytes: impl Fn(u64) -> usize,
) -> MergeDir {
    if nbytes(updated) > PAGE_SIZE / 4 {
        return MergeDir::None;
    }
    const HEADER_OVERLAP: usize = 4;
    if idx > 0 {
        let sibling_ptr = crate::page::get_ptr(node, idx - 1);
        let merged = sibling_bytes(sibling_ptr) + nbytes(updated) - HEADER_OVERLAP;
        if merged <= PAGE_SIZE {
            return MergeDir::Left;
        }
    }
    if idx + 1 < nkeys(node) {
        let sibling_ptr = crate::page::get_ptr(node, idx + 1);
        let merged = sibling_bytes(sibling_ptr) + nbytes(updated) - HEADER_OVERLAP;
        if merged <= PAGE_SIZE {
            return MergeDir::Right;
        }
    }
    MergeDir::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{get_key, get_val, nkeys, set_header, BNODE_LEAF};

    fn leaf_with(pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
        // Backed by the oversized scratch buffer so tests feeding more than
        // a page's worth of kv pairs don't panic in `append_kv` before
        // reaching their own over-page-size assertions.
        let mut buf = new_oversized_page();
        set_header(&mut buf, BNODE_LEAF, pairs.len());
        for (i, (k, v)) in pairs.iter().enumerate() {
            append_kv(&mut buf, i, 0, k, v);
        }
        buf
    }

    #[test]
    fn lookup_le_finds_greatest_not_exceeding() {
        let leaf = leaf_with(&[(b"a", b"1"), (b"c", b"2"), (b"e", b"3")]);
        assert_eq!(lookup_le(&leaf, b"b"), 0);
        assert_eq!(lookup_le(&leaf, b"c"), 1);
        assert_eq!(lookup_le(&leaf, b"z"), 2);
        assert_eq!(lookup_le(&leaf, b"a"), 0);
    }

    #[test]
    fn leaf_insert_shifts_right() {
        let old = leaf_with(&[(b"a", b"1"), (b"c", b"2")]);
        let mut new = new_page();
        leaf_insert(&mut new, &old, 1, b"b", b"9");
        assert_eq!(nkeys(&new), 3);
        assert_eq!(get_key(&new, 0), b"a");
        assert_eq!(get_key(&new, 1), b"b");
        assert_eq!(get_val(&new, 1), b"9");
        assert_eq!(get_key(&new, 2), b"c");
    }

    #[test]
    fn leaf_update_preserves_count() {
        let old = leaf_with(&[(b"a", b"1"), (b"b", b"2")]);
        let mut new = new_page();
        leaf_update(&mut new, &old, 1, b"b", b"99");
        assert_eq!(nkeys(&new), 2);
        assert_eq!(get_val(&new, 1), b"99");
    }

    #[test]
    fn leaf_delete_removes_slot() {
        let old = leaf_with(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        let mut new = new_page();
        leaf_delete(&mut new, &old, 1);
        assert_eq!(nkeys(&new), 2);
        assert_eq!(get_key(&new, 0), b"a");
        assert_eq!(get_key(&new, 1), b"c");
    }

    #[test]
    fn node_merge_concatenates() {
        let left = leaf_with(&[(b"a", b"1")]);
        let right = leaf_with(&[(b"b", b"2"), (b"c", b"3")]);
        let mut merged = new_page();
        node_merge(&mut merged, &left, &right);
        assert_eq!(nkeys(&merged), 3);
        assert_eq!(get_key(&merged, 2), b"c");
    }

    #[test]
    fn node_split3_fits_when_small() {
        let leaf = leaf_with(&[(b"a", b"1")]);
        let split = node_split3(&leaf);
        assert_eq!(split.len(), 1);
    }

    #[test]
    fn node_split3_splits_oversized_leaf() {
        let val = vec![b'x'; 900];
        let mut keys = Vec::new();
        for i in 0..10u32 {
            keys.push(format!("key-{:03}", i).into_bytes());
        }
        let mut pairs = Vec::new();
        for k in &keys {
            pairs.push((k.as_slice(), val.as_slice()));
        }
        let leaf = leaf_with(&pairs);
        assert!(nbytes(&leaf) > PAGE_SIZE);
        let split = node_split3(&leaf);
        assert!(split.len() == 2 || split.len() == 3);
        for part in &split {
            assert!(nbytes(part) <= PAGE_SIZE);
        }
        let total: usize = split.iter().map(|p| nkeys(p)).sum();
        assert_eq!(total, pairs.len());
    }

    #[test]
    fn should_merge_prefers_left_sibling() {
        let left = leaf_with(&[(b"a", b"1")]);
        let mid = leaf_with(&[(b"b", b"2")]);
        let right = leaf_with(&[(b"c", b"3")]);
        let mut parent = new_page();
        set_header(&mut parent, BNODE_INTERNAL, 3);
        append_kv(&mut parent, 0, 1, b"a", &[]);
        append_kv(&mut parent, 1, 2, b"b", &[]);
        append_kv(&mut parent, 2, 3, b"c", &[]);
        let sizes = |ptr: u64| -> usize {
            match ptr {
                1 => nbytes(&left),
                3 => nbytes(&right),
                _ => panic!("unexpected ptr"),
            }
        };
        let dir = should_merge(&parent, 1, &mid, sizes);
        assert_eq!(dir, MergeDir::Left);
    }
}
