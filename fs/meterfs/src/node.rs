// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::file::File;

/// Mount bindings take identifiers from the upper half of the id space so
/// they never collide with file descriptors.
pub(crate) const MOUNT_ID_BASE: u32 = 0x8000_0000;

/// Exclusive upper bound of the id space; `u32::MAX` is never handed out.
const ID_LIMIT: u32 = u32::MAX;

pub(crate) enum NodeKind {
    File(File),
    Mount(String),
}

/// Cache of open descriptors: an AVL tree keyed by id, augmented with the
/// largest run of free ids on either side of each node. The augmentation is
/// maintained on every insert, remove and rotation, which makes allocating
/// the smallest unused id a single descent instead of a scan.
pub(crate) struct NodeTree {
    root: Link,
    len: usize,
}

struct Node {
    id: u32,
    refs: u32,
    kind: NodeKind,
    height: u8,
    /// Largest run of free ids below `id` within this subtree's id range.
    lmaxgap: u32,
    /// Largest run of free ids above `id` within this subtree's id range.
    rmaxgap: u32,
    left: Link,
    right: Link,
}

type Link = Option<Box<Node>>;

fn height(link: &Link) -> i32 {
    link.as_ref().map_or(0, |node| node.height as i32)
}

/// Recomputes a node's height and gaps from its children. `lo..hi` is the
/// half-open id range this subtree is responsible for; a missing child means
/// the whole range on that side is free.
fn update(node: &mut Node, lo: u32, hi: u32) {
    node.height = (1 + height(&node.left).max(height(&node.right))) as u8;
    node.lmaxgap = match &node.left {
        Some(left) => left.lmaxgap.max(left.rmaxgap),
        None => node.id - lo,
    };
    node.rmaxgap = match &node.right {
        Some(right) => right.lmaxgap.max(right.rmaxgap),
        None => hi - node.id - 1,
    };
}

fn rotate_right(link: &mut Link, lo: u32, hi: u32) {
    if let Some(mut node) = link.take() {
        if let Some(mut pivot) = node.left.take() {
            node.left = pivot.right.take();
            update(&mut node, pivot.id + 1, hi);
            pivot.right = Some(node);
            update(&mut pivot, lo, hi);
            *link = Some(pivot);
        } else {
            *link = Some(node);
        }
    }
}

fn rotate_left(link: &mut Link, lo: u32, hi: u32) {
    if let Some(mut node) = link.take() {
        if let Some(mut pivot) = node.right.take() {
            node.right = pivot.left.take();
            update(&mut node, lo, pivot.id);
            pivot.left = Some(node);
            update(&mut pivot, lo, hi);
            *link = Some(pivot);
        } else {
            *link = Some(node);
        }
    }
}

fn rebalance(link: &mut Link, lo: u32, hi: u32) {
    let Some(node) = link else { return };
    update(node, lo, hi);
    let split = node.id;
    let factor = height(&node.left) - height(&node.right);
    if factor > 1 {
        let double = matches!(&node.left, Some(left) if height(&left.left) < height(&left.right));
        if double {
            rotate_left(&mut node.left, lo, split);
        }
        rotate_right(link, lo, hi);
    } else if factor < -1 {
        let double = matches!(&node.right, Some(right) if height(&right.right) < height(&right.left));
        if double {
            rotate_right(&mut node.right, split + 1, hi);
        }
        rotate_left(link, lo, hi);
    }
}

fn insert_at(link: &mut Link, node: Box<Node>, lo: u32, hi: u32) {
    match link {
        None => {
            *link = Some(node);
            if let Some(node) = link {
                update(node, lo, hi);
            }
            return;
        }
        Some(current) => {
            let split = current.id;
            if node.id < split {
                insert_at(&mut current.left, node, lo, split);
            } else {
                insert_at(&mut current.right, node, split + 1, hi);
            }
        }
    }
    rebalance(link, lo, hi);
}

/// Smallest free id that is `>= from`, or `None` if the range is exhausted.
/// Descends by the gap augmentation; the `from` clamp only forces descent
/// along the single path where it cuts into a subtree's range.
fn first_free_from(link: &Link, lo: u32, hi: u32, from: u32) -> Option<u32> {
    let start = lo.max(from);
    if start >= hi {
        return None;
    }
    let Some(node) = link else {
        return Some(start);
    };
    if start < node.id {
        let left_full = from <= lo && node.lmaxgap == 0;
        if !left_full {
            if let Some(free) = first_free_from(&node.left, lo, node.id, from) {
                return Some(free);
            }
        }
    }
    if from <= node.id + 1 && node.rmaxgap == 0 {
        return None;
    }
    first_free_from(&node.right, node.id + 1, hi, from)
}

fn find(link: &Link, id: u32) -> Option<&Node> {
    let mut link = link;
    loop {
        match link {
            None => return None,
            Some(node) if id < node.id => link = &node.left,
            Some(node) if id > node.id => link = &node.right,
            Some(node) => return Some(node.as_ref()),
        }
    }
}

fn find_mut(mut link: &mut Link, id: u32) -> Option<&mut Node> {
    loop {
        match link {
            None => return None,
            Some(node) => {
                if id < node.id {
                    link = &mut node.left;
                } else if id > node.id {
                    link = &mut node.right;
                } else {
                    return Some(node.as_mut());
                }
            }
        }
    }
}

fn min_id(link: &Link) -> Option<u32> {
    let mut node = link.as_ref()?;
    while let Some(left) = &node.left {
        node = left;
    }
    Some(node.id)
}

/// Recomputes gaps down the leftmost path after the lower range bound moved.
fn refresh_left_spine(link: &mut Link, lo: u32, hi: u32) {
    if let Some(node) = link {
        let split = node.id;
        refresh_left_spine(&mut node.left, lo, split);
        update(node, lo, hi);
    }
}

/// Recomputes gaps down the rightmost path after the upper range bound moved.
fn refresh_right_spine(link: &mut Link, lo: u32, hi: u32) {
    if let Some(node) = link {
        let split = node.id;
        refresh_right_spine(&mut node.right, split + 1, hi);
        update(node, lo, hi);
    }
}

fn remove_at(link: &mut Link, id: u32, lo: u32, hi: u32) -> Option<(u32, NodeKind)> {
    enum Step {
        Left(u32),
        Right(u32),
        SwapSuccessor(u32),
        Unlink,
    }

    let step = {
        let node = link.as_ref()?;
        if id < node.id {
            Step::Left(node.id)
        } else if id > node.id {
            Step::Right(node.id)
        } else if node.left.is_some() && node.right.is_some() {
            Step::SwapSuccessor(min_id(&node.right)?)
        } else {
            Step::Unlink
        }
    };

    let removed = match step {
        Step::Left(split) => {
            let node = link.as_mut()?;
            remove_at(&mut node.left, id, lo, split)?
        }
        Step::Right(split) => {
            let node = link.as_mut()?;
            remove_at(&mut node.right, id, split + 1, hi)?
        }
        Step::SwapSuccessor(successor) => {
            // Move the in-order successor's payload up, then remove its old
            // node; the unwind recomputes gaps with the final bounds. The
            // left subtree's upper bound moved from `id` to `successor`, so
            // its rightmost path is refreshed as well.
            let node = link.as_mut()?;
            let (refs, kind) = remove_at(&mut node.right, successor, successor + 1, hi)?;
            node.id = successor;
            let removed = (
                core::mem::replace(&mut node.refs, refs),
                core::mem::replace(&mut node.kind, kind),
            );
            refresh_right_spine(&mut node.left, lo, successor);
            removed
        }
        Step::Unlink => {
            let node = *link.take()?;
            let Node {
                refs, kind, left, right, ..
            } = node;
            let from_left = left.is_some();
            *link = if from_left { left } else { right };
            if link.is_some() {
                if from_left {
                    refresh_right_spine(link, lo, hi);
                } else {
                    refresh_left_spine(link, lo, hi);
                }
            }
            (refs, kind)
        }
    };
    rebalance(link, lo, hi);
    Some(removed)
}

fn find_file_in(link: &Link, name: &[u8; 8]) -> Option<u32> {
    let node = link.as_ref()?;
    if let Some(id) = find_file_in(&node.left, name) {
        return Some(id);
    }
    if let NodeKind::File(file) = &node.kind {
        if file.header.name == *name {
            return Some(node.id);
        }
    }
    find_file_in(&node.right, name)
}

fn find_mount_in(link: &Link, name: &str) -> Option<u32> {
    let node = link.as_ref()?;
    if let Some(id) = find_mount_in(&node.left, name) {
        return Some(id);
    }
    if let NodeKind::Mount(bound) = &node.kind {
        if bound == name {
            return Some(node.id);
        }
    }
    find_mount_in(&node.right, name)
}

fn any_open_file(link: &Link) -> bool {
    let Some(node) = link.as_ref() else {
        return false;
    };
    let open_here = node.refs > 0 && matches!(node.kind, NodeKind::File(_));
    open_here || any_open_file(&node.left) || any_open_file(&node.right)
}

fn collect_mounts(link: Link, out: &mut Vec<(u32, String)>) {
    if let Some(node) = link {
        let node = *node;
        collect_mounts(node.left, out);
        if let NodeKind::Mount(name) = node.kind {
            out.push((node.id, name));
        }
        collect_mounts(node.right, out);
    }
}

impl NodeTree {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    fn insert(&mut self, id: u32, kind: NodeKind) {
        let node = Box::new(Node {
            id,
            refs: 0,
            kind,
            height: 1,
            lmaxgap: 0,
            rmaxgap: 0,
            left: None,
            right: None,
        });
        insert_at(&mut self.root, node, 0, ID_LIMIT);
        self.len += 1;
    }

    /// Caches a file descriptor under the smallest unused id.
    pub fn insert_file(&mut self, file: File) -> Option<u32> {
        let id = first_free_from(&self.root, 0, ID_LIMIT, 0)?;
        self.insert(id, NodeKind::File(file));
        Some(id)
    }

    /// Binds a sub-mount name under the smallest unused high-half id.
    pub fn insert_mount(&mut self, name: &str) -> Option<u32> {
        let id = first_free_from(&self.root, 0, ID_LIMIT, MOUNT_ID_BASE)?;
        self.insert(id, NodeKind::Mount(name.to_owned()));
        Some(id)
    }

    pub fn file(&self, id: u32) -> Option<&File> {
        match &find(&self.root, id)?.kind {
            NodeKind::File(file) => Some(file),
            NodeKind::Mount(_) => None,
        }
    }

    pub fn file_mut(&mut self, id: u32) -> Option<&mut File> {
        match &mut find_mut(&mut self.root, id)?.kind {
            NodeKind::File(file) => Some(file),
            NodeKind::Mount(_) => None,
        }
    }

    /// Reference count of a file descriptor; mount bindings are not
    /// refcounted and report as absent.
    pub fn refs(&self, id: u32) -> Option<u32> {
        let node = find(&self.root, id)?;
        match node.kind {
            NodeKind::File(_) => Some(node.refs),
            NodeKind::Mount(_) => None,
        }
    }

    pub fn acquire(&mut self, id: u32) -> bool {
        match find_mut(&mut self.root, id) {
            Some(node) if matches!(node.kind, NodeKind::File(_)) => {
                node.refs += 1;
                true
            }
            _ => false,
        }
    }

    /// Drops one reference; the descriptor is evicted when the last one
    /// goes. Only file descriptors are refcounted; the caller must not
    /// release an unreferenced one.
    pub fn release(&mut self, id: u32) -> Option<u32> {
        let node = find_mut(&mut self.root, id)?;
        if matches!(node.kind, NodeKind::Mount(_)) {
            return None;
        }
        node.refs -= 1;
        let remaining = node.refs;
        if remaining == 0 {
            self.remove(id);
        }
        Some(remaining)
    }

    pub fn remove(&mut self, id: u32) -> bool {
        let removed = remove_at(&mut self.root, id, 0, ID_LIMIT).is_some();
        if removed {
            self.len -= 1;
        }
        removed
    }

    pub fn find_file(&self, name: &[u8; 8]) -> Option<u32> {
        find_file_in(&self.root, name)
    }

    pub fn find_mount(&self, name: &str) -> Option<u32> {
        find_mount_in(&self.root, name)
    }

    pub fn any_open(&self) -> bool {
        any_open_file(&self.root)
    }

    /// Evicts every file descriptor; mount bindings survive.
    pub fn clear_files(&mut self) {
        let mut mounts = Vec::new();
        collect_mounts(self.root.take(), &mut mounts);
        self.len = 0;
        for (id, name) in mounts {
            self.insert(id, NodeKind::Mount(name));
        }
    }
}
