//! Property discrimination trie.
//!
//! The trie narrows the candidate set for one record from "every registered
//! class" to "classes whose index properties the record actually carries".
//! Nodes are keyed by property id; a sibling chain (`next`) lists the
//! alternative properties at one conjunction depth in ascending id order, and
//! a child chain (`down`) continues a conjunction with its next required
//! property. A class's descriptor is anchored at the node where its index
//! property list terminates. Classes with no index properties live in the
//! escape list and are candidates for every record.
//!
//! The trie is a rebuildable cache over the live class set: it can always be
//! reconstructed from the catalog, so recovery never depends on it.
//!
//! Nodes live in an arena and reference each other by index, with a free
//! list for recycled slots; tearing down or rebuilding the structure never
//! chases pointers.

use std::sync::Arc;

use taxodb_proto::PropertyId;

use crate::class::{ClassDescriptor, ClassId};
use crate::error::Error;

/// Sentinel for "no node".
const NIL: u32 = u32::MAX;

#[derive(Debug)]
struct TrieNode {
    prop: PropertyId,
    /// Alternative property at the same depth, ascending id order.
    next: u32,
    /// Next required property of a longer conjunction.
    down: u32,
    /// Classes whose index property list terminates here.
    classes: Vec<Arc<ClassDescriptor>>,
}

/// Where a node id is stored: the root slot, a parent's `down`, or a
/// sibling's `next`. Recording these during descent lets removal relink
/// chains without parent pointers.
#[derive(Debug, Clone, Copy)]
enum Link {
    Root,
    Down(u32),
    Next(u32),
}

/// In-memory discrimination trie over class index properties.
pub struct PropertyDiscriminationIndex {
    nodes: Vec<TrieNode>,
    free: Vec<u32>,
    root: u32,
    /// Escape list: classes with no index properties.
    other: Vec<Arc<ClassDescriptor>>,
    n_classes: usize,
}

impl PropertyDiscriminationIndex {
    /// Create an empty trie.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: NIL,
            other: Vec::new(),
            n_classes: 0,
        }
    }

    /// Number of classes anchored in the trie or escape list.
    pub fn len(&self) -> usize {
        self.n_classes
    }

    /// Whether no classes are registered.
    pub fn is_empty(&self) -> bool {
        self.n_classes == 0
    }

    /// Insert a descriptor, anchoring it by its index property list.
    ///
    /// Returns true when a new anchoring was created, false when a
    /// descriptor with the same class id was already anchored there.
    pub fn add(&mut self, descriptor: Arc<ClassDescriptor>) -> Result<bool, Error> {
        let props: Vec<PropertyId> = descriptor.index_props().to_vec();
        if props.is_empty() {
            if self.other.iter().any(|c| c.id() == descriptor.id()) {
                return Ok(false);
            }
            self.other
                .try_reserve(1)
                .map_err(|_| Error::ResourceExhausted("escape list growth"))?;
            self.other.push(descriptor);
            self.n_classes += 1;
            return Ok(true);
        }

        let mut link = Link::Root;
        let mut node = NIL;
        for prop in props {
            node = self.find_or_create(link, prop)?;
            link = Link::Down(node);
        }
        let anchored = &mut self.nodes[node as usize].classes;
        if anchored.iter().any(|c| c.id() == descriptor.id()) {
            return Ok(false);
        }
        anchored
            .try_reserve(1)
            .map_err(|_| Error::ResourceExhausted("trie anchor growth"))?;
        anchored.push(descriptor);
        self.n_classes += 1;
        Ok(true)
    }

    /// Remove a class's anchoring and prune nodes that no longer carry
    /// anything.
    ///
    /// A node is freed only when it anchors no classes and has no children;
    /// a prefix shared with a shorter class survives deletion of the longer
    /// one.
    pub fn remove(&mut self, id: ClassId, props: &[PropertyId]) -> Result<(), Error> {
        if props.is_empty() {
            if let Some(pos) = self.other.iter().position(|c| c.id() == id) {
                self.other.remove(pos);
                self.n_classes -= 1;
            }
            return Ok(());
        }

        // Walk the exact path, recording the link that points at each node.
        let mut path: Vec<(Link, u32)> = Vec::with_capacity(props.len());
        let mut link = Link::Root;
        for &prop in props {
            let Some(node) = self.find_in_chain(link, prop) else {
                return Ok(()); // not anchored; nothing to remove
            };
            path.push((self.link_to(link, node), node));
            link = Link::Down(node);
        }

        let (_, terminal) = *path.last().expect("non-empty property list");
        let anchored = &mut self.nodes[terminal as usize].classes;
        let Some(pos) = anchored.iter().position(|c| c.id() == id) else {
            return Ok(());
        };
        anchored.remove(pos);
        self.n_classes -= 1;

        // Prune bottom-up while nodes are empty leaves.
        for &(link, node) in path.iter().rev() {
            let n = &self.nodes[node as usize];
            if !n.classes.is_empty() || n.down != NIL {
                break;
            }
            let next = n.next;
            self.set_link(link, next);
            self.release(node);
        }
        Ok(())
    }

    /// The anchored descriptor for a class, if present under exactly this
    /// property list. Used to keep every part of the engine sharing one
    /// descriptor instance per class.
    pub fn descriptor_of(
        &self,
        id: ClassId,
        props: &[PropertyId],
    ) -> Option<Arc<ClassDescriptor>> {
        if props.is_empty() {
            return self.other.iter().find(|c| c.id() == id).cloned();
        }
        let mut link = Link::Root;
        let mut node = NIL;
        for &prop in props {
            node = self.find_in_chain(link, prop)?;
            link = Link::Down(node);
        }
        self.nodes[node as usize]
            .classes
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// Whether a class is anchored under exactly this property list.
    pub fn contains(&self, id: ClassId, props: &[PropertyId]) -> bool {
        if props.is_empty() {
            return self.other.iter().any(|c| c.id() == id);
        }
        let mut link = Link::Root;
        let mut node = NIL;
        for &prop in props {
            match self.find_in_chain(link, prop) {
                Some(n) => {
                    node = n;
                    link = Link::Down(n);
                }
                None => return false,
            }
        }
        self.nodes[node as usize].classes.iter().any(|c| c.id() == id)
    }

    /// Lazily enumerate the candidate classes for a record's sorted property
    /// ids: every anchored class list reached by the merge-walk, then the
    /// escape list. No predicate evaluation happens here; candidates are
    /// narrowed by property presence only.
    pub fn candidates<'a>(&'a self, props: &'a [PropertyId]) -> Candidates<'a> {
        debug_assert!(props.windows(2).all(|w| w[0] < w[1]));
        let mut stack = Vec::new();
        if self.root != NIL && !props.is_empty() {
            stack.push((self.root, 0usize));
        }
        Candidates {
            trie: self,
            props,
            stack,
            other_done: false,
        }
    }

    fn head(&self, link: Link) -> u32 {
        match link {
            Link::Root => self.root,
            Link::Down(n) => self.nodes[n as usize].down,
            Link::Next(n) => self.nodes[n as usize].next,
        }
    }

    fn set_link(&mut self, link: Link, target: u32) {
        match link {
            Link::Root => self.root = target,
            Link::Down(n) => self.nodes[n as usize].down = target,
            Link::Next(n) => self.nodes[n as usize].next = target,
        }
    }

    /// Find `prop` in the sibling chain headed at `link`, or splice in a new
    /// node keeping the chain sorted.
    fn find_or_create(&mut self, head: Link, prop: PropertyId) -> Result<u32, Error> {
        let mut link = head;
        loop {
            let cur = self.head(link);
            if cur == NIL || self.nodes[cur as usize].prop > prop {
                let id = self.alloc(prop, cur)?;
                self.set_link(link, id);
                return Ok(id);
            }
            if self.nodes[cur as usize].prop == prop {
                return Ok(cur);
            }
            link = Link::Next(cur);
        }
    }

    /// Find `prop` in the sibling chain headed at `link` without mutating.
    fn find_in_chain(&self, head: Link, prop: PropertyId) -> Option<u32> {
        let mut cur = self.head(head);
        while cur != NIL {
            let n = &self.nodes[cur as usize];
            if n.prop == prop {
                return Some(cur);
            }
            if n.prop > prop {
                return None;
            }
            cur = n.next;
        }
        None
    }

    /// The link that points directly at `node`, given the head link of its
    /// sibling chain.
    fn link_to(&self, head: Link, node: u32) -> Link {
        let mut link = head;
        loop {
            let cur = self.head(link);
            assert_ne!(cur, NIL, "node must be reachable from its chain head");
            if cur == node {
                return link;
            }
            link = Link::Next(cur);
        }
    }

    fn alloc(&mut self, prop: PropertyId, next: u32) -> Result<u32, Error> {
        if let Some(id) = self.free.pop() {
            self.nodes[id as usize] = TrieNode {
                prop,
                next,
                down: NIL,
                classes: Vec::new(),
            };
            return Ok(id);
        }
        self.nodes
            .try_reserve(1)
            .map_err(|_| Error::ResourceExhausted("trie node arena growth"))?;
        let id = self.nodes.len() as u32;
        self.nodes.push(TrieNode {
            prop,
            next,
            down: NIL,
            classes: Vec::new(),
        });
        Ok(id)
    }

    fn release(&mut self, node: u32) {
        self.nodes[node as usize].classes = Vec::new();
        self.nodes[node as usize].down = NIL;
        self.nodes[node as usize].next = NIL;
        self.free.push(node);
    }
}

impl Default for PropertyDiscriminationIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Restartable, lazy enumeration of candidate class lists for one record.
///
/// A merge-join between the record's sorted property ids and the sorted
/// sibling chains: candidate generation costs O(|record properties| +
/// |matching trie nodes|), independent of the number of registered classes.
pub struct Candidates<'a> {
    trie: &'a PropertyDiscriminationIndex,
    props: &'a [PropertyId],
    /// DFS frames: (sibling-chain cursor, property cursor).
    stack: Vec<(u32, usize)>,
    other_done: bool,
}

impl<'a> Iterator for Candidates<'a> {
    type Item = &'a [Arc<ClassDescriptor>];

    fn next(&mut self) -> Option<Self::Item> {
        let trie = self.trie;
        while let Some(frame) = self.stack.last_mut() {
            let (node, idx) = *frame;
            if node == NIL || idx >= self.props.len() {
                self.stack.pop();
                continue;
            }
            let n = &trie.nodes[node as usize];
            if n.prop < self.props[idx] {
                // The record never asked about this property; skip the node.
                frame.0 = n.next;
            } else if n.prop > self.props[idx] {
                // The trie never asked about this property; skip it.
                frame.1 += 1;
            } else {
                // Exact match: continue this level past the match, descend
                // into longer conjunctions first.
                *frame = (n.next, idx + 1);
                if n.down != NIL && idx + 1 < self.props.len() {
                    self.stack.push((n.down, idx + 1));
                }
                if !n.classes.is_empty() {
                    return Some(&n.classes);
                }
            }
        }
        if !self.other_done {
            self.other_done = true;
            if !trie.other.is_empty() {
                return Some(&trie.other);
            }
        }
        None
    }
}
