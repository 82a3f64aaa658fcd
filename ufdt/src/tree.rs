// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Unflattened device tree.
//!
//! A [`Ufdt`] owns a [`NodePool`] holding every node of the tree. Subtree nodes keep an ordered
//! list of children (properties and subnodes interleaved in insertion order) and property nodes
//! keep their value bytes. The tree also keeps an index from phandle values to the nodes that
//! carry them.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::fdt::Error;
use crate::fdt::FdtReserveEntry;
use crate::fdt::Result;
use crate::pool::NodeId;
use crate::pool::NodePool;
use crate::propval::write_cell;
use crate::propval::FromFdtPropval;
use crate::propval::ToFdtPropval;

pub const PHANDLE_PROP: &str = "phandle";
pub const LINUX_PHANDLE_PROP: &str = "linux,phandle";
const ALIASES_NODE: &str = "aliases";
const PATH_SEP: char = '/';

fn is_phandle_prop(name: &str) -> bool {
    name == PHANDLE_PROP || name == LINUX_PHANDLE_PROP
}

/// Kind of a node, named after the FDT token that introduces it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    BeginNode,
    Prop,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum NodeKind {
    Subtree(Vec<NodeId>),
    Property(Vec<u8>),
}

/// A subtree node or a property node.
#[derive(Clone, Debug)]
pub struct Node {
    name: String,
    parent: Option<NodeId>,
    kind: NodeKind,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exact name comparison: `"uart"` does not match a node named `"uart@1000"`.
    pub fn name_eq(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn tag(&self) -> Tag {
        match self.kind {
            NodeKind::Subtree(_) => Tag::BeginNode,
            NodeKind::Property(_) => Tag::Prop,
        }
    }

    pub fn is_subtree(&self) -> bool {
        self.tag() == Tag::BeginNode
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in insertion order. Always empty for a property.
    pub fn children(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Subtree(children) => children,
            NodeKind::Property(_) => &[],
        }
    }

    /// Value of a property node. `None` for a subtree node.
    pub fn prop_data(&self) -> Option<&[u8]> {
        match &self.kind {
            NodeKind::Property(data) => Some(data),
            NodeKind::Subtree(_) => None,
        }
    }
}

/// A subtree removed from a tree, owning its names and values.
///
/// Used to move content between trees, or within one tree, without sharing pool handles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DetachedNode {
    Property {
        name: String,
        data: Vec<u8>,
    },
    Subtree {
        name: String,
        children: Vec<DetachedNode>,
    },
}

impl DetachedNode {
    pub fn name(&self) -> &str {
        match self {
            DetachedNode::Property { name, .. } | DetachedNode::Subtree { name, .. } => name,
        }
    }
}

/// Unflattened device tree with a phandle index.
#[derive(Debug)]
pub struct Ufdt {
    pool: NodePool<Node>,
    root: NodeId,
    phandles: BTreeMap<u32, NodeId>,
    pub(crate) reserved_memory: Vec<FdtReserveEntry>,
    pub(crate) boot_cpuid_phys: u32,
}

impl Default for Ufdt {
    fn default() -> Self {
        Self::new()
    }
}

impl Ufdt {
    /// Creates a tree holding only an empty root node.
    pub fn new() -> Self {
        let mut pool = NodePool::new();
        let root = pool.alloc(Node {
            name: String::new(),
            parent: None,
            kind: NodeKind::Subtree(Vec::new()),
        });
        Ufdt {
            pool,
            root,
            phandles: BTreeMap::new(),
            reserved_memory: Vec::new(),
            boot_cpuid_phys: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.pool.get(id)
    }

    /// Number of live nodes, attached or not.
    pub fn node_count(&self) -> usize {
        self.pool.len()
    }

    pub fn reserved_memory(&self) -> &[FdtReserveEntry] {
        &self.reserved_memory
    }

    pub fn set_reserved_memory(&mut self, entries: Vec<FdtReserveEntry>) {
        self.reserved_memory = entries;
    }

    /// Allocates an unattached subtree node.
    pub fn construct_subnode(&mut self, name: &str) -> NodeId {
        self.pool.alloc(Node {
            name: name.to_owned(),
            parent: None,
            kind: NodeKind::Subtree(Vec::new()),
        })
    }

    /// Allocates an unattached property node.
    pub fn construct_property(&mut self, name: &str, data: Vec<u8>) -> NodeId {
        self.pool.alloc(Node {
            name: name.to_owned(),
            parent: None,
            kind: NodeKind::Property(data),
        })
    }

    /// Appends `child` to the children of `parent` and indexes any phandles it brings along.
    ///
    /// `parent` must be a subtree node and `child` must not already be attached.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let child_node = self.node(child).ok_or(Error::StaleNode)?;
        if child == self.root {
            return Err(Error::RootNode);
        }
        // A parentless node can only be above `parent` if it has children of its own.
        let may_enclose_parent = child == parent
            || (!child_node.children().is_empty() && self.is_ancestor_or_self(child, parent));
        if child_node.parent.is_some() || may_enclose_parent {
            return Err(Error::AlreadyAttached(child_node.name.clone()));
        }
        let child_is_phandle = child_node.tag() == Tag::Prop && is_phandle_prop(&child_node.name);
        let old_phandle = self.get_phandle(parent);

        self.attach(parent, child)?;

        if child_is_phandle {
            self.reindex_phandle(parent, old_phandle);
        } else {
            for node in self.subtree_nodes(child) {
                self.reindex_phandle(node, 0);
            }
        }
        Ok(())
    }

    /// Appends a node fresh from `construct_subnode` or `construct_property` to an attached
    /// `parent`, skipping the checks of `add_child` that cannot fail for such a node.
    pub(crate) fn append_new(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let child_is_phandle = self
            .node(child)
            .map_or(false, |c| c.tag() == Tag::Prop && is_phandle_prop(&c.name));
        let old_phandle = if child_is_phandle {
            self.get_phandle(parent)
        } else {
            0
        };
        self.attach(parent, child)?;
        if child_is_phandle {
            if old_phandle != 0 && self.phandles.get(&old_phandle) == Some(&parent) {
                self.phandles.remove(&old_phandle);
            }
            let phandle = self.get_phandle(parent);
            if phandle != 0 {
                self.phandles.insert(phandle, parent);
            }
        }
        Ok(())
    }

    fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let parent_node = self.pool.get_mut(parent).ok_or(Error::StaleNode)?;
        match &mut parent_node.kind {
            NodeKind::Subtree(children) => children.push(child),
            NodeKind::Property(_) => return Err(Error::NotASubtree(parent_node.name.clone())),
        }
        if let Some(child_node) = self.pool.get_mut(child) {
            child_node.parent = Some(parent);
        }
        Ok(())
    }

    fn is_ancestor_or_self(&self, ancestor: NodeId, mut node: NodeId) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match self.node(node).and_then(Node::parent) {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    fn find_child(&self, node: NodeId, name: &str, tag: Tag) -> Option<NodeId> {
        self.node(node)?.children().iter().copied().find(|&child| {
            self.node(child)
                .map_or(false, |c| c.tag() == tag && c.name_eq(name))
        })
    }

    fn children_with(&self, node: NodeId, tag: Tag) -> impl Iterator<Item = NodeId> + '_ {
        self.node(node)
            .map(Node::children)
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(move |&child| self.node(child).map_or(false, |c| c.tag() == tag))
    }

    pub fn get_subnode_by_name(&self, node: NodeId, name: &str) -> Option<NodeId> {
        self.find_child(node, name, Tag::BeginNode)
    }

    pub fn get_property_by_name(&self, node: NodeId, name: &str) -> Option<NodeId> {
        self.find_child(node, name, Tag::Prop)
    }

    /// Subnodes of `node`, in order.
    pub fn subnodes(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children_with(node, Tag::BeginNode)
    }

    /// Properties of `node`, in order.
    pub fn properties(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children_with(node, Tag::Prop)
    }

    /// `node` and every subtree node below it, in pre-order.
    pub fn subtree_nodes(&self, node: NodeId) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        let mut pending = vec![node];
        while let Some(id) = pending.pop() {
            if self.node(id).map_or(true, |n| !n.is_subtree()) {
                continue;
            }
            nodes.push(id);
            let mut subnodes: Vec<NodeId> = self.subnodes(id).collect();
            subnodes.reverse();
            pending.extend(subnodes);
        }
        nodes
    }

    /// Follows a `/`-separated path down from `node`.
    ///
    /// Empty segments are skipped, so `"/a/b"`, `"a/b"` and `"a//b/"` are equivalent. Returns
    /// `None` as soon as a segment does not name a subnode.
    pub fn get_node_by_path(&self, node: NodeId, path: &str) -> Option<NodeId> {
        path.split(PATH_SEP)
            .filter(|segment| !segment.is_empty())
            .try_fold(node, |current, segment| {
                self.get_subnode_by_name(current, segment)
            })
    }

    /// Looks up a node from the root.
    ///
    /// An absolute path starts with `/`. Anything else starts with an alias name from
    /// `/aliases`, optionally followed by `/` and a path relative to the aliased node.
    pub fn get_node(&self, path: &str) -> Option<NodeId> {
        if path.starts_with(PATH_SEP) {
            return self.get_node_by_path(self.root, path);
        }
        let (alias, rest) = path.split_once(PATH_SEP).unwrap_or((path, ""));
        let aliases = self.get_subnode_by_name(self.root, ALIASES_NODE)?;
        let target: String = self.get_prop(aliases, alias)?;
        // Aliases must hold absolute paths.
        if !target.starts_with(PATH_SEP) {
            return None;
        }
        let node = self.get_node_by_path(self.root, &target)?;
        self.get_node_by_path(node, rest)
    }

    /// Full path of an attached node, `None` for a node not reachable from the root.
    pub fn path_of(&self, node: NodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = node;
        while let Some(parent) = self.node(current)?.parent {
            names.push(self.node(current)?.name());
            current = parent;
        }
        if current != self.root {
            return None;
        }
        if names.is_empty() {
            return Some(PATH_SEP.to_string());
        }
        Some(names.iter().rev().fold(String::new(), |mut path, name| {
            path.push(PATH_SEP);
            path.push_str(name);
            path
        }))
    }

    pub fn get_fdt_prop_data(&self, prop: NodeId) -> Option<&[u8]> {
        self.node(prop)?.prop_data()
    }

    /// Value of the property `name` of `node`.
    pub fn get_prop_data(&self, node: NodeId, name: &str) -> Option<&[u8]> {
        self.get_fdt_prop_data(self.get_property_by_name(node, name)?)
    }

    /// Value of the property `name` of `node`, converted to `T`.
    pub fn get_prop<T: FromFdtPropval>(&self, node: NodeId, name: &str) -> Option<T> {
        T::from_propval(self.get_prop_data(node, name)?)
    }

    /// Sets the property `name` of `node`, replacing the value in place if the property exists.
    pub fn set_prop<T: ToFdtPropval>(&mut self, node: NodeId, name: &str, val: T) -> Result<NodeId> {
        let data = val.to_propval()?;
        let old_phandle = self.get_phandle(node);
        let prop = match self.get_property_by_name(node, name) {
            Some(prop) => {
                if let Some(Node {
                    kind: NodeKind::Property(value),
                    ..
                }) = self.pool.get_mut(prop)
                {
                    *value = data;
                }
                prop
            }
            None => {
                let prop = self.construct_property(name, data);
                if let Err(e) = self.attach(node, prop) {
                    self.pool.release(prop);
                    return Err(e);
                }
                prop
            }
        };
        if is_phandle_prop(name) {
            self.reindex_phandle(node, old_phandle);
        }
        Ok(prop)
    }

    /// Overwrites the cell at byte `offset` of the property node `prop`.
    pub(crate) fn write_prop_cell(&mut self, prop: NodeId, offset: usize, value: u32) -> Result<()> {
        let node = self.node(prop).ok_or(Error::StaleNode)?;
        let name = node.name.clone();
        let parent = node.parent;
        let old_phandle = parent.map_or(0, |p| self.get_phandle(p));
        let data = match self.pool.get_mut(prop).map(|n| &mut n.kind) {
            Some(NodeKind::Property(data)) => data,
            _ => return Err(Error::InvalidFixup(name)),
        };
        write_cell(data, offset, value).ok_or_else(|| {
            Error::InvalidFixup(format!("{}: offset {} out of range", name, offset))
        })?;
        if let Some(parent) = parent.filter(|_| is_phandle_prop(&name)) {
            self.reindex_phandle(parent, old_phandle);
        }
        Ok(())
    }

    /// Phandle of `node` from its `phandle` or `linux,phandle` property, 0 if it has none.
    pub fn get_phandle(&self, node: NodeId) -> u32 {
        [PHANDLE_PROP, LINUX_PHANDLE_PROP]
            .iter()
            .find_map(|name| self.get_prop::<u32>(node, name))
            .unwrap_or(0)
    }

    pub fn get_node_by_phandle(&self, phandle: u32) -> Option<NodeId> {
        if phandle == 0 {
            return None;
        }
        self.phandles
            .get(&phandle)
            .copied()
            .filter(|&node| self.pool.contains(node))
    }

    /// Largest phandle in the tree, 0 if there are none.
    pub fn max_phandle(&self) -> u32 {
        self.phandles.keys().next_back().copied().unwrap_or(0)
    }

    fn reindex_phandle(&mut self, node: NodeId, old_phandle: u32) {
        if old_phandle != 0 && self.phandles.get(&old_phandle) == Some(&node) {
            self.phandles.remove(&old_phandle);
        }
        let phandle = self.get_phandle(node);
        // Only attached nodes are indexed.
        if phandle != 0 && self.path_of(node).is_some() {
            self.phandles.insert(phandle, node);
        }
    }

    /// Detaches `node` from its parent and frees it with everything below it.
    pub fn destruct(&mut self, node: NodeId) -> Result<()> {
        self.detach(node)?;
        let mut pending = vec![node];
        while let Some(id) = pending.pop() {
            if let Some(Node {
                kind: NodeKind::Subtree(children),
                ..
            }) = self.release_node(id)
            {
                pending.extend(children);
            }
        }
        Ok(())
    }

    /// Detaches `node` from its parent and moves it out of the pool.
    ///
    /// Every handle into the removed subtree becomes stale.
    pub fn take_subtree(&mut self, node: NodeId) -> Result<DetachedNode> {
        self.detach(node)?;
        self.release_subtree(node).ok_or(Error::StaleNode)
    }

    fn detach(&mut self, node: NodeId) -> Result<()> {
        if node == self.root {
            return Err(Error::RootNode);
        }
        let (name, parent) = {
            let n = self.node(node).ok_or(Error::StaleNode)?;
            (n.name.clone(), n.parent)
        };
        if let Some(parent) = parent {
            let old_phandle = self.get_phandle(parent);
            if let Some(NodeKind::Subtree(children)) = self.pool.get_mut(parent).map(|p| &mut p.kind)
            {
                children.retain(|&child| child != node);
            }
            if is_phandle_prop(&name) {
                self.reindex_phandle(parent, old_phandle);
            }
        }
        Ok(())
    }

    // Drops the index entry of `node` and frees its slot. Children keep their slots.
    fn release_node(&mut self, node: NodeId) -> Option<Node> {
        let phandle = self.get_phandle(node);
        if phandle != 0 && self.phandles.get(&phandle) == Some(&node) {
            self.phandles.remove(&phandle);
        }
        self.pool.release(node)
    }

    fn release_subtree(&mut self, node: NodeId) -> Option<DetachedNode> {
        // Subtrees still being released: name, children left, children already detached.
        let mut open: Vec<(String, std::vec::IntoIter<NodeId>, Vec<DetachedNode>)> = Vec::new();
        let mut next = Some(node);
        loop {
            if let Some(id) = next.take() {
                match self.release_node(id) {
                    Some(Node {
                        name,
                        kind: NodeKind::Subtree(children),
                        ..
                    }) => open.push((name, children.into_iter(), Vec::new())),
                    Some(Node {
                        name,
                        kind: NodeKind::Property(data),
                        ..
                    }) => {
                        let leaf = DetachedNode::Property { name, data };
                        match open.last_mut() {
                            Some((_, _, done)) => done.push(leaf),
                            None => return Some(leaf),
                        }
                    }
                    None if open.is_empty() => return None,
                    None => {}
                }
            }
            let (_, pending, _) = open.last_mut()?;
            match pending.next() {
                Some(child) => next = Some(child),
                None => {
                    let (name, _, children) = open.pop()?;
                    let subtree = DetachedNode::Subtree { name, children };
                    match open.last_mut() {
                        Some((_, _, done)) => done.push(subtree),
                        None => return Some(subtree),
                    }
                }
            }
        }
    }

    fn build_detached(&mut self, detached: DetachedNode) -> NodeId {
        let (name, children) = match detached {
            DetachedNode::Property { name, data } => return self.construct_property(&name, data),
            DetachedNode::Subtree { name, children } => (name, children),
        };
        let top = self.construct_subnode(&name);
        let mut open = vec![(top, children.into_iter())];
        while let Some((parent, pending)) = open.last_mut() {
            let parent = *parent;
            // `parent` is a fresh subtree node, so attaching cannot fail.
            match pending.next() {
                Some(DetachedNode::Property { name, data }) => {
                    let prop = self.construct_property(&name, data);
                    let _ = self.attach(parent, prop);
                }
                Some(DetachedNode::Subtree { name, children }) => {
                    let node = self.construct_subnode(&name);
                    let _ = self.attach(parent, node);
                    open.push((node, children.into_iter()));
                }
                None => {
                    open.pop();
                }
            }
        }
        top
    }

    /// Adds a detached subtree as a new child of `parent`.
    pub fn graft(&mut self, parent: NodeId, detached: DetachedNode) -> Result<NodeId> {
        let node = self.build_detached(detached);
        if let Err(e) = self.add_child(parent, node) {
            self.release_subtree(node);
            return Err(e);
        }
        Ok(node)
    }

    /// Merges the children of a detached subtree into `target`.
    ///
    /// A property replaces the value of a property with the same name. A subnode is merged
    /// recursively into a subnode with the same name. Anything else is added as a new child.
    pub fn merge_detached(&mut self, target: NodeId, source: DetachedNode) -> Result<()> {
        let children = match source {
            DetachedNode::Subtree { children, .. } => children,
            DetachedNode::Property { name, .. } => return Err(Error::NotASubtree(name)),
        };
        let target_node = self.node(target).ok_or(Error::StaleNode)?;
        if !target_node.is_subtree() {
            return Err(Error::NotASubtree(target_node.name.clone()));
        }
        for child in children {
            match child {
                DetachedNode::Property { name, data } => {
                    self.set_prop(target, &name, data)?;
                }
                subtree => match self.get_subnode_by_name(target, subtree.name()) {
                    Some(existing) => self.merge_detached(existing, subtree)?,
                    None => {
                        self.graft(target, subtree)?;
                    }
                },
            }
        }
        Ok(())
    }

    /// Moves the children of `source` into `target` with the rules of `merge_detached`, then
    /// removes `source`.
    pub fn merge_into(&mut self, target: NodeId, source: NodeId) -> Result<()> {
        if self.is_ancestor_or_self(source, target) {
            let path = self.path_of(source).unwrap_or_default();
            return Err(Error::InvalidPath(format!(
                "cannot merge {} into its own subtree",
                path
            )));
        }
        let detached = self.take_subtree(source)?;
        self.merge_detached(target, detached)
    }

    /// Renders the tree one line per node as `NODE :name:` or `PROP :name:`, indented by two
    /// spaces per level. The properties of a node are listed before its subnodes.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let mut pending = vec![(self.root, 0)];
        while let Some((id, depth)) = pending.pop() {
            let Some(node) = self.node(id) else {
                continue;
            };
            let kind = match node.tag() {
                Tag::BeginNode => "NODE",
                Tag::Prop => "PROP",
            };
            let _ = writeln!(out, "{:indent$}{} :{}:", "", kind, node.name, indent = depth * 2);
            let children: Vec<NodeId> = self.properties(id).chain(self.subnodes(id)).collect();
            pending.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_node(tree: &mut Ufdt, parent: NodeId, name: &str) -> NodeId {
        let node = tree.construct_subnode(name);
        tree.add_child(parent, node).unwrap();
        node
    }

    #[test]
    fn lookups_are_exact_and_typed() {
        let mut tree = Ufdt::new();
        let root = tree.root();
        let uart = add_node(&mut tree, root, "uart@1000");
        tree.set_prop(root, "uart", "not a node").unwrap();

        assert_eq!(tree.get_subnode_by_name(root, "uart@1000"), Some(uart));
        assert_eq!(tree.get_subnode_by_name(root, "uart"), None);
        assert!(tree.get_property_by_name(root, "uart").is_some());
        assert_eq!(tree.get_property_by_name(root, "uart@1000"), None);
    }

    #[test]
    fn path_lookup_matches_stepwise_lookup() {
        let mut tree = Ufdt::new();
        let root = tree.root();
        let a = add_node(&mut tree, root, "a");
        let b = add_node(&mut tree, a, "b");

        let stepwise = tree
            .get_subnode_by_name(root, "a")
            .and_then(|a| tree.get_subnode_by_name(a, "b"));
        assert_eq!(stepwise, Some(b));
        assert_eq!(tree.get_node_by_path(root, "/a/b"), Some(b));
        assert_eq!(tree.get_node_by_path(root, "a//b/"), Some(b));
        assert_eq!(tree.get_node_by_path(a, "b"), Some(b));
        assert_eq!(tree.get_node_by_path(root, "/a/c"), None);
        assert_eq!(tree.get_node("/"), Some(root));
        assert_eq!(tree.path_of(b).unwrap(), "/a/b");
        assert_eq!(tree.path_of(root).unwrap(), "/");
    }

    #[test]
    fn alias_paths() {
        let mut tree = Ufdt::new();
        let root = tree.root();
        let soc = add_node(&mut tree, root, "soc");
        let i2c = add_node(&mut tree, soc, "i2c@0");
        let panel = add_node(&mut tree, i2c, "panel");
        let aliases = add_node(&mut tree, root, "aliases");
        tree.set_prop(aliases, "i2c0", "/soc/i2c@0").unwrap();
        tree.set_prop(aliases, "loop", "i2c0").unwrap();

        assert_eq!(tree.get_node("i2c0"), Some(i2c));
        assert_eq!(tree.get_node("i2c0/panel"), Some(panel));
        assert_eq!(tree.get_node("i2c1"), None);
        assert_eq!(tree.get_node("loop"), None);
    }

    #[test]
    fn add_child_rejects_bad_links() {
        let mut tree = Ufdt::new();
        let root = tree.root();
        let a = add_node(&mut tree, root, "a");
        let b = add_node(&mut tree, root, "b");
        let prop = tree.set_prop(a, "status", "okay").unwrap();

        assert!(matches!(
            tree.add_child(b, a),
            Err(Error::AlreadyAttached(_))
        ));
        let c = tree.construct_subnode("c");
        assert!(matches!(tree.add_child(prop, c), Err(Error::NotASubtree(_))));
        assert!(matches!(tree.add_child(a, root), Err(Error::RootNode)));
        let d = tree.construct_subnode("d");
        assert!(matches!(tree.add_child(d, d), Err(Error::AlreadyAttached(_))));
    }

    #[test]
    fn phandle_index_follows_edits() {
        let mut tree = Ufdt::new();
        let root = tree.root();
        let a = add_node(&mut tree, root, "a");
        let b = add_node(&mut tree, root, "b");
        tree.set_prop(a, PHANDLE_PROP, 1u32).unwrap();
        tree.set_prop(b, LINUX_PHANDLE_PROP, 5u32).unwrap();

        assert_eq!(tree.get_phandle(a), 1);
        assert_eq!(tree.get_phandle(b), 5);
        assert_eq!(tree.get_phandle(root), 0);
        assert_eq!(tree.get_node_by_phandle(5), Some(b));
        assert_eq!(tree.get_node_by_phandle(0), None);
        assert_eq!(tree.max_phandle(), 5);

        tree.set_prop(a, PHANDLE_PROP, 9u32).unwrap();
        assert_eq!(tree.get_node_by_phandle(1), None);
        assert_eq!(tree.get_node_by_phandle(9), Some(a));

        tree.destruct(a).unwrap();
        assert_eq!(tree.get_node_by_phandle(9), None);
        assert_eq!(tree.max_phandle(), 5);
    }

    #[test]
    fn unattached_nodes_are_not_indexed() {
        let mut tree = Ufdt::new();
        let loose = tree.construct_subnode("loose");
        tree.set_prop(loose, PHANDLE_PROP, 3u32).unwrap();
        assert_eq!(tree.get_node_by_phandle(3), None);

        tree.add_child(tree.root(), loose).unwrap();
        assert_eq!(tree.get_node_by_phandle(3), Some(loose));
    }

    #[test]
    fn destruct_frees_subtree() {
        let mut tree = Ufdt::new();
        let root = tree.root();
        let a = add_node(&mut tree, root, "a");
        let b = add_node(&mut tree, a, "b");
        tree.set_prop(b, "reg", &[0u32, 0x1000]).unwrap();
        assert_eq!(tree.node_count(), 4);

        tree.destruct(a).unwrap();
        assert_eq!(tree.node_count(), 1);
        assert!(tree.node(a).is_none());
        assert!(tree.node(b).is_none());
        assert_eq!(tree.subnodes(root).count(), 0);
        assert!(matches!(tree.destruct(a), Err(Error::StaleNode)));
        assert!(matches!(tree.destruct(root), Err(Error::RootNode)));
    }

    #[test]
    fn merge_replaces_recurses_and_appends() {
        let mut tree = Ufdt::new();
        let root = tree.root();
        let target = add_node(&mut tree, root, "target");
        tree.set_prop(target, "status", "disabled").unwrap();
        let existing = add_node(&mut tree, target, "child");
        tree.set_prop(existing, "keep", 1u32).unwrap();

        let source = DetachedNode::Subtree {
            name: "__overlay__".to_owned(),
            children: vec![
                DetachedNode::Property {
                    name: "status".to_owned(),
                    data: b"okay\0".to_vec(),
                },
                DetachedNode::Subtree {
                    name: "child".to_owned(),
                    children: vec![DetachedNode::Property {
                        name: "added".to_owned(),
                        data: vec![],
                    }],
                },
                DetachedNode::Subtree {
                    name: "new".to_owned(),
                    children: vec![],
                },
            ],
        };
        tree.merge_detached(target, source).unwrap();

        assert_eq!(tree.get_prop::<String>(target, "status").unwrap(), "okay");
        assert_eq!(tree.properties(target).count(), 1);
        assert_eq!(tree.get_subnode_by_name(target, "child"), Some(existing));
        assert_eq!(tree.get_prop::<u32>(existing, "keep"), Some(1));
        assert!(tree.get_prop::<()>(existing, "added").is_some());
        assert!(tree.get_node("/target/new").is_some());
    }

    #[test]
    fn merge_into_within_tree() {
        let mut tree = Ufdt::new();
        let root = tree.root();
        let first = add_node(&mut tree, root, "first");
        let second = add_node(&mut tree, root, "second");
        let moved = add_node(&mut tree, second, "moved");
        tree.set_prop(moved, PHANDLE_PROP, 2u32).unwrap();

        tree.merge_into(first, second).unwrap();
        assert!(tree.node(second).is_none());
        let moved = tree.get_node("/first/moved").unwrap();
        assert_eq!(tree.get_node_by_phandle(2), Some(moved));

        let inner = tree.get_node("/first/moved").unwrap();
        tree.merge_into(inner, first)
            .expect_err("merging a node into its own subtree");
    }

    #[test]
    fn take_and_graft_across_trees() {
        let mut src = Ufdt::new();
        let node = src.construct_subnode("node");
        src.add_child(src.root(), node).unwrap();
        src.set_prop(node, PHANDLE_PROP, 4u32).unwrap();
        let detached = src.take_subtree(node).unwrap();
        assert_eq!(src.node_count(), 1);
        assert_eq!(src.get_node_by_phandle(4), None);

        let mut dst = Ufdt::new();
        let grafted = dst.graft(dst.root(), detached).unwrap();
        assert_eq!(dst.get_node_by_phandle(4), Some(grafted));
    }

    #[test]
    fn dump_format() {
        let mut tree = Ufdt::new();
        let root = tree.root();
        let chosen = add_node(&mut tree, root, "chosen");
        tree.set_prop(chosen, "bootargs", "console=ttyS0").unwrap();
        assert_eq!(tree.dump(), "NODE ::\n  NODE :chosen:\n    PROP :bootargs:\n");

        // Properties come first even when added after a subnode.
        tree.set_prop(root, "model", "acme").unwrap();
        let soc = add_node(&mut tree, root, "soc");
        tree.set_prop(soc, "ranges", ()).unwrap();
        assert_eq!(
            tree.dump(),
            "NODE ::\n  PROP :model:\n  NODE :chosen:\n    PROP :bootargs:\n  NODE :soc:\n    PROP :ranges:\n"
        );
    }

    #[test]
    fn deep_trees_are_walked_without_recursion() {
        const DEPTH: u32 = 50_000;
        let mut tree = Ufdt::new();
        let mut parent = tree.root();
        for depth in 0..DEPTH {
            let node = add_node(&mut tree, parent, "n");
            if depth % 1000 == 0 {
                tree.set_prop(node, "phandle", depth + 1).unwrap();
            }
            parent = node;
        }
        let count = tree.node_count();
        assert_eq!(count, 1 + DEPTH as usize + 50);
        assert_eq!(
            tree.get_node_by_phandle(1001),
            tree.get_node_by_path(tree.root(), &"/n".repeat(1001))
        );

        let top = tree.get_subnode_by_name(tree.root(), "n").unwrap();
        let detached = tree.take_subtree(top).unwrap();
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.get_node_by_phandle(1), None);

        let grafted = tree.graft(tree.root(), detached).unwrap();
        assert_eq!(tree.node_count(), count);
        assert_eq!(tree.get_node_by_phandle(1), Some(grafted));

        tree.destruct(grafted).unwrap();
        assert_eq!(tree.node_count(), 1);
        assert!(tree.phandles.is_empty());
    }
}
