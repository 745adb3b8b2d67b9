//! Rooted bifurcating phylogenetic trees.
//!
//! Uses arena-style storage: nodes live in a flat `Vec<Node>` and are
//! referenced by `NodeId` (a `usize` index). Node ids are stable for the
//! lifetime of a tree and are preserved by [`PhyloTree::attach_leaf`], which
//! is what lets the likelihood engine key its caches on them.

use sts_core::{Result, StsError, Summarizable};

/// Index into the tree's node arena.
pub type NodeId = usize;

/// A single node in a phylogenetic tree.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Node {
    /// Index of this node in the arena.
    pub id: NodeId,
    /// Parent node (None for root).
    pub parent: Option<NodeId>,
    /// Child nodes.
    pub children: Vec<NodeId>,
    /// Branch length from this node to its parent.
    pub branch_length: Option<f64>,
    /// Taxon label (required on leaves).
    pub name: Option<String>,
}

impl Node {
    /// True if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// True if this node has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// A rooted phylogenetic tree stored as an arena of nodes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhyloTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl PhyloTree {
    /// Create a new tree with a single unnamed root node.
    pub fn new() -> Self {
        let root = Node {
            id: 0,
            parent: None,
            children: Vec::new(),
            branch_length: None,
            name: None,
        };
        Self {
            nodes: vec![root],
            root: 0,
        }
    }

    /// Add a child to `parent` and return its `NodeId`.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: Option<String>,
        branch_length: Option<f64>,
    ) -> Result<NodeId> {
        if parent >= self.nodes.len() {
            return Err(StsError::InvalidInput(format!(
                "parent index {} out of range ({})",
                parent,
                self.nodes.len()
            )));
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            parent: Some(parent),
            children: Vec::new(),
            branch_length,
            name,
        });
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    /// Access a node by id.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Mutable access to a node by id.
    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id).ok_or_else(|| {
            StsError::InvalidInput(format!(
                "node id {} out of range ({})",
                id,
                self.nodes.len()
            ))
        })
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Total number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaf nodes.
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// All leaf node ids.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.id)
            .collect()
    }

    /// Every edge of the tree, identified by its child-ward node.
    ///
    /// That is every node except the root, in arena order.
    pub fn edges(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.id != self.root)
            .map(|n| n.id)
            .collect()
    }

    /// Branch length above `id`.
    ///
    /// # Errors
    ///
    /// Fails for the root, unknown ids, and nodes without a length.
    pub fn branch_length(&self, id: NodeId) -> Result<f64> {
        let node = self.node(id)?;
        if node.is_root() {
            return Err(StsError::InvalidInput(format!(
                "root node {} has no branch",
                id
            )));
        }
        node.branch_length.ok_or_else(|| {
            StsError::InvalidInput(format!("node {} has no branch length", id))
        })
    }

    /// Set the branch length above `id`.
    pub fn set_branch_length(&mut self, id: NodeId, length: f64) -> Result<()> {
        if !(length.is_finite() && length >= 0.0) {
            return Err(StsError::InvalidInput(format!(
                "invalid branch length {} for node {}",
                length, id
            )));
        }
        let root = self.root;
        let node = self.nodes.get_mut(id).ok_or_else(|| {
            StsError::InvalidInput(format!("node id {} out of range", id))
        })?;
        if id == root {
            return Err(StsError::InvalidInput("the root has no branch".into()));
        }
        node.branch_length = Some(length);
        Ok(())
    }

    /// Nodes from `id` (inclusive) up to the root (inclusive).
    pub fn path_to_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            match self.nodes.get(n) {
                Some(node) => {
                    path.push(n);
                    cur = node.parent;
                }
                None => break,
            }
        }
        path
    }

    /// Node id of the leaf labelled `name`.
    pub fn leaf_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.is_leaf() && n.name.as_deref() == Some(name))
            .map(|n| n.id)
    }

    /// Sum of all branch lengths (missing lengths count as zero).
    pub fn total_length(&self) -> f64 {
        self.nodes
            .iter()
            .filter(|n| n.id != self.root)
            .filter_map(|n| n.branch_length)
            .sum()
    }

    /// Check that the tree is strictly bifurcating with named leaves and a
    /// length on every branch.
    pub fn validate_bifurcating(&self) -> Result<()> {
        if self.nodes[self.root].children.len() != 2 {
            return Err(StsError::InvalidInput(format!(
                "root must have exactly two children, found {}",
                self.nodes[self.root].children.len()
            )));
        }
        for node in &self.nodes {
            if node.is_leaf() {
                if node.name.is_none() {
                    return Err(StsError::InvalidInput(format!(
                        "leaf {} has no name",
                        node.id
                    )));
                }
            } else if node.children.len() != 2 {
                return Err(StsError::InvalidInput(format!(
                    "node {} has {} children; only bifurcating trees are supported",
                    node.id,
                    node.children.len()
                )));
            }
            if node.id != self.root {
                self.branch_length(node.id)?;
            }
        }
        Ok(())
    }

    /// Build a new tree with a leaf attached to the edge above `edge`.
    ///
    /// The edge is split at `distal` (measured from `edge` toward its parent)
    /// by a new internal node carrying the new leaf at `pendant`:
    ///
    /// ```text
    ///        parent
    ///          |  d - distal
    ///   new ---+------ leaf (pendant)
    ///          |  distal
    ///        edge
    /// ```
    ///
    /// Existing node ids are unchanged; the new internal node and the new
    /// leaf are appended, in that order. Returns the new tree and the new
    /// leaf's id.
    pub fn attach_leaf(
        &self,
        edge: NodeId,
        distal: f64,
        pendant: f64,
        name: &str,
    ) -> Result<(PhyloTree, NodeId)> {
        let d = self.branch_length(edge)?;
        if !(distal >= 0.0 && distal <= d) {
            return Err(StsError::InvalidInput(format!(
                "distal length {} outside [0, {}]",
                distal, d
            )));
        }
        if !(pendant.is_finite() && pendant >= 0.0) {
            return Err(StsError::InvalidInput(format!(
                "invalid pendant length {}",
                pendant
            )));
        }
        if self.leaf_by_name(name).is_some() {
            return Err(StsError::InvalidInput(format!(
                "leaf {} already present",
                name
            )));
        }
        let parent = self.nodes[edge].parent.ok_or_else(|| {
            StsError::InvalidInput("cannot attach above the root".into())
        })?;

        let mut nodes = self.nodes.clone();
        let junction = nodes.len();
        let leaf = junction + 1;
        nodes.push(Node {
            id: junction,
            parent: Some(parent),
            children: vec![edge, leaf],
            branch_length: Some(d - distal),
            name: None,
        });
        nodes.push(Node {
            id: leaf,
            parent: Some(junction),
            children: Vec::new(),
            branch_length: Some(pendant),
            name: Some(name.to_string()),
        });
        for child in nodes[parent].children.iter_mut() {
            if *child == edge {
                *child = junction;
            }
        }
        nodes[edge].parent = Some(junction);
        nodes[edge].branch_length = Some(distal);

        Ok((
            PhyloTree {
                nodes,
                root: self.root,
            },
            leaf,
        ))
    }

    /// Pre-order (parent before children) traversal yielding node ids.
    pub fn iter_preorder(&self) -> PreorderIter<'_> {
        PreorderIter {
            tree: self,
            stack: vec![self.root],
        }
    }

    /// Post-order (children before parent) traversal yielding node ids.
    pub fn iter_postorder(&self) -> PostorderIter {
        // Reverse of a preorder that visits the right child first.
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            result.push(id);
            for &child in &self.nodes[id].children {
                stack.push(child);
            }
        }
        result.reverse();
        PostorderIter {
            sequence: result,
            pos: 0,
        }
    }
}

impl Default for PhyloTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Summarizable for PhyloTree {
    fn summary(&self) -> String {
        let leaves = self.leaf_count();
        format!(
            "PhyloTree: {} nodes ({} leaves, {} internal), length {:.4}",
            self.node_count(),
            leaves,
            self.node_count() - leaves,
            self.total_length()
        )
    }
}

/// Pre-order iterator over node ids.
pub struct PreorderIter<'a> {
    tree: &'a PhyloTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for PreorderIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        // Push children in reverse order so leftmost is visited first.
        for &child in self.tree.nodes[id].children.iter().rev() {
            self.stack.push(child);
        }
        Some(id)
    }
}

/// Post-order iterator over node ids.
pub struct PostorderIter {
    sequence: Vec<NodeId>,
    pos: usize,
}

impl Iterator for PostorderIter {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = *self.sequence.get(self.pos)?;
        self.pos += 1;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> PhyloTree {
        // ((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);
        let mut tree = PhyloTree::new();
        let ab = tree.add_child(0, None, Some(0.3)).unwrap();
        let cd = tree.add_child(0, None, Some(0.6)).unwrap();
        tree.add_child(ab, Some("A".into()), Some(0.1)).unwrap();
        tree.add_child(ab, Some("B".into()), Some(0.2)).unwrap();
        tree.add_child(cd, Some("C".into()), Some(0.4)).unwrap();
        tree.add_child(cd, Some("D".into()), Some(0.5)).unwrap();
        tree
    }

    #[test]
    fn add_child_invalid_parent() {
        let mut tree = PhyloTree::new();
        assert!(tree.add_child(99, None, None).is_err());
    }

    #[test]
    fn traversals() {
        let tree = sample_tree();
        let pre: Vec<NodeId> = tree.iter_preorder().collect();
        assert_eq!(pre, vec![0, 1, 3, 4, 2, 5, 6]);
        let post: Vec<NodeId> = tree.iter_postorder().collect();
        assert_eq!(post, vec![3, 4, 1, 5, 6, 2, 0]);
    }

    #[test]
    fn edges_exclude_root() {
        let tree = sample_tree();
        assert_eq!(tree.edges(), vec![1, 2, 3, 4, 5, 6]);
        assert!(tree.branch_length(0).is_err());
        assert_eq!(tree.branch_length(5).unwrap(), 0.4);
    }

    #[test]
    fn path_to_root_ends_at_root() {
        let tree = sample_tree();
        assert_eq!(tree.path_to_root(5), vec![5, 2, 0]);
    }

    #[test]
    fn validate_rejects_multifurcation() {
        let mut tree = sample_tree();
        assert!(tree.validate_bifurcating().is_ok());
        tree.add_child(1, Some("E".into()), Some(0.1)).unwrap();
        assert!(tree.validate_bifurcating().is_err());
    }

    #[test]
    fn validate_rejects_missing_length() {
        let mut tree = sample_tree();
        tree.get_node_mut(4).unwrap().branch_length = None;
        assert!(tree.validate_bifurcating().is_err());
    }

    #[test]
    fn set_branch_length_checks_value() {
        let mut tree = sample_tree();
        tree.set_branch_length(3, 0.7).unwrap();
        assert_eq!(tree.branch_length(3).unwrap(), 0.7);
        assert!(tree.set_branch_length(3, -1.0).is_err());
        assert!(tree.set_branch_length(3, f64::NAN).is_err());
        assert!(tree.set_branch_length(0, 1.0).is_err());
    }

    #[test]
    fn attach_leaf_splits_edge() {
        let tree = sample_tree();
        let (extended, leaf) = tree.attach_leaf(5, 0.1, 0.25, "E").unwrap();
        assert_eq!(extended.node_count(), tree.node_count() + 2);
        assert_eq!(leaf, 8);
        let junction = extended.get_node(leaf).unwrap().parent.unwrap();
        assert_eq!(junction, 7);
        assert_eq!(extended.get_node(junction).unwrap().parent, Some(2));
        assert!((extended.branch_length(junction).unwrap() - 0.3).abs() < 1e-12);
        assert_eq!(extended.branch_length(5).unwrap(), 0.1);
        assert_eq!(extended.branch_length(leaf).unwrap(), 0.25);
        assert_eq!(extended.get_node(2).unwrap().children, vec![7, 6]);
        assert!(extended.validate_bifurcating().is_ok());
        assert!((extended.total_length() - tree.total_length() - 0.25).abs() < 1e-12);
        // Original untouched.
        assert_eq!(tree.branch_length(5).unwrap(), 0.4);
    }

    #[test]
    fn attach_leaf_rejects_bad_arguments() {
        let tree = sample_tree();
        assert!(tree.attach_leaf(5, 0.5, 0.1, "E").is_err());
        assert!(tree.attach_leaf(5, 0.1, -0.1, "E").is_err());
        assert!(tree.attach_leaf(5, 0.1, 0.1, "A").is_err());
        assert!(tree.attach_leaf(0, 0.0, 0.1, "E").is_err());
    }

    #[test]
    fn summary_format() {
        let tree = sample_tree();
        assert_eq!(
            tree.summary(),
            "PhyloTree: 7 nodes (4 leaves, 3 internal), length 2.1000"
        );
    }
}
