//! Immutable content trees for `quarry`.
//!
//! A [`TreeNode`] describes a file hierarchy where every file leaf is a
//! [`Digest`] into the content store. Directory nodes share their children
//! via [`Arc`], so combining trees never copies leaf bytes, a merged tree is
//! a new root referencing existing subtrees.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use compact_str::CompactString;
use quarry_types::Digest;
use smallvec::SmallVec;

/// Errors from structural tree operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// Two trees disagree about the entry at the same path.
    #[error("conflicting entries at '{path}'")]
    Conflict { path: String },
    /// A prefix to strip did not exist in the tree.
    #[error("prefix '{prefix}' not found in tree")]
    PrefixNotFound { prefix: String },
    /// Paths must have at least one non-empty component.
    #[error("empty path component in '{path}'")]
    EmptyPath { path: String },
    /// A non-directory appeared as an intermediate path component.
    #[error("non-directory in path at '{path}'")]
    NotADirectory { path: String },
}

/// Single node within a content tree.
#[derive(Debug, PartialEq, Eq)]
pub enum TreeNode {
    /// A file leaf, pointing at blob content in the store.
    File { digest: Digest },
    /// A directory with named children, sorted by name.
    Directory {
        children: BTreeMap<CompactString, Arc<TreeNode>>,
    },
}

impl TreeNode {
    /// An empty directory node.
    pub fn empty() -> Arc<TreeNode> {
        Arc::new(TreeNode::Directory {
            children: BTreeMap::default(),
        })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TreeNode::File { .. } => false,
            TreeNode::Directory { children } => children.is_empty(),
        }
    }

    /// Total size in bytes of all files beneath this node.
    pub fn total_size(&self) -> u64 {
        match self {
            TreeNode::File { digest } => digest.size(),
            TreeNode::Directory { children } => {
                children.values().map(|child| child.total_size()).sum()
            }
        }
    }

    /// Visit every entry beneath this node in sorted order.
    ///
    /// The callback receives the slash-joined relative path and the node.
    pub fn walk(self: &Arc<TreeNode>, f: &mut impl FnMut(&str, &TreeNode)) {
        fn visit(node: &Arc<TreeNode>, prefix: &str, f: &mut impl FnMut(&str, &TreeNode)) {
            let TreeNode::Directory { children } = &**node else {
                return;
            };
            for (name, child) in children {
                let path = if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{prefix}/{name}")
                };
                f(&path, child);
                visit(child, &path, f);
            }
        }
        visit(self, "", f);
    }

    /// Relative paths of all files beneath this node, sorted.
    pub fn files(self: &Arc<TreeNode>) -> Vec<String> {
        let mut files = Vec::new();
        self.walk(&mut |path, node| {
            if matches!(node, TreeNode::File { .. }) {
                files.push(path.to_string());
            }
        });
        files
    }

    /// Relative paths of all directories beneath this node, sorted.
    pub fn dirs(self: &Arc<TreeNode>) -> Vec<String> {
        let mut dirs = Vec::new();
        self.walk(&mut |path, node| {
            if matches!(node, TreeNode::Directory { .. }) {
                dirs.push(path.to_string());
            }
        });
        dirs
    }

    /// Get the node at the provided slash-separated path, if it exists.
    pub fn get(self: &Arc<TreeNode>, path: &str) -> Option<Arc<TreeNode>> {
        let mut node = Arc::clone(self);
        for component in split_path(path) {
            let TreeNode::Directory { children } = &*node else {
                return None;
            };
            node = Arc::clone(children.get(component.as_str())?);
        }
        Some(node)
    }
}

/// Merge two trees into a new tree referencing the originals.
///
/// Identical files at the same path unify. Divergent content at the same
/// path, or a file/directory clash, fails with [`TreeError::Conflict`].
/// Merging is commutative and associative in the resulting structure.
pub fn merge(left: &Arc<TreeNode>, right: &Arc<TreeNode>) -> Result<Arc<TreeNode>, TreeError> {
    let mut path = SmallVec::new();
    merge_at(left, right, &mut path)
}

fn merge_at(
    left: &Arc<TreeNode>,
    right: &Arc<TreeNode>,
    path: &mut SmallVec<[CompactString; 8]>,
) -> Result<Arc<TreeNode>, TreeError> {
    match (&**left, &**right) {
        (TreeNode::File { digest: a }, TreeNode::File { digest: b }) => {
            if a == b {
                Ok(Arc::clone(left))
            } else {
                Err(TreeError::Conflict {
                    path: path.join("/"),
                })
            }
        }
        (TreeNode::Directory { children: a }, TreeNode::Directory { children: b }) => {
            let mut merged = a.clone();
            for (name, b_child) in b {
                match merged.get(name).map(Arc::clone) {
                    None => {
                        merged.insert(name.clone(), Arc::clone(b_child));
                    }
                    Some(a_child) => {
                        path.push(name.clone());
                        let child = merge_at(&a_child, b_child, path)?;
                        path.pop();
                        merged.insert(name.clone(), child);
                    }
                }
            }
            Ok(Arc::new(TreeNode::Directory { children: merged }))
        }
        _ => Err(TreeError::Conflict {
            path: path.join("/"),
        }),
    }
}

/// Return the subtree under `prefix`, dropping the prefix itself.
///
/// # Errors
///
/// * [`TreeError::PrefixNotFound`] if any component of the prefix is missing
///   or resolves to a file.
pub fn remove_prefix(node: &Arc<TreeNode>, prefix: &str) -> Result<Arc<TreeNode>, TreeError> {
    let mut current = Arc::clone(node);
    for component in split_path(prefix) {
        let TreeNode::Directory { children } = &*current else {
            return Err(TreeError::PrefixNotFound {
                prefix: prefix.to_string(),
            });
        };
        let Some(child) = children.get(component.as_str()) else {
            return Err(TreeError::PrefixNotFound {
                prefix: prefix.to_string(),
            });
        };
        current = Arc::clone(child);
    }
    // The prefix must name a directory. A file at the final component has no
    // subtree to return.
    if matches!(&*current, TreeNode::File { .. }) {
        return Err(TreeError::PrefixNotFound {
            prefix: prefix.to_string(),
        });
    }
    Ok(current)
}

/// Builder for assembling a tree from individual file entries.
///
/// Intermediate directories are created as needed, mirroring how captured
/// process outputs arrive as flat path listings.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    root: MutableNode,
}

#[derive(Debug)]
enum MutableNode {
    File { digest: Digest },
    Directory { children: BTreeMap<CompactString, MutableNode> },
}

impl Default for MutableNode {
    fn default() -> Self {
        MutableNode::Directory {
            children: BTreeMap::default(),
        }
    }
}

impl TreeBuilder {
    pub fn new() -> Self {
        TreeBuilder::default()
    }

    /// Insert a file at the provided slash-separated path.
    ///
    /// # Errors
    ///
    /// * If a non-final component of the path is already a file.
    /// * If the path has no components.
    pub fn insert_file(&mut self, path: &str, digest: Digest) -> Result<(), TreeError> {
        let mut components: SmallVec<[CompactString; 8]> = split_path(path).collect();
        let Some(filename) = components.pop() else {
            return Err(TreeError::EmptyPath {
                path: path.to_string(),
            });
        };

        // Walk down the tree to the parent directory, creating edges as we go.
        let mut node = &mut self.root;
        for component in &components {
            match node {
                MutableNode::File { .. } => {
                    return Err(TreeError::NotADirectory {
                        path: path.to_string(),
                    });
                }
                MutableNode::Directory { children } => {
                    node = children.entry(component.clone()).or_default();
                }
            }
        }

        match node {
            MutableNode::File { .. } => Err(TreeError::NotADirectory {
                path: path.to_string(),
            }),
            MutableNode::Directory { children } => {
                children.insert(filename, MutableNode::File { digest });
                Ok(())
            }
        }
    }

    /// Consume this builder, producing an immutable tree.
    pub fn freeze(self) -> Arc<TreeNode> {
        fn freeze_node(node: MutableNode) -> Arc<TreeNode> {
            match node {
                MutableNode::File { digest } => Arc::new(TreeNode::File { digest }),
                MutableNode::Directory { children } => Arc::new(TreeNode::Directory {
                    children: children
                        .into_iter()
                        .map(|(name, child)| (name, freeze_node(child)))
                        .collect(),
                }),
            }
        }
        freeze_node(self.root)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = CompactString> + '_ {
    path.split('/')
        .filter(|component| !component.is_empty())
        .map(CompactString::new)
}

/// Helper struct for implementing [`ptree`]'s traits.
#[derive(Debug, Clone)]
struct RenderNode {
    name: CompactString,
    node: Arc<TreeNode>,
}

impl ptree::TreeItem for RenderNode {
    type Child = RenderNode;

    fn write_self<W: std::io::Write>(
        &self,
        f: &mut W,
        _style: &ptree::Style,
    ) -> std::io::Result<()> {
        match &*self.node {
            TreeNode::File { digest } => write!(f, "{} ({} bytes)", self.name, digest.size()),
            TreeNode::Directory { .. } => write!(f, "{}/", self.name),
        }
    }

    fn children(&self) -> Cow<'_, [Self::Child]> {
        match &*self.node {
            TreeNode::File { .. } => Cow::Owned(vec![]),
            TreeNode::Directory { children } => {
                let children: Vec<_> = children
                    .iter()
                    .map(|(name, node)| RenderNode {
                        name: name.clone(),
                        node: Arc::clone(node),
                    })
                    .collect();
                Cow::Owned(children)
            }
        }
    }
}

/// Render a tree for diagnostics.
pub fn render(node: &Arc<TreeNode>) -> String {
    let root = RenderNode {
        name: CompactString::const_new("."),
        node: Arc::clone(node),
    };
    let mut buf = Vec::new();
    // Rendering is best-effort, writing to a Vec cannot fail.
    let _ = ptree::write_tree(&root, &mut buf);
    String::from_utf8_lossy(&buf[..]).into_owned()
}
