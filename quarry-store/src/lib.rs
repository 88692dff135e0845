//! Content-addressed storage for `quarry`.
//!
//! The [`ContentStore`] is an in-memory arena keyed by content hash. Blobs
//! and directory trees are immutable once stored, so every operation is
//! idempotent and safe for concurrent callers. Persistence and eviction are
//! the embedder's policy, not part of this crate's contract.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use globset::{Glob, GlobSet, GlobSetBuilder};
use quarry_ore::cast::CastFrom;
use quarry_tree::{TreeBuilder, TreeError, TreeNode};
use quarry_types::{Digest, Fingerprint};

/// Errors from the content store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A digest was requested that this store has never seen.
    #[error("missing digest in store: {digest}")]
    MissingDigest { digest: Digest },
    /// A structural tree operation failed, e.g. a merge conflict.
    #[error(transparent)]
    Tree(#[from] TreeError),
    /// Local I/O failure while materializing or capturing.
    #[error("store i/o at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// An output pattern failed to compile.
    #[error("invalid output glob '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// A digest plus its materialized file and directory listing.
///
/// Derived from the digest alone, cached by construction, read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub digest: Digest,
    /// Relative paths of all files, sorted.
    pub files: Vec<String>,
    /// Relative paths of all directories, sorted.
    pub dirs: Vec<String>,
}

/// Content-addressed store for immutable blobs and directory trees.
#[derive(Debug, Clone)]
pub struct ContentStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    blobs: RwLock<HashMap<Fingerprint, Arc<[u8]>>>,
    trees: RwLock<HashMap<Fingerprint, Arc<TreeNode>>>,
    empty: Digest,
}

impl ContentStore {
    pub fn new() -> Self {
        let inner = StoreInner {
            blobs: RwLock::new(HashMap::new()),
            trees: RwLock::new(HashMap::new()),
            // Placeholder until we've registered the empty tree below.
            empty: Digest::new(Fingerprint::new([0; 32]), 0),
        };
        let mut inner = inner;
        inner.empty = inner.put_tree(&TreeNode::empty());
        ContentStore {
            inner: Arc::new(inner),
        }
    }

    /// Digest of the empty directory tree.
    pub fn empty_digest(&self) -> Digest {
        self.inner.empty
    }

    /// Store a blob, returning its digest.
    ///
    /// Re-storing identical content returns the same digest.
    pub fn put(&self, bytes: Vec<u8>) -> Digest {
        let hash = Fingerprint::new(*blake3::hash(&bytes).as_bytes());
        let size = u64::cast_from(bytes.len());
        let mut blobs = self.inner.blobs.write().expect("blobs lock poisoned");
        blobs.entry(hash).or_insert_with(|| Arc::from(bytes));
        Digest::new(hash, size)
    }

    /// Fetch a blob by digest.
    pub fn get_blob(&self, digest: Digest) -> Result<Arc<[u8]>, StoreError> {
        let blobs = self.inner.blobs.read().expect("blobs lock poisoned");
        blobs
            .get(digest.hash())
            .map(Arc::clone)
            .ok_or(StoreError::MissingDigest { digest })
    }

    /// Register a directory tree, returning the digest of its root.
    ///
    /// Every subdirectory is registered as well, so any subtree digest
    /// remains resolvable on its own.
    pub fn put_tree(&self, node: &Arc<TreeNode>) -> Digest {
        self.inner.put_tree(node)
    }

    /// Fetch a directory tree by digest.
    pub fn get_tree(&self, digest: Digest) -> Result<Arc<TreeNode>, StoreError> {
        let trees = self.inner.trees.read().expect("trees lock poisoned");
        trees
            .get(digest.hash())
            .map(Arc::clone)
            .ok_or(StoreError::MissingDigest { digest })
    }

    /// Store a set of files as a directory tree in one call.
    pub fn put_files(&self, entries: &[(&str, &[u8])]) -> Result<Digest, StoreError> {
        let mut builder = TreeBuilder::new();
        for (path, bytes) in entries {
            let digest = self.put(bytes.to_vec());
            builder.insert_file(path, digest)?;
        }
        Ok(self.put_tree(&builder.freeze()))
    }

    /// Merge the provided trees into a new tree.
    ///
    /// The result references existing subtrees, leaf bytes are never copied.
    /// Merging is commutative and associative in the resulting digest.
    ///
    /// # Errors
    ///
    /// * [`StoreError::Tree`] with [`TreeError::Conflict`] if two inputs
    ///   disagree at the same path.
    pub fn merge(&self, digests: &[Digest]) -> Result<Digest, StoreError> {
        let mut merged = TreeNode::empty();
        for digest in digests {
            let tree = self.get_tree(*digest)?;
            merged = quarry_tree::merge(&merged, &tree)?;
        }
        Ok(self.put_tree(&merged))
    }

    /// Return the digest of the subtree under `prefix`.
    pub fn remove_prefix(&self, digest: Digest, prefix: &str) -> Result<Digest, StoreError> {
        let tree = self.get_tree(digest)?;
        let stripped = quarry_tree::remove_prefix(&tree, prefix)?;
        Ok(self.put_tree(&stripped))
    }

    /// List the files and directories behind a digest.
    ///
    /// A pure function of the digest.
    pub fn snapshot(&self, digest: Digest) -> Result<Snapshot, StoreError> {
        let tree = self.get_tree(digest)?;
        Ok(Snapshot {
            digest,
            files: tree.files(),
            dirs: tree.dirs(),
        })
    }

    /// Write the tree behind `digest` into `dest` on the real filesystem.
    pub async fn materialize(&self, digest: Digest, dest: PathBuf) -> Result<(), StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.materialize_sync(digest, &dest))
            .await
            .expect("materialize task panicked")
    }

    /// Read files under `root` matching `outputs` back into the store.
    ///
    /// Each output entry is either an exact relative path or a glob. A plain
    /// directory path captures everything beneath it.
    pub async fn capture(&self, root: PathBuf, outputs: Vec<String>) -> Result<Digest, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.capture_sync(&root, &outputs))
            .await
            .expect("capture task panicked")
    }

    fn materialize_sync(&self, digest: Digest, dest: &Path) -> Result<(), StoreError> {
        let tree = self.get_tree(digest)?;
        std::fs::create_dir_all(dest).map_err(|source| StoreError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        self.materialize_node(&tree, dest)
    }

    fn materialize_node(&self, node: &Arc<TreeNode>, dest: &Path) -> Result<(), StoreError> {
        let TreeNode::Directory { children } = &**node else {
            // The root of a materialization is always a directory.
            return Ok(());
        };
        for (name, child) in children {
            let path = dest.join(name.as_str());
            match &**child {
                TreeNode::File { digest } => {
                    let bytes = self.get_blob(*digest)?;
                    std::fs::write(&path, &bytes[..])
                        .map_err(|source| StoreError::Io { path, source })?;
                }
                TreeNode::Directory { .. } => {
                    std::fs::create_dir_all(&path).map_err(|source| StoreError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    self.materialize_node(child, &path)?;
                }
            }
        }
        Ok(())
    }

    fn capture_sync(&self, root: &Path, outputs: &[String]) -> Result<Digest, StoreError> {
        let matcher = output_matcher(outputs)?;
        let mut builder = TreeBuilder::new();
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| StoreError::Io {
                    path: dir.clone(),
                    source,
                })?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(root)
                    .expect("walked path is under the root");
                if !matcher.is_match(relative) {
                    continue;
                }
                let bytes = std::fs::read(&path).map_err(|source| StoreError::Io {
                    path: path.clone(),
                    source,
                })?;
                let digest = self.put(bytes);
                builder.insert_file(&relative.to_string_lossy(), digest)?;
            }
        }

        let tree = builder.freeze();
        tracing::trace!(tree = %quarry_tree::render(&tree), "captured outputs");
        Ok(self.put_tree(&tree))
    }
}

impl Default for ContentStore {
    fn default() -> Self {
        ContentStore::new()
    }
}

impl StoreInner {
    fn put_tree(&self, node: &Arc<TreeNode>) -> Digest {
        match &**node {
            TreeNode::File { digest } => *digest,
            TreeNode::Directory { children } => {
                let mut hasher = blake3::Hasher::new();
                let mut size = 0u64;
                for (name, child) in children {
                    let child_digest = self.put_tree(child);
                    let kind: u8 = match &**child {
                        TreeNode::File { .. } => b'f',
                        TreeNode::Directory { .. } => b'd',
                    };
                    hasher.update(name.as_bytes());
                    hasher.update(&[0, kind]);
                    hasher.update(child_digest.hash().as_bytes());
                    hasher.update(&child_digest.size().to_le_bytes());
                    size += child_digest.size();
                }
                let hash = Fingerprint::new(*hasher.finalize().as_bytes());
                let digest = Digest::new(hash, size);
                let mut trees = self.trees.write().expect("trees lock poisoned");
                trees.entry(hash).or_insert_with(|| Arc::clone(node));
                digest
            }
        }
    }
}

/// Compile output paths/globs into a matcher.
///
/// A plain directory entry also matches everything beneath it.
fn output_matcher(outputs: &[String]) -> Result<GlobSet, StoreError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in outputs {
        let glob = Glob::new(pattern).map_err(|source| StoreError::InvalidGlob {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
        let subtree = format!("{}/**", pattern.trim_end_matches('/'));
        let glob = Glob::new(&subtree).map_err(|source| StoreError::InvalidGlob {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| StoreError::InvalidGlob {
        pattern: outputs.join(", "),
        source,
    })
}
