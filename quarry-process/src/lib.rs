//! Sandboxed external-command execution for `quarry`.
//!
//! A [`ProcessRequest`] describes a command to run in a sandbox seeded from a
//! content-store digest. The [`executor::Executor`] runs it, captures
//! stdout/stderr and requested outputs back into the store, and caches
//! results according to the request's [`CacheScope`].

use std::collections::BTreeMap;
use std::time::Duration;

use quarry_ore::hash::Xxh3Hasher;
use quarry_types::{Digest, Xxh64Hash};

pub mod executor;

pub use executor::Executor;

/// Policy governing how long a process result may be reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CacheScope {
    /// Cache forever. For pure conversions whose output depends only on
    /// the inputs.
    Always,
    /// Cache for the life of this process, and only if the command exited
    /// successfully. Used for commands with external side effects, e.g.
    /// deploys, where a failure must re-run.
    PerRestartSuccessful,
    /// Never reuse across top-level sessions. Used to force materialization
    /// on every invocation.
    PerSession,
}

/// Identifies one top-level invocation for [`CacheScope::PerSession`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(u64);

impl From<u64> for SessionToken {
    fn from(val: u64) -> Self {
        SessionToken(val)
    }
}

/// Description of a sandboxed external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    /// Program and arguments. The first entry is the binary to run.
    pub argv: Vec<String>,
    /// Environment for the child. The sandbox starts from an empty
    /// environment, nothing is inherited.
    pub env: BTreeMap<String, String>,
    /// Tree to materialize into the sandbox working directory.
    pub input_digest: Digest,
    /// Relative paths or globs to capture from the sandbox after exit.
    pub output_paths: Vec<String>,
    /// Caching policy for the result.
    pub cache_scope: CacheScope,
    /// Per-process wall clock limit. `None` means no limit.
    pub timeout: Option<Duration>,
    /// Human readable description, for logs only.
    pub description: String,
}

impl ProcessRequest {
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>, input_digest: Digest) -> Self {
        ProcessRequest {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::default(),
            input_digest,
            output_paths: Vec::new(),
            cache_scope: CacheScope::Always,
            timeout: None,
            description: String::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_output_paths(
        mut self,
        paths: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.output_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cache_scope(mut self, scope: CacheScope) -> Self {
        self.cache_scope = scope;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Fold everything that identifies this request into `hasher`.
    ///
    /// The description and timeout are intentionally excluded, they do not
    /// change what the command computes.
    pub fn fingerprint(&self, hasher: &mut Xxh3Hasher) {
        for arg in &self.argv {
            hasher.update(arg.as_bytes());
            hasher.update(&[0]);
        }
        for (key, value) in &self.env {
            hasher.update(key.as_bytes());
            hasher.update(&[b'=']);
            hasher.update(value.as_bytes());
            hasher.update(&[0]);
        }
        hasher.update(self.input_digest.hash().as_bytes());
        hasher.update(&self.input_digest.size().to_le_bytes());
        for path in &self.output_paths {
            hasher.update(path.as_bytes());
            hasher.update(&[0]);
        }
        let scope: u8 = match self.cache_scope {
            CacheScope::Always => 0,
            CacheScope::PerRestartSuccessful => 1,
            CacheScope::PerSession => 2,
        };
        hasher.update(&[scope]);
    }

    /// Cache key for this request within `session`.
    ///
    /// Hash of argv, env, input digest, output paths, and cache scope.
    /// [`CacheScope::PerSession`] requests additionally fold in the session
    /// token so results never cross sessions.
    pub fn cache_key(&self, session: SessionToken) -> Xxh64Hash {
        let mut hasher = Xxh3Hasher::new();
        self.fingerprint(&mut hasher);
        if self.cache_scope == CacheScope::PerSession {
            hasher.update(&session.0.to_le_bytes());
        }
        hasher.digest()
    }
}

/// Outcome of a sandboxed command.
///
/// A nonzero exit code is a normal value here, not an error. Rules inspect
/// the exit code and decide what it means for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallibleProcessResult {
    pub exit_code: i32,
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
    /// Digest of the captured output paths, the empty tree if none were
    /// requested.
    pub output_digest: Digest,
    /// The process exceeded its timeout and was killed.
    pub timed_out: bool,
}

impl FallibleProcessResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}
