//! The sandboxed process executor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use quarry_cfg::{Config, ConfigSet, ConfigSetBuilder};
use quarry_ore::id_gen::Gen;
use quarry_store::{ContentStore, StoreError};
use quarry_types::Xxh64Hash;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;

use crate::{CacheScope, FallibleProcessResult, ProcessRequest, SessionToken};

pub static SANDBOX_ROOT: Config<&'static str> = Config::new(
    "sandbox_root",
    "Directory sandboxes are created under. Empty means the system temp directory.",
    "",
);

pub static KEEP_SANDBOXES: Config<bool> = Config::new(
    "keep_sandboxes",
    "Keep sandbox directories after a process exits, for debugging.",
    false,
);

pub static PROCESS_PARALLELISM: Config<u64> = Config::new(
    "process_parallelism",
    "Maximum number of external processes running at once.",
    8,
);

/// Register this crate's [`Config`]s into the provided builder.
pub fn register_configs(builder: &mut ConfigSetBuilder) {
    builder
        .register(&SANDBOX_ROOT)
        .register(&KEEP_SANDBOXES)
        .register(&PROCESS_PARALLELISM);
}

/// Errors setting up or spawning a sandboxed process.
///
/// The external tool's own exit code is never an error, see
/// [`FallibleProcessResult`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("request has an empty argv")]
    EmptyArgv,
    #[error("sandbox setup failed: {source}")]
    Store {
        #[source]
        source: Arc<StoreError>,
    },
    #[error("sandbox i/o at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl ExecutionError {
    fn store(source: StoreError) -> Self {
        ExecutionError::Store {
            source: Arc::new(source),
        }
    }

    fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        ExecutionError::Io {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }
}

type SharedExecution = Shared<BoxFuture<'static, Result<FallibleProcessResult, ExecutionError>>>;

/// Runs [`ProcessRequest`]s in sandboxes and caches their results.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("sandbox_root", &self.inner.sandbox_root)
            .field("keep_sandboxes", &self.inner.keep_sandboxes)
            .finish_non_exhaustive()
    }
}

struct ExecutorInner {
    store: ContentStore,
    sandbox_root: PathBuf,
    keep_sandboxes: bool,
    /// The number of processes allowed to run at once.
    permits: Semaphore,
    /// In-flight and completed executions, keyed by the request cache key.
    cache: Mutex<HashMap<Xxh64Hash, SharedExecution>>,
    /// Allocator for session tokens.
    sessions: Mutex<Gen<SessionToken>>,
    /// Count of real child processes spawned, i.e. cache misses.
    executions: AtomicU64,
}

impl Executor {
    pub fn new(store: ContentStore, configs: &ConfigSet) -> Self {
        let sandbox_root = {
            let configured = SANDBOX_ROOT.read(configs);
            if configured.is_empty() {
                std::env::temp_dir()
            } else {
                PathBuf::from(configured.as_str())
            }
        };
        let parallelism = usize::try_from(PROCESS_PARALLELISM.read(configs))
            .expect("process_parallelism out of range");

        Executor {
            inner: Arc::new(ExecutorInner {
                store,
                sandbox_root,
                keep_sandboxes: KEEP_SANDBOXES.read(configs),
                permits: Semaphore::new(parallelism),
                cache: Mutex::new(HashMap::new()),
                sessions: Mutex::new(Gen::default()),
                executions: AtomicU64::new(0),
            }),
        }
    }

    /// Mint a token for a new top-level session.
    pub fn new_session(&self) -> SessionToken {
        let mut sessions = self.inner.sessions.lock().expect("sessions lock poisoned");
        sessions.next()
    }

    /// The number of child processes actually spawned so far.
    ///
    /// Cache hits and collapsed concurrent requests don't count.
    pub fn executions(&self) -> u64 {
        self.inner.executions.load(Ordering::SeqCst)
    }

    /// Run `request` in a sandbox, or reuse a cached result.
    ///
    /// Concurrent identical requests under the same cache key collapse to a
    /// single underlying execution, with every caller awaiting that result.
    pub async fn execute(
        &self,
        request: ProcessRequest,
        session: SessionToken,
    ) -> Result<FallibleProcessResult, ExecutionError> {
        let key = request.cache_key(session);
        let scope = request.cache_scope;

        let shared = {
            let mut cache = self.inner.cache.lock().expect("cache lock poisoned");
            match cache.get(&key) {
                Some(existing) => {
                    tracing::debug!(%key, description = %request.description, "reusing process result");
                    existing.clone()
                }
                None => {
                    let fut = run_uncached(Arc::clone(&self.inner), request)
                        .boxed()
                        .shared();
                    cache.insert(key, fut.clone());
                    fut
                }
            }
        };

        let result = shared.await;

        // Results that must not be reused are dropped from the cache, so an
        // identical request re-executes.
        let evict = match &result {
            Err(_) => true,
            Ok(outcome) => scope == CacheScope::PerRestartSuccessful && !outcome.is_success(),
        };
        if evict {
            let mut cache = self.inner.cache.lock().expect("cache lock poisoned");
            cache.remove(&key);
        }

        result
    }
}

async fn run_uncached(
    inner: Arc<ExecutorInner>,
    request: ProcessRequest,
) -> Result<FallibleProcessResult, ExecutionError> {
    let _permit = inner
        .permits
        .acquire()
        .await
        .expect("executor semaphore never closes");
    inner.executions.fetch_add(1, Ordering::SeqCst);

    let program = request.argv.first().ok_or(ExecutionError::EmptyArgv)?.clone();

    // Seed the sandbox from the input digest.
    let sandbox = inner
        .sandbox_root
        .join(format!("quarry-sandbox-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&sandbox)
        .await
        .map_err(|source| ExecutionError::io(&sandbox, source))?;
    inner
        .store
        .materialize(request.input_digest, sandbox.clone())
        .await
        .map_err(ExecutionError::store)?;

    tracing::debug!(
        description = %request.description,
        %program,
        sandbox = %sandbox.display(),
        "spawning process"
    );

    let mut command = tokio::process::Command::new(&program);
    command
        .args(&request.argv[1..])
        .env_clear()
        .envs(&request.env)
        .current_dir(&sandbox)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| ExecutionError::Spawn {
        program: program.clone(),
        source: Arc::new(source),
    })?;

    // Drain the pipes concurrently with waiting so a chatty child can't
    // fill a pipe and stall.
    let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let (status, timed_out) = match request.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => {
                let status = status.map_err(|source| ExecutionError::io(&sandbox, source))?;
                (status, false)
            }
            Err(_elapsed) => {
                tracing::warn!(
                    description = %request.description,
                    ?limit,
                    "process exceeded its timeout, killing it"
                );
                child
                    .kill()
                    .await
                    .map_err(|source| ExecutionError::io(&sandbox, source))?;
                let status = child
                    .wait()
                    .await
                    .map_err(|source| ExecutionError::io(&sandbox, source))?;
                (status, true)
            }
        },
        None => {
            let status = child
                .wait()
                .await
                .map_err(|source| ExecutionError::io(&sandbox, source))?;
            (status, false)
        }
    };

    let stdout = stdout_task.await.expect("stdout reader panicked");
    let stderr = stderr_task.await.expect("stderr reader panicked");

    let exit_code = if timed_out {
        -1
    } else {
        status.code().unwrap_or(-1)
    };

    let stdout_digest = inner.store.put(stdout);
    let stderr_digest = inner.store.put(stderr);
    let output_digest = if request.output_paths.is_empty() {
        inner.store.empty_digest()
    } else {
        inner
            .store
            .capture(sandbox.clone(), request.output_paths.clone())
            .await
            .map_err(ExecutionError::store)?
    };

    if inner.keep_sandboxes {
        tracing::info!(sandbox = %sandbox.display(), "keeping sandbox");
    } else if let Err(err) = tokio::fs::remove_dir_all(&sandbox).await {
        tracing::warn!(sandbox = %sandbox.display(), %err, "failed to clean up sandbox");
    }

    Ok(FallibleProcessResult {
        exit_code,
        stdout_digest,
        stderr_digest,
        output_digest,
        timed_out,
    })
}
