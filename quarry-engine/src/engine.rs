//! Top-level wiring of configs, store, executor, and registry.

use std::sync::Arc;

use quarry_cfg::{ConfigSet, ConfigSetBuilder};
use quarry_process::Executor;
use quarry_store::ContentStore;

use crate::registry::Registry;
use crate::scheduler::Session;

/// Register every config the engine and its subsystems read.
pub fn register_configs(builder: &mut ConfigSetBuilder) {
    quarry_process::executor::register_configs(builder);
    builder.register(&crate::defs::DEFS_FILENAME);
}

/// Owns the long-lived pieces of one engine process: a validated registry,
/// the content store, and the process executor. Cheap to share.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    store: ContentStore,
    executor: Executor,
    configs: ConfigSet,
}

impl Engine {
    pub fn new(registry: Registry, configs: ConfigSet) -> Self {
        let store = ContentStore::new();
        let executor = Executor::new(store.clone(), &configs);
        Engine {
            registry: Arc::new(registry),
            store,
            executor,
            configs,
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn configs(&self) -> &ConfigSet {
        &self.configs
    }

    /// Mint a new [`Session`] with a fresh token and an empty memo.
    pub fn session(&self) -> Session {
        Session::new(
            Arc::clone(&self.registry),
            self.store.clone(),
            self.executor.clone(),
            self.executor.new_session(),
        )
    }
}

#[cfg(test)]
mod tests {
    use quarry_process::{CacheScope, ProcessRequest};

    use super::*;
    use crate::registry::Params;

    fn engine() -> Engine {
        let mut configs = ConfigSet::builder();
        register_configs(&mut configs);
        let configs = configs.build();

        let mut builder = Registry::builder();
        crate::intrinsics::register(&mut builder);
        Engine::new(builder.build().unwrap(), configs)
    }

    #[test]
    fn sessions_get_distinct_tokens() {
        let engine = engine();
        assert_ne!(engine.session().token(), engine.session().token());
    }

    #[tokio::test]
    async fn always_scoped_results_cross_sessions() {
        let engine = engine();
        let request = ProcessRequest::new(
            ["/bin/sh", "-c", "echo shared"],
            engine.store().empty_digest(),
        );

        let first = engine
            .session()
            .query::<quarry_process::FallibleProcessResult>(Params::single(request.clone()))
            .await
            .unwrap();
        let second = engine
            .session()
            .query::<quarry_process::FallibleProcessResult>(Params::single(request))
            .await
            .unwrap();
        assert_eq!(*first, *second);
        assert_eq!(engine.executor.executions(), 1);
    }

    #[tokio::test]
    async fn per_session_results_do_not_cross_sessions() {
        let engine = engine();
        let request = ProcessRequest::new(
            ["/bin/sh", "-c", "echo fresh"],
            engine.store().empty_digest(),
        )
        .with_cache_scope(CacheScope::PerSession);

        engine
            .session()
            .query::<quarry_process::FallibleProcessResult>(Params::single(request.clone()))
            .await
            .unwrap();
        engine
            .session()
            .query::<quarry_process::FallibleProcessResult>(Params::single(request))
            .await
            .unwrap();
        assert_eq!(engine.executor.executions(), 2);
    }
}
