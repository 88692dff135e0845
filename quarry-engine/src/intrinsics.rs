//! Intrinsic rules exposing store and executor operations as products.

use quarry_ore::hash::Xxh3Hasher;
use quarry_process::ProcessRequest;
use quarry_types::Digest;

use crate::registry::{Param, RegistryBuilder, RuleDef};
use crate::scheduler::Context;

fn fold_digest(digest: &Digest, hasher: &mut Xxh3Hasher) {
    hasher.update(digest.hash().as_bytes());
    hasher.update(&digest.size().to_le_bytes());
}

/// Request to store literal files as a new tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDigest(pub Vec<(String, Vec<u8>)>);

impl Param for CreateDigest {
    fn param_fingerprint(&self, hasher: &mut Xxh3Hasher) {
        for (name, bytes) in &self.0 {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
            hasher.update(bytes);
            hasher.update(&[0]);
        }
    }
}

/// Request to merge trees into one, failing on conflicting content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeDigests(pub Vec<Digest>);

impl Param for MergeDigests {
    fn param_fingerprint(&self, hasher: &mut Xxh3Hasher) {
        for digest in &self.0 {
            fold_digest(digest, hasher);
        }
    }
}

/// Request to strip a leading directory from a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovePrefix {
    pub digest: Digest,
    pub prefix: String,
}

impl Param for RemovePrefix {
    fn param_fingerprint(&self, hasher: &mut Xxh3Hasher) {
        fold_digest(&self.digest, hasher);
        hasher.update(self.prefix.as_bytes());
    }
}

/// Request for the file listing of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRequest(pub Digest);

impl Param for SnapshotRequest {
    fn param_fingerprint(&self, hasher: &mut Xxh3Hasher) {
        fold_digest(&self.0, hasher);
    }
}

impl Param for ProcessRequest {
    fn param_fingerprint(&self, hasher: &mut Xxh3Hasher) {
        self.fingerprint(hasher)
    }
}

/// Register the intrinsic rules into `builder`. Engines are expected to
/// call this once during wiring.
pub fn register(builder: &mut RegistryBuilder) {
    builder
        .rule(
            RuleDef::new("create_digest", |ctx: Context| async move {
                let request = ctx.param::<CreateDigest>()?;
                let entries: Vec<(&str, &[u8])> = request
                    .0
                    .iter()
                    .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
                    .collect();
                Ok(ctx.store().put_files(&entries)?)
            })
            .param::<CreateDigest>(),
        )
        .rule(
            RuleDef::new("merge_digests", |ctx: Context| async move {
                let request = ctx.param::<MergeDigests>()?;
                Ok(ctx.store().merge(&request.0)?)
            })
            .param::<MergeDigests>(),
        )
        .rule(
            RuleDef::new("remove_prefix", |ctx: Context| async move {
                let request = ctx.param::<RemovePrefix>()?;
                Ok(ctx.store().remove_prefix(request.digest, &request.prefix)?)
            })
            .param::<RemovePrefix>(),
        )
        .rule(
            RuleDef::new("snapshot", |ctx: Context| async move {
                let request = ctx.param::<SnapshotRequest>()?;
                Ok(ctx.store().snapshot(request.0)?)
            })
            .param::<SnapshotRequest>(),
        )
        .rule(
            RuleDef::new("execute_process", |ctx: Context| async move {
                let request = ctx.param::<ProcessRequest>()?;
                ctx.execute((*request).clone()).await
            })
            .param::<ProcessRequest>(),
        );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quarry_cfg::ConfigSet;
    use quarry_process::{Executor, FallibleProcessResult};
    use quarry_store::{ContentStore, Snapshot, StoreError};

    use super::*;
    use crate::registry::{Params, Registry};
    use crate::scheduler::{RuleError, Session};

    fn session() -> Session {
        let mut configs = ConfigSet::builder();
        quarry_process::executor::register_configs(&mut configs);
        let configs = configs.build();

        let mut builder = Registry::builder();
        register(&mut builder);
        let registry = builder.build().unwrap();

        let store = ContentStore::new();
        let executor = Executor::new(store.clone(), &configs);
        let token = executor.new_session();
        Session::new(Arc::new(registry), store, executor, token)
    }

    #[tokio::test]
    async fn smoketest_store_intrinsics() {
        let session = session();

        let left = session
            .query::<Digest>(Params::single(CreateDigest(vec![(
                "a/one.txt".to_string(),
                b"one".to_vec(),
            )])))
            .await
            .unwrap();
        let right = session
            .query::<Digest>(Params::single(CreateDigest(vec![(
                "a/two.txt".to_string(),
                b"two".to_vec(),
            )])))
            .await
            .unwrap();

        let merged = session
            .query::<Digest>(Params::single(MergeDigests(vec![*left, *right])))
            .await
            .unwrap();
        assert_eq!(*merged, session.store().merge(&[*left, *right]).unwrap());

        let stripped = session
            .query::<Digest>(Params::single(RemovePrefix {
                digest: *merged,
                prefix: "a".to_string(),
            }))
            .await
            .unwrap();
        let snapshot = session
            .query::<Snapshot>(Params::single(SnapshotRequest(*stripped)))
            .await
            .unwrap();
        assert_eq!(snapshot.files, vec!["one.txt", "two.txt"]);
    }

    #[tokio::test]
    async fn merge_conflicts_surface_as_rule_errors() {
        let session = session();

        let left = session.store().put_files(&[("f.txt", b"x")]).unwrap();
        let right = session.store().put_files(&[("f.txt", b"y")]).unwrap();

        let err = session
            .query::<Digest>(Params::single(MergeDigests(vec![left, right])))
            .await
            .unwrap_err();
        let stack = err.rule_stack();
        assert_eq!(stack, vec!["merge_digests"]);

        let mut source: &dyn std::error::Error = &err;
        while let Some(next) = source.source() {
            source = next;
        }
        assert!(source.to_string().contains("conflict"));
    }

    #[tokio::test]
    async fn processes_run_through_the_intrinsic() {
        let session = session();

        let request = ProcessRequest::new(
            ["/bin/sh", "-c", "echo from-intrinsic"],
            session.store().empty_digest(),
        );
        let result = session
            .query::<FallibleProcessResult>(Params::single(request))
            .await
            .unwrap();
        assert!(result.is_success());
        let stdout = session.store().get_blob(result.stdout_digest).unwrap();
        assert_eq!(&stdout[..], b"from-intrinsic\n");
    }

    #[tokio::test]
    async fn missing_trees_surface_as_store_errors() {
        let session = session();

        let bogus = quarry_types::Digest::new(quarry_types::Fingerprint::new([9; 32]), 42);
        let err = session
            .query::<Snapshot>(Params::single(SnapshotRequest(bogus)))
            .await
            .unwrap_err();
        let RuleError::InRule { source, .. } = err else {
            panic!("expected a rule-attributed error, got {err:?}");
        };
        assert!(matches!(
            *source,
            RuleError::Store { ref source } if matches!(**source, StoreError::MissingDigest { .. })
        ));
    }
}
