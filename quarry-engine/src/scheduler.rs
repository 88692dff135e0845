//! The memoizing scheduler that drives rules to completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use quarry_process::executor::ExecutionError;
use quarry_process::{Executor, FallibleProcessResult, ProcessRequest, SessionToken};
use quarry_store::{ContentStore, StoreError};
use quarry_types::Xxh64Hash;

use crate::registry::{Param, ParamValue, Params, Product, ProductId, Registry, RuleDef, Value};
use crate::target::Target;
use crate::unions::Union;

/// Errors surfaced while running rules.
///
/// Cheap to clone so results can be memoized, errors included.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuleError {
    #[error("no rule produces '{product}'")]
    NoRule { product: &'static str },
    #[error("rules produce '{product}', but none match the available params")]
    NoMatchingRule { product: &'static str },
    #[error("rules {rules:?} all match for '{product}'")]
    AmbiguousRules {
        product: &'static str,
        rules: Vec<&'static str>,
    },
    #[error("rule '{rule}' requires a param of type '{product}'")]
    MissingParam {
        rule: &'static str,
        product: &'static str,
    },
    #[error("no union named '{union}' is registered")]
    NoUnion { union: &'static str },
    #[error("a value of type '{product}' had an unexpected concrete type")]
    WrongProduct { product: &'static str },
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("store error: {source}")]
    Store {
        #[source]
        source: Arc<StoreError>,
    },
    #[error("{message}")]
    Failed { message: String },
    #[error("{source}\n  while running rule '{rule}'")]
    InRule {
        rule: &'static str,
        #[source]
        source: Box<RuleError>,
    },
}

impl RuleError {
    /// A rule-level failure with a human readable message.
    pub fn failed(message: impl Into<String>) -> Self {
        RuleError::Failed {
            message: message.into(),
        }
    }

    /// The names of the rules this error propagated through, innermost last.
    pub fn rule_stack(&self) -> Vec<&'static str> {
        let mut stack = Vec::new();
        let mut current = self;
        while let RuleError::InRule { rule, source } = current {
            stack.push(*rule);
            current = source;
        }
        stack
    }
}

impl From<StoreError> for RuleError {
    fn from(source: StoreError) -> Self {
        RuleError::Store {
            source: Arc::new(source),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    product: ProductId,
    params: Xxh64Hash,
}

type SharedSolve = Shared<BoxFuture<'static, Result<Value, RuleError>>>;

pub(crate) struct SessionInner {
    pub(crate) registry: Arc<Registry>,
    pub(crate) store: ContentStore,
    pub(crate) executor: Executor,
    pub(crate) token: SessionToken,
    memo: Mutex<HashMap<MemoKey, SharedSolve>>,
}

/// One top-level invocation of the engine.
///
/// Every product computed within a session is memoized for its lifetime, so
/// identical requests collapse to a single rule execution.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        registry: Arc<Registry>,
        store: ContentStore,
        executor: Executor,
        token: SessionToken,
    ) -> Self {
        Session {
            inner: Arc::new(SessionInner {
                registry,
                store,
                executor,
                token,
                memo: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn token(&self) -> SessionToken {
        self.inner.token
    }

    pub fn store(&self) -> &ContentStore {
        &self.inner.store
    }

    /// Compute the product `T` from the given params.
    ///
    /// Singletons registered with `provide` are in scope too, with query
    /// params overriding them.
    pub async fn query<T: Product>(&self, params: Params) -> Result<Arc<T>, RuleError> {
        let params = params.merged_over(self.inner.registry.singletons());
        let value = solve(Arc::clone(&self.inner), ProductId::of::<T>(), params).await?;
        value
            .downcast::<T>()
            .ok_or(RuleError::WrongProduct {
                product: ProductId::of::<T>().short(),
            })
    }

    /// Fan a query for `O` out across every member of union `U`, for every
    /// applicable target. See [`crate::unions`].
    pub async fn query_union<O: Product, U: Union>(
        &self,
        params: Params,
        targets: &[Target],
    ) -> Result<Vec<Arc<O>>, RuleError> {
        let params = params.merged_over(self.inner.registry.singletons());
        crate::unions::query_union::<O, U>(Arc::clone(&self.inner), params, targets).await
    }
}

/// Handed to every rule invocation. Carries the param set the rule was
/// selected with and access back into the session.
#[derive(Clone)]
pub struct Context {
    pub(crate) session: Arc<SessionInner>,
    pub(crate) params: Params,
    rule: &'static str,
}

impl Context {
    /// The param of type `P` this rule was invoked with.
    pub fn param<P: Param>(&self) -> Result<Arc<P>, RuleError> {
        let id = ProductId::of::<P>();
        let param = self.params.get(id).ok_or(RuleError::MissingParam {
            rule: self.rule,
            product: id.short(),
        })?;
        param
            .value()
            .downcast::<P>()
            .ok_or(RuleError::WrongProduct { product: id.short() })
    }

    /// Await the product `T`, computed with this rule's params.
    pub async fn get<T: Product>(&self) -> Result<Arc<T>, RuleError> {
        let value = solve(
            Arc::clone(&self.session),
            ProductId::of::<T>(),
            self.params.clone(),
        )
        .await?;
        value.downcast::<T>().ok_or(RuleError::WrongProduct {
            product: ProductId::of::<T>().short(),
        })
    }

    /// Await the product `T`, with `param` added to this rule's params.
    pub async fn get_with<T: Product, P: Param>(&self, param: P) -> Result<Arc<T>, RuleError> {
        let params = self.params.clone().with(ParamValue::new(param));
        let value = solve(Arc::clone(&self.session), ProductId::of::<T>(), params).await?;
        value.downcast::<T>().ok_or(RuleError::WrongProduct {
            product: ProductId::of::<T>().short(),
        })
    }

    /// Await one product `T` per input param, concurrently.
    ///
    /// Fails fast: the first error wins and the rest are dropped.
    pub async fn get_all<T: Product, P: Param>(
        &self,
        params: impl IntoIterator<Item = P>,
    ) -> Result<Vec<Arc<T>>, RuleError> {
        let futures: Vec<_> = params
            .into_iter()
            .map(|param| {
                let params = self.params.clone().with(ParamValue::new(param));
                solve(Arc::clone(&self.session), ProductId::of::<T>(), params)
            })
            .collect();
        let values = futures::future::try_join_all(futures).await?;
        values
            .into_iter()
            .map(|value| {
                value.downcast::<T>().ok_or(RuleError::WrongProduct {
                    product: ProductId::of::<T>().short(),
                })
            })
            .collect()
    }

    /// Fan out across a union, like [`Session::query_union`], inheriting
    /// this rule's params.
    pub async fn query_union<O: Product, U: Union>(
        &self,
        targets: &[Target],
    ) -> Result<Vec<Arc<O>>, RuleError> {
        crate::unions::query_union::<O, U>(
            Arc::clone(&self.session),
            self.params.clone(),
            targets,
        )
        .await
    }

    pub fn store(&self) -> &ContentStore {
        &self.session.store
    }

    /// Run a sandboxed process through the session's executor.
    pub async fn execute(
        &self,
        request: ProcessRequest,
    ) -> Result<FallibleProcessResult, RuleError> {
        let result = self
            .session
            .executor
            .execute(request, self.session.token)
            .await?;
        Ok(result)
    }
}

/// Pick the rule to run for `product` given the available params.
///
/// Rules whose declared params are all present are candidates, and the most
/// specific candidate wins. A tie is ambiguous.
fn select_rule(
    registry: &Registry,
    product: ProductId,
    params: &Params,
) -> Result<Arc<RuleDef>, RuleError> {
    let candidates = registry.rules_for(product);
    if candidates.is_empty() {
        return Err(RuleError::NoRule {
            product: product.short(),
        });
    }

    let mut matching: Vec<&Arc<RuleDef>> = candidates
        .iter()
        .filter(|rule| rule.params.iter().all(|param| params.contains(*param)))
        .collect();
    if matching.is_empty() {
        return Err(RuleError::NoMatchingRule {
            product: product.short(),
        });
    }

    matching.sort_by_key(|rule| std::cmp::Reverse(rule.params.len()));
    if matching.len() > 1 && matching[0].params.len() == matching[1].params.len() {
        let most = matching[0].params.len();
        return Err(RuleError::AmbiguousRules {
            product: product.short(),
            rules: matching
                .iter()
                .take_while(|rule| rule.params.len() == most)
                .map(|rule| rule.name)
                .collect(),
        });
    }
    Ok(Arc::clone(matching[0]))
}

/// Compute `product` from `params`, reusing the session memo when possible.
pub(crate) fn solve(
    session: Arc<SessionInner>,
    product: ProductId,
    params: Params,
) -> BoxFuture<'static, Result<Value, RuleError>> {
    async move {
        let rule = match select_rule(&session.registry, product, &params) {
            Ok(rule) => rule,
            Err(err) => {
                // A param of the requested type satisfies the request
                // directly when no rule does.
                if let Some(param) = params.get(product) {
                    return Ok(param.value().clone());
                }
                return Err(err);
            }
        };

        let key = MemoKey {
            product,
            params: params.fingerprint(),
        };
        let shared = {
            let mut memo = session.memo.lock().expect("memo lock poisoned");
            match memo.get(&key) {
                Some(existing) => {
                    tracing::trace!(%product, "memo hit");
                    existing.clone()
                }
                None => {
                    tracing::debug!(%product, rule = rule.name, "running rule");
                    let ctx = Context {
                        session: Arc::clone(&session),
                        params,
                        rule: rule.name,
                    };
                    let fut = async move {
                        (rule.run)(ctx).await.map_err(|source| {
                            RuleError::InRule {
                                rule: rule.name,
                                source: Box::new(source),
                            }
                        })
                    }
                    .boxed()
                    .shared();
                    memo.insert(key, fut.clone());
                    fut
                }
            }
        };
        shared.await
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use quarry_cfg::ConfigSet;
    use quarry_ore::hash::Xxh3Hasher;

    use super::*;
    use crate::registry::RuleDef;

    #[derive(Debug, PartialEq, Eq)]
    struct Greeting(String);

    #[derive(Debug)]
    struct Name(&'static str);

    impl Param for Name {
        fn param_fingerprint(&self, hasher: &mut Xxh3Hasher) {
            hasher.update(self.0.as_bytes());
        }
    }

    #[derive(Debug)]
    struct Number(u64);

    impl Param for Number {
        fn param_fingerprint(&self, hasher: &mut Xxh3Hasher) {
            hasher.update(&self.0.to_le_bytes());
        }
    }

    fn session_for(registry: Registry) -> Session {
        let mut configs = ConfigSet::builder();
        quarry_process::executor::register_configs(&mut configs);
        let configs = configs.build();

        let store = ContentStore::new();
        let executor = Executor::new(store.clone(), &configs);
        let token = executor.new_session();
        Session::new(Arc::new(registry), store, executor, token)
    }

    #[tokio::test]
    async fn smoketest_query() {
        let mut builder = Registry::builder();
        builder.rule(
            RuleDef::new("greet", |ctx: Context| async move {
                let name = ctx.param::<Name>()?;
                Ok(Greeting(format!("hello {}", name.0)))
            })
            .param::<Name>(),
        );
        let session = session_for(builder.build().unwrap());

        let greeting = session
            .query::<Greeting>(Params::single(Name("world")))
            .await
            .unwrap();
        assert_eq!(*greeting, Greeting("hello world".to_string()));
    }

    #[tokio::test]
    async fn rules_chain_through_get() {
        struct Shouted(String);

        let mut builder = Registry::builder();
        builder
            .rule(
                RuleDef::new("greet", |ctx: Context| async move {
                    let name = ctx.param::<Name>()?;
                    Ok(Greeting(format!("hello {}", name.0)))
                })
                .param::<Name>(),
            )
            .rule(
                RuleDef::new("shout", |ctx: Context| async move {
                    let greeting = ctx.get::<Greeting>().await?;
                    Ok(Shouted(greeting.0.to_uppercase()))
                })
                .dep::<Greeting>(),
            );
        let session = session_for(builder.build().unwrap());

        let shouted = session
            .query::<Shouted>(Params::single(Name("world")))
            .await
            .unwrap();
        assert_eq!(shouted.0, "HELLO WORLD");
    }

    #[tokio::test]
    async fn identical_queries_run_the_rule_once() {
        static RUNS: AtomicU64 = AtomicU64::new(0);

        struct Computed(u64);

        let mut builder = Registry::builder();
        builder.rule(
            RuleDef::new("compute", |ctx: Context| async move {
                let name = ctx.param::<Name>()?;
                RUNS.fetch_add(1, Ordering::SeqCst);
                Ok(Computed(name.0.len() as u64))
            })
            .param::<Name>(),
        );
        let session = session_for(builder.build().unwrap());

        let (a, b) = tokio::join!(
            session.query::<Computed>(Params::single(Name("same"))),
            session.query::<Computed>(Params::single(Name("same"))),
        );
        assert_eq!(a.unwrap().0, b.unwrap().0);
        session
            .query::<Computed>(Params::single(Name("same")))
            .await
            .unwrap();
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);

        // A different param is a different memo entry.
        session
            .query::<Computed>(Params::single(Name("other")))
            .await
            .unwrap();
        assert_eq!(RUNS.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn chained_rules_each_run_once() {
        static A_RUNS: AtomicU64 = AtomicU64::new(0);
        static B_RUNS: AtomicU64 = AtomicU64::new(0);

        struct A(u64);
        struct B(u64);

        let mut builder = Registry::builder();
        builder
            .rule(RuleDef::new("make_a", |_ctx| async {
                A_RUNS.fetch_add(1, Ordering::SeqCst);
                Ok(A(2))
            }))
            .rule(
                RuleDef::new("make_b", |ctx: Context| async move {
                    let a = ctx.get::<A>().await?;
                    B_RUNS.fetch_add(1, Ordering::SeqCst);
                    Ok(B(a.0 * 3))
                })
                .dep::<A>(),
            );
        let session = session_for(builder.build().unwrap());

        let first = session.query::<B>(Params::new()).await.unwrap();
        let second = session.query::<B>(Params::new()).await.unwrap();
        assert_eq!(first.0, 6);
        assert_eq!(second.0, 6);
        assert_eq!(A_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(B_RUNS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_with_extends_the_param_set() {
        struct Relayed(String);

        let mut builder = Registry::builder();
        builder
            .rule(
                RuleDef::new("greet", |ctx: Context| async move {
                    let name = ctx.param::<Name>()?;
                    Ok(Greeting(format!("hello {}", name.0)))
                })
                .param::<Name>(),
            )
            .rule(
                RuleDef::new("relay", |ctx: Context| async move {
                    let greeting = ctx.get_with::<Greeting, Name>(Name("relayed")).await?;
                    Ok(Relayed(greeting.0.clone()))
                })
                .dep::<Greeting>(),
            );
        let session = session_for(builder.build().unwrap());

        let relayed = session.query::<Relayed>(Params::new()).await.unwrap();
        assert_eq!(relayed.0, "hello relayed");
    }

    #[tokio::test]
    async fn batches_fail_fast() {
        struct Doubled(u64);
        #[derive(Debug)]
        struct Summed(u64);

        let mut builder = Registry::builder();
        builder
            .rule(
                RuleDef::new("double", |ctx: Context| async move {
                    let number = ctx.param::<Number>()?;
                    if number.0 % 2 != 0 {
                        return Err(RuleError::failed(format!("{} is odd", number.0)));
                    }
                    Ok(Doubled(number.0 * 2))
                })
                .param::<Number>(),
            )
            .rule(RuleDef::new("batch", |ctx: Context| async move {
                let doubled = ctx
                    .get_all::<Doubled, Number>([2, 3, 4].map(Number))
                    .await?;
                Ok(Summed(doubled.iter().map(|d| d.0).sum()))
            }));
        let session = session_for(builder.build().unwrap());

        // One failing item aborts the whole batch, no partial results.
        let err = session.query::<Summed>(Params::new()).await.unwrap_err();
        assert_eq!(err.rule_stack(), vec!["batch", "double"]);
        assert!(err.to_string().contains("3 is odd"));
    }

    #[tokio::test]
    async fn concurrent_batches_share_memo_entries() {
        static DOUBLE_RUNS: AtomicU64 = AtomicU64::new(0);

        struct Doubled(u64);
        struct SumEven(u64);
        struct SumAll(u64);

        let mut builder = Registry::builder();
        builder
            .rule(
                RuleDef::new("double", |ctx: Context| async move {
                    let number = ctx.param::<Number>()?;
                    DOUBLE_RUNS.fetch_add(1, Ordering::SeqCst);
                    Ok(Doubled(number.0 * 2))
                })
                .param::<Number>(),
            )
            .rule(RuleDef::new("sum_even", |ctx: Context| async move {
                let doubled = ctx.get_all::<Doubled, Number>([2, 4].map(Number)).await?;
                Ok(SumEven(doubled.iter().map(|d| d.0).sum()))
            }))
            .rule(RuleDef::new("sum_all", |ctx: Context| async move {
                let doubled = ctx
                    .get_all::<Doubled, Number>([1, 2, 3, 4].map(Number))
                    .await?;
                Ok(SumAll(doubled.iter().map(|d| d.0).sum()))
            }));
        let session = session_for(builder.build().unwrap());

        let (even, all) = tokio::join!(
            session.query::<SumEven>(Params::new()),
            session.query::<SumAll>(Params::new()),
        );
        assert_eq!(even.unwrap().0, 12);
        assert_eq!(all.unwrap().0, 20);
        // The overlapping inputs ran once each across both batches.
        assert_eq!(DOUBLE_RUNS.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn sibling_gets_share_one_execution() {
        static BASE_RUNS: AtomicU64 = AtomicU64::new(0);

        struct Base(u64);
        struct Left(u64);
        struct Right(u64);
        struct Both(u64);

        let mut builder = Registry::builder();
        builder
            .rule(
                RuleDef::new("base", |ctx: Context| async move {
                    let name = ctx.param::<Name>()?;
                    BASE_RUNS.fetch_add(1, Ordering::SeqCst);
                    Ok(Base(name.0.len() as u64))
                })
                .param::<Name>(),
            )
            .rule(
                RuleDef::new("left", |ctx: Context| async move {
                    let base = ctx.get::<Base>().await?;
                    Ok(Left(base.0 + 1))
                })
                .dep::<Base>(),
            )
            .rule(
                RuleDef::new("right", |ctx: Context| async move {
                    let base = ctx.get::<Base>().await?;
                    Ok(Right(base.0 * 2))
                })
                .dep::<Base>(),
            )
            .rule(
                RuleDef::new("both", |ctx: Context| async move {
                    let (left, right) =
                        tokio::try_join!(ctx.get::<Left>(), ctx.get::<Right>())?;
                    Ok(Both(left.0 + right.0))
                })
                .dep::<Left>()
                .dep::<Right>(),
            );
        let session = session_for(builder.build().unwrap());

        let both = session
            .query::<Both>(Params::single(Name("five!")))
            .await
            .unwrap();
        assert_eq!(both.0, 16);
        assert_eq!(BASE_RUNS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn params_select_between_rules() {
        struct Styled(String);

        let mut builder = Registry::builder();
        builder
            .rule(RuleDef::new("plain", |_ctx| async {
                Ok(Styled("plain".to_string()))
            }))
            .rule(
                RuleDef::new("named", |ctx: Context| async move {
                    let name = ctx.param::<Name>()?;
                    Ok(Styled(format!("named {}", name.0)))
                })
                .param::<Name>(),
            );
        let session = session_for(builder.build().unwrap());

        let plain = session.query::<Styled>(Params::new()).await.unwrap();
        assert_eq!(plain.0, "plain");

        let named = session
            .query::<Styled>(Params::single(Name("x")))
            .await
            .unwrap();
        assert_eq!(named.0, "named x");
    }

    #[tokio::test]
    async fn errors_carry_the_rule_stack() {
        #[derive(Debug)]
        struct Outer;
        struct Inner;

        let mut builder = Registry::builder();
        builder
            .rule(
                RuleDef::new("outer", |ctx: Context| async move {
                    let _inner = ctx.get::<Inner>().await?;
                    Ok(Outer)
                })
                .dep::<Inner>(),
            )
            .rule(RuleDef::new("inner", |_ctx| async {
                Err::<Inner, _>(RuleError::failed("the inner rule broke"))
            }));
        let session = session_for(builder.build().unwrap());

        let err = session.query::<Outer>(Params::new()).await.unwrap_err();
        assert_eq!(err.rule_stack(), vec!["outer", "inner"]);
        assert!(err.to_string().contains("the inner rule broke"));
    }

    #[tokio::test]
    async fn missing_rules_and_params_are_errors() {
        #[derive(Debug)]
        struct Nowhere;

        let mut builder = Registry::builder();
        builder.rule(
            RuleDef::new("greet", |ctx: Context| async move {
                let name = ctx.param::<Name>()?;
                Ok(Greeting(format!("hello {}", name.0)))
            })
            .param::<Name>(),
        );
        let session = session_for(builder.build().unwrap());

        let err = session.query::<Nowhere>(Params::new()).await.unwrap_err();
        assert!(matches!(err, RuleError::NoRule { product: "Nowhere" }));

        let err = session.query::<Greeting>(Params::new()).await.unwrap_err();
        assert!(matches!(err, RuleError::NoMatchingRule { .. }));
    }

    #[tokio::test]
    async fn singletons_reach_every_rule() {
        struct Threshold(u64);
        impl Param for Threshold {
            fn param_fingerprint(&self, hasher: &mut Xxh3Hasher) {
                hasher.update(&self.0.to_le_bytes());
            }
        }
        struct Verdict(bool);

        let mut builder = Registry::builder();
        builder
            .provide(Threshold(3))
            .rule(
                RuleDef::new("judge", |ctx: Context| async move {
                    let name = ctx.param::<Name>()?;
                    let threshold = ctx.param::<Threshold>()?;
                    Ok(Verdict(name.0.len() as u64 > threshold.0))
                })
                .param::<Name>()
                .param::<Threshold>(),
            );
        let session = session_for(builder.build().unwrap());

        let verdict = session
            .query::<Verdict>(Params::single(Name("long enough")))
            .await
            .unwrap();
        assert!(verdict.0);

        // A query param of the same type overrides the singleton.
        let verdict = session
            .query::<Verdict>(
                Params::single(Name("long enough")).with(ParamValue::new(Threshold(100))),
            )
            .await
            .unwrap();
        assert!(!verdict.0);
    }

    #[tokio::test]
    async fn a_param_satisfies_its_own_type() {
        let session = session_for(Registry::builder().build().unwrap());

        let name = session
            .query::<Name>(Params::single(Name("direct")))
            .await
            .unwrap();
        assert_eq!(name.0, "direct");
    }
}
