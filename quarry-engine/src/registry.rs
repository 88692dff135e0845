//! Typed products, params, and the validated rule registry.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use quarry_ore::hash::Xxh3Hasher;
use quarry_types::Xxh64Hash;

use crate::scheduler::{Context, RuleError};
use crate::unions::{UnionId, UnionMember, UnionTable};

/// Anything a rule can produce. Blanket implemented, you never implement
/// this yourself.
pub trait Product: Any + Send + Sync {}

impl<T: Any + Send + Sync> Product for T {}

/// A [`Product`] that can also be provided as an input to a query.
///
/// Params get folded into memoization keys, so they must describe their
/// entire identity to the hasher.
pub trait Param: Product {
    fn param_fingerprint(&self, hasher: &mut Xxh3Hasher);
}

/// Identifies a [`Product`] type.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProductId {
    type_id: TypeId,
    name: &'static str,
}

impl ProductId {
    pub fn of<T: Product>() -> Self {
        ProductId {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The full path of the underlying type.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Just the final segment of the type path, for messages.
    pub fn short(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl fmt::Debug for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProductId({})", self.name)
    }
}

/// A type-erased [`Product`] instance.
#[derive(Clone)]
pub struct Value {
    id: ProductId,
    any: Arc<dyn Any + Send + Sync>,
}

impl Value {
    pub fn new<T: Product>(value: T) -> Self {
        Value {
            id: ProductId::of::<T>(),
            any: Arc::new(value),
        }
    }

    pub fn id(&self) -> ProductId {
        self.id
    }

    pub fn downcast<T: Product>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.any).downcast::<T>().ok()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value<{}>", self.id)
    }
}

/// A type-erased [`Param`] instance.
///
/// Carries a fingerprint closure captured while the concrete type was
/// still known, so a set of erased params can still be hashed.
#[derive(Clone)]
pub struct ParamValue {
    value: Value,
    fingerprint: Arc<dyn Fn(&mut Xxh3Hasher) + Send + Sync>,
}

impl ParamValue {
    pub fn new<P: Param>(param: P) -> Self {
        let param = Arc::new(param);
        let value = Value {
            id: ProductId::of::<P>(),
            any: Arc::clone(&param) as Arc<dyn Any + Send + Sync>,
        };
        ParamValue {
            value,
            fingerprint: Arc::new(move |hasher| param.param_fingerprint(hasher)),
        }
    }

    pub fn id(&self) -> ProductId {
        self.value.id()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn fingerprint(&self, hasher: &mut Xxh3Hasher) {
        (self.fingerprint)(hasher)
    }
}

impl fmt::Debug for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Param<{}>", self.value.id())
    }
}

/// An ordered set of [`ParamValue`]s, at most one per type.
#[derive(Clone, Default, Debug)]
pub struct Params {
    entries: BTreeMap<ProductId, ParamValue>,
}

impl Params {
    pub fn new() -> Self {
        Params::default()
    }

    pub fn single<P: Param>(param: P) -> Self {
        Params::new().with(ParamValue::new(param))
    }

    /// Insert `param`, replacing any existing param of the same type.
    pub fn insert(&mut self, param: ParamValue) {
        self.entries.insert(param.id(), param);
    }

    pub fn with(mut self, param: ParamValue) -> Self {
        self.insert(param);
        self
    }

    pub fn get(&self, id: ProductId) -> Option<&ParamValue> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: ProductId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = ProductId> + '_ {
        self.entries.keys().copied()
    }

    /// The union of `base` and `self`, with `self` winning collisions.
    pub(crate) fn merged_over(&self, base: &Params) -> Params {
        let mut merged = base.clone();
        for param in self.entries.values() {
            merged.insert(param.clone());
        }
        merged
    }

    /// Hash of every param in the set, stable within one process.
    pub fn fingerprint(&self) -> Xxh64Hash {
        let mut hasher = Xxh3Hasher::new();
        for (id, param) in &self.entries {
            hasher.update(id.name().as_bytes());
            param.fingerprint(&mut hasher);
        }
        hasher.digest()
    }
}

type RuleFn = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<Value, RuleError>> + Send + Sync>;

/// A single registered rule: a named async function from a [`Context`] to
/// one output [`Product`].
#[derive(Clone)]
pub struct RuleDef {
    pub(crate) name: &'static str,
    pub(crate) output: ProductId,
    /// Param types this rule consumes via [`Context::param`]. Also used to
    /// select between rules producing the same output.
    pub(crate) params: Vec<ProductId>,
    /// Products this rule awaits via [`Context::get`], for graph validation.
    pub(crate) deps: Vec<ProductId>,
    pub(crate) run: RuleFn,
}

impl RuleDef {
    pub fn new<O, F, Fut>(name: &'static str, run: F) -> Self
    where
        O: Product,
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, RuleError>> + Send + 'static,
    {
        RuleDef {
            name,
            output: ProductId::of::<O>(),
            params: Vec::new(),
            deps: Vec::new(),
            run: Arc::new(move |ctx| {
                let fut = run(ctx);
                async move { Ok(Value::new(fut.await?)) }.boxed()
            }),
        }
    }

    /// Declare that this rule consumes a param of type `P`.
    pub fn param<P: Param>(mut self) -> Self {
        self.params.push(ProductId::of::<P>());
        self
    }

    /// Declare that this rule awaits a product of type `D`.
    pub fn dep<D: Product>(mut self) -> Self {
        self.deps.push(ProductId::of::<D>());
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for RuleDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleDef")
            .field("name", &self.name)
            .field("output", &self.output)
            .field("params", &self.params)
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

/// Errors found while validating a [`RegistryBuilder`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("rules '{first}' and '{second}' both produce '{product}' from the same params")]
    DuplicateRule {
        product: &'static str,
        first: &'static str,
        second: &'static str,
    },
    #[error("rule '{rule}' awaits '{product}', which no rule produces")]
    UnsatisfiedDependency {
        rule: &'static str,
        product: &'static str,
    },
    #[error("rule graph contains a cycle: {}", path.join(" -> "))]
    CyclicRuleGraph { path: Vec<&'static str> },
    #[error("union '{union}' registers '{request}' twice")]
    DuplicateUnionMember {
        union: &'static str,
        request: &'static str,
    },
    #[error("union '{union}' member '{member}' requests '{request}', which no rule consumes")]
    UnsatisfiedUnionMember {
        union: &'static str,
        member: &'static str,
        request: &'static str,
    },
}

/// Accumulates [`RuleDef`]s and union members before validation.
#[derive(Default)]
pub struct RegistryBuilder {
    rules: Vec<RuleDef>,
    unions: HashMap<UnionId, UnionTable>,
    singletons: Params,
    roots: HashSet<ProductId>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        RegistryBuilder::default()
    }

    pub fn rule(&mut self, def: RuleDef) -> &mut Self {
        self.rules.push(def);
        self
    }

    /// Provide a singleton value available to every query, subsystem-style.
    /// Query params of the same type override it.
    pub fn provide<P: Param>(&mut self, value: P) -> &mut Self {
        self.singletons.insert(ParamValue::new(value));
        self
    }

    /// Declare a param type that queries supply at their root, so rules may
    /// depend on it without any rule producing it.
    pub fn query_param<P: Param>(&mut self) -> &mut Self {
        self.roots.insert(ProductId::of::<P>());
        self
    }

    /// Register `member` into the union identified by `U`.
    ///
    /// Members dispatch in registration order.
    pub fn union_member<U: crate::unions::Union>(&mut self, member: UnionMember) -> &mut Self {
        let id = UnionId::of::<U>();
        self.unions
            .entry(id)
            .or_insert_with(|| UnionTable::new(id))
            .push(member);
        self
    }

    /// Validate everything registered so far into a [`Registry`].
    pub fn build(self) -> Result<Registry, GraphError> {
        let mut rules: HashMap<ProductId, Vec<Arc<RuleDef>>> = HashMap::new();
        for def in self.rules {
            let slot = rules.entry(def.output).or_default();
            if let Some(existing) = slot.iter().find(|rule| rule.params == def.params) {
                return Err(GraphError::DuplicateRule {
                    product: def.output.short(),
                    first: existing.name,
                    second: def.name,
                });
            }
            slot.push(Arc::new(def));
        }

        // Dependencies must be producible by some rule, or arrive from above
        // as a param someone declares.
        let param_types: HashSet<ProductId> = rules
            .values()
            .flatten()
            .flat_map(|rule| rule.params.iter().copied())
            .chain(
                self.unions
                    .values()
                    .flat_map(|table| table.members().iter().map(|member| member.request())),
            )
            .chain(self.roots.iter().copied())
            .chain(self.singletons.ids())
            .collect();
        for rule in rules.values().flatten() {
            for dep in &rule.deps {
                if !rules.contains_key(dep) && !param_types.contains(dep) {
                    return Err(GraphError::UnsatisfiedDependency {
                        rule: rule.name,
                        product: dep.short(),
                    });
                }
            }
        }

        detect_cycles(&rules)?;

        for table in self.unions.values() {
            let mut seen: HashSet<ProductId> = HashSet::new();
            for member in table.members() {
                if !seen.insert(member.request()) {
                    return Err(GraphError::DuplicateUnionMember {
                        union: table.name(),
                        request: member.request().short(),
                    });
                }
                let consumed = rules
                    .values()
                    .flatten()
                    .any(|rule| rule.params.contains(&member.request()));
                if !consumed {
                    return Err(GraphError::UnsatisfiedUnionMember {
                        union: table.name(),
                        member: member.name(),
                        request: member.request().short(),
                    });
                }
            }
        }

        tracing::debug!(
            rules = rules.values().map(Vec::len).sum::<usize>(),
            unions = self.unions.len(),
            "built rule registry"
        );

        Ok(Registry {
            rules,
            unions: self.unions,
            singletons: self.singletons,
        })
    }
}

/// Depth-first search over the product graph, following rule dependencies.
fn detect_cycles(rules: &HashMap<ProductId, Vec<Arc<RuleDef>>>) -> Result<(), GraphError> {
    #[derive(Copy, Clone, PartialEq)]
    enum Mark {
        Active,
        Done,
    }

    fn visit(
        node: ProductId,
        rules: &HashMap<ProductId, Vec<Arc<RuleDef>>>,
        marks: &mut HashMap<ProductId, Mark>,
        stack: &mut Vec<ProductId>,
    ) -> Result<(), GraphError> {
        match marks.get(&node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Active) => {
                let start = stack.iter().position(|p| *p == node).unwrap_or(0);
                let mut path: Vec<&'static str> =
                    stack[start..].iter().map(ProductId::short).collect();
                path.push(node.short());
                return Err(GraphError::CyclicRuleGraph { path });
            }
            None => {}
        }

        marks.insert(node, Mark::Active);
        stack.push(node);
        for rule in rules.get(&node).into_iter().flatten() {
            for dep in &rule.deps {
                if rules.contains_key(dep) {
                    visit(*dep, rules, marks, stack)?;
                }
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    for node in rules.keys() {
        visit(*node, rules, &mut marks, &mut stack)?;
    }
    Ok(())
}

/// A validated, immutable set of rules and unions.
#[derive(Debug)]
pub struct Registry {
    rules: HashMap<ProductId, Vec<Arc<RuleDef>>>,
    unions: HashMap<UnionId, UnionTable>,
    singletons: Params,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub(crate) fn rules_for(&self, product: ProductId) -> &[Arc<RuleDef>] {
        self.rules.get(&product).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn union(&self, id: UnionId) -> Option<&UnionTable> {
        self.unions.get(&id)
    }

    pub(crate) fn singletons(&self) -> &Params {
        &self.singletons
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf(u64);
    struct Branch(u64);

    impl Param for Leaf {
        fn param_fingerprint(&self, hasher: &mut Xxh3Hasher) {
            hasher.update(&self.0.to_le_bytes());
        }
    }

    #[test]
    fn smoketest_params() {
        let params = Params::single(Leaf(1));
        assert!(params.contains(ProductId::of::<Leaf>()));
        assert!(!params.contains(ProductId::of::<Branch>()));

        // Replacing a param of the same type changes the fingerprint.
        let one = Params::single(Leaf(1)).fingerprint();
        let other = Params::single(Leaf(2)).fingerprint();
        assert_ne!(one, other);
        assert_eq!(one, Params::single(Leaf(1)).fingerprint());
    }

    #[test]
    fn smoketest_value_downcast() {
        let value = Value::new(Branch(7));
        assert_eq!(value.id(), ProductId::of::<Branch>());
        assert_eq!(value.downcast::<Branch>().unwrap().0, 7);
        assert!(value.downcast::<Leaf>().is_none());
    }

    #[test]
    fn duplicate_rules_are_rejected() {
        let mut builder = Registry::builder();
        builder
            .rule(RuleDef::new("make_branch", |_ctx| async {
                Ok(Branch(1))
            }))
            .rule(RuleDef::new("make_branch_too", |_ctx| async {
                Ok(Branch(2))
            }));

        let err = builder.build().unwrap_err();
        assert!(matches!(err, GraphError::DuplicateRule { .. }));
    }

    #[test]
    fn same_output_with_distinct_params_is_allowed() {
        let mut builder = Registry::builder();
        builder
            .rule(RuleDef::new("make_branch", |_ctx| async { Ok(Branch(1)) }))
            .rule(
                RuleDef::new("make_branch_from_leaf", |_ctx| async { Ok(Branch(2)) })
                    .param::<Leaf>(),
            );

        builder.build().unwrap();
    }

    #[test]
    fn unsatisfied_dependencies_are_rejected() {
        struct Missing;

        let mut builder = Registry::builder();
        builder.rule(
            RuleDef::new("needs_missing", |_ctx| async { Ok(Branch(0)) }).dep::<Missing>(),
        );

        let err = builder.build().unwrap_err();
        assert_eq!(
            err,
            GraphError::UnsatisfiedDependency {
                rule: "needs_missing",
                product: "Missing",
            }
        );
    }

    #[test]
    fn root_params_satisfy_dependencies() {
        let mut builder = Registry::builder();
        builder
            .query_param::<Leaf>()
            .rule(RuleDef::new("uses_leaf", |_ctx| async { Ok(Branch(0)) }).dep::<Leaf>());
        builder.build().unwrap();

        let mut builder = Registry::builder();
        builder
            .provide(Leaf(9))
            .rule(RuleDef::new("uses_leaf", |_ctx| async { Ok(Branch(0)) }).dep::<Leaf>());
        builder.build().unwrap();
    }

    #[test]
    fn cycles_are_rejected() {
        struct A;
        struct B;

        let mut builder = Registry::builder();
        builder
            .rule(RuleDef::new("make_a", |_ctx| async { Ok(A) }).dep::<B>())
            .rule(RuleDef::new("make_b", |_ctx| async { Ok(B) }).dep::<A>());

        let err = builder.build().unwrap_err();
        let GraphError::CyclicRuleGraph { path } = err else {
            panic!("expected a cycle, got {err:?}");
        };
        assert_eq!(path.first(), path.last());
    }

    #[test]
    fn self_cycles_are_rejected() {
        struct A;

        let mut builder = Registry::builder();
        builder.rule(RuleDef::new("make_a", |_ctx| async { Ok(A) }).dep::<A>());

        let err = builder.build().unwrap_err();
        assert!(matches!(err, GraphError::CyclicRuleGraph { .. }));
    }
}
