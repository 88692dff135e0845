//! Open-ended dispatch: unions and their members.
//!
//! A union is a marker type standing for an extension point, e.g. "things
//! that can be checked". Plugins register members into it, each naming a
//! request param type, and a rule somewhere consumes that request. Querying
//! the union fans one request out per applicable target per member.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use crate::registry::{Param, ParamValue, Params, Product, ProductId};
use crate::scheduler::{solve, RuleError, SessionInner};
use crate::target::{FieldSet, Target};

/// Marker trait for union base types.
pub trait Union: 'static {}

/// Identifies a [`Union`] type.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct UnionId {
    type_id: TypeId,
    name: &'static str,
}

impl UnionId {
    pub fn of<U: Union>() -> Self {
        UnionId {
            type_id: TypeId::of::<U>(),
            name: std::any::type_name::<U>(),
        }
    }

    pub fn short(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl fmt::Display for UnionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl fmt::Debug for UnionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnionId({})", self.name)
    }
}

type BuildFn = Arc<dyn Fn(&Target) -> Option<ParamValue> + Send + Sync>;

/// One member of a union.
///
/// A member applies to a target when every required field is present and the
/// skip field, if declared, is not truthy. For each applicable target the
/// build closure turns the extracted [`FieldSet`] into the member's request
/// param.
#[derive(Clone)]
pub struct UnionMember {
    name: &'static str,
    request: ProductId,
    build: BuildFn,
}

impl UnionMember {
    pub fn new<R: Param>(
        name: &'static str,
        required_fields: &'static [&'static str],
        skip_field: Option<&'static str>,
        build: impl Fn(&Target, FieldSet) -> R + Send + Sync + 'static,
    ) -> Self {
        UnionMember {
            name,
            request: ProductId::of::<R>(),
            build: Arc::new(move |target| {
                if let Some(skip) = skip_field {
                    if target.bool_field(skip, false) {
                        return None;
                    }
                }
                let fields = FieldSet::extract(target, required_fields)?;
                Some(ParamValue::new(build(target, fields)))
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn request(&self) -> ProductId {
        self.request
    }

    pub(crate) fn build(&self, target: &Target) -> Option<ParamValue> {
        (self.build)(target)
    }
}

impl fmt::Debug for UnionMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnionMember")
            .field("name", &self.name)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// The members of one union, in registration order.
pub(crate) struct UnionTable {
    id: UnionId,
    members: Vec<UnionMember>,
}

impl UnionTable {
    pub(crate) fn new(id: UnionId) -> Self {
        UnionTable {
            id,
            members: Vec::new(),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.id.short()
    }

    pub(crate) fn push(&mut self, member: UnionMember) {
        self.members.push(member);
    }

    pub(crate) fn members(&self) -> &[UnionMember] {
        &self.members
    }
}

impl fmt::Debug for UnionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnionTable")
            .field("id", &self.id)
            .field("members", &self.members)
            .finish()
    }
}

/// Fan one query for `O` out per `(member, target)` pair, member-major.
///
/// All requests run concurrently, and results come back in dispatch order.
/// Pairs where the member's build closure declines are skipped entirely.
pub(crate) async fn query_union<O: Product, U: Union>(
    session: Arc<SessionInner>,
    base: Params,
    targets: &[Target],
) -> Result<Vec<Arc<O>>, RuleError> {
    let id = UnionId::of::<U>();
    let Some(table) = session.registry.union(id) else {
        return Err(RuleError::NoUnion { union: id.short() });
    };

    let output = ProductId::of::<O>();
    let mut futures = Vec::new();
    for member in table.members() {
        for target in targets {
            let Some(request) = member.build(target) else {
                tracing::trace!(
                    union = %id,
                    member = member.name(),
                    target = %target.address(),
                    "member declined target"
                );
                continue;
            };
            let params = base
                .clone()
                .with(ParamValue::new(target.clone()))
                .with(request);
            futures.push(solve(Arc::clone(&session), output, params));
        }
    }

    let values = futures::future::try_join_all(futures).await?;
    values
        .into_iter()
        .map(|value| {
            value.downcast::<O>().ok_or(RuleError::WrongProduct {
                product: output.short(),
            })
        })
        .collect()
}
