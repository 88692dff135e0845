//! A declarative build-rule execution engine.
//!
//! Rules are typed async functions registered once at startup into a
//! validated [`registry::Registry`]. A [`scheduler::Session`] resolves
//! queries by running the minimal rule subgraph, memoizing every product,
//! and collapsing identical sandboxed process executions. Unions let
//! plugins hang new behavior off existing goals without the goal knowing
//! about them.

pub mod defs;
pub mod engine;
pub mod goals;
pub mod intrinsics;
pub mod registry;
pub mod scheduler;
pub mod target;
pub mod unions;

pub use engine::{register_configs, Engine};
pub use registry::{
    GraphError, Param, ParamValue, Params, Product, ProductId, Registry, RegistryBuilder, RuleDef,
    Value,
};
pub use scheduler::{Context, RuleError, Session};
pub use target::{Address, FieldSet, FieldValue, Target};
pub use unions::{Union, UnionId, UnionMember};
