//! Utility belt for `quarry`.
//!
//! Small helpers with no domain logic of their own, shared by the rest of
//! the workspace.

pub mod assert;
pub mod cast;
pub mod hash;
pub mod id_gen;
