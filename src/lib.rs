//! Instruction lowering for shader modules: rewrites the type-polymorphic
//! high-level operation calls a front end produces into the fixed hardware
//! operation set, resolving resource handles, scalarizing vector math where
//! the target lacks native vectors, and translating buffer accesses into
//! physical loads and stores.
//!
//! The entry point is [`lower::lower_module`]; it mutates a [`ir::Module`] in
//! place against a [`hwop::Target`] description and collects user-facing
//! errors in a [`diag::DiagSink`].

pub mod concrete_type;
pub mod diag;
pub mod hlop;
pub mod hwop;
pub mod ir;
pub mod lower;
pub mod source_loc;
pub mod utils;

pub use diag::{Diag, DiagSink, Severity};
pub use hwop::Target;
pub use ir::Module;
pub use lower::{lower_module, LowerOutput};
