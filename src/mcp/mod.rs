//! MCP aggregation core.
//!
//! The proxy speaks JSON-RPC 2.0 over stdio on both sides: one parent-facing
//! stream and one per child subprocess. [`codec`] reassembles frames,
//! [`child`] owns the subprocesses, [`aggregator`] dispatches and routes,
//! [`schema`] rewrites tool catalogs, and [`errors`] folds child failures
//! into one envelope.

pub mod aggregator;
pub mod child;
pub mod codec;
pub mod errors;
pub mod schema;
pub mod types;

pub use aggregator::Aggregator;
pub use child::{ChildClient, ChildEvent};
