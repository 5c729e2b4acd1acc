//! mcp-wrapper - an aggregating proxy for the Model Context Protocol.
//!
//! Presents itself to its parent as a single MCP server over stdio while
//! fanning out to a configured set of child servers launched as
//! subprocesses: merged tool catalogs under collision-free names, routed
//! tool calls, normalized schemas and error envelopes.

pub mod cli;
pub mod config;
pub mod mcp;
