//! CLI argument surface.
//!
//! Two invocation modes: everything after a `--` sentinel is a single child
//! command (passthrough mode, no configuration file consulted); with no
//! sentinel, children come from configuration discovery.

use crate::config::ChildSpec;
use clap::Parser;

/// Aggregating MCP proxy over stdio.
///
/// Merges the tool catalogs of the configured child servers into one
/// namespace and routes tool calls to the child that owns them.
#[derive(Parser, Debug)]
#[command(name = "mcp-wrapper", version, about, long_about = None)]
pub struct Cli {
    /// Single child command to proxy (after `--`); bypasses config discovery
    #[arg(last = true, value_name = "COMMAND")]
    pub child_command: Vec<String>,
}

#[derive(Debug)]
pub enum Invocation {
    /// `mcp-wrapper -- <command> <args...>`
    Passthrough(ChildSpec),
    /// Configuration-file discovery.
    Config,
}

impl Cli {
    pub fn invocation(&self) -> Invocation {
        match self.child_command.split_first() {
            Some((command, args)) => Invocation::Passthrough(ChildSpec::from_command(
                command.clone(),
                args.to_vec(),
            )),
            None => Invocation::Config,
        }
    }
}
