//! Configuration loading.
//!
//! Children are described by a lenient JSON document discovered from, in
//! order: the path in `CODEX_MCP_WRAPPER_CONFIG`, `~/.codex/.mcp.json`, and
//! `.mcp.json` in the current directory walking up to the filesystem root.
//! The first readable file that parses and yields at least one server wins.
//!
//! Recognized shapes:
//! - `{ "servers": { "<name>": { "command", "args"?, "env"? } } }`
//! - `{ "mcp_servers": { ... } }` / `{ "mcpServers": { ... } }`
//! - `[ { "name"?, "command", "args"?, "env"? }, ... ]`
//! - `{ "command", "args"?, "env"?, "name"? }`
//!
//! Line/block comments and trailing commas are stripped before parsing.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const CONFIG_PATH_VAR: &str = "CODEX_MCP_WRAPPER_CONFIG";
pub const SERVER_NAME_VAR: &str = "MCP_WRAPPER_SERVER_NAME";
const CONFIG_FILE_NAME: &str = ".mcp.json";

/// Immutable description of one child server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub name: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl ChildSpec {
    pub fn from_command(command: String, args: Vec<String>) -> Self {
        Self {
            name: None,
            command,
            args,
            env: HashMap::new(),
        }
    }

    /// The key used to prefix this child's published tool names: the logical
    /// name if set, else the command basename; lower-cased, runs of anything
    /// outside `[a-z0-9]` collapsed to `_`, leading/trailing `_` trimmed.
    pub fn key(&self) -> String {
        let raw = match &self.name {
            Some(name) => name.clone(),
            None => Path::new(&self.command)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.command.clone()),
        };

        let mut key = String::with_capacity(raw.len());
        let mut pending_sep = false;
        for c in raw.to_lowercase().chars() {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                if pending_sep && !key.is_empty() {
                    key.push('_');
                }
                pending_sep = false;
                key.push(c);
            } else {
                pending_sep = true;
            }
        }
        key
    }
}

/// Recognized environment options.
#[derive(Debug, Clone)]
pub struct WrapperOptions {
    pub debug: bool,
    pub summary: bool,
    pub error_passthrough: bool,
    pub tools_list_timeout: Duration,
    pub init_timeout: Duration,
}

impl Default for WrapperOptions {
    fn default() -> Self {
        Self {
            debug: false,
            summary: true,
            error_passthrough: false,
            tools_list_timeout: Duration::from_millis(4000),
            init_timeout: Duration::from_millis(4000),
        }
    }
}

impl WrapperOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let truthy = |name: &str| {
            lookup(name)
                .map(|v| !matches!(v.as_str(), "" | "0" | "false"))
                .unwrap_or(false)
        };
        let millis = |name: &str, default: u64| {
            lookup(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let summary = lookup("WRAPPER_SUMMARY").map(|v| v != "0").unwrap_or(true)
            && lookup("WRAPPER_NO_SUMMARY").map(|v| v != "1").unwrap_or(true);

        Self {
            debug: truthy("DEBUG"),
            summary,
            error_passthrough: lookup("WRAPPER_ERROR_PASSTHROUGH")
                .map(|v| matches!(v.as_str(), "1" | "true"))
                .unwrap_or(false),
            tools_list_timeout: Duration::from_millis(millis("WRAPPER_TOOLS_LIST_TIMEOUT_MS", 4000)),
            init_timeout: Duration::from_millis(millis("WRAPPER_INIT_TIMEOUT_MS", 4000)),
        }
    }
}

/// Search the configured locations and return the first usable server list,
/// filtered down to `MCP_WRAPPER_SERVER_NAME` when that matches one.
pub fn discover() -> Option<(PathBuf, Vec<ChildSpec>)> {
    let (path, mut specs) = candidate_paths()
        .into_iter()
        .find_map(|path| match load_file(&path) {
            Some(specs) if !specs.is_empty() => Some((path, specs)),
            _ => None,
        })?;

    if let Ok(only) = std::env::var(SERVER_NAME_VAR) {
        let filtered: Vec<ChildSpec> = specs
            .iter()
            .filter(|s| s.name.as_deref() == Some(only.as_str()))
            .cloned()
            .collect();
        if !filtered.is_empty() {
            specs = filtered;
        }
    }

    Some((path, specs))
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(explicit) = std::env::var(CONFIG_PATH_VAR) {
        paths.push(PathBuf::from(explicit));
    }
    if let Some(dirs) = directories::UserDirs::new() {
        paths.push(dirs.home_dir().join(".codex").join(CONFIG_FILE_NAME));
    }
    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors() {
            paths.push(dir.join(CONFIG_FILE_NAME));
        }
    }
    paths
}

fn load_file(path: &Path) -> Option<Vec<ChildSpec>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "config candidate not readable");
            return None;
        }
    };
    match parse_config(&text) {
        Ok(specs) => {
            debug!(path = %path.display(), servers = specs.len(), "loaded config");
            Some(specs)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config candidate did not parse");
            None
        }
    }
}

/// Parse a configuration document into child specs. Entries without a string
/// `command` are skipped.
pub fn parse_config(text: &str) -> anyhow::Result<Vec<ChildSpec>> {
    let cleaned = strip_json_comments(text);
    let doc: Value = serde_json::from_str(&cleaned)?;

    let mut specs = Vec::new();
    match &doc {
        Value::Object(obj) => {
            if let Some(map) = ["servers", "mcp_servers", "mcpServers"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_object))
            {
                for (name, entry) in map {
                    if let Some(spec) = parse_entry(entry, Some(name.clone())) {
                        specs.push(spec);
                    }
                }
            } else if let Some(spec) = parse_entry(&doc, None) {
                specs.push(spec);
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                if let Some(spec) = parse_entry(entry, None) {
                    specs.push(spec);
                }
            }
        }
        _ => {}
    }
    Ok(specs)
}

fn parse_entry(entry: &Value, name_hint: Option<String>) -> Option<ChildSpec> {
    let obj = entry.as_object()?;
    let command = obj.get("command")?.as_str()?.to_string();

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(name_hint);

    let args = obj
        .get("args")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let env = obj
        .get("env")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Some(ChildSpec {
        name,
        command,
        args,
        env,
    })
}

/// Strip `//` and `/* */` comments plus trailing commas so hand-edited
/// configs with editor artifacts still parse. String literals are
/// respected. Comments are removed first so a comma followed by a comment
/// and a closer still counts as trailing.
pub fn strip_json_comments(input: &str) -> String {
    strip_trailing_commas(&strip_comments(input))
}

fn strip_comments(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1] as char);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn strip_trailing_commas(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1] as char);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                j += 1;
            }
            if matches!(bytes.get(j), Some(b'}') | Some(b']')) {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}
