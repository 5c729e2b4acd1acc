//! Configuration discovery against real files and the process environment.
//!
//! Discovery reads environment variables, so these tests serialize on one
//! lock to keep them from interfering.

use mcp_wrapper::config::{self, CONFIG_PATH_VAR, SERVER_NAME_VAR};
use std::io::Write;
use std::sync::Mutex;

static ENV_LOCK: Mutex<()> = Mutex::new(());

struct EnvGuard {
    _lock: std::sync::MutexGuard<'static, ()>,
    vars: Vec<&'static str>,
}

impl EnvGuard {
    fn set(pairs: &[(&'static str, &str)]) -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut vars = Vec::new();
        for (key, value) in pairs {
            std::env::set_var(key, value);
            vars.push(*key);
        }
        Self { _lock: lock, vars }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in &self.vars {
            std::env::remove_var(key);
        }
    }
}

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp config");
    write!(file, "{content}").expect("write temp config");
    file
}

#[test]
fn explicit_path_wins() {
    let file = write_config(
        r#"{
            // two children, comments and trailing commas tolerated
            "mcpServers": {
                "serena": {"command": "serena-server", "args": ["--stdio",],},
                "fs": {"command": "fs-server"},
            },
        }"#,
    );
    let _env = EnvGuard::set(&[(CONFIG_PATH_VAR, file.path().to_str().unwrap())]);

    let (path, specs) = config::discover().expect("config discovered");
    assert_eq!(path, file.path());
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0].name.as_deref(), Some("serena"));
    assert_eq!(specs[0].args, vec!["--stdio"]);
    assert_eq!(specs[1].name.as_deref(), Some("fs"));
}

#[test]
fn server_name_filter_restricts_to_one_child() {
    let file = write_config(
        r#"{"servers": {
            "a": {"command": "a-server"},
            "b": {"command": "b-server"}
        }}"#,
    );
    let _env = EnvGuard::set(&[
        (CONFIG_PATH_VAR, file.path().to_str().unwrap()),
        (SERVER_NAME_VAR, "b"),
    ]);

    let (_, specs) = config::discover().expect("config discovered");
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].name.as_deref(), Some("b"));
}

#[test]
fn server_name_filter_without_match_keeps_all() {
    let file = write_config(r#"{"servers": {"a": {"command": "a-server"}}}"#);
    let _env = EnvGuard::set(&[
        (CONFIG_PATH_VAR, file.path().to_str().unwrap()),
        (SERVER_NAME_VAR, "no-such-server"),
    ]);

    let (_, specs) = config::discover().expect("config discovered");
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].name.as_deref(), Some("a"));
}

#[test]
fn unusable_explicit_path_falls_through() {
    // Points at a file with zero valid servers; discovery moves on to the
    // other locations (which may or may not exist on the test machine), so
    // the only guarantee is that this file is not the winner.
    let file = write_config(r#"{"servers": {"broken": {"command": 42}}}"#);
    let _env = EnvGuard::set(&[(CONFIG_PATH_VAR, file.path().to_str().unwrap())]);

    if let Some((path, specs)) = config::discover() {
        assert_ne!(path, file.path());
        assert!(!specs.is_empty());
    }
}
