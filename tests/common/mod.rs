#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use agent_tester::session::SessionBuilder;
use agent_tester::settings::{HarnessSettings, SELFDESCRIBE_VAR};

pub const TIMEOUT: Duration = Duration::from_secs(15);
pub const GRACE: Duration = Duration::from_secs(3);

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("common")
        .join("fixtures")
        .join(name)
}

pub fn config(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("common")
        .join("configs")
        .join(name);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()))
}

pub fn selfdescribe_path() -> PathBuf {
    fixture_path("selfdescribe.json")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agent_tester=debug")),
        )
        .try_init();
}

/// Settings that run the stub agent against the fixture self-describe file.
pub fn stub_settings() -> HarnessSettings {
    HarnessSettings::default()
        .agent_bin(env!("CARGO_BIN_EXE_stub-agent"))
        .selfdescribe(selfdescribe_path())
        .agent_env(SELFDESCRIBE_VAR, selfdescribe_path().to_string_lossy())
        .grace_period(GRACE)
}

/// A session running the stub agent on `config`.
pub fn stub_session(config: impl Into<String>) -> SessionBuilder {
    init_tracing();
    SessionBuilder::new(config).settings(stub_settings())
}
