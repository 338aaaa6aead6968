#![allow(dead_code)]

use assert_cmd::Command;
use std::path::PathBuf;
use tempfile::TempDir;

/// Host profile used by every test, so results do not depend on the machine.
pub const HOST_PROFILE: &str = r#"{
    "cgroup_version": "v2",
    "hostname": "build-host",
    "seccomp": true,
    "current_dir": "/work"
}"#;

pub const ENGINE_CONFIG: &str = "stop_timeout: 30\nlog_driver: journald\n";

pub struct TestContext {
    pub cmd: Command,
    pub dir: TempDir,
}

impl TestContext {
    /// A fresh command sharing this context's host profile and engine config.
    pub fn new_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_specgen");
        let mut cmd = Command::new(bin_path);
        cmd.env_remove("RUST_LOG");
        cmd.arg("--host").arg(self.path("host.json"));
        cmd.arg("--config").arg(self.path("engine.yaml"));
        cmd
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write `contents` to `name` inside the context directory.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, contents).expect("Failed to write test file");
        path
    }
}

pub fn specgen() -> TestContext {
    let dir = tempfile::tempdir().expect("Failed to create test directory");
    std::fs::write(dir.path().join("host.json"), HOST_PROFILE).expect("Failed to write host profile");
    std::fs::write(dir.path().join("engine.yaml"), ENGINE_CONFIG).expect("Failed to write engine config");

    let mut ctx = TestContext {
        cmd: Command::new(env!("CARGO_BIN_EXE_specgen")),
        dir,
    };
    ctx.cmd = ctx.new_cmd();
    ctx
}

/// Parse the JSON printed on stdout.
pub fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
}
