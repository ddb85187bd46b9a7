//! End-to-end tests for the `kit` command-line binary.

use std::path::PathBuf;
use std::process::{Command, Output};

use tempfile::TempDir;

/// A throwaway kit home with a local manifest directory as the only source.
struct TestContext {
    temp_dir: TempDir,
    kit_home: PathBuf,
    manifests: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let kit_home = temp_dir.path().join(".kit");
        let manifests = temp_dir.path().join("manifests");
        std::fs::create_dir_all(&manifests).expect("failed to create manifest dir");
        Self {
            temp_dir,
            kit_home,
            manifests,
        }
    }

    fn kit(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_kit"))
            .args(args)
            .env("HOME", self.temp_dir.path())
            .env("KIT_HOME", &self.kit_home)
            .env("KIT_SOURCES", format!("dir:{}", self.manifests.display()))
            .env("PATH", "/usr/bin:/bin")
            .env_remove("RUST_LOG")
            .output()
            .expect("failed to run kit")
    }

    /// Publish `hello` with a local tar.gz artifact.
    fn publish_hello(&self) {
        let artifact = self.temp_dir.path().join("hello-1.0.0.tar.gz");
        std::fs::write(&artifact, hello_archive()).unwrap();
        let manifest = format!(
            r#"description = "Says hello"
source = "file://{}"
strip = 1
binaries = ["bin/*"]

[[env]]
name = "PATH"
prepend = "${{root}}/bin"

[[version]]
versions = ["1.0.0"]
"#,
            artifact.display()
        );
        std::fs::write(self.manifests.join("hello.toml"), manifest).unwrap();
    }

    fn root(&self) -> PathBuf {
        self.kit_home.join("pkg/hello-1.0.0")
    }
}

fn hello_archive() -> Vec<u8> {
    let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(gz);
    let body = b"#!/bin/sh\necho hello\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder
        .append_data(&mut header, "hello-1.0.0/bin/hello", &body[..])
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_help_command() {
    let ctx = TestContext::new();
    let output = ctx.kit(&["--help"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Usage:"));
}

#[test]
fn test_list_initializes_state_db() {
    let ctx = TestContext::new();
    let output = ctx.kit(&["list"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("No packages installed."));
    assert!(ctx.kit_home.join("state.db").exists());
}

#[test]
fn test_info_unknown_package_fails() {
    let ctx = TestContext::new();
    let output = ctx.kit(&["info", "nosuchtool"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("No source provides a package matching 'nosuchtool'"));
}

#[test]
fn test_invalid_selector_fails() {
    let ctx = TestContext::new();
    let output = ctx.kit(&["info", "jq@"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Invalid selector 'jq@'"));
}

#[test]
fn test_install_info_env_uninstall() {
    let ctx = TestContext::new();
    ctx.publish_hello();
    let root = ctx.root();

    let output = ctx.kit(&["info", "hello"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("Name:        hello"), "{text}");
    assert!(text.contains("Version:     1.0.0"), "{text}");
    assert!(text.contains("State:       not installed"), "{text}");

    let output = ctx.kit(&["install", "-q", "hello"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(root.join("bin/hello").exists());

    let output = ctx.kit(&["info", "hello"]);
    let text = stdout(&output);
    assert!(text.contains("State:       installed"), "{text}");
    assert!(text.contains("Binaries:    hello\n"), "{text}");

    let output = ctx.kit(&["--json", "info", "hello"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json[0]["reference"], "hello-1.0.0");
    assert_eq!(json[0]["state"], "installed");
    assert_eq!(
        json[0]["environment"]["PATH"],
        format!("{}/bin:/usr/bin:/bin", root.display())
    );

    let output = ctx.kit(&["env", "hello"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(
        stdout(&output).trim(),
        format!("export PATH={}/bin:/usr/bin:/bin", root.display())
    );

    let output = ctx.kit(&["list"]);
    assert!(stdout(&output).contains("hello-1.0.0"));

    let output = ctx.kit(&["doctor"]);
    assert!(stdout(&output).contains("No problems found."));

    let output = ctx.kit(&["uninstall", "hello"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(!root.exists());
    assert!(stdout(&ctx.kit(&["list"])).contains("No packages installed."));
}

#[test]
fn test_doctor_prunes_orphans() {
    let ctx = TestContext::new();
    ctx.publish_hello();
    assert!(ctx.kit(&["install", "-q", "hello-1.0.0"]).status.success());

    std::fs::remove_dir_all(ctx.root()).unwrap();

    let output = ctx.kit(&["doctor"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("hello-1.0.0 is recorded at"));
    assert!(stdout(&output).contains("kit doctor --prune"));

    let output = ctx.kit(&["doctor", "--prune"]);
    assert!(stdout(&output).contains("Pruned hello-1.0.0"));
    assert!(stdout(&ctx.kit(&["doctor"])).contains("No problems found."));
}

#[test]
fn test_install_reports_partial_failure() {
    let ctx = TestContext::new();
    ctx.publish_hello();
    let output = ctx.kit(&["install", "-q", "hello", "missing"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("1 of 2 packages failed to install"));
    assert!(ctx.root().exists());
}

#[test]
fn test_clean() {
    let ctx = TestContext::new();
    let output = ctx.kit(&["clean"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output).trim(), "Removed 0 interrupted downloads.");
}
