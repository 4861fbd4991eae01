//! E2E tests for the regress-glibc binary.

use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::OnceLock;

fn regress_glibc(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_regress-glibc"))
        .args(args)
        .env_remove("LD_PRELOAD")
        .env_remove("CFS_ROOT")
        .output()
        .expect("Failed to execute regress-glibc")
}

/// The interposer library. `CFS_PRELOAD` names a prebuilt one; otherwise it
/// is built once into a target directory of its own, so this never waits on
/// the lock of the `cargo test` that is running us.
fn preload_library() -> &'static PathBuf {
    static LIB: OnceLock<PathBuf> = OnceLock::new();
    LIB.get_or_init(|| {
        if let Some(lib) = std::env::var_os("CFS_PRELOAD") {
            return PathBuf::from(lib);
        }
        let workspace = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        let target_dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join("preload");
        let cargo = std::env::var_os("CARGO").unwrap_or_else(|| "cargo".into());
        let status = Command::new(cargo)
            .args(["build", "-p", "cfs-preload", "--manifest-path"])
            .arg(workspace.join("Cargo.toml"))
            .arg("--target-dir")
            .arg(&target_dir)
            .status()
            .expect("Failed to run cargo build for cfs-preload");
        assert!(status.success(), "building cfs-preload failed: {}", status);

        let lib = target_dir.join("debug").join("libcfs_preload.so");
        assert!(lib.exists(), "{} missing after build", lib.display());
        lib
    })
}

#[test]
fn e2e_regress_passes_without_interposer() {
    let output = regress_glibc(&["regress"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "suite failed:\n{}", stdout);
    assert!(stdout.contains("Run Summary:"));
    assert!(stdout.contains("Test: open_nonexistent_file ...passed"));
    assert!(!stdout.contains("FAILED"));
}

#[test]
fn e2e_default_command_is_regress() {
    let output = regress_glibc(&[]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Run Summary:"));
}

#[test]
fn e2e_json_summary() {
    let output = regress_glibc(&["regress", "--json", "--filter", "stat"]);
    assert!(output.status.success());

    let summary: serde_json::Value =
        serde_json::from_slice(trailing_json(&output.stdout)).expect("summary is JSON");
    assert_eq!(summary["tests_run"], 1);
    assert_eq!(summary["tests_failed"], 0);
    assert_eq!(summary["failures"].as_array().map(|f| f.len()), Some(0));
}

#[test]
fn e2e_unknown_scenario_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = regress_glibc(&["scenario", "no-such-scenario", dir.path().to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown scenario"));
}

#[test]
fn e2e_regress_under_interposer() {
    let lib = preload_library();
    let output = regress_glibc(&["regress", "--preload", lib.to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "suite failed under the interposer:\n{}", stdout);
    assert!(stdout.contains("Run Summary:"));
}

#[test]
fn e2e_trace_suite() {
    let lib = preload_library();
    let output = regress_glibc(&["trace", "--preload", lib.to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "trace suite failed:\n{}", stdout);
    assert!(stdout.contains("Test: end_to_end ...passed"));
    assert!(stdout.contains("Test: descriptor_dup ...passed"));
    assert!(stdout.contains("Test: exec_list_inheritance ...passed"));
}

/// Case lines come first; the JSON document starts at the first `{` line.
fn trailing_json(stdout: &[u8]) -> &[u8] {
    let start = stdout
        .windows(2)
        .position(|w| w == b"\n{")
        .map(|i| i + 1)
        .unwrap_or(0);
    &stdout[start..]
}
