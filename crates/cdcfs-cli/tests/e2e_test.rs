//! E2E tests for the cdcfs binary
//!
//! Each test runs in its own `TestEnvironment`, whose root also serves as
//! HOME so no user configuration leaks in.

use std::path::Path;
use std::process::{Command, Output};

use cdcfs_config::testing::TestEnvironment;

/// Helper to run cdcfs inside `dir`
fn cdcfs(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cdcfs"))
        .args(args)
        .current_dir(dir)
        .env("HOME", dir)
        .env_remove("CDCFS_THREADS")
        .env_remove("CDCFS_VERIFY")
        .env_remove("CDCFS_CACHE_BLOCKS")
        .output()
        .expect("Failed to execute cdcfs")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn noise(len: usize) -> Vec<u8> {
    let mut seed = 0xdead_beef_u64;
    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed as u8
        })
        .collect()
}

// ========== E2E: Config ==========

#[test]
fn e2e_config_returns_valid_toml() {
    let env = TestEnvironment::new().unwrap();
    let output = cdcfs(env.root(), &["config"]);
    assert!(output.status.success());

    let parsed: Result<cdcfs_config::Config, _> = toml::from_str(&stdout(&output));
    assert!(parsed.is_ok(), "config should print valid TOML: {:?}", parsed.err());
    assert_eq!(parsed.unwrap(), cdcfs_config::Config::default());
}

#[test]
fn e2e_project_config_is_applied() {
    let env = TestEnvironment::new().unwrap();
    env.write_config("[store]\nverify_payload = false\n").unwrap();

    let output = cdcfs(env.root(), &["config"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("verify_payload = false"));
}

// ========== E2E: Image Workflow ==========

#[test]
fn e2e_mkfs_put_chunk_cat() {
    let env = TestEnvironment::new().unwrap();
    let dir = env.root();
    let data = noise(300 * 1024);
    env.create_host_file("a.bin", &data).unwrap();
    env.create_host_file("b.bin", &data).unwrap();

    let output = cdcfs(dir, &["mkfs", "disk.img", "--size", "8M"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("Formatted"));

    for file in ["a.bin", "b.bin"] {
        let source = format!("host/{}", file);
        let output = cdcfs(dir, &["put", "disk.img", &source, "--name", file]);
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    }

    let output = cdcfs(dir, &["chunk", "disk.img", "a.bin", "b.bin", "-j", "2"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("deduplicated"));

    let output = cdcfs(dir, &["cat", "disk.img", "b.bin"]);
    assert!(output.status.success());
    assert_eq!(output.stdout, data);

    let output = cdcfs(
        dir,
        &["cat", "disk.img", "a.bin", "--offset", "1000", "--length", "5000"],
    );
    assert!(output.status.success());
    assert_eq!(output.stdout, &data[1000..6000]);

    let listing = stdout(&cdcfs(dir, &["ls", "disk.img"]));
    assert!(listing.contains("a.bin"));
    assert!(listing.contains("chunked"));
}

#[test]
fn e2e_stat_and_segments_json() {
    let env = TestEnvironment::new().unwrap();
    let dir = env.root();
    let data = noise(100 * 1024);
    env.create_host_file("f.bin", &data).unwrap();

    assert!(cdcfs(dir, &["mkfs", "disk.img", "--size", "4M"]).status.success());
    assert!(cdcfs(dir, &["put", "disk.img", "host/f.bin", "--name", "file"]).status.success());
    assert!(cdcfs(dir, &["chunk", "disk.img", "file"]).status.success());

    let output = cdcfs(dir, &["stat", "disk.img", "--json"]);
    assert!(output.status.success());
    let stat: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(stat["files"], 1);
    assert_eq!(stat["chunked_files"], 1);
    assert!(stat["store"]["chunks"].as_u64().unwrap() > 0);
    assert_eq!(stat["store"]["payload_bytes"], data.len() as u64);

    let output = cdcfs(dir, &["segments", "disk.img", "file", "--json"]);
    assert!(output.status.success());
    let segments: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let total: u64 = segments
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["size"].as_u64().unwrap())
        .sum();
    assert_eq!(total, data.len() as u64);
}

#[test]
fn e2e_rechunk_fails() {
    let env = TestEnvironment::new().unwrap();
    let dir = env.root();
    env.create_host_file("f.bin", &noise(10_000)).unwrap();

    assert!(cdcfs(dir, &["mkfs", "disk.img", "--size", "4M"]).status.success());
    assert!(cdcfs(dir, &["put", "disk.img", "host/f.bin", "--name", "f.bin"]).status.success());
    assert!(cdcfs(dir, &["chunk", "disk.img", "f.bin"]).status.success());

    let output = cdcfs(dir, &["chunk", "disk.img", "f.bin"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("already chunked"));

    let output = cdcfs(dir, &["chunk", "disk.img", "missing"]);
    assert!(!output.status.success());
}

#[test]
fn e2e_open_non_image_fails() {
    let env = TestEnvironment::new().unwrap();
    std::fs::write(env.root().join("junk.img"), vec![0u8; 4096]).unwrap();
    let output = cdcfs(env.root(), &["ls", "junk.img"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("junk.img"));
}
