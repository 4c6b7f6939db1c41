use std::ffi::OsString;
use std::time::Duration;

use exthost_bridge::config::RuntimeConfig;
use exthost_bridge::supervisor::{find_on_path, resolve_runtime, Version};
use exthost_bridge::AppError;

fn runtime(executable: &str) -> RuntimeConfig {
    RuntimeConfig {
        executable: executable.to_owned(),
        bundled_path: None,
        min_version: None,
        args: Vec::new(),
        entry: None,
        version_args: vec!["--version".into()],
    }
}

#[test]
fn finds_decorated_versions() {
    assert_eq!(
        Version::find_in("v18.17.1\n"),
        Some(Version {
            major: 18,
            minor: 17,
            patch: 1
        })
    );
    assert_eq!(
        Version::find_in("runtime 2.4 (build abc)"),
        Some(Version {
            major: 2,
            minor: 4,
            patch: 0
        })
    );
    assert_eq!(Version::find_in("no digits here"), None);
}

#[test]
fn versions_order_numerically() {
    let older = Version::find_in("9.10.0").expect("parses");
    let newer = Version::find_in("10.2.0").expect("parses");
    assert!(older < newer);
    assert_eq!(newer.to_string(), "10.2.0");
}

#[test]
fn path_search_finds_files_in_listed_directories() {
    let first = tempfile::tempdir().expect("tempdir");
    let second = tempfile::tempdir().expect("tempdir");
    let exe = second.path().join("guest-runtime");
    std::fs::write(&exe, b"#!/bin/sh\n").expect("write");

    let path_var: OsString =
        std::env::join_paths([first.path(), second.path()]).expect("join paths");
    assert_eq!(find_on_path("guest-runtime", Some(&path_var)), Some(exe.clone()));
    assert_eq!(find_on_path("missing-runtime", Some(&path_var)), None);
    assert_eq!(find_on_path("guest-runtime", None), None);

    let direct = exe.to_str().expect("utf8");
    assert_eq!(find_on_path(direct, None), Some(exe));
}

#[tokio::test]
async fn missing_runtime_is_a_setup_error() {
    let err = resolve_runtime(
        &runtime("exthost-runtime-that-does-not-exist"),
        Duration::from_secs(1),
    )
    .await
    .expect_err("not found");
    assert!(matches!(err, AppError::Setup(msg) if msg.contains("not found")));
}

#[tokio::test]
async fn bundled_copy_is_preferred() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bundled = dir.path().join("bundled-runtime");
    std::fs::write(&bundled, b"").expect("write");

    let mut config = runtime("exthost-runtime-that-does-not-exist");
    config.bundled_path = Some(bundled.clone());
    let resolved = resolve_runtime(&config, Duration::from_secs(1))
        .await
        .expect("resolves");

    assert!(resolved.bundled);
    assert_eq!(resolved.executable, bundled);
    assert_eq!(resolved.version, None);
    assert_eq!(resolved.directory(), Some(dir.path()));
}

#[tokio::test]
async fn guest_binary_satisfies_minimum_version() {
    let mut config = runtime(env!("CARGO_BIN_EXE_exthost-guest"));
    config.min_version = Some("0.1".into());
    let resolved = resolve_runtime(&config, Duration::from_secs(10))
        .await
        .expect("resolves");
    assert!(resolved.version.is_some());

    config.min_version = Some("999.0".into());
    let err = resolve_runtime(&config, Duration::from_secs(10))
        .await
        .expect_err("too old");
    assert!(err.to_string().contains("or newer is required"));
}
