use std::collections::HashMap;
use std::path::Path;

use serial_test::serial;

use exthost_bridge::config::ProxyConfig;
use exthost_bridge::supervisor::env::{
    ENV_PARENT_PID, ENV_PIPE_PATH, ENV_SOCKET_HOST, ENV_SOCKET_PORT, ENV_USE_PIPE,
};
use exthost_bridge::supervisor::{build_child_env, connection_target_from_env, inherited_env};
use exthost_bridge::transport::ConnectionTarget;

fn base(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

#[test]
fn tcp_target_sets_socket_variables() {
    let target = ConnectionTarget::Tcp {
        host: "127.0.0.1".into(),
        port: 40111,
    };
    let env = build_child_env(base(&[]), None, &target, &ProxyConfig::default()).expect("env");

    assert_eq!(env.get(ENV_USE_PIPE).map(String::as_str), Some("0"));
    assert_eq!(env.get(ENV_SOCKET_HOST).map(String::as_str), Some("127.0.0.1"));
    assert_eq!(env.get(ENV_SOCKET_PORT).map(String::as_str), Some("40111"));
    assert!(!env.contains_key(ENV_PIPE_PATH));
    assert_eq!(
        env.get(ENV_PARENT_PID),
        Some(&std::process::id().to_string())
    );
}

#[test]
fn stale_target_variables_are_replaced() {
    let inherited = base(&[
        (ENV_SOCKET_HOST, "10.0.0.1"),
        (ENV_SOCKET_PORT, "1"),
        ("KEEP_ME", "yes"),
    ]);
    let target = ConnectionTarget::Pipe {
        path: "/tmp/exthost.sock".into(),
    };
    let env = build_child_env(inherited, None, &target, &ProxyConfig::default()).expect("env");

    assert_eq!(env.get(ENV_USE_PIPE).map(String::as_str), Some("1"));
    assert_eq!(env.get(ENV_PIPE_PATH).map(String::as_str), Some("/tmp/exthost.sock"));
    assert!(!env.contains_key(ENV_SOCKET_HOST));
    assert!(!env.contains_key(ENV_SOCKET_PORT));
    assert_eq!(env.get("KEEP_ME").map(String::as_str), Some("yes"));
}

#[cfg(unix)]
#[test]
fn runtime_dir_leads_path_without_duplicates() {
    let inherited = base(&[("PATH", "/usr/bin:/home/dev/bin:/usr/bin")]);
    let target = ConnectionTarget::Tcp {
        host: "127.0.0.1".into(),
        port: 1,
    };
    let env = build_child_env(
        inherited,
        Some(Path::new("/opt/runtime/bin")),
        &target,
        &ProxyConfig::default(),
    )
    .expect("env");

    let entries: Vec<&str> = env["PATH"].split(':').collect();
    assert_eq!(entries.first(), Some(&"/opt/runtime/bin"));
    assert!(entries.contains(&"/home/dev/bin"));
    assert_eq!(entries.iter().filter(|e| **e == "/usr/bin").count(), 1);
}

#[test]
fn proxy_overrides_win_and_are_written_in_both_cases() {
    let inherited = base(&[("https_proxy", "http://inherited:1"), ("no_proxy", "localhost")]);
    let proxy = ProxyConfig {
        https: Some("http://configured:2".into()),
        ..ProxyConfig::default()
    };
    let target = ConnectionTarget::Tcp {
        host: "127.0.0.1".into(),
        port: 1,
    };
    let env = build_child_env(inherited, None, &target, &proxy).expect("env");

    assert_eq!(env.get("HTTPS_PROXY").map(String::as_str), Some("http://configured:2"));
    assert_eq!(env.get("https_proxy").map(String::as_str), Some("http://configured:2"));
    assert_eq!(env.get("NO_PROXY").map(String::as_str), Some("localhost"));
    assert!(!env.contains_key("HTTP_PROXY"));
}

#[test]
fn target_round_trips_through_environment() {
    for target in [
        ConnectionTarget::Tcp {
            host: "localhost".into(),
            port: 5000,
        },
        ConnectionTarget::Pipe {
            path: "exthost-test.sock".into(),
        },
    ] {
        let env = build_child_env(base(&[]), None, &target, &ProxyConfig::default()).expect("env");
        let parsed = connection_target_from_env(|key| env.get(key).cloned()).expect("parses");
        assert_eq!(parsed, target);
    }
}

#[test]
fn missing_or_invalid_variables_are_setup_errors() {
    let empty: HashMap<&str, &str> = HashMap::new();
    let err = connection_target_from_env(|k| empty.get(k).map(|v| (*v).to_owned()))
        .expect_err("missing flag");
    assert!(err.to_string().contains(ENV_USE_PIPE));

    let bad_port: HashMap<&str, &str> = [
        (ENV_USE_PIPE, "0"),
        (ENV_SOCKET_HOST, "127.0.0.1"),
        (ENV_SOCKET_PORT, "seventy"),
    ]
    .into_iter()
    .collect();
    let err = connection_target_from_env(|k| bad_port.get(k).map(|v| (*v).to_owned()))
        .expect_err("bad port");
    assert!(err.to_string().starts_with("setup: invalid EXTHOST_SOCKET_PORT"));
}

#[test]
#[serial]
fn reads_the_process_environment() {
    std::env::set_var(ENV_USE_PIPE, "0");
    std::env::set_var(ENV_SOCKET_HOST, "127.0.0.1");
    std::env::set_var(ENV_SOCKET_PORT, "6000");

    let parsed = connection_target_from_env(|key| std::env::var(key).ok());

    std::env::remove_var(ENV_USE_PIPE);
    std::env::remove_var(ENV_SOCKET_HOST);
    std::env::remove_var(ENV_SOCKET_PORT);

    assert_eq!(
        parsed.expect("parses"),
        ConnectionTarget::Tcp {
            host: "127.0.0.1".into(),
            port: 6000
        }
    );
}

#[test]
#[serial]
fn inherits_proxy_from_process_environment() {
    std::env::set_var("HTTP_PROXY", "http://from-env:8080");
    let target = ConnectionTarget::Tcp {
        host: "127.0.0.1".into(),
        port: 1,
    };
    let env = build_child_env(inherited_env(), None, &target, &ProxyConfig::default());
    std::env::remove_var("HTTP_PROXY");

    let env = env.expect("env");
    assert_eq!(env.get("http_proxy").map(String::as_str), Some("http://from-env:8080"));
}

#[cfg(unix)]
#[test]
#[serial]
fn non_utf8_variables_are_left_out() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    std::env::set_var("EXTHOST_TEST_BAD_VALUE", OsStr::from_bytes(b"\xff\xfe"));
    std::env::set_var("EXTHOST_TEST_GOOD_VALUE", "kept");
    let inherited = inherited_env();
    std::env::remove_var("EXTHOST_TEST_BAD_VALUE");
    std::env::remove_var("EXTHOST_TEST_GOOD_VALUE");

    assert!(inherited.iter().all(|(k, _)| k != "EXTHOST_TEST_BAD_VALUE"));
    assert!(inherited
        .iter()
        .any(|(k, v)| k == "EXTHOST_TEST_GOOD_VALUE" && v == "kept"));
}
