//! Host session against the in-process reference guest runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use exthost_bridge::extensions::ExtensionCatalog;
use exthost_bridge::guest::{GuestExit, GuestOptions, GuestRuntime, BUILTIN_COMMANDS};
use exthost_bridge::rpc::RpcValue;
use exthost_bridge::services::host::ActivationStatus;
use exthost_bridge::services::proxies::{CommandsProxy, ConfigurationProxy, ExtensionServiceProxy};
use exthost_bridge::session::{ExtensionHostSession, SessionState};
use exthost_bridge::transport::Connection;
use exthost_bridge::{AppError, RemoteErrorKind};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{demo_catalog, demo_descriptor, test_config};

const WAIT: Duration = Duration::from_secs(5);

struct Running {
    _workspace: tempfile::TempDir,
    _extensions: tempfile::TempDir,
    session: ExtensionHostSession,
    runtime: Option<GuestRuntime>,
}

/// Start a debug-mode session with the guest runtime on the other end.
async fn run_pair(top_level: &str, catalog: impl FnOnce(&std::path::Path) -> ExtensionCatalog) -> Running {
    let workspace = tempfile::tempdir().expect("workspace");
    let extensions = tempfile::tempdir().expect("extensions");
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let config = test_config(
        workspace.path(),
        top_level,
        &format!("[transport]\ndebug_host = \"127.0.0.1\"\ndebug_port = {port}\n"),
    );
    let session = ExtensionHostSession::new(config, catalog(extensions.path()));

    let guest: JoinHandle<exthost_bridge::Result<GuestRuntime>> = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        GuestRuntime::handshake(Connection::from_tcp(stream), &GuestOptions::default()).await
    });

    tokio::time::timeout(WAIT, session.start())
        .await
        .expect("start in time")
        .expect("session active");
    let runtime = guest.await.expect("join").expect("guest handshake");

    Running {
        _workspace: workspace,
        _extensions: extensions,
        session,
        runtime: Some(runtime),
    }
}

impl Running {
    fn serve(&mut self, shutdown: CancellationToken) -> JoinHandle<GuestExit> {
        let runtime = self.runtime.take().expect("not yet serving");
        tokio::spawn(runtime.serve(shutdown))
    }
}

async fn wait_for_guest_commands(session: &ExtensionHostSession) -> Vec<String> {
    let commands = session.host_services().commands();
    tokio::time::timeout(WAIT, async {
        loop {
            let ids = commands.guest_commands();
            if ids.len() == BUILTIN_COMMANDS.len() {
                return ids;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("guest announced its commands")
}

#[tokio::test]
async fn guest_activates_serves_and_terminates() {
    let mut pair = run_pair(r#"activate = ["demo.ext"]"#, demo_catalog).await;
    let runtime = pair.runtime.as_ref().expect("runtime");
    assert_eq!(runtime.init().session_id, pair.session.id());
    assert_eq!(runtime.init().extensions.len(), 1);
    let extensions = Arc::clone(runtime.extensions());

    let serving = pair.serve(CancellationToken::new());
    let session = &pair.session;

    let status = session
        .host_services()
        .activations()
        .wait_settled("demo.ext", WAIT)
        .await;
    assert!(matches!(status, Some(ActivationStatus::Activated { .. })), "{status:?}");
    let recorded = tokio::time::timeout(WAIT, async {
        while extensions.activated().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(recorded.is_ok());
    assert_eq!(extensions.activated().await, vec!["demo.ext".to_owned()]);

    let mut announced = wait_for_guest_commands(session).await;
    announced.sort();
    let mut expected: Vec<String> = BUILTIN_COMMANDS.iter().map(|c| (*c).to_owned()).collect();
    expected.sort();
    assert_eq!(announced, expected);

    let rpc = session.active_rpc().expect("active");
    let commands = CommandsProxy::new(&rpc).expect("proxy");
    assert_eq!(
        commands
            .execute_contributed_command("exthost.ping", vec![])
            .await
            .expect("ping"),
        RpcValue::from("pong")
    );
    assert_eq!(
        commands
            .execute_contributed_command("exthost.echo", vec![RpcValue::Int(1), "two".into()])
            .await
            .expect("echo"),
        RpcValue::List(vec![RpcValue::Int(1), "two".into()])
    );
    let err = commands
        .execute_contributed_command("exthost.missing", vec![])
        .await
        .expect_err("unknown command");
    assert!(matches!(&err, AppError::Remote(e) if e.kind == RemoteErrorKind::Handler));

    let before = commands
        .execute_contributed_command("exthost.getConfiguration", vec!["editor".into()])
        .await
        .expect("configuration");
    assert_eq!(before.get("tabSize"), Some(&RpcValue::Int(2)));

    session
        .host_services()
        .configuration()
        .update("editor.tabSize", &RpcValue::Int(8))
        .expect("update");
    ConfigurationProxy::new(&rpc)
        .expect("proxy")
        .accept_configuration_changed(session.host_services().configuration().snapshot())
        .await
        .expect("pushed");
    let after = commands
        .execute_contributed_command("exthost.getConfiguration", vec!["editor".into()])
        .await
        .expect("configuration");
    assert_eq!(after.get("tabSize"), Some(&RpcValue::Int(8)));

    session.dispose().await;
    let exit = tokio::time::timeout(WAIT, serving)
        .await
        .expect("guest stopped")
        .expect("join");
    assert_eq!(exit, GuestExit::Terminated);
}

#[tokio::test]
async fn missing_entry_module_reports_activation_error() {
    let mut pair = run_pair("", |location| {
        // Entry module deliberately not written.
        ExtensionCatalog::build(vec![demo_descriptor(location)], &HashMap::new()).expect("catalog")
    })
    .await;
    let _serving = pair.serve(CancellationToken::new());
    let session = &pair.session;

    let err = session
        .activate_guest_module("demo.ext")
        .await
        .expect_err("entry missing");
    assert!(err.to_string().contains("entry module"), "{err}");

    let status = session
        .host_services()
        .activations()
        .wait_settled("demo.ext", WAIT)
        .await;
    assert!(
        matches!(&status, Some(ActivationStatus::Failed { message }) if message.contains("not found")),
        "{status:?}"
    );

    let proxy = ExtensionServiceProxy::new(&session.active_rpc().expect("active")).expect("proxy");
    assert!(!proxy.activate_by_id("demo.unknown", "api").await.expect("call"));
    assert!(proxy.activated_extensions().await.expect("list").is_empty());

    session.dispose().await;
}

#[tokio::test]
async fn guest_shutdown_terminates_the_session() {
    let mut pair = run_pair("", demo_catalog).await;
    let shutdown = CancellationToken::new();
    let serving = pair.serve(shutdown.clone());

    shutdown.cancel();
    let exit = tokio::time::timeout(WAIT, serving)
        .await
        .expect("guest stopped")
        .expect("join");
    assert_eq!(exit, GuestExit::Shutdown);

    assert!(pair.session.wait_for_state(SessionState::Disposed, WAIT).await);
    assert_eq!(
        pair.session.failure().as_deref(),
        Some("guest requested termination")
    );
}
