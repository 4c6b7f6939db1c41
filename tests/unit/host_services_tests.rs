use std::sync::Arc;
use std::time::Duration;

use exthost_bridge::rpc::{LocalService, ResourceUri, RpcValue, ServiceResult};
use exthost_bridge::services::host::{ActivationStatus, HostServices, Severity};
use exthost_bridge::services::methods::{
    file_system, log, main_commands, main_configuration, main_extension, message,
};
use exthost_bridge::services::MainService;
use exthost_bridge::RemoteErrorKind;

fn settings() -> toml::Table {
    toml::from_str(
        r#"
[editor]
tabSize = 4
fontFamily = "mono"

[files]
exclude = ["target"]
"#,
    )
    .expect("settings parse")
}

fn services(root: &std::path::Path) -> HostServices {
    HostServices::new(root.to_path_buf(), settings())
}

async fn call(
    services: &HostServices,
    service: MainService,
    method: &str,
    args: Vec<RpcValue>,
) -> Result<RpcValue, exthost_bridge::RemoteError> {
    let binding: Arc<dyn LocalService> = services.binding_for(service);
    binding.invoke(method, args).await
}

#[tokio::test]
async fn configuration_sections_use_dotted_keys() {
    let temp = tempfile::tempdir().expect("tempdir");
    let services = services(temp.path());

    let tab = call(
        &services,
        MainService::Configuration,
        main_configuration::GET_CONFIGURATION,
        vec!["editor.tabSize".into()],
    )
    .await
    .expect("lookup");
    assert_eq!(tab, RpcValue::Int(4));

    let missing = call(
        &services,
        MainService::Configuration,
        main_configuration::GET_CONFIGURATION,
        vec!["editor.wordWrap".into()],
    )
    .await
    .expect("lookup");
    assert!(missing.is_null());

    let all = services.configuration().snapshot();
    assert!(all.get("files").and_then(|f| f.get("exclude")).is_some());
}

#[tokio::test]
async fn configuration_updates_and_removals() {
    let temp = tempfile::tempdir().expect("tempdir");
    let services = services(temp.path());

    call(
        &services,
        MainService::Configuration,
        main_configuration::UPDATE_OPTION,
        vec!["terminal.integrated.shell".into(), "/bin/zsh".into()],
    )
    .await
    .expect("update");
    assert_eq!(
        services
            .configuration()
            .section(Some("terminal.integrated.shell"))
            .as_str(),
        Some("/bin/zsh")
    );

    call(
        &services,
        MainService::Configuration,
        main_configuration::UPDATE_OPTION,
        vec!["editor.tabSize".into(), RpcValue::Null],
    )
    .await
    .expect("null removes");
    assert!(services.configuration().section(Some("editor.tabSize")).is_null());

    call(
        &services,
        MainService::Configuration,
        main_configuration::REMOVE_OPTION,
        vec!["editor.fontFamily".into()],
    )
    .await
    .expect("remove");
    assert!(services.configuration().section(Some("editor.fontFamily")).is_null());

    let err = call(
        &services,
        MainService::Configuration,
        main_configuration::UPDATE_OPTION,
        vec!["editor.tabSize.deeper".into(), RpcValue::Int(1)],
    )
    .await;
    assert!(err.is_ok(), "tabSize was removed, so the path is free again");

    let err = call(
        &services,
        MainService::Configuration,
        main_configuration::UPDATE_OPTION,
        vec!["files.exclude.inner".into(), RpcValue::Int(1)],
    )
    .await
    .expect_err("path through a non-table");
    assert_eq!(err.kind, RemoteErrorKind::InvalidArguments);
}

#[tokio::test]
async fn commands_track_guest_ids_and_run_host_handlers() {
    let temp = tempfile::tempdir().expect("tempdir");
    let services = services(temp.path());
    services.commands().register_host_command(
        "host.sum",
        Arc::new(|args: Vec<RpcValue>| -> ServiceResult {
            Ok(RpcValue::Int(args.iter().filter_map(RpcValue::as_i64).sum()))
        }),
    );

    call(
        &services,
        MainService::Commands,
        main_commands::REGISTER,
        vec!["guest.hello".into()],
    )
    .await
    .expect("register");
    assert_eq!(services.commands().guest_commands(), vec!["guest.hello".to_owned()]);

    let sum = call(
        &services,
        MainService::Commands,
        main_commands::EXECUTE,
        vec![
            "host.sum".into(),
            RpcValue::List(vec![RpcValue::Int(2), RpcValue::Int(3)]),
        ],
    )
    .await
    .expect("execute");
    assert_eq!(sum, RpcValue::Int(5));

    let listed = call(&services, MainService::Commands, main_commands::GET_COMMANDS, vec![])
        .await
        .expect("list");
    assert_eq!(
        listed,
        RpcValue::from(vec!["guest.hello".to_owned(), "host.sum".to_owned()])
    );

    let err = call(
        &services,
        MainService::Commands,
        main_commands::EXECUTE,
        vec!["guest.hello".into()],
    )
    .await
    .expect_err("guest command not runnable on host");
    assert!(err.message.contains("contributed by the guest"));

    call(
        &services,
        MainService::Commands,
        main_commands::UNREGISTER,
        vec!["guest.hello".into()],
    )
    .await
    .expect("unregister");
    assert!(services.commands().guest_commands().is_empty());
}

#[tokio::test]
async fn activation_notifications_settle_waiters() {
    let temp = tempfile::tempdir().expect("tempdir");
    let services = services(temp.path());
    let tracker = services.clone();

    let waiter = tokio::spawn(async move {
        tracker
            .activations()
            .wait_settled("demo.ext", Duration::from_secs(5))
            .await
    });

    call(
        &services,
        MainService::ExtensionService,
        main_extension::ON_WILL_ACTIVATE,
        vec!["demo.ext".into()],
    )
    .await
    .expect("will");
    assert_eq!(
        services.activations().status("demo.ext"),
        Some(ActivationStatus::Activating)
    );

    call(
        &services,
        MainService::ExtensionService,
        main_extension::ON_DID_ACTIVATE,
        vec!["demo.ext".into(), RpcValue::Int(12)],
    )
    .await
    .expect("did");

    let settled = waiter.await.expect("join");
    assert_eq!(
        settled,
        Some(ActivationStatus::Activated {
            elapsed: Duration::from_millis(12)
        })
    );

    call(
        &services,
        MainService::ExtensionService,
        main_extension::ON_ACTIVATION_ERROR,
        vec!["demo.bad".into(), "entry missing".into()],
    )
    .await
    .expect("error report");
    assert_eq!(
        services
            .activations()
            .wait_settled("demo.bad", Duration::from_millis(10))
            .await,
        Some(ActivationStatus::Failed {
            message: "entry missing".into()
        })
    );
    assert_eq!(services.activations().snapshot().len(), 2);
}

#[tokio::test]
async fn wait_settled_times_out_for_unknown_ids() {
    let temp = tempfile::tempdir().expect("tempdir");
    let services = services(temp.path());
    assert_eq!(
        services
            .activations()
            .wait_settled("demo.never", Duration::from_millis(20))
            .await,
        None
    );
}

#[tokio::test]
async fn messages_and_log_records_are_accepted() {
    let temp = tempfile::tempdir().expect("tempdir");
    let services = services(temp.path());

    call(
        &services,
        MainService::MessageService,
        message::SHOW_MESSAGE,
        vec![
            "warning".into(),
            "disk almost full".into(),
            RpcValue::from(vec!["Retry".to_owned()]),
        ],
    )
    .await
    .expect("show");
    let recent = services.messages().recent();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].severity, Severity::Warning);
    assert_eq!(recent[0].actions, vec!["Retry".to_owned()]);

    call(
        &services,
        MainService::Log,
        log::LOG,
        vec!["info".into(), "demo.ext".into(), "hello".into()],
    )
    .await
    .expect("log");

    let err = call(&services, MainService::Log, log::LOG, vec![RpcValue::Int(1)])
        .await
        .expect_err("bad args");
    assert_eq!(err.kind, RemoteErrorKind::InvalidArguments);
}

#[tokio::test]
async fn file_system_reads_inside_workspace_only() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().canonicalize().expect("canonical");
    std::fs::create_dir_all(root.join("src")).expect("mkdir");
    std::fs::write(root.join("src/main.rs"), b"fn main() {}").expect("write");
    std::fs::write(root.join("README.md"), b"# demo").expect("write");
    let services = services(&root);

    let uri = |rel: &str| RpcValue::Uri(ResourceUri::from_file_path(&root.join(rel)));

    let bytes = call(&services, MainService::FileSystem, file_system::READ_FILE, vec![uri("src/main.rs")])
        .await
        .expect("read");
    assert_eq!(bytes.as_buffer(), Some(&b"fn main() {}"[..]));

    let stat = call(&services, MainService::FileSystem, file_system::STAT, vec![uri("README.md")])
        .await
        .expect("stat");
    assert_eq!(stat.get("type").and_then(RpcValue::as_str), Some("file"));
    assert_eq!(stat.get("size").and_then(RpcValue::as_i64), Some(6));

    let root_uri = RpcValue::Uri(ResourceUri::from_file_path(&root));
    let listing = call(&services, MainService::FileSystem, file_system::READ_DIRECTORY, vec![root_uri])
        .await
        .expect("readdir");
    assert_eq!(
        listing,
        RpcValue::List(vec![
            RpcValue::List(vec!["README.md".into(), "file".into()]),
            RpcValue::List(vec!["src".into(), "directory".into()]),
        ])
    );

    let missing = call(&services, MainService::FileSystem, file_system::READ_FILE, vec![uri("nope.txt")])
        .await
        .expect_err("missing");
    assert!(missing.message.starts_with("not found:"));

    let escape = RpcValue::Uri(ResourceUri::from_file_path(&root.join("../outside.txt")));
    let err = call(&services, MainService::FileSystem, file_system::READ_FILE, vec![escape])
        .await
        .expect_err("escape");
    assert_eq!(err.kind, RemoteErrorKind::Handler);
    assert!(err.message.contains("path violation"));
}

#[tokio::test]
async fn unknown_methods_are_reported() {
    let temp = tempfile::tempdir().expect("tempdir");
    let services = services(temp.path());
    for service in MainService::ALL {
        let err = call(&services, service, "$doesNotExist", vec![])
            .await
            .expect_err("unknown method");
        assert_eq!(err.kind, RemoteErrorKind::UnknownMethod);
    }
}
