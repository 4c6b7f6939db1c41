//! RPC correlation, dispatch and teardown across two connected endpoints.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use exthost_bridge::protocol::{ChannelOptions, FramedChannel};
use exthost_bridge::rpc::{
    unknown_method, Args, LocalService, RpcProtocol, RpcValue, ServiceFuture, ServiceResult,
};
use exthost_bridge::services::{Direction, GuestService, MainService};
use exthost_bridge::{AppError, RemoteError, RemoteErrorKind};
use tokio::sync::Notify;

use super::test_helpers::{channel_pair, pump, ChannelEnd};

/// Guest-side `ExtHostCommands` stand-in: echoes after a per-call delay.
struct DelayedEcho;

async fn echo_after_delay(args: Vec<RpcValue>) -> ServiceResult {
    let reader = Args::new("$echo", &args);
    let delay = reader.int(1, "delay_ms")?;
    tokio::time::sleep(Duration::from_millis(u64::try_from(delay).unwrap_or(0))).await;
    Ok(reader.value(0).clone())
}

fn explode() -> ServiceResult {
    panic!("handler exploded")
}

impl LocalService for DelayedEcho {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<RpcValue>) -> ServiceFuture<'a> {
        match method {
            "$echo" => Box::pin(echo_after_delay(args)),
            "$fail" => Box::pin(std::future::ready::<ServiceResult>(Err(RemoteError::handler("boom")))),
            "$panic" => Box::pin(async { explode() }),
            "$block" => Box::pin(std::future::pending::<ServiceResult>()),
            _ => unknown_method(GuestService::Commands.name(), method),
        }
    }
}

/// Counts calls and parks until released.
#[derive(Default)]
struct Gate {
    started: AtomicUsize,
    release: Notify,
}

impl LocalService for Gate {
    fn invoke<'a>(&'a self, _method: &'a str, _args: Vec<RpcValue>) -> ServiceFuture<'a> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok::<_, RemoteError>(RpcValue::Null)
        })
    }
}

struct Endpoints {
    host: RpcProtocol,
    guest: RpcProtocol,
    _channels: (FramedChannel, FramedChannel),
}

fn connect(max_dispatch: usize, guest_service: Arc<dyn LocalService>) -> Endpoints {
    let ((host_channel, host_events), (guest_channel, guest_events)): (ChannelEnd, ChannelEnd) =
        channel_pair(ChannelOptions::default());

    let host = RpcProtocol::new(Direction::Main, host_channel.sender(), max_dispatch);
    let guest = RpcProtocol::new(Direction::Guest, guest_channel.sender(), max_dispatch);
    guest
        .register_local(GuestService::Commands.address(), guest_service)
        .expect("bind");
    guest.seal();

    pump(host.clone(), host_events);
    pump(guest.clone(), guest_events);

    Endpoints {
        host,
        guest,
        _channels: (host_channel, guest_channel),
    }
}

#[tokio::test]
async fn replies_correlate_with_their_calls() {
    let endpoints = connect(64, Arc::new(DelayedEcho));
    let proxy = endpoints
        .host
        .get_remote(GuestService::Commands.address())
        .expect("proxy");

    let calls: Vec<_> = (0..40i64)
        .map(|i| {
            let delay = (i * 7919) % 50;
            (i, proxy.call("$echo", vec![RpcValue::Int(i), RpcValue::Int(delay)]))
        })
        .collect();

    for (i, reply) in calls {
        assert_eq!(reply.await.expect("reply"), RpcValue::Int(i));
    }
    assert_eq!(endpoints.host.pending_count(), 0);
}

#[tokio::test]
async fn handler_errors_and_panics_become_remote_errors() {
    let endpoints = connect(8, Arc::new(DelayedEcho));
    let proxy = endpoints
        .host
        .get_remote(GuestService::Commands.address())
        .expect("proxy");

    let err = proxy.call("$fail", vec![]).await.expect_err("fails");
    assert!(matches!(&err, AppError::Remote(e) if e.kind == RemoteErrorKind::Handler && e.message == "boom"));

    let err = proxy.call("$panic", vec![]).await.expect_err("panics");
    assert!(matches!(&err, AppError::Remote(e) if e.message.contains("panicked")));

    let err = proxy.call("$nope", vec![]).await.expect_err("unknown method");
    assert!(matches!(&err, AppError::Remote(e) if e.kind == RemoteErrorKind::UnknownMethod));

    // The endpoint keeps serving after a panic.
    let ok = proxy
        .call("$echo", vec!["still alive".into(), RpcValue::Int(0)])
        .await
        .expect("echo");
    assert_eq!(ok.as_str(), Some("still alive"));
}

#[tokio::test]
async fn unbound_service_is_reported_by_the_peer() {
    let endpoints = connect(8, Arc::new(DelayedEcho));
    let proxy = endpoints
        .host
        .get_remote(GuestService::ExtensionService.address())
        .expect("proxy");

    let err = proxy.call("$activateById", vec!["x".into()]).await.expect_err("unbound");
    assert!(matches!(&err, AppError::Remote(e) if e.kind == RemoteErrorKind::UnknownService));
}

#[tokio::test]
async fn addressing_respects_direction() {
    let endpoints = connect(8, Arc::new(DelayedEcho));

    let err = endpoints
        .host
        .get_remote(MainService::Log.address())
        .expect_err("local service is not remote");
    assert!(matches!(err, AppError::Rpc(_)));

    let err = endpoints
        .host
        .register_local(GuestService::Commands.address(), Arc::new(DelayedEcho))
        .expect_err("guest service on host");
    assert!(err.to_string().contains("cannot be bound on the main side"));

    let err = endpoints
        .guest
        .register_local(GuestService::Configuration.address(), Arc::new(DelayedEcho))
        .expect_err("sealed");
    assert!(err.to_string().contains("sealed"));
    assert!(endpoints.guest.is_bound(GuestService::Commands.address()));
    assert!(!endpoints.guest.is_bound(GuestService::Configuration.address()));
}

#[tokio::test]
async fn teardown_fails_every_pending_call_once() {
    let endpoints = connect(8, Arc::new(DelayedEcho));
    let proxy = endpoints
        .host
        .get_remote(GuestService::Commands.address())
        .expect("proxy");

    let pending: Vec<_> = (0..5).map(|_| proxy.call("$block", vec![])).collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(endpoints.host.pending_count(), 5);
    let infos = endpoints.host.pending_calls();
    assert_eq!(infos.len(), 5);
    assert!(infos.windows(2).all(|w| w[0].call_id < w[1].call_id));
    assert!(infos.iter().all(|info| info.method == "$block"));

    endpoints.host.dispose();
    endpoints.host.dispose();
    assert!(endpoints.host.is_disposed());
    assert_eq!(endpoints.host.pending_count(), 0);

    for reply in pending {
        let err = tokio::time::timeout(Duration::from_secs(1), reply)
            .await
            .expect("resolved promptly")
            .expect_err("aborted");
        assert!(matches!(&err, AppError::ConnectionClosed(msg) if msg.contains("aborted by teardown")));
    }

    let late = proxy.call("$echo", vec![RpcValue::Null, RpcValue::Int(0)]);
    assert_eq!(late.call_id(), None);
    assert!(matches!(late.await, Err(AppError::Disposed(_))));
    assert!(endpoints.host.wait_stopped(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn dispatch_concurrency_is_bounded() {
    let gate = Arc::new(Gate::default());
    let endpoints = connect(2, Arc::clone(&gate) as Arc<dyn LocalService>);
    let proxy = endpoints
        .host
        .get_remote(GuestService::Commands.address())
        .expect("proxy");

    let replies: Vec<_> = (0..4).map(|_| proxy.call("$any", vec![])).collect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gate.started.load(Ordering::SeqCst), 2);

    gate.release.notify_waiters();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gate.started.load(Ordering::SeqCst), 4);
    gate.release.notify_waiters();

    for reply in replies {
        tokio::time::timeout(Duration::from_secs(2), reply)
            .await
            .expect("completes")
            .expect("ok");
    }
}

#[tokio::test]
async fn non_finite_floats_cross_the_wire() {
    let endpoints = connect(8, Arc::new(DelayedEcho));
    let proxy = endpoints
        .host
        .get_remote(GuestService::Commands.address())
        .expect("proxy");

    let reply = tokio::time::timeout(
        Duration::from_secs(2),
        proxy.call("$echo", vec![RpcValue::Float(f64::NAN), RpcValue::Int(0)]),
    )
    .await
    .expect("reply arrives")
    .expect("echo");
    assert!(matches!(reply, RpcValue::Float(f) if f.is_nan()), "{reply:?}");

    let inf = RpcValue::map([("limit", RpcValue::Float(f64::NEG_INFINITY))]);
    let reply = tokio::time::timeout(
        Duration::from_secs(2),
        proxy.call("$echo", vec![inf.clone(), RpcValue::Int(0)]),
    )
    .await
    .expect("reply arrives")
    .expect("echo");
    assert_eq!(reply, inf);
    assert_eq!(endpoints.host.pending_count(), 0);
}
