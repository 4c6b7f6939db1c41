//! `MainThreadLog`: guest log records re-emitted through `tracing`.

use tracing::{debug, error, info, trace, warn};

use crate::rpc::{unknown_method, Args, LocalService, RpcValue, ServiceFuture};
use crate::services::methods::log as m;
use crate::services::MainService;

/// Forwards guest log lines into the host subscriber.
#[derive(Debug, Default)]
pub struct GuestLogService;

impl GuestLogService {
    fn log(args: &[RpcValue]) -> crate::rpc::ServiceResult {
        let args = Args::new(m::LOG, args);
        let level = args.string(0, "level")?;
        let source = args.string(1, "target")?;
        let message = args.string(2, "message")?;

        match level.to_ascii_lowercase().as_str() {
            "error" => error!(target: "exthost::guest", source, "{message}"),
            "warn" | "warning" => warn!(target: "exthost::guest", source, "{message}"),
            "debug" => debug!(target: "exthost::guest", source, "{message}"),
            "trace" => trace!(target: "exthost::guest", source, "{message}"),
            _ => info!(target: "exthost::guest", source, "{message}"),
        }
        Ok(RpcValue::Null)
    }
}

impl LocalService for GuestLogService {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<RpcValue>) -> ServiceFuture<'a> {
        match method {
            m::LOG => Box::pin(async move { Self::log(&args) }),
            _ => unknown_method(MainService::Log.name(), method),
        }
    }
}
