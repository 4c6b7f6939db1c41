//! Local service implementations bound into an [`RpcProtocol`](super::RpcProtocol).

use std::future::Future;
use std::pin::Pin;

use super::value::RpcValue;
use crate::errors::RemoteError;

/// Outcome of one service method invocation.
pub type ServiceResult = std::result::Result<RpcValue, RemoteError>;

/// Boxed future returned by [`LocalService::invoke`].
pub type ServiceFuture<'a> = Pin<Box<dyn Future<Output = ServiceResult> + Send + 'a>>;

/// Object-safe handler for the methods of one catalog service.
///
/// Implementations match on `method` and decode positional `args`
/// themselves; unknown methods should answer with
/// [`unknown_method`].
pub trait LocalService: Send + Sync {
    /// Invoke `method` with `args`.
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<RpcValue>) -> ServiceFuture<'a>;
}

/// Ready future failing with an `unknown_method` error.
#[must_use]
pub fn unknown_method<'a>(service: &'static str, method: &str) -> ServiceFuture<'a> {
    let err = RemoteError::new(
        crate::errors::RemoteErrorKind::UnknownMethod,
        format!("{service} has no method '{method}'"),
    );
    Box::pin(std::future::ready(Err(err)))
}
