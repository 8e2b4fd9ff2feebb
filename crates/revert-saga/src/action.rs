use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::context::Context;
use crate::error::Fault;

/// Error type returned by user-supplied actions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a single action invocation.
pub type ActionResult = Result<(), BoxError>;

/// An operation over a cancellation [`Context`] that either succeeds or fails.
///
/// Every `Fn(Context) -> impl Future<Output = ActionResult>` closure is an
/// action, so steps can be built from plain async closures, hand-written
/// types, or decorators such as the retry wrapper.
pub trait Action: Send + Sync {
    fn call<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, ActionResult>;
}

impl<F, Fut> Action for F
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    fn call<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, ActionResult> {
        self(ctx.clone()).boxed()
    }
}

/// Run an action, turning a panic at any point into an ordinary [`Fault`].
///
/// Both the synchronous call that builds the future and every poll of it are
/// guarded, so a misbehaving action cannot unwind into the orchestrator.
pub(crate) async fn contain(action: &dyn Action, ctx: &Context) -> Result<(), Fault> {
    let future = match catch_unwind(AssertUnwindSafe(|| action.call(ctx))) {
        Ok(future) => future,
        Err(payload) => return Err(Fault::from_panic(payload.as_ref())),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(Fault::Returned(error)),
        Err(payload) => Err(Fault::from_panic(payload.as_ref())),
    }
}
