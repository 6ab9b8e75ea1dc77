//! Beat handlers and the per-plugin handler map.
//!
//! Handlers are resolved by name once, when a sequence is mounted. After that
//! the catalog keeps the resolved [`Handler`] next to each beat, so execution
//! never looks a handler up by string.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures::future::{self, BoxFuture};

use crate::{
    baton::{Baton, BatonHandle},
    context::BeatContext,
    error::HandlerError,
};

/// Outcome of a single handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

pub type SyncHandlerFn = dyn Fn(&mut Baton, &BeatContext) -> HandlerResult + Send + Sync;
pub type AsyncHandlerFn =
    dyn Fn(BatonHandle, BeatContext) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// Callable bound to a beat. Synchronous handlers edit a shallow copy of the
/// baton whose changes are written back once they return, so the baton stays
/// unlocked while they run. Asynchronous handlers receive the shared handle
/// and lock it only around their own reads and writes.
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<SyncHandlerFn>),
    Async(Arc<AsyncHandlerFn>),
}

impl Handler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&mut Baton, &BeatContext) -> HandlerResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(BatonHandle, BeatContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::Async(Arc::new(
            move |baton: BatonHandle, context: BeatContext| -> BoxFuture<'static, HandlerResult> {
                Box::pin(f(baton, context))
            },
        ))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }

    /// Invokes the handler. Synchronous handlers run before this returns; the
    /// returned future is then already complete.
    pub fn invoke(
        &self,
        baton: &BatonHandle,
        context: BeatContext,
    ) -> BoxFuture<'static, HandlerResult> {
        match self {
            Self::Sync(f) => Box::pin(future::ready(run_sync(f.as_ref(), baton, &context))),
            Self::Async(f) => f(baton.clone(), context),
        }
    }
}

fn run_sync(f: &SyncHandlerFn, baton: &BatonHandle, context: &BeatContext) -> HandlerResult {
    let base = baton.snapshot()?;
    let mut working = base.clone();
    let result = f(&mut working, context);
    baton.write(|shared| shared.apply_edits(&base, working))?;
    result
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Handler::Sync"),
            Self::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// Handler implementations supplied by one plugin, keyed by handler name.
/// Lookups are case-sensitive.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: Handler) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn register_sync<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut Baton, &BeatContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(name, Handler::sync(f))
    }

    pub fn register_async<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(BatonHandle, BeatContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(name, Handler::from_async(f))
    }

    pub fn with_sync<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Baton, &BeatContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_sync(name, f);
        self
    }

    pub fn with_async<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(BatonHandle, BeatContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_async(name, f);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolution_is_case_sensitive() {
        let registry = HandlerRegistry::new().with_sync("applyTheme", |_, _| Ok(()));

        assert!(registry.resolve("applyTheme").is_some());
        assert!(registry.resolve("applytheme").is_none());
        assert_eq!(registry.names(), vec!["applyTheme"]);
    }

    #[tokio::test]
    async fn sync_handler_runs_before_invoke_returns() {
        let handler = Handler::sync(|baton, _| {
            baton.set("touched", true);
            Ok(())
        });
        let baton = BatonHandle::new(Baton::new());

        let pending = handler.invoke(&baton, BeatContext::standalone(baton.clone()));
        assert_eq!(baton.get("touched").unwrap(), Some(json!(true)));
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn async_handler_runs_when_awaited() {
        let handler = Handler::from_async(|baton: BatonHandle, _| async move {
            tokio::task::yield_now().await;
            baton.set("touched", true)?;
            Ok::<(), HandlerError>(())
        });
        let baton = BatonHandle::new(Baton::new());

        handler
            .invoke(&baton, BeatContext::standalone(baton.clone()))
            .await
            .unwrap();
        assert_eq!(baton.get("touched").unwrap(), Some(json!(true)));
        assert!(handler.is_async());
    }

    #[tokio::test]
    async fn sync_handler_can_use_the_context_payload() {
        let handler = Handler::sync(|baton, context| {
            let seen = context.payload().get("x")?.unwrap_or_default();
            context.payload().set("direct", true)?;
            baton.set("seen", seen);
            Ok(())
        });
        let baton = BatonHandle::new(Baton::from_value(json!({ "x": 7 })));

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            handler.invoke(&baton, BeatContext::standalone(baton.clone())),
        )
        .await
        .expect("sync handler must not block on its own baton");
        result.unwrap();

        assert_eq!(
            baton.to_value().unwrap(),
            json!({ "x": 7, "seen": 7, "direct": true })
        );
    }

    #[tokio::test]
    async fn handler_errors_are_returned() {
        let handler = Handler::sync(|_, _| Err("boom".into()));
        let baton = BatonHandle::new(Baton::new());

        let err = handler
            .invoke(&baton, BeatContext::standalone(baton.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
