//! Priority-ordered middleware chain, independent of any transport.
//!
//! A [`MiddlewareChain`] holds named units sorted by ascending priority. Each
//! unit receives the request and a [`Next`] continuation; calling
//! [`Next::run`] hands the request to the following unit, returning without
//! calling it short-circuits the chain. The last unit must act as the
//! terminal handler.
//!
//! [`MiddlewareChain::execute`] copies the member list under a shared lock and
//! releases the lock before running anything, so in-flight requests never
//! observe concurrent `add`/`remove` calls and never block them.

mod registry;

use std::fmt;
use std::future::{Future, ready};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;

pub use registry::MiddlewareRegistry;

/// Chain configuration and registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("middleware chain is empty")]
    ChainEmpty,
    #[error("middleware chain ended without a terminal handler")]
    NoHandler,
    #[error("middleware already registered: {0}")]
    MiddlewareExists(String),
    #[error("middleware not found: {0}")]
    MiddlewareNotFound(String),
}

type Handler<Req, Res, E> =
    dyn Fn(Req, Next<Req, Res, E>) -> BoxFuture<'static, Result<Res, E>> + Send + Sync;

/// A named, prioritized unit of a chain. Lower priorities run first.
pub struct Middleware<Req, Res, E> {
    name: Arc<str>,
    priority: i32,
    handler: Arc<Handler<Req, Res, E>>,
}

impl<Req, Res, E> Clone for Middleware<Req, Res, E> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            priority: self.priority,
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<Req, Res, E> fmt::Debug for Middleware<Req, Res, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl<Req, Res, E> Middleware<Req, Res, E>
where
    Req: Send + 'static,
    Res: Send + 'static,
    E: From<ChainError> + Send + 'static,
{
    /// Build a middleware from an async function of `(request, next)`.
    pub fn new<F, Fut>(name: impl Into<Arc<str>>, priority: i32, handler: F) -> Self
    where
        F: Fn(Req, Next<Req, Res, E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, E>> + Send + 'static,
    {
        let handler: Arc<Handler<Req, Res, E>> =
            Arc::new(move |req, next| -> BoxFuture<'static, Result<Res, E>> {
                Box::pin(handler(req, next))
            });

        Self {
            name: name.into(),
            priority,
            handler,
        }
    }
}

impl<Req, Res, E> Middleware<Req, Res, E> {
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }
}

/// Continuation handed to each middleware; runs the rest of the snapshot.
pub struct Next<Req, Res, E> {
    snapshot: Arc<[Middleware<Req, Res, E>]>,
    index: usize,
}

impl<Req, Res, E> Next<Req, Res, E>
where
    Req: Send + 'static,
    Res: Send + 'static,
    E: From<ChainError> + Send + 'static,
{
    /// Invoke the next middleware, or fail with [`ChainError::NoHandler`]
    /// when the snapshot is exhausted.
    pub fn run(self, req: Req) -> BoxFuture<'static, Result<Res, E>> {
        let Some(middleware) = self.snapshot.get(self.index) else {
            return Box::pin(ready(Err(ChainError::NoHandler.into())));
        };

        let handler = Arc::clone(&middleware.handler);
        let next = Self {
            snapshot: Arc::clone(&self.snapshot),
            index: self.index + 1,
        };
        handler(req, next)
    }

    /// Name of the middleware that `run` would invoke.
    #[must_use]
    pub fn peek(&self) -> Option<&str> {
        self.snapshot.get(self.index).map(Middleware::name)
    }
}

/// Ordered chain of middleware, re-sorted by priority after each mutation.
///
/// Equal priorities have no defined relative order.
pub struct MiddlewareChain<Req, Res, E> {
    middlewares: RwLock<Vec<Middleware<Req, Res, E>>>,
}

impl<Req, Res, E> Default for MiddlewareChain<Req, Res, E> {
    fn default() -> Self {
        Self {
            middlewares: RwLock::new(Vec::new()),
        }
    }
}

impl<Req, Res, E> fmt::Debug for MiddlewareChain<Req, Res, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.middlewares.read().iter()).finish()
    }
}

impl<Req, Res, E> MiddlewareChain<Req, Res, E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware and re-sort by ascending priority.
    pub fn add(&self, middleware: Middleware<Req, Res, E>) {
        let mut middlewares = self.middlewares.write();
        middlewares.push(middleware);
        middlewares.sort_unstable_by_key(Middleware::priority);
    }

    /// Remove the first middleware named `name`. Returns `false` if absent.
    pub fn remove(&self, name: &str) -> bool {
        let mut middlewares = self.middlewares.write();
        match middlewares.iter().position(|m| m.name() == name) {
            Some(index) => {
                middlewares.remove(index);
                true
            }
            None => false,
        }
    }

    /// Member names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.middlewares
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.read().is_empty()
    }

    fn snapshot(&self) -> Arc<[Middleware<Req, Res, E>]> {
        self.middlewares.read().iter().cloned().collect()
    }
}

impl<Req, Res, E> MiddlewareChain<Req, Res, E>
where
    Req: Send + 'static,
    Res: Send + 'static,
    E: From<ChainError> + Send + 'static,
{
    /// Run `req` through the chain as it is at call time.
    ///
    /// # Errors
    /// [`ChainError::ChainEmpty`] if there are no members, [`ChainError::NoHandler`]
    /// if the last member calls `next`, or whatever a member returns.
    pub fn execute(&self, req: Req) -> BoxFuture<'static, Result<Res, E>> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return Box::pin(ready(Err(ChainError::ChainEmpty.into())));
        }

        Next { snapshot, index: 0 }.run(req)
    }
}
