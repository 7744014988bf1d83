//! Task-scoped stack of active graphs.
//!
//! Every logical task sees its own stack value. A push never edits the value
//! another task may hold: it builds a new stack and swaps the current task's
//! slot to point at it. Futures entering a scope carry their own slot, which
//! tokio installs on every poll, so two scoped futures joined inside one task
//! stay isolated as well.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::task::JoinHandle;

use crate::error::{GraphError, Result};
use crate::graph::Graph;

tokio::task_local! {
    static ACTIVE_GRAPHS: RefCell<ContextStack>;
}

/// Immutable snapshot of the active graphs, outermost at index 0
#[derive(Clone)]
pub struct ContextStack {
    graphs: Arc<[Graph]>,
}

impl Default for ContextStack {
    fn default() -> Self {
        Self {
            graphs: Arc::from(Vec::new()),
        }
    }
}

impl ContextStack {
    /// New stack value with `graph` as the innermost entry
    pub fn with(&self, graph: &Graph) -> Self {
        let mut graphs = Vec::with_capacity(self.graphs.len() + 1);
        graphs.extend(self.graphs.iter().cloned());
        graphs.push(graph.clone());
        Self {
            graphs: graphs.into(),
        }
    }

    pub fn innermost(&self) -> Option<Graph> {
        self.graphs.last().cloned()
    }

    /// Innermost first
    pub fn graphs(&self) -> Vec<Graph> {
        self.graphs.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

impl std::fmt::Debug for ContextStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.graphs.iter().rev().map(|g| g.id()))
            .finish()
    }
}

/// Restores the stack value captured by [`push`]
#[must_use = "dropping a token without `pop` leaves the graph active"]
#[derive(Debug)]
pub struct ContextToken {
    previous: ContextStack,
}

/// Current task's stack value; empty outside any scope
pub fn current() -> ContextStack {
    ACTIVE_GRAPHS
        .try_with(|cell| cell.borrow().clone())
        .unwrap_or_default()
}

pub fn in_scope() -> bool {
    ACTIVE_GRAPHS.try_with(|_| ()).is_ok()
}

/// Make `graph` the innermost active graph of the current scope.
pub fn push(graph: &Graph) -> Result<ContextToken> {
    ACTIVE_GRAPHS
        .try_with(|cell| {
            let previous = cell.borrow().clone();
            *cell.borrow_mut() = previous.with(graph);
            ContextToken { previous }
        })
        .map_err(|_| GraphError::NoContextScope)
}

pub fn pop(token: ContextToken) {
    let restored = ACTIVE_GRAPHS.try_with(|cell| {
        *cell.borrow_mut() = token.previous;
    });
    if restored.is_err() {
        tracing::warn!("context token popped outside of its scope");
    }
}

pub fn peek() -> Option<Graph> {
    ACTIVE_GRAPHS
        .try_with(|cell| cell.borrow().innermost())
        .ok()
        .flatten()
}

/// Active graphs, innermost first
pub fn all() -> Vec<Graph> {
    current().graphs()
}

/// Run `fut` in a fresh slot seeded with a copy of the current stack.
pub fn scope<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    with_stack(current(), fut)
}

pub fn sync_scope<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    with_stack_sync(current(), f)
}

pub fn with_stack<F: Future>(stack: ContextStack, fut: F) -> impl Future<Output = F::Output> {
    ACTIVE_GRAPHS.scope(RefCell::new(stack), fut)
}

pub fn with_stack_sync<F, R>(stack: ContextStack, f: F) -> R
where
    F: FnOnce() -> R,
{
    ACTIVE_GRAPHS.sync_scope(RefCell::new(stack), f)
}

/// `tokio::spawn` that forks the current stack into the new task
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(scope(fut))
}

/// Polls an inner stream with a stack value installed.
///
/// Changes the inner stream makes to the stack while being polled are kept
/// and reinstalled on the next poll.
pub struct ScopedStream<S> {
    inner: Pin<Box<S>>,
    stack: ContextStack,
}

impl<S: Stream> ScopedStream<S> {
    pub fn new(stack: ContextStack, inner: S) -> Self {
        Self {
            inner: Box::pin(inner),
            stack,
        }
    }

    /// Scope `inner` to a copy of the current stack
    pub fn current(inner: S) -> Self {
        Self::new(current(), inner)
    }
}

impl<S: Stream> Stream for ScopedStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let inner = &mut this.inner;
        let (poll, stack) = ACTIVE_GRAPHS.sync_scope(RefCell::new(this.stack.clone()), || {
            let poll = inner.as_mut().poll_next(cx);
            (poll, current())
        });
        this.stack = stack;
        poll
    }
}
