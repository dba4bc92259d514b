/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Registry of named, cancellable in-flight operations.
//!
//! Each registration gets a [`CancellationToken`] and is tracked
//! under a logical key. Cancellation is advisory: it does not stop
//! the underlying future. A cancelled operation still runs to
//! completion and settles through [`OperationRegistry::settle`],
//! which drops its output instead of handing it back to the caller.
//! Callers therefore only ever mutate state with outputs that came
//! back `Ok` from `settle`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// Identity of one registration. Distinguishes successive
/// operations tracked under the same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

/// The operation was cancelled before it settled; its output was
/// discarded.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// A finished registered operation, on its way back to the registry.
#[derive(Debug)]
pub struct Settled<T> {
    key: String,
    id: OperationId,
    token: CancellationToken,
    output: T,
}

impl<T> Settled<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// An operation tracked by an [`OperationRegistry`]. Resolves to a
/// [`Settled`] that must be passed back to
/// [`OperationRegistry::settle`] to obtain the output.
#[must_use = "a registered operation does nothing unless polled"]
pub struct Registered<T> {
    key: String,
    id: OperationId,
    token: CancellationToken,
    operation: BoxFuture<'static, T>,
}

impl<T> Registered<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl<T> Future for Registered<T> {
    type Output = Settled<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let output = ready!(self.operation.poll_unpin(cx));
        Poll::Ready(Settled {
            key: std::mem::take(&mut self.key),
            id: self.id,
            token: self.token.clone(),
            output,
        })
    }
}

#[derive(Debug)]
struct Tracked {
    id: OperationId,
    token: CancellationToken,
}

/// Tracks at most one pending operation per key.
///
/// Owned by a single pipeline instance; dropping the registry cancels
/// everything still pending.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    pending: HashMap<String, Tracked>,
    next_id: u64,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an already-built `operation` under `key`. Operations
    /// under other keys are left alone; a pending operation under the
    /// same key is superseded and cancelled.
    pub fn register<T, F>(&mut self, key: impl Into<String>, operation: F) -> Registered<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let key = key.into();
        self.cancel(&key);
        self.track(key, operation.boxed())
    }

    /// Cancel whatever is pending under `key`, then obtain the new
    /// operation from `supplier`. The supplier never runs while a
    /// predecessor under the same key is still live.
    pub fn register_chained<T, S, F>(&mut self, key: impl Into<String>, supplier: S) -> Registered<T>
    where
        S: FnOnce() -> F,
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let key = key.into();
        self.cancel(&key);
        self.track(key, supplier().boxed())
    }

    fn track<T>(&mut self, key: String, operation: BoxFuture<'static, T>) -> Registered<T> {
        self.next_id += 1;
        let id = OperationId(self.next_id);
        let token = CancellationToken::new();
        self.pending.insert(
            key.clone(),
            Tracked {
                id,
                token: token.clone(),
            },
        );
        tracing::trace!(key, id = id.0, "registered operation");
        Registered {
            key,
            id,
            token,
            operation,
        }
    }

    /// Cancel the operation pending under `key`, if any.
    pub fn cancel(&mut self, key: &str) -> bool {
        match self.pending.remove(key) {
            Some(tracked) => {
                tracked.token.cancel();
                tracing::debug!(key, id = tracked.id.0, "cancelled operation");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending operation. Returns how many were
    /// cancelled; with nothing pending this is a no-op.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, tracked) in self.pending.drain() {
            tracked.token.cancel();
        }
        if count > 0 {
            tracing::debug!(count, "cancelled all pending operations");
        }
        count
    }

    /// Cancel every pending operation whose key satisfies
    /// `predicate`. Returns how many were cancelled.
    pub fn cancel_matching<P>(&mut self, mut predicate: P) -> usize
    where
        P: FnMut(&str) -> bool,
    {
        let mut count = 0;
        self.pending.retain(|key, tracked| {
            if predicate(key.as_str()) {
                tracked.token.cancel();
                count += 1;
                false
            } else {
                true
            }
        });
        if count > 0 {
            tracing::debug!(count, "cancelled matching operations");
        }
        count
    }

    /// Retire a finished operation. Returns its output, or
    /// [`Cancelled`] if it was cancelled at any point before this
    /// call.
    pub fn settle<T>(&mut self, settled: Settled<T>) -> Result<T, Cancelled> {
        if self
            .pending
            .get(&settled.key)
            .is_some_and(|tracked| tracked.id == settled.id)
        {
            self.pending.remove(&settled.key);
        }
        if settled.token.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(settled.output)
        }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Drop for OperationRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
