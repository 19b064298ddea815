//! Cooperative one-shot value: await parks the task until completion.
//!
//! Completion stores the value once and wakes each registered waiter
//! exactly once. Handles are cheap clones sharing the same cell, so a
//! producer task and any number of consumer tasks can hold it.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

struct CoCell<T> {
    value: Option<T>,
    wakers: Vec<Waker>,
}

/// A clonable, task-suspending one-shot future.
pub struct CoFuture<T> {
    cell: Arc<Mutex<CoCell<T>>>,
}

impl<T> Clone for CoFuture<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Clone> Default for CoFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> CoFuture<T> {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(Mutex::new(CoCell {
                value: None,
                wakers: Vec::new(),
            })),
        }
    }

    /// Complete with `value`. The first completion wins; later calls are
    /// ignored. Returns whether this call completed the future.
    pub fn complete(&self, value: T) -> bool {
        let wakers = {
            let mut cell = self.cell.lock().unwrap();
            if cell.value.is_some() {
                return false;
            }
            cell.value = Some(value);
            std::mem::take(&mut cell.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.cell.lock().unwrap().value.is_some()
    }

    pub fn try_get(&self) -> Option<T> {
        self.cell.lock().unwrap().value.clone()
    }

    /// Await the value; parks the calling task until `complete`.
    pub fn wait(&self) -> CoWait<T> {
        CoWait {
            cell: Arc::clone(&self.cell),
        }
    }
}

/// Future returned by [`CoFuture::wait`].
pub struct CoWait<T> {
    cell: Arc<Mutex<CoCell<T>>>,
}

impl<T: Clone> Future for CoWait<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut cell = self.cell.lock().unwrap();
        if let Some(value) = cell.value.as_ref() {
            return Poll::Ready(value.clone());
        }
        if !cell.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            cell.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn poll_once<F: Future>(fut: &mut Pin<Box<F>>) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        fut.as_mut().poll(&mut cx)
    }

    #[test]
    fn completes_once() {
        let future = CoFuture::new();
        assert!(future.complete(7u32));
        assert!(!future.complete(9));
        assert_eq!(future.try_get(), Some(7));
    }

    #[test]
    fn wait_observes_completion() {
        let future = CoFuture::new();
        let mut wait = Box::pin(future.wait());
        assert!(poll_once(&mut wait).is_pending());
        future.complete("done".to_string());
        assert_eq!(poll_once(&mut wait), Poll::Ready("done".to_string()));
    }

    #[test]
    fn clones_share_the_cell() {
        let future = CoFuture::new();
        let alias = future.clone();
        future.complete(1u8);
        assert!(alias.is_complete());
    }
}
