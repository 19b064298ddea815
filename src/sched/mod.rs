//! Cooperative worker scheduler.
//!
//! Workers are OS threads, each owning a rotating scan list of enqueued
//! lanes. Tasks run as polled futures; co-primitives park the *task* by
//! registering a waker that re-enqueues its handle, never the worker
//! thread. A task never migrates between workers mid-run; a whole lane may.

mod cofuture;
mod comutex;
mod corwlock;
mod pool;
mod worker;

pub use cofuture::{CoFuture, CoWait};
pub use comutex::{CoMutex, CoMutexGuard, CoMutexLock};
pub use corwlock::{CoReadGuard, CoReadLock, CoRwLock, CoWriteGuard, CoWriteLock};
pub use pool::{SchedControl, WorkerInfo, WorkerPool, WorkerStats};

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Yield the current task back to its worker for one scheduling round.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
