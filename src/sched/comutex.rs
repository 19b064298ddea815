//! Cooperative mutex: contention parks the task, not the worker thread.
//!
//! Acquisition is strict FIFO via tickets. A failed lock records the task's
//! waker and returns control to the worker; unlock advances the serving
//! ticket and wakes exactly one waiter. Abandoned tickets (a lock future
//! dropped before acquiring, e.g. on cancellation) are skipped so the queue
//! never wedges.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

#[derive(Default)]
struct MutexState {
    next_ticket: u64,
    serving: u64,
    waiters: VecDeque<(u64, Waker)>,
    abandoned: HashSet<u64>,
}

impl MutexState {
    /// Advance past the finished (or abandoned) ticket and wake the new
    /// holder, if it is already parked.
    fn advance(&mut self) {
        self.serving += 1;
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
        let serving = self.serving;
        if let Some(pos) = self.waiters.iter().position(|(t, _)| *t == serving) {
            let (_, waker) = self.waiters.remove(pos).unwrap();
            waker.wake();
        }
    }
}

/// A task-suspending mutex with FIFO handoff.
#[derive(Default)]
pub struct CoMutex {
    state: Mutex<MutexState>,
}

impl CoMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the mutex, parking the calling task while contended.
    pub fn lock(&self) -> CoMutexLock<'_> {
        CoMutexLock {
            mutex: self,
            ticket: None,
            acquired: false,
        }
    }

    /// Non-suspending attempt; succeeds only with no holder and no queue.
    pub fn try_lock(&self) -> Option<CoMutexGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        if state.next_ticket == state.serving {
            state.next_ticket += 1;
            Some(CoMutexGuard { mutex: self })
        } else {
            None
        }
    }
}

impl std::fmt::Debug for CoMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CoMutex")
            .field("serving", &state.serving)
            .field("queued", &(state.next_ticket - state.serving))
            .finish()
    }
}

/// Future returned by [`CoMutex::lock`].
pub struct CoMutexLock<'a> {
    mutex: &'a CoMutex,
    ticket: Option<u64>,
    acquired: bool,
}

impl<'a> Future for CoMutexLock<'a> {
    type Output = CoMutexGuard<'a>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut state = this.mutex.state.lock().unwrap();
        let ticket = *this.ticket.get_or_insert_with(|| {
            let t = state.next_ticket;
            state.next_ticket += 1;
            t
        });
        if ticket == state.serving {
            this.acquired = true;
            // Drop a stale registration from an earlier poll.
            state.waiters.retain(|(t, _)| *t != ticket);
            Poll::Ready(CoMutexGuard { mutex: this.mutex })
        } else {
            match state.waiters.iter_mut().find(|(t, _)| *t == ticket) {
                Some((_, waker)) => *waker = cx.waker().clone(),
                None => state.waiters.push_back((ticket, cx.waker().clone())),
            }
            Poll::Pending
        }
    }
}

impl Drop for CoMutexLock<'_> {
    fn drop(&mut self) {
        if self.acquired {
            return;
        }
        let Some(ticket) = self.ticket else { return };
        let mut state = self.mutex.state.lock().unwrap();
        state.waiters.retain(|(t, _)| *t != ticket);
        if ticket == state.serving {
            // We held the lock without ever observing it; pass it on.
            state.advance();
        } else {
            state.abandoned.insert(ticket);
        }
    }
}

/// RAII guard; dropping unlocks and wakes the next waiter in FIFO order.
pub struct CoMutexGuard<'a> {
    mutex: &'a CoMutex,
}

impl Drop for CoMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.state.lock().unwrap().advance();
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
    fn uncontended_lock_is_immediate() {
        let mutex = CoMutex::new();
        let mut lock = Box::pin(mutex.lock());
        assert!(matches!(poll_once(&mut lock), Poll::Ready(_)));
    }

    #[test]
    fn contended_lock_parks_then_acquires_fifo() {
        let mutex = CoMutex::new();
        let guard = mutex.try_lock().unwrap();

        let mut second = Box::pin(mutex.lock());
        let mut third = Box::pin(mutex.lock());
        assert!(poll_once(&mut second).is_pending());
        assert!(poll_once(&mut third).is_pending());

        drop(guard);
        // Strict handoff: third still waits behind second.
        assert!(poll_once(&mut third).is_pending());
        let Poll::Ready(second_guard) = poll_once(&mut second) else {
            panic!("second waiter should hold the lock");
        };
        assert!(poll_once(&mut third).is_pending());
        drop(second_guard);
        assert!(matches!(poll_once(&mut third), Poll::Ready(_)));
    }

    #[test]
    fn abandoned_waiter_does_not_wedge_the_queue() {
        let mutex = CoMutex::new();
        let guard = mutex.try_lock().unwrap();

        let mut second = Box::pin(mutex.lock());
        let mut third = Box::pin(mutex.lock());
        assert!(poll_once(&mut second).is_pending());
        assert!(poll_once(&mut third).is_pending());

        drop(second); // cancelled while queued
        drop(guard);
        assert!(matches!(poll_once(&mut third), Poll::Ready(_)));
    }

    #[test]
    fn try_lock_respects_queue() {
        let mutex = CoMutex::new();
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }
}
