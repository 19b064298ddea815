//! Cooperative reader-writer lock, writer-preferring.
//!
//! Readers are admitted while no writer holds or waits; once a writer
//! queues, new readers park behind it so a reader stream cannot starve the
//! writer. Releasing the last reader hands the lock to the oldest waiting
//! writer; releasing a writer prefers the next writer, else admits the
//! whole parked reader cohort.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

#[derive(Default)]
struct RwState {
    readers: usize,
    writer: bool,
    next_id: u64,
    waiting_writers: VecDeque<(u64, Waker)>,
    waiting_readers: Vec<(u64, Waker)>,
    /// Ids admitted by a release but not yet observed by their future.
    granted_writer: Option<u64>,
    granted_readers: Vec<u64>,
}

impl RwState {
    fn release_one_reader(&mut self) {
        debug_assert!(self.readers > 0);
        self.readers -= 1;
        if self.readers == 0 {
            self.wake_next();
        }
    }

    fn release_writer(&mut self) {
        debug_assert!(self.writer);
        self.writer = false;
        self.wake_next();
    }

    fn wake_next(&mut self) {
        if self.writer || self.readers > 0 {
            return;
        }
        if let Some((id, waker)) = self.waiting_writers.pop_front() {
            self.writer = true;
            self.granted_writer = Some(id);
            waker.wake();
        } else if !self.waiting_readers.is_empty() {
            for (id, waker) in self.waiting_readers.drain(..) {
                self.readers += 1;
                self.granted_readers.push(id);
                waker.wake();
            }
        }
    }
}

/// A task-suspending RwLock with writer preference.
#[derive(Default)]
pub struct CoRwLock {
    state: Mutex<RwState>,
}

impl CoRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> CoReadLock<'_> {
        CoReadLock {
            lock: self,
            id: None,
            acquired: false,
        }
    }

    pub fn write(&self) -> CoWriteLock<'_> {
        CoWriteLock {
            lock: self,
            id: None,
            acquired: false,
        }
    }
}

impl std::fmt::Debug for CoRwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CoRwLock")
            .field("readers", &state.readers)
            .field("writer", &state.writer)
            .field("waiting_writers", &state.waiting_writers.len())
            .finish()
    }
}

pub struct CoReadLock<'a> {
    lock: &'a CoRwLock,
    id: Option<u64>,
    acquired: bool,
}

impl<'a> Future for CoReadLock<'a> {
    type Output = CoReadGuard<'a>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut state = this.lock.state.lock().unwrap();
        let id = *this.id.get_or_insert_with(|| {
            let id = state.next_id;
            state.next_id += 1;
            id
        });
        if let Some(pos) = state.granted_readers.iter().position(|g| *g == id) {
            state.granted_readers.swap_remove(pos);
            this.acquired = true;
            return Poll::Ready(CoReadGuard { lock: this.lock });
        }
        // Writer preference: park behind any holder or queued writer.
        if !state.writer && state.waiting_writers.is_empty() {
            state.readers += 1;
            this.acquired = true;
            state.waiting_readers.retain(|(wid, _)| *wid != id);
            return Poll::Ready(CoReadGuard { lock: this.lock });
        }
        match state.waiting_readers.iter_mut().find(|(wid, _)| *wid == id) {
            Some((_, waker)) => *waker = cx.waker().clone(),
            None => state.waiting_readers.push((id, cx.waker().clone())),
        }
        Poll::Pending
    }
}

impl Drop for CoReadLock<'_> {
    fn drop(&mut self) {
        if self.acquired {
            return;
        }
        let Some(id) = self.id else { return };
        let mut state = self.lock.state.lock().unwrap();
        state.waiting_readers.retain(|(wid, _)| *wid != id);
        // A grant that was never observed returns its reader slot.
        if let Some(pos) = state.granted_readers.iter().position(|g| *g == id) {
            state.granted_readers.swap_remove(pos);
            state.release_one_reader();
        }
    }
}

pub struct CoWriteLock<'a> {
    lock: &'a CoRwLock,
    id: Option<u64>,
    acquired: bool,
}

impl<'a> Future for CoWriteLock<'a> {
    type Output = CoWriteGuard<'a>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut state = this.lock.state.lock().unwrap();
        let id = *this.id.get_or_insert_with(|| {
            let id = state.next_id;
            state.next_id += 1;
            id
        });
        if state.granted_writer == Some(id) {
            state.granted_writer = None;
            this.acquired = true;
            return Poll::Ready(CoWriteGuard { lock: this.lock });
        }
        if !state.writer && state.readers == 0 && state.waiting_writers.is_empty() {
            state.writer = true;
            this.acquired = true;
            return Poll::Ready(CoWriteGuard { lock: this.lock });
        }
        match state.waiting_writers.iter_mut().find(|(wid, _)| *wid == id) {
            Some((_, waker)) => *waker = cx.waker().clone(),
            None => state.waiting_writers.push_back((id, cx.waker().clone())),
        }
        Poll::Pending
    }
}

impl Drop for CoWriteLock<'_> {
    fn drop(&mut self) {
        if self.acquired {
            return;
        }
        let Some(id) = self.id else { return };
        let mut state = self.lock.state.lock().unwrap();
        state.waiting_writers.retain(|(wid, _)| *wid != id);
        if state.granted_writer == Some(id) {
            state.granted_writer = None;
            state.release_writer();
        }
    }
}

pub struct CoReadGuard<'a> {
    lock: &'a CoRwLock,
}

impl Drop for CoReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.lock().unwrap().release_one_reader();
    }
}

pub struct CoWriteGuard<'a> {
    lock: &'a CoRwLock,
}

impl Drop for CoWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.lock().unwrap().release_writer();
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
    fn readers_share() {
        let lock = CoRwLock::new();
        let mut r1 = Box::pin(lock.read());
        let mut r2 = Box::pin(lock.read());
        assert!(poll_once(&mut r1).is_ready());
        assert!(poll_once(&mut r2).is_ready());
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = CoRwLock::new();
        let mut w = Box::pin(lock.write());
        let Poll::Ready(guard) = poll_once(&mut w) else {
            panic!("writer should acquire an idle lock");
        };
        let mut r = Box::pin(lock.read());
        assert!(poll_once(&mut r).is_pending());
        drop(guard);
        assert!(poll_once(&mut r).is_ready());
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let lock = CoRwLock::new();
        let mut r1 = Box::pin(lock.read());
        let Poll::Ready(r1_guard) = poll_once(&mut r1) else {
            panic!("first reader should acquire");
        };

        let mut w = Box::pin(lock.write());
        assert!(poll_once(&mut w).is_pending());

        // New reader must park behind the queued writer.
        let mut r2 = Box::pin(lock.read());
        assert!(poll_once(&mut r2).is_pending());

        drop(r1_guard);
        let Poll::Ready(w_guard) = poll_once(&mut w) else {
            panic!("writer should be admitted after the reader cohort");
        };
        assert!(poll_once(&mut r2).is_pending());
        drop(w_guard);
        assert!(poll_once(&mut r2).is_ready());
    }

    #[test]
    fn cancelled_writer_releases_parked_readers() {
        let lock = CoRwLock::new();
        let mut r1 = Box::pin(lock.read());
        let Poll::Ready(r1_guard) = poll_once(&mut r1) else {
            panic!("first reader should acquire");
        };
        let mut w = Box::pin(lock.write());
        assert!(poll_once(&mut w).is_pending());
        let mut r2 = Box::pin(lock.read());
        assert!(poll_once(&mut r2).is_pending());

        drop(w); // cancelled while queued
        drop(r1_guard);
        assert!(poll_once(&mut r2).is_ready());
    }
}
