//! FIFO correlation of commands with their reply frames.
//!
//! The wire protocol carries no request identifier: the switch answers
//! commands strictly in the order they were sent, so correlation is
//! positional. Each in-flight command holds a oneshot receiver; the
//! reader task resolves the oldest waiter with each reply-classified
//! frame.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::frame::Frame;

type Waiter = oneshot::Sender<Result<Frame>>;

/// Ordered queue of outstanding command waiters.
///
/// `None` marks the closed state: after teardown no further waiters can
/// be registered.
pub(crate) struct ReplyQueue {
    waiters: Mutex<Option<VecDeque<Waiter>>>,
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Some(VecDeque::new())),
        }
    }

    /// Enqueue a waiter, returning the receiver its reply will arrive on.
    /// Fails with [`Error::ConnectionClosed`] once the queue is closed.
    pub fn register(&self) -> Result<oneshot::Receiver<Result<Frame>>> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(queue) => {
                let (tx, rx) = oneshot::channel();
                queue.push_back(tx);
                Ok(rx)
            }
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Resolve the oldest waiter with `frame`. Returns `false` when no
    /// command is outstanding (an unsolicited reply-typed frame).
    pub fn resolve(&self, frame: Frame) -> bool {
        let waiter = self.lock().as_mut().and_then(|queue| queue.pop_front());
        match waiter {
            Some(tx) => {
                // A failed send means the caller stopped waiting; the
                // reply is discarded either way.
                let _ = tx.send(Ok(frame));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding waiter with `ConnectionClosed`, oldest
    /// first, and reject all future registrations.
    pub fn fail_all(&self) {
        let drained = self.lock().take();
        if let Some(queue) = drained {
            for tx in queue {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }
    }

    /// Number of commands awaiting a reply.
    pub fn pending(&self) -> usize {
        self.lock().as_ref().map_or(0, VecDeque::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<VecDeque<Waiter>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HeaderMap;

    fn reply(text: &str) -> Frame {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "command/reply");
        headers.insert("Reply-Text", text);
        Frame::new(headers, String::new())
    }

    #[tokio::test]
    async fn test_fifo_resolution_order() {
        let queue = ReplyQueue::new();
        let rx1 = queue.register().unwrap();
        let rx2 = queue.register().unwrap();
        let rx3 = queue.register().unwrap();
        assert_eq!(queue.pending(), 3);

        assert!(queue.resolve(reply("+OK first")));
        assert!(queue.resolve(reply("+OK second")));
        assert!(queue.resolve(reply("+OK third")));

        assert_eq!(rx1.await.unwrap().unwrap().reply_text(), Some("+OK first"));
        assert_eq!(rx2.await.unwrap().unwrap().reply_text(), Some("+OK second"));
        assert_eq!(rx3.await.unwrap().unwrap().reply_text(), Some("+OK third"));
    }

    #[tokio::test]
    async fn test_resolve_with_no_waiter() {
        let queue = ReplyQueue::new();
        assert!(!queue.resolve(reply("+OK")));
    }

    #[tokio::test]
    async fn test_fail_all_resumes_every_waiter_once() {
        let queue = ReplyQueue::new();
        let receivers: Vec<_> = (0..5).map(|_| queue.register().unwrap()).collect();

        queue.fail_all();
        assert_eq!(queue.pending(), 0);

        for rx in receivers {
            let result = rx.await.unwrap();
            assert!(matches!(result, Err(Error::ConnectionClosed)));
        }
    }

    #[tokio::test]
    async fn test_register_after_close_rejected() {
        let queue = ReplyQueue::new();
        queue.fail_all();
        assert!(matches!(queue.register(), Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_resolve_after_close_is_noop() {
        let queue = ReplyQueue::new();
        queue.fail_all();
        assert!(!queue.resolve(reply("+OK")));
    }
}
