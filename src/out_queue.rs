use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::handler::RequestHandler;
use crate::message::Message;

/// Recipient of outbound delivery status.
///
/// Closed enumeration: either the request-handler state machine, or
/// nobody (fire-and-forget frames the transport produces itself).
#[derive(Clone)]
pub enum OutgoingHandler {
    Request(Arc<RequestHandler>),
    None,
}

impl OutgoingHandler {
    /// Exactly one status report fires per queued item: success once the
    /// bytes are on the wire, or the error that drained the queue.
    pub fn on_status_ready(&self, msg: &Message, status: Result<()>) {
        if let OutgoingHandler::Request(handler) = self {
            RequestHandler::on_status_ready(handler, msg, status);
        }
    }
}

/// One queued outbound frame.
pub struct OutItem {
    pub msg: Message,
    pub handler: OutgoingHandler,
    pub expires: Instant,
    /// Stateful items are bound to the session and cannot be replayed
    /// after a restart; stateless ones can.
    pub stateful: bool,
}

/// Double-ended outbound queue of one substream.
///
/// Guarded by the owning stream's mutex; the grab operations move items
/// into a caller-local queue so error reporting happens outside the lock.
#[derive(Default)]
pub struct OutQueue {
    items: VecDeque<OutItem>,
}

impl OutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, item: OutItem) {
        self.items.push_back(item);
    }

    /// Re-insert an item at the front, used when a write was interrupted
    /// and must be replayed on the next connection.
    pub fn push_front(&mut self, item: OutItem) {
        self.items.push_front(item);
    }

    pub fn pop_front(&mut self) -> Option<OutItem> {
        self.items.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn stateless_count(&self) -> usize {
        self.items.iter().filter(|i| !i.stateful).count()
    }

    /// Move everything from `other` into this queue.
    pub fn grab_items(&mut self, other: &mut OutQueue) {
        self.items.extend(other.items.drain(..));
    }

    /// Move only the session-bound items from `other` into this queue.
    pub fn grab_stateful(&mut self, other: &mut OutQueue) {
        let mut kept = VecDeque::with_capacity(other.items.len());
        for item in other.items.drain(..) {
            if item.stateful {
                self.items.push_back(item);
            } else {
                kept.push_back(item);
            }
        }
        other.items = kept;
    }

    /// Move items whose deadline has passed from `other` into this queue.
    pub fn grab_expired(&mut self, other: &mut OutQueue, now: Instant) {
        let mut kept = VecDeque::with_capacity(other.items.len());
        for item in other.items.drain(..) {
            if item.expires <= now {
                self.items.push_back(item);
            } else {
                kept.push_back(item);
            }
        }
        other.items = kept;
    }

    /// Drain the queue, delivering `status` to every handler.
    pub fn report(&mut self, status: Error) {
        for item in self.items.drain(..) {
            item.handler.on_status_ready(&item.msg, Err(status.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item(stateful: bool, expires: Instant) -> OutItem {
        OutItem {
            msg: Message::from_bytes(b"frame"),
            handler: OutgoingHandler::None,
            expires,
            stateful,
        }
    }

    #[test]
    fn test_fifo_order() {
        let far = Instant::now() + Duration::from_secs(60);
        let mut q = OutQueue::new();
        let mut a = item(false, far);
        a.msg = Message::from_bytes(b"a");
        q.push_back(a);
        let mut b = item(false, far);
        b.msg = Message::from_bytes(b"b");
        q.push_back(b);
        let mut c = item(false, far);
        c.msg = Message::from_bytes(b"c");
        q.push_front(c);

        assert_eq!(q.pop_front().unwrap().msg.as_slice(), b"c");
        assert_eq!(q.pop_front().unwrap().msg.as_slice(), b"a");
        assert_eq!(q.pop_front().unwrap().msg.as_slice(), b"b");
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn test_grab_stateful_partition() {
        let far = Instant::now() + Duration::from_secs(60);
        let mut q = OutQueue::new();
        q.push_back(item(true, far));
        q.push_back(item(false, far));
        q.push_back(item(true, far));

        let mut drained = OutQueue::new();
        drained.grab_stateful(&mut q);
        assert_eq!(drained.len(), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.stateless_count(), 1);
    }

    #[test]
    fn test_grab_expired() {
        let now = Instant::now();
        let mut q = OutQueue::new();
        q.push_back(item(false, now - Duration::from_secs(1)));
        q.push_back(item(false, now + Duration::from_secs(60)));

        let mut expired = OutQueue::new();
        expired.grab_expired(&mut q, now);
        assert_eq!(expired.len(), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_grab_items_moves_everything() {
        let far = Instant::now() + Duration::from_secs(60);
        let mut q = OutQueue::new();
        q.push_back(item(true, far));
        q.push_back(item(false, far));
        let mut target = OutQueue::new();
        target.push_back(item(false, far));
        target.grab_items(&mut q);
        assert!(q.is_empty());
        assert_eq!(target.len(), 3);
    }
}
