use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{Error, Result};
use crate::handler::RequestHandler;
use crate::message::Message;
use crate::protocol::{self, ResponseHeader};

/// Events a stream reports to the listeners of its channel's in-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream became operational
    Ready,
    /// The stream lost its connection
    Broken,
    /// A socket-level timeout occurred
    Timeout,
    /// The stream cannot be recovered
    FatalError,
}

/// A synchronous receiver parked on the in-queue until a matching frame
/// arrives or its deadline passes.
pub struct Waiter {
    filter: Box<dyn Fn(&Message) -> bool + Send + Sync>,
    tx: Mutex<Option<oneshot::Sender<Result<Message>>>>,
}

impl Waiter {
    pub fn new(
        filter: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> (Arc<Self>, oneshot::Receiver<Result<Message>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                filter: Box::new(filter),
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn complete(&self, result: Result<Message>) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }
}

/// A listener installed on a channel's in-queue.
///
/// Closed enumeration of the message-handler kinds: the per-request state
/// machine and the synchronous waiter behind `receive`.
#[derive(Clone)]
pub enum IncomingHandler {
    Request(Arc<RequestHandler>),
    Waiter(Arc<Waiter>),
}

impl IncomingHandler {
    /// Whether this handler wants the frame. Pure predicate; no state is
    /// touched so it can run under the queue lock.
    fn filter(&self, msg: &Message) -> bool {
        match self {
            IncomingHandler::Request(handler) => handler.filter(msg),
            IncomingHandler::Waiter(waiter) => (waiter.filter)(msg),
        }
    }

    /// Whether the handler stays installed after taking this frame
    /// (partial responses and deferred-response notices keep the request
    /// handler listening).
    fn keeps_listening(&self, msg: &Message) -> bool {
        match self {
            IncomingHandler::Request(_) => keeps_listening(msg),
            IncomingHandler::Waiter(_) => false,
        }
    }

    fn process(&self, msg: Message) {
        match self {
            IncomingHandler::Request(handler) => RequestHandler::on_incoming(handler, msg),
            IncomingHandler::Waiter(waiter) => waiter.complete(Ok(msg)),
        }
    }

    fn fail(&self, error: Error) {
        match self {
            IncomingHandler::Request(handler) => RequestHandler::on_expired(handler, error),
            IncomingHandler::Waiter(waiter) => waiter.complete(Err(error)),
        }
    }

    /// Whether a stream event on `stream_num` concerns this handler.
    fn cares_about(&self, event: StreamEvent, stream_num: u16) -> bool {
        match self {
            // only the control stream carries the session
            IncomingHandler::Request(_) => event != StreamEvent::Ready && stream_num == 0,
            IncomingHandler::Waiter(_) => event != StreamEvent::Ready,
        }
    }
}

fn keeps_listening(msg: &Message) -> bool {
    let Ok(header) = ResponseHeader::decode(msg) else {
        return false;
    };
    match header.status {
        protocol::STATUS_OKSOFAR | protocol::STATUS_WAITRESP => true,
        protocol::STATUS_ATTN => protocol::embedded_response(msg)
            .map(|embedded| keeps_listening(&embedded))
            .unwrap_or(false),
        _ => false,
    }
}

/// Per-channel inbound queue, correlating wire frames with waiters.
///
/// Frames are offered to the installed handlers in insertion order; the
/// first one whose filter takes the frame processes it. Frames nobody
/// claims are held for handlers installed later. Matching runs under the
/// queue mutex, processing never does, so a handler may re-enter the
/// runtime (retry a request, install itself again) without deadlocking.
pub struct InQueue {
    inner: Mutex<InQueueInner>,
}

struct InQueueInner {
    handlers: Vec<(IncomingHandler, Instant)>,
    messages: VecDeque<Message>,
}

impl InQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(InQueueInner {
                handlers: Vec::new(),
                messages: VecDeque::new(),
            }),
        }
    }

    /// Offer a reassembled frame to the installed handlers.
    pub fn add_message(&self, msg: Message) {
        let claimed = {
            let mut inner = self.inner.lock().unwrap();
            let position = inner
                .handlers
                .iter()
                .position(|(handler, _)| handler.filter(&msg));
            match position {
                Some(idx) => {
                    if inner.handlers[idx].0.keeps_listening(&msg) {
                        Some(inner.handlers[idx].0.clone())
                    } else {
                        Some(inner.handlers.remove(idx).0)
                    }
                }
                None => {
                    trace!("No handler for frame, holding it in the queue");
                    inner.messages.push_back(msg);
                    return;
                }
            }
        };
        if let Some(handler) = claimed {
            handler.process(msg);
        }
    }

    /// Install a handler; frames already held in the queue are offered to
    /// it first, and the handler is only installed if none of them ends
    /// the exchange.
    pub fn add_handler(&self, handler: IncomingHandler, expires: Instant) {
        let mut claimed = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let mut kept = VecDeque::with_capacity(inner.messages.len());
            let mut finished = false;
            for msg in inner.messages.drain(..) {
                if !finished && handler.filter(&msg) {
                    let terminal = !handler.keeps_listening(&msg);
                    claimed.push(msg);
                    if terminal {
                        finished = true;
                    }
                } else {
                    kept.push_back(msg);
                }
            }
            inner.messages = kept;
            if !finished {
                inner.handlers.push((handler.clone(), expires));
            }
        }
        for msg in claimed {
            handler.process(msg);
        }
    }

    /// Fail and remove handlers whose deadline passed. Driven by the
    /// channel tick.
    pub fn timeout_sweep(&self, now: Instant) {
        let expired: Vec<IncomingHandler> = {
            let mut inner = self.inner.lock().unwrap();
            let mut expired = Vec::new();
            inner.handlers.retain(|(handler, expires)| {
                if *expires <= now {
                    expired.push(handler.clone());
                    false
                } else {
                    true
                }
            });
            expired
        };
        for handler in expired {
            handler.fail(Error::OperationExpired);
        }
    }

    /// Deliver a stream event to every handler that cares about it; those
    /// handlers are removed and run their own recovery.
    pub fn report_stream_event(&self, event: StreamEvent, stream_num: u16, status: Error) {
        let affected: Vec<IncomingHandler> = {
            let mut inner = self.inner.lock().unwrap();
            let mut affected = Vec::new();
            inner.handlers.retain(|(handler, _)| {
                if handler.cares_about(event, stream_num) {
                    affected.push(handler.clone());
                    false
                } else {
                    true
                }
            });
            affected
        };
        for handler in affected {
            match &handler {
                IncomingHandler::Request(request) => {
                    RequestHandler::on_stream_event(request, event, status.clone());
                }
                IncomingHandler::Waiter(waiter) => waiter.complete(Err(status.clone())),
            }
        }
    }

    pub fn handler_count(&self) -> usize {
        self.inner.lock().unwrap().handlers.len()
    }

    pub fn held_message_count(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }
}

impl Default for InQueue {
    fn default() -> Self {
        Self::new()
    }
}
