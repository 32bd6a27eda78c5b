use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::in_queue::{InQueue, IncomingHandler, Waiter};
use crate::message::Message;
use crate::out_queue::OutgoingHandler;
use crate::stream::Stream;
use crate::task::{Task, TaskId, TaskManager};
use crate::transport::{ChannelData, QueryResult, Transport, TransportQuery};
use crate::url::Url;

/// Channel-level notifications delivered to registered event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The control substream finished its handshake
    StreamReady,
    /// The connection was lost; stateless work is being replayed
    StreamBroken,
    /// The stream could not be recovered
    FatalError,
}

/// Receiver of channel-level events.
pub trait ChannelEventHandler: Send + Sync {
    /// Return `false` to be dropped from the handler list.
    fn on_event(&self, event: ChannelEvent, status: Option<&Error>, stream: u16) -> bool;
}

/// Registry of channel event handlers.
pub(crate) struct EventHandlerList {
    handlers: Mutex<Vec<Arc<dyn ChannelEventHandler>>>,
}

impl EventHandlerList {
    pub(crate) fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, handler: Arc<dyn ChannelEventHandler>) {
        self.handlers.lock().unwrap().push(handler);
    }

    pub(crate) fn remove(&self, handler: &Arc<dyn ChannelEventHandler>) {
        self.handlers
            .lock()
            .unwrap()
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub(crate) fn report(&self, event: ChannelEvent, status: Option<&Error>, stream: u16) {
        let handlers: Vec<Arc<dyn ChannelEventHandler>> =
            self.handlers.lock().unwrap().clone();
        let mut dropped = Vec::new();
        for handler in &handlers {
            if !handler.on_event(event, status, stream) {
                dropped.push(handler.clone());
            }
        }
        if !dropped.is_empty() {
            let mut guard = self.handlers.lock().unwrap();
            guard.retain(|h| !dropped.iter().any(|d| Arc::ptr_eq(h, d)));
        }
    }
}

/// Everything needed to talk to one endpoint: the transport state, the
/// streams, and the inbound queue correlating replies with waiters.
pub struct Channel {
    url: Arc<Url>,
    transport: Arc<dyn Transport>,
    channel_data: ChannelData,
    in_queue: Arc<InQueue>,
    streams: Vec<Arc<Stream>>,
    event_handlers: Arc<EventHandlerList>,
    task_manager: Arc<TaskManager>,
    tick_task: Mutex<Option<TaskId>>,
}

/// Periodic timeout sweep of one channel.
struct TickTask {
    channel: std::sync::Weak<Channel>,
    resolution: Duration,
}

impl Task for TickTask {
    fn run(&mut self, now: Instant) -> Option<Instant> {
        match self.channel.upgrade() {
            Some(channel) => {
                channel.tick(now);
                Some(now + self.resolution)
            }
            None => None,
        }
    }

    fn name(&self) -> &str {
        "channel-tick"
    }
}

impl Channel {
    pub(crate) fn new(
        url: Url,
        transport: Arc<dyn Transport>,
        task_manager: Arc<TaskManager>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let stream_count = config.streams_per_channel.max(1);
        debug!(
            "Creating a new channel to {} with {} stream(s)",
            url.host_id(),
            stream_count
        );

        let url = Arc::new(url);
        let channel_data = transport.initialize_channel();
        let in_queue = Arc::new(InQueue::new());
        let event_handlers = Arc::new(EventHandlerList::new());

        let streams = (0..stream_count)
            .map(|num| {
                Stream::new(
                    url.clone(),
                    num,
                    transport.clone(),
                    task_manager.clone(),
                    in_queue.clone(),
                    channel_data.clone(),
                    event_handlers.clone(),
                    config.clone(),
                )
            })
            .collect();

        let channel = Arc::new(Self {
            url,
            transport,
            channel_data,
            in_queue,
            streams,
            event_handlers,
            task_manager: task_manager.clone(),
            tick_task: Mutex::new(None),
        });

        let tick = task_manager.register(
            Box::new(TickTask {
                channel: Arc::downgrade(&channel),
                resolution: config.timeout_resolution,
            }),
            Instant::now() + config.timeout_resolution,
        );
        *channel.tick_task.lock().unwrap() = Some(tick);

        channel
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Queue a message on the stream the transport multiplexes it to.
    pub(crate) fn send(
        &self,
        msg: Message,
        handler: OutgoingHandler,
        stateful: bool,
        expires: Instant,
    ) -> Result<()> {
        let mut stream = self.transport.multiplex(&msg, &self.channel_data) as usize;
        if stream >= self.streams.len() {
            stream = 0;
        }
        self.streams[stream].send(msg, handler, stateful, expires)
    }

    /// Wait for an inbound frame matching `filter`.
    pub(crate) async fn receive(
        &self,
        filter: impl Fn(&Message) -> bool + Send + Sync + 'static,
        timeout: Duration,
    ) -> Result<Message> {
        let (waiter, rx) = Waiter::new(filter);
        self.in_queue
            .add_handler(IncomingHandler::Waiter(waiter), Instant::now() + timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // the waiter side was dropped without an answer
            Ok(Err(_)) => Err(Error::OperationExpired),
            Err(_) => Err(Error::OperationExpired),
        }
    }

    /// Install an incoming-message handler.
    pub(crate) fn receive_handler(&self, handler: IncomingHandler, expires: Instant) {
        self.in_queue.add_handler(handler, expires);
    }

    pub(crate) fn query_transport(&self, query: TransportQuery) -> Result<QueryResult> {
        self.transport.query(query, &self.channel_data)
    }

    pub fn register_event_handler(&self, handler: Arc<dyn ChannelEventHandler>) {
        self.event_handlers.add(handler);
    }

    pub fn remove_event_handler(&self, handler: &Arc<dyn ChannelEventHandler>) {
        self.event_handlers.remove(handler);
    }

    /// Session id of the control stream, for binding stateful requests.
    pub fn session_id(&self) -> u64 {
        self.streams[0].session_id()
    }

    /// Timeout sweep across the whole channel.
    fn tick(&self, now: Instant) {
        for stream in &self.streams {
            stream.tick(now);
        }
        self.in_queue.timeout_sweep(now);
        if let Ok(QueryResult::SidManager(mgr)) = self
            .transport
            .query(TransportQuery::SidManager, &self.channel_data)
        {
            mgr.sweep_timed_out(now);
        }
    }

    /// Tear the channel down at post-master shutdown.
    pub(crate) fn shutdown(&self) {
        if let Some(tick) = self.tick_task.lock().unwrap().take() {
            self.task_manager.unregister(tick);
        }
        for stream in &self.streams {
            stream.disconnect();
        }
        self.transport.finalize_channel(&self.channel_data);
    }
}
