use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{ChannelEvent, EventHandlerList};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::in_queue::{InQueue, StreamEvent};
use crate::message::Message;
use crate::out_queue::{OutItem, OutQueue, OutgoingHandler};
use crate::socket::run_socket;
use crate::task::{Task, TaskManager};
use crate::transport::{ChannelData, PathId, QueryResult, Transport, TransportQuery};
use crate::url::Url;

/// Connection state of one substream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// One TCP connection underneath the stream, with its outbound queue and
/// the write slot holding the frame currently going out.
struct SubStream {
    status: SocketStatus,
    out_queue: OutQueue,
    write_slot: Option<OutItem>,
    uplink: Arc<Notify>,
    cancel: Option<CancellationToken>,
}

impl SubStream {
    fn new() -> Self {
        Self {
            status: SocketStatus::Disconnected,
            out_queue: OutQueue::new(),
            write_slot: None,
            uplink: Arc::new(Notify::new()),
            cancel: None,
        }
    }

    fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.status = SocketStatus::Disconnected;
    }

    fn has_pending(&self) -> bool {
        self.write_slot.is_some() || !self.out_queue.is_empty()
    }
}

struct StreamState {
    substreams: Vec<SubStream>,
    last_stream_error: Option<Instant>,
    connection_count: u32,
    connection_init_time: Option<Instant>,
    session_id: u64,
    addresses: Vec<SocketAddr>,
    last_activity: Instant,
}

/// Per-endpoint connection orchestrator.
///
/// Owns the substreams, drives connection establishment with the
/// window/retry policy, multiplexes outbound traffic across substreams
/// and recovers from their failures. The state mutex is held briefly and
/// never across I/O; everything that may re-enter the runtime (status
/// reports, queue events) happens after it is released.
pub struct Stream {
    me: Weak<Stream>,
    url: Arc<Url>,
    stream_num: u16,
    name: String,
    transport: Arc<dyn Transport>,
    task_manager: Arc<TaskManager>,
    in_queue: Arc<InQueue>,
    channel_data: ChannelData,
    event_handlers: Arc<EventHandlerList>,
    config: Arc<Config>,
    state: Mutex<StreamState>,
}

/// Reconnection back-off: re-enables the link when the connection window
/// of a failed cycle has run out.
struct StreamConnectorTask {
    stream: Arc<Stream>,
}

impl Task for StreamConnectorTask {
    fn run(&mut self, _now: Instant) -> Option<Instant> {
        self.stream.force_connect();
        None
    }

    fn name(&self) -> &str {
        "stream-connector"
    }
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        url: Arc<Url>,
        stream_num: u16,
        transport: Arc<dyn Transport>,
        task_manager: Arc<TaskManager>,
        in_queue: Arc<InQueue>,
        channel_data: ChannelData,
        event_handlers: Arc<EventHandlerList>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let name = format!("{} #{}", url.host_id(), stream_num);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            url,
            stream_num,
            name,
            transport,
            task_manager,
            in_queue,
            channel_data,
            event_handlers,
            config,
            state: Mutex::new(StreamState {
                substreams: vec![SubStream::new()],
                last_stream_error: None,
                connection_count: 0,
                connection_init_time: None,
                session_id: 0,
                addresses: Vec::new(),
                last_activity: Instant::now(),
            }),
        })
    }

    fn arc(&self) -> Arc<Stream> {
        // only called from running methods, so the strong count is > 0
        self.me.upgrade().expect("stream already dropped")
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Current session id; bumped on every reconnection of substream 0.
    pub fn session_id(&self) -> u64 {
        self.state.lock().unwrap().session_id
    }

    /// Queue a message for sending.
    pub(crate) fn send(
        &self,
        mut msg: Message,
        handler: OutgoingHandler,
        stateful: bool,
        expires: Instant,
    ) -> Result<()> {
        let notify = {
            let mut state = self.state.lock().unwrap();

            // a stale session binding is rejected before any wire traffic
            if msg.session_id() != 0
                && (state.substreams[0].status != SocketStatus::Connected
                    || state.session_id != msg.session_id())
            {
                return Err(Error::InvalidSession);
            }

            let mut path = self
                .transport
                .multiplex_substream(&mut msg, &self.channel_data, None);
            if path.up as usize >= state.substreams.len() {
                warn!(
                    "[{}] Substream {} does not exist, sending through 0 instead",
                    self.name, path.up
                );
                path.up = 0;
            }
            if path.down as usize >= state.substreams.len() {
                path.down = 0;
            }

            self.enable_link(&mut state, &mut path)?;
            self.transport
                .multiplex_substream(&mut msg, &self.channel_data, Some(&path));

            trace!(
                "[{}] Sending message through substream {} expecting answer at {}",
                self.name,
                path.up,
                path.down
            );

            let substream = &mut state.substreams[path.up as usize];
            substream.out_queue.push_back(OutItem {
                msg,
                handler,
                expires,
                stateful,
            });
            (substream.status == SocketStatus::Connected).then(|| substream.uplink.clone())
        };

        if let Some(notify) = notify {
            notify.notify_one();
        }
        Ok(())
    }

    /// Make sure a path through the stream exists: fall back to substream
    /// 0 where the requested path is not connected, and initiate the
    /// connection cycle when the control substream is down.
    fn enable_link(&self, state: &mut StreamState, path: &mut PathId) -> Result<()> {
        match state.substreams[0].status {
            // the main substream connection is in progress; it will bring
            // the others up when it completes
            SocketStatus::Connecting => Ok(()),

            SocketStatus::Connected => {
                if state.substreams[path.down as usize].status != SocketStatus::Connected {
                    path.down = 0;
                }
                if state.substreams[path.up as usize].status != SocketStatus::Connected {
                    path.up = 0;
                }
                Ok(())
            }

            SocketStatus::Disconnected => {
                let now = Instant::now();
                if let Some(last) = state.last_stream_error {
                    if now.duration_since(last) < self.config.stream_error_window {
                        return Err(Error::ConnectionError);
                    }
                }
                state.connection_init_time = Some(now);
                state.connection_count += 1;
                state.substreams[0].status = SocketStatus::Connecting;
                path.up = 0;
                path.down = 0;

                let stream = self.arc();
                tokio::spawn(async move {
                    stream.resolve_and_connect().await;
                });
                Ok(())
            }
        }
    }

    /// Resolve the endpoint and start connecting to the first address.
    async fn resolve_and_connect(self: Arc<Self>) {
        let target = format!("{}:{}", self.url.host(), self.url.port());
        let addresses: Vec<SocketAddr> = match tokio::net::lookup_host(target.clone()).await {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                error!("[{}] Unable to resolve the host address: {}", self.name, e);
                let state = self.state.lock().unwrap();
                self.on_fatal_error(state, Error::InvalidAddress(target));
                return;
            }
        };
        if addresses.is_empty() {
            let state = self.state.lock().unwrap();
            self.on_fatal_error(state, Error::InvalidAddress(target));
            return;
        }
        debug!(
            "[{}] Resolved {} address(es) for the endpoint",
            self.name,
            addresses.len()
        );

        let (addr, window) = {
            let mut state = self.state.lock().unwrap();
            state.addresses = addresses;
            let addr = state.addresses.remove(0);
            let window = self.remaining_window(&state);
            (addr, window)
        };
        self.attempt_connect(0, addr, window).await;
    }

    /// What is left of the connection window of the current cycle.
    fn remaining_window(&self, state: &StreamState) -> Duration {
        let init = state.connection_init_time.unwrap_or_else(Instant::now);
        self.config
            .connection_window
            .saturating_sub(init.elapsed())
            .max(Duration::from_millis(10))
    }

    /// Connect one substream and run the transport handshake on it.
    async fn attempt_connect(self: Arc<Self>, substream: u16, addr: SocketAddr, window: Duration) {
        debug!(
            "[{}] Attempting connection to {} on substream {}",
            self.name, addr, substream
        );
        let connect = tokio::time::timeout(window, tokio::net::TcpStream::connect(addr)).await;
        let mut socket = match connect {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                self.on_connect_error(substream, Error::SocketError(e.to_string()));
                return;
            }
            Err(_) => {
                self.on_connect_error(substream, Error::SocketTimeout);
                return;
            }
        };

        let handshake = self
            .transport
            .hand_shake(
                &mut socket,
                &self.url,
                substream,
                &self.channel_data,
                self.config.request_timeout,
            )
            .await;
        match handshake {
            Ok(()) => self.on_connect(substream, socket),
            Err(e) => self.on_connect_error(substream, e),
        }
    }

    /// A substream finished its handshake and is operational.
    fn on_connect(&self, substream: u16, socket: tokio::net::TcpStream) {
        let peer = socket.peer_addr().ok();
        let (uplink, cancel, peripherals) = {
            let mut state = self.state.lock().unwrap();
            let cancel = CancellationToken::new();
            {
                let sub = &mut state.substreams[substream as usize];
                sub.status = SocketStatus::Connected;
                sub.cancel = Some(cancel.clone());
            }
            state.last_activity = Instant::now();

            let mut peripherals = Vec::new();
            if substream == 0 {
                state.last_stream_error = None;
                state.connection_count = 0;
                state.session_id += 1;

                // late replies from the dead session can no longer arrive
                if let Ok(QueryResult::SidManager(mgr)) = self
                    .transport
                    .query(TransportQuery::SidManager, &self.channel_data)
                {
                    mgr.release_all_timed_out();
                }

                let wanted = self.transport.sub_stream_number(&self.channel_data);
                while state.substreams.len() < wanted as usize {
                    state.substreams.push(SubStream::new());
                }
                for idx in 1..state.substreams.len() {
                    if state.substreams[idx].status == SocketStatus::Disconnected {
                        state.substreams[idx].status = SocketStatus::Connecting;
                        peripherals.push(idx as u16);
                    }
                }
            }
            (
                state.substreams[substream as usize].uplink.clone(),
                cancel,
                peripherals,
            )
        };

        debug!("[{}] Substream {} connected", self.name, substream);
        tokio::spawn(run_socket(
            self.arc(),
            substream,
            socket,
            uplink.clone(),
            cancel,
        ));
        // flush whatever was queued while the connection was coming up
        uplink.notify_one();

        if substream == 0 {
            self.event_handlers
                .report(ChannelEvent::StreamReady, None, self.stream_num);
            if let Some(peer) = peer {
                if !peripherals.is_empty() {
                    debug!(
                        "[{}] Attempting to connect {} additional substream(s)",
                        self.name,
                        peripherals.len()
                    );
                }
                for idx in peripherals {
                    let stream = self.arc();
                    let window = self.config.connection_window;
                    tokio::spawn(async move {
                        stream.attempt_connect(idx, peer, window).await;
                    });
                }
            }
        }
    }

    /// A connection attempt failed before the substream became
    /// operational.
    fn on_connect_error(&self, substream: u16, err: Error) {
        debug!(
            "[{}] Connection on substream {} failed: {}",
            self.name, substream, err
        );
        let mut state = self.state.lock().unwrap();

        // a peripheral that cannot come up hands its work to substream 0
        if substream > 0 {
            state.substreams[substream as usize].close();
            let mut orphaned = OutQueue::new();
            orphaned.grab_items(&mut state.substreams[substream as usize].out_queue);
            state.substreams[0].out_queue.grab_items(&mut orphaned);
            match state.substreams[0].status {
                SocketStatus::Connected => {
                    let notify = state.substreams[0].uplink.clone();
                    drop(state);
                    notify.notify_one();
                }
                SocketStatus::Connecting => {}
                SocketStatus::Disconnected => self.on_fatal_error(state, err),
            }
            return;
        }

        let now = Instant::now();
        let init = state.connection_init_time.unwrap_or(now);
        let elapsed = now.duration_since(init);

        if elapsed < self.config.connection_window {
            // more addresses to try within this window
            if !state.addresses.is_empty() {
                let addr = state.addresses.remove(0);
                let window = self.remaining_window(&state);
                drop(state);
                let stream = self.arc();
                tokio::spawn(async move {
                    stream.attempt_connect(0, addr, window).await;
                });
                return;
            }

            // sleep out the rest of the window, then go again
            if state.connection_count < self.config.connection_retry {
                let backoff = self.config.connection_window.saturating_sub(elapsed);
                info!(
                    "[{}] Attempting reconnection in {} seconds",
                    self.name,
                    backoff.as_secs()
                );
                self.task_manager.register(
                    Box::new(StreamConnectorTask { stream: self.arc() }),
                    init + self.config.connection_window,
                );
                return;
            }

            self.on_fatal_error(state, Error::ConnectionError);
            return;
        }

        // out of the window: re-resolve and retry if attempts remain
        if state.connection_count < self.config.connection_retry {
            state.addresses.clear();
            state.substreams[0].status = SocketStatus::Disconnected;
            let mut path = PathId::new(0, 0);
            if let Err(e) = self.enable_link(&mut state, &mut path) {
                self.on_fatal_error(state, e);
            }
            return;
        }

        self.on_fatal_error(state, Error::ConnectionError);
    }

    /// Drop the connection state and run a fresh link-enable cycle.
    pub(crate) fn force_connect(&self) {
        let mut state = self.state.lock().unwrap();
        state.substreams[0].status = SocketStatus::Disconnected;
        let mut path = PathId::new(0, 0);
        if let Err(e) = self.enable_link(&mut state, &mut path) {
            self.on_fatal_error(state, e);
        }
    }

    /// An established substream failed.
    pub(crate) fn on_error(&self, substream: u16, err: Error) {
        let mut state = self.state.lock().unwrap();
        debug!(
            "[{}] Recovering error on substream {}: {}",
            self.name, substream, err
        );

        {
            let sub = &mut state.substreams[substream as usize];
            sub.close();
            // the interrupted frame goes back first in line
            if let Some(slot) = sub.write_slot.take() {
                sub.out_queue.push_front(slot);
            }
        }

        if substream > 0 {
            if state.substreams[substream as usize].out_queue.is_empty() {
                return;
            }
            if state.substreams[0].status != SocketStatus::Disconnected {
                let mut orphaned = OutQueue::new();
                orphaned.grab_items(&mut state.substreams[substream as usize].out_queue);
                state.substreams[0].out_queue.grab_items(&mut orphaned);
                if state.substreams[0].status == SocketStatus::Connected {
                    let notify = state.substreams[0].uplink.clone();
                    drop(state);
                    notify.notify_one();
                }
                return;
            }
            self.on_fatal_error(state, err);
            return;
        }

        // substream 0 went down: the session is gone. Reconnect only if
        // replayable work remains.
        let stateless: usize = state
            .substreams
            .iter()
            .map(|s| s.out_queue.stateless_count())
            .sum();
        if stateless > 0 {
            let mut path = PathId::new(0, 0);
            if let Err(e) = self.enable_link(&mut state, &mut path) {
                self.on_fatal_error(state, e);
                return;
            }
        }

        let mut drained = OutQueue::new();
        for sub in &mut state.substreams {
            drained.grab_stateful(&mut sub.out_queue);
        }
        drop(state);

        debug!(
            "[{}] Reporting disconnection to queued message handlers",
            self.name
        );
        drained.report(err.clone());
        self.in_queue
            .report_stream_event(StreamEvent::Broken, self.stream_num, err.clone());
        self.event_handlers
            .report(ChannelEvent::StreamBroken, Some(&err), self.stream_num);
    }

    /// No recovery is possible: drain everything and arm the fail-fast
    /// window.
    fn on_fatal_error(&self, mut state: MutexGuard<'_, StreamState>, err: Error) {
        state.connection_count = 0;
        state.last_stream_error = Some(Instant::now());

        let mut drained = OutQueue::new();
        for sub in &mut state.substreams {
            sub.close();
            if let Some(slot) = sub.write_slot.take() {
                sub.out_queue.push_front(slot);
            }
            drained.grab_items(&mut sub.out_queue);
        }
        drop(state);

        error!("[{}] Unable to recover: {}", self.name, err);
        drained.report(err.clone());
        self.in_queue
            .report_stream_event(StreamEvent::FatalError, self.stream_num, err.clone());
        self.event_handlers
            .report(ChannelEvent::FatalError, Some(&err), self.stream_num);
    }

    /// A frame has been reassembled on `substream`.
    pub(crate) fn on_incoming(&self, _substream: u16, mut msg: Message) {
        let session = {
            let mut state = self.state.lock().unwrap();
            state.last_activity = Instant::now();
            state.session_id
        };
        msg.set_session_id(session);
        if self.transport.highjack(&msg, &self.channel_data) {
            trace!("[{}] Message hijacked by the transport", self.name);
            return;
        }
        self.in_queue.add_message(msg);
    }

    /// Hand the next outbound frame to the socket driver. Returns `None`
    /// when there is nothing to write.
    pub(crate) fn pop_write(&self, substream: u16) -> Option<Bytes> {
        let mut state = self.state.lock().unwrap();
        let sub = &mut state.substreams[substream as usize];
        if sub.write_slot.is_none() {
            sub.write_slot = sub.out_queue.pop_front();
        }
        sub.write_slot.as_ref().map(|item| item.msg.to_bytes())
    }

    /// The frame in the write slot is fully on the wire.
    pub(crate) fn on_message_sent(&self, substream: u16) {
        let item = {
            let mut state = self.state.lock().unwrap();
            state.last_activity = Instant::now();
            state.substreams[substream as usize].write_slot.take()
        };
        if let Some(item) = item {
            trace!("[{}] Message successfully sent", self.name);
            item.handler.on_status_ready(&item.msg, Ok(()));
        }
    }

    /// Periodic sweep: expire queued outbound items and tear down idle
    /// connections past their TTL.
    pub(crate) fn tick(&self, now: Instant) {
        // queried before taking the stream mutex: the in-queue lock is
        // taken while handlers re-enter the stream, never the reverse
        let pending_handlers = self.in_queue.handler_count();

        let (mut drained, torn_down) = {
            let mut state = self.state.lock().unwrap();
            let mut drained = OutQueue::new();
            for sub in &mut state.substreams {
                drained.grab_expired(&mut sub.out_queue, now);
            }

            let busy = state.substreams.iter().any(|s| s.has_pending());
            let idle = now.duration_since(state.last_activity);
            let torn_down = state.substreams[0].status == SocketStatus::Connected
                && !busy
                && pending_handlers == 0
                && self
                    .transport
                    .is_stream_ttl_elapsed(idle, &self.channel_data);
            if torn_down {
                for (idx, sub) in state.substreams.iter_mut().enumerate() {
                    sub.close();
                    self.transport
                        .disconnect(&self.channel_data, self.stream_num, idx as u16);
                }
            }
            (drained, torn_down)
        };

        if torn_down {
            debug!(
                "[{}] Connection was idle for too long, tearing it down",
                self.name
            );
        }
        drained.report(Error::SocketTimeout);
    }

    /// Shut the stream down for good.
    pub(crate) fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        for sub in &mut state.substreams {
            sub.close();
        }
    }
}
