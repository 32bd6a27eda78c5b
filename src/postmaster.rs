use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::channel::{Channel, ChannelEventHandler};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::in_queue::IncomingHandler;
use crate::message::Message;
use crate::out_queue::OutgoingHandler;
use crate::task::TaskManager;
use crate::transport::{QueryResult, Transport, TransportQuery, XrdTransport};
use crate::url::Url;

/// Cadence of the task-manager worker
const TASK_RESOLUTION: Duration = Duration::from_secs(1);

static INSTANCE: OnceLock<Arc<PostMaster>> = OnceLock::new();

/// The process-wide request/response engine.
///
/// Owns one channel per remote endpoint, created lazily on first use,
/// the task manager driving all timed work, and the transport plugged
/// into every channel. `send` never blocks beyond the enqueue; delivery
/// status and replies flow through the handlers.
pub struct PostMaster {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    task_manager: Arc<TaskManager>,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    running: AtomicBool,
}

impl PostMaster {
    /// A post master speaking the native transport.
    pub fn new(config: Config) -> Arc<Self> {
        let config = Arc::new(config);
        let transport: Arc<dyn Transport> = Arc::new(XrdTransport::new(config.clone()));
        Self::with_transport(config, transport)
    }

    /// A post master with a custom transport plugged in.
    pub fn with_transport(config: Arc<Config>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            task_manager: Arc::new(TaskManager::new(TASK_RESOLUTION)),
            channels: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        })
    }

    /// The lazily constructed process-wide instance, configured from the
    /// environment and started on first use.
    pub fn instance() -> Arc<PostMaster> {
        INSTANCE
            .get_or_init(|| {
                let pm = PostMaster::new(Config::from_env());
                pm.start();
                pm
            })
            .clone()
    }

    /// Bring the workers up. Must run before the first send; calling it
    /// again is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Starting the post master");
        self.task_manager.start();
    }

    /// Tear everything down. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("Stopping the post master");
        let channels: Vec<Arc<Channel>> = {
            let mut guard = self.channels.lock().unwrap();
            guard.drain().map(|(_, c)| c).collect()
        };
        for channel in channels {
            channel.shutdown();
        }
        self.task_manager.stop();
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    /// Queue `msg` for `url`. The handler hears about the write status
    /// first and the reply frames later; the call itself only enqueues.
    pub fn send(
        &self,
        url: &Url,
        msg: Message,
        handler: OutgoingHandler,
        stateful: bool,
        expires: Instant,
    ) -> Result<()> {
        self.channel(url)?.send(msg, handler, stateful, expires)
    }

    /// Wait for an inbound frame on `url`'s channel matching `filter`.
    pub async fn receive(
        &self,
        url: &Url,
        filter: impl Fn(&Message) -> bool + Send + Sync + 'static,
        timeout: Duration,
    ) -> Result<Message> {
        let channel = self.channel(url)?;
        channel.receive(filter, timeout).await
    }

    /// Install an incoming-message handler on `url`'s channel.
    pub fn receive_handler(
        &self,
        url: &Url,
        handler: IncomingHandler,
        expires: Instant,
    ) -> Result<()> {
        self.channel(url)?.receive_handler(handler, expires);
        Ok(())
    }

    /// Expose a transport attribute of `url`'s channel.
    pub fn query_transport(&self, url: &Url, query: TransportQuery) -> Result<QueryResult> {
        self.channel(url)?.query_transport(query)
    }

    pub fn register_event_handler(
        &self,
        url: &Url,
        handler: Arc<dyn ChannelEventHandler>,
    ) -> Result<()> {
        self.channel(url)?.register_event_handler(handler);
        Ok(())
    }

    pub fn remove_event_handler(
        &self,
        url: &Url,
        handler: &Arc<dyn ChannelEventHandler>,
    ) -> Result<()> {
        self.channel(url)?.remove_event_handler(handler);
        Ok(())
    }

    /// Session id of the control stream of `url`'s channel.
    pub fn session_id(&self, url: &Url) -> Result<u64> {
        Ok(self.channel(url)?.session_id())
    }

    /// The channel for an endpoint, created lazily on first use. Routing
    /// identity is `(host, port)`.
    fn channel(&self, url: &Url) -> Result<Arc<Channel>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::Uninitialized);
        }
        let mut channels = self.channels.lock().unwrap();
        let channel = channels.entry(url.host_id()).or_insert_with(|| {
            Channel::new(
                url.clone(),
                self.transport.clone(),
                self.task_manager.clone(),
                self.config.clone(),
            )
        });
        Ok(channel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let pm = PostMaster::new(Config::default());
        let url = Url::parse("root://localhost:10944/").unwrap();
        let result = pm.send(
            &url,
            Message::from_bytes(b"x"),
            OutgoingHandler::None,
            false,
            Instant::now() + Duration::from_secs(1),
        );
        assert_eq!(result, Err(Error::Uninitialized));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let pm = PostMaster::new(Config::default());
        pm.start();
        pm.stop();
        pm.stop();
    }
}
