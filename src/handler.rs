//! The per-request state machine.
//!
//! One handler exists per in-flight request. It follows redirects across
//! the manager hierarchy, retries recoverable failures at the remembered
//! load balancer or the current endpoint, honours `wait`/`waitresp`
//! server pushes, glues partial responses together, and notifies the
//! caller exactly once before it goes away.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::in_queue::{IncomingHandler, StreamEvent};
use crate::message::Message;
use crate::out_queue::OutgoingHandler;
use crate::postmaster::PostMaster;
use crate::protocol::{self, Request, ResponseHeader};
use crate::response::{self, RedirectInfo, Response};
use crate::sid::SidManager;
use crate::task::Task;
use crate::transport::TransportQuery;
use crate::url::{self, Url};

/// Called exactly once with the outcome of the request and the list of
/// hosts that took part in serving it.
pub type ResponseCallback = Box<dyn FnOnce(Result<Response>, Vec<HostInfo>) + Send>;

/// One endpoint involved in serving a request.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub url: Url,
    /// Server flags reported by the transport once a reply came back
    pub flags: u32,
    /// Protocol version reported by the transport
    pub protocol: u32,
    /// Whether this host was captured as the load balancer
    pub load_balancer: bool,
}

impl HostInfo {
    fn new(url: Url) -> Self {
        Self {
            url,
            flags: 0,
            protocol: 0,
            load_balancer: false,
        }
    }
}

/// Per-request knobs.
#[derive(Clone, Default)]
pub struct SendOptions {
    /// Deadline for the whole exchange; zero means the configured
    /// request timeout
    pub timeout: Duration,
    /// Stateful requests cannot be replayed over a restarted session
    pub stateful: bool,
    /// Session the message is bound to; zero for session-free requests
    pub session_id: u64,
    /// Hand a redirect back to the caller instead of following it
    pub redirect_as_answer: bool,
    /// `(offset, length)` list of a read or vector read, used to validate
    /// the reply
    pub expected_chunks: Option<Vec<(u64, u32)>>,
}

struct HandlerState {
    request: Request,
    url: Url,
    sid_mgr: Arc<SidManager>,
    expiration: Instant,
    redirects_left: u16,
    redirect_as_answer: bool,
    session_id: u64,
    stateful: bool,
    load_balancer: Option<HostInfo>,
    hosts: Vec<HostInfo>,
    partials: Vec<Message>,
    expected_chunks: Option<Vec<(u64, u32)>>,
    callback: Option<ResponseCallback>,
}

/// State machine of one in-flight request.
///
/// Owned by the in-queue of whichever channel the request currently
/// points at; internal state is guarded by its own mutex, which is never
/// held while re-entering a stream or queue.
pub struct RequestHandler {
    post_master: Arc<PostMaster>,
    state: Mutex<HandlerState>,
}

/// Re-sends the request once the server-mandated wait elapsed.
struct WaitTask {
    handler: Arc<RequestHandler>,
}

impl Task for WaitTask {
    fn run(&mut self, _now: Instant) -> Option<Instant> {
        RequestHandler::wait_done(&self.handler);
        None
    }

    fn name(&self) -> &str {
        "wait-resend"
    }
}

/// Lease a stream id, wire up a request handler and queue the request.
///
/// The callback fires exactly once if and only if this returns `Ok`; a
/// synchronous failure leaves nothing behind.
pub fn send_request(
    post_master: &Arc<PostMaster>,
    url: &Url,
    mut request: Request,
    options: SendOptions,
    callback: impl FnOnce(Result<Response>, Vec<HostInfo>) + Send + 'static,
) -> Result<()> {
    let sid_mgr = post_master
        .query_transport(url, TransportQuery::SidManager)?
        .sid_manager()?;
    let sid = sid_mgr.allocate()?;
    request.sid = sid;

    let timeout = if options.timeout.is_zero() {
        post_master.config().request_timeout
    } else {
        options.timeout
    };
    let expiration = Instant::now() + timeout;

    let handler = Arc::new(RequestHandler {
        post_master: post_master.clone(),
        state: Mutex::new(HandlerState {
            request: request.clone(),
            url: url.clone(),
            sid_mgr: sid_mgr.clone(),
            expiration,
            redirects_left: post_master.config().max_redirects,
            redirect_as_answer: options.redirect_as_answer,
            session_id: options.session_id,
            stateful: options.stateful,
            load_balancer: None,
            hosts: vec![HostInfo::new(url.clone())],
            partials: Vec::new(),
            expected_chunks: options.expected_chunks,
            callback: Some(Box::new(callback)),
        }),
    });

    let mut msg = request.marshal();
    msg.set_session_id(options.session_id);
    match post_master.send(
        url,
        msg,
        OutgoingHandler::Request(handler),
        options.stateful,
        expiration,
    ) {
        Ok(()) => Ok(()),
        Err(e) => {
            sid_mgr.release(sid);
            Err(e)
        }
    }
}

impl RequestHandler {
    /// Whether an inbound frame belongs to this handler: the stream id
    /// must match, unwrapping async pushes to the embedded frame.
    pub(crate) fn filter(&self, msg: &Message) -> bool {
        let sid = self.state.lock().unwrap().request.sid;
        let Ok(header) = ResponseHeader::decode(msg) else {
            return false;
        };
        if header.status == protocol::STATUS_ATTN {
            if protocol::attn_action(msg) != Some(protocol::ATTN_ASYNRESP) {
                return false;
            }
            return match protocol::embedded_response(msg) {
                Ok(embedded) => protocol::message_sid(&embedded) == sid,
                Err(_) => false,
            };
        }
        header.sid == sid
    }

    /// Decode the status of a matched frame and take the transition.
    pub(crate) fn on_incoming(this: &Arc<Self>, msg: Message) {
        let Ok(header) = ResponseHeader::decode(&msg) else {
            this.finalize(Err(Error::InvalidMessage("undecodable response header".into())));
            return;
        };

        // an async push carries the real response at offset 16
        if header.status == protocol::STATUS_ATTN {
            trace!("Got an async response, processing the embedded frame");
            match protocol::embedded_response(&msg) {
                Ok(embedded) => Self::on_incoming(this, embedded),
                Err(e) => this.finalize(Err(e)),
            }
            return;
        }

        this.refresh_host_attributes();

        match header.status {
            protocol::STATUS_OK => {
                trace!("Got a final response, parsing it");
                this.surface_frame(msg);
            }

            protocol::STATUS_ERROR => {
                let body = protocol::message_body(&msg);
                if body.len() < 4 {
                    this.finalize(Err(Error::InvalidMessage(
                        "error response without an error number".into(),
                    )));
                    return;
                }
                let errno = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let message = String::from_utf8_lossy(&body[4..])
                    .trim_end_matches('\0')
                    .to_string();
                debug!("Got an error response [{}]: {}", errno, message);
                Self::handle_error(this, Error::ErrorResponse { errno, message });
            }

            protocol::STATUS_REDIRECT => Self::on_redirect(this, &msg),

            protocol::STATUS_WAIT => {
                let body = protocol::message_body(&msg);
                if body.len() < 4 {
                    this.finalize(Err(Error::InvalidMessage(
                        "wait response without a duration".into(),
                    )));
                    return;
                }
                let seconds = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                debug!(
                    "Server asks us to wait {} seconds: {}",
                    seconds,
                    String::from_utf8_lossy(&body[4..]).trim_end_matches('\0')
                );
                // a re-issued open/locate must not bypass the location
                // cache again
                this.state.lock().unwrap().request.set_refresh(false);
                this.post_master.task_manager().register(
                    Box::new(WaitTask {
                        handler: this.clone(),
                    }),
                    Instant::now() + Duration::from_secs(seconds as u64),
                );
            }

            protocol::STATUS_WAITRESP => {
                // the answer will come as an unsolicited push; stay
                // installed and keep the original deadline
                let body = protocol::message_body(&msg);
                let seconds = if body.len() >= 4 {
                    u32::from_be_bytes([body[0], body[1], body[2], body[3]])
                } else {
                    0
                };
                debug!("Response deferred by the server for {} seconds", seconds);
            }

            protocol::STATUS_OKSOFAR => {
                trace!("Got a partial response, waiting for more");
                this.state.lock().unwrap().partials.push(msg);
            }

            other => {
                debug!("Got an unrecognized response status {}", other);
                this.finalize(Err(Error::InvalidResponse(format!(
                    "unrecognized response status {}",
                    other
                ))));
            }
        }
    }

    fn on_redirect(this: &Arc<Self>, msg: &Message) {
        let body = protocol::message_body(msg);
        if body.len() < 4 {
            this.finalize(Err(Error::InvalidMessage(
                "redirect response without a target".into(),
            )));
            return;
        }
        let port = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let target = String::from_utf8_lossy(&body[4..])
            .trim_end_matches('\0')
            .to_string();

        let redirect_as_answer;
        {
            let mut state = this.state.lock().unwrap();
            debug!(
                "[{}] Redirected to {}:{}",
                state.url.host_id(),
                target,
                port
            );

            if state.redirects_left == 0 {
                drop(state);
                debug!("Redirect limit has been reached");
                this.finalize(Err(Error::RedirectLimit));
                return;
            }
            state.redirects_left -= 1;

            // A meta manager supersedes any previously captured load
            // balancer; a plain manager is only captured when none is
            // set yet.
            let flags = state.hosts.last().map(|h| h.flags).unwrap_or(0);
            if flags & protocol::FLAG_IS_MANAGER != 0
                && (flags & protocol::FLAG_ATTR_META != 0 || state.load_balancer.is_none())
            {
                for host in state.hosts.iter_mut() {
                    host.load_balancer = false;
                }
                if let Some(last) = state.hosts.last_mut() {
                    last.load_balancer = true;
                    debug!(
                        "[{}] Current server has been assigned as the load balancer",
                        last.url.host_id()
                    );
                }
                state.load_balancer = state.hosts.last().cloned();
            }
            redirect_as_answer = state.redirect_as_answer;
        }

        let (host_part, cgi) = match target.split_once('?') {
            Some((host, cgi)) => (host.to_string(), cgi.to_string()),
            None => (target.clone(), String::new()),
        };

        if port > u16::MAX as u32 {
            this.finalize(Err(Error::InvalidRedirectUrl(target)));
            return;
        }
        let new_url = match Url::from_host_port(&host_part, port as u16) {
            Ok(url) => url,
            Err(_) => {
                error!("Got an invalid redirection target: {}", target);
                this.finalize(Err(Error::InvalidRedirectUrl(target)));
                return;
            }
        };

        if redirect_as_answer {
            this.finalize(Ok(Response::Redirect(RedirectInfo {
                host: host_part,
                port: port as u16,
                cgi,
            })));
            return;
        }

        if let Err(e) = this.rewrite_for_redirect(&new_url, &cgi) {
            this.finalize(Err(e));
            return;
        }
        Self::retry_at(this, new_url);
    }

    /// Rewrite the request for a new endpoint: hand the old stream id
    /// back, lease one from the target's sid-manager, and append the
    /// redirect CGI.
    fn rewrite_for_redirect(&self, new_url: &Url, cgi: &str) -> Result<()> {
        let (old_sid, old_mgr) = {
            let state = self.state.lock().unwrap();
            (state.request.sid, state.sid_mgr.clone())
        };
        old_mgr.release(old_sid);

        let new_mgr = self
            .post_master
            .query_transport(new_url, TransportQuery::SidManager)?
            .sid_manager()?;
        let new_sid = new_mgr.allocate()?;

        let mut state = self.state.lock().unwrap();
        state.sid_mgr = new_mgr;
        state.request.sid = new_sid;
        let params = url::parse_params(cgi);
        if !params.is_empty() {
            state.request.append_cgi(&params);
        }
        Ok(())
    }

    /// Outcome of the write: listen for the answer, or recover.
    pub(crate) fn on_status_ready(this: &Arc<Self>, _msg: &Message, status: Result<()>) {
        match status {
            Ok(()) => {
                let (url, expiration) = {
                    let state = this.state.lock().unwrap();
                    (state.url.clone(), state.expiration)
                };
                trace!("[{}] Message successfully sent, listening", url.host_id());
                if let Err(e) = this.post_master.receive_handler(
                    &url,
                    IncomingHandler::Request(this.clone()),
                    expiration,
                ) {
                    Self::handle_error(this, e);
                }
            }
            Err(e) => {
                error!("Impossible to send the message, trying to recover: {}", e);
                Self::handle_error(this, e);
            }
        }
    }

    /// The in-queue deadline sweep expired this handler.
    pub(crate) fn on_expired(this: &Arc<Self>, err: Error) {
        Self::handle_error(this, err);
    }

    /// A stream event was routed to this handler (control stream only;
    /// the in-queue already filtered out peripheral and ready events).
    pub(crate) fn on_stream_event(this: &Arc<Self>, event: StreamEvent, status: Error) {
        debug!("Stream event {:?} reported for an in-flight request", event);
        Self::handle_error(this, status);
    }

    /// The server-mandated wait elapsed; try again where we were.
    fn wait_done(this: &Arc<Self>) {
        let url = this.state.lock().unwrap().url.clone();
        Self::retry_at(this, url);
    }

    /// The recovery ladder.
    ///
    /// Server errors in the recoverable set go back to the load balancer
    /// once. Anything after the deadline, after a session restart on a
    /// stateful request, or classified fatal is surfaced; the rest is
    /// retried, at the load balancer if one is known, at the current
    /// endpoint otherwise.
    fn handle_error(this: &Arc<Self>, err: Error) {
        debug!("Handling error while processing a request: {}", err);

        if let Error::ErrorResponse { errno, .. } = &err {
            let errno = *errno;
            let balancer = {
                let state = this.state.lock().unwrap();
                match &state.load_balancer {
                    Some(lb) if lb.url.host_id() != state.url.host_id() => Some(lb.url.clone()),
                    _ => None,
                }
            };
            match balancer {
                Some(balancer) if err.is_recoverable_at_balancer() => {
                    {
                        let mut state = this.state.lock().unwrap();
                        let tried = state.url.host().to_string();
                        state
                            .request
                            .append_cgi(&[("tried".to_string(), tried)]);
                        if errno == protocol::ERR_NOT_FOUND {
                            state.request.set_refresh(true);
                        }
                    }
                    Self::retry_at(this, balancer);
                }
                _ => this.finalize(Err(err)),
            }
            return;
        }

        let (expired, session_bound, balancer, current) = {
            let state = this.state.lock().unwrap();
            (
                Instant::now() >= state.expiration,
                state.session_id != 0,
                state.load_balancer.clone(),
                state.url.clone(),
            )
        };

        // nothing can be done once the deadline passed or the session a
        // stateful request was bound to is gone
        if err == Error::OperationExpired || session_bound || expired {
            error!("Unable to get the response: {}", err);
            this.finalize(Err(err));
            return;
        }

        if let Some(balancer) = balancer {
            if balancer.url.host_id() != current.host_id() {
                {
                    let mut state = this.state.lock().unwrap();
                    let tried = state.url.host().to_string();
                    state.request.append_cgi(&[("tried".to_string(), tried)]);
                }
                Self::retry_at(this, balancer.url);
                return;
            }
        }

        if !err.is_fatal() {
            Self::retry_at(this, current);
            return;
        }

        this.finalize(Err(err));
    }

    /// Re-issue the request at `url`.
    fn retry_at(this: &Arc<Self>, url: Url) {
        let (msg, stateful, expiration) = {
            let mut state = this.state.lock().unwrap();
            state.url = url.clone();
            state.hosts.push(HostInfo::new(url.clone()));
            let mut msg = state.request.marshal();
            msg.set_session_id(state.session_id);
            (msg, state.stateful, state.expiration)
        };
        if let Err(e) = this.post_master.send(
            &url,
            msg,
            OutgoingHandler::Request(this.clone()),
            stateful,
            expiration,
        ) {
            Self::handle_error(this, e);
        }
    }

    /// Ask the transport about the server we just heard from.
    fn refresh_host_attributes(&self) {
        let url = self.state.lock().unwrap().url.clone();
        let flags = self
            .post_master
            .query_transport(&url, TransportQuery::ServerFlags)
            .ok()
            .and_then(|r| r.server_flags().ok());
        let version = self
            .post_master
            .query_transport(&url, TransportQuery::ProtocolVersion)
            .ok()
            .and_then(|r| r.protocol_version().ok());

        let mut state = self.state.lock().unwrap();
        if let Some(host) = state.hosts.last_mut() {
            if let Some(flags) = flags {
                host.flags = flags;
            }
            if let Some(version) = version {
                host.protocol = version;
            }
        }
    }

    /// Glue the partials to the final frame, parse, and notify.
    fn surface_frame(&self, msg: Message) {
        let (request, expected, partials) = {
            let mut state = self.state.lock().unwrap();
            (
                state.request.clone(),
                state.expected_chunks.clone(),
                std::mem::take(&mut state.partials),
            )
        };

        let mut body = Vec::new();
        for partial in &partials {
            body.extend_from_slice(protocol::message_body(partial));
        }
        body.extend_from_slice(protocol::message_body(&msg));

        let result = response::parse_response(&request, &body, expected.as_deref());
        self.finalize(result);
    }

    /// Release the stream id, fire the user callback, and let the
    /// handler die. Runs at most once; late events hitting a finished
    /// handler are dropped here.
    fn finalize(&self, result: Result<Response>) {
        let (callback, hosts, sid, sid_mgr, quarantine) = {
            let mut state = self.state.lock().unwrap();
            let Some(callback) = state.callback.take() else {
                return;
            };
            (
                callback,
                state.hosts.clone(),
                state.request.sid,
                state.sid_mgr.clone(),
                matches!(result, Err(Error::OperationExpired)),
            )
        };

        // an expired request's id is quarantined so a late reply cannot
        // alias onto a fresh request
        if quarantine {
            sid_mgr.time_out(sid);
        } else {
            sid_mgr.release(sid);
        }

        callback(result, hosts);
    }
}
