//! Integration tests driving the full post-master stack against scripted
//! in-process servers over real TCP sockets.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use xrd_client::protocol::{
    ERR_NOT_FOUND, FLAG_IS_MANAGER, FLAG_IS_SERVER, STATUS_ATTN, STATUS_ERROR, STATUS_OK,
    STATUS_OKSOFAR, STATUS_REDIRECT, STATUS_WAIT, STATUS_WAITRESP,
};
use xrd_client::{
    send_request, ChannelEvent, ChannelEventHandler, Config, Error, HostInfo, PostMaster,
    Request, RequestKind, Response, SendOptions, Url,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("info,xrd_client=debug")
        .try_init();
}

// ── Scripted mock server ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ReceivedRequest {
    sid: u16,
    kind: u16,
    body: [u8; 16],
    payload: Vec<u8>,
}

impl ReceivedRequest {
    fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Given the per-connection request index and the request, produce the
/// frames to send back.
type Script = Arc<dyn Fn(usize, &ReceivedRequest) -> Vec<Vec<u8>> + Send + Sync>;

struct MockServer {
    port: u16,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
}

impl MockServer {
    async fn start(flags: u32, script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received: Arc<Mutex<Vec<ReceivedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_connection(
                    socket,
                    flags,
                    script.clone(),
                    sink.clone(),
                ));
            }
        });
        Self { port, received }
    }

    fn url(&self) -> Url {
        Url::parse(&format!("root://127.0.0.1:{}/", self.port)).unwrap()
    }

    fn requests(&self) -> Vec<ReceivedRequest> {
        self.received.lock().unwrap().clone()
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    flags: u32,
    script: Script,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
) {
    // client preamble (20 bytes) with the piggybacked protocol request
    let mut preamble = [0u8; 44];
    if socket.read_exact(&mut preamble).await.is_err() {
        return;
    }

    let mut greeting = Vec::new();
    // 16-byte handshake response
    greeting.extend_from_slice(&response_header(0, STATUS_OK, 8));
    greeting.extend_from_slice(&0x310u32.to_be_bytes());
    let msgval: u32 = if flags & FLAG_IS_MANAGER != 0 { 0 } else { 1 };
    greeting.extend_from_slice(&msgval.to_be_bytes());
    // protocol response carrying the authoritative flags
    greeting.extend_from_slice(&response_header(0, STATUS_OK, 8));
    greeting.extend_from_slice(&0x310u32.to_be_bytes());
    greeting.extend_from_slice(&flags.to_be_bytes());
    if socket.write_all(&greeting).await.is_err() {
        return;
    }

    // login exchange
    let mut login = [0u8; 24];
    if socket.read_exact(&mut login).await.is_err() {
        return;
    }
    let mut login_ok = Vec::new();
    login_ok.extend_from_slice(&response_header(0, STATUS_OK, 16));
    login_ok.extend_from_slice(&[7u8; 16]);
    if socket.write_all(&login_ok).await.is_err() {
        return;
    }

    let mut index = 0usize;
    loop {
        let mut header = [0u8; 24];
        if socket.read_exact(&mut header).await.is_err() {
            return;
        }
        let mut body = [0u8; 16];
        body.copy_from_slice(&header[4..20]);
        let dlen = u32::from_be_bytes([header[20], header[21], header[22], header[23]]) as usize;
        let mut payload = vec![0u8; dlen];
        if socket.read_exact(&mut payload).await.is_err() {
            return;
        }
        let request = ReceivedRequest {
            sid: u16::from_be_bytes([header[0], header[1]]),
            kind: u16::from_be_bytes([header[2], header[3]]),
            body,
            payload,
        };
        let frames = script(index, &request);
        received.lock().unwrap().push(request);
        index += 1;
        for frame in frames {
            if socket.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}

// ── Frame builders ───────────────────────────────────────────────────────────

fn response_header(sid: u16, status: u16, dlen: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&sid.to_be_bytes());
    out[2..4].copy_from_slice(&status.to_be_bytes());
    out[4..8].copy_from_slice(&dlen.to_be_bytes());
    out
}

fn ok_frame(sid: u16, body: &[u8]) -> Vec<u8> {
    let mut frame = response_header(sid, STATUS_OK, body.len() as u32).to_vec();
    frame.extend_from_slice(body);
    frame
}

fn oksofar_frame(sid: u16, body: &[u8]) -> Vec<u8> {
    let mut frame = response_header(sid, STATUS_OKSOFAR, body.len() as u32).to_vec();
    frame.extend_from_slice(body);
    frame
}

fn error_frame(sid: u16, errno: u32, message: &str) -> Vec<u8> {
    let mut body = errno.to_be_bytes().to_vec();
    body.extend_from_slice(message.as_bytes());
    let mut frame = response_header(sid, STATUS_ERROR, body.len() as u32).to_vec();
    frame.extend_from_slice(&body);
    frame
}

fn redirect_frame(sid: u16, host: &str, port: u16, cgi: &str) -> Vec<u8> {
    let mut target = host.to_string();
    if !cgi.is_empty() {
        target.push('?');
        target.push_str(cgi);
    }
    let mut body = (port as u32).to_be_bytes().to_vec();
    body.extend_from_slice(target.as_bytes());
    let mut frame = response_header(sid, STATUS_REDIRECT, body.len() as u32).to_vec();
    frame.extend_from_slice(&body);
    frame
}

fn wait_frame(sid: u16, seconds: u32, info: &str) -> Vec<u8> {
    let mut body = seconds.to_be_bytes().to_vec();
    body.extend_from_slice(info.as_bytes());
    let mut frame = response_header(sid, STATUS_WAIT, body.len() as u32).to_vec();
    frame.extend_from_slice(&body);
    frame
}

fn waitresp_frame(sid: u16, seconds: u32) -> Vec<u8> {
    let mut frame = response_header(sid, STATUS_WAITRESP, 4).to_vec();
    frame.extend_from_slice(&seconds.to_be_bytes());
    frame
}

fn attn_frame(embedded: &[u8]) -> Vec<u8> {
    let mut body = 5008u32.to_be_bytes().to_vec(); // asynresp
    body.extend_from_slice(&[0u8; 4]);
    body.extend_from_slice(embedded);
    let mut frame = response_header(0xFFFF, STATUS_ATTN, body.len() as u32).to_vec();
    frame.extend_from_slice(&body);
    frame
}

fn vread_frame(sid: u16, chunks: &[(u64, u32)]) -> Vec<u8> {
    let mut body = Vec::new();
    for &(offset, len) in chunks {
        body.extend_from_slice(&[0u8; 4]);
        body.extend_from_slice(&len.to_be_bytes());
        body.extend_from_slice(&offset.to_be_bytes());
        body.extend(std::iter::repeat(0x5A).take(len as usize));
    }
    let mut frame = response_header(sid, STATUS_OK, body.len() as u32).to_vec();
    frame.extend_from_slice(&body);
    frame
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn test_post_master() -> Arc<PostMaster> {
    let config = Config {
        timeout_resolution: Duration::from_secs(1),
        ..Config::default()
    };
    let pm = PostMaster::new(config);
    pm.start();
    pm
}

async fn run_request(
    pm: &Arc<PostMaster>,
    url: &Url,
    request: Request,
    options: SendOptions,
) -> (Result<Response, Error>, Vec<HostInfo>) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    send_request(pm, url, request, options, move |result, hosts| {
        let _ = tx.send((result, hosts));
    })
    .unwrap();
    rx.await.expect("callback never fired")
}

/// A TCP port nobody listens on.
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_happy_ping() {
    init_tracing();
    let server = MockServer::start(
        FLAG_IS_SERVER,
        Arc::new(|_, req| vec![ok_frame(req.sid, b"")]),
    )
    .await;

    let pm = test_post_master();
    let (result, hosts) = run_request(
        &pm,
        &server.url(),
        Request::new(RequestKind::Ping),
        SendOptions::default(),
    )
    .await;

    assert_eq!(result.unwrap(), Response::Ok);
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].flags & FLAG_IS_SERVER, FLAG_IS_SERVER);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].kind, RequestKind::Ping as u16);
    pm.stop();
}

#[tokio::test]
async fn test_single_redirect() {
    init_tracing();
    let target = MockServer::start(
        FLAG_IS_SERVER,
        Arc::new(|_, req| vec![ok_frame(req.sid, b"")]),
    )
    .await;

    let target_port = target.port;
    let manager = MockServer::start(
        FLAG_IS_MANAGER,
        Arc::new(move |_, req| {
            vec![redirect_frame(req.sid, "127.0.0.1", target_port, "tried=mgr")]
        }),
    )
    .await;

    let pm = test_post_master();
    let (result, hosts) = run_request(
        &pm,
        &manager.url(),
        Request::with_path(RequestKind::Ping, "/data/file"),
        SendOptions::default(),
    )
    .await;

    assert_eq!(result.unwrap(), Response::Ok);

    // both endpoints took part, in order
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[0].url.port(), manager.port);
    assert_eq!(hosts[1].url.port(), target.port);
    // the manager was captured as the load balancer, the data server
    // was not
    assert!(hosts[0].load_balancer);
    assert!(!hosts[1].load_balancer);

    // the redirect CGI was appended to the outbound request
    let reqs = target.requests();
    assert_eq!(reqs.len(), 1);
    assert!(
        reqs[0].payload_str().contains("tried=mgr"),
        "redirect cgi missing from {:?}",
        reqs[0].payload_str()
    );
    pm.stop();
}

#[tokio::test]
async fn test_wait_then_succeed() {
    init_tracing();
    let server = MockServer::start(
        FLAG_IS_SERVER,
        Arc::new(|index, req| {
            if index == 0 {
                vec![wait_frame(req.sid, 2, "busy")]
            } else {
                vec![ok_frame(req.sid, b"Sr 127.0.0.1:1094")]
            }
        }),
    )
    .await;

    let pm = test_post_master();
    let mut request = Request::with_path(RequestKind::Locate, "/data/file");
    request.set_refresh(true);

    let started = Instant::now();
    let (result, _) = run_request(&pm, &server.url(), request, SendOptions::default()).await;
    let elapsed = started.elapsed();

    assert!(matches!(result.unwrap(), Response::Location(_)));
    assert!(
        elapsed >= Duration::from_secs(2),
        "resent after only {:?}",
        elapsed
    );

    let requests = server.requests();
    assert_eq!(requests.len(), 2, "expected exactly one retry");
    // the refresh bit was on initially and cleared on the re-issue
    assert_ne!(requests[0].body[1] & 0x80, 0);
    assert_eq!(requests[1].body[1] & 0x80, 0);
    pm.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_window_exhaustion() {
    init_tracing();
    let config = Config {
        connection_window: Duration::from_secs(3),
        connection_retry: 2,
        timeout_resolution: Duration::from_secs(1),
        ..Config::default()
    };
    let pm = PostMaster::new(config);
    pm.start();

    // a short deadline runs out while the stream is still retrying
    let url = Url::parse(&format!("root://127.0.0.1:{}/", dead_port().await)).unwrap();
    let (result, _) = run_request(
        &pm,
        &url,
        Request::new(RequestKind::Ping),
        SendOptions {
            timeout: Duration::from_secs(1),
            ..SendOptions::default()
        },
    )
    .await;
    assert_eq!(result.unwrap_err(), Error::SocketTimeout);

    // a long deadline sees the retries run out instead
    let url = Url::parse(&format!("root://127.0.0.1:{}/", dead_port().await)).unwrap();
    let (result, _) = run_request(
        &pm,
        &url,
        Request::new(RequestKind::Ping),
        SendOptions {
            timeout: Duration::from_secs(30),
            ..SendOptions::default()
        },
    )
    .await;
    assert_eq!(result.unwrap_err(), Error::ConnectionError);
    pm.stop();
}

#[tokio::test]
async fn test_vector_read_chunk_mismatch() {
    init_tracing();
    let server = MockServer::start(
        FLAG_IS_SERVER,
        Arc::new(|_, req| {
            // announce a second chunk at the wrong offset
            vec![vread_frame(req.sid, &[(0, 1024), (20 << 20, 1024)])]
        }),
    )
    .await;

    let pm = test_post_master();
    let (result, _) = run_request(
        &pm,
        &server.url(),
        Request::new(RequestKind::ReadV),
        SendOptions {
            expected_chunks: Some(vec![(0, 1024), (10 << 20, 1024)]),
            ..SendOptions::default()
        },
    )
    .await;

    let err = result.unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)), "got {:?}", err);
    assert!(err.is_fatal());
    pm.stop();
}

#[tokio::test]
async fn test_balancer_fallback_on_not_found() {
    init_tracing();
    let data_server = MockServer::start(
        FLAG_IS_SERVER,
        Arc::new(|_, req| vec![error_frame(req.sid, ERR_NOT_FOUND, "no such file")]),
    )
    .await;

    let data_port = data_server.port;
    let balancer = MockServer::start(
        FLAG_IS_MANAGER,
        Arc::new(move |index, req| {
            if index == 0 {
                vec![redirect_frame(req.sid, "127.0.0.1", data_port, "")]
            } else {
                vec![ok_frame(req.sid, &[1, 2, 3, 4])]
            }
        }),
    )
    .await;

    let pm = test_post_master();
    let (result, hosts) = run_request(
        &pm,
        &balancer.url(),
        Request::with_path(RequestKind::Open, "/data/file"),
        SendOptions::default(),
    )
    .await;

    assert!(matches!(result.unwrap(), Response::Open(_)));
    // balancer -> data server -> back to the balancer
    assert_eq!(hosts.len(), 3);
    assert_eq!(hosts[0].url.port(), balancer.port);
    assert_eq!(hosts[1].url.port(), data_server.port);
    assert_eq!(hosts[2].url.port(), balancer.port);
    assert!(hosts[0].load_balancer);

    // the fallback carried tried= and the refresh bit
    let retries = balancer.requests();
    assert_eq!(retries.len(), 2);
    assert!(
        retries[1].payload_str().contains("tried=127.0.0.1"),
        "tried cgi missing from {:?}",
        retries[1].payload_str()
    );
    assert_ne!(retries[1].body[3] & 0x80, 0, "refresh bit not set");
    pm.stop();
}

#[tokio::test]
async fn test_partial_responses_are_concatenated() {
    init_tracing();
    let server = MockServer::start(
        FLAG_IS_SERVER,
        Arc::new(|_, req| {
            vec![
                oksofar_frame(req.sid, b"he"),
                oksofar_frame(req.sid, b"llo "),
                ok_frame(req.sid, b"world"),
            ]
        }),
    )
    .await;

    let pm = test_post_master();
    let (result, _) = run_request(
        &pm,
        &server.url(),
        Request::new(RequestKind::Query),
        SendOptions::default(),
    )
    .await;

    assert_eq!(result.unwrap(), Response::Binary(b"hello world".to_vec()));
    pm.stop();
}

#[tokio::test]
async fn test_waitresp_then_async_push() {
    init_tracing();
    let server = MockServer::start(
        FLAG_IS_SERVER,
        Arc::new(|_, req| {
            vec![
                waitresp_frame(req.sid, 1),
                attn_frame(&ok_frame(req.sid, b"")),
            ]
        }),
    )
    .await;

    let pm = test_post_master();
    let (result, _) = run_request(
        &pm,
        &server.url(),
        Request::new(RequestKind::Ping),
        SendOptions::default(),
    )
    .await;

    assert_eq!(result.unwrap(), Response::Ok);
    pm.stop();
}

#[tokio::test]
async fn test_redirect_as_answer() {
    init_tracing();
    let manager = MockServer::start(
        FLAG_IS_MANAGER,
        Arc::new(|_, req| vec![redirect_frame(req.sid, "disk7.cern.ch", 1094, "cgi=1")]),
    )
    .await;

    let pm = test_post_master();
    let (result, _) = run_request(
        &pm,
        &manager.url(),
        Request::with_path(RequestKind::Open, "/data/file"),
        SendOptions {
            redirect_as_answer: true,
            ..SendOptions::default()
        },
    )
    .await;

    match result.unwrap() {
        Response::Redirect(info) => {
            assert_eq!(info.host, "disk7.cern.ch");
            assert_eq!(info.port, 1094);
            assert_eq!(info.cgi, "cgi=1");
        }
        other => panic!("expected a redirect answer, got {:?}", other),
    }
    pm.stop();
}

#[tokio::test]
async fn test_stateful_send_on_stale_session() {
    init_tracing();
    let pm = test_post_master();
    // the channel exists but its session was never established, so a
    // session-bound request must bounce without any wire traffic
    let url = Url::parse(&format!("root://127.0.0.1:{}/", dead_port().await)).unwrap();
    let result = send_request(
        &pm,
        &url,
        Request::new(RequestKind::Sync),
        SendOptions {
            stateful: true,
            session_id: 999,
            ..SendOptions::default()
        },
        |_, _| panic!("callback must not fire for a synchronous failure"),
    );
    assert_eq!(result.unwrap_err(), Error::InvalidSession);
    pm.stop();
}

#[tokio::test]
async fn test_receive_picks_up_unsolicited_frame() {
    init_tracing();
    let server = MockServer::start(
        FLAG_IS_SERVER,
        Arc::new(|_, req| {
            vec![ok_frame(req.sid, b""), ok_frame(0x7777, b"unsolicited")]
        }),
    )
    .await;

    let pm = test_post_master();
    let url = server.url();
    let (result, _) = run_request(
        &pm,
        &url,
        Request::new(RequestKind::Ping),
        SendOptions::default(),
    )
    .await;
    assert_eq!(result.unwrap(), Response::Ok);

    let msg = pm
        .receive(
            &url,
            |msg| xrd_client::protocol::message_sid(msg) == 0x7777,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(xrd_client::protocol::message_body(&msg), b"unsolicited");
    pm.stop();
}

struct EventRecorder {
    events: Mutex<Vec<ChannelEvent>>,
}

impl ChannelEventHandler for EventRecorder {
    fn on_event(&self, event: ChannelEvent, _status: Option<&Error>, _stream: u16) -> bool {
        self.events.lock().unwrap().push(event);
        true
    }
}

#[tokio::test]
async fn test_stream_ready_event_is_reported() {
    init_tracing();
    let server = MockServer::start(
        FLAG_IS_SERVER,
        Arc::new(|_, req| vec![ok_frame(req.sid, b"")]),
    )
    .await;

    let pm = test_post_master();
    let url = server.url();
    let recorder = Arc::new(EventRecorder {
        events: Mutex::new(Vec::new()),
    });
    let handler: Arc<dyn ChannelEventHandler> = recorder.clone();
    pm.register_event_handler(&url, handler.clone()).unwrap();

    let (result, _) = run_request(
        &pm,
        &url,
        Request::new(RequestKind::Ping),
        SendOptions::default(),
    )
    .await;
    assert!(result.is_ok());
    assert!(recorder
        .events
        .lock()
        .unwrap()
        .contains(&ChannelEvent::StreamReady));

    pm.remove_event_handler(&url, &handler).unwrap();
    pm.stop();
}

#[tokio::test]
async fn test_session_id_increases_on_reconnect() {
    init_tracing();
    let server = MockServer::start(
        FLAG_IS_SERVER,
        Arc::new(|_, req| vec![ok_frame(req.sid, b"")]),
    )
    .await;

    let pm = test_post_master();
    let url = server.url();
    let (result, _) = run_request(
        &pm,
        &url,
        Request::new(RequestKind::Ping),
        SendOptions::default(),
    )
    .await;
    assert!(result.is_ok());
    assert_eq!(pm.session_id(&url).unwrap(), 1);
}
