//! The readiness-driven socket layer.
//!
//! One driver task per substream dispatches socket readiness, playing the
//! role of a poller registration: spawning the driver registers the
//! socket, cancelling it removes the socket, and the uplink [`Notify`]
//! enables write interest. While the substream has nothing to send the
//! driver waits with read interest only (an empty out-queue disables
//! write notification) and a nudge on the uplink re-arms it.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::Error;
use crate::message::Message;
use crate::stream::Stream;
use crate::transport::GetMessageResult;

/// Drive one substream's socket until cancellation or error.
///
/// Inbound bytes are reassembled into frames by the transport and handed
/// to the stream; outbound frames are pulled from the stream's write
/// slot, one at a time.
pub(crate) async fn run_socket(
    stream: Arc<Stream>,
    substream: u16,
    socket: TcpStream,
    uplink: Arc<Notify>,
    cancel: CancellationToken,
) {
    let transport = stream.transport();
    let mut inbound = Message::new();
    // the frame currently going out and how much of it has been written
    let mut current: Option<(Bytes, usize)> = None;

    loop {
        if current.is_none() {
            current = stream.pop_write(substream).map(|bytes| (bytes, 0));
        }
        let want_write = current.is_some();
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                trace!("Socket driver for substream {} cancelled", substream);
                return;
            }
            _ = uplink.notified(), if !want_write => {
                // something was queued; re-evaluate the interest set
                continue;
            }
            ready = socket.ready(interest) => {
                let ready = match ready {
                    Ok(ready) => ready,
                    Err(e) => {
                        stream.on_error(substream, Error::SocketError(e.to_string()));
                        return;
                    }
                };

                if ready.is_readable() {
                    loop {
                        match transport.get_message(&mut inbound, &socket) {
                            GetMessageResult::Complete => {
                                let msg = std::mem::take(&mut inbound);
                                stream.on_incoming(substream, msg);
                            }
                            GetMessageResult::Retry => break,
                            GetMessageResult::Error(e) => {
                                stream.on_error(substream, e);
                                return;
                            }
                        }
                    }
                }

                if ready.is_writable() {
                    if let Some((bytes, mut written)) = current.take() {
                        let mut failure = None;
                        let mut done = false;
                        while written < bytes.len() {
                            match socket.try_write(&bytes[written..]) {
                                Ok(0) => {
                                    failure = Some(Error::SocketDisconnected);
                                    break;
                                }
                                Ok(n) => written += n,
                                Err(ref e)
                                    if e.kind() == std::io::ErrorKind::WouldBlock =>
                                {
                                    break;
                                }
                                Err(e) => {
                                    failure = Some(Error::SocketError(e.to_string()));
                                    break;
                                }
                            }
                        }
                        if written == bytes.len() {
                            done = true;
                        }

                        if let Some(e) = failure {
                            stream.on_error(substream, e);
                            return;
                        }
                        if done {
                            stream.on_message_sent(substream);
                        } else {
                            current = Some((bytes, written));
                        }
                    }
                }
            }
        }
    }
}
