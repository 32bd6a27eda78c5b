//! Client runtime for the xrootd hierarchical data-access protocol.
//!
//! The crate implements the *post master*: a process-wide multiplexed
//! request/response engine that owns the connections to remote endpoints
//! and routes message traffic through them, following server-initiated
//! redirections across manager, meta-manager and data-server tiers and
//! recovering transparently from transient failures.
//!
//! # Architecture
//!
//! ```text
//! caller
//!    │  send_request()
//!    ▼
//! PostMaster ── one Channel per endpoint
//!    │             │── InQueue      (frame ↔ waiter correlation)
//!    │             │── ChannelData  (transport-owned state, SidManager)
//!    │             └── Stream ── SubStream(s) ── socket driver task
//!    │                               └── OutQueue + write slot
//!    │
//!    │── TaskManager  (waits, reconnection back-off, timeout sweeps)
//!    └── Transport    (handshake, framing, multiplexing)
//! ```
//!
//! Each in-flight request is owned by a [`handler::RequestHandler`]: it
//! reacts to `ok`, `error`, `redirect`, `wait`, `waitresp`, partial and
//! async responses, rewrites and re-issues the request as needed, and
//! fires the user callback exactly once.
//!
//! # Example
//!
//! ```rust,ignore
//! use xrd_client::{send_request, PostMaster, Request, RequestKind, SendOptions, Url};
//!
//! let pm = PostMaster::instance();
//! let url = Url::parse("root://eospublic.cern.ch:1094/")?;
//! send_request(
//!     &pm,
//!     &url,
//!     Request::with_path(RequestKind::Locate, "/eos/file.root"),
//!     SendOptions::default(),
//!     |result, hosts| println!("{:?} via {} host(s)", result, hosts.len()),
//! )?;
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod in_queue;
pub mod message;
pub mod out_queue;
pub mod postmaster;
pub mod protocol;
pub mod response;
pub mod sid;
mod socket;
pub mod stream;
pub mod task;
pub mod transport;
pub mod url;

pub use channel::{Channel, ChannelEvent, ChannelEventHandler};
pub use config::Config;
pub use error::{Error, Result};
pub use handler::{send_request, HostInfo, RequestHandler, SendOptions};
pub use message::Message;
pub use postmaster::PostMaster;
pub use protocol::{Request, RequestKind};
pub use response::Response;
pub use sid::SidManager;
pub use stream::SocketStatus;
pub use transport::{PathId, QueryResult, Transport, TransportQuery, XrdTransport};
pub use url::Url;
