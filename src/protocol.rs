//! Wire-level constants and codecs for the data-access protocol.
//!
//! Request frame (network byte order):
//!
//! ```text
//! [stream_id: u16][request_id: u16][body: 16 bytes][dlen: u32][payload]
//! ```
//!
//! Response frame:
//!
//! ```text
//! [stream_id: u16][status: u16][dlen: u32][body]
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::message::Message;

/// Size of a marshalled request header
pub const REQ_HEADER_LEN: usize = 24;

/// Size of a marshalled response header
pub const RSP_HEADER_LEN: usize = 8;

/// Upper bound accepted for a response body; larger values are treated
/// as framing corruption
pub const MAX_BODY_LEN: usize = 0x1000_0000;

// ── Response status codes ────────────────────────────────────────────────────

pub const STATUS_OK: u16 = 0;
pub const STATUS_OKSOFAR: u16 = 4000;
pub const STATUS_ATTN: u16 = 4001;
pub const STATUS_ERROR: u16 = 4003;
pub const STATUS_REDIRECT: u16 = 4004;
pub const STATUS_WAIT: u16 = 4005;
pub const STATUS_WAITRESP: u16 = 4006;

/// `attn` action code carrying an embedded async response
pub const ATTN_ASYNRESP: u32 = 5008;

// ── Server error numbers ─────────────────────────────────────────────────────

pub const ERR_ARG_INVALID: u32 = 3000;
pub const ERR_FILE_NOT_OPEN: u32 = 3004;
pub const ERR_FS_ERROR: u32 = 3005;
pub const ERR_INVALID_REQUEST: u32 = 3006;
pub const ERR_IO_ERROR: u32 = 3007;
pub const ERR_NO_SPACE: u32 = 3009;
pub const ERR_NOT_AUTHORIZED: u32 = 3010;
pub const ERR_NOT_FOUND: u32 = 3011;
pub const ERR_SERVER_ERROR: u32 = 3012;
pub const ERR_UNSUPPORTED: u32 = 3013;

// ── Server flags (handshake / protocol response) ─────────────────────────────

pub const FLAG_IS_SERVER: u32 = 0x01;
pub const FLAG_IS_MANAGER: u32 = 0x02;
pub const FLAG_ATTR_META: u32 = 0x100;
pub const FLAG_ATTR_PROXY: u32 = 0x200;
pub const FLAG_ATTR_SUPER: u32 = 0x400;

/// Handshake `msgval` for a plain data server
pub const HS_DATA_SERVER: u32 = 1;

/// Protocol version from which the protocol response carries server flags
pub const PROTO_FLAGS_VERSION: u32 = 0x297;

/// Protocol version advertised by this client
pub const PROTOCOL_VERSION: u32 = 0x310;

// ── Request option bits ──────────────────────────────────────────────────────

/// Ask the server to bypass its location cache (open/locate)
pub const OPT_REFRESH: u16 = 0x80;

/// Ask `open` to return stat information with the file handle
pub const OPT_RETSTAT: u16 = 0x400;

/// `stat` of the virtual file system instead of a path
pub const OPT_VFS: u16 = 0x01;

/// Request kinds understood by the response parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestKind {
    Query = 3001,
    Chmod = 3002,
    Close = 3003,
    DirList = 3004,
    Protocol = 3006,
    Login = 3007,
    Mkdir = 3008,
    Mv = 3009,
    Open = 3010,
    Ping = 3011,
    Read = 3013,
    Rm = 3014,
    RmDir = 3015,
    Sync = 3016,
    Stat = 3017,
    Set = 3018,
    Write = 3019,
    Prepare = 3021,
    ReadV = 3025,
    Locate = 3027,
    Truncate = 3028,
}

impl RequestKind {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            3001 => Self::Query,
            3002 => Self::Chmod,
            3003 => Self::Close,
            3004 => Self::DirList,
            3006 => Self::Protocol,
            3007 => Self::Login,
            3008 => Self::Mkdir,
            3009 => Self::Mv,
            3010 => Self::Open,
            3011 => Self::Ping,
            3013 => Self::Read,
            3014 => Self::Rm,
            3015 => Self::RmDir,
            3016 => Self::Sync,
            3017 => Self::Stat,
            3018 => Self::Set,
            3019 => Self::Write,
            3021 => Self::Prepare,
            3025 => Self::ReadV,
            3027 => Self::Locate,
            3028 => Self::Truncate,
            _ => return None,
        })
    }

    /// Requests whose payload starts with a path that may carry CGI
    /// parameters.
    pub fn carries_path(&self) -> bool {
        matches!(
            self,
            Self::Open
                | Self::Locate
                | Self::Stat
                | Self::DirList
                | Self::Mkdir
                | Self::Mv
                | Self::Rm
                | Self::RmDir
                | Self::Chmod
                | Self::Truncate
                | Self::Prepare
        )
    }
}

/// A request in host order.
///
/// This is the mutable form the request-handler rewrites between retries
/// (new stream id, appended CGI, toggled refresh bit); [`Request::marshal`]
/// produces the wire form, [`Request::unmarshal`] recovers this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub sid: u16,
    pub kind: u16,
    pub body: [u8; 16],
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            sid: 0,
            kind: kind as u16,
            body: [0; 16],
            payload: Vec::new(),
        }
    }

    /// A request whose payload is a path, e.g. `open` or `locate`.
    pub fn with_path(kind: RequestKind, path: &str) -> Self {
        let mut req = Self::new(kind);
        req.payload = path.as_bytes().to_vec();
        req
    }

    pub fn kind(&self) -> Option<RequestKind> {
        RequestKind::from_u16(self.kind)
    }

    /// Serialize into a wire frame.
    pub fn marshal(&self) -> Message {
        let mut buf = BytesMut::with_capacity(REQ_HEADER_LEN + self.payload.len());
        buf.put_u16(self.sid);
        buf.put_u16(self.kind);
        buf.put_slice(&self.body);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Message::from_bytes(&buf)
    }

    /// Recover the host-order form from a wire frame.
    pub fn unmarshal(msg: &Message) -> Result<Self> {
        let data = msg.as_slice();
        if data.len() < REQ_HEADER_LEN {
            return Err(Error::InvalidMessage(format!(
                "request frame too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = &data[..];
        let sid = cursor.get_u16();
        let kind = cursor.get_u16();
        let mut body = [0u8; 16];
        cursor.copy_to_slice(&mut body);
        let dlen = cursor.get_u32() as usize;
        if data.len() != REQ_HEADER_LEN + dlen {
            return Err(Error::InvalidMessage(format!(
                "request length mismatch: header says {}, frame has {}",
                dlen,
                data.len() - REQ_HEADER_LEN
            )));
        }
        Ok(Self {
            sid,
            kind,
            body,
            payload: data[REQ_HEADER_LEN..].to_vec(),
        })
    }

    /// Options field of `open` (body offset 2) and `locate` (body offset 0).
    fn options_offset(&self) -> Option<usize> {
        match self.kind() {
            Some(RequestKind::Open) => Some(2),
            Some(RequestKind::Locate) => Some(0),
            _ => None,
        }
    }

    /// Toggle the `refresh` bit on open/locate requests; a no-op for any
    /// other kind.
    pub fn set_refresh(&mut self, on: bool) {
        let Some(off) = self.options_offset() else {
            return;
        };
        let mut options = u16::from_be_bytes([self.body[off], self.body[off + 1]]);
        if on {
            options |= OPT_REFRESH;
        } else {
            options &= !OPT_REFRESH;
        }
        self.body[off..off + 2].copy_from_slice(&options.to_be_bytes());
    }

    pub fn refresh(&self) -> bool {
        match self.options_offset() {
            Some(off) => {
                u16::from_be_bytes([self.body[off], self.body[off + 1]]) & OPT_REFRESH != 0
            }
            None => false,
        }
    }

    /// Append CGI parameters to the path payload. A repeated key extends
    /// the existing value with a comma, which is how the `tried=` host
    /// list accumulates across retries.
    pub fn append_cgi(&mut self, params: &[(String, String)]) {
        if params.is_empty() {
            return;
        }
        let mut payload = String::from_utf8_lossy(&self.payload).into_owned();
        for (key, value) in params {
            let existing = find_param(&payload, key);
            match existing {
                Some((start, end)) => {
                    let mut merged = payload[start..end].to_string();
                    if !value.is_empty() {
                        if !merged.contains('=') {
                            merged.push('=');
                        } else if !merged.ends_with('=') {
                            merged.push(',');
                        }
                        merged.push_str(value);
                    }
                    payload.replace_range(start..end, &merged);
                }
                None => {
                    payload.push(if payload.contains('?') { '&' } else { '?' });
                    payload.push_str(key);
                    if !value.is_empty() {
                        payload.push('=');
                        payload.push_str(value);
                    }
                }
            }
        }
        self.payload = payload.into_bytes();
    }
}

/// Locate the `key[=value]` span of a CGI parameter inside `path?cgi`.
fn find_param(payload: &str, key: &str) -> Option<(usize, usize)> {
    let query_start = payload.find('?')? + 1;
    let mut pos = query_start;
    for item in payload[query_start..].split('&') {
        let item_key = item.split('=').next().unwrap_or(item);
        if item_key == key {
            return Some((pos, pos + item.len()));
        }
        pos += item.len() + 1;
    }
    None
}

/// Decoded response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub sid: u16,
    pub status: u16,
    pub dlen: u32,
}

impl ResponseHeader {
    pub fn decode(msg: &Message) -> Result<Self> {
        let data = msg.as_slice();
        if data.len() < RSP_HEADER_LEN {
            return Err(Error::InvalidMessage(format!(
                "response frame too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = &data[..];
        Ok(Self {
            sid: cursor.get_u16(),
            status: cursor.get_u16(),
            dlen: cursor.get_u32(),
        })
    }

    pub fn encode(&self) -> [u8; RSP_HEADER_LEN] {
        let mut out = [0u8; RSP_HEADER_LEN];
        out[0..2].copy_from_slice(&self.sid.to_be_bytes());
        out[2..4].copy_from_slice(&self.status.to_be_bytes());
        out[4..8].copy_from_slice(&self.dlen.to_be_bytes());
        out
    }
}

/// Stream id of any frame, request or response.
pub fn message_sid(msg: &Message) -> u16 {
    let data = msg.as_slice();
    if data.len() < 2 {
        return 0;
    }
    u16::from_be_bytes([data[0], data[1]])
}

/// Response body past the header.
pub fn message_body(msg: &Message) -> &[u8] {
    let data = msg.as_slice();
    if data.len() <= RSP_HEADER_LEN {
        &[]
    } else {
        &data[RSP_HEADER_LEN..]
    }
}

/// For an `attn(asynresp)` frame, the embedded response starting at
/// offset 16: `[rsp hdr: 8][actnum: 4][reserved: 4][embedded frame]`.
pub fn embedded_response(msg: &Message) -> Result<Message> {
    let body = message_body(msg);
    if body.len() < 8 + RSP_HEADER_LEN {
        return Err(Error::InvalidMessage(
            "async response too short to carry an embedded frame".into(),
        ));
    }
    Ok(Message::from_bytes(&body[8..]))
}

/// Action code of an `attn` response.
pub fn attn_action(msg: &Message) -> Option<u32> {
    let body = message_body(msg);
    if body.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_roundtrip() {
        let mut req = Request::with_path(RequestKind::Open, "/data/file");
        req.sid = 0x0102;
        req.body[2..4].copy_from_slice(&OPT_RETSTAT.to_be_bytes());
        let msg = req.marshal();
        assert_eq!(msg.len(), REQ_HEADER_LEN + 10);
        assert_eq!(message_sid(&msg), 0x0102);
        let back = Request::unmarshal(&msg).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_unmarshal_length_mismatch() {
        let req = Request::with_path(RequestKind::Stat, "/f");
        let mut msg = req.marshal();
        msg.resize(msg.len() + 1);
        assert!(matches!(
            Request::unmarshal(&msg),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_refresh_bit_open_and_locate() {
        let mut open = Request::with_path(RequestKind::Open, "/f");
        open.set_refresh(true);
        assert!(open.refresh());
        assert_eq!(open.body[3], OPT_REFRESH as u8);
        open.set_refresh(false);
        assert!(!open.refresh());

        let mut locate = Request::with_path(RequestKind::Locate, "/f");
        locate.set_refresh(true);
        assert_eq!(locate.body[1], OPT_REFRESH as u8);
        assert!(locate.refresh());

        // refresh is meaningless for other kinds and must not touch the body
        let mut ping = Request::new(RequestKind::Ping);
        ping.set_refresh(true);
        assert_eq!(ping.body, [0; 16]);
    }

    #[test]
    fn test_append_cgi() {
        let mut req = Request::with_path(RequestKind::Open, "/data/file");
        req.append_cgi(&[("tried".into(), "a.cern.ch".into())]);
        assert_eq!(req.payload, b"/data/file?tried=a.cern.ch");
        req.append_cgi(&[("tried".into(), "b.cern.ch".into())]);
        assert_eq!(req.payload, b"/data/file?tried=a.cern.ch,b.cern.ch");
        req.append_cgi(&[("xrdcl.secuid".into(), "7".into())]);
        assert_eq!(
            req.payload,
            b"/data/file?tried=a.cern.ch,b.cern.ch&xrdcl.secuid=7"
        );
    }

    #[test]
    fn test_response_header_roundtrip() {
        let hdr = ResponseHeader {
            sid: 7,
            status: STATUS_REDIRECT,
            dlen: 42,
        };
        let bytes = hdr.encode();
        let msg = Message::from_bytes(&bytes);
        assert_eq!(ResponseHeader::decode(&msg).unwrap(), hdr);
    }

    #[test]
    fn test_embedded_response() {
        // attn frame: hdr + actnum + reserved + embedded ping ok
        let inner = ResponseHeader {
            sid: 3,
            status: STATUS_OK,
            dlen: 0,
        };
        let mut frame = Vec::new();
        frame.extend_from_slice(
            &ResponseHeader {
                sid: 0,
                status: STATUS_ATTN,
                dlen: 8 + RSP_HEADER_LEN as u32,
            }
            .encode(),
        );
        frame.extend_from_slice(&ATTN_ASYNRESP.to_be_bytes());
        frame.extend_from_slice(&[0; 4]);
        frame.extend_from_slice(&inner.encode());

        let msg = Message::from_bytes(&frame);
        assert_eq!(attn_action(&msg), Some(ATTN_ASYNRESP));
        let embedded = embedded_response(&msg).unwrap();
        assert_eq!(ResponseHeader::decode(&embedded).unwrap(), inner);
    }
}
