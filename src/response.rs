//! Typed decoding of server responses.
//!
//! Every reply shape the protocol can produce is listed here as one
//! variant of [`Response`]; the request-handler picks the parser based on
//! the kind of the original request.

use crate::error::{Error, Result};
use crate::protocol::{Request, RequestKind, OPT_RETSTAT, OPT_VFS};

/// A parsed server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Successful completion with no payload (ping, mkdir, rm, ...)
    Ok,
    Location(LocationInfo),
    Stat(StatInfo),
    StatVfs(StatVfsInfo),
    Open(OpenInfo),
    Chunk(ChunkInfo),
    VectorRead(VectorReadInfo),
    Binary(Vec<u8>),
    DirectoryList(Vec<String>),
    Protocol(ProtocolInfo),
    /// The redirect target, returned when redirect-as-answer is set
    Redirect(RedirectInfo),
}

/// One entry of a `locate` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub address: String,
    pub is_manager: bool,
    pub is_pending: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationInfo {
    pub locations: Vec<Location>,
}

impl LocationInfo {
    /// Parse the space-separated location list: each entry is a node-type
    /// character (`M`/`m`/`S`/`s`), an access character (`r`/`w`), then
    /// the address.
    pub fn parse(data: &str) -> Result<Self> {
        let mut locations = Vec::new();
        for entry in data.split_whitespace() {
            let mut chars = entry.chars();
            let node = chars.next();
            let access = chars.next();
            let address: String = chars.collect();
            let (node, access) = match (node, access) {
                (Some(n), Some(a)) if !address.is_empty() => (n, a),
                _ => {
                    return Err(Error::InvalidResponse(format!(
                        "malformed location entry: {:?}",
                        entry
                    )))
                }
            };
            let (is_manager, is_pending) = match node {
                'M' => (true, false),
                'm' => (true, true),
                'S' => (false, false),
                's' => (false, true),
                _ => {
                    return Err(Error::InvalidResponse(format!(
                        "unknown location node type: {:?}",
                        node
                    )))
                }
            };
            locations.push(Location {
                address,
                is_manager,
                is_pending,
                writable: access == 'w',
            });
        }
        Ok(Self { locations })
    }
}

/// Decoded `stat` response: `id size flags modtime` in ASCII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatInfo {
    pub id: String,
    pub size: u64,
    pub flags: u32,
    pub mod_time: u64,
}

impl StatInfo {
    pub fn parse(data: &str) -> Result<Self> {
        let mut fields = data.split_whitespace();
        let id = fields
            .next()
            .ok_or_else(|| Error::InvalidResponse("stat response missing id".into()))?;
        let size = parse_field(fields.next(), "stat size")?;
        let flags = parse_field(fields.next(), "stat flags")?;
        let mod_time = parse_field(fields.next(), "stat modtime")?;
        Ok(Self {
            id: id.to_string(),
            size,
            flags: flags as u32,
            mod_time,
        })
    }
}

/// Decoded virtual-file-system `stat` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatVfsInfo {
    pub nodes_rw: u64,
    pub free_rw: u64,
    pub utilization_rw: u8,
    pub nodes_staging: u64,
    pub free_staging: u64,
    pub utilization_staging: u8,
}

impl StatVfsInfo {
    pub fn parse(data: &str) -> Result<Self> {
        let mut fields = data.split_whitespace();
        Ok(Self {
            nodes_rw: parse_field(fields.next(), "vfs rw nodes")?,
            free_rw: parse_field(fields.next(), "vfs rw free")?,
            utilization_rw: parse_field(fields.next(), "vfs rw utilization")? as u8,
            nodes_staging: parse_field(fields.next(), "vfs staging nodes")?,
            free_staging: parse_field(fields.next(), "vfs staging free")?,
            utilization_staging: parse_field(fields.next(), "vfs staging utilization")? as u8,
        })
    }
}

fn parse_field(field: Option<&str>, what: &str) -> Result<u64> {
    field
        .and_then(|f| f.parse::<u64>().ok())
        .ok_or_else(|| Error::InvalidResponse(format!("unparsable {}", what)))
}

/// Result of a successful `open`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenInfo {
    pub file_handle: [u8; 4],
    /// Session the file handle is bound to; a stateful request carrying
    /// this id is rejected once the session restarts.
    pub session_id: u64,
    pub stat: Option<StatInfo>,
}

/// A contiguous piece of file data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorReadInfo {
    pub chunks: Vec<ChunkInfo>,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub version: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInfo {
    pub host: String,
    pub port: u16,
    pub cgi: String,
}

/// Parse a complete `ok` payload according to the original request.
///
/// `expected_chunks` carries the `(offset, length)` list the caller asked
/// for in a read or vector read; the server reply is validated against it.
pub fn parse_response(
    request: &Request,
    body: &[u8],
    expected_chunks: Option<&[(u64, u32)]>,
) -> Result<Response> {
    let Some(kind) = request.kind() else {
        return Ok(Response::Binary(body.to_vec()));
    };

    match kind {
        RequestKind::Mv
        | RequestKind::Truncate
        | RequestKind::Rm
        | RequestKind::Mkdir
        | RequestKind::RmDir
        | RequestKind::Chmod
        | RequestKind::Ping
        | RequestKind::Close
        | RequestKind::Write
        | RequestKind::Sync
        | RequestKind::Login => Ok(Response::Ok),

        RequestKind::Locate => {
            let text = std::str::from_utf8(body)
                .map_err(|_| Error::InvalidResponse("locate response is not text".into()))?;
            Ok(Response::Location(LocationInfo::parse(text)?))
        }

        RequestKind::Stat => {
            let text = std::str::from_utf8(body)
                .map_err(|_| Error::InvalidResponse("stat response is not text".into()))?;
            let options = u16::from_be_bytes([request.body[0], request.body[1]]);
            if options & OPT_VFS != 0 {
                Ok(Response::StatVfs(StatVfsInfo::parse(text)?))
            } else {
                Ok(Response::Stat(StatInfo::parse(text)?))
            }
        }

        RequestKind::Protocol => {
            if body.len() != 8 {
                return Err(Error::InvalidResponse(format!(
                    "protocol response has {} bytes, expected 8",
                    body.len()
                )));
            }
            Ok(Response::Protocol(ProtocolInfo {
                version: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                flags: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            }))
        }

        RequestKind::DirList => {
            let text = std::str::from_utf8(body)
                .map_err(|_| Error::InvalidResponse("dirlist response is not text".into()))?;
            Ok(Response::DirectoryList(
                text.split('\n')
                    .map(str::trim_end)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect(),
            ))
        }

        RequestKind::Open => {
            if body.len() < 4 {
                return Err(Error::InvalidResponse(
                    "open response is missing the file handle".into(),
                ));
            }
            let mut file_handle = [0u8; 4];
            file_handle.copy_from_slice(&body[..4]);
            let options = u16::from_be_bytes([request.body[2], request.body[3]]);
            let stat = if options & OPT_RETSTAT != 0 && body.len() > 12 {
                let text = std::str::from_utf8(&body[12..])
                    .map_err(|_| Error::InvalidResponse("open stat block is not text".into()))?;
                Some(StatInfo::parse(text)?)
            } else {
                None
            };
            Ok(Response::Open(OpenInfo {
                file_handle,
                session_id: 0,
                stat,
            }))
        }

        RequestKind::Read => {
            let offset = match expected_chunks.and_then(|c| c.first()) {
                Some(&(offset, length)) => {
                    if body.len() > length as usize {
                        return Err(Error::InvalidResponse(format!(
                            "read returned {} bytes for a {} byte chunk",
                            body.len(),
                            length
                        )));
                    }
                    offset
                }
                None => 0,
            };
            Ok(Response::Chunk(ChunkInfo {
                offset,
                data: body.to_vec(),
            }))
        }

        RequestKind::ReadV => {
            let expected = expected_chunks.unwrap_or(&[]);
            Ok(Response::VectorRead(unpack_vector_read(body, expected)?))
        }

        RequestKind::Query | RequestKind::Set | RequestKind::Prepare => {
            Ok(Response::Binary(body.to_vec()))
        }
    }
}

/// Unpack a vector-read reply: a 16-byte chunk header
/// `[fhandle: 4][rlen: u32][offset: u64]` before each data block.
///
/// Every announced chunk must match the requested one in order, length
/// and offset; the first mismatch aborts the unpacking so no data past
/// it is handed to the caller.
fn unpack_vector_read(body: &[u8], expected: &[(u64, u32)]) -> Result<VectorReadInfo> {
    let mut chunks = Vec::new();
    let mut size = 0u32;
    let mut cursor = 0usize;
    let mut current = 0usize;

    while cursor + 16 <= body.len() {
        if current >= expected.len() {
            return Err(Error::InvalidResponse(
                "server returned more chunks than requested".into(),
            ));
        }
        let rlen = u32::from_be_bytes([
            body[cursor + 4],
            body[cursor + 5],
            body[cursor + 6],
            body[cursor + 7],
        ]);
        let offset = u64::from_be_bytes([
            body[cursor + 8],
            body[cursor + 9],
            body[cursor + 10],
            body[cursor + 11],
            body[cursor + 12],
            body[cursor + 13],
            body[cursor + 14],
            body[cursor + 15],
        ]);

        let (want_offset, want_len) = expected[current];
        if rlen != want_len || offset != want_offset {
            return Err(Error::InvalidResponse(format!(
                "vector read chunk {} does not match the request: \
                 got ({}, {}), asked for ({}, {})",
                current, offset, rlen, want_offset, want_len
            )));
        }

        let data_start = cursor + 16;
        let data_end = data_start + rlen as usize;
        if data_end > body.len() {
            return Err(Error::InvalidResponse(
                "vector read chunk is truncated".into(),
            ));
        }

        chunks.push(ChunkInfo {
            offset,
            data: body[data_start..data_end].to_vec(),
        });
        size += rlen;
        cursor = data_end;
        current += 1;
    }

    Ok(VectorReadInfo { chunks, size })
}
