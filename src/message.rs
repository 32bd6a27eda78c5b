use bytes::{Bytes, BytesMut};

/// A length-prefixed wire frame.
///
/// The buffer always holds network byte order; host-order access goes
/// through the typed codecs in [`crate::protocol`]. The cursor tracks
/// reassembly progress while a frame is being read off a non-blocking
/// socket, and the session-id tag is stamped by the stream on arrival so
/// that replies from a dead session can be told apart from fresh ones.
#[derive(Debug, Default)]
pub struct Message {
    buf: BytesMut,
    cursor: usize,
    session_id: u64,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(data),
            cursor: data.len(),
            session_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Grow (or shrink) the buffer, zero-filling new space.
    pub fn resize(&mut self, len: usize) {
        self.buf.resize(len, 0);
    }

    /// A cheap owned snapshot of the frame bytes.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn advance_cursor(&mut self, n: usize) {
        self.cursor += n;
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn set_session_id(&mut self, id: u64) {
        self.session_id = id;
    }
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Self {
            buf: self.buf.clone(),
            cursor: self.cursor,
            session_id: self.session_id,
        }
    }
}
