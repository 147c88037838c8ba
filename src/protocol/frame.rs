// Multiplex frame codec — one self-delimited binary frame per transport message.
//
// All integers are big-endian, strings are UTF-8, header maps are the JSON
// serialization of a string-to-string object. Every frame starts with:
//   1 byte  frame kind
//   4 bytes request_id / connection_id (u32)
// followed by a kind-specific tail. The codec is pure: no I/O, no allocation
// beyond the output buffer, and decoding never reads past the input slice.

use std::collections::BTreeMap;

use thiserror::Error;

/// Header maps travel as JSON object bytes; BTreeMap keeps the encoding stable.
pub type HeaderMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    HttpRequest = 0x01,
    HttpResponse = 0x02,
    WsConnect = 0x10,
    WsData = 0x11,
    WsClose = 0x12,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameKind::HttpRequest),
            0x02 => Some(FrameKind::HttpResponse),
            0x10 => Some(FrameKind::WsConnect),
            0x11 => Some(FrameKind::WsData),
            0x12 => Some(FrameKind::WsClose),
            _ => None,
        }
    }
}

/// WebSocket opcodes carried in WS_DATA frames (RFC 6455 values).
pub mod opcode {
    pub const CONTINUATION: u8 = 0x00;
    pub const TEXT: u8 = 0x01;
    pub const BINARY: u8 = 0x02;
    pub const CLOSE: u8 = 0x08;
    pub const PING: u8 = 0x09;
    pub const PONG: u8 = 0x0A;
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("insufficient data for {0}")]
    Truncated(&'static str),

    #[error("expected frame kind 0x{expected:02x}, got 0x{got:02x}")]
    UnexpectedKind { expected: u8, got: u8 },

    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("invalid header map: {0}")]
    Headers(String),

    #[error("invalid UTF-8 in {0}")]
    Utf8(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestFrame {
    pub request_id: u32,
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseFrame {
    pub request_id: u32,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsConnectFrame {
    pub connection_id: u32,
    pub url: String,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsDataFrame {
    pub connection_id: u32,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub connection_id: u32,
    pub close_code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    HttpRequest(HttpRequestFrame),
    HttpResponse(HttpResponseFrame),
    WsConnect(WsConnectFrame),
    WsData(WsDataFrame),
    WsClose(WsCloseFrame),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::HttpRequest(_) => FrameKind::HttpRequest,
            Frame::HttpResponse(_) => FrameKind::HttpResponse,
            Frame::WsConnect(_) => FrameKind::WsConnect,
            Frame::WsData(_) => FrameKind::WsData,
            Frame::WsClose(_) => FrameKind::WsClose,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::HttpRequest(f) => f.encode(),
            Frame::HttpResponse(f) => f.encode(),
            Frame::WsConnect(f) => f.encode(),
            Frame::WsData(f) => f.encode(),
            Frame::WsClose(f) => f.encode(),
        }
    }

    /// Decode any frame, switching on the kind byte.
    pub fn decode(data: &[u8]) -> Result<Frame, FrameError> {
        let first = *data.first().ok_or(FrameError::Truncated("frame kind"))?;
        match FrameKind::from_byte(first).ok_or(FrameError::UnknownKind(first))? {
            FrameKind::HttpRequest => HttpRequestFrame::decode(data).map(Frame::HttpRequest),
            FrameKind::HttpResponse => HttpResponseFrame::decode(data).map(Frame::HttpResponse),
            FrameKind::WsConnect => WsConnectFrame::decode(data).map(Frame::WsConnect),
            FrameKind::WsData => WsDataFrame::decode(data).map(Frame::WsData),
            FrameKind::WsClose => WsCloseFrame::decode(data).map(Frame::WsClose),
        }
    }
}

/// Best-effort extraction of the request/connection id (the u32 after the
/// kind byte). Used to correlate error responses for frames that fail to
/// decode.
pub fn peek_frame_id(data: &[u8]) -> Option<u32> {
    if data.len() < 5 {
        return None;
    }
    Some(u32::from_be_bytes([data[1], data[2], data[3], data[4]]))
}

// -- Per-kind encode/decode --

impl HttpRequestFrame {
    pub fn encode(&self) -> Vec<u8> {
        let headers = encode_headers(&self.headers);
        let mut out = Vec::with_capacity(
            14 + self.method.len() + self.path.len() + headers.len() + self.body.len(),
        );
        out.push(FrameKind::HttpRequest as u8);
        out.extend_from_slice(&self.request_id.to_be_bytes());
        out.extend_from_slice(&(self.method.len() as u16).to_be_bytes());
        out.extend_from_slice(self.method.as_bytes());
        out.extend_from_slice(&(self.path.len() as u16).to_be_bytes());
        out.extend_from_slice(self.path.as_bytes());
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        out.extend_from_slice(&headers);
        out.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let mut r = Reader::new(data);
        r.expect_kind(FrameKind::HttpRequest)?;
        let request_id = r.read_u32("request_id")?;
        let method = r.read_short_string("method")?;
        let path = r.read_short_string("path")?;
        let headers = r.read_headers()?;
        let body = r.read_long_bytes("body")?.to_vec();
        Ok(Self {
            request_id,
            method,
            path,
            headers,
            body,
        })
    }
}

impl HttpResponseFrame {
    pub fn encode(&self) -> Vec<u8> {
        let headers = encode_headers(&self.headers);
        let mut out = Vec::with_capacity(15 + headers.len() + self.body.len());
        out.push(FrameKind::HttpResponse as u8);
        out.extend_from_slice(&self.request_id.to_be_bytes());
        out.extend_from_slice(&self.status.to_be_bytes());
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        out.extend_from_slice(&headers);
        out.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let mut r = Reader::new(data);
        r.expect_kind(FrameKind::HttpResponse)?;
        let request_id = r.read_u32("request_id")?;
        let status = r.read_u16("status")?;
        let headers = r.read_headers()?;
        let body = r.read_long_bytes("body")?.to_vec();
        Ok(Self {
            request_id,
            status,
            headers,
            body,
        })
    }
}

impl WsConnectFrame {
    pub fn encode(&self) -> Vec<u8> {
        let headers = encode_headers(&self.headers);
        let mut out = Vec::with_capacity(11 + self.url.len() + headers.len());
        out.push(FrameKind::WsConnect as u8);
        out.extend_from_slice(&self.connection_id.to_be_bytes());
        out.extend_from_slice(&(self.url.len() as u16).to_be_bytes());
        out.extend_from_slice(self.url.as_bytes());
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        out.extend_from_slice(&headers);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let mut r = Reader::new(data);
        r.expect_kind(FrameKind::WsConnect)?;
        let connection_id = r.read_u32("connection_id")?;
        let url = r.read_short_string("url")?;
        let headers = r.read_headers()?;
        Ok(Self {
            connection_id,
            url,
            headers,
        })
    }
}

impl WsDataFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.payload.len());
        out.push(FrameKind::WsData as u8);
        out.extend_from_slice(&self.connection_id.to_be_bytes());
        out.push(self.opcode);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let mut r = Reader::new(data);
        r.expect_kind(FrameKind::WsData)?;
        let connection_id = r.read_u32("connection_id")?;
        let opcode = r.read_u8("opcode")?;
        let payload = r.read_long_bytes("payload")?.to_vec();
        Ok(Self {
            connection_id,
            opcode,
            payload,
        })
    }
}

impl WsCloseFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.reason.len());
        out.push(FrameKind::WsClose as u8);
        out.extend_from_slice(&self.connection_id.to_be_bytes());
        out.extend_from_slice(&self.close_code.to_be_bytes());
        out.extend_from_slice(&(self.reason.len() as u16).to_be_bytes());
        out.extend_from_slice(self.reason.as_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let mut r = Reader::new(data);
        r.expect_kind(FrameKind::WsClose)?;
        let connection_id = r.read_u32("connection_id")?;
        let close_code = r.read_u16("close_code")?;
        let reason_bytes = r.read_short_bytes("reason")?;
        let reason = std::str::from_utf8(reason_bytes)
            .map_err(|_| FrameError::Utf8("reason"))?
            .to_string();
        Ok(Self {
            connection_id,
            close_code,
            reason,
        })
    }
}

fn encode_headers(headers: &HeaderMap) -> Vec<u8> {
    // A map of strings never fails to serialize.
    serde_json::to_vec(headers).unwrap_or_else(|_| b"{}".to_vec())
}

/// Bounds-checked cursor over the input slice.
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], FrameError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(FrameError::Truncated(what))?;
        if end > self.data.len() {
            return Err(FrameError::Truncated(what));
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn expect_kind(&mut self, expected: FrameKind) -> Result<(), FrameError> {
        let got = self.read_u8("frame kind")?;
        if got != expected as u8 {
            return Err(FrameError::UnexpectedKind {
                expected: expected as u8,
                got,
            });
        }
        Ok(())
    }

    fn read_u8(&mut self, what: &'static str) -> Result<u8, FrameError> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u16(&mut self, what: &'static str) -> Result<u16, FrameError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, FrameError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// u16 length prefix followed by that many bytes.
    fn read_short_bytes(&mut self, what: &'static str) -> Result<&'a [u8], FrameError> {
        let len = self.read_u16(what)? as usize;
        self.take(len, what)
    }

    /// u32 length prefix followed by that many bytes.
    fn read_long_bytes(&mut self, what: &'static str) -> Result<&'a [u8], FrameError> {
        let len = self.read_u32(what)? as usize;
        self.take(len, what)
    }

    fn read_short_string(&mut self, what: &'static str) -> Result<String, FrameError> {
        let bytes = self.read_short_bytes(what)?;
        Ok(std::str::from_utf8(bytes)
            .map_err(|_| FrameError::Utf8(what))?
            .to_string())
    }

    fn read_headers(&mut self) -> Result<HeaderMap, FrameError> {
        let bytes = self.read_long_bytes("headers")?;
        serde_json::from_slice(bytes).map_err(|e| FrameError::Headers(e.to_string()))
    }
}
