//! Request-head framing used for service identification.
//!
//! Only enough of the protocol is parsed to find the request path:
//!
//! HTTP/2 (gRPC):
//! - 24-byte connection preface `PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n`
//! - frames: 3 bytes length, 1 byte type, 1 byte flags, 4 bytes stream id
//! - frames before the first HEADERS frame are skipped
//! - HEADERS (+ CONTINUATION until END_HEADERS) is HPACK-decoded for `:path`
//!
//! HTTP/1.x:
//! - request line `METHOD SP request-target SP HTTP/1.x CRLF`
//!
//! The gRPC path `/pkg.Service/Method` identifies service `pkg.Service`.

use tracing::debug;

/// HTTP/2 client connection preface.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// HTTP/2 frame header length.
pub const FRAME_HEADER_LEN: usize = 9;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

/// Longest method token accepted while waiting for an HTTP/1 request line.
const MAX_METHOD_LEN: usize = 16;

/// Wire protocol detected on a client stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http2,
    Http1,
    Unknown,
}

/// The routing-relevant part of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub protocol: Protocol,
    /// Request path, if one was found.
    pub path: Option<String>,
    /// HTTP/2 stream carrying the request.
    pub stream_id: Option<u32>,
}

impl RequestHead {
    pub fn unidentified(protocol: Protocol, stream_id: Option<u32>) -> Self {
        Self {
            protocol,
            path: None,
            stream_id,
        }
    }

    /// Service identifier derived from the path.
    pub fn service(&self) -> Option<&str> {
        self.path.as_deref().and_then(service_from_path)
    }
}

/// Result of probing a buffered prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// More bytes are needed before a decision can be made.
    Incomplete(Protocol),
    /// The request head is complete (the path may still be absent).
    Complete(RequestHead),
}

/// Parsed HTTP/2 frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_LEN {
            return None;
        }
        let length = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | (data[2] as usize);
        let stream_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) & 0x7fff_ffff;
        Some(Self {
            length,
            kind: data[3],
            flags: data[4],
            stream_id,
        })
    }
}

/// Encode a single HTTP/2 frame.
pub fn encode_frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_be_bytes()[1..]);
    buf.push(kind);
    buf.push(flags);
    buf.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Inspect the bytes buffered so far.
pub fn probe(buf: &[u8]) -> Probe {
    if buf.is_empty() {
        return Probe::Incomplete(Protocol::Unknown);
    }

    let n = buf.len().min(H2_PREFACE.len());
    if buf[..n] == H2_PREFACE[..n] {
        if buf.len() < H2_PREFACE.len() {
            return Probe::Incomplete(Protocol::Http2);
        }
        return probe_h2_frames(&buf[H2_PREFACE.len()..]);
    }

    probe_http1(buf)
}

fn probe_h2_frames(frames: &[u8]) -> Probe {
    let mut pos = 0;

    loop {
        let Some(header) = FrameHeader::parse(&frames[pos..]) else {
            return Probe::Incomplete(Protocol::Http2);
        };
        let end = pos + FRAME_HEADER_LEN + header.length;
        if frames.len() < end {
            return Probe::Incomplete(Protocol::Http2);
        }

        match header.kind {
            FRAME_HEADERS => return probe_h2_headers(frames, header, pos),
            FRAME_CONTINUATION => {
                debug!("CONTINUATION frame before HEADERS");
                return Probe::Complete(RequestHead::unidentified(Protocol::Http2, None));
            }
            _ => pos = end,
        }
    }
}

/// Collect the header block starting at `pos` and decode `:path` from it.
fn probe_h2_headers(frames: &[u8], first: FrameHeader, mut pos: usize) -> Probe {
    let stream_id = first.stream_id;
    if stream_id == 0 {
        return Probe::Complete(RequestHead::unidentified(Protocol::Http2, None));
    }

    let payload = &frames[pos + FRAME_HEADER_LEN..pos + FRAME_HEADER_LEN + first.length];
    let Some(fragment) = headers_fragment(payload, first.flags) else {
        debug!(stream_id = stream_id, "Malformed HEADERS padding");
        return Probe::Complete(RequestHead::unidentified(Protocol::Http2, Some(stream_id)));
    };

    let mut block = fragment.to_vec();
    let mut flags = first.flags;
    pos += FRAME_HEADER_LEN + first.length;

    while flags & FLAG_END_HEADERS == 0 {
        let Some(next) = FrameHeader::parse(&frames[pos..]) else {
            return Probe::Incomplete(Protocol::Http2);
        };
        let end = pos + FRAME_HEADER_LEN + next.length;
        if frames.len() < end {
            return Probe::Incomplete(Protocol::Http2);
        }
        if next.kind != FRAME_CONTINUATION || next.stream_id != stream_id {
            debug!(stream_id = stream_id, "Header block interrupted");
            return Probe::Complete(RequestHead::unidentified(Protocol::Http2, Some(stream_id)));
        }

        block.extend_from_slice(&frames[pos + FRAME_HEADER_LEN..end]);
        flags = next.flags;
        pos = end;
    }

    Probe::Complete(RequestHead {
        protocol: Protocol::Http2,
        path: decode_path(&block),
        stream_id: Some(stream_id),
    })
}

/// Strip padding and priority fields from a HEADERS payload.
fn headers_fragment(payload: &[u8], flags: u8) -> Option<&[u8]> {
    let mut start = 0;
    let mut pad_len = 0;

    if flags & FLAG_PADDED != 0 {
        pad_len = *payload.first()? as usize;
        start = 1;
    }
    if flags & FLAG_PRIORITY != 0 {
        start += 5;
    }

    let end = payload.len().checked_sub(pad_len)?;
    if start > end {
        return None;
    }
    Some(&payload[start..end])
}

fn decode_path(block: &[u8]) -> Option<String> {
    let mut decoder = hpack::Decoder::new();
    let headers = match decoder.decode(block) {
        Ok(headers) => headers,
        Err(e) => {
            debug!(error = ?e, "HPACK decode failed");
            return None;
        }
    };

    headers
        .into_iter()
        .find(|(name, _)| name.as_slice() == b":path")
        .and_then(|(_, value)| String::from_utf8(value).ok())
}

fn probe_http1(buf: &[u8]) -> Probe {
    let unknown = || Probe::Complete(RequestHead::unidentified(Protocol::Unknown, None));

    let line_end = buf.windows(2).position(|w| w == b"\r\n");
    let line = match line_end {
        Some(i) => &buf[..i],
        None => buf,
    };

    let method_len = line.iter().take_while(|b| b.is_ascii_uppercase()).count();
    if method_len == 0 || method_len > MAX_METHOD_LEN {
        return unknown();
    }
    if method_len == line.len() {
        return match line_end {
            None => Probe::Incomplete(Protocol::Unknown),
            Some(_) => unknown(),
        };
    }
    if line[method_len] != b' ' {
        return unknown();
    }
    if line_end.is_none() {
        return Probe::Incomplete(Protocol::Http1);
    }

    let mut parts = line[method_len + 1..].rsplitn(2, |b| *b == b' ');
    match (parts.next(), parts.next()) {
        (Some(version), Some(target)) if version.starts_with(b"HTTP/1.") => {
            Probe::Complete(RequestHead {
                protocol: Protocol::Http1,
                path: std::str::from_utf8(target).ok().map(str::to_string),
                stream_id: None,
            })
        }
        _ => unknown(),
    }
}

/// Extract the service identifier from a request path.
///
/// `/greet.Greeter/SayHello` yields `greet.Greeter`. Absolute-form targets
/// (`http://host/svc/...`) are reduced to their path first.
pub fn service_from_path(path: &str) -> Option<&str> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let path = match path.split_once("://") {
        Some((_, rest)) => &rest[rest.find('/')?..],
        None => path,
    };

    let segment = path.strip_prefix('/')?.split('/').next()?;
    (!segment.is_empty()).then_some(segment)
}

/// Build the response sent to a client whose backend could not be reached.
///
/// HTTP/2 clients get a server SETTINGS frame, a trailers-only gRPC response
/// with `grpc-status: 14` (UNAVAILABLE) on the request stream, and a GOAWAY.
/// HTTP/1 clients get a `502 Bad Gateway`. Unknown protocols get nothing.
pub fn unavailable_response(head: &RequestHead, message: &str) -> Option<Vec<u8>> {
    match head.protocol {
        Protocol::Http2 => {
            let mut out = encode_frame(FRAME_SETTINGS, 0, 0, &[]);

            if let Some(stream_id) = head.stream_id {
                let mut encoder = hpack::Encoder::new();
                let block = encoder.encode(vec![
                    (&b":status"[..], &b"200"[..]),
                    (&b"content-type"[..], &b"application/grpc"[..]),
                    (&b"grpc-status"[..], &b"14"[..]),
                    (&b"grpc-message"[..], message.as_bytes()),
                ]);
                out.extend(encode_frame(
                    FRAME_HEADERS,
                    FLAG_END_STREAM | FLAG_END_HEADERS,
                    stream_id,
                    &block,
                ));
            }

            let mut goaway = Vec::with_capacity(8);
            goaway.extend_from_slice(&head.stream_id.unwrap_or(0).to_be_bytes());
            goaway.extend_from_slice(&0u32.to_be_bytes());
            out.extend(encode_frame(FRAME_GOAWAY, 0, 0, &goaway));
            Some(out)
        }
        Protocol::Http1 => Some(
            format!(
                "HTTP/1.1 502 Bad Gateway\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                message.len(),
                message
            )
            .into_bytes(),
        ),
        Protocol::Unknown => None,
    }
}
