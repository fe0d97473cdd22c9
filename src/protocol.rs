//! FastCGI record codec.
//!
//! Framing, name-value pair decoding, and the draining reads and
//! size-limited writes the rest of the runtime is built on.
//
// What a request and response looks like on the wire:
//
//     {FCGI_BEGIN_REQUEST,   1, {FCGI_RESPONDER, 0}}
//     {FCGI_PARAMS,          1, "\013\002SERVER_PORT80\013\016SER"}
//     {FCGI_PARAMS,          1, "VER_ADDR199.170.183.42 ... "}
//     {FCGI_PARAMS,          1, ""}
//     {FCGI_STDIN,           1, "quantity=100&item=3047936"}
//     {FCGI_STDIN,           1, ""}
//
//         {FCGI_STDOUT,      1, "Status: 200 OK\r\nContent-type: ... "}
//         {FCGI_STDOUT,      1, ""}
//         {FCGI_END_REQUEST, 1, {0, FCGI_REQUEST_COMPLETE}}
//
// Ref: https://www.mit.edu/~yandros/doc/specs/fcgi-spec.html

use crate::error::{FcgiError, FcgiResult};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::collections::HashMap;
use std::io::{self, Read, Write};

/// Length of the record header in bytes.
pub const FCGI_HEADER_LEN: usize = 8;
/// The only protocol version there is.
pub const FCGI_VERSION_1: u8 = 1;
/// Maximum content length of a single record.
pub const FCGI_MAX_LENGTH: usize = 0xffff;
/// Bit 0 of the BEGIN_REQUEST flags byte.
pub const FCGI_KEEP_CONN: u8 = 1;

/// Send/receive unit: one header plus up to 8184 content bytes.
pub const PACKET_IO_LEN: usize = 8192;
/// Content capacity of one send unit.
pub const PACKET_IO_CONTENT_LEN: usize = PACKET_IO_LEN - FCGI_HEADER_LEN;

/// Parameter key carrying the declared request body size.
pub const PARAM_CONTENT_LENGTH: &str = "CONTENT_LENGTH";

/// Type of FCGI record. Ingress is almost always BeginRequest, Params,
/// or Stdin.
#[derive(Debug, FromPrimitive, ToPrimitive, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

/// Type of transaction. Only Responder is implemented.
#[derive(Debug, FromPrimitive, ToPrimitive, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Respond to a request
    Responder = 1,
    /// Authorization (unimplemented)
    Authorizer = 2,
    /// Filter (unimplemented)
    Filter = 3,
}

/// Protocol status carried by END_REQUEST.
#[derive(Debug, FromPrimitive, ToPrimitive, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    /// Normal
    RequestComplete = 0,
    /// Saw more than one request ID
    CantMpxConn = 1,
    /// Too busy
    Overloaded = 2,
    /// Something other than Responder
    UnknownRole = 3,
}

/// FCGI record header, deserialized.
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub version: u8,
    /// Record type
    pub rec_type: RecordType,
    /// Request ID
    pub request_id: u16,
    /// Length of content, in bytes
    pub content_length: u16,
    /// Length of padding, in bytes
    pub padding_length: u8,
}

impl RecordHeader {
    /// Header for emission: padding rounds the content up to the next
    /// multiple of 8.
    pub fn new(rec_type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: FCGI_VERSION_1,
            rec_type,
            request_id,
            content_length,
            padding_length: Self::calc_padding_length(content_length),
        }
    }

    /// Padding needed to round content up to the next multiple of 8.
    pub fn calc_padding_length(content_length: u16) -> u8 {
        ((8 - (content_length & 0x7)) & 0x7) as u8
    }

    /// Deserialize 8 bytes to a header.
    pub fn from_bytes(b: &[u8; FCGI_HEADER_LEN]) -> FcgiResult<RecordHeader> {
        if b[0] != FCGI_VERSION_1 {
            return Err(FcgiError::Protocol(format!("bad FCGI version {}", b[0])));
        }
        Ok(RecordHeader {
            version: b[0],
            rec_type: RecordType::from_u8(b[1])
                .ok_or_else(|| FcgiError::Protocol(format!("invalid record type {}", b[1])))?,
            request_id: u16::from_be_bytes([b[2], b[3]]),
            content_length: u16::from_be_bytes([b[4], b[5]]),
            padding_length: b[6],
        })
    }

    /// Serialize a header to 8 bytes.
    pub fn to_bytes(&self) -> [u8; FCGI_HEADER_LEN] {
        let id_bytes = self.request_id.to_be_bytes();
        let content_length_bytes = self.content_length.to_be_bytes();
        [
            self.version,
            self.rec_type as u8,
            id_bytes[0],
            id_bytes[1],
            content_length_bytes[0],
            content_length_bytes[1],
            self.padding_length,
            0, // reserved
        ]
    }
}

/// One record: a header and its content. Padding is read and dropped.
#[derive(Debug)]
pub struct Record {
    pub header: RecordHeader,
    pub content: Vec<u8>,
}

/// Fully draining read. A short read on a blocking socket means the
/// peer went away mid-record.
fn read_fully(conn: &mut impl Read, buf: &mut [u8]) -> FcgiResult<()> {
    conn.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FcgiError::ConnectionClosed
        } else {
            FcgiError::Io(e)
        }
    })
}

/// Read one record from the stream.
pub fn read_record(conn: &mut impl Read) -> FcgiResult<Record> {
    let mut header_bytes = [0u8; FCGI_HEADER_LEN];
    read_fully(conn, &mut header_bytes)?;
    let header = RecordHeader::from_bytes(&header_bytes)?;

    let nbuff = header.content_length as usize + header.padding_length as usize;
    let mut buff = vec![0u8; nbuff];
    if nbuff > 0 {
        read_fully(conn, &mut buff)?;
    }
    buff.truncate(header.content_length as usize);

    Ok(Record {
        header,
        content: buff,
    })
}

/// Write one record: header, content, padding zeros.
fn write_one_record(
    conn: &mut impl Write,
    rec_type: RecordType,
    request_id: u16,
    content: &[u8],
) -> FcgiResult<usize> {
    let header = RecordHeader::new(rec_type, request_id, content.len() as u16);
    conn.write_all(&header.to_bytes())?;
    conn.write_all(content)?;
    let padding = header.padding_length as usize;
    if padding > 0 {
        conn.write_all(&[0u8; 8][..padding])?;
    }
    Ok(FCGI_HEADER_LEN + content.len() + padding)
}

/// Send content as one or more records of the given type. Payloads
/// larger than one send unit are split; every record carries its own
/// header and padding. Empty content is the end-of-stream marker for
/// the STDIN/STDOUT/STDERR stream types.
pub fn send_record(
    conn: &mut impl Write,
    rec_type: RecordType,
    request_id: u16,
    content: &[u8],
) -> FcgiResult<usize> {
    let mut sum_send = 0;
    let mut rest = content;
    let mut first = true;
    while first || !rest.is_empty() {
        first = false;
        let take = rest.len().min(PACKET_IO_CONTENT_LEN);
        let (part, tail) = rest.split_at(take);
        rest = tail;
        sum_send += write_one_record(conn, rec_type, request_id, part)?;
    }
    conn.flush()?;
    Ok(sum_send)
}

/// Body of a BEGIN_REQUEST record.
#[derive(Debug, Clone)]
pub struct BeginRequestBody {
    /// Raw role value; compare against [`Role`].
    pub role: u16,
    /// Flags byte; bit 0 is FCGI_KEEP_CONN.
    pub flags: u8,
}

impl BeginRequestBody {
    pub fn from_content(content: &[u8]) -> FcgiResult<BeginRequestBody> {
        if content.len() < 8 {
            return Err(FcgiError::Protocol(format!(
                "short BEGIN_REQUEST body ({} bytes)",
                content.len()
            )));
        }
        Ok(BeginRequestBody {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        })
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FCGI_KEEP_CONN != 0
    }
}

/// Body of an END_REQUEST record.
#[derive(Debug, Clone)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    pub fn to_bytes(&self) -> [u8; 8] {
        let status = self.app_status.to_be_bytes();
        [
            status[0],
            status[1],
            status[2],
            status[3],
            self.protocol_status as u8,
            0,
            0,
            0, // reserved
        ]
    }
}

/// Fetch one encoded length field.
/// 0..127 is one byte. If the first byte has the top bit set, it starts
/// a 4-byte big-endian length with the top bit masked off.
fn fetch_field_length<'a>(
    pos: &mut impl Iterator<Item = &'a u8>,
) -> FcgiResult<Option<usize>> {
    let Some(b0) = pos.next() else {
        return Ok(None); // end of buffer
    };
    if *b0 > 127 {
        let mut rest = [0u8; 3];
        for b in rest.iter_mut() {
            *b = *pos
                .next()
                .ok_or_else(|| FcgiError::Protocol("EOF reading multi-byte param length".into()))?;
        }
        Ok(Some(
            (((*b0 & 0x7f) as usize) << 24)
                + ((rest[0] as usize) << 16)
                + ((rest[1] as usize) << 8)
                + rest[2] as usize,
        ))
    } else {
        Ok(Some(*b0 as usize))
    }
}

/// Fetch a param field of the requested length as UTF-8.
fn fetch_field<'a>(cnt: usize, pos: &mut impl Iterator<Item = &'a u8>) -> FcgiResult<String> {
    let mut b = Vec::with_capacity(cnt);
    for _ in 0..cnt {
        let ch = pos
            .next()
            .ok_or_else(|| FcgiError::Protocol("EOF reading param field".into()))?;
        b.push(*ch);
    }
    String::from_utf8(b).map_err(|e| FcgiError::Protocol(format!("param is not UTF-8: {e}")))
}

/// "FastCGI transmits a name-value pair as the length of the name,
/// followed by the length of the value, followed by the name, followed
/// by the value." - FCGI spec
fn fetch_name_value_pair<'a>(
    pos: &mut impl Iterator<Item = &'a u8>,
) -> FcgiResult<Option<(String, String)>> {
    let Some(kcnt) = fetch_field_length(pos)? else {
        return Ok(None);
    };
    let Some(vcnt) = fetch_field_length(pos)? else {
        return Err(FcgiError::Protocol(
            "EOF reading length of param value field".into(),
        ));
    };
    Ok(Some((fetch_field(kcnt, pos)?, fetch_field(vcnt, pos)?)))
}

/// Decode a name-value stream into a map. Duplicate keys: last wins.
pub fn decode_params(buf: &[u8]) -> FcgiResult<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut pos = buf.iter();
    while let Some((name, value)) = fetch_name_value_pair(&mut pos)? {
        log::debug!("param: \"{}\" = \"{}\"", name, value);
        params.insert(name, value);
    }
    Ok(params)
}
