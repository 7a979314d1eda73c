use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Protocol version carried in every record header.
pub const FCGI_VERSION_1: u8 = 1;

/// Request id reserved for management records.
pub const FCGI_NULL_REQUEST_ID: u16 = 0;

/// Largest content a single record can carry.
pub const MAX_CONTENT_LEN: usize = 65535;

pub const HEADER_LEN: usize = 8;

// Roles.
pub const FCGI_RESPONDER: u16 = 1;
pub const FCGI_AUTHORIZER: u16 = 2;
pub const FCGI_FILTER: u16 = 3;

// BeginRequest flags.
pub const FCGI_KEEP_CONN: u8 = 1;

// EndRequest protocol status.
pub const FCGI_REQUEST_COMPLETE: u8 = 0;
pub const FCGI_CANT_MPX_CONN: u8 = 1;
pub const FCGI_OVERLOADED: u8 = 2;
pub const FCGI_UNKNOWN_ROLE: u8 = 3;

// GetValues variable names.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
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

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            _ => return None,
        })
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Padding that brings `content_len` up to the next multiple of eight.
pub const fn padding_for(content_len: usize) -> u8 {
    ((8 - (content_len % 8)) % 8) as u8
}

/// Fixed 8-byte FastCGI record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub const SIZE: usize = HEADER_LEN;

    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: FCGI_VERSION_1,
            record_type: record_type.as_u8(),
            request_id,
            content_length,
            padding_length: padding_for(content_length as usize),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let id = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.record_type,
            id[0],
            id[1],
            len[0],
            len[1],
            self.padding_length,
            0, // reserved
        ]
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }
    }

    /// Bytes this record occupies on the wire, header included.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.content_length as usize + self.padding_length as usize
    }
}

/// A complete FastCGI record (header + content, padding already discarded).
#[derive(Debug, Clone)]
pub struct Record {
    pub header: RecordHeader,
    pub content: Bytes,
}

impl Record {
    /// The record type, or `None` for a type this implementation does not know.
    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_u8(self.header.record_type)
    }

    pub fn request_id(&self) -> u16 {
        self.header.request_id
    }
}

/// Body of a BeginRequest record: `role(2) flags(1) reserved(5)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequestBody {
    pub fn responder() -> Self {
        Self {
            role: FCGI_RESPONDER,
            flags: 0,
        }
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FCGI_KEEP_CONN != 0
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut body = [0u8; 8];
        body[0..2].copy_from_slice(&self.role.to_be_bytes());
        body[2] = self.flags;
        body
    }

    pub fn decode(content: &[u8]) -> Result<Self> {
        if content.len() < 3 {
            return Err(Error::decode(format!(
                "BeginRequest body too short: {} bytes",
                content.len()
            )));
        }
        Ok(Self {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        })
    }
}

/// Body of an EndRequest record: `appStatus(4) protocolStatus(1) reserved(3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: u8,
}

impl EndRequestBody {
    pub fn encode(&self) -> [u8; 8] {
        let mut body = [0u8; 8];
        body[0..4].copy_from_slice(&self.app_status.to_be_bytes());
        body[4] = self.protocol_status;
        body
    }

    pub fn decode(content: &[u8]) -> Result<Self> {
        if content.len() < 5 {
            return Err(Error::decode(format!(
                "EndRequest body too short: {} bytes",
                content.len()
            )));
        }
        Ok(Self {
            app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
            protocol_status: content[4],
        })
    }
}

fn map_read_err(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::ProtocolEof
    } else {
        Error::Io(err)
    }
}

/// Read one FastCGI record.
///
/// Short reads are retried until the header and then the content plus
/// padding are complete. A peer that closes before that, even in the middle
/// of the header, yields [`Error::ProtocolEof`].
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Record> {
    let mut hdr_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut hdr_buf).await.map_err(map_read_err)?;
    let header = RecordHeader::decode(&hdr_buf);

    if header.version != FCGI_VERSION_1 {
        return Err(Error::decode(format!(
            "unsupported FastCGI version: {} (expected {})",
            header.version, FCGI_VERSION_1
        )));
    }

    let content_len = header.content_length as usize;
    let total = content_len + header.padding_length as usize;
    let mut buf = BytesMut::zeroed(total);
    if total > 0 {
        reader.read_exact(&mut buf).await.map_err(map_read_err)?;
    }
    buf.truncate(content_len);

    trace!(
        record_type = header.record_type,
        request_id = header.request_id,
        content_length = content_len,
        "read record"
    );
    Ok(Record {
        header,
        content: buf.freeze(),
    })
}

/// Write one FastCGI record; padding is computed and zero-filled here.
///
/// `write_all` resumes after short writes and waits for writability when the
/// socket would block; any other transport failure surfaces as
/// [`Error::Io`].
pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
) -> Result<()> {
    if content.len() > MAX_CONTENT_LEN {
        return Err(Error::RecordTooLarge(content.len()));
    }
    let header = RecordHeader::new(record_type, request_id, content.len() as u16);
    writer.write_all(&header.encode()).await?;
    if !content.is_empty() {
        writer.write_all(content).await?;
    }
    let padding = header.padding_length as usize;
    if padding > 0 {
        const PAD: [u8; 8] = [0u8; 8];
        writer.write_all(&PAD[..padding]).await?;
    }
    trace!(
        record_type = header.record_type,
        request_id,
        content_length = content.len(),
        "wrote record"
    );
    Ok(())
}

/// Write `data` as a stream: as many full-size records as needed, then the
/// empty record that terminates the stream.
pub async fn write_stream<W: AsyncWrite + Unpin>(
    writer: &mut W,
    record_type: RecordType,
    request_id: u16,
    data: &[u8],
) -> Result<()> {
    for chunk in data.chunks(MAX_CONTENT_LEN) {
        write_record(writer, record_type, request_id, chunk).await?;
    }
    write_record(writer, record_type, request_id, &[]).await
}

pub async fn write_begin_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request_id: u16,
    body: BeginRequestBody,
) -> Result<()> {
    write_record(writer, RecordType::BeginRequest, request_id, &body.encode()).await
}

pub async fn write_end_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request_id: u16,
    body: EndRequestBody,
) -> Result<()> {
    write_record(writer, RecordType::EndRequest, request_id, &body.encode()).await
}
