//! Worker side of the Responder role: read one request, write its output.
//!
//! This is what a FastCGI worker does with the records the bridge sends.
//! The reference worker binary and the test suites use it.

use crate::error::{Error, Result};
use crate::name_value::{decode_pairs, decode_pairs_to_map, encode_pairs};
use crate::record::{
    read_record, write_end_request, write_record, write_stream, BeginRequestBody, EndRequestBody,
    Record, RecordType, FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS, FCGI_NULL_REQUEST_ID,
    FCGI_REQUEST_COMPLETE, FCGI_RESPONDER, FCGI_UNKNOWN_ROLE,
};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// A fully received Responder request.
#[derive(Debug)]
pub struct FcgiRequest {
    pub request_id: u16,
    pub keep_conn: bool,
    pub params: HashMap<String, String>,
    pub stdin: Bytes,
}

/// Size limits applied while buffering a request.
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub max_params_bytes: usize,
    pub max_stdin_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_params_bytes: 1_048_576,  // 1 MiB
            max_stdin_bytes: 33_554_432, // 32 MiB
        }
    }
}

/// Values this responder advertises in GetValuesResult.
fn advertised_value(name: &[u8]) -> Option<&'static str> {
    match name {
        n if n == FCGI_MAX_CONNS.as_bytes() => Some("1"),
        n if n == FCGI_MAX_REQS.as_bytes() => Some("1"),
        n if n == FCGI_MPXS_CONNS.as_bytes() => Some("0"),
        _ => None,
    }
}

/// Answer a management record (request id 0).
pub async fn handle_management_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    rec: &Record,
) -> Result<()> {
    match rec.kind() {
        Some(RecordType::GetValues) => {
            let mut answered = Vec::new();
            for pair in decode_pairs(&rec.content) {
                let (name, _) = pair?;
                if let Some(value) = advertised_value(name) {
                    answered.push((name.to_vec(), value));
                }
            }
            let content = encode_pairs(answered.iter().map(|(k, v)| (k, *v)));
            write_record(
                writer,
                RecordType::GetValuesResult,
                FCGI_NULL_REQUEST_ID,
                &content,
            )
            .await
        }
        _ => {
            let mut body = [0u8; 8];
            body[0] = rec.header.record_type;
            write_record(writer, RecordType::UnknownType, FCGI_NULL_REQUEST_ID, &body).await
        }
    }
}

/// Read records for `request_id` until the stream of `expected` type ends,
/// answering management records along the way.
async fn read_stream<R, W>(
    reader: &mut R,
    writer: &mut W,
    request_id: u16,
    expected: RecordType,
    limit: usize,
) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    loop {
        let rec = read_record(reader).await?;
        if rec.request_id() == FCGI_NULL_REQUEST_ID {
            handle_management_record(writer, &rec).await?;
            continue;
        }
        if rec.request_id() != request_id {
            return Err(Error::ProtocolDecode(format!(
                "multiplexing not supported: expected request_id {}, got {}",
                request_id,
                rec.request_id()
            )));
        }
        match rec.kind() {
            Some(RecordType::AbortRequest) => {
                return Err(Error::ProtocolDecode("request aborted by client".into()))
            }
            Some(kind) if kind == expected => {}
            _ => {
                return Err(Error::ProtocolDecode(format!(
                    "expected {:?}, got type {}",
                    expected, rec.header.record_type
                )))
            }
        }
        if rec.content.is_empty() {
            return Ok(buf);
        }
        if buf.len() + rec.content.len() > limit {
            return Err(Error::ProtocolDecode(format!(
                "{:?} exceeds size limit ({} bytes)",
                expected, limit
            )));
        }
        buf.extend_from_slice(&rec.content);
    }
}

/// Read BeginRequest, Params and Stdin for one request.
///
/// A non-Responder role is answered with an `UnknownRole` EndRequest and
/// reported as an error.
pub async fn read_request<R, W>(
    reader: &mut R,
    writer: &mut W,
    limits: &RequestLimits,
) -> Result<FcgiRequest>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (request_id, begin) = loop {
        let rec = read_record(reader).await?;
        if rec.request_id() == FCGI_NULL_REQUEST_ID {
            handle_management_record(writer, &rec).await?;
            continue;
        }
        if rec.kind() != Some(RecordType::BeginRequest) {
            return Err(Error::ProtocolDecode(format!(
                "expected BeginRequest, got type {}",
                rec.header.record_type
            )));
        }
        break (rec.request_id(), BeginRequestBody::decode(&rec.content)?);
    };

    if begin.role != FCGI_RESPONDER {
        write_end_request(
            writer,
            request_id,
            EndRequestBody {
                app_status: 0,
                protocol_status: FCGI_UNKNOWN_ROLE,
            },
        )
        .await?;
        return Err(Error::ProtocolDecode(format!(
            "unsupported FastCGI role: {}",
            begin.role
        )));
    }

    let params = read_stream(
        reader,
        writer,
        request_id,
        RecordType::Params,
        limits.max_params_bytes,
    )
    .await?;
    let params = decode_pairs_to_map(&params)?;

    let stdin = read_stream(
        reader,
        writer,
        request_id,
        RecordType::Stdin,
        limits.max_stdin_bytes,
    )
    .await?;

    debug!(
        request_id,
        params = params.len(),
        stdin_bytes = stdin.len(),
        "received FastCGI request"
    );
    Ok(FcgiRequest {
        request_id,
        keep_conn: begin.keep_conn(),
        params,
        stdin: stdin.freeze(),
    })
}

/// Write a complete response: stderr stream (if any), stdout stream, then
/// EndRequest with `app_status`.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request_id: u16,
    stdout: &[u8],
    stderr: &[u8],
    app_status: u32,
) -> Result<()> {
    if !stderr.is_empty() {
        write_stream(writer, RecordType::Stderr, request_id, stderr).await?;
    }
    write_stream(writer, RecordType::Stdout, request_id, stdout).await?;
    write_end_request(
        writer,
        request_id,
        EndRequestBody {
            app_status,
            protocol_status: FCGI_REQUEST_COMPLETE,
        },
    )
    .await
}
