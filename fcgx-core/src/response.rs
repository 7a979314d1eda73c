use crate::error::{Error, Result};
use bytes::Bytes;
use tracing::warn;

pub const DEFAULT_STATUS: &str = "200 OK";

/// Reason token appended to a `Status` value that carries only a code.
pub const STATUS_REASON_FALLBACK: &str = "FCGIApp";

/// A worker response translated from its CGI output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiResponse {
    /// Status line without the protocol, e.g. `404 Not Found`.
    pub status: String,
    /// Header names lower-cased, in the order the worker emitted them.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CgiResponse {
    /// Numeric part of the status line, if it parses.
    pub fn status_code(&self) -> Option<u16> {
        self.status.split_whitespace().next()?.parse().ok()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse the stdout of a CGI-style worker.
///
/// Lines end at a single `\n`; each line is trimmed, so a trailing `\r` is
/// tolerated. The first blank line ends the header block and everything
/// after it is the body, verbatim. Header lines split on the first colon.
pub fn parse_cgi_output(data: &[u8]) -> Result<CgiResponse> {
    if !data.contains(&b'\n') {
        return Err(Error::MalformedResponse);
    }

    let mut status = DEFAULT_STATUS.to_string();
    let mut headers = Vec::new();
    let mut pos = 0usize;

    while let Some(offset) = data[pos..].iter().position(|b| *b == b'\n') {
        let raw = &data[pos..pos + offset];
        pos += offset + 1;

        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            warn!(line = %line, "skipping CGI header line without a colon");
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        if name == "status" {
            status = if value.contains(' ') {
                value.to_string()
            } else {
                format!("{value} {STATUS_REASON_FALLBACK}")
            };
        } else {
            headers.push((name, value.to_string()));
        }
    }

    Ok(CgiResponse {
        status,
        headers,
        body: Bytes::copy_from_slice(&data[pos..]),
    })
}
