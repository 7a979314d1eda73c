use bytes::{Bytes, BytesMut};
use fcgx_core::name_value::{decode_pairs_to_map, encode_pairs};
use fcgx_core::record::{
    read_record, write_begin_request, write_record, write_stream, BeginRequestBody,
    EndRequestBody, RecordType, FCGI_NULL_REQUEST_ID, FCGI_REQUEST_COMPLETE,
};
use fcgx_core::response::{parse_cgi_output, CgiResponse};
use fcgx_core::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Every session carries exactly one request on its own connection.
pub const REQUEST_ID: u16 = 1;

/// Request bodies are forwarded in Stdin records of at most this size.
pub const STDIN_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connected,
    ParamsWritten,
    StdinStreaming,
    AwaitingOutput,
    Done,
    Failed,
}

/// Receives the worker's Stderr stream. Never mixed into the response body.
pub trait StderrSink: Send {
    fn write_stderr(&mut self, chunk: &[u8]);
}

impl StderrSink for Vec<u8> {
    fn write_stderr(&mut self, chunk: &[u8]) {
        self.extend_from_slice(chunk);
    }
}

/// Forwards worker stderr to the log.
#[derive(Debug, Clone, Default)]
pub struct TracingStderr {
    script: String,
}

impl TracingStderr {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl StderrSink for TracingStderr {
    fn write_stderr(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        warn!(script = %self.script, stderr = %text.trim_end(), "FastCGI worker stderr");
    }
}

/// Open a fresh connection to the worker.
pub async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| Error::Connection { addr, source })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// One FastCGI exchange over an owned transport.
///
/// The transport is shut down and dropped when [`Session::run`] returns,
/// whether the exchange succeeded or not.
pub struct Session<S> {
    stream: S,
    phase: Phase,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        let mut session = Self {
            stream,
            phase: Phase::Idle,
        };
        session.advance(Phase::Connected);
        session
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn advance(&mut self, next: Phase) {
        trace!(from = ?self.phase, to = ?next, "session phase");
        self.phase = next;
    }

    pub async fn run<B>(
        mut self,
        params: &HashMap<String, String>,
        body: &mut B,
        stderr: &mut dyn StderrSink,
    ) -> Result<CgiResponse>
    where
        B: AsyncRead + Unpin + ?Sized,
    {
        let result = self.exchange(params, body, stderr).await;
        match &result {
            Ok(_) => self.advance(Phase::Done),
            Err(err) => {
                debug!(phase = ?self.phase, error = %err, "FastCGI session failed");
                self.advance(Phase::Failed);
            }
        }
        let _ = self.stream.shutdown().await;
        drop(self);
        parse_cgi_output(&result?)
    }

    async fn exchange<B>(
        &mut self,
        params: &HashMap<String, String>,
        body: &mut B,
        stderr: &mut dyn StderrSink,
    ) -> Result<Bytes>
    where
        B: AsyncRead + Unpin + ?Sized,
    {
        write_begin_request(&mut self.stream, REQUEST_ID, BeginRequestBody::responder()).await?;
        let encoded = encode_pairs(params.iter());
        write_stream(&mut self.stream, RecordType::Params, REQUEST_ID, &encoded).await?;
        self.advance(Phase::ParamsWritten);

        self.advance(Phase::StdinStreaming);
        let mut chunk = vec![0u8; STDIN_CHUNK_SIZE];
        let mut sent = 0usize;
        loop {
            let n = body.read(&mut chunk).await?;
            write_record(&mut self.stream, RecordType::Stdin, REQUEST_ID, &chunk[..n]).await?;
            if n == 0 {
                break;
            }
            sent += n;
        }
        // Unused by the Responder role, but the stream must still be closed.
        write_record(&mut self.stream, RecordType::Data, REQUEST_ID, &[]).await?;
        self.stream.flush().await?;
        trace!(stdin_bytes = sent, "request body forwarded");

        self.advance(Phase::AwaitingOutput);
        let mut stdout = BytesMut::new();
        loop {
            let rec = read_record(&mut self.stream).await?;
            if rec.request_id() == FCGI_NULL_REQUEST_ID {
                debug!(record_type = rec.header.record_type, "ignoring management record");
                continue;
            }
            if rec.request_id() != REQUEST_ID {
                warn!(
                    request_id = rec.request_id(),
                    record_type = rec.header.record_type,
                    "ignoring record for another request"
                );
                continue;
            }
            match rec.kind() {
                Some(RecordType::Stdout) => stdout.extend_from_slice(&rec.content),
                Some(RecordType::Stderr) => {
                    if !rec.content.is_empty() {
                        stderr.write_stderr(&rec.content);
                    }
                }
                Some(RecordType::EndRequest) => {
                    log_end_request(&rec.content);
                    break;
                }
                _ => trace!(record_type = rec.header.record_type, "ignoring record"),
            }
        }
        Ok(stdout.freeze())
    }
}

fn log_end_request(content: &[u8]) {
    match EndRequestBody::decode(content) {
        Ok(end) if end.protocol_status != FCGI_REQUEST_COMPLETE => warn!(
            app_status = end.app_status,
            protocol_status = end.protocol_status,
            "FastCGI worker did not complete the request"
        ),
        Ok(end) => debug!(app_status = end.app_status, "FastCGI request complete"),
        Err(err) => debug!(error = %err, "undecodable EndRequest body"),
    }
}

/// Connect to `addr` and run one session.
pub async fn execute<B>(
    addr: SocketAddr,
    params: &HashMap<String, String>,
    body: &mut B,
    stderr: &mut dyn StderrSink,
) -> Result<CgiResponse>
where
    B: AsyncRead + Unpin + ?Sized,
{
    let stream = connect(addr).await?;
    debug!(%addr, params = params.len(), "connected to FastCGI worker");
    Session::new(stream).run(params, body, stderr).await
}

/// Ask the worker for management variables such as `FCGI_MAX_CONNS`.
///
/// A reply of any other type yields an empty map.
pub async fn query_values(addr: SocketAddr, names: &[&str]) -> Result<HashMap<String, String>> {
    let mut stream = connect(addr).await?;
    let query = encode_pairs(names.iter().map(|name| (*name, "")));
    write_record(&mut stream, RecordType::GetValues, FCGI_NULL_REQUEST_ID, &query).await?;
    stream.flush().await?;

    let rec = read_record(&mut stream).await?;
    let _ = stream.shutdown().await;
    if rec.kind() == Some(RecordType::GetValuesResult) {
        decode_pairs_to_map(&rec.content)
    } else {
        debug!(record_type = rec.header.record_type, "worker did not answer GetValues");
        Ok(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcgx_core::record::{write_end_request, FCGI_OVERLOADED};
    use fcgx_core::responder::{read_request, write_response, RequestLimits};
    use tokio::io::DuplexStream;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Reads raw records off the wire until the Data terminator and returns
    /// (type, content length) for each.
    async fn record_trace(server: &mut DuplexStream) -> Vec<(RecordType, usize)> {
        let mut seen = Vec::new();
        loop {
            let rec = read_record(server).await.unwrap();
            let kind = rec.kind().unwrap();
            seen.push((kind, rec.content.len()));
            if kind == RecordType::Data {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn writes_the_responder_record_sequence() {
        let (client, mut server) = tokio::io::duplex(64);
        let body = vec![b'x'; 10_000];

        let worker = tokio::spawn(async move {
            let seen = record_trace(&mut server).await;
            write_response(&mut server, REQUEST_ID, b"Content-Type: text/plain\n\nok", b"", 0)
                .await
                .unwrap();
            seen
        });

        let mut reader = body.as_slice();
        let mut errors = Vec::new();
        let resp = Session::new(client)
            .run(&params(&[("REQUEST_METHOD", "POST")]), &mut reader, &mut errors)
            .await
            .unwrap();
        assert_eq!(resp.status, "200 OK");
        assert_eq!(&resp.body[..], b"ok");

        let seen = worker.await.unwrap();
        let params_len = 1 + 1 + "REQUEST_METHOD".len() + "POST".len();
        assert_eq!(
            seen,
            vec![
                (RecordType::BeginRequest, 8),
                (RecordType::Params, params_len),
                (RecordType::Params, 0),
                (RecordType::Stdin, 4096),
                (RecordType::Stdin, 4096),
                (RecordType::Stdin, 1808),
                (RecordType::Stdin, 0),
                (RecordType::Data, 0),
            ]
        );
    }

    #[tokio::test]
    async fn empty_body_sends_a_single_empty_stdin() {
        let (client, mut server) = tokio::io::duplex(256);
        let worker = tokio::spawn(async move {
            let seen = record_trace(&mut server).await;
            write_response(&mut server, REQUEST_ID, b"\n", b"", 0)
                .await
                .unwrap();
            seen
        });
        let mut reader: &[u8] = &[];
        let mut errors = Vec::new();
        Session::new(client)
            .run(&HashMap::new(), &mut reader, &mut errors)
            .await
            .unwrap();
        let seen = worker.await.unwrap();
        let stdin: Vec<_> = seen
            .iter()
            .filter(|(kind, _)| *kind == RecordType::Stdin)
            .collect();
        assert_eq!(stdin, vec![&(RecordType::Stdin, 0)]);
        // No params: only the terminator.
        assert_eq!(seen[1], (RecordType::Params, 0));
    }

    #[tokio::test]
    async fn stderr_goes_to_the_sink_not_the_body() {
        let (client, server) = tokio::io::duplex(1024);
        let worker = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(server);
            let req = read_request(&mut rd, &mut wr, &RequestLimits::default())
                .await
                .unwrap();
            let out = format!(
                "Status: 404 Not Found\nContent-Type: text/plain\n\n{}",
                req.params["SCRIPT_NAME"]
            );
            write_response(&mut wr, req.request_id, out.as_bytes(), b"PHP Warning: x", 0)
                .await
                .unwrap();
        });
        let mut reader: &[u8] = &[];
        let mut errors = Vec::new();
        let resp = Session::new(client)
            .run(&params(&[("SCRIPT_NAME", "/a.php")]), &mut reader, &mut errors)
            .await
            .unwrap();
        worker.await.unwrap();
        assert_eq!(resp.status, "404 Not Found");
        assert_eq!(&resp.body[..], b"/a.php");
        assert_eq!(errors, b"PHP Warning: x");
    }

    #[tokio::test]
    async fn ignores_unknown_and_management_records() {
        let (client, mut server) = tokio::io::duplex(1024);
        let worker = tokio::spawn(async move {
            record_trace(&mut server).await;
            write_record(&mut server, RecordType::UnknownType, 0, &[9; 8])
                .await
                .unwrap();
            write_record(&mut server, RecordType::Data, REQUEST_ID, b"ignored")
                .await
                .unwrap();
            write_stream(&mut server, RecordType::Stdout, REQUEST_ID, b"X: 1\n\nbody")
                .await
                .unwrap();
            write_end_request(
                &mut server,
                REQUEST_ID,
                EndRequestBody {
                    app_status: 0,
                    protocol_status: FCGI_OVERLOADED,
                },
            )
            .await
            .unwrap();
        });
        let mut reader: &[u8] = &[];
        let mut errors = Vec::new();
        let resp = Session::new(client)
            .run(&HashMap::new(), &mut reader, &mut errors)
            .await
            .unwrap();
        worker.await.unwrap();
        assert_eq!(resp.header("x"), Some("1"));
        assert_eq!(&resp.body[..], b"body");
    }

    #[tokio::test]
    async fn worker_closing_mid_response_is_eof() {
        let (client, mut server) = tokio::io::duplex(1024);
        let worker = tokio::spawn(async move {
            record_trace(&mut server).await;
            // Half a header, then hang up.
            server.write_all(&[1, 6, 0, 1]).await.unwrap();
        });
        let mut reader: &[u8] = &[];
        let mut errors = Vec::new();
        let err = Session::new(client)
            .run(&HashMap::new(), &mut reader, &mut errors)
            .await
            .unwrap_err();
        worker.await.unwrap();
        assert!(matches!(err, Error::ProtocolEof), "{err}");
    }

    #[tokio::test]
    async fn records_for_other_requests_are_skipped() {
        let (client, mut server) = tokio::io::duplex(1024);
        let worker = tokio::spawn(async move {
            record_trace(&mut server).await;
            write_record(&mut server, RecordType::Stdout, 7, b"Status: 500\n\nwrong")
                .await
                .unwrap();
            write_record(&mut server, RecordType::Stderr, 7, b"not ours")
                .await
                .unwrap();
            write_end_request(
                &mut server,
                7,
                EndRequestBody {
                    app_status: 0,
                    protocol_status: FCGI_REQUEST_COMPLETE,
                },
            )
            .await
            .unwrap();
            write_response(&mut server, REQUEST_ID, b"X: 1\n\nbody", b"", 0)
                .await
                .unwrap();
        });
        let mut reader: &[u8] = &[];
        let mut errors = Vec::new();
        let resp = Session::new(client)
            .run(&HashMap::new(), &mut reader, &mut errors)
            .await
            .unwrap();
        worker.await.unwrap();
        assert_eq!(resp.status, "200 OK");
        assert_eq!(resp.header("x"), Some("1"));
        assert_eq!(&resp.body[..], b"body");
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn output_without_header_block_is_malformed() {
        let (client, mut server) = tokio::io::duplex(1024);
        let worker = tokio::spawn(async move {
            record_trace(&mut server).await;
            write_response(&mut server, REQUEST_ID, b"no newline here", b"", 0)
                .await
                .unwrap();
        });
        let mut reader: &[u8] = &[];
        let mut errors = Vec::new();
        let err = Session::new(client)
            .run(&HashMap::new(), &mut reader, &mut errors)
            .await
            .unwrap_err();
        worker.await.unwrap();
        assert!(matches!(err, Error::MalformedResponse));
    }

    #[tokio::test]
    async fn unreachable_worker_is_a_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let mut reader: &[u8] = &[];
        let mut errors = Vec::new();
        let err = execute(addr, &HashMap::new(), &mut reader, &mut errors)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection { .. }), "{err}");
        assert!(err.is_retryable());
    }

    #[test]
    fn new_sessions_start_connected() {
        let (client, _server) = tokio::io::duplex(8);
        let session = Session::new(client);
        assert_eq!(session.phase(), Phase::Connected);
    }
}
