//! Minimal FastCGI responder used to exercise the bridge without php-cgi.
//!
//! Accepts the php-cgi worker command line (`-b addr [-c ini] (-d k=v)*`)
//! and answers each request with a plain-text dump of what it received.
//! The `ECHO_STATUS` and `ECHO_STDERR` params control the status line and
//! the stderr stream.

use anyhow::{Context, Result};
use clap::Parser;
use fcgx_core::observability::init_logging;
use fcgx_core::responder::{read_request, write_response, FcgiRequest, RequestLimits};
use fcgx_core::Error;
use std::fmt::Write as _;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "fcgx-echo", about = "FastCGI echo responder")]
struct Cli {
    /// Address to bind, e.g. 127.0.0.1:9000.
    #[arg(short = 'b')]
    bind: String,

    #[arg(short = 'c')]
    ini: Option<PathBuf>,

    /// Configuration override `name=value`; may repeat.
    #[arg(short = 'd', value_name = "NAME=VALUE")]
    define: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging("warn");

    let listener = TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    info!(listen = %cli.bind, "fcgx-echo listening");

    let mut preamble = String::new();
    if let Some(ini) = &cli.ini {
        let _ = writeln!(preamble, "ini:{}", ini.display());
    }
    for define in &cli.define {
        let _ = writeln!(preamble, "define:{define}");
    }

    loop {
        let (stream, peer) = listener.accept().await?;
        let preamble = preamble.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, &preamble).await {
                warn!(%peer, error = %err, "connection failed");
            }
        });
    }
}

async fn serve_connection(mut stream: TcpStream, preamble: &str) -> Result<()> {
    let (mut reader, mut writer) = stream.split();
    let req = match read_request(&mut reader, &mut writer, &RequestLimits::default()).await {
        Ok(req) => req,
        // Management-only connections (GetValues probes) end here.
        Err(Error::ProtocolEof) => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    debug!(request_id = req.request_id, "request received");

    let (stdout, stderr) = render(&req, preamble);
    write_response(&mut writer, req.request_id, &stdout, stderr.as_bytes(), 0).await?;
    writer.flush().await?;
    stream.shutdown().await?;

    // The client still sends a trailing Data record; read it so closing
    // does not reset the connection under the response.
    let mut sink = [0u8; 1024];
    let _ = timeout(DRAIN_TIMEOUT, async {
        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
    })
    .await;
    Ok(())
}

fn render(req: &FcgiRequest, preamble: &str) -> (Vec<u8>, String) {
    let status = req
        .params
        .get("ECHO_STATUS")
        .map_or("200 OK", String::as_str);
    let mut out = format!("Status: {status}\nContent-Type: text/plain\n\n");
    out.push_str(preamble);

    let mut names: Vec<_> = req.params.keys().collect();
    names.sort();
    for name in names {
        let _ = writeln!(out, "{name}={}", req.params[name]);
    }
    let _ = writeln!(out, "stdin-bytes:{}", req.stdin.len());

    let mut stdout = out.into_bytes();
    stdout.extend_from_slice(&req.stdin);
    let stderr = req.params.get("ECHO_STDERR").cloned().unwrap_or_default();
    (stdout, stderr)
}
