//! HTTP front end: maps request paths onto the document root, serves
//! static files directly and hands scripts to the bridge.

use crate::bridge::{Bridge, BridgeRequest};
use crate::session::TracingStderr;
use anyhow::{anyhow, Context, Result};
use fcgx_core::config::BridgeConfig;
use fcgx_core::response::CgiResponse;
use futures_util::TryStreamExt;
use hyper::header::{HeaderName, HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, HeaderMap, Method, Request, Response, Server, StatusCode};
use percent_encoding::percent_decode_str;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

pub const SERVER_SOFTWARE: &str = concat!("fcgxd/", env!("CARGO_PKG_VERSION"));

const MAX_HTTP_HEADERS: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

/// A request path split into an existing file under the document root and
/// the trailing `PATH_INFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptMatch {
    /// Relative to the document root, without a leading slash.
    pub relative: String,
    pub path_info: String,
}

/// Walk up `request_path` until an existing entry under `root` is found.
///
/// Paths with `..`, `.` or absolute components never resolve.
pub fn resolve_script(root: &Path, request_path: &str) -> Option<ScriptMatch> {
    let relative = request_path.trim_start_matches('/');
    if Path::new(relative)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }

    let mut current = relative.to_string();
    let mut path_info = String::new();
    loop {
        if root.join(&current).exists() {
            return Some(ScriptMatch {
                relative: current,
                path_info,
            });
        }
        if current.is_empty() {
            return None;
        }
        let (parent, name) = match current.rsplit_once('/') {
            Some((parent, name)) => (parent.to_string(), name.to_string()),
            None => (String::new(), current.clone()),
        };
        path_info = format!("/{name}{path_info}");
        current = parent;
    }
}

pub struct FrontEnd {
    bridge: Arc<Bridge>,
    document_root: PathBuf,
    script_extension: String,
}

impl FrontEnd {
    pub fn new(bridge: Arc<Bridge>, config: &BridgeConfig) -> Self {
        Self {
            bridge,
            document_root: config.document_root.clone(),
            script_extension: config.script_extension().to_string(),
        }
    }

    fn is_script(&self, relative: &str) -> bool {
        Path::new(relative)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.script_extension))
    }

    pub async fn handle(&self, req: Request<Body>, conn: ConnInfo) -> Response<Body> {
        let path = percent_decode_str(req.uri().path())
            .decode_utf8_lossy()
            .into_owned();
        let Some(script) = resolve_script(&self.document_root, &path) else {
            debug!(path = %path, "no file for request path");
            return plain_response(StatusCode::NOT_FOUND);
        };
        let full_path = self.document_root.join(&script.relative);
        if script.relative.is_empty() || full_path.is_dir() {
            return plain_response(StatusCode::NOT_FOUND);
        }
        if !self.is_script(&script.relative) {
            let method = req.method().clone();
            return serve_static(&method, &full_path).await;
        }

        let env = build_cgi_env(&req, conn, &self.document_root, &script);
        let mut errors = TracingStderr::new(format!("/{}", script.relative));
        let mut body = StreamReader::new(req.into_body().map_err(std::io::Error::other));
        let resp = self
            .bridge
            .respond(BridgeRequest {
                env,
                body: &mut body,
                multiprocess: false,
                errors: &mut errors,
            })
            .await;
        into_http_response(resp)
    }
}

/// Serve `front` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: std::net::TcpListener, front: Arc<FrontEnd>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    listener.set_nonblocking(true)?;
    let listen = listener.local_addr()?;
    let make = make_service_fn(move |conn: &AddrStream| {
        let front = front.clone();
        let info = ConnInfo {
            remote: conn.remote_addr(),
            local: conn.local_addr(),
        };
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let front = front.clone();
                async move { Ok::<_, Infallible>(front.handle(req, info).await) }
            }))
        }
    });

    info!(listen = %listen, "HTTP front end started");
    Server::from_tcp(listener)
        .with_context(|| format!("failed to serve on {listen}"))?
        .serve(make)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow!("HTTP server failed: {e}"))
}

fn server_protocol(version: http::Version) -> &'static str {
    match version {
        http::Version::HTTP_09 => "HTTP/0.9",
        http::Version::HTTP_10 => "HTTP/1.0",
        http::Version::HTTP_11 => "HTTP/1.1",
        http::Version::HTTP_2 => "HTTP/2.0",
        _ => "HTTP/1.1",
    }
}

fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authentication-info"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn parse_connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    let mut out = HashSet::new();
    for value in headers.get_all("connection") {
        let Ok(s) = value.to_str() else {
            continue;
        };
        for token in s.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                out.insert(token.to_ascii_lowercase());
            }
        }
    }
    out
}

/// SERVER_NAME and SERVER_PORT as the client addressed us.
fn server_name_and_port(headers: &HeaderMap, local_port: u16) -> (String, String) {
    let fallback_port = local_port.to_string();
    let Some(host) = headers.get("host").and_then(|v| v.to_str().ok()) else {
        return ("localhost".to_string(), fallback_port);
    };
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((addr, after)) = rest.split_once(']') {
            let port = after.strip_prefix(':').unwrap_or(&fallback_port);
            return (addr.to_string(), port.to_string());
        }
    } else if let Some((name, port)) = host.rsplit_once(':') {
        return (name.to_string(), port.to_string());
    }
    (host.to_string(), fallback_port)
}

fn http_env_name(header: &str) -> String {
    let mut name = String::with_capacity(5 + header.len());
    name.push_str("HTTP_");
    for c in header.chars() {
        name.push(match c {
            '-' => '_',
            c => c.to_ascii_uppercase(),
        });
    }
    name
}

/// The CGI/1.1 environment for one script request.
pub fn build_cgi_env(
    req: &Request<Body>,
    conn: ConnInfo,
    document_root: &Path,
    script: &ScriptMatch,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    let mut set = |name: &str, value: String| {
        env.insert(name.to_string(), value);
    };

    let uri = req.uri();
    set("REQUEST_METHOD", req.method().as_str().to_string());
    set(
        "REQUEST_URI",
        uri.path_and_query()
            .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string()),
    );
    set("QUERY_STRING", uri.query().unwrap_or("").to_string());
    set("SCRIPT_NAME", format!("/{}", script.relative));
    set(
        "SCRIPT_FILENAME",
        document_root.join(&script.relative).to_string_lossy().into_owned(),
    );
    set("PATH_INFO", script.path_info.clone());
    if !script.path_info.is_empty() {
        set(
            "PATH_TRANSLATED",
            document_root
                .join(script.path_info.trim_start_matches('/'))
                .to_string_lossy()
                .into_owned(),
        );
    }
    set("DOCUMENT_ROOT", document_root.to_string_lossy().into_owned());
    set("SERVER_PROTOCOL", server_protocol(req.version()).to_string());
    let (server_name, server_port) = server_name_and_port(req.headers(), conn.local.port());
    set("SERVER_NAME", server_name);
    set("SERVER_PORT", server_port);
    set("SERVER_SOFTWARE", SERVER_SOFTWARE.to_string());
    set("GATEWAY_INTERFACE", "CGI/1.1".to_string());
    // php-cgi refuses to run without it when force-cgi-redirect is on.
    set("REDIRECT_STATUS", "200".to_string());
    set("REMOTE_ADDR", conn.remote.ip().to_string());
    set("REMOTE_PORT", conn.remote.port().to_string());

    let headers = req.headers();
    if let Some(ct) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        set("CONTENT_TYPE", ct.to_string());
    }
    if let Some(len) = headers.get(CONTENT_LENGTH).and_then(|v| v.to_str().ok()) {
        set("CONTENT_LENGTH", len.to_string());
    }

    let connection_tokens = parse_connection_tokens(headers);
    let mut header_count = 0usize;
    for (name, value) in headers {
        if header_count >= MAX_HTTP_HEADERS {
            break;
        }
        let name = name.as_str();
        if name == "content-type" || name == "content-length" {
            continue;
        }
        if is_hop_by_hop_header(name) || connection_tokens.contains(name) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        let separator = if name == "cookie" { "; " } else { ", " };
        env.entry(http_env_name(name))
            .and_modify(|existing: &mut String| {
                existing.push_str(separator);
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
        header_count += 1;
    }
    env
}

/// Content type by file extension for static files.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        Some("wasm") => "application/wasm",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

async fn serve_static(method: &Method, path: &Path) -> Response<Body> {
    if method != Method::GET && method != Method::HEAD {
        let mut resp = plain_response(StatusCode::METHOD_NOT_ALLOWED);
        resp.headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
        return resp;
    }
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "static file unreadable");
            return plain_response(StatusCode::NOT_FOUND);
        }
    };
    let len = data.len();
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(data)
    };
    let mut resp = Response::new(body);
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type_for(path)));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    resp
}

fn plain_response(status: StatusCode) -> Response<Body> {
    let text = format!(
        "{} {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    let mut resp = Response::new(Body::from(text));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Convert a worker response into an HTTP response. The reason phrase is
/// regenerated from the status code.
pub fn into_http_response(cgi: CgiResponse) -> Response<Body> {
    let status = cgi
        .status_code()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or_else(|| {
            warn!(status = %cgi.status, "worker sent an unusable status line");
            StatusCode::BAD_GATEWAY
        });
    let mut resp = Response::new(Body::from(cgi.body));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    for (name, value) in &cgi.headers {
        if is_hop_by_hop_header(name) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "dropping invalid header from worker"),
        }
    }
    resp
}
