use crate::session::{self, StderrSink};
use crate::supervisor::Supervisor;
use bytes::Bytes;
use fcgx_core::env_filter::EnvFilterPolicy;
use fcgx_core::response::CgiResponse;
use fcgx_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{error, warn};

/// Content type assumed for POST bodies that arrive without one.
pub const DEFAULT_POST_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

const MULTIPROCESS_WARNING: &[u8] =
    b"fcgxd: multiprocess hosting is not supported; each process runs its own FastCGI worker\n";

/// Everything the bridge needs from one inbound request.
pub struct BridgeRequest<'a> {
    pub env: HashMap<String, String>,
    pub body: &'a mut (dyn AsyncRead + Send + Unpin),
    /// Set when the hosting server runs several processes side by side.
    pub multiprocess: bool,
    pub errors: &'a mut dyn StderrSink,
}

/// Turns a request environment into a FastCGI exchange with the supervised
/// worker.
pub struct Bridge {
    supervisor: Arc<Supervisor>,
    filter: EnvFilterPolicy,
}

impl Bridge {
    pub fn new(supervisor: Arc<Supervisor>, filter: EnvFilterPolicy) -> Self {
        Self { supervisor, filter }
    }

    pub async fn handle(&self, req: BridgeRequest<'_>) -> Result<CgiResponse> {
        let BridgeRequest {
            mut env,
            body,
            multiprocess,
            errors,
        } = req;

        if multiprocess && self.supervisor.address().await.is_none() {
            errors.write_stderr(MULTIPROCESS_WARNING);
        }
        default_post_content_type(&mut env);
        let params = self.filter.filter(&env);

        let addr = self.supervisor.ensure_running().await?;
        match session::execute(addr, &params, &mut *body, &mut *errors).await {
            Err(err) if err.is_retryable() => {
                // Nothing has been read from the body when the connect fails.
                warn!(%addr, error = %err, "FastCGI worker unreachable; retrying once");
                let addr = self.supervisor.ensure_running().await?;
                session::execute(addr, &params, &mut *body, &mut *errors).await
            }
            other => other,
        }
    }

    /// Like [`Bridge::handle`], but failures become a plain-text error page.
    pub async fn respond(&self, req: BridgeRequest<'_>) -> CgiResponse {
        match self.handle(req).await {
            Ok(resp) => resp,
            Err(err) => {
                error!(error = %err, "FastCGI request failed");
                error_response(&err)
            }
        }
    }
}

fn default_post_content_type(env: &mut HashMap<String, String>) {
    let is_post = env.get("REQUEST_METHOD").map(String::as_str) == Some("POST");
    let missing = env.get("CONTENT_TYPE").map_or(true, |v| v.is_empty());
    if is_post && missing {
        env.insert(
            "CONTENT_TYPE".to_string(),
            DEFAULT_POST_CONTENT_TYPE.to_string(),
        );
    }
}

/// Status line for a failed exchange: the worker being unreachable or dying
/// is a gateway failure, anything else is ours.
pub fn error_status(err: &Error) -> &'static str {
    match err {
        Error::Connection { .. }
        | Error::ProtocolEof
        | Error::Spawn { .. }
        | Error::PortSearchExhausted { .. } => "502 Bad Gateway",
        _ => "500 Internal Server Error",
    }
}

pub fn error_response(err: &Error) -> CgiResponse {
    let status = error_status(err);
    CgiResponse {
        status: status.to_string(),
        headers: vec![(
            "content-type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        )],
        body: Bytes::from(format!("{status}\n")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn post_without_content_type_gets_form_default() {
        let mut env = HashMap::from([("REQUEST_METHOD".to_string(), "POST".to_string())]);
        default_post_content_type(&mut env);
        assert_eq!(env["CONTENT_TYPE"], DEFAULT_POST_CONTENT_TYPE);

        let mut env = HashMap::from([
            ("REQUEST_METHOD".to_string(), "POST".to_string()),
            ("CONTENT_TYPE".to_string(), "application/json".to_string()),
        ]);
        default_post_content_type(&mut env);
        assert_eq!(env["CONTENT_TYPE"], "application/json");

        let mut env = HashMap::from([("REQUEST_METHOD".to_string(), "GET".to_string())]);
        default_post_content_type(&mut env);
        assert!(!env.contains_key("CONTENT_TYPE"));
    }

    #[test]
    fn gateway_failures_map_to_502() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let refused = Error::Connection {
            addr,
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(error_status(&refused), "502 Bad Gateway");
        assert_eq!(error_status(&Error::ProtocolEof), "502 Bad Gateway");
        assert_eq!(
            error_status(&Error::PortSearchExhausted {
                start: 10000,
                attempts: 3
            }),
            "502 Bad Gateway"
        );
        assert_eq!(
            error_status(&Error::MalformedResponse),
            "500 Internal Server Error"
        );

        let resp = error_response(&Error::ProtocolDecode("bad".into()));
        assert_eq!(resp.status_code(), Some(500));
        assert_eq!(resp.header("content-type"), Some("text/plain; charset=utf-8"));
    }

    #[tokio::test]
    async fn multiprocess_hosts_are_warned_through_the_error_sink() {
        let supervisor = Arc::new(Supervisor::new(fcgx_core::config::WorkerConfig {
            script: "/nonexistent/fcgx-worker".into(),
            ..Default::default()
        }));
        let bridge = Bridge::new(supervisor, EnvFilterPolicy::Lenient);
        let mut body: &[u8] = &[];
        let mut errors = Vec::new();
        let resp = bridge
            .respond(BridgeRequest {
                env: HashMap::new(),
                body: &mut body,
                multiprocess: true,
                errors: &mut errors,
            })
            .await;
        assert_eq!(resp.status, "502 Bad Gateway");
        assert_eq!(errors, MULTIPROCESS_WARNING);
    }
}
