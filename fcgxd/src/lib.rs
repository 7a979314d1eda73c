//! HTTP to FastCGI bridge: one supervised worker process per bridge,
//! one short-lived FastCGI connection per request.

pub mod bridge;
pub mod server;
pub mod session;
pub mod supervisor;
