//! FastCGI client-side protocol pieces shared by the bridge daemon and its
//! reference worker.

pub mod config;
pub mod env_filter;
pub mod envsubst;
pub mod error;
pub mod name_value;
pub mod observability;
pub mod record;
pub mod responder;
pub mod response;

pub use error::{Error, Result};
