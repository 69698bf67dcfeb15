//! Resilient REST client for the installed CRM tenant
//!
//! Wraps every REST call in the token lifecycle from `crm-auth`: load the
//! stored `TokenSet`, call, and on an expired-token response refresh once,
//! persist, and retry once.
//!
//! Call outcomes:
//! - success: provider JSON returned verbatim, store untouched
//! - expired token: one refresh, one save, one retry; the retry is final
//! - refresh rejected: `Error::RefreshFailed`, store untouched
//! - anything else: surfaced without retry

pub mod classify;
pub mod client;
pub mod error;
pub mod install;
pub mod metrics;

pub use classify::{ApiFailure, ErrorKind, EXPIRED_TOKEN_CODE};
pub use client::RpcClient;
pub use error::{Error, Result};
pub use install::{Placement, complete_install, install, rebind_placements};
