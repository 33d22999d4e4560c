//! # certflow
//!
//! Certificate request lifecycle engine: users submit certificate requests,
//! administrators approve or reject them, approved requests are issued through
//! a signing gateway exactly once, and issued certificates can be revoked.
//!
//! Every transition goes through a compare-and-transition on the
//! [`ledger::RequestLedger`], is gated by the role table in
//! [`lifecycle::policy`], and is reported to an [`audit::AuditSink`].

pub mod audit;
pub mod config;
pub mod error;
pub mod identity;
pub mod issuance;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod runtime;

pub use error::{Error, ErrorKind, LedgerError, LifecycleError, Result};
pub use identity::{Credential, Identity, IdentityStore, Role};
pub use lifecycle::{
    CertificateRequest, EngineSettings, LifecycleEngine, RequestId, RequestState, SubjectInfo,
};
pub use runtime::Runtime;
