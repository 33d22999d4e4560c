//! Certificate Request Lifecycle
//!
//! 申請 → 審査 → 承認/却下 → 発行 → 失効 の状態機械

pub mod engine;
pub mod policy;
pub mod retry;
pub mod types;

pub use engine::{
    CertificateVerification, EngineSettings, LifecycleEngine, ReconcileReport, RevocationEntry,
    UnresolvedIssuance,
};
pub use policy::Action;
pub use retry::RetryPolicy;
pub use types::{
    certificate_parameters, ArtifactStatus, CertificateArtifact, CertificateParameters,
    CertificateRequest, ExtendedKeyUsage, HistoryEntry, IssuanceLease, IssuanceStatus, KeyUsage,
    RequestId, RequestState, Revocation, RevocationReason, SubjectInfo,
};
