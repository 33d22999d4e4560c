//! Identity Module
//!
//! 資格情報の解決とロール定義

pub mod store;
pub mod types;

pub use store::{AccountSeed, IdentityStore, InMemoryIdentityStore};
pub use types::{AuthFailure, Credential, Identity, PasswordHasher, Role};
