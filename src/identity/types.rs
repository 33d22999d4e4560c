//! Identity Types
//!
//! アイデンティティ・ロール・資格情報の型定義

use serde::{Deserialize, Serialize};
use secrecy::SecretString;
use std::fmt;
use thiserror::Error;

/// ロール
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// 一般ユーザー（申請者）
    User,
    /// 管理者（審査・失効）
    Admin,
    /// エンジン内部の発行処理
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 認証済みアイデンティティ
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub role: Role,
}

impl Identity {
    pub const SYSTEM_ID: &'static str = "system";

    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(id, Role::User)
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::Admin)
    }

    /// 発行処理を駆動する内部アイデンティティ
    pub fn system() -> Self {
        Self::new(Self::SYSTEM_ID, Role::System)
    }
}

/// 資格情報
#[derive(Debug)]
pub enum Credential {
    /// ユーザー名/パスワード
    Password {
        username: String,
        password: SecretString,
    },
    /// APIキー
    ApiKey { key: SecretString },
}

impl Credential {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Password {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Credential::ApiKey {
            key: SecretString::from(key.into()),
        }
    }
}

/// 資格情報の解決エラー
#[derive(Debug, Clone, Error)]
pub enum AuthFailure {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account disabled: {0}")]
    Disabled(String),

    #[error("Account already exists: {0}")]
    AlreadyExists(String),

    #[error("Account not found: {0}")]
    UnknownAccount(String),

    #[error("Password does not meet requirements")]
    WeakPassword,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// パスワードハッシュ（Argon2）
#[derive(Debug, Clone, Default)]
pub struct PasswordHasher;

impl PasswordHasher {
    /// パスワードをハッシュ化
    pub fn hash(&self, password: &str) -> Result<String, AuthFailure> {
        use argon2::{
            password_hash::{PasswordHasher as _, SaltString},
            Argon2,
        };

        let salt = SaltString::generate(&mut rand::thread_rng());

        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthFailure::Internal(format!("Password hashing failed: {}", e)))
    }

    /// パスワードを検証
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool, AuthFailure> {
        use argon2::{
            password_hash::{PasswordHash, PasswordVerifier},
            Argon2,
        };

        let parsed_hash = PasswordHash::new(hash)
            .map_err(|e| AuthFailure::Internal(format!("Invalid password hash: {}", e)))?;

        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    /// パスワード強度をチェック
    pub fn check_strength(password: &str) -> Result<(), AuthFailure> {
        if password.len() < 8 {
            return Err(AuthFailure::WeakPassword);
        }

        let has_letter = password.chars().any(|c| c.is_alphabetic());
        let has_digit = password.chars().any(|c| c.is_numeric());

        if !(has_letter && has_digit) {
            return Err(AuthFailure::WeakPassword);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_and_verify() {
        let hasher = PasswordHasher;
        let hash = hasher.hash("correct-horse-42").unwrap();

        assert!(hash.starts_with("$argon2"));
        assert!(hasher.verify("correct-horse-42", &hash).unwrap());
        assert!(!hasher.verify("wrong-horse-42", &hash).unwrap());
    }

    #[test]
    fn test_password_strength() {
        assert!(PasswordHasher::check_strength("short1").is_err());
        assert!(PasswordHasher::check_strength("onlyletters").is_err());
        assert!(PasswordHasher::check_strength("letters4ndDigits").is_ok());
    }

    #[test]
    fn test_credential_debug_redacts_secret() {
        let credential = Credential::password("alice", "s3cret-value");
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("s3cret-value"));
    }
}
