use super::types::{AuthFailure, Credential, Identity, PasswordHasher, Role};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 資格情報をアイデンティティに解決するストア
///
/// エンジンからは読み取り専用。
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn resolve(&self, credential: &Credential) -> Result<Identity, AuthFailure>;
}

/// 設定ファイルから読み込む初期アカウント
#[derive(Debug, Deserialize, Serialize)]
pub struct AccountSeed {
    pub id: String,
    pub role: Role,
    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<SecretString>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone)]
struct StoredAccount {
    identity: Identity,
    password_hash: Option<String>,
    disabled: bool,
}

/// In-memoryアイデンティティストア
///
/// APIキーはSHA-256ダイジェストのみ保持する。
#[derive(Clone, Default)]
pub struct InMemoryIdentityStore {
    accounts: Arc<RwLock<HashMap<String, StoredAccount>>>,
    api_keys: Arc<RwLock<HashMap<String, String>>>,
    password_hasher: PasswordHasher,
}

fn api_key_digest(key: &str) -> String {
    Sha256::digest(key.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 初期アカウントからストアを構築
    pub async fn from_seeds(seeds: &[AccountSeed]) -> Result<Self, AuthFailure> {
        let store = Self::new();
        for seed in seeds {
            if seed.role == Role::System {
                return Err(AuthFailure::Internal(format!(
                    "account {} may not use the system role",
                    seed.id
                )));
            }
            store.add_account(&seed.id, seed.role, seed.password.as_ref()).await?;
            if let Some(ref key) = seed.api_key {
                store.add_api_key(&seed.id, key).await?;
            }
            if seed.disabled {
                store.disable(&seed.id).await?;
            }
        }
        info!("Loaded {} seeded accounts", seeds.len());
        Ok(store)
    }

    /// アカウントを追加
    pub async fn add_account(
        &self,
        id: &str,
        role: Role,
        password: Option<&SecretString>,
    ) -> Result<(), AuthFailure> {
        let password_hash = match password {
            Some(password) => {
                PasswordHasher::check_strength(password.expose_secret())?;
                Some(self.password_hasher.hash(password.expose_secret())?)
            }
            None => None,
        };

        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(id) {
            return Err(AuthFailure::AlreadyExists(id.to_string()));
        }

        accounts.insert(
            id.to_string(),
            StoredAccount {
                identity: Identity::new(id, role),
                password_hash,
                disabled: false,
            },
        );
        debug!("Account added: {} ({})", id, role);
        Ok(())
    }

    /// APIキーを登録
    pub async fn add_api_key(&self, id: &str, key: &SecretString) -> Result<(), AuthFailure> {
        if !self.accounts.read().await.contains_key(id) {
            return Err(AuthFailure::UnknownAccount(id.to_string()));
        }

        let mut api_keys = self.api_keys.write().await;
        let digest = api_key_digest(key.expose_secret());
        if api_keys.contains_key(&digest) {
            return Err(AuthFailure::AlreadyExists("api key".to_string()));
        }
        api_keys.insert(digest, id.to_string());
        Ok(())
    }

    /// アカウントを無効化
    pub async fn disable(&self, id: &str) -> Result<(), AuthFailure> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| AuthFailure::UnknownAccount(id.to_string()))?;
        account.disabled = true;
        Ok(())
    }

    fn active(account: &StoredAccount) -> Result<Identity, AuthFailure> {
        if account.disabled {
            warn!("Disabled account attempted to authenticate: {}", account.identity.id);
            return Err(AuthFailure::Disabled(account.identity.id.clone()));
        }
        Ok(account.identity.clone())
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn resolve(&self, credential: &Credential) -> Result<Identity, AuthFailure> {
        match credential {
            Credential::Password { username, password } => {
                let account = self
                    .accounts
                    .read()
                    .await
                    .get(username)
                    .cloned()
                    .ok_or(AuthFailure::InvalidCredentials)?;

                let hash = account
                    .password_hash
                    .as_deref()
                    .ok_or(AuthFailure::InvalidCredentials)?;

                if !self.password_hasher.verify(password.expose_secret(), hash)? {
                    return Err(AuthFailure::InvalidCredentials);
                }
                Self::active(&account)
            }
            Credential::ApiKey { key } => {
                let digest = api_key_digest(key.expose_secret());
                let id = self
                    .api_keys
                    .read()
                    .await
                    .get(&digest)
                    .cloned()
                    .ok_or(AuthFailure::InvalidCredentials)?;

                let accounts = self.accounts.read().await;
                let account = accounts.get(&id).ok_or(AuthFailure::InvalidCredentials)?;
                Self::active(account)
            }
        }
    }
}
