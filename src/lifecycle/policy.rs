//! 操作ごとの権限テーブル
//!
//! 各エンジン操作はレジャーに触れる前にここで認可される。

use crate::error::LifecycleError;
use crate::identity::{Identity, Role};
use crate::lifecycle::types::CertificateRequest;
use serde::{Deserialize, Serialize};
use std::fmt;

/// エンジン操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Submit,
    Approve,
    Reject,
    Issue,
    Revoke,
    Read,
    ListOwn,
    ListPending,
    ListAll,
    ViewRevocations,
    Verify,
    Reconcile,
}

impl Action {
    /// 操作を許可されるロール
    pub fn allowed_roles(&self) -> &'static [Role] {
        match self {
            Action::Submit => &[Role::User],
            Action::Approve | Action::Reject | Action::Revoke => &[Role::Admin],
            Action::Issue => &[Role::System, Role::Admin],
            Action::Read | Action::ListOwn | Action::Verify => &[Role::User, Role::Admin],
            Action::ListPending | Action::ListAll | Action::ViewRevocations => &[Role::Admin],
            Action::Reconcile => &[Role::System, Role::Admin],
        }
    }

    pub fn permits(&self, role: Role) -> bool {
        self.allowed_roles().contains(&role)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Submit => "submit",
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Issue => "issue",
            Action::Revoke => "revoke",
            Action::Read => "read",
            Action::ListOwn => "list-own",
            Action::ListPending => "list-pending",
            Action::ListAll => "list-all",
            Action::ViewRevocations => "view-revocations",
            Action::Verify => "verify",
            Action::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unauthorized(identity: &Identity, action: Action) -> LifecycleError {
    LifecycleError::Unauthorized {
        identity: identity.id.clone(),
        role: identity.role,
        action,
    }
}

/// ロールのみで認可
pub fn authorize(identity: &Identity, action: Action) -> Result<(), LifecycleError> {
    if action.permits(identity.role) {
        Ok(())
    } else {
        tracing::warn!(
            identity = %identity.id,
            role = %identity.role,
            action = %action,
            "Action denied by role"
        );
        Err(unauthorized(identity, action))
    }
}

/// ロールに加えて所有者チェックを行う（管理者は全件参照可）
pub fn authorize_owned(
    identity: &Identity,
    action: Action,
    request: &CertificateRequest,
) -> Result<(), LifecycleError> {
    authorize(identity, action)?;

    if identity.role == Role::Admin || request.owner == identity.id {
        Ok(())
    } else {
        tracing::warn!(
            identity = %identity.id,
            request_id = %request.id,
            action = %action,
            "Access to another owner's request denied"
        );
        Err(unauthorized(identity, action))
    }
}
