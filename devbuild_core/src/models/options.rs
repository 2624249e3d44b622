//! Per-call options and caller identity.

use serde::{Deserialize, Serialize};

/// Who is calling. `account` is the API account used for privilege checks,
/// `user` is recorded as the record creator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user: String,
    pub account: Option<String>,
}

impl Caller {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            account: None,
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOptions {
    /// Validate and compute the result without persisting or triggering.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOptions {
    /// Poll the job system before returning a processing record.
    pub sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    pub offset: usize,
    pub size: usize,
    pub hotfix: Option<bool>,
    pub created_by: Option<String>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            size: 20,
            hotfix: None,
            created_by: None,
        }
    }
}
