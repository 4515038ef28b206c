use std::fmt;

use serde::{Deserialize, Serialize};

/// Accounts updated when none are configured.
pub const DEFAULT_ACCOUNTS: [AccountId; 4] = [
    AccountId::new(1),
    AccountId::new(23),
    AccountId::new(383),
    AccountId::new(82),
];

/// Identifier of an account whose balance lives in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(u32);

impl AccountId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Store key holding this account's balance: `balance-NNN`, zero-padded
    /// to three digits. Wider ids are printed in full.
    #[must_use]
    pub fn balance_key(self) -> String {
        format!("balance-{:03}", self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
