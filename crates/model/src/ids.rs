//! Identifier newtypes shared across the router and post-auction services.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

macro_rules! string_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }
    };
}

string_id! {
    /// The exchange-assigned id of one auction. Unique for the lifetime of the
    /// auction and the key used to correlate post-auction events.
    AuctionId
}

string_id! {
    /// The name under which a bidding agent registered its configuration.
    AgentId
}

/// The id of a creative, unique within the owning agent's configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CreativeId(pub u32);

impl fmt::Display for CreativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hierarchical billing account, e.g. `campaign:strategy`. Spend is always
/// authorized and committed against an account, never an agent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(Vec<String>);

impl AccountId {
    pub fn parse(value: &str) -> Result<Self, InvalidAccount> {
        if value.is_empty() {
            return Err(InvalidAccount::Empty);
        }
        let parts: Vec<String> = value.split(':').map(str::to_owned).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(InvalidAccount::EmptyComponent(value.to_owned()));
        }
        Ok(Self(parts))
    }

    /// The top level component, which owns the budget at the banker.
    pub fn parent(&self) -> &str {
        &self.0[0]
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(":"))
    }
}

impl TryFrom<String> for AccountId {
    type Error = InvalidAccount;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AccountId> for String {
    fn from(value: AccountId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum InvalidAccount {
    #[error("account must not be empty")]
    Empty,
    #[error("account {0:?} has an empty component")]
    EmptyComponent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_parsing() {
        let account = AccountId::parse("campaign:strategy").unwrap();
        assert_eq!(account.parent(), "campaign");
        assert_eq!(account.to_string(), "campaign:strategy");

        assert_eq!(AccountId::parse(""), Err(InvalidAccount::Empty));
        assert!(matches!(
            AccountId::parse("a::b"),
            Err(InvalidAccount::EmptyComponent(_))
        ));
    }
}
