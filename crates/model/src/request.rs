//! The normalized bid request presented by exchange connectors.
//!
//! Each connector decodes its own wire protocol into this record; the raw
//! payload is preserved verbatim so the response encoder and the event
//! journal can re-emit exchange specific fields without a round trip through
//! the normalized form.

use crate::ids::AuctionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Creative dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Format {
    pub width: u16,
    pub height: u16,
}

impl Format {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Placement of an ad spot relative to the page fold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FoldPosition {
    #[default]
    Unknown,
    Above,
    Below,
}

/// One biddable placement within a request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdSpot {
    pub id: String,
    #[serde(default)]
    pub position: FoldPosition,
    pub formats: Vec<Format>,
    /// The floor below which the exchange will not accept a bid.
    pub reserve_price: crate::money::Amount,
}

/// User identifiers by source. Exchanges differ in which of these they carry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

impl UserIds {
    pub fn get(&self, source: &str) -> Option<&str> {
        match source {
            "exchange" => self.exchange_id.as_deref(),
            "provider" => self.provider_id.as_deref(),
            _ => None,
        }
    }
}

/// An unordered set of audience segments from one data provider.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentList(pub BTreeSet<String>);

impl SegmentList {
    pub fn contains(&self, segment: &str) -> bool {
        self.0.contains(segment)
    }

    pub fn intersects(&self, other: &SegmentList) -> bool {
        self.0.iter().any(|s| other.contains(s))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<String> for SegmentList {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An inbound auction, decoded and normalized by an exchange connector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BidRequest {
    pub id: AuctionId,
    pub timestamp: DateTime<Utc>,
    /// Name of the exchange connector that produced this request.
    pub exchange: String,
    /// How long the exchange gives us to answer, end to end.
    #[serde(with = "duration_millis")]
    pub time_available: Duration,
    pub spots: Vec<AdSpot>,
    #[serde(default)]
    pub user_ids: UserIds,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub ip: String,
    /// Audience segments keyed by provider source.
    #[serde(default)]
    pub segments: BTreeMap<String, SegmentList>,
    /// The exchange specific payload, preserved verbatim.
    #[serde(default)]
    pub raw: serde_json::Value,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
