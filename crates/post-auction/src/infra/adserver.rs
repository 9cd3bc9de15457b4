//! Adserver ingress: decoding win and delivery notifications.
//!
//! Adservers name their events freely; an injective mapping from external
//! name to internal kind is part of the connector configuration. Events are
//! keyed by request id, with the auction user tag as fallback for adservers
//! that only echo the tag back.

use chrono::{DateTime, Utc};
use model::{
    events::{DeliveryEvent, DeliveryKind},
    money::Amount,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// External event name to internal kind, injective.
#[derive(Clone, Debug)]
pub struct EventMapping(BTreeMap<String, DeliveryKind>);

impl EventMapping {
    pub fn new(map: BTreeMap<String, DeliveryKind>) -> Result<Self, MappingError> {
        let mut seen = Vec::new();
        for (name, kind) in &map {
            if seen.contains(kind) {
                return Err(MappingError::NotInjective {
                    name: name.clone(),
                    kind: *kind,
                });
            }
            seen.push(*kind);
        }
        Ok(Self(map))
    }

    /// The conventional mapping used when the connector config is silent.
    pub fn standard() -> Self {
        Self(
            [
                ("win".to_owned(), DeliveryKind::Win),
                ("impression".to_owned(), DeliveryKind::Impression),
                ("click".to_owned(), DeliveryKind::Click),
            ]
            .into_iter()
            .collect(),
        )
    }

    pub fn resolve(&self, name: &str) -> Option<DeliveryKind> {
        self.0.get(name).copied()
    }
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("event mapping is not injective: {name:?} maps to already-used {kind:?}")]
    NotInjective { name: String, kind: DeliveryKind },
}

/// The wire record both adserver endpoints accept.
#[derive(Debug, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub auction_user_tag: Option<String>,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    /// Win price in micros, wins only.
    #[serde(default)]
    pub price: Option<i64>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event name {0:?}")]
    UnknownEvent(String),
    #[error("event carries neither request id nor auction user tag")]
    NoKey,
}

pub fn decode(mapping: &EventMapping, raw: RawEvent) -> Result<DeliveryEvent, DecodeError> {
    let kind = mapping
        .resolve(&raw.event)
        .ok_or_else(|| DecodeError::UnknownEvent(raw.event.clone()))?;
    let auction = raw
        .request_id
        .clone()
        .or_else(|| raw.auction_user_tag.clone())
        .ok_or(DecodeError::NoKey)?;
    Ok(DeliveryEvent {
        auction: auction.as_str().into(),
        kind,
        timestamp: raw.timestamp,
        win_price: raw.price.map(Amount::usd_micros),
        user_tag: raw.auction_user_tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn mapping_must_be_injective() {
        let result = EventMapping::new(btreemap! {
            "WIN".to_owned() => DeliveryKind::Win,
            "NOTIFY".to_owned() => DeliveryKind::Win,
        });
        assert!(matches!(result, Err(MappingError::NotInjective { .. })));

        let mapping = EventMapping::new(btreemap! {
            "WIN".to_owned() => DeliveryKind::Win,
            "VIEW".to_owned() => DeliveryKind::Impression,
        })
        .unwrap();
        assert_eq!(mapping.resolve("VIEW"), Some(DeliveryKind::Impression));
        assert_eq!(mapping.resolve("view"), None);
    }

    #[test]
    fn decodes_with_tag_fallback() {
        let mapping = EventMapping::standard();
        let raw: RawEvent = serde_json::from_value(serde_json::json!({
            "auction_user_tag": "tag-1",
            "event": "impression",
            "timestamp": "2022-06-15T14:00:00Z"
        }))
        .unwrap();
        let event = decode(&mapping, raw).unwrap();
        assert_eq!(event.auction.as_str(), "tag-1");
        assert_eq!(event.kind, DeliveryKind::Impression);

        let raw: RawEvent = serde_json::from_value(serde_json::json!({
            "request_id": "r-1",
            "event": "win",
            "timestamp": "2022-06-15T14:00:00Z",
            "price": 2900
        }))
        .unwrap();
        let event = decode(&mapping, raw).unwrap();
        assert_eq!(event.auction.as_str(), "r-1");
        assert_eq!(event.win_price, Some(Amount::usd_micros(2_900)));
    }

    #[test]
    fn rejects_unmapped_and_keyless_events() {
        let mapping = EventMapping::standard();
        let raw: RawEvent = serde_json::from_value(serde_json::json!({
            "request_id": "r-1",
            "event": "conversion",
            "timestamp": "2022-06-15T14:00:00Z"
        }))
        .unwrap();
        assert!(matches!(
            decode(&mapping, raw),
            Err(DecodeError::UnknownEvent(_))
        ));

        let raw: RawEvent = serde_json::from_value(serde_json::json!({
            "event": "win",
            "timestamp": "2022-06-15T14:00:00Z"
        }))
        .unwrap();
        assert!(matches!(decode(&mapping, raw), Err(DecodeError::NoKey)));
    }
}
