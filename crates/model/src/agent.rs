//! Declarative bidding policy of one agent.
//!
//! An agent registers a configuration document describing what traffic it
//! wants to see and how the router should bid on its behalf. The router never
//! mutates a config; registration publishes a new snapshot instead.

use crate::{
    hash::stable_hash,
    ids::{AccountId, CreativeId},
    money::Amount,
    request::{AdSpot, FoldPosition, Format, SegmentList, UserIds},
};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;

/// A generic include/exclude pair. An empty include list admits everything;
/// the exclude list always wins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncludeExclude<T> {
    #[serde(default = "Vec::new")]
    pub include: Vec<T>,
    #[serde(default = "Vec::new")]
    pub exclude: Vec<T>,
}

impl<T> Default for IncludeExclude<T> {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl<T> IncludeExclude<T> {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Evaluates the pair with a caller supplied match predicate.
    pub fn passes(&self, mut matches: impl FnMut(&T) -> bool) -> bool {
        if self.exclude.iter().any(&mut matches) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(&mut matches)
    }
}

impl IncludeExclude<String> {
    pub fn passes_str(&self, value: &str) -> bool {
        self.passes(|entry| entry == value)
    }
}

/// A compiled regex carrying a stable identity hash of its pattern, so that
/// per-request caches can memoize match results across agents sharing the
/// same pattern.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CachedRegex {
    regex: regex::Regex,
    hash: u64,
}

impl CachedRegex {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: regex::Regex::new(pattern)?,
            hash: stable_hash(pattern),
        })
    }

    pub fn identity_hash(&self) -> u64 {
        self.hash
    }

    pub fn is_match(&self, input: &str) -> bool {
        self.regex.is_match(input)
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

impl TryFrom<String> for CachedRegex {
    type Error = regex::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<CachedRegex> for String {
    fn from(value: CachedRegex) -> Self {
        value.as_str().to_owned()
    }
}

/// Matches a hostname against a configured domain: the domain itself or any
/// subdomain of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainMatcher(pub String);

impl DomainMatcher {
    pub fn matches(&self, host: &str) -> bool {
        host == self.0 || host.strip_suffix(&self.0).is_some_and(|rest| rest.ends_with('.'))
    }
}

/// 168 bit calendar mask, one bit per UTC hour of the week starting Sunday
/// midnight. A clear bit rejects the whole hour.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HourOfWeekFilter {
    bits: [u64; 3],
}

impl HourOfWeekFilter {
    pub const HOURS: usize = 168;

    pub fn all_hours() -> Self {
        let mut filter = Self { bits: [0; 3] };
        for hour in 0..Self::HOURS {
            filter.set(hour, true);
        }
        filter
    }

    pub fn set(&mut self, hour: usize, included: bool) {
        debug_assert!(hour < Self::HOURS);
        let (word, bit) = (hour / 64, hour % 64);
        if included {
            self.bits[word] |= 1 << bit;
        } else {
            self.bits[word] &= !(1 << bit);
        }
    }

    pub fn bit(&self, hour: usize) -> bool {
        debug_assert!(hour < Self::HOURS);
        self.bits[hour / 64] >> (hour % 64) & 1 == 1
    }

    /// True when every hour is included, in which case the filter stage is
    /// skipped entirely.
    pub fn is_default(&self) -> bool {
        (0..Self::HOURS).all(|hour| self.bit(hour))
    }

    pub fn hour_index(timestamp: DateTime<Utc>) -> usize {
        timestamp.weekday().num_days_from_sunday() as usize * 24 + timestamp.hour() as usize
    }

    pub fn is_included(&self, timestamp: DateTime<Utc>) -> bool {
        self.bit(Self::hour_index(timestamp))
    }
}

impl Default for HourOfWeekFilter {
    fn default() -> Self {
        Self::all_hours()
    }
}

impl TryFrom<String> for HourOfWeekFilter {
    type Error = InvalidConfig;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() != Self::HOURS {
            return Err(InvalidConfig::HourBitmapLength(value.len()));
        }
        let mut filter = Self { bits: [0; 3] };
        for (hour, ch) in value.chars().enumerate() {
            match ch {
                '1' => filter.set(hour, true),
                '0' => {}
                other => return Err(InvalidConfig::HourBitmapChar(other)),
            }
        }
        Ok(filter)
    }
}

impl From<HourOfWeekFilter> for String {
    fn from(value: HourOfWeekFilter) -> Self {
        (0..HourOfWeekFilter::HOURS)
            .map(|hour| if value.bit(hour) { '1' } else { '0' })
            .collect()
    }
}

/// Which request field the user partition hashes on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashSource {
    /// The bucket is always zero.
    #[default]
    None,
    /// A fresh random draw per request.
    Random,
    ExchangeId,
    ProviderId,
    /// IP and user agent concatenated with no separator.
    IpUa,
}

/// Half open accepted bucket range, `first <= bucket < last`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub first: u32,
    pub last: u32,
}

impl Interval {
    pub fn contains(&self, value: u32) -> bool {
        value >= self.first && value < self.last
    }
}

/// Deterministic hash-mod-N user bucketing for traffic splits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserPartition {
    #[serde(default)]
    pub hash_on: HashSource,
    pub modulus: u32,
    pub include_ranges: Vec<Interval>,
}

impl Default for UserPartition {
    fn default() -> Self {
        Self {
            hash_on: HashSource::None,
            modulus: 1,
            include_ranges: vec![Interval { first: 0, last: 1 }],
        }
    }
}

impl UserPartition {
    /// True for the default partition which accepts everyone.
    pub fn is_default(&self) -> bool {
        self.hash_on == HashSource::None
            && self.modulus == 1
            && self.include_ranges == vec![Interval { first: 0, last: 1 }]
    }

    /// Computes the bucket for a request. `random` supplies the draw for the
    /// `Random` source so that callers control determinism.
    pub fn bucket(
        &self,
        user_ids: &UserIds,
        ip: &str,
        user_agent: &str,
        random: impl FnOnce(u32) -> u32,
    ) -> Option<u32> {
        let modulus = self.modulus.max(1);
        let bucket = match self.hash_on {
            HashSource::None => 0,
            HashSource::Random => random(modulus),
            HashSource::ExchangeId => {
                (stable_hash(user_ids.exchange_id.as_deref()?) % modulus as u64) as u32
            }
            HashSource::ProviderId => {
                (stable_hash(user_ids.provider_id.as_deref()?) % modulus as u64) as u32
            }
            HashSource::IpUa => {
                let mut key = String::with_capacity(ip.len() + user_agent.len());
                key.push_str(ip);
                key.push_str(user_agent);
                (stable_hash(&key) % modulus as u64) as u32
            }
        };
        Some(bucket)
    }

    pub fn accepts(&self, bucket: u32) -> bool {
        self.include_ranges.iter().any(|range| range.contains(bucket))
    }
}

/// Per data-provider segment targeting.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SegmentFilter {
    #[serde(default)]
    pub include: SegmentList,
    #[serde(default)]
    pub exclude: SegmentList,
    /// Reject requests that carry no segments at all from this source.
    #[serde(default)]
    pub exclude_if_not_present: bool,
    /// Exchanges this filter applies to; excluded exchanges bypass it.
    #[serde(default)]
    pub apply_to_exchanges: IncludeExclude<String>,
}

impl SegmentFilter {
    pub fn applies_to(&self, exchange: &str) -> bool {
        self.apply_to_exchanges.passes_str(exchange)
    }

    /// Evaluates the filter against one source's segments. `None` means the
    /// source was absent from the request.
    pub fn passes(&self, segments: Option<&SegmentList>) -> bool {
        let Some(segments) = segments else {
            return !self.exclude_if_not_present;
        };
        if self.exclude.intersects(segments) {
            return false;
        }
        self.include.is_empty() || self.include.intersects(segments)
    }
}

/// Who ends up computing the bid price.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BidControl {
    /// Relay the request to the agent, which computes the price.
    #[default]
    Relay,
    /// Relay to the agent but always bid the fixed price.
    RelayFixed { fixed_cpm: Amount },
    /// Bid the fixed price without relaying at all.
    Fixed { fixed_cpm: Amount },
}

impl BidControl {
    pub fn fixed_price(&self) -> Option<Amount> {
        match self {
            Self::Relay => None,
            Self::RelayFixed { fixed_cpm } | Self::Fixed { fixed_cpm } => Some(*fixed_cpm),
        }
    }

    /// Whether the request is forwarded to the agent at all.
    pub fn relays(&self) -> bool {
        !matches!(self, Self::Fixed { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlacklistKind {
    #[default]
    Off,
    /// Blacklist the user everywhere.
    User,
    /// Blacklist the user on the site that was bid on.
    UserOnSite,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlacklistScope {
    #[default]
    Agent,
    Account,
}

/// Post-win user blacklisting policy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Blacklist {
    #[serde(default)]
    pub kind: BlacklistKind,
    #[serde(default)]
    pub scope: BlacklistScope,
    #[serde(default, with = "duration_secs")]
    pub duration: Duration,
}

impl Blacklist {
    pub fn is_active(&self) -> bool {
        self.kind != BlacklistKind::Off && !self.duration.is_zero()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs_f64(f64::deserialize(deserializer)?))
    }
}

/// One augmentor the agent wants consulted before bidding.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AugmentationConfig {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Tags from the augmentor that gate participation.
    #[serde(default)]
    pub filters: IncludeExclude<String>,
    /// Reject the request when the augmentor produced no data for it.
    #[serde(default)]
    pub required: bool,
}

/// How much detail the agent wants in result messages per outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultVerbosity {
    #[default]
    Full,
    Lightweight,
    None,
}

/// An ad unit owned by an agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Creative {
    pub id: CreativeId,
    #[serde(default)]
    pub name: String,
    pub format: Format,
    /// Labels attached by the campaign tooling, preserved into the journal.
    #[serde(default)]
    pub tags: SegmentList,
    /// Eligibility predicate over the request's ad-tag segments.
    #[serde(default)]
    pub tag_filter: IncludeExclude<String>,
    #[serde(default)]
    pub language_filter: IncludeExclude<String>,
    #[serde(default)]
    pub location_filter: IncludeExclude<CachedRegex>,
    #[serde(default)]
    pub exchange_filter: IncludeExclude<String>,
    /// Per exchange-connector payload, keyed by provider name. Connectors
    /// declare and decode their own payload type.
    #[serde(default)]
    pub provider_config: BTreeMap<String, serde_json::Value>,
}

impl Creative {
    /// Is the creative's format accepted by the given ad spot?
    pub fn compatible(&self, spot: &AdSpot) -> bool {
        spot.formats.iter().any(|format| *format == self.format)
    }

    /// Does the creative's own targeting accept this exchange and request?
    pub fn biddable(
        &self,
        exchange: &str,
        language: &str,
        mut location_matches: impl FnMut(&CachedRegex) -> bool,
        ad_tags: Option<&SegmentList>,
    ) -> bool {
        self.exchange_filter.passes_str(exchange)
            && self.language_filter.passes_str(language)
            && self.location_filter.passes(&mut location_matches)
            && (self.tag_filter.is_empty()
                || self
                    .tag_filter
                    .passes(|tag| ad_tags.is_some_and(|tags| tags.contains(tag))))
    }
}

/// The full bidding policy of one agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Who to bill.
    pub account: AccountId,
    /// Id used to reconcile with external systems.
    #[serde(default)]
    pub external_id: u64,
    /// Test agents never make real bids.
    #[serde(default)]
    pub test: bool,
    /// Passive agents observe requests without bidding and may omit creatives.
    #[serde(default)]
    pub passive: bool,

    /// Agents sharing a group receive a within-group load balanced share of
    /// requests instead of all seeing every request. Empty defaults to the
    /// agent's own name at registration.
    #[serde(default)]
    pub round_robin_group: String,
    #[serde(default = "default_weight")]
    pub round_robin_weight: u32,

    /// Probability of entering any given auction, in [0, 1].
    #[serde(default = "default_bid_probability")]
    pub bid_probability: f64,
    /// Skip auctions with less remaining time than this.
    #[serde(default, with = "duration_secs")]
    pub min_time_available: Duration,
    /// Cap on simultaneously outstanding bid requests.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// User id sources that must be present on the request.
    #[serde(default)]
    pub required_user_ids: Vec<String>,

    #[serde(default)]
    pub host_filter: IncludeExclude<DomainMatcher>,
    #[serde(default)]
    pub url_filter: IncludeExclude<CachedRegex>,
    #[serde(default)]
    pub language_filter: IncludeExclude<CachedRegex>,
    #[serde(default)]
    pub location_filter: IncludeExclude<CachedRegex>,
    #[serde(default)]
    pub exchange_filter: IncludeExclude<String>,
    #[serde(default)]
    pub fold_position_filter: IncludeExclude<FoldPosition>,
    /// Per segment-source targeting, keyed by source name.
    #[serde(default)]
    pub segments: BTreeMap<String, SegmentFilter>,
    /// Targeting over the request's ad-tag segments.
    #[serde(default)]
    pub tag_filter: SegmentFilter,
    #[serde(default)]
    pub hour_of_week: HourOfWeekFilter,
    #[serde(default)]
    pub user_partition: UserPartition,

    #[serde(default)]
    pub creatives: Vec<Creative>,

    #[serde(default)]
    pub blacklist: Blacklist,
    #[serde(default)]
    pub bid_control: BidControl,
    #[serde(default)]
    pub augmentations: Vec<AugmentationConfig>,
    /// Channels for which post impression visit events are wanted.
    #[serde(default)]
    pub visit_channels: SegmentList,

    #[serde(default)]
    pub win_format: ResultVerbosity,
    #[serde(default)]
    pub loss_format: ResultVerbosity,
    #[serde(default)]
    pub error_format: ResultVerbosity,

    /// Opaque pass-through configuration keyed by provider name.
    #[serde(default)]
    pub provider_config: BTreeMap<String, serde_json::Value>,
}

fn default_weight() -> u32 {
    1
}

fn default_bid_probability() -> f64 {
    1.0
}

fn default_max_in_flight() -> usize {
    100
}

impl AgentConfig {
    pub fn parse(document: &str) -> Result<Self, InvalidConfig> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if !(0.0..=1.0).contains(&self.bid_probability) {
            return Err(InvalidConfig::BidProbability(self.bid_probability));
        }
        if self.creatives.is_empty() && !self.passive {
            return Err(InvalidConfig::NoCreatives);
        }
        let mut ids: Vec<_> = self.creatives.iter().map(|c| c.id).collect();
        ids.sort();
        ids.dedup();
        if ids.len() != self.creatives.len() {
            return Err(InvalidConfig::DuplicateCreativeId);
        }
        if let Some(price) = self.bid_control.fixed_price() {
            if price.micros <= 0 {
                return Err(InvalidConfig::FixedPrice(price));
            }
        }
        for window in self.augmentations.windows(2) {
            if window[0].name >= window[1].name {
                return Err(InvalidConfig::AugmentationsUnordered);
            }
        }
        Ok(())
    }

    /// All augmentor names this agent depends on, in order.
    pub fn augmentor_names(&self) -> impl Iterator<Item = &str> {
        self.augmentations.iter().map(|a| a.name.as_str())
    }
}

#[derive(Debug, Error)]
pub enum InvalidConfig {
    #[error("malformed configuration document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bid probability {0} outside [0, 1]")]
    BidProbability(f64),
    #[error("non-passive agent has no creatives")]
    NoCreatives,
    #[error("duplicate creative id")]
    DuplicateCreativeId,
    #[error("fixed bid price {0} must be positive")]
    FixedPrice(Amount),
    #[error("augmentations must be ordered by name")]
    AugmentationsUnordered,
    #[error("hour of week bitmap has {0} characters, expected 168")]
    HourBitmapLength(usize),
    #[error("hour of week bitmap contains {0:?}, expected 0 or 1")]
    HourBitmapChar(char),
}
