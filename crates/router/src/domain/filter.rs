//! The static filter pipeline.
//!
//! For every inbound request each agent configuration runs through a fixed
//! sequence of predicates, ordered so that constant time rejections come
//! before regex evaluation. The first failing stage names the rejection
//! reason; survivors produce the set of (ad spot, creatives) pairs the agent
//! may bid on. Regex verdicts are memoized per request, keyed by the regex's
//! identity hash, so agents sharing a pattern pay for one evaluation.

use model::{
    agent::{AgentConfig, CachedRegex},
    hash::stable_hash,
    ids::CreativeId,
    request::BidRequest,
};
use rustc_hash::FxHashMap;
use std::fmt;

/// Segment source that carries the page's ad tags.
pub const AD_TAG_SOURCE: &str = "tags";

/// The pipeline stage that rejected an agent, used as a metric label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    Exchange,
    HourOfWeek,
    UserPartition,
    RequiredUserIds,
    Segments,
    Host,
    Url,
    Language,
    Location,
    FoldPosition,
    AdTags,
    NoCompatibleSpots,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exchange => "exchange",
            Self::HourOfWeek => "hour-of-week",
            Self::UserPartition => "user-partition",
            Self::RequiredUserIds => "required-user-ids",
            Self::Segments => "segments",
            Self::Host => "host",
            Self::Url => "url",
            Self::Language => "language",
            Self::Location => "location",
            Self::FoldPosition => "fold-position",
            Self::AdTags => "ad-tags",
            Self::NoCompatibleSpots => "no-compatible-spots",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The spots an agent may bid on, with the creatives that survived
/// compatibility checks per spot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BiddableSpots(pub Vec<BiddableSpot>);

#[derive(Clone, Debug, PartialEq)]
pub struct BiddableSpot {
    /// Index into `request.spots`.
    pub spot: usize,
    pub creatives: Vec<CreativeId>,
}

impl BiddableSpots {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn creatives_for(&self, spot: usize) -> Option<&[CreativeId]> {
        self.0
            .iter()
            .find(|entry| entry.spot == spot)
            .map(|entry| entry.creatives.as_slice())
    }
}

/// Per-request filter state, shared across all agents evaluated against one
/// request and then discarded.
pub struct FilterCache {
    host: String,
    url: String,
    url_hash: u64,
    language: String,
    location: String,
    location_hash: u64,
    url_memo: FxHashMap<(u64, u64), bool>,
    language_memo: FxHashMap<(u64, u64), bool>,
    location_memo: FxHashMap<(u64, u64), bool>,
}

impl FilterCache {
    pub fn new(request: &BidRequest) -> Self {
        let host = url::Url::parse(&request.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_default();
        let language = if request.language.is_empty() {
            "unspecified".to_owned()
        } else {
            request.language.clone()
        };
        Self {
            host,
            url_hash: stable_hash(&request.url),
            url: request.url.clone(),
            language,
            location_hash: stable_hash(&request.location),
            location: request.location.clone(),
            url_memo: FxHashMap::default(),
            language_memo: FxHashMap::default(),
            location_memo: FxHashMap::default(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn memoized(
        memo: &mut FxHashMap<(u64, u64), bool>,
        regex: &CachedRegex,
        input: &str,
        input_hash: u64,
    ) -> bool {
        *memo
            .entry((regex.identity_hash(), input_hash))
            .or_insert_with(|| regex.is_match(input))
    }

    pub fn url_matches(&mut self, regex: &CachedRegex) -> bool {
        Self::memoized(&mut self.url_memo, regex, &self.url, self.url_hash)
    }

    pub fn language_matches(&mut self, regex: &CachedRegex) -> bool {
        let hash = stable_hash(&self.language);
        Self::memoized(&mut self.language_memo, regex, &self.language, hash)
    }

    pub fn location_matches(&mut self, regex: &CachedRegex) -> bool {
        Self::memoized(
            &mut self.location_memo,
            regex,
            &self.location,
            self.location_hash,
        )
    }
}

/// Runs the full pipeline for one agent.
///
/// `partition_draw` supplies the bucket for the random user partition source;
/// every other source is deterministic (callers pass the rng draw so tests
/// stay reproducible).
pub fn biddable_spots(
    config: &AgentConfig,
    request: &BidRequest,
    cache: &mut FilterCache,
    partition_draw: impl FnOnce(u32) -> u32,
) -> Result<BiddableSpots, Reason> {
    let exchange = request.exchange.as_str();

    // 1. Exchange.
    if !config.exchange_filter.passes_str(exchange) {
        return Err(Reason::Exchange);
    }

    // 2. Hour of week.
    if !config.hour_of_week.is_default() && !config.hour_of_week.is_included(request.timestamp) {
        return Err(Reason::HourOfWeek);
    }

    // 3. User partition.
    if !config.user_partition.is_default() {
        let bucket = config.user_partition.bucket(
            &request.user_ids,
            &request.ip,
            &request.user_agent,
            partition_draw,
        );
        match bucket {
            Some(bucket) if config.user_partition.accepts(bucket) => {}
            _ => return Err(Reason::UserPartition),
        }
    }

    // 4. Required user id sources.
    if config
        .required_user_ids
        .iter()
        .any(|source| request.user_ids.get(source).is_none())
    {
        return Err(Reason::RequiredUserIds);
    }

    // 5. Per-source segment targeting.
    for (source, filter) in &config.segments {
        if !filter.applies_to(exchange) {
            continue;
        }
        if !filter.passes(request.segments.get(source)) {
            return Err(Reason::Segments);
        }
    }

    // 6. Host.
    if !config.host_filter.is_empty()
        && !config.host_filter.passes(|domain| domain.matches(cache.host()))
    {
        return Err(Reason::Host);
    }

    // 7-9. Memoized regex filters.
    if !config.url_filter.is_empty() && !config.url_filter.passes(|regex| cache.url_matches(regex))
    {
        return Err(Reason::Url);
    }
    if !config.language_filter.is_empty()
        && !config
            .language_filter
            .passes(|regex| cache.language_matches(regex))
    {
        return Err(Reason::Language);
    }
    if !config.location_filter.is_empty()
        && !config
            .location_filter
            .passes(|regex| cache.location_matches(regex))
    {
        return Err(Reason::Location);
    }

    // 10. Fold position, retaining only matching spots.
    let spots: Vec<usize> = request
        .spots
        .iter()
        .enumerate()
        .filter(|(_, spot)| {
            config
                .fold_position_filter
                .passes(|position| *position == spot.position)
        })
        .map(|(index, _)| index)
        .collect();
    if spots.is_empty() {
        return Err(Reason::FoldPosition);
    }

    // 11. Ad tag segments.
    let ad_tags = request.segments.get(AD_TAG_SOURCE);
    if config.tag_filter.applies_to(exchange) && !config.tag_filter.passes(ad_tags) {
        return Err(Reason::AdTags);
    }

    // 12. Per-spot creative compatibility.
    let language = cache.language.clone();
    let biddable = BiddableSpots(
        spots
            .into_iter()
            .filter_map(|index| {
                let spot = &request.spots[index];
                let creatives: Vec<CreativeId> = config
                    .creatives
                    .iter()
                    .filter(|creative| {
                        creative.compatible(spot)
                            && creative.biddable(
                                exchange,
                                &language,
                                |regex| cache.location_matches(regex),
                                ad_tags,
                            )
                    })
                    .map(|creative| creative.id)
                    .collect();
                (!creatives.is_empty()).then_some(BiddableSpot {
                    spot: index,
                    creatives,
                })
            })
            .collect(),
    );

    if biddable.is_empty() {
        return Err(Reason::NoCompatibleSpots);
    }
    Ok(biddable)
}
