//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Topic routing: maps `(exchange, routing key)` to the subscriptions whose binding pattern
// matches. Bindings are indexed in one segment trie per exchange.
//
// | Component      | Description                                                     |
// |----------------|-----------------------------------------------------------------|
// | RoutingKey     | Validated dot-separated key carried by every event              |
// | TopicPattern   | Binding pattern; `*` = exactly one segment, `#` = zero or more  |
// | TopicRouter    | Subscription index answering "who gets this event?"             |
//--------------------------------------------------------------------------------------------------

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};
use crate::types::{QueueId, Subscription, SubscriptionId};

const SEGMENT_SEPARATOR: char = '.';
const WILDCARD_ONE: &str = "*";
const WILDCARD_ANY: &str = "#";

/// Dot-separated routing key such as `product.created`.
///
/// Keys are non-empty, have no empty segments and never contain wildcard characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn parse(key: impl Into<String>) -> BrokerResult<Self> {
        let key = key.into();
        let invalid = |reason: String| BrokerError::InvalidRoutingKey {
            key: key.clone(),
            reason,
        };

        if key.is_empty() {
            return Err(invalid("routing key cannot be empty".to_owned()));
        }

        for (position, segment) in key.split(SEGMENT_SEPARATOR).enumerate() {
            if segment.is_empty() {
                return Err(invalid(format!("empty segment at position {position}")));
            }
            if segment.contains(['*', '#']) {
                return Err(invalid(format!(
                    "wildcards are not allowed in routing keys, found '{segment}'"
                )));
            }
        }

        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEGMENT_SEPARATOR)
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = BrokerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoutingKey> for String {
    fn from(key: RoutingKey) -> Self {
        key.0
    }
}

impl FromStr for RoutingKey {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for RoutingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`
    One,
    /// `#`
    Any,
}

/// Binding pattern with AMQP topic semantics.
///
/// - `*` matches exactly one segment: `product.*` matches `product.created` but not
///   `product.created.extra`
/// - `#` matches zero or more segments anywhere: `product.#` matches `product`,
///   `product.created` and `product.created.extra`; `#.created` matches `created`
///
/// Wildcards must be whole segments and matching is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicPattern {
    segments: Vec<Segment>,
    original: String,
}

impl TopicPattern {
    pub fn parse(pattern: impl Into<String>) -> BrokerResult<Self> {
        let pattern = pattern.into();
        let invalid = |reason: String| BrokerError::InvalidPattern {
            pattern: pattern.clone(),
            reason,
        };

        if pattern.is_empty() {
            return Err(invalid("pattern cannot be empty".to_owned()));
        }

        let mut segments = Vec::new();
        for (position, part) in pattern.split(SEGMENT_SEPARATOR).enumerate() {
            let segment = match part {
                "" => return Err(invalid(format!("empty segment at position {position}"))),
                WILDCARD_ONE => Segment::One,
                WILDCARD_ANY => Segment::Any,
                literal if literal.contains(['*', '#']) => {
                    return Err(invalid(format!(
                        "wildcards must be standalone segments, found '{literal}'"
                    )));
                }
                literal => Segment::Literal(literal.to_owned()),
            };

            // `#.#` matches exactly what `#` matches
            if segment == Segment::Any && segments.last() == Some(&Segment::Any) {
                continue;
            }
            segments.push(segment);
        }

        Ok(Self {
            segments,
            original: pattern,
        })
    }

    pub fn matches(&self, key: &RoutingKey) -> bool {
        let key: Vec<&str> = key.segments().collect();
        matches_segments(&self.segments, &key)
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::One | Segment::Any))
    }
}

fn matches_segments(pattern: &[Segment], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((Segment::Any, rest)) => (0..=key.len()).any(|skip| matches_segments(rest, &key[skip..])),
        Some((Segment::One, rest)) => !key.is_empty() && matches_segments(rest, &key[1..]),
        Some((Segment::Literal(literal), rest)) => {
            key.first().is_some_and(|segment| *segment == literal.as_str())
                && matches_segments(rest, &key[1..])
        }
    }
}

impl TryFrom<String> for TopicPattern {
    type Error = BrokerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TopicPattern> for String {
    fn from(pattern: TopicPattern) -> Self {
        pattern.original
    }
}

impl FromStr for TopicPattern {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// One level of the binding trie
#[derive(Debug, Default)]
struct TrieNode {
    literals: HashMap<String, TrieNode>,
    one: Option<Box<TrieNode>>,
    any: Option<Box<TrieNode>>,
    bound: BTreeSet<SubscriptionId>,
}

impl TrieNode {
    fn insert(&mut self, pattern: &[Segment], id: SubscriptionId) {
        match pattern.split_first() {
            None => {
                self.bound.insert(id);
            }
            Some((Segment::Literal(literal), rest)) => self
                .literals
                .entry(literal.clone())
                .or_default()
                .insert(rest, id),
            Some((Segment::One, rest)) => self.one.get_or_insert_with(Default::default).insert(rest, id),
            Some((Segment::Any, rest)) => self.any.get_or_insert_with(Default::default).insert(rest, id),
        }
    }

    /// Removes the binding and prunes branches left empty
    fn remove(&mut self, pattern: &[Segment], id: &SubscriptionId) {
        match pattern.split_first() {
            None => {
                self.bound.remove(id);
            }
            Some((Segment::Literal(literal), rest)) => {
                if let Some(child) = self.literals.get_mut(literal) {
                    child.remove(rest, id);
                    if child.is_empty() {
                        self.literals.remove(literal);
                    }
                }
            }
            Some((Segment::One, rest)) => Self::remove_boxed(&mut self.one, rest, id),
            Some((Segment::Any, rest)) => Self::remove_boxed(&mut self.any, rest, id),
        }
    }

    fn remove_boxed(slot: &mut Option<Box<TrieNode>>, pattern: &[Segment], id: &SubscriptionId) {
        if let Some(child) = slot.as_mut() {
            child.remove(pattern, id);
            if child.is_empty() {
                *slot = None;
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.bound.is_empty() && self.literals.is_empty() && self.one.is_none() && self.any.is_none()
    }

    fn collect(&self, key: &[&str], out: &mut BTreeSet<SubscriptionId>) {
        if let Some(any) = &self.any {
            for skip in 0..=key.len() {
                any.collect(&key[skip..], out);
            }
        }

        match key.split_first() {
            None => out.extend(self.bound.iter().cloned()),
            Some((head, rest)) => {
                if let Some(child) = self.literals.get(*head) {
                    child.collect(rest, out);
                }
                if let Some(one) = &self.one {
                    one.collect(rest, out);
                }
            }
        }
    }
}

/// In-memory subscription index.
///
/// Holds no I/O state; it can always be rebuilt from the subscription list with
/// [`TopicRouter::from_subscriptions`].
#[derive(Debug, Default)]
pub struct TopicRouter {
    exchanges: HashMap<String, TrieNode>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_subscriptions(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        let mut router = Self::new();
        for subscription in subscriptions {
            router.register(subscription);
        }
        router
    }

    /// Adds a binding, replacing the previous one registered under the same id.
    ///
    /// Returns the replaced subscription, if any.
    pub fn register(&mut self, subscription: Subscription) -> Option<Subscription> {
        let previous = self.unregister(&subscription.id);

        self.exchanges
            .entry(subscription.exchange.clone())
            .or_default()
            .insert(&subscription.pattern.segments, subscription.id.clone());
        self.subscriptions.insert(subscription.id.clone(), subscription);

        previous
    }

    /// Removes a binding. Unknown ids are ignored.
    pub fn unregister(&mut self, id: &SubscriptionId) -> Option<Subscription> {
        let subscription = self.subscriptions.remove(id)?;

        if let Some(root) = self.exchanges.get_mut(&subscription.exchange) {
            root.remove(&subscription.pattern.segments, id);
            if root.is_empty() {
                self.exchanges.remove(&subscription.exchange);
            }
        }

        Some(subscription)
    }

    /// Removes every binding pointing at `queue_id`
    pub fn unregister_queue(&mut self, queue_id: &QueueId) -> Vec<Subscription> {
        let ids: Vec<SubscriptionId> = self
            .subscriptions
            .values()
            .filter(|subscription| &subscription.queue_id == queue_id)
            .map(|subscription| subscription.id.clone())
            .collect();

        ids.iter().filter_map(|id| self.unregister(id)).collect()
    }

    /// Subscriptions whose pattern matches `key` on `exchange`, ordered by id
    pub fn route(&self, exchange: &str, key: &RoutingKey) -> Vec<&Subscription> {
        let Some(root) = self.exchanges.get(exchange) else {
            return Vec::new();
        };

        let segments: Vec<&str> = key.segments().collect();
        let mut matched = BTreeSet::new();
        root.collect(&segments, &mut matched);

        matched
            .iter()
            .filter_map(|id| self.subscriptions.get(id))
            .collect()
    }

    /// Distinct queues that must receive an entry for `key`, sorted by queue id.
    ///
    /// Subscriptions sharing a queue (a consumer group) yield a single queue.
    pub fn queues_for(&self, exchange: &str, key: &RoutingKey) -> Vec<QueueId> {
        self.route(exchange, key)
            .into_iter()
            .map(|subscription| subscription.queue_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    pub fn bindings_for(&self, queue_id: &QueueId) -> usize {
        self.subscriptions
            .values()
            .filter(|subscription| &subscription.queue_id == queue_id)
            .count()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(value: &str) -> RoutingKey {
        RoutingKey::parse(value).unwrap()
    }

    fn pattern(value: &str) -> TopicPattern {
        TopicPattern::parse(value).unwrap()
    }

    fn subscription(id: &str, exchange: &str, binding: &str, queue: &str) -> Subscription {
        Subscription::new(SubscriptionId::new(id), exchange, pattern(binding), QueueId::new(queue))
    }

    fn routed_ids(router: &TopicRouter, exchange: &str, routing_key: &str) -> Vec<String> {
        router
            .route(exchange, &key(routing_key))
            .into_iter()
            .map(|subscription| subscription.id.to_string())
            .collect()
    }

    #[test]
    fn test_routing_key_validation() {
        assert!(RoutingKey::parse("product.created").is_ok());
        assert!(RoutingKey::parse("product").is_ok());

        for bad in ["", ".product", "product.", "product..created", "product.*", "product.#", "pro*duct"] {
            assert!(
                matches!(RoutingKey::parse(bad), Err(BrokerError::InvalidRoutingKey { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_pattern_validation() {
        for good in ["product.*", "product.#", "#", "*", "#.created", "a.*.#.z"] {
            assert!(TopicPattern::parse(good).is_ok(), "{good:?} should parse");
        }

        for bad in ["", "product.", "product..created", "prod*", "product.cre#ated"] {
            assert!(
                matches!(TopicPattern::parse(bad), Err(BrokerError::InvalidPattern { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_literal_patterns_have_no_wildcards() {
        assert!(!pattern("product.created").has_wildcards());
        assert!(!pattern("product").has_wildcards());
        assert!(pattern("product.*").has_wildcards());
        assert!(pattern("#.created").has_wildcards());
        assert_eq!(pattern("a.*.#.z").as_str(), "a.*.#.z");
    }

    #[test]
    fn test_star_matches_exactly_one_segment() {
        let star = pattern("product.*");
        assert!(star.matches(&key("product.created")));
        assert!(!star.matches(&key("product")));
        assert!(!star.matches(&key("product.created.extra")));
        assert!(!star.matches(&key("order.created")));
    }

    #[test]
    fn test_hash_matches_zero_or_more_segments() {
        let trailing = pattern("product.#");
        assert!(trailing.matches(&key("product")));
        assert!(trailing.matches(&key("product.created")));
        assert!(trailing.matches(&key("product.created.extra")));

        let leading = pattern("#.created");
        assert!(leading.matches(&key("created")));
        assert!(leading.matches(&key("product.created")));
        assert!(leading.matches(&key("a.b.created")));
        assert!(!leading.matches(&key("product.deleted")));

        let middle = pattern("product.#.done");
        assert!(middle.matches(&key("product.done")));
        assert!(middle.matches(&key("product.image.upload.done")));
        assert!(!middle.matches(&key("product.image")));

        assert!(pattern("#").matches(&key("anything.at.all")));
        assert!(pattern("#.#").matches(&key("x")));
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        assert!(!pattern("Product.*").matches(&key("product.created")));
        assert!(!pattern("product.created").matches(&key("product.Created")));
    }

    #[test]
    fn test_route_uses_trie_consistently_with_pattern_grammar() {
        let bindings = [
            ("a", "product.*"),
            ("b", "product.#"),
            ("c", "#.created"),
            ("d", "*.created.*"),
            ("e", "product.created"),
            ("f", "#"),
        ];
        let router = TopicRouter::from_subscriptions(
            bindings
                .iter()
                .map(|(id, binding)| subscription(id, "product.exchange", binding, id)),
        );

        for routing_key in ["product", "product.created", "product.created.extra", "created", "x.created.y"] {
            let expected: Vec<String> = bindings
                .iter()
                .filter(|(_, binding)| pattern(binding).matches(&key(routing_key)))
                .map(|(id, _)| id.to_string())
                .collect();
            assert_eq!(routed_ids(&router, "product.exchange", routing_key), expected, "key {routing_key}");
        }
    }

    #[test]
    fn test_exchanges_are_isolated() {
        let mut router = TopicRouter::new();
        router.register(subscription("s1", "product.exchange", "product.*", "q1"));

        assert_eq!(routed_ids(&router, "product.exchange", "product.created"), vec!["s1"]);
        assert!(routed_ids(&router, "order.exchange", "product.created").is_empty());
    }

    #[test]
    fn test_register_is_idempotent_and_updates_pattern() {
        let mut router = TopicRouter::new();
        assert!(router.register(subscription("s1", "ex", "product.*", "q1")).is_none());
        assert!(router.register(subscription("s1", "ex", "product.*", "q1")).is_some());
        assert_eq!(router.len(), 1);

        router.register(subscription("s1", "ex", "order.*", "q1"));
        assert!(routed_ids(&router, "ex", "product.created").is_empty());
        assert_eq!(routed_ids(&router, "ex", "order.created"), vec!["s1"]);
    }

    #[test]
    fn test_unregister_is_idempotent_and_prunes() {
        let mut router = TopicRouter::new();
        router.register(subscription("s1", "ex", "product.*", "q1"));

        assert!(router.unregister(&SubscriptionId::new("s1")).is_some());
        assert!(router.unregister(&SubscriptionId::new("s1")).is_none());
        assert!(router.is_empty());
        assert!(router.exchanges.is_empty());
    }

    #[test]
    fn test_group_members_share_one_queue() {
        let mut router = TopicRouter::new();
        router.register(subscription("m1", "ex", "product.*", "mailers").in_group("mailers"));
        router.register(subscription("m2", "ex", "product.*", "mailers").in_group("mailers"));
        router.register(subscription("audit", "ex", "#", "audit"));

        assert_eq!(
            router.queues_for("ex", &key("product.created")),
            vec![QueueId::new("audit"), QueueId::new("mailers")]
        );
        assert_eq!(router.bindings_for(&QueueId::new("mailers")), 2);

        let removed = router.unregister_queue(&QueueId::new("mailers"));
        assert_eq!(removed.len(), 2);
        assert_eq!(router.queues_for("ex", &key("product.created")), vec![QueueId::new("audit")]);
    }

    #[test]
    fn test_patterns_round_trip_through_serde() {
        let original = subscription("s1", "ex", "product.#", "q1");
        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains("\"product.#\""));
        let decoded: Subscription = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);

        let bad = json.replace("product.#", "product..#");
        assert!(serde_json::from_str::<Subscription>(&bad).is_err());
    }
}
