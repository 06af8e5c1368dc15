//! Destinations and the routing policy that picks them.
//!
//! A [`Destination`] is either a topic on a log broker (Kafka) or an
//! exchange + routing key on a routing broker (RabbitMQ). The
//! [`RoutingPolicy`] maps an envelope's type to a destination using explicit
//! rules and a fallback; it is a pure function of the envelope and the
//! configuration it was built from.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

use crate::bus::{BusError, Result};
use crate::envelope::Envelope;

/// Exchange type on a routing broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    #[default]
    Topic,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical destination of one envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Log broker: topic plus the key used to pick a partition.
    Topic {
        topic: String,
        partition_key: Option<String>,
    },
    /// Routing broker: exchange, routing key and exchange type.
    Exchange {
        exchange: String,
        routing_key: String,
        kind: ExchangeKind,
    },
}

impl Destination {
    pub fn topic(topic: impl Into<String>, partition_key: Option<String>) -> Self {
        Self::Topic {
            topic: topic.into(),
            partition_key,
        }
    }

    pub fn exchange(
        exchange: impl Into<String>,
        kind: ExchangeKind,
        routing_key: impl Into<String>,
    ) -> Self {
        Self::Exchange {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            kind,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic {
                topic,
                partition_key: Some(key),
            } => write!(f, "topic:{} key:{}", topic, key),
            Self::Topic { topic, .. } => write!(f, "topic:{}", topic),
            Self::Exchange {
                exchange,
                routing_key,
                kind,
            } => write!(f, "{}-exchange:'{}' key:{}", kind, exchange, routing_key),
        }
    }
}

/// Queue flags for routing-broker subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// One or more topics on a log broker.
    Topics(Vec<String>),
    /// A queue bound to an exchange with one or more binding keys.
    Exchange {
        exchange: String,
        kind: ExchangeKind,
        binding_keys: Vec<String>,
    },
    /// A named queue consumed directly (default exchange).
    Queue,
}

/// Destinations a subscriber registers interest in.
///
/// `consumer` names the queue on a routing broker and the consumer group on a
/// log broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationFilter {
    pub source: Source,
    pub consumer: String,
    pub queue: QueueOptions,
}

impl DestinationFilter {
    /// Subscribe a consumer group to topics.
    pub fn topics<I, S>(topics: I, group: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: Source::Topics(topics.into_iter().map(Into::into).collect()),
            consumer: group.into(),
            queue: QueueOptions::default(),
        }
    }

    /// Bind a queue to an exchange.
    pub fn exchange(
        exchange: impl Into<String>,
        kind: ExchangeKind,
        binding_key: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            source: Source::Exchange {
                exchange: exchange.into(),
                kind,
                binding_keys: vec![binding_key.into()],
            },
            consumer: queue.into(),
            queue: QueueOptions::default(),
        }
    }

    /// Consume a queue directly.
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            source: Source::Queue,
            consumer: queue.into(),
            queue: QueueOptions::default(),
        }
    }

    /// Add another binding key (exchange sources only).
    pub fn with_binding_key(mut self, key: impl Into<String>) -> Self {
        if let Source::Exchange { binding_keys, .. } = &mut self.source {
            binding_keys.push(key.into());
        }
        self
    }

    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue = options;
        self
    }
}

/// Check whether a routing key matches a binding key for an exchange type.
///
/// Matching rules:
/// - fanout: every key matches
/// - direct: exact match
/// - topic: dot-separated words, `*` matches one word, `#` matches zero or more
pub fn binding_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_words_match(&pattern, &words)
        }
    }
}

fn topic_words_match(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| topic_words_match(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && topic_words_match(rest, &words[1..]),
        Some((literal, rest)) => {
            words.first() == Some(literal) && topic_words_match(rest, &words[1..])
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Fallback strategy when no rule matches an envelope's type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Topic named after the type (plus optional prefix), keyed by the envelope key.
    #[default]
    TypeAsTopic,
    /// Fixed exchange, type as routing key.
    TypeAsRoutingKey,
}

/// Fallback route configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub strategy: FallbackStrategy,
    /// Prepended to the type for `type_as_topic`.
    pub topic_prefix: String,
    /// Exchange for `type_as_routing_key`.
    pub exchange: String,
    /// Exchange type for `type_as_routing_key`.
    pub kind: ExchangeKind,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            strategy: FallbackStrategy::TypeAsTopic,
            topic_prefix: String::new(),
            exchange: "orders-ex-topic".to_string(),
            kind: ExchangeKind::Topic,
        }
    }
}

/// One explicit routing rule.
///
/// Exactly one of `topic` or `exchange` must be set. Templates accept the
/// `{type}` and `{key}` placeholders.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteRuleConfig {
    #[serde(rename = "type")]
    pub event_type: String,
    pub topic: Option<String>,
    /// Partition key template; the envelope key when unset.
    pub partition_key: Option<String>,
    pub exchange: Option<String>,
    pub kind: Option<ExchangeKind>,
    /// Routing key template; `{type}` when unset.
    pub routing_key: Option<String>,
}

/// Routing configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub rules: Vec<RouteRuleConfig>,
    pub fallback: FallbackConfig,
}

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Type,
    Key,
}

/// Compiled `{type}` / `{key}` template.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Template {
    segments: Vec<Segment>,
}

impl Template {
    fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = raw;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let close = rest[open..].find('}').ok_or_else(|| {
                BusError::Config(format!("unterminated placeholder in template '{}'", raw))
            })? + open;
            match &rest[open + 1..close] {
                "type" => segments.push(Segment::Type),
                "key" => segments.push(Segment::Key),
                other => {
                    return Err(BusError::Config(format!(
                        "unknown placeholder '{{{}}}' in template '{}'",
                        other, raw
                    )))
                }
            }
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self { segments })
    }

    fn render(&self, envelope: &Envelope) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(s) => s.as_str(),
                Segment::Type => envelope.event_type(),
                Segment::Key => envelope.key().unwrap_or_default(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
enum Route {
    Topic {
        topic: Template,
        partition_key: Option<Template>,
    },
    Exchange {
        exchange: String,
        kind: ExchangeKind,
        routing_key: Template,
    },
}

impl Route {
    fn resolve(&self, envelope: &Envelope) -> Destination {
        match self {
            Self::Topic {
                topic,
                partition_key,
            } => Destination::Topic {
                topic: topic.render(envelope),
                partition_key: match partition_key {
                    Some(template) => Some(template.render(envelope)),
                    None => envelope.key().map(str::to_string),
                },
            },
            Self::Exchange {
                exchange,
                kind,
                routing_key,
            } => Destination::Exchange {
                exchange: exchange.clone(),
                routing_key: routing_key.render(envelope),
                kind: *kind,
            },
        }
    }
}

/// Maps envelopes to destinations.
///
/// Immutable once built; rebuilding from a new [`RoutingConfig`] starts a new
/// configuration epoch.
#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    rules: HashMap<String, Route>,
    fallback: Route,
}

impl RoutingPolicy {
    /// Compile a routing configuration, rejecting invalid rules.
    pub fn from_config(config: &RoutingConfig) -> Result<Self> {
        let mut rules = HashMap::new();
        for rule in &config.rules {
            if rule.event_type.trim().is_empty() {
                return Err(BusError::Config("routing rule without a type".to_string()));
            }
            let route = compile_rule(rule)?;
            if rules.insert(rule.event_type.clone(), route).is_some() {
                return Err(BusError::Config(format!(
                    "duplicate routing rule for type '{}'",
                    rule.event_type
                )));
            }
        }
        Ok(Self {
            rules,
            fallback: compile_fallback(&config.fallback)?,
        })
    }

    /// Resolve the destination of an envelope.
    pub fn resolve(&self, envelope: &Envelope) -> Destination {
        self.rules
            .get(envelope.event_type())
            .unwrap_or(&self.fallback)
            .resolve(envelope)
    }

    /// Whether an explicit rule exists for a type.
    pub fn has_rule(&self, event_type: &str) -> bool {
        self.rules.contains_key(event_type)
    }
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            rules: HashMap::new(),
            fallback: Route::Topic {
                topic: Template {
                    segments: vec![Segment::Type],
                },
                partition_key: None,
            },
        }
    }
}

fn compile_rule(rule: &RouteRuleConfig) -> Result<Route> {
    match (&rule.topic, &rule.exchange) {
        (Some(topic), None) => {
            if rule.routing_key.is_some() || rule.kind.is_some() {
                return Err(BusError::Config(format!(
                    "topic rule for '{}' cannot set routing_key or kind",
                    rule.event_type
                )));
            }
            Ok(Route::Topic {
                topic: non_empty_template(topic, &rule.event_type)?,
                partition_key: rule
                    .partition_key
                    .as_deref()
                    .map(Template::parse)
                    .transpose()?,
            })
        }
        (None, Some(exchange)) => {
            if rule.partition_key.is_some() {
                return Err(BusError::Config(format!(
                    "exchange rule for '{}' cannot set partition_key",
                    rule.event_type
                )));
            }
            Ok(Route::Exchange {
                exchange: exchange.clone(),
                kind: rule.kind.unwrap_or_default(),
                routing_key: Template::parse(rule.routing_key.as_deref().unwrap_or("{type}"))?,
            })
        }
        _ => Err(BusError::Config(format!(
            "routing rule for '{}' must set exactly one of topic or exchange",
            rule.event_type
        ))),
    }
}

fn compile_fallback(config: &FallbackConfig) -> Result<Route> {
    match config.strategy {
        FallbackStrategy::TypeAsTopic => Ok(Route::Topic {
            topic: Template::parse(&format!("{}{{type}}", config.topic_prefix))?,
            partition_key: None,
        }),
        FallbackStrategy::TypeAsRoutingKey => {
            if config.exchange.is_empty() {
                return Err(BusError::Config(
                    "type_as_routing_key fallback requires an exchange".to_string(),
                ));
            }
            Ok(Route::Exchange {
                exchange: config.exchange.clone(),
                kind: config.kind,
                routing_key: Template {
                    segments: vec![Segment::Type],
                },
            })
        }
    }
}

fn non_empty_template(raw: &str, event_type: &str) -> Result<Template> {
    if raw.trim().is_empty() {
        return Err(BusError::Config(format!(
            "empty topic in routing rule for '{}'",
            event_type
        )));
    }
    Template::parse(raw)
}

#[cfg(test)]
mod tests;
