use super::*;

fn envelope(event_type: &str, key: Option<&str>) -> Envelope {
    let mut builder = Envelope::builder(&b"{}"[..], event_type);
    if let Some(k) = key {
        builder = builder.key(k);
    }
    builder.build().unwrap()
}

fn rule(event_type: &str) -> RouteRuleConfig {
    RouteRuleConfig {
        event_type: event_type.to_string(),
        ..Default::default()
    }
}

#[test]
fn test_binding_matches_direct() {
    assert!(binding_matches(ExchangeKind::Direct, "orders", "orders"));
    assert!(!binding_matches(ExchangeKind::Direct, "orders", "orders.created"));
}

#[test]
fn test_binding_matches_fanout() {
    assert!(binding_matches(ExchangeKind::Fanout, "", "anything"));
    assert!(binding_matches(ExchangeKind::Fanout, "orders", "inventory"));
}

#[test]
fn test_binding_matches_topic_wildcards() {
    assert!(binding_matches(ExchangeKind::Topic, "#", "order-created"));
    assert!(binding_matches(ExchangeKind::Topic, "orders.*", "orders.created"));
    assert!(!binding_matches(ExchangeKind::Topic, "orders.*", "orders.created.eu"));
    assert!(binding_matches(ExchangeKind::Topic, "orders.#", "orders.created.eu"));
    assert!(binding_matches(ExchangeKind::Topic, "orders.#", "orders"));
    assert!(binding_matches(ExchangeKind::Topic, "*.created", "orders.created"));
    assert!(!binding_matches(ExchangeKind::Topic, "orders", "ordersextra"));
}

#[test]
fn test_default_policy_routes_type_as_topic() {
    let policy = RoutingPolicy::default();
    let destination = policy.resolve(&envelope("order-created", Some("42")));

    assert_eq!(
        destination,
        Destination::topic("order-created", Some("42".to_string()))
    );
}

#[test]
fn test_explicit_topic_rule() {
    let config = RoutingConfig {
        rules: vec![RouteRuleConfig {
            topic: Some("order-topic".to_string()),
            ..rule("order-created")
        }],
        ..Default::default()
    };
    let policy = RoutingPolicy::from_config(&config).unwrap();

    assert!(policy.has_rule("order-created"));
    assert_eq!(
        policy.resolve(&envelope("order-created", Some("1"))),
        Destination::topic("order-topic", Some("1".to_string()))
    );
    // Other types fall back
    assert_eq!(
        policy.resolve(&envelope("order-shipped", None)),
        Destination::topic("order-shipped", None)
    );
}

#[test]
fn test_exchange_rule_with_template() {
    let config = RoutingConfig {
        rules: vec![RouteRuleConfig {
            exchange: Some("orders-ex-topic".to_string()),
            kind: Some(ExchangeKind::Topic),
            routing_key: Some("orders.{type}.{key}".to_string()),
            ..rule("order-created")
        }],
        ..Default::default()
    };
    let policy = RoutingPolicy::from_config(&config).unwrap();

    assert_eq!(
        policy.resolve(&envelope("order-created", Some("42"))),
        Destination::exchange("orders-ex-topic", ExchangeKind::Topic, "orders.order-created.42")
    );
}

#[test]
fn test_type_as_routing_key_fallback() {
    let config = RoutingConfig {
        rules: vec![],
        fallback: FallbackConfig {
            strategy: FallbackStrategy::TypeAsRoutingKey,
            exchange: "orders-ex-topic".to_string(),
            kind: ExchangeKind::Topic,
            ..Default::default()
        },
    };
    let policy = RoutingPolicy::from_config(&config).unwrap();

    assert_eq!(
        policy.resolve(&envelope("order-cancelled", None)),
        Destination::exchange("orders-ex-topic", ExchangeKind::Topic, "order-cancelled")
    );
}

#[test]
fn test_topic_prefix_fallback() {
    let config = RoutingConfig {
        fallback: FallbackConfig {
            topic_prefix: "shop.".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let policy = RoutingPolicy::from_config(&config).unwrap();

    assert_eq!(
        policy.resolve(&envelope("order-created", None)),
        Destination::topic("shop.order-created", None)
    );
}

#[test]
fn test_resolve_is_deterministic() {
    let config = RoutingConfig {
        rules: vec![RouteRuleConfig {
            topic: Some("order-topic".to_string()),
            partition_key: Some("{type}-{key}".to_string()),
            ..rule("order-created")
        }],
        ..Default::default()
    };
    let policy = RoutingPolicy::from_config(&config).unwrap();
    let e = envelope("order-created", Some("9"));

    let first = policy.resolve(&e);
    let second = policy.resolve(&e);

    assert_eq!(first, second);
    assert_eq!(
        first,
        Destination::topic("order-topic", Some("order-created-9".to_string()))
    );
}

#[test]
fn test_rule_needs_exactly_one_target() {
    let both = RoutingConfig {
        rules: vec![RouteRuleConfig {
            topic: Some("t".to_string()),
            exchange: Some("x".to_string()),
            ..rule("order-created")
        }],
        ..Default::default()
    };
    assert!(matches!(
        RoutingPolicy::from_config(&both),
        Err(BusError::Config(_))
    ));

    let neither = RoutingConfig {
        rules: vec![rule("order-created")],
        ..Default::default()
    };
    assert!(matches!(
        RoutingPolicy::from_config(&neither),
        Err(BusError::Config(_))
    ));
}

#[test]
fn test_unknown_placeholder_rejected() {
    let config = RoutingConfig {
        rules: vec![RouteRuleConfig {
            topic: Some("orders-{tenant}".to_string()),
            ..rule("order-created")
        }],
        ..Default::default()
    };
    assert!(matches!(
        RoutingPolicy::from_config(&config),
        Err(BusError::Config(_))
    ));
}

#[test]
fn test_duplicate_rule_rejected() {
    let config = RoutingConfig {
        rules: vec![
            RouteRuleConfig {
                topic: Some("a".to_string()),
                ..rule("order-created")
            },
            RouteRuleConfig {
                topic: Some("b".to_string()),
                ..rule("order-created")
            },
        ],
        ..Default::default()
    };
    assert!(matches!(
        RoutingPolicy::from_config(&config),
        Err(BusError::Config(_))
    ));
}

#[test]
fn test_filter_binding_keys() {
    let filter = DestinationFilter::exchange("orders-ex-topic", ExchangeKind::Topic, "order-*", "orders")
        .with_binding_key("refund.#");

    match filter.source {
        Source::Exchange { binding_keys, .. } => {
            assert_eq!(binding_keys, vec!["order-*".to_string(), "refund.#".to_string()]);
        }
        other => panic!("unexpected source {:?}", other),
    }
    assert_eq!(filter.consumer, "orders");
}
