//! The shipped example configuration stays loadable.

use lanegate::Lane;
use lanegate::config::{BreakerScope, GatewayConfig};
use std::path::Path;
use std::time::Duration;

#[test]
fn example_config_parses_and_validates() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/lanegate.yaml");
    let raw = std::fs::read_to_string(&path).unwrap();
    let config = GatewayConfig::from_yaml_str(&raw).unwrap();
    config.validate().unwrap();

    assert_eq!(config.breaker_scope, BreakerScope::PerLane);
    assert_eq!(config.plans["biz"], Lane::Priority);
    assert_eq!(config.plans["free"], Lane::Free);
    assert_eq!(config.lanes.priority.rate_limit_per_minute, 120);
    assert_eq!(config.lanes.free.rate_limit_per_minute, 30);
    // Omitted in the file: keeps the free-lane default.
    assert!(config.lanes.free.watermark_required);
    assert_eq!(config.lanes.free.max_queue_wait, Duration::from_secs(20));
    assert_eq!(config.long_text_max_ttl, Duration::from_secs(2 * 60 * 60));
}

#[test]
fn example_config_matches_defaults() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/lanegate.yaml");
    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(GatewayConfig::from_yaml_str(&raw).unwrap(), GatewayConfig::default());
}
