//! Route configuration loaded from JSON and turned into layers.
mod common;

use common::test_helpers::request_from;
use floodgate::prelude::*;
use floodgate::{presets, Algorithm, KeyStrategyKind};
use tower::{service_fn, ServiceBuilder, ServiceExt};

async fn ok(_req: RequestInfo) -> Result<(), std::io::Error> {
    Ok(())
}

#[cfg(feature = "config")]
#[test]
fn preset_config_survives_json() {
    let config = presets::config();
    let json = config.to_json().unwrap();
    assert!(json.contains("\"sliding_window\""), "{json}");
    assert!(json.contains("\"fail_closed\""), "{json}");
    assert_eq!(AdmissionConfig::from_json(&json).unwrap(), config);
}

#[cfg(feature = "config")]
#[test]
fn unknown_fields_are_refused() {
    let err = AdmissionConfig::from_json(r#"{ "default": { "requests_per_minute": 5 } }"#).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)), "{err:?}");
}

#[cfg(feature = "config")]
#[test]
fn invalid_route_is_named() {
    let err = AdmissionConfig::from_json(
        r#"{ "routes": { "keys": { "key_strategy": "credential" } } }"#,
    )
    .unwrap_err();
    match err {
        ConfigError::InvalidRoute { route, source } => {
            assert_eq!(route, "keys");
            assert_eq!(*source, ConfigError::MissingCredentialHeader);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn unlisted_routes_use_the_default() {
    let config = presets::config();
    assert_eq!(config.policy_for("auth").algorithm, Algorithm::SlidingWindow);
    assert_eq!(config.policy_for("admin").key_strategy, KeyStrategyKind::Identity);
    assert_eq!(config.policy_for("reports"), &presets::search());
}

#[tokio::test]
async fn each_route_gets_its_own_limiter() {
    let config = presets::config();
    let auth = ServiceBuilder::new()
        .layer(config.policy_for("auth").layer().unwrap())
        .service(service_fn(ok));
    let search = ServiceBuilder::new()
        .layer(config.policy_for("search").layer().unwrap())
        .service(service_fn(ok));

    for _ in 0..5 {
        auth.clone().oneshot(request_from(4)).await.unwrap();
    }
    let err = auth.clone().oneshot(request_from(4)).await.unwrap_err();
    assert_eq!(err.rejection().unwrap().limit(), 5);

    // Exhausting the auth route leaves search untouched for the same address.
    for _ in 0..20 {
        search.clone().oneshot(request_from(4)).await.unwrap();
    }
}
