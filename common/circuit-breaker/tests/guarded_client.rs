use std::sync::Arc;
use std::time::Duration;

use common_circuit_breaker::{
    with_fallback, BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState,
    GuardedClient,
};
use common_metrics::NoopSink;
use httpmock::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn guarded_client() -> GuardedClient {
    guarded_client_with(CircuitBreakerConfig::default())
}

fn guarded_client_with(config: CircuitBreakerConfig) -> GuardedClient {
    let breaker = CircuitBreaker::new("friends-service", config, Arc::new(NoopSink));
    GuardedClient::new(reqwest::Client::new(), Arc::new(breaker))
}

#[tokio::test]
async fn server_errors_open_the_breaker() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/friends/42");
            then.status(503);
        })
        .await;

    let client = guarded_client();
    let cancel = CancellationToken::new();
    let url = server.url("/friends/42");

    for _ in 0..3 {
        let result = client.get_json::<Vec<String>>(&cancel, &url).await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
    }
    assert_eq!(client.breaker().state(), CircuitBreakerState::Open);

    let result = client.get_json::<Vec<String>>(&cancel, &url).await;
    assert!(matches!(result, Err(BreakerError::Open(_))));
    assert_eq!(mock.hits_async().await, 3);
}

#[tokio::test]
async fn client_errors_do_not_count_against_the_breaker() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/friends/missing");
            then.status(404);
        })
        .await;

    let client = guarded_client();
    let cancel = CancellationToken::new();
    let url = server.url("/friends/missing");

    for _ in 0..5 {
        let result = client.get_json::<Vec<String>>(&cancel, &url).await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
    }
    assert_eq!(client.breaker().state(), CircuitBreakerState::Closed);
    assert_eq!(client.breaker().counts().total_failures, 0);
}

#[tokio::test]
async fn healthy_responses_are_decoded() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/friends/7");
            then.status(200).json_body(json!(["ana", "bo"]));
        })
        .await;

    let client = guarded_client();
    let friends: Vec<String> = client
        .get_json(&CancellationToken::new(), &server.url("/friends/7"))
        .await
        .unwrap();

    assert_eq!(friends, vec!["ana".to_string(), "bo".to_string()]);
}

#[tokio::test]
async fn fallback_serves_an_empty_list_while_the_dependency_is_down() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/friends/1");
            then.status(500);
        })
        .await;

    let client = guarded_client();
    let cancel = CancellationToken::new();
    let url = server.url("/friends/1");

    for _ in 0..4 {
        let friends = with_fallback(
            "friends-service",
            client.get_json::<Vec<String>>(&cancel, &url).await,
            Vec::new,
        );
        assert!(friends.is_empty());
    }
    assert_eq!(client.breaker().state(), CircuitBreakerState::Open);
}

#[tokio::test]
async fn timed_out_requests_are_not_counted() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/friends/slow");
            then.status(200)
                .json_body(json!([]))
                .delay(Duration::from_secs(5));
        })
        .await;

    let client = guarded_client();
    let cancel = CancellationToken::new();
    let url = server.url("/friends/slow");

    for _ in 0..3 {
        let request = client.get_json::<Vec<String>>(&cancel, &url);
        assert!(tokio::time::timeout(Duration::from_millis(50), request)
            .await
            .is_err());
    }

    assert_eq!(client.breaker().state(), CircuitBreakerState::Closed);
    assert_eq!(client.breaker().counts().requests, 0);
}

#[tokio::test]
async fn timed_out_trial_request_does_not_wedge_the_breaker() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/friends/down");
            then.status(503);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/friends/slow");
            then.status(200)
                .json_body(json!([]))
                .delay(Duration::from_secs(5));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/friends/up");
            then.status(200).json_body(json!(["ana"]));
        })
        .await;

    let client = guarded_client_with(CircuitBreakerConfig {
        max_requests: 1,
        timeout: Duration::from_millis(100),
        ..Default::default()
    });
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        client
            .get_json::<Vec<String>>(&cancel, &server.url("/friends/down"))
            .await
            .unwrap_err();
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.breaker().state(), CircuitBreakerState::HalfOpen);

    let url = server.url("/friends/slow");
    let trial = client.get_json::<Vec<String>>(&cancel, &url);
    assert!(tokio::time::timeout(Duration::from_millis(50), trial)
        .await
        .is_err());

    let friends = client
        .get_json::<Vec<String>>(&cancel, &server.url("/friends/up"))
        .await
        .unwrap();
    assert_eq!(friends, vec!["ana".to_string()]);
    assert_eq!(client.breaker().state(), CircuitBreakerState::Closed);
}
