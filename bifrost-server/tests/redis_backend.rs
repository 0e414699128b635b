use bifrost_bus::{BusSubscription, PubSubBus, RedisBus};
use bifrost_common::config::RedisConfig;
use bifrost_common::model::ExecutionContext;
use bifrost_context::{ContextStore, RedisContextStore};
use bifrost_server::redis::connect;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::Redis;

async fn redis_config(port: u16) -> RedisConfig {
    RedisConfig {
        host: "127.0.0.1".to_string(),
        port,
        database: 0,
        key_prefix: "bifrost-test".to_string(),
        username: None,
        password: None,
        pool_size: 4,
    }
}

#[tokio::test]
async fn context_store_round_trips_and_expires() {
    let container = Redis::default().start().await.expect("start redis container");
    let port = container.get_host_port_ipv4(6379).await.expect("mapped port");
    let config = redis_config(port).await;

    let client = connect(&config).await.expect("connect to redis");
    let store = RedisContextStore::new(client);

    let ctx = ExecutionContext {
        execution_id: "exec-1".to_string(),
        user_id: "user-1".to_string(),
        org_id: "org-1".to_string(),
        workflow_name: "greet".to_string(),
        parameters: json!({"name": "Ada"}),
        timeout_seconds: 30,
        deadline: Utc::now() + chrono::Duration::seconds(30),
    };

    store.set("exec-1", ctx.clone(), Duration::from_secs(60)).await.expect("set context");
    let fetched = store.get("exec-1").await.expect("context must still be present");
    assert_eq!(fetched.workflow_name, "greet");
    assert_eq!(fetched.parameters, json!({"name": "Ada"}));

    store.set("exec-2", ctx, Duration::from_secs(1)).await.expect("set short-lived context");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let expired = store.get("exec-2").await;
    assert!(expired.is_err(), "context past its ttl must no longer resolve");
}

#[tokio::test]
async fn bus_delivers_published_payload_to_a_live_subscriber() {
    let container = Redis::default().start().await.expect("start redis container");
    let port = container.get_host_port_ipv4(6379).await.expect("mapped port");
    let config = redis_config(port).await;

    let publisher_client = connect(&config).await.expect("connect publisher");
    let bus = RedisBus::new(publisher_client);

    let subscriber_client = connect(&config).await.expect("connect subscriber");
    let subscriber_bus = RedisBus::new(subscriber_client);

    let mut subscription = subscriber_bus.subscribe("worker:heartbeat").await.expect("subscribe");

    // give the subscription a moment to register on the Redis side before publishing.
    tokio::time::sleep(Duration::from_millis(200)).await;

    bus.publish("worker:heartbeat", json!({"worker_id": "w-1"}))
        .await
        .expect("publish");

    let received = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("message should arrive before the timeout")
        .expect("subscription should not close");

    assert_eq!(received, json!({"worker_id": "w-1"}));

    let _: &BusSubscription = &subscription;
}
