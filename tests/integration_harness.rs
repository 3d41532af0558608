//! Integration tests for the embedded harness: lifecycle, topic creation,
//! produce/read round trips, config override propagation, and read timeouts.

use brokerunit::error::BrokerUnitError;
use brokerunit::{BrokerClient, BrokerUnit, ClientConfig, ProduceRecord};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::time::Duration;

// Unique ports for the tests that pin them explicitly.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(26000);

fn unique_ports() -> (u16, u16) {
    let base = PORT_COUNTER.fetch_add(2, Ordering::SeqCst);
    (base, base + 1)
}

async fn started_unit() -> BrokerUnit {
    let mut unit = BrokerUnit::ephemeral();
    unit.startup().await.unwrap();
    unit
}

#[tokio::test]
async fn broker_is_available() {
    let mut unit = started_unit().await;

    unit.create_topic("TestTopic").await.unwrap();
    unit.send_message(ProduceRecord::new("TestTopic", "key", "value"))
        .await
        .unwrap();

    let messages = unit.read_messages("TestTopic", 1).await.unwrap();
    let values: Vec<_> = messages.iter().filter_map(|m| m.value_str()).collect();
    assert_eq!(values, vec!["value"]);

    unit.shutdown().await.unwrap();
}

#[tokio::test]
async fn read_produced_records_carries_key_value_and_topic() {
    let mut unit = started_unit().await;

    unit.create_topic("TestTopic").await.unwrap();
    unit.send_message(ProduceRecord::new("TestTopic", "key", "value"))
        .await
        .unwrap();

    let messages = unit.read_messages("TestTopic", 1).await.unwrap();
    let received = &messages[0];

    assert_eq!(received.value_str(), Some("value"), "Received message value is incorrect");
    assert_eq!(received.key_str(), Some("key"), "Received message key is incorrect");
    assert_eq!(received.topic, "TestTopic", "Received message topic is incorrect");
    assert_eq!(received.offset, 0);

    unit.shutdown().await.unwrap();
}

#[tokio::test]
async fn external_client_can_produce() {
    let mut unit = started_unit().await;
    let topic = "ConnectTestTopic";

    // A producer wired only from the connection string, as external test code
    // would be.
    let client = BrokerClient::connect(ClientConfig::insecure(unit.broker_connect().unwrap()))
        .await
        .unwrap();
    client
        .produce_record(ProduceRecord::new(topic, "1", "test"))
        .await
        .unwrap();

    let messages = unit.read_messages(topic, 1).await.unwrap();
    assert_eq!(messages[0].value_str(), Some("test"));

    client.close();
    unit.shutdown().await.unwrap();
}

#[tokio::test]
async fn broker_config_override_propagates() {
    let mut unit = BrokerUnit::ephemeral();
    unit.set_broker_config("log.segment.bytes", "1024");
    unit.startup().await.unwrap();

    assert_eq!(unit.broker_config().unwrap().segment_bytes, 1024);

    // The override is live, not just recorded: producing past the segment
    // size rolls new segments.
    unit.create_topic("SegmentTopic").await.unwrap();
    for _ in 0..3 {
        unit.send_message(ProduceRecord::new("SegmentTopic", "k", vec![7u8; 600]))
            .await
            .unwrap();
    }
    let segments = unit
        .broker()
        .unwrap()
        .core()
        .segment_count("SegmentTopic", 0)
        .unwrap();
    assert!(segments >= 2, "expected rolled segments, got {segments}");

    unit.shutdown().await.unwrap();
}

#[tokio::test]
async fn read_times_out_when_messages_are_missing() {
    let mut unit = started_unit().await;

    unit.create_topic("TestTopic").await.unwrap();
    unit.send_message(ProduceRecord::new("TestTopic", "key", "value"))
        .await
        .unwrap();

    let result = unit
        .read_messages_with_timeout("TestTopic", 2, Duration::from_millis(300))
        .await;
    match result {
        Err(BrokerUnitError::ReadTimeout {
            expected, received, ..
        }) => {
            assert_eq!(expected, 2);
            assert_eq!(received, 1);
        }
        other => panic!("expected read timeout, got {other:?}"),
    }

    unit.shutdown().await.unwrap();
}

#[tokio::test]
async fn explicit_ports_are_honored() {
    let (coordinator_port, broker_port) = unique_ports();
    let mut unit = BrokerUnit::new(coordinator_port, broker_port);
    unit.startup().await.unwrap();

    assert_eq!(
        unit.broker_connect().unwrap(),
        format!("127.0.0.1:{broker_port}")
    );
    assert_eq!(
        unit.coordinator_connect().unwrap(),
        format!("127.0.0.1:{coordinator_port}")
    );

    unit.shutdown().await.unwrap();
}

#[tokio::test]
async fn messages_are_read_in_offset_order() {
    let mut unit = started_unit().await;
    unit.create_topic("OrderedTopic").await.unwrap();

    let records = (0..5)
        .map(|i| ProduceRecord::new("OrderedTopic", format!("k{i}"), format!("v{i}")))
        .collect();
    let offsets = unit.send_messages(records).await.unwrap();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);

    let messages = unit.read_messages("OrderedTopic", 5).await.unwrap();
    let values: Vec<_> = messages.iter().filter_map(|m| m.value_str()).collect();
    assert_eq!(values, vec!["v0", "v1", "v2", "v3", "v4"]);

    unit.shutdown().await.unwrap();
}

#[tokio::test]
async fn producing_auto_creates_topics() {
    let mut unit = started_unit().await;

    // No create_topic call; the broker creates it on first produce.
    unit.send_message(ProduceRecord::new("AutoTopic", "key", "value"))
        .await
        .unwrap();

    let messages = unit.read_messages("AutoTopic", 1).await.unwrap();
    assert_eq!(messages[0].value_str(), Some("value"));

    unit.shutdown().await.unwrap();
}

#[tokio::test]
async fn creating_a_topic_twice_is_an_error() {
    let mut unit = started_unit().await;

    unit.create_topic("TestTopic").await.unwrap();
    let result = unit.create_topic("TestTopic").await;
    assert!(matches!(
        result,
        Err(BrokerUnitError::TopicAlreadyExists(_))
    ));

    unit.shutdown().await.unwrap();
}
