//! Session and message pump scenarios.
//!
//! Verifies:
//! - session exclusivity holds across independent clients
//! - per-session order is preserved while sessions are processed concurrently
//! - a failing handler leads to redelivery and finally dead-lettering
//! - subscription processors drain filtered copies

mod common;

use chrono::Duration;
use common::{bodies, drain, long_wait, RecordingHandler, TestBus};
use localbus::{
    BusError, Filter, Message, ProcessorOptions, QueueProperties, ReceiverOptions,
    RuleProperties, SessionId, SessionProcessorOptions, SubscriptionProperties,
    TopicProperties, DEAD_LETTER_MAX_DELIVERY_COUNT, DEFAULT_RULE_NAME,
};
use std::sync::Arc;

fn in_session(session: &str, body: &str) -> Message {
    Message::new(body.to_string()).with_session_id(SessionId::new(session).unwrap())
}

#[tokio::test]
async fn test_session_exclusive_across_clients() {
    // Arrange
    let bus = TestBus::new();
    bus.admin
        .create_queue("orders", QueueProperties::new().with_sessions())
        .await
        .unwrap();
    bus.send("orders", vec![in_session("s1", "a")]).await;
    let other = bus.connect(&bus.namespace.connection_string());

    // Act
    let held = bus
        .client
        .accept_session("orders", "s1", ReceiverOptions::default())
        .await
        .unwrap();
    let contended = other
        .accept_session("orders", "s1", ReceiverOptions::default())
        .await;
    let next = other
        .accept_next_session("orders", ReceiverOptions::default(), Some(Duration::milliseconds(50)))
        .await;

    // Assert
    assert!(matches!(contended, Err(BusError::SessionCannotBeLocked { .. })));
    assert!(matches!(next, Err(BusError::Timeout { .. })));
    held.close().await;
    assert!(other
        .accept_session("orders", "s1", ReceiverOptions::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_session_processor_keeps_order_per_session() {
    // Arrange
    let bus = TestBus::new();
    bus.admin
        .create_queue("orders", QueueProperties::new().with_sessions())
        .await
        .unwrap();
    let mut messages = Vec::new();
    for step in 1..=4 {
        for session in ["red", "green", "blue"] {
            messages.push(in_session(session, &format!("{}-{}", session, step)));
        }
    }
    bus.send("orders", messages).await;
    let handler = RecordingHandler::new();
    let processor = bus
        .client
        .create_session_processor(
            "orders",
            SessionProcessorOptions::new()
                .with_max_concurrent_sessions(3)
                .with_session_idle_timeout(Duration::milliseconds(100))
                .with_max_wait_time(Duration::milliseconds(50)),
            Arc::new(handler.clone()),
        )
        .unwrap();

    // Act
    processor.start().unwrap();
    let processed = handler.wait_for(12).await;
    processor.close().await;

    // Assert
    assert_eq!(processed.len(), 12);
    for session in ["red", "green", "blue"] {
        let order: Vec<&String> = processed
            .iter()
            .filter(|b| b.starts_with(session))
            .collect();
        let expected: Vec<String> = (1..=4).map(|step| format!("{}-{}", session, step)).collect();
        assert_eq!(order, expected.iter().collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_failing_handler_exhausts_delivery_count() {
    // Arrange
    let bus = TestBus::new();
    bus.admin
        .create_queue("orders", QueueProperties::new().with_max_delivery_count(3))
        .await
        .unwrap();
    bus.send("orders", vec![Message::new("good"), Message::new("bad")]).await;
    let handler = RecordingHandler::new();
    handler.fail_on("bad");
    let processor = bus
        .client
        .create_processor(
            "orders",
            ProcessorOptions::new().with_max_wait_time(Duration::milliseconds(50)),
            Arc::new(handler.clone()),
        )
        .unwrap();

    // Act
    processor.start().unwrap();
    let processed = handler.wait_for(4).await;
    processor.close().await;

    // Assert
    assert_eq!(processed, vec!["good", "bad", "bad", "bad"]);
    assert_eq!(handler.errors(), vec!["user_callback"; 3]);
    let dead_letters = bus
        .client
        .create_receiver("orders", ReceiverOptions::new().dead_letter())
        .unwrap();
    let dead = drain(&dead_letters).await;
    assert_eq!(bodies(&dead), vec!["bad"]);
    assert_eq!(dead[0].dead_letter_reason.as_deref(), Some(DEAD_LETTER_MAX_DELIVERY_COUNT));
}

#[tokio::test]
async fn test_subscription_processor_sees_filtered_copies() {
    // Arrange
    let bus = TestBus::new();
    bus.admin.create_topic("events", TopicProperties::default()).await.unwrap();
    bus.admin
        .create_subscription("events", "red", SubscriptionProperties::default())
        .await
        .unwrap();
    bus.admin
        .delete_rule("events", "red", DEFAULT_RULE_NAME)
        .await
        .unwrap();
    bus.admin
        .create_rule(
            "events",
            "red",
            RuleProperties::new("red", Filter::sql("color = 'red'").unwrap()),
        )
        .await
        .unwrap();
    let handler = RecordingHandler::new();
    let processor = bus
        .client
        .create_processor_for_subscription(
            "events",
            "red",
            ProcessorOptions::new().with_max_wait_time(Duration::milliseconds(50)),
            Arc::new(handler.clone()),
        )
        .unwrap();
    processor.start().unwrap();

    // Act
    bus.send(
        "events",
        vec![
            Message::new("r1").with_property("color", "red"),
            Message::new("b1").with_property("color", "blue"),
            Message::new("r2").with_property("color", "red"),
        ],
    )
    .await;
    let processed = handler.wait_for(2).await;
    processor.close().await;

    // Assert
    assert_eq!(processed, vec!["r1", "r2"]);
    let info = bus
        .admin
        .get_subscription_runtime_info("events", "red")
        .await
        .unwrap();
    assert_eq!(info.total_message_count(), 0);
}

#[tokio::test]
async fn test_session_state_tracks_progress_between_receivers() {
    // Arrange
    let bus = TestBus::new();
    bus.admin
        .create_queue("orders", QueueProperties::new().with_sessions())
        .await
        .unwrap();
    bus.send("orders", vec![in_session("s1", "step-1"), in_session("s1", "step-2")])
        .await;

    // Act
    let first = bus
        .client
        .accept_session("orders", "s1", ReceiverOptions::default())
        .await
        .unwrap();
    let received = first.receive_messages(1, long_wait()).await.unwrap();
    first.complete_message(&received[0]).await.unwrap();
    first
        .set_session_state(Some(bytes::Bytes::from_static(b"after step-1")))
        .await
        .unwrap();
    first.close().await;

    let second = bus
        .client
        .accept_next_session("orders", ReceiverOptions::default(), long_wait())
        .await
        .unwrap();
    let state = second.get_session_state().await.unwrap();
    let rest = second.receive_messages(10, long_wait()).await.unwrap();

    // Assert
    assert_eq!(second.session_id().as_str(), "s1");
    assert_eq!(state, Some(bytes::Bytes::from_static(b"after step-1")));
    assert_eq!(bodies(&rest), vec!["step-2"]);
}
