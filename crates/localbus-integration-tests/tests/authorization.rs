//! Shared access authorization scenarios.
//!
//! Verifies:
//! - send and listen rights are enforced per operation
//! - entity-scoped keys reach only their entity
//! - deleting a rule revokes access for live clients
//! - management requires the namespace Manage right

mod common;

use common::{bodies, drain, TestBus};
use localbus::{
    AccessRight, AdministrationClient, AuthorizationRule, BusError, Message, QueueProperties,
    ReceiverOptions, ServiceBusClient, SubscriptionProperties, TopicProperties,
};

async fn with_rule(bus: &TestBus, entity: Option<&str>, key_name: &str, rights: Vec<AccessRight>) -> String {
    bus.admin
        .create_authorization_rule(entity, AuthorizationRule::new(key_name, rights))
        .await
        .unwrap();
    bus.admin.connection_string(entity, key_name).await.unwrap()
}

#[tokio::test]
async fn test_send_and_listen_rights_are_separate() {
    // Arrange
    let bus = TestBus::new();
    bus.admin.create_queue("orders", QueueProperties::default()).await.unwrap();
    let producer = bus.connect(&with_rule(&bus, None, "producer", vec![AccessRight::Send]).await);
    let consumer = bus.connect(&with_rule(&bus, None, "consumer", vec![AccessRight::Listen]).await);

    // Act
    let sent = producer
        .create_sender("orders")
        .unwrap()
        .send_message(Message::new("order"))
        .await;
    let producer_receive = producer
        .create_receiver("orders", ReceiverOptions::default())
        .unwrap()
        .receive_messages(1, common::short_wait())
        .await;
    let consumer_send = consumer
        .create_sender("orders")
        .unwrap()
        .send_message(Message::new("sneaky"))
        .await;
    let consumer_receiver = consumer
        .create_receiver("orders", ReceiverOptions::default())
        .unwrap();

    // Assert
    assert!(sent.is_ok());
    assert!(matches!(producer_receive, Err(BusError::Unauthorized { .. })));
    assert!(matches!(consumer_send, Err(BusError::Unauthorized { .. })));
    assert_eq!(bodies(&drain(&consumer_receiver).await), vec!["order"]);
}

#[tokio::test]
async fn test_entity_scoped_key_reaches_only_its_entity() {
    // Arrange
    let bus = TestBus::new();
    bus.admin.create_queue("orders", QueueProperties::default()).await.unwrap();
    bus.admin.create_queue("invoices", QueueProperties::default()).await.unwrap();
    let connection = with_rule(
        &bus,
        Some("orders"),
        "orders-app",
        vec![AccessRight::Send, AccessRight::Listen],
    )
    .await;
    let client = bus.connect(&connection);

    // Act
    let own = client
        .create_sender("orders")
        .unwrap()
        .send_message(Message::new("mine"))
        .await;
    let other = client
        .create_sender("invoices")
        .unwrap()
        .send_message(Message::new("not mine"))
        .await;

    // Assert
    assert!(own.is_ok());
    assert!(matches!(other, Err(BusError::Unauthorized { .. })));
    let info = bus.admin.get_queue_runtime_info("invoices").await.unwrap();
    assert_eq!(info.active_message_count, 0);
}

#[tokio::test]
async fn test_topic_scoped_key_listens_on_subscriptions() {
    // Arrange
    let bus = TestBus::new();
    bus.admin.create_topic("events", TopicProperties::default()).await.unwrap();
    bus.admin
        .create_subscription("events", "audit", SubscriptionProperties::default())
        .await
        .unwrap();
    let connection = with_rule(&bus, Some("events"), "auditor", vec![AccessRight::Listen]).await;
    let auditor = bus.connect(&connection);
    bus.send("events", vec![Message::new("event")]).await;

    // Act
    let receiver = auditor
        .create_receiver_for_subscription("events", "audit", ReceiverOptions::default())
        .unwrap();
    let received = drain(&receiver).await;

    // Assert
    assert_eq!(bodies(&received), vec!["event"]);
}

#[tokio::test]
async fn test_deleted_rule_revokes_live_clients() {
    // Arrange
    let bus = TestBus::new();
    bus.admin.create_queue("orders", QueueProperties::default()).await.unwrap();
    let client = bus.connect(&with_rule(&bus, None, "temporary", vec![AccessRight::Send]).await);
    let sender = client.create_sender("orders").unwrap();
    sender.send_message(Message::new("before")).await.unwrap();

    // Act
    bus.admin.delete_authorization_rule(None, "temporary").await.unwrap();
    let after = sender.send_message(Message::new("after")).await;

    // Assert
    assert!(matches!(after, Err(BusError::Unauthorized { .. })));
    let info = bus.admin.get_queue_runtime_info("orders").await.unwrap();
    assert_eq!(info.active_message_count, 1);
}

#[tokio::test]
async fn test_management_needs_manage_right() {
    // Arrange
    let bus = TestBus::new();
    let limited = with_rule(&bus, None, "app", vec![AccessRight::Send, AccessRight::Listen]).await;
    let managed = with_rule(&bus, None, "ops", vec![AccessRight::Manage]).await;

    // Act
    let limited_admin = AdministrationClient::new(&bus.namespace, &limited);
    let ops = AdministrationClient::new(&bus.namespace, &managed).unwrap();
    let created = ops.create_queue("from-ops", QueueProperties::default()).await;

    // Assert
    assert!(matches!(limited_admin, Err(BusError::Unauthorized { .. })));
    assert!(created.is_ok());
}

#[tokio::test]
async fn test_unknown_key_cannot_connect() {
    let bus = TestBus::new();
    let forged = bus
        .namespace
        .connection_string()
        .replace("SharedAccessKey=", "SharedAccessKey=forged");

    let result = ServiceBusClient::new(&bus.namespace, &forged);

    assert!(matches!(result, Err(BusError::Unauthorized { .. })));
}
