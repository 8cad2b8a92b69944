//! Tests for receiving, peeking and settlement.

use super::*;
use crate::admin::AdministrationClient;
use crate::client::ServiceBusClient;
use crate::entity::QueueProperties;
use crate::message::{Message, MessageState, DEAD_LETTER_MAX_DELIVERY_COUNT};
use crate::namespace::Namespace;
use crate::store::DEAD_LETTER_REASON_PROPERTY;

async fn setup(properties: QueueProperties) -> (ServiceBusClient, AdministrationClient) {
    let namespace = Namespace::for_testing("test").unwrap();
    let admin = AdministrationClient::new(&namespace, &namespace.connection_string()).unwrap();
    admin.create_queue("orders", properties).await.unwrap();
    let client = ServiceBusClient::new(&namespace, &namespace.connection_string()).unwrap();
    (client, admin)
}

async fn send(client: &ServiceBusClient, bodies: &[&'static str]) {
    let messages = bodies.iter().map(|b| Message::new(*b)).collect();
    client
        .create_sender("orders")
        .unwrap()
        .send_messages(messages)
        .await
        .unwrap();
}

fn short() -> Option<Duration> {
    Some(Duration::milliseconds(50))
}

mod receiving {
    use super::*;

    #[tokio::test]
    async fn test_receive_returns_empty_after_wait() {
        let (client, _admin) = setup(QueueProperties::default()).await;
        let receiver = client.create_receiver("orders", ReceiverOptions::default()).unwrap();

        let started = std::time::Instant::now();
        let received = receiver.receive_messages(5, short()).await.unwrap();

        assert!(received.is_empty());
        assert!(started.elapsed() >= std::time::Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_receive_wakes_when_message_arrives() {
        // Arrange
        let (client, _admin) = setup(QueueProperties::default()).await;
        let receiver = client.create_receiver("orders", ReceiverOptions::default()).unwrap();
        let sender = client.create_sender("orders").unwrap();

        // Act
        let sending = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            sender.send_message(Message::new("late")).await
        });
        let received = receiver
            .receive_messages(1, Some(Duration::seconds(5)))
            .await
            .unwrap();

        // Assert
        sending.await.unwrap().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message.body_as_str().unwrap(), "late");
    }

    #[tokio::test]
    async fn test_locked_messages_not_redelivered() {
        let (client, _admin) = setup(QueueProperties::default()).await;
        send(&client, &["a", "b"]).await;
        let receiver = client.create_receiver("orders", ReceiverOptions::default()).unwrap();

        let first = receiver.receive_messages(1, short()).await.unwrap();
        let second = receiver.receive_messages(5, short()).await.unwrap();

        assert_eq!(first[0].sequence_number, 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].sequence_number, 2);
    }

    #[tokio::test]
    async fn test_zero_max_messages_is_invalid() {
        let (client, _admin) = setup(QueueProperties::default()).await;
        let receiver = client.create_receiver("orders", ReceiverOptions::default()).unwrap();

        let result = receiver.receive_messages(0, short()).await;

        assert!(matches!(result, Err(BusError::InvalidOperation { .. })));
    }

    #[tokio::test]
    async fn test_receive_and_delete_removes_on_delivery() {
        let (client, admin) = setup(QueueProperties::default()).await;
        send(&client, &["a"]).await;
        let receiver = client
            .create_receiver("orders", ReceiverOptions::new().receive_and_delete())
            .unwrap();

        let received = receiver.receive_messages(1, short()).await.unwrap();

        assert!(received[0].lock_token.is_none());
        assert_eq!(
            admin.get_queue_runtime_info("orders").await.unwrap().total_message_count(),
            0
        );
        assert!(matches!(
            receiver.complete_message(&received[0]).await,
            Err(BusError::InvalidOperation { .. })
        ));
    }
}

mod locks {
    use super::*;

    #[tokio::test]
    async fn test_expired_lock_redelivers_with_higher_delivery_count() {
        // Arrange
        let properties = QueueProperties::new().with_lock_duration(Duration::milliseconds(30));
        let (client, _admin) = setup(properties).await;
        send(&client, &["a"]).await;
        let receiver = client.create_receiver("orders", ReceiverOptions::default()).unwrap();
        let first = receiver.receive_messages(1, short()).await.unwrap();

        // Act
        let second = receiver
            .receive_messages(1, Some(Duration::seconds(2)))
            .await
            .unwrap();

        // Assert
        assert_eq!(first[0].delivery_count, 1);
        assert_eq!(second[0].sequence_number, first[0].sequence_number);
        assert_eq!(second[0].delivery_count, 2);
        assert!(matches!(
            receiver.complete_message(&first[0]).await,
            Err(BusError::MessageLockLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_renew_extends_lock() {
        let properties = QueueProperties::new().with_lock_duration(Duration::milliseconds(200));
        let (client, _admin) = setup(properties).await;
        send(&client, &["a"]).await;
        let receiver = client.create_receiver("orders", ReceiverOptions::default()).unwrap();
        let mut message = receiver.receive_messages(1, short()).await.unwrap().remove(0);
        let original = message.locked_until.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let renewed = receiver.renew_message_lock(&mut message).await.unwrap();

        assert!(renewed > original);
        assert_eq!(message.locked_until, Some(renewed));
        receiver.complete_message(&message).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandon_until_max_delivery_count_dead_letters() {
        // Arrange
        let properties = QueueProperties::new().with_max_delivery_count(2);
        let (client, admin) = setup(properties).await;
        send(&client, &["poison"]).await;
        let receiver = client.create_receiver("orders", ReceiverOptions::default()).unwrap();

        // Act
        for _ in 0..2 {
            let message = receiver.receive_messages(1, short()).await.unwrap().remove(0);
            receiver.abandon_message(&message, None).await.unwrap();
        }

        // Assert
        let dlq = client
            .create_receiver("orders", ReceiverOptions::new().dead_letter())
            .unwrap();
        let dead = dlq.receive_messages(1, short()).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].dead_letter_reason.as_deref(), Some(DEAD_LETTER_MAX_DELIVERY_COUNT));
        let info = admin.get_queue_runtime_info("orders").await.unwrap();
        assert_eq!(info.active_message_count, 0);
    }

    #[tokio::test]
    async fn test_abandon_modifies_properties() {
        let (client, _admin) = setup(QueueProperties::default()).await;
        send(&client, &["a"]).await;
        let receiver = client.create_receiver("orders", ReceiverOptions::default()).unwrap();
        let message = receiver.receive_messages(1, short()).await.unwrap().remove(0);

        let mut changes = HashMap::new();
        changes.insert("attempt".to_string(), PropertyValue::from(1_i64));
        receiver.abandon_message(&message, Some(changes)).await.unwrap();

        let again = receiver.receive_messages(1, short()).await.unwrap().remove(0);
        assert_eq!(again.property("attempt"), Some(&PropertyValue::from(1_i64)));
    }
}

mod deferral {
    use super::*;

    #[tokio::test]
    async fn test_deferred_message_only_reachable_by_sequence_number() {
        // Arrange
        let (client, _admin) = setup(QueueProperties::default()).await;
        send(&client, &["a"]).await;
        let receiver = client.create_receiver("orders", ReceiverOptions::default()).unwrap();
        let message = receiver.receive_messages(1, short()).await.unwrap().remove(0);

        // Act
        receiver.defer_message(&message, None).await.unwrap();
        let plain = receiver.receive_messages(1, short()).await.unwrap();
        let deferred = receiver
            .receive_deferred_messages(&[message.sequence_number])
            .await
            .unwrap();

        // Assert
        assert!(plain.is_empty());
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].state, MessageState::Deferred);
        receiver.complete_message(&deferred[0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_deferred_sequence_number_fails() {
        let (client, _admin) = setup(QueueProperties::default()).await;
        send(&client, &["a"]).await;
        let receiver = client.create_receiver("orders", ReceiverOptions::default()).unwrap();

        let result = receiver.receive_deferred_messages(&[1]).await;

        assert!(matches!(result, Err(BusError::MessageNotFound { .. })));
    }
}

mod dead_lettering {
    use super::*;

    #[tokio::test]
    async fn test_dead_letter_records_reason_and_description() {
        let (client, _admin) = setup(QueueProperties::default()).await;
        send(&client, &["bad"]).await;
        let receiver = client.create_receiver("orders", ReceiverOptions::default()).unwrap();
        let message = receiver.receive_messages(1, short()).await.unwrap().remove(0);

        receiver
            .dead_letter_message(&message, "Invalid", Some("bad payload".to_string()))
            .await
            .unwrap();

        let dlq = client
            .create_receiver("orders", ReceiverOptions::new().dead_letter())
            .unwrap();
        assert_eq!(dlq.sub_queue(), SubQueue::DeadLetter);
        let dead = dlq.receive_messages(1, short()).await.unwrap().remove(0);
        assert_eq!(dead.dead_letter_reason.as_deref(), Some("Invalid"));
        assert_eq!(dead.dead_letter_error_description.as_deref(), Some("bad payload"));
        assert_eq!(
            dead.property(DEAD_LETTER_REASON_PROPERTY),
            Some(&PropertyValue::from("Invalid"))
        );
        dlq.complete_message(&dead).await.unwrap();
    }
}

mod peeking {
    use super::*;

    #[tokio::test]
    async fn test_peek_advances_cursor_without_locking() {
        // Arrange
        let (client, _admin) = setup(QueueProperties::default()).await;
        send(&client, &["a", "b", "c"]).await;
        let receiver = client.create_receiver("orders", ReceiverOptions::default()).unwrap();

        // Act
        let first = receiver.peek_messages(2, None).await.unwrap();
        let rest = receiver.peek_messages(2, None).await.unwrap();
        let again = receiver.peek_messages(1, Some(1)).await.unwrap();
        let received = receiver.receive_messages(3, short()).await.unwrap();

        // Assert
        let seqs = |ms: &[ReceivedMessage]| ms.iter().map(|m| m.sequence_number).collect::<Vec<_>>();
        assert_eq!(seqs(&first), vec![1, 2]);
        assert_eq!(seqs(&rest), vec![3]);
        assert_eq!(seqs(&again), vec![1]);
        assert!(first.iter().all(|m| m.lock_token.is_none() && m.delivery_count == 0));
        assert_eq!(received.len(), 3);
    }
}

mod prefetch {
    use super::*;

    #[tokio::test]
    async fn test_prefetched_messages_served_from_buffer() {
        let (client, admin) = setup(QueueProperties::default()).await;
        send(&client, &["a", "b", "c"]).await;
        let receiver = client
            .create_receiver("orders", ReceiverOptions::new().with_prefetch(2))
            .unwrap();

        let first = receiver.receive_messages(1, short()).await.unwrap();
        let info = admin.get_queue_runtime_info("orders").await.unwrap();
        let buffered = receiver.receive_messages(5, short()).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(info.active_message_count, 0);
        assert_eq!(buffered.len(), 2);
        assert_eq!(buffered[0].sequence_number, 2);
    }

    #[tokio::test]
    async fn test_close_releases_prefetched_locks() {
        let (client, _admin) = setup(QueueProperties::default()).await;
        send(&client, &["a", "b"]).await;
        let receiver = client
            .create_receiver("orders", ReceiverOptions::new().with_prefetch(1))
            .unwrap();
        receiver.receive_messages(1, short()).await.unwrap();

        receiver.close().await;

        let other = client.create_receiver("orders", ReceiverOptions::default()).unwrap();
        let released = other.receive_messages(5, short()).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].sequence_number, 2);
        assert!(matches!(
            receiver.receive_messages(1, short()).await,
            Err(BusError::ClientClosed { .. })
        ));
    }
}
