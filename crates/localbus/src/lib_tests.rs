//! Tests for the localbus library root.

use super::*;
use chrono::Duration;

#[tokio::test]
async fn test_send_receive_complete_through_root_exports() {
    let namespace = Namespace::for_testing("contoso").unwrap();
    let admin = AdministrationClient::new(&namespace, &namespace.connection_string()).unwrap();
    admin
        .create_queue("orders", QueueProperties::default())
        .await
        .unwrap();

    let client = ServiceBusClient::new(&namespace, &namespace.connection_string()).unwrap();
    let sender = client.create_sender("orders").unwrap();
    sender
        .send_message(Message::new("hello").with_subject("greeting"))
        .await
        .unwrap();

    let receiver = client
        .create_receiver("orders", ReceiverOptions::default())
        .unwrap();
    let messages = receiver
        .receive_messages(10, Some(Duration::seconds(1)))
        .await
        .unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].subject(), Some("greeting"));
    assert_eq!(messages[0].sequence_number, 1);
    assert_eq!(messages[0].delivery_count, 1);
    receiver.complete_message(&messages[0]).await.unwrap();

    let info = admin.get_queue_runtime_info("orders").await.unwrap();
    assert_eq!(info.total_message_count(), 0);
}

#[test]
fn test_dead_letter_reason_names() {
    assert_eq!(DEAD_LETTER_MAX_DELIVERY_COUNT, "MaxDeliveryCountExceeded");
    assert_eq!(DEAD_LETTER_TTL_EXPIRED, "TTLExpiredException");
    assert_eq!(DEAD_LETTER_REASON_PROPERTY, "DeadLetterReason");
    assert_eq!(DEAD_LETTER_DESCRIPTION_PROPERTY, "DeadLetterErrorDescription");
}
