//! Tests for the per-entity message store.

use super::*;
use crate::message::DEAD_LETTER_TTL_EXPIRED;

fn queue_store(props: QueueProperties) -> EntityStore {
    EntityStore::new(StoreSettings::for_queue("orders", &props))
}

fn default_store() -> EntityStore {
    queue_store(QueueProperties::default())
}

fn session(id: &str) -> SessionId {
    SessionId::new(id).unwrap()
}

fn text(message: &ReceivedMessage) -> &str {
    std::str::from_utf8(message.body()).unwrap()
}

mod enqueue {
    use super::*;

    #[test]
    fn test_sequence_numbers_increase_from_one() {
        // Arrange
        let mut store = default_store();
        let now = Timestamp::now();

        // Act
        let first = store.enqueue(Message::new("a"), None, 0, now).unwrap();
        let second = store.enqueue(Message::new("b"), None, 0, now).unwrap();

        // Assert
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_explicit_sequence_numbers_advance_counter() {
        let mut store = default_store();
        let now = Timestamp::now();

        store.enqueue(Message::new("a"), Some(7), 0, now).unwrap();
        let next = store.enqueue(Message::new("b"), None, 0, now).unwrap();

        assert_eq!(next, 8);
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut store = queue_store(QueueProperties::new().with_max_size(1));
        let now = Timestamp::now();

        store.enqueue(Message::new("a"), None, 0, now).unwrap();
        let result = store.enqueue(Message::new("b"), None, 0, now);

        assert!(matches!(result, Err(BusError::QuotaExceeded { max_size: 1, .. })));
    }

    #[test]
    fn test_session_entity_requires_session_id() {
        let mut store = queue_store(QueueProperties::new().with_sessions());
        let result = store.enqueue(Message::new("a"), None, 0, Timestamp::now());
        assert!(matches!(result, Err(BusError::InvalidOperation { .. })));
    }

    #[test]
    fn test_shorter_ttl_wins() {
        let mut store = queue_store(QueueProperties::new().with_default_ttl(Duration::seconds(30)));
        let now = Timestamp::now();

        store
            .enqueue(Message::new("a").with_ttl(Duration::seconds(60)), None, 0, now)
            .unwrap();
        store
            .enqueue(Message::new("b").with_ttl(Duration::seconds(10)), None, 0, now)
            .unwrap();

        let peeked = store.peek(1, 10, None, now);
        assert_eq!(peeked[0].expires_at, Some(now.after(Duration::seconds(30))));
        assert_eq!(peeked[1].expires_at, Some(now.after(Duration::seconds(10))));
    }
}

mod peek_lock {
    use super::*;

    #[test]
    fn test_receive_locks_in_sequence_order() {
        let mut store = default_store();
        let now = Timestamp::now();
        for body in ["a", "b", "c"] {
            store.enqueue(Message::new(body), None, 0, now).unwrap();
        }

        let batch = store.receive(2, ReceiveMode::PeekLock, None, now).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(text(&batch[0]), "a");
        assert_eq!(text(&batch[1]), "b");
        assert!(batch.iter().all(|m| m.lock_token.is_some()));
        assert_eq!(batch[0].delivery_count, 1);
        assert_eq!(batch[0].locked_until, Some(now.after(Duration::seconds(60))));

        // locked messages are skipped
        let rest = store.receive(10, ReceiveMode::PeekLock, None, now).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(text(&rest[0]), "c");
    }

    #[test]
    fn test_complete_removes_message() {
        let mut store = default_store();
        let now = Timestamp::now();
        store.enqueue(Message::new("a"), None, 0, now).unwrap();

        let received = store.receive(1, ReceiveMode::PeekLock, None, now).unwrap();
        let token = received[0].lock_token.unwrap();
        store.complete(token, now).unwrap();

        assert_eq!(store.len(), 0);
        let again = store.complete(token, now);
        assert!(matches!(again, Err(BusError::MessageLockLost { .. })));
    }

    #[test]
    fn test_expired_lock_redelivers_with_higher_count() {
        let mut store = default_store();
        let now = Timestamp::now();
        store.enqueue(Message::new("a"), None, 0, now).unwrap();

        let first = store.receive(1, ReceiveMode::PeekLock, None, now).unwrap();
        let later = now.after(Duration::seconds(61));
        let second = store.receive(1, ReceiveMode::PeekLock, None, later).unwrap();

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_count, 2);
        let stale = store.complete(first[0].lock_token.unwrap(), later);
        assert!(matches!(stale, Err(BusError::MessageLockLost { .. })));
    }

    #[test]
    fn test_renew_lock_extends_expiry() {
        let mut store = default_store();
        let now = Timestamp::now();
        store.enqueue(Message::new("a"), None, 0, now).unwrap();
        let token = store.receive(1, ReceiveMode::PeekLock, None, now).unwrap()[0]
            .lock_token
            .unwrap();

        let renewed_at = now.after(Duration::seconds(50));
        let until = store.renew_lock(token, renewed_at).unwrap();

        assert_eq!(until, renewed_at.after(Duration::seconds(60)));
        assert!(store
            .complete(token, now.after(Duration::seconds(100)))
            .is_ok());
    }

    #[test]
    fn test_abandon_merges_properties() {
        let mut store = default_store();
        let now = Timestamp::now();
        store.enqueue(Message::new("a"), None, 0, now).unwrap();
        let token = store.receive(1, ReceiveMode::PeekLock, None, now).unwrap()[0]
            .lock_token
            .unwrap();

        let mut properties = HashMap::new();
        properties.insert("attempt".to_string(), PropertyValue::Int(1));
        store.abandon(token, properties, now).unwrap();

        let again = store.receive(1, ReceiveMode::PeekLock, None, now).unwrap();
        assert_eq!(again[0].property("attempt"), Some(&PropertyValue::Int(1)));
        assert_eq!(again[0].delivery_count, 2);
    }

    #[test]
    fn test_receive_and_delete_removes_on_delivery() {
        let mut store = default_store();
        let now = Timestamp::now();
        store.enqueue(Message::new("a"), None, 0, now).unwrap();

        let batch = store
            .receive(1, ReceiveMode::ReceiveAndDelete, None, now)
            .unwrap();

        assert_eq!(batch.len(), 1);
        assert!(batch[0].lock_token.is_none());
        assert_eq!(store.len(), 0);
    }
}

mod dead_lettering {
    use super::*;

    #[test]
    fn test_max_delivery_count_moves_to_dead_letter() {
        let mut store = queue_store(QueueProperties::new().with_max_delivery_count(2));
        let now = Timestamp::now();
        store.enqueue(Message::new("poison"), None, 0, now).unwrap();

        for _ in 0..2 {
            let token = store.receive(1, ReceiveMode::PeekLock, None, now).unwrap()[0]
                .lock_token
                .unwrap();
            store.abandon(token, HashMap::new(), now).unwrap();
        }

        assert!(store
            .receive(1, ReceiveMode::PeekLock, None, now)
            .unwrap()
            .is_empty());
        let dlq = store.dead_letter_store().unwrap();
        let dead = dlq.receive(1, ReceiveMode::PeekLock, None, now).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(
            dead[0].dead_letter_reason.as_deref(),
            Some(DEAD_LETTER_MAX_DELIVERY_COUNT)
        );
        assert_eq!(dead[0].dead_letter_source.as_deref(), Some("orders"));
    }

    #[test]
    fn test_explicit_dead_letter_sets_properties() {
        let mut store = default_store();
        let now = Timestamp::now();
        store.enqueue(Message::new("bad"), None, 0, now).unwrap();
        let token = store.receive(1, ReceiveMode::PeekLock, None, now).unwrap()[0]
            .lock_token
            .unwrap();

        store
            .dead_letter(
                token,
                "ValidationFailed",
                Some("missing field".to_string()),
                HashMap::new(),
                now,
            )
            .unwrap();

        assert_eq!(store.runtime_info(now).dead_letter_message_count, 1);
        let dead = store.dead_letter_store().unwrap().peek(1, 10, None, now);
        assert_eq!(
            dead[0].property(DEAD_LETTER_REASON_PROPERTY),
            Some(&PropertyValue::String("ValidationFailed".to_string()))
        );
        assert_eq!(
            dead[0].dead_letter_error_description.as_deref(),
            Some("missing field")
        );
    }

    #[test]
    fn test_dead_letter_queue_cannot_dead_letter() {
        let mut store = default_store();
        let now = Timestamp::now();
        store
            .dead_letter_new(Message::new("x"), None, 0, "Manual", None, now)
            .unwrap();

        let dlq = store.dead_letter_store().unwrap();
        let token = dlq.receive(1, ReceiveMode::PeekLock, None, now).unwrap()[0]
            .lock_token
            .unwrap();
        let result = dlq.dead_letter(token, "Again", None, HashMap::new(), now);

        assert!(matches!(result, Err(BusError::InvalidOperation { .. })));
        assert!(dlq.dead_letter_store().is_err());
    }

    #[test]
    fn test_expired_messages_dropped_or_dead_lettered() {
        let now = Timestamp::now();
        let later = now.after(Duration::seconds(11));

        let mut dropping = default_store();
        dropping
            .enqueue(Message::new("a").with_ttl(Duration::seconds(10)), None, 0, now)
            .unwrap();
        assert!(dropping
            .receive(1, ReceiveMode::PeekLock, None, later)
            .unwrap()
            .is_empty());
        assert_eq!(dropping.runtime_info(later).dead_letter_message_count, 0);

        let mut keeping = queue_store(QueueProperties::new().with_dead_lettering_on_expiration());
        keeping
            .enqueue(Message::new("a").with_ttl(Duration::seconds(10)), None, 0, now)
            .unwrap();
        assert!(keeping
            .receive(1, ReceiveMode::PeekLock, None, later)
            .unwrap()
            .is_empty());
        let dead = keeping.dead_letter_store().unwrap().peek(1, 10, None, later);
        assert_eq!(dead[0].dead_letter_reason.as_deref(), Some(DEAD_LETTER_TTL_EXPIRED));
        assert_eq!(dead[0].expires_at, None);
    }

    #[test]
    fn test_forwardable_dead_letters_stay_until_removed() {
        let mut store = default_store();
        let now = Timestamp::now();
        store
            .dead_letter_new(Message::new("x"), None, 2, "Manual", None, now)
            .unwrap();

        store
            .dead_letter_new(Message::new("y"), None, 4, "Manual", None, now)
            .unwrap();

        let forwardable = store.forwardable_dead_letters(4);

        assert_eq!(forwardable.len(), 1);
        let (seq, outbound) = &forwardable[0];
        assert_eq!(outbound.hops, 2);
        assert!(outbound.message.message_id.is_some());
        assert_eq!(store.runtime_info(now).dead_letter_message_count, 2);

        assert!(store.remove_dead_letter(*seq));
        assert!(!store.remove_dead_letter(*seq));
        // the message that used up its hops stays behind
        assert_eq!(store.runtime_info(now).dead_letter_message_count, 1);
    }
}

mod deferral_and_scheduling {
    use super::*;

    #[test]
    fn test_deferred_message_only_by_sequence_number() {
        let mut store = default_store();
        let now = Timestamp::now();
        let seq = store.enqueue(Message::new("later"), None, 0, now).unwrap();
        let token = store.receive(1, ReceiveMode::PeekLock, None, now).unwrap()[0]
            .lock_token
            .unwrap();

        store.defer(token, HashMap::new(), now).unwrap();

        assert!(store
            .receive(1, ReceiveMode::PeekLock, None, now)
            .unwrap()
            .is_empty());
        assert_eq!(store.runtime_info(now).deferred_message_count, 1);

        let deferred = store
            .receive_deferred(&[seq], ReceiveMode::PeekLock, None, now)
            .unwrap();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].state, MessageState::Deferred);
        store
            .complete(deferred[0].lock_token.unwrap(), now)
            .unwrap();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_receive_deferred_unknown_sequence() {
        let mut store = default_store();
        let now = Timestamp::now();
        store.enqueue(Message::new("active"), None, 0, now).unwrap();

        let result = store.receive_deferred(&[1], ReceiveMode::PeekLock, None, now);

        assert!(matches!(
            result,
            Err(BusError::MessageNotFound {
                sequence_number: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_scheduled_message_promoted_when_due() {
        let mut store = default_store();
        let now = Timestamp::now();
        let at = now.after(Duration::seconds(30));
        let mut message = Message::new("scheduled").with_ttl(Duration::seconds(5));
        message.scheduled_enqueue_time = Some(at);
        store.enqueue(message, None, 0, now).unwrap();

        assert!(store
            .receive(1, ReceiveMode::PeekLock, None, now)
            .unwrap()
            .is_empty());
        assert_eq!(store.runtime_info(now).scheduled_message_count, 1);
        assert_eq!(store.peek(1, 1, None, now)[0].state, MessageState::Scheduled);

        let received = store.receive(1, ReceiveMode::PeekLock, None, at).unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].enqueued_at, at);
        assert_eq!(received[0].expires_at, Some(at.after(Duration::seconds(5))));
    }

    #[test]
    fn test_cancel_scheduled() {
        let mut store = default_store();
        let now = Timestamp::now();
        let mut message = Message::new("scheduled");
        message.scheduled_enqueue_time = Some(now.after(Duration::minutes(5)));
        let seq = store.enqueue(message, None, 0, now).unwrap();
        let active = store.enqueue(Message::new("active"), None, 0, now).unwrap();

        assert!(!store.cancel_scheduled(active));
        assert!(store.cancel_scheduled(seq));
        assert!(!store.cancel_scheduled(seq));
        assert_eq!(store.len(), 1);
    }
}

mod sessions {
    use super::*;

    fn session_store() -> EntityStore {
        queue_store(QueueProperties::new().with_sessions())
    }

    fn send(store: &mut EntityStore, session_id: &str, body: &'static str, now: Timestamp) {
        store
            .enqueue(
                Message::new(body).with_session_id(session(session_id)),
                None,
                0,
                now,
            )
            .unwrap();
    }

    #[test]
    fn test_receive_without_session_rejected() {
        let mut store = session_store();
        let result = store.receive(1, ReceiveMode::PeekLock, None, Timestamp::now());
        assert!(matches!(result, Err(BusError::InvalidOperation { .. })));
    }

    #[test]
    fn test_session_lock_is_exclusive() {
        let mut store = session_store();
        let now = Timestamp::now();
        let id = session("a");

        let lease = store.accept_session(&id, now).unwrap();
        let second = store.accept_session(&id, now);

        assert!(matches!(second, Err(BusError::SessionCannotBeLocked { .. })));

        store.release_session(&id, lease.token, now);
        assert!(store.accept_session(&id, now).is_ok());
    }

    #[test]
    fn test_session_receive_only_sees_own_messages_in_order() {
        let mut store = session_store();
        let now = Timestamp::now();
        send(&mut store, "a", "a1", now);
        send(&mut store, "b", "b1", now);
        send(&mut store, "a", "a2", now);

        let id = session("a");
        let lease = store.accept_session(&id, now).unwrap();
        let batch = store
            .receive(10, ReceiveMode::PeekLock, Some((&id, lease.token)), now)
            .unwrap();

        let bodies: Vec<&str> = batch.iter().map(text).collect();
        assert_eq!(bodies, vec!["a1", "a2"]);
        assert!(batch
            .iter()
            .all(|m| m.locked_until == Some(lease.locked_until)));
    }

    #[test]
    fn test_accept_next_session_skips_locked_sessions() {
        let mut store = session_store();
        let now = Timestamp::now();
        send(&mut store, "a", "a1", now);
        send(&mut store, "b", "b1", now);

        let first = store.accept_next_session(now).unwrap().unwrap();
        let second = store.accept_next_session(now).unwrap().unwrap();
        let third = store.accept_next_session(now).unwrap();

        assert_eq!(first.session_id.as_str(), "a");
        assert_eq!(second.session_id.as_str(), "b");
        assert!(third.is_none());
    }

    #[test]
    fn test_expired_session_lock_releases_messages() {
        let mut store = session_store();
        let now = Timestamp::now();
        send(&mut store, "a", "a1", now);

        let id = session("a");
        let lease = store.accept_session(&id, now).unwrap();
        store
            .receive(1, ReceiveMode::PeekLock, Some((&id, lease.token)), now)
            .unwrap();

        let later = now.after(Duration::seconds(61));
        let stale = store.receive(1, ReceiveMode::PeekLock, Some((&id, lease.token)), later);
        assert!(matches!(stale, Err(BusError::SessionLockLost { .. })));

        let lease = store.accept_next_session(later).unwrap().unwrap();
        let again = store
            .receive(1, ReceiveMode::PeekLock, Some((&id, lease.token)), later)
            .unwrap();
        assert_eq!(again[0].delivery_count, 2);
    }

    #[test]
    fn test_renew_session_extends_message_locks() {
        let mut store = session_store();
        let now = Timestamp::now();
        send(&mut store, "a", "a1", now);

        let id = session("a");
        let lease = store.accept_session(&id, now).unwrap();
        let token = store
            .receive(1, ReceiveMode::PeekLock, Some((&id, lease.token)), now)
            .unwrap()[0]
            .lock_token
            .unwrap();

        let renew_at = now.after(Duration::seconds(50));
        store.renew_session(&id, lease.token, renew_at).unwrap();

        let renew_message = store.renew_lock(token, renew_at);
        assert!(matches!(renew_message, Err(BusError::InvalidOperation { .. })));
        assert!(store
            .complete(token, now.after(Duration::seconds(100)))
            .is_ok());
    }

    #[test]
    fn test_session_state_roundtrip() {
        let mut store = session_store();
        let now = Timestamp::now();
        let id = session("a");
        let lease = store.accept_session(&id, now).unwrap();

        assert_eq!(store.session_state(&id, lease.token, now).unwrap(), None);
        store
            .set_session_state(&id, lease.token, Some(Bytes::from_static(b"step-2")), now)
            .unwrap();
        store.release_session(&id, lease.token, now);

        let lease = store.accept_session(&id, now).unwrap();
        assert_eq!(
            store.session_state(&id, lease.token, now).unwrap(),
            Some(Bytes::from_static(b"step-2"))
        );
    }

    #[test]
    fn test_accept_session_on_plain_queue_rejected() {
        let mut store = default_store();
        let result = store.accept_session(&session("a"), Timestamp::now());
        assert!(matches!(result, Err(BusError::InvalidOperation { .. })));
    }
}

mod duplicate_log {
    use super::*;

    #[test]
    fn test_duplicates_within_window() {
        let mut log = DuplicateLog::new(Duration::minutes(10));
        let id: MessageId = "order-1".parse().unwrap();
        let now = Timestamp::now();

        assert!(!log.is_duplicate(&id, now));
        log.record(&id, now);
        assert!(log.is_duplicate(&id, now.after(Duration::minutes(5))));
        assert!(!log.is_duplicate(&id, now.after(Duration::minutes(11))));
    }

    #[test]
    fn test_checking_does_not_record() {
        let mut log = DuplicateLog::new(Duration::minutes(10));
        let id: MessageId = "order-1".parse().unwrap();
        let now = Timestamp::now();

        assert!(!log.is_duplicate(&id, now));
        assert!(!log.is_duplicate(&id, now));
    }
}
