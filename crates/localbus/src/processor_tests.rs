//! Tests for message pumps.

use super::*;
use crate::admin::AdministrationClient;
use crate::entity::QueueProperties;
use crate::message::{Message, DEAD_LETTER_MAX_DELIVERY_COUNT};
use crate::namespace::Namespace;
use std::sync::atomic::AtomicUsize;
use tokio::sync::mpsc;

const WAIT: std::time::Duration = std::time::Duration::from_secs(5);

/// Reports every message body and error source through channels
struct RecordingHandler {
    bodies: mpsc::UnboundedSender<String>,
    errors: mpsc::UnboundedSender<ErrorSource>,
    fail: bool,
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn process_message(&self, context: &ProcessMessageContext) -> Result<(), HandlerError> {
        let body = context.message().message.body_as_str()?.to_string();
        let _ = self.bodies.send(body);
        if self.fail {
            return Err("handler failed".into());
        }
        Ok(())
    }

    async fn process_error(&self, context: ProcessErrorContext) {
        let _ = self.errors.send(context.source);
    }
}

fn recording(
    fail: bool,
) -> (
    Arc<RecordingHandler>,
    mpsc::UnboundedReceiver<String>,
    mpsc::UnboundedReceiver<ErrorSource>,
) {
    let (bodies, bodies_rx) = mpsc::unbounded_channel();
    let (errors, errors_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(RecordingHandler {
        bodies,
        errors,
        fail,
    });
    (handler, bodies_rx, errors_rx)
}

async fn setup(properties: QueueProperties) -> (ServiceBusClient, AdministrationClient) {
    let namespace = Namespace::for_testing("test").unwrap();
    let admin = AdministrationClient::new(&namespace, &namespace.connection_string()).unwrap();
    admin.create_queue("orders", properties).await.unwrap();
    let client = ServiceBusClient::new(&namespace, &namespace.connection_string()).unwrap();
    (client, admin)
}

async fn send(client: &ServiceBusClient, messages: Vec<Message>) {
    client
        .create_sender("orders")
        .unwrap()
        .send_messages(messages)
        .await
        .unwrap();
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for processor")
        .expect("channel closed")
}

/// Poll until the queue holds no messages at all
async fn wait_until_empty(admin: &AdministrationClient) {
    tokio::time::timeout(WAIT, async {
        loop {
            let info = admin.get_queue_runtime_info("orders").await.unwrap();
            if info.total_message_count() == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue never drained");
}

fn fast_options() -> ProcessorOptions {
    ProcessorOptions::new().with_max_wait_time(Duration::milliseconds(50))
}

mod processing {
    use super::*;

    #[tokio::test]
    async fn test_successful_handler_completes_messages() {
        // Arrange
        let (client, admin) = setup(QueueProperties::default()).await;
        send(&client, vec![Message::new("a"), Message::new("b")]).await;
        let (handler, mut bodies, _errors) = recording(false);
        let processor = client
            .create_processor("orders", fast_options(), handler)
            .unwrap();

        // Act
        processor.start().unwrap();
        let first = next(&mut bodies).await;
        let second = next(&mut bodies).await;
        wait_until_empty(&admin).await;
        processor.stop().await;

        // Assert
        assert_eq!((first.as_str(), second.as_str()), ("a", "b"));
        assert!(!processor.is_running());
    }

    #[tokio::test]
    async fn test_failing_handler_abandons_until_dead_lettered() {
        // Arrange
        let (client, admin) = setup(QueueProperties::new().with_max_delivery_count(2)).await;
        send(&client, vec![Message::new("poison")]).await;
        let (handler, mut bodies, mut errors) = recording(true);
        let processor = client
            .create_processor("orders", fast_options(), handler)
            .unwrap();

        // Act
        processor.start().unwrap();
        next(&mut bodies).await;
        next(&mut bodies).await;
        let source = next(&mut errors).await;
        tokio::time::timeout(WAIT, async {
            loop {
                let info = admin.get_queue_runtime_info("orders").await.unwrap();
                if info.dead_letter_message_count == 1 {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        processor.stop().await;

        // Assert
        assert_eq!(source, ErrorSource::UserCallback);
        let dlq = client
            .create_receiver("orders", ReceiverOptions::new().dead_letter())
            .unwrap();
        let dead = dlq
            .receive_messages(1, Some(Duration::milliseconds(50)))
            .await
            .unwrap();
        assert_eq!(dead[0].dead_letter_reason.as_deref(), Some(DEAD_LETTER_MAX_DELIVERY_COUNT));
    }

    /// Handler that settles messages itself
    struct DeadLettering;

    #[async_trait]
    impl MessageHandler for DeadLettering {
        async fn process_message(&self, context: &ProcessMessageContext) -> Result<(), HandlerError> {
            context
                .dead_letter_message("Rejected", Some("not wanted".to_string()))
                .await?;
            assert!(context.is_settled());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_settlement_skips_auto_complete() {
        let (client, admin) = setup(QueueProperties::default()).await;
        send(&client, vec![Message::new("a")]).await;
        let processor = client
            .create_processor("orders", fast_options(), Arc::new(DeadLettering))
            .unwrap();

        processor.start().unwrap();
        tokio::time::timeout(WAIT, async {
            loop {
                let info = admin.get_queue_runtime_info("orders").await.unwrap();
                if info.dead_letter_message_count == 1 && info.locked_message_count == 0 {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        processor.close().await;

        let info = admin.get_queue_runtime_info("orders").await.unwrap();
        assert_eq!(info.active_message_count, 0);
    }
}

mod concurrency {
    use super::*;

    /// Records the highest number of handlers running at once
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        done: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl MessageHandler for Gauge {
        async fn process_message(&self, _context: &ProcessMessageContext) -> Result<(), HandlerError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            let _ = self.done.send(());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_max_concurrent_calls() {
        // Arrange
        let (client, _admin) = setup(QueueProperties::default()).await;
        let messages = (0..9).map(|i| Message::new(format!("m{}", i))).collect();
        send(&client, messages).await;
        let (done, mut done_rx) = mpsc::unbounded_channel();
        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            done,
        });
        let processor = client
            .create_processor(
                "orders",
                fast_options().with_max_concurrent_calls(3),
                gauge.clone(),
            )
            .unwrap();

        // Act
        processor.start().unwrap();
        for _ in 0..9 {
            next(&mut done_rx).await;
        }
        processor.stop().await;

        // Assert
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!(peak > 1, "expected parallel handlers, peak was {}", peak);
        assert!(peak <= 3, "peak {} exceeded the limit", peak);
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let (client, _admin) = setup(QueueProperties::default()).await;
        let (handler, _bodies, _errors) = recording(false);
        let processor = client
            .create_processor("orders", fast_options(), handler)
            .unwrap();

        processor.start().unwrap();
        let second = processor.start();
        processor.stop().await;

        assert!(matches!(second, Err(BusError::InvalidOperation { .. })));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (client, _admin) = setup(QueueProperties::default()).await;
        let (handler, mut bodies, _errors) = recording(false);
        let processor = client
            .create_processor("orders", fast_options(), handler)
            .unwrap();

        processor.start().unwrap();
        processor.stop().await;
        processor.start().unwrap();
        send(&client, vec![Message::new("after-restart")]).await;

        assert_eq!(next(&mut bodies).await, "after-restart");
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_closed_processor_cannot_start() {
        let (client, _admin) = setup(QueueProperties::default()).await;
        let (handler, _bodies, _errors) = recording(false);
        let processor = client
            .create_processor("orders", fast_options(), handler)
            .unwrap();

        processor.close().await;

        assert!(matches!(processor.start(), Err(BusError::ClientClosed { .. })));
    }

    /// Holds every message until released
    struct GatedHandler {
        entered: mpsc::UnboundedSender<()>,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl MessageHandler for GatedHandler {
        async fn process_message(&self, _context: &ProcessMessageContext) -> Result<(), HandlerError> {
            let _ = self.entered.send(());
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_during_close_is_refused() {
        // Arrange
        let (client, _admin) = setup(QueueProperties::default()).await;
        send(&client, vec![Message::new("slow")]).await;
        let (entered, mut entered_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(GatedHandler {
            entered,
            release: tokio::sync::Notify::new(),
        });
        let processor = Arc::new(
            client
                .create_processor("orders", fast_options(), handler.clone())
                .unwrap(),
        );
        processor.start().unwrap();
        next(&mut entered_rx).await;

        // Act
        let closing = tokio::spawn({
            let processor = processor.clone();
            async move { processor.close().await }
        });
        // close is now waiting for the held handler
        tokio::time::timeout(WAIT, async {
            while processor.is_running() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("close never took the pump");
        let restarted = processor.start();
        handler.release.notify_one();
        closing.await.unwrap();

        // Assert
        assert!(matches!(restarted, Err(BusError::ClientClosed { .. })));
        assert!(!processor.is_running());
    }

    #[tokio::test]
    async fn test_receive_errors_reported() {
        let (client, _admin) = setup(QueueProperties::default()).await;
        let (handler, _bodies, mut errors) = recording(false);
        let processor = client
            .create_processor("missing", fast_options(), handler)
            .unwrap();

        processor.start().unwrap();
        let source = next(&mut errors).await;
        processor.stop().await;

        assert_eq!(source, ErrorSource::Receive);
    }
}

mod sessions {
    use super::*;

    async fn session_setup() -> (ServiceBusClient, AdministrationClient) {
        setup(QueueProperties::new().with_sessions()).await
    }

    fn session_message(session: &str, body: &'static str) -> Message {
        Message::new(body).with_session_id(SessionId::new(session).unwrap())
    }

    #[tokio::test]
    async fn test_session_processor_keeps_order_within_session() {
        // Arrange
        let (client, admin) = session_setup().await;
        send(
            &client,
            vec![
                session_message("s1", "s1-1"),
                session_message("s2", "s2-1"),
                session_message("s1", "s1-2"),
                session_message("s2", "s2-2"),
            ],
        )
        .await;
        let (handler, mut bodies, _errors) = recording(false);
        let options = SessionProcessorOptions::new()
            .with_max_concurrent_sessions(2)
            .with_session_idle_timeout(Duration::milliseconds(50))
            .with_max_wait_time(Duration::milliseconds(50));
        let processor = client
            .create_session_processor("orders", options, handler)
            .unwrap();

        // Act
        processor.start().unwrap();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(next(&mut bodies).await);
        }
        wait_until_empty(&admin).await;
        processor.stop().await;

        // Assert
        let s1: Vec<&String> = seen.iter().filter(|b| b.starts_with("s1")).collect();
        let s2: Vec<&String> = seen.iter().filter(|b| b.starts_with("s2")).collect();
        assert_eq!(s1, vec!["s1-1", "s1-2"]);
        assert_eq!(s2, vec!["s2-1", "s2-2"]);
    }

    /// Handler checking it runs under the message's session
    struct SessionAware {
        matched: mpsc::UnboundedSender<bool>,
    }

    #[async_trait]
    impl MessageHandler for SessionAware {
        async fn process_message(&self, context: &ProcessMessageContext) -> Result<(), HandlerError> {
            let matches = context.session_id() == context.message().session_id()
                && context.session().is_some();
            let _ = self.matched.send(matches);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_sees_its_session() {
        let (client, _admin) = session_setup().await;
        send(&client, vec![session_message("s1", "a")]).await;
        let (matched, mut matched_rx) = mpsc::unbounded_channel();
        let options = SessionProcessorOptions::new()
            .with_session_idle_timeout(Duration::milliseconds(50))
            .with_max_wait_time(Duration::milliseconds(50));
        let processor = client
            .create_session_processor("orders", options, Arc::new(SessionAware { matched }))
            .unwrap();

        processor.start().unwrap();
        let matched = next(&mut matched_rx).await;
        processor.stop().await;

        assert!(matched);
    }

    #[tokio::test]
    async fn test_idle_session_released_for_other_receivers() {
        let (client, _admin) = session_setup().await;
        send(&client, vec![session_message("s1", "a")]).await;
        let (handler, mut bodies, _errors) = recording(false);
        let options = SessionProcessorOptions::new()
            .with_max_concurrent_sessions(1)
            .with_session_idle_timeout(Duration::milliseconds(30))
            .with_max_wait_time(Duration::milliseconds(30));
        let processor = client
            .create_session_processor("orders", options, handler)
            .unwrap();

        processor.start().unwrap();
        next(&mut bodies).await;
        processor.stop().await;

        let session = client
            .accept_session("orders", "s1", ReceiverOptions::default())
            .await;
        assert!(session.is_ok());
    }
}
