//! Tests for the demo flows.

use super::*;
use localbus::{AccessRight, AuthorizationRule};

async fn run(flow: DemoFlow) -> String {
    let namespace = Namespace::for_testing("demo").unwrap();
    let mut out = Vec::new();
    run_demo(flow, &namespace, &namespace.connection_string(), &mut out)
        .await
        .unwrap();
    String::from_utf8(out).unwrap()
}

mod flows {
    use super::*;

    #[tokio::test]
    async fn test_queue_flow() {
        let output = run(DemoFlow::Queue).await;

        assert!(output.contains("Connected to demo.servicebus.windows.net"));
        assert!(output.contains("Received #1: order 1 (delivery 1)"));
        assert!(output.contains("Received #3: order 3 (delivery 1)"));
        assert!(output.contains("Completed 3 message(s); 0 left in 'demo-queue'"));
    }

    #[tokio::test]
    async fn test_topic_flow_honours_filters_and_actions() {
        let output = run(DemoFlow::Topic).await;

        assert!(output.contains("Subscription 'all' received 3"));
        assert!(output.contains("Subscription 'high-priority' received 1: order 1"));
        assert!(output.contains(
            "Subscription 'orders' received 2: order 1 [routed=orders], order 3 [routed=orders]"
        ));
    }

    #[tokio::test]
    async fn test_sessions_flow_keeps_order_per_session() {
        let output = run(DemoFlow::Sessions).await;

        assert!(output.contains(
            "Session 'customer-a' in order: a: step 1, a: step 2 (state: processed 2)"
        ));
        assert!(output.contains(
            "Session 'customer-b' in order: b: step 1, b: step 2 (state: processed 2)"
        ));
    }

    #[tokio::test]
    async fn test_dead_letter_flow() {
        let output = run(DemoFlow::DeadLetter).await;

        assert!(output.contains("Abandoned 'poison pill' (delivery 2)"));
        assert!(output.contains(
            "'bad order' reason=ValidationFailed description=missing customer id"
        ));
        assert!(output.contains("'poison pill' reason=MaxDeliveryCountExceeded"));
    }

    #[tokio::test]
    async fn test_duplicate_detection_flow() {
        let output = run(DemoFlow::DuplicateDetection).await;

        assert!(output.contains("Received 'payment attempt 1' (message id payment-42)"));
        assert!(!output.contains("payment attempt 2"));
        assert!(output.contains("1 duplicate(s) dropped"));
    }

    #[tokio::test]
    async fn test_deferral_flow() {
        let output = run(DemoFlow::Deferral).await;

        assert!(output.contains("Deferred 'ship order' as #1"));
        assert!(output.contains("Completed 'pay order'"));
        assert!(output.contains("Completed deferred 'ship order' (#1)"));
    }

    #[tokio::test]
    async fn test_scheduled_flow() {
        let output = run(DemoFlow::Scheduled).await;

        assert!(output.contains("Scheduled: 1, active: 0"));
        assert!(output.contains("Received 'reminder'"));
        assert!(!output.contains("Received 'cancelled reminder'"));
    }

    #[tokio::test]
    async fn test_processor_flow() {
        let output = run(DemoFlow::Processor).await;

        assert!(output.contains(
            "Processor handled 5 message(s): job 1, job 2, job 3, job 4, job 5"
        ));
    }
}

mod connection {
    use super::*;

    #[tokio::test]
    async fn test_flow_runs_with_send_listen_key() {
        // Arrange
        let namespace = Namespace::for_testing("demo").unwrap();
        let admin = AdministrationClient::new(&namespace, &namespace.connection_string()).unwrap();
        admin
            .create_authorization_rule(
                None,
                AuthorizationRule::new("app", vec![AccessRight::Send, AccessRight::Listen]),
            )
            .await
            .unwrap();
        let connection = admin.connection_string(None, "app").await.unwrap();
        let mut out = Vec::new();

        // Act
        let result = run_demo(DemoFlow::Queue, &namespace, &connection, &mut out).await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_send_only_key_fails_on_receive() {
        let namespace = Namespace::for_testing("demo").unwrap();
        let admin = AdministrationClient::new(&namespace, &namespace.connection_string()).unwrap();
        admin
            .create_authorization_rule(None, AuthorizationRule::new("sender", vec![AccessRight::Send]))
            .await
            .unwrap();
        let connection = admin.connection_string(None, "sender").await.unwrap();
        let mut out = Vec::new();

        let result = run_demo(DemoFlow::Queue, &namespace, &connection, &mut out).await;

        let error = result.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<BusError>(),
            Some(BusError::Unauthorized { .. })
        ));
    }

    #[tokio::test]
    async fn test_foreign_connection_string_rejected() {
        let namespace = Namespace::for_testing("demo").unwrap();
        let other = Namespace::for_testing("other").unwrap();
        let mut out = Vec::new();

        let result = run_demo(DemoFlow::Queue, &namespace, &other.connection_string(), &mut out).await;

        assert!(result.is_err());
        assert!(out.is_empty());
    }
}
