//! Demo flows.
//!
//! Each flow creates the entities it needs (when the topology does not
//! already define them), drives them with clients built from the given
//! connection string and writes a narrative of what happened.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use clap::ValueEnum;
use localbus::{
    AdministrationClient, BusError, CorrelationFilter, Filter, HandlerError, Message,
    MessageHandler, MessageId, Namespace, ProcessMessageContext, ProcessorOptions,
    QueueProperties, ReceivedMessage, ReceiverOptions, RuleAction, RuleProperties,
    ServiceBusClient, SessionId, SubscriptionProperties, Timestamp, TopicProperties,
    DEAD_LETTER_MAX_DELIVERY_COUNT, DEFAULT_RULE_NAME,
};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[cfg(test)]
#[path = "demo_tests.rs"]
mod tests;

pub const QUEUE: &str = "demo-queue";
pub const TOPIC: &str = "demo-topic";
pub const SESSION_QUEUE: &str = "demo-sessions";
pub const DEAD_LETTER_QUEUE: &str = "demo-dead-letter";
pub const DUPLICATE_QUEUE: &str = "demo-duplicates";
pub const DEFERRAL_QUEUE: &str = "demo-deferral";
pub const SCHEDULED_QUEUE: &str = "demo-scheduled";
pub const PROCESSOR_QUEUE: &str = "demo-processor";

/// Flows available to `localbus demo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DemoFlow {
    /// Send, receive and complete on a queue
    Queue,
    /// Fan-out to filtered subscriptions
    Topic,
    /// Ordered processing per session with session state
    Sessions,
    /// Automatic and explicit dead-lettering
    DeadLetter,
    /// Repeated message ids are dropped
    DuplicateDetection,
    /// Set a message aside and fetch it by sequence number
    Deferral,
    /// Delayed delivery and cancellation
    Scheduled,
    /// Message pump with concurrent handlers
    Processor,
}

/// Longest wait for a single receive in a flow
fn receive_wait() -> Option<Duration> {
    Some(Duration::seconds(5))
}

fn body(message: &ReceivedMessage) -> String {
    String::from_utf8_lossy(message.body()).into_owned()
}

/// Run one flow. Entities are managed with the namespace root key; the flow's
/// clients use `connection_string`.
pub async fn run_demo(
    flow: DemoFlow,
    namespace: &Namespace,
    connection_string: &str,
    out: &mut dyn Write,
) -> Result<()> {
    let admin = AdministrationClient::new(namespace, &namespace.connection_string())
        .context("demo flows manage entities with the namespace root key")?;
    let client = ServiceBusClient::new(namespace, connection_string)
        .context("failed to connect with the demo connection string")?;
    writeln!(out, "Connected to {}", client.fully_qualified_namespace())?;

    let result = match flow {
        DemoFlow::Queue => queue_flow(&admin, &client, out).await,
        DemoFlow::Topic => topic_flow(&admin, &client, out).await,
        DemoFlow::Sessions => sessions_flow(&admin, &client, out).await,
        DemoFlow::DeadLetter => dead_letter_flow(&admin, &client, out).await,
        DemoFlow::DuplicateDetection => duplicate_detection_flow(&admin, &client, out).await,
        DemoFlow::Deferral => deferral_flow(&admin, &client, out).await,
        DemoFlow::Scheduled => scheduled_flow(&admin, &client, out).await,
        DemoFlow::Processor => processor_flow(&admin, &client, out).await,
    };

    client.close();
    info!(flow = ?flow, success = result.is_ok(), "Demo flow finished");
    result
}

async fn ensure_queue(admin: &AdministrationClient, name: &str, properties: QueueProperties) -> Result<()> {
    if !admin.queue_exists(name).await? {
        admin
            .create_queue(name, properties)
            .await
            .with_context(|| format!("failed to create queue '{}'", name))?;
        debug!(queue = name, "Demo queue created");
    }
    Ok(())
}

/// Create a subscription unless it exists; with a rule, the rule replaces `$Default`
async fn ensure_subscription(
    admin: &AdministrationClient,
    topic: &str,
    name: &str,
    rule: Option<RuleProperties>,
) -> Result<()> {
    match admin.get_subscription(topic, name).await {
        Ok(_) => return Ok(()),
        Err(BusError::EntityNotFound { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    admin
        .create_subscription(topic, name, SubscriptionProperties::new())
        .await
        .with_context(|| format!("failed to create subscription '{}/{}'", topic, name))?;
    if let Some(rule) = rule {
        admin.delete_rule(topic, name, DEFAULT_RULE_NAME).await?;
        admin.create_rule(topic, name, rule).await?;
    }
    Ok(())
}

// ============================================================================
// Flows
// ============================================================================

async fn queue_flow(admin: &AdministrationClient, client: &ServiceBusClient, out: &mut dyn Write) -> Result<()> {
    ensure_queue(admin, QUEUE, QueueProperties::new()).await?;

    let sender = client.create_sender(QUEUE)?;
    let messages = (1..=3)
        .map(|i| Message::new(format!("order {}", i)).with_subject("order"))
        .collect();
    sender.send_messages(messages).await?;
    writeln!(out, "Sent 3 messages to '{}'", QUEUE)?;

    let receiver = client.create_receiver(QUEUE, ReceiverOptions::default())?;
    let received = receiver.receive_messages(3, receive_wait()).await?;
    for message in &received {
        writeln!(
            out,
            "Received #{}: {} (delivery {})",
            message.sequence_number,
            body(message),
            message.delivery_count
        )?;
        receiver.complete_message(message).await?;
    }

    let info = admin.get_queue_runtime_info(QUEUE).await?;
    writeln!(out, "Completed {} message(s); {} left in '{}'", received.len(), info.total_message_count(), QUEUE)?;
    Ok(())
}

async fn topic_flow(admin: &AdministrationClient, client: &ServiceBusClient, out: &mut dyn Write) -> Result<()> {
    if !admin.topic_exists(TOPIC).await? {
        admin.create_topic(TOPIC, TopicProperties::new()).await?;
    }
    ensure_subscription(admin, TOPIC, "all", None).await?;
    ensure_subscription(
        admin,
        TOPIC,
        "high-priority",
        Some(RuleProperties::new("high", Filter::sql("priority = 'high'")?)),
    )
    .await?;
    let orders = Filter::correlation(CorrelationFilter::new().with_subject("order"))?;
    ensure_subscription(
        admin,
        TOPIC,
        "orders",
        Some(RuleProperties::new("orders", orders).with_action(RuleAction::new("SET routed = 'orders'")?)),
    )
    .await?;

    let sender = client.create_sender(TOPIC)?;
    sender
        .send_messages(vec![
            Message::new("order 1").with_subject("order").with_property("priority", "high"),
            Message::new("invoice 2").with_subject("invoice").with_property("priority", "low"),
            Message::new("order 3").with_subject("order").with_property("priority", "low"),
        ])
        .await?;
    writeln!(out, "Published 3 messages to '{}'", TOPIC)?;

    for subscription in admin.list_subscriptions(TOPIC).await? {
        let receiver = client.create_receiver_for_subscription(
            TOPIC,
            subscription.as_str(),
            ReceiverOptions::default().receive_and_delete(),
        )?;
        let received = receiver
            .receive_messages(10, Some(Duration::milliseconds(200)))
            .await?;
        let bodies: Vec<String> = received
            .iter()
            .map(|m| match m.property("routed") {
                Some(routed) => format!("{} [routed={}]", body(m), routed),
                None => body(m),
            })
            .collect();
        writeln!(out, "Subscription '{}' received {}: {}", subscription, received.len(), bodies.join(", "))?;
    }
    Ok(())
}

async fn sessions_flow(admin: &AdministrationClient, client: &ServiceBusClient, out: &mut dyn Write) -> Result<()> {
    ensure_queue(admin, SESSION_QUEUE, QueueProperties::new().with_sessions()).await?;

    let sender = client.create_sender(SESSION_QUEUE)?;
    let customer_a = SessionId::new("customer-a")?;
    let customer_b = SessionId::new("customer-b")?;
    sender
        .send_messages(vec![
            Message::new("a: step 1").with_session_id(customer_a.clone()),
            Message::new("b: step 1").with_session_id(customer_b.clone()),
            Message::new("a: step 2").with_session_id(customer_a),
            Message::new("b: step 2").with_session_id(customer_b),
        ])
        .await?;
    writeln!(out, "Sent 4 messages across 2 sessions to '{}'", SESSION_QUEUE)?;

    for _ in 0..2 {
        let session = client
            .accept_next_session(SESSION_QUEUE, ReceiverOptions::default(), receive_wait())
            .await?;
        let received = session.receive_messages(10, Some(Duration::milliseconds(200))).await?;
        for message in &received {
            session.complete_message(message).await?;
        }
        session
            .set_session_state(Some(Bytes::from(format!("processed {}", received.len()))))
            .await?;
        let state = session.get_session_state().await?.unwrap_or_default();

        let bodies: Vec<String> = received.iter().map(body).collect();
        writeln!(
            out,
            "Session '{}' in order: {} (state: {})",
            session.session_id(),
            bodies.join(", "),
            String::from_utf8_lossy(&state)
        )?;
        session.close().await;
    }
    Ok(())
}

async fn dead_letter_flow(admin: &AdministrationClient, client: &ServiceBusClient, out: &mut dyn Write) -> Result<()> {
    ensure_queue(admin, DEAD_LETTER_QUEUE, QueueProperties::new().with_max_delivery_count(2)).await?;

    let sender = client.create_sender(DEAD_LETTER_QUEUE)?;
    sender
        .send_messages(vec![Message::new("poison pill"), Message::new("bad order")])
        .await?;

    let receiver = client.create_receiver(DEAD_LETTER_QUEUE, ReceiverOptions::default())?;
    for _ in 0..2 {
        for message in receiver.receive_messages(2, receive_wait()).await? {
            if body(&message) == "bad order" {
                receiver
                    .dead_letter_message(&message, "ValidationFailed", Some("missing customer id".to_string()))
                    .await?;
                writeln!(out, "Dead-lettered '{}' explicitly", body(&message))?;
            } else {
                receiver.abandon_message(&message, None).await?;
                writeln!(out, "Abandoned '{}' (delivery {})", body(&message), message.delivery_count)?;
            }
        }
    }

    let dead_letters = client.create_receiver(DEAD_LETTER_QUEUE, ReceiverOptions::new().dead_letter())?;
    let received = dead_letters.receive_messages(2, receive_wait()).await?;
    for message in &received {
        writeln!(
            out,
            "Dead-letter queue: '{}' reason={} description={}",
            body(message),
            message.dead_letter_reason.as_deref().unwrap_or("-"),
            message.dead_letter_error_description.as_deref().unwrap_or("-")
        )?;
        dead_letters.complete_message(message).await?;
    }
    if !received
        .iter()
        .any(|m| m.dead_letter_reason.as_deref() == Some(DEAD_LETTER_MAX_DELIVERY_COUNT))
    {
        bail!("expected a message dead-lettered for exceeding its delivery count");
    }
    Ok(())
}

async fn duplicate_detection_flow(
    admin: &AdministrationClient,
    client: &ServiceBusClient,
    out: &mut dyn Write,
) -> Result<()> {
    ensure_queue(
        admin,
        DUPLICATE_QUEUE,
        QueueProperties::new().with_duplicate_detection(Duration::minutes(10)),
    )
    .await?;

    let sender = client.create_sender(DUPLICATE_QUEUE)?;
    let payment: MessageId = "payment-42".parse()?;
    for attempt in 1..=2 {
        sender
            .send_message(Message::new(format!("payment attempt {}", attempt)).with_message_id(payment.clone()))
            .await?;
    }
    sender.send_message(Message::new("payment 43")).await?;
    writeln!(out, "Sent 3 messages, 2 with message id '{}'", payment)?;

    let receiver = client.create_receiver(DUPLICATE_QUEUE, ReceiverOptions::default().receive_and_delete())?;
    let received = receiver.receive_messages(10, Some(Duration::milliseconds(200))).await?;
    for message in &received {
        writeln!(out, "Received '{}' (message id {})", body(message), message.message_id)?;
    }
    writeln!(out, "{} duplicate(s) dropped", 3 - received.len())?;
    Ok(())
}

async fn deferral_flow(admin: &AdministrationClient, client: &ServiceBusClient, out: &mut dyn Write) -> Result<()> {
    ensure_queue(admin, DEFERRAL_QUEUE, QueueProperties::new()).await?;

    let sender = client.create_sender(DEFERRAL_QUEUE)?;
    sender
        .send_messages(vec![Message::new("ship order"), Message::new("pay order")])
        .await?;

    let receiver = client.create_receiver(DEFERRAL_QUEUE, ReceiverOptions::default())?;
    let mut deferred = Vec::new();
    for message in receiver.receive_messages(2, receive_wait()).await? {
        if body(&message) == "ship order" {
            receiver.defer_message(&message, None).await?;
            writeln!(out, "Deferred '{}' as #{}", body(&message), message.sequence_number)?;
            deferred.push(message.sequence_number);
        } else {
            receiver.complete_message(&message).await?;
            writeln!(out, "Completed '{}'", body(&message))?;
        }
    }

    for message in receiver.receive_deferred_messages(&deferred).await? {
        receiver.complete_message(&message).await?;
        writeln!(out, "Completed deferred '{}' (#{})", body(&message), message.sequence_number)?;
    }
    Ok(())
}

async fn scheduled_flow(admin: &AdministrationClient, client: &ServiceBusClient, out: &mut dyn Write) -> Result<()> {
    ensure_queue(admin, SCHEDULED_QUEUE, QueueProperties::new()).await?;

    let sender = client.create_sender(SCHEDULED_QUEUE)?;
    let due = Timestamp::now().after(Duration::milliseconds(300));
    let kept = sender.schedule_messages(vec![Message::new("reminder")], due).await?;
    let cancelled = sender.schedule_messages(vec![Message::new("cancelled reminder")], due).await?;
    sender.cancel_scheduled_messages(&cancelled).await?;
    writeln!(out, "Scheduled #{:?} for {}, cancelled #{:?}", kept, due, cancelled)?;

    let info = admin.get_queue_runtime_info(SCHEDULED_QUEUE).await?;
    writeln!(out, "Scheduled: {}, active: {}", info.scheduled_message_count, info.active_message_count)?;

    let receiver = client.create_receiver(SCHEDULED_QUEUE, ReceiverOptions::default())?;
    let received = receiver.receive_messages(1, receive_wait()).await?;
    for message in &received {
        writeln!(out, "Received '{}' at {}", body(message), message.enqueued_at)?;
        receiver.complete_message(message).await?;
    }
    if received.is_empty() {
        bail!("scheduled message was not delivered");
    }
    Ok(())
}

/// Forwards every processed body to the flow
struct ForwardingHandler {
    bodies: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl MessageHandler for ForwardingHandler {
    async fn process_message(&self, context: &ProcessMessageContext) -> Result<(), HandlerError> {
        let body = context.message().message.body_as_str()?.to_string();
        self.bodies.send(body).map_err(|e| e.to_string())?;
        Ok(())
    }
}

async fn processor_flow(admin: &AdministrationClient, client: &ServiceBusClient, out: &mut dyn Write) -> Result<()> {
    const COUNT: usize = 5;
    ensure_queue(admin, PROCESSOR_QUEUE, QueueProperties::new()).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let processor = client.create_processor(
        PROCESSOR_QUEUE,
        ProcessorOptions::new()
            .with_max_concurrent_calls(2)
            .with_max_wait_time(Duration::milliseconds(500)),
        Arc::new(ForwardingHandler { bodies: tx }),
    )?;
    processor.start()?;

    let sender = client.create_sender(PROCESSOR_QUEUE)?;
    let messages = (1..=COUNT).map(|i| Message::new(format!("job {}", i))).collect();
    sender.send_messages(messages).await?;

    let mut processed = Vec::with_capacity(COUNT);
    while processed.len() < COUNT {
        let next = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
            .await
            .context("processor did not handle every message in time")?;
        match next {
            Some(body) => processed.push(body),
            None => bail!("processor handler dropped"),
        }
    }
    processor.close().await;

    processed.sort();
    writeln!(out, "Processor handled {} message(s): {}", processed.len(), processed.join(", "))?;
    Ok(())
}
