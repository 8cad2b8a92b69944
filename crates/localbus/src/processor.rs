//! Message pumps driving a user handler.
//!
//! A [`Processor`] receives from one queue or subscription and runs the
//! handler for up to `max_concurrent_calls` messages at once. A
//! [`SessionProcessor`] accepts up to `max_concurrent_sessions` sessions and
//! drains each one in order, moving on when a session stays idle.
//!
//! `stop` is cooperative: no new receives start, handlers already running
//! finish and are settled. Handler failures go to
//! [`MessageHandler::process_error`] and never stop the pump.

use crate::client::ServiceBusClient;
use crate::error::BusError;
use crate::message::{
    PropertyValue, ReceiveMode, ReceivedMessage, ReceiverOptions, SessionId, SubQueue,
};
use crate::namespace::EntityPath;
use crate::receiver::Receiver;
use crate::sessions::SessionReceiver;
use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;

/// Error type returned by message handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Shortest pause between lock renewals
const MIN_RENEWAL_INTERVAL_MS: u64 = 10;

// ============================================================================
// Handler
// ============================================================================

/// User code run for every received message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message. With `auto_complete`, returning `Ok` completes
    /// the message and returning `Err` abandons it.
    async fn process_message(&self, context: &ProcessMessageContext) -> Result<(), HandlerError>;

    /// Called for receive, settlement, lock renewal and handler failures
    async fn process_error(&self, context: ProcessErrorContext) {
        warn!(
            entity = %context.entity_path,
            source = %context.source,
            error = %context.error,
            "Processor error"
        );
    }
}

/// Where a processor error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Receive,
    AcceptSession,
    UserCallback,
    Complete,
    Abandon,
    RenewLock,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Receive => "receive",
            Self::AcceptSession => "accept_session",
            Self::UserCallback => "user_callback",
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::RenewLock => "renew_lock",
        };
        f.write_str(name)
    }
}

/// Failure reported to [`MessageHandler::process_error`]
#[derive(Debug)]
pub struct ProcessErrorContext {
    pub error: HandlerError,
    pub source: ErrorSource,
    pub entity_path: String,
}

impl ProcessErrorContext {
    fn new(source: ErrorSource, entity_path: &EntityPath, error: impl Into<HandlerError>) -> Self {
        Self {
            error: error.into(),
            source,
            entity_path: entity_path.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
enum Link {
    Receiver(Arc<Receiver>),
    Session(Arc<SessionReceiver>),
}

impl Link {
    fn receiver(&self) -> &Receiver {
        match self {
            Self::Receiver(receiver) => receiver,
            Self::Session(session) => session.receiver(),
        }
    }
}

/// A received message together with its settlement verbs
#[derive(Debug)]
pub struct ProcessMessageContext {
    message: ReceivedMessage,
    link: Link,
    settled: AtomicBool,
}

impl ProcessMessageContext {
    fn new(message: ReceivedMessage, link: Link) -> Self {
        Self {
            message,
            link,
            settled: AtomicBool::new(false),
        }
    }

    pub fn message(&self) -> &ReceivedMessage {
        &self.message
    }

    pub fn entity_path(&self) -> &EntityPath {
        self.link.receiver().entity_path()
    }

    /// Session receiver when running under a session processor
    pub fn session(&self) -> Option<&SessionReceiver> {
        match &self.link {
            Link::Session(session) => Some(session),
            Link::Receiver(_) => None,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session().map(SessionReceiver::session_id)
    }

    /// Whether the handler settled the message itself
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    fn mark_settled(&self, result: Result<(), BusError>) -> Result<(), BusError> {
        if result.is_ok() {
            self.settled.store(true, Ordering::Release);
        }
        result
    }

    pub async fn complete_message(&self) -> Result<(), BusError> {
        let result = self.link.receiver().complete_message(&self.message).await;
        self.mark_settled(result)
    }

    pub async fn abandon_message(
        &self,
        properties_to_modify: Option<HashMap<String, PropertyValue>>,
    ) -> Result<(), BusError> {
        let result = self
            .link
            .receiver()
            .abandon_message(&self.message, properties_to_modify)
            .await;
        self.mark_settled(result)
    }

    pub async fn defer_message(
        &self,
        properties_to_modify: Option<HashMap<String, PropertyValue>>,
    ) -> Result<(), BusError> {
        let result = self
            .link
            .receiver()
            .defer_message(&self.message, properties_to_modify)
            .await;
        self.mark_settled(result)
    }

    pub async fn dead_letter_message(
        &self,
        reason: impl Into<String>,
        description: Option<String>,
    ) -> Result<(), BusError> {
        let result = self
            .link
            .receiver()
            .dead_letter_message(&self.message, reason, description)
            .await;
        self.mark_settled(result)
    }
}

// ============================================================================
// Options
// ============================================================================

/// Settings of a [`Processor`]
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub max_concurrent_calls: usize,
    pub auto_complete: bool,
    /// How long locks are kept alive while a handler runs; `None` disables renewal
    pub max_auto_lock_renewal_duration: Option<Duration>,
    pub receive_mode: ReceiveMode,
    pub sub_queue: SubQueue,
    pub prefetch_count: usize,
    /// Longest single wait for messages before the pump re-checks its state
    pub max_wait_time: Duration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            auto_complete: true,
            max_auto_lock_renewal_duration: Some(Duration::minutes(5)),
            receive_mode: ReceiveMode::PeekLock,
            sub_queue: SubQueue::None,
            prefetch_count: 0,
            max_wait_time: Duration::seconds(60),
        }
    }
}

impl ProcessorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_calls(mut self, calls: usize) -> Self {
        self.max_concurrent_calls = calls;
        self
    }

    pub fn with_auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    pub fn with_max_auto_lock_renewal_duration(mut self, duration: Option<Duration>) -> Self {
        self.max_auto_lock_renewal_duration = duration;
        self
    }

    pub fn with_max_wait_time(mut self, wait: Duration) -> Self {
        self.max_wait_time = wait;
        self
    }

    pub(crate) fn receiver_options(&self) -> ReceiverOptions {
        ReceiverOptions {
            receive_mode: self.receive_mode,
            sub_queue: self.sub_queue,
            prefetch_count: self.prefetch_count,
        }
    }

    fn settlement(&self) -> SettlementPolicy {
        SettlementPolicy {
            auto_complete: self.auto_complete && self.receive_mode == ReceiveMode::PeekLock,
            renew_for: self
                .max_auto_lock_renewal_duration
                .filter(|_| self.receive_mode == ReceiveMode::PeekLock),
        }
    }
}

/// Settings of a [`SessionProcessor`]
#[derive(Debug, Clone)]
pub struct SessionProcessorOptions {
    pub max_concurrent_sessions: usize,
    pub auto_complete: bool,
    pub max_auto_lock_renewal_duration: Option<Duration>,
    pub receive_mode: ReceiveMode,
    /// A session with no message for this long is closed and released
    pub session_idle_timeout: Duration,
    /// Longest wait for a session to become available
    pub max_wait_time: Duration,
}

impl Default for SessionProcessorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 8,
            auto_complete: true,
            max_auto_lock_renewal_duration: Some(Duration::minutes(5)),
            receive_mode: ReceiveMode::PeekLock,
            session_idle_timeout: Duration::seconds(60),
            max_wait_time: Duration::seconds(60),
        }
    }
}

impl SessionProcessorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_sessions(mut self, sessions: usize) -> Self {
        self.max_concurrent_sessions = sessions;
        self
    }

    pub fn with_auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    pub fn with_max_wait_time(mut self, wait: Duration) -> Self {
        self.max_wait_time = wait;
        self
    }

    fn receiver_options(&self) -> ReceiverOptions {
        ReceiverOptions {
            receive_mode: self.receive_mode,
            sub_queue: SubQueue::None,
            prefetch_count: 0,
        }
    }

    fn settlement(&self) -> SettlementPolicy {
        SettlementPolicy {
            auto_complete: self.auto_complete && self.receive_mode == ReceiveMode::PeekLock,
            renew_for: self
                .max_auto_lock_renewal_duration
                .filter(|_| self.receive_mode == ReceiveMode::PeekLock),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SettlementPolicy {
    auto_complete: bool,
    renew_for: Option<Duration>,
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Debug)]
struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Start/stop bookkeeping shared by both processor kinds
#[derive(Debug, Default)]
struct Lifecycle {
    running: Mutex<Option<Running>>,
    closed: AtomicBool,
}

impl Lifecycle {
    fn start(
        &self,
        entity: &EntityPath,
        spawn: impl FnOnce(CancellationToken) -> JoinHandle<()>,
    ) -> Result<(), BusError> {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // checked under the lock so a concurrent close either sees the new
        // pump or makes this call fail
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::ClientClosed {
                entity: entity.to_string(),
            });
        }
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(BusError::InvalidOperation {
                message: format!("processor for {} is already running", entity),
            });
        }
        let cancel = CancellationToken::new();
        let task = spawn(cancel.clone());
        *running = Some(Running { cancel, task });
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    async fn stop(&self, entity: &EntityPath) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            error!(entity = %entity, error = %e, "Processor task failed");
        }
    }

    /// Refuse further starts, then stop the current pump
    async fn close(&self, entity: &EntityPath) {
        self.closed.store(true, Ordering::Release);
        self.stop(entity).await;
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Concurrent message pump over one queue or subscription
pub struct Processor {
    receiver: Arc<Receiver>,
    options: ProcessorOptions,
    handler: Arc<dyn MessageHandler>,
    lifecycle: Lifecycle,
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("entity", &self.receiver.entity_path())
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Processor {
    pub(crate) fn new(receiver: Receiver, options: ProcessorOptions, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            receiver: Arc::new(receiver),
            options,
            handler,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn entity_path(&self) -> &EntityPath {
        self.receiver.entity_path()
    }

    /// Spawn the pump. Fails when already running or closed.
    pub fn start(&self) -> Result<(), BusError> {
        let receiver = self.receiver.clone();
        let handler = self.handler.clone();
        let options = self.options.clone();
        self.lifecycle.start(self.receiver.entity_path(), move |cancel| {
            tokio::spawn(run_processor(receiver, handler, options, cancel))
        })
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Stop receiving and wait for running handlers to finish
    pub async fn stop(&self) {
        self.lifecycle.stop(self.receiver.entity_path()).await;
    }

    /// Stop and close the underlying receiver
    pub async fn close(&self) {
        self.lifecycle.close(self.receiver.entity_path()).await;
        self.receiver.close().await;
    }
}

async fn run_processor(
    receiver: Arc<Receiver>,
    handler: Arc<dyn MessageHandler>,
    options: ProcessorOptions,
    cancel: CancellationToken,
) {
    let path = receiver.entity_path().clone();
    let limit = options.max_concurrent_calls.max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    let policy = options.settlement();
    info!(entity = %path, max_concurrent_calls = limit, "Processor started");

    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = receiver.receive_messages(1, Some(options.max_wait_time)) => result,
        };

        match received {
            Ok(messages) => {
                let Some(message) = messages.into_iter().next() else {
                    continue;
                };
                let link = Link::Receiver(receiver.clone());
                let handler = handler.clone();
                tokio::spawn(async move {
                    dispatch(link, message, handler, policy).await;
                    drop(permit);
                });
            }
            Err(e) => {
                let stop = matches!(e, BusError::ClientClosed { .. });
                let pause = e.retry_after().unwrap_or_else(|| Duration::seconds(1));
                handler
                    .process_error(ProcessErrorContext::new(ErrorSource::Receive, &path, e))
                    .await;
                if stop || pause_or_cancel(pause, &cancel).await {
                    break;
                }
            }
        }
    }

    // Wait for in-flight handlers
    if semaphore.acquire_many(limit as u32).await.is_ok() {
        debug!(entity = %path, "In-flight handlers finished");
    }
    info!(entity = %path, "Processor stopped");
}

// ============================================================================
// Session processor
// ============================================================================

/// Message pump accepting sessions one after another
pub struct SessionProcessor {
    client: ServiceBusClient,
    path: EntityPath,
    options: SessionProcessorOptions,
    handler: Arc<dyn MessageHandler>,
    lifecycle: Lifecycle,
}

impl fmt::Debug for SessionProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionProcessor")
            .field("entity", &self.path)
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SessionProcessor {
    pub(crate) fn new(
        client: ServiceBusClient,
        path: EntityPath,
        options: SessionProcessorOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            client,
            path,
            options,
            handler,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn entity_path(&self) -> &EntityPath {
        &self.path
    }

    pub fn start(&self) -> Result<(), BusError> {
        let client = self.client.clone();
        let path = self.path.clone();
        let handler = self.handler.clone();
        let options = self.options.clone();
        self.lifecycle.start(&self.path, move |cancel| {
            tokio::spawn(run_session_processor(client, path, handler, options, cancel))
        })
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Stop accepting sessions; sessions being drained finish their current message
    pub async fn stop(&self) {
        self.lifecycle.stop(&self.path).await;
    }

    pub async fn close(&self) {
        self.lifecycle.close(&self.path).await;
    }
}

async fn run_session_processor(
    client: ServiceBusClient,
    path: EntityPath,
    handler: Arc<dyn MessageHandler>,
    options: SessionProcessorOptions,
    cancel: CancellationToken,
) {
    let limit = options.max_concurrent_sessions.max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    info!(entity = %path, max_concurrent_sessions = limit, "Session processor started");

    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = client.accept_next_session_at(
                path.clone(),
                options.receiver_options(),
                Some(options.max_wait_time),
            ) => result,
        };

        match accepted {
            Ok(session) => {
                let session = Arc::new(session);
                debug!(entity = %path, session_id = %session.session_id(), "Draining session");
                tokio::spawn(drain_session(
                    session,
                    handler.clone(),
                    options.clone(),
                    cancel.clone(),
                    permit,
                ));
            }
            Err(BusError::Timeout { .. }) => continue,
            Err(e) => {
                let stop = matches!(e, BusError::ClientClosed { .. });
                let pause = e.retry_after().unwrap_or_else(|| Duration::seconds(1));
                handler
                    .process_error(ProcessErrorContext::new(ErrorSource::AcceptSession, &path, e))
                    .await;
                if stop || pause_or_cancel(pause, &cancel).await {
                    break;
                }
            }
        }
    }

    if semaphore.acquire_many(limit as u32).await.is_ok() {
        debug!(entity = %path, "Open sessions finished");
    }
    info!(entity = %path, "Session processor stopped");
}

async fn drain_session(
    session: Arc<SessionReceiver>,
    handler: Arc<dyn MessageHandler>,
    options: SessionProcessorOptions,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
) {
    let policy = options.settlement();
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = session.receive_messages(1, Some(options.session_idle_timeout)) => result,
        };
        match received {
            Ok(messages) if messages.is_empty() => {
                debug!(session_id = %session.session_id(), "Session idle");
                break;
            }
            Ok(messages) => {
                for message in messages {
                    dispatch(Link::Session(session.clone()), message, handler.clone(), policy).await;
                }
            }
            Err(e) => {
                handler
                    .process_error(ProcessErrorContext::new(
                        ErrorSource::Receive,
                        session.entity_path(),
                        e,
                    ))
                    .await;
                break;
            }
        }
    }
    session.close().await;
    drop(permit);
}

// ============================================================================
// Dispatch
// ============================================================================

/// Run the handler for one message and settle it per the policy
async fn dispatch(
    link: Link,
    message: ReceivedMessage,
    handler: Arc<dyn MessageHandler>,
    policy: SettlementPolicy,
) {
    let path = link.receiver().entity_path().clone();
    let sequence_number = message.sequence_number;
    let context = ProcessMessageContext::new(message, link);

    let renewal = policy
        .renew_for
        .map(|duration| spawn_lock_renewal(&context, duration, handler.clone()));

    let result = handler.process_message(&context).await;

    if let Some(renewal) = renewal {
        renewal.cancel();
    }

    match result {
        Ok(()) => {
            if policy.auto_complete && !context.is_settled() {
                if let Err(e) = context.complete_message().await {
                    handler
                        .process_error(ProcessErrorContext::new(ErrorSource::Complete, &path, e))
                        .await;
                }
            }
        }
        Err(e) => {
            debug!(entity = %path, sequence_number, error = %e, "Handler failed");
            handler
                .process_error(ProcessErrorContext::new(ErrorSource::UserCallback, &path, e))
                .await;
            if policy.auto_complete && !context.is_settled() {
                if let Err(e) = context.abandon_message(None).await {
                    handler
                        .process_error(ProcessErrorContext::new(ErrorSource::Abandon, &path, e))
                        .await;
                }
            }
        }
    }
}

/// Keep the message (or session) lock alive for up to `duration`.
/// Cancel the returned token once the handler is done.
fn spawn_lock_renewal(
    context: &ProcessMessageContext,
    duration: Duration,
    handler: Arc<dyn MessageHandler>,
) -> CancellationToken {
    let stop = CancellationToken::new();
    let token = stop.clone();
    let link = context.link.clone();
    let mut message = context.message.clone();
    let deadline = tokio::time::Instant::now() + duration.to_std().unwrap_or_default();

    tokio::spawn(async move {
        loop {
            let locked_until = match &link {
                Link::Session(session) => Some(session.locked_until()),
                Link::Receiver(_) => message.locked_until,
            };
            let Some(locked_until) = locked_until else {
                break;
            };

            let half = (locked_until.remaining() / 2)
                .to_std()
                .unwrap_or_default()
                .max(std::time::Duration::from_millis(MIN_RENEWAL_INTERVAL_MS));
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(half.min(deadline - now)) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }

            let renewed = match &link {
                Link::Session(session) => session.renew_session_lock().await,
                Link::Receiver(receiver) => receiver.renew_message_lock(&mut message).await,
            };
            match renewed {
                Ok(until) => debug!(sequence_number = message.sequence_number, locked_until = %until, "Lock renewed"),
                Err(_) if token.is_cancelled() => break,
                Err(e) => {
                    let path = link.receiver().entity_path().clone();
                    handler
                        .process_error(ProcessErrorContext::new(ErrorSource::RenewLock, &path, e))
                        .await;
                    break;
                }
            }
        }
    });

    stop
}

/// Sleep for `pause`; returns `true` when cancelled first
async fn pause_or_cancel(pause: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(pause.to_std().unwrap_or_default()) => false,
    }
}
