//! The in-memory namespace: entities, routing and authorization.
//!
//! A [`Namespace`] is a cheap-to-clone handle to shared broker state. Clients,
//! administration clients and processors all hold a clone. State lives behind
//! a single mutex; every operation is short and synchronous while the lock is
//! held. Receivers that need to wait park on a [`Notify`] that is signalled
//! after every mutation.
//!
//! # Routing
//!
//! - A message sent to a queue is stored in the queue, or handed on to the
//!   queue's `forward_to` target.
//! - A message sent to a topic receives a topic sequence number and each
//!   subscription gets at most one copy. The copy is made when any rule's
//!   filter matches; actions of all matching rules run in rule-name order.
//! - Forwarding increments a hop count. A message that would exceed
//!   [`NamespaceConfig::max_forward_hops`] is dead-lettered instead.

use crate::auth::{AccessRight, AuthorizationRule, ConnectionProperties, ROOT_KEY_NAME};
use crate::config::NamespaceConfig;
use crate::entity::{
    EntityRuntimeInfo, QueueProperties, RuleProperties, SubscriptionProperties, TopicProperties,
    TopicRuntimeInfo,
};
use crate::error::BusError;
use crate::filter::{EvaluationContext, Filter};
use crate::message::{
    EntityName, LockToken, Message, MessageId, PropertyValue, ReceiveMode, ReceivedMessage,
    SessionId, SubQueue, Timestamp, DEAD_LETTER_FILTER_EVALUATION,
    DEAD_LETTER_MAX_TRANSFER_HOPS, DEAD_LETTER_SESSION_ID_MISSING,
};
use crate::store::{DuplicateLog, EntityStore, SessionLease, StoreSettings};
use bytes::Bytes;
use chrono::Duration;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "namespace_tests.rs"]
mod tests;

// ============================================================================
// Entity paths
// ============================================================================

/// Address of a receivable entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityPath {
    Queue(EntityName),
    Subscription {
        topic: EntityName,
        subscription: EntityName,
    },
}

impl EntityPath {
    pub fn queue(name: EntityName) -> Self {
        Self::Queue(name)
    }

    pub fn subscription(topic: EntityName, subscription: EntityName) -> Self {
        Self::Subscription {
            topic,
            subscription,
        }
    }

    /// Entity whose authorization rules apply: the queue or the topic
    pub fn authorization_entity(&self) -> &EntityName {
        match self {
            Self::Queue(name) => name,
            Self::Subscription { topic, .. } => topic,
        }
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(name) => write!(f, "{}", name),
            Self::Subscription {
                topic,
                subscription,
            } => write!(f, "{}/Subscriptions/{}", topic, subscription),
        }
    }
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, Clone)]
struct QueueEntity {
    properties: QueueProperties,
    store: EntityStore,
    duplicates: DuplicateLog,
    authorization_rules: BTreeMap<String, AuthorizationRule>,
}

#[derive(Debug, Clone)]
struct TopicEntity {
    properties: TopicProperties,
    subscriptions: BTreeMap<EntityName, SubscriptionEntity>,
    duplicates: DuplicateLog,
    next_sequence: i64,
    authorization_rules: BTreeMap<String, AuthorizationRule>,
}

#[derive(Debug, Clone)]
struct SubscriptionEntity {
    properties: SubscriptionProperties,
    rules: BTreeMap<String, RuleProperties>,
    store: EntityStore,
}

/// Outcome of evaluating a subscription's rules against one message
enum RuleOutcome {
    NoMatch,
    Copy(Message),
    Fault(String),
}

impl SubscriptionEntity {
    fn evaluate(&self, message: &Message, sequence_number: i64, now: Timestamp) -> RuleOutcome {
        let context = EvaluationContext::for_enqueued(message, sequence_number, now);
        let dead_letter_faults = self.properties.dead_lettering_on_filter_evaluation_exceptions;

        let mut matched = Vec::new();
        for rule in self.rules.values() {
            match rule.filter.matches(&context) {
                Ok(true) => matched.push(rule),
                Ok(false) => {}
                Err(e) if dead_letter_faults => {
                    return RuleOutcome::Fault(format!("rule '{}': {}", rule.name, e))
                }
                Err(e) => {
                    debug!(rule = %rule.name, error = %e, "Filter evaluation failed; rule skipped");
                }
            }
        }

        if matched.is_empty() {
            return RuleOutcome::NoMatch;
        }

        let mut copy = message.clone();
        for rule in matched {
            if let Some(action) = &rule.action {
                if let Err(e) = action.apply(&mut copy, Some(sequence_number)) {
                    if dead_letter_faults {
                        return RuleOutcome::Fault(format!("rule '{}' action: {}", rule.name, e));
                    }
                    warn!(rule = %rule.name, error = %e, "Rule action failed; action skipped");
                }
            }
        }
        RuleOutcome::Copy(copy)
    }
}

/// Copies of the entities a message can reach, taken before routing it
#[derive(Debug, Default)]
struct Snapshot {
    queues: Vec<(EntityName, QueueEntity)>,
    topics: Vec<(EntityName, TopicEntity)>,
}

#[derive(Debug)]
struct State {
    queues: BTreeMap<EntityName, QueueEntity>,
    topics: BTreeMap<EntityName, TopicEntity>,
    authorization_rules: BTreeMap<String, AuthorizationRule>,
}

impl State {
    fn entity_exists(&self, name: &EntityName) -> bool {
        self.queues.contains_key(name) || self.topics.contains_key(name)
    }

    fn queue_mut(&mut self, name: &EntityName) -> Result<&mut QueueEntity, BusError> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BusError::EntityNotFound {
                entity: name.to_string(),
            })
    }

    fn topic_mut(&mut self, name: &EntityName) -> Result<&mut TopicEntity, BusError> {
        self.topics
            .get_mut(name)
            .ok_or_else(|| BusError::EntityNotFound {
                entity: name.to_string(),
            })
    }

    fn subscription_mut(
        &mut self,
        topic: &EntityName,
        subscription: &EntityName,
    ) -> Result<&mut SubscriptionEntity, BusError> {
        self.topic_mut(topic)?
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BusError::EntityNotFound {
                entity: format!("{}/Subscriptions/{}", topic, subscription),
            })
    }

    fn store_mut(&mut self, path: &EntityPath, sub_queue: SubQueue) -> Result<&mut EntityStore, BusError> {
        let store = match path {
            EntityPath::Queue(name) => &mut self.queue_mut(name)?.store,
            EntityPath::Subscription {
                topic,
                subscription,
            } => &mut self.subscription_mut(topic, subscription)?.store,
        };
        match sub_queue {
            SubQueue::None => Ok(store),
            SubQueue::DeadLetter => store.dead_letter_store(),
        }
    }

    fn validate_forward_target(
        &self,
        source: &EntityName,
        target: Option<&EntityName>,
    ) -> Result<(), BusError> {
        let Some(target) = target else {
            return Ok(());
        };
        if target == source {
            return Err(BusError::InvalidOperation {
                message: format!("{} cannot forward to itself", source),
            });
        }
        if !self.entity_exists(target) {
            return Err(BusError::EntityNotFound {
                entity: target.to_string(),
            });
        }
        Ok(())
    }

    /// Copy `target` and every entity reachable from it through `forward_to`
    fn snapshot(&self, target: &EntityName) -> Snapshot {
        let mut snapshot = Snapshot::default();
        let mut visited = BTreeSet::new();
        let mut pending = vec![target.clone()];
        while let Some(name) = pending.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            if let Some(queue) = self.queues.get(&name) {
                pending.extend(queue.properties.forward_to.iter().cloned());
                snapshot.queues.push((name, queue.clone()));
            } else if let Some(topic) = self.topics.get(&name) {
                pending.extend(
                    topic
                        .subscriptions
                        .values()
                        .filter_map(|s| s.properties.forward_to.clone()),
                );
                snapshot.topics.push((name, topic.clone()));
            }
        }
        snapshot
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.queues.extend(snapshot.queues);
        self.topics.extend(snapshot.topics);
    }

    /// Route messages in order; when any of them fails, every entity they
    /// could reach is put back as it was
    fn route_all_or_nothing(
        &mut self,
        config: &NamespaceConfig,
        target: &EntityName,
        messages: Vec<Message>,
        hops: u8,
        now: Timestamp,
    ) -> Result<Vec<i64>, BusError> {
        let snapshot = self.snapshot(target);
        let mut sequence_numbers = Vec::with_capacity(messages.len());
        for message in messages {
            match self.route(config, target, message, hops, now) {
                Ok(Some(seq)) => sequence_numbers.push(seq),
                Ok(None) => {}
                Err(e) => {
                    self.restore(snapshot);
                    return Err(e);
                }
            }
        }
        Ok(sequence_numbers)
    }

    /// Deliver a message to a queue or topic. Returns the sequence number
    /// assigned by the entity it was addressed to, or `None` when it was
    /// dropped as a duplicate.
    fn route(
        &mut self,
        config: &NamespaceConfig,
        target: &EntityName,
        message: Message,
        hops: u8,
        now: Timestamp,
    ) -> Result<Option<i64>, BusError> {
        if self.queues.contains_key(target) {
            self.route_to_queue(config, target, message, hops, now)
        } else if self.topics.contains_key(target) {
            self.route_to_topic(config, target, message, hops, now)
        } else {
            Err(BusError::EntityNotFound {
                entity: target.to_string(),
            })
        }
    }

    fn route_to_queue(
        &mut self,
        config: &NamespaceConfig,
        name: &EntityName,
        message: Message,
        hops: u8,
        now: Timestamp,
    ) -> Result<Option<i64>, BusError> {
        let (forward_to, detected_id) = {
            let queue = self.queue_mut(name)?;
            let detected_id = message
                .message_id
                .clone()
                .filter(|_| queue.properties.requires_duplicate_detection);
            if let Some(id) = &detected_id {
                if queue.duplicates.is_duplicate(id, now) {
                    debug!(entity = %name, message_id = %id, "Duplicate message dropped");
                    return Ok(None);
                }
            }
            (queue.properties.forward_to.clone(), detected_id)
        };

        let routed = self.deliver_to_queue(config, name, forward_to, message, hops, now)?;
        if let Some(id) = detected_id {
            self.queue_mut(name)?.duplicates.record(&id, now);
        }
        Ok(routed)
    }

    /// Store or forward a message already accepted by queue `name`
    fn deliver_to_queue(
        &mut self,
        config: &NamespaceConfig,
        name: &EntityName,
        forward_to: Option<EntityName>,
        message: Message,
        hops: u8,
        now: Timestamp,
    ) -> Result<Option<i64>, BusError> {
        match forward_to.filter(|target| self.entity_exists(target)) {
            Some(target) => {
                let queue = self.queue_mut(name)?;
                if hops >= config.max_forward_hops {
                    let seq = queue.store.next_sequence_number();
                    queue.store.dead_letter_new(
                        message,
                        Some(seq),
                        hops,
                        DEAD_LETTER_MAX_TRANSFER_HOPS,
                        Some(format!("forwarding to {} exceeded {} hops", target, config.max_forward_hops)),
                        now,
                    )?;
                    return Ok(Some(seq));
                }
                debug!(from = %name, to = %target, hops = hops + 1, "Forwarding message");
                self.route(config, &target, message, hops + 1, now)
            }
            None => {
                let queue = self.queue_mut(name)?;
                queue.store.enqueue(message, None, hops, now).map(Some)
            }
        }
    }

    fn route_to_topic(
        &mut self,
        config: &NamespaceConfig,
        name: &EntityName,
        mut message: Message,
        hops: u8,
        now: Timestamp,
    ) -> Result<Option<i64>, BusError> {
        let topic = self.topic_mut(name)?;
        let detected_id = message
            .message_id
            .clone()
            .filter(|_| topic.properties.requires_duplicate_detection);
        if let Some(id) = &detected_id {
            if topic.duplicates.is_duplicate(id, now) {
                debug!(entity = %name, message_id = %id, "Duplicate message dropped");
                return Ok(None);
            }
        }

        if let Some(default_ttl) = topic.properties.default_message_time_to_live {
            message.time_to_live = Some(message.time_to_live.map_or(default_ttl, |t| t.min(default_ttl)));
        }

        let sequence_number = topic.next_sequence;
        topic.next_sequence += 1;

        let mut forwards = Vec::new();
        for (sub_name, subscription) in topic.subscriptions.iter_mut() {
            let copy = match subscription.evaluate(&message, sequence_number, now) {
                RuleOutcome::NoMatch => continue,
                RuleOutcome::Fault(description) => {
                    subscription.store.dead_letter_new(
                        message.clone(),
                        Some(sequence_number),
                        hops,
                        DEAD_LETTER_FILTER_EVALUATION,
                        Some(description),
                        now,
                    )?;
                    continue;
                }
                RuleOutcome::Copy(copy) => copy,
            };

            if subscription.properties.requires_session && copy.session_id.is_none() {
                subscription.store.dead_letter_new(
                    copy,
                    Some(sequence_number),
                    hops,
                    DEAD_LETTER_SESSION_ID_MISSING,
                    Some("subscription requires sessions".to_string()),
                    now,
                )?;
                continue;
            }

            match subscription.properties.forward_to.clone() {
                Some(target) if hops >= config.max_forward_hops => {
                    subscription.store.dead_letter_new(
                        copy,
                        Some(sequence_number),
                        hops,
                        DEAD_LETTER_MAX_TRANSFER_HOPS,
                        Some(format!("forwarding to {} exceeded {} hops", target, config.max_forward_hops)),
                        now,
                    )?;
                }
                Some(target) => forwards.push((sub_name.clone(), target, copy)),
                None => {
                    subscription
                        .store
                        .enqueue(copy, Some(sequence_number), hops, now)?;
                }
            }
        }

        debug!(entity = %name, sequence_number, "Message published to topic");

        for (sub_name, target, copy) in forwards {
            if self.entity_exists(&target) {
                debug!(from = %name, subscription = %sub_name, to = %target, "Forwarding message");
                self.route(config, &target, copy, hops + 1, now)?;
            } else {
                warn!(subscription = %sub_name, target = %target, "Forward target missing; keeping message");
                self.subscription_mut(name, &sub_name)?
                    .store
                    .enqueue(copy, Some(sequence_number), hops, now)?;
            }
        }

        if let Some(id) = detected_id {
            self.topic_mut(name)?.duplicates.record(&id, now);
        }
        Ok(Some(sequence_number))
    }

    /// Move dead-lettered messages of entities with a dead-letter forward
    /// target. A message leaves its dead-letter sub-queue only once the target
    /// accepted it; otherwise it stays put and is retried after the next
    /// mutation.
    fn forward_dead_letters(&mut self, config: &NamespaceConfig, now: Timestamp) {
        let mut outbound = Vec::new();
        let existing: Vec<EntityName> = self
            .queues
            .keys()
            .chain(self.topics.keys())
            .cloned()
            .collect();

        for (name, queue) in self.queues.iter() {
            if let Some(target) = queue
                .properties
                .forward_dead_lettered_messages_to
                .as_ref()
                .filter(|t| existing.contains(t))
            {
                for (seq, message) in queue.store.forwardable_dead_letters(config.max_forward_hops) {
                    outbound.push((EntityPath::queue(name.clone()), seq, target.clone(), message));
                }
            }
        }
        for (topic_name, topic) in self.topics.iter() {
            for (sub_name, subscription) in topic.subscriptions.iter() {
                if let Some(target) = subscription
                    .properties
                    .forward_dead_lettered_messages_to
                    .as_ref()
                    .filter(|t| existing.contains(t))
                {
                    let source = EntityPath::subscription(topic_name.clone(), sub_name.clone());
                    for (seq, message) in subscription.store.forwardable_dead_letters(config.max_forward_hops) {
                        outbound.push((source.clone(), seq, target.clone(), message));
                    }
                }
            }
        }

        for (source, seq, target, forwarded) in outbound {
            debug!(from = %source, to = %target, "Forwarding dead-lettered message");
            let routed = self.route_all_or_nothing(
                config,
                &target,
                vec![forwarded.message],
                forwarded.hops + 1,
                now,
            );
            match routed {
                Ok(_) => {
                    if let Ok(store) = self.store_mut(&source, SubQueue::None) {
                        store.remove_dead_letter(seq);
                    }
                }
                Err(e) => {
                    warn!(from = %source, to = %target, error = %e, "Dead-letter forwarding failed; message kept");
                }
            }
        }
    }

    fn find_rule(&self, name: &str, entity: Option<&EntityName>) -> Option<&AuthorizationRule> {
        if let Some(rule) = self.authorization_rules.get(name) {
            return Some(rule);
        }
        let entity = entity?;
        self.queues
            .get(entity)
            .and_then(|q| q.authorization_rules.get(name))
            .or_else(|| {
                self.topics
                    .get(entity)
                    .and_then(|t| t.authorization_rules.get(name))
            })
    }

    fn rules_at_scope(
        &mut self,
        entity: Option<&EntityName>,
    ) -> Result<&mut BTreeMap<String, AuthorizationRule>, BusError> {
        let Some(entity) = entity else {
            return Ok(&mut self.authorization_rules);
        };
        if let Some(queue) = self.queues.get_mut(entity) {
            return Ok(&mut queue.authorization_rules);
        }
        if let Some(topic) = self.topics.get_mut(entity) {
            return Ok(&mut topic.authorization_rules);
        }
        Err(BusError::EntityNotFound {
            entity: entity.to_string(),
        })
    }
}

// ============================================================================
// Namespace
// ============================================================================

#[derive(Debug)]
struct Inner {
    config: NamespaceConfig,
    state: Mutex<State>,
    notify: Notify,
}

/// Shared handle to an in-memory namespace
#[derive(Debug, Clone)]
pub struct Namespace {
    inner: Arc<Inner>,
}

impl Namespace {
    /// Create an empty namespace holding only the root authorization rule
    pub fn new(config: NamespaceConfig) -> Result<Self, BusError> {
        config.validate()?;

        let mut authorization_rules = BTreeMap::new();
        authorization_rules.insert(ROOT_KEY_NAME.to_string(), AuthorizationRule::root());

        info!(namespace = %config.name, "Namespace created");
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    queues: BTreeMap::new(),
                    topics: BTreeMap::new(),
                    authorization_rules,
                }),
                notify: Notify::new(),
            }),
        })
    }

    /// Namespace with relaxed limits for tests, see [`NamespaceConfig::for_testing`]
    pub fn for_testing(name: &str) -> Result<Self, BusError> {
        Self::new(NamespaceConfig::for_testing(name))
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Connection string carrying the root key
    pub fn connection_string(&self) -> String {
        self.connection_string_for(ROOT_KEY_NAME, None)
            .unwrap_or_default()
    }

    /// Connection string for a named rule; with an entity, the rule may be
    /// defined on that entity and the string is scoped to it
    pub fn connection_string_for(
        &self,
        key_name: &str,
        entity: Option<&EntityName>,
    ) -> Result<String, BusError> {
        let state = self.state();
        let rule = state
            .find_rule(key_name, entity)
            .ok_or_else(|| BusError::EntityNotFound {
                entity: format!("authorization rule {}", key_name),
            })?;
        Ok(rule.connection_string(&self.inner.config.endpoint(), entity))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a mutation, forward dead letters it produced and wake waiters
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut State, &NamespaceConfig, Timestamp) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        let config = &self.inner.config;
        let now = Timestamp::now();
        let result = {
            let mut state = self.state();
            let result = f(&mut *state, config, now);
            state.forward_dead_letters(config, now);
            result
        };
        self.inner.notify.notify_waiters();
        result
    }

    /// Retry `attempt` until it yields a value or `max_wait` elapses. Waiters
    /// wake on every namespace mutation and at least once per poll interval so
    /// lock expiry and scheduled messages are noticed.
    pub(crate) async fn wait_for<T>(
        &self,
        max_wait: Duration,
        mut attempt: impl FnMut() -> Result<Option<T>, BusError>,
    ) -> Result<Option<T>, BusError> {
        let max_wait = max_wait.to_std().unwrap_or_default();
        let poll = self
            .inner
            .config
            .receive_poll_interval
            .to_std()
            .unwrap_or(std::time::Duration::from_millis(100));
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = attempt()? {
                return Ok(Some(value));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = (deadline - now).min(poll);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    // ------------------------------------------------------------------------
    // Authorization
    // ------------------------------------------------------------------------

    /// Check that `credentials` carry `right` for `entity` (or the namespace)
    pub(crate) fn authorize(
        &self,
        credentials: &ConnectionProperties,
        right: AccessRight,
        entity: Option<&EntityName>,
    ) -> Result<(), BusError> {
        let denied = || BusError::Unauthorized {
            key_name: credentials.shared_access_key_name.clone(),
            right: right.to_string(),
            entity: entity.map_or_else(|| self.name().to_string(), |e| e.to_string()),
        };

        if credentials.namespace != self.inner.config.name {
            return Err(denied());
        }
        if let Some(scope) = &credentials.entity_path {
            if entity != Some(scope) {
                return Err(denied());
            }
        }

        let state = self.state();
        let rule = state
            .find_rule(&credentials.shared_access_key_name, entity)
            .ok_or_else(denied)?;
        if !rule.matches_key(credentials.shared_access_key()) || !rule.grants(right) {
            warn!(
                key_name = %credentials.shared_access_key_name,
                right = %right,
                "Authorization denied"
            );
            return Err(denied());
        }
        Ok(())
    }

    /// Whether the key name and key match any rule, at any scope
    pub(crate) fn authenticate(&self, credentials: &ConnectionProperties) -> bool {
        if credentials.namespace != self.inner.config.name {
            return false;
        }
        let state = self.state();
        let entity = credentials.entity_path.as_ref();
        state
            .find_rule(&credentials.shared_access_key_name, entity)
            .is_some_and(|rule| rule.matches_key(credentials.shared_access_key()))
    }

    pub(crate) fn create_authorization_rule(
        &self,
        entity: Option<&EntityName>,
        rule: AuthorizationRule,
    ) -> Result<AuthorizationRule, BusError> {
        rule.validate()?;
        self.mutate(|state, _, _| {
            let rules = state.rules_at_scope(entity)?;
            if rules.contains_key(&rule.key_name) {
                return Err(BusError::EntityAlreadyExists {
                    entity: format!("authorization rule {}", rule.key_name),
                });
            }
            rules.insert(rule.key_name.clone(), rule.clone());
            info!(key_name = %rule.key_name, scope = ?entity.map(|e| e.as_str()), "Authorization rule created");
            Ok(rule)
        })
    }

    /// Insert or replace a rule, including the root rule's keys
    pub(crate) fn put_authorization_rule(
        &self,
        entity: Option<&EntityName>,
        rule: AuthorizationRule,
    ) -> Result<(), BusError> {
        rule.validate()?;
        self.mutate(|state, _, _| {
            let rules = state.rules_at_scope(entity)?;
            if rules.insert(rule.key_name.clone(), rule.clone()).is_some() {
                debug!(key_name = %rule.key_name, "Authorization rule replaced");
            }
            Ok(())
        })
    }

    pub(crate) fn list_authorization_rules(
        &self,
        entity: Option<&EntityName>,
    ) -> Result<Vec<AuthorizationRule>, BusError> {
        let mut state = self.state();
        Ok(state.rules_at_scope(entity)?.values().cloned().collect())
    }

    pub(crate) fn delete_authorization_rule(
        &self,
        entity: Option<&EntityName>,
        key_name: &str,
    ) -> Result<(), BusError> {
        if entity.is_none() && key_name == ROOT_KEY_NAME {
            return Err(BusError::InvalidOperation {
                message: format!("{} cannot be deleted", ROOT_KEY_NAME),
            });
        }
        self.mutate(|state, _, _| {
            state
                .rules_at_scope(entity)?
                .remove(key_name)
                .map(|_| ())
                .ok_or_else(|| BusError::EntityNotFound {
                    entity: format!("authorization rule {}", key_name),
                })
        })
    }

    // ------------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------------

    pub(crate) fn create_queue(
        &self,
        name: &EntityName,
        properties: QueueProperties,
    ) -> Result<QueueProperties, BusError> {
        properties.validate(&self.inner.config)?;
        self.mutate(|state, _, _| {
            if state.entity_exists(name) {
                return Err(BusError::EntityAlreadyExists {
                    entity: name.to_string(),
                });
            }
            state.validate_forward_target(name, properties.forward_to.as_ref())?;
            state.validate_forward_target(name, properties.forward_dead_lettered_messages_to.as_ref())?;

            state.queues.insert(
                name.clone(),
                QueueEntity {
                    store: EntityStore::new(StoreSettings::for_queue(name.as_str(), &properties)),
                    duplicates: DuplicateLog::new(properties.duplicate_detection_history_time_window),
                    properties: properties.clone(),
                    authorization_rules: BTreeMap::new(),
                },
            );
            info!(queue = %name, sessions = properties.requires_session, "Queue created");
            Ok(properties)
        })
    }

    pub(crate) fn get_queue(&self, name: &EntityName) -> Result<QueueProperties, BusError> {
        Ok(self.state().queue_mut(name)?.properties.clone())
    }

    pub(crate) fn update_queue(
        &self,
        name: &EntityName,
        properties: QueueProperties,
    ) -> Result<QueueProperties, BusError> {
        properties.validate(&self.inner.config)?;
        self.mutate(|state, _, _| {
            state.validate_forward_target(name, properties.forward_to.as_ref())?;
            state.validate_forward_target(name, properties.forward_dead_lettered_messages_to.as_ref())?;

            let queue = state.queue_mut(name)?;
            if queue.properties.requires_session != properties.requires_session {
                return Err(BusError::InvalidOperation {
                    message: "requires_session cannot be changed after creation".to_string(),
                });
            }
            queue
                .store
                .update_settings(StoreSettings::for_queue(name.as_str(), &properties));
            queue
                .duplicates
                .set_window(properties.duplicate_detection_history_time_window);
            queue.properties = properties.clone();
            info!(queue = %name, "Queue updated");
            Ok(properties)
        })
    }

    pub(crate) fn delete_queue(&self, name: &EntityName) -> Result<(), BusError> {
        self.mutate(|state, _, _| {
            state
                .queues
                .remove(name)
                .ok_or_else(|| BusError::EntityNotFound {
                    entity: name.to_string(),
                })?;
            info!(queue = %name, "Queue deleted");
            Ok(())
        })
    }

    pub(crate) fn list_queues(&self) -> Vec<EntityName> {
        self.state().queues.keys().cloned().collect()
    }

    pub(crate) fn queue_runtime_info(&self, name: &EntityName) -> Result<EntityRuntimeInfo, BusError> {
        let now = Timestamp::now();
        Ok(self.state().queue_mut(name)?.store.runtime_info(now))
    }

    // ------------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------------

    pub(crate) fn create_topic(
        &self,
        name: &EntityName,
        properties: TopicProperties,
    ) -> Result<TopicProperties, BusError> {
        properties.validate()?;
        self.mutate(|state, _, _| {
            if state.entity_exists(name) {
                return Err(BusError::EntityAlreadyExists {
                    entity: name.to_string(),
                });
            }
            state.topics.insert(
                name.clone(),
                TopicEntity {
                    duplicates: DuplicateLog::new(properties.duplicate_detection_history_time_window),
                    properties: properties.clone(),
                    subscriptions: BTreeMap::new(),
                    next_sequence: 1,
                    authorization_rules: BTreeMap::new(),
                },
            );
            info!(topic = %name, "Topic created");
            Ok(properties)
        })
    }

    pub(crate) fn get_topic(&self, name: &EntityName) -> Result<TopicProperties, BusError> {
        Ok(self.state().topic_mut(name)?.properties.clone())
    }

    pub(crate) fn update_topic(
        &self,
        name: &EntityName,
        properties: TopicProperties,
    ) -> Result<TopicProperties, BusError> {
        properties.validate()?;
        self.mutate(|state, _, _| {
            let topic = state.topic_mut(name)?;
            for (sub_name, subscription) in topic.subscriptions.iter_mut() {
                let path = EntityPath::subscription(name.clone(), sub_name.clone());
                subscription.store.update_settings(StoreSettings::for_subscription(
                    path.to_string(),
                    &subscription.properties,
                    properties.max_size_in_messages,
                ));
            }
            topic
                .duplicates
                .set_window(properties.duplicate_detection_history_time_window);
            topic.properties = properties.clone();
            info!(topic = %name, "Topic updated");
            Ok(properties)
        })
    }

    pub(crate) fn delete_topic(&self, name: &EntityName) -> Result<(), BusError> {
        self.mutate(|state, _, _| {
            state
                .topics
                .remove(name)
                .ok_or_else(|| BusError::EntityNotFound {
                    entity: name.to_string(),
                })?;
            info!(topic = %name, "Topic deleted");
            Ok(())
        })
    }

    pub(crate) fn list_topics(&self) -> Vec<EntityName> {
        self.state().topics.keys().cloned().collect()
    }

    pub(crate) fn topic_runtime_info(&self, name: &EntityName) -> Result<TopicRuntimeInfo, BusError> {
        let now = Timestamp::now();
        let mut state = self.state();
        let topic = state.topic_mut(name)?;
        let scheduled_message_count = topic
            .subscriptions
            .values_mut()
            .map(|s| s.store.runtime_info(now).scheduled_message_count)
            .sum();
        Ok(TopicRuntimeInfo {
            subscription_count: topic.subscriptions.len(),
            scheduled_message_count,
        })
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Create a subscription holding the `$Default` rule
    pub(crate) fn create_subscription(
        &self,
        topic: &EntityName,
        name: &EntityName,
        properties: SubscriptionProperties,
    ) -> Result<SubscriptionProperties, BusError> {
        properties.validate(&self.inner.config)?;
        self.mutate(|state, _, _| {
            let path = EntityPath::subscription(topic.clone(), name.clone());
            state.validate_forward_target(topic, properties.forward_to.as_ref())?;
            state.validate_forward_target(topic, properties.forward_dead_lettered_messages_to.as_ref())?;

            let entity = state.topic_mut(topic)?;
            if entity.subscriptions.contains_key(name) {
                return Err(BusError::EntityAlreadyExists {
                    entity: path.to_string(),
                });
            }

            let default_rule = RuleProperties::default_rule();
            let mut rules = BTreeMap::new();
            rules.insert(default_rule.name.clone(), default_rule);

            entity.subscriptions.insert(
                name.clone(),
                SubscriptionEntity {
                    store: EntityStore::new(StoreSettings::for_subscription(
                        path.to_string(),
                        &properties,
                        entity.properties.max_size_in_messages,
                    )),
                    properties: properties.clone(),
                    rules,
                },
            );
            info!(subscription = %path, "Subscription created");
            Ok(properties)
        })
    }

    pub(crate) fn get_subscription(
        &self,
        topic: &EntityName,
        name: &EntityName,
    ) -> Result<SubscriptionProperties, BusError> {
        Ok(self
            .state()
            .subscription_mut(topic, name)?
            .properties
            .clone())
    }

    pub(crate) fn update_subscription(
        &self,
        topic: &EntityName,
        name: &EntityName,
        properties: SubscriptionProperties,
    ) -> Result<SubscriptionProperties, BusError> {
        properties.validate(&self.inner.config)?;
        self.mutate(|state, _, _| {
            state.validate_forward_target(topic, properties.forward_to.as_ref())?;
            state.validate_forward_target(topic, properties.forward_dead_lettered_messages_to.as_ref())?;

            let max_size = state.topic_mut(topic)?.properties.max_size_in_messages;
            let path = EntityPath::subscription(topic.clone(), name.clone());
            let subscription = state.subscription_mut(topic, name)?;
            if subscription.properties.requires_session != properties.requires_session {
                return Err(BusError::InvalidOperation {
                    message: "requires_session cannot be changed after creation".to_string(),
                });
            }
            subscription.store.update_settings(StoreSettings::for_subscription(
                path.to_string(),
                &properties,
                max_size,
            ));
            subscription.properties = properties.clone();
            info!(subscription = %path, "Subscription updated");
            Ok(properties)
        })
    }

    pub(crate) fn delete_subscription(&self, topic: &EntityName, name: &EntityName) -> Result<(), BusError> {
        self.mutate(|state, _, _| {
            state
                .topic_mut(topic)?
                .subscriptions
                .remove(name)
                .ok_or_else(|| BusError::EntityNotFound {
                    entity: format!("{}/Subscriptions/{}", topic, name),
                })?;
            info!(topic = %topic, subscription = %name, "Subscription deleted");
            Ok(())
        })
    }

    pub(crate) fn list_subscriptions(&self, topic: &EntityName) -> Result<Vec<EntityName>, BusError> {
        Ok(self
            .state()
            .topic_mut(topic)?
            .subscriptions
            .keys()
            .cloned()
            .collect())
    }

    pub(crate) fn subscription_runtime_info(
        &self,
        topic: &EntityName,
        name: &EntityName,
    ) -> Result<EntityRuntimeInfo, BusError> {
        let now = Timestamp::now();
        Ok(self
            .state()
            .subscription_mut(topic, name)?
            .store
            .runtime_info(now))
    }

    // ------------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------------

    pub(crate) fn create_rule(
        &self,
        topic: &EntityName,
        subscription: &EntityName,
        rule: RuleProperties,
    ) -> Result<RuleProperties, BusError> {
        rule.validate()?;
        if let Filter::Correlation(filter) = &rule.filter {
            filter.validate()?;
        }
        self.mutate(|state, _, _| {
            let entity = state.subscription_mut(topic, subscription)?;
            if entity.rules.contains_key(&rule.name) {
                return Err(BusError::EntityAlreadyExists {
                    entity: format!("{}/Subscriptions/{}/Rules/{}", topic, subscription, rule.name),
                });
            }
            entity.rules.insert(rule.name.clone(), rule.clone());
            info!(topic = %topic, subscription = %subscription, rule = %rule.name, "Rule created");
            Ok(rule)
        })
    }

    pub(crate) fn get_rule(
        &self,
        topic: &EntityName,
        subscription: &EntityName,
        name: &str,
    ) -> Result<RuleProperties, BusError> {
        self.state()
            .subscription_mut(topic, subscription)?
            .rules
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::EntityNotFound {
                entity: format!("{}/Subscriptions/{}/Rules/{}", topic, subscription, name),
            })
    }

    pub(crate) fn delete_rule(
        &self,
        topic: &EntityName,
        subscription: &EntityName,
        name: &str,
    ) -> Result<(), BusError> {
        self.mutate(|state, _, _| {
            state
                .subscription_mut(topic, subscription)?
                .rules
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| BusError::EntityNotFound {
                    entity: format!("{}/Subscriptions/{}/Rules/{}", topic, subscription, name),
                })
        })
    }

    pub(crate) fn list_rules(
        &self,
        topic: &EntityName,
        subscription: &EntityName,
    ) -> Result<Vec<RuleProperties>, BusError> {
        Ok(self
            .state()
            .subscription_mut(topic, subscription)?
            .rules
            .values()
            .cloned()
            .collect())
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send messages to a queue or topic as one unit. Returns the sequence
    /// numbers of the messages that were accepted (duplicates are dropped).
    pub(crate) fn send(&self, entity: &EntityName, messages: Vec<Message>) -> Result<Vec<i64>, BusError> {
        let max_size = self.inner.config.max_message_size;
        let total: usize = messages.iter().map(Message::size).sum();
        if let Some(large) = messages.iter().find(|m| m.size() > max_size) {
            return Err(BusError::MessageTooLarge {
                size: large.size(),
                max_size,
            });
        }
        if total > max_size {
            return Err(BusError::MessageTooLarge {
                size: total,
                max_size,
            });
        }

        self.mutate(|state, config, now| {
            check_capacity(state, entity, messages.len())?;

            let messages = messages
                .into_iter()
                .map(|mut message| {
                    message.message_id.get_or_insert_with(MessageId::new);
                    message
                })
                .collect();
            let sequence_numbers = state.route_all_or_nothing(config, entity, messages, 0, now)?;
            debug!(entity = %entity, count = sequence_numbers.len(), "Messages sent");
            Ok(sequence_numbers)
        })
    }

    /// Send messages that become visible at `enqueue_at`
    pub(crate) fn schedule(
        &self,
        entity: &EntityName,
        messages: Vec<Message>,
        enqueue_at: Timestamp,
    ) -> Result<Vec<i64>, BusError> {
        let messages = messages
            .into_iter()
            .map(|mut m| {
                m.scheduled_enqueue_time = Some(enqueue_at);
                m
            })
            .collect();
        self.send(entity, messages)
    }

    /// Cancel scheduled messages by the sequence numbers `schedule` returned
    pub(crate) fn cancel_scheduled(&self, entity: &EntityName, sequence_numbers: &[i64]) -> Result<(), BusError> {
        self.mutate(|state, _, _| {
            for &seq in sequence_numbers {
                let cancelled = if let Some(queue) = state.queues.get_mut(entity) {
                    queue.store.cancel_scheduled(seq)
                } else {
                    let topic = state.topic_mut(entity)?;
                    topic
                        .subscriptions
                        .values_mut()
                        .fold(false, |any, s| s.store.cancel_scheduled(seq) || any)
                };
                if !cancelled {
                    return Err(BusError::MessageNotFound {
                        entity: entity.to_string(),
                        sequence_number: seq,
                    });
                }
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Receiving and settlement
    // ------------------------------------------------------------------------

    pub(crate) fn receive(
        &self,
        path: &EntityPath,
        sub_queue: SubQueue,
        max: usize,
        mode: ReceiveMode,
        session: Option<(&SessionId, LockToken)>,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.mutate(|state, _, now| {
            state
                .store_mut(path, sub_queue)?
                .receive(max, mode, session, now)
        })
    }

    pub(crate) fn receive_deferred(
        &self,
        path: &EntityPath,
        sub_queue: SubQueue,
        sequence_numbers: &[i64],
        mode: ReceiveMode,
        session: Option<(&SessionId, LockToken)>,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.mutate(|state, _, now| {
            state
                .store_mut(path, sub_queue)?
                .receive_deferred(sequence_numbers, mode, session, now)
        })
    }

    pub(crate) fn peek(
        &self,
        path: &EntityPath,
        sub_queue: SubQueue,
        from_sequence: i64,
        max: usize,
        session_id: Option<&SessionId>,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.mutate(|state, _, now| {
            Ok(state
                .store_mut(path, sub_queue)?
                .peek(from_sequence, max, session_id, now))
        })
    }

    pub(crate) fn settle(
        &self,
        path: &EntityPath,
        sub_queue: SubQueue,
        token: LockToken,
        session: Option<(&SessionId, LockToken)>,
        settlement: Settlement,
    ) -> Result<Option<Timestamp>, BusError> {
        self.mutate(|state, _, now| {
            let store = state.store_mut(path, sub_queue)?;
            if let Some((session_id, session_token)) = session {
                store.check_session(session_id, session_token, now)?;
                if store.lock_session(token, now)?.as_ref() != Some(session_id) {
                    return Err(BusError::MessageLockLost {
                        lock_token: token.to_string(),
                    });
                }
            }
            match settlement {
                Settlement::Complete => store.complete(token, now).map(|_| None),
                Settlement::Abandon(properties) => store.abandon(token, properties, now).map(|_| None),
                Settlement::Defer(properties) => store.defer(token, properties, now).map(|_| None),
                Settlement::DeadLetter {
                    reason,
                    description,
                    properties,
                } => store
                    .dead_letter(token, &reason, description, properties, now)
                    .map(|_| None),
                Settlement::RenewLock => store.renew_lock(token, now).map(Some),
            }
        })
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    pub(crate) fn accept_session(&self, path: &EntityPath, session_id: &SessionId) -> Result<SessionLease, BusError> {
        self.mutate(|state, _, now| {
            state
                .store_mut(path, SubQueue::None)?
                .accept_session(session_id, now)
        })
    }

    pub(crate) fn accept_next_session(&self, path: &EntityPath) -> Result<Option<SessionLease>, BusError> {
        self.mutate(|state, _, now| {
            state
                .store_mut(path, SubQueue::None)?
                .accept_next_session(now)
        })
    }

    pub(crate) fn renew_session(
        &self,
        path: &EntityPath,
        session_id: &SessionId,
        token: LockToken,
    ) -> Result<Timestamp, BusError> {
        self.mutate(|state, _, now| {
            state
                .store_mut(path, SubQueue::None)?
                .renew_session(session_id, token, now)
        })
    }

    pub(crate) fn release_session(&self, path: &EntityPath, session_id: &SessionId, token: LockToken) {
        let result = self.mutate(|state, _, now| {
            state
                .store_mut(path, SubQueue::None)?
                .release_session(session_id, token, now);
            Ok(())
        });
        if let Err(e) = result {
            debug!(entity = %path, session_id = %session_id, error = %e, "Session release skipped");
        }
    }

    pub(crate) fn session_state(
        &self,
        path: &EntityPath,
        session_id: &SessionId,
        token: LockToken,
    ) -> Result<Option<Bytes>, BusError> {
        self.mutate(|state, _, now| {
            state
                .store_mut(path, SubQueue::None)?
                .session_state(session_id, token, now)
        })
    }

    pub(crate) fn set_session_state(
        &self,
        path: &EntityPath,
        session_id: &SessionId,
        token: LockToken,
        session_state: Option<Bytes>,
    ) -> Result<(), BusError> {
        self.mutate(|state, _, now| {
            state
                .store_mut(path, SubQueue::None)?
                .set_session_state(session_id, token, session_state, now)
        })
    }
}

/// How a locked message is settled
#[derive(Debug, Clone)]
pub(crate) enum Settlement {
    Complete,
    Abandon(HashMap<String, PropertyValue>),
    Defer(HashMap<String, PropertyValue>),
    DeadLetter {
        reason: String,
        description: Option<String>,
        properties: HashMap<String, PropertyValue>,
    },
    RenewLock,
}

/// A batch is rejected as a whole when the target cannot hold it
fn check_capacity(state: &mut State, entity: &EntityName, count: usize) -> Result<(), BusError> {
    if let Some(queue) = state.queues.get(entity) {
        if queue.properties.forward_to.is_none()
            && queue.store.len() + count > queue.properties.max_size_in_messages
        {
            return Err(BusError::QuotaExceeded {
                entity: entity.to_string(),
                max_size: queue.properties.max_size_in_messages,
            });
        }
        return Ok(());
    }

    let topic = state.topic_mut(entity)?;
    let max_size = topic.properties.max_size_in_messages;
    if topic
        .subscriptions
        .values()
        .any(|s| s.store.len() + count > max_size)
    {
        return Err(BusError::QuotaExceeded {
            entity: entity.to_string(),
            max_size,
        });
    }
    Ok(())
}
