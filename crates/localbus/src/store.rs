//! Per-entity message storage.
//!
//! Every queue and every subscription owns one [`EntityStore`]. The store keeps
//! messages in sequence order and implements the delivery state machine:
//!
//! - scheduled messages wait until their enqueue time, then become active
//! - active messages are delivered in sequence order; peek-lock deliveries are
//!   locked until settled or until the lock expires
//! - deferred messages are only reachable by sequence number
//! - dead-lettered messages move to a nested store that has no dead-letter
//!   queue of its own
//!
//! All operations take the current time explicitly. The store never blocks and
//! never spawns; waiting for messages is the namespace's job.

use crate::entity::{EntityRuntimeInfo, QueueProperties, SubscriptionProperties};
use crate::error::BusError;
use crate::message::{
    LockToken, Message, MessageId, MessageState, PropertyValue, ReceiveMode, ReceivedMessage,
    SessionId, Timestamp, DEAD_LETTER_MAX_DELIVERY_COUNT, DEAD_LETTER_TTL_EXPIRED,
};
use bytes::Bytes;
use chrono::Duration;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

/// Application property holding the dead-letter reason
pub const DEAD_LETTER_REASON_PROPERTY: &str = "DeadLetterReason";

/// Application property holding the dead-letter description
pub const DEAD_LETTER_DESCRIPTION_PROPERTY: &str = "DeadLetterErrorDescription";

// ============================================================================
// Settings
// ============================================================================

/// Delivery behaviour of a store, derived from the entity's properties
#[derive(Debug, Clone)]
pub(crate) struct StoreSettings {
    /// Entity path used in errors and logs
    pub entity: String,
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    pub default_ttl: Option<Duration>,
    pub requires_session: bool,
    pub dead_letter_on_expiration: bool,
    pub max_size: usize,
}

impl StoreSettings {
    pub fn for_queue(entity: impl Into<String>, props: &QueueProperties) -> Self {
        Self {
            entity: entity.into(),
            lock_duration: props.lock_duration,
            max_delivery_count: props.max_delivery_count,
            default_ttl: props.default_message_time_to_live,
            requires_session: props.requires_session,
            dead_letter_on_expiration: props.dead_lettering_on_message_expiration,
            max_size: props.max_size_in_messages,
        }
    }

    /// Subscriptions share the capacity limit of their topic
    pub fn for_subscription(
        entity: impl Into<String>,
        props: &SubscriptionProperties,
        max_size: usize,
    ) -> Self {
        Self {
            entity: entity.into(),
            lock_duration: props.lock_duration,
            max_delivery_count: props.max_delivery_count,
            default_ttl: props.default_message_time_to_live,
            requires_session: props.requires_session,
            dead_letter_on_expiration: props.dead_lettering_on_message_expiration,
            max_size,
        }
    }

    /// The dead-letter sub-queue keeps messages until they are received
    fn dead_letter_of(parent: &StoreSettings) -> Self {
        Self {
            entity: format!("{}/$DeadLetterQueue", parent.entity),
            lock_duration: parent.lock_duration,
            max_delivery_count: u32::MAX,
            default_ttl: None,
            requires_session: false,
            dead_letter_on_expiration: false,
            max_size: usize::MAX,
        }
    }
}

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Lock {
    token: LockToken,
    until: Timestamp,
    /// Held under a session lock; renewed with the session
    session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Active,
    Deferred,
    Scheduled(Timestamp),
}

#[derive(Debug, Clone)]
struct DeadLetterInfo {
    reason: String,
    description: Option<String>,
    source: String,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    message_id: MessageId,
    sequence_number: i64,
    enqueued_at: Timestamp,
    ttl: Option<Duration>,
    expires_at: Option<Timestamp>,
    delivery_count: u32,
    slot: Slot,
    lock: Option<Lock>,
    dead_letter: Option<DeadLetterInfo>,
    hops: u8,
}

impl Entry {
    fn is_available(&self) -> bool {
        self.slot == Slot::Active && self.lock.is_none()
    }

    fn in_session(&self, session_id: Option<&SessionId>) -> bool {
        match session_id {
            Some(id) => self.message.session_id.as_ref() == Some(id),
            None => true,
        }
    }

    fn to_received(&self) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id.clone(),
            message: self.message.clone(),
            sequence_number: self.sequence_number,
            enqueued_at: self.enqueued_at,
            expires_at: self.expires_at,
            delivery_count: self.delivery_count,
            lock_token: None,
            locked_until: self.lock.map(|l| l.until),
            state: match self.slot {
                Slot::Active => MessageState::Active,
                Slot::Deferred => MessageState::Deferred,
                Slot::Scheduled(_) => MessageState::Scheduled,
            },
            dead_letter_reason: self.dead_letter.as_ref().map(|d| d.reason.clone()),
            dead_letter_error_description: self
                .dead_letter
                .as_ref()
                .and_then(|d| d.description.clone()),
            dead_letter_source: self.dead_letter.as_ref().map(|d| d.source.clone()),
        }
    }
}

/// A message leaving a store for another entity (auto-forwarding)
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    pub message: Message,
    pub hops: u8,
}

/// A session lock granted to one receiver
#[derive(Debug, Clone)]
pub(crate) struct SessionLease {
    pub session_id: SessionId,
    pub token: LockToken,
    pub locked_until: Timestamp,
}

#[derive(Debug, Clone, Default)]
struct SessionEntry {
    owner: Option<LockToken>,
    locked_until: Option<Timestamp>,
    state: Option<Bytes>,
}

impl SessionEntry {
    fn is_locked(&self, now: Timestamp) -> bool {
        self.owner.is_some() && self.locked_until.is_some_and(|until| until > now)
    }
}

// ============================================================================
// EntityStore
// ============================================================================

/// Messages of one queue or subscription, plus its dead-letter sub-queue
#[derive(Debug, Clone)]
pub(crate) struct EntityStore {
    settings: StoreSettings,
    entries: BTreeMap<i64, Entry>,
    locks: HashMap<LockToken, i64>,
    sessions: HashMap<SessionId, SessionEntry>,
    next_sequence: i64,
    dead_letter: Option<Box<EntityStore>>,
}

impl EntityStore {
    pub fn new(settings: StoreSettings) -> Self {
        let dead_letter = EntityStore::without_dead_letter(StoreSettings::dead_letter_of(&settings));
        Self {
            dead_letter: Some(Box::new(dead_letter)),
            ..Self::without_dead_letter(settings)
        }
    }

    fn without_dead_letter(settings: StoreSettings) -> Self {
        Self {
            settings,
            entries: BTreeMap::new(),
            locks: HashMap::new(),
            sessions: HashMap::new(),
            next_sequence: 1,
            dead_letter: None,
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Apply new entity properties; stored messages keep their expiry
    pub fn update_settings(&mut self, settings: StoreSettings) {
        if let Some(dlq) = self.dead_letter.as_mut() {
            dlq.settings = StoreSettings::dead_letter_of(&settings);
        }
        self.settings = settings;
    }

    /// The dead-letter sub-queue
    pub fn dead_letter_store(&mut self) -> Result<&mut EntityStore, BusError> {
        let entity = self.settings.entity.clone();
        self.dead_letter
            .as_deref_mut()
            .ok_or_else(|| BusError::InvalidOperation {
                message: format!("{} has no dead-letter sub-queue", entity),
            })
    }

    /// Number of stored messages, dead-lettered ones excluded
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Sequence number the next enqueue would receive
    pub fn next_sequence_number(&mut self) -> i64 {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        sequence_number
    }

    // ------------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------------

    /// Store a message. A `scheduled_enqueue_time` in the future parks it as
    /// scheduled; TTL is the shorter of the message's and the entity default.
    pub fn enqueue(
        &mut self,
        message: Message,
        sequence_number: Option<i64>,
        hops: u8,
        now: Timestamp,
    ) -> Result<i64, BusError> {
        if self.entries.len() >= self.settings.max_size {
            return Err(BusError::QuotaExceeded {
                entity: self.settings.entity.clone(),
                max_size: self.settings.max_size,
            });
        }

        if self.settings.requires_session && message.session_id.is_none() {
            return Err(BusError::InvalidOperation {
                message: format!(
                    "{} requires sessions; message has no session id",
                    self.settings.entity
                ),
            });
        }

        let sequence_number = match sequence_number {
            Some(seq) => {
                self.next_sequence = self.next_sequence.max(seq + 1);
                seq
            }
            None => self.next_sequence_number(),
        };

        let ttl = match (message.time_to_live, self.settings.default_ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let message_id = message.message_id.clone().unwrap_or_default();
        let (slot, enqueued_at, expires_at) = match message.scheduled_enqueue_time {
            Some(at) if at > now => (Slot::Scheduled(at), at, None),
            _ => (Slot::Active, now, ttl.map(|ttl| now.after(ttl))),
        };

        debug!(
            entity = %self.settings.entity,
            sequence_number,
            message_id = %message_id,
            scheduled = matches!(slot, Slot::Scheduled(_)),
            "Message enqueued"
        );

        self.entries.insert(
            sequence_number,
            Entry {
                message,
                message_id,
                sequence_number,
                enqueued_at,
                ttl,
                expires_at,
                delivery_count: 0,
                slot,
                lock: None,
                dead_letter: None,
                hops,
            },
        );

        Ok(sequence_number)
    }

    /// Dead-letter a message that never became part of this store
    pub fn dead_letter_new(
        &mut self,
        message: Message,
        sequence_number: Option<i64>,
        hops: u8,
        reason: &str,
        description: Option<String>,
        now: Timestamp,
    ) -> Result<(), BusError> {
        let sequence_number = match sequence_number {
            Some(seq) => seq,
            None => self.next_sequence_number(),
        };
        let entry = Entry {
            message_id: message.message_id.clone().unwrap_or_default(),
            message,
            sequence_number,
            enqueued_at: now,
            ttl: None,
            expires_at: None,
            delivery_count: 0,
            slot: Slot::Active,
            lock: None,
            dead_letter: None,
            hops,
        };
        self.move_to_dead_letter(entry, reason, description);
        Ok(())
    }

    fn move_to_dead_letter(&mut self, mut entry: Entry, reason: &str, description: Option<String>) {
        let source = self.settings.entity.clone();
        let Some(dlq) = self.dead_letter.as_mut() else {
            warn!(
                entity = %source,
                sequence_number = entry.sequence_number,
                reason,
                "Dead-letter sub-queue cannot dead-letter; message dropped"
            );
            return;
        };

        info!(
            entity = %source,
            sequence_number = entry.sequence_number,
            reason,
            "Message dead-lettered"
        );

        entry
            .message
            .application_properties
            .insert(DEAD_LETTER_REASON_PROPERTY.to_string(), reason.into());
        if let Some(description) = &description {
            entry.message.application_properties.insert(
                DEAD_LETTER_DESCRIPTION_PROPERTY.to_string(),
                PropertyValue::String(description.clone()),
            );
        }

        entry.slot = Slot::Active;
        entry.lock = None;
        entry.expires_at = None;
        entry.ttl = None;
        entry.dead_letter = Some(DeadLetterInfo {
            reason: reason.to_string(),
            description,
            source,
        });

        dlq.next_sequence = dlq.next_sequence.max(entry.sequence_number + 1);
        dlq.entries.insert(entry.sequence_number, entry);
    }

    /// Copies of the dead-lettered messages that may be forwarded elsewhere,
    /// keyed by sequence number: unlocked ones that have travelled fewer than
    /// `max_hops` hops. They stay in the sub-queue until
    /// [`remove_dead_letter`](Self::remove_dead_letter) is called.
    pub fn forwardable_dead_letters(&self, max_hops: u8) -> Vec<(i64, Outbound)> {
        let Some(dlq) = self.dead_letter.as_deref() else {
            return Vec::new();
        };
        dlq.entries
            .values()
            .filter(|e| e.lock.is_none() && e.hops < max_hops)
            .map(|entry| {
                let mut message = entry.message.clone();
                message.message_id = Some(entry.message_id.clone());
                message.scheduled_enqueue_time = None;
                let outbound = Outbound {
                    message,
                    hops: entry.hops,
                };
                (entry.sequence_number, outbound)
            })
            .collect()
    }

    /// Drop a dead-lettered message once it was forwarded
    pub fn remove_dead_letter(&mut self, sequence_number: i64) -> bool {
        self.dead_letter
            .as_mut()
            .is_some_and(|dlq| dlq.entries.remove(&sequence_number).is_some())
    }

    // ------------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------------

    /// Reclaim expired locks, promote due scheduled messages and expire
    /// messages whose time to live has elapsed
    pub fn housekeep(&mut self, now: Timestamp) {
        for session in self.sessions.values_mut() {
            if session.owner.is_some() && !session.is_locked(now) {
                session.owner = None;
                session.locked_until = None;
            }
        }

        let expired_locks: Vec<i64> = self
            .entries
            .values()
            .filter(|e| e.lock.is_some_and(|l| l.until <= now))
            .map(|e| e.sequence_number)
            .collect();
        for seq in expired_locks {
            debug!(entity = %self.settings.entity, sequence_number = seq, "Message lock expired");
            self.release_lock(seq);
        }

        for entry in self.entries.values_mut() {
            if let Slot::Scheduled(at) = entry.slot {
                if at <= now {
                    entry.slot = Slot::Active;
                    entry.enqueued_at = at;
                    entry.expires_at = entry.ttl.map(|ttl| at.after(ttl));
                }
            }
        }

        let expired: Vec<i64> = self
            .entries
            .values()
            .filter(|e| e.lock.is_none() && !matches!(e.slot, Slot::Scheduled(_)))
            .filter(|e| e.expires_at.is_some_and(|at| at <= now))
            .map(|e| e.sequence_number)
            .collect();
        for seq in expired {
            if let Some(entry) = self.entries.remove(&seq) {
                if self.settings.dead_letter_on_expiration {
                    self.move_to_dead_letter(
                        entry,
                        DEAD_LETTER_TTL_EXPIRED,
                        Some("The message expired and was dead lettered.".to_string()),
                    );
                } else {
                    debug!(entity = %self.settings.entity, sequence_number = seq, "Message expired");
                }
            }
        }

        if let Some(dlq) = self.dead_letter.as_mut() {
            dlq.housekeep(now);
        }
    }

    /// Drop a message's lock and, for an active message, return it to the
    /// available set, dead-lettering it once its delivery count is exhausted
    fn release_lock(&mut self, seq: i64) {
        let Some(entry) = self.entries.get_mut(&seq) else {
            return;
        };
        if let Some(lock) = entry.lock.take() {
            self.locks.remove(&lock.token);
        }
        if entry.slot == Slot::Active && entry.delivery_count >= self.settings.max_delivery_count {
            if let Some(entry) = self.entries.remove(&seq) {
                let description = format!(
                    "Message could not be consumed after {} delivery attempts.",
                    entry.delivery_count
                );
                self.move_to_dead_letter(entry, DEAD_LETTER_MAX_DELIVERY_COUNT, Some(description));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------------

    /// Deliver up to `max` available messages in sequence order. With a session
    /// the caller must hold its lock; without one the entity must not require
    /// sessions.
    pub fn receive(
        &mut self,
        max: usize,
        mode: ReceiveMode,
        session: Option<(&SessionId, LockToken)>,
        now: Timestamp,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.housekeep(now);

        let session_until = match session {
            Some((id, token)) => Some(self.check_session(id, token, now)?),
            None if self.settings.requires_session => {
                return Err(BusError::InvalidOperation {
                    message: format!(
                        "{} requires sessions; accept a session to receive",
                        self.settings.entity
                    ),
                })
            }
            None => None,
        };
        let session_id = session.map(|(id, _)| id);

        let selected: Vec<i64> = self
            .entries
            .values()
            .filter(|e| e.is_available() && e.in_session(session_id))
            .take(max)
            .map(|e| e.sequence_number)
            .collect();

        Ok(selected
            .into_iter()
            .filter_map(|seq| self.deliver(seq, mode, session_until, now))
            .collect())
    }

    fn deliver(
        &mut self,
        seq: i64,
        mode: ReceiveMode,
        session_until: Option<Timestamp>,
        now: Timestamp,
    ) -> Option<ReceivedMessage> {
        match mode {
            ReceiveMode::ReceiveAndDelete => {
                let mut entry = self.entries.remove(&seq)?;
                entry.delivery_count += 1;
                Some(entry.to_received())
            }
            ReceiveMode::PeekLock => {
                let lock_duration = self.settings.lock_duration;
                let entry = self.entries.get_mut(&seq)?;
                let lock = Lock {
                    token: LockToken::new(),
                    until: session_until.unwrap_or_else(|| now.after(lock_duration)),
                    session: session_until.is_some(),
                };
                entry.delivery_count += 1;
                entry.lock = Some(lock);
                self.locks.insert(lock.token, seq);

                let mut received = entry.to_received();
                received.lock_token = Some(lock.token);
                Some(received)
            }
        }
    }

    /// Receive deferred messages by sequence number
    pub fn receive_deferred(
        &mut self,
        sequence_numbers: &[i64],
        mode: ReceiveMode,
        session: Option<(&SessionId, LockToken)>,
        now: Timestamp,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.housekeep(now);

        let session_until = match session {
            Some((id, token)) => Some(self.check_session(id, token, now)?),
            None => None,
        };
        let session_id = session.map(|(id, _)| id);

        for seq in sequence_numbers {
            let found = self.entries.get(seq).is_some_and(|e| {
                e.slot == Slot::Deferred && e.lock.is_none() && e.in_session(session_id)
            });
            if !found {
                return Err(BusError::MessageNotFound {
                    entity: self.settings.entity.clone(),
                    sequence_number: *seq,
                });
            }
        }

        Ok(sequence_numbers
            .iter()
            .filter_map(|seq| self.deliver(*seq, mode, session_until, now))
            .collect())
    }

    /// Browse messages without locking them
    pub fn peek(
        &mut self,
        from_sequence: i64,
        max: usize,
        session_id: Option<&SessionId>,
        now: Timestamp,
    ) -> Vec<ReceivedMessage> {
        self.housekeep(now);
        self.entries
            .range(from_sequence..)
            .map(|(_, e)| e)
            .filter(|e| e.in_session(session_id))
            .take(max)
            .map(Entry::to_received)
            .collect()
    }

    // ------------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------------

    fn locked_entry(&mut self, token: LockToken, now: Timestamp) -> Result<i64, BusError> {
        self.housekeep(now);
        let seq = self
            .locks
            .get(&token)
            .copied()
            .ok_or_else(|| BusError::MessageLockLost {
                lock_token: token.to_string(),
            })?;
        Ok(seq)
    }

    /// Session id of the locked message, when it is held under a session lock
    pub fn lock_session(&mut self, token: LockToken, now: Timestamp) -> Result<Option<SessionId>, BusError> {
        let seq = self.locked_entry(token, now)?;
        Ok(self
            .entries
            .get(&seq)
            .filter(|e| e.lock.is_some_and(|l| l.session))
            .and_then(|e| e.message.session_id.clone()))
    }

    /// Remove a locked message
    pub fn complete(&mut self, token: LockToken, now: Timestamp) -> Result<(), BusError> {
        let seq = self.locked_entry(token, now)?;
        self.locks.remove(&token);
        self.entries.remove(&seq);
        debug!(entity = %self.settings.entity, sequence_number = seq, "Message completed");
        Ok(())
    }

    /// Unlock a message so it can be delivered again
    pub fn abandon(
        &mut self,
        token: LockToken,
        properties: HashMap<String, PropertyValue>,
        now: Timestamp,
    ) -> Result<(), BusError> {
        let seq = self.locked_entry(token, now)?;
        if let Some(entry) = self.entries.get_mut(&seq) {
            entry.message.application_properties.extend(properties);
        }
        self.release_lock(seq);
        debug!(entity = %self.settings.entity, sequence_number = seq, "Message abandoned");
        Ok(())
    }

    /// Set a message aside; it can then only be received by sequence number
    pub fn defer(
        &mut self,
        token: LockToken,
        properties: HashMap<String, PropertyValue>,
        now: Timestamp,
    ) -> Result<(), BusError> {
        let seq = self.locked_entry(token, now)?;
        self.locks.remove(&token);
        if let Some(entry) = self.entries.get_mut(&seq) {
            entry.message.application_properties.extend(properties);
            entry.lock = None;
            entry.slot = Slot::Deferred;
        }
        debug!(entity = %self.settings.entity, sequence_number = seq, "Message deferred");
        Ok(())
    }

    /// Move a locked message to the dead-letter sub-queue
    pub fn dead_letter(
        &mut self,
        token: LockToken,
        reason: &str,
        description: Option<String>,
        properties: HashMap<String, PropertyValue>,
        now: Timestamp,
    ) -> Result<(), BusError> {
        if self.dead_letter.is_none() {
            return Err(BusError::InvalidOperation {
                message: format!("cannot dead-letter a message in {}", self.settings.entity),
            });
        }
        let seq = self.locked_entry(token, now)?;
        self.locks.remove(&token);
        if let Some(mut entry) = self.entries.remove(&seq) {
            entry.message.application_properties.extend(properties);
            self.move_to_dead_letter(entry, reason, description);
        }
        Ok(())
    }

    /// Extend a message lock by the entity's lock duration
    pub fn renew_lock(&mut self, token: LockToken, now: Timestamp) -> Result<Timestamp, BusError> {
        let seq = self.locked_entry(token, now)?;
        let lock_duration = self.settings.lock_duration;
        let entry = self
            .entries
            .get_mut(&seq)
            .ok_or_else(|| BusError::MessageLockLost {
                lock_token: token.to_string(),
            })?;
        let lock = entry.lock.as_mut().ok_or_else(|| BusError::MessageLockLost {
            lock_token: token.to_string(),
        })?;
        if lock.session {
            return Err(BusError::InvalidOperation {
                message: "session message locks are renewed with the session lock".to_string(),
            });
        }
        lock.until = now.after(lock_duration);
        Ok(lock.until)
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Remove a scheduled message; false when no scheduled message has that number
    pub fn cancel_scheduled(&mut self, sequence_number: i64) -> bool {
        let scheduled = self
            .entries
            .get(&sequence_number)
            .is_some_and(|e| matches!(e.slot, Slot::Scheduled(_)));
        if scheduled {
            self.entries.remove(&sequence_number);
            debug!(entity = %self.settings.entity, sequence_number, "Scheduled message cancelled");
        }
        scheduled
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    fn require_sessions(&self) -> Result<(), BusError> {
        if !self.settings.requires_session {
            return Err(BusError::InvalidOperation {
                message: format!("{} is not session-enabled", self.settings.entity),
            });
        }
        Ok(())
    }

    /// Lock a specific session for exclusive receive
    pub fn accept_session(
        &mut self,
        session_id: &SessionId,
        now: Timestamp,
    ) -> Result<SessionLease, BusError> {
        self.require_sessions()?;
        self.housekeep(now);

        let lock_duration = self.settings.lock_duration;
        let session = self.sessions.entry(session_id.clone()).or_default();
        if session.is_locked(now) {
            return Err(BusError::SessionCannotBeLocked {
                session_id: session_id.to_string(),
                locked_until: session.locked_until.unwrap_or(now),
            });
        }

        let token = LockToken::new();
        let locked_until = now.after(lock_duration);
        session.owner = Some(token);
        session.locked_until = Some(locked_until);

        info!(entity = %self.settings.entity, session_id = %session_id, "Session accepted");
        Ok(SessionLease {
            session_id: session_id.clone(),
            token,
            locked_until,
        })
    }

    /// Lock the unlocked session holding the lowest-sequence available message
    pub fn accept_next_session(&mut self, now: Timestamp) -> Result<Option<SessionLease>, BusError> {
        self.require_sessions()?;
        self.housekeep(now);

        let candidate = self
            .entries
            .values()
            .filter(|e| e.is_available())
            .filter_map(|e| e.message.session_id.as_ref())
            .find(|id| !self.sessions.get(*id).is_some_and(|s| s.is_locked(now)))
            .cloned();

        match candidate {
            Some(session_id) => self.accept_session(&session_id, now).map(Some),
            None => Ok(None),
        }
    }

    /// Verify the caller still owns the session; returns the lock expiry
    pub fn check_session(
        &self,
        session_id: &SessionId,
        token: LockToken,
        now: Timestamp,
    ) -> Result<Timestamp, BusError> {
        match self.sessions.get(session_id) {
            Some(session) if session.owner == Some(token) && session.is_locked(now) => {
                Ok(session.locked_until.unwrap_or(now))
            }
            _ => Err(BusError::SessionLockLost {
                session_id: session_id.to_string(),
            }),
        }
    }

    /// Extend the session lock and the locks of its in-flight messages
    pub fn renew_session(
        &mut self,
        session_id: &SessionId,
        token: LockToken,
        now: Timestamp,
    ) -> Result<Timestamp, BusError> {
        self.housekeep(now);
        self.check_session(session_id, token, now)?;

        let locked_until = now.after(self.settings.lock_duration);
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.locked_until = Some(locked_until);
        }
        for entry in self.entries.values_mut() {
            if entry.message.session_id.as_ref() == Some(session_id) {
                if let Some(lock) = entry.lock.as_mut().filter(|l| l.session) {
                    lock.until = locked_until;
                }
            }
        }
        Ok(locked_until)
    }

    /// Give up a session lock; unsettled messages become available again
    pub fn release_session(&mut self, session_id: &SessionId, token: LockToken, now: Timestamp) {
        if self.check_session(session_id, token, now).is_err() {
            return;
        }
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.owner = None;
            session.locked_until = None;
        }

        let held: Vec<i64> = self
            .entries
            .values()
            .filter(|e| e.message.session_id.as_ref() == Some(session_id))
            .filter(|e| e.lock.is_some_and(|l| l.session))
            .map(|e| e.sequence_number)
            .collect();
        for seq in held {
            self.release_lock(seq);
        }
        self.sessions.retain(|_, s| s.owner.is_some() || s.state.is_some());

        info!(entity = %self.settings.entity, session_id = %session_id, "Session released");
    }

    pub fn session_state(
        &self,
        session_id: &SessionId,
        token: LockToken,
        now: Timestamp,
    ) -> Result<Option<Bytes>, BusError> {
        self.check_session(session_id, token, now)?;
        Ok(self
            .sessions
            .get(session_id)
            .and_then(|s| s.state.clone()))
    }

    pub fn set_session_state(
        &mut self,
        session_id: &SessionId,
        token: LockToken,
        state: Option<Bytes>,
        now: Timestamp,
    ) -> Result<(), BusError> {
        self.check_session(session_id, token, now)?;
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.state = state;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Runtime information
    // ------------------------------------------------------------------------

    pub fn runtime_info(&mut self, now: Timestamp) -> EntityRuntimeInfo {
        self.housekeep(now);
        let mut info = EntityRuntimeInfo::default();
        for entry in self.entries.values() {
            match (entry.slot, entry.lock) {
                (Slot::Active, None) => info.active_message_count += 1,
                (Slot::Active, Some(_)) => info.locked_message_count += 1,
                (Slot::Deferred, _) => info.deferred_message_count += 1,
                (Slot::Scheduled(_), _) => info.scheduled_message_count += 1,
            }
        }
        info.dead_letter_message_count = self.dead_letter.as_ref().map_or(0, |d| d.entries.len());
        info
    }
}

// ============================================================================
// Duplicate detection
// ============================================================================

/// Message ids seen within the duplicate detection window
#[derive(Debug, Clone)]
pub(crate) struct DuplicateLog {
    window: Duration,
    seen: HashMap<MessageId, Timestamp>,
    order: VecDeque<(Timestamp, MessageId)>,
}

impl DuplicateLog {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// True when `id` was recorded within the window. Does not record it.
    pub fn is_duplicate(&mut self, id: &MessageId, now: Timestamp) -> bool {
        self.prune(now);
        self.seen.contains_key(id)
    }

    /// Remember `id` as accepted at `now`
    pub fn record(&mut self, id: &MessageId, now: Timestamp) {
        self.seen.insert(id.clone(), now);
        self.order.push_back((now, id.clone()));
    }

    fn prune(&mut self, now: Timestamp) {
        let horizon = now.after(-self.window);
        while let Some((at, _)) = self.order.front() {
            if *at > horizon {
                break;
            }
            if let Some((at, id)) = self.order.pop_front() {
                if self.seen.get(&id) == Some(&at) {
                    self.seen.remove(&id);
                }
            }
        }
    }
}
