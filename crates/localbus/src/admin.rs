//! Administration client: entity and authorization rule management.
//!
//! Every call requires the Manage right at namespace scope. A connection
//! string scoped to one entity cannot build an administration client.

use crate::auth::{AccessRight, AuthorizationRule, ConnectionProperties};
use crate::entity::{
    EntityRuntimeInfo, QueueProperties, RuleProperties, SubscriptionProperties, TopicProperties,
    TopicRuntimeInfo,
};
use crate::error::BusError;
use crate::message::EntityName;
use crate::namespace::Namespace;
use std::sync::Arc;
use tracing::info;

#[cfg(test)]
#[path = "admin_tests.rs"]
mod tests;

/// Manages the queues, topics, subscriptions, rules and keys of a namespace
#[derive(Debug, Clone)]
pub struct AdministrationClient {
    namespace: Namespace,
    credentials: Arc<ConnectionProperties>,
}

impl AdministrationClient {
    pub fn new(namespace: &Namespace, connection_string: &str) -> Result<Self, BusError> {
        let credentials: ConnectionProperties = connection_string.parse()?;
        namespace.authorize(&credentials, AccessRight::Manage, None)?;
        info!(namespace = %namespace.name(), key_name = %credentials.shared_access_key_name, "Administration client connected");
        Ok(Self {
            namespace: namespace.clone(),
            credentials: Arc::new(credentials),
        })
    }

    fn authorize(&self) -> Result<(), BusError> {
        self.namespace
            .authorize(&self.credentials, AccessRight::Manage, None)
    }

    // ------------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------------

    pub async fn create_queue(&self, name: &str, properties: QueueProperties) -> Result<QueueProperties, BusError> {
        self.authorize()?;
        self.namespace.create_queue(&EntityName::new(name)?, properties)
    }

    pub async fn get_queue(&self, name: &str) -> Result<QueueProperties, BusError> {
        self.authorize()?;
        self.namespace.get_queue(&EntityName::new(name)?)
    }

    /// Replace the queue's settings. `requires_session` cannot change.
    pub async fn update_queue(&self, name: &str, properties: QueueProperties) -> Result<QueueProperties, BusError> {
        self.authorize()?;
        self.namespace.update_queue(&EntityName::new(name)?, properties)
    }

    /// Delete the queue and every message in it
    pub async fn delete_queue(&self, name: &str) -> Result<(), BusError> {
        self.authorize()?;
        self.namespace.delete_queue(&EntityName::new(name)?)
    }

    pub async fn list_queues(&self) -> Result<Vec<EntityName>, BusError> {
        self.authorize()?;
        Ok(self.namespace.list_queues())
    }

    pub async fn queue_exists(&self, name: &str) -> Result<bool, BusError> {
        match self.get_queue(name).await {
            Ok(_) => Ok(true),
            Err(BusError::EntityNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get_queue_runtime_info(&self, name: &str) -> Result<EntityRuntimeInfo, BusError> {
        self.authorize()?;
        self.namespace.queue_runtime_info(&EntityName::new(name)?)
    }

    // ------------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------------

    pub async fn create_topic(&self, name: &str, properties: TopicProperties) -> Result<TopicProperties, BusError> {
        self.authorize()?;
        self.namespace.create_topic(&EntityName::new(name)?, properties)
    }

    pub async fn get_topic(&self, name: &str) -> Result<TopicProperties, BusError> {
        self.authorize()?;
        self.namespace.get_topic(&EntityName::new(name)?)
    }

    pub async fn update_topic(&self, name: &str, properties: TopicProperties) -> Result<TopicProperties, BusError> {
        self.authorize()?;
        self.namespace.update_topic(&EntityName::new(name)?, properties)
    }

    /// Delete the topic with all its subscriptions
    pub async fn delete_topic(&self, name: &str) -> Result<(), BusError> {
        self.authorize()?;
        self.namespace.delete_topic(&EntityName::new(name)?)
    }

    pub async fn list_topics(&self) -> Result<Vec<EntityName>, BusError> {
        self.authorize()?;
        Ok(self.namespace.list_topics())
    }

    pub async fn topic_exists(&self, name: &str) -> Result<bool, BusError> {
        match self.get_topic(name).await {
            Ok(_) => Ok(true),
            Err(BusError::EntityNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get_topic_runtime_info(&self, name: &str) -> Result<TopicRuntimeInfo, BusError> {
        self.authorize()?;
        self.namespace.topic_runtime_info(&EntityName::new(name)?)
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Create a subscription; it starts with the `$Default` rule
    pub async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
        properties: SubscriptionProperties,
    ) -> Result<SubscriptionProperties, BusError> {
        self.authorize()?;
        self.namespace
            .create_subscription(&EntityName::new(topic)?, &EntityName::new(name)?, properties)
    }

    pub async fn get_subscription(&self, topic: &str, name: &str) -> Result<SubscriptionProperties, BusError> {
        self.authorize()?;
        self.namespace
            .get_subscription(&EntityName::new(topic)?, &EntityName::new(name)?)
    }

    pub async fn update_subscription(
        &self,
        topic: &str,
        name: &str,
        properties: SubscriptionProperties,
    ) -> Result<SubscriptionProperties, BusError> {
        self.authorize()?;
        self.namespace
            .update_subscription(&EntityName::new(topic)?, &EntityName::new(name)?, properties)
    }

    pub async fn delete_subscription(&self, topic: &str, name: &str) -> Result<(), BusError> {
        self.authorize()?;
        self.namespace
            .delete_subscription(&EntityName::new(topic)?, &EntityName::new(name)?)
    }

    pub async fn list_subscriptions(&self, topic: &str) -> Result<Vec<EntityName>, BusError> {
        self.authorize()?;
        self.namespace.list_subscriptions(&EntityName::new(topic)?)
    }

    pub async fn get_subscription_runtime_info(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<EntityRuntimeInfo, BusError> {
        self.authorize()?;
        self.namespace
            .subscription_runtime_info(&EntityName::new(topic)?, &EntityName::new(name)?)
    }

    // ------------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------------

    pub async fn create_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: RuleProperties,
    ) -> Result<RuleProperties, BusError> {
        self.authorize()?;
        self.namespace
            .create_rule(&EntityName::new(topic)?, &EntityName::new(subscription)?, rule)
    }

    pub async fn get_rule(&self, topic: &str, subscription: &str, name: &str) -> Result<RuleProperties, BusError> {
        self.authorize()?;
        self.namespace
            .get_rule(&EntityName::new(topic)?, &EntityName::new(subscription)?, name)
    }

    pub async fn delete_rule(&self, topic: &str, subscription: &str, name: &str) -> Result<(), BusError> {
        self.authorize()?;
        self.namespace
            .delete_rule(&EntityName::new(topic)?, &EntityName::new(subscription)?, name)
    }

    /// Rules in name order, the order their actions are applied in
    pub async fn list_rules(&self, topic: &str, subscription: &str) -> Result<Vec<RuleProperties>, BusError> {
        self.authorize()?;
        self.namespace
            .list_rules(&EntityName::new(topic)?, &EntityName::new(subscription)?)
    }

    // ------------------------------------------------------------------------
    // Authorization rules
    // ------------------------------------------------------------------------

    /// Add a rule at namespace scope (`entity` = `None`) or on a queue or topic
    pub async fn create_authorization_rule(
        &self,
        entity: Option<&str>,
        rule: AuthorizationRule,
    ) -> Result<AuthorizationRule, BusError> {
        self.authorize()?;
        let entity = entity.map(EntityName::new).transpose()?;
        self.namespace
            .create_authorization_rule(entity.as_ref(), rule)
    }

    pub async fn list_authorization_rules(&self, entity: Option<&str>) -> Result<Vec<AuthorizationRule>, BusError> {
        self.authorize()?;
        let entity = entity.map(EntityName::new).transpose()?;
        self.namespace.list_authorization_rules(entity.as_ref())
    }

    pub async fn delete_authorization_rule(&self, entity: Option<&str>, key_name: &str) -> Result<(), BusError> {
        self.authorize()?;
        let entity = entity.map(EntityName::new).transpose()?;
        self.namespace
            .delete_authorization_rule(entity.as_ref(), key_name)
    }

    /// Connection string for a rule, scoped to `entity` when given
    pub async fn connection_string(&self, entity: Option<&str>, key_name: &str) -> Result<String, BusError> {
        self.authorize()?;
        let entity = entity.map(EntityName::new).transpose()?;
        self.namespace.connection_string_for(key_name, entity.as_ref())
    }
}
