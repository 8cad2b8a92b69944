//! Declarative description of a namespace's entities.
//!
//! A [`Topology`] lists queues, topics with their subscriptions and rules,
//! and authorization rules. It is stored as YAML, JSON or TOML (chosen by
//! file extension), can be applied to a [`Namespace`] and can be captured
//! from one.
//!
//! ```yaml
//! queues:
//!   orders:
//!     max_delivery_count: 3
//!     forward_dead_lettered_messages_to: poison
//!   poison: {}
//! topics:
//!   events:
//!     subscriptions:
//!       audit: {}
//!       red:
//!         rules:
//!           - name: red-only
//!             filter: { type: sql, expression: "color = 'red'" }
//! ```

use crate::auth::{AuthorizationRule, ROOT_KEY_NAME};
use crate::config::NamespaceConfig;
use crate::entity::{QueueProperties, RuleProperties, SubscriptionProperties, TopicProperties, DEFAULT_RULE_NAME};
use crate::error::{BusError, ConfigurationError, SerializationError};
use crate::message::EntityName;
use crate::namespace::Namespace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

#[cfg(test)]
#[path = "topology_tests.rs"]
mod tests;

/// File format of a topology document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyFormat {
    #[default]
    Yaml,
    Json,
    Toml,
}

impl TopologyFormat {
    /// Format implied by a file's extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigurationError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| ConfigurationError::Invalid {
                message: format!("{} has no file extension", path.display()),
            })?;
        extension.parse()
    }
}

impl FromStr for TopologyFormat {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            "toml" => Ok(Self::Toml),
            other => Err(ConfigurationError::Invalid {
                message: format!("unsupported topology format '{}'", other),
            }),
        }
    }
}

impl fmt::Display for TopologyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Toml => "toml",
        };
        f.write_str(name)
    }
}

/// A queue and the authorization rules defined on it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueDefinition {
    #[serde(flatten)]
    pub properties: QueueProperties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorization_rules: Vec<AuthorizationRule>,
}

/// A topic with its subscriptions and authorization rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicDefinition {
    #[serde(flatten)]
    pub properties: TopicProperties,
    #[serde(default)]
    pub subscriptions: BTreeMap<EntityName, SubscriptionDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorization_rules: Vec<AuthorizationRule>,
}

/// A subscription with its rules. Omitted rules mean the `$Default` rule;
/// a listed set, even an empty one, replaces it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDefinition {
    #[serde(flatten)]
    pub properties: SubscriptionProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<RuleProperties>>,
}

/// Entities and authorization rules of a namespace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    /// Namespace-scope rules. A rule named `RootManageSharedAccessKey`
    /// replaces the generated root keys.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authorization_rules: Vec<AuthorizationRule>,
    pub queues: BTreeMap<EntityName, QueueDefinition>,
    pub topics: BTreeMap<EntityName, TopicDefinition>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str, format: TopologyFormat) -> Result<Self, BusError> {
        let topology = match format {
            TopologyFormat::Yaml => serde_yaml::from_str(text).map_err(SerializationError::from)?,
            TopologyFormat::Json => serde_json::from_str(text).map_err(SerializationError::from)?,
            TopologyFormat::Toml => toml::from_str(text).map_err(SerializationError::from)?,
        };
        Ok(topology)
    }

    pub fn render(&self, format: TopologyFormat) -> Result<String, BusError> {
        let text = match format {
            TopologyFormat::Yaml => serde_yaml::to_string(self).map_err(SerializationError::from)?,
            TopologyFormat::Json => serde_json::to_string_pretty(self).map_err(SerializationError::from)?,
            TopologyFormat::Toml => toml::to_string_pretty(self).map_err(SerializationError::from)?,
        };
        Ok(text)
    }

    /// Read a topology file; a missing file is an empty topology
    pub fn load(path: &Path) -> Result<Self, BusError> {
        let format = TopologyFormat::from_path(path)?;
        if !path.exists() {
            debug!(path = %path.display(), "Topology file not found; starting empty");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Invalid {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        let topology = Self::parse(&text, format)?;
        debug!(
            path = %path.display(),
            queues = topology.queues.len(),
            topics = topology.topics.len(),
            "Topology loaded"
        );
        Ok(topology)
    }

    pub fn save(&self, path: &Path) -> Result<(), BusError> {
        let text = self.render(TopologyFormat::from_path(path)?)?;
        std::fs::write(path, text).map_err(|e| ConfigurationError::Invalid {
            message: format!("cannot write {}: {}", path.display(), e),
        })?;
        debug!(path = %path.display(), "Topology saved");
        Ok(())
    }

    /// Check the topology by applying it to an empty namespace
    pub fn validate(&self, config: &NamespaceConfig) -> Result<(), BusError> {
        let scratch = Namespace::new(config.clone())?;
        self.apply(&scratch)
    }

    /// Create every entity, rule and key in `namespace`. Forwarding targets
    /// are set after all entities exist, so definitions may refer to each
    /// other in any order.
    pub fn apply(&self, namespace: &Namespace) -> Result<(), BusError> {
        for rule in &self.authorization_rules {
            namespace.put_authorization_rule(None, rule.clone())?;
        }

        for (name, queue) in &self.queues {
            namespace.create_queue(name, without_queue_forwards(&queue.properties))?;
        }
        for (name, topic) in &self.topics {
            namespace.create_topic(name, topic.properties.clone())?;
            for (sub_name, subscription) in &topic.subscriptions {
                namespace.create_subscription(
                    name,
                    sub_name,
                    without_subscription_forwards(&subscription.properties),
                )?;
                if let Some(rules) = &subscription.rules {
                    replace_rules(namespace, name, sub_name, rules)?;
                }
            }
        }

        for (name, queue) in &self.queues {
            if has_queue_forwards(&queue.properties) {
                namespace.update_queue(name, queue.properties.clone())?;
            }
            for rule in &queue.authorization_rules {
                namespace.put_authorization_rule(Some(name), rule.clone())?;
            }
        }
        for (name, topic) in &self.topics {
            for (sub_name, subscription) in &topic.subscriptions {
                if has_subscription_forwards(&subscription.properties) {
                    namespace.update_subscription(name, sub_name, subscription.properties.clone())?;
                }
            }
            for rule in &topic.authorization_rules {
                namespace.put_authorization_rule(Some(name), rule.clone())?;
            }
        }

        info!(
            namespace = %namespace.name(),
            queues = self.queues.len(),
            topics = self.topics.len(),
            "Topology applied"
        );
        Ok(())
    }

    /// Capture the current entities of `namespace`. The generated root rule
    /// is left out; subscriptions holding only `$Default` omit their rules.
    pub fn from_namespace(namespace: &Namespace) -> Result<Self, BusError> {
        let mut topology = Self::default();

        topology.authorization_rules = namespace
            .list_authorization_rules(None)?
            .into_iter()
            .filter(|r| r.key_name != ROOT_KEY_NAME)
            .collect();

        for name in namespace.list_queues() {
            let definition = QueueDefinition {
                properties: namespace.get_queue(&name)?,
                authorization_rules: namespace.list_authorization_rules(Some(&name))?,
            };
            topology.queues.insert(name, definition);
        }

        for name in namespace.list_topics() {
            let mut subscriptions = BTreeMap::new();
            for sub_name in namespace.list_subscriptions(&name)? {
                let rules = namespace.list_rules(&name, &sub_name)?;
                let only_default = rules.len() == 1 && rules[0] == RuleProperties::default_rule();
                let definition = SubscriptionDefinition {
                    properties: namespace.get_subscription(&name, &sub_name)?,
                    rules: (!only_default).then_some(rules),
                };
                subscriptions.insert(sub_name, definition);
            }

            let definition = TopicDefinition {
                properties: namespace.get_topic(&name)?,
                subscriptions,
                authorization_rules: namespace.list_authorization_rules(Some(&name))?,
            };
            topology.topics.insert(name, definition);
        }

        Ok(topology)
    }
}

fn has_queue_forwards(properties: &QueueProperties) -> bool {
    properties.forward_to.is_some() || properties.forward_dead_lettered_messages_to.is_some()
}

fn has_subscription_forwards(properties: &SubscriptionProperties) -> bool {
    properties.forward_to.is_some() || properties.forward_dead_lettered_messages_to.is_some()
}

fn without_queue_forwards(properties: &QueueProperties) -> QueueProperties {
    QueueProperties {
        forward_to: None,
        forward_dead_lettered_messages_to: None,
        ..properties.clone()
    }
}

fn without_subscription_forwards(properties: &SubscriptionProperties) -> SubscriptionProperties {
    SubscriptionProperties {
        forward_to: None,
        forward_dead_lettered_messages_to: None,
        ..properties.clone()
    }
}

/// Swap the `$Default` rule for the listed ones; a listed `$Default` is
/// recreated as written
fn replace_rules(
    namespace: &Namespace,
    topic: &EntityName,
    subscription: &EntityName,
    rules: &[RuleProperties],
) -> Result<(), BusError> {
    namespace.delete_rule(topic, subscription, DEFAULT_RULE_NAME)?;
    for rule in rules {
        namespace.create_rule(topic, subscription, rule.clone())?;
    }
    Ok(())
}
