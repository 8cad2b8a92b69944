//! # localbus CLI
//!
//! Command-line interface for localbus namespaces.
//!
//! This module provides CLI commands for:
//! - Editing a topology file (queues, topics, subscriptions, rules and
//!   authorization rules) with `<cli> <entity> <verb> --flags`
//! - Validating and rendering a topology file
//! - Running demo flows against a fresh in-memory namespace
//! - Generating shell completions
//!
//! Admin commands load the topology file into a fresh namespace, perform the
//! operation through an [`AdministrationClient`] and write the resulting
//! topology back to the same file.

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use localbus::{
    AccessRight, AdministrationClient, AuthorizationRule, BusError, ConfigurationError,
    CorrelationFilter, EntityName, Filter, Namespace, NamespaceConfig, PropertyValue,
    QueueProperties, RuleAction, RuleProperties, SerializationError, SubscriptionProperties,
    TopicProperties, Topology, TopologyFormat, ROOT_KEY_NAME,
};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub mod demo;

pub use demo::DemoFlow;

/// Topology file used when neither `--topology` nor `LOCALBUS_TOPOLOGY` is given
pub const DEFAULT_TOPOLOGY_FILE: &str = "localbus.yaml";

// ============================================================================
// CLI Structure
// ============================================================================

/// localbus CLI - in-process Service Bus namespaces
#[derive(Parser, Debug)]
#[command(name = "localbus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Manage localbus topologies and run demo flows")]
#[command(
    long_about = "localbus keeps Service Bus namespaces in memory. The topology file is the declarative form of a namespace: admin commands edit it and demo flows load it."
)]
pub struct Cli {
    /// Topology file (YAML, JSON or TOML by extension)
    #[arg(short, long, env = "LOCALBUS_TOPOLOGY", default_value = DEFAULT_TOPOLOGY_FILE, global = true)]
    pub topology: PathBuf,

    /// Namespace configuration file
    #[arg(short, long, env = "LOCALBUS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue management commands
    Queue {
        #[command(subcommand)]
        action: QueueCommands,
    },

    /// Topic management commands
    Topic {
        #[command(subcommand)]
        action: TopicCommands,
    },

    /// Subscription management commands
    Subscription {
        #[command(subcommand)]
        action: SubscriptionCommands,
    },

    /// Subscription rule commands
    Rule {
        #[command(subcommand)]
        action: RuleCommands,
    },

    /// Shared access authorization rule commands
    AuthorizationRule {
        #[command(subcommand)]
        action: AuthorizationRuleCommands,
    },

    /// Topology file commands
    Topology {
        #[command(subcommand)]
        action: TopologyCommands,
    },

    /// Run a demo flow against a fresh namespace loaded from the topology
    Demo {
        /// Flow to run
        #[arg(value_enum)]
        flow: DemoFlow,

        /// Connection string used by the demo clients (defaults to the root key)
        #[arg(long, env = "SERVICEBUS_CONNECTION_STRING", hide_env_values = true)]
        connection_string: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Queue commands
#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Create a queue
    Create(QueueArgs),

    /// Delete a queue and its messages
    Delete {
        #[arg(long)]
        name: String,
    },

    /// List queue names
    List,

    /// Show a queue's properties
    Show {
        #[arg(long)]
        name: String,

        #[arg(short, long, default_value = "yaml")]
        format: OutputFormat,
    },
}

/// Topic commands
#[derive(Subcommand, Debug)]
pub enum TopicCommands {
    /// Create a topic
    Create(TopicArgs),

    /// Delete a topic with its subscriptions
    Delete {
        #[arg(long)]
        name: String,
    },

    /// List topic names
    List,

    /// Show a topic's properties
    Show {
        #[arg(long)]
        name: String,

        #[arg(short, long, default_value = "yaml")]
        format: OutputFormat,
    },
}

/// Subscription commands
#[derive(Subcommand, Debug)]
pub enum SubscriptionCommands {
    /// Create a subscription with the `$Default` rule
    Create(SubscriptionArgs),

    /// Delete a subscription
    Delete {
        #[arg(long)]
        topic: String,

        #[arg(long)]
        name: String,
    },

    /// List the subscriptions of a topic
    List {
        #[arg(long)]
        topic: String,
    },

    /// Show a subscription's properties
    Show {
        #[arg(long)]
        topic: String,

        #[arg(long)]
        name: String,

        #[arg(short, long, default_value = "yaml")]
        format: OutputFormat,
    },
}

/// Rule commands
#[derive(Subcommand, Debug)]
pub enum RuleCommands {
    /// Add a rule to a subscription
    Create(RuleArgs),

    /// Remove a rule from a subscription
    Delete {
        #[arg(long)]
        topic: String,

        #[arg(long)]
        subscription: String,

        #[arg(long)]
        name: String,
    },

    /// List the rules of a subscription
    List {
        #[arg(long)]
        topic: String,

        #[arg(long)]
        subscription: String,

        #[arg(short, long, default_value = "yaml")]
        format: OutputFormat,
    },
}

/// Authorization rule commands
#[derive(Subcommand, Debug)]
pub enum AuthorizationRuleCommands {
    /// Create a rule with generated keys and print its connection string
    Create {
        #[arg(long)]
        name: String,

        /// Comma-separated rights
        #[arg(long, value_enum, value_delimiter = ',', required = true)]
        rights: Vec<Right>,

        /// Queue or topic the rule is scoped to (namespace scope when absent)
        #[arg(long)]
        entity: Option<String>,
    },

    /// List rules and their rights
    List {
        #[arg(long)]
        entity: Option<String>,
    },

    /// Delete a rule
    Delete {
        #[arg(long)]
        name: String,

        #[arg(long)]
        entity: Option<String>,
    },
}

/// Topology file commands
#[derive(Subcommand, Debug)]
pub enum TopologyCommands {
    /// Check that the topology parses and is internally consistent
    Validate,

    /// Print the topology
    Show {
        #[arg(short, long, default_value = "yaml")]
        format: OutputFormat,
    },
}

/// Queue settings shared by `queue create`
#[derive(Args, Debug, Clone, Default)]
pub struct QueueArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub enable_session: bool,

    #[arg(long)]
    pub enable_duplicate_detection: bool,

    /// Duplicate detection history window in seconds
    #[arg(long, requires = "enable_duplicate_detection")]
    pub duplicate_detection_window_secs: Option<i64>,

    #[arg(long)]
    pub max_delivery_count: Option<u32>,

    #[arg(long)]
    pub lock_duration_secs: Option<i64>,

    #[arg(long)]
    pub default_ttl_secs: Option<i64>,

    #[arg(long)]
    pub dead_letter_on_expiration: bool,

    /// Maximum number of stored messages
    #[arg(long)]
    pub max_size: Option<usize>,

    #[arg(long)]
    pub forward_to: Option<String>,

    #[arg(long)]
    pub forward_dead_lettered_to: Option<String>,
}

impl QueueArgs {
    /// Build queue properties, starting from the defaults
    pub fn to_properties(&self) -> Result<QueueProperties, CliError> {
        let mut properties = QueueProperties::new();
        if self.enable_session {
            properties = properties.with_sessions();
        }
        if self.enable_duplicate_detection {
            let window = match self.duplicate_detection_window_secs {
                Some(secs) => seconds("--duplicate-detection-window-secs", secs)?,
                None => properties.duplicate_detection_history_time_window,
            };
            properties = properties.with_duplicate_detection(window);
        }
        if let Some(count) = self.max_delivery_count {
            properties = properties.with_max_delivery_count(count);
        }
        if let Some(secs) = self.lock_duration_secs {
            properties = properties.with_lock_duration(seconds("--lock-duration-secs", secs)?);
        }
        if let Some(secs) = self.default_ttl_secs {
            properties = properties.with_default_ttl(seconds("--default-ttl-secs", secs)?);
        }
        if self.dead_letter_on_expiration {
            properties = properties.with_dead_lettering_on_expiration();
        }
        if let Some(max) = self.max_size {
            properties = properties.with_max_size(max);
        }
        if let Some(target) = &self.forward_to {
            properties = properties.with_forward_to(entity_name("--forward-to", target)?);
        }
        if let Some(target) = &self.forward_dead_lettered_to {
            properties = properties
                .with_forward_dead_lettered_to(entity_name("--forward-dead-lettered-to", target)?);
        }
        Ok(properties)
    }
}

/// Topic settings shared by `topic create`
#[derive(Args, Debug, Clone, Default)]
pub struct TopicArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub enable_duplicate_detection: bool,

    #[arg(long, requires = "enable_duplicate_detection")]
    pub duplicate_detection_window_secs: Option<i64>,

    #[arg(long)]
    pub default_ttl_secs: Option<i64>,

    #[arg(long)]
    pub max_size: Option<usize>,
}

impl TopicArgs {
    pub fn to_properties(&self) -> Result<TopicProperties, CliError> {
        let mut properties = TopicProperties::new();
        if self.enable_duplicate_detection {
            let window = match self.duplicate_detection_window_secs {
                Some(secs) => seconds("--duplicate-detection-window-secs", secs)?,
                None => properties.duplicate_detection_history_time_window,
            };
            properties = properties.with_duplicate_detection(window);
        }
        if let Some(secs) = self.default_ttl_secs {
            properties = properties.with_default_ttl(seconds("--default-ttl-secs", secs)?);
        }
        if let Some(max) = self.max_size {
            properties = properties.with_max_size(max);
        }
        Ok(properties)
    }
}

/// Subscription settings shared by `subscription create`
#[derive(Args, Debug, Clone, Default)]
pub struct SubscriptionArgs {
    #[arg(long)]
    pub topic: String,

    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub enable_session: bool,

    #[arg(long)]
    pub max_delivery_count: Option<u32>,

    #[arg(long)]
    pub lock_duration_secs: Option<i64>,

    #[arg(long)]
    pub default_ttl_secs: Option<i64>,

    #[arg(long)]
    pub dead_letter_on_expiration: bool,

    /// Drop messages whose filter fails to evaluate instead of dead-lettering them
    #[arg(long)]
    pub ignore_filter_exceptions: bool,

    #[arg(long)]
    pub forward_to: Option<String>,

    #[arg(long)]
    pub forward_dead_lettered_to: Option<String>,
}

impl SubscriptionArgs {
    pub fn to_properties(&self) -> Result<SubscriptionProperties, CliError> {
        let mut properties = SubscriptionProperties::new();
        if self.enable_session {
            properties = properties.with_sessions();
        }
        if let Some(count) = self.max_delivery_count {
            properties = properties.with_max_delivery_count(count);
        }
        if let Some(secs) = self.lock_duration_secs {
            properties = properties.with_lock_duration(seconds("--lock-duration-secs", secs)?);
        }
        if let Some(secs) = self.default_ttl_secs {
            properties = properties.with_default_ttl(seconds("--default-ttl-secs", secs)?);
        }
        if self.dead_letter_on_expiration {
            properties = properties.with_dead_lettering_on_expiration();
        }
        properties.dead_lettering_on_filter_evaluation_exceptions = !self.ignore_filter_exceptions;
        if let Some(target) = &self.forward_to {
            properties = properties.with_forward_to(entity_name("--forward-to", target)?);
        }
        if let Some(target) = &self.forward_dead_lettered_to {
            properties = properties
                .with_forward_dead_lettered_to(entity_name("--forward-dead-lettered-to", target)?);
        }
        Ok(properties)
    }
}

/// Rule definition for `rule create`
#[derive(Args, Debug, Clone, Default)]
pub struct RuleArgs {
    #[arg(long)]
    pub topic: String,

    #[arg(long)]
    pub subscription: String,

    #[arg(long)]
    pub name: String,

    /// SQL filter expression
    #[arg(long, conflicts_with_all = ["correlation_id", "label", "property"])]
    pub sql: Option<String>,

    /// Correlation filter on the correlation id
    #[arg(long)]
    pub correlation_id: Option<String>,

    /// Correlation filter on the subject (label)
    #[arg(long)]
    pub label: Option<String>,

    /// Correlation filter on an application property, as key=value
    #[arg(long, value_parser = parse_property)]
    pub property: Vec<(String, PropertyValue)>,

    /// SQL action applied to matching messages
    #[arg(long)]
    pub action: Option<String>,
}

impl RuleArgs {
    /// Build the rule; exactly one filter style must be given
    pub fn to_rule(&self) -> Result<RuleProperties, CliError> {
        let filter = match &self.sql {
            Some(expression) => Filter::sql(expression).map_err(BusError::from)?,
            None => {
                if self.correlation_id.is_none() && self.label.is_none() && self.property.is_empty() {
                    return Err(CliError::InvalidArgument {
                        arg: "--sql".to_string(),
                        message: "one of --sql, --correlation-id, --label or --property is required"
                            .to_string(),
                    });
                }
                let mut correlation = CorrelationFilter::new();
                if let Some(id) = &self.correlation_id {
                    correlation = correlation.with_correlation_id(id.clone());
                }
                if let Some(label) = &self.label {
                    correlation = correlation.with_subject(label.clone());
                }
                for (key, value) in &self.property {
                    correlation = correlation.with_property(key.clone(), value.clone());
                }
                Filter::correlation(correlation).map_err(BusError::from)?
            }
        };

        let mut rule = RuleProperties::new(self.name.clone(), filter);
        if let Some(action) = &self.action {
            rule = rule.with_action(RuleAction::new(action).map_err(BusError::from)?);
        }
        Ok(rule)
    }
}

/// Access right accepted by `--rights`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Right {
    Send,
    Listen,
    Manage,
}

impl From<Right> for AccessRight {
    fn from(right: Right) -> Self {
        match right {
            Right::Send => AccessRight::Send,
            Right::Listen => AccessRight::Listen,
            Right::Manage => AccessRight::Manage,
        }
    }
}

/// Output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Yaml,
    Json,
    Toml,
}

impl From<OutputFormat> for TopologyFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Yaml => TopologyFormat::Yaml,
            OutputFormat::Json => TopologyFormat::Json,
            OutputFormat::Toml => TopologyFormat::Toml,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Demo(#[from] anyhow::Error),
}

// ============================================================================
// Argument parsing helpers
// ============================================================================

/// Parse a `key=value` application property. Integers, finite floats and
/// `true`/`false` are typed; anything else stays a string.
pub fn parse_property(s: &str) -> Result<(String, PropertyValue), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("property key is empty in '{}'", s));
    }
    Ok((key.to_string(), parse_property_value(value)))
}

fn parse_property_value(value: &str) -> PropertyValue {
    if let Ok(int) = value.parse::<i64>() {
        return PropertyValue::Int(int);
    }
    if let Some(float) = value.parse::<f64>().ok().filter(|f| f.is_finite()) {
        return PropertyValue::Float(float);
    }
    match value {
        "true" => PropertyValue::Bool(true),
        "false" => PropertyValue::Bool(false),
        _ => PropertyValue::String(value.to_string()),
    }
}

fn seconds(arg: &str, secs: i64) -> Result<chrono::Duration, CliError> {
    chrono::Duration::try_seconds(secs).ok_or_else(|| CliError::InvalidArgument {
        arg: arg.to_string(),
        message: format!("{} seconds is out of range", secs),
    })
}

fn entity_name(arg: &str, value: &str) -> Result<EntityName, CliError> {
    EntityName::new(value).map_err(|e| CliError::InvalidArgument {
        arg: arg.to_string(),
        message: e.to_string(),
    })
}

fn render<T: Serialize>(value: &T, format: OutputFormat) -> Result<String, CliError> {
    let rendered = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value).map_err(SerializationError::from),
        OutputFormat::Json => serde_json::to_string_pretty(value).map_err(SerializationError::from),
        OutputFormat::Toml => toml::to_string_pretty(value).map_err(SerializationError::from),
    };
    rendered.map_err(|e| CliError::Bus(BusError::from(e)))
}

#[derive(Serialize)]
struct RuleListing<'a> {
    rules: &'a [RuleProperties],
}

// ============================================================================
// Topology file
// ============================================================================

/// A topology file loaded into a fresh namespace for one command
pub struct TopologyFile {
    path: PathBuf,
    namespace: Namespace,
    admin: AdministrationClient,
    root_rule: Option<AuthorizationRule>,
}

impl TopologyFile {
    /// Load the topology at `path` into a namespace built from the configuration
    pub fn open(path: &Path, config_path: Option<&Path>) -> Result<Self, CliError> {
        let config = NamespaceConfig::load(config_path)?;
        let namespace = Namespace::new(config)?;
        let topology = Topology::load(path)?;
        topology.apply(&namespace)?;

        let admin = AdministrationClient::new(&namespace, &namespace.connection_string())?;
        let root_rule = topology
            .authorization_rules
            .iter()
            .find(|rule| rule.key_name == ROOT_KEY_NAME)
            .cloned();

        debug!(
            path = %path.display(),
            queues = topology.queues.len(),
            topics = topology.topics.len(),
            "Topology loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            namespace,
            admin,
            root_rule,
        })
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn admin(&self) -> &AdministrationClient {
        &self.admin
    }

    /// Write the namespace's current entities back to the file. A root rule
    /// read from the file is kept.
    pub fn save(&self) -> Result<(), CliError> {
        let mut topology = Topology::from_namespace(&self.namespace)?;
        if let Some(root) = &self.root_rule {
            topology.authorization_rules.insert(0, root.clone());
        }
        topology.save(&self.path)?;
        info!(path = %self.path.display(), "Topology saved");
        Ok(())
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let mut stdout = std::io::stdout();
    execute(cli, &mut stdout).await
}

/// Execute a parsed command line, writing command output to `out`
pub async fn execute(cli: Cli, out: &mut dyn Write) -> Result<(), CliError> {
    let topology = cli.topology.as_path();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Queue { action } => execute_queue_command(action, topology, config, out).await,
        Commands::Topic { action } => execute_topic_command(action, topology, config, out).await,
        Commands::Subscription { action } => {
            execute_subscription_command(action, topology, config, out).await
        }
        Commands::Rule { action } => execute_rule_command(action, topology, config, out).await,
        Commands::AuthorizationRule { action } => {
            execute_authorization_rule_command(action, topology, config, out).await
        }
        Commands::Topology { action } => execute_topology_command(action, topology, config, out),
        Commands::Demo {
            flow,
            connection_string,
        } => execute_demo_command(flow, connection_string, topology, config, out).await,
        Commands::Completions { shell } => execute_completions_command(shell, out),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Initialize logging based on CLI arguments. `RUST_LOG` takes precedence
/// over `--log-level`; logs go to stderr so command output stays parseable.
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "--log-level".to_string(),
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::CommandFailed {
        message: format!("failed to initialize logging: {}", e),
    })
}

/// Execute queue command
async fn execute_queue_command(
    action: QueueCommands,
    topology: &Path,
    config: Option<&Path>,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let file = TopologyFile::open(topology, config)?;
    let admin = file.admin();

    match action {
        QueueCommands::Create(args) => {
            info!(queue = %args.name, "Creating queue");
            admin.create_queue(&args.name, args.to_properties()?).await?;
            file.save()?;
            writeln!(out, "Created queue '{}'", args.name)?;
        }
        QueueCommands::Delete { name } => {
            info!(queue = %name, "Deleting queue");
            admin.delete_queue(&name).await?;
            file.save()?;
            writeln!(out, "Deleted queue '{}'", name)?;
        }
        QueueCommands::List => {
            for name in admin.list_queues().await? {
                writeln!(out, "{}", name)?;
            }
        }
        QueueCommands::Show { name, format } => {
            let properties = admin.get_queue(&name).await?;
            writeln!(out, "{}", render(&properties, format)?.trim_end())?;
        }
    }
    Ok(())
}

/// Execute topic command
async fn execute_topic_command(
    action: TopicCommands,
    topology: &Path,
    config: Option<&Path>,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let file = TopologyFile::open(topology, config)?;
    let admin = file.admin();

    match action {
        TopicCommands::Create(args) => {
            info!(topic = %args.name, "Creating topic");
            admin.create_topic(&args.name, args.to_properties()?).await?;
            file.save()?;
            writeln!(out, "Created topic '{}'", args.name)?;
        }
        TopicCommands::Delete { name } => {
            info!(topic = %name, "Deleting topic");
            admin.delete_topic(&name).await?;
            file.save()?;
            writeln!(out, "Deleted topic '{}'", name)?;
        }
        TopicCommands::List => {
            for name in admin.list_topics().await? {
                writeln!(out, "{}", name)?;
            }
        }
        TopicCommands::Show { name, format } => {
            let properties = admin.get_topic(&name).await?;
            writeln!(out, "{}", render(&properties, format)?.trim_end())?;
        }
    }
    Ok(())
}

/// Execute subscription command
async fn execute_subscription_command(
    action: SubscriptionCommands,
    topology: &Path,
    config: Option<&Path>,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let file = TopologyFile::open(topology, config)?;
    let admin = file.admin();

    match action {
        SubscriptionCommands::Create(args) => {
            info!(topic = %args.topic, subscription = %args.name, "Creating subscription");
            admin
                .create_subscription(&args.topic, &args.name, args.to_properties()?)
                .await?;
            file.save()?;
            writeln!(out, "Created subscription '{}/{}'", args.topic, args.name)?;
        }
        SubscriptionCommands::Delete { topic, name } => {
            info!(topic = %topic, subscription = %name, "Deleting subscription");
            admin.delete_subscription(&topic, &name).await?;
            file.save()?;
            writeln!(out, "Deleted subscription '{}/{}'", topic, name)?;
        }
        SubscriptionCommands::List { topic } => {
            for name in admin.list_subscriptions(&topic).await? {
                writeln!(out, "{}", name)?;
            }
        }
        SubscriptionCommands::Show {
            topic,
            name,
            format,
        } => {
            let properties = admin.get_subscription(&topic, &name).await?;
            writeln!(out, "{}", render(&properties, format)?.trim_end())?;
        }
    }
    Ok(())
}

/// Execute rule command
async fn execute_rule_command(
    action: RuleCommands,
    topology: &Path,
    config: Option<&Path>,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let file = TopologyFile::open(topology, config)?;
    let admin = file.admin();

    match action {
        RuleCommands::Create(args) => {
            let rule = args.to_rule()?;
            info!(
                topic = %args.topic,
                subscription = %args.subscription,
                rule = %rule.name,
                "Creating rule"
            );
            admin.create_rule(&args.topic, &args.subscription, rule).await?;
            file.save()?;
            writeln!(
                out,
                "Created rule '{}' on '{}/{}'",
                args.name, args.topic, args.subscription
            )?;
        }
        RuleCommands::Delete {
            topic,
            subscription,
            name,
        } => {
            info!(topic = %topic, subscription = %subscription, rule = %name, "Deleting rule");
            admin.delete_rule(&topic, &subscription, &name).await?;
            file.save()?;
            writeln!(out, "Deleted rule '{}' from '{}/{}'", name, topic, subscription)?;
        }
        RuleCommands::List {
            topic,
            subscription,
            format,
        } => {
            let rules = admin.list_rules(&topic, &subscription).await?;
            let listing = RuleListing { rules: &rules };
            writeln!(out, "{}", render(&listing, format)?.trim_end())?;
        }
    }
    Ok(())
}

/// Execute authorization rule command
async fn execute_authorization_rule_command(
    action: AuthorizationRuleCommands,
    topology: &Path,
    config: Option<&Path>,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let file = TopologyFile::open(topology, config)?;
    let admin = file.admin();

    match action {
        AuthorizationRuleCommands::Create {
            name,
            rights,
            entity,
        } => {
            if name == ROOT_KEY_NAME {
                return Err(CliError::InvalidArgument {
                    arg: "--name".to_string(),
                    message: format!("{} is managed by the namespace", ROOT_KEY_NAME),
                });
            }
            let rights: Vec<AccessRight> = rights.into_iter().map(AccessRight::from).collect();
            info!(key_name = %name, entity = ?entity, rights = ?rights, "Creating authorization rule");
            admin
                .create_authorization_rule(entity.as_deref(), AuthorizationRule::new(name.clone(), rights))
                .await?;
            let connection_string = admin.connection_string(entity.as_deref(), &name).await?;
            file.save()?;
            writeln!(out, "{}", connection_string)?;
        }
        AuthorizationRuleCommands::List { entity } => {
            for rule in admin.list_authorization_rules(entity.as_deref()).await? {
                let rights: Vec<String> = rule.rights.iter().map(|r| r.to_string()).collect();
                writeln!(out, "{}\t{}", rule.key_name, rights.join(","))?;
            }
        }
        AuthorizationRuleCommands::Delete { name, entity } => {
            info!(key_name = %name, entity = ?entity, "Deleting authorization rule");
            admin
                .delete_authorization_rule(entity.as_deref(), &name)
                .await?;
            file.save()?;
            writeln!(out, "Deleted authorization rule '{}'", name)?;
        }
    }
    Ok(())
}

/// Execute topology command
fn execute_topology_command(
    action: TopologyCommands,
    topology: &Path,
    config: Option<&Path>,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let document = Topology::load(topology)?;

    match action {
        TopologyCommands::Validate => {
            let config = NamespaceConfig::load(config)?;
            document.validate(&config)?;
            info!(path = %topology.display(), "Topology is valid");
            writeln!(
                out,
                "{} is valid: {} queue(s), {} topic(s)",
                topology.display(),
                document.queues.len(),
                document.topics.len()
            )?;
        }
        TopologyCommands::Show { format } => {
            let rendered = document.render(format.into())?;
            writeln!(out, "{}", rendered.trim_end())?;
        }
    }
    Ok(())
}

/// Execute demo command
async fn execute_demo_command(
    flow: DemoFlow,
    connection_string: Option<String>,
    topology: &Path,
    config: Option<&Path>,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let file = TopologyFile::open(topology, config)?;
    let connection_string =
        connection_string.unwrap_or_else(|| file.namespace().connection_string());

    info!(flow = ?flow, namespace = %file.namespace().name(), "Running demo flow");
    demo::run_demo(flow, file.namespace(), &connection_string, out).await?;
    Ok(())
}

/// Execute completions command
fn execute_completions_command(
    shell: clap_complete::Shell,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    info!(shell = ?shell, "Generating shell completions");

    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, "localbus", out);
    Ok(())
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
