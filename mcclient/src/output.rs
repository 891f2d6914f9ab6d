//! Output formatting for mc-controller

use clap::ValueEnum;
use colored::Colorize;
use kube::api::DynamicObject;
use kube::ResourceExt;
use mcclient::{AggregateEvent, ClusterEvent, ClusterObject, ClusterSummary};
use serde::Serialize;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(Tabled, Serialize)]
pub struct ClusterRow {
    #[tabled(rename = "cluster")]
    pub id: String,
    #[tabled(rename = "api server")]
    pub api_server: String,
    pub context: String,
    #[tabled(rename = "client")]
    pub client_ready: String,
    #[tabled(rename = "observed")]
    pub observed_at: String,
}

impl From<ClusterSummary> for ClusterRow {
    fn from(summary: ClusterSummary) -> Self {
        Self {
            id: summary.id.to_string(),
            api_server: summary.api_server,
            context: summary.context.unwrap_or_else(|| "-".to_string()),
            client_ready: if summary.client_ready { "ready" } else { "lazy" }.to_string(),
            observed_at: summary.observed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Tabled)]
pub struct ObjectRow {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
    #[tabled(rename = "resource version")]
    pub resource_version: String,
}

impl From<&ClusterObject<DynamicObject>> for ObjectRow {
    fn from(item: &ClusterObject<DynamicObject>) -> Self {
        Self {
            cluster: item.cluster.to_string(),
            namespace: item.object.namespace().unwrap_or_else(|| "-".to_string()),
            name: item.object.name_any(),
            resource_version: item.object.resource_version().unwrap_or_default(),
        }
    }
}

/// Serialized form of one aggregate watch event
#[derive(Serialize)]
struct EventRecord<'a> {
    cluster: &'a str,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    object: Option<&'a DynamicObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// Print rows in the specified format
pub fn print_output<T: Tabled + Serialize>(data: Vec<T>, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => print_table(data),
        OutputFormat::Json => print_json(&data)?,
        OutputFormat::Yaml => print_yaml(&data)?,
    }
    Ok(())
}

/// Print a single item; table format falls back to pretty JSON
pub fn print_single<T: Serialize>(data: &T, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table | OutputFormat::Json => print_json(data),
        OutputFormat::Yaml => print_yaml(data),
    }
}

pub fn print_table<T: Tabled>(data: Vec<T>) {
    if data.is_empty() {
        println!("{}", "No results found".yellow());
        return;
    }

    println!("{}", Table::new(data));
}

pub fn print_json<T: Serialize>(data: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

pub fn print_yaml<T: Serialize>(data: &T) -> anyhow::Result<()> {
    println!("{}", serde_yaml::to_string(data)?);
    Ok(())
}

/// Print listed objects; JSON and YAML carry the full objects
pub fn print_objects(items: &[ClusterObject<DynamicObject>], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            print_table(items.iter().map(ObjectRow::from).collect());
            Ok(())
        }
        OutputFormat::Json => print_json(&items),
        OutputFormat::Yaml => print_yaml(&items),
    }
}

/// Print one watch event as a single line (table) or document
pub fn print_event(event: &AggregateEvent<DynamicObject>, format: OutputFormat) -> anyhow::Result<()> {
    let event_type = event.event.event_type().to_string();

    if format == OutputFormat::Table {
        let detail = match &event.event {
            ClusterEvent::Bookmark { resource_version } => format!("@{resource_version}"),
            ClusterEvent::Error(failure) => failure.to_string().red().to_string(),
            other => other
                .object()
                .map(|obj| match obj.namespace() {
                    Some(ns) => format!("{ns}/{}", obj.name_any()),
                    None => obj.name_any(),
                })
                .unwrap_or_default(),
        };
        let event_type = match &event.event {
            ClusterEvent::Added(_) => event_type.green(),
            ClusterEvent::Modified(_) => event_type.yellow(),
            ClusterEvent::Deleted(_) => event_type.red(),
            ClusterEvent::Bookmark { .. } => event_type.dimmed(),
            ClusterEvent::Error(_) => event_type.red().bold(),
        };
        println!("{:<20} {:<9} {}", event.cluster.as_str().bold(), event_type, detail);
        return Ok(());
    }

    let record = EventRecord {
        cluster: event.cluster.as_str(),
        event_type,
        object: event.event.object(),
        message: match &event.event {
            ClusterEvent::Error(failure) => Some(failure.to_string()),
            _ => None,
        },
    };
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(&record)?);
            Ok(())
        }
        _ => {
            print!("---\n{}", serde_yaml::to_string(&record)?);
            Ok(())
        }
    }
}

/// Print a warning message with yellow triangle
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message with red X
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}
