//! CLI argument parsing for the shardproxy backend daemon

use clap::{Args, Parser, Subcommand};
use shardproxy_backend::prelude::*;
use std::path::PathBuf;

/// Shardproxy - backend core of a MySQL sharding proxy
///
/// Loads the datasource and pool configuration, then checks connectivity or
/// runs a routed statement against a set of shards.
#[derive(Parser, Debug)]
#[command(name = "shardproxyd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "shardproxy.yaml", env = "SHARDPROXY_CONFIG")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate the configuration and ping every datasource
    Check,

    /// Run one statement on the given datasources and print rows as JSON lines
    Exec(ExecArgs),
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Target datasources (comma-separated)
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub targets: Vec<String>,

    /// Statement to run on every target
    #[arg(short, long)]
    pub sql: String,

    /// Bound parameter, repeated once per placeholder
    #[arg(short, long = "param")]
    pub params: Vec<String>,

    /// Use the prepared statement protocol (implied by --param)
    #[arg(long)]
    pub prepared: bool,

    /// Merge rows sorted by this zero-based column
    #[arg(long)]
    pub order_by: Option<usize>,

    /// Sort descending (with --order-by)
    #[arg(long, requires = "order_by")]
    pub desc: bool,

    /// Per-shard timeout in milliseconds, overriding the configuration
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl ExecArgs {
    /// Parameters typed from their textual form
    pub fn parameters(&self) -> Vec<Value> {
        self.params.iter().map(|p| parse_param(p)).collect()
    }

    /// Merge order requested on the command line
    pub fn merge_order(&self) -> MergeOrder {
        match self.order_by {
            Some(column) => {
                let direction = if self.desc {
                    SortDirection::Descending
                } else {
                    SortDirection::Ascending
                };
                MergeOrder::Sorted(RowComparator::by_columns([(column, direction)]))
            }
            None => MergeOrder::Concatenate,
        }
    }

    /// Build the execution request
    pub fn request(&self) -> Result<ExecutionRequest> {
        let request = if self.prepared || !self.params.is_empty() {
            ExecutionRequest::prepared(&self.sql, self.parameters(), &self.targets)?
        } else {
            ExecutionRequest::text(&self.sql, &self.targets)?
        };
        Ok(request.with_merge(self.merge_order()))
    }
}

/// `null`, integers and floats are typed; anything else binds as text
fn parse_param(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else if let Ok(v) = raw.parse::<i64>() {
        Value::Int(v)
    } else if let Ok(v) = raw.parse::<u64>() {
        Value::UInt(v)
    } else if let Ok(v) = raw.parse::<f64>() {
        Value::Double(v)
    } else {
        Value::String(raw.to_string())
    }
}
