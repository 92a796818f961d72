use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::parser::Schema;
use crate::request::{decode_field_list, SearchRequest};
use crate::session::ResultRow;

/// Usage text printed when a required flag is missing.
pub const USAGE: &str = "\
Usage: splunk-stream --search <search> --field-list <fields> [options]
The following options are valid
  --search         required, search string to execute
  --field-list     required, list of fields to request, comma delimited
  --uri            uri to splunk's mgmt port, default: https://localhost:8089
  --username       username to use for authentication, default: admin
  --password       password to use for authentication, default: changeme
  --earliest-time  earliest time for the search, default: -24h
  --latest-time    latest time for the search, default: now
  --print          whether to print results or just the summary, default: true
  --config         TOML file with connection settings
  --queue-capacity rows buffered between the network and the printer, default: 100
  --insecure       accept self-signed certificates
  --json           print rows as JSON objects instead of field=value lines";

#[derive(Parser, Debug)]
#[command(name = "splunk-stream")]
#[command(version)]
#[command(about = "Run a Splunk search and stream its results to stdout")]
pub struct Args {
    /// Search string to execute
    #[arg(long)]
    pub search: Option<String>,

    /// Fields to request, comma delimited
    #[arg(long)]
    pub field_list: Option<String>,

    /// URI of the management port [default: https://localhost:8089]
    #[arg(long)]
    pub uri: Option<String>,

    /// Username for authentication [default: admin]
    #[arg(long)]
    pub username: Option<String>,

    /// Password for authentication [default: changeme]
    #[arg(long)]
    pub password: Option<String>,

    /// Earliest time for the search
    #[arg(long, default_value = "-24h", allow_hyphen_values = true)]
    pub earliest_time: String,

    /// Latest time for the search
    #[arg(long, default_value = "now", allow_hyphen_values = true)]
    pub latest_time: String,

    /// Print each result, or only the summary line
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub print: bool,

    /// Print rows as JSON objects
    #[arg(long)]
    pub json: bool,

    /// TOML file with connection settings; flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Accept self-signed TLS certificates
    #[arg(long)]
    pub insecure: bool,

    /// Rows buffered between the network and the printer
    #[arg(long)]
    pub queue_capacity: Option<usize>,
}

impl Args {
    /// The search text and field list, or the message for the first missing one.
    pub fn required(&self) -> std::result::Result<(String, Vec<String>), String> {
        let search = self
            .search
            .clone()
            .ok_or_else(|| "Missing required argument: search".to_string())?;
        let fields = self
            .field_list
            .as_deref()
            .map(decode_field_list)
            .ok_or_else(|| "Missing required argument: field_list".to_string())?;
        Ok((search, fields))
    }

    /// Connection settings: the config file (or defaults) with flags on top.
    pub fn service_config(&self) -> Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::load(path)?,
            None => ServiceConfig::default(),
        };
        if let Some(uri) = &self.uri {
            config.uri = uri.clone();
        }
        if let Some(username) = &self.username {
            config.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if self.insecure {
            config.accept_invalid_certs = true;
        }
        Ok(config)
    }

    pub fn search_request(&self, search: String, fields: Vec<String>) -> Result<SearchRequest> {
        Ok(SearchRequest::new(search)?
            .earliest(self.earliest_time.clone())
            .latest(self.latest_time.clone())
            .fields(fields))
    }
}

/// `field=value` lines for one row, followed by a blank line.
pub fn format_row(schema: Option<&Schema>, row: &ResultRow) -> String {
    let mut out = String::new();
    for (i, value) in row.values().iter().enumerate() {
        let name = schema
            .and_then(|s| s.fields().get(i))
            .map(String::as_str)
            .unwrap_or("?");
        out.push_str(name);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// One row as a JSON object keyed by field name.
pub fn row_to_json(schema: Option<&Schema>, row: &ResultRow) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (i, value) in row.values().iter().enumerate() {
        let name = schema
            .and_then(|s| s.fields().get(i).cloned())
            .unwrap_or_else(|| format!("_{i}"));
        map.insert(name, serde_json::Value::String(value.clone()));
    }
    serde_json::Value::Object(map)
}
