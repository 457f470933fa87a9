//! Output formatting for CLI

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use testbed_common::Node;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

impl TableDisplay for Node {
    fn headers() -> Vec<&'static str> {
        vec!["Public", "Private", "SSH"]
    }

    fn row(&self) -> Vec<String> {
        let key = self
            .ssh_key_path
            .as_ref()
            .map(|k| format!(" -i {}", k.display()))
            .unwrap_or_default();
        vec![
            self.public_addr.clone(),
            self.private_addr.clone(),
            format!("{}@{}:{}{}", self.ssh_user, self.public_addr, self.ssh_port, key),
        ]
    }
}

/// Ledger entry
#[derive(Serialize)]
pub struct TagDisplay {
    pub tag: String,
}

impl TableDisplay for TagDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Tag"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.tag.clone()]
    }
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Print a single serializable value; tables fall back to key/value lines
pub fn print_value<T: Serialize>(value: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let mut table = table();
            table.set_header(vec!["Field", "Value"]);
            if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(value) {
                for (key, field) in fields {
                    let text = match field {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Null => "-".to_string(),
                        other => other.to_string(),
                    };
                    table.add_row(vec![key, text]);
                }
            }
            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value).unwrap_or_default());
        }
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No items found.");
                return;
            }
            let mut table = table();
            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }
            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(items).unwrap_or_default());
        }
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}
