pub mod backup;
pub mod config;
pub mod query;
pub mod schema;
pub mod status;
pub mod switch;

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Output format shared by every command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty table with borders (default)
    #[default]
    Table,
    /// Markdown table format
    Markdown,
    /// Compact JSON
    Json,
    /// Pretty-printed JSON with indentation
    JsonPretty,
}

impl OutputFormat {
    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json | Self::JsonPretty)
    }

    pub fn all_names() -> &'static [&'static str] {
        &["table", "markdown", "json", "json-pretty"]
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Markdown => write!(f, "markdown"),
            Self::Json => write!(f, "json"),
            Self::JsonPretty => write!(f, "json-pretty"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" | "pretty" => Ok(Self::Table),
            "markdown" | "md" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            "json-pretty" | "jsonpretty" => Ok(Self::JsonPretty),
            _ => Err(format!(
                "Unknown output format '{}'. Valid formats: {}",
                s,
                Self::all_names().join(", ")
            )),
        }
    }
}

/// Print `value` as JSON; only valid for the JSON formats
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T, output_format: OutputFormat) {
    let rendered = match output_format {
        OutputFormat::JsonPretty => serde_json::to_string_pretty(value),
        _ => serde_json::to_string(value),
    };
    match rendered {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("ERROR: Failed to serialize to JSON: {}", e),
    }
}

/// Print rows as a table, or the serializable form for JSON formats
pub(crate) fn print_rows<T, I>(rows: I, output_format: OutputFormat)
where
    T: Tabled + Serialize,
    I: IntoIterator<Item = T>,
{
    let rows: Vec<T> = rows.into_iter().collect();
    match output_format {
        OutputFormat::Table => println!("{}", Table::new(&rows).with(Style::rounded())),
        OutputFormat::Markdown => println!("{}", Table::new(&rows).with(Style::markdown())),
        OutputFormat::Json | OutputFormat::JsonPretty => print_json(&rows, output_format),
    }
}

/// Print an error and exit with status 1
pub(crate) fn fail(message: impl fmt::Display) -> ! {
    eprintln!("ERROR: {}", message);
    std::process::exit(1);
}
