use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use tabled::builder::Builder;
use tabled::settings::Style;

use crate::cli::OutputFormat;

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a flat struct either as a two-column table or as JSON.
pub fn print_record<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(value),
        OutputFormat::Table => {
            let json = serde_json::to_value(value)?;
            let mut builder = Builder::default();
            builder.push_record(["Field", "Value"]);
            if let Some(fields) = json.as_object() {
                for (name, v) in fields {
                    builder.push_record([name.clone(), display_scalar(v)]);
                }
            }
            let table = builder.build().with(Style::rounded()).to_string();
            println!("{table}");
            Ok(())
        }
    }
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "!".yellow(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

fn display_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "-".to_string(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => format!("{f:.2}"),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_display_scalar() {
        assert_eq!(display_scalar(&json!(null)), "-");
        assert_eq!(display_scalar(&json!("1.00M")), "1.00M");
        assert_eq!(display_scalar(&json!(42)), "42");
        assert_eq!(display_scalar(&json!(66.666)), "66.67");
        assert_eq!(display_scalar(&json!(true)), "true");
    }
}
