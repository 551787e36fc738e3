//! Console log format for mq-node.
//!
//! Lines look like `[timestamp] [mq-component] [level] message key=value`,
//! with fixed-width columns so output from several nodes lines up.

use std::fmt::{self, Write as _};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const RESET: &str = "\x1b[0m";
const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[93m";
const RED: &str = "\x1b[91m";
const GRAY: &str = "\x1b[90m";

const NAME_WIDTH: usize = 20;
const LEVEL_WIDTH: usize = 9;

/// Tag an info event with a component name
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Tag a warning with a component name
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Tag a debug event with a component name
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Tag an error with a component name
#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// Event formatter producing the fixed-width node log line
pub struct MqLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl MqLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    #[cfg(test)]
    fn plain(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            color_enabled: false,
        }
    }

    fn column_name(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("mq-{}", component),
            None => self.service_name.clone(),
        };
        if name.chars().count() > NAME_WIDTH {
            let head: String = name.chars().take(NAME_WIDTH - 1).collect();
            format!("{}…", head)
        } else {
            format!("{:<width$}", name, width = NAME_WIDTH)
        }
    }

    fn level_style(&self, level: &Level) -> (&'static str, &'static str) {
        let (label, color) = match *level {
            Level::ERROR => ("✗ ERROR", RED),
            Level::WARN => ("⚠ WARN", YELLOW),
            Level::INFO => ("ℹ INFO", GREEN),
            Level::DEBUG => ("◦ DEBUG", GRAY),
            Level::TRACE => ("◦ TRACE", GRAY),
        };
        (label, if self.color_enabled { color } else { "" })
    }

    fn paint(&self, color: &'static str) -> &'static str {
        if self.color_enabled {
            color
        } else {
            ""
        }
    }
}

impl<S, N> FormatEvent<S, N> for MqLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut fields = EventFields::default();
        event.record(&mut fields);

        let (label, color) = self.level_style(level);
        write!(
            writer,
            "{}[{}] [{}] [{}{:<width$}{}] ",
            self.paint(CYAN),
            timestamp,
            self.column_name(fields.component.as_deref()),
            color,
            label,
            self.paint(RESET),
            width = LEVEL_WIDTH,
        )?;
        writeln!(writer, "{}{}", fields.message, fields.extra)
    }
}

/// Collects the message, the component tag and any remaining fields
#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
    extra: String,
}

impl tracing::field::Visit for EventFields {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => {
                let _ = write!(self.extra, " {}={}", name, value);
            }
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "component" => {
                self.component = Some(format!("{:?}", value).trim_matches('"').to_string())
            }
            name => {
                let _ = write!(self.extra, " {}={:?}", name, value);
            }
        }
    }
}

fn is_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_column_is_prefixed_and_padded() {
        let formatter = MqLogFormatter::plain("mq-node");
        let column = formatter.column_name(Some("rpc"));
        assert_eq!(column.len(), NAME_WIDTH);
        assert!(column.starts_with("mq-rpc "));

        assert!(formatter.column_name(None).starts_with("mq-node"));
    }

    #[test]
    fn test_long_names_are_truncated() {
        let formatter = MqLogFormatter::plain("mq-node");
        let column = formatter.column_name(Some("a-very-long-component-name"));
        assert_eq!(column.chars().count(), NAME_WIDTH);
        assert!(column.ends_with('…'));
    }

    #[test]
    fn test_plain_output_has_no_escape_codes() {
        let formatter = MqLogFormatter::plain("mq-node");
        let (label, color) = formatter.level_style(&Level::WARN);
        assert_eq!(label, "⚠ WARN");
        assert!(color.is_empty());
        assert!(formatter.paint(CYAN).is_empty());
    }
}
