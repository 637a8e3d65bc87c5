use std::collections::BTreeMap;

use chrono::Utc;
use chrono_tz::Tz;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::ServingConfig;

pub struct ServeLayer {
    pub app: String,
    pub log_type: String,
    pub log_format: String,
    pub tz: String,
    pub level: Option<String>,
}

/// Installs a [`ServeLayer`] as the global subscriber. Returns false when one was already set.
pub fn init_tracing(app: &str, config: &ServingConfig) -> bool {
    tracing_subscriber::registry()
        .with(ServeLayer {
            app: app.to_string(),
            log_type: "general".to_string(),
            log_format: config.log_format.clone(),
            tz: config.timezone.clone(),
            level: Some(config.log_level.clone()),
        })
        .try_init()
        .is_ok()
}

pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

impl ServeLayer {
    fn timestamp(&self) -> String {
        // unknown zones log in UTC
        let now = Utc::now();
        match self.tz.parse::<Tz>() {
            Ok(tz) => now.with_timezone(&tz).format("%Y-%m-%dT%H:%M:%S").to_string(),
            Err(_) => now.format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }

    fn render(
        &self,
        ts: String,
        metadata: &tracing::Metadata<'_>,
        mut fields: BTreeMap<String, serde_json::Value>,
    ) -> Option<String> {
        let msg = match fields.remove("message") {
            Some(serde_json::Value::String(msg)) => msg,
            Some(other) => other.to_string(),
            None => "".to_string(),
        };

        match self.log_format.as_str() {
            "json" => {
                let output = serde_json::json!({
                    "_TS_": ts,
                    "_MSM_": msg,
                    "_LEVEL_": metadata.level().as_str(),
                    "_CALLER_": metadata.name(),
                    "_FIELDS_": fields,
                    "_APP_": self.app.clone(),
                    "_TYPE_": self.log_type.clone(),
                });
                serde_json::to_string(&output).ok()
            }
            "text" => {
                let extra = fields
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(" ");
                Some(format!(
                    "{} [{}] {} {} -- {}",
                    ts,
                    metadata.level().as_str(),
                    msg,
                    extra,
                    metadata.target(),
                ))
            }
            _ => None,
        }
    }
}

impl<S> Layer<S> for ServeLayer
where
    S: tracing::Subscriber,
{
    fn max_level_hint(&self) -> Option<LevelFilter> {
        self.level.as_deref().and_then(parse_level)
    }

    fn enabled(
        &self,
        metadata: &tracing::Metadata<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) -> bool {
        match self.level.as_deref().and_then(parse_level) {
            Some(filter) => metadata.level() <= &filter,
            None => true,
        }
    }

    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut fields = BTreeMap::new();
        let mut visitor = JsonVisitor(&mut fields);
        event.record(&mut visitor);

        if let Some(line) = self.render(self.timestamp(), event.metadata(), fields) {
            println!("{}", line);
        }
    }
}

struct JsonVisitor<'a>(&'a mut BTreeMap<String, serde_json::Value>);

impl<'a> tracing::field::Visit for JsonVisitor<'a> {
    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.0
            .insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0
            .insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0
            .insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0
            .insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0
            .insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_error(
        &mut self,
        field: &tracing::field::Field,
        value: &(dyn std::error::Error + 'static),
    ) {
        self.0.insert(
            field.name().to_string(),
            serde_json::json!(value.to_string()),
        );
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(
            field.name().to_string(),
            serde_json::json!(format!("{:?}", value)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("warn"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_unknown_timezone_falls_back() {
        let layer = ServeLayer {
            app: "test".to_string(),
            log_type: "general".to_string(),
            log_format: "text".to_string(),
            tz: "Mars/Olympus".to_string(),
            level: None,
        };
        assert_eq!(layer.timestamp().len(), "2024-01-01T00:00:00".len());
    }
}
