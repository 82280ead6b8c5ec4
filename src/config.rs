use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

use crate::error::WidgetError;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub chatbot_api_url: String,
    pub chatbot_timeout: Duration,
    /// How long a widget without a realtime client may sit unused before it
    /// is unmounted.
    pub widget_idle_ttl: Duration,
}

impl Config {
    /// Reads configuration from the environment, after loading `.env` if present.
    pub fn load() -> Result<Self, WidgetError> {
        if dotenvy::dotenv().is_ok() {
            info!("Loaded environment from .env");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WidgetError> {
        let chatbot_api_url = try_load::<String>(&lookup, "CHATBOT_API_URL", "http://localhost:5000")?
            .trim_end_matches('/')
            .to_string();
        if chatbot_api_url.is_empty() {
            return Err(WidgetError::Config {
                key: "CHATBOT_API_URL",
                reason: "must not be empty".to_string(),
            });
        }

        let widget_idle_ttl = Duration::from_secs(try_load(&lookup, "WIDGET_IDLE_TTL_SECS", "1800")?);
        if widget_idle_ttl.is_zero() {
            return Err(WidgetError::Config {
                key: "WIDGET_IDLE_TTL_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            port: try_load(&lookup, "PORT", "4000")?,
            chatbot_api_url,
            chatbot_timeout: Duration::from_millis(try_load(&lookup, "CHATBOT_TIMEOUT_MS", "10000")?),
            widget_idle_ttl,
        })
    }
}

fn try_load<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<T, WidgetError>
where
    T::Err: Display,
{
    let raw = lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        });

    raw.parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        WidgetError::Config {
            key,
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).expect("defaults are valid");
        assert_eq!(config.port, 4000);
        assert_eq!(config.chatbot_api_url, "http://localhost:5000");
        assert_eq!(config.chatbot_timeout, Duration::from_secs(10));
        assert_eq!(config.widget_idle_ttl, Duration::from_secs(1800));
    }

    #[test]
    fn values_are_read_and_trimmed() {
        let config = Config::from_lookup(lookup_from(&[
            ("PORT", " 8080 "),
            ("CHATBOT_API_URL", "https://forum.example.edu/"),
            ("CHATBOT_TIMEOUT_MS", "2500"),
            ("WIDGET_IDLE_TTL_SECS", "60"),
        ]))
        .expect("valid config");

        assert_eq!(config.port, 8080);
        assert_eq!(config.chatbot_api_url, "https://forum.example.edu");
        assert_eq!(config.chatbot_timeout, Duration::from_millis(2500));
        assert_eq!(config.widget_idle_ttl, Duration::from_secs(60));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup_from(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, WidgetError::Config { key: "PORT", .. }));

        let err = Config::from_lookup(lookup_from(&[("CHATBOT_API_URL", "///")])).unwrap_err();
        assert!(matches!(err, WidgetError::Config { key: "CHATBOT_API_URL", .. }));

        let err = Config::from_lookup(lookup_from(&[("WIDGET_IDLE_TTL_SECS", "0")])).unwrap_err();
        assert!(matches!(err, WidgetError::Config { key: "WIDGET_IDLE_TTL_SECS", .. }));
    }
}
