use crate::i18n::Locale;
use crate::splitter::DEFAULT_BATCH_SIZE;
use std::{env, path::PathBuf, str::FromStr, time::Duration};
use tracing::warn;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub port: u16,
    pub batch_size: usize,
    pub workers: usize,
    pub max_upload_bytes: usize,
    pub locale: Locale,
    pub attachment_dir: PathBuf,
    pub redis_url: Option<String>,
    pub notify_webhook_url: Option<String>,
    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
    pub metrics_key: Option<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: 4,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            locale: Locale::default(),
            attachment_dir: env::temp_dir().join("hermes-import"),
            redis_url: None,
            notify_webhook_url: None,
            http_timeout: Duration::from_secs(15),
            http_connect_timeout: Duration::from_secs(5),
            metrics_key: None,
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let positive = |key: &str, fallback: usize| {
            parsed::<usize>(text(key), key)
                .filter(|value| *value > 0)
                .unwrap_or(fallback)
        };

        let locale = match text("IMPORT_LOCALE") {
            Some(tag) => Locale::from_tag(&tag).unwrap_or_else(|| {
                warn!(target = "hermes.config", tag = %tag, "unknown IMPORT_LOCALE, using default");
                defaults.locale
            }),
            None => defaults.locale,
        };

        Self {
            port: parsed::<u16>(text("PORT"), "PORT").unwrap_or(defaults.port),
            batch_size: positive("IMPORT_BATCH_SIZE", defaults.batch_size),
            workers: positive("IMPORT_WORKERS", defaults.workers),
            max_upload_bytes: positive("IMPORT_MAX_BYTES", defaults.max_upload_bytes),
            locale,
            attachment_dir: text("ATTACHMENT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.attachment_dir),
            redis_url: text("REDIS_URL"),
            notify_webhook_url: text("NOTIFY_WEBHOOK_URL"),
            http_timeout: parsed::<u64>(text("HTTP_TIMEOUT_SECS"), "HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            http_connect_timeout: parsed::<u64>(
                text("HTTP_CONNECT_TIMEOUT_SECS"),
                "HTTP_CONNECT_TIMEOUT_SECS",
            )
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_connect_timeout),
            metrics_key: text("METRICS_KEY"),
        }
    }
}

fn parsed<T: FromStr>(value: Option<String>, key: &str) -> Option<T> {
    let raw = value?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(target = "hermes.config", key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> ImportConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ImportConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]);
        assert_eq!(config.port, 8000);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_upload_bytes, 20 * 1024 * 1024);
        assert_eq!(config.locale, Locale::De);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn values_are_read_and_bad_ones_ignored() {
        let config = config(&[
            ("PORT", "9100"),
            ("IMPORT_BATCH_SIZE", "0"),
            ("IMPORT_WORKERS", "eight"),
            ("IMPORT_LOCALE", "en"),
            ("REDIS_URL", "  "),
            ("NOTIFY_WEBHOOK_URL", "http://hooks.local/imports"),
            ("HTTP_TIMEOUT_SECS", "30"),
        ]);
        assert_eq!(config.port, 9100);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.workers, 4);
        assert_eq!(config.locale, Locale::En);
        assert!(config.redis_url.is_none());
        assert_eq!(
            config.notify_webhook_url.as_deref(),
            Some("http://hooks.local/imports")
        );
        assert_eq!(config.http_timeout, Duration::from_secs(30));
    }
}
