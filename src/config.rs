use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// Process configuration, read from `LEASEMQ_*` environment variables.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub queue: Option<String>,
    pub visibility_timeout_seconds: Option<u64>,
    pub delay_seconds: Option<u64>,
    pub dead_letter_queue: Option<String>,
    pub max_retries: Option<u32>,
    pub clean_interval_seconds: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        envy::prefixed("LEASEMQ_")
            .from_env::<Self>()
            .map_err(|e| Error::configuration(e.to_string()))
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or("leasemq.db")
    }

    pub fn queue(&self) -> &str {
        self.queue.as_deref().unwrap_or("default")
    }

    pub fn visibility(&self) -> Option<Duration> {
        self.visibility_timeout_seconds.map(Duration::from_secs)
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay_seconds.map(Duration::from_secs)
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_interval_seconds.unwrap_or(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.db_path(), "leasemq.db");
        assert_eq!(config.queue(), "default");
        assert_eq!(config.visibility(), None);
        assert_eq!(config.clean_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_vars() {
        let vars = [
            ("LEASEMQ_QUEUE".to_owned(), "emails".to_owned()),
            ("LEASEMQ_VISIBILITY_TIMEOUT_SECONDS".to_owned(), "45".to_owned()),
            ("LEASEMQ_DEAD_LETTER_QUEUE".to_owned(), "emails-dead".to_owned()),
            ("LEASEMQ_MAX_RETRIES".to_owned(), "3".to_owned()),
        ];

        let config: Config = envy::prefixed("LEASEMQ_").from_iter(vars).unwrap();

        assert_eq!(config.queue(), "emails");
        assert_eq!(config.visibility(), Some(Duration::from_secs(45)));
        assert_eq!(config.dead_letter_queue.as_deref(), Some("emails-dead"));
        assert_eq!(config.max_retries, Some(3));
    }

    #[test]
    fn test_bad_value() {
        let vars = [("LEASEMQ_MAX_RETRIES".to_owned(), "many".to_owned())];

        assert!(envy::prefixed("LEASEMQ_").from_iter::<_, Config>(vars).is_err());
    }
}
