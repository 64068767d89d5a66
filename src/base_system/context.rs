//! 全局配置（`Config`）及其默认值。
//!
//! 同时提供生成带注释 `config.yml` 所需的字段元数据。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigError, ConfigSpec, FieldMeta};
use super::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Scheduling
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: f64,
    #[serde(default = "default_image_delay_ms")]
    pub image_delay_ms: u64,

    // Network
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_min_wait_time")]
    pub min_wait_time: u64,
    #[serde(default = "default_max_wait_time")]
    pub max_wait_time: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,

    // Output
    #[serde(default = "default_save_path")]
    pub save_path: String,
    #[serde(default = "default_blocked_image_keywords")]
    pub blocked_image_keywords: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            delay_seconds: default_delay_seconds(),
            image_delay_ms: default_image_delay_ms(),
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            min_wait_time: default_min_wait_time(),
            max_wait_time: default_max_wait_time(),
            user_agent: default_user_agent(),
            base_url: default_base_url(),
            save_path: default_save_path(),
            blocked_image_keywords: default_blocked_image_keywords(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 11] = [
            FieldMeta {
                name: "max_workers",
                description: "Number of chapters downloaded in parallel",
            },
            FieldMeta {
                name: "delay_seconds",
                description: "Minimum gap between two chapter starts, in seconds",
            },
            FieldMeta {
                name: "image_delay_ms",
                description: "Pause before each image request inside a chapter, in ms",
            },
            FieldMeta {
                name: "request_timeout",
                description: "Request timeout (seconds)",
            },
            FieldMeta {
                name: "max_retries",
                description: "Attempts per request before giving up",
            },
            FieldMeta {
                name: "min_wait_time",
                description: "First retry backoff, in ms (doubles on each attempt)",
            },
            FieldMeta {
                name: "max_wait_time",
                description: "Upper bound for the retry backoff, in ms",
            },
            FieldMeta {
                name: "user_agent",
                description: "User-Agent header sent with every request",
            },
            FieldMeta {
                name: "base_url",
                description: "Site root used to build chapter list URLs",
            },
            FieldMeta {
                name: "save_path",
                description: "Output root directory",
            },
            FieldMeta {
                name: "blocked_image_keywords",
                description: "Image URLs containing any of these words are skipped (site chrome, not pages)",
            },
        ];
        &FIELDS
    }
}

impl Config {
    pub fn default_save_dir(&self) -> PathBuf {
        if self.save_path.trim().is_empty() {
            PathBuf::from(default_save_path())
        } else {
            PathBuf::from(&self.save_path)
        }
    }

    pub fn chapter_start_delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_seconds.max(0.0))
    }

    pub fn image_delay(&self) -> Duration {
        Duration::from_millis(self.image_delay_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            min_wait: Duration::from_millis(self.min_wait_time),
            max_wait: Duration::from_millis(self.max_wait_time.max(self.min_wait_time)),
        }
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.delay_seconds.is_finite() || self.delay_seconds < 0.0 {
            return Err(ConfigError::Validation(format!(
                "delay_seconds must be a non-negative number, got {}",
                self.delay_seconds
            )));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Validation(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.request_timeout == 0 {
            return Err(ConfigError::Validation(
                "request_timeout must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_delay_seconds() -> f64 {
    1.0
}

fn default_image_delay_ms() -> u64 {
    200
}

fn default_request_timeout() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_min_wait_time() -> u64 {
    1000
}

fn default_max_wait_time() -> u64 {
    8000
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120 Safari/537.36".to_string()
}

fn default_base_url() -> String {
    "https://weebcentral.com".to_string()
}

fn default_save_path() -> String {
    "downloads".to_string()
}

fn default_blocked_image_keywords() -> Vec<String> {
    ["avatar", "icon", "logo", "banner", "brand"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
