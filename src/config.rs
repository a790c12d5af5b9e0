//! Process configuration from environment variables

use crate::ids::UserId;
use crate::state_machine::stack::DEFAULT_MAX_DEPTH;
use crate::state_machine::ConvContext;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Per-session knobs shared by every user
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub captcha_timeout: Duration,
    /// A runtime with no pending timers stops after this long without events
    pub idle_timeout: Duration,
    pub max_photos: usize,
    pub max_interrupt_depth: usize,
    pub utc_offset_hours: i32,
    pub default_region: String,
    pub admin_chat_id: Option<UserId>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            captcha_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(1800),
            max_photos: 10,
            max_interrupt_depth: DEFAULT_MAX_DEPTH,
            utc_offset_hours: 3,
            default_region: "minsk".to_string(),
            admin_chat_id: None,
        }
    }
}

impl SessionSettings {
    pub fn context_for(&self, user_id: UserId) -> ConvContext {
        ConvContext {
            user_id,
            max_photos: self.max_photos,
            utc_offset_hours: self.utc_offset_hours,
            default_region: self.default_region.clone(),
            admin_chat_id: self.admin_chat_id,
            ban_reason: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub telegram_token: String,
    pub telegram_api_url: String,
    pub nats_url: String,
    pub event_subject: String,
    pub mail_verifier_url: Option<String>,
    pub geocoder_url: String,
    pub photo_dir: PathBuf,
    pub photo_base_url: Option<String>,
    pub database_path: PathBuf,
    pub session: SessionSettings,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |name: &str, default: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = SessionSettings::default();

        let session = SessionSettings {
            captcha_timeout: Duration::from_secs(parse(
                "CAPTCHA_TIMEOUT_SECS",
                lookup("CAPTCHA_TIMEOUT_SECS"),
                defaults.captcha_timeout.as_secs(),
            )?),
            idle_timeout: Duration::from_secs(parse(
                "SESSION_IDLE_SECS",
                lookup("SESSION_IDLE_SECS"),
                defaults.idle_timeout.as_secs(),
            )?),
            max_photos: parse(
                "MAX_VIOLATION_PHOTOS",
                lookup("MAX_VIOLATION_PHOTOS"),
                defaults.max_photos,
            )?,
            max_interrupt_depth: parse(
                "MAX_INTERRUPT_DEPTH",
                lookup("MAX_INTERRUPT_DEPTH"),
                defaults.max_interrupt_depth,
            )?,
            utc_offset_hours: parse(
                "UTC_OFFSET_HOURS",
                lookup("UTC_OFFSET_HOURS"),
                defaults.utc_offset_hours,
            )?,
            default_region: text("DEFAULT_REGION", &defaults.default_region),
            admin_chat_id: optional("ADMIN_CHAT_ID")
                .map(|v| parse_value("ADMIN_CHAT_ID", &v))
                .transpose()?,
        };
        if !(-12..=14).contains(&session.utc_offset_hours) {
            return Err(ConfigError::Invalid {
                name: "UTC_OFFSET_HOURS",
                value: session.utc_offset_hours.to_string(),
            });
        }

        Ok(Self {
            telegram_token: optional("TELEGRAM_TOKEN").ok_or(ConfigError::Missing("TELEGRAM_TOKEN"))?,
            telegram_api_url: text("TELEGRAM_API_URL", "https://api.telegram.org"),
            nats_url: text("NATS_URL", "nats://127.0.0.1:4222"),
            event_subject: text("EVENT_SUBJECT", "parkun.events"),
            mail_verifier_url: optional("MAIL_VERIFIER_URL"),
            geocoder_url: text("GEOCODER_URL", "https://nominatim.openstreetmap.org"),
            photo_dir: PathBuf::from(text("PHOTO_DIR", "/tmp/parkun-photos")),
            photo_base_url: optional("PHOTO_BASE_URL"),
            database_path: PathBuf::from(text("DATABASE_PATH", "/tmp/parkun/parkun.db")),
            session,
        })
    }
}

fn parse_value<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

fn parse<T: FromStr>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => parse_value(name, &v),
        _ => Ok(default),
    }
}
