//! Environment-driven configuration (spec §6.4, SPEC_FULL §0.3).
//!
//! Malformed values are a startup error, not a silent fallback, matching the
//! original `_parse_non_negative_int`/`_parse_bool01` behavior.

use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::retention::RetentionPolicy;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub db_path: String,
    pub bind_addr: String,
    pub gateway_directory_file: Option<String>,
    pub session_ttl_s: u64,
    pub ws_ping_interval_s: u64,
    pub ws_ping_miss_limit: u32,
    pub outbound_queue_capacity: usize,
    pub request_timeout_s: u64,

    pub retention: RetentionPolicy,

    pub conv_sends_per_min: u32,
    pub social_publishes_per_min: u32,
    pub dms_creates_per_min: u32,
    pub max_env_b64_len: usize,
    pub max_social_event_bytes: usize,
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_non_negative_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) if raw.is_empty() => Ok(default),
        Ok(raw) => {
            let parsed: i64 = raw
                .parse()
                .with_context(|| format!("{name} must be an integer"))?;
            if parsed < 0 {
                bail!("{name} must be non-negative");
            }
            Ok(parsed as u64)
        },
    }
}

fn parse_non_negative_usize(name: &str, default: usize) -> Result<usize> {
    Ok(parse_non_negative_u64(name, default as u64)? as usize)
}

fn parse_bool01(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) if raw.is_empty() => Ok(default),
        Ok(raw) if raw == "0" => Ok(false),
        Ok(raw) if raw == "1" => Ok(true),
        Ok(_) => bail!("{name} must be 0 or 1"),
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let retention = RetentionPolicy {
            max_events_per_conv: parse_non_negative_u64("GATEWAY_RETENTION_MAX_EVENTS_PER_CONV", 0)?,
            max_age_s: parse_non_negative_u64("GATEWAY_RETENTION_MAX_AGE_S", 0)?,
            sweep_interval_s: parse_non_negative_u64("GATEWAY_RETENTION_SWEEP_INTERVAL_S", 60)?
                .max(1),
            cursor_stale_after_s: parse_non_negative_u64("GATEWAY_CURSOR_STALE_AFTER_S", 0)?,
            hard_limits: parse_bool01("GATEWAY_RETENTION_HARD_LIMITS", false)?,
        };

        Ok(Self {
            db_path: env_string("GATEWAY_DB_PATH", "gateway.db"),
            bind_addr: env_string("GATEWAY_BIND_ADDR", "0.0.0.0:8080"),
            gateway_directory_file: std::env::var("GATEWAY_DIRECTORY_FILE").ok(),
            session_ttl_s: parse_non_negative_u64("GATEWAY_SESSION_TTL_S", 3600)?,
            ws_ping_interval_s: parse_non_negative_u64("GATEWAY_WS_PING_INTERVAL_S", 30)?,
            ws_ping_miss_limit: parse_non_negative_u64("GATEWAY_WS_PING_MISS_LIMIT", 2)? as u32,
            outbound_queue_capacity: parse_non_negative_usize(
                "GATEWAY_OUTBOUND_QUEUE_CAPACITY",
                1000,
            )?,
            request_timeout_s: parse_non_negative_u64("GATEWAY_REQUEST_TIMEOUT_S", 5)?,
            retention,
            conv_sends_per_min: parse_non_negative_u64("GATEWAY_CONV_SENDS_PER_MIN", 120)? as u32,
            social_publishes_per_min: parse_non_negative_u64(
                "GATEWAY_SOCIAL_PUBLISHES_PER_MIN",
                30,
            )? as u32,
            dms_creates_per_min: parse_non_negative_u64("GATEWAY_DMS_CREATES_PER_MIN", 20)? as u32,
            max_env_b64_len: parse_non_negative_usize("GATEWAY_MAX_ENV_B64_LEN", 262_144)?,
            max_social_event_bytes: parse_non_negative_usize(
                "GATEWAY_MAX_SOCIAL_EVENT_BYTES",
                65_536,
            )?,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s)
    }

    pub fn ws_ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(unsafe_code)]
    fn parse_bool01_rejects_garbage() {
        // SAFETY: test-only env mutation, no concurrent access in this process.
        unsafe {
            std::env::set_var("TEST_BOOL01_GARBAGE", "yes");
        }
        let result = parse_bool01("TEST_BOOL01_GARBAGE", false);
        unsafe {
            std::env::remove_var("TEST_BOOL01_GARBAGE");
        }
        assert!(result.is_err());
    }

    #[test]
    #[allow(unsafe_code)]
    fn parse_non_negative_rejects_negative() {
        // SAFETY: test-only env mutation, no concurrent access in this process.
        unsafe {
            std::env::set_var("TEST_NONNEG_GARBAGE", "-5");
        }
        let result = parse_non_negative_u64("TEST_NONNEG_GARBAGE", 0);
        unsafe {
            std::env::remove_var("TEST_NONNEG_GARBAGE");
        }
        assert!(result.is_err());
    }

    #[test]
    #[allow(unsafe_code)]
    fn defaults_apply_when_unset() {
        // SAFETY: test-only env mutation, no concurrent access in this process.
        unsafe {
            std::env::remove_var("GATEWAY_RETENTION_SWEEP_INTERVAL_S");
        }
        assert_eq!(
            parse_non_negative_u64("GATEWAY_RETENTION_SWEEP_INTERVAL_S", 60).unwrap(),
            60
        );
    }
}
