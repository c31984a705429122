use std::path::Path;
use std::str::FromStr;

use rand::RngCore;
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawSettings;
use crate::settings::Settings;

/// Resolve settings: defaults, then the YAML file at `path` (when given),
/// then `HIVE_*` environment variables. Generates an admin key when none was
/// supplied by either source.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let raw = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|e| ConfigError::Io {
                path: p.display().to_string(),
                source: e,
            })?;
            debug!("loading settings from {}", p.display());
            serde_yaml::from_str::<RawSettings>(&content).map_err(|e| ConfigError::YamlParse {
                path: p.display().to_string(),
                source: e,
            })?
        }
        None => RawSettings::default(),
    };

    let mut settings = apply_raw(Settings::default(), raw);
    apply_env(&mut settings, |key| std::env::var(key).ok())?;

    if settings.admin_key.is_empty() {
        settings.admin_key = generate_admin_key();
        settings.admin_key_generated = true;
    }

    Ok(settings)
}

fn apply_raw(mut s: Settings, raw: RawSettings) -> Settings {
    macro_rules! take {
        ($field:ident) => {
            if let Some(v) = raw.$field {
                s.$field = v;
            }
        };
    }
    take!(public_port);
    take!(admin_port);
    take!(admin_key);
    take!(orchestrator_name);
    take!(state_dir);
    take!(log_dir);
    take!(payload_dir);
    take!(release_dir);
    take!(reclaim_offline_minutes);
    take!(reclaim_lease_seconds);
    take!(probe_interval_seconds);
    take!(min_consecutive_failures);
    take!(min_failure_window_seconds);
    take!(max_prefetch_per_drone);
    take!(max_failures);
    take!(grounding_timeout_seconds);
    take!(failure_age_seconds);
    take!(ssh_connect_timeout_seconds);
    take!(ssh_op_timeout_seconds);
    take!(request_deadline_seconds);
    take!(history_retention_days);
    s
}

/// Apply `HIVE_*` overrides via an injected lookup so tests can drive it
/// without touching the process environment.
pub(crate) fn apply_env(
    s: &mut Settings,
    get: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    fn parse_into<T: FromStr>(
        key: &str,
        value: String,
        field: &mut T,
    ) -> Result<(), ConfigError> {
        *field = value.parse::<T>().map_err(|_| ConfigError::EnvParse {
            key: key.to_string(),
            value,
        })?;
        Ok(())
    }

    macro_rules! env_num {
        ($key:literal, $field:ident) => {
            if let Some(v) = get($key) {
                parse_into($key, v, &mut s.$field)?;
            }
        };
    }
    macro_rules! env_str {
        ($key:literal, $field:ident) => {
            if let Some(v) = get($key) {
                s.$field = v.into();
            }
        };
    }

    env_num!("HIVE_PUBLIC_PORT", public_port);
    env_num!("HIVE_ADMIN_PORT", admin_port);
    env_str!("HIVE_ADMIN_KEY", admin_key);
    env_str!("HIVE_ORCHESTRATOR_NAME", orchestrator_name);
    env_str!("HIVE_STATE_DIR", state_dir);
    env_str!("HIVE_LOG_DIR", log_dir);
    env_str!("HIVE_PAYLOAD_DIR", payload_dir);
    env_str!("HIVE_RELEASE_DIR", release_dir);
    env_num!("HIVE_RECLAIM_OFFLINE_MINUTES", reclaim_offline_minutes);
    env_num!("HIVE_RECLAIM_LEASE_SECONDS", reclaim_lease_seconds);
    env_num!("HIVE_PROBE_INTERVAL_SECONDS", probe_interval_seconds);
    env_num!("HIVE_MIN_CONSECUTIVE_FAILURES", min_consecutive_failures);
    env_num!("HIVE_MIN_FAILURE_WINDOW_SECONDS", min_failure_window_seconds);
    env_num!("HIVE_MAX_PREFETCH_PER_DRONE", max_prefetch_per_drone);
    env_num!("HIVE_MAX_FAILURES", max_failures);
    env_num!("HIVE_GROUNDING_TIMEOUT_SECONDS", grounding_timeout_seconds);
    env_num!("HIVE_FAILURE_AGE_SECONDS", failure_age_seconds);
    env_num!("HIVE_SSH_CONNECT_TIMEOUT_SECONDS", ssh_connect_timeout_seconds);
    env_num!("HIVE_SSH_OP_TIMEOUT_SECONDS", ssh_op_timeout_seconds);
    env_num!("HIVE_REQUEST_DEADLINE_SECONDS", request_deadline_seconds);
    env_num!("HIVE_HISTORY_RETENTION_DAYS", history_retention_days);

    Ok(())
}

fn generate_admin_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Create the state, log and cache directories if missing.
pub fn ensure_dirs(settings: &Settings) -> Result<(), ConfigError> {
    for dir in [
        &settings.state_dir,
        &settings.log_dir,
        &settings.payload_dir,
        &settings.release_dir,
    ] {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
    }
    Ok(())
}
