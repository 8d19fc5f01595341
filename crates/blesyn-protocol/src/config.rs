use std::path::PathBuf;
use std::time::Duration;

use blesyn_core::{CharacteristicId, CoreError, Message, ServiceId, DEFAULT_OUTBOUND_TEXT};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::service::RunnerConfig;

pub const DEFAULT_LOCAL_NAME: &str = "SYN Message";

#[derive(Debug, Error)]
pub enum HandshakeConfigError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identifier(#[from] CoreError),
}

/// Handshake settings as loaded from defaults, an optional file and
/// `BLESYN_*` environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct HandshakeConfig {
    pub service_id: String,
    pub characteristic_id: String,
    pub local_name: String,
    pub outbound_text: String,
    #[serde(default, with = "humantime_serde")]
    pub phase_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    pub max_ticks: u64,
}

impl HandshakeConfig {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, HandshakeConfigError> {
        let mut builder = Config::builder()
            .set_default("service_id", "180D")?
            .set_default("characteristic_id", "2A37")?
            .set_default("local_name", DEFAULT_LOCAL_NAME)?
            .set_default("outbound_text", DEFAULT_OUTBOUND_TEXT)?
            .set_default("tick_interval", "50ms")?
            .set_default("max_ticks", 2000)?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // .env files feed the BLESYN_ environment source below.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("BLESYN").try_parsing(true));

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn service(&self) -> Result<ServiceId, CoreError> {
        self.service_id.parse()
    }

    pub fn characteristic(&self) -> Result<CharacteristicId, CoreError> {
        self.characteristic_id.parse()
    }

    /// Resolves identifiers into the settings both protocols run with.
    pub fn settings(&self) -> Result<ProtocolSettings, HandshakeConfigError> {
        Ok(ProtocolSettings {
            service: self.service()?,
            characteristic: self.characteristic()?,
            local_name: self.local_name.clone(),
            outbound_text: Message::outbound(&self.outbound_text),
            phase_timeout: self.phase_timeout,
        })
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            tick_interval: self.tick_interval,
            max_ticks: self.max_ticks,
        }
    }
}

/// Resolved per-session parameters shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSettings {
    pub service: ServiceId,
    pub characteristic: CharacteristicId,
    /// Advertised local name; responder only.
    pub local_name: String,
    /// Data the responder serves once the handshake completes.
    pub outbound_text: Message,
    pub phase_timeout: Option<Duration>,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            service: ServiceId::default(),
            characteristic: CharacteristicId::default(),
            local_name: DEFAULT_LOCAL_NAME.to_string(),
            outbound_text: Message::outbound(DEFAULT_OUTBOUND_TEXT),
            phase_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<F>(vars: &[(&str, &str)], test: F)
    where
        F: FnOnce(),
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut old = Vec::new();
        for (k, v) in vars {
            old.push((k.to_string(), env::var(k).ok()));
            env::set_var(k, v);
        }

        test();

        for (k, maybe_old) in old {
            match maybe_old {
                Some(val) => env::set_var(k, val),
                None => env::remove_var(k),
            }
        }
    }

    #[test]
    fn defaults_are_applied() {
        with_env(&[], || {
            let cfg = HandshakeConfig::load(None).expect("failed to build config");

            assert_eq!(cfg.service_id, "180D");
            assert_eq!(cfg.characteristic_id, "2A37");
            assert_eq!(cfg.local_name, "SYN Message");
            assert_eq!(cfg.outbound_text, "hello world");
            assert_eq!(cfg.phase_timeout, None);
            assert_eq!(cfg.tick_interval, Duration::from_millis(50));
            assert_eq!(cfg.max_ticks, 2000);

            let settings = cfg.settings().expect("settings");
            assert_eq!(settings, ProtocolSettings::default());
        });
    }

    #[test]
    fn env_vars_override_defaults() {
        with_env(
            &[
                ("BLESYN_SERVICE_ID", "FFE0"),
                ("BLESYN_OUTBOUND_TEXT", "ping"),
                ("BLESYN_PHASE_TIMEOUT", "30s"),
                ("BLESYN_MAX_TICKS", "10"),
            ],
            || {
                let cfg = HandshakeConfig::load(None).expect("failed to build config");
                assert_eq!(
                    cfg.service().expect("service"),
                    ServiceId::from_short(0xFFE0)
                );
                assert_eq!(cfg.phase_timeout, Some(Duration::from_secs(30)));
                assert_eq!(cfg.max_ticks, 10);

                let settings = cfg.settings().expect("settings");
                assert_eq!(settings.outbound_text, Message::Data("ping".into()));
            },
        );
    }

    #[test]
    fn empty_outbound_text_falls_back_to_default() {
        with_env(&[("BLESYN_OUTBOUND_TEXT", "")], || {
            let cfg = HandshakeConfig::load(None).expect("failed to build config");
            let settings = cfg.settings().expect("settings");
            assert_eq!(settings.outbound_text, Message::Data("hello world".into()));
        });
    }

    #[test]
    fn file_values_are_layered_under_env() {
        use std::io::Write;

        let mut tmp = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            tmp,
            r#"
local_name = "bench rig"
characteristic_id = "0000beef-0000-1000-8000-00805f9b34fb"
tick_interval = "5ms"
max_ticks = 77
"#
        )
        .expect("write to temp file");

        with_env(&[("BLESYN_MAX_TICKS", "88")], || {
            let path = PathBuf::from(tmp.path());
            let cfg = HandshakeConfig::load(Some(path)).expect("load config");
            assert_eq!(cfg.local_name, "bench rig");
            assert_eq!(
                cfg.characteristic().expect("characteristic"),
                CharacteristicId::from_short(0xBEEF)
            );
            assert_eq!(cfg.max_ticks, 88);
            assert_eq!(cfg.runner().tick_interval, Duration::from_millis(5));
        });
    }

    #[test]
    fn bad_identifier_is_reported() {
        with_env(&[("BLESYN_SERVICE_ID", "not-a-uuid")], || {
            let cfg = HandshakeConfig::load(None).expect("failed to build config");
            let err = cfg.settings().expect_err("identifier should not parse");
            assert!(matches!(err, HandshakeConfigError::Identifier(_)));
        });
    }
}
