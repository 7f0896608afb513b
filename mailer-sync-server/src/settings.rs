use config::{Config, File};
use mailer_sync_logic::settings::SyncSettings;
use serde::{de::IgnoredAny, Deserialize};
use std::{net::SocketAddr, str::FromStr};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    pub addr: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from_str("0.0.0.0:8050").expect("should be valid addr"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSettings {
    pub url: String,
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

fn default_run_migrations() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSettings {
    /// Token presented by internal self-invocations (the service role).
    pub service_token: Option<String>,
    /// CRM endpoint that resolves a user credential to an account and
    /// role; without it only the service token is accepted.
    pub credentials_url: Option<url::Url>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub sync: SyncSettings,
    #[serde(default)]
    pub auth: AuthSettings,

    // Is required as we deny unknown fields, but allow users provide
    // path to config through MAILER_SYNC__CONFIG env variable. If removed,
    // the setup would fail with `unknown field `config`, expected one of...`
    #[serde(default, rename = "config")]
    pub config_path: IgnoredAny,
}

impl Settings {
    pub fn new() -> anyhow::Result<Self> {
        let config_path = std::env::var("MAILER_SYNC__CONFIG");

        let mut builder = Config::builder();
        if let Ok(config_path) = config_path {
            builder = builder.add_source(File::with_name(&config_path));
        };
        let environment = config::Environment::with_prefix("MAILER_SYNC")
            .try_parsing(true)
            .separator("__");
        builder = builder.add_source(environment);

        let settings: Settings = builder.build()?.try_deserialize()?;

        Ok(settings)
    }
}
