use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sqlx::postgres::PgConnectOptions;
use tokio::sync::Mutex;

use crate::err::Error;
use crate::io::{read_io_file, write_io_file};

pub const LOGIN_CONFIG_FILE: &str = "user_login_config.json";
pub const DROPDOWN_OPTIONS_FILE: &str = "dropdown_options.json";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DATABASE: &str = "db_exam_management";
pub const ADMIN_DATABASE: &str = "postgres";

/// Process-wide settings, read once in `main` and handed to whoever needs them.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub config_dir: PathBuf,
    pub bind: SocketAddr,
    pub max_workers: usize,
    pub dashboard_dir: PathBuf,
    pub dashboard_port: u16,
    /// How long a dashboard start waits for its port to open.
    pub dashboard_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("config"),
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            max_workers: 4,
            dashboard_dir: PathBuf::from("shiny_dashboard"),
            dashboard_port: 8050,
            dashboard_timeout: Duration::from_secs(10),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();
        if let Some(dir) = lookup("EXAM_RECORDS_CONFIG_DIR") {
            config.config_dir = PathBuf::from(dir);
        }
        if let Some(bind) = lookup("EXAM_RECORDS_BIND") {
            config.bind = parse_env("EXAM_RECORDS_BIND", &bind)?;
        }
        if let Some(workers) = lookup("EXAM_RECORDS_MAX_WORKERS") {
            config.max_workers = parse_env("EXAM_RECORDS_MAX_WORKERS", &workers)?;
            if config.max_workers == 0 {
                return Err(Error::config("EXAM_RECORDS_MAX_WORKERS must be at least 1"));
            }
        }
        if let Some(dir) = lookup("EXAM_RECORDS_DASHBOARD_DIR") {
            config.dashboard_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("EXAM_RECORDS_DASHBOARD_PORT") {
            config.dashboard_port = parse_env("EXAM_RECORDS_DASHBOARD_PORT", &port)?;
        }
        if let Some(secs) = lookup("EXAM_RECORDS_DASHBOARD_TIMEOUT_SECS") {
            config.dashboard_timeout =
                Duration::from_secs(parse_env("EXAM_RECORDS_DASHBOARD_TIMEOUT_SECS", &secs)?);
        }
        Ok(config)
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| Error::config(format!("Invalid value `{}` for {}: {}", raw, key, err)))
}

/// Contents of `user_login_config.json`. Keys this crate does not know about
/// (the `_comment*` entries) survive a load/save cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rscript_path: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_database() -> String {
    DEFAULT_DATABASE.to_string()
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortRepr {
        Number(u16),
        Text(String),
    }

    match PortRepr::deserialize(deserializer)? {
        PortRepr::Number(port) => Ok(port),
        PortRepr::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            host: default_host(),
            port: DEFAULT_PORT,
            database: default_database(),
            rscript_path: None,
            extra: Map::new(),
        }
    }
}

impl ConnectionSettings {
    pub fn validate(&self) -> Result<(), Error> {
        if self.username.trim().is_empty() {
            return Err(Error::validation("username", "Please enter a username"));
        }
        if self.host.trim().is_empty() {
            return Err(Error::validation("host", "Please enter a host"));
        }
        if self.port == 0 {
            return Err(Error::validation("port", "Please enter a port"));
        }
        if self.database.trim().is_empty() {
            return Err(Error::validation("database", "Please enter a database name"));
        }
        Ok(())
    }

    /// Resets host, port and database; credentials are kept.
    pub fn restore_defaults(&mut self) {
        self.host = default_host();
        self.port = DEFAULT_PORT;
        self.database = default_database();
    }

    pub fn redacted(&self) -> RedactedSettings {
        RedactedSettings {
            username: self.username.clone(),
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            rscript_path: self.rscript_path.clone(),
            has_password: !self.password.is_empty(),
        }
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        self.options_for(&self.database)
    }

    /// Options for the administrative database, used while the target
    /// database may not exist yet.
    pub fn admin_connect_options(&self) -> PgConnectOptions {
        self.options_for(ADMIN_DATABASE)
    }

    fn options_for(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(database)
    }
}

/// What the front end may see of the connection settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedactedSettings {
    pub username: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub rscript_path: Option<String>,
    pub has_password: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DropdownOptions {
    #[serde(default)]
    pub semesters: Vec<String>,
    #[serde(default)]
    pub study_programs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionList {
    Semesters,
    StudyPrograms,
}

impl OptionList {
    pub fn label(self) -> &'static str {
        match self {
            OptionList::Semesters => "semester",
            OptionList::StudyPrograms => "study program",
        }
    }

    fn field(self) -> &'static str {
        match self {
            OptionList::Semesters => "semesters",
            OptionList::StudyPrograms => "study_programs",
        }
    }
}

impl DropdownOptions {
    pub fn list(&self, list: OptionList) -> &[String] {
        match list {
            OptionList::Semesters => &self.semesters,
            OptionList::StudyPrograms => &self.study_programs,
        }
    }

    /// Appends `value` after trimming. Empty and already present values are
    /// rejected and leave the lists untouched.
    pub fn append(&mut self, list: OptionList, value: &str) -> Result<String, Error> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::validation(
                list.field(),
                format!("Please enter a {}", list.label()),
            ));
        }
        let entries = match list {
            OptionList::Semesters => &mut self.semesters,
            OptionList::StudyPrograms => &mut self.study_programs,
        };
        if entries.iter().any(|existing| existing == value) {
            return Err(Error::validation(
                list.field(),
                format!("'{}' already exists in {}", value, list.field()),
            ));
        }
        entries.push(value.to_string());
        Ok(value.to_string())
    }
}

/// Reads and rewrites the two JSON documents in the configuration directory.
pub struct SettingsStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn login_path(&self) -> PathBuf {
        self.dir.join(LOGIN_CONFIG_FILE)
    }

    pub fn options_path(&self) -> PathBuf {
        self.dir.join(DROPDOWN_OPTIONS_FILE)
    }

    pub async fn load_connection(&self) -> Result<ConnectionSettings, Error> {
        load_json(&self.login_path(), LOGIN_CONFIG_FILE).await
    }

    pub async fn save_connection(&self, settings: &ConnectionSettings) -> Result<(), Error> {
        settings.validate()?;
        let _guard = self.write_lock.lock().await;
        save_json(&self.login_path(), settings).await
    }

    /// Saves settings submitted by the front end. `rscript_path` and unknown
    /// keys already in the file are kept when the submission lacks them.
    pub async fn merge_connection(&self, mut incoming: ConnectionSettings) -> Result<ConnectionSettings, Error> {
        incoming.validate()?;
        let _guard = self.write_lock.lock().await;
        if let Ok(current) = self.load_connection().await {
            if incoming.rscript_path.is_none() {
                incoming.rscript_path = current.rscript_path;
            }
            for (key, value) in current.extra {
                incoming.extra.entry(key).or_insert(value);
            }
        }
        save_json(&self.login_path(), &incoming).await?;
        Ok(incoming)
    }

    pub async fn set_rscript_path(&self, path: &str) -> Result<ConnectionSettings, Error> {
        let path = path.trim();
        if path.is_empty() {
            return Err(Error::validation("rscript_path", "Please enter an R-Script path"));
        }
        let _guard = self.write_lock.lock().await;
        let mut settings = self.load_connection().await?;
        settings.rscript_path = Some(path.to_string());
        save_json(&self.login_path(), &settings).await?;
        Ok(settings)
    }

    pub async fn load_options(&self) -> Result<DropdownOptions, Error> {
        load_json(&self.options_path(), DROPDOWN_OPTIONS_FILE).await
    }

    pub async fn append_option(&self, list: OptionList, value: &str) -> Result<DropdownOptions, Error> {
        let _guard = self.write_lock.lock().await;
        let mut options = self.load_options().await?;
        options.append(list, value)?;
        save_json(&self.options_path(), &options).await?;
        Ok(options)
    }
}

async fn load_json<T>(path: &Path, name: &str) -> Result<T, Error>
where
    T: for<'de> Deserialize<'de>,
{
    if !path.exists() {
        return Err(Error::config(format!("{} not found!", name)));
    }
    let bytes = read_io_file(path).await?;
    serde_json::from_slice(&bytes).map_err(|err| {
        log::warn!("Could not parse {}: {}", path.display(), err);
        Error::config(format!("Invalid JSON in {}!", name))
    })
}

async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_io_file(path, &bytes).await?;
    log::debug!("Saved {}", path.display());
    Ok(())
}
