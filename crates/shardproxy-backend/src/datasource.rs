//! Datasource registry
//!
//! Each configured backend's connection URL is parsed once at startup into a
//! [`DataSourceConfig`]. Malformed URLs fail here with a configuration error
//! instead of surfacing later while pooling. The registry is immutable after
//! construction, so lookups take no lock.

use crate::config::{BackendConfig, DataSourceSettings, SensitiveString};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Default MySQL port
pub const DEFAULT_PORT: u16 = 3306;

/// Connectivity record for one backend datasource
#[derive(Clone)]
pub struct DataSourceConfig {
    /// Datasource name as used by routing
    pub name: String,
    /// Backend host name or address
    pub host: String,
    /// Backend port
    pub port: u16,
    /// Default schema selected at login
    pub database: Option<String>,
    /// Login user
    pub username: String,
    /// Login password
    pub password: SensitiveString,
    /// Extra URL query properties (kept for diagnostics)
    pub properties: BTreeMap<String, String>,
}

impl fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .field("properties", &self.properties)
            .finish()
    }
}

impl DataSourceConfig {
    /// Parse a connection URL.
    ///
    /// Accepts `jdbc:mysql://host[:port]/database[?props]` and
    /// `mysql://[user[:password]@]host[:port]/database`. Credentials passed
    /// explicitly take precedence over credentials embedded in the URL.
    pub fn parse(
        name: impl Into<String>,
        raw_url: &str,
        username: Option<&str>,
        password: Option<&SensitiveString>,
    ) -> Result<Self> {
        let name = name.into();
        let invalid = |reason: &str| {
            Error::config(format!("invalid url for datasource '{name}': {reason}"))
        };

        let trimmed = raw_url.trim();
        let without_jdbc = trimmed.strip_prefix("jdbc:").unwrap_or(trimmed);
        let url = url::Url::parse(without_jdbc).map_err(|e| invalid(&e.to_string()))?;

        match url.scheme() {
            "mysql" | "mariadb" => {}
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        }

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;

        let port = url.port().unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        let database = url
            .path()
            .trim_start_matches('/')
            .trim_end_matches('/')
            .to_string();
        if database.contains('/') {
            return Err(invalid("path must name a single database"));
        }
        let database = if database.is_empty() {
            None
        } else {
            Some(percent_decode(&name, "database", &database)?)
        };

        let username = match username {
            Some(user) => user.to_string(),
            None => percent_decode(&name, "username", url.username())?,
        };
        if username.is_empty() {
            return Err(invalid("no username configured"));
        }

        let password = match password {
            Some(password) => password.clone(),
            None => SensitiveString::new(match url.password() {
                Some(raw) => percent_decode(&name, "password", raw)?,
                None => String::new(),
            }),
        };

        let properties = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(Self {
            name,
            host,
            port,
            database,
            username,
            password,
            properties,
        })
    }

    /// Build from a configuration entry
    pub fn from_settings(name: &str, settings: &DataSourceSettings) -> Result<Self> {
        Self::parse(
            name,
            &settings.url,
            settings.username.as_deref(),
            settings.password.as_ref(),
        )
    }

    /// `host:port` for diagnostics
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn percent_decode(name: &str, field: &str, input: &str) -> Result<String> {
    urlencoding::decode(input)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| {
            Error::config(format!(
                "invalid url for datasource '{name}': {field} is not valid UTF-8 once decoded ({e})"
            ))
        })
}

/// Immutable mapping from datasource name to connectivity record
#[derive(Debug, Clone, Default)]
pub struct DataSourceRegistry {
    datasources: HashMap<String, Arc<DataSourceConfig>>,
}

impl DataSourceRegistry {
    /// Build a registry from parsed records; duplicate names are rejected
    pub fn new(configs: impl IntoIterator<Item = DataSourceConfig>) -> Result<Self> {
        let mut datasources = HashMap::new();
        for config in configs {
            let name = config.name.clone();
            if datasources.insert(name.clone(), Arc::new(config)).is_some() {
                return Err(Error::config(format!("duplicate datasource '{name}'")));
            }
        }
        Ok(Self { datasources })
    }

    /// Parse every configured datasource, failing on the first malformed one
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let parsed = config
            .datasources
            .iter()
            .map(|(name, settings)| DataSourceConfig::from_settings(name, settings))
            .collect::<Result<Vec<_>>>()?;
        Self::new(parsed)
    }

    /// Resolve a datasource by name
    pub fn resolve(&self, name: &str) -> Result<Arc<DataSourceConfig>> {
        self.datasources
            .get(name)
            .cloned()
            .ok_or_else(|| Error::unknown_datasource(name))
    }

    /// Whether a datasource is registered
    pub fn contains(&self, name: &str) -> bool {
        self.datasources.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.datasources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of datasources
    pub fn len(&self) -> usize {
        self.datasources.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.datasources.is_empty()
    }
}
