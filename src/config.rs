use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub routing: RoutingConfig,
    pub datastore: DatastoreConfig,
    pub spf: SpfConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the mail listener binds to
    pub smtp_addr: SocketAddr,
    /// Address of the uptime probe listener
    pub health_addr: SocketAddr,
    /// Name announced in the SMTP greeting
    pub hostname: String,
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Only accept mail for `valid_domains` when set
    pub domain_checking: bool,
    /// Suffixes, so `example.com` also admits `mail.example.com`
    pub valid_domains: Vec<String>,
    /// Prefix for the webhook path, with leading and trailing slashes
    pub api_route: String,
    pub use_https: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    /// Every message for every domain is mirrored here
    pub url: String,
    /// Document holding `{"count": n}`
    pub count_url: String,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpfConfig {
    pub enabled: bool,
    pub require_pass: bool,
    pub api_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub accept_invalid_certs: bool,
    pub timeout_secs: Option<u64>,
    pub user_agent: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Write `dewmail-YYYY-MM-DD.log` here instead of stderr
    pub log_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            smtp_addr: SocketAddr::from(([0, 0, 0, 0], 25)),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8111)),
            hostname: "localhost".to_string(),
            max_message_size: 10 * 1024 * 1024,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        RoutingConfig {
            domain_checking: false,
            valid_domains: vec![
                "example.com".to_string(),
                "do.example.com".to_string(),
                "api.example.org".to_string(),
            ],
            api_route: "/".to_string(),
            use_https: false,
        }
    }
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        DatastoreConfig {
            url: String::new(),
            count_url: String::new(),
            max_retries: 100,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            accept_invalid_certs: false,
            timeout_secs: None,
            user_agent: format!("dewmail/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Scheme for webhook URLs
    pub fn scheme(&self) -> &'static str {
        if self.routing.use_https {
            "https"
        } else {
            "http"
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.routing.api_route.starts_with('/') {
            bail!(
                "routing.api_route must start with '/', got {:?}",
                self.routing.api_route
            );
        }
        if self.routing.domain_checking && self.routing.valid_domains.is_empty() {
            bail!("routing.domain_checking is on but routing.valid_domains is empty");
        }
        if self.datastore.max_retries == 0 {
            bail!("datastore.max_retries must be at least 1");
        }
        for (name, value) in [
            ("datastore.url", &self.datastore.url),
            ("datastore.count_url", &self.datastore.count_url),
        ] {
            if !value.is_empty() {
                url::Url::parse(value).with_context(|| format!("{name} is not a valid URL"))?;
            }
        }
        if self.spf.enabled {
            if self.spf.api_url.is_empty() {
                bail!("spf.enabled requires spf.api_url");
            }
            url::Url::parse(&self.spf.api_url).context("spf.api_url is not a valid URL")?;
        }
        Ok(())
    }
}
