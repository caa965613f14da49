use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[validate(nested)]
    pub origin: Origin,

    #[validate(nested)]
    #[serde(default)]
    pub cache: Cache,

    pub control: Option<Control>,
    pub prometheus: Option<Prometheus>,
    pub sentry: Option<Sentry>,
    pub log: Option<Log>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).or_err(InternalError, "Unable to serialize conf")
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Listener {
    pub address: SocketAddr,
    #[serde(default)]
    pub offer_h2c: bool,
}

/// The application origin every intercepted request is ultimately sent to.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct Origin {
    /// `host:port` of the origin server
    #[validate(length(min = 1), custom(function = "validate_origin_address"))]
    pub address: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub sni: String,
    /// Host header sent upstream, defaults to the address host
    pub host: Option<String>,
}

impl Origin {
    /// Resolve the origin address once, at startup.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.address
            .to_socket_addrs()
            .or_err_with(InvalidHTTPHeader, || {
                format!("Unable to resolve origin {}", self.address)
            })?
            .next()
            .ok_or_else(|| {
                Error::explain(
                    InvalidHTTPHeader,
                    format!("Origin {} resolved to no address", self.address),
                )
            })
    }

    pub fn host_header(&self) -> String {
        self.host.clone().unwrap_or_else(|| {
            self.address
                .rsplit_once(':')
                .map_or(self.address.as_str(), |(host, _)| host)
                .to_string()
        })
    }
}

fn validate_origin_address(address: &str) -> Result<(), ValidationError> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(ValidationError::new("origin_address_requires_host_and_port")),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Cache::validate_storage"))]
pub struct Cache {
    /// Generation tag embedded in the store names
    #[validate(length(min = 1), custom(function = "validate_version"))]
    pub version: String,

    #[serde(default = "Cache::default_manifest")]
    #[validate(length(min = 1), custom(function = "validate_paths"))]
    pub manifest: Vec<String>,

    #[serde(default = "Cache::default_static_extensions")]
    #[validate(custom(function = "validate_extensions"))]
    pub static_extensions: Vec<String>,

    #[serde(default = "Cache::default_shell_paths")]
    #[validate(custom(function = "validate_paths"))]
    pub shell_paths: Vec<String>,

    #[serde(default = "Cache::default_api_prefix")]
    #[validate(custom(function = "validate_path"))]
    pub api_prefix: String,

    #[serde(default = "Cache::default_skip_waiting_on_install")]
    pub skip_waiting_on_install: bool,

    /// Seconds without a request after which a client counts as closed
    #[serde(default = "Cache::default_client_idle_timeout")]
    #[validate(range(min = 1))]
    pub client_idle_timeout: u64,

    #[serde(default)]
    pub storage: Storage,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            manifest: Self::default_manifest(),
            static_extensions: Self::default_static_extensions(),
            shell_paths: Self::default_shell_paths(),
            api_prefix: Self::default_api_prefix(),
            skip_waiting_on_install: Self::default_skip_waiting_on_install(),
            client_idle_timeout: Self::default_client_idle_timeout(),
            storage: Storage::default(),
        }
    }
}

impl Cache {
    fn default_manifest() -> Vec<String> {
        [
            "/",
            "/index.html",
            "/static/js/bundle.js",
            "/static/css/main.css",
            "/manifest.json",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn default_static_extensions() -> Vec<String> {
        ["js", "css", "png", "jpg", "jpeg", "svg"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn default_shell_paths() -> Vec<String> {
        ["/", "/index.html", "/manifest.json"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn default_api_prefix() -> String {
        "/api/".to_string()
    }

    fn default_skip_waiting_on_install() -> bool {
        true
    }

    fn default_client_idle_timeout() -> u64 {
        1800
    }

    fn validate_storage(&self) -> Result<(), ValidationError> {
        match &self.storage {
            Storage::File { path } if path.is_empty() => {
                Err(ValidationError::new("storage_path_required"))
            }
            _ => Ok(()),
        }
    }
}

fn validate_version(version: &str) -> Result<(), ValidationError> {
    let valid = version
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid && !version.starts_with('.') {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_cache_version"))
    }
}

fn validate_path(path: &str) -> Result<(), ValidationError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(ValidationError::new("path_must_start_with_slash"))
    }
}

fn validate_paths(paths: &[String]) -> Result<(), ValidationError> {
    for path in paths {
        validate_path(path)?;
    }
    Ok(())
}

fn validate_extensions(extensions: &[String]) -> Result<(), ValidationError> {
    for ext in extensions {
        if ext.is_empty() || ext.starts_with('.') || ext.contains('/') {
            return Err(ValidationError::new("invalid_static_extension"));
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Storage {
    #[default]
    Memory,
    File {
        path: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Control {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sentry {
    pub dsn: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
    /// Level name such as `info` or `debug`
    pub level: Option<String>,
}
