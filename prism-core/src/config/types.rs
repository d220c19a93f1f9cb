use super::defaults::*;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Directory documents are served from. Relative paths resolve against the
    /// directory of the config file.
    #[serde(default)]
    pub document_root: PathBuf,
    /// Port reported to applications; also used for the default listener.
    #[serde(default)]
    pub port: u16,
    /// Socket addresses to accept HTTP connections on.
    #[serde(default)]
    pub listen: Vec<String>,
    /// Walk the request path to find a script and pass the rest as PATH_INFO.
    #[serde(default)]
    pub allow_path_info: bool,
    /// Execute files under `/cgi-bin/` as CGI scripts.
    #[serde(default)]
    pub enable_cgi_bin: bool,
    /// Execute documents with a `.cgi` extension as CGI scripts.
    #[serde(default)]
    pub cgi_extension: bool,
    /// Documents tried, in order, when a directory is requested.
    #[serde(default)]
    pub default_documents: Vec<String>,
    /// Extension (without dot) to application name.
    #[serde(default)]
    pub invoke_on_extension: HashMap<String, String>,
    /// Path prefixes to application name. The first matching prefix wins.
    #[serde(default)]
    pub invoke_on_path: Vec<PathInvocationConfig>,
    /// Ordered rewrite rules. The first matching rule wins.
    #[serde(default)]
    pub rewrite_rules: Vec<RewriteRuleConfig>,
    #[serde(default)]
    pub cgi_applications: HashMap<String, ApplicationConfig>,
    #[serde(default)]
    pub fastcgi_applications: HashMap<String, FastCgiApplicationConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Port reported to applications, with the default applied.
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_PORT
        } else {
            self.port
        }
    }

    /// Names of all applications referenced by a route.
    pub fn routed_applications(&self) -> impl Iterator<Item = &str> {
        self.invoke_on_extension
            .values()
            .map(String::as_str)
            .chain(self.invoke_on_path.iter().map(|p| p.application.as_str()))
    }
}

/// An executable with its arguments and extra environment.
///
/// Used for CGI applications and for FastCGI backends prism launches itself.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApplicationConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FastCgiApplicationConfig {
    /// TCP endpoint ("127.0.0.1:9000") or Unix socket path.
    pub socket: String,
    /// Backend to start at server startup and stop at shutdown.
    #[serde(default)]
    pub launch: Option<ApplicationConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PathInvocationConfig {
    pub prefix: String,
    pub application: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RewriteRuleConfig {
    pub pattern: String,
    /// Target path; `$1`, `${2}` and `$name` expand to capture groups. In a
    /// config file the braced named form is written `$${name}` so it is not
    /// taken for an environment variable. A `?` starts a query string merged
    /// into the request's own.
    pub replacement: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `json`, `compact` or `pretty`.
    #[serde(default = "default_log_format")]
    pub format: String,
    /// System log file. Logs go to stderr when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Access log file. Access events go to the system log when unset.
    #[serde(default)]
    pub access_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            path: None,
            access_path: None,
        }
    }
}
