//! TOML configuration model.
//!
//! A configuration file declares one or more virtual servers, each bound to
//! one listen address and carrying an ordered list of routes. Global knobs
//! (connection cap, body limit, timeouts) apply to every server.
//!
//! ```toml
//! max_connections = 256
//! client_body_limit = 1048576
//! idle_timeout = 30
//! cgi_timeout = 10
//!
//! [[server]]
//! listen = "127.0.0.1:8080"
//!
//! [server.error_pages]
//! 404 = "errors/404.html"
//!
//! [[server.route]]
//! path = "/"
//! root = "www"
//! index = "index.html"
//!
//! [[server.route]]
//! path = "/cgi-bin"
//! root = "www/cgi-bin"
//! methods = ["GET", "POST"]
//! cgi = { extension = ".py", interpreter = "/usr/bin/python3" }
//! ```

use std::{collections::HashMap, fs, net::SocketAddr, path::PathBuf};

use serde::Deserialize;

use crate::http::Method;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read configuration file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no [[server]] block")]
    NoServer,
    #[error("server {0} has no [[server.route]] block")]
    NoRoute(usize),
    #[error("route {path:?} of server {server}: {message}")]
    InvalidRoute {
        server: usize,
        path: String,
        message: String,
    },
}

fn default_max_connections() -> usize {
    512
}

fn default_body_limit() -> usize {
    1024 * 1024
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_cgi_timeout() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_index() -> String {
    "index.html".to_string()
}

fn default_redirect_code() -> u16 {
    301
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// cap on concurrently served connections; accepting pauses at the cap
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// request body ceiling in bytes, beyond which a 413 is answered
    #[serde(default = "default_body_limit")]
    pub client_body_limit: usize,
    /// seconds before an idle connection is closed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// seconds a CGI subprocess may run before it is killed
    #[serde(default = "default_cgi_timeout")]
    pub cgi_timeout: u64,
    /// seconds granted to in-flight sessions on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    #[serde(rename = "server", default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    #[serde(default)]
    pub server_name: Option<String>,
    /// status code (as a bare key) to error page file path
    #[serde(default)]
    pub error_pages: HashMap<String, PathBuf>,
    #[serde(rename = "route", default)]
    pub routes: Vec<RouteConfig>,
}

impl ServerConfig {
    pub fn error_page(&self, status: u16) -> Option<&PathBuf> {
        self.error_pages.get(&status.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// URL prefix this route matches, longest prefix wins
    pub path: String,
    /// document root the matched suffix is resolved under
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_index")]
    pub index: String,
    #[serde(default)]
    pub autoindex: bool,
    /// allowed methods; empty allows every supported method
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub redirect: Option<RedirectConfig>,
    #[serde(default)]
    pub cgi: Option<CgiConfig>,
    /// where POST/PUT bodies are stored; uploads are refused without it
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
}

impl RouteConfig {
    pub fn allows(&self, method: Method) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(method.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedirectConfig {
    pub location: String,
    #[serde(default = "default_redirect_code")]
    pub code: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CgiConfig {
    /// script extension triggering CGI execution, dot included
    pub extension: String,
    pub interpreter: PathBuf,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|error| ConfigError::Read(path.to_path_buf(), error))?;
        Config::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServer);
        }
        for (index, server) in self.servers.iter().enumerate() {
            if server.routes.is_empty() {
                return Err(ConfigError::NoRoute(index));
            }
            for route in &server.routes {
                let invalid = |message: &str| ConfigError::InvalidRoute {
                    server: index,
                    path: route.path.clone(),
                    message: message.to_string(),
                };
                if !route.path.starts_with('/') {
                    return Err(invalid("path must start with '/'"));
                }
                if route.root.is_none() && route.redirect.is_none() {
                    return Err(invalid("needs either a root or a redirect"));
                }
                for method in &route.methods {
                    if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_none() {
                        return Err(invalid("unsupported method in allow list"));
                    }
                }
                if let Some(redirect) = &route.redirect {
                    if !matches!(redirect.code, 301 | 302 | 303 | 307 | 308) {
                        return Err(invalid("redirect code must be 301, 302, 303, 307 or 308"));
                    }
                }
                if let Some(cgi) = &route.cgi {
                    if !cgi.extension.starts_with('.') {
                        return Err(invalid("cgi extension must start with '.'"));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[server]]
        listen = "127.0.0.1:8080"

        [[server.route]]
        path = "/"
        root = "www"
    "#;

    #[test]
    fn minimal_config_with_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.max_connections, 512);
        assert_eq!(config.client_body_limit, 1024 * 1024);
        assert_eq!(config.idle_timeout, 30);
        assert_eq!(config.servers.len(), 1);
        let server = &config.servers[0];
        assert_eq!(server.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(server.routes[0].index, "index.html");
        assert!(server.routes[0].allows(Method::Delete));
    }

    #[test]
    fn full_route_options() {
        let config = Config::parse(
            r#"
            client_body_limit = 2048

            [[server]]
            listen = "0.0.0.0:8081"
            server_name = "kiln.test"

            [server.error_pages]
            404 = "errors/404.html"

            [[server.route]]
            path = "/cgi-bin"
            root = "www/cgi-bin"
            methods = ["GET", "POST"]
            cgi = { extension = ".py", interpreter = "/usr/bin/python3" }
            upload_dir = "uploads"

            [[server.route]]
            path = "/old"
            redirect = { location = "/new", code = 308 }
            "#,
        )
        .unwrap();

        let server = &config.servers[0];
        assert_eq!(server.error_page(404), Some(&PathBuf::from("errors/404.html")));
        assert_eq!(server.error_page(500), None);

        let route = &server.routes[0];
        assert!(route.allows(Method::Get));
        assert!(!route.allows(Method::Delete));
        assert_eq!(route.cgi.as_ref().unwrap().extension, ".py");

        let redirect = server.routes[1].redirect.as_ref().unwrap();
        assert_eq!(redirect.code, 308);
    }

    #[test]
    fn rejected_configurations() {
        assert!(matches!(Config::parse(""), Err(ConfigError::NoServer)));
        assert!(matches!(
            Config::parse("[[server]]\nlisten = \"127.0.0.1:80\"\n"),
            Err(ConfigError::NoRoute(0))
        ));
        assert!(Config::parse(
            r#"
            [[server]]
            listen = "127.0.0.1:80"
            [[server.route]]
            path = "no-slash"
            root = "www"
            "#
        )
        .is_err());
        assert!(Config::parse(
            r#"
            [[server]]
            listen = "127.0.0.1:80"
            [[server.route]]
            path = "/"
            "#
        )
        .is_err());
        assert!(Config::parse(
            r#"
            [[server]]
            listen = "127.0.0.1:80"
            [[server.route]]
            path = "/"
            root = "www"
            methods = ["PATCH"]
            "#
        )
        .is_err());
    }
}
