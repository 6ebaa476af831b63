//! Routing: from a completed request to a dispatch decision.
//!
//! The decision is a tagged variant consumed by a single exhaustive
//! dispatcher in the server; routes never carry behavior themselves.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use crate::{
    config::{RouteConfig, ServerConfig},
    files,
    http::{Method, Request},
};

#[derive(Debug, PartialEq, Eq)]
pub enum RouteDecision {
    ServeStatic {
        path: PathBuf,
        index: String,
        autoindex: bool,
    },
    InvokeCgi {
        interpreter: PathBuf,
        script: PathBuf,
        env: Vec<(String, String)>,
    },
    /// store the request body under the route's upload directory
    Upload {
        target: PathBuf,
    },
    Delete {
        path: PathBuf,
    },
    Redirect {
        location: String,
        code: u16,
    },
    Error {
        status: u16,
        allow: Option<String>,
    },
}

/// Decode `%XX` escapes in a request path. `None` means the escape sequence
/// is malformed and the request is answered with 400.
pub fn decode_percent(raw: &str) -> Option<String> {
    if !raw.contains('%') {
        return Some(raw.to_string());
    }
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let high = *bytes.get(index + 1)? as char;
            let low = *bytes.get(index + 2)? as char;
            let value = (high.to_digit(16)? << 4) | low.to_digit(16)?;
            decoded.push(value as u8);
            index += 3;
        } else {
            decoded.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

/// Longest-prefix match over the server's routes, on path-segment
/// boundaries.
pub fn find_route<'config>(
    server: &'config ServerConfig,
    path: &str,
) -> Option<&'config RouteConfig> {
    server
        .routes
        .iter()
        .filter(|route| {
            let prefix = route.path.trim_end_matches('/');
            if prefix.is_empty() {
                return true;
            }
            match path.strip_prefix(prefix) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            }
        })
        .max_by_key(|route| route.path.trim_end_matches('/').len())
}

pub fn route(server: &ServerConfig, request: &Request, peer: SocketAddr) -> RouteDecision {
    let path = match decode_percent(&request.path) {
        Some(path) => path,
        None => {
            return RouteDecision::Error {
                status: 400,
                allow: None,
            }
        }
    };

    let rule = match find_route(server, &path) {
        Some(rule) => rule,
        None => {
            return RouteDecision::Error {
                status: 404,
                allow: None,
            }
        }
    };

    if let Some(redirect) = &rule.redirect {
        return RouteDecision::Redirect {
            location: redirect.location.clone(),
            code: redirect.code,
        };
    }

    if !rule.allows(request.method) {
        let allow = if rule.methods.is_empty() {
            "GET, HEAD, POST, PUT, DELETE".to_string()
        } else {
            rule.methods
                .iter()
                .map(|method| method.to_ascii_uppercase())
                .collect::<Vec<_>>()
                .join(", ")
        };
        return RouteDecision::Error {
            status: 405,
            allow: Some(allow),
        };
    }

    // validated at load time: a route without redirect carries a root
    let root = match &rule.root {
        Some(root) => root,
        None => {
            return RouteDecision::Error {
                status: 500,
                allow: None,
            }
        }
    };

    let suffix = path
        .strip_prefix(rule.path.trim_end_matches('/'))
        .unwrap_or(&path);
    let resolved = match files::resolve(root, suffix) {
        Some(resolved) => resolved,
        None => {
            return RouteDecision::Error {
                status: 403,
                allow: None,
            }
        }
    };

    if let Some(cgi) = &rule.cgi {
        if path.ends_with(cgi.extension.as_str()) {
            return RouteDecision::InvokeCgi {
                interpreter: cgi.interpreter.clone(),
                env: cgi_environment(server, request, &path, &resolved, peer),
                script: resolved,
            };
        }
    }

    match request.method {
        Method::Post | Method::Put => match &rule.upload_dir {
            Some(upload_dir) => {
                let filename = suffix.rsplit('/').next().unwrap_or("");
                if filename.is_empty() {
                    return RouteDecision::Error {
                        status: 403,
                        allow: None,
                    };
                }
                RouteDecision::Upload {
                    target: upload_dir.join(filename),
                }
            }
            None => RouteDecision::Error {
                status: 405,
                allow: Some("GET, HEAD, DELETE".to_string()),
            },
        },
        Method::Delete => RouteDecision::Delete { path: resolved },
        Method::Get | Method::Head => RouteDecision::ServeStatic {
            path: resolved,
            index: rule.index.clone(),
            autoindex: rule.autoindex,
        },
    }
}

/// Standard CGI/1.1 meta-variables for one subprocess, built per session
/// and handed to the child at spawn time; the server's own environment is
/// never touched.
fn cgi_environment(
    server: &ServerConfig,
    request: &Request,
    url_path: &str,
    script: &Path,
    peer: SocketAddr,
) -> Vec<(String, String)> {
    let server_name = server
        .server_name
        .clone()
        .or_else(|| {
            request
                .headers
                .get("host")
                .map(|host| host.split(':').next().unwrap_or(host).to_string())
        })
        .unwrap_or_else(|| server.listen.ip().to_string());

    let mut env = vec![
        // the child environment is built from scratch; PATH is forwarded so
        // interpreters can find their usual tools
        (
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
        ),
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_SOFTWARE".to_string(), "kiln".to_string()),
        ("SERVER_PROTOCOL".to_string(), request.version.to_string()),
        ("SERVER_NAME".to_string(), server_name),
        ("SERVER_PORT".to_string(), server.listen.port().to_string()),
        ("REQUEST_METHOD".to_string(), request.method.to_string()),
        ("SCRIPT_NAME".to_string(), url_path.to_string()),
        (
            "SCRIPT_FILENAME".to_string(),
            script.to_string_lossy().into_owned(),
        ),
        ("PATH_INFO".to_string(), url_path.to_string()),
        (
            "QUERY_STRING".to_string(),
            request.query.clone().unwrap_or_default(),
        ),
        ("REMOTE_ADDR".to_string(), peer.ip().to_string()),
        ("REDIRECT_STATUS".to_string(), "200".to_string()),
        (
            "CONTENT_LENGTH".to_string(),
            request.body.len().to_string(),
        ),
    ];
    if let Some(content_type) = request.content_type() {
        env.push(("CONTENT_TYPE".to_string(), content_type.to_string()));
    }

    // pass request headers through as HTTP_*, the framing ones excepted
    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("content-type") || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        let name = format!(
            "HTTP_{}",
            name.to_ascii_uppercase().replace('-', "_")
        );
        env.push((name, value.to_string()));
    }
    env
}
