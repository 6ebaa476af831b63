//! Default answers synthesized by the server itself.
//!
//! Every failure path converges here: the session picks a [`DefaultAnswer`]
//! and the variant is rendered into a minimal HTML [`Response`], or into the
//! configured custom error page when the matched server declares one.

use std::fs;

use log::debug;

use crate::{
    config::ServerConfig,
    files,
    http::{response::reason_phrase, Response},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultAnswer {
    Answer400 {
        message: String,
    },
    Answer403 {},
    Answer404 {},
    Answer405 {
        allow: String,
    },
    Answer408 {
        duration: String,
    },
    Answer413 {
        limit: usize,
    },
    Answer500 {},
    Answer501 {},
    Answer502 {
        message: String,
    },
    Answer503 {},
    Answer504 {
        duration: String,
    },
    /// not an error: rendered for routes configured as redirections
    AnswerRedirect {
        location: String,
        code: u16,
    },
}

impl From<&DefaultAnswer> for u16 {
    fn from(answer: &DefaultAnswer) -> u16 {
        match answer {
            DefaultAnswer::Answer400 { .. } => 400,
            DefaultAnswer::Answer403 {} => 403,
            DefaultAnswer::Answer404 {} => 404,
            DefaultAnswer::Answer405 { .. } => 405,
            DefaultAnswer::Answer408 { .. } => 408,
            DefaultAnswer::Answer413 { .. } => 413,
            DefaultAnswer::Answer500 {} => 500,
            DefaultAnswer::Answer501 {} => 501,
            DefaultAnswer::Answer502 { .. } => 502,
            DefaultAnswer::Answer503 {} => 503,
            DefaultAnswer::Answer504 { .. } => 504,
            DefaultAnswer::AnswerRedirect { code, .. } => *code,
        }
    }
}

impl DefaultAnswer {
    pub fn into_response(self, server: Option<&ServerConfig>) -> Response {
        let status = u16::from(&self);

        if let DefaultAnswer::AnswerRedirect { location, code } = &self {
            let code = *code;
            let mut response = Response::with_body(
                code,
                "text/html",
                format!(
                    "<html><head><title>{code} {reason}</title></head>\
                     <body><h1>{code} {reason}</h1>\
                     <p>The document has moved <a href=\"{location}\">here</a>.</p>\
                     </body></html>\n",
                    reason = reason_phrase(code),
                ),
            );
            response.headers.insert("Location", location.clone());
            return response;
        }

        // a configured error page replaces the built-in body, same status
        if let Some(page) = server.and_then(|server| server.error_page(status)) {
            match fs::read(page) {
                Ok(content) => {
                    return Response::with_body(status, files::mime_type(page), content);
                }
                Err(error) => {
                    debug!("could not read error page {}: {error}", page.display());
                }
            }
        }

        let detail = match &self {
            DefaultAnswer::Answer400 { message } => message.clone(),
            DefaultAnswer::Answer403 {} => "Access to this resource is forbidden.".to_string(),
            DefaultAnswer::Answer404 {} => "The requested resource was not found.".to_string(),
            DefaultAnswer::Answer405 { allow } => {
                format!("Allowed methods for this resource: {allow}.")
            }
            DefaultAnswer::Answer408 { duration } => {
                format!("No complete request was received within {duration}.")
            }
            DefaultAnswer::Answer413 { limit } => {
                format!("Request body exceeds the limit of {limit} bytes.")
            }
            DefaultAnswer::Answer500 {} => "The server failed to process the request.".to_string(),
            DefaultAnswer::Answer501 {} => "Method not implemented by this server.".to_string(),
            DefaultAnswer::Answer502 { message } => message.clone(),
            DefaultAnswer::Answer503 {} => "The server is over capacity.".to_string(),
            DefaultAnswer::Answer504 { duration } => {
                format!("The gateway process exceeded its deadline of {duration}.")
            }
            DefaultAnswer::AnswerRedirect { .. } => unreachable!(),
        };

        let mut response = Response::with_body(
            status,
            "text/html",
            format!(
                "<html><head><title>{status} {reason}</title></head>\
                 <body><h1>{status} {reason}</h1><p>{detail}</p></body></html>\n",
                reason = reason_phrase(status),
            ),
        );
        if let DefaultAnswer::Answer405 { allow } = &self {
            response.headers.insert("Allow", allow.clone());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(u16::from(&DefaultAnswer::Answer404 {}), 404);
        assert_eq!(
            u16::from(&DefaultAnswer::Answer413 { limit: 1024 }),
            413
        );
        assert_eq!(
            u16::from(&DefaultAnswer::AnswerRedirect {
                location: "/new".to_string(),
                code: 308,
            }),
            308
        );
    }

    #[test]
    fn redirect_carries_location() {
        let response = DefaultAnswer::AnswerRedirect {
            location: "/elsewhere".to_string(),
            code: 301,
        }
        .into_response(None);
        assert_eq!(response.status, 301);
        assert_eq!(response.headers.get("location"), Some("/elsewhere"));
    }

    #[test]
    fn method_not_allowed_sets_allow() {
        let response = DefaultAnswer::Answer405 {
            allow: "GET, HEAD".to_string(),
        }
        .into_response(None);
        assert_eq!(response.headers.get("allow"), Some("GET, HEAD"));
    }
}
