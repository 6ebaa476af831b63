//! Static filesystem collaborator: traversal-safe path resolution, MIME
//! lookup, file responses and autoindex rendering.

use std::{
    fs::{self, File},
    io,
    path::{Component, Path, PathBuf},
};

use crate::http::Response;

#[derive(thiserror::Error, Debug)]
pub enum ServeError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<&io::Error> for ServeError {
    fn from(error: &io::Error) -> ServeError {
        match error.kind() {
            io::ErrorKind::NotFound => ServeError::NotFound,
            io::ErrorKind::PermissionDenied => ServeError::Forbidden,
            _ => ServeError::Io(io::Error::new(error.kind(), error.to_string())),
        }
    }
}

/// Join a decoded request suffix under a document root, refusing any `..`
/// that would escape it. The suffix is normalized component by component so
/// the root prefix check cannot be fooled without touching the filesystem.
pub fn resolve(root: &Path, suffix: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    let mut depth: usize = 0;
    for component in Path::new(suffix.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                resolved.pop();
                depth -= 1;
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

pub fn mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .unwrap_or("");
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "gz" => "application/gzip",
        "zip" => "application/zip",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// Serve a resolved filesystem path: a file becomes a streamed 200, a
/// directory is answered with its index file, an autoindex listing, or 403.
pub fn serve(
    path: &Path,
    request_path: &str,
    index: &str,
    autoindex: bool,
) -> Result<Response, ServeError> {
    let metadata = fs::metadata(path).map_err(|error| ServeError::from(&error))?;

    if metadata.is_dir() {
        let index_path = path.join(index);
        match fs::metadata(&index_path) {
            Ok(index_metadata) if index_metadata.is_file() => {
                return open_file(&index_path, index_metadata.len());
            }
            _ => {}
        }
        if autoindex {
            return directory_listing(path, request_path);
        }
        return Err(ServeError::Forbidden);
    }

    if !metadata.is_file() {
        // sockets, fifos and friends are not served
        return Err(ServeError::Forbidden);
    }
    open_file(path, metadata.len())
}

fn open_file(path: &Path, length: u64) -> Result<Response, ServeError> {
    let file = File::open(path).map_err(|error| ServeError::from(&error))?;
    Ok(Response::with_file(200, mime_type(path), file, length))
}

fn directory_listing(path: &Path, request_path: &str) -> Result<Response, ServeError> {
    let display_path = escape_html(request_path);
    let mut body = format!(
        "<html><head><title>Index of {display_path}</title></head>\
         <body><h1>Index of {display_path}</h1><hr><ul>\n"
    );
    if request_path != "/" {
        body.push_str("<li><a href=\"../\">../</a></li>\n");
    }

    let mut names: Vec<(String, bool)> = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let is_dir = entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false);
        names.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
    }
    names.sort();

    for (name, is_dir) in names {
        let slash = if is_dir { "/" } else { "" };
        let name = escape_html(&name);
        body.push_str(&format!("<li><a href=\"{name}{slash}\">{name}{slash}</a></li>\n"));
    }
    body.push_str("</ul><hr></body></html>\n");
    Ok(Response::with_body(200, "text/html", body))
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Map a serve failure to the status of its default answer.
pub fn error_status(error: &ServeError) -> u16 {
    match error {
        ServeError::NotFound => 404,
        ServeError::Forbidden => 403,
        ServeError::Io(_) => 500,
    }
}
