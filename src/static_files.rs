use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::http_object::{HttpRequest, HttpResponse};

/// Maps request paths onto files under a base directory.
///
/// Declines (returns `None`) when the file does not exist, so later
/// handlers or the 404 default still apply. A sidecar file named
/// `<file>.mock-http-headers` next to a served file supplies the literal
/// response header block instead of the synthesized `200 OK`.
pub struct StaticDir {
    base_dir: PathBuf,
}

const SIDECAR_SUFFIX: &str = ".mock-http-headers";

impl StaticDir {
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self { base_dir: base.into() }
    }

    pub fn handle(&self, request: &HttpRequest) -> Option<HttpResponse> {
        let file = self.map_path(request.path())?;
        if !file.is_file() {
            return None;
        }
        let body = fs::read(&file).ok()?;
        debug!(file = %file.display(), bytes = body.len(), "serving file");

        let mut response = HttpResponse::new();
        match fs::read_to_string(sidecar_path(&file)) {
            Ok(block) => response.set_raw_header_block(block),
            Err(_) => response.set_content_type(content_type(&file)),
        }
        response.set_content(body);
        Some(response)
    }

    // Only plain path segments are allowed; anything that could escape
    // the base directory maps to nothing.
    fn map_path(&self, url_path: &str) -> Option<PathBuf> {
        let mut pb = self.base_dir.clone();
        for comp in Path::new(url_path.trim_start_matches('/')).components() {
            match comp {
                Component::Normal(s) => pb.push(s),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(pb)
    }
}

fn sidecar_path(file: &Path) -> PathBuf {
    let mut os = file.as_os_str().to_os_string();
    os.push(SIDECAR_SUFFIX);
    PathBuf::from(os)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|s| s.to_str()).unwrap_or("").to_lowercase().as_str() {
        "html" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "xml" => "text/xml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_status::HttpStatus;
    use crate::http_type::Method;
    use std::collections::HashMap;
    use std::io::Write;

    fn request(relative_url: &str) -> HttpRequest {
        HttpRequest::new(Method::GET, relative_url.to_string(), HashMap::new(), None)
    }

    #[test]
    fn map_path_prevents_traversal() {
        let dir = StaticDir::new("testdata");
        assert!(dir.map_path("../Cargo.toml").is_none());
        assert!(dir.map_path("/a/../../etc/passwd").is_none());
        assert_eq!(dir.map_path("/sub/./file.txt"), Some(PathBuf::from("testdata/sub/file.txt")));
    }

    #[test]
    fn content_type_is_sniffed_from_the_extension() {
        assert_eq!(content_type(Path::new("a/index.HTML")), "text/html");
        assert_eq!(content_type(Path::new("a/data.json")), "application/json");
        assert_eq!(content_type(Path::new("a/blob")), "application/octet-stream");
    }

    #[test]
    fn serves_existing_files_with_their_contents() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("test.html"), "<p>Hello World!</p>").unwrap();

        let dir = StaticDir::new(tmp.path());
        let res = dir.handle(&request("/test.html")).unwrap();
        assert_eq!(res.get_status_code(), HttpStatus::OK);
        let wire = String::from_utf8(res.to_bytes().to_vec()).unwrap();
        assert!(wire.contains("Content-Type: text/html"));
        assert!(wire.ends_with("<p>Hello World!</p>"));
    }

    #[test]
    fn query_strings_do_not_affect_the_file_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("page.txt"), "plain").unwrap();

        let dir = StaticDir::new(tmp.path());
        assert!(dir.handle(&request("/page.txt?cache=no")).is_some());
    }

    #[test]
    fn missing_files_decline_instead_of_erroring() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StaticDir::new(tmp.path());
        assert!(dir.handle(&request("/does-not-exist")).is_none());
    }

    #[test]
    fn sidecar_header_block_is_used_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("old.html"), "moved").unwrap();
        let mut sidecar = fs::File::create(tmp.path().join("old.html.mock-http-headers")).unwrap();
        write!(sidecar, "HTTP/1.1 301 Moved Permanently\r\nLocation: /new.html\r\n").unwrap();

        let dir = StaticDir::new(tmp.path());
        let res = dir.handle(&request("/old.html")).unwrap();
        let wire = String::from_utf8(res.to_bytes().to_vec()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 301 Moved Permanently\r\nLocation: /new.html\r\n\r\n"));
        assert!(wire.ends_with("moved"));
    }
}
