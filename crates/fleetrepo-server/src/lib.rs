//! Reference publisher for fleetrepo repositories.
//!
//! Serves the published tree under a document root read-only over HTTP
//! (`GET`/`HEAD`), following the per-distribution snapshot symlinks, and
//! writes one JSON access-log line per request. With a catalog directory
//! configured it also serves the internal `/_catalog` routes used by
//! `HttpCatalog` clients.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

use chrono::{SecondsFormat, Utc};
use fleetrepo_catalog::{
    CatalogBackend, CatalogError, DeclareOutcome, FileCatalog, RetractOutcome,
};
use fleetrepo_schema::{parse_tags, NodeId, Resource, ResourceKind};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

/// Largest catalog entry accepted in a `PUT`.
const MAX_BODY: u64 = 1024 * 1024;
const WORKERS: usize = 4;

pub type ServerError = Box<dyn std::error::Error + Send + Sync>;

/// Destination of access-log lines.
pub struct AccessLog {
    out: Mutex<Box<dyn Write + Send>>,
}

impl AccessLog {
    pub fn stdout() -> Self {
        Self {
            out: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    /// Append to `path`, creating it if needed.
    pub fn file(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: Mutex::new(Box::new(file)),
        })
    }

    fn write(&self, record: &AccessRecord) {
        let Ok(line) = serde_json::to_string(record) else {
            return;
        };
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            warn!("access log write failed: {e}");
        }
    }
}

/// One access-log line. The field names are consumed by log shippers and
/// must not change.
#[derive(Debug, Serialize)]
pub struct AccessRecord {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    #[serde(rename = "@message")]
    pub message: String,
    #[serde(rename = "@fields")]
    pub fields: AccessFields,
}

#[derive(Debug, Serialize)]
pub struct AccessFields {
    #[serde(rename = "user-agent")]
    pub user_agent: String,
    pub client: String,
    pub duration_usec: u64,
    pub duration_sec: f64,
    pub status: u16,
    pub request_path: String,
    pub request: String,
    pub method: String,
    pub referrer: String,
}

/// What a request looked like before it was consumed by the response.
struct RequestInfo {
    method: String,
    url: String,
    path: String,
    query: String,
    version: String,
    client: String,
    user_agent: String,
    referrer: String,
}

impl RequestInfo {
    fn capture(req: &Request) -> Self {
        let url = req.url().to_owned();
        let (path, query) = match url.split_once('?') {
            Some((p, q)) => (p.to_owned(), q.to_owned()),
            None => (url.clone(), String::new()),
        };
        let header = |name: &'static str| {
            req.headers()
                .iter()
                .find(|h| h.field.equiv(name))
                .map_or_else(|| "-".to_owned(), |h| h.value.as_str().to_owned())
        };
        Self {
            method: req.method().to_string(),
            path,
            query,
            version: format!("{}.{}", req.http_version().0, req.http_version().1),
            client: req
                .remote_addr()
                .map_or_else(|| "-".to_owned(), |a| a.ip().to_string()),
            user_agent: header("User-Agent"),
            referrer: header("Referer"),
            url,
        }
    }

    fn record(&self, status: u16, started: Instant) -> AccessRecord {
        let elapsed = started.elapsed();
        let request = format!("{} {} HTTP/{}", self.method, self.url, self.version);
        AccessRecord {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message: format!("{} \"{request}\" {status}", self.client),
            fields: AccessFields {
                user_agent: self.user_agent.clone(),
                client: self.client.clone(),
                duration_usec: elapsed.as_micros() as u64,
                duration_sec: elapsed.as_secs_f64(),
                status,
                request_path: self.path.clone(),
                request,
                method: self.method.clone(),
                referrer: self.referrer.clone(),
            },
        }
    }
}

enum Body {
    Data(Vec<u8>),
    File(File),
}

struct Reply {
    status: u16,
    content_type: &'static str,
    body: Body,
}

impl Reply {
    fn text(status: u16, msg: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: Body::Data(format!("{msg}\n").into_bytes()),
        }
    }

    fn json(status: u16, value: &impl Serialize) -> Self {
        match serde_json::to_vec(value) {
            Ok(data) => Self {
                status,
                content_type: "application/json",
                body: Body::Data(data),
            },
            Err(e) => Self::text(500, &format!("serialization error: {e}")),
        }
    }
}

/// Content type by file name, the way apt and browsers expect it.
pub fn content_type_for(path: &Path) -> &'static str {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    match (name, ext) {
        ("Release" | "Packages" | "InRelease", _) | (_, "sig" | "gpg" | "asc" | "txt") => {
            "text/plain"
        }
        (_, "deb" | "udeb") => "application/vnd.debian.binary-package",
        (_, "json") => "application/json",
        _ => "application/octet-stream",
    }
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| percent_decode(v))
}

/// Server state: the document root and the optional catalog.
pub struct Publisher {
    docroot: PathBuf,
    catalog: Option<FileCatalog>,
    log: AccessLog,
}

impl Publisher {
    pub fn new(docroot: impl Into<PathBuf>, catalog: Option<PathBuf>, log: AccessLog) -> Self {
        Self {
            docroot: docroot.into(),
            catalog: catalog.map(FileCatalog::new),
            log,
        }
    }

    pub fn docroot(&self) -> &Path {
        &self.docroot
    }

    /// Map a request path to a file below the document root.
    ///
    /// `Err(status)` is 400 for `..`/`.` segments and undecodable paths, 404
    /// for anything missing, a directory, or resolving outside the tree it
    /// was requested from.
    pub fn resolve(&self, request_path: &str) -> Result<PathBuf, u16> {
        let decoded = percent_decode(request_path).ok_or(400_u16)?;
        let rel = decoded.trim_start_matches('/');
        if rel.is_empty() {
            return Err(404);
        }
        let rel_path = Path::new(rel);
        if rel_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(400);
        }

        let root = fs::canonicalize(&self.docroot).map_err(|_| 404_u16)?;
        // A published distribution is a symlink into the snapshot area; the
        // request must stay inside whatever its first segment resolves to.
        let top = root.join(rel_path.components().next().ok_or(404_u16)?);
        let is_link = fs::symlink_metadata(&top).is_ok_and(|m| m.file_type().is_symlink());
        let base = match fs::canonicalize(&top) {
            Ok(target) if is_link && target.is_dir() => target,
            Ok(_) => root,
            Err(_) => return Err(404),
        };

        let full = fs::canonicalize(self.docroot.join(rel_path)).map_err(|_| 404_u16)?;
        if !full.starts_with(&base) {
            debug!("refusing {request_path}: resolves outside {}", base.display());
            return Err(404);
        }
        if !full.is_file() {
            return Err(404);
        }
        Ok(full)
    }

    fn serve_file(&self, method: &Method, path: &str) -> Reply {
        if !matches!(method, Method::Get | Method::Head) {
            return Reply::text(405, "method not allowed");
        }
        match self.resolve(path) {
            Ok(file_path) => match File::open(&file_path) {
                Ok(file) => Reply {
                    status: 200,
                    content_type: content_type_for(&file_path),
                    body: Body::File(file),
                },
                Err(e) => {
                    error!("open {}: {e}", file_path.display());
                    Reply::text(500, "read error")
                }
            },
            Err(400) => Reply::text(400, "bad request"),
            Err(code) => Reply::text(code, "not found"),
        }
    }

    fn serve_catalog(
        &self,
        catalog: &FileCatalog,
        req: &mut Request,
        info: &RequestInfo,
        rest: &str,
    ) -> Reply {
        let method = req.method().clone();
        if rest.is_empty() {
            if method != Method::Get {
                return Reply::text(405, "method not allowed");
            }
            let result = match query_param(&info.query, "tags") {
                Some(tags) => catalog.pull(&parse_tags(&tags)),
                None => catalog.list(),
            };
            return match result {
                Ok(resources) => Reply::json(200, &resources),
                Err(e) => catalog_error(&e),
            };
        }

        let Some((kind, name)) = rest.strip_prefix('/').and_then(|r| r.split_once('/')) else {
            return Reply::text(404, "not found");
        };
        let Ok(kind) = kind.parse::<ResourceKind>() else {
            return Reply::text(404, "unknown resource kind");
        };
        let Some(name) = percent_decode(name) else {
            return Reply::text(400, "bad request");
        };

        match method {
            Method::Put => {
                let mut body = Vec::new();
                if let Err(e) = req.as_reader().take(MAX_BODY + 1).read_to_end(&mut body) {
                    return Reply::text(400, &format!("read error: {e}"));
                }
                if body.len() as u64 > MAX_BODY {
                    return Reply::text(413, "entry too large");
                }
                let resource: Resource = match serde_json::from_slice(&body) {
                    Ok(r) => r,
                    Err(e) => return Reply::text(400, &format!("invalid resource: {e}")),
                };
                if resource.kind() != kind || resource.name != name {
                    return Reply::text(400, "resource does not match the request path");
                }
                let existed = catalog
                    .root()
                    .join(kind.as_str())
                    .join(format!("{name}.json"))
                    .exists();
                match catalog.declare(&resource) {
                    Ok(DeclareOutcome::Declared) => {
                        info!("declared {} by {}", resource.id(), resource.declared_by);
                        Reply::text(if existed { 200 } else { 201 }, "declared")
                    }
                    Ok(DeclareOutcome::Stale) => Reply::text(409, "a newer declaration exists"),
                    Err(e) => catalog_error(&e),
                }
            }
            Method::Delete => {
                let Some(node) = query_param(&info.query, "node").filter(|n| !n.is_empty()) else {
                    return Reply::text(400, "missing node parameter");
                };
                match catalog.retract(kind, &name, &NodeId::new(node)) {
                    Ok(RetractOutcome::Retracted) => Reply::text(200, "retracted"),
                    Ok(RetractOutcome::Missing) => Reply::json(
                        404,
                        &serde_json::json!({ "error": fleetrepo_catalog::http::MISSING_ENTRY }),
                    ),
                    Err(CatalogError::NotOwner { owner, .. }) => {
                        Reply::json(403, &serde_json::json!({ "owner": owner }))
                    }
                    Err(e) => catalog_error(&e),
                }
            }
            _ => Reply::text(405, "method not allowed"),
        }
    }
}

fn catalog_error(e: &CatalogError) -> Reply {
    match e {
        CatalogError::Invalid(_) => Reply::text(400, &e.to_string()),
        _ => {
            error!("catalog: {e}");
            Reply::text(500, &e.to_string())
        }
    }
}

fn respond(req: Request, reply: Reply) {
    let status = StatusCode(reply.status);
    let header = Header::from_bytes(&b"Content-Type"[..], reply.content_type.as_bytes()).ok();
    let result = match reply.body {
        Body::Data(data) => {
            let mut resp = Response::from_data(data).with_status_code(status);
            if let Some(h) = header {
                resp.add_header(h);
            }
            req.respond(resp)
        }
        Body::File(file) => {
            let mut resp = Response::from_file(file).with_status_code(status);
            if let Some(h) = header {
                resp.add_header(h);
            }
            req.respond(resp)
        }
    };
    if let Err(e) = result {
        debug!("client went away: {e}");
    }
}

/// Handle a single HTTP request and log it.
pub fn handle_request(state: &Publisher, mut req: Request) {
    let started = Instant::now();
    let info = RequestInfo::capture(&req);
    debug!("{} {}", info.method, info.url);

    let reply = if info.path == "/health" {
        if matches!(req.method(), Method::Get | Method::Head) {
            Reply::json(200, &serde_json::json!({ "status": "ok" }))
        } else {
            Reply::text(405, "method not allowed")
        }
    } else if let Some(rest) = info
        .path
        .strip_prefix("/_catalog")
        .filter(|r| r.is_empty() || r.starts_with('/'))
    {
        match &state.catalog {
            Some(catalog) => state.serve_catalog(catalog, &mut req, &info, rest),
            None => Reply::text(404, "not found"),
        }
    } else {
        state.serve_file(req.method(), &info.path)
    };

    let status = reply.status;
    respond(req, reply);
    state.log.write(&info.record(status, started));
}

/// Serve requests on `addr` until the process exits.
pub fn run_server(state: &Arc<Publisher>, addr: &str) -> Result<(), ServerError> {
    let server = Arc::new(Server::http(addr)?);
    info!("listening on {addr}");
    let mut workers = Vec::with_capacity(WORKERS);
    for _ in 0..WORKERS {
        let server = Arc::clone(&server);
        let state = Arc::clone(state);
        workers.push(std::thread::spawn(move || {
            for request in server.incoming_requests() {
                handle_request(&state, request);
            }
        }));
    }
    for w in workers {
        if w.join().is_err() {
            error!("worker thread panicked");
        }
    }
    Ok(())
}

/// A test helper that serves a document root (and optionally a catalog) on
/// a random port in a background thread. Access-log lines go to `access_log`.
///
/// Drop the `TestServer` to stop the server (via `Server::unblock`).
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub access_log: PathBuf,
    server: Arc<Server>,
    _handle: std::thread::JoinHandle<()>,
}

impl TestServer {
    pub fn start(
        docroot: PathBuf,
        catalog: Option<PathBuf>,
        access_log: PathBuf,
    ) -> Result<Self, ServerError> {
        let log = AccessLog::file(&access_log)?;
        let server = Arc::new(Server::http("127.0.0.1:0")?);
        let port = server
            .server_addr()
            .to_ip()
            .ok_or("test server is not bound to an IP address")?
            .port();
        let url = format!("http://127.0.0.1:{port}");

        let state = Arc::new(Publisher::new(docroot, catalog, log));
        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&state, request);
            }
        });

        Ok(Self {
            url,
            port,
            access_log,
            server,
            _handle: handle,
        })
    }

    /// Access-log lines written so far.
    pub fn log_lines(&self) -> Vec<serde_json::Value> {
        fs::read_to_string(&self.access_log)
            .unwrap_or_default()
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher(dir: &Path) -> Publisher {
        Publisher::new(dir.join("public"), None, AccessLog::stdout())
    }

    /// `public/stable -> ../snapshots/stable/abc`, like a published repository.
    fn published_tree(dir: &Path) {
        let snap = dir.join("snapshots/stable/abc");
        fs::create_dir_all(snap.join("main/amd64")).unwrap();
        fs::write(snap.join("Release"), "Origin: x\n").unwrap();
        fs::write(snap.join("main/amd64/hello_1.0_amd64.deb"), b"deb").unwrap();
        fs::create_dir_all(dir.join("public")).unwrap();
        std::os::unix::fs::symlink("../snapshots/stable/abc", dir.join("public/stable")).unwrap();
        fs::write(dir.join("public/localpkgs.gpg"), "key\n").unwrap();
        fs::write(dir.join("secret.txt"), "no").unwrap();
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for(Path::new("stable/Release")), "text/plain");
        assert_eq!(content_type_for(Path::new("stable/main/amd64/Packages")), "text/plain");
        assert_eq!(content_type_for(Path::new("stable/Release.sig")), "text/plain");
        assert_eq!(content_type_for(Path::new("repo.gpg")), "text/plain");
        assert_eq!(
            content_type_for(Path::new("a_1_amd64.deb")),
            "application/vnd.debian.binary-package"
        );
        assert_eq!(content_type_for(Path::new("snapshot.json")), "application/json");
        assert_eq!(content_type_for(Path::new("blob.bin")), "application/octet-stream");
    }

    #[test]
    fn resolves_through_published_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        published_tree(dir.path());
        let p = publisher(dir.path());

        assert!(p.resolve("/stable/Release").unwrap().ends_with("abc/Release"));
        assert!(p.resolve("/stable/main/amd64/hello_1.0_amd64.deb").is_ok());
        assert!(p.resolve("/localpkgs.gpg").is_ok());
        assert!(p.resolve("/stable%2FRelease").is_ok());
    }

    #[test]
    fn refuses_traversal_directories_and_escapes() {
        let dir = tempfile::tempdir().unwrap();
        published_tree(dir.path());
        std::os::unix::fs::symlink("../secret.txt", dir.path().join("public/leak")).unwrap();
        std::os::unix::fs::symlink(
            "../../../../secret.txt",
            dir.path().join("snapshots/stable/abc/leak"),
        )
        .unwrap();
        let p = publisher(dir.path());

        assert_eq!(p.resolve("/../secret.txt"), Err(400));
        assert_eq!(p.resolve("/stable/%2e%2e/%2e%2e/secret.txt"), Err(400));
        assert_eq!(p.resolve("/stable/main"), Err(404));
        assert_eq!(p.resolve("/"), Err(404));
        assert_eq!(p.resolve("/missing"), Err(404));
        assert_eq!(p.resolve("/stable/leak"), Err(404));
        assert_eq!(p.resolve("/leak"), Err(404));
        assert_eq!(p.resolve("/%zz"), Err(400));
    }

    #[test]
    fn access_record_shape() {
        let info = RequestInfo {
            method: "GET".to_owned(),
            url: "/stable/Release?x=1".to_owned(),
            path: "/stable/Release".to_owned(),
            query: "x=1".to_owned(),
            version: "1.1".to_owned(),
            client: "10.0.0.7".to_owned(),
            user_agent: "-".to_owned(),
            referrer: "-".to_owned(),
        };
        let value = serde_json::to_value(info.record(200, Instant::now())).unwrap();
        assert_eq!(value["@message"], "10.0.0.7 \"GET /stable/Release?x=1 HTTP/1.1\" 200");
        let fields = &value["@fields"];
        assert_eq!(fields["request_path"], "/stable/Release");
        assert_eq!(fields["user-agent"], "-");
        assert_eq!(fields["status"], 200);
        assert!(fields["duration_usec"].is_u64());
        assert!(fields["duration_sec"].is_f64());
        assert!(value["@timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(fields.as_object().unwrap().len(), 9);
    }

    #[test]
    fn query_params_are_decoded() {
        assert_eq!(query_param("tags=a,b&node=web%2D01", "node").as_deref(), Some("web-01"));
        assert_eq!(query_param("tags=a,b", "tags").as_deref(), Some("a,b"));
        assert_eq!(query_param("", "tags"), None);
    }
}
