use crate::{CatalogBackend, CatalogError, DeclareOutcome, RetractOutcome};
use fleetrepo_schema::{NodeId, Resource, ResourceId, ResourceKind};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::io::Read;
use std::time::Duration;

/// Catalog client for the internal routes served by `fleetrepo-server --catalog`:
/// - `PUT    /_catalog/<kind>/<name>`          declare (200, 409 when stale)
/// - `DELETE /_catalog/<kind>/<name>?node=ID`  retract (200, 404 with
///   `{"error": "missing"}`, 403 with `{"owner": ID}`)
/// - `GET    /_catalog?tags=a,b`               pull
/// - `GET    /_catalog`                        list
pub struct HttpCatalog {
    base: String,
    agent: ureq::Agent,
}

/// `error` value of the 404 body when a retracted entry does not exist.
pub const MISSING_ENTRY: &str = "missing";

#[derive(Debug, Deserialize)]
struct OwnerBody {
    owner: NodeId,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

fn is_missing_entry(body: &[u8]) -> bool {
    serde_json::from_slice::<ErrorBody>(body).is_ok_and(|b| b.error == MISSING_ENTRY)
}

impl HttpCatalog {
    pub fn new(base: &str) -> Self {
        Self::with_timeout(base, crate::DEFAULT_TIMEOUT)
    }

    /// A client whose every request, body included, gives up after `timeout`.
    pub fn with_timeout(base: &str, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            base: base.trim_end_matches('/').to_owned(),
            agent,
        }
    }

    fn entry_url(&self, kind: ResourceKind, name: &str) -> String {
        format!("{}/_catalog/{}/{}", self.base, kind, name)
    }

    fn read_body(resp: ureq::http::Response<ureq::Body>) -> Result<(u16, Vec<u8>), CatalogError> {
        let code = resp.status().as_u16();
        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| CatalogError::Http(e.to_string()))?;
        Ok((code, body))
    }

    fn do_get(&self, url: &str) -> Result<Vec<Resource>, CatalogError> {
        tracing::debug!("GET {url}");
        let resp = self
            .agent
            .get(url)
            .header("X-Fleetrepo-Protocol", &crate::PROTOCOL_VERSION.to_string())
            .call()
            .map_err(|e| CatalogError::Http(e.to_string()))?;
        match Self::read_body(resp)? {
            (200, body) => Ok(serde_json::from_slice(&body)?),
            (code, _) => Err(CatalogError::Http(format!("HTTP {code} for {url}"))),
        }
    }
}

impl CatalogBackend for HttpCatalog {
    fn declare(&self, resource: &Resource) -> Result<DeclareOutcome, CatalogError> {
        resource.validate()?;
        let url = self.entry_url(resource.kind(), &resource.name);
        let body = serde_json::to_vec(resource)?;
        tracing::debug!("PUT {url} ({} bytes)", body.len());
        let resp = self
            .agent
            .put(&url)
            .header("Content-Type", "application/json")
            .header("X-Fleetrepo-Protocol", &crate::PROTOCOL_VERSION.to_string())
            .send(&body[..])
            .map_err(|e| CatalogError::Http(e.to_string()))?;
        match Self::read_body(resp)? {
            (200 | 201, _) => Ok(DeclareOutcome::Declared),
            (409, _) => Ok(DeclareOutcome::Stale),
            (code, body) => Err(CatalogError::Http(format!(
                "HTTP {code} for PUT {url}: {}",
                String::from_utf8_lossy(&body).trim()
            ))),
        }
    }

    fn retract(
        &self,
        kind: ResourceKind,
        name: &str,
        node: &NodeId,
    ) -> Result<RetractOutcome, CatalogError> {
        let url = format!("{}?node={}", self.entry_url(kind, name), node);
        tracing::debug!("DELETE {url}");
        let resp = self
            .agent
            .delete(&url)
            .header("X-Fleetrepo-Protocol", &crate::PROTOCOL_VERSION.to_string())
            .call()
            .map_err(|e| CatalogError::Http(e.to_string()))?;
        match Self::read_body(resp)? {
            (200 | 204, _) => Ok(RetractOutcome::Retracted),
            (404, body) if is_missing_entry(&body) => Ok(RetractOutcome::Missing),
            (403, body) => {
                let owner = serde_json::from_slice::<OwnerBody>(&body)
                    .map(|b| b.owner)
                    .unwrap_or_else(|_| NodeId::new("unknown"));
                Err(CatalogError::NotOwner {
                    id: ResourceId::new(kind, name),
                    owner,
                    node: node.clone(),
                })
            }
            (code, _) => Err(CatalogError::Http(format!("HTTP {code} for DELETE {url}"))),
        }
    }

    fn pull(&self, tags: &BTreeSet<String>) -> Result<Vec<Resource>, CatalogError> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let joined: Vec<&str> = tags.iter().map(String::as_str).collect();
        let url = format!("{}/_catalog?tags={}", self.base, joined.join(","));
        let resources = self.do_get(&url)?;
        // The server filters already; re-check so a misbehaving catalog cannot
        // hand this node resources it did not ask for.
        Ok(resources.into_iter().filter(|r| r.matches(tags)).collect())
    }

    fn list(&self) -> Result<Vec<Resource>, CatalogError> {
        self.do_get(&format!("{}/_catalog", self.base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetrepo_schema::{parse_tags, DnsAddress, ResourcePayload};
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    /// A captured HTTP request for inspection.
    #[derive(Debug, Clone)]
    struct CapturedRequest {
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    }

    /// Replies to every request with one fixed status and body.
    struct MockServer {
        addr: String,
        _handle: std::thread::JoinHandle<()>,
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
    }

    impl MockServer {
        fn start(status: u16, reply: &str) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = format!("http://{}", listener.local_addr().unwrap());
            let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));
            let reply = reply.to_owned();

            let requests_clone = Arc::clone(&requests);
            let handle = std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).is_err() {
                        continue;
                    }
                    let parts: Vec<&str> = request_line.trim().splitn(3, ' ').collect();
                    if parts.len() < 2 {
                        continue;
                    }

                    let mut content_length: usize = 0;
                    let mut headers = HashMap::new();
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                            break;
                        }
                        if let Some((k, v)) = line.trim().split_once(": ") {
                            headers.insert(k.to_lowercase(), v.to_owned());
                        }
                        let lower = line.to_lowercase();
                        if let Some(val) = lower.strip_prefix("content-length: ") {
                            content_length = val.trim().parse().unwrap_or(0);
                        }
                    }
                    let mut body = vec![0u8; content_length];
                    if content_length > 0 {
                        let _ = reader.read_exact(&mut body);
                    }

                    requests_clone.lock().unwrap().push(CapturedRequest {
                        method: parts[0].to_owned(),
                        path: parts[1].to_owned(),
                        headers,
                        body,
                    });

                    let response = format!(
                        "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
                        reply.len()
                    );
                    let _ = stream.write_all(response.as_bytes());
                    let _ = stream.flush();
                }
            });

            MockServer {
                addr,
                _handle: handle,
                requests,
            }
        }

        fn captured_requests(&self) -> Vec<CapturedRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn dns(tags: &str) -> Resource {
        Resource::new(
            "apt.example.com",
            parse_tags(tags),
            NodeId::new("repo-01"),
            ResourcePayload::DnsAddress(DnsAddress {
                hostname: "apt.example.com".to_owned(),
                ip: "10.0.0.5".to_owned(),
            }),
        )
    }

    #[test]
    fn declare_sends_put_with_resource_json() {
        let server = MockServer::start(200, "");
        let cat = HttpCatalog::new(&format!("{}/", server.addr));
        assert_eq!(cat.declare(&dns("fleet-a")).unwrap(), DeclareOutcome::Declared);

        let reqs = server.captured_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].method, "PUT");
        assert_eq!(reqs[0].path, "/_catalog/dns_address/apt.example.com");
        assert_eq!(reqs[0].headers.get("x-fleetrepo-protocol"), Some(&"1".to_owned()));
        let sent: Resource = serde_json::from_slice(&reqs[0].body).unwrap();
        assert_eq!(sent.name, "apt.example.com");
    }

    #[test]
    fn declare_conflict_is_stale() {
        let server = MockServer::start(409, "stale");
        let cat = HttpCatalog::new(&server.addr);
        assert_eq!(cat.declare(&dns("fleet-a")).unwrap(), DeclareOutcome::Stale);
    }

    #[test]
    fn retract_maps_status_codes() {
        let server = MockServer::start(200, "");
        let cat = HttpCatalog::new(&server.addr);
        assert_eq!(
            cat.retract(ResourceKind::DnsAddress, "apt.example.com", &NodeId::new("repo-01"))
                .unwrap(),
            RetractOutcome::Retracted
        );
        let reqs = server.captured_requests();
        assert_eq!(reqs[0].method, "DELETE");
        assert_eq!(reqs[0].path, "/_catalog/dns_address/apt.example.com?node=repo-01");

        let server = MockServer::start(404, r#"{"error":"missing"}"#);
        let cat = HttpCatalog::new(&server.addr);
        assert_eq!(
            cat.retract(ResourceKind::DnsAddress, "x", &NodeId::new("n")).unwrap(),
            RetractOutcome::Missing
        );

        let server = MockServer::start(403, r#"{"owner":"repo-01"}"#);
        let cat = HttpCatalog::new(&server.addr);
        match cat.retract(ResourceKind::DnsAddress, "x", &NodeId::new("web-01")) {
            Err(CatalogError::NotOwner { owner, .. }) => assert_eq!(owner.as_str(), "repo-01"),
            other => panic!("expected NotOwner, got {other:?}"),
        }
    }

    #[test]
    fn plain_404_on_retract_is_an_error() {
        // A wrong base path or a server without catalog routes.
        let server = MockServer::start(404, "not found");
        let cat = HttpCatalog::new(&server.addr);
        assert!(matches!(
            cat.retract(ResourceKind::DnsAddress, "x", &NodeId::new("n")),
            Err(CatalogError::Http(_))
        ));
    }

    #[test]
    fn pull_passes_tags_and_filters_response() {
        let body = serde_json::to_string(&vec![dns("fleet-a"), dns("fleet-b")]).unwrap();
        let server = MockServer::start(200, &body);
        let cat = HttpCatalog::new(&server.addr);
        let pulled = cat.pull(&parse_tags("fleet-a,web")).unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(server.captured_requests()[0].path, "/_catalog?tags=fleet-a,web");
    }

    #[test]
    fn pull_with_no_tags_makes_no_request() {
        let server = MockServer::start(500, "");
        let cat = HttpCatalog::new(&server.addr);
        assert!(cat.pull(&BTreeSet::new()).unwrap().is_empty());
        assert!(server.captured_requests().is_empty());
    }

    #[test]
    fn server_error_is_reported() {
        let server = MockServer::start(500, "boom");
        let cat = HttpCatalog::new(&server.addr);
        assert!(matches!(cat.list(), Err(CatalogError::Http(_))));
    }

    /// Accepts connections and never writes a byte back.
    fn silent_listener() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        std::thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                held.push(stream);
            }
        });
        addr
    }

    #[test]
    fn silent_catalog_times_out() {
        let addr = silent_listener();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let cat = HttpCatalog::with_timeout(&addr, Duration::from_secs(1));
            let _ = tx.send(cat.pull(&parse_tags("fleet-a")));
        });
        let result = rx
            .recv_timeout(Duration::from_secs(20))
            .expect("pull should give up on its own");
        assert!(matches!(result, Err(CatalogError::Http(_))), "{result:?}");
    }

    #[test]
    fn connection_refused_returns_error() {
        let cat = HttpCatalog::new("http://127.0.0.1:1");
        assert!(cat.declare(&dns("fleet-a")).is_err());
    }
}
