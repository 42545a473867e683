use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StubPage {
    status: u16,
    body: String,
}

type Pages = Arc<Mutex<HashMap<String, StubPage>>>;
type Hits = Arc<Mutex<HashMap<String, usize>>>;

/// Local site whose pages can be swapped between monitoring runs. Requests
/// arriving in proxy form (`GET http://host/path`) are looked up by their full
/// address, so the stub can stand in for the overlay proxy as well.
pub struct StubSite {
    pub base_url: String,
    pages: Pages,
    hits: Hits,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

#[allow(dead_code)]
impl StubSite {
    pub fn spawn() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start stub site");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");

        let pages: Pages = Arc::new(Mutex::new(HashMap::new()));
        let hits: Hits = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let server_pages = Arc::clone(&pages);
        let server_hits = Arc::clone(&hits);
        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let key = request.url().to_string();
                *server_hits
                    .lock()
                    .expect("lock hits")
                    .entry(key.clone())
                    .or_default() += 1;

                let page = server_pages.lock().expect("lock pages").get(&key).cloned();
                let response = match page {
                    Some(page) => {
                        let header = tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/html; charset=utf-8"[..],
                        )
                        .expect("build header");
                        tiny_http::Response::from_string(page.body)
                            .with_status_code(page.status)
                            .with_header(header)
                    }
                    None => tiny_http::Response::from_string("not found").with_status_code(404),
                };
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            pages,
            hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `key` is a path (`/page`) or, for proxied requests, a full address.
    pub fn set_page(&self, key: &str, status: u16, body: &str) {
        self.pages.lock().expect("lock pages").insert(
            key.to_owned(),
            StubPage {
                status,
                body: body.to_owned(),
            },
        );
    }

    pub fn hits(&self, key: &str) -> usize {
        self.hits
            .lock()
            .expect("lock hits")
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for StubSite {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
