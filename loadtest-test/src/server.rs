//! Exposes an in-process test server for the load test to run against.
//!
//! ```
//! use loadtest_test::server::TestServer;
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = TestServer::new().await;
//!    let url = server.base_url();
//!    // run the load test against the URL...
//! }
//! ```

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;

/// Path prefix under which the test server answers, see [`TestServer::base_url`].
pub const ITEMS_PATH: &str = "/items/";

/// How the test server answers `GET /items/{id}`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Behavior {
    /// Respond `200 OK` with the requested id as body.
    #[default]
    Echo,
    /// Respond with the given status and the requested id as body.
    Status(u16),
    /// Respond `200 OK` with a body that never matches the id.
    WrongBody,
}

#[derive(Debug)]
struct Shared {
    behavior: Behavior,
    requests: AtomicU64,
}

/// An in-process test server for use in integration tests.
///
/// It listens on a random available port on localhost and counts every request it receives.
#[derive(Debug)]
pub struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    shared: Arc<Shared>,
}

impl TestServer {
    /// Starts a server that echoes the requested id.
    pub async fn new() -> Self {
        Self::with_behavior(Behavior::Echo).await
    }

    /// Starts a server with the given behavior.
    pub async fn with_behavior(behavior: Behavior) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let shared = Arc::new(Shared {
            behavior,
            requests: AtomicU64::new(0),
        });

        let app = Router::new()
            .route("/items/{id}", get(item))
            .with_state(Arc::clone(&shared));

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            handle,
            socket,
            shared,
        }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }

    /// Returns the URL that identifiers can be appended to, ending in `/items/`.
    pub fn base_url(&self) -> String {
        self.url(ITEMS_PATH)
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> u64 {
        self.shared.requests.load(Ordering::Relaxed)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn item(State(shared): State<Arc<Shared>>, Path(id): Path<String>) -> (StatusCode, String) {
    shared.requests.fetch_add(1, Ordering::Relaxed);

    match shared.behavior {
        Behavior::Echo => (StatusCode::OK, id),
        Behavior::Status(status) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            id,
        ),
        Behavior::WrongBody => (StatusCode::OK, format!("not-{id}")),
    }
}
