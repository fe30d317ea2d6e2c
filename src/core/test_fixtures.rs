//! Local HTTP fixtures for tests
//!
//! A throwaway axum server on an ephemeral port. Each path answers from a
//! queue of canned replies; the last reply repeats, unknown paths get 404.

use axum::{
    body::Body,
    extract::State,
    http::{header::RANGE, HeaderMap, StatusCode, Uri},
    response::Response,
    Router,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    body: Vec<u8>,
    delay: Duration,
    ranged: bool,
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
            ranged: false,
        }
    }

    /// Honours `Range: bytes=a-b` with a 206 slice of `body`
    pub fn ranged(body: impl Into<Vec<u8>>) -> Self {
        Self {
            ranged: true,
            ..Self::ok(body)
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            delay: Duration::ZERO,
            ranged: false,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct Routes {
    replies: DashMap<String, Vec<Reply>>,
    hits: DashMap<String, usize>,
}

pub struct Fixture {
    base: String,
    routes: Arc<Routes>,
}

impl Fixture {
    pub async fn start() -> Self {
        let routes = Arc::new(Routes::default());
        let app = Router::new().fallback(respond).with_state(routes.clone());
        let base = serve(app).await;
        Self { base, routes }
    }

    /// Answer `path` with `replies` in order, repeating the last one
    pub fn route(&self, path: &str, replies: impl IntoIterator<Item = Reply>) -> &Self {
        self.routes
            .replies
            .insert(path.to_string(), replies.into_iter().collect());
        self
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.routes.hits.get(path).map(|h| *h).unwrap_or(0)
    }
}

/// Serve `app` on 127.0.0.1 and return its base URL
pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    base
}

async fn respond(State(routes): State<Arc<Routes>>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    *routes.hits.entry(path.clone()).or_insert(0) += 1;

    let mut reply = match routes.replies.get_mut(&path) {
        Some(mut queue) if queue.len() > 1 => queue.remove(0),
        Some(queue) => queue.first().cloned().unwrap_or_else(|| Reply::status(404)),
        None => Reply::status(404),
    };

    if reply.ranged {
        let range = headers
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split_once('-'))
            .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));
        if let Some((start, end)) = range {
            let end = (end + 1).min(reply.body.len());
            reply.body = reply.body.get(start..end).unwrap_or_default().to_vec();
            reply.status = 206;
        }
    }

    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }
    Response::builder()
        .status(StatusCode::from_u16(reply.status).unwrap())
        .body(Body::from(reply.body))
        .unwrap()
}
