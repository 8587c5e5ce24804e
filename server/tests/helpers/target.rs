//! In-process mock HTTP target for scan tests.

use axum::Router;
use std::net::SocketAddr;

pub struct MockTarget {
    pub addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl MockTarget {
    /// Serve the router on an ephemeral localhost port.
    pub async fn serve(router: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Self { addr, handle }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for MockTarget {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
