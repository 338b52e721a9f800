//! Shared upstream HTTP client (§5 resource model): one pooled connection
//! manager reused across requests rather than built fresh each time.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;

fn default_http_client_builder() -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(Duration::from_secs(60))
        // Short idle timeout: picks up DNS/upstream changes quickly rather
        // than pinning a connection to a stale address for a long session.
        .pool_idle_timeout(Duration::from_secs(5))
        .tcp_nodelay(true)
        .tcp_keepalive(Duration::from_secs(60))
}

pub fn http_client() -> &'static Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        default_http_client_builder().build().expect("default http client configuration is valid")
    })
}
