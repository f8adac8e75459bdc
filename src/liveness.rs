use std::time::Duration;

use tracing::debug;

/// Probe timeout, independent of the caller's own cancellation.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded health probe against the primary backend.
///
/// Any failure mode (timeout, refused connection, non-success status) maps
/// to `false`; the probe never surfaces an error.
pub async fn is_alive(client: &reqwest::Client, base_url: &str) -> bool {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    match client.get(&url).timeout(PROBE_TIMEOUT).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!(error = %e, url, "liveness probe failed");
            false
        }
    }
}
