// TCP readiness probe shared by every spawn path.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{BrokerError, Result};

const RETRY_DELAY: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Wait until a TCP connect to `host:port` succeeds, retrying every 500ms
/// until the deadline. Callers destroy the workload on failure.
pub async fn wait_for_port(host: &str, port: u16, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => debug!("probe {host}:{port} not ready: {e}"),
            Err(_) => debug!("probe {host}:{port} connect timed out"),
        }
        if Instant::now() + RETRY_DELAY > deadline {
            return Err(BrokerError::ProbeTimeout(format!(
                "{host}:{port} not reachable within {timeout:?}"
            )));
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
}
