use crate::error::{LocalError, LocalResult};
use crate::utils::create_interval_stream;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// The response status of a GET.
    async fn get_status(&self, url: &str) -> anyhow::Result<u16>;
}

#[async_trait]
impl HttpClient for reqwest::Client {
    async fn get_status(&self, url: &str) -> anyhow::Result<u16> {
        Ok(self.get(url).send().await?.status().as_u16())
    }
}

/// Up, possibly behind the login page.
pub fn is_reachable(status: u16) -> bool {
    (200..300).contains(&status) || status == 401
}

/// Polls `url` every `interval` until it answers, `timeout` passes, or
/// `cancel` fires. The deadline is checked first.
#[tracing::instrument(err, skip(http, cancel))]
pub async fn wait_for_reachable(
    http: &dyn HttpClient,
    url: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> LocalResult<()> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = create_interval_stream(interval);

    loop {
        select! {
            biased;

            _ = &mut deadline => {
                return Err(LocalError::Timeout {
                    what: format!("{url} to become reachable"),
                    waited: timeout,
                });
            }
            _ = cancel.cancelled() => return Err(LocalError::Cancelled),
            result = http.get_status(url) => match result {
                Ok(status) if is_reachable(status) => return Ok(()),
                Ok(status) => debug!(status, "not ready yet"),
                Err(err) => debug!(?err, "not reachable yet"),
            },
        }

        select! {
            biased;

            _ = &mut deadline => {
                return Err(LocalError::Timeout {
                    what: format!("{url} to become reachable"),
                    waited: timeout,
                });
            }
            _ = cancel.cancelled() => return Err(LocalError::Cancelled),
            _ = ticker.next() => {}
        }
    }
}
