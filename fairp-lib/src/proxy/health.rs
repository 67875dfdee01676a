use http::{Response, StatusCode};
use std::time::Duration;
use tokio::time::Instant;

use super::{Proxy, ProxyBody, error_response, text};
use crate::ratelimit::{HostKey, Limiter};

/// Longest a health request queues for its token before it is refused
const MAX_WAIT: Duration = Duration::from_secs(2);

/// Render the runtime statistics for `remote_host`.
///
/// Each host may ask a few times in a row, then once per limiter period.
/// Requests that would queue for longer than [`MAX_WAIT`] get a
/// `429 Too Many Requests`. The host stays registered for two more periods
/// after its request, so reconnecting does not reset its budget.
pub(super) async fn report(proxy: &Proxy, remote_host: HostKey) -> Response<ProxyBody> {
    let handle = proxy.runner.health_limiters().get_limiter_handle(remote_host);
    let limiter = handle.limiter();
    let granted = limiter.wait_n_until(1, Some(Instant::now() + MAX_WAIT)).await;

    let period = Duration::try_from_secs_f64(1.0 / limiter.rate()).unwrap_or(Duration::ZERO);
    tokio::spawn(async move {
        tokio::time::sleep(period * 2).await;
        handle.close();
    });

    match granted {
        Ok(()) => text(StatusCode::OK, proxy.runner.stats().to_string()),
        Err(err) => error_response(StatusCode::TOO_MANY_REQUESTS, &err),
    }
}
