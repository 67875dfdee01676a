use std::sync::Arc;
use std::time::Duration;

use fairp_lib::Runner;
use tokio::time::MissedTickBehavior;

/// Log the runner's statistics every `period` until it shuts down
pub(crate) async fn run(runner: Arc<Runner>, period: Duration) {
    let shutdown = runner.shutdown_token();
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticks.tick() => log::info!("Runtime info {}", runner.stats().log_line()),
        }
    }
}
