use crate::services::command_queue::CommandQueue;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Background task returning unanswered commands to the queue (or failing
/// them once their attempts are used up) on a fixed interval
pub async fn command_sweeper(queue: CommandQueue, every: Duration, stale_after: Duration) {
    info!(
        interval_secs = every.as_secs(),
        stale_after_secs = stale_after.as_secs(),
        "Starting command sweeper task"
    );

    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;

        let queue = queue.clone();
        match tokio::task::spawn_blocking(move || queue.sweep_stale(stale_after)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(count)) => debug!(count, "Sweeper changed stale commands"),
            Ok(Err(e)) => error!(error = %e, "Failed to sweep stale commands"),
            Err(e) => error!(error = %e, "Task join error"),
        }
    }
}
