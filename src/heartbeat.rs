//! Keep-alive for a connected session.
//!
//! PINGs are fire-and-forget. Liveness is judged from the time since any
//! message was last read from the device, so a PONG need not match a PING.

use crate::{
    async_client::{ChannelState, Shared, TaskCmd},
    error::CloseReason,
    util::named,
};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};

/// Runs until the channel leaves `Connected`, the Task goes away, or the
/// device has been silent for longer than the configured timeout.
#[named]
pub(crate) async fn run(shared: Arc<Shared>, task_cmd_tx: mpsc::Sender<TaskCmd>) {
    const FUNCTION_PATH: &str = function_path!();

    let interval = shared.config.heartbeat_interval;
    let timeout = shared.config.heartbeat_timeout();

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut state_rx = shared.subscribe_state();

    tracing::debug!(target: FUNCTION_PATH,
                    ?interval, ?timeout,
                    "heartbeat started");

    loop {
        tokio::select! {
            _ = ticker.tick() => (),
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() != ChannelState::Connected {
                    break;
                }
                continue;
            },
        }

        if shared.state() != ChannelState::Connected {
            break;
        }

        let silent_for = shared.since_last_seen();
        if silent_for > timeout {
            tracing::warn!(target: FUNCTION_PATH,
                           ?silent_for, ?timeout,
                           "no traffic from device, failing channel");
            let fail = TaskCmd::Fail(CloseReason::HeartbeatTimeout(silent_for));
            if let Err(err) = task_cmd_tx.send(fail).await {
                // The Task has already exited, so the channel is down anyway.
                tracing::debug!(target: FUNCTION_PATH,
                                %err,
                                "task gone before heartbeat failure was delivered");
            }
            break;
        }

        tracing::trace!(target: FUNCTION_PATH,
                        ?silent_for,
                        "ping");

        if task_cmd_tx.send(TaskCmd::Ping).await.is_err() {
            break;
        }
    }

    tracing::debug!(target: FUNCTION_PATH,
                    state = ?shared.state(),
                    "heartbeat stopped");
}
