//! Speed and ETA sampling.
//!
//! A once-per-second tick reads the delivered-bytes counter and derives
//! speed and a clamped ETA. Sampling is decoupled from frame arrival: the
//! hot path only bumps a counter, and this task renders it.

use std::{sync::Arc, time::Duration};

use aerodropx_common::phase::Phase;
use tokio::{sync::watch, task::JoinHandle, time::Instant};

use crate::receive_files::handler::ReceiveShared;

/// Periodic progress snapshot.
#[derive(Clone, Debug)]
pub struct ReceiveProgressEvent {
    /// Bytes delivered so far, including credit carried over by a resume.
    pub delivered: u64,
    /// Total bytes of the manifest.
    pub total: u64,
    /// Current transfer speed, bytes per second.
    pub speed_bps: f64,
    /// Estimated time to completion; `None` while the speed is zero.
    pub eta: Option<Duration>,
}

pub(crate) fn spawn_sampler(
    shared: Arc<ReceiveShared>,
    mut phase_rx: watch::Receiver<Phase>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; use it to seed the baseline.
        interval.tick().await;
        let mut last_bytes = shared.delivered();
        let mut last_at = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now_bytes = shared.delivered();
                    let elapsed = last_at.elapsed().as_secs_f64();
                    let speed_bps = if elapsed > 0.0 {
                        (now_bytes.saturating_sub(last_bytes)) as f64 / elapsed
                    } else {
                        0.0
                    };
                    let remaining =
                        shared.total_size().saturating_sub(now_bytes);
                    let eta = (speed_bps > 0.0).then(|| {
                        Duration::from_secs_f64(remaining as f64 / speed_bps)
                    });

                    shared.notify_progress(ReceiveProgressEvent {
                        delivered: now_bytes,
                        total: shared.total_size(),
                        speed_bps,
                        eta,
                    });

                    last_bytes = now_bytes;
                    last_at = Instant::now();
                }
                result = phase_rx.wait_for(|phase| phase.is_terminal()) => {
                    let _ = result;
                    break;
                }
            }
        }
    })
}
