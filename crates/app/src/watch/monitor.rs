//! Terminal front end: run the pipeline, log what it sees and optionally show
//! the annotated feed in a local window.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::watch::{
    alert::AlertState,
    config::PipelineConfig,
    control::ControlPlane,
    data::FramePacket,
    multiplexer::Subscription,
    preview::Preview,
};

const FPS_LOG_INTERVAL: u64 = 100;
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// What the monitor saw of one run.
#[derive(Debug, Default)]
struct MonitorLog {
    alert: AlertState,
    transitions: Vec<(u64, AlertState)>,
    frames: u64,
}

impl MonitorLog {
    fn record(&mut self, packet: &FramePacket) {
        self.frames += 1;
        if !packet.annotated {
            debug!(frame = packet.frame_number, "frame published without overlay");
        }
        if packet.alert != self.alert {
            match packet.alert {
                AlertState::Alert => warn!(frame = packet.frame_number, "INTRUDER DETECTED"),
                AlertState::Monitoring => info!(frame = packet.frame_number, "back to monitoring"),
            }
            self.alert = packet.alert;
            self.transitions.push((packet.frame_number, packet.alert));
        }
        if packet.frame_number % FPS_LOG_INTERVAL == 0 {
            info!(frame = packet.frame_number, "{:.1} fps", packet.fps);
        }
    }
}

/// Start a run and follow it until end of stream, Ctrl+C or `q` in the
/// preview window, then stop it.
pub(crate) fn run_monitor(
    control: Arc<ControlPlane>,
    config: PipelineConfig,
    preview: bool,
) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let mut preview = Preview::open(preview);
    let subscription = control.multiplexer().subscribe();
    let summary = control
        .start(config)
        .context("failed to start pipeline")?;
    info!(
        "watching {} for {} (confidence > {:.2}, cooldown {:.1}s)",
        summary.source, summary.target_label, summary.threshold, summary.cooldown_secs
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("failed to build monitor runtime")?;
    let log = runtime.block_on(follow(&control, &subscription, &shutdown, &mut preview));

    control.stop()?;
    let status = control.status();
    info!(
        frames = status.frames_processed,
        seen = log.frames,
        alerts = log
            .transitions
            .iter()
            .filter(|(_, state)| state.is_alert())
            .count(),
        snapshots = status.snapshots_taken,
        "monitor finished"
    );
    if let Some(err) = status.last_error {
        info!("last pipeline error: {err}");
    }
    Ok(())
}

async fn follow(
    control: &ControlPlane,
    subscription: &Subscription,
    shutdown: &AtomicBool,
    preview: &mut Preview,
) -> MonitorLog {
    let mut poll = tokio::time::interval(SHUTDOWN_POLL);
    let mut log = MonitorLog::default();
    loop {
        tokio::select! {
            packet = subscription.recv() => {
                let Some(packet) = packet else {
                    warn!("monitor fell behind the pipeline and was evicted");
                    break;
                };
                log.record(&packet);
                if !preview.show(&packet.jpeg) {
                    info!("quit requested from the preview window");
                    break;
                }
            }
            _ = poll.tick() => {
                if shutdown.load(Ordering::SeqCst) {
                    info!("Ctrl+C received; shutting down");
                    break;
                }
                if control.wait_idle(Duration::ZERO) {
                    // Frames of the final stretch may still be queued.
                    while let Some(packet) = subscription.try_recv() {
                        log.record(&packet);
                        preview.show(&packet.jpeg);
                    }
                    break;
                }
            }
        }
    }
    log
}
