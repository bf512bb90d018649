use std::sync::Arc;
use std::time::Duration;

use krypton_misc::api::entry::ContentType;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::context::ServerContext;
use crate::registry::Registry;

/// Periodic age-based retention. Disabled by default; when enabled it
/// waits out a warm-up delay, then sweeps every `interval_hours`.
pub async fn start_recycle(ctx: Arc<ServerContext>, shutdown: CancellationToken) {
    let cfg = ctx.cfg.cleanup.clone();
    if !cfg.enable {
        debug!("Cleanup is disabled");
        return;
    }

    info!(
        "Cleanup loop starting, interval {}h, retention {}d, warmup {}s",
        cfg.interval_hours, cfg.retention_days, cfg.warmup_secs
    );
    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = tokio::time::sleep(Duration::from_secs(cfg.warmup_secs)) => {}
    }

    let mut tk = tokio::time::interval(Duration::from_secs(cfg.interval_hours * 60 * 60));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tk.tick() => {}
        }

        match ctx.store.cleanup_older_than(cfg.retention_days, None) {
            Ok(count) => debug!("Cleanup pass removed {count} entries"),
            Err(e) => error!("Cleanup failed: {e:#}"),
        }

        if cfg.image_retention_days > 0 {
            match ctx
                .store
                .cleanup_older_than(cfg.image_retention_days, Some(ContentType::Image))
            {
                Ok(count) => debug!("Image cleanup pass removed {count} entries"),
                Err(e) => error!("Image cleanup failed: {e:#}"),
            }
        }
    }
}

/// Evicts sessions whose last activity is older than the connection
/// timeout. Runs every 30 seconds in production; the interval is a
/// parameter so tests can tighten it.
pub async fn start_stale_sweep(
    registry: Arc<Registry>,
    timeout_ms: u64,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(
        "Stale session sweeper starting, timeout {}ms",
        timeout_ms
    );
    let mut tk = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tk.tick() => {}
        }

        let stale = registry.list_stale(timeout_ms);
        for session in stale {
            warn!("Evicting stale session: {session}");
            session.cancel.cancel();
            session.conn.close().await;
            registry.remove(&session.id);
        }
    }
}
