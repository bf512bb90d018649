use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::context::ServerContext;
use crate::recycle;
use crate::registry::Registry;
use crate::session::{Session, SessionWorker};

const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Server {
    ctx: Arc<ServerContext>,
    registry: Arc<Registry>,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(ctx: Arc<ServerContext>) -> Result<Self> {
        let acceptor = ctx.cfg.tls.build_acceptor().context("init tls")?;
        Ok(Self {
            ctx,
            registry: Arc::new(Registry::new()),
            acceptor,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let bind = &self.ctx.cfg.bind;
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind to '{bind}'"))?;
        info!("Start to listen on '{bind}'");
        Ok(listener)
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
            // Not running under systemd, nothing to report to.
            log::debug!("sd_notify skipped: {err:#}");
        }
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tokio::spawn(recycle::start_recycle(
            self.ctx.clone(),
            self.shutdown.clone(),
        ));
        tokio::spawn(recycle::start_stale_sweep(
            self.registry.clone(),
            self.ctx.cfg.connection_timeout_ms,
            STALE_SWEEP_INTERVAL,
            self.shutdown.clone(),
        ));

        let tracker = TaskTracker::new();

        info!("Begin to accept connections");
        loop {
            let (stream, addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                ret = listener.accept() => match ret {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("Accept tcp connection failed: {:#}", err);
                        continue;
                    }
                },
            };

            if self.registry.len() >= self.ctx.cfg.max_connections {
                // Close immediately, no hello.
                warn!("Max connections reached, dropping connection from {addr}");
                drop(stream);
                continue;
            }

            let session = Session::new(stream, addr.to_string(), self.shutdown.child_token());
            self.registry.add(session.clone());

            let worker = SessionWorker::new(
                session,
                self.ctx.clone(),
                self.registry.clone(),
                self.acceptor.clone(),
            );
            tracker.spawn(worker.run());
        }

        info!("Shutting down, closing {} sessions", self.registry.len());
        self.registry.disconnect_all().await;
        tracker.close();
        if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, tracker.wait())
            .await
            .is_err()
        {
            warn!("Some session tasks did not finish before the shutdown timeout");
        }
        info!("Server stopped");
        Ok(())
    }
}
