//! `LISTEN/NOTIFY` change-stream helper.
//!
//! Wraps a dedicated `sqlx::postgres::PgListener` (a plain connection, not
//! pooled — Postgres `LISTEN` is connection-scoped) and republishes
//! notifications as a `tokio::sync::broadcast` channel so multiple
//! subscribers (the engine's reconcile trigger, `GET /runs/{id}?wait=`
//! long-poll handlers) can all observe the same event stream.

use anyhow::Context;
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub channel: &'static str,
    pub payload: String,
}

pub struct ChangeListener {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeListener {
    /// Connects a `PgListener` to `runs_new`, `runs_updated`, and
    /// `buffers_changed` (spec.md §4.D/§4.A) and spawns a background task
    /// forwarding notifications until `cancel` fires.
    pub async fn connect(database_url: &str, cancel: CancellationToken) -> anyhow::Result<Self> {
        let mut listener = PgListener::connect(database_url)
            .await
            .context("connecting dedicated LISTEN connection")?;
        listener
            .listen_all(["runs_new", "runs_updated", "buffers_changed"])
            .await
            .context("issuing LISTEN")?;

        let (sender, _) = broadcast::channel(1024);
        let task_sender = sender.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    notification = listener.recv() => {
                        match notification {
                            Ok(n) => {
                                let channel: &'static str = match n.channel() {
                                    "runs_new" => "runs_new",
                                    "runs_updated" => "runs_updated",
                                    "buffers_changed" => "buffers_changed",
                                    other => {
                                        warn!(channel = other, "unexpected LISTEN channel");
                                        continue;
                                    }
                                };
                                let _ = task_sender.send(ChangeEvent { channel, payload: n.payload().to_string() });
                            }
                            Err(e) => {
                                error!(error = %e, "LISTEN connection error, reconnect will be attempted by caller");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { sender })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}
