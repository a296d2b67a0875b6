//! Lifecycle control of the members backend.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

use crate::backend::{BackendHandle, BackendMsg, Backlog, Reconciler, ReconcilerExit};
use crate::cluster::{Collaborators, LeaderState};
use crate::config::Config;
use crate::error::BackendError;

/// The owner of the members backend reconciler.
///
/// While stopped, the backend holds the backlog & the request channel. Starting the backend
/// moves both into a newly spawned reconciler task, and stopping it waits for that task to
/// settle and takes both back, so exactly one reconciler instance ever exists.
pub struct MembersBackend {
    config: Arc<Config>,
    collab: Arc<Collaborators>,
    /// The leadership state of this node.
    leader_rx: watch::Receiver<LeaderState>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,

    /// The state held while the reconciler is stopped.
    idle: Option<Idle>,
    /// The reconciler task, while started.
    running: Option<Running>,
}

struct Idle {
    requests_rx: mpsc::Receiver<BackendMsg>,
    backlog: Backlog,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<ReconcilerExit>,
}

impl MembersBackend {
    /// Create a new instance, along with the handle used to send it requests.
    pub fn new(
        config: Arc<Config>, collab: Collaborators, leader_rx: watch::Receiver<LeaderState>, shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, BackendHandle) {
        let (tx, requests_rx) = mpsc::channel(config.intake_queue_capacity);
        (
            Self {
                config,
                collab: Arc::new(collab),
                leader_rx,
                shutdown_tx,
                idle: Some(Idle {
                    requests_rx,
                    backlog: Backlog::default(),
                }),
                running: None,
            },
            BackendHandle { tx },
        )
    }

    /// Check if the reconciler task is currently running.
    pub fn is_running(&self) -> bool {
        self.running.as_ref().map(|running| !running.handle.is_finished()).unwrap_or(false)
    }

    /// Start the reconciler.
    ///
    /// Returns `false` if the reconciler had already been started and not yet stopped, in which
    /// case this call has no effect. Any backlog retained from a previous run is picked up
    /// immediately.
    pub fn start(&mut self) -> bool {
        if self.running.is_some() {
            return false;
        }
        let idle = match self.idle.take() {
            Some(idle) => idle,
            None => {
                tracing::error!("members backend state was lost by a failed reconciler, can not start");
                return false;
            }
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let reconciler = Reconciler::new(
            self.config.clone(),
            self.collab.clone(),
            idle.backlog,
            idle.requests_rx,
            self.leader_rx.clone(),
            self.shutdown_tx.clone(),
            stop_rx,
        );
        self.running = Some(Running {
            stop_tx,
            handle: reconciler.spawn(),
        });
        tracing::info!("members backend started");
        true
    }

    /// Stop the reconciler, waiting for all of its work to settle.
    ///
    /// Returns the outcome of the reconciler run. Calling this while stopped has no effect.
    pub async fn stop(&mut self) -> Result<(), BackendError> {
        let running = match self.running.take() {
            Some(running) => running,
            None => return Ok(()),
        };
        let _ = running.stop_tx.send(true);
        let exit = running.handle.await?;
        self.idle = Some(Idle {
            requests_rx: exit.requests_rx,
            backlog: exit.backlog,
        });
        tracing::info!("members backend stopped");
        exit.outcome
    }

    /// Spawn a task which starts & stops this backend according to the leadership state of this
    /// node, until process shutdown.
    pub fn supervise(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run_supervisor())
    }

    async fn run_supervisor(mut self) -> Result<()> {
        tracing::debug!("members backend supervisor started");
        let mut leader_states = WatchStream::new(self.leader_rx.clone());
        let mut shutdown = BroadcastStream::new(self.shutdown_tx.subscribe());

        loop {
            tokio::select! {
                Some(state) = leader_states.next() => self.handle_leader_state(state).await,
                _ = shutdown.next() => break,
            }
        }

        match self.stop().await {
            Ok(()) | Err(BackendError::Shutdown) | Err(BackendError::AuthorizationLost) => (),
            Err(err) => tracing::error!(error = ?err, "error stopping members backend"),
        }
        tracing::debug!("members backend supervisor stopped");
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_leader_state(&mut self, state: LeaderState) {
        match state {
            LeaderState::Leading => {
                if self.is_running() {
                    return;
                }
                // Reap a reconciler which exited on its own before starting a new one.
                if let Err(err) = self.stop().await {
                    tracing::debug!(error = ?err, "previous reconciler run ended");
                }
                self.start();
            }
            _ => {
                if let Err(err) = self.stop().await {
                    tracing::debug!(error = ?err, "reconciler run ended");
                }
            }
        }
    }
}

/// A tracker of background tasks which must settle before the backend may stop.
pub(crate) struct Gate<T> {
    tasks: JoinSet<T>,
}

impl<T: Send + 'static> Gate<T> {
    pub fn new() -> Self {
        Self { tasks: JoinSet::new() }
    }

    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.tasks.spawn(fut);
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for the next task to settle.
    pub async fn next(&mut self) -> Option<Result<T, JoinError>> {
        self.tasks.join_next().await
    }

    /// Wait for every task to settle, returning their results.
    pub async fn close(&mut self) -> Vec<Result<T, JoinError>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        while let Some(res) = self.tasks.join_next().await {
            results.push(res);
        }
        results
    }
}
