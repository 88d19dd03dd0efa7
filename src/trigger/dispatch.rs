//! The async loop that feeds triggers to the engine.
//!
//! ```text
//! producers ──mpsc──► Dispatcher ──spawn_blocking──► handle(engine, trigger)
//!                        │  ▲
//!              sweep tick┘  └── join results logged by ErrorKind
//! ```
//!
//! Shutdown (token cancelled or every sender dropped) stops intake; triggers
//! already running are awaited before `run` returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{EngineResult, ErrorKind};
use crate::pull::Engine;

use super::{Trigger, handle};

/// Buffer size for the trigger channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Receives triggers and runs them concurrently on the blocking pool.
pub struct Dispatcher {
    engine: Arc<Engine>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// A dispatcher sweeping at the engine's configured interval.
    pub fn new(engine: Arc<Engine>, shutdown: CancellationToken) -> Self {
        let sweep_interval = engine.config().sweep_interval;
        Dispatcher {
            engine,
            sweep_interval,
            shutdown,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Runs until the shutdown token is cancelled or the channel closes.
    #[instrument(skip_all, fields(sweep_secs = self.sweep_interval.as_secs()))]
    pub async fn run(self, mut rx: mpsc::Receiver<Trigger>) {
        info!("dispatcher started");

        let mut tasks = JoinSet::new();
        let first_sweep = Instant::now() + self.sweep_interval;
        let mut sweep = tokio::time::interval_at(first_sweep, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown signal received, stopping intake");
                    break;
                }

                trigger = rx.recv() => match trigger {
                    Some(trigger) => self.spawn(&mut tasks, trigger),
                    None => {
                        info!("trigger channel closed");
                        break;
                    }
                },

                _ = sweep.tick() => self.spawn(&mut tasks, Trigger::Sweep),

                Some(joined) = tasks.join_next() => report(joined),
            }
        }

        if !tasks.is_empty() {
            debug!(in_flight = tasks.len(), "waiting for running triggers");
        }
        while let Some(joined) = tasks.join_next().await {
            report(joined);
        }
        info!("dispatcher stopped");
    }

    fn spawn(&self, tasks: &mut JoinSet<(&'static str, EngineResult<()>)>, trigger: Trigger) {
        let name = trigger.name();
        debug!(trigger = name, "dispatching");
        let engine = Arc::clone(&self.engine);
        tasks.spawn_blocking(move || (name, handle(&engine, trigger)));
    }
}

fn report(joined: Result<(&'static str, EngineResult<()>), JoinError>) {
    match joined {
        Ok((name, Ok(()))) => debug!(trigger = name, "trigger handled"),
        Ok((name, Err(e))) => match e.kind() {
            ErrorKind::AlreadyInState => debug!(trigger = name, error = %e, "nothing to do"),
            ErrorKind::UserActionable => info!(trigger = name, error = %e, "trigger refused"),
            ErrorKind::Transient => warn!(trigger = name, error = %e, "trigger lost a race"),
            ErrorKind::Fatal => error!(trigger = name, error = %e, "trigger failed"),
        },
        Err(e) => error!(error = %e, "trigger task panicked"),
    }
}
