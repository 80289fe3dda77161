//! Polling tasks that look for new editions of one key.
//!
//! An [`EditionFetcher`] runs in rounds. A round first probes hinted editions, newest first,
//! then walks forward from the first unknown edition until it hits a number of consecutive
//! misses. Found editions are reported to the manager as slots, and if the round moved the
//! slot past the known good edition the content of the slot is fetched to confirm it.
//!
//! Temporary fetchers run a single round and then idle until they get a new hint or are
//! cancelled. Background fetchers keep polling with a delay that backs off while nothing new
//! shows up.

use std::{collections::BTreeSet, sync::Arc};

use n0_future::time::{self, Duration};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    config::Config,
    fetch::{Fetch, FetchRequest, ProbeOutcome},
    hint::probe_block,
    key::{Edition, VersionedKey},
    manager::WeakManager,
    metrics::Metrics,
};

/// Whether a fetcher stops after one round or keeps polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum FetcherMode {
    Once,
    Forever,
}

#[derive(Debug)]
pub(crate) enum FetcherCommand {
    /// Probe this edition in the next round.
    Hint(Edition),
    /// Switch to background polling.
    PollForever,
}

/// Handle to a running fetcher.
///
/// Returned by [`Manager::resolve_once`]. The fetcher is owned by the manager, dropping the
/// handle does not stop it.
///
/// [`Manager::resolve_once`]: crate::Manager::resolve_once
#[derive(Debug, Clone)]
pub struct FetcherHandle {
    id: u64,
    key: VersionedKey,
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<FetcherCommand>,
    rounds: watch::Receiver<u64>,
}

impl FetcherHandle {
    /// The key this fetcher polls.
    pub fn key(&self) -> &VersionedKey {
        &self.key
    }

    /// Whether the fetcher was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of polling rounds the fetcher completed so far.
    pub fn rounds(&self) -> u64 {
        *self.rounds.borrow()
    }

    /// Waits until the fetcher completed at least `n` rounds.
    ///
    /// Returns false if the fetcher stopped before that.
    pub async fn wait_rounds(&self, n: u64) -> bool {
        let mut rounds = self.rounds.clone();
        tokio::select! {
            biased;
            res = rounds.wait_for(|r| *r >= n) => res.is_ok(),
            _ = self.cancel.cancelled() => false,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn add_hint(&self, edition: Edition) {
        self.commands.send(FetcherCommand::Hint(edition)).ok();
    }

    pub(crate) fn poll_forever(&self) {
        self.commands.send(FetcherCommand::PollForever).ok();
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Everything an [`EditionFetcher`] needs besides its key.
#[derive(Debug, Clone)]
pub(crate) struct FetcherContext {
    pub manager: WeakManager,
    pub fetch: Arc<dyn Fetch>,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug)]
pub(crate) struct EditionFetcher {
    id: u64,
    key: VersionedKey,
    /// Lowest edition the fetcher walks from.
    origin: Edition,
    mode: FetcherMode,
    hints: BTreeSet<Edition>,
    backoff: Duration,
    ctx: FetcherContext,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<FetcherCommand>,
    rounds: watch::Sender<u64>,
}

impl EditionFetcher {
    /// Creates a fetcher and its handle. The fetcher does nothing until [`Self::run`].
    pub fn new(
        id: u64,
        key: VersionedKey,
        origin: Edition,
        mode: FetcherMode,
        ctx: FetcherContext,
        cancel: CancellationToken,
    ) -> (Self, FetcherHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (rounds_tx, rounds_rx) = watch::channel(0);
        let handle = FetcherHandle {
            id,
            key: key.clone(),
            cancel: cancel.clone(),
            commands: commands_tx,
            rounds: rounds_rx,
        };
        let fetcher = Self {
            id,
            key,
            origin,
            mode,
            hints: BTreeSet::new(),
            backoff: ctx.config.poll_interval,
            ctx,
            cancel,
            commands: commands_rx,
            rounds: rounds_tx,
        };
        (fetcher, handle)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &VersionedKey {
        &self.key
    }

    pub async fn run(mut self) {
        debug!(mode = %self.mode, origin = self.origin, "fetcher started");
        let cancel = self.cancel.clone();
        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = self.run_inner() => false,
        };
        debug!(cancelled, rounds = *self.rounds.borrow(), "fetcher stopped");
        if let Some(manager) = self.ctx.manager.upgrade() {
            manager.on_fetcher_exited(&self.key, self.id, cancelled);
        }
    }

    async fn run_inner(&mut self) {
        loop {
            let Some(found) = self.round().await else {
                // manager is gone
                return;
            };
            self.rounds.send_modify(|r| *r += 1);
            let Some(manager) = self.ctx.manager.upgrade() else {
                return;
            };
            manager.on_round_finished(&self.key);
            drop(manager);

            let command = match self.mode {
                FetcherMode::Once => self.commands.recv().await,
                FetcherMode::Forever => {
                    let wait = self.next_delay(found);
                    trace!(?wait, "next round");
                    tokio::select! {
                        command = self.commands.recv() => command,
                        _ = time::sleep(wait) => continue,
                    }
                }
            };
            let Some(command) = command else {
                // all handles dropped
                return;
            };
            self.apply(command);
            // pick up everything that arrived together
            while let Ok(command) = self.commands.try_recv() {
                self.apply(command);
            }
        }
    }

    fn apply(&mut self, command: FetcherCommand) {
        trace!(?command, "command");
        match command {
            FetcherCommand::Hint(edition) => {
                self.hints.insert(edition);
            }
            FetcherCommand::PollForever => {
                self.mode = FetcherMode::Forever;
                self.backoff = self.ctx.config.poll_interval;
            }
        }
    }

    /// Delay before the next background round.
    fn next_delay(&mut self, found: bool) -> Duration {
        let config = &self.ctx.config;
        if found {
            self.backoff = config.poll_interval;
            return config.poll_interval;
        }
        let wait = self.backoff;
        self.backoff = (self.backoff * 2).min(config.max_poll_interval);
        wait
    }

    /// Runs one polling round. Returns whether the slot advanced, or `None` if the manager
    /// is gone.
    async fn round(&mut self) -> Option<bool> {
        let mut found = false;

        let start = self.ctx.manager.upgrade()?.next_unknown(&self.key);
        let hints: Vec<_> = std::mem::take(&mut self.hints)
            .into_iter()
            .rev()
            .filter(|edition| *edition >= start)
            .collect();
        for edition in hints {
            if self.ctx.manager.upgrade()?.next_unknown(&self.key) > edition {
                continue;
            }
            if self.probe(edition).await == ProbeOutcome::Exists {
                found |= self.ctx.manager.upgrade()?.notify_slot(&self.key, edition);
                // older hints are covered now
                break;
            }
        }

        let mut edition = self
            .ctx
            .manager
            .upgrade()?
            .next_unknown(&self.key)
            .max(self.origin);
        let config = self.ctx.config.clone();
        let mut misses = 0;
        let mut probes = 0;
        while misses < config.min_failures && probes < config.max_probes_per_round {
            if self.probe(edition).await == ProbeOutcome::Exists {
                found |= self.ctx.manager.upgrade()?.notify_slot(&self.key, edition);
                misses = 0;
            } else {
                misses += 1;
            }
            probes += 1;
            edition = edition.saturating_add(1);
        }

        if found {
            self.confirm_slot().await;
        }
        self.ctx.metrics.poll_rounds.inc();
        Some(found)
    }

    async fn probe(&self, edition: Edition) -> ProbeOutcome {
        let outcome = probe_block(
            self.ctx.fetch.as_ref(),
            &self.ctx.metrics,
            self.key.at(edition),
        )
        .await;
        trace!(edition, %outcome, "probe");
        outcome
    }

    /// Fetches the content of the slot if it is ahead of the known good edition.
    async fn confirm_slot(&self) {
        let slot = {
            let Some(manager) = self.ctx.manager.upgrade() else {
                return;
            };
            let Some(slot) = manager.lookup_latest_slot(&self.key) else {
                return;
            };
            if manager.lookup_known_good(&self.key) >= Some(slot) {
                return;
            }
            slot
        };
        let res = self
            .ctx
            .fetch
            .fetch(FetchRequest::content(self.key.at(slot)))
            .await;
        match res {
            Ok(_) => {
                if let Some(manager) = self.ctx.manager.upgrade() {
                    manager.notify_known_good(&self.key, slot);
                }
            }
            Err(err) => debug!(slot, "content fetch failed: {err:#}"),
        }
    }
}
