mod catalog;
mod clock;
mod conflict;
mod error;
mod interval;
mod mutations;
mod queries;
mod store;

pub use catalog::ContentCatalog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{resolve, ResolvedPlacement, ShiftAnchor};
pub use error::EngineError;
pub use interval::{derive_end, gap, overlaps, resolve_duration};
pub use store::Timeline;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::limits::DEFAULT_FALLBACK_DURATION_SECS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// Placement policy knobs, fixed for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub shift_anchor: ShiftAnchor,
    /// Check a shifted slot once more and refuse it if it still overlaps.
    pub recheck_after_shift: bool,
    pub fallback_duration_secs: Secs,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shift_anchor: ShiftAnchor::default(),
            recheck_after_shift: false,
            fallback_duration_secs: DEFAULT_FALLBACK_DURATION_SECS,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have before handling it.
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One display's scheduling engine.
///
/// The timeline lives behind a single `RwLock`: every mutation (schedules and
/// contents alike) runs read-resolve-write under the write lock, readers get a
/// consistent snapshot under the read lock.
pub struct Engine {
    pub(super) timeline: RwLock<Timeline>,
    pub(super) catalog: ContentCatalog,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: EngineConfig,
}

/// Apply an event to the in-memory state (caller holds the timeline write lock).
fn apply_event(timeline: &mut Timeline, catalog: &ContentCatalog, event: &Event) {
    match event {
        Event::ContentRegistered { content } => catalog.insert(content.clone()),
        Event::ContentUpdated {
            id,
            title,
            default_duration,
        } => catalog.update(id, title.clone(), *default_duration),
        Event::ContentRemoved { id } => {
            catalog.remove(id);
        }
        Event::ScheduleCreated { entry } => timeline.insert(entry.clone()),
        Event::ScheduleUpdated { entry } => {
            timeline.update(entry.clone());
        }
        Event::ScheduleDeleted { id } => {
            timeline.remove(id);
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        Self::with_clock(wal_path, notify, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Nobody else can see this state yet, so replay needs no locking.
        let mut timeline = Timeline::new();
        let catalog = ContentCatalog::new();
        for event in &events {
            apply_event(&mut timeline, &catalog, event);
        }
        if !events.is_empty() {
            tracing::debug!(
                "replayed {} events: {} contents, {} schedules",
                events.len(),
                catalog.len(),
                timeline.len()
            );
        }

        Ok(Self {
            timeline: RwLock::new(timeline),
            catalog,
            wal_tx,
            notify,
            clock,
            config,
        })
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        timeline: &mut Timeline,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(timeline, &self.catalog, event);
        self.notify.send(event);
        Ok(())
    }
}
