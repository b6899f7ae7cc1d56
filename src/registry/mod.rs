mod calendar;
mod error;
mod transitions;

pub use calendar::{build_snapshot, materialize_starts, validate_template};
pub use error::TransitionError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::booking::BookingStore;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCalendar = Arc<RwLock<ResourceCalendar>>;

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
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
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

/// Authoritative slot state for every resource this process coordinates.
/// One write lock per resource calendar; the CAS transitions in
/// `transitions.rs` are the only mutation path.
pub struct Registry {
    pub state: DashMap<Ulid, SharedCalendar>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) bookings: Arc<dyn BookingStore>,
    pub(super) hold_ttl: chrono::Duration,
}

/// Apply an event directly to a calendar (no locking — caller holds the lock).
fn apply_to_calendar(cal: &mut ResourceCalendar, event: &Event) {
    match event {
        Event::ScheduleDefined { template, .. } => {
            // Overrides survive a template change; a hold's liveness is
            // tied solely to its lease.
            cal.template = template.clone();
        }
        Event::HoldPlaced {
            start,
            holder,
            held_at,
            expires_at,
            ..
        } => {
            cal.overrides.insert(
                *start,
                SlotOverride::Held {
                    holder: holder.clone(),
                    held_at: *held_at,
                    expires_at: *expires_at,
                },
            );
        }
        Event::HoldReleased { start, .. } => {
            cal.overrides.remove(start);
        }
        Event::SlotBooked {
            start, booking_id, ..
        }
        | Event::SlotOccupied {
            start, booking_id, ..
        } => {
            cal.overrides.insert(
                *start,
                SlotOverride::Booked {
                    booking_id: *booking_id,
                },
            );
        }
    }
}

impl Registry {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        bookings: Arc<dyn BookingStore>,
        hold_ttl: chrono::Duration,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Replay into plain calendars first; nothing else can observe them
        // until they are wrapped and inserted below.
        let mut calendars: HashMap<Ulid, ResourceCalendar> = HashMap::new();
        for event in &events {
            let cal = calendars
                .entry(event.resource_id())
                .or_insert_with_key(|id| ResourceCalendar::new(*id));
            apply_to_calendar(cal, event);
        }

        let state = DashMap::new();
        for (id, cal) in calendars {
            state.insert(id, Arc::new(RwLock::new(cal)));
        }

        Ok(Self {
            state,
            wal_tx,
            notify,
            bookings,
            hold_ttl,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), TransitionError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| TransitionError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| TransitionError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| TransitionError::Wal(e.to_string()))
    }

    pub fn get_calendar(&self, id: &Ulid) -> Option<SharedCalendar> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// Lazy materialization: resources exist the moment something refers
    /// to them.
    pub(super) fn get_or_create(&self, id: Ulid) -> Result<SharedCalendar, TransitionError> {
        if let Some(cal) = self.state.get(&id) {
            return Ok(cal.value().clone());
        }
        if self.state.len() >= MAX_RESOURCES {
            return Err(TransitionError::LimitExceeded("too many resources"));
        }
        let cal = self
            .state
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceCalendar::new(id))))
            .value()
            .clone();
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(self.state.len() as f64);
        Ok(cal)
    }

    /// WAL-append + apply + notify in one call. The event is broadcast only
    /// after it is durable and applied, so subscribers never see state the
    /// registry could still lose.
    pub(super) async fn persist_and_apply(
        &self,
        cal: &mut ResourceCalendar,
        event: &Event,
    ) -> Result<(), TransitionError> {
        self.wal_append(event).await?;
        apply_to_calendar(cal, event);
        self.notify.send(cal.id, event);
        Ok(())
    }

    /// Scan for holds past their deadline. Uses try_read so a busy resource
    /// is skipped and picked up on the next sweep.
    pub fn collect_expired_holds(&self, now: Stamp) -> Vec<(Ulid, Stamp)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            let Ok(guard) = entry.value().try_read() else {
                continue;
            };
            for (start, ov) in &guard.overrides {
                if let SlotOverride::Held { expires_at, .. } = ov
                    && *expires_at <= now
                {
                    expired.push((guard.id, *start));
                }
            }
        }
        expired
    }

    /// Appends since the last compaction, asked of the writer task.
    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL down to the minimal event set recreating current
    /// state: one ScheduleDefined per non-empty template, one HoldPlaced per
    /// live hold, one SlotBooked per booked slot. Dead holds are dropped.
    /// Returns the number of events written.
    pub async fn compact_wal(&self) -> Result<usize, TransitionError> {
        // Clone the Arcs out first so no DashMap shard lock is held across
        // an await.
        let calendars: Vec<SharedCalendar> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let now = Utc::now();

        let mut events = Vec::new();
        for cal in calendars {
            let guard = cal.read().await;
            if !guard.template.windows.is_empty() {
                events.push(Event::ScheduleDefined {
                    resource_id: guard.id,
                    template: guard.template.clone(),
                });
            }
            for (start, ov) in &guard.overrides {
                match ov {
                    SlotOverride::Held {
                        holder,
                        held_at,
                        expires_at,
                    } => {
                        if *expires_at <= now {
                            continue;
                        }
                        events.push(Event::HoldPlaced {
                            resource_id: guard.id,
                            start: *start,
                            holder: holder.clone(),
                            held_at: *held_at,
                            expires_at: *expires_at,
                        });
                    }
                    SlotOverride::Booked { booking_id } => {
                        // Booked and occupied replay identically; the
                        // rewrite keeps only the booked form.
                        events.push(Event::SlotBooked {
                            resource_id: guard.id,
                            start: *start,
                            booking_id: *booking_id,
                        });
                    }
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| TransitionError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| TransitionError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| TransitionError::Wal(e.to_string()))?;
        Ok(count)
    }
}
