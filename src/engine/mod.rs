mod bookings;
mod conflict;
mod error;
mod idempotency;
mod lifecycle;
mod rules;
pub mod slots;

pub use bookings::{AvailabilityCheck, NewBooking, Rescheduled, ScheduleSnapshot};
pub use error::SchedulingError;
pub use idempotency::{Guarded, IdempotencyGuard, fingerprint};
pub use lifecycle::{BookingAction, allowed_actions, next_status};
pub use slots::{generate_slots, merge_overlapping, slot_grid, subtract_intervals};

pub(crate) use conflict::now_ms;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::directory::TenantDirectory;
use crate::limits::MAX_IDEMPOTENCY_RECORDS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedArtisanState = Arc<RwLock<ArtisanState>>;

/// Engine-level switches taken from the runtime configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reject bookings that fall outside the artisan's open hours.
    pub require_open_hours: bool,
    pub idempotency_ttl_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            require_open_hours: true,
            idempotency_ttl_ms: 24 * 60 * 60 * 1000,
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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Appends that arrive while a batch
/// is being collected share one fsync; every sender hears the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
        }
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

/// Append and fsync a batch. On failure the log is cut back to the last
/// commit, so a rejected event never shows up on replay.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!(error = %e, "WAL rollback failed");
    }
    result
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed as control command")));
        }
    }
}

/// Indexes maintained alongside the per-artisan state.
#[derive(Default)]
pub(super) struct Indexes {
    /// booking id → artisan id
    pub bookings: DashMap<Ulid, Ulid>,
    /// rule id → artisan id
    pub rules: DashMap<Ulid, Ulid>,
}

/// Apply an artisan-scoped event. The caller holds the artisan's write lock.
fn apply_to_artisan(state: &mut ArtisanState, event: &Event, idx: &Indexes) {
    match event {
        Event::ArtisanUpdated {
            name,
            utc_offset_minutes,
            ..
        } => {
            state.name = name.clone();
            state.utc_offset_minutes = *utc_offset_minutes;
        }
        Event::RuleUpserted { rule } => {
            idx.rules.insert(rule.id, state.id);
            state.upsert_rule(rule.clone());
        }
        Event::RulesUpserted { rules, .. } => {
            for rule in rules {
                idx.rules.insert(rule.id, state.id);
                state.upsert_rule(rule.clone());
            }
        }
        Event::RuleDeleted { id, .. } => {
            state.remove_rule(id);
            idx.rules.remove(id);
        }
        Event::BookingCreated { booking, .. } => {
            idx.bookings.insert(booking.id, state.id);
            state.insert_booking(booking.clone());
        }
        Event::BookingStatusChanged {
            id,
            status,
            version,
            at,
            note,
            ..
        } => {
            if let Some(b) = state.booking_mut(id) {
                b.status = *status;
                b.version = *version;
                b.updated_at = *at;
                b.note = note.clone();
            }
        }
        Event::BookingRescheduled {
            id,
            version,
            at,
            replacement,
            ..
        } => {
            if let Some(b) = state.booking_mut(id) {
                b.status = BookingStatus::Cancelled;
                b.version = *version;
                b.updated_at = *at;
            }
            idx.bookings.insert(replacement.id, state.id);
            state.insert_booking(replacement.clone());
        }
        // Directory registrations are applied at the map level.
        Event::ArtisanRegistered { .. } | Event::CustomerRegistered { .. } => {}
    }
}

pub struct Engine {
    pub(super) artisans: DashMap<Ulid, SharedArtisanState>,
    /// customer id → tenant id
    pub(super) customers: DashMap<Ulid, Ulid>,
    pub(super) idx: Indexes,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every WAL-writing mutation and exclusively by
    /// compaction, so no append lands between snapshot and file swap.
    /// Always acquired before any artisan lock.
    pub(super) compaction_gate: RwLock<()>,
    /// Serializes artisan and customer registration.
    pub(super) directory_lock: Mutex<()>,
    /// Held across a rule upsert so a rule id cannot be claimed by two
    /// artisans at once. Taken after the gate, before any artisan lock.
    pub(super) rule_owner_lock: Mutex<()>,
    pub notify: Arc<NotifyHub>,
    pub idempotency: IdempotencyGuard,
    pub(super) config: EngineConfig,
}

impl Engine {
    /// Replay the WAL at `wal_path`, cut any torn tail, then start the
    /// writer task. Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.torn_tail {
            Wal::truncate(&wal_path, replay.valid_len)?;
            tracing::warn!(
                path = %wal_path.display(),
                valid_len = replay.valid_len,
                "truncated WAL to last intact frame"
            );
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            artisans: DashMap::new(),
            customers: DashMap::new(),
            idx: Indexes::default(),
            wal_tx,
            compaction_gate: RwLock::new(()),
            directory_lock: Mutex::new(()),
            rule_owner_lock: Mutex::new(()),
            notify,
            idempotency: IdempotencyGuard::new(config.idempotency_ttl_ms, MAX_IDEMPOTENCY_RECORDS),
            config,
        };

        // Rebuild plain state first and wrap it in locks at the end.
        let now = now_ms();
        let mut states: HashMap<Ulid, ArtisanState> = HashMap::new();
        for event in &replay.events {
            match event {
                Event::ArtisanRegistered {
                    id,
                    tenant_id,
                    name,
                    utc_offset_minutes,
                } => {
                    states.insert(
                        *id,
                        ArtisanState::new(*id, *tenant_id, name.clone(), *utc_offset_minutes),
                    );
                }
                Event::CustomerRegistered { id, tenant_id } => {
                    engine.customers.insert(*id, *tenant_id);
                }
                other => {
                    if let Some(state) = other.artisan_id().and_then(|id| states.get_mut(&id)) {
                        apply_to_artisan(state, other, &engine.idx);
                    }
                    if let Event::BookingCreated {
                        booking,
                        idempotency: Some(stamp),
                    } = other
                    {
                        engine.idempotency.restore(stamp_record(booking, stamp), now);
                    }
                }
            }
        }
        for (id, state) in states {
            engine.artisans.insert(id, Arc::new(RwLock::new(state)));
        }
        metrics::gauge!(crate::observability::ARTISANS_ACTIVE).set(engine.artisans.len() as f64);

        tracing::info!(
            path = %wal_path.display(),
            events = replay.events.len(),
            torn_tail = replay.torn_tail,
            artisans = engine.artisans.len(),
            customers = engine.customers.len(),
            "engine state replayed"
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), SchedulingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| SchedulingError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulingError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| SchedulingError::WalError(e.to_string()))
    }

    /// WAL-append, apply and broadcast. Only a durable event is applied.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut ArtisanState,
        event: &Event,
    ) -> Result<(), SchedulingError> {
        self.wal_append(event).await?;
        apply_to_artisan(state, event, &self.idx);
        self.notify.send(state.tenant_id, event);
        Ok(())
    }

    pub(super) fn artisan(&self, id: &Ulid) -> Result<SharedArtisanState, SchedulingError> {
        self.artisans
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(SchedulingError::NotFound(*id))
    }

    pub(super) fn artisan_for_booking(&self, booking_id: &Ulid) -> Result<SharedArtisanState, SchedulingError> {
        let artisan_id = self
            .idx
            .bookings
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or(SchedulingError::NotFound(*booking_id))?;
        self.artisan(&artisan_id)
    }

    pub(super) fn artisan_for_rule(&self, rule_id: &Ulid) -> Result<SharedArtisanState, SchedulingError> {
        let artisan_id = self
            .idx
            .rules
            .get(rule_id)
            .map(|e| *e.value())
            .ok_or(SchedulingError::NotFound(*rule_id))?;
        self.artisan(&artisan_id)
    }

    pub fn artisan_count(&self) -> usize {
        self.artisans.len()
    }

    pub fn require_open_hours(&self) -> bool {
        self.config.require_open_hours
    }

    /// Rewrite the WAL as the minimal event set reproducing current state.
    pub async fn compact_wal(&self) -> Result<(), SchedulingError> {
        let _gate = self.compaction_gate.write().await;
        let now = now_ms();
        let mut events: Vec<Event> = self
            .customers
            .iter()
            .map(|e| Event::CustomerRegistered {
                id: *e.key(),
                tenant_id: *e.value(),
            })
            .collect();

        let shared: Vec<SharedArtisanState> = self.artisans.iter().map(|e| e.value().clone()).collect();
        for artisan in shared {
            let state = artisan.read().await;
            events.push(Event::ArtisanRegistered {
                id: state.id,
                tenant_id: state.tenant_id,
                name: state.name.clone(),
                utc_offset_minutes: state.utc_offset_minutes,
            });
            if !state.rules.is_empty() {
                events.push(Event::RulesUpserted {
                    artisan_id: state.id,
                    rules: state.rules.clone(),
                });
            }
            for booking in &state.bookings {
                let idempotency = booking
                    .idempotency_key
                    .as_deref()
                    .and_then(|key| self.idempotency.record(booking.tenant_id, key, now))
                    .filter(|r| r.result_booking_id == booking.id)
                    .map(|r| IdempotencyStamp {
                        key: r.key,
                        fingerprint: r.request_fingerprint,
                        expires_at: r.expires_at,
                    });
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                    idempotency,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| SchedulingError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulingError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| SchedulingError::WalError(e.to_string()))?;
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
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
}

fn stamp_record(booking: &Booking, stamp: &IdempotencyStamp) -> IdempotencyRecord {
    IdempotencyRecord {
        key: stamp.key.clone(),
        tenant_id: booking.tenant_id,
        request_fingerprint: stamp.fingerprint.clone(),
        result_booking_id: booking.id,
        created_at: booking.created_at,
        expires_at: stamp.expires_at,
    }
}

#[async_trait]
impl TenantDirectory for Engine {
    async fn customer_tenant(&self, customer_id: Ulid) -> Option<Ulid> {
        self.customers.get(&customer_id).map(|e| *e.value())
    }

    async fn artisan_tenant(&self, artisan_id: Ulid) -> Option<Ulid> {
        let artisan = self.artisans.get(&artisan_id)?.value().clone();
        let tenant_id = artisan.read().await.tenant_id;
        Some(tenant_id)
    }
}
