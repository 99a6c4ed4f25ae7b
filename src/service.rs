use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::directory::TenantDirectory;
use crate::engine::slots::local_midnight;
use crate::engine::{
    AvailabilityCheck, BookingAction, Engine, NewBooking, Rescheduled, SchedulingError, fingerprint,
    generate_slots, now_ms, slot_grid,
};
use crate::limits::*;
use crate::model::*;

/// Create request as received from a caller, before tenant resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBooking {
    pub artisan_id: Ulid,
    pub customer_id: Ulid,
    pub service_id: Ulid,
    pub scheduled_at: Ms,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuery {
    pub artisan_id: Ulid,
    pub from: NaiveDate,
    /// Inclusive; equal to `from` for a single day.
    pub to: NaiveDate,
    pub duration_minutes: u32,
    /// Return the full grid with booked slots marked unavailable.
    pub include_booked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub booking: Booking,
    /// Answered from a stored idempotency record.
    pub replayed: bool,
}

fn validate_date_range(from: NaiveDate, to: NaiveDate) -> Result<(), SchedulingError> {
    if to < from {
        return Err(SchedulingError::Validation("end date is before start date".into()));
    }
    if (to - from).num_days() >= MAX_QUERY_DAYS {
        return Err(SchedulingError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

fn validate_idempotency_key(key: &str) -> Result<(), SchedulingError> {
    if key.trim().is_empty() {
        return Err(SchedulingError::Validation("idempotency key is empty".into()));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(SchedulingError::LimitExceeded("idempotency key too long"));
    }
    Ok(())
}

/// Absolute window covering `[from, to]` in every possible local offset.
fn widest_window(from: NaiveDate, to: NaiveDate) -> Result<Span, SchedulingError> {
    let after = to
        .succ_opt()
        .ok_or_else(|| SchedulingError::Validation("date out of range".into()))?;
    Ok(Span::new(
        local_midnight(from, MAX_UTC_OFFSET_MINUTES),
        local_midnight(after, -MAX_UTC_OFFSET_MINUTES),
    ))
}

fn log_rejection(op: &'static str, err: &SchedulingError) {
    crate::observability::record_conflict(err);
    match err {
        SchedulingError::WalError(_) | SchedulingError::Internal(_) => {
            tracing::error!(op, error = %err, "scheduling operation failed")
        }
        _ => tracing::debug!(op, error = %err, "scheduling operation rejected"),
    }
}

/// Orchestrates slot queries and booking mutations for one process.
///
/// Mutations run on a spawned task: a caller that goes away mid-request
/// cannot cancel a check-append-apply unit that already started.
#[derive(Clone)]
pub struct SchedulingService {
    engine: Arc<Engine>,
    directory: Arc<dyn TenantDirectory>,
}

impl SchedulingService {
    /// Service whose directory is the engine's own registry.
    pub fn new(engine: Arc<Engine>) -> Self {
        let directory: Arc<dyn TenantDirectory> = engine.clone();
        Self { engine, directory }
    }

    pub fn with_directory(engine: Arc<Engine>, directory: Arc<dyn TenantDirectory>) -> Self {
        Self { engine, directory }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    async fn require_artisan(&self, tenant_id: Ulid, artisan_id: Ulid) -> Result<(), SchedulingError> {
        match self.directory.artisan_tenant(artisan_id).await {
            None => Err(SchedulingError::NotFound(artisan_id)),
            Some(t) if t != tenant_id => Err(SchedulingError::Forbidden(format!(
                "artisan {artisan_id} belongs to another tenant"
            ))),
            Some(_) => Ok(()),
        }
    }

    async fn require_customer(&self, tenant_id: Ulid, customer_id: Ulid) -> Result<(), SchedulingError> {
        match self.directory.customer_tenant(customer_id).await {
            None => Err(SchedulingError::NotFound(customer_id)),
            Some(t) if t != tenant_id => Err(SchedulingError::Forbidden(format!(
                "customer {customer_id} belongs to another tenant"
            ))),
            Some(_) => Ok(()),
        }
    }

    // ── Slots ────────────────────────────────────────────────

    pub async fn get_available_slots(
        &self,
        tenant_id: Ulid,
        query: &SlotQuery,
    ) -> Result<Vec<TimeSlot>, SchedulingError> {
        if query.duration_minutes == 0 {
            return Err(SchedulingError::Validation("duration must be positive".into()));
        }
        if query.duration_minutes > MAX_BOOKING_MINUTES {
            return Err(SchedulingError::LimitExceeded("slot duration too long"));
        }
        validate_date_range(query.from, query.to)?;

        let snapshot = self
            .engine
            .snapshot(query.artisan_id, widest_window(query.from, query.to)?)
            .await?;
        if snapshot.tenant_id != tenant_id {
            return Err(SchedulingError::Forbidden(format!(
                "artisan {} belongs to another tenant",
                query.artisan_id
            )));
        }

        let busy = snapshot.active_spans();
        let (rules, offset) = (&snapshot.rules, snapshot.utc_offset_minutes);
        Ok(if query.include_booked {
            slot_grid(rules, &busy, query.from, query.to, query.duration_minutes, offset)
        } else {
            generate_slots(rules, &busy, query.from, query.to, query.duration_minutes, offset)
        })
    }

    pub async fn check_availability(
        &self,
        tenant_id: Ulid,
        artisan_id: Ulid,
        start: Ms,
        duration_minutes: u32,
    ) -> Result<AvailabilityCheck, SchedulingError> {
        self.engine
            .check_availability(tenant_id, artisan_id, start, duration_minutes)
            .await
    }

    // ── Booking mutations ────────────────────────────────────

    pub async fn create_booking(
        &self,
        tenant_id: Ulid,
        request: CreateBooking,
        idempotency_key: Option<String>,
    ) -> Result<Created, SchedulingError> {
        let result = self.create_inner(tenant_id, request, idempotency_key).await;
        if let Err(e) = &result {
            log_rejection("create_booking", e);
        }
        result
    }

    async fn create_inner(
        &self,
        tenant_id: Ulid,
        request: CreateBooking,
        idempotency_key: Option<String>,
    ) -> Result<Created, SchedulingError> {
        if let Some(key) = &idempotency_key {
            validate_idempotency_key(key)?;
        }
        self.require_artisan(tenant_id, request.artisan_id).await?;
        self.require_customer(tenant_id, request.customer_id).await?;

        let new = NewBooking {
            tenant_id,
            artisan_id: request.artisan_id,
            customer_id: request.customer_id,
            service_id: request.service_id,
            scheduled_at: request.scheduled_at,
            duration_minutes: request.duration_minutes,
        };
        let engine = self.engine.clone();

        let Some(key) = idempotency_key else {
            let booking = tokio::spawn(async move { engine.create_booking(&new, None).await })
                .await
                .map_err(join_error)??;
            return Ok(Created {
                booking,
                replayed: false,
            });
        };

        let fp = fingerprint(&new)?;
        let guarded = tokio::spawn(async move {
            let (e, req) = (&engine, &new);
            engine
                .idempotency
                .execute(tenant_id, &key, &fp, now_ms(), |stamp| async move {
                    e.create_booking(req, Some(stamp)).await.map(|b| b.id)
                })
                .await
        })
        .await
        .map_err(join_error)??;

        if guarded.replayed {
            metrics::counter!(crate::observability::IDEMPOTENT_REPLAYS_TOTAL).increment(1);
            tracing::debug!(booking_id = %guarded.booking_id, "idempotent create replayed");
        }
        let booking = self.engine.get_booking(guarded.booking_id).await?;
        Ok(Created {
            booking,
            replayed: guarded.replayed,
        })
    }

    pub async fn transition(
        &self,
        tenant_id: Ulid,
        booking_id: Ulid,
        action: BookingAction,
        expected_version: u64,
        note: Option<String>,
    ) -> Result<Booking, SchedulingError> {
        let engine = self.engine.clone();
        let result = tokio::spawn(async move {
            engine
                .transition(tenant_id, booking_id, action, expected_version, note)
                .await
        })
        .await
        .map_err(join_error)
        .and_then(|r| r);
        if let Err(e) = &result {
            log_rejection(action.as_str(), e);
        }
        result
    }

    pub async fn reschedule(
        &self,
        tenant_id: Ulid,
        booking_id: Ulid,
        expected_version: u64,
        new_start: Ms,
    ) -> Result<Rescheduled, SchedulingError> {
        let engine = self.engine.clone();
        let result = tokio::spawn(async move {
            engine
                .reschedule(tenant_id, booking_id, expected_version, new_start)
                .await
        })
        .await
        .map_err(join_error)
        .and_then(|r| r);
        if let Err(e) = &result {
            log_rejection("reschedule", e);
        }
        result
    }

    // ── Booking reads ────────────────────────────────────────

    pub async fn get_booking(&self, tenant_id: Ulid, booking_id: Ulid) -> Result<Booking, SchedulingError> {
        let booking = self.engine.get_booking(booking_id).await?;
        if booking.tenant_id != tenant_id {
            return Err(SchedulingError::Forbidden(format!(
                "booking {booking_id} belongs to another tenant"
            )));
        }
        Ok(booking)
    }

    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Page<Booking>, SchedulingError> {
        if filter.page == 0 {
            return Err(SchedulingError::Validation("page starts at 1".into()));
        }
        if filter.page_size == 0 || filter.page_size > MAX_PAGE_SIZE {
            return Err(SchedulingError::Validation(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(self.engine.list_bookings(filter).await)
    }

    /// Bookings of any status in the artisan's local days `[from, to]`.
    pub async fn artisan_schedule(
        &self,
        tenant_id: Ulid,
        artisan_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Booking>, SchedulingError> {
        validate_date_range(from, to)?;
        let info = self.engine.artisan_info(artisan_id).await?;
        let after = to
            .succ_opt()
            .ok_or_else(|| SchedulingError::Validation("date out of range".into()))?;
        let window = Span::new(
            local_midnight(from, info.utc_offset_minutes),
            local_midnight(after, info.utc_offset_minutes),
        );
        self.engine.artisan_schedule(tenant_id, artisan_id, window).await
    }

    // ── Availability rules ───────────────────────────────────

    pub async fn upsert_rule(&self, tenant_id: Ulid, rule: AvailabilityRule) -> Result<AvailabilityRule, SchedulingError> {
        self.engine.upsert_rule(tenant_id, rule).await
    }

    pub async fn bulk_upsert(
        &self,
        tenant_id: Ulid,
        artisan_id: Ulid,
        rules: Vec<AvailabilityRule>,
    ) -> Result<Vec<AvailabilityRule>, SchedulingError> {
        self.engine.bulk_upsert(tenant_id, artisan_id, rules).await
    }

    pub async fn list_rules(
        &self,
        tenant_id: Ulid,
        artisan_id: Ulid,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<Vec<AvailabilityRule>, SchedulingError> {
        if let Some((from, to)) = range
            && to < from
        {
            return Err(SchedulingError::Validation("end date is before start date".into()));
        }
        self.engine.list_rules(tenant_id, artisan_id, range).await
    }

    pub async fn get_rule(&self, tenant_id: Ulid, rule_id: Ulid) -> Result<AvailabilityRule, SchedulingError> {
        self.engine.get_rule(tenant_id, rule_id).await
    }

    pub async fn delete_rule(&self, tenant_id: Ulid, rule_id: Ulid) -> Result<AvailabilityRule, SchedulingError> {
        self.engine.delete_rule(tenant_id, rule_id).await
    }

    // ── Directory ────────────────────────────────────────────

    /// Register the artisan, or update it when it already exists in the
    /// caller's tenant. Returns `true` when newly registered.
    pub async fn put_artisan(
        &self,
        tenant_id: Ulid,
        artisan_id: Ulid,
        name: Option<String>,
        utc_offset_minutes: i32,
    ) -> Result<(ArtisanInfo, bool), SchedulingError> {
        match self.engine.artisan_tenant(artisan_id).await {
            None => {
                let info = self
                    .engine
                    .register_artisan(artisan_id, tenant_id, name, utc_offset_minutes)
                    .await?;
                Ok((info, true))
            }
            Some(_) => {
                let info = self
                    .engine
                    .update_artisan(tenant_id, artisan_id, name, utc_offset_minutes)
                    .await?;
                Ok((info, false))
            }
        }
    }

    pub async fn get_artisan(&self, tenant_id: Ulid, artisan_id: Ulid) -> Result<ArtisanInfo, SchedulingError> {
        let info = self.engine.artisan_info(artisan_id).await?;
        if info.tenant_id != tenant_id {
            return Err(SchedulingError::Forbidden(format!(
                "artisan {artisan_id} belongs to another tenant"
            )));
        }
        Ok(info)
    }

    pub async fn put_customer(&self, tenant_id: Ulid, customer_id: Ulid) -> Result<bool, SchedulingError> {
        self.engine.register_customer(customer_id, tenant_id).await
    }
}

fn join_error(e: tokio::task::JoinError) -> SchedulingError {
    SchedulingError::Internal(format!("scheduling task failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    use async_trait::async_trait;

    use crate::engine::EngineConfig;
    use crate::notify::NotifyHub;

    const H: Ms = 3_600_000;

    fn wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("artisched_test_service");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    struct Setup {
        service: SchedulingService,
        tenant: Ulid,
        artisan: Ulid,
        customer: Ulid,
    }

    async fn setup(name: &str, utc_offset_minutes: i32) -> Setup {
        let engine = Arc::new(
            Engine::new(wal_path(name), Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap(),
        );
        let service = SchedulingService::new(engine);
        let (tenant, artisan, customer) = (Ulid::new(), Ulid::new(), Ulid::new());
        let (_, created) = service
            .put_artisan(tenant, artisan, Some("Kim".into()), utc_offset_minutes)
            .await
            .unwrap();
        assert!(created);
        service.put_customer(tenant, customer).await.unwrap();
        service
            .upsert_rule(
                tenant,
                AvailabilityRule {
                    id: Ulid::new(),
                    artisan_id: artisan,
                    day_of_week: Some(1),
                    start_minute: 9 * 60,
                    end_minute: 12 * 60,
                    valid_from: None,
                    valid_to: None,
                    kind: RuleKind::Recurring,
                    created_at: 0,
                    updated_at: 0,
                },
            )
            .await
            .unwrap();
        Setup {
            service,
            tenant,
            artisan,
            customer,
        }
    }

    impl Setup {
        fn request(&self, start: Ms) -> CreateBooking {
            CreateBooking {
                artisan_id: self.artisan,
                customer_id: self.customer,
                service_id: Ulid::nil(),
                scheduled_at: start,
                duration_minutes: 60,
            }
        }

        fn query(&self) -> SlotQuery {
            SlotQuery {
                artisan_id: self.artisan,
                from: monday(),
                to: monday(),
                duration_minutes: 60,
                include_booked: false,
            }
        }
    }

    #[tokio::test]
    async fn returned_slot_is_bookable() {
        let s = setup("slot_bookable.wal", 0).await;
        let slots = s.service.get_available_slots(s.tenant, &s.query()).await.unwrap();
        assert_eq!(slots.len(), 3);

        let created = s
            .service
            .create_booking(s.tenant, s.request(slots[1].start), None)
            .await
            .unwrap();
        assert_eq!(created.booking.scheduled_at, slots[1].start);

        let after = s.service.get_available_slots(s.tenant, &s.query()).await.unwrap();
        assert_eq!(after.len(), 2);

        let mut grid = s.query();
        grid.include_booked = true;
        let grid = s.service.get_available_slots(s.tenant, &grid).await.unwrap();
        assert_eq!(grid.iter().map(|t| t.available).collect::<Vec<_>>(), vec![true, false, true]);
    }

    #[tokio::test]
    async fn slots_follow_artisan_offset() {
        // UTC+02:00: local 09:00 is 07:00 UTC.
        let s = setup("slot_offset.wal", 120).await;
        let slots = s.service.get_available_slots(s.tenant, &s.query()).await.unwrap();
        let base = local_midnight(monday(), 0);
        assert_eq!(slots[0].start, base + 7 * H);
    }

    #[tokio::test]
    async fn slot_query_validation() {
        let s = setup("slot_validation.wal", 0).await;
        let mut q = s.query();
        q.duration_minutes = 0;
        assert!(matches!(
            s.service.get_available_slots(s.tenant, &q).await,
            Err(SchedulingError::Validation(_))
        ));
        let mut q = s.query();
        q.to = monday().pred_opt().unwrap();
        assert!(s.service.get_available_slots(s.tenant, &q).await.is_err());
        let mut q = s.query();
        q.to = monday() + chrono::Days::new(MAX_QUERY_DAYS as u64);
        assert!(matches!(
            s.service.get_available_slots(s.tenant, &q).await,
            Err(SchedulingError::LimitExceeded(_))
        ));
        assert!(matches!(
            s.service.get_available_slots(Ulid::new(), &s.query()).await,
            Err(SchedulingError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn idempotency_key_replays_and_rejects_changed_body() {
        let s = setup("service_idempotency.wal", 0).await;
        let start = local_midnight(monday(), 0) + 9 * H;
        let first = s
            .service
            .create_booking(s.tenant, s.request(start), Some("abc".into()))
            .await
            .unwrap();
        let again = s
            .service
            .create_booking(s.tenant, s.request(start), Some("abc".into()))
            .await
            .unwrap();
        assert!(!first.replayed);
        assert!(again.replayed);
        assert_eq!(first.booking.id, again.booking.id);

        let changed = s
            .service
            .create_booking(s.tenant, s.request(start + H), Some("abc".into()))
            .await
            .unwrap_err();
        assert!(matches!(changed, SchedulingError::IdempotencyKeyReuse(_)));

        assert!(matches!(
            s.service
                .create_booking(s.tenant, s.request(start + H), Some("  ".into()))
                .await,
            Err(SchedulingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn check_availability_is_advisory() {
        let s = setup("service_check.wal", 0).await;
        let start = local_midnight(monday(), 0) + 10 * H;
        let free = s.service.check_availability(s.tenant, s.artisan, start, 60).await.unwrap();
        assert!(free.available);

        let b = s.service.create_booking(s.tenant, s.request(start), None).await.unwrap();
        let taken = s.service.check_availability(s.tenant, s.artisan, start, 30).await.unwrap();
        assert!(!taken.available);
        assert_eq!(taken.conflicting_booking_id, Some(b.booking.id));
    }

    #[tokio::test]
    async fn schedule_uses_local_days() {
        let s = setup("service_schedule.wal", 0).await;
        let start = local_midnight(monday(), 0) + 9 * H;
        s.service.create_booking(s.tenant, s.request(start), None).await.unwrap();
        let day = s
            .service
            .artisan_schedule(s.tenant, s.artisan, monday(), monday())
            .await
            .unwrap();
        assert_eq!(day.len(), 1);
        let next = monday().succ_opt().unwrap();
        let empty = s.service.artisan_schedule(s.tenant, s.artisan, next, next).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn put_artisan_updates_in_place() {
        let s = setup("service_put_artisan.wal", 0).await;
        let (info, created) = s
            .service
            .put_artisan(s.tenant, s.artisan, Some("Kim L.".into()), 60)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(info.utc_offset_minutes, 60);
        assert_eq!(info.rule_count, 1);
        assert!(matches!(
            s.service.put_artisan(Ulid::new(), s.artisan, None, 0).await,
            Err(SchedulingError::Forbidden(_))
        ));
    }

    /// Directory backed by a fixed map, standing in for an external registry.
    struct StaticDirectory {
        customers: HashMap<Ulid, Ulid>,
        artisans: HashMap<Ulid, Ulid>,
    }

    #[async_trait]
    impl TenantDirectory for StaticDirectory {
        async fn customer_tenant(&self, customer_id: Ulid) -> Option<Ulid> {
            self.customers.get(&customer_id).copied()
        }

        async fn artisan_tenant(&self, artisan_id: Ulid) -> Option<Ulid> {
            self.artisans.get(&artisan_id).copied()
        }
    }

    #[tokio::test]
    async fn external_directory_enforces_customer_tenant() {
        let s = setup("service_directory.wal", 0).await;
        let foreign_customer = Ulid::new();
        let directory = StaticDirectory {
            customers: HashMap::from([(foreign_customer, Ulid::new())]),
            artisans: HashMap::from([(s.artisan, s.tenant)]),
        };
        let service = SchedulingService::with_directory(s.service.engine().clone(), Arc::new(directory));
        let start = local_midnight(monday(), 0) + 9 * H;

        let mut req = s.request(start);
        req.customer_id = foreign_customer;
        assert!(matches!(
            service.create_booking(s.tenant, req, None).await,
            Err(SchedulingError::Forbidden(_))
        ));

        let mut req = s.request(start);
        req.customer_id = Ulid::new();
        assert!(matches!(
            service.create_booking(s.tenant, req, None).await,
            Err(SchedulingError::NotFound(_))
        ));
    }
}
