use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, SchedulingError};

fn validate_name(name: Option<&str>) -> Result<(), SchedulingError> {
    if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(SchedulingError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_offset(utc_offset_minutes: i32) -> Result<(), SchedulingError> {
    if utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(SchedulingError::Validation(format!(
            "utc offset {utc_offset_minutes} outside ±{MAX_UTC_OFFSET_MINUTES} minutes"
        )));
    }
    Ok(())
}

/// Shape checks on a single availability rule.
pub(crate) fn validate_rule(rule: &AvailabilityRule) -> Result<(), SchedulingError> {
    if rule.start_minute >= rule.end_minute {
        return Err(SchedulingError::Validation(
            "start_time must be before end_time".into(),
        ));
    }
    if rule.end_minute > MINUTES_PER_DAY {
        return Err(SchedulingError::Validation("end_time is past 24:00".into()));
    }
    if rule.day_of_week.is_some_and(|d| d > 6) {
        return Err(SchedulingError::Validation(
            "day_of_week must be 0 (Sunday) to 6 (Saturday)".into(),
        ));
    }
    match rule.kind {
        RuleKind::Recurring if rule.day_of_week.is_none() => {
            return Err(SchedulingError::Validation(
                "recurring rules need a day_of_week".into(),
            ));
        }
        kind if kind.is_override() && rule.valid_from.is_none() => {
            return Err(SchedulingError::Validation(
                "override rules need a valid_from date".into(),
            ));
        }
        _ => {}
    }
    if let (Some(from), Some(to)) = (rule.valid_from, rule.valid_to)
        && from > to
    {
        return Err(SchedulingError::Validation(
            "valid_from must not be after valid_to".into(),
        ));
    }
    Ok(())
}

fn check_tenant(state: &ArtisanState, tenant_id: Ulid) -> Result<(), SchedulingError> {
    if state.tenant_id != tenant_id {
        return Err(SchedulingError::Forbidden(format!(
            "artisan {} belongs to another tenant",
            state.id
        )));
    }
    Ok(())
}

impl Engine {
    // ── Directory ────────────────────────────────────────────

    pub async fn register_artisan(
        &self,
        id: Ulid,
        tenant_id: Ulid,
        name: Option<String>,
        utc_offset_minutes: i32,
    ) -> Result<ArtisanInfo, SchedulingError> {
        validate_name(name.as_deref())?;
        validate_offset(utc_offset_minutes)?;

        let _gate = self.compaction_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        if self.artisans.contains_key(&id) {
            return Err(SchedulingError::Validation(format!(
                "artisan {id} is already registered"
            )));
        }
        if self.artisans.len() >= MAX_ARTISANS {
            return Err(SchedulingError::LimitExceeded("too many artisans"));
        }

        let event = Event::ArtisanRegistered {
            id,
            tenant_id,
            name: name.clone(),
            utc_offset_minutes,
        };
        self.wal_append(&event).await?;
        let state = ArtisanState::new(id, tenant_id, name, utc_offset_minutes);
        let info = state.info();
        self.artisans.insert(id, Arc::new(RwLock::new(state)));
        metrics::gauge!(crate::observability::ARTISANS_ACTIVE).set(self.artisans.len() as f64);
        self.notify.send(tenant_id, &event);
        tracing::info!(artisan_id = %id, tenant_id = %tenant_id, "artisan registered");
        Ok(info)
    }

    pub async fn update_artisan(
        &self,
        tenant_id: Ulid,
        id: Ulid,
        name: Option<String>,
        utc_offset_minutes: i32,
    ) -> Result<ArtisanInfo, SchedulingError> {
        validate_name(name.as_deref())?;
        validate_offset(utc_offset_minutes)?;

        let _gate = self.compaction_gate.read().await;
        let artisan = self.artisan(&id)?;
        let mut guard = artisan.write().await;
        check_tenant(&guard, tenant_id)?;
        let event = Event::ArtisanUpdated {
            id,
            name,
            utc_offset_minutes,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.info())
    }

    pub async fn artisan_info(&self, id: Ulid) -> Result<ArtisanInfo, SchedulingError> {
        let artisan = self.artisan(&id)?;
        let guard = artisan.read().await;
        Ok(guard.info())
    }

    /// Register a customer under a tenant. Re-registering under the same
    /// tenant is a no-op and returns `false`.
    pub async fn register_customer(&self, id: Ulid, tenant_id: Ulid) -> Result<bool, SchedulingError> {
        let _gate = self.compaction_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        if let Some(existing) = self.customers.get(&id).map(|e| *e.value()) {
            if existing != tenant_id {
                return Err(SchedulingError::Forbidden(format!(
                    "customer {id} belongs to another tenant"
                )));
            }
            return Ok(false);
        }
        if self.customers.len() >= MAX_CUSTOMERS {
            return Err(SchedulingError::LimitExceeded("too many customers"));
        }

        let event = Event::CustomerRegistered { id, tenant_id };
        self.wal_append(&event).await?;
        self.customers.insert(id, tenant_id);
        self.notify.send(tenant_id, &event);
        Ok(true)
    }

    // ── Availability rules ───────────────────────────────────

    /// Rules of an artisan, optionally only those valid within `[from, to]`.
    pub async fn list_rules(
        &self,
        tenant_id: Ulid,
        artisan_id: Ulid,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<Vec<AvailabilityRule>, SchedulingError> {
        let artisan = self.artisan(&artisan_id)?;
        let mut rules = {
            let guard = artisan.read().await;
            check_tenant(&guard, tenant_id)?;
            guard.rules.clone()
        };
        if let Some((from, to)) = range {
            rules.retain(|r| r.valid_within(from, to));
        }
        rules.sort_by_key(|r| (r.kind.is_override(), r.day_of_week, r.valid_from, r.start_minute));
        Ok(rules)
    }

    pub async fn get_rule(&self, tenant_id: Ulid, id: Ulid) -> Result<AvailabilityRule, SchedulingError> {
        let artisan = self.artisan_for_rule(&id)?;
        let guard = artisan.read().await;
        check_tenant(&guard, tenant_id)?;
        guard
            .rules
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(SchedulingError::NotFound(id))
    }

    /// A rule id stays with the artisan that first stored it. Call with
    /// `rule_owner_lock` held until the upsert is applied.
    fn check_rule_owner(&self, rule_id: Ulid, artisan_id: Ulid) -> Result<(), SchedulingError> {
        match self.idx.rules.get(&rule_id).map(|e| *e.value()) {
            Some(owner) if owner != artisan_id => Err(SchedulingError::Validation(format!(
                "rule {rule_id} belongs to another artisan"
            ))),
            _ => Ok(()),
        }
    }

    /// Create or replace a rule. `created_at` of an existing rule is kept.
    pub async fn upsert_rule(
        &self,
        tenant_id: Ulid,
        mut rule: AvailabilityRule,
    ) -> Result<AvailabilityRule, SchedulingError> {
        validate_rule(&rule)?;

        let _gate = self.compaction_gate.read().await;
        let _owners = self.rule_owner_lock.lock().await;
        self.check_rule_owner(rule.id, rule.artisan_id)?;
        let artisan = self.artisan(&rule.artisan_id)?;
        let mut guard = artisan.write().await;
        check_tenant(&guard, tenant_id)?;

        let now = now_ms();
        match guard.rules.iter().find(|r| r.id == rule.id) {
            Some(existing) => rule.created_at = existing.created_at,
            None if guard.rules.len() >= MAX_RULES_PER_ARTISAN => {
                return Err(SchedulingError::LimitExceeded("too many rules for artisan"));
            }
            None => rule.created_at = now,
        }
        rule.updated_at = now;

        let event = Event::RuleUpserted { rule: rule.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!(rule_id = %rule.id, artisan_id = %rule.artisan_id, kind = rule.kind.as_str(), "rule upserted");
        Ok(rule)
    }

    /// Upsert many rules for one artisan as a single unit: either every
    /// rule is valid and all are stored, or none are.
    pub async fn bulk_upsert(
        &self,
        tenant_id: Ulid,
        artisan_id: Ulid,
        mut rules: Vec<AvailabilityRule>,
    ) -> Result<Vec<AvailabilityRule>, SchedulingError> {
        if rules.is_empty() {
            return Err(SchedulingError::Validation("no rules given".into()));
        }
        if rules.len() > MAX_BULK_RULES {
            return Err(SchedulingError::LimitExceeded("too many rules in one request"));
        }
        for (i, rule) in rules.iter().enumerate() {
            if rule.artisan_id != artisan_id {
                return Err(SchedulingError::Validation(format!(
                    "rule {i} targets a different artisan"
                )));
            }
            validate_rule(rule)
                .map_err(|e| SchedulingError::Validation(format!("rule {i}: {e}")))?;
        }

        let _gate = self.compaction_gate.read().await;
        let _owners = self.rule_owner_lock.lock().await;
        for rule in &rules {
            self.check_rule_owner(rule.id, artisan_id)?;
        }
        let artisan = self.artisan(&artisan_id)?;
        let mut guard = artisan.write().await;
        check_tenant(&guard, tenant_id)?;

        let now = now_ms();
        let mut added = 0usize;
        for rule in rules.iter_mut() {
            match guard.rules.iter().find(|r| r.id == rule.id) {
                Some(existing) => rule.created_at = existing.created_at,
                None => {
                    rule.created_at = now;
                    added += 1;
                }
            }
            rule.updated_at = now;
        }
        if guard.rules.len() + added > MAX_RULES_PER_ARTISAN {
            return Err(SchedulingError::LimitExceeded("too many rules for artisan"));
        }

        let event = Event::RulesUpserted {
            artisan_id,
            rules: rules.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(artisan_id = %artisan_id, count = rules.len(), "rules upserted");
        Ok(rules)
    }

    pub async fn delete_rule(&self, tenant_id: Ulid, id: Ulid) -> Result<AvailabilityRule, SchedulingError> {
        let _gate = self.compaction_gate.read().await;
        let artisan = self.artisan_for_rule(&id)?;
        let mut guard = artisan.write().await;
        check_tenant(&guard, tenant_id)?;
        let rule = guard
            .rules
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(SchedulingError::NotFound(id))?;

        let event = Event::RuleDeleted {
            id,
            artisan_id: guard.id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(rule)
    }
}
