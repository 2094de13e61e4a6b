//! Consumption sensor ingest and liveness tracking.

use crate::accounts::UserId;
use crate::amount::Amount;
use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::store::Applied;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

/// A sensor that pinged within this window counts as live.
pub const LIVENESS_WINDOW: Duration = Duration::seconds(90);
/// Consecutive missed windows before a sensor is reported inactive.
pub const MAX_MISSED_WINDOWS: u32 = 3;

pub fn is_live(last_ping: OffsetDateTime, now: OffsetDateTime) -> bool {
    now - last_ping < LIVENESS_WINDOW
}

/// Parse a raw reading (decimal string or JSON number) into a positive amount.
pub fn parse_reading(raw: &Value) -> Result<Amount, LedgerError> {
    let credits = Amount::from_json(raw)
        .map_err(|e| LedgerError::Validation(format!("invalid credits used: {}", e)))?;
    if credits.is_zero() {
        return Err(LedgerError::Validation(
            "credits used must be greater than zero".into(),
        ));
    }
    Ok(credits)
}

impl Ledger {
    /// Debit a sensor reading against the user's balance.
    pub fn ingest(&self, user_id: UserId, credits_used: &Value) -> Result<Applied, LedgerError> {
        let credits = parse_reading(credits_used)?;
        self.apply_consumption(user_id, credits)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Active,
    /// Missed at least one window but not yet written off.
    Degraded { missed: u32 },
    Inactive,
}

/// In-process tally of missed liveness windows per user. Not persisted;
/// a restart begins every sensor at zero misses.
#[derive(Debug, Default)]
pub struct SensorMonitor {
    missed: HashMap<UserId, u32>,
}

impl SensorMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one liveness check for `user_id` at `now` and return its status.
    pub fn observe(
        &mut self,
        user_id: UserId,
        last_ping: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> SensorStatus {
        if last_ping.is_some_and(|ping| is_live(ping, now)) {
            self.missed.remove(&user_id);
            return SensorStatus::Active;
        }
        self.record_failure(user_id)
    }

    /// Count a missed window (stale ping or an unreachable sensor).
    pub fn record_failure(&mut self, user_id: UserId) -> SensorStatus {
        let missed = self.missed.entry(user_id).or_insert(0);
        *missed = missed.saturating_add(1);
        if *missed >= MAX_MISSED_WINDOWS {
            warn!(user_id, missed = *missed, "sensor inactive");
            SensorStatus::Inactive
        } else {
            debug!(user_id, missed = *missed, "sensor missed a window");
            SensorStatus::Degraded { missed: *missed }
        }
    }

    pub fn missed(&self, user_id: UserId) -> u32 {
        self.missed.get(&user_id).copied().unwrap_or(0)
    }
}
