//! Dashboard aggregates derived from an account and its event history.

use crate::accounts::Account;
use crate::amount::Amount;
use crate::ledger::events::{EventKind, EventStatus, LedgerEvent, SuretyLevel};
use crate::sensor::is_live;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::{Duration, OffsetDateTime};

const DAILY_AVERAGE_DAYS: i64 = 7;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    /// Stored balance; authoritative.
    pub remaining_credits: Amount,
    pub tokens_used: Amount,
    /// Settled tokenisations only.
    pub tokens_issued: Amount,
    pub plantation_credits: Amount,
    /// `tokens_issued - tokens_used`, floored at zero. Informational.
    pub derived_remaining: Amount,
    pub plantation_count: u64,
    pub surety_breakdown: BTreeMap<SuretyLevel, u64>,
    pub source_breakdown: BTreeMap<String, Amount>,
    pub account_age_days: i64,
    /// Stored balance equals the balance replayed from history.
    pub balance_consistent: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub current_usage: Amount,
    pub peak_usage: Amount,
    pub total_consumption: Amount,
    pub daily_average: Amount,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_ping: Option<OffsetDateTime>,
    pub sensor_active: bool,
}

/// Replay history from `opening` in the order effects were applied: credits
/// add, consumption floors at zero. Pending and failed tokenisations have no
/// effect.
pub fn replay_balance(opening: Amount, events: &[LedgerEvent]) -> Amount {
    let mut settled: Vec<&LedgerEvent> = events.iter().filter(|e| e.is_settled()).collect();
    settled.sort_by_key(|e| (e.applied_seq.unwrap_or(i64::MAX), e.id));
    settled
        .into_iter()
        .fold(opening, |balance, e| match &e.kind {
            EventKind::Plantation { awarded, .. } => balance.saturating_add(*awarded),
            EventKind::Tokenisation { tokens_issued, .. } => balance.saturating_add(*tokens_issued),
            EventKind::Consumption { credits_used } => balance.saturating_sub(*credits_used),
        })
}

/// Pure aggregation; the same account, events and clock always give the same summary.
pub fn compute_summary(account: &Account, events: &[LedgerEvent], now: OffsetDateTime) -> LedgerSummary {
    let mut tokens_used = Amount::ZERO;
    let mut tokens_issued = Amount::ZERO;
    let mut plantation_credits = Amount::ZERO;
    let mut plantation_count: u64 = 0;
    let mut surety_breakdown = BTreeMap::new();
    let mut source_breakdown: BTreeMap<String, Amount> = BTreeMap::new();

    for ev in events.iter().filter(|e| e.status == EventStatus::Settled) {
        match &ev.kind {
            EventKind::Plantation { awarded, surety, .. } => {
                plantation_credits = plantation_credits.saturating_add(*awarded);
                plantation_count = plantation_count.saturating_add(1);
                *surety_breakdown.entry(*surety).or_insert(0u64) += 1;
            }
            EventKind::Tokenisation {
                tokens_issued: issued,
                source,
                ..
            } => {
                tokens_issued = tokens_issued.saturating_add(*issued);
                let entry = source_breakdown.entry(source.clone()).or_insert(Amount::ZERO);
                *entry = entry.saturating_add(*issued);
            }
            EventKind::Consumption { credits_used } => {
                tokens_used = tokens_used.saturating_add(*credits_used);
            }
        }
    }

    LedgerSummary {
        remaining_credits: account.balance,
        tokens_used,
        tokens_issued,
        plantation_credits,
        derived_remaining: tokens_issued.saturating_sub(tokens_used),
        plantation_count,
        surety_breakdown,
        source_breakdown,
        account_age_days: (now - account.created_at).whole_days().max(0),
        balance_consistent: replay_balance(account.opening_balance, events) == account.balance,
    }
}

pub fn compute_telemetry(account: &Account, events: &[LedgerEvent], now: OffsetDateTime) -> Telemetry {
    let week_start = now - Duration::days(DAILY_AVERAGE_DAYS);
    let mut current_usage = Amount::ZERO;
    let mut peak_usage = Amount::ZERO;
    let mut total_consumption = Amount::ZERO;
    let mut week_total = Amount::ZERO;

    for ev in events {
        let EventKind::Consumption { credits_used } = &ev.kind else {
            continue;
        };
        current_usage = *credits_used;
        peak_usage = peak_usage.max(*credits_used);
        total_consumption = total_consumption.saturating_add(*credits_used);
        if ev.timestamp >= week_start {
            week_total = week_total.saturating_add(*credits_used);
        }
    }

    Telemetry {
        current_usage,
        peak_usage,
        total_consumption,
        daily_average: week_total.div_floor(DAILY_AVERAGE_DAYS as u64),
        last_ping: account.last_ping,
        sensor_active: account.last_ping.is_some_and(|ping| is_live(ping, now)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whole(n: u64) -> Amount {
        Amount::from_whole(n).unwrap()
    }

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    fn account(opening: u64, balance: u64) -> Account {
        Account {
            id: 1,
            email: "a@b.io".into(),
            handle: "a".into(),
            wallet: None,
            balance: whole(balance),
            opening_balance: whole(opening),
            verified: false,
            tracking_purchased: false,
            last_ping: None,
            created_at: at(0),
            last_login_at: at(0),
        }
    }

    fn event(id: i64, kind: EventKind, status: EventStatus, secs: i64) -> LedgerEvent {
        LedgerEvent {
            id,
            user_id: 1,
            kind,
            status,
            external_ref: None,
            applied_seq: (status == EventStatus::Settled).then_some(id),
            timestamp: at(secs),
        }
    }

    fn plantation(credits: u64, surety: SuretyLevel) -> EventKind {
        EventKind::Plantation {
            location: "Pune".into(),
            estimated_saplings: None,
            size_in_acres: None,
            monetary_amount: None,
            awarded: whole(credits),
            confidence: 0.9,
            surety,
            raw_text: String::new(),
            text_sha256: String::new(),
        }
    }

    fn tokenisation(issued: u64, source: &str) -> EventKind {
        EventKind::Tokenisation {
            carbon_credits: whole(issued / 100),
            tokens_issued: whole(issued),
            source: source.into(),
            confidence: 0.9,
        }
    }

    fn consumption(used: u64) -> EventKind {
        EventKind::Consumption {
            credits_used: whole(used),
        }
    }

    #[test]
    fn summary_empty() {
        let s = compute_summary(&account(0, 0), &[], at(0));
        assert_eq!(s.remaining_credits, Amount::ZERO);
        assert_eq!(s.plantation_count, 0);
        assert!(s.surety_breakdown.is_empty());
        assert!(s.balance_consistent);
    }

    #[test]
    fn summary_aggregates_settled_events() {
        let events = vec![
            event(1, plantation(20, SuretyLevel::High), EventStatus::Settled, 10),
            event(2, tokenisation(500, "Verra"), EventStatus::Settled, 20),
            event(3, tokenisation(300, "Verra"), EventStatus::Failed, 30),
            event(4, tokenisation(100, "Gold Standard"), EventStatus::Pending, 40),
            event(5, consumption(25), EventStatus::Settled, 50),
        ];
        let s = compute_summary(&account(0, 495), &events, at(3 * 86_400 + 5));
        assert_eq!(s.tokens_issued, whole(500));
        assert_eq!(s.tokens_used, whole(25));
        assert_eq!(s.derived_remaining, whole(475));
        assert_eq!(s.plantation_credits, whole(20));
        assert_eq!(s.plantation_count, 1);
        assert_eq!(s.surety_breakdown.get(&SuretyLevel::High), Some(&1));
        assert_eq!(s.source_breakdown.len(), 1);
        assert_eq!(s.source_breakdown["Verra"], whole(500));
        assert_eq!(s.account_age_days, 3);
        assert!(s.balance_consistent);
    }

    #[test]
    fn replay_floors_consumption() {
        let events = vec![
            event(1, plantation(20, SuretyLevel::High), EventStatus::Settled, 1),
            event(2, consumption(25), EventStatus::Settled, 2),
            event(3, plantation(5, SuretyLevel::Low), EventStatus::Settled, 3),
        ];
        assert_eq!(replay_balance(Amount::ZERO, &events), whole(5));
    }

    #[test]
    fn replay_follows_application_order() {
        // Tokenisation appended first but settled after a consumption ping.
        let mut late = event(1, tokenisation(500, "Verra"), EventStatus::Settled, 1);
        late.applied_seq = Some(3);
        let events = vec![
            late,
            event(2, consumption(25), EventStatus::Settled, 2),
        ];
        assert_eq!(replay_balance(Amount::ZERO, &events), whole(500));
        let s = compute_summary(&account(0, 500), &events, at(10));
        assert!(s.balance_consistent);
    }

    #[test]
    fn inconsistent_balance_flagged() {
        let events = vec![event(1, plantation(20, SuretyLevel::High), EventStatus::Settled, 1)];
        let s = compute_summary(&account(0, 19), &events, at(10));
        assert_eq!(s.remaining_credits, whole(19));
        assert!(!s.balance_consistent);
    }

    #[test]
    fn summary_is_order_invariant_for_totals() {
        let a = vec![
            event(1, tokenisation(200, "A"), EventStatus::Settled, 1),
            event(2, consumption(50), EventStatus::Settled, 2),
        ];
        let b = vec![a[1].clone(), a[0].clone()];
        let acct = account(0, 150);
        let sa = compute_summary(&acct, &a, at(5));
        let sb = compute_summary(&acct, &b, at(5));
        assert_eq!(sa.tokens_issued, sb.tokens_issued);
        assert_eq!(sa.tokens_used, sb.tokens_used);
        assert_eq!(sa.derived_remaining, sb.derived_remaining);
    }

    #[test]
    fn telemetry_weekly_average_and_liveness() {
        let now = at(10 * 86_400);
        let mut acct = account(0, 0);
        acct.last_ping = Some(now - Duration::seconds(30));
        let events = vec![
            event(1, consumption(70), EventStatus::Settled, 0),
            event(2, consumption(7), EventStatus::Settled, 9 * 86_400),
            event(3, consumption(7), EventStatus::Settled, 10 * 86_400 - 30),
        ];
        let t = compute_telemetry(&acct, &events, now);
        assert_eq!(t.current_usage, whole(7));
        assert_eq!(t.peak_usage, whole(70));
        assert_eq!(t.total_consumption, whole(84));
        assert_eq!(t.daily_average, whole(2));
        assert!(t.sensor_active);

        acct.last_ping = Some(now - Duration::seconds(90));
        assert!(!compute_telemetry(&acct, &events, now).sensor_active);
    }
}
