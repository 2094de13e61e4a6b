//! SQLite-backed [`LedgerStore`].

use super::{Applied, BalanceEffect, LedgerStore, NewEvent, StoreError};
use crate::accounts::{Account, AccountDraft, UserId};
use crate::amount::Amount;
use crate::ledger::events::{EventId, EventStatus, LedgerEvent};
use crate::market::{ActiveListing, Listing, ListingDraft, ListingId};
use crate::transfer::WalletAddress;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    handle TEXT NOT NULL UNIQUE,
    credential_hash TEXT NOT NULL,
    wallet TEXT UNIQUE,
    balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    opening_balance INTEGER NOT NULL DEFAULT 0,
    verified INTEGER NOT NULL DEFAULT 0,
    tracking_purchased INTEGER NOT NULL DEFAULT 0,
    last_ping_utc INTEGER,
    created_utc INTEGER NOT NULL,
    last_login_utc INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES accounts(id),
    kind TEXT NOT NULL,
    amount INTEGER NOT NULL CHECK (amount >= 0),
    status TEXT NOT NULL,
    payload TEXT NOT NULL,
    external_ref TEXT,
    created_utc INTEGER NOT NULL,
    applied_seq INTEGER
);
CREATE INDEX IF NOT EXISTS idx_events_user ON events(user_id, id);

CREATE TABLE IF NOT EXISTS listings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    quantity INTEGER NOT NULL CHECK (quantity > 0),
    unit_price INTEGER NOT NULL CHECK (unit_price >= 0),
    sold INTEGER NOT NULL DEFAULT 0,
    buyer_id INTEGER,
    sold_utc INTEGER,
    created_utc INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_listings_sold ON listings(sold, created_utc);
CREATE INDEX IF NOT EXISTS idx_listings_owner ON listings(owner_id);

CREATE TRIGGER IF NOT EXISTS events_append_only
BEFORE DELETE ON events
BEGIN
    SELECT RAISE(ABORT, 'ledger events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS events_immutable
BEFORE UPDATE OF user_id, kind, amount, payload, created_utc ON events
BEGIN
    SELECT RAISE(ABORT, 'ledger events are immutable');
END;

CREATE TRIGGER IF NOT EXISTS events_status_final
BEFORE UPDATE OF status ON events
WHEN OLD.status <> 'pending'
BEGIN
    SELECT RAISE(ABORT, 'event status already final');
END;

CREATE TRIGGER IF NOT EXISTS listings_sold_monotonic
BEFORE UPDATE OF sold ON listings
WHEN OLD.sold = 1
BEGIN
    SELECT RAISE(ABORT, 'listing already sold');
END;
"#;

/// Objects over `events.applied_seq`; created after databases without the
/// column have been migrated.
const APPLIED_SEQ_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_events_applied ON events(user_id, applied_seq);

CREATE TRIGGER IF NOT EXISTS events_applied_seq_once
BEFORE UPDATE OF applied_seq ON events
WHEN OLD.applied_seq IS NOT NULL
BEGIN
    SELECT RAISE(ABORT, 'event already applied');
END;
"#;

/// Next position in a user's balance application order. Only valid inside
/// an IMMEDIATE transaction.
const NEXT_APPLIED_SEQ: &str =
    "SELECT COALESCE(MAX(applied_seq), 0) + 1 FROM events WHERE user_id = ?1";

const ACCOUNT_COLUMNS: &str = "id, email, handle, wallet, balance, opening_balance, verified, \
     tracking_purchased, last_ping_utc, created_utc, last_login_utc";
const EVENT_COLUMNS: &str = "id, user_id, status, payload, external_ref, created_utc, applied_seq";
const LISTING_COLUMNS: &str = "l.id, l.owner_id, l.title, l.description, l.quantity, \
     l.unit_price, l.sold, l.buyer_id, l.sold_utc, l.created_utc";

/// Single-connection SQLite store. The connection lives as long as the store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`. Creates parent dirs if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        info!(path = %path.display(), "opened ledger database");
        Self::init(conn)
    }

    /// In-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("opening in-memory ledger database");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        migrate_applied_seq(&conn)?;
        conn.execute_batch(APPLIED_SEQ_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Databases created before `applied_seq` existed settled every effect in id
/// order, so the id is their application order.
fn migrate_applied_seq(conn: &Connection) -> Result<(), StoreError> {
    let present = conn
        .prepare("SELECT 1 FROM pragma_table_info('events') WHERE name = 'applied_seq'")?
        .exists([])?;
    if present {
        return Ok(());
    }
    conn.execute_batch(
        "BEGIN IMMEDIATE;
         ALTER TABLE events ADD COLUMN applied_seq INTEGER;
         UPDATE events SET applied_seq = id WHERE status = 'settled';
         COMMIT;",
    )?;
    info!("migrated events table: added applied_seq");
    Ok(())
}

fn to_time(idx: usize, secs: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn account_from_row(r: &Row<'_>) -> rusqlite::Result<Account> {
    let wallet = r
        .get::<_, Option<String>>(3)?
        .map(|w| {
            WalletAddress::parse(&w)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))
        })
        .transpose()?;
    Ok(Account {
        id: r.get(0)?,
        email: r.get(1)?,
        handle: r.get(2)?,
        wallet,
        balance: r.get(4)?,
        opening_balance: r.get(5)?,
        verified: r.get(6)?,
        tracking_purchased: r.get(7)?,
        last_ping: r
            .get::<_, Option<i64>>(8)?
            .map(|t| to_time(8, t))
            .transpose()?,
        created_at: to_time(9, r.get(9)?)?,
        last_login_at: to_time(10, r.get(10)?)?,
    })
}

fn event_from_row(r: &Row<'_>) -> rusqlite::Result<LedgerEvent> {
    let status = r
        .get::<_, String>(2)?
        .parse::<EventStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;
    let payload: String = r.get(3)?;
    let kind = serde_json::from_str(&payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(LedgerEvent {
        id: r.get(0)?,
        user_id: r.get(1)?,
        kind,
        status,
        external_ref: r.get(4)?,
        timestamp: to_time(5, r.get(5)?)?,
        applied_seq: r.get(6)?,
    })
}

fn listing_from_row(r: &Row<'_>) -> rusqlite::Result<Listing> {
    Ok(Listing {
        id: r.get(0)?,
        owner_id: r.get(1)?,
        title: r.get(2)?,
        description: r.get(3)?,
        quantity: r.get(4)?,
        unit_price: r.get(5)?,
        sold: r.get(6)?,
        buyer_id: r.get(7)?,
        sold_at: r
            .get::<_, Option<i64>>(8)?
            .map(|t| to_time(8, t))
            .transpose()?,
        created_at: to_time(9, r.get(9)?)?,
    })
}

/// Map a UNIQUE violation to the offending column name.
fn unique_violation(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(err, Some(msg)) = &e {
        if err.code == ErrorCode::ConstraintViolation && msg.contains("UNIQUE") {
            let column = msg.rsplit('.').next().unwrap_or("value").to_string();
            return StoreError::Duplicate(column);
        }
    }
    StoreError::Sqlite(e)
}

impl LedgerStore for SqliteStore {
    fn insert_account(
        &self,
        draft: &AccountDraft,
        opening_balance: Amount,
        now: OffsetDateTime,
    ) -> Result<Account, StoreError> {
        let ts = now.unix_timestamp();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO accounts (email, handle, credential_hash, wallet, balance, opening_balance, \
             created_utc, last_login_utc) VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?6)",
            params![
                draft.email,
                draft.handle,
                draft.credential_hash,
                draft.wallet.as_ref().map(WalletAddress::as_str),
                opening_balance,
                ts
            ],
        )
        .map_err(unique_violation)?;
        let id = tx.last_insert_rowid();
        let account = tx.query_row(
            &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
            [id],
            account_from_row,
        )?;
        tx.commit()?;
        info!(user_id = id, handle = %account.handle, "account created");
        Ok(account)
    }

    fn account(&self, id: UserId) -> Result<Option<Account>, StoreError> {
        let conn = self.lock()?;
        let account = conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                [id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    fn touch_login(&self, id: UserId, now: OffsetDateTime) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE accounts SET last_login_utc = ?2 WHERE id = ?1",
            params![id, now.unix_timestamp()],
        )?;
        Ok(n == 1)
    }

    fn mark_verified(&self, id: UserId) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let n = conn.execute("UPDATE accounts SET verified = 1 WHERE id = ?1", [id])?;
        Ok(n == 1)
    }

    fn append_event(
        &self,
        user_id: UserId,
        event: &NewEvent,
        now: OffsetDateTime,
    ) -> Result<Option<Applied>, StoreError> {
        let amount = event.kind.amount();
        let payload = serde_json::to_string(&event.kind)?;
        let ts = now.unix_timestamp();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<Amount> = tx
            .query_row(
                "SELECT balance FROM accounts WHERE id = ?1",
                [user_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(None);
        };
        let balance: Amount = match event.effect {
            BalanceEffect::None => current,
            BalanceEffect::Credit => tx
                .query_row(
                    "UPDATE accounts SET balance = balance + ?1 \
                     WHERE id = ?2 AND balance <= ?3 RETURNING balance",
                    params![amount, user_id, Amount::MAX.saturating_sub(amount)],
                    |r| r.get(0),
                )
                .optional()?
                .ok_or(StoreError::Overflow)?,
            BalanceEffect::DebitFloored => tx.query_row(
                "UPDATE accounts SET balance = MAX(0, balance - ?1), last_ping_utc = ?2 \
                 WHERE id = ?3 RETURNING balance",
                params![amount, ts, user_id],
                |r| r.get(0),
            )?,
        };
        let applied_seq: Option<i64> = if event.status == EventStatus::Settled {
            Some(tx.query_row(NEXT_APPLIED_SEQ, [user_id], |r| r.get(0))?)
        } else {
            None
        };
        tx.execute(
            "INSERT INTO events (user_id, kind, amount, status, payload, created_utc, applied_seq) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                event.kind.label(),
                amount,
                event.status.as_str(),
                payload,
                ts,
                applied_seq
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        debug!(user_id, event_id = id, kind = event.kind.label(), %amount, %balance, "event appended");
        Ok(Some(Applied {
            event: LedgerEvent {
                id,
                user_id,
                kind: event.kind.clone(),
                status: event.status,
                external_ref: None,
                timestamp: to_time(5, ts)?,
                applied_seq,
            },
            balance,
        }))
    }

    fn settle_tokenisation(
        &self,
        event_id: EventId,
        external_ref: Option<&str>,
    ) -> Result<Option<Applied>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let pending: Option<(UserId, Amount)> = tx
            .query_row(
                "SELECT user_id, amount FROM events \
                 WHERE id = ?1 AND kind = 'tokenisation' AND status = 'pending'",
                [event_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((user_id, amount)) = pending else {
            return Ok(None);
        };
        let applied_seq: i64 = tx.query_row(NEXT_APPLIED_SEQ, [user_id], |r| r.get(0))?;
        tx.execute(
            "UPDATE events SET status = 'settled', external_ref = ?2, applied_seq = ?3 WHERE id = ?1",
            params![event_id, external_ref, applied_seq],
        )?;
        let balance: Amount = tx
            .query_row(
                "UPDATE accounts SET balance = balance + ?1, tracking_purchased = 1 \
                 WHERE id = ?2 AND balance <= ?3 RETURNING balance",
                params![amount, user_id, Amount::MAX.saturating_sub(amount)],
                |r| r.get(0),
            )
            .optional()?
            .ok_or(StoreError::Overflow)?;
        let event = tx.query_row(
            &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
            [event_id],
            event_from_row,
        )?;
        tx.commit()?;
        Ok(Some(Applied { event, balance }))
    }

    fn fail_tokenisation(&self, event_id: EventId) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE events SET status = 'failed' \
             WHERE id = ?1 AND kind = 'tokenisation' AND status = 'pending'",
            [event_id],
        )?;
        Ok(n == 1)
    }

    fn events(&self, user_id: UserId) -> Result<Vec<LedgerEvent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events WHERE user_id = ?1 ORDER BY id",
            EVENT_COLUMNS
        ))?;
        let rows = stmt
            .query_map([user_id], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_listing(
        &self,
        owner_id: UserId,
        draft: &ListingDraft,
        now: OffsetDateTime,
    ) -> Result<Option<Listing>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let owner_exists = tx
            .query_row("SELECT 1 FROM accounts WHERE id = ?1", [owner_id], |_| Ok(()))
            .optional()?
            .is_some();
        if !owner_exists {
            return Ok(None);
        }
        tx.execute(
            "INSERT INTO listings (owner_id, title, description, quantity, unit_price, created_utc) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                owner_id,
                draft.title,
                draft.description,
                draft.quantity,
                draft.unit_price,
                now.unix_timestamp()
            ],
        )?;
        let id = tx.last_insert_rowid();
        let listing = tx.query_row(
            &format!("SELECT {} FROM listings l WHERE l.id = ?1", LISTING_COLUMNS),
            [id],
            listing_from_row,
        )?;
        tx.commit()?;
        Ok(Some(listing))
    }

    fn listing(&self, id: ListingId) -> Result<Option<Listing>, StoreError> {
        let conn = self.lock()?;
        let listing = conn
            .query_row(
                &format!("SELECT {} FROM listings l WHERE l.id = ?1", LISTING_COLUMNS),
                [id],
                listing_from_row,
            )
            .optional()?;
        Ok(listing)
    }

    fn active_listings(&self) -> Result<Vec<ActiveListing>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, a.handle FROM listings l LEFT JOIN accounts a ON a.id = l.owner_id \
             WHERE l.sold = 0 ORDER BY l.created_utc, l.id",
            LISTING_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ActiveListing {
                    listing: listing_from_row(r)?,
                    owner_handle: r.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn listings_of(&self, owner_id: UserId) -> Result<Vec<Listing>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM listings l WHERE l.owner_id = ?1 ORDER BY l.id",
            LISTING_COLUMNS
        ))?;
        let rows = stmt
            .query_map([owner_id], listing_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn mark_sold(
        &self,
        listing_id: ListingId,
        buyer_id: UserId,
        now: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE listings SET sold = 1, buyer_id = ?2, sold_utc = ?3 WHERE id = ?1 AND sold = 0",
            params![listing_id, buyer_id, now.unix_timestamp()],
        )?;
        Ok(n == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::events::EventKind;
    use tempfile::TempDir;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn draft(email: &str, handle: &str) -> AccountDraft {
        AccountDraft {
            email: email.into(),
            handle: handle.into(),
            credential_hash: "hash".into(),
            wallet: None,
        }
    }

    fn credits(n: u64) -> Amount {
        Amount::from_whole(n).unwrap()
    }

    fn consumption(n: u64) -> NewEvent {
        NewEvent {
            kind: EventKind::Consumption {
                credits_used: credits(n),
            },
            status: EventStatus::Settled,
            effect: BalanceEffect::DebitFloored,
        }
    }

    #[test]
    fn duplicate_email_and_handle_detected() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_account(&draft("a@x.io", "a"), Amount::ZERO, now()).unwrap();
        match store.insert_account(&draft("a@x.io", "b"), Amount::ZERO, now()) {
            Err(StoreError::Duplicate(col)) => assert_eq!(col, "email"),
            other => panic!("expected duplicate, got {:?}", other.map(|a| a.id)),
        }
        match store.insert_account(&draft("b@x.io", "a"), Amount::ZERO, now()) {
            Err(StoreError::Duplicate(col)) => assert_eq!(col, "handle"),
            other => panic!("expected duplicate, got {:?}", other.map(|a| a.id)),
        }
    }

    #[test]
    fn debit_floors_at_zero_and_touches_ping() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = store.insert_account(&draft("a@x.io", "a"), credits(20), now()).unwrap();
        assert!(acct.last_ping.is_none());
        let applied = store.append_event(acct.id, &consumption(25), now()).unwrap().unwrap();
        assert_eq!(applied.balance, Amount::ZERO);
        let reloaded = store.account(acct.id).unwrap().unwrap();
        assert_eq!(reloaded.balance, Amount::ZERO);
        assert_eq!(reloaded.last_ping, Some(now()));
        assert_eq!(store.events(acct.id).unwrap().len(), 1);
    }

    #[test]
    fn append_for_missing_account_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.append_event(42, &consumption(1), now()).unwrap().is_none());
    }

    #[test]
    fn credit_overflow_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = store
            .insert_account(&draft("a@x.io", "a"), Amount::MAX.saturating_sub(credits(1)), now())
            .unwrap();
        let event = NewEvent {
            kind: EventKind::Tokenisation {
                carbon_credits: credits(1),
                tokens_issued: credits(2),
                source: "test".into(),
                confidence: 0.9,
            },
            status: EventStatus::Settled,
            effect: BalanceEffect::Credit,
        };
        assert!(matches!(
            store.append_event(acct.id, &event, now()),
            Err(StoreError::Overflow)
        ));
        assert!(store.events(acct.id).unwrap().is_empty());
    }

    #[test]
    fn events_cannot_be_deleted_or_rewritten() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = store.insert_account(&draft("a@x.io", "a"), Amount::ZERO, now()).unwrap();
        store.append_event(acct.id, &consumption(1), now()).unwrap();
        let conn = store.lock().unwrap();
        assert!(conn.execute("DELETE FROM events", []).is_err());
        assert!(conn.execute("UPDATE events SET amount = 0", []).is_err());
        assert!(conn.execute("UPDATE events SET status = 'failed'", []).is_err());
    }

    #[test]
    fn settle_only_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = store.insert_account(&draft("a@x.io", "a"), Amount::ZERO, now()).unwrap();
        let pending = NewEvent {
            kind: EventKind::Tokenisation {
                carbon_credits: credits(5),
                tokens_issued: credits(500),
                source: "Verra".into(),
                confidence: 0.8,
            },
            status: EventStatus::Pending,
            effect: BalanceEffect::None,
        };
        let applied = store.append_event(acct.id, &pending, now()).unwrap().unwrap();
        assert_eq!(applied.balance, Amount::ZERO);
        let settled = store
            .settle_tokenisation(applied.event.id, Some("0xabc"))
            .unwrap()
            .unwrap();
        assert_eq!(settled.balance, credits(500));
        assert_eq!(settled.event.status, EventStatus::Settled);
        assert_eq!(settled.event.external_ref.as_deref(), Some("0xabc"));
        assert!(store.settle_tokenisation(applied.event.id, None).unwrap().is_none());
        assert!(!store.fail_tokenisation(applied.event.id).unwrap());
        assert!(store.account(acct.id).unwrap().unwrap().tracking_purchased);
    }

    fn pending_tokenisation(tokens: u64) -> NewEvent {
        NewEvent {
            kind: EventKind::Tokenisation {
                carbon_credits: credits(tokens / 100),
                tokens_issued: credits(tokens),
                source: "Verra".into(),
                confidence: 0.8,
            },
            status: EventStatus::Pending,
            effect: BalanceEffect::None,
        }
    }

    #[test]
    fn settlement_records_application_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = store.insert_account(&draft("a@x.io", "a"), Amount::ZERO, now()).unwrap();
        let pending = store
            .append_event(acct.id, &pending_tokenisation(500), now())
            .unwrap()
            .unwrap();
        assert_eq!(pending.event.applied_seq, None);
        // Ping lands while the transfer is in flight; floors at zero.
        let ping = store.append_event(acct.id, &consumption(25), now()).unwrap().unwrap();
        assert_eq!(ping.balance, Amount::ZERO);
        assert_eq!(ping.event.applied_seq, Some(1));
        let settled = store.settle_tokenisation(pending.event.id, None).unwrap().unwrap();
        assert_eq!(settled.balance, credits(500));
        assert_eq!(settled.event.applied_seq, Some(2));

        let history = store.events(acct.id).unwrap();
        assert_eq!(history.iter().map(|e| e.id).collect::<Vec<_>>(), vec![pending.event.id, ping.event.id]);
        assert_eq!(
            crate::ledger::replay_balance(Amount::ZERO, &history),
            store.account(acct.id).unwrap().unwrap().balance
        );

        let conn = store.lock().unwrap();
        assert!(conn.execute("UPDATE events SET applied_seq = 9", []).is_err());
    }

    #[test]
    fn failed_tokenisation_never_applied() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = store.insert_account(&draft("a@x.io", "a"), Amount::ZERO, now()).unwrap();
        let pending = store
            .append_event(acct.id, &pending_tokenisation(500), now())
            .unwrap()
            .unwrap();
        assert!(store.fail_tokenisation(pending.event.id).unwrap());
        let ping = store.append_event(acct.id, &consumption(1), now()).unwrap().unwrap();
        assert_eq!(ping.event.applied_seq, Some(1));
        assert_eq!(store.events(acct.id).unwrap()[0].applied_seq, None);
    }

    #[test]
    fn legacy_events_table_is_migrated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.sqlite");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    amount INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    external_ref TEXT,
                    created_utc INTEGER NOT NULL
                );
                INSERT INTO events (user_id, kind, amount, status, payload, created_utc)
                VALUES (1, 'consumption', 1, 'settled', '{}', 0),
                       (1, 'tokenisation', 5, 'failed', '{}', 0);",
            )
            .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let conn = store.lock().unwrap();
        let seqs: Vec<Option<i64>> = conn
            .prepare("SELECT applied_seq FROM events ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(seqs, vec![Some(1), None]);
    }

    #[test]
    fn sold_is_monotonic() {
        let store = SqliteStore::open_in_memory().unwrap();
        let owner = store.insert_account(&draft("a@x.io", "a"), Amount::ZERO, now()).unwrap();
        let listing = store
            .insert_listing(
                owner.id,
                &ListingDraft {
                    title: "Mangrove lot".into(),
                    description: String::new(),
                    quantity: credits(3),
                    unit_price: credits(10),
                },
                now(),
            )
            .unwrap()
            .unwrap();
        assert!(store.mark_sold(listing.id, 7, now()).unwrap());
        assert!(!store.mark_sold(listing.id, 8, now()).unwrap());
        let conn = store.lock().unwrap();
        assert!(conn.execute("UPDATE listings SET sold = 0", []).is_err());
    }

    #[test]
    fn reopen_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("ledger.sqlite");
        let id = {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_account(&draft("a@x.io", "a"), credits(3), now()).unwrap().id
        };
        let store = SqliteStore::open(&path).unwrap();
        let acct = store.account(id).unwrap().unwrap();
        assert_eq!(acct.balance, credits(3));
        assert_eq!(acct.opening_balance, credits(3));
    }
}
