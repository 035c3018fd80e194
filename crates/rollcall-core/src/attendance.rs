//! Per-identity, per-day presence toggle.
//!
//! Each recognition flips the (identity, date) state:
//!
//! ```text
//! NO_RECORD --event--> OPEN --event--> CLOSED --event--> OPEN --> ...
//! ```
//!
//! Direction comes from prior state alone; the caller never says "in" or
//! "out". There is no liveness signal, so replaying the same photograph
//! toggles the state again. That is a known limitation, kept as is.

use crate::store::{Store, StoreError};
use crate::types::Identity;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const MAX_HISTORY_LIMIT: usize = 1000;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Direction of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceStatus {
    In,
    Out,
}

/// Where an identity stands for a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayState {
    Absent,
    In,
    Out,
}

/// One arrival, with its departure once it has happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub identity_seq: i64,
    pub identity_id: String,
    pub name: String,
    pub department: String,
    pub date: NaiveDate,
    pub in_time: DateTime<Utc>,
    pub out_time: Option<DateTime<Utc>>,
    /// Hours between arrival and departure, never negative.
    pub duration_hours: Option<f64>,
    /// Departure preceded arrival (clock skew); duration was clamped to zero.
    pub clamped: bool,
}

impl Segment {
    pub fn is_open(&self) -> bool {
        self.out_time.is_none()
    }

    /// Timestamp of the most recent transition on this segment.
    pub fn last_event(&self) -> DateTime<Utc> {
        self.out_time.unwrap_or(self.in_time)
    }

    pub fn state(&self) -> DayState {
        if self.is_open() {
            DayState::In
        } else {
            DayState::Out
        }
    }
}

/// Outcome of feeding one recognition into the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub status: PresenceStatus,
    pub at: DateTime<Utc>,
    pub segment: Segment,
    /// Same-millisecond repeat of the previous transition; nothing changed.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Transition {
    Open {
        at: DateTime<Utc>,
    },
    Close {
        segment_id: i64,
        at: DateTime<Utc>,
        duration_hours: f64,
        clamped: bool,
    },
    Duplicate,
}

/// Pick the transition for an event at `at`, given the latest segment of the day.
pub(crate) fn decide(latest: Option<&Segment>, at: DateTime<Utc>) -> Transition {
    let Some(segment) = latest else {
        return Transition::Open { at };
    };

    if segment.last_event().timestamp_millis() == at.timestamp_millis() {
        return Transition::Duplicate;
    }

    if !segment.is_open() {
        return Transition::Open { at };
    }

    let elapsed_ms = (at - segment.in_time).num_milliseconds();
    Transition::Close {
        segment_id: segment.id,
        at,
        duration_hours: elapsed_ms.max(0) as f64 / MILLIS_PER_HOUR,
        clamped: elapsed_ms < 0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRow {
    pub identity_id: String,
    pub name: String,
    pub department: String,
    pub state: DayState,
    /// Latest segment of the day, if any.
    pub segment: Option<Segment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodaySnapshot {
    pub date: NaiveDate,
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub in_count: usize,
    pub out_count: usize,
    pub rows: Vec<PresenceRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub identity_id: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HISTORY_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub total: usize,
    pub segments: Vec<Segment>,
}

/// Segment counts for one calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub segments: usize,
    pub identities: usize,
    pub open: usize,
    pub closed: usize,
    pub total_hours: f64,
}

/// Per-date rows plus headline figures over the same range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceStats {
    /// Identities enrolled right now, whether or not they attended.
    pub total_identities: usize,
    /// Mean distinct identities seen per day that has any segment.
    pub average_present: f64,
    pub days: Vec<DailyCount>,
}

type LedgerKey = (i64, NaiveDate);

/// Registry of per-(identity, date) mutexes. Entries are dropped once no
/// writer holds them.
#[derive(Default)]
struct KeyLocks {
    slots: Mutex<HashMap<LedgerKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn with_key<T>(&self, key: LedgerKey, f: impl FnOnce() -> T) -> T {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key).or_default())
        };

        let result = {
            let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this call hold the slot: nobody else is waiting.
        if Arc::strong_count(&slot) == 2 {
            slots.remove(&key);
        }
        result
    }
}

/// Attendance state machine over the record store.
pub struct AttendanceLedger {
    store: Arc<Store>,
    offset: FixedOffset,
    locks: KeyLocks,
}

impl AttendanceLedger {
    /// `offset` decides which calendar date an event belongs to.
    pub fn new(store: Arc<Store>, offset: FixedOffset) -> Self {
        Self {
            store,
            offset,
            locks: KeyLocks::default(),
        }
    }

    pub fn date_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// Toggle presence of `identity` for the day containing `at`.
    pub fn record(&self, identity: &Identity, at: DateTime<Utc>) -> Result<AttendanceEvent, LedgerError> {
        let date = self.date_of(at);

        let (transition, segment) = self.locks.with_key((identity.seq, date), || {
            self.store
                .apply_transition(identity.seq, date, |latest| decide(latest, at))
        })?;

        let (status, duplicate) = match transition {
            Transition::Open { .. } => (PresenceStatus::In, false),
            Transition::Close { clamped, .. } => {
                if clamped {
                    tracing::warn!(
                        identity = %identity.id,
                        segment = segment.id,
                        in_time = %segment.in_time,
                        out_time = %at,
                        "departure precedes arrival; duration clamped to zero"
                    );
                }
                (PresenceStatus::Out, false)
            }
            Transition::Duplicate => {
                let status = if segment.is_open() {
                    PresenceStatus::In
                } else {
                    PresenceStatus::Out
                };
                (status, true)
            }
        };

        tracing::info!(
            identity = %identity.id,
            %date,
            status = ?status,
            duplicate,
            "attendance recorded"
        );

        Ok(AttendanceEvent {
            status,
            at,
            segment,
            duplicate,
        })
    }

    /// Presence of every enrolled identity on the day containing `now`.
    pub fn today_snapshot(&self, now: DateTime<Utc>) -> Result<TodaySnapshot, LedgerError> {
        let date = self.date_of(now);
        let identities = self.store.identities()?;

        let mut latest: HashMap<i64, Segment> = HashMap::new();
        for segment in self.store.segments_on(date)? {
            latest.insert(segment.identity_seq, segment);
        }

        let rows: Vec<PresenceRow> = identities
            .into_iter()
            .map(|identity| {
                let segment = latest.remove(&identity.seq);
                PresenceRow {
                    state: segment.as_ref().map_or(DayState::Absent, Segment::state),
                    identity_id: identity.id,
                    name: identity.name,
                    department: identity.department,
                    segment,
                }
            })
            .collect();

        let count = |state: DayState| rows.iter().filter(|r| r.state == state).count();
        let in_count = count(DayState::In);
        let out_count = count(DayState::Out);
        let absent = count(DayState::Absent);

        Ok(TodaySnapshot {
            date,
            total: rows.len(),
            present: in_count + out_count,
            absent,
            in_count,
            out_count,
            rows,
        })
    }

    pub fn history(&self, filter: &HistoryFilter, page: Page) -> Result<HistoryPage, LedgerError> {
        let limit = page.limit.clamp(1, MAX_HISTORY_LIMIT);
        let (segments, total) = self.store.history(filter, limit, page.offset)?;
        Ok(HistoryPage { total, segments })
    }

    pub fn daily_aggregate(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<DailyCount>, LedgerError> {
        Ok(self.store.daily_aggregate(from, to)?)
    }

    /// [`daily_aggregate`](Self::daily_aggregate) with the enrolled total and
    /// average daily presence.
    pub fn stats(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<AttendanceStats, LedgerError> {
        let days = self.daily_aggregate(from, to)?;
        let average_present = if days.is_empty() {
            0.0
        } else {
            days.iter().map(|d| d.identities).sum::<usize>() as f64 / days.len() as f64
        };
        Ok(AttendanceStats {
            total_identities: self.store.identity_count()?,
            average_present,
            days,
        })
    }
}
