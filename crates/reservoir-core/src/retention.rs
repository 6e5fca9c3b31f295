//! Retention policy for the reading stream
//!
//! Two interchangeable strategies decide which readings may go:
//!
//! - **Age**: readings whose `user_ts` is older than a number of hours
//! - **Rows**: everything but the newest `limit` readings
//!
//! Whatever the strategy, a reading is only ever removed when its id is at
//! or below the sent watermark supplied by the caller. Backends turn a
//! [`PurgePlan`] into a single atomic delete and report a [`PurgeResult`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::storage::StorageResult;

/// Bit flags accepted by the purge entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PurgeFlags(pub u32);

impl PurgeFlags {
    /// Only purge readings already forwarded (`id <= sent_id`)
    pub const RETAIN_UNSENT: PurgeFlags = PurgeFlags(0x0001);
    /// Select the row-count strategy instead of the age strategy
    pub const SIZE: PurgeFlags = PurgeFlags(0x0002);

    pub fn contains(self, other: PurgeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for PurgeFlags {
    type Output = PurgeFlags;

    fn bitor(self, rhs: PurgeFlags) -> PurgeFlags {
        PurgeFlags(self.0 | rhs.0)
    }
}

/// Which readings are candidates for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeStrategy {
    /// Readings older than this many hours
    Age { hours: u64 },
    /// Keep at most this many of the newest readings
    Rows { limit: u64 },
}

impl PurgeStrategy {
    pub fn method(&self) -> &'static str {
        match self {
            PurgeStrategy::Age { .. } => "age",
            PurgeStrategy::Rows { .. } => "rows",
        }
    }
}

/// A complete purge call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeRequest {
    pub strategy: PurgeStrategy,
    pub flags: PurgeFlags,
    pub sent_id: u64,
}

impl PurgeRequest {
    pub fn by_age(hours: u64, flags: PurgeFlags, sent_id: u64) -> Self {
        Self {
            strategy: PurgeStrategy::Age { hours },
            flags,
            sent_id,
        }
    }

    pub fn by_rows(limit: u64, flags: PurgeFlags, sent_id: u64) -> Self {
        Self {
            strategy: PurgeStrategy::Rows { limit },
            flags,
            sent_id,
        }
    }

    /// Interpret a single `param` the way the plugin entry point does:
    /// rows when `SIZE` is set, hours otherwise
    pub fn from_flags(param: u64, flags: u32, sent_id: u64) -> Self {
        let flags = PurgeFlags(flags);
        if flags.contains(PurgeFlags::SIZE) {
            Self::by_rows(param, flags, sent_id)
        } else {
            Self::by_age(param, flags, sent_id)
        }
    }

    /// Decide the delete bounds
    ///
    /// `nth_newest_id(n)` must return the id of the n-th newest reading
    /// (1-based), or `None` when fewer than `n` readings exist. Returns
    /// `None` when nothing can be removed.
    pub fn plan<F>(&self, now: DateTime<Utc>, nth_newest_id: F) -> StorageResult<Option<PurgePlan>>
    where
        F: FnOnce(u64) -> StorageResult<Option<u64>>,
    {
        if self.sent_id == 0 {
            return Ok(None);
        }

        let plan = match self.strategy {
            PurgeStrategy::Age { hours } => {
                // An age reaching past the representable range: nothing is that old
                let Some(cutoff) = i64::try_from(hours)
                    .ok()
                    .and_then(Duration::try_hours)
                    .and_then(|age| now.checked_sub_signed(age))
                else {
                    return Ok(None);
                };
                PurgePlan {
                    max_id: self.sent_id,
                    older_than: Some(cutoff),
                }
            }
            PurgeStrategy::Rows { limit: 0 } => PurgePlan {
                max_id: self.sent_id,
                older_than: None,
            },
            PurgeStrategy::Rows { limit } => match nth_newest_id(limit)? {
                // Everything below the oldest kept reading may go
                Some(oldest_kept) if oldest_kept > 1 => PurgePlan {
                    max_id: self.sent_id.min(oldest_kept - 1),
                    older_than: None,
                },
                _ => return Ok(None),
            },
        };
        Ok(Some(plan))
    }
}

/// Bounds of one atomic delete
///
/// Removes readings with `id <= max_id` and, when set, `user_ts <
/// older_than`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgePlan {
    pub max_id: u64,
    pub older_than: Option<DateTime<Utc>>,
}

/// Count and id range of the readings currently stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingStats {
    pub count: u64,
    pub min_id: Option<u64>,
    pub max_id: Option<u64>,
}

/// Outcome of a purge, reported back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeResult {
    pub removed: u64,
    pub unsent_retained: u64,
    pub remaining: ReadingStats,
    pub method: &'static str,
}

impl PurgeResult {
    pub fn to_document(&self) -> Value {
        json!({
            "removed": self.removed,
            "unsentPurged": 0,
            "unsentRetained": self.unsent_retained,
            "readings": self.remaining.count,
            "minId": self.remaining.min_id,
            "maxId": self.remaining.max_id,
            "method": self.method,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_from_flags_selects_strategy() {
        let req = PurgeRequest::from_flags(100, 0x0002 | 0x0001, 500);
        assert_eq!(req.strategy, PurgeStrategy::Rows { limit: 100 });
        assert!(req.flags.contains(PurgeFlags::RETAIN_UNSENT));

        let req = PurgeRequest::from_flags(24, 0x0001, 500);
        assert_eq!(req.strategy, PurgeStrategy::Age { hours: 24 });
    }

    #[test]
    fn test_age_plan_is_bounded_by_sent_id() {
        let req = PurgeRequest::by_age(24, PurgeFlags::default(), 40);
        let plan = req.plan(now(), |_| unreachable!()).unwrap().unwrap();

        assert_eq!(plan.max_id, 40);
        assert_eq!(
            plan.older_than,
            Some(Utc.with_ymd_and_hms(2024, 5, 31, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_rows_plan_keeps_newest() {
        // 150 readings with ids 1..=150; the 100th newest is id 51
        let req = PurgeRequest::by_rows(100, PurgeFlags::SIZE, 500);
        let plan = req
            .plan(now(), |n| Ok(Some(150 - n + 1)))
            .unwrap()
            .unwrap();

        assert_eq!(plan.max_id, 50);
        assert_eq!(plan.older_than, None);
    }

    #[test]
    fn test_rows_plan_respects_sent_id() {
        let req = PurgeRequest::by_rows(100, PurgeFlags::SIZE, 20);
        let plan = req.plan(now(), |_| Ok(Some(51))).unwrap().unwrap();
        assert_eq!(plan.max_id, 20);
    }

    #[test]
    fn test_rows_plan_with_fewer_rows_than_limit_is_noop() {
        let req = PurgeRequest::by_rows(100, PurgeFlags::SIZE, 500);
        assert!(req.plan(now(), |_| Ok(None)).unwrap().is_none());
    }

    #[test]
    fn test_age_beyond_calendar_range_is_noop() {
        let req = PurgeRequest::by_age(10_000_000_000, PurgeFlags::RETAIN_UNSENT, 5);
        assert!(req.plan(now(), |_| unreachable!()).unwrap().is_none());

        let req = PurgeRequest::by_age(u64::MAX, PurgeFlags::RETAIN_UNSENT, 5);
        assert!(req.plan(now(), |_| unreachable!()).unwrap().is_none());
    }

    #[test]
    fn test_nothing_sent_is_noop() {
        let req = PurgeRequest::by_age(0, PurgeFlags::default(), 0);
        assert!(req.plan(now(), |_| Ok(None)).unwrap().is_none());
    }

    #[test]
    fn test_result_document() {
        let result = PurgeResult {
            removed: 50,
            unsent_retained: 0,
            remaining: ReadingStats {
                count: 100,
                min_id: Some(51),
                max_id: Some(150),
            },
            method: "rows",
        };
        let doc = result.to_document();
        assert_eq!(doc["removed"], 50);
        assert_eq!(doc["readings"], 100);
        assert_eq!(doc["minId"], 51);
        assert_eq!(doc["unsentPurged"], 0);
    }
}
