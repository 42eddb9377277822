//! Transaction markers let a task wait until the transaction that dispatched it has committed.
//!
//! The dispatcher writes a marker row inside its own transaction and sends the marker id plus an
//! expiry with the task. The delivery side retries (`notYetVisible`) until the row is visible and
//! gives up (`transactionExpired`) once the expiry has passed, which means the transaction rolled
//! back.

use crate::Error;
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

pub const TRANSACTION_MARKER_HEADER: &str = "X-Transaction";
pub const TRANSACTION_EXPIRE_HEADER: &str = "X-Transaction-Expire";

const EXPIRY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionMarker {
    pub id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl TransactionMarker {
    pub fn new(id: Uuid, expires_at: DateTime<Utc>) -> Self {
        Self { id, expires_at }
    }

    /// Fresh marker that expires `ttl` from `now`.
    pub fn generate(now: DateTime<Utc>, ttl: chrono::Duration) -> crate::Result<Self> {
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| Error::configuration("transaction marker expiry is out of range"))?;
        Ok(Self {
            id: Uuid::new_v4(),
            expires_at,
        })
    }

    pub fn headers(&self) -> [(&'static str, String); 2] {
        [
            (TRANSACTION_MARKER_HEADER, self.id.to_string()),
            (TRANSACTION_EXPIRE_HEADER, format_expiry(self.expires_at)),
        ]
    }
}

pub fn format_expiry(at: DateTime<Utc>) -> String {
    at.format(EXPIRY_FORMAT).to_string()
}

/// Parses an `X-Transaction-Expire` value, interpreted as UTC.
pub fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), EXPIRY_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn expiry_round_trips_at_second_precision() {
        let at = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(format_expiry(at), "2021-03-04 05:06:07");
        assert_eq!(parse_expiry("2021-03-04 05:06:07"), Some(at));
    }

    #[test]
    fn generated_marker_expires_after_ttl() {
        let now = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        let marker = TransactionMarker::generate(now, chrono::Duration::minutes(10)).unwrap();
        assert_eq!(marker.expires_at, now + chrono::Duration::minutes(10));
        assert_eq!(marker.headers()[1].1, "2021-03-04 05:16:07");
    }

    #[test]
    fn out_of_range_ttl_is_a_configuration_error() {
        let ttl = chrono::Duration::try_seconds(i64::MAX / 1_000).unwrap();
        let err = TransactionMarker::generate(Utc::now(), ttl).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn rejects_garbage_expiry() {
        assert_eq!(parse_expiry("yesterday"), None);
        assert_eq!(parse_expiry(""), None);
    }
}
