//! License expiry extraction
//!
//! The plain part of a license is pipe-delimited with the expiry (epoch
//! milliseconds) in the third field. Anything unexpected means "no known
//! expiry"; parsing never fails a status cycle.

use super::client::License;
use chrono::{DateTime, TimeZone, Utc};

const EXPIRY_FIELD: usize = 2;

/// Expiry in epoch milliseconds, if the plain string carries a usable one
pub fn parse_expiry_ms(plain: &str) -> Option<i64> {
    plain
        .split('|')
        .nth(EXPIRY_FIELD)
        .map(str::trim)
        .and_then(|field| field.parse::<i64>().ok())
        .filter(|ms| *ms > 0)
}

impl License {
    pub fn expiration_ms(&self) -> Option<i64> {
        parse_expiry_ms(&self.plain)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expiration_ms()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}
