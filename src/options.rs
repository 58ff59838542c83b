//! The connection-string option parser named in `spec.md §4.6`/`§6`.
//!
//! `spec.md` treats connection-string parsing itself as an external
//! collaborator ("provides recognized options; we enumerate only those the
//! core reads") — this is that enumeration: `DefaultTimeout` is read and
//! validated, every other `key=value` pair is kept verbatim for whatever
//! forwards it on to the underlying SQLite connection.

use std::{collections::HashMap, time::Duration};

use crate::Error;

/// `key=value;key=value;...` options parsed out of a connection string.
/// Keys are matched case-insensitively. A `DefaultTimeout` of `0` means no
/// timeout, per `spec.md §6`.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    default_timeout: Duration,
    extra: HashMap<String, String>,
}

impl ConnectionOptions {
    pub fn parse(connection_string: &str) -> Result<Self, Error> {
        let mut default_timeout = Duration::from_millis(15_000);
        let mut extra = HashMap::new();

        for pair in connection_string.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }

            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidOperation(format!("malformed connection-string option: {pair:?}"))
            })?;
            let key = key.trim();
            let value = value.trim();

            if key.eq_ignore_ascii_case("DefaultTimeout") {
                let millis: u64 = value.parse().map_err(|_| {
                    Error::InvalidOperation(format!("DefaultTimeout must be a non-negative integer, got {value:?}"))
                })?;
                default_timeout = Duration::from_millis(millis);
            } else {
                extra.insert(key.to_owned(), value.to_owned());
            }
        }

        Ok(Self { default_timeout, extra })
    }

    /// `Duration::ZERO` means "no timeout", per `spec.md §6`.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Everything other than `DefaultTimeout`, forwarded verbatim to the
    /// underlying SQLite connection. Unused by this crate's own logic.
    pub fn extra(&self) -> &HashMap<String, String> {
        &self.extra
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(15_000),
            extra: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_timeout_in_milliseconds() {
        let options = ConnectionOptions::parse("DefaultTimeout=2500").unwrap();
        assert_eq!(options.default_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn zero_means_no_timeout() {
        let options = ConnectionOptions::parse("defaulttimeout=0").unwrap();
        assert_eq!(options.default_timeout(), Duration::ZERO);
    }

    #[test]
    fn forwards_unrecognized_options_verbatim() {
        let options = ConnectionOptions::parse("Data Source=/tmp/x.db;Cache=Shared").unwrap();
        assert_eq!(options.extra().get("Data Source").map(String::as_str), Some("/tmp/x.db"));
        assert_eq!(options.extra().get("Cache").map(String::as_str), Some("Shared"));
    }

    #[test]
    fn malformed_pair_is_invalid_operation() {
        let error = ConnectionOptions::parse("nope").unwrap_err();
        assert!(matches!(error, Error::InvalidOperation(_)));
    }
}
