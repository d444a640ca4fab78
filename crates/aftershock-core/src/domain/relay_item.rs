//! Relay items: the immutable, time-ordered records replicated between servers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a relay item, taken from the prefix of its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayItemKind {
    /// Server status; kept in memory by the receiver, never persisted there.
    ServerStatus,
    /// Completion record (a report was sent).
    Completion,
    /// Removal record (a report was withdrawn).
    Removal,
    /// Analyst selection; newer entries replace older ones.
    AnalystSelection,
}

impl RelayItemKind {
    pub fn prefix(self) -> &'static str {
        match self {
            RelayItemKind::ServerStatus => "status",
            RelayItemKind::Completion => "done",
            RelayItemKind::Removal => "rm",
            RelayItemKind::AnalystSelection => "sel",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "status" => Some(RelayItemKind::ServerStatus),
            "done" => Some(RelayItemKind::Completion),
            "rm" => Some(RelayItemKind::Removal),
            "sel" => Some(RelayItemKind::AnalystSelection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayIdError {
    #[error("relay id '{0}' has no kind prefix")]
    Malformed(String),

    #[error("relay id '{0}' has an unknown kind")]
    UnknownKind(String),
}

/// Type-classified id: `"<kind>:<key>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(String);

impl RelayId {
    pub fn new(kind: RelayItemKind, key: impl fmt::Display) -> Self {
        Self(format!("{}:{}", kind.prefix(), key))
    }

    /// Id of the status record of a server.
    pub fn server_status(server_number: u8) -> Self {
        Self::new(RelayItemKind::ServerStatus, server_number)
    }

    /// Wrap a raw id received from elsewhere; classification happens on `kind()`.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> Result<RelayItemKind, RelayIdError> {
        let (prefix, key) = self
            .0
            .split_once(':')
            .ok_or_else(|| RelayIdError::Malformed(self.0.clone()))?;
        if key.is_empty() {
            return Err(RelayIdError::Malformed(self.0.clone()));
        }
        RelayItemKind::from_prefix(prefix).ok_or_else(|| RelayIdError::UnknownKind(self.0.clone()))
    }

    pub fn key(&self) -> &str {
        self.0.split_once(':').map(|(_, key)| key).unwrap_or("")
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A replicated record.
///
/// Items are totally ordered by `(relay_time, relay_stamp, relay_id, payload)`;
/// the derived `Ord` follows field order, so do not reorder the fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelayItem {
    /// Logical order key (ms).
    pub relay_time: i64,
    /// Tiebreak written by the producing server, `"<server>-<counter>"`.
    pub relay_stamp: String,
    pub relay_id: RelayId,
    pub payload: Vec<u8>,
}

impl RelayItem {
    pub fn new(
        relay_id: RelayId,
        relay_time: i64,
        relay_stamp: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            relay_time,
            relay_stamp: relay_stamp.into(),
            relay_id,
            payload,
        }
    }

    pub fn kind(&self) -> Result<RelayItemKind, RelayIdError> {
        self.relay_id.kind()
    }

    /// Strictly newer under the total order.
    pub fn is_newer_than(&self, other: &RelayItem) -> bool {
        self > other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    fn item(time: i64, stamp: &str, id: &str, payload: &[u8]) -> RelayItem {
        RelayItem::new(RelayId::from_raw(id), time, stamp, payload.to_vec())
    }

    #[test]
    fn classifies_known_prefixes() {
        assert_eq!(RelayId::server_status(2).kind(), Ok(RelayItemKind::ServerStatus));
        assert_eq!(RelayId::server_status(2).key(), "2");
        assert_eq!(
            RelayId::new(RelayItemKind::Completion, "us7000abcd").kind(),
            Ok(RelayItemKind::Completion)
        );
        assert!(matches!(RelayId::from_raw("zzz:1").kind(), Err(RelayIdError::UnknownKind(_))));
        assert!(matches!(RelayId::from_raw("done").kind(), Err(RelayIdError::Malformed(_))));
        assert!(matches!(RelayId::from_raw("done:").kind(), Err(RelayIdError::Malformed(_))));
    }

    #[test]
    fn order_is_time_then_tiebreak() {
        let a = item(100, "1-5", "done:a", b"{}");
        let b = item(100, "1-6", "done:a", b"{}");
        let c = item(101, "1-0", "done:a", b"{}");
        assert!(a < b);
        assert!(b < c);
        assert!(c.is_newer_than(&a));
    }

    #[test]
    fn order_is_strict_total_over_a_generated_set() {
        let mut items = Vec::new();
        for time in [5, 7] {
            for stamp in ["1-1", "2-1"] {
                for id in ["done:x", "status:2"] {
                    for payload in [&b"{}"[..], &b"[]"[..]] {
                        items.push(item(time, stamp, id, payload));
                    }
                }
            }
        }

        for a in &items {
            // irreflexive
            assert!(!(a < a));
            for b in &items {
                // antisymmetric, and total: exactly one of <, ==, > holds
                let lt = a < b;
                let gt = a > b;
                let eq = a == b;
                assert_eq!(u8::from(lt) + u8::from(gt) + u8::from(eq), 1);
                assert_eq!(a.cmp(b), b.cmp(a).reverse());
                for c in &items {
                    if a < b && b < c {
                        assert!(a < c);
                    }
                }
            }
        }

        let mut sorted = items.clone();
        sorted.sort();
        assert!(sorted.windows(2).all(|w| w[0].cmp(&w[1]) != Ordering::Greater));
    }
}
