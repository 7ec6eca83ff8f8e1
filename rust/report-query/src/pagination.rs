//! Opaque keyset cursors for history listings.

use crate::error::{Result, ServiceError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position after the last item of a page ordered by
/// `(started_at DESC, id DESC)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCursor {
    #[serde(rename = "t")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "i")]
    pub id: Uuid,
}

impl HistoryCursor {
    /// True when `(started_at, id)` sorts after the cursor.
    pub fn precedes(&self, started_at: DateTime<Utc>, id: Uuid) -> bool {
        started_at < self.started_at || (started_at == self.started_at && id < self.id)
    }
}

pub fn decode_cursor(cursor: &str) -> Result<HistoryCursor> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| ServiceError::validation("invalid cursor"))?;
    serde_json::from_slice(&bytes).map_err(|_| ServiceError::validation("invalid cursor payload"))
}

pub fn encode_cursor(cursor: &HistoryCursor) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(cursor).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cursor_survives_encoding_and_rejects_garbage() {
        let cursor = HistoryCursor {
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            id: Uuid::nil(),
        };
        assert_eq!(decode_cursor(&encode_cursor(&cursor)).unwrap(), cursor);
        assert!(matches!(decode_cursor("%%%"), Err(ServiceError::Validation(_))));
        assert!(matches!(
            decode_cursor(&URL_SAFE_NO_PAD.encode(b"{\"offset\":3}")),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn precedes_orders_by_time_then_id() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let cursor = HistoryCursor {
            started_at: at,
            id: Uuid::from_u128(5),
        };
        assert!(cursor.precedes(at - chrono::Duration::seconds(1), Uuid::from_u128(9)));
        assert!(cursor.precedes(at, Uuid::from_u128(4)));
        assert!(!cursor.precedes(at, Uuid::from_u128(5)));
    }
}
