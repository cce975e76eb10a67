//! Parsed syslog messages
//!
//! [`SyslogMessage`] is the unit flowing through the whole pipeline: the
//! parser produces it, the storage engine serializes it into a bulk-load row,
//! and the filter engine reads it back (now carrying its entry ID) to feed
//! subscribers.
//!
//! ## Priority
//!
//! RFC 5424 packs facility and severity into one number:
//! `priority = facility * 8 + severity`. The largest legal value is
//! `23 * 8 + 7 = 191`.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::host::Host;

/// Largest legal PRI value.
pub const MAX_PRIORITY: u8 = 191;

/// One structured-data element (`[id key="value" ...]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdElement {
    pub id: String,

    /// Parameters in the order they appeared on the wire
    pub params: Vec<(String, String)>,
}

impl SdElement {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A single syslog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyslogMessage {
    /// Entry ID, assigned by the database when the row is persisted
    pub id: Option<i64>,

    /// Owning host
    pub host: Host,

    /// Timestamp in the sender's offset, nanosecond precision
    pub timestamp: DateTime<FixedOffset>,

    pub priority: u8,

    /// HOSTNAME field as sent, `None` for nil
    pub hostname: Option<String>,

    pub app_name: Option<String>,

    pub proc_id: Option<String>,

    pub msg_id: Option<String>,

    pub structured_data: Vec<SdElement>,

    pub message: Option<String>,
}

impl SyslogMessage {
    pub fn new(host: Host, timestamp: DateTime<FixedOffset>, priority: u8) -> Self {
        Self {
            id: None,
            host,
            timestamp,
            priority,
            hostname: None,
            app_name: None,
            proc_id: None,
            msg_id: None,
            structured_data: Vec::new(),
            message: None,
        }
    }

    pub fn facility(&self) -> u8 {
        self.priority / 8
    }

    pub fn severity(&self) -> u8 {
        self.priority % 8
    }

    pub fn has_structured_data(&self) -> bool {
        !self.structured_data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(priority: u8) -> SyslogMessage {
        let host = Host::new(1, "127.0.0.1".parse().unwrap(), None);
        let ts = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2019, 8, 18, 23, 40, 18)
            .unwrap();
        SyslogMessage::new(host, ts, priority)
    }

    #[test]
    fn test_facility_and_severity() {
        let msg = message(34);
        assert_eq!(msg.facility(), 4);
        assert_eq!(msg.severity(), 2);

        let msg = message(MAX_PRIORITY);
        assert_eq!(msg.facility(), 23);
        assert_eq!(msg.severity(), 7);
    }

    #[test]
    fn test_sd_element_lookup() {
        let element = SdElement::new("origin")
            .with_param("ip", "10.0.0.1")
            .with_param("software", "rsyslogd");
        assert_eq!(element.param("software"), Some("rsyslogd"));
        assert_eq!(element.param("missing"), None);
        assert_eq!(element.params[0].0, "ip");
    }
}
