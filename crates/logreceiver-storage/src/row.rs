//! Bulk-Load Row Format
//!
//! Messages are written to PostgreSQL with `COPY ... FROM STDIN` in text
//! format, one row per message, `|` as column delimiter and the literal
//! `null` as NULL marker:
//!
//! ```text
//! priority|log_ts|log_ts_fraction|host_id|app_name|proc_id|msg_id|params|msg
//! 34|2019-8-18 23:40:18+2:0|123000|1|app|123|msg1|null|test message
//! ```
//!
//! ## Timestamp
//!
//! `log_ts` is written in the message's own offset without zero padding
//! (`Y-M-D H:M:S±h:m`, so -06:07 becomes `-6:7`). Sub-second precision goes
//! into the separate `log_ts_fraction` column as nanoseconds.
//!
//! ## Escaping
//!
//! | Character | Written as |
//! |-----------|------------|
//! | `\` | `\\` |
//! | backspace | `\b` |
//! | form feed | `\f` |
//! | newline | `\n` |
//! | carriage return | `\r` |
//! | tab | `\t` |
//! | `\|` | `\\|` |
//! | vertical tab | `\v` |
//!
//! Other control characters become a space; PostgreSQL text columns cannot
//! hold NUL.
//!
//! ## Structured data
//!
//! Stored as JSON:
//!
//! ```text
//! {"data" : [{"id" : "id2","params":null},{"id" : "id1","params":{"k2":"v2","k1":"v1"}}]}
//! ```
//!
//! Elements and their parameters are written in reverse order of appearance.
//! [`params_from_json`] restores the original order when reading back.

use std::fmt::{self, Write as _};

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};
use logreceiver_core::{Host, SdElement, SyslogMessage};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;

use crate::error::{Result, StorageError};

/// Column list shared by the COPY statement and the row encoder.
pub const COPY_COLUMNS: &str =
    "priority,log_ts,log_ts_fraction,host_id,app_name,proc_id,msg_id,params,msg";

const NULL: &str = "null";
const COLUMN_COUNT: usize = 9;

/// Renders `message` as one COPY row (without trailing newline).
pub fn encode_row(message: &SyslogMessage) -> Result<String> {
    let mut row = String::with_capacity(128);
    let ts = message.timestamp;

    write!(row, "{}|", message.priority).map_err(fmt_error)?;
    write_timestamp(&mut row, &ts).map_err(fmt_error)?;
    write!(row, "|{}|{}|", ts.nanosecond(), message.host.id).map_err(fmt_error)?;

    append_text(&mut row, message.app_name.as_deref());
    row.push('|');
    append_text(&mut row, message.proc_id.as_deref());
    row.push('|');
    append_text(&mut row, message.msg_id.as_deref());
    row.push('|');

    if message.structured_data.is_empty() {
        row.push_str(NULL);
    } else {
        let json = params_to_json(&message.structured_data)?;
        append_text(&mut row, Some(&json));
    }
    row.push('|');
    append_text(&mut row, message.message.as_deref());

    Ok(row)
}

fn fmt_error(e: fmt::Error) -> StorageError {
    StorageError::InvalidRow(e.to_string())
}

fn write_timestamp(out: &mut String, ts: &DateTime<FixedOffset>) -> fmt::Result {
    let offset = ts.offset().local_minus_utc();
    let sign = if offset < 0 { '-' } else { '+' };
    let offset = offset.abs();
    write!(
        out,
        "{}-{}-{} {}:{}:{}{}{}:{}",
        ts.year(),
        ts.month(),
        ts.day(),
        ts.hour(),
        ts.minute(),
        ts.second(),
        sign,
        offset / 3600,
        (offset % 3600) / 60
    )
}

fn append_text(out: &mut String, value: Option<&str>) {
    match value {
        Some(text) if !text.is_empty() => escape_into(out, text),
        _ => out.push_str(NULL),
    }
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '|' => out.push_str("\\|"),
            '\u{b}' => out.push_str("\\v"),
            c if (c as u32) < 32 => out.push(' '),
            c => out.push(c),
        }
    }
}

/// Structured data as JSON, elements and parameters in reverse order.
pub fn params_to_json(elements: &[SdElement]) -> Result<String> {
    let mut json = String::from("{\"data\" : [");
    for (i, element) in elements.iter().rev().enumerate() {
        if i > 0 {
            json.push(',');
        }
        json.push_str("{\"id\" : ");
        json.push_str(&json_string(&element.id)?);
        json.push_str(",\"params\":");
        if element.params.is_empty() {
            json.push_str(NULL);
        } else {
            json.push('{');
            for (j, (key, value)) in element.params.iter().rev().enumerate() {
                if j > 0 {
                    json.push(',');
                }
                json.push_str(&json_string(key)?);
                json.push(':');
                json.push_str(&json_string(value)?);
            }
            json.push('}');
        }
        json.push('}');
    }
    json.push_str("]}");
    Ok(json)
}

fn json_string(value: &str) -> Result<String> {
    let cleaned: String = value
        .chars()
        .map(|c| if (c as u32) < 32 { ' ' } else { c })
        .collect();
    Ok(serde_json::to_string(&cleaned)?)
}

/// Parameters that keep their JSON key order.
struct OrderedParams(Vec<(String, String)>);

impl<'de> Deserialize<'de> for OrderedParams {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ParamsVisitor;

        impl<'de> Visitor<'de> for ParamsVisitor {
            type Value = OrderedParams;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of string parameters")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut params = Vec::with_capacity(map.size_hint().unwrap_or(4));
                while let Some((key, value)) = map.next_entry::<String, String>()? {
                    params.push((key, value));
                }
                Ok(OrderedParams(params))
            }
        }

        deserializer.deserialize_map(ParamsVisitor)
    }
}

#[derive(Deserialize)]
struct JsonElement {
    id: String,
    params: Option<OrderedParams>,
}

#[derive(Deserialize)]
struct JsonData {
    data: Vec<JsonElement>,
}

/// Parses the `params` column back into elements in original order.
pub fn params_from_json(json: &str) -> Result<Vec<SdElement>> {
    let parsed: JsonData = serde_json::from_str(json)?;
    Ok(parsed
        .data
        .into_iter()
        .rev()
        .map(|element| {
            let mut params = element.params.map(|p| p.0).unwrap_or_default();
            params.reverse();
            SdElement {
                id: element.id,
                params,
            }
        })
        .collect())
}

/// Column values of one row as the database sees them after COPY.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFields {
    pub priority: i16,
    pub log_ts: DateTime<FixedOffset>,
    pub log_ts_fraction: i32,
    pub host_id: i64,
    pub app_name: Option<String>,
    pub proc_id: Option<String>,
    pub msg_id: Option<String>,
    pub params: Option<String>,
    pub msg: Option<String>,
}

/// Splits and unescapes one COPY text row.
pub fn decode_row(line: &str) -> Result<RowFields> {
    let mut columns: Vec<Option<String>> = Vec::with_capacity(COLUMN_COUNT);
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| StorageError::InvalidRow(format!("dangling escape: {}", line)))?;
                current.push(match escaped {
                    'b' => '\u{8}',
                    'f' => '\u{c}',
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    'v' => '\u{b}',
                    other => other,
                });
            }
            '|' => columns.push(finish_column(&mut current)),
            c => current.push(c),
        }
    }
    columns.push(finish_column(&mut current));

    if columns.len() != COLUMN_COUNT {
        return Err(StorageError::InvalidRow(format!(
            "expected {} columns, got {}: {}",
            COLUMN_COUNT,
            columns.len(),
            line
        )));
    }

    let mut columns = columns.into_iter();
    let mut next = || columns.next().flatten();

    let priority = required(next(), "priority")?;
    let log_ts = required(next(), "log_ts")?;
    let fraction = required(next(), "log_ts_fraction")?;
    let host_id = required(next(), "host_id")?;

    Ok(RowFields {
        priority: parse_number(&priority, "priority")?,
        log_ts: parse_timestamp(&log_ts)?,
        log_ts_fraction: parse_number(&fraction, "log_ts_fraction")?,
        host_id: parse_number(&host_id, "host_id")?,
        app_name: next(),
        proc_id: next(),
        msg_id: next(),
        params: next(),
        msg: next(),
    })
}

fn finish_column(current: &mut String) -> Option<String> {
    let value = std::mem::take(current);
    if value == NULL {
        None
    } else {
        Some(value)
    }
}

fn required(value: Option<String>, column: &str) -> Result<String> {
    value.ok_or_else(|| StorageError::InvalidRow(format!("{} must not be null", column)))
}

fn parse_number<T: std::str::FromStr>(value: &str, column: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| StorageError::InvalidRow(format!("invalid {}: {}", column, value)))
}

/// Parses the unpadded `Y-M-D H:M:S±h:m` form written by [`encode_row`].
pub fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>> {
    let invalid = || StorageError::InvalidRow(format!("invalid timestamp: {}", value));

    let (date, time) = value.split_once(' ').ok_or_else(invalid)?;
    let sign_pos = time
        .rfind(|c: char| c == '+' || c == '-')
        .ok_or_else(invalid)?;
    let (clock, zone) = time.split_at(sign_pos);

    let date: Vec<u32> = date
        .split('-')
        .map(|p| p.parse().map_err(|_| invalid()))
        .collect::<Result<_>>()?;
    let clock: Vec<u32> = clock
        .split(':')
        .map(|p| p.parse().map_err(|_| invalid()))
        .collect::<Result<_>>()?;
    let (zone_hours, zone_minutes) = zone[1..].split_once(':').ok_or_else(invalid)?;
    let zone_hours: i32 = zone_hours.parse().map_err(|_| invalid())?;
    let zone_minutes: i32 = zone_minutes.parse().map_err(|_| invalid())?;

    if date.len() != 3 || clock.len() != 3 {
        return Err(invalid());
    }

    let mut offset = zone_hours * 3600 + zone_minutes * 60;
    if zone.starts_with('-') {
        offset = -offset;
    }
    let offset = FixedOffset::east_opt(offset).ok_or_else(invalid)?;
    let naive = NaiveDate::from_ymd_opt(date[0] as i32, date[1], date[2])
        .and_then(|d| d.and_hms_opt(clock[0], clock[1], clock[2]))
        .ok_or_else(invalid)?;

    offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(invalid)
}

/// A persisted message as read back from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub entry_id: i64,
    pub fields: RowFields,
}

impl StoredRow {
    /// Builds the message for `host`.
    ///
    /// A row carrying another host's ID means the wrong table was read and
    /// is reported as [`StorageError::HostMismatch`].
    pub fn into_message(self, host: &Host) -> Result<SyslogMessage> {
        let fields = self.fields;
        if fields.host_id != host.id {
            return Err(StorageError::HostMismatch {
                expected: host.id,
                actual: fields.host_id,
            });
        }

        let nanos = u32::try_from(fields.log_ts_fraction).unwrap_or(0);
        let timestamp = fields
            .log_ts
            .with_nanosecond(nanos)
            .unwrap_or(fields.log_ts);
        let priority = u8::try_from(fields.priority)
            .map_err(|_| StorageError::InvalidRow(format!("invalid priority {}", fields.priority)))?;

        let mut message = SyslogMessage::new(host.clone(), timestamp, priority);
        message.id = Some(self.entry_id);
        message.hostname = host.name.clone();
        message.app_name = fields.app_name;
        message.proc_id = fields.proc_id;
        message.msg_id = fields.msg_id;
        message.structured_data = match fields.params.as_deref() {
            Some(json) => params_from_json(json)?,
            None => Vec::new(),
        };
        message.message = fields.msg;
        Ok(message)
    }
}

/// Converts a UTC timestamp read from the database into the row's offset form.
pub(crate) fn utc_to_fixed(ts: DateTime<Utc>) -> DateTime<FixedOffset> {
    ts.fixed_offset()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: i64) -> Host {
        Host::new(id, "127.0.0.1".parse().unwrap(), Some("myhost".to_string()))
    }

    fn ts(offset_secs: i32, y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32, nanos: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(offset_secs)
            .unwrap()
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
            .with_nanosecond(nanos)
            .unwrap()
    }

    #[test]
    fn test_minimal_row() {
        let message = SyslogMessage::new(host(123), ts(2 * 3600, 2019, 8, 18, 23, 40, 18, 0), 0);
        assert_eq!(
            encode_row(&message).unwrap(),
            "0|2019-8-18 23:40:18+2:0|0|123|null|null|null|null|null"
        );
    }

    #[test]
    fn test_fraction_column_holds_nanos() {
        let message = SyslogMessage::new(host(1), ts(2 * 3600, 2019, 8, 18, 23, 40, 18, 123), 0);
        assert_eq!(
            encode_row(&message).unwrap(),
            "0|2019-8-18 23:40:18+2:0|123|1|null|null|null|null|null"
        );
    }

    #[test]
    fn test_negative_offset_and_text_fields() {
        let mut message = SyslogMessage::new(
            host(5),
            ts(-(6 * 3600 + 7 * 60), 1234, 12, 1, 2, 3, 4, 5),
            191,
        );
        message.app_name = Some("app".to_string());
        message.proc_id = Some("proc".to_string());
        message.msg_id = Some("".to_string());
        message.message = Some("message".to_string());

        assert_eq!(
            encode_row(&message).unwrap(),
            "191|1234-12-1 2:3:4-6:7|5|5|app|proc|null|null|message"
        );
    }

    #[test]
    fn test_escaping() {
        let mut message = SyslogMessage::new(host(1), ts(0, 2019, 1, 1, 0, 0, 0, 0), 1);
        message.message = Some("a|b\\c\nd\re\tf\u{8}g\u{c}h\u{b}i\u{0}j".to_string());

        let row = encode_row(&message).unwrap();
        assert!(row.ends_with("|a\\|b\\\\c\\nd\\re\\tf\\bg\\fh\\vi j"), "{}", row);
    }

    #[test]
    fn test_structured_data_reverse_order() {
        let mut message = SyslogMessage::new(host(1), ts(0, 2019, 1, 1, 0, 0, 0, 0), 1);
        message.structured_data = vec![
            SdElement::new("id1")
                .with_param("key1", "value1")
                .with_param("key2", "value2")
                .with_param("key3", "value4"),
            SdElement::new("id2"),
        ];

        assert_eq!(
            params_to_json(&message.structured_data).unwrap(),
            r#"{"data" : [{"id" : "id2","params":null},{"id" : "id1","params":{"key3":"value4","key2":"value2","key1":"value1"}}]}"#
        );
    }

    #[test]
    fn test_json_quotes_and_control_chars() {
        let elements = vec![SdElement::new("a\"b").with_param("k", "x\ny|z\\")];
        let json = params_to_json(&elements).unwrap();
        assert_eq!(
            json,
            r#"{"data" : [{"id" : "a\"b","params":{"k":"x y|z\\"}}]}"#
        );

        // The COPY layer escapes the JSON once more.
        let mut message = SyslogMessage::new(host(1), ts(0, 2019, 1, 1, 0, 0, 0, 0), 1);
        message.structured_data = elements;
        let row = encode_row(&message).unwrap();
        let decoded = decode_row(&row).unwrap();
        assert_eq!(decoded.params.as_deref(), Some(json.as_str()));
    }

    #[test]
    fn test_params_json_restores_order() {
        let elements = vec![
            SdElement::new("first").with_param("b", "2").with_param("a", "1"),
            SdElement::new("second"),
        ];
        let json = params_to_json(&elements).unwrap();
        assert_eq!(params_from_json(&json).unwrap(), elements);
    }

    #[test]
    fn test_decode_row() {
        let fields = decode_row("34|2019-8-18 23:40:18+2:0|123000|7|app|1\\|2|null|null|hello\\nworld").unwrap();
        assert_eq!(fields.priority, 34);
        assert_eq!(fields.log_ts, ts(2 * 3600, 2019, 8, 18, 23, 40, 18, 0));
        assert_eq!(fields.log_ts_fraction, 123_000);
        assert_eq!(fields.host_id, 7);
        assert_eq!(fields.app_name.as_deref(), Some("app"));
        assert_eq!(fields.proc_id.as_deref(), Some("1|2"));
        assert_eq!(fields.msg_id, None);
        assert_eq!(fields.msg.as_deref(), Some("hello\nworld"));
    }

    #[test]
    fn test_decode_rejects_wrong_column_count() {
        assert!(decode_row("1|2|3").is_err());
        assert!(decode_row("x|2019-1-1 0:0:0+0:0|0|1|null|null|null|null|null").is_err());
    }

    #[test]
    fn test_parse_timestamp_negative_zero_hours() {
        let parsed = parse_timestamp("2020-2-29 0:0:0-0:30").unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), -30 * 60);
    }

    #[test]
    fn test_stored_row_into_message() {
        let mut original = SyslogMessage::new(host(9), ts(3600, 2021, 5, 6, 7, 8, 9, 250), 13);
        original.app_name = Some("cron".to_string());
        original.structured_data = vec![SdElement::new("meta").with_param("seq", "1")];
        original.message = Some("job done".to_string());

        let row = StoredRow {
            entry_id: 42,
            fields: decode_row(&encode_row(&original).unwrap()).unwrap(),
        };
        let restored = row.into_message(&host(9)).unwrap();

        assert_eq!(restored.id, Some(42));
        assert_eq!(restored.timestamp, original.timestamp);
        assert_eq!(restored.app_name, original.app_name);
        assert_eq!(restored.structured_data, original.structured_data);
        assert_eq!(restored.message, original.message);
    }

    #[test]
    fn test_stored_row_host_mismatch() {
        let original = SyslogMessage::new(host(1), ts(0, 2021, 1, 1, 0, 0, 0, 0), 13);
        let row = StoredRow {
            entry_id: 1,
            fields: decode_row(&encode_row(&original).unwrap()).unwrap(),
        };
        assert!(matches!(
            row.into_message(&host(2)),
            Err(StorageError::HostMismatch { expected: 2, actual: 1 })
        ));
    }
}
