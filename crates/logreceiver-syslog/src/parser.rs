//! RFC 5424 message parser.
//!
//! The grammar is read strictly left to right:
//!
//! | Field | Form | Limit |
//! |-------|------|-------|
//! | PRI | `<` 1-3 digits `>` | value <= 191 |
//! | VERSION | 1-3 digits | |
//! | TIMESTAMP | `-` or `YYYY-MM-DDTHH:MM:SS[.F][Z\|±HH:MM]` | fraction 1-6 digits |
//! | HOSTNAME | `-` or printable US-ASCII | 255 |
//! | APP-NAME | `-` or printable US-ASCII | 48 |
//! | PROCID | `-` or printable US-ASCII | 128 |
//! | MSGID | `-` or printable US-ASCII | 32 |
//! | STRUCTURED-DATA | `-` or `[id key="value" ...]`+ | SD names 32 |
//! | MSG | remaining bytes, trimmed | |
//!
//! The host registry is consulted right after HOSTNAME, so a message that
//! fails later in the grammar may still have allocated its host.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use logreceiver_core::{HostResolver, SdElement, SyslogMessage, MAX_PRIORITY};

use crate::error::{ParseError, Result};
use crate::scanner::{Scanner, SP};

const MAX_HOSTNAME_LEN: usize = 255;
const MAX_APP_NAME_LEN: usize = 48;
const MAX_PROC_ID_LEN: usize = 128;
const MAX_MSG_ID_LEN: usize = 32;
const MAX_SD_NAME_LEN: usize = 32;
const MAX_FRACTION_DIGITS: usize = 6;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Counters kept by one parser instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParserStats {
    pub parsed: u64,
    pub failed: u64,
}

/// Fields read before the host is resolved.
struct Header {
    priority: u8,
    timestamp: DateTime<FixedOffset>,
    hostname: Option<String>,
}

/// Parses datagrams into [`SyslogMessage`] values.
///
/// One instance per ingestion worker.
pub struct SyslogParser {
    resolver: Arc<dyn HostResolver>,
    stats: ParserStats,
}

impl SyslogParser {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver,
            stats: ParserStats::default(),
        }
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ParserStats::default();
    }

    /// Parses one datagram received from `sender`.
    pub async fn parse(&mut self, sender: IpAddr, input: &[u8]) -> Result<SyslogMessage> {
        let result = self.parse_message(sender, input).await;
        match result {
            Ok(_) => self.stats.parsed += 1,
            Err(_) => self.stats.failed += 1,
        }
        result
    }

    async fn parse_message(&self, sender: IpAddr, input: &[u8]) -> Result<SyslogMessage> {
        let mut scanner = Scanner::new(input);

        let header = parse_header(&mut scanner)?;
        let host = self
            .resolver
            .get_or_create_host(sender, header.hostname.as_deref())
            .await?;

        let mut message = SyslogMessage::new(host, header.timestamp, header.priority);
        message.hostname = header.hostname;

        scanner.consume(SP)?;
        message.app_name = parse_optional_ascii(&mut scanner, MAX_APP_NAME_LEN)?;
        scanner.consume(SP)?;
        message.proc_id = parse_optional_ascii(&mut scanner, MAX_PROC_ID_LEN)?;
        scanner.consume(SP)?;
        message.msg_id = parse_optional_ascii(&mut scanner, MAX_MSG_ID_LEN)?;
        scanner.consume(SP)?;
        message.structured_data = parse_structured_data(&mut scanner)?;
        message.message = parse_body(&mut scanner);

        Ok(message)
    }
}

fn parse_header(scanner: &mut Scanner<'_>) -> Result<Header> {
    let priority = parse_priority(scanner)?;
    scanner.number(1, 3, "version")?;
    scanner.consume(SP)?;
    let timestamp = parse_timestamp(scanner)?;
    scanner.consume(SP)?;
    let hostname = parse_optional_ascii(scanner, MAX_HOSTNAME_LEN)?;

    Ok(Header {
        priority,
        timestamp,
        hostname,
    })
}

fn parse_priority(scanner: &mut Scanner<'_>) -> Result<u8> {
    let start = scanner.offset();
    scanner.consume(b'<')?;
    let value = scanner.number(1, 3, "priority")?;
    if value > u32::from(MAX_PRIORITY) {
        return Err(ParseError::syntax(
            start,
            format!("Number {} is out-of-range for priority", value),
        ));
    }
    scanner.consume(b'>')?;
    // Bounded by MAX_PRIORITY above.
    Ok(value as u8)
}

fn parse_optional_ascii(scanner: &mut Scanner<'_>, max_len: usize) -> Result<Option<String>> {
    if scanner.maybe_nil() {
        return Ok(None);
    }
    scanner.us_ascii(max_len).map(Some)
}

fn parse_timestamp(scanner: &mut Scanner<'_>) -> Result<DateTime<FixedOffset>> {
    if scanner.maybe_nil() {
        return Ok(Utc::now().fixed_offset());
    }

    let start = scanner.offset();
    let year = scanner.fixed_number(4, "year (YYYY)", |v| v > 0)?;
    scanner.consume(b'-')?;
    let month = scanner.fixed_number(2, "month (MM)", |v| (1..=12).contains(&v))?;
    scanner.consume(b'-')?;
    let day = scanner.fixed_number(2, "monthday (DD)", |v| (1..=31).contains(&v))?;
    scanner.consume(b'T')?;
    let hour = scanner.fixed_number(2, "hour (HH)", |v| v < 24)?;
    scanner.consume(b':')?;
    let minute = scanner.fixed_number(2, "minute (MM)", |v| v < 60)?;
    scanner.consume(b':')?;
    let second = scanner.fixed_number(2, "seconds (SS)", |v| v < 60)?;

    let nanos = if scanner.maybe_consume(b'.') {
        let digits_start = scanner.offset();
        let fraction = scanner.number(1, MAX_FRACTION_DIGITS, "fraction")?;
        let digits = (scanner.offset() - digits_start) as u32;
        fraction * 10u32.pow(9 - digits)
    } else {
        0
    };

    let offset_seconds = parse_timezone(scanner)?;

    let date = NaiveDate::from_ymd_opt(year as i32, month, day).ok_or_else(|| {
        ParseError::syntax(
            start,
            format!("Invalid date {:04}-{:02}-{:02}", year, month, day),
        )
    })?;
    let naive = date
        .and_hms_nano_opt(hour, minute, second, nanos)
        .ok_or_else(|| ParseError::syntax(start, "Invalid time of day"))?;
    let offset = FixedOffset::east_opt(offset_seconds)
        .ok_or_else(|| ParseError::syntax(start, "Invalid timezone offset"))?;

    offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| ParseError::syntax(start, "Timestamp is not representable"))
}

/// Returns the UTC offset in seconds. A missing designator means UTC.
fn parse_timezone(scanner: &mut Scanner<'_>) -> Result<i32> {
    if scanner.maybe_consume(b'Z') {
        return Ok(0);
    }
    let sign = match scanner.peek() {
        Some(b'+') => 1,
        Some(b'-') => -1,
        _ => return Ok(0),
    };
    scanner.next()?;
    let hours = scanner.fixed_number(2, "timezone hour (HH)", |v| v < 24)?;
    scanner.consume(b':')?;
    let minutes = scanner.fixed_number(2, "timezone minute (MM)", |v| v < 60)?;
    Ok(sign * (hours as i32 * 3600 + minutes as i32 * 60))
}

fn parse_structured_data(scanner: &mut Scanner<'_>) -> Result<Vec<SdElement>> {
    if scanner.maybe_nil() {
        return Ok(Vec::new());
    }

    let mut elements = Vec::new();
    while scanner.peek() == Some(b'[') {
        elements.push(parse_sd_element(scanner)?);
    }
    if elements.is_empty() {
        return Err(ParseError::syntax(scanner.offset(), "Expected SD-Element"));
    }
    Ok(elements)
}

fn parse_sd_element(scanner: &mut Scanner<'_>) -> Result<SdElement> {
    scanner.consume(b'[')?;
    let mut element = SdElement::new(scanner.sd_name(MAX_SD_NAME_LEN)?);

    while scanner.maybe_consume(SP) {
        let key = scanner.sd_name(MAX_SD_NAME_LEN)?;
        scanner.consume(b'=')?;
        scanner.consume(b'"')?;
        let value = String::from_utf8_lossy(scanner.until(b'"')?).into_owned();
        scanner.consume(b'"')?;
        element.params.push((key, value));
    }
    scanner.consume(b']')?;

    Ok(element)
}

fn parse_body(scanner: &mut Scanner<'_>) -> Option<String> {
    let mut rest = scanner.rest();
    while let Some((&SP, tail)) = rest.split_first() {
        rest = tail;
    }
    if let Some(tail) = rest.strip_prefix(UTF8_BOM) {
        rest = tail;
    }
    let body = String::from_utf8_lossy(rest);
    let body = body.trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Datelike, Timelike};
    use logreceiver_core::Host;
    use std::sync::Mutex;

    /// Hands out one host per address and records what it was asked.
    #[derive(Default)]
    struct RecordingResolver {
        calls: Mutex<Vec<(IpAddr, Option<String>)>>,
    }

    #[async_trait]
    impl HostResolver for RecordingResolver {
        async fn get_or_create_host(
            &self,
            address: IpAddr,
            name: Option<&str>,
        ) -> logreceiver_core::Result<Host> {
            self.calls
                .lock()
                .unwrap()
                .push((address, name.map(str::to_string)));
            Ok(Host::new(42, address, name.map(str::to_string)))
        }
    }

    fn sender() -> IpAddr {
        "10.1.2.3".parse().unwrap()
    }

    fn parser() -> (SyslogParser, Arc<RecordingResolver>) {
        let resolver = Arc::new(RecordingResolver::default());
        (SyslogParser::new(resolver.clone()), resolver)
    }

    async fn parse(input: &str) -> Result<SyslogMessage> {
        let (mut parser, _) = parser();
        parser.parse(sender(), input.as_bytes()).await
    }

    async fn parse_err(input: &str) -> (usize, String) {
        match parse(input).await {
            Err(ParseError::Syntax { offset, message }) => (offset, message),
            other => panic!("expected syntax error for {:?}, got {:?}", input, other),
        }
    }

    // ========================================================================
    // Happy paths
    // ========================================================================

    #[tokio::test]
    async fn test_parse_full_message() {
        let (mut parser, resolver) = parser();
        let msg = parser
            .parse(
                sender(),
                b"<34>1 2019-08-18T23:40:18.000123+02:00 myhost app 123 msg1 - test message",
            )
            .await
            .unwrap();

        assert_eq!(msg.priority, 34);
        assert_eq!(msg.host.id, 42);
        assert_eq!(msg.hostname.as_deref(), Some("myhost"));
        assert_eq!(msg.app_name.as_deref(), Some("app"));
        assert_eq!(msg.proc_id.as_deref(), Some("123"));
        assert_eq!(msg.msg_id.as_deref(), Some("msg1"));
        assert!(msg.structured_data.is_empty());
        assert_eq!(msg.message.as_deref(), Some("test message"));
        assert!(msg.id.is_none());

        let ts = msg.timestamp;
        assert_eq!((ts.year(), ts.month(), ts.day()), (2019, 8, 18));
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (23, 40, 18));
        assert_eq!(ts.nanosecond(), 123_000);
        assert_eq!(ts.offset().local_minus_utc(), 2 * 3600);

        let calls = resolver.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[(sender(), Some("myhost".to_string()))]);
        assert_eq!(parser.stats().parsed, 1);
    }

    #[tokio::test]
    async fn test_parse_rfc_example_with_structured_data() {
        let msg = parse(
            "<165>1 2003-10-11T22:14:15.003Z mymachine.example.com evntslog - ID47 \
             [exampleSDID@32473 iut=\"3\" eventSource=\"Application\" eventID=\"1011\"]\
             [examplePriority@32473 class=\"high\"] An application event",
        )
        .await
        .unwrap();

        assert_eq!(msg.priority, 165);
        assert_eq!(msg.proc_id, None);
        assert_eq!(msg.timestamp.nanosecond(), 3_000_000);
        assert_eq!(msg.timestamp.offset().local_minus_utc(), 0);
        assert_eq!(msg.structured_data.len(), 2);

        let first = &msg.structured_data[0];
        assert_eq!(first.id, "exampleSDID@32473");
        assert_eq!(
            first.params,
            vec![
                ("iut".to_string(), "3".to_string()),
                ("eventSource".to_string(), "Application".to_string()),
                ("eventID".to_string(), "1011".to_string()),
            ]
        );
        assert_eq!(msg.structured_data[1].param("class"), Some("high"));
        assert_eq!(msg.message.as_deref(), Some("An application event"));
    }

    #[tokio::test]
    async fn test_nil_fields() {
        let (mut parser, resolver) = parser();
        let msg = parser.parse(sender(), b"<0>1 - - - - - -").await.unwrap();

        assert_eq!(msg.priority, 0);
        assert!(msg.hostname.is_none());
        assert!(msg.app_name.is_none());
        assert!(msg.message.is_none());
        assert_eq!(resolver.calls.lock().unwrap()[0].1, None);
    }

    #[tokio::test]
    async fn test_message_is_trimmed_and_bom_stripped() {
        let msg = parse("<1>1 - h a p m -    \u{feff}hello world \r\n").await.unwrap();
        assert_eq!(msg.message.as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn test_negative_offset_and_missing_timezone() {
        let msg = parse("<1>1 1974-12-11T10:09:08.7-03:30 h a p m - x")
            .await
            .unwrap();
        assert_eq!(msg.timestamp.offset().local_minus_utc(), -(3 * 3600 + 30 * 60));
        assert_eq!(msg.timestamp.nanosecond(), 700_000_000);

        let msg = parse("<1>1 1974-12-11T10:09:08 h a p m - x").await.unwrap();
        assert_eq!(msg.timestamp.offset().local_minus_utc(), 0);
    }

    #[tokio::test]
    async fn test_empty_param_value() {
        let msg = parse("<1>1 - h a p m [id key=\"\"]").await.unwrap();
        assert_eq!(msg.structured_data[0].param("key"), Some(""));
    }

    #[tokio::test]
    async fn test_element_without_params() {
        let msg = parse("<1>1 - h a p m [id1][id2 k=\"v\"] body").await.unwrap();
        assert_eq!(msg.structured_data[0].id, "id1");
        assert!(msg.structured_data[0].params.is_empty());
        assert_eq!(msg.structured_data[1].id, "id2");
    }

    // ========================================================================
    // Priority
    // ========================================================================

    #[tokio::test]
    async fn test_priority_bounds() {
        assert_eq!(parse("<0>1 - - - - - -").await.unwrap().priority, 0);
        assert_eq!(parse("<191>1 - - - - - -").await.unwrap().priority, 191);

        let (offset, message) = parse_err("<192>1 - - - - - -").await;
        assert_eq!(offset, 0);
        assert_eq!(message, "Number 192 is out-of-range for priority");
    }

    #[tokio::test]
    async fn test_missing_pri() {
        let (offset, message) = parse_err("34>1 - - - - - -").await;
        assert_eq!(offset, 0);
        assert_eq!(message, "Expected '<'");
    }

    // ========================================================================
    // Timestamp bounds
    // ========================================================================

    fn with_timestamp(ts: &str) -> String {
        format!("<1>1 {} host app - - - msg", ts)
    }

    #[tokio::test]
    async fn test_timestamp_upper_bounds_accepted() {
        let msg = parse(&with_timestamp("2019-12-31T23:59:59Z")).await.unwrap();
        assert_eq!(msg.timestamp.month(), 12);
        assert_eq!(msg.timestamp.day(), 31);
        assert_eq!(msg.timestamp.hour(), 23);
        assert_eq!(msg.timestamp.minute(), 59);
        assert_eq!(msg.timestamp.second(), 59);
    }

    #[tokio::test]
    async fn test_timestamp_out_of_range() {
        let cases = [
            ("2019-00-18T23:40:18Z", 10, "Number 0 is out-of-range for month (MM)"),
            ("2019-13-18T23:40:18Z", 10, "Number 13 is out-of-range for month (MM)"),
            ("2019-08-00T23:40:18Z", 13, "Number 0 is out-of-range for monthday (DD)"),
            ("2019-08-32T23:40:18Z", 13, "Number 32 is out-of-range for monthday (DD)"),
            ("2019-08-18T24:40:18Z", 16, "Number 24 is out-of-range for hour (HH)"),
            ("2019-08-18T23:60:18Z", 19, "Number 60 is out-of-range for minute (MM)"),
            ("2019-08-18T23:40:60Z", 22, "Number 60 is out-of-range for seconds (SS)"),
            ("0000-08-18T23:40:18Z", 5, "Number 0 is out-of-range for year (YYYY)"),
            (
                "2019-08-18T23:40:18+24:00",
                25,
                "Number 24 is out-of-range for timezone hour (HH)",
            ),
            (
                "2019-08-18T23:40:18+02:60",
                28,
                "Number 60 is out-of-range for timezone minute (MM)",
            ),
        ];

        for (ts, expected_offset, expected_message) in cases {
            let (offset, message) = parse_err(&with_timestamp(ts)).await;
            assert_eq!(message, expected_message, "timestamp {}", ts);
            assert_eq!(offset, expected_offset, "timestamp {}", ts);
        }
    }

    #[tokio::test]
    async fn test_impossible_calendar_date() {
        let (offset, message) = parse_err(&with_timestamp("2019-02-31T00:00:00Z")).await;
        assert_eq!(offset, 5);
        assert!(message.starts_with("Invalid date"));
    }

    #[tokio::test]
    async fn test_fraction_longer_than_six_digits() {
        let (_, message) = parse_err(&with_timestamp("2019-08-18T23:40:18.1234567Z")).await;
        assert_eq!(message, "Expected ' '");
    }

    // ========================================================================
    // Header fields and structured data
    // ========================================================================

    #[tokio::test]
    async fn test_field_length_limits() {
        let app = "a".repeat(48);
        let msg = parse(&format!("<1>1 - h {} - - -", app)).await.unwrap();
        assert_eq!(msg.app_name.as_deref(), Some(app.as_str()));

        let too_long = "a".repeat(49);
        let (_, message) = parse_err(&format!("<1>1 - h {} - - -", too_long)).await;
        assert_eq!(message, "Expected ' '");

        let msg_id = "m".repeat(33);
        assert!(parse(&format!("<1>1 - h a p {} -", msg_id)).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_structured_data() {
        let (offset, message) = parse_err("<1>1 - h a p m hello").await;
        assert_eq!(offset, 15);
        assert_eq!(message, "Expected SD-Element");
    }

    #[tokio::test]
    async fn test_quote_in_sd_name() {
        let (offset, message) = parse_err("<1>1 - h a p m [i\"d]").await;
        assert_eq!(offset, 17);
        assert_eq!(message, "Illegal character '\"' in SD name");
    }

    #[tokio::test]
    async fn test_backslash_in_param_value_is_kept_verbatim() {
        let msg = parse(r#"<1>1 - h a p m [id path="C:\logs\app" tail="x\"] body"#)
            .await
            .unwrap();

        let element = &msg.structured_data[0];
        assert_eq!(element.param("path"), Some(r"C:\logs\app"));
        assert_eq!(element.param("tail"), Some(r"x\"));
        assert_eq!(msg.message.as_deref(), Some("body"));
    }

    #[tokio::test]
    async fn test_unterminated_param_value() {
        let (_, message) = parse_err("<1>1 - h a p m [id k=\"open").await;
        assert_eq!(message, "Premature end of input");
    }

    #[tokio::test]
    async fn test_unterminated_element() {
        let (_, message) = parse_err("<1>1 - h a p m [id k=\"v\"").await;
        assert_eq!(message, "Expected ']'");
    }

    #[tokio::test]
    async fn test_failure_counts() {
        let (mut parser, _) = parser();
        assert!(parser.parse(sender(), b"garbage").await.is_err());
        assert!(parser.parse(sender(), b"<1>1 - - - - - -").await.is_ok());
        assert_eq!(parser.stats(), ParserStats { parsed: 1, failed: 1 });

        parser.reset_stats();
        assert_eq!(parser.stats(), ParserStats::default());
    }
}
