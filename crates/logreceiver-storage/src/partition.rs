//! Partition Routing and Naming
//!
//! Every host has one range-partitioned parent table. Its children cover
//! fixed-width UTC buckets of `hours_per_partition` hours:
//!
//! ```text
//! logs_myhost_7                      (parent, PARTITION BY RANGE (log_ts))
//! ├── logs_myhost_7_2019081800_0     [00:00, 04:00)
//! ├── logs_myhost_7_2019081804_1     [04:00, 08:00)
//! └── logs_myhost_7_2019081820_5     [20:00, 24:00)
//! ```
//!
//! The parent name ends in the host ID, so two senders declaring the same
//! hostname never share a table. The child name encodes the UTC start hour
//! (`yyyyMMddHH`) and the bucket index, so the retention pruner can recover
//! each child's interval from the catalog without extra bookkeeping.
//!
//! ## Identifier Length
//!
//! PostgreSQL truncates identifiers to 63 bytes. The SQL name is shortened
//! so that the longest derived identifier (a child table, or the parent's
//! `_entry_id_idx` index) still fits:
//!
//! | Identifier | Suffix |
//! |------------|--------|
//! | child table | `_yyyyMMddHH_bb` (14) |
//! | entry ID index | `_entry_id_idx` (13) |
//! | sequence | `seq_` prefix (4) |

use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use logreceiver_core::{Host, Interval};
use regex::Regex;

use crate::error::{Result, StorageError};

const START_FORMAT: &str = "%Y%m%d%H";

/// PostgreSQL's identifier limit (`NAMEDATALEN - 1`).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Longest suffix appended to a parent table name: `_yyyyMMddHH_bb`.
const CHILD_SUFFIX_LEN: usize = 14;

pub fn parent_table_name(host: &Host) -> String {
    let id = host.id.to_string();
    // "logs_" + name + "_" + id + child suffix must fit.
    let budget = MAX_IDENTIFIER_LEN - CHILD_SUFFIX_LEN - "logs__".len() - id.len();
    let mut name = host.sql_name();
    // sql_name is ASCII, so byte truncation keeps it valid.
    name.truncate(budget);
    format!("logs_{}_{}", name, id)
}

pub fn sequence_name(host: &Host) -> String {
    format!("seq_{}", parent_table_name(host))
}

/// One physical partition of a host's log table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionSpec {
    pub host_id: i64,
    pub parent_table: String,
    pub bucket: u32,
    pub interval: Interval,
}

impl PartitionSpec {
    /// The partition that `ts` routes to for `host`.
    ///
    /// Bucket boundaries belong to the later bucket.
    pub fn for_timestamp<Tz: TimeZone>(
        host: &Host,
        ts: &DateTime<Tz>,
        hours_per_partition: u32,
    ) -> Result<Self> {
        check_bucket_width(hours_per_partition)?;

        let utc = ts.with_timezone(&Utc);
        let bucket = utc.hour() / hours_per_partition;
        let day_start = utc
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .ok_or_else(|| StorageError::InvalidPartitionName(format!("no day start for {}", utc)))?;

        let start = day_start + Duration::hours(i64::from(bucket * hours_per_partition));
        let end = start + Duration::hours(i64::from(hours_per_partition));

        Ok(Self {
            host_id: host.id,
            parent_table: parent_table_name(host),
            bucket,
            interval: Interval::new(start, end)?,
        })
    }

    pub fn table_name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.parent_table,
            self.interval.start().format(START_FORMAT),
            self.bucket
        )
    }
}

/// Interval of an existing child table, recovered from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPartition {
    pub parent_table: String,
    pub bucket: u32,
    pub interval: Interval,
}

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        // Host names may contain underscores, so anchor on the trailing fields.
        .get_or_init(|| Regex::new(r"^(logs_.+)_([0-9]{10})_([0-9]{1,2})$").ok())
        .as_ref()
}

/// Whether `table` is a child partition name of the parent table `parent`.
pub fn is_child_of(table: &str, parent: &str) -> bool {
    name_pattern()
        .and_then(|pattern| pattern.captures(table))
        .map_or(false, |captures| &captures[1] == parent)
}

/// Parses a child table name written by [`PartitionSpec::table_name`].
pub fn parse_table_name(name: &str, hours_per_partition: u32) -> Result<ParsedPartition> {
    check_bucket_width(hours_per_partition)?;
    let invalid = || StorageError::InvalidPartitionName(name.to_string());

    let captures = name_pattern()
        .and_then(|pattern| pattern.captures(name))
        .ok_or_else(invalid)?;
    let parent_table = captures[1].to_string();
    let start = NaiveDateTime::parse_from_str(&format!("{}0000", &captures[2]), "%Y%m%d%H%M%S")
        .map_err(|_| invalid())?;
    let bucket: u32 = captures[3].parse().map_err(|_| invalid())?;

    let start = Utc.from_utc_datetime(&start);
    let end = start + Duration::hours(i64::from(hours_per_partition));

    Ok(ParsedPartition {
        parent_table,
        bucket,
        interval: Interval::new(start, end)?,
    })
}

fn check_bucket_width(hours_per_partition: u32) -> Result<()> {
    if hours_per_partition == 0 || 24 % hours_per_partition != 0 {
        return Err(StorageError::InvalidConfig(format!(
            "hours_per_partition must divide 24, got {}",
            hours_per_partition
        )));
    }
    Ok(())
}
