//! RFC 5424 Syslog Parsing
//!
//! A hand-rolled, single-pass scanner for the RFC 5424 wire format. There is
//! no backtracking: every token is read once, and the first violation aborts
//! the message with a [`ParseError`] carrying the byte offset at which the
//! offending token starts.
//!
//! ```text
//! <34>1 2019-08-18T23:40:18.000123+02:00 myhost app 123 msg1 [id k="v"] text
//! └PRI┘│ └──────────── TIMESTAMP ───────┘ └HOST┘ └APP┘ └PID┘ └MID┘ └─SD──┘ └MSG
//!      VERSION
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let mut parser = SyslogParser::new(registry.clone());
//! let message = parser.parse(sender_ip, &datagram).await?;
//! ```
//!
//! A [`SyslogParser`] keeps per-worker state between calls and must not be
//! shared between concurrent readers; give each ingestion worker its own.

pub mod error;
pub mod parser;
mod scanner;

pub use error::{ParseError, Result};
pub use parser::{ParserStats, SyslogParser};
