//! Pattern Formatter
//!
//! Renders a message as text so predicates can match on it. A pattern mixes
//! literal text with `%` field references:
//!
//! | Token | Renders |
//! |-------|---------|
//! | `%Y` `%m` `%d` | year (4 digits), month, day (2 digits) |
//! | `%H` `%M` `%s` | hour, minute, second (2 digits) |
//! | `%S` | second fraction, trailing zeros removed (`0` if none) |
//! | `%Z` | UTC offset as `±HHMM` |
//! | `%t` | message text |
//! | `%p` | priority (3 digits) |
//! | `%h` | HOSTNAME field |
//! | `%P` | structured data as `id{k=v,...}`, elements separated by a space |
//! | `%a` `%c` `%I` | app name, proc id, msg id |
//! | `%i` | sender IP address |
//! | `%D` | the host's declared name, or its IP address |
//! | `%%` | a literal `%` |
//!
//! Absent fields render as the empty string.
//!
//! ```ignore
//! let formatter = PatternFormatter::compile("%H:%M:%s [%a] %t")?;
//! assert_eq!(formatter.format(&message), "23:40:18 [app] test message");
//! ```

use std::fmt::Write as _;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Datelike, Timelike};
use logreceiver_core::SyslogMessage;
use lru::LruCache;

use crate::error::{FilterError, Result};

/// Default rendering: `2019-08-18 23:40:18.000123+0200 myhost app test message`.
pub const DEFAULT_PATTERN: &str = "%Y-%m-%d %H:%M:%s.%S%Z %h %a %t";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Fraction,
    Zone,
    Message,
    Priority,
    Hostname,
    Params,
    AppName,
    Address,
    ProcId,
    MsgId,
    DisplayName,
}

impl Token {
    fn field(code: char) -> Option<Self> {
        Some(match code {
            'Y' => Token::Year,
            'm' => Token::Month,
            'd' => Token::Day,
            'H' => Token::Hour,
            'M' => Token::Minute,
            's' => Token::Second,
            'S' => Token::Fraction,
            'Z' => Token::Zone,
            't' => Token::Message,
            'p' => Token::Priority,
            'h' => Token::Hostname,
            'P' => Token::Params,
            'a' => Token::AppName,
            'i' => Token::Address,
            'c' => Token::ProcId,
            'I' => Token::MsgId,
            'D' => Token::DisplayName,
            _ => return None,
        })
    }
}

/// A compiled formatting pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternFormatter {
    pattern: String,
    tokens: Vec<Token>,
}

impl PatternFormatter {
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.trim().is_empty() {
            return Err(FilterError::pattern(pattern, "pattern must not be blank"));
        }

        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.char_indices();

        while let Some((offset, c)) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            match chars.next() {
                None => {
                    return Err(FilterError::pattern(
                        pattern,
                        format!("dangling '%' at offset {}", offset),
                    ))
                }
                Some((_, '%')) => literal.push('%'),
                Some((_, code)) => {
                    let field = Token::field(code).ok_or_else(|| {
                        FilterError::pattern(
                            pattern,
                            format!("unknown field '%{}' at offset {}", code, offset),
                        )
                    })?;
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(field);
                }
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        if tokens.iter().all(|t| matches!(t, Token::Literal(_))) {
            return Err(FilterError::pattern(
                pattern,
                "pattern does not reference any field",
            ));
        }

        Ok(Self {
            pattern: pattern.to_string(),
            tokens,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn format(&self, message: &SyslogMessage) -> String {
        let mut out = String::with_capacity(128);
        self.format_into(message, &mut out);
        out
    }

    /// Appends the rendering of `message` to `out`.
    pub fn format_into(&self, message: &SyslogMessage, out: &mut String) {
        let ts = &message.timestamp;
        for token in &self.tokens {
            // Writing to a String cannot fail.
            let _ = match token {
                Token::Literal(text) => {
                    out.push_str(text);
                    Ok(())
                }
                Token::Year => write!(out, "{:04}", ts.year()),
                Token::Month => write!(out, "{:02}", ts.month()),
                Token::Day => write!(out, "{:02}", ts.day()),
                Token::Hour => write!(out, "{:02}", ts.hour()),
                Token::Minute => write!(out, "{:02}", ts.minute()),
                Token::Second => write!(out, "{:02}", ts.second()),
                Token::Fraction => {
                    let digits = format!("{:09}", ts.nanosecond() % 1_000_000_000);
                    let trimmed = digits.trim_end_matches('0');
                    out.push_str(if trimmed.is_empty() { "0" } else { trimmed });
                    Ok(())
                }
                Token::Zone => {
                    let seconds = ts.offset().local_minus_utc();
                    let sign = if seconds < 0 { '-' } else { '+' };
                    let minutes = seconds.abs() / 60;
                    write!(out, "{}{:02}{:02}", sign, minutes / 60, minutes % 60)
                }
                Token::Message => push_opt(out, &message.message),
                Token::Priority => write!(out, "{:03}", message.priority),
                Token::Hostname => push_opt(out, &message.hostname),
                Token::Params => {
                    for (i, element) in message.structured_data.iter().enumerate() {
                        if i > 0 {
                            out.push(' ');
                        }
                        out.push_str(&element.id);
                        out.push('{');
                        for (j, (key, value)) in element.params.iter().enumerate() {
                            if j > 0 {
                                out.push(',');
                            }
                            out.push_str(key);
                            out.push('=');
                            out.push_str(value);
                        }
                        out.push('}');
                    }
                    Ok(())
                }
                Token::AppName => push_opt(out, &message.app_name),
                Token::Address => write!(out, "{}", message.host.address),
                Token::ProcId => push_opt(out, &message.proc_id),
                Token::MsgId => push_opt(out, &message.msg_id),
                Token::DisplayName => {
                    out.push_str(&message.host.display_name());
                    Ok(())
                }
            };
        }
    }
}

impl Default for PatternFormatter {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.to_string(),
            tokens: vec![
                Token::Year,
                Token::Literal("-".to_string()),
                Token::Month,
                Token::Literal("-".to_string()),
                Token::Day,
                Token::Literal(" ".to_string()),
                Token::Hour,
                Token::Literal(":".to_string()),
                Token::Minute,
                Token::Literal(":".to_string()),
                Token::Second,
                Token::Literal(".".to_string()),
                Token::Fraction,
                Token::Zone,
                Token::Literal(" ".to_string()),
                Token::Hostname,
                Token::Literal(" ".to_string()),
                Token::AppName,
                Token::Literal(" ".to_string()),
                Token::Message,
            ],
        }
    }
}

fn push_opt(out: &mut String, value: &Option<String>) -> std::fmt::Result {
    if let Some(value) = value {
        out.push_str(value);
    }
    Ok(())
}

/// LRU cache of compiled formatters keyed by pattern.
pub struct FormatterCache {
    cache: Mutex<LruCache<String, Arc<PatternFormatter>>>,
}

impl FormatterCache {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the compiled formatter for `pattern`, compiling it on a miss.
    pub fn get(&self, pattern: &str) -> Result<Arc<PatternFormatter>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(formatter) = cache.get(pattern) {
            return Ok(Arc::clone(formatter));
        }

        let formatter = Arc::new(PatternFormatter::compile(pattern)?);
        cache.put(pattern.to_string(), Arc::clone(&formatter));
        Ok(formatter)
    }

    pub fn len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FormatterCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
