//! Message predicates.
//!
//! A [`MessageFilter`] renders each message with a [`PatternFormatter`] and
//! tests the rendering. Regular expressions must match the *whole*
//! rendering, so `ERROR` only matches a line that is exactly `ERROR` while
//! `.*ERROR.*` matches any line containing it.

use std::fmt;
use std::sync::Arc;

use logreceiver_core::SyslogMessage;
use regex::{Regex, RegexBuilder};

use crate::error::Result;
use crate::format::PatternFormatter;

#[derive(Clone)]
enum Matcher {
    All,
    Regex(Regex),
    /// Lower-cased needle
    Substring(String),
}

#[derive(Clone)]
pub struct MessageFilter {
    formatter: Arc<PatternFormatter>,
    matcher: Matcher,
}

impl MessageFilter {
    /// Matches every message.
    pub fn all(formatter: Arc<PatternFormatter>) -> Self {
        Self {
            formatter,
            matcher: Matcher::All,
        }
    }

    /// Matches messages whose rendering matches `pattern` in full.
    pub fn regex(formatter: Arc<PatternFormatter>, pattern: &str) -> Result<Self> {
        let anchored = RegexBuilder::new(&format!("^(?:{})$", pattern))
            .dot_matches_new_line(true)
            .build()?;
        Ok(Self {
            formatter,
            matcher: Matcher::Regex(anchored),
        })
    }

    /// Matches messages whose rendering contains `needle`, ignoring case.
    pub fn substring(formatter: Arc<PatternFormatter>, needle: &str) -> Self {
        Self {
            formatter,
            matcher: Matcher::Substring(needle.to_lowercase()),
        }
    }

    pub fn formatter(&self) -> &PatternFormatter {
        &self.formatter
    }

    pub fn matches(&self, message: &SyslogMessage) -> bool {
        match &self.matcher {
            Matcher::All => true,
            Matcher::Regex(regex) => regex.is_match(&self.formatter.format(message)),
            Matcher::Substring(needle) => self
                .formatter
                .format(message)
                .to_lowercase()
                .contains(needle.as_str()),
        }
    }
}

impl fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let matcher = match &self.matcher {
            Matcher::All => "*".to_string(),
            Matcher::Regex(regex) => regex.as_str().to_string(),
            Matcher::Substring(needle) => format!("contains {:?}", needle),
        };
        f.debug_struct("MessageFilter")
            .field("pattern", &self.formatter.pattern())
            .field("matcher", &matcher)
            .finish()
    }
}
