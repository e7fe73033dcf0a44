//! Line grammars for sshd and fail2ban logs
//!
//! Two sshd grammars are tried in order on auth-style logs:
//!
//! ```text
//! Jun 10 12:40:05 host sshd[11019]: Invalid user admin from 61.174.51.217
//! Jun  8 04:31:10 host sshd[5013]: User root from 116.10.191.234 not allowed because ...
//! ```
//!
//! and one ban grammar on fail2ban logs (legacy and current layouts):
//!
//! ```text
//! 2014-06-10 12:40:07,363 fail2ban.actions: WARNING [ssh] Ban 61.174.51.217
//! 2024-03-02 08:15:42,118 fail2ban.actions        [812]: NOTICE  [sshd] Ban 61.174.51.217
//! ```

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const INVALID_USER_PATTERN: &str = r"^(?P<log_date>\w{3}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\s+(?P<host>\S+)\s+sshd.*?Invalid user (?P<user>.*?) from (?P<ip>\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b";

const NOT_ALLOWED_PATTERN: &str = r"^(?P<log_date>\w{3}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\s+(?P<host>\S+)\s+sshd.*?User (?P<user>.*?) from (?P<ip>\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}) not allowed";

const BAN_PATTERN: &str = r"^(?P<log_date>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:,\d+)?)\s+fail2ban\.actions\s*(?:\[\d+\])?:\s*(?:WARNING|NOTICE)\s+\[(?P<jail>[^\]]+)\]\s+Ban (?P<ip>\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b";

/// Errors for a single captured line
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("unparseable timestamp {raw:?}: {source}")]
    Timestamp {
        raw: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Which grammar family a log source uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogKind {
    /// sshd lines from auth.log
    Auth,
    /// fail2ban.log ban notices
    Ban,
}

impl LogKind {
    /// Classify a log file by its name, `None` if it is not a recognized family
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.contains("auth.log") {
            Some(LogKind::Auth)
        } else if name.contains("fail2ban.log") {
            Some(LogKind::Ban)
        } else {
            None
        }
    }
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogKind::Auth => write!(f, "auth"),
            LogKind::Ban => write!(f, "ban"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthGrammar {
    InvalidUser,
    NotAllowed,
}

/// An sshd line that matched one of the auth grammars
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMatch<'a> {
    pub grammar: AuthGrammar,
    /// Syslog timestamp without a year, e.g. "Jun  8 04:31:10"
    pub raw_timestamp: &'a str,
    pub host: &'a str,
    pub username: Option<&'a str>,
    pub ip: &'a str,
}

impl AuthMatch<'_> {
    /// Three letter month abbreviation the line was logged in
    pub fn month_abbreviation(&self) -> &str {
        self.raw_timestamp.get(..3).unwrap_or_default()
    }

    /// Rebuild the full timestamp by attaching `year`
    pub fn timestamp(&self, year: i32) -> Result<NaiveDateTime, MatchError> {
        parse_syslog_timestamp(self.raw_timestamp, year)
    }
}

/// A fail2ban ban notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanMatch<'a> {
    pub raw_timestamp: &'a str,
    pub jail: &'a str,
    pub ip: &'a str,
}

impl BanMatch<'_> {
    pub fn timestamp(&self) -> Result<NaiveDateTime, MatchError> {
        parse_ban_timestamp(self.raw_timestamp)
    }
}

/// Compiled grammars plus the optional host and jail filters
pub struct LineMatcher {
    invalid_user: Regex,
    not_allowed: Regex,
    ban: Regex,
    host_name: Option<String>,
    ban_jail: Option<String>,
}

impl LineMatcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            invalid_user: Regex::new(INVALID_USER_PATTERN)
                .context("Invalid 'invalid user' pattern")?,
            not_allowed: Regex::new(NOT_ALLOWED_PATTERN)
                .context("Invalid 'not allowed' pattern")?,
            ban: Regex::new(BAN_PATTERN).context("Invalid ban pattern")?,
            host_name: None,
            ban_jail: None,
        })
    }

    /// Only accept auth lines logged by this host
    pub fn with_host_name(mut self, host_name: Option<String>) -> Self {
        self.host_name = host_name;
        self
    }

    /// Only accept bans issued by this fail2ban jail
    pub fn with_ban_jail(mut self, ban_jail: Option<String>) -> Self {
        self.ban_jail = ban_jail;
        self
    }

    /// Match an auth.log line. "Invalid user" takes precedence over "not allowed".
    pub fn match_auth<'a>(&self, line: &'a str) -> Option<AuthMatch<'a>> {
        let (grammar, caps) = match self.invalid_user.captures(line) {
            Some(caps) => (AuthGrammar::InvalidUser, caps),
            None => (AuthGrammar::NotAllowed, self.not_allowed.captures(line)?),
        };

        let host = named(&caps, "host")?;
        if let Some(ref wanted) = self.host_name {
            if host != wanted {
                return None;
            }
        }

        Some(AuthMatch {
            grammar,
            raw_timestamp: named(&caps, "log_date")?,
            host,
            username: named(&caps, "user").filter(|u| !u.trim().is_empty()),
            ip: named(&caps, "ip")?,
        })
    }

    /// Match a fail2ban.log line
    pub fn match_ban<'a>(&self, line: &'a str) -> Option<BanMatch<'a>> {
        let caps = self.ban.captures(line)?;

        let jail = named(&caps, "jail")?;
        if let Some(ref wanted) = self.ban_jail {
            if jail != wanted {
                return None;
            }
        }

        Some(BanMatch {
            raw_timestamp: named(&caps, "log_date")?,
            jail,
            ip: named(&caps, "ip")?,
        })
    }
}

fn named<'a>(caps: &Captures<'a>, name: &str) -> Option<&'a str> {
    caps.name(name).map(|m| m.as_str())
}

/// Parse "Jun  8 04:31:10" into a timestamp in `year`
pub fn parse_syslog_timestamp(raw: &str, year: i32) -> Result<NaiveDateTime, MatchError> {
    // Syslog pads single digit days with a space
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    NaiveDateTime::parse_from_str(&format!("{} {}", year, normalized), "%Y %b %d %H:%M:%S")
        .map_err(|source| MatchError::Timestamp {
            raw: raw.to_string(),
            source,
        })
}

/// Parse "2014-06-10 12:40:07,363", dropping the sub-second part
pub fn parse_ban_timestamp(raw: &str) -> Result<NaiveDateTime, MatchError> {
    let seconds = raw.split(',').next().unwrap_or(raw);

    NaiveDateTime::parse_from_str(seconds, "%Y-%m-%d %H:%M:%S").map_err(|source| {
        MatchError::Timestamp {
            raw: raw.to_string(),
            source,
        }
    })
}
