/*
 * mod.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Postino, an IMAP maildir retrieval agent.
 *
 * Postino is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Postino is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Postino.  If not, see <http://www.gnu.org/licenses/>.
 */

//! IMAP4rev1 download client: shared protocol types, push parser, command
//! writer, and the session that drives one mailbox download into a maildir.

mod handler;
mod parser;
mod session;
mod writer;

pub use handler::ResponseHandler;
pub use parser::ResponseParser;
pub use session::{ImapStream, Session, SessionConfig, SessionReport};
pub use writer::{Command, CommandWriter, FetchAtt, Section, StoreMode};

use std::collections::BTreeMap;
use std::fmt;
use std::io;

/// Capability token the server advertises when LOGIN is refused.
pub const CAP_LOGINDISABLED: &str = "LOGINDISABLED";
/// Capability token for RFC 4315 (UID EXPUNGE).
pub const CAP_UIDPLUS: &str = "UIDPLUS";

/// Tagged status result of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
        })
    }
}

/// IMAP system flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Answered,
    Seen,
    Flagged,
    Draft,
    Deleted,
    Recent,
}

impl Flag {
    /// Parse a flag token as it appears in a FLAGS list.
    pub fn parse(token: &str) -> Option<Flag> {
        if token.eq_ignore_ascii_case("\\Answered") {
            Some(Flag::Answered)
        } else if token.eq_ignore_ascii_case("\\Seen") {
            Some(Flag::Seen)
        } else if token.eq_ignore_ascii_case("\\Flagged") {
            Some(Flag::Flagged)
        } else if token.eq_ignore_ascii_case("\\Draft") {
            Some(Flag::Draft)
        } else if token.eq_ignore_ascii_case("\\Deleted") {
            Some(Flag::Deleted)
        } else if token.eq_ignore_ascii_case("\\Recent") {
            Some(Flag::Recent)
        } else {
            None
        }
    }

    /// Maildir info letter for this flag. `\Recent` and `\Deleted` have no
    /// counterpart in delivery and yield None.
    pub fn maildir_letter(self) -> Option<char> {
        match self {
            Flag::Answered => Some('R'),
            Flag::Seen => Some('S'),
            Flag::Flagged => Some('F'),
            Flag::Draft => Some('D'),
            Flag::Deleted | Flag::Recent => None,
        }
    }

    /// Wire form (`\Deleted` etc.), for STORE commands.
    pub fn wire(self) -> &'static str {
        match self {
            Flag::Answered => "\\Answered",
            Flag::Seen => "\\Seen",
            Flag::Flagged => "\\Flagged",
            Flag::Draft => "\\Draft",
            Flag::Deleted => "\\Deleted",
            Flag::Recent => "\\Recent",
        }
    }
}

/// Session progression. Transitions are strictly linear via [`SessionState::next`];
/// the only jumps are SelectedMailbox -> Fetching (fetch dispatch) and
/// any-state -> LoggingOut (quit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Disconnected,
    Established,
    GotInitialCapabilities,
    LoggedIn,
    GotCapabilities,
    SelectedMailbox,
    Fetching,
    Fetched,
    Stored,
    Expunged,
    LoggingOut,
    LoggedOut,
    End,
}

impl SessionState {
    /// Successor in the linear progression. End is terminal.
    pub fn next(self) -> SessionState {
        use SessionState::*;
        match self {
            Disconnected => Established,
            Established => GotInitialCapabilities,
            GotInitialCapabilities => LoggedIn,
            LoggedIn => GotCapabilities,
            GotCapabilities => SelectedMailbox,
            SelectedMailbox => Fetching,
            Fetching => Fetched,
            Fetched => Stored,
            Stored => Expunged,
            Expunged => LoggingOut,
            LoggingOut => LoggedOut,
            LoggedOut => End,
            End => End,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SessionState::*;
        f.write_str(match self {
            Disconnected => "DISCONNECTED",
            Established => "ESTABLISHED",
            GotInitialCapabilities => "GOT_INITIAL_CAPABILITIES",
            LoggedIn => "LOGGED_IN",
            GotCapabilities => "GOT_CAPABILITIES",
            SelectedMailbox => "SELECTED_MAILBOX",
            Fetching => "FETCHING",
            Fetched => "FETCHED",
            Stored => "STORED",
            Expunged => "EXPUNGED",
            LoggingOut => "LOGGING_OUT",
            LoggedOut => "LOGGED_OUT",
            End => "END",
        })
    }
}

/// Set of message UIDs kept as minimal sorted inclusive ranges, so it can be
/// rendered in compact IMAP sequence-set form (`3,5,9:12`).
///
/// `Display` of an empty set is the empty string, which is not valid on the
/// wire; callers guard on `is_empty`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceSet {
    parts: BTreeMap<u32, u32>,
}

impl SequenceSet {
    pub fn new() -> Self {
        SequenceSet { parts: BTreeMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Number of UIDs in the set.
    pub fn len(&self) -> usize {
        self.parts.iter().map(|(s, e)| (e - s + 1) as usize).sum()
    }

    /// Insert one UID, fusing with an adjacent or containing range.
    pub fn push(&mut self, uid: u32) {
        if let Some((&start, &end)) = self.parts.range(..=uid).next_back() {
            if uid <= end {
                return;
            }
            if end != u32::MAX && uid == end + 1 {
                let mut new_end = uid;
                if let Some((&nstart, &nend)) = self.parts.range(uid + 1..).next() {
                    if nstart == uid + 1 {
                        self.parts.remove(&nstart);
                        new_end = nend;
                    }
                }
                self.parts.insert(start, new_end);
                return;
            }
        }
        if uid != u32::MAX {
            if let Some((&nstart, &nend)) = self.parts.range(uid + 1..).next() {
                if nstart == uid + 1 {
                    self.parts.remove(&nstart);
                    self.parts.insert(uid, nend);
                    return;
                }
            }
        }
        self.parts.insert(uid, uid);
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.parts
            .range(..=uid)
            .next_back()
            .map_or(false, |(_, &end)| end >= uid)
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }
}

impl fmt::Display for SequenceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (&start, &end) in &self.parts {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}:{}", start, end)?;
            }
        }
        Ok(())
    }
}

/// Session-fatal errors: transport (DNS, connect, read, write, shutdown),
/// TLS (handshake, verify, close), protocol (tagged NO/BAD, unknown tag,
/// LOGINDISABLED, malformed response), and second-signal escalation.
#[derive(Debug)]
pub enum SessionError {
    Transport(io::Error),
    Tls(String),
    Protocol(String),
    Signal(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Transport(e) => write!(f, "transport error: {}", e),
            SessionError::Tls(m) => write!(f, "TLS error: {}", m),
            SessionError::Protocol(m) => write!(f, "protocol error: {}", m),
            SessionError::Signal(m) => write!(f, "{}", m),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Transport(e)
    }
}
