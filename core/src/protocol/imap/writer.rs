/*
 * writer.rs
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

//! IMAP command writer: serializes one client command per call, assigning a
//! fresh tag (A0001, A0002, ...).

use super::{Flag, SequenceSet};

/// One serialized command: the assigned tag and the full wire line
/// (CRLF-terminated).
#[derive(Debug, Clone)]
pub struct Command {
    pub tag: String,
    pub line: Vec<u8>,
}

/// FETCH attribute.
#[derive(Debug, Clone)]
pub enum FetchAtt {
    Uid,
    Flags,
    /// BODY.PEEK: like BODY but does not set `\Seen` on the server.
    BodyPeek(Section),
}

/// BODY section specifier.
#[derive(Debug, Clone)]
pub enum Section {
    /// The entire message (`[]`).
    Full,
    /// `[HEADER.FIELDS (...)]`
    HeaderFields(Vec<String>),
}

/// STORE data item mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Add,
    Remove,
    Replace,
}

/// Command serializer. One instance per session; tags are unique within it.
pub struct CommandWriter {
    next_tag: u32,
}

impl CommandWriter {
    pub fn new() -> Self {
        Self { next_tag: 0 }
    }

    fn command(&mut self, body: &str) -> Command {
        self.next_tag += 1;
        let tag = format!("A{:04}", self.next_tag);
        let line = format!("{} {}\r\n", tag, body).into_bytes();
        Command { tag, line }
    }

    pub fn capability(&mut self) -> Command {
        self.command("CAPABILITY")
    }

    pub fn login(&mut self, username: &str, password: &str) -> Command {
        self.command(&format!(
            "LOGIN {} {}",
            quote_string(username),
            quote_string(password)
        ))
    }

    pub fn select(&mut self, mailbox: &str) -> Command {
        self.command(&format!("SELECT {}", quote_string(mailbox)))
    }

    /// FETCH over a raw sequence-set expression (e.g. `1:*`).
    pub fn fetch(&mut self, set: &str, atts: &[FetchAtt]) -> Command {
        let rendered: Vec<String> = atts.iter().map(render_att).collect();
        self.command(&format!("FETCH {} ({})", set, rendered.join(" ")))
    }

    pub fn uid_store(
        &mut self,
        set: &SequenceSet,
        flags: &[Flag],
        mode: StoreMode,
        silent: bool,
    ) -> Command {
        let item = match mode {
            StoreMode::Add => "+FLAGS",
            StoreMode::Remove => "-FLAGS",
            StoreMode::Replace => "FLAGS",
        };
        let silent = if silent { ".SILENT" } else { "" };
        let rendered: Vec<&str> = flags.iter().map(|f| f.wire()).collect();
        self.command(&format!(
            "UID STORE {} {}{} ({})",
            set,
            item,
            silent,
            rendered.join(" ")
        ))
    }

    pub fn uid_expunge(&mut self, set: &SequenceSet) -> Command {
        self.command(&format!("UID EXPUNGE {}", set))
    }

    pub fn expunge(&mut self) -> Command {
        self.command("EXPUNGE")
    }

    pub fn logout(&mut self) -> Command {
        self.command("LOGOUT")
    }
}

impl Default for CommandWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn render_att(att: &FetchAtt) -> String {
    match att {
        FetchAtt::Uid => "UID".to_string(),
        FetchAtt::Flags => "FLAGS".to_string(),
        FetchAtt::BodyPeek(Section::Full) => "BODY.PEEK[]".to_string(),
        FetchAtt::BodyPeek(Section::HeaderFields(fields)) => {
            format!("BODY.PEEK[HEADER.FIELDS ({})]", fields.join(" "))
        }
    }
}

fn quote_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
