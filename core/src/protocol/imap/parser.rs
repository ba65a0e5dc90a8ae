/*
 * parser.rs
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

//! IMAP response push parser: feed bytes via `receive`, the handler is
//! invoked as responses are consumed. Resumable at any byte boundary, so
//! message-body literals can be streamed to their destination without
//! buffering a whole message.
//!
//! Grammar subset for a download session: greeting / untagged status with
//! CAPABILITY and UIDVALIDITY codes, CAPABILITY data, EXISTS / RECENT,
//! FETCH with UID / FLAGS / BODY[...] attributes, tagged status. Unrequested
//! FETCH attributes are skipped.

use bytes::BytesMut;

use super::handler::ResponseHandler;
use super::{Flag, SessionError, Status};

/// Where the parser is between `receive` calls.
#[derive(Clone, Copy)]
enum ParseState {
    /// Accumulating a top-level response line.
    Line,
    /// Inside a FETCH attribute list; accumulating the next fragment.
    FetchAtts,
    /// Streaming a `{n}` literal. `section` marks a BODY section value, which
    /// is closed with `body_section_end` when the count runs out.
    Literal { remaining: usize, section: bool },
}

/// Push parser for IMAP server responses.
pub struct ResponseParser {
    buf: BytesMut,
    state: ParseState,
    depth: u32,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            state: ParseState::Line,
            depth: 0,
        }
    }

    /// Consume `data`, invoking the handler for every completed response
    /// element. Partial lines and literals are carried over to the next call.
    pub fn receive<H: ResponseHandler>(
        &mut self,
        mut data: &[u8],
        handler: &mut H,
    ) -> Result<(), SessionError> {
        while !data.is_empty() {
            if let ParseState::Literal { remaining, section } = self.state {
                let take = remaining.min(data.len());
                handler.literal_chunk(&data[..take])?;
                data = &data[take..];
                if take == remaining {
                    if section {
                        handler.body_section_end()?;
                    }
                    self.state = ParseState::FetchAtts;
                } else {
                    self.state = ParseState::Literal {
                        remaining: remaining - take,
                        section,
                    };
                }
                continue;
            }

            match data.iter().position(|&b| b == b'\n') {
                None => {
                    self.buf.extend_from_slice(data);
                    break;
                }
                Some(i) => {
                    self.buf.extend_from_slice(&data[..=i]);
                    data = &data[i + 1..];
                    let raw = self.buf.split();
                    let mut end = raw.len() - 1;
                    if end > 0 && raw[end - 1] == b'\r' {
                        end -= 1;
                    }
                    let line = String::from_utf8_lossy(&raw[..end]).into_owned();
                    match self.state {
                        ParseState::Line => self.parse_line(&line, handler)?,
                        ParseState::FetchAtts => self.parse_fetch_fragment(&line, handler)?,
                        ParseState::Literal { .. } => unreachable!(),
                    }
                }
            }
        }
        Ok(())
    }

    fn parse_line<H: ResponseHandler>(
        &mut self,
        line: &str,
        handler: &mut H,
    ) -> Result<(), SessionError> {
        if let Some(rest) = line.strip_prefix("* ") {
            self.parse_untagged(rest, handler)
        } else if line.starts_with('+') {
            // Command continuation; nothing in this session uses it.
            Ok(())
        } else if line.is_empty() {
            Ok(())
        } else {
            self.parse_tagged(line, handler)
        }
    }

    fn parse_tagged<H: ResponseHandler>(
        &mut self,
        line: &str,
        handler: &mut H,
    ) -> Result<(), SessionError> {
        let (tag, rest) = match line.split_once(' ') {
            Some(x) => x,
            None => {
                return Err(SessionError::Protocol(format!(
                    "malformed tagged response: {}",
                    line
                )))
            }
        };
        let (word, text) = match rest.split_once(' ') {
            Some((w, t)) => (w, t),
            None => (rest, ""),
        };
        let status = if word.eq_ignore_ascii_case("OK") {
            Status::Ok
        } else if word.eq_ignore_ascii_case("NO") {
            Status::No
        } else if word.eq_ignore_ascii_case("BAD") {
            Status::Bad
        } else {
            return Err(SessionError::Protocol(format!(
                "malformed tagged response: {}",
                line
            )));
        };
        handler.tagged_status(tag, status, text)
    }

    fn parse_untagged<H: ResponseHandler>(
        &mut self,
        rest: &str,
        handler: &mut H,
    ) -> Result<(), SessionError> {
        let (word, tail) = match rest.split_once(' ') {
            Some((w, t)) => (w, t),
            None => (rest, ""),
        };

        if let Ok(n) = word.parse::<u32>() {
            let (kind, after) = match tail.split_once(' ') {
                Some((k, a)) => (k, a),
                None => (tail, ""),
            };
            if kind.eq_ignore_ascii_case("EXISTS") {
                handler.data_exists(n);
            } else if kind.eq_ignore_ascii_case("RECENT") {
                handler.data_recent(n);
            } else if kind.eq_ignore_ascii_case("FETCH") {
                let atts = after.trim_start();
                let atts = atts.strip_prefix('(').ok_or_else(|| {
                    SessionError::Protocol(format!("malformed FETCH response: * {}", rest))
                })?;
                handler.fetch_begin(n);
                self.depth = 1;
                self.state = ParseState::FetchAtts;
                self.parse_fetch_fragment(atts, handler)?;
            }
            // EXPUNGE and other numeric data responses are of no interest.
            return Ok(());
        }

        if word.eq_ignore_ascii_case("CAPABILITY") {
            handler.capability_data_begin();
            for token in tail.split_ascii_whitespace() {
                handler.capability(token);
            }
        } else if word.eq_ignore_ascii_case("OK") {
            self.parse_status_code(tail, handler)?;
        }
        // NO / BAD / BYE / PREAUTH / FLAGS / LIST ... carry nothing we track.
        Ok(())
    }

    /// `[CODE args]` after an untagged OK. Only CAPABILITY and UIDVALIDITY
    /// are acted upon.
    fn parse_status_code<H: ResponseHandler>(
        &mut self,
        text: &str,
        handler: &mut H,
    ) -> Result<(), SessionError> {
        let inner = match text.strip_prefix('[').and_then(|t| t.split_once(']')) {
            Some((inner, _)) => inner,
            None => return Ok(()),
        };
        let (code, args) = match inner.split_once(' ') {
            Some((c, a)) => (c, a),
            None => (inner, ""),
        };
        if code.eq_ignore_ascii_case("CAPABILITY") {
            handler.status_code_capability_begin();
            for token in args.split_ascii_whitespace() {
                handler.capability(token);
            }
        } else if code.eq_ignore_ascii_case("UIDVALIDITY") {
            let n: u32 = args.trim().parse().map_err(|_| {
                SessionError::Protocol(format!("malformed UIDVALIDITY code: [{}]", inner))
            })?;
            handler.status_code_uidvalidity(n);
        }
        Ok(())
    }

    /// One CRLF-delimited fragment of a FETCH attribute list. A fragment may
    /// close the list, or end in `{n}` and hand over to literal streaming.
    fn parse_fetch_fragment<H: ResponseHandler>(
        &mut self,
        fragment: &str,
        handler: &mut H,
    ) -> Result<(), SessionError> {
        let mut s = fragment;
        loop {
            s = s.trim_start_matches(' ');
            if s.is_empty() {
                return Ok(());
            }
            if let Some(rest) = s.strip_prefix(')') {
                self.depth -= 1;
                s = rest;
                if self.depth == 0 {
                    handler.fetch_end();
                    self.state = ParseState::Line;
                    if !s.trim().is_empty() {
                        return Err(SessionError::Protocol(format!(
                            "trailing data after FETCH response: {}",
                            s
                        )));
                    }
                    return Ok(());
                }
                continue;
            }
            if let Some(rest) = s.strip_prefix('(') {
                self.depth += 1;
                s = rest;
                continue;
            }

            let key_len = s
                .find(|c: char| matches!(c, ' ' | '(' | ')' | '[' | ']' | '{'))
                .unwrap_or(s.len());
            let (keyword, rest) = s.split_at(key_len);
            s = rest;

            if keyword.eq_ignore_ascii_case("UID") {
                let (n, rest) = take_number(s.trim_start_matches(' '))?;
                handler.uid(n);
                s = rest;
            } else if keyword.eq_ignore_ascii_case("FLAGS") {
                s = self.parse_flags(s.trim_start_matches(' '), handler)?;
            } else if (keyword.eq_ignore_ascii_case("BODY")
                || keyword.eq_ignore_ascii_case("BODY.PEEK"))
                && s.starts_with('[')
            {
                match self.parse_body_section(s, handler)? {
                    Some(rest) => s = rest,
                    // Handed over to literal streaming.
                    None => return Ok(()),
                }
            } else {
                match self.skip_value(s.trim_start_matches(' '))? {
                    Some(rest) => s = rest,
                    None => return Ok(()),
                }
            }
        }
    }

    fn parse_flags<'a, H: ResponseHandler>(
        &mut self,
        s: &'a str,
        handler: &mut H,
    ) -> Result<&'a str, SessionError> {
        let inner = s.strip_prefix('(').ok_or_else(|| {
            SessionError::Protocol(format!("malformed FLAGS attribute: {}", s))
        })?;
        let (list, rest) = inner.split_once(')').ok_or_else(|| {
            SessionError::Protocol(format!("malformed FLAGS attribute: {}", s))
        })?;
        for token in list.split_ascii_whitespace() {
            if let Some(flag) = Flag::parse(token) {
                handler.flag(flag);
            }
        }
        Ok(rest)
    }

    /// `[section]<partial> value`. Returns the remaining fragment, or None
    /// when the value is a literal and streaming has taken over.
    fn parse_body_section<'a, H: ResponseHandler>(
        &mut self,
        s: &'a str,
        handler: &mut H,
    ) -> Result<Option<&'a str>, SessionError> {
        let inner = s.strip_prefix('[').ok_or_else(|| {
            SessionError::Protocol(format!("malformed BODY attribute: {}", s))
        })?;
        let (section, mut rest) = inner.split_once(']').ok_or_else(|| {
            SessionError::Protocol(format!("malformed BODY attribute: {}", s))
        })?;
        if section.trim().is_empty() {
            handler.section_empty();
        }
        if let Some(after) = rest.strip_prefix('<') {
            rest = after.split_once('>').map(|(_, r)| r).ok_or_else(|| {
                SessionError::Protocol(format!("malformed BODY partial: {}", rest))
            })?;
        }
        let value = rest.trim_start_matches(' ');

        if let Some(count) = value.strip_prefix('{') {
            let (n, after) = count.split_once('}').ok_or_else(|| {
                SessionError::Protocol(format!("malformed literal marker: {}", value))
            })?;
            let n: usize = n.trim().parse().map_err(|_| {
                SessionError::Protocol(format!("malformed literal size: {{{}}}", n))
            })?;
            if !after.is_empty() {
                return Err(SessionError::Protocol(format!(
                    "data after literal marker: {}",
                    after
                )));
            }
            handler.body_section_begin()?;
            if n == 0 {
                handler.body_section_end()?;
                self.state = ParseState::FetchAtts;
            } else {
                self.state = ParseState::Literal {
                    remaining: n,
                    section: true,
                };
            }
            Ok(None)
        } else if let Some(q) = value.strip_prefix('"') {
            let (content, rest) = take_quoted(q)?;
            handler.body_section_begin()?;
            handler.literal_chunk(content.as_bytes())?;
            handler.body_section_end()?;
            Ok(Some(rest))
        } else if value.len() >= 3 && value[..3].eq_ignore_ascii_case("NIL") {
            Ok(Some(&value[3..]))
        } else {
            Err(SessionError::Protocol(format!(
                "malformed BODY value: {}",
                value
            )))
        }
    }

    /// Skip the value of an attribute this session did not ask for: number,
    /// atom, quoted string, parenthesized group, or literal. Returns None
    /// when a literal took over the input.
    fn skip_value<'a>(&mut self, s: &'a str) -> Result<Option<&'a str>, SessionError> {
        if let Some(q) = s.strip_prefix('"') {
            let (_, rest) = take_quoted(q)?;
            return Ok(Some(rest));
        }
        if s.starts_with('(') {
            let mut nest = 0usize;
            for (i, c) in s.char_indices() {
                match c {
                    '(' => nest += 1,
                    ')' => {
                        nest -= 1;
                        if nest == 0 {
                            return Ok(Some(&s[i + 1..]));
                        }
                    }
                    _ => {}
                }
            }
            return Err(SessionError::Protocol(format!(
                "unbalanced parenthesized value: {}",
                s
            )));
        }
        if let Some(count) = s.strip_prefix('{') {
            let (n, after) = count.split_once('}').ok_or_else(|| {
                SessionError::Protocol(format!("malformed literal marker: {}", s))
            })?;
            let n: usize = n.trim().parse().map_err(|_| {
                SessionError::Protocol(format!("malformed literal size: {{{}}}", n))
            })?;
            if !after.is_empty() {
                return Err(SessionError::Protocol(format!(
                    "data after literal marker: {}",
                    after
                )));
            }
            self.state = ParseState::Literal {
                remaining: n,
                section: false,
            };
            return Ok(None);
        }
        let end = s
            .find(|c: char| matches!(c, ' ' | ')'))
            .unwrap_or(s.len());
        Ok(Some(&s[end..]))
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

fn take_number(s: &str) -> Result<(u32, &str), SessionError> {
    let end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let n = s[..end]
        .parse()
        .map_err(|_| SessionError::Protocol(format!("expected number: {}", s)))?;
    Ok((n, &s[end..]))
}

/// Consume a quoted string (opening quote already stripped); returns the
/// unescaped content and the rest after the closing quote.
fn take_quoted(s: &str) -> Result<(String, &str), SessionError> {
    let mut out = String::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => {
                out.push(bytes[i + 1] as char);
                i += 2;
            }
            b'"' => return Ok((out, &s[i + 1..])),
            c => {
                out.push(c as char);
                i += 1;
            }
        }
    }
    Err(SessionError::Protocol(format!(
        "unterminated quoted string: \"{}",
        s
    )))
}
