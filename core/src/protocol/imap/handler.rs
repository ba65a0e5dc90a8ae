/*
 * handler.rs
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

//! IMAP response handler trait (callbacks for parsed server responses).

use super::{Flag, SessionError, Status};

/// Callbacks emitted by the push parser as server responses are consumed.
///
/// Literal data arrives through `literal_chunk` in whatever pieces the
/// network delivers; for a body section it is bracketed by
/// `body_section_begin` / `body_section_end`, so the receiver can redirect
/// the bytes to a file while a full message body is in flight.
pub trait ResponseHandler {
    /// Untagged OK carried a `[CAPABILITY ...]` status code; a fresh list
    /// follows. The previous capability set is invalid.
    fn status_code_capability_begin(&mut self);

    /// A bare `* CAPABILITY` data response begins. Does not invalidate the
    /// existing set; tokens are added to it.
    fn capability_data_begin(&mut self) {}

    /// One capability token.
    fn capability(&mut self, token: &str);

    /// Tagged status line concluding one command. `text` is the rest of the
    /// line after the status word.
    fn tagged_status(&mut self, tag: &str, status: Status, text: &str)
        -> Result<(), SessionError>;

    /// `* n EXISTS`
    fn data_exists(&mut self, n: u32);

    /// `* n RECENT`
    fn data_recent(&mut self, n: u32);

    /// `[UIDVALIDITY n]` status code.
    fn status_code_uidvalidity(&mut self, n: u32);

    /// `* n FETCH (`: the attribute list for message n follows.
    fn fetch_begin(&mut self, n: u32);

    /// Attribute list for the current FETCH response closed.
    fn fetch_end(&mut self) {}

    /// The current BODY section specifier is empty (`BODY[]`, the full body).
    fn section_empty(&mut self);

    /// A BODY section value begins; literal chunks follow.
    fn body_section_begin(&mut self) -> Result<(), SessionError>;

    /// One piece of literal data.
    fn literal_chunk(&mut self, data: &[u8]) -> Result<(), SessionError>;

    /// The current BODY section value is complete.
    fn body_section_end(&mut self) -> Result<(), SessionError>;

    /// One flag from a FLAGS list.
    fn flag(&mut self, flag: Flag);

    /// `UID n` fetch attribute.
    fn uid(&mut self, n: u32);
}
