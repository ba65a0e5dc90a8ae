/*
 * filename.rs
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

//! Maildir filename parse/generate.
//! Format: <timestamp>.<unique>,S=<size>:2,<flags>  e.g. 1733356800000.12345.1,S=4523:2,SF
//!
//! Flags are kept as the literal suffix string, in the order they were given;
//! delivery writes them in the order the fetch produced them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static MAILDIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_unique_part() -> String {
    let pid = std::process::id();
    let c = MAILDIR_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{}.{}", pid, c)
}

/// Parsed maildir filename (timestamp, unique part, size, flag suffix).
#[derive(Debug, Clone)]
pub struct MaildirFilename {
    pub timestamp: u64,
    pub unique_part: String,
    pub size: Option<u64>,
    pub flags: String,
}

impl MaildirFilename {
    /// Parse a maildir filename from cur/ or new/.
    pub fn parse(filename: &str) -> Option<Self> {
        let (base, flags) = if let Some(i) = filename.find(":2,") {
            (&filename[..i], filename[i + 3..].to_string())
        } else {
            (filename, String::new())
        };

        let (base_no_size, size) = if let Some(i) = base.find(",S=") {
            let s = base[i + 3..].parse().ok()?;
            (&base[..i], Some(s))
        } else {
            (base, None)
        };

        let dot = base_no_size.find('.')?;
        let timestamp: u64 = base_no_size[..dot].parse().ok()?;
        let unique_part = base_no_size[dot + 1..].to_string();

        Some(Self {
            timestamp,
            unique_part,
            size,
            flags,
        })
    }

    /// Base filename without the `:2,` info suffix.
    pub fn base(&self) -> String {
        let mut s = format!("{}.{}", self.timestamp, self.unique_part);
        if let Some(sz) = self.size {
            s.push_str(&format!(",S={}", sz));
        }
        s
    }

    /// Filename for cur/ including `:2,<flags>`.
    pub fn with_info(&self) -> String {
        format!("{}:2,{}", self.base(), self.flags)
    }

    /// Generate a fresh filename for delivery. Size is attached when the
    /// message is complete, flags when it is moved to cur/.
    pub fn generate() -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp: ts,
            unique_part: next_unique_part(),
            size: None,
            flags: String::new(),
        }
    }
}
