/*
 * config.rs
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

//! Account configuration: an XML file holding one or more named accounts.
//! All XML reading uses the quick_xml event reader; no regex or hand parsing.
//!
//! ```xml
//! <accounts>
//!   <account name="work">
//!     <host>imap.example.org</host>
//!     <username>joe</username>
//!     <password>secret</password>
//!     <maildir>/home/joe/Mail/work</maildir>
//!     <fingerprint>A9993E364706816ABA3E25717850C26C9CD0D89D</fingerprint>
//!   </account>
//! </accounts>
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

/// Configuration errors (file access, XML syntax, field values).
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// One IMAP account.
#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mailbox: String,
    pub maildir: String,
    /// OpenSSL-style cipher preference string; logged at handshake.
    pub cipher: String,
    /// Pinned SHA-1 fingerprint of the server's leaf certificate, hex.
    /// Empty disables pinning.
    pub fingerprint: String,
    pub use_ssl: bool,
    pub greeting_wait_ms: u64,
    pub delete_after_fetch: bool,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: 993,
            username: String::new(),
            password: String::new(),
            mailbox: "INBOX".to_string(),
            maildir: String::new(),
            cipher: String::new(),
            fingerprint: String::new(),
            use_ssl: true,
            greeting_wait_ms: 1000,
            delete_after_fetch: false,
        }
    }
}

/// Load all accounts from an XML file.
pub fn load_accounts(path: impl AsRef<Path>) -> Result<Vec<Account>, ConfigError> {
    let text = fs::read_to_string(path.as_ref()).map_err(|e| {
        ConfigError::new(format!("cannot read {}: {}", path.as_ref().display(), e))
    })?;
    parse_accounts(&text)
}

/// Parse accounts from XML text.
pub fn parse_accounts(xml: &str) -> Result<Vec<Account>, ConfigError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut accounts = Vec::new();
    let mut current: Option<Account> = None;
    let mut field: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "account" {
                    let mut acct = Account::default();
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"name" {
                            acct.name = String::from_utf8_lossy(&attr.value).into_owned();
                        }
                    }
                    current = Some(acct);
                } else if current.is_some() {
                    field = Some(name);
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(acct), Some(f)) = (current.as_mut(), field.as_deref()) {
                    let value = t
                        .unescape()
                        .map_err(|e| ConfigError::new(format!("config parse error: {}", e)))?;
                    apply_field(acct, f, value.trim())?;
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"account" {
                    if let Some(acct) = current.take() {
                        accounts.push(acct);
                    }
                } else {
                    field = None;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ConfigError::new(format!("config parse error: {}", e))),
        }
        buf.clear();
    }

    Ok(accounts)
}

/// Find an account by name.
pub fn find_account(accounts: Vec<Account>, name: &str) -> Option<Account> {
    accounts.into_iter().find(|a| a.name == name)
}

fn apply_field(acct: &mut Account, field: &str, value: &str) -> Result<(), ConfigError> {
    match field {
        "host" => acct.host = value.to_string(),
        "port" => {
            acct.port = value
                .parse()
                .map_err(|_| ConfigError::new(format!("invalid port: {}", value)))?
        }
        "username" => acct.username = value.to_string(),
        "password" => acct.password = value.to_string(),
        "mailbox" => acct.mailbox = value.to_string(),
        "maildir" => acct.maildir = value.to_string(),
        "cipher" => acct.cipher = value.to_string(),
        "fingerprint" => acct.fingerprint = value.to_string(),
        "ssl" => acct.use_ssl = parse_bool(value)?,
        "greeting-wait-ms" => {
            acct.greeting_wait_ms = value
                .parse()
                .map_err(|_| ConfigError::new(format!("invalid greeting-wait-ms: {}", value)))?
        }
        "delete-after-fetch" => acct.delete_after_fetch = parse_bool(value)?,
        other => {
            return Err(ConfigError::new(format!(
                "unknown account field: {}",
                other
            )))
        }
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool, ConfigError> {
    if value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("true")
        || value == "1"
    {
        Ok(true)
    } else if value.eq_ignore_ascii_case("no")
        || value.eq_ignore_ascii_case("false")
        || value == "0"
    {
        Ok(false)
    } else {
        Err(ConfigError::new(format!("invalid boolean: {}", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<accounts>
  <account name="work">
    <host>imap.example.org</host>
    <port>1993</port>
    <username>joe</username>
    <password>s&amp;cret</password>
    <mailbox>Lists/rust</mailbox>
    <maildir>/home/joe/Mail/work</maildir>
    <fingerprint>a9993e364706816aba3e25717850c26c9cd0d89d</fingerprint>
    <ssl>yes</ssl>
    <greeting-wait-ms>400</greeting-wait-ms>
    <delete-after-fetch>yes</delete-after-fetch>
  </account>
  <account name="home">
    <host>mail.home.invalid</host>
    <username>joe</username>
    <password>pw</password>
    <maildir>/home/joe/Mail/home</maildir>
  </account>
</accounts>
"#;

    #[test]
    fn parses_all_fields() {
        let accounts = parse_accounts(SAMPLE).unwrap();
        assert_eq!(accounts.len(), 2);
        let a = &accounts[0];
        assert_eq!(a.name, "work");
        assert_eq!(a.host, "imap.example.org");
        assert_eq!(a.port, 1993);
        assert_eq!(a.password, "s&cret");
        assert_eq!(a.mailbox, "Lists/rust");
        assert_eq!(a.fingerprint, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert!(a.use_ssl);
        assert_eq!(a.greeting_wait_ms, 400);
        assert!(a.delete_after_fetch);
    }

    #[test]
    fn defaults_apply_when_fields_absent() {
        let accounts = parse_accounts(SAMPLE).unwrap();
        let a = &accounts[1];
        assert_eq!(a.port, 993);
        assert_eq!(a.mailbox, "INBOX");
        assert!(a.use_ssl);
        assert_eq!(a.greeting_wait_ms, 1000);
        assert!(!a.delete_after_fetch);
        assert!(a.fingerprint.is_empty());
    }

    #[test]
    fn find_by_name() {
        let accounts = parse_accounts(SAMPLE).unwrap();
        assert!(find_account(accounts.clone(), "home").is_some());
        assert!(find_account(accounts, "none").is_none());
    }

    #[test]
    fn invalid_port_is_an_error() {
        let xml = "<accounts><account name=\"x\"><port>here</port></account></accounts>";
        assert!(parse_accounts(xml).is_err());
    }

    #[test]
    fn invalid_boolean_is_an_error() {
        let xml = "<accounts><account name=\"x\"><ssl>maybe</ssl></account></accounts>";
        assert!(parse_accounts(xml).is_err());
    }

    #[test]
    fn unknown_field_is_an_error() {
        let xml = "<accounts><account name=\"x\"><hostt>h</hostt></account></accounts>";
        assert!(parse_accounts(xml).is_err());
    }
}
