/*
 * session.rs
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

//! The download session: drives one linear IMAP conversation
//! (CAPABILITY, LOGIN, SELECT, FETCH, optional STORE/EXPUNGE, LOGOUT),
//! streaming message bodies into the maildir as they arrive.
//!
//! Everything runs serialized on one task: reads, the greeting and
//! fetch-stats timers, and the signal watchers are arms of a single select
//! loop, so the ingestor needs no locking. Commands a callback produces are
//! queued and flushed FIFO after the callback returns.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time;

use crate::localstorage::maildir::{Maildir, MaildirTmpFile};
use crate::net::{PlainStream, TlsStreamWrapper};

use super::handler::ResponseHandler;
use super::parser::ResponseParser;
use super::writer::{Command, CommandWriter, FetchAtt, Section, StoreMode};
use super::{Flag, SequenceSet, SessionError, SessionState, Status};
use super::{CAP_LOGINDISABLED, CAP_UIDPLUS};

/// What the session needs to know from the account configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub username: String,
    pub password: String,
    pub mailbox: String,
    pub delete_after_fetch: bool,
    /// How long to wait after the handshake for an unsolicited capability
    /// list in the greeting before asking explicitly. Some servers send
    /// capabilities with the greeting, some do not; the timer collapses both
    /// paths.
    pub greeting_wait: Duration,
}

/// Outcome of a completed session.
#[derive(Debug)]
pub struct SessionReport {
    pub state: SessionState,
    pub fetched_messages: u64,
}

/// Stream for the session: plain TCP or implicit TLS.
pub enum ImapStream {
    Plain(PlainStream),
    Tls(TlsStreamWrapper),
}

impl ImapStream {
    pub async fn connect(
        host: &str,
        port: u16,
        use_tls: bool,
        fingerprint: &str,
    ) -> io::Result<Self> {
        if use_tls {
            let tls = TlsStreamWrapper::connect_implicit_tls(host, port, fingerprint).await?;
            Ok(ImapStream::Tls(tls))
        } else {
            let plain = PlainStream::connect(host, port).await?;
            Ok(ImapStream::Plain(plain))
        }
    }
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ImapStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ImapStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ImapStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ImapStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Destination for literal bytes: the in-memory scratch buffer (response
/// parsing, header fields) or the open maildir delivery file (a full body
/// in flight). Switched at body-section begin/end.
enum BodySink {
    Memory(Vec<u8>),
    File(MaildirTmpFile),
}

impl BodySink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            BodySink::Memory(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            BodySink::File(f) => f.write(data),
        }
    }

    fn reset(&mut self) {
        if let BodySink::Memory(buf) = self {
            buf.clear();
        }
    }
}

/// IMAP download session over a connected (and, for TLS, handshaken) stream.
pub struct Session<S> {
    stream: S,
    parser: ResponseParser,
    ingest: Ingest,
}

/// The parser-facing side of the session: all protocol state, the command
/// dispatch, and the maildir delivery hookup.
struct Ingest {
    config: SessionConfig,
    writer: CommandWriter,
    state: SessionState,
    tag_states: HashMap<String, SessionState>,
    capabilities: HashSet<String>,
    exists: u32,
    recent: u32,
    uidvalidity: u32,
    uids: SequenceSet,
    flags: String,
    full_body: bool,
    sink: BodySink,
    maildir: Maildir,
    outbox: Vec<Vec<u8>>,
    quit: bool,
    bytes_read: u64,
    fetched_messages: u64,
    fetch_started: Option<Instant>,
    fetch_bytes_start: u64,
    fetch_timer_reset: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Wrap a connected stream. The server greeting has not been read yet.
    pub fn new(stream: S, config: SessionConfig, maildir: Maildir) -> Self {
        Self {
            stream,
            parser: ResponseParser::new(),
            ingest: Ingest::new(config, maildir),
        }
    }

    /// Run the session to completion. Returns once the connection is closed
    /// down, or fails on the first fatal error; in the latter case completed
    /// messages are already in new/ or cur/ and the aborted one, if any, is
    /// left in tmp/.
    pub async fn run(mut self) -> Result<SessionReport, SessionError> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut signaled = false;

        self.ingest.state = SessionState::Established;
        let greeting_wait = time::sleep(self.ingest.config.greeting_wait);
        tokio::pin!(greeting_wait);
        let mut greeting_fired = false;
        let mut stats = time::interval(Duration::from_secs(1));
        stats.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 16 * 1024];

        while !self.ingest.quit {
            tokio::select! {
                r = self.stream.read(&mut buf) => match r {
                    Ok(0) => {
                        if self.ingest.state == SessionState::LoggedOut {
                            log::debug!("server closed the connection after logout");
                            self.ingest.quit = true;
                        } else {
                            return Err(SessionError::Transport(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "server closed the connection",
                            )));
                        }
                    }
                    Ok(n) => {
                        self.ingest.bytes_read += n as u64;
                        self.parser.receive(&buf[..n], &mut self.ingest)?;
                        if self.ingest.fetch_timer_reset {
                            self.ingest.fetch_timer_reset = false;
                            stats.reset();
                        }
                        self.flush().await?;
                    }
                    Err(e) => {
                        if self.ingest.state == SessionState::LoggedOut && benign_closure(&e) {
                            log::debug!("ignoring read error after logout: {}", e);
                            self.ingest.quit = true;
                        } else {
                            log::debug!("read failed: {}", e);
                            return Err(SessionError::Transport(e));
                        }
                    }
                },
                _ = &mut greeting_wait, if !greeting_fired => {
                    greeting_fired = true;
                    log::debug!("greeting wait elapsed");
                    self.ingest.do_capabilities()?;
                    self.flush().await?;
                }
                _ = stats.tick(), if self.ingest.fetch_started.is_some() => {
                    self.ingest.print_fetch_stats();
                }
                _ = sigint.recv() => self.ingest.handle_signal("SIGINT", &mut signaled)?,
                _ = sigterm.recv() => self.ingest.handle_signal("SIGTERM", &mut signaled)?,
            }
        }

        self.close(&mut sigint, &mut sigterm, &mut signaled).await?;
        Ok(SessionReport {
            state: self.ingest.state,
            fetched_messages: self.ingest.fetched_messages,
        })
    }

    async fn flush(&mut self) -> Result<(), SessionError> {
        if self.ingest.outbox.is_empty() {
            return Ok(());
        }
        for line in self.ingest.outbox.drain(..) {
            self.stream.write_all(&line).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Orderly close: TLS close-notify (a no-op on plain TCP), with the two
    /// error classes known benign during closure swallowed. The signal
    /// watchers stay armed so a second signal still escalates.
    async fn close(
        &mut self,
        sigint: &mut Signal,
        sigterm: &mut Signal,
        signaled: &mut bool,
    ) -> Result<(), SessionError> {
        log::debug!("closing connection");
        loop {
            tokio::select! {
                r = self.stream.shutdown() => {
                    match r {
                        Ok(()) => {}
                        Err(e) if benign_shutdown(&e) => {
                            log::debug!("ignoring shutdown error: {}", e);
                        }
                        Err(e) => {
                            log::error!("TLS shutdown failed: {}", e);
                            return Err(SessionError::Tls(e.to_string()));
                        }
                    }
                    return Ok(());
                }
                _ = sigint.recv() => self.ingest.handle_signal("SIGINT", signaled)?,
                _ = sigterm.recv() => self.ingest.handle_signal("SIGTERM", signaled)?,
            }
        }
    }
}

/// Read errors tolerated once the session is LOGGED_OUT: a clean EOF and
/// TLS truncation (the peer dropped the link without close-notify).
fn benign_closure(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::UnexpectedEof
}

/// Errors tolerated from close-notify during orderly closure: truncated
/// close, and a decrypt failure (bad record MAC) from a peer that already
/// tore down its end.
fn benign_shutdown(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => true,
        io::ErrorKind::InvalidData => {
            let msg = e.to_string();
            msg.contains("decrypt") || msg.contains("BadRecordMac")
        }
        _ => false,
    }
}

impl Ingest {
    fn new(config: SessionConfig, maildir: Maildir) -> Self {
        Self {
            config,
            writer: CommandWriter::new(),
            state: SessionState::Disconnected,
            tag_states: HashMap::new(),
            capabilities: HashSet::new(),
            exists: 0,
            recent: 0,
            uidvalidity: 0,
            uids: SequenceSet::new(),
            flags: String::new(),
            full_body: false,
            sink: BodySink::Memory(Vec::new()),
            maildir,
            outbox: Vec::new(),
            quit: false,
            bytes_read: 0,
            fetched_messages: 0,
            fetch_started: None,
            fetch_bytes_start: 0,
            fetch_timer_reset: false,
        }
    }

    /// Register the command's tag, then queue its bytes.
    fn send(&mut self, cmd: Command, next: SessionState) {
        self.tag_states.insert(cmd.tag, next);
        self.outbox.push(cmd.line);
    }

    /// Dispatch the next protocol action for the state just entered.
    fn command(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::GotInitialCapabilities => self.do_login(),
            SessionState::LoggedIn => self.do_capabilities(),
            SessionState::GotCapabilities => self.do_select(),
            SessionState::SelectedMailbox => self.do_fetch_or_logout(),
            SessionState::Fetched => {
                self.stop_fetch_stats();
                self.do_store_or_logout()
            }
            SessionState::Stored => self.do_uid_or_simple_expunge(),
            SessionState::Expunged => self.do_logout(),
            SessionState::LoggedOut => {
                self.quit = true;
                Ok(())
            }
            // Established waits for the greeting timer; Fetching and
            // LoggingOut are driven by further responses.
            _ => Ok(()),
        }
    }

    fn do_capabilities(&mut self) -> Result<(), SessionError> {
        if !self.capabilities.is_empty() {
            let next = self.state.next();
            log::debug!("switch from state {} to {}", self.state, next);
            self.state = next;
            return self.command();
        }
        let cmd = self.writer.capability();
        log::info!("getting capabilities ... [{}]", cmd.tag);
        let next = self.state.next();
        self.send(cmd, next);
        Ok(())
    }

    fn do_login(&mut self) -> Result<(), SessionError> {
        if self.capabilities.contains(CAP_LOGINDISABLED) {
            return Err(SessionError::Protocol(
                "cannot login because server has LOGINDISABLED".to_string(),
            ));
        }
        log::debug!("clearing capabilities");
        self.capabilities.clear();

        self.exists = 0;
        self.recent = 0;
        self.uidvalidity = 0;
        self.uids.clear();

        let cmd = self.writer.login(&self.config.username, &self.config.password);
        log::info!("logging in as |{}| [{}]", self.config.username, cmd.tag);
        self.send(cmd, SessionState::LoggedIn);
        Ok(())
    }

    fn do_select(&mut self) -> Result<(), SessionError> {
        let cmd = self.writer.select(&self.config.mailbox);
        log::info!("selecting mailbox: |{}| [{}]", self.config.mailbox, cmd.tag);
        self.send(cmd, SessionState::SelectedMailbox);
        Ok(())
    }

    fn do_fetch_or_logout(&mut self) -> Result<(), SessionError> {
        if self.exists > 0 {
            self.do_fetch()
        } else {
            log::info!("mailbox {} is empty", self.config.mailbox);
            self.do_logout()
        }
    }

    fn do_fetch(&mut self) -> Result<(), SessionError> {
        let atts = [
            FetchAtt::Uid,
            FetchAtt::Flags,
            FetchAtt::BodyPeek(Section::HeaderFields(vec![
                "date".to_string(),
                "from".to_string(),
                "subject".to_string(),
            ])),
            FetchAtt::BodyPeek(Section::Full),
        ];
        let cmd = self.writer.fetch("1:*", &atts);
        log::info!(
            "fetching into {} ... [{}]",
            self.maildir.root().display(),
            cmd.tag
        );
        self.send(cmd, SessionState::Fetched);
        self.state = SessionState::Fetching;
        self.start_fetch_stats();
        Ok(())
    }

    fn do_store_or_logout(&mut self) -> Result<(), SessionError> {
        if self.config.delete_after_fetch {
            self.do_store()
        } else {
            self.do_logout()
        }
    }

    fn do_store(&mut self) -> Result<(), SessionError> {
        let cmd = self
            .writer
            .uid_store(&self.uids, &[Flag::Deleted], StoreMode::Add, true);
        log::info!("storing deleted flags ... [{}]", cmd.tag);
        self.send(cmd, SessionState::Stored);
        Ok(())
    }

    fn has_uidplus(&self) -> bool {
        let has = self.capabilities.contains(CAP_UIDPLUS);
        log::debug!("has UIDPLUS capability: {}", has);
        has
    }

    fn do_uid_or_simple_expunge(&mut self) -> Result<(), SessionError> {
        // UID EXPUNGE only touches our set; a plain EXPUNGE would also
        // remove messages a concurrent session flagged deleted.
        if self.has_uidplus() {
            self.do_uid_expunge()
        } else {
            self.do_expunge()
        }
    }

    fn do_uid_expunge(&mut self) -> Result<(), SessionError> {
        let cmd = self.writer.uid_expunge(&self.uids);
        log::info!("expunging messages ... [{}]", cmd.tag);
        self.send(cmd, SessionState::Expunged);
        Ok(())
    }

    fn do_expunge(&mut self) -> Result<(), SessionError> {
        let cmd = self.writer.expunge();
        log::info!("expunging messages (without UIDPLUS) ... [{}]", cmd.tag);
        self.send(cmd, SessionState::Expunged);
        Ok(())
    }

    fn do_logout(&mut self) -> Result<(), SessionError> {
        let cmd = self.writer.logout();
        log::info!("logging out ... [{}]", cmd.tag);
        self.send(cmd, SessionState::LoggedOut);
        self.state = SessionState::LoggingOut;
        Ok(())
    }

    fn handle_signal(&mut self, name: &str, signaled: &mut bool) -> Result<(), SessionError> {
        log::error!("got signal: {}", name);
        if *signaled {
            Err(SessionError::Signal(format!(
                "got a signal ({}) the second time - immediate exit",
                name
            )))
        } else {
            *signaled = true;
            self.quit = true;
            Ok(())
        }
    }

    fn start_fetch_stats(&mut self) {
        self.fetch_started = Some(Instant::now());
        self.fetch_bytes_start = self.bytes_read;
        self.fetch_timer_reset = true;
    }

    fn stop_fetch_stats(&mut self) {
        self.print_fetch_stats();
        self.fetch_started = None;
    }

    fn print_fetch_stats(&self) {
        if let Some(start) = self.fetch_started {
            let secs = start.elapsed().as_secs_f64().max(1e-3);
            let bytes = self.bytes_read - self.fetch_bytes_start;
            let rate = bytes as f64 / secs / 1024.0;
            log::info!(
                "fetched {} messages ({} bytes) in {:.1} s (@ {:.1} KiB/s)",
                self.fetched_messages,
                bytes,
                secs,
                rate
            );
        }
    }
}

impl ResponseHandler for Ingest {
    fn status_code_capability_begin(&mut self) {
        log::debug!("clearing capabilities");
        self.capabilities.clear();
    }

    fn capability(&mut self, token: &str) {
        log::debug!("got capability: {}", token);
        self.capabilities.insert(token.to_ascii_uppercase());
    }

    fn tagged_status(
        &mut self,
        tag: &str,
        status: Status,
        text: &str,
    ) -> Result<(), SessionError> {
        log::debug!("got status {} for tag {}", status, tag);
        if status != Status::Ok {
            return Err(SessionError::Protocol(format!(
                "command failed: {} - {}",
                status, text
            )));
        }
        let next = self
            .tag_states
            .remove(tag)
            .ok_or_else(|| SessionError::Protocol(format!("got unknown tag: {}", tag)))?;
        log::debug!("switch from state {} to {} [{}]", self.state, next, tag);
        self.state = next;
        self.command()
    }

    fn data_exists(&mut self, n: u32) {
        log::info!("mailbox {} contains {} messages", self.config.mailbox, n);
        self.exists = n;
    }

    fn data_recent(&mut self, n: u32) {
        log::info!("mailbox {} has {} RECENT messages", self.config.mailbox, n);
        self.recent = n;
    }

    fn status_code_uidvalidity(&mut self, n: u32) {
        log::info!("UIDVALIDITY: {}", n);
        self.uidvalidity = n;
    }

    fn fetch_begin(&mut self, n: u32) {
        self.flags.clear();
        if self.state == SessionState::Fetching {
            log::debug!("fetching message: {}", n);
        }
    }

    fn section_empty(&mut self) {
        self.full_body = true;
    }

    fn body_section_begin(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Fetching && self.full_body {
            let tmp = self.maildir.create_tmp()?;
            self.sink = BodySink::File(tmp);
        }
        Ok(())
    }

    fn literal_chunk(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.sink.write(data).map_err(SessionError::from)
    }

    fn body_section_end(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Fetching && self.full_body {
            let sink = std::mem::replace(&mut self.sink, BodySink::Memory(Vec::new()));
            if let BodySink::File(tmp) = sink {
                if self.flags.is_empty() {
                    tmp.move_to_new()?;
                } else {
                    log::debug!("using maildir flags: {}", self.flags);
                    tmp.move_to_cur(&self.flags)?;
                }
            }
            self.full_body = false;
            self.fetched_messages += 1;
        } else {
            self.sink.reset();
        }
        Ok(())
    }

    fn flag(&mut self, flag: Flag) {
        if let Some(c) = flag.maildir_letter() {
            self.flags.push(c);
        }
    }

    fn uid(&mut self, n: u32) {
        if self.state == SessionState::Fetching {
            log::debug!("UID: {}", n);
            self.uids.push(n);
        }
    }
}
