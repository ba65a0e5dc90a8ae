/*
 * main.rs
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

//! Command-line front end: option parsing, logging setup, account
//! resolution, and one download session on a current-thread runtime.

use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use structopt::StructOpt;

use postino_core::config;
use postino_core::config::Account;
use postino_core::localstorage::maildir::Maildir;
use postino_core::protocol::imap::{ImapStream, Session, SessionConfig};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "postino",
    about = "Fetch every message of an IMAP mailbox into a maildir."
)]
struct Opt {
    /// Accounts file
    #[structopt(long, parse(from_os_str))]
    config: PathBuf,

    /// Name of the account to fetch
    #[structopt(long)]
    account: String,

    /// Override the account's maildir path
    #[structopt(long, parse(from_os_str))]
    maildir: Option<PathBuf>,

    /// Override the account's mailbox
    #[structopt(long)]
    mailbox: Option<String>,

    /// Milliseconds to wait for capabilities in the server greeting
    #[structopt(long = "gwait")]
    gwait: Option<u64>,

    /// Use TLS (yes/no); overrides the account setting
    #[structopt(long)]
    ssl: Option<String>,

    /// Mark fetched messages deleted and expunge them
    #[structopt(long)]
    delete: bool,

    /// Also log to this file
    #[structopt(long, parse(from_os_str))]
    log: Option<PathBuf>,

    /// Increase verbosity (repeat for more)
    #[structopt(short = "v", parse(from_occurrences))]
    verbose: u64,
}

fn init_logging(verbosity: u64, logfile: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use log4rs::append::console::{ConsoleAppender, Target};
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let pattern = "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}";

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build();
    let mut config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = logfile {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(pattern)))
            .build(path)?;
        config = config.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    log4rs::init_config(config.build(root.build(level))?)?;
    Ok(())
}

fn resolve_account(opt: &Opt) -> Result<Account, Box<dyn Error>> {
    let accounts = config::load_accounts(&opt.config)?;
    let mut account = config::find_account(accounts, &opt.account)
        .ok_or_else(|| format!("no such account: {}", opt.account))?;

    if let Some(maildir) = &opt.maildir {
        account.maildir = maildir.to_string_lossy().into_owned();
    }
    if let Some(mailbox) = &opt.mailbox {
        account.mailbox = mailbox.clone();
    }
    if let Some(gwait) = opt.gwait {
        account.greeting_wait_ms = gwait;
    }
    if let Some(ssl) = &opt.ssl {
        account.use_ssl = if ssl.eq_ignore_ascii_case("yes") {
            true
        } else if ssl.eq_ignore_ascii_case("no") {
            false
        } else {
            return Err(format!("invalid --ssl value: {}", ssl).into());
        };
    }
    if opt.delete {
        account.delete_after_fetch = true;
    }

    if account.host.is_empty() {
        return Err(format!("account {} has no host", account.name).into());
    }
    if account.maildir.is_empty() {
        return Err(format!("account {} has no maildir", account.name).into());
    }
    Ok(account)
}

async fn run_session(account: Account) -> Result<(), Box<dyn Error>> {
    let maildir = Maildir::open(&account.maildir)?;

    if account.use_ssl && !account.cipher.is_empty() {
        log::info!("cipher list: {}", account.cipher);
    }
    let stream = ImapStream::connect(
        &account.host,
        account.port,
        account.use_ssl,
        &account.fingerprint,
    )
    .await?;

    let session_config = SessionConfig {
        username: account.username,
        password: account.password,
        mailbox: account.mailbox,
        delete_after_fetch: account.delete_after_fetch,
        greeting_wait: Duration::from_millis(account.greeting_wait_ms),
    };
    let report = Session::new(stream, session_config, maildir).run().await?;
    log::info!(
        "session finished in state {} ({} messages)",
        report.state,
        report.fetched_messages
    );
    Ok(())
}

fn run(opt: Opt) -> Result<(), Box<dyn Error>> {
    init_logging(opt.verbose, opt.log.as_ref())?;
    let account = resolve_account(&opt)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_session(account))
}

fn main() {
    let opt = Opt::from_args();
    if let Err(e) = run(opt) {
        log::error!("{}", e);
        eprintln!("postino: {}", e);
        process::exit(1);
    }
}
