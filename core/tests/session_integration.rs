/*
 * session_integration.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * End-to-end tests for the IMAP download session against a scripted
 * in-process replay server: the server answers each expected command with
 * canned responses (echoing the client's tag) and records the command
 * transcript for order assertions.
 *
 * Run with:
 *   cargo test -p postino-core --test session_integration
 */

use std::fs;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use postino_core::localstorage::maildir::Maildir;
use postino_core::protocol::imap::{Session, SessionConfig, SessionError};

enum Step {
    /// Send these bytes, with `{tag}` replaced by the tag of the last
    /// command received.
    Send(&'static str),
    /// Read one command line and assert it contains this substring.
    Expect(&'static str),
}

struct ReplayServer {
    port: u16,
    handle: JoinHandle<Vec<String>>,
}

async fn spawn_replay(steps: Vec<Step>) -> ReplayServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut transcript = Vec::new();
        let mut last_tag = String::new();
        for step in steps {
            match step {
                Step::Send(text) => {
                    let out = text.replace("{tag}", &last_tag);
                    sock.write_all(out.as_bytes()).await.unwrap();
                }
                Step::Expect(expected) => {
                    let line = read_line(&mut sock).await;
                    assert!(
                        line.contains(expected),
                        "expected a command containing {:?}, got {:?}",
                        expected,
                        line
                    );
                    last_tag = line.split(' ').next().unwrap_or("").to_string();
                    transcript.push(line);
                }
            }
        }
        transcript
    });
    ReplayServer { port, handle }
}

async fn read_line(sock: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut b = [0u8; 1];
    loop {
        let n = sock.read(&mut b).await.unwrap();
        if n == 0 {
            break;
        }
        line.push(b[0]);
        if b[0] == b'\n' {
            break;
        }
    }
    String::from_utf8_lossy(&line).trim_end().to_string()
}

fn session_config(delete: bool) -> SessionConfig {
    SessionConfig {
        username: "joe".to_string(),
        password: "secret".to_string(),
        mailbox: "INBOX".to_string(),
        delete_after_fetch: delete,
        greeting_wait: Duration::from_millis(50),
    }
}

async fn run_session(
    port: u16,
    config: SessionConfig,
    maildir_path: &Path,
) -> Result<postino_core::protocol::imap::SessionReport, SessionError> {
    let maildir = Maildir::open(maildir_path).unwrap();
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let session = Session::new(stream, config, maildir);
    tokio::time::timeout(Duration::from_secs(10), session.run())
        .await
        .expect("session timed out")
}

fn dir_contents(dir: &Path) -> Vec<Vec<u8>> {
    let mut out: Vec<Vec<u8>> = fs::read_dir(dir)
        .unwrap()
        .map(|e| fs::read(e.unwrap().path()).unwrap())
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn happy_path_downloads_into_new() {
    let server = spawn_replay(vec![
        Step::Send("* OK IMAP4rev1 ready\r\n"),
        Step::Expect("CAPABILITY"),
        Step::Send("* CAPABILITY IMAP4rev1 UIDPLUS\r\n{tag} OK capability done\r\n"),
        Step::Expect("LOGIN"),
        Step::Send("{tag} OK logged in\r\n"),
        Step::Expect("CAPABILITY"),
        Step::Send("* CAPABILITY IMAP4rev1 UIDPLUS\r\n{tag} OK capability done\r\n"),
        Step::Expect("SELECT"),
        Step::Send(
            "* 2 EXISTS\r\n* 0 RECENT\r\n* OK [UIDVALIDITY 42] UIDs valid\r\n{tag} OK selected\r\n",
        ),
        Step::Expect("FETCH 1:*"),
        Step::Send(
            "* 1 FETCH (UID 1 FLAGS () BODY[] {5}\r\nBODY1)\r\n\
             * 2 FETCH (UID 2 FLAGS () BODY[] {5}\r\nBODY2)\r\n\
             {tag} OK fetch completed\r\n",
        ),
        Step::Expect("LOGOUT"),
        Step::Send("* BYE logging out\r\n{tag} OK bye\r\n"),
    ])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let report = run_session(server.port, session_config(false), dir.path())
        .await
        .unwrap();

    assert_eq!(report.state.to_string(), "LOGGED_OUT");
    assert_eq!(report.fetched_messages, 2);
    assert_eq!(
        dir_contents(&dir.path().join("new")),
        vec![b"BODY1".to_vec(), b"BODY2".to_vec()]
    );
    assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    assert_eq!(fs::read_dir(dir.path().join("cur")).unwrap().count(), 0);

    let transcript = server.handle.await.unwrap();
    let verbs: Vec<&str> = transcript
        .iter()
        .map(|l| l.split_once(' ').unwrap().1)
        .collect();
    assert!(verbs[0].starts_with("CAPABILITY"));
    assert!(verbs[1].starts_with("LOGIN"));
    assert!(verbs[2].starts_with("CAPABILITY"));
    assert!(verbs[3].starts_with("SELECT"));
    assert!(verbs[4].starts_with("FETCH"));
    assert!(verbs[5].starts_with("LOGOUT"));
}

#[tokio::test]
async fn flagged_message_lands_in_cur_with_suffix_in_parse_order() {
    let server = spawn_replay(vec![
        Step::Send("* OK ready\r\n"),
        Step::Expect("CAPABILITY"),
        Step::Send("* CAPABILITY IMAP4rev1\r\n{tag} OK done\r\n"),
        Step::Expect("LOGIN"),
        Step::Send("{tag} OK logged in\r\n"),
        Step::Expect("CAPABILITY"),
        Step::Send("* CAPABILITY IMAP4rev1\r\n{tag} OK done\r\n"),
        Step::Expect("SELECT"),
        Step::Send("* 1 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n{tag} OK selected\r\n"),
        Step::Expect("FETCH"),
        Step::Send(
            "* 1 FETCH (UID 4 FLAGS (\\Seen \\Answered \\Recent) BODY[] {5}\r\nhello)\r\n\
             {tag} OK fetch completed\r\n",
        ),
        Step::Expect("LOGOUT"),
        Step::Send("{tag} OK bye\r\n"),
    ])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let report = run_session(server.port, session_config(false), dir.path())
        .await
        .unwrap();
    assert_eq!(report.fetched_messages, 1);

    let entries: Vec<_> = fs::read_dir(dir.path().join("cur"))
        .unwrap()
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(entries.len(), 1);
    let name = entries[0].file_name().to_string_lossy().into_owned();
    // \Seen then \Answered, \Recent dropped: suffix SR in parse order.
    assert!(name.ends_with(":2,SR"), "{}", name);
    assert_eq!(fs::read(entries[0].path()).unwrap(), b"hello");
    assert_eq!(fs::read_dir(dir.path().join("new")).unwrap().count(), 0);

    server.handle.await.unwrap();
}

#[tokio::test]
async fn empty_mailbox_logs_out_without_fetch() {
    let server = spawn_replay(vec![
        Step::Send("* OK ready\r\n"),
        Step::Expect("CAPABILITY"),
        Step::Send("* CAPABILITY IMAP4rev1\r\n{tag} OK done\r\n"),
        Step::Expect("LOGIN"),
        Step::Send("{tag} OK logged in\r\n"),
        Step::Expect("CAPABILITY"),
        Step::Send("* CAPABILITY IMAP4rev1\r\n{tag} OK done\r\n"),
        Step::Expect("SELECT"),
        Step::Send("* 0 EXISTS\r\n* 0 RECENT\r\n{tag} OK selected\r\n"),
        Step::Expect("LOGOUT"),
        Step::Send("{tag} OK bye\r\n"),
    ])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let report = run_session(server.port, session_config(false), dir.path())
        .await
        .unwrap();
    assert_eq!(report.fetched_messages, 0);
    assert_eq!(report.state.to_string(), "LOGGED_OUT");

    let transcript = server.handle.await.unwrap();
    assert!(transcript.iter().all(|l| !l.contains("FETCH")));
    assert_eq!(fs::read_dir(dir.path().join("new")).unwrap().count(), 0);
}

#[tokio::test]
async fn logindisabled_is_fatal_before_login() {
    let server = spawn_replay(vec![
        Step::Send("* OK ready\r\n"),
        Step::Expect("CAPABILITY"),
        Step::Send("* CAPABILITY IMAP4rev1 LOGINDISABLED\r\n{tag} OK done\r\n"),
    ])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let err = run_session(server.port, session_config(false), dir.path())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)), "{}", err);
    assert!(err.to_string().contains("LOGINDISABLED"));

    let transcript = server.handle.await.unwrap();
    assert!(transcript.iter().all(|l| !l.contains("LOGIN ")));
}

#[tokio::test]
async fn delete_with_uidplus_stores_then_uid_expunges() {
    let server = spawn_replay(vec![
        // Capabilities in the greeting: the explicit CAPABILITY round trip
        // is skipped and LOGIN is the first command.
        Step::Send("* OK [CAPABILITY IMAP4rev1 UIDPLUS] ready\r\n"),
        Step::Expect("LOGIN"),
        Step::Send("{tag} OK logged in\r\n"),
        Step::Expect("CAPABILITY"),
        Step::Send("* CAPABILITY IMAP4rev1 UIDPLUS\r\n{tag} OK done\r\n"),
        Step::Expect("SELECT"),
        Step::Send("* 3 EXISTS\r\n* OK [UIDVALIDITY 9] ok\r\n{tag} OK selected\r\n"),
        Step::Expect("FETCH"),
        Step::Send(
            "* 1 FETCH (UID 3 FLAGS () BODY[] {2}\r\nm1)\r\n\
             * 2 FETCH (UID 5 FLAGS () BODY[] {2}\r\nm2)\r\n\
             * 3 FETCH (UID 7 FLAGS () BODY[] {2}\r\nm3)\r\n\
             {tag} OK fetch completed\r\n",
        ),
        Step::Expect("UID STORE 3,5,7 +FLAGS.SILENT (\\Deleted)"),
        Step::Send("{tag} OK store completed\r\n"),
        Step::Expect("UID EXPUNGE 3,5,7"),
        Step::Send("{tag} OK expunged\r\n"),
        Step::Expect("LOGOUT"),
        Step::Send("{tag} OK bye\r\n"),
    ])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let report = run_session(server.port, session_config(true), dir.path())
        .await
        .unwrap();
    assert_eq!(report.fetched_messages, 3);
    assert_eq!(
        dir_contents(&dir.path().join("new")),
        vec![b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()]
    );

    let transcript = server.handle.await.unwrap();
    assert!(transcript[0].contains("LOGIN"));
    assert!(transcript.iter().any(|l| l.contains("UID STORE")));
    assert!(transcript.iter().any(|l| l.contains("UID EXPUNGE")));
}

#[tokio::test]
async fn delete_without_uidplus_uses_plain_expunge() {
    let server = spawn_replay(vec![
        Step::Send("* OK [CAPABILITY IMAP4rev1] ready\r\n"),
        Step::Expect("LOGIN"),
        Step::Send("{tag} OK logged in\r\n"),
        Step::Expect("CAPABILITY"),
        Step::Send("* CAPABILITY IMAP4rev1\r\n{tag} OK done\r\n"),
        Step::Expect("SELECT"),
        Step::Send("* 1 EXISTS\r\n{tag} OK selected\r\n"),
        Step::Expect("FETCH"),
        Step::Send("* 1 FETCH (UID 8 FLAGS () BODY[] {2}\r\nm1)\r\n{tag} OK done\r\n"),
        Step::Expect("UID STORE 8 +FLAGS.SILENT (\\Deleted)"),
        Step::Send("{tag} OK store completed\r\n"),
        Step::Expect("EXPUNGE"),
        Step::Send("* 1 EXPUNGE\r\n{tag} OK expunged\r\n"),
        Step::Expect("LOGOUT"),
        Step::Send("{tag} OK bye\r\n"),
    ])
    .await;

    let dir = tempfile::tempdir().unwrap();
    run_session(server.port, session_config(true), dir.path())
        .await
        .unwrap();

    let transcript = server.handle.await.unwrap();
    let expunge = transcript.iter().find(|l| l.contains("EXPUNGE")).unwrap();
    assert!(!expunge.contains("UID EXPUNGE"), "{}", expunge);
}

#[tokio::test]
async fn tagged_no_fails_the_session() {
    let server = spawn_replay(vec![
        Step::Send("* OK ready\r\n"),
        Step::Expect("CAPABILITY"),
        Step::Send("* CAPABILITY IMAP4rev1\r\n{tag} OK done\r\n"),
        Step::Expect("LOGIN"),
        Step::Send("{tag} NO [AUTHENTICATIONFAILED] bad credentials\r\n"),
    ])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let err = run_session(server.port, session_config(false), dir.path())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)));
    assert!(err.to_string().contains("bad credentials"));
    server.handle.await.unwrap();
}

#[tokio::test]
async fn message_body_survives_byte_exact_across_chunked_delivery() {
    // A body with CRLFs, a lone ')' line, and an IMAP-looking line inside.
    let server = spawn_replay(vec![
        Step::Send("* OK ready\r\n"),
        Step::Expect("CAPABILITY"),
        Step::Send("* CAPABILITY IMAP4rev1\r\n{tag} OK done\r\n"),
        Step::Expect("LOGIN"),
        Step::Send("{tag} OK logged in\r\n"),
        Step::Expect("CAPABILITY"),
        Step::Send("* CAPABILITY IMAP4rev1\r\n{tag} OK done\r\n"),
        Step::Expect("SELECT"),
        Step::Send("* 1 EXISTS\r\n{tag} OK selected\r\n"),
        Step::Expect("FETCH"),
        Step::Send("* 1 FETCH (UID 1 FLAGS () BODY[] {29}\r\nSubject: x\r\n\r\n)\r\n* 9 EXISTS\r\n)\r\n{tag} OK done\r\n"),
        Step::Expect("LOGOUT"),
        Step::Send("{tag} OK bye\r\n"),
    ])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let report = run_session(server.port, session_config(false), dir.path())
        .await
        .unwrap();
    assert_eq!(report.fetched_messages, 1);
    assert_eq!(
        dir_contents(&dir.path().join("new")),
        vec![b"Subject: x\r\n\r\n)\r\n* 9 EXISTS\r\n".to_vec()]
    );
    server.handle.await.unwrap();
}
