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

//! Maildir delivery (cur, new, tmp). Messages are streamed into a uniquely
//! named file under tmp/ and renamed into new/ or cur/ once complete; the
//! rename is the atomic delivery step. Files left in tmp/ by an aborted
//! session are disposable.

mod filename;

pub use filename::MaildirFilename;

use std::fs;
use std::fs::File;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One maildir (root containing cur/, new/, tmp/).
pub struct Maildir {
    root: PathBuf,
}

impl Maildir {
    /// Open a maildir, creating the directory tree as needed.
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in ["cur", "new", "tmp"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh, open delivery file under tmp/.
    pub fn create_tmp(&self) -> io::Result<MaildirTmpFile> {
        let name = MaildirFilename::generate();
        let path = self.root.join("tmp").join(name.base());
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(MaildirTmpFile {
            root: self.root.clone(),
            path,
            name,
            file,
            written: 0,
        })
    }
}

/// An in-flight delivery: an open file under tmp/ that is renamed into
/// new/ or cur/ when the message is complete.
pub struct MaildirTmpFile {
    root: PathBuf,
    path: PathBuf,
    name: MaildirFilename,
    file: File,
    written: u64,
}

impl MaildirTmpFile {
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Deliver to new/ (no flags).
    pub fn move_to_new(self) -> io::Result<PathBuf> {
        self.deliver("new", None)
    }

    /// Deliver to cur/ with the given maildir flag letters, kept in the
    /// given order.
    pub fn move_to_cur(self, flags: &str) -> io::Result<PathBuf> {
        self.deliver("cur", Some(flags))
    }

    fn deliver(mut self, sub: &str, flags: Option<&str>) -> io::Result<PathBuf> {
        self.file.sync_all()?;
        self.name.size = Some(self.written);
        let filename = match flags {
            None => self.name.base(),
            Some(flags) => {
                self.name.flags = flags.to_string();
                self.name.with_info()
            }
        };
        let target = self.root.join(sub).join(filename);
        fs::rename(&self.path, &target)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_to_new() {
        let dir = tempfile::tempdir().unwrap();
        let md = Maildir::open(dir.path()).unwrap();
        let mut tmp = md.create_tmp().unwrap();
        tmp.write(b"BO").unwrap();
        tmp.write(b"DY1").unwrap();
        let path = tmp.move_to_new().unwrap();
        assert!(path.starts_with(dir.path().join("new")));
        assert_eq!(fs::read(&path).unwrap(), b"BODY1");
        assert!(path.to_string_lossy().contains(",S=5"));
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn delivery_to_cur_keeps_flag_order() {
        let dir = tempfile::tempdir().unwrap();
        let md = Maildir::open(dir.path()).unwrap();
        let mut tmp = md.create_tmp().unwrap();
        tmp.write(b"hello").unwrap();
        let path = tmp.move_to_cur("SR").unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with(":2,SR"), "{}", name);
        assert!(path.starts_with(dir.path().join("cur")));
    }

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        Maildir::open(dir.path()).unwrap();
        let md = Maildir::open(dir.path()).unwrap();
        assert!(md.root().join("tmp").is_dir());
    }

    #[test]
    fn abandoned_tmp_file_stays_in_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let md = Maildir::open(dir.path()).unwrap();
        let mut tmp = md.create_tmp().unwrap();
        tmp.write(b"partial").unwrap();
        drop(tmp);
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 1);
        assert_eq!(fs::read_dir(dir.path().join("new")).unwrap().count(), 0);
    }
}
