use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::reassembler::TransferId;
use crate::session::Direction;

pub trait Logger: Send + Sync {
    fn opened(&self, _session: &str) {}
    fn listed(&self, _path: &str, _entries: usize) {}
    fn transfer_start(&self, _dir: Direction, _id: TransferId, _name: &str, _size: Option<u64>) {}
    fn transfer_done(&self, _dir: Direction, _id: TransferId, _name: &str, _bytes: u64) {}
    fn transfer_cancelled(&self, _dir: Direction, _id: TransferId, _name: &str) {}
    fn error(&self, _kind: &str, _msg: &str) {}
    fn closed(&self, _reason: Option<&str>) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn opened(&self, session: &str) {
        self.line(&format!("OPEN session={}", session));
    }
    fn listed(&self, path: &str, entries: usize) {
        self.line(&format!("LIST path={:?} entries={}", path, entries));
    }
    fn transfer_start(&self, dir: Direction, id: TransferId, name: &str, size: Option<u64>) {
        match size {
            Some(size) => self.line(&format!("START {} id={} name={:?} size={}", dir, id, name, size)),
            None => self.line(&format!("START {} id={} name={:?}", dir, id, name)),
        }
    }
    fn transfer_done(&self, dir: Direction, id: TransferId, name: &str, bytes: u64) {
        self.line(&format!("DONE {} id={} name={:?} bytes={}", dir, id, name, bytes));
    }
    fn transfer_cancelled(&self, dir: Direction, id: TransferId, name: &str) {
        self.line(&format!("CANCEL {} id={} name={:?}", dir, id, name));
    }
    fn error(&self, kind: &str, msg: &str) {
        self.line(&format!("ERROR kind={} msg={:?}", kind, msg));
    }
    fn closed(&self, reason: Option<&str>) {
        self.line(&format!("CLOSE reason={:?}", reason.unwrap_or("")));
    }
}
