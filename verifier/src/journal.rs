//! Append-only run journal.
//!
//! One line per contract run:
//!
//! ```text
//! 2026-08-06T10:15:42.123Z>OK add_stake netuid=4 amount=512 passed
//! 2026-08-06T10:15:43.456Z>ERROR remove_stake postcondition: ...
//! ```
//!
//! Summaries are stripped of newlines so the journal stays greppable line by
//! line.

use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

pub struct RunJournal<W: Write = File> {
    sink: W,
}

impl RunJournal<File> {
    /// Open (or create) a journal file in append mode.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let sink = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { sink })
    }
}

impl<W: Write> RunJournal<W> {
    pub fn from_writer(sink: W) -> Self {
        Self { sink }
    }

    /// Record one run outcome. `ok` selects the OK/ERROR tag.
    pub fn record(&mut self, ok: bool, summary: &str) -> io::Result<()> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let tag = if ok { "OK" } else { "ERROR" };
        let flat = summary.replace(['\n', '\r'], " ");
        writeln!(self.sink, "{}>{} {}", timestamp, tag, flat)
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_tagged_and_newline_free() {
        let mut journal = RunJournal::from_writer(Vec::new());
        journal.record(true, "add_stake passed").unwrap();
        journal.record(false, "remove_stake\nfailed").unwrap();

        let text = String::from_utf8(journal.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(">OK add_stake passed"));
        assert!(lines[1].contains(">ERROR remove_stake failed"));
        // timestamp precedes the tag separator
        assert!(lines[0].split('>').next().unwrap().contains('T'));
    }

    #[test]
    fn appends_to_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.log");
        {
            let mut journal = RunJournal::open(&path).unwrap();
            journal.record(true, "first").unwrap();
        }
        {
            let mut journal = RunJournal::open(&path).unwrap();
            journal.record(false, "second").unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
