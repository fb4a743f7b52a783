//! Append-only CSV trace of (time, PV, SP, u).
//!
//! Rows buffer in memory and flush in append mode once the buffer reaches
//! the configured threshold; the file handle is opened per flush. The CSV
//! is a convenience trace, so flush failures warn and drop the batch
//! rather than stall the control path.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use log::warn;

pub(crate) struct Row {
    pub time: DateTime<Utc>,
    pub pv: f64,
    pub sp: f64,
    pub u: f64,
}

pub(crate) struct Trace {
    path: Option<PathBuf>,
    rows: Vec<Row>,
    flush_rows: usize,
    header_written: bool,
    rows_total: u64,
}

impl Trace {
    /// One file per loop lifetime, named from the start timestamp.
    pub fn new(dir: Option<&Path>, flush_rows: usize, started: DateTime<Utc>) -> Self {
        let path = dir.map(|d| d.join(format!("pidloop_{}.csv", started.format("%Y%m%dT%H%M%SZ"))));
        Self {
            path,
            rows: Vec::new(),
            flush_rows,
            header_written: false,
            rows_total: 0,
        }
    }

    pub fn rows_total(&self) -> u64 {
        self.rows_total
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
        self.rows_total += 1;
        if self.rows.len() >= self.flush_rows {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let Some(path) = &self.path else {
            self.rows.clear();
            return;
        };
        let mut file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => f,
            Err(err) => {
                warn!(
                    "trace flush to {} failed ({err}); dropping {} rows",
                    path.display(),
                    self.rows.len()
                );
                self.rows.clear();
                return;
            }
        };
        let mut out = String::new();
        if !self.header_written {
            // Only a brand-new file gets the header.
            if file.metadata().map(|m| m.len() == 0).unwrap_or(true) {
                out.push_str("time,pv,sp,u\n");
            }
            self.header_written = true;
        }
        for row in &self.rows {
            out.push_str(&format!(
                "{},{:.6},{:.6},{:.6}\n",
                row.time.to_rfc3339_opts(SecondsFormat::Millis, true),
                row.pv,
                row.sp,
                row.u
            ));
        }
        if let Err(err) = file.write_all(out.as_bytes()) {
            warn!("trace write to {} failed: {err}", path.display());
        }
        self.rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(s: i64) -> Row {
        Row {
            time: Utc.timestamp_opt(1_760_000_000 + s, 0).unwrap(),
            pv: 99.5,
            sp: 100.0,
            u: 1.0,
        }
    }

    #[test]
    fn flushes_at_the_threshold_with_one_header() {
        let dir = std::env::temp_dir().join(format!("pidloop-trace-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let started = Utc.timestamp_opt(1_760_000_000, 0).unwrap();
        let mut trace = Trace::new(Some(dir.as_path()), 3, started);
        for s in 0..7 {
            trace.push(row(s));
        }
        trace.flush();

        let path = dir.join(format!("pidloop_{}.csv", started.format("%Y%m%dT%H%M%SZ")));
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 8, "header plus seven rows: {text}");
        assert_eq!(lines[0], "time,pv,sp,u");
        assert_eq!(text.matches("time,pv,sp,u").count(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn without_a_directory_rows_are_counted_but_not_persisted() {
        let mut trace = Trace::new(None, 2, Utc::now());
        for s in 0..5 {
            trace.push(row(s));
        }
        trace.flush();
        assert_eq!(trace.rows_total(), 5);
    }
}
