//! Best-effort progress inference from dump tool output.

/// Turns lines of tool output into a completion percentage.
pub trait ProgressSource: Send {
    /// Feed one output line. Returns the new percentage when it moved.
    fn observe(&mut self, line: &str) -> Option<i64>;
}

/// Highest percentage a running unit may report; 100 is reserved for the
/// terminal status.
pub const RUNNING_CAP: i64 = 99;

const TABLE_MARKER: &str = "-- Retrieving table structure for table";

/// Counts the tables `mysqldump --verbose` announces against the table count
/// queried before the dump.
pub struct TableCountProgress {
    total: u64,
    seen: u64,
    last: i64,
}

impl TableCountProgress {
    pub fn new(total: u64) -> Self {
        Self { total, seen: 0, last: 0 }
    }
}

impl ProgressSource for TableCountProgress {
    fn observe(&mut self, line: &str) -> Option<i64> {
        if self.total == 0 || !line.contains(TABLE_MARKER) {
            return None;
        }
        self.seen += 1;
        let pct = ((self.seen * 100) / self.total) as i64;
        let pct = pct.min(RUNNING_CAP);
        if pct > self.last {
            self.last = pct;
            Some(pct)
        } else {
            None
        }
    }
}

/// Advances one point every `step` lines. Used where the tool gives no
/// countable markers (binlog replay output).
pub struct LineCountProgress {
    step: u64,
    lines: u64,
    last: i64,
}

impl LineCountProgress {
    pub fn new(step: u64) -> Self {
        Self {
            step: step.max(1),
            lines: 0,
            last: 0,
        }
    }
}

impl ProgressSource for LineCountProgress {
    fn observe(&mut self, _line: &str) -> Option<i64> {
        self.lines += 1;
        let pct = ((self.lines / self.step) as i64).min(RUNNING_CAP);
        if pct > self.last {
            self.last = pct;
            Some(pct)
        } else {
            None
        }
    }
}
