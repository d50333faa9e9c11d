//! Detection engines.
//!
//! Each engine owns its state and consumes its own fan-out queue:
//! - [`StreamAggregator`]: time windows scored by a model ensemble
//! - [`BatchScorer`]: per-packet rows scored in fixed-size batches

pub mod aggregate;
pub mod batch;
pub mod summary;
pub mod transform;

use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ReportTarget;

pub use aggregate::{AggregateOutcome, AggregateStats, StreamAggregator, WindowReport};
pub use batch::{BatchReport, BatchScorer, BatchStats};
pub use transform::{PacketTransform, COLUMNS, PACKET_FEATURES};

/// Line-oriented report output
pub struct ReportSink {
    writer: Box<dyn Write + Send>,
}

impl ReportSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self { writer }
    }

    /// Open the configured target; files are appended to
    pub fn open(target: &ReportTarget) -> io::Result<Self> {
        let writer: Box<dyn Write + Send> = match target {
            ReportTarget::Stdout => Box::new(io::stdout()),
            ReportTarget::File(path) => {
                Box::new(OpenOptions::new().create(true).append(true).open(path)?)
            }
        };
        Ok(Self::new(writer))
    }

    /// Write one report and flush. Failures are logged, never fatal.
    pub fn emit(&mut self, report: &impl Display) {
        let result = writeln!(self.writer, "{report}").and_then(|_| self.writer.flush());
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to write report");
        }
    }
}

/// In-memory writer that can be inspected while an engine owns the sink
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn sink(&self) -> ReportSink {
        ReportSink::new(Box::new(self.clone()))
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
