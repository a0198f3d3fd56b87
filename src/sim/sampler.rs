//! Sampling targets and record encoding
//!
//! The sampler walks the compartment hierarchy at every readout and
//! emits one record per output-visible compartment: time, step count,
//! pending wait-list total and the visible species populations in
//! declaration order. Where those records go (memory, delimited text,
//! fixed-width binary) is a [`SamplerTarget`] implementation. File
//! management (lazy opening, handle limits) belongs to the caller; the
//! target trait is the boundary.

use crate::model::TypeId;
use crate::Population;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Readout encoding selection, as carried by the simulation config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Delimited text, comma
    Csv,
    /// Delimited text, tab
    Tsv,
    /// Fixed-width binary: f32 time, i32 counts
    Bin32,
    /// Fixed-width binary: f64 time, i64 counts
    Bin64,
}

impl OutputFormat {
    pub fn delimiter(&self) -> Option<char> {
        match self {
            OutputFormat::Csv => Some(','),
            OutputFormat::Tsv => Some('\t'),
            _ => None,
        }
    }
}

/// Which of the optional leading columns a target writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleColumns {
    pub time: bool,
    pub steps: bool,
    pub wait_total: bool,
}

impl Default for SampleColumns {
    fn default() -> Self {
        Self {
            time: true,
            steps: true,
            wait_total: true,
        }
    }
}

/// One sampled record for one compartment.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub time: f64,
    pub steps: u64,
    /// Instantiation index of the sampled compartment
    pub compartment: u64,
    pub ctype: TypeId,
    /// Total molecules pending on the compartment's wait list
    pub wait_total: Population,
    /// Output-visible populations in declaration order
    pub populations: Vec<Population>,
}

/// Destination for sampled records.
pub trait SamplerTarget {
    /// Write one compartment's record.
    fn write_sample(&mut self, record: &SampleRecord);
    /// Called once all compartments of a sample point are written.
    fn end_sample(&mut self) {}
}

/// In-memory target; the natural choice for tests and analysis.
///
/// Records accumulate behind a shared handle, so they stay reachable
/// after the target itself is boxed into the simulation.
#[derive(Debug, Default, Clone)]
pub struct MemoryTarget {
    records: std::rc::Rc<std::cell::RefCell<Vec<SampleRecord>>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the accumulated records.
    pub fn records(&self) -> std::rc::Rc<std::cell::RefCell<Vec<SampleRecord>>> {
        std::rc::Rc::clone(&self.records)
    }
}

impl SamplerTarget for MemoryTarget {
    fn write_sample(&mut self, record: &SampleRecord) {
        self.records.borrow_mut().push(record.clone());
    }
}

/// Delimited-text target (CSV/TSV), one row per record.
///
/// Write errors are latched into `last_error` rather than propagated:
/// sampling happens inside the driver loop, which is infallible by
/// design.
pub struct DelimitedTextTarget<W: Write> {
    writer: W,
    delimiter: char,
    columns: SampleColumns,
    wrote_header: bool,
    header: Option<Vec<String>>,
    pub last_error: Option<std::io::Error>,
}

impl<W: Write> DelimitedTextTarget<W> {
    pub fn new(writer: W, delimiter: char, columns: SampleColumns) -> Self {
        Self {
            writer,
            delimiter,
            columns,
            wrote_header: true,
            header: None,
            last_error: None,
        }
    }

    /// As `new`, but emits a header row of the given species names (plus
    /// the enabled leading columns) before the first record.
    pub fn with_header(
        writer: W,
        delimiter: char,
        columns: SampleColumns,
        species_names: Vec<String>,
    ) -> Self {
        Self {
            writer,
            delimiter,
            columns,
            wrote_header: false,
            header: Some(species_names),
            last_error: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_row(&mut self, fields: Vec<String>) {
        let line = fields.join(&self.delimiter.to_string());
        if let Err(e) = writeln!(self.writer, "{}", line) {
            self.last_error = Some(e);
        }
    }
}

impl<W: Write> SamplerTarget for DelimitedTextTarget<W> {
    fn write_sample(&mut self, record: &SampleRecord) {
        if !self.wrote_header {
            self.wrote_header = true;
            let mut fields = Vec::new();
            if self.columns.time {
                fields.push("Time".to_string());
            }
            if self.columns.steps {
                fields.push("Step Count".to_string());
            }
            if self.columns.wait_total {
                fields.push("Wait List Size".to_string());
            }
            if let Some(names) = self.header.take() {
                fields.extend(names);
            }
            self.write_row(fields);
        }
        let mut fields = Vec::new();
        if self.columns.time {
            fields.push(format!("{}", record.time));
        }
        if self.columns.steps {
            fields.push(format!("{}", record.steps));
        }
        if self.columns.wait_total {
            fields.push(format!("{}", record.wait_total));
        }
        for p in &record.populations {
            fields.push(format!("{}", p));
        }
        self.write_row(fields);
    }
}

/// Fixed-width binary target. `wide` selects f64/i64 records over
/// f32/i32. Little-endian throughout.
pub struct BinaryTarget<W: Write> {
    writer: W,
    wide: bool,
    columns: SampleColumns,
    pub last_error: Option<std::io::Error>,
}

impl<W: Write> BinaryTarget<W> {
    pub fn new(writer: W, wide: bool, columns: SampleColumns) -> Self {
        Self {
            writer,
            wide,
            columns,
            last_error: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn put_f(&mut self, v: f64) {
        let res = if self.wide {
            self.writer.write_all(&v.to_le_bytes())
        } else {
            self.writer.write_all(&(v as f32).to_le_bytes())
        };
        if let Err(e) = res {
            self.last_error = Some(e);
        }
    }

    fn put_i(&mut self, v: i64) {
        let res = if self.wide {
            self.writer.write_all(&v.to_le_bytes())
        } else {
            self.writer.write_all(&(v as i32).to_le_bytes())
        };
        if let Err(e) = res {
            self.last_error = Some(e);
        }
    }
}

impl<W: Write> SamplerTarget for BinaryTarget<W> {
    fn write_sample(&mut self, record: &SampleRecord) {
        if self.columns.time {
            self.put_f(record.time);
        }
        if self.columns.steps {
            self.put_i(record.steps as i64);
        }
        if self.columns.wait_total {
            self.put_i(record.wait_total);
        }
        for &p in &record.populations {
            self.put_i(p);
        }
    }
}
