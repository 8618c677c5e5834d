//! Results output formatting (CSV).

use std::io::Write;

use crate::error::Result;
use crate::loader::OutputSink;

/// Write a solution vector as CSV.
///
/// Format:
/// ```csv
/// Variable,Value
/// V(a),1.25
/// D1[1],1.1
/// ```
pub fn write_solution_csv<W: Write>(
    names: &[String],
    solution: &[f64],
    writer: &mut W,
) -> Result<()> {
    writeln!(writer, "Variable,Value")?;
    for (name, value) in names.iter().zip(solution) {
        writeln!(writer, "{},{}", name, value)?;
    }
    Ok(())
}

/// Homotopy progress as CSV, one row per accepted step.
///
/// Format:
/// ```csv
/// Step,VS,V(a),D1[1],...
/// 0,0.0,0.0,0.0
/// 1,0.5,0.2,0.1
/// ```
///
/// The header is written with the first row, once parameter and unknown
/// counts are known.
pub struct CsvHomotopyWriter<W: Write> {
    writer: W,
    unknowns: Vec<String>,
    rows: usize,
}

impl<W: Write> CsvHomotopyWriter<W> {
    pub fn new(writer: W, unknowns: Vec<String>) -> Self {
        Self {
            writer,
            unknowns,
            rows: 0,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> OutputSink for CsvHomotopyWriter<W> {
    fn output_homotopy(
        &mut self,
        names: &[String],
        values: &[f64],
        solution: &[f64],
    ) -> Result<()> {
        if self.rows == 0 {
            write!(self.writer, "Step")?;
            for name in names {
                write!(self.writer, ",{}", name)?;
            }
            for (i, _) in solution.iter().enumerate() {
                match self.unknowns.get(i) {
                    Some(name) => write!(self.writer, ",{}", name)?,
                    None => write!(self.writer, ",x{}", i)?,
                }
            }
            writeln!(self.writer)?;
        }

        write!(self.writer, "{}", self.rows)?;
        for v in values.iter().chain(solution) {
            write!(self.writer, ",{}", v)?;
        }
        writeln!(self.writer)?;
        self.rows += 1;
        Ok(())
    }
}
