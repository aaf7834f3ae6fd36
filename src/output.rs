use crate::pool::{Delivery, Flow};
use crate::types::ResultRecord;
use log::info;
use std::io::{self, Write};

/// A progress notice is logged every this many processed records.
pub const PROGRESS_INTERVAL: u64 = 100_000;

const SITE_COLUMNS: [&str; 2] = ["CHROM", "POS"];
const RESULT_COLUMNS: [&str; 8] = ["SNP", "A1", "A2", "A2_FREQ", "ALL_MAF", "R2", "STAT", "P"];

/// Formats numbers with `,` between groups of three digits.
pub fn with_separators(value: u64) -> String {
    let digits = value.to_string();
    let mut text = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            text.push(',');
        }
        text.push(digit);
    }
    text
}

/// Writes `ryu` output with the exponent signed and at least two digits wide
/// (`1e-07`, `1e+20`).
fn write_float<W: Write>(out: &mut W, text: &str) -> io::Result<()> {
    let Some((mantissa, exponent)) = text.split_once('e') else {
        return out.write_all(text.as_bytes());
    };
    let (sign, digits) = match exponent.strip_prefix('-') {
        Some(digits) => ('-', digits),
        None => ('+', exponent),
    };
    write!(out, "{mantissa}e{sign}{digits:0>2}")
}

/// Writes the TSV result table: one header, then one row per tested site, up to an
/// optional cap.
pub struct ResultWriter<W: Write> {
    out: W,
    positions: bool,
    remaining: Option<u64>,
    processed: u64,
    float: ryu::Buffer,
}

impl<W: Write> ResultWriter<W> {
    pub fn new(out: W, positions: bool, head: Option<u64>) -> Self {
        Self {
            out,
            positions,
            remaining: head,
            processed: 0,
            float: ryu::Buffer::new(),
        }
    }

    pub fn write_header(&mut self) -> io::Result<()> {
        let columns: Vec<&str> = if self.positions {
            SITE_COLUMNS.iter().chain(&RESULT_COLUMNS).copied().collect()
        } else {
            RESULT_COLUMNS.to_vec()
        };
        writeln!(self.out, "{}", columns.join("\t"))
    }

    /// True once the cap has been reached; nothing more will be written.
    pub fn is_done(&self) -> bool {
        self.remaining == Some(0)
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Counts one processed record and writes it if it was tested.
    pub fn accept(&mut self, delivery: Delivery) -> io::Result<Flow> {
        let index = self.processed;
        self.processed += 1;

        if index > 0 && index % PROGRESS_INTERVAL == 0 {
            let id = match &delivery {
                Delivery::Site(record) => record.id.as_str(),
                Delivery::Dropped { id } => id.as_str(),
            };
            info!(
                "Processed {} records; now at position {id}",
                with_separators(index)
            );
        }

        let Delivery::Site(record) = delivery else {
            return Ok(Flow::Continue);
        };
        if record.statistic.is_none() || self.is_done() {
            return Ok(Flow::Continue);
        }

        self.write_row(&record)?;
        match &mut self.remaining {
            Some(remaining) => {
                *remaining -= 1;
                Ok(if *remaining == 0 { Flow::Stop } else { Flow::Continue })
            }
            None => Ok(Flow::Continue),
        }
    }

    fn write_row(&mut self, record: &ResultRecord) -> io::Result<()> {
        if self.positions {
            write!(self.out, "{}\t{}\t", record.chrom, record.pos)?;
        }
        write!(self.out, "{}\t{}\t{}", record.id, record.a1, record.a2)?;

        let values = [
            record.a2_freq,
            record.all_maf,
            record.r2,
            record.statistic,
            Some(record.p_value),
        ];
        for value in values {
            self.out.write_all(b"\t")?;
            match value {
                // R's NA arrives as NaN.
                Some(value) if !value.is_nan() => {
                    write_float(&mut self.out, self.float.format(value))?;
                }
                _ => self.out.write_all(b"NA")?,
            }
        }

        self.out.write_all(b"\n")
    }

    /// Flushes and hands back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, statistic: Option<f64>) -> ResultRecord {
        ResultRecord {
            chrom: "2".into(),
            pos: 1234,
            id: id.into(),
            a1: "C".into(),
            a2: "T".into(),
            a2_freq: Some(0.25),
            all_maf: Some(0.3),
            r2: None,
            statistic,
            p_value: 0.001,
        }
    }

    fn text(writer: ResultWriter<Vec<u8>>) -> String {
        String::from_utf8(writer.finish().unwrap()).unwrap()
    }

    #[test]
    fn separators_group_thousands() {
        assert_eq!(with_separators(0), "0");
        assert_eq!(with_separators(999), "999");
        assert_eq!(with_separators(100_000), "100,000");
        assert_eq!(with_separators(1_234_567), "1,234,567");
    }

    #[test]
    fn header_optionally_includes_positions() {
        let mut writer = ResultWriter::new(Vec::new(), false, None);
        writer.write_header().unwrap();
        assert_eq!(text(writer), "SNP\tA1\tA2\tA2_FREQ\tALL_MAF\tR2\tSTAT\tP\n");

        let mut writer = ResultWriter::new(Vec::new(), true, None);
        writer.write_header().unwrap();
        assert_eq!(
            text(writer),
            "CHROM\tPOS\tSNP\tA1\tA2\tA2_FREQ\tALL_MAF\tR2\tSTAT\tP\n"
        );
    }

    #[test]
    fn rows_use_na_for_missing_values() {
        let mut writer = ResultWriter::new(Vec::new(), true, None);
        writer.accept(Delivery::Site(record("rs1", Some(12.5)))).unwrap();
        assert_eq!(
            text(writer),
            "2\t1234\trs1\tC\tT\t0.25\t0.3\tNA\t12.5\t0.001\n"
        );
    }

    #[test]
    fn exponents_are_padded_and_nan_is_na() {
        let mut writer = ResultWriter::new(Vec::new(), false, None);
        let mut site = record("rs1", Some(f64::NAN));
        site.a2_freq = Some(1e20);
        site.p_value = 2.5e-8;
        writer.accept(Delivery::Site(site)).unwrap();
        assert_eq!(text(writer), "rs1\tC\tT\t1e+20\t0.3\tNA\tNA\t2.5e-08\n");

        let mut out = Vec::new();
        write_float(&mut out, "1e-123").unwrap();
        out.push(b' ');
        write_float(&mut out, "-inf").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1e-123 -inf");
    }

    #[test]
    fn untested_and_dropped_sites_are_counted_but_not_written() {
        let mut writer = ResultWriter::new(Vec::new(), false, None);
        writer.accept(Delivery::Site(record("rs1", None))).unwrap();
        writer.accept(Delivery::Dropped { id: "rs2".into() }).unwrap();
        writer.accept(Delivery::Site(record("rs3", Some(1.0)))).unwrap();

        assert_eq!(writer.processed(), 3);
        assert_eq!(text(writer), "rs3\tC\tT\t0.25\t0.3\tNA\t1.0\t0.001\n");
    }

    #[test]
    fn cap_counts_written_rows_only() {
        let mut writer = ResultWriter::new(Vec::new(), false, Some(2));
        assert!(!writer.is_done());

        let flows: Vec<Flow> = [
            record("rs1", Some(1.0)),
            record("rs2", None),
            record("rs3", Some(3.0)),
        ]
        .into_iter()
        .map(|record| writer.accept(Delivery::Site(record)).unwrap())
        .collect();

        assert_eq!(flows, [Flow::Continue, Flow::Continue, Flow::Stop]);
        assert!(writer.is_done());
        let late = writer.accept(Delivery::Site(record("rs4", Some(4.0)))).unwrap();
        assert_eq!(late, Flow::Continue);

        let output = text(writer);
        assert_eq!(output.lines().count(), 2);
        assert!(!output.contains("rs4"));
    }

    #[test]
    fn zero_cap_is_done_immediately() {
        let writer = ResultWriter::new(Vec::new(), false, Some(0));
        assert!(writer.is_done());
    }

    #[test]
    fn broken_pipes_surface_as_errors() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut writer = ResultWriter::new(Closed, false, None);
        let error = writer.accept(Delivery::Site(record("rs1", Some(1.0)))).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
    }
}
