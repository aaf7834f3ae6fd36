// ========================================================================================
//
//                     SITE PARSING, FILTERING AND GENOTYPE ENCODING
//
// ========================================================================================
//
// Runs inside the worker processes, one VCF record at a time. A record either yields a
// `ResultRecord` (tested or not) or is rejected with a `SiteError`; what happens to a
// rejected record is decided by the caller according to the error policy.

use crate::engine::{EngineError, StatisticalEngine};
use crate::types::{GlobalState, GroupLabel, ResultRecord, SiteInfo, UNTESTED_P_VALUE};
use itertools::Itertools;
use std::fmt;
use thiserror::Error;

/// CHROM, POS, ID, REF, ALT, QUAL, FILTER, INFO, FORMAT.
const FIXED_COLUMNS: usize = 9;
const INFO_COLUMN: usize = 7;
const FORMAT_COLUMN: usize = 8;

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("Too few columns: found {0}")]
    TooFewColumns(usize),
    #[error("Invalid position: {0:?}")]
    InvalidPosition(String),
    #[error("Invalid INFO field: {0:?}")]
    InvalidInfo(String),
    #[error("Missing MAF or R2: {0:?}")]
    MissingInfo(String),
    #[error("No GT field in FORMAT column: {0:?}")]
    MissingGenotypeField(String),
    #[error("Missing genotype column for {0}")]
    MissingSample(String),
    #[error("Bad genotype for {sample}: {value:?}")]
    BadGenotype { sample: String, value: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A record that could not be evaluated, with enough of it to point the user at it.
#[derive(Debug)]
pub struct RejectedSite {
    pub chrom: String,
    pub pos: String,
    pub id: String,
    pub error: SiteError,
}

impl RejectedSite {
    /// Whether later records can still be evaluated by the same engine.
    pub fn is_recoverable(&self) -> bool {
        match &self.error {
            SiteError::Engine(error) => error.is_recoverable(),
            _ => true,
        }
    }
}

impl fmt::Display for RejectedSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {}:{} ({})",
            self.error, self.chrom, self.pos, self.id
        )
    }
}

impl std::error::Error for RejectedSite {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Maps a GT value to the number of copies of the second allele. Only unambiguous
/// diploid calls are accepted; missing calls and multi-allelic values are not.
pub fn encode_genotype(value: &str) -> Option<GroupLabel> {
    match value {
        "0|0" | "0/0" => Some(0),
        "0|1" | "1|0" | "0/1" | "1/0" => Some(1),
        "1|1" | "1/1" => Some(2),
        _ => None,
    }
}

fn split_fields(line: &str) -> Vec<&str> {
    let mut fields = Vec::with_capacity(FIXED_COLUMNS + 16);
    let mut start = 0;
    for end in memchr::memchr_iter(b'\t', line.as_bytes()) {
        fields.push(&line[start..end]);
        start = end + 1;
    }
    fields.push(&line[start..]);
    fields
}

fn parse_f64(text: &str) -> Option<f64> {
    lexical_core::parse::<f64>(text.as_bytes()).ok()
}

/// Reads `MAF=` and `R2=` from a `;`-separated INFO field. Later occurrences win.
pub fn parse_info(field: &str) -> Result<SiteInfo, SiteError> {
    let invalid = || SiteError::InvalidInfo(field.to_string());
    let mut maf = None;
    let mut r2 = None;

    for token in field.split(';') {
        if let Some(value) = token.strip_prefix("MAF=") {
            maf = Some(parse_f64(value).ok_or_else(invalid)?);
        } else if let Some(value) = token.strip_prefix("R2=") {
            r2 = Some(parse_f64(value).ok_or_else(invalid)?);
        }
    }

    match (maf, r2) {
        (Some(maf), Some(r2)) => Ok(SiteInfo { maf, r2 }),
        _ => Err(SiteError::MissingInfo(field.to_string())),
    }
}

/// Group labels for every aligned sample, in aligned order.
fn encode_samples(state: &GlobalState, fields: &[&str]) -> Result<Vec<GroupLabel>, SiteError> {
    let format = fields[FORMAT_COLUMN];
    let gt_index = format
        .split(':')
        .position(|name| name == "GT")
        .ok_or_else(|| SiteError::MissingGenotypeField(format.to_string()))?;

    state
        .samples()
        .iter()
        .map(|sample| {
            let column = fields
                .get(sample.column)
                .ok_or_else(|| SiteError::MissingSample(sample.name.clone()))?;
            let value = column.splitn(gt_index + 2, ':').nth(gt_index).unwrap_or("");

            encode_genotype(value).ok_or_else(|| SiteError::BadGenotype {
                sample: sample.name.clone(),
                value: value.to_string(),
            })
        })
        .collect()
}

fn a2_frequency(labels: &[GroupLabel]) -> f64 {
    let copies: u64 = labels.iter().map(|&label| u64::from(label)).sum();
    copies as f64 / (2 * labels.len()) as f64
}

/// Parses one raw VCF record and, if it passes the R2/MAF thresholds and splits
/// the samples into at least two genotype groups, runs the engine on it.
pub fn evaluate_site(
    state: &GlobalState,
    line: &str,
    engine: &mut dyn StatisticalEngine,
) -> Result<ResultRecord, RejectedSite> {
    let fields = split_fields(line.trim_end());

    evaluate_fields(state, &fields, engine).map_err(|error| {
        let field = |index: usize| fields.get(index).copied().unwrap_or("?").to_string();
        RejectedSite {
            chrom: field(0),
            pos: field(1),
            id: field(2),
            error,
        }
    })
}

fn evaluate_fields(
    state: &GlobalState,
    fields: &[&str],
    engine: &mut dyn StatisticalEngine,
) -> Result<ResultRecord, SiteError> {
    if fields.len() < FIXED_COLUMNS {
        return Err(SiteError::TooFewColumns(fields.len()));
    }

    let pos = fields[1]
        .parse::<u64>()
        .map_err(|_| SiteError::InvalidPosition(fields[1].to_string()))?;
    let info = parse_info(fields[INFO_COLUMN])?;
    let settings = state.settings();

    let mut a2_freq = None;
    let mut statistic = None;
    let mut p_value = UNTESTED_P_VALUE;

    if info.r2 > settings.min_r2 && info.maf >= settings.min_maf {
        let labels = encode_samples(state, fields)?;
        if labels.iter().unique().count() > 1 {
            let outcome = engine.test(&labels)?;
            statistic = Some(outcome.statistic);
            p_value = outcome.p_value;
            a2_freq = Some(a2_frequency(&labels));
        }
    }

    Ok(ResultRecord {
        chrom: fields[0].to_string(),
        pos,
        id: fields[2].to_string(),
        a1: fields[3].to_string(),
        a2: fields[4].to_string(),
        a2_freq,
        all_maf: Some(info.maf),
        r2: Some(info.r2),
        statistic,
        p_value,
    })
}
