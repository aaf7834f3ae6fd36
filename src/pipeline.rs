// ========================================================================================
//
//                              THE RUN ORCHESTRATOR
//
// ========================================================================================
//
// One run moves through a fixed sequence of phases:
//
// 1.  **Load:** check the input paths, load (and optionally rename) the distance matrix,
//     read the VCF header and line the matrix up with the VCF samples. Every failure
//     here ends the run before any worker exists.
// 2.  **Publish:** freeze thresholds, matrix values and samples into a `GlobalState`.
// 3.  **Stream:** print the header, then push the VCF body through the worker pool and
//     write results in input order until the input ends or the run is cut short.

use crate::engine::{self, EngineError};
use crate::files::{FileError, quote, require_file};
use crate::matrix::{DistanceMatrix, MatrixError, load_name_mapping};
use crate::output::ResultWriter;
use crate::pool::{PoolError, PoolOutcome, WorkerCommand, WorkerPool};
use crate::types::{GlobalState, Settings};
use crate::vcf::{VcfError, VcfReader};
use crossbeam_channel::Receiver;
use log::{debug, info};
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// The two columns of a name mapping file.
#[derive(Clone, Debug)]
pub struct NameMapping {
    pub path: PathBuf,
    /// Column holding the names used in the distance matrix
    pub matrix_column: String,
    /// Column holding the names used in the VCF
    pub genotypes_column: String,
}

#[derive(Clone, Debug)]
pub struct RunConfig {
    pub distance_matrix: PathBuf,
    pub genotypes: PathBuf,
    pub name_mapping: Option<NameMapping>,
    pub settings: Settings,
    pub threads: usize,
    pub positions: bool,
    pub head: Option<u64>,
    pub worker: WorkerCommand,
}

/// How a run that did not hit an error ended.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// A record was rejected in strict mode.
    FatalSite(String),
    Interrupted,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error(transparent)]
    Vcf(#[from] VcfError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Pool(PoolError),
    #[error("Terminating due to broken pipe!")]
    BrokenPipe,
    #[error("Error writing results: {0}")]
    Output(io::Error),
}

impl From<io::Error> for RunError {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::BrokenPipe {
            RunError::BrokenPipe
        } else {
            RunError::Output(error)
        }
    }
}

impl From<PoolError> for RunError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Output(error) => error.into(),
            PoolError::Input(error) => RunError::Vcf(error),
            error => RunError::Pool(error),
        }
    }
}

/// Routes Ctrl-C into a channel the coordinator can wait on. Can only be installed once
/// per process.
pub fn interrupt_channel() -> Result<Receiver<()>, ctrlc::Error> {
    let (sender, receiver) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = sender.try_send(());
    })?;
    Ok(receiver)
}

fn load_matrix(config: &RunConfig) -> Result<DistanceMatrix, RunError> {
    info!("Loading distance matrix from {}", quote(&config.distance_matrix));
    let mut matrix = DistanceMatrix::load(&config.distance_matrix)?;
    info!("Loaded {0}x{0} distance matrix", matrix.len());

    if let Some(mapping) = &config.name_mapping {
        info!("Loading sample name mapping from {}", quote(&mapping.path));
        let names = load_name_mapping(
            &mapping.path,
            &mapping.matrix_column,
            &mapping.genotypes_column,
        )?;
        matrix.replace_names(&names)?;
    }

    Ok(matrix)
}

/// Runs the whole analysis, writing the result table to `out`.
pub fn run<W: Write>(
    config: &RunConfig,
    out: W,
    interrupts: &Receiver<()>,
) -> Result<RunOutcome, RunError> {
    require_file(&config.distance_matrix, "Distance matrix")?;
    require_file(&config.genotypes, "VCF file")?;
    require_file(&config.settings.script, "DBF R-script")?;
    if let Some(mapping) = &config.name_mapping {
        require_file(&mapping.path, "Name mapping")?;
    }

    let matrix = load_matrix(config)?;
    engine::ensure_not_live()?;

    info!("Opening VCF file {}", quote(&config.genotypes));
    let vcf = VcfReader::open(&config.genotypes)?;
    let samples = matrix.align_samples(vcf.samples())?;
    let names: Vec<String> = samples.iter().map(|sample| sample.name.clone()).collect();
    let values = matrix.flatten(&names)?;
    info!("Testing {} samples found in the VCF", samples.len());

    let state = GlobalState::new(config.settings.clone(), values, samples);
    let mut writer = ResultWriter::new(out, config.positions, config.head);
    writer.write_header()?;
    if writer.is_done() {
        writer.finish()?;
        return Ok(RunOutcome::Completed);
    }

    let threads = config.threads.max(1);
    debug!("Starting {threads} worker processes");
    let mut pool = WorkerPool::spawn(&config.worker, threads, &state)?;
    let outcome = pool.run(vcf.records(), interrupts, |delivery| writer.accept(delivery));
    drop(pool);

    let outcome = match outcome? {
        PoolOutcome::Exhausted | PoolOutcome::Stopped => RunOutcome::Completed,
        PoolOutcome::FatalSite(message) => RunOutcome::FatalSite(message),
        PoolOutcome::Interrupted => RunOutcome::Interrupted,
    };
    info!("Processed {} records", crate::output::with_separators(writer.processed()));
    writer.finish()?;

    Ok(outcome)
}
