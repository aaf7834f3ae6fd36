// ========================================================================================
//
//                         THE COMMAND LINE FRONT END: DBF-TEST
//
// ========================================================================================
//
// The binary has two faces. Started normally it parses the command line and runs the
// coordinator; started with the hidden worker argument it becomes one of the
// coordinator's worker processes and talks JSON over stdin/stdout.

use clap::Parser;
use dbf_test::engine::RscriptEngine;
use dbf_test::pipeline::{self, NameMapping, RunConfig, RunOutcome};
use dbf_test::pool::WorkerCommand;
use dbf_test::types::Settings;
use dbf_test::worker::{self, WORKER_ARG};
use env_logger::Env;
use log::{debug, error, warn};
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser, Debug)]
#[command(
    name = "dbf-test",
    version,
    about = "Distance-based F tests between a sample distance matrix and VCF genotypes."
)]
struct Args {
    /// Number of worker processes.
    #[arg(long, value_name = "N", default_value_t = 1)]
    threads: usize,

    /// Comma-separated sample-by-sample distance matrix.
    #[arg(long, value_name = "CSV")]
    distance_matrix: PathBuf,

    /// VCF with MAF and R2 in INFO and GT in FORMAT; may be gzip compressed.
    #[arg(long, value_name = "VCF")]
    genotypes: PathBuf,

    /// R script defining `DBF.test`.
    #[arg(long, value_name = "PATH", env = "DBF_TEST_SCRIPT", default_value = "DBF_test.R")]
    dbf_test_script: PathBuf,

    /// R interpreter used to run the script.
    #[arg(long, value_name = "PATH", env = "DBF_RSCRIPT", default_value = "Rscript")]
    rscript: PathBuf,

    /// CSV file mapping distance matrix names to VCF names.
    #[arg(long, value_name = "CSV")]
    name_mapping: Option<PathBuf>,

    /// Name mapping column with the names used in the distance matrix.
    #[arg(long, value_name = "COL", default_value = "SampleID")]
    name_column_matrix: String,

    /// Name mapping column with the names used in the VCF.
    #[arg(long, value_name = "COL", default_value = "IND_ID")]
    name_column_genotypes: String,

    /// Drop invalid sites instead of terminating.
    #[arg(long)]
    permissive: bool,

    /// Only test sites with R2 above this value.
    #[arg(long, value_name = "R2", default_value_t = 0.4)]
    min_r2: f64,

    /// Only test sites with MAF at or above this value.
    #[arg(long, value_name = "MAF", default_value_t = 0.01)]
    min_maf: f64,

    /// Include CHROM and POS columns in the output.
    #[arg(long)]
    positions: bool,

    /// Only output the first N results.
    #[arg(long, value_name = "N")]
    head: Option<u64>,
}

impl Args {
    fn into_config(self, worker: WorkerCommand) -> RunConfig {
        let name_mapping = self.name_mapping.map(|path| NameMapping {
            path,
            matrix_column: self.name_column_matrix,
            genotypes_column: self.name_column_genotypes,
        });

        RunConfig {
            distance_matrix: self.distance_matrix,
            genotypes: self.genotypes,
            name_mapping,
            settings: Settings {
                permissive: self.permissive,
                min_r2: self.min_r2,
                min_maf: self.min_maf,
                script: self.dbf_test_script,
                rscript: self.rscript,
            },
            threads: self.threads.max(1),
            positions: self.positions,
            head: self.head,
            worker,
        }
    }
}

fn init_logging() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
}

// ========================================================================================
//                                   ENTRY POINTS
// ========================================================================================

fn main() -> ExitCode {
    if std::env::args_os().nth(1).is_some_and(|arg| arg == WORKER_ARG) {
        return worker_main();
    }

    let args = Args::parse();
    init_logging();

    let worker = match WorkerCommand::current_exe() {
        Ok(worker) => worker,
        Err(e) => {
            error!("Could not locate the dbf-test executable: {e}");
            return ExitCode::FAILURE;
        }
    };
    let interrupts = match pipeline::interrupt_channel() {
        Ok(interrupts) => interrupts,
        Err(e) => {
            error!("Could not install interrupt handler: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = args.into_config(worker);
    let out = BufWriter::new(io::stdout().lock());

    match pipeline::run(&config, out, &interrupts) {
        Ok(RunOutcome::Completed) => ExitCode::SUCCESS,
        Ok(RunOutcome::FatalSite(message)) => {
            error!("{message}; terminating, use --permissive to filter such sites");
            ExitCode::FAILURE
        }
        Ok(RunOutcome::Interrupted) => {
            warn!("Interrupted by user!");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Serves the coordinator over stdin/stdout. Interrupts are the coordinator's business.
fn worker_main() -> ExitCode {
    init_logging();
    if let Err(e) = ctrlc::set_handler(|| {}) {
        debug!("Could not mask interrupts in worker: {e}");
    }

    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    match worker::serve(stdin, stdout, RscriptEngine::start) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // The coordinator reports failures it was told about.
            debug!("Worker {} stopped: {e}", std::process::id());
            ExitCode::FAILURE
        }
    }
}
