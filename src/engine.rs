// ========================================================================================
//
//                        THE STATISTICAL ENGINE: DBF.test IN R
//
// ========================================================================================
//
// The distance-based F test itself is computed by an R function, `DBF.test`, loaded
// from a user supplied script. The R interpreter is not safe to share between
// concurrent callers, so every worker process owns exactly one session, built on its
// first use and kept alive for as long as the worker runs.
//
// ### The Session Protocol ###
//
// The session is an `Rscript` child speaking a line protocol over its stdin/stdout:
//
// 1.  **Setup:** the sample count `n` on one line, then the `n * n` row-major matrix
//     values on the next. The driver builds the R matrix once and sources the script.
//     It answers `READY`, or `ERROR\t<message>`.
// 2.  **Tests:** one line of space separated group labels per site. The driver answers
//     `OK\t<statistic>\t<p-value>`, or `ERROR\t<message>` if `DBF.test` raised.

use crate::files::quote;
use crate::types::{GlobalState, GroupLabel};
use itertools::Itertools;
use log::debug;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// R code run by `Rscript -e`. The first trailing argument is the script to source.
const R_DRIVER: &str = r#"
.dbf_args <- commandArgs(trailingOnly = TRUE)
.dbf_in <- file("stdin", open = "r")
.dbf_out <- file("stdout", open = "w")
sink(stderr())
.dbf_reply <- function(text) {
    writeLines(text, .dbf_out)
    flush(.dbf_out)
}
.dbf_clean <- function(error) gsub("[\t\r\n]+", " ", conditionMessage(error))
.dbf_n <- as.integer(readLines(.dbf_in, n = 1))
.dbf_values <- scan(.dbf_in, what = double(), nlines = 1, quiet = TRUE)
.dbf_setup <- tryCatch({
    .dbf_matrix <- matrix(.dbf_values, nrow = .dbf_n, byrow = TRUE)
    source(.dbf_args[[1]])
    .dbf_test <- get("DBF.test", mode = "function")
    NULL
}, error = function(e) .dbf_clean(e))
if (!is.null(.dbf_setup)) {
    .dbf_reply(paste0("ERROR\t", .dbf_setup))
    quit(save = "no", status = 1)
}
.dbf_reply("READY")
repeat {
    .dbf_line <- readLines(.dbf_in, n = 1)
    if (length(.dbf_line) == 0) break
    .dbf_labels <- as.integer(strsplit(.dbf_line, " ", fixed = TRUE)[[1]])
    # The CRAN release of DBF.test reads `n` before assigning it
    assign("n", length(.dbf_labels), envir = globalenv())
    .dbf_reply(tryCatch({
        .dbf_result <- .dbf_test(.dbf_matrix, .dbf_labels, .dbf_n)
        sprintf("OK\t%.17g\t%.17g", .dbf_result[["dbf.statistic"]], .dbf_result[["dbf.p.value"]])
    }, error = function(e) paste0("ERROR\t", .dbf_clean(e))))
}
"#;

/// Whether an engine session is live in this process.
static ENGINE_LIVE: AtomicBool = AtomicBool::new(false);

/// Serializes unit tests that touch the process-wide liveness flag.
#[cfg(test)]
pub(crate) static ENGINE_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine initialized in main; multiprocessing is not possible")]
    AlreadyLive,
    #[error("engine not initialized in worker")]
    NotInitialized,
    #[error("Failed to start R interpreter {}: {source}", quote(.program))]
    Spawn { program: PathBuf, source: io::Error },
    #[error("Failed to load DBF.test: {0}")]
    Setup(String),
    #[error("Error running DBF.test: {0}")]
    Test(String),
    #[error("R interpreter exited unexpectedly")]
    Exited,
    #[error("Communication with R interpreter failed: {0}")]
    Io(#[from] io::Error),
    #[error("Unexpected reply from R interpreter: {0:?}")]
    Protocol(String),
}

impl EngineError {
    /// Errors raised by `DBF.test` itself affect a single site; everything else means
    /// the session is unusable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::Test(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TestOutcome {
    pub statistic: f64,
    pub p_value: f64,
}

/// A session bound to one distance matrix, testing one grouping of its samples per call.
pub trait StatisticalEngine {
    fn test(&mut self, labels: &[GroupLabel]) -> Result<TestOutcome, EngineError>;
}

pub fn is_live() -> bool {
    ENGINE_LIVE.load(Ordering::Acquire)
}

/// Fails if this process already hosts an engine, in which case forked-off
/// work cannot be isolated from it.
pub fn ensure_not_live() -> Result<(), EngineError> {
    if is_live() {
        Err(EngineError::AlreadyLive)
    } else {
        Ok(())
    }
}

/// Holds the liveness flag for as long as it exists.
struct LiveGuard(());

impl LiveGuard {
    fn acquire() -> Result<Self, EngineError> {
        ENGINE_LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| LiveGuard(()))
            .map_err(|_| EngineError::AlreadyLive)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        ENGINE_LIVE.store(false, Ordering::Release);
    }
}

struct Session<E> {
    engine: E,
    _guard: LiveGuard,
}

/// The per-process engine cache: built by the first call to `get_or_init`,
/// returned unchanged by every later call.
pub struct EngineState<E> {
    session: Option<Session<E>>,
}

impl<E: StatisticalEngine> Default for EngineState<E> {
    fn default() -> Self {
        Self { session: None }
    }
}

impl<E: StatisticalEngine> EngineState<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    pub fn get_or_init<F>(&mut self, init: F) -> Result<&mut E, EngineError>
    where
        F: FnOnce() -> Result<E, EngineError>,
    {
        if self.session.is_none() {
            let guard = LiveGuard::acquire()?;
            let engine = init()?;
            self.session = Some(Session {
                engine,
                _guard: guard,
            });
        } else if !is_live() {
            return Err(EngineError::NotInitialized);
        }

        match self.session.as_mut() {
            Some(session) => Ok(&mut session.engine),
            None => Err(EngineError::NotInitialized),
        }
    }
}

/// `DBF.test` evaluated by a long-running `Rscript` child process.
pub struct RscriptEngine {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    reply: String,
}

impl RscriptEngine {
    pub fn start(state: &GlobalState) -> Result<Self, EngineError> {
        let settings = state.settings();
        debug!(
            "Starting {} for {} samples",
            quote(&settings.rscript),
            state.sample_count()
        );

        let mut command = Command::new(&settings.rscript);
        command
            .arg("--vanilla")
            .arg("-e")
            .arg(R_DRIVER)
            .arg(&settings.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            program: settings.rscript.clone(),
            source,
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::Exited);
        };

        let mut engine = Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            reply: String::new(),
        };

        // A failed write most likely means the interpreter already gave up; its
        // reply, if any, explains why.
        let sent = engine.send_matrix(state.sample_count(), state.matrix_values());
        match engine.read_reply().map(str::to_string) {
            Ok(reply) if reply == "READY" => {
                sent?;
                Ok(engine)
            }
            Ok(reply) => match reply.split_once('\t') {
                Some(("ERROR", message)) => Err(EngineError::Setup(message.to_string())),
                _ => Err(EngineError::Protocol(reply.to_string())),
            },
            Err(error) => Err(sent.err().map(EngineError::Io).unwrap_or(error)),
        }
    }

    fn send_matrix(&mut self, n: usize, values: &[f64]) -> io::Result<()> {
        let mut buffer = ryu::Buffer::new();
        writeln!(self.stdin, "{n}")?;
        for (index, value) in values.iter().enumerate() {
            if index > 0 {
                self.stdin.write_all(b" ")?;
            }
            self.stdin.write_all(buffer.format(*value).as_bytes())?;
        }
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()
    }

    fn read_reply(&mut self) -> Result<&str, EngineError> {
        self.reply.clear();
        if self.stdout.read_line(&mut self.reply)? == 0 {
            return Err(EngineError::Exited);
        }

        Ok(self.reply.trim_end_matches(['\r', '\n']))
    }
}

impl StatisticalEngine for RscriptEngine {
    fn test(&mut self, labels: &[GroupLabel]) -> Result<TestOutcome, EngineError> {
        writeln!(self.stdin, "{}", labels.iter().join(" "))?;
        self.stdin.flush()?;

        parse_test_reply(self.read_reply()?)
    }
}

impl Drop for RscriptEngine {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Values printed by R's `sprintf("%.17g")`; `NA` has no f64 counterpart but NaN.
fn parse_r_float(text: &str) -> Option<f64> {
    match text {
        "NA" => Some(f64::NAN),
        _ => text.parse().ok(),
    }
}

fn parse_test_reply(reply: &str) -> Result<TestOutcome, EngineError> {
    let protocol_error = || EngineError::Protocol(reply.to_string());

    match reply.split_once('\t') {
        Some(("OK", values)) => {
            let (statistic, p_value) = values.split_once('\t').ok_or_else(protocol_error)?;
            Ok(TestOutcome {
                statistic: parse_r_float(statistic).ok_or_else(protocol_error)?,
                p_value: parse_r_float(p_value).ok_or_else(protocol_error)?,
            })
        }
        Some(("ERROR", message)) => Err(EngineError::Test(message.to_string())),
        _ => Err(protocol_error()),
    }
}
