// ========================================================================================
//
//                              THE WORKER PROCESS
//
// ========================================================================================
//
// A worker is the same executable started with `WORKER_ARG` as its only argument. It
// reads its `GlobalState` from the first line on stdin, builds its engine before the
// first record of the first chunk, and then answers chunks until stdin is closed.

use crate::engine::{EngineError, EngineState, StatisticalEngine};
use crate::protocol::{self, Outcome, ProtocolError, Reply, Request};
use crate::site::evaluate_site;
use crate::types::GlobalState;
use log::{debug, warn};
use std::io::{BufRead, Write};
use thiserror::Error;

/// Hidden first argument selecting worker mode.
pub const WORKER_ARG: &str = "__worker";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Unexpected request from coordinator: {0}")]
    UnexpectedRequest(&'static str),
    #[error("{0}")]
    Failed(String),
}

/// Evaluates every record of a chunk. In strict mode the first rejected record ends
/// the chunk with a fatal outcome. A rejection that leaves the engine unusable is
/// returned as an error regardless of the policy.
pub fn process_chunk(
    state: &GlobalState,
    records: &[String],
    engine: &mut dyn StatisticalEngine,
) -> Result<Vec<Outcome>, String> {
    let permissive = state.settings().permissive;
    let mut outcomes = Vec::with_capacity(records.len());

    for line in records {
        match evaluate_site(state, line, engine) {
            Ok(record) => outcomes.push(Outcome::Reported(record)),
            Err(rejected) if !rejected.is_recoverable() => return Err(rejected.to_string()),
            Err(rejected) if permissive => {
                warn!("{rejected}");
                outcomes.push(Outcome::Dropped { id: rejected.id });
            }
            Err(rejected) => {
                outcomes.push(Outcome::Fatal(rejected.to_string()));
                break;
            }
        }
    }

    Ok(outcomes)
}

/// Serves one coordinator. `launch` builds the engine and is called at most once.
pub fn serve<R, W, E, F>(mut input: R, mut output: W, mut launch: F) -> Result<(), WorkerError>
where
    R: BufRead,
    W: Write,
    E: StatisticalEngine,
    F: FnMut(&GlobalState) -> Result<E, EngineError>,
{
    let mut line = String::new();
    let state = match protocol::read_message(&mut input, &mut line)? {
        Some(Request::Init(state)) => state,
        Some(Request::Chunk { .. }) => {
            return Err(WorkerError::UnexpectedRequest("chunk before init"));
        }
        None => return Ok(()),
    };
    debug!(
        "Worker {} received {} samples",
        std::process::id(),
        state.sample_count()
    );

    let mut engines = EngineState::new();
    while let Some(request) = protocol::read_message(&mut input, &mut line)? {
        let (seq, records) = match request {
            Request::Chunk { seq, records } => (seq, records),
            Request::Init(_) => return Err(WorkerError::UnexpectedRequest("second init")),
        };

        let result = match engines.get_or_init(|| launch(&state)) {
            Ok(engine) => process_chunk(&state, &records, engine),
            Err(error) => Err(error.to_string()),
        };

        match result {
            Ok(outcomes) => {
                protocol::write_message(&mut output, &Reply::Chunk { seq, outcomes })?;
            }
            Err(message) => {
                protocol::write_message(
                    &mut output,
                    &Reply::Failed {
                        message: message.clone(),
                    },
                )?;
                return Err(WorkerError::Failed(message));
            }
        }
    }

    debug!("Worker {} finished", std::process::id());
    Ok(())
}
