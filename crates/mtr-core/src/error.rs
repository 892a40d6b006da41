//! Error taxonomy for the landscape evolution driver.
//!
//! Every failure is fatal for the scenario it occurs in; there is no
//! internal retry. `SimError` variants carry the scenario label, phase and
//! step so a failed run can be isolated and rerun on its own.
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Library-wide result alias.
pub type MtrResult<T> = Result<T, MtrError>;

/// Which half of the two-phase run a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Phase {
    Recovery,
    LongRun,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Recovery => "recovery",
            Phase::LongRun => "long-run",
            Phase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Invalid inputs or parameters. Raised before the first step runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("raster header in {source_name}: {message}")]
    RasterHeader { source_name: String, message: String },

    #[error("raster body in {source_name}, value {index}: {message}")]
    RasterBody {
        source_name: String,
        index: usize,
        message: String,
    },

    #[error("grid shape mismatch for {what}: expected {expected_rows}x{expected_cols}, got {rows}x{cols}")]
    ShapeMismatch {
        what: String,
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },

    #[error("no outlet found: no valid boundary cell borders a core cell")]
    NoOutlet,

    #[error("domain has no core cells")]
    EmptyDomain,

    #[error("time grid: {0}")]
    TimeGrid(String),

    #[error("unknown scenario preset {0:?} (expected recovery, control-mined or control-unmined)")]
    UnknownPreset(String),

    #[error("scenario {label} appears more than once; runs would share output files")]
    DuplicateScenario { label: String },

    #[error("forcing: {0}")]
    Forcing(String),

    #[error("erodibility field: {0}")]
    Erodibility(String),

    #[error("parameter {name} = {value}: {message}")]
    Parameter {
        name: &'static str,
        value: f64,
        message: String,
    },
}

/// Flow routing could not produce a drainage network.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("{unreached} core cells cannot drain to the outlet")]
    Unreachable { unreached: usize },

    #[error("non-finite elevation {value} at node {node}")]
    NonFinite { node: usize, value: f64 },
}

/// An erosion or diffusion kernel could not complete a step.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("{operator}: non-finite {quantity} {value} at node {node}")]
    NonFinite {
        operator: &'static str,
        quantity: &'static str,
        node: usize,
        value: f64,
    },

    #[error("{operator}: {what} has {actual} cells, grid has {expected}")]
    FieldLength {
        operator: &'static str,
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Failures raised while the time stepper is running.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("{scenario}: numerical instability in {phase} phase at step {step}: node {node} has {quantity} {value}")]
    NumericalInstability {
        scenario: String,
        phase: Phase,
        step: usize,
        node: usize,
        quantity: &'static str,
        value: f64,
    },

    #[error("{scenario}: flow routing failed in {phase} phase at step {step}")]
    Routing {
        scenario: String,
        phase: Phase,
        step: usize,
        #[source]
        source: RoutingError,
    },

    #[error("{scenario}: {source} in {phase} phase at step {step}")]
    Operator {
        scenario: String,
        phase: Phase,
        step: usize,
        #[source]
        source: OperatorError,
    },

    #[error("{scenario}: cancelled in {phase} phase at step {step}")]
    Cancelled {
        scenario: String,
        phase: Phase,
        step: usize,
    },

    #[error("sediment flux series has {actual} entries, expected {expected}")]
    FluxLength { expected: usize, actual: usize },
}

/// Umbrella error returned by the public API.
#[derive(Debug, Error)]
pub enum MtrError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sim(#[from] SimError),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl MtrError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MtrError::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the run was stopped through its `CancelToken`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MtrError::Sim(SimError::Cancelled { .. }))
    }
}
