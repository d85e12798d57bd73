//! # Scheduler Error Types
//!
//! Recoverable failures are returned as typed results. Caller bugs
//! (submitting above `MAX_LEVEL`, resorting an unknown cell) are not in
//! here: they panic.

use tessera_shared::CellCoord;
use thiserror::Error;

use crate::stage::StageId;

/// Errors produced by stage work (generation or loading).
#[derive(Error, Debug)]
pub enum StageError {
    /// The stage rejected its input window.
    #[error("invalid input for cell {cell}: {reason}")]
    InvalidInput {
        /// The center cell.
        cell: CellCoord,
        /// Why the input was rejected.
        reason: String,
    },

    /// Synthesis itself failed.
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// I/O failure inside the stage.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by a cell store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying file operation failed.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data failed validation.
    #[error("corrupt data for cell {cell}: {reason}")]
    Corrupt {
        /// The cell being read.
        cell: CellCoord,
        /// What failed.
        reason: String,
    },
}

/// Errors produced while building a stage registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A registry needs a root and at least one stage after it.
    #[error("stage chain needs at least two stages, got {0}")]
    TooShort(usize),

    /// Two stages share a name.
    #[error("duplicate stage name: {0}")]
    DuplicateName(String),
}

/// Errors produced while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values are individually valid but inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors returned to callers of the pipeline and scheduler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A neighbor required by the range precondition failed to advance.
    #[error("cell {cell}: dependency {dependency} could not reach stage {stage}")]
    DependencyUnavailable {
        /// The cell whose advancement was blocked.
        cell: CellCoord,
        /// The neighbor that failed.
        dependency: CellCoord,
        /// The stage the neighbor needed.
        stage: StageId,
        /// Why the neighbor failed.
        #[source]
        source: Box<SchedulerError>,
    },

    /// The stage callback failed.
    #[error("cell {cell}: stage {stage} failed")]
    GenerationFailure {
        /// The cell being advanced.
        cell: CellCoord,
        /// The stage that failed.
        stage: StageId,
        /// The callback's error.
        #[source]
        source: StageError,
    },

    /// Queued work was dropped before it ran (the cell was released).
    #[error("cell {cell}: stage {stage} was cancelled")]
    Cancelled {
        /// The cell whose work was dropped.
        cell: CellCoord,
        /// The stage that never ran.
        stage: StageId,
    },

    /// The cell store failed while checking for persisted data.
    #[error("cell store failure: {0}")]
    Store(#[from] StoreError),
}

impl SchedulerError {
    /// Returns the cell at the root of the failure chain.
    #[must_use]
    pub fn origin(&self) -> CellCoord {
        match self {
            Self::DependencyUnavailable { source, .. } => source.origin(),
            Self::GenerationFailure { cell, .. } | Self::Cancelled { cell, .. } => *cell,
            Self::Store(StoreError::Corrupt { cell, .. }) => *cell,
            Self::Store(StoreError::Io(_)) => CellCoord::ORIGIN,
        }
    }
}

/// Result type for stage work.
pub type StageResult<T> = Result<T, StageError>;

/// Result type for cell stores.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_follows_dependency_chain() {
        let failing = CellCoord::new(3, 3);
        let err = SchedulerError::DependencyUnavailable {
            cell: CellCoord::new(1, 1),
            dependency: CellCoord::new(2, 2),
            stage: StageId::new(2),
            source: Box::new(SchedulerError::DependencyUnavailable {
                cell: CellCoord::new(2, 2),
                dependency: failing,
                stage: StageId::new(1),
                source: Box::new(SchedulerError::GenerationFailure {
                    cell: failing,
                    stage: StageId::new(1),
                    source: StageError::Synthesis("boom".to_string()),
                }),
            }),
        };
        assert_eq!(err.origin(), failing);
    }

    #[test]
    fn test_error_messages() {
        let err = SchedulerError::Cancelled {
            cell: CellCoord::new(-1, 4),
            stage: StageId::new(3),
        };
        assert_eq!(err.to_string(), "cell [-1, 4]: stage #3 was cancelled");
    }
}
