use merlin_core::errors::RepositoryError;

/// Failures that escape [`TurnCoordinator::submit`](crate::TurnCoordinator::submit).
///
/// Conflicts, cancellations and backend failures are outcomes, not errors.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] RepositoryError),
}
