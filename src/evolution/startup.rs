//! Operator entry points
//!
//! One-call helpers meant for application startup, deploy hooks and admin
//! tooling. Each takes a fully populated [`EvolutionsConfig`].

use crate::config::EvolutionsConfig;
use crate::database::Database;
use crate::evolution::error::EvolutionError;
use crate::evolution::evolver::DatabaseEvolutions;
use crate::evolution::reader::EvolutionsReader;
use crate::evolution::runner::ExecutionReport;
use crate::evolution::status::EvolutionStatus;

/// Apply the evolutions `reader` holds for `database`
///
/// Reverts recorded revisions that changed or disappeared, then applies new
/// ones. Meant to run before the application starts serving: concurrent
/// instances serialize on the evolutions lock and the later ones find
/// nothing left to do.
///
/// # Example
///
/// ```rust,no_run
/// use evolutions::config::{DatabaseConfig, EvolutionsConfig};
/// use evolutions::database::PostgresDatabase;
/// use evolutions::evolution::{apply_evolutions, DirectoryEvolutionsReader};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let database = PostgresDatabase::from_config(&DatabaseConfig::load()?)?;
///     let reader = DirectoryEvolutionsReader::new("conf/evolutions");
///
///     let report = apply_evolutions(&database, &reader, &EvolutionsConfig::load()?)?;
///     println!("applied {:?}", report.applied);
///     Ok(())
/// }
/// ```
pub fn apply_evolutions<D: Database + ?Sized>(
    database: &D,
    reader: &dyn EvolutionsReader,
    config: &EvolutionsConfig,
) -> Result<ExecutionReport, EvolutionError> {
    let report = DatabaseEvolutions::new(database, config).evolve(reader)?;

    if report.is_empty() {
        log::debug!("No evolutions to apply on database '{}'", database.name());
    } else {
        log::info!(
            "Evolutions on database '{}': reverted {:?}, applied {:?}",
            database.name(),
            report.reverted,
            report.applied
        );
    }
    Ok(report)
}

/// Revert every recorded evolution of `database`
pub fn cleanup_evolutions<D: Database + ?Sized>(
    database: &D,
    config: &EvolutionsConfig,
) -> Result<ExecutionReport, EvolutionError> {
    let report = DatabaseEvolutions::new(database, config).reset()?;
    log::info!(
        "Cleaned up {} evolution(s) on database '{}'",
        report.reverted.len(),
        database.name()
    );
    Ok(report)
}

/// Recorded and pending evolutions of `database`
pub fn evolution_status<D: Database + ?Sized>(
    database: &D,
    reader: &dyn EvolutionsReader,
    config: &EvolutionsConfig,
) -> Result<EvolutionStatus, EvolutionError> {
    DatabaseEvolutions::new(database, config).status(reader)
}

/// Settle a revision left inconsistent, after the database was fixed by hand
pub fn resolve_evolution<D: Database + ?Sized>(
    database: &D,
    revision: u32,
    config: &EvolutionsConfig,
) -> Result<(), EvolutionError> {
    DatabaseEvolutions::new(database, config).resolve(revision)
}
