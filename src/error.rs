//! Crate-wide error types.
//!
//! Structured the way `cisco_lab::CiscoLabError` aggregates its collaborators'
//! error types behind `#[from]`: one outer enum per externally-visible failure
//! mode, individual modules keep their own narrower error type.

use thiserror::Error;

use crate::histogram::{HistogramParseError, PlotError};
use crate::ssh::RemoteError;

/// Errors surfaced by the fleet coordinator (spec.md §7: "coordination failures
/// ... propagate out of the coordinator as the single externally visible
/// failure mode").
#[derive(Debug, Error)]
pub enum FleetError {
    /// A coordinated phase did not complete within its budget.
    #[error("phase `{phase}` did not complete within {budget_secs}s")]
    PhaseTimeout { phase: &'static str, budget_secs: u64 },

    /// The remote-shell transport or a remote command failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A flow's endpoint controllers failed to start, stop, or connect.
    #[error("flow error: {0}")]
    Flow(#[from] crate::flow::FlowError),

    /// A histogram's bin-list could not be parsed.
    #[error("histogram parse error: {0}")]
    HistogramParse(#[from] HistogramParseError),

    /// Rendering a histogram's data file or invoking the plotter failed.
    #[error("plot error: {0}")]
    Plot(#[from] PlotError),

    /// I/O error writing a data/control file or reading a fleet description.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The fleet description file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// A flow handle was used after being removed from the registry.
    #[error("unknown flow handle: {0:?}")]
    UnknownFlow(crate::registry::FlowId),
}
