//! Error taxonomy for constraint construction, exchange and queries.
//!
//! None of these are retryable: constraint construction is a one-shot,
//! collectively executed pipeline, and a failure on any rank must abort the
//! whole job. Failures at the form-evaluation seam (element matrix/vector
//! computation) are reported as [`eyre::Report`] by the assembler traits
//! instead, since they originate in external collaborator code.

use thiserror::Error;

/// Errors arising from constraint construction and constraint queries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConstraintError {
    /// A tagged slave candidate has no admissible master within the configured
    /// tolerance or maximum gap. The constraint map would be incomplete, so the
    /// build is aborted.
    #[error("no master found for slave candidate dof {slave}: {detail}")]
    GeometryMismatch { slave: usize, detail: String },

    /// An invariant of the constraint system is violated: a dof is both a
    /// slave and a master, or ranks disagree on the ownership of a dof.
    /// Detected after global communication, so recovery on a single rank is
    /// impossible and the whole job aborts.
    #[error("degenerate constraint system: {detail}")]
    DegenerateConstraint { detail: String },

    /// The count phase and the payload phase of an exchange disagree. This
    /// signals a defect in message construction, not a user error.
    #[error("communication mismatch with rank {rank}: {detail}")]
    CommunicationMismatch { rank: usize, detail: String },

    /// A constraint query was made for a dof that is not a slave.
    #[error("dof {dof} is not the slave of any constraint")]
    UnknownSlave { dof: usize },

    /// The local rank passed all checks, but another rank reported a failure
    /// during the collective validation. Every rank must abort together.
    #[error("constraint build aborted by a failure on another rank")]
    PeerAbort,

    /// A ghost master value was read before any refresh, or for a master that
    /// is not ghosted on this rank.
    #[error("no current ghost value for master dof {master}; refresh ghost values first")]
    MissingGhost { master: usize },
}

impl ConstraintError {
    pub(crate) fn degenerate(detail: impl Into<String>) -> Self {
        Self::DegenerateConstraint { detail: detail.into() }
    }

    pub(crate) fn comm_mismatch(rank: usize, detail: impl Into<String>) -> Self {
        Self::CommunicationMismatch { rank, detail: detail.into() }
    }
}
