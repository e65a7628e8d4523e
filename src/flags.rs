//! Operational modes handed in by the outer shell, parsed once into a
//! plain struct, plus the process exit-code contract.

use crate::upgrade::FeatureRequest;

/// Everything the repair engine needs to know about how it was invoked.
#[derive(Debug, Default, Clone)]
pub struct RepairFlags {
    /// Read and verify only; every mutation becomes a "would ..." line.
    pub no_modify: bool,
    /// Destroy the log if its tail cannot be found.
    pub zap_log: bool,
    /// Extra diagnostics.
    pub verbose: bool,
    /// Feature upgrades to attempt before the repair phases.
    pub add_features: Vec<FeatureRequest>,
}

/// Process exit codes of the repair tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Filesystem was already clean.
    Clean,
    /// Repairs or upgrades were made.
    Repaired,
    /// Unrepairable damage, or the run was aborted.
    Unrepairable,
    /// Bad invocation.
    Usage,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::Repaired => 1,
            Self::Unrepairable => 2,
            Self::Usage => 4,
        }
    }
}
