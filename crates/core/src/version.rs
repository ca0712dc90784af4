//! Optimistic concurrency expectations for job runs.

/// Expectation about which run of a job a write belongs to.
///
/// Every (re)start of a job bumps its run counter. Writes produced by a run
/// carry `Exact(run)` so that a stale run cannot overwrite the outcome of a
/// newer one; administrative writes use `Any`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the job to be at an exact run.
    Exact(u32),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u32) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}
