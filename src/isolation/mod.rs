//! Policies that place child processes in resource-constrained groups.
//!
//! The pipeline core only needs the two-operation contract below; the
//! cgroup-backed drivers in [`cgroup`] are Linux-only implementations
//! of it.

use crate::context::Context;
use crate::errors::Result;
use async_trait::async_trait;

#[cfg(target_os = "linux")]
mod cgroup;
#[cfg(target_os = "linux")]
pub use cgroup::{
    CachedCgroupV2Policy, CgroupCache, CgroupV1Policy, CgroupV2Policy, CgroupV2Resources,
};

/// Places a spawned process into a resource-limited group and releases
/// the group afterwards.
///
/// A command stage built with an isolation policy calls `setup` right
/// after spawning its child and `teardown` after reaping it.
#[async_trait]
pub trait IsolationPolicy: Send + Sync {
    /// Attaches `pid` to the group, creating the group as needed.
    ///
    /// # Errors
    ///
    /// Fails when the group cannot be created or the process cannot be
    /// attached; the stage treats this as a start failure.
    async fn setup(&mut self, ctx: &Context, pid: u32) -> Result<()>;

    /// Releases the group's resources.
    ///
    /// # Errors
    ///
    /// Fails when the group cannot be removed. The stage surfaces this
    /// only when nothing more important is pending.
    async fn teardown(&mut self, ctx: &Context) -> Result<()>;
}
