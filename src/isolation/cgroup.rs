//! Cgroup-backed isolation drivers and a reusable group cache.
//!
//! All drivers talk to the cgroup filesystem directly: creating a group
//! is a `mkdir`, limits are file writes, attaching a process writes its
//! pid to `cgroup.procs`, and removal is `rmdir`. The mountpoint is
//! injectable so the drivers can be exercised against a scratch
//! directory.

use crate::context::Context;
use crate::errors::{Error, Result};
use crate::isolation::IsolationPolicy;
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Where the cgroup filesystem is mounted.
const DEFAULT_MOUNTPOINT: &str = "/sys/fs/cgroup";

fn unique_group_name(base: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let salt: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("{base}-{nanos}-{salt}")
}

fn write_control(dir: &Path, file: &str, value: &str) -> std::io::Result<()> {
    fs::write(dir.join(file), value)
}

fn attach_pid(dir: &Path, pid: u32) -> std::io::Result<()> {
    write_control(dir, "cgroup.procs", &pid.to_string())
}

/// cgroup-v1 driver: one uniquely named group per `setup` under the
/// `cpu` and `memory` hierarchies.
pub struct CgroupV1Policy {
    cpu_shares: u64,
    memory_limit: i64,
    name: String,
    path: String,
    mountpoint: PathBuf,
    active: Vec<PathBuf>,
}

impl CgroupV1Policy {
    /// Creates a v1 policy with `cpu.shares` and a memory byte limit.
    /// Groups are created under `path` in each hierarchy and named after
    /// `name` plus a unique suffix.
    #[must_use]
    pub fn new(cpu_shares: u64, memory_limit: i64, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::with_mountpoint(cpu_shares, memory_limit, name, path, DEFAULT_MOUNTPOINT)
    }

    /// Like [`CgroupV1Policy::new`] with an explicit cgroup mountpoint.
    #[must_use]
    pub fn with_mountpoint(
        cpu_shares: u64,
        memory_limit: i64,
        name: impl Into<String>,
        path: impl Into<String>,
        mountpoint: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cpu_shares,
            memory_limit,
            name: name.into(),
            path: path.into(),
            mountpoint: mountpoint.into(),
            active: Vec::new(),
        }
    }
}

#[async_trait]
impl IsolationPolicy for CgroupV1Policy {
    async fn setup(&mut self, _ctx: &Context, pid: u32) -> Result<()> {
        let group = unique_group_name(&self.name);
        let cpu_dir = self.mountpoint.join("cpu").join(&self.path).join(&group);
        let memory_dir = self.mountpoint.join("memory").join(&self.path).join(&group);

        let created = (|| -> Result<()> {
            fs::create_dir_all(&cpu_dir)?;
            fs::create_dir_all(&memory_dir)?;
            write_control(&cpu_dir, "cpu.shares", &self.cpu_shares.to_string())?;
            write_control(
                &memory_dir,
                "memory.limit_in_bytes",
                &self.memory_limit.to_string(),
            )?;
            for dir in [&cpu_dir, &memory_dir] {
                attach_pid(dir, pid).map_err(|err| {
                    Error::other(format!(
                        "failed to add process {pid} to cgroup {group}: {err}"
                    ))
                })?;
            }
            Ok(())
        })();

        if let Err(err) = created {
            let _ = fs::remove_dir(&cpu_dir);
            let _ = fs::remove_dir(&memory_dir);
            return Err(err);
        }

        self.active = vec![cpu_dir, memory_dir];
        Ok(())
    }

    async fn teardown(&mut self, _ctx: &Context) -> Result<()> {
        if self.active.is_empty() {
            return Err(Error::other("cgroup was never created"));
        }
        for dir in self.active.drain(..) {
            fs::remove_dir(dir)?;
        }
        Ok(())
    }
}

/// CPU and memory settings for a v2 group.
#[derive(Debug, Clone)]
pub struct CgroupV2Resources {
    cpu_quota: i64,
    cpu_period: u64,
    cpu_weight: u64,
    memory_max: i64,
}

impl CgroupV2Resources {
    /// Validates and bundles the v2 resource settings.
    ///
    /// # Errors
    ///
    /// Fails on a negative quota or memory limit, or a zero period.
    pub fn new(cpu_quota: i64, cpu_period: u64, cpu_weight: u64, memory_max: i64) -> Result<Self> {
        if cpu_quota < 0 || cpu_period == 0 || memory_max < 0 {
            return Err(Error::other(format!(
                "invalid cgroup parameters: cpu_quota={cpu_quota}, cpu_period={cpu_period}, memory={memory_max}"
            )));
        }
        Ok(Self {
            cpu_quota,
            cpu_period,
            cpu_weight,
            memory_max,
        })
    }

    fn cpu_max(&self) -> String {
        format!("{} {}", self.cpu_quota, self.cpu_period)
    }

    fn apply(&self, dir: &Path) -> std::io::Result<()> {
        write_control(dir, "cpu.max", &self.cpu_max())?;
        write_control(dir, "cpu.weight", &self.cpu_weight.to_string())?;
        write_control(dir, "memory.max", &self.memory_max.to_string())
    }
}

/// cgroup-v2 driver: one uniquely named group per `setup` under a
/// caller-supplied path.
pub struct CgroupV2Policy {
    resources: CgroupV2Resources,
    name: String,
    path: String,
    mountpoint: PathBuf,
    active: Option<PathBuf>,
}

impl CgroupV2Policy {
    /// Creates a v2 policy. Groups are created under `path` and named
    /// after `name` plus a unique suffix.
    #[must_use]
    pub fn new(resources: CgroupV2Resources, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::with_mountpoint(resources, name, path, DEFAULT_MOUNTPOINT)
    }

    /// Like [`CgroupV2Policy::new`] with an explicit cgroup mountpoint.
    #[must_use]
    pub fn with_mountpoint(
        resources: CgroupV2Resources,
        name: impl Into<String>,
        path: impl Into<String>,
        mountpoint: impl Into<PathBuf>,
    ) -> Self {
        Self {
            resources,
            name: name.into(),
            path: path.into(),
            mountpoint: mountpoint.into(),
            active: None,
        }
    }
}

#[async_trait]
impl IsolationPolicy for CgroupV2Policy {
    async fn setup(&mut self, _ctx: &Context, pid: u32) -> Result<()> {
        let group = unique_group_name(&self.name);
        let dir = self.mountpoint.join(&self.path).join(&group);

        let created = (|| -> Result<()> {
            fs::create_dir_all(&dir)
                .map_err(|err| Error::other(format!("failed to create cgroup manager: {err}")))?;
            self.resources.apply(&dir)?;
            attach_pid(&dir, pid).map_err(|err| {
                Error::other(format!(
                    "failed to add process {pid} to cgroup {group}: {err}"
                ))
            })
        })();

        if let Err(err) = created {
            let _ = fs::remove_dir(&dir);
            return Err(err);
        }

        self.active = Some(dir);
        Ok(())
    }

    async fn teardown(&mut self, _ctx: &Context) -> Result<()> {
        match self.active.take() {
            Some(dir) => Ok(fs::remove_dir(dir)?),
            None => Err(Error::other("cgroup was never created")),
        }
    }
}

/// A cache of live v2 groups, reused across pipeline invocations.
///
/// Lookups are double-checked under a read/write lock so concurrent
/// setups of the same name create the group once.
pub struct CgroupCache {
    groups: RwLock<HashMap<String, PathBuf>>,
    base_path: String,
    mountpoint: PathBuf,
}

impl CgroupCache {
    /// Creates a cache rooted at `base_path` under the default
    /// mountpoint.
    #[must_use]
    pub fn new(base_path: impl Into<String>) -> Self {
        Self::with_mountpoint(base_path, DEFAULT_MOUNTPOINT)
    }

    /// Like [`CgroupCache::new`] with an explicit cgroup mountpoint.
    #[must_use]
    pub fn with_mountpoint(base_path: impl Into<String>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            base_path: base_path.into(),
            mountpoint: mountpoint.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{}", self.base_path, name)
    }

    /// Returns the group named `name`, creating it with `resources` on
    /// first use.
    ///
    /// # Errors
    ///
    /// Fails when the group cannot be created.
    pub fn get_or_create(&self, name: &str, resources: &CgroupV2Resources) -> Result<PathBuf> {
        let key = self.key(name);
        if let Some(dir) = self.groups.read().get(&key) {
            return Ok(dir.clone());
        }

        let mut groups = self.groups.write();
        if let Some(dir) = groups.get(&key) {
            return Ok(dir.clone());
        }

        let dir = self.mountpoint.join(&key);
        fs::create_dir_all(&dir)
            .and_then(|()| resources.apply(&dir))
            .map_err(|err| Error::other(format!("failed to create cgroup {name}: {err}")))?;
        groups.insert(key, dir.clone());
        Ok(dir)
    }

    /// Removes a group from the cache and deletes it. Unknown names are
    /// not an error.
    ///
    /// # Errors
    ///
    /// Fails when the group directory cannot be removed.
    pub fn remove(&self, name: &str) -> Result<()> {
        let key = self.key(name);
        if let Some(dir) = self.groups.write().remove(&key) {
            fs::remove_dir(dir)?;
        }
        Ok(())
    }

    /// Names of groups already present under the base path, relative to
    /// it.
    ///
    /// # Errors
    ///
    /// Fails when the base path cannot be walked.
    pub fn discover_existing(&self) -> Result<Vec<String>> {
        let base = self.mountpoint.join(&self.base_path);
        let mut found = Vec::new();
        if !base.exists() {
            return Ok(found);
        }
        collect_group_dirs(&base, &base, &mut found)?;
        Ok(found)
    }

    /// Loads every discovered group into the cache.
    ///
    /// # Errors
    ///
    /// Fails when discovery fails; individual groups are loaded
    /// unconditionally since a cached entry is just the path.
    pub fn load_existing(&self) -> Result<()> {
        let names = self.discover_existing()?;
        let mut groups = self.groups.write();
        for name in names {
            let key = format!("{}/{}", self.base_path, name);
            let dir = self.mountpoint.join(&key);
            groups.insert(key, dir);
        }
        Ok(())
    }
}

fn collect_group_dirs(base: &Path, dir: &Path, found: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Ok(relative) = path.strip_prefix(base) {
            found.push(relative.to_string_lossy().into_owned());
        }
        collect_group_dirs(base, &path, found)?;
    }
    Ok(())
}

/// cgroup-v2 driver that reuses one named group from a shared
/// [`CgroupCache`] instead of creating a fresh group per `setup`.
pub struct CachedCgroupV2Policy {
    resources: CgroupV2Resources,
    name: String,
    cache: std::sync::Arc<CgroupCache>,
}

impl CachedCgroupV2Policy {
    /// Creates a cached policy attaching processes to the group named
    /// `name` in `cache`.
    #[must_use]
    pub fn new(
        resources: CgroupV2Resources,
        name: impl Into<String>,
        cache: std::sync::Arc<CgroupCache>,
    ) -> Self {
        Self {
            resources,
            name: name.into(),
            cache,
        }
    }
}

#[async_trait]
impl IsolationPolicy for CachedCgroupV2Policy {
    async fn setup(&mut self, _ctx: &Context, pid: u32) -> Result<()> {
        let dir = self.cache.get_or_create(&self.name, &self.resources)?;
        attach_pid(&dir, pid).map_err(|err| {
            Error::other(format!(
                "failed to add process {pid} to cached cgroup {}: {err}",
                self.name
            ))
        })
    }

    async fn teardown(&mut self, _ctx: &Context) -> Result<()> {
        // The kernel detaches the process when it exits, and the group
        // itself stays cached for the next run. `CgroupCache::remove`
        // is the explicit way to drop it.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources() -> CgroupV2Resources {
        CgroupV2Resources::new(50_000, 100_000, 100, 256 * 1024 * 1024)
            .expect("parameters are valid")
    }

    #[test]
    fn test_v2_resources_reject_bad_parameters() {
        assert!(CgroupV2Resources::new(-1, 100_000, 100, 1).is_err());
        assert!(CgroupV2Resources::new(1, 0, 100, 1).is_err());
        assert!(CgroupV2Resources::new(1, 100_000, 100, -5).is_err());
    }

    #[test]
    fn test_cpu_max_renders_quota_and_period() {
        assert_eq!(resources().cpu_max(), "50000 100000");
    }

    #[tokio::test]
    async fn test_v2_setup_writes_limits_and_attaches_pid() {
        let mountpoint = tempfile::tempdir().expect("tempdir");
        let mut policy =
            CgroupV2Policy::with_mountpoint(resources(), "stage", "pipelines", mountpoint.path());

        policy
            .setup(&Context::new(), 4321)
            .await
            .expect("setup should work against a scratch mountpoint");

        let group_dir = policy.active.clone().expect("group was created");
        assert_eq!(
            fs::read_to_string(group_dir.join("cpu.max")).expect("cpu.max"),
            "50000 100000"
        );
        assert_eq!(
            fs::read_to_string(group_dir.join("cgroup.procs")).expect("procs"),
            "4321"
        );
    }

    #[tokio::test]
    async fn test_v2_teardown_without_setup_fails() {
        let mountpoint = tempfile::tempdir().expect("tempdir");
        let mut policy =
            CgroupV2Policy::with_mountpoint(resources(), "stage", "pipelines", mountpoint.path());
        assert!(policy.teardown(&Context::new()).await.is_err());
    }

    #[test]
    fn test_cache_creates_each_group_once() {
        let mountpoint = tempfile::tempdir().expect("tempdir");
        let cache = CgroupCache::with_mountpoint("pipelines", mountpoint.path());

        let first = cache
            .get_or_create("workers", &resources())
            .expect("create");
        let second = cache
            .get_or_create("workers", &resources())
            .expect("lookup");
        assert_eq!(first, second);
        assert!(first.join("cpu.max").exists());
    }

    #[test]
    fn test_cache_remove_is_quiet_for_unknown_names() {
        let mountpoint = tempfile::tempdir().expect("tempdir");
        let cache = CgroupCache::with_mountpoint("pipelines", mountpoint.path());
        cache.remove("never-created").expect("remove is a no-op");
    }

    #[test]
    fn test_cache_discovers_existing_groups() {
        let mountpoint = tempfile::tempdir().expect("tempdir");
        let base = mountpoint.path().join("pipelines");
        fs::create_dir_all(base.join("old-workers")).expect("mkdir");
        fs::create_dir_all(base.join("batch/nightly")).expect("mkdir");

        let cache = CgroupCache::with_mountpoint("pipelines", mountpoint.path());
        let mut found = cache.discover_existing().expect("discover");
        found.sort();
        assert_eq!(found, vec!["batch", "batch/nightly", "old-workers"]);

        cache.load_existing().expect("load");
        let dir = cache
            .get_or_create("old-workers", &resources())
            .expect("cached lookup");
        assert!(dir.ends_with("pipelines/old-workers"));
        // Loaded from disk, so no limit files were written.
        assert!(!dir.join("cpu.max").exists());
    }
}
