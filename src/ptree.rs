//! Linux process-tree memory accounting via procfs.
//!
//! Anonymous resident-set sizes come from the `RssAnon:` line of
//! `/proc/<pid>/status`. Tree totals walk `/proc/<pid>/task/*/children`
//! with a visited set; the tree can change while it is being traversed,
//! so errors on individual children are ignored.

use crate::errors::{Error, Result};
use std::collections::HashSet;
use std::fs;

/// Parses an `RssAnon:` line from `/proc/<pid>/status`, returning bytes.
///
/// Accepts the whole line, with or without the trailing newline. Returns
/// `None` for anything that is not a well-formed `RssAnon` line.
#[must_use]
pub fn parse_rss_anon(line: &str) -> Option<u64> {
    let rest = line.strip_prefix("RssAnon:")?;
    let mut fields = rest.split_whitespace();
    let kb: u64 = fields.next()?.parse().ok()?;
    if fields.next() != Some("kB") {
        return None;
    }
    Some(kb * 1024)
}

/// Anonymous RSS of a single process, in bytes.
///
/// # Errors
///
/// Fails when the status file cannot be read, or when it has no
/// `RssAnon` line (kernel threads have no address space to measure).
pub fn process_rss_anon(pid: u32) -> Result<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status"))?;
    for line in status.lines() {
        if let Some(rss) = parse_rss_anon(line) {
            return Ok(rss);
        }
    }
    Err(Error::other(format!(
        "RssAnon was not found in /proc/{pid}/status"
    )))
}

/// Total anonymous RSS of the process tree rooted at `pid`, in bytes.
///
/// A root process without an `RssAnon` line counts as zero; descendants
/// that disappear or cannot be read mid-walk are skipped.
///
/// # Errors
///
/// Fails when the root's status file cannot be read.
pub fn process_tree_rss_anon(pid: u32) -> Result<u64> {
    let mut total = match process_rss_anon(pid) {
        Ok(rss) => rss,
        Err(Error::Io(err)) => return Err(Error::Io(err)),
        Err(_) => return Ok(0),
    };

    walk_children(pid, &mut |child| {
        if let Ok(rss) = process_rss_anon(child) {
            total += rss;
        }
    });
    Ok(total)
}

/// Calls `visit` for every descendant of `pid`, but not for `pid`
/// itself. Errors are ignored throughout.
pub fn walk_children(pid: u32, visit: &mut dyn FnMut(u32)) {
    let mut visited = HashSet::from([pid]);
    walk_child_pids(pid, visit, &mut visited);
}

fn walk_child_pids(pid: u32, visit: &mut dyn FnMut(u32), visited: &mut HashSet<u32>) {
    let Ok(tasks) = fs::read_dir(format!("/proc/{pid}/task")) else {
        return;
    };
    for entry in tasks.flatten() {
        let Ok(data) = fs::read_to_string(entry.path().join("children")) else {
            continue;
        };
        for token in data.split_whitespace() {
            let Ok(child) = token.parse::<u32>() else {
                continue;
            };
            if !visited.insert(child) {
                continue;
            }
            visit(child);
            walk_child_pids(child, visit, visited);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rss_anon_accepts_status_lines() {
        assert_eq!(parse_rss_anon("RssAnon:\t    1234 kB"), Some(1234 * 1024));
        assert_eq!(parse_rss_anon("RssAnon:     0 kB"), Some(0));
        assert_eq!(parse_rss_anon("RssAnon: 8 kB\n"), Some(8 * 1024));
    }

    #[test]
    fn test_parse_rss_anon_rejects_other_lines() {
        assert_eq!(parse_rss_anon("VmRSS:     1234 kB"), None);
        assert_eq!(parse_rss_anon("RssAnon:     1234"), None);
        assert_eq!(parse_rss_anon("RssAnon: lots kB"), None);
        assert_eq!(parse_rss_anon(""), None);
    }

    #[test]
    fn test_own_process_has_anonymous_rss() {
        let rss = process_rss_anon(std::process::id()).expect("self probe should work");
        assert!(rss > 0);
    }

    #[test]
    fn test_tree_total_includes_the_root() {
        let pid = std::process::id();
        let single = process_rss_anon(pid).expect("self probe should work");
        let tree = process_tree_rss_anon(pid).expect("tree probe should work");
        assert!(tree >= single);
    }
}
