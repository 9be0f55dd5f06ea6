//! Smart-sync and force-sync: the two timers driving background indexing.
//!
//! Smart-sync drains the modified-file queue every 30 seconds. Force-sync
//! re-runs the whole configure step on a fixed local-time schedule,
//! reconciles the source set, refreshes the watch set and re-parses whatever
//! changed.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use tracing::{debug, error, info};

use crate::fs_utils::path_has_prefix;
use crate::server::ServerContext;
use crate::store::WriteBatch;
use crate::watcher::DirWatcher;

use super::ProjectIndexer;

pub(crate) const SMART_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Local times of day at which a full reconfigure runs.
const FORCE_SYNC_SCHEDULE: [(u32, u32); 5] = [(3, 30), (8, 30), (12, 30), (18, 15), (23, 30)];

/// The next force-sync instant strictly after `now`, wrapping to the first
/// slot of the following day.
pub fn next_force_sync(now: NaiveDateTime) -> NaiveDateTime {
    let time_of_day = now.time();
    for (hour, minute) in FORCE_SYNC_SCHEDULE {
        let slot = NaiveTime::from_hms_opt(hour, minute, 0).expect("schedule literal");
        if slot > time_of_day {
            return now.date().and_time(slot);
        }
    }
    let (hour, minute) = FORCE_SYNC_SCHEDULE[0];
    (now.date() + TimeDelta::days(1))
        .and_time(NaiveTime::from_hms_opt(hour, minute, 0).expect("schedule literal"))
}

impl ProjectIndexer {
    /// Time until the earliest of this project's two timers.
    pub fn due_in(&self) -> Duration {
        let smart = self
            .next_smart_sync
            .saturating_duration_since(Instant::now());
        let force = (self.next_force_sync - Local::now().naive_local())
            .to_std()
            .unwrap_or(Duration::ZERO);
        smart.min(force)
    }

    /// Fires whichever timers are due and re-arms them. Errors inside a sync
    /// are logged and absorbed; the schedule keeps running.
    pub fn run_due_timers(&mut self, ctx: &ServerContext) {
        if Instant::now() >= self.next_smart_sync {
            self.smart_sync(ctx);
            self.next_smart_sync = Instant::now() + SMART_SYNC_INTERVAL;
        }
        let now = Local::now().naive_local();
        if now >= self.next_force_sync {
            self.force_sync(ctx);
            self.next_force_sync = next_force_sync(now);
            info!(project = %self.name, next = %self.next_force_sync, "next force sync");
        }
    }

    /// Drains the modified queue, deduplicated, into the build pipeline.
    pub fn smart_sync(&mut self, ctx: &ServerContext) {
        if self.modified.is_empty() {
            return;
        }
        let queued: BTreeSet<PathBuf> = std::mem::take(&mut self.modified).into_iter().collect();
        debug!(project = %self.name, files = queued.len(), "smart sync");
        for path in &queued {
            self.build_file(ctx, path);
        }
    }

    /// Full rebuild: reconfigure, reconcile the source set, refresh watches,
    /// drop vanished files and re-parse the rest. A failed configure leaves
    /// every piece of state untouched.
    pub fn force_sync(&mut self, ctx: &ServerContext) {
        info!(project = %self.name, "force sync");

        let old_paths = std::mem::take(&mut self.abs_src_paths);
        let mut fresh_paths = BTreeSet::new();
        if let Err(e) = self.flag_cache.rebuild(
            &self.cmake_file_path,
            &self.config.build_path,
            &self.config,
            &self.sys_include_flags,
            &mut fresh_paths,
        ) {
            error!(project = %self.name, error = %e, "configure failed, keeping previous state");
            self.abs_src_paths = old_paths;
            return;
        }
        self.abs_src_paths = fresh_paths;

        self.update_watch_dirs(ctx);

        let dropped: Vec<PathBuf> = old_paths
            .difference(&self.abs_src_paths)
            .cloned()
            .collect();
        for path in &dropped {
            if let Err(e) = self.purge_file(path) {
                error!(project = %self.name, file = %path.display(), error = %e,
                       "failed to drop vanished file");
            }
        }

        self.build(ctx);
    }

    /// Schedules every non-excluded source file; unchanged files fall out of
    /// the pipeline at the worker's skip checks.
    pub fn build(&mut self, ctx: &ServerContext) {
        let mut batch = WriteBatch::new();
        match self.write_src_paths(&mut batch) {
            Ok(()) => {
                if let Err(e) = self.store.write(batch) {
                    error!(project = %self.name, error = %e, "failed to persist source set");
                }
            }
            Err(e) => error!(project = %self.name, error = %e, "failed to snapshot source set"),
        }

        let paths: Vec<PathBuf> = self
            .abs_src_paths
            .iter()
            .filter(|p| !self.config.is_file_excluded(p))
            .cloned()
            .collect();
        debug!(project = %self.name, files = paths.len(), "build");
        for path in &paths {
            self.build_file(ctx, path);
        }
    }

    /// Brings the watcher set in line with the directories that currently
    /// belong to a known module, adding and removing by set difference.
    pub(crate) fn update_watch_dirs(&mut self, ctx: &ServerContext) {
        if !self.config.enable_file_watch {
            return;
        }

        let desired = self.watch_dirs();
        self.watchers
            .retain(|_, watcher| desired.contains(watcher.abs_path()));

        let existing: HashSet<PathBuf> = self
            .watchers
            .values()
            .map(|w| w.abs_path().to_path_buf())
            .collect();
        for dir in desired {
            if existing.contains(&dir) {
                continue;
            }
            match DirWatcher::new(ctx.watches.clone(), dir.clone()) {
                Ok(watcher) => {
                    debug!(project = %self.name, dir = %dir.display(), "watching");
                    self.watchers.insert(watcher.id(), watcher);
                }
                // Indexing proceeds with fewer watches.
                Err(e) => error!(project = %self.name, dir = %dir.display(), error = %e,
                                 "watch registration failed"),
            }
        }
    }

    /// Directories worth watching: every sub-directory of the home that
    /// belongs to a known module, the build tree excluded.
    fn watch_dirs(&self) -> BTreeSet<PathBuf> {
        let build_path = self.config.build_path.clone();
        let mut dirs = BTreeSet::new();
        let walker = walkdir::WalkDir::new(&self.home_path)
            .into_iter()
            .filter_entry(|entry| !path_has_prefix(entry.path(), &build_path));
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_dir() {
                continue;
            }
            if self.flag_cache.module_name(entry.path()).is_none() {
                continue;
            }
            dirs.insert(entry.path().to_path_buf());
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 14)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn mid_morning_fires_at_half_past_noon() {
        assert_eq!(next_force_sync(at(10, 0)), at(12, 30));
    }

    #[test]
    fn late_night_wraps_to_next_day() {
        let next = next_force_sync(at(23, 45));
        assert_eq!(
            next,
            NaiveDate::from_ymd_opt(2024, 5, 15)
                .unwrap()
                .and_hms_opt(3, 30, 0)
                .unwrap()
        );
    }

    #[test]
    fn exact_slot_moves_to_the_following_one() {
        assert_eq!(next_force_sync(at(3, 30)), at(8, 30));
        assert_eq!(next_force_sync(at(18, 15)), at(23, 30));
    }

    #[test]
    fn early_morning_hits_first_slot() {
        assert_eq!(next_force_sync(at(0, 5)), at(3, 30));
    }
}
