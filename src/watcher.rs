//! Directory watches over the server's shared inotify instance.
//!
//! Each watched sub-directory is owned by one [`DirWatcher`]: construction
//! registers the watch, drop deregisters it best-effort. Raw inotify events
//! are decoded into [`FsEvent`] values by a dedicated reader thread and
//! forwarded to the main loop, which resolves the owning project by watch
//! descriptor.

use std::path::{Path, PathBuf};
use std::thread;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use tracing::{error, warn};

use crate::error::{Result, SymdbError};

/// Event classes delivered to a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEventKind {
    Create { is_dir: bool },
    Modify,
    Delete { is_dir: bool },
    /// The watched directory itself vanished.
    SelfDelete,
}

/// One decoded file-system event. `name` is the entry name relative to the
/// watched directory; empty for [`FsEventKind::SelfDelete`].
#[derive(Debug, Clone)]
pub struct FsEvent {
    pub wd: WatchDescriptor,
    pub name: String,
    pub kind: FsEventKind,
}

impl FsEvent {
    pub fn is_dir(&self) -> bool {
        matches!(
            self.kind,
            FsEventKind::Create { is_dir: true } | FsEventKind::Delete { is_dir: true }
        )
    }
}

fn subscription_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::MODIFY
        | WatchMask::CLOSE_WRITE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MOVED_TO
}

/// Owns one directory watch.
pub struct DirWatcher {
    abs_path: PathBuf,
    wd: WatchDescriptor,
    watches: Watches,
}

impl DirWatcher {
    pub fn new(mut watches: Watches, abs_path: PathBuf) -> Result<Self> {
        let wd = watches
            .add(&abs_path, subscription_mask())
            .map_err(|e| SymdbError::Watch {
                path: abs_path.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            abs_path,
            wd,
            watches,
        })
    }

    pub fn abs_path(&self) -> &Path {
        &self.abs_path
    }

    pub fn id(&self) -> WatchDescriptor {
        self.wd.clone()
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        // The shared descriptor may already be gone at shutdown.
        let _ = self.watches.remove(self.wd.clone());
    }
}

fn decode_one(mask: EventMask, wd: WatchDescriptor, name: String, out: &mut Vec<FsEvent>) {
    let is_dir = mask.contains(EventMask::ISDIR);

    if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
        out.push(FsEvent {
            wd: wd.clone(),
            name: name.clone(),
            kind: FsEventKind::Create { is_dir },
        });
    }
    if mask.intersects(EventMask::MODIFY | EventMask::CLOSE_WRITE) {
        out.push(FsEvent {
            wd: wd.clone(),
            name: name.clone(),
            kind: FsEventKind::Modify,
        });
    }
    if mask.contains(EventMask::DELETE) {
        out.push(FsEvent {
            wd: wd.clone(),
            name,
            kind: FsEventKind::Delete { is_dir },
        });
    }
    if mask.contains(EventMask::DELETE_SELF) {
        out.push(FsEvent {
            wd,
            name: String::new(),
            kind: FsEventKind::SelfDelete,
        });
    }
}

/// Spawns the blocking reader that turns raw inotify events into [`FsEvent`]
/// batches. `deliver` returns `false` once the receiving side is gone, which
/// stops the thread.
pub fn spawn_reader<F>(mut inotify: Inotify, deliver: F) -> Result<thread::JoinHandle<()>>
where
    F: Fn(Vec<FsEvent>) -> bool + Send + 'static,
{
    let handle = thread::Builder::new()
        .name("symdb-inotify".to_string())
        .spawn(move || {
            let mut buffer = [0u8; 4096];
            loop {
                let events = match inotify.read_events_blocking(&mut buffer) {
                    Ok(events) => events,
                    Err(e) => {
                        error!(error = %e, "inotify read failed, stopping watch loop");
                        return;
                    }
                };

                let mut decoded = Vec::new();
                for event in events {
                    let name = event
                        .name
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if name.is_empty() && !event.mask.contains(EventMask::DELETE_SELF) {
                        warn!(mask = ?event.mask, "inotify event without a name");
                        continue;
                    }
                    decode_one(event.mask, event.wd.clone(), name, &mut decoded);
                }

                if !decoded.is_empty() && !deliver(decoded) {
                    return;
                }
            }
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn drain(inotify: &mut Inotify, wanted: usize) -> Vec<FsEvent> {
        let mut buffer = [0u8; 4096];
        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        while out.len() < wanted && Instant::now() < deadline {
            if let Ok(events) = inotify.read_events(&mut buffer) {
                for event in events {
                    let name = event
                        .name
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    decode_one(event.mask, event.wd.clone(), name, &mut out);
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        out
    }

    #[test]
    fn create_modify_delete_are_classified() {
        let tmp = TempDir::new().unwrap();
        let mut inotify = Inotify::init().unwrap();
        let watcher = DirWatcher::new(inotify.watches(), tmp.path().to_path_buf()).unwrap();

        let file = tmp.path().join("a.cpp");
        fs::write(&file, "int x;").unwrap();
        fs::remove_file(&file).unwrap();

        let events = drain(&mut inotify, 3);
        assert!(events
            .iter()
            .any(|e| e.kind == FsEventKind::Create { is_dir: false } && e.name == "a.cpp"));
        assert!(events
            .iter()
            .any(|e| e.kind == FsEventKind::Modify && e.name == "a.cpp"));
        assert!(events
            .iter()
            .any(|e| e.kind == FsEventKind::Delete { is_dir: false } && e.name == "a.cpp"));
        assert!(events.iter().all(|e| e.wd == watcher.id()));
    }

    #[test]
    fn directory_events_carry_the_dir_flag() {
        let tmp = TempDir::new().unwrap();
        let mut inotify = Inotify::init().unwrap();
        let _watcher = DirWatcher::new(inotify.watches(), tmp.path().to_path_buf()).unwrap();

        fs::create_dir(tmp.path().join("sub")).unwrap();
        let events = drain(&mut inotify, 1);
        assert!(events
            .iter()
            .any(|e| e.kind == FsEventKind::Create { is_dir: true } && e.name == "sub"));
    }

    #[test]
    fn dropping_the_watcher_removes_the_watch() {
        let tmp = TempDir::new().unwrap();
        let mut inotify = Inotify::init().unwrap();
        let watcher = DirWatcher::new(inotify.watches(), tmp.path().to_path_buf()).unwrap();
        drop(watcher);

        fs::write(tmp.path().join("b.cpp"), "int y;").unwrap();
        let events = drain(&mut inotify, 1);
        assert!(events.is_empty());
    }
}
