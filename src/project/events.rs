//! File-system event handling: translating watcher events into source-set,
//! module-map and database changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use inotify::WatchDescriptor;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::fs_utils::{is_cpp_source, path_has_prefix, relative_to};
use crate::schema::{
    self, file_info_key, file_symdef_key, file_symref_key, symbol_def_key, symbol_ref_key,
    FileDefinedSymbols, FileReference, FileReferencedSymbols, SymbolDefinition, SymbolReference,
};
use crate::server::ServerContext;
use crate::store::WriteBatch;
use crate::watcher::DirWatcher;

use super::build::remove_module_location;
use super::ProjectIndexer;

impl ProjectIndexer {
    fn watched_dir(&self, wd: &WatchDescriptor) -> Option<PathBuf> {
        self.watchers.get(wd).map(|w| w.abs_path().to_path_buf())
    }

    /// A new directory inherits its parent's module; a new source file joins
    /// the source set and waits for the next smart sync.
    pub fn handle_entry_create(
        &mut self,
        ctx: &ServerContext,
        wd: &WatchDescriptor,
        name: &str,
        is_dir: bool,
    ) {
        let Some(dir) = self.watched_dir(wd) else {
            warn!(project = %self.name, name, "event for unknown watch");
            return;
        };
        let abs_path = dir.join(name);
        debug!(project = %self.name, path = %abs_path.display(), is_dir, "entry created");

        if is_dir {
            let Some(module) = self.flag_cache.module_name(&dir) else {
                debug!(project = %self.name, dir = %dir.display(), "parent has no module");
                return;
            };
            self.flag_cache.add_dir(&abs_path, module);
            if self.config.enable_file_watch {
                match DirWatcher::new(ctx.watches.clone(), abs_path.clone()) {
                    Ok(watcher) => {
                        self.watchers.insert(watcher.id(), watcher);
                    }
                    Err(e) => error!(project = %self.name, dir = %abs_path.display(), error = %e,
                                     "watch registration failed"),
                }
            }
            return;
        }

        if is_cpp_source(&abs_path) && !self.config.is_file_excluded(&abs_path) {
            self.abs_src_paths.insert(abs_path.clone());
            self.modified.push(abs_path);
        }
    }

    /// A modify on the project's cmake file forces a full sync; a source
    /// edit queues for the next smart sync.
    pub fn handle_file_modified(&mut self, ctx: &ServerContext, wd: &WatchDescriptor, name: &str) {
        let Some(dir) = self.watched_dir(wd) else {
            warn!(project = %self.name, name, "event for unknown watch");
            return;
        };
        let abs_path = dir.join(name);
        debug!(project = %self.name, path = %abs_path.display(), "modified");

        if abs_path == self.cmake_file_path {
            info!(project = %self.name, "cmake file changed");
            self.force_sync(ctx);
        } else if is_cpp_source(&abs_path) {
            self.modified.push(abs_path);
        }
    }

    /// Deleted files drop their persisted contribution; deleted directories
    /// leave the module map along with every watcher under them.
    pub fn handle_entry_deleted(&mut self, wd: &WatchDescriptor, name: &str, is_dir: bool) {
        let Some(dir) = self.watched_dir(wd) else {
            warn!(project = %self.name, name, "event for unknown watch");
            return;
        };
        let abs_path = dir.join(name);
        debug!(project = %self.name, path = %abs_path.display(), is_dir, "entry deleted");

        if is_dir {
            self.flag_cache.try_remove_dir(&abs_path);
            self.watchers
                .retain(|_, watcher| !path_has_prefix(watcher.abs_path(), &abs_path));
        } else {
            self.delete_unexist_file(&abs_path);
        }
    }

    /// The watched directory itself vanished.
    pub fn handle_self_delete(&mut self, wd: &WatchDescriptor) {
        if let Some(watcher) = self.watchers.remove(wd) {
            info!(project = %self.name, dir = %watcher.abs_path().display(), "watched dir deleted");
            self.flag_cache.try_remove_dir(watcher.abs_path());
        }
    }

    /// Removes a vanished file from the source set and its contribution
    /// from the database. A path that was never tracked is ignored.
    pub fn delete_unexist_file(&mut self, abs_path: &Path) {
        if !self.abs_src_paths.remove(abs_path) {
            debug!(project = %self.name, path = %abs_path.display(), "path not tracked");
            return;
        }
        if let Err(e) = self.purge_file(abs_path) {
            error!(project = %self.name, path = %abs_path.display(), error = %e,
                   "failed to purge deleted file");
        }
    }

    /// One batch that deletes the file's three rows, strips its module's
    /// entries from every aggregated symbol record it contributed to, and
    /// persists the shrunk source set.
    pub(crate) fn purge_file(&mut self, abs_path: &Path) -> Result<()> {
        let rel_path = relative_to(abs_path, &self.home_path);
        let rel_str = rel_path.display().to_string();
        self.in_parsing.remove(&rel_path);
        let module = self.flag_cache.module_name(abs_path).unwrap_or_default();

        let mut batch = WriteBatch::new();
        batch.delete(file_info_key(&rel_path));

        if let Some(defs) = self.load_record::<FileDefinedSymbols>(&file_symdef_key(&rel_path)) {
            for usr in &defs.symbols {
                let key = symbol_def_key(usr);
                let Some(mut def) = self.load_record::<SymbolDefinition>(&key) else {
                    continue;
                };
                remove_module_location(&mut def, &module, &self.flag_cache);
                if def.locations.is_empty() {
                    batch.delete(key);
                } else {
                    batch.put(key, schema::encode(&def)?);
                }
            }
            batch.delete(file_symdef_key(&rel_path));
        }

        if let Some(refs) = self.load_record::<FileReferencedSymbols>(&file_symref_key(&rel_path)) {
            let mut by_usr: BTreeMap<&str, Vec<&FileReference>> = BTreeMap::new();
            for item in &refs.items {
                by_usr.entry(&item.usr).or_default().push(item);
            }
            for (usr, items) in by_usr {
                let key = symbol_ref_key(usr);
                let Some(mut sym) = self.load_record::<SymbolReference>(&key) else {
                    continue;
                };
                for item in items {
                    if let Some(files) = sym.modules.get_mut(&item.module) {
                        files.remove(&rel_str);
                        if files.is_empty() {
                            sym.modules.remove(&item.module);
                        }
                    }
                }
                if sym.modules.is_empty() {
                    batch.delete(key);
                } else {
                    batch.put(key, schema::encode(&sym)?);
                }
            }
            batch.delete(file_symref_key(&rel_path));
        }

        self.write_src_paths(&mut batch)?;
        self.store.write(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::super::build::tests::{fixture, unit_with};
    use super::*;
    use crate::schema::project_key;

    #[test]
    fn deleting_a_file_leaves_no_trace() {
        let (_tmp, mut project) = fixture();
        let home = project.home_path.clone();
        let rel = Path::new("exe/a.cpp");

        let unit = unit_with(
            &[("c:@F@gn#", 1, 6)],
            &[("c:@F@h#", "lib/x.h", &[(3, 7)])],
            &home,
            "exe/a.cpp",
        );
        project
            .write_compiled_file(rel, &unit, crate::schema::FileRecord {
                last_mtime: 100,
                content_md5: [0u8; 16],
            })
            .unwrap();

        project.delete_unexist_file(&home.join("exe/a.cpp"));

        assert!(project.store.get(&file_info_key(rel)).unwrap().is_none());
        assert!(project.store.get(&file_symdef_key(rel)).unwrap().is_none());
        assert!(project.store.get(&file_symref_key(rel)).unwrap().is_none());
        assert!(project
            .store
            .get(&symbol_def_key("c:@F@gn#"))
            .unwrap()
            .is_none());
        assert!(project
            .store
            .get(&symbol_ref_key("c:@F@h#"))
            .unwrap()
            .is_none());
        assert!(!project.abs_src_paths.contains(&home.join("exe/a.cpp")));

        // The shrunk source set was persisted in the same batch.
        let info: crate::schema::ProjectInfo = project
            .load_record(&project_key("demo"))
            .expect("project info");
        assert_eq!(info.rel_paths, vec!["lib/x.cpp".to_string()]);
    }

    #[test]
    fn deleting_one_module_contribution_keeps_the_other() {
        let (_tmp, mut project) = fixture();
        let home = project.home_path.clone();

        let in_exe = unit_with(&[("c:@F@h#", 2, 13)], &[], &home, "exe/a.cpp");
        project
            .write_compiled_file(Path::new("exe/a.cpp"), &in_exe, crate::schema::FileRecord {
                last_mtime: 100,
                content_md5: [0u8; 16],
            })
            .unwrap();
        let in_lib = unit_with(&[("c:@F@h#", 2, 13)], &[], &home, "lib/x.cpp");
        project
            .write_compiled_file(Path::new("lib/x.cpp"), &in_lib, crate::schema::FileRecord {
                last_mtime: 100,
                content_md5: [0u8; 16],
            })
            .unwrap();

        project.delete_unexist_file(&home.join("lib/x.cpp"));

        let locations = project.query_symbol_definitions("c:@F@h#");
        assert_eq!(locations.len(), 1);
        assert_eq!(
            locations[0].path,
            home.join("exe/a.cpp").display().to_string()
        );
    }

    #[test]
    fn untracked_paths_are_ignored() {
        let (_tmp, mut project) = fixture();
        let home = project.home_path.clone();
        let before = project.abs_src_paths.clone();

        project.delete_unexist_file(&home.join("exe/never_seen.cpp"));
        assert_eq!(project.abs_src_paths, before);
    }

    #[test]
    fn rebuild_wipes_rows_before_reparsing() {
        let (_tmp, mut project) = fixture();
        let home = project.home_path.clone();
        let rel = Path::new("exe/a.cpp");

        let unit = unit_with(&[("c:@F@fn#", 1, 6)], &[], &home, "exe/a.cpp");
        project
            .write_compiled_file(rel, &unit, crate::schema::FileRecord {
                last_mtime: 100,
                content_md5: [0u8; 16],
            })
            .unwrap();

        project.purge_file(&home.join("exe/a.cpp")).unwrap();
        assert!(project.store.get(&file_info_key(rel)).unwrap().is_none());
        assert!(project.query_symbol_definitions("c:@F@fn#").is_empty());
        // Unlike deletion, a rebuild keeps the file in the source set.
        assert!(project.abs_src_paths.contains(&home.join("exe/a.cpp")));
    }
}
