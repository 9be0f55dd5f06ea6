//! The per-file build pipeline: worker-side parse-and-hash with the
//! mtime/md5 skip cache, and the main-thread commit that reconciles the new
//! parse against the previously stored one.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, error, warn};

use crate::fs_utils::{content_md5, last_mtime, relative_to};
use crate::flags::FlagCache;
use crate::schema::{
    self, file_info_key, file_symdef_key, file_symref_key, symbol_def_key, symbol_ref_key,
    FileDefinedSymbols, FileReference, FileReferencedSymbols, FileRecord, LineCol, Location,
    SymbolDefinition, SymbolReference,
};
use crate::server::{MainTask, ServerContext};
use crate::store::{StoreReader, WriteBatch};
use crate::translation_unit::{self, DefinedSymbolMap, ParsedUnit, ReferencedSymbolMap};

use super::ProjectIndexer;

/// What a worker task came back with.
#[derive(Debug)]
pub enum ParseOutcome {
    /// The stored record still matches the file; nothing to do.
    Skipped,
    /// Stat, read or parse failed; nothing is committed.
    Failed { message: String },
    /// A fresh parse to commit.
    Parsed { unit: ParsedUnit, record: FileRecord },
}

/// One parse-and-hash job. Runs on a worker thread and owns everything it
/// touches; the result travels back to the main thread as a message.
pub struct ParseTask {
    project: String,
    abs_path: PathBuf,
    rel_path: PathBuf,
    arguments: Arc<Vec<String>>,
    reader: StoreReader,
    main_tx: Sender<MainTask>,
}

impl ParseTask {
    pub fn run(self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute()))
            .unwrap_or_else(|_| ParseOutcome::Failed {
                message: "parse worker panicked".to_string(),
            });
        // The project may have been dropped; the message is then a no-op.
        let _ = self.main_tx.send(MainTask::ParseCompleted {
            project: self.project,
            rel_path: self.rel_path,
            outcome,
        });
    }

    fn execute(&self) -> ParseOutcome {
        let mtime = match last_mtime(&self.abs_path) {
            Ok(mtime) => mtime,
            Err(e) => {
                return ParseOutcome::Failed {
                    message: format!("stat {}: {e}", self.abs_path.display()),
                }
            }
        };

        let stored: Option<FileRecord> = self
            .reader
            .get(&file_info_key(&self.rel_path))
            .ok()
            .flatten()
            .and_then(|bytes| schema::decode(&bytes).ok());

        if let Some(record) = &stored {
            if record.last_mtime == mtime {
                return ParseOutcome::Skipped;
            }
        }

        let content = match fs::read(&self.abs_path) {
            Ok(content) => content,
            Err(e) => {
                return ParseOutcome::Failed {
                    message: format!("read {}: {e}", self.abs_path.display()),
                }
            }
        };
        let md5 = content_md5(&content);
        if let Some(record) = &stored {
            if record.content_md5 == md5 {
                return ParseOutcome::Skipped;
            }
        }

        match translation_unit::parse_file(&self.abs_path, &self.arguments) {
            Ok(unit) => ParseOutcome::Parsed {
                unit,
                record: FileRecord {
                    last_mtime: mtime,
                    content_md5: md5,
                },
            },
            Err(e) => ParseOutcome::Failed {
                message: e.to_string(),
            },
        }
    }
}

impl ProjectIndexer {
    /// Posts a parse task for `abs_path` unless one is already in flight or
    /// the file's module is unknown.
    pub fn build_file(&mut self, ctx: &ServerContext, abs_path: &Path) {
        let rel_path = relative_to(abs_path, &self.home_path);
        if self.in_parsing.contains(&rel_path) {
            debug!(project = %self.name, file = %rel_path.display(), "already parsing");
            return;
        }
        let Some(arguments) = self.flag_cache.file_flags(abs_path) else {
            debug!(project = %self.name, file = %abs_path.display(), "module unknown");
            return;
        };
        let reader = match self.store.reader() {
            Ok(reader) => reader,
            Err(e) => {
                error!(project = %self.name, error = %e, "cannot open store reader");
                return;
            }
        };

        self.in_parsing.insert(rel_path.clone());
        let task = ParseTask {
            project: self.name.clone(),
            abs_path: abs_path.to_path_buf(),
            rel_path,
            arguments,
            reader,
            main_tx: ctx.main_tx.clone(),
        };
        ctx.pool.spawn(move || task.run());
    }

    /// Main-thread completion handler. The in-flight marker is cleared
    /// before anything else so a failed commit cannot wedge the file.
    pub fn on_parse_completed(&mut self, rel_path: &Path, outcome: ParseOutcome) {
        self.in_parsing.remove(rel_path);
        match outcome {
            ParseOutcome::Skipped => {
                debug!(project = %self.name, file = %rel_path.display(), "unchanged");
            }
            ParseOutcome::Failed { message } => {
                warn!(project = %self.name, file = %rel_path.display(), reason = %message,
                      "parse failed");
            }
            ParseOutcome::Parsed { unit, record } => {
                if let Err(e) = self.write_compiled_file(rel_path, &unit, record) {
                    error!(project = %self.name, file = %rel_path.display(), error = %e,
                           "commit failed, batch discarded");
                }
            }
        }
    }

    /// Commits one parse atomically: the file record, the definition delta
    /// and the reference delta go into a single batch.
    pub(crate) fn write_compiled_file(
        &mut self,
        rel_path: &Path,
        unit: &ParsedUnit,
        record: FileRecord,
    ) -> crate::error::Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(file_info_key(rel_path), schema::encode(&record)?);
        self.write_file_definitions(rel_path, &unit.defined, &mut batch)?;
        self.write_file_references(rel_path, &unit.referenced, &mut batch)?;
        debug!(project = %self.name, file = %rel_path.display(), ops = batch.len(), "commit");
        self.store.write(batch)
    }

    /// Three-way reconciliation of the file's defined symbols: the new
    /// parse, the previously stored set for this file, and the aggregated
    /// per-symbol records shared with other files.
    fn write_file_definitions(
        &self,
        rel_path: &Path,
        defined: &DefinedSymbolMap,
        batch: &mut WriteBatch,
    ) -> crate::error::Result<()> {
        let rel_str = rel_path.display().to_string();
        let module = self.flag_cache.module_name(rel_path).unwrap_or_default();

        let old: std::collections::BTreeSet<String> = self
            .load_record::<FileDefinedSymbols>(&file_symdef_key(rel_path))
            .map(|f| f.symbols)
            .unwrap_or_default();
        let new: std::collections::BTreeSet<String> = defined.keys().cloned().collect();

        for usr in old.difference(&new) {
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

        for (usr, parsed_loc) in defined {
            let new_loc = Location::new(rel_str.clone(), parsed_loc.line, parsed_loc.column);
            let key = symbol_def_key(usr);
            let existing = self.load_record::<SymbolDefinition>(&key);

            if old.contains(usr) {
                let current = existing
                    .as_ref()
                    .and_then(|def| self.location_in_module(def, &module));
                if current == Some(&new_loc) {
                    continue;
                }
            }

            let mut def = existing.unwrap_or_default();
            add_symbol_location(&mut def, &module, new_loc, &self.flag_cache);
            batch.put(key, schema::encode(&def)?);
        }

        if old != new {
            let key = file_symdef_key(rel_path);
            if new.is_empty() {
                batch.delete(key);
            } else {
                batch.put(key, schema::encode(&FileDefinedSymbols { symbols: new })?);
            }
        }
        Ok(())
    }

    /// Same reconciliation for references. Aggregated per USR so a symbol
    /// referenced across several modules is loaded and rewritten once.
    fn write_file_references(
        &self,
        rel_path: &Path,
        referenced: &ReferencedSymbolMap,
        batch: &mut WriteBatch,
    ) -> crate::error::Result<()> {
        use std::collections::{BTreeMap, BTreeSet};

        let rel_str = rel_path.display().to_string();

        let mut new: BTreeMap<(String, String), BTreeSet<LineCol>> = BTreeMap::new();
        for ((usr, target_file), locations) in referenced {
            let module = self
                .flag_cache
                .module_name(Path::new(target_file))
                .unwrap_or_default();
            new.entry((usr.clone(), module))
                .or_default()
                .extend(locations.iter().copied());
        }

        let old: BTreeMap<(String, String), BTreeSet<LineCol>> = self
            .load_record::<FileReferencedSymbols>(&file_symref_key(rel_path))
            .map(|f| {
                f.items
                    .into_iter()
                    .map(|item| ((item.usr, item.module), item.locations))
                    .collect()
            })
            .unwrap_or_default();

        let usrs: BTreeSet<&String> = old.keys().chain(new.keys()).map(|(usr, _)| usr).collect();
        for usr in usrs {
            let key = symbol_ref_key(usr);
            let mut sym: Option<SymbolReference> = None;
            let mut touched = false;

            for ((old_usr, module), _) in old.iter().filter(|((u, _), _)| u == usr) {
                if new.contains_key(&(old_usr.clone(), module.clone())) {
                    continue;
                }
                let record =
                    sym.get_or_insert_with(|| self.load_record(&key).unwrap_or_default());
                if let Some(files) = record.modules.get_mut(module) {
                    files.remove(&rel_str);
                    if files.is_empty() {
                        record.modules.remove(module);
                    }
                }
                touched = true;
            }

            for ((_, module), locations) in new.iter().filter(|((u, _), _)| u == usr) {
                if old.get(&(usr.to_string(), module.clone())) == Some(locations) {
                    continue;
                }
                let record =
                    sym.get_or_insert_with(|| self.load_record(&key).unwrap_or_default());
                record
                    .modules
                    .entry(module.clone())
                    .or_default()
                    .insert(rel_str.clone(), locations.clone());
                touched = true;
            }

            if touched {
                let record = sym.unwrap_or_default();
                if record.modules.is_empty() {
                    batch.delete(key);
                } else {
                    batch.put(key, schema::encode(&record)?);
                }
            }
        }

        if old != new {
            let key = file_symref_key(rel_path);
            if new.is_empty() {
                batch.delete(key);
            } else {
                let items = new
                    .into_iter()
                    .map(|((usr, module), locations)| FileReference {
                        usr,
                        module,
                        locations,
                    })
                    .collect();
                batch.put(key, schema::encode(&FileReferencedSymbols { items })?);
            }
        }
        Ok(())
    }
}

/// Replaces the entry of `module` in place, else appends. This is what keeps
/// a USR at one canonical location per module.
pub(crate) fn add_symbol_location(
    def: &mut SymbolDefinition,
    module: &str,
    location: Location,
    flags: &FlagCache,
) {
    let slot = def
        .locations
        .iter_mut()
        .find(|loc| module_of(flags, &loc.path) == module);
    match slot {
        Some(slot) => *slot = location,
        None => def.locations.push(location),
    }
}

/// Drops only `module`'s entry, leaving other modules' locations intact.
pub(crate) fn remove_module_location(def: &mut SymbolDefinition, module: &str, flags: &FlagCache) {
    def.locations
        .retain(|loc| module_of(flags, &loc.path) != module);
}

fn module_of(flags: &FlagCache, rel_path: &str) -> String {
    flags.module_name(Path::new(rel_path)).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::flags::CompileCommand;
    use crate::store::{OpenMode, Store};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    pub(crate) fn fixture() -> (TempDir, ProjectIndexer) {
        let tmp = TempDir::new().unwrap();
        let home_dir = tmp.path().join("proj");
        std::fs::create_dir_all(home_dir.join("exe")).unwrap();
        std::fs::create_dir_all(home_dir.join("lib")).unwrap();
        std::fs::write(home_dir.join("CMakeLists.txt"), "project(demo)\n").unwrap();

        let config = Arc::new(ProjectConfig::new("demo", &home_dir).unwrap());
        let home = config.home_path.clone();
        let build = config.build_path.clone();
        let store = Store::open(&tmp.path().join("demo.ldb"), OpenMode::CreateIfMissing).unwrap();
        let mut project = ProjectIndexer::from_parts(Arc::clone(&config), store, Vec::new());

        let entries = vec![
            CompileCommand {
                file: home.join("exe/a.cpp").display().to_string(),
                directory: build.join("exe").display().to_string(),
                command: "/usr/bin/c++ -c a.cpp".to_string(),
            },
            CompileCommand {
                file: home.join("lib/x.cpp").display().to_string(),
                directory: build.join("lib").display().to_string(),
                command: "/usr/bin/c++ -c x.cpp".to_string(),
            },
        ];
        let mut paths = BTreeSet::new();
        project
            .flag_cache
            .load_manifest(&entries, &build, &config, &[], &mut paths);
        project.abs_src_paths = paths;
        (tmp, project)
    }

    pub(crate) fn unit_with(
        defs: &[(&str, u32, u32)],
        refs: &[(&str, &str, &[LineCol])],
        home: &Path,
        primary_rel: &str,
    ) -> ParsedUnit {
        let mut unit = ParsedUnit::default();
        let primary = home.join(primary_rel).display().to_string();
        for (usr, line, column) in defs {
            unit.defined
                .insert(usr.to_string(), Location::new(primary.clone(), *line, *column));
        }
        for (usr, target_rel, locations) in refs {
            unit.referenced.insert(
                (
                    usr.to_string(),
                    home.join(target_rel).display().to_string(),
                ),
                locations.iter().copied().collect(),
            );
        }
        unit
    }

    fn record(mtime: i64) -> FileRecord {
        FileRecord {
            last_mtime: mtime,
            content_md5: [0u8; 16],
        }
    }

    #[test]
    fn definitions_round_trip_through_commit() {
        let (_tmp, mut project) = fixture();
        let home = project.home_path.clone();
        let unit = unit_with(&[("c:@F@fn#", 1, 6)], &[], &home, "exe/a.cpp");

        project
            .write_compiled_file(Path::new("exe/a.cpp"), &unit, record(100))
            .unwrap();

        let symbols = project.list_file_symbols(Path::new("exe/a.cpp")).unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].0, "c:@F@fn#");
        assert_eq!(symbols[0].1.line, 1);
        assert_eq!(symbols[0].1.column, 6);

        let locations = project.query_symbol_definitions("c:@F@fn#");
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].path, home.join("exe/a.cpp").display().to_string());

        let hinted = project
            .query_symbol_definition_with_hint("c:@F@fn#", &home.join("exe/a.cpp"))
            .unwrap();
        assert_eq!(hinted.line, 1);
    }

    #[test]
    fn renaming_a_symbol_replaces_its_record() {
        let (_tmp, mut project) = fixture();
        let home = project.home_path.clone();
        let rel = Path::new("exe/a.cpp");

        let v1 = unit_with(&[("c:@F@fn#", 1, 6)], &[], &home, "exe/a.cpp");
        project.write_compiled_file(rel, &v1, record(100)).unwrap();

        let v2 = unit_with(&[("c:@F@gn#", 1, 6)], &[], &home, "exe/a.cpp");
        project.write_compiled_file(rel, &v2, record(200)).unwrap();

        assert!(project.query_symbol_definitions("c:@F@fn#").is_empty());
        assert_eq!(project.query_symbol_definitions("c:@F@gn#").len(), 1);
        let symbols = project.list_file_symbols(rel).unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].0, "c:@F@gn#");
    }

    #[test]
    fn recommitting_an_identical_unit_changes_nothing() {
        let (_tmp, mut project) = fixture();
        let home = project.home_path.clone();
        let rel = Path::new("exe/a.cpp");
        let unit = unit_with(
            &[("c:@F@fn#", 1, 6)],
            &[("c:@F@h#", "lib/x.h", &[(3, 7)])],
            &home,
            "exe/a.cpp",
        );

        project.write_compiled_file(rel, &unit, record(100)).unwrap();
        let defs_before = project.store.get(&file_symdef_key(rel)).unwrap();
        let refs_before = project.store.get(&file_symref_key(rel)).unwrap();

        project.write_compiled_file(rel, &unit, record(100)).unwrap();
        assert_eq!(project.store.get(&file_symdef_key(rel)).unwrap(), defs_before);
        assert_eq!(project.store.get(&file_symref_key(rel)).unwrap(), refs_before);
    }

    #[test]
    fn one_location_per_module_for_shared_usrs() {
        let (_tmp, mut project) = fixture();
        let home = project.home_path.clone();

        let in_exe = unit_with(&[("c:@F@h#", 2, 13)], &[], &home, "exe/a.cpp");
        project
            .write_compiled_file(Path::new("exe/a.cpp"), &in_exe, record(100))
            .unwrap();

        let in_lib = unit_with(&[("c:@F@h#", 2, 13)], &[], &home, "lib/x.cpp");
        project
            .write_compiled_file(Path::new("lib/x.cpp"), &in_lib, record(100))
            .unwrap();

        let locations = project.query_symbol_definitions("c:@F@h#");
        assert_eq!(locations.len(), 2);

        // A later parse of the same file replaces its module's entry rather
        // than growing the list.
        let moved = unit_with(&[("c:@F@h#", 5, 1)], &[], &home, "exe/a.cpp");
        project
            .write_compiled_file(Path::new("exe/a.cpp"), &moved, record(200))
            .unwrap();
        let locations = project.query_symbol_definitions("c:@F@h#");
        assert_eq!(locations.len(), 2);
        let hinted = project
            .query_symbol_definition_with_hint("c:@F@h#", &home.join("exe/a.cpp"))
            .unwrap();
        assert_eq!(hinted.line, 5);
    }

    #[test]
    fn references_round_trip_and_update() {
        let (_tmp, mut project) = fixture();
        let home = project.home_path.clone();
        let rel = Path::new("exe/a.cpp");

        let v1 = unit_with(
            &[],
            &[("c:@F@h#", "lib/x.h", &[(3, 7), (9, 2)])],
            &home,
            "exe/a.cpp",
        );
        project.write_compiled_file(rel, &v1, record(100)).unwrap();

        let refs = project.list_file_references(rel).unwrap();
        assert_eq!(refs, vec![("c:@F@h#".to_string(), vec![(3, 7), (9, 2)])]);

        let sites = project.query_symbol_references("c:@F@h#", None);
        assert_eq!(sites.len(), 2);
        assert!(sites
            .iter()
            .all(|l| l.path == home.join("exe/a.cpp").display().to_string()));

        // The use sites moved.
        let v2 = unit_with(
            &[],
            &[("c:@F@h#", "lib/x.h", &[(4, 7)])],
            &home,
            "exe/a.cpp",
        );
        project.write_compiled_file(rel, &v2, record(200)).unwrap();
        let sites = project.query_symbol_references("c:@F@h#", None);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].line, 4);
    }

    #[test]
    fn one_usr_referenced_across_two_modules() {
        let (_tmp, mut project) = fixture();
        let home = project.home_path.clone();
        let rel = Path::new("exe/a.cpp");

        let v1 = unit_with(
            &[],
            &[
                ("c:@F@h#", "lib/x.h", &[(3, 7)]),
                ("c:@F@h#", "exe/b.h", &[(8, 1)]),
            ],
            &home,
            "exe/a.cpp",
        );
        project.write_compiled_file(rel, &v1, record(100)).unwrap();

        let sym: SymbolReference = project
            .load_record(&symbol_ref_key("c:@F@h#"))
            .expect("reference record");
        assert!(sym.modules.contains_key("lib"));
        assert!(sym.modules.contains_key("exe"));

        // Dropping the lib-side reference must not resurrect or clobber the
        // exe-side entry.
        let v2 = unit_with(&[], &[("c:@F@h#", "exe/b.h", &[(8, 1)])], &home, "exe/a.cpp");
        project.write_compiled_file(rel, &v2, record(200)).unwrap();

        let sym: SymbolReference = project
            .load_record(&symbol_ref_key("c:@F@h#"))
            .expect("reference record");
        assert!(!sym.modules.contains_key("lib"));
        assert_eq!(
            sym.modules["exe"]["exe/a.cpp"],
            BTreeSet::from([(8u32, 1u32)])
        );
    }

    #[test]
    fn empty_unit_clears_the_per_file_rows() {
        let (_tmp, mut project) = fixture();
        let home = project.home_path.clone();
        let rel = Path::new("exe/a.cpp");

        let v1 = unit_with(
            &[("c:@F@fn#", 1, 6)],
            &[("c:@F@h#", "lib/x.h", &[(3, 7)])],
            &home,
            "exe/a.cpp",
        );
        project.write_compiled_file(rel, &v1, record(100)).unwrap();

        let empty = ParsedUnit::default();
        project.write_compiled_file(rel, &empty, record(200)).unwrap();

        assert!(project.store.get(&file_symdef_key(rel)).unwrap().is_none());
        assert!(project.store.get(&file_symref_key(rel)).unwrap().is_none());
        assert!(project.query_symbol_definitions("c:@F@fn#").is_empty());
        assert!(project.query_symbol_references("c:@F@h#", None).is_empty());
        // The skip-cache record survives.
        assert!(project.store.get(&file_info_key(rel)).unwrap().is_some());
    }

    #[test]
    fn at_most_one_parse_per_file() {
        let (_tmp, mut project) = fixture();
        let home = project.home_path.clone();
        let abs = home.join("exe/a.cpp");

        let (tx, rx) = crossbeam_channel::unbounded();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let inotify = inotify::Inotify::init().unwrap();
        let data = TempDir::new().unwrap();
        let config_xml = format!(
            "<Config><LogDir>{d}/log</LogDir><DataDir>{d}/db</DataDir></Config>",
            d = data.path().display()
        );
        let config_path = data.path().join("Config.xml");
        std::fs::write(&config_path, config_xml).unwrap();
        let ctx = ServerContext {
            main_tx: tx,
            watches: inotify.watches(),
            pool: Arc::new(pool),
            config: Arc::new(crate::config::Config::load(&config_path).unwrap()),
        };

        // The file does not exist on disk, so the worker fails fast; what
        // matters is that the second dispatch is swallowed.
        project.build_file(&ctx, &abs);
        project.build_file(&ctx, &abs);
        assert_eq!(project.in_parsing.len(), 1);

        let completion = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("one completion");
        match completion {
            MainTask::ParseCompleted {
                rel_path, outcome, ..
            } => {
                assert!(matches!(outcome, ParseOutcome::Failed { .. }));
                project.on_parse_completed(&rel_path, outcome);
            }
            _ => panic!("unexpected main task"),
        }
        assert!(project.in_parsing.is_empty());
        assert!(rx
            .recv_timeout(std::time::Duration::from_millis(300))
            .is_err());

        // After completion the file may be scheduled again.
        project.build_file(&ctx, &abs);
        assert_eq!(project.in_parsing.len(), 1);
    }

    #[test]
    fn worker_skips_on_matching_mtime_then_md5() {
        let (_tmp, project) = fixture();
        let home = project.home_path.clone();
        let abs = home.join("exe/a.cpp");
        std::fs::write(&abs, "void fn() {}\n").unwrap();
        let mtime = crate::fs_utils::last_mtime(&abs).unwrap();
        let md5 = content_md5(&std::fs::read(&abs).unwrap());

        let (tx, _rx) = crossbeam_channel::unbounded();
        let task = || ParseTask {
            project: "demo".to_string(),
            abs_path: abs.clone(),
            rel_path: PathBuf::from("exe/a.cpp"),
            arguments: Arc::new(Vec::new()),
            reader: project.store.reader().unwrap(),
            main_tx: tx.clone(),
        };
        let store_record = |record: &FileRecord| {
            project
                .store
                .put(
                    &file_info_key(Path::new("exe/a.cpp")),
                    &schema::encode(record).unwrap(),
                )
                .unwrap();
        };

        // Fast skip on matching mtime.
        store_record(&FileRecord {
            last_mtime: mtime,
            content_md5: [0u8; 16],
        });
        assert!(matches!(task().execute(), ParseOutcome::Skipped));

        // Stale mtime but identical content skips on the digest.
        store_record(&FileRecord {
            last_mtime: mtime - 10,
            content_md5: md5,
        });
        assert!(matches!(task().execute(), ParseOutcome::Skipped));

        // A vanished file fails without committing anything.
        let gone = ParseTask {
            project: "demo".to_string(),
            abs_path: home.join("exe/missing.cpp"),
            rel_path: PathBuf::from("exe/missing.cpp"),
            arguments: Arc::new(Vec::new()),
            reader: project.store.reader().unwrap(),
            main_tx: tx,
        };
        assert!(matches!(gone.execute(), ParseOutcome::Failed { .. }));
    }
}
