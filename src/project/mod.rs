//! Per-project indexer: the state machine that owns one project's database,
//! compiler-flag cache, watcher set and sync timers, and keeps the persisted
//! symbol index coherent with the tree on disk.
//!
//! All methods run on the server's main thread. The only work leaving this
//! thread is the parse-and-hash task posted by `build_file`; its completion
//! comes back as a message and is committed here.

mod build;
mod events;
mod sync;

pub use build::{ParseOutcome, ParseTask};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use inotify::WatchDescriptor;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::config::ProjectConfig;
use crate::error::{Result, SymdbError};
use crate::fs_utils::{absolute_from, relative_to};
use crate::flags::FlagCache;
use crate::schema::{
    self, file_symdef_key, project_key, FileDefinedSymbols, FileReferencedSymbols, LineCol,
    Location, ProjectInfo, SymbolDefinition, SymbolReference, HOME_KEY,
};
use crate::server::ServerContext;
use crate::store::{OpenMode, Store, WriteBatch};
use crate::watcher::DirWatcher;

pub struct ProjectIndexer {
    pub(crate) name: String,
    pub(crate) home_path: PathBuf,
    pub(crate) cmake_file_path: PathBuf,
    pub(crate) config: Arc<ProjectConfig>,
    pub(crate) store: Store,
    pub(crate) flag_cache: FlagCache,
    /// Absolute paths of every source file belonging to the project.
    pub(crate) abs_src_paths: BTreeSet<PathBuf>,
    /// Project-relative paths currently posted to the worker pool.
    pub(crate) in_parsing: HashSet<PathBuf>,
    /// Absolute paths queued for the next smart sync.
    pub(crate) modified: Vec<PathBuf>,
    pub(crate) watchers: HashMap<WatchDescriptor, DirWatcher>,
    pub(crate) next_smart_sync: Instant,
    pub(crate) next_force_sync: chrono::NaiveDateTime,
    pub(crate) sys_include_flags: Vec<String>,
}

impl ProjectIndexer {
    /// Builds the in-memory shell around an opened store. No configure step
    /// runs here; callers follow up with a sync.
    pub(crate) fn from_parts(
        config: Arc<ProjectConfig>,
        store: Store,
        sys_include_flags: Vec<String>,
    ) -> Self {
        let home_path = config.home_path.clone();
        let cmake_file_path = config.cmake_file.clone();
        Self {
            name: config.name.clone(),
            flag_cache: FlagCache::new(home_path.clone()),
            home_path,
            cmake_file_path,
            config,
            store,
            abs_src_paths: BTreeSet::new(),
            in_parsing: HashSet::new(),
            modified: Vec::new(),
            watchers: HashMap::new(),
            next_smart_sync: Instant::now() + sync::SMART_SYNC_INTERVAL,
            next_force_sync: sync::next_force_sync(Local::now().naive_local()),
            sys_include_flags,
        }
    }

    /// Reopens or creates the project from a configuration entry. Persisted
    /// state is reused when it matches the configured home; a corrupt or
    /// unopenable database is removed and recreated.
    pub fn create_from_config(ctx: &ServerContext, config: Arc<ProjectConfig>) -> Result<Self> {
        let db_dir = ctx.config.db_root.join(format!("{}.ldb", config.name));
        let store = match Store::open(&db_dir, OpenMode::CreateIfMissing) {
            Ok(store) => store,
            Err(e) => {
                warn!(project = %config.name, error = %e, "reopen failed, recreating database");
                Store::destroy(&db_dir)?;
                Store::open(&db_dir, OpenMode::CreateIfMissing)?
            }
        };

        let mut project =
            Self::from_parts(config, store, ctx.config.sys_include_flags.clone());

        match project.load_home()? {
            Some(home) if home == project.home_path => {
                if let Err(e) = project.load_project_info() {
                    warn!(project = %project.name, error = %e, "no persisted source set");
                }
            }
            other => {
                if let Some(stale) = other {
                    info!(project = %project.name, old = %stale.display(),
                          new = %project.home_path.display(), "home changed, reindexing");
                }
                project.persist_home()?;
            }
        }

        project.force_sync(ctx);
        Ok(project)
    }

    /// Creates a fresh project from an explicit home path.
    pub fn create_from_config_file(
        ctx: &ServerContext,
        name: &str,
        home: &Path,
    ) -> Result<Self> {
        let mut config = ProjectConfig::new(name, home)?;
        ctx.config.specialize_for(&mut config);
        Self::create_from_config(ctx, Arc::new(config))
    }

    /// Reopens a project purely from its persisted state; used when a query
    /// names a project that was not in the configuration.
    pub fn create_from_database(ctx: &ServerContext, name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(SymdbError::project_init("empty project name"));
        }
        let db_dir = ctx.config.db_root.join(format!("{name}.ldb"));
        let store = Store::open(&db_dir, OpenMode::Open)?;

        let home = match store.get(HOME_KEY)? {
            Some(bytes) => PathBuf::from(String::from_utf8(bytes).map_err(|_| {
                SymdbError::project_init(format!("project {name} has a corrupt home record"))
            })?),
            None => {
                return Err(SymdbError::project_init(format!(
                    "project {name} home not set"
                )))
            }
        };

        let mut config = ProjectConfig::new(name, &home)?;
        ctx.config.specialize_for(&mut config);

        let mut project = Self::from_parts(
            Arc::new(config),
            store,
            ctx.config.sys_include_flags.clone(),
        );
        project.load_project_info()?;
        project.force_sync(ctx);
        Ok(project)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn home_path(&self) -> &Path {
        &self.home_path
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store.dir().to_path_buf()
    }

    pub fn has_watch(&self, wd: &WatchDescriptor) -> bool {
        self.watchers.contains_key(wd)
    }

    /// Project-relative paths of the current source set, in order.
    pub fn rel_src_paths(&self) -> Vec<String> {
        self.abs_src_paths
            .iter()
            .map(|abs| relative_to(abs, &self.home_path).display().to_string())
            .collect()
    }

    // -- persisted state ----------------------------------------------------

    fn load_home(&self) -> Result<Option<PathBuf>> {
        Ok(self
            .store
            .get(HOME_KEY)?
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map(PathBuf::from))
    }

    fn persist_home(&self) -> Result<()> {
        self.store
            .put(HOME_KEY, self.home_path.to_string_lossy().as_bytes())
    }

    fn load_project_info(&mut self) -> Result<()> {
        let key = project_key(&self.name);
        let Some(bytes) = self.store.get(&key)? else {
            return Err(SymdbError::project_init(format!(
                "project {} has no persisted source set",
                self.name
            )));
        };
        let info: ProjectInfo = schema::decode(&bytes)?;
        self.abs_src_paths = info
            .rel_paths
            .iter()
            .map(|rel| absolute_from(Path::new(rel), &self.home_path))
            .collect();
        debug!(project = %self.name, files = self.abs_src_paths.len(), "loaded source set");
        Ok(())
    }

    /// Queues the persisted snapshot of the source set into `batch`.
    pub(crate) fn write_src_paths(&self, batch: &mut WriteBatch) -> Result<()> {
        let info = ProjectInfo {
            rel_paths: self.rel_src_paths(),
        };
        batch.put(project_key(&self.name), schema::encode(&info)?);
        Ok(())
    }

    /// Loads and decodes one record, logging and absorbing store errors.
    pub(crate) fn load_record<T: DeserializeOwned>(&self, key: &[u8]) -> Option<T> {
        match self.store.get(key) {
            Ok(Some(bytes)) => match schema::decode(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    error!(project = %self.name, key = %String::from_utf8_lossy(key), error = %e,
                           "corrupt record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(project = %self.name, key = %String::from_utf8_lossy(key), error = %e,
                       "store read failed");
                None
            }
        }
    }

    // -- queries ------------------------------------------------------------

    fn to_abs_location(&self, loc: &Location) -> Location {
        let abs = absolute_from(Path::new(&loc.path), &self.home_path);
        Location::new(abs.display().to_string(), loc.line, loc.column)
    }

    /// Every stored definition of a USR, as absolute locations.
    pub fn query_symbol_definitions(&self, usr: &str) -> Vec<Location> {
        let Some(def) = self.load_record::<SymbolDefinition>(&schema::symbol_def_key(usr)) else {
            return Vec::new();
        };
        def.locations
            .iter()
            .map(|loc| self.to_abs_location(loc))
            .collect()
    }

    /// The definition from the module owning `abs_path` when there is one,
    /// else the first stored location.
    pub fn query_symbol_definition_with_hint(
        &self,
        usr: &str,
        abs_path: &Path,
    ) -> Option<Location> {
        let def = self.load_record::<SymbolDefinition>(&schema::symbol_def_key(usr))?;
        if let Some(module) = self.flag_cache.module_name(abs_path) {
            if let Some(loc) = self.location_in_module(&def, &module) {
                return Some(self.to_abs_location(loc));
            }
        }
        def.locations.first().map(|loc| self.to_abs_location(loc))
    }

    /// The entry of `def` whose path belongs to `module`.
    pub(crate) fn location_in_module<'a>(
        &self,
        def: &'a SymbolDefinition,
        module: &str,
    ) -> Option<&'a Location> {
        def.locations.iter().find(|loc| {
            match self.flag_cache.module_name(Path::new(&loc.path)) {
                Some(m) => m == module,
                None => module.is_empty(),
            }
        })
    }

    /// USRs defined by a file, each with its location inside the file's
    /// module. Returns `None` when the file has no persisted symbols.
    pub fn list_file_symbols(&self, rel_path: &Path) -> Option<Vec<(String, Location)>> {
        let defs = self.load_record::<FileDefinedSymbols>(&file_symdef_key(rel_path))?;
        let module = self.flag_cache.module_name(rel_path).unwrap_or_default();
        let mut out = Vec::with_capacity(defs.symbols.len());
        for usr in &defs.symbols {
            let Some(def) = self.load_record::<SymbolDefinition>(&schema::symbol_def_key(usr))
            else {
                error!(project = %self.name, symbol = %usr, "defined symbol has no record");
                continue;
            };
            match self.location_in_module(&def, &module) {
                Some(loc) => out.push((usr.clone(), loc.clone())),
                None => {
                    error!(project = %self.name, symbol = %usr, file = %rel_path.display(),
                           "no location under the file's module");
                }
            }
        }
        Some(out)
    }

    /// Referenced USRs of a file with their use sites. `None` when the file
    /// has no persisted references.
    pub fn list_file_references(&self, rel_path: &Path) -> Option<Vec<(String, Vec<LineCol>)>> {
        let refs = self.load_record::<FileReferencedSymbols>(&schema::file_symref_key(rel_path))?;
        Some(
            refs.items
                .iter()
                .map(|item| (item.usr.clone(), item.locations.iter().copied().collect()))
                .collect(),
        )
    }

    /// Absolute use sites of a USR. With a path hint, only the hint module's
    /// references are returned when that module has any.
    pub fn query_symbol_references(&self, usr: &str, path_hint: Option<&Path>) -> Vec<Location> {
        let Some(sym) = self.load_record::<SymbolReference>(&schema::symbol_ref_key(usr)) else {
            return Vec::new();
        };

        let pack = |files: &std::collections::BTreeMap<String, BTreeSet<LineCol>>| {
            let mut out = Vec::new();
            for (rel, locs) in files {
                let abs = absolute_from(Path::new(rel), &self.home_path);
                for (line, column) in locs {
                    out.push(Location::new(abs.display().to_string(), *line, *column));
                }
            }
            out
        };

        if let Some(hint) = path_hint {
            if let Some(module) = self.flag_cache.module_name(hint) {
                if let Some(files) = sym.modules.get(&module) {
                    return pack(files);
                }
            }
        }

        let mut out = Vec::new();
        for files in sym.modules.values() {
            out.extend(pack(files));
        }
        out
    }

    /// Explicit re-parse of one file: wipes its persisted rows, then runs
    /// the normal build pipeline.
    pub fn rebuild_file(&mut self, ctx: &ServerContext, abs_path: &Path) {
        if let Err(e) = self.purge_file(abs_path) {
            error!(project = %self.name, file = %abs_path.display(), error = %e,
                   "purge before rebuild failed");
        }
        self.build_file(ctx, abs_path);
    }
}
