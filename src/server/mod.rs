//! Process-wide coordinator.
//!
//! A single main thread owns every project indexer and executes all state
//! mutation: it drains one channel of [`MainTask`] messages (file-system
//! events, worker completions, client requests) with a timeout against the
//! earliest due project timer. The only other long-lived threads are the
//! inotify reader, the socket acceptor with its per-connection sessions, and
//! the rayon worker pool running parse-and-hash tasks.

pub mod session;

use std::collections::HashMap;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use inotify::{Inotify, WatchDescriptor, Watches};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Result, SymdbError};
use crate::fs_utils::is_cpp_source;
use crate::project::{ParseOutcome, ProjectIndexer};
use crate::protocol::{self, Request, Response};
use crate::store::Store;
use crate::watcher::{self, FsEvent, FsEventKind};

/// Short-lived editor artifact; vim probes writability with this name.
const SKIP_FILE_NAME: &str = "4913";

/// The one non-source file whose edits matter: it drives the force-sync.
const CMAKE_FILE_NAME: &str = "CMakeLists.txt";

/// Everything executed on the main thread arrives as one of these.
pub enum MainTask {
    FsEvents(Vec<FsEvent>),
    ParseCompleted {
        project: String,
        rel_path: PathBuf,
        outcome: ParseOutcome,
    },
    Request {
        request: Request,
        reply: Sender<Response>,
    },
}

/// Shared handles a project needs to schedule work: the way back to the
/// main thread, the watch registry and the worker pool. Cheap to clone.
#[derive(Clone)]
pub struct ServerContext {
    pub main_tx: Sender<MainTask>,
    pub watches: Watches,
    pub pool: Arc<rayon::ThreadPool>,
    pub config: Arc<Config>,
}

pub struct Server {
    ctx: ServerContext,
    main_rx: Receiver<MainTask>,
    projects: HashMap<String, ProjectIndexer>,
}

/// True when a live server already answers on the socket.
pub fn is_server_running(listen_path: &Path) -> bool {
    UnixStream::connect(listen_path).is_ok()
}

impl Server {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let (main_tx, main_rx) = crossbeam_channel::unbounded();

        let inotify = Inotify::init()?;
        let watches = inotify.watches();
        let events_tx = main_tx.clone();
        watcher::spawn_reader(inotify, move |events| {
            events_tx.send(MainTask::FsEvents(events)).is_ok()
        })?;

        // One worker per logical CPU; only parse-and-hash runs there.
        let pool = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("symdb-worker-{i}"))
            .build()
            .map_err(|e| SymdbError::config(format!("worker pool: {e}")))?;

        let ctx = ServerContext {
            main_tx,
            watches,
            pool: Arc::new(pool),
            config,
        };

        Ok(Self {
            ctx,
            main_rx,
            projects: HashMap::new(),
        })
    }

    /// Runs the main loop until every task sender is gone.
    pub fn run(&mut self, listener: UnixListener) -> Result<()> {
        session::spawn_acceptor(listener, self.ctx.main_tx.clone())?;
        self.load_configured_projects();

        loop {
            let timeout = self.next_timer_due();
            match self.main_rx.recv_timeout(timeout) {
                Ok(task) => self.handle_task(task),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.run_due_timers();
        }
        Ok(())
    }

    fn load_configured_projects(&mut self) {
        let configs = self.ctx.config.projects.clone();
        for config in configs {
            if let Some(existing) = self.projects.get(&config.name) {
                if existing.home_path() != config.home_path {
                    error!(project = %config.name, "already loaded with a different home");
                }
                continue;
            }
            match ProjectIndexer::create_from_config(&self.ctx, Arc::clone(&config)) {
                Ok(project) => {
                    info!(project = %config.name, home = %config.home_path.display(), "project loaded");
                    self.projects.insert(config.name.clone(), project);
                }
                // The project is dropped; the server continues.
                Err(e) => error!(project = %config.name, error = %e, "project init failed"),
            }
        }
    }

    fn next_timer_due(&self) -> Duration {
        self.projects
            .values()
            .map(|p| p.due_in())
            .min()
            .unwrap_or(Duration::from_secs(1))
            .clamp(Duration::from_millis(50), Duration::from_secs(30))
    }

    fn run_due_timers(&mut self) {
        let ctx = self.ctx.clone();
        for project in self.projects.values_mut() {
            project.run_due_timers(&ctx);
        }
    }

    fn handle_task(&mut self, task: MainTask) {
        match task {
            MainTask::FsEvents(events) => {
                for event in events {
                    self.handle_fs_event(event);
                }
            }
            MainTask::ParseCompleted {
                project,
                rel_path,
                outcome,
            } => match self.projects.get_mut(&project) {
                Some(indexer) => indexer.on_parse_completed(&rel_path, outcome),
                // The project was deleted while the worker ran.
                None => debug!(project, file = %rel_path.display(), "completion for gone project"),
            },
            MainTask::Request { request, reply } => {
                let response = self.handle_request(request);
                let _ = reply.send(response);
            }
        }
    }

    fn handle_fs_event(&mut self, event: FsEvent) {
        if event.name == SKIP_FILE_NAME {
            return;
        }
        let about_dir = event.is_dir() || event.kind == FsEventKind::SelfDelete;
        if !about_dir && !is_cpp_source(Path::new(&event.name)) && event.name != CMAKE_FILE_NAME {
            return;
        }
        if self.ctx.config.is_file_excluded(Path::new(&event.name)) {
            debug!(name = %event.name, "event ignored by global pattern");
            return;
        }

        let ctx = self.ctx.clone();
        let Some(project) = self.project_by_watch(&event.wd) else {
            warn!(name = %event.name, "no project owns this watch");
            return;
        };
        match event.kind {
            FsEventKind::Create { is_dir } => {
                project.handle_entry_create(&ctx, &event.wd, &event.name, is_dir)
            }
            FsEventKind::Modify => project.handle_file_modified(&ctx, &event.wd, &event.name),
            FsEventKind::Delete { is_dir } => {
                project.handle_entry_deleted(&event.wd, &event.name, is_dir)
            }
            FsEventKind::SelfDelete => project.handle_self_delete(&event.wd),
        }
    }

    fn project_by_watch(&mut self, wd: &WatchDescriptor) -> Option<&mut ProjectIndexer> {
        self.projects.values_mut().find(|p| p.has_watch(wd))
    }

    /// Returns the live indexer, lazily reopening it from its database when
    /// the name is not in memory.
    fn get_or_load_project(&mut self, name: &str) -> Option<&mut ProjectIndexer> {
        if !self.projects.contains_key(name) {
            match ProjectIndexer::create_from_database(&self.ctx, name) {
                Ok(project) => {
                    info!(project = name, "reopened from database");
                    self.projects.insert(name.to_string(), project);
                }
                Err(e) => {
                    error!(project = name, error = %e, "cannot load project");
                    return None;
                }
            }
        }
        self.projects.get_mut(name)
    }

    // -- request handling ---------------------------------------------------

    fn handle_request(&mut self, request: Request) -> Response {
        match request {
            Request::CreateProject(req) => Response::CreateProject(self.create_project(req)),
            Request::UpdateProject(req) => Response::UpdateProject(self.update_project(req)),
            Request::DeleteProject(req) => Response::DeleteProject(self.delete_project(req)),
            Request::ListProject(_) => Response::ListProject(self.list_projects()),
            Request::ListProjectFiles(req) => {
                Response::ListProjectFiles(self.list_project_files(req))
            }
            Request::GetSymbolDefinition(req) => {
                Response::GetSymbolDefinition(self.get_symbol_definition(req))
            }
            Request::GetSymbolReferences(req) => {
                Response::GetSymbolReferences(self.get_symbol_references(req))
            }
            Request::ListFileSymbols(req) => Response::ListFileSymbols(self.list_file_symbols(req)),
            Request::ListFileReferences(req) => {
                Response::ListFileReferences(self.list_file_references(req))
            }
            Request::RebuildFile(req) => Response::RebuildFile(self.rebuild_file(req)),
        }
    }

    fn create_project(&mut self, req: protocol::CreateProjectReq) -> protocol::CreateProjectRsp {
        let mut rsp = protocol::CreateProjectRsp::default();
        debug!(project = %req.proj_name, home = %req.home_dir, "create project");

        if !protocol::is_valid_project_name(&req.proj_name) {
            rsp.error = protocol::ERR_INVALID_PROJ_NAME.to_string();
            return rsp;
        }
        let home = PathBuf::from(&req.home_dir);
        if !home.exists() {
            rsp.error = protocol::ERR_PROJ_HOME_NOT_EXISTS.to_string();
            return rsp;
        }

        if let Some(existing) = self.projects.get(&req.proj_name) {
            let same = home
                .canonicalize()
                .map(|h| h == existing.home_path())
                .unwrap_or(false);
            if !same {
                rsp.error = format!(
                    "project {} already exists with home {}",
                    req.proj_name,
                    existing.home_path().display()
                );
            }
            return rsp;
        }

        match ProjectIndexer::create_from_config_file(&self.ctx, &req.proj_name, &home) {
            Ok(project) => {
                self.projects.insert(req.proj_name.clone(), project);
            }
            Err(e) => {
                error!(project = %req.proj_name, error = %e, "create failed");
                rsp.error = e.to_string();
            }
        }
        rsp
    }

    fn update_project(&mut self, req: protocol::UpdateProjectReq) -> protocol::UpdateProjectRsp {
        let mut rsp = protocol::UpdateProjectRsp::default();
        let ctx = self.ctx.clone();
        match self.get_or_load_project(&req.proj_name) {
            Some(project) => project.build(&ctx),
            None => rsp.error = protocol::ERR_PROJECT_NOT_FOUND.to_string(),
        }
        rsp
    }

    fn delete_project(&mut self, req: protocol::DeleteProjectReq) -> protocol::DeleteProjectRsp {
        let mut rsp = protocol::DeleteProjectRsp::default();
        let Some(project) = self.projects.remove(&req.proj_name) else {
            rsp.error = protocol::ERR_PROJECT_NOT_FOUND.to_string();
            return rsp;
        };
        let db_dir = project.store_dir();
        // Watches and the store handle go down with the indexer.
        drop(project);
        if let Err(e) = Store::destroy(&db_dir) {
            error!(project = %req.proj_name, error = %e, "failed to remove database");
            rsp.error = e.to_string();
        } else {
            info!(project = %req.proj_name, "project deleted");
        }
        rsp
    }

    fn list_projects(&self) -> protocol::ListProjectRsp {
        let mut rsp = protocol::ListProjectRsp::default();
        rsp.projects = self
            .projects
            .values()
            .map(|p| protocol::ProjectBrief {
                name: p.name().to_string(),
                home_path: p.home_path().display().to_string(),
            })
            .collect();
        rsp.projects.sort_by(|a, b| a.name.cmp(&b.name));
        rsp
    }

    fn list_project_files(
        &mut self,
        req: protocol::ListProjectFilesReq,
    ) -> protocol::ListProjectFilesRsp {
        let mut rsp = protocol::ListProjectFilesRsp::default();
        match self.get_or_load_project(&req.proj_name) {
            Some(project) => {
                rsp.home_path = project.home_path().display().to_string();
                rsp.files = project.rel_src_paths();
            }
            None => rsp.error = protocol::ERR_PROJECT_NOT_FOUND.to_string(),
        }
        rsp
    }

    fn get_symbol_definition(
        &mut self,
        req: protocol::GetSymbolDefinitionReq,
    ) -> protocol::GetSymbolDefinitionRsp {
        let mut rsp = protocol::GetSymbolDefinitionRsp::default();
        let Some(project) = self.get_or_load_project(&req.proj_name) else {
            rsp.error = protocol::ERR_PROJECT_NOT_FOUND.to_string();
            return rsp;
        };

        if req.abs_path.is_empty() {
            rsp.locations = project.query_symbol_definitions(&req.symbol);
        } else if let Some(location) =
            project.query_symbol_definition_with_hint(&req.symbol, Path::new(&req.abs_path))
        {
            rsp.locations.push(location);
        }

        if rsp.locations.is_empty() {
            rsp.error = protocol::ERR_SYMBOL_NOT_FOUND.to_string();
        }
        rsp
    }

    fn get_symbol_references(
        &mut self,
        req: protocol::GetSymbolReferencesReq,
    ) -> protocol::GetSymbolReferencesRsp {
        let mut rsp = protocol::GetSymbolReferencesRsp::default();
        let Some(project) = self.get_or_load_project(&req.proj_name) else {
            rsp.error = protocol::ERR_PROJECT_NOT_FOUND.to_string();
            return rsp;
        };

        let hint = (!req.path.is_empty()).then(|| PathBuf::from(&req.path));
        rsp.locations = project.query_symbol_references(&req.symbol, hint.as_deref());
        if rsp.locations.is_empty() {
            rsp.error = protocol::ERR_SYMBOL_NOT_FOUND.to_string();
        }
        rsp
    }

    fn list_file_symbols(
        &mut self,
        req: protocol::ListFileSymbolsReq,
    ) -> protocol::ListFileSymbolsRsp {
        let mut rsp = protocol::ListFileSymbolsRsp::default();
        let Some(project) = self.get_or_load_project(&req.proj_name) else {
            rsp.error = protocol::ERR_PROJECT_NOT_FOUND.to_string();
            return rsp;
        };

        match project.list_file_symbols(Path::new(&req.relative_path)) {
            Some(symbols) => {
                rsp.symbols = symbols
                    .into_iter()
                    .map(|(name, location)| protocol::FileSymbol {
                        name,
                        line: location.line,
                        column: location.column,
                    })
                    .collect();
            }
            None => rsp.error = protocol::ERR_SYMBOL_NOT_FOUND.to_string(),
        }
        rsp
    }

    fn list_file_references(
        &mut self,
        req: protocol::ListFileReferencesReq,
    ) -> protocol::ListFileReferencesRsp {
        let mut rsp = protocol::ListFileReferencesRsp::default();
        let Some(project) = self.get_or_load_project(&req.proj_name) else {
            rsp.error = protocol::ERR_PROJECT_NOT_FOUND.to_string();
            return rsp;
        };

        match project.list_file_references(Path::new(&req.relative_path)) {
            Some(symbols) => {
                rsp.symbols = symbols
                    .into_iter()
                    .map(|(name, locations)| protocol::FileRefSymbol { name, locations })
                    .collect();
            }
            None => rsp.error = protocol::ERR_SYMBOL_NOT_FOUND.to_string(),
        }
        rsp
    }

    fn rebuild_file(&mut self, req: protocol::RebuildFileReq) -> protocol::RebuildFileRsp {
        let mut rsp = protocol::RebuildFileRsp::default();
        let ctx = self.ctx.clone();
        let Some(project) = self.get_or_load_project(&req.proj_name) else {
            rsp.error = protocol::ERR_PROJECT_NOT_FOUND.to_string();
            return rsp;
        };

        let abs_path = project.home_path().join(&req.relative_path);
        if !abs_path.exists() {
            rsp.error = protocol::ERR_SYMBOL_NOT_FOUND.to_string();
            return rsp;
        }
        project.rebuild_file(&ctx, &abs_path);
        rsp
    }
}
