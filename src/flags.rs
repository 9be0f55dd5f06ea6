//! Compiler-flag cache.
//!
//! Runs the project's cmake configure step with compile-command export,
//! groups the resulting manifest by module (the compile working directory
//! relative to the build root) and keeps, per module, a pruned argument
//! vector suitable for handing straight to libclang.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ProjectConfig;
use crate::error::{Result, SymdbError};
use crate::fs_utils::{path_has_prefix, relative_to};

/// Matches C++ driver basenames, versioned or not: `c++`, `g++`,
/// `clang++-3.7`, `c++-10.2` and so on.
static CPP_DRIVER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+\+(-\d+(\.\d+){0,2})?$").expect("driver regex"));

/// Options stripped from compile commands, with their argument counts.
const FLAGS_TO_SKIP: [(&str, usize); 11] = [
    ("-c", 0),
    ("-MD", 0),
    ("-MMD", 0),
    ("-MP", 0),
    ("-rdynamic", 0),
    ("--fcolor-diagnostics", 0),
    ("-MF", 1),
    ("-MQ", 1),
    ("-MT", 1),
    ("-o", 1),
    ("--serialize-diagnostics", 1),
];

/// One entry of `compile_commands.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompileCommand {
    pub file: String,
    pub directory: String,
    pub command: String,
}

/// Reduces a tokenised compile command to the arguments libclang needs.
///
/// Leading option-only tokens are dropped, the compiler executable is
/// examined (a C++ driver inserts `-x c++`) and removed, the skip-table
/// options lose themselves and their arguments, and the source file's own
/// absolute path disappears.
pub fn prune_compiler_flags(tokens: Vec<String>, source_file: &str) -> Vec<String> {
    let mut iter = tokens.into_iter().skip_while(|t| t.starts_with('-'));

    let Some(compiler) = iter.next() else {
        return Vec::new();
    };

    let mut flags = Vec::new();
    let basename = Path::new(&compiler)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(compiler.clone());
    if CPP_DRIVER_RE.is_match(&basename) {
        flags.push("-x".to_string());
        flags.push("c++".to_string());
    }

    while let Some(token) = iter.next() {
        if let Some((_, nargs)) = FLAGS_TO_SKIP.iter().find(|(flag, _)| *flag == token) {
            for _ in 0..*nargs {
                iter.next();
            }
            continue;
        }
        if token.starts_with('/') && token == source_file {
            continue;
        }
        flags.push(token);
    }

    flags
}

/// Per-project mapping from source directories to modules and from modules
/// to pruned argument vectors.
pub struct FlagCache {
    home_path: PathBuf,
    module_flags: HashMap<String, Arc<Vec<String>>>,
    /// Home-relative directory → owning module. Module roots (the compile
    /// working directory relative to the build path) are mapped onto
    /// themselves so [`FlagCache::try_remove_dir`] can tell them apart.
    dir_modules: HashMap<PathBuf, String>,
}

impl FlagCache {
    pub fn new(home_path: PathBuf) -> Self {
        Self {
            home_path,
            module_flags: HashMap::new(),
            dir_modules: HashMap::new(),
        }
    }

    /// Re-runs the configure step and rebuilds both tables from the emitted
    /// manifest. On any failure the previous tables are left untouched.
    pub fn rebuild(
        &mut self,
        cmake_file: &Path,
        build_path: &Path,
        project: &ProjectConfig,
        sys_include_tail: &[String],
        abs_src_paths: &mut BTreeSet<PathBuf>,
    ) -> Result<()> {
        if !cmake_file.exists() {
            return Err(SymdbError::project_init(format!(
                "cmake file {} does not exist",
                cmake_file.display()
            )));
        }
        let cmake_dir = cmake_file.parent().unwrap_or(&self.home_path);
        fs::create_dir_all(build_path)?;

        let output = Command::new("cmake")
            .arg("-DCMAKE_EXPORT_COMPILE_COMMANDS=1")
            .arg("-S")
            .arg(cmake_dir)
            .arg("-B")
            .arg(build_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SymdbError::ConfigureFailed {
                message: format!(
                    "cmake exited with {}: {}",
                    output.status,
                    stderr.lines().last().unwrap_or("")
                ),
            });
        }

        let manifest = build_path.join("compile_commands.json");
        let text = fs::read_to_string(&manifest).map_err(|e| SymdbError::ConfigureFailed {
            message: format!("cannot read {}: {e}", manifest.display()),
        })?;
        let entries: Vec<CompileCommand> =
            serde_json::from_str(&text).map_err(|e| SymdbError::ConfigureFailed {
                message: format!("bad {}: {e}", manifest.display()),
            })?;

        self.module_flags.clear();
        self.dir_modules.clear();
        self.load_manifest(&entries, build_path, project, sys_include_tail, abs_src_paths);
        Ok(())
    }

    /// Folds a parsed manifest into the tables. Split from [`Self::rebuild`]
    /// so the grouping logic is reachable without a cmake run.
    pub fn load_manifest(
        &mut self,
        entries: &[CompileCommand],
        build_path: &Path,
        project: &ProjectConfig,
        sys_include_tail: &[String],
        abs_src_paths: &mut BTreeSet<PathBuf>,
    ) {
        for entry in entries {
            let abs_file = PathBuf::from(&entry.file);
            if project.is_file_excluded(&abs_file) {
                debug!(file = %abs_file.display(), "excluded by pattern");
                continue;
            }
            // Files generated out of source do not belong to the index.
            if path_has_prefix(&abs_file, build_path) {
                continue;
            }

            abs_src_paths.insert(abs_file.clone());

            let work_dir = PathBuf::from(&entry.directory);
            let module_name = relative_to(&work_dir, build_path).display().to_string();
            let parent = abs_file.parent().unwrap_or(&self.home_path);
            let rel_dir = relative_to(parent, &self.home_path);

            debug!(file = %abs_file.display(), module = %module_name, rel_dir = %rel_dir.display(), "manifest entry");

            self.dir_modules.insert(rel_dir, module_name.clone());

            if self.module_flags.contains_key(&module_name) {
                continue;
            }
            self.dir_modules
                .insert(PathBuf::from(&module_name), module_name.clone());

            let tokens: Vec<String> = entry.command.split_whitespace().map(String::from).collect();
            let mut flags = prune_compiler_flags(tokens, &abs_file.to_string_lossy());
            flags.extend(sys_include_tail.iter().cloned());
            self.module_flags.insert(module_name, Arc::new(flags));
        }
    }

    /// Argument vector for the module containing `abs_path`, if known.
    pub fn file_flags(&self, abs_path: &Path) -> Option<Arc<Vec<String>>> {
        let module = self.module_name(abs_path)?;
        self.module_flags.get(&module).cloned()
    }

    pub fn flags_of_module(&self, module: &str) -> Option<Arc<Vec<String>>> {
        self.module_flags.get(module).cloned()
    }

    /// The module owning `path`. Accepts absolute or home-relative paths;
    /// directories resolve directly, files through their parent directory.
    pub fn module_name(&self, path: &Path) -> Option<String> {
        let rel = if path.is_absolute() {
            relative_to(path, &self.home_path)
        } else {
            path.to_path_buf()
        };
        if let Some(module) = self.dir_modules.get(&rel) {
            return Some(module.clone());
        }
        let parent = match rel.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        self.dir_modules.get(&parent).cloned()
    }

    /// Registers a freshly created sub-directory under an existing module.
    pub fn add_dir(&mut self, abs_dir: &Path, module: String) {
        let rel = relative_to(abs_dir, &self.home_path);
        self.dir_modules.insert(rel, module);
    }

    /// Drops a directory from the module map. When the directory was the
    /// module root, the whole module is purged.
    pub fn try_remove_dir(&mut self, abs_dir: &Path) -> bool {
        let rel = if abs_dir.is_absolute() {
            relative_to(abs_dir, &self.home_path)
        } else {
            abs_dir.to_path_buf()
        };
        let Some(module) = self.dir_modules.remove(&rel) else {
            warn!(path = %abs_dir.display(), "directory has no module");
            return false;
        };

        if rel != Path::new(&module) {
            return true;
        }

        debug!(module = %module, path = %abs_dir.display(), "removing whole module");
        self.dir_modules.retain(|_, m| *m != module);
        self.module_flags.remove(&module);
        true
    }
}
