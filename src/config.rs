//! XML configuration reader.
//!
//! The top element is `Config` with children `LogDir`, `DataDir`, `Listen`,
//! `GlobalExcluded/ExcludeEntry@pattern`, `Projects/Project/{Name, Home,
//! BuildDir, EnableFileWatch, ExcludeEntry@pattern}` and
//! `SystemInclude/Directory`. `${NAME}` environment variables are expanded in
//! path values and `{PROJECT_HOME}` is substituted into exclude patterns and
//! build directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, error, warn};

use crate::error::{Result, SymdbError};
use crate::fs_utils::expand_env;
use crate::protocol::DEFAULT_SOCK_PATH;

const PROJECT_HOME_VAR: &str = "{PROJECT_HOME}";
const DEFAULT_BUILD_DIR: &str = "_build";

/// A compiled exclude pattern, keeping the configured text for diagnostics.
#[derive(Debug, Clone)]
pub struct RegexPattern {
    pattern: String,
    regex: Regex,
    from_global: bool,
}

impl RegexPattern {
    fn new(original: &str, used: &str, from_global: bool) -> Result<Self> {
        let regex = Regex::new(used)
            .map_err(|e| SymdbError::config(format!("bad exclude pattern {original:?}: {e}")))?;
        Ok(Self {
            pattern: original.to_string(),
            regex,
            from_global,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_from_global(&self) -> bool {
        self.from_global
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.regex.is_match(&path.to_string_lossy())
    }
}

/// Static description of one indexed project.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub name: String,
    pub home_path: PathBuf,
    pub build_path: PathBuf,
    pub cmake_file: PathBuf,
    pub enable_file_watch: bool,
    exclude_patterns: Vec<RegexPattern>,
}

impl ProjectConfig {
    /// Validates and canonicalises the home path. The home must be an
    /// existing real directory, not a symlink, and must carry the project's
    /// cmake file.
    pub fn new(name: impl Into<String>, home: &Path) -> Result<Self> {
        let name = name.into();
        let meta = fs::symlink_metadata(home).map_err(|e| {
            SymdbError::project_init(format!("project {name} home {}: {e}", home.display()))
        })?;
        if meta.file_type().is_symlink() {
            return Err(SymdbError::project_init(format!(
                "project {name} home {} is a symlink",
                home.display()
            )));
        }
        if !meta.is_dir() {
            return Err(SymdbError::project_init(format!(
                "project {name} home {} is not a directory",
                home.display()
            )));
        }
        let home_path = home
            .canonicalize()
            .map_err(|e| SymdbError::project_init(format!("canonicalize {}: {e}", home.display())))?;
        let cmake_file = home_path.join("CMakeLists.txt");
        if !cmake_file.exists() {
            return Err(SymdbError::project_init(format!(
                "project {name} home {} has no CMakeLists.txt",
                home_path.display()
            )));
        }

        let mut config = Self {
            name,
            build_path: PathBuf::new(),
            cmake_file,
            home_path,
            enable_file_watch: true,
            exclude_patterns: Vec::new(),
        };
        config.set_build_dir(DEFAULT_BUILD_DIR)?;
        Ok(config)
    }

    /// Resolves the build directory, substituting `{PROJECT_HOME}` and
    /// creating it when absent. Relative values are rooted at the home.
    pub fn set_build_dir(&mut self, raw: &str) -> Result<()> {
        let substituted = raw.replace(PROJECT_HOME_VAR, &self.home_path.to_string_lossy());
        let expanded = expand_env(&substituted);
        let path = crate::fs_utils::absolute_from(Path::new(&expanded), &self.home_path);
        fs::create_dir_all(&path)?;
        self.build_path = path
            .canonicalize()
            .map_err(|e| SymdbError::project_init(format!("canonicalize {}: {e}", path.display())))?;
        debug!(project = %self.name, build_path = %self.build_path.display(), "build dir resolved");
        Ok(())
    }

    pub fn add_exclude_pattern(&mut self, pattern: &str) -> Result<()> {
        let used = pattern.replace(PROJECT_HOME_VAR, &self.home_path.to_string_lossy());
        self.exclude_patterns
            .push(RegexPattern::new(pattern, &used, false)?);
        Ok(())
    }

    /// Copies a global `{PROJECT_HOME}` pattern into this project with the
    /// placeholder substituted. Patterns without the placeholder are kept
    /// global and do not belong here.
    pub fn specialize_global_pattern(&mut self, pattern: &str) {
        let used = pattern.replace(PROJECT_HOME_VAR, &self.home_path.to_string_lossy());
        if used == pattern {
            error!(pattern, "global pattern has no {PROJECT_HOME_VAR} to specialize");
            return;
        }
        match RegexPattern::new(pattern, &used, true) {
            Ok(rp) => self.exclude_patterns.push(rp),
            Err(e) => error!(pattern, error = %e, "skipping bad global pattern"),
        }
    }

    pub fn is_file_excluded(&self, path: &Path) -> bool {
        self.exclude_patterns.iter().any(|rp| rp.matches(path))
    }
}

/// Fully loaded server configuration.
#[derive(Debug)]
pub struct Config {
    pub log_dir: PathBuf,
    pub db_root: PathBuf,
    pub listen_path: PathBuf,
    /// Pre-built `-isystem <dir>` tail appended to every module's argument
    /// vector.
    pub sys_include_flags: Vec<String>,
    pub projects: Vec<Arc<ProjectConfig>>,
    global_patterns: Vec<RegexPattern>,
    global_project_patterns: Vec<String>,
}

impl Config {
    pub fn load(xml_file: &Path) -> Result<Self> {
        let text = fs::read_to_string(xml_file).map_err(|e| {
            SymdbError::config(format!("cannot read {}: {e}", xml_file.display()))
        })?;
        let doc = roxmltree::Document::parse(&text)
            .map_err(|e| SymdbError::config(format!("invalid XML in {}: {e}", xml_file.display())))?;

        let root = doc.root_element();
        if !root.has_tag_name("Config") {
            return Err(SymdbError::config("top element must be <Config>"));
        }

        let log_dir = PathBuf::from(expand_env(&child_text_or_err(&root, "LogDir")?));
        let db_root = PathBuf::from(expand_env(&child_text_or_err(&root, "DataDir")?));
        let listen_path = PathBuf::from(
            child_text(&root, "Listen").unwrap_or_else(|| DEFAULT_SOCK_PATH.to_string()),
        );

        fs::create_dir_all(&log_dir)?;
        fs::create_dir_all(&db_root)?;

        let mut config = Self {
            log_dir,
            db_root,
            listen_path,
            sys_include_flags: Vec::new(),
            projects: Vec::new(),
            global_patterns: Vec::new(),
            global_project_patterns: Vec::new(),
        };

        config.load_global_patterns(&root);
        config.load_sys_includes(&root);
        config.load_projects(&root);

        Ok(config)
    }

    fn load_global_patterns(&mut self, root: &roxmltree::Node) {
        for entry in nested_children(root, "GlobalExcluded", "ExcludeEntry") {
            let Some(pattern) = entry.attribute("pattern") else {
                continue;
            };
            if pattern.contains(PROJECT_HOME_VAR) {
                self.global_project_patterns.push(pattern.to_string());
            } else {
                match RegexPattern::new(pattern, pattern, true) {
                    Ok(rp) => self.global_patterns.push(rp),
                    Err(e) => error!(pattern, error = %e, "skipping bad global pattern"),
                }
            }
        }
    }

    fn load_sys_includes(&mut self, root: &roxmltree::Node) {
        let mut dirs: Vec<String> = nested_children(root, "SystemInclude", "Directory")
            .filter_map(|n| n.text())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if dirs.is_empty() {
            dirs = discover_system_includes();
        }
        for dir in dirs {
            self.sys_include_flags.push("-isystem".to_string());
            self.sys_include_flags.push(dir);
        }
    }

    fn load_projects(&mut self, root: &roxmltree::Node) {
        for node in nested_children(root, "Projects", "Project") {
            match self.load_one_project(&node) {
                Ok(pc) => {
                    debug!(project = %pc.name, home = %pc.home_path.display(), "project configured");
                    self.projects.push(Arc::new(pc));
                }
                // A broken project entry is dropped; the server continues.
                Err(e) => error!(error = %e, "skipping project"),
            }
        }
    }

    fn load_one_project(&self, node: &roxmltree::Node) -> Result<ProjectConfig> {
        let name = child_text_or_err(node, "Name")?;
        let home = expand_env(&child_text_or_err(node, "Home")?);
        let mut pc = ProjectConfig::new(name, Path::new(&home))?;

        for entry in node.children().filter(|n| n.has_tag_name("ExcludeEntry")) {
            if let Some(pattern) = entry.attribute("pattern") {
                pc.add_exclude_pattern(pattern)?;
            }
        }
        if let Some(build_dir) = child_text(node, "BuildDir") {
            pc.set_build_dir(&build_dir)?;
        }
        if let Some(flag) = child_text(node, "EnableFileWatch") {
            pc.enable_file_watch = parse_bool(&flag).unwrap_or(true);
        }
        self.specialize_for(&mut pc);
        Ok(pc)
    }

    /// Applies the global `{PROJECT_HOME}` patterns to a project, including
    /// ones created outside the configuration file.
    pub fn specialize_for(&self, pc: &mut ProjectConfig) {
        for pattern in &self.global_project_patterns {
            pc.specialize_global_pattern(pattern);
        }
    }

    /// Matches a path against the plain (non-project) global patterns.
    pub fn is_file_excluded(&self, path: &Path) -> bool {
        self.global_patterns.iter().any(|rp| rp.matches(path))
    }
}

fn child_text(node: &roxmltree::Node, name: &str) -> Option<String> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
}

fn child_text_or_err(node: &roxmltree::Node, name: &str) -> Result<String> {
    child_text(node, name)
        .ok_or_else(|| SymdbError::config(format!("missing <{name}> element")))
}

fn nested_children<'a, 'input>(
    root: &roxmltree::Node<'a, 'input>,
    outer: &'static str,
    inner: &'static str,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> {
    root.children()
        .filter(move |n| n.has_tag_name(outer))
        .flat_map(move |n| n.children().filter(move |c| c.has_tag_name(inner)))
        .collect::<Vec<_>>()
        .into_iter()
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Asks the host C++ driver for its builtin include search path. Used when
/// the configuration carries no `SystemInclude` section.
fn discover_system_includes() -> Vec<String> {
    const SEARCH_BEGIN: &str = "#include <...> search starts here:";
    const SEARCH_END: &str = "End of search list.";

    let output = match Command::new("g++")
        .args(["-E", "-x", "c++", "-", "-v"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(out) => out,
        Err(e) => {
            warn!(error = %e, "cannot probe g++ for system includes");
            return Vec::new();
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut dirs = Vec::new();
    let mut in_search_list = false;
    for line in stderr.lines() {
        if line.contains(SEARCH_END) {
            break;
        }
        if in_search_list {
            let dir = line.trim();
            if !dir.is_empty() {
                debug!(dir, "default system include");
                dirs.push(dir.to_string());
            }
        } else if line.contains(SEARCH_BEGIN) {
            in_search_list = true;
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project_home() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("CMakeLists.txt"), "project(demo)\n").unwrap();
        tmp
    }

    #[test]
    fn loads_a_full_config() {
        let home = project_home();
        let data = TempDir::new().unwrap();
        let xml = format!(
            r#"<Config>
                <LogDir>{data}/log</LogDir>
                <DataDir>{data}/db</DataDir>
                <Listen>/tmp/symdb-test.sock</Listen>
                <GlobalExcluded>
                    <ExcludeEntry pattern=".*/third_party/.*"/>
                    <ExcludeEntry pattern="{{PROJECT_HOME}}/gen/.*"/>
                </GlobalExcluded>
                <SystemInclude>
                    <Directory>/usr/include</Directory>
                </SystemInclude>
                <Projects>
                    <Project>
                        <Name>demo</Name>
                        <Home>{home}</Home>
                        <EnableFileWatch>false</EnableFileWatch>
                        <ExcludeEntry pattern=".*\.pb\.cc"/>
                    </Project>
                </Projects>
            </Config>"#,
            data = data.path().display(),
            home = home.path().display(),
        );
        let file = data.path().join("Config.xml");
        fs::write(&file, xml).unwrap();

        let config = Config::load(&file).unwrap();
        assert_eq!(config.listen_path, PathBuf::from("/tmp/symdb-test.sock"));
        assert_eq!(
            config.sys_include_flags,
            vec!["-isystem".to_string(), "/usr/include".to_string()]
        );
        assert!(config.is_file_excluded(Path::new("/x/third_party/y.cpp")));
        assert!(!config.is_file_excluded(Path::new("/x/src/y.cpp")));

        assert_eq!(config.projects.len(), 1);
        let pc = &config.projects[0];
        assert_eq!(pc.name, "demo");
        assert!(!pc.enable_file_watch);
        assert!(pc.is_file_excluded(Path::new("/x/a.pb.cc")));
        // The {PROJECT_HOME} global pattern was specialized into the project.
        let gen_file = pc.home_path.join("gen/a.cpp");
        assert!(pc.is_file_excluded(&gen_file));
        assert!(!pc.is_file_excluded(&pc.home_path.join("src/a.cpp")));
    }

    #[test]
    fn missing_required_element_fails() {
        let data = TempDir::new().unwrap();
        let file = data.path().join("Config.xml");
        fs::write(&file, "<Config><LogDir>/tmp</LogDir></Config>").unwrap();
        assert!(Config::load(&file).is_err());
    }

    #[test]
    fn broken_project_is_dropped_not_fatal() {
        let data = TempDir::new().unwrap();
        let xml = format!(
            r#"<Config>
                <LogDir>{data}/log</LogDir>
                <DataDir>{data}/db</DataDir>
                <Projects>
                    <Project><Name>ghost</Name><Home>/does/not/exist</Home></Project>
                </Projects>
            </Config>"#,
            data = data.path().display(),
        );
        let file = data.path().join("Config.xml");
        fs::write(&file, xml).unwrap();

        let config = Config::load(&file).unwrap();
        assert!(config.projects.is_empty());
    }

    #[test]
    fn project_home_must_not_be_symlink() {
        let real = project_home();
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(real.path(), &link).unwrap();
        assert!(ProjectConfig::new("p", &link).is_err());
    }

    #[test]
    fn build_dir_substitutes_project_home() {
        let home = project_home();
        let mut pc = ProjectConfig::new("p", home.path()).unwrap();
        pc.set_build_dir("{PROJECT_HOME}/out").unwrap();
        assert!(pc.build_path.ends_with("out"));
        assert!(pc.build_path.starts_with(&pc.home_path));
    }
}
