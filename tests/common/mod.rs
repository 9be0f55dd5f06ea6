//! Shared builder for scratch project trees used by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A throwaway C/C++ project home.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes a file under the repo root, creating parent directories.
    pub fn add_file(&self, relative_path: &str, content: &str) -> &Self {
        let full_path = self.dir.path().join(relative_path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).expect("create parent dirs");
        }
        fs::write(&full_path, content).expect("write file");
        self
    }

    /// Writes a minimal CMakeLists.txt building one executable from the
    /// given sources.
    pub fn cmake_project(&self, name: &str, sources: &[&str]) -> &Self {
        let listing = format!(
            "cmake_minimum_required(VERSION 3.10)\nproject({name} CXX)\nadd_executable({name} {})\n",
            sources.join(" ")
        );
        self.add_file("CMakeLists.txt", &listing)
    }
}

/// Writes a server configuration pointing at `data_dir` for logs and
/// databases, listening on `listen`, with the given (name, home) projects.
pub fn write_config(data_dir: &Path, listen: &Path, projects: &[(&str, &Path)]) -> PathBuf {
    let mut project_xml = String::new();
    for (name, home) in projects {
        project_xml.push_str(&format!(
            "<Project><Name>{name}</Name><Home>{}</Home></Project>",
            home.display()
        ));
    }
    let xml = format!(
        "<Config>\
         <LogDir>{data}/log</LogDir>\
         <DataDir>{data}/db</DataDir>\
         <Listen>{listen}</Listen>\
         <Projects>{project_xml}</Projects>\
         </Config>",
        data = data_dir.display(),
        listen = listen.display(),
    );
    let path = data_dir.join("Config.xml");
    fs::write(&path, xml).expect("write config");
    path
}
