// kiln-common/src/formulary.rs
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::config::Config;
use super::dependency::{FormulaGraph, PlanOptions};
use super::error::{KilnError, Result};
use super::model::formula::FormulaSpec;
use super::model::platform::OsFamily;

/// Loads formula descriptions (`<name>.json`) from a directory and caches the parsed result.
#[derive(Debug)]
pub struct Formulary {
    formula_dir: PathBuf,
    parsed_cache: Mutex<HashMap<String, Arc<FormulaSpec>>>,
}

impl Formulary {
    pub fn new(config: &Config) -> Self {
        Self::from_dir(config.formula_dir())
    }

    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            formula_dir: dir.into(),
            parsed_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn formula_dir(&self) -> &Path {
        &self.formula_dir
    }

    pub fn formula_path(&self, name: &str) -> PathBuf {
        self.formula_dir.join(format!("{name}.json"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formula_path(name).is_file()
    }

    pub fn load_formula(&self, name: &str) -> Result<Arc<FormulaSpec>> {
        {
            let cache = self.parsed_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(formula) = cache.get(name) {
                debug!("Loaded formula '{}' from parsed cache.", name);
                return Ok(Arc::clone(formula));
            }
        }

        let path = self.formula_path(name);
        if !path.is_file() {
            return Err(KilnError::NotFound(format!(
                "Formula '{}' not found in {}",
                name,
                self.formula_dir.display()
            )));
        }
        let raw = std::fs::read_to_string(&path)?;
        let formula: FormulaSpec = serde_json::from_str(&raw).map_err(|e| {
            KilnError::ParseError(
                "formula description",
                format!("{}: {e}", path.display()),
            )
        })?;
        if formula.name != name {
            return Err(KilnError::ValidationError(format!(
                "{} declares formula '{}'",
                path.display(),
                formula.name
            )));
        }
        formula.validate()?;
        debug!(
            "Successfully loaded formula '{}' version {}",
            formula.name, formula.version
        );

        let formula = Arc::new(formula);
        self.parsed_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::clone(&formula));
        Ok(formula)
    }

    /// Names of every formula description in the directory, sorted.
    pub fn available(&self) -> Result<Vec<String>> {
        if !self.formula_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = BTreeSet::new();
        for entry in std::fs::read_dir(&self.formula_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.insert(stem.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Registers `targets` and everything reachable from them in a fresh graph.
    ///
    /// Missing descriptions are left out so that planning reports them as unknown dependencies
    /// with the formula that required them.
    pub fn load_graph<S: AsRef<str>>(
        &self,
        targets: &[S],
        os: OsFamily,
        build_root: impl Into<PathBuf>,
        options: &PlanOptions,
    ) -> Result<FormulaGraph> {
        let mut graph = FormulaGraph::new(os, build_root);
        let mut pending: Vec<String> = targets.iter().map(|t| t.as_ref().to_string()).collect();
        let mut seen = BTreeSet::new();

        while let Some(name) = pending.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if !self.contains(&name) {
                debug!("No description for '{}', leaving it unregistered", name);
                continue;
            }
            let formula = self.load_formula(&name)?;
            for dep in graph.edges_of(&formula, options) {
                if !seen.contains(&dep) {
                    pending.push(dep);
                }
            }
            graph.add_shared(formula);
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "0e23756c05c97596009f6a2d8d1625ed34fe556a44067413089d4ca321a0c4d7";

    fn write(dir: &Path, name: &str, deps: &[&str]) {
        let deps: Vec<_> = deps.iter().map(|d| serde_json::json!({ "name": d })).collect();
        let json = serde_json::json!({
            "name": name,
            "version": "1.0",
            "sources": [{ "url": format!("https://example.org/{name}.tar.gz"), "sha256": SHA }],
            "dependencies": deps,
        });
        std::fs::write(dir.join(format!("{name}.json")), json.to_string()).unwrap();
    }

    #[test]
    fn loads_and_caches_descriptions() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "xz", &[]);
        let formulary = Formulary::from_dir(dir.path());
        let first = formulary.load_formula("xz").unwrap();
        let second = formulary.load_formula("xz").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(formulary.available().unwrap(), vec!["xz"]);
        assert!(matches!(
            formulary.load_formula("zstd"),
            Err(KilnError::NotFound(_))
        ));
    }

    #[test]
    fn mismatched_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "xz", &[]);
        std::fs::rename(dir.path().join("xz.json"), dir.path().join("lzma.json")).unwrap();
        let formulary = Formulary::from_dir(dir.path());
        assert!(matches!(
            formulary.load_formula("lzma"),
            Err(KilnError::ValidationError(_))
        ));
    }

    #[test]
    fn graph_loading_follows_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "xz", &[]);
        write(dir.path(), "zstd", &[]);
        write(dir.path(), "llvm", &["xz", "zstd"]);
        write(dir.path(), "unrelated", &[]);
        let formulary = Formulary::from_dir(dir.path());
        let graph = formulary
            .load_graph(&["llvm"], OsFamily::Linux, "/tmp/b", &PlanOptions::default())
            .unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.plan(["llvm"]).unwrap().names(), vec!["xz", "zstd", "llvm"]);
    }

    #[test]
    fn missing_dependency_surfaces_at_planning() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "llvm", &["ghost"]);
        let formulary = Formulary::from_dir(dir.path());
        let graph = formulary
            .load_graph(&["llvm"], OsFamily::Linux, "/tmp/b", &PlanOptions::default())
            .unwrap();
        assert!(matches!(
            graph.plan(["llvm"]),
            Err(KilnError::UnknownDependency { name, .. }) if name == "ghost"
        ));
    }
}
