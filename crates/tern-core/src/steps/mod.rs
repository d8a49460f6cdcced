//! Step catalogs for each mode.
//!
//! The built-in catalogs can be replaced per project by
//! `<state_dir>/steps/<mode>.toml`:
//!
//! ```toml
//! [[steps]]
//! id = "01_SURVEY"
//! title = "Survey"
//! prompt = "Survey the repository and list its components."
//!
//! [[steps]]
//! id = "02_PLAN"
//! title = "Plan"
//! dependencies = ["01_SURVEY"]
//! requires_gate_approval = true
//! ```
//!
//! Catalog order is the execution order among eligible steps.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tern_store::models::Mode;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("TOML parse error in step catalog: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read step catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("step catalog must contain at least one step")]
    Empty,

    #[error("duplicate step id: {0:?}")]
    DuplicateStep(String),

    #[error("step {step:?} depends on unknown step {dependency:?}")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle detected involving steps: {0}")]
    CycleDetected(String),
}

/// One unit of workflow work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub requires_gate_approval: bool,
    /// Instructions sent to the provider. A generic instruction naming the
    /// step is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl Step {
    fn builtin(id: &str, title: &str, dependencies: &[&str], gate: bool) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            dependencies: dependencies.iter().map(|d| (*d).to_string()).collect(),
            requires_gate_approval: gate,
            prompt: None,
        }
    }

    /// Title, falling back to the id.
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCatalog {
    mode: Mode,
    steps: Vec<Step>,
}

const ANALYZE_STEPS: [(&str, &str); 7] = [
    ("01_REPOSITORY_ANALYSIS", "Repository analysis"),
    ("02_ARCHITECTURE_ANALYSIS", "Architecture analysis"),
    ("03_TEST_ANALYSIS", "Test analysis"),
    ("04_FUNCTIONALITY_ANALYSIS", "Functionality analysis"),
    ("05_DOCUMENTATION_ANALYSIS", "Documentation analysis"),
    ("06_STATIC_ANALYSIS", "Static analysis"),
    ("07_REFACTORING_RECOMMENDATIONS", "Refactoring recommendations"),
];

/// `(id, title, requires_gate_approval)`
const EXECUTE_STEPS: [(&str, &str, bool); 17] = [
    ("00_PRD", "Product requirements", true),
    ("01_NFRS", "Non-functional requirements", false),
    ("02_ARCHITECTURE", "Architecture", true),
    ("03_ADR_FACTORY", "Architecture decision records", false),
    ("04_DOMAIN_DECOMPOSITION", "Domain decomposition", false),
    ("05_API_DESIGN", "API design", false),
    ("06_DATA_MODEL", "Data model", false),
    ("07_SECURITY_REVIEW", "Security review", false),
    ("08_PERFORMANCE_REVIEW", "Performance review", false),
    ("09_RELIABILITY_REVIEW", "Reliability review", false),
    ("10_TESTING_STRATEGY", "Testing strategy", false),
    ("11_STATIC_ANALYSIS", "Static analysis", false),
    ("12_OBSERVABILITY_SLOS", "Observability and SLOs", false),
    ("13_DELIVERY_ROLLOUT", "Delivery and rollout", false),
    ("14_DOCS_PORTAL", "Documentation portal", false),
    ("15_POST_RELEASE", "Post-release review", false),
    ("16_IMPLEMENTATION", "Implementation", false),
];

impl StepCatalog {
    /// Build and validate a catalog from explicit steps.
    pub fn new(mode: Mode, steps: Vec<Step>) -> Result<Self, CatalogError> {
        let catalog = Self { mode, steps };
        catalog.validate()?;
        Ok(catalog)
    }

    /// The built-in linear catalog for `mode`.
    pub fn builtin(mode: Mode) -> Self {
        let mut steps = Vec::new();
        match mode {
            Mode::Analyze => {
                let mut previous: Option<&str> = None;
                for (id, title) in ANALYZE_STEPS {
                    let deps: Vec<&str> = previous.into_iter().collect();
                    steps.push(Step::builtin(id, title, &deps, false));
                    previous = Some(id);
                }
            }
            Mode::Execute => {
                let mut previous: Option<&str> = None;
                for (id, title, gate) in EXECUTE_STEPS {
                    let deps: Vec<&str> = previous.into_iter().collect();
                    steps.push(Step::builtin(id, title, &deps, gate));
                    previous = Some(id);
                }
            }
        }
        Self { mode, steps }
    }

    pub fn from_toml_str(mode: Mode, contents: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(contents)?;
        Self::new(mode, file.steps)
    }

    /// Location of the per-project override for `mode`.
    pub fn override_path(state_dir: &Path, mode: Mode) -> PathBuf {
        state_dir.join("steps").join(format!("{mode}.toml"))
    }

    /// The project override if one exists, else the built-in catalog.
    pub fn load(state_dir: &Path, mode: Mode) -> Result<Self, CatalogError> {
        let path = Self::override_path(state_dir, mode);
        match fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "using step catalog override");
                Self::from_toml_str(mode, &contents)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::builtin(mode)),
            Err(source) => Err(CatalogError::Io { path, source }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Rejects an empty catalog, duplicate ids, unknown dependencies and
    /// dependency cycles.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.steps.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(CatalogError::DuplicateStep(step.id.clone()));
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(CatalogError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.check_for_cycles()
    }

    /// Kahn's algorithm; anything left with a non-zero in-degree is on or
    /// behind a cycle.
    fn check_for_cycles(&self) -> Result<(), CatalogError> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let n = self.steps.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.dependencies {
                if let Some(&d) = index.get(dep.as_str()) {
                    dependents[d].push(i);
                    in_degree[i] += 1;
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|i| in_degree[*i] == 0).collect();
        let mut sorted = 0usize;
        while let Some(node) = queue.pop_front() {
            sorted += 1;
            for &next in &dependents[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if sorted != n {
            let stuck: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|(_, deg)| **deg > 0)
                .map(|(i, _)| self.steps[i].id.as_str())
                .collect();
            return Err(CatalogError::CycleDetected(stuck.join(", ")));
        }
        Ok(())
    }

    /// First step, in catalog order, that is not completed and whose
    /// dependencies all are.
    pub fn next_eligible(&self, completed: &[String]) -> Option<&Step> {
        let done: HashSet<&str> = completed.iter().map(String::as_str).collect();
        self.steps.iter().find(|step| {
            !done.contains(step.id.as_str())
                && step.dependencies.iter().all(|d| done.contains(d.as_str()))
        })
    }

    /// Number of catalog steps not yet completed.
    pub fn remaining(&self, completed: &[String]) -> usize {
        let done: HashSet<&str> = completed.iter().map(String::as_str).collect();
        self.steps
            .iter()
            .filter(|s| !done.contains(s.id.as_str()))
            .count()
    }

    /// Dependencies of `step` that are not completed, in declaration order.
    pub fn unmet_dependencies(&self, step: &Step, completed: &[String]) -> Vec<String> {
        step.dependencies
            .iter()
            .filter(|d| !completed.iter().any(|c| c == *d))
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn done(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn builtin_catalogs_are_valid_chains() {
        let analyze = StepCatalog::builtin(Mode::Analyze);
        analyze.validate().unwrap();
        assert_eq!(analyze.len(), 7);
        assert_eq!(analyze.steps()[0].id, "01_REPOSITORY_ANALYSIS");
        assert!(analyze.steps()[0].dependencies.is_empty());
        assert_eq!(
            analyze.get("03_TEST_ANALYSIS").unwrap().dependencies,
            vec!["02_ARCHITECTURE_ANALYSIS"]
        );

        let execute = StepCatalog::builtin(Mode::Execute);
        execute.validate().unwrap();
        assert_eq!(execute.len(), 17);
        assert!(execute.get("00_PRD").unwrap().requires_gate_approval);
        assert!(execute.get("02_ARCHITECTURE").unwrap().requires_gate_approval);
        assert!(!execute.get("01_NFRS").unwrap().requires_gate_approval);
        assert_eq!(execute.steps()[16].id, "16_IMPLEMENTATION");
    }

    #[test]
    fn next_eligible_follows_dependencies() {
        let catalog = StepCatalog::builtin(Mode::Analyze);
        assert_eq!(
            catalog.next_eligible(&[]).unwrap().id,
            "01_REPOSITORY_ANALYSIS"
        );
        assert_eq!(
            catalog
                .next_eligible(&done(&["01_REPOSITORY_ANALYSIS"]))
                .unwrap()
                .id,
            "02_ARCHITECTURE_ANALYSIS"
        );
        let all: Vec<String> = catalog.steps().iter().map(|s| s.id.clone()).collect();
        assert!(catalog.next_eligible(&all).is_none());
        assert_eq!(catalog.remaining(&all), 0);
        assert_eq!(catalog.remaining(&done(&["01_REPOSITORY_ANALYSIS"])), 6);
    }

    #[test]
    fn unmet_dependencies_are_listed() {
        let catalog = StepCatalog::builtin(Mode::Analyze);
        let step = catalog.get("03_TEST_ANALYSIS").unwrap();
        assert_eq!(
            catalog.unmet_dependencies(step, &[]),
            vec!["02_ARCHITECTURE_ANALYSIS".to_string()]
        );
        assert!(catalog
            .unmet_dependencies(step, &done(&["02_ARCHITECTURE_ANALYSIS"]))
            .is_empty());
    }

    #[test]
    fn parses_override_file() {
        let catalog = StepCatalog::from_toml_str(
            Mode::Execute,
            r#"
[[steps]]
id = "A"
prompt = "do A"

[[steps]]
id = "B"
title = "Bee"
dependencies = ["A"]
requires_gate_approval = true
"#,
        )
        .unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("A").unwrap().display_title(), "A");
        assert_eq!(catalog.get("B").unwrap().display_title(), "Bee");
        assert_eq!(catalog.get("A").unwrap().prompt.as_deref(), Some("do A"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = StepCatalog::from_toml_str(
            Mode::Analyze,
            "[[steps]]\nid = \"A\"\n\n[[steps]]\nid = \"A\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateStep(id) if id == "A"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = StepCatalog::from_toml_str(
            Mode::Analyze,
            "[[steps]]\nid = \"A\"\ndependencies = [\"Z\"]\n",
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::UnknownDependency { dependency, .. } if dependency == "Z"));
    }

    #[test]
    fn rejects_cycles() {
        let err = StepCatalog::from_toml_str(
            Mode::Analyze,
            r#"
[[steps]]
id = "A"
dependencies = ["C"]

[[steps]]
id = "B"
dependencies = ["A"]

[[steps]]
id = "C"
dependencies = ["B"]

[[steps]]
id = "D"
"#,
        )
        .unwrap_err();
        let CatalogError::CycleDetected(steps) = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert!(steps.contains('A') && steps.contains('B') && steps.contains('C'));
        assert!(!steps.contains('D'));
    }

    #[test]
    fn rejects_empty_catalog() {
        assert!(matches!(
            StepCatalog::from_toml_str(Mode::Analyze, ""),
            Err(CatalogError::Empty)
        ));
    }

    #[test]
    fn load_prefers_override() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            StepCatalog::load(dir.path(), Mode::Analyze).unwrap(),
            StepCatalog::builtin(Mode::Analyze)
        );

        let path = StepCatalog::override_path(dir.path(), Mode::Analyze);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "[[steps]]\nid = \"ONLY\"\n").unwrap();
        let catalog = StepCatalog::load(dir.path(), Mode::Analyze).unwrap();
        assert_eq!(catalog.len(), 1);
        // The other mode is unaffected.
        assert_eq!(StepCatalog::load(dir.path(), Mode::Execute).unwrap().len(), 17);
    }
}
