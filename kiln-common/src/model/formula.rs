// kiln-common/src/model/formula.rs
// A formula record: one immutable, published version of a package recipe.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dependency::{Dependency, DependencyTag};
use crate::error::{KilnError, Result};
use crate::model::version;

/// Token that expands to the full standard CMake argument list inside a step.
pub const STD_CMAKE_ARGS_TOKEN: &str = "{std_cmake_args}";

/// The three phases of the external build procedure, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPhase {
    Configure,
    Build,
    Install,
}

impl BuildPhase {
    pub const ALL: [BuildPhase; 3] = [BuildPhase::Configure, BuildPhase::Build, BuildPhase::Install];
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configure => write!(f, "configure"),
            Self::Build => write!(f, "build"),
            Self::Install => write!(f, "install"),
        }
    }
}

/// One external-process invocation belonging to a build phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallStep {
    pub phase: BuildPhase,
    /// Program followed by its arguments. Arguments may contain `{token}` placeholders.
    pub command: Vec<String>,
}

impl InstallStep {
    pub fn new<S: AsRef<str>>(phase: BuildPhase, command: &[S]) -> Self {
        Self {
            phase,
            command: command.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }
}

/// Post-install sanity check. Success means exit status zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestInvocation {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormulaId {
    pub name: String,
    pub version: String,
    pub sha256: String,
}

impl fmt::Display for FormulaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaRecord {
    pub name: String,
    /// May be left empty in a definition; it is then inferred from `url`.
    #[serde(default)]
    pub version: String,
    #[serde(default, alias = "description", skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(alias = "sourceURL")]
    pub url: String,
    #[serde(alias = "integrityDigest")]
    pub sha256: String,
    #[serde(default, alias = "buildDependencies")]
    pub build_dependencies: Vec<String>,
    #[serde(default, alias = "runtimeDependencies")]
    pub runtime_dependencies: Vec<String>,
    #[serde(default, alias = "installSteps", skip_serializing_if = "Option::is_none")]
    pub install: Option<Vec<InstallStep>>,
    #[serde(default, alias = "testInvocation", skip_serializing_if = "Option::is_none")]
    pub test: Option<TestInvocation>,
    #[serde(default, alias = "caveatsText", skip_serializing_if = "Option::is_none")]
    pub caveats: Option<String>,
}

impl FormulaRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn id(&self) -> FormulaId {
        FormulaId {
            name: self.name.clone(),
            version: self.version.clone(),
            sha256: self.sha256.clone(),
        }
    }

    /// Fills in derived fields: the version when only the URL carries it, and
    /// a lowercase digest so comparisons and history keys are stable.
    pub fn normalized(mut self) -> Result<Self> {
        if self.version.trim().is_empty() {
            self.version = version::infer_from_url(&self.url).ok_or_else(|| {
                KilnError::InvalidFormula {
                    name: self.name.clone(),
                    reason: format!("no version given and none found in url '{}'", self.url),
                }
            })?;
            debug!("Inferred version {} for '{}' from its url", self.version, self.name);
        }
        self.sha256 = self.sha256.trim().to_ascii_lowercase();
        Ok(self)
    }

    /// Build and runtime lists merged into one tagged list. A name listed in
    /// both carries both tags.
    pub fn dependencies(&self) -> Vec<Dependency> {
        let mut deps: Vec<Dependency> = Vec::new();
        let mut add = |name: &str, tag: DependencyTag| {
            if let Some(existing) = deps.iter_mut().find(|d| d.name == name) {
                existing.tags |= tag;
            } else {
                deps.push(Dependency::new_with_tags(name, tag));
            }
        };
        for name in &self.runtime_dependencies {
            add(name, DependencyTag::RUNTIME);
        }
        for name in &self.build_dependencies {
            add(name, DependencyTag::BUILD);
        }
        deps
    }

    /// Declared steps, or the default CMake configure/build/install triple.
    pub fn install_steps(&self) -> Cow<'_, [InstallStep]> {
        match &self.install {
            Some(steps) => Cow::Borrowed(steps.as_slice()),
            None => Cow::Owned(default_cmake_steps()),
        }
    }

    /// Checks structural invariants. Hard violations are errors; soft ones
    /// come back as warning strings for the caller to surface.
    pub fn validate(&self) -> Result<Vec<String>> {
        let invalid = |reason: String| KilnError::InvalidFormula {
            name: self.name.clone(),
            reason,
        };

        if !is_valid_name(&self.name) {
            return Err(invalid(format!("'{}' is not a valid formula name", self.name)));
        }
        if self.version.trim().is_empty() {
            return Err(invalid("version is empty".to_string()));
        }
        if !is_valid_version(&self.version) {
            return Err(invalid(format!(
                "'{}' is not a valid version: it becomes a Cellar directory name",
                self.version
            )));
        }
        if self.url.trim().is_empty() {
            return Err(invalid("source url is empty".to_string()));
        }
        if self.sha256.len() != 64 || !self.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid(format!(
                "sha256 must be 64 hex characters, got '{}'",
                self.sha256
            )));
        }

        let mut last_phase = BuildPhase::Configure;
        let steps = self.install_steps();
        for step in steps.iter() {
            if step.command.is_empty() || step.command[0].trim().is_empty() {
                return Err(invalid(format!("{} step has an empty command", step.phase)));
            }
            if step.phase < last_phase {
                return Err(invalid(format!(
                    "{} step declared after a {} step",
                    step.phase, last_phase
                )));
            }
            last_phase = step.phase;
        }
        for phase in BuildPhase::ALL {
            if !steps.iter().any(|s| s.phase == phase) {
                return Err(invalid(format!("no {phase} step declared")));
            }
        }
        if let Some(test) = &self.test {
            if test.command.is_empty() {
                return Err(invalid("test invocation has an empty command".to_string()));
            }
        }

        let mut warnings = Vec::new();
        for dep in self.dependencies() {
            if dep.name == self.name {
                return Err(invalid("formula depends on itself".to_string()));
            }
            if dep.tags.contains(DependencyTag::BUILD | DependencyTag::RUNTIME) {
                warnings.push(format!(
                    "'{}' is listed as both a build and a runtime dependency of '{}'",
                    dep.name, self.name
                ));
            }
        }
        Ok(warnings)
    }
}

pub fn default_cmake_steps() -> Vec<InstallStep> {
    vec![
        InstallStep::new(
            BuildPhase::Configure,
            &["cmake", "-S", ".", "-B", "build", STD_CMAKE_ARGS_TOKEN],
        ),
        InstallStep::new(BuildPhase::Build, &["cmake", "--build", "build"]),
        InstallStep::new(BuildPhase::Install, &["cmake", "--install", "build"]),
    ]
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_.+@".contains(c))
}

// Versions name a directory under `Cellar/<name>/`, so they must stay a
// single ordinary path component.
fn is_valid_version(version: &str) -> bool {
    !version.starts_with('.')
        && !version.contains(['/', '\\'])
        && !version.chars().any(|c| c.is_control() || c.is_whitespace())
}
