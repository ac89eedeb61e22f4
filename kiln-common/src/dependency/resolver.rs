// kiln-common/src/dependency/resolver.rs

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error};

use crate::dependency::DependencyTag;
use crate::error::{KilnError, Result};
use crate::formulary::Formulary;
use crate::keg::KegRegistry;
use crate::model::formula::FormulaRecord;

pub struct ResolutionContext<'a> {
    pub formulary: &'a Formulary,
    pub keg_registry: &'a KegRegistry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    /// Satisfied by a keg already in the cellar.
    Installed,
    /// Known to the formulary, not installed; scheduled for install.
    Missing,
    /// The formula the resolution was started for.
    Requested,
}

#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub name: String,
    /// Absent only for installed kegs the formulary does not know.
    pub formula: Option<Arc<FormulaRecord>>,
    pub keg_path: Option<PathBuf>,
    pub opt_path: PathBuf,
    pub status: ResolutionStatus,
    pub accumulated_tags: DependencyTag,
    /// Direct dependency names of this node.
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedGraph {
    /// Formulae to install, dependencies first. The requested formula is last.
    pub install_plan: Vec<ResolvedDependency>,
    pub build_dependency_opt_paths: Vec<PathBuf>,
    pub runtime_dependency_opt_paths: Vec<PathBuf>,
    /// Names satisfied by existing kegs.
    pub installed: Vec<String>,
    pub resolution_details: HashMap<String, ResolvedDependency>,
}

impl ResolvedGraph {
    /// Planned installs other than the requested formula itself.
    pub fn missing_dependencies(&self) -> impl Iterator<Item = &ResolvedDependency> {
        self.install_plan
            .iter()
            .filter(|d| d.status == ResolutionStatus::Missing)
    }
}

pub struct DependencyResolver<'a> {
    context: ResolutionContext<'a>,
    visiting: Vec<String>,
    resolution_details: HashMap<String, ResolvedDependency>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(context: ResolutionContext<'a>) -> Self {
        Self {
            context,
            visiting: Vec::new(),
            resolution_details: HashMap::new(),
        }
    }

    /// Walks the dependency graph of `target` without touching the network.
    /// A dependency that is neither installed nor known to the formulary, or
    /// any cycle, fails the whole resolution.
    pub fn resolve(&mut self, target: &Arc<FormulaRecord>) -> Result<ResolvedGraph> {
        debug!("Starting dependency resolution for '{}'", target.name());
        self.visiting.clear();
        self.resolution_details.clear();

        self.visit_formula(target, ResolutionStatus::Requested, DependencyTag::empty())?;

        let install_plan = self.topological_sort()?;

        let mut build_paths = Vec::new();
        let mut runtime_paths = Vec::new();
        let mut seen_build = HashSet::new();
        let mut seen_runtime = HashSet::new();
        let mut installed = Vec::new();

        let mut nodes: Vec<&ResolvedDependency> = self.resolution_details.values().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        for dep in nodes {
            if dep.status == ResolutionStatus::Requested {
                continue;
            }
            if dep.status == ResolutionStatus::Installed {
                installed.push(dep.name.clone());
            }
            if dep.accumulated_tags.contains(DependencyTag::BUILD)
                && seen_build.insert(dep.opt_path.clone())
            {
                debug!("Adding build dep path: {}", dep.opt_path.display());
                build_paths.push(dep.opt_path.clone());
            }
            if dep.accumulated_tags.contains(DependencyTag::RUNTIME)
                && seen_runtime.insert(dep.opt_path.clone())
            {
                debug!("Adding runtime dep path: {}", dep.opt_path.display());
                runtime_paths.push(dep.opt_path.clone());
            }
        }

        debug!(
            "Final installation plan: {:?}",
            install_plan
                .iter()
                .map(|d| (d.name.as_str(), d.status))
                .collect::<Vec<_>>()
        );

        Ok(ResolvedGraph {
            install_plan,
            build_dependency_opt_paths: build_paths,
            runtime_dependency_opt_paths: runtime_paths,
            installed,
            resolution_details: self.resolution_details.clone(),
        })
    }

    fn visit_formula(
        &mut self,
        formula: &Arc<FormulaRecord>,
        status: ResolutionStatus,
        tags_from_parent_edge: DependencyTag,
    ) -> Result<()> {
        let name = formula.name().to_string();
        self.visiting.push(name.clone());

        let deps = formula.dependencies();
        self.resolution_details.insert(
            name.clone(),
            ResolvedDependency {
                name: name.clone(),
                formula: Some(Arc::clone(formula)),
                keg_path: None,
                opt_path: self.context.keg_registry.get_opt_path(&name),
                status,
                accumulated_tags: tags_from_parent_edge,
                dependencies: deps.iter().map(|d| d.name.clone()).collect(),
            },
        );

        for dep in &deps {
            self.resolve_edge(&name, &dep.name, dep.tags)?;
        }

        self.visiting.pop();
        debug!("Finished resolving '{}'", name);
        Ok(())
    }

    fn resolve_edge(&mut self, parent: &str, name: &str, edge_tags: DependencyTag) -> Result<()> {
        debug!("Resolving edge '{}' -> '{}' ({})", parent, name, edge_tags);

        if let Some(pos) = self.visiting.iter().position(|n| n == name) {
            let mut cycle: Vec<&str> = self.visiting[pos..].iter().map(String::as_str).collect();
            cycle.push(name);
            error!("Dependency cycle detected: {}", cycle.join(" -> "));
            return Err(KilnError::DependencyResolution(format!(
                "Dependency cycle detected: {}",
                cycle.join(" -> ")
            )));
        }

        if let Some(existing) = self.resolution_details.get_mut(name) {
            // Tags accumulate over every edge reaching a node.
            existing.accumulated_tags |= edge_tags;
            return Ok(());
        }

        if let Some(keg) = self.context.keg_registry.get_installed_keg(name)? {
            debug!("'{}' satisfied by installed keg {}", name, keg.path.display());
            let formula = self.context.formulary.load_formula(name).ok();
            self.resolution_details.insert(
                name.to_string(),
                ResolvedDependency {
                    name: name.to_string(),
                    dependencies: formula
                        .as_ref()
                        .map(|f| f.dependencies().into_iter().map(|d| d.name).collect())
                        .unwrap_or_default(),
                    formula,
                    keg_path: Some(keg.path),
                    opt_path: self.context.keg_registry.get_opt_path(name),
                    status: ResolutionStatus::Installed,
                    accumulated_tags: edge_tags,
                },
            );
            return Ok(());
        }

        match self.context.formulary.load_formula(name) {
            Ok(formula) => self.visit_formula(&formula, ResolutionStatus::Missing, edge_tags),
            Err(KilnError::NotFound(_)) => {
                error!("'{}' (required by '{}') is not installed and has no formula", name, parent);
                Err(KilnError::DependencyResolution(format!(
                    "'{name}' (required by '{parent}') is not installed and no formula for it is known"
                )))
            }
            Err(e) => Err(e),
        }
    }

    fn topological_sort(&self) -> Result<Vec<ResolvedDependency>> {
        let planned: HashMap<&str, &ResolvedDependency> = self
            .resolution_details
            .iter()
            .filter(|(_, d)| d.status != ResolutionStatus::Installed)
            .map(|(k, v)| (k.as_str(), v))
            .collect();

        // Edges point from a dependency to the formulae that need it.
        let mut in_degree: HashMap<&str, usize> = planned.keys().map(|k| (*k, 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, node) in &planned {
            for dep in &node.dependencies {
                if planned.contains_key(dep.as_str()) {
                    *in_degree.entry(*name).or_default() += 1;
                    dependents.entry(dep.as_str()).or_default().push(*name);
                }
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        ready.sort_unstable();
        let mut queue: VecDeque<&str> = ready.into();
        let mut sorted = Vec::with_capacity(planned.len());

        while let Some(name) = queue.pop_front() {
            if let Some(node) = planned.get(name) {
                sorted.push((*node).clone());
            }
            let mut next: Vec<&str> = Vec::new();
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        next.push(*dependent);
                    }
                }
            }
            next.sort_unstable();
            queue.extend(next);
        }

        if sorted.len() != planned.len() {
            error!(
                "Cycle detected! Sorted count ({}) != planned count ({}).",
                sorted.len(),
                planned.len()
            );
            return Err(KilnError::DependencyResolution(
                "Circular dependency detected".to_string(),
            ));
        }
        Ok(sorted)
    }
}
