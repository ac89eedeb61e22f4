// kiln-common/src/dependency/definition.rs
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DependencyTag: u8 {
        const RUNTIME = 0b00000001;
        const BUILD   = 0b00000010;
    }
}

impl Default for DependencyTag {
    fn default() -> Self {
        Self::RUNTIME
    }
}

impl fmt::Display for DependencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::BUILD) {
            parts.push("build");
        }
        if self.contains(Self::RUNTIME) {
            parts.push("runtime");
        }
        write!(f, "{}", parts.join("+"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub tags: DependencyTag,
}

impl Dependency {
    pub fn new_runtime(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: DependencyTag::RUNTIME,
        }
    }

    pub fn new_with_tags(name: impl Into<String>, tags: DependencyTag) -> Self {
        Self {
            name: name.into(),
            tags,
        }
    }
}

pub trait DependencyExt {
    fn runtime(&self) -> Vec<&Dependency>;
    fn build_time(&self) -> Vec<&Dependency>;
}

impl DependencyExt for [Dependency] {
    fn runtime(&self) -> Vec<&Dependency> {
        self.iter()
            .filter(|dep| dep.tags.contains(DependencyTag::RUNTIME))
            .collect()
    }

    fn build_time(&self) -> Vec<&Dependency> {
        self.iter()
            .filter(|dep| dep.tags.contains(DependencyTag::BUILD))
            .collect()
    }
}
