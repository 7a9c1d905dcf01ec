//! Configuration loading for the supervisor: parses a TOML document of
//! declared tools into the resolved [`ToolConfig`] list the rest of the
//! system works with, plus any non-fatal warnings produced along the way.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// A tool's declared configuration, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub cleanup: Vec<String>,
    pub depends_on: Vec<String>,
    pub description: Option<String>,
}

impl ToolConfig {
    /// Builds the synthetic configuration used for virtual tools: no
    /// command, no dependencies, nothing to spawn.
    pub fn virtual_tool(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: String::new(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            cleanup: Vec::new(),
            depends_on: Vec::new(),
            description: None,
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.command.is_empty()
    }
}

/// Raw deserialization shape of the configuration document.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    port: Option<u16>,
    #[serde(default, rename = "tools")]
    tools: Vec<RawTool>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTool {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cleanup: Vec<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    description: Option<String>,
}

/// The fully resolved configuration document, plus whatever warnings its
/// loading produced (unknown `depends_on` names, mainly).
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub tools: Vec<ToolConfig>,
    pub port: Option<u16>,
    pub warnings: Vec<String>,
}

/// Loads and validates a configuration file from disk.
///
/// Rejects an empty tool list, a duplicate tool name, or a true
/// `depends_on` cycle. An unknown `depends_on` name is not an error: it
/// is dropped and recorded as a warning, matching the dependency
/// resolver's own tolerance for invalid references.
pub fn load_config(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let raw_text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&raw_text, path)
}

fn parse_config(raw_text: &str, path: &Path) -> Result<LoadedConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(raw_text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source: Box::new(source),
    })?;

    if raw.tools.is_empty() {
        return Err(ConfigError::Empty);
    }

    let mut seen = HashSet::new();
    for tool in &raw.tools {
        if !seen.insert(tool.name.as_str()) {
            return Err(ConfigError::DuplicateName(tool.name.clone()));
        }
    }

    let mut warnings = Vec::new();
    let names: HashSet<&str> = raw.tools.iter().map(|t| t.name.as_str()).collect();
    let mut tools = Vec::with_capacity(raw.tools.len());
    for tool in raw.tools {
        let mut depends_on = Vec::new();
        for dep in tool.depends_on {
            if dep == tool.name {
                warnings.push(format!(
                    "tool '{}' lists itself as a dependency; ignoring",
                    tool.name
                ));
                continue;
            }
            if !names.contains(dep.as_str()) {
                warnings.push(format!(
                    "tool '{}' depends on unknown tool '{}'; ignoring",
                    tool.name, dep
                ));
                continue;
            }
            depends_on.push(dep);
        }
        tools.push(ToolConfig {
            name: tool.name,
            command: tool.command,
            args: tool.args,
            cwd: tool.cwd,
            env: tool.env,
            cleanup: tool.cleanup,
            depends_on,
            description: tool.description,
        });
    }

    if let Some(cycle) = find_cycle(&tools) {
        return Err(ConfigError::DependencyCycle(cycle));
    }

    Ok(LoadedConfig {
        tools,
        port: raw.port,
        warnings,
    })
}

/// Detects a true `depends_on` cycle among already-validated (self- and
/// unknown-reference-free) tools via plain DFS, returning a human-readable
/// description of the cycle if one exists.
fn find_cycle(tools: &[ToolConfig]) -> Option<String> {
    let by_name: HashMap<&str, &ToolConfig> = tools.iter().map(|t| (t.name.as_str(), t)).collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a ToolConfig>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<String> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(name);
                return Some(cycle.join(" -> "));
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        stack.push(name);
        if let Some(tool) = by_name.get(name) {
            for dep in &tool.depends_on {
                if let Some(cycle) = visit(dep, by_name, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        None
    }

    for tool in tools {
        if let Some(cycle) = visit(&tool.name, &by_name, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<LoadedConfig, ConfigError> {
        parse_config(raw, Path::new("test.toml"))
    }

    #[test]
    fn parses_minimal_tool() {
        let loaded = parse(
            r#"
            [[tools]]
            name = "api"
            command = "cargo"
            args = ["run"]
            "#,
        )
        .unwrap();
        assert_eq!(loaded.tools.len(), 1);
        assert_eq!(loaded.tools[0].name, "api");
        assert_eq!(loaded.tools[0].args, vec!["run"]);
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn parses_port_and_env() {
        let loaded = parse(
            r#"
            port = 18765
            [[tools]]
            name = "api"
            command = "cargo"
            [tools.env]
            RUST_LOG = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(loaded.port, Some(18765));
        assert_eq!(
            loaded.tools[0].env.get("RUST_LOG").map(String::as_str),
            Some("debug")
        );
    }

    #[test]
    fn empty_tool_list_is_rejected() {
        let err = parse("port = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Empty));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let err = parse(
            r#"
            [[tools]]
            name = "api"
            command = "a"
            [[tools]]
            name = "api"
            command = "b"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(name) if name == "api"));
    }

    #[test]
    fn unknown_dependency_is_dropped_with_warning() {
        let loaded = parse(
            r#"
            [[tools]]
            name = "api"
            command = "cargo"
            depends_on = ["ghost"]
            "#,
        )
        .unwrap();
        assert!(loaded.tools[0].depends_on.is_empty());
        assert_eq!(loaded.warnings.len(), 1);
    }

    #[test]
    fn self_dependency_is_dropped_with_warning() {
        let loaded = parse(
            r#"
            [[tools]]
            name = "api"
            command = "cargo"
            depends_on = ["api"]
            "#,
        )
        .unwrap();
        assert!(loaded.tools[0].depends_on.is_empty());
        assert_eq!(loaded.warnings.len(), 1);
    }

    #[test]
    fn true_cycle_is_rejected() {
        let err = parse(
            r#"
            [[tools]]
            name = "a"
            command = "x"
            depends_on = ["b"]
            [[tools]]
            name = "b"
            command = "y"
            depends_on = ["a"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DependencyCycle(_)));
    }

    #[test]
    fn valid_dependency_chain_is_accepted() {
        let loaded = parse(
            r#"
            [[tools]]
            name = "db"
            command = "x"
            [[tools]]
            name = "api"
            command = "y"
            depends_on = ["db"]
            "#,
        )
        .unwrap();
        assert_eq!(loaded.tools[1].depends_on, vec!["db"]);
    }
}
