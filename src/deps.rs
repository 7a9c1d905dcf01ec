//! Dependency-level resolution for tool startup ordering.
//!
//! Partitions a list of tool configs into levels: level 0 holds every
//! tool with no (valid) dependencies, and level `n` holds tools whose
//! highest-level dependency sits at `n - 1`. Tools within a level share
//! no ordering constraint and may be started concurrently; tools in
//! level `n` wait for every tool in levels `0..=n-1` they depend on.

use std::collections::HashMap;

use crate::config::ToolConfig;

/// The result of levelizing a tool list: each level is a list of
/// (original index, config) pairs in input order, and `level_by_name`
/// gives the resolved level for every tool.
#[derive(Debug, Clone)]
pub struct DependencyLevels {
    pub levels: Vec<Vec<(usize, ToolConfig)>>,
    pub level_by_name: HashMap<String, usize>,
}

/// Computes dependency levels for `configs`.
///
/// A dependency is "valid" if it names another tool present in `configs`
/// and is not the tool's own name; self-references and references to
/// unknown names are silently ignored (matching the config loader, which
/// already rejects true cycles before this ever runs). Within a level,
/// order matches input order.
pub fn resolve_levels(configs: &[ToolConfig]) -> DependencyLevels {
    let names: HashMap<&str, usize> = configs
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.as_str(), i))
        .collect();

    let mut level_by_index: Vec<Option<usize>> = vec![None; configs.len()];
    for i in 0..configs.len() {
        let mut visiting = vec![false; configs.len()];
        compute_level(i, configs, &names, &mut level_by_index, &mut visiting);
    }

    let max_level = level_by_index.iter().filter_map(|l| *l).max().unwrap_or(0);
    let mut levels: Vec<Vec<(usize, ToolConfig)>> = vec![Vec::new(); max_level + 1];
    for (i, config) in configs.iter().enumerate() {
        let level = level_by_index[i].unwrap_or(0);
        levels[level].push((i, config.clone()));
    }

    let level_by_name = configs
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.clone(), level_by_index[i].unwrap_or(0)))
        .collect();

    DependencyLevels {
        levels,
        level_by_name,
    }
}

/// Recursively computes (and memoizes) the level of tool `i`.
///
/// `visiting` is a per-outer-call visited set used purely defensively:
/// true cycles are expected to be rejected by config validation upstream,
/// but a revisited node here still resolves to level 0 rather than
/// recursing forever.
fn compute_level(
    i: usize,
    configs: &[ToolConfig],
    names: &HashMap<&str, usize>,
    memo: &mut [Option<usize>],
    visiting: &mut [bool],
) -> usize {
    if let Some(level) = memo[i] {
        return level;
    }
    if visiting[i] {
        return 0;
    }
    visiting[i] = true;

    let mut max_dep_level = None;
    for dep_name in &configs[i].depends_on {
        if dep_name == &configs[i].name {
            continue; // self-reference, ignored
        }
        let Some(&dep_index) = names.get(dep_name.as_str()) else {
            continue; // unknown dependency, ignored
        };
        let dep_level = compute_level(dep_index, configs, names, memo, visiting);
        max_dep_level = Some(max_dep_level.map_or(dep_level, |m: usize| m.max(dep_level)));
    }

    visiting[i] = false;
    let level = max_dep_level.map_or(0, |m| m + 1);
    memo[i] = Some(level);
    level
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, deps: &[&str]) -> ToolConfig {
        ToolConfig {
            name: name.into(),
            command: "true".into(),
            args: vec![],
            cwd: None,
            env: Default::default(),
            cleanup: vec![],
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            description: None,
        }
    }

    #[test]
    fn no_deps_are_all_level_zero() {
        let configs = vec![tool("a", &[]), tool("b", &[])];
        let result = resolve_levels(&configs);
        assert_eq!(result.level_by_name["a"], 0);
        assert_eq!(result.level_by_name["b"], 0);
        assert_eq!(result.levels.len(), 1);
    }

    #[test]
    fn chain_of_dependencies_levelizes_in_order() {
        let configs = vec![tool("a", &[]), tool("b", &["a"]), tool("c", &["b"])];
        let result = resolve_levels(&configs);
        assert_eq!(result.level_by_name["a"], 0);
        assert_eq!(result.level_by_name["b"], 1);
        assert_eq!(result.level_by_name["c"], 2);
        assert_eq!(result.levels.len(), 3);
    }

    #[test]
    fn level_is_one_plus_max_of_valid_dependencies() {
        let configs = vec![
            tool("a", &[]),
            tool("b", &[]),
            tool("c", &["a", "b"]),
        ];
        let result = resolve_levels(&configs);
        assert_eq!(result.level_by_name["c"], 1);
    }

    #[test]
    fn self_reference_is_ignored() {
        let configs = vec![tool("a", &["a"])];
        let result = resolve_levels(&configs);
        assert_eq!(result.level_by_name["a"], 0);
    }

    #[test]
    fn unknown_dependency_is_ignored() {
        let configs = vec![tool("a", &["ghost"])];
        let result = resolve_levels(&configs);
        assert_eq!(result.level_by_name["a"], 0);
    }

    #[test]
    fn order_within_a_level_matches_input_order() {
        let configs = vec![tool("b", &[]), tool("a", &[])];
        let result = resolve_levels(&configs);
        let names: Vec<&str> = result.levels[0].iter().map(|(_, c)| c.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn topological_order_exists() {
        let configs = vec![tool("web", &["api"]), tool("api", &["db"]), tool("db", &[])];
        let result = resolve_levels(&configs);
        // Every tool's level must exceed all of its dependencies' levels.
        for config in &configs {
            let own_level = result.level_by_name[&config.name];
            for dep in &config.depends_on {
                if let Some(&dep_level) = result.level_by_name.get(dep) {
                    assert!(own_level > dep_level);
                }
            }
        }
    }
}
