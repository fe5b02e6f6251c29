//! 角色依赖图
//!
//! 静态映射 role → {depends_on, required_by}，启动时构建一次后只读共享。
//! 使用入度表做拓扑排序（Kahn），并按「1 + 组内依赖的最大层级」分层，供依赖有序的并行执行使用。

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::GraphError;

/// 单个角色的依赖关系
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDependencies {
    pub depends_on: Vec<String>,
    pub required_by: Vec<String>,
}

/// 角色依赖图
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    roles: HashMap<String, RoleDependencies>,
}

impl DependencyGraph {
    /// 由 role → depends_on 映射构建，自动补全 required_by
    pub fn from_dependencies<I, R, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (R, Vec<D>)>,
        R: Into<String>,
        D: Into<String>,
    {
        let mut roles: HashMap<String, RoleDependencies> = HashMap::new();
        let mut edges = Vec::new();

        for (role, deps) in entries {
            let role = role.into();
            let deps: Vec<String> = deps.into_iter().map(Into::into).collect();
            // 重复依赖只算一条边，否则入度永远减不到 0
            let deps = dedup(&deps);
            for dep in &deps {
                edges.push((dep.clone(), role.clone()));
            }
            roles.entry(role).or_default().depends_on = deps;
        }

        for (dep, dependent) in edges {
            let entry = roles.entry(dep).or_default();
            if !entry.required_by.contains(&dependent) {
                entry.required_by.push(dependent);
            }
        }

        Self { roles }
    }

    /// 默认交付流水线的角色依赖
    pub fn standard() -> Self {
        Self::from_dependencies([
            ("analyst", vec![]),
            ("product-owner", vec!["analyst"]),
            ("architect", vec!["product-owner"]),
            ("documenter", vec!["architect"]),
            ("developer", vec!["architect"]),
            ("qa", vec!["developer"]),
            ("reviewer", vec!["developer"]),
            ("devops", vec!["qa", "reviewer"]),
        ])
    }

    pub fn get(&self, role: &str) -> Option<&RoleDependencies> {
        self.roles.get(role)
    }

    pub fn depends_on(&self, role: &str) -> &[String] {
        self.roles
            .get(role)
            .map(|r| r.depends_on.as_slice())
            .unwrap_or(&[])
    }

    pub fn required_by(&self, role: &str) -> &[String] {
        self.roles
            .get(role)
            .map(|r| r.required_by.as_slice())
            .unwrap_or(&[])
    }

    /// 仅考虑组内依赖
    fn in_set_deps<'a>(&'a self, role: &str, set: &'a HashSet<&str>) -> impl Iterator<Item = &'a String> + 'a {
        self.depends_on(role)
            .iter()
            .filter(move |d| set.contains(d.as_str()))
    }

    /// 对请求的角色做拓扑排序；同一轮就绪的角色保持请求顺序
    pub fn topological_sort(&self, roles: &[String]) -> Result<Vec<String>, GraphError> {
        let requested = dedup(roles);
        let set: HashSet<&str> = requested.iter().map(String::as_str).collect();

        let mut in_degree: HashMap<&str, usize> = requested
            .iter()
            .map(|r| (r.as_str(), self.in_set_deps(r, &set).count()))
            .collect();

        let mut sorted = Vec::with_capacity(requested.len());
        let mut done: HashSet<&str> = HashSet::new();

        loop {
            let ready: Vec<&str> = requested
                .iter()
                .map(String::as_str)
                .filter(|r| !done.contains(r) && in_degree.get(r) == Some(&0))
                .collect();
            if ready.is_empty() {
                break;
            }
            for role in ready {
                done.insert(role);
                sorted.push(role.to_string());
                for dependent in self.required_by(role) {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
        }

        if sorted.len() < requested.len() {
            let role = self.find_cycle_member(&requested, &done, &set);
            return Err(GraphError::CycleDetected { role });
        }
        Ok(sorted)
    }

    /// 沿未完成角色的组内依赖前进，第一个重复访问的角色必在环上
    fn find_cycle_member(&self, requested: &[String], done: &HashSet<&str>, set: &HashSet<&str>) -> String {
        let Some(start) = requested.iter().find(|r| !done.contains(r.as_str())) else {
            return String::new();
        };
        let mut visited: HashSet<&str> = HashSet::new();
        let mut current = start.as_str();
        loop {
            if !visited.insert(current) {
                return current.to_string();
            }
            match self
                .in_set_deps(current, set)
                .find(|d| !done.contains(d.as_str()))
            {
                Some(next) => current = next.as_str(),
                None => return current.to_string(),
            }
        }
    }

    /// 分层：role 的层级 = 1 + 组内依赖的最大层级，无依赖为 0
    pub fn levels(&self, roles: &[String]) -> Result<Vec<Vec<String>>, GraphError> {
        let sorted = self.topological_sort(roles)?;
        let set: HashSet<&str> = sorted.iter().map(String::as_str).collect();

        let mut level_of: HashMap<&str, usize> = HashMap::new();
        for role in &sorted {
            let level = self
                .in_set_deps(role, &set)
                .filter_map(|d| level_of.get(d.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(role.as_str(), level);
        }

        let depth = level_of.values().copied().max().map_or(0, |m| m + 1);
        let mut levels = vec![Vec::new(); depth];
        // 组内按请求顺序排列
        for role in dedup(roles) {
            if let Some(&level) = level_of.get(role.as_str()) {
                levels[level].push(role);
            }
        }
        Ok(levels)
    }
}

fn dedup(roles: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    roles
        .iter()
        .filter(|r| seen.insert(r.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_required_by_is_derived() {
        let graph = DependencyGraph::standard();
        assert!(graph.required_by("developer").contains(&"qa".to_string()));
        assert!(graph.required_by("developer").contains(&"reviewer".to_string()));
        assert_eq!(graph.depends_on("devops"), &["qa".to_string(), "reviewer".to_string()]);
    }

    #[test]
    fn test_sort_respects_dependencies() {
        let graph = DependencyGraph::standard();
        let sorted = graph
            .topological_sort(&roles(&["devops", "qa", "developer", "reviewer"]))
            .unwrap();
        let pos = |r: &str| sorted.iter().position(|s| s == r).unwrap();
        assert!(pos("developer") < pos("qa"));
        assert!(pos("developer") < pos("reviewer"));
        assert!(pos("qa") < pos("devops"));
        assert!(pos("reviewer") < pos("devops"));
    }

    #[test]
    fn test_out_of_set_dependencies_ignored() {
        let graph = DependencyGraph::standard();
        let levels = graph.levels(&roles(&["qa", "reviewer"])).unwrap();
        assert_eq!(levels, vec![roles(&["qa", "reviewer"])]);
    }

    #[test]
    fn test_levels() {
        let graph = DependencyGraph::standard();
        let levels = graph
            .levels(&roles(&["devops", "reviewer", "qa", "developer"]))
            .unwrap();
        assert_eq!(
            levels,
            vec![roles(&["developer"]), roles(&["reviewer", "qa"]), roles(&["devops"])]
        );
    }

    #[test]
    fn test_cycle_detected() {
        let graph = DependencyGraph::from_dependencies([
            ("a", vec!["c"]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
            ("d", vec![]),
        ]);
        let err = graph.topological_sort(&roles(&["d", "a", "b", "c"])).unwrap_err();
        let GraphError::CycleDetected { role } = err;
        assert!(["a", "b", "c"].contains(&role.as_str()));
    }

    #[test]
    fn test_cycle_member_not_downstream() {
        let graph = DependencyGraph::from_dependencies([
            ("x", vec!["y"]),
            ("y", vec!["x"]),
            ("z", vec!["x"]),
        ]);
        let err = graph.levels(&roles(&["z", "x", "y"])).unwrap_err();
        let GraphError::CycleDetected { role } = err;
        assert_ne!(role, "z");
    }

    #[test]
    fn test_duplicate_dependency_counts_once() {
        let graph = DependencyGraph::from_dependencies([("a", vec![]), ("b", vec!["a", "a"])]);
        assert_eq!(graph.depends_on("b"), &["a".to_string()]);
        assert_eq!(
            graph.levels(&roles(&["b", "a"])).unwrap(),
            vec![roles(&["a"]), roles(&["b"])]
        );
    }
}
