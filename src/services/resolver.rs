//! 依赖图解析
//!
//! 把直接变更的模块扩展为完整的动作图：每个传递受影响的模块需要执行哪些动作，
//! 以及重启前必须先发出重启的服务。
//!
//! 动作规则（按依赖强度 + 依赖方/被依赖方类型）：
//! - soft：不产生动作
//! - hard，依赖方为 library：`{copy, install}`
//! - hard，依赖方为 server，被依赖方为 library：`{copy, install, restart}`
//! - hard，依赖方为 server，被依赖方为 server：`{restart}`，并记录运行时依赖

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error};

use crate::domain::graph::{ActionNode, ActionSet};
use crate::domain::module::{BondStrength, Module, ModuleKind, ModuleRegistry};
use crate::error::DeployError;

/// 工作项：模块 + 触发它的前驱
struct WorkItem {
    module: String,
    predecessor: Option<String>,
}

/// 依赖图解析器
pub struct GraphResolver {
    registry: Arc<ModuleRegistry>,
}

impl GraphResolver {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    /// 解析动作图，结果按 (depth, name) 升序
    ///
    /// 遍历前先校验注册表（未知名称、环），遍历本身依赖无环保证终止。
    pub fn resolve(&self, changed: &BTreeSet<String>) -> Result<Vec<ActionNode>, DeployError> {
        if let Err(e) = self.registry.validate() {
            error!(error = %e, "Module registry is invalid");
            return Err(e);
        }

        let mut nodes: BTreeMap<String, ActionNode> = BTreeMap::new();
        let mut stack = Vec::with_capacity(changed.len());

        for name in changed {
            let module = self.registry.get(name).ok_or_else(|| DeployError::UnknownModule {
                name: name.clone(),
                referenced_by: "change set".to_string(),
            })?;
            nodes
                .entry(name.clone())
                .or_insert_with(|| ActionNode::new(name.clone(), module.kind, ActionSet::empty()))
                .actions
                .widen(&seed_actions(module.kind));
            stack.push(WorkItem {
                module: name.clone(),
                predecessor: None,
            });
        }

        let mut visited: HashSet<(String, Option<String>)> = HashSet::new();

        while let Some(item) = stack.pop() {
            if !visited.insert((item.module.clone(), item.predecessor.clone())) {
                continue;
            }
            let Some(module) = self.registry.get(&item.module) else {
                continue;
            };

            for (dependent, bond) in self.registry.dependents_of(&module.name) {
                if bond == BondStrength::Soft {
                    continue;
                }
                let node = nodes.entry(dependent.name.clone()).or_insert_with(|| {
                    ActionNode::new(dependent.name.clone(), dependent.kind, ActionSet::empty())
                });
                node.actions.widen(&implied_actions(module, dependent));
                if dependent.is_server() && module.is_server() {
                    node.runtime_depends_on.insert(module.name.clone());
                }

                debug!(
                    module = %dependent.name,
                    via = %module.name,
                    actions = %node.actions,
                    "Dependent affected"
                );

                stack.push(WorkItem {
                    module: dependent.name.clone(),
                    predecessor: Some(module.name.clone()),
                });
            }
        }

        assign_depths(&mut nodes);

        let mut result: Vec<ActionNode> = nodes.into_values().collect();
        result.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.module.cmp(&b.module)));
        Ok(result)
    }
}

/// 直接变更模块的动作：server 全量，library 不重启
fn seed_actions(kind: ModuleKind) -> ActionSet {
    match kind {
        ModuleKind::Server => ActionSet::full(),
        ModuleKind::Library => ActionSet::copy_install(),
    }
}

/// hard 依赖下依赖方需要的动作
fn implied_actions(changed: &Module, dependent: &Module) -> ActionSet {
    match (dependent.kind, changed.kind) {
        (ModuleKind::Library, _) => ActionSet::copy_install(),
        (ModuleKind::Server, ModuleKind::Library) => ActionSet::full(),
        (ModuleKind::Server, ModuleKind::Server) => ActionSet::restart_only(),
    }
}

/// depth = 0（无运行时依赖）或 1 + 运行时依赖的最大 depth
fn assign_depths(nodes: &mut BTreeMap<String, ActionNode>) {
    let mut memo: HashMap<String, usize> = HashMap::with_capacity(nodes.len());
    let names: Vec<String> = nodes.keys().cloned().collect();
    for name in &names {
        depth_of(name, nodes, &mut memo);
    }
    for (name, node) in nodes.iter_mut() {
        node.depth = memo.get(name).copied().unwrap_or(0);
    }
}

fn depth_of(name: &str, nodes: &BTreeMap<String, ActionNode>, memo: &mut HashMap<String, usize>) -> usize {
    if let Some(&depth) = memo.get(name) {
        return depth;
    }
    // 运行时依赖边是注册表 hard 边的子集，注册表已校验无环
    let depth = match nodes.get(name) {
        Some(node) if !node.runtime_depends_on.is_empty() => {
            1 + node
                .runtime_depends_on
                .iter()
                .map(|dep| depth_of(dep, nodes, memo))
                .max()
                .unwrap_or(0)
        }
        _ => 0,
    };
    memo.insert(name.to_string(), depth);
    depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::Action;
    use crate::domain::module::Dependency;
    use crate::testing::names;

    fn resolver(modules: Vec<Module>) -> GraphResolver {
        GraphResolver::new(Arc::new(ModuleRegistry::new(modules)))
    }

    fn node<'a>(graph: &'a [ActionNode], name: &str) -> &'a ActionNode {
        graph
            .iter()
            .find(|n| n.module == name)
            .unwrap_or_else(|| panic!("{} not in graph", name))
    }

    fn abc() -> Vec<Module> {
        vec![
            Module::library("A"),
            Module::server("B").with_dependency(Dependency::hard("A")),
            Module::server("C").with_dependency(Dependency::hard("B")),
        ]
    }

    #[test]
    fn test_library_change_propagates_through_servers() {
        let graph = resolver(abc()).resolve(&names(&["A"])).unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(node(&graph, "A").actions, ActionSet::copy_install());
        assert_eq!(node(&graph, "B").actions, ActionSet::full());
        assert_eq!(node(&graph, "C").actions, ActionSet::restart_only());
        assert!(node(&graph, "C").runtime_depends_on.contains("B"));
        assert!(node(&graph, "B").runtime_depends_on.is_empty());

        let order: Vec<&str> = graph.iter().map(|n| n.module.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
        assert_eq!(node(&graph, "C").depth, 1);
    }

    #[test]
    fn test_soft_dependents_are_excluded() {
        let graph = resolver(vec![
            Module::server("X"),
            Module::server("Y").with_dependency(Dependency::soft("X")),
        ])
        .resolve(&names(&["X"]))
        .unwrap();

        assert_eq!(graph.len(), 1);
        assert_eq!(graph[0].module, "X");
    }

    #[test]
    fn test_soft_dependent_reachable_otherwise_is_kept() {
        let graph = resolver(vec![
            Module::library("L"),
            Module::server("X"),
            Module::server("Y")
                .with_dependency(Dependency::soft("X"))
                .with_dependency(Dependency::hard("L")),
        ])
        .resolve(&names(&["X", "L"]))
        .unwrap();

        let y = node(&graph, "Y");
        assert_eq!(y.actions, ActionSet::full());
        assert!(y.runtime_depends_on.is_empty());
    }

    #[test]
    fn test_library_dependent_never_restarts() {
        let graph = resolver(vec![
            Module::server("S"),
            Module::library("L").with_dependency(Dependency::hard("S")),
        ])
        .resolve(&names(&["S"]))
        .unwrap();

        let l = node(&graph, "L");
        assert_eq!(l.actions, ActionSet::copy_install());
        assert!(!l.requires(Action::Restart));
    }

    #[test]
    fn test_actions_are_widened_across_paths() {
        // D 同时经由 library 和 server 受影响
        let graph = resolver(vec![
            Module::library("L"),
            Module::server("S"),
            Module::server("D")
                .with_dependency(Dependency::hard("L"))
                .with_dependency(Dependency::hard("S")),
        ])
        .resolve(&names(&["L", "S"]))
        .unwrap();

        let d = node(&graph, "D");
        assert_eq!(d.actions, ActionSet::full());
        assert_eq!(d.runtime_depends_on.iter().collect::<Vec<_>>(), vec!["S"]);
        assert_eq!(d.depth, 1);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = resolver(vec![
            Module::server("P").with_dependency(Dependency::hard("Q")),
            Module::server("Q").with_dependency(Dependency::hard("P")),
        ])
        .resolve(&names(&["P"]))
        .unwrap_err();

        assert!(matches!(err, DeployError::DependencyCycle { .. }));
        assert!(err.is_resolution_error());
    }

    #[test]
    fn test_soft_cycle_is_rejected_even_when_unchanged() {
        let err = resolver(vec![
            Module::library("L"),
            Module::server("P").with_dependency(Dependency::soft("Q")),
            Module::server("Q").with_dependency(Dependency::soft("P")),
        ])
        .resolve(&names(&["L"]))
        .unwrap_err();

        match err {
            DeployError::DependencyCycle { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"P".to_string()) && cycle.contains(&"Q".to_string()));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unknown_changed_module() {
        let err = resolver(abc()).resolve(&names(&["ghost"])).unwrap_err();
        assert!(matches!(err, DeployError::UnknownModule { ref name, .. } if name == "ghost"));
    }

    #[test]
    fn test_unknown_dependency_name() {
        let err = resolver(vec![
            Module::server("api").with_dependency(Dependency::hard("missing")),
        ])
        .resolve(&names(&["api"]))
        .unwrap_err();
        assert!(matches!(err, DeployError::UnknownModule { ref name, .. } if name == "missing"));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let r = resolver(abc());
        let first = r.resolve(&names(&["A", "C"])).unwrap();
        let second = r.resolve(&names(&["A", "C"])).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_depth_exceeds_runtime_dependencies() {
        let graph = resolver(vec![
            Module::server("db-proxy"),
            Module::server("auth").with_dependency(Dependency::hard("db-proxy")),
            Module::server("api")
                .with_dependency(Dependency::hard("auth"))
                .with_dependency(Dependency::hard("db-proxy")),
            Module::server("gateway").with_dependency(Dependency::hard("api")),
            Module::library("sdk").with_dependency(Dependency::hard("api")),
        ])
        .resolve(&names(&["db-proxy"]))
        .unwrap();

        for n in &graph {
            for dep in &n.runtime_depends_on {
                assert!(n.depth > node(&graph, dep).depth, "{} vs {}", n.module, dep);
            }
        }
        assert_eq!(node(&graph, "gateway").depth, 3);
        assert_eq!(node(&graph, "sdk").depth, 0);

        let depths: Vec<usize> = graph.iter().map(|n| n.depth).collect();
        let mut sorted = depths.clone();
        sorted.sort();
        assert_eq!(depths, sorted);
    }

    #[test]
    fn test_changed_server_with_unchanged_library_dependency() {
        let graph = resolver(abc()).resolve(&names(&["B"])).unwrap();
        assert!(!graph.iter().any(|n| n.module == "A"));
        assert_eq!(node(&graph, "B").actions, ActionSet::full());
        assert_eq!(node(&graph, "C").actions, ActionSet::restart_only());
    }
}
