//! 命令构建
//!
//! 占位符替换：`%location%` `%path%` `%user%` `%keypath%`，
//! 远程包装模板中的 `%command%`。未识别的占位符原样保留。

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::TemplateConfig;
use crate::domain::graph::{Action, ActionNode};
use crate::domain::module::{BondStrength, Module, ModuleKind, ModuleRegistry};
use crate::domain::report::PlannedCommand;

const LOCATION: &str = "location";
const PATH: &str = "path";
const USER: &str = "user";
const KEYPATH: &str = "keypath";
const LEGACY_KEYPATHS: [&str; 2] = ["production.keypath", "development.keypath"];
const COMMAND: &str = "command";

/// 命令构建器
pub struct CommandBuilder {
    registry: Arc<ModuleRegistry>,
    templates: TemplateConfig,
}

impl CommandBuilder {
    pub fn new(registry: Arc<ModuleRegistry>, templates: TemplateConfig) -> Self {
        Self { registry, templates }
    }

    /// 渲染单条命令（含远程包装）
    pub fn build(&self, template: &str, location: &str, source_path: &str) -> String {
        let command = render(template, |key| self.lookup(key, location, source_path));
        match self.templates.remote_wrapper.as_deref() {
            Some(wrapper) => render(wrapper, |key| match key {
                COMMAND => Some(command.as_str()),
                _ => self.lookup(key, location, source_path),
            }),
            None => command,
        }
    }

    fn lookup<'a>(&'a self, key: &str, location: &'a str, source_path: &'a str) -> Option<&'a str> {
        match key {
            LOCATION => Some(location),
            PATH => Some(source_path),
            USER => Some(&self.templates.remote_user),
            KEYPATH => Some(&self.templates.key_path),
            _ if LEGACY_KEYPATHS.contains(&key) => Some(&self.templates.key_path),
            _ => None,
        }
    }

    /// 模块的有效部署位置
    ///
    /// library 取所有 hard 依赖方有效位置的并集（去重），其他类型取自身声明。
    pub fn locations_for(&self, module: &Module) -> Vec<String> {
        match module.kind {
            ModuleKind::Library => {
                let mut locations = BTreeSet::new();
                let mut seen = BTreeSet::new();
                self.collect_library_locations(module, &mut locations, &mut seen);
                locations.into_iter().collect()
            }
            ModuleKind::Server => module.locations.clone(),
        }
    }

    fn collect_library_locations(
        &self,
        module: &Module,
        locations: &mut BTreeSet<String>,
        seen: &mut BTreeSet<String>,
    ) {
        if !seen.insert(module.name.clone()) {
            return;
        }
        for (dependent, bond) in self.registry.dependents_of(&module.name) {
            if bond != BondStrength::Hard {
                continue;
            }
            match dependent.kind {
                ModuleKind::Library => self.collect_library_locations(dependent, locations, seen),
                ModuleKind::Server => locations.extend(dependent.locations.iter().cloned()),
            }
        }
    }

    /// 为需要 `action` 的节点生成 (节点, 位置) 命令列表
    pub fn plan(&self, nodes: &[ActionNode], action: Action) -> Vec<PlannedCommand> {
        let mut planned = Vec::new();
        for node in nodes.iter().filter(|n| n.requires(action)) {
            planned.extend(self.plan_node(node, action));
        }
        planned
    }

    /// 单个节点某个动作的命令
    pub fn plan_node(&self, node: &ActionNode, action: Action) -> Vec<PlannedCommand> {
        let Some(module) = self.registry.get(&node.module) else {
            warn!(module = %node.module, "Module vanished from registry, skipping");
            return Vec::new();
        };
        let Some(template) = module.commands.template(action) else {
            debug!(module = %module.name, action = %action, "No template for action, skipping");
            return Vec::new();
        };

        let locations = self.locations_for(module);
        if locations.is_empty() {
            warn!(module = %module.name, action = %action, "Module has no effective location");
        }

        locations
            .into_iter()
            .map(|location| PlannedCommand {
                module: module.name.clone(),
                command: self.build(&template, &location, module.source_path()),
                location,
                action,
            })
            .collect()
    }
}

/// 单遍替换 `%key%`，替换进去的值不会再被扫描
fn render<'a>(template: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        match tail.find('%') {
            Some(end) => match lookup(&tail[..end]) {
                Some(value) => {
                    out.push_str(value);
                    rest = &tail[end + 1..];
                }
                None => {
                    // 未识别：保留开头的 %，结尾的 % 可能开启下一个占位符
                    out.push('%');
                    out.push_str(&tail[..end]);
                    rest = &tail[end..];
                }
            },
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::ActionSet;
    use crate::domain::module::{CommandTemplates, Dependency};

    fn templates() -> TemplateConfig {
        TemplateConfig {
            remote_user: "deploy".to_string(),
            key_path: "/keys/id_ed25519".to_string(),
            remote_wrapper: None,
        }
    }

    fn registry() -> Arc<ModuleRegistry> {
        Arc::new(ModuleRegistry::new(vec![
            Module::library("base").with_commands(CommandTemplates {
                copy: Some("rsync %path% %user%@%location%:/srv/%path%".into()),
                ..Default::default()
            }).with_paths(["lib/base"]),
            Module::library("sdk")
                .with_dependency(Dependency::hard("base"))
                .with_paths(["lib/sdk"]),
            Module::server("api")
                .with_dependency(Dependency::hard("sdk"))
                .with_locations(["app1", "app2"]),
            Module::server("worker")
                .with_dependency(Dependency::hard("base"))
                .with_locations(["app2", "jobs1"]),
            Module::server("admin")
                .with_dependency(Dependency::soft("base"))
                .with_locations(["admin1"]),
        ]))
    }

    #[test]
    fn test_build_substitutes_all_placeholders() {
        let builder = CommandBuilder::new(registry(), templates());
        let cmd = builder.build(
            "scp -i %keypath% -r %path% %user%@%location%:%path% && echo %location%",
            "app1",
            "srv/api",
        );
        assert_eq!(
            cmd,
            "scp -i /keys/id_ed25519 -r srv/api deploy@app1:srv/api && echo app1"
        );
    }

    #[test]
    fn test_unknown_placeholders_are_kept() {
        let builder = CommandBuilder::new(registry(), templates());
        assert_eq!(
            builder.build("run %unknown% at %location%", "h1", "p"),
            "run %unknown% at h1"
        );
    }

    #[test]
    fn test_legacy_keypath_aliases() {
        let builder = CommandBuilder::new(registry(), templates());
        assert_eq!(
            builder.build("ssh -i %production.keypath% %location%", "h1", "p"),
            "ssh -i /keys/id_ed25519 h1"
        );
    }

    #[test]
    fn test_remote_wrapper_wraps_command() {
        let mut config = templates();
        config.remote_wrapper = Some("ssh %user%@%location% '%command%'".to_string());
        let builder = CommandBuilder::new(registry(), config);
        assert_eq!(
            builder.build("cd /srv/%path% && npm install", "app1", "srv/api"),
            "ssh deploy@app1 'cd /srv/srv/api && npm install'"
        );
    }

    #[test]
    fn test_substituted_values_are_not_rescanned() {
        let mut config = templates();
        config.remote_wrapper = Some("ssh %location% '%command%'".to_string());
        let builder = CommandBuilder::new(registry(), config);

        // 位置名里的 %path% 和内层命令里的 %command% 都原样保留
        assert_eq!(
            builder.build("echo %command% > %location%", "odd%path%host", "srv/api"),
            "ssh odd%path%host 'echo %command% > odd%path%host'"
        );
        assert_eq!(builder.build("100% done at %location%", "h1", "p"), "100% done at h1");
        assert_eq!(builder.build("trailing %", "h1", "p"), "trailing %");
    }

    #[test]
    fn test_library_locations_union_hard_dependents() {
        let registry = registry();
        let builder = CommandBuilder::new(registry.clone(), templates());

        let base = registry.get("base").unwrap();
        assert_eq!(builder.locations_for(base), vec!["app1", "app2", "jobs1"]);

        let sdk = registry.get("sdk").unwrap();
        assert_eq!(builder.locations_for(sdk), vec!["app1", "app2"]);

        let admin = registry.get("admin").unwrap();
        assert_eq!(builder.locations_for(admin), vec!["admin1"]);
    }

    #[test]
    fn test_plan_one_command_per_location() {
        let builder = CommandBuilder::new(registry(), templates());
        let nodes = vec![
            ActionNode::new("base", ModuleKind::Library, ActionSet::copy_install()),
            ActionNode::new("api", ModuleKind::Server, ActionSet::restart_only()),
        ];

        let planned = builder.plan(&nodes, Action::Copy);
        assert_eq!(planned.len(), 3);
        assert!(planned.iter().all(|p| p.module == "base" && p.action == Action::Copy));
        assert_eq!(planned[0].command, "rsync lib/base deploy@app1:/srv/lib/base");

        // base 没有 install 模板
        assert!(builder.plan(&nodes, Action::Install).is_empty());
    }
}
