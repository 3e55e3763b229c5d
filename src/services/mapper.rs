//! 变更映射
//!
//! 把变更文件路径映射为直接受影响的模块名

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::domain::module::{Module, ModuleRegistry};

/// 变更映射器
pub struct ChangeMapper {
    registry: Arc<ModuleRegistry>,
}

impl ChangeMapper {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    /// 映射变更路径
    ///
    /// 没有水位线时返回全部模块（全量重装），不比较路径。
    pub fn map(&self, changed_paths: &[String], watermark: Option<&str>) -> BTreeSet<String> {
        if watermark.is_none() {
            return self.registry.names().map(String::from).collect();
        }

        let mut affected = BTreeSet::new();
        for path in changed_paths {
            let dir = parent_dir(path);
            match self.registry.iter().find(|m| matches_module(m, dir)) {
                Some(module) => {
                    affected.insert(module.name.clone());
                }
                None => debug!(path = %path, "Path matches no module, ignoring"),
            }
        }
        affected
    }
}

/// 去掉末尾文件段，根目录文件返回空串
fn parent_dir(path: &str) -> &str {
    let path = path.trim_start_matches("./").trim_start_matches('/');
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

fn matches_module(module: &Module, dir: &str) -> bool {
    module.path_patterns.iter().any(|pattern| {
        let pattern = pattern.trim_start_matches("./").trim_matches('/');
        if pattern.is_empty() || pattern == "." {
            return true;
        }
        dir == pattern
            || dir
                .strip_prefix(pattern)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::paths;

    fn mapper() -> ChangeMapper {
        ChangeMapper::new(Arc::new(ModuleRegistry::new(vec![
            Module::library("core").with_paths(["lib/core"]),
            Module::server("api").with_paths(["srv/api", "srv/shared"]),
            Module::server("api-admin").with_paths(["srv/api/admin"]),
            Module::server("web").with_paths(["web"]),
        ])))
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("srv/api/index.js"), "srv/api");
        assert_eq!(parent_dir("./srv/api/index.js"), "srv/api");
        assert_eq!(parent_dir("README.md"), "");
    }

    #[test]
    fn test_maps_paths_to_modules() {
        let affected = mapper().map(
            &paths(&["lib/core/a.js", "srv/shared/util/x.js", "web/index.html"]),
            Some("abc"),
        );
        assert_eq!(
            affected.into_iter().collect::<Vec<_>>(),
            vec!["api", "core", "web"]
        );
    }

    #[test]
    fn test_first_match_in_registry_order_wins() {
        // api 在 api-admin 之前注册，前缀也匹配
        let affected = mapper().map(&paths(&["srv/api/admin/page.js"]), Some("abc"));
        assert_eq!(affected.into_iter().collect::<Vec<_>>(), vec!["api"]);
    }

    #[test]
    fn test_prefix_must_end_on_segment_boundary() {
        let affected = mapper().map(&paths(&["website/index.html"]), Some("abc"));
        assert!(affected.is_empty());
    }

    #[test]
    fn test_unmatched_paths_are_dropped() {
        let affected = mapper().map(&paths(&["docs/guide.md", "README.md"]), Some("abc"));
        assert!(affected.is_empty());
    }

    #[test]
    fn test_no_watermark_returns_every_module() {
        let affected = mapper().map(&paths(&["docs/guide.md"]), None);
        assert_eq!(affected.len(), 4);
        assert!(affected.contains("api-admin"));

        let affected = mapper().map(&[], None);
        assert_eq!(affected.len(), 4);
    }

    #[test]
    fn test_output_is_deduplicated() {
        let affected = mapper().map(
            &paths(&["srv/api/a.js", "srv/api/b.js", "srv/shared/c.js"]),
            Some("abc"),
        );
        assert_eq!(affected.len(), 1);
    }
}
