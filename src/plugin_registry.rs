//! 插件注册表
//!
//! 插件目录的内存索引：每个包含有效 `info.json` 的子目录即为一个插件。

use crate::{PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 插件清单文件名
pub const MANIFEST_FILE: &str = "info.json";

/// 插件依赖中引用其它插件的前缀
pub const PLUGIN_REQUIREMENT_PREFIX: &str = "plugin:";

// ============================================================================
// 1. 清单与记录
// ============================================================================

/// 插件清单 (`info.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 入口名，缺省时与 id 相同
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

fn default_version() -> String {
    "0.0.1".to_string()
}

fn default_enabled() -> bool {
    true
}

/// 插件 ID 只允许字母、数字、下划线和连字符
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl PluginManifest {
    /// 读取并校验清单文件
    pub fn read(path: &Path) -> PluginResult<Self> {
        let content = fs::read(path)?;
        let manifest: Self = serde_json::from_slice(&content).map_err(|e| {
            PluginError::InvalidPackage(format!("清单 {} 解析失败: {e}", path.display()))
        })?;
        if !is_valid_id(&manifest.id) {
            return Err(PluginError::InvalidPackage(format!(
                "清单 {} 中的插件 ID \"{}\" 无效",
                path.display(),
                manifest.id
            )));
        }
        Ok(manifest)
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn entry(&self) -> &str {
        self.entry.as_deref().unwrap_or(&self.id)
    }

    /// `plugin:<id>` 形式的插件依赖
    pub fn plugin_requirements(&self) -> Vec<String> {
        plugin_requirements(&self.requirements)
    }

    /// 需要外部安装的依赖
    pub fn external_requirements(&self) -> Vec<String> {
        self.requirements
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty() && !r.starts_with(PLUGIN_REQUIREMENT_PREFIX))
            .map(str::to_string)
            .collect()
    }
}

fn plugin_requirements(requirements: &[String]) -> Vec<String> {
    requirements
        .iter()
        .filter_map(|r| r.trim().strip_prefix(PLUGIN_REQUIREMENT_PREFIX))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

/// 已安装插件记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: String,
    pub requirements: Vec<String>,
    pub path: PathBuf,
    pub enabled: bool,
    /// 是否存在已加载的实例（由生命周期管理器填充）
    pub loaded: bool,
    #[serde(skip)]
    pub entry: String,
}

impl PluginRecord {
    pub fn from_manifest(manifest: PluginManifest, path: PathBuf) -> Self {
        let entry = manifest.entry().to_string();
        let name = manifest.display_name().to_string();
        Self {
            id: manifest.id,
            name,
            description: manifest.description,
            version: manifest.version,
            author: manifest.author,
            requirements: manifest.requirements,
            path,
            enabled: manifest.enabled,
            loaded: false,
            entry,
        }
    }

    pub fn plugin_requirements(&self) -> Vec<String> {
        plugin_requirements(&self.requirements)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }
}

// ============================================================================
// 2. 注册表
// ============================================================================

/// 插件注册表
#[derive(Debug)]
pub struct PluginRegistry {
    root: PathBuf,
    records: HashMap<String, PluginRecord>,
    /// 目录扫描顺序
    order: Vec<String>,
}

impl PluginRegistry {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            records: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 重新扫描插件目录
    ///
    /// 隐藏目录和备份目录会被跳过；清单损坏的目录记录警告后跳过。
    pub fn rescan(&mut self) -> &HashMap<String, PluginRecord> {
        self.records.clear();
        self.order.clear();

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(target: "Plugin", path = %self.root.display(), error = %e, "无法读取插件目录");
                }
                return &self.records;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            if dir_name.starts_with('.') || dir_name.contains(".bak.") {
                continue;
            }

            let manifest_path = path.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }

            let manifest = match PluginManifest::read(&manifest_path) {
                Ok(m) => m,
                Err(e) => {
                    warn!(target: "Plugin", path = %path.display(), error = %e, "跳过无效插件");
                    continue;
                }
            };

            if let Some(existing) = self.records.get(&manifest.id) {
                warn!(
                    target: "Plugin",
                    id = %manifest.id,
                    kept = %existing.path.display(),
                    skipped = %path.display(),
                    "插件 ID 重复"
                );
                continue;
            }

            debug!(target: "Plugin", id = %manifest.id, version = %manifest.version, "发现插件");
            self.order.push(manifest.id.clone());
            self.records
                .insert(manifest.id.clone(), PluginRecord::from_manifest(manifest, path));
        }

        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&PluginRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// 按扫描顺序列出插件
    pub fn list(&self) -> Vec<&PluginRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 依赖 `plugin:<id>` 的插件
    pub fn dependents(&self, id: &str) -> BTreeSet<String> {
        self.records
            .values()
            .filter(|r| r.id != id && r.plugin_requirements().iter().any(|dep| dep == id))
            .map(|r| r.id.clone())
            .collect()
    }

    /// 已启用的依赖者
    pub fn enabled_dependents(&self, id: &str) -> Vec<String> {
        self.dependents(id)
            .into_iter()
            .filter(|dep| self.records.get(dep).is_some_and(|r| r.enabled))
            .collect()
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) {
        if let Some(record) = self.records.get_mut(id) {
            record.enabled = enabled;
        }
    }

    /// 以候选清单替换同名记录后，查找从候选插件可达的依赖环
    ///
    /// 返回环上的插件序列（首尾相同），例如 `["a", "b", "a"]`。
    pub fn find_cycle(&self, candidate: &PluginManifest) -> Option<Vec<String>> {
        let candidate_deps = candidate.plugin_requirements();
        let deps_of = |id: &str| -> Vec<String> {
            if id == candidate.id {
                candidate_deps.clone()
            } else {
                self.records
                    .get(id)
                    .map(PluginRecord::plugin_requirements)
                    .unwrap_or_default()
            }
        };

        let mut stack = vec![candidate.id.clone()];
        let mut done = HashSet::new();
        find_cycle_from(&candidate.id, &deps_of, &mut stack, &mut done)
    }
}

fn find_cycle_from(
    id: &str,
    deps_of: &dyn Fn(&str) -> Vec<String>,
    stack: &mut Vec<String>,
    done: &mut HashSet<String>,
) -> Option<Vec<String>> {
    for dep in deps_of(id) {
        if let Some(pos) = stack.iter().position(|s| *s == dep) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(dep);
            return Some(cycle);
        }
        if done.contains(&dep) {
            continue;
        }
        stack.push(dep.clone());
        if let Some(cycle) = find_cycle_from(&dep, deps_of, stack, done) {
            return Some(cycle);
        }
        stack.pop();
        done.insert(dep);
    }
    None
}
