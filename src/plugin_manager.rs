//! 插件生命周期管理
//!
//! 安装 / 更新 / 卸载 / 回滚 / 启用 / 禁用，以及消息分发。
//!
//! 锁的约定：
//! - 同一插件 ID 的生命周期操作通过各自的操作锁串行执行；
//! - 依赖检查在注册表写锁内重新校验后再提交；
//! - 每个插件实例放在独立的读写锁中，分发持有读锁，加载 / 卸载持有写锁，
//!   因此不会在分发过程中卸载插件。

use crate::plugin::{
    Capabilities, ChatMessage, EventResult, Plugin, PluginCatalog, PluginContext,
};
use crate::plugin_package::{self, ExtractedPackage};
use crate::plugin_registry::{MANIFEST_FILE, PluginManifest, PluginRecord, PluginRegistry};
use crate::{ConfigManager, PluginError, PluginResult, PluginsConfig};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

// ============================================================================
// 1. 外部依赖安装
// ============================================================================

/// 外部依赖安装器
#[async_trait]
pub trait DependencyProvisioner: Send + Sync {
    /// 安装单个依赖，失败时返回原因
    async fn provision(&self, dependency: &str) -> Result<(), String>;
}

/// 执行配置的安装命令，依赖名作为最后一个参数
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    program: String,
    args: Vec<String>,
}

impl CommandProvisioner {
    /// 命令为空时返回 `None`
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl DependencyProvisioner for CommandProvisioner {
    async fn provision(&self, dependency: &str) -> Result<(), String> {
        info!(target: "Plugin", "正在安装依赖: {}", dependency);
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(dependency)
            .output()
            .await
            .map_err(|e| format!("无法执行 {}: {e}", self.program))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{} ({})", stderr.trim(), output.status))
        }
    }
}

/// 未配置安装命令时使用：仅记录警告
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipProvisioner;

#[async_trait]
impl DependencyProvisioner for SkipProvisioner {
    async fn provision(&self, dependency: &str) -> Result<(), String> {
        warn!(target: "Plugin", "未配置依赖安装命令，跳过外部依赖: {}", dependency);
        Ok(())
    }
}

/// 根据配置选择安装器
pub fn provisioner_from_config(config: &PluginsConfig) -> Arc<dyn DependencyProvisioner> {
    match CommandProvisioner::from_command(&config.dependency_installer) {
        Some(p) => Arc::new(p),
        None => Arc::new(SkipProvisioner),
    }
}

// ============================================================================
// 2. 操作结果
// ============================================================================

/// 安装 / 更新结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallOutcome {
    pub id: String,
    pub name: String,
    pub version: String,
    pub updated: bool,
    /// 更新时旧版本的备份位置
    pub backup: Option<PathBuf>,
}

impl InstallOutcome {
    pub fn message(&self) -> String {
        if self.updated {
            format!("插件 {} (ID: {}) 已更新到版本 {}", self.name, self.id, self.version)
        } else {
            format!("插件 {} (ID: {}) 安装成功 (版本: {})", self.name, self.id, self.version)
        }
    }
}

/// 回滚结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    pub id: String,
    pub version: String,
    pub restored_from: PathBuf,
}

// ============================================================================
// 3. 生命周期管理器
// ============================================================================

/// 已加载的插件实例
struct LoadedPlugin {
    instance: Box<dyn Plugin>,
    caps: Capabilities,
    ctx: PluginContext,
}

type Slot = Arc<RwLock<Option<LoadedPlugin>>>;

/// 插件生命周期管理器
pub struct PluginManager {
    registry: RwLock<PluginRegistry>,
    catalog: PluginCatalog,
    provisioner: Arc<dyn DependencyProvisioner>,
    backup_dir: PathBuf,
    max_backups: usize,
    scratch_dir: Option<PathBuf>,
    data_dir: PathBuf,
    config: Arc<ConfigManager>,
    slots: std::sync::Mutex<HashMap<String, Slot>>,
    op_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PluginManager {
    pub fn new(
        settings: &PluginsConfig,
        data_dir: impl Into<PathBuf>,
        catalog: PluginCatalog,
        provisioner: Arc<dyn DependencyProvisioner>,
        config: Arc<ConfigManager>,
    ) -> Self {
        Self {
            registry: RwLock::new(PluginRegistry::new(&settings.dir)),
            catalog,
            provisioner,
            backup_dir: settings.backup_dir.clone(),
            max_backups: settings.max_backups.max(1),
            scratch_dir: settings.scratch_dir.clone(),
            data_dir: data_dir.into(),
            config,
            slots: std::sync::Mutex::new(HashMap::new()),
            op_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn op_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.op_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.to_string()).or_default().clone()
    }

    fn slot(&self, id: &str) -> Option<Slot> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(id).cloned()
    }

    fn slot_or_create(&self, id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(id.to_string()).or_default().clone()
    }

    fn remove_slot(&self, id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(id);
    }

    fn context_for(&self, record: &PluginRecord) -> PluginContext {
        PluginContext::new(
            record.id.clone(),
            record.path.clone(),
            self.data_dir.join(&record.id),
            self.config.clone(),
        )
    }

    fn plugin_root(&self, registry: &PluginRegistry, id: &str) -> PathBuf {
        registry.root().join(id)
    }

    // ------------------------------------------------------------------------
    // 3.1 查询
    // ------------------------------------------------------------------------

    pub async fn is_loaded(&self, id: &str) -> bool {
        match self.slot(id) {
            Some(slot) => slot.read().await.is_some(),
            None => false,
        }
    }

    async fn with_loaded(&self, mut record: PluginRecord) -> PluginRecord {
        record.loaded = self.is_loaded(&record.id).await;
        record
    }

    /// 重新扫描插件目录
    pub async fn rescan(&self) -> Vec<PluginRecord> {
        let records: Vec<PluginRecord> = {
            let mut registry = self.registry.write().await;
            registry.rescan();
            registry.list().into_iter().cloned().collect()
        };
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(self.with_loaded(record).await);
        }
        out
    }

    pub async fn get(&self, id: &str) -> Option<PluginRecord> {
        let record = self.registry.read().await.get(id).cloned()?;
        Some(self.with_loaded(record).await)
    }

    pub async fn list(&self) -> Vec<PluginRecord> {
        let records: Vec<PluginRecord> = self
            .registry
            .read()
            .await
            .list()
            .into_iter()
            .cloned()
            .collect();
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(self.with_loaded(record).await);
        }
        out
    }

    pub async fn dependents(&self, id: &str) -> Vec<String> {
        self.registry.read().await.dependents(id).into_iter().collect()
    }

    // ------------------------------------------------------------------------
    // 3.2 加载与卸载
    // ------------------------------------------------------------------------

    /// 加载插件实例；已加载时直接返回 `false`
    pub async fn load(&self, id: &str) -> PluginResult<bool> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;
        self.load_locked(id).await
    }

    async fn load_locked(&self, id: &str) -> PluginResult<bool> {
        let record = self
            .registry
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::NotInstalled(id.to_string()))?;
        if !record.enabled {
            return Err(PluginError::NotEnabled(id.to_string()));
        }

        let slot = self.slot_or_create(id);
        let mut guard = slot.write().await;
        if guard.is_some() {
            debug!(target: "Plugin", id, "插件已加载");
            return Ok(false);
        }

        let instance = self
            .catalog
            .create(&record.entry)
            .ok_or_else(|| PluginError::LoadFailed {
                id: id.to_string(),
                reason: format!("未找到入口 {}", record.entry),
            })?;
        let caps = Capabilities::detect(instance.as_ref());
        *guard = Some(LoadedPlugin {
            instance,
            caps,
            ctx: self.context_for(&record),
        });

        info!(target: "Plugin", "{} v{} 已加载", record.name, record.version);
        Ok(true)
    }

    /// 卸载插件实例；未加载时返回 `false`
    pub async fn unload(&self, id: &str) -> PluginResult<bool> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;
        Ok(self.unload_locked(id, false).await)
    }

    /// 等待进行中的分发结束后卸载；`disabling` 为真时先调用禁用钩子
    async fn unload_locked(&self, id: &str, disabling: bool) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut guard = slot.write().await;
        let Some(loaded) = guard.take() else {
            return false;
        };

        if disabling
            && loaded.caps.disable
            && let Some(hook) = loaded.instance.as_disableable()
            && let Err(e) = hook.disable(&loaded.ctx).await
        {
            warn!(target: "Plugin", id, error = %e, "禁用钩子执行失败");
        }
        if loaded.caps.unload
            && let Some(hook) = loaded.instance.as_unloadable()
            && let Err(e) = hook.unload(&loaded.ctx).await
        {
            warn!(target: "Plugin", id, error = %e, "卸载钩子执行失败");
        }

        info!(target: "Plugin", "{} 已卸载", loaded.instance.name());
        true
    }

    /// 启动时加载所有已启用的插件，返回成功加载的数量
    pub async fn load_enabled(&self) -> usize {
        let records = self.rescan().await;
        let mut loaded = 0;
        for record in records.iter().filter(|r| r.enabled) {
            match self.enable(&record.id).await {
                Ok(()) => loaded += 1,
                Err(e) => error!(target: "Plugin", id = %record.id, error = %e, "插件加载失败"),
            }
        }
        loaded
    }

    /// 卸载全部插件
    pub async fn unload_all(&self) {
        let ids: Vec<String> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.keys().cloned().collect()
        };
        for id in ids {
            let lock = self.op_lock(&id);
            let _guard = lock.lock().await;
            self.unload_locked(&id, false).await;
        }
    }

    // ------------------------------------------------------------------------
    // 3.3 启用与禁用
    // ------------------------------------------------------------------------

    /// 启用插件：写入清单后加载，并调用启用钩子
    pub async fn enable(&self, id: &str) -> PluginResult<()> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let record = {
            let mut registry = self.registry.write().await;
            let record = registry
                .get(id)
                .cloned()
                .ok_or_else(|| PluginError::NotInstalled(id.to_string()))?;
            for dep in record.plugin_requirements() {
                if !registry.contains(&dep) {
                    return Err(PluginError::MissingPluginDependency {
                        plugin: id.to_string(),
                        dependency: dep,
                    });
                }
            }
            if !record.enabled {
                set_manifest_enabled(&record.path, true).await?;
                registry.set_enabled(id, true);
            }
            record
        };

        let newly_loaded = match self.load_locked(id).await {
            Ok(v) => v,
            Err(e) => {
                self.revert_enabled(&record).await;
                return Err(e);
            }
        };
        if !newly_loaded {
            return Ok(());
        }

        if let Some(slot) = self.slot(id) {
            let guard = slot.write().await;
            let hook_result = match guard.as_ref() {
                Some(loaded) if loaded.caps.enable => match loaded.instance.as_enableable() {
                    Some(hook) => hook.enable(&loaded.ctx).await,
                    None => Ok(()),
                },
                _ => Ok(()),
            };
            drop(guard);

            if let Err(e) = hook_result {
                self.unload_locked(id, false).await;
                self.revert_enabled(&record).await;
                return Err(PluginError::LoadFailed {
                    id: id.to_string(),
                    reason: format!("启用钩子执行失败: {e}"),
                });
            }
        }

        info!(target: "Plugin", "{} 已启用", record.name);
        Ok(())
    }

    async fn revert_enabled(&self, record: &PluginRecord) {
        if record.enabled {
            return;
        }
        if let Err(e) = set_manifest_enabled(&record.path, false).await {
            error!(target: "Plugin", id = %record.id, error = %e, "恢复清单启用状态失败");
        }
        self.registry.write().await.set_enabled(&record.id, false);
    }

    /// 禁用插件：先卸载，再写入清单
    pub async fn disable(&self, id: &str) -> PluginResult<()> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let record = self
            .registry
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::NotInstalled(id.to_string()))?;

        self.unload_locked(id, true).await;

        if record.enabled {
            let mut registry = self.registry.write().await;
            set_manifest_enabled(&record.path, false).await?;
            registry.set_enabled(id, false);
        }

        info!(target: "Plugin", "{} 已禁用", record.name);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // 3.4 安装、更新、卸载、回滚
    // ------------------------------------------------------------------------

    /// 安装或更新插件包
    pub async fn install(&self, package: &Path, update: bool) -> PluginResult<InstallOutcome> {
        let package = package.to_path_buf();
        let scratch_root = self.scratch_dir.clone();
        let extracted =
            tokio::task::spawn_blocking(move || plugin_package::extract(&package, scratch_root.as_deref()))
                .await
                .map_err(|e| PluginError::Io(std::io::Error::other(e)))??;

        // extracted 持有临时目录，函数返回时自动清理
        self.install_extracted(&extracted, update).await
    }

    async fn install_extracted(
        &self,
        extracted: &ExtractedPackage,
        update: bool,
    ) -> PluginResult<InstallOutcome> {
        let manifest = &extracted.manifest;
        let id = manifest.id.clone();
        let lock = self.op_lock(&id);
        let _guard = lock.lock().await;

        {
            let registry = self.registry.read().await;
            check_install_target(&registry, manifest, update)?;
            if let Some(cycle) = registry.find_cycle(manifest) {
                return Err(PluginError::CyclicDependency { cycle });
            }
            check_plugin_dependencies(&registry, manifest)?;
        }

        for dep in manifest.external_requirements() {
            self.provisioner.provision(&dep).await.map_err(|reason| {
                PluginError::DependencyInstallFailed {
                    dependency: dep.clone(),
                    reason,
                }
            })?;
        }

        let was_loaded = update && self.is_loaded(&id).await;
        let (replaced, has_existing) = {
            let mut registry = self.registry.write().await;
            // 依赖在提交前重新校验
            let existing = check_install_target(&registry, manifest, update)?;
            check_plugin_dependencies(&registry, manifest)?;

            let target = match &existing {
                Some(record) => record.path.clone(),
                None => self.plugin_root(&registry, &id),
            };
            if existing.is_none() && target.exists() {
                return Err(PluginError::InvalidPackage(format!(
                    "目标目录 {} 已存在，但不是有效插件",
                    target.display()
                )));
            }

            if was_loaded {
                self.unload_locked(&id, false).await;
            }

            let source = extracted.root.clone();
            let backup_dir = self.backup_dir.clone();
            let max_backups = self.max_backups;
            let backup_id = id.clone();
            let has_existing = existing.is_some();
            let replaced = tokio::task::spawn_blocking(move || {
                replace_plugin_dir(&source, &target, has_existing, &backup_dir, &backup_id, max_backups)
            })
            .await
            .map_err(|e| PluginError::Io(std::io::Error::other(e)))
            .and_then(|r| r);

            registry.rescan();
            (replaced, has_existing)
        };

        let backup = match replaced {
            Ok(backup) => backup,
            Err(e) => {
                // 旧版本已从备份恢复，重新加载以保持原有运行状态
                if was_loaded && let Err(reload) = self.load_locked(&id).await {
                    warn!(target: "Plugin", id = %id, error = %reload, "更新失败后重新加载旧版本失败");
                }
                return Err(e);
            }
        };
        let outcome = InstallOutcome {
            id: id.clone(),
            name: manifest.display_name().to_string(),
            version: manifest.version.clone(),
            updated: has_existing,
            backup,
        };

        if was_loaded
            && manifest.enabled
            && let Err(e) = self.load_locked(&id).await
        {
            warn!(target: "Plugin", id = %id, error = %e, "更新后重新加载失败");
        }

        info!(target: "Plugin", "{}", outcome.message());
        Ok(outcome)
    }

    /// 卸载插件包；仍被已启用的插件依赖时拒绝
    pub async fn uninstall(&self, id: &str) -> PluginResult<()> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let mut registry = self.registry.write().await;
        let record = registry
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::NotInstalled(id.to_string()))?;

        let dependents = registry.enabled_dependents(id);
        if !dependents.is_empty() {
            return Err(PluginError::HasDependents {
                id: id.to_string(),
                dependents,
            });
        }

        self.unload_locked(id, false).await;

        let path = record.path.clone();
        tokio::task::spawn_blocking(move || std::fs::remove_dir_all(path))
            .await
            .map_err(|e| PluginError::Io(std::io::Error::other(e)))??;

        registry.rescan();
        drop(registry);
        self.remove_slot(id);

        info!(target: "Plugin", "{} (ID: {}) 已卸载", record.name, id);
        Ok(())
    }

    /// 回滚到最近一次备份
    pub async fn rollback(&self, id: &str) -> PluginResult<RollbackOutcome> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let was_loaded = self.is_loaded(id).await;
        let restored = {
            let mut registry = self.registry.write().await;
            let record = registry
                .get(id)
                .cloned()
                .ok_or_else(|| PluginError::NotInstalled(id.to_string()))?;

            let latest = plugin_package::latest_backup(&self.backup_dir, id)?
                .ok_or_else(|| PluginError::NoBackupAvailable(id.to_string()))?;

            // 备份中的依赖关系同样要满足安装时的约束，不满足时保持现状
            let manifest = PluginManifest::read(&latest.join(MANIFEST_FILE))?;
            if manifest.id != id {
                return Err(PluginError::InvalidPackage(format!(
                    "备份 {} 属于插件 {}",
                    latest.display(),
                    manifest.id
                )));
            }
            if let Some(cycle) = registry.find_cycle(&manifest) {
                return Err(PluginError::CyclicDependency { cycle });
            }
            check_plugin_dependencies(&registry, &manifest)?;

            self.unload_locked(id, false).await;

            let target = record.path.clone();
            let source = latest.clone();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                std::fs::remove_dir_all(&target)?;
                plugin_package::move_dir(&source, &target)
            })
            .await
            .map_err(|e| PluginError::Io(std::io::Error::other(e)))??;

            registry.rescan();
            let restored = registry.get(id).cloned();
            (latest, restored)
        };

        let (latest, record) = restored;
        let Some(record) = record else {
            return Err(PluginError::InvalidPackage(format!(
                "备份 {} 中的清单无效",
                latest.display()
            )));
        };

        if was_loaded
            && record.enabled
            && let Err(e) = self.load_locked(id).await
        {
            warn!(target: "Plugin", id, error = %e, "回滚后重新加载失败");
        }

        info!(target: "Plugin", "{} 已回滚到版本 {}", record.name, record.version);
        Ok(RollbackOutcome {
            id: id.to_string(),
            version: record.version,
            restored_from: latest,
        })
    }

    // ------------------------------------------------------------------------
    // 3.5 消息分发
    // ------------------------------------------------------------------------

    /// 将一条消息按优先级依次交给已加载的插件
    pub async fn dispatch(&self, msg: &ChatMessage) {
        let slots: Vec<(String, Slot)> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.iter().map(|(id, s)| (id.clone(), s.clone())).collect()
        };

        let mut ordered = Vec::with_capacity(slots.len());
        for (id, slot) in slots {
            let priority = match slot.read().await.as_ref() {
                Some(loaded) => loaded.instance.priority(),
                None => continue,
            };
            ordered.push((priority, id, slot));
        }
        ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (_, id, slot) in ordered {
            let guard = slot.read().await;
            let Some(loaded) = guard.as_ref() else {
                continue;
            };
            match loaded.instance.on_message(&loaded.ctx, msg).await {
                Ok(EventResult::Stop) => break,
                Ok(EventResult::Continue) => {}
                Err(e) => {
                    error!(target: "Plugin", id = %id, error = %e, "插件处理消息时发生错误");
                }
            }
        }
    }
}

async fn set_manifest_enabled(path: &Path, enabled: bool) -> PluginResult<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || plugin_package::write_manifest_enabled(&path, enabled))
        .await
        .map_err(|e| PluginError::Io(std::io::Error::other(e)))?
}

/// 检查安装 / 更新目标是否符合预期，返回已安装的记录
fn check_install_target(
    registry: &PluginRegistry,
    manifest: &PluginManifest,
    update: bool,
) -> PluginResult<Option<PluginRecord>> {
    let existing = registry.get(&manifest.id).cloned();
    match (&existing, update) {
        (Some(record), false) => Err(PluginError::AlreadyInstalled {
            id: record.id.clone(),
            name: record.name.clone(),
            version: record.version.clone(),
        }),
        (None, true) => Err(PluginError::NotInstalled(manifest.id.clone())),
        _ => Ok(existing),
    }
}

fn check_plugin_dependencies(registry: &PluginRegistry, manifest: &PluginManifest) -> PluginResult<()> {
    for dep in manifest.plugin_requirements() {
        if dep != manifest.id && !registry.contains(&dep) {
            return Err(PluginError::MissingPluginDependency {
                plugin: manifest.id.clone(),
                dependency: dep,
            });
        }
    }
    Ok(())
}

/// 将新版本复制到目标目录；更新时先把旧目录移动到备份位置，复制失败则恢复
fn replace_plugin_dir(
    source: &Path,
    target: &Path,
    has_existing: bool,
    backup_dir: &Path,
    id: &str,
    max_backups: usize,
) -> PluginResult<Option<PathBuf>> {
    let backup = if has_existing {
        let backup = plugin_package::new_backup_path(backup_dir, id);
        plugin_package::move_dir(target, &backup)?;
        info!(target: "Plugin", "已备份旧版本到 {}", backup.display());
        Some(backup)
    } else {
        None
    };

    if let Err(e) = plugin_package::copy_tree(source, target) {
        let _ = std::fs::remove_dir_all(target);
        if let Some(backup) = &backup
            && let Err(restore) = plugin_package::move_dir(backup, target)
        {
            error!(target: "Plugin", error = %restore, "恢复备份失败，备份保留在 {}", backup.display());
        }
        return Err(e.into());
    }

    if backup.is_some() {
        match plugin_package::prune_backups(backup_dir, id, max_backups) {
            Ok(0) => {}
            Ok(n) => debug!(target: "Plugin", id, removed = n, "已清理旧备份"),
            Err(e) => warn!(target: "Plugin", id, error = %e, "清理旧备份失败"),
        }
    }
    Ok(backup)
}
