//! 插件包文件操作
//!
//! 同步文件系统工具：解压 / 复制插件包、备份目录命名与清理、清单 `enabled` 字段改写。
//! 由 [`crate::plugin_manager`] 在阻塞线程中调用。

use crate::plugin_registry::{MANIFEST_FILE, PluginManifest};
use crate::{PluginError, PluginResult, write_atomic};
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// 临时解压目录名前缀
pub const SCRATCH_PREFIX: &str = "wxbot-plugin-";

/// 解压到临时目录中的插件包
///
/// 临时目录在值被丢弃时删除，无论安装成功与否。
#[derive(Debug)]
pub struct ExtractedPackage {
    scratch: TempDir,
    /// 清单所在目录，即插件根目录
    pub root: PathBuf,
    pub manifest: PluginManifest,
}

impl ExtractedPackage {
    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }
}

/// 解压（或复制）插件包并定位清单
///
/// 支持目录和 `.zip` 压缩包，清单取层级最浅的 `info.json`。
/// 临时目录建在 `scratch_root` 下，未指定时使用系统临时目录。
pub fn extract(package: &Path, scratch_root: Option<&Path>) -> PluginResult<ExtractedPackage> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(SCRATCH_PREFIX);
    let scratch = match scratch_root {
        Some(root) => {
            fs::create_dir_all(root)?;
            builder.tempdir_in(root)?
        }
        None => builder.tempdir()?,
    };

    if package.is_dir() {
        copy_tree(package, &scratch.path().join("package"))?;
    } else if package.is_file() {
        let file = fs::File::open(package)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| {
            PluginError::InvalidPackage(format!("无法读取压缩包 {}: {e}", package.display()))
        })?;
        archive.extract(scratch.path()).map_err(|e| {
            PluginError::InvalidPackage(format!("解压 {} 失败: {e}", package.display()))
        })?;
    } else {
        return Err(PluginError::InvalidPackage(format!(
            "插件包 {} 不存在",
            package.display()
        )));
    }

    let manifest_path = locate_manifest(scratch.path()).ok_or_else(|| {
        PluginError::InvalidPackage(format!("插件包 {} 中未找到 {MANIFEST_FILE}", package.display()))
    })?;
    let manifest = PluginManifest::read(&manifest_path)?;
    let root = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| scratch.path().to_path_buf());

    Ok(ExtractedPackage {
        scratch,
        root,
        manifest,
    })
}

fn locate_manifest(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILE)
        .min_by_key(|e| e.depth())
        .map(|e| e.into_path())
}

/// 递归复制目录，符号链接会被跳过
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// 移动目录，跨文件系统时退化为复制后删除
pub fn move_dir(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_tree(src, dst)?;
            fs::remove_dir_all(src)
        }
    }
}

// ============================================================================
// 备份
// ============================================================================

fn backup_prefix(id: &str) -> String {
    format!("{id}.bak.")
}

/// 生成新的带时间戳的备份路径 `<backup_dir>/<id>.bak.<timestamp>`
pub fn new_backup_path(backup_dir: &Path, id: &str) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let base = backup_dir.join(format!("{}{stamp}", backup_prefix(id)));
    if !base.exists() {
        return base;
    }
    (1..)
        .map(|n| backup_dir.join(format!("{}{stamp}-{n}", backup_prefix(id))))
        .find(|p| !p.exists())
        .unwrap_or(base)
}

fn backup_pattern(id: &str) -> io::Result<Regex> {
    Regex::new(&format!(r"^{}\d{{8}}T\d{{9}}(-\d+)?$", regex::escape(&backup_prefix(id))))
        .map_err(io::Error::other)
}

/// 列出某插件的备份，按时间从旧到新排序
pub fn list_backups(backup_dir: &Path, id: &str) -> io::Result<Vec<PathBuf>> {
    let pattern = backup_pattern(id)?;
    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut backups: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter(|e| pattern.is_match(&e.file_name().to_string_lossy()))
        .map(|e| e.path())
        .collect();
    backups.sort();
    Ok(backups)
}

pub fn latest_backup(backup_dir: &Path, id: &str) -> io::Result<Option<PathBuf>> {
    Ok(list_backups(backup_dir, id)?.pop())
}

/// 只保留最新的 `keep` 个备份，返回被删除的数量
pub fn prune_backups(backup_dir: &Path, id: &str, keep: usize) -> io::Result<usize> {
    let backups = list_backups(backup_dir, id)?;
    if backups.len() <= keep {
        return Ok(0);
    }
    let remove = backups.len() - keep;
    for path in backups.iter().take(remove) {
        fs::remove_dir_all(path)?;
    }
    Ok(remove)
}

// ============================================================================
// 清单改写
// ============================================================================

/// 改写清单中的 `enabled` 字段，保留其余字段
pub fn write_manifest_enabled(plugin_dir: &Path, enabled: bool) -> PluginResult<()> {
    let path = plugin_dir.join(MANIFEST_FILE);
    let content = fs::read(&path)?;
    let mut value: Value = serde_json::from_slice(&content).map_err(|e| {
        PluginError::InvalidPackage(format!("清单 {} 解析失败: {e}", path.display()))
    })?;
    let Some(object) = value.as_object_mut() else {
        return Err(PluginError::InvalidPackage(format!(
            "清单 {} 不是 JSON 对象",
            path.display()
        )));
    };
    object.insert("enabled".to_string(), Value::Bool(enabled));

    let pretty = serde_json::to_vec_pretty(&value).map_err(io::Error::other)?;
    write_atomic(&path, &pretty)?;
    Ok(())
}
