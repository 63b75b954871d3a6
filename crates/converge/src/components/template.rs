use std::fs;
use std::path::{Path, PathBuf};

use crate::components::command::remove_path;
use crate::components::{Component, ComponentSpec, fingerprint_of, resolve_vars};
use crate::config::{ComponentConfig, Environment};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

#[derive(Debug, Clone)]
struct Target {
    source: PathBuf,
    dest: PathBuf,
    overwrite: bool,
    mode: Option<u32>,
}

/// Copies a file or directory from next to the config into place.
pub struct TemplateComponent {
    spec: ComponentSpec,
    target: Result<Target>,
}

impl TemplateComponent {
    pub fn from_config(
        spec: ComponentSpec,
        c: &ComponentConfig,
        env: &Environment,
        base: &Path,
    ) -> Result<Self> {
        let (Some(source), Some(dest)) = (c.source.as_deref(), c.dest.as_deref()) else {
            return Err(Error::permanent(format!(
                "template component '{}' needs both 'source' and 'dest'",
                spec.name
            )));
        };
        let overwrite = env.flag_or(c.overwrite_env.as_deref(), c.overwrite)?;
        let target = resolve_vars(c, env)
            .and_then(|vars| {
                Ok(Target {
                    source: vars.expand_path(source, base)?,
                    dest: vars.expand_path(dest, base)?,
                    overwrite,
                    mode: c.mode,
                })
            })
            .map_err(|e| e.context(&spec.name));
        Ok(Self { spec, target })
    }

    fn target(&self) -> Result<&Target> {
        self.target.as_ref().map_err(Clone::clone)
    }
}

impl Component for TemplateComponent {
    fn spec(&self) -> &ComponentSpec {
        &self.spec
    }

    fn apply(&self, ctx: &mut ExecCtx, _attempt: u32) -> Result<()> {
        let t = self.target()?;
        if !t.source.exists() {
            return Err(Error::permanent(format!(
                "template source not found: {}",
                t.source.display()
            )));
        }
        if t.dest.exists() && !t.overwrite {
            ctx.log(&format!("{} exists; leaving it alone", t.dest.display()));
            return Ok(());
        }
        if ctx.cancelled() {
            return Err(Error::cancelled());
        }
        ctx.log(&format!(
            "copy {} -> {}",
            t.source.display(),
            t.dest.display()
        ));
        if t.source.is_dir() {
            // Files the source no longer has would keep the digests apart.
            if remove_path(&t.dest)? {
                ctx.log(&format!("replaced previous {}", t.dest.display()));
            }
            copy_dir_all(&t.source, &t.dest)?;
        } else {
            copy_file(&t.source, &t.dest)?;
        }
        if let Some(mode) = t.mode {
            set_mode(&t.dest, mode)?;
        }
        Ok(())
    }

    fn verify(&self, _ctx: &mut ExecCtx) -> Result<()> {
        let t = self.target()?;
        if !t.dest.exists() {
            return Err(Error::verification(format!(
                "{} does not exist",
                t.dest.display()
            )));
        }
        if t.overwrite {
            let want = digest_path(&t.source)?;
            let got = digest_path(&t.dest)?;
            if want != got {
                return Err(Error::verification(format!(
                    "{} differs from {}",
                    t.dest.display(),
                    t.source.display()
                )));
            }
        }
        Ok(())
    }

    fn fingerprint(&self) -> String {
        match &self.target {
            Ok(t) => fingerprint_of(&serde_json::json!({
                "name": self.spec.name,
                "kind": "template",
                "source": t.source,
                "source_digest": digest_path(&t.source).ok(),
                "dest": t.dest,
                "overwrite": t.overwrite,
                "mode": t.mode,
            })),
            Err(e) => fingerprint_of(&serde_json::json!({
                "name": self.spec.name,
                "error": e.to_string(),
            })),
        }
    }
}

/// SHA-256 of a file, or of a directory tree (relative paths and contents).
pub fn digest_path(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    if path.is_dir() {
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
            if entry.file_type().is_file() {
                entries.push(entry.into_path());
            }
        }
        for p in entries {
            let rel = p
                .strip_prefix(path)
                .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(read(&p)?);
            hasher.update([0u8]);
        }
    } else {
        hasher.update(read(path)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn read(p: &Path) -> Result<Vec<u8>> {
    fs::read(p).map_err(|e| Error::msg(format!("failed to read {}: {e}", p.display())))
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", dst.display())))?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let p = entry.path();
        let rel = p
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", out.display())))?;
        } else {
            copy_file(p, &out)?;
        }
    }
    Ok(())
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(p: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(p, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::msg(format!("failed to chmod {}: {e}", p.display())))
}

#[cfg(not(unix))]
fn set_mode(_p: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
