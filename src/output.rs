use crate::error::AppError;
use std::path::{Path, PathBuf};

/// Where one group's normalized files go, and how the manifest refers to them.
#[derive(Debug, Clone)]
pub struct GroupTarget {
    pub dir: PathBuf,
    pub url_base: String,
}

impl GroupTarget {
    pub fn new(output_root: &Path, url_prefix: &str, group_id: &str) -> Self {
        Self {
            dir: output_root.join(group_id),
            url_base: format!("{}/{}", url_prefix.trim_end_matches('/'), group_id),
        }
    }

    pub fn file(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    pub fn url(&self, file_name: &str) -> String {
        format!("{}/{}", self.url_base, file_name)
    }

    pub fn create(&self) -> Result<(), AppError> {
        std::fs::create_dir_all(&self.dir)?;
        log::debug!("Output directory ready: {:?}", self.dir);
        Ok(())
    }
}

/// Sibling path an output is written to before it is renamed into place.
/// The original extension is kept last so encoders can still infer the format.
pub fn partial_path(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let partial = match file_name.rfind('.') {
        Some(index) => format!(".{}.partial{}", &file_name[..index], &file_name[index..]),
        None => format!(".{}.partial", file_name),
    };
    target.with_file_name(partial)
}

/// Moves a finished partial file over `target`. Empty results are discarded
/// so they never count as already processed.
pub fn commit(partial: &Path, target: &Path) -> Result<(), AppError> {
    let size = std::fs::metadata(partial)?.len();
    if size == 0 {
        discard(partial);
        return Err(AppError::Generic(format!("{:?} was written empty", target)));
    }
    std::fs::rename(partial, target)?;
    Ok(())
}

pub fn discard(partial: &Path) {
    if partial.exists() {
        if let Err(e) = std::fs::remove_file(partial) {
            log::warn!("Could not remove partial file {:?}: {}", partial, e);
        }
    }
}
