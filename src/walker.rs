use crate::error::AppError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: &[&str] = &[
    "apng", "avif", "bmp", "dib", "gif", "jfi", "jfif", "jif", "jpe", "jpeg", "jpg", "png",
    "tif", "tiff", "webp",
];
const VIDEO_EXTENSIONS: &[&str] = &["avi", "mkv", "mov", "mp4", "webm"];
const TRACK_EXTENSIONS: &[&str] = &["gpx"];

/// The id reserved for the synthetic group that aggregates all others.
pub const ALL_GROUP_ID: &str = "all";

#[derive(Debug, Clone, PartialEq)]
pub struct GroupDir {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
}

/// Files of one group directory, partitioned by extension.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClassifiedFiles {
    pub photos: Vec<PathBuf>,
    pub videos: Vec<PathBuf>,
    pub tracks: Vec<PathBuf>,
}

impl ClassifiedFiles {
    /// First track file by name; any further ones are ignored.
    pub fn track(&self) -> Option<&Path> {
        self.tracks.first().map(PathBuf::as_path)
    }
}

/// URL-safe id: spaces become hyphens, everything lowercase.
pub fn slugify(name: &str) -> String {
    name.replace(' ', "-").to_lowercase()
}

/// Extension as written after the last '.', matched case-sensitively.
fn extension_of(file_name: &str) -> Option<&str> {
    file_name.rfind('.').map(|index| &file_name[index + 1..])
}

fn has_extension(file_name: &str, accepted: &[&str]) -> bool {
    extension_of(file_name).map_or(false, |ext| accepted.contains(&ext))
}

/// Lists the immediate sub-directories of `input_root` as groups, in file name
/// order. Ids are made unique by suffixing `-2`, `-3`, ...; `all` is reserved.
pub fn find_groups(input_root: &Path) -> Result<Vec<GroupDir>, AppError> {
    log::info!("Looking for groups in {:?}", input_root);

    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(ALL_GROUP_ID.to_string());

    let mut groups = Vec::new();
    for entry in WalkDir::new(input_root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            log::trace!("Skipping non-directory entry: {:?}", entry.path());
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_string();
        let base = slugify(&name);
        let mut id = base.clone();
        let mut suffix = 2;
        while !seen.insert(id.clone()) {
            id = format!("{}-{}", base, suffix);
            suffix += 1;
        }
        if id != base {
            log::warn!("Group id {:?} already taken, using {:?} for {:?}", base, id, name);
        }

        log::debug!("Found group {:?} ({})", name, id);
        groups.push(GroupDir {
            id,
            name,
            path: entry.path().to_path_buf(),
        });
    }

    log::info!("Found {} groups.", groups.len());
    Ok(groups)
}

/// Splits the files directly inside `dir` into photos, videos and tracks.
/// Unknown extensions and non-file entries are skipped without error.
pub fn classify(dir: &Path) -> Result<ClassifiedFiles, AppError> {
    log::info!("Processing files in {:?} directory...", dir);

    let mut files = ClassifiedFiles::default();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            log::trace!("Skipping non-file entry: {:?}", entry.path());
            continue;
        }

        let file_name = entry.file_name().to_string_lossy();
        let path = entry.path().to_path_buf();
        if has_extension(&file_name, IMAGE_EXTENSIONS) {
            files.photos.push(path);
        } else if has_extension(&file_name, VIDEO_EXTENSIONS) {
            files.videos.push(path);
        } else if has_extension(&file_name, TRACK_EXTENSIONS) {
            files.tracks.push(path);
        } else {
            log::trace!("Skipping file due to unsupported extension: {:?}", path);
        }
    }

    log::debug!(
        "{:?}: {} photos, {} videos, {} tracks",
        dir,
        files.photos.len(),
        files.videos.len(),
        files.tracks.len()
    );
    Ok(files)
}
