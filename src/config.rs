use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

/// Normalize a directory of trip media into a web-ready tree and manifest.
#[derive(Debug, Parser)]
#[command(name = "trip-indexer", version)]
pub struct Cli {
    /// Directory holding one sub-directory per group
    pub input_root: Option<PathBuf>,

    /// Where normalized media and the manifest are written
    pub output_root: Option<PathBuf>,

    /// URL prefix prepended to every media path in the manifest
    pub server_path: Option<String>,

    /// Extra configuration file, layered over config/default
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub server_path: String,
    pub manifest_name: String,
    pub photo_workers: usize,
    pub video_workers: usize,
    pub max_dimension: u32,
    pub thumbnail_size: u32,
    pub cluster_radius_m: f64,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub log_level: String,
}

impl AppConfig {
    pub fn new(cli: &Cli) -> Result<Self, ConfigError> {
        let env = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = Config::builder()
            .set_default("server_path", "")?
            .set_default("manifest_name", "index.json")?
            .set_default("photo_workers", 0_i64)?
            .set_default("video_workers", 2_i64)?
            .set_default("max_dimension", 1080_i64)?
            .set_default("thumbnail_size", 36_i64)?
            .set_default("cluster_radius_m", 10.0)?
            .set_default("ffmpeg_path", "ffmpeg")?
            .set_default("ffprobe_path", "ffprobe")?
            .set_default("log_level", "info")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false));

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(Environment::with_prefix("TRIP_INDEXER"));

        if let Some(input) = &cli.input_root {
            builder = builder.set_override("input_root", input.to_string_lossy().to_string())?;
        }
        if let Some(output) = &cli.output_root {
            builder = builder.set_override("output_root", output.to_string_lossy().to_string())?;
        }
        if let Some(server_path) = &cli.server_path {
            builder = builder.set_override("server_path", server_path.as_str())?;
        }
        if let Some(level) = &cli.log_level {
            builder = builder.set_override("log_level", level.as_str())?;
        }

        builder.build()?.try_deserialize()
    }

    /// Photo pool size; zero means one worker per available core.
    pub fn photo_pool_size(&self) -> usize {
        if self.photo_workers > 0 {
            return self.photo_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn video_pool_size(&self) -> usize {
        self.video_workers.max(1)
    }

    /// Server path without a trailing slash, so joins never double up.
    pub fn url_prefix(&self) -> &str {
        self.server_path.trim_end_matches('/')
    }
}

#[cfg(test)]
impl AppConfig {
    pub fn for_test(input_root: &std::path::Path, output_root: &std::path::Path) -> Self {
        AppConfig {
            input_root: input_root.to_path_buf(),
            output_root: output_root.to_path_buf(),
            server_path: "/media".into(),
            manifest_name: "index.json".into(),
            photo_workers: 2,
            video_workers: 1,
            max_dimension: 1080,
            thumbnail_size: 36,
            cluster_radius_m: 10.0,
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg"),
            ffprobe_path: PathBuf::from("/nonexistent/ffprobe"),
            log_level: "debug".into(),
        }
    }
}
