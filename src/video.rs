use crate::config::AppConfig;
use crate::error::AppError;
use crate::ffmpeg::{self, EncodeProgress, FfmpegProcess, VideoInfo};
use crate::model::{MediaItem, MediaKind};
use crate::output::{self, GroupTarget};
use crate::pipeline::CancelFlag;
use std::path::Path;

/// Shared by every video worker of a run.
#[derive(Clone)]
pub struct VideoContext<'a> {
    pub config: &'a AppConfig,
    pub cancel: &'a CancelFlag,
    pub progress: Option<crossbeam_channel::Sender<EncodeProgress>>,
}

fn file_stem(path: &Path) -> Result<String, AppError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| AppError::Generic(format!("{:?} has no file name", path)))?;
    Ok(match name.rfind('.') {
        Some(index) => name[..index].to_string(),
        None => name,
    })
}

fn transcode(ctx: &VideoContext, source: &Path, target: &Path) -> Result<VideoInfo, AppError> {
    let duration = match ffmpeg::probe(&ctx.config.ffprobe_path, source) {
        Ok(info) => info.duration_seconds,
        Err(e) => {
            log::debug!("No duration for {:?}, progress will not show percent: {}", source, e);
            None
        }
    };

    let partial = output::partial_path(target);
    let args = ffmpeg::transcode_args(source, &partial, ctx.config.max_dimension);
    let result = FfmpegProcess::start(
        &ctx.config.ffmpeg_path,
        &args,
        source,
        duration,
        ctx.progress.clone(),
    )
    .and_then(|process| process.wait(ctx.cancel));

    if let Err(e) = result {
        output::discard(&partial);
        return Err(e);
    }
    output::commit(&partial, target)?;
    log::info!("Transcoded {:?} to {:?}", source, target);

    ffmpeg::probe(&ctx.config.ffprobe_path, target)
}

/// Stream info of the transcoded file: probed when it already exists,
/// otherwise (or when probing fails) produced by transcoding.
fn transcode_or_probe(ctx: &VideoContext, source: &Path, target: &Path) -> Result<VideoInfo, AppError> {
    if !target.exists() {
        log::info!("File {:?} doesn't exist, optimizing the video...", target);
        return transcode(ctx, source, target);
    }

    log::debug!("File {:?} already exists, probing it...", target);
    match ffmpeg::probe(&ctx.config.ffprobe_path, target) {
        Ok(info) => Ok(info),
        Err(e) => {
            log::warn!("Could not get the info about video {:?}: {}", target, e);
            transcode(ctx, source, target)
        }
    }
}

fn generate_thumbnail(
    ctx: &VideoContext,
    source: &Path,
    target: &Path,
    duration: Option<f64>,
) -> Result<(), AppError> {
    if target.exists() {
        log::trace!("Thumbnail {:?} already exists", target);
        return Ok(());
    }

    let seek = duration.map(|d| d / 2.0).unwrap_or(0.0);
    let partial = output::partial_path(target);
    let args = ffmpeg::thumbnail_args(source, &partial, ctx.config.thumbnail_size, seek);
    let result = FfmpegProcess::start(&ctx.config.ffmpeg_path, &args, source, None, None)
        .and_then(|process| process.wait(ctx.cancel));

    if let Err(e) = result {
        output::discard(&partial);
        return Err(e);
    }
    output::commit(&partial, target)?;
    log::debug!("Thumbnail saved to: {:?}", target);
    Ok(())
}

pub fn process_video(ctx: &VideoContext, target: &GroupTarget, path: &Path) -> Result<MediaItem, AppError> {
    let stem = file_stem(path)?;
    let name = format!("{}.webm", stem);
    let thumbnail_name = format!("thumb-{}.jpg", stem);

    let info = transcode_or_probe(ctx, path, &target.file(&name))?;
    generate_thumbnail(ctx, path, &target.file(&thumbnail_name), info.duration_seconds)?;

    Ok(MediaItem {
        src: target.url(&name),
        thumbnail: Some(target.url(&thumbnail_name)),
        name,
        kind: MediaKind::Video,
        width: info.width,
        height: info.height,
        latitude: None,
        longitude: None,
        time: None,
        caption: None,
    })
}
