use crate::cluster::cluster_markers;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::ffmpeg::EncodeProgress;
use crate::geo::{self, TrackStats};
use crate::group::{all_group, assemble_group, render_description};
use crate::manifest;
use crate::model::{FailureRecord, GeoTrack, Group, MediaItem, Trip};
use crate::output::GroupTarget;
use crate::photo;
use crate::video::{self, VideoContext};
use crate::walker::{self, ClassifiedFiles, GroupDir};
use crossbeam_channel::{Receiver, Sender};
use rayon::prelude::*;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Run-wide stop request. Workers stop picking up files once it is set and
/// running encoder processes are killed.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub trip: Trip,
    pub manifest_path: PathBuf,
    pub failures: Vec<FailureRecord>,
}

struct GroupJob {
    dir: GroupDir,
    target: GroupTarget,
    files: ClassifiedFiles,
}

enum Outcome {
    Media { group: usize, item: MediaItem },
    Failed(FailureRecord),
}

type Track = (GeoTrack, Option<TrackStats>);

fn outcome(group: usize, path: &Path, result: Result<MediaItem, AppError>) -> Option<Outcome> {
    match result {
        Ok(item) => {
            log::info!("Processing finished for: {:?}", path);
            Some(Outcome::Media { group, item })
        }
        Err(AppError::Cancelled) => {
            log::debug!("Processing cancelled for: {:?}", path);
            None
        }
        Err(e) => {
            log::warn!("Failed to process {:?}: {}", path, e);
            Some(Outcome::Failed(FailureRecord::new(path, e)))
        }
    }
}

fn send(tx: &Sender<Outcome>, outcome: Option<Outcome>) -> Result<(), AppError> {
    if let Some(outcome) = outcome {
        tx.send(outcome)?;
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

/// Runs one file's job so that a panic inside it fails only that file.
fn guarded(
    path: &Path,
    job: impl FnOnce() -> Result<MediaItem, AppError>,
) -> Result<MediaItem, AppError> {
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(result) => result,
        Err(payload) => Err(AppError::Generic(format!(
            "processing {:?} panicked: {}",
            path,
            panic_message(payload.as_ref())
        ))),
    }
}

fn build_pool(workers: usize, name: &'static str) -> Result<rayon::ThreadPool, AppError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(move |i| format!("{}-{}", name, i))
        .build()
        .map_err(|e| AppError::Generic(format!("Could not start the {} pool: {}", name, e)))
}

fn log_progress(progress_rx: Receiver<EncodeProgress>) {
    for progress in progress_rx {
        if progress.finished {
            log::info!("Finished encoding {:?}", progress.file);
            continue;
        }
        match progress.percent {
            Some(percent) => log::info!("Processing file {:?}: {:.0}% done", progress.file, percent),
            None => log::debug!(
                "Processing file {:?}: {:.1}s encoded",
                progress.file,
                progress.out_time_seconds
            ),
        }
    }
}

/// Prepares output directories and lists each group's files. A group whose
/// output directory cannot be created is recorded once and left out.
fn prepare_groups(
    config: &AppConfig,
    failures: &mut Vec<FailureRecord>,
) -> Result<Vec<GroupJob>, AppError> {
    let mut jobs = Vec::new();
    for dir in walker::find_groups(&config.input_root)? {
        let target = GroupTarget::new(&config.output_root, config.url_prefix(), &dir.id);
        if let Err(e) = target.create() {
            log::warn!("Skipping group {:?}, output directory unavailable: {}", dir.name, e);
            failures.push(FailureRecord::new(&target.dir, e));
            continue;
        }
        let files = match walker::classify(&dir.path) {
            Ok(files) => files,
            Err(e) => {
                log::warn!("Skipping group {:?}, could not list files: {}", dir.name, e);
                failures.push(FailureRecord::new(&dir.path, e));
                continue;
            }
        };
        jobs.push(GroupJob { dir, target, files });
    }
    Ok(jobs)
}

fn load_tracks(jobs: &[GroupJob], failures: &mut Vec<FailureRecord>) -> Vec<Option<Track>> {
    jobs.iter()
        .map(|job| {
            let path = job.files.track()?;
            match geo::load_track(path) {
                Ok(track) => Some(track),
                Err(e) => {
                    log::warn!("Failed to process track {:?}: {}", path, e);
                    failures.push(FailureRecord::new(path, e));
                    None
                }
            }
        })
        .collect()
}

/// Normalizes every photo and video on two separately sized pools. Results
/// come back over one channel and are owned by the calling thread, together
/// with the parsed tracks.
fn process_media(
    config: &AppConfig,
    cancel: &CancelFlag,
    jobs: &[GroupJob],
    failures: &mut Vec<FailureRecord>,
) -> Result<(Vec<Vec<MediaItem>>, Vec<Option<Track>>), AppError> {
    let photo_jobs: Vec<(usize, &Path)> = jobs
        .iter()
        .enumerate()
        .flat_map(|(i, job)| job.files.photos.iter().map(move |p| (i, p.as_path())))
        .collect();
    let video_jobs: Vec<(usize, &Path)> = jobs
        .iter()
        .enumerate()
        .flat_map(|(i, job)| job.files.videos.iter().map(move |p| (i, p.as_path())))
        .collect();
    log::info!(
        "Processing {} photos with {} workers and {} videos with {} workers",
        photo_jobs.len(),
        config.photo_pool_size(),
        video_jobs.len(),
        config.video_pool_size()
    );

    let photo_pool = build_pool(config.photo_pool_size(), "photo")?;
    let video_pool = build_pool(config.video_pool_size(), "video")?;

    let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded();
    let (progress_tx, progress_rx) = crossbeam_channel::unbounded();
    let mut media: Vec<Vec<MediaItem>> = vec![Vec::new(); jobs.len()];

    let tracks = std::thread::scope(|s| {
        let photo_tx = outcome_tx.clone();
        s.spawn(move || {
            let result = photo_pool.install(|| {
                photo_jobs.par_iter().try_for_each(|&(group, path)| {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    log::info!("Processing photo started for: {:?}", path);
                    let result =
                        guarded(path, || photo::process_photo(config, &jobs[group].target, path));
                    send(&photo_tx, outcome(group, path, result))
                })
            });
            if let Err(e) = result {
                log::error!("Photo workers stopped: {}", e);
            }
        });

        let video_tx = outcome_tx;
        s.spawn(move || {
            let ctx = VideoContext {
                config,
                cancel,
                progress: Some(progress_tx),
            };
            let result = video_pool.install(|| {
                video_jobs.par_iter().try_for_each(|&(group, path)| {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    log::info!("Processing video started for: {:?}", path);
                    let result =
                        guarded(path, || video::process_video(&ctx, &jobs[group].target, path));
                    send(&video_tx, outcome(group, path, result))
                })
            });
            if let Err(e) = result {
                log::error!("Video workers stopped: {}", e);
            }
        });

        s.spawn(move || log_progress(progress_rx));

        let tracks = load_tracks(jobs, failures);

        for outcome in outcome_rx {
            match outcome {
                Outcome::Media { group, item } => media[group].push(item),
                Outcome::Failed(failure) => failures.push(failure),
            }
        }
        tracks
    });

    Ok((media, tracks))
}

fn log_group(config: &AppConfig, group: &Group) {
    let clusters = cluster_markers(&group.media, config.cluster_radius_m);
    log::info!(
        "Group {:?}: {} media items, {} map markers, {} tracks",
        group.id,
        group.media.len(),
        clusters.len(),
        group.geo_data.len()
    );
    for cluster in &clusters {
        log::trace!(
            "Marker at ({}, {}) holds {} items",
            cluster.latitude,
            cluster.longitude,
            cluster.items.len()
        );
    }
    if let Some(description) = &group.description {
        log::debug!("{}", render_description(description, group.metadata.as_ref()));
    }
}

fn trip_name(input_root: &Path) -> String {
    input_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| input_root.display().to_string())
}

/// Header plus one entry per failure; empty when nothing failed.
fn failure_report(failures: &[FailureRecord]) -> Vec<String> {
    if failures.is_empty() {
        return Vec::new();
    }
    let mut lines = vec![format!("{} files could not be processed:", failures.len())];
    lines.extend(failures.iter().map(|f| f.to_string()));
    lines
}

fn report_failures(failures: &[FailureRecord]) {
    let report = failure_report(failures);
    if report.is_empty() {
        log::info!("All files processed successfully.");
    }
    for line in report {
        log::error!("{}", line);
    }
}

/// Writes the manifest, then reads it back through the validating reader.
fn write_checked(trip: &Trip, path: &Path) -> Result<(), AppError> {
    manifest::write_manifest(trip, path)?;
    manifest::read_manifest(path)?;
    log::info!("Manifest written to {:?}", path);
    Ok(())
}

/// One full ingestion run: normalize every group, assemble the trip and write
/// its manifest. Per-file problems end up in the summary; only an unreadable
/// input root, a cancelled run or a manifest that cannot be written fail it.
pub fn run(config: &AppConfig, cancel: &CancelFlag) -> Result<RunSummary, AppError> {
    log::info!("Starting run for {:?}", config.input_root);

    let mut failures = Vec::new();
    let jobs = prepare_groups(config, &mut failures)?;
    let (media, tracks) = process_media(config, cancel, &jobs, &mut failures)?;

    if cancel.is_cancelled() {
        log::warn!("Run cancelled, the manifest is not written");
        return Err(AppError::Cancelled);
    }

    let mut groups: Vec<Group> = jobs
        .iter()
        .zip(media)
        .zip(tracks)
        .map(|((job, media), track)| assemble_group(&job.dir, media, track))
        .collect();
    for group in &groups {
        log_group(config, group);
    }
    groups.insert(0, all_group(&groups));

    let name = trip_name(&config.input_root);
    let trip = Trip {
        id: walker::slugify(&name),
        name,
        groups,
    };

    let manifest_path = config.output_root.join(&config.manifest_name);
    let written = write_checked(&trip, &manifest_path);
    report_failures(&failures);
    written?;

    Ok(RunSummary {
        trip,
        manifest_path,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaKind;
    use crate::photo::tests::{gps_fields, jpeg_with_exif, sample_image};

    struct Fixture {
        _tmp: tempfile::TempDir,
        input: PathBuf,
        output: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let input = tmp.path().join("Alps 2023");
            let output = tmp.path().join("out");
            std::fs::create_dir_all(&input).unwrap();
            Fixture { _tmp: tmp, input, output }
        }

        fn group(&self, name: &str) -> PathBuf {
            let dir = self.input.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            dir
        }

        fn config(&self) -> AppConfig {
            AppConfig::for_test(&self.input, &self.output)
        }
    }

    fn two_day_trip() -> Fixture {
        let fixture = Fixture::new();
        let day1 = fixture.group("Day 1");
        let located = jpeg_with_exif(&sample_image(200, 100), &gps_fields(48, "N", 16, "E"));
        std::fs::write(day1.join("a.jpg"), located).unwrap();
        sample_image(50, 50).save(day1.join("b.png")).unwrap();
        std::fs::write(day1.join("track.gpx"), geo::tests::SAMPLE_GPX).unwrap();

        let day2 = fixture.group("Day 2");
        sample_image(30, 20).save(day2.join("c.jpg")).unwrap();
        std::fs::write(day2.join("broken.jpg"), b"not an image").unwrap();
        std::fs::write(day2.join("notes.txt"), b"ignored").unwrap();
        fixture
    }

    fn ids(trip: &Trip) -> Vec<&str> {
        trip.groups.iter().map(|g| g.id.as_str()).collect()
    }

    fn names(group: &Group) -> Vec<&str> {
        group.media.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn builds_trip_from_groups() {
        let fixture = two_day_trip();
        let summary = run(&fixture.config(), &CancelFlag::new()).unwrap();
        let trip = &summary.trip;

        assert_eq!(trip.name, "Alps 2023");
        assert_eq!(trip.id, "alps-2023");
        assert_eq!(ids(trip), vec!["all", "day-1", "day-2"]);

        let day1 = &trip.groups[1];
        assert_eq!(day1.name, "Day 1");
        assert_eq!(names(day1), vec!["a.jpg", "b.png"]);
        assert_eq!(day1.media[0].location(), Some((48.0, 16.0)));
        assert_eq!(day1.media[0].src, "/media/day-1/a.jpg");
        assert_eq!(day1.media[0].thumbnail.as_deref(), Some("/media/day-1/thumb-a.jpg"));
        assert!(day1.media[1].location().is_none());
        let metadata = day1.metadata.as_ref().unwrap();
        assert_eq!(metadata.distance, 1.0);
        assert_eq!(metadata.duration, "00:10");
        assert!(day1.description.is_some());
        assert_eq!(day1.geo_data.len(), 1);

        let day2 = &trip.groups[2];
        assert_eq!(names(day2), vec!["c.jpg"]);
        assert!(day2.description.is_none());
        assert!(day2.geo_data.is_empty());

        assert_eq!(summary.failures.len(), 1);
        assert!(summary.failures[0].path.ends_with("broken.jpg"));

        let all = &trip.groups[0];
        assert_eq!(all.media.len(), day1.media.len() + day2.media.len());
        assert_eq!(names(all), vec!["a.jpg", "b.png", "c.jpg"]);
        assert_eq!(all.geo_data.len(), 1);

        assert_eq!(summary.manifest_path, fixture.output.join("index.json"));
        let written = manifest::read_manifest(&summary.manifest_path).unwrap();
        assert_eq!(ids(&written), ids(trip));
        assert_eq!(written.groups[1].media, day1.media);
        assert_eq!(written.groups[1].metadata, day1.metadata);
        assert!(fixture.output.join("day-1").join("thumb-b.png").exists());
        assert!(!fixture.output.join("day-2").join("broken.jpg").exists());
    }

    #[test]
    fn second_run_reuses_outputs() {
        let fixture = two_day_trip();
        let config = fixture.config();
        let first = run(&config, &CancelFlag::new()).unwrap();
        let photo = fixture.output.join("day-1").join("a.jpg");
        let modified = std::fs::metadata(&photo).unwrap().modified().unwrap();

        let second = run(&config, &CancelFlag::new()).unwrap();
        assert_eq!(second.trip, first.trip);
        assert_eq!(second.failures, first.failures);
        assert_eq!(std::fs::metadata(&photo).unwrap().modified().unwrap(), modified);
    }

    #[test]
    fn blocked_group_output_is_recorded_and_skipped() {
        let fixture = two_day_trip();
        std::fs::create_dir_all(&fixture.output).unwrap();
        std::fs::write(fixture.output.join("day-2"), b"in the way").unwrap();

        let summary = run(&fixture.config(), &CancelFlag::new()).unwrap();
        assert_eq!(ids(&summary.trip), vec!["all", "day-1"]);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].path, fixture.output.join("day-2"));
        assert_eq!(names(&summary.trip.groups[0]), vec!["a.jpg", "b.png"]);
    }

    #[test]
    fn unreadable_track_leaves_group_without_stats() {
        let fixture = Fixture::new();
        let day = fixture.group("Day 1");
        sample_image(20, 20).save(day.join("a.png")).unwrap();
        std::fs::write(day.join("track.gpx"), "<gpx><trk>").unwrap();

        let summary = run(&fixture.config(), &CancelFlag::new()).unwrap();
        let group = &summary.trip.groups[1];
        assert_eq!(names(group), vec!["a.png"]);
        assert!(group.metadata.is_none());
        assert!(group.geo_data.is_empty());
        assert_eq!(summary.failures.len(), 1);
        assert!(summary.failures[0].path.ends_with("track.gpx"));
    }

    #[test]
    fn empty_input_still_writes_manifest() {
        let fixture = Fixture::new();
        let summary = run(&fixture.config(), &CancelFlag::new()).unwrap();
        assert_eq!(ids(&summary.trip), vec!["all"]);
        assert!(summary.trip.groups[0].media.is_empty());
        assert!(summary.manifest_path.exists());
    }

    #[test]
    fn missing_input_root_fails_the_run() {
        let fixture = Fixture::new();
        let mut config = fixture.config();
        config.input_root = fixture.input.join("missing");
        assert!(run(&config, &CancelFlag::new()).is_err());
    }

    #[test]
    fn panicking_job_fails_only_its_file() {
        let result = guarded(Path::new("day-1/a.jpg"), || panic!("decoder bug"));
        match result {
            Err(AppError::Generic(message)) => {
                assert!(message.contains("decoder bug"));
                assert!(message.contains("a.jpg"));
            }
            other => panic!("unexpected result {:?}", other),
        }

        let ok = guarded(Path::new("b.jpg"), || Err(AppError::Cancelled));
        assert!(matches!(ok, Err(AppError::Cancelled)));
    }

    #[test]
    fn non_ascii_capture_time_does_not_stop_the_run() {
        use exif::{Field, In, Tag, Value};

        let fixture = Fixture::new();
        let day = fixture.group("Day 1");
        let fields = vec![Field {
            tag: Tag::DateTimeOriginal,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec!["2023:06:01 10:02:0\u{e9}".as_bytes().to_vec()]),
        }];
        std::fs::write(day.join("a.jpg"), jpeg_with_exif(&sample_image(40, 20), &fields)).unwrap();
        sample_image(20, 20).save(day.join("b.png")).unwrap();

        let summary = run(&fixture.config(), &CancelFlag::new()).unwrap();
        let group = &summary.trip.groups[1];
        assert_eq!(names(group), vec!["a.jpg", "b.png"]);
        assert!(group.media[0].time.is_none());
        assert!(summary.failures.is_empty());
        assert!(summary.manifest_path.exists());
    }

    #[test]
    fn failure_report_lists_every_record() {
        assert!(failure_report(&[]).is_empty());

        let failures = vec![
            FailureRecord::new("in/day-2/broken.jpg", "Image error: bad data"),
            FailureRecord::new("in/day-2/track.gpx", "Track error: no track points found"),
        ];
        let report = failure_report(&failures);
        assert_eq!(report.len(), 3);
        assert_eq!(report[0], "2 files could not be processed:");
        assert_eq!(report[1], "- in/day-2/broken.jpg\n  Image error: bad data");
    }

    #[test]
    fn unwritable_manifest_fails_after_media_is_processed() {
        let fixture = two_day_trip();
        std::fs::create_dir_all(&fixture.output).unwrap();
        std::fs::write(fixture.output.join("blocked"), b"not a directory").unwrap();
        let mut config = fixture.config();
        config.manifest_name = "blocked/index.json".into();

        let result = run(&config, &CancelFlag::new());
        assert!(matches!(result, Err(AppError::Io(_))));
        assert!(fixture.output.join("day-1").join("a.jpg").exists());
        assert!(!fixture.output.join("blocked").join("index.json").exists());
    }

    #[test]
    fn cancelled_run_writes_no_manifest() {
        let fixture = two_day_trip();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = run(&fixture.config(), &cancel);
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(!fixture.output.join("index.json").exists());
        assert!(!fixture.output.join("day-1").join("a.jpg").exists());
    }

    #[cfg(unix)]
    #[test]
    fn videos_join_their_group() {
        let fixture = Fixture::new();
        let day = fixture.group("Day 1");
        std::fs::write(day.join("clip.mp4"), b"raw video").unwrap();
        sample_image(20, 20).save(day.join("d.png")).unwrap();
        let (ffmpeg, ffprobe) = video::tests::fake_tools(fixture._tmp.path());
        let mut config = fixture.config();
        config.ffmpeg_path = ffmpeg.clone();
        config.ffprobe_path = ffprobe;

        let summary = run(&config, &CancelFlag::new()).unwrap();
        let group = &summary.trip.groups[1];
        assert_eq!(names(group), vec!["clip.webm", "d.png"]);
        assert_eq!(group.media[0].kind, MediaKind::Video);
        assert_eq!((group.media[0].width, group.media[0].height), (640, 360));
        assert_eq!(group.media[0].thumbnail.as_deref(), Some("/media/day-1/thumb-clip.jpg"));
        assert_eq!(video::tests::fake_runs(&ffmpeg), 2);
        assert!(summary.failures.is_empty());
    }
}
