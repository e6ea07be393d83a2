use crate::config::AppConfig;
use crate::error::AppError;
use crate::model::{MediaItem, MediaKind};
use crate::output::{self, GroupTarget};
use chrono::{NaiveDateTime, SecondsFormat, TimeZone, Utc};
use exif::{In, Reader, Tag, Value};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// What the photo's EXIF block tells us. Everything is optional; a photo
/// without EXIF is still a valid photo.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PhotoExif {
    pub orientation: u16,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub time: Option<String>,
    pub caption: Option<String>,
}

/// Signed decimal degrees from degree/minute/second and a hemisphere
/// reference; `S` and `W` are negative.
pub fn convert_coordinate(dms: &[f64], reference: &str) -> Option<f64> {
    if dms.len() < 3 {
        return None;
    }
    let sign = match reference.trim() {
        "N" | "E" => 1.0,
        _ => -1.0,
    };
    Some(sign * (dms[0] + dms[1] / 60.0 + dms[2] / 3600.0))
}

/// Largest size within `max` x `max` keeping the aspect ratio; never enlarges.
pub fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width <= max && height <= max {
        return (width, height);
    }
    let scale = (max as f64 / width as f64).min(max as f64 / height as f64);
    let w = ((width as f64 * scale).round() as u32).clamp(1, max);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max);
    (w, h)
}

/// Applies an EXIF orientation (1-8) to the pixels.
fn apply_orientation(img: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

fn read_ascii(exif: &exif::Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Ascii(vecs) => {
            let s = vecs
                .first()
                .and_then(|v| std::str::from_utf8(v).ok())?
                .trim_end_matches('\0')
                .trim()
                .to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
        _ => None,
    }
}

fn read_coordinate(exif: &exif::Exif, value_tag: Tag, ref_tag: Tag) -> Option<f64> {
    let field = exif.get_field(value_tag, In::PRIMARY)?;
    let dms: Vec<f64> = match &field.value {
        Value::Rational(parts) => parts.iter().map(|r| r.to_f64()).collect(),
        _ => return None,
    };
    let reference = read_ascii(exif, ref_tag)?;
    convert_coordinate(&dms, &reference).filter(|v| v.is_finite() && *v != 0.0)
}

fn read_orientation(exif: &exif::Exif) -> u16 {
    exif.get_field(Tag::Orientation, In::PRIMARY)
        .and_then(|field| match &field.value {
            Value::Short(v) => v.first().copied(),
            _ => None,
        })
        .unwrap_or(1)
}

/// EXIF `YYYY:MM:DD HH:MM:SS` as an RFC 3339 UTC string. Anything after the
/// seconds (sub-second digits, padding) is ignored.
pub fn parse_exif_datetime(s: &str) -> Option<String> {
    let head = s.trim_end_matches('\0').trim().get(..19)?;
    let ndt = NaiveDateTime::parse_from_str(head, "%Y:%m:%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(head, "%Y-%m-%d %H:%M:%S"))
        .ok()?;
    Some(
        Utc.from_utc_datetime(&ndt)
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

pub fn read_exif(path: &Path) -> Result<PhotoExif, AppError> {
    let mut buf_reader = BufReader::new(File::open(path)?);
    let exif = match Reader::new().read_from_container(&mut buf_reader) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) | Err(exif::Error::InvalidFormat("Unknown image format")) => {
            log::debug!("No EXIF data found for {:?}", path);
            return Ok(PhotoExif {
                orientation: 1,
                ..PhotoExif::default()
            });
        }
        Err(e) => return Err(e.into()),
    };

    let info = PhotoExif {
        orientation: read_orientation(&exif),
        latitude: read_coordinate(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef),
        longitude: read_coordinate(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef),
        time: read_ascii(&exif, Tag::DateTimeOriginal).and_then(|s| parse_exif_datetime(&s)),
        caption: read_ascii(&exif, Tag::ImageDescription),
    };
    log::trace!("EXIF for {:?}: {:?}", path, info);
    Ok(info)
}

/// Opens `path` with the format guessed from its content, falling back to
/// the extension. Aliases like `.jfif` or `.dib` are not known by extension.
fn open_guessed(path: &Path) -> Result<image::io::Reader<BufReader<File>>, AppError> {
    Ok(image::io::Reader::open(path)?.with_guessed_format()?)
}

fn read_dimensions(path: &Path) -> Result<(u32, u32), AppError> {
    Ok(open_guessed(path)?.into_dimensions()?)
}

/// The source image, decoded and upright, on first use only. Outputs are
/// written in the format detected here.
struct SourceImage<'a> {
    path: &'a Path,
    orientation: u16,
    decoded: Option<(DynamicImage, ImageFormat)>,
}

impl<'a> SourceImage<'a> {
    fn new(path: &'a Path, orientation: u16) -> Self {
        Self {
            path,
            orientation,
            decoded: None,
        }
    }

    fn get(&mut self) -> Result<(&DynamicImage, ImageFormat), AppError> {
        if self.decoded.is_none() {
            log::trace!("Decoding {:?}", self.path);
            let reader = open_guessed(self.path)?;
            let format = reader.format().ok_or_else(|| {
                AppError::Generic(format!("{:?} is not in a known image format", self.path))
            })?;
            let img = reader.decode()?;
            self.decoded = Some((apply_orientation(img, self.orientation), format));
        }
        match &self.decoded {
            Some((img, format)) => Ok((img, *format)),
            None => Err(AppError::Generic(format!("{:?} could not be decoded", self.path))),
        }
    }
}

/// Encodes `img` to a partial file next to `target` and renames it into place.
fn save_atomic(img: &DynamicImage, target: &Path, format: ImageFormat) -> Result<(), AppError> {
    let partial = output::partial_path(target);

    let result = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()).save_with_format(&partial, format),
        _ => img.save_with_format(&partial, format),
    };
    if let Err(e) = result {
        output::discard(&partial);
        return Err(e.into());
    }
    output::commit(&partial, target)
}

fn resize_photo(source: &mut SourceImage, target: &Path, max: u32) -> Result<(u32, u32), AppError> {
    let (img, format) = source.get()?;
    let (width, height) = fit_within(img.width(), img.height(), max);
    if (width, height) == img.dimensions() {
        save_atomic(img, target, format)?;
    } else {
        save_atomic(&img.resize_exact(width, height, FilterType::Lanczos3), target, format)?;
    }
    log::debug!("Resized {:?} to {}x{}", target, width, height);
    Ok((width, height))
}

/// Size of the normalized photo: read from `target` when it already exists,
/// otherwise (or when it cannot be read) produced by resizing.
fn resize_photo_or_get_size(
    source: &mut SourceImage,
    target: &Path,
    max: u32,
) -> Result<(u32, u32), AppError> {
    if !target.exists() {
        log::info!("File {:?} doesn't exist, resizing the image...", target);
        return resize_photo(source, target, max);
    }

    log::debug!("File {:?} already exists, reading its dimensions...", target);
    match read_dimensions(target) {
        Ok(dimensions) => Ok(dimensions),
        Err(e) => {
            log::warn!("Could not get the dimensions of {:?}: {}", target, e);
            log::info!("Trying to resize the image {:?}...", target);
            resize_photo(source, target, max)
        }
    }
}

fn generate_thumbnail(source: &mut SourceImage, target: &Path, size: u32) -> Result<(), AppError> {
    if target.exists() {
        log::trace!("Thumbnail {:?} already exists", target);
        return Ok(());
    }
    let (img, format) = source.get()?;
    save_atomic(&img.thumbnail(size, size), target, format)?;
    log::debug!("Thumbnail saved to: {:?}", target);
    Ok(())
}

pub fn process_photo(config: &AppConfig, target: &GroupTarget, path: &Path) -> Result<MediaItem, AppError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| AppError::Generic(format!("{:?} has no file name", path)))?;
    let thumbnail_name = format!("thumb-{}", name);

    let exif = read_exif(path)?;
    let mut source = SourceImage::new(path, exif.orientation);

    let (width, height) =
        resize_photo_or_get_size(&mut source, &target.file(&name), config.max_dimension)?;
    generate_thumbnail(&mut source, &target.file(&thumbnail_name), config.thumbnail_size)?;

    Ok(MediaItem {
        src: target.url(&name),
        thumbnail: Some(target.url(&thumbnail_name)),
        name,
        kind: MediaKind::Photo,
        width,
        height,
        latitude: exif.latitude,
        longitude: exif.longitude,
        time: exif.time,
        caption: exif.caption,
    })
}
