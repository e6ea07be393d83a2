use crate::error::AppError;
use crate::model::{
    CoordinateProperties, CoordinateTimes, Feature, FeatureCollectionType, FeatureProperties,
    FeatureType, GeoTrack, Geometry, Position,
};
use chrono::{DateTime, FixedOffset};
use lazy_static::lazy_static;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::borrow::Cow;
use std::path::Path;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

lazy_static! {
    static ref NAMESPACE_DECL: Regex = Regex::new(r#"\sxmlns[^"]+"[^"]+""#).unwrap();
}

/// A time-stamped sample from a track, in file order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub time: DateTime<FixedOffset>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackStats {
    pub distance_km: f64,
    pub duration_seconds: f64,
    pub average_speed_kmh: f64,
}

impl TrackStats {
    pub fn duration_label(&self) -> String {
        format_hours_minutes(self.duration_seconds)
    }
}

#[derive(Debug, Clone)]
struct RawPoint {
    latitude: f64,
    longitude: f64,
    elevation: Option<f64>,
    time: Option<String>,
}

impl RawPoint {
    fn position(&self) -> Position {
        match self.elevation {
            Some(ele) => vec![self.longitude, self.latitude, ele],
            None => vec![self.longitude, self.latitude],
        }
    }

    fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        let text = self.time.as_deref()?;
        match DateTime::parse_from_rfc3339(text) {
            Ok(t) => Some(t),
            Err(e) => {
                log::warn!("Ignoring unparsable track timestamp {:?}: {}", text, e);
                None
            }
        }
    }
}

#[derive(Debug, Default)]
struct RawTrack {
    name: Option<String>,
    segments: Vec<Vec<RawPoint>>,
}

#[derive(Clone, Copy)]
enum TextField {
    Name,
    Time,
    Elevation,
}

/// Removes `xmlns` declarations. Some loggers write duplicated or broken ones,
/// and the element names are matched by local name anyway.
pub fn strip_namespaces(xml: &str) -> Cow<'_, str> {
    NAMESPACE_DECL.replace_all(xml, "")
}

/// Great-circle distance in meters between two `(lat, lon)` pairs.
pub fn distance_between(a: (f64, f64), b: (f64, f64)) -> f64 {
    let rad = std::f64::consts::PI / 180.0;
    let lat1 = a.0 * rad;
    let lat2 = b.0 * rad;
    let sin_d_lat = ((b.0 - a.0) * rad / 2.0).sin();
    let sin_d_lon = ((b.1 - a.1) * rad / 2.0).sin();
    let h = sin_d_lat * sin_d_lat + lat1.cos() * lat2.cos() * sin_d_lon * sin_d_lon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Renders seconds as `HH:mm`; hours are not capped at 24.
pub fn format_hours_minutes(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let hours = (seconds / 3600.0).floor() as u64;
    let minutes = ((seconds % 3600.0) / 60.0).floor() as u64;
    format!("{:02}:{:02}", hours, minutes)
}

/// Distance, duration and average speed of an ordered point list.
///
/// Returns `None` with fewer than two points. The input order is trusted:
/// duration is last minus first timestamp. Zero-length segments count toward
/// distance but not toward the speed samples; neither do segments whose
/// elapsed time is not positive. Distance and speed are truncated to two
/// decimals.
pub fn compute_stats(points: &[TrackPoint]) -> Option<TrackStats> {
    if points.len() < 2 {
        return None;
    }

    let start = points[0].time;
    let end = points[points.len() - 1].time;
    let duration_seconds = (end - start).num_milliseconds() as f64 / 1000.0;

    let mut total_distance = 0.0;
    let mut speeds = Vec::with_capacity(points.len() - 1);
    for pair in points.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let distance = distance_between((a.latitude, a.longitude), (b.latitude, b.longitude));
        total_distance += distance;
        if distance > 0.0 {
            let elapsed_ms = (b.time - a.time).num_milliseconds() as f64;
            if elapsed_ms > 0.0 {
                speeds.push(distance / elapsed_ms);
            }
        }
    }

    let distance_km = (total_distance / 10.0).floor() / 100.0;
    let average_speed_kmh = if speeds.is_empty() {
        0.0
    } else {
        let mean_m_per_ms = speeds.iter().sum::<f64>() / speeds.len() as f64;
        (mean_m_per_ms * 3600.0 * 100.0).floor() / 100.0
    };

    Some(TrackStats {
        distance_km,
        duration_seconds,
        average_speed_kmh,
    })
}

fn read_point(element: &BytesStart) -> Result<RawPoint, AppError> {
    let mut latitude = None;
    let mut longitude = None;
    for attr in element.attributes() {
        let attr = attr?;
        match attr.key.local_name().as_ref() {
            b"lat" => latitude = Some(parse_coordinate(&attr.unescape_value()?)?),
            b"lon" => longitude = Some(parse_coordinate(&attr.unescape_value()?)?),
            _ => {}
        }
    }

    match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Ok(RawPoint {
            latitude,
            longitude,
            elevation: None,
            time: None,
        }),
        _ => Err(AppError::Track("track point without lat/lon".into())),
    }
}

fn parse_coordinate(text: &str) -> Result<f64, AppError> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| AppError::Track(format!("invalid coordinate {:?}", text)))
}

fn finish_point(point: RawPoint, segment: &mut Option<Vec<RawPoint>>) {
    segment.get_or_insert_with(Vec::new).push(point);
}

fn finish_segment(segment: &mut Option<Vec<RawPoint>>, track: &mut Option<RawTrack>) {
    if let Some(points) = segment.take() {
        if !points.is_empty() {
            track.get_or_insert_with(RawTrack::default).segments.push(points);
        }
    }
}

fn parse_tracks(xml: &str) -> Result<Vec<RawTrack>, AppError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut tracks = Vec::new();
    let mut track: Option<RawTrack> = None;
    let mut segment: Option<Vec<RawPoint>> = None;
    let mut point: Option<RawPoint> = None;
    let mut field: Option<TextField> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"trk" => track = Some(RawTrack::default()),
                b"trkseg" => segment = Some(Vec::new()),
                b"trkpt" => point = Some(read_point(&e)?),
                b"time" if point.is_some() => field = Some(TextField::Time),
                b"ele" if point.is_some() => field = Some(TextField::Elevation),
                b"name" if track.is_some() && point.is_none() => field = Some(TextField::Name),
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"trkpt" {
                    finish_point(read_point(&e)?, &mut segment);
                }
            }
            Event::Text(t) => {
                if let Some(kind) = field {
                    let text = t.unescape()?.trim().to_string();
                    match kind {
                        TextField::Name => {
                            if let Some(track) = track.as_mut() {
                                track.name = Some(text);
                            }
                        }
                        TextField::Time => {
                            if let Some(point) = point.as_mut() {
                                point.time = Some(text);
                            }
                        }
                        TextField::Elevation => {
                            if let Some(point) = point.as_mut() {
                                point.elevation = text.parse().ok();
                            }
                        }
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"trkpt" => {
                    if let Some(p) = point.take() {
                        finish_point(p, &mut segment);
                    }
                }
                b"trkseg" => finish_segment(&mut segment, &mut track),
                b"trk" => {
                    finish_segment(&mut segment, &mut track);
                    if let Some(t) = track.take() {
                        if !t.segments.is_empty() {
                            tracks.push(t);
                        }
                    }
                }
                b"time" | b"ele" | b"name" => field = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(tracks)
}

fn bounding_box(tracks: &[RawTrack]) -> [f64; 4] {
    let mut bbox = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
    for point in tracks.iter().flat_map(|t| t.segments.iter().flatten()) {
        bbox[0] = bbox[0].min(point.longitude);
        bbox[1] = bbox[1].min(point.latitude);
        bbox[2] = bbox[2].max(point.longitude);
        bbox[3] = bbox[3].max(point.latitude);
    }
    bbox
}

fn to_feature(track: &RawTrack) -> Feature {
    let times_of = |segment: &Vec<RawPoint>| -> Vec<Option<String>> {
        segment.iter().map(|p| p.time.clone()).collect()
    };
    let any_time = track.segments.iter().flatten().any(|p| p.time.is_some());

    let (geometry, times) = if track.segments.len() == 1 {
        let segment = &track.segments[0];
        (
            Geometry::LineString {
                coordinates: segment.iter().map(RawPoint::position).collect(),
            },
            CoordinateTimes::Line(times_of(segment)),
        )
    } else {
        (
            Geometry::MultiLineString {
                coordinates: track
                    .segments
                    .iter()
                    .map(|s| s.iter().map(RawPoint::position).collect())
                    .collect(),
            },
            CoordinateTimes::Multi(track.segments.iter().map(times_of).collect()),
        )
    };

    Feature {
        kind: FeatureType::Feature,
        properties: FeatureProperties {
            name: track.name.clone(),
            coordinate_properties: any_time.then(|| CoordinateProperties { times }),
        },
        geometry,
    }
}

/// Parses GPX text into a GeoJSON track plus statistics of its first track.
/// Statistics are `None` when fewer than two points carry a timestamp.
pub fn process_track(contents: &str) -> Result<(GeoTrack, Option<TrackStats>), AppError> {
    let contents = strip_namespaces(contents);
    let tracks = parse_tracks(&contents)?;
    if tracks.is_empty() {
        return Err(AppError::Track("no track points found".into()));
    }

    let geo_track = GeoTrack {
        kind: FeatureCollectionType::FeatureCollection,
        features: tracks.iter().map(to_feature).collect(),
        bbox: bounding_box(&tracks),
    };

    let points: Vec<TrackPoint> = tracks[0]
        .segments
        .iter()
        .flatten()
        .filter_map(|p| {
            p.timestamp().map(|time| TrackPoint {
                time,
                latitude: p.latitude,
                longitude: p.longitude,
            })
        })
        .collect();
    let stats = compute_stats(&points);
    log::debug!("Parsed {} timed points, stats: {:?}", points.len(), stats);

    Ok((geo_track, stats))
}

pub fn load_track(path: &Path) -> Result<(GeoTrack, Option<TrackStats>), AppError> {
    log::info!("Processing track {:?}", path);
    let contents = std::fs::read_to_string(path)?;
    process_track(&contents)
}
