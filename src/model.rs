use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MediaItem {
    pub name: String,
    pub src: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl MediaItem {
    /// Latitude/longitude pair, only when both are present.
    pub fn location(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// `[lon, lat]` or `[lon, lat, ele]`.
pub type Position = Vec<f64>;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeatureCollectionType {
    #[default]
    FeatureCollection,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeatureType {
    #[default]
    Feature,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum Geometry {
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum CoordinateTimes {
    Line(Vec<Option<String>>),
    Multi(Vec<Vec<Option<String>>>),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CoordinateProperties {
    pub times: CoordinateTimes,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct FeatureProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        rename = "coordinateProperties",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub coordinate_properties: Option<CoordinateProperties>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: FeatureType,
    pub properties: FeatureProperties,
    pub geometry: Geometry,
}

/// One parsed track file as a GeoJSON FeatureCollection with its bounding box
/// `[minLon, minLat, maxLon, maxLat]`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GeoTrack {
    #[serde(rename = "type")]
    pub kind: FeatureCollectionType,
    pub features: Vec<Feature>,
    pub bbox: [f64; 4],
}

/// Substitution tokens for a group's description template.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GroupMetadata {
    pub distance: f64,
    pub duration: String,
    pub speed: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub media: Vec<MediaItem>,
    #[serde(rename = "geoData", default, skip_serializing_if = "Vec::is_empty")]
    pub geo_data: Vec<GeoTrack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<GroupMetadata>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Trip {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub path: PathBuf,
    pub error: String,
}

impl FailureRecord {
    pub fn new(path: impl Into<PathBuf>, error: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            error: error.to_string(),
        }
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "- {}\n  {}", self.path.display(), self.error)
    }
}
