use crate::geo::TrackStats;
use crate::model::{GeoTrack, Group, GroupMetadata, MediaItem};
use crate::walker::{GroupDir, ALL_GROUP_ID};

/// Filled in by the viewer from the group's metadata.
pub const DESCRIPTION_TEMPLATE: &str =
    "Total distance: {distance} km\nDuration: {duration}\nAverage speed: {speed} km/h";

const ALL_GROUP_NAME: &str = "Show all";

impl From<&TrackStats> for GroupMetadata {
    fn from(stats: &TrackStats) -> Self {
        GroupMetadata {
            distance: stats.distance_km,
            duration: stats.duration_label(),
            speed: stats.average_speed_kmh,
        }
    }
}

/// Builds a group from its normalized media and parsed track. Media is ordered
/// by file name regardless of the order workers finished in; the description
/// is attached only when the track produced statistics.
pub fn assemble_group(
    dir: &GroupDir,
    mut media: Vec<MediaItem>,
    track: Option<(GeoTrack, Option<TrackStats>)>,
) -> Group {
    media.sort_by(|a, b| a.name.cmp(&b.name));

    let (geo_data, stats) = match track {
        Some((geo, stats)) => (vec![geo], stats),
        None => (Vec::new(), None),
    };
    let metadata = stats.as_ref().map(GroupMetadata::from);

    Group {
        id: dir.id.clone(),
        name: dir.name.clone(),
        description: metadata.as_ref().map(|_| DESCRIPTION_TEMPLATE.to_string()),
        media,
        geo_data,
        metadata,
    }
}

/// The synthetic first group: every other group's media and tracks, in order.
pub fn all_group(groups: &[Group]) -> Group {
    Group {
        id: ALL_GROUP_ID.to_string(),
        name: ALL_GROUP_NAME.to_string(),
        description: None,
        media: groups.iter().flat_map(|g| g.media.iter().cloned()).collect(),
        geo_data: groups.iter().flat_map(|g| g.geo_data.iter().cloned()).collect(),
        metadata: None,
    }
}

/// Replaces `{distance}`, `{duration}` and `{speed}` in `template`.
pub fn render_description(template: &str, metadata: Option<&GroupMetadata>) -> String {
    match metadata {
        Some(m) => template
            .replace("{distance}", &m.distance.to_string())
            .replace("{duration}", &m.duration)
            .replace("{speed}", &m.speed.to_string()),
        None => template.to_string(),
    }
}
