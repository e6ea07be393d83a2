use crate::error::AppError;
use crate::model::{Group, Trip};
use crate::output;
use std::collections::HashSet;
use std::path::Path;

fn is_url_safe(id: &str) -> bool {
    !id.is_empty() && !id.contains(' ') && !id.contains('/') && id.to_lowercase() == id
}

fn validate_group(group: &Group, seen: &mut HashSet<String>) -> Result<(), AppError> {
    if !is_url_safe(&group.id) {
        return Err(AppError::Manifest(format!("group id {:?} is not URL-safe", group.id)));
    }
    if !seen.insert(group.id.clone()) {
        return Err(AppError::Manifest(format!("duplicate group id {:?}", group.id)));
    }
    for item in &group.media {
        let coordinates = [item.latitude, item.longitude];
        if coordinates.iter().flatten().any(|c| !c.is_finite()) {
            return Err(AppError::Manifest(format!(
                "media {:?} in group {:?} has a non-finite coordinate",
                item.name, group.id
            )));
        }
    }
    Ok(())
}

/// Checks what the types alone cannot express.
pub fn validate(trip: &Trip) -> Result<(), AppError> {
    let mut seen = HashSet::new();
    for group in &trip.groups {
        validate_group(group, &mut seen)?;
    }
    Ok(())
}

/// The only way a manifest is read back: typed deserialization followed by
/// validation. Any mismatch rejects the whole document.
pub fn parse_manifest(json: &str) -> Result<Trip, AppError> {
    let trip: Trip =
        serde_json::from_str(json).map_err(|e| AppError::Manifest(e.to_string()))?;
    validate(&trip)?;
    Ok(trip)
}

pub fn read_manifest(path: &Path) -> Result<Trip, AppError> {
    let json = std::fs::read_to_string(path)?;
    parse_manifest(&json)
}

pub fn write_manifest(trip: &Trip, path: &Path) -> Result<(), AppError> {
    log::info!("Writing output to {:?}...", path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_vec(trip)?;
    let partial = output::partial_path(path);
    if let Err(e) = std::fs::write(&partial, json) {
        output::discard(&partial);
        return Err(e.into());
    }
    output::commit(&partial, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupMetadata, MediaItem, MediaKind};

    fn trip() -> Trip {
        Trip {
            id: "alps".into(),
            name: "Alps".into(),
            groups: vec![Group {
                id: "day-1".into(),
                name: "Day 1".into(),
                description: Some("Total distance: {distance} km".into()),
                media: vec![MediaItem {
                    name: "a.jpg".into(),
                    src: "/data/day-1/a.jpg".into(),
                    kind: MediaKind::Photo,
                    width: 1080,
                    height: 720,
                    latitude: Some(48.0),
                    longitude: Some(16.0),
                    time: Some("2023-06-01T10:02:00.000Z".into()),
                    thumbnail: Some("/data/day-1/thumb-a.jpg".into()),
                    caption: None,
                }],
                geo_data: vec![],
                metadata: Some(GroupMetadata {
                    distance: 1.0,
                    duration: "00:10".into(),
                    speed: 6.0,
                }),
            }],
        }
    }

    #[test]
    fn written_manifest_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out").join("index.json");
        write_manifest(&trip(), &path).unwrap();
        assert_eq!(read_manifest(&path).unwrap(), trip());
        assert!(!output::partial_path(&path).exists());
    }

    #[test]
    fn optional_fields_are_omitted() {
        let json = serde_json::to_value(trip()).unwrap();
        let item = &json["groups"][0]["media"][0];
        assert_eq!(item["type"], "photo");
        assert!(item.get("caption").is_none());
        assert!(json["groups"][0].get("geoData").is_none());
        assert_eq!(json["groups"][0]["metadata"]["duration"], "00:10");
    }

    #[test]
    fn wrong_media_type_rejects_everything() {
        let json = serde_json::to_string(&trip()).unwrap().replace("\"photo\"", "\"audio\"");
        assert!(matches!(parse_manifest(&json), Err(AppError::Manifest(_))));
    }

    #[test]
    fn wrong_field_type_rejects_everything() {
        let json = serde_json::to_string(&trip())
            .unwrap()
            .replace("\"width\":1080", "\"width\":\"1080\"");
        assert!(matches!(parse_manifest(&json), Err(AppError::Manifest(_))));
    }

    #[test]
    fn missing_required_field_rejects_everything() {
        let json = r#"{"id": "t", "name": "T", "groups": [{"id": "g", "media": [{"name": "a", "type": "photo", "width": 1, "height": 1}]}]}"#;
        assert!(matches!(parse_manifest(json), Err(AppError::Manifest(_))));
    }

    #[test]
    fn duplicate_or_unsafe_group_ids_are_rejected() {
        let mut duplicated = trip();
        duplicated.groups.push(duplicated.groups[0].clone());
        assert!(validate(&duplicated).is_err());

        let mut unsafe_id = trip();
        unsafe_id.groups[0].id = "Day 1".into();
        assert!(validate(&unsafe_id).is_err());
    }

    #[test]
    fn groups_default_to_empty() {
        let parsed = parse_manifest(r#"{"id": "t", "name": "T"}"#).unwrap();
        assert!(parsed.groups.is_empty());
    }
}
