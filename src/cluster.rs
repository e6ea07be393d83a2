use crate::geo::distance_between;
use crate::model::MediaItem;

/// Items that share one map marker. `items` holds indices into the input
/// slice; the first one is the seed the others were measured against.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerCluster {
    pub latitude: f64,
    pub longitude: f64,
    pub items: Vec<usize>,
}

/// Groups located media whose distance to a cluster seed is below
/// `radius_m`. Unlocated items are left out. Quadratic, which is fine for
/// the few hundred items a group holds.
pub fn cluster_markers(media: &[MediaItem], radius_m: f64) -> Vec<MarkerCluster> {
    let located: Vec<(usize, (f64, f64))> = media
        .iter()
        .enumerate()
        .filter_map(|(index, item)| item.location().map(|loc| (index, loc)))
        .filter(|(_, (lat, lon))| lat.is_finite() && lon.is_finite() && *lat != 0.0 && *lon != 0.0)
        .collect();

    let mut clustered = vec![false; located.len()];
    let mut clusters = Vec::new();

    for i in 0..located.len() {
        if clustered[i] {
            continue;
        }
        clustered[i] = true;
        let (seed_index, seed) = located[i];
        let mut cluster = MarkerCluster {
            latitude: seed.0,
            longitude: seed.1,
            items: vec![seed_index],
        };

        for j in (i + 1)..located.len() {
            if clustered[j] {
                continue;
            }
            let (index, position) = located[j];
            if distance_between(seed, position) < radius_m {
                clustered[j] = true;
                cluster.items.push(index);
            }
        }
        clusters.push(cluster);
    }

    clusters
}
