//! External layers: distance to transit and parks, facility counts per IRIS

use kiddo::{KdTree, SquaredEuclidean};
use polars::prelude::*;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::data::catalog::IRIS_VAR;
use crate::data::frame::{
    self, f64_values, float_column, has_column, left_join, text_column, text_key, text_values,
};
use crate::data::utils::EARTH_RADIUS_M;
use crate::error::Result;

pub const TRANSPORT_DISTANCE_VAR: &str = "distance_transport";
pub const PARK_DISTANCE_VAR: &str = "distance_espace_vert";

/// Point column of the open-data station and park exports
pub const GEO_POINT_COLUMN: &str = "Geo Point";

/// Facility counts keyed by the first letter of the BPE equipment type
pub const FACILITY_GROUPS: &[(char, &str)] = &[
    ('A', "nb_services"),
    ('B', "nb_commerces"),
    ('C', "nb_enseignement"),
    ('D', "nb_sante"),
    ('E', "nb_transport_tourisme"),
    ('F', "nb_sport_loisirs"),
];

const GROUP_COUNT: usize = FACILITY_GROUPS.len();

const BPE_IRIS_COLUMN: &str = "DCIRIS";
const BPE_TYPE_COLUMN: &str = "TYPEQU";

/// IRIS codes have 9 characters; numeric readings lose leading zeros
pub const IRIS_CODE_WIDTH: usize = 9;

/// IRIS codes that are not real neighborhoods (unassigned, Corsica)
const EXCLUDED_IRIS_PATTERNS: &[&str] = &["_IND", "0000", "2A", "2B"];

fn to_unit_sphere(lat: f64, lon: f64) -> [f64; 3] {
    let (lat, lon) = (lat.to_radians(), lon.to_radians());
    [lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin()]
}

/// Nearest-point index over (lat, lon) locations
///
/// Points are stored as unit vectors so the chord distance returned by the
/// tree converts exactly to a great-circle distance.
pub struct SpatialIndex {
    tree: KdTree<f64, 3>,
    len: usize,
}

impl SpatialIndex {
    pub fn from_points(points: &[(f64, f64)]) -> Self {
        let mut tree: KdTree<f64, 3> = KdTree::new();
        for (i, (lat, lon)) in points.iter().enumerate() {
            tree.add(&to_unit_sphere(*lat, *lon), i as u64);
        }
        Self {
            tree,
            len: points.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Distance in metres to the closest indexed point
    pub fn nearest_distance_m(&self, lat: f64, lon: f64) -> Option<f64> {
        if self.is_empty() || !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        let nearest = self
            .tree
            .nearest_one::<SquaredEuclidean>(&to_unit_sphere(lat, lon));
        let chord = nearest.distance.max(0.0).sqrt();
        let angle = 2.0 * (chord / 2.0).min(1.0).asin();
        Some(angle * EARTH_RADIUS_M)
    }
}

/// Parse a `"lat, lon"` point
pub fn parse_geo_point(text: &str) -> Option<(f64, f64)> {
    let (lat, lon) = text.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)).then_some((lat, lon))
}

/// Points of a layer frame; unparseable cells are skipped
pub fn load_points(layer: &DataFrame, column: &str) -> Result<Vec<(f64, f64)>> {
    let cells = text_values(layer, column)?;
    let points: Vec<(f64, f64)> = cells
        .iter()
        .flatten()
        .filter_map(|c| parse_geo_point(c))
        .collect();
    let skipped = layer.height() - points.len();
    if skipped > 0 {
        warn!("{} rows of {} without a valid point", skipped, column);
    }
    Ok(points)
}

/// Layer frame `[id_mutation, name]` with the distance from each
/// transaction to the nearest point. Rows without coordinates get no value.
pub fn distance_layer(
    transactions: &DataFrame,
    index: &SpatialIndex,
    name: &str,
) -> Result<DataFrame> {
    let ids = frame::column(transactions, "id_mutation")?.clone();
    let lat = f64_values(transactions, "latitude")?;
    let lon = f64_values(transactions, "longitude")?;
    let distances = lat
        .iter()
        .zip(&lon)
        .map(|(la, lo)| match (la, lo) {
            (Some(la), Some(lo)) => index.nearest_distance_m(*la, *lo),
            _ => None,
        })
        .collect();
    Ok(DataFrame::new(vec![ids, float_column(name, distances)])?)
}

pub fn add_distance_to_transportation(
    transactions: &DataFrame,
    stations: &DataFrame,
) -> Result<DataFrame> {
    let index = SpatialIndex::from_points(&load_points(stations, GEO_POINT_COLUMN)?);
    info!("Transport index built over {} stations", index.len());
    distance_layer(transactions, &index, TRANSPORT_DISTANCE_VAR)
}

pub fn add_distance_to_parks(transactions: &DataFrame, parks: &DataFrame) -> Result<DataFrame> {
    let index = SpatialIndex::from_points(&load_points(parks, GEO_POINT_COLUMN)?);
    info!("Park index built over {} green spaces", index.len());
    distance_layer(transactions, &index, PARK_DISTANCE_VAR)
}

fn is_excluded_iris(code: &str) -> bool {
    EXCLUDED_IRIS_PATTERNS.iter().any(|p| code.contains(p))
}

/// Count facilities per IRIS and facility group from the raw BPE frame
pub fn aggregate_facilities(bpe: &DataFrame) -> Result<DataFrame> {
    let keyed = text_key(bpe, BPE_IRIS_COLUMN, Some(IRIS_CODE_WIDTH))?;
    let iris = text_values(&keyed, BPE_IRIS_COLUMN)?;
    let types = text_values(&keyed, BPE_TYPE_COLUMN)?;

    let mut counts: BTreeMap<String, [f64; GROUP_COUNT]> = BTreeMap::new();
    let mut excluded = 0usize;
    for (code, kind) in iris.iter().zip(&types) {
        let (Some(code), Some(kind)) = (code, kind) else {
            continue;
        };
        if is_excluded_iris(code) {
            excluded += 1;
            continue;
        }
        let Some(group) = kind
            .chars()
            .next()
            .and_then(|c| FACILITY_GROUPS.iter().position(|(p, _)| *p == c))
        else {
            continue;
        };
        counts.entry(code.clone()).or_insert([0.0; GROUP_COUNT])[group] += 1.0;
    }
    if excluded > 0 {
        info!("{} facilities outside a regular IRIS removed", excluded);
    }

    let mut columns = vec![text_column(
        IRIS_VAR,
        counts.keys().map(|k| Some(k.clone())).collect(),
    )];
    for (g, (_, name)) in FACILITY_GROUPS.iter().enumerate() {
        columns.push(float_column(name, counts.values().map(|c| Some(c[g])).collect()));
    }
    Ok(DataFrame::new(columns)?)
}

/// Left join facility counts on `code_iris`, both sides compared as
/// 9-character codes. A transaction whose IRIS has no facility gets zero
/// counts; one without an IRIS gets missing values.
pub fn add_public_facilities(
    transactions: &DataFrame,
    facilities: &DataFrame,
) -> Result<DataFrame> {
    let transactions = text_key(transactions, IRIS_VAR, Some(IRIS_CODE_WIDTH))?;
    let facilities = text_key(facilities, IRIS_VAR, Some(IRIS_CODE_WIDTH))?;
    let joined = left_join(&transactions, &facilities, &[IRIS_VAR], &[IRIS_VAR], "_bpe")?;

    let fills: Vec<Expr> = FACILITY_GROUPS
        .iter()
        .filter(|(_, name)| has_column(&joined, name))
        .map(|(_, name)| {
            when(col(IRIS_VAR).is_not_null())
                .then(col(*name).fill_null(lit(0.0)))
                .otherwise(col(*name))
                .alias(*name)
        })
        .collect();
    Ok(joined.lazy().with_columns(fills).collect()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::utils::haversine_m;

    #[test]
    fn test_parse_geo_point() {
        assert_eq!(parse_geo_point("48.85, 2.35"), Some((48.85, 2.35)));
        assert_eq!(parse_geo_point("48.85;2.35"), None);
        assert_eq!(parse_geo_point("148.0, 2.0"), None);
    }

    #[test]
    fn test_nearest_distance_matches_haversine() {
        let stations = [(48.8443, 2.3744), (48.8809, 2.3553), (45.7605, 4.8595)];
        let index = SpatialIndex::from_points(&stations);
        let home = (48.8530, 2.3499);
        let expected = stations
            .iter()
            .map(|s| haversine_m(home, *s))
            .fold(f64::INFINITY, f64::min);
        let got = index.nearest_distance_m(home.0, home.1).unwrap();
        assert!((got - expected).abs() < 0.5);
        assert!(SpatialIndex::from_points(&[]).nearest_distance_m(0.0, 0.0).is_none());
    }

    #[test]
    fn test_distance_layer() {
        let transactions = df!(
            "id_mutation" => &["a", "b"],
            "latitude" => &[Some(48.8443), None],
            "longitude" => &[Some(2.3744), Some(2.0)]
        )
        .unwrap();
        let stations = df!("Geo Point" => &["48.8443, 2.3744", "not a point"]).unwrap();
        let layer = add_distance_to_transportation(&transactions, &stations).unwrap();
        let d = f64_values(&layer, TRANSPORT_DISTANCE_VAR).unwrap();
        assert!(d[0].unwrap() < 1e-3);
        assert_eq!(d[1], None);
    }

    #[test]
    fn test_aggregate_and_join_facilities() {
        let bpe = df!(
            "DCIRIS" => &["751010101", "751010101", "751010101", "2A0040000", "75101_IND"],
            "TYPEQU" => &["B203", "B102", "C101", "D201", "B203"]
        )
        .unwrap();
        let facilities = aggregate_facilities(&bpe).unwrap();
        assert_eq!(facilities.height(), 1);
        assert_eq!(f64_values(&facilities, "nb_commerces").unwrap(), vec![Some(2.0)]);
        assert_eq!(f64_values(&facilities, "nb_enseignement").unwrap(), vec![Some(1.0)]);

        let transactions = df!(
            "code_iris" => &[Some("751010101"), Some("751010102"), None]
        )
        .unwrap();
        let joined = add_public_facilities(&transactions, &facilities).unwrap();
        assert_eq!(
            f64_values(&joined, "nb_commerces").unwrap(),
            vec![Some(2.0), Some(0.0), None]
        );
    }

    #[test]
    fn test_numeric_iris_codes_keep_leading_zero() {
        // Ain (01) codes lose their leading zero when read as numbers
        let bpe = df!(
            "DCIRIS" => &[10530101i64, 10530101],
            "TYPEQU" => &["D201", "F101"]
        )
        .unwrap();
        let facilities = aggregate_facilities(&bpe).unwrap();
        assert_eq!(
            text_values(&facilities, IRIS_VAR).unwrap(),
            vec![Some("010530101".to_string())]
        );

        let transactions = df!(
            "id_mutation" => &["a", "b"],
            "code_iris" => &[10530101.0, 10530102.0]
        )
        .unwrap();
        let joined = add_public_facilities(&transactions, &facilities).unwrap();
        assert_eq!(f64_values(&joined, "nb_sante").unwrap(), vec![Some(1.0), Some(0.0)]);
        assert_eq!(
            f64_values(&joined, "nb_sport_loisirs").unwrap(),
            vec![Some(1.0), Some(0.0)]
        );
        assert_eq!(
            text_values(&joined, IRIS_VAR).unwrap()[0].as_deref(),
            Some("010530101")
        );
    }
}
