//! Positional cross-matching against reference catalogs.

use crate::alert::bson_f64;
use crate::catalog::CatalogGateway;
use crate::config::XmatchConfig;
use anyhow::{Context, Result};
use mongodb::bson::{doc, Bson, Document};

/// Coarse pre-selection radius for the nearby-galaxy match.
const CLU_CONE_RADIUS_RAD: f64 = 3.0 * std::f64::consts::PI / 180.0;

/// Median galaxy shape parameters, substituted for sentinel values.
const MEDIAN_SEMI_MAJOR_DEG: f64 = 0.0265889;
const MEDIAN_AXIS_RATIO: f64 = 0.61;
const MEDIAN_POSITION_ANGLE_DEG: f64 = 86.0;
const SHAPE_SENTINEL: f64 = -990.0;

#[derive(Debug, Clone)]
pub struct CatalogSpec {
    pub name: String,
    pub filter: Document,
    pub projection: Document,
}

/// Cross-match settings resolved once at startup and immutable afterwards.
#[derive(Debug, Clone)]
pub struct XmatchRuntime {
    pub radius_rad: f64,
    pub catalogs: Vec<CatalogSpec>,
    pub clu_catalog: String,
    pub size_margin: f64,
}

impl XmatchRuntime {
    pub fn from_config(config: &XmatchConfig) -> Result<Self> {
        let radius_rad = config.cone_search_radius_radians()?;
        let mut catalogs = Vec::new();
        for (name, spec) in &config.catalogs {
            catalogs.push(CatalogSpec {
                name: name.clone(),
                filter: json_to_document(&spec.filter)
                    .with_context(|| format!("bad filter for xmatch catalog {name}"))?,
                projection: json_to_document(&spec.projection)
                    .with_context(|| format!("bad projection for xmatch catalog {name}"))?,
            });
        }
        catalogs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self {
            radius_rad,
            catalogs,
            clu_catalog: config.clu.catalog.clone(),
            size_margin: config.clu.size_margin,
        })
    }
}

fn json_to_document(value: &serde_json::Value) -> Result<Document> {
    if value.is_null() {
        return Ok(Document::new());
    }
    mongodb::bson::to_document(value).context("expected a JSON object")
}

fn cone_query(ra_geojson: f64, dec: f64, radius_rad: f64) -> Document {
    doc! {
        "coordinates.radec_geojson": {
            "$geoWithin": { "$centerSphere": [[ra_geojson, dec], radius_rad] }
        }
    }
}

/// Point-radius cross-match against every configured catalog. A failure is
/// logged and yields an empty map; the alert is still ingested without
/// cross-matches.
pub async fn xmatch_catalogs(
    gateway: &CatalogGateway,
    runtime: &XmatchRuntime,
    ra: f64,
    dec: f64,
) -> Document {
    match xmatch_catalogs_inner(gateway, runtime, ra, dec).await {
        Ok(matches) => matches,
        Err(err) => {
            tracing::error!(error = %err, "catalog cross-match failed");
            Document::new()
        }
    }
}

async fn xmatch_catalogs_inner(
    gateway: &CatalogGateway,
    runtime: &XmatchRuntime,
    ra: f64,
    dec: f64,
) -> Result<Document> {
    let ra_geojson = ra - 180.0;
    let mut matches = Document::new();
    for catalog in &runtime.catalogs {
        let mut query = cone_query(ra_geojson, dec, runtime.radius_rad);
        for (key, value) in &catalog.filter {
            query.insert(key.clone(), value.clone());
        }
        let records = gateway
            .find(&catalog.name, query, catalog.projection.clone())
            .await?;
        matches.insert(
            catalog.name.clone(),
            Bson::Array(records.into_iter().map(Bson::Document).collect()),
        );
    }
    Ok(matches)
}

/// Elliptical match against the nearby-galaxy catalog. A failure is logged
/// and yields an empty map.
pub async fn xmatch_clu(
    gateway: &CatalogGateway,
    runtime: &XmatchRuntime,
    ra: f64,
    dec: f64,
) -> Document {
    match xmatch_clu_inner(gateway, runtime, ra, dec).await {
        Ok(matches) => matches,
        Err(err) => {
            tracing::error!(error = %err, catalog = %runtime.clu_catalog, "galaxy cross-match failed");
            Document::new()
        }
    }
}

async fn xmatch_clu_inner(
    gateway: &CatalogGateway,
    runtime: &XmatchRuntime,
    ra: f64,
    dec: f64,
) -> Result<Document> {
    let projection = doc! {
        "_id": 1, "name": 1, "ra": 1, "dec": 1,
        "a": 1, "b2a": 1, "pa": 1, "z": 1,
        "sfr_fuv": 1, "mstar": 1, "sfr_ha": 1,
        "coordinates.radec_str": 1,
    };
    let mut galaxies = gateway
        .find(
            &runtime.clu_catalog,
            cone_query(ra - 180.0, dec, CLU_CONE_RADIUS_RAD),
            projection,
        )
        .await?;
    // M31 and M33 subtend degrees on the sky; the coarse cone projection of
    // the catalog misses them, so they are always checked
    galaxies.push(m31());
    galaxies.push(m33());

    let matches = elliptical_matches(galaxies, ra, dec, runtime.size_margin);
    Ok(doc! {
        &runtime.clu_catalog: Bson::Array(matches.into_iter().map(Bson::Document).collect()),
    })
}

fn m31() -> Document {
    doc! {
        "_id": 596900, "name": "PGC2557",
        "ra": 10.6847, "dec": 41.26901,
        "a": 6.35156, "b2a": 0.32, "pa": 35.0,
        "sfr_fuv": Bson::Null, "mstar": 253816876.412914, "sfr_ha": 0,
        "coordinates": { "radec_str": ["00:42:44.3503", "41:16:08.634"] },
    }
}

fn m33() -> Document {
    doc! {
        "_id": 597543, "name": "PGC5818",
        "ra": 23.46204, "dec": 30.66022,
        "a": 2.35983, "b2a": 0.59, "pa": 23.0,
        "sfr_fuv": Bson::Null, "mstar": 4502777.420493, "sfr_ha": 0,
        "coordinates": { "radec_str": ["01:33:50.8900", "30:39:36.800"] },
    }
}

/// Point-in-ellipse test for every candidate galaxy, annotating positive
/// matches with the great-circle distance in arcseconds.
fn elliptical_matches(
    galaxies: Vec<Document>,
    ra: f64,
    dec: f64,
    size_margin: f64,
) -> Vec<Document> {
    let mut matches = Vec::new();
    for mut galaxy in galaxies {
        let Some(galaxy_ra) = galaxy.get("ra").and_then(bson_f64) else {
            continue;
        };
        let Some(galaxy_dec) = galaxy.get("dec").and_then(bson_f64) else {
            continue;
        };
        let mut semi_major = galaxy
            .get("a")
            .and_then(bson_f64)
            .unwrap_or(f64::NEG_INFINITY);
        let mut axis_ratio = galaxy
            .get("b2a")
            .and_then(bson_f64)
            .unwrap_or(f64::NEG_INFINITY);
        let mut position_angle = galaxy
            .get("pa")
            .and_then(bson_f64)
            .unwrap_or(f64::NEG_INFINITY);

        // no shape information, use the catalog medians
        if semi_major < SHAPE_SENTINEL {
            semi_major = MEDIAN_SEMI_MAJOR_DEG;
        }
        if axis_ratio < SHAPE_SENTINEL {
            axis_ratio = MEDIAN_AXIS_RATIO;
        }
        if position_angle < SHAPE_SENTINEL {
            position_angle = MEDIAN_POSITION_ANGLE_DEG;
        }

        let inside = crate::spatial::in_ellipse(
            ra,
            dec,
            galaxy_ra,
            galaxy_dec,
            size_margin * semi_major,
            axis_ratio,
            position_angle,
        );
        if !inside {
            continue;
        }

        let distance_arcsec =
            (crate::spatial::great_circle_distance(ra, dec, galaxy_ra, galaxy_dec) * 3600.0 * 100.0)
                .round()
                / 100.0;
        if !matches!(galaxy.get("coordinates"), Some(Bson::Document(_))) {
            galaxy.insert("coordinates", Document::new());
        }
        if let Ok(coordinates) = galaxy.get_document_mut("coordinates") {
            coordinates.insert("distance_arcsec", distance_arcsec);
        }
        matches.push(galaxy);
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn galaxy(ra: f64, dec: f64, a: f64, b2a: f64, pa: f64) -> Document {
        doc! { "_id": 1, "name": "test", "ra": ra, "dec": dec, "a": a, "b2a": b2a, "pa": pa }
    }

    #[test]
    fn elliptical_match_annotates_distance() {
        let matches = elliptical_matches(vec![galaxy(10.0, 20.0, 0.1, 0.5, 0.0)], 10.0, 20.01, 3.0);
        assert_eq!(matches.len(), 1);
        let coordinates = matches[0].get_document("coordinates").unwrap();
        let distance = coordinates.get_f64("distance_arcsec").unwrap();
        assert!((distance - 36.0).abs() < 0.5, "distance = {distance}");
    }

    #[test]
    fn elliptical_match_rejects_distant_points() {
        let matches = elliptical_matches(vec![galaxy(10.0, 20.0, 0.1, 0.5, 0.0)], 12.0, 22.0, 3.0);
        assert!(matches.is_empty());
    }

    #[test]
    fn sentinel_shape_values_fall_back_to_medians() {
        // sentinel shape, alert right on top of the galaxy: medians apply
        let matches =
            elliptical_matches(vec![galaxy(10.0, 20.0, -999.0, -999.0, -999.0)], 10.0, 20.0, 3.0);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn size_margin_scales_the_match_region() {
        let target = galaxy(10.0, 20.0, 0.1, 1.0, 0.0);
        // 0.25 deg north of the centre: outside the bare 0.1 deg axis,
        // inside once scaled by 3
        assert!(elliptical_matches(vec![target.clone()], 10.0, 20.25, 3.0).len() == 1);
        assert!(elliptical_matches(vec![target], 10.0, 20.25, 1.0).is_empty());
    }

    #[test]
    fn cone_query_centres_on_geojson_coordinates() {
        let query = cone_query(10.0 - 180.0, 20.0, 1e-5);
        let within = query
            .get_document("coordinates.radec_geojson")
            .unwrap()
            .get_document("$geoWithin")
            .unwrap();
        let sphere = within.get_array("$centerSphere").unwrap();
        let centre = sphere[0].as_array().unwrap();
        assert_eq!(bson_f64(&centre[0]).unwrap(), -170.0);
        assert_eq!(bson_f64(&centre[1]).unwrap(), 20.0);
        // the radius is forwarded in radians untouched
        assert_eq!(bson_f64(&sphere[1]).unwrap(), 1e-5);
    }

    #[test]
    fn runtime_from_config_sorts_catalogs() {
        let config: crate::config::XmatchConfig = serde_json::from_str(
            r#"{
                "cone_search_radius": 2.0,
                "cone_search_unit": "arcsec",
                "catalogs": {
                    "PS1_DR1": { "filter": {}, "projection": {"_id": 1} },
                    "AllWISE": { "filter": {"w1mpro": {"$gt": 0}}, "projection": {"_id": 1} }
                }
            }"#,
        )
        .unwrap();
        let runtime = XmatchRuntime::from_config(&config).unwrap();
        assert_eq!(runtime.catalogs.len(), 2);
        assert_eq!(runtime.catalogs[0].name, "AllWISE");
        assert_eq!(runtime.clu_catalog, "CLU_20190625");
    }
}
