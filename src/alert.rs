//! Typed view over a decoded alert document and the normalizer that turns it
//! into a primary document plus separated prior observations.

use crate::spatial;
use anyhow::{Context, Result};
use mongodb::bson::{doc, Bson, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutoutKind {
    Science,
    Template,
    Difference,
}

impl CutoutKind {
    pub const ALL: [CutoutKind; 3] = [
        CutoutKind::Science,
        CutoutKind::Template,
        CutoutKind::Difference,
    ];

    pub fn field_name(self) -> &'static str {
        match self {
            CutoutKind::Science => "cutoutScience",
            CutoutKind::Template => "cutoutTemplate",
            CutoutKind::Difference => "cutoutDifference",
        }
    }

    /// Thumbnail type label the follow-up portal expects.
    pub fn thumbnail_type(self) -> &'static str {
        match self {
            CutoutKind::Science => "new",
            CutoutKind::Template => "ref",
            CutoutKind::Difference => "sub",
        }
    }
}

/// A decoded alert record. The underlying document is dynamic so unknown
/// payload fields survive the round trip into the store; this wrapper only
/// guarantees the identity fields and exposes typed accessors for the rest.
#[derive(Debug, Clone)]
pub struct AlertRecord {
    candid: i64,
    object_id: String,
    doc: Document,
}

impl AlertRecord {
    pub fn try_from_document(doc: Document) -> Result<Self> {
        let candid = bson_i64(doc.get("candid").context("alert record has no candid")?)
            .context("alert candid is not an integer")?;
        let object_id = doc
            .get_str("objectId")
            .context("alert record has no objectId")?
            .to_string();
        Ok(Self {
            candid,
            object_id,
            doc,
        })
    }

    pub fn candid(&self) -> i64 {
        self.candid
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn candidate(&self) -> Result<&Document> {
        self.doc
            .get_document("candidate")
            .context("alert record has no candidate")
    }

    pub fn ra(&self) -> Result<f64> {
        let candidate = self.candidate()?;
        bson_f64(candidate.get("ra").context("candidate has no ra")?)
            .context("candidate ra is not numeric")
    }

    pub fn dec(&self) -> Result<f64> {
        let candidate = self.candidate()?;
        bson_f64(candidate.get("dec").context("candidate has no dec")?)
            .context("candidate dec is not numeric")
    }

    pub fn programpi(&self) -> Option<&str> {
        self.candidate().ok()?.get_str("programpi").ok()
    }

    /// Preferred quality score: deep-learning rb when present, else rb.
    pub fn quality_score(&self) -> Option<f64> {
        let candidate = self.candidate().ok()?;
        candidate
            .get("drb")
            .and_then(bson_f64)
            .or_else(|| candidate.get("rb").and_then(bson_f64))
    }

    pub fn cutout(&self, kind: CutoutKind) -> Result<&[u8]> {
        let cutout = self
            .doc
            .get_document(kind.field_name())
            .with_context(|| format!("alert has no {}", kind.field_name()))?;
        let bytes = cutout
            .get_binary_generic("stampData")
            .with_context(|| format!("{} has no stampData", kind.field_name()))?;
        Ok(bytes)
    }
}

/// Numeric BSON to f64, however the decoder typed it.
pub fn bson_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}

pub fn bson_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        _ => None,
    }
}

/// Build the primary document and split out prior observations.
///
/// The primary document keeps every field of the record, gains derived
/// coordinates and an empty classifications map, and loses `prv_candidates`.
pub fn normalize(record: &AlertRecord) -> Result<(Document, Vec<Document>)> {
    let ra = record.ra()?;
    let dec = record.dec()?;

    let mut primary = record.document().clone();
    primary.insert("classifications", Document::new());

    let (l, b) = spatial::radec_to_galactic(ra, dec);
    primary.insert(
        "coordinates",
        doc! {
            "radec_str": [spatial::deg2hms(ra), spatial::deg2dms(dec)],
            // GeoJSON longitude must live in [-180, 180] for the 2dsphere index
            "radec_geojson": { "type": "Point", "coordinates": [ra - 180.0, dec] },
            "l": l,
            "b": b,
        },
    );

    let prv_candidates = match primary.remove("prv_candidates") {
        Some(Bson::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Bson::Document(doc) => Some(doc),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok((primary, prv_candidates))
}

/// Drop null-valued top-level keys before storage.
pub fn strip_nulls(doc: &Document) -> Document {
    let mut out = Document::new();
    for (key, value) in doc {
        if !matches!(value, Bson::Null) {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_alert(candid: i64, object_id: &str, ra: f64, dec: f64) -> AlertRecord {
        let doc = doc! {
            "candid": candid,
            "objectId": object_id,
            "candidate": {
                "ra": ra,
                "dec": dec,
                "jd": 2458850.5,
                "fid": 1,
                "magpsf": 18.5,
                "sigmapsf": 0.1,
                "diffmaglim": 20.0,
                "rb": 0.9,
                "programpi": "Kulkarni",
            },
            "prv_candidates": [
                { "candid": candid - 1, "jd": 2458849.5, "fid": 2, "magpsf": 18.7, "null_field": Bson::Null },
            ],
        };
        AlertRecord::try_from_document(doc).unwrap()
    }

    #[test]
    fn try_from_document_requires_identity_fields() {
        assert!(AlertRecord::try_from_document(doc! { "objectId": "ZTF01" }).is_err());
        assert!(AlertRecord::try_from_document(doc! { "candid": 1i64 }).is_err());
        let record =
            AlertRecord::try_from_document(doc! { "candid": 7i64, "objectId": "ZTF01" }).unwrap();
        assert_eq!(record.candid(), 7);
        assert_eq!(record.object_id(), "ZTF01");
    }

    #[test]
    fn normalize_derives_geojson_and_galactic_coordinates() {
        let record = sample_alert(1001, "ZTF01", 10.0, 20.0);
        let (primary, _) = normalize(&record).unwrap();

        let coordinates = primary.get_document("coordinates").unwrap();
        let geojson = coordinates.get_document("radec_geojson").unwrap();
        let point = geojson.get_array("coordinates").unwrap();
        assert_eq!(bson_f64(&point[0]).unwrap(), -170.0);
        assert_eq!(bson_f64(&point[1]).unwrap(), 20.0);

        let radec_str = coordinates.get_array("radec_str").unwrap();
        assert_eq!(radec_str[0].as_str().unwrap(), "00:40:00.0000");
        assert_eq!(radec_str[1].as_str().unwrap(), "20:00:00.000");

        assert!(coordinates.get("l").and_then(bson_f64).is_some());
        assert!(coordinates.get("b").and_then(bson_f64).is_some());
    }

    #[test]
    fn normalize_splits_out_prior_candidates() {
        let record = sample_alert(1002, "ZTF01", 10.0, 20.0);
        let (primary, prv) = normalize(&record).unwrap();
        assert!(!primary.contains_key("prv_candidates"));
        assert!(primary.contains_key("classifications"));
        assert_eq!(prv.len(), 1);
        assert_eq!(bson_i64(prv[0].get("candid").unwrap()).unwrap(), 1001);
    }

    #[test]
    fn normalize_fails_on_missing_coordinates() {
        let record =
            AlertRecord::try_from_document(doc! { "candid": 1i64, "objectId": "ZTF01" }).unwrap();
        assert!(normalize(&record).is_err());
    }

    #[test]
    fn strip_nulls_drops_only_null_keys() {
        let stripped = strip_nulls(&doc! { "a": 1, "b": Bson::Null, "c": "x" });
        assert_eq!(stripped.len(), 2);
        assert!(stripped.contains_key("a"));
        assert!(!stripped.contains_key("b"));
    }

    #[test]
    fn quality_score_prefers_drb() {
        let mut record = sample_alert(1, "ZTF01", 10.0, 20.0);
        assert_eq!(record.quality_score(), Some(0.9));
        record
            .doc
            .get_document_mut("candidate")
            .unwrap()
            .insert("drb", 0.99);
        assert_eq!(record.quality_score(), Some(0.99));
    }
}
