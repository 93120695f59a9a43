//! Downstream follow-up portal poster.
//!
//! Per alert: one thin metadata record, one merged photometry time series
//! and three thumbnails. Delivery is at-least-once; individual failures are
//! logged and never roll back ingestion.

use crate::alert::{bson_f64, AlertRecord, CutoutKind};
use crate::config::SkyportalConfig;
use crate::cutouts;
use anyhow::{bail, Context, Result};
use mongodb::bson::Document;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
/// Survey convention for a missing magnitude.
const NULL_MAGNITUDE: f64 = 99.0;

#[derive(Clone)]
pub struct SkyPortalClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    endpoint_sources: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Photometry {
    pub source_id: String,
    pub time_format: &'static str,
    pub time_scale: &'static str,
    pub instrument_id: i32,
    pub observed_at: Vec<f64>,
    pub mag: Vec<f64>,
    pub e_mag: Vec<f64>,
    pub lim_mag: Vec<f64>,
    pub filter: Vec<String>,
}

impl SkyPortalClient {
    pub fn new(config: &SkyportalConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build follow-up portal client")?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            token: config.token.clone(),
            endpoint_sources: config.endpoint_sources.clone(),
        })
    }

    /// Post metadata, photometry and thumbnails for one alert. Each request
    /// failure is logged; none aborts the others.
    pub async fn post_alert(&self, record: &AlertRecord, prv_candidates: &[Document]) {
        let candid = record.candid();
        if let Err(err) = self.post_metadata(record).await {
            tracing::warn!(candid, error = %err, "failed to post metadata");
        } else {
            tracing::info!(candid, "posted metadata to follow-up portal");
        }

        match make_photometry(record, prv_candidates) {
            Ok(photometry) => {
                if let Err(err) = self.post("/api/photometry", &json!(photometry)).await {
                    tracing::warn!(candid, error = %err, "failed to post photometry");
                } else {
                    tracing::info!(candid, "posted photometry to follow-up portal");
                }
            }
            Err(err) => tracing::warn!(candid, error = %err, "failed to build photometry"),
        }

        for kind in CutoutKind::ALL {
            if let Err(err) = self.post_thumbnail(record, kind).await {
                tracing::warn!(candid, cutout = kind.field_name(), error = %err, "failed to post thumbnail");
            } else {
                tracing::info!(candid, cutout = kind.field_name(), "posted thumbnail to follow-up portal");
            }
        }
    }

    async fn post_metadata(&self, record: &AlertRecord) -> Result<()> {
        let body = json!({
            "id": record.object_id(),
            "ra": record.ra()?,
            "dec": record.dec()?,
            "score": record.quality_score(),
        });
        self.post(&self.endpoint_sources, &body).await
    }

    async fn post_thumbnail(&self, record: &AlertRecord, kind: CutoutKind) -> Result<()> {
        let gzipped = record.cutout(kind)?;
        let data =
            cutouts::render_thumbnail_base64(gzipped, kind == CutoutKind::Difference)?;
        let body = json!({
            "source_id": record.object_id(),
            "data": data,
            "ttype": kind.thumbnail_type(),
        });
        self.post("/api/thumbnail", &body).await
    }

    async fn post(&self, endpoint: &str, body: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .header("Authorization", format!("token {}", self.token))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            bail!("portal returned {status} for {endpoint}");
        }
        Ok(())
    }
}

/// Merge the current candidate with the prior observations into one time
/// series: de-duplicated by Julian date (first occurrence wins), sorted
/// ascending, missing magnitudes filled with the survey null sentinel.
pub fn make_photometry(record: &AlertRecord, prv_candidates: &[Document]) -> Result<Photometry> {
    let mut rows: Vec<(f64, f64, f64, f64, String)> = Vec::new();
    let mut seen_jd: Vec<u64> = Vec::new();

    let candidate = record.candidate()?;
    for detection in std::iter::once(candidate).chain(prv_candidates.iter()) {
        let Some(jd) = detection.get("jd").and_then(bson_f64) else {
            continue;
        };
        if seen_jd.contains(&jd.to_bits()) {
            continue;
        }
        seen_jd.push(jd.to_bits());

        let fid = detection
            .get("fid")
            .and_then(crate::alert::bson_i64)
            .context("detection has no fid")?;
        let filter = filter_name(fid)?;
        let mag = detection
            .get("magpsf")
            .and_then(bson_f64)
            .unwrap_or(NULL_MAGNITUDE);
        let e_mag = detection
            .get("sigmapsf")
            .and_then(bson_f64)
            .unwrap_or(NULL_MAGNITUDE);
        let lim_mag = detection
            .get("diffmaglim")
            .and_then(bson_f64)
            .unwrap_or(NULL_MAGNITUDE);
        rows.push((jd, mag, e_mag, lim_mag, filter.to_string()));
    }

    rows.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut photometry = Photometry {
        source_id: record.object_id().to_string(),
        time_format: "jd",
        time_scale: "utc",
        instrument_id: 1,
        observed_at: Vec::with_capacity(rows.len()),
        mag: Vec::with_capacity(rows.len()),
        e_mag: Vec::with_capacity(rows.len()),
        lim_mag: Vec::with_capacity(rows.len()),
        filter: Vec::with_capacity(rows.len()),
    };
    for (jd, mag, e_mag, lim_mag, filter) in rows {
        photometry.observed_at.push(jd);
        photometry.mag.push(mag);
        photometry.e_mag.push(e_mag);
        photometry.lim_mag.push(lim_mag);
        photometry.filter.push(filter);
    }
    Ok(photometry)
}

fn filter_name(fid: i64) -> Result<&'static str> {
    match fid {
        1 => Ok("g"),
        2 => Ok("r"),
        3 => Ok("i"),
        other => bail!("unknown filter id {other}"),
    }
}
