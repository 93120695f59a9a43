//! User-defined filter pipelines: loading and per-alert evaluation.
//!
//! Filters are stored aggregation pipelines. Only the newest template per
//! science program is active; the configured upstream pipeline (select the
//! current alert, drop cutouts, join aux data) is prepended at load time,
//! so stage 0 is always a `$match` whose `candid` is rebound per alert.

use crate::catalog::CatalogGateway;
use anyhow::{Context, Result};
use mongodb::bson::{doc, Bson, Document};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FilterTemplate {
    pub id: Bson,
    pub science_program_id: Bson,
    pub pipeline: Vec<Document>,
}

/// Convert the configured upstream pipeline stages from JSON.
pub fn upstream_pipeline(stages: &[serde_json::Value]) -> Result<Vec<Document>> {
    stages
        .iter()
        .map(|stage| {
            mongodb::bson::to_document(stage).context("upstream pipeline stage is not an object")
        })
        .collect()
}

/// Load the active filter templates: the newest per `science_program_id`
/// for the given alert catalog, upstream pipeline prepended.
pub async fn load_filter_templates(
    gateway: &CatalogGateway,
    collection_filters: &str,
    catalog: &str,
    upstream: &[Document],
) -> Result<Vec<FilterTemplate>> {
    let stored = gateway
        .find(collection_filters, doc! { "catalog": catalog }, Document::new())
        .await
        .context("failed to load filter templates")?;
    Ok(build_templates(stored, upstream))
}

/// Pick the newest template per science program and prepend the upstream
/// pipeline to each.
fn build_templates(stored: Vec<Document>, upstream: &[Document]) -> Vec<FilterTemplate> {
    // newest template wins per science program
    let mut latest: HashMap<String, (f64, Document)> = HashMap::new();
    for template in stored {
        let Some(program) = template.get("science_program_id") else {
            continue;
        };
        let program_key = program.to_string();
        let created = template.get("created").map(created_sort_key).unwrap_or(0.0);
        match latest.get(&program_key) {
            Some((newest, _)) if *newest >= created => {}
            _ => {
                latest.insert(program_key, (created, template));
            }
        }
    }

    let mut templates = Vec::new();
    for (_, (_, template)) in latest {
        let id = template.get("_id").cloned().unwrap_or(Bson::Null);
        let science_program_id = template
            .get("science_program_id")
            .cloned()
            .unwrap_or(Bson::Null);
        let pipeline = match parse_pipeline(template.get("pipeline")) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                tracing::warn!(filter = %id, error = %err, "skipping filter with a bad pipeline");
                continue;
            }
        };

        let mut combined = upstream.to_vec();
        combined.extend(pipeline);
        if combined.first().map(|s| s.contains_key("$match")) != Some(true) {
            tracing::warn!(filter = %id, "skipping filter whose first stage is not a $match");
            continue;
        }

        templates.push(FilterTemplate {
            id,
            science_program_id,
            pipeline: combined,
        });
    }
    templates.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));
    templates
}

fn created_sort_key(created: &Bson) -> f64 {
    match created {
        Bson::DateTime(dt) => dt.timestamp_millis() as f64,
        Bson::Double(v) => *v,
        Bson::Int32(v) => *v as f64,
        Bson::Int64(v) => *v as f64,
        _ => 0.0,
    }
}

fn parse_pipeline(pipeline: Option<&Bson>) -> Result<Vec<Document>> {
    match pipeline {
        // stored as a serialized JSON string, parsed at load time
        Some(Bson::String(raw)) => {
            let stages: Vec<serde_json::Value> =
                serde_json::from_str(raw).context("pipeline string is not a JSON array")?;
            stages
                .iter()
                .map(|stage| {
                    mongodb::bson::to_document(stage).context("pipeline stage is not an object")
                })
                .collect()
        }
        Some(Bson::Array(stages)) => stages
            .iter()
            .map(|stage| {
                stage
                    .as_document()
                    .cloned()
                    .context("pipeline stage is not a document")
            })
            .collect(),
        _ => anyhow::bail!("filter template has no pipeline"),
    }
}

/// Bind a template's first `$match` stage to one alert.
fn bind_candid(template: &FilterTemplate, candid: i64) -> Vec<Document> {
    let mut pipeline = template.pipeline.clone();
    if let Some(stage) = pipeline.first_mut() {
        if let Ok(matcher) = stage.get_document_mut("$match") {
            matcher.insert("candid", candid);
        }
    }
    pipeline
}

/// Run every active filter against a just-ingested alert. Returns the first
/// aggregation result per passing filter, keyed by filter id. Per-filter
/// failure (timeout, execution error) is logged and isolated.
pub async fn evaluate(
    gateway: &CatalogGateway,
    collection_alerts: &str,
    templates: &[FilterTemplate],
    candid: i64,
    time_budget: Duration,
) -> HashMap<String, Document> {
    let mut passed = HashMap::new();
    for template in templates {
        let pipeline = bind_candid(template, candid);
        match gateway
            .aggregate(collection_alerts, pipeline, time_budget)
            .await
        {
            Ok(results) => {
                if let Some(first) = results.into_iter().next() {
                    tracing::info!(candid, filter = %template.id, "alert passed filter");
                    passed.insert(template.id.to_string(), first);
                }
            }
            Err(err) => {
                tracing::warn!(candid, filter = %template.id, error = %err, "filter execution failed");
            }
        }
    }
    passed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(pipeline: Vec<Document>) -> FilterTemplate {
        FilterTemplate {
            id: Bson::String("filter-1".to_string()),
            science_program_id: Bson::Int32(1),
            pipeline,
        }
    }

    #[test]
    fn bind_candid_overwrites_the_first_match_stage() {
        let template = template(vec![
            doc! { "$match": { "candid": 0i64, "candidate.rb": { "$gt": 0.5 } } },
            doc! { "$project": { "objectId": 1 } },
        ]);
        let bound = bind_candid(&template, 1001);
        let matcher = bound[0].get_document("$match").unwrap();
        assert_eq!(matcher.get_i64("candid").unwrap(), 1001);
        // the rest of the stage and pipeline are untouched
        assert!(matcher.contains_key("candidate.rb"));
        assert_eq!(bound.len(), 2);
    }

    #[test]
    fn parse_pipeline_accepts_serialized_stages() {
        let raw = Bson::String(r#"[{"$match": {"candidate.rb": {"$gt": 0.5}}}]"#.to_string());
        let stages = parse_pipeline(Some(&raw)).unwrap();
        assert_eq!(stages.len(), 1);
        assert!(stages[0].contains_key("$match"));
    }

    #[test]
    fn parse_pipeline_rejects_missing_pipeline() {
        assert!(parse_pipeline(None).is_err());
        assert!(parse_pipeline(Some(&Bson::Int32(7))).is_err());
    }

    #[test]
    fn build_templates_keeps_only_the_newest_per_science_program() {
        let upstream = vec![doc! { "$match": { "candid": 0i64 } }];
        let stored = vec![
            doc! {
                "_id": "old", "catalog": "ZTF_alerts", "science_program_id": 1,
                "created": 1.0,
                "pipeline": r#"[{"$project": {"objectId": 1}}]"#,
            },
            doc! {
                "_id": "new", "catalog": "ZTF_alerts", "science_program_id": 1,
                "created": 2.0,
                "pipeline": r#"[{"$project": {"candid": 1}}]"#,
            },
            doc! {
                "_id": "other", "catalog": "ZTF_alerts", "science_program_id": 2,
                "created": 1.0,
                "pipeline": r#"[{"$project": {"candid": 1}}]"#,
            },
        ];
        let templates = build_templates(stored, &upstream);
        assert_eq!(templates.len(), 2);
        let ids: Vec<String> = templates.iter().map(|t| t.id.to_string()).collect();
        assert!(ids.iter().any(|id| id.contains("new")));
        assert!(!ids.iter().any(|id| id.contains("old")));
        // upstream stage is prepended
        assert!(templates[0].pipeline[0].contains_key("$match"));
        assert_eq!(templates[0].pipeline.len(), 2);
    }

    #[test]
    fn build_templates_skips_pipelines_without_a_leading_match() {
        let stored = vec![doc! {
            "_id": "f", "science_program_id": 1, "created": 1.0,
            "pipeline": r#"[{"$project": {"candid": 1}}]"#,
        }];
        // no upstream prefix: stage 0 is a $project, the template is dropped
        assert!(build_templates(stored, &[]).is_empty());
    }

    #[test]
    fn created_sort_key_orders_datetimes_and_numbers() {
        let older = created_sort_key(&Bson::Double(1.0));
        let newer = created_sort_key(&Bson::Double(2.0));
        assert!(newer > older);
        let dt = created_sort_key(&Bson::DateTime(
            mongodb::bson::DateTime::from_millis(1_700_000_000_000),
        ));
        assert!(dt > newer);
    }
}
