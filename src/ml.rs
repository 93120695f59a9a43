//! ML scoring of alert cutout triplets.
//!
//! The inference runtime is an external collaborator: models bind through
//! the [`InferenceModel`] trait and a loader supplied at startup. A model
//! that fails to load or to score is skipped; the rest keep running.

use crate::alert::{AlertRecord, CutoutKind};
use crate::config::MlModelConfig;
use crate::cutouts;
use anyhow::{bail, Result};
use mongodb::bson::Document;
use ndarray::Array3;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait InferenceModel: Send + Sync {
    /// Score one 63x63x3 triplet, batched as a single example.
    fn predict(&self, triplet: &Array3<f32>) -> Result<f32>;
}

pub type ModelLoader = dyn Fn(&Path) -> Result<Arc<dyn InferenceModel>> + Send + Sync;

struct LoadedModel {
    name: String,
    version: String,
    model: Arc<dyn InferenceModel>,
}

pub struct ModelRegistry {
    models: Vec<LoadedModel>,
}

impl ModelRegistry {
    /// Load every configured model. Per-model failure is logged and that
    /// model omitted.
    pub fn load(
        configs: &HashMap<String, MlModelConfig>,
        models_dir: &Path,
        loader: &ModelLoader,
    ) -> Self {
        let mut models = Vec::new();
        let mut names: Vec<&String> = configs.keys().collect();
        names.sort();
        for name in names {
            let config = &configs[name];
            let path = model_path(models_dir, name, &config.version);
            match loader(&path) {
                Ok(model) => {
                    tracing::info!(model = %name, version = %config.version, "loaded ML model");
                    models.push(LoadedModel {
                        name: name.clone(),
                        version: config.version.clone(),
                        model,
                    });
                }
                Err(err) => {
                    tracing::error!(model = %name, path = %path.display(), error = %err, "failed to load ML model");
                }
            }
        }
        Self { models }
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Score an alert with every loaded model. Returns
    /// `{name: score, name_version: version}` for the models that succeed.
    pub fn score(&self, record: &AlertRecord) -> Document {
        let mut scores = Document::new();
        if self.models.is_empty() {
            return scores;
        }

        let triplet = match triplet_for(record) {
            Ok(triplet) => triplet,
            Err(err) => {
                tracing::warn!(candid = record.candid(), error = %err, "failed to build cutout triplet");
                return scores;
            }
        };

        for loaded in &self.models {
            match loaded.model.predict(&triplet) {
                Ok(score) => {
                    scores.insert(loaded.name.clone(), score as f64);
                    scores.insert(format!("{}_version", loaded.name), loaded.version.clone());
                }
                Err(err) => {
                    tracing::warn!(model = %loaded.name, candid = record.candid(), error = %err, "model inference failed");
                }
            }
        }
        scores
    }
}

fn triplet_for(record: &AlertRecord) -> Result<Array3<f32>> {
    let science = record.cutout(CutoutKind::Science)?;
    let template = record.cutout(CutoutKind::Template)?;
    let difference = record.cutout(CutoutKind::Difference)?;
    cutouts::make_triplet(science, template, difference)
}

fn model_path(models_dir: &Path, name: &str, version: &str) -> PathBuf {
    models_dir.join(format!("{name}_{version}.h5"))
}

/// Default loader for deployments without a linked inference runtime; every
/// configured model is reported unavailable and skipped.
pub fn unavailable_runtime_loader(path: &Path) -> Result<Arc<dyn InferenceModel>> {
    bail!("no inference runtime is linked for {}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cutouts::tests::gzipped_fits;
    use mongodb::bson::doc;

    struct ConstModel(f32);

    impl InferenceModel for ConstModel {
        fn predict(&self, _triplet: &Array3<f32>) -> Result<f32> {
            Ok(self.0)
        }
    }

    struct FailingModel;

    impl InferenceModel for FailingModel {
        fn predict(&self, _triplet: &Array3<f32>) -> Result<f32> {
            bail!("inference backend crashed")
        }
    }

    fn record_with_cutouts() -> AlertRecord {
        let stamp = gzipped_fits(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let cutout = |bytes: &[u8]| {
            doc! { "stampData": mongodb::bson::Binary {
                subtype: mongodb::bson::spec::BinarySubtype::Generic,
                bytes: bytes.to_vec(),
            } }
        };
        let doc = doc! {
            "candid": 42i64,
            "objectId": "ZTF42",
            "candidate": { "ra": 10.0, "dec": 20.0 },
            "cutoutScience": cutout(&stamp),
            "cutoutTemplate": cutout(&stamp),
            "cutoutDifference": cutout(&stamp),
        };
        AlertRecord::try_from_document(doc).unwrap()
    }

    fn registry(models: Vec<(&str, &str, Arc<dyn InferenceModel>)>) -> ModelRegistry {
        ModelRegistry {
            models: models
                .into_iter()
                .map(|(name, version, model)| LoadedModel {
                    name: name.to_string(),
                    version: version.to_string(),
                    model,
                })
                .collect(),
        }
    }

    #[test]
    fn score_records_value_and_version_per_model() {
        let registry = registry(vec![("braai", "d6_m9", Arc::new(ConstModel(0.97)))]);
        let scores = registry.score(&record_with_cutouts());
        assert!((scores.get_f64("braai").unwrap() - 0.97).abs() < 1e-6);
        assert_eq!(scores.get_str("braai_version").unwrap(), "d6_m9");
    }

    #[test]
    fn failing_model_is_omitted_without_affecting_others() {
        let registry = registry(vec![
            ("bad", "v1", Arc::new(FailingModel)),
            ("braai", "d6_m9", Arc::new(ConstModel(0.5))),
        ]);
        let scores = registry.score(&record_with_cutouts());
        assert!(!scores.contains_key("bad"));
        assert!(scores.contains_key("braai"));
    }

    #[test]
    fn missing_cutouts_yield_empty_scores() {
        let registry = registry(vec![("braai", "d6_m9", Arc::new(ConstModel(0.5)))]);
        let record = AlertRecord::try_from_document(doc! {
            "candid": 1i64, "objectId": "ZTF01",
            "candidate": { "ra": 0.0, "dec": 0.0 },
        })
        .unwrap();
        assert!(registry.score(&record).is_empty());
    }

    #[test]
    fn unavailable_loader_skips_all_models() {
        let mut configs = HashMap::new();
        configs.insert(
            "braai".to_string(),
            MlModelConfig {
                version: "d6_m9".to_string(),
            },
        );
        let registry = ModelRegistry::load(
            &configs,
            Path::new("/nonexistent"),
            &unavailable_runtime_loader,
        );
        assert!(registry.is_empty());
    }
}
