//! Per-topic ingestion worker.
//!
//! Owns one broker consumer, decodes every record and runs the full
//! pipeline: dedupe, normalize, score, persist primary, cross-match and
//! persist aux, user filters, optional downstream post. The per-record
//! error boundary is the atomic unit: a failing alert never takes down the
//! worker.

use crate::alert::{self, AlertRecord};
use crate::catalog::CatalogGateway;
use crate::config::Config;
use crate::decode;
use crate::filters::{self, FilterTemplate};
use crate::ml::{self, ModelRegistry};
use crate::skyportal::SkyPortalClient;
use crate::xmatch::{self, XmatchRuntime};
use anyhow::{Context, Result};
use mongodb::bson::{doc, Bson, Document};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Shared consumer-callback state: partition count from the assignment
/// callback, transport-failure count from the error callback.
pub struct WorkerContext {
    topic: String,
    num_partitions: AtomicUsize,
    disconnected_partitions: AtomicUsize,
}

impl WorkerContext {
    fn new(topic: String) -> Self {
        Self {
            topic,
            num_partitions: AtomicUsize::new(0),
            disconnected_partitions: AtomicUsize::new(0),
        }
    }
}

impl ClientContext for WorkerContext {
    fn error(&self, error: KafkaError, reason: &str) {
        if matches!(
            error,
            KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure)
        ) {
            let disconnected = self.disconnected_partitions.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!(topic = %self.topic, disconnected, "disconnected from partition");
        } else {
            tracing::warn!(topic = %self.topic, error = %error, reason, "consumer error callback");
        }
    }
}

impl ConsumerContext for WorkerContext {
    fn post_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(assignment) => {
                self.num_partitions
                    .store(assignment.count(), Ordering::SeqCst);
                // always restart from the beginning of every assigned
                // partition; dedupe makes the replay idempotent
                let mut from_start = TopicPartitionList::with_capacity(assignment.count());
                for partition in assignment.elements() {
                    let _ = from_start.add_partition_offset(
                        partition.topic(),
                        partition.partition(),
                        Offset::Beginning,
                    );
                }
                tracing::info!(topic = %self.topic, partitions = assignment.count(), "partitions assigned");
                if let Err(err) = consumer.seek_partitions(from_start, Duration::from_secs(5)) {
                    tracing::warn!(topic = %self.topic, error = %err, "failed to seek partitions to beginning");
                }
            }
            Rebalance::Revoke(_) => {
                tracing::debug!(topic = %self.topic, "partitions revoked");
            }
            Rebalance::Error(err) => {
                tracing::warn!(topic = %self.topic, error = %err, "rebalance error");
            }
        }
    }
}

pub struct IngestWorker {
    topic: String,
    datestr: String,
    consumer: StreamConsumer<WorkerContext>,
    gateway: CatalogGateway,
    collection_alerts: String,
    collection_alerts_aux: String,
    models: ModelRegistry,
    filter_templates: Vec<FilterTemplate>,
    xmatch_runtime: XmatchRuntime,
    skyportal: Option<SkyPortalClient>,
    path_alerts: PathBuf,
    path_tess: PathBuf,
    save_packets: bool,
    post_only_passed_filters: bool,
    filter_time_budget: Duration,
}

impl IngestWorker {
    pub async fn new(
        topic: &str,
        group_id: &str,
        config: &Config,
        save_packets: bool,
        test: bool,
    ) -> Result<Self> {
        let datestr = datestr_from_topic(topic)
            .with_context(|| format!("topic {topic} has no datestr segment"))?;

        let servers = config.kafka.bootstrap_servers(test)?;
        let consumer: StreamConsumer<WorkerContext> = ClientConfig::new()
            .set("group.id", group_id)
            .set("bootstrap.servers", servers)
            .set("enable.partition.eof", "true")
            .set(
                "auto.offset.reset",
                &config.kafka.default_topic_config.auto_offset_reset,
            )
            .create_with_context(WorkerContext::new(topic.to_string()))
            .context("failed to create broker consumer")?;
        consumer
            .subscribe(&[topic])
            .with_context(|| format!("failed to subscribe to {topic}"))?;

        // a dead store is fatal here; the supervisor will respawn us
        let gateway = CatalogGateway::connect(&config.database).await?;

        if let Some(index_specs) = config.indexes.get(&config.database.collection_alerts) {
            let mut names: Vec<&String> = index_specs.keys().collect();
            names.sort();
            for name in names {
                gateway
                    .create_index(&config.database.collection_alerts, name, &index_specs[name])
                    .await?;
            }
        }

        let models = ModelRegistry::load(
            &config.ml_models,
            &config.path.path_ml_models,
            &ml::unavailable_runtime_loader,
        );

        let upstream_stages = config
            .filters
            .get(&config.database.collection_alerts)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let upstream = filters::upstream_pipeline(upstream_stages)?;
        let filter_templates = filters::load_filter_templates(
            &gateway,
            &config.database.collection_filters,
            &config.database.collection_alerts,
            &upstream,
        )
        .await?;
        tracing::info!(topic, filters = filter_templates.len(), "loaded filter templates");

        let skyportal = match (&config.skyportal, config.misc.post_to_skyportal) {
            (Some(skyportal_config), true) => Some(SkyPortalClient::new(skyportal_config)?),
            _ => None,
        };

        Ok(Self {
            topic: topic.to_string(),
            datestr,
            consumer,
            gateway,
            collection_alerts: config.database.collection_alerts.clone(),
            collection_alerts_aux: config.database.collection_alerts_aux.clone(),
            models,
            filter_templates,
            xmatch_runtime: XmatchRuntime::from_config(&config.xmatch)?,
            skyportal,
            path_alerts: config.path.path_alerts.clone(),
            path_tess: config.path.path_tess.clone(),
            save_packets,
            post_only_passed_filters: config.misc.post_only_passed_filters,
            filter_time_budget: config.misc.filter_time_budget(),
        })
    }

    /// Consume until every assigned partition signals end (or disconnect),
    /// then return so the supervisor can restart us with a fresh group id.
    pub async fn run(&self) -> Result<()> {
        let mut eof_partitions: HashSet<i32> = HashSet::new();
        loop {
            let context = self.consumer.context();
            let assigned = context.num_partitions.load(Ordering::SeqCst);
            if assigned > 0 && context.disconnected_partitions.load(Ordering::SeqCst) >= assigned {
                tracing::warn!(topic = %self.topic, "all partitions disconnected, stopping worker");
                return Ok(());
            }

            match self.consumer.recv().await {
                Ok(message) => {
                    let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                    drop(message);
                    if payload.is_empty() {
                        tracing::debug!(topic = %self.topic, "empty message payload");
                        continue;
                    }
                    match decode::read_records(&payload) {
                        Ok(records) => {
                            for record in records {
                                if let Err(err) = self.process_record(record, &payload).await {
                                    tracing::error!(topic = %self.topic, error = %err, "alert processing failed");
                                }
                            }
                        }
                        Err(err) => {
                            tracing::warn!(topic = %self.topic, error = %err, "failed to decode alert packet");
                        }
                    }
                }
                Err(KafkaError::PartitionEOF(partition)) => {
                    eof_partitions.insert(partition);
                    let assigned = context.num_partitions.load(Ordering::SeqCst);
                    tracing::info!(
                        topic = %self.topic,
                        partition,
                        ended = eof_partitions.len(),
                        assigned,
                        "reached end of partition"
                    );
                    if assigned > 0 && eof_partitions.len() >= assigned {
                        tracing::info!(topic = %self.topic, "all partitions exhausted, stopping worker");
                        return Ok(());
                    }
                }
                Err(err) => {
                    // surface as end-of-partition so the supervisor restarts us
                    tracing::warn!(topic = %self.topic, error = %err, "consumer error, stopping worker");
                    return Ok(());
                }
            }
        }
    }

    async fn process_record(&self, document: Document, raw: &[u8]) -> Result<()> {
        let record = AlertRecord::try_from_document(document)?;
        let candid = record.candid();
        let object_id = record.object_id().to_string();
        tracing::info!(topic = %self.topic, object_id = %object_id, candid, "alert received");

        if self
            .gateway
            .exists(&self.collection_alerts, doc! { "candid": candid })
            .await?
        {
            tracing::debug!(candid, "candid already ingested, skipping");
            return Ok(());
        }

        if self.save_packets {
            let path = save_packet(&self.path_alerts, &self.datestr, candid, raw)?;
            tracing::debug!(candid, path = %path.display(), "saved raw packet");
        }

        let (mut primary, prv_candidates) = alert::normalize(&record)?;
        primary.insert("classifications", self.models.score(&record));

        let is_tess = record
            .programpi()
            .map(|pi| pi.contains("TESS"))
            .unwrap_or(false);
        let tess_doc = (is_tess && self.save_packets).then(|| primary.clone());

        tracing::info!(candid, "ingesting alert into the store");
        match self.gateway.insert(&self.collection_alerts, primary).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(candid, "primary document already present"),
            Err(err) => tracing::warn!(candid, error = %err, "failed to insert primary document"),
        }

        let stripped: Vec<Document> = prv_candidates.iter().map(alert::strip_nulls).collect();
        self.upsert_aux(&record, &object_id, stripped.clone()).await?;

        if let Some(tess_doc) = tess_doc {
            if let Err(err) = self
                .dump_tess_packet(tess_doc, candid, &object_id, &stripped)
                .await
            {
                tracing::warn!(candid, error = %err, "failed to dump TESS packet");
            }
        }

        let passed = filters::evaluate(
            &self.gateway,
            &self.collection_alerts,
            &self.filter_templates,
            candid,
            self.filter_time_budget,
        )
        .await;

        if let Some(skyportal) = &self.skyportal {
            if !self.post_only_passed_filters || !passed.is_empty() {
                skyportal.post_alert(&record, &stripped).await;
            }
        }

        Ok(())
    }

    /// Create the aux document with cross-matches on first sight of an
    /// object; afterwards only append prior candidates through the store's
    /// set semantics.
    async fn upsert_aux(
        &self,
        record: &AlertRecord,
        object_id: &str,
        stripped_prv: Vec<Document>,
    ) -> Result<()> {
        let aux_exists = self
            .gateway
            .exists(&self.collection_alerts_aux, doc! { "_id": object_id })
            .await?;

        if !aux_exists {
            let ra = record.ra()?;
            let dec = record.dec()?;
            let mut cross_matches =
                xmatch::xmatch_catalogs(&self.gateway, &self.xmatch_runtime, ra, dec).await;
            for (catalog, matches) in
                xmatch::xmatch_clu(&self.gateway, &self.xmatch_runtime, ra, dec).await
            {
                cross_matches.insert(catalog, matches);
            }

            let aux = doc! {
                "_id": object_id,
                "cross_matches": cross_matches,
                "prv_candidates": stripped_prv.clone(),
            };
            match self.gateway.insert(&self.collection_alerts_aux, aux).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    // another worker created it first; converge via the set append
                }
                Err(err) => {
                    tracing::warn!(object_id, error = %err, "failed to insert aux document");
                    return Ok(());
                }
            }
        }

        self.gateway
            .upsert_append(
                &self.collection_alerts_aux,
                Bson::String(object_id.to_string()),
                "prv_candidates",
                stripped_prv,
            )
            .await
    }

    async fn dump_tess_packet(
        &self,
        primary: Document,
        candid: i64,
        object_id: &str,
        stripped_prv: &[Document],
    ) -> Result<()> {
        let aux = self
            .gateway
            .find_one(
                &self.collection_alerts_aux,
                doc! { "_id": object_id },
                doc! { "cross_matches": 1 },
            )
            .await?;
        let cross_matches = aux
            .and_then(|doc| doc.get_document("cross_matches").ok().cloned())
            .unwrap_or_default();

        let enriched = enrich_for_tess(
            primary,
            stripped_prv,
            cross_matches,
            &self.xmatch_runtime.clu_catalog,
        );
        let path = write_tess_json(&self.path_tess, &self.datestr, candid, &enriched)?;
        tracing::debug!(candid, path = %path.display(), "saved TESS packet");
        Ok(())
    }
}

pub fn datestr_from_topic(topic: &str) -> Option<String> {
    topic.split('_').nth(1).map(str::to_string)
}

/// Persist the raw message bytes under `<path_alerts>/<datestr>/<candid>.avro`.
pub fn save_packet(path_alerts: &Path, datestr: &str, candid: i64, raw: &[u8]) -> Result<PathBuf> {
    let dir = path_alerts.join(datestr);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{candid}.avro"));
    std::fs::write(&path, raw).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Re-attach prior candidates and cross-matches (minus the galaxy catalog)
/// to the primary document for the TESS program dump.
fn enrich_for_tess(
    mut primary: Document,
    stripped_prv: &[Document],
    mut cross_matches: Document,
    clu_catalog: &str,
) -> Document {
    cross_matches.remove(clu_catalog);
    primary.insert("prv_candidates", stripped_prv.to_vec());
    primary.insert("cross_matches", cross_matches);
    primary
}

/// Write the enriched alert as JSON under `<path_tess>/<datestr>/<candid>.json`.
pub fn write_tess_json(
    path_tess: &Path,
    datestr: &str,
    candid: i64,
    enriched: &Document,
) -> Result<PathBuf> {
    let dir = path_tess.join(datestr);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{candid}.json"));
    let json = Bson::Document(enriched.clone()).into_relaxed_extjson();
    std::fs::write(&path, serde_json::to_string(&json)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode;
    use tempfile::TempDir;

    #[test]
    fn datestr_comes_from_the_second_topic_segment() {
        assert_eq!(
            datestr_from_topic("ztf_20200101_programid1").as_deref(),
            Some("20200101")
        );
        assert_eq!(datestr_from_topic("badtopic"), None);
    }

    #[test]
    fn saved_packet_round_trips_to_the_same_candid() {
        let dir = TempDir::new().unwrap();
        let message = decode::tests::sample_message(1001, "ZTF01", 10.0, 20.0);
        let path = save_packet(dir.path(), "20200101", 1001, &message).unwrap();

        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "1001.avro");
        let bytes = std::fs::read(&path).unwrap();
        let records = decode::read_records(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get_i64("candid").unwrap(), 1001);
    }

    #[test]
    fn tess_enrichment_drops_the_galaxy_catalog() {
        let primary = doc! { "candid": 2000i64, "objectId": "ZTF02" };
        let prv = vec![doc! { "candid": 1999i64 }];
        let cross_matches = doc! {
            "CLU_20190625": [ { "name": "PGC2557" } ],
            "PS1_DR1": [ { "_id": 1 } ],
        };
        let enriched = enrich_for_tess(primary, &prv, cross_matches, "CLU_20190625");

        let matches = enriched.get_document("cross_matches").unwrap();
        assert!(!matches.contains_key("CLU_20190625"));
        assert!(matches.contains_key("PS1_DR1"));
        assert_eq!(enriched.get_array("prv_candidates").unwrap().len(), 1);
    }

    #[test]
    fn tess_json_lands_under_the_datestr_directory() {
        let dir = TempDir::new().unwrap();
        let enriched = doc! { "candid": 2000i64, "objectId": "ZTF02", "cross_matches": {} };
        let path = write_tess_json(dir.path(), "20200101", 2000, &enriched).unwrap();

        assert!(path.ends_with("20200101/2000.json"));
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["objectId"], "ZTF02");
    }
}
