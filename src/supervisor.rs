//! Topic watchdog: discovers nightly topics, keeps one worker per live
//! topic and reaps dead workers so the next pass can respawn them.

use crate::config::Config;
use crate::worker::IngestWorker;
use anyhow::{Context, Result};
use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness snapshot shared with the ops API.
pub type StatusBoard = Arc<RwLock<HashMap<String, bool>>>;

pub fn new_status_board() -> StatusBoard {
    Arc::new(RwLock::new(HashMap::new()))
}

pub struct Supervisor {
    config: Arc<Config>,
    topics_on_watch: HashMap<String, JoinHandle<()>>,
    status: StatusBoard,
    obs_date: Option<String>,
    save_packets: bool,
    test: bool,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        status: StatusBoard,
        obs_date: Option<String>,
        save_packets: bool,
        test: bool,
    ) -> Self {
        Self {
            config,
            topics_on_watch: HashMap::new(),
            status,
            obs_date,
            save_packets,
            test,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            if let Err(err) = self.watch_once().await {
                tracing::error!(error = %err, "supervisor pass failed");
            }
            self.publish_status().await;

            if self.test {
                // let the workers drain the test stream, then stop everything
                tokio::time::sleep(self.config.misc.test_drain()).await;
                for (topic, handle) in self.topics_on_watch.drain() {
                    tracing::info!(topic = %topic, "stopping worker");
                    handle.abort();
                }
                self.publish_status().await;
                return Ok(());
            }
            tokio::time::sleep(self.config.misc.supervisor_interval()).await;
        }
    }

    async fn watch_once(&mut self) -> Result<()> {
        let servers = self
            .config
            .kafka
            .bootstrap_servers(self.test)?
            .to_string();
        let topics = tokio::task::spawn_blocking(move || list_topics(&servers))
            .await
            .context("topic listing task panicked")??;

        let datestr = self
            .obs_date
            .clone()
            .unwrap_or_else(|| Utc::now().format("%Y%m%d").to_string());
        let tonight = select_topics(&topics, &datestr, &self.config.kafka.topic_blocklist);
        tracing::info!(topics = ?tonight, datestr = %datestr, "nightly topics");

        for topic in tonight {
            if let Some(handle) = self.topics_on_watch.get(&topic) {
                tracing::debug!(topic = %topic, "performing worker health check");
                if handle.is_finished() {
                    tracing::warn!(topic = %topic, "worker died, removing");
                    self.topics_on_watch.remove(&topic);
                }
                continue;
            }

            tracing::info!(topic = %topic, "starting worker");
            let group_id = unique_group_id(&self.config.kafka.group);
            let config = self.config.clone();
            let save_packets = self.save_packets;
            let test = self.test;
            let worker_topic = topic.clone();
            let handle = tokio::spawn(async move {
                match IngestWorker::new(&worker_topic, &group_id, &config, save_packets, test).await
                {
                    Ok(worker) => {
                        if let Err(err) = worker.run().await {
                            tracing::error!(topic = %worker_topic, error = %err, "worker exited with error");
                        }
                    }
                    Err(err) => {
                        tracing::error!(topic = %worker_topic, error = %err, "failed to start worker");
                    }
                }
            });
            self.topics_on_watch.insert(topic, handle);
        }

        Ok(())
    }

    async fn publish_status(&self) {
        let mut status = self.status.write().await;
        status.clear();
        for (topic, handle) in &self.topics_on_watch {
            status.insert(topic.clone(), !handle.is_finished());
        }
    }
}

fn list_topics(servers: &str) -> Result<Vec<String>> {
    let consumer: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", servers)
        .set("group.id", "alert-ingester-metadata")
        .create()
        .context("failed to create metadata client")?;
    let metadata = consumer
        .fetch_metadata(None, METADATA_TIMEOUT)
        .context("failed to fetch broker metadata")?;
    Ok(metadata
        .topics()
        .iter()
        .map(|topic| topic.name().to_string())
        .collect())
}

/// Tonight's ingestible topics: named for the observing date, program
/// scoped, not on the blocklist.
fn select_topics(topics: &[String], datestr: &str, blocklist: &[String]) -> Vec<String> {
    let mut tonight: Vec<String> = topics
        .iter()
        .filter(|topic| topic.contains(datestr))
        .filter(|topic| topic.contains("programid"))
        .filter(|topic| !blocklist.iter().any(|blocked| topic.contains(blocked)))
        .cloned()
        .collect();
    tonight.sort();
    tonight
}

/// Group ids are never reused so a restarted worker starts from the
/// beginning instead of resuming committed offsets.
fn unique_group_id(base: &str) -> String {
    format!("{}_{}", base, Utc::now().format("%Y-%m-%d_%H:%M:%S%.6f"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_topics_matches_datestr_and_program() {
        let topics = vec![
            "ztf_20200101_programid1".to_string(),
            "ztf_20200101_programid2".to_string(),
            "ztf_20191231_programid1".to_string(),
            "ztf_20200101_zuds_programid1".to_string(),
            "unrelated".to_string(),
        ];
        let tonight = select_topics(&topics, "20200101", &["zuds".to_string()]);
        assert_eq!(
            tonight,
            vec![
                "ztf_20200101_programid1".to_string(),
                "ztf_20200101_programid2".to_string(),
            ]
        );
    }

    #[test]
    fn select_topics_without_blocklist_keeps_everything() {
        let topics = vec!["ztf_20200101_zuds_programid1".to_string()];
        assert_eq!(select_topics(&topics, "20200101", &[]).len(), 1);
    }

    #[test]
    fn unique_group_ids_embed_the_base_and_differ() {
        let a = unique_group_id("alert-ingester");
        std::thread::sleep(Duration::from_millis(2));
        let b = unique_group_id("alert-ingester");
        assert!(a.starts_with("alert-ingester_"));
        assert_ne!(a, b);
    }
}
