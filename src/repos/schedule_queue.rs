//! Wait list of outstanding external-scan handles.
//!
//! Handles queue in a lex-sorted set as `"<unix_seconds>:<handle>"`, which
//! makes "everything scheduled before T" a single range drain. Each
//! handle's payload lives under `"vt-<handle>"` with a 24-hour TTL; a
//! verdict that takes longer than that is lost on purpose.

use crate::cache::Cache;
use crate::entities::ScheduleItem;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

const PAYLOAD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct ScheduleQueueRepository {
    cache: Arc<dyn Cache>,
    list_name: String,
}

impl ScheduleQueueRepository {
    pub fn new(cache: Arc<dyn Cache>, list_name: &str) -> Self {
        Self {
            cache,
            list_name: list_name.to_string(),
        }
    }

    /// Enqueue a handle for later polling.
    pub async fn add(&self, handle: &str, item: &ScheduleItem) -> Result<()> {
        let member = format!("{}:{handle}", Utc::now().timestamp());
        self.cache
            .zadd_lex(&self.list_name, vec![member])
            .await
            .context("failed to enqueue external scan handle")?;

        let json = serde_json::to_string(item).context("failed to serialize schedule item")?;
        self.cache
            .set(&format!("vt-{handle}"), json, Some(PAYLOAD_TTL))
            .await
            .context("failed to store schedule item payload")
    }

    /// Atomically drain every handle scheduled strictly before `limit` and
    /// resolve its payload. Malformed members are reported without aborting
    /// the rest of the batch.
    pub async fn get_until(
        &self,
        limit: DateTime<Utc>,
    ) -> Result<(Vec<ScheduleItem>, Vec<anyhow::Error>)> {
        let members = self
            .cache
            .zget_and_rem_lex(&self.list_name, "-", &format!("({}:", limit.timestamp()))
            .await
            .context("failed to drain external scan handles")?;

        let mut items = Vec::new();
        let mut errors = Vec::new();

        for member in members {
            let tokens: Vec<&str> = member.split(':').collect();
            if tokens.len() != 2 {
                errors.push(anyhow!(
                    "handle entry is not of the form <timestamp>:<handle>: {member}"
                ));
                continue;
            }
            let handle = tokens[1];

            let payload = match self.cache.get(&format!("vt-{handle}")).await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    errors.push(anyhow!("no payload stored for handle {handle}"));
                    continue;
                }
                Err(err) => {
                    errors.push(err.context(format!("failed to fetch payload for {handle}")));
                    continue;
                }
            };

            match serde_json::from_str::<ScheduleItem>(&payload) {
                Ok(item) => items.push(item),
                Err(err) => errors.push(anyhow!("corrupt payload for handle {handle}: {err}")),
            }
        }

        Ok((items, errors))
    }
}
