use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Document},
    options::ClientOptions,
    Client, Collection,
};
use tracing::{error, info};

use crate::Result;

/// Collection state of one username.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProfileStatus {
    Collected,
    NotCollected,
    Error,
}

impl ProfileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileStatus::Collected => "collected",
            ProfileStatus::NotCollected => "not_collected",
            ProfileStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProfileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub username: String,
    pub status: ProfileStatus,
}

/// Queue of usernames to collect, and the place their status is written back to.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn pending_usernames(&self, limit: usize) -> Result<Vec<String>>;
    /// Returns how many records changed.
    async fn apply_updates(&self, updates: &[StatusUpdate]) -> Result<u64>;
    async fn close(&self) -> Result<()>;
}

/// Groups updates by status, usernames in arrival order.
pub fn group_by_status(updates: &[StatusUpdate]) -> BTreeMap<ProfileStatus, Vec<&str>> {
    let mut groups: BTreeMap<ProfileStatus, Vec<&str>> = BTreeMap::new();
    for update in updates {
        groups.entry(update.status).or_default().push(&update.username);
    }
    groups
}

/// Status changes waiting to be written in one go.
#[derive(Debug, Default)]
pub struct PendingUpdates {
    updates: Vec<StatusUpdate>,
}

impl PendingUpdates {
    pub fn push(&mut self, username: impl Into<String>, status: ProfileStatus) {
        self.updates.push(StatusUpdate {
            username: username.into(),
            status,
        });
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Writes the batch. The batch is dropped even when the write fails so it is never resent.
    pub async fn flush<S: ProfileStore + ?Sized>(&mut self, store: &S) -> bool {
        if self.updates.is_empty() {
            return true;
        }
        let batch = std::mem::take(&mut self.updates);
        info!("Sending {} status updates to the store...", batch.len());
        match store.apply_updates(&batch).await {
            Ok(modified) => {
                info!("Batch written: {modified} records updated.");
                true
            }
            Err(e) => {
                error!("Couldn't write the status batch: {e}");
                false
            }
        }
    }
}

pub struct MongoStore {
    client: Client,
    collection: Collection<Document>,
}

impl MongoStore {
    pub async fn connect(uri: &str, db: &str, collection: &str) -> Result<Self> {
        info!("Connecting to MongoDB...");
        let mut options = ClientOptions::parse(uri).await?;
        options.server_selection_timeout = Some(Duration::from_secs(20));
        options.connect_timeout = Some(Duration::from_secs(20));
        options.max_pool_size = Some(10);
        let client = Client::with_options(options)?;

        client.database("admin").run_command(doc! { "ping": 1 }).await?;
        info!("Connected to MongoDB.");

        let collection = client.database(db).collection::<Document>(collection);
        Ok(MongoStore { client, collection })
    }
}

#[async_trait]
impl ProfileStore for MongoStore {
    /// Random sample of usernames still marked `not_collected`.
    async fn pending_usernames(&self, limit: usize) -> Result<Vec<String>> {
        info!("Fetching profiles from the database...");
        let pipeline = [
            doc! { "$match": { "status": ProfileStatus::NotCollected.as_str() } },
            doc! { "$sample": { "size": limit as i64 } },
            doc! { "$project": { "username": 1, "_id": 0 } },
        ];
        let mut cursor = self
            .collection
            .aggregate(pipeline)
            .max_time(Duration::from_secs(60))
            .allow_disk_use(true)
            .await?;

        let mut usernames = Vec::with_capacity(limit);
        while let Some(doc) = cursor.try_next().await? {
            if let Ok(username) = doc.get_str("username") {
                usernames.push(username.to_string());
            }
        }
        info!("Fetched {} random profiles from the database.", usernames.len());
        Ok(usernames)
    }

    async fn apply_updates(&self, updates: &[StatusUpdate]) -> Result<u64> {
        let mut modified = 0;
        for (status, usernames) in group_by_status(updates) {
            let result = self
                .collection
                .update_many(
                    doc! { "username": { "$in": usernames } },
                    doc! {
                        "$set": { "status": status.as_str() },
                        "$currentDate": { "updated_at": true },
                    },
                )
                .await?;
            modified += result.modified_count;
        }
        Ok(modified)
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        info!("MongoDB connection closed.");
        Ok(())
    }
}
