//! Registry of breakers feeding the monitoring streams
//!
//! Every registered breaker's snapshots are serialized onto the raw stream,
//! then mapped to Hystrix frames on the hystrix stream. Both streams are
//! broadcast channels: publishing never waits on readers.

use crate::errors::RegistryError;
use crate::events::Subscription;
use crate::hystrix;
use crate::stats::Snapshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;

/// Records kept per stream for slow readers before they start lagging
const STREAM_CAPACITY: usize = 1024;

static GLOBAL: OnceLock<Arc<GlobalRegistry>> = OnceLock::new();

/// Something that publishes snapshots the registry can follow
pub trait SnapshotPublisher {
    /// Identity used for membership
    fn publisher_id(&self) -> u64;

    fn publisher_name(&self) -> &str;

    /// Deliver every future snapshot to `listener` until the handle drops
    fn subscribe_snapshots(&self, listener: Box<dyn Fn(&Snapshot) + Send + Sync>)
    -> Subscription;
}

struct Member {
    name: String,
    _subscription: Subscription,
}

#[derive(Clone)]
struct Pipeline {
    raw: broadcast::Sender<String>,
    hystrix: broadcast::Sender<String>,
    errors: broadcast::Sender<String>,
}

impl Pipeline {
    fn publish(&self, snapshot: &Snapshot) {
        match serde_json::to_string(snapshot) {
            Ok(raw) => {
                self.transform(&raw);
                // no readers is fine
                let _ = self.raw.send(raw);
            }
            Err(error) => self.report(RegistryError::Serialize(error)),
        }
    }

    fn transform(&self, raw: &str) {
        match hystrix::transform(raw) {
            Ok(frame) => {
                let _ = self.hystrix.send(frame);
            }
            Err(error) => self.report(error),
        }
    }

    fn report(&self, error: RegistryError) {
        tracing::warn!(error = %error, "Dropping monitoring record");
        let _ = self.errors.send(error.to_string());
    }
}

/// Process-wide (or injected) set of breakers plus their monitoring streams
pub struct GlobalRegistry {
    members: Mutex<HashMap<u64, Member>>,
    pipeline: Pipeline,
}

impl GlobalRegistry {
    pub fn new() -> Self {
        let (raw, _) = broadcast::channel(STREAM_CAPACITY);
        let (hystrix, _) = broadcast::channel(STREAM_CAPACITY);
        let (errors, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            members: Mutex::new(HashMap::new()),
            pipeline: Pipeline {
                raw,
                hystrix,
                errors,
            },
        }
    }

    /// The instance breakers register with by default
    pub fn global() -> Arc<GlobalRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(GlobalRegistry::new())))
    }

    /// Follow `publisher`'s snapshots; returns false if it was already a member
    pub fn register<P>(&self, publisher: &P) -> bool
    where
        P: SnapshotPublisher + ?Sized,
    {
        let id = publisher.publisher_id();
        let mut members = self.members.lock();
        if members.contains_key(&id) {
            return false;
        }

        let pipeline = self.pipeline.clone();
        let subscription =
            publisher.subscribe_snapshots(Box::new(move |snapshot| pipeline.publish(snapshot)));
        members.insert(
            id,
            Member {
                name: publisher.publisher_name().to_string(),
                _subscription: subscription,
            },
        );
        tracing::info!(breaker = %publisher.publisher_name(), "Registered breaker");
        true
    }

    /// Stop following `publisher`; returns whether it was a member
    pub fn deregister<P>(&self, publisher: &P) -> bool
    where
        P: SnapshotPublisher + ?Sized,
    {
        self.deregister_id(publisher.publisher_id())
    }

    pub fn deregister_id(&self, id: u64) -> bool {
        let removed = self.members.lock().remove(&id);
        match removed {
            Some(member) => {
                tracing::info!(breaker = %member.name, "Deregistered breaker");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, id: u64) -> bool {
        self.members.lock().contains_key(&id)
    }

    pub fn instance_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Names of the registered breakers, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .members
            .lock()
            .values()
            .map(|member| member.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Serialized snapshots (JSON) of every registered breaker
    pub fn raw_stream(&self) -> broadcast::Receiver<String> {
        self.pipeline.raw.subscribe()
    }

    /// Hystrix `data: <json>\n\n` frames
    pub fn hystrix_stream(&self) -> broadcast::Receiver<String> {
        self.pipeline.hystrix.subscribe()
    }

    /// Messages of records that could not be transformed
    pub fn error_stream(&self) -> broadcast::Receiver<String> {
        self.pipeline.errors.subscribe()
    }

    /// Push an externally produced raw record through the transform stage
    pub fn ingest_raw(&self, raw: &str) {
        self.pipeline.transform(raw);
    }

    /// Deregister every breaker
    pub fn shutdown(&self) {
        let members: Vec<Member> = self.members.lock().drain().map(|(_, m)| m).collect();
        tracing::info!(count = members.len(), "Registry shut down");
        drop(members);
    }
}

impl Default for GlobalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GlobalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalRegistry")
            .field("instances", &self.instance_count())
            .finish()
    }
}
