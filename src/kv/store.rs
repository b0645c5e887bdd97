//! Key-value bucket handle
//!
//! A bucket is a stream named `KV_<bucket>` holding subjects
//! `$KV.<bucket>.<key>`, with per-subject history depth as the revision
//! limit. Reads go through the direct-get API; optimistic concurrency uses
//! the expected-last-subject-sequence header.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, KvError, Result};
use crate::jetstream::types::{ConsumerConfig, DeliverPolicy, StreamConfig};
use crate::jetstream::JetStream;
use crate::kv::entry::{Entry, Operation};
use crate::kv::watch::{History, Watch};
use crate::protocol::headers::{
    HeaderMap, HDR_EXPECTED_LAST_SUBJECT_SEQUENCE, HDR_KV_OPERATION, HDR_ROLLUP, HDR_SEQUENCE,
    ROLLUP_SUBJECT,
};

const STREAM_PREFIX: &str = "KV_";
const SUBJECT_PREFIX: &str = "$KV";
const MAX_HISTORY: i64 = 64;

/// Wrong expected-last-subject-sequence
const ERR_CODE_WRONG_SEQUENCE: u64 = 10071;

/// Bucket creation parameters
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Bucket name (alphanumerics, `-` and `_`)
    pub bucket: String,
    pub description: Option<String>,
    /// Revisions kept per key, 1 to 64
    pub history: i64,
    /// Value size ceiling in bytes; 0 means server default
    pub max_value_size: i32,
    /// Total bucket size ceiling in bytes; 0 means unlimited
    pub max_bytes: i64,
    /// Age after which revisions expire
    pub ttl: Option<Duration>,
}

impl KvConfig {
    /// Defaults with history depth 1
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            description: None,
            history: 1,
            max_value_size: 0,
            max_bytes: 0,
            ttl: None,
        }
    }
}

/// Counters describing a bucket
#[derive(Debug, Clone)]
pub struct KvStatus {
    pub bucket: String,
    /// Stored revisions across all keys
    pub values: u64,
    /// Configured history depth
    pub history: i64,
    pub bytes: u64,
}

/// Handle to one key-value bucket
#[derive(Debug, Clone)]
pub struct KvStore {
    js: JetStream,
    bucket: String,
    stream_name: String,
    prefix: String,
}

/// Create a bucket, or return it if it already exists with this shape
pub async fn create_bucket(js: &JetStream, config: KvConfig) -> Result<KvStore> {
    validate_bucket(&config.bucket)?;
    if !(1..=MAX_HISTORY).contains(&config.history) {
        return Err(Error::Kv(KvError::InvalidHistory(config.history)));
    }
    let store = KvStore::new(js.clone(), &config.bucket);
    let stream = StreamConfig {
        name: store.stream_name.clone(),
        description: config.description,
        subjects: vec![format!("{}.>", store.subject_base())],
        max_msgs_per_subject: config.history,
        max_bytes: config.max_bytes,
        max_msg_size: config.max_value_size,
        max_age: config.ttl,
        allow_rollup: true,
        deny_delete: true,
        allow_direct: true,
        ..Default::default()
    };
    js.create_stream(stream).await?;
    Ok(store)
}

/// Open an existing bucket; fails if it does not exist
pub async fn open_bucket(js: &JetStream, bucket: impl AsRef<str>) -> Result<KvStore> {
    let bucket = bucket.as_ref();
    validate_bucket(bucket)?;
    let store = KvStore::new(js.clone(), bucket);
    js.stream_info(&store.stream_name).await?;
    Ok(store)
}

impl KvStore {
    fn new(js: JetStream, bucket: &str) -> Self {
        Self {
            js,
            bucket: bucket.to_string(),
            stream_name: format!("{}{}", STREAM_PREFIX, bucket),
            prefix: format!("{}.{}.", SUBJECT_PREFIX, bucket),
        }
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn subject_base(&self) -> String {
        format!("{}.{}", SUBJECT_PREFIX, self.bucket)
    }

    fn key_subject(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Write a value unconditionally; returns the new revision
    pub async fn put(&self, key: impl AsRef<str>, value: Bytes) -> Result<u64> {
        let key = key.as_ref();
        validate_key(key)?;
        let ack = self.js.publish(self.key_subject(key), value).await?;
        Ok(ack.sequence)
    }

    /// Write only if the key has no live value
    ///
    /// Succeeds over tombstones: a deleted or purged key can be created
    /// again, continuing its revision history.
    pub async fn create(&self, key: impl AsRef<str>, value: Bytes) -> Result<u64> {
        let key = key.as_ref();
        match self.update(key, value.clone(), 0).await {
            Ok(revision) => Ok(revision),
            Err(Error::Kv(KvError::WrongRevision { .. })) => {
                // The subject has revisions; only a tombstone lets create
                // proceed, pinned to that tombstone's revision
                match self.entry(key).await? {
                    Some(entry) if entry.operation.is_tombstone() => {
                        self.update(key, value, entry.revision).await
                    }
                    _ => Err(Error::Kv(KvError::KeyExists {
                        key: key.to_string(),
                    })),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Write only if `revision` is still the key's latest
    pub async fn update(&self, key: impl AsRef<str>, value: Bytes, revision: u64) -> Result<u64> {
        let key = key.as_ref();
        validate_key(key)?;
        let mut headers = HeaderMap::new();
        headers.insert(HDR_EXPECTED_LAST_SUBJECT_SEQUENCE, revision.to_string());
        match self
            .js
            .publish_with_headers(self.key_subject(key), headers, value)
            .await
        {
            Ok(ack) => Ok(ack.sequence),
            Err(Error::Api(api)) if api.err_code == ERR_CODE_WRONG_SEQUENCE => {
                Err(Error::Kv(KvError::WrongRevision {
                    key: key.to_string(),
                    expected: revision,
                }))
            }
            Err(e) => Err(e),
        }
    }

    /// Mark the key deleted, keeping its history
    pub async fn delete(&self, key: impl AsRef<str>) -> Result<()> {
        let key = key.as_ref();
        validate_key(key)?;
        let mut headers = HeaderMap::new();
        if let Some(v) = Operation::Delete.header_value() {
            headers.insert(HDR_KV_OPERATION, v);
        }
        self.js
            .publish_with_headers(self.key_subject(key), headers, Bytes::new())
            .await?;
        Ok(())
    }

    /// Delete the key and drop its prior revisions
    pub async fn purge(&self, key: impl AsRef<str>) -> Result<()> {
        let key = key.as_ref();
        validate_key(key)?;
        let mut headers = HeaderMap::new();
        if let Some(v) = Operation::Purge.header_value() {
            headers.insert(HDR_KV_OPERATION, v);
        }
        headers.insert(HDR_ROLLUP, ROLLUP_SUBJECT);
        self.js
            .publish_with_headers(self.key_subject(key), headers, Bytes::new())
            .await?;
        Ok(())
    }

    /// Current value of a key; `None` for missing or deleted keys
    pub async fn get(&self, key: impl AsRef<str>) -> Result<Option<Bytes>> {
        Ok(self
            .entry(key)
            .await?
            .filter(|e| !e.operation.is_tombstone())
            .map(|e| e.value))
    }

    /// Latest revision of a key, tombstones included
    pub async fn entry(&self, key: impl AsRef<str>) -> Result<Option<Entry>> {
        let key = key.as_ref();
        validate_key(key)?;
        let Some(msg) = self
            .js
            .direct_get_last(&self.stream_name, self.key_subject(key))
            .await?
        else {
            return Ok(None);
        };
        let revision = msg
            .headers
            .as_ref()
            .and_then(|h| h.get(HDR_SEQUENCE))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(Some(Entry {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            value: msg.payload.clone(),
            revision,
            operation: Operation::from_headers(msg.headers.as_ref()),
            delta: 0,
        }))
    }

    /// All keys with a live value
    pub async fn keys(&self) -> Result<Vec<String>> {
        let config = ConsumerConfig {
            deliver_policy: DeliverPolicy::LastPerSubject,
            filter_subject: Some(format!("{}.>", self.subject_base())),
            headers_only: true,
            ..Default::default()
        };
        let consumer = self.js.ordered_consumer(&self.stream_name, config).await?;
        let mut history = History::new(consumer, self.bucket.clone(), self.prefix.clone());
        let mut keys = Vec::new();
        while let Some(entry) = history.next().await? {
            if !entry.operation.is_tombstone() {
                keys.push(entry.key);
            }
        }
        Ok(keys)
    }

    /// Watch keys matching `pattern` for changes from now on
    ///
    /// The pattern is a subject pattern over keys, so `profiles.*` or `>`
    /// are valid.
    pub async fn watch(&self, pattern: impl AsRef<str>) -> Result<Watch> {
        let config = ConsumerConfig {
            deliver_policy: DeliverPolicy::New,
            filter_subject: Some(self.key_subject(pattern.as_ref())),
            ..Default::default()
        };
        let consumer = self.js.ordered_consumer(&self.stream_name, config).await?;
        Ok(Watch::new(consumer, self.bucket.clone(), self.prefix.clone()))
    }

    /// Watch every key in the bucket
    pub async fn watch_all(&self) -> Result<Watch> {
        self.watch(">").await
    }

    /// Watch keys matching `pattern`, replaying stored revisions first
    ///
    /// Yields every retained revision of the matching keys before switching
    /// to live changes; [`KvStore::watch`] starts at the live edge instead.
    pub async fn watch_with_history(&self, pattern: impl AsRef<str>) -> Result<Watch> {
        let config = ConsumerConfig {
            deliver_policy: DeliverPolicy::All,
            filter_subject: Some(self.key_subject(pattern.as_ref())),
            ..Default::default()
        };
        let consumer = self.js.ordered_consumer(&self.stream_name, config).await?;
        Ok(Watch::new(consumer, self.bucket.clone(), self.prefix.clone()))
    }

    /// All retained revisions of one key, oldest first
    pub async fn history(&self, key: impl AsRef<str>) -> Result<History> {
        let key = key.as_ref();
        validate_key(key)?;
        let config = ConsumerConfig {
            deliver_policy: DeliverPolicy::All,
            filter_subject: Some(self.key_subject(key)),
            ..Default::default()
        };
        let consumer = self.js.ordered_consumer(&self.stream_name, config).await?;
        Ok(History::new(consumer, self.bucket.clone(), self.prefix.clone()))
    }

    /// Bucket-level counters
    pub async fn status(&self) -> Result<KvStatus> {
        let info = self.js.stream_info(&self.stream_name).await?;
        Ok(KvStatus {
            bucket: self.bucket.clone(),
            values: info.state.messages,
            history: info.config.max_msgs_per_subject,
            bytes: info.state.bytes,
        })
    }
}

/// Bucket names are stream name tokens
fn validate_bucket(bucket: &str) -> Result<()> {
    if bucket.is_empty()
        || !bucket
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Kv(KvError::InvalidBucket(bucket.to_string())));
    }
    Ok(())
}

/// Keys are subject suffixes: dot-separated tokens of a restricted
/// alphabet, no leading or trailing dot
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('.')
        || key.ends_with('.')
        || key.starts_with('_')
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | '_' | '=' | '.'))
    {
        return Err(Error::Kv(KvError::InvalidKey(key.to_string())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::jetstream::testing::{self, Inbound, Outgoing};

    fn stream_info(reply: &str) -> Outgoing {
        Outgoing::json(
            reply,
            serde_json::json!({
                "config": { "name": "KV_cfg", "max_msgs_per_subject": 5 },
                "state": {},
            }),
        )
    }

    fn wrong_sequence(reply: &str) -> Outgoing {
        Outgoing::json(
            reply,
            serde_json::json!({
                "error": {
                    "code": 400,
                    "err_code": ERR_CODE_WRONG_SEQUENCE,
                    "description": "wrong last sequence",
                },
            }),
        )
    }

    fn pub_ack(reply: &str, seq: u64) -> Outgoing {
        Outgoing::json(
            reply,
            serde_json::json!({ "stream": "KV_cfg", "seq": seq }),
        )
    }

    fn expected_revision(inbound: &Inbound) -> Option<String> {
        inbound
            .headers
            .as_ref()
            .and_then(|h| h.map.get(HDR_EXPECTED_LAST_SUBJECT_SEQUENCE))
            .map(str::to_string)
    }

    async fn open_cfg_bucket(url: String) -> KvStore {
        let client = crate::connect(url).await.unwrap();
        open_bucket(&client.jetstream(), "cfg").await.unwrap()
    }

    #[tokio::test]
    async fn test_update_with_stale_revision_fails() {
        let handler: testing::Handler = Arc::new(|inbound: &Inbound| {
            let Some(reply) = inbound.reply.as_deref() else {
                return Vec::new();
            };
            match inbound.subject.as_str() {
                "$JS.API.STREAM.INFO.KV_cfg" => vec![stream_info(reply)],
                "$KV.cfg.color" => vec![wrong_sequence(reply)],
                _ => Vec::new(),
            }
        });
        let url = testing::start(handler).await;
        let store = open_cfg_bucket(url).await;

        let err = store
            .update("color", Bytes::from_static(b"blue"), 7)
            .await
            .unwrap_err();
        match err {
            Error::Kv(KvError::WrongRevision { key, expected }) => {
                assert_eq!(key, "color");
                assert_eq!(expected, 7);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_create_ladder() {
        // color: deleted at revision 3; owner: live at revision 9
        let handler: testing::Handler = Arc::new(|inbound: &Inbound| {
            let Some(reply) = inbound.reply.as_deref() else {
                return Vec::new();
            };
            match inbound.subject.as_str() {
                "$JS.API.STREAM.INFO.KV_cfg" => vec![stream_info(reply)],
                "$KV.cfg.fresh" => vec![pub_ack(reply, 1)],
                "$KV.cfg.color" => match expected_revision(inbound).as_deref() {
                    Some("3") => vec![pub_ack(reply, 4)],
                    _ => vec![wrong_sequence(reply)],
                },
                "$KV.cfg.owner" => vec![wrong_sequence(reply)],
                "$JS.API.DIRECT.GET.KV_cfg" => {
                    match inbound.json()["last_by_subj"].as_str() {
                        Some("$KV.cfg.color") => vec![Outgoing::with_headers(
                            reply,
                            "NATS/1.0\r\nKV-Operation: DEL\r\nNats-Subject: $KV.cfg.color\r\nNats-Sequence: 3\r\n\r\n",
                            b"",
                        )],
                        Some("$KV.cfg.owner") => vec![Outgoing::with_headers(
                            reply,
                            "NATS/1.0\r\nNats-Subject: $KV.cfg.owner\r\nNats-Sequence: 9\r\n\r\n",
                            b"alice",
                        )],
                        _ => Vec::new(),
                    }
                }
                _ => Vec::new(),
            }
        });
        let url = testing::start(handler).await;
        let store = open_cfg_bucket(url).await;

        // No prior revisions at all: plain success
        let rev = store.create("fresh", Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(rev, 1);

        // Tombstoned key: create retries pinned to the tombstone revision
        let rev = store.create("color", Bytes::from_static(b"red")).await.unwrap();
        assert_eq!(rev, 4);

        // Live key: surfaced as already existing, not revision mismatch
        let err = store
            .create("owner", Bytes::from_static(b"bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kv(KvError::KeyExists { ref key }) if key == "owner"));
    }

    #[tokio::test]
    async fn test_watch_consumer_policies() {
        let creates = Arc::new(Mutex::new(Vec::<serde_json::Value>::new()));
        let handler: testing::Handler = {
            let creates = Arc::clone(&creates);
            Arc::new(move |inbound: &Inbound| {
                let Some(reply) = inbound.reply.as_deref() else {
                    return Vec::new();
                };
                match inbound.subject.as_str() {
                    "$JS.API.STREAM.INFO.KV_cfg" => vec![stream_info(reply)],
                    "$JS.API.CONSUMER.CREATE.KV_cfg" => {
                        creates.lock().unwrap().push(inbound.json());
                        vec![Outgoing::json(
                            reply,
                            serde_json::json!({ "stream_name": "KV_cfg", "name": "w1" }),
                        )]
                    }
                    _ => Vec::new(),
                }
            })
        };
        let url = testing::start(handler).await;
        let store = open_cfg_bucket(url).await;

        let _watch = store.watch("profiles.*").await.unwrap();
        let _replay = store.watch_with_history(">").await.unwrap();

        let creates = creates.lock().unwrap();
        assert_eq!(creates.len(), 2);
        // Live-edge watch starts at new messages only
        assert_eq!(creates[0]["config"]["deliver_policy"], "new");
        assert_eq!(
            creates[0]["config"]["filter_subject"],
            "$KV.cfg.profiles.*"
        );
        // History-replaying watch starts from the first retained revision
        assert_eq!(creates[1]["config"]["deliver_policy"], "all");
    }

    #[test]
    fn test_bucket_validation() {
        assert!(validate_bucket("config").is_ok());
        assert!(validate_bucket("my-bucket_2").is_ok());
        assert!(validate_bucket("").is_err());
        assert!(validate_bucket("a.b").is_err());
        assert!(validate_bucket("a b").is_err());
        assert!(validate_bucket("a*").is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("color").is_ok());
        assert!(validate_key("profiles.alice.theme").is_ok());
        assert!(validate_key("a-b/c_d=e").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key(".leading").is_err());
        assert!(validate_key("trailing.").is_err());
        assert!(validate_key("_reserved").is_err());
        assert!(validate_key("spa ce").is_err());
        assert!(validate_key("star*").is_err());
    }

    #[test]
    fn test_history_bounds() {
        let config = KvConfig::new("cfg");
        assert_eq!(config.history, 1);
        assert!(!(1..=MAX_HISTORY).contains(&0));
        assert!(!(1..=MAX_HISTORY).contains(&65));
        assert!((1..=MAX_HISTORY).contains(&64));
    }
}
