//! TCP replica transport
//!
//! [`ReplicaTransport`] over [`NetworkClient`]: each call is one framed
//! request answered by the follower's [`NetworkServer`](super::NetworkServer).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::NetworkClient;
use crate::config::WolfShardConfig;
use crate::digest::{BatchInfo, BucketDigest, KeyRange};
use crate::error::{Error, Result};
use crate::replication::protocol::ErrorCode;
use crate::replication::{ApplyResponse, Message, Readmission, ReplicaTransport, RepairBatch};
use crate::store::{DigestEntry, OpEntry, Seq};

/// Transport to followers on other nodes
pub struct NetworkTransport {
    client: NetworkClient,
    /// Participant id -> replication address
    peers: HashMap<String, String>,
}

impl NetworkTransport {
    pub fn new(client: NetworkClient, peers: HashMap<String, String>) -> Self {
        Self { client, peers }
    }

    /// Transport to the peers listed in the configuration
    pub fn from_config(config: &WolfShardConfig) -> Self {
        let request_timeout = config.replication.ack_timeout().max(Duration::from_secs(5));
        let client = NetworkClient::new(Duration::from_secs(3), request_timeout);
        let peers = config
            .peers
            .iter()
            .map(|p| (p.id.clone(), p.address.clone()))
            .collect();
        Self::new(client, peers)
    }

    pub fn client(&self) -> &NetworkClient {
        &self.client
    }

    async fn request(&self, follower: &str, message: Message) -> Result<Message> {
        let address = self.peers.get(follower).ok_or_else(|| Error::ConnectionFailed {
            address: follower.to_string(),
            reason: "no address configured".into(),
        })?;
        match self.client.send(address, message).await? {
            Message::Error { code, message } => Err(remote_error(code, message)),
            response => Ok(response),
        }
    }
}

fn remote_error(code: ErrorCode, message: String) -> Error {
    match code {
        ErrorCode::BatchNotFound => Error::BatchNotFound(message),
        ErrorCode::ShardNotFound => Error::ShardNotFound(message),
        ErrorCode::Storage => Error::Storage(message),
        ErrorCode::Fenced | ErrorCode::BadRequest | ErrorCode::Internal => {
            Error::Network(format!("{:?}: {}", code, message))
        }
    }
}

fn unexpected(expected: &str, got: &Message) -> Error {
    Error::Network(format!("expected {}, got {}", expected, got.type_name()))
}

#[async_trait]
impl ReplicaTransport for NetworkTransport {
    async fn apply(&self, follower: &str, entry: &OpEntry) -> Result<ApplyResponse> {
        let message = Message::Apply {
            entry: entry.clone(),
        };
        match self.request(follower, message).await? {
            Message::ApplyResult { response } => Ok(response),
            other => Err(unexpected("ApplyResult", &other)),
        }
    }

    async fn fence(&self, follower: &str, shard: &str, generation: u64) -> Result<()> {
        let message = Message::Fence {
            shard: shard.to_string(),
            generation,
        };
        match self.request(follower, message).await? {
            Message::Done => Ok(()),
            other => Err(unexpected("Done", &other)),
        }
    }

    async fn readmit(&self, follower: &str, readmission: Readmission) -> Result<()> {
        match self.request(follower, Message::Readmit { readmission }).await? {
            Message::Done => Ok(()),
            other => Err(unexpected("Done", &other)),
        }
    }

    async fn open_batch(&self, follower: &str, shard: &str) -> Result<BatchInfo> {
        let message = Message::OpenDigestBatch {
            shard: shard.to_string(),
        };
        match self.request(follower, message).await? {
            Message::DigestBatchOpened { batch } => Ok(batch),
            other => Err(unexpected("DigestBatchOpened", &other)),
        }
    }

    async fn keepalive_batch(&self, follower: &str, batch_id: &str) -> Result<()> {
        let message = Message::KeepaliveDigestBatch {
            batch_id: batch_id.to_string(),
        };
        match self.request(follower, message).await? {
            Message::Done => Ok(()),
            other => Err(unexpected("Done", &other)),
        }
    }

    async fn close_batch(&self, follower: &str, batch_id: &str) -> Result<()> {
        let message = Message::CloseDigestBatch {
            batch_id: batch_id.to_string(),
        };
        match self.request(follower, message).await? {
            Message::Done => Ok(()),
            other => Err(unexpected("Done", &other)),
        }
    }

    async fn digest_range(
        &self,
        follower: &str,
        batch_id: &str,
        range: KeyRange,
        parts: usize,
    ) -> Result<Vec<BucketDigest>> {
        let message = Message::DigestRange {
            batch_id: batch_id.to_string(),
            range,
            parts: parts as u32,
        };
        match self.request(follower, message).await? {
            Message::DigestRangeResult { buckets } => Ok(buckets),
            other => Err(unexpected("DigestRangeResult", &other)),
        }
    }

    async fn scan_range(&self, follower: &str, batch_id: &str, range: KeyRange) -> Result<Vec<DigestEntry>> {
        let message = Message::ScanRange {
            batch_id: batch_id.to_string(),
            range,
        };
        match self.request(follower, message).await? {
            Message::ScanRangeResult { entries } => Ok(entries),
            other => Err(unexpected("ScanRangeResult", &other)),
        }
    }

    async fn repair(&self, follower: &str, batch: RepairBatch) -> Result<Seq> {
        match self.request(follower, Message::Repair { batch }).await? {
            Message::Repaired { tag } => Ok(tag),
            other => Err(unexpected("Repaired", &other)),
        }
    }

    async fn truncate(&self, follower: &str, shard: &str, tag: Seq) -> Result<u64> {
        let message = Message::Truncate {
            shard: shard.to_string(),
            tag,
        };
        match self.request(follower, message).await? {
            Message::Truncated { removed } => Ok(removed),
            other => Err(unexpected("Truncated", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::network::NetworkServer;
    use crate::replication::FollowerNode;
    use crate::store::{MemoryStore, Operation};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn served_follower() -> (NetworkTransport, Arc<NetworkServer>, Arc<FollowerNode>) {
        let follower = Arc::new(FollowerNode::new(
            "F1".into(),
            &ReplicationConfig::default(),
            Duration::from_secs(60),
        ));
        follower.host("s1", Arc::new(MemoryStore::new())).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(NetworkServer::new(address.clone(), follower.clone()));
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await });
        }

        let client = NetworkClient::new(Duration::from_secs(1), Duration::from_secs(2));
        let transport = NetworkTransport::new(client, HashMap::from([("F1".to_string(), address)]));
        (transport, server, follower)
    }

    #[tokio::test]
    async fn test_apply_and_digest_over_tcp() {
        let (transport, server, follower) = served_follower().await;

        let entry = OpEntry::new("s1", 1, 1, Operation::upsert("k", json!({"v": 1})));
        let response = transport.apply("F1", &entry).await.unwrap();
        assert_eq!(response, ApplyResponse::Ack { applied_index: 1 });
        assert_eq!(follower.applied_index("s1").await.unwrap(), 1);

        let batch = transport.open_batch("F1", "s1").await.unwrap();
        let buckets = transport
            .digest_range("F1", &batch.id, KeyRange::FULL, 4)
            .await
            .unwrap();
        assert_eq!(buckets.len(), 4);
        assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), 1);
        transport.close_batch("F1", &batch.id).await.unwrap();

        // Pooled connection is reused
        assert_eq!(transport.client().connection_count().await, 1);
        server.stop();
    }

    #[tokio::test]
    async fn test_remote_errors_are_mapped() {
        let (transport, server, _) = served_follower().await;
        let result = transport.keepalive_batch("F1", "no-such-batch").await;
        assert!(matches!(result, Err(Error::BatchNotFound(_))));

        let result = transport.fence("F9", "s1", 1).await;
        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
        server.stop();
    }
}
