//! Contract with the local cluster runtime.
//!
//! The runtime supplies this node's view of the cluster (configured nodes,
//! membership with its ring id, quorum, expected votes) and accepts the
//! periodic vote poll. The agent core sees it as a pair of channels; the
//! shipped binary adapts a newline-delimited JSON protocol over a Unix
//! socket onto that pair, and tests drive the channels directly.

use std::path::Path;

use arbiter_proto::{NodeInfo, NodeState, Quorate, RingId};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One notification from the local cluster runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// The configured node list changed (or is being reported initially).
    ConfigNodeList {
        /// Configuration file version, when the runtime tracks one.
        config_version: Option<u64>,
        /// Configured nodes.
        nodes: Vec<NodeInfo>,
    },
    /// Membership changed; a new ring id was formed.
    MembershipNodeList {
        /// The new membership epoch.
        ring_id: RingId,
        /// Node ids in this partition.
        nodes: Vec<u32>,
    },
    /// The local quorum view changed.
    QuorumNodeList {
        /// Whether this partition holds quorum.
        quorate: Quorate,
        /// Nodes with their reported states.
        nodes: Vec<NodeInfo>,
    },
    /// The expected-votes figure changed.
    ExpectedVotes {
        /// New expected votes.
        expected_votes: u32,
    },
}

/// The agent's side of the runtime contract.
#[derive(Debug)]
pub struct RuntimeHandle {
    /// Notifications from the runtime. A closed channel means the runtime
    /// went away and the agent must stop.
    pub events: mpsc::UnboundedReceiver<RuntimeEvent>,
    /// Vote poll sink: `true` casts one vote, `false` casts none.
    pub votes: mpsc::UnboundedSender<bool>,
}

/// Build a handle plus the runtime-facing ends, for tests and adapters.
pub fn channel_pair() -> (
    RuntimeHandle,
    mpsc::UnboundedSender<RuntimeEvent>,
    mpsc::UnboundedReceiver<bool>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (vote_tx, vote_rx) = mpsc::unbounded_channel();
    (
        RuntimeHandle {
            events: event_rx,
            votes: vote_tx,
        },
        event_tx,
        vote_rx,
    )
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WireEvent {
    ConfigNodeList {
        #[serde(default)]
        config_version: Option<u64>,
        nodes: Vec<WireNode>,
    },
    Membership {
        ring_node_id: u32,
        ring_seq: u64,
        nodes: Vec<u32>,
    },
    Quorum {
        quorate: bool,
        nodes: Vec<WireNode>,
    },
    ExpectedVotes {
        expected_votes: u32,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct WireNode {
    node_id: u32,
    #[serde(default)]
    data_center_id: u32,
    #[serde(default)]
    state: WireNodeState,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum WireNodeState {
    #[default]
    NotSet,
    Member,
    Dead,
    Leaving,
}

#[derive(Debug, Serialize)]
struct WireVote {
    cast_vote: bool,
}

impl From<WireNode> for NodeInfo {
    fn from(node: WireNode) -> Self {
        NodeInfo {
            node_id: node.node_id,
            data_center_id: node.data_center_id,
            node_state: match node.state {
                WireNodeState::NotSet => NodeState::NotSet,
                WireNodeState::Member => NodeState::Member,
                WireNodeState::Dead => NodeState::Dead,
                WireNodeState::Leaving => NodeState::Leaving,
            },
        }
    }
}

impl From<WireEvent> for RuntimeEvent {
    fn from(event: WireEvent) -> Self {
        match event {
            WireEvent::ConfigNodeList {
                config_version,
                nodes,
            } => RuntimeEvent::ConfigNodeList {
                config_version,
                nodes: nodes.into_iter().map(NodeInfo::from).collect(),
            },
            WireEvent::Membership {
                ring_node_id,
                ring_seq,
                nodes,
            } => RuntimeEvent::MembershipNodeList {
                ring_id: RingId::new(ring_node_id, ring_seq),
                nodes,
            },
            WireEvent::Quorum { quorate, nodes } => RuntimeEvent::QuorumNodeList {
                quorate: if quorate {
                    Quorate::Quorate
                } else {
                    Quorate::Inquorate
                },
                nodes: nodes.into_iter().map(NodeInfo::from).collect(),
            },
            WireEvent::ExpectedVotes { expected_votes } => {
                RuntimeEvent::ExpectedVotes { expected_votes }
            }
        }
    }
}

/// Connect to the runtime's Unix socket and adapt its line protocol to a
/// [`RuntimeHandle`]. Each inbound line is one JSON event; each vote poll
/// is written back as one JSON line.
pub async fn connect_unix(path: &Path) -> std::io::Result<RuntimeHandle> {
    let stream = UnixStream::connect(path).await?;
    let (read_half, mut write_half) = stream.into_split();

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (vote_tx, mut vote_rx) = mpsc::unbounded_channel::<bool>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<WireEvent>(&line) {
                    Ok(event) => {
                        debug!(?event, "runtime event");
                        if event_tx.send(event.into()).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%err, "ignoring malformed runtime event"),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "runtime socket read failed");
                    break;
                }
            }
        }
        // Dropping event_tx closes the agent's event stream.
    });

    tokio::spawn(async move {
        while let Some(cast_vote) = vote_rx.recv().await {
            let mut line = match serde_json::to_vec(&WireVote { cast_vote }) {
                Ok(line) => line,
                Err(err) => {
                    warn!(%err, "can't serialize vote poll");
                    continue;
                }
            };
            line.push(b'\n');
            if write_half.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    Ok(RuntimeHandle {
        events: event_rx,
        votes: vote_tx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_events_parse() {
        let event: WireEvent = serde_json::from_str(
            r#"{"event":"membership","ring_node_id":1,"ring_seq":16,"nodes":[1,2,3]}"#,
        )
        .unwrap();
        assert_eq!(
            RuntimeEvent::from(event),
            RuntimeEvent::MembershipNodeList {
                ring_id: RingId::new(1, 16),
                nodes: vec![1, 2, 3],
            }
        );

        let event: WireEvent = serde_json::from_str(
            r#"{"event":"quorum","quorate":true,"nodes":[{"node_id":1,"state":"member"}]}"#,
        )
        .unwrap();
        let RuntimeEvent::QuorumNodeList { quorate, nodes } = RuntimeEvent::from(event) else {
            panic!("wrong event kind");
        };
        assert_eq!(quorate, Quorate::Quorate);
        assert_eq!(nodes[0].node_state, NodeState::Member);
    }

    #[tokio::test]
    async fn unix_adapter_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let mut handle = connect_unix(&path).await.unwrap();
        let peer = accept.await.unwrap();
        let (peer_read, mut peer_write) = peer.into_split();

        peer_write
            .write_all(b"{\"event\":\"expected_votes\",\"expected_votes\":3}\n")
            .await
            .unwrap();
        assert_eq!(
            handle.events.recv().await,
            Some(RuntimeEvent::ExpectedVotes { expected_votes: 3 })
        );

        handle.votes.send(true).unwrap();
        let mut lines = BufReader::new(peer_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"cast_vote":true}"#);
    }
}
