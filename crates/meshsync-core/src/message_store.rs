//! Message store
//!
//! Direct and broadcast conversation logs for one device identity slot.
//! Direct conversations are keyed by the sorted pair of participants,
//! broadcast logs by channel index. Every log is capped and drops its
//! oldest messages first.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::events::Destination;
use crate::retention::RetentionEvictor;
use crate::types::{ChannelIndex, MeshDeviceId, NodeNum, Timestamp};

// ----------------------------------------------------------------------------
// Message Types
// ----------------------------------------------------------------------------

/// Delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageState {
    #[default]
    Ack,
    Waiting,
    Failed,
}

/// Whether a message belongs to a direct conversation or a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageType {
    Direct,
    #[default]
    Broadcast,
}

/// One stored message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: u32,
    pub from: NodeNum,
    pub to: NodeNum,
    pub channel: ChannelIndex,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Epoch milliseconds
    pub date: Timestamp,
    pub state: MessageState,
    pub message: String,
}

/// Which log a lookup addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    Direct { node_a: NodeNum, node_b: NodeNum },
    Broadcast { channel: ChannelIndex },
}

impl MessageTarget {
    /// The log a message is stored in
    pub fn of(message: &Message) -> Self {
        match message.message_type {
            MessageType::Direct => MessageTarget::Direct {
                node_a: message.from,
                node_b: message.to,
            },
            MessageType::Broadcast => MessageTarget::Broadcast {
                channel: message.channel,
            },
        }
    }

    fn describe(&self) -> String {
        match self {
            MessageTarget::Direct { node_a, node_b } => {
                format!("direct {}", conversation_id(*node_a, *node_b))
            }
            MessageTarget::Broadcast { channel } => format!("channel {}", channel),
        }
    }
}

/// Failed message lookup
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageLookupError {
    #[error("No message log for {log}")]
    LogNotFound { log: String },
    #[error("Message {message_id} not found in {log}")]
    MessageNotFound { log: String, message_id: u32 },
}

/// Conversation key for a direct chat, independent of who sent first
pub fn conversation_id(a: NodeNum, b: NodeNum) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", low, high)
}

type MessageLog = HashMap<u32, Message>;

fn default_log_cap() -> usize {
    RetentionConfig::default().message_log_cap
}

// ----------------------------------------------------------------------------
// Message Store
// ----------------------------------------------------------------------------

/// Conversation logs and drafts for one device identity slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStore {
    id: MeshDeviceId,
    #[serde(default)]
    my_node_num: Option<NodeNum>,
    #[serde(default)]
    direct: HashMap<String, MessageLog>,
    #[serde(default)]
    broadcast: HashMap<ChannelIndex, MessageLog>,
    #[serde(default)]
    drafts: HashMap<NodeNum, String>,
    /// UI cursor, runtime only
    #[serde(skip)]
    pub active_chat: NodeNum,
    #[serde(skip)]
    pub chat_type: MessageType,
    #[serde(skip, default = "default_log_cap")]
    log_cap: usize,
}

impl MessageStore {
    pub fn new(id: MeshDeviceId) -> Self {
        Self {
            id,
            my_node_num: None,
            direct: HashMap::new(),
            broadcast: HashMap::new(),
            drafts: HashMap::new(),
            active_chat: 0,
            chat_type: MessageType::Broadcast,
            log_cap: default_log_cap(),
        }
    }

    /// Use a per-log cap other than the default
    pub fn with_log_cap(mut self, cap: usize) -> Self {
        self.log_cap = cap;
        self
    }

    pub fn set_log_cap(&mut self, cap: usize) {
        self.log_cap = cap;
    }

    pub fn id(&self) -> MeshDeviceId {
        self.id
    }

    pub fn my_node_num(&self) -> Option<NodeNum> {
        self.my_node_num
    }

    /// Record the own node number without adopting other slots
    pub fn set_my_node_num(&mut self, num: NodeNum) {
        self.my_node_num = Some(num);
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    /// Append or overwrite a message, then trim its log
    pub fn save_message(&mut self, message: Message) {
        let cap = self.log_cap;
        let log = match MessageTarget::of(&message) {
            MessageTarget::Direct { node_a, node_b } => self
                .direct
                .entry(conversation_id(node_a, node_b))
                .or_default(),
            MessageTarget::Broadcast { channel } => self.broadcast.entry(channel).or_default(),
        };
        log.insert(message.message_id, message);

        let evicted = RetentionEvictor::new(cap).trim_map(log, |id, m| (m.date, *id));
        if !evicted.is_empty() {
            debug!("Evicted {} old message(s)", evicted.len());
        }
    }

    /// Update a message's delivery state, defaulting to [`MessageState::Ack`]
    ///
    /// The device can report status for messages this client never stored,
    /// so a miss is reported but changes nothing.
    pub fn set_message_state(
        &mut self,
        target: MessageTarget,
        message_id: u32,
        new_state: Option<MessageState>,
    ) -> Result<MessageState, MessageLookupError> {
        let log_name = target.describe();
        let Some(log) = self.log_mut(target) else {
            warn!("Message state update for missing {}", log_name);
            return Err(MessageLookupError::LogNotFound { log: log_name });
        };
        let Some(message) = log.get_mut(&message_id) else {
            warn!("Message state update for unknown message {} in {}", message_id, log_name);
            return Err(MessageLookupError::MessageNotFound {
                log: log_name,
                message_id,
            });
        };
        let state = new_state.unwrap_or_default();
        message.state = state;
        Ok(state)
    }

    /// Messages of one log, oldest first
    pub fn get_messages(&self, target: MessageTarget) -> Vec<&Message> {
        let Some(log) = self.log(target) else {
            return Vec::new();
        };
        let mut messages: Vec<&Message> = log.values().collect();
        messages.sort_by_key(|m| (m.date, m.message_id));
        messages
    }

    /// Remove one message; an emptied log is removed with it
    pub fn clear_message_by_message_id(
        &mut self,
        target: MessageTarget,
        message_id: u32,
    ) -> Result<Message, MessageLookupError> {
        let log_name = target.describe();
        let Some(log) = self.log_mut(target) else {
            warn!("Message entry {} not found for deletion", log_name);
            return Err(MessageLookupError::LogNotFound { log: log_name });
        };
        let Some(removed) = log.remove(&message_id) else {
            warn!("Message {} not found in {} for deletion", message_id, log_name);
            return Err(MessageLookupError::MessageNotFound {
                log: log_name,
                message_id,
            });
        };
        if log.is_empty() {
            match target {
                MessageTarget::Direct { node_a, node_b } => {
                    self.direct.remove(&conversation_id(node_a, node_b));
                }
                MessageTarget::Broadcast { channel } => {
                    self.broadcast.remove(&channel);
                }
            }
        }
        Ok(removed)
    }

    pub fn delete_all_messages(&mut self) {
        self.direct.clear();
        self.broadcast.clear();
    }

    /// Number of non-empty logs
    pub fn log_count(&self) -> usize {
        self.direct.len() + self.broadcast.len()
    }

    fn log(&self, target: MessageTarget) -> Option<&MessageLog> {
        match target {
            MessageTarget::Direct { node_a, node_b } => {
                self.direct.get(&conversation_id(node_a, node_b))
            }
            MessageTarget::Broadcast { channel } => self.broadcast.get(&channel),
        }
    }

    fn log_mut(&mut self, target: MessageTarget) -> Option<&mut MessageLog> {
        match target {
            MessageTarget::Direct { node_a, node_b } => {
                self.direct.get_mut(&conversation_id(node_a, node_b))
            }
            MessageTarget::Broadcast { channel } => self.broadcast.get_mut(&channel),
        }
    }

    // ------------------------------------------------------------------------
    // Drafts
    // ------------------------------------------------------------------------

    pub fn get_draft(&self, destination: Destination) -> String {
        self.drafts
            .get(&destination.node_num())
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_draft(&mut self, destination: Destination, text: impl Into<String>) {
        self.drafts.insert(destination.node_num(), text.into());
    }

    pub fn clear_draft(&mut self, destination: Destination) {
        self.drafts.remove(&destination.node_num());
    }
}

// ----------------------------------------------------------------------------
// Identity Reconciliation
// ----------------------------------------------------------------------------

/// Result of adopting other stores into a recipient
#[derive(Debug, Clone, PartialEq)]
pub struct MessageReconciliation {
    pub merged: MessageStore,
    pub absorbed: Vec<MeshDeviceId>,
}

/// Adopt logs and drafts from every store sharing the recipient's own node number
///
/// Keys the recipient already holds keep the recipient's log and draft.
pub fn reconcile<'a, I>(recipient: &MessageStore, donors: I) -> MessageReconciliation
where
    I: IntoIterator<Item = &'a MessageStore>,
{
    let mut merged = recipient.clone();
    let mut absorbed = Vec::new();

    let Some(own) = recipient.my_node_num else {
        return MessageReconciliation { merged, absorbed };
    };

    let mut matching: Vec<&MessageStore> = donors
        .into_iter()
        .filter(|d| d.id != recipient.id && d.my_node_num == Some(own))
        .collect();
    matching.sort_by_key(|d| d.id);

    for donor in matching {
        info!("Adopting message store {} into {}", donor.id, recipient.id);
        for (key, log) in &donor.direct {
            merged
                .direct
                .entry(key.clone())
                .or_insert_with(|| log.clone());
        }
        for (channel, log) in &donor.broadcast {
            merged
                .broadcast
                .entry(*channel)
                .or_insert_with(|| log.clone());
        }
        for (dest, draft) in &donor.drafts {
            merged
                .drafts
                .entry(*dest)
                .or_insert_with(|| draft.clone());
        }
        absorbed.push(donor.id);
    }

    MessageReconciliation { merged, absorbed }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
