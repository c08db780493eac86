//! Property-based tests for message store invariants
//!
//! These tests verify conversation identity, per-log retention and the
//! no-op behavior of delivery updates for unknown messages.

use meshsync_core::{
    events::Destination,
    message_store::{conversation_id, Message, MessageState, MessageStore, MessageTarget, MessageType},
    types::{MeshDeviceId, NodeNum, Timestamp, BROADCAST_NUM},
};
use proptest::prelude::*;

fn arb_message(from: NodeNum, to: NodeNum) -> impl Strategy<Value = Message> {
    (any::<u32>(), 0u64..10_000_000, "[a-z ]{1,40}").prop_map(move |(id, date, text)| Message {
        message_id: id,
        from,
        to,
        channel: 0,
        message_type: if to == BROADCAST_NUM {
            MessageType::Broadcast
        } else {
            MessageType::Direct
        },
        date: Timestamp::new(date),
        state: MessageState::Ack,
        message: text,
    })
}

proptest! {
    /// Property: conversation identity ignores participant order
    #[test]
    fn conversation_id_is_symmetric(a in any::<u32>(), b in any::<u32>()) {
        prop_assert_eq!(conversation_id(a, b), conversation_id(b, a));
    }

    /// Property: no log ever grows past its cap
    #[test]
    fn log_never_exceeds_cap(
        cap in 1usize..20,
        messages in prop::collection::vec(arb_message(7, BROADCAST_NUM), 0..60),
    ) {
        let mut store = MessageStore::new(MeshDeviceId::new(1)).with_log_cap(cap);
        for message in messages {
            store.save_message(message);
            let len = store.get_messages(MessageTarget::Broadcast { channel: 0 }).len();
            prop_assert!(len <= cap);
        }
    }

    /// Property: the newest messages survive eviction
    #[test]
    fn eviction_drops_oldest(messages in prop::collection::vec(arb_message(7, 9), 1..40)) {
        let cap = 5;
        let mut store = MessageStore::new(MeshDeviceId::new(1)).with_log_cap(cap);
        let mut unique: Vec<Message> = Vec::new();
        for message in messages {
            if unique.iter().any(|m| m.message_id == message.message_id) {
                continue;
            }
            unique.push(message.clone());
            store.save_message(message);
        }
        unique.sort_by_key(|m| (m.date, m.message_id));
        let expected: Vec<u32> = unique
            .iter()
            .skip(unique.len().saturating_sub(cap))
            .map(|m| m.message_id)
            .collect();

        let kept: Vec<u32> = store
            .get_messages(MessageTarget::Direct { node_a: 9, node_b: 7 })
            .iter()
            .map(|m| m.message_id)
            .collect();
        prop_assert_eq!(kept, expected);
    }

    /// Property: a delivery update for an unknown id never creates a message
    #[test]
    fn unknown_state_update_is_noop(
        messages in prop::collection::vec(arb_message(3, 4), 0..10),
        missing in any::<u32>(),
    ) {
        let mut store = MessageStore::new(MeshDeviceId::new(1));
        for message in messages.iter().cloned() {
            store.save_message(message);
        }
        prop_assume!(messages.iter().all(|m| m.message_id != missing));
        let target = MessageTarget::Direct { node_a: 3, node_b: 4 };
        let before = store.get_messages(target).len();

        prop_assert!(store.set_message_state(target, missing, Some(MessageState::Failed)).is_err());
        prop_assert_eq!(store.get_messages(target).len(), before);
    }

    /// Property: drafts are addressed by destination only
    #[test]
    fn drafts_round_trip(node in 1u32..1000, text in "[a-z]{1,20}") {
        let mut store = MessageStore::new(MeshDeviceId::new(1));
        store.set_draft(Destination::Node(node), text.clone());
        prop_assert_eq!(store.get_draft(Destination::Node(node)), text);
        prop_assert_eq!(store.get_draft(Destination::Broadcast), "");
        store.clear_draft(Destination::Node(node));
        prop_assert_eq!(store.get_draft(Destination::Node(node)), "");
    }
}
