//! Inbound Event Dispatch
//!
//! Routes each decoded device event to exactly one store mutation on the
//! session's identity slot. Lifecycle events (configure complete, link
//! closed) belong to the connection manager and are handed back untouched.

use meshsync_core::{
    device::UnreadKey,
    events::{DeviceEvent, PacketMeta, Routing, RoutingError},
    message_store::{Message, MessageState, MessageType},
    node_db::NodeErrorKind,
    types::{node_id_string, MeshDeviceId, Timestamp},
    MeshContext,
};
use tracing::{debug, error, warn};

/// What happened to a dispatched event
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A store was updated
    Applied,
    /// The slot was missing a store the event needs
    Dropped,
    /// A lifecycle event the connection manager must handle
    Lifecycle(DeviceEvent),
}

/// Stateless event router
pub struct EventDispatcher;

impl EventDispatcher {
    /// Apply one inbound event to the stores of `slot`
    pub fn dispatch(
        ctx: &mut MeshContext,
        slot: MeshDeviceId,
        event: DeviceEvent,
        now: Timestamp,
    ) -> DispatchOutcome {
        debug!("Dispatching {} for device {}", event.name(), slot);

        match event {
            DeviceEvent::ConfigComplete { .. } | DeviceEvent::Closed { .. } => {
                DispatchOutcome::Lifecycle(event)
            }

            DeviceEvent::MyNodeInfo(info) => {
                ctx.apply_my_node_info(slot, info, now);
                DispatchOutcome::Applied
            }

            DeviceEvent::Routing(packet) => {
                Self::handle_routing(ctx, slot, packet);
                DispatchOutcome::Applied
            }

            DeviceEvent::Message(packet) => Self::handle_message(ctx, slot, packet),

            DeviceEvent::Telemetry(packet) => Self::with_node_db(ctx, slot, |db| {
                db.set_metrics(packet.from, packet.data)
            }),
            DeviceEvent::User(packet) => Self::with_node_db(ctx, slot, |db| {
                db.add_user(packet.from, packet.data);
            }),
            DeviceEvent::Position(packet) => Self::with_node_db(ctx, slot, |db| {
                db.add_position(packet.from, packet.data)
            }),
            DeviceEvent::NodeInfo(node) => Self::with_node_db(ctx, slot, |db| {
                db.add_node(node);
            }),
            DeviceEvent::MeshPacket(info) => Self::with_node_db(ctx, slot, |db| {
                db.process_packet(info, now)
            }),

            DeviceEvent::Metadata(metadata) => {
                Self::with_device(ctx, slot, |device| device.add_metadata(metadata))
            }
            DeviceEvent::DeviceStatus(status) => {
                Self::with_device(ctx, slot, |device| device.set_status(status))
            }
            DeviceEvent::Waypoint(packet) => Self::with_device(ctx, slot, |device| {
                device.add_waypoint(packet.data, packet.channel, packet.from, packet.rx_time, now)
            }),
            DeviceEvent::Channel(channel) => {
                Self::with_device(ctx, slot, |device| device.add_channel(channel))
            }
            DeviceEvent::Config(section) => Self::with_device(ctx, slot, |device| {
                device.set_config(section.variant, section.value)
            }),
            DeviceEvent::ModuleConfig(section) => Self::with_device(ctx, slot, |device| {
                device.set_module_config(section.variant, section.value)
            }),
            DeviceEvent::TraceRoute(packet) => {
                Self::with_device(ctx, slot, |device| device.add_trace_route(packet))
            }
            DeviceEvent::PendingSettings(pending) => Self::with_device(ctx, slot, |device| {
                device.set_pending_settings_changes(pending)
            }),
            DeviceEvent::ClientNotification(notification) => {
                Self::with_device(ctx, slot, |device| {
                    device.add_client_notification(notification)
                })
            }
            DeviceEvent::NeighborInfo(packet) => Self::with_device(ctx, slot, |device| {
                device.add_neighbor_info(packet.from, packet.data)
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    fn handle_routing(ctx: &mut MeshContext, slot: MeshDeviceId, packet: PacketMeta<Routing>) {
        match packet.data {
            Routing::ErrorReason(RoutingError::None) => {}
            Routing::ErrorReason(reason) => {
                error!(
                    "Routing error {:?} for packet {} from {}",
                    reason,
                    packet.id,
                    node_id_string(packet.from)
                );
                if reason.marks_node() {
                    if let Some(db) = ctx.node_db_mut(slot) {
                        db.set_node_error(packet.from, NodeErrorKind::Routing(reason));
                    }
                }
            }
            Routing::RouteRequest(route) => {
                debug!("Route request from {}: {:?}", node_id_string(packet.from), route.route)
            }
            Routing::RouteReply(route) => {
                debug!("Route reply from {}: {:?}", node_id_string(packet.from), route.route)
            }
        }
    }

    fn handle_message(
        ctx: &mut MeshContext,
        slot: MeshDeviceId,
        packet: PacketMeta<String>,
    ) -> DispatchOutcome {
        let Some(store) = ctx.message_store_mut(slot) else {
            warn!("No message store for device {}", slot);
            return DispatchOutcome::Dropped;
        };
        let own = store.my_node_num();
        let broadcast = packet.is_broadcast();
        let (from, channel) = (packet.from, packet.channel);

        store.save_message(Message {
            message_id: packet.id,
            from: packet.from,
            to: packet.to,
            channel: packet.channel,
            message_type: if broadcast {
                MessageType::Broadcast
            } else {
                MessageType::Direct
            },
            date: packet.rx_time,
            state: MessageState::Ack,
            message: packet.data,
        });

        let unread_key = match (broadcast, own) {
            (false, Some(own)) if packet.to == own => Some(UnreadKey::Node(from)),
            (true, own) if own != Some(from) => Some(UnreadKey::Channel(channel)),
            _ => None,
        };
        if let (Some(key), Some(device)) = (unread_key, ctx.device_mut(slot)) {
            device.increment_unread(key);
        }
        DispatchOutcome::Applied
    }

    fn with_node_db<F>(ctx: &mut MeshContext, slot: MeshDeviceId, apply: F) -> DispatchOutcome
    where
        F: FnOnce(&mut meshsync_core::NodeDatabase),
    {
        match ctx.node_db_mut(slot) {
            Some(db) => {
                apply(db);
                DispatchOutcome::Applied
            }
            None => {
                warn!("No node database for device {}", slot);
                DispatchOutcome::Dropped
            }
        }
    }

    fn with_device<F>(ctx: &mut MeshContext, slot: MeshDeviceId, apply: F) -> DispatchOutcome
    where
        F: FnOnce(&mut meshsync_core::DeviceRecord),
    {
        match ctx.device_mut(slot) {
            Some(device) => {
                apply(device);
                DispatchOutcome::Applied
            }
            None => {
                warn!("No device record for device {}", slot);
                DispatchOutcome::Dropped
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::{
        events::{MyNodeInfo, Telemetry},
        message_store::MessageTarget,
        node::DeviceMetrics,
        types::BROADCAST_NUM,
        MeshConfig,
    };

    const OWN: u32 = 0x0a0b0c0d;

    fn create_test_context() -> (MeshContext, MeshDeviceId) {
        let mut ctx = MeshContext::new(MeshConfig::testing());
        let slot = MeshDeviceId::new(1);
        ctx.bind_slot(slot, Timestamp::new(1));
        EventDispatcher::dispatch(
            &mut ctx,
            slot,
            DeviceEvent::MyNodeInfo(MyNodeInfo {
                my_node_num: OWN,
                ..MyNodeInfo::default()
            }),
            Timestamp::new(1),
        );
        (ctx, slot)
    }

    fn packet<T>(id: u32, from: u32, to: u32, data: T) -> PacketMeta<T> {
        PacketMeta {
            id,
            from,
            to,
            channel: 2,
            rx_time: Timestamp::new(5_000),
            data,
        }
    }

    #[test]
    fn test_direct_message_counts_unread_by_sender() {
        let (mut ctx, slot) = create_test_context();
        let outcome = EventDispatcher::dispatch(
            &mut ctx,
            slot,
            DeviceEvent::Message(packet(1, 42, OWN, "hi".to_string())),
            Timestamp::new(2),
        );
        assert_eq!(outcome, DispatchOutcome::Applied);

        let messages = ctx
            .message_store(slot)
            .unwrap()
            .get_messages(MessageTarget::Direct { node_a: OWN, node_b: 42 });
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::Direct);
        assert_eq!(ctx.device(slot).unwrap().get_unread_count(UnreadKey::Node(42)), 1);
    }

    #[test]
    fn test_broadcast_unread_skips_own_messages() {
        let (mut ctx, slot) = create_test_context();
        for (id, from) in [(1, 42), (2, OWN), (3, 43)] {
            EventDispatcher::dispatch(
                &mut ctx,
                slot,
                DeviceEvent::Message(packet(id, from, BROADCAST_NUM, "all".to_string())),
                Timestamp::new(2),
            );
        }
        let device = ctx.device(slot).unwrap();
        assert_eq!(device.get_unread_count(UnreadKey::Channel(2)), 2);
        assert_eq!(device.get_unread_count(UnreadKey::Node(2)), 0);
        assert_eq!(device.get_all_unread_count(), 2);
    }

    #[test]
    fn test_routing_errors_mark_sender() {
        let (mut ctx, slot) = create_test_context();
        for (from, reason) in [
            (7, RoutingError::NoChannel),
            (8, RoutingError::MaxRetransmit),
            (9, RoutingError::PkiUnknownPubkey),
            (10, RoutingError::None),
        ] {
            EventDispatcher::dispatch(
                &mut ctx,
                slot,
                DeviceEvent::Routing(packet(1, from, OWN, Routing::ErrorReason(reason))),
                Timestamp::new(2),
            );
        }
        let db = ctx.node_db(slot).unwrap();
        assert_eq!(
            db.get_node_error(7).map(|e| e.error.clone()),
            Some(NodeErrorKind::Routing(RoutingError::NoChannel))
        );
        assert!(!db.has_node_error(8));
        assert!(db.has_node_error(9));
        assert!(!db.has_node_error(10));
    }

    #[test]
    fn test_telemetry_for_unknown_node_is_ignored() {
        let (mut ctx, slot) = create_test_context();
        let metrics = Telemetry::DeviceMetrics(DeviceMetrics::default());
        EventDispatcher::dispatch(
            &mut ctx,
            slot,
            DeviceEvent::Telemetry(packet(1, 99, OWN, metrics)),
            Timestamp::new(2),
        );
        assert!(ctx.node_db(slot).unwrap().get_node(99).is_none());
    }

    #[test]
    fn test_lifecycle_events_are_returned() {
        let (mut ctx, slot) = create_test_context();
        let outcome = EventDispatcher::dispatch(
            &mut ctx,
            slot,
            DeviceEvent::ConfigComplete { id: 9 },
            Timestamp::new(2),
        );
        assert_eq!(outcome, DispatchOutcome::Lifecycle(DeviceEvent::ConfigComplete { id: 9 }));
    }

    #[test]
    fn test_missing_slot_drops_event() {
        let mut ctx = MeshContext::new(MeshConfig::testing());
        let outcome = EventDispatcher::dispatch(
            &mut ctx,
            MeshDeviceId::new(77),
            DeviceEvent::PendingSettings(true),
            Timestamp::new(2),
        );
        assert_eq!(outcome, DispatchOutcome::Dropped);
    }
}
