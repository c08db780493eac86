//! Outbound user actions
//!
//! Each action is sent over the active link first; local state only changes
//! once the device accepted the request. Without an active link every
//! action fails with [`MeshError::NotConnected`] and changes nothing.

use std::sync::Arc;

use meshsync_core::{
    events::{TelemetryKind, Waypoint},
    node::Position,
    types::random_nonzero_u32,
    AdminAction, ChangeKey, DeviceLink, Destination, MeshDeviceId, MeshError, Message,
    MessageState, MessageTarget, MessageType, NodeNum, OutboundText, Result,
};
use tracing::{info, warn};

use crate::manager::ConnectionManager;

impl ConnectionManager {
    fn active_link(&self) -> Result<(Arc<dyn DeviceLink>, MeshDeviceId)> {
        self.session
            .as_ref()
            .map(|s| (s.link.clone(), s.device_id))
            .ok_or(MeshError::NotConnected)
    }

    // ------------------------------------------------------------------------
    // Node actions
    // ------------------------------------------------------------------------

    pub async fn set_favorite(&mut self, node: NodeNum, is_favorite: bool) -> Result<()> {
        let (link, device_id) = self.active_link()?;
        let action = if is_favorite {
            AdminAction::SetFavoriteNode(node)
        } else {
            AdminAction::RemoveFavoriteNode(node)
        };
        link.send_admin(&action).await?;
        if let Some(db) = self.context.node_db_mut(device_id) {
            db.update_favorite(node, is_favorite);
        }
        self.schedule_flush();
        Ok(())
    }

    pub async fn set_ignored(&mut self, node: NodeNum, is_ignored: bool) -> Result<()> {
        let (link, device_id) = self.active_link()?;
        let action = if is_ignored {
            AdminAction::SetIgnoredNode(node)
        } else {
            AdminAction::RemoveIgnoredNode(node)
        };
        link.send_admin(&action).await?;
        if let Some(db) = self.context.node_db_mut(device_id) {
            db.update_ignore(node, is_ignored);
        }
        self.schedule_flush();
        Ok(())
    }

    /// Ask the device to forget a node, then drop it and its error locally
    pub async fn remove_node(&mut self, node: NodeNum) -> Result<()> {
        let (link, device_id) = self.active_link()?;
        link.send_admin(&AdminAction::RemoveNodeByNum(node)).await?;
        if let Some(db) = self.context.node_db_mut(device_id) {
            db.remove_node(node);
        }
        self.schedule_flush();
        Ok(())
    }

    /// Queue a fixed position as a pending admin message for the next save
    pub fn set_fixed_position(&mut self, position: Position) -> Result<ChangeKey> {
        let (_, device_id) = self.active_link()?;
        let now = self.now();
        let device = self
            .context
            .device_mut(device_id)
            .ok_or(MeshError::UnknownDevice(device_id))?;
        let key = device
            .change_registry_mut()
            .queue_admin_message(AdminAction::SetFixedPosition(position), now)?;
        self.schedule_flush();
        Ok(key)
    }

    /// Send an admin action immediately
    pub async fn send_admin_message(&mut self, action: AdminAction) -> Result<()> {
        let (link, _) = self.active_link()?;
        link.send_admin(&action).await
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Send a text and track its delivery in the message store
    ///
    /// The message is stored as `Waiting` before the send and settles to
    /// `Ack` or `Failed`. Returns the packet id.
    pub async fn send_text(
        &mut self,
        text: impl Into<String>,
        destination: Destination,
        channel: u8,
    ) -> Result<u32> {
        let (link, device_id) = self.active_link()?;
        let own = self
            .context
            .message_store(device_id)
            .and_then(|store| store.my_node_num())
            .unwrap_or_default();

        let outbound = OutboundText {
            id: random_nonzero_u32(),
            text: text.into(),
            destination,
            channel,
            want_ack: true,
        };
        let message = Message {
            message_id: outbound.id,
            from: own,
            to: destination.node_num(),
            channel,
            message_type: match destination {
                Destination::Broadcast => MessageType::Broadcast,
                Destination::Node(_) => MessageType::Direct,
            },
            date: self.now(),
            state: MessageState::Waiting,
            message: outbound.text.clone(),
        };
        let target = MessageTarget::of(&message);
        if let Some(store) = self.context.message_store_mut(device_id) {
            store.save_message(message);
        }

        let outcome = link.send_text(&outbound).await;
        let state = match &outcome {
            Ok(()) => MessageState::Ack,
            Err(err) => {
                warn!("Sending message {} failed: {}", outbound.id, err);
                MessageState::Failed
            }
        };
        if let Some(store) = self.context.message_store_mut(device_id) {
            // An eviction between save and settle is not an error here
            let _ = store.set_message_state(target, outbound.id, Some(state));
        }
        self.schedule_flush();
        outcome.map(|()| outbound.id)
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    pub async fn request_node_info(&mut self, node: NodeNum) -> Result<()> {
        let (link, _) = self.active_link()?;
        link.request_node_info(node).await
    }

    pub async fn request_telemetry(&mut self, node: NodeNum, kind: TelemetryKind) -> Result<()> {
        let (link, _) = self.active_link()?;
        link.request_telemetry(node, kind).await
    }

    // ------------------------------------------------------------------------
    // Waypoints
    // ------------------------------------------------------------------------

    /// Remove a waypoint locally, optionally broadcasting its deletion
    ///
    /// The deletion goes out on the channel the waypoint was heard on.
    pub async fn remove_waypoint(&mut self, id: u32, to_mesh: bool) -> Result<()> {
        let (link, device_id) = self.active_link()?;
        if to_mesh {
            let channel = self
                .context
                .device(device_id)
                .and_then(|device| device.get_waypoint(id))
                .map(|record| record.metadata.channel)
                .unwrap_or_default();
            link.send_waypoint(&Waypoint::deletion(id), Destination::Broadcast, channel)
                .await?;
        }
        if let Some(device) = self.context.device_mut(device_id) {
            if device.remove_waypoint(id).is_some() {
                info!("Removed waypoint {}", id);
            }
        }
        self.schedule_flush();
        Ok(())
    }
}
