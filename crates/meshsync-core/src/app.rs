//! Application-wide settings shared by every connection

use serde::{Deserialize, Serialize};

use crate::types::{MeshDeviceId, NodeNum};

/// Storage key of the settings record in the app collection
pub const APP_SETTINGS_KEY: &str = "settings";

/// A map tile source added by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RasterSource {
    pub enabled: bool,
    pub title: String,
    pub tiles: String,
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
}

fn default_tile_size() -> u32 {
    512
}

/// Application settings persisted under [`APP_SETTINGS_KEY`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub selected_device_id: Option<MeshDeviceId>,
    pub node_num_to_be_removed: NodeNum,
    pub node_num_details: NodeNum,
    pub connect_dialog_open: bool,
    pub command_palette_open: bool,
    pub raster_sources: Vec<RasterSource>,
}

impl AppSettings {
    pub fn set_selected_device(&mut self, id: Option<MeshDeviceId>) {
        self.selected_device_id = id;
    }

    pub fn add_raster_source(&mut self, source: RasterSource) {
        self.raster_sources.push(source);
    }

    /// Replace the source at `index`; out-of-range indices are ignored
    pub fn set_raster_source(&mut self, index: usize, source: RasterSource) -> bool {
        match self.raster_sources.get_mut(index) {
            Some(slot) => {
                *slot = source;
                true
            }
            None => false,
        }
    }

    pub fn remove_raster_source(&mut self, index: usize) -> Option<RasterSource> {
        if index < self.raster_sources.len() {
            Some(self.raster_sources.remove(index))
        } else {
            None
        }
    }
}
