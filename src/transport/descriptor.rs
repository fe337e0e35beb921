/*!
 * Buffer Descriptors
 * Serializable summary of a real port's memory, handed to peers for identification
 */

use super::layout::{BufferMetaData, BufferState};
use super::port::Port;
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::limits::MAX_PCONTRIBS;
use crate::core::types::{CircuitId, Offset, PortDirection, PortOrdinal};
use serde::{Deserialize, Serialize};

/// Flow-control role of the port owning the descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorRole {
    ActiveFlowControl,
}

/// Location and value of one family of flag words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagDescriptor {
    pub base: Offset,
    pub size: u64,
    pub pitch: u64,
    pub value: u64,
}

/// Out-of-band identification; never used for addressing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OobDescriptor {
    pub port_id: PortOrdinal,
    pub endpoint: String,
    pub cookie: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub role: DescriptorRole,
    pub direction: PortDirection,
    pub buffer_count: usize,
    pub data_base: Offset,
    pub data_pitch: u64,
    pub data_size: u64,
    pub meta_base: Offset,
    pub meta_pitch: u64,
    pub full_flag: FlagDescriptor,
    pub empty_flag: FlagDescriptor,
    pub oob: OobDescriptor,
}

impl PortDescriptor {
    /// Describe a real port; shadows own no buffers and have no descriptor
    pub fn from_port(circuit: CircuitId, port: &Port) -> Option<Self> {
        if !port.is_real() || !port.is_allocated() {
            return None;
        }
        let layout = port.layout();
        let flags = port.flags();

        let (full_flag, empty_flag) = if port.direction().is_output() {
            (
                FlagDescriptor {
                    base: port.staging_offset(0, 0),
                    size: BufferState::SIZE,
                    pitch: layout.state_pitch,
                    value: flags.full(),
                },
                FlagDescriptor {
                    base: port.state_offset(0, 0),
                    size: BufferState::SIZE,
                    pitch: layout.state_pitch,
                    value: flags.shadow_empty(),
                },
            )
        } else {
            (
                FlagDescriptor {
                    base: port.state_offset(0, 0),
                    size: BufferState::SIZE,
                    pitch: layout.state_pitch,
                    value: flags.full(),
                },
                // Every buffer signals empty from the same source word
                FlagDescriptor {
                    base: layout.flag_source,
                    size: BufferState::SIZE,
                    pitch: 0,
                    value: flags.shadow_empty(),
                },
            )
        };

        Some(Self {
            role: DescriptorRole::ActiveFlowControl,
            direction: port.direction(),
            buffer_count: port.buffer_count(),
            data_base: layout.data,
            data_pitch: layout.data_pitch,
            data_size: port.buffer_size(),
            meta_base: layout.meta,
            meta_pitch: BufferMetaData::SIZE * MAX_PCONTRIBS as u64,
            full_flag,
            empty_flag,
            oob: OobDescriptor {
                port_id: port.ordinal(),
                endpoint: port.smb().key().to_string(),
                cookie: circuit as u64,
            },
        })
    }

    pub fn to_json(&self) -> DataplaneResult<String> {
        serde_json::to_string(self).map_err(|e| DataplaneError::api("descriptor_to_json", e))
    }

    pub fn from_json(json: &str) -> DataplaneResult<Self> {
        serde_json::from_str(json).map_err(|e| DataplaneError::api("descriptor_from_json", e))
    }
}
