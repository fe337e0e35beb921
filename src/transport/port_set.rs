/*!
 * Port Sets
 * The ports on one side of a circuit and, for consumers, their distribution policy
 */

use super::controller::TransferController;
use crate::core::types::{PortDirection, PortOrdinal};

#[derive(Debug, Clone)]
pub struct PortSet {
    index: usize,
    direction: PortDirection,
    ordinals: Vec<PortOrdinal>,
    controller: Option<TransferController>,
}

impl PortSet {
    /// The producer set; there is exactly one per circuit
    pub fn producer(ordinals: Vec<PortOrdinal>) -> Self {
        Self {
            index: 0,
            direction: PortDirection::Output,
            ordinals,
            controller: None,
        }
    }

    pub fn consumer(index: usize, controller: TransferController) -> Self {
        Self {
            index,
            direction: PortDirection::Input,
            ordinals: controller.inputs().to_vec(),
            controller: Some(controller),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    pub fn ordinals(&self) -> &[PortOrdinal] {
        &self.ordinals
    }

    pub fn contains(&self, ordinal: PortOrdinal) -> bool {
        self.ordinals.contains(&ordinal)
    }

    pub fn controller(&self) -> Option<&TransferController> {
        self.controller.as_ref()
    }

    pub(crate) fn controller_mut(&mut self) -> Option<&mut TransferController> {
        self.controller.as_mut()
    }
}
