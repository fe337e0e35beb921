/*!
 * Worker Port
 * The non-blocking request/advance/send surface a worker loop drives
 */

use super::buffer::BufferHandle;
use super::layout::{BufferMetaData, MetaFlags};
use super::Transport;
use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::types::{CircuitId, PortDirection, PortOrdinal};
use tracing::warn;

/// One port of a circuit as seen by a worker
///
/// Holds at most one buffer at a time. `request()` acquires it, `advance()`
/// (input) or `send()` (output) hands it back to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPort {
    circuit: CircuitId,
    ordinal: PortOrdinal,
    direction: PortDirection,
    current: Option<BufferHandle>,
}

impl WorkerPort {
    pub fn output(circuit: CircuitId, ordinal: PortOrdinal) -> Self {
        Self {
            circuit,
            ordinal,
            direction: PortDirection::Output,
            current: None,
        }
    }

    pub fn input(circuit: CircuitId, ordinal: PortOrdinal) -> Self {
        Self {
            circuit,
            ordinal,
            direction: PortDirection::Input,
            current: None,
        }
    }

    pub fn circuit(&self) -> CircuitId {
        self.circuit
    }

    pub fn ordinal(&self) -> PortOrdinal {
        self.ordinal
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    /// Buffer currently held, if any
    pub fn buffer(&self) -> Option<&BufferHandle> {
        self.current.as_ref()
    }

    /// Acquire a buffer; `false` means none is ready yet
    pub fn request(&mut self, transport: &mut Transport) -> DataplaneResult<bool> {
        if self.current.is_some() {
            return Ok(true);
        }
        self.current = match self.direction {
            PortDirection::Output => transport.next_empty_output_buffer(self.circuit, self.ordinal)?,
            PortDirection::Input => transport.next_full_input_buffer(self.circuit, self.ordinal)?,
        };
        Ok(self.current.is_some())
    }

    fn held(&self) -> DataplaneResult<&BufferHandle> {
        self.current.as_ref().ok_or_else(|| {
            DataplaneError::invalid_state(format!(
                "port {} of circuit {} holds no buffer",
                self.ordinal, self.circuit
            ))
        })
    }

    /// Copy `data` into the held output buffer
    pub fn write(&self, transport: &Transport, data: &[u8]) -> DataplaneResult<()> {
        if self.direction != PortDirection::Output {
            return Err(DataplaneError::invalid_state("cannot write into an input buffer"));
        }
        transport.write_buffer(self.held()?, data)
    }

    /// Payload of the held buffer
    pub fn read(&self, transport: &Transport) -> DataplaneResult<Vec<u8>> {
        transport.read_buffer(self.held()?)
    }

    pub fn metadata(&self, transport: &Transport) -> DataplaneResult<BufferMetaData> {
        transport.buffer_metadata(self.held()?)
    }

    /// Send the held output buffer
    pub fn send(&mut self, transport: &mut Transport, length: u64, opcode: u32) -> DataplaneResult<()> {
        self.send_with_flags(transport, length, opcode, MetaFlags::empty())
    }

    pub fn send_with_flags(
        &mut self,
        transport: &mut Transport,
        length: u64,
        opcode: u32,
        flags: MetaFlags,
    ) -> DataplaneResult<()> {
        if self.direction != PortDirection::Output {
            return Err(DataplaneError::invalid_state("cannot send an input buffer"));
        }
        let handle = self.held()?.clone();
        transport.send_output_buffer(&handle, length, opcode, flags)?;
        self.current = None;
        Ok(())
    }

    /// Consume the held input buffer and try to acquire the next one
    pub fn advance(&mut self, transport: &mut Transport) -> DataplaneResult<bool> {
        if self.direction != PortDirection::Input {
            return Err(DataplaneError::invalid_state("advance is for input ports"));
        }
        if let Some(handle) = self.current.take() {
            transport.input_available(&handle)?;
        }
        self.request(transport)
    }

    /// Detach the held input buffer without consuming it and request the next
    ///
    /// The returned buffer must later be consumed with
    /// [`Transport::input_available`]. If the buffer cannot be detached the
    /// port keeps holding it. Once detached it is always returned; a failed
    /// follow-up request shows up again on the next `request()`.
    pub fn take(&mut self, transport: &mut Transport) -> DataplaneResult<Option<BufferHandle>> {
        if self.direction != PortDirection::Input {
            return Err(DataplaneError::invalid_state("take is for input ports"));
        }
        let Some(handle) = self.current.take() else {
            return Ok(None);
        };
        if let Err(e) = transport.take_input_buffer(&handle) {
            self.current = Some(handle);
            return Err(e);
        }
        if let Err(e) = self.request(transport) {
            warn!(
                circuit = self.circuit,
                port = self.ordinal,
                "Request after take failed: {}",
                e
            );
        }
        Ok(Some(handle))
    }

    /// Drop the held buffer without forwarding it
    ///
    /// An output buffer goes back to the empty pool; an input buffer is
    /// consumed.
    pub fn release(&mut self, transport: &mut Transport) -> DataplaneResult<()> {
        let Some(handle) = self.current.take() else {
            return Ok(());
        };
        match self.direction {
            PortDirection::Output => transport.release_output_buffer(&handle),
            PortDirection::Input => transport.input_available(&handle),
        }
    }
}
