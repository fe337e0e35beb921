/*!
 * Circuit Description
 * Connection metadata every participant builds the same circuit from
 */

use crate::core::errors::{DataplaneError, DataplaneResult};
use crate::core::limits::MAX_PCONTRIBS;
use crate::core::types::PortOrdinal;
use crate::endpoint::Endpoint;
use serde::{Deserialize, Serialize};

/// How a consumer port set shares the producer's messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// Each message goes to exactly one port, in strict rotation
    #[default]
    RoundRobin,
    /// Every message goes to every port
    Broadcast,
}

/// Ranked endpoints of one port set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSetDescription {
    /// Finalized endpoint of each rank
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub distribution: Distribution,
}

impl PortSetDescription {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            distribution: Distribution::RoundRobin,
        }
    }

    pub fn broadcast(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            distribution: Distribution::Broadcast,
        }
    }
}

/// One producer port set feeding one or more consumer port sets
///
/// Port ordinals number the output ranks first, then every input port in
/// set order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitDescription {
    pub buffer_count: usize,
    pub buffer_size: u64,
    pub output: PortSetDescription,
    pub inputs: Vec<PortSetDescription>,
}

impl CircuitDescription {
    /// Single producer, single consumer
    pub fn point_to_point(
        output: impl Into<String>,
        input: impl Into<String>,
        buffer_count: usize,
        buffer_size: u64,
    ) -> Self {
        Self {
            buffer_count,
            buffer_size,
            output: PortSetDescription::new(vec![output.into()]),
            inputs: vec![PortSetDescription::new(vec![input.into()])],
        }
    }

    pub fn from_json_str(json: &str) -> DataplaneResult<Self> {
        serde_json::from_str(json).map_err(|e| DataplaneError::Config {
            detail: format!("circuit description: {}", e),
        })
    }

    #[inline]
    pub fn output_count(&self) -> usize {
        self.output.endpoints.len()
    }

    pub fn input_count(&self) -> usize {
        self.inputs.iter().map(|set| set.endpoints.len()).sum()
    }

    pub fn port_count(&self) -> usize {
        self.output_count() + self.input_count()
    }

    /// Input ordinals of each consumer set
    pub fn input_ordinals(&self) -> Vec<Vec<PortOrdinal>> {
        let mut next = self.output_count() as PortOrdinal;
        self.inputs
            .iter()
            .map(|set| {
                let ordinals = (next..next + set.endpoints.len() as PortOrdinal).collect();
                next += set.endpoints.len() as PortOrdinal;
                ordinals
            })
            .collect()
    }

    /// Endpoint string hosting a port
    pub fn endpoint_of(&self, ordinal: PortOrdinal) -> Option<&str> {
        let ordinal = ordinal as usize;
        if ordinal < self.output_count() {
            return Some(self.output.endpoints[ordinal].as_str());
        }
        self.inputs
            .iter()
            .flat_map(|set| set.endpoints.iter())
            .nth(ordinal - self.output_count())
            .map(String::as_str)
    }

    pub fn validate(&self) -> DataplaneResult<()> {
        let fail = |detail: String| Err(DataplaneError::Config { detail });

        if self.buffer_count == 0 {
            return fail("circuit needs at least one buffer".into());
        }
        if self.buffer_size == 0 || self.buffer_size > u32::MAX as u64 {
            return fail(format!("buffer size {} out of range", self.buffer_size));
        }
        if self.output.endpoints.is_empty() {
            return fail("circuit needs at least one output port".into());
        }
        if self.output_count() > self.buffer_count {
            return fail(format!(
                "{} output ranks cannot share {} buffers",
                self.output_count(),
                self.buffer_count
            ));
        }
        if self.output_count() > MAX_PCONTRIBS {
            return fail(format!("more than {} output ranks", MAX_PCONTRIBS));
        }
        if self.inputs.is_empty() || self.inputs.iter().any(|set| set.endpoints.is_empty()) {
            return fail("every consumer port set needs at least one port".into());
        }
        if self.input_count() > MAX_PCONTRIBS {
            return fail(format!("more than {} input ports", MAX_PCONTRIBS));
        }
        for endpoint in self
            .output
            .endpoints
            .iter()
            .chain(self.inputs.iter().flat_map(|set| set.endpoints.iter()))
        {
            Endpoint::parse_finalized(endpoint)?;
        }
        Ok(())
    }
}
