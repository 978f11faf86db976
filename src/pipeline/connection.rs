// SPDX-License-Identifier: GPL-3.0-only

//! Tunnelled connections between stages
//!
//! A [`Connection`] is created disabled, enabled straight away, and on
//! drop disabled before it is destroyed. If disabling fails the handle
//! is leaked rather than destroyed while data may still flow through it.

use crate::backends::mmal::{ComponentKind, ConnectionId, MmalHal, PortId};
use crate::errors::{ConstructionStep, PipelineError, PipelineResult};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Connection {
    hal: Arc<dyn MmalHal>,
    id: ConnectionId,
    output: PortId,
    input: PortId,
}

impl Connection {
    /// Tunnel `output` into `input` and enable the tunnel
    ///
    /// `stage` is the downstream component, used in error reports.
    pub fn connect(
        hal: &Arc<dyn MmalHal>,
        stage: ComponentKind,
        output: PortId,
        input: PortId,
    ) -> PipelineResult<Self> {
        let id = hal
            .connection_create(output, input)
            .map_err(|e| PipelineError::construction(stage, ConstructionStep::Connect, e))?;

        if let Err(e) = hal.connection_enable(id) {
            if let Err(destroy_err) = hal.connection_destroy(id) {
                warn!(error = %destroy_err, "Failed to destroy connection after enable failure");
            }
            return Err(PipelineError::construction(stage, ConstructionStep::Connect, e));
        }

        debug!(output = %output, input = %input, "Connection enabled");
        Ok(Self {
            hal: Arc::clone(hal),
            id,
            output,
            input,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.hal.connection_is_enabled(self.id)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.hal.connection_is_enabled(self.id)
            && let Err(e) = self.hal.connection_disable(self.id)
        {
            warn!(output = %self.output, input = %self.input, error = %e, "Failed to disable connection");
        }

        if self.hal.connection_is_enabled(self.id) {
            warn!(output = %self.output, input = %self.input, "Connection still enabled, not destroying it");
            return;
        }

        match self.hal.connection_destroy(self.id) {
            Ok(()) => debug!(output = %self.output, input = %self.input, "Connection destroyed"),
            Err(e) => warn!(error = %e, "Failed to destroy connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::{FailPoint, SimulatedHardware};

    fn camera_and_splitter(hal: &Arc<dyn MmalHal>) -> (PortId, PortId) {
        let camera = hal.component_create(ComponentKind::Camera).unwrap();
        let splitter = hal.component_create(ComponentKind::Splitter).unwrap();
        let video = camera.output(1).unwrap();
        let input = splitter.input(0).unwrap();
        let format = hal.port_format(video).unwrap();
        hal.port_format_commit(input, &format).unwrap();
        (video, input)
    }

    #[test]
    fn test_connect_and_drop() {
        let sim = Arc::new(SimulatedHardware::new());
        let hal: Arc<dyn MmalHal> = sim.clone();
        let (video, input) = camera_and_splitter(&hal);

        let connection = Connection::connect(&hal, ComponentKind::Splitter, video, input).unwrap();
        assert!(connection.is_enabled());
        assert_eq!(sim.live_connections(), 1);

        drop(connection);
        assert_eq!(sim.live_connections(), 0);
    }

    #[test]
    fn test_enable_failure_destroys_connection() {
        let sim = Arc::new(SimulatedHardware::new());
        let hal: Arc<dyn MmalHal> = sim.clone();
        let (video, input) = camera_and_splitter(&hal);

        sim.fail_on(FailPoint::ConnectionEnable);
        let result = Connection::connect(&hal, ComponentKind::Splitter, video, input);
        assert!(matches!(
            result,
            Err(PipelineError::Construction {
                stage: ComponentKind::Splitter,
                step: ConstructionStep::Connect,
                ..
            })
        ));
        assert_eq!(sim.live_connections(), 0);
    }
}
