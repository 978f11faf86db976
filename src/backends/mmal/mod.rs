// SPDX-License-Identifier: GPL-3.0-only

//! Hardware media layer seam
//!
//! The pipeline never touches firmware handles directly. Every component,
//! port, pool and connection call goes through [`MmalHal`], which a real
//! firmware binding or the [`SimulatedHardware`](crate::backends::simulated::SimulatedHardware)
//! implements.

pub mod types;

pub use types::*;

/// Hardware media layer
///
/// Implementations must tolerate calls from the pipeline thread and from
/// their own delivery threads at the same time: port callbacks recycle
/// buffers through [`MmalHal::port_send_buffer`] while the owner may be
/// disabling the very same port.
pub trait MmalHal: Send + Sync {
    // ===== Ownership =====

    /// Take exclusive ownership of the hardware
    ///
    /// Fails with [`HalError::Busy`] while another pipeline holds it.
    fn claim(&self) -> HalResult<()>;

    /// Give up ownership taken with [`MmalHal::claim`]
    fn unclaim(&self);

    // ===== Components =====

    fn component_create(&self, kind: ComponentKind) -> HalResult<ComponentInfo>;

    fn component_enable(&self, id: ComponentId) -> HalResult<()>;

    fn component_disable(&self, id: ComponentId) -> HalResult<()>;

    /// Destroy a component
    ///
    /// Rejected while a connection, pool or enabled callback still
    /// references one of its ports.
    fn component_destroy(&self, id: ComponentId) -> HalResult<()>;

    fn component_is_enabled(&self, id: ComponentId) -> bool;

    // ===== Ports =====

    /// Current format of a port
    fn port_format(&self, port: PortId) -> HalResult<EsFormat>;

    /// Commit a new format; the port must be disabled
    fn port_format_commit(&self, port: PortId, format: &EsFormat) -> HalResult<()>;

    /// Buffer needs reported by the port for its committed format
    fn port_buffer_requirements(&self, port: PortId) -> HalResult<BufferRequirements>;

    /// Configure buffer count and size
    fn port_set_buffers(&self, port: PortId, config: BufferConfig) -> HalResult<()>;

    /// Enable a port, delivering its filled buffers to `callback`
    fn port_enable(&self, port: PortId, callback: PortCallback) -> HalResult<()>;

    /// Disable a port
    ///
    /// Buffers still queued on the port are returned empty through the
    /// callback before this returns, and no callback runs afterwards.
    fn port_disable(&self, port: PortId) -> HalResult<()>;

    fn port_is_enabled(&self, port: PortId) -> bool;

    /// Queue an empty buffer for the port to fill
    ///
    /// On failure the header is handed back so the caller can return it
    /// to its pool.
    fn port_send_buffer(
        &self,
        port: PortId,
        buffer: BufferHeader,
    ) -> Result<(), (BufferHeader, HalError)>;

    fn port_parameter_set(&self, port: PortId, parameter: &Parameter) -> HalResult<()>;

    // ===== Pools =====

    /// Allocate `num` headers of `size` bytes for a port
    fn pool_create(
        &self,
        port: PortId,
        num: u32,
        size: u32,
    ) -> HalResult<(PoolId, Vec<BufferHeader>)>;

    /// Free a pool; the port must be disabled
    ///
    /// `buffers` are the headers the caller got back; any header missing
    /// from the set is reported as leaked.
    fn pool_destroy(&self, pool: PoolId, buffers: Vec<BufferHeader>) -> HalResult<()>;

    // ===== Connections =====

    /// Tunnel `output` into `input`; the connection starts disabled
    fn connection_create(&self, output: PortId, input: PortId) -> HalResult<ConnectionId>;

    fn connection_enable(&self, id: ConnectionId) -> HalResult<()>;

    fn connection_disable(&self, id: ConnectionId) -> HalResult<()>;

    /// Destroy a connection; rejected while it is enabled
    fn connection_destroy(&self, id: ConnectionId) -> HalResult<()>;

    fn connection_is_enabled(&self, id: ConnectionId) -> bool;
}
