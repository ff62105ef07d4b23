//! Optional message compression capability
//!
//! The engine only ever asks for a compartment, tells the compressor
//! whether a compressed message was accepted, and closes or zaps the
//! compartment when the owning transaction goes away. Without a
//! compressor everything is sent uncompressed.

use crate::kind::Destination;

/// Opaque compartment handle issued by a [`Compressor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompartmentId(pub u64);

/// Compression capability injected into the engine
pub trait Compressor: Send {
    /// Compartment for a destination, creating it if the compressor wants one
    fn compartment(&mut self, destination: &Destination) -> Option<CompartmentId>;

    /// Signal that a message received in the compartment was accepted
    fn accept_compressed(&mut self, compartment: CompartmentId) -> bool;

    /// Graceful close once no transaction references the compartment
    fn close(&mut self, compartment: CompartmentId);

    /// Discard compartment state immediately
    fn zap(&mut self, compartment: CompartmentId);
}

/// Default compressor: never creates compartments
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compartment(&mut self, _destination: &Destination) -> Option<CompartmentId> {
        None
    }

    fn accept_compressed(&mut self, _compartment: CompartmentId) -> bool {
        false
    }

    fn close(&mut self, _compartment: CompartmentId) {}

    fn zap(&mut self, _compartment: CompartmentId) {}
}
