//! Binary input/state codec for shipping tracking work units to a remote
//! compute backend.
//!
//! Everything the backend touches is a fixed-layout, version-gated byte
//! buffer: the [`input::SimInput`] it consumes, the [`state::SimState`] it
//! checkpoints and finally hands back. The codec is stateless and safe to
//! drive concurrently on independent buffers; all coordination lives in the
//! queue crate on top.

pub mod buffer;
pub mod elements;
pub mod input;
pub mod particles;
pub mod state;
pub mod tracker;
pub mod version;

pub use buffer::DecodeError;
pub use elements::{Element, ElementKind, LineMetadata};
pub use input::{InputBuilder, Place, SimInput, ValidationError};
pub use particles::ParticleSet;
pub use state::SimState;
pub use tracker::Tracker;
pub use version::{app_version, SimVersion, VersionError};
