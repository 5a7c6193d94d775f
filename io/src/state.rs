//! Simulation state block, the unit of checkpointing.
//!
//! Layout, all offsets fixed relative to the block start:
//!
//! ```text
//! 0   version fingerprint (32 bytes)
//! 32  i_turn
//! 40  occupied          total occupied byte size of the block
//! 48  monitors_ref      block-relative offset of the monitors metadata
//! 56  particle ensemble, monitors metadata trailing
//! ```
//!
//! `occupied` is recorded because the state is lifted out of a combined
//! input buffer by byte range, never by re-parsing the input. A checkpoint
//! file and a terminal output file are byte-for-byte the same kind of block.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::buffer::{ByteArena, ByteReader, DecodeError};
use crate::elements::LineMetadata;
use crate::particles::ParticleSet;
use crate::version::{SimVersion, VERSION_BYTES};

const OFF_I_TURN: usize = VERSION_BYTES;
const OFF_OCCUPIED: usize = OFF_I_TURN + 8;
const OFF_MONITORS_REF: usize = OFF_OCCUPIED + 8;
/// fixed region before the particle ensemble
pub const STATE_FIXED_BYTES: usize = OFF_MONITORS_REF + 8;

/// Mutable simulation state, always the last region of a combined buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct SimState {
    pub version: SimVersion,
    pub i_turn: i64,
    pub particles: ParticleSet,
    /// monitors-only line metadata, may be empty
    pub monitors: LineMetadata,
}

impl SimState {
    /// fresh state at turn 0 for the given ensemble
    pub fn new(particles: ParticleSet, monitors: LineMetadata) -> Self {
        Self {
            version: SimVersion::CURRENT,
            i_turn: 0,
            particles,
            monitors,
        }
    }

    pub fn encoded_len(&self) -> usize {
        STATE_FIXED_BYTES + self.particles.encoded_len() + self.monitors.encoded_len()
    }

    /// append the block to `arena`, returning its offset
    pub fn encode_into(&self, arena: &mut ByteArena) -> usize {
        let start = arena.alloc(STATE_FIXED_BYTES);
        self.version
            .write_to(arena.slot(start, VERSION_BYTES), 0);
        arena.put_i64(start + OFF_I_TURN, self.i_turn);
        arena.put_i64(start + OFF_OCCUPIED, self.encoded_len() as i64);

        self.particles.encode_into(arena);
        let monitors_ref = arena.used() - start;
        arena.put_i64(start + OFF_MONITORS_REF, monitors_ref as i64);
        self.monitors.encode_into(arena);
        start
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut arena = ByteArena::with_capacity(self.encoded_len());
        self.encode_into(&mut arena);
        arena.into_bytes()
    }

    /// decode a block that spans `buf` exactly
    ///
    /// The version fingerprint is validated before anything else is read.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let version = SimVersion::read_from(buf, 0)?;
        version.assert_current()?;

        let mut reader = ByteReader::new(buf);
        reader.seek("i_turn", OFF_I_TURN as i64)?;
        let i_turn = reader.i64()?;
        let occupied = reader.i64()?;
        if occupied < 0 || occupied as usize != buf.len() {
            return Err(DecodeError::OccupiedMismatch {
                claimed: occupied,
                actual: buf.len(),
            });
        }
        let monitors_ref = reader.i64()?;
        let particles = ParticleSet::decode(&mut reader)?;
        if monitors_ref as usize != reader.pos() {
            return Err(DecodeError::BadRef {
                field: "monitors_ref",
                value: monitors_ref,
                buf: buf.len(),
            });
        }
        let monitors = LineMetadata::decode(&mut reader)?;
        Ok(Self {
            version,
            i_turn,
            particles,
            monitors,
        })
    }

    pub fn to_binary(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        let bytes = self.encode();
        debug!(path = ?path, bytes = bytes.len(), turn = self.i_turn, "writing state");
        fs::write(path, bytes)
    }

    pub fn from_binary(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        debug!(path = ?path, bytes = bytes.len(), "reading state");
        Self::decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::Element;
    use crate::version::pack_version;

    fn sample_state() -> SimState {
        let particles = ParticleSet::from_positions(vec![0.01, -0.02], vec![0.003, 0.0]);
        let monitors = LineMetadata::with_names(
            vec![Element::Monitor {
                start_turn: 0,
                stop_turn: 10,
                id_start: 0,
                id_end: 2,
            }],
            vec!["bpm".into()],
        );
        SimState::new(particles, monitors)
    }

    #[test]
    fn roundtrip_is_byte_exact() {
        let state = sample_state();
        let bytes = state.encode();
        assert_eq!(bytes.len(), state.encoded_len());

        let back = SimState::decode(&bytes).unwrap();
        assert_eq!(back, state);
        // re-encoding an untouched decode reproduces the input buffer
        assert_eq!(back.encode(), bytes);
    }

    #[test]
    fn tampered_version_aborts_before_anything_else() {
        let state = sample_state();
        let mut bytes = state.encode();
        bytes[0..8].copy_from_slice(&pack_version(9, 9, 9).to_le_bytes());
        // also wreck the particle block, a mismatch must win regardless
        let len = bytes.len();
        bytes[len - 1] ^= 0xff;
        assert!(matches!(
            SimState::decode(&bytes),
            Err(DecodeError::Version(_))
        ));
    }

    #[test]
    fn occupied_size_must_match_the_buffer() {
        let state = sample_state();
        let mut bytes = state.encode();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            SimState::decode(&bytes),
            Err(DecodeError::OccupiedMismatch { .. })
        ));
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let state = sample_state();
        state.to_binary(&path).unwrap();
        let back = SimState::from_binary(&path).unwrap();
        assert_eq!(back, state);
    }
}
