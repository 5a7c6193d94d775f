//! Simulation input, the immutable work unit handed to the backend.
//!
//! Layout, fixed region first:
//!
//! ```text
//! 0    version fingerprint (32 bytes)
//! 32   num_turns
//! 40   num_elements
//! 48   ele_start
//! 56   ele_stop
//! 64   checkpoint_every   negative disables checkpointing
//! 72   num_monitors
//! 80   idx_monitors_ref   ┐
//! 88   size_monitors_ref  │ absolute offsets of the variable blocks,
//! 96   line_ref           │ laid out in exactly this order
//! 104  state_ref          ┘
//! 112  variable blocks, the state block always last
//! ```
//!
//! Keeping the state at the tail lets the backend cut it out with a single
//! byte-range operation and overwrite it in place while tracking. The field
//! order above is load-bearing, the compute executable addresses the fixed
//! region by offset.

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::buffer::{ByteArena, ByteReader, DecodeError};
use crate::elements::LineMetadata;
use crate::particles::ParticleSet;
use crate::state::SimState;
use crate::version::{SimVersion, VERSION_BYTES};

const OFF_NUM_TURNS: usize = VERSION_BYTES;
const OFF_NUM_ELEMENTS: usize = OFF_NUM_TURNS + 8;
const OFF_ELE_START: usize = OFF_NUM_ELEMENTS + 8;
const OFF_ELE_STOP: usize = OFF_ELE_START + 8;
const OFF_CHECKPOINT_EVERY: usize = OFF_ELE_STOP + 8;
const OFF_NUM_MONITORS: usize = OFF_CHECKPOINT_EVERY + 8;
const OFF_IDX_MONITORS_REF: usize = OFF_NUM_MONITORS + 8;
const OFF_SIZE_MONITORS_REF: usize = OFF_IDX_MONITORS_REF + 8;
const OFF_LINE_REF: usize = OFF_SIZE_MONITORS_REF + 8;
const OFF_STATE_REF: usize = OFF_LINE_REF + 8;
/// fixed scalar/reference region before the variable blocks
pub const INPUT_FIXED_BYTES: usize = OFF_STATE_REF + 8;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("a line is required to build a simulation input")]
    MissingLine,
    #[error("an initial particle ensemble is required")]
    MissingParticles,
    #[error("num_turns must be positive, got {0}")]
    NonPositiveTurns(i64),
    #[error("element `{0}` not found in the line")]
    UnknownElementName(String),
    #[error("element index {index} outside the line (0..={num_elements})")]
    ElementOutOfRange { index: i64, num_elements: i64 },
    #[error("{names} element names for {elements} elements")]
    NameCountMismatch { names: usize, elements: usize },
}

/// element position given either directly or by stored name
#[derive(Clone, Debug)]
pub enum Place {
    Index(i64),
    Name(String),
}

/// Immutable tracking work unit. Built once at submission time, mutated
/// never, except that its trailing state block is the region the backend
/// checkpoints in place.
#[derive(Clone, Debug, PartialEq)]
pub struct SimInput {
    pub version: SimVersion,
    pub num_turns: i64,
    pub num_elements: i64,
    pub ele_start: i64,
    pub ele_stop: i64,
    pub checkpoint_every: i64,
    pub idx_monitors: Vec<i64>,
    pub size_monitors: Vec<i64>,
    pub line: LineMetadata,
    pub state: SimState,
}

impl SimInput {
    pub fn builder() -> InputBuilder {
        InputBuilder::default()
    }

    pub fn num_monitors(&self) -> usize {
        self.idx_monitors.len()
    }

    /// encode to a buffer shrunk to its exact occupied size
    ///
    /// Deterministic by construction: no timestamps, pointers or
    /// process-local identifiers are ever written.
    pub fn encode(&self) -> Vec<u8> {
        let mut arena = ByteArena::with_capacity(
            INPUT_FIXED_BYTES
                + 16 * self.idx_monitors.len()
                + self.line.encoded_len()
                + self.state.encoded_len(),
        );
        let start = arena.alloc(INPUT_FIXED_BYTES);
        debug_assert_eq!(start, 0);
        self.version.write_to(arena.slot(0, VERSION_BYTES), 0);
        arena.put_i64(OFF_NUM_TURNS, self.num_turns);
        arena.put_i64(OFF_NUM_ELEMENTS, self.num_elements);
        arena.put_i64(OFF_ELE_START, self.ele_start);
        arena.put_i64(OFF_ELE_STOP, self.ele_stop);
        arena.put_i64(OFF_CHECKPOINT_EVERY, self.checkpoint_every);
        arena.put_i64(OFF_NUM_MONITORS, self.idx_monitors.len() as i64);

        arena.put_i64(OFF_IDX_MONITORS_REF, arena.used() as i64);
        for &idx in &self.idx_monitors {
            arena.push_i64(idx);
        }
        arena.put_i64(OFF_SIZE_MONITORS_REF, arena.used() as i64);
        for &size in &self.size_monitors {
            arena.push_i64(size);
        }
        arena.put_i64(OFF_LINE_REF, arena.used() as i64);
        self.line.encode_into(&mut arena);

        let state_ref = self.state.encode_into(&mut arena);
        arena.put_i64(OFF_STATE_REF, state_ref as i64);
        arena.into_bytes()
    }

    /// decode a buffer produced by [`SimInput::encode`]
    ///
    /// The version fingerprint is validated before any other byte, then the
    /// block references are checked to be exactly back-to-back so that a
    /// re-encode reproduces the buffer bit for bit.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let version = SimVersion::read_from(buf, 0)?;
        version.assert_current()?;

        let mut reader = ByteReader::new(buf);
        reader.seek("num_turns", OFF_NUM_TURNS as i64)?;
        let num_turns = reader.i64()?;
        let num_elements = reader.i64()?;
        let ele_start = reader.i64()?;
        let ele_stop = reader.i64()?;
        let checkpoint_every = reader.i64()?;
        let num_monitors = reader.count("num_monitors")?;

        let idx_ref = reader.i64()?;
        let size_ref = reader.i64()?;
        let line_ref = reader.i64()?;
        let state_ref = reader.i64()?;

        reader.seek("idx_monitors_ref", idx_ref)?;
        let idx_monitors = reader.i64_array(num_monitors)?;
        if reader.pos() as i64 != size_ref {
            return Err(DecodeError::BadRef {
                field: "size_monitors_ref",
                value: size_ref,
                buf: buf.len(),
            });
        }
        let size_monitors = reader.i64_array(num_monitors)?;
        if reader.pos() as i64 != line_ref {
            return Err(DecodeError::BadRef {
                field: "line_ref",
                value: line_ref,
                buf: buf.len(),
            });
        }
        let line = LineMetadata::decode(&mut reader)?;
        if line.len() as i64 != num_elements {
            return Err(DecodeError::Inconsistent {
                field: "num_elements",
            });
        }
        if reader.pos() as i64 != state_ref {
            return Err(DecodeError::BadRef {
                field: "state_ref",
                value: state_ref,
                buf: buf.len(),
            });
        }
        let state = SimState::decode(&buf[reader.pos()..])?;

        Ok(Self {
            version,
            num_turns,
            num_elements,
            ele_start,
            ele_stop,
            checkpoint_every,
            idx_monitors,
            size_monitors,
            line,
            state,
        })
    }

    /// lift the trailing state block out of a combined buffer
    ///
    /// Reads only the version gate and the fixed `state_ref` slot, then
    /// cross-checks the occupied size the block itself records. No re-parse
    /// of the preceding blocks takes place.
    pub fn state_slice(buf: &[u8]) -> Result<&[u8], DecodeError> {
        let version = SimVersion::read_from(buf, 0)?;
        version.assert_current()?;

        let mut reader = ByteReader::new(buf);
        reader.seek("state_ref", OFF_STATE_REF as i64)?;
        let state_ref = reader.i64()?;
        reader.seek("state_ref", state_ref)?;
        let slice = &buf[state_ref as usize..];

        let mut tail = ByteReader::new(slice);
        tail.seek("occupied", (VERSION_BYTES + 8) as i64)?;
        let occupied = tail.i64()?;
        if occupied < 0 || occupied as usize != slice.len() {
            return Err(DecodeError::OccupiedMismatch {
                claimed: occupied,
                actual: slice.len(),
            });
        }
        Ok(slice)
    }

    pub fn to_binary(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        let bytes = self.encode();
        debug!(path = ?path, bytes = bytes.len(), "writing input");
        fs::write(path, bytes)
    }

    pub fn from_binary(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        debug!(path = ?path, bytes = bytes.len(), "reading input");
        Self::decode(&bytes)
    }
}

/// Staged construction of a [`SimInput`] from a tracking request.
#[derive(Debug)]
pub struct InputBuilder {
    line: Option<LineMetadata>,
    particles: Option<ParticleSet>,
    num_turns: i64,
    ele_start: Place,
    ele_stop: Place,
    checkpoint_every: i64,
    store_element_names: bool,
}

impl Default for InputBuilder {
    fn default() -> Self {
        Self {
            line: None,
            particles: None,
            num_turns: 0,
            ele_start: Place::Index(0),
            // -1 means end of line
            ele_stop: Place::Index(-1),
            checkpoint_every: -1,
            store_element_names: true,
        }
    }
}

impl InputBuilder {
    pub fn line(mut self, line: LineMetadata) -> Self {
        self.line = Some(line);
        self
    }

    pub fn particles(mut self, particles: ParticleSet) -> Self {
        self.particles = Some(particles);
        self
    }

    pub fn num_turns(mut self, num_turns: i64) -> Self {
        self.num_turns = num_turns;
        self
    }

    pub fn ele_start(mut self, place: Place) -> Self {
        self.ele_start = place;
        self
    }

    pub fn ele_stop(mut self, place: Place) -> Self {
        self.ele_stop = place;
        self
    }

    /// turn interval for checkpoints, negative disables (the default)
    pub fn checkpoint_every(mut self, every: i64) -> Self {
        self.checkpoint_every = every;
        self
    }

    /// whether the name array travels with the binary, defaults to true
    pub fn store_element_names(mut self, store: bool) -> Self {
        self.store_element_names = store;
        self
    }

    fn resolve(place: &Place, line: &LineMetadata) -> Result<i64, ValidationError> {
        match place {
            Place::Index(idx) => Ok(*idx),
            Place::Name(name) => line
                .index_of(name)
                .map(|idx| idx as i64)
                .ok_or_else(|| ValidationError::UnknownElementName(name.clone())),
        }
    }

    pub fn build(self) -> Result<SimInput, ValidationError> {
        let mut line = self.line.ok_or(ValidationError::MissingLine)?;
        let particles = self.particles.ok_or(ValidationError::MissingParticles)?;
        if self.num_turns <= 0 {
            return Err(ValidationError::NonPositiveTurns(self.num_turns));
        }
        if !line.names.is_empty() && line.names.len() != line.elements.len() {
            return Err(ValidationError::NameCountMismatch {
                names: line.names.len(),
                elements: line.elements.len(),
            });
        }

        let num_elements = line.len() as i64;
        let ele_start = Self::resolve(&self.ele_start, &line)?.max(0);
        if ele_start > num_elements {
            return Err(ValidationError::ElementOutOfRange {
                index: ele_start,
                num_elements,
            });
        }
        let mut ele_stop = Self::resolve(&self.ele_stop, &line)?;
        if ele_stop == -1 {
            ele_stop = num_elements;
        } else if !(0..=num_elements).contains(&ele_stop) {
            return Err(ValidationError::ElementOutOfRange {
                index: ele_stop,
                num_elements,
            });
        }
        let mut num_turns = self.num_turns;
        if ele_stop <= ele_start {
            // the last partial turn wraps around the end of the line, one
            // extra traversal compensates
            num_turns += 1;
        }

        let (mut monitors, idx_monitors) = line.monitors();
        let size_monitors = monitors
            .elements
            .iter()
            .map(|element| element.encoded_len() as i64)
            .collect();
        if !self.store_element_names {
            line.names.clear();
            monitors.names.clear();
        }

        Ok(SimInput {
            version: SimVersion::CURRENT,
            num_turns,
            num_elements,
            ele_start,
            ele_stop,
            checkpoint_every: self.checkpoint_every,
            idx_monitors,
            size_monitors,
            line,
            state: SimState::new(particles, monitors),
        })
    }
}
