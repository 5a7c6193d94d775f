//! Particle ensemble block.
//!
//! Struct-of-arrays layout, every array exactly `capacity` entries long. The
//! wire form is the capacity followed by the arrays in fixed declaration
//! order, integer arrays first.

use crate::buffer::{ByteArena, ByteReader, DecodeError};

/// number of bytes one particle occupies on the wire
const BYTES_PER_PARTICLE: usize = 10 * 8;

/// A fixed-capacity ensemble of tracked particles.
///
/// `state > 0` marks a particle as alive; dead particles keep their slot so
/// the layout never moves while the backend mutates the block in place.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ParticleSet {
    pub particle_id: Vec<i64>,
    pub state: Vec<i64>,
    pub at_turn: Vec<i64>,
    pub x: Vec<f64>,
    pub px: Vec<f64>,
    pub y: Vec<f64>,
    pub py: Vec<f64>,
    pub zeta: Vec<f64>,
    pub delta: Vec<f64>,
    pub s: Vec<f64>,
}

impl ParticleSet {
    /// build an ensemble from transverse start positions, everything else zero
    ///
    /// Particles are numbered from 0 and start alive at turn 0.
    pub fn from_positions(x: Vec<f64>, y: Vec<f64>) -> Self {
        let capacity = x.len().min(y.len());
        Self {
            particle_id: (0..capacity as i64).collect(),
            state: vec![1; capacity],
            at_turn: vec![0; capacity],
            x: x[..capacity].to_vec(),
            y: y[..capacity].to_vec(),
            px: vec![0.0; capacity],
            py: vec![0.0; capacity],
            zeta: vec![0.0; capacity],
            delta: vec![0.0; capacity],
            s: vec![0.0; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.particle_id.len()
    }

    /// particles still alive, i.e. with a positive state flag
    pub fn num_active(&self) -> usize {
        self.state.iter().filter(|&&s| s > 0).count()
    }

    pub fn is_alive(&self, idx: usize) -> bool {
        self.state[idx] > 0
    }

    pub fn encoded_len(&self) -> usize {
        8 + self.capacity() * BYTES_PER_PARTICLE
    }

    pub fn encode_into(&self, arena: &mut ByteArena) {
        arena.push_i64(self.capacity() as i64);
        for array in [&self.particle_id, &self.state, &self.at_turn] {
            for &value in array.iter() {
                arena.push_i64(value);
            }
        }
        for array in [
            &self.x, &self.px, &self.y, &self.py, &self.zeta, &self.delta, &self.s,
        ] {
            for &value in array.iter() {
                arena.push_f64(value);
            }
        }
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let capacity = reader.count("particle capacity")?;
        Ok(Self {
            particle_id: reader.i64_array(capacity)?,
            state: reader.i64_array(capacity)?,
            at_turn: reader.i64_array(capacity)?,
            x: reader.f64_array(capacity)?,
            px: reader.f64_array(capacity)?,
            y: reader.f64_array(capacity)?,
            py: reader.f64_array(capacity)?,
            zeta: reader.f64_array(capacity)?,
            delta: reader.f64_array(capacity)?,
            s: reader.f64_array(capacity)?,
        })
    }
}
