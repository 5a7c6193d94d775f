//! Closed element registry and line metadata.
//!
//! The backend supports a finite table of element kinds. Everything outside
//! the table is rejected when a line is assembled, there is no name-based
//! dispatch at decode time, only the integer kind tag.
//! (this is deliberately a closed sum type instead of trait objects, the
//! capability table has to stay in lockstep with the compute executable)

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::buffer::{ByteArena, ByteReader, DecodeError};
use crate::particles::ParticleSet;

/// Kind tags as written to the wire, one per supported element type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ElementKind {
    Drift,
    Multipole,
    Cavity,
    XyShift,
    SRotation,
    Monitor,
}

impl ElementKind {
    pub fn tag(self) -> i64 {
        match self {
            Self::Drift => 1,
            Self::Multipole => 2,
            Self::Cavity => 3,
            Self::XyShift => 4,
            Self::SRotation => 5,
            Self::Monitor => 6,
        }
    }

    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            1 => Some(Self::Drift),
            2 => Some(Self::Multipole),
            3 => Some(Self::Cavity),
            4 => Some(Self::XyShift),
            5 => Some(Self::SRotation),
            6 => Some(Self::Monitor),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Drift => "Drift",
            Self::Multipole => "Multipole",
            Self::Cavity => "Cavity",
            Self::XyShift => "XyShift",
            Self::SRotation => "SRotation",
            Self::Monitor => "Monitor",
        }
    }

    /// payload bytes following the kind tag
    pub fn payload_len(self) -> usize {
        match self {
            Self::Drift => 8,
            Self::Multipole => 32,
            Self::Cavity => 24,
            Self::XyShift => 16,
            Self::SRotation => 8,
            Self::Monitor => 32,
        }
    }
}

/// One beamline element with its kind-specific payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Element {
    Drift {
        length: f64,
    },
    /// integrated normal strengths through octupole
    Multipole {
        knl: [f64; 4],
    },
    Cavity {
        voltage: f64,
        frequency: f64,
        lag: f64,
    },
    XyShift {
        dx: f64,
        dy: f64,
    },
    /// rotation of the transverse plane, angle in degrees
    SRotation {
        angle: f64,
    },
    /// turn-by-turn recorder, transparent to the beam
    Monitor {
        start_turn: i64,
        stop_turn: i64,
        id_start: i64,
        id_end: i64,
    },
}

impl Element {
    pub fn kind(&self) -> ElementKind {
        match self {
            Self::Drift { .. } => ElementKind::Drift,
            Self::Multipole { .. } => ElementKind::Multipole,
            Self::Cavity { .. } => ElementKind::Cavity,
            Self::XyShift { .. } => ElementKind::XyShift,
            Self::SRotation { .. } => ElementKind::SRotation,
            Self::Monitor { .. } => ElementKind::Monitor,
        }
    }

    /// tag plus payload, the element's full wire footprint
    pub fn encoded_len(&self) -> usize {
        8 + self.kind().payload_len()
    }

    pub fn encode_into(&self, arena: &mut ByteArena) {
        arena.push_i64(self.kind().tag());
        match *self {
            Self::Drift { length } => arena.push_f64(length),
            Self::Multipole { knl } => {
                for strength in knl {
                    arena.push_f64(strength);
                }
            }
            Self::Cavity {
                voltage,
                frequency,
                lag,
            } => {
                arena.push_f64(voltage);
                arena.push_f64(frequency);
                arena.push_f64(lag);
            }
            Self::XyShift { dx, dy } => {
                arena.push_f64(dx);
                arena.push_f64(dy);
            }
            Self::SRotation { angle } => arena.push_f64(angle),
            Self::Monitor {
                start_turn,
                stop_turn,
                id_start,
                id_end,
            } => {
                arena.push_i64(start_turn);
                arena.push_i64(stop_turn);
                arena.push_i64(id_start);
                arena.push_i64(id_end);
            }
        }
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let tag = reader.i64()?;
        let kind = ElementKind::from_tag(tag).ok_or(DecodeError::UnknownElementTag(tag))?;
        Ok(match kind {
            ElementKind::Drift => Self::Drift {
                length: reader.f64()?,
            },
            ElementKind::Multipole => Self::Multipole {
                knl: [
                    reader.f64()?,
                    reader.f64()?,
                    reader.f64()?,
                    reader.f64()?,
                ],
            },
            ElementKind::Cavity => Self::Cavity {
                voltage: reader.f64()?,
                frequency: reader.f64()?,
                lag: reader.f64()?,
            },
            ElementKind::XyShift => Self::XyShift {
                dx: reader.f64()?,
                dy: reader.f64()?,
            },
            ElementKind::SRotation => Self::SRotation {
                angle: reader.f64()?,
            },
            ElementKind::Monitor => Self::Monitor {
                start_turn: reader.i64()?,
                stop_turn: reader.i64()?,
                id_start: reader.i64()?,
                id_end: reader.i64()?,
            },
        })
    }

    /// deterministic single-particle transfer map
    ///
    /// Thin-lens kicks and exact drifts only. The map must stay free of any
    /// non-reproducible input, resumed tracking has to retrace the exact
    /// same arithmetic.
    pub fn apply(&self, set: &mut ParticleSet, idx: usize) {
        match *self {
            Self::Drift { length } => {
                set.x[idx] += set.px[idx] * length;
                set.y[idx] += set.py[idx] * length;
                set.s[idx] += length;
            }
            Self::Multipole { knl } => {
                let x = set.x[idx];
                let y = set.y[idx];
                set.px[idx] -= knl[0]
                    + knl[1] * x
                    + knl[2] * (x * x - y * y) / 2.0
                    + knl[3] * (x * x * x - 3.0 * x * y * y) / 6.0;
                set.py[idx] += knl[1] * y
                    + knl[2] * x * y
                    + knl[3] * (3.0 * x * x * y - y * y * y) / 6.0;
            }
            Self::Cavity {
                voltage,
                frequency,
                lag,
            } => {
                let phase = lag.to_radians() + frequency * set.zeta[idx];
                set.delta[idx] += voltage * phase.sin();
            }
            Self::XyShift { dx, dy } => {
                set.x[idx] -= dx;
                set.y[idx] -= dy;
            }
            Self::SRotation { angle } => {
                let (sin, cos) = angle.to_radians().sin_cos();
                let (x, y) = (set.x[idx], set.y[idx]);
                let (px, py) = (set.px[idx], set.py[idx]);
                set.x[idx] = cos * x + sin * y;
                set.y[idx] = -sin * x + cos * y;
                set.px[idx] = cos * px + sin * py;
                set.py[idx] = -sin * px + cos * py;
            }
            Self::Monitor { .. } => {}
        }
    }
}

/// Ordered element list plus an optional parallel name array.
///
/// An empty name array means names were not stored, a populated one must
/// match the element count entry for entry.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct LineMetadata {
    pub elements: Vec<Element>,
    pub names: Vec<String>,
}

impl LineMetadata {
    pub fn new(elements: Vec<Element>) -> Self {
        Self {
            elements,
            names: Vec::new(),
        }
    }

    pub fn with_names(elements: Vec<Element>, names: Vec<String>) -> Self {
        Self { elements, names }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// per-kind element counts, keyed by kind name for metadata records
    pub fn kind_counts(&self) -> BTreeMap<String, usize> {
        self.elements
            .iter()
            .counts_by(|element| element.kind().name().to_string())
            .into_iter()
            .collect()
    }

    /// monitors of the line with their indices, names carried over when stored
    pub fn monitors(&self) -> (LineMetadata, Vec<i64>) {
        let mut indices = Vec::new();
        let mut monitor_line = LineMetadata::default();
        for (idx, element) in self.elements.iter().enumerate() {
            if element.kind() == ElementKind::Monitor {
                indices.push(idx as i64);
                monitor_line.elements.push(*element);
                if let Some(name) = self.names.get(idx) {
                    monitor_line.names.push(name.clone());
                }
            }
        }
        (monitor_line, indices)
    }

    pub fn encoded_len(&self) -> usize {
        let element_bytes: usize = self.elements.iter().map(Element::encoded_len).sum();
        let name_bytes: usize = self.names.iter().map(|name| 8 + name.len()).sum();
        8 + element_bytes + 8 + name_bytes
    }

    pub fn encode_into(&self, arena: &mut ByteArena) {
        arena.push_i64(self.elements.len() as i64);
        for element in &self.elements {
            element.encode_into(arena);
        }
        arena.push_i64(self.names.len() as i64);
        for name in &self.names {
            arena.push_i64(name.len() as i64);
            arena.push_bytes(name.as_bytes());
        }
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let num_elements = reader.count("num line elements")?;
        let elements = (0..num_elements)
            .map(|_| Element::decode(reader))
            .collect::<Result<Vec<_>, _>>()?;

        let num_names = reader.count("num element names")?;
        if num_names != 0 && num_names != num_elements {
            return Err(DecodeError::NameCountMismatch {
                names: num_names as i64,
                elements: num_elements as i64,
            });
        }
        let mut names = Vec::with_capacity(num_names);
        for _ in 0..num_names {
            let len = reader.count("element name length")?;
            let offset = reader.pos();
            let raw = reader.bytes(len)?;
            let name = std::str::from_utf8(raw)
                .map_err(|_| DecodeError::BadName { offset })?
                .to_string();
            names.push(name);
        }
        Ok(Self { elements, names })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteArena;

    fn sample_line() -> LineMetadata {
        LineMetadata::with_names(
            vec![
                Element::Drift { length: 1.0 },
                Element::Multipole {
                    knl: [1e-4, 0.0, 0.0, 0.0],
                },
                Element::Monitor {
                    start_turn: 0,
                    stop_turn: 100,
                    id_start: 0,
                    id_end: 50,
                },
                Element::Drift { length: 2.5 },
            ],
            vec!["d1".into(), "mb".into(), "bpm".into(), "d2".into()],
        )
    }

    #[test]
    fn roundtrip_with_and_without_names() {
        for line in [sample_line(), LineMetadata::new(sample_line().elements)] {
            let mut arena = ByteArena::new();
            line.encode_into(&mut arena);
            let bytes = arena.into_bytes();
            assert_eq!(bytes.len(), line.encoded_len());
            let back = LineMetadata::decode(&mut ByteReader::new(&bytes)).unwrap();
            assert_eq!(back, line);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut arena = ByteArena::new();
        arena.push_i64(1); // one element
        arena.push_i64(99); // tag outside the registry
        arena.push_f64(0.0);
        arena.push_i64(0); // no names
        let bytes = arena.into_bytes();
        assert!(matches!(
            LineMetadata::decode(&mut ByteReader::new(&bytes)),
            Err(DecodeError::UnknownElementTag(99))
        ));
    }

    #[test]
    fn name_count_must_match_elements() {
        let line = LineMetadata::with_names(
            vec![Element::Drift { length: 1.0 }, Element::Drift { length: 1.0 }],
            vec!["only-one".into(), "two".into()],
        );
        let mut arena = ByteArena::new();
        line.encode_into(&mut arena);
        let mut bytes = arena.into_bytes();
        // tamper the stored name count down to 1
        let name_count_offset = 8 + 2 * 16;
        bytes[name_count_offset..name_count_offset + 8].copy_from_slice(&1i64.to_le_bytes());
        assert!(matches!(
            LineMetadata::decode(&mut ByteReader::new(&bytes)),
            Err(DecodeError::NameCountMismatch { .. })
        ));
    }

    #[test]
    fn monitors_are_extracted_with_their_indices() {
        let (monitors, indices) = sample_line().monitors();
        assert_eq!(indices, vec![2]);
        assert_eq!(monitors.len(), 1);
        assert_eq!(monitors.names, vec!["bpm".to_string()]);
        assert_eq!(monitors.elements[0].kind(), ElementKind::Monitor);
    }

    #[test]
    fn kind_counts_for_metadata_records() {
        let counts = sample_line().kind_counts();
        assert_eq!(counts.get("Drift"), Some(&2));
        assert_eq!(counts.get("Multipole"), Some(&1));
        assert_eq!(counts.get("Monitor"), Some(&1));
        assert_eq!(counts.get("Cavity"), None);
    }

    #[test]
    fn drift_moves_particles_deterministically() {
        let mut set = ParticleSet::from_positions(vec![0.0], vec![0.0]);
        set.px[0] = 1e-3;
        Element::Drift { length: 2.0 }.apply(&mut set, 0);
        assert_eq!(set.x[0], 2e-3);
        assert_eq!(set.s[0], 2.0);
    }
}
