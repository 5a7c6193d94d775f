//! Version fingerprint gating every binary structure.
//!
//! The fingerprint is the first field of every top-level structure and is
//! checked with exact equality before any other byte is interpreted. Only
//! change the component versions here together with a release of the compute
//! executable, otherwise submitters and backends drift out of sync.

use std::fmt;

use thiserror::Error;

/// byte width of the encoded fingerprint, four packed i64 fields
pub const VERSION_BYTES: usize = 32;

/// pack a semantic version into a single integer
///
/// The layout is `major * 1_000_000 + minor * 1_000 + patch`, which keeps
/// packed values ordered the same way as the versions they encode.
pub const fn pack_version(major: i64, minor: i64, patch: i64) -> i64 {
    major * 1_000_000 + minor * 1_000 + patch
}

/// unpack a packed version back into (major, minor, patch)
pub const fn unpack_version(packed: i64) -> (i64, i64, i64) {
    (packed / 1_000_000, packed / 1_000 % 1_000, packed % 1_000)
}

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("version fingerprint mismatch: expected {expected}, found {found}")]
    Mismatch {
        expected: SimVersion,
        found: SimVersion,
    },
    #[error("buffer of {len} bytes is too short to hold a version fingerprint")]
    Truncated { len: usize },
}

/// Schema + dependency fingerprint, one packed version per component.
///
/// Occupies offset 0 of every top-level structure. Comparison is exact
/// equality against [`SimVersion::CURRENT`], revisions carry no range
/// compatibility in either direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimVersion {
    /// schema revision of this crate
    pub app: i64,
    /// tracking kernel the backend executes
    pub tracker: i64,
    /// particle ensemble layout
    pub particles: i64,
    /// supported element table
    pub elements: i64,
}

impl SimVersion {
    pub const CURRENT: SimVersion = SimVersion {
        app: pack_version(0, 5, 0),
        tracker: pack_version(0, 88, 2),
        particles: pack_version(0, 23, 1),
        elements: pack_version(0, 6, 2),
    };

    /// read a fingerprint from `buf` starting at `offset`
    pub fn read_from(buf: &[u8], offset: usize) -> Result<SimVersion, VersionError> {
        if buf.len() < offset + VERSION_BYTES {
            return Err(VersionError::Truncated { len: buf.len() });
        }
        let field = |i: usize| {
            let start = offset + i * 8;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[start..start + 8]);
            i64::from_le_bytes(raw)
        };
        Ok(SimVersion {
            app: field(0),
            tracker: field(1),
            particles: field(2),
            elements: field(3),
        })
    }

    /// write the fingerprint into `buf` starting at `offset`
    ///
    /// The caller must have reserved [`VERSION_BYTES`] at that position.
    pub fn write_to(&self, buf: &mut [u8], offset: usize) {
        for (i, value) in [self.app, self.tracker, self.particles, self.elements]
            .into_iter()
            .enumerate()
        {
            let start = offset + i * 8;
            buf[start..start + 8].copy_from_slice(&value.to_le_bytes());
        }
    }

    /// gate check, run before interpreting any further byte
    pub fn assert_current(&self) -> Result<(), VersionError> {
        if *self == SimVersion::CURRENT {
            Ok(())
        } else {
            Err(VersionError::Mismatch {
                expected: SimVersion::CURRENT,
                found: *self,
            })
        }
    }
}

impl fmt::Display for SimVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dotted = |packed: i64| {
            let (major, minor, patch) = unpack_version(packed);
            format!("{major}.{minor}.{patch}")
        };
        write!(
            f,
            "app {} (tracker {}, particles {}, elements {})",
            dotted(self.app),
            dotted(self.tracker),
            dotted(self.particles),
            dotted(self.elements)
        )
    }
}

/// dotted app version, used in job metadata records
pub fn app_version() -> String {
    let (major, minor, patch) = unpack_version(SimVersion::CURRENT.app);
    format!("{major}.{minor}.{patch}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrip() {
        assert_eq!(pack_version(0, 5, 0), 5_000);
        assert_eq!(unpack_version(pack_version(12, 34, 56)), (12, 34, 56));
        assert_eq!(app_version(), "0.5.0");
    }

    #[test]
    fn packed_versions_keep_ordering() {
        assert!(pack_version(0, 5, 1) > pack_version(0, 5, 0));
        assert!(pack_version(1, 0, 0) > pack_version(0, 999, 999));
    }

    #[test]
    fn byte_roundtrip() {
        let mut buf = vec![0u8; VERSION_BYTES + 8];
        SimVersion::CURRENT.write_to(&mut buf, 8);
        let back = SimVersion::read_from(&buf, 8).unwrap();
        assert_eq!(back, SimVersion::CURRENT);
        back.assert_current().unwrap();
    }

    #[test]
    fn mismatch_carries_both_fingerprints() {
        let stale = SimVersion {
            app: pack_version(0, 4, 9),
            ..SimVersion::CURRENT
        };
        match stale.assert_current() {
            Err(VersionError::Mismatch { expected, found }) => {
                assert_eq!(expected, SimVersion::CURRENT);
                assert_eq!(found, stale);
            }
            other => panic!("expected a mismatch, got {other:?}"),
        }
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let buf = vec![0u8; VERSION_BYTES - 1];
        assert!(matches!(
            SimVersion::read_from(&buf, 0),
            Err(VersionError::Truncated { .. })
        ));
    }
}
