//! Reference tracking engine honoring the checkpoint contract.
//!
//! The production backend runs its own compiled tracker; this one exists so
//! the contract can be exercised end to end without it. The contract:
//!
//! - on start, look for an existing checkpoint file; if present, resume
//!   from the turn counter embedded in it and discard the supplied turn-0
//!   state
//! - while tracking, snapshot the complete state to the checkpoint file
//!   every `checkpoint_every` turns (a negative interval disables this)
//! - on completion, persist the state as the terminal output file
//!
//! Checkpoint and output files share one byte layout, a version-prefixed
//! state block, and are interchangeable decoder inputs. Running through
//! uninterrupted and running with any number of interrupt/resume cycles
//! must produce byte-identical terminal output, which is why neither the
//! state nor the transfer maps may touch a clock, an address or anything
//! else non-reproducible.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::buffer::DecodeError;
use crate::input::SimInput;
use crate::state::SimState;

/// file the submitter drops next to the executable
pub const INPUT_FILE: &str = "beamline_input.bin";
/// terminal output, a bare state block
pub const OUTPUT_FILE: &str = "beamline_state_out.bin";
/// periodic snapshot, same layout as the output
pub const CHECKPOINT_FILE: &str = "checkpoint.bin";

/// Single-threaded tracking session over one work unit.
#[derive(Debug)]
pub struct Tracker {
    input: SimInput,
    state: SimState,
    workdir: PathBuf,
}

impl Tracker {
    /// start a session, resuming from a checkpoint when one is present
    pub fn new(input: SimInput, workdir: impl Into<PathBuf>) -> Result<Self, DecodeError> {
        let workdir = workdir.into();
        let checkpoint = workdir.join(CHECKPOINT_FILE);
        let state = if checkpoint.is_file() {
            // a version mismatch here is a hard failure, a stale snapshot
            // must never silently restart the job from turn 0
            let resumed = SimState::from_binary(&checkpoint)?;
            info!(turn = resumed.i_turn, "resuming from checkpoint");
            resumed
        } else {
            input.state.clone()
        };
        Ok(Self {
            input,
            state,
            workdir,
        })
    }

    pub fn state(&self) -> &SimState {
        &self.state
    }

    pub fn i_turn(&self) -> i64 {
        self.state.i_turn
    }

    pub fn finished(&self) -> bool {
        self.state.i_turn >= self.input.num_turns
    }

    /// element window traversed during turn `turn` (0-based)
    ///
    /// The first turn enters the line at `ele_start`, the last one leaves
    /// it at `ele_stop`, every other turn covers the full line. With the
    /// wraparound correction applied at input construction this also covers
    /// `ele_stop <= ele_start` windows.
    fn turn_window(&self, turn: i64) -> (usize, usize) {
        let lo = if turn == 0 {
            self.input.ele_start as usize
        } else {
            0
        };
        let hi = if turn == self.input.num_turns - 1 {
            self.input.ele_stop as usize
        } else {
            self.input.num_elements as usize
        };
        (lo, hi)
    }

    /// advance one turn
    pub fn step(&mut self) {
        let (lo, hi) = self.turn_window(self.state.i_turn);
        let capacity = self.state.particles.capacity();
        for element in &self.input.line.elements[lo..hi] {
            for idx in 0..capacity {
                if self.state.particles.is_alive(idx) {
                    element.apply(&mut self.state.particles, idx);
                }
            }
        }
        self.state.i_turn += 1;
        for idx in 0..capacity {
            if self.state.particles.is_alive(idx) {
                self.state.particles.at_turn[idx] = self.state.i_turn;
            }
        }
    }

    /// track at most `max_turns` turns in this session
    ///
    /// Checkpoints fire at the configured interval; when the run completes
    /// inside this session the terminal output is written as well. Returns
    /// whether the work unit is finished, so an interrupted caller can
    /// come back with a fresh session and continue.
    pub fn run_turns(&mut self, max_turns: i64) -> std::io::Result<bool> {
        let mut ran = 0;
        while !self.finished() && ran < max_turns {
            self.step();
            ran += 1;
            let every = self.input.checkpoint_every;
            if every > 0 && self.state.i_turn % every == 0 {
                self.write_checkpoint()?;
            }
        }
        if self.finished() {
            let output = self.workdir.join(OUTPUT_FILE);
            self.state.to_binary(&output)?;
            info!(turn = self.state.i_turn, path = ?output, "tracking finished");
        }
        Ok(self.finished())
    }

    /// track to completion and return the output path
    pub fn run(&mut self) -> std::io::Result<PathBuf> {
        self.run_turns(i64::MAX)?;
        Ok(self.workdir.join(OUTPUT_FILE))
    }

    /// snapshot the full state, atomically replacing the previous checkpoint
    fn write_checkpoint(&self) -> std::io::Result<()> {
        let target = self.workdir.join(CHECKPOINT_FILE);
        let staged = self.workdir.join(format!(".{CHECKPOINT_FILE}"));
        self.state.to_binary(&staged)?;
        // readers either see the old snapshot or the new one, never a
        // partial write
        fs::rename(&staged, &target)?;
        debug!(turn = self.state.i_turn, "checkpoint written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::{Element, LineMetadata};
    use crate::particles::ParticleSet;

    fn sample_input(checkpoint_every: i64) -> SimInput {
        let line = LineMetadata::new(vec![
            Element::Drift { length: 1.0 },
            Element::Multipole {
                knl: [0.0, 1e-3, 0.0, 0.0],
            },
            Element::Drift { length: 1.0 },
        ]);
        let particles =
            ParticleSet::from_positions(vec![0.01, -0.02, 0.005], vec![0.0, 0.001, -0.001]);
        SimInput::builder()
            .line(line)
            .particles(particles)
            .num_turns(20)
            .checkpoint_every(checkpoint_every)
            .build()
            .unwrap()
    }

    #[test]
    fn tracks_to_completion_and_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = Tracker::new(sample_input(-1), dir.path()).unwrap();
        let output = tracker.run().unwrap();

        let state = SimState::from_binary(&output).unwrap();
        assert_eq!(state.i_turn, 20);
        assert!(state.particles.at_turn.iter().all(|&turn| turn == 20));
        // checkpointing was disabled
        assert!(!dir.path().join(CHECKPOINT_FILE).exists());
    }

    #[test]
    fn checkpoints_fire_at_the_configured_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = Tracker::new(sample_input(8), dir.path()).unwrap();
        tracker.run_turns(10).unwrap();

        let snapshot = SimState::from_binary(dir.path().join(CHECKPOINT_FILE)).unwrap();
        // the snapshot holds the last checkpoint boundary, not the live turn
        assert_eq!(snapshot.i_turn, 8);
        assert_eq!(tracker.i_turn(), 10);
    }

    #[test]
    fn resume_discards_the_supplied_state() {
        let dir = tempfile::tempdir().unwrap();
        let input = sample_input(5);

        let mut first = Tracker::new(input.clone(), dir.path()).unwrap();
        assert!(!first.run_turns(7).unwrap());
        drop(first);

        let resumed = Tracker::new(input, dir.path()).unwrap();
        assert_eq!(resumed.i_turn(), 5);
    }
}
