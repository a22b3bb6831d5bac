//! Moving a logical block to a new physical block when its content can't be updated in place.
//!
//! The move runs as a small state machine. Each step performs at most one device operation and
//! says where to go next, or that the current candidate block failed and has to be retired.
//! The source block is only erased once a candidate holds a complete copy.

use super::alloc;
use super::error::{FtlError, Result};
use super::verify::Verify;
use super::Ftl;
use crate::nand::RawNand;

use log::{debug, trace, warn};

use std::ops::Range;

/// What a relocation is doing right now
#[derive(Debug, Clone, Eq, PartialEq)]
enum State {
    /// Pick a free block in the source's plane
    SelectCandidate,

    /// Copy the untouched pages over, one at a time
    DuplicatePages { candidate: u32, pages: Range<u32> },

    /// Copy the target page, with the new data patched in
    PatchTarget { candidate: u32 },

    /// Flag the candidate as used; it now holds the logical block
    Commit { candidate: u32 },

    /// Every attempt was used up, or no free block is left
    Exhausted,
}

/// The outcome of one step
#[derive(Debug)]
enum Step {
    Next(State),
    Failed { candidate: u32, error: FtlError },
    Done(u32),
}

impl Step {
    /// Continue with `next` if the device operation on `candidate` went through
    fn after(candidate: u32, result: Result<()>, next: State) -> Self {
        match result {
            Ok(()) => Self::Next(next),
            Err(error) => Self::Failed { candidate, error },
        }
    }
}

/// The parameters of one relocation
#[derive(Debug)]
struct Job<'a> {
    src: u32,
    page: u32,
    offset: usize,
    patch: &'a [u8],
}

/// Counters of relocation activity since the FTL was created
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Relocations {
    /// Logical blocks moved successfully
    pub done: u64,

    /// Candidate blocks retired because copying into them failed
    pub retired: u64,
}

impl<N: RawNand, V: Verify> Ftl<N, V> {
    /// Move the content of block `src` to a free block of the same plane, replacing
    /// `patch.len()` bytes at `offset` of page `page` on the way.
    ///
    /// Returns the physical block that now holds the logical block.
    pub(crate) fn relocate(
        &mut self,
        src: u32,
        page: u32,
        offset: usize,
        patch: &[u8],
    ) -> Result<u32> {
        let job = Job {
            src,
            page,
            offset,
            patch,
        };
        let max_attempts = self.config.relocation_attempts;
        let mut attempts = 0;
        let mut state = State::SelectCandidate;

        debug!("relocating block {src} (page {page}, {} bytes)", patch.len());

        loop {
            if state == State::SelectCandidate {
                if attempts == max_attempts {
                    state = State::Exhausted;
                } else {
                    attempts += 1;
                }
            }
            if state == State::Exhausted {
                return Err(FtlError::RelocationExhausted {
                    block: src,
                    attempts,
                });
            }

            trace!("relocation of block {src}: {state:?}");
            state = match self.step(&job, state)? {
                Step::Next(next) => next,
                // A device that stops responding won't do better with another block
                Step::Failed {
                    candidate,
                    error: FtlError::Timeout,
                } => {
                    warn!("relocation of block {src} into block {candidate} timed out");
                    self.abandon_candidate(candidate);
                    return Err(FtlError::Timeout);
                }
                Step::Failed { candidate, error } => {
                    warn!("relocation of block {src} into block {candidate} failed: {error}");
                    self.retire_candidate(candidate)?;
                    State::SelectCandidate
                }
                Step::Done(candidate) => {
                    self.finish(src, candidate)?;
                    return Ok(candidate);
                }
            };
        }
    }

    fn step(&mut self, job: &Job, state: State) -> Result<Step> {
        let geometry = self.geometry();

        let step = match state {
            State::SelectCandidate => {
                let plane = geometry.plane_of(job.src);
                match alloc::find_free_block(&mut self.nand, plane)? {
                    Some(candidate) => Step::Next(State::DuplicatePages {
                        candidate,
                        pages: 0..geometry.pages_per_block,
                    }),
                    None => Step::Next(State::Exhausted),
                }
            }

            State::DuplicatePages {
                candidate,
                mut pages,
            } => match pages.next() {
                None => Step::Next(State::PatchTarget { candidate }),
                Some(page) if page == job.page => {
                    Step::Next(State::DuplicatePages { candidate, pages })
                }
                Some(page) => {
                    let result = self
                        .nand
                        .copy_page(
                            geometry.page_of(job.src, page),
                            geometry.page_of(candidate, page),
                        )
                        .map_err(FtlError::from);
                    Step::after(
                        candidate,
                        result,
                        State::DuplicatePages { candidate, pages },
                    )
                }
            },

            State::PatchTarget { candidate } => {
                let result = self
                    .nand
                    .copy_page_with_patch(
                        geometry.page_of(job.src, job.page),
                        geometry.page_of(candidate, job.page),
                        job.offset,
                        job.patch,
                    )
                    .map_err(FtlError::from);
                Step::after(candidate, result, State::Commit { candidate })
            }

            State::Commit { candidate } => match alloc::mark_used(&mut self.nand, candidate) {
                Ok(()) => Step::Done(candidate),
                Err(error) => Step::Failed { candidate, error },
            },

            State::Exhausted => Step::Next(State::Exhausted),
        };

        Ok(step)
    }

    /// Give up on a candidate that could not take the copy
    fn retire_candidate(&mut self, candidate: u32) -> Result<()> {
        self.relocations.retired += 1;

        // The candidate may already carry the logical block number of the source
        self.wipe_candidate(candidate);
        alloc::mark_bad(&mut self.nand, candidate);

        self.rebuild()?;
        Ok(())
    }

    /// Drop a candidate after a timeout. The block is fine as far as anyone knows, so it goes
    /// back to the free pool if it can be erased.
    fn abandon_candidate(&mut self, candidate: u32) {
        if !self.wipe_candidate(candidate) {
            alloc::mark_bad(&mut self.nand, candidate);
        }
    }

    /// Erase whatever part of the copy reached the candidate
    fn wipe_candidate(&mut self, candidate: u32) -> bool {
        match self.nand.erase_block(candidate) {
            Ok(()) => true,
            Err(e) => {
                warn!("erasing candidate block {candidate} failed: {e}");
                false
            }
        }
    }

    /// The candidate holds a full copy: free up the source and pick up the new mapping
    fn finish(&mut self, src: u32, candidate: u32) -> Result<()> {
        if let Err(e) = self.nand.erase_block(src) {
            warn!("erasing relocated block {src} failed: {e}");
            alloc::mark_bad(&mut self.nand, src);
        }

        self.rebuild()?;
        self.relocations.done += 1;
        debug!("block {src} relocated to block {candidate}");
        Ok(())
    }
}
