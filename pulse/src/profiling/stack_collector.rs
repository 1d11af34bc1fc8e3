//! # Stack Profile Collection
//!
//! Reads the `SAMPLE_COUNTS` and `STACK_TRACES` maps and turns them into a
//! [`Profile`]: one entry per (pid, user stack, kernel stack) bucket with its
//! frames resolved to instruction pointers.
//!
//! ## Folded Output
//!
//! [`Profile::write_folded`] emits the format consumed by `flamegraph.pl` and
//! `inferno`: frames from the root of the call chain to the leaf, separated
//! by `;`, followed by a space and the sample count. Kernel frames follow the
//! user frames and carry a `[kernel] ` prefix.

use aya::maps::{HashMap, MapData, StackTraceMap};
use aya::Ebpf;
use log::{debug, warn};
use pulse_common::{SampleKey, StackSpace};
use std::collections::HashSet;
use std::io::{self, Write};

use crate::domain::{CollectError, ProfilerError, StackId};
use crate::maps::{SampleCounterTable, StackTraceTable};
use crate::symbolization::FrameNames;

/// One sample bucket with its stacks, innermost frame first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSample {
    pub pid: u32,
    pub user_stack_id: StackId,
    pub kernel_stack_id: StackId,
    pub user_frames: Vec<u64>,
    pub kernel_frames: Vec<u64>,
    pub count: u64,
}

/// All buckets drained from the sample-count table
#[derive(Debug, Clone, Default)]
pub struct Profile {
    /// Buckets with at least one frame, most samples first
    pub samples: Vec<StackSample>,
    /// Every counted sample, including ones without usable frames
    pub total_samples: u64,
    /// Samples whose stacks could not be resolved
    pub unresolved_samples: u64,
}

/// Frames up to (not including) the first zero address
fn trim_frames(frames: impl IntoIterator<Item = u64>) -> Vec<u64> {
    frames.into_iter().take_while(|&ip| ip != 0).collect()
}

impl Profile {
    /// Build a profile from count entries and a stack lookup
    ///
    /// `lookup` returns the frames stored under a stack id, innermost first,
    /// or `None` when the id is unknown. Buckets with neither user nor kernel
    /// frames count towards `unresolved_samples` only.
    pub fn build<I, F>(counts: I, mut lookup: F) -> Self
    where
        I: IntoIterator<Item = (SampleKey, u64)>,
        F: FnMut(u32) -> Option<Vec<u64>>,
    {
        let mut profile = Profile::default();

        for (key, count) in counts {
            profile.total_samples += count;

            let user_stack_id = StackId(key.user_stack_id);
            let kernel_stack_id = StackId(key.kernel_stack_id);
            let mut resolve = |id: StackId| -> Vec<u64> {
                let Some(map_key) = id.map_key() else {
                    return Vec::new();
                };
                match lookup(map_key) {
                    Some(frames) => trim_frames(frames),
                    None => {
                        warn!("{}", CollectError::MissingStack(id));
                        Vec::new()
                    }
                }
            };

            let user_frames = resolve(user_stack_id);
            let kernel_frames = resolve(kernel_stack_id);

            if user_frames.is_empty() && kernel_frames.is_empty() {
                profile.unresolved_samples += count;
                continue;
            }

            profile.samples.push(StackSample {
                pid: key.pid,
                user_stack_id,
                kernel_stack_id,
                user_frames,
                kernel_frames,
                count,
            });
        }

        profile.samples.sort_by(|a, b| {
            b.count.cmp(&a.count).then_with(|| a.user_frames.cmp(&b.user_frames))
        });
        profile
    }

    /// Drain host-side tables into a profile
    ///
    /// Counts are removed; stacks referenced by drained buckets are removed
    /// from `stacks` afterwards.
    pub fn drain_tables(counts: &mut SampleCounterTable, stacks: &mut StackTraceTable) -> Self {
        let entries = counts.drain();
        let referenced = referenced_stack_ids(&entries);
        let profile = Self::build(entries, |id| stacks.frames(id).map(|s| s.frames().to_vec()));

        for id in referenced {
            stacks.remove(id);
        }
        profile
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Folded line for one bucket, without the trailing newline
    pub fn folded_line(sample: &StackSample, names: &(impl FrameNames + ?Sized)) -> String {
        let mut frames: Vec<String> =
            Vec::with_capacity(sample.user_frames.len() + sample.kernel_frames.len());

        for &ip in sample.user_frames.iter().rev() {
            push_frame(&mut frames, names, StackSpace::User, ip, "");
        }
        for &ip in sample.kernel_frames.iter().rev() {
            push_frame(&mut frames, names, StackSpace::Kernel, ip, "[kernel] ");
        }

        format!("{} {}", frames.join(";"), sample.count)
    }

    /// Write the whole profile in folded format
    ///
    /// # Errors
    /// Returns any error from the underlying writer
    pub fn write_folded<W: Write>(
        &self,
        out: &mut W,
        names: &(impl FrameNames + ?Sized),
    ) -> io::Result<()> {
        for sample in &self.samples {
            writeln!(out, "{}", Self::folded_line(sample, names))?;
        }
        out.flush()
    }

    /// Folded format as a string
    #[must_use]
    pub fn to_folded(&self, names: &(impl FrameNames + ?Sized)) -> String {
        self.samples.iter().map(|s| Self::folded_line(s, names) + "\n").collect()
    }
}

/// Push the names at `ip` root-most first, or the raw address
fn push_frame(
    frames: &mut Vec<String>,
    names: &(impl FrameNames + ?Sized),
    space: StackSpace,
    ip: u64,
    prefix: &str,
) {
    let resolved = names.names(space, ip);
    if resolved.is_empty() {
        frames.push(format!("{prefix}0x{ip:x}"));
        return;
    }
    // Names come innermost first; the folded line reads outermost first
    for name in resolved.iter().rev() {
        frames.push(format!("{prefix}{name}"));
    }
}

fn referenced_stack_ids(entries: &[(SampleKey, u64)]) -> HashSet<u32> {
    entries
        .iter()
        .flat_map(|(key, _)| [StackId(key.user_stack_id), StackId(key.kernel_stack_id)])
        .filter_map(StackId::map_key)
        .collect()
}

/// Collector over the kernel maps
pub struct StackCollector {
    counts: HashMap<MapData, SampleKey, u64>,
    stacks: StackTraceMap<MapData>,
}

impl StackCollector {
    /// Take ownership of the sampling maps
    ///
    /// # Errors
    /// Returns an error if either map is missing or has the wrong type
    pub fn new(bpf: &mut Ebpf) -> Result<Self, ProfilerError> {
        let counts = HashMap::try_from(
            bpf.take_map("SAMPLE_COUNTS").ok_or(ProfilerError::MapNotFound("SAMPLE_COUNTS"))?,
        )?;
        let stacks = StackTraceMap::try_from(
            bpf.take_map("STACK_TRACES").ok_or(ProfilerError::MapNotFound("STACK_TRACES"))?,
        )?;
        Ok(Self { counts, stacks })
    }

    /// Read every bucket, then delete what was read
    ///
    /// Buckets first created after the snapshot stay in the map for the next
    /// drain. Increments to an already snapshotted bucket that land before
    /// its deletion are lost.
    ///
    /// # Errors
    /// Returns an error if iterating the count map fails
    pub fn drain(&mut self) -> Result<Profile, CollectError> {
        let entries: Vec<(SampleKey, u64)> = self.counts.iter().collect::<Result<_, _>>()?;
        let referenced = referenced_stack_ids(&entries);

        let stacks = &self.stacks;
        let profile = Profile::build(entries.iter().copied(), |id| {
            stacks.get(&id, 0).ok().map(|trace| trace.frames().iter().map(|f| f.ip).collect())
        });

        for (key, _) in &entries {
            if let Err(e) = self.counts.remove(key) {
                debug!("Failed to delete sample bucket {key:?}: {e}");
            }
        }
        for id in referenced {
            if let Err(e) = self.stacks.remove(&id) {
                debug!("Failed to delete stack {id}: {e}");
            }
        }

        Ok(profile)
    }
}
