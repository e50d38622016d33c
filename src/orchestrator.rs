//! Logical block operations fanned out over per-disk sub-requests.
//!
//! The orchestrator is deliberately socket-free: it plans sub-requests, the
//! frontend turns them into [`BlockDeviceClient`](crate::pollable::BlockDeviceClient)s,
//! and results come back through [`Orchestrator::complete_sub`] addressed by
//! slab key. Continuations are never held by reference.

use std::collections::VecDeque;

use indexmap::IndexMap;
use log::{debug, warn};
use slab::Slab;

use crate::error::{Error, Result};
use crate::raid::xor_blocks;
use crate::uuid::Uuid;
use crate::volume::Volume;

pub type OpId = usize;

#[derive(Debug, Clone)]
pub enum OpKind {
    /// Read one logical block.
    Read,
    /// Write one logical block.
    Write { data: Vec<u8> },
    /// Reconstruct one stripe's block onto `target` (rebuild scan step).
    Rebuild { target: u32 },
    /// Write prebuilt header blocks to a set of disks.
    WriteHeaders { blocks: Vec<(u32, Vec<u8>)> },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubKind {
    Get,
    Put,
}

/// One sub-request the caller must issue against a block device.
#[derive(Debug, Clone)]
pub struct PlannedSub {
    pub op: OpId,
    pub sub: usize,
    pub disk_index: u32,
    pub kind: SubKind,
    /// Physical block on that disk.
    pub block: i64,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    DirectRead,
    ReconstructRead,
    /// Read-modify-write: fetch old data and old parity.
    ReadOld,
    /// Degraded write with the data disk gone: fetch surviving data blocks.
    ReadOthers,
    WriteNew,
    Done,
}

struct SubSpec {
    disk_index: u32,
    kind: SubKind,
    block: i64,
    data: Option<Vec<u8>>,
}

struct LogicalOp {
    volume: Uuid,
    /// Logical block for reads/writes; stripe number for rebuild steps.
    block: u64,
    kind: OpKind,
    phase: Phase,
    /// Disk index per sub of the current phase.
    subs: Vec<u32>,
    results: Vec<Option<Vec<u8>>>,
    outstanding: usize,
    failed_disks: Vec<u32>,
    skip_parity: bool,
    retried: bool,
    abandoned: bool,
    lock: Option<(Uuid, u64)>,
    result: Option<Result<Vec<u8>>>,
}

impl LogicalOp {
    fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }
}

/// In-flight logical operation table plus the per-stripe write queues.
pub struct Orchestrator {
    ops: Slab<LogicalOp>,
    stripe_queues: IndexMap<(Uuid, u64), VecDeque<OpId>>,
}

impl Orchestrator {
    pub fn new() -> Orchestrator {
        Orchestrator {
            ops: Slab::new(),
            stripe_queues: IndexMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.ops.len()
    }

    /// Registers a logical op. Writes and rebuild steps serialize per
    /// stripe: a second op on a busy stripe parks until the first is taken.
    pub fn submit(&mut self, volume: &mut Volume, kind: OpKind, block: u64) -> (OpId, Vec<PlannedSub>) {
        let lock = match &kind {
            OpKind::Write { .. } => volume
                .layout()
                .ok()
                .map(|l| (volume.uuid, l.stripe_of(block))),
            OpKind::Rebuild { .. } => Some((volume.uuid, block)),
            OpKind::Read | OpKind::WriteHeaders { .. } => None,
        };

        let op_id = self.ops.insert(LogicalOp {
            volume: volume.uuid,
            block,
            kind,
            phase: Phase::Done,
            subs: Vec::new(),
            results: Vec::new(),
            outstanding: 0,
            failed_disks: Vec::new(),
            skip_parity: false,
            retried: false,
            abandoned: false,
            lock,
            result: None,
        });

        if let Some(key) = lock {
            let queue = self.stripe_queues.entry(key).or_default();
            queue.push_back(op_id);
            if queue.len() > 1 {
                debug!("stripe {:?} busy, queueing op {}", key, op_id);
                return (op_id, Vec::new());
            }
        }

        let subs = self.activate(op_id, volume);
        (op_id, subs)
    }

    /// Result for a finished op, if it is finished.
    pub fn poll(&self, op_id: OpId) -> Option<&Result<Vec<u8>>> {
        self.ops
            .get(op_id)
            .filter(|op| op.is_done())
            .and_then(|op| op.result.as_ref())
    }

    /// Removes a finished op. Also activates the next op queued on the same
    /// stripe, returning its sub-requests.
    pub fn take(&mut self, op_id: OpId, volume: &mut Volume) -> (Result<Vec<u8>>, Vec<PlannedSub>) {
        let op = match self.ops.try_remove(op_id) {
            Some(op) => op,
            None => return (Err(Error::Internal(format!("op {} vanished", op_id))), Vec::new()),
        };

        let result = op
            .result
            .unwrap_or_else(|| Err(Error::Internal(format!("op {} taken before done", op_id))));

        let subs = self.release(op_id, op.lock, volume);
        (result, subs)
    }

    /// Drops the originating waiter. A still-running op finishes on its own
    /// and self-destructs; a finished one is removed now.
    pub fn abandon(&mut self, op_id: OpId, volume: &mut Volume) -> Vec<PlannedSub> {
        let done = match self.ops.get_mut(op_id) {
            Some(op) => {
                op.abandoned = true;
                op.is_done()
            }
            None => return Vec::new(),
        };

        if done {
            let (_, subs) = self.take(op_id, volume);
            subs
        } else {
            Vec::new()
        }
    }

    /// Records one sub-request outcome. When the phase completes this either
    /// advances the op, retries it once under a reassessed volume state, or
    /// finishes it.
    pub fn complete_sub(
        &mut self,
        op_id: OpId,
        sub: usize,
        outcome: Result<Vec<u8>>,
        volume: &mut Volume,
    ) -> Vec<PlannedSub> {
        {
            let op = match self.ops.get_mut(op_id) {
                Some(op) => op,
                None => return Vec::new(),
            };

            if op.is_done() || sub >= op.results.len() || op.results[sub].is_some() {
                // late or duplicate answer for a settled phase
                return Vec::new();
            }

            match outcome {
                Ok(body) => op.results[sub] = Some(body),
                Err(e) => {
                    debug!("op {} sub {} on disk {} failed: {}", op_id, sub, op.subs[sub], e);
                    op.failed_disks.push(op.subs[sub]);
                    op.results[sub] = Some(Vec::new());
                }
            }

            op.outstanding -= 1;
            if op.outstanding > 0 {
                return Vec::new();
            }
        }

        let mut subs = self.settle_phase(op_id, volume);
        subs.extend(self.reap_abandoned(op_id, volume));
        subs
    }

    /// All subs of the current phase have landed.
    fn settle_phase(&mut self, op_id: OpId, volume: &mut Volume) -> Vec<PlannedSub> {
        let (failed, retried) = {
            let op = &self.ops[op_id];
            (op.failed_disks.clone(), op.retried)
        };

        if !failed.is_empty() {
            for disk in &failed {
                volume.mark_failed(*disk);
            }
            volume.reassess();

            let op = &mut self.ops[op_id];
            if retried {
                warn!("op {} failed twice, giving up", op_id);
                op.result = Some(Err(Error::PeerUnreachable));
                op.phase = Phase::Done;
                return Vec::new();
            }

            op.retried = true;
            debug!("op {}: retrying under reassessed volume state", op_id);
            return self.activate(op_id, volume);
        }

        self.advance(op_id, volume)
    }

    /// If the op is done and nobody is waiting for it, clean it up now.
    fn reap_abandoned(&mut self, op_id: OpId, volume: &mut Volume) -> Vec<PlannedSub> {
        let clean = self
            .ops
            .get(op_id)
            .map(|op| op.is_done() && op.abandoned)
            .unwrap_or(false);

        if clean {
            let (_, subs) = self.take(op_id, volume);
            subs
        } else {
            Vec::new()
        }
    }

    /// (Re)plans the op from its current volume state and installs the first
    /// phase. A planning failure finishes the op immediately.
    fn activate(&mut self, op_id: OpId, volume: &mut Volume) -> Vec<PlannedSub> {
        let planned = {
            let op = &mut self.ops[op_id];
            op.skip_parity = false;
            plan(volume, &op.kind, op.block)
        };

        match planned {
            Ok((phase, specs, skip_parity)) => {
                self.ops[op_id].skip_parity = skip_parity;
                self.install(op_id, phase, specs, volume)
            }
            Err(e) => {
                let op = &mut self.ops[op_id];
                op.result = Some(Err(e));
                op.phase = Phase::Done;
                Vec::new()
            }
        }
    }

    /// Installs a phase. An empty phase settles immediately, which keeps the
    /// advance chain going without special cases at the call sites.
    fn install(
        &mut self,
        op_id: OpId,
        phase: Phase,
        specs: Vec<SubSpec>,
        volume: &mut Volume,
    ) -> Vec<PlannedSub> {
        {
            let op = &mut self.ops[op_id];
            op.phase = phase;
            op.subs = specs.iter().map(|s| s.disk_index).collect();
            op.results = specs.iter().map(|_| None).collect();
            op.outstanding = specs.len();
            op.failed_disks.clear();
        }

        if specs.is_empty() {
            return self.advance(op_id, volume);
        }

        specs
            .into_iter()
            .enumerate()
            .map(|(sub, spec)| PlannedSub {
                op: op_id,
                sub,
                disk_index: spec.disk_index,
                kind: spec.kind,
                block: spec.block,
                data: spec.data,
            })
            .collect()
    }

    /// Moves a cleanly completed phase to the next one.
    fn advance(&mut self, op_id: OpId, volume: &mut Volume) -> Vec<PlannedSub> {
        let op = &mut self.ops[op_id];
        let results: Vec<Vec<u8>> = op.results.iter_mut().map(|r| r.take().unwrap_or_default()).collect();
        let block_size = volume.block_size as usize;

        match (&op.kind, op.phase) {
            (OpKind::Read, Phase::DirectRead) => {
                let mut results = results;
                op.result = Some(Ok(results.swap_remove(0)));
                op.phase = Phase::Done;
                Vec::new()
            }

            (OpKind::Read, Phase::ReconstructRead) => {
                let data = xor_blocks(results.iter().map(|r| r.as_slice()), block_size);
                op.result = Some(Ok(data));
                op.phase = Phase::Done;
                Vec::new()
            }

            (OpKind::Write { data }, Phase::ReadOld) => {
                // results arrive in sub order: [old data, old parity]
                let layout = match volume.layout() {
                    Ok(layout) => layout,
                    Err(e) => {
                        op.result = Some(Err(e));
                        op.phase = Phase::Done;
                        return Vec::new();
                    }
                };
                let stripe = layout.stripe_of(op.block);
                let target = layout.data_disk(op.block);
                let parity = layout.parity_disk(stripe);

                let new_parity = xor_blocks(
                    [&results[0][..], &results[1][..], &data[..]],
                    block_size,
                );

                let specs = vec![
                    SubSpec {
                        disk_index: target,
                        kind: SubKind::Put,
                        block: stripe as i64,
                        data: Some(data.clone()),
                    },
                    SubSpec {
                        disk_index: parity,
                        kind: SubKind::Put,
                        block: stripe as i64,
                        data: Some(new_parity),
                    },
                ];
                self.install(op_id, Phase::WriteNew, specs, volume)
            }

            (OpKind::Write { data }, Phase::ReadOthers) => {
                // surviving data blocks plus the new data give the parity
                let layout = match volume.layout() {
                    Ok(layout) => layout,
                    Err(e) => {
                        op.result = Some(Err(e));
                        op.phase = Phase::Done;
                        return Vec::new();
                    }
                };
                let stripe = layout.stripe_of(op.block);
                let parity = layout.parity_disk(stripe);

                let mut blocks: Vec<&[u8]> = results.iter().map(|r| r.as_slice()).collect();
                blocks.push(data);
                let new_parity = xor_blocks(blocks, block_size);

                let specs = vec![SubSpec {
                    disk_index: parity,
                    kind: SubKind::Put,
                    block: stripe as i64,
                    data: Some(new_parity),
                }];
                self.install(op_id, Phase::WriteNew, specs, volume)
            }

            (OpKind::Write { .. }, Phase::WriteNew) => {
                if op.skip_parity {
                    if let Some((_, stripe)) = op.lock {
                        warn!("stripe {} written without parity, marking stale", stripe);
                        volume.stale_parity.insert(stripe);
                    }
                }
                op.result = Some(Ok(Vec::new()));
                op.phase = Phase::Done;
                Vec::new()
            }

            (OpKind::Rebuild { target }, Phase::ReconstructRead) => {
                let target = *target;
                let data = xor_blocks(results.iter().map(|r| r.as_slice()), block_size);
                let specs = vec![SubSpec {
                    disk_index: target,
                    kind: SubKind::Put,
                    block: op.block as i64,
                    data: Some(data),
                }];
                self.install(op_id, Phase::WriteNew, specs, volume)
            }

            (OpKind::Rebuild { .. }, Phase::WriteNew)
            | (OpKind::WriteHeaders { .. }, Phase::WriteNew) => {
                op.result = Some(Ok(Vec::new()));
                op.phase = Phase::Done;
                Vec::new()
            }

            (kind, phase) => {
                warn!("op {} in impossible state {:?}/{:?}", op_id, kind_name(kind), phase);
                op.result = Some(Err(Error::Internal("orchestrator state mismatch".into())));
                op.phase = Phase::Done;
                Vec::new()
            }
        }
    }

    /// Unlinks a removed op from its stripe queue and wakes the next one.
    fn release(
        &mut self,
        op_id: OpId,
        lock: Option<(Uuid, u64)>,
        volume: &mut Volume,
    ) -> Vec<PlannedSub> {
        let key = match lock {
            Some(key) => key,
            None => return Vec::new(),
        };

        let mut next = None;
        let mut drained = false;

        if let Some(queue) = self.stripe_queues.get_mut(&key) {
            let was_front = queue.front() == Some(&op_id);
            queue.retain(|&id| id != op_id);

            if queue.is_empty() {
                drained = true;
            } else if was_front {
                next = queue.front().copied();
            }
        }

        if drained {
            self.stripe_queues.swap_remove(&key);
        }

        match next {
            Some(next) => {
                debug!("stripe {:?}: waking queued op {}", key, next);
                self.activate(next, volume)
            }
            None => Vec::new(),
        }
    }
}

impl Default for Orchestrator {
    fn default() -> Orchestrator {
        Orchestrator::new()
    }
}

fn kind_name(kind: &OpKind) -> &'static str {
    match kind {
        OpKind::Read => "read",
        OpKind::Write { .. } => "write",
        OpKind::Rebuild { .. } => "rebuild",
        OpKind::WriteHeaders { .. } => "write-headers",
    }
}

/// Plans the first phase of an op against the current slot states.
///
/// Returns the phase, its sub-requests and whether the plan skips the
/// parity write.
fn plan(volume: &Volume, kind: &OpKind, block: u64) -> Result<(Phase, Vec<SubSpec>, bool)> {
    match kind {
        OpKind::Read => {
            let layout = volume.layout()?;
            if block >= volume.logical_blocks() {
                return Err(Error::DiskMissing);
            }

            let stripe = layout.stripe_of(block);
            let target = layout.data_disk(block);

            if volume.disk_serves(target, stripe) {
                return Ok((
                    Phase::DirectRead,
                    vec![get(target, stripe)],
                    false,
                ));
            }

            let others: Vec<u32> = (0..layout.disks()).filter(|&d| d != target).collect();
            if others.iter().any(|&d| !volume.disk_serves(d, stripe)) {
                return Err(Error::VolumeDead);
            }

            Ok((
                Phase::ReconstructRead,
                others.into_iter().map(|d| get(d, stripe)).collect(),
                false,
            ))
        }

        OpKind::Write { data } => {
            let layout = volume.layout()?;
            if block >= volume.logical_blocks() {
                return Err(Error::DiskMissing);
            }
            if data.len() != volume.block_size as usize {
                return Err(Error::ProtocolMalformed);
            }

            let stripe = layout.stripe_of(block);
            let target = layout.data_disk(block);
            let parity = layout.parity_disk(stripe);

            let target_up = volume.disk_serves(target, stripe);
            let parity_up = volume.disk_serves(parity, stripe);

            match (target_up, parity_up) {
                (true, true) => Ok((
                    Phase::ReadOld,
                    vec![get(target, stripe), get(parity, stripe)],
                    false,
                )),

                // parity disk is gone: write the data, mark parity stale
                (true, false) => Ok((
                    Phase::WriteNew,
                    vec![SubSpec {
                        disk_index: target,
                        kind: SubKind::Put,
                        block: stripe as i64,
                        data: Some(data.clone()),
                    }],
                    true,
                )),

                // data disk is gone: recompute parity from the survivors
                (false, true) => {
                    let others: Vec<u32> = (0..layout.disks())
                        .filter(|&d| d != target && d != parity)
                        .collect();
                    if others.iter().any(|&d| !volume.disk_serves(d, stripe)) {
                        return Err(Error::VolumeDead);
                    }
                    Ok((
                        Phase::ReadOthers,
                        others.into_iter().map(|d| get(d, stripe)).collect(),
                        false,
                    ))
                }

                (false, false) => Err(Error::VolumeDead),
            }
        }

        OpKind::Rebuild { target } => {
            let layout = volume.layout()?;
            let stripe = block;
            if stripe >= volume.block_count {
                return Err(Error::Internal("rebuild past end of disk".into()));
            }
            if !volume.slot_bound(*target) {
                return Err(Error::DiskMissing);
            }

            let others: Vec<u32> = (0..layout.disks()).filter(|&d| d != *target).collect();
            if others.iter().any(|&d| !volume.disk_serves(d, stripe)) {
                return Err(Error::VolumeDegraded);
            }

            Ok((
                Phase::ReconstructRead,
                others.into_iter().map(|d| get(d, stripe)).collect(),
                false,
            ))
        }

        OpKind::WriteHeaders { blocks } => {
            if blocks.is_empty() {
                return Err(Error::Internal("header write with no targets".into()));
            }
            for (disk, _) in blocks {
                if !volume.slot_bound(*disk) {
                    return Err(Error::DiskMissing);
                }
            }

            Ok((
                Phase::WriteNew,
                blocks
                    .iter()
                    .map(|(disk, data)| SubSpec {
                        disk_index: *disk,
                        kind: SubKind::Put,
                        block: -1,
                        data: Some(data.clone()),
                    })
                    .collect(),
                false,
            ))
        }
    }
}

fn get(disk_index: u32, stripe: u64) -> SubSpec {
    SubSpec {
        disk_index,
        kind: SubKind::Get,
        block: stripe as i64,
        data: None,
    }
}
