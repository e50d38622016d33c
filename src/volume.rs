//! Volume state, disk-slot binding and the rebuild driver.
//!
//! The frontend's view of the world lives here: which disks have announced
//! themselves, which slot of which volume each one is bound to, and how far
//! along any rebuild is. Everything is mutated from reactor callbacks only.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use log::{debug, info, warn};

use crate::app::Settings;
use crate::config::{FrontendConfig, MulticastConfig, VolumeConfig};
use crate::disk::{DiskHeader, REBUILD_GENERATION_BASE};
use crate::error::{Error, Result};
use crate::orchestrator::{OpId, OpKind, Orchestrator, PlannedSub, SubKind};
use crate::pollable::{BlockDeviceClient, ClientPurpose, OutboundRequest, Pollable};
use crate::raid::Layout;
use crate::uuid::Uuid;

/// Rebuild progress is persisted to the rebuilding disk's header every this
/// many stripes.
pub const REBUILD_CHECKPOINT_STRIPES: u64 = 64;

/// Epoch written on volume initialization.
pub const INITIAL_EPOCH: u64 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotState {
    Offline,
    Online,
    Rebuilding,
    Failed,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Offline => "offline",
            SlotState::Online => "online",
            SlotState::Rebuilding => "rebuilding",
            SlotState::Failed => "failed",
        }
    }
}

/// A volume position bound to a concrete disk.
#[derive(Debug, Clone)]
pub struct DiskSlot {
    pub disk_uuid: Uuid,
    pub address: SocketAddr,
    pub state: SlotState,
    pub generation: u64,
    pub last_seen: Instant,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VolumeState {
    Uninitialized,
    Initializing,
    Ready,
    Degraded,
    Rebuilding,
    Dead,
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Uninitialized => "uninitialized",
            VolumeState::Initializing => "initializing",
            VolumeState::Ready => "ready",
            VolumeState::Degraded => "degraded",
            VolumeState::Rebuilding => "rebuilding",
            VolumeState::Dead => "dead",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RebuildStep {
    Stripe,
    Checkpoint,
    Finalize,
}

#[derive(Debug)]
pub struct RebuildProgress {
    pub disk_index: u32,
    pub next_stripe: u64,
    pub last_checkpoint: u64,
    pub op: Option<(OpId, RebuildStep)>,
}

pub struct Volume {
    pub uuid: Uuid,
    pub long_password: String,
    pub block_size: u32,
    /// Blocks per disk, which is also the stripe count.
    pub block_count: u64,
    pub state: VolumeState,
    /// Shared header generation of a clean volume.
    pub epoch: u64,
    pub slots: Vec<Option<DiskSlot>>,
    /// Stripes whose parity was skipped during a degraded write.
    pub stale_parity: IndexSet<u64>,
    pub rebuild: Option<RebuildProgress>,
    pub init_op: Option<OpId>,
}

impl Volume {
    pub fn from_config(config: &VolumeConfig) -> Volume {
        Volume {
            uuid: config.volume_uuid,
            long_password: config.long_password.clone(),
            block_size: config.block_size,
            block_count: config.block_count,
            state: VolumeState::Uninitialized,
            epoch: 0,
            slots: Vec::new(),
            stale_parity: IndexSet::new(),
            rebuild: None,
            init_op: None,
        }
    }

    pub fn disk_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn layout(&self) -> Result<Layout> {
        if self.slots.len() < 3 {
            return Err(Error::VolumeDegraded);
        }
        Ok(Layout::new(self.slots.len() as u32))
    }

    /// Total addressable logical blocks.
    pub fn logical_blocks(&self) -> u64 {
        match self.slots.len() {
            0 | 1 => 0,
            n => self.block_count * (n as u64 - 1),
        }
    }

    pub fn slot(&self, disk_index: u32) -> Option<&DiskSlot> {
        self.slots.get(disk_index as usize).and_then(|s| s.as_ref())
    }

    pub fn slot_mut(&mut self, disk_index: u32) -> Option<&mut DiskSlot> {
        self.slots.get_mut(disk_index as usize).and_then(|s| s.as_mut())
    }

    pub fn slot_bound(&self, disk_index: u32) -> bool {
        self.slot(disk_index).is_some()
    }

    pub fn find_slot_by_disk(&self, disk_uuid: Uuid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(slot) if slot.disk_uuid == disk_uuid))
    }

    /// Whether `disk_index` can serve reads and writes for `stripe`.
    ///
    /// A rebuilding disk serves the stripes the rebuild has already passed;
    /// everything beyond its scan position is still stale.
    pub fn disk_serves(&self, disk_index: u32, stripe: u64) -> bool {
        match self.slot(disk_index).map(|s| s.state) {
            Some(SlotState::Online) => true,
            Some(SlotState::Rebuilding) => self
                .rebuild
                .as_ref()
                .map(|r| r.disk_index == disk_index && stripe < r.next_stripe)
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn mark_failed(&mut self, disk_index: u32) {
        let uuid = self.uuid;

        if let Some(slot) = self.slot_mut(disk_index) {
            if matches!(slot.state, SlotState::Online | SlotState::Rebuilding) {
                warn!("volume {}: disk {} (slot {}) failed", uuid, slot.disk_uuid, disk_index);
                slot.state = SlotState::Failed;
            }
        }

        if self
            .rebuild
            .as_ref()
            .map(|r| r.disk_index == disk_index)
            .unwrap_or(false)
        {
            self.rebuild = None;
        }
    }

    /// Re-derives the volume state from its slot table.
    pub fn reassess(&mut self) {
        if matches!(self.state, VolumeState::Uninitialized | VolumeState::Initializing) {
            return;
        }

        let n = self.slots.len();
        let online = self
            .slots
            .iter()
            .filter(|s| matches!(s, Some(slot) if slot.state == SlotState::Online))
            .count();
        let rebuilding = self
            .slots
            .iter()
            .any(|s| matches!(s, Some(slot) if slot.state == SlotState::Rebuilding));

        let next = if online == n {
            VolumeState::Ready
        } else if online + 1 == n {
            if rebuilding {
                VolumeState::Rebuilding
            } else {
                VolumeState::Degraded
            }
        } else {
            VolumeState::Dead
        };

        if next != self.state {
            info!("volume {}: {} -> {}", self.uuid, self.state.as_str(), next.as_str());
            self.state = next;
        }
    }

    /// Builds the header block for one slot, padded out to `block_size`.
    pub fn header_block(&self, disk_index: u32, generation: u64) -> Option<Vec<u8>> {
        let slot = self.slot(disk_index)?;
        let header = DiskHeader {
            volume_uuid: self.uuid,
            disk_uuid: slot.disk_uuid,
            disk_index,
            disk_count: self.disk_count(),
            block_size: self.block_size,
            generation,
        };

        let mut block = vec![0u8; self.block_size as usize];
        let encoded = header.encode();
        block[..encoded.len()].copy_from_slice(&encoded);
        Some(block)
    }
}

/// A disk currently heard on the multicast channel.
#[derive(Debug, Clone)]
pub struct AvailableDisk {
    pub address: SocketAddr,
    pub volume_uuid: Uuid,
    pub last_seen: Instant,
}

/// Everything the frontend server knows, outside of its sockets.
pub struct FrontendState {
    pub volumes: IndexMap<Uuid, Volume>,
    pub available_disks: IndexMap<Uuid, AvailableDisk>,
    pub orchestrator: Orchestrator,
    pub long_password: String,
    pub multicast: MulticastConfig,
    probes: IndexMap<Uuid, Instant>,
}

impl FrontendState {
    pub fn new(config: FrontendConfig) -> FrontendState {
        let volumes = config
            .volumes
            .iter()
            .map(|v| (v.volume_uuid, Volume::from_config(v)))
            .collect();

        FrontendState {
            volumes,
            available_disks: IndexMap::new(),
            orchestrator: Orchestrator::new(),
            long_password: config.long_password,
            multicast: config.multicast,
            probes: IndexMap::new(),
        }
    }

    /// Feeds one multicast beacon into the disk table.
    pub fn record_beacon(
        &mut self,
        disk_uuid: Uuid,
        address: SocketAddr,
        volume_uuid: Uuid,
        now: Instant,
    ) {
        self.available_disks.insert(
            disk_uuid,
            AvailableDisk {
                address,
                volume_uuid,
                last_seen: now,
            },
        );

        if let Some(vol) = self.volumes.get_mut(&volume_uuid) {
            if let Some(idx) = vol.find_slot_by_disk(disk_uuid) {
                if let Some(slot) = vol.slots[idx].as_mut() {
                    slot.last_seen = now;
                    slot.address = address;
                }
            }
        }
    }

    pub fn start_read(
        &mut self,
        volume_uuid: Uuid,
        block: u64,
        now: Instant,
        settings: &Settings,
    ) -> Result<(OpId, Vec<Box<dyn Pollable>>)> {
        let vol = serving_volume(&mut self.volumes, volume_uuid)?;
        let (op, subs) = self.orchestrator.submit(vol, OpKind::Read, block);
        let spawns = self.spawn_subs(volume_uuid, subs, now, settings);
        Ok((op, spawns))
    }

    pub fn start_write(
        &mut self,
        volume_uuid: Uuid,
        block: u64,
        data: Vec<u8>,
        now: Instant,
        settings: &Settings,
    ) -> Result<(OpId, Vec<Box<dyn Pollable>>)> {
        let vol = serving_volume(&mut self.volumes, volume_uuid)?;
        let (op, subs) = self.orchestrator.submit(vol, OpKind::Write { data }, block);
        let spawns = self.spawn_subs(volume_uuid, subs, now, settings);
        Ok((op, spawns))
    }

    /// Binds every announced disk of `volume_uuid` into a fresh slot table
    /// and fans out the header writes.
    pub fn start_init(
        &mut self,
        volume_uuid: Uuid,
        now: Instant,
        settings: &Settings,
    ) -> Result<(OpId, Vec<Box<dyn Pollable>>)> {
        let ttl = beacon_ttl(settings);
        let candidates: Vec<(Uuid, SocketAddr)> = self
            .available_disks
            .iter()
            .filter(|(_, d)| d.volume_uuid == volume_uuid)
            .filter(|(_, d)| now.duration_since(d.last_seen) <= ttl)
            .map(|(&uuid, d)| (uuid, d.address))
            .collect();

        let vol = self
            .volumes
            .get_mut(&volume_uuid)
            .ok_or(Error::DiskMissing)?;

        match vol.state {
            VolumeState::Uninitialized | VolumeState::Dead => {}
            _ => {
                return Err(Error::Internal(format!(
                    "volume {} is {}, refusing to reinitialize",
                    volume_uuid,
                    vol.state.as_str()
                )))
            }
        }

        if candidates.len() < 3 {
            debug!(
                "volume {}: only {} disks announced, waiting for 3",
                volume_uuid,
                candidates.len()
            );
            return Err(Error::VolumeDegraded);
        }

        vol.slots = candidates
            .iter()
            .map(|&(disk_uuid, address)| {
                Some(DiskSlot {
                    disk_uuid,
                    address,
                    state: SlotState::Offline,
                    generation: INITIAL_EPOCH,
                    last_seen: now,
                })
            })
            .collect();
        vol.epoch = INITIAL_EPOCH;
        vol.state = VolumeState::Initializing;
        vol.stale_parity.clear();
        vol.rebuild = None;

        let blocks: Vec<(u32, Vec<u8>)> = (0..vol.disk_count())
            .map(|i| {
                let block = vol
                    .header_block(i, INITIAL_EPOCH)
                    .expect("slot bound above");
                (i, block)
            })
            .collect();

        info!(
            "volume {}: initializing across {} disks",
            volume_uuid,
            blocks.len()
        );

        let (op, subs) = self
            .orchestrator
            .submit(vol, OpKind::WriteHeaders { blocks }, 0);
        vol.init_op = Some(op);

        let spawns = self.spawn_subs(volume_uuid, subs, now, settings);
        Ok((op, spawns))
    }

    /// Settles a finished init op: on success every slot goes online.
    pub fn finish_init(
        &mut self,
        volume_uuid: Uuid,
        op: OpId,
        now: Instant,
        settings: &Settings,
    ) -> (Result<()>, Vec<Box<dyn Pollable>>) {
        let (result, spawns) = self.finish_op(volume_uuid, op, now, settings);

        if let Some(vol) = self.volumes.get_mut(&volume_uuid) {
            vol.init_op = None;

            match &result {
                Ok(_) => {
                    for slot in vol.slots.iter_mut().flatten() {
                        slot.state = SlotState::Online;
                        slot.last_seen = now;
                    }
                    vol.state = VolumeState::Ready;
                    info!("volume {}: initialized, ready", volume_uuid);
                }
                Err(e) => {
                    warn!("volume {}: initialization failed: {}", volume_uuid, e);
                    vol.slots.clear();
                    vol.state = VolumeState::Uninitialized;
                    vol.epoch = 0;
                }
            }
        }

        (result.map(|_| ()), spawns)
    }

    pub fn poll_op(&self, op: OpId) -> Option<&Result<Vec<u8>>> {
        self.orchestrator.poll(op)
    }

    /// Removes a completed op, returning its result plus any clients for the
    /// next write queued on the same stripe.
    pub fn finish_op(
        &mut self,
        volume_uuid: Uuid,
        op: OpId,
        now: Instant,
        settings: &Settings,
    ) -> (Result<Vec<u8>>, Vec<Box<dyn Pollable>>) {
        let vol = match self.volumes.get_mut(&volume_uuid) {
            Some(vol) => vol,
            None => return (Err(Error::DiskMissing), Vec::new()),
        };

        let (result, subs) = self.orchestrator.take(op, vol);
        let spawns = self.spawn_subs(volume_uuid, subs, now, settings);
        (result, spawns)
    }

    /// The originating connection went away; the op finishes on its own and
    /// its result is dropped.
    pub fn abandon_op(
        &mut self,
        volume_uuid: Uuid,
        op: OpId,
        now: Instant,
        settings: &Settings,
    ) -> Vec<Box<dyn Pollable>> {
        let vol = match self.volumes.get_mut(&volume_uuid) {
            Some(vol) => vol,
            None => return Vec::new(),
        };

        let subs = self.orchestrator.abandon(op, vol);
        self.spawn_subs(volume_uuid, subs, now, settings)
    }

    /// Called by a block device client when its exchange settles.
    pub fn handle_sub_result(
        &mut self,
        volume_uuid: Uuid,
        op: OpId,
        sub: usize,
        outcome: Result<Vec<u8>>,
        now: Instant,
        settings: &Settings,
    ) -> Vec<Box<dyn Pollable>> {
        let vol = match self.volumes.get_mut(&volume_uuid) {
            Some(vol) => vol,
            None => return Vec::new(),
        };

        let subs = self.orchestrator.complete_sub(op, sub, outcome, vol);
        self.spawn_subs(volume_uuid, subs, now, settings)
    }

    /// Turns planned sub-requests into connected block device clients. A
    /// connect that fails outright is fed back as a sub failure, which may
    /// replan and yield further subs.
    fn spawn_subs(
        &mut self,
        volume_uuid: Uuid,
        mut subs: Vec<PlannedSub>,
        now: Instant,
        settings: &Settings,
    ) -> Vec<Box<dyn Pollable>> {
        let mut clients: Vec<Box<dyn Pollable>> = Vec::new();

        while let Some(sub) = subs.pop() {
            let address = self
                .volumes
                .get(&volume_uuid)
                .and_then(|v| v.slot(sub.disk_index))
                .map(|s| s.address);

            let connected = address.ok_or(Error::DiskMissing).and_then(|addr| {
                let request = match sub.kind {
                    SubKind::Get => {
                        OutboundRequest::get(format!("/get_block?block={}", sub.block))
                    }
                    SubKind::Put => OutboundRequest::post(
                        format!("/set_block?block={}", sub.block),
                        sub.data.clone().unwrap_or_default(),
                    ),
                };

                BlockDeviceClient::connect(
                    addr,
                    request,
                    ClientPurpose::Orchestrated {
                        volume: volume_uuid,
                        op: sub.op,
                        sub: sub.sub,
                    },
                    now + settings.block_request_timeout,
                )
            });

            match connected {
                Ok(client) => clients.push(Box::new(client)),
                Err(e) => {
                    warn!(
                        "volume {}: cannot reach disk slot {}: {}",
                        volume_uuid, sub.disk_index, e
                    );
                    let more = self.orchestrator.complete_sub(
                        sub.op,
                        sub.sub,
                        Err(Error::PeerUnreachable),
                        self.volumes.get_mut(&volume_uuid).expect("volume exists"),
                    );
                    subs.extend(more);
                }
            }
        }

        clients
    }

    /// Digests a `/get_disk_info` probe answer and binds the disk to a slot
    /// when it belongs somewhere.
    pub fn handle_probe(&mut self, disk_uuid: Uuid, outcome: Result<Vec<u8>>, now: Instant) {
        self.probes.swap_remove(&disk_uuid);

        let (address, volume_uuid) = match self.available_disks.get(&disk_uuid) {
            Some(avail) => (avail.address, avail.volume_uuid),
            None => return,
        };

        let vol = match self.volumes.get_mut(&volume_uuid) {
            Some(vol) => vol,
            None => return,
        };

        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("probe of disk {} failed: {}", disk_uuid, e);
                return;
            }
        };

        if vol.slots.is_empty() {
            // no slot table yet: a valid header means this disk carries a
            // volume written before we started, so mount its geometry
            let mountable = DiskHeader::decode(&bytes).ok().filter(|h| {
                h.volume_uuid == vol.uuid
                    && h.disk_uuid == disk_uuid
                    && h.disk_count >= 3
                    && h.disk_index < h.disk_count
                    && h.block_size == vol.block_size
                    && h.generation < REBUILD_GENERATION_BASE
            });

            if let Some(h) = mountable {
                info!(
                    "volume {}: mounting, {} disks per disk {} (epoch {})",
                    volume_uuid, h.disk_count, disk_uuid, h.generation
                );
                vol.slots = (0..h.disk_count).map(|_| None).collect();
                vol.epoch = h.generation;
                vol.slots[h.disk_index as usize] = Some(DiskSlot {
                    disk_uuid,
                    address,
                    state: SlotState::Online,
                    generation: h.generation,
                    last_seen: now,
                });
                // recomputed from the slot table; one disk of N is dead
                vol.state = VolumeState::Dead;
                vol.reassess();
            }
            return;
        }

        let header = DiskHeader::decode(&bytes).ok().filter(|h| {
            h.volume_uuid == vol.uuid
                && h.disk_uuid == disk_uuid
                && (h.disk_index as usize) < vol.slots.len()
                && h.disk_count == vol.disk_count()
                && h.block_size == vol.block_size
        });

        match header {
            Some(h) => {
                let idx = h.disk_index as usize;

                // a disk carrying a newer clean epoch wins: everything older
                // is stale and must rebuild
                if h.generation < REBUILD_GENERATION_BASE && h.generation > vol.epoch {
                    info!(
                        "volume {}: adopting newer epoch {} from disk {}",
                        volume_uuid, h.generation, disk_uuid
                    );
                    vol.epoch = h.generation;
                    for slot in vol.slots.iter_mut().flatten() {
                        if slot.generation < h.generation && slot.state == SlotState::Online {
                            slot.state = SlotState::Failed;
                        }
                    }
                }

                if let Some(slot) = &vol.slots[idx] {
                    let taken = slot.disk_uuid != disk_uuid
                        && matches!(slot.state, SlotState::Online | SlotState::Rebuilding);
                    if taken {
                        warn!(
                            "disk {} claims slot {} of volume {}, already held by {}",
                            disk_uuid, idx, volume_uuid, slot.disk_uuid
                        );
                        return;
                    }
                }

                if h.generation == vol.epoch {
                    info!(
                        "volume {}: disk {} back online in slot {}",
                        volume_uuid, disk_uuid, idx
                    );
                    vol.slots[idx] = Some(DiskSlot {
                        disk_uuid,
                        address,
                        state: SlotState::Online,
                        generation: h.generation,
                        last_seen: now,
                    });
                    vol.reassess();
                } else {
                    if vol.rebuild.is_some() {
                        return;
                    }
                    let start = h
                        .rebuild_checkpoint()
                        .filter(|&s| s <= vol.block_count)
                        .unwrap_or(0);
                    info!(
                        "volume {}: disk {} rejoins slot {} stale, rebuilding from stripe {}",
                        volume_uuid, disk_uuid, idx, start
                    );
                    vol.slots[idx] = Some(DiskSlot {
                        disk_uuid,
                        address,
                        state: SlotState::Rebuilding,
                        generation: h.generation,
                        last_seen: now,
                    });
                    vol.rebuild = Some(RebuildProgress {
                        disk_index: idx as u32,
                        next_stripe: start,
                        last_checkpoint: start,
                        op: None,
                    });
                    vol.reassess();
                }
            }
            None => {
                // blank or foreign disk: adopt it as a replacement for the
                // first failed slot
                if vol.rebuild.is_some() {
                    return;
                }
                let failed = vol
                    .slots
                    .iter()
                    .position(|s| matches!(s, Some(slot) if slot.state == SlotState::Failed));

                if let Some(idx) = failed {
                    info!(
                        "volume {}: blank disk {} replaces slot {}, rebuilding",
                        volume_uuid, disk_uuid, idx
                    );
                    vol.slots[idx] = Some(DiskSlot {
                        disk_uuid,
                        address,
                        state: SlotState::Rebuilding,
                        generation: 0,
                        last_seen: now,
                    });
                    vol.rebuild = Some(RebuildProgress {
                        disk_index: idx as u32,
                        next_stripe: 0,
                        last_checkpoint: 0,
                        op: None,
                    });
                    vol.reassess();
                }
            }
        }
    }

    /// Periodic housekeeping, run from the reactor idle tick.
    pub fn on_idle(&mut self, now: Instant, settings: &Settings) -> Vec<Box<dyn Pollable>> {
        let mut spawns = Vec::new();
        let ttl = beacon_ttl(settings);

        self.available_disks
            .retain(|_, d| now.duration_since(d.last_seen) <= ttl);
        self.probes
            .retain(|_, &mut started| now.duration_since(started) <= 2 * settings.block_request_timeout);

        // slot watchdog: no beacon for the TTL means the disk is gone
        for vol in self.volumes.values_mut() {
            let mut failed = Vec::new();
            for (idx, slot) in vol.slots.iter().enumerate() {
                if let Some(slot) = slot {
                    let silent = now.duration_since(slot.last_seen) > ttl;
                    if silent && matches!(slot.state, SlotState::Online | SlotState::Rebuilding) {
                        failed.push(idx as u32);
                    }
                }
            }
            for idx in failed {
                vol.mark_failed(idx);
            }
            vol.reassess();
        }

        spawns.extend(self.probe_candidates(now, settings));
        spawns.extend(self.rebuild_tick(now, settings));
        spawns
    }

    /// Spawns `/get_disk_info` probes for announced disks that might belong
    /// in a slot.
    fn probe_candidates(&mut self, now: Instant, settings: &Settings) -> Vec<Box<dyn Pollable>> {
        let mut spawns: Vec<Box<dyn Pollable>> = Vec::new();

        let candidates: Vec<(Uuid, SocketAddr)> = self
            .available_disks
            .iter()
            .filter_map(|(&disk_uuid, avail)| {
                let vol = self.volumes.get(&avail.volume_uuid)?;
                if self.probes.contains_key(&disk_uuid) {
                    return None;
                }

                // no slot table yet: any announced disk may carry a volume
                // to mount
                if vol.slots.is_empty() {
                    if vol.state == VolumeState::Uninitialized {
                        return Some((disk_uuid, avail.address));
                    }
                    return None;
                }

                match vol.find_slot_by_disk(disk_uuid) {
                    Some(idx) => {
                        // bound already; probe only if it fell out and may
                        // come back
                        let state = vol.slots[idx].as_ref().map(|s| s.state);
                        if state == Some(SlotState::Failed) && vol.rebuild.is_none() {
                            Some((disk_uuid, avail.address))
                        } else {
                            None
                        }
                    }
                    None => {
                        // unknown disk; interesting if a slot is empty or
                        // needs a replacement
                        let needs_disk = vol.slots.iter().any(|s| match s {
                            None => true,
                            Some(slot) => slot.state == SlotState::Failed,
                        });
                        if needs_disk && vol.rebuild.is_none() {
                            Some((disk_uuid, avail.address))
                        } else {
                            None
                        }
                    }
                }
            })
            .collect();

        for (disk_uuid, address) in candidates {
            match BlockDeviceClient::connect(
                address,
                OutboundRequest::get("/get_disk_info".to_string()),
                ClientPurpose::DiskProbe { disk: disk_uuid },
                now + settings.block_request_timeout,
            ) {
                Ok(client) => {
                    debug!("probing disk {} at {}", disk_uuid, address);
                    self.probes.insert(disk_uuid, now);
                    spawns.push(Box::new(client) as Box<dyn Pollable>);
                }
                Err(e) => debug!("cannot probe disk {}: {}", disk_uuid, e),
            }
        }

        spawns
    }

    /// Drives every in-flight rebuild forward by at most one step.
    fn rebuild_tick(&mut self, now: Instant, settings: &Settings) -> Vec<Box<dyn Pollable>> {
        let mut spawns = Vec::new();
        let volume_ids: Vec<Uuid> = self.volumes.keys().copied().collect();

        for volume_uuid in volume_ids {
            // settle a finished step first
            let finished = {
                let vol = &self.volumes[&volume_uuid];
                vol.rebuild.as_ref().and_then(|r| r.op).filter(|&(op, _)| {
                    self.orchestrator.poll(op).is_some()
                })
            };

            if let Some((op, step)) = finished {
                let (result, more) = self.finish_op(volume_uuid, op, now, settings);
                spawns.extend(more);

                let vol = self.volumes.get_mut(&volume_uuid).expect("volume exists");
                match (&result, step) {
                    (Ok(_), RebuildStep::Stripe) => {
                        if let Some(r) = vol.rebuild.as_mut() {
                            r.op = None;
                            r.next_stripe += 1;
                        }
                    }
                    (Ok(_), RebuildStep::Checkpoint) => {
                        if let Some(r) = vol.rebuild.as_mut() {
                            r.op = None;
                            r.last_checkpoint = r.next_stripe;
                        }
                    }
                    (Ok(_), RebuildStep::Finalize) => {
                        vol.epoch += 1;
                        let epoch = vol.epoch;
                        let target = vol.rebuild.as_ref().map(|r| r.disk_index);
                        for slot in vol.slots.iter_mut().flatten() {
                            slot.generation = epoch;
                        }
                        if let Some(idx) = target {
                            if let Some(slot) = vol.slot_mut(idx) {
                                slot.state = SlotState::Online;
                            }
                        }
                        vol.rebuild = None;
                        vol.reassess();
                        info!("volume {}: rebuild complete, epoch {}", volume_uuid, epoch);
                    }
                    (Err(e), _) => {
                        warn!("volume {}: rebuild step failed: {}", volume_uuid, e);
                        if let Some(r) = vol.rebuild.as_mut() {
                            // the failing disk was already marked; retry the
                            // same stripe next tick if the rebuild survives
                            r.op = None;
                        }
                        vol.reassess();
                    }
                }
            }

            // then submit the next step if the rebuild is idle
            let submit = {
                let vol = self.volumes.get_mut(&volume_uuid).expect("volume exists");

                let target_ok = vol.rebuild.as_ref().map(|r| {
                    matches!(
                        vol.slot(r.disk_index).map(|s| s.state),
                        Some(SlotState::Rebuilding)
                    )
                });
                if target_ok == Some(false) {
                    vol.rebuild = None;
                }

                match &vol.rebuild {
                    Some(r) if r.op.is_none() => {
                        let target = r.disk_index;
                        if r.next_stripe >= vol.block_count {
                            let epoch = vol.epoch + 1;
                            let blocks: Vec<(u32, Vec<u8>)> = (0..vol.disk_count())
                                .filter(|&i| vol.slot_bound(i))
                                .map(|i| (i, vol.header_block(i, epoch).expect("bound")))
                                .collect();
                            Some((RebuildStep::Finalize, OpKind::WriteHeaders { blocks }, 0))
                        } else if r.next_stripe > r.last_checkpoint
                            && r.next_stripe - r.last_checkpoint >= REBUILD_CHECKPOINT_STRIPES
                        {
                            let generation = REBUILD_GENERATION_BASE + r.next_stripe;
                            let block = vol
                                .header_block(target, generation)
                                .expect("rebuilding slot is bound");
                            Some((
                                RebuildStep::Checkpoint,
                                OpKind::WriteHeaders {
                                    blocks: vec![(target, block)],
                                },
                                0,
                            ))
                        } else {
                            Some((
                                RebuildStep::Stripe,
                                OpKind::Rebuild { target },
                                r.next_stripe,
                            ))
                        }
                    }
                    _ => None,
                }
            };

            if let Some((step, kind, block)) = submit {
                let vol = self.volumes.get_mut(&volume_uuid).expect("volume exists");
                let (op, subs) = self.orchestrator.submit(vol, kind, block);
                if let Some(r) = vol.rebuild.as_mut() {
                    r.op = Some((op, step));
                }
                spawns.extend(self.spawn_subs(volume_uuid, subs, now, settings));
            }
        }

        spawns
    }
}

fn serving_volume(
    volumes: &mut IndexMap<Uuid, Volume>,
    volume_uuid: Uuid,
) -> Result<&mut Volume> {
    let vol = volumes.get_mut(&volume_uuid).ok_or(Error::DiskMissing)?;

    match vol.state {
        VolumeState::Ready | VolumeState::Degraded | VolumeState::Rebuilding => Ok(vol),
        VolumeState::Dead => Err(Error::VolumeDead),
        VolumeState::Uninitialized | VolumeState::Initializing => Err(Error::VolumeDegraded),
    }
}

pub fn beacon_ttl(settings: &Settings) -> Duration {
    3 * settings.poll_timeout
}

#[cfg(test)]
mod tests {
    use crate::config::VolumeConfig;
    use crate::disk::DiskHeader;

    use super::*;

    fn uuid(tail: &str) -> Uuid {
        format!("00000000-0000-0000-0000-0000000000{}", tail)
            .parse()
            .unwrap()
    }

    fn ready_volume(disks: usize) -> Volume {
        let mut vol = Volume::from_config(&VolumeConfig {
            volume_uuid: uuid("aa"),
            long_password: "pw".into(),
            block_size: 4096,
            block_count: 256,
        });

        vol.state = VolumeState::Ready;
        vol.epoch = 1;
        for i in 0..disks {
            vol.slots.push(Some(DiskSlot {
                disk_uuid: uuid(&format!("b{}", i)),
                address: "127.0.0.1:9000".parse().unwrap(),
                state: SlotState::Online,
                generation: 1,
                last_seen: Instant::now(),
            }));
        }

        vol
    }

    fn frontend(vol: Volume) -> FrontendState {
        let mut state = FrontendState::new(FrontendConfig {
            volumes: Vec::new(),
            multicast: MulticastConfig {
                address: "239.255.0.1".parse().unwrap(),
                port: 5555,
            },
            long_password: "pw".into(),
        });
        state.volumes.insert(vol.uuid, vol);
        state
    }

    #[test]
    fn state_follows_slot_health() {
        let mut vol = ready_volume(3);
        assert_eq!(vol.state, VolumeState::Ready);

        vol.mark_failed(1);
        vol.reassess();
        assert_eq!(vol.state, VolumeState::Degraded);

        vol.mark_failed(2);
        vol.reassess();
        assert_eq!(vol.state, VolumeState::Dead);
    }

    #[test]
    fn rebuilding_slot_serves_only_scanned_stripes() {
        let mut vol = ready_volume(3);
        vol.slot_mut(2).unwrap().state = SlotState::Rebuilding;
        vol.rebuild = Some(RebuildProgress {
            disk_index: 2,
            next_stripe: 10,
            last_checkpoint: 0,
            op: None,
        });
        vol.reassess();

        assert_eq!(vol.state, VolumeState::Rebuilding);
        assert!(vol.disk_serves(2, 9));
        assert!(!vol.disk_serves(2, 10));
        assert!(vol.disk_serves(0, 10));
    }

    #[test]
    fn beacon_refreshes_bound_slot_address() {
        let vol = ready_volume(3);
        let volume_uuid = vol.uuid;
        let disk = vol.slot(1).unwrap().disk_uuid;
        let mut state = frontend(vol);

        let new_addr = "127.0.0.1:9999".parse().unwrap();
        state.record_beacon(disk, new_addr, volume_uuid, Instant::now());

        assert!(state.available_disks.contains_key(&disk));
        let vol = &state.volumes[&volume_uuid];
        assert_eq!(vol.slot(1).unwrap().address, new_addr);
    }

    #[test]
    fn probe_with_matching_generation_rebinds_online() {
        let mut vol = ready_volume(3);
        vol.mark_failed(1);
        vol.reassess();
        let volume_uuid = vol.uuid;
        let disk = vol.slot(1).unwrap().disk_uuid;
        let header = DiskHeader {
            volume_uuid,
            disk_uuid: disk,
            disk_index: 1,
            disk_count: 3,
            block_size: 4096,
            generation: vol.epoch,
        };

        let mut state = frontend(vol);
        let now = Instant::now();
        state.record_beacon(disk, "127.0.0.1:9001".parse().unwrap(), volume_uuid, now);

        state.handle_probe(disk, Ok(header.encode().to_vec()), now);

        let vol = &state.volumes[&volume_uuid];
        assert_eq!(vol.slot(1).unwrap().state, SlotState::Online);
        assert_eq!(vol.state, VolumeState::Ready);
    }

    #[test]
    fn probe_with_stale_generation_starts_rebuild() {
        let mut vol = ready_volume(3);
        vol.epoch = 5;
        for slot in vol.slots.iter_mut().flatten() {
            slot.generation = 5;
        }
        vol.mark_failed(1);
        vol.reassess();
        let volume_uuid = vol.uuid;
        let disk = vol.slot(1).unwrap().disk_uuid;

        let header = DiskHeader {
            volume_uuid,
            disk_uuid: disk,
            disk_index: 1,
            disk_count: 3,
            block_size: 4096,
            generation: 2, // older epoch
        };

        let mut state = frontend(vol);
        let now = Instant::now();
        state.record_beacon(disk, "127.0.0.1:9001".parse().unwrap(), volume_uuid, now);
        state.handle_probe(disk, Ok(header.encode().to_vec()), now);

        let vol = &state.volumes[&volume_uuid];
        assert_eq!(vol.slot(1).unwrap().state, SlotState::Rebuilding);
        assert_eq!(vol.state, VolumeState::Rebuilding);
        let rebuild = vol.rebuild.as_ref().unwrap();
        assert_eq!(rebuild.disk_index, 1);
        assert_eq!(rebuild.next_stripe, 0);
    }

    #[test]
    fn checkpointed_disk_resumes_mid_rebuild() {
        let mut vol = ready_volume(3);
        vol.mark_failed(2);
        vol.reassess();
        let volume_uuid = vol.uuid;
        let disk = vol.slot(2).unwrap().disk_uuid;

        let header = DiskHeader {
            volume_uuid,
            disk_uuid: disk,
            disk_index: 2,
            disk_count: 3,
            block_size: 4096,
            generation: REBUILD_GENERATION_BASE + 128,
        };

        let mut state = frontend(vol);
        let now = Instant::now();
        state.record_beacon(disk, "127.0.0.1:9002".parse().unwrap(), volume_uuid, now);
        state.handle_probe(disk, Ok(header.encode().to_vec()), now);

        let vol = &state.volumes[&volume_uuid];
        assert_eq!(vol.rebuild.as_ref().unwrap().next_stripe, 128);
    }

    #[test]
    fn blank_disk_replaces_a_failed_slot() {
        let mut vol = ready_volume(3);
        vol.mark_failed(0);
        vol.reassess();
        let volume_uuid = vol.uuid;
        let replacement = uuid("ee");

        let mut state = frontend(vol);
        let now = Instant::now();
        state.record_beacon(
            replacement,
            "127.0.0.1:9003".parse().unwrap(),
            volume_uuid,
            now,
        );

        // a blank disk answers with garbage where its header should be
        state.handle_probe(replacement, Ok(vec![0u8; 4096]), now);

        let vol = &state.volumes[&volume_uuid];
        let slot = vol.slot(0).unwrap();
        assert_eq!(slot.disk_uuid, replacement);
        assert_eq!(slot.state, SlotState::Rebuilding);
        assert_eq!(vol.rebuild.as_ref().unwrap().next_stripe, 0);
    }

    #[test]
    fn discovered_headers_mount_an_existing_volume() {
        let vol = Volume::from_config(&VolumeConfig {
            volume_uuid: uuid("aa"),
            long_password: "pw".into(),
            block_size: 4096,
            block_count: 256,
        });
        let volume_uuid = vol.uuid;
        let mut state = frontend(vol);
        let now = Instant::now();

        for i in 0..3u32 {
            let disk = uuid(&format!("c{}", i));
            let address = format!("127.0.0.1:90{:02}", i).parse().unwrap();
            state.record_beacon(disk, address, volume_uuid, now);

            let header = DiskHeader {
                volume_uuid,
                disk_uuid: disk,
                disk_index: i,
                disk_count: 3,
                block_size: 4096,
                generation: 4,
            };
            state.handle_probe(disk, Ok(header.encode().to_vec()), now);
        }

        let vol = &state.volumes[&volume_uuid];
        assert_eq!(vol.state, VolumeState::Ready);
        assert_eq!(vol.epoch, 4);
        assert_eq!(vol.disk_count(), 3);
        assert!(vol.slots.iter().all(|s| matches!(
            s,
            Some(slot) if slot.state == SlotState::Online
        )));
    }

    #[test]
    fn foreign_volume_headers_do_not_bind() {
        let mut vol = ready_volume(3);
        vol.mark_failed(0);
        vol.reassess();
        let volume_uuid = vol.uuid;
        let disk = vol.slot(0).unwrap().disk_uuid;

        let header = DiskHeader {
            volume_uuid: uuid("ff"), // some other volume
            disk_uuid: disk,
            disk_index: 0,
            disk_count: 3,
            block_size: 4096,
            generation: 1,
        };

        let mut state = frontend(vol);
        let now = Instant::now();
        state.record_beacon(disk, "127.0.0.1:9004".parse().unwrap(), volume_uuid, now);
        state.handle_probe(disk, Ok(header.encode().to_vec()), now);

        // a mismatched header reads as blank, so the failed slot is rebuilt
        // from scratch rather than trusted
        let vol = &state.volumes[&volume_uuid];
        assert_eq!(vol.slot(0).unwrap().state, SlotState::Rebuilding);
        assert_eq!(vol.rebuild.as_ref().unwrap().next_stripe, 0);
    }
}
