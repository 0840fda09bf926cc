use crate::config::ProtocolConfig;
use crate::entities::avatar::Priority;
use crate::entities::repository::{AvatarRepository, INDEX_SENTINEL};
use crate::net::bitbuf::{BitBuf, CodecError, CodecMode};
use crate::net::extended::{ClientKind, ExtendedInfoEncoder, NO_UPDATE_MARKER};
use crate::world::position::{BuildArea, CoordGrid};
use crate::world::zones::{zones_in_range, ZoneIndex};

/// The root (non-instanced) world id.
pub const ROOT_WORLD: u16 = 0;

const SPECIFIC_WORDS: usize = (1 << 16) / 64;

/// Last-resort visibility veto, consulted after every built-in check has
/// passed, on both the keep-in-view and the add path.
pub trait VisibilityFilter: Sync {
    fn accept(&self, observer_index: u16, npc_index: u16) -> bool;
}

/// A compute failure attributed to one observer. Stored against that
/// observer and surfaced exactly once, from `to_packet`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverFault {
    pub observer: u16,
    pub detail: String,
}

impl std::fmt::Display for ObserverFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "observer {} fault: {}", self.observer, self.detail)
    }
}

impl std::error::Error for ObserverFault {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NpcInfoError {
    /// World id outside the configured instanced-world range.
    InvalidWorld(u16),
    /// Operation against a world this observer has not entered.
    UnknownWorld(u16),
    Codec(CodecError),
    Fault(ObserverFault),
}

impl std::fmt::Display for NpcInfoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NpcInfoError::InvalidWorld(world) => write!(f, "invalid world id {}", world),
            NpcInfoError::UnknownWorld(world) => write!(f, "world {} not entered", world),
            NpcInfoError::Codec(err) => write!(f, "codec: {}", err),
            NpcInfoError::Fault(fault) => fault.fmt(f),
        }
    }
}

impl std::error::Error for NpcInfoError {}

impl From<CodecError> for NpcInfoError {
    fn from(err: CodecError) -> Self {
        NpcInfoError::Codec(err)
    }
}

/// Per-view limits and codec selection, copied out of the config once at
/// observer construction.
#[derive(Debug, Clone, Copy)]
struct Params {
    high_res_cap: usize,
    normal_soft_cap: usize,
    low_cap: usize,
    packet_limit: usize,
    codec_mode: CodecMode,
    search_radius: u16,
    max_worlds: u16,
}

impl Params {
    fn from_config(config: &ProtocolConfig) -> Self {
        Self {
            high_res_cap: config.high_res_cap,
            normal_soft_cap: config.normal_priority_soft_cap,
            low_cap: config.low_priority_cap,
            packet_limit: config.packet_limit,
            codec_mode: config.codec_mode(),
            search_radius: config.zone_search_radius,
            max_worlds: config.max_worlds,
        }
    }
}

/// Which admission bucket a tracked entry occupies (a normal-priority
/// avatar can sit in the low bucket after overflowing the soft cap),
/// plus the generation snapshot that detects slot reuse.
#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    generation: u32,
    bucket: Priority,
}

/// Per-(observer, world) tracking state and codec pass.
#[derive(Debug)]
struct WorldView {
    world_id: u16,
    coord: CoordGrid,
    last_coord: CoordGrid,
    build_area: BuildArea,
    /// Tracked avatar indices in client-remembered order. New entries are
    /// appended, never inserted mid-array.
    high_res: Vec<u16>,
    meta: Vec<EntryMeta>,
    scratch_indices: Vec<u16>,
    scratch_meta: Vec<EntryMeta>,
    drop_flags: Vec<bool>,
    normal_bucket: usize,
    low_bucket: usize,
    ext_queue: Vec<(u16, u32)>,
    out: Option<BitBuf>,
}

impl WorldView {
    fn new(world_id: u16, coord: CoordGrid) -> Self {
        Self {
            world_id,
            coord,
            last_coord: coord,
            build_area: BuildArea::around(coord),
            high_res: Vec::new(),
            meta: Vec::new(),
            scratch_indices: Vec::new(),
            scratch_meta: Vec::new(),
            drop_flags: Vec::new(),
            normal_bucket: 0,
            low_bucket: 0,
            ext_queue: Vec::new(),
            out: None,
        }
    }

    fn deregister(repo: &AvatarRepository, index: u16, generation: u32) {
        // A reused slot means our registration died with the old record.
        if repo.generation(index) != generation {
            return;
        }
        if let Some(record) = repo.get(index) {
            record.remove_observer();
        }
    }

    fn remove_entry_bookkeeping(&mut self, repo: &AvatarRepository, position: usize) {
        let index = self.high_res[position];
        let meta = self.meta[position];
        Self::deregister(repo, index, meta.generation);
        match meta.bucket {
            Priority::Normal => self.normal_bucket = self.normal_bucket.saturating_sub(1),
            Priority::Low => self.low_bucket = self.low_bucket.saturating_sub(1),
        }
    }

    fn specific_visible(specific: Option<&[u64; SPECIFIC_WORDS]>, index: u16) -> bool {
        specific.is_some_and(|bits| (bits[usize::from(index) >> 6] >> (index & 63)) & 1 == 1)
    }

    fn should_drop(
        &self,
        observer_index: u16,
        render_distance: u16,
        specific: Option<&[u64; SPECIFIC_WORDS]>,
        repo: &AvatarRepository,
        filter: Option<&dyn VisibilityFilter>,
        position: usize,
    ) -> bool {
        let index = self.high_res[position];
        let Some(record) = repo.get(index) else {
            return true;
        };
        if repo.generation(index) != self.meta[position].generation {
            return true;
        }
        if record.inaccessible || record.is_teleporting() {
            return true;
        }
        let distance = render_distance.min(record.render_distance);
        if !self.coord.within_distance(record.coord, distance) {
            return true;
        }
        if record.specific_visible_only && !Self::specific_visible(specific, index) {
            return true;
        }
        if let Some(filter) = filter {
            if !filter.accept(observer_index, index) {
                return true;
            }
        }
        false
    }

    /// Copy only surviving entries into the scratch arrays and swap,
    /// preserving relative order and each entry's bucket bit. Avoids the
    /// quadratic shifting an in-place removal loop would cost.
    fn defragment(&mut self) {
        self.scratch_indices.clear();
        self.scratch_meta.clear();
        for position in 0..self.high_res.len() {
            if !self.drop_flags[position] {
                self.scratch_indices.push(self.high_res[position]);
                self.scratch_meta.push(self.meta[position]);
            }
        }
        std::mem::swap(&mut self.high_res, &mut self.scratch_indices);
        std::mem::swap(&mut self.meta, &mut self.scratch_meta);
    }

    #[allow(clippy::too_many_arguments)]
    fn put_bitcodes(
        &mut self,
        observer_index: u16,
        render_distance: u16,
        specific: Option<&[u64; SPECIFIC_WORDS]>,
        params: &Params,
        repo: &AvatarRepository,
        zones: &dyn ZoneIndex,
        filter: Option<&dyn VisibilityFilter>,
        tick: u64,
    ) -> Result<(), CodecError> {
        let recycled = self.out.take().map(BitBuf::into_vec).unwrap_or_default();
        let mut out = BitBuf::from_vec(recycled, params.packet_limit, params.codec_mode);
        self.ext_queue.clear();

        // Shrink/update pass. An observer that outran its render distance
        // drops everything at once: the client removes all suffix entries
        // implied by a smaller count, so count 0 is the whole update.
        if !self.coord.within_distance(self.last_coord, render_distance) {
            out.write_bits(8, 0)?;
            for position in 0..self.high_res.len() {
                self.remove_entry_bookkeeping(repo, position);
            }
            self.high_res.clear();
            self.meta.clear();
        } else {
            self.drop_flags.clear();
            self.drop_flags.resize(self.high_res.len(), false);
            // Backward scan: decisions are needed ahead of the count byte
            // because trailing drops shrink the count instead of costing
            // removal opcodes.
            let mut last_kept = None;
            for position in (0..self.high_res.len()).rev() {
                let drop = self.should_drop(
                    observer_index,
                    render_distance,
                    specific,
                    repo,
                    filter,
                    position,
                );
                self.drop_flags[position] = drop;
                if !drop && last_kept.is_none() {
                    last_kept = Some(position);
                }
            }
            let transmitted = last_kept.map_or(0, |position| position + 1);
            for position in transmitted..self.high_res.len() {
                self.remove_entry_bookkeeping(repo, position);
            }
            out.write_bits(8, transmitted as u32)?;

            let mut mid_removal = false;
            for position in 0..transmitted {
                if self.drop_flags[position] {
                    out.write_bits(1, 0b1)?;
                    out.write_bits(2, 0b11)?;
                    self.remove_entry_bookkeeping(repo, position);
                    mid_removal = true;
                    continue;
                }
                let index = self.high_res[position];
                match repo.get(index).and_then(|record| {
                    record
                        .movement_block(tick)
                        .map(|block| (block, record.extended_flags()))
                }) {
                    Some(((bits, len), flags)) => {
                        out.write_bits(len, bits)?;
                        if flags != 0 {
                            self.ext_queue.push((index, flags));
                        }
                    }
                    // Record vanished or carries no block for this tick:
                    // benign no-change keeps the stream aligned.
                    None => out.write_bits(1, 0b0)?,
                }
            }
            self.high_res.truncate(transmitted);
            self.meta.truncate(transmitted);
            if mid_removal {
                self.defragment();
            }
        }

        // Discovery pass, only while some bucket still has room.
        if self.high_res.len() < params.high_res_cap
            && !(self.normal_bucket >= params.normal_soft_cap
                && self.low_bucket >= params.low_cap)
        {
            'scan: for (zone_x, zone_z) in zones_in_range(self.coord, params.search_radius) {
                let Some(candidates) =
                    zones.npc_indices(self.coord.level(), zone_x, zone_z)
                else {
                    continue;
                };
                for &index in candidates {
                    if self.high_res.len() >= params.high_res_cap {
                        break 'scan;
                    }
                    if self.normal_bucket >= params.normal_soft_cap
                        && self.low_bucket >= params.low_cap
                    {
                        break 'scan;
                    }
                    if index == INDEX_SENTINEL || self.high_res.contains(&index) {
                        continue;
                    }
                    let Some(record) = repo.get(index) else {
                        continue;
                    };
                    if record.inaccessible {
                        continue;
                    }
                    let distance = render_distance.min(record.render_distance);
                    if !self.coord.within_distance(record.coord, distance) {
                        continue;
                    }
                    if record.specific_visible_only
                        && !Self::specific_visible(specific, index)
                    {
                        continue;
                    }
                    if let Some(filter) = filter {
                        if !filter.accept(observer_index, index) {
                            continue;
                        }
                    }
                    let Some((rel_x, rel_z)) = self.build_area.relative(record.coord) else {
                        continue;
                    };
                    // Two-tier admission: a full low bucket rejects
                    // low-priority candidates outright, a full normal soft
                    // cap overflows normal candidates into the low bucket.
                    // Skipped candidates stay eligible next tick.
                    let bucket = match record.priority {
                        Priority::Normal => {
                            if self.normal_bucket < params.normal_soft_cap {
                                Priority::Normal
                            } else if self.low_bucket < params.low_cap {
                                Priority::Low
                            } else {
                                continue;
                            }
                        }
                        Priority::Low => {
                            if self.low_bucket < params.low_cap {
                                Priority::Low
                            } else {
                                continue;
                            }
                        }
                    };
                    record.add_observer();
                    match bucket {
                        Priority::Normal => self.normal_bucket += 1,
                        Priority::Low => self.low_bucket += 1,
                    }
                    self.high_res.push(index);
                    self.meta.push(EntryMeta {
                        generation: repo.generation(index),
                        bucket,
                    });

                    let promote_flags = record.promote_flags();
                    out.write_bits(16, u32::from(index))?;
                    out.write_bits(8, u32::from(record.size_x))?;
                    out.write_bits(8, u32::from(record.size_z))?;
                    out.write_bits(8, u32::from(rel_x))?;
                    out.write_bits(8, u32::from(rel_z))?;
                    out.write_bits(3, u32::from(record.angle & 0x7))?;
                    out.write_bits(16, u32::from(record.type_id))?;
                    out.write_bits(1, u32::from(promote_flags != 0))?;
                    if promote_flags != 0 {
                        self.ext_queue.push((index, promote_flags));
                    }
                }
            }
        }

        if !self.ext_queue.is_empty() {
            out.write_bits(16, 0xffff)?;
        }
        out.close_writer();
        self.out = Some(out);
        Ok(())
    }

    fn put_extended_info(
        &mut self,
        observer_index: u16,
        client: ClientKind,
        repo: &AvatarRepository,
        encoder: &dyn ExtendedInfoEncoder,
    ) -> Result<(), CodecError> {
        if self.ext_queue.is_empty() {
            return Ok(());
        }
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        let total = self.ext_queue.len();
        for (position, &(index, flags)) in self.ext_queue.iter().enumerate() {
            let remaining = total - 1 - position;
            if repo.get(index).is_some() {
                encoder.encode(client, out, observer_index, index, position, remaining, flags)?;
            } else {
                // Destroyed mid-tick: a benign empty update instead of a
                // fault shared by every observer of this avatar.
                out.put_u8(NO_UPDATE_MARKER)?;
            }
        }
        Ok(())
    }

    fn release_all(&mut self, repo: &AvatarRepository) {
        for position in 0..self.high_res.len() {
            self.remove_entry_bookkeeping(repo, position);
        }
        self.high_res.clear();
        self.meta.clear();
        self.ext_queue.clear();
        self.normal_bucket = 0;
        self.low_bucket = 0;
    }

    fn post_update(&mut self) {
        self.last_coord = self.coord;
        self.ext_queue.clear();
        self.drop_flags.clear();
    }
}

/// Per-observer NPC tracking across every world the observer straddles.
/// Holds slot indices into the repository, never the records.
#[derive(Debug)]
pub struct NpcInfo {
    observer_index: u16,
    client: ClientKind,
    render_distance: u16,
    params: Params,
    specific: Option<Box<[u64; SPECIFIC_WORDS]>>,
    views: Vec<WorldView>,
    fault: Option<ObserverFault>,
}

impl NpcInfo {
    pub fn new(observer_index: u16, client: ClientKind, config: &ProtocolConfig) -> Self {
        Self {
            observer_index,
            client,
            render_distance: config.render_distance,
            params: Params::from_config(config),
            specific: None,
            views: Vec::new(),
            fault: None,
        }
    }

    pub fn observer_index(&self) -> u16 {
        self.observer_index
    }

    /// Begin tracking a world. Idempotent for a world already entered.
    pub fn start_world(&mut self, world_id: u16, coord: CoordGrid) -> Result<(), NpcInfoError> {
        if world_id >= self.params.max_worlds {
            return Err(NpcInfoError::InvalidWorld(world_id));
        }
        if self.views.iter().any(|view| view.world_id == world_id) {
            return Ok(());
        }
        self.views.push(WorldView::new(world_id, coord));
        Ok(())
    }

    /// Stop tracking a world, deregistering from every tracked record.
    pub fn end_world(
        &mut self,
        world_id: u16,
        repo: &AvatarRepository,
    ) -> Result<(), NpcInfoError> {
        let position = self
            .views
            .iter()
            .position(|view| view.world_id == world_id)
            .ok_or(NpcInfoError::UnknownWorld(world_id))?;
        let mut view = self.views.remove(position);
        view.release_all(repo);
        Ok(())
    }

    /// Reconnect/logout reset: drop every view and any stored fault.
    pub fn reset(&mut self, repo: &AvatarRepository) {
        for view in &mut self.views {
            view.release_all(repo);
        }
        self.views.clear();
        self.fault = None;
    }

    pub fn set_coord(&mut self, world_id: u16, coord: CoordGrid) -> Result<(), NpcInfoError> {
        let view = self
            .views
            .iter_mut()
            .find(|view| view.world_id == world_id)
            .ok_or(NpcInfoError::UnknownWorld(world_id))?;
        view.coord = coord;
        view.build_area = BuildArea::around(coord);
        Ok(())
    }

    pub fn set_render_distance(&mut self, distance: u16) {
        self.render_distance = distance;
    }

    /// Flip this observer's allow-list bit for one avatar. Avatars marked
    /// `specific_visible_only` are shown only to observers that allow
    /// them.
    pub fn set_specific_visible(&mut self, npc_index: u16, visible: bool) {
        let bits = self
            .specific
            .get_or_insert_with(|| Box::new([0u64; SPECIFIC_WORDS]));
        let word = usize::from(npc_index) >> 6;
        let bit = 1u64 << (npc_index & 63);
        if visible {
            bits[word] |= bit;
        } else {
            bits[word] &= !bit;
        }
    }

    /// Tracked indices for a world, in client-remembered order.
    pub fn tracked(&self, world_id: u16) -> Option<&[u16]> {
        self.views
            .iter()
            .find(|view| view.world_id == world_id)
            .map(|view| view.high_res.as_slice())
    }

    pub fn put_bitcodes(
        &mut self,
        repo: &AvatarRepository,
        zones: &dyn ZoneIndex,
        filter: Option<&dyn VisibilityFilter>,
        tick: u64,
    ) -> Result<(), NpcInfoError> {
        let Self {
            observer_index,
            render_distance,
            params,
            specific,
            views,
            ..
        } = self;
        for view in views.iter_mut() {
            view.put_bitcodes(
                *observer_index,
                *render_distance,
                specific.as_deref(),
                params,
                repo,
                zones,
                filter,
                tick,
            )?;
        }
        Ok(())
    }

    pub fn put_extended_info(
        &mut self,
        repo: &AvatarRepository,
        encoder: &dyn ExtendedInfoEncoder,
    ) -> Result<(), NpcInfoError> {
        let Self {
            observer_index,
            client,
            views,
            ..
        } = self;
        for view in views.iter_mut() {
            view.put_extended_info(*observer_index, *client, repo, encoder)?;
        }
        Ok(())
    }

    pub fn post_update(&mut self) {
        for view in &mut self.views {
            view.post_update();
        }
    }

    pub(crate) fn set_fault(&mut self, detail: String) {
        self.fault = Some(ObserverFault {
            observer: self.observer_index,
            detail,
        });
    }

    pub fn has_fault(&self) -> bool {
        self.fault.is_some()
    }

    pub fn fault(&self) -> Option<&ObserverFault> {
        self.fault.as_ref()
    }

    /// Total bytes currently built across this observer's views.
    pub fn emitted_bytes(&self) -> usize {
        self.views
            .iter()
            .filter_map(|view| view.out.as_ref())
            .map(|out| out.byte_len())
            .sum()
    }

    /// The finished buffer for one world, or the fault stored during this
    /// tick. A fault is raised exactly once; no partial buffer is ever
    /// handed out for a faulted tick.
    pub fn to_packet(&mut self, world_id: u16) -> Result<&[u8], NpcInfoError> {
        if let Some(fault) = self.fault.take() {
            return Err(NpcInfoError::Fault(fault));
        }
        let view = self
            .views
            .iter()
            .find(|view| view.world_id == world_id)
            .ok_or(NpcInfoError::UnknownWorld(world_id))?;
        Ok(view
            .out
            .as_ref()
            .map(|out| out.as_bytes())
            .unwrap_or(&[]))
    }
}
