use std::sync::atomic::{AtomicU32, Ordering};

use crate::world::position::{CoordGrid, StepDir};

/// Movement kinds accumulated over one tick, as a bitmask. Teleport kinds
/// supersede every incremental kind: a teleporting avatar never emits step
/// bits, it is dropped and re-added by each observer instead.
pub const MOVE_CRAWL: u8 = 0x01;
pub const MOVE_WALK: u8 = 0x02;
pub const MOVE_RUN: u8 = 0x04;
pub const MOVE_TELEPORT: u8 = 0x08;
pub const MOVE_TELEJUMP: u8 = 0x10;

/// Admission-control bucket. Low-priority avatars (pets and the like) are
/// capped separately so they cannot crowd out normal ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    Low,
}

/// The movement bit-sequence precomputed once per tick and copied verbatim
/// into every observer's stream. At most 11 bits.
#[derive(Debug, Clone, Copy, Default)]
struct MovementBlock {
    bits: u32,
    len: u32,
    tick: u64,
}

/// Per-NPC mutable state, owned by the repository and referenced by
/// observers through its slot index only.
#[derive(Debug)]
pub struct NpcAvatar {
    index: u16,
    pub type_id: u16,
    pub coord: CoordGrid,
    pub last_coord: CoordGrid,
    pub size_x: u8,
    pub size_z: u8,
    pub angle: u8,
    pub render_distance: u16,
    pub priority: Priority,
    /// Only observers whose allow-list names this avatar may see it.
    pub specific_visible_only: bool,
    /// Temporarily withdrawn from every observer (cutscene, respawn delay).
    pub inaccessible: bool,
    first_step: Option<StepDir>,
    second_step: Option<StepDir>,
    step_calls: u8,
    crawl_calls: u8,
    move_kinds: u8,
    extended_flags: u32,
    sticky_flags: u32,
    observers: AtomicU32,
    block: MovementBlock,
}

pub const DEFAULT_RENDER_DISTANCE: u16 = 15;

impl NpcAvatar {
    pub fn new(index: u16, type_id: u16, coord: CoordGrid) -> Self {
        Self {
            index,
            type_id,
            coord,
            last_coord: coord,
            size_x: 1,
            size_z: 1,
            angle: 0,
            render_distance: DEFAULT_RENDER_DISTANCE,
            priority: Priority::Normal,
            specific_visible_only: false,
            inaccessible: false,
            first_step: None,
            second_step: None,
            step_calls: 0,
            crawl_calls: 0,
            move_kinds: 0,
            extended_flags: 0,
            sticky_flags: 0,
            observers: AtomicU32::new(0),
            block: MovementBlock::default(),
        }
    }

    /// Reinitialize a recycled record in place.
    pub fn reset(&mut self, index: u16, type_id: u16, coord: CoordGrid) {
        *self = Self::new(index, type_id, coord);
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn move_kinds(&self) -> u8 {
        self.move_kinds
    }

    pub fn is_teleporting(&self) -> bool {
        self.move_kinds & (MOVE_TELEPORT | MOVE_TELEJUMP) != 0
    }

    pub fn walk(&mut self, dir: StepDir) {
        self.record_step(dir, MOVE_WALK);
    }

    pub fn crawl(&mut self, dir: StepDir) {
        self.crawl_calls = self.crawl_calls.saturating_add(1);
        self.record_step(dir, MOVE_CRAWL);
    }

    /// At most two incremental steps fit one tick. The second upgrades the
    /// tick to a run; a third forces teleport semantics. The escalation
    /// threshold is inherited wire behavior and must stay exactly here.
    fn record_step(&mut self, dir: StepDir, kind: u8) {
        let Some(next) = self.coord.step(dir) else {
            return;
        };
        match self.step_calls {
            0 => {
                self.first_step = Some(dir);
                self.move_kinds |= kind;
            }
            1 => {
                self.second_step = Some(dir);
                self.move_kinds |= kind | MOVE_RUN;
            }
            _ => {
                self.move_kinds |= MOVE_TELEPORT;
            }
        }
        self.coord = next;
        self.step_calls = self.step_calls.saturating_add(1);
    }

    pub fn teleport(&mut self, dest: CoordGrid, jump: bool) {
        self.coord = dest;
        self.move_kinds |= if jump { MOVE_TELEJUMP } else { MOVE_TELEPORT };
    }

    pub fn observer_count(&self) -> u32 {
        self.observers.load(Ordering::Relaxed)
    }

    /// Called by observer work units while the slot table is shared, hence
    /// atomic.
    pub fn add_observer(&self) {
        self.observers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_observer(&self) {
        let _ = self
            .observers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            });
    }

    /// Queue extended-info attribute bits for this tick. Sticky kinds
    /// (appearance and the like) are also remembered so an observer that
    /// promotes the avatar later still receives them.
    pub fn set_extended(&mut self, flags: u32, sticky: bool) {
        self.extended_flags |= flags;
        if sticky {
            self.sticky_flags |= flags;
        }
    }

    pub fn extended_flags(&self) -> u32 {
        self.extended_flags
    }

    /// Flag mask a newly-promoting observer must receive: this tick's diff
    /// plus everything sticky it never saw.
    pub fn promote_flags(&self) -> u32 {
        self.extended_flags | self.sticky_flags
    }

    /// Precompute the shared movement bit-sequence for `tick`.
    ///
    /// No-op for unobserved or teleporting avatars: with tens of thousands
    /// of static NPCs server-wide, skipping unobserved records dominates
    /// the cost savings, and teleports are handled by drop-and-re-add.
    pub fn prepare_block(&mut self, tick: u64) {
        if self.observer_count() == 0 || self.is_teleporting() {
            return;
        }
        let ext = u32::from(self.extended_flags != 0);
        let (bits, len) = match (self.first_step, self.second_step) {
            (None, _) => {
                if ext == 1 {
                    // 1, opcode 00: extended info only
                    (0b100, 3)
                } else {
                    (0b0, 1)
                }
            }
            (Some(first), None) => {
                // 1, opcode 01, step, ext flag
                (
                    (1 << 6) | (0b01 << 4) | (first.code() << 1) | ext,
                    7,
                )
            }
            (Some(first), Some(second)) => {
                // 1, opcode 10, speed, both steps, ext flag
                let crawling = u32::from(self.crawl_calls >= 2);
                (
                    (1 << 10)
                        | (0b10 << 8)
                        | (crawling << 7)
                        | (first.code() << 4)
                        | (second.code() << 1)
                        | ext,
                    11,
                )
            }
        };
        self.block = MovementBlock { bits, len, tick };
    }

    /// The precomputed block, valid for exactly the tick it was prepared
    /// for.
    pub fn movement_block(&self, tick: u64) -> Option<(u32, u32)> {
        if self.block.tick == tick && self.block.len > 0 {
            Some((self.block.bits, self.block.len))
        } else {
            None
        }
    }

    /// Clear single-tick state. Sticky flags and the observer count
    /// survive.
    pub fn post_tick(&mut self) {
        self.first_step = None;
        self.second_step = None;
        self.step_calls = 0;
        self.crawl_calls = 0;
        self.move_kinds = 0;
        self.extended_flags = 0;
        self.last_coord = self.coord;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avatar_at(x: u16, z: u16) -> NpcAvatar {
        NpcAvatar::new(7, 50, CoordGrid::new(0, x, z))
    }

    #[test]
    fn unobserved_avatar_skips_precompute() {
        let mut avatar = avatar_at(100, 100);
        avatar.walk(StepDir::East);
        avatar.prepare_block(4);
        assert_eq!(avatar.movement_block(4), None);
    }

    #[test]
    fn no_change_block_is_one_zero_bit() {
        let avatar = {
            let mut a = avatar_at(100, 100);
            a.add_observer();
            a.prepare_block(1);
            a
        };
        assert_eq!(avatar.movement_block(1), Some((0b0, 1)));
    }

    #[test]
    fn extended_only_block() {
        let mut avatar = avatar_at(100, 100);
        avatar.add_observer();
        avatar.set_extended(0x8, false);
        avatar.prepare_block(1);
        assert_eq!(avatar.movement_block(1), Some((0b100, 3)));
    }

    #[test]
    fn single_step_block_carries_direction_and_ext_flag() {
        let mut avatar = avatar_at(100, 100);
        avatar.add_observer();
        avatar.walk(StepDir::East);
        avatar.prepare_block(1);
        let (bits, len) = avatar.movement_block(1).expect("block");
        assert_eq!(len, 7);
        assert_eq!(bits, (1 << 6) | (0b01 << 4) | (StepDir::East.code() << 1));
        assert_eq!(avatar.coord, CoordGrid::new(0, 101, 100));
    }

    #[test]
    fn two_steps_upgrade_to_run() {
        let mut avatar = avatar_at(100, 100);
        avatar.add_observer();
        avatar.walk(StepDir::North);
        avatar.walk(StepDir::North);
        assert_eq!(avatar.move_kinds() & MOVE_RUN, MOVE_RUN);
        avatar.prepare_block(1);
        let (bits, len) = avatar.movement_block(1).expect("block");
        assert_eq!(len, 11);
        let n = StepDir::North.code();
        assert_eq!(bits, (1 << 10) | (0b10 << 8) | (n << 4) | (n << 1));
    }

    #[test]
    fn double_crawl_sets_speed_bit() {
        let mut avatar = avatar_at(100, 100);
        avatar.add_observer();
        avatar.crawl(StepDir::South);
        avatar.crawl(StepDir::South);
        avatar.prepare_block(1);
        let (bits, _) = avatar.movement_block(1).expect("block");
        assert_eq!((bits >> 7) & 1, 1);
    }

    #[test]
    fn third_step_call_forces_teleport() {
        let mut avatar = avatar_at(100, 100);
        avatar.add_observer();
        avatar.walk(StepDir::East);
        avatar.walk(StepDir::East);
        avatar.walk(StepDir::East);
        assert!(avatar.is_teleporting());
        avatar.prepare_block(1);
        assert_eq!(avatar.movement_block(1), None);
    }

    #[test]
    fn teleport_supersedes_steps() {
        let mut avatar = avatar_at(100, 100);
        avatar.add_observer();
        avatar.walk(StepDir::East);
        avatar.teleport(CoordGrid::new(0, 500, 500), true);
        assert!(avatar.is_teleporting());
        avatar.prepare_block(1);
        assert_eq!(avatar.movement_block(1), None);
        assert_eq!(avatar.coord, CoordGrid::new(0, 500, 500));
    }

    #[test]
    fn block_is_transient_across_ticks() {
        let mut avatar = avatar_at(100, 100);
        avatar.add_observer();
        avatar.prepare_block(1);
        assert!(avatar.movement_block(1).is_some());
        assert_eq!(avatar.movement_block(2), None);
    }

    #[test]
    fn post_tick_clears_transients_and_swaps_coords() {
        let mut avatar = avatar_at(100, 100);
        avatar.add_observer();
        avatar.walk(StepDir::East);
        avatar.set_extended(0x2, true);
        avatar.post_tick();
        assert_eq!(avatar.move_kinds(), 0);
        assert_eq!(avatar.extended_flags(), 0);
        assert_eq!(avatar.promote_flags(), 0x2);
        assert_eq!(avatar.last_coord, avatar.coord);
        assert_eq!(avatar.observer_count(), 1);
    }

    #[test]
    fn observer_count_never_underflows() {
        let avatar = avatar_at(100, 100);
        avatar.remove_observer();
        assert_eq!(avatar.observer_count(), 0);
        avatar.add_observer();
        avatar.add_observer();
        avatar.remove_observer();
        assert_eq!(avatar.observer_count(), 1);
    }
}
