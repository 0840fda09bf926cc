use std::collections::HashMap;

use crate::entities::repository::INDEX_SENTINEL;
use crate::world::position::{CoordGrid, ZONE_SHIFT};

/// Spatial zone index consumed by the visibility pass. Implementations own
/// their data structure; this crate only reads it.
///
/// The returned slice may carry `0xFFFF` sentinel entries, which callers
/// skip. Entries within a zone are ordered oldest-spawned first.
pub trait ZoneIndex: Sync {
    fn npc_indices(&self, level: u8, zone_x: u16, zone_z: u16) -> Option<&[u16]>;
}

/// Entity discovery contract of the older protocol generations: one call
/// yields every candidate around a coordinate, already in zone scan order.
pub trait DiscoverySupplier: Sync {
    fn supply(
        &self,
        observer_index: u16,
        level: u8,
        x: u16,
        z: u16,
        render_distance: u16,
    ) -> Vec<u16>;
}

/// Zones touched by a Chebyshev radius around `center`, in the contractual
/// scan order: south-west-most zone first, proceeding north through each
/// column, columns moving east.
pub fn zones_in_range(center: CoordGrid, distance: u16) -> Vec<(u16, u16)> {
    let min_x = center.x().saturating_sub(distance) >> ZONE_SHIFT;
    let max_x = center.x().saturating_add(distance) >> ZONE_SHIFT;
    let min_z = center.z().saturating_sub(distance) >> ZONE_SHIFT;
    let max_z = center.z().saturating_add(distance) >> ZONE_SHIFT;
    let mut zones = Vec::with_capacity(
        usize::from(max_x - min_x + 1) * usize::from(max_z - min_z + 1),
    );
    for zone_x in min_x..=max_x {
        for zone_z in min_z..=max_z {
            zones.push((zone_x, zone_z));
        }
    }
    zones
}

/// In-memory zone grid keyed by (level, zone x, zone z). Used by tests and
/// the soak driver; production worlds plug their own index in via the
/// trait.
#[derive(Debug, Default)]
pub struct ZoneGrid {
    zones: HashMap<(u8, u16, u16), Vec<u16>>,
}

impl ZoneGrid {
    pub fn new() -> Self {
        Self::default()
    }

    fn zone_key(coord: CoordGrid) -> (u8, u16, u16) {
        (coord.level(), coord.zone_x(), coord.zone_z())
    }

    /// Register an avatar at its coordinate. Insertion order is spawn
    /// order, which the discovery contract exposes as oldest-first.
    pub fn insert(&mut self, coord: CoordGrid, index: u16) {
        self.zones.entry(Self::zone_key(coord)).or_default().push(index);
    }

    pub fn remove(&mut self, coord: CoordGrid, index: u16) {
        if let Some(entries) = self.zones.get_mut(&Self::zone_key(coord)) {
            entries.retain(|&entry| entry != index);
        }
    }

    /// Re-register after a coordinate change.
    pub fn relocate(&mut self, from: CoordGrid, to: CoordGrid, index: u16) {
        if Self::zone_key(from) == Self::zone_key(to) {
            return;
        }
        self.remove(from, index);
        self.insert(to, index);
    }
}

impl ZoneIndex for ZoneGrid {
    fn npc_indices(&self, level: u8, zone_x: u16, zone_z: u16) -> Option<&[u16]> {
        self.zones
            .get(&(level, zone_x, zone_z))
            .map(|entries| entries.as_slice())
    }
}

impl DiscoverySupplier for ZoneGrid {
    fn supply(
        &self,
        _observer_index: u16,
        level: u8,
        x: u16,
        z: u16,
        render_distance: u16,
    ) -> Vec<u16> {
        let center = CoordGrid::new(level, x, z);
        let mut out = Vec::new();
        for (zone_x, zone_z) in zones_in_range(center, render_distance) {
            if let Some(entries) = self.npc_indices(level, zone_x, zone_z) {
                out.extend(entries.iter().copied().filter(|&e| e != INDEX_SENTINEL));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_order_is_south_west_first_north_then_east() {
        let center = CoordGrid::new(0, 80, 80);
        let zones = zones_in_range(center, 8);
        // 80 +/- 8 spans zones 9..=11 on both axes.
        assert_eq!(zones.first(), Some(&(9, 9)));
        assert_eq!(&zones[..3], &[(9, 9), (9, 10), (9, 11)]);
        assert_eq!(zones.last(), Some(&(11, 11)));
        assert_eq!(zones.len(), 9);
    }

    #[test]
    fn grid_returns_zone_entries_oldest_first() {
        let mut grid = ZoneGrid::new();
        let coord = CoordGrid::new(0, 100, 100);
        grid.insert(coord, 7);
        grid.insert(coord, 3);
        grid.insert(CoordGrid::new(1, 100, 100), 9);
        assert_eq!(
            grid.npc_indices(0, coord.zone_x(), coord.zone_z()),
            Some(&[7u16, 3][..])
        );
        assert_eq!(grid.npc_indices(0, 0, 0), None);
    }

    #[test]
    fn supplier_skips_sentinels_and_walks_zone_order() {
        let mut grid = ZoneGrid::new();
        grid.insert(CoordGrid::new(0, 72, 72), 1);
        grid.insert(CoordGrid::new(0, 72, 88), 2);
        grid.insert(CoordGrid::new(0, 88, 72), 3);
        grid.zones
            .get_mut(&(0, 9, 9))
            .expect("zone")
            .push(INDEX_SENTINEL);
        let supplied = grid.supply(0, 0, 80, 80, 8);
        assert_eq!(supplied, vec![1, 2, 3]);
    }

    #[test]
    fn relocate_moves_between_zones() {
        let mut grid = ZoneGrid::new();
        let from = CoordGrid::new(0, 100, 100);
        let to = CoordGrid::new(0, 130, 100);
        grid.insert(from, 4);
        grid.relocate(from, to, 4);
        assert_eq!(grid.npc_indices(0, from.zone_x(), from.zone_z()), Some(&[][..]));
        assert_eq!(grid.npc_indices(0, to.zone_x(), to.zone_z()), Some(&[4u16][..]));
    }
}
