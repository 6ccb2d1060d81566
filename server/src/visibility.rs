//! What each client believes is on its screen
//!
//! The client keeps its own cache of creatures and addresses them by tile
//! and stack index. Every creature update the server sends must match that
//! belief, or the client desynchronizes. [`KnownCreatures`] records, per
//! player, the creatures the client knows and where it has them placed.
//! Outgoing updates are validated against the record first; a mismatch is
//! repaired by resending the affected tiles (or the whole map) and logged.

use crate::world::{CreatureId, TileThing, WorldView};
use log::warn;
use shared::{OutputBuffer, Position, StackPosition, WireError, SURFACE_FLOOR, VIEWPORT_X, VIEWPORT_Y};
use std::collections::HashMap;
use std::fmt;

/// Creatures a client can keep in its cache
pub const MAX_KNOWN_CREATURES: usize = 250;
/// Things a client draws per tile
pub const MAX_STACK_SIZE: usize = 10;
pub const MAP_WIDTH: i32 = VIEWPORT_X * 2 + 2;
pub const MAP_HEIGHT: i32 = VIEWPORT_Y * 2 + 2;
const MAX_FLOOR: i32 = 15;

pub const OP_MAP_DESCRIPTION: u8 = 0x64;
pub const OP_MAP_NORTH: u8 = 0x65;
pub const OP_MAP_EAST: u8 = 0x66;
pub const OP_MAP_SOUTH: u8 = 0x67;
pub const OP_MAP_WEST: u8 = 0x68;
pub const OP_TILE_UPDATE: u8 = 0x69;
pub const OP_ADD_THING: u8 = 0x6A;
pub const OP_REMOVE_THING: u8 = 0x6C;
pub const OP_MOVE_CREATURE: u8 = 0x6D;
const CREATURE_UNKNOWN: u16 = 0x61;
const CREATURE_KNOWN: u16 = 0x62;

/// The client's view of one creature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Drawn at this tile and stack index
    Placed(StackPosition),
    /// Known to the client but taken off the map
    Removed,
    /// Known to the client, placement no longer tracked
    Unknown,
    /// Not in the client's cache at all
    Unregistered,
}

impl fmt::Display for Recorded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recorded::Placed(at) => write!(f, "{}", at),
            Recorded::Removed => f.write_str("removed"),
            Recorded::Unknown => f.write_str("unknown"),
            Recorded::Unregistered => f.write_str("unregistered"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Record matches the expected placement
    Valid,
    /// The creature is not on screen and may be added
    Fresh,
    Wrong { recorded: Recorded },
}

/// How a desync was repaired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correction {
    FullArea(Position),
    Tiles(Vec<Position>),
    Appear(StackPosition),
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub known: bool,
    /// Creature evicted to make room, which the client must forget
    pub removed: Option<CreatureId>,
}

#[derive(Debug, Clone)]
pub struct KnownCreatures {
    viewer: CreatureId,
    capacity: usize,
    entries: HashMap<CreatureId, Recorded>,
}

impl KnownCreatures {
    pub fn new(viewer: CreatureId) -> Self {
        Self::with_capacity(viewer, MAX_KNOWN_CREATURES)
    }

    pub fn with_capacity(viewer: CreatureId, capacity: usize) -> Self {
        Self {
            viewer,
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn viewer(&self) -> CreatureId {
        self.viewer
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn recorded(&self, creature: CreatureId) -> Recorded {
        self.entries
            .get(&creature)
            .copied()
            .unwrap_or(Recorded::Unregistered)
    }

    pub fn is_known(&self, creature: CreatureId) -> bool {
        self.entries.contains_key(&creature)
    }

    /// Makes sure the client has the creature cached
    ///
    /// When the cache is full an entry is evicted: one the viewer can no
    /// longer see if there is any, otherwise the one farthest away.
    pub fn register_creature<W: WorldView + ?Sized>(
        &mut self,
        world: &W,
        creature: CreatureId,
    ) -> Registration {
        if self.entries.contains_key(&creature) {
            return Registration {
                known: true,
                removed: None,
            };
        }

        let mut removed = None;
        if self.entries.len() >= self.capacity {
            removed = self.pick_eviction(world);
            if let Some(evicted) = removed {
                self.entries.remove(&evicted);
            }
        }

        self.entries.insert(creature, Recorded::Unknown);
        Registration {
            known: false,
            removed,
        }
    }

    fn pick_eviction<W: WorldView + ?Sized>(&self, world: &W) -> Option<CreatureId> {
        let viewer = self.viewer;
        let invisible = self
            .entries
            .keys()
            .copied()
            .filter(|&id| id != viewer && !world.can_see_creature(viewer, id))
            .min();
        if invisible.is_some() {
            return invisible;
        }

        let center = world.creature_position(viewer);
        self.entries
            .iter()
            .filter(|(&id, _)| id != viewer)
            .max_by_key(|(&id, recorded)| {
                let distance = match (recorded, center) {
                    (Recorded::Placed(at), Some(center)) => at.pos.distance_to(&center),
                    _ => u32::MAX,
                };
                (distance, id)
            })
            .map(|(&id, _)| id)
    }

    /// Records a new placement, or `None` when the creature left the map
    pub fn update_registered_creature(&mut self, creature: CreatureId, at: Option<StackPosition>) {
        if let Some(entry) = self.entries.get_mut(&creature) {
            *entry = match at {
                Some(at) => Recorded::Placed(at),
                None => Recorded::Removed,
            };
        }
    }

    pub fn unregister(&mut self, creature: CreatureId) {
        self.entries.remove(&creature);
    }

    /// Checks an update against the record without changing it
    ///
    /// `expected` is where the update assumes the client has the creature;
    /// `None` means the update adds it to the screen.
    pub fn validate_registered_creature(
        &self,
        creature: CreatureId,
        expected: Option<StackPosition>,
    ) -> Validation {
        let recorded = self.recorded(creature);
        match (recorded, expected) {
            (Recorded::Placed(at), Some(expected)) if at == expected => Validation::Valid,
            (Recorded::Unregistered | Recorded::Removed | Recorded::Unknown, None) => {
                Validation::Fresh
            }
            (recorded, _) => Validation::Wrong { recorded },
        }
    }

    /// Repairs a failed validation and writes the repair into `out`
    #[allow(clippy::too_many_arguments)]
    pub fn correct_registered_creature<W: WorldView + ?Sized>(
        &mut self,
        world: &W,
        creature: CreatureId,
        recorded: Recorded,
        expected: Option<StackPosition>,
        new: Option<StackPosition>,
        site: &'static str,
        out: &mut OutputBuffer,
    ) -> Result<Correction, WireError> {
        let center = world.creature_position(self.viewer);
        let in_view = |pos: &Position| center.map_or(false, |center| pos.in_view_of(&center));

        let correction = match (center, recorded, new) {
            (Some(center), _, _) if creature == self.viewer => Correction::FullArea(center),
            (_, Recorded::Placed(actual), Some(new))
                if actual.pos.z == new.pos.z && in_view(&actual.pos) && in_view(&new.pos) =>
            {
                let mut tiles = vec![actual.pos];
                if new.pos != actual.pos {
                    tiles.push(new.pos);
                }
                Correction::Tiles(tiles)
            }
            (_, Recorded::Placed(actual), None) if in_view(&actual.pos) => {
                Correction::Tiles(vec![actual.pos])
            }
            (_, _, Some(new)) if in_view(&new.pos) => Correction::Appear(new),
            _ => Correction::Nothing,
        };

        warn!(
            "Visibility desync in {}: player {} creature {} expected {} actual {} new {}, repairing with {:?}",
            site,
            self.viewer,
            creature,
            Slot(expected),
            recorded,
            Slot(new),
            correction
        );

        match &correction {
            Correction::FullArea(center) => self.write_full_area(world, center, out)?,
            Correction::Tiles(tiles) => {
                for pos in tiles {
                    self.write_tile_update(world, pos, out)?;
                }
            }
            Correction::Appear(at) => {
                out.add_u8(OP_ADD_THING)?;
                out.add_position(&at.pos)?;
                out.add_u8(at.index)?;
                self.shift_before_insert(at);
                self.write_creature(world, creature, *at, out)?;
            }
            Correction::Nothing => {}
        }
        Ok(correction)
    }

    /// Forgets placements the viewer at `center` can no longer see
    pub fn invalidate_distant_creatures(&mut self, center: &Position) {
        for entry in self.entries.values_mut() {
            if let Recorded::Placed(at) = entry {
                if !at.pos.in_view_of(center) {
                    *entry = Recorded::Unknown;
                }
            }
        }
    }

    /// Forgets placements on a tile that is about to be resent
    pub fn invalidate_creatures_at_position(&mut self, pos: &Position) {
        for entry in self.entries.values_mut() {
            if let Recorded::Placed(at) = entry {
                if at.pos == *pos {
                    *entry = Recorded::Unknown;
                }
            }
        }
    }

    /// Lower stack indices on a tile after a thing left it
    pub fn shift_after_remove(&mut self, removed: &StackPosition) {
        for entry in self.entries.values_mut() {
            if let Recorded::Placed(at) = entry {
                if at.pos == removed.pos && at.index > removed.index {
                    at.index -= 1;
                }
            }
        }
    }

    /// Raise stack indices on a tile before a thing is inserted
    pub fn shift_before_insert(&mut self, inserted: &StackPosition) {
        for entry in self.entries.values_mut() {
            if let Recorded::Placed(at) = entry {
                if at.pos == inserted.pos && at.index >= inserted.index {
                    at.index = at.index.saturating_add(1);
                }
            }
        }
    }

    /// Writes the known/unknown creature header plus body and places the creature
    pub fn write_creature<W: WorldView + ?Sized>(
        &mut self,
        world: &W,
        creature: CreatureId,
        at: StackPosition,
        out: &mut OutputBuffer,
    ) -> Result<(), WireError> {
        let registration = self.register_creature(world, creature);
        if registration.known {
            out.add_u16(CREATURE_KNOWN)?;
            out.add_u32(creature)?;
        } else {
            out.add_u16(CREATURE_UNKNOWN)?;
            out.add_u32(registration.removed.unwrap_or(0))?;
            out.add_u32(creature)?;
        }
        world.write_creature(self.viewer, creature, registration.known, out)?;
        self.entries.insert(creature, Recorded::Placed(at));
        Ok(())
    }

    /// Writes the visible stack of one tile
    fn write_tile_things<W: WorldView + ?Sized>(
        &mut self,
        world: &W,
        pos: &Position,
        things: Vec<TileThing>,
        out: &mut OutputBuffer,
    ) -> Result<(), WireError> {
        self.invalidate_creatures_at_position(pos);
        for (index, thing) in things.into_iter().take(MAX_STACK_SIZE).enumerate() {
            match thing {
                TileThing::Item(bytes) => out.add_bytes(&bytes)?,
                TileThing::Creature(id) => {
                    self.write_creature(world, id, StackPosition::new(*pos, index as u8), out)?
                }
            }
        }
        Ok(())
    }

    /// `0x69` update replacing one tile
    pub fn write_tile_update<W: WorldView + ?Sized>(
        &mut self,
        world: &W,
        pos: &Position,
        out: &mut OutputBuffer,
    ) -> Result<(), WireError> {
        out.add_u8(OP_TILE_UPDATE)?;
        out.add_position(pos)?;
        match world.tile_things(self.viewer, pos) {
            Some(things) => {
                self.write_tile_things(world, pos, things, out)?;
                out.add_u8(0x00)?;
                out.add_u8(0xFF)
            }
            None => {
                self.invalidate_creatures_at_position(pos);
                out.add_u8(0x01)?;
                out.add_u8(0xFF)
            }
        }
    }

    /// `0x64` full map around `center`
    pub fn write_full_area<W: WorldView + ?Sized>(
        &mut self,
        world: &W,
        center: &Position,
        out: &mut OutputBuffer,
    ) -> Result<(), WireError> {
        for entry in self.entries.values_mut() {
            if matches!(entry, Recorded::Placed(_)) {
                *entry = Recorded::Unknown;
            }
        }
        out.add_u8(OP_MAP_DESCRIPTION)?;
        out.add_position(center)?;
        self.write_map_description(
            world,
            center.x as i32 - VIEWPORT_X,
            center.y as i32 - VIEWPORT_Y,
            center.z,
            MAP_WIDTH,
            MAP_HEIGHT,
            out,
        )
    }

    /// Map slices sent after the viewer stepped from `from` to `to`
    pub fn write_step_slices<W: WorldView + ?Sized>(
        &mut self,
        world: &W,
        from: &Position,
        to: &Position,
        out: &mut OutputBuffer,
    ) -> Result<(), WireError> {
        let (fx, fy) = (from.x as i32, from.y as i32);
        let (tx, ty) = (to.x as i32, to.y as i32);

        if ty < fy {
            out.add_u8(OP_MAP_NORTH)?;
            self.write_map_description(world, fx - VIEWPORT_X, ty - VIEWPORT_Y, to.z, MAP_WIDTH, 1, out)?;
        } else if ty > fy {
            out.add_u8(OP_MAP_SOUTH)?;
            self.write_map_description(world, fx - VIEWPORT_X, ty + VIEWPORT_Y + 1, to.z, MAP_WIDTH, 1, out)?;
        }

        if tx < fx {
            out.add_u8(OP_MAP_WEST)?;
            self.write_map_description(world, tx - VIEWPORT_X, ty - VIEWPORT_Y, to.z, 1, MAP_HEIGHT, out)?;
        } else if tx > fx {
            out.add_u8(OP_MAP_EAST)?;
            self.write_map_description(world, tx + VIEWPORT_X + 1, ty - VIEWPORT_Y, to.z, 1, MAP_HEIGHT, out)?;
        }

        self.invalidate_distant_creatures(to);
        Ok(())
    }

    /// Encodes a window of floors with the client's run-length skip markers
    #[allow(clippy::too_many_arguments)]
    fn write_map_description<W: WorldView + ?Sized>(
        &mut self,
        world: &W,
        x: i32,
        y: i32,
        z: u8,
        width: i32,
        height: i32,
        out: &mut OutputBuffer,
    ) -> Result<(), WireError> {
        let z = z as i32;
        let surface = SURFACE_FLOOR as i32;
        let (start, end, step) = if z > surface {
            (z - 2, (z + 2).min(MAX_FLOOR), 1)
        } else {
            (surface, 0, -1)
        };

        let mut skip: i32 = -1;
        let mut floor = start;
        loop {
            self.write_floor(world, x, y, floor, width, height, z - floor, &mut skip, out)?;
            if floor == end {
                break;
            }
            floor += step;
        }

        if skip >= 0 {
            out.add_u8(skip as u8)?;
            out.add_u8(0xFF)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_floor<W: WorldView + ?Sized>(
        &mut self,
        world: &W,
        x: i32,
        y: i32,
        z: i32,
        width: i32,
        height: i32,
        offset: i32,
        skip: &mut i32,
        out: &mut OutputBuffer,
    ) -> Result<(), WireError> {
        for nx in 0..width {
            for ny in 0..height {
                let pos = to_position(x + nx + offset, y + ny + offset, z);
                let things = pos.and_then(|pos| {
                    world
                        .tile_things(self.viewer, &pos)
                        .map(|things| (pos, things))
                });

                match things {
                    Some((pos, things)) => {
                        if *skip >= 0 {
                            out.add_u8(*skip as u8)?;
                            out.add_u8(0xFF)?;
                        }
                        *skip = 0;
                        self.write_tile_things(world, &pos, things, out)?;
                    }
                    None if *skip == 0xFE => {
                        out.add_u8(0xFF)?;
                        out.add_u8(0xFF)?;
                        *skip = -1;
                    }
                    None => *skip += 1,
                }
            }
        }
        Ok(())
    }
}

fn to_position(x: i32, y: i32, z: i32) -> Option<Position> {
    Some(Position::new(
        u16::try_from(x).ok()?,
        u16::try_from(y).ok()?,
        u8::try_from(z).ok()?,
    ))
}

/// Log formatting for an optional placement
struct Slot(Option<StackPosition>);

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(at) => write!(f, "{}", at),
            None => f.write_str("none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const VIEWER: CreatureId = 1;

    /// Flat test map: every tile exists with one ground item
    struct TestWorld {
        positions: HashMap<CreatureId, StackPosition>,
        hidden: HashSet<CreatureId>,
    }

    impl TestWorld {
        fn new(viewer_at: Position) -> Self {
            let mut positions = HashMap::new();
            positions.insert(VIEWER, StackPosition::new(viewer_at, 1));
            Self {
                positions,
                hidden: HashSet::new(),
            }
        }

        fn place(&mut self, creature: CreatureId, at: StackPosition) {
            self.positions.insert(creature, at);
        }
    }

    impl WorldView for TestWorld {
        fn tile_things(&self, _viewer: CreatureId, pos: &Position) -> Option<Vec<TileThing>> {
            if pos.z != SURFACE_FLOOR {
                return None;
            }
            let mut creatures: Vec<_> = self
                .positions
                .iter()
                .filter(|(_, at)| at.pos == *pos)
                .map(|(&id, at)| (at.index, id))
                .collect();
            creatures.sort();

            let mut things = vec![TileThing::Item(vec![0x66, 0x00])];
            things.extend(creatures.into_iter().map(|(_, id)| TileThing::Creature(id)));
            Some(things)
        }

        fn creature_position(&self, creature: CreatureId) -> Option<Position> {
            self.positions.get(&creature).map(|at| at.pos)
        }

        fn can_see_creature(&self, _viewer: CreatureId, creature: CreatureId) -> bool {
            !self.hidden.contains(&creature)
        }

        fn write_creature(
            &self,
            _viewer: CreatureId,
            creature: CreatureId,
            _known: bool,
            out: &mut OutputBuffer,
        ) -> Result<(), WireError> {
            out.add_u8(creature as u8)
        }
    }

    fn at(x: u16, y: u16, index: u8) -> StackPosition {
        StackPosition::new(Position::new(x, y, 7), index)
    }

    #[test]
    fn test_register_reports_known_state() {
        let world = TestWorld::new(Position::new(100, 100, 7));
        let mut known = KnownCreatures::new(VIEWER);

        let first = known.register_creature(&world, 2);
        assert!(!first.known);
        assert_eq!(first.removed, None);
        assert!(known.register_creature(&world, 2).known);
        assert_eq!(known.recorded(2), Recorded::Unknown);
    }

    #[test]
    fn test_full_cache_evicts_invisible_first() {
        let mut world = TestWorld::new(Position::new(100, 100, 7));
        let mut known = KnownCreatures::with_capacity(VIEWER, 3);
        known.register_creature(&world, VIEWER);
        known.register_creature(&world, 2);
        known.register_creature(&world, 3);
        known.update_registered_creature(2, Some(at(101, 100, 1)));
        known.update_registered_creature(3, Some(at(109, 100, 1)));
        world.hidden.insert(2);

        let registration = known.register_creature(&world, 4);
        assert_eq!(registration.removed, Some(2));
        assert!(!known.is_known(2));
    }

    #[test]
    fn test_full_cache_evicts_farthest() {
        let world = TestWorld::new(Position::new(100, 100, 7));
        let mut known = KnownCreatures::with_capacity(VIEWER, 3);
        known.register_creature(&world, VIEWER);
        known.register_creature(&world, 2);
        known.register_creature(&world, 3);
        known.update_registered_creature(2, Some(at(101, 100, 1)));
        known.update_registered_creature(3, Some(at(107, 104, 1)));

        let registration = known.register_creature(&world, 4);
        assert_eq!(registration.removed, Some(3));
        assert!(known.is_known(VIEWER));
    }

    #[test]
    fn test_validation_outcomes() {
        let world = TestWorld::new(Position::new(100, 100, 7));
        let mut known = KnownCreatures::new(VIEWER);

        assert_eq!(known.validate_registered_creature(2, None), Validation::Fresh);
        assert_eq!(
            known.validate_registered_creature(2, Some(at(100, 100, 1))),
            Validation::Wrong {
                recorded: Recorded::Unregistered
            }
        );

        known.register_creature(&world, 2);
        known.update_registered_creature(2, Some(at(100, 100, 1)));
        assert_eq!(
            known.validate_registered_creature(2, Some(at(100, 100, 1))),
            Validation::Valid
        );
        assert_eq!(
            known.validate_registered_creature(2, None),
            Validation::Wrong {
                recorded: Recorded::Placed(at(100, 100, 1))
            }
        );

        known.update_registered_creature(2, None);
        assert_eq!(known.validate_registered_creature(2, None), Validation::Fresh);
    }

    #[test]
    fn test_validation_is_idempotent() {
        let world = TestWorld::new(Position::new(100, 100, 7));
        let mut known = KnownCreatures::new(VIEWER);
        known.register_creature(&world, 2);
        known.update_registered_creature(2, Some(at(100, 100, 3)));

        let first = known.validate_registered_creature(2, Some(at(100, 100, 5)));
        let second = known.validate_registered_creature(2, Some(at(100, 100, 5)));
        assert_eq!(first, second);
        assert_eq!(known.recorded(2), Recorded::Placed(at(100, 100, 3)));
    }

    #[test]
    fn test_wrong_stack_index_resends_tiles() {
        let mut world = TestWorld::new(Position::new(100, 100, 7));
        world.place(2, at(101, 100, 1));
        let mut known = KnownCreatures::new(VIEWER);
        known.register_creature(&world, 2);
        known.update_registered_creature(2, Some(at(100, 100, 3)));

        let validation = known.validate_registered_creature(2, Some(at(100, 100, 5)));
        let recorded = match validation {
            Validation::Wrong { recorded } => recorded,
            other => panic!("expected a mismatch, got {:?}", other),
        };
        assert_eq!(recorded, Recorded::Placed(at(100, 100, 3)));

        let mut out = OutputBuffer::new();
        let correction = known
            .correct_registered_creature(
                &world,
                2,
                recorded,
                Some(at(100, 100, 5)),
                Some(at(101, 100, 1)),
                "test_wrong_stack_index_resends_tiles",
                &mut out,
            )
            .unwrap();

        match correction {
            Correction::Tiles(tiles) => {
                assert!(tiles.contains(&Position::new(100, 100, 7)));
                assert!(tiles.contains(&Position::new(101, 100, 7)));
            }
            other => panic!("expected tile resend, got {:?}", other),
        }
        assert_eq!(out.body()[0], OP_TILE_UPDATE);
        // The resent tile placed the creature where the world has it
        assert_eq!(known.recorded(2), Recorded::Placed(at(101, 100, 1)));
    }

    #[test]
    fn test_viewer_desync_resends_full_area() {
        let world = TestWorld::new(Position::new(100, 100, 7));
        let mut known = KnownCreatures::new(VIEWER);
        let mut out = OutputBuffer::new();

        let correction = known
            .correct_registered_creature(
                &world,
                VIEWER,
                Recorded::Unregistered,
                Some(at(99, 100, 1)),
                Some(at(100, 100, 1)),
                "test_viewer_desync_resends_full_area",
                &mut out,
            )
            .unwrap();

        assert_eq!(correction, Correction::FullArea(Position::new(100, 100, 7)));
        assert_eq!(out.body()[0], OP_MAP_DESCRIPTION);
        assert_eq!(known.recorded(VIEWER), Recorded::Placed(at(100, 100, 1)));
    }

    #[test]
    fn test_unknown_creature_appears_at_new_position() {
        let mut world = TestWorld::new(Position::new(100, 100, 7));
        world.place(2, at(103, 101, 1));
        let mut known = KnownCreatures::new(VIEWER);
        let mut out = OutputBuffer::new();

        let correction = known
            .correct_registered_creature(
                &world,
                2,
                Recorded::Unregistered,
                Some(at(102, 101, 1)),
                Some(at(103, 101, 1)),
                "test_unknown_creature_appears_at_new_position",
                &mut out,
            )
            .unwrap();

        assert_eq!(correction, Correction::Appear(at(103, 101, 1)));
        assert_eq!(out.body()[0], OP_ADD_THING);
        assert_eq!(known.recorded(2), Recorded::Placed(at(103, 101, 1)));
    }

    #[test]
    fn test_removal_of_unplaced_creature_needs_nothing() {
        let world = TestWorld::new(Position::new(100, 100, 7));
        let mut known = KnownCreatures::new(VIEWER);
        let mut out = OutputBuffer::new();

        let correction = known
            .correct_registered_creature(
                &world,
                2,
                Recorded::Unknown,
                Some(at(101, 101, 1)),
                None,
                "test_removal_of_unplaced_creature_needs_nothing",
                &mut out,
            )
            .unwrap();
        assert_eq!(correction, Correction::Nothing);
        assert!(out.is_empty());
    }

    #[test]
    fn test_invalidation() {
        let world = TestWorld::new(Position::new(100, 100, 7));
        let mut known = KnownCreatures::new(VIEWER);
        for id in 2..=4 {
            known.register_creature(&world, id);
        }
        known.update_registered_creature(2, Some(at(100, 100, 2)));
        known.update_registered_creature(3, Some(at(130, 100, 1)));
        known.update_registered_creature(4, Some(at(101, 100, 1)));

        known.invalidate_distant_creatures(&Position::new(100, 100, 7));
        assert_eq!(known.recorded(3), Recorded::Unknown);
        assert_eq!(known.recorded(2), Recorded::Placed(at(100, 100, 2)));

        known.invalidate_creatures_at_position(&Position::new(100, 100, 7));
        assert_eq!(known.recorded(2), Recorded::Unknown);
        assert_eq!(known.recorded(4), Recorded::Placed(at(101, 100, 1)));
    }

    #[test]
    fn test_stack_shifts() {
        let world = TestWorld::new(Position::new(100, 100, 7));
        let mut known = KnownCreatures::new(VIEWER);
        known.register_creature(&world, 2);
        known.register_creature(&world, 3);
        known.update_registered_creature(2, Some(at(100, 100, 1)));
        known.update_registered_creature(3, Some(at(100, 100, 2)));

        known.shift_after_remove(&at(100, 100, 1));
        assert_eq!(known.recorded(3), Recorded::Placed(at(100, 100, 1)));

        known.shift_before_insert(&at(100, 100, 1));
        assert_eq!(known.recorded(3), Recorded::Placed(at(100, 100, 2)));
    }

    #[test]
    fn test_full_area_encodes_skip_runs() {
        let world = TestWorld::new(Position::new(100, 100, 7));
        let mut known = KnownCreatures::new(VIEWER);
        let mut out = OutputBuffer::new();

        known
            .write_full_area(&world, &Position::new(100, 100, 7), &mut out)
            .unwrap();

        let body = out.body();
        assert_eq!(body[0], OP_MAP_DESCRIPTION);
        // Floors 6..0 have no tiles: the description ends with a skip marker
        assert_eq!(body[body.len() - 1], 0xFF);
        assert!(known.is_known(VIEWER));
    }
}
