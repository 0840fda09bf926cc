use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use rayon::prelude::*;

use crate::config::ProtocolConfig;
use crate::entities::repository::AvatarRepository;
use crate::net::extended::{ClientKind, ExtendedInfoEncoder};
use crate::net::npc_info::{NpcInfo, NpcInfoError, VisibilityFilter};
use crate::telemetry::logging;
use crate::world::zones::ZoneIndex;

/// Connected-observer ceiling.
pub const MAX_OBSERVERS: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    ObserverOutOfRange(u16),
    ObserverExists(u16),
    UnknownObserver(u16),
    Observer(NpcInfoError),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::ObserverOutOfRange(index) => {
                write!(f, "observer index {} outside 0..{}", index, MAX_OBSERVERS)
            }
            ProtocolError::ObserverExists(index) => {
                write!(f, "observer {} already connected", index)
            }
            ProtocolError::UnknownObserver(index) => {
                write!(f, "observer {} not connected", index)
            }
            ProtocolError::Observer(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<NpcInfoError> for ProtocolError {
    fn from(err: NpcInfoError) -> Self {
        ProtocolError::Observer(err)
    }
}

/// Summary of one tick, fed to the lag log and available to callers.
#[derive(Debug, Clone, Default)]
pub struct TickStats {
    pub tick: u64,
    pub observers: usize,
    pub faults: usize,
    pub bytes: usize,
    pub elapsed_micros: u128,
}

/// Drives the per-tick pipeline over every connected observer:
/// `prepare_bitcodes` -> `put_bitcodes` -> `prepare_extended_info` ->
/// `put_extended_info` -> `post_update`, with a synchronous barrier
/// between phases. The two `put` phases fan observer work units out over
/// the worker pool; a failing unit faults only its own observer.
///
/// `update` borrows the repository mutably, so allocate/release can never
/// overlap a running tick: the single-writer discipline the slot table
/// needs is enforced by the borrow checker at this seam.
pub struct NpcProtocol {
    config: ProtocolConfig,
    pool: Option<rayon::ThreadPool>,
    observers: Vec<Option<NpcInfo>>,
    tick: u64,
}

impl NpcProtocol {
    pub fn new(config: ProtocolConfig) -> Result<Self, String> {
        config.validate()?;
        let pool = if config.worker_threads > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.worker_threads)
                    .build()
                    .map_err(|err| format!("worker pool build failed: {}", err))?,
            )
        } else {
            None
        };
        let mut observers = Vec::with_capacity(MAX_OBSERVERS);
        observers.resize_with(MAX_OBSERVERS, || None);
        Ok(Self {
            config,
            pool,
            observers,
            tick: 0,
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn tick_id(&self) -> u64 {
        self.tick
    }

    pub fn observer_count(&self) -> usize {
        self.observers.iter().flatten().count()
    }

    pub fn add_observer(
        &mut self,
        observer_index: u16,
        client: ClientKind,
    ) -> Result<&mut NpcInfo, ProtocolError> {
        let slot = usize::from(observer_index);
        if slot >= MAX_OBSERVERS {
            return Err(ProtocolError::ObserverOutOfRange(observer_index));
        }
        if self.observers[slot].is_some() {
            return Err(ProtocolError::ObserverExists(observer_index));
        }
        logging::log_protocol(&format!("observer {} connected", observer_index));
        Ok(self.observers[slot].insert(NpcInfo::new(observer_index, client, &self.config)))
    }

    pub fn remove_observer(
        &mut self,
        observer_index: u16,
        repo: &AvatarRepository,
    ) -> Result<(), ProtocolError> {
        let slot = usize::from(observer_index);
        if slot >= MAX_OBSERVERS {
            return Err(ProtocolError::ObserverOutOfRange(observer_index));
        }
        let Some(mut info) = self.observers[slot].take() else {
            return Err(ProtocolError::UnknownObserver(observer_index));
        };
        info.reset(repo);
        logging::log_protocol(&format!("observer {} disconnected", observer_index));
        Ok(())
    }

    pub fn observer(&self, observer_index: u16) -> Option<&NpcInfo> {
        self.observers.get(usize::from(observer_index))?.as_ref()
    }

    pub fn observer_mut(&mut self, observer_index: u16) -> Option<&mut NpcInfo> {
        self.observers.get_mut(usize::from(observer_index))?.as_mut()
    }

    /// The finished buffer for one (observer, world), or that observer's
    /// stored fault, raised here exactly once.
    pub fn to_packet(
        &mut self,
        observer_index: u16,
        world_id: u16,
    ) -> Result<&[u8], ProtocolError> {
        let info = self
            .observer_mut(observer_index)
            .ok_or(ProtocolError::UnknownObserver(observer_index))?;
        info.to_packet(world_id).map_err(ProtocolError::from)
    }

    /// Run one full tick.
    pub fn update(
        &mut self,
        repo: &mut AvatarRepository,
        zones: &dyn ZoneIndex,
        encoder: &dyn ExtendedInfoEncoder,
        filter: Option<&dyn VisibilityFilter>,
    ) -> TickStats {
        let started = Instant::now();
        let Self {
            config,
            pool,
            observers,
            tick,
        } = self;
        let tick_now = *tick;

        // Phase 1: every observed record precomputes its movement bits,
        // once, on the coordinating thread.
        for record in repo.iter_active_mut() {
            record.prepare_block(tick_now);
        }

        // Phase 2: per-observer bit emission, slot table shared read-only.
        {
            let repo_shared: &AvatarRepository = repo;
            run_phase(pool.as_ref(), observers, |info| {
                info.put_bitcodes(repo_shared, zones, filter, tick_now)
            });
        }

        // Phase 3: stage attribute diffs for every observed record with
        // pending extended info.
        for record in repo.iter_active() {
            if record.observer_count() > 0 && record.extended_flags() != 0 {
                encoder.prepare(record.index(), record.extended_flags());
            }
        }

        // Phase 4: per-observer extended-info serialization.
        {
            let repo_shared: &AvatarRepository = repo;
            run_phase(pool.as_ref(), observers, |info| {
                info.put_extended_info(repo_shared, encoder)
            });
        }

        // Phase 5: post-tick bookkeeping on the coordinating thread.
        let mut stats = TickStats {
            tick: tick_now,
            ..TickStats::default()
        };
        for info in observers.iter_mut().flatten() {
            stats.observers += 1;
            stats.bytes += info.emitted_bytes();
            if let Some(fault) = info.fault() {
                stats.faults += 1;
                logging::log_error(&format!("tick {}: {}", tick_now, fault));
            }
            info.post_update();
        }
        for record in repo.iter_active_mut() {
            record.post_tick();
        }
        *tick += 1;

        stats.elapsed_micros = started.elapsed().as_micros();
        if stats.elapsed_micros / 1000 >= u128::from(config.lag_threshold_millis) {
            logging::log_lag(&format!(
                "tick {} took {}us across {} observers",
                tick_now, stats.elapsed_micros, stats.observers
            ));
        }
        stats
    }
}

/// Dispatch one phase across all observers, isolating each unit's failure
/// against its own observer. An observer already faulted this tick is
/// skipped for the rest of the tick.
fn run_phase<F>(pool: Option<&rayon::ThreadPool>, observers: &mut [Option<NpcInfo>], op: F)
where
    F: Fn(&mut NpcInfo) -> Result<(), NpcInfoError> + Sync,
{
    let unit = |info: &mut NpcInfo| {
        if info.has_fault() {
            return;
        }
        match catch_unwind(AssertUnwindSafe(|| op(info))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => info.set_fault(err.to_string()),
            Err(panic) => info.set_fault(panic_message(&panic)),
        }
    };
    match pool {
        Some(pool) => pool.install(|| {
            observers
                .par_iter_mut()
                .filter_map(|slot| slot.as_mut())
                .for_each(unit);
        }),
        None => observers.iter_mut().flatten().for_each(unit),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unit panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::avatar::Priority;
    use crate::net::bitbuf::BitBuf;
    use crate::net::extended::NullEncoder;
    use crate::net::npc_info::ROOT_WORLD;
    use crate::world::position::{CoordGrid, StepDir};
    use crate::world::zones::ZoneGrid;

    fn world_with_npcs(count: u16) -> (AvatarRepository, ZoneGrid) {
        let mut repo = AvatarRepository::new();
        let mut grid = ZoneGrid::new();
        for index in 0..count {
            let coord = CoordGrid::new(0, 3200 + index % 8, 3200 + index / 8);
            repo.allocate(index, 2000 + index, coord).expect("allocate");
            grid.insert(coord, index);
        }
        (repo, grid)
    }

    fn connect(protocol: &mut NpcProtocol, observer: u16, x: u16, z: u16) {
        let info = protocol
            .add_observer(observer, ClientKind::Desktop)
            .expect("add observer");
        info.start_world(ROOT_WORLD, CoordGrid::new(0, x, z))
            .expect("start world");
    }

    struct PanicFor(u16);

    impl VisibilityFilter for PanicFor {
        fn accept(&self, observer_index: u16, _npc_index: u16) -> bool {
            if observer_index == self.0 {
                panic!("forced unit failure");
            }
            true
        }
    }

    #[test]
    fn tick_produces_a_packet_per_observer() {
        let (mut repo, grid) = world_with_npcs(4);
        let mut protocol = NpcProtocol::new(ProtocolConfig::default()).expect("protocol");
        connect(&mut protocol, 0, 3200, 3200);
        connect(&mut protocol, 1, 3202, 3201);

        let stats = protocol.update(&mut repo, &grid, &NullEncoder, None);
        assert_eq!(stats.tick, 0);
        assert_eq!(stats.observers, 2);
        assert_eq!(stats.faults, 0);
        assert_eq!(protocol.tick_id(), 1);

        for observer in [0u16, 1] {
            let packet = protocol.to_packet(observer, ROOT_WORLD).expect("packet");
            let mut decoder = BitBuf::decoder(packet.to_vec());
            assert_eq!(decoder.read_bits(8).expect("count"), 0);
            // All four avatars fit every observer's view.
            for _ in 0..4 {
                let index = decoder.read_bits(16).expect("add index");
                assert!(index < 4);
                decoder.read_bits(32).expect("sizes and offsets");
                decoder.read_bits(3).expect("angle");
                decoder.read_bits(16).expect("type");
                decoder.read_bits(1).expect("pending");
            }
        }
    }

    #[test]
    fn both_observers_copy_the_same_movement_block() {
        let (mut repo, mut grid) = world_with_npcs(1);
        let mut protocol = NpcProtocol::new(ProtocolConfig::default()).expect("protocol");
        connect(&mut protocol, 0, 3200, 3200);
        connect(&mut protocol, 1, 3203, 3203);
        protocol.update(&mut repo, &grid, &NullEncoder, None);

        let from = repo.get(0).expect("record").coord;
        repo.get_mut(0).expect("record").walk(StepDir::North);
        let to = repo.get(0).expect("record").coord;
        grid.relocate(from, to, 0);
        protocol.update(&mut repo, &grid, &NullEncoder, None);

        let mut packets = Vec::new();
        for observer in [0u16, 1] {
            packets.push(protocol.to_packet(observer, ROOT_WORLD).expect("packet").to_vec());
        }
        for packet in packets {
            let mut decoder = BitBuf::decoder(packet);
            assert_eq!(decoder.read_bits(8).expect("count"), 1);
            assert_eq!(decoder.read_bits(1).expect("flag"), 1);
            assert_eq!(decoder.read_bits(2).expect("opcode"), 0b01);
            assert_eq!(decoder.read_bits(3).expect("dir"), StepDir::North.code());
        }
    }

    #[test]
    fn faulting_unit_is_isolated_from_other_observers() {
        let (mut repo, grid) = world_with_npcs(3);
        let mut config = ProtocolConfig::default();
        config.worker_threads = 2;
        let mut protocol = NpcProtocol::new(config).expect("protocol");
        for observer in [0u16, 1, 2] {
            connect(&mut protocol, observer, 3200, 3200);
        }

        let filter = PanicFor(1);
        let stats = protocol.update(&mut repo, &grid, &NullEncoder, Some(&filter));
        assert_eq!(stats.faults, 1);

        assert!(protocol.to_packet(0, ROOT_WORLD).is_ok());
        assert!(protocol.to_packet(2, ROOT_WORLD).is_ok());
        let err = protocol.to_packet(1, ROOT_WORLD).expect_err("fault");
        assert!(matches!(
            err,
            ProtocolError::Observer(NpcInfoError::Fault(_))
        ));
        // Raised exactly once.
        assert!(protocol.to_packet(1, ROOT_WORLD).is_ok());
    }

    #[test]
    fn observer_slots_are_guarded() {
        let mut protocol = NpcProtocol::new(ProtocolConfig::default()).expect("protocol");
        protocol
            .add_observer(9, ClientKind::Desktop)
            .expect("add observer");
        assert_eq!(
            protocol
                .add_observer(9, ClientKind::Desktop)
                .err()
                .map(|e| e.to_string()),
            Some("observer 9 already connected".to_string())
        );
        let repo = AvatarRepository::new();
        assert!(matches!(
            protocol.remove_observer(10, &repo),
            Err(ProtocolError::UnknownObserver(10))
        ));
        protocol.remove_observer(9, &repo).expect("remove");
        assert_eq!(protocol.observer_count(), 0);
    }

    #[test]
    fn removing_an_observer_releases_its_registrations() {
        let (mut repo, grid) = world_with_npcs(2);
        let mut protocol = NpcProtocol::new(ProtocolConfig::default()).expect("protocol");
        connect(&mut protocol, 0, 3200, 3200);
        protocol.update(&mut repo, &grid, &NullEncoder, None);
        assert_eq!(repo.get(0).map(|r| r.observer_count()), Some(1));
        protocol.remove_observer(0, &repo).expect("remove");
        assert_eq!(repo.get(0).map(|r| r.observer_count()), Some(0));
        assert_eq!(repo.get(1).map(|r| r.observer_count()), Some(0));
    }

    #[test]
    fn worker_pool_and_inline_dispatch_agree() {
        for workers in [0usize, 3] {
            let (mut repo, grid) = world_with_npcs(6);
            let mut config = ProtocolConfig::default();
            config.worker_threads = workers;
            let mut protocol = NpcProtocol::new(config).expect("protocol");
            connect(&mut protocol, 0, 3200, 3200);
            connect(&mut protocol, 1, 3201, 3202);
            protocol.update(&mut repo, &grid, &NullEncoder, None);
            let a = protocol.to_packet(0, ROOT_WORLD).expect("packet").to_vec();
            protocol.update(&mut repo, &grid, &NullEncoder, None);
            let b = protocol.to_packet(0, ROOT_WORLD).expect("packet").to_vec();
            // Steady state: identical world, identical stream.
            assert_eq!(
                BitBuf::decoder(b).read_bits(8).expect("count"),
                6,
                "workers={}",
                workers
            );
            assert_eq!(BitBuf::decoder(a).read_bits(8).expect("count"), 0);
        }
    }

    #[test]
    fn low_priority_records_respect_their_bucket_under_the_pipeline() {
        let mut repo = AvatarRepository::new();
        let mut grid = ZoneGrid::new();
        for index in 0..3u16 {
            let coord = CoordGrid::new(0, 3200 + index, 3200);
            repo.allocate(index, 100, coord).expect("allocate");
            repo.get_mut(index).expect("record").priority = Priority::Low;
            grid.insert(coord, index);
        }
        let mut config = ProtocolConfig::default();
        config.low_priority_cap = 2;
        config.normal_priority_soft_cap = 147;
        let mut protocol = NpcProtocol::new(config).expect("protocol");
        connect(&mut protocol, 0, 3200, 3200);
        protocol.update(&mut repo, &grid, &NullEncoder, None);
        let tracked = protocol
            .observer(0)
            .and_then(|info| info.tracked(ROOT_WORLD))
            .expect("tracked");
        assert_eq!(tracked.len(), 2);
    }
}
