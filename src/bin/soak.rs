use std::path::Path;

use avatarsync::{
    ClientKind, CoordGrid, NpcProtocol, NullEncoder, ProtocolConfig, StepDir, ZoneGrid,
    AvatarRepository, ROOT_WORLD,
};

fn lcg_next(state: &mut u64) -> u32 {
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1);
    (*state >> 32) as u32
}

fn parse_arg(args: &[String], position: usize, default: usize) -> usize {
    args.get(position)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn run(args: &[String]) -> Result<(), String> {
    let config = match args.get(1).filter(|a| a.ends_with(".yaml")) {
        Some(path) => ProtocolConfig::load(Path::new(path))?,
        None => {
            let mut config = ProtocolConfig::default();
            config.apply_env();
            config.validate()?;
            config
        }
    };
    let offset = usize::from(args.get(1).is_some_and(|a| a.ends_with(".yaml")));
    let npcs = parse_arg(args, 1 + offset, 5000).min(60_000) as u16;
    let observers = parse_arg(args, 2 + offset, 200).min(2000) as u16;
    let ticks = parse_arg(args, 3 + offset, 100) as u64;

    avatarsync::telemetry::logging::init(Path::new("."))?;

    let mut repo = AvatarRepository::with_recycle_cap(config.recycle_cap);
    let mut grid = ZoneGrid::new();
    let mut state: u64 = 0x0dd5_eed5_0f50_a6e5;
    for index in 0..npcs {
        let x = 3000 + (lcg_next(&mut state) % 512) as u16;
        let z = 3000 + (lcg_next(&mut state) % 512) as u16;
        let coord = CoordGrid::new(0, x, z);
        repo.allocate(index, 1000 + index % 512, coord)
            .map_err(|err| err.to_string())?;
        grid.insert(coord, index);
    }

    let mut protocol = NpcProtocol::new(config)?;
    for observer in 0..observers {
        let info = protocol
            .add_observer(observer, ClientKind::Desktop)
            .map_err(|err| err.to_string())?;
        let x = 3000 + (lcg_next(&mut state) % 512) as u16;
        let z = 3000 + (lcg_next(&mut state) % 512) as u16;
        info.start_world(ROOT_WORLD, CoordGrid::new(0, x, z))
            .map_err(|err| err.to_string())?;
    }

    let mut total_bytes = 0usize;
    let mut total_micros = 0u128;
    let mut total_faults = 0usize;
    for _ in 0..ticks {
        // A slice of the population wanders each tick.
        for index in (0..npcs).step_by(7) {
            let Some(record) = repo.get_mut(index) else {
                continue;
            };
            let from = record.coord;
            let Some(dir) = StepDir::from_code(lcg_next(&mut state) % 8) else {
                continue;
            };
            record.walk(dir);
            let to = record.coord;
            grid.relocate(from, to, index);
        }
        let stats = protocol.update(&mut repo, &grid, &NullEncoder, None);
        total_bytes += stats.bytes;
        total_micros += stats.elapsed_micros;
        total_faults += stats.faults;
        for observer in 0..observers {
            let _ = protocol.to_packet(observer, ROOT_WORLD);
        }
    }

    println!("avatarsync soak");
    println!("- npcs: {}", npcs);
    println!("- observers: {}", observers);
    println!("- ticks: {}", ticks);
    println!("- bytes emitted: {}", total_bytes);
    println!("- faults: {}", total_faults);
    if ticks > 0 {
        println!("- avg tick: {}us", total_micros / u128::from(ticks.max(1)));
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if let Err(err) = run(&args) {
        eprintln!("soak: {}", err);
        std::process::exit(1);
    }
}
