use std::collections::hash_map::DefaultHasher;
use std::hash::BuildHasherDefault;

use clap::Parser;
use tagmap::RobinMap;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short = 'n', long = "entries", default_value_t = 100_000)]
    entries: u64,

    #[arg(short = 'l', long = "load_factor", default_value_t = 0.8)]
    load_factor: f32,
}

fn main() {
    let args = Args::parse();

    let mut map: RobinMap<u64, u64, BuildHasherDefault<DefaultHasher>> = RobinMap::new();
    map.set_max_load_factor(args.load_factor);

    println!(
        "Filling RobinMap with {} entries at max load factor {:.2}...",
        args.entries,
        map.max_load_factor()
    );
    for k in 0..args.entries {
        map.insert(k, k.wrapping_mul(31));
    }

    println!(
        "len = {}, capacity = {}, load = {:.2}%",
        map.len(),
        map.capacity(),
        map.len() as f64 / map.capacity() as f64 * 100.0
    );

    map.probe_histogram().print();
}
