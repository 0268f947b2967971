use dashmap::DashMap;
use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};
use structopt::StructOpt;

use std::{sync::Arc, thread, time};

use cchain::Map;

type Ky = u64;

/// Command line options.
#[derive(Clone, StructOpt)]
pub struct Opt {
    #[structopt(long = "seed")]
    seed: Option<u64>,

    #[structopt(long = "capacity", default_value = "16")]
    capacity: usize,

    #[structopt(long = "loads", default_value = "1000000")] // default 1M
    loads: usize,

    #[structopt(long = "gets", default_value = "0")]
    gets: usize,

    #[structopt(long = "sets", default_value = "0")]
    sets: usize,

    #[structopt(long = "rems", default_value = "0")]
    rems: usize,

    #[structopt(long = "threads", default_value = "1")]
    threads: usize,

    #[structopt(long = "validate")]
    validate: bool,

    #[structopt(long = "dashmap")]
    dash_map: bool,

    #[structopt(long = "flurry")]
    flurry_map: bool,
}

/// Common operations over the maps under test.
trait PerfMap: Send + 'static {
    fn name(&self) -> &'static str;

    fn handle(&self) -> Self;

    fn set(&mut self, key: Ky, value: u64);

    fn get(&mut self, key: Ky);

    fn remove(&mut self, key: Ky);
}

impl PerfMap for Map<Ky, u64> {
    fn name(&self) -> &'static str {
        "cchain"
    }

    fn handle(&self) -> Self {
        self.clone()
    }

    fn set(&mut self, key: Ky, value: u64) {
        self.put(key, value);
    }

    fn get(&mut self, key: Ky) {
        Map::get(self, &key);
    }

    fn remove(&mut self, key: Ky) {
        self.delete(&key);
    }
}

impl PerfMap for Arc<DashMap<Ky, u64>> {
    fn name(&self) -> &'static str {
        "dashmap"
    }

    fn handle(&self) -> Self {
        Arc::clone(self)
    }

    fn set(&mut self, key: Ky, value: u64) {
        self.insert(key, value);
    }

    fn get(&mut self, key: Ky) {
        DashMap::get(self, &key);
    }

    fn remove(&mut self, key: Ky) {
        DashMap::remove(self, &key);
    }
}

impl PerfMap for Arc<flurry::HashMap<Ky, u64>> {
    fn name(&self) -> &'static str {
        "flurry"
    }

    fn handle(&self) -> Self {
        Arc::clone(self)
    }

    fn set(&mut self, key: Ky, value: u64) {
        self.pin().insert(key, value);
    }

    fn get(&mut self, key: Ky) {
        self.pin().get(&key);
    }

    fn remove(&mut self, key: Ky) {
        self.pin().remove(&key);
    }
}

fn main() {
    let opts = Opt::from_args();
    if opts.dash_map {
        dash_map(opts)
    } else if opts.flurry_map {
        flurry_map(opts)
    } else {
        cchain_map(opts)
    }
}

fn cchain_map(opts: Opt) {
    let map: Map<Ky, u64> = match Map::with_capacity(opts.capacity) {
        Ok(map) => map,
        Err(err) => {
            println!("invalid options: {}", err);
            return;
        }
    };
    let validate = opts.validate;
    let map = run(opts, map);
    if validate {
        println!("{:?}", map.validate());
    }
}

fn dash_map(opts: Opt) {
    run(opts, Arc::new(DashMap::new()));
}

fn flurry_map(opts: Opt) {
    run(opts, Arc::new(flurry::HashMap::new()));
}

fn run<M: PerfMap>(opts: Opt, mut map: M) -> M {
    let seed = opts.seed.unwrap_or_else(random);
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("{} seed:{}", map.name(), seed);

    // initial load
    let start = time::Instant::now();
    for _i in 0..opts.loads {
        let key = rng.gen::<Ky>() % (opts.loads as Ky);
        map.set(key, rng.gen());
    }
    println!("loaded {} items in {:?}", opts.loads, start.elapsed());

    let mut handles = vec![];
    for j in 0..opts.threads {
        let (opts, map) = (opts.clone(), map.handle());
        let seed = seed.wrapping_add((j as u64) * 100);
        handles.push(thread::spawn(move || incremental(j, seed, opts, map)));
    }

    for handle in handles.into_iter() {
        handle.join().unwrap()
    }

    map
}

fn incremental<M: PerfMap>(j: usize, seed: u64, opts: Opt, mut map: M) {
    let mut rng = SmallRng::seed_from_u64(seed);

    let start = time::Instant::now();
    let (mut sets, mut rems, mut gets) = (opts.sets, opts.rems, opts.gets);
    let key_max = to_key_max(&opts);
    while (sets + rems + gets) > 0 {
        let key = rng.gen::<Ky>() % key_max;

        let op = rng.gen::<usize>() % (sets + rems + gets);
        if op < sets {
            map.set(key, rng.gen());
            sets -= 1;
        } else if op < (sets + rems) {
            map.remove(key);
            rems -= 1;
        } else {
            map.get(key);
            gets -= 1;
        }
    }
    println!(
        "{}-incremental-{} for operations {}, took {:?}",
        map.name(),
        j,
        opts.sets + opts.rems + opts.gets,
        start.elapsed()
    );
}

// keys for incremental operations span the loaded and the newly set keys,
// never empty.
fn to_key_max(opts: &Opt) -> Ky {
    ((opts.loads + opts.sets) as Ky).max(1)
}

#[cfg(test)]
mod perf_test {
    use super::*;

    fn new_opt(loads: usize, gets: usize, sets: usize, rems: usize) -> Opt {
        Opt {
            seed: Some(10),
            capacity: 16,
            loads,
            gets,
            sets,
            rems,
            threads: 2,
            validate: true,
            dash_map: false,
            flurry_map: false,
        }
    }

    #[test]
    fn test_key_max() {
        assert_eq!(to_key_max(&new_opt(0, 10, 0, 10)), 1);
        assert_eq!(to_key_max(&new_opt(100, 0, 20, 0)), 120);
    }

    #[test]
    fn test_run_without_loads() {
        let map: Map<Ky, u64> = Map::new();
        let map = run(new_opt(0, 100, 0, 100), map);
        assert!(map.is_empty());
    }

    #[test]
    fn test_run_maps() {
        let map = run(new_opt(1000, 500, 500, 500), Map::<Ky, u64>::new());
        let stats = map.validate().unwrap();
        assert_eq!(stats.n_entries, map.size());
        assert!(map.size() <= 1500);

        let dmap = run(new_opt(1000, 500, 500, 500), Arc::new(DashMap::new()));
        assert!(dmap.len() <= 1500);

        let fmap = run(new_opt(1000, 500, 500, 500), Arc::new(flurry::HashMap::new()));
        assert!(fmap.len() <= 1500);
    }
}
