use idtfv::{
    corpus::MemorySource,
    trajectory::{HOF_DIM, HOG_DIM, MBH_DIM},
    Channel, Config, Corpus, TrajectoryRecord,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn main() {
    // Random trajectories standing in for the dense trajectory extractor
    let mut rng = StdRng::seed_from_u64(0);
    let mut source = MemorySource::new();
    for name in ["walk10", "walk2", "run1"] {
        let n = rng.gen_range(60..120);
        let mut block = |dim: usize| (0..dim).map(|_| rng.gen::<f32>()).collect::<Vec<_>>();
        let records = (0..n)
            .map(|_| TrajectoryRecord::with_descriptors(block(HOG_DIM), block(HOF_DIM), block(MBH_DIM), block(MBH_DIM)))
            .collect();
        source.insert(name, records);
    }

    let mut config = Config::default();
    config.gmm.n_components = 4;
    config.gmm.seed = Some(1);

    let corpus = Corpus::new(config).unwrap();
    let report = corpus.run(&source).unwrap();

    for channel in Channel::ALL.iter() {
        let table = report.table(*channel).unwrap();
        println!("{}: {} rows of width {:?}", channel, table.len(), table.width());
        for (name, fv) in table.iter() {
            println!("  {:<8} {:?}...", name, &fv[..4]);
        }
    }
}
