use idtfv::{corpus::DirSource, Config, Corpus};

fn main() {
    env_logger::init();

    // Encode the batches stored in data/ and write the tables to features/
    let config = Config::default();
    let source = DirSource::new(&config.data_dir);
    let corpus = Corpus::new(config).unwrap();
    let report = corpus.run(&source).unwrap();
    println!("Wrote {:?}", report.save("features").unwrap());

    for failure in report.failures() {
        println!("{} ({:?}): {}", failure.video, failure.channel, failure.error);
    }
}
