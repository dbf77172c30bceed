use idtfv::{corpus::DirSource, Config, Corpus, FvResult};
use log::{error, info};

/// Encode every trajectory batch of the data directory and write one feature
/// table per enabled channel. An optional JSON config path overrides the
/// defaults.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> FvResult<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    info!(
        "Encoding {:?} with K={} into {:?}",
        config.channels.enabled(),
        config.gmm.n_components,
        config.target_dir
    );

    let source = DirSource::new(&config.data_dir);
    let corpus = Corpus::new(config)?;
    let report = corpus.run(&source)?;

    // raw dumps are already on disk
    if corpus.config().channels.enabled().is_empty() {
        return Ok(());
    }
    let written = report.save(&corpus.config().target_dir)?;
    info!(
        "{} videos processed, {} channel failures, {} tables written",
        report.completed(),
        report.failures().len(),
        written.len()
    );
    Ok(())
}
