use log::{info, warn};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::ChannelSet;
use crate::*;

/// Supplier of per-video trajectory batches.
pub trait TrajectorySource: Sync {
    /// Identifiers of all available videos, in any order.
    fn videos(&self) -> FvResult<Vec<String>>;
    /// Trajectory batch of one video.
    fn load(&self, video: &str) -> FvResult<Vec<TrajectoryRecord>>;
}

/// In-memory source, videos are listed in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    videos: Vec<(String, Vec<TrajectoryRecord>)>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, records: Vec<TrajectoryRecord>) {
        self.videos.push((name.into(), records));
    }
}

impl TrajectorySource for MemorySource {
    fn videos(&self) -> FvResult<Vec<String>> {
        Ok(self.videos.iter().map(|(name, _)| name.clone()).collect())
    }

    fn load(&self, video: &str) -> FvResult<Vec<TrajectoryRecord>> {
        self.videos
            .iter()
            .find(|(name, _)| name == video)
            .map(|(_, records)| records.clone())
            .ok_or_else(|| {
                FvErr::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no trajectories for video {}", video),
                ))
            })
    }
}

/// Directory of bincode-serialized `Vec<TrajectoryRecord>` files (`*.bin`),
/// one per video. The video name is the file stem.
#[cfg(feature = "bincode")]
#[derive(Debug, Clone)]
pub struct DirSource {
    dir: PathBuf,
}

#[cfg(feature = "bincode")]
impl DirSource {
    pub const EXTENSION: &'static str = "bin";

    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Write a batch where [`DirSource`] will find it.
    pub fn store(&self, video: &str, records: &[TrajectoryRecord]) -> FvResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_of(video);
        write_records(&path, records)?;
        Ok(path)
    }

    fn path_of(&self, video: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", video, Self::EXTENSION))
    }
}

#[cfg(feature = "bincode")]
impl TrajectorySource for DirSource {
    fn videos(&self) -> FvResult<Vec<String>> {
        let mut names = Vec::new();
        let entries = self.dir.read_dir().map_err(|e| {
            FvErr::Config(format!("cannot read input directory {:?}: {}", self.dir, e))
        })?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == Self::EXTENSION) {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        Ok(names)
    }

    fn load(&self, video: &str) -> FvResult<Vec<TrajectoryRecord>> {
        let mut file = std::fs::File::open(self.path_of(video))?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        Ok(bincode::deserialize(&buffer)?)
    }
}

#[cfg(feature = "bincode")]
fn write_records(path: &Path, records: &[TrajectoryRecord]) -> FvResult<()> {
    let serialized = bincode::serialize(records)?;
    let mut file = std::fs::File::create(path)?;
    std::io::Write::write_all(&mut file, &serialized)?;
    Ok(())
}

/// Compare identifiers so that runs of digits compare by numeric value and
/// the rest case-insensitively: `video2` < `video10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (ka, kb) = (natural_key(a), natural_key(b));
    for (x, y) in ka.iter().zip(kb.iter()) {
        let ord = match (x, y) {
            (Chunk::Digits(x), Chunk::Digits(y)) => {
                let (x, y) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
                x.len().cmp(&y.len()).then_with(|| x.cmp(y))
            }
            (Chunk::Text(x), Chunk::Text(y)) => x.cmp(y),
            (Chunk::Text(_), Chunk::Digits(_)) => Ordering::Greater,
            (Chunk::Digits(_), Chunk::Text(_)) => Ordering::Less,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    ka.len().cmp(&kb.len()).then_with(|| a.cmp(b))
}

/// Sort identifiers in natural order, see [`natural_cmp`].
pub fn sort_alphanumeric<S: AsRef<str>>(names: &mut [S]) {
    names.sort_by(|a, b| natural_cmp(a.as_ref(), b.as_ref()));
}

#[derive(Debug, PartialEq)]
enum Chunk {
    Text(String),
    Digits(String),
}

fn natural_key(s: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut digits = false;
    for ch in s.chars() {
        let is_digit = ch.is_ascii_digit();
        if is_digit != digits && !current.is_empty() {
            chunks.push(Chunk::new(digits, std::mem::take(&mut current)));
        }
        digits = is_digit;
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        chunks.push(Chunk::new(digits, current));
    }
    chunks
}

impl Chunk {
    fn new(digits: bool, s: String) -> Self {
        if digits {
            Chunk::Digits(s)
        } else {
            Chunk::Text(s)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Fisher vectors of one channel, one row per video, append-only.
pub struct FeatureTable {
    channel: Channel,
    names: Vec<String>,
    rows: Vec<FisherVector>,
    /// Row of every video name.
    index: HashMap<String, usize>,
}

impl FeatureTable {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            names: Vec::new(),
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Append a row. Every row must have the width of the first one and
    /// video names must be unique.
    pub fn append<S: Into<String>>(&mut self, name: S, features: FisherVector) -> FvResult<()> {
        let name = name.into();
        if let Some(width) = self.width() {
            if features.len() != width {
                return Err(FvErr::SchemaMismatch(format!(
                    "{} row for {} has {} values, table has {}",
                    self.channel,
                    name,
                    features.len(),
                    width
                )));
            }
        }
        if self.index.contains_key(&name) {
            return Err(FvErr::SchemaMismatch(format!(
                "{} table already holds a row for {}",
                self.channel, name
            )));
        }
        self.index.insert(name.clone(), self.rows.len());
        self.names.push(name);
        self.rows.push(features);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of feature columns, `None` while the table is empty.
    pub fn width(&self) -> Option<usize> {
        self.rows.first().map(|r| r.len())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn get(&self, name: &str) -> Option<&FisherVector> {
        self.index.get(name).map(|&i| &self.rows[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FisherVector)> {
        self.names.iter().map(|n| n.as_str()).zip(self.rows.iter())
    }

    /// Write the table as CSV: a `name` column followed by `0..L-1`.
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> FvResult<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        let width = self.width().unwrap_or(0);
        let header = std::iter::once("name".to_string()).chain((0..width).map(|i| i.to_string()));
        wtr.write_record(header)?;
        for (name, row) in self.iter() {
            let record = std::iter::once(name.to_string()).chain(row.iter().map(|&v| format_value(v)));
            wtr.write_record(record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Write `<dir>/<channel>_features.csv`. Empty tables are not written.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> FvResult<Option<PathBuf>> {
        if self.is_empty() {
            return Ok(None);
        }
        let path = dir.as_ref().join(self.channel.file_name());
        self.write_csv(std::fs::File::create(&path)?)?;
        Ok(Some(path))
    }

    /// Read a table previously written with [`FeatureTable::write_csv`].
    pub fn read_csv<R: std::io::Read>(channel: Channel, reader: R) -> FvResult<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut table = Self::new(channel);
        for record in rdr.records() {
            let record = record?;
            let name = record.get(0).unwrap_or_default().to_string();
            let row = record
                .iter()
                .skip(1)
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|e| FvErr::SchemaMismatch(format!("bad value {:?} for {}: {}", v, name, e)))
                })
                .collect::<FvResult<FisherVector>>()?;
            table.append(name, row)?;
        }
        Ok(table)
    }
}

/// Shortest round-trip text of a value, in exponent notation when its
/// magnitude falls outside `[1e-4, 1e16)`.
fn format_value(v: f64) -> String {
    let magnitude = v.abs();
    if v == 0. || (1e-4..1e16).contains(&magnitude) || !v.is_finite() {
        v.to_string()
    } else {
        format!("{:e}", v)
    }
}

#[derive(Debug)]
/// A video, or one channel of it, that produced no row.
pub struct VideoFailure {
    pub video: String,
    /// `None` when the whole video was skipped.
    pub channel: Option<Channel>,
    pub error: FvErr,
}

#[derive(Debug)]
/// Accumulated output of a corpus run.
pub struct CorpusReport {
    tables: Vec<FeatureTable>,
    failures: Vec<VideoFailure>,
    completed: usize,
}

impl CorpusReport {
    /// Empty report with one table per enabled channel.
    pub fn new(channels: &ChannelSet) -> Self {
        Self {
            tables: channels.enabled().into_iter().map(FeatureTable::new).collect(),
            failures: Vec::new(),
            completed: 0,
        }
    }

    pub fn table(&self, channel: Channel) -> Option<&FeatureTable> {
        self.tables.iter().find(|t| t.channel() == channel)
    }

    pub fn tables(&self) -> &[FeatureTable] {
        &self.tables
    }

    pub fn failures(&self) -> &[VideoFailure] {
        &self.failures
    }

    /// Videos that went through the loop, failed or not.
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Write every non-empty table into `dir`, returns the written paths.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> FvResult<Vec<PathBuf>> {
        std::fs::create_dir_all(dir.as_ref())?;
        let mut written = Vec::new();
        for table in self.tables.iter() {
            if let Some(path) = table.save(dir.as_ref())? {
                info!("Wrote {} rows to {:?}", table.len(), path);
                written.push(path);
            }
        }
        Ok(written)
    }

    /// Fold one video's encodings into the report.
    pub fn record(mut self, video: VideoEncoding) -> Self {
        let VideoEncoding { name, outcome } = video;
        match outcome {
            Err(error) => {
                warn!("Skipping {}: {}", name, error);
                self.failures.push(VideoFailure {
                    video: name,
                    channel: None,
                    error,
                });
            }
            Ok(channels) => {
                for (channel, result) in channels {
                    let appended = result.and_then(|fv| match self.tables.iter_mut().find(|t| t.channel() == channel) {
                        Some(table) => table.append(name.clone(), fv),
                        None => Err(FvErr::Config(format!("channel {} is not enabled", channel))),
                    });
                    if let Err(error) = appended {
                        warn!("No {} features for {}: {}", channel, name, error);
                        self.failures.push(VideoFailure {
                            video: name.clone(),
                            channel: Some(channel),
                            error,
                        });
                    }
                }
            }
        }
        self.completed += 1;
        self
    }
}

#[derive(Debug)]
/// Encodings of every enabled channel of one video, or the reason the video
/// could not be read.
pub struct VideoEncoding {
    pub name: String,
    pub outcome: FvResult<Vec<(Channel, FvResult<FisherVector>)>>,
}

/// Runs the channel pipelines over every video of a source.
pub struct Corpus {
    config: Config,
    pipeline: ChannelPipeline,
}

impl Corpus {
    pub fn new(config: Config) -> FvResult<Self> {
        config.validate()?;
        let pipeline = ChannelPipeline::from_config(&config);
        Ok(Self { config, pipeline })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Encode every video of `source` in natural order of their names.
    ///
    /// Failures are isolated per video and per channel and reported in the
    /// returned [`CorpusReport`]. With no channel enabled, every batch is
    /// written unprocessed to the target directory instead.
    pub fn run<S: TrajectorySource>(&self, source: &S) -> FvResult<CorpusReport> {
        let mut names = source.videos()?;
        if names.is_empty() {
            return Err(FvErr::Config(format!(
                "No input videos are present. Please put your files in the {:?} directory.",
                self.config.data_dir
            )));
        }
        sort_alphanumeric(&mut names);

        let channels = self.config.channels.enabled();
        if channels.is_empty() {
            return self.dump_raw(source, &names);
        }

        let mut report = CorpusReport::new(&self.config.channels);
        if self.config.parallel {
            let encoded: Vec<VideoEncoding> = names
                .par_iter()
                .map(|name| self.encode_video(source, name, &channels))
                .collect();
            for video in encoded {
                report = self.finish_video(report, video);
            }
        } else {
            for name in names.iter() {
                let video = self.encode_video(source, name, &channels);
                report = self.finish_video(report, video);
            }
        }
        Ok(report)
    }

    /// Load one video and run the pipeline for each channel.
    pub fn encode_video<S: TrajectorySource>(&self, source: &S, name: &str, channels: &[Channel]) -> VideoEncoding {
        let outcome = source.load(name).map(|records| {
            info!("Running: {} with {} trajectories", name, records.len());
            channels
                .iter()
                .map(|&channel| (channel, self.pipeline.run(&records, channel)))
                .collect()
        });
        VideoEncoding {
            name: name.to_string(),
            outcome,
        }
    }

    fn finish_video(&self, report: CorpusReport, video: VideoEncoding) -> CorpusReport {
        let name = video.name.clone();
        let report = report.record(video);
        info!("Completed {}", name);
        if report.completed() % 10 == 0 {
            info!("{} files were completed.", report.completed());
        }
        report
    }

    #[cfg(feature = "bincode")]
    fn dump_raw<S: TrajectorySource>(&self, source: &S, names: &[String]) -> FvResult<CorpusReport> {
        std::fs::create_dir_all(&self.config.target_dir)?;
        let mut report = CorpusReport::new(&ChannelSet::none());
        for name in names {
            let written = source.load(name).and_then(|records| {
                let path = self.config.target_dir.join(format!("{}-trajectory.bin", name));
                write_records(&path, &records)
            });
            let outcome = written.map(|_| Vec::new());
            report = self.finish_video(
                report,
                VideoEncoding {
                    name: name.clone(),
                    outcome,
                },
            );
        }
        Ok(report)
    }

    #[cfg(not(feature = "bincode"))]
    fn dump_raw<S: TrajectorySource>(&self, _source: &S, _names: &[String]) -> FvResult<CorpusReport> {
        Err(FvErr::Config("raw trajectory output requires the bincode feature".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_order() {
        let mut names = vec!["clip10", "Clip2", "clip1", "a", "clip02b", "b7"];
        sort_alphanumeric(&mut names);
        assert_eq!(names, vec!["a", "b7", "clip1", "Clip2", "clip02b", "clip10"]);
    }

    #[test]
    fn numbers_beyond_u64_compare_by_value() {
        assert_eq!(
            natural_cmp("v99999999999999999999", "v100000000000000000000"),
            Ordering::Less
        );
        // equal value, ties broken on the raw text
        assert_eq!(natural_cmp("v007", "v7"), Ordering::Less);
    }

    #[test]
    fn table_rejects_ragged_rows_and_duplicates() {
        let mut table = FeatureTable::new(Channel::Hog);
        assert_eq!(table.width(), None);
        table.append("a", vec![1., 2.]).unwrap();
        assert!(matches!(table.append("b", vec![1.]), Err(FvErr::SchemaMismatch(_))));
        assert!(matches!(table.append("a", vec![3., 4.]), Err(FvErr::SchemaMismatch(_))));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("a"), Some(&vec![1., 2.]));
    }

    #[test]
    fn csv_layout() {
        let mut table = FeatureTable::new(Channel::Hof);
        table.append("v1", vec![0.5, -1.]).unwrap();
        table.append("v2", vec![2., 0.25]).unwrap();
        let mut out = Vec::new();
        table.write_csv(&mut out).unwrap();
        assert_eq!(String::from_utf8(out.clone()).unwrap(), "name,0,1\nv1,0.5,-1\nv2,2,0.25\n");

        let back = FeatureTable::read_csv(Channel::Hof, out.as_slice()).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn extreme_values_use_exponent_notation() {
        assert_eq!(format_value(1.5e-17), "1.5e-17");
        assert_eq!(format_value(-3e20), "-3e20");
        assert_eq!(format_value(0.), "0");
        assert_eq!(format_value(0.125), "0.125");

        let mut table = FeatureTable::new(Channel::Hog);
        table.append("v1", vec![1.5e-17, -3e20, 0.125]).unwrap();
        let mut out = Vec::new();
        table.write_csv(&mut out).unwrap();
        assert_eq!(String::from_utf8(out.clone()).unwrap(), "name,0,1,2\nv1,1.5e-17,-3e20,0.125\n");
        assert_eq!(FeatureTable::read_csv(Channel::Hog, out.as_slice()).unwrap(), table);
    }

    #[test]
    fn lookup_by_name_over_many_rows() {
        let mut table = FeatureTable::new(Channel::Hof);
        for i in 0..2000 {
            table.append(format!("clip{}", i), vec![i as f64]).unwrap();
        }
        assert_eq!(table.get("clip1234"), Some(&vec![1234.]));
        assert_eq!(table.get("clip2000"), None);
        assert!(matches!(table.append("clip7", vec![0.]), Err(FvErr::SchemaMismatch(_))));
        assert_eq!(table.len(), 2000);
        assert_eq!(table.names()[1999], "clip1999");
    }

    #[test]
    fn empty_table_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(FeatureTable::new(Channel::Mbh).save(dir.path()).unwrap(), None);
        assert!(!dir.path().join("mbh_features.csv").exists());
    }

    #[test]
    fn failed_channel_does_not_block_others() {
        let report = CorpusReport::new(&ChannelSet::default()).record(VideoEncoding {
            name: "v1".into(),
            outcome: Ok(vec![
                (Channel::Hog, Ok(vec![1.])),
                (Channel::Hof, Err(FvErr::FitDivergence("nan".into()))),
                (Channel::Mbh, Ok(vec![2., 3.])),
            ]),
        });
        assert_eq!(report.table(Channel::Hog).unwrap().len(), 1);
        assert!(report.table(Channel::Hof).unwrap().is_empty());
        assert_eq!(report.table(Channel::Mbh).unwrap().len(), 1);
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures()[0].channel, Some(Channel::Hof));
        assert_eq!(report.completed(), 1);
    }

    #[test]
    fn unreadable_video_is_skipped() {
        let source = MemorySource::new();
        let corpus = Corpus::new(Config::default()).unwrap();
        let video = corpus.encode_video(&source, "missing", &[Channel::Hog]);
        let report = CorpusReport::new(&ChannelSet::default()).record(video);
        assert_eq!(report.failures().len(), 1);
        assert!(report.failures()[0].channel.is_none());
        assert!(matches!(report.failures()[0].error, FvErr::Io(_)));
    }

    #[test]
    fn empty_source_halts() {
        let corpus = Corpus::new(Config::default()).unwrap();
        assert!(matches!(corpus.run(&MemorySource::new()), Err(FvErr::Config(_))));
    }
}
