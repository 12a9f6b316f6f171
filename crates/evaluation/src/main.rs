mod mot;

use anyhow::Result;
use clap::Parser;
use image::{Rgb, RgbImage};
use imageproc::rect::Rect;
use itertools::Itertools;
use rayon::prelude::*;
use reidtrack::{
    AppearanceEncoder, ManagerConfig, MatchSource, OnnxExtractor, TrackManager, TrackSnapshot,
};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static REID_WIDTH: u32 = 128;
static REID_HEIGHT: u32 = 256;

/// Run the tracker over a MOT challenge sequence
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The detection file (MOT format)
    #[arg(short, long)]
    detections: PathBuf,

    /// Glob of the frame images, sorted by name, the first image is frame 1
    #[arg(short, long)]
    frames: Option<String>,

    /// JSON manager configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Re-identification model taking a 1x3x256x128 input
    #[arg(short, long)]
    reid_model: Option<PathBuf>,

    /// The tracker output file (MOT format)
    #[arg(short, long, default_value = "tracks.txt")]
    output: PathBuf,

    /// Export the identity gallery to this JSON file
    #[arg(short, long)]
    gallery: Option<PathBuf>,

    /// Write the zone events to this JSON file
    #[arg(short, long)]
    events: Option<PathBuf>,

    /// Write debug images to this directory
    #[arg(short, long)]
    write_images: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ManagerConfig::from_json_file(path)?,
        None => ManagerConfig::default(),
    };
    let mut manager = TrackManager::new(&config);
    if let Some(model) = &args.reid_model {
        let extractor = OnnxExtractor::from_path(model, REID_WIDTH, REID_HEIGHT)?;
        manager = manager.with_encoder(Arc::new(
            AppearanceEncoder::new(config.gallery.dimension).with_extractor(Box::new(extractor)),
        ));
    }

    let detections = mot::read_detections(File::open(&args.detections)?)?;
    let frame_paths = match &args.frames {
        Some(pattern) => glob::glob(pattern)?
            .filter_map(|path| path.ok())
            .sorted()
            .collect::<Vec<_>>(),
        None => vec![],
    };
    let last_frame = detections
        .keys()
        .copied()
        .max()
        .unwrap_or(0)
        .max(frame_paths.len() as u32);
    info!(
        frames = last_frame,
        images = frame_paths.len(),
        strategy = ?config.tracker.strategy,
        "starting sequence"
    );

    if let Some(dir) = &args.write_images {
        std::fs::create_dir_all(dir)?;
    }

    let mut writer = mot::MotWriter::new(File::create(&args.output)?);
    let no_detections = vec![];

    (1..=last_frame)
        .chunks(rayon::current_num_threads())
        .into_iter()
        .try_for_each(|chunk| -> Result<()> {
            let frame_numbers = chunk.collect::<Vec<_>>();

            // decode in parallel, track in order
            let images = frame_numbers
                .par_iter()
                .map(|frame_number| {
                    frame_paths
                        .get(*frame_number as usize - 1)
                        .map(|path| read_image(path))
                        .transpose()
                })
                .collect::<Result<Vec<_>>>()?;

            for (frame_number, image) in frame_numbers.into_iter().zip(images) {
                let frame_detections = detections.get(&frame_number).unwrap_or(&no_detections);
                let snapshots = manager.update(frame_detections, image.as_ref())?;
                writer.write_frame(frame_number, &snapshots)?;

                if let (Some(dir), Some(image)) = (&args.write_images, image) {
                    write_image(dir, frame_number, image, &snapshots)?;
                }
            }

            Ok(())
        })?;
    writer.flush()?;

    let stats = manager.stats();
    info!(
        tracks = stats.tracks_created,
        identities = manager.gallery().len(),
        zone_events = stats.zone_events,
        rejected = stats.rejected_detections,
        "finished sequence"
    );

    if let Some(path) = &args.gallery {
        manager.gallery().save_json(path)?;
    }
    if let Some(path) = &args.events {
        serde_json::to_writer_pretty(File::create(path)?, manager.events())?;
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<RgbImage> {
    Ok(image::io::Reader::open(path)?.decode()?.to_rgb8())
}

fn write_image(
    dir: &Path,
    frame_number: u32,
    mut frame: RgbImage,
    snapshots: &[TrackSnapshot],
) -> Result<()> {
    snapshots.iter().for_each(|snapshot| {
        let color = if snapshot.time_since_update > 0 {
            Rgb([128u8, 128u8, 128u8])
        } else {
            match snapshot.match_source {
                Some(MatchSource::Appearance { .. }) => Rgb([255u8, 0u8, 0u8]),
                Some(MatchSource::IoU { .. }) => Rgb([0u8, 0u8, 255u8]),
                None => Rgb([255u8, 255u8, 255u8]),
            }
        };

        imageproc::drawing::draw_hollow_rect_mut(
            &mut frame,
            Rect::at(snapshot.bbox.x() as i32, snapshot.bbox.y() as i32).of_size(
                (snapshot.bbox.width() as u32).max(1),
                (snapshot.bbox.height() as u32).max(1),
            ),
            color,
        );
    });

    let file_name = dir.join(format!("{:06}.jpg", frame_number));
    Ok(frame.save(file_name)?)
}
