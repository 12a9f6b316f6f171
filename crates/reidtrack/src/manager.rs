use crate::*;
use image::RgbImage;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// The per-frame view of a confirmed track handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub track_id: TrackId,
    pub state: TrackState,
    pub bbox: BoundingBox,
    pub center: (f32, f32),
    pub velocity: (f32, f32),
    pub class_id: Option<usize>,
    pub confidence: f32,
    pub age: usize,
    pub hits: usize,
    pub time_since_update: usize,
    pub identity_id: Option<IdentityId>,
    pub match_source: Option<MatchSource>,
    pub trajectory: Vec<(f32, f32)>,
    /// Zones the track is currently inside.
    pub zones: Vec<ZoneId>,
    pub metadata: HashMap<String, Value>,
}

impl From<&Track> for TrackSnapshot {
    fn from(track: &Track) -> Self {
        let bbox = track.bbox();
        let mut zones = track
            .metadata()
            .iter()
            .filter(|(_, value)| value.as_bool() == Some(true))
            .filter_map(|(key, _)| key.strip_prefix("zone:")?.parse::<ZoneId>().ok())
            .collect::<Vec<_>>();
        zones.sort_unstable();

        TrackSnapshot {
            track_id: track.track_id(),
            state: track.state(),
            bbox,
            center: bbox.center(),
            velocity: track.velocity(),
            class_id: track.class_id(),
            confidence: track.confidence(),
            age: track.age(),
            hits: track.hits(),
            time_since_update: track.time_since_update(),
            identity_id: track.identity_id(),
            match_source: track.match_source(),
            trajectory: track.trajectory().iter().copied().collect(),
            zones,
            metadata: track.metadata().clone(),
        }
    }
}

/// Counters of one track manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub frames: u64,
    pub tracks_created: usize,
    pub active_tracks: usize,
    pub confirmed_tracks: usize,
    pub rejected_detections: usize,
    pub identity_matches: u64,
    pub identity_registrations: u64,
    pub zone_events: usize,
}

/// Runs the whole per-frame pipeline for one source.
///
/// Each frame: predict, associate and apply the lifecycle, resolve identities every `identity_interval` frames,
/// extend trajectories and check zones.
#[derive(Debug)]
pub struct TrackManager {
    tracker: Tracker,
    gallery: Arc<IdentityGallery>,
    encoder: Arc<AppearanceEncoder>,
    identity_interval: usize,
    zones: Vec<Zone>,
    events: ZoneEventLog,
    frame_number: u64,
    rejected_detections: usize,
    identity_matches: u64,
    identity_registrations: u64,
}

impl Default for TrackManager {
    fn default() -> Self {
        TrackManager::new(&ManagerConfig::default())
    }
}

impl TrackManager {
    /// Returns a new TrackManager with a gallery of its own.
    pub fn new(config: &ManagerConfig) -> Self {
        let gallery = Arc::new(IdentityGallery::new(config.gallery.clone()));
        TrackManager::with_gallery(config, gallery)
    }

    /// Returns a new TrackManager resolving identities against a shared gallery.
    pub fn with_gallery(config: &ManagerConfig, gallery: Arc<IdentityGallery>) -> Self {
        let encoder = Arc::new(AppearanceEncoder::new(gallery.config().dimension));
        TrackManager {
            tracker: Tracker::new(&config.tracker),
            gallery,
            encoder,
            identity_interval: config.identity_interval.max(1),
            zones: config.zones.clone(),
            events: ZoneEventLog::default(),
            frame_number: 0,
            rejected_detections: 0,
            identity_matches: 0,
            identity_registrations: 0,
        }
    }

    /// Set the appearance encoder
    pub fn with_encoder(mut self, encoder: Arc<AppearanceEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn gallery(&self) -> &Arc<IdentityGallery> {
        &self.gallery
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn events(&self) -> &ZoneEventLog {
        &self.events
    }

    /// Number of frames processed so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Process one frame.
    ///
    /// # Parameters
    ///
    /// * `detections`: The detections of the frame.
    /// * `frame`: The frame image. Used for appearance extraction, tracking works without it.
    ///
    /// # Returns
    ///
    /// Snapshots of the confirmed tracks, including tracks that are lost but still addressable.
    pub fn update(
        &mut self,
        detections: &[Detection],
        frame: Option<&RgbImage>,
    ) -> Result<Vec<TrackSnapshot>> {
        self.frame_number += 1;
        let frame_number = self.frame_number;

        let detections = match frame {
            Some(frame) if self.tracker.strategy().uses_appearance() => {
                Cow::Owned(self.encode_detections(detections, frame))
            }
            _ => Cow::Borrowed(detections),
        };

        self.tracker.predict();
        let update = self.tracker.update(&detections)?;
        self.rejected_detections += update.rejected;

        if frame_number % self.identity_interval as u64 == 0 {
            self.resolve_identities(frame, frame_number);
        }

        let mut events = vec![];
        for track in self
            .tracker
            .tracks_mut()
            .iter_mut()
            .filter(|track| track.state() == TrackState::Confirmed)
        {
            track.push_trajectory(track.bbox().center());
            for zone in &self.zones {
                if let Some(event) = zone.observe(track, frame_number) {
                    events.push(event);
                }
            }
        }
        events.into_iter().for_each(|event| {
            debug!(
                track_id = event.track_id,
                zone_id = event.zone_id,
                kind = ?event.kind,
                "zone event"
            );
            self.events.push(event);
        });

        Ok(self
            .tracker
            .confirmed_tracks()
            .map(TrackSnapshot::from)
            .collect())
    }

    /// Fill in appearance vectors for detections that come without one.
    fn encode_detections(&self, detections: &[Detection], frame: &RgbImage) -> Vec<Detection> {
        let mut detections = detections.to_vec();
        let (indices, crops): (Vec<usize>, Vec<RgbImage>) = detections
            .iter()
            .enumerate()
            .filter(|(_, detection)| detection.feature().is_none())
            .filter_map(|(idx, detection)| {
                features::crop(frame, detection.bbox()).map(|crop| (idx, crop))
            })
            .unzip();

        indices
            .into_iter()
            .zip(self.encoder.encode_batch(&crops))
            .for_each(|(idx, encoded)| match encoded {
                Ok(vector) => *detections[idx].feature_mut() = Some(vector),
                Err(err) => warn!("skipping detection appearance: {}", err),
            });

        detections
    }

    /// Resolve the identity of every confirmed track observed in this frame.
    ///
    /// With a frame the appearance is extracted from the track crop, without one the latest detection vector is used.
    fn resolve_identities(&mut self, frame: Option<&RgbImage>, frame_number: u64) {
        let candidates = self
            .tracker
            .tracks()
            .iter()
            .enumerate()
            .filter(|(_, track)| track.state() == TrackState::Confirmed && track.time_since_update() == 0)
            .map(|(idx, track)| (idx, *track.detection_bbox()))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return;
        }

        let encoder = &self.encoder;
        let resolved = match frame {
            Some(frame) => candidates
                .par_iter()
                .filter_map(|(idx, bbox)| {
                    let crop = features::crop(frame, bbox)?;
                    match encoder.encode(&crop) {
                        Ok(vector) => {
                            let quality = features::quality_score(&crop);
                            Some((*idx, vector, quality, Some(crop)))
                        }
                        Err(err) => {
                            warn!("skipping identity update: {}", err);
                            None
                        }
                    }
                })
                .collect::<Vec<_>>(),
            None => candidates
                .iter()
                .filter_map(|(idx, _)| {
                    self.tracker.tracks()[*idx]
                        .feature()
                        .map(|vector| (*idx, vector.clone(), 0.0, None))
                })
                .collect(),
        };

        for (idx, vector, quality, crop) in resolved {
            if vector.dot(&vector) <= 0.0 {
                debug!(track_id = self.tracker.tracks()[idx].track_id(), "no appearance to resolve");
                continue;
            }
            let (identity_id, is_new) = self.gallery.match_or_register(
                &vector.to_vec(),
                crop.as_ref(),
                quality,
                frame_number,
            );
            if is_new {
                self.identity_registrations += 1;
            } else {
                self.identity_matches += 1;
            }

            let track = &mut self.tracker.tracks_mut()[idx];
            track.set_identity_id(identity_id);
            if frame.is_some() {
                track.set_feature(vector);
            }
        }
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            frames: self.frame_number,
            tracks_created: self.tracker.total_created(),
            active_tracks: self.tracker.tracks().len(),
            confirmed_tracks: self.tracker.confirmed_tracks().count(),
            rejected_detections: self.rejected_detections,
            identity_matches: self.identity_matches,
            identity_registrations: self.identity_registrations,
            zone_events: self.events.len(),
        }
    }
}

/// Aggregate counters over all sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MultiSourceStats {
    pub sources: BTreeMap<String, ManagerStats>,
    pub gallery: GalleryStats,
}

/// The input of one source for one frame.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub detections: Vec<Detection>,
    /// The frame image, used for appearance extraction when present.
    pub frame: Option<RgbImage>,
}

impl SourceBatch {
    pub fn new(detections: Vec<Detection>, frame: Option<RgbImage>) -> Self {
        SourceBatch { detections, frame }
    }
}

impl From<Vec<Detection>> for SourceBatch {
    fn from(detections: Vec<Detection>) -> Self {
        SourceBatch {
            detections,
            frame: None,
        }
    }
}

/// One track manager per source, all resolving identities against the same gallery.
///
/// Track ids are per source, identity ids are shared.
#[derive(Debug)]
pub struct MultiSourceTracker {
    config: ManagerConfig,
    gallery: Arc<IdentityGallery>,
    encoder: Arc<AppearanceEncoder>,
    sources: BTreeMap<String, TrackManager>,
}

impl MultiSourceTracker {
    pub fn new(config: ManagerConfig) -> Self {
        let gallery = Arc::new(IdentityGallery::new(config.gallery.clone()));
        let encoder = Arc::new(AppearanceEncoder::new(config.gallery.dimension));
        MultiSourceTracker {
            config,
            gallery,
            encoder,
            sources: BTreeMap::new(),
        }
    }

    /// Set the appearance encoder used by sources created from now on
    pub fn with_encoder(mut self, encoder: Arc<AppearanceEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn gallery(&self) -> &Arc<IdentityGallery> {
        &self.gallery
    }

    pub fn source(&self, source_id: &str) -> Option<&TrackManager> {
        self.sources.get(source_id)
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// Stop tracking a source. Its identities stay in the gallery.
    pub fn remove_source(&mut self, source_id: &str) -> Option<TrackManager> {
        self.sources.remove(source_id)
    }

    fn manager(&mut self, source_id: &str) -> &mut TrackManager {
        let config = &self.config;
        let gallery = &self.gallery;
        let encoder = &self.encoder;
        self.sources
            .entry(source_id.to_string())
            .or_insert_with(|| {
                debug!(source_id, "new source");
                TrackManager::with_gallery(config, Arc::clone(gallery))
                    .with_encoder(Arc::clone(encoder))
            })
    }

    /// Process one frame of one source.
    pub fn update(
        &mut self,
        source_id: &str,
        detections: &[Detection],
        frame: Option<&RgbImage>,
    ) -> Result<Vec<TrackSnapshot>> {
        self.manager(source_id).update(detections, frame)
    }

    /// Process one frame of several sources in parallel.
    ///
    /// Sources without a batch are left untouched.
    pub fn update_sources(
        &mut self,
        batches: &HashMap<String, SourceBatch>,
    ) -> Result<BTreeMap<String, Vec<TrackSnapshot>>> {
        batches.keys().for_each(|source_id| {
            self.manager(source_id);
        });

        self.sources
            .par_iter_mut()
            .filter_map(|(source_id, manager)| {
                batches.get(source_id).map(|batch| {
                    manager
                        .update(&batch.detections, batch.frame.as_ref())
                        .map(|snapshots| (source_id.clone(), snapshots))
                })
            })
            .collect()
    }

    pub fn stats(&self) -> MultiSourceStats {
        MultiSourceStats {
            sources: self
                .sources
                .iter()
                .map(|(source_id, manager)| (source_id.clone(), manager.stats()))
                .collect(),
            gallery: self.gallery.stats(),
        }
    }
}
