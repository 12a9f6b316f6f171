use crate::features::fit_dimension;
use crate::*;
use image::RgbImage;
use ndarray::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use tracing::{debug, info, warn};

/// Version written into every exported record set.
pub const GALLERY_FORMAT_VERSION: u32 = 1;

/// How a single vector standing for a whole identity is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representative {
    /// Mean of the stored vectors, re-normalised.
    Mean,
    /// The vector that came with the best quality score.
    BestQuality,
}

/// A search result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchHit {
    pub entry_id: EntryId,
    /// `None` for a vector stored without an identity.
    pub identity_id: Option<IdentityId>,
    pub similarity: f32,
}

/// The transport form of one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryRecord {
    pub identity_id: IdentityId,
    /// Stored vectors, oldest first.
    pub vectors: Vec<Vec<f32>>,
    pub best_score: f32,
    #[serde(default)]
    pub best_vector: Option<Vec<f32>>,
    pub first_seen: u64,
    pub last_seen: u64,
    pub appearance_count: u64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// A versioned export of a gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryRecordSet {
    pub version: u32,
    pub dimension: usize,
    pub identities: Vec<GalleryRecord>,
    /// Vectors stored without an identity, oldest first.
    #[serde(default)]
    pub unassigned: Vec<Vec<f32>>,
}

/// Aggregate counters of a gallery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GalleryStats {
    pub identities: usize,
    pub entries: usize,
    /// Entries that belong to no identity.
    pub unassigned: usize,
    /// `match_or_register` calls that resolved to an existing identity.
    pub matches: u64,
    /// `match_or_register` calls that created a new identity.
    pub registrations: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    identity_id: Option<IdentityId>,
    vector: Array1<f32>,
}

#[derive(Debug, Clone, Default)]
struct Identity {
    /// Ring of entry ids, oldest first.
    entries: VecDeque<EntryId>,
    best_score: f32,
    best_vector: Option<Array1<f32>>,
    best_crop: Option<RgbImage>,
    first_seen: u64,
    last_seen: u64,
    appearance_count: u64,
    metadata: HashMap<String, Value>,
}

impl Identity {
    fn refresh_best(&mut self, vector: &Array1<f32>, crop: Option<&RgbImage>, quality: f32) {
        if self.best_vector.is_none() || quality > self.best_score {
            self.best_score = quality;
            self.best_vector = Some(vector.clone());
            if let Some(crop) = crop {
                self.best_crop = Some(crop.clone());
            }
        }
    }
}

#[derive(Debug)]
struct GalleryState {
    entries: HashMap<EntryId, Entry>,
    identities: BTreeMap<IdentityId, Identity>,
    /// Ring of entry ids stored without an identity, oldest first.
    unassigned: VecDeque<EntryId>,
    next_entry_id: EntryId,
    next_identity_id: IdentityId,
    matches: u64,
    registrations: u64,
}

impl Default for GalleryState {
    fn default() -> Self {
        GalleryState {
            entries: HashMap::new(),
            identities: BTreeMap::new(),
            unassigned: VecDeque::new(),
            next_entry_id: 1,
            next_identity_id: 1,
            matches: 0,
            registrations: 0,
        }
    }
}

impl GalleryState {
    /// Store a vector and append it to the ring of its identity, or to the unassigned ring without one. The oldest
    /// entries beyond the ring capacity are evicted.
    fn insert(
        &mut self,
        vector: Array1<f32>,
        identity_id: Option<IdentityId>,
        config: &GalleryConfig,
    ) -> Result<EntryId> {
        let (ring, capacity) = match identity_id {
            Some(identity_id) => (
                &mut self
                    .identities
                    .get_mut(&identity_id)
                    .ok_or(Error::IdentityNotFound(identity_id))?
                    .entries,
                config.capacity,
            ),
            None => (&mut self.unassigned, config.unassigned_capacity),
        };

        let entry_id = self.next_entry_id;
        self.next_entry_id += 1;
        ring.push_back(entry_id);
        while ring.len() > capacity.max(1) {
            if let Some(evicted) = ring.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        self.entries.insert(
            entry_id,
            Entry {
                identity_id,
                vector,
            },
        );

        Ok(entry_id)
    }

    /// Allocate an id for a new identity holding `vector` as its only entry.
    fn register(&mut self, mut identity: Identity, vector: Array1<f32>) -> IdentityId {
        let identity_id = self.next_identity_id;
        self.next_identity_id += 1;
        let entry_id = self.next_entry_id;
        self.next_entry_id += 1;

        identity.entries.push_back(entry_id);
        self.entries.insert(
            entry_id,
            Entry {
                identity_id: Some(identity_id),
                vector,
            },
        );
        self.identities.insert(identity_id, identity);
        identity_id
    }

    fn remove_entry(&mut self, entry_id: EntryId) -> Result<()> {
        let entry = self
            .entries
            .remove(&entry_id)
            .ok_or(Error::EntryNotFound(entry_id))?;
        let ring = match entry.identity_id.and_then(|id| self.identities.get_mut(&id)) {
            Some(identity) => &mut identity.entries,
            None => &mut self.unassigned,
        };
        ring.retain(|id| *id != entry_id);
        Ok(())
    }

    fn search(
        &self,
        query: &Array1<f32>,
        top_k: usize,
        min_similarity: f32,
        identity_filter: Option<IdentityId>,
    ) -> Vec<SearchHit> {
        let mut hits = self
            .entries
            .iter()
            .filter(|(_, entry)| identity_filter.is_none() || entry.identity_id == identity_filter)
            .map(|(entry_id, entry)| SearchHit {
                entry_id: *entry_id,
                identity_id: entry.identity_id,
                similarity: entry.vector.dot(query),
            })
            .filter(|hit| hit.similarity >= min_similarity)
            .collect::<Vec<_>>();

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(a.entry_id.cmp(&b.entry_id))
        });
        hits.truncate(top_k);
        hits
    }

    fn record(&self, identity_id: IdentityId, identity: &Identity) -> GalleryRecord {
        GalleryRecord {
            identity_id,
            vectors: identity
                .entries
                .iter()
                .filter_map(|entry_id| self.entries.get(entry_id))
                .map(|entry| entry.vector.to_vec())
                .collect(),
            best_score: identity.best_score,
            best_vector: identity.best_vector.as_ref().map(|vector| vector.to_vec()),
            first_seen: identity.first_seen,
            last_seen: identity.last_seen,
            appearance_count: identity.appearance_count,
            metadata: identity.metadata.clone(),
        }
    }

    fn remove_identity(&mut self, identity_id: IdentityId) -> Option<Identity> {
        let identity = self.identities.remove(&identity_id)?;
        identity.entries.iter().for_each(|entry_id| {
            self.entries.remove(entry_id);
        });
        Some(identity)
    }
}

/// The re-identification store.
///
/// Every operation takes the single gallery lock, so identity decisions are linearizable across the sources sharing
/// one gallery.
#[derive(Debug)]
pub struct IdentityGallery {
    config: GalleryConfig,
    state: Mutex<GalleryState>,
}

impl Default for IdentityGallery {
    fn default() -> Self {
        IdentityGallery::new(GalleryConfig::default())
    }
}

impl IdentityGallery {
    /// Returns a new empty IdentityGallery
    pub fn new(config: GalleryConfig) -> Self {
        IdentityGallery {
            config,
            state: Mutex::new(GalleryState::default()),
        }
    }

    pub fn config(&self) -> &GalleryConfig {
        &self.config
    }

    /// Bring a vector to the configured dimension and unit length.
    fn normalize(&self, vector: &[f32]) -> Array1<f32> {
        fit_dimension(vector, self.config.dimension)
    }

    /// Store a vector, optionally appending it to an existing identity.
    ///
    /// A vector without an identity is searchable and kept in a ring of `unassigned_capacity` entries. It never
    /// resolves a `match_or_register` call.
    ///
    /// # Parameters
    ///
    /// * `vector`: Padded or truncated to the configured dimension and normalised.
    /// * `identity_id`: The identity the vector belongs to.
    /// * `quality`: Replaces the identity's best reference when it improves on it.
    pub fn add(
        &self,
        vector: &[f32],
        identity_id: Option<IdentityId>,
        quality: f32,
    ) -> Result<EntryId> {
        let vector = self.normalize(vector);
        let mut state = self.state.lock();
        let entry_id = state.insert(vector.clone(), identity_id, &self.config)?;
        if let Some(identity) = identity_id.and_then(|id| state.identities.get_mut(&id)) {
            identity.refresh_best(&vector, None, quality);
        }
        Ok(entry_id)
    }

    /// Remove a single stored vector.
    pub fn remove_entry(&self, entry_id: EntryId) -> Result<()> {
        self.state.lock().remove_entry(entry_id)
    }

    /// Cosine similarity search over the stored vectors, best first.
    ///
    /// # Parameters
    ///
    /// * `query`: The query vector, normalised like stored vectors.
    /// * `top_k`: Maximum number of hits.
    /// * `min_similarity`: Hits below this similarity are dropped.
    /// * `identity_filter`: Restrict the search to one identity.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_similarity: f32,
        identity_filter: Option<IdentityId>,
    ) -> Vec<SearchHit> {
        let query = self.normalize(query);
        self.state
            .lock()
            .search(&query, top_k, min_similarity, identity_filter)
    }

    /// Resolve a vector to an identity, registering a new one when nothing is similar enough.
    ///
    /// Returns the identity and whether it was newly created. A match adds the vector to the identity,
    /// increments its appearance count by one and refreshes its best reference if `quality` improves on it.
    pub fn match_or_register(
        &self,
        vector: &[f32],
        crop: Option<&RgbImage>,
        quality: f32,
        frame_number: u64,
    ) -> (IdentityId, bool) {
        let vector = self.normalize(vector);
        let mut state = self.state.lock();

        let best = state
            .search(&vector, usize::MAX, self.config.similarity_threshold, None)
            .into_iter()
            .find(|hit| hit.identity_id.is_some());

        if let Some(SearchHit {
            identity_id: Some(identity_id),
            similarity,
            ..
        }) = best
        {
            match state.insert(vector.clone(), Some(identity_id), &self.config) {
                Ok(_) => {
                    if let Some(identity) = state.identities.get_mut(&identity_id) {
                        identity.appearance_count += 1;
                        identity.first_seen = identity.first_seen.min(frame_number);
                        identity.last_seen = identity.last_seen.max(frame_number);
                        identity.refresh_best(&vector, crop, quality);
                    }
                    state.matches += 1;
                    debug!(identity_id, similarity, "matched identity");
                    return (identity_id, false);
                }
                Err(err) => warn!(identity_id, "dangling gallery entry: {}", err),
            }
        }

        let mut identity = Identity {
            first_seen: frame_number,
            last_seen: frame_number,
            appearance_count: 1,
            ..Default::default()
        };
        identity.refresh_best(&vector, crop, quality);
        let identity_id = state.register(identity, vector);
        state.registrations += 1;
        info!(identity_id, frame_number, "registered new identity");

        (identity_id, true)
    }

    /// Merge `source_id` into `target_id`.
    ///
    /// Vectors are unioned in insertion order and bounded by the ring capacity, the better reference is kept,
    /// counters are summed and the seen range is widened. Metadata keys already on the target win.
    pub fn merge(&self, target_id: IdentityId, source_id: IdentityId) -> Result<()> {
        if target_id == source_id {
            return Err(Error::SelfMerge(target_id));
        }

        let mut state = self.state.lock();
        if !state.identities.contains_key(&target_id) {
            return Err(Error::IdentityNotFound(target_id));
        }
        let source = state
            .identities
            .remove(&source_id)
            .ok_or(Error::IdentityNotFound(source_id))?;

        source.entries.iter().for_each(|entry_id| {
            if let Some(entry) = state.entries.get_mut(entry_id) {
                entry.identity_id = Some(target_id);
            }
        });

        let capacity = self.config.capacity.max(1);
        let mut evicted = vec![];
        if let Some(target) = state.identities.get_mut(&target_id) {
            let mut entries = target
                .entries
                .iter()
                .chain(source.entries.iter())
                .copied()
                .collect::<Vec<_>>();
            // entry ids are allocated in insertion order
            entries.sort_unstable();
            let overflow = entries.len().saturating_sub(capacity);
            evicted.extend(entries.drain(..overflow));
            target.entries = entries.into();

            if source.best_vector.is_some()
                && (target.best_vector.is_none() || source.best_score > target.best_score)
            {
                target.best_score = source.best_score;
                target.best_vector = source.best_vector;
                target.best_crop = source.best_crop;
            }
            target.appearance_count += source.appearance_count;
            target.first_seen = target.first_seen.min(source.first_seen);
            target.last_seen = target.last_seen.max(source.last_seen);
            source.metadata.into_iter().for_each(|(key, value)| {
                target.metadata.entry(key).or_insert(value);
            });
        }
        evicted.iter().for_each(|entry_id| {
            state.entries.remove(entry_id);
        });

        info!(target_id, source_id, "merged identities");
        Ok(())
    }

    /// Remove an identity and its vectors.
    pub fn delete(&self, identity_id: IdentityId) -> Result<()> {
        self.state
            .lock()
            .remove_identity(identity_id)
            .map(|_| ())
            .ok_or(Error::IdentityNotFound(identity_id))
    }

    /// Return a snapshot of an identity.
    pub fn identity(&self, identity_id: IdentityId) -> Result<GalleryRecord> {
        let state = self.state.lock();
        state
            .identities
            .get(&identity_id)
            .map(|identity| state.record(identity_id, identity))
            .ok_or(Error::IdentityNotFound(identity_id))
    }

    /// Return the best quality crop of an identity, if one was supplied.
    pub fn best_crop(&self, identity_id: IdentityId) -> Result<Option<RgbImage>> {
        self.state
            .lock()
            .identities
            .get(&identity_id)
            .map(|identity| identity.best_crop.clone())
            .ok_or(Error::IdentityNotFound(identity_id))
    }

    /// Set a metadata value on an identity.
    pub fn set_metadata(&self, identity_id: IdentityId, key: &str, value: Value) -> Result<()> {
        self.state
            .lock()
            .identities
            .get_mut(&identity_id)
            .map(|identity| {
                identity.metadata.insert(key.to_string(), value);
            })
            .ok_or(Error::IdentityNotFound(identity_id))
    }

    /// Compute a single unit vector standing for an identity.
    pub fn representative(
        &self,
        identity_id: IdentityId,
        representative: Representative,
    ) -> Result<Array1<f32>> {
        let state = self.state.lock();
        let identity = state
            .identities
            .get(&identity_id)
            .ok_or(Error::IdentityNotFound(identity_id))?;

        let vectors = identity
            .entries
            .iter()
            .filter_map(|entry_id| state.entries.get(entry_id))
            .map(|entry| &entry.vector);

        let vector = match representative {
            Representative::BestQuality => identity
                .best_vector
                .clone()
                .or_else(|| vectors.last().cloned()),
            Representative::Mean => {
                let mut sum = Array1::<f32>::zeros(self.config.dimension);
                let mut count = 0;
                vectors.for_each(|vector| {
                    sum += vector;
                    count += 1;
                });
                (count > 0).then_some(sum)
            }
        };

        let vector = vector.unwrap_or_else(|| Array1::zeros(self.config.dimension));
        Ok(fit_dimension(&vector.to_vec(), self.config.dimension))
    }

    /// Return the identifiers of all identities in ascending order.
    pub fn identity_ids(&self) -> Vec<IdentityId> {
        self.state.lock().identities.keys().copied().collect()
    }

    /// Return the number of identities.
    pub fn len(&self) -> usize {
        self.state.lock().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> GalleryStats {
        let state = self.state.lock();
        GalleryStats {
            identities: state.identities.len(),
            entries: state.entries.len(),
            unassigned: state.unassigned.len(),
            matches: state.matches,
            registrations: state.registrations,
        }
    }

    /// Export every identity.
    pub fn export(&self) -> GalleryRecordSet {
        let state = self.state.lock();
        GalleryRecordSet {
            version: GALLERY_FORMAT_VERSION,
            dimension: self.config.dimension,
            identities: state
                .identities
                .iter()
                .map(|(identity_id, identity)| state.record(*identity_id, identity))
                .collect(),
            unassigned: state
                .unassigned
                .iter()
                .filter_map(|entry_id| state.entries.get(entry_id))
                .map(|entry| entry.vector.to_vec())
                .collect(),
        }
    }

    /// Import identities, replacing any identity with the same id, and append the unassigned vectors. Returns the
    /// number of identities imported.
    ///
    /// Vectors of the configured dimension that are already unit length are stored as is, anything else is
    /// padded or truncated and normalised.
    pub fn import(&self, records: GalleryRecordSet) -> Result<usize> {
        if records.version != GALLERY_FORMAT_VERSION {
            return Err(Error::UnsupportedVersion {
                found: records.version,
                expected: GALLERY_FORMAT_VERSION,
            });
        }

        let dimension = self.config.dimension;
        let restore = |values: &[f32]| -> Array1<f32> {
            let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
            if values.len() == dimension && (norm - 1.0).abs() < 1e-4 {
                Array1::from_vec(values.to_vec())
            } else {
                fit_dimension(values, dimension)
            }
        };

        let mut state = self.state.lock();
        let count = records.identities.len();
        for record in records.identities {
            state.remove_identity(record.identity_id);
            state.identities.insert(
                record.identity_id,
                Identity {
                    entries: VecDeque::new(),
                    best_score: record.best_score,
                    best_vector: record.best_vector.as_deref().map(restore),
                    best_crop: None,
                    first_seen: record.first_seen,
                    last_seen: record.last_seen,
                    appearance_count: record.appearance_count,
                    metadata: record.metadata,
                },
            );
            for vector in &record.vectors {
                state.insert(restore(vector), Some(record.identity_id), &self.config)?;
            }
            state.next_identity_id = state.next_identity_id.max(record.identity_id + 1);
        }
        for vector in &records.unassigned {
            state.insert(restore(vector), None, &self.config)?;
        }

        info!(identities = count, unassigned = records.unassigned.len(), "imported gallery");
        Ok(count)
    }

    /// Export the gallery to a JSON file.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &self.export())?;
        Ok(())
    }

    /// Import a gallery from a JSON file.
    pub fn load_json<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let file = std::fs::File::open(path)?;
        let records: GalleryRecordSet = serde_json::from_reader(std::io::BufReader::new(file))?;
        self.import(records)
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    use anyhow::Result;
    use assert_approx_eq::assert_approx_eq;
    use std::sync::Arc;

    fn gallery(capacity: usize) -> IdentityGallery {
        IdentityGallery::new(GalleryConfig {
            similarity_threshold: 0.9,
            capacity,
            unassigned_capacity: 2,
            dimension: 4,
        })
    }

    fn basis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; 4];
        v[i] = 1.0;
        v
    }

    #[test]
    fn add_requires_known_identity() -> Result<()> {
        let gallery = gallery(3);
        assert!(matches!(
            gallery.add(&basis(0), Some(7), 0.5),
            Err(Error::IdentityNotFound(7))
        ));
        assert_eq!(gallery.stats().entries, 0);

        let (id, _) = gallery.match_or_register(&basis(1), None, 0.1, 1);
        gallery.add(&basis(0), Some(id), 0.5)?;
        assert_eq!(gallery.stats().entries, 2);
        assert_eq!(gallery.identity(id)?.vectors.len(), 2);
        assert_approx_eq!(gallery.identity(id)?.best_score, 0.5);
        Ok(())
    }

    #[test]
    fn unassigned_vectors_are_bounded() -> Result<()> {
        let gallery = gallery(3);
        let first = gallery.add(&basis(0), None, 0.5)?;
        for i in 1..4 {
            gallery.add(&basis(i), None, 0.5)?;
        }

        // only the two newest are kept
        let stats = gallery.stats();
        assert_eq!((stats.entries, stats.unassigned, stats.identities), (2, 2, 0));
        assert!(gallery.search(&basis(0), 10, 0.5, None).is_empty());
        let hits = gallery.search(&basis(3), 10, 0.5, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].identity_id, None);
        assert!(matches!(
            gallery.remove_entry(first),
            Err(Error::EntryNotFound(id)) if id == first
        ));

        // an unassigned vector never resolves an identity
        let (id, is_new) = gallery.match_or_register(&basis(3), None, 0.5, 1);
        assert!(is_new);
        assert_eq!(gallery.identity(id)?.vectors, vec![basis(3)]);

        gallery.remove_entry(hits[0].entry_id)?;
        assert_eq!(gallery.stats().unassigned, 1);
        assert_eq!(gallery.stats().entries, 2);
        Ok(())
    }

    #[test]
    fn remove_entry_from_identity() -> Result<()> {
        let gallery = gallery(3);
        let (id, _) = gallery.match_or_register(&basis(0), None, 0.1, 1);
        let entry = gallery.add(&basis(1), Some(id), 0.1)?;

        gallery.remove_entry(entry)?;
        assert_eq!(gallery.identity(id)?.vectors, vec![basis(0)]);
        assert_eq!(gallery.stats().entries, 1);
        Ok(())
    }

    #[test]
    fn registration_stores_one_entry() -> Result<()> {
        let gallery = gallery(3);
        let (a, is_new) = gallery.match_or_register(&basis(0), None, 0.2, 1);
        assert!(is_new);
        let (b, is_new) = gallery.match_or_register(&basis(1), None, 0.2, 1);
        assert!(is_new);

        assert_eq!(gallery.stats().entries, 2);
        assert_eq!(gallery.identity(a)?.vectors, vec![basis(0)]);
        assert_eq!(gallery.identity(b)?.vectors, vec![basis(1)]);
        assert_eq!(
            gallery.search(&basis(1), 1, 0.9, None)[0].identity_id,
            Some(b)
        );

        // entry ids keep increasing across registrations and matches
        gallery.match_or_register(&basis(0), None, 0.2, 2);
        let entries = gallery
            .search(&basis(0), 10, 0.99, Some(a))
            .iter()
            .map(|hit| hit.entry_id)
            .collect::<Vec<_>>();
        assert_eq!(entries, vec![1, 3]);
        Ok(())
    }

    #[test]
    fn ring_evicts_oldest() -> Result<()> {
        let gallery = gallery(3);
        let (id, _) = gallery.match_or_register(&[1.0, 0.0, 0.0, 0.0], None, 0.1, 1);
        for i in 1..5 {
            gallery.add(&[1.0, i as f32 * 0.01, 0.0, 0.0], Some(id), 0.1)?;
        }

        let record = gallery.identity(id)?;
        assert_eq!(record.vectors.len(), 3);
        // the first two vectors are gone
        assert!(record.vectors.iter().all(|v| v[1] > 0.015));
        assert_eq!(gallery.stats().entries, 3);
        Ok(())
    }

    #[test]
    fn search_is_sorted_and_filtered() -> Result<()> {
        let gallery = gallery(10);
        let (a, _) = gallery.match_or_register(&[1.0, 0.0, 0.0, 0.0], None, 0.5, 1);
        let (b, _) = gallery.match_or_register(&[0.0, 1.0, 0.0, 0.0], None, 0.5, 1);
        gallery.add(&[1.0, 1.0, 0.0, 0.0], Some(b), 0.5)?;

        let hits = gallery.search(&[1.0, 0.2, 0.0, 0.0], 10, 0.0, None);
        assert_eq!(hits.len(), 3);
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        assert_eq!(hits[0].identity_id, Some(a));

        let filtered = gallery.search(&[1.0, 0.2, 0.0, 0.0], 10, 0.0, Some(b));
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|hit| hit.identity_id == Some(b)));

        let strict = gallery.search(&[1.0, 0.2, 0.0, 0.0], 10, 0.95, None);
        assert_eq!(strict.len(), 1);

        let top = gallery.search(&[1.0, 0.2, 0.0, 0.0], 1, 0.0, None);
        assert_eq!(top.len(), 1);
        Ok(())
    }

    #[test]
    fn match_or_register_is_idempotent() -> Result<()> {
        let gallery = gallery(10);
        let vector = [0.3, 0.4, 0.5, 0.1];

        let (id, is_new) = gallery.match_or_register(&vector, None, 0.5, 1);
        assert!(is_new);
        assert_eq!(gallery.identity(id)?.appearance_count, 1);

        let (again, is_new) = gallery.match_or_register(&vector, None, 0.4, 2);
        assert!(!is_new);
        assert_eq!(again, id);
        assert_eq!(gallery.identity(id)?.appearance_count, 2);

        let (again, _) = gallery.match_or_register(&vector, None, 0.4, 3);
        assert_eq!(again, id);
        let record = gallery.identity(id)?;
        assert_eq!(record.appearance_count, 3);
        assert_eq!((record.first_seen, record.last_seen), (1, 3));
        assert_approx_eq!(record.best_score, 0.5);

        let (other, is_new) = gallery.match_or_register(&basis(3), None, 0.5, 4);
        assert!(is_new);
        assert_ne!(other, id);

        let stats = gallery.stats();
        assert_eq!(stats.matches, 2);
        assert_eq!(stats.registrations, 2);
        assert_eq!(stats.identities, 2);
        Ok(())
    }

    #[test]
    fn best_reference_improves() -> Result<()> {
        let gallery = gallery(10);
        let crop = image::RgbImage::new(4, 4);
        let (id, _) = gallery.match_or_register(&[1.0, 0.0, 0.0, 0.0], None, 0.2, 1);
        assert!(gallery.best_crop(id)?.is_none());

        gallery.match_or_register(&[1.0, 0.05, 0.0, 0.0], Some(&crop), 0.8, 2);
        assert_approx_eq!(gallery.identity(id)?.best_score, 0.8);
        assert!(gallery.best_crop(id)?.is_some());

        let best = gallery.representative(id, Representative::BestQuality)?;
        assert!(best[1] > 0.0);
        Ok(())
    }

    #[test]
    fn mismatched_dimension_is_padded() -> Result<()> {
        let gallery = gallery(10);
        let (id, _) = gallery.match_or_register(&[3.0, 4.0], None, 0.5, 1);
        let record = gallery.identity(id)?;
        assert_eq!(record.vectors[0], vec![0.6, 0.8, 0.0, 0.0]);

        // a longer vector with the same prefix resolves to the same identity
        let (same, is_new) = gallery.match_or_register(&[3.0, 4.0, 0.0, 0.0, 9.0], None, 0.5, 2);
        assert_eq!(same, id);
        assert!(!is_new);
        Ok(())
    }

    #[test]
    fn merge() -> Result<()> {
        let gallery = gallery(3);
        let (a, _) = gallery.match_or_register(&basis(0), None, 0.3, 5);
        gallery.match_or_register(&basis(0), None, 0.3, 6);
        let (b, _) = gallery.match_or_register(&basis(1), None, 0.9, 2);
        gallery.match_or_register(&basis(1), None, 0.3, 9);
        gallery.set_metadata(a, "name", serde_json::json!("a"))?;
        gallery.set_metadata(b, "name", serde_json::json!("b"))?;
        gallery.set_metadata(b, "zone", serde_json::json!(1))?;

        assert!(matches!(gallery.merge(a, a), Err(Error::SelfMerge(_))));
        assert!(matches!(gallery.merge(a, 99), Err(Error::IdentityNotFound(99))));

        gallery.merge(a, b)?;

        assert!(matches!(gallery.identity(b), Err(Error::IdentityNotFound(_))));
        let record = gallery.identity(a)?;
        assert_eq!(record.appearance_count, 4);
        assert_eq!((record.first_seen, record.last_seen), (2, 9));
        assert_approx_eq!(record.best_score, 0.9);
        // bounded by capacity, oldest dropped
        assert_eq!(record.vectors.len(), 3);
        assert_eq!(record.vectors[0], basis(0));
        assert_eq!(record.vectors[2], basis(1));
        assert_eq!(record.metadata["name"], serde_json::json!("a"));
        assert_eq!(record.metadata["zone"], serde_json::json!(1));
        assert_eq!(gallery.stats().entries, 3);

        // vectors of the source now resolve to the target
        let (resolved, is_new) = gallery.match_or_register(&basis(1), None, 0.1, 10);
        assert_eq!(resolved, a);
        assert!(!is_new);
        Ok(())
    }

    #[test]
    fn delete() -> Result<()> {
        let gallery = gallery(3);
        let (id, _) = gallery.match_or_register(&basis(0), None, 0.3, 1);
        gallery.delete(id)?;
        assert!(gallery.is_empty());
        assert_eq!(gallery.stats().entries, 0);
        assert!(matches!(gallery.delete(id), Err(Error::IdentityNotFound(_))));

        // ids are never reused
        let (next, _) = gallery.match_or_register(&basis(0), None, 0.3, 2);
        assert!(next > id);
        Ok(())
    }

    #[test]
    fn representative_mean() -> Result<()> {
        let gallery = gallery(10);
        let (id, _) = gallery.match_or_register(&[1.0, 0.0, 0.0, 0.0], None, 0.3, 1);
        gallery.add(&[0.0, 1.0, 0.0, 0.0], Some(id), 0.1)?;

        let mean = gallery.representative(id, Representative::Mean)?;
        assert_approx_eq!(mean[0], std::f32::consts::FRAC_1_SQRT_2, 1e-6);
        assert_approx_eq!(mean[1], std::f32::consts::FRAC_1_SQRT_2, 1e-6);

        assert!(gallery.representative(42, Representative::Mean).is_err());
        Ok(())
    }

    #[test]
    fn export_import_round_trip() -> Result<()> {
        let source = gallery(5);
        let (a, _) = source.match_or_register(&[0.1, 0.2, 0.3, 0.4], None, 0.7, 3);
        source.match_or_register(&[0.1, 0.2, 0.3, 0.41], None, 0.2, 4);
        let (b, _) = source.match_or_register(&[-0.5, 0.1, 0.0, 0.2], None, 0.4, 8);
        source.set_metadata(b, "camera", serde_json::json!("north"))?;
        source.add(&basis(2), None, 0.0)?;

        let json = serde_json::to_string(&source.export())?;
        let records: GalleryRecordSet = serde_json::from_str(&json)?;

        let target = gallery(5);
        assert_eq!(target.import(records)?, 2);
        assert_eq!(target.export(), source.export());
        assert_eq!(target.identity_ids(), vec![a, b]);
        assert_eq!(target.stats().unassigned, 1);

        // new identities continue after the imported ids
        let (c, _) = target.match_or_register(&basis(2), None, 0.1, 9);
        assert!(c > b);
        Ok(())
    }

    #[test]
    fn import_rejects_unknown_version() {
        let gallery = gallery(5);
        let records = GalleryRecordSet {
            version: 99,
            dimension: 4,
            identities: vec![],
            unassigned: vec![],
        };
        assert!(matches!(
            gallery.import(records),
            Err(Error::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn save_and_load_json() -> Result<()> {
        let path = std::env::temp_dir().join(format!("gallery-{}.json", uuid::Uuid::new_v4()));
        let source = gallery(5);
        source.match_or_register(&[0.1, 0.2, 0.3, 0.4], None, 0.7, 3);
        source.save_json(&path)?;

        let target = gallery(5);
        assert_eq!(target.load_json(&path)?, 1);
        assert_eq!(target.export(), source.export());

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn shared_between_threads() {
        let gallery = Arc::new(gallery(10));

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let gallery = Arc::clone(&gallery);
                scope.spawn(move || {
                    for frame in 0..25 {
                        gallery.match_or_register(&[0.5, 0.5, 0.5, 0.5], None, 0.5, worker * 100 + frame);
                    }
                });
            }
        });

        assert_eq!(gallery.len(), 1);
        let id = gallery.identity_ids()[0];
        assert_eq!(gallery.identity(id).map(|r| r.appearance_count).ok(), Some(100));
        assert_eq!(gallery.stats().registrations, 1);
        assert_eq!(gallery.stats().matches, 99);
    }
}
