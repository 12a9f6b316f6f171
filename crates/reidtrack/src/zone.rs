use crate::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ZoneId = u32;

/// A polygon region of the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    id: ZoneId,
    name: String,
    /// Vertices in drawing order, the polygon is closed implicitly.
    vertices: Vec<(f32, f32)>,
}

impl Zone {
    pub fn new(id: ZoneId, name: impl Into<String>, vertices: Vec<(f32, f32)>) -> Zone {
        Zone {
            id,
            name: name.into(),
            vertices,
        }
    }

    pub fn id(&self) -> ZoneId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices(&self) -> &[(f32, f32)] {
        &self.vertices
    }

    /// The track metadata key holding the inside flag for this zone.
    pub fn metadata_key(&self) -> String {
        format!("zone:{}", self.id)
    }

    /// Point in polygon by ray casting. Polygons with fewer than three vertices contain nothing.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        if self.vertices.len() < 3 {
            return false;
        }

        let mut inside = false;
        let mut j = self.vertices.len() - 1;
        for i in 0..self.vertices.len() {
            let (xi, yi) = self.vertices[i];
            let (xj, yj) = self.vertices[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Test the track center against the zone and flip the inside flag in the track metadata.
    ///
    /// Returns an event only when the flag changes. A track first seen outside produces nothing.
    pub fn observe(&self, track: &mut Track, frame_number: u64) -> Option<ZoneEvent> {
        let (x, y) = track.bbox().center();
        let inside = self.contains(x, y);
        let key = self.metadata_key();
        let was_inside = track
            .metadata()
            .get(&key)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if inside == was_inside {
            return None;
        }

        track.metadata_mut().insert(key, Value::Bool(inside));
        Some(ZoneEvent {
            kind: if inside {
                ZoneEventKind::Enter
            } else {
                ZoneEventKind::Exit
            },
            track_id: track.track_id(),
            zone_id: self.id,
            frame_number,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneEventKind {
    Enter,
    Exit,
}

/// A zone transition of one track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneEvent {
    #[serde(rename = "type")]
    pub kind: ZoneEventKind,
    pub track_id: TrackId,
    pub zone_id: ZoneId,
    pub frame_number: u64,
}

/// Append-only log of zone transitions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ZoneEventLog {
    events: Vec<ZoneEvent>,
}

impl ZoneEventLog {
    pub fn push(&mut self, event: ZoneEvent) {
        self.events.push(event);
    }

    /// All events in the order they were recorded
    pub fn events(&self) -> &[ZoneEvent] {
        &self.events
    }

    /// Events matching the given zone and kind, either filter may be omitted
    pub fn query(
        &self,
        zone_id: Option<ZoneId>,
        kind: Option<ZoneEventKind>,
    ) -> impl Iterator<Item = &ZoneEvent> {
        self.events.iter().filter(move |event| {
            zone_id.map_or(true, |zone_id| event.zone_id == zone_id)
                && kind.map_or(true, |kind| event.kind == kind)
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    use anyhow::Result;

    fn square() -> Zone {
        Zone::new(
            3,
            "pen",
            vec![(100.0, 100.0), (200.0, 100.0), (200.0, 200.0), (100.0, 200.0)],
        )
    }

    #[test]
    fn contains() {
        let zone = square();
        assert!(zone.contains(150.0, 150.0));
        assert!(!zone.contains(50.0, 150.0));
        assert!(!zone.contains(150.0, 250.0));

        // concave polygon
        let l_shape = Zone::new(
            1,
            "l",
            vec![
                (0.0, 0.0),
                (10.0, 0.0),
                (10.0, 4.0),
                (4.0, 4.0),
                (4.0, 10.0),
                (0.0, 10.0),
            ],
        );
        assert!(l_shape.contains(2.0, 8.0));
        assert!(!l_shape.contains(8.0, 8.0));

        assert!(!Zone::new(2, "line", vec![(0.0, 0.0), (10.0, 10.0)]).contains(5.0, 5.0));
    }

    #[test]
    fn observe_emits_on_transition_only() -> Result<()> {
        let kf = KalmanFilter::new();
        let zone = square();
        let detection = |x: f32| Detection::new(None, BoundingBox::new(x, 140.0, 20.0, 20.0), 0.9, None, None);
        let mut track = Track::new(&kf, 9, &detection(0.0), 1, 30);
        let mut log = ZoneEventLog::default();

        for (frame, x) in [0.0, 60.0, 120.0, 140.0, 160.0, 220.0, 260.0].iter().enumerate() {
            // a freshly initiated filter sits exactly on the measurement, the flags carry over
            let mut moved = Track::new(&kf, 9, &detection(*x), 1, 30);
            *moved.metadata_mut() = track.metadata().clone();
            track = moved;
            if let Some(event) = zone.observe(&mut track, frame as u64) {
                log.push(event);
            }
        }

        assert_eq!(
            log.events()
                .iter()
                .map(|e| (e.kind, e.frame_number))
                .collect::<Vec<_>>(),
            vec![(ZoneEventKind::Enter, 2), (ZoneEventKind::Exit, 5)]
        );
        assert!(log.events().iter().all(|e| e.track_id == 9 && e.zone_id == 3));
        assert_eq!(
            track.metadata().get("zone:3"),
            Some(&serde_json::Value::Bool(false))
        );
        Ok(())
    }

    #[test]
    fn query() {
        let mut log = ZoneEventLog::default();
        let event = |kind, zone_id, frame_number| ZoneEvent {
            kind,
            track_id: 1,
            zone_id,
            frame_number,
        };
        log.push(event(ZoneEventKind::Enter, 1, 1));
        log.push(event(ZoneEventKind::Enter, 2, 2));
        log.push(event(ZoneEventKind::Exit, 1, 3));

        assert_eq!(log.query(Some(1), None).count(), 2);
        assert_eq!(log.query(None, Some(ZoneEventKind::Enter)).count(), 2);
        assert_eq!(
            log.query(Some(1), Some(ZoneEventKind::Exit))
                .map(|e| e.frame_number)
                .collect::<Vec<_>>(),
            vec![3]
        );
        assert_eq!(log.query(None, None).count(), 3);
    }

    #[test]
    fn event_serializes_with_type_tag() -> Result<()> {
        let event = ZoneEvent {
            kind: ZoneEventKind::Exit,
            track_id: 4,
            zone_id: 2,
            frame_number: 17,
        };
        assert_eq!(
            serde_json::to_value(event)?,
            serde_json::json!({"type": "exit", "track_id": 4, "zone_id": 2, "frame_number": 17})
        );
        Ok(())
    }
}
