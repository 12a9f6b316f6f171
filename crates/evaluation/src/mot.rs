use anyhow::{Context, Result};
use indexmap::IndexMap;
use reidtrack::{BoundingBox, Detection, TrackSnapshot};
use std::io::{Read, Write};

/// Read a MOT challenge detection file grouped by frame number, in file order.
///
/// Rows are `<frame>,<id>,<bb_left>,<bb_top>,<bb_width>,<bb_height>,<conf>[,<class>,...]`. The id column is
/// ignored and a negative class means no class.
pub fn read_detections<R: Read>(reader: R) -> Result<IndexMap<u32, Vec<Detection>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut frames = IndexMap::<u32, Vec<Detection>>::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let field = |idx: usize| -> Result<f32> {
            record
                .get(idx)
                .with_context(|| format!("line {}: missing column {}", line + 1, idx + 1))?
                .parse::<f32>()
                .with_context(|| format!("line {}: invalid column {}", line + 1, idx + 1))
        };

        let frame = field(0)? as u32;
        let class_id = match record.get(7).map(|value| value.parse::<f32>()) {
            Some(Ok(class)) if class >= 0.0 => Some(class as usize),
            _ => None,
        };
        let detection = Detection::new(
            None,
            BoundingBox::new(field(2)?, field(3)?, field(4)?, field(5)?),
            field(6)?,
            class_id,
            None,
        );

        frames.entry(frame).or_default().push(detection);
    }

    Ok(frames)
}

/// Writes confirmed tracks in the MOT challenge result format.
pub struct MotWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> MotWriter<W> {
    pub fn new(writer: W) -> Self {
        MotWriter {
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(writer),
        }
    }

    /// Only tracks updated in this frame are written.
    pub fn write_frame(&mut self, frame: u32, snapshots: &[TrackSnapshot]) -> Result<()> {
        for snapshot in snapshots.iter().filter(|s| s.time_since_update == 0) {
            // <frame>, <id>, <bb_left>, <bb_top>, <bb_width>, <bb_height>, <conf>, <x>, <y>, <z>
            self.writer.write_record(&[
                frame.to_string(),
                snapshot.track_id.to_string(),
                format!("{:.3}", snapshot.bbox.x()),
                format!("{:.3}", snapshot.bbox.y()),
                format!("{:.3}", snapshot.bbox.width()),
                format!("{:.3}", snapshot.bbox.height()),
                "1".to_string(),
                "-1".to_string(),
                "-1".to_string(),
                "-1".to_string(),
            ])?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.writer.flush()?)
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flushing output: {}", err.error()))
    }
}
