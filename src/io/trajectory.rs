//! Semicolon-separated trajectory log, one row per tracked frame.

use std::path::Path;

use anyhow::{Context, Result};
use csv::WriterBuilder;

use crate::geometry::SE3;
use crate::tracking::TrackingQuality;

pub struct TrajectoryWriter {
    writer: csv::Writer<std::fs::File>,
}

impl TrajectoryWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let writer = WriterBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .from_path(path)
            .with_context(|| format!("creating trajectory log {}", path.display()))?;
        Ok(Self { writer })
    }

    /// Appends one frame: its number, a quality digit (2 good, 1 dodgy,
    /// 0 bad) and the camera position in world coordinates.
    pub fn record(&mut self, frame: u64, quality: TrackingQuality, pose: &SE3) -> Result<()> {
        let digit = match quality {
            TrackingQuality::Good => 2,
            TrackingQuality::Dodgy => 1,
            TrackingQuality::Bad => 0,
        };
        let position = pose.inverse().translation;
        // Adding positive zero folds -0.0 into 0.0 before formatting.
        let field = |v: f64| format!("{:.6}", v + 0.0);
        self.writer
            .write_record(&[
                frame.to_string(),
                digit.to_string(),
                field(position.x),
                field(position.y),
                field(position.z),
            ])
            .context("writing trajectory row")?;
        self.writer.flush().context("flushing trajectory log")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn rows_hold_frame_quality_and_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectory.csv");

        let mut pose = SE3::identity();
        pose.translation = Vector3::new(-1.0, 0.5, 2.0);

        let mut writer = TrajectoryWriter::create(&path).unwrap();
        writer.record(0, TrackingQuality::Good, &SE3::identity()).unwrap();
        writer.record(1, TrackingQuality::Bad, &pose).unwrap();
        drop(writer);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        // Inverting the identity negates its zero translation; the log must
        // still print unsigned zeros.
        assert_eq!(lines[0], "0;2;0.000000;0.000000;0.000000");

        let fields: Vec<&str> = lines[1].split(';').collect();
        assert_eq!(fields[0], "1");
        assert_eq!(fields[1], "0");
        // Camera position is the inverse pose translation.
        let expected = pose.inverse().translation;
        assert!((fields[2].parse::<f64>().unwrap() - expected.x).abs() < 1e-6);
        assert!((fields[4].parse::<f64>().unwrap() - expected.z).abs() < 1e-6);
    }
}
