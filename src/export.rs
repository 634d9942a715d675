// export.rs — Diagnostic snapshots of volumes and depth/sim maps.
//
// Engines call a `DiagnosticSink` only when `export_intermediate_results`
// is set. Snapshots are keyed by view id, scale, tile origin (when the view
// is split into several tiles) and processing stage.
//
// `CsvDiagnostics` writes plain CSV files into a directory:
//
//   <view>_<stage>_scale<s>[_<x>_<y>]_volume.csv       every cell with cost < 255
//   <view>_<stage>_scale<s>[_<x>_<y>]_volumeCross.csv  center row + center column
//   <view>_<stage>_scale<s>[_<x>_<y>]_stats9p.csv      cost curves of a 3×3 pixel grid
//   <view>_<stage>_scale<s>[_<x>_<y>]_depthSimMap.csv  depth and similarity per cell
//
// Pixel coordinates in every file are full-resolution reference pixels.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::error::Result;
use crate::retrieve::DepthSimMap;
use crate::tile::Roi;
use crate::volume::{VolumeDims, SIM_WORST};

/// Processing stage a snapshot was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportStage {
    /// Fused volume, before aggregation.
    BeforeFiltering,
    /// Final cost volume (aggregated or passthrough).
    AfterFiltering,
    /// Extracted depth/sim map.
    Sgm,
}

impl ExportStage {
    pub fn label(self) -> &'static str {
        match self {
            ExportStage::BeforeFiltering => "beforeFiltering",
            ExportStage::AfterFiltering => "afterFiltering",
            ExportStage::Sgm => "sgm",
        }
    }
}

impl fmt::Display for ExportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExportKey {
    pub view_id: usize,
    pub scale: u32,
    pub tile_origin: Option<(usize, usize)>,
    pub stage: ExportStage,
}

impl ExportKey {
    /// File stem shared by every file of this snapshot.
    pub fn file_stem(&self) -> String {
        let mut s = format!("{}_{}_scale{}", self.view_id, self.stage, self.scale);
        if let Some((x, y)) = self.tile_origin {
            s.push_str(&format!("_{x}_{y}"));
        }
        s
    }
}

/// Borrowed view of a volume's active region, packed x-fastest.
#[derive(Debug, Clone, Copy)]
pub struct VolumeSnapshot<'a> {
    pub costs: &'a [u32],
    pub dims: VolumeDims,
    pub depths: &'a [f32],
    /// Full-resolution tile region.
    pub roi: Roi,
    /// Full-resolution pixels per volume cell.
    pub downscale: u32,
}

impl VolumeSnapshot<'_> {
    #[inline]
    pub fn cost(&self, x: usize, y: usize, z: usize) -> u32 {
        self.costs[(z * self.dims.height + y) * self.dims.width + x]
    }

    /// Full-resolution pixel of volume cell (x, y).
    pub fn full_res_pixel(&self, x: usize, y: usize) -> (usize, usize) {
        let ds = self.roi.downscaled(self.downscale);
        let d = self.downscale as usize;
        ((ds.x.begin + x) * d, (ds.y.begin + y) * d)
    }

    /// The 3×3 grid of sample cells used by the stats export.
    pub fn stats_pixels(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(9);
        for j in 1..=3 {
            for i in 1..=3 {
                out.push((i * self.dims.width / 4, j * self.dims.height / 4));
            }
        }
        out
    }
}

/// Receiver of diagnostic snapshots.
pub trait DiagnosticSink: Send {
    fn export_volume(&mut self, key: ExportKey, volume: &VolumeSnapshot<'_>) -> Result<()>;
    fn export_depth_sim_map(&mut self, key: ExportKey, map: &DepthSimMap) -> Result<()>;
}

// ---------------------------------------------------------------------------
// CSV files
// ---------------------------------------------------------------------------

/// Writes snapshots as CSV files into a directory.
#[derive(Debug, Clone)]
pub struct CsvDiagnostics {
    dir: PathBuf,
}

impl CsvDiagnostics {
    /// Sink writing into `dir`, created if missing.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(CsvDiagnostics { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the `suffix` file for `key`.
    pub fn path_for(&self, key: &ExportKey, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}_{suffix}.csv", key.file_stem()))
    }

    fn create(&self, key: &ExportKey, suffix: &str) -> Result<BufWriter<File>> {
        let path = self.path_for(key, suffix);
        debug!("export {}", path.display());
        Ok(BufWriter::new(File::create(path)?))
    }

    fn write_volume(&self, key: &ExportKey, v: &VolumeSnapshot<'_>) -> Result<()> {
        let mut w = self.create(key, "volume")?;
        writeln!(w, "x,y,z,depth,cost")?;
        for z in 0..v.dims.depths {
            for y in 0..v.dims.height {
                for x in 0..v.dims.width {
                    let c = v.cost(x, y, z);
                    if c < SIM_WORST {
                        let (fx, fy) = v.full_res_pixel(x, y);
                        writeln!(w, "{fx},{fy},{z},{},{c}", v.depths[z])?;
                    }
                }
            }
        }
        w.flush()?;
        Ok(())
    }

    fn write_cross(&self, key: &ExportKey, v: &VolumeSnapshot<'_>) -> Result<()> {
        let mut w = self.create(key, "volumeCross")?;
        writeln!(w, "axis,x,y,z,depth,cost")?;
        let (cx, cy) = (v.dims.width / 2, v.dims.height / 2);
        for z in 0..v.dims.depths {
            for x in 0..v.dims.width {
                let (fx, fy) = v.full_res_pixel(x, cy);
                writeln!(w, "row,{fx},{fy},{z},{},{}", v.depths[z], v.cost(x, cy, z))?;
            }
            for y in 0..v.dims.height {
                let (fx, fy) = v.full_res_pixel(cx, y);
                writeln!(w, "col,{fx},{fy},{z},{},{}", v.depths[z], v.cost(cx, y, z))?;
            }
        }
        w.flush()?;
        Ok(())
    }

    fn write_stats9p(&self, key: &ExportKey, v: &VolumeSnapshot<'_>) -> Result<()> {
        let mut w = self.create(key, "stats9p")?;
        writeln!(w, "pixel,x,y,z,depth,cost")?;
        for (i, (x, y)) in v.stats_pixels().into_iter().enumerate() {
            let (fx, fy) = v.full_res_pixel(x, y);
            for z in 0..v.dims.depths {
                writeln!(w, "{i},{fx},{fy},{z},{},{}", v.depths[z], v.cost(x, y, z))?;
            }
        }
        w.flush()?;
        Ok(())
    }
}

impl DiagnosticSink for CsvDiagnostics {
    fn export_volume(&mut self, key: ExportKey, volume: &VolumeSnapshot<'_>) -> Result<()> {
        if volume.dims.cells() == 0 {
            return Ok(());
        }
        self.write_volume(&key, volume)?;
        self.write_cross(&key, volume)?;
        self.write_stats9p(&key, volume)
    }

    fn export_depth_sim_map(&mut self, key: ExportKey, map: &DepthSimMap) -> Result<()> {
        let mut w = self.create(&key, "depthSimMap")?;
        writeln!(w, "x,y,depth,sim")?;
        for ((x, y), v) in map.iter() {
            writeln!(w, "{x},{y},{},{}", v.depth, v.sim)?;
        }
        w.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory recording
// ---------------------------------------------------------------------------

/// Owned copy of a volume snapshot.
#[derive(Debug, Clone)]
pub struct RecordedVolume {
    pub key: ExportKey,
    pub costs: Vec<u32>,
    pub dims: VolumeDims,
    pub depths: Vec<f32>,
}

#[derive(Debug, Default)]
struct Recording {
    volumes: Vec<RecordedVolume>,
    maps: Vec<(ExportKey, DepthSimMap)>,
}

/// Sink that keeps every snapshot in memory. Clones share the recording,
/// so a test can hand one clone to an engine and inspect through another.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn volumes(&self) -> Vec<RecordedVolume> {
        self.inner.lock().volumes.clone()
    }

    pub fn volume(&self, stage: ExportStage) -> Option<RecordedVolume> {
        self.inner.lock().volumes.iter().rev().find(|v| v.key.stage == stage).cloned()
    }

    pub fn maps(&self) -> Vec<(ExportKey, DepthSimMap)> {
        self.inner.lock().maps.clone()
    }
}

impl DiagnosticSink for RecordingSink {
    fn export_volume(&mut self, key: ExportKey, volume: &VolumeSnapshot<'_>) -> Result<()> {
        self.inner.lock().volumes.push(RecordedVolume {
            key,
            costs: volume.costs.to_vec(),
            dims: volume.dims,
            depths: volume.depths.to_vec(),
        });
        Ok(())
    }

    fn export_depth_sim_map(&mut self, key: ExportKey, map: &DepthSimMap) -> Result<()> {
        self.inner.lock().maps.push((key, map.clone()));
        Ok(())
    }
}
