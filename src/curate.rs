//! Output curation: turns whatever the predictor left in `out/` into one label
//! raster and one sidecar per tile key, then records them in the mosaic manifest.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::errors::{OrthoSegError, Result, Stage, TileFailure, TileFailureKind};
use crate::georef::Sidecar;
use crate::manifest::{GeorefSource, ManifestEntry, MosaicManifest, TileIndex};
use crate::naming::{sidecar_path, sidecar_target, PredictionKind, PredictionName, TileNameKey};

const TILE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "tif"];

#[derive(Debug, Default)]
pub struct CurationReport {
    pub deleted: Vec<PathBuf>,
    pub copied: Vec<PathBuf>,
    pub renamed: Vec<PathBuf>,
    /// Outputs without a sidecar, placed from the tile index or left out.
    pub flagged: Vec<TileFailure>,
    pub manifest: MosaicManifest,
}

/// Curates `out_dir` in place and writes its `manifest.json`.
///
/// 1. byproducts (`_prob`, `_overlay`, superseded per-model labels) are deleted;
/// 2. `{key}.{ext}.aux.xml` is copied from `tiles_dir` to `out_dir/{key}.png.aux.xml`;
/// 3. the retained label raster is renamed to `{key}.png`.
///
/// When `tiles.json` exists only its keys are curated and enter the manifest;
/// outputs of other inputs or of an earlier grid are left untouched.
/// An output whose raster or sidecar cannot be read is flagged and left out.
///
/// Running it again on a curated directory changes nothing.
pub fn curate_outputs(tiles_dir: &Path, out_dir: &Path) -> Result<CurationReport> {
    if !out_dir.is_dir() {
        return Err(OrthoSegError::NoInput(format!(
            "prediction directory {} does not exist",
            out_dir.display()
        )));
    }
    let index = TileIndex::load(tiles_dir)?;
    let in_scope = |key: &TileNameKey| index.as_ref().map_or(true, |i| i.find(key).is_some());
    let mut report = CurationReport::default();

    let mut labels: BTreeMap<TileNameKey, Vec<(Option<usize>, PathBuf)>> = BTreeMap::new();
    for path in output_files(out_dir) {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if sidecar_target(file_name).is_some() {
            continue;
        }
        let Some(name) = PredictionName::parse(file_name).filter(|n| in_scope(&n.key)) else {
            debug!("Ignoring {}", path.display());
            continue;
        };
        match name.kind {
            kind if kind.is_byproduct() => {
                remove(&path)?;
                report.deleted.push(path);
            }
            PredictionKind::Label => labels.entry(name.key).or_default().push((name.model, path)),
            _ => {}
        }
    }

    for (key, mut candidates) in labels {
        // The fused output wins over per-model ones; among those, the lowest index.
        candidates.sort_by_key(|(model, _)| model.map_or(0, |i| i + 1));
        let mut candidates = candidates.into_iter();
        let Some((_, keep)) = candidates.next() else {
            continue;
        };
        for (_, superseded) in candidates {
            remove(&superseded)?;
            report.deleted.push(superseded);
        }

        let curated = out_dir.join(key.curated_file_name());
        if let Some(copied) = copy_tile_sidecar(tiles_dir, &key, &curated)? {
            report.copied.push(copied);
        }
        fs::rename(&keep, &curated)
            .map_err(|e| OrthoSegError::filesystem(&keep, "rename prediction", e))?;
        debug!("{} -> {}", keep.display(), curated.display());
        report.renamed.push(curated);
    }

    // Curated outputs from an earlier run may still be missing their sidecar.
    let mut entries = Vec::new();
    for path in output_files(out_dir) {
        let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(PredictionName::parse)
            .filter(|n| n.kind == PredictionKind::Curated && n.model.is_none() && in_scope(&n.key))
        else {
            continue;
        };
        if path.extension().and_then(|e| e.to_str()) != Some("png") {
            continue;
        }
        if !sidecar_path(&path).is_file() {
            if let Some(copied) = copy_tile_sidecar(tiles_dir, &name.key, &path)? {
                report.copied.push(copied);
            }
        }
        match manifest_entry(&name.key, &path, index.as_ref()) {
            Ok(entry) => {
                if entry.georef == GeorefSource::Inferred {
                    warn!("{} has no sidecar; placement taken from the tile index", path.display());
                    report.flagged.push(TileFailure::new(
                        &path,
                        Stage::Curate,
                        TileFailureKind::MissingSidecar,
                        "sidecar missing, geotransform inferred from tile index",
                    ));
                }
                entries.push(entry);
            }
            Err(failure) => {
                error!("{}", failure);
                report.flagged.push(failure);
            }
        }
    }

    let crs = entries
        .iter()
        .filter(|e| e.georef == GeorefSource::Sidecar)
        .find_map(|e| Sidecar::read(&sidecar_path(&e.path)).ok().and_then(|s| s.crs))
        .or_else(|| index.as_ref().and_then(|i| i.crs.clone()));
    report.manifest = MosaicManifest::new(crs, entries)?;
    report.manifest.save(out_dir)?;

    info!(
        "Curated {}: {} deleted, {} sidecar(s) copied, {} renamed, {} flagged, {} in manifest",
        out_dir.display(),
        report.deleted.len(),
        report.copied.len(),
        report.renamed.len(),
        report.flagged.len(),
        report.manifest.len()
    );
    Ok(report)
}

fn output_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

fn remove(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(|e| OrthoSegError::filesystem(path, "delete byproduct", e))
}

/// Copies the tile's sidecar so it sits next to `curated`, if the tile has one.
fn copy_tile_sidecar(tiles_dir: &Path, key: &TileNameKey, curated: &Path) -> Result<Option<PathBuf>> {
    let Some(source) = TILE_EXTENSIONS
        .iter()
        .map(|ext| sidecar_path(&tiles_dir.join(key.tile_file_name(ext))))
        .find(|p| p.is_file())
    else {
        return Ok(None);
    };
    let dest = sidecar_path(curated);
    fs::copy(&source, &dest).map_err(|e| OrthoSegError::filesystem(&dest, "copy sidecar", e))?;
    Ok(Some(dest))
}

/// Placement of one curated output, or the reason it stays out of the mosaic.
fn manifest_entry(
    key: &TileNameKey,
    path: &Path,
    index: Option<&TileIndex>,
) -> std::result::Result<ManifestEntry, TileFailure> {
    let unreadable = |message: String| {
        TileFailure::new(path, Stage::Curate, TileFailureKind::Unreadable, message)
    };
    let (width, height) = image::image_dimensions(path)
        .map_err(|e| unreadable(format!("cannot read prediction size: {e}")))?;
    let sidecar = sidecar_path(path);

    let (geotransform, georef) = if sidecar.is_file() {
        let sidecar = Sidecar::read(&sidecar).map_err(|e| unreadable(e.to_string()))?;
        (sidecar.geotransform, GeorefSource::Sidecar)
    } else if let Some(record) = index.and_then(|i| i.find(key)) {
        (record.geotransform, GeorefSource::Inferred)
    } else {
        return Err(TileFailure::new(
            path,
            Stage::Curate,
            TileFailureKind::Unplaced,
            "no sidecar and no tile index entry; left out of the mosaic",
        ));
    };

    Ok(ManifestEntry {
        key: key.clone(),
        path: path.to_path_buf(),
        width: width as usize,
        height: height as usize,
        geotransform,
        georef,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::georef::GeoTransform;
    use crate::manifest::TileRecord;
    use image::{GrayImage, Luma};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn gt(x: f64) -> GeoTransform {
        GeoTransform([x, 1.0, 0.0, 10.0, 0.0, -1.0])
    }

    fn fixture(prefix: &str, keys: &[(u32, u32)]) -> Result<(TempDir, PathBuf, PathBuf)> {
        let dir = TempDir::new()?;
        let tiles = dir.path().join("tiles");
        let out = tiles.join("out");
        fs::create_dir_all(&out)?;
        for (i, &(row, col)) in keys.iter().enumerate() {
            let key = TileNameKey::new(prefix, row, col);
            let tile = tiles.join(key.tile_file_name("jpg"));
            fs::write(&tile, b"")?;
            Sidecar::new(gt(i as f64 * 4.0), None).write(&sidecar_path(&tile))?;
            let label = GrayImage::from_pixel(4, 4, Luma([1]));
            label.save(out.join(key.output_file_name(PredictionKind::Label, None)))?;
            label.save(out.join(key.output_file_name(PredictionKind::Probability, None)))?;
            label.save(out.join(key.output_file_name(PredictionKind::Overlay, None)))?;
            label.save(out.join(key.output_file_name(PredictionKind::Probability, Some(0))))?;
        }
        Ok((dir, tiles, out))
    }

    fn names(dir: &Path) -> BTreeSet<String> {
        output_files(dir)
            .into_iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect()
    }

    #[test]
    fn test_curation_pairs_outputs_with_sidecars() -> Result<()> {
        let (_dir, tiles, out) = fixture("site", &[(1, 1), (1, 2)])?;
        let report = curate_outputs(&tiles, &out)?;

        assert_eq!(report.deleted.len(), 6);
        assert_eq!(report.copied.len(), 2);
        assert_eq!(report.renamed.len(), 2);
        assert!(report.flagged.is_empty());
        assert_eq!(report.manifest.len(), 2);

        let expected: BTreeSet<String> = [
            "manifest.json",
            "site_001_001.png",
            "site_001_001.png.aux.xml",
            "site_001_002.png",
            "site_001_002.png.aux.xml",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(names(&out), expected);
        assert_eq!(report.manifest.entries[1].geotransform, gt(4.0));
        Ok(())
    }

    #[test]
    fn test_second_run_is_a_no_op() -> Result<()> {
        let (_dir, tiles, out) = fixture("site", &[(1, 1), (2, 1)])?;
        let first = curate_outputs(&tiles, &out)?;
        let before = names(&out);

        let second = curate_outputs(&tiles, &out)?;
        assert!(second.deleted.is_empty() && second.copied.is_empty() && second.renamed.is_empty());
        assert_eq!(names(&out), before);
        assert_eq!(second.manifest, first.manifest);
        Ok(())
    }

    #[test]
    fn test_prefix_containing_suffix_words() -> Result<()> {
        let (_dir, tiles, out) = fixture("predseg_prob_overlay", &[(1, 1)])?;
        let report = curate_outputs(&tiles, &out)?;
        assert_eq!(report.manifest.len(), 1);
        assert_eq!(report.manifest.entries[0].key.prefix, "predseg_prob_overlay");
        assert!(out.join("predseg_prob_overlay_001_001.png").is_file());
        assert!(out.join("predseg_prob_overlay_001_001.png.aux.xml").is_file());
        Ok(())
    }

    fn index_of(keys: &[(u32, u32)]) -> TileIndex {
        TileIndex {
            source: PathBuf::from("site.tif"),
            width: 4 * keys.len(),
            height: 4,
            bands: 3,
            geotransform: gt(0.0),
            crs: None,
            tile_size: 4,
            overlap: 0,
            tiles: keys
                .iter()
                .enumerate()
                .map(|(i, &(row, col))| TileRecord {
                    key: TileNameKey::new("site", row, col),
                    row_off: 0,
                    col_off: 4 * i,
                    width: 4,
                    height: 4,
                    geotransform: gt(4.0 * i as f64),
                })
                .collect(),
        }
    }

    #[test]
    fn test_missing_sidecar_is_inferred_from_index() -> Result<()> {
        let (_dir, tiles, out) = fixture("site", &[(1, 1), (1, 2)])?;
        fs::remove_file(sidecar_path(&tiles.join("site_001_001.jpg")))?;
        index_of(&[(1, 1), (1, 2)]).save(&tiles)?;

        let report = curate_outputs(&tiles, &out)?;
        assert_eq!(report.manifest.len(), 2);
        assert_eq!(report.manifest.entries[0].georef, GeorefSource::Inferred);
        assert_eq!(report.manifest.entries[0].geotransform, gt(0.0));
        assert_eq!(report.manifest.entries[1].georef, GeorefSource::Sidecar);
        let kinds: Vec<_> = report.flagged.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![TileFailureKind::MissingSidecar]);
        Ok(())
    }

    #[test]
    fn test_unplaced_without_sidecar_or_index() -> Result<()> {
        let (_dir, tiles, out) = fixture("site", &[(1, 1), (1, 2)])?;
        fs::remove_file(sidecar_path(&tiles.join("site_001_002.jpg")))?;

        let report = curate_outputs(&tiles, &out)?;
        assert_eq!(report.manifest.len(), 1);
        assert_eq!(report.flagged.len(), 1);
        assert_eq!(report.flagged[0].kind, TileFailureKind::Unplaced);
        assert_eq!(report.flagged[0].key, Some(TileNameKey::new("site", 1, 2)));
        Ok(())
    }

    #[test]
    fn test_unreadable_output_is_flagged_and_skipped() -> Result<()> {
        let keys: Vec<(u32, u32)> = (1..=3).flat_map(|r| (1..=3).map(move |c| (r, c))).collect();
        let (_dir, tiles, out) = fixture("site", &keys)?;
        let broken = TileNameKey::new("site", 2, 2);
        fs::write(out.join(broken.output_file_name(PredictionKind::Label, None)), b"\x89PNG truncated")?;
        fs::write(
            sidecar_path(&tiles.join(TileNameKey::new("site", 3, 3).tile_file_name("jpg"))),
            "<PAMDataset><GeoTransform>not numbers</GeoTransform></PAMDataset>",
        )?;

        let report = curate_outputs(&tiles, &out)?;
        assert_eq!(report.manifest.len(), 7);
        let flagged: Vec<_> = report.flagged.iter().map(|f| (f.kind, f.key.clone())).collect();
        assert_eq!(
            flagged,
            vec![
                (TileFailureKind::Unreadable, Some(broken)),
                (TileFailureKind::Unreadable, Some(TileNameKey::new("site", 3, 3))),
            ]
        );
        assert!(report.manifest.entries.iter().all(|e| e.georef == GeorefSource::Sidecar));
        Ok(())
    }

    #[test]
    fn test_outputs_outside_the_index_stay_out() -> Result<()> {
        let (_dir, tiles, out) = fixture("site", &[(1, 1), (1, 2), (2, 1)])?;
        // The current grid is smaller than the one that produced these outputs.
        index_of(&[(1, 1), (1, 2)]).save(&tiles)?;

        let report = curate_outputs(&tiles, &out)?;
        let keys: Vec<_> = report.manifest.entries.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![TileNameKey::new("site", 1, 1), TileNameKey::new("site", 1, 2)]);
        assert!(report.flagged.is_empty());
        assert!(out.join("site_002_001_predseg.png").is_file());
        Ok(())
    }

    #[test]
    fn test_fused_label_supersedes_member_labels() -> Result<()> {
        let (_dir, tiles, out) = fixture("site", &[(1, 1)])?;
        let key = TileNameKey::new("site", 1, 1);
        GrayImage::new(4, 4).save(out.join(key.output_file_name(PredictionKind::Label, Some(1))))?;
        let report = curate_outputs(&tiles, &out)?;
        assert_eq!(report.renamed.len(), 1);
        assert!(!out.join("site_001_001_m1_predseg.png").exists());
        let kept = image::open(out.join("site_001_001.png"))?.to_luma8();
        assert_eq!(kept.get_pixel(0, 0).0[0], 1);
        Ok(())
    }

    #[test]
    fn test_missing_output_dir() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            curate_outputs(dir.path(), &dir.path().join("out")),
            Err(OrthoSegError::NoInput(_))
        ));
    }
}
