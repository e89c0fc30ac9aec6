//! Published model releases and how to fetch them.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ValueEnum;
use log::{debug, info};
use serde::Deserialize;
use walkdir::WalkDir;

use crate::errors::{OrthoSegError, Result};
use crate::tiling::ensure_dir;
use crate::traits::ArtifactSource;

pub const BEST_MODEL_FILE: &str = "BEST_MODEL.txt";
pub const ZENODO_API: &str = "https://zenodo.org/api/records";
/// Some releases ship one archive instead of loose files.
pub const ZIPPED_RELEASE_SUFFIX: &str = "rgb.zip";
const ZIPPED_RELEASE_DIR: &str = "rgb";

/// A segmentation task and the releases trained for it.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    pub name: &'static str,
    pub releases: &'static [&'static str],
    pub default_release: &'static str,
}

pub const CATALOG: &[Task] = &[
    Task {
        name: "aerial_watermasking",
        releases: &[
            "noaa_oblique_2class_7604083",
            "aerial_oblique_2class_7604075",
            "aerial_nadir_2class_7604077",
        ],
        default_release: "aerial_oblique_2class_7604075",
    },
    Task {
        name: "aerial_landcover",
        releases: &["floodnet_10class_7566810", "noaa_4class_7631354"],
        default_release: "noaa_4class_7631354",
    },
    Task {
        name: "satellite_shorelines",
        releases: &[
            "sat_RGB_2class_7448405",
            "sat_5band_2class_7448390",
            "sat_NDWI_2class_7557072",
            "sat_MNDWI_2class_7557080",
            "sat_RGB_4class_6950472",
            "sat_5band_4class_7344606",
            "sat_NDWI_4class_7352859",
            "sat_MNDWI_4class_7352850",
            "sat_7band_4class_7358284",
        ],
        default_release: "sat_RGB_4class_6950472",
    },
    Task {
        name: "generic_landcover_highres",
        releases: &[
            "openearthmap_9class_7576894",
            "deepglobe_7class_7576898",
            "enviroatlas_6class_7576909",
            "aaai_building_7607895",
            "aaai_floodedbuildings_7622733",
            "xbd_building_7613212",
            "xbd_damagedbuilding_7613175",
        ],
        default_release: "openearthmap_9class_7576894",
    },
    Task {
        name: "coastal_landcover_highres",
        releases: &[
            "orthoCT_2class_7574784",
            "orthoCT_5class_7566992",
            "orthoCT_5class_segformer_7641708",
            "orthoCT_8class_7570583",
            "orthoCT_8class_segformer_7641724",
            "chesapeake_7class_7576904",
            "chesapeake_7class_segformer_7677506",
        ],
        default_release: "orthoCT_5class_7566992",
    },
];

pub fn find_task(name: &str) -> Option<&'static Task> {
    CATALOG.iter().find(|t| t.name == name)
}

/// `{dataset}_{nclasses}class_{record}`; the record id is the trailing numeric field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseId {
    pub name: String,
    pub record_id: String,
}

impl FromStr for ReleaseId {
    type Err = OrthoSegError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        match name.rsplit_once('_') {
            Some((head, id)) if !head.is_empty() && !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) => {
                Ok(Self {
                    name: name.to_string(),
                    record_id: id.to_string(),
                })
            }
            _ => Err(OrthoSegError::Validation {
                field: "release".to_string(),
                reason: format!("`{name}` does not end in a numeric record id"),
            }),
        }
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Which weights of a release to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ModelChoice {
    /// The single model named in `BEST_MODEL.txt`.
    #[default]
    Best,
    /// Every model in the release, fused by averaging.
    Ensemble,
}

/// A file listed in a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub key: String,
    pub url: String,
}

#[derive(Deserialize)]
struct Record {
    files: Vec<RecordFile>,
}

#[derive(Deserialize)]
struct RecordFile {
    key: String,
    links: RecordLinks,
}

#[derive(Deserialize)]
struct RecordLinks {
    #[serde(rename = "self")]
    download: String,
}

/// The Zenodo records API.
pub struct ZenodoArchive {
    client: reqwest::blocking::Client,
    api_root: String,
}

impl Default for ZenodoArchive {
    fn default() -> Self {
        Self::new(ZENODO_API)
    }
}

impl ZenodoArchive {
    pub fn new(api_root: impl Into<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            api_root: api_root.into().trim_end_matches('/').to_string(),
        }
    }
}

impl ArtifactSource for ZenodoArchive {
    fn list_files(&self, record_id: &str) -> Result<Vec<RemoteFile>> {
        let url = format!("{}/{}", self.api_root, record_id);
        debug!("GET {url}");
        let record: Record = self.client.get(&url).send()?.error_for_status()?.json()?;
        Ok(record
            .files
            .into_iter()
            .map(|f| RemoteFile {
                key: f.key,
                url: f.links.download,
            })
            .collect())
    }

    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        info!("Downloading {} -> {}", url, dest.display());
        let mut response = self.client.get(url).send()?.error_for_status()?;
        let partial = dest.with_extension("part");
        {
            let file = File::create(&partial)
                .map_err(|e| OrthoSegError::filesystem(&partial, "create download", e))?;
            let mut writer = BufWriter::new(file);
            response.copy_to(&mut writer)?;
        }
        fs::rename(&partial, dest).map_err(|e| OrthoSegError::filesystem(dest, "finalise download", e))
    }
}

/// `X_fullmodel.onnx` and `X.onnx` are both configured by `X.json`.
pub fn config_path_for(weights: &Path) -> PathBuf {
    let name = weights.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    weights.with_file_name(config_name_for(name))
}

fn config_name_for(weights_name: &str) -> String {
    let stem = weights_name
        .strip_suffix("_fullmodel.onnx")
        .or_else(|| weights_name.strip_suffix(".onnx"))
        .unwrap_or(weights_name);
    format!("{stem}.json")
}

/// `BEST_MODEL.txt` names the Keras weights; the ONNX export shares its stem.
fn onnx_name_for(best: &str) -> String {
    let best = best.trim();
    let stem = best.rsplit_once('.').map_or(best, |(stem, _)| stem);
    format!("{stem}.onnx")
}

fn missing(record_id: &str, key: &str) -> OrthoSegError {
    OrthoSegError::Fetch {
        url: record_id.to_string(),
        operation: format!("locate {key}"),
        source: "file is not part of the release".into(),
    }
}

fn fetch_missing<S: ArtifactSource + ?Sized>(source: &S, file: &RemoteFile, dir: &Path) -> Result<PathBuf> {
    let dest = dir.join(&file.key);
    if dest.is_file() {
        debug!("{} already present", dest.display());
    } else {
        source.fetch(&file.url, &dest)?;
    }
    Ok(dest)
}

/// Downloads `file` into `dir` and unpacks it there, returning `dir/rgb` when the
/// archive holds that folder. An already unpacked release is reused.
fn download_zipped<S: ArtifactSource + ?Sized>(source: &S, file: &RemoteFile, dir: &Path) -> Result<PathBuf> {
    let unpacked = dir.join(ZIPPED_RELEASE_DIR);
    if unpacked.is_dir() {
        debug!("{} already unpacked", unpacked.display());
        return Ok(unpacked);
    }

    let archive_path = fetch_missing(source, file, dir)?;
    extract_zip(&archive_path, dir)?;
    fs::remove_file(&archive_path)
        .map_err(|e| OrthoSegError::filesystem(&archive_path, "remove release archive", e))?;
    Ok(if unpacked.is_dir() { unpacked } else { dir.to_path_buf() })
}

fn extract_zip(archive_path: &Path, dir: &Path) -> Result<()> {
    let unpack_error = |e: zip::result::ZipError| OrthoSegError::Fetch {
        url: archive_path.display().to_string(),
        operation: "unpack release archive".to_string(),
        source: Box::new(e),
    };
    let file = File::open(archive_path)
        .map_err(|e| OrthoSegError::filesystem(archive_path, "open release archive", e))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(unpack_error)?;
    info!("Unpacking {} entries from {}", archive.len(), archive_path.display());
    archive.extract(dir).map_err(unpack_error)
}

/// Downloads a release into `models_root/{release}/` and returns that directory.
///
/// A release published as `*rgb.zip` is unpacked instead and the unpacked folder is
/// returned whatever `choice` says. Files already on disk are not fetched again.
pub fn download_release<S: ArtifactSource + ?Sized>(
    source: &S,
    release: &ReleaseId,
    choice: ModelChoice,
    models_root: &Path,
) -> Result<PathBuf> {
    let dir = models_root.join(&release.name);
    ensure_dir(models_root)?;
    ensure_dir(&dir)?;

    let files = source.list_files(&release.record_id)?;
    if let Some(zipped) = files.iter().find(|f| f.key.ends_with(ZIPPED_RELEASE_SUFFIX)) {
        info!("Release {} is zipped as {}", release, zipped.key);
        let unpacked = download_zipped(source, zipped, &dir)?;
        info!("Release {} ready in {}", release, unpacked.display());
        return Ok(unpacked);
    }
    let by_key = |key: &str| files.iter().find(|f| f.key == key);

    let weights: Vec<&RemoteFile> = match choice {
        ModelChoice::Best => {
            let best = by_key(BEST_MODEL_FILE).ok_or_else(|| missing(&release.record_id, BEST_MODEL_FILE))?;
            let best_path = fetch_missing(source, best, &dir)?;
            let best_name = fs::read_to_string(&best_path)
                .map_err(|e| OrthoSegError::filesystem(&best_path, "read best model name", e))?;
            let onnx = onnx_name_for(&best_name);
            vec![by_key(&onnx).ok_or_else(|| missing(&release.record_id, &onnx))?]
        }
        ModelChoice::Ensemble => files.iter().filter(|f| f.key.ends_with(".onnx")).collect(),
    };
    if weights.is_empty() {
        return Err(missing(&release.record_id, "*.onnx"));
    }

    for file in weights {
        fetch_missing(source, file, &dir)?;
        let config = config_name_for(&file.key);
        let config = by_key(&config).ok_or_else(|| missing(&release.record_id, &config))?;
        fetch_missing(source, config, &dir)?;
    }
    info!("Release {} ready in {}", release, dir.display());
    Ok(dir)
}

/// Weights files to load from a downloaded release directory.
pub fn weights_list(choice: ModelChoice, dir: &Path) -> Result<Vec<PathBuf>> {
    let weights = match choice {
        ModelChoice::Best => {
            let best_path = dir.join(BEST_MODEL_FILE);
            let best = fs::read_to_string(&best_path)
                .map_err(|e| OrthoSegError::filesystem(&best_path, "read best model name", e))?;
            let path = dir.join(onnx_name_for(&best));
            if !path.is_file() {
                return Err(OrthoSegError::config(format!("{} is missing", path.display())));
            }
            vec![path]
        }
        ModelChoice::Ensemble => {
            let mut paths: Vec<PathBuf> = WalkDir::new(dir)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .map(|e| e.into_path())
                .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("onnx"))
                .collect();
            paths.sort();
            paths
        }
    };
    if weights.is_empty() {
        return Err(OrthoSegError::config(format!("no ONNX weights in {}", dir.display())));
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemoryArchive {
        files: HashMap<String, Vec<u8>>,
        fetched: RefCell<Vec<String>>,
    }

    impl MemoryArchive {
        fn with(files: &[(&str, &str)]) -> Self {
            Self {
                files: files.iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect(),
                fetched: RefCell::default(),
            }
        }
    }

    impl ArtifactSource for MemoryArchive {
        fn list_files(&self, _record_id: &str) -> Result<Vec<RemoteFile>> {
            let mut files: Vec<RemoteFile> = self
                .files
                .keys()
                .map(|k| RemoteFile {
                    key: k.clone(),
                    url: format!("mem://{k}"),
                })
                .collect();
            files.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(files)
        }

        fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
            let key = url.trim_start_matches("mem://");
            self.fetched.borrow_mut().push(key.to_string());
            fs::write(dest, &self.files[key])?;
            Ok(())
        }
    }

    fn release() -> ReleaseId {
        "orthoCT_5class_7566992".parse().unwrap()
    }

    fn archive() -> MemoryArchive {
        MemoryArchive::with(&[
            ("BEST_MODEL.txt", "orthoCT_5class_b_fullmodel.h5\n"),
            ("orthoCT_5class_a_fullmodel.onnx", "a"),
            ("orthoCT_5class_a.json", "{}"),
            ("orthoCT_5class_b_fullmodel.onnx", "b"),
            ("orthoCT_5class_b.json", "{}"),
            ("orthoCT_5class_b_fullmodel.h5", "keras"),
        ])
    }

    #[test]
    fn test_release_id_parsing() {
        let id = release();
        assert_eq!(id.record_id, "7566992");
        assert_eq!(id.to_string(), "orthoCT_5class_7566992");
        assert!("orthoCT_5class".parse::<ReleaseId>().is_err());
        assert!("7566992".parse::<ReleaseId>().is_err());
    }

    #[test]
    fn test_catalog_defaults_are_listed() {
        for task in CATALOG {
            assert!(task.releases.contains(&task.default_release), "{}", task.name);
            for release in task.releases {
                assert!(release.parse::<ReleaseId>().is_ok(), "{release}");
            }
        }
        assert!(find_task("aerial_landcover").is_some());
        assert!(find_task("lunar_craters").is_none());
    }

    #[test]
    fn test_config_names() {
        assert_eq!(config_path_for(Path::new("m/x_fullmodel.onnx")), PathBuf::from("m/x.json"));
        assert_eq!(config_path_for(Path::new("m/x.onnx")), PathBuf::from("m/x.json"));
        assert_eq!(onnx_name_for("x_fullmodel.h5\n"), "x_fullmodel.onnx");
    }

    #[test]
    fn test_best_download_is_not_repeated() -> Result<()> {
        let dir = TempDir::new()?;
        let archive = archive();
        let model_dir = download_release(&archive, &release(), ModelChoice::Best, dir.path())?;
        assert_eq!(model_dir, dir.path().join("orthoCT_5class_7566992"));
        assert_eq!(
            *archive.fetched.borrow(),
            vec!["BEST_MODEL.txt", "orthoCT_5class_b_fullmodel.onnx", "orthoCT_5class_b.json"]
        );
        assert_eq!(
            weights_list(ModelChoice::Best, &model_dir)?,
            vec![model_dir.join("orthoCT_5class_b_fullmodel.onnx")]
        );

        download_release(&archive, &release(), ModelChoice::Best, dir.path())?;
        assert_eq!(archive.fetched.borrow().len(), 3);
        Ok(())
    }

    #[test]
    fn test_ensemble_fetches_every_model() -> Result<()> {
        let dir = TempDir::new()?;
        let archive = archive();
        let model_dir = download_release(&archive, &release(), ModelChoice::Ensemble, dir.path())?;
        let weights = weights_list(ModelChoice::Ensemble, &model_dir)?;
        assert_eq!(weights.len(), 2);
        for w in &weights {
            assert!(config_path_for(w).is_file());
        }
        Ok(())
    }

    fn zipped(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer.start_file(*name, zip::write::FileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_zipped_release_is_unpacked_once() -> Result<()> {
        let dir = TempDir::new()?;
        let mut archive = MemoryArchive::default();
        archive.files.insert(
            "rgb.zip".to_string(),
            zipped(&[
                ("rgb/BEST_MODEL.txt", "m_fullmodel.h5\n"),
                ("rgb/m_fullmodel.onnx", "m"),
                ("rgb/m.json", "{}"),
            ]),
        );

        let model_dir = download_release(&archive, &release(), ModelChoice::Best, dir.path())?;
        let release_dir = dir.path().join("orthoCT_5class_7566992");
        assert_eq!(model_dir, release_dir.join("rgb"));
        assert!(!release_dir.join("rgb.zip").exists());
        assert_eq!(
            weights_list(ModelChoice::Best, &model_dir)?,
            vec![model_dir.join("m_fullmodel.onnx")]
        );

        assert_eq!(download_release(&archive, &release(), ModelChoice::Ensemble, dir.path())?, model_dir);
        assert_eq!(*archive.fetched.borrow(), vec!["rgb.zip"]);
        Ok(())
    }

    #[test]
    fn test_other_archives_do_not_make_a_release_zipped() -> Result<()> {
        let dir = TempDir::new()?;
        let mut archive = archive();
        archive.files.insert("training_data.zip".to_string(), b"zip".to_vec());
        let model_dir = download_release(&archive, &release(), ModelChoice::Best, dir.path())?;
        assert_eq!(model_dir, dir.path().join("orthoCT_5class_7566992"));
        assert!(!archive.fetched.borrow().iter().any(|k| k.ends_with(".zip")));
        Ok(())
    }

    #[test]
    fn test_corrupt_and_incomplete_releases() -> Result<()> {
        let dir = TempDir::new()?;
        let corrupt = MemoryArchive::with(&[("rgb.zip", "not a zip")]);
        assert!(matches!(
            download_release(&corrupt, &release(), ModelChoice::Best, dir.path()),
            Err(OrthoSegError::Fetch { .. })
        ));

        let no_config = MemoryArchive::with(&[("m_fullmodel.onnx", "m")]);
        assert!(matches!(
            download_release(&no_config, &release(), ModelChoice::Ensemble, dir.path()),
            Err(OrthoSegError::Fetch { .. })
        ));
        Ok(())
    }
}
