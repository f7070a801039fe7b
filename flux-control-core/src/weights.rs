//! Weight provisioning: fetch the base model and ControlNet bundles once,
//! unpack them atomically into the weights directory and validate every
//! safetensors header before anything is loaded.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use safetensors::SafeTensors;
use tar::Archive;
use tracing::{debug, info};

pub const DEFAULT_MODEL_URL: &str =
    "https://weights.replicate.delivery/default/black-forest-labs/FLUX.1-dev/files.tar";
pub const DEFAULT_CONTROLNET_URL: &str =
    "https://weights.replicate.delivery/default/shakker-labs/FLUX.1-dev-ControlNet-Union-Pro/model.tar";
pub const MODEL_DIR: &str = "FLUX.1-dev";
pub const CONTROLNET_DIR: &str = "FLUX.1-dev-ControlNet-Union-Pro";
pub const MODEL_REPO: &str = "black-forest-labs/FLUX.1-dev";
pub const CONTROLNET_REPO: &str = "Shakker-Labs/FLUX.1-dev-ControlNet-Union-Pro";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleSource {
    /// A tar (optionally gzip compressed) archive behind an http(s) URL,
    /// a `file://` URL or a plain local path.
    Archive(String),
    /// A Hugging Face Hub repository, restricted to the files whose names start
    /// with one of the `include` prefixes.
    Hub { repo: String, include: Vec<String> },
}

/// One named set of weights and where to get it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightBundle {
    pub name: String,
    pub dir: PathBuf,
    pub source: BundleSource,
}

impl WeightBundle {
    /// Makes the bundle available locally and returns its directory.
    ///
    /// An existing directory is trusted as is. Archives are unpacked into a
    /// `.partial` sibling and renamed into place only once extraction succeeded.
    pub fn ensure(&self) -> Result<PathBuf> {
        match &self.source {
            BundleSource::Archive(url) => {
                if self.dir.is_dir() {
                    info!(bundle = %self.name, dir = %self.dir.display(), "weights present, skipping download");
                    return Ok(self.dir.clone());
                }
                info!(bundle = %self.name, url = %url, "downloading weights");
                let start = std::time::Instant::now();
                let reader = open_archive(url)?;
                install_archive(reader, &self.dir)
                    .with_context(|| format!("failed to install {} from {url}", self.name))?;
                info!(
                    bundle = %self.name,
                    elapsed = ?start.elapsed(),
                    "weights extracted"
                );
                Ok(self.dir.clone())
            }
            BundleSource::Hub { repo, include } => fetch_hub(repo, include),
        }
    }
}

/// Where the two bundles ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightPaths {
    pub model: PathBuf,
    pub controlnet: PathBuf,
}

/// Weight sources and target directory, as chosen on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightsConfig {
    pub root: PathBuf,
    pub model_url: String,
    pub controlnet_url: String,
    pub from_hub: bool,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("weights"),
            model_url: DEFAULT_MODEL_URL.to_string(),
            controlnet_url: DEFAULT_CONTROLNET_URL.to_string(),
            from_hub: false,
        }
    }
}

impl WeightsConfig {
    pub fn bundles(&self) -> (WeightBundle, WeightBundle) {
        let (model_source, controlnet_source) = if self.from_hub {
            (
                BundleSource::Hub {
                    repo: MODEL_REPO.to_string(),
                    include: [
                        "transformer/",
                        "text_encoder/",
                        "text_encoder_2/",
                        "tokenizer/",
                        "tokenizer_2/",
                        "ae.safetensors",
                    ]
                    .map(String::from)
                    .to_vec(),
                },
                BundleSource::Hub {
                    repo: CONTROLNET_REPO.to_string(),
                    include: ["config.json", "diffusion_pytorch_model"]
                        .map(String::from)
                        .to_vec(),
                },
            )
        } else {
            (
                BundleSource::Archive(self.model_url.clone()),
                BundleSource::Archive(self.controlnet_url.clone()),
            )
        };
        (
            WeightBundle {
                name: MODEL_DIR.to_string(),
                dir: self.root.join(MODEL_DIR),
                source: model_source,
            },
            WeightBundle {
                name: CONTROLNET_DIR.to_string(),
                dir: self.root.join(CONTROLNET_DIR),
                source: controlnet_source,
            },
        )
    }
}

/// Fetches both bundles and validates their safetensors files. Any failure is fatal.
pub fn provision(config: &WeightsConfig) -> Result<WeightPaths> {
    let (model, controlnet) = config.bundles();
    let model = model.ensure()?;
    let controlnet = controlnet.ensure()?;
    for dir in [&model, &controlnet] {
        let checked = verify(dir)?;
        info!(dir = %dir.display(), files = checked, "safetensors headers verified");
    }
    Ok(WeightPaths { model, controlnet })
}

fn open_archive(url: &str) -> Result<Box<dyn Read>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        let client = reqwest::blocking::Client::builder()
            .timeout(None)
            .build()
            .context("failed to create HTTP client")?;
        let response = client
            .get(url)
            .send()
            .with_context(|| format!("failed to download {url}"))?
            .error_for_status()
            .with_context(|| format!("failed to download {url}"))?;
        Ok(Box::new(response))
    } else {
        let path = url.strip_prefix("file://").unwrap_or(url);
        let file = File::open(path).with_context(|| format!("failed to open archive {path}"))?;
        Ok(Box::new(file))
    }
}

/// Unpacks a tar stream into `dest`, transparently handling gzip compression.
pub fn unpack_archive(reader: impl Read, dest: &Path) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let gzipped = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if gzipped {
        Archive::new(GzDecoder::new(reader)).unpack(dest)?;
    } else {
        Archive::new(reader).unpack(dest)?;
    }
    Ok(())
}

/// Extracts into `<dir>.partial`, then renames into `dir`. When the archive holds
/// a single top-level directory, that directory becomes `dir`.
pub fn install_archive(reader: impl Read, dir: &Path) -> Result<()> {
    let mut staging = dir.as_os_str().to_owned();
    staging.push(".partial");
    let staging = PathBuf::from(staging);
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    unpack_archive(reader, &staging)?;

    let entries = std::fs::read_dir(&staging)?.collect::<std::io::Result<Vec<_>>>()?;
    let promoted = match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => only.path(),
        _ => staging.clone(),
    };
    debug!(from = %promoted.display(), to = %dir.display(), "promoting extracted weights");
    std::fs::rename(&promoted, dir)?;
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    Ok(())
}

fn fetch_hub(repo: &str, include: &[String]) -> Result<PathBuf> {
    let api = hf_hub::api::sync::Api::new().context("failed to create hub client")?;
    let api_repo = api.model(repo.to_string());
    let info = api_repo
        .info()
        .with_context(|| format!("failed to list files of {repo}"))?;
    let files: Vec<&str> = info
        .siblings
        .iter()
        .map(|s| s.rfilename.as_str())
        .filter(|name| include.iter().any(|prefix| name.starts_with(prefix.as_str())))
        .collect();
    info!(repo, files = files.len(), "downloading weights from the hub");

    let mut snapshot = None;
    for name in files {
        let path = api_repo
            .get(name)
            .with_context(|| format!("failed to download {name} from {repo}"))?;
        snapshot.get_or_insert(snapshot_root(&path, name)?);
    }
    snapshot.ok_or_else(|| anyhow::anyhow!("no matching files in {repo}"))
}

/// Directory `path` was resolved from, given its repository relative name.
fn snapshot_root(path: &Path, rfilename: &str) -> Result<PathBuf> {
    let depth = Path::new(rfilename).components().count();
    path.ancestors()
        .nth(depth)
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("cannot find snapshot root of {}", path.display()))
}

/// All `*.safetensors` files directly inside `dir`, sorted by name.
pub fn safetensors_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
        .collect::<Vec<_>>();
    if files.is_empty() {
        anyhow::bail!("no safetensors files in {}", dir.display());
    }
    files.sort();
    Ok(files)
}

/// Checks the header of every `*.safetensors` file below `dir`, returning how
/// many were checked. Truncated or corrupt files are errors.
pub fn verify(dir: &Path) -> Result<usize> {
    let mut checked = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)
            .with_context(|| format!("failed to list {}", current.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "safetensors") {
                verify_file(&path)?;
                checked += 1;
            }
        }
    }
    Ok(checked)
}

fn verify_file(path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };
    SafeTensors::read_metadata(&mmap)
        .map_err(|e| anyhow::anyhow!("invalid safetensors file {}: {e:?}", path.display()))?;
    Ok(())
}
