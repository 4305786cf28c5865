//! The host side of the fetch gateway.
//!
//! Bundles and packages come from a local directory or an HTTP mirror:
//!
//! ```text
//! <bundles>/<id>.data          raw bundle bytes
//! <bundles>/<id>.meta.json     optional file listing
//! <ctan>/<name>/...            package files (directory source)
//! <ctan>/<name>/<version>/...  historical release
//! <ctan>/<name>.json           {"files": {path: base64}} (HTTP source)
//! <ctan>/<name>/<version>.json
//! ```

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::header::RANGE;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vellum_core::{BundleMeta, FetchRequest, FetchResponse, HostEndpoint, RequestBody, ResponseBody};

/// Where package files of a directory source are mounted.
const PACKAGE_ROOT: &str = "/texlive/texmf-dist/tex/latex";

/// A directory or an HTTP base URL.
#[derive(Debug, Clone)]
pub enum Source {
    Dir(PathBuf),
    Http { client: reqwest::Client, base: String },
}

impl Source {
    /// `http://` and `https://` locations are mirrors, anything else a path.
    pub fn parse(location: &str, client: &reqwest::Client) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Http {
                client: client.clone(),
                base: location.trim_end_matches('/').to_string(),
            }
        } else {
            Self::Dir(PathBuf::from(location))
        }
    }
}

#[derive(Deserialize)]
struct PackageArchive {
    files: BTreeMap<String, String>,
}

/// Answers bundle, range and package requests.
#[derive(Debug, Clone)]
pub struct ResourceStore {
    bundles: Source,
    packages: Option<Source>,
}

impl ResourceStore {
    pub fn new(bundles: Source, packages: Option<Source>) -> Self {
        Self { bundles, packages }
    }

    /// Bundle bytes and listing; `None` when the source has no such bundle.
    pub async fn bundle(&self, id: &str) -> anyhow::Result<Option<(Vec<u8>, Option<BundleMeta>)>> {
        let data = format!("{id}.data");
        let meta = format!("{id}.meta.json");
        let Some(bytes) = get(&self.bundles, &data).await? else {
            return Ok(None);
        };
        let meta = match get(&self.bundles, &meta).await? {
            Some(json) => Some(
                serde_json::from_slice(&json).with_context(|| format!("malformed listing {meta}"))?,
            ),
            None => None,
        };
        Ok(Some((bytes, meta)))
    }

    /// Bytes `start..end` of a bundle.
    pub async fn range(&self, id: &str, start: u64, end: u64) -> anyhow::Result<Option<Vec<u8>>> {
        anyhow::ensure!(end >= start, "range end {end} precedes start {start}");
        let name = format!("{id}.data");
        let len = (end - start) as usize;

        match &self.bundles {
            Source::Dir(dir) => {
                let path = dir.join(&name);
                let mut file = match tokio::fs::File::open(&path).await {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
                };
                file.seek(SeekFrom::Start(start)).await?;
                let mut buf = vec![0; len];
                file.read_exact(&mut buf)
                    .await
                    .with_context(|| format!("reading {start}..{end} of {}", path.display()))?;
                Ok(Some(buf))
            }
            Source::Http { client, base } => {
                if len == 0 {
                    return Ok(Some(Vec::new()));
                }
                let response = client
                    .get(format!("{base}/{name}"))
                    .header(RANGE, format!("bytes={start}-{}", end - 1))
                    .send()
                    .await?;
                match response.status() {
                    StatusCode::NOT_FOUND => Ok(None),
                    StatusCode::PARTIAL_CONTENT => Ok(Some(response.bytes().await?.to_vec())),
                    StatusCode::OK => {
                        // Server ignored the range header.
                        let body = response.bytes().await?;
                        Ok(body.get(start as usize..end as usize).map(<[u8]>::to_vec))
                    }
                    status => anyhow::bail!("{base}/{name}: HTTP {status}"),
                }
            }
        }
    }

    /// Files of a package, virtual path → bytes.
    pub async fn package(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> anyhow::Result<Option<BTreeMap<String, Vec<u8>>>> {
        let Some(source) = &self.packages else {
            return Ok(None);
        };
        let key = match version {
            Some(version) => format!("{name}/{version}"),
            None => name.to_string(),
        };

        match source {
            Source::Dir(dir) => {
                let root = dir.join(&key);
                if !root.is_dir() {
                    return Ok(None);
                }
                let prefix = format!("{PACKAGE_ROOT}/{name}");
                let files = tokio::task::spawn_blocking(move || read_tree(&root, &prefix)).await??;
                Ok(Some(files))
            }
            Source::Http { .. } => {
                let Some(json) = get(source, &format!("{key}.json")).await? else {
                    return Ok(None);
                };
                let archive: PackageArchive = serde_json::from_slice(&json)
                    .with_context(|| format!("malformed package archive for {key}"))?;
                let files = archive
                    .files
                    .into_iter()
                    .map(|(path, data)| Ok((path, STANDARD.decode(data)?)))
                    .collect::<anyhow::Result<BTreeMap<_, _>>>()?;
                Ok(Some(files))
            }
        }
    }

    async fn answer(&self, request: &FetchRequest) -> anyhow::Result<Option<ResponseBody>> {
        let body = match &request.body {
            RequestBody::Bundle { bundle } => {
                self.bundle(bundle)
                    .await?
                    .map(|(bytes, meta)| ResponseBody::Bundle {
                        success: true,
                        bytes,
                        meta,
                    })
            }
            RequestBody::FileRange { bundle, start, end } => self
                .range(bundle, *start, *end)
                .await?
                .map(|bytes| ResponseBody::FileRange {
                    success: true,
                    bytes,
                }),
            RequestBody::CtanPackage {
                name, alt_version, ..
            } => self
                .package(name, alt_version.as_deref())
                .await?
                .map(|files| ResponseBody::CtanPackage {
                    success: true,
                    files,
                }),
        };
        Ok(body)
    }
}

/// Answer gateway requests until the gateway goes away.
///
/// Each request is served on its own task so a slow bundle download does
/// not hold up range reads.
pub fn serve(store: Arc<ResourceStore>, endpoint: HostEndpoint) -> JoinHandle<()> {
    let HostEndpoint {
        mut requests,
        responder,
    } = endpoint;

    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let store = Arc::clone(&store);
            let responder = responder.clone();
            tokio::spawn(async move {
                let kind = request.body.kind();
                let response = match store.answer(&request).await {
                    Ok(Some(body)) => {
                        debug!(%kind, id = %request.id, "request served");
                        FetchResponse { id: request.id, body }
                    }
                    Ok(None) => {
                        debug!(%kind, id = %request.id, "resource not found");
                        FetchResponse::failure(&request)
                    }
                    Err(e) => {
                        warn!(%kind, id = %request.id, error = %e, "request failed");
                        FetchResponse::failure(&request)
                    }
                };
                if !responder.respond(response) {
                    debug!(%kind, "response arrived after the gateway gave up");
                }
            });
        }
    })
}

async fn get(source: &Source, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
    match source {
        Source::Dir(dir) => {
            let path = dir.join(name);
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
            }
        }
        Source::Http { client, base } => {
            let url = format!("{base}/{name}");
            let response = client.get(&url).send().await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
                status => anyhow::bail!("{url}: HTTP {status}"),
            }
        }
    }
}

/// Every file under `root`, keyed by `prefix` joined with its relative path.
fn read_tree(root: &Path, prefix: &str) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let relative = path.strip_prefix(root)?.to_string_lossy().replace('\\', "/");
            files.insert(format!("{prefix}/{relative}"), std::fs::read(&path)?);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_store(root: &Path) -> ResourceStore {
        ResourceStore::new(
            Source::Dir(root.join("bundles")),
            Some(Source::Dir(root.join("ctan"))),
        )
    }

    fn layout() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let bundles = root.path().join("bundles");
        std::fs::create_dir_all(&bundles).unwrap();
        std::fs::write(bundles.join("core.data"), b"0123456789").unwrap();

        let package = root.path().join("ctan/foo/2023/doc");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(root.path().join("ctan/foo/2023/foo.sty"), b"old").unwrap();
        std::fs::write(package.join("README"), b"readme").unwrap();
        root
    }

    #[test]
    fn test_source_parse() {
        let client = reqwest::Client::new();
        assert!(matches!(Source::parse("https://mirror/b/", &client), Source::Http { base, .. } if base == "https://mirror/b"));
        assert!(matches!(Source::parse("./bundles", &client), Source::Dir(_)));
    }

    #[tokio::test]
    async fn test_directory_bundle_and_range() {
        let root = layout();
        let store = dir_store(root.path());

        let (bytes, meta) = store.bundle("core").await.unwrap().unwrap();
        assert_eq!(bytes, b"0123456789");
        assert!(meta.is_none());
        assert!(store.bundle("missing").await.unwrap().is_none());

        assert_eq!(store.range("core", 2, 5).await.unwrap().unwrap(), b"234");
        assert!(store.range("core", 8, 20).await.is_err());
        assert!(store.range("missing", 0, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directory_package_versions() {
        let root = layout();
        let store = dir_store(root.path());

        let files = store.package("foo", Some("2023")).await.unwrap().unwrap();
        let paths: Vec<&str> = files.keys().map(String::as_str).collect();
        assert_eq!(
            paths,
            [
                "/texlive/texmf-dist/tex/latex/foo/doc/README",
                "/texlive/texmf-dist/tex/latex/foo/foo.sty"
            ]
        );
        assert!(store.package("foo", Some("2019")).await.unwrap().is_none());
        assert!(store.package("bar", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_serve_answers_gateway() {
        let root = layout();
        let (gateway, endpoint) = vellum_core::FetchGateway::channel(Default::default());
        serve(Arc::new(dir_store(root.path())), endpoint);

        let range = gateway.fetch_file_range("core", 0, 4).await.unwrap();
        assert_eq!(&*range, b"0123");
        assert!(gateway.fetch_bundle("missing").await.is_err());
    }
}
