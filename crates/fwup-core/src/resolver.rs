//! Image source resolution.
//!
//! Turns what the operator asked for (a raw binary, a `.p1fw` package or a
//! released version) into validated [`FirmwareImage`]s. A package is either
//! a zip archive or a directory; both carry an `info.json` naming the
//! application and GNSS binaries.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument};
use zip::ZipArchive;

use crate::payload::{FirmwareImage, ImageFormat};
use crate::protocol::Component;

/// Package manifest name.
pub const PACKAGE_INFO: &str = "info.json";

/// Package file extension.
pub const PACKAGE_EXTENSION: &str = "p1fw";

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Not found: {0}")]
    NotFound(PathBuf),

    #[error("Release {version} is not available: {reason}")]
    Download { version: String, reason: String },

    #[error("Invalid package {path}: {reason}")]
    InvalidPackage { path: PathBuf, reason: String },

    #[error("Cannot provide {requested} image: {reason}")]
    ComponentMismatch { requested: Component, reason: String },

    #[error("{component} image is empty")]
    EmptyImage { component: Component },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the caller wants flashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSpec {
    /// A raw binary for a single component.
    File { path: PathBuf, component: Component },
    /// Selected components out of a `.p1fw` package.
    Package {
        path: PathBuf,
        components: Vec<Component>,
    },
    /// A released version looked up through the catalog.
    Release { component: Component, version: String },
}

/// Source of released firmware packages.
pub trait ReleaseCatalog: Send + Sync {
    /// Local path of the package for `version`.
    fn fetch(&self, version: &str) -> Result<PathBuf, ResolveError>;
}

/// Catalog backed by a directory of `<version>.p1fw` packages.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl ReleaseCatalog for DirectoryCatalog {
    fn fetch(&self, version: &str) -> Result<PathBuf, ResolveError> {
        let archive = self
            .root
            .join(format!("{}.{}", version, PACKAGE_EXTENSION));
        if archive.exists() {
            return Ok(archive);
        }
        // Unpacked release
        let dir = self.root.join(version);
        if dir.join(PACKAGE_INFO).exists() {
            return Ok(dir);
        }
        Err(ResolveError::Download {
            version: version.to_string(),
            reason: format!("no package in {}", self.root.display()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PackageInfo {
    fusion_engine: Option<PackageEntry>,
    gnss_receiver: Option<PackageEntry>,
}

#[derive(Debug, Deserialize)]
struct PackageEntry {
    filename: String,
    #[serde(default)]
    version: Option<String>,
}

impl PackageInfo {
    fn entry(&self, component: Component) -> Option<&PackageEntry> {
        match component {
            Component::Application => self.fusion_engine.as_ref(),
            Component::Gnss => self.gnss_receiver.as_ref(),
            Component::Bootloader => None,
        }
    }
}

/// Opened package, archive or directory.
enum Package {
    Zip(ZipArchive<File>),
    Dir(PathBuf),
}

impl Package {
    fn open(path: &Path) -> Result<Self, ResolveError> {
        if path.is_dir() {
            return Ok(Package::Dir(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let archive = ZipArchive::new(file).map_err(|e| invalid(path, e))?;
        Ok(Package::Zip(archive))
    }

    /// Contents of `name`, `None` when the package has no such file.
    fn read(&mut self, path: &Path, name: &str) -> Result<Option<Vec<u8>>, ResolveError> {
        match self {
            Package::Zip(archive) => {
                let mut entry = match archive.by_name(name) {
                    Ok(entry) => entry,
                    Err(zip::result::ZipError::FileNotFound) => return Ok(None),
                    Err(e) => return Err(invalid(path, e)),
                };
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;
                Ok(Some(data))
            }
            Package::Dir(dir) => {
                let file = dir.join(name);
                if !file.is_file() {
                    return Ok(None);
                }
                Ok(Some(std::fs::read(file)?))
            }
        }
    }
}

fn invalid(path: &Path, reason: impl ToString) -> ResolveError {
    ResolveError::InvalidPackage {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Resolves [`ImageSpec`]s into images ready for an update session.
#[derive(Default)]
pub struct Resolver {
    catalog: Option<Box<dyn ReleaseCatalog>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog<C: ReleaseCatalog + 'static>(mut self, catalog: C) -> Self {
        self.catalog = Some(Box::new(catalog));
        self
    }

    /// Resolve `spec` into images, GNSS before application.
    #[instrument(skip(self))]
    pub fn resolve(&self, spec: &ImageSpec) -> Result<Vec<FirmwareImage>, ResolveError> {
        match spec {
            ImageSpec::File { path, component } => {
                Ok(vec![self.resolve_file(path, *component)?])
            }
            ImageSpec::Package { path, components } => {
                self.resolve_package(path, components, None)
            }
            ImageSpec::Release { component, version } => {
                let catalog = self.catalog.as_ref().ok_or_else(|| ResolveError::Download {
                    version: version.clone(),
                    reason: "no release catalog configured".to_string(),
                })?;
                let path = catalog.fetch(version)?;
                info!(version = %version, path = %path.display(), "Using release package");
                self.resolve_package(&path, &[*component], Some(version))
            }
        }
    }

    fn resolve_file(&self, path: &Path, component: Component) -> Result<FirmwareImage, ResolveError> {
        if !path.exists() {
            return Err(ResolveError::NotFound(path.to_path_buf()));
        }
        let data = std::fs::read(path)?;
        if data.is_empty() {
            return Err(ResolveError::EmptyImage { component });
        }
        debug!(path = %path.display(), len = data.len(), "Loaded raw image");
        Ok(FirmwareImage::new(data, component, None, ImageFormat::Raw))
    }

    fn resolve_package(
        &self,
        path: &Path,
        components: &[Component],
        release: Option<&str>,
    ) -> Result<Vec<FirmwareImage>, ResolveError> {
        if !path.exists() {
            return Err(ResolveError::NotFound(path.to_path_buf()));
        }
        if let Some(&requested) = components.iter().find(|c| **c == Component::Bootloader) {
            return Err(ResolveError::ComponentMismatch {
                requested,
                reason: "packages do not carry a bootloader".to_string(),
            });
        }

        let mut package = Package::open(path)?;
        let manifest = package
            .read(path, PACKAGE_INFO)?
            .ok_or_else(|| invalid(path, format!("no {} found", PACKAGE_INFO)))?;
        let info: PackageInfo = serde_json::from_slice(&manifest).map_err(|e| invalid(path, e))?;

        let mut images = Vec::new();
        for component in [Component::Gnss, Component::Application] {
            if !components.contains(&component) {
                continue;
            }
            let entry = info
                .entry(component)
                .ok_or_else(|| ResolveError::ComponentMismatch {
                    requested: component,
                    reason: format!("{} does not declare it", PACKAGE_INFO),
                })?;
            let data = package
                .read(path, &entry.filename)?
                .ok_or_else(|| invalid(path, format!("{} is missing", entry.filename)))?;
            if data.is_empty() {
                return Err(ResolveError::EmptyImage { component });
            }

            let version = entry
                .version
                .clone()
                .or_else(|| release.map(str::to_string));
            debug!(component = %component, file = %entry.filename, len = data.len(), "Extracted image");
            images.push(FirmwareImage::new(data, component, version, ImageFormat::Packaged));
        }
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    const INFO: &str = r#"{
        "fusion_engine": { "filename": "app.bin", "version": "v1.21.3" },
        "gnss_receiver": { "filename": "gnss.bin" }
    }"#;

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, data) in files {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn both() -> Vec<Component> {
        vec![Component::Application, Component::Gnss]
    }

    #[test]
    fn test_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let images = Resolver::new()
            .resolve(&ImageSpec::File {
                path,
                component: Component::Application,
            })
            .unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].format(), ImageFormat::Raw);
        assert_eq!(images[0].data(), &[1, 2, 3]);
    }

    #[test]
    fn test_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new();

        let missing = resolver.resolve(&ImageSpec::File {
            path: dir.path().join("nope.bin"),
            component: Component::Gnss,
        });
        assert!(matches!(missing, Err(ResolveError::NotFound(_))));

        let empty = dir.path().join("empty.bin");
        std::fs::write(&empty, b"").unwrap();
        let res = resolver.resolve(&ImageSpec::File {
            path: empty,
            component: Component::Gnss,
        });
        assert!(matches!(res, Err(ResolveError::EmptyImage { .. })));
    }

    #[test]
    fn test_zip_package_orders_gnss_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.p1fw");
        write_zip(
            &path,
            &[
                ("info.json", INFO.as_bytes()),
                ("app.bin", b"APPLICATION"),
                ("gnss.bin", b"GNSS"),
            ],
        );

        let images = Resolver::new()
            .resolve(&ImageSpec::Package {
                path,
                components: both(),
            })
            .unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].component(), Component::Gnss);
        assert_eq!(images[0].data(), b"GNSS");
        assert_eq!(images[1].component(), Component::Application);
        assert_eq!(images[1].version(), Some("v1.21.3"));
        assert_eq!(images[1].format(), ImageFormat::Packaged);
    }

    #[test]
    fn test_directory_package_single_component() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("info.json"), INFO).unwrap();
        std::fs::write(dir.path().join("app.bin"), b"APP").unwrap();

        // The GNSS binary is absent but not requested.
        let images = Resolver::new()
            .resolve(&ImageSpec::Package {
                path: dir.path().to_path_buf(),
                components: vec![Component::Application],
            })
            .unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].data(), b"APP");
    }

    #[test]
    fn test_package_errors() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new();

        let no_info = dir.path().join("noinfo.p1fw");
        write_zip(&no_info, &[("app.bin", b"APP")]);
        assert!(matches!(
            resolver.resolve(&ImageSpec::Package {
                path: no_info,
                components: both(),
            }),
            Err(ResolveError::InvalidPackage { .. })
        ));

        let not_zip = dir.path().join("garbage.p1fw");
        std::fs::write(&not_zip, b"definitely not a zip").unwrap();
        assert!(matches!(
            resolver.resolve(&ImageSpec::Package {
                path: not_zip,
                components: both(),
            }),
            Err(ResolveError::InvalidPackage { .. })
        ));

        let missing_bin = dir.path().join("missing.p1fw");
        write_zip(&missing_bin, &[("info.json", INFO.as_bytes()), ("app.bin", b"APP")]);
        assert!(matches!(
            resolver.resolve(&ImageSpec::Package {
                path: missing_bin,
                components: both(),
            }),
            Err(ResolveError::InvalidPackage { .. })
        ));
    }

    #[test]
    fn test_component_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-only.p1fw");
        write_zip(
            &path,
            &[
                ("info.json", br#"{"fusion_engine": {"filename": "app.bin"}}"#),
                ("app.bin", b"APP"),
            ],
        );
        let resolver = Resolver::new();

        let res = resolver.resolve(&ImageSpec::Package {
            path: path.clone(),
            components: vec![Component::Gnss],
        });
        assert!(matches!(
            res,
            Err(ResolveError::ComponentMismatch {
                requested: Component::Gnss,
                ..
            })
        ));

        let res = resolver.resolve(&ImageSpec::Package {
            path,
            components: vec![Component::Bootloader],
        });
        assert!(matches!(
            res,
            Err(ResolveError::ComponentMismatch {
                requested: Component::Bootloader,
                ..
            })
        ));
    }

    #[test]
    fn test_release_from_directory_catalog() {
        let dir = tempfile::tempdir().unwrap();
        write_zip(
            &dir.path().join("lg69t-ap-1.2.0.p1fw"),
            &[
                ("info.json", br#"{"fusion_engine": {"filename": "app.bin"}, "gnss_receiver": {"filename": "gnss.bin"}}"#),
                ("app.bin", b"APP"),
                ("gnss.bin", b"GNSS"),
            ],
        );
        let resolver = Resolver::new().with_catalog(DirectoryCatalog::new(dir.path()));

        let images = resolver
            .resolve(&ImageSpec::Release {
                component: Component::Application,
                version: "lg69t-ap-1.2.0".to_string(),
            })
            .unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].version(), Some("lg69t-ap-1.2.0"));

        let res = resolver.resolve(&ImageSpec::Release {
            component: Component::Application,
            version: "9.9.9".to_string(),
        });
        assert!(matches!(res, Err(ResolveError::Download { .. })));
    }

    #[test]
    fn test_release_without_catalog() {
        let res = Resolver::new().resolve(&ImageSpec::Release {
            component: Component::Gnss,
            version: "1.0".to_string(),
        });
        assert!(matches!(res, Err(ResolveError::Download { .. })));
    }
}
