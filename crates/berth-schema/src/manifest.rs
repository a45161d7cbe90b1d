use crate::types::CapabilityName;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read service manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse service manifest: {0}")]
    ParseJson(#[from] serde_json::Error),
    #[error("unsupported service manifest version: '{0}', expected \"1\"")]
    UnsupportedVersion(String),
    #[error("capability name must not be empty")]
    EmptyCapabilityName,
    #[error("gateway id must not be empty in capability '{0}'")]
    EmptyGatewayId(String),
    #[error("config of gateway '{gateway}' in capability '{capability}' is not an array")]
    ConfigNotArray { capability: String, gateway: String },
    #[error("refusing to scan '/' for service manifests")]
    RootDirectory,
    #[error("'{0}' is not a JSON service manifest")]
    NotJson(PathBuf),
}

/// Whether a manifest's capabilities must be requested or are always applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestKind {
    Standard,
    Default,
}

/// One `(gateway id, config fragment)` pair of a capability.
///
/// The id is kept as written so that an unknown gateway is reported when the
/// capability is applied, not when it is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayFragment {
    #[serde(rename = "id")]
    pub gateway_id: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: CapabilityName,
    #[serde(default)]
    pub gateways: Vec<GatewayFragment>,
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    version: Option<String>,
    capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceManifest {
    pub kind: ManifestKind,
    pub source: Option<PathBuf>,
    pub capabilities: Vec<Capability>,
}

/// Manifests loaded from one location plus the files that were skipped.
#[derive(Debug, Default)]
pub struct ManifestSet {
    pub manifests: Vec<ServiceManifest>,
    pub skipped: Vec<(PathBuf, ManifestError)>,
}

pub fn parse_manifest_str(input: &str, kind: ManifestKind) -> Result<ServiceManifest, ManifestError> {
    let doc: ManifestDocument = serde_json::from_str(input)?;
    if let Some(version) = doc.version.as_deref() {
        if version != "1" {
            return Err(ManifestError::UnsupportedVersion(version.to_owned()));
        }
    }

    for cap in &doc.capabilities {
        if cap.name.trim().is_empty() {
            return Err(ManifestError::EmptyCapabilityName);
        }
        for fragment in &cap.gateways {
            if fragment.gateway_id.trim().is_empty() {
                return Err(ManifestError::EmptyGatewayId(cap.name.to_string()));
            }
            if !fragment.config.is_array() {
                return Err(ManifestError::ConfigNotArray {
                    capability: cap.name.to_string(),
                    gateway: fragment.gateway_id.clone(),
                });
            }
        }
    }

    Ok(ServiceManifest {
        kind,
        source: None,
        capabilities: doc.capabilities,
    })
}

pub fn parse_manifest_file(path: &Path, kind: ManifestKind) -> Result<ServiceManifest, ManifestError> {
    if !is_json_file(path) {
        return Err(ManifestError::NotJson(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;
    let mut manifest = parse_manifest_str(&content, kind)?;
    manifest.source = Some(path.to_path_buf());
    Ok(manifest)
}

fn is_json_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Load every `*.json` manifest directly inside `location`, in file name order.
///
/// `location` may also name a single manifest file. A missing location yields
/// an empty set; files that fail to parse are reported in
/// [`ManifestSet::skipped`] rather than failing the whole load.
pub fn load_manifests(location: &Path, kind: ManifestKind) -> Result<ManifestSet, ManifestError> {
    if location == Path::new("/") {
        return Err(ManifestError::RootDirectory);
    }
    if !location.exists() {
        return Ok(ManifestSet::default());
    }
    if location.is_file() {
        return Ok(ManifestSet {
            manifests: vec![parse_manifest_file(location, kind)?],
            skipped: Vec::new(),
        });
    }

    let mut files: Vec<PathBuf> = fs::read_dir(location)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_json_file(path))
        .collect();
    files.sort();

    let mut set = ManifestSet::default();
    for path in files {
        match parse_manifest_file(&path, kind) {
            Ok(manifest) => set.manifests.push(manifest),
            Err(e) => set.skipped.push((path, e)),
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "version": "1",
        "capabilities": [
            {
                "name": "com.example.sound",
                "gateways": [
                    {"id": "pulseaudio", "config": [{"audio": true}]},
                    {"id": "env", "config": [{"name": "AUDIO", "value": "1"}]}
                ]
            },
            {"name": "com.example.empty", "gateways": []}
        ]
    }"#;

    #[test]
    fn parses_capabilities_in_order() {
        let m = parse_manifest_str(SAMPLE, ManifestKind::Standard).unwrap();
        assert_eq!(m.capabilities.len(), 2);
        let sound = &m.capabilities[0];
        assert_eq!(sound.name, "com.example.sound");
        assert_eq!(sound.gateways[0].gateway_id, "pulseaudio");
        assert_eq!(sound.gateways[1].gateway_id, "env");
        assert!(m.capabilities[1].gateways.is_empty());
    }

    #[test]
    fn version_is_optional_but_checked() {
        assert!(parse_manifest_str(r#"{"capabilities": []}"#, ManifestKind::Default).is_ok());
        assert!(matches!(
            parse_manifest_str(r#"{"version": "2", "capabilities": []}"#, ManifestKind::Default),
            Err(ManifestError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn rejects_structural_errors() {
        assert!(matches!(
            parse_manifest_str(r#"{"version": "1"}"#, ManifestKind::Standard),
            Err(ManifestError::ParseJson(_))
        ));
        assert!(matches!(
            parse_manifest_str(
                r#"{"capabilities": [{"name": "", "gateways": []}]}"#,
                ManifestKind::Standard
            ),
            Err(ManifestError::EmptyCapabilityName)
        ));
        assert!(matches!(
            parse_manifest_str(
                r#"{"capabilities": [{"name": "a", "gateways": [{"id": "env", "config": {}}]}]}"#,
                ManifestKind::Standard
            ),
            Err(ManifestError::ConfigNotArray { .. })
        ));
    }

    #[test]
    fn loads_json_files_and_skips_broken_ones() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.json"), SAMPLE).unwrap();
        fs::write(
            dir.path().join("a.json"),
            r#"{"capabilities": [{"name": "first", "gateways": []}]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let set = load_manifests(dir.path(), ManifestKind::Standard).unwrap();
        assert_eq!(set.manifests.len(), 2);
        assert_eq!(set.manifests[0].capabilities[0].name, "first");
        assert_eq!(set.skipped.len(), 1);
        assert!(set.skipped[0].0.ends_with("broken.json"));
    }

    #[test]
    fn missing_location_is_empty_and_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let set = load_manifests(&dir.path().join("absent"), ManifestKind::Default).unwrap();
        assert!(set.manifests.is_empty());
        assert!(matches!(
            load_manifests(Path::new("/"), ManifestKind::Default),
            Err(ManifestError::RootDirectory)
        ));
    }

    #[test]
    fn single_file_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("only.json");
        fs::write(&path, SAMPLE).unwrap();
        let set = load_manifests(&path, ManifestKind::Default).unwrap();
        assert_eq!(set.manifests.len(), 1);
        assert_eq!(set.manifests[0].source.as_deref(), Some(path.as_path()));
        assert_eq!(set.manifests[0].kind, ManifestKind::Default);
    }
}
