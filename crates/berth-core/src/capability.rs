//! Capability registry: capability names to ordered gateway fragments.
//!
//! Built once at agent startup from the Standard and Default manifest
//! locations and read-only afterwards.

use crate::CoreError;
use berth_schema::{
    load_manifests, CapabilityName, GatewayFragment, GatewayId, ManifestKind, ServiceManifest,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    standard: BTreeMap<CapabilityName, Vec<GatewayFragment>>,
    defaults: BTreeMap<CapabilityName, Vec<GatewayFragment>>,
}

impl CapabilityRegistry {
    /// Load every manifest from both locations. Unparseable files are skipped
    /// with a warning; an unusable location fails the load.
    pub fn load(standard_dir: &Path, default_dir: &Path) -> Result<Self, CoreError> {
        let mut manifests = Vec::new();
        for (location, kind) in [
            (standard_dir, ManifestKind::Standard),
            (default_dir, ManifestKind::Default),
        ] {
            let set = load_manifests(location, kind)?;
            for (path, err) in &set.skipped {
                warn!("skipping service manifest {}: {err}", path.display());
            }
            debug!(
                "{} {kind:?} manifest(s) loaded from {}",
                set.manifests.len(),
                location.display()
            );
            manifests.extend(set.manifests);
        }
        let registry = Self::from_manifests(manifests)?;
        info!(
            "capabilities: {} standard, {} default",
            registry.standard.len(),
            registry.defaults.len()
        );
        Ok(registry)
    }

    /// Repeated names are merged: later fragments are appended to the first
    /// declaration. A name may not be both standard and default.
    pub fn from_manifests(
        manifests: impl IntoIterator<Item = ServiceManifest>,
    ) -> Result<Self, CoreError> {
        let mut registry = Self::default();
        for manifest in manifests {
            let target = match manifest.kind {
                ManifestKind::Standard => &mut registry.standard,
                ManifestKind::Default => &mut registry.defaults,
            };
            for capability in manifest.capabilities {
                target
                    .entry(capability.name)
                    .or_default()
                    .extend(capability.gateways);
            }
        }

        if let Some(name) = registry
            .standard
            .keys()
            .find(|name| registry.defaults.contains_key(*name))
        {
            return Err(CoreError::DuplicateCapability(name.to_string()));
        }
        Ok(registry)
    }

    /// Names a client may request. Default capabilities are implicit and never listed.
    pub fn standard_names(&self) -> Vec<CapabilityName> {
        self.standard.keys().cloned().collect()
    }

    pub fn default_names(&self) -> Vec<CapabilityName> {
        self.defaults.keys().cloned().collect()
    }

    pub fn has_defaults(&self) -> bool {
        self.defaults.values().any(|fragments| !fragments.is_empty())
    }

    pub fn fragments(&self, name: &str) -> Option<&[GatewayFragment]> {
        self.standard.get(name).map(Vec::as_slice)
    }

    /// Resolve requested names into `(gateway, fragment)` pairs.
    ///
    /// Default capabilities come first when `include_defaults` is set, then the
    /// requested ones in request order; a name requested twice counts once.
    /// Any unknown capability or gateway id fails the whole resolution.
    pub fn resolve(
        &self,
        names: &[CapabilityName],
        include_defaults: bool,
    ) -> Result<Vec<(GatewayId, serde_json::Value)>, CoreError> {
        let mut seen = BTreeSet::new();
        let mut requested = Vec::with_capacity(names.len());
        for name in names {
            let fragments = self
                .standard
                .get(name)
                .ok_or_else(|| CoreError::UnknownCapability(name.to_string()))?;
            if seen.insert(name) {
                requested.push(fragments);
            }
        }

        let defaults: Vec<&Vec<GatewayFragment>> = if include_defaults {
            self.defaults.values().collect()
        } else {
            Vec::new()
        };

        defaults
            .into_iter()
            .chain(requested)
            .flatten()
            .map(|fragment| {
                let id = fragment
                    .gateway_id
                    .parse::<GatewayId>()
                    .map_err(|_| CoreError::UnknownGateway(fragment.gateway_id.clone()))?;
                Ok((id, fragment.config.clone()))
            })
            .collect()
    }
}
