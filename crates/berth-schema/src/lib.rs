//! Schema layer for berth.
//!
//! Pure data definitions shared by the runtime, gateway and core crates:
//! container and gateway identifiers, container creation options, byte-size
//! units, and service manifests declaring capabilities as ordered lists of
//! gateway configuration fragments.

pub mod manifest;
pub mod options;
pub mod types;
pub mod units;

pub use manifest::{
    load_manifests, parse_manifest_file, parse_manifest_str, Capability, GatewayFragment,
    ManifestError, ManifestKind, ManifestSet, ServiceManifest,
};
pub use options::{parse_container_options, ContainerOptions, OptionsError, DEFAULT_TMPFS_SIZE};
pub use types::{CapabilityName, ContainerId, ContainerName, GatewayId, IdParseError};
pub use units::{parse_byte_size, UnitError};
