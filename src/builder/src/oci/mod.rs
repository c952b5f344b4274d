//! OCI image support for the build pipeline.
//!
//! Registry and archive sources are both normalized into an OCI image
//! layout on disk, which is then squashed into a single root filesystem:
//!
//! - Image reference parsing and registry fetch
//! - OCI image layout parsing (index, manifest, config)
//! - Layer squashing with deletion markers
//!
//! # Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    OCI Image Layout                          │
//! │                                                              │
//! │  staging/                                                    │
//! │  ├── oci-layout           (OCI layout marker)               │
//! │  ├── index.json           (Image index)                     │
//! │  └── blobs/                                                 │
//! │      └── sha256/                                            │
//! │          ├── <manifest>   (Image manifest)                  │
//! │          ├── <config>     (Image configuration)             │
//! │          └── <layers>     (Filesystem layers)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod image;
pub mod layers;
pub mod reference;
pub mod registry;

pub use image::{LayerBlob, OciImage, OciImageConfig};
pub use layers::{LayerCompression, LayerSquasher, LayerStats};
pub use reference::ImageReference;
pub use registry::{FetchOptions, FetchedImage, RegistryAuth, RegistryFetcher};
