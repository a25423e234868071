//! # Stubpatch
//!
//! Patches an installed Android application so that a stub `classes<N>.dex` is loaded in its
//! process. The manifest gains a shared user id and an `appComponentFactory` pointing at the stub,
//! and the archive gains the payload as its next executable unit. Patching an already patched
//! APK replaces the previous payload and keeps the original signing fingerprint.
//!
//! ```no_run
//!  use stubpatch::android::manifest_patch::ManifestPatch;
//!  use stubpatch::android::ranks::AttributeRanks;
//!  use stubpatch::android::signature::Fingerprint;
//!  use stubpatch::config::PatchConfig;
//!  use stubpatch::pipeline::Patcher;
//!  use std::path::Path;
//!
//!  let config = PatchConfig::default();
//!  let ranks = AttributeRanks::builtin().unwrap();
//!  let patcher = Patcher::new(&config, ranks, ManifestPatch::from_config(&config));
//!  let fingerprint = Fingerprint::new("3082...");
//!  let report = patcher
//!      .patch_apk(Path::new("base.apk"), Path::new("patched.apk"), &fingerprint)
//!      .unwrap();
//!  println!("payload written as {}", report.payload_entry);
//! ```

pub mod android;
pub mod config;
pub mod error;
pub mod pipeline;
#[cfg(test)]
mod tests;
pub mod tools;

pub use error::{PatchError, PatchResult};
