//! End-to-end flows: pull from a device, patch, align and sign.

use crate::android::archive::{self, RewriteInput, RewriteReport};
use crate::android::binary_xml::AndroidManifest;
use crate::android::manifest_patch::ManifestPatch;
use crate::android::ranks::AttributeRanks;
use crate::android::signature::Fingerprint;
use crate::config::PatchConfig;
use crate::error::{PatchError, PatchResult};
use crate::tools::apksigner::ApkSigner;
use crate::tools::device::DeviceTransport;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

pub const BASE_APK: &str = "base.apk";

/// Shared state for one patch run.
pub struct Patcher<'a> {
    pub config: &'a PatchConfig,
    pub ranks: &'a AttributeRanks,
    pub patch: ManifestPatch,
}

impl<'a> Patcher<'a> {
    pub fn new(config: &'a PatchConfig, ranks: &'a AttributeRanks, patch: ManifestPatch) -> Self {
        Patcher {
            config,
            ranks,
            patch,
        }
    }

    /// Patch the APK at `source` into `dest` using the configured payload.
    pub fn patch_apk(
        &self,
        source: &Path,
        dest: &Path,
        fingerprint: &Fingerprint,
    ) -> PatchResult<RewriteReport> {
        let payload = self.config.read_payload()?;
        self.patch_apk_with_payload(source, dest, fingerprint, &payload)
    }

    pub fn patch_apk_with_payload(
        &self,
        source: &Path,
        dest: &Path,
        fingerprint: &Fingerprint,
        payload: &[u8],
    ) -> PatchResult<RewriteReport> {
        let manifest = archive::read_manifest_file(source)?;
        let manifest = self.patch.apply_to_bytes(&manifest, self.ranks)?;
        let input = RewriteInput {
            manifest: &manifest,
            fingerprint,
            payload,
            marker_name: &self.config.marker_entry,
        };
        let report = archive::rewrite_apk_file(source, dest, &input)?;
        if let Some(dropped) = &report.dropped_payload {
            info!("replaced previous payload {dropped} with {}", report.payload_entry);
        }
        Ok(report)
    }

    /// The manifest of `source` as text XML after patching.
    pub fn render_patched_manifest(&self, source: &Path) -> PatchResult<String> {
        let manifest = archive::read_manifest_file(source)?;
        let patched = self.patch.apply_to_bytes(&manifest, self.ranks)?;
        Ok(AndroidManifest::from_bytes(&patched)?.to_xml_string()?)
    }

    /// Pull every APK of `package`, patch `base.apk`, then align and sign them all into
    /// `out_dir`. Returns the paths of the signed archives.
    pub fn patch_installed_package<T: DeviceTransport>(
        &self,
        device: &T,
        signer: &ApkSigner,
        package: &str,
        out_dir: &Path,
    ) -> PatchResult<Vec<PathBuf>> {
        self.config.ensure_keystore()?;
        let payload = self.config.read_payload()?;
        let work = tempfile::Builder::new().prefix("stubpatch-").tempdir()?;

        let pulled = pull_package(device, package, work.path())?;
        let base = work.path().join(BASE_APK);
        let fingerprint = signer.fingerprint(&base)?;
        self.patch_apk_with_payload(&base, &base, &fingerprint, &payload)?;

        let mut signed = Vec::new();
        for apk in &pulled {
            let aligned = signer.align(apk)?;
            signer.sign(&aligned)?;
            signed.push(aligned);
        }

        fs::create_dir_all(out_dir)?;
        let mut outputs = Vec::new();
        for aligned in signed {
            let Some(name) = aligned.file_name() else {
                continue;
            };
            let dest = out_dir.join(name);
            move_file(&aligned, &dest)?;
            outputs.push(dest);
        }
        info!("patched {package} into {}", out_dir.display());
        Ok(outputs)
    }
}

/// Pull the base and split APKs of `package` into `dir`, keeping their file names.
pub fn pull_package<T: DeviceTransport>(
    device: &T,
    package: &str,
    dir: &Path,
) -> PatchResult<Vec<PathBuf>> {
    let mut pulled = Vec::new();
    for remote in device.list_installed_package_paths(package)? {
        let name = remote.rsplit('/').next().unwrap_or(remote.as_str());
        if name.is_empty() {
            return Err(PatchError::Tool(format!("unusable package path '{remote}'")));
        }
        let local = dir.join(name);
        device.pull_file(&remote, &local)?;
        pulled.push(local);
    }
    if !pulled.iter().any(|path| path.ends_with(BASE_APK)) {
        return Err(PatchError::structural(format!(
            "{package} has no {BASE_APK} among its installed paths"
        )));
    }
    Ok(pulled)
}

// Falls back to copying when the work directory lives on another filesystem.
fn move_file(from: &Path, to: &Path) -> PatchResult<()> {
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}
