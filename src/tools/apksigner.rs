use crate::android::signature::Fingerprint;
use crate::config::PatchConfig;
use crate::error::PatchResult;
use crate::tools::execute_command;
use log::info;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Runs the `apksigner` and `zipalign` jars through the configured Java runtime.
#[derive(Clone, Debug)]
pub struct ApkSigner {
    java: String,
    apksigner_jar: PathBuf,
    zipalign_jar: PathBuf,
    keystore: PathBuf,
    key_password: String,
}

impl ApkSigner {
    pub fn from_config(config: &PatchConfig) -> Self {
        ApkSigner {
            java: config.java.clone(),
            apksigner_jar: config.apksigner_path(),
            zipalign_jar: config.zipalign_path(),
            keystore: config.keystore.clone(),
            key_password: config.key_password.clone(),
        }
    }

    fn run_jar(&self, jar: &Path, args: Vec<OsString>) -> PatchResult<String> {
        let mut full: Vec<OsString> = vec!["-jar".into(), jar.as_os_str().to_owned()];
        full.extend(args);
        execute_command(&self.java, &full)
    }

    /// Certificate fingerprint of the first signer of `apk`.
    pub fn fingerprint(&self, apk: &Path) -> PatchResult<Fingerprint> {
        let output = self.run_jar(
            &self.apksigner_jar,
            vec![
                "verify".into(),
                "--print-certs-pem".into(),
                apk.as_os_str().to_owned(),
            ],
        )?;
        Fingerprint::from_pem_output(&output)
    }

    /// Align `apk` into `<stem>-aligned.apk` next to it and return the new path.
    pub fn align(&self, apk: &Path) -> PatchResult<PathBuf> {
        let aligned = aligned_path(apk);
        info!("aligning {}", apk.display());
        self.run_jar(
            &self.zipalign_jar,
            vec![apk.as_os_str().to_owned(), aligned.as_os_str().to_owned()],
        )?;
        Ok(aligned)
    }

    /// Sign `apk` in place with the configured keystore (v2 scheme enabled).
    pub fn sign(&self, apk: &Path) -> PatchResult<()> {
        info!("signing {}", apk.display());
        self.run_jar(
            &self.apksigner_jar,
            vec![
                "sign".into(),
                "--ks".into(),
                self.keystore.as_os_str().to_owned(),
                "--v2-signing-enabled".into(),
                "true".into(),
                "--ks-pass".into(),
                format!("pass:{}", self.key_password).into(),
                apk.as_os_str().to_owned(),
            ],
        )
        .map(|_| ())
    }
}

pub fn aligned_path(apk: &Path) -> PathBuf {
    let stem = apk
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    apk.with_file_name(format!("{stem}-aligned.apk"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_names() {
        assert_eq!(
            aligned_path(Path::new("/tmp/work/base.apk")),
            PathBuf::from("/tmp/work/base-aligned.apk")
        );
        assert_eq!(
            aligned_path(Path::new("split_config.en.apk")),
            PathBuf::from("split_config.en-aligned.apk")
        );
    }

    #[test]
    fn tool_paths_come_from_config() {
        let config = PatchConfig {
            assets_dir: PathBuf::from("/opt/stubpatch"),
            ..PatchConfig::default()
        };
        let signer = ApkSigner::from_config(&config);
        assert_eq!(signer.apksigner_jar, PathBuf::from("/opt/stubpatch/apksigner.jar"));
        assert_eq!(signer.zipalign_jar, PathBuf::from("/opt/stubpatch/zipalign-java.jar"));
    }
}
