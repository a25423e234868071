//! Patcher configuration.
//!
//! Every field has a default, so a config file only needs to list what it changes:
//!
//! ```json
//! { "shared_user_id": "com.example.shared", "keystore": "/secure/KEY.jks" }
//! ```

use crate::error::{PatchError, PatchResult};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PatchConfig {
    /// Value written to `android:sharedUserId` on `<manifest>`.
    pub shared_user_id: String,
    /// Value written to `android:appComponentFactory` on `<application>`.
    pub component_factory: String,
    /// Archive entry recording the original signing certificate.
    pub marker_entry: String,
    /// Base directory for the relative tool and payload paths below.
    pub assets_dir: PathBuf,
    pub payload: PathBuf,
    pub apksigner_jar: PathBuf,
    pub zipalign_jar: PathBuf,
    pub keystore: PathBuf,
    pub key_password: String,
    pub java: String,
    pub adb: String,
}

impl Default for PatchConfig {
    fn default() -> Self {
        PatchConfig {
            shared_user_id: "dev.stubpatch.shared".to_string(),
            component_factory: "dev.stubpatch.stub.StubAppComponentFactory".to_string(),
            marker_entry: "stubpatch.orig.sig".to_string(),
            assets_dir: PathBuf::from("assets"),
            payload: PathBuf::from("stub.dex"),
            apksigner_jar: PathBuf::from("apksigner.jar"),
            zipalign_jar: PathBuf::from("zipalign-java.jar"),
            keystore: PathBuf::from("KEY.jks"),
            key_password: "aaaaaa".to_string(),
            java: "java".to_string(),
            adb: "adb".to_string(),
        }
    }
}

impl PatchConfig {
    pub fn from_file(path: impl AsRef<Path>) -> PatchResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| PatchError::Config(format!("reading {}: {err}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|err| PatchError::Config(format!("parsing {}: {err}", path.display())))
    }

    /// Resolve a configured path against `assets_dir` unless it is absolute.
    pub fn asset(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.assets_dir.join(path)
        }
    }

    pub fn payload_path(&self) -> PathBuf {
        self.asset(&self.payload)
    }

    pub fn apksigner_path(&self) -> PathBuf {
        self.asset(&self.apksigner_jar)
    }

    pub fn zipalign_path(&self) -> PathBuf {
        self.asset(&self.zipalign_jar)
    }

    pub fn read_payload(&self) -> PatchResult<Vec<u8>> {
        let path = self.payload_path();
        fs::read(&path)
            .map_err(|err| PatchError::Config(format!("reading payload {}: {err}", path.display())))
    }

    /// Fails early with instructions when the signing keystore has not been created yet.
    pub fn ensure_keystore(&self) -> PatchResult<()> {
        if self.keystore.is_file() {
            return Ok(());
        }
        Err(PatchError::Config(format!(
            "keystore {} does not exist; create it with \
             `keytool -genkey -v -keystore {} -keyalg RSA -keysize 2048 -validity 10000` \
             using the configured key password",
            self.keystore.display(),
            self.keystore.display()
        )))
    }
}
