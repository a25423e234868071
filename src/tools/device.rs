use crate::error::{PatchError, PatchResult};
use crate::tools::execute_command;
use log::info;
use std::ffi::OsString;
use std::path::Path;

/// Access to the device that holds the installed application.
pub trait DeviceTransport {
    /// Remote paths of every APK (base and splits) installed for `package`.
    fn list_installed_package_paths(&self, package: &str) -> PatchResult<Vec<String>>;

    fn pull_file(&self, remote: &str, local: &Path) -> PatchResult<()>;
}

/// [`DeviceTransport`] over the `adb` command line client.
#[derive(Clone, Debug)]
pub struct AdbDevice {
    adb: String,
    serial: String,
}

impl AdbDevice {
    pub fn new(adb: impl Into<String>, serial: impl Into<String>) -> Self {
        AdbDevice {
            adb: adb.into(),
            serial: serial.into(),
        }
    }

    /// Connect to the first device in the `adb devices` list.
    pub fn first_attached(adb: impl Into<String>) -> PatchResult<Self> {
        let adb = adb.into();
        let listing = execute_command(&adb, &["devices"])?;
        let serial = parse_device_list(&listing)
            .into_iter()
            .next()
            .ok_or_else(|| PatchError::Tool("no device is attached".to_string()))?;
        info!("using device {serial}");
        Ok(AdbDevice::new(adb, serial))
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn run(&self, args: &[&str]) -> PatchResult<String> {
        let mut full = vec!["-s", self.serial.as_str()];
        full.extend_from_slice(args);
        execute_command(&self.adb, &full)
    }
}

impl DeviceTransport for AdbDevice {
    fn list_installed_package_paths(&self, package: &str) -> PatchResult<Vec<String>> {
        let output = self.run(&["shell", "pm", "path", package])?;
        let paths = parse_package_paths(&output);
        if paths.is_empty() {
            return Err(PatchError::Tool(format!(
                "package {package} is not installed on {}",
                self.serial
            )));
        }
        Ok(paths)
    }

    fn pull_file(&self, remote: &str, local: &Path) -> PatchResult<()> {
        info!("pulling {remote}");
        let args: Vec<OsString> = vec![
            "-s".into(),
            self.serial.as_str().into(),
            "pull".into(),
            remote.into(),
            local.as_os_str().to_owned(),
        ];
        execute_command(&self.adb, &args).map(|_| ())
    }
}

/// Paths from `pm path` output (`package:/data/app/.../base.apk` per line).
pub fn parse_package_paths(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect()
}

/// Serials of devices in the `device` state from `adb devices` output.
pub fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_paths_include_splits() {
        let output = "package:/data/app/~~x==/com.example-1/base.apk\r\n\
                      package:/data/app/~~x==/com.example-1/split_config.arm64_v8a.apk\n\n";
        assert_eq!(
            parse_package_paths(output),
            vec![
                "/data/app/~~x==/com.example-1/base.apk",
                "/data/app/~~x==/com.example-1/split_config.arm64_v8a.apk",
            ]
        );
        assert!(parse_package_paths("").is_empty());
    }

    #[test]
    fn device_list_skips_offline_and_unauthorized() {
        let output = "* daemon started successfully\n\
                      List of devices attached\n\
                      emulator-5554\toffline\n\
                      R58M\tunauthorized\n\
                      0123456789ABCDEF\tdevice\n\n";
        assert_eq!(parse_device_list(output), vec!["0123456789ABCDEF"]);
    }
}
