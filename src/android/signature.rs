use crate::error::{PatchError, PatchResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Signing certificate of the original application: lowercase hex of its DER encoding.
///
/// The patcher never interprets the value. It is recorded in the marker entry on the first
/// patch and carried forward unchanged on every later one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Fingerprint(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Extract the first certificate from `apksigner verify --print-certs-pem` output.
    pub fn from_pem_output(output: &str) -> PatchResult<Self> {
        let mut body = String::new();
        let mut inside = false;
        for line in output.lines().map(str::trim) {
            if line == PEM_BEGIN {
                inside = true;
            } else if line == PEM_END && inside {
                let der = STANDARD
                    .decode(body.as_bytes())
                    .map_err(|err| PatchError::Tool(format!("certificate is not valid base64: {err}")))?;
                return Ok(Fingerprint(hex::encode(der)));
            } else if inside {
                body.push_str(line);
            }
        }
        Err(PatchError::Tool(
            "apksigner output contains no PEM certificate".to_string(),
        ))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_certificate_is_hex_encoded() {
        let output = "\
Signer #1 certificate DN: CN=Example
Signer #1 certificate SHA-256 digest: 00
-----BEGIN CERTIFICATE-----
3q2+7w==
-----END CERTIFICATE-----
-----BEGIN CERTIFICATE-----
AAAA
-----END CERTIFICATE-----
";
        let fingerprint = Fingerprint::from_pem_output(output).unwrap();
        assert_eq!(fingerprint.as_str(), "deadbeef");
    }

    #[test]
    fn multi_line_body_is_joined() {
        let output = "-----BEGIN CERTIFICATE-----\n3q2+\n7w==\n-----END CERTIFICATE-----\n";
        assert_eq!(Fingerprint::from_pem_output(output).unwrap().to_string(), "deadbeef");
    }

    #[test]
    fn output_without_certificate_is_a_tool_error() {
        assert!(matches!(
            Fingerprint::from_pem_output("DOES NOT VERIFY"),
            Err(PatchError::Tool(_))
        ));
    }
}
