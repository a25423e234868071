use crate::android::binary_xml::BinaryXmlError;
use std::fmt;
use std::io;

/// Result alias used throughout the patcher.
pub type PatchResult<T> = Result<T, PatchError>;

/// Errors surfaced while patching an APK. Every variant is fatal for the run.
#[derive(Debug)]
pub enum PatchError {
    /// The archive or manifest does not have the shape the patcher relies on.
    Structural(String),
    /// An attribute is missing from the rank table.
    RankLookup { element: String, attribute: String },
    /// The manifest could not be encoded, decoded, or did not survive a round trip.
    Encoding {
        node: String,
        attribute: Option<String>,
        message: String,
    },
    Io(io::Error),
    Zip(zip::result::ZipError),
    /// An external tool (adb, apksigner, zipalign) failed.
    Tool(String),
    /// Configuration or rank table could not be loaded.
    Config(String),
}

impl PatchError {
    pub(crate) fn structural(msg: impl Into<String>) -> Self {
        PatchError::Structural(msg.into())
    }

    pub(crate) fn encoding(
        node: impl Into<String>,
        attribute: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        PatchError::Encoding {
            node: node.into(),
            attribute: attribute.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::Structural(msg) => write!(f, "structural error: {msg}"),
            PatchError::RankLookup { element, attribute } => write!(
                f,
                "no rank for attribute '{attribute}' on <{element}> (rank table is incomplete)"
            ),
            PatchError::Encoding {
                node,
                attribute: Some(attribute),
                message,
            } => write!(f, "encoding error at <{node}> attribute '{attribute}': {message}"),
            PatchError::Encoding {
                node,
                attribute: None,
                message,
            } => write!(f, "encoding error at <{node}>: {message}"),
            PatchError::Io(err) => write!(f, "I/O error: {err}"),
            PatchError::Zip(err) => write!(f, "ZIP error: {err}"),
            PatchError::Tool(msg) => write!(f, "tool error: {msg}"),
            PatchError::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for PatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PatchError::Io(err) => Some(err),
            PatchError::Zip(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for PatchError {
    fn from(value: io::Error) -> Self {
        PatchError::Io(value)
    }
}

impl From<zip::result::ZipError> for PatchError {
    fn from(value: zip::result::ZipError) -> Self {
        PatchError::Zip(value)
    }
}

impl From<BinaryXmlError> for PatchError {
    fn from(value: BinaryXmlError) -> Self {
        PatchError::encoding("manifest", None, value.to_string())
    }
}
