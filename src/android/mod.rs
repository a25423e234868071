pub mod archive;
pub mod binary_xml;
pub mod manifest_patch;
pub mod ranks;
pub mod signature;
