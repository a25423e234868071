//! Rank-ordered attribute upserts on the `<manifest>` and `<application>` nodes.

use crate::android::binary_xml::{AndroidManifest, ManifestAttribute, ManifestElement, ManifestValue};
use crate::android::ranks::AttributeRanks;
use crate::config::PatchConfig;
use crate::error::{PatchError, PatchResult};
use log::{debug, info, warn};

/// The two manifest nodes the patcher edits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestNode {
    Manifest,
    Application,
}

impl ManifestNode {
    pub fn element_type(self) -> &'static str {
        match self {
            ManifestNode::Manifest => "manifest",
            ManifestNode::Application => "application",
        }
    }

    fn resolve(self, manifest: &mut AndroidManifest) -> PatchResult<&mut ManifestElement> {
        match self {
            ManifestNode::Manifest => Ok(manifest.root_mut()),
            ManifestNode::Application => manifest
                .application_mut()
                .ok_or_else(|| PatchError::structural("manifest has no <application> element")),
        }
    }

    fn get(self, manifest: &AndroidManifest) -> Option<&ManifestElement> {
        match self {
            ManifestNode::Manifest => Some(manifest.root()),
            ManifestNode::Application => manifest.application(),
        }
    }
}

/// Insert `attribute` into `attributes` at its rank position.
///
/// Any attribute with the same namespace and name is removed first. The new attribute goes
/// right before the first attribute that `ranker` ranks above `rank`, or at the end when there
/// is none. `ranker` returns `None` for attributes that do not take part in the ordering.
pub fn upsert_ordered<F>(
    attributes: Vec<ManifestAttribute>,
    attribute: ManifestAttribute,
    rank: u32,
    mut ranker: F,
) -> PatchResult<Vec<ManifestAttribute>>
where
    F: FnMut(&ManifestAttribute) -> PatchResult<Option<u32>>,
{
    let mut remaining: Vec<ManifestAttribute> = attributes
        .into_iter()
        .filter(|existing| !existing.same_name(&attribute))
        .collect();

    let mut successor = None;
    for (idx, existing) in remaining.iter().enumerate() {
        if matches!(ranker(existing)?, Some(existing_rank) if existing_rank > rank) {
            successor = Some(idx);
            break;
        }
    }

    match successor {
        Some(idx) => {
            let right = remaining.split_off(idx);
            remaining.push(attribute);
            remaining.extend(right);
        }
        None => remaining.push(attribute),
    }
    Ok(remaining)
}

/// Rank of an existing attribute on an element of type `element_type`.
///
/// Only `android:` attributes are ranked, each by its own entry in the rank table.
pub fn attribute_rank(
    ranks: &AttributeRanks,
    element_type: &str,
    attribute: &ManifestAttribute,
) -> PatchResult<Option<u32>> {
    if !attribute.is_android() {
        return Ok(None);
    }
    ranks.rank(element_type, &attribute.name).map(Some)
}

/// Whether the `android:` attributes of `element` appear in non-decreasing rank order.
pub fn is_rank_ordered(ranks: &AttributeRanks, element: &ManifestElement) -> PatchResult<bool> {
    let mut previous = None;
    for attribute in &element.attributes {
        if let Some(rank) = attribute_rank(ranks, &element.tag, attribute)? {
            if previous.is_some_and(|prev| prev > rank) {
                return Ok(false);
            }
            previous = Some(rank);
        }
    }
    Ok(true)
}

/// Set `android:<name>` on `node` to `value`, keeping the node's rank order.
///
/// The node is left untouched when the edit fails. A replaced attribute keeps its resource
/// identifier; a new one gets the framework identifier of the attribute.
pub fn upsert(
    manifest: &mut AndroidManifest,
    node: ManifestNode,
    name: &str,
    value: impl Into<ManifestValue>,
    ranks: &AttributeRanks,
) -> PatchResult<()> {
    let element_type = node.element_type();
    let rank = ranks.rank(element_type, name)?;
    let element = node.resolve(manifest)?;
    let resource_id = match element
        .attributes
        .iter()
        .find(|existing| existing.is_android() && existing.name == name)
        .and_then(|existing| existing.resource_id)
    {
        Some(id) => id,
        None => AttributeRanks::resource_id(element_type, name)?,
    };
    let attributes = upsert_ordered(
        element.attributes.clone(),
        ManifestAttribute::android(name, value, resource_id),
        rank,
        |existing| attribute_rank(ranks, element_type, existing),
    )?;
    element.attributes = attributes;
    debug!("set android:{name} on <{element_type}> (rank {rank}, id 0x{resource_id:08x})");
    Ok(())
}

/// The set of attribute edits applied in one patch pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestPatch {
    pub shared_user_id: Option<String>,
    pub app_component_factory: Option<String>,
    pub debuggable: Option<bool>,
    pub process: Option<String>,
}

impl ManifestPatch {
    /// The edits every patched APK receives: shared user id and the stub component factory.
    pub fn from_config(config: &PatchConfig) -> Self {
        ManifestPatch {
            shared_user_id: Some(config.shared_user_id.clone()),
            app_component_factory: Some(config.component_factory.clone()),
            debuggable: None,
            process: None,
        }
    }

    pub fn with_debuggable(mut self, debuggable: bool) -> Self {
        self.debuggable = debuggable.then_some(true);
        self
    }

    pub fn with_process(mut self, process: Option<String>) -> Self {
        self.process = process;
        self
    }

    fn edits(&self) -> Vec<(ManifestNode, &'static str, ManifestValue)> {
        let mut edits = Vec::new();
        if let Some(id) = &self.shared_user_id {
            edits.push((ManifestNode::Manifest, "sharedUserId", ManifestValue::from(id.as_str())));
        }
        if let Some(factory) = &self.app_component_factory {
            edits.push((
                ManifestNode::Application,
                "appComponentFactory",
                ManifestValue::from(factory.as_str()),
            ));
        }
        if let Some(debuggable) = self.debuggable {
            edits.push((ManifestNode::Application, "debuggable", ManifestValue::from(debuggable)));
        }
        if let Some(process) = &self.process {
            edits.push((ManifestNode::Application, "process", ManifestValue::from(process.as_str())));
        }
        edits
    }

    fn touched_nodes(&self) -> Vec<ManifestNode> {
        let mut nodes: Vec<ManifestNode> = self.edits().into_iter().map(|(node, _, _)| node).collect();
        nodes.dedup();
        nodes
    }

    /// Apply every edit to an already decoded manifest.
    pub fn apply(&self, manifest: &mut AndroidManifest, ranks: &AttributeRanks) -> PatchResult<()> {
        for node in self.touched_nodes() {
            if let Some(element) = node.get(manifest) {
                if !is_rank_ordered(ranks, element)? {
                    warn!(
                        "<{}> attributes are not in rank order before patching",
                        node.element_type()
                    );
                }
            }
        }
        for (node, name, value) in self.edits() {
            upsert(manifest, node, name, value, ranks)?;
        }
        Ok(())
    }

    /// Decode `bytes`, apply the edits, and encode the result.
    ///
    /// The encoded document is decoded once more and the patched nodes are compared, so a
    /// codec problem surfaces here instead of on the device.
    pub fn apply_to_bytes(&self, bytes: &[u8], ranks: &AttributeRanks) -> PatchResult<Vec<u8>> {
        let mut manifest = AndroidManifest::from_bytes(bytes)?;
        self.apply(&mut manifest, ranks)?;
        let encoded = manifest.to_bytes()?;

        let reparsed = AndroidManifest::from_bytes(&encoded)?;
        for node in [ManifestNode::Manifest, ManifestNode::Application] {
            verify_node(node, &manifest, &reparsed)?;
        }
        info!(
            "patched manifest of {}",
            manifest.package_name().unwrap_or("<unknown package>")
        );
        Ok(encoded)
    }
}

fn verify_node(
    node: ManifestNode,
    expected: &AndroidManifest,
    actual: &AndroidManifest,
) -> PatchResult<()> {
    let element_type = node.element_type();
    let (expected, actual) = match (node.get(expected), node.get(actual)) {
        (Some(expected), Some(actual)) => (expected, actual),
        (None, None) => return Ok(()),
        _ => {
            return Err(PatchError::encoding(
                element_type,
                None,
                "element did not survive re-encoding",
            ))
        }
    };
    for (idx, attribute) in expected.attributes.iter().enumerate() {
        if actual.attributes.get(idx) != Some(attribute) {
            return Err(PatchError::encoding(
                element_type,
                Some(&attribute.qualified_name()),
                format!("attribute at position {idx} changed after re-encoding"),
            ));
        }
    }
    if actual.attributes.len() != expected.attributes.len() {
        return Err(PatchError::encoding(
            element_type,
            None,
            "attribute count changed after re-encoding",
        ));
    }
    Ok(())
}
