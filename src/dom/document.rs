//! Arena-backed element tree and its mutation log.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use super::Selector;
use crate::error::DomError;

/// Handle to an element inside a [`Document`].
///
/// Handles stay valid for the lifetime of the document, including after the
/// element has been detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(usize);

impl NodeId {
    /// Raw arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A node of the simplified DOM.
///
/// `children` and `parent` are maintained by the owning [`Document`]; an
/// element built with [`Element::new`] starts detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Tag name as written, e.g. `div`.
    pub tag_name: String,
    /// Value of the `id` attribute, empty if absent.
    pub id: String,
    /// Raw class attribute, space separated.
    pub class_name: String,
    /// Text content.
    pub text_content: String,
    attributes: Vec<(String, String)>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

impl Element {
    /// Creates a detached element with the given tag.
    #[must_use]
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into(),
            id: String::new(),
            class_name: String::new(),
            text_content: String::new(),
            attributes: Vec::new(),
            children: Vec::new(),
            parent: None,
        }
    }

    /// Sets the element id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the raw class string.
    #[must_use]
    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    /// Sets the text content.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_content = text.into();
        self
    }

    /// Adds or replaces an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    /// Returns an attribute value.
    ///
    /// `id` and `class` read the dedicated fields and are `None` when empty.
    #[must_use]
    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        match name {
            "id" => Some(self.id.as_str()).filter(|id| !id.is_empty()),
            "class" => Some(self.class_name.as_str()).filter(|class| !class.is_empty()),
            _ => self
                .attributes
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str()),
        }
    }

    /// Sets an attribute, keeping the original position when it already exists.
    ///
    /// `id` and `class` write the dedicated fields, so selectors see the change.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match name.as_str() {
            "id" => self.id = value,
            "class" => self.class_name = value,
            _ => match self.attributes.iter_mut().find(|(key, _)| *key == name) {
                Some((_, existing)) => *existing = value,
                None => self.attributes.push((name, value)),
            },
        }
    }

    /// Attributes other than `id` and `class`, in insertion order.
    #[must_use]
    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    /// Owned children, in order.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Owning parent, `None` for the root and detached elements.
    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Selector that identifies this element in change records.
    #[must_use]
    pub fn selector(&self) -> String {
        if self.id.is_empty() {
            self.tag_name.clone()
        } else {
            format!("#{}", self.id)
        }
    }
}

/// One entry of the mutation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomChange {
    /// Kind of mutation, e.g. `attribute`.
    #[serde(rename = "type")]
    pub change_type: String,
    /// Selector identifying the mutated element.
    pub selector: String,
    /// Mutated property or attribute name.
    pub property: String,
    /// New value.
    pub value: String,
}

impl DomChange {
    /// Builds a change record.
    #[must_use]
    pub fn new(
        change_type: impl Into<String>,
        selector: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            change_type: change_type.into(),
            selector: selector.into(),
            property: property.into(),
            value: value.into(),
        }
    }

    /// Record for an attribute write.
    #[must_use]
    pub fn attribute(
        selector: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::new("attribute", selector, name, value)
    }
}

/// Serializable description of an element subtree.
///
/// Used to pre-populate a document from sanitized markup that was already
/// parsed upstream.
///
/// ```
/// use script_sandbox::dom::Document;
///
/// let document = Document::from_json(
///     r#"{"tag": "body", "children": [{"tag": "h1", "id": "title", "text": "Hi"}]}"#,
/// )
/// .unwrap();
/// assert_eq!(document.query("#title").len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    /// Tag name.
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ElementSnapshot>,
}

impl ElementSnapshot {
    fn to_element(&self) -> Element {
        let mut element = Element::new(&self.tag)
            .with_id(&self.id)
            .with_class(&self.class)
            .with_text(&self.text);
        for (name, value) in &self.attributes {
            element.set_attribute(name, value);
        }
        element
    }
}

#[derive(Debug)]
struct Tree {
    nodes: Vec<Element>,
    root: NodeId,
}

impl Tree {
    fn get(&self, node: NodeId) -> Result<&Element, DomError> {
        self.nodes.get(node.0).ok_or(DomError::UnknownNode(node.0))
    }

    fn get_mut(&mut self, node: NodeId) -> Result<&mut Element, DomError> {
        self.nodes
            .get_mut(node.0)
            .ok_or(DomError::UnknownNode(node.0))
    }

    fn insert(&mut self, mut element: Element) -> NodeId {
        element.children.clear();
        element.parent = None;
        let id = NodeId(self.nodes.len());
        self.nodes.push(element);
        id
    }

    fn is_ancestor_or_self(&self, candidate: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == candidate {
                return true;
            }
            current = self.nodes.get(id.0).and_then(|element| element.parent);
        }
        false
    }

    fn detach(&mut self, node: NodeId) -> bool {
        let Some(parent) = self.nodes.get(node.0).and_then(|element| element.parent) else {
            return false;
        };
        if let Some(parent) = self.nodes.get_mut(parent.0) {
            parent.children.retain(|child| *child != node);
        }
        if let Some(element) = self.nodes.get_mut(node.0) {
            element.parent = None;
        }
        true
    }

    fn append(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.get(parent)?;
        self.get(child)?;
        if self.is_ancestor_or_self(child, parent) {
            return Err(DomError::Cycle {
                parent: parent.0,
                child: child.0,
            });
        }
        self.detach(child);
        self.get_mut(parent)?.children.push(child);
        self.get_mut(child)?.parent = Some(parent);
        Ok(())
    }

    /// Pre-order walk of the attached tree.
    fn walk(&self, mut visit: impl FnMut(NodeId, &Element) -> bool) {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let Some(element) = self.nodes.get(id.0) else {
                continue;
            };
            if !visit(id, element) {
                return;
            }
            stack.extend(element.children.iter().rev().copied());
        }
    }

    fn snapshot(&self, node: NodeId) -> Option<ElementSnapshot> {
        let element = self.nodes.get(node.0)?;
        Some(ElementSnapshot {
            tag: element.tag_name.clone(),
            id: element.id.clone(),
            class: element.class_name.clone(),
            text: element.text_content.clone(),
            attributes: element.attributes.iter().cloned().collect(),
            children: element
                .children
                .iter()
                .filter_map(|child| self.snapshot(*child))
                .collect(),
        })
    }
}

/// A simplified DOM: one root element plus an append-only change log.
///
/// Both the tree and the log sit behind reader-writer locks, so a document can
/// be shared through an `Arc` between the caller and a running script.
///
/// # Example
///
/// ```
/// use script_sandbox::dom::{Document, Element};
///
/// let document = Document::new();
/// let list = document
///     .add_element(document.root(), Element::new("ul").with_id("menu"))
///     .unwrap();
/// document
///     .add_element(list, Element::new("li").with_class("item active"))
///     .unwrap();
///
/// assert_eq!(document.query("#menu"), vec![list]);
/// assert_eq!(document.query(".active").len(), 1);
/// assert_eq!(document.query("LI").len(), 1);
/// ```
#[derive(Debug)]
pub struct Document {
    tree: RwLock<Tree>,
    changes: RwLock<Vec<DomChange>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Creates a document whose root is an empty `html` element.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(Element::new("html"))
    }

    /// Creates a document with the given root element.
    #[must_use]
    pub fn with_root(root: Element) -> Self {
        let mut tree = Tree {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        tree.root = tree.insert(root);
        Self {
            tree: RwLock::new(tree),
            changes: RwLock::new(Vec::new()),
        }
    }

    /// Builds a document from a snapshot; the snapshot's top element becomes the root.
    #[must_use]
    pub fn from_snapshot(snapshot: &ElementSnapshot) -> Self {
        let document = Self::with_root(snapshot.to_element());
        {
            let mut tree = document.tree.write();
            let root = tree.root;
            let mut pending: Vec<(NodeId, &ElementSnapshot)> = snapshot
                .children
                .iter()
                .rev()
                .map(|child| (root, child))
                .collect();
            // Parents are always inserted before their children, so append cannot fail.
            while let Some((parent, child)) = pending.pop() {
                let id = tree.insert(child.to_element());
                if let Some(parent) = tree.nodes.get_mut(parent.0) {
                    parent.children.push(id);
                }
                if let Some(element) = tree.nodes.get_mut(id.0) {
                    element.parent = Some(parent);
                }
                pending.extend(child.children.iter().rev().map(|grandchild| (id, grandchild)));
            }
        }
        document
    }

    /// Parses a JSON [`ElementSnapshot`] into a document.
    ///
    /// # Errors
    ///
    /// Returns `DomError::Snapshot` if the JSON does not describe an element.
    pub fn from_json(json: &str) -> Result<Self, DomError> {
        let snapshot: ElementSnapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(&snapshot))
    }

    /// Reads a JSON [`ElementSnapshot`] from disk.
    ///
    /// # Errors
    ///
    /// Returns `DomError::ReadFailed` if the file cannot be read and
    /// `DomError::Snapshot` if it does not parse.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DomError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| DomError::ReadFailed {
            context: path.display().to_string(),
            source: e,
        })?;
        let document = Self::from_json(&json)?;
        debug!(nodes = document.len(), "Loaded document snapshot");
        Ok(document)
    }

    /// Serializes the attached tree back into a snapshot.
    #[must_use]
    pub fn to_snapshot(&self) -> ElementSnapshot {
        let tree = self.tree.read();
        tree.snapshot(tree.root).unwrap_or_default()
    }

    /// Handle of the root element.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.tree.read().root
    }

    /// Number of elements ever created in this document, attached or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.read().nodes.len()
    }

    /// Returns `true` if the document holds only its root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Adds a detached element to the document.
    pub fn create_element(&self, element: Element) -> NodeId {
        self.tree.write().insert(element)
    }

    /// Creates `element` and appends it as the last child of `parent`.
    ///
    /// # Errors
    ///
    /// Returns `DomError::UnknownNode` if `parent` is not in this document.
    pub fn add_element(&self, parent: NodeId, element: Element) -> Result<NodeId, DomError> {
        let mut tree = self.tree.write();
        tree.get(parent)?;
        let child = tree.insert(element);
        tree.append(parent, child)?;
        Ok(child)
    }

    /// Appends `child` under `parent`, moving it away from any previous parent.
    ///
    /// # Errors
    ///
    /// Returns `DomError::UnknownNode` for foreign handles and `DomError::Cycle`
    /// if `child` is `parent` or one of its ancestors.
    pub fn append_child(&self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.tree.write().append(parent, child)
    }

    /// Detaches an element (and its subtree) from its parent.
    ///
    /// Returns `false` for the root and for elements that are already detached.
    pub fn remove(&self, node: NodeId) -> bool {
        self.tree.write().detach(node)
    }

    /// Copy of an element.
    #[must_use]
    pub fn element(&self, node: NodeId) -> Option<Element> {
        self.tree.read().nodes.get(node.0).cloned()
    }

    /// Children of an element.
    #[must_use]
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.tree
            .read()
            .nodes
            .get(node.0)
            .map(|element| element.children.clone())
            .unwrap_or_default()
    }

    /// Parent of an element.
    #[must_use]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.tree.read().nodes.get(node.0).and_then(|e| e.parent)
    }

    /// Reads an attribute straight from the tree.
    #[must_use]
    pub fn get_attribute(&self, node: NodeId, name: &str) -> Option<String> {
        let tree = self.tree.read();
        tree.nodes
            .get(node.0)
            .and_then(|element| element.get_attribute(name))
            .map(str::to_string)
    }

    /// Writes an attribute straight into the tree.
    ///
    /// # Errors
    ///
    /// Returns `DomError::UnknownNode` if `node` is not in this document.
    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        self.tree.write().get_mut(node)?.set_attribute(name, value);
        Ok(())
    }

    /// Finds attached elements matching `selector`, in document order.
    ///
    /// `#id` yields at most one element. Unsupported selector syntax yields an
    /// empty list.
    #[must_use]
    pub fn query(&self, selector: &str) -> Vec<NodeId> {
        let selector = Selector::parse(selector);
        if selector == Selector::Unsupported {
            trace!("Unsupported selector, returning no matches");
            return Vec::new();
        }

        let mut matches = Vec::new();
        self.tree.read().walk(|id, element| {
            if selector.matches(element) {
                matches.push(id);
                return !selector.is_unique();
            }
            true
        });
        matches
    }

    /// Appends a mutation record.
    pub fn record_change(&self, change: DomChange) {
        trace!(?change, "Recording DOM change");
        self.changes.write().push(change);
    }

    /// Copy of the mutation log, oldest first.
    #[must_use]
    pub fn changes(&self) -> Vec<DomChange> {
        self.changes.read().clone()
    }
}
