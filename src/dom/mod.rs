//! Simplified document model exposed to sandboxed scripts.
//!
//! A [`Document`] owns a tree of [`Element`]s addressed by [`NodeId`] handles and
//! an append-only log of [`DomChange`] records. Scripts reach it through the
//! `document` global while an execution is bound to it; the caller reads
//! [`Document::changes`] afterwards.
//!
//! Supported selectors are `#id`, `.class` (substring match on the raw class
//! string) and bare tag names (case-insensitive). See [`Selector`].

mod document;
mod selector;

pub use document::{DomChange, Document, Element, ElementSnapshot, NodeId};
pub use selector::Selector;
