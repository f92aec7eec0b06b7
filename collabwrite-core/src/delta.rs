//! Rich-text deltas: the body of every edit operation.
//!
//! A delta walks the source document from left to right:
//!
//! ```text
//!   source:  H e l l o ␣ w o r l d
//!            └─retain 6─┘└del 5─┘
//!                        + insert "there"
//!   target:  H e l l o ␣ t h e r e
//! ```
//!
//! Offsets and lengths count `char`s. An embed (image, pasted table, ...)
//! occupies exactly one position.
//!
//! Deltas are kept canonical while they are built: empty components are
//! dropped, neighbours of the same kind and formatting are merged, and an
//! insert that lands next to a delete is always placed before it. Two deltas
//! that describe the same edit therefore compare equal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A formatting attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    /// Clears the attribute when carried by a retain.
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

/// Formatting attributes (`bold`, `color`, `header`, ...).
pub type Attributes = BTreeMap<String, AttrValue>;

/// Build an attribute map from `(key, value)` pairs.
pub fn attributes<K, V, I>(pairs: I) -> Attributes
where
    K: Into<String>,
    V: Into<AttrValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Non-text content with a length of one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    /// Embed type, e.g. `image` or `html`
    pub kind: String,
    /// Type-specific payload (URL, markup, ...)
    pub value: String,
}

impl Embed {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

/// Inserted content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Insert {
    Text(String),
    Embed(Embed),
}

impl Insert {
    /// Length in document positions.
    pub fn len(&self) -> usize {
        match self {
            Insert::Text(text) => text.chars().count(),
            Insert::Embed(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Insert::Text(text) => text.is_empty(),
            Insert::Embed(_) => false,
        }
    }

    /// Positions `[start, start + len)` of this insert.
    fn slice(&self, start: usize, len: usize) -> Insert {
        match self {
            Insert::Text(text) => Insert::Text(text.chars().skip(start).take(len).collect()),
            Insert::Embed(embed) => Insert::Embed(embed.clone()),
        }
    }
}

/// A single step of a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    /// Keep `len` characters, applying `attributes` to them.
    Retain { len: usize, attributes: Attributes },
    /// Insert new content at the current position.
    Insert { content: Insert, attributes: Attributes },
    /// Remove `len` characters.
    Delete(usize),
}

impl Component {
    pub fn len(&self) -> usize {
        match self {
            Component::Retain { len, .. } => *len,
            Component::Insert { content, .. } => content.len(),
            Component::Delete(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Component::Insert { content, .. } => content.is_empty(),
            other => other.len() == 0,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Component::Insert { .. })
    }

    /// Plain retain of `len` characters.
    pub fn retain(len: usize) -> Self {
        Component::Retain {
            len,
            attributes: Attributes::new(),
        }
    }
}

/// Errors raised by delta algebra.
///
/// Every variant means the two sides disagree about the document they
/// describe; none of them can be fixed by retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    #[error("operation spans {actual} characters but the document has {expected}")]
    BaseLength { expected: usize, actual: usize },
    #[error("cannot transform operations over different base lengths ({left} vs {right})")]
    TransformLength { left: usize, right: usize },
    #[error("cannot compose: first operation produces {first} characters, second expects {second}")]
    ComposeLength { first: usize, second: usize },
    #[error("document content must consist of inserts only")]
    NotInsertOnly,
    #[error("delta length exceeds the addressable range")]
    LengthOverflow,
}

/// Where a position sitting exactly on an insertion point ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    /// Stay before the inserted content.
    Left,
    /// Move past the inserted content.
    Right,
}

/// A canonical sequence of retain / insert / delete components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Component>", into = "Vec<Component>")]
pub struct Delta {
    components: Vec<Component>,
    /// Length of the document this delta applies to
    base_len: usize,
    /// Length of the document after applying it
    target_len: usize,
}

impl TryFrom<Vec<Component>> for Delta {
    type Error = OtError;

    fn try_from(components: Vec<Component>) -> Result<Self, Self::Error> {
        let mut delta = Delta::new();
        for component in components {
            delta.try_push(component)?;
        }
        Ok(delta)
    }
}

impl From<Delta> for Vec<Component> {
    fn from(delta: Delta) -> Self {
        delta.components
    }
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    /// A delta that inserts `text` into an empty document.
    pub fn from_text(text: &str) -> Self {
        Self::new().insert(text)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn base_len(&self) -> usize {
        self.base_len
    }

    pub fn target_len(&self) -> usize {
        self.target_len
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// True when applying this delta changes nothing.
    pub fn is_identity(&self) -> bool {
        self.components.iter().all(|c| match c {
            Component::Retain { attributes, .. } => attributes.is_empty(),
            _ => false,
        })
    }

    /// True when the delta only inserts (the shape of a document snapshot).
    pub fn is_insert_only(&self) -> bool {
        self.components.iter().all(Component::is_insert)
    }

    // ─── Builders ─────────────────────────────────────────────────────

    pub fn retain(mut self, len: usize) -> Self {
        self.push(Component::retain(len));
        self
    }

    pub fn retain_with(mut self, len: usize, attributes: Attributes) -> Self {
        self.push(Component::Retain { len, attributes });
        self
    }

    pub fn insert(mut self, text: &str) -> Self {
        self.push(Component::Insert {
            content: Insert::Text(text.to_string()),
            attributes: Attributes::new(),
        });
        self
    }

    pub fn insert_with(mut self, text: &str, attributes: Attributes) -> Self {
        self.push(Component::Insert {
            content: Insert::Text(text.to_string()),
            attributes,
        });
        self
    }

    pub fn insert_embed(mut self, embed: Embed, attributes: Attributes) -> Self {
        self.push(Component::Insert {
            content: Insert::Embed(embed),
            attributes,
        });
        self
    }

    pub fn delete(mut self, len: usize) -> Self {
        self.push(Component::Delete(len));
        self
    }

    /// Append a component, keeping the delta canonical.
    ///
    /// A component that would overflow the delta's lengths is dropped; use
    /// [`Delta::try_push`] for lengths that come from outside.
    pub fn push(&mut self, component: Component) {
        if let Err(e) = self.try_push(component) {
            log::error!("Dropped delta component: {e}");
        }
    }

    /// Append a component, failing if the delta's lengths would overflow.
    pub fn try_push(&mut self, component: Component) -> Result<(), OtError> {
        if component.is_empty() {
            return Ok(());
        }

        // Every merged component is bounded by these totals.
        let (base_len, target_len) = match &component {
            Component::Retain { len, .. } => (
                self.base_len.checked_add(*len),
                self.target_len.checked_add(*len),
            ),
            Component::Insert { content, .. } => {
                (Some(self.base_len), self.target_len.checked_add(content.len()))
            }
            Component::Delete(len) => (self.base_len.checked_add(*len), Some(self.target_len)),
        };
        let (Some(base_len), Some(target_len)) = (base_len, target_len) else {
            return Err(OtError::LengthOverflow);
        };
        self.base_len = base_len;
        self.target_len = target_len;

        // Insert and delete at the same position commute; always keep the
        // insert first.
        if component.is_insert() {
            if let Some(Component::Delete(len)) = self.components.last() {
                let deleted = *len;
                self.components.pop();
                self.merge_or_push(component);
                self.components.push(Component::Delete(deleted));
                return Ok(());
            }
        }

        self.merge_or_push(component);
        Ok(())
    }

    fn merge_or_push(&mut self, component: Component) {
        if let Some(last) = self.components.last_mut() {
            match (last, &component) {
                (
                    Component::Retain { len, attributes },
                    Component::Retain {
                        len: more,
                        attributes: other,
                    },
                ) if attributes == other => {
                    *len += more;
                    return;
                }
                (Component::Delete(len), Component::Delete(more)) => {
                    *len += more;
                    return;
                }
                (
                    Component::Insert {
                        content: Insert::Text(text),
                        attributes,
                    },
                    Component::Insert {
                        content: Insert::Text(more),
                        attributes: other,
                    },
                ) if attributes == other => {
                    text.push_str(more);
                    return;
                }
                _ => {}
            }
        }
        self.components.push(component);
    }

    /// Extend with a plain retain so the delta spans `base_len` characters.
    ///
    /// Editor deltas usually stop after their last change; the rest of the
    /// document is retained implicitly.
    pub fn pad_to(mut self, base_len: usize) -> Result<Self, OtError> {
        if self.base_len > base_len {
            return Err(OtError::BaseLength {
                expected: base_len,
                actual: self.base_len,
            });
        }
        let missing = base_len - self.base_len;
        self.push(Component::retain(missing));
        Ok(self)
    }

    /// Drop a trailing plain retain (the editor wire shape).
    pub fn chop(mut self) -> Self {
        if let Some(Component::Retain { len, attributes }) = self.components.last() {
            if attributes.is_empty() {
                let len = *len;
                self.components.pop();
                self.base_len -= len;
                self.target_len -= len;
            }
        }
        self
    }

    // ─── Algebra ──────────────────────────────────────────────────────

    /// Compose `self` and `other` into one delta equivalent to applying
    /// `self` then `other`.
    pub fn compose(&self, other: &Delta) -> Result<Delta, OtError> {
        if self.target_len != other.base_len {
            return Err(OtError::ComposeLength {
                first: self.target_len,
                second: other.base_len,
            });
        }

        let mut a = Cursor::new(&self.components);
        let mut b = Cursor::new(&other.components);
        let mut out = Delta::new();

        loop {
            match (a.peek(), b.peek()) {
                (None, None) => break,
                (Some(Component::Delete(_)), _) => {
                    if let Some(c) = a.next(usize::MAX) {
                        out.push(c);
                    }
                }
                (_, Some(Component::Insert { .. })) => {
                    if let Some(c) = b.next(usize::MAX) {
                        out.push(c);
                    }
                }
                (Some(_), Some(_)) => {
                    let len = a.peek_len().min(b.peek_len());
                    match (a.next(len), b.next(len)) {
                        (
                            Some(Component::Retain { attributes: x, .. }),
                            Some(Component::Retain { attributes: y, .. }),
                        ) => out.push(Component::Retain {
                            len,
                            attributes: compose_attributes(&x, &y, true),
                        }),
                        (
                            Some(Component::Insert {
                                content,
                                attributes: x,
                            }),
                            Some(Component::Retain { attributes: y, .. }),
                        ) => out.push(Component::Insert {
                            content,
                            attributes: compose_attributes(&x, &y, false),
                        }),
                        (Some(Component::Retain { .. }), Some(Component::Delete(_))) => {
                            out.push(Component::Delete(len))
                        }
                        // Inserted then deleted: nothing survives.
                        (Some(Component::Insert { .. }), Some(Component::Delete(_))) => {}
                        _ => {
                            return Err(OtError::ComposeLength {
                                first: self.target_len,
                                second: other.base_len,
                            })
                        }
                    }
                }
                _ => {
                    return Err(OtError::ComposeLength {
                        first: self.target_len,
                        second: other.base_len,
                    })
                }
            }
        }

        Ok(out)
    }

    /// Map a position in the source document to the target document.
    pub fn transform_index(&self, index: usize, bias: Bias) -> usize {
        let mut old_pos = 0;
        let mut new_pos = 0;

        for component in &self.components {
            if old_pos > index {
                break;
            }
            match component {
                Component::Retain { len, .. } => {
                    if old_pos + len > index {
                        return new_pos + (index - old_pos);
                    }
                    old_pos += len;
                    new_pos += len;
                }
                Component::Delete(len) => {
                    if old_pos + len > index {
                        return new_pos;
                    }
                    old_pos += len;
                }
                Component::Insert { content, .. } => {
                    if !(old_pos == index && bias == Bias::Left) {
                        new_pos += content.len();
                    }
                }
            }
        }

        new_pos + index.saturating_sub(old_pos)
    }

    /// Plain text of an insert-only delta; embeds render as U+FFFC.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for component in &self.components {
            match component {
                Component::Insert {
                    content: Insert::Text(text),
                    ..
                } => out.push_str(text),
                Component::Insert {
                    content: Insert::Embed(_),
                    ..
                } => out.push('\u{FFFC}'),
                _ => {}
            }
        }
        out
    }
}

/// Overlay `b` onto `a`. With `keep_null == false` the `Null` markers are
/// resolved (removed) instead of carried forward.
pub(crate) fn compose_attributes(a: &Attributes, b: &Attributes, keep_null: bool) -> Attributes {
    let mut out = a.clone();
    for (key, value) in b {
        out.insert(key.clone(), value.clone());
    }
    if !keep_null {
        out.retain(|_, v| *v != AttrValue::Null);
    }
    out
}

/// `b`'s attributes after `a` already formatted the same characters.
///
/// When `a` has priority its keys win, so they are dropped from `b`.
pub(crate) fn transform_attributes(
    a: &Attributes,
    b: &Attributes,
    a_has_priority: bool,
) -> Attributes {
    if !a_has_priority {
        return b.clone();
    }
    b.iter()
        .filter(|(key, _)| !a.contains_key(*key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Walks a component list, handing out pieces of at most `n` positions.
pub(crate) struct Cursor<'a> {
    components: &'a [Component],
    index: usize,
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(components: &'a [Component]) -> Self {
        Self {
            components,
            index: 0,
            offset: 0,
        }
    }

    pub(crate) fn peek(&self) -> Option<&'a Component> {
        self.components.get(self.index)
    }

    /// Remaining length of the current component.
    pub(crate) fn peek_len(&self) -> usize {
        self.peek()
            .map(|c| c.len() - self.offset)
            .unwrap_or(usize::MAX)
    }

    pub(crate) fn next(&mut self, max: usize) -> Option<Component> {
        let component = self.peek()?;
        let remaining = component.len() - self.offset;
        let take = remaining.min(max);

        let piece = match component {
            Component::Retain { attributes, .. } => Component::Retain {
                len: take,
                attributes: attributes.clone(),
            },
            Component::Insert {
                content,
                attributes,
            } => Component::Insert {
                content: if self.offset == 0 && take == remaining {
                    content.clone()
                } else {
                    content.slice(self.offset, take)
                },
                attributes: attributes.clone(),
            },
            Component::Delete(_) => Component::Delete(take),
        };

        if take == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += take;
        }
        Some(piece)
    }
}
