#![forbid(unsafe_code)]
//! Typed, symbol-keyed context values.
//!
//! A [`Tag<T>`] is an opaque, globally-unique key (two tags built from the
//! same label are still distinct, the same way two JS `Symbol()` calls with
//! the same description differ) carrying an optional default and an
//! optional validator. A [`Tagged<T>`] pairs a tag with a concrete value.
//!
//! Tags are read out of four container shapes through the single
//! [`TagReader`] trait: an unordered [`TagMap`] (last write wins), an
//! ordered [`TagSequence`] (every write kept, in order), a [`Scope`]
//! (walks the scope's definition tags then its execution tags, then its
//! parent chain), and an [`Executor`]'s own definition tags.

use crate::error::CoreError;
use rustc_hash::FxHashMap;
use std::{
    any::Any,
    fmt,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

/// A process-unique symbol. Never constructed directly; allocated by
/// [`Tag::new`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagId(u64);

impl fmt::Debug for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagId({})", self.0)
    }
}

fn next_tag_id() -> TagId {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    TagId(NEXT.fetch_add(1, Ordering::Relaxed))
}

type Validator<T> = Rc<dyn Fn(&T) -> Result<(), Vec<String>>>;

/// A typed, symbol-keyed tag.
pub struct Tag<T> {
    id: TagId,
    label: &'static str,
    default: Option<Rc<dyn Fn() -> T>>,
    validator: Option<Validator<T>>,
}

impl<T> Clone for Tag<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            label: self.label,
            default: self.default.clone(),
            validator: self.validator.clone(),
        }
    }
}

impl<T> fmt::Debug for Tag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag").field("label", &self.label).field("id", &self.id).finish()
    }
}

impl<T: 'static> Tag<T> {
    /// Allocates a brand new tag. `label` is for diagnostics only and does
    /// not participate in equality — two tags created with the same label
    /// are different tags.
    #[track_caller]
    pub fn new(label: &'static str) -> Self {
        Self { id: next_tag_id(), label, default: None, validator: None }
    }

    pub fn with_default(mut self, default: impl Fn() -> T + 'static) -> Self {
        self.default = Some(Rc::new(default));
        self
    }

    pub fn with_validator(
        mut self,
        validator: impl Fn(&T) -> Result<(), Vec<String>> + 'static,
    ) -> Self {
        self.validator = Some(Rc::new(validator));
        self
    }

    pub fn id(&self) -> TagId {
        self.id
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn default_value(&self) -> Option<T> {
        self.default.as_ref().map(|f| f())
    }

    pub fn validate(&self, value: &T) -> Result<(), CoreError> {
        match &self.validator {
            Some(v) => v(value).map_err(|issues| CoreError::SchemaValidation {
                subject: self.label.to_string(),
                issues,
            }),
            None => Ok(()),
        }
    }

    /// Pairs this tag with a value, validating it first.
    pub fn tagged(&self, value: T) -> Result<Tagged<T>, CoreError> {
        self.validate(&value)?;
        Ok(Tagged { tag: self.clone(), value })
    }
}

/// A tag paired with a concrete, already-validated value.
#[derive(Clone)]
pub struct Tagged<T> {
    pub tag: Tag<T>,
    pub value: T,
}

impl<T: fmt::Debug> fmt::Debug for Tagged<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tagged").field("tag", &self.tag.label).field("value", &self.value).finish()
    }
}

/// Common read surface for every tag container shape.
///
/// `extract` is the "required" mode: falls back to the tag's default when
/// present, otherwise a [`CoreError::TagMissing`]. `read` is the
/// "optional" mode. `collect` gathers every matching entry a sequence-like
/// container holds, in insertion order.
pub trait TagReader {
    fn read<T: Clone + 'static>(&self, tag: &Tag<T>) -> Option<T>;

    fn extract<T: Clone + 'static>(&self, tag: &Tag<T>) -> Result<T, CoreError> {
        self.read(tag)
            .or_else(|| tag.default_value())
            .ok_or_else(|| CoreError::TagMissing(tag.label().to_string()))
    }

    fn collect<T: Clone + 'static>(&self, tag: &Tag<T>) -> Vec<T>;
}

/// An unordered map container: one slot per tag id, last write wins.
#[derive(Default, Clone)]
pub struct TagMap {
    entries: FxHashMap<TagId, Rc<dyn Any>>,
}

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: 'static>(&mut self, tagged: Tagged<T>) {
        self.entries.insert(tagged.tag.id(), Rc::new(tagged.value));
    }

    pub fn insert_raw<T: 'static>(&mut self, tag: &Tag<T>, value: T) {
        self.entries.insert(tag.id(), Rc::new(value));
    }

    pub fn contains<T>(&self, tag: &Tag<T>) -> bool {
        self.entries.contains_key(&tag.id())
    }

    pub fn remove<T>(&mut self, tag: &Tag<T>) {
        self.entries.remove(&tag.id());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overlays `other` on top of `self`: entries in `other` win on
    /// conflict. Used to merge definition tags with execution tags.
    pub fn merged_with(&self, other: &TagMap) -> TagMap {
        let mut merged = TagMap { entries: self.entries.clone() };
        for (id, value) in other.entries.iter() {
            merged.entries.insert(*id, value.clone());
        }
        merged
    }
}

impl TagReader for TagMap {
    fn read<T: Clone + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        self.entries.get(&tag.id()).and_then(|v| v.downcast_ref::<T>()).cloned()
    }

    fn collect<T: Clone + 'static>(&self, tag: &Tag<T>) -> Vec<T> {
        self.read(tag).into_iter().collect()
    }
}

/// An ordered, append-only container: every insertion is kept, in order.
/// `read` returns the most recent entry; `collect` returns all of them.
#[derive(Default)]
pub struct TagSequence {
    entries: Vec<(TagId, Rc<dyn Any>)>,
}

impl TagSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: 'static>(&mut self, tagged: Tagged<T>) {
        self.entries.push((tagged.tag.id(), Rc::new(tagged.value)));
    }

    pub fn push_raw<T: 'static>(&mut self, tag: &Tag<T>, value: T) {
        self.entries.push((tag.id(), Rc::new(value)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TagReader for TagSequence {
    fn read<T: Clone + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        self.entries
            .iter()
            .rev()
            .find(|(id, _)| *id == tag.id())
            .and_then(|(_, v)| v.downcast_ref::<T>())
            .cloned()
    }

    fn collect<T: Clone + 'static>(&self, tag: &Tag<T>) -> Vec<T> {
        self.entries
            .iter()
            .filter(|(id, _)| *id == tag.id())
            .filter_map(|(_, v)| v.downcast_ref::<T>())
            .cloned()
            .collect()
    }
}

impl<T: 'static> TagReader for crate::executor::Executor<T> {
    fn read<U: Clone + 'static>(&self, tag: &Tag<U>) -> Option<U> {
        self.definition_tags().read(tag)
    }

    fn collect<U: Clone + 'static>(&self, tag: &Tag<U>) -> Vec<U> {
        self.definition_tags().collect(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_last_write_wins() {
        let tag: Tag<i32> = Tag::new("count");
        let mut map = TagMap::new();
        map.insert_raw(&tag, 1);
        map.insert_raw(&tag, 2);
        assert_eq!(map.read(&tag), Some(2));
        assert_eq!(map.collect(&tag), vec![2]);
    }

    #[test]
    fn sequence_keeps_every_write() {
        let tag: Tag<i32> = Tag::new("count");
        let mut seq = TagSequence::new();
        seq.push_raw(&tag, 1);
        seq.push_raw(&tag, 2);
        assert_eq!(seq.read(&tag), Some(2));
        assert_eq!(seq.collect(&tag), vec![1, 2]);
    }

    #[test]
    fn extract_falls_back_to_default() {
        let tag: Tag<i32> = Tag::new("retries").with_default(|| 3);
        let map = TagMap::new();
        assert_eq!(map.extract(&tag).unwrap(), 3);
    }

    #[test]
    fn extract_without_default_is_tag_missing() {
        let tag: Tag<i32> = Tag::new("retries");
        let map = TagMap::new();
        assert!(matches!(map.extract(&tag), Err(CoreError::TagMissing(_))));
    }

    #[test]
    fn validator_rejects_bad_values() {
        let tag: Tag<i32> = Tag::new("positive").with_validator(|v| {
            if *v > 0 {
                Ok(())
            } else {
                Err(vec!["must be positive".to_string()])
            }
        });
        assert!(tag.tagged(-1).is_err());
        assert!(tag.tagged(1).is_ok());
    }

    #[test]
    fn two_tags_same_label_are_distinct() {
        let a: Tag<i32> = Tag::new("x");
        let b: Tag<i32> = Tag::new("x");
        assert_ne!(a.id(), b.id());
    }
}
