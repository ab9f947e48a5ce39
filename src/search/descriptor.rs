//! Entity search descriptors and the fluent builder that produces them
//!
//! A [`SearchModel`] is assembled once at startup and shared read-only
//! afterwards. Every registered entity type gets one immutable
//! [`EntitySearchDescriptor`] holding its index name, id accessor, field list,
//! forced filters and exclusion predicates. Accessors are captured as
//! type-erased closures at registration time, so the rest of the crate works
//! with `&dyn Any` entities and never needs to know the concrete type.

use crate::search::error::{SearchError, SearchResult};
use crate::search::filter::FilterContext;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tantivy::query::Query;

/// Shared, type-erased entity instance
pub type EntityRef = Arc<dyn Any + Send + Sync>;

/// Wrap a concrete entity into an [`EntityRef`]
pub fn entity_ref<T: Any + Send + Sync>(entity: T) -> EntityRef {
    Arc::new(entity)
}

/// Default name of the id field
pub const DEFAULT_ID_FIELD: &str = "Id";

/// Default name of a computed field registered through `value_field`
pub const DEFAULT_VALUE_FIELD: &str = "Value";

type ValueFn = Arc<dyn Fn(&dyn Any) -> Option<String> + Send + Sync>;
type ExclusionFn = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;
type FilterFn = Arc<dyn Fn(&FilterContext<'_>) -> Option<Box<dyn Query>> + Send + Sync>;

/// Conversion of an accessor result into an indexable string
pub trait IntoFieldValue {
    fn into_field_value(self) -> Option<String>;
}

impl IntoFieldValue for String {
    fn into_field_value(self) -> Option<String> {
        Some(self)
    }
}

impl IntoFieldValue for &str {
    fn into_field_value(self) -> Option<String> {
        Some(self.to_string())
    }
}

impl IntoFieldValue for uuid::Uuid {
    fn into_field_value(self) -> Option<String> {
        if self.is_nil() {
            None
        } else {
            Some(self.to_string())
        }
    }
}

impl<V: IntoFieldValue> IntoFieldValue for Option<V> {
    fn into_field_value(self) -> Option<String> {
        self.and_then(IntoFieldValue::into_field_value)
    }
}

macro_rules! impl_display_field_value {
    ($($ty:ty),*) => {
        $(
            impl IntoFieldValue for $ty {
                fn into_field_value(self) -> Option<String> {
                    Some(self.to_string())
                }
            }
        )*
    };
}

impl_display_field_value!(bool, i32, i64, u32, u64, usize, f64);

/// Which search entry point a forced filter applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    /// Both single-index and multi-index searches
    #[default]
    Any,
    /// Single-index search only
    Single,
    /// Multi-index search only
    Many,
}

impl SearchScope {
    fn covers(self, scope: SearchScope) -> bool {
        self == SearchScope::Any || self == scope
    }
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchScope::Any => write!(f, "any"),
            SearchScope::Single => write!(f, "single"),
            SearchScope::Many => write!(f, "many"),
        }
    }
}

/// One indexed field of an entity
#[derive(Clone)]
pub struct FieldDescriptor {
    name: String,
    searchable: bool,
    stored: bool,
    keyword: bool,
    indexed: bool,
    boost: Option<f32>,
    extract: ValueFn,
}

impl FieldDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the multi-field parser queries this field
    pub fn is_searchable(&self) -> bool {
        self.searchable && self.indexed
    }

    pub fn is_stored(&self) -> bool {
        self.stored
    }

    /// Keyword fields are indexed as a single untokenized term
    pub fn is_keyword(&self) -> bool {
        self.keyword
    }

    /// False for store-only fields
    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    pub fn boost(&self) -> Option<f32> {
        self.boost
    }

    /// Extract this field's value from an entity
    pub fn value(&self, entity: &dyn Any) -> Option<String> {
        (self.extract)(entity)
    }
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("searchable", &self.searchable)
            .field("stored", &self.stored)
            .field("keyword", &self.keyword)
            .field("indexed", &self.indexed)
            .field("boost", &self.boost)
            .finish()
    }
}

/// A permanent filter attached to an entity
#[derive(Clone)]
pub struct ForcedFilter {
    scope: SearchScope,
    build: FilterFn,
}

impl ForcedFilter {
    pub fn scope(&self) -> SearchScope {
        self.scope
    }

    /// Whether this filter participates in a search of the given scope
    pub fn applies_to(&self, scope: SearchScope) -> bool {
        self.scope.covers(scope)
    }

    pub fn build(&self, ctx: &FilterContext<'_>) -> Option<Box<dyn Query>> {
        (self.build)(ctx)
    }
}

/// Immutable search configuration of one entity type
pub struct EntitySearchDescriptor {
    entity_type: TypeId,
    type_name: &'static str,
    index_name: String,
    id_field: String,
    id_extract: ValueFn,
    fields: Vec<FieldDescriptor>,
    forced_filters: Vec<ForcedFilter>,
    exclusions: Vec<ExclusionFn>,
}

impl EntitySearchDescriptor {
    pub fn entity_type(&self) -> TypeId {
        self.entity_type
    }

    /// Fully qualified Rust type name of the entity
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn searchable_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_searchable())
    }

    pub fn stored_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.stored)
    }

    pub fn forced_filters(&self) -> &[ForcedFilter] {
        &self.forced_filters
    }

    /// Whether the instance is of the type this descriptor was built for
    pub fn accepts(&self, entity: &dyn Any) -> bool {
        Any::type_id(entity) == self.entity_type
    }

    /// Resolve the entity id; blank strings and nil UUIDs count as missing
    pub fn entity_id(&self, entity: &dyn Any) -> Option<String> {
        (self.id_extract)(entity).filter(|id| !id.trim().is_empty())
    }

    /// True when any exclusion predicate matches the entity
    pub fn is_excluded(&self, entity: &dyn Any) -> bool {
        self.exclusions.iter().any(|excluded| excluded(entity))
    }
}

impl fmt::Debug for EntitySearchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySearchDescriptor")
            .field("type_name", &self.type_name)
            .field("index_name", &self.index_name)
            .field("id_field", &self.id_field)
            .field("fields", &self.fields)
            .field("forced_filters", &self.forced_filters.len())
            .field("exclusions", &self.exclusions.len())
            .finish()
    }
}

/// Per-field options
pub struct FieldBuilder {
    name: String,
    searchable: bool,
    stored: bool,
    keyword: bool,
    indexed: bool,
    boost: Option<f32>,
}

impl FieldBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            searchable: true,
            stored: false,
            keyword: false,
            indexed: true,
            boost: None,
        }
    }

    /// Rename the field in the index
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Keep the raw value retrievable from hits
    pub fn store(mut self) -> Self {
        self.stored = true;
        self
    }

    /// Index the value as one exact term
    pub fn keyword(mut self) -> Self {
        self.keyword = true;
        self
    }

    /// Store the value without indexing it
    pub fn store_only(mut self) -> Self {
        self.stored = true;
        self.searchable = false;
        self.indexed = false;
        self
    }

    /// Keep the field out of the multi-field parser
    pub fn not_searchable(mut self) -> Self {
        self.searchable = false;
        self
    }

    /// Query-time weight of matches in this field
    pub fn boost(mut self, boost: f32) -> Self {
        self.boost = Some(boost);
        self
    }
}

/// Fluent builder of an [`EntitySearchDescriptor`] for entity type `T`
pub struct EntitySearchBuilder<T> {
    index_name: String,
    id_field: String,
    id_extract: Option<ValueFn>,
    fields: Vec<FieldDescriptor>,
    forced_filters: Vec<ForcedFilter>,
    exclusions: Vec<ExclusionFn>,
    _entity: PhantomData<fn(&T)>,
}

impl<T: Any + Send + Sync> EntitySearchBuilder<T> {
    pub fn new(index_name: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            id_field: DEFAULT_ID_FIELD.to_string(),
            id_extract: None,
            fields: Vec::new(),
            forced_filters: Vec::new(),
            exclusions: Vec::new(),
            _entity: PhantomData,
        }
    }

    /// Name and accessor of the id field
    pub fn id<F, V>(mut self, name: impl Into<String>, accessor: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: IntoFieldValue,
    {
        self.id_field = name.into();
        self.id_extract = Some(erase(accessor));
        self
    }

    /// Property-style field
    pub fn field<F, V>(
        mut self,
        name: impl Into<String>,
        accessor: F,
        configure: impl FnOnce(FieldBuilder) -> FieldBuilder,
    ) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: IntoFieldValue,
    {
        let options = configure(FieldBuilder::new(name));
        self.fields.push(FieldDescriptor {
            name: options.name,
            searchable: options.searchable,
            stored: options.stored,
            keyword: options.keyword,
            indexed: options.indexed,
            boost: options.boost,
            extract: erase(accessor),
        });
        self
    }

    /// Computed field, named `Value` unless renamed in `configure`
    pub fn value_field<F, V>(
        self,
        accessor: F,
        configure: impl FnOnce(FieldBuilder) -> FieldBuilder,
    ) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: IntoFieldValue,
    {
        self.field(DEFAULT_VALUE_FIELD, accessor, configure)
    }

    /// Permanent filter for every search of this entity
    pub fn force_filter<F>(self, filter: F) -> Self
    where
        F: Fn(&FilterContext<'_>) -> Option<Box<dyn Query>> + Send + Sync + 'static,
    {
        self.force_filter_for(SearchScope::Any, filter)
    }

    /// Permanent filter limited to single- or multi-index searches
    pub fn force_filter_for<F>(mut self, scope: SearchScope, filter: F) -> Self
    where
        F: Fn(&FilterContext<'_>) -> Option<Box<dyn Query>> + Send + Sync + 'static,
    {
        self.forced_filters.push(ForcedFilter {
            scope,
            build: Arc::new(filter),
        });
        self
    }

    /// Keep matching entities out of the index
    pub fn exclude_from_index_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.exclusions.push(Arc::new(move |entity: &dyn Any| {
            entity.downcast_ref::<T>().map(&predicate).unwrap_or(false)
        }));
        self
    }

    /// Validate and freeze the descriptor
    pub fn build(self) -> SearchResult<EntitySearchDescriptor> {
        let index_name = self.index_name.trim().to_string();
        if index_name.is_empty() {
            return Err(SearchError::InvalidConfiguration(format!(
                "index name of {} must not be blank",
                std::any::type_name::<T>()
            )));
        }

        let id_extract = self.id_extract.ok_or_else(|| {
            SearchError::InvalidConfiguration(format!(
                "index '{}' has no id accessor",
                index_name
            ))
        })?;

        let mut seen = vec![self.id_field.as_str(), crate::search::document::INDEX_NAME_FIELD];
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(SearchError::InvalidConfiguration(format!(
                    "index '{}' has a field without a name",
                    index_name
                )));
            }
            if seen.contains(&field.name.as_str()) {
                return Err(SearchError::InvalidConfiguration(format!(
                    "index '{}' declares field '{}' more than once",
                    index_name, field.name
                )));
            }
            seen.push(&field.name);
        }

        Ok(EntitySearchDescriptor {
            entity_type: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            index_name,
            id_field: self.id_field,
            id_extract,
            fields: self.fields,
            forced_filters: self.forced_filters,
            exclusions: self.exclusions,
        })
    }
}

fn erase<T, F, V>(accessor: F) -> ValueFn
where
    T: Any,
    F: Fn(&T) -> V + Send + Sync + 'static,
    V: IntoFieldValue,
{
    Arc::new(move |entity: &dyn Any| {
        entity
            .downcast_ref::<T>()
            .and_then(|typed| accessor(typed).into_field_value())
    })
}

/// Last path segment of a type name, without generic arguments
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Registry of every searchable entity type
#[derive(Default)]
pub struct SearchModel {
    descriptors: Vec<Arc<EntitySearchDescriptor>>,
    by_type: HashMap<TypeId, usize>,
    by_name: HashMap<String, usize>,
}

impl SearchModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its short type name
    pub fn entity<T, F>(&mut self, configure: F) -> SearchResult<&mut Self>
    where
        T: Any + Send + Sync,
        F: FnOnce(EntitySearchBuilder<T>) -> EntitySearchBuilder<T>,
    {
        self.entity_named::<T, F>(short_type_name::<T>(), configure)
    }

    /// Register `T` under an explicit index name
    pub fn entity_named<T, F>(
        &mut self,
        index_name: impl Into<String>,
        configure: F,
    ) -> SearchResult<&mut Self>
    where
        T: Any + Send + Sync,
        F: FnOnce(EntitySearchBuilder<T>) -> EntitySearchBuilder<T>,
    {
        let descriptor = configure(EntitySearchBuilder::new(index_name)).build()?;
        self.register(descriptor)?;
        Ok(self)
    }

    /// Add a prebuilt descriptor
    pub fn register(&mut self, descriptor: EntitySearchDescriptor) -> SearchResult<()> {
        let key = descriptor.index_name().to_lowercase();
        if self.by_name.contains_key(&key) {
            return Err(SearchError::DuplicateIndexName(
                descriptor.index_name().to_string(),
            ));
        }
        if self.by_type.contains_key(&descriptor.entity_type()) {
            return Err(SearchError::InvalidConfiguration(format!(
                "{} is already registered",
                descriptor.type_name()
            )));
        }

        let position = self.descriptors.len();
        self.by_type.insert(descriptor.entity_type(), position);
        self.by_name.insert(key, position);
        self.descriptors.push(Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, entity_type: TypeId) -> Option<&Arc<EntitySearchDescriptor>> {
        self.by_type.get(&entity_type).map(|&i| &self.descriptors[i])
    }

    pub fn get_for<T: Any>(&self) -> Option<&Arc<EntitySearchDescriptor>> {
        self.get(TypeId::of::<T>())
    }

    /// Case-insensitive lookup by index name
    pub fn find(&self, index_name: &str) -> Option<&Arc<EntitySearchDescriptor>> {
        self.by_name
            .get(&index_name.trim().to_lowercase())
            .map(|&i| &self.descriptors[i])
    }

    pub fn descriptors(&self) -> &[Arc<EntitySearchDescriptor>] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl fmt::Debug for SearchModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.descriptors.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Book {
        id: uuid::Uuid,
        title: String,
        code: String,
        is_deleted: bool,
    }

    struct Author {
        id: i64,
    }

    fn book(title: &str) -> Book {
        Book {
            id: uuid::Uuid::new_v4(),
            title: title.to_string(),
            code: "B001".to_string(),
            is_deleted: false,
        }
    }

    fn book_model() -> SearchModel {
        let mut model = SearchModel::new();
        model
            .entity::<Book, _>(|e| {
                e.id("Id", |b: &Book| b.id)
                    .field("Title", |b: &Book| b.title.clone(), |f| f.store().boost(2.0))
                    .field("Code", |b: &Book| b.code.clone(), |f| f.keyword().store())
                    .exclude_from_index_when(|b: &Book| b.is_deleted)
            })
            .unwrap();
        model
    }

    #[test]
    fn test_index_name_defaults_to_type_name() {
        let model = book_model();
        let descriptor = model.get_for::<Book>().unwrap();
        assert_eq!(descriptor.index_name(), "Book");
        assert!(model.find("book").is_some());
        assert!(model.find("BOOK").is_some());
        assert!(model.find("Author").is_none());
    }

    #[test]
    fn test_field_flags() {
        let model = book_model();
        let descriptor = model.get_for::<Book>().unwrap();
        let title = descriptor.field("Title").unwrap();
        assert!(title.is_searchable());
        assert!(title.is_stored());
        assert_eq!(title.boost(), Some(2.0));

        let code = descriptor.field("Code").unwrap();
        assert!(code.is_keyword());
        assert_eq!(descriptor.stored_fields().count(), 2);
    }

    #[test]
    fn test_store_only_is_not_searchable() {
        let mut model = SearchModel::new();
        model
            .entity::<Book, _>(|e| {
                e.id("Id", |b: &Book| b.id)
                    .value_field(|b: &Book| b.title.len() as u64, |f| f.store_only())
            })
            .unwrap();
        let descriptor = model.get_for::<Book>().unwrap();
        let value = descriptor.field(DEFAULT_VALUE_FIELD).unwrap();
        assert!(value.is_stored());
        assert!(!value.is_searchable());
        assert!(!value.is_indexed());
        assert_eq!(descriptor.searchable_fields().count(), 0);
    }

    #[test]
    fn test_entity_id_and_exclusion() {
        let model = book_model();
        let descriptor = model.get_for::<Book>().unwrap();

        let mut entity = book("Lucene in Action");
        assert_eq!(descriptor.entity_id(&entity), Some(entity.id.to_string()));
        assert!(!descriptor.is_excluded(&entity));

        entity.is_deleted = true;
        assert!(descriptor.is_excluded(&entity));

        entity.id = uuid::Uuid::nil();
        assert_eq!(descriptor.entity_id(&entity), None);

        // Foreign types never match the accessors
        assert!(!descriptor.accepts(&Author { id: 1 }));
        assert_eq!(descriptor.entity_id(&Author { id: 1 }), None);
        assert!(!descriptor.is_excluded(&Author { id: 1 }));
    }

    #[test]
    fn test_duplicate_index_name_rejected() {
        let mut model = book_model();
        let result = model.entity_named::<Author, _>("book", |e| e.id("Id", |a: &Author| a.id));
        assert!(matches!(result, Err(SearchError::DuplicateIndexName(_))));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let result = EntitySearchBuilder::<Book>::new("Book")
            .id("Id", |b: &Book| b.id)
            .field("Title", |b: &Book| b.title.clone(), |f| f)
            .field("Title", |b: &Book| b.code.clone(), |f| f)
            .build();
        assert!(matches!(result, Err(SearchError::InvalidConfiguration(_))));

        let result = EntitySearchBuilder::<Book>::new("Book")
            .id("Id", |b: &Book| b.id)
            .field("Id", |b: &Book| b.title.clone(), |f| f)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_id_accessor_rejected() {
        let result = EntitySearchBuilder::<Author>::new("Author").build();
        assert!(matches!(result, Err(SearchError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_forced_filter_scope() {
        let mut model = SearchModel::new();
        model
            .entity::<Book, _>(|e| {
                e.id("Id", |b: &Book| b.id)
                    .force_filter(|ctx| Some(ctx.filters().none()))
                    .force_filter_for(SearchScope::Many, |ctx| Some(ctx.filters().none()))
            })
            .unwrap();
        let filters = model.get_for::<Book>().unwrap().forced_filters();
        assert_eq!(filters.len(), 2);
        assert!(filters[0].applies_to(SearchScope::Single));
        assert!(filters[1].applies_to(SearchScope::Many));
        assert!(!filters[1].applies_to(SearchScope::Single));
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<Book>(), "Book");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
    }
}
