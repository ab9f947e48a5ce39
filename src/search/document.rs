//! Schema derivation and entity-to-document projection

use crate::search::descriptor::EntitySearchDescriptor;
use crate::search::error::{SearchError, SearchResult};
use std::any::Any;
use std::collections::HashMap;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::{TantivyDocument, Term};

/// System field recording which index a document was written to
pub const INDEX_NAME_FIELD: &str = "__IndexName";

/// Build the tantivy schema of an entity descriptor
pub fn build_schema(descriptor: &EntitySearchDescriptor) -> Schema {
    let mut schema_builder = Schema::builder();

    schema_builder.add_text_field(descriptor.id_field(), STRING | STORED);
    schema_builder.add_text_field(INDEX_NAME_FIELD, STRING | STORED);

    for field in descriptor.fields() {
        let name = field.name();
        match (field.is_indexed(), field.is_keyword(), field.is_stored()) {
            (false, _, _) => {
                schema_builder.add_text_field(name, STORED);
            }
            (true, true, true) => {
                schema_builder.add_text_field(name, STRING | STORED);
            }
            (true, true, false) => {
                schema_builder.add_text_field(name, STRING);
            }
            (true, false, true) => {
                schema_builder.add_text_field(name, TEXT | STORED);
            }
            (true, false, false) => {
                schema_builder.add_text_field(name, TEXT);
            }
        }
    }

    schema_builder.build()
}

/// A projected entity ready to be written
#[derive(Debug)]
pub struct ProjectedDocument {
    /// Value of the id field
    pub id: String,

    /// The tantivy document
    pub document: TantivyDocument,
}

/// Converts entity instances into tantivy documents
pub struct DocumentProjector<'a> {
    descriptor: &'a EntitySearchDescriptor,
    schema: &'a Schema,
}

impl<'a> DocumentProjector<'a> {
    pub fn new(descriptor: &'a EntitySearchDescriptor, schema: &'a Schema) -> Self {
        Self { descriptor, schema }
    }

    /// Project one entity; an entity of the wrong type or without id is rejected
    pub fn project(&self, entity: &dyn Any) -> SearchResult<ProjectedDocument> {
        if !self.descriptor.accepts(entity) {
            return Err(SearchError::IndexingFailed(format!(
                "entity is not a {}",
                self.descriptor.type_name()
            )));
        }

        let id = self.descriptor.entity_id(entity).ok_or_else(|| {
            SearchError::IndexingFailed(format!(
                "{} entity has no resolvable id",
                self.descriptor.index_name()
            ))
        })?;

        let mut document = TantivyDocument::new();
        document.add_text(self.field(self.descriptor.id_field())?, &id);
        document.add_text(self.field(INDEX_NAME_FIELD)?, self.descriptor.index_name());

        for field in self.descriptor.fields() {
            if let Some(value) = field.value(entity) {
                document.add_text(self.field(field.name())?, &value);
            }
        }

        Ok(ProjectedDocument { id, document })
    }

    fn field(&self, name: &str) -> SearchResult<Field> {
        self.schema
            .get_field(name)
            .map_err(|e| SearchError::SchemaError(format!("{}: {}", name, e)))
    }
}

/// Id term of a document in the given schema
pub fn id_term(descriptor: &EntitySearchDescriptor, schema: &Schema, id: &str) -> SearchResult<Term> {
    let field = schema
        .get_field(descriptor.id_field())
        .map_err(|e| SearchError::SchemaError(e.to_string()))?;
    Ok(Term::from_field_text(field, id))
}

/// First text value of a named field
pub fn first_text(doc: &TantivyDocument, schema: &Schema, name: &str) -> Option<String> {
    let field = schema.get_field(name).ok()?;
    doc.get_first(field)
        .and_then(|value| value.as_str())
        .map(|text| text.to_string())
}

/// Stored values of the descriptor's stored fields that are present in the document
pub fn stored_payload(
    descriptor: &EntitySearchDescriptor,
    schema: &Schema,
    doc: &TantivyDocument,
) -> HashMap<String, String> {
    descriptor
        .stored_fields()
        .filter_map(|field| {
            first_text(doc, schema, field.name()).map(|value| (field.name().to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::descriptor::SearchModel;
    use tantivy::schema::IndexRecordOption;

    struct Book {
        id: String,
        title: String,
        code: String,
        notes: Option<String>,
    }

    fn model() -> SearchModel {
        let mut model = SearchModel::new();
        model
            .entity::<Book, _>(|e| {
                e.id("Id", |b: &Book| b.id.clone())
                    .field("Title", |b: &Book| b.title.clone(), |f| f.store())
                    .field("Code", |b: &Book| b.code.clone(), |f| f.keyword().store())
                    .field("Notes", |b: &Book| b.notes.clone(), |f| f)
                    .value_field(|b: &Book| b.title.len() as u64, |f| f.name("Length").store_only())
            })
            .unwrap();
        model
    }

    #[test]
    fn test_schema_field_options() {
        let model = model();
        let schema = build_schema(model.get_for::<Book>().unwrap());

        let id = schema.get_field_entry(schema.get_field("Id").unwrap());
        assert!(id.is_indexed());
        assert!(id.is_stored());

        let title = schema.get_field_entry(schema.get_field("Title").unwrap());
        assert_eq!(
            title.field_type().get_index_record_option(),
            Some(IndexRecordOption::WithFreqsAndPositions)
        );

        let code = schema.get_field_entry(schema.get_field("Code").unwrap());
        assert_eq!(
            code.field_type().get_index_record_option(),
            Some(IndexRecordOption::Basic)
        );

        let length = schema.get_field_entry(schema.get_field("Length").unwrap());
        assert!(!length.is_indexed());
        assert!(length.is_stored());

        assert!(schema.get_field(INDEX_NAME_FIELD).is_ok());
    }

    #[test]
    fn test_project_book() {
        let model = model();
        let descriptor = model.get_for::<Book>().unwrap();
        let schema = build_schema(descriptor);
        let projector = DocumentProjector::new(descriptor, &schema);

        let projected = projector
            .project(&Book {
                id: "b-1".to_string(),
                title: "Lucene in Action".to_string(),
                code: "B001".to_string(),
                notes: None,
            })
            .unwrap();

        assert_eq!(projected.id, "b-1");
        let payload = stored_payload(descriptor, &schema, &projected.document);
        assert_eq!(payload.get("Title").map(String::as_str), Some("Lucene in Action"));
        assert_eq!(payload.get("Code").map(String::as_str), Some("B001"));
        assert_eq!(payload.get("Length").map(String::as_str), Some("16"));
        assert!(!payload.contains_key("Notes"));
        assert_eq!(
            first_text(&projected.document, &schema, INDEX_NAME_FIELD).as_deref(),
            Some("Book")
        );
    }

    #[test]
    fn test_project_rejects_missing_id_and_foreign_type() {
        let model = model();
        let descriptor = model.get_for::<Book>().unwrap();
        let schema = build_schema(descriptor);
        let projector = DocumentProjector::new(descriptor, &schema);

        let result = projector.project(&Book {
            id: "  ".to_string(),
            title: "Untitled".to_string(),
            code: "B009".to_string(),
            notes: None,
        });
        assert!(matches!(result, Err(SearchError::IndexingFailed(_))));

        let result = projector.project(&42_u32);
        assert!(matches!(result, Err(SearchError::IndexingFailed(_))));
    }
}
