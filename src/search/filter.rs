//! Filter context, filter helpers and ad-hoc filter providers

use crate::search::descriptor::{EntitySearchDescriptor, SearchScope};
use crate::search::error::SearchResult;
use crate::search::query::SearchQuery;
use async_trait::async_trait;
use std::collections::HashSet;
use tantivy::query::{AllQuery, BooleanQuery, EmptyQuery, Occur, Query, TermQuery};
use tantivy::schema::{IndexRecordOption, Schema};
use tantivy::Term;

/// Everything a filter needs to know about the search being composed
pub struct FilterContext<'a> {
    /// Entity name as requested by the caller
    pub entity_name: &'a str,

    /// Descriptor of the index being queried
    pub descriptor: &'a EntitySearchDescriptor,

    /// The caller's search request
    pub request: &'a SearchQuery,

    /// Single or multi-index search
    pub scope: SearchScope,

    /// Schema of the index being queried
    pub schema: &'a Schema,
}

impl<'a> FilterContext<'a> {
    /// Filter helpers bound to the queried index
    pub fn filters(&self) -> QueryFilters<'a> {
        QueryFilters::new(self.schema)
    }

    /// Case-insensitive check against the descriptor's index name
    pub fn is_index(&self, index_name: &str) -> bool {
        self.descriptor.index_name().eq_ignore_ascii_case(index_name)
    }
}

/// Builders of the common filter shapes
#[derive(Clone, Copy)]
pub struct QueryFilters<'a> {
    schema: &'a Schema,
}

impl<'a> QueryFilters<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Matches no document
    pub fn none(&self) -> Box<dyn Query> {
        Box::new(EmptyQuery)
    }

    /// Matches every document
    pub fn all(&self) -> Box<dyn Query> {
        Box::new(AllQuery)
    }

    /// Exact term match; an unknown field matches nothing
    pub fn term(&self, field: &str, value: &str) -> Box<dyn Query> {
        match self.schema.get_field(field) {
            Ok(field) => Box::new(TermQuery::new(
                Term::from_field_text(field, value),
                IndexRecordOption::Basic,
            )),
            Err(_) => {
                tracing::debug!(field = %field, "Filter on unknown field resolves to no match");
                self.none()
            }
        }
    }

    /// IN filter that matches nothing when no usable value is given
    pub fn any_of<I, S>(&self, field: &str, values: I) -> Box<dyn Query>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.any_of_or(field, values, true)
    }

    /// IN filter; an empty list matches nothing or everything per `match_none_when_empty`
    pub fn any_of_or<I, S>(&self, field: &str, values: I, match_none_when_empty: bool) -> Box<dyn Query>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let values: Vec<String> = values
            .into_iter()
            .map(|v| v.as_ref().to_string())
            .filter(|v| !v.trim().is_empty())
            .filter(|v| seen.insert(v.clone()))
            .collect();

        match values.len() {
            0 if match_none_when_empty => self.none(),
            0 => self.all(),
            1 => self.term(field, &values[0]),
            _ => Box::new(BooleanQuery::new(
                values
                    .iter()
                    .map(|v| (Occur::Should, self.term(field, v)))
                    .collect(),
            )),
        }
    }

    /// Every document except those matching `query`
    pub fn not(&self, query: Box<dyn Query>) -> Box<dyn Query> {
        Box::new(BooleanQuery::new(vec![
            (Occur::Must, self.all()),
            (Occur::MustNot, query),
        ]))
    }
}

/// Per-query filter contributor, typically for caller-based access control
///
/// Providers see every search and must return `Ok(None)` for entities they
/// do not care about.
#[async_trait]
pub trait SearchFilterProvider: Send + Sync {
    async fn build(&self, ctx: &FilterContext<'_>) -> SearchResult<Option<Box<dyn Query>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tantivy::collector::Count;
    use tantivy::schema::{STORED, STRING};
    use tantivy::{doc, Index};

    fn index_with_codes(codes: &[&str]) -> (Index, Schema) {
        let mut builder = Schema::builder();
        let code = builder.add_text_field("Code", STRING | STORED);
        let schema = builder.build();
        let index = Index::create_in_ram(schema.clone());
        let mut writer = index.writer(50_000_000).unwrap();
        for value in codes {
            writer.add_document(doc!(code => *value)).unwrap();
        }
        writer.commit().unwrap();
        (index, schema)
    }

    fn count(index: &Index, query: &dyn Query) -> usize {
        index.reader().unwrap().searcher().search(query, &Count).unwrap()
    }

    #[test]
    fn test_any_of_variants() {
        let (index, schema) = index_with_codes(&["B001", "B002", "B003"]);
        let filters = QueryFilters::new(&schema);

        assert_eq!(count(&index, &*filters.any_of("Code", Vec::<String>::new())), 0);
        assert_eq!(count(&index, &*filters.any_of_or("Code", Vec::<&str>::new(), false)), 3);
        assert_eq!(count(&index, &*filters.any_of("Code", ["B002"])), 1);
        assert_eq!(count(&index, &*filters.any_of("Code", ["B001", " ", "B003", "B001"])), 2);
    }

    #[test]
    fn test_blank_values_only_match_nothing() {
        let (index, schema) = index_with_codes(&["B001"]);
        let filters = QueryFilters::new(&schema);
        assert_eq!(count(&index, &*filters.any_of("Code", ["", "  "])), 0);
    }

    #[test]
    fn test_unknown_field_matches_nothing() {
        let (index, schema) = index_with_codes(&["B001"]);
        let filters = QueryFilters::new(&schema);
        assert_eq!(count(&index, &*filters.term("Missing", "B001")), 0);
    }

    #[test]
    fn test_not() {
        let (index, schema) = index_with_codes(&["B001", "B002", "B003"]);
        let filters = QueryFilters::new(&schema);
        let query = filters.not(filters.term("Code", "B002"));
        assert_eq!(count(&index, &*query), 2);
    }
}
