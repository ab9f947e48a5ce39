//! Search requests and query composition

use crate::search::config::{MultiFieldMode, SearchConfig};
use crate::search::descriptor::{EntitySearchDescriptor, SearchScope};
use crate::search::error::{SearchError, SearchResult};
use crate::search::filter::{FilterContext, SearchFilterProvider};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tantivy::query::{BooleanQuery, BoostQuery, FuzzyTermQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema};
use tantivy::tokenizer::TokenStream;
use tantivy::{Index, Term};
use tracing::{debug, warn};

/// Single-index search request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Query text in the parser's syntax
    pub query: String,

    /// Add a prefix-expanded variant of the last word
    pub prefix: bool,

    /// Add a fuzzy variant of the last word
    pub fuzzy: bool,

    /// Produce highlighted fragments for stored fields
    pub highlight: bool,

    /// Number of ranked hits to skip
    pub skip: usize,

    /// Number of hits to return; the configured page size when unset
    pub take: Option<usize>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            prefix: true,
            fuzzy: false,
            highlight: false,
            skip: 0,
            take: None,
        }
    }

    pub fn with_prefix(mut self, prefix: bool) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_fuzzy(mut self, fuzzy: bool) -> Self {
        self.fuzzy = fuzzy;
        self
    }

    pub fn with_highlight(mut self, highlight: bool) -> Self {
        self.highlight = highlight;
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_take(mut self, take: usize) -> Self {
        self.take = Some(take);
        self
    }
}

/// Search request spanning several indexes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiSearchQuery {
    /// Index names to search
    pub entities: Vec<String>,

    /// Query shared by every index
    pub query: SearchQuery,
}

impl MultiSearchQuery {
    pub fn new<I, S>(entities: I, query: SearchQuery) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entities: entities.into_iter().map(Into::into).collect(),
            query,
        }
    }
}

/// How the last word of a query is widened into indexed terms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionKind {
    /// Every term starting with the word
    Prefix,
    /// Every term within the given edit distance, transpositions costing one
    Fuzzy(u8),
}

/// Last analyzed word of a field that a prefix or fuzzy variant expands
///
/// Multi-term queries do not report their matched terms, so highlighting
/// resolves these against the term dictionaries instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermExpansion {
    pub field: Field,
    pub word: String,
    pub kind: ExpansionKind,
}

#[derive(Debug, Clone, Copy)]
enum Variant {
    Literal,
    Prefix,
    Fuzzy(u8),
}

impl Variant {
    fn label(self) -> &'static str {
        match self {
            Variant::Literal => "literal",
            Variant::Prefix => "prefix",
            Variant::Fuzzy(_) => "fuzzy",
        }
    }
}

/// Builds the final boolean query of a search
pub struct QueryComposer {
    mode: MultiFieldMode,
    fuzzy_edits: u8,
    providers: Vec<Arc<dyn SearchFilterProvider>>,
}

impl QueryComposer {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            mode: config.multi_field_mode,
            fuzzy_edits: config.effective_fuzzy_edits(),
            providers: Vec::new(),
        }
    }

    /// Append an ad-hoc filter provider
    pub fn add_provider(&mut self, provider: Arc<dyn SearchFilterProvider>) {
        self.providers.push(provider);
    }

    pub fn providers(&self) -> usize {
        self.providers.len()
    }

    /// Lexical query wrapped as MUST, followed by forced and ad-hoc filters
    pub async fn compose(
        &self,
        index: &Index,
        descriptor: &EntitySearchDescriptor,
        entity_name: &str,
        request: &SearchQuery,
        scope: SearchScope,
    ) -> SearchResult<Box<dyn Query>> {
        let schema = index.schema();
        let mut clauses: Vec<(Occur, Box<dyn Query>)> =
            vec![(Occur::Must, self.lexical(index, &schema, descriptor, request)?)];

        let ctx = FilterContext {
            entity_name,
            descriptor,
            request,
            scope,
            schema: &schema,
        };

        for filter in descriptor.forced_filters() {
            if !filter.applies_to(scope) {
                continue;
            }
            if let Some(query) = filter.build(&ctx) {
                clauses.push((Occur::Must, query));
            }
        }

        for provider in &self.providers {
            if let Some(query) = provider.build(&ctx).await? {
                clauses.push((Occur::Must, query));
            }
        }

        debug!(
            index = %descriptor.index_name(),
            scope = %scope,
            clauses = clauses.len(),
            "Composed search query"
        );

        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    /// Literal query plus the requested prefix and fuzzy variants, OR-ed together
    pub fn lexical(
        &self,
        index: &Index,
        schema: &Schema,
        descriptor: &EntitySearchDescriptor,
        request: &SearchQuery,
    ) -> SearchResult<Box<dyn Query>> {
        let text = request.query.trim();
        if text.is_empty() {
            return Err(SearchError::QueryParsingFailed(
                "query text is empty".to_string(),
            ));
        }

        let fields = searchable_fields(schema, descriptor);
        if fields.is_empty() {
            return Err(SearchError::QueryParsingFailed(format!(
                "index '{}' has no searchable fields",
                descriptor.index_name()
            )));
        }

        let mut variants = vec![Variant::Literal];
        if request.prefix {
            variants.push(Variant::Prefix);
        }
        if request.fuzzy {
            variants.push(Variant::Fuzzy(self.fuzzy_edits));
        }

        let mut queries: Vec<Box<dyn Query>> = Vec::with_capacity(variants.len());
        let mut last_error = None;
        for variant in variants {
            let built = match variant {
                Variant::Literal => self.parse_literal(index, &fields, text),
                Variant::Prefix | Variant::Fuzzy(_) => self.expand(index, schema, &fields, text, variant),
            };
            match built {
                Ok(query) => queries.push(query),
                Err(e) => {
                    warn!(
                        index = %descriptor.index_name(),
                        variant = variant.label(),
                        error = %e,
                        "Skipping query variant"
                    );
                    last_error = Some(e);
                }
            }
        }

        match queries.len() {
            0 => Err(last_error.unwrap_or_else(|| {
                SearchError::QueryParsingFailed(format!("no usable query for '{}'", text))
            })),
            1 => Ok(queries.remove(0)),
            _ => Ok(Box::new(BooleanQuery::new(
                queries.into_iter().map(|q| (Occur::Should, q)).collect(),
            ))),
        }
    }

    /// Expansions of the prefix and fuzzy variants a request enables
    pub fn expansions(
        &self,
        index: &Index,
        descriptor: &EntitySearchDescriptor,
        request: &SearchQuery,
    ) -> Vec<TermExpansion> {
        let mut kinds = Vec::new();
        if request.prefix {
            kinds.push(ExpansionKind::Prefix);
        }
        if request.fuzzy {
            kinds.push(ExpansionKind::Fuzzy(self.fuzzy_edits));
        }
        if kinds.is_empty() {
            return Vec::new();
        }

        let schema = index.schema();
        let mut expansions = Vec::new();
        for (field, _) in searchable_fields(&schema, descriptor) {
            let Ok(tokens) = analyze(index, field, request.query.trim()) else {
                continue;
            };
            let Some(word) = tokens.last() else {
                continue;
            };
            for kind in &kinds {
                expansions.push(TermExpansion {
                    field,
                    word: word.clone(),
                    kind: *kind,
                });
            }
        }
        expansions
    }

    fn parse_literal(
        &self,
        index: &Index,
        fields: &[(Field, Option<f32>)],
        text: &str,
    ) -> SearchResult<Box<dyn Query>> {
        let mut parser = QueryParser::for_index(index, fields.iter().map(|(f, _)| *f).collect());
        if self.mode == MultiFieldMode::And {
            parser.set_conjunction_by_default();
        }
        for (field, boost) in fields {
            if let Some(boost) = boost {
                parser.set_field_boost(*field, *boost);
            }
        }
        Ok(parser.parse_query(text)?)
    }

    /// Term-level variant: leading words must match exactly, the last word is expanded
    fn expand(
        &self,
        index: &Index,
        schema: &Schema,
        fields: &[(Field, Option<f32>)],
        text: &str,
        variant: Variant,
    ) -> SearchResult<Box<dyn Query>> {
        // position -> clauses of every field for that word
        let mut positions: Vec<Vec<(Occur, Box<dyn Query>)>> = Vec::new();

        for &(field, boost) in fields {
            let tokens = analyze(index, field, text)?;
            let Some(last) = tokens.len().checked_sub(1) else {
                continue;
            };

            for (position, token) in tokens.iter().enumerate() {
                let term = Term::from_field_text(field, token);
                let query: Box<dyn Query> = if position < last {
                    let option = schema
                        .get_field_entry(field)
                        .field_type()
                        .get_index_record_option()
                        .unwrap_or(IndexRecordOption::Basic);
                    Box::new(TermQuery::new(term, option))
                } else {
                    match variant {
                        Variant::Prefix => Box::new(FuzzyTermQuery::new_prefix(term, 0, true)),
                        Variant::Fuzzy(distance) => Box::new(FuzzyTermQuery::new(term, distance, true)),
                        Variant::Literal => Box::new(TermQuery::new(term, IndexRecordOption::Basic)),
                    }
                };
                let query = match boost {
                    Some(boost) => Box::new(BoostQuery::new(query, boost)) as Box<dyn Query>,
                    None => query,
                };

                if positions.len() <= position {
                    positions.resize_with(position + 1, Vec::new);
                }
                positions[position].push((Occur::Should, query));
            }
        }

        if positions.is_empty() {
            return Err(SearchError::QueryParsingFailed(format!(
                "'{}' produced no terms",
                text
            )));
        }

        let occur = match self.mode {
            MultiFieldMode::And => Occur::Must,
            MultiFieldMode::Or => Occur::Should,
        };
        Ok(Box::new(BooleanQuery::new(
            positions
                .into_iter()
                .map(|clauses| (occur, Box::new(BooleanQuery::new(clauses)) as Box<dyn Query>))
                .collect(),
        )))
    }
}

fn searchable_fields(schema: &Schema, descriptor: &EntitySearchDescriptor) -> Vec<(Field, Option<f32>)> {
    descriptor
        .searchable_fields()
        .filter_map(|f| schema.get_field(f.name()).ok().map(|field| (field, f.boost())))
        .collect()
}

/// Tokenize `text` with the analyzer the field was indexed with
fn analyze(index: &Index, field: Field, text: &str) -> SearchResult<Vec<String>> {
    let mut analyzer = index.tokenizer_for_field(field)?;
    let mut stream = analyzer.token_stream(text);
    let mut tokens = Vec::new();
    while stream.advance() {
        tokens.push(stream.token().text.clone());
    }
    Ok(tokens)
}
