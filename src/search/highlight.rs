//! Highlighted fragments of stored fields

use crate::search::config::HighlightConfig;
use crate::search::descriptor::EntitySearchDescriptor;
use crate::search::query::{ExpansionKind, TermExpansion};
use std::collections::{BTreeMap, HashMap};
use tantivy::query::Query;
use tantivy::schema::{Field, Schema, Value};
use tantivy::snippet::SnippetGenerator;
use tantivy::{Score, Searcher, TantivyDocument, Term};
use tracing::debug;

/// Produces `<em>`-style fragments for the stored fields of hits
#[derive(Debug, Clone)]
pub struct Highlighter {
    config: HighlightConfig,
}

impl Highlighter {
    pub fn new(config: HighlightConfig) -> Self {
        Self { config }
    }

    /// Prepare one snippet generator per stored field for a query
    ///
    /// Terms come from the query itself plus whatever `expansions` resolve
    /// to in the searcher's term dictionaries. Fields the generator cannot
    /// be built for, or that no term touches, are left out.
    pub fn prepare<'d>(
        &self,
        searcher: &Searcher,
        query: &dyn Query,
        expansions: &[TermExpansion],
        schema: &Schema,
        descriptors: impl IntoIterator<Item = &'d EntitySearchDescriptor>,
    ) -> HighlightPlan {
        let mut generators: Vec<(String, Field, SnippetGenerator)> = Vec::new();

        for descriptor in descriptors {
            for stored in descriptor.stored_fields() {
                if generators.iter().any(|(name, _, _)| name == stored.name()) {
                    continue;
                }
                let Ok(field) = schema.get_field(stored.name()) else {
                    continue;
                };
                match self.generator(searcher, query, expansions, field) {
                    Ok(Some(generator)) => generators.push((stored.name().to_string(), field, generator)),
                    Ok(None) => {}
                    Err(e) => {
                        debug!(field = %stored.name(), error = %e, "Field cannot be highlighted");
                    }
                }
            }
        }

        HighlightPlan {
            pre_tag: self.config.pre_tag.clone(),
            post_tag: self.config.post_tag.clone(),
            generators,
        }
    }

    fn generator(
        &self,
        searcher: &Searcher,
        query: &dyn Query,
        expansions: &[TermExpansion],
        field: Field,
    ) -> tantivy::Result<Option<SnippetGenerator>> {
        let mut literal: Vec<Term> = Vec::new();
        query.query_terms(&mut |term, _| {
            if term.field() == field {
                literal.push(term.clone());
            }
        });

        // Rarer terms weigh more when fragments are ranked
        let mut terms: BTreeMap<String, Score> = BTreeMap::new();
        for term in &literal {
            let value = term.value();
            let Some(text) = value.as_str() else {
                continue;
            };
            let doc_freq = searcher.doc_freq(term)?;
            if doc_freq > 0 {
                terms.insert(text.to_string(), weight(doc_freq));
            }
        }
        for expansion in expansions.iter().filter(|e| e.field == field) {
            for (text, doc_freq) in expand(searcher, expansion)? {
                terms.entry(text).or_insert_with(|| weight(doc_freq));
            }
        }

        if terms.is_empty() {
            return Ok(None);
        }

        let tokenizer = searcher.index().tokenizer_for_field(field)?;
        Ok(Some(SnippetGenerator::new(
            terms,
            tokenizer,
            field,
            self.config.fragment_size,
        )))
    }
}

fn weight(doc_freq: u64) -> Score {
    1.0 / (1.0 + doc_freq as Score)
}

/// Indexed terms an expansion matches, with their document frequency
fn expand(searcher: &Searcher, expansion: &TermExpansion) -> tantivy::Result<BTreeMap<String, u64>> {
    let mut matched: BTreeMap<String, u64> = BTreeMap::new();

    for segment in searcher.segment_readers() {
        let inverted = segment.inverted_index(expansion.field)?;
        let terms = inverted.terms();
        let mut stream = match expansion.kind {
            ExpansionKind::Prefix => terms.range().ge(expansion.word.as_bytes()).into_stream()?,
            ExpansionKind::Fuzzy(_) => terms.stream()?,
        };

        while stream.advance() {
            let Ok(text) = std::str::from_utf8(stream.key()) else {
                continue;
            };
            let keep = match expansion.kind {
                ExpansionKind::Prefix => {
                    if !text.starts_with(expansion.word.as_str()) {
                        break;
                    }
                    true
                }
                ExpansionKind::Fuzzy(distance) => within_edits(&expansion.word, text, distance as usize),
            };
            if keep {
                *matched.entry(text.to_string()).or_default() += u64::from(stream.value().doc_freq);
            }
        }
    }

    Ok(matched)
}

/// Edit distance no greater than `max`, an adjacent transposition counting as one edit
fn within_edits(a: &str, b: &str, max: usize) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return false;
    }

    let width = b.len() + 1;
    let mut rows = vec![vec![0usize; width]; a.len() + 1];
    for (i, row) in rows.iter_mut().enumerate() {
        row[0] = i;
    }
    for (j, cell) in rows[0].iter_mut().enumerate() {
        *cell = j;
    }

    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let mut best = (rows[i - 1][j] + 1)
                .min(rows[i][j - 1] + 1)
                .min(rows[i - 1][j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                best = best.min(rows[i - 2][j - 2] + 1);
            }
            rows[i][j] = best;
        }
    }

    rows[a.len()][b.len()] <= max
}

/// Snippet generators bound to one query and one searcher
pub struct HighlightPlan {
    pre_tag: String,
    post_tag: String,
    generators: Vec<(String, Field, SnippetGenerator)>,
}

impl HighlightPlan {
    /// Fragments per field; fields without overlap are omitted
    pub fn apply(&self, doc: &TantivyDocument) -> HashMap<String, Vec<String>> {
        let mut highlights = HashMap::new();

        for (name, field, generator) in &self.generators {
            let Some(text) = doc.get_first(*field).and_then(|v| v.as_str()) else {
                continue;
            };
            if text.is_empty() {
                continue;
            }

            let mut snippet = generator.snippet(text);
            if snippet.is_empty() {
                continue;
            }
            snippet.set_snippet_prefix_postfix(&self.pre_tag, &self.post_tag);
            highlights.insert(name.clone(), vec![snippet.to_html()]);
        }

        highlights
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::config::SearchConfig;
    use crate::search::descriptor::SearchModel;
    use crate::search::document::{build_schema, DocumentProjector};
    use crate::search::query::{QueryComposer, SearchQuery};
    use tantivy::collector::TopDocs;
    use tantivy::query::QueryParser;
    use tantivy::{DocAddress, Index};

    struct Book {
        id: String,
        title: String,
        summary: String,
    }

    fn setup() -> (SearchModel, Index) {
        let mut model = SearchModel::new();
        model
            .entity::<Book, _>(|e| {
                e.id("Id", |b: &Book| b.id.clone())
                    .field("Title", |b: &Book| b.title.clone(), |f| f.store())
                    .field("Summary", |b: &Book| b.summary.clone(), |f| f.store())
            })
            .unwrap();
        let descriptor = model.get_for::<Book>().unwrap();
        let schema = build_schema(descriptor);
        let index = Index::create_in_ram(schema.clone());
        let mut writer = index.writer(50_000_000).unwrap();
        let projected = DocumentProjector::new(descriptor, &schema)
            .project(&Book {
                id: "1".to_string(),
                title: "Lucene in Action".to_string(),
                summary: "A practical guide to search".to_string(),
            })
            .unwrap();
        writer.add_document(projected.document).unwrap();
        writer.commit().unwrap();
        (model, index)
    }

    /// Run `request` through the composer and highlight the top hit
    fn highlight_top(model: &SearchModel, index: &Index, request: SearchQuery) -> HashMap<String, Vec<String>> {
        let descriptor = model.get_for::<Book>().unwrap();
        let schema = index.schema();
        let composer = QueryComposer::new(&SearchConfig::default());
        let query = composer.lexical(index, &schema, descriptor, &request).unwrap();
        let expansions = composer.expansions(index, descriptor, &request);

        let searcher = index.reader().unwrap().searcher();
        let hits: Vec<(f32, DocAddress)> = searcher.search(&*query, &TopDocs::with_limit(1)).unwrap();
        let doc: TantivyDocument = searcher.doc(hits[0].1).unwrap();

        Highlighter::new(HighlightConfig::default())
            .prepare(&searcher, &*query, &expansions, &schema, [&**descriptor])
            .apply(&doc)
    }

    #[test]
    fn test_highlights_matching_stored_fields() {
        let (model, index) = setup();
        let descriptor = model.get_for::<Book>().unwrap();
        let schema = index.schema();
        let searcher = index.reader().unwrap().searcher();
        let title = schema.get_field("Title").unwrap();
        let query = QueryParser::for_index(&index, vec![title]).parse_query("lucene").unwrap();
        let hits: Vec<(f32, DocAddress)> = searcher.search(&*query, &TopDocs::with_limit(1)).unwrap();
        let doc: TantivyDocument = searcher.doc(hits[0].1).unwrap();

        let plan = Highlighter::new(HighlightConfig::default()).prepare(
            &searcher,
            &*query,
            &[],
            &schema,
            [&**descriptor],
        );
        let highlights = plan.apply(&doc);

        let title = highlights.get("Title").unwrap();
        assert!(title[0].contains("<em>Lucene</em>"));
        assert!(!highlights.contains_key("Summary"));
    }

    #[test]
    fn test_prefix_match_is_highlighted() {
        let (model, index) = setup();
        let highlights = highlight_top(&model, &index, SearchQuery::new("Luc"));

        assert_eq!(highlights["Title"], vec!["<em>Lucene</em> in Action".to_string()]);
        assert!(!highlights.contains_key("Summary"));
    }

    #[test]
    fn test_fuzzy_match_is_highlighted() {
        let (model, index) = setup();
        let request = SearchQuery::new("Lucenr").with_prefix(false).with_fuzzy(true);
        let highlights = highlight_top(&model, &index, request);

        assert!(highlights["Title"][0].contains("<em>Lucene</em>"));
    }

    #[test]
    fn test_within_edits() {
        assert!(within_edits("lucenr", "lucene", 1));
        assert!(within_edits("lucnee", "lucene", 1));
        assert!(!within_edits("lcunee", "lucene", 1));
        assert!(within_edits("luc", "luc", 0));
        assert!(!within_edits("luc", "lucene", 2));
    }
}
