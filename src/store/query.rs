//! Query model - equality/range filters, ordering and limits
//!
//! Backends without a query engine evaluate queries in process with
//! [`Query::apply`].

use super::Document;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Field is missing or null.
    IsNull,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gte, value)
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOp::IsNull, Value::Null)
    }

    /// Evaluate this filter against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        let actual = field_at(doc, &self.field).unwrap_or(&Value::Null);

        match self.op {
            FilterOp::IsNull => actual.is_null(),
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// Collection query: all filters must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Filter, order and truncate a set of candidate documents.
    pub fn apply<I>(&self, docs: I) -> Vec<Document>
    where
        I: IntoIterator<Item = Document>,
    {
        let mut out: Vec<Document> = docs.into_iter().filter(|d| self.matches(d)).collect();

        if let Some((field, direction)) = &self.order_by {
            out.sort_by(|a, b| {
                let left = field_at(a, field).unwrap_or(&Value::Null);
                let right = field_at(b, field).unwrap_or(&Value::Null);
                // Nulls sort first ascending
                let ord = match (left.is_null(), right.is_null()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => compare(left, right).unwrap_or(Ordering::Equal),
                };
                match direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Resolve a dotted path (`usage.files_uploaded`) inside a document.
pub fn field_at<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed.
pub fn set_field(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !entry.is_object() {
                *entry = Value::Object(Document::new());
            }
            if let Value::Object(child) = entry {
                set_field(child, rest, value);
            }
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_nested_paths() {
        let mut d = Document::new();
        set_field(&mut d, "family.role", json!("viewer"));
        assert_eq!(field_at(&d, "family.role"), Some(&json!("viewer")));

        // Overwriting a null parent replaces it with an object
        set_field(&mut d, "family", Value::Null);
        set_field(&mut d, "family.owner_id", json!("u1"));
        assert_eq!(field_at(&d, "family.owner_id"), Some(&json!("u1")));
        assert_eq!(field_at(&d, "family.role"), None);
    }

    #[test]
    fn test_is_null_matches_missing_and_null() {
        let f = Filter::is_null("folder_id");
        assert!(f.matches(&doc(json!({}))));
        assert!(f.matches(&doc(json!({ "folder_id": null }))));
        assert!(!f.matches(&doc(json!({ "folder_id": "f1" }))));
    }

    #[test]
    fn test_range_filters_and_ordering() {
        let docs = vec![
            doc(json!({ "id": "a", "created_at": 30 })),
            doc(json!({ "id": "b", "created_at": 10 })),
            doc(json!({ "id": "c", "created_at": 20 })),
            doc(json!({ "id": "d" })),
        ];

        let q = Query::new()
            .filter(Filter::gte("created_at", 10))
            .filter(Filter::lt("created_at", 30))
            .order_by("created_at", Direction::Descending);
        let ids: Vec<_> = q.apply(docs.clone()).iter().map(|d| d["id"].clone()).collect();
        assert_eq!(ids, vec![json!("c"), json!("b")]);

        let q = Query::new().order_by("created_at", Direction::Ascending).limit(2);
        let ids: Vec<_> = q.apply(docs).iter().map(|d| d["id"].clone()).collect();
        assert_eq!(ids, vec![json!("d"), json!("b")]);
    }

    #[test]
    fn test_mismatched_types_never_match_ranges() {
        let d = doc(json!({ "n": "10" }));
        assert!(!Filter::gte("n", 5).matches(&d));
        assert!(!Filter::lt("n", 50).matches(&d));
    }
}
