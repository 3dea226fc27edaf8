use std::collections::BTreeSet;

use crate::snapshot::SchemaPayload;

/// Small English stopword set; everything else in the user text is a
/// candidate token.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "all", "any", "by", "can", "do", "for", "from", "get", "give", "has",
    "have", "how", "i", "in", "is", "it", "last", "like", "list", "many", "me", "my", "of", "on",
    "or", "per", "please", "show", "some", "than", "that", "the", "their", "them", "this", "to",
    "top", "us", "was", "we", "were", "what", "when", "where", "which", "who", "with", "you",
];

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Tables/collections whose name or any field name contains one of the
/// text's tokens. An empty result is a valid outcome.
pub fn match_candidates(text: &str, payload: &SchemaPayload) -> Vec<String> {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut matched = BTreeSet::new();
    for entity in payload.entities() {
        let entity_lower = entity.name.to_lowercase();
        let hit = tokens.iter().any(|token| {
            entity_lower.contains(token.as_str())
                || token.contains(&entity_lower)
                || entity
                    .fields
                    .iter()
                    .any(|field| field.to_lowercase().contains(token.as_str()))
        });
        if hit {
            matched.insert(entity.name);
        }
    }

    matched.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::{match_candidates, tokenize};
    use crate::snapshot::{ColumnInfo, RelationalTable, SchemaPayload};

    fn payload() -> SchemaPayload {
        SchemaPayload::Relational(vec![
            RelationalTable {
                qualified_table: "public.orders".to_string(),
                columns: vec![ColumnInfo {
                    name: "total_amount".to_string(),
                    data_type: "numeric".to_string(),
                    nullable: false,
                }],
                primary_key: vec![],
                foreign_keys: vec![],
            },
            RelationalTable {
                qualified_table: "public.users".to_string(),
                columns: vec![ColumnInfo {
                    name: "email".to_string(),
                    data_type: "text".to_string(),
                    nullable: false,
                }],
                primary_key: vec![],
                foreign_keys: vec![],
            },
        ])
    }

    #[test]
    fn stopwords_are_dropped_from_tokens() {
        let tokens = tokenize("show me the latest orders");
        assert_eq!(tokens, vec!["latest".to_string(), "orders".to_string()]);
    }

    #[test]
    fn candidates_match_on_table_names() {
        let candidates = match_candidates("how many orders do we have", &payload());
        assert_eq!(candidates, vec!["orders".to_string()]);
    }

    #[test]
    fn candidates_match_on_field_names() {
        let candidates = match_candidates("find the account with this email", &payload());
        assert_eq!(candidates, vec!["users".to_string()]);
    }

    #[test]
    fn singular_forms_match_plural_tables() {
        let candidates = match_candidates("latest order", &payload());
        assert_eq!(candidates, vec!["orders".to_string()]);
    }

    #[test]
    fn no_match_is_a_valid_empty_result() {
        let candidates = match_candidates("weather in lisbon", &payload());
        assert!(candidates.is_empty());
    }
}
