//! 言語モデル応答のJSON Schema。

use once_cell::sync::Lazy;
use serde_json::{Value, json};

/// Topic extraction response. Count bounds are checked after de-duplication,
/// so the schema only caps obviously runaway output.
pub(crate) static TOPICS_RESPONSE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "$id": "https://repurpose.dev/schemas/language-model/topics-response.json",
        "title": "Topic Extraction Response",
        "type": "object",
        "properties": {
            "topics": {
                "type": "array",
                "items": {
                    "type": "string",
                    "minLength": 1,
                    "maxLength": 120
                },
                "minItems": 1,
                "maxItems": 40
            }
        },
        "required": ["topics"]
    })
});

/// SEO title response: one title per approach.
pub(crate) static TITLES_RESPONSE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "$id": "https://repurpose.dev/schemas/language-model/titles-response.json",
        "title": "SEO Titles Response",
        "type": "object",
        "properties": {
            "titles": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "approach": {
                            "type": "string",
                            "enum": ["curiosity", "benefit", "listicle", "question", "statement"]
                        },
                        "title": {
                            "type": "string",
                            "minLength": 1,
                            "maxLength": 150
                        }
                    },
                    "required": ["approach", "title"]
                },
                "minItems": 5,
                "maxItems": 5
            }
        },
        "required": ["titles"]
    })
});
