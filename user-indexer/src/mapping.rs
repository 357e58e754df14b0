use serde_json::{json, Value};

/// Index settings and mappings for user documents. Nicknames are indexed twice:
/// whole words for exact search, and edge n-grams for search-as-you-type.
pub fn users_index() -> Value {
    json!({
        "settings": {
            "analysis": {
                "filter": {
                    "autocomplete": {
                        "type": "edge_ngram",
                        "min_gram": 1,
                        "max_gram": 20
                    }
                },
                "analyzer": {
                    "nickname": {
                        "type": "standard",
                        "stopwords": []
                    },
                    "nickname_autocomplete": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase", "autocomplete"]
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "id": { "type": "keyword" },
                "email": { "type": "keyword" },
                "dob": { "type": "date", "format": "yyyy-MM-dd" },
                "weight": { "type": "integer" },
                "height": { "type": "integer" },
                "nickname": {
                    "type": "text",
                    "analyzer": "nickname",
                    "fields": {
                        "autocomplete": {
                            "type": "text",
                            "analyzer": "nickname_autocomplete",
                            "search_analyzer": "nickname"
                        }
                    }
                },
                "country": { "type": "integer" },
                "city": { "type": "text" },
                "caption": { "type": "text" },
                "location": { "type": "geo_point" },
                "gender": { "type": "integer" }
            }
        }
    })
}
