//! Subscription filters (§3 `NormalizedFilter`, §4.I filter-match
//! semantics). The raw filter a client sends over the wire is an
//! arbitrary-shaped JSON object; `normalize_filter` projects it into the
//! fixed set of lowercase/trimmed arrays spec.md names before any matching
//! happens, so `matches_event` itself is a pure function over two already-
//! normalized shapes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{Event, EventType};

/// The raw, client-supplied filter shape. Every field is optional; absence
/// of a field means "no restriction on this axis", matching spec.md's
/// "empty = no restriction" phrasing.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RawFilter {
    pub paths: Vec<String>,
    #[serde(rename = "absolutePaths")]
    pub absolute_paths: Vec<String>,
    pub extensions: Vec<String>,
    pub types: Vec<String>,
    #[serde(rename = "eventTypes")]
    pub event_types: Vec<String>,
    #[serde(rename = "entityTypes")]
    pub entity_types: Vec<String>,
    #[serde(rename = "relationshipTypes")]
    pub relationship_types: Vec<String>,
    #[serde(rename = "sessionIds")]
    pub session_ids: Vec<String>,
    #[serde(rename = "operationIds")]
    pub operation_ids: Vec<String>,
    #[serde(rename = "sessionEvents")]
    pub session_events: Vec<String>,
    #[serde(rename = "sessionEdgeTypes")]
    pub session_edge_types: Vec<String>,
}

/// Lowercase/trimmed projections of a raw filter (§3 `NormalizedFilter`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedFilter {
    pub paths: Vec<String>,
    pub absolute_paths: Vec<String>,
    pub extensions: Vec<String>,
    pub types: Vec<String>,
    pub event_types: Vec<String>,
    pub entity_types: Vec<String>,
    pub relationship_types: Vec<String>,
    pub session_ids: Vec<String>,
    pub operation_ids: Vec<String>,
    pub session_events: Vec<String>,
    pub session_edge_types: Vec<String>,
}

fn normalize_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

fn normalize_extension(raw: &str) -> String {
    let trimmed = raw.trim().to_lowercase();
    if trimmed.is_empty() {
        return trimmed;
    }
    if trimmed.starts_with('.') {
        trimmed
    } else {
        format!(".{}", trimmed)
    }
}

fn normalize_path(raw: &str) -> String {
    // Resolve to an OS-normalized absolute-ish representation without
    // touching the filesystem (no canonicalize — the path may not exist
    // yet, e.g. a pending create event).
    let path = Path::new(raw.trim());
    let mut normalized = PathBuf::new();
    for component in path.components() {
        normalized.push(component);
    }
    normalized.to_string_lossy().to_lowercase()
}

/// Project a raw client filter into the normalized shape. Idempotent:
/// `normalize_filter` applied to an already-normalized filter's fields
/// yields the same result (§8 round-trip law).
pub fn normalize_filter(raw: &RawFilter) -> NormalizedFilter {
    NormalizedFilter {
        paths: raw.paths.iter().map(|p| normalize_path(p)).collect(),
        absolute_paths: raw.absolute_paths.iter().map(|p| normalize_path(p)).collect(),
        extensions: raw.extensions.iter().map(|e| normalize_extension(e)).collect(),
        types: normalize_list(&raw.types),
        event_types: normalize_list(&raw.event_types),
        entity_types: normalize_list(&raw.entity_types),
        relationship_types: normalize_list(&raw.relationship_types),
        session_ids: normalize_list(&raw.session_ids),
        operation_ids: normalize_list(&raw.operation_ids),
        session_events: normalize_list(&raw.session_events),
        session_edge_types: normalize_list(&raw.session_edge_types),
    }
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn path_matches(filter_paths: &[String], candidate: &str) -> bool {
    let candidate = normalize_path(candidate);
    filter_paths.iter().any(|p| {
        candidate == *p || candidate.starts_with(&format!("{}{}", p, std::path::MAIN_SEPARATOR))
    })
}

/// §4.I filter-match semantics, evaluated over one subscription's
/// normalized filter and one candidate event.
pub fn matches_event(filter: &NormalizedFilter, event: &Event) -> bool {
    if !filter.event_types.is_empty()
        && !filter
            .event_types
            .iter()
            .any(|t| t == event.event_type.as_wire_str())
    {
        return false;
    }

    match event.event_type {
        EventType::FileChange => {
            if !filter.types.is_empty() {
                let Some(change_kind) = str_field(&event.data, "type") else {
                    return false;
                };
                if !filter.types.iter().any(|t| t == &change_kind.to_lowercase()) {
                    return false;
                }
            }

            let path = str_field(&event.data, "path");
            let absolute_path = str_field(&event.data, "absolutePath");

            if !filter.paths.is_empty() {
                let matched = path
                    .map(|p| path_matches(&filter.paths, p))
                    .unwrap_or(false);
                if !matched {
                    return false;
                }
            }

            if !filter.absolute_paths.is_empty() {
                let matched = absolute_path
                    .map(|p| path_matches(&filter.absolute_paths, p))
                    .unwrap_or(false);
                if !matched {
                    return false;
                }
            }

            if !filter.extensions.is_empty() {
                let candidate = path.or(absolute_path).unwrap_or("");
                let extension = Path::new(candidate)
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()));
                let Some(extension) = extension else {
                    return false;
                };
                if !filter.extensions.iter().any(|e| *e == extension) {
                    return false;
                }
            }

            true
        }
        EventType::EntityCreated | EventType::EntityUpdated | EventType::EntityDeleted => {
            if filter.entity_types.is_empty() {
                return true;
            }
            str_field(&event.data, "type")
                .map(|t| filter.entity_types.iter().any(|e| e == &t.to_lowercase()))
                .unwrap_or(false)
        }
        EventType::RelationshipCreated | EventType::RelationshipDeleted => {
            if filter.relationship_types.is_empty() {
                return true;
            }
            str_field(&event.data, "type")
                .map(|t| filter.relationship_types.iter().any(|r| r == &t.to_lowercase()))
                .unwrap_or(false)
        }
        EventType::SessionEvent => {
            if !filter.session_ids.is_empty() {
                let matched = str_field(&event.data, "sessionId")
                    .map(|v| filter.session_ids.iter().any(|s| s == &v.to_lowercase()))
                    .unwrap_or(false);
                if !matched {
                    return false;
                }
            }
            if !filter.operation_ids.is_empty() {
                let matched = str_field(&event.data, "operationId")
                    .map(|v| filter.operation_ids.iter().any(|s| s == &v.to_lowercase()))
                    .unwrap_or(false);
                if !matched {
                    return false;
                }
            }
            if !filter.session_events.is_empty() {
                let matched = str_field(&event.data, "sessionEvent")
                    .map(|v| filter.session_events.iter().any(|s| s == &v.to_lowercase()))
                    .unwrap_or(false);
                if !matched {
                    return false;
                }
            }
            if !filter.session_edge_types.is_empty() {
                let relationships = event.data.get("relationships").and_then(Value::as_array);
                let matched = relationships
                    .map(|rels| {
                        rels.iter().any(|rel| {
                            rel.get("type")
                                .and_then(Value::as_str)
                                .map(|t| filter.session_edge_types.iter().any(|e| e == &t.to_lowercase()))
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false);
                if !matched {
                    return false;
                }
            }
            true
        }
        EventType::GraphUpdate | EventType::SyncStatus => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file_change(kind: &str, path: &str) -> Event {
        Event::new(EventType::FileChange, json!({"type": kind, "path": path}))
    }

    #[test]
    fn normalize_is_idempotent() {
        let raw = RawFilter {
            extensions: vec![" .TS ".to_string(), "md".to_string()],
            types: vec!["Created".to_string()],
            ..Default::default()
        };
        let once = normalize_filter(&raw);
        let raw_again = RawFilter {
            extensions: once.extensions.clone(),
            types: once.types.clone(),
            ..Default::default()
        };
        let twice = normalize_filter(&raw_again);
        assert_eq!(once.extensions, twice.extensions);
        assert_eq!(once.types, twice.types);
    }

    #[test]
    fn extension_filter_is_dot_prefixed_and_case_insensitive() {
        let raw = RawFilter {
            extensions: vec!["TS".to_string()],
            ..Default::default()
        };
        let filter = normalize_filter(&raw);
        assert_eq!(filter.extensions, vec![".ts".to_string()]);

        let event = file_change("created", "/src/a.ts");
        assert!(matches_event(&filter, &event));
        let event_md = file_change("created", "/src/a.md");
        assert!(!matches_event(&filter, &event_md));
    }

    #[test]
    fn path_prefix_restricts_directory() {
        let raw = RawFilter {
            paths: vec!["/src".to_string()],
            ..Default::default()
        };
        let filter = normalize_filter(&raw);
        assert!(matches_event(&filter, &file_change("created", "/src/a.ts")));
        assert!(!matches_event(&filter, &file_change("created", "/lib/a.ts")));
    }

    #[test]
    fn empty_filter_matches_everything_for_its_topic() {
        let filter = NormalizedFilter::default();
        assert!(matches_event(&filter, &file_change("created", "/anywhere.rs")));
    }

    #[test]
    fn entity_type_filter_restricts_entity_events() {
        let raw = RawFilter {
            entity_types: vec!["Function".to_string()],
            ..Default::default()
        };
        let filter = normalize_filter(&raw);
        let matching = Event::new(EventType::EntityCreated, json!({"type": "function"}));
        let other = Event::new(EventType::EntityCreated, json!({"type": "class"}));
        assert!(matches_event(&filter, &matching));
        assert!(!matches_event(&filter, &other));
    }

    #[test]
    fn session_edge_types_requires_a_matching_relationship() {
        let raw = RawFilter {
            session_edge_types: vec!["calls".to_string()],
            ..Default::default()
        };
        let filter = normalize_filter(&raw);
        let matching = Event::new(
            EventType::SessionEvent,
            json!({"relationships": [{"type": "calls"}, {"type": "imports"}]}),
        );
        let other = Event::new(
            EventType::SessionEvent,
            json!({"relationships": [{"type": "imports"}]}),
        );
        assert!(matches_event(&filter, &matching));
        assert!(!matches_event(&filter, &other));
    }

    #[test]
    fn entity_types_empty_means_unrestricted() {
        let filter = NormalizedFilter::default();
        let event = Event::new(EventType::EntityDeleted, json!({"type": "struct"}));
        assert!(matches_event(&filter, &event));
    }
}
