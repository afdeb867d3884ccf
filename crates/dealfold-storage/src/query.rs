//! Shared filter/sort/pagination evaluation for the map-backed backends.

use chrono::{DateTime, Utc};
use dealfold_core::OpportunityRecord;

use crate::repository::{OpportunityFilter, Page, Pagination};

pub(crate) fn matches(record: &OpportunityRecord, filter: &OpportunityFilter) -> bool {
    if let Some(vendor) = non_empty(filter.vendor.as_deref()) {
        if !contains_ci(record.vendor().unwrap_or_default(), vendor) {
            return false;
        }
    }
    if let Some(customer) = non_empty(filter.customer.as_deref()) {
        if !contains_ci(record.customer().unwrap_or_default(), customer) {
            return false;
        }
    }
    if let Some(stage) = filter.stage {
        if record.stage != stage {
            return false;
        }
    }
    if let Some(priority) = filter.priority {
        if record.priority != priority {
            return false;
        }
    }
    if let Some(min) = filter.min_confidence {
        match record.metadata.confidence {
            Some(confidence) if confidence >= min => {}
            _ => return false,
        }
    }
    if let Some(after) = filter.created_after {
        match record.created_at {
            Some(created) if created >= after => {}
            _ => return false,
        }
    }
    if let Some(before) = filter.created_before {
        match record.created_at {
            Some(created) if created <= before => {}
            _ => return false,
        }
    }
    if let Some(after) = filter.updated_after {
        match record.updated_at {
            Some(updated) if updated >= after => {}
            _ => return false,
        }
    }
    if let Some(text) = non_empty(filter.search_text.as_deref()) {
        if !contains_ci(&search_haystack(record), text) {
            return false;
        }
    }
    true
}

/// Text searched by `search_text`: name, actors, next steps, vendor and
/// customer joined with spaces.
pub(crate) fn search_haystack(record: &OpportunityRecord) -> String {
    let mut parts = vec![record.name.clone()];
    parts.extend(record.actors.iter().cloned());
    if let Some(next_steps) = &record.next_steps {
        parts.push(next_steps.clone());
    }
    if let Some(vendor) = record.vendor() {
        parts.push(vendor.to_string());
    }
    if let Some(customer) = record.customer() {
        parts.push(customer.to_string());
    }
    parts.join(" ")
}

/// Default sort: `created_at` descending, id ascending on ties so every
/// backend pages in the same order.
pub(crate) fn sort_newest_first(records: &mut [OpportunityRecord]) {
    records.sort_by(|a, b| {
        let a_created = a.created_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let b_created = b.created_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
        b_created.cmp(&a_created).then_with(|| a.id.cmp(&b.id))
    });
}

pub(crate) fn paginate(records: Vec<OpportunityRecord>, page: Pagination) -> Page<OpportunityRecord> {
    let total = records.len();
    let limit = page.clamped_limit();
    let data: Vec<OpportunityRecord> = records.into_iter().skip(page.offset).take(limit).collect();
    let has_more = page.offset + data.len() < total;
    Page {
        data,
        total,
        limit,
        offset: page.offset,
        has_more,
    }
}

pub(crate) fn distinct_sorted(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
    out.sort();
    out.dedup();
    out
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dealfold_core::{RecordMetadata, Stage};

    fn record(id: &str, name: &str, vendor: Option<&str>) -> OpportunityRecord {
        OpportunityRecord {
            id: id.into(),
            name: name.into(),
            metadata: RecordMetadata {
                vendor: vendor.map(ToString::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn vendor_filter_is_case_insensitive_substring() {
        let filter = OpportunityFilter {
            vendor: Some("clear".into()),
            ..Default::default()
        };
        assert!(matches(&record("a", "x", Some("ClearLED GmbH")), &filter));
        assert!(!matches(&record("b", "x", Some("Siemens")), &filter));
        assert!(!matches(&record("c", "x", None), &filter));
    }

    #[test]
    fn stage_filter_is_exact() {
        let mut r = record("a", "x", None);
        r.stage = Stage::Quote;
        let filter = OpportunityFilter {
            stage: Some(Stage::Quote),
            ..Default::default()
        };
        assert!(matches(&r, &filter));
        let filter = OpportunityFilter {
            stage: Some(Stage::Rfq),
            ..Default::default()
        };
        assert!(!matches(&r, &filter));
    }

    #[test]
    fn min_confidence_is_inclusive_and_excludes_unset() {
        let mut r = record("a", "x", None);
        r.metadata.confidence = Some(0.8);
        let filter = OpportunityFilter {
            min_confidence: Some(0.8),
            ..Default::default()
        };
        assert!(matches(&r, &filter));
        r.metadata.confidence = None;
        assert!(!matches(&r, &filter));
    }

    #[test]
    fn search_text_spans_name_actors_and_parties() {
        let mut r = record("a", "PDU rollout", Some("ClearLED"));
        r.actors = vec!["Dana Voss".into()];
        r.next_steps = Some("send revised quote".into());
        for needle in ["pdu", "dana", "clearled", "revised"] {
            let filter = OpportunityFilter {
                search_text: Some(needle.into()),
                ..Default::default()
            };
            assert!(matches(&r, &filter), "expected match on {needle}");
        }
        let filter = OpportunityFilter {
            search_text: Some("unrelated".into()),
            ..Default::default()
        };
        assert!(!matches(&r, &filter));
    }

    #[test]
    fn date_bounds_are_inclusive() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("ts");
        let mut r = record("a", "x", None);
        r.created_at = Some(ts);
        r.updated_at = Some(ts);
        let filter = OpportunityFilter {
            created_after: Some(ts),
            created_before: Some(ts),
            updated_after: Some(ts),
            ..Default::default()
        };
        assert!(matches(&r, &filter));
    }

    #[test]
    fn pagination_slices_the_sorted_set() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().expect("ts");
        let mut records: Vec<OpportunityRecord> = (0..10)
            .map(|i| {
                let mut r = record(&format!("opp-{i:02}"), "x", None);
                r.created_at = Some(base + chrono::Duration::minutes(i));
                r
            })
            .collect();
        sort_newest_first(&mut records);
        let page = paginate(
            records.clone(),
            Pagination {
                limit: 3,
                offset: 4,
            },
        );
        assert_eq!(page.total, 10);
        assert!(page.has_more);
        let expected: Vec<String> = records.iter().skip(4).take(3).map(|r| r.id.clone()).collect();
        let got: Vec<String> = page.data.iter().map(|r| r.id.clone()).collect();
        assert_eq!(got, expected);
        // newest first
        assert_eq!(records.first().map(|r| r.id.as_str()), Some("opp-09"));
    }

    #[test]
    fn distinct_sorted_dedupes_and_drops_empties() {
        let values = vec![
            "Zeta".to_string(),
            "".to_string(),
            "Acme".to_string(),
            "Zeta".to_string(),
        ];
        assert_eq!(distinct_sorted(values), vec!["Acme".to_string(), "Zeta".to_string()]);
    }
}
