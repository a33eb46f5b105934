//! Append-log line roundtrip tests for `tandas-core` records.
//!
//! Each `#[case]` is isolated, with no shared state.

use rstest::rstest;
use tandas_core::jsonl::{decode_line, encode_line};
use tandas_core::types::{Note, Record, RecordId, RecordStatus, RunOutcome, RunResult};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn minimal_record() -> Record {
    Record::new("td-0001", "Minimal")
}

fn full_record() -> Record {
    Record {
        id: RecordId::from("td-1a2b3c4d"),
        title: "Checkout applies coupon".to_string(),
        status: RecordStatus::Flaky,
        file: Some("tests/checkout.spec.ts".to_string()),
        covers: vec!["checkout".to_string(), "coupons".to_string()],
        depends_on: vec![RecordId::from("td-login")],
        notes: vec![Note {
            ts: "2024-05-01T10:00:00".to_string(),
            kind: "trace".to_string(),
            text: "fails on slow CI runners".to_string(),
        }],
        run_history: vec![
            RunResult {
                ts: "2024-05-01T09:00:00".to_string(),
                result: RunOutcome::Pass,
                duration: Some("1.2s".to_string()),
                trace: None,
            },
            RunResult {
                ts: "2024-05-01T09:30:00".to_string(),
                result: RunOutcome::Fail,
                duration: None,
                trace: Some("test-results/checkout/trace.zip".to_string()),
            },
        ],
        created_at: "2024-04-30T08:00:00".to_string(),
        updated_at: "2024-05-01T10:00:00".to_string(),
    }
}

fn unicode_record() -> Record {
    Record {
        title: "Tâche avec émojis 🚀 & spéçïal chars: <>&\"'".to_string(),
        covers: vec!["日本語".to_string(), "한국어".to_string()],
        ..Record::new("td-🚀", "placeholder")
    }
}

// ---------------------------------------------------------------------------
// Roundtrip
// ---------------------------------------------------------------------------

#[rstest]
#[case::minimal(minimal_record())]
#[case::full(full_record())]
#[case::unicode(unicode_record())]
fn record_survives_line_roundtrip(#[case] record: Record) {
    let line = encode_line(&record).expect("encode");
    let back = decode_line(&line, 1).expect("decode").expect("non-blank");
    assert_eq!(back, record);
}

#[test]
fn front_end_line_decodes() {
    // Shape written by the command-line front-end on `create`.
    let line = r#"{"id": "td-9f8e7d6c", "title": "Login works", "status": "active", "file": null, "covers": ["auth"], "depends_on": [], "notes": [], "run_history": [], "created_at": "2024-05-01T10:00:00", "updated_at": "2024-05-01T10:00:00"}"#;
    let record = decode_line(line, 1).expect("decode").expect("record");
    assert_eq!(record.id, RecordId::from("td-9f8e7d6c"));
    assert_eq!(record.file, None);
    assert_eq!(record.covers, vec!["auth".to_string()]);
}

#[test]
fn missing_title_is_malformed() {
    assert!(decode_line(r#"{"id":"td-1"}"#, 3).is_err());
}
