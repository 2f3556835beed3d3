use anchorage::core::formatter::{
    EncodingStrictness, FormatOptions, format_document, normalise_sections, render_knowledge,
    render_ledger_block, render_route_plan,
};
use anchorage::core::knowledge::{FieldMap, KnowledgeKind, KnowledgeObject, SectionValue};
use anchorage::core::ledger::ExecuteLedger;
use anchorage::core::route::{RoutePlan, RouteStage};
use proptest::prelude::*;

fn cko(project_id: u64, pairs: &[(&str, SectionValue)]) -> KnowledgeObject {
    let fields: FieldMap = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Some(v.clone())))
        .collect();
    KnowledgeObject::from_fields(KnowledgeKind::Cko, project_id, fields, 10)
        .expect("valid cko")
        .0
}

#[test]
fn cko_header_summary_and_placeholder() {
    let obj = cko(7, &[("canonical_summary", SectionValue::text("Reduce onboarding time"))]);
    let text = render_knowledge(&obj, &FormatOptions::default()).expect("render");

    assert!(
        text.starts_with("# CKO-PROJECT-000007\n\nReduce onboarding time\n\n# "),
        "unexpected head: {text:?}"
    );
    assert!(text.contains("Out-of-Scope:\n(not set)\n"));
    assert!(text.ends_with('\n') && !text.ends_with("\n\n"));
}

#[test]
fn every_schema_section_is_rendered() {
    let obj = KnowledgeObject::new(KnowledgeKind::Pko, 3);
    let text = render_knowledge(&obj, &FormatOptions::default()).expect("render");
    for title in [
        "# PKO-PROJECT-000003",
        "# POLICY STATEMENT",
        "# RATIONALE",
        "# APPLIES TO",
        "# DOES NOT APPLY TO",
        "# ENFORCEMENT",
        "# EXCEPTIONS",
        "# VERSIONING / PROVENANCE",
    ] {
        assert!(text.contains(&format!("{title}\n\n")), "missing {title}");
    }
    assert!(!text.contains("\n\n\n"));
}

#[test]
fn ordered_steps_are_numbered_and_bullets_are_not() {
    let obj = cko(
        1,
        &[
            ("assumptions", SectionValue::bullets(["Teams use SSO", "Docs exist"])),
            ("supporting_basis", SectionValue::steps(["Survey", "Pilot"])),
        ],
    );
    let text = render_knowledge(&obj, &FormatOptions::default()).expect("render");
    assert!(text.contains("# ASSUMPTIONS\n\n- Teams use SSO\n- Docs exist\n\n"));
    assert!(text.contains("# SUPPORTING BASIS\n\n1. Survey\n2. Pilot\n\n"));
}

#[test]
fn custom_placeholder_is_used() {
    let opts = FormatOptions {
        placeholder: "TBD".to_string(),
        ..FormatOptions::default()
    };
    let text = render_knowledge(&KnowledgeObject::new(KnowledgeKind::Tko, 2), &opts).expect("render");
    assert!(text.contains("# NEXT STEP\n\nTBD\n"));
    assert!(!text.contains("(not set)"));
}

#[test]
fn four_blank_lines_collapse_and_final_newline_is_added() {
    let text = format_document("alpha\n\n\n\n\nbeta", &FormatOptions::default()).expect("format");
    assert_eq!(text, "alpha\n\nbeta\n");
}

#[test]
fn non_ascii_is_transliterated_in_rendered_sections() {
    let obj = cko(
        9,
        &[("statement", SectionValue::text("Na\u{ef}ve caf\u{e9} \u{2013} \u{201c}fast\u{201d}"))],
    );
    let text = render_knowledge(&obj, &FormatOptions::default()).expect("render");
    assert!(text.is_ascii());
    assert!(text.contains("Naive cafe - \"fast\""));
}

#[test]
fn strict_mode_rejects_non_ascii() {
    let opts = FormatOptions {
        strictness: EncodingStrictness::Strict,
        ..FormatOptions::default()
    };
    let err = format_document("ok\n\u{2014}", &opts).expect_err("strict rejects");
    assert_eq!(err.code(), "ENCODING_VIOLATION");
}

#[test]
fn route_plan_lists_stages_in_order() {
    let mut second = RouteStage::new("S2", 2, "Build").with_work_items(&["CLI", "Installer"]);
    second.outputs = "1. Binary 2. Docs".to_string();
    let plan = RoutePlan::new(
        KnowledgeObject::new(KnowledgeKind::Wko, 4),
        vec![second, RouteStage::new("S1", 1, "Design")],
    )
    .expect("plan");
    let text = render_route_plan(&plan, &FormatOptions::default()).expect("render");
    assert!(text.starts_with("# WKO-PROJECT-000004\n\n"));
    assert!(text.contains("# STAGES\n\n1. Design [S1]\n2. Build [S2]\n   Outputs: 1. Binary 2. Docs\n   Work items: CLI [WS2-1]; Installer [WS2-2]\n"));
}

#[test]
fn ledger_is_exactly_one_json_block() {
    let plan = RoutePlan::new(
        KnowledgeObject::new(KnowledgeKind::Wko, 4),
        vec![RouteStage::new("S1", 1, "D\u{e9}sign")],
    )
    .expect("plan");
    let ledger = ExecuteLedger::seed_from_route(&plan, 1).expect("seed");
    let block = render_ledger_block(&ledger, &FormatOptions::default()).expect("render");

    assert!(block.starts_with("```json\n{"));
    assert!(block.ends_with("}\n```\n"));
    assert_eq!(block.matches("```").count(), 2);
    assert!(block.is_ascii());
    assert!(block.contains("\"Design\""));

    let body = anchorage::core::formatter::extract_single_json_block(&block).expect("extract");
    let parsed: serde_json::Value = serde_json::from_str(&body).expect("json");
    assert_eq!(parsed["artefact_type"], "EXECUTION_STATE");
    assert_eq!(parsed["marker"], "EXECUTE");
}

fn line_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        Just("   ".to_string()),
        "[a-z ]{1,12}",
        "# [A-Z]{1,8}",
        "- [a-z]{1,6}",
        "[a-z\u{e9}\u{2014}\u{201c}]{1,6}",
    ]
}

proptest! {
    #[test]
    fn formatting_is_idempotent(lines in prop::collection::vec(line_strategy(), 0..24), crlf in any::<bool>()) {
        let sep = if crlf { "\r\n" } else { "\n" };
        let raw = lines.join(sep);
        let opts = FormatOptions::default();
        let once = format_document(&raw, &opts).expect("format");
        let twice = format_document(&once, &opts).expect("format again");
        prop_assert_eq!(&once, &twice);
        prop_assert!(once.is_ascii());
        prop_assert!(once.ends_with('\n'));
        prop_assert!(!once.contains("\n\n\n"));
    }

    #[test]
    fn normaliser_never_leaves_header_without_blank_after(lines in prop::collection::vec(line_strategy(), 1..16)) {
        let out = normalise_sections(&lines.join("\n"));
        let rendered: Vec<&str> = out.lines().collect();
        for pair in rendered.windows(2) {
            if pair[0].starts_with("# ") {
                prop_assert_eq!(pair[1], "");
            }
        }
    }
}
