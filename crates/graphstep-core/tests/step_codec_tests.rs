use std::f64::consts::FRAC_PI_2;

use glam::{DQuat, DVec3};
use graphstep_core::step::{NodeKind, StepCodec, StepError};

const ASSEMBLY: &str = include_str!("fixtures/assembly.stp");

const STYLING: &str = "#42=COLOUR_RGB('',1.,0.,0.);
#43=STYLED_ITEM('red',(#42),#39);
#44=MECHANICAL_DESIGN_GEOMETRIC_PRESENTATION_REPRESENTATION('',(#43),#9);
";

/// The fixture with a colour applied to B's vertex; nothing in a shape
/// representation points at the styling entities.
fn styled_assembly() -> String {
    ASSEMBLY.replace("#41=SHAPE_DEFINITION_REPRESENTATION(#33,#40);\n", &format!("#41=SHAPE_DEFINITION_REPRESENTATION(#33,#40);\n{STYLING}"))
}

#[test]
fn test_parse_assembly_tree() {
    let doc = StepCodec::parse(ASSEMBLY).unwrap();
    assert_eq!(doc.root.name, "A");
    assert_eq!(doc.root.kind, NodeKind::Assembly);
    let names: Vec<_> = doc.root.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["B", "C"]);
    assert_eq!(doc.node_count(), 3);
    assert_eq!(doc.part_count(), 2);

    let b = &doc.root.children[0];
    assert_eq!(b.kind, NodeKind::Part);
    assert_eq!(b.description, "bracket");
    assert_eq!(b.placement.translation(), DVec3::new(10.0, 0.0, 0.0));
    assert!(b.placement.rotation().abs_diff_eq(DQuat::IDENTITY, 1e-12));
}

#[test]
fn test_child_placement_from_transformation() {
    let doc = StepCodec::parse(ASSEMBLY).unwrap();
    let c = &doc.root.children[1];
    assert_eq!(c.placement.translation(), DVec3::new(0.0, 20.0, 5.0));
    assert!(c.placement.rotation().abs_diff_eq(DQuat::from_rotation_z(FRAC_PI_2), 1e-9));
    assert!(doc.root.placement.is_identity());
}

#[test]
fn test_unsupported_entity_is_quarantined() {
    let doc = StepCodec::parse(ASSEMBLY).unwrap();
    assert_eq!(doc.warnings.len(), 1);
    assert!(matches!(
        &doc.warnings[0],
        StepError::UnsupportedEntity { keyword, .. } if keyword == "VERTEX_POINT"
    ));

    let shape = doc.root.children[0].shape.as_ref().unwrap();
    assert!(shape.has_content());
    assert!(shape.entities.iter().any(|e| e.is("VERTEX_POINT")));
    assert_eq!(shape.representation_name, "B");
}

#[test]
fn test_styling_is_attached_to_the_styled_part() {
    let doc = StepCodec::parse(&styled_assembly()).unwrap();
    let keywords: Vec<_> = doc
        .warnings
        .iter()
        .filter_map(|w| match w {
            StepError::UnsupportedEntity { keyword, .. } => Some(keyword.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        keywords,
        vec![
            "VERTEX_POINT",
            "COLOUR_RGB",
            "STYLED_ITEM",
            "MECHANICAL_DESIGN_GEOMETRIC_PRESENTATION_REPRESENTATION"
        ]
    );

    let b = doc.root.children[0].shape.as_ref().unwrap();
    let styled = b.entities.iter().find(|e| e.is("STYLED_ITEM")).unwrap();
    let vertex = b.entities.iter().find(|e| e.is("VERTEX_POINT")).unwrap();
    let colour = b.entities.iter().find(|e| e.is("COLOUR_RGB")).unwrap();
    assert_eq!(styled.references(), vec![colour.id, vertex.id]);
    let presentation = b
        .entities
        .iter()
        .find(|e| e.is("MECHANICAL_DESIGN_GEOMETRIC_PRESENTATION_REPRESENTATION"))
        .unwrap();
    assert_eq!(presentation.references(), vec![styled.id, b.context.unwrap()]);

    for other in [&doc.root, &doc.root.children[1]] {
        let shape = other.shape.as_ref().unwrap();
        assert!(!shape.entities.iter().any(|e| e.is("STYLED_ITEM")));
    }
}

#[test]
fn test_styling_survives_serialization() {
    let doc = StepCodec::parse(&styled_assembly()).unwrap();
    let text = StepCodec::serialize(&doc);
    assert!(text.contains("COLOUR_RGB('',1.,0.,0.)"));
    assert!(text.contains("STYLED_ITEM('red',"));
    assert!(text.contains("MECHANICAL_DESIGN_GEOMETRIC_PRESENTATION_REPRESENTATION('',"));

    let reparsed = StepCodec::parse(&text).unwrap();
    assert_eq!(reparsed.root, doc.root);
    assert_eq!(StepCodec::serialize(&reparsed), text);
}

#[test]
fn test_unreferenced_entity_goes_to_the_root_payload() {
    let text = ASSEMBLY.replace("#41=SHAPE_DEFINITION_REPRESENTATION(#33,#40);\n", "#41=SHAPE_DEFINITION_REPRESENTATION(#33,#40);\n#42=DRAUGHTING_PRE_DEFINED_COLOUR('green');\n");
    let doc = StepCodec::parse(&text).unwrap();
    let root = doc.root.shape.as_ref().unwrap();
    assert!(root.entities.iter().any(|e| e.is("DRAUGHTING_PRE_DEFINED_COLOUR")));
    assert!(root.has_content());
}

#[test]
fn test_parts_without_geometry_keep_only_context() {
    let doc = StepCodec::parse(ASSEMBLY).unwrap();
    let c = doc.root.children[1].shape.as_ref().unwrap();
    assert!(!c.has_content());
    assert_eq!(c.entities.len(), 5);
}

#[test]
fn test_serialize_is_canonical() {
    let doc = StepCodec::parse(ASSEMBLY).unwrap();
    let first = StepCodec::serialize(&doc);
    let reparsed = StepCodec::parse(&first).unwrap();
    let second = StepCodec::serialize(&reparsed);
    assert_eq!(first, second);

    assert_eq!(reparsed.root, doc.root);
    assert!(first.starts_with("ISO-10303-21;\nHEADER;\nFILE_DESCRIPTION(('bracket assembly'),'2;1');"));
    assert!(first.contains("#1=APPLICATION_CONTEXT("));
    assert!(first.contains("(10.,0.,0.)"));
    assert!(first.contains("(1.5,2.,-32.5)"));
    assert!(first.ends_with("ENDSEC;\nEND-ISO-10303-21;\n"));
}

#[test]
fn test_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.stp");

    let doc = StepCodec::parse(ASSEMBLY).unwrap();
    StepCodec::write_file(&doc, &path).unwrap();
    let read = StepCodec::parse_file(&path).unwrap();
    assert_eq!(read.root, doc.root);
    assert_eq!(read.header, doc.header);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = StepCodec::parse_file(dir.path().join("missing.stp")).unwrap_err();
    assert!(matches!(err, StepError::Io { .. }));
}

#[test]
fn test_unresolved_reference() {
    let text = ASSEMBLY.replace("#25=SHAPE_DEFINITION_REPRESENTATION(#13,#24);", "#25=SHAPE_DEFINITION_REPRESENTATION(#13,#99);");
    let err = StepCodec::parse(&text).unwrap_err();
    assert!(matches!(err, StepError::Malformed { .. }));
    assert!(err.to_string().contains("#99"));
}

#[test]
fn test_part_with_two_parents_is_rejected() {
    // C becomes a child of B as well as of A.
    let text = ASSEMBLY.replace(
        "ENDSEC;\nEND-ISO-10303-21;",
        "#80=NEXT_ASSEMBLY_USAGE_OCCURRENCE('NAUO3','','',#32,#52,$);\nENDSEC;\nEND-ISO-10303-21;",
    );
    let err = StepCodec::parse(&text).unwrap_err();
    assert!(err.to_string().contains("more than one parent"));
}

#[test]
fn test_two_roots_are_rejected() {
    let text = ASSEMBLY.replace(
        "#70=NEXT_ASSEMBLY_USAGE_OCCURRENCE('NAUO2','','',#12,#52,$);",
        "#70=APPLICATION_CONTEXT('detached');",
    );
    let err = StepCodec::parse(&text).unwrap_err();
    assert!(err.to_string().contains("top-level products"));
}

#[test]
fn test_syntax_error_reports_line() {
    let text = ASSEMBLY.replace("#11=PRODUCT_DEFINITION_FORMATION('','',#10);", "#11=PRODUCT_DEFINITION_FORMATION('','',#10;");
    let err = StepCodec::parse(&text).unwrap_err();
    assert!(matches!(err, StepError::Syntax { line: 19, .. }), "{err}");
}

#[test]
fn test_invalid_utf8_is_malformed() {
    let mut bytes = ASSEMBLY.as_bytes().to_vec();
    bytes[200] = 0xFF;
    let err = StepCodec::parse_bytes(&bytes).unwrap_err();
    assert!(matches!(err, StepError::Malformed { .. }));
}
