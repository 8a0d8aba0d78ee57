//! End-to-end rule engine tests: rule YAML in, detections out.

use leakhound::engine::{CancelToken, Detection, RuleEngine};
use leakhound::rules::loader::{load, LoadError, LoadOptions};
use leakhound::rules::RuleDefinition;
use leakhound::tree::{Language, SyntaxTree};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

fn engine(definitions: &[&str]) -> RuleEngine {
    let mut rules = BTreeMap::new();
    for yaml in definitions {
        let definition: RuleDefinition = serde_yaml::from_str(yaml).unwrap();
        for rule in definition.materialize().unwrap() {
            rules.insert(rule.id.clone(), Arc::new(rule));
        }
    }
    RuleEngine::new(rules).unwrap()
}

fn scan_ruby(engine: &RuleEngine, source: &str) -> (SyntaxTree, Vec<Detection>) {
    let tree = Language::Ruby.parse(source).unwrap();
    let detections = engine
        .scan(Path::new("app/main.rb"), &tree, &CancelToken::new())
        .unwrap();
    (tree, detections)
}

#[test]
fn string_value_match_binds_focus() {
    let engine = engine(&[r#"
type: risk
languages: [ruby]
patterns:
  - pattern: logger.info($<X>)
    focus: X
metadata:
  id: log_sink
"#]);

    let (tree, detections) = scan_ruby(&engine, "logger.info(user.email)\n");

    assert_eq!(detections.len(), 1);
    let detection = &detections[0];
    assert_eq!(detection.rule_id, "log_sink");
    assert_eq!(tree.start_position(detection.node), (1, 13));
    assert_eq!(tree.text(detection.node), "user.email");
    assert_eq!(tree.text(detection.bindings["X"]), "user.email");
}

#[test]
fn numeric_predicate_with_type_mismatch() {
    let engine = engine(&[r#"
type: risk
languages: [ruby]
patterns:
  - pattern: sleep($<N>)
    filters:
      - variable: N
        less_than: 10
metadata:
  id: short_sleep
"#]);

    let (_, hits) = scan_ruby(&engine, "sleep(5)\n");
    assert_eq!(hits.len(), 1);

    let (_, misses) = scan_ruby(&engine, "sleep(15)\n");
    assert!(misses.is_empty());

    // Non-numeric argument: the predicate is false, never an error.
    let (_, mismatched) = scan_ruby(&engine, "sleep(x)\n");
    assert!(mismatched.is_empty());
}

#[test]
fn reference_filter_with_nested_scope() {
    let engine = engine(&[r#"
type: risk
languages: [ruby]
patterns:
  - pattern: "Tracer.in_span($<_>, attributes: $<A>)"
    filters:
      - variable: A
        detection: span_timestamp
        scope: nested
auxiliary:
  - id: span_timestamp
    patterns:
      - DateTime.now
metadata:
  id: span_attribute_leak
"#]);

    let source = "Tracer.in_span(\"x\", attributes: { \"d\" => DateTime.now }) do |s| end\n";
    let (_, detections) = scan_ruby(&engine, source);

    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].rule_id, "span_attribute_leak");
    // The auxiliary rule fired (the reference resolved) but never reports.
    assert!(detections.iter().all(|d| d.rule_id != "span_timestamp"));

    // Without the referenced detection inside A, nothing reports.
    let clean = "Tracer.in_span(\"x\", attributes: { \"d\" => 1 }) do |s| end\n";
    let (_, detections) = scan_ruby(&engine, clean);
    assert!(detections.is_empty());
}

#[test]
fn reference_filter_with_import_renaming() {
    let engine = engine(&[r#"
type: risk
languages: [ruby]
patterns:
  - pattern: emit($<X>)
    filters:
      - variable: X
        detection: span_attr
        scope: nested
        imports:
          - variable: VAL
            as: V
        filters:
          - variable: VAL
            regex: secret
auxiliary:
  - id: span_attr
    patterns:
      - attr($<K>, $<V>)
metadata:
  id: emit_secret
"#]);

    let (_, hits) = scan_ruby(&engine, "emit(attr(\"a\", secret_token))\n");
    assert_eq!(hits.len(), 1);

    let (_, misses) = scan_ruby(&engine, "emit(attr(\"a\", plain_value))\n");
    assert!(misses.is_empty());
}

#[test]
fn result_scope_resolves_on_imported_bindings_only() {
    let engine = engine(&[r#"
type: risk
languages: [ruby]
patterns:
  - pattern: emit($<X>)
    filters:
      - variable: X
        detection: span_attr
        scope: nested
        imports:
          - variable: VAL
            as: V
        filters:
          - variable: VAL
            detection: token_call
            scope: result
auxiliary:
  - id: span_attr
    patterns:
      - attr($<K>, $<V>)
  - id: token_call
    patterns:
      - token()
metadata:
  id: emit_token
"#]);

    // token() is exactly the imported binding's node: result scope hits.
    let (_, hits) = scan_ruby(&engine, "emit(attr(\"a\", token()))\n");
    assert_eq!(hits.len(), 1);

    // token() nested deeper than the binding itself: result scope misses.
    let (_, misses) = scan_ruby(&engine, "emit(attr(\"a\", wrap(token())))\n");
    assert!(misses.is_empty());
}

#[test]
fn sanitizer_suppresses_wrapped_candidates() {
    let engine = engine(&[
        r#"
type: shared
languages: [ruby]
patterns:
  - escape($<X>)
metadata:
  id: html_escape
"#,
        r#"
type: risk
languages: [ruby]
sanitizer: html_escape
patterns:
  - render($<Y>)
metadata:
  id: raw_render
"#,
    ]);

    let (_, sanitized) = scan_ruby(&engine, "render(escape(user))\n");
    assert!(sanitized.is_empty());

    let (tree, detections) = scan_ruby(&engine, "render(user)\n");
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].rule_id, "raw_render");
    assert_eq!(tree.text(detections[0].node), "render(user)");
}

#[test]
fn absence_trigger_anchors_at_required_detection() {
    let engine = engine(&[r#"
type: risk
languages: [ruby]
patterns:
  - http.use_ssl = true
trigger:
  match_on: absence
  required_detection: http_request
auxiliary:
  - id: http_request
    patterns:
      - Net::HTTP.start($<_>)
metadata:
  id: tls_enforced
"#]);

    // No use_ssl assignment anywhere: report at the HTTP request site.
    let source = "conn = Net::HTTP.start(\"example.com\")\n";
    let (tree, detections) = scan_ruby(&engine, source);
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].rule_id, "tls_enforced");
    assert_eq!(tree.start_position(detections[0].node).0, 1);

    // With the assignment present the rule stays silent.
    let secured = "conn = Net::HTTP.start(\"example.com\")\nhttp.use_ssl = true\n";
    let (_, detections) = scan_ruby(&engine, secured);
    assert!(detections.is_empty());

    // Without any request there is nothing to anchor to.
    let empty = "a = 1\n";
    let (_, detections) = scan_ruby(&engine, empty);
    assert!(detections.is_empty());
}

#[test]
fn stored_data_types_trigger() {
    let engine = engine(&[
        r#"
type: shared
languages: [ruby]
patterns:
  - $<_>.email
data_type:
  name: Email Address
  category_groups: [PII]
  stored: true
metadata:
  id: email_access
"#,
        r#"
type: shared
languages: [ruby]
patterns:
  - $<_>.session_id
data_type:
  name: Session Id
  stored: false
metadata:
  id: session_access
"#,
        r#"
type: risk
languages: [ruby]
detectors: [email_access, session_access]
patterns:
  - save($<D>)
trigger:
  match_on: stored_data_types
metadata:
  id: stored_sink
"#,
    ]);

    let (_, stored) = scan_ruby(&engine, "save(user.email)\n");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].data_types[0].name, "Email Address");
    assert!(stored[0].data_types[0].stored);

    // A non-stored data type does not satisfy the trigger.
    let (_, transient) = scan_ruby(&engine, "save(request.session_id)\n");
    assert!(transient.is_empty());

    let (_, plain) = scan_ruby(&engine, "save(value)\n");
    assert!(plain.is_empty());
}

#[test]
fn detections_emit_in_stable_order() {
    let engine = engine(&[
        r#"
type: risk
languages: [ruby]
patterns:
  - beta($<X>)
metadata:
  id: rule_beta
"#,
        r#"
type: risk
languages: [ruby]
patterns:
  - alpha($<X>)
metadata:
  id: rule_alpha
"#,
    ]);

    let source = "beta(1)\nalpha(2)\nbeta(3)\nalpha(4)\n";
    let (tree, detections) = scan_ruby(&engine, source);

    let observed: Vec<(String, usize)> = detections
        .iter()
        .map(|d| (d.rule_id.clone(), tree.start_position(d.node).0))
        .collect();

    // Rule id ascending within the layer, node pre-order within the rule.
    assert_eq!(
        observed,
        vec![
            ("rule_alpha".to_string(), 2),
            ("rule_alpha".to_string(), 4),
            ("rule_beta".to_string(), 1),
            ("rule_beta".to_string(), 3),
        ]
    );

    // Repeat scans reproduce the same sequence.
    for _ in 0..3 {
        let (tree, again) = scan_ruby(&engine, source);
        let repeated: Vec<(String, usize)> = again
            .iter()
            .map(|d| (d.rule_id.clone(), tree.start_position(d.node).0))
            .collect();
        assert_eq!(observed, repeated);
    }
}

#[test]
fn filename_regex_filter() {
    let engine = engine(&[r#"
type: risk
languages: [ruby]
patterns:
  - pattern: debug_mode($<X>)
    filters:
      - filename_regex: config/environments/
metadata:
  id: debug_in_env_config
"#]);

    let tree = Language::Ruby.parse("debug_mode(true)\n").unwrap();

    let in_config = engine
        .scan(
            Path::new("config/environments/production.rb"),
            &tree,
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(in_config.len(), 1);

    let elsewhere = engine
        .scan(Path::new("app/main.rb"), &tree, &CancelToken::new())
        .unwrap();
    assert!(elsewhere.is_empty());
}

#[test]
fn cycle_rejected_at_load() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("a.yml"),
        r#"
type: risk
languages: [ruby]
imports: [loop_b]
patterns: ["foo($<X>)"]
metadata:
  id: loop_a
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("b.yml"),
        r#"
type: risk
languages: [ruby]
imports: [loop_a]
patterns: ["bar($<X>)"]
metadata:
  id: loop_b
"#,
    )
    .unwrap();

    let options = LoadOptions {
        external_rule_dir: Some(dir.path().to_path_buf()),
        force: true,
        ..Default::default()
    };
    match load(&options).unwrap_err() {
        LoadError::Cycle(ids) => {
            assert!(ids.contains(&"loop_a".to_string()));
            assert!(ids.contains(&"loop_b".to_string()));
        }
        other => panic!("expected cycle, got {:?}", other),
    }
}

#[test]
fn secrets_rules_skip_parsed_files() {
    // A rule with no languages applies only to the secrets pseudo-file,
    // which the AST engine never sees.
    let engine = engine(&[r#"
type: risk
patterns: []
metadata:
  id: secret_scanner_rule
"#]);

    let (_, detections) = scan_ruby(&engine, "password = \"hunter2\"\n");
    assert!(detections.is_empty());
}
