use insta::assert_snapshot;
use switchyard::config::definitions::DefinitionsConfig;

fn expect_validation_error(yaml: &str) -> String {
    match DefinitionsConfig::from_yaml_str(yaml) {
        Ok(_) => panic!("validation should fail"),
        Err(err) => err.to_string(),
    }
}

#[test]
fn definitions_load_from_disk() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    std::io::Write::write_all(
        &mut file,
        b"endpoints:\n  - name: q\n    kind: queue\n    address: amqp://broker/q\n",
    )
    .expect("write definitions");

    let config = DefinitionsConfig::from_path(file.path()).expect("load from path");
    assert_eq!(config.endpoints.len(), 1);
    assert_eq!(config.endpoints[0].name, "q");
}

#[test]
fn unknown_endpoint_kind() {
    let rendered = expect_validation_error(
        r#"
endpoints:
  - name: warehouse
    kind: teleport
    address: somewhere
"#,
    );
    assert_snapshot!(rendered, @r"
    definitions config validation failed:
    - error[endpoints]: endpoint `warehouse` has unknown kind `teleport` (expected rest, soap, queue, or stream)
    ");
}

#[test]
fn route_referencing_missing_endpoint() {
    let rendered = expect_validation_error(
        r#"
routes:
  - name: orders
    source: "*"
    kind: direct
    destination: ghost
"#,
    );
    assert_snapshot!(rendered, @r"
    definitions config validation failed:
    - error[routes]: route `orders` references unknown endpoint `ghost`
    ");
}

#[test]
fn header_route_reading_the_body() {
    let rendered = expect_validation_error(
        r#"
endpoints:
  - name: qa
    kind: queue
    address: amqp://broker/qa

routes:
  - name: tenants
    source: "*"
    kind: header_based
    destination: qa
    rules:
      - name: body_peek
        condition:
          source: body
          field: tenant
          op: eq
          value: a
        forward: qa
"#,
    );
    assert_snapshot!(rendered, @r"
    definitions config validation failed:
    - error[routes]: header_based route `tenants` rule `body_peek` must not read the message body
    ");
}

#[test]
fn flow_with_a_dependency_cycle() {
    let rendered = expect_validation_error(
        r#"
flows:
  - name: loop
    steps:
      - name: a
        type: join
        depends_on: [b]
      - name: b
        type: join
        depends_on: [a]
"#,
    );
    assert_snapshot!(rendered, @r"
    definitions config validation failed:
    - error[flows]: flow `loop` has a dependency cycle through: a, b
    ");
}

#[test]
fn every_error_in_one_report() {
    let rendered = expect_validation_error(
        r#"
endpoints:
  - name: warehouse
    kind: teleport
    address: somewhere

routes:
  - name: orders
    source: "*"
    kind: direct
    destination: ghost

flows:
  - name: empty_flow
    steps: []
"#,
    );
    assert_snapshot!(rendered, @r"
    definitions config validation failed:
    - error[endpoints]: endpoint `warehouse` has unknown kind `teleport` (expected rest, soap, queue, or stream)
    - error[routes]: route `orders` references unknown endpoint `ghost`
    - error[flows]: flow `empty_flow` declares no steps
    ");
}
