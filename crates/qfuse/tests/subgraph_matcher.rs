use qfuse::pattern::{compile, match_all, match_at, Match, PatternGraph};
use qfuse::text_ir::{parse_graph_with_symbols, ParsedGraph};

fn pattern(src: &str) -> PatternGraph {
    compile(src).expect("pattern")
}

fn target(src: &str) -> ParsedGraph {
    parse_graph_with_symbols(src).expect("target")
}

fn matches(parsed: &ParsedGraph, pattern: &PatternGraph) -> Vec<Match> {
    match_all(&parsed.graph, pattern).collect()
}

const CONV_RELU: &str = r#"
graph(%a, %w, %scale, %zp):
  %a_dq = aten::dequantize(%a)
  %r = aten::conv2d(%a_dq, %w)
  %r_relu = aten::relu(%r)
  %q = aten::quantize_per_tensor(%r_relu, %scale, %zp)
  return (%q)
"#;

#[test]
fn chain_match_binds_symbols() {
    let pattern = pattern(CONV_RELU);
    let parsed = target(
        r#"
graph(%x, %weight, %scale : float, %zp : int):
  %x_dq = aten::dequantize(%x)
  %c = aten::conv2d(%x_dq, %weight)
  %c_relu = aten::relu(%c)
  %out = aten::quantize_per_tensor(%c_relu, %scale, %zp)
  %side = aten::sigmoid(%x)
  return (%out, %side)
"#,
    );

    let found = matches(&parsed, &pattern);
    assert_eq!(found.len(), 1);
    let m = &found[0];
    let quantize = parsed.graph.producer(parsed.value_names["out"]).unwrap();

    assert_eq!(m.anchor(), quantize);
    assert_eq!(m.insertion_point(), quantize);
    assert_eq!(m.nodes().len(), 4);
    assert!(!m.contains_node(parsed.graph.walk()[4]), "sibling branch is untouched");
    assert_eq!(
        m.inputs(),
        &[
            parsed.value_names["x"],
            parsed.value_names["weight"],
            parsed.value_names["scale"],
            parsed.value_names["zp"],
        ]
    );
    assert_eq!(m.outputs(), &[parsed.value_names["out"]]);
    assert_eq!(
        m.symbol(pattern.symbols(), "%r"),
        Some(parsed.value_names["c"])
    );
    assert_eq!(
        m.symbol(pattern.symbols(), "a_dq"),
        Some(parsed.value_names["x_dq"])
    );
    assert_eq!(m.symbol(pattern.symbols(), "missing"), None);
}

#[test]
fn interior_value_with_external_consumer_is_not_matched() {
    let pattern = pattern(CONV_RELU);
    let parsed = target(
        r#"
graph(%x, %weight, %scale : float, %zp : int):
  %x_dq = aten::dequantize(%x)
  %c = aten::conv2d(%x_dq, %weight)
  %c_relu = aten::relu(%c)
  %out = aten::quantize_per_tensor(%c_relu, %scale, %zp)
  %side = aten::sigmoid(%x_dq)
  return (%out, %side)
"#,
    );
    assert!(matches(&parsed, &pattern).is_empty());
}

#[test]
fn interior_value_returned_from_the_graph_is_not_matched() {
    let pattern = pattern(CONV_RELU);
    let parsed = target(
        r#"
graph(%x, %weight, %scale : float, %zp : int):
  %x_dq = aten::dequantize(%x)
  %c = aten::conv2d(%x_dq, %weight)
  %c_relu = aten::relu(%c)
  %out = aten::quantize_per_tensor(%c_relu, %scale, %zp)
  return (%out, %c)
"#,
    );
    assert!(matches(&parsed, &pattern).is_empty());
}

#[test]
fn disjoint_occurrences_are_enumerated_in_order() {
    let pattern = pattern(CONV_RELU);
    let parsed = target(
        r#"
graph(%x, %w1, %w2, %scale : float, %zp : int):
  %x_dq = aten::dequantize(%x)
  %c = aten::conv2d(%x_dq, %w1)
  %c_relu = aten::relu(%c)
  %first = aten::quantize_per_tensor(%c_relu, %scale, %zp)
  %y_dq = aten::dequantize(%first)
  %d = aten::conv2d(%y_dq, %w2)
  %d_relu = aten::relu(%d)
  %second = aten::quantize_per_tensor(%d_relu, %scale, %zp)
  return (%second)
"#,
    );

    let found = matches(&parsed, &pattern);
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].outputs(), &[parsed.value_names["first"]]);
    assert_eq!(found[1].outputs(), &[parsed.value_names["second"]]);
    assert_eq!(found[1].inputs()[0], parsed.value_names["first"]);
    assert!(!found[0].overlaps(&found[1]));
}

#[test]
fn dag_with_fan_in_and_shared_intermediate() {
    let pattern = pattern(
        r#"
graph(%a, %b, %c):
  %m1 = aten::mul(%a, %b)
  %m2 = aten::mul(%m1, %c)
  %s = aten::add(%m2, %m1)
  return (%s)
"#,
    );
    let parsed = target(
        r#"
graph(%x, %y, %z):
  %p = aten::mul(%x, %y)
  %q = aten::mul(%p, %z)
  %r = aten::add(%q, %p)
  return (%r)
"#,
    );
    let found = matches(&parsed, &pattern);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].nodes().len(), 3);

    // The add consumes two different products here, so `%m1` cannot be shared.
    let parsed = target(
        r#"
graph(%x, %y, %z):
  %p = aten::mul(%x, %y)
  %p2 = aten::mul(%x, %y)
  %q = aten::mul(%p, %z)
  %r = aten::add(%q, %p2)
  return (%r)
"#,
    );
    assert!(matches(&parsed, &pattern).is_empty());
}

#[test]
fn free_inputs_may_alias() {
    let pattern = pattern("graph(%a, %b):\n  %r = aten::add(%a, %b)\n  return (%r)");
    let parsed = target("graph(%x):\n  %r = aten::add(%x, %x)\n  return (%r)");

    let found = matches(&parsed, &pattern);
    assert_eq!(found.len(), 1);
    assert_eq!(
        found[0].inputs(),
        &[parsed.value_names["x"], parsed.value_names["x"]]
    );
}

#[test]
fn free_input_cannot_bind_a_matched_value() {
    let pattern = pattern(
        "graph(%a, %b):\n  %r = aten::relu(%a)\n  %s = aten::add(%r, %b)\n  return (%s)",
    );
    let parsed = target("graph(%x):\n  %r = aten::relu(%x)\n  %s = aten::add(%r, %r)\n  return (%s)");
    assert!(matches(&parsed, &pattern).is_empty());
}

#[test]
fn attributes_must_agree() {
    let pattern = pattern(
        r#"
graph(%a):
  %one = prim::Constant[value=1]()
  %r = aten::add(%a, %a, %one)
  return (%r)
"#,
    );
    let one = target(
        "graph(%x):\n  %k = prim::Constant[value=1]()\n  %r = aten::add(%x, %x, %k)\n  return (%r)",
    );
    let two = target(
        "graph(%x):\n  %k = prim::Constant[value=2]()\n  %r = aten::add(%x, %x, %k)\n  return (%r)",
    );
    let float = target(
        "graph(%x):\n  %k = prim::Constant[value=1.0]()\n  %r = aten::add(%x, %x, %k)\n  return (%r)",
    );
    assert_eq!(matches(&one, &pattern).len(), 1);
    assert!(matches(&two, &pattern).is_empty());
    assert!(matches(&float, &pattern).is_empty());
}

#[test]
fn arity_must_agree() {
    let pattern = pattern("graph(%a, %b):\n  %r = aten::add(%a, %b)\n  return (%r)");
    let parsed = target("graph(%x, %y, %z):\n  %r = aten::add(%x, %y, %z)\n  return (%r)");
    assert!(matches(&parsed, &pattern).is_empty());
}

#[test]
fn nodes_reached_only_through_uses_are_matched() {
    let pattern = pattern("graph(%a):\n  %r = aten::relu(%a)\n  prim::Print(%r)\n  return (%r)");
    let parsed = target(
        "graph(%x):\n  %r = aten::relu(%x)\n  prim::Print(%r)\n  %n = aten::neg(%r)\n  return (%n)",
    );

    let found = matches(&parsed, &pattern);
    assert_eq!(found.len(), 1);
    let print = parsed.graph.walk()[1];
    assert!(found[0].contains_node(print));
    assert_eq!(found[0].insertion_point(), print);
    assert_eq!(found[0].anchor(), parsed.graph.walk()[0]);
}

#[test]
fn output_consumer_before_the_insertion_point_blocks_the_match() {
    let pattern = pattern(
        r#"
graph(%a, %b):
  %r = aten::relu(%a)
  %s = aten::neg(%b)
  %t = aten::add(%r, %s)
  return (%r, %t)
"#,
    );
    let early = target(
        r#"
graph(%x, %y):
  %r = aten::relu(%x)
  %u = aten::sigmoid(%r)
  %s = aten::neg(%y)
  %t = aten::add(%r, %s)
  return (%u, %t)
"#,
    );
    assert!(matches(&early, &pattern).is_empty());

    let late = target(
        r#"
graph(%x, %y):
  %r = aten::relu(%x)
  %s = aten::neg(%y)
  %t = aten::add(%r, %s)
  %u = aten::sigmoid(%r)
  return (%u, %t)
"#,
    );
    let found = matches(&late, &pattern);
    assert_eq!(found.len(), 1);
    assert_eq!(
        found[0].outputs(),
        &[late.value_names["r"], late.value_names["t"]]
    );
}

#[test]
fn matches_do_not_cross_block_boundaries() {
    let pattern = pattern("graph(%a):\n  %r = aten::relu(%a)\n  %n = aten::neg(%r)\n  return (%n)");
    let split = target(
        r#"
graph(%x, %c : bool):
  %r = aten::relu(%x)
  %y = prim::If(%c)
    block0():
      %n = aten::neg(%r)
      -> (%n)
    block1():
      -> (%r)
  return (%y)
"#,
    );
    assert!(matches(&split, &pattern).is_empty());

    let nested = target(
        r#"
graph(%x, %c : bool):
  %y = prim::If(%c)
    block0():
      %r = aten::relu(%x)
      %n = aten::neg(%r)
      -> (%n)
    block1():
      -> (%x)
  return (%y)
"#,
    );
    let found = matches(&nested, &pattern);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].outputs(), &[nested.value_names["n"]]);
}

#[test]
fn match_at_requires_the_anchor_kind() {
    let pattern = pattern("graph(%a):\n  %r = aten::relu(%a)\n  %n = aten::neg(%r)\n  return (%n)");
    let parsed = target("graph(%x):\n  %r = aten::relu(%x)\n  %n = aten::neg(%r)\n  return (%n)");
    let relu = parsed.graph.walk()[0];
    let neg = parsed.graph.walk()[1];

    assert!(match_at(&parsed.graph, &pattern, relu).is_none());
    let found = match_at(&parsed.graph, &pattern, neg).expect("match at neg");
    assert_eq!(found.nodes(), &[relu, neg]);
}
