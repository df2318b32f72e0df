use std::panic::{catch_unwind, AssertUnwindSafe};

use qfuse::graph::{Graph, ValueType};
use qfuse::pattern::{compile, compile_replacement, match_all, Match, PatternGraph};
use qfuse::text_ir::parse_graph_with_symbols;
use qfuse::SubgraphRewriter;

fn kinds(graph: &Graph) -> Vec<String> {
    graph
        .walk()
        .into_iter()
        .map(|node| graph.kind(node).unwrap_or_default().to_string())
        .collect()
}

fn first_match(graph: &Graph, pattern: &PatternGraph) -> Match {
    match_all(graph, pattern).next().expect("pattern should match")
}

const CONV_RELU: &str = r#"
graph(%a, %w, %scale, %zp):
  %a_dq = aten::dequantize(%a)
  %r = aten::conv2d(%a_dq, %w)
  %r_relu = aten::relu(%r)
  %q = aten::quantize_per_tensor(%r_relu, %scale, %zp)
  return (%q)
"#;

const CONV_RELU_FUSED: &str = r#"
graph(%a, %w, %scale, %zp):
  %q = quantized::conv2d_relu(%a, %w, %scale, %zp)
  return (%q)
"#;

#[test]
fn fuses_conv_relu_and_rewires_consumers() {
    let pattern = compile(CONV_RELU).expect("pattern");
    let replacement = compile_replacement(CONV_RELU_FUSED).expect("replacement");
    let parsed = parse_graph_with_symbols(
        r#"
graph(%x, %w, %scale : float, %zp : int):
  %x_dq = aten::dequantize(%x)
  %c = aten::conv2d(%x_dq, %w)
  %c_relu = aten::relu(%c)
  %out = aten::quantize_per_tensor(%c_relu, %scale, %zp)
  %side = aten::sigmoid(%x)
  %post = aten::dequantize(%out)
  return (%post, %side)
"#,
    )
    .expect("target");
    let mut graph = parsed.graph;
    let m = first_match(&graph, &pattern);
    let sigmoid = graph.producer(parsed.value_names["side"]).unwrap();
    let post = graph.producer(parsed.value_names["post"]).unwrap();

    let outcome = SubgraphRewriter::new(&mut graph).apply(&m, &pattern, &replacement);

    assert_eq!(outcome.removed, 4);
    assert_eq!(outcome.inserted.len(), 1);
    assert!(outcome.orphaned_constants.is_empty());
    assert_eq!(
        kinds(&graph),
        ["quantized::conv2d_relu", "aten::sigmoid", "aten::dequantize"]
    );
    for node in m.nodes() {
        assert!(!graph.contains_node(*node));
    }

    let fused = outcome.inserted[0];
    let fused_out = outcome.outputs[0];
    assert_eq!(
        graph.node(fused).unwrap().inputs(),
        &[
            parsed.value_names["x"],
            parsed.value_names["w"],
            parsed.value_names["scale"],
            parsed.value_names["zp"],
        ]
    );
    assert_eq!(graph.node(post).unwrap().inputs(), &[fused_out]);
    assert_eq!(graph.value_name(fused_out), Some("out"));
    assert_eq!(graph.node(sigmoid).unwrap().inputs(), &[parsed.value_names["x"]]);
    assert_eq!(graph.inputs().len(), 4);
    assert_eq!(graph.outputs().len(), 2);
    graph.validate().expect("valid topology");
}

#[test]
fn replacement_outputs_inherit_type_and_name() {
    let pattern = compile("graph(%a):\n  %r = aten::size(%a)\n  return (%r)").expect("pattern");
    let replacement =
        compile_replacement("graph(%a):\n  %r = prim::fast_size(%a)\n  return (%r)").expect("replacement");
    let parsed = parse_graph_with_symbols(
        "graph(%x):\n  %len : int = aten::size(%x)\n  %twice = aten::mul(%len, %len)\n  return (%twice)",
    )
    .expect("target");
    let mut graph = parsed.graph;
    let m = first_match(&graph, &pattern);

    let outcome = SubgraphRewriter::new(&mut graph).apply(&m, &pattern, &replacement);

    let new_len = outcome.outputs[0];
    assert_eq!(graph.value_type(new_len), Some(&ValueType::Int));
    assert_eq!(graph.value_name(new_len), Some("len"));
    let mul = graph.producer(parsed.value_names["twice"]).unwrap();
    assert_eq!(graph.node(mul).unwrap().inputs(), &[new_len, new_len]);
    assert!(graph.to_string().contains("%len : int = prim::fast_size(%x)"));
}

#[test]
fn multi_output_matches_rewire_every_output() {
    let pattern = compile(
        "graph(%a):\n  %r = aten::relu(%a)\n  %n = aten::neg(%r)\n  return (%r, %n)",
    )
    .expect("pattern");
    let replacement = compile_replacement(
        "graph(%a):\n  %r, %n = fused::relu_neg(%a)\n  return (%r, %n)",
    )
    .expect("replacement");
    let parsed = parse_graph_with_symbols(
        r#"
graph(%x):
  %r = aten::relu(%x)
  %n = aten::neg(%r)
  %u = aten::add(%r, %n)
  return (%u, %n)
"#,
    )
    .expect("target");
    let mut graph = parsed.graph;
    let m = first_match(&graph, &pattern);

    let outcome = SubgraphRewriter::new(&mut graph).apply(&m, &pattern, &replacement);

    assert_eq!(kinds(&graph), ["fused::relu_neg", "aten::add"]);
    let add = graph.producer(parsed.value_names["u"]).unwrap();
    assert_eq!(graph.node(add).unwrap().inputs(), outcome.outputs.as_slice());
    assert_eq!(graph.outputs()[1], outcome.outputs[1]);
    graph.validate().expect("valid topology");
}

#[test]
fn passthrough_replacement_forwards_an_input() {
    let pattern = compile(
        "graph(%a, %scale, %zp, %dtype):\n  %dq = aten::dequantize(%a)\n  %q = aten::quantize_per_tensor(%dq, %scale, %zp, %dtype)\n  return (%q)",
    )
    .expect("pattern");
    let replacement =
        compile_replacement("graph(%a, %scale, %zp, %dtype):\n  return (%a)").expect("replacement");
    let parsed = parse_graph_with_symbols(
        r#"
graph(%x, %scale : float, %zp : int, %dtype : int):
  %dq = aten::dequantize(%x)
  %q = aten::quantize_per_tensor(%dq, %scale, %zp, %dtype)
  %y = aten::relu(%q)
  return (%y)
"#,
    )
    .expect("target");
    let mut graph = parsed.graph;
    let m = first_match(&graph, &pattern);

    let outcome = SubgraphRewriter::new(&mut graph).apply(&m, &pattern, &replacement);

    assert!(outcome.inserted.is_empty());
    assert_eq!(outcome.outputs, vec![parsed.value_names["x"]]);
    assert_eq!(kinds(&graph), ["aten::relu"]);
    let relu = graph.walk()[0];
    assert_eq!(graph.node(relu).unwrap().inputs(), &[parsed.value_names["x"]]);
    assert_eq!(graph.value_name(parsed.value_names["x"]), Some("x"));
    graph.validate().expect("valid topology");
}

#[test]
fn orphaned_constants_are_reported_and_pruned() {
    let pattern = compile(
        "graph(%a, %b, %alpha):\n  %r = aten::add(%a, %b, %alpha)\n  return (%r)",
    )
    .expect("pattern");
    let replacement =
        compile_replacement("graph(%a, %b, %alpha):\n  %r = quantized::add(%a, %b)\n  return (%r)")
            .expect("replacement");
    let parsed = parse_graph_with_symbols(
        r#"
graph(%x, %y):
  %alpha = prim::Constant[value=1]()
  %r = aten::add(%x, %y, %alpha)
  return (%r)
"#,
    )
    .expect("target");
    let mut graph = parsed.graph;
    let constant = graph.producer(parsed.value_names["alpha"]).unwrap();
    let m = first_match(&graph, &pattern);

    let mut rewriter = SubgraphRewriter::new(&mut graph);
    let outcome = rewriter.apply(&m, &pattern, &replacement);
    assert_eq!(outcome.orphaned_constants, vec![constant]);
    assert_eq!(rewriter.prune_constants(&outcome.orphaned_constants), 1);
    assert_eq!(rewriter.prune_constants(&outcome.orphaned_constants), 0);
    assert!(rewriter.verify());
    assert_eq!(rewriter.graph().node_count(), 1);

    assert_eq!(kinds(&graph), ["quantized::add"]);
}

#[test]
fn shared_constants_are_not_orphaned() {
    let pattern = compile(
        "graph(%a, %b, %alpha):\n  %r = aten::add(%a, %b, %alpha)\n  return (%r)",
    )
    .expect("pattern");
    let replacement =
        compile_replacement("graph(%a, %b, %alpha):\n  %r = quantized::add(%a, %b)\n  return (%r)")
            .expect("replacement");
    let mut graph = parse_graph_with_symbols(
        r#"
graph(%x, %y):
  %alpha = prim::Constant[value=1]()
  %r = aten::add(%x, %y, %alpha)
  %s = aten::sub(%r, %y, %alpha)
  return (%s)
"#,
    )
    .expect("target")
    .graph;
    let m = first_match(&graph, &pattern);

    let outcome = SubgraphRewriter::new(&mut graph).apply(&m, &pattern, &replacement);
    assert!(outcome.orphaned_constants.is_empty());
    assert_eq!(kinds(&graph), ["prim::Constant", "quantized::add", "aten::sub"]);
}

#[test]
fn stale_match_panics_before_mutating() {
    let pattern = compile(CONV_RELU).expect("pattern");
    let replacement = compile_replacement(CONV_RELU_FUSED).expect("replacement");
    let mut graph = parse_graph_with_symbols(
        r#"
graph(%x, %w, %scale : float, %zp : int):
  %x_dq = aten::dequantize(%x)
  %c = aten::conv2d(%x_dq, %w)
  %c_relu = aten::relu(%c)
  %out = aten::quantize_per_tensor(%c_relu, %scale, %zp)
  return (%out)
"#,
    )
    .expect("target")
    .graph;
    let m = first_match(&graph, &pattern);
    SubgraphRewriter::new(&mut graph).apply(&m, &pattern, &replacement);
    let before = graph.to_string();

    let result = catch_unwind(AssertUnwindSafe(|| {
        SubgraphRewriter::new(&mut graph).apply(&m, &pattern, &replacement);
    }));

    assert!(result.is_err());
    assert_eq!(graph.to_string(), before);
}

#[test]
#[should_panic(expected = "pattern and replacement output counts differ")]
fn mismatched_replacement_arity_panics() {
    let pattern = compile(CONV_RELU).expect("pattern");
    let replacement = compile_replacement(
        "graph(%a, %w, %scale, %zp):\n  %q = quantized::conv2d_relu(%a, %w, %scale, %zp)\n  return (%q, %a)",
    )
    .expect("replacement");
    let mut graph = parse_graph_with_symbols(
        r#"
graph(%x, %w, %scale : float, %zp : int):
  %x_dq = aten::dequantize(%x)
  %c = aten::conv2d(%x_dq, %w)
  %c_relu = aten::relu(%c)
  %out = aten::quantize_per_tensor(%c_relu, %scale, %zp)
  return (%out)
"#,
    )
    .expect("target")
    .graph;
    let m = first_match(&graph, &pattern);
    SubgraphRewriter::new(&mut graph).apply(&m, &pattern, &replacement);
}
