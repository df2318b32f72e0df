use qfuse::graph::{Literal, ValueType};
use qfuse::pattern::{compile, compile_replacement, PatternError};
use qfuse::text_ir::{parse_graph, parse_graph_with_symbols, ParseError};

#[test]
fn parses_torch_style_graph() {
    let parsed = parse_graph_with_symbols(
        r#"
graph(%a_quant, %packed_params, %r_scale : float, %r_zero_point : int, %sizes : int[]):
  # weights come from the packed params
  %a_dequant = aten::dequantize(%a_quant)
  %w_quant : Tensor, %b : Tensor? = quantized::conv2d_unpack(%packed_params)
  %w_dequant = aten::dequantize(%w_quant)
  %r = aten::conv2d(%a_dequant, %w_dequant, %b, %sizes)
  %r_quant = aten::quantize_per_tensor(%r, %r_scale, %r_zero_point)
  return (%r_quant)
"#,
    )
    .expect("parse");
    let graph = &parsed.graph;

    assert_eq!(graph.inputs().len(), 5);
    assert_eq!(graph.outputs(), &[parsed.value_names["r_quant"]]);
    assert_eq!(graph.node_count(), 5);
    assert_eq!(
        graph.value_type(parsed.value_names["b"]),
        Some(&ValueType::Optional(Box::new(ValueType::Tensor)))
    );
    assert_eq!(
        graph.value_type(parsed.value_names["sizes"]),
        Some(&ValueType::List(Box::new(ValueType::Int)))
    );
    assert_eq!(
        graph.value_type(parsed.value_names["r_scale"]),
        Some(&ValueType::Float)
    );
    assert_eq!(graph.value_name(parsed.value_names["w_quant"]), Some("w_quant"));

    let unpack = graph.walk()[1];
    assert_eq!(graph.kind(unpack), Some("quantized::conv2d_unpack"));
    assert_eq!(graph.node(unpack).unwrap().outputs().len(), 2);
}

#[test]
fn constants_take_their_type_from_the_literal() {
    let parsed = parse_graph_with_symbols(
        r#"
graph(%x):
  %one = prim::Constant[value=1]()
  %half = prim::Constant[value=0.5]()
  %flag = prim::Constant[value=true]()
  %mode = prim::Constant[value="nearest"]()
  %none = prim::Constant[value=None]()
  %dims = prim::Constant[value=[1, 2]]()
  %forced : float = prim::Constant[value=0]()
  return (%x)
"#,
    )
    .expect("parse");
    let ty = |name: &str| parsed.graph.value_type(parsed.value_names[name]).cloned();

    assert_eq!(ty("one"), Some(ValueType::Int));
    assert_eq!(ty("half"), Some(ValueType::Float));
    assert_eq!(ty("flag"), Some(ValueType::Bool));
    assert_eq!(ty("mode"), Some(ValueType::Str));
    assert_eq!(ty("none"), Some(ValueType::NoneType));
    assert_eq!(ty("dims"), Some(ValueType::List(Box::new(ValueType::Int))));
    assert_eq!(ty("forced"), Some(ValueType::Float));
    assert_eq!(
        parsed.graph.constant_value(parsed.value_names["mode"]),
        Some(&Literal::Str("nearest".to_string()))
    );
}

#[test]
fn zero_output_statements_are_nodes() {
    let graph = parse_graph("graph(%x):\n  prim::Print(%x)\n  return (%x)").expect("parse");
    let print = graph.walk()[0];
    assert_eq!(graph.kind(print), Some("prim::Print"));
    assert!(graph.node(print).unwrap().outputs().is_empty());
    assert_eq!(graph.uses(graph.inputs()[0]).len(), 2);
}

#[test]
fn return_without_parentheses_is_accepted() {
    let graph = parse_graph("graph(%x):\n  %y = aten::relu(%x)\n  return %y").expect("parse");
    assert_eq!(graph.outputs().len(), 1);
}

#[test]
fn empty_input_is_rejected() {
    assert_eq!(parse_graph("").unwrap_err(), ParseError::Empty);
    assert_eq!(parse_graph("  \n\n  # only a comment\n").unwrap_err(), ParseError::Empty);
}

#[test]
fn use_before_definition_reports_the_line() {
    let err = parse_graph("graph(%x):\n  %y = aten::relu(%z)\n  %z = aten::neg(%x)\n  return (%y)")
        .unwrap_err();
    assert_eq!(
        err,
        ParseError::UndefinedValue {
            line: 2,
            name: "z".to_string()
        }
    );
}

#[test]
fn undefined_return_is_rejected() {
    let err = parse_graph("graph(%x):\n  %y = aten::relu(%x)\n  return (%w)").unwrap_err();
    assert_eq!(
        err,
        ParseError::UndefinedReturn {
            line: 3,
            name: "w".to_string()
        }
    );
}

#[test]
fn redefinition_is_rejected() {
    let err = parse_graph("graph(%x):\n  %x = aten::relu(%x)\n  return (%x)").unwrap_err();
    assert_eq!(
        err,
        ParseError::Redefinition {
            line: 2,
            name: "x".to_string()
        }
    );

    let err = parse_graph("graph(%x, %x):\n  return (%x)").unwrap_err();
    assert!(matches!(err, ParseError::Redefinition { line: 1, .. }));
}

#[test]
fn missing_return_is_rejected() {
    let err = parse_graph("graph(%x):\n  %y = aten::relu(%x)").unwrap_err();
    assert_eq!(err, ParseError::MissingReturn);
}

#[test]
fn grammar_errors_carry_line_numbers() {
    let cases = [
        ("grph(%x):\n  return (%x)", 1),
        ("graph(%x)\n  return (%x)", 1),
        ("graph(%x):\n  %y = relu(%x)\n  return (%y)", 2),
        ("graph(%x):\n  %y = aten::relu %x\n  return (%y)", 2),
        ("graph(%x):\n  %y = aten::relu(%x) extra\n  return (%y)", 2),
        ("graph(%x):\n  %y = aten::relu(x)\n  return (%y)", 2),
        ("graph(%x : tensorish):\n  return (%x)", 1),
        ("graph(%x):\n  %c = prim::Constant[value=1, value=2]()\n  return (%x)", 2),
        ("graph(%x):\n  %c = prim::Constant[value=@]()\n  return (%x)", 2),
        ("graph(%x):\n  return (%x)\n  return (%x)", 3),
        ("graph(%x):\n  return (%x)\n  %y = aten::relu(%x)", 3),
        ("graph(%x):\n  block0():\n  -> (%x)\n  return (%x)", 2),
        ("graph(%x):\n  -> (%x)\n  return (%x)", 2),
    ];
    for (src, expected_line) in cases {
        match parse_graph(src) {
            Err(ParseError::Syntax { line, .. }) => {
                assert_eq!(line, expected_line, "wrong line for {src:?}")
            }
            other => panic!("expected a syntax error for {src:?}, got {other:?}"),
        }
    }
}

#[test]
fn blocks_must_be_closed_and_scoped() {
    let unterminated = "graph(%x, %c : bool):\n  %y = prim::If(%c)\n    block0():\n      -> (%x)\n    block1():\n  return (%y)";
    assert!(matches!(
        parse_graph(unterminated),
        Err(ParseError::Syntax { line: 6, .. })
    ));

    let leaked = r#"
graph(%x, %c : bool):
  %y = prim::If(%c)
    block0():
      %inner = aten::relu(%x)
      -> (%inner)
  %z = aten::neg(%inner)
  return (%z)
"#;
    assert!(matches!(
        parse_graph(leaked),
        Err(ParseError::UndefinedValue { line: 7, .. })
    ));
}

#[test]
fn block_parameters_are_scoped_to_their_block() {
    let parsed = parse_graph_with_symbols(
        r#"
graph(%x, %n : int):
  %y = prim::Loop(%n, %x)
    block0(%i : int, %acc):
      %next = aten::add(%acc, %i)
      -> (%next)
  return (%y)
"#,
    )
    .expect("parse");
    let graph = &parsed.graph;
    let loop_node = graph.walk()[0];
    let body = graph.node(loop_node).unwrap().blocks()[0];
    let params = graph.block(body).unwrap().params();

    assert_eq!(params.len(), 2);
    assert_eq!(graph.value_type(params[0]), Some(&ValueType::Int));
    assert_eq!(params[1], parsed.value_names["acc"]);
    graph.validate().expect("valid topology");
}

#[test]
fn pattern_parse_errors_are_wrapped() {
    let err = compile("graph(%a):\n  %r = aten::relu(%z)\n  return (%r)").unwrap_err();
    assert_eq!(
        err,
        PatternError::Parse(ParseError::UndefinedValue {
            line: 2,
            name: "z".to_string()
        })
    );
}

#[test]
fn unmatchable_patterns_are_rejected() {
    assert_eq!(
        compile("graph(%a):\n  return (%a)").unwrap_err(),
        PatternError::Empty
    );
    assert_eq!(
        compile("graph(%a):\n  %r = aten::relu(%a)\n  return (%a)").unwrap_err(),
        PatternError::OutputNotProduced {
            name: "a".to_string()
        }
    );
    assert_eq!(
        compile("graph(%a, %b):\n  %r = aten::relu(%a)\n  return (%r)").unwrap_err(),
        PatternError::UnusedInput {
            name: "b".to_string()
        }
    );
    assert_eq!(
        compile("graph(%a, %b):\n  %r = aten::relu(%a)\n  %s = aten::neg(%b)\n  return (%s)")
            .unwrap_err(),
        PatternError::Disconnected {
            kind: "aten::relu".to_string()
        }
    );
    assert_eq!(
        compile(
            "graph(%a, %c : bool):\n  %r = prim::If(%c)\n    block0():\n      -> (%a)\n  return (%r)"
        )
        .unwrap_err(),
        PatternError::NestedBlock
    );
}

#[test]
fn replacements_may_leave_inputs_unused() {
    let replacement = compile_replacement(
        "graph(%a, %scale, %zero_point, %dtype):\n  %r = quantized::relu(%a, %scale, %zero_point)\n  return (%r)",
    )
    .expect("replacement");
    assert_eq!(replacement.inputs().len(), 4);

    let passthrough = compile_replacement("graph(%a):\n  return (%a)").expect("identity");
    assert!(passthrough.nodes().is_empty());
}

#[test]
fn pattern_exposes_symbols_and_anchor() {
    let pattern = compile(
        r#"
graph(%a_quant, %scale, %zero_point, %dtype):
  %a_dequant = aten::dequantize(%a_quant)
  %r = aten::hardswish(%a_dequant)
  %r_quant = aten::quantize_per_tensor(%r, %scale, %zero_point, %dtype)
  return (%r_quant)
"#,
    )
    .expect("pattern");

    assert_eq!(pattern.anchor_kind(), Some("aten::quantize_per_tensor"));
    assert_eq!(pattern.anchor(), Some(pattern.nodes()[2]));
    assert_eq!(pattern.symbols().get("%a_quant"), Some(pattern.inputs()[0]));
    assert_eq!(pattern.symbols().get("r_quant"), Some(pattern.outputs()[0]));
    assert!(pattern.symbols().contains("a_dequant"));
    assert!(!pattern.symbols().contains("missing"));
    assert_eq!(pattern.symbols().len(), 7);
}

#[test]
fn compiled_pattern_round_trips_through_display() {
    let src = r#"
graph(%a_quant, %packed_params, %r_scale, %r_zero_point, %r_dtype, %alpha):
  %a_dequant = aten::dequantize(%a_quant)
  %w_quant : Tensor, %b : Tensor? = quantized::linear_unpack(%packed_params)
  %w_dequant = aten::dequantize(%w_quant)
  %one = prim::Constant[value=1]()
  %r = aten::linear(%a_dequant, %w_dequant, %b)
  %r_add = aten::add(%r, %r, %one)
  %r_mul = aten::mul(%r_add, %alpha)
  %r_quant = aten::quantize_per_tensor(%r_mul, %r_scale, %r_zero_point, %r_dtype)
  return (%r_quant)
"#;
    let first = compile(src).expect("pattern");
    let second = compile(&first.to_string()).expect("rendered pattern");

    let kinds = |pattern: &qfuse::PatternGraph| {
        pattern
            .nodes()
            .iter()
            .map(|node| pattern.graph().kind(*node).unwrap_or_default().to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(kinds(&first), kinds(&second));
    assert_eq!(first.inputs().len(), second.inputs().len());
    assert_eq!(first.outputs().len(), second.outputs().len());
    assert_eq!(first.anchor_kind(), second.anchor_kind());
    assert_eq!(first.symbols().len(), second.symbols().len());
}
