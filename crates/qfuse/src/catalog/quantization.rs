//! Built-in fusions that turn `dequantize -> float op -> quantize` sequences
//! into calls of quantized kernels.

use once_cell::sync::Lazy;

use crate::driver::{fuse, FusionError, FusionStats};
use crate::filter::MatchFilter;
use crate::graph::Graph;

use super::{CompiledCatalog, FusionCatalog, FusionEntry};

static BUILTIN_QUANT: Lazy<CompiledCatalog> = Lazy::new(|| quant_fusion_catalog().compile());
static BUILTIN_DYNAMIC_QUANT: Lazy<CompiledCatalog> =
    Lazy::new(|| dynamic_quant_fusion_catalog().compile());

/// [`quant_fusion_catalog`] compiled once per process.
pub fn builtin_quant_catalog() -> &'static CompiledCatalog {
    &BUILTIN_QUANT
}

/// [`dynamic_quant_fusion_catalog`] compiled once per process.
pub fn builtin_dynamic_quant_catalog() -> &'static CompiledCatalog {
    &BUILTIN_DYNAMIC_QUANT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantType {
    Static,
    Dynamic,
}

impl QuantType {
    pub fn catalog(self) -> &'static CompiledCatalog {
        match self {
            QuantType::Static => builtin_quant_catalog(),
            QuantType::Dynamic => builtin_dynamic_quant_catalog(),
        }
    }
}

/// Fuses quantize/dequantize sequences in `graph` with the built-in catalog for `quant_type`.
pub fn quant_fusion(graph: &mut Graph, quant_type: QuantType) -> Result<FusionStats, FusionError> {
    fuse(graph, quant_type.catalog())
}

/// `%alpha` is the integer constant 1.
pub fn add_filter() -> MatchFilter {
    MatchFilter::constant_equals("alpha", 1i64)
}

/// `%alpha` is the integer constant 1 and `%b_scalar` is a number.
pub fn add_scalar_filter() -> MatchFilter {
    add_filter().and(MatchFilter::is_scalar("b_scalar"))
}

/// `%b_scalar` is a number.
pub fn mul_scalar_filter() -> MatchFilter {
    MatchFilter::is_scalar("b_scalar")
}

const CONV_HEADER: &str = "graph(%a_quant, %packed_params, %r_scale, %r_zero_point, %r_dtype, %stride, %padding, %dilation, %groups):";
const LINEAR_HEADER: &str = "graph(%packed_params, %a_quant, %r_scale, %r_zero_point, %r_dtype):";
const BINARY_HEADER: &str = "graph(%a_quant, %b_quant, %scale, %zero_point, %dtype):";
const BINARY_ALPHA_HEADER: &str = "graph(%a_quant, %b_quant, %alpha, %scale, %zero_point, %dtype):";
const ADD_SCALAR_HEADER: &str = "graph(%a_quant, %b_scalar, %alpha):";
const MUL_SCALAR_HEADER: &str = "graph(%a_quant, %b_scalar):";
const BATCH_NORM_HEADER: &str = "graph(%a_quant, %weight, %bias, %mean, %var, %training, %eaf, %eps, %7, %scale, %zero_point, %scalar_type):";

/// `conv{dim}d`, optionally followed by `activation` (`aten::relu` or `aten::relu_`).
fn conv(dim: u8, activation: Option<&str>) -> FusionEntry {
    let conv_line = format!(
        "aten::conv{dim}d(%a_dequant, %w_dequant, %b, %stride, %padding, %dilation, %groups)"
    );
    let (body, fused) = match activation {
        None => (format!("  %r = {conv_line}\n"), format!("quantized::conv{dim}d")),
        Some(act) => (
            format!("  %conv_out = {conv_line}\n  %r = {act}(%conv_out)\n"),
            format!("quantized::conv{dim}d_relu"),
        ),
    };
    let pattern = format!(
        "{CONV_HEADER}
  %a_dequant = aten::dequantize(%a_quant)
  %w_quant : Tensor, %b : Tensor? = quantized::conv{dim}d_unpack(%packed_params)
  %w_dequant = aten::dequantize(%w_quant)
{body}  %r_quant = aten::quantize_per_tensor(%r, %r_scale, %r_zero_point, %r_dtype)
  return (%r_quant)"
    );
    let replacement = format!(
        "{CONV_HEADER}
  %r_quant = {fused}(%a_quant, %packed_params, %r_scale, %r_zero_point)
  return (%r_quant)"
    );
    FusionEntry::new(fused, pattern, replacement)
}

fn linear() -> FusionEntry {
    let pattern = format!(
        "{LINEAR_HEADER}
  %a_dequant = aten::dequantize(%a_quant)
  %w_quant : Tensor, %b : Tensor? = quantized::linear_unpack(%packed_params)
  %w_dequant = aten::dequantize(%w_quant)
  %r = aten::linear(%a_dequant, %w_dequant, %b)
  %r_quant = aten::quantize_per_tensor(%r, %r_scale, %r_zero_point, %r_dtype)
  return (%r_quant)"
    );
    let replacement = format!(
        "{LINEAR_HEADER}
  %r = quantized::linear(%a_quant, %packed_params, %r_scale, %r_zero_point)
  return (%r)"
    );
    FusionEntry::new("quantized::linear", pattern, replacement)
}

/// Two dequantized tensors combined by `op`, then `relu`, then quantized.
///
/// `add` variants carry an `%alpha` constant inside the pattern.
fn binary_relu(op: &str, relu: &str, fused: &str) -> FusionEntry {
    let is_add = op.starts_with("aten::add");
    let (alpha_line, alpha_arg) = if is_add {
        ("  %alpha = prim::Constant[value=1]()\n", ", %alpha")
    } else {
        ("", "")
    };
    let pattern = format!(
        "{BINARY_HEADER}
{alpha_line}  %a_dequant = aten::dequantize(%a_quant)
  %b_dequant = aten::dequantize(%b_quant)
  %r_op = {op}(%a_dequant, %b_dequant{alpha_arg})
  %r_relu = {relu}(%r_op)
  %r = aten::quantize_per_tensor(%r_relu, %scale, %zero_point, %dtype)
  return (%r)"
    );
    let replacement = format!(
        "{BINARY_HEADER}
  %r = {fused}(%a_quant, %b_quant, %scale, %zero_point)
  return (%r)"
    );
    let entry = FusionEntry::new(fused, pattern, replacement);
    if is_add {
        entry.with_filter(add_filter())
    } else {
        entry
    }
}

/// Two dequantized tensors combined by `op`, then quantized.
fn binary(op: &str, fused: &str) -> FusionEntry {
    let is_add = op.starts_with("aten::add");
    let (header, alpha_arg) = if is_add {
        (BINARY_ALPHA_HEADER, ", %alpha")
    } else {
        (BINARY_HEADER, "")
    };
    let pattern = format!(
        "{header}
  %a_dequant = aten::dequantize(%a_quant)
  %b_dequant = aten::dequantize(%b_quant)
  %r_op = {op}(%a_dequant, %b_dequant{alpha_arg})
  %r = aten::quantize_per_tensor(%r_op, %scale, %zero_point, %dtype)
  return (%r)"
    );
    let replacement = format!(
        "{header}
  %r = {fused}(%a_quant, %b_quant, %scale, %zero_point)
  return (%r)"
    );
    let entry = FusionEntry::new(fused, pattern, replacement);
    if is_add {
        entry.with_filter(add_filter())
    } else {
        entry
    }
}

/// Dequantized tensor combined with a scalar by `op`, optionally followed by `relu`.
///
/// `out_variant` passes `%a_quant` once more as the output argument of the
/// `_out` kernels, which write into their input.
fn scalar(op: &str, relu: Option<&str>, fused: &str, out_variant: bool) -> FusionEntry {
    let is_add = op.starts_with("aten::add");
    let (header, alpha_arg) = if is_add {
        (ADD_SCALAR_HEADER, ", %alpha")
    } else {
        (MUL_SCALAR_HEADER, "")
    };
    let body = match relu {
        None => format!("  %r = {op}(%a_dequant, %b_scalar{alpha_arg})\n"),
        Some(relu) => format!(
            "  %r_op = {op}(%a_dequant, %b_scalar{alpha_arg})\n  %r = {relu}(%r_op)\n"
        ),
    };
    let out_arg = if out_variant { ", %a_quant" } else { "" };
    let pattern = format!(
        "{header}
  %a_dequant = aten::dequantize(%a_quant)
{body}  return (%r)"
    );
    let replacement = format!(
        "{header}
  %r = {fused}(%a_quant, %b_scalar{out_arg})
  return (%r)"
    );
    let filter = if is_add {
        add_scalar_filter()
    } else {
        mul_scalar_filter()
    };
    FusionEntry::new(fused, pattern, replacement).with_filter(filter)
}

fn batch_norm2d(relu: Option<&str>) -> FusionEntry {
    let bn_call = "aten::batch_norm(%a_dequant, %weight, %bias, %mean, %var, %training, %eaf, %eps, %7)";
    let (body, fused) = match relu {
        None => (
            format!("  %r_bn = {bn_call}\n  %r = aten::quantize_per_tensor(%r_bn, %scale, %zero_point, %scalar_type)\n"),
            "quantized::batch_norm2d",
        ),
        Some(relu) => (
            format!("  %bn_out = {bn_call}\n  %relu = {relu}(%bn_out)\n  %r = aten::quantize_per_tensor(%relu, %scale, %zero_point, %scalar_type)\n"),
            "quantized::batch_norm2d_relu",
        ),
    };
    let pattern = format!(
        "{BATCH_NORM_HEADER}
  %a_dequant = aten::dequantize(%a_quant)
{body}  return (%r)"
    );
    let replacement = format!(
        "{BATCH_NORM_HEADER}
  %r = {fused}(%a_quant, %weight, %bias, %mean, %var, %eps, %scale, %zero_point)
  return (%r)"
    );
    FusionEntry::new(fused, pattern, replacement)
}

fn cat() -> FusionEntry {
    let header = "graph(%input_quant, %dim, %r_scale, %r_zero_point, %r_dtype):";
    FusionEntry::new(
        "quantized::cat",
        format!(
            "{header}
  %input_dequant = aten::dequantize(%input_quant)
  %r = aten::cat(%input_dequant, %dim)
  %r_quant = aten::quantize_per_tensor(%r, %r_scale, %r_zero_point, %r_dtype)
  return (%r_quant)"
        ),
        format!(
            "{header}
  %r_quant = quantized::cat(%input_quant, %dim, %r_scale, %r_zero_point)
  return (%r_quant)"
        ),
    )
}

fn hardswish() -> FusionEntry {
    let header = "graph(%a_quant, %r_scale, %r_zero_point, %r_dtype):";
    FusionEntry::new(
        "quantized::hardswish",
        format!(
            "{header}
  %a_dequant = aten::dequantize(%a_quant)
  %r = aten::hardswish(%a_dequant)
  %r_quant = aten::quantize_per_tensor(%r, %r_scale, %r_zero_point, %r_dtype)
  return (%r_quant)"
        ),
        format!(
            "{header}
  %r_quant = quantized::hardswish(%a_quant, %r_scale, %r_zero_point)
  return (%r_quant)"
        ),
    )
}

fn layer_norm() -> FusionEntry {
    let header = "graph(%a_quant, %normalized_shape, %weight, %bias, %eps, %cudnn_enabled, %output_scale, %output_zero_point, %scalar_type):";
    FusionEntry::new(
        "quantized::layer_norm",
        format!(
            "{header}
  %a_dequant = aten::dequantize(%a_quant)
  %r_ln = aten::layer_norm(%a_dequant, %normalized_shape, %weight, %bias, %eps, %cudnn_enabled)
  %r = aten::quantize_per_tensor(%r_ln, %output_scale, %output_zero_point, %scalar_type)
  return (%r)"
        ),
        format!(
            "{header}
  %r = quantized::layer_norm(%a_quant, %normalized_shape, %weight, %bias, %eps, %output_scale, %output_zero_point)
  return (%r)"
        ),
    )
}

fn extra_arg_list(extra_args: &[&str]) -> String {
    extra_args.iter().map(|arg| format!(", {arg}")).collect()
}

/// The op runs directly on the quantized tensor, keeping the input's qparams.
fn input_qparam_op(op: &str, extra_args: &[&str]) -> FusionEntry {
    let extra = extra_arg_list(extra_args);
    let header = format!("graph(%a_quant{extra}):");
    let pattern = format!(
        "{header}
  %a_dequant = aten::dequantize(%a_quant)
  %r = {op}(%a_dequant{extra})
  %r_scale : float = aten::q_scale(%a_quant)
  %r_zero_point : int = aten::q_zero_point(%a_quant)
  %r_dtype : int = prim::dtype(%a_quant)
  %r_quant = aten::quantize_per_tensor(%r, %r_scale, %r_zero_point, %r_dtype)
  return (%r_quant)"
    );
    let replacement = format!(
        "{header}
  %r = {op}(%a_quant{extra})
  return (%r)"
    );
    FusionEntry::new(op, pattern, replacement)
}

/// The op runs directly on the quantized tensor; its output qparams are fixed.
///
/// Symmetric ops (tanh) use scale 1/128 and zero point 128, the others 1/256 and 0.
fn fixed_qparam_op(op: &str, symmetric: bool) -> FusionEntry {
    let (scale, zero_point) = if symmetric {
        ("0.0078125", "128")
    } else {
        ("0.00390625", "0")
    };
    let header = "graph(%a_quant):";
    let pattern = format!(
        "{header}
  %a_dequant = aten::dequantize(%a_quant)
  %r = {op}(%a_dequant)
  %r_scale : float = prim::Constant[value={scale}]()
  %r_zero_point : int = prim::Constant[value={zero_point}]()
  %r_dtype : int = prim::Constant[value=13]()
  %r_quant = aten::quantize_per_tensor(%r, %r_scale, %r_zero_point, %r_dtype)
  return (%r_quant)"
    );
    let replacement = format!(
        "{header}
  %r = {op}(%a_quant)
  return (%r)"
    );
    FusionEntry::new(op, pattern, replacement)
}

/// Static quantization fusions in priority order.
pub fn quant_fusion_catalog() -> FusionCatalog {
    let mut catalog = FusionCatalog::new();
    for dim in 1..=3 {
        catalog.push(conv(dim, None));
        catalog.push(conv(dim, Some("aten::relu")));
        catalog.push(conv(dim, Some("aten::relu_")));
    }
    catalog.push(linear());

    for (op, relu) in [
        ("aten::add", "aten::relu"),
        ("aten::add", "aten::relu_"),
        ("aten::add_", "aten::relu"),
        ("aten::add_", "aten::relu_"),
    ] {
        catalog.push(binary_relu(op, relu, "quantized::add_relu"));
    }

    // add_scalar_relu must precede add_scalar, which would otherwise leave the relu behind.
    catalog.push(scalar("aten::add", Some("aten::relu"), "quantized::add_scalar_relu", false));
    catalog.push(scalar("aten::add", Some("aten::relu_"), "quantized::add_scalar_relu", false));
    catalog.push(scalar("aten::add_", Some("aten::relu"), "quantized::add_scalar_relu_out", true));
    catalog.push(scalar("aten::add_", Some("aten::relu_"), "quantized::add_scalar_relu_out", true));
    catalog.push(scalar("aten::add", None, "quantized::add_scalar", false));
    catalog.push(scalar("aten::add_", None, "quantized::add_scalar_out", true));

    catalog.push(binary("aten::add", "quantized::add"));
    catalog.push(binary("aten::add_", "quantized::add"));
    catalog.push(cat());
    catalog.push(batch_norm2d(None));
    catalog.push(batch_norm2d(Some("aten::relu")));
    catalog.push(batch_norm2d(Some("aten::relu_")));

    catalog.push(scalar("aten::mul", Some("aten::relu"), "quantized::mul_scalar_relu", false));
    catalog.push(scalar("aten::mul", Some("aten::relu_"), "quantized::mul_scalar_relu", false));
    catalog.push(scalar("aten::mul_", Some("aten::relu"), "quantized::mul_scalar_relu_out", true));
    catalog.push(scalar("aten::mul_", Some("aten::relu_"), "quantized::mul_scalar_relu_out", true));
    catalog.push(scalar("aten::mul", None, "quantized::mul_scalar", false));
    let mut inplace_mul_scalar = scalar("aten::mul_", None, "quantized::mul_scalar_out", true);
    inplace_mul_scalar.name = "quantized::mul_scalar".to_string();
    catalog.push(inplace_mul_scalar);

    for (op, relu) in [
        ("aten::mul", "aten::relu"),
        ("aten::mul", "aten::relu_"),
        ("aten::mul_", "aten::relu"),
        ("aten::mul_", "aten::relu_"),
    ] {
        catalog.push(binary_relu(op, relu, "quantized::mul_relu"));
    }
    catalog.push(binary("aten::mul", "quantized::mul"));
    catalog.push(binary("aten::mul_", "quantized::mul"));
    catalog.push(hardswish());
    catalog.push(layer_norm());

    let pool_args = ["%kernel_size", "%stride", "%padding", "%ceil_mode", "%count_include_pad"];
    let pool_args_divisor = [
        "%kernel_size",
        "%stride",
        "%padding",
        "%ceil_mode",
        "%count_include_pad",
        "%divisor_override",
    ];
    catalog.push(input_qparam_op("aten::avg_pool1d", &pool_args));
    catalog.push(input_qparam_op("aten::avg_pool2d", &pool_args_divisor));
    catalog.push(input_qparam_op("aten::avg_pool3d", &pool_args_divisor));
    for dim in 1..=3 {
        let op = format!("aten::adaptive_avg_pool{dim}d");
        catalog.push(input_qparam_op(&op, &["%output_size"]));
    }
    catalog.push(input_qparam_op("aten::mean", &["%dim"]));
    catalog.push(input_qparam_op(
        "aten::upsample_nearest1d",
        &["%output_size", "%scales"],
    ));
    catalog.push(input_qparam_op(
        "aten::upsample_nearest2d",
        &["%output_size", "%scale_h", "%scale_w"],
    ));
    catalog.push(input_qparam_op(
        "aten::upsample_nearest3d",
        &["%output_size", "%scale_d", "%scale_h", "%scale_w"],
    ));
    catalog.push(input_qparam_op(
        "aten::upsample_linear1d",
        &["%output_size", "%align_corners", "%scales"],
    ));
    catalog.push(input_qparam_op(
        "aten::upsample_bilinear2d",
        &["%output_size", "%align_corners", "%scale_h", "%scale_w"],
    ));
    catalog.push(input_qparam_op(
        "aten::upsample_trilinear3d",
        &["%output_size", "%align_corners", "%scale_d", "%scale_h", "%scale_w"],
    ));
    for op in ["aten::clamp", "aten::clamp_", "aten::hardtanh", "aten::hardtanh_"] {
        catalog.push(input_qparam_op(op, &["%min", "%max"]));
    }
    for op in ["aten::elu", "aten::elu_"] {
        catalog.push(input_qparam_op(op, &["%alpha", "%scale", "%input_scale"]));
    }
    for op in ["aten::leaky_relu", "aten::leaky_relu_"] {
        catalog.push(input_qparam_op(op, &["%negative_slope"]));
    }

    for (op, symmetric) in [
        ("aten::hardsigmoid", false),
        ("aten::hardsigmoid_", false),
        ("aten::sigmoid", false),
        ("aten::sigmoid_", false),
        ("aten::tanh", true),
        ("aten::tanh_", true),
    ] {
        catalog.push(fixed_qparam_op(op, symmetric));
    }
    catalog
}

/// Dynamic quantization fusions: activations are quantized on the fly.
pub fn dynamic_quant_fusion_catalog() -> FusionCatalog {
    let header = "graph(%packed_params, %a, %reduce_range, %a_dtype):";
    FusionCatalog::new().with(FusionEntry::new(
        "quantized::linear_dynamic",
        format!(
            "{header}
  %a_scale : float, %a_zero_point : int = aten::_choose_qparams_per_tensor(%a, %reduce_range)
  %a_quant = aten::quantize_per_tensor(%a, %a_scale, %a_zero_point, %a_dtype)
  %a_dequant = aten::dequantize(%a_quant)
  %w_quant : Tensor, %b : Tensor? = quantized::linear_unpack(%packed_params)
  %w_dequant = aten::dequantize(%w_quant)
  %r = aten::linear(%a_dequant, %w_dequant, %b)
  return (%r)"
        ),
        format!(
            "{header}
  %r = quantized::linear_dynamic(%a, %packed_params)
  return (%r)"
        ),
    ))
}
