use std::collections::{HashMap, HashSet};
use std::fmt::{self, Write as _};

use super::{BlockId, Graph, ValueId, ValueType};

/// Printable names for every value, unique across the graph.
struct ValueNames {
    names: HashMap<ValueId, String>,
    taken: HashSet<String>,
}

impl ValueNames {
    fn assign(graph: &Graph) -> Self {
        let mut names = ValueNames {
            names: HashMap::new(),
            taken: HashSet::new(),
        };
        names.assign_block(graph, graph.root());
        names
    }

    fn assign_block(&mut self, graph: &Graph, block: BlockId) {
        let Some(entry) = graph.block(block) else {
            return;
        };
        for param in entry.params() {
            self.name(graph, *param);
        }
        for node in entry.nodes() {
            let Some(data) = graph.node(*node) else {
                continue;
            };
            for inner in data.blocks() {
                self.assign_block(graph, *inner);
            }
            for output in data.outputs() {
                self.name(graph, *output);
            }
        }
    }

    fn name(&mut self, graph: &Graph, value: ValueId) {
        let base = graph
            .value_name(value)
            .map(str::to_string)
            .unwrap_or_else(|| self.names.len().to_string());
        let mut candidate = base.clone();
        let mut suffix = 1;
        while self.taken.contains(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        self.taken.insert(candidate.clone());
        self.names.insert(value, candidate);
    }

    fn get(&self, value: ValueId) -> String {
        match self.names.get(&value) {
            Some(name) => format!("%{name}"),
            None => format!("%<{value}>"),
        }
    }

    fn list(&self, values: &[ValueId]) -> String {
        values
            .iter()
            .map(|value| self.get(*value))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn typed_list(&self, graph: &Graph, values: &[ValueId]) -> String {
        values
            .iter()
            .map(|value| match graph.value_type(*value) {
                Some(ValueType::Tensor) | None => self.get(*value),
                Some(ty) => format!("{} : {ty}", self.get(*value)),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = ValueNames::assign(self);
        writeln!(f, "graph({}):", names.typed_list(self, self.inputs()))?;
        let mut body = String::new();
        render_block(self, self.root(), 1, &names, &mut body)?;
        f.write_str(&body)?;
        writeln!(f, "  return ({})", names.list(self.outputs()))
    }
}

fn render_block(
    graph: &Graph,
    block: BlockId,
    depth: usize,
    names: &ValueNames,
    out: &mut String,
) -> fmt::Result {
    let indent = "  ".repeat(depth);
    for node in graph.nodes_in_block(block) {
        let Some(data) = graph.node(*node) else {
            continue;
        };
        out.push_str(&indent);
        if !data.outputs().is_empty() {
            write!(out, "{} = ", names.typed_list(graph, data.outputs()))?;
        }
        out.push_str(data.kind());
        if !data.attributes().is_empty() {
            let attrs = data
                .attributes()
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(", ");
            write!(out, "[{attrs}]")?;
        }
        writeln!(out, "({})", names.list(data.inputs()))?;

        for (index, inner) in data.blocks().iter().enumerate() {
            let Some(inner_block) = graph.block(*inner) else {
                continue;
            };
            writeln!(
                out,
                "{indent}  block{index}({}):",
                names.typed_list(graph, inner_block.params())
            )?;
            render_block(graph, *inner, depth + 2, names, out)?;
            writeln!(
                out,
                "{indent}    -> ({})",
                names.list(inner_block.outputs())
            )?;
        }
    }
    Ok(())
}
