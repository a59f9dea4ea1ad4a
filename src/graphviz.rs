use std::fmt::Write;

use crate::graph::{Dim, GraphInfo, OperandKind};

pub fn graph_to_dot(graph: &GraphInfo) -> String {
    let mut dot = String::from("digraph dynplan {\n");
    dot.push_str("  rankdir=LR;\n");
    dot.push_str("  node [fontname=\"Helvetica\"];\n");
    dot.push_str("  edge [fontname=\"Helvetica\"];\n\n");

    for (idx, operand) in graph.operands.iter().enumerate() {
        let node_id = format!("operand_{}", idx);
        let shape = match operand.kind {
            OperandKind::Input => "oval",
            OperandKind::Constant => "diamond",
            OperandKind::Output => "doublecircle",
        };
        let fill = match operand.kind {
            OperandKind::Input => "#d0e6ff",
            OperandKind::Constant => "#f0f0f0",
            OperandKind::Output => "#d6f5d6",
        };
        let mut label_lines = vec![format!(
            "{} operand {}",
            match operand.kind {
                OperandKind::Input => "Input",
                OperandKind::Constant => "Constant",
                OperandKind::Output => "Output",
            },
            idx
        )];
        if let Some(name) = operand.name.as_deref().filter(|name| !name.is_empty()) {
            label_lines.push(format!("name: {}", name));
        }
        label_lines.push(operand.descriptor.data_type.name().to_string());
        label_lines.push(format_shape(&operand.descriptor.shape));
        if let Some(values) = graph
            .constant_operand_ids_to_handles
            .get(&(idx as u32))
            .and_then(|handle| handle.to_i64(operand.descriptor.data_type))
        {
            label_lines.push(format!("{:?}", values));
        }
        let label = escape_label(&label_lines.join("\n"));
        let _ = writeln!(
            dot,
            "  {} [shape={},style=filled,fillcolor=\"{}\",label=\"{}\"];",
            node_id, shape, fill, label
        );
    }

    dot.push('\n');

    for (idx, operation) in graph.operations.iter().enumerate() {
        let node_id = format!("op_{}", idx);
        let mut label_lines = vec![format!("{} (#{})", operation.display_name(), idx)];
        if let Some(label) = operation
            .label
            .as_ref()
            .filter(|label| !label.is_empty() && *label != &operation.op_type)
        {
            label_lines.push(label.clone());
        }
        if let Some(attributes) = operation.attributes.as_object().filter(|a| !a.is_empty()) {
            label_lines.push(serde_json::Value::Object(attributes.clone()).to_string());
        }
        let label = escape_label(&label_lines.join("\n"));
        let _ = writeln!(
            dot,
            "  {} [shape=box,style=rounded,label=\"{}\"];",
            node_id, label
        );

        for (input_idx, operand_id) in operation.input_operands.iter().enumerate() {
            let _ = writeln!(
                dot,
                "  operand_{} -> {} [label=\"in{}\"];",
                operand_id, node_id, input_idx
            );
        }
        let _ = writeln!(
            dot,
            "  {} -> operand_{} [label=\"out\"];",
            node_id, operation.output_operand
        );
    }

    dot.push_str("}\n");
    dot
}

fn escape_label(label: &str) -> String {
    label
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_shape(shape: &[Dim]) -> String {
    if shape.is_empty() {
        "scalar".to_string()
    } else {
        shape
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("x")
    }
}
