//! file: cli/src/disassembler.rs
//! description: renders decoded bytecode as tables, one per function body.

use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, ContentArrangement, Table};
use yakvm_core::{Instruction, Op, Program, SymbolTable};

/// Renders the top-level code followed by every nested function, depth first.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();
    out.push_str(&section("<main>", &program.code, &program.symbols));
    for proto in program.functions() {
        let title = format!("fn {} ({} param(s){})", proto.name, proto.params.len(), if proto.variadic { ", variadic" } else { "" });
        out.push('\n');
        out.push_str(&section(&title, &proto.code, &program.symbols));
    }
    out
}

fn section(title: &str, code: &[Instruction], symbols: &SymbolTable) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["ip", "line", "instruction", "symbol"]);

    let mut last_line = 0;
    for (ip, inst) in code.iter().enumerate() {
        let line = inst.line();
        let shown = if line != last_line { line.to_string() } else { String::new() };
        last_line = line;
        table.add_row(vec![
            Cell::new(format!("{:04}", ip)),
            Cell::new(shown),
            Cell::new(inst.to_string()),
            Cell::new(symbol_note(&inst.op, symbols)),
        ]);
    }
    format!("{}\n{}\n", title, table)
}

fn symbol_note(op: &Op, symbols: &SymbolTable) -> String {
    match op {
        Op::Load(id) | Op::Store(id) | Op::Declare(id) => symbols.name_of(*id).unwrap_or("?").to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yakvm_core::{BinaryOp, CodeBuilder};

    #[test]
    fn listing_names_symbols_and_nested_functions() {
        let mut b = CodeBuilder::new();
        b.line(1);
        b.function("inc", &["n"], false, |f| {
            f.line(2);
            f.load("n");
            f.push(1i64);
            f.binary(BinaryOp::Add);
            f.emit(Op::Return);
        });
        b.define("inc");
        let text = disassemble(&b.finish());

        assert!(text.starts_with("<main>"));
        assert!(text.contains("fn inc (1 param(s))"));
        assert!(text.contains("DECLARE"));
        assert!(text.contains("BINARY +"));
        assert!(text.contains("inc"));
    }
}
