//! A textual IR format used for `--dump-mid-ir`, `--print-before`/
//! `--print-after`, and the round-trip testable property: dumping a module
//! and reparsing it must yield a structurally equivalent module (up to Op
//! identity renumbering).
//!
//! Grammar (informal):
//! ```text
//! module
//! global @name size=<u32> dims=<u32,...> [int_array=<i32,...> | float_array=<f32,...>]
//! func @name argc=<u32> [impure] [atmostonce] {
//! bb<id>:
//!   %<id> = <opcode> <operand,...> [attr=val, ...]
//!   <opcode> <operand,...> [attr=val, ...]      ; no-result op
//! }
//! ```

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::attr::{Attr, AttrKind, RangeValue};
use crate::error::{IrError, IrResult};
use crate::id::{BlockId, OpId};
use crate::module::Module;
use crate::op::ValueType;
use crate::opcode::Opcode;

// -- Dump --------------------------------------------------------------------

pub fn dump(module: &Module) -> String {
    let mut out = String::new();
    out.push_str("module\n");
    for g in module.globals() {
        dump_global(module, g, &mut out);
    }
    for f in module.functions() {
        dump_function(module, f, &mut out);
    }
    out
}

fn dump_global(module: &Module, op: OpId, out: &mut String) {
    let o = module.op(op).expect("global id from module.globals()");
    let name = o.attr(AttrKind::Name).and_then(Attr::as_name).unwrap_or("");
    let size = o.attr(AttrKind::Size).and_then(|a| if let Attr::Size(s) = a { Some(*s) } else { None }).unwrap_or(0);
    write!(out, "global @{name} size={size}").ok();
    if let Some(Attr::Dimension(dims)) = o.attr(AttrKind::Dimension) {
        let joined = dims.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        write!(out, " dims={joined}").ok();
    }
    if let Some(Attr::IntArray(vs)) = o.attr(AttrKind::IntArray) {
        let joined = vs.iter().map(i32::to_string).collect::<Vec<_>>().join(",");
        write!(out, " int_array={joined}").ok();
    }
    if let Some(Attr::FloatArray(vs)) = o.attr(AttrKind::FloatArray) {
        let joined = vs.iter().map(f32::to_string).collect::<Vec<_>>().join(",");
        write!(out, " float_array={joined}").ok();
    }
    out.push('\n');
}

fn dump_function(module: &Module, op: OpId, out: &mut String) {
    let o = module.op(op).expect("function id from module.functions()");
    let name = o.attr(AttrKind::Name).and_then(Attr::as_name).unwrap_or("");
    let argc = o.attr(AttrKind::Int).and_then(Attr::as_int).unwrap_or(0);
    write!(out, "func @{name} argc={argc}").ok();
    if matches!(o.attr(AttrKind::Impure), Some(Attr::Impure(true))) {
        out.push_str(" impure");
    }
    if matches!(o.attr(AttrKind::AtMostOnce), Some(Attr::AtMostOnce(true))) {
        out.push_str(" atmostonce");
    }
    out.push_str(" {\n");
    if let Some(region) = o.region {
        if let Ok(r) = module.region(region) {
            for &block in &r.blocks {
                dump_block(module, block, out);
            }
        }
    }
    out.push_str("}\n");
}

fn dump_block(module: &Module, block: BlockId, out: &mut String) {
    writeln!(out, "bb{}:", block.0).ok();
    let Ok(b) = module.block(block) else { return };
    for &op_id in &b.ops {
        dump_op(module, op_id, out);
    }
}

fn dump_op(module: &Module, op_id: OpId, out: &mut String) {
    let Ok(op) = module.op(op_id) else { return };
    out.push_str("  ");
    if op.has_result() {
        write!(out, "%{} = ", op_id.0).ok();
    }
    write!(out, "{}", opcode_name(op.opcode)).ok();
    if op.opcode == Opcode::Phi {
        let pairs: Vec<String> = op
            .operands
            .iter()
            .zip(op.phi_incoming.iter())
            .map(|(v, from)| format!("%{} from bb{}", v.0, from.0))
            .collect();
        if !pairs.is_empty() {
            write!(out, " {}", pairs.join(", ")).ok();
        }
    } else if !op.operands.is_empty() {
        let ops: Vec<String> = op.operands.iter().map(|o| format!("%{}", o.0)).collect();
        write!(out, " {}", ops.join(", ")).ok();
    }
    let attr_str = dump_attrs(op);
    if !attr_str.is_empty() {
        write!(out, " [{attr_str}]").ok();
    }
    out.push('\n');
}

fn dump_attrs(op: &crate::op::Op) -> String {
    let mut parts = Vec::new();
    for (kind, attr) in op.attrs.iter() {
        if matches!(kind, AttrKind::Target | AttrKind::Else | AttrKind::From) {
            continue; // carried structurally (operands/bb headers), not as text attrs
        }
        let rendered = match attr {
            Attr::Int(v) => format!("int={v}"),
            Attr::Float(v) => format!("float={v}"),
            Attr::Name(v) => format!("name={v}"),
            Attr::Size(v) => format!("size={v}"),
            Attr::Dimension(v) => format!("dims={}", v.iter().map(u32::to_string).collect::<Vec<_>>().join(",")),
            Attr::IntArray(v) => format!("int_array={}", v.iter().map(i32::to_string).collect::<Vec<_>>().join(",")),
            Attr::FloatArray(v) => format!("float_array={}", v.iter().map(f32::to_string).collect::<Vec<_>>().join(",")),
            Attr::Impure(v) => format!("impure={v}"),
            Attr::AtMostOnce(v) => format!("atmostonce={v}"),
            Attr::Caller(v) => format!("callers={}", v.iter().map(|o| o.0.to_string()).collect::<Vec<_>>().join(",")),
            Attr::Range(RangeValue::Unknown) => "range=unknown".to_string(),
            Attr::Range(RangeValue::Interval { lo, hi }) => format!("range={lo}:{hi}"),
            Attr::Alias(_) => "alias=computed".to_string(),
            Attr::Fp(v) => format!("fp={v}"),
            Attr::Simd(v) => format!("simd={v}"),
            Attr::Parallel(v) => format!("parallel={v}"),
            Attr::Target(_) | Attr::Else(_) | Attr::From(_) => String::new(),
        };
        if !rendered.is_empty() {
            parts.push(rendered);
        }
    }
    if let Some(t) = op.target_block() {
        parts.push(format!("target=bb{}", t.0));
    }
    if let Some(e) = op.else_block() {
        parts.push(format!("else=bb{}", e.0));
    }
    parts.join(", ")
}

fn opcode_name(op: Opcode) -> &'static str {
    use Opcode::*;
    match op {
        ConstInt => "const.int",
        ConstFloat => "const.float",
        AddI => "add.i",
        SubI => "sub.i",
        MulI => "mul.i",
        DivI => "div.i",
        ModI => "mod.i",
        NegI => "neg.i",
        AndI => "and.i",
        OrI => "or.i",
        XorI => "xor.i",
        NotI => "not.i",
        ShlI => "shl.i",
        LShrI => "lshr.i",
        AShrI => "ashr.i",
        EqI => "eq.i",
        NeI => "ne.i",
        LtI => "lt.i",
        LeI => "le.i",
        GtI => "gt.i",
        GeI => "ge.i",
        AddF => "add.f",
        SubF => "sub.f",
        MulF => "mul.f",
        DivF => "div.f",
        NegF => "neg.f",
        EqF => "eq.f",
        NeF => "ne.f",
        LtF => "lt.f",
        LeF => "le.f",
        GtF => "gt.f",
        GeF => "ge.f",
        IntToFloat => "itof",
        FloatToInt => "ftoi",
        AddL => "add.l",
        MulL => "mul.l",
        RShiftL => "rshift.l",
        Alloca => "alloca",
        Load => "load",
        Store => "store",
        GetGlobal => "get_global",
        Goto => "goto",
        Branch => "branch",
        Return => "return",
        Phi => "phi",
        Select => "select",
        Call => "call",
        GetArg => "get_arg",
        Function => "function",
        Global => "global",
        If => "if",
        While => "while",
        For => "for",
        Break => "break",
        Continue => "continue",
        Proceed => "proceed",
        Clone => "clone",
        Join => "join",
        Wake => "wake",
        BackendOpaque => "backend_opaque",
    }
}

fn opcode_from_name(name: &str) -> Option<Opcode> {
    use Opcode::*;
    Some(match name {
        "const.int" => ConstInt,
        "const.float" => ConstFloat,
        "add.i" => AddI,
        "sub.i" => SubI,
        "mul.i" => MulI,
        "div.i" => DivI,
        "mod.i" => ModI,
        "neg.i" => NegI,
        "and.i" => AndI,
        "or.i" => OrI,
        "xor.i" => XorI,
        "not.i" => NotI,
        "shl.i" => ShlI,
        "lshr.i" => LShrI,
        "ashr.i" => AShrI,
        "eq.i" => EqI,
        "ne.i" => NeI,
        "lt.i" => LtI,
        "le.i" => LeI,
        "gt.i" => GtI,
        "ge.i" => GeI,
        "add.f" => AddF,
        "sub.f" => SubF,
        "mul.f" => MulF,
        "div.f" => DivF,
        "neg.f" => NegF,
        "eq.f" => EqF,
        "ne.f" => NeF,
        "lt.f" => LtF,
        "le.f" => LeF,
        "gt.f" => GtF,
        "ge.f" => GeF,
        "itof" => IntToFloat,
        "ftoi" => FloatToInt,
        "add.l" => AddL,
        "mul.l" => MulL,
        "rshift.l" => RShiftL,
        "alloca" => Alloca,
        "load" => Load,
        "store" => Store,
        "get_global" => GetGlobal,
        "goto" => Goto,
        "branch" => Branch,
        "return" => Return,
        "phi" => Phi,
        "select" => Select,
        "call" => Call,
        "get_arg" => GetArg,
        "function" => Function,
        "global" => Global,
        "if" => If,
        "while" => While,
        "for" => For,
        "break" => Break,
        "continue" => Continue,
        "proceed" => Proceed,
        "clone" => Clone,
        "join" => Join,
        "wake" => Wake,
        "backend_opaque" => BackendOpaque,
        _ => return None,
    })
}

fn result_type_for(opcode: Opcode) -> ValueType {
    use Opcode::*;
    match opcode {
        ConstFloat | AddF | SubF | MulF | DivF | NegF | IntToFloat => ValueType::F32,
        AddL | MulL | RShiftL => ValueType::I64,
        Store | Goto | Branch | Return | Function | Global | If | While | For | Break | Continue | Proceed => ValueType::Void,
        Call | GetArg | Phi | Select => ValueType::I32, // refined by parser when a type hint is present
        _ => ValueType::I32,
    }
}

// -- Parse ---------------------------------------------------------------

/// Parse the textual format produced by [`dump`] back into a `Module`.
/// Operand references (`%N`) are resolved by a first pass that assigns a
/// fresh arena `OpId` to every `%N` token in declaration order, so this is
/// not required to reproduce the original numeric ids.
pub fn parse(text: &str) -> IrResult<Module> {
    let mut module = Module::new();
    let mut lines = text.lines().enumerate().peekable();
    while let Some((lineno, raw)) = lines.peek().copied() {
        let line = raw.trim();
        if line.is_empty() || line == "module" {
            lines.next();
            continue;
        }
        if let Some(rest) = line.strip_prefix("global ") {
            parse_global(&mut module, rest, lineno)?;
            lines.next();
            continue;
        }
        if line.starts_with("func ") {
            parse_function(&mut module, &mut lines)?;
            continue;
        }
        return Err(IrError::Parse { line: lineno + 1, message: format!("unexpected top-level line: {line}") });
    }
    Ok(module)
}

fn parse_global(module: &mut Module, rest: &str, lineno: usize) -> IrResult<()> {
    let mut tokens = rest.split_whitespace();
    let name_tok = tokens.next().ok_or_else(|| parse_err(lineno, "expected global name"))?;
    let name = name_tok.strip_prefix('@').unwrap_or(name_tok).to_string();
    let id = module.alloc_op(Opcode::Global, ValueType::Void);
    module.op_mut(id)?.attrs.set(Attr::Name(name));
    for tok in tokens {
        apply_kv(module.op_mut(id)?, tok, lineno)?;
    }
    let top = module.top_block;
    module.op_mut(id)?.parent = Some(top);
    module.block_mut(top)?.append(id);
    Ok(())
}

fn parse_function<'a>(module: &mut Module, lines: &mut std::iter::Peekable<impl Iterator<Item = (usize, &'a str)>>) -> IrResult<()> {
    let (lineno, raw) = lines.next().expect("caller peeked a func line");
    let line = raw.trim();
    let header = line.strip_suffix('{').unwrap_or(line).trim();
    let header = header.strip_prefix("func ").ok_or_else(|| parse_err(lineno, "expected 'func'"))?;
    let mut tokens = header.split_whitespace();
    let name_tok = tokens.next().ok_or_else(|| parse_err(lineno, "expected function name"))?;
    let name = name_tok.strip_prefix('@').unwrap_or(name_tok).to_string();

    let func_id = module.alloc_op(Opcode::Function, ValueType::Void);
    module.op_mut(func_id)?.attrs.set(Attr::Name(name));
    let region = module.alloc_region();
    module.op_mut(func_id)?.region = Some(region);
    let top = module.top_block;
    module.op_mut(func_id)?.parent = Some(top);
    module.block_mut(top)?.append(func_id);

    for tok in tokens {
        match tok {
            "impure" => module.op_mut(func_id)?.attrs.set(Attr::Impure(true)),
            "atmostonce" => module.op_mut(func_id)?.attrs.set(Attr::AtMostOnce(true)),
            other => apply_kv(module.op_mut(func_id)?, other, lineno)?,
        }
    }

    // id_map resolves textual `%N` tokens (as they appeared in the dump) to
    // this parse's freshly allocated OpIds.
    let mut id_map: HashMap<u32, OpId> = HashMap::new();
    let mut block_map: HashMap<u32, BlockId> = HashMap::new();
    let mut pending_phis: Vec<(OpId, Vec<(u32, u32)>)> = Vec::new();

    let mut current_block: Option<BlockId> = None;
    while let Some(&(lineno, raw)) = lines.peek() {
        let line = raw.trim();
        if line == "}" {
            lines.next();
            break;
        }
        if let Some(rest) = line.strip_suffix(':') {
            if let Some(num) = rest.strip_prefix("bb") {
                let n: u32 = num.parse().map_err(|_| parse_err(lineno, "bad block label"))?;
                let block_id = *block_map.entry(n).or_insert_with(|| module.alloc_block());
                module.region_mut_pub(region)?.append(block_id);
                current_block = Some(block_id);
                lines.next();
                continue;
            }
        }
        let block_id = current_block.ok_or_else(|| parse_err(lineno, "op outside any block"))?;
        parse_op_line(module, block_id, line, lineno, &mut id_map, &mut block_map, &mut pending_phis)?;
        lines.next();
    }

    for (phi, incoming) in pending_phis {
        for (value_tok, from_tok) in incoming {
            let value = *id_map.get(&value_tok).ok_or_else(|| parse_err(0, "phi operand refers to unknown value"))?;
            let from = *block_map.entry(from_tok).or_insert_with(|| module.alloc_block());
            module.push_operand(phi, value)?;
            module.op_mut(phi)?.phi_incoming.push(from);
        }
    }
    Ok(())
}

fn parse_op_line(
    module: &mut Module,
    block: BlockId,
    line: &str,
    lineno: usize,
    id_map: &mut HashMap<u32, OpId>,
    block_map: &mut HashMap<u32, BlockId>,
    pending_phis: &mut Vec<(OpId, Vec<(u32, u32)>)>,
) -> IrResult<()> {
    let (result_slot, rest) = if let Some(eq_pos) = line.find(" = ") {
        let (lhs, rhs) = line.split_at(eq_pos);
        let rhs = &rhs[3..];
        let n: u32 = lhs.trim().strip_prefix('%').ok_or_else(|| parse_err(lineno, "expected %N"))?.parse().map_err(|_| parse_err(lineno, "bad result id"))?;
        (Some(n), rhs)
    } else {
        (None, line)
    };

    // split off a trailing `[attrs]` section
    let (body, attr_section) = match rest.find('[') {
        Some(idx) if rest.trim_end().ends_with(']') => (rest[..idx].trim(), Some(&rest[idx + 1..rest.rfind(']').unwrap()])),
        _ => (rest.trim(), None),
    };

    let mut parts = body.splitn(2, ' ');
    let opname = parts.next().unwrap_or("");
    let opcode = opcode_from_name(opname).ok_or_else(|| parse_err(lineno, &format!("unknown opcode '{opname}'")))?;
    let operand_str = parts.next().unwrap_or("").trim();

    let op_id = module.alloc_op(opcode, result_type_for(opcode));
    module.op_mut(op_id)?.parent = Some(block);
    module.block_mut(block)?.append(op_id);
    if let Some(n) = result_slot {
        id_map.insert(n, op_id);
    }

    if opcode == Opcode::Phi {
        let mut incoming = Vec::new();
        if !operand_str.is_empty() {
            for pair in operand_str.split(',') {
                let pair = pair.trim();
                let mut it = pair.split_whitespace();
                let val_tok = it.next().unwrap_or("");
                let val: u32 = val_tok.strip_prefix('%').unwrap_or(val_tok).parse().map_err(|_| parse_err(lineno, "bad phi operand"))?;
                // "from bbN"
                let from_tok = it.last().unwrap_or("");
                let from: u32 = from_tok.strip_prefix("bb").unwrap_or(from_tok).parse().map_err(|_| parse_err(lineno, "bad phi predecessor"))?;
                incoming.push((val, from));
            }
        }
        pending_phis.push((op_id, incoming));
    } else if !operand_str.is_empty() {
        for tok in operand_str.split(',') {
            let tok = tok.trim();
            let n: u32 = tok.strip_prefix('%').ok_or_else(|| parse_err(lineno, "expected %N operand"))?.parse().map_err(|_| parse_err(lineno, "bad operand id"))?;
            let resolved = *id_map.get(&n).ok_or_else(|| parse_err(lineno, "operand refers to a not-yet-defined value"))?;
            module.push_operand(op_id, resolved)?;
        }
    }

    if let Some(attrs) = attr_section {
        for tok in attrs.split(',') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            if let Some(rest) = tok.strip_prefix("target=bb") {
                let n: u32 = rest.parse().map_err(|_| parse_err(lineno, "bad target block"))?;
                let b = *block_map.entry(n).or_insert_with(|| module.alloc_block());
                module.op_mut(op_id)?.attrs.set(Attr::Target(b));
                continue;
            }
            if let Some(rest) = tok.strip_prefix("else=bb") {
                let n: u32 = rest.parse().map_err(|_| parse_err(lineno, "bad else block"))?;
                let b = *block_map.entry(n).or_insert_with(|| module.alloc_block());
                module.op_mut(op_id)?.attrs.set(Attr::Else(b));
                continue;
            }
            apply_kv(module.op_mut(op_id)?, tok, lineno)?;
        }
    }
    Ok(())
}

fn apply_kv(op: &mut crate::op::Op, tok: &str, lineno: usize) -> IrResult<()> {
    let Some((key, value)) = tok.split_once('=') else {
        return Err(parse_err(lineno, &format!("malformed attribute '{tok}'")));
    };
    let attr = match key {
        "int" => Attr::Int(value.parse().map_err(|_| parse_err(lineno, "bad int"))?),
        "float" => Attr::Float(value.parse().map_err(|_| parse_err(lineno, "bad float"))?),
        "name" => Attr::Name(value.to_string()),
        "size" => Attr::Size(value.parse().map_err(|_| parse_err(lineno, "bad size"))?),
        "dims" => Attr::Dimension(parse_list(value, lineno)?),
        "int_array" => Attr::IntArray(parse_list(value, lineno)?),
        "float_array" => Attr::FloatArray(parse_list(value, lineno)?),
        "impure" => Attr::Impure(value == "true"),
        "atmostonce" => Attr::AtMostOnce(value == "true"),
        "fp" => Attr::Fp(value == "true"),
        "simd" => Attr::Simd(value.parse().map_err(|_| parse_err(lineno, "bad simd"))?),
        "parallel" => Attr::Parallel(value == "true"),
        "range" => Attr::Range(if value == "unknown" {
            RangeValue::Unknown
        } else {
            let (lo, hi) = value.split_once(':').ok_or_else(|| parse_err(lineno, "bad range"))?;
            RangeValue::Interval {
                lo: lo.parse().map_err(|_| parse_err(lineno, "bad range lo"))?,
                hi: hi.parse().map_err(|_| parse_err(lineno, "bad range hi"))?,
            }
        }),
        _ => return Ok(()), // unrecognized attr keys (e.g. computed alias/caller dumps) are skipped on parse
    };
    op.attrs.set(attr);
    Ok(())
}

fn parse_list<T: std::str::FromStr>(value: &str, lineno: usize) -> IrResult<Vec<T>> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    value.split(',').map(|s| s.parse::<T>().map_err(|_| parse_err(lineno, "bad list element"))).collect()
}

fn parse_err(lineno: usize, message: &str) -> IrError {
    IrError::Parse { line: lineno + 1, message: message.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;

    #[test]
    fn roundtrip_constant_fold_shaped_module() {
        let mut m = Module::new();
        let func = m.alloc_op(Opcode::Function, ValueType::Void);
        m.op_mut(func).unwrap().attrs.set(Attr::Name("main".to_string()));
        let region = m.alloc_region();
        m.op_mut(func).unwrap().region = Some(region);
        let top = m.top_block;
        m.op_mut(func).unwrap().parent = Some(top);
        m.block_mut(top).unwrap().append(func);

        let entry = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(entry);
        let mut b = Builder::at_block_end(&mut m, entry);
        let c2 = b.const_int(2).unwrap();
        let c3 = b.const_int(3).unwrap();
        let c4 = b.const_int(4).unwrap();
        let mul = b.create(Opcode::MulI, ValueType::I32, [c3, c4], []).unwrap();
        let add = b.create(Opcode::AddI, ValueType::I32, [c2, mul], []).unwrap();
        b.ret(Some(add)).unwrap();

        let text = dump(&m);
        let reparsed = parse(&text).unwrap();
        assert_eq!(reparsed.functions().len(), 1);
        let f = reparsed.functions()[0];
        assert_eq!(reparsed.function_name(f).as_deref(), Some("main"));
        let region2 = reparsed.op(f).unwrap().region.unwrap();
        let blocks = &reparsed.region(region2).unwrap().blocks;
        assert_eq!(blocks.len(), 1);
        let ops = &reparsed.block(blocks[0]).unwrap().ops;
        // 5 ops: three consts, mul, add, return
        assert_eq!(ops.len(), 6);
    }

    #[test]
    fn roundtrip_preserves_branch_targets() {
        let mut m = Module::new();
        let func = m.alloc_op(Opcode::Function, ValueType::Void);
        m.op_mut(func).unwrap().attrs.set(Attr::Name("f".to_string()));
        let region = m.alloc_region();
        m.op_mut(func).unwrap().region = Some(region);
        let top = m.top_block;
        m.op_mut(func).unwrap().parent = Some(top);
        m.block_mut(top).unwrap().append(func);

        let entry = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(entry);
        let then_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(then_b);
        let else_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(else_b);

        let mut b = Builder::at_block_end(&mut m, entry);
        let c = b.const_int(1).unwrap();
        b.branch(c, then_b, else_b).unwrap();
        let mut b = Builder::at_block_end(&mut m, then_b);
        b.ret(None).unwrap();
        let mut b = Builder::at_block_end(&mut m, else_b);
        b.ret(None).unwrap();

        let text = dump(&m);
        let reparsed = parse(&text).unwrap();
        let f = reparsed.functions()[0];
        let region2 = reparsed.op(f).unwrap().region.unwrap();
        let blocks = reparsed.region(region2).unwrap().blocks.clone();
        assert_eq!(blocks.len(), 3);
        let entry_ops = &reparsed.block(blocks[0]).unwrap().ops;
        let branch_op = reparsed.op(*entry_ops.last().unwrap()).unwrap();
        assert_eq!(branch_op.opcode, Opcode::Branch);
        assert!(branch_op.target_block().is_some());
        assert!(branch_op.else_block().is_some());
    }
}
